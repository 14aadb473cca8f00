//! Configuration management for rootimg.
//!
//! Reads configuration from environment variables. `main` loads `.env`
//! with dotenvy first, so the environment takes precedence over the file.
//! CLI arguments override both.

use anyhow::{bail, Context, Result};
use std::collections::HashMap;
use std::path::PathBuf;

use crate::image::{FsKind, DEFAULT_MOUNT_PREFIX, DEFAULT_SIZE_MIB, MIB};

/// rootimg configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Image size in MiB (default: 512)
    pub size_mib: u64,
    /// Filesystem written onto the image (default: ext4)
    pub fs_kind: FsKind,
    /// Optional volume label
    pub label: Option<String>,
    /// Parent directory for temporary mount points (default: system temp dir)
    pub mount_base: PathBuf,
    /// Mount point name prefix (default: rootfs_mount_)
    pub mount_prefix: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            size_mib: DEFAULT_SIZE_MIB,
            fs_kind: FsKind::default(),
            label: None,
            mount_base: std::env::temp_dir(),
            mount_prefix: DEFAULT_MOUNT_PREFIX.to_string(),
        }
    }
}

impl Config {
    /// Load configuration from the process environment.
    pub fn load() -> Result<Self> {
        Self::from_vars(std::env::vars())
    }

    /// Build configuration from `KEY=value` pairs. Unset or empty keys keep
    /// their defaults.
    pub fn from_vars<I>(vars: I) -> Result<Self>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let vars: HashMap<String, String> = vars
            .into_iter()
            .filter(|(k, v)| k.starts_with("ROOTIMG_") && !v.trim().is_empty())
            .collect();
        let mut config = Self::default();

        if let Some(size) = vars.get("ROOTIMG_SIZE_MB") {
            config.size_mib = parse_size_mib(size).context("Invalid ROOTIMG_SIZE_MB")?;
        }
        if let Some(fs) = vars.get("ROOTIMG_FS_TYPE") {
            config.fs_kind = fs
                .parse::<FsKind>()
                .map_err(anyhow::Error::msg)
                .context("Invalid ROOTIMG_FS_TYPE")?;
        }
        if let Some(label) = vars.get("ROOTIMG_LABEL") {
            config.label = Some(label.trim().to_string());
        }
        if let Some(base) = vars.get("ROOTIMG_MOUNT_BASE") {
            config.mount_base = PathBuf::from(base.trim());
        }
        if let Some(prefix) = vars.get("ROOTIMG_MOUNT_PREFIX") {
            config.mount_prefix = prefix.trim().to_string();
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject combinations the pipeline cannot build.
    pub fn validate(&self) -> Result<()> {
        if self.size_mib == 0 {
            bail!("Image size must be at least 1 MiB");
        }
        if self.size_mib.checked_mul(MIB).is_none() {
            bail!("Image size {} MiB is too large", self.size_mib);
        }
        if let Some(label) = &self.label {
            if let Err(e) = self.fs_kind.validate_label(label) {
                bail!("Invalid label: {}", e);
            }
        }
        if self.mount_prefix.contains('/') {
            bail!("Mount prefix '{}' must not contain '/'", self.mount_prefix);
        }
        Ok(())
    }

    /// Image size in bytes.
    pub fn size_bytes(&self) -> u64 {
        self.size_mib * MIB
    }

    /// Print configuration for debugging.
    pub fn print(&self) {
        println!("Configuration:");
        println!("  ROOTIMG_SIZE_MB: {}", self.size_mib);
        println!("  ROOTIMG_FS_TYPE: {}", self.fs_kind);
        println!(
            "  ROOTIMG_LABEL: {}",
            self.label.as_deref().unwrap_or("(none)")
        );
        println!("  ROOTIMG_MOUNT_BASE: {}", self.mount_base.display());
        println!("  ROOTIMG_MOUNT_PREFIX: {}", self.mount_prefix);
    }
}

fn parse_size_mib(value: &str) -> Result<u64> {
    let value = value.trim();
    let digits = value
        .strip_suffix(|c: char| c == 'M' || c == 'm')
        .unwrap_or(value);
    digits
        .parse::<u64>()
        .with_context(|| format!("'{}' is not a size in MiB", value))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_vars(vars(&[("PATH", "/usr/bin")])).unwrap();
        assert_eq!(config.size_mib, 512);
        assert_eq!(config.fs_kind, FsKind::Ext4);
        assert_eq!(config.label, None);
        assert_eq!(config.mount_prefix, "rootfs_mount_");
        assert_eq!(config.size_bytes(), 512 * 1024 * 1024);
    }

    #[test]
    fn test_overrides() {
        let config = Config::from_vars(vars(&[
            ("ROOTIMG_SIZE_MB", "64"),
            ("ROOTIMG_FS_TYPE", "vfat"),
            ("ROOTIMG_LABEL", "BOOT"),
            ("ROOTIMG_MOUNT_BASE", "/var/tmp"),
            ("ROOTIMG_MOUNT_PREFIX", "bootfs_mount_"),
        ]))
        .unwrap();
        assert_eq!(config.size_mib, 64);
        assert_eq!(config.fs_kind, FsKind::Vfat);
        assert_eq!(config.label.as_deref(), Some("BOOT"));
        assert_eq!(config.mount_base, PathBuf::from("/var/tmp"));
        assert_eq!(config.mount_prefix, "bootfs_mount_");
    }

    #[test]
    fn test_size_accepts_m_suffix() {
        let config = Config::from_vars(vars(&[("ROOTIMG_SIZE_MB", "256M")])).unwrap();
        assert_eq!(config.size_mib, 256);
    }

    #[test]
    fn test_empty_value_keeps_default() {
        let config = Config::from_vars(vars(&[("ROOTIMG_SIZE_MB", "  ")])).unwrap();
        assert_eq!(config.size_mib, 512);
    }

    #[test]
    fn test_rejects_invalid_values() {
        assert!(Config::from_vars(vars(&[("ROOTIMG_SIZE_MB", "0")])).is_err());
        assert!(Config::from_vars(vars(&[("ROOTIMG_SIZE_MB", "big")])).is_err());
        assert!(Config::from_vars(vars(&[("ROOTIMG_FS_TYPE", "btrfs")])).is_err());
        assert!(Config::from_vars(vars(&[
            ("ROOTIMG_FS_TYPE", "vfat"),
            ("ROOTIMG_LABEL", "WAY_TOO_LONG_LABEL"),
        ]))
        .is_err());
        assert!(Config::from_vars(vars(&[("ROOTIMG_MOUNT_PREFIX", "a/b")])).is_err());
    }
}
