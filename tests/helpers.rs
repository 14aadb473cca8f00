//! Shared test utilities for rootimg tests.
#![allow(dead_code)]

use anyhow::{bail, Context, Result};
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{Read, Write};
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use tempfile::TempDir;

use rootimg::image::{ImageSpec, MIB};
use rootimg::{CancelFlag, FsKind, Host};

/// Test environment with a source tree, an output location and a mount
/// base, all under one temporary directory.
pub struct TestEnv {
    /// Temporary directory (kept alive for lifetime of TestEnv)
    pub _temp_dir: TempDir,
    /// Source tree to mirror
    pub source: PathBuf,
    /// Directory images are written to
    pub out_dir: PathBuf,
    /// Parent of temporary mount points
    pub mount_base: PathBuf,
    /// Where the fake host keeps filesystem contents
    pub store: PathBuf,
}

impl TestEnv {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let base = temp_dir.path();

        let source = base.join("rootfs");
        let out_dir = base.join("out");
        let mount_base = base.join("mnt");
        let store = base.join("store");

        for dir in [&source, &mount_base, &store] {
            fs::create_dir_all(dir).expect("Failed to create test dir");
        }
        fs::set_permissions(&source, fs::Permissions::from_mode(0o755))
            .expect("Failed to set source mode");

        Self {
            _temp_dir: temp_dir,
            source,
            out_dir,
            mount_base,
            store,
        }
    }

    /// Image spec writing `name` into `out_dir`, 4 MiB.
    pub fn spec(&self, name: &str) -> ImageSpec {
        ImageSpec {
            size_bytes: 4 * MIB,
            mount_base: self.mount_base.clone(),
            mount_prefix: "rootfs_mount_".to_string(),
            ..ImageSpec::new(&self.source, self.out_dir.join(name))
        }
    }

    pub fn host(&self) -> FakeHost {
        FakeHost::new(&self.store)
    }

    /// Entries left behind under the mount base.
    pub fn leftover_mount_dirs(&self) -> Vec<PathBuf> {
        fs::read_dir(&self.mount_base)
            .expect("Failed to read mount base")
            .map(|e| e.expect("Failed to read entry").path())
            .collect()
    }
}

/// Write `content` at `rel` under `root`, creating parents.
pub fn write_file(root: &Path, rel: &str, content: &str, mode: u32) {
    let path = root.join(rel);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("Failed to create parent dir");
    }
    fs::write(&path, content).expect("Failed to write file");
    fs::set_permissions(&path, fs::Permissions::from_mode(mode)).expect("Failed to set mode");
}

/// A small but representative root tree.
pub fn create_sample_rootfs(root: &Path) {
    write_file(root, "etc/hostname", "box1", 0o644);
    write_file(root, "etc/shadow", "root:*:19000::::::\n", 0o640);
    write_file(root, "usr/bin/init", "#!/bin/sh\nexec /bin/sh\n", 0o755);
    write_file(root, "usr/bin/passwd", "suid", 0o4755);
    fs::create_dir_all(root.join("tmp")).expect("Failed to create tmp");
    fs::set_permissions(root.join("tmp"), fs::Permissions::from_mode(0o1777))
        .expect("Failed to set tmp mode");
    fs::create_dir_all(root.join("var/empty")).expect("Failed to create var/empty");
    std::os::unix::fs::symlink("usr/bin", root.join("bin")).expect("Failed to create symlink");
    std::os::unix::fs::symlink("../missing", root.join("etc/dangling"))
        .expect("Failed to create symlink");
}

/// Assert a file exists with the given content and permission bits.
pub fn assert_file(path: &Path, content: &str, mode: u32) {
    assert_eq!(
        fs::read_to_string(path)
            .unwrap_or_else(|e| panic!("Failed to read {}: {}", path.display(), e)),
        content,
        "content of {}",
        path.display()
    );
    assert_eq!(
        fs::metadata(path).expect("Failed to stat").mode() & 0o7777,
        mode,
        "mode of {}",
        path.display()
    );
}

/// Where a simulated kernel operation should fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailPoint {
    Format,
    Attach,
    Mount,
    Unmount,
    Detach,
}

const MAGIC: &[u8] = b"FAKEFS:";

/// In-memory stand-in for the kernel.
///
/// `format` stamps a signature into the image and creates a content
/// directory under the store. `mount` moves that content into the target
/// and `unmount` moves it back, so a later mount sees what was copied.
pub struct FakeHost {
    store: PathBuf,
    pub privileged: bool,
    pub fail_at: Option<FailPoint>,
    /// Cancel this flag right after the named call succeeds.
    pub cancel_after: Option<(&'static str, CancelFlag)>,
    /// Directories every freshly formatted filesystem starts with.
    pub seed_dirs: Vec<&'static str>,
    calls: RefCell<Vec<String>>,
    devices: RefCell<HashMap<PathBuf, PathBuf>>,
    mounts: RefCell<HashMap<PathBuf, PathBuf>>,
    next_loop: Cell<u32>,
}

impl FakeHost {
    pub fn new(store: &Path) -> Self {
        Self {
            store: store.to_path_buf(),
            privileged: true,
            fail_at: None,
            cancel_after: None,
            seed_dirs: vec!["lost+found"],
            calls: RefCell::new(Vec::new()),
            devices: RefCell::new(HashMap::new()),
            mounts: RefCell::new(HashMap::new()),
            next_loop: Cell::new(0),
        }
    }

    pub fn unprivileged(store: &Path) -> Self {
        Self {
            privileged: false,
            ..Self::new(store)
        }
    }

    pub fn failing(store: &Path, at: FailPoint) -> Self {
        Self {
            fail_at: Some(at),
            ..Self::new(store)
        }
    }

    /// Kernel calls made so far, by name.
    pub fn calls(&self) -> Vec<String> {
        self.calls.borrow().clone()
    }

    /// Loop devices still bound.
    pub fn live_devices(&self) -> Vec<PathBuf> {
        self.devices.borrow().keys().cloned().collect()
    }

    /// Mount targets still mounted.
    pub fn live_mounts(&self) -> Vec<PathBuf> {
        self.mounts.borrow().keys().cloned().collect()
    }

    /// Directory holding the filesystem contents of `image`.
    pub fn content_dir(&self, image: &Path) -> PathBuf {
        let name = image
            .file_name()
            .expect("image has a file name")
            .to_string_lossy()
            .into_owned();
        self.store.join(format!("{}.content", name))
    }

    fn record(&self, call: &str, fail: FailPoint) -> Result<()> {
        self.calls.borrow_mut().push(call.to_string());
        if self.fail_at == Some(fail) {
            bail!("injected {} failure", call);
        }
        Ok(())
    }

    fn after(&self, call: &str) {
        if let Some((name, flag)) = &self.cancel_after {
            if *name == call {
                flag.cancel();
            }
        }
    }

    fn image_for_device(&self, device: &Path) -> Result<PathBuf> {
        self.devices
            .borrow()
            .get(device)
            .cloned()
            .with_context(|| format!("{} is not attached", device.display()))
    }
}

impl Host for FakeHost {
    fn has_admin_privilege(&self) -> bool {
        self.privileged
    }

    fn format(&self, image: &Path, kind: FsKind, _label: Option<&str>) -> Result<()> {
        self.record("format", FailPoint::Format)?;
        let mut file = OpenOptions::new()
            .write(true)
            .open(image)
            .with_context(|| format!("cannot open {}", image.display()))?;
        file.write_all(MAGIC)?;
        file.write_all(kind.as_str().as_bytes())?;
        file.write_all(b"\n")?;

        let content = self.content_dir(image);
        if content.exists() {
            fs::remove_dir_all(&content)?;
        }
        fs::create_dir_all(&content)?;
        fs::set_permissions(&content, fs::Permissions::from_mode(0o755))?;
        for dir in &self.seed_dirs {
            fs::create_dir_all(content.join(dir))?;
        }
        self.after("format");
        Ok(())
    }

    fn attach(&self, image: &Path) -> Result<PathBuf> {
        self.record("attach", FailPoint::Attach)?;
        let n = self.next_loop.get();
        self.next_loop.set(n + 1);
        let device = PathBuf::from(format!("/dev/loop{}", n));
        self.devices
            .borrow_mut()
            .insert(device.clone(), image.to_path_buf());
        self.after("attach");
        Ok(device)
    }

    fn detach(&self, device: &Path) -> Result<()> {
        self.record("detach", FailPoint::Detach)?;
        if self.devices.borrow_mut().remove(device).is_none() {
            bail!("{} is not attached", device.display());
        }
        self.after("detach");
        Ok(())
    }

    fn mount(&self, device: &Path, target: &Path, _kind: FsKind, _read_only: bool) -> Result<()> {
        self.record("mount", FailPoint::Mount)?;
        let image = self.image_for_device(device)?;
        let content = self.content_dir(&image);
        if !content.is_dir() {
            bail!("wrong fs type, bad superblock on {}", device.display());
        }
        move_entries(&content, target)?;
        copy_root_metadata(&content, target)?;
        self.mounts
            .borrow_mut()
            .insert(target.to_path_buf(), device.to_path_buf());
        self.after("mount");
        Ok(())
    }

    fn unmount(&self, target: &Path) -> Result<()> {
        self.record("unmount", FailPoint::Unmount)?;
        let device = self
            .mounts
            .borrow()
            .get(target)
            .cloned()
            .with_context(|| format!("{}: not mounted", target.display()))?;
        let image = self.image_for_device(&device)?;
        let content = self.content_dir(&image);
        move_entries(target, &content)?;
        copy_root_metadata(target, &content)?;
        self.mounts.borrow_mut().remove(target);
        self.after("unmount");
        Ok(())
    }

    fn probe_fs_type(&self, image: &Path) -> Result<Option<String>> {
        let mut head = [0u8; 32];
        let n = fs::File::open(image)?.read(&mut head)?;
        let head = &head[..n];
        let Some(rest) = head.strip_prefix(MAGIC) else {
            return Ok(None);
        };
        let fs_type: Vec<u8> = rest.iter().copied().take_while(|b| *b != b'\n').collect();
        Ok(Some(String::from_utf8(fs_type)?))
    }
}

fn move_entries(from: &Path, to: &Path) -> Result<()> {
    for entry in fs::read_dir(from)? {
        let entry = entry?;
        fs::rename(entry.path(), to.join(entry.file_name()))?;
    }
    Ok(())
}

fn copy_root_metadata(from: &Path, to: &Path) -> Result<()> {
    let mode = fs::metadata(from)?.mode() & 0o7777;
    fs::set_permissions(to, fs::Permissions::from_mode(mode))?;
    Ok(())
}
