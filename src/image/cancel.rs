//! Termination signal plumbing.
//!
//! The signal handler only flips a flag. The pipeline polls it between
//! stages and between copied entries and unwinds with `Interrupted`, which
//! lets the reaper release everything on the way out.

use anyhow::{Context, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::BuildError;

/// Shared cancellation flag, cheap to clone.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a flag that SIGINT, SIGTERM and SIGHUP will set.
    ///
    /// Only one handler can be installed per process.
    pub fn install_signal_handler() -> Result<Self> {
        let flag = Self::new();
        let handle = flag.clone();
        ctrlc::set_handler(move || {
            handle.cancel();
        })
        .context("Failed to install termination signal handler")?;
        Ok(flag)
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// `Interrupted` if a signal arrived before `stage`.
    pub fn check(&self, stage: &'static str) -> Result<(), BuildError> {
        if self.is_cancelled() {
            tracing::warn!(stage, "termination requested, unwinding");
            return Err(BuildError::Interrupted(stage));
        }
        Ok(())
    }
}
