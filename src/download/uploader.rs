//! Cloud-drive upload port.
//!
//! The concrete adapter (rclone or similar) lives outside this crate; the
//! worker invokes it after a successful download when one is configured.

use std::path::Path;

pub trait Uploader: Send + Sync {
    fn upload(&self, path: &Path) -> anyhow::Result<()>;
}

/// Upload adapter that does nothing. Used when no cloud drive is configured.
pub struct NoopUploader;

impl Uploader for NoopUploader {
    fn upload(&self, path: &Path) -> anyhow::Result<()> {
        log::debug!("No uploader configured, keeping {} local", path.display());
        Ok(())
    }
}
