//! Mount Point Prober
//!
//! Answers "is this path a live mount point" against the kernel mount
//! table, and waits for a freshly launched backend to bring one up.

use crate::domain::ports::MountTableRef;
use crate::error::{Error, Result};
use std::io::ErrorKind;
use std::path::Path;
use std::time::{Duration, Instant};
use tracing::debug;

/// Polling interval while waiting for a mount point
pub const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Mount point checks over a [`MountTable`](crate::domain::ports::MountTable)
#[derive(Clone)]
pub struct MountProber {
    table: MountTableRef,
}

impl MountProber {
    pub fn new(table: MountTableRef) -> Self {
        Self { table }
    }

    /// Whether `path` is currently a mount point.
    ///
    /// A missing path is created (mode 0750) and reported as not mounted;
    /// any other stat failure is an error.
    pub async fn is_mounted(&self, path: &Path) -> Result<bool> {
        match self.table.is_mount_point(path) {
            Ok(mounted) => Ok(mounted),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("Creating mount directory {}", path.display());
                create_mount_dir(path).await?;
                Ok(false)
            }
            Err(e) => Err(Error::MountFailed {
                path: path.display().to_string(),
                reason: format!("stat failed: {}", e),
            }),
        }
    }

    /// Poll until `path` becomes a mount point or `timeout` elapses
    pub async fn wait_until_mounted(&self, path: &Path, timeout: Duration) -> Result<()> {
        let started = Instant::now();
        loop {
            if self.is_mounted(path).await? {
                debug!(
                    "Mount point {} ready after {:?}",
                    path.display(),
                    started.elapsed()
                );
                return Ok(());
            }
            if started.elapsed() >= timeout {
                return Err(Error::timeout(
                    format!("mount at {}", path.display()),
                    started.elapsed(),
                ));
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}

async fn create_mount_dir(path: &Path) -> Result<()> {
    let mut builder = tokio::fs::DirBuilder::new();
    builder.recursive(true).mode(0o750);
    builder.create(path).await.map_err(|e| Error::MountFailed {
        path: path.display().to_string(),
        reason: format!("cannot create directory: {}", e),
    })
}
