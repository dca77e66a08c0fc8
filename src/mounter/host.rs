//! Linux host adapters
//!
//! Real implementations of the mount table, process table and command
//! runner ports, built on `nix`, `procfs` and `tokio::process`.

use crate::domain::ports::{
    Capture, CommandOutput, CommandRunner, Invocation, MountTable, ProcessTable, UnmountMode,
};
use crate::error::{Error, Result};
use async_trait::async_trait;
use nix::errno::Errno;
use nix::mount::{mount, umount2, MntFlags, MsFlags};
use nix::sys::signal::kill;
use nix::unistd::Pid;
use procfs::process::{all_processes_with_root, Process};
use procfs::ProcError;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tracing::debug;

// =============================================================================
// Mount Table
// =============================================================================

/// Kernel mount table
#[derive(Debug, Clone, Default)]
pub struct LinuxMountTable;

impl LinuxMountTable {
    pub fn new() -> Self {
        Self
    }

    /// Exact lookup in mountinfo, needed for bind mounts within one device
    fn listed_in_mountinfo(&self, path: &Path) -> std::io::Result<bool> {
        let mounts = Process::myself()
            .and_then(|me| me.mountinfo())
            .map_err(proc_io_error)?;
        Ok(mounts.0.iter().any(|mount| mount.mount_point == path))
    }
}

fn proc_io_error(err: ProcError) -> std::io::Error {
    match err {
        ProcError::Io(e, _) => e,
        ProcError::NotFound(_) => std::io::Error::from(std::io::ErrorKind::NotFound),
        ProcError::PermissionDenied(_) => {
            std::io::Error::from(std::io::ErrorKind::PermissionDenied)
        }
        other => std::io::Error::new(std::io::ErrorKind::Other, other.to_string()),
    }
}

#[async_trait]
impl MountTable for LinuxMountTable {
    fn is_mount_point(&self, path: &Path) -> std::io::Result<bool> {
        // A dead FUSE endpoint fails with ENOTCONN here
        let meta = std::fs::metadata(path)?;
        let Some(parent) = path.parent() else {
            return Ok(true);
        };
        let parent_meta = std::fs::metadata(parent)?;
        if meta.dev() != parent_meta.dev() {
            return Ok(true);
        }
        self.listed_in_mountinfo(path)
    }

    async fn bind_mount(&self, source: &Path, target: &Path, read_only: bool) -> Result<()> {
        let source = source.to_path_buf();
        let target = target.to_path_buf();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let fail = |e: Errno| Error::MountFailed {
                path: target.display().to_string(),
                reason: format!("bind mount of {}: {}", source.display(), e),
            };
            mount::<Path, Path, str, str>(Some(source.as_path()), &target, None, MsFlags::MS_BIND, None)
                .map_err(fail)?;
            if read_only {
                mount::<Path, Path, str, str>(
                    None,
                    &target,
                    None,
                    MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY,
                    None,
                )
                .map_err(fail)?;
            }
            Ok(())
        })
        .await
        .map_err(|e| Error::Internal(format!("mount task failed: {}", e)))?
    }

    async fn unmount(&self, path: &Path, mode: UnmountMode) -> Result<bool> {
        let path = path.to_path_buf();
        let flags = match mode {
            UnmountMode::Normal => MntFlags::empty(),
            UnmountMode::ForceLazy => MntFlags::MNT_FORCE | MntFlags::MNT_DETACH,
        };
        tokio::task::spawn_blocking(move || match umount2(&path, flags) {
            Ok(()) => Ok(true),
            // Not a mount point, or no such path
            Err(Errno::EINVAL) | Err(Errno::ENOENT) => Ok(false),
            Err(e) => Err(Error::MountFailed {
                path: path.display().to_string(),
                reason: format!("unmount: {}", e),
            }),
        })
        .await
        .map_err(|e| Error::Internal(format!("unmount task failed: {}", e)))?
    }
}

// =============================================================================
// Process Table
// =============================================================================

/// Process table read from procfs
#[derive(Debug, Clone)]
pub struct ProcFs {
    root: PathBuf,
}

impl Default for ProcFs {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/proc"),
        }
    }
}

impl ProcFs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl ProcessTable for ProcFs {
    fn pids(&self) -> std::io::Result<Vec<i32>> {
        let mut pids = Vec::new();
        for process in all_processes_with_root(&self.root).map_err(proc_io_error)? {
            match process {
                Ok(process) => pids.push(process.pid),
                // Exited between listing and opening
                Err(e) => debug!("Skipping process entry: {}", e),
            }
        }
        Ok(pids)
    }

    fn cmdline(&self, pid: i32) -> std::io::Result<String> {
        let argv = Process::new_with_root(self.root.join(pid.to_string()))
            .and_then(|process| process.cmdline())
            .map_err(proc_io_error)?;
        Ok(argv.join(" "))
    }

    fn is_alive(&self, pid: i32) -> bool {
        match kill(Pid::from_raw(pid), None) {
            Ok(()) => true,
            // Exists, but belongs to someone we may not signal
            Err(Errno::EPERM) => true,
            Err(_) => false,
        }
    }
}

// =============================================================================
// Command Runner
// =============================================================================

/// Runs programs with `tokio::process`
#[derive(Debug, Clone, Default)]
pub struct TokioCommandRunner;

#[async_trait]
impl CommandRunner for TokioCommandRunner {
    async fn run(&self, invocation: &Invocation, capture: Capture) -> Result<CommandOutput> {
        debug!("Running {}", invocation);
        let mut command = tokio::process::Command::new(&invocation.program);
        command
            .args(&invocation.args)
            .envs(invocation.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .kill_on_drop(true);
        match capture {
            Capture::All => command.stderr(Stdio::piped()),
            Capture::StdoutOnly => command.stderr(Stdio::inherit()),
        };

        let output = command.output().await.map_err(|e| Error::MountCommandFailed {
            command: invocation.program.clone(),
            output: format!("cannot execute: {}", e),
        })?;

        Ok(CommandOutput {
            success: output.status.success(),
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}
