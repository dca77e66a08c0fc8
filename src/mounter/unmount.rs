//! Unmount Supervisor
//!
//! Reverses a launch. The backend serving a staging path is found by
//! looking, in order, for:
//! 1. a local process whose command line names the path
//! 2. an active host unit for the volume
//! 3. nothing, in which case the path is unmounted directly
//!
//! A path that is not mounted at all counts as success. Once the backend
//! is gone the volume's local credential file is removed.

use super::s3fs::credential_file;
use super::systemd::unit_name;
use crate::domain::ports::{MountTableRef, ProcessTableRef, ServiceManagerRef, UnmountMode};
use crate::error::{Error, Result};
use backoff::backoff::Backoff;
use backoff::ExponentialBackoffBuilder;
use nix::errno::Errno;
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

// =============================================================================
// Configuration
// =============================================================================

/// Unmount timing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UnmountConfig {
    /// First delay while waiting for a backend process to exit
    pub process_exit_initial_ms: u64,
    /// Growth factor of the delay
    pub process_exit_multiplier: f64,
    /// Ceiling on liveness checks before giving up
    pub process_exit_attempts: u32,
    /// Cap on a single delay
    pub process_exit_max_interval_secs: u64,
    /// Upper bound on a unit stop
    pub unit_stop_timeout_secs: u64,
}

impl Default for UnmountConfig {
    fn default() -> Self {
        Self {
            process_exit_initial_ms: 100,
            process_exit_multiplier: 1.5,
            process_exit_attempts: 20,
            process_exit_max_interval_secs: 10,
            unit_stop_timeout_secs: 60,
        }
    }
}

impl UnmountConfig {
    fn backoff(&self) -> backoff::ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_millis(self.process_exit_initial_ms))
            .with_multiplier(self.process_exit_multiplier)
            .with_randomization_factor(0.0)
            .with_max_interval(Duration::from_secs(self.process_exit_max_interval_secs))
            .with_max_elapsed_time(None)
            .build()
    }
}

/// Which path an unstage took
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnmountOutcome {
    /// A local backend process was found and waited for
    Process(i32),
    /// The volume's host unit was stopped
    Unit,
    /// The path was unmounted directly
    Direct,
    /// Nothing was mounted
    AlreadyUnmounted,
}

impl UnmountOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            UnmountOutcome::Process(_) => "process",
            UnmountOutcome::Unit => "unit",
            UnmountOutcome::Direct => "direct",
            UnmountOutcome::AlreadyUnmounted => "already_unmounted",
        }
    }
}

// =============================================================================
// Unmount Supervisor
// =============================================================================

/// Tears down backends and waits for them to go away
pub struct UnmountSupervisor {
    config: UnmountConfig,
    unit_prefix: String,
    services: ServiceManagerRef,
    processes: ProcessTableRef,
    table: MountTableRef,
    secrets_dir: Option<PathBuf>,
}

impl UnmountSupervisor {
    pub fn new(
        config: UnmountConfig,
        unit_prefix: impl Into<String>,
        services: ServiceManagerRef,
        processes: ProcessTableRef,
        table: MountTableRef,
    ) -> Self {
        Self {
            config,
            unit_prefix: unit_prefix.into(),
            services,
            processes,
            table,
            secrets_dir: None,
        }
    }

    /// Directory holding per-volume credential files to clean up
    pub fn with_secrets_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.secrets_dir = Some(dir.into());
        self
    }

    /// Stop whatever serves `staging` for `volume_id` and unmount it
    pub async fn unstage(&self, volume_id: &str, staging: &Path) -> Result<UnmountOutcome> {
        let outcome = self.stop_backend(volume_id, staging).await?;
        self.remove_credential_file(volume_id).await?;
        Ok(outcome)
    }

    async fn stop_backend(&self, volume_id: &str, staging: &Path) -> Result<UnmountOutcome> {
        if let Some(pid) = self.find_mount_process(staging).await? {
            info!(
                "Found backend process {} for {}, unmounting",
                pid,
                staging.display()
            );
            self.unmount_tolerant(staging, UnmountMode::Normal).await?;
            self.wait_for_process_exit(pid).await?;
            return Ok(UnmountOutcome::Process(pid));
        }

        if self.services.is_available().await && self.stop_volume_unit(volume_id, staging).await? {
            return Ok(UnmountOutcome::Unit);
        }

        if self.unmount_tolerant(staging, UnmountMode::Normal).await? {
            Ok(UnmountOutcome::Direct)
        } else {
            Ok(UnmountOutcome::AlreadyUnmounted)
        }
    }

    async fn remove_credential_file(&self, volume_id: &str) -> Result<()> {
        let Some(dir) = &self.secrets_dir else {
            return Ok(());
        };
        let path = credential_file(dir, volume_id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                debug!("Removed credential file {}", path.display());
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Stop the volume's unit if it is running; `false` when there is none
    async fn stop_volume_unit(&self, volume_id: &str, staging: &Path) -> Result<bool> {
        let unit = unit_name(&self.unit_prefix, volume_id);
        let status = match self.services.unit_status(&unit).await {
            Ok(Some(status)) if status.state.is_running() => status,
            Ok(_) => return Ok(false),
            Err(e) => {
                warn!("Cannot query unit {}, unmounting directly: {}", unit, e);
                return Ok(false);
            }
        };

        info!("Stopping unit {} ({:?})", unit, status.state);
        let timeout = Duration::from_secs(self.config.unit_stop_timeout_secs);
        tokio::time::timeout(timeout, self.services.stop_unit(&unit))
            .await
            .map_err(|_| Error::timeout(format!("stop of unit {}", unit), timeout))??;

        // ExecStopPost normally cleans up, a dead FUSE endpoint may remain
        if self.mounted_now(staging)? {
            warn!("{} still mounted after unit stop", staging.display());
            self.table.unmount(staging, UnmountMode::ForceLazy).await?;
        }
        Ok(true)
    }

    /// Unmount `path`, treating "nothing mounted" as success.
    ///
    /// Returns whether something was actually unmounted.
    pub async fn unmount_tolerant(&self, path: &Path, mode: UnmountMode) -> Result<bool> {
        let unmounted = self.table.unmount(path, mode).await?;
        if unmounted {
            info!("Unmounted {}", path.display());
        } else {
            debug!("{} was not mounted", path.display());
        }
        Ok(unmounted)
    }

    /// Find a process other than ourselves whose command line names `path`
    async fn find_mount_process(&self, path: &Path) -> Result<Option<i32>> {
        let processes = self.processes.clone();
        let needle = path.to_string_lossy().into_owned();
        let own_pid = std::process::id() as i32;

        tokio::task::spawn_blocking(move || -> Result<Option<i32>> {
            for pid in processes.pids()? {
                if pid == own_pid {
                    continue;
                }
                match processes.cmdline(pid) {
                    Ok(cmdline) if cmdline.contains(&needle) => {
                        debug!("Process {} references {}", pid, needle);
                        return Ok(Some(pid));
                    }
                    Ok(_) => {}
                    Err(e) => debug!("Cannot read cmdline of {}: {}", pid, e),
                }
            }
            Ok(None)
        })
        .await
        .map_err(|e| Error::Internal(format!("process scan failed: {}", e)))?
    }

    /// Wait for `pid` to exit with capped exponential backoff
    pub async fn wait_for_process_exit(&self, pid: i32) -> Result<()> {
        let started = Instant::now();
        let mut backoff = self.config.backoff();

        for attempt in 0..self.config.process_exit_attempts {
            match self.processes.cmdline(pid) {
                Err(e) => {
                    debug!("Cmdline of {} unreadable, process is gone: {}", pid, e);
                    return Ok(());
                }
                Ok(cmdline) if cmdline.is_empty() => {
                    debug!("Process {} is a zombie", pid);
                    return Ok(());
                }
                Ok(_) => {}
            }
            if !self.processes.is_alive(pid) {
                return Ok(());
            }

            let delay = backoff
                .next_backoff()
                .unwrap_or(Duration::from_secs(self.config.process_exit_max_interval_secs));
            debug!(
                "Process {} still running (attempt {}), next check in {:?}",
                pid,
                attempt + 1,
                delay
            );
            tokio::time::sleep(delay).await;
        }

        Err(Error::timeout(
            format!("exit of process {}", pid),
            started.elapsed(),
        ))
    }

    /// Mount state after a unit stop; a dead FUSE endpoint still needs
    /// the forced unmount
    fn mounted_now(&self, path: &Path) -> Result<bool> {
        match self.table.is_mount_point(path) {
            Ok(mounted) => Ok(mounted),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) if e.raw_os_error() == Some(Errno::ENOTCONN as i32) => Ok(true),
            Err(e) => Err(e.into()),
        }
    }
}
