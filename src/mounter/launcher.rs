//! Host Process Supervisor
//!
//! Starts a planned backend so the mount outlives the agent. The preferred
//! path is a transient host unit; when the service manager cannot be
//! reached, or the volume opted out, the backend runs as a direct child.
//!
//! Nothing is remembered between calls. Every launch re-reads the unit
//! registry and the mount table, which is what makes repeated stage calls
//! for the same volume safe.

use super::probe::MountProber;
use super::systemd::unit_name;
use super::{select_strategy, HostInvocation, LaunchStrategy, MountPlan};
use crate::domain::ports::{
    Capture, CommandRunnerRef, Invocation, SecretFile, ServiceManagerRef, UnitSpec, UnitStatus,
};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs::Permissions;
use std::io::ErrorKind;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

// =============================================================================
// Configuration
// =============================================================================

/// Launch timeouts
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LauncherConfig {
    /// How long a host unit gets to bring up its mount point
    pub host_mount_timeout_secs: u64,
    /// How long a direct backend gets to bring up its mount point
    pub direct_mount_timeout_secs: u64,
    /// Upper bound for a direct backend to daemonize
    pub direct_command_timeout_secs: u64,
    /// `TimeoutStopSec` of host units
    pub unit_stop_timeout_secs: u64,
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            host_mount_timeout_secs: 30,
            direct_mount_timeout_secs: 10,
            direct_command_timeout_secs: 60,
            unit_stop_timeout_secs: 20,
        }
    }
}

impl LauncherConfig {
    pub fn host_mount_timeout(&self) -> Duration {
        Duration::from_secs(self.host_mount_timeout_secs)
    }

    pub fn direct_mount_timeout(&self) -> Duration {
        Duration::from_secs(self.direct_mount_timeout_secs)
    }

    pub fn direct_command_timeout(&self) -> Duration {
        Duration::from_secs(self.direct_command_timeout_secs)
    }
}

// =============================================================================
// Launcher
// =============================================================================

/// Starts backends, preferring host-supervised units
pub struct Launcher {
    config: LauncherConfig,
    unit_prefix: String,
    services: ServiceManagerRef,
    runner: CommandRunnerRef,
    prober: MountProber,
}

impl Launcher {
    pub fn new(
        config: LauncherConfig,
        unit_prefix: impl Into<String>,
        services: ServiceManagerRef,
        runner: CommandRunnerRef,
        prober: MountProber,
    ) -> Self {
        Self {
            config,
            unit_prefix: unit_prefix.into(),
            services,
            runner,
            prober,
        }
    }

    /// Start the backend of `plan` for `volume_id` and wait for `target` to
    /// become a mount point. Returns the strategy that was used.
    pub async fn launch(
        &self,
        volume_id: &str,
        plan: &MountPlan,
        target: &Path,
    ) -> Result<LaunchStrategy> {
        let strategy = select_strategy(plan, self.services.as_ref()).await;
        match (strategy, &plan.host) {
            (LaunchStrategy::HostUnit, Some(host)) => {
                self.launch_unit(volume_id, plan, host, target).await?
            }
            _ => self.launch_direct(&plan.direct, target).await?,
        }
        Ok(strategy)
    }

    async fn launch_unit(
        &self,
        volume_id: &str,
        plan: &MountPlan,
        host: &HostInvocation,
        target: &Path,
    ) -> Result<()> {
        stage_binary(&host.bundled_binary, &host.staged_binary).await?;

        let unit = unit_name(&self.unit_prefix, volume_id);
        if let Some(status) = self.services.unit_status(&unit).await? {
            if status.state.is_running() {
                check_target(volume_id, &status, target)?;
                info!(
                    "Unit {} already serves {}, waiting for mount",
                    unit,
                    target.display()
                );
                return self.await_unit_mount(&unit, target).await;
            }
            info!("Clearing leftover unit {} in state {:?}", unit, status.state);
            self.clear_unit(&unit).await;
        }

        write_secret_files(&host.invocation.files).await?;
        let spec = UnitSpec {
            name: unit.clone(),
            description: format!("{} mount for volume {}", plan.backend, volume_id),
            argv: host.invocation.argv(),
            environment: host.invocation.env.clone(),
            stop_post: vec![
                "/bin/umount".into(),
                "-f".into(),
                "-l".into(),
                target.to_string_lossy().into_owned(),
            ],
            stop_timeout: Duration::from_secs(self.config.unit_stop_timeout_secs),
            collect: true,
        };
        info!("Starting {} as host unit {}: {}", plan.backend, unit, host.invocation);

        if let Err(e) = self.services.start_transient_unit(&spec).await {
            // A concurrent stage of the same volume may have won the race.
            match self.services.unit_status(&unit).await {
                Ok(Some(status)) if status.state.is_running() => {
                    check_target(volume_id, &status, target)?;
                    warn!("Unit {} was started concurrently: {}", unit, e);
                }
                _ => return Err(e),
            }
        }

        self.await_unit_mount(&unit, target).await
    }

    /// Wait for a unit's mount; on timeout tear the unit down so that the
    /// next attempt starts from a clean slate.
    async fn await_unit_mount(&self, unit: &str, target: &Path) -> Result<()> {
        match self
            .prober
            .wait_until_mounted(target, self.config.host_mount_timeout())
            .await
        {
            Err(e @ Error::Timeout { .. }) => {
                warn!("Unit {} did not mount {} in time, stopping it", unit, target.display());
                self.clear_unit(unit).await;
                Err(e)
            }
            other => other,
        }
    }

    /// Stop a unit and reset its failed state, errors are only logged
    async fn clear_unit(&self, unit: &str) {
        if let Err(e) = self.services.stop_unit(unit).await {
            warn!("Failed to stop unit {}: {}", unit, e);
        }
        if let Err(e) = self.services.reset_failed(unit).await {
            debug!("reset-failed of unit {}: {}", unit, e);
        }
    }

    async fn launch_direct(&self, invocation: &Invocation, target: &Path) -> Result<()> {
        write_secret_files(&invocation.files).await?;

        info!("Starting {} directly: {}", invocation.program, invocation);
        let timeout = self.config.direct_command_timeout();
        let output = tokio::time::timeout(timeout, self.runner.run(invocation, Capture::StdoutOnly))
            .await
            .map_err(|_| Error::timeout(format!("{} to start", invocation.program), timeout))??;

        if !output.success {
            return Err(Error::MountCommandFailed {
                command: invocation.to_string(),
                output: output.stdout.trim().to_string(),
            });
        }

        self.prober
            .wait_until_mounted(target, self.config.direct_mount_timeout())
            .await
    }
}

fn check_target(volume_id: &str, status: &UnitStatus, target: &Path) -> Result<()> {
    let requested = target.to_string_lossy();
    if status.serves(&requested) {
        return Ok(());
    }
    Err(Error::Conflict {
        volume_id: volume_id.to_string(),
        requested: requested.into_owned(),
        current: status.target().unwrap_or("<unknown>").to_string(),
    })
}

// =============================================================================
// Files
// =============================================================================

/// Write credential files with mode 0600
async fn write_secret_files(files: &[SecretFile]) -> Result<()> {
    for secret in files {
        if let Some(parent) = secret.path.parent() {
            let mut builder = tokio::fs::DirBuilder::new();
            builder.recursive(true).mode(0o700);
            builder.create(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(&secret.path)
            .await?;
        file.write_all(secret.contents.as_bytes()).await?;
        file.flush().await?;
        tokio::fs::set_permissions(&secret.path, Permissions::from_mode(0o600)).await?;
        debug!("Wrote credential file {}", secret.path.display());
    }
    Ok(())
}

/// Make sure the host-visible copy of a backend binary matches the bundled
/// one, comparing size and modification time.
///
/// A stale copy is removed before the new one is written so that a still
/// running instance does not make the write fail with "text file busy".
pub async fn stage_binary(from: &Path, to: &Path) -> Result<()> {
    let source = tokio::fs::metadata(from).await.map_err(|e| Error::MountFailed {
        path: from.display().to_string(),
        reason: format!("cannot stat backend binary: {}", e),
    })?;
    let source_mtime = source.modified()?;

    let current = match tokio::fs::metadata(to).await {
        Ok(meta) => Some(meta),
        Err(e) if e.kind() == ErrorKind::NotFound => None,
        Err(e) => {
            return Err(Error::MountFailed {
                path: to.display().to_string(),
                reason: format!("cannot stat staged binary: {}", e),
            })
        }
    };

    if let Some(meta) = &current {
        if meta.len() == source.len() && meta.modified().ok() == Some(source_mtime) {
            debug!("Binary {} is up to date", to.display());
            return Ok(());
        }
        tokio::fs::remove_file(to).await?;
    }

    info!("Staging {} to {}", from.display(), to.display());
    let tmp = staging_path(to);
    tokio::fs::copy(from, &tmp).await?;
    tokio::fs::set_permissions(&tmp, Permissions::from_mode(0o755)).await?;

    let tmp_for_mtime = tmp.clone();
    tokio::task::spawn_blocking(move || {
        std::fs::OpenOptions::new()
            .write(true)
            .open(&tmp_for_mtime)?
            .set_modified(source_mtime)
    })
    .await
    .map_err(|e| Error::Internal(format!("staging task failed: {}", e)))??;

    tokio::fs::rename(&tmp, to).await?;
    Ok(())
}

fn staging_path(to: &Path) -> PathBuf {
    let mut name = to.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    to.with_file_name(name)
}
