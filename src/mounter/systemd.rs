//! Host service manager adapter
//!
//! Drives the host's systemd through `systemd-run` and `systemctl`, run
//! via a [`CommandRunner`](crate::domain::ports::CommandRunner). Credentials
//! reach the unit through `--setenv=NAME`, which copies the value from
//! `systemd-run`'s own environment, so they never appear on a command line.

use crate::domain::ports::{
    Capture, CommandOutput, CommandRunnerRef, Invocation, ServiceManager, UnitSpec, UnitState,
    UnitStatus,
};
use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

/// Drop-in file carrying the post-stop cleanup of a unit
const STOP_PROPS_FILE: &str = "50-StopProps.conf";

/// `systemctl` exit status for "unit not loaded"
const EXIT_UNIT_NOT_LOADED: i32 = 5;

// =============================================================================
// Configuration
// =============================================================================

/// systemd adapter configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemdConfig {
    /// Prefix of per-volume unit names
    pub unit_prefix: String,
    /// Runtime unit directory where drop-ins are written
    pub dropin_dir: PathBuf,
    pub systemd_run: String,
    pub systemctl: String,
}

impl Default for SystemdConfig {
    fn default() -> Self {
        Self {
            unit_prefix: "geesefs".to_string(),
            dropin_dir: PathBuf::from("/run/systemd/system"),
            systemd_run: "systemd-run".to_string(),
            systemctl: "systemctl".to_string(),
        }
    }
}

// =============================================================================
// Unit Naming
// =============================================================================

/// Escape a string for use in a unit name.
///
/// ASCII letters pass through, digits too unless leading; every other
/// byte becomes `_` followed by its hex value. An empty string is `_`.
pub fn bus_escape(s: &str) -> String {
    if s.is_empty() {
        return "_".to_string();
    }
    let mut escaped = String::with_capacity(s.len());
    for (i, b) in s.bytes().enumerate() {
        let keep = b.is_ascii_alphabetic() || (b.is_ascii_digit() && i != 0);
        if keep {
            escaped.push(b as char);
        } else {
            let _ = write!(escaped, "_{:x}", b);
        }
    }
    escaped
}

/// Unit name of the backend serving `volume_id`
pub fn unit_name(prefix: &str, volume_id: &str) -> String {
    format!("{}-{}.service", prefix, bus_escape(volume_id))
}

// =============================================================================
// systemctl output parsing
// =============================================================================

/// Parse `systemctl show` output into a status, `None` for unknown units
fn parse_show_output(unit: &str, stdout: &str) -> Option<UnitStatus> {
    let mut load_state = None;
    let mut active_state = None;
    let mut exec_start = "";

    for line in stdout.lines() {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        match key {
            "LoadState" => load_state = Some(value.trim()),
            "ActiveState" => active_state = Some(value.trim()),
            "ExecStart" => exec_start = value,
            _ => {}
        }
    }

    match load_state {
        None | Some("not-found") => return None,
        _ => {}
    }

    Some(UnitStatus {
        name: unit.to_string(),
        state: UnitState::parse(active_state.unwrap_or("inactive")),
        exec_argv: parse_exec_argv(exec_start),
    })
}

/// Extract the argument vector from an `ExecStart` property value:
/// `{ path=/x ; argv[]=/x -f a b ; ignore_errors=no ; ... }`
fn parse_exec_argv(exec_start: &str) -> Vec<String> {
    let Some(start) = exec_start.find("argv[]=") else {
        return Vec::new();
    };
    let rest = &exec_start[start + "argv[]=".len()..];
    let end = rest.find(" ;").unwrap_or(rest.len());
    rest[..end].split_whitespace().map(str::to_string).collect()
}

fn stop_props(spec: &UnitSpec) -> String {
    format!(
        "[Service]\nExecStopPost={}\nTimeoutStopSec={}\n",
        spec.stop_post.join(" "),
        spec.stop_timeout.as_secs()
    )
}

// =============================================================================
// systemd CLI adapter
// =============================================================================

/// [`ServiceManager`] backed by the systemd command line tools
pub struct SystemdCli {
    runner: CommandRunnerRef,
    config: SystemdConfig,
}

impl SystemdCli {
    pub fn new(runner: CommandRunnerRef, config: SystemdConfig) -> Self {
        Self { runner, config }
    }

    pub fn config(&self) -> &SystemdConfig {
        &self.config
    }

    async fn systemctl<I, S>(&self, args: I) -> Result<CommandOutput>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let invocation = Invocation::new(self.config.systemctl.clone()).args(args);
        self.runner.run(&invocation, Capture::All).await
    }

    /// Write the unit's post-stop cleanup before the unit exists
    async fn write_stop_props(&self, spec: &UnitSpec) -> Result<()> {
        let dir = self.config.dropin_dir.join(format!("{}.d", spec.name));
        tokio::fs::create_dir_all(&dir).await?;

        let path = dir.join(STOP_PROPS_FILE);
        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(&path)
            .await?;
        file.write_all(stop_props(spec).as_bytes()).await?;
        file.flush().await?;

        debug!("Wrote {}", path.display());
        Ok(())
    }
}

#[async_trait]
impl ServiceManager for SystemdCli {
    async fn is_available(&self) -> bool {
        match self.systemctl(["show", "--property=Version"]).await {
            Ok(output) if output.success => true,
            Ok(output) => {
                warn!("systemd not reachable: {}", output.stderr.trim());
                false
            }
            Err(e) => {
                warn!("systemd not reachable: {}", e);
                false
            }
        }
    }

    async fn unit_status(&self, unit: &str) -> Result<Option<UnitStatus>> {
        let output = self
            .systemctl([
                "show",
                unit,
                "--property=LoadState",
                "--property=ActiveState",
                "--property=ExecStart",
            ])
            .await?;
        if !output.success {
            return Err(Error::ServiceManagerUnavailable(format!(
                "systemctl show {}: {}",
                unit,
                output.stderr.trim()
            )));
        }
        Ok(parse_show_output(unit, &output.stdout))
    }

    async fn start_transient_unit(&self, spec: &UnitSpec) -> Result<()> {
        if !spec.stop_post.is_empty() {
            self.write_stop_props(spec).await?;
        }

        let mut invocation = Invocation::new(self.config.systemd_run.clone())
            .arg(format!("--unit={}", spec.name))
            .arg(format!("--description={}", spec.description))
            .arg("--quiet");
        if spec.collect {
            invocation = invocation.arg("--collect");
        }
        for (key, value) in &spec.environment {
            invocation = invocation
                .arg(format!("--setenv={}", key))
                .env(key.clone(), value.clone());
        }
        let invocation = invocation.arg("--").args(spec.argv.iter().cloned());

        info!("Starting transient unit {}", spec.name);
        let output = self.runner.run(&invocation, Capture::All).await?;
        if !output.success {
            return Err(Error::ServiceUnit {
                unit: spec.name.clone(),
                operation: "start".into(),
                reason: output.stderr.trim().to_string(),
            });
        }
        Ok(())
    }

    async fn stop_unit(&self, unit: &str) -> Result<()> {
        let output = self.systemctl(["stop", unit]).await?;
        if output.success {
            info!("Unit {} stopped", unit);
            return Ok(());
        }
        if output.code == Some(EXIT_UNIT_NOT_LOADED) {
            debug!("Unit {} not loaded, nothing to stop", unit);
            return Ok(());
        }
        Err(Error::ServiceUnit {
            unit: unit.to_string(),
            operation: "stop".into(),
            reason: output.stderr.trim().to_string(),
        })
    }

    async fn reset_failed(&self, unit: &str) -> Result<()> {
        let output = self.systemctl(["reset-failed", unit]).await?;
        if !output.success {
            return Err(Error::ServiceUnit {
                unit: unit.to_string(),
                operation: "reset-failed".into(),
                reason: output.stderr.trim().to_string(),
            });
        }
        Ok(())
    }
}
