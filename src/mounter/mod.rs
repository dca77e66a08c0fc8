//! Mount Backends and Supervision
//!
//! Turns a volume into a command line for one of the supported FUSE
//! programs and supervises that program on the node:
//! - GeeseFS: preferred, can run as a host service unit
//! - s3fs: credentials through a per-volume password file
//! - rclone: credentials through the environment
//! - goofys: credentials through the environment
//!
//! Adding a backend means adding a [`Mounter`] variant and one match arm
//! in [`Mounter::plan`].

pub mod geesefs;
pub mod goofys;
pub mod host;
pub mod launcher;
pub mod options;
pub mod probe;
pub mod rclone;
pub mod s3fs;
pub mod systemd;
pub mod unmount;

pub use host::{LinuxMountTable, ProcFs, TokioCommandRunner};
pub use launcher::{Launcher, LauncherConfig};
pub use options::{split_host_unsafe, tokenize_options, FilteredOptions, NO_SYSTEMD_FLAG};
pub use probe::MountProber;
pub use systemd::{bus_escape, unit_name, SystemdCli, SystemdConfig};
pub use unmount::{UnmountConfig, UnmountOutcome, UnmountSupervisor};

use crate::domain::ports::{Credentials, Invocation, ServiceManager, Volume};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Volume attribute selecting the backend
pub const TYPE_KEY: &str = "mounter";
/// Volume attribute overriding the bucket name
pub const BUCKET_KEY: &str = "bucket";
/// Volume attribute carrying raw mount options
pub const OPTIONS_KEY: &str = "options";

// =============================================================================
// Configuration
// =============================================================================

/// Where backend binaries and credential files live
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MounterConfig {
    /// Plugin directory as seen from the host
    pub host_plugin_dir: PathBuf,
    /// Directory of the binaries bundled with the agent image
    pub bundled_binary_dir: PathBuf,
    /// Plugin directory as mounted inside the agent container
    pub staged_binary_dir: PathBuf,
    /// Directory for per-volume credential files
    pub secrets_dir: PathBuf,
}

impl Default for MounterConfig {
    fn default() -> Self {
        Self {
            host_plugin_dir: PathBuf::from("/var/lib/kubelet/plugins/s3.volume-agent.io"),
            bundled_binary_dir: PathBuf::from("/usr/bin"),
            staged_binary_dir: PathBuf::from("/csi"),
            secrets_dir: PathBuf::from("/run/s3-volume-agent/secrets"),
        }
    }
}

// =============================================================================
// Mount Plan
// =============================================================================

/// Mount request handed to a backend
#[derive(Debug, Clone, Copy)]
pub struct MountRequest<'a> {
    pub volume_id: &'a str,
    pub volume: &'a Volume,
    pub credentials: &'a Credentials,
    pub target: &'a Path,
}

impl MountRequest<'_> {
    fn aws_env(&self, invocation: Invocation) -> Invocation {
        invocation
            .env("AWS_ACCESS_KEY_ID", self.credentials.access_key_id.clone())
            .env("AWS_SECRET_ACCESS_KEY", self.credentials.secret_access_key.clone())
    }
}

/// Host-side variant of a backend invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostInvocation {
    /// Command as it runs on the host, program path host-visible
    pub invocation: Invocation,
    /// Binary shipped with the agent
    pub bundled_binary: PathBuf,
    /// Same binary at its host-visible location, seen from the agent
    pub staged_binary: PathBuf,
}

/// Everything needed to start a backend, whichever way it is launched
#[derive(Debug, Clone)]
pub struct MountPlan {
    pub backend: Mounter,
    /// Foreground invocation run by the agent itself
    pub direct: Invocation,
    /// Host unit invocation, when the backend and options allow it
    pub host: Option<HostInvocation>,
}

/// How a backend gets started
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchStrategy {
    /// Child of the agent, lives as long as the agent's container
    Direct,
    /// Transient unit on the host service manager
    HostUnit,
}

impl std::fmt::Display for LaunchStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LaunchStrategy::Direct => write!(f, "direct"),
            LaunchStrategy::HostUnit => write!(f, "host-unit"),
        }
    }
}

/// Pick the launch strategy for a plan.
///
/// Host delegation needs both a host invocation and a reachable service
/// manager; anything else runs directly.
pub async fn select_strategy(plan: &MountPlan, services: &dyn ServiceManager) -> LaunchStrategy {
    if plan.host.is_none() {
        return LaunchStrategy::Direct;
    }
    if services.is_available().await {
        LaunchStrategy::HostUnit
    } else {
        warn!(
            "Host service manager unreachable, starting {} directly",
            plan.backend
        );
        LaunchStrategy::Direct
    }
}

// =============================================================================
// Mounter
// =============================================================================

/// Supported mount programs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mounter {
    GeeseFs,
    S3fs,
    Rclone,
    Goofys,
}

impl Mounter {
    /// Resolve a backend name, falling back to GeeseFS
    pub fn from_name(name: &str) -> Self {
        match name.to_lowercase().as_str() {
            "geesefs" => Mounter::GeeseFs,
            "s3fs" => Mounter::S3fs,
            "rclone" => Mounter::Rclone,
            "goofys" => Mounter::Goofys,
            "" => Mounter::GeeseFs,
            other => {
                warn!("Unknown mounter {}, using geesefs", other);
                Mounter::GeeseFs
            }
        }
    }

    /// Backend for a volume: its own choice, else the agent default
    pub fn resolve(volume_choice: Option<&str>, default: &str) -> Self {
        match volume_choice.filter(|m| !m.is_empty()) {
            Some(name) => Self::from_name(name),
            None => Self::from_name(default),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Mounter::GeeseFs => "geesefs",
            Mounter::S3fs => "s3fs",
            Mounter::Rclone => "rclone",
            Mounter::Goofys => "goofys",
        }
    }

    /// Build the launch plan for a mount request
    pub fn plan(&self, request: &MountRequest<'_>, config: &MounterConfig) -> Result<MountPlan> {
        debug!(
            "Planning {} mount of {} at {}",
            self.name(),
            request.volume_id,
            request.target.display()
        );
        if request.volume.bucket.is_empty() {
            return Err(Error::InvalidArgument(format!(
                "volume {} has no bucket",
                request.volume_id
            )));
        }
        match self {
            Mounter::GeeseFs => Ok(geesefs::plan(request, config)),
            Mounter::S3fs => Ok(s3fs::plan(request, config)),
            Mounter::Rclone => Ok(rclone::plan(request)),
            Mounter::Goofys => Ok(goofys::plan(request)),
        }
    }
}

impl std::fmt::Display for Mounter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}
