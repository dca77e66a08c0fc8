//! Volume Lifecycle Coordinator
//!
//! Ties the object store, the eradication engine and the mount machinery
//! together behind the lifecycle operations:
//!
//! ```text
//! Unattached --stage--> Staged --publish--> Published
//!     ^                   |  ^                  |
//!     +------unstage------+  +----unpublish-----+
//! ```
//!
//! No mount state is kept in memory. Every call re-probes the mount table,
//! the process table and the host service manager.

pub mod controller;
pub mod node;
pub mod secrets;
pub mod volume_id;

pub use secrets::{CredentialSource, SecretRef, SecretResolver};
pub use volume_id::{sanitize_volume_id, volume_id_to_bucket_prefix};

use crate::config::AgentConfig;
use crate::domain::ports::{
    CommandRunnerRef, MountTableRef, ObjectStoreFactoryRef, ProcessTableRef, ServiceManagerRef,
    VolumeCapability,
};
use crate::metrics::AgentMetrics;
use crate::mounter::{
    Launcher, LinuxMountTable, MountProber, MounterConfig, ProcFs, SystemdCli, SystemdConfig,
    TokioCommandRunner, UnmountSupervisor,
};
use crate::storage::EradicationEngine;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

// =============================================================================
// Configuration
// =============================================================================

/// Driver identity and defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    /// Name the driver registers under
    pub name: String,
    /// Identity of the node this agent runs on
    pub node_id: String,
    /// Backend for volumes that do not choose one
    pub default_mounter: String,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            name: "s3.volume-agent.io".to_string(),
            node_id: String::new(),
            default_mounter: "geesefs".to_string(),
        }
    }
}

/// Host-facing ports the node side drives
#[derive(Clone)]
pub struct HostPorts {
    pub services: ServiceManagerRef,
    pub mount_table: MountTableRef,
    pub processes: ProcessTableRef,
    pub runner: CommandRunnerRef,
}

impl HostPorts {
    /// Real Linux adapters: systemd over its CLI, procfs, nix mounts
    pub fn linux(systemd: SystemdConfig) -> Self {
        let runner: CommandRunnerRef = Arc::new(TokioCommandRunner);
        Self {
            services: Arc::new(SystemdCli::new(runner.clone(), systemd)),
            mount_table: Arc::new(LinuxMountTable::new()),
            processes: Arc::new(ProcFs::default()),
            runner,
        }
    }
}

// =============================================================================
// Requests and Responses
// =============================================================================

/// Create a volume
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateVolumeRequest {
    pub name: String,
    #[serde(default)]
    pub capacity_bytes: i64,
    /// Storage class parameters, copied into the volume context
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
    #[serde(default)]
    pub volume_capabilities: Vec<VolumeCapability>,
    #[serde(flatten)]
    pub credentials: CredentialSource,
}

/// A created volume
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedVolume {
    pub volume_id: String,
    pub capacity_bytes: i64,
    /// Attributes every later node call receives back
    pub volume_context: BTreeMap<String, String>,
}

/// Delete a volume
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteVolumeRequest {
    pub volume_id: String,
    #[serde(flatten)]
    pub credentials: CredentialSource,
}

/// Check whether a volume supports the given capabilities
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidateCapabilitiesRequest {
    pub volume_id: String,
    #[serde(default)]
    pub volume_capabilities: Vec<VolumeCapability>,
    #[serde(flatten)]
    pub credentials: CredentialSource,
}

/// Outcome of a capability check: either confirmed capabilities or a
/// message explaining the refusal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapabilityValidation {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confirmed: Option<Vec<VolumeCapability>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Mount a volume at its node staging path
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageVolumeRequest {
    pub volume_id: String,
    pub staging_target_path: PathBuf,
    #[serde(default)]
    pub volume_capability: Option<VolumeCapability>,
    #[serde(default)]
    pub volume_context: BTreeMap<String, String>,
    #[serde(flatten)]
    pub credentials: CredentialSource,
}

/// Bind a staged volume into a workload
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishVolumeRequest {
    pub volume_id: String,
    pub staging_target_path: PathBuf,
    pub target_path: PathBuf,
    #[serde(default)]
    pub volume_capability: Option<VolumeCapability>,
    #[serde(default)]
    pub readonly: bool,
    #[serde(default)]
    pub volume_context: BTreeMap<String, String>,
    #[serde(flatten)]
    pub credentials: CredentialSource,
}

/// Remove a workload bind mount
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnpublishVolumeRequest {
    pub volume_id: String,
    pub target_path: PathBuf,
}

/// Tear down a staged volume
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnstageVolumeRequest {
    pub volume_id: String,
    pub staging_target_path: PathBuf,
}

/// Node identity and capabilities
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeInfo {
    pub driver_name: String,
    pub node_id: String,
    pub capabilities: Vec<String>,
}

/// Controller capabilities
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControllerCapabilities {
    pub capabilities: Vec<String>,
}

// =============================================================================
// Driver
// =============================================================================

/// Lifecycle coordinator shared by every request handler
pub struct Driver {
    config: DriverConfig,
    mounter_config: MounterConfig,
    stores: ObjectStoreFactoryRef,
    secrets: SecretResolver,
    eradication: EradicationEngine,
    launcher: Launcher,
    unmounter: UnmountSupervisor,
    prober: MountProber,
    mount_table: MountTableRef,
    metrics: Arc<AgentMetrics>,
}

impl Driver {
    pub fn new(
        config: AgentConfig,
        ports: HostPorts,
        stores: ObjectStoreFactoryRef,
        secrets: SecretResolver,
        metrics: Arc<AgentMetrics>,
    ) -> Self {
        let prober = MountProber::new(ports.mount_table.clone());
        let unit_prefix = config.systemd.unit_prefix.clone();
        let launcher = Launcher::new(
            config.launcher,
            unit_prefix.clone(),
            ports.services.clone(),
            ports.runner,
            prober.clone(),
        );
        let unmounter = UnmountSupervisor::new(
            config.unmount,
            unit_prefix,
            ports.services,
            ports.processes,
            ports.mount_table.clone(),
        )
        .with_secrets_dir(config.mounter.secrets_dir.clone());

        Self {
            config: config.driver,
            mounter_config: config.mounter,
            stores,
            secrets,
            eradication: EradicationEngine::new(config.eradication),
            launcher,
            unmounter,
            prober,
            mount_table: ports.mount_table,
            metrics,
        }
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<AgentMetrics> {
        &self.metrics
    }
}
