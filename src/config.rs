//! Agent Configuration
//!
//! Every tunable of the agent in one serde tree. Missing sections and
//! fields fall back to their defaults, so a YAML file only needs to name
//! what it changes.

use crate::driver::DriverConfig;
use crate::error::{Error, Result};
use crate::mounter::{LauncherConfig, MounterConfig, SystemdConfig, UnmountConfig};
use crate::storage::EradicationConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Top-level agent configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Driver identity and defaults
    pub driver: DriverConfig,
    /// Backend binary and credential file locations
    pub mounter: MounterConfig,
    /// Host service manager access
    pub systemd: SystemdConfig,
    /// Mount wait bounds
    pub launcher: LauncherConfig,
    /// Process exit backoff
    pub unmount: UnmountConfig,
    /// Bulk deletion tuning
    pub eradication: EradicationConfig,
}

impl AgentConfig {
    /// Parse a YAML document
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: AgentConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a YAML file
    pub fn load(path: &Path) -> Result<Self> {
        let yaml = std::fs::read_to_string(path).map_err(|e| {
            Error::Configuration(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&yaml)
    }

    pub fn validate(&self) -> Result<()> {
        if self.systemd.unit_prefix.is_empty() {
            return Err(Error::Configuration("systemd.unit_prefix must not be empty".into()));
        }
        if self.eradication.parallelism == 0 || self.eradication.batch_size == 0 {
            return Err(Error::Configuration(
                "eradication parallelism and batch_size must be positive".into(),
            ));
        }
        if self.unmount.process_exit_attempts == 0 {
            return Err(Error::Configuration(
                "unmount.process_exit_attempts must be positive".into(),
            ));
        }
        Ok(())
    }
}
