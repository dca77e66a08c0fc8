//! S3 Volume Agent
//!
//! Exposes S3 buckets, or prefixes inside them, as volumes that workloads
//! mount on their nodes through a FUSE backend.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                         REST lifecycle API                           │
//! ├──────────────────────────────────────────────────────────────────────┤
//! │                   Volume Lifecycle Coordinator                       │
//! │   create / delete / validate        stage / publish / unpublish /    │
//! │                                     unstage                          │
//! ├────────────────────────────┬─────────────────────────────────────────┤
//! │  Object Eradication Engine │  Mount backends (geesefs, s3fs,         │
//! │  batch → per-object (16)   │  rclone, goofys)                        │
//! │                            │  Launcher: host unit │ direct child     │
//! │                            │  Unmount supervisor, mount prober       │
//! ├────────────────────────────┼─────────────────────────────────────────┤
//! │  aws-sdk-s3                │  systemd, /proc, mount(2)               │
//! └────────────────────────────┴─────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`driver`]: lifecycle coordinator and request types
//! - [`mounter`]: backends, launch and unmount supervision, host adapters
//! - [`storage`]: S3 adapter and the eradication engine
//! - [`api`]: REST surface
//! - [`domain`]: core types and ports
//! - [`config`], [`metrics`], [`error`]

pub mod api;
pub mod config;
pub mod domain;
pub mod driver;
pub mod error;
pub mod metrics;
pub mod mounter;
pub mod storage;

// Re-export commonly used types
pub use api::{ApiServer, ApiServerConfig, RestRouter};

pub use config::AgentConfig;

pub use domain::ports::{
    AccessMode, Credentials, ObjectInfo, ObjectStore, ObjectStoreFactory, Volume,
    VolumeCapability,
};

pub use driver::{Driver, DriverConfig, HostPorts, SecretResolver};

pub use error::{Error, ErrorKind, Result};

pub use metrics::AgentMetrics;

pub use mounter::{LaunchStrategy, Mounter};

pub use storage::{EradicationEngine, S3ObjectStoreFactory};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
