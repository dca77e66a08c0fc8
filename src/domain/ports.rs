//! Domain Ports - Core trait definitions for the volume agent
//!
//! These traits define the boundaries between the lifecycle logic and the
//! systems it drives: the object store, the host service manager, the
//! kernel mount table, the process table and external programs. The
//! authoritative state lives behind these ports, so callers always
//! re-query instead of caching.

use crate::error::Result;
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

// =============================================================================
// Volume Types
// =============================================================================

/// A logical volume: a bucket and an optional prefix inside it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Volume {
    /// Bucket backing the volume
    pub bucket: String,
    /// Path-like prefix inside the bucket, empty for a whole-bucket volume
    pub prefix: String,
    /// Backend requested by the volume, if any
    pub mounter: Option<String>,
    /// Tokenized free-form mount options
    pub mount_options: Vec<String>,
    /// Declared capacity, informational only
    pub capacity_bytes: i64,
}

/// Object storage credentials and coordinates
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub region: String,
    pub endpoint: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .field("region", &self.region)
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

/// Volume access modes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AccessMode {
    SingleNodeWriter,
    SingleNodeReaderOnly,
    MultiNodeReaderOnly,
    MultiNodeSingleWriter,
    MultiNodeMultiWriter,
}

impl std::fmt::Display for AccessMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            AccessMode::SingleNodeWriter => "SINGLE_NODE_WRITER",
            AccessMode::SingleNodeReaderOnly => "SINGLE_NODE_READER_ONLY",
            AccessMode::MultiNodeReaderOnly => "MULTI_NODE_READER_ONLY",
            AccessMode::MultiNodeSingleWriter => "MULTI_NODE_SINGLE_WRITER",
            AccessMode::MultiNodeMultiWriter => "MULTI_NODE_MULTI_WRITER",
        };
        write!(f, "{}", name)
    }
}

/// Requested volume capability
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeCapability {
    pub access_mode: AccessMode,
    #[serde(default)]
    pub mount_flags: Vec<String>,
}

// =============================================================================
// Object Storage Port
// =============================================================================

/// A listed object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    pub key: String,
    pub size: i64,
}

impl ObjectInfo {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            size: 0,
        }
    }
}

/// A single object the store refused to remove during a batch call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoveFailure {
    pub key: String,
    pub reason: String,
}

/// Port for object storage operations, scoped by bucket
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Check whether a bucket exists
    async fn bucket_exists(&self, bucket: &str) -> Result<bool>;

    /// Create a bucket
    async fn create_bucket(&self, bucket: &str) -> Result<()>;

    /// Write a zero-byte object
    async fn put_empty_object(&self, bucket: &str, key: &str) -> Result<()>;

    /// Recursively list every object under `prefix`
    ///
    /// Fails with [`crate::Error::BucketNotFound`] when the bucket is absent.
    fn list_objects<'a>(&'a self, bucket: &'a str, prefix: &'a str)
        -> BoxStream<'a, Result<ObjectInfo>>;

    /// Remove a batch of objects in one bulk call
    ///
    /// Per-object rejections come back as [`RemoveFailure`]s, a failure of
    /// the call itself as an error.
    async fn remove_objects(&self, bucket: &str, objects: &[ObjectInfo])
        -> Result<Vec<RemoveFailure>>;

    /// Remove a single object
    async fn remove_object(&self, bucket: &str, object: &ObjectInfo) -> Result<()>;

    /// Remove an (empty) bucket
    ///
    /// Fails with [`crate::Error::BucketNotFound`] when the bucket is absent.
    async fn remove_bucket(&self, bucket: &str) -> Result<()>;
}

/// Port for building an object store client from request credentials
#[async_trait]
pub trait ObjectStoreFactory: Send + Sync {
    async fn connect(&self, credentials: &Credentials) -> Result<Arc<dyn ObjectStore>>;
}

// =============================================================================
// External Programs
// =============================================================================

/// A file that has to exist before an invocation runs
#[derive(Clone, PartialEq, Eq)]
pub struct SecretFile {
    pub path: PathBuf,
    pub contents: String,
}

impl std::fmt::Debug for SecretFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretFile").field("path", &self.path).finish()
    }
}

/// A fully resolved command line for an external program
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    /// Extra environment on top of the inherited one
    pub env: Vec<(String, String)>,
    /// Files written with mode 0600 before the program starts
    pub files: Vec<SecretFile>,
}

impl Invocation {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Full argument vector with the program first
    pub fn argv(&self) -> Vec<String> {
        std::iter::once(self.program.clone())
            .chain(self.args.iter().cloned())
            .collect()
    }
}

// Environment values carry credentials.
impl std::fmt::Debug for Invocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let env_keys: Vec<&str> = self.env.iter().map(|(k, _)| k.as_str()).collect();
        f.debug_struct("Invocation")
            .field("program", &self.program)
            .field("args", &self.args)
            .field("env", &env_keys)
            .field("files", &self.files)
            .finish()
    }
}

impl std::fmt::Display for Invocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Which output streams to capture when running a program
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capture {
    /// Capture stdout and stderr
    All,
    /// Capture stdout, let stderr through to the agent's own stderr
    StdoutOnly,
}

/// Result of a finished program
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub success: bool,
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

/// Port for running external programs to completion
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, invocation: &Invocation, capture: Capture) -> Result<CommandOutput>;
}

// =============================================================================
// Host Service Manager Port
// =============================================================================

/// Activation state of a service unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitState {
    Active,
    Activating,
    Reloading,
    Deactivating,
    Inactive,
    Failed,
    Other(String),
}

impl UnitState {
    pub fn parse(s: &str) -> Self {
        match s {
            "active" => UnitState::Active,
            "activating" => UnitState::Activating,
            "reloading" => UnitState::Reloading,
            "deactivating" => UnitState::Deactivating,
            "inactive" => UnitState::Inactive,
            "failed" => UnitState::Failed,
            other => UnitState::Other(other.to_string()),
        }
    }

    /// Whether the unit holds (or is about to hold) a running process
    pub fn is_running(&self) -> bool {
        matches!(
            self,
            UnitState::Active | UnitState::Activating | UnitState::Reloading
        )
    }
}

/// Observed state of an existing unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitStatus {
    pub name: String,
    pub state: UnitState,
    /// Argument vector of the unit's main command
    pub exec_argv: Vec<String>,
}

impl UnitStatus {
    /// The mount target recorded in the unit: its final command argument
    pub fn target(&self) -> Option<&str> {
        if self.exec_argv.len() < 2 {
            return None;
        }
        self.exec_argv.last().map(String::as_str)
    }

    /// Whether the unit's command mounts at `target`.
    ///
    /// `systemctl show` separates arguments with plain spaces, so a target
    /// containing a space comes back split over several arguments; the
    /// joined tail is compared instead of the last argument.
    pub fn serves(&self, target: &str) -> bool {
        self.exec_argv.len() >= 2
            && self
                .exec_argv
                .join(" ")
                .strip_suffix(target)
                .is_some_and(|head| head.ends_with(' '))
    }
}

/// Definition of a transient unit to create
#[derive(Clone, PartialEq, Eq)]
pub struct UnitSpec {
    pub name: String,
    pub description: String,
    /// Main command, program first
    pub argv: Vec<String>,
    /// Private environment of the unit
    pub environment: Vec<(String, String)>,
    /// Cleanup command run after the unit stops
    pub stop_post: Vec<String>,
    pub stop_timeout: Duration,
    /// Garbage-collect the unit once it is inactive or failed
    pub collect: bool,
}

impl std::fmt::Debug for UnitSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let env_keys: Vec<&str> = self.environment.iter().map(|(k, _)| k.as_str()).collect();
        f.debug_struct("UnitSpec")
            .field("name", &self.name)
            .field("description", &self.description)
            .field("argv", &self.argv)
            .field("environment", &env_keys)
            .field("stop_post", &self.stop_post)
            .field("stop_timeout", &self.stop_timeout)
            .field("collect", &self.collect)
            .finish()
    }
}

/// Port for the host's service manager
#[async_trait]
pub trait ServiceManager: Send + Sync {
    /// Capability probe: can the manager be reached at all
    async fn is_available(&self) -> bool;

    /// Look up a unit, `None` when it is not loaded
    async fn unit_status(&self, unit: &str) -> Result<Option<UnitStatus>>;

    /// Create and start a transient unit
    async fn start_transient_unit(&self, spec: &UnitSpec) -> Result<()>;

    /// Stop a unit, returning once the manager acknowledges the stop
    async fn stop_unit(&self, unit: &str) -> Result<()>;

    /// Clear a failed unit so its name can be reused
    async fn reset_failed(&self, unit: &str) -> Result<()>;
}

// =============================================================================
// Mount Table Port
// =============================================================================

/// How hard to try when unmounting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnmountMode {
    Normal,
    /// Force and detach lazily, for dead FUSE endpoints
    ForceLazy,
}

/// Port for the kernel mount table
#[async_trait]
pub trait MountTable: Send + Sync {
    /// Whether `path` is a mount point; `NotFound` when it does not exist
    fn is_mount_point(&self, path: &Path) -> std::io::Result<bool>;

    /// Bind `source` onto `target`, optionally read-only
    async fn bind_mount(&self, source: &Path, target: &Path, read_only: bool) -> Result<()>;

    /// Unmount `path`; `Ok(false)` when nothing was mounted there
    async fn unmount(&self, path: &Path, mode: UnmountMode) -> Result<bool>;
}

// =============================================================================
// Process Table Port
// =============================================================================

/// Port for the host process table
pub trait ProcessTable: Send + Sync {
    /// All live process ids
    fn pids(&self) -> std::io::Result<Vec<i32>>;

    /// Command-line record of a process, arguments separated by spaces
    fn cmdline(&self, pid: i32) -> std::io::Result<String>;

    /// Liveness probe (signal 0)
    fn is_alive(&self, pid: i32) -> bool;
}

// =============================================================================
// Type Aliases for Arc'd Traits
// =============================================================================

pub type ObjectStoreRef = Arc<dyn ObjectStore>;
pub type ObjectStoreFactoryRef = Arc<dyn ObjectStoreFactory>;
pub type CommandRunnerRef = Arc<dyn CommandRunner>;
pub type ServiceManagerRef = Arc<dyn ServiceManager>;
pub type MountTableRef = Arc<dyn MountTable>;
pub type ProcessTableRef = Arc<dyn ProcessTable>;
