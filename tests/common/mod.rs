//! In-memory fakes of every host and storage port, plus a harness that
//! wires them into a [`Driver`].

#![allow(dead_code)]

use async_trait::async_trait;
use nix::errno::Errno;
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use s3_volume_agent::domain::ports::{
    Capture, CommandOutput, CommandRunner, Invocation, MountTable, ObjectInfo, ObjectStore,
    ObjectStoreFactory, ProcessTable, RemoveFailure, ServiceManager, UnitSpec, UnitState,
    UnitStatus, UnmountMode,
};
use s3_volume_agent::driver::{CredentialSource, HostPorts};
use s3_volume_agent::{AgentConfig, AgentMetrics, Credentials, Driver, Error, Result, SecretResolver};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use tempfile::TempDir;

// =============================================================================
// Object Store
// =============================================================================

#[derive(Default)]
pub struct MemoryStore {
    buckets: Mutex<BTreeMap<String, BTreeSet<String>>>,
    pub fail_batches: AtomicBool,
}

impl MemoryStore {
    pub fn keys(&self, bucket: &str) -> Option<Vec<String>> {
        self.buckets
            .lock()
            .get(bucket)
            .map(|objects| objects.iter().cloned().collect())
    }

    pub fn put(&self, bucket: &str, key: &str) {
        self.buckets
            .lock()
            .entry(bucket.to_string())
            .or_default()
            .insert(key.to_string());
    }
}

fn no_bucket(bucket: &str) -> Error {
    Error::BucketNotFound {
        bucket: bucket.to_string(),
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn bucket_exists(&self, bucket: &str) -> Result<bool> {
        Ok(self.buckets.lock().contains_key(bucket))
    }

    async fn create_bucket(&self, bucket: &str) -> Result<()> {
        self.buckets.lock().entry(bucket.to_string()).or_default();
        Ok(())
    }

    async fn put_empty_object(&self, bucket: &str, key: &str) -> Result<()> {
        let mut buckets = self.buckets.lock();
        let objects = buckets.get_mut(bucket).ok_or_else(|| no_bucket(bucket))?;
        objects.insert(key.to_string());
        Ok(())
    }

    fn list_objects<'a>(
        &'a self,
        bucket: &'a str,
        prefix: &'a str,
    ) -> BoxStream<'a, Result<ObjectInfo>> {
        let listed: Vec<Result<ObjectInfo>> = match self.buckets.lock().get(bucket) {
            Some(objects) => objects
                .iter()
                .filter(|key| key.starts_with(prefix))
                .map(|key| Ok(ObjectInfo::new(key.as_str())))
                .collect(),
            None => vec![Err(no_bucket(bucket))],
        };
        stream::iter(listed).boxed()
    }

    async fn remove_objects(
        &self,
        bucket: &str,
        objects: &[ObjectInfo],
    ) -> Result<Vec<RemoveFailure>> {
        if self.fail_batches.load(Ordering::SeqCst) {
            return Err(Error::object_store(bucket, "delete_objects", "NotImplemented"));
        }
        let mut buckets = self.buckets.lock();
        let stored = buckets.get_mut(bucket).ok_or_else(|| no_bucket(bucket))?;
        for object in objects {
            stored.remove(&object.key);
        }
        Ok(Vec::new())
    }

    async fn remove_object(&self, bucket: &str, object: &ObjectInfo) -> Result<()> {
        if let Some(stored) = self.buckets.lock().get_mut(bucket) {
            stored.remove(&object.key);
        }
        Ok(())
    }

    async fn remove_bucket(&self, bucket: &str) -> Result<()> {
        let mut buckets = self.buckets.lock();
        match buckets.get(bucket) {
            None => Err(no_bucket(bucket)),
            Some(objects) if !objects.is_empty() => {
                Err(Error::object_store(bucket, "delete_bucket", "BucketNotEmpty"))
            }
            Some(_) => {
                buckets.remove(bucket);
                Ok(())
            }
        }
    }
}

pub struct MemoryStoreFactory(pub Arc<MemoryStore>);

#[async_trait]
impl ObjectStoreFactory for MemoryStoreFactory {
    async fn connect(&self, credentials: &Credentials) -> Result<Arc<dyn ObjectStore>> {
        assert!(!credentials.access_key_id.is_empty());
        Ok(self.0.clone())
    }
}

// =============================================================================
// Host
// =============================================================================

#[derive(Debug, Clone)]
pub struct FakeProcess {
    pub argv: Vec<String>,
    pub targets: Vec<PathBuf>,
}

/// One fake node: mount table, service manager, process table and
/// command runner sharing state. Backends "mount" their target path as
/// soon as they start, unless the host is unhealthy.
pub struct FakeHost {
    root: PathBuf,
    /// Mount points and whether they are read-only
    pub mounts: Mutex<HashMap<PathBuf, bool>>,
    /// Mount points whose FUSE daemon died without unmounting
    pub dead: Mutex<HashSet<PathBuf>>,
    pub units: Mutex<BTreeMap<String, UnitStatus>>,
    pub started_units: Mutex<Vec<UnitSpec>>,
    pub processes: Mutex<BTreeMap<i32, FakeProcess>>,
    pub commands: Mutex<Vec<Invocation>>,
    pub available: AtomicBool,
    pub healthy: AtomicBool,
    next_pid: AtomicI32,
}

impl FakeHost {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            mounts: Mutex::new(HashMap::new()),
            dead: Mutex::new(HashSet::new()),
            units: Mutex::new(BTreeMap::new()),
            started_units: Mutex::new(Vec::new()),
            processes: Mutex::new(BTreeMap::new()),
            commands: Mutex::new(Vec::new()),
            available: AtomicBool::new(true),
            healthy: AtomicBool::new(true),
            next_pid: AtomicI32::new(1000),
        }
    }

    pub fn is_mounted(&self, path: &Path) -> bool {
        self.mounts.lock().contains_key(path)
    }

    /// Simulate a backend crash: its unit is collected and the mount is gone
    pub fn crash_unit(&self, unit: &str) {
        if let Some(status) = self.units.lock().remove(unit) {
            if let Some(target) = status.target() {
                self.mounts.lock().remove(Path::new(target));
            }
        }
    }

    /// Simulate a backend dying while its mount stays in place
    pub fn kill_endpoint(&self, path: &Path) {
        self.mounts.lock().remove(path);
        self.dead.lock().insert(path.to_path_buf());
    }

    fn mount(&self, path: &Path) {
        self.mounts.lock().insert(path.to_path_buf(), false);
    }

    fn drop_mount(&self, path: &Path) -> bool {
        let removed = self.mounts.lock().remove(path).is_some();
        if removed {
            self.processes
                .lock()
                .retain(|_, process| !process.targets.iter().any(|t| t == path));
        }
        removed
    }
}

#[async_trait]
impl MountTable for FakeHost {
    fn is_mount_point(&self, path: &Path) -> std::io::Result<bool> {
        if self.dead.lock().contains(path) {
            return Err(std::io::Error::from_raw_os_error(Errno::ENOTCONN as i32));
        }
        if self.is_mounted(path) {
            return Ok(true);
        }
        std::fs::metadata(path).map(|_| false)
    }

    async fn bind_mount(&self, source: &Path, target: &Path, read_only: bool) -> Result<()> {
        if !self.is_mounted(source) {
            return Err(Error::MountFailed {
                path: target.display().to_string(),
                reason: format!("{} is not mounted", source.display()),
            });
        }
        self.mounts.lock().insert(target.to_path_buf(), read_only);
        Ok(())
    }

    async fn unmount(&self, path: &Path, _mode: UnmountMode) -> Result<bool> {
        let was_dead = self.dead.lock().remove(path);
        Ok(self.drop_mount(path) || was_dead)
    }
}

#[async_trait]
impl ServiceManager for FakeHost {
    async fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    async fn unit_status(&self, unit: &str) -> Result<Option<UnitStatus>> {
        Ok(self.units.lock().get(unit).cloned())
    }

    async fn start_transient_unit(&self, spec: &UnitSpec) -> Result<()> {
        {
            let mut units = self.units.lock();
            if units.get(&spec.name).is_some_and(|u| u.state.is_running()) {
                return Err(Error::ServiceUnit {
                    unit: spec.name.clone(),
                    operation: "start".into(),
                    reason: "unit already exists".into(),
                });
            }
            units.insert(
                spec.name.clone(),
                UnitStatus {
                    name: spec.name.clone(),
                    state: UnitState::Active,
                    exec_argv: spec.argv.clone(),
                },
            );
        }
        self.started_units.lock().push(spec.clone());
        if self.healthy.load(Ordering::SeqCst) {
            if let Some(target) = spec.argv.last() {
                self.mount(Path::new(target));
            }
        }
        Ok(())
    }

    async fn stop_unit(&self, unit: &str) -> Result<()> {
        let stopped = self.units.lock().remove(unit);
        if stopped.is_some() {
            let stop_post = self
                .started_units
                .lock()
                .iter()
                .rev()
                .find(|spec| spec.name == unit)
                .and_then(|spec| spec.stop_post.last().cloned());
            if let Some(target) = stop_post {
                self.drop_mount(Path::new(&target));
            }
        }
        Ok(())
    }

    async fn reset_failed(&self, _unit: &str) -> Result<()> {
        Ok(())
    }
}

impl ProcessTable for FakeHost {
    fn pids(&self) -> std::io::Result<Vec<i32>> {
        Ok(self.processes.lock().keys().copied().collect())
    }

    fn cmdline(&self, pid: i32) -> std::io::Result<String> {
        self.processes
            .lock()
            .get(&pid)
            .map(|process| process.argv.join(" "))
            .ok_or_else(|| std::io::Error::from(std::io::ErrorKind::NotFound))
    }

    fn is_alive(&self, pid: i32) -> bool {
        self.processes.lock().contains_key(&pid)
    }
}

#[async_trait]
impl CommandRunner for FakeHost {
    async fn run(&self, invocation: &Invocation, _capture: Capture) -> Result<CommandOutput> {
        self.commands.lock().push(invocation.clone());
        if self.healthy.load(Ordering::SeqCst) {
            let targets: Vec<PathBuf> = invocation
                .args
                .iter()
                .map(PathBuf::from)
                .filter(|p| p.starts_with(&self.root) && p.is_dir())
                .collect();
            for target in &targets {
                self.mount(target);
            }
            let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
            self.processes.lock().insert(
                pid,
                FakeProcess {
                    argv: invocation.argv(),
                    targets,
                },
            );
        }
        Ok(CommandOutput {
            success: true,
            code: Some(0),
            ..Default::default()
        })
    }
}

// =============================================================================
// Harness
// =============================================================================

pub struct Harness {
    pub dir: TempDir,
    pub host: Arc<FakeHost>,
    pub store: Arc<MemoryStore>,
    pub metrics: Arc<AgentMetrics>,
    pub driver: Arc<Driver>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(|_| {})
    }

    pub fn with_config(adjust: impl FnOnce(&mut AgentConfig)) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();

        std::fs::create_dir_all(root.join("bundled")).unwrap();
        std::fs::create_dir_all(root.join("staged")).unwrap();
        std::fs::write(root.join("bundled/geesefs"), b"#!/bin/sh\n").unwrap();

        let mut config = AgentConfig::default();
        config.driver.node_id = "node-1".into();
        config.mounter.host_plugin_dir = root.join("host-plugin");
        config.mounter.bundled_binary_dir = root.join("bundled");
        config.mounter.staged_binary_dir = root.join("staged");
        config.mounter.secrets_dir = root.join("secrets");
        config.launcher.host_mount_timeout_secs = 1;
        config.launcher.direct_mount_timeout_secs = 1;
        config.unmount.process_exit_initial_ms = 1;
        adjust(&mut config);

        let host = Arc::new(FakeHost::new(root));
        let store = Arc::new(MemoryStore::default());
        let metrics = Arc::new(AgentMetrics::new().unwrap());
        let ports = HostPorts {
            services: host.clone(),
            mount_table: host.clone(),
            processes: host.clone(),
            runner: host.clone(),
        };
        let driver = Arc::new(Driver::new(
            config,
            ports,
            Arc::new(MemoryStoreFactory(store.clone())),
            SecretResolver::new(),
            metrics.clone(),
        ));

        Self {
            dir,
            host,
            store,
            metrics,
            driver,
        }
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }
}

pub fn credentials() -> CredentialSource {
    CredentialSource {
        secrets: BTreeMap::from([
            ("accessKeyID".to_string(), "AKIA".to_string()),
            ("secretAccessKey".to_string(), "secret".to_string()),
            ("endpoint".to_string(), "https://storage.example.com".to_string()),
        ]),
        secret_ref: None,
    }
}
