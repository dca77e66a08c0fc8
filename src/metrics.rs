//! Agent Metrics
//!
//! Prometheus counters for the mount and eradication paths, kept in a
//! registry owned by the agent so tests can build as many as they like.

use crate::error::{Error, Result};
use crate::mounter::{LaunchStrategy, Mounter, UnmountOutcome};
use crate::storage::{EradicationReport, EradicationStrategy};
use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};

/// Counters exported on `/metrics`
#[derive(Clone)]
pub struct AgentMetrics {
    registry: Registry,
    /// Mount attempts by backend, strategy and result
    pub mounts: IntCounterVec,
    /// Unstage operations by the path that tore the mount down
    pub unmounts: IntCounterVec,
    /// Objects removed by eradication, by tier
    pub eradicated_objects: IntCounterVec,
    /// Eradications that had to fall back to per-object deletes
    pub eradication_fallbacks: IntCounter,
}

impl AgentMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new_custom(Some("s3_volume_agent".into()), None)
            .map_err(metrics_error)?;

        let mounts = IntCounterVec::new(
            Opts::new("mounts_total", "Mount attempts by backend, strategy and result"),
            &["backend", "strategy", "result"],
        )
        .map_err(metrics_error)?;
        let unmounts = IntCounterVec::new(
            Opts::new("unmounts_total", "Unstage operations by teardown path"),
            &["outcome"],
        )
        .map_err(metrics_error)?;
        let eradicated_objects = IntCounterVec::new(
            Opts::new("eradicated_objects_total", "Objects removed during volume deletion"),
            &["strategy"],
        )
        .map_err(metrics_error)?;
        let eradication_fallbacks = IntCounter::new(
            "eradication_fallbacks_total",
            "Eradications that fell back to per-object deletes",
        )
        .map_err(metrics_error)?;

        registry
            .register(Box::new(mounts.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(unmounts.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(eradicated_objects.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(eradication_fallbacks.clone()))
            .map_err(metrics_error)?;

        Ok(Self {
            registry,
            mounts,
            unmounts,
            eradicated_objects,
            eradication_fallbacks,
        })
    }

    pub fn record_mount(&self, backend: Mounter, strategy: Option<LaunchStrategy>, ok: bool) {
        let strategy = strategy.map(|s| s.to_string()).unwrap_or_else(|| "none".into());
        let result = if ok { "success" } else { "failure" };
        self.mounts
            .with_label_values(&[backend.name(), strategy.as_str(), result])
            .inc();
    }

    pub fn record_unmount(&self, outcome: UnmountOutcome) {
        self.unmounts.with_label_values(&[outcome.as_str()]).inc();
    }

    pub fn record_eradication(&self, report: &EradicationReport) {
        self.eradicated_objects
            .with_label_values(&[report.strategy.as_str()])
            .inc_by(report.removed);
        if report.strategy == EradicationStrategy::PerObject {
            self.eradication_fallbacks.inc();
        }
    }

    /// Text exposition of every registered metric
    pub fn encode(&self) -> Result<(String, Vec<u8>)> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(metrics_error)?;
        Ok((encoder.format_type().to_string(), buffer))
    }
}

fn metrics_error(e: prometheus::Error) -> Error {
    Error::Internal(format!("metrics: {}", e))
}
