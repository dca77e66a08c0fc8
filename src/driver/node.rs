//! Node operations: stage, publish, unpublish, unstage
//!
//! Stage and unstage start and stop the backend at the staging path.
//! Publish and unpublish only bind mount the staging path into workloads.

use super::{
    CredentialSource, Driver, NodeInfo, PublishVolumeRequest, StageVolumeRequest,
    UnpublishVolumeRequest, UnstageVolumeRequest,
};
use crate::domain::ports::{UnmountMode, Volume};
use crate::driver::controller::CAPACITY_KEY;
use crate::driver::volume_id::volume_id_to_bucket_prefix;
use crate::error::{Error, Result};
use crate::mounter::{tokenize_options, LaunchStrategy, MountRequest, Mounter, OPTIONS_KEY, TYPE_KEY};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, info, warn};

/// Rebuild the volume from its id and the context returned at creation
pub fn volume_from_context(volume_id: &str, context: &BTreeMap<String, String>) -> Result<Volume> {
    let (bucket, prefix) = volume_id_to_bucket_prefix(volume_id);
    let mount_options = match context.get(OPTIONS_KEY) {
        Some(raw) => tokenize_options(raw)?,
        None => Vec::new(),
    };
    Ok(Volume {
        bucket: bucket.to_string(),
        prefix: prefix.to_string(),
        mounter: context.get(TYPE_KEY).cloned(),
        mount_options,
        capacity_bytes: context
            .get(CAPACITY_KEY)
            .and_then(|c| c.parse().ok())
            .unwrap_or(0),
    })
}

fn require(value: &str, what: &str) -> Result<()> {
    if value.is_empty() {
        return Err(Error::InvalidArgument(format!("{} missing in request", what)));
    }
    Ok(())
}

fn require_path(path: &Path, what: &str) -> Result<()> {
    require(&path.to_string_lossy(), what)
}

impl Driver {
    /// Mount a volume at its staging path; a no-op when already mounted
    pub async fn stage_volume(&self, request: &StageVolumeRequest) -> Result<()> {
        require(&request.volume_id, "volume id")?;
        require_path(&request.staging_target_path, "staging target path")?;
        if request.volume_capability.is_none() {
            return Err(Error::InvalidArgument(
                "volume capability missing in request".into(),
            ));
        }

        if self.prober.is_mounted(&request.staging_target_path).await? {
            debug!(
                "Volume {} already staged at {}",
                request.volume_id,
                request.staging_target_path.display()
            );
            return Ok(());
        }

        self.mount_volume(
            &request.volume_id,
            &request.volume_context,
            &request.credentials,
            &request.staging_target_path,
        )
        .await
    }

    /// Bind the staging path onto the workload target path.
    ///
    /// A staging path whose backend died is mounted again first.
    pub async fn publish_volume(&self, request: &PublishVolumeRequest) -> Result<()> {
        require(&request.volume_id, "volume id")?;
        require_path(&request.staging_target_path, "staging target path")?;
        require_path(&request.target_path, "target path")?;
        if request.volume_capability.is_none() {
            return Err(Error::InvalidArgument(
                "volume capability missing in request".into(),
            ));
        }

        if !self.prober.is_mounted(&request.staging_target_path).await? {
            warn!(
                "Staged mount of {} at {} is gone, reviving it",
                request.volume_id,
                request.staging_target_path.display()
            );
            self.mount_volume(
                &request.volume_id,
                &request.volume_context,
                &request.credentials,
                &request.staging_target_path,
            )
            .await?;
        }

        if self.prober.is_mounted(&request.target_path).await? {
            debug!(
                "Volume {} already published at {}",
                request.volume_id,
                request.target_path.display()
            );
            return Ok(());
        }

        info!(
            "Binding volume {} from {} to {}{}",
            request.volume_id,
            request.staging_target_path.display(),
            request.target_path.display(),
            if request.readonly { " (read-only)" } else { "" }
        );
        self.mount_table
            .bind_mount(
                &request.staging_target_path,
                &request.target_path,
                request.readonly,
            )
            .await
    }

    /// Remove the workload bind mount; an unmounted target is fine
    pub async fn unpublish_volume(&self, request: &UnpublishVolumeRequest) -> Result<()> {
        require(&request.volume_id, "volume id")?;
        require_path(&request.target_path, "target path")?;

        let unmounted = self
            .unmounter
            .unmount_tolerant(&request.target_path, UnmountMode::Normal)
            .await?;
        info!(
            "Volume {} {} at {}",
            request.volume_id,
            if unmounted { "unpublished" } else { "was not published" },
            request.target_path.display()
        );
        Ok(())
    }

    /// Stop the volume's backend and unmount the staging path
    pub async fn unstage_volume(&self, request: &UnstageVolumeRequest) -> Result<()> {
        require(&request.volume_id, "volume id")?;
        require_path(&request.staging_target_path, "staging target path")?;

        let outcome = self
            .unmounter
            .unstage(&request.volume_id, &request.staging_target_path)
            .await?;
        self.metrics.record_unmount(outcome);
        info!(
            "Volume {} unstaged from {} ({})",
            request.volume_id,
            request.staging_target_path.display(),
            outcome.as_str()
        );
        Ok(())
    }

    pub fn node_info(&self) -> NodeInfo {
        NodeInfo {
            driver_name: self.config.name.clone(),
            node_id: self.config.node_id.clone(),
            capabilities: vec!["STAGE_UNSTAGE_VOLUME".to_string()],
        }
    }

    async fn mount_volume(
        &self,
        volume_id: &str,
        context: &BTreeMap<String, String>,
        source: &CredentialSource,
        staging: &Path,
    ) -> Result<()> {
        let volume = volume_from_context(volume_id, context)?;
        let credentials = self.secrets.resolve(source).await?;
        let backend = Mounter::resolve(volume.mounter.as_deref(), &self.config.default_mounter);
        let request = MountRequest {
            volume_id,
            volume: &volume,
            credentials: &credentials,
            target: staging,
        };

        let launched: Result<LaunchStrategy> = async {
            let plan = backend.plan(&request, &self.mounter_config)?;
            self.launcher.launch(volume_id, &plan, staging).await
        }
        .await;

        match launched {
            Ok(strategy) => {
                self.metrics.record_mount(backend, Some(strategy), true);
                info!(
                    "Volume {} mounted at {} with {} ({})",
                    volume_id,
                    staging.display(),
                    backend,
                    strategy
                );
                Ok(())
            }
            Err(e) => {
                self.metrics.record_mount(backend, None, false);
                Err(e)
            }
        }
    }
}
