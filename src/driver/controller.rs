//! Controller operations: volume creation, deletion and capability checks

use super::{
    CapabilityValidation, ControllerCapabilities, CreateVolumeRequest, CreatedVolume,
    DeleteVolumeRequest, Driver, ValidateCapabilitiesRequest,
};
use crate::domain::ports::{AccessMode, VolumeCapability};
use crate::driver::volume_id::{sanitize_volume_id, volume_id_to_bucket_prefix};
use crate::error::{Error, Result};
use crate::mounter::BUCKET_KEY;
use crate::storage::listing_prefix;
use tracing::{debug, info};

/// Volume context key carrying the requested capacity
pub const CAPACITY_KEY: &str = "capacity";

/// The only access mode object storage volumes support
const SUPPORTED_ACCESS_MODE: AccessMode = AccessMode::MultiNodeMultiWriter;

impl Driver {
    /// Create the bucket (when missing) and the prefix marker of a volume
    pub async fn create_volume(&self, request: &CreateVolumeRequest) -> Result<CreatedVolume> {
        let name = sanitize_volume_id(&request.name);
        if name.is_empty() {
            return Err(Error::InvalidArgument("name missing in request".into()));
        }
        if request.volume_capabilities.is_empty() {
            return Err(Error::InvalidArgument(
                "volume capabilities missing in request".into(),
            ));
        }

        let (bucket, prefix, volume_id) = match request.parameters.get(BUCKET_KEY) {
            Some(bucket) if !bucket.is_empty() => {
                let bucket = bucket.trim_end_matches('/').to_string();
                let volume_id = format!("{}/{}", bucket, name);
                (bucket, name, volume_id)
            }
            _ => (name.clone(), String::new(), name),
        };
        info!("Creating volume {}", volume_id);

        let credentials = self.secrets.resolve(&request.credentials).await?;
        let store = self.stores.connect(&credentials).await?;

        if !store.bucket_exists(&bucket).await? {
            info!("Creating bucket {}", bucket);
            store.create_bucket(&bucket).await?;
        }
        if !prefix.is_empty() {
            store.put_empty_object(&bucket, &listing_prefix(&prefix)).await?;
        }

        let mut volume_context = request.parameters.clone();
        volume_context.insert(CAPACITY_KEY.to_string(), request.capacity_bytes.to_string());
        debug!("Volume {} created in bucket {}", volume_id, bucket);

        Ok(CreatedVolume {
            volume_id,
            capacity_bytes: request.capacity_bytes,
            volume_context,
        })
    }

    /// Remove everything a volume stored.
    ///
    /// A whole-bucket volume removes the bucket, a prefix volume only its
    /// prefix. Deleting a volume whose bucket is gone succeeds.
    pub async fn delete_volume(&self, request: &DeleteVolumeRequest) -> Result<()> {
        if request.volume_id.is_empty() {
            return Err(Error::InvalidArgument("volume id missing in request".into()));
        }
        let (bucket, prefix) = volume_id_to_bucket_prefix(&request.volume_id);
        info!("Deleting volume {}", request.volume_id);

        let credentials = self.secrets.resolve(&request.credentials).await?;
        let store = self.stores.connect(&credentials).await?;

        let report = if prefix.is_empty() {
            self.eradication.delete_bucket(&store, bucket).await?
        } else {
            match self.eradication.delete_prefix(&store, bucket, prefix).await {
                Ok(report) => Some(report),
                Err(Error::BucketNotFound { .. }) => {
                    info!("Bucket {} of volume {} is already gone", bucket, request.volume_id);
                    None
                }
                Err(e) => return Err(e),
            }
        };
        if let Some(report) = &report {
            self.metrics.record_eradication(report);
        }

        info!("Volume {} deleted", request.volume_id);
        Ok(())
    }

    /// Confirm the requested capabilities when all of them are
    /// multi-node multi-writer
    pub async fn validate_volume_capabilities(
        &self,
        request: &ValidateCapabilitiesRequest,
    ) -> Result<CapabilityValidation> {
        if request.volume_id.is_empty() {
            return Err(Error::InvalidArgument("volume id missing in request".into()));
        }
        if request.volume_capabilities.is_empty() {
            return Err(Error::InvalidArgument(
                "volume capabilities missing in request".into(),
            ));
        }
        let (bucket, _) = volume_id_to_bucket_prefix(&request.volume_id);

        let credentials = self.secrets.resolve(&request.credentials).await?;
        let store = self.stores.connect(&credentials).await?;
        if !store.bucket_exists(bucket).await? {
            return Err(Error::NotFound(format!(
                "bucket of volume {} does not exist",
                request.volume_id
            )));
        }

        if request
            .volume_capabilities
            .iter()
            .any(|capability| capability.access_mode != SUPPORTED_ACCESS_MODE)
        {
            return Ok(CapabilityValidation {
                confirmed: None,
                message: Some(format!("only {} is supported", SUPPORTED_ACCESS_MODE)),
            });
        }

        Ok(CapabilityValidation {
            confirmed: Some(vec![VolumeCapability {
                access_mode: SUPPORTED_ACCESS_MODE,
                mount_flags: Vec::new(),
            }]),
            message: None,
        })
    }

    pub fn controller_capabilities(&self) -> ControllerCapabilities {
        ControllerCapabilities {
            capabilities: vec!["CREATE_DELETE_VOLUME".to_string()],
        }
    }
}
