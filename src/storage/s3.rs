//! S3 Object Store Adapter
//!
//! [`ObjectStore`] on top of `aws-sdk-s3`. One client is built per set of
//! request credentials; path-style addressing is forced since most
//! S3-compatible services expect it.

use crate::domain::ports::{Credentials, ObjectInfo, ObjectStore, ObjectStoreFactory, RemoveFailure};
use crate::error::{Error, Result};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::{Credentials as AwsCredentials, Region};
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{
    BucketLocationConstraint, CreateBucketConfiguration, Delete, ObjectIdentifier,
};
use aws_sdk_s3::Client;
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use std::sync::Arc;
use tracing::debug;

type ObjectPage = stream::Iter<std::vec::IntoIter<Result<ObjectInfo>>>;

/// Region used when the credentials do not name one
const DEFAULT_REGION: &str = "us-east-1";

/// Add a scheme to bare `host:port` endpoints
pub fn normalize_endpoint(endpoint: &str) -> String {
    if endpoint.contains("://") {
        endpoint.to_string()
    } else {
        format!("https://{}", endpoint)
    }
}

/// S3 client bound to one set of credentials
#[derive(Clone)]
pub struct S3ObjectStore {
    client: Client,
    region: String,
}

impl S3ObjectStore {
    /// Build a client for `credentials`
    pub async fn connect(credentials: &Credentials) -> Self {
        let region = if credentials.region.is_empty() {
            DEFAULT_REGION.to_string()
        } else {
            credentials.region.clone()
        };

        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(region.clone()))
            .credentials_provider(AwsCredentials::new(
                credentials.access_key_id.clone(),
                credentials.secret_access_key.clone(),
                None,
                None,
                "s3-volume-agent",
            ));
        if !credentials.endpoint.is_empty() {
            loader = loader.endpoint_url(normalize_endpoint(&credentials.endpoint));
        }
        let shared = loader.load().await;

        let config = aws_sdk_s3::config::Builder::from(&shared)
            .force_path_style(true)
            .build();
        debug!(
            "S3 client ready for endpoint '{}' region {}",
            credentials.endpoint, region
        );

        Self {
            client: Client::from_conf(config),
            region,
        }
    }

    async fn list_page(
        &self,
        bucket: &str,
        prefix: &str,
        token: Option<String>,
    ) -> Result<(Vec<Result<ObjectInfo>>, Option<String>)> {
        let output = self
            .client
            .list_objects_v2()
            .bucket(bucket)
            .prefix(prefix)
            .set_continuation_token(token)
            .send()
            .await
            .map_err(|e| match e.as_service_error() {
                Some(se) if se.is_no_such_bucket() => Error::BucketNotFound {
                    bucket: bucket.to_string(),
                },
                _ => Error::object_store(bucket, "list_objects_v2", DisplayErrorContext(&e)),
            })?;

        let objects = output
            .contents()
            .iter()
            .filter_map(|object| {
                object.key().map(|key| {
                    Ok(ObjectInfo {
                        key: key.to_string(),
                        size: object.size().unwrap_or(0),
                    })
                })
            })
            .collect();
        let next = match output.is_truncated() {
            Some(true) => output.next_continuation_token().map(str::to_string),
            _ => None,
        };
        Ok((objects, next))
    }

    /// One listing step; `None` state ends the listing, `Some(token)`
    /// fetches another page
    async fn next_page(
        &self,
        bucket: &str,
        prefix: &str,
        state: Option<Option<String>>,
    ) -> Result<Option<(ObjectPage, Option<Option<String>>)>> {
        let Some(token) = state else {
            return Ok(None);
        };
        let (objects, next) = self.list_page(bucket, prefix, token).await?;
        Ok(Some((stream::iter(objects), next.map(Some))))
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn bucket_exists(&self, bucket: &str) -> Result<bool> {
        match self.client.head_bucket().bucket(bucket).send().await {
            Ok(_) => Ok(true),
            Err(e) if e.as_service_error().is_some_and(|se| se.is_not_found()) => Ok(false),
            Err(e) => Err(Error::object_store(bucket, "head_bucket", DisplayErrorContext(&e))),
        }
    }

    async fn create_bucket(&self, bucket: &str) -> Result<()> {
        let mut request = self.client.create_bucket().bucket(bucket);
        if self.region != DEFAULT_REGION {
            request = request.create_bucket_configuration(
                CreateBucketConfiguration::builder()
                    .location_constraint(BucketLocationConstraint::from(self.region.as_str()))
                    .build(),
            );
        }
        request
            .send()
            .await
            .map_err(|e| Error::object_store(bucket, "create_bucket", DisplayErrorContext(&e)))?;
        Ok(())
    }

    async fn put_empty_object(&self, bucket: &str, key: &str) -> Result<()> {
        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(ByteStream::from_static(b""))
            .send()
            .await
            .map_err(|e| Error::object_store(bucket, "put_object", DisplayErrorContext(&e)))?;
        Ok(())
    }

    fn list_objects<'a>(
        &'a self,
        bucket: &'a str,
        prefix: &'a str,
    ) -> BoxStream<'a, Result<ObjectInfo>> {
        stream::try_unfold(Some(None), move |state| self.next_page(bucket, prefix, state))
            .try_flatten()
            .boxed()
    }

    async fn remove_objects(
        &self,
        bucket: &str,
        objects: &[ObjectInfo],
    ) -> Result<Vec<RemoveFailure>> {
        if objects.is_empty() {
            return Ok(Vec::new());
        }

        let identifiers = objects
            .iter()
            .map(|object| {
                ObjectIdentifier::builder()
                    .key(&object.key)
                    .build()
                    .map_err(|e| Error::object_store(bucket, "delete_objects", e))
            })
            .collect::<Result<Vec<_>>>()?;
        let delete = Delete::builder()
            .set_objects(Some(identifiers))
            .quiet(true)
            .build()
            .map_err(|e| Error::object_store(bucket, "delete_objects", e))?;

        let output = self
            .client
            .delete_objects()
            .bucket(bucket)
            .delete(delete)
            .send()
            .await
            .map_err(|e| Error::object_store(bucket, "delete_objects", DisplayErrorContext(&e)))?;

        Ok(output
            .errors()
            .iter()
            .map(|err| RemoveFailure {
                key: err.key().unwrap_or_default().to_string(),
                reason: format!(
                    "{}: {}",
                    err.code().unwrap_or("unknown"),
                    err.message().unwrap_or_default()
                ),
            })
            .collect())
    }

    async fn remove_object(&self, bucket: &str, object: &ObjectInfo) -> Result<()> {
        self.client
            .delete_object()
            .bucket(bucket)
            .key(&object.key)
            .send()
            .await
            .map_err(|e| Error::object_store(bucket, "delete_object", DisplayErrorContext(&e)))?;
        Ok(())
    }

    async fn remove_bucket(&self, bucket: &str) -> Result<()> {
        match self.client.delete_bucket().bucket(bucket).send().await {
            Ok(_) => Ok(()),
            Err(e) if e.as_service_error().and_then(|se| se.code()) == Some("NoSuchBucket") => {
                Err(Error::BucketNotFound {
                    bucket: bucket.to_string(),
                })
            }
            Err(e) => Err(Error::object_store(bucket, "delete_bucket", DisplayErrorContext(&e))),
        }
    }
}

/// Builds [`S3ObjectStore`]s from request credentials
#[derive(Debug, Clone, Default)]
pub struct S3ObjectStoreFactory;

#[async_trait]
impl ObjectStoreFactory for S3ObjectStoreFactory {
    async fn connect(&self, credentials: &Credentials) -> Result<Arc<dyn ObjectStore>> {
        Ok(Arc::new(S3ObjectStore::connect(credentials).await))
    }
}
