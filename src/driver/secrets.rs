//! Credentials resolution
//!
//! Requests carry credentials inline as a secret map, or point at a
//! Kubernetes Secret holding the same keys.

use crate::domain::ports::Credentials;
use crate::error::{Error, Result};
use k8s_openapi::api::core::v1::Secret;
use kube::{Api, Client};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

pub const ACCESS_KEY_ID: &str = "accessKeyID";
pub const SECRET_ACCESS_KEY: &str = "secretAccessKey";
pub const REGION: &str = "region";
pub const ENDPOINT: &str = "endpoint";

/// Reference to a Kubernetes Secret
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecretRef {
    pub namespace: String,
    pub name: String,
}

/// Where a request's credentials come from
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialSource {
    /// Inline secret map, takes precedence over `secret_ref`
    #[serde(default, skip_serializing)]
    pub secrets: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_ref: Option<SecretRef>,
}

impl Credentials {
    /// Read credentials from a secret map
    pub fn from_secrets(secrets: &BTreeMap<String, String>) -> Result<Self> {
        let get = |key: &str| secrets.get(key).cloned().unwrap_or_default();
        let credentials = Credentials {
            access_key_id: get(ACCESS_KEY_ID),
            secret_access_key: get(SECRET_ACCESS_KEY),
            region: get(REGION),
            endpoint: get(ENDPOINT),
        };
        if credentials.access_key_id.is_empty() || credentials.secret_access_key.is_empty() {
            return Err(Error::InvalidArgument(format!(
                "secret must contain {} and {}",
                ACCESS_KEY_ID, SECRET_ACCESS_KEY
            )));
        }
        Ok(credentials)
    }
}

/// Resolves a [`CredentialSource`] into [`Credentials`]
#[derive(Clone, Default)]
pub struct SecretResolver {
    client: Option<Client>,
}

impl SecretResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable Secret references
    pub fn with_client(mut self, client: Client) -> Self {
        self.client = Some(client);
        self
    }

    pub async fn resolve(&self, source: &CredentialSource) -> Result<Credentials> {
        if !source.secrets.is_empty() {
            return Credentials::from_secrets(&source.secrets);
        }
        let Some(secret_ref) = &source.secret_ref else {
            return Err(Error::InvalidArgument("credentials missing in request".into()));
        };
        let Some(client) = &self.client else {
            return Err(Error::Configuration(format!(
                "cannot read secret {}/{} without a Kubernetes client",
                secret_ref.namespace, secret_ref.name
            )));
        };

        debug!("Reading credentials from secret {}/{}", secret_ref.namespace, secret_ref.name);
        let api: Api<Secret> = Api::namespaced(client.clone(), &secret_ref.namespace);
        let secret = api.get(&secret_ref.name).await?;
        Credentials::from_secrets(&secret_data(secret))
    }
}

/// Flatten `data` and `stringData`; undecodable values are skipped
fn secret_data(secret: Secret) -> BTreeMap<String, String> {
    let mut map: BTreeMap<String, String> = secret
        .data
        .unwrap_or_default()
        .into_iter()
        .filter_map(|(k, v)| String::from_utf8(v.0).ok().map(|v| (k, v)))
        .collect();
    map.extend(secret.string_data.unwrap_or_default());
    map
}
