//! HTTP client for the Vault key-value and token endpoints the tool needs:
//! fetching secrets, renewing the token lease, and checking renewability.

use std::collections::HashMap;

use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use crate::config::VaultConfig;
use crate::supervise::renew::RenewLease;

#[derive(Debug, Error)]
pub enum VaultError {
    #[error("vault request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("vault server error (HTTP status {status}): empty response")]
    EmptyResponse { status: StatusCode },
    #[error("vault server error: {}", .0.join(","))]
    Server(Vec<String>),
    #[error("invalid vault response: {0}")]
    Decode(#[source] serde_json::Error),
}

/// Secret lookups return loosely-typed data: keys are always strings but
/// values can be strings, numbers, booleans, or nested structures.
#[derive(Debug, Deserialize)]
struct SecretResponse {
    #[serde(default)]
    errors: Vec<String>,
    #[serde(default)]
    data: HashMap<String, Value>,
    #[serde(default)]
    lease_duration: u64,
}

#[derive(Debug, Deserialize)]
struct RenewResponse {
    #[serde(default)]
    errors: Vec<String>,
    #[serde(default)]
    auth: RenewAuth,
}

#[derive(Debug, Default, Deserialize)]
struct RenewAuth {
    #[serde(default)]
    lease_duration: u64,
}

#[derive(Debug, Deserialize)]
struct LookupResponse {
    #[serde(default)]
    errors: Vec<String>,
    #[serde(default)]
    data: LookupData,
}

#[derive(Debug, Default, Deserialize)]
struct LookupData {
    #[serde(default)]
    renewable: bool,
}

pub struct VaultClient {
    http: Client,
    address: String,
    token: String,
}

impl VaultClient {
    pub fn new(config: &VaultConfig) -> Result<Self, VaultError> {
        let http = Client::builder().build()?;
        Ok(Self {
            http,
            address: config.address.clone(),
            token: config.token.clone(),
        })
    }

    async fn request(&self, method: Method, path: &str) -> Result<Vec<u8>, VaultError> {
        let url = format!("{}/{}", self.address, path);
        let response = self
            .http
            .request(method, url)
            .header("X-Vault-Token", &self.token)
            .send()
            .await?;

        let status = response.status();
        let body = response.bytes().await?;
        if body.is_empty() {
            return Err(VaultError::EmptyResponse { status });
        }
        Ok(body.to_vec())
    }

    async fn secrets_at_path(&self, path: &str) -> Result<SecretResponse, VaultError> {
        let body = self.request(Method::GET, &format!("v1/{}", path)).await?;
        let response: SecretResponse =
            serde_json::from_slice(&body).map_err(VaultError::Decode)?;
        check_errors(response.errors.clone())?;
        Ok(response)
    }

    /// Fetch every configured secret path, in order, and merge the results
    /// into one map. Later paths win on key collision. Also returns the last
    /// reported lease duration, seeding the renewal loop's initial state.
    pub async fn secrets(
        &self,
        paths: &[String],
    ) -> Result<(HashMap<String, Value>, u64), VaultError> {
        let mut merged = HashMap::new();
        let mut lease_duration = 0;

        for path in paths {
            let response = self.secrets_at_path(path).await?;
            merged.extend(response.data);
            lease_duration = response.lease_duration;
        }

        Ok((merged, lease_duration))
    }

    async fn renew_token(&self) -> Result<u64, VaultError> {
        let body = self
            .request(Method::POST, "v1/auth/token/renew-self")
            .await?;
        let response: RenewResponse =
            serde_json::from_slice(&body).map_err(VaultError::Decode)?;
        check_errors(response.errors)?;
        Ok(response.auth.lease_duration)
    }

    /// Whether the configured token can be renewed at all.
    pub async fn renewable(&self) -> Result<bool, VaultError> {
        let body = self
            .request(Method::GET, "v1/auth/token/lookup-self")
            .await?;
        let response: LookupResponse =
            serde_json::from_slice(&body).map_err(VaultError::Decode)?;
        check_errors(response.errors)?;
        Ok(response.data.renewable)
    }
}

#[async_trait]
impl RenewLease for VaultClient {
    async fn renew(&self) -> anyhow::Result<u64> {
        Ok(self.renew_token().await?)
    }
}

fn check_errors(errors: Vec<String>) -> Result<(), VaultError> {
    if errors.is_empty() {
        Ok(())
    } else {
        Err(VaultError::Server(errors))
    }
}

/// Render fetched secrets as environment variable values: JSON strings are
/// injected verbatim, anything else as its compact JSON rendering.
pub fn secrets_to_env(secrets: HashMap<String, Value>) -> HashMap<String, String> {
    secrets
        .into_iter()
        .map(|(key, value)| {
            let rendered = match value {
                Value::String(s) => s,
                other => other.to_string(),
            };
            (key, rendered)
        })
        .collect()
}
