//! Minimal client for the control-plane review APIs.

use std::time::{Duration, Instant};

use reqwest::{Certificate, Client};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, instrument};

use crate::config::{ConfigError, UpstreamConfig};

pub const TOKEN_REVIEW_PATH: &str = "/apis/authentication.k8s.io/v1/tokenreviews";
pub const SUBJECT_ACCESS_REVIEW_PATH: &str = "/apis/authorization.k8s.io/v1/subjectaccessreviews";

/// Ceiling applied to every review call regardless of the request deadline.
pub const REVIEW_TIMEOUT: Duration = Duration::from_secs(10);

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// A control-plane call that could not produce a decision.
#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("control plane unreachable: {0}")]
    Unreachable(String),

    #[error("control plane call timed out")]
    Timeout,

    #[error("control plane returned {status}: {message}")]
    Status { status: u16, message: String },

    #[error("invalid control plane response: {0}")]
    InvalidResponse(String),
}

impl From<reqwest::Error> for UpstreamError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            UpstreamError::Timeout
        } else if err.is_decode() {
            UpstreamError::InvalidResponse(err.to_string())
        } else {
            UpstreamError::Unreachable(err.to_string())
        }
    }
}

/// Shared connection to the upstream API.
///
/// The same connection pool carries review calls and forwarded traffic.
#[derive(Clone)]
pub struct ApiClient {
    http_client: Client,
    base_url: String,
    token: Option<String>,
}

impl ApiClient {
    pub fn new(config: &UpstreamConfig) -> Result<Self, ConfigError> {
        let mut builder = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .pool_max_idle_per_host(20)
            .user_agent(concat!("cluster-gate-auth-proxy/", env!("CARGO_PKG_VERSION")));

        if let Some(ref ca_path) = config.ca_path {
            for cert in load_ca_bundle("UPSTREAM_CA_PATH", ca_path)? {
                builder = builder.add_root_certificate(cert);
            }
        }

        if config.insecure_skip_verify {
            builder = builder.danger_accept_invalid_certs(true);
        }

        let http_client = builder.build().map_err(|e| ConfigError::InvalidValue {
            name: "UPSTREAM_URL",
            reason: format!("failed to build HTTP client: {}", e),
        })?;

        let token = match (&config.token, &config.token_path) {
            (Some(token), _) => Some(token.trim().to_string()),
            (None, Some(path)) => {
                let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::UnreadableFile {
                    name: "UPSTREAM_TOKEN_PATH",
                    path: path.clone(),
                    reason: e.to_string(),
                })?;
                Some(raw.trim().to_string())
            }
            (None, None) => None,
        }
        .filter(|t| !t.is_empty());

        Ok(Self {
            http_client,
            base_url: config.url.trim_end_matches('/').to_string(),
            token,
        })
    }

    pub fn http_client(&self) -> &Client {
        &self.http_client
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// The proxy's own credential.
    pub fn bearer_token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    /// POST a review object and decode the populated review from the response.
    #[instrument(skip(self, review), fields(path = %path))]
    pub async fn post_review<T>(
        &self,
        path: &str,
        review: &T,
        timeout: Duration,
    ) -> Result<T, UpstreamError>
    where
        T: Serialize + DeserializeOwned,
    {
        let url = format!("{}{}", self.base_url, path);
        let mut request = self.http_client.post(&url).json(review).timeout(timeout);
        if let Some(ref token) = self.token {
            request = request.bearer_auth(token);
        }

        let start = Instant::now();
        let response = request.send().await?;
        let status = response.status();

        debug!(
            status = status.as_u16(),
            latency_ms = start.elapsed().as_millis(),
            "review call completed"
        );

        if !status.is_success() {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown error".to_string());
            return Err(UpstreamError::Status {
                status: status.as_u16(),
                message,
            });
        }

        response
            .json::<T>()
            .await
            .map_err(|e| UpstreamError::InvalidResponse(e.to_string()))
    }
}

/// Parse every certificate in a PEM bundle.
pub(crate) fn load_ca_bundle(
    name: &'static str,
    path: &std::path::Path,
) -> Result<Vec<Certificate>, ConfigError> {
    let pem = std::fs::read(path).map_err(|e| ConfigError::UnreadableFile {
        name,
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;

    let certs = Certificate::from_pem_bundle(&pem).map_err(|e| ConfigError::InvalidValue {
        name,
        reason: format!("invalid PEM bundle: {}", e),
    })?;

    if certs.is_empty() {
        return Err(ConfigError::InvalidValue {
            name,
            reason: "no certificates found".to_string(),
        });
    }

    Ok(certs)
}
