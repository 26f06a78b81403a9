use std::path::PathBuf;
use std::time::Duration;

use ipnet::IpNet;
use thiserror::Error;

/// One day.
pub const MAX_REQUEST_TIMEOUT_SECS: u64 = 86_400;

/// Errors detected while loading or validating configuration.
///
/// These are fatal to startup and are never retried.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {name}: {reason}")]
    InvalidValue { name: &'static str, reason: String },

    #[error("{0} is required")]
    Missing(&'static str),

    #[error("file not found or unreadable for {name}: {path:?}: {reason}")]
    UnreadableFile {
        name: &'static str,
        path: PathBuf,
        reason: String,
    },

    #[error("OIDC options are not configured")]
    OidcNotConfigured,

    #[error("invalid OIDC issuer {issuer:?}: {reason}")]
    InvalidIssuer { issuer: String, reason: String },

    #[error("TLS configuration error: {0}")]
    Tls(String),

    #[error("audit configuration error: {0}")]
    Audit(String),
}

#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Serving parameters (listen address and TLS)
    pub serving: ServingConfig,

    /// Upstream control-plane API connection
    pub upstream: UpstreamConfig,

    /// OIDC verification options; `None` when no issuer is configured
    pub oidc: Option<OidcConfig>,

    /// Audiences submitted with every token review
    pub token_review_audiences: Vec<String>,

    /// Audit backends and signing
    pub audit: AuditConfig,

    /// Peers allowed to claim a forwarded client address. Empty trusts every peer.
    pub trusted_subnets: Vec<IpNet>,

    /// Present the authenticated caller to the upstream through impersonation
    /// headers even when it did not request impersonation
    pub impersonate_caller: bool,

    /// Default per-request deadline in seconds
    pub request_timeout_secs: u64,

    /// Maximum request body size in bytes
    pub max_body_size_bytes: usize,

    /// Interval at which partially written responses are flushed to the client.
    /// Zero flushes after every chunk.
    pub flush_interval_ms: u64,

    /// Log level
    pub log_level: String,
}

#[derive(Debug, Clone)]
pub struct ServingConfig {
    /// Listen host address
    pub host: String,

    /// Listen port
    pub port: u16,

    /// TLS certificate path; plaintext HTTP when unset
    pub tls_cert_path: Option<PathBuf>,

    /// TLS private key path
    pub tls_key_path: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    /// Control-plane API base URL
    pub url: String,

    /// CA bundle used to verify the upstream
    pub ca_path: Option<PathBuf>,

    /// The proxy's own bearer credential
    pub token: Option<String>,

    /// File holding the proxy's own bearer credential
    pub token_path: Option<PathBuf>,

    /// Skip upstream certificate verification
    pub insecure_skip_verify: bool,
}

#[derive(Debug, Clone)]
pub struct OidcConfig {
    pub issuer_url: String,
    pub client_id: String,
    pub ca_path: Option<PathBuf>,
    /// Extra accepted audiences besides the client id
    pub audiences: Vec<String>,
    pub username_claim: String,
    pub username_prefix: Option<String>,
    pub groups_claim: String,
    pub groups_prefix: Option<String>,
    pub signing_algorithms: Vec<SigningAlgorithm>,
    pub jwks_refresh_interval: Duration,
}

impl Default for OidcConfig {
    fn default() -> Self {
        Self {
            issuer_url: String::new(),
            client_id: String::new(),
            ca_path: None,
            audiences: Vec::new(),
            username_claim: "sub".to_string(),
            username_prefix: None,
            groups_claim: "groups".to_string(),
            groups_prefix: None,
            signing_algorithms: vec![SigningAlgorithm::RS256],
            jwks_refresh_interval: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AuditConfig {
    /// JSON-lines log destination; `-` writes to stdout
    pub log_path: Option<PathBuf>,

    /// Webhook receiving batches of records
    pub webhook_url: Option<String>,

    pub webhook_batch_size: usize,

    pub webhook_batch_interval_ms: u64,

    /// Records buffered for webhook delivery before new ones are dropped
    pub buffer_size: usize,

    /// HMAC key for record signatures, raw or `base64:<key>`
    pub hmac_secret: Option<String>,

    /// Request paths that produce no audit record
    pub omit_paths: Vec<String>,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            log_path: None,
            webhook_url: None,
            webhook_batch_size: 400,
            webhook_batch_interval_ms: 1_000,
            buffer_size: 10_000,
            hmac_secret: None,
            omit_paths: default_omit_paths(),
        }
    }
}

impl AuditConfig {
    pub fn is_enabled(&self) -> bool {
        self.log_path.is_some() || self.webhook_url.is_some()
    }
}

fn default_omit_paths() -> Vec<String> {
    vec![
        "/healthz".to_string(),
        "/readyz".to_string(),
        "/livez".to_string(),
    ]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SigningAlgorithm {
    RS256,
    RS384,
    RS512,
    PS256,
    PS384,
    PS512,
    ES256,
    ES384,
}

impl Default for SigningAlgorithm {
    fn default() -> Self {
        SigningAlgorithm::RS256
    }
}

impl std::str::FromStr for SigningAlgorithm {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "RS256" => Ok(SigningAlgorithm::RS256),
            "RS384" => Ok(SigningAlgorithm::RS384),
            "RS512" => Ok(SigningAlgorithm::RS512),
            "PS256" => Ok(SigningAlgorithm::PS256),
            "PS384" => Ok(SigningAlgorithm::PS384),
            "PS512" => Ok(SigningAlgorithm::PS512),
            "ES256" => Ok(SigningAlgorithm::ES256),
            "ES384" => Ok(SigningAlgorithm::ES384),
            _ => Err(ConfigError::InvalidValue {
                name: "OIDC_SIGNING_ALGS",
                reason: format!("unsupported signing algorithm: {}", s),
            }),
        }
    }
}

impl From<SigningAlgorithm> for jsonwebtoken::Algorithm {
    fn from(alg: SigningAlgorithm) -> Self {
        match alg {
            SigningAlgorithm::RS256 => jsonwebtoken::Algorithm::RS256,
            SigningAlgorithm::RS384 => jsonwebtoken::Algorithm::RS384,
            SigningAlgorithm::RS512 => jsonwebtoken::Algorithm::RS512,
            SigningAlgorithm::PS256 => jsonwebtoken::Algorithm::PS256,
            SigningAlgorithm::PS384 => jsonwebtoken::Algorithm::PS384,
            SigningAlgorithm::PS512 => jsonwebtoken::Algorithm::PS512,
            SigningAlgorithm::ES256 => jsonwebtoken::Algorithm::ES256,
            SigningAlgorithm::ES384 => jsonwebtoken::Algorithm::ES384,
        }
    }
}

impl ProxyConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let serving = ServingConfig {
            host: env_or("PROXY_HOST", "0.0.0.0"),
            port: parse_env("PROXY_PORT", "8443")?,
            tls_cert_path: env_path("TLS_CERT_PATH"),
            tls_key_path: env_path("TLS_KEY_PATH"),
        };

        let upstream = UpstreamConfig {
            url: env_or("UPSTREAM_URL", "https://kubernetes.default.svc"),
            ca_path: env_path("UPSTREAM_CA_PATH"),
            token: env_opt("UPSTREAM_TOKEN"),
            token_path: env_path("UPSTREAM_TOKEN_PATH"),
            insecure_skip_verify: parse_env("UPSTREAM_INSECURE_SKIP_VERIFY", "false")?,
        };

        let oidc = match env_opt("OIDC_ISSUER_URL") {
            Some(issuer_url) => {
                let defaults = OidcConfig::default();
                let signing_algorithms = match env_opt("OIDC_SIGNING_ALGS") {
                    Some(algs) => split_list(&algs)
                        .iter()
                        .map(|alg| alg.parse())
                        .collect::<Result<Vec<_>, _>>()?,
                    None => defaults.signing_algorithms,
                };

                Some(OidcConfig {
                    issuer_url,
                    client_id: env_or("OIDC_CLIENT_ID", ""),
                    ca_path: env_path("OIDC_CA_PATH"),
                    audiences: env_opt("OIDC_AUDIENCES")
                        .map(|v| split_list(&v))
                        .unwrap_or_default(),
                    username_claim: env_or("OIDC_USERNAME_CLAIM", &defaults.username_claim),
                    username_prefix: env_opt("OIDC_USERNAME_PREFIX"),
                    groups_claim: env_or("OIDC_GROUPS_CLAIM", &defaults.groups_claim),
                    groups_prefix: env_opt("OIDC_GROUPS_PREFIX"),
                    signing_algorithms,
                    jwks_refresh_interval: defaults.jwks_refresh_interval,
                })
            }
            None => None,
        };

        let audit_defaults = AuditConfig::default();
        let audit = AuditConfig {
            log_path: env_path("AUDIT_LOG_PATH"),
            webhook_url: env_opt("AUDIT_WEBHOOK_URL"),
            webhook_batch_size: parse_env(
                "AUDIT_WEBHOOK_BATCH_SIZE",
                &audit_defaults.webhook_batch_size.to_string(),
            )?,
            webhook_batch_interval_ms: parse_env(
                "AUDIT_WEBHOOK_BATCH_INTERVAL_MS",
                &audit_defaults.webhook_batch_interval_ms.to_string(),
            )?,
            buffer_size: parse_env("AUDIT_BUFFER_SIZE", &audit_defaults.buffer_size.to_string())?,
            hmac_secret: env_opt("AUDIT_HMAC_SECRET"),
            omit_paths: env_opt("AUDIT_OMIT_PATHS")
                .map(|v| split_list(&v))
                .unwrap_or(audit_defaults.omit_paths),
        };

        let trusted_subnets = match env_opt("TRUSTED_SUBNETS") {
            Some(value) => parse_subnets(&value)?,
            None => Vec::new(),
        };

        Ok(Self {
            serving,
            upstream,
            oidc,
            token_review_audiences: env_opt("TOKEN_REVIEW_AUDIENCES")
                .map(|v| split_list(&v))
                .unwrap_or_default(),
            audit,
            trusted_subnets,
            impersonate_caller: parse_env("IMPERSONATE_CALLER", "false")?,
            request_timeout_secs: parse_env("REQUEST_TIMEOUT_SECS", "60")?,
            max_body_size_bytes: parse_env("MAX_BODY_SIZE_BYTES", "10485760")?,
            flush_interval_ms: parse_env("FLUSH_INTERVAL_MS", "1000")?,
            log_level: env_or("LOG_LEVEL", "info"),
        })
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        match (&self.serving.tls_cert_path, &self.serving.tls_key_path) {
            (Some(cert), Some(key)) => {
                ensure_readable("TLS_CERT_PATH", cert)?;
                ensure_readable("TLS_KEY_PATH", key)?;
            }
            (Some(_), None) => return Err(ConfigError::Missing("TLS_KEY_PATH")),
            (None, Some(_)) => return Err(ConfigError::Missing("TLS_CERT_PATH")),
            (None, None) => {}
        }

        if self.upstream.url.is_empty() {
            return Err(ConfigError::Missing("UPSTREAM_URL"));
        }
        url::Url::parse(&self.upstream.url).map_err(|e| ConfigError::InvalidValue {
            name: "UPSTREAM_URL",
            reason: e.to_string(),
        })?;
        if let Some(ref path) = self.upstream.ca_path {
            ensure_readable("UPSTREAM_CA_PATH", path)?;
        }
        if let Some(ref path) = self.upstream.token_path {
            ensure_readable("UPSTREAM_TOKEN_PATH", path)?;
        }

        if let Some(ref oidc) = self.oidc {
            if oidc.client_id.is_empty() {
                return Err(ConfigError::Missing("OIDC_CLIENT_ID"));
            }
            if oidc.signing_algorithms.is_empty() {
                return Err(ConfigError::Missing("OIDC_SIGNING_ALGS"));
            }
        }

        if self.request_timeout_secs == 0 {
            return Err(ConfigError::InvalidValue {
                name: "REQUEST_TIMEOUT_SECS",
                reason: "must be greater than 0".to_string(),
            });
        }
        if self.request_timeout_secs > MAX_REQUEST_TIMEOUT_SECS {
            return Err(ConfigError::InvalidValue {
                name: "REQUEST_TIMEOUT_SECS",
                reason: format!("must be at most {}", MAX_REQUEST_TIMEOUT_SECS),
            });
        }

        if self.max_body_size_bytes == 0 {
            return Err(ConfigError::InvalidValue {
                name: "MAX_BODY_SIZE_BYTES",
                reason: "must be greater than 0".to_string(),
            });
        }

        if self.audit.webhook_url.is_some() {
            if self.audit.webhook_batch_size == 0 {
                return Err(ConfigError::InvalidValue {
                    name: "AUDIT_WEBHOOK_BATCH_SIZE",
                    reason: "must be greater than 0".to_string(),
                });
            }
            if self.audit.buffer_size == 0 {
                return Err(ConfigError::InvalidValue {
                    name: "AUDIT_BUFFER_SIZE",
                    reason: "must be greater than 0".to_string(),
                });
            }
        }

        Ok(())
    }

    /// Get request timeout as Duration
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    /// Get the listen address
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.serving.host, self.serving.port)
    }
}

/// Parse a comma-separated list of CIDR ranges. Bare addresses become host routes.
pub fn parse_subnets(value: &str) -> Result<Vec<IpNet>, ConfigError> {
    split_list(value)
        .iter()
        .map(|entry| {
            entry
                .parse::<IpNet>()
                .or_else(|_| entry.parse::<std::net::IpAddr>().map(IpNet::from))
                .map_err(|_| ConfigError::InvalidValue {
                    name: "TRUSTED_SUBNETS",
                    reason: format!("not a CIDR range: {}", entry),
                })
        })
        .collect()
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn ensure_readable(name: &'static str, path: &PathBuf) -> Result<(), ConfigError> {
    std::fs::metadata(path)
        .map(|_| ())
        .map_err(|e| ConfigError::UnreadableFile {
            name,
            path: path.clone(),
            reason: e.to_string(),
        })
}

fn env_opt(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn env_or(name: &str, default: &str) -> String {
    env_opt(name).unwrap_or_else(|| default.to_string())
}

fn env_path(name: &str) -> Option<PathBuf> {
    env_opt(name).map(PathBuf::from)
}

fn parse_env<T>(name: &'static str, default: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    env_or(name, default)
        .parse()
        .map_err(|e: T::Err| ConfigError::InvalidValue {
            name,
            reason: e.to_string(),
        })
}
