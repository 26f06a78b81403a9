//! Signed ID token verification against a single OIDC issuer.
//!
//! The issuer is discovered once at construction; any failure there is a
//! configuration error. Tokens that are not JWTs, or that name a different
//! issuer, are left to the next authenticator in the chain.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use http::HeaderMap;
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{Map, Value};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, instrument, warn};

use super::{extract_bearer_token, AuthError, AuthOutcome, Authenticator, Identity};
use crate::config::{ConfigError, OidcConfig};
use crate::kube::{load_ca_bundle, UpstreamError};

const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(10);

/// Username prefix value that disables prefixing.
const NO_PREFIX: &str = "-";

#[derive(Debug, Deserialize)]
struct OidcDiscovery {
    issuer: String,
    jwks_uri: String,
}

#[derive(Debug, Deserialize)]
struct JwksDocument {
    keys: Vec<JwkKey>,
}

#[derive(Debug, Deserialize)]
struct JwkKey {
    kty: String,
    kid: Option<String>,
    n: Option<String>,
    e: Option<String>,
    crv: Option<String>,
    x: Option<String>,
    y: Option<String>,
}

/// Groups claim can be a single string or an array
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(untagged)]
enum GroupsClaim {
    #[default]
    None,
    Single(String),
    Multiple(Vec<String>),
}

impl GroupsClaim {
    fn into_vec(self) -> Vec<String> {
        match self {
            GroupsClaim::None => vec![],
            GroupsClaim::Single(s) => vec![s],
            GroupsClaim::Multiple(v) => v,
        }
    }
}

struct JwksCache {
    keys: Vec<(Option<String>, DecodingKey)>,
    last_refresh: Instant,
}

impl JwksCache {
    fn candidates(&self, kid: Option<&str>) -> Vec<DecodingKey> {
        self.keys
            .iter()
            .filter(|(key_id, _)| kid.is_none() || key_id.as_deref() == kid)
            .map(|(_, key)| key.clone())
            .collect()
    }
}

pub struct OidcAuthenticator {
    config: OidcConfig,
    http_client: Client,
    jwks_uri: String,
    audiences: Vec<String>,
    algorithms: Vec<Algorithm>,
    jwks: RwLock<JwksCache>,
    /// Held while fetching the JWKS so only one refresh runs at a time.
    refresh: Mutex<()>,
}

impl OidcAuthenticator {
    /// Discover the issuer and load its signing keys.
    pub async fn new(config: &OidcConfig) -> Result<Self, ConfigError> {
        validate_issuer(&config.issuer_url)?;

        let mut builder = Client::builder().timeout(DISCOVERY_TIMEOUT);
        if let Some(ref ca_path) = config.ca_path {
            for cert in load_ca_bundle("OIDC_CA_PATH", ca_path)? {
                builder = builder.add_root_certificate(cert);
            }
        }
        let http_client = builder
            .build()
            .map_err(|e| ConfigError::Tls(format!("failed to build OIDC client: {}", e)))?;

        let invalid = |reason: String| ConfigError::InvalidIssuer {
            issuer: config.issuer_url.clone(),
            reason,
        };

        let discovery_url = format!(
            "{}/.well-known/openid-configuration",
            config.issuer_url.trim_end_matches('/')
        );
        debug!(url = %discovery_url, "Fetching OIDC discovery document");

        let discovery: OidcDiscovery = http_client
            .get(&discovery_url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| invalid(format!("discovery failed: {}", e)))?
            .json()
            .await
            .map_err(|e| invalid(format!("invalid discovery document: {}", e)))?;

        if discovery.issuer != config.issuer_url {
            return Err(invalid(format!(
                "discovery document names issuer {}",
                discovery.issuer
            )));
        }

        let keys = fetch_jwks(&http_client, &discovery.jwks_uri)
            .await
            .map_err(invalid)?;

        info!(
            issuer = %config.issuer_url,
            key_count = keys.len(),
            "OIDC issuer discovered"
        );

        let mut audiences = vec![config.client_id.clone()];
        audiences.extend(config.audiences.iter().cloned());

        Ok(Self {
            config: config.clone(),
            http_client,
            jwks_uri: discovery.jwks_uri,
            audiences,
            algorithms: config
                .signing_algorithms
                .iter()
                .map(|alg| (*alg).into())
                .collect(),
            jwks: RwLock::new(JwksCache {
                keys,
                last_refresh: Instant::now(),
            }),
            refresh: Mutex::new(()),
        })
    }

    /// Keys for `kid`, refreshing the key set once when none match and the
    /// last refresh is older than the refresh interval. Concurrent callers
    /// wait for a refresh already in progress instead of starting another.
    async fn decoding_keys(&self, kid: Option<&str>) -> Result<Vec<DecodingKey>, AuthError> {
        if let Some(keys) = self.cached_keys(kid).await? {
            return Ok(keys);
        }

        let _refreshing = self.refresh.lock().await;
        if let Some(keys) = self.cached_keys(kid).await? {
            return Ok(keys);
        }

        debug!(kid = ?kid, "Unknown signing key, refreshing JWKS");
        let keys = fetch_jwks(&self.http_client, &self.jwks_uri)
            .await
            .map_err(|e| AuthError::Upstream(UpstreamError::Unreachable(e)))?;
        let mut cache = self.jwks.write().await;
        *cache = JwksCache {
            keys,
            last_refresh: Instant::now(),
        };
        let keys = cache.candidates(kid);
        if keys.is_empty() {
            return Err(unknown_key(kid));
        }
        Ok(keys)
    }

    /// `Some` when the cache has keys for `kid`, `None` when a refresh is
    /// due, and an error when it has none and was refreshed recently.
    async fn cached_keys(&self, kid: Option<&str>) -> Result<Option<Vec<DecodingKey>>, AuthError> {
        let cache = self.jwks.read().await;
        let keys = cache.candidates(kid);
        if !keys.is_empty() {
            return Ok(Some(keys));
        }
        if cache.last_refresh.elapsed() >= self.config.jwks_refresh_interval {
            Ok(None)
        } else {
            Err(unknown_key(kid))
        }
    }

    fn identity_from_claims(&self, claims: Map<String, Value>) -> Result<Identity, AuthError> {
        let claim = &self.config.username_claim;
        let raw_username = claims
            .get(claim)
            .and_then(Value::as_str)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| AuthError::InvalidToken(format!("missing claim {}", claim)))?;

        if claim == "email" && is_false(claims.get("email_verified")) {
            return Err(AuthError::InvalidToken("email not verified".to_string()));
        }

        let name = match self.config.username_prefix.as_deref() {
            Some(NO_PREFIX) => raw_username.to_string(),
            Some(prefix) => format!("{}{}", prefix, raw_username),
            None if claim == "email" => raw_username.to_string(),
            None => format!("{}#{}", self.config.issuer_url, raw_username),
        };

        let groups = claims
            .get(&self.config.groups_claim)
            .cloned()
            .and_then(|v| serde_json::from_value::<GroupsClaim>(v).ok())
            .unwrap_or_default()
            .into_vec()
            .into_iter()
            .map(|g| match self.config.groups_prefix {
                Some(ref prefix) => format!("{}{}", prefix, g),
                None => g,
            });

        let mut identity = Identity::new(name).with_groups(groups);
        if let Some(sub) = claims.get("sub").and_then(Value::as_str) {
            identity = identity.with_uid(sub);
        }
        Ok(identity)
    }
}

#[async_trait]
impl Authenticator for OidcAuthenticator {
    fn name(&self) -> &'static str {
        "oidc"
    }

    #[instrument(skip_all, fields(issuer = %self.config.issuer_url))]
    async fn authenticate(&self, headers: &HeaderMap) -> Result<AuthOutcome, AuthError> {
        let Some(token) = extract_bearer_token(headers) else {
            return Ok(AuthOutcome::NotApplicable);
        };

        let Ok(header) = decode_header(token) else {
            return Ok(AuthOutcome::NotApplicable);
        };

        if unverified_issuer(token).as_deref() != Some(self.config.issuer_url.as_str()) {
            return Ok(AuthOutcome::NotApplicable);
        }

        if !self.algorithms.contains(&header.alg) {
            return Err(AuthError::InvalidToken(format!(
                "signing algorithm {:?} is not accepted",
                header.alg
            )));
        }

        let mut validation = Validation::new(header.alg);
        validation.set_issuer(&[&self.config.issuer_url]);
        validation.set_audience(&self.audiences);
        validation.validate_exp = true;

        let mut last_error = None;
        for key in self.decoding_keys(header.kid.as_deref()).await? {
            match decode::<Map<String, Value>>(token, &key, &validation) {
                Ok(data) => {
                    let identity = self.identity_from_claims(data.claims)?;
                    debug!(user = %identity.name, "Validated OIDC token");
                    return Ok(AuthOutcome::Authenticated(identity));
                }
                Err(e) => last_error = Some(e),
            }
        }

        let err = last_error.map(AuthError::from).unwrap_or_else(|| {
            AuthError::InvalidToken("no usable signing key".to_string())
        });
        warn!(error = %err, "OIDC token rejected");
        Err(err)
    }
}

fn validate_issuer(issuer: &str) -> Result<(), ConfigError> {
    let invalid = |reason: &str| ConfigError::InvalidIssuer {
        issuer: issuer.to_string(),
        reason: reason.to_string(),
    };

    if issuer.trim().is_empty() {
        return Err(invalid("issuer URL is empty"));
    }
    let url = url::Url::parse(issuer).map_err(|e| invalid(&e.to_string()))?;
    match url.scheme() {
        "https" | "http" => Ok(()),
        _ => Err(invalid("issuer URL must use https")),
    }
}

/// The `iss` claim read without verifying the signature.
fn unverified_issuer(token: &str) -> Option<String> {
    let payload = token.split('.').nth(1)?;
    let bytes = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
    let claims: Map<String, Value> = serde_json::from_slice(&bytes).ok()?;
    claims.get("iss")?.as_str().map(str::to_string)
}

fn is_false(value: Option<&Value>) -> bool {
    match value {
        Some(Value::Bool(b)) => !b,
        Some(Value::String(s)) => s.eq_ignore_ascii_case("false"),
        _ => false,
    }
}

fn unknown_key(kid: Option<&str>) -> AuthError {
    AuthError::InvalidToken(format!("no signing key found for kid {:?}", kid))
}

async fn fetch_jwks(
    client: &Client,
    jwks_uri: &str,
) -> Result<Vec<(Option<String>, DecodingKey)>, String> {
    debug!(url = %jwks_uri, "Fetching JWKS");

    let document: JwksDocument = client
        .get(jwks_uri)
        .send()
        .await
        .and_then(|r| r.error_for_status())
        .map_err(|e| format!("failed to fetch JWKS: {}", e))?
        .json()
        .await
        .map_err(|e| format!("invalid JWKS response: {}", e))?;

    let keys: Vec<_> = document
        .keys
        .into_iter()
        .filter_map(|jwk| {
            let key = jwk_to_decoding_key(&jwk)?;
            Some((jwk.kid, key))
        })
        .collect();

    if keys.is_empty() {
        return Err("no usable keys found in JWKS".to_string());
    }
    Ok(keys)
}

fn jwk_to_decoding_key(jwk: &JwkKey) -> Option<DecodingKey> {
    let result = match jwk.kty.as_str() {
        "RSA" => DecodingKey::from_rsa_components(jwk.n.as_deref()?, jwk.e.as_deref()?),
        "EC" => match jwk.crv.as_deref()? {
            "P-256" | "P-384" => DecodingKey::from_ec_components(jwk.x.as_deref()?, jwk.y.as_deref()?),
            crv => {
                warn!(crv = %crv, "Unsupported EC curve");
                return None;
            }
        },
        kty => {
            warn!(kty = %kty, "Unsupported key type");
            return None;
        }
    };

    match result {
        Ok(key) => Some(key),
        Err(e) => {
            warn!(kid = ?jwk.kid, error = %e, "Skipping invalid JWK");
            None
        }
    }
}
