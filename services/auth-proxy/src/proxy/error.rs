use bytes::Bytes;
use http::header::CONTENT_TYPE;
use http::{HeaderValue, Response, StatusCode};
use http_body_util::Full;
use serde_json::json;
use thiserror::Error;

use crate::audit::Outcome;
use crate::auth::AuthError;
use crate::impersonation::ImpersonationError;

pub const PROTOCOL_ERROR_ANNOTATION: &str = "proxy.cluster-gate.dev/impersonation-protocol-error";
pub const DENIED_FACET_ANNOTATION: &str = "proxy.cluster-gate.dev/impersonation-denied-facet";

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("Authentication failed: {0}")]
    Auth(#[from] AuthError),

    #[error("Impersonation rejected: {0}")]
    Impersonation(#[from] ImpersonationError),

    #[error("Upstream request failed: {0}")]
    Upstream(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Body too large: {size} bytes exceeds limit of {limit} bytes")]
    BodyTooLarge { size: usize, limit: usize },

    #[error("Request timeout")]
    Timeout,
}

impl ProxyError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyError::Auth(e) if e.is_indeterminate() => StatusCode::SERVICE_UNAVAILABLE,
            ProxyError::Auth(_) => StatusCode::UNAUTHORIZED,
            ProxyError::Impersonation(ImpersonationError::Upstream(_)) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ProxyError::Impersonation(_) => StatusCode::FORBIDDEN,
            ProxyError::Upstream(_) => StatusCode::BAD_GATEWAY,
            ProxyError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ProxyError::BodyTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            ProxyError::Timeout => StatusCode::GATEWAY_TIMEOUT,
        }
    }

    /// Terminal audit outcome for a request that ended with this error.
    pub fn outcome(&self) -> Outcome {
        match self {
            ProxyError::Auth(_) => Outcome::Unauthenticated,
            ProxyError::Impersonation(ImpersonationError::Upstream(_)) => Outcome::Error,
            ProxyError::Impersonation(_) => Outcome::ImpersonationDenied,
            _ => Outcome::Error,
        }
    }

    /// Malformed impersonation headers, kept apart from denials in logs
    /// and audit annotations.
    pub fn is_protocol_error(&self) -> bool {
        matches!(self, ProxyError::Impersonation(e) if e.is_protocol_error())
    }

    /// Audit annotations naming what kind of impersonation rejection this was.
    pub fn audit_annotations(&self) -> Vec<(&'static str, String)> {
        let ProxyError::Impersonation(err) = self else {
            return Vec::new();
        };
        if err.is_protocol_error() {
            return vec![(PROTOCOL_ERROR_ANNOTATION, "true".to_string())];
        }
        err.facet()
            .map(|facet| vec![(DENIED_FACET_ANNOTATION, facet.to_string())])
            .unwrap_or_default()
    }

    fn reason(&self) -> &'static str {
        match self.status_code() {
            StatusCode::BAD_REQUEST => "BadRequest",
            StatusCode::UNAUTHORIZED => "Unauthorized",
            StatusCode::FORBIDDEN => "Forbidden",
            StatusCode::PAYLOAD_TOO_LARGE => "RequestEntityTooLarge",
            StatusCode::SERVICE_UNAVAILABLE => "ServiceUnavailable",
            StatusCode::GATEWAY_TIMEOUT => "Timeout",
            _ => "InternalError",
        }
    }

    /// Message returned to the caller. Authentication details stay in the
    /// logs; denials name the exact facet and value.
    pub fn public_message(&self) -> String {
        match self {
            ProxyError::Auth(e) if !e.is_indeterminate() => "Unauthorized".to_string(),
            ProxyError::Impersonation(e) => e.to_string(),
            ProxyError::BodyTooLarge { size, limit } => {
                format!("Request body size {} exceeds limit {}", size, limit)
            }
            other => other.to_string(),
        }
    }

    /// Renders a `Status` document with the matching HTTP status.
    pub fn to_response(&self, audit_id: Option<&str>) -> Response<Full<Bytes>> {
        let status = self.status_code();
        let body_json = json!({
            "kind": "Status",
            "apiVersion": "v1",
            "metadata": {},
            "status": "Failure",
            "message": self.public_message(),
            "reason": self.reason(),
            "code": status.as_u16(),
        });

        let body = serde_json::to_vec(&body_json).unwrap_or_default();
        let mut response = Response::new(Full::new(Bytes::from(body)));
        *response.status_mut() = status;
        response
            .headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(value) = audit_id.and_then(|id| HeaderValue::from_str(id).ok()) {
            response.headers_mut().insert(super::AUDIT_ID_HEADER, value);
        }
        response
    }
}
