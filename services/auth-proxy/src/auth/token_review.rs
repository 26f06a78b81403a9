//! Opaque bearer credential validation through the TokenReview API.

use std::sync::Arc;

use async_trait::async_trait;
use http::HeaderMap;
use k8s_openapi::api::authentication::v1::{TokenReview, TokenReviewSpec, TokenReviewStatus};
use tracing::{debug, instrument, warn};

use super::{extract_bearer_token, AuthError, AuthOutcome, Authenticator, Identity};
use crate::kube::{ApiClient, UpstreamError, REVIEW_TIMEOUT, TOKEN_REVIEW_PATH};

/// Validates a request's bearer credential.
///
/// `Ok(None)` means the credential is missing or was not authenticated.
/// `Err` means no decision could be reached.
#[async_trait]
pub trait TokenReviewer: Send + Sync {
    async fn review(&self, headers: &HeaderMap) -> Result<Option<Identity>, AuthError>;
}

pub struct TokenReviewClient {
    api: ApiClient,
    audiences: Vec<String>,
}

impl TokenReviewClient {
    pub fn new(api: ApiClient, audiences: Vec<String>) -> Self {
        Self { api, audiences }
    }

    fn identity_from_status(&self, status: TokenReviewStatus) -> Result<Option<Identity>, AuthError> {
        if let Some(error) = status.error.filter(|e| !e.is_empty()) {
            return Err(AuthError::Upstream(UpstreamError::InvalidResponse(error)));
        }

        if !status.authenticated.unwrap_or(false) {
            debug!("token review returned unauthenticated");
            return Ok(None);
        }

        if !self.audiences.is_empty() {
            let granted = status.audiences.unwrap_or_default();
            if !granted.iter().any(|aud| self.audiences.contains(aud)) {
                warn!(granted = ?granted, "token review audiences do not match");
                return Ok(None);
            }
        }

        Ok(status.user.and_then(Identity::from_user_info))
    }
}

#[async_trait]
impl TokenReviewer for TokenReviewClient {
    #[instrument(skip_all)]
    async fn review(&self, headers: &HeaderMap) -> Result<Option<Identity>, AuthError> {
        let Some(token) = extract_bearer_token(headers) else {
            return Ok(None);
        };

        let request = TokenReview {
            metadata: Default::default(),
            spec: TokenReviewSpec {
                token: Some(token.to_string()),
                audiences: (!self.audiences.is_empty()).then(|| self.audiences.clone()),
            },
            status: None,
        };

        let response = self
            .api
            .post_review(TOKEN_REVIEW_PATH, &request, REVIEW_TIMEOUT)
            .await?;

        match response.status {
            Some(status) => self.identity_from_status(status),
            None => Err(AuthError::Upstream(UpstreamError::InvalidResponse(
                "token review returned no status".to_string(),
            ))),
        }
    }
}

/// Adapts a [`TokenReviewer`] to the authenticator chain. Missing or
/// unauthenticated credentials are definitive rejections here.
pub struct TokenReviewAuthenticator {
    reviewer: Arc<dyn TokenReviewer>,
}

impl TokenReviewAuthenticator {
    pub fn new(reviewer: Arc<dyn TokenReviewer>) -> Self {
        Self { reviewer }
    }
}

#[async_trait]
impl Authenticator for TokenReviewAuthenticator {
    fn name(&self) -> &'static str {
        "token-review"
    }

    async fn authenticate(&self, headers: &HeaderMap) -> Result<AuthOutcome, AuthError> {
        if extract_bearer_token(headers).is_none() {
            return Err(AuthError::MissingCredential);
        }

        match self.reviewer.review(headers).await? {
            Some(identity) => Ok(AuthOutcome::Authenticated(identity)),
            None => Err(AuthError::Unauthenticated(
                "token was not authenticated".to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UpstreamConfig;
    use http::HeaderValue;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(url: &str, audiences: Vec<String>) -> TokenReviewClient {
        let api = ApiClient::new(&UpstreamConfig {
            url: url.to_string(),
            ca_path: None,
            token: Some("proxy-token".to_string()),
            token_path: None,
            insecure_skip_verify: false,
        })
        .unwrap();
        TokenReviewClient::new(api, audiences)
    }

    fn bearer(token: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            "authorization",
            HeaderValue::from_str(&format!("Bearer {}", token)).unwrap(),
        );
        headers
    }

    fn review_response(status: serde_json::Value) -> ResponseTemplate {
        ResponseTemplate::new(201).set_body_json(json!({
            "apiVersion": "authentication.k8s.io/v1",
            "kind": "TokenReview",
            "spec": {},
            "status": status,
        }))
    }

    #[tokio::test]
    async fn test_authenticated_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(TOKEN_REVIEW_PATH))
            .and(body_partial_json(json!({"spec": {"token": "sa-token"}})))
            .respond_with(review_response(json!({
                "authenticated": true,
                "user": {
                    "username": "system:serviceaccount:ci:runner",
                    "uid": "42",
                    "groups": ["system:serviceaccounts", "system:serviceaccounts:ci"]
                }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let identity = client(&server.uri(), vec![])
            .review(&bearer("sa-token"))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(identity.name, "system:serviceaccount:ci:runner");
        assert_eq!(identity.uid.as_deref(), Some("42"));
        assert!(identity.in_group("system:serviceaccounts:ci"));
    }

    #[tokio::test]
    async fn test_unauthenticated_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(review_response(json!({"authenticated": false})))
            .mount(&server)
            .await;

        let result = client(&server.uri(), vec![])
            .review(&bearer("expired"))
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_missing_bearer_makes_no_call() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(review_response(json!({"authenticated": true})))
            .expect(0)
            .mount(&server)
            .await;

        let result = client(&server.uri(), vec![])
            .review(&HeaderMap::new())
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_review_error_is_surfaced() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(review_response(json!({
                "authenticated": false,
                "error": "webhook authenticator unavailable"
            })))
            .mount(&server)
            .await;

        let err = client(&server.uri(), vec![])
            .review(&bearer("token"))
            .await
            .unwrap_err();
        assert!(err.is_indeterminate());
        assert!(err.to_string().contains("webhook authenticator unavailable"));
    }

    #[tokio::test]
    async fn test_audiences_must_intersect() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"spec": {"audiences": ["cluster-gate"]}})))
            .respond_with(review_response(json!({
                "authenticated": true,
                "audiences": ["some-other-api"],
                "user": {"username": "bob"}
            })))
            .mount(&server)
            .await;

        let result = client(&server.uri(), vec!["cluster-gate".to_string()])
            .review(&bearer("token"))
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_authenticator_rejects_unauthenticated() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(review_response(json!({"authenticated": false})))
            .mount(&server)
            .await;

        let authenticator =
            TokenReviewAuthenticator::new(Arc::new(client(&server.uri(), vec![])));

        assert!(matches!(
            authenticator.authenticate(&bearer("token")).await,
            Err(AuthError::Unauthenticated(_))
        ));
        assert!(matches!(
            authenticator.authenticate(&HeaderMap::new()).await,
            Err(AuthError::MissingCredential)
        ));
    }
}
