//! Ordered authenticator chain.
//!
//! Authenticators are tried in order. The first identity wins; "not
//! applicable" and rejections both fall through to the next entry. When
//! every entry declines, the last rejection is returned.

use std::sync::Arc;

use http::HeaderMap;
use tracing::debug;

use super::{AuthError, AuthOutcome, Authenticator, Identity};

pub struct AuthChain {
    authenticators: Vec<Arc<dyn Authenticator>>,
}

impl AuthChain {
    pub fn new(authenticators: Vec<Arc<dyn Authenticator>>) -> Self {
        Self { authenticators }
    }

    pub fn len(&self) -> usize {
        self.authenticators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.authenticators.is_empty()
    }

    pub async fn authenticate(&self, headers: &HeaderMap) -> Result<Identity, AuthError> {
        let mut last_error = None;

        for authenticator in &self.authenticators {
            match authenticator.authenticate(headers).await {
                Ok(AuthOutcome::Authenticated(identity)) => {
                    debug!(
                        authenticator = authenticator.name(),
                        user = %identity.name,
                        "Request authenticated"
                    );
                    return Ok(identity);
                }
                Ok(AuthOutcome::NotApplicable) => {
                    debug!(authenticator = authenticator.name(), "Not applicable");
                }
                Err(e) => {
                    debug!(authenticator = authenticator.name(), error = %e, "Rejected");
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or(AuthError::MissingCredential))
    }
}
