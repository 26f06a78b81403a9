mod chain;
mod error;
mod identity;
mod oidc;
mod token_review;

pub use chain::AuthChain;
pub use error::AuthError;
pub use identity::{Identity, SYSTEM_ANONYMOUS, SYSTEM_AUTHENTICATED};
pub use oidc::OidcAuthenticator;
pub use token_review::{TokenReviewAuthenticator, TokenReviewClient, TokenReviewer};

use async_trait::async_trait;
use http::HeaderMap;

pub const AUTHORIZATION_HEADER: &str = "Authorization";

/// Result of asking one authenticator about a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthOutcome {
    Authenticated(Identity),
    /// The credential is not one this authenticator understands.
    NotApplicable,
}

#[async_trait]
pub trait Authenticator: Send + Sync {
    fn name(&self) -> &'static str;

    /// A definitive rejection is returned as `Err`.
    async fn authenticate(&self, headers: &HeaderMap) -> Result<AuthOutcome, AuthError>;
}

/// Extract the bearer credential. The scheme is matched case-insensitively
/// and an empty credential counts as absent.
pub fn extract_bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(AUTHORIZATION_HEADER)?.to_str().ok()?.trim();
    let (scheme, token) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}
