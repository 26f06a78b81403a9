//! Authorization of client-requested impersonation.

mod access_review;
mod authorizer;
mod error;
pub mod headers;

pub use access_review::{
    AccessReviewer, AuthorizationDecision, ImpersonationCheck, SubjectAccessReviewClient,
    IMPERSONATE_VERB,
};
pub use authorizer::ImpersonationAuthorizer;
pub use error::{Facet, ImpersonationError};
pub use headers::{ImpersonationHeader, ImpersonationRequest};
