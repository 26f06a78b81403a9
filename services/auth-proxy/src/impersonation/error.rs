use std::fmt;

use thiserror::Error;

use super::headers::IMPERSONATE_USER;
use crate::kube::UpstreamError;

/// The part of an identity an impersonation header asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Facet {
    User,
    Group,
    Uid,
    Extra,
}

impl Facet {
    /// Resource named in the access review.
    pub fn resource(&self) -> &'static str {
        match self {
            Facet::User => "users",
            Facet::Group => "groups",
            Facet::Uid => "uids",
            Facet::Extra => "userextras",
        }
    }

    /// API group named in the access review.
    pub fn api_group(&self) -> &'static str {
        match self {
            Facet::User | Facet::Group => "",
            Facet::Uid | Facet::Extra => "authentication.k8s.io",
        }
    }
}

impl fmt::Display for Facet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.resource())
    }
}

#[derive(Debug, Error)]
pub enum ImpersonationError {
    #[error("impersonation requires the {} header", IMPERSONATE_USER)]
    MissingTargetUser,

    #[error("{0} may only be specified once")]
    DuplicateHeader(&'static str),

    #[error("invalid value for impersonation header {0}")]
    InvalidHeaderValue(String),

    #[error("unknown impersonation header {0}")]
    UnknownHeader(String),

    #[error("{requester:?} cannot impersonate {resource} {value:?}{}", reason_suffix(.reason))]
    Denied {
        requester: String,
        facet: Facet,
        resource: String,
        value: String,
        reason: String,
    },

    #[error("impersonation check failed: {0}")]
    Upstream(#[from] UpstreamError),
}

fn reason_suffix(reason: &str) -> String {
    if reason.is_empty() {
        String::new()
    } else {
        format!(": {}", reason)
    }
}

impl ImpersonationError {
    /// Malformed header sets, as opposed to denials or failed checks.
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            ImpersonationError::MissingTargetUser
                | ImpersonationError::DuplicateHeader(_)
                | ImpersonationError::InvalidHeaderValue(_)
                | ImpersonationError::UnknownHeader(_)
        )
    }

    pub fn facet(&self) -> Option<Facet> {
        match self {
            ImpersonationError::Denied { facet, .. } => Some(*facet),
            _ => None,
        }
    }
}
