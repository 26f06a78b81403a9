use async_trait::async_trait;
use k8s_openapi::api::authorization::v1::{
    ResourceAttributes, SubjectAccessReview, SubjectAccessReviewSpec,
};
use tracing::{debug, instrument};

use super::Facet;
use crate::auth::Identity;
use crate::kube::{ApiClient, UpstreamError, REVIEW_TIMEOUT, SUBJECT_ACCESS_REVIEW_PATH};

pub const IMPERSONATE_VERB: &str = "impersonate";

/// One `impersonate` permission to check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImpersonationCheck {
    pub facet: Facet,
    /// Value being impersonated.
    pub name: String,
    /// Extra key for `userextras` checks.
    pub subresource: Option<String>,
}

impl ImpersonationCheck {
    pub fn new(facet: Facet, name: impl Into<String>) -> Self {
        Self {
            facet,
            name: name.into(),
            subresource: None,
        }
    }

    pub fn extra(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            facet: Facet::Extra,
            name: value.into(),
            subresource: Some(key.into()),
        }
    }

    /// `userextras/<key>` for extras, the plain resource otherwise.
    pub fn resource_path(&self) -> String {
        match self.subresource {
            Some(ref key) => format!("{}/{}", self.facet.resource(), key),
            None => self.facet.resource().to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizationDecision {
    pub allowed: bool,
    /// Why the check was denied; may be empty.
    pub reason: String,
}

impl AuthorizationDecision {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            reason: String::new(),
        }
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: reason.into(),
        }
    }
}

/// Answers whether `requester` may impersonate one facet.
#[async_trait]
pub trait AccessReviewer: Send + Sync {
    async fn review(
        &self,
        requester: &Identity,
        check: &ImpersonationCheck,
    ) -> Result<AuthorizationDecision, UpstreamError>;
}

/// [`AccessReviewer`] backed by the SubjectAccessReview API.
pub struct SubjectAccessReviewClient {
    api: ApiClient,
}

impl SubjectAccessReviewClient {
    pub fn new(api: ApiClient) -> Self {
        Self { api }
    }
}

fn build_review(requester: &Identity, check: &ImpersonationCheck) -> SubjectAccessReview {
    SubjectAccessReview {
        metadata: Default::default(),
        spec: SubjectAccessReviewSpec {
            user: Some(requester.name.clone()),
            groups: Some(requester.groups.iter().cloned().collect()),
            uid: requester.uid.clone(),
            extra: (!requester.extra.is_empty()).then(|| requester.extra.clone()),
            resource_attributes: Some(ResourceAttributes {
                verb: Some(IMPERSONATE_VERB.to_string()),
                group: Some(check.facet.api_group().to_string()),
                resource: Some(check.facet.resource().to_string()),
                subresource: check.subresource.clone(),
                name: Some(check.name.clone()),
                ..Default::default()
            }),
            ..Default::default()
        },
        status: None,
    }
}

#[async_trait]
impl AccessReviewer for SubjectAccessReviewClient {
    #[instrument(skip_all, fields(requester = %requester.name, resource = %check.resource_path()))]
    async fn review(
        &self,
        requester: &Identity,
        check: &ImpersonationCheck,
    ) -> Result<AuthorizationDecision, UpstreamError> {
        let response = self
            .api
            .post_review(
                SUBJECT_ACCESS_REVIEW_PATH,
                &build_review(requester, check),
                REVIEW_TIMEOUT,
            )
            .await?;

        let status = response.status.ok_or_else(|| {
            UpstreamError::InvalidResponse("access review returned no status".to_string())
        })?;

        let decision = if status.allowed {
            AuthorizationDecision::allow()
        } else {
            let reason = status
                .reason
                .filter(|r| !r.is_empty())
                .or(status.evaluation_error)
                .unwrap_or_default();
            AuthorizationDecision::deny(reason)
        };

        debug!(allowed = decision.allowed, "access review completed");
        Ok(decision)
    }
}
