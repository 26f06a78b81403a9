use std::sync::Arc;

use http::HeaderMap;
use tracing::{debug, info, instrument, warn};

use super::access_review::{AccessReviewer, ImpersonationCheck};
use super::headers::{strip_impersonation_headers, ImpersonationRequest};
use super::{Facet, ImpersonationError};
use crate::auth::{Identity, SYSTEM_AUTHENTICATED};
use crate::kube::{UpstreamError, REVIEW_TIMEOUT};

/// Verifies every facet a caller asks to impersonate.
pub struct ImpersonationAuthorizer {
    reviewer: Arc<dyn AccessReviewer>,
}

impl ImpersonationAuthorizer {
    pub fn new(reviewer: Arc<dyn AccessReviewer>) -> Self {
        Self { reviewer }
    }

    /// Returns `Ok(None)` and leaves `headers` untouched when no
    /// impersonation was requested. On success the whole header family is
    /// removed from `headers` and the verified target is returned. Checks run
    /// user, groups, uid, extras in that order and stop at the first denial.
    #[instrument(skip_all, fields(requester = %requester.name))]
    pub async fn check_authorized_for_impersonation(
        &self,
        headers: &mut HeaderMap,
        requester: &Identity,
    ) -> Result<Option<Identity>, ImpersonationError> {
        let Some(request) = ImpersonationRequest::parse(headers)? else {
            return Ok(None);
        };

        let Some(ref user) = request.user else {
            warn!("impersonation headers without a target user");
            return Err(ImpersonationError::MissingTargetUser);
        };

        self.check(requester, ImpersonationCheck::new(Facet::User, user.as_str()))
            .await?;
        let mut target = Identity::new(user.as_str());

        for group in &request.groups {
            self.check(requester, ImpersonationCheck::new(Facet::Group, group.as_str()))
                .await?;
        }

        if let Some(ref uid) = request.uid {
            self.check(requester, ImpersonationCheck::new(Facet::Uid, uid.as_str()))
                .await?;
            target = target.with_uid(uid.as_str());
        }

        for (key, values) in &request.extra {
            for value in values {
                self.check(requester, ImpersonationCheck::extra(key.as_str(), value.as_str()))
                    .await?;
            }
        }

        if let Some(name) = request.unknown.first() {
            return Err(ImpersonationError::UnknownHeader(name.clone()));
        }

        target = target.with_groups(request.groups.iter().cloned());
        if !target.is_anonymous() {
            target = target.with_groups([SYSTEM_AUTHENTICATED]);
        }
        for (key, values) in request.extra {
            target = target.with_extra(key, values);
        }

        strip_impersonation_headers(headers);

        info!(
            requester = %requester.name,
            target = %target.name,
            groups = ?target.groups,
            "Impersonation authorized"
        );
        Ok(Some(target))
    }

    async fn check(
        &self,
        requester: &Identity,
        check: ImpersonationCheck,
    ) -> Result<(), ImpersonationError> {
        let review = self.reviewer.review(requester, &check);
        let decision = match tokio::time::timeout(REVIEW_TIMEOUT, review).await {
            Ok(result) => result?,
            Err(_) => return Err(UpstreamError::Timeout.into()),
        };

        if decision.allowed {
            debug!(
                resource = %check.resource_path(),
                value = %check.name,
                "Impersonation facet allowed"
            );
            return Ok(());
        }

        warn!(
            requester = %requester.name,
            resource = %check.resource_path(),
            value = %check.name,
            reason = %decision.reason,
            "Impersonation denied"
        );
        Err(ImpersonationError::Denied {
            requester: requester.name.clone(),
            facet: check.facet,
            resource: check.resource_path(),
            value: check.name,
            reason: decision.reason,
        })
    }
}
