//! Proxy core: the ordered request pipeline and upstream forwarding.

mod error;
pub mod flush;
mod handler;
mod upstream;

pub use error::{ProxyError, DENIED_FACET_ANNOTATION, PROTOCOL_ERROR_ANNOTATION};
pub use flush::{ProxyBody, StreamTracker};
pub use upstream::{Presentation, UpstreamClient};

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::audit::AuditPipeline;
use crate::auth::{
    AuthChain, Authenticator, OidcAuthenticator, TokenReviewAuthenticator, TokenReviewClient,
    TokenReviewer,
};
use crate::client_ip::ClientIpResolver;
use crate::config::{ConfigError, ProxyConfig};
use crate::impersonation::{AccessReviewer, ImpersonationAuthorizer, SubjectAccessReviewClient};
use crate::kube::ApiClient;
use crate::shutdown::ShutdownHooks;

pub const AUDIT_ID_HEADER: &str = "audit-id";

/// Name of the pre-shutdown hook that flushes the audit backend.
pub const AUDIT_SHUTDOWN_HOOK: &str = "audit-backend";

/// How long the audit hook waits for open response streams to close.
pub const STREAM_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Review clients used in place of the control-plane defaults.
#[derive(Default, Clone)]
pub struct Reviewers {
    pub token: Option<Arc<dyn TokenReviewer>>,
    pub access: Option<Arc<dyn AccessReviewer>>,
}

pub struct Proxy {
    config: Arc<ProxyConfig>,
    client_ip: ClientIpResolver,
    auth_chain: AuthChain,
    impersonation: ImpersonationAuthorizer,
    audit: Arc<AuditPipeline>,
    upstream: UpstreamClient,
}

impl Proxy {
    /// Validates every collaborator eagerly so no request ever sees a
    /// configuration error. Registers the audit flush as a pre-shutdown hook.
    pub async fn new(
        config: Arc<ProxyConfig>,
        reviewers: Reviewers,
        hooks: &ShutdownHooks,
    ) -> Result<Self, ConfigError> {
        let oidc_config = config.oidc.as_ref().ok_or(ConfigError::OidcNotConfigured)?;
        let oidc = OidcAuthenticator::new(oidc_config).await?;

        let api = ApiClient::new(&config.upstream)?;

        let token_reviewer = reviewers.token.unwrap_or_else(|| {
            Arc::new(TokenReviewClient::new(
                api.clone(),
                config.token_review_audiences.clone(),
            ))
        });
        let access_reviewer = reviewers
            .access
            .unwrap_or_else(|| Arc::new(SubjectAccessReviewClient::new(api.clone())));

        let auth_chain = AuthChain::new(vec![
            Arc::new(oidc) as Arc<dyn Authenticator>,
            Arc::new(TokenReviewAuthenticator::new(token_reviewer)),
        ]);

        let audit = Arc::new(
            AuditPipeline::from_config(&config.audit)
                .map_err(|e| ConfigError::Audit(e.to_string()))?,
        );
        let upstream = UpstreamClient::new(&api, &config);
        register_audit_hook(
            hooks,
            Arc::clone(&audit),
            upstream.streams().clone(),
            STREAM_DRAIN_TIMEOUT,
        )
        .await;

        info!(
            upstream = %config.upstream.url,
            authenticators = auth_chain.len(),
            audit_enabled = audit.is_enabled(),
            impersonate_caller = config.impersonate_caller,
            "Proxy constructed"
        );

        Ok(Self::from_parts(
            Arc::clone(&config),
            auth_chain,
            ImpersonationAuthorizer::new(access_reviewer),
            audit,
            upstream,
        ))
    }

    pub(crate) fn from_parts(
        config: Arc<ProxyConfig>,
        auth_chain: AuthChain,
        impersonation: ImpersonationAuthorizer,
        audit: Arc<AuditPipeline>,
        upstream: UpstreamClient,
    ) -> Self {
        Self {
            client_ip: ClientIpResolver::new(config.trusted_subnets.clone()),
            config,
            auth_chain,
            impersonation,
            audit,
            upstream,
        }
    }

    /// The audit pipeline, for driving its delivery loop.
    pub fn audit(&self) -> Arc<AuditPipeline> {
        Arc::clone(&self.audit)
    }
}

/// Flushes the audit backend at shutdown, after response streams still
/// relaying have closed their records or `drain_timeout` has passed.
pub(crate) async fn register_audit_hook(
    hooks: &ShutdownHooks,
    audit: Arc<AuditPipeline>,
    streams: StreamTracker,
    drain_timeout: Duration,
) {
    hooks
        .add_pre_shutdown_hook(AUDIT_SHUTDOWN_HOOK, move || {
            let audit = Arc::clone(&audit);
            let streams = streams.clone();
            async move {
                if tokio::time::timeout(drain_timeout, streams.wait_idle()).await.is_err() {
                    warn!(
                        active = streams.active(),
                        "Response streams still open, flushing audit backend anyway"
                    );
                }
                audit.shutdown().await.map_err(anyhow::Error::from)
            }
        })
        .await;
}
