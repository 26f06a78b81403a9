use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use cluster_gate_auth_proxy::audit::{AuditRecord, AuditSigner};
use cluster_gate_auth_proxy::client_ip::{ClientIpResolver, X_FORWARDED_FOR};
use cluster_gate_auth_proxy::impersonation::{
    AccessReviewer, AuthorizationDecision, ImpersonationAuthorizer, ImpersonationCheck,
};
use cluster_gate_auth_proxy::kube::UpstreamError;
use cluster_gate_auth_proxy::Identity;
use http::{HeaderMap, HeaderValue};
use ipnet::IpNet;

/// Access reviewer that allows every impersonation without a network call.
pub struct AllowAll;

#[async_trait]
impl AccessReviewer for AllowAll {
    async fn review(
        &self,
        _requester: &Identity,
        _check: &ImpersonationCheck,
    ) -> Result<AuthorizationDecision, UpstreamError> {
        Ok(AuthorizationDecision::allow())
    }
}

pub struct PipelineBenchFixture {
    pub resolver: ClientIpResolver,
    pub authorizer: ImpersonationAuthorizer,
    pub signer: AuditSigner,
    pub requester: Identity,
}

impl PipelineBenchFixture {
    pub fn new() -> Result<Self> {
        let trusted = ["10.0.0.0/8", "192.168.0.0/16"]
            .iter()
            .map(|cidr| cidr.parse::<IpNet>())
            .collect::<Result<Vec<_>, _>>()
            .context("parse trusted subnets")?;

        Ok(Self {
            resolver: ClientIpResolver::new(trusted),
            authorizer: ImpersonationAuthorizer::new(Arc::new(AllowAll)),
            signer: AuditSigner::new("bench-secret-that-is-at-least-32-bytes-long")
                .context("build audit signer")?,
            requester: Identity::new("bench-user").with_groups(["system:authenticated"]),
        })
    }
}

/// `X-Forwarded-For` with `hops` entries, the client first.
pub fn forwarded_headers(hops: usize) -> HeaderMap {
    let chain = (0..hops)
        .map(|i| format!("10.0.{}.{}", i / 250, i % 250 + 1))
        .collect::<Vec<_>>();
    let mut value = String::from("203.0.113.9");
    for hop in chain {
        value.push_str(", ");
        value.push_str(&hop);
    }

    let mut headers = HeaderMap::new();
    if let Ok(value) = HeaderValue::from_str(&value) {
        headers.insert(X_FORWARDED_FOR, value);
    }
    headers
}

/// A full impersonation header set with `groups` groups and one extra.
pub fn impersonation_headers(groups: usize) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert("impersonate-user", HeaderValue::from_static("jane"));
    headers.insert("impersonate-uid", HeaderValue::from_static("1001"));
    headers.insert("impersonate-extra-scopes", HeaderValue::from_static("view"));
    for i in 0..groups {
        if let Ok(value) = HeaderValue::from_str(&format!("team-{}", i)) {
            headers.append("impersonate-group", value);
        }
    }
    headers
}

pub fn sample_record() -> AuditRecord {
    let mut record = AuditRecord::new(
        "00000000-0000-4000-8000-000000000000".to_string(),
        "/api/v1/namespaces/default/pods?limit=500".to_string(),
        "list".to_string(),
    );
    record.user = Some(Identity::new("bench-user").with_groups(["dev", "system:authenticated"]));
    record.source_ips = vec!["203.0.113.9".to_string(), "10.0.0.1".to_string()];
    record
        .annotations
        .insert("proxy.cluster-gate.dev/forwarded-by".to_string(), "10.0.0.1".to_string());
    record
}
