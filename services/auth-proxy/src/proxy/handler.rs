use std::fmt::Display;
use std::time::Duration;

use bytes::Bytes;
use http::header::CONTENT_TYPE;
use http::request::Parts;
use http::{HeaderValue, Request, Response, StatusCode, Uri};
use http_body_util::Full;
use hyper::body::Body;
use tokio::time::{timeout_at, Instant};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use super::flush::{full_body, Completion, ProxyBody};
use super::upstream::Presentation;
use super::{Proxy, ProxyError, AUDIT_ID_HEADER};
use crate::audit::request_info::{query_param, RequestInfo};
use crate::audit::{AuditContext, Outcome};
use crate::auth::{AuthError, Identity};
use crate::client_ip::forwarded_by;
use crate::impersonation::ImpersonationError;
use crate::kube::UpstreamError;
use crate::server::PeerInfo;

const HEALTH_PATHS: &[&str] = &["/healthz", "/readyz", "/livez"];

// Roughly 30 years.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// Who the request ran as, for the completion log line.
#[derive(Default)]
struct Principals {
    user: Option<String>,
    impersonated: Option<String>,
}

impl Proxy {
    /// Runs one request through the pipeline. Failures are rendered as
    /// `Status` responses; nothing escapes as an error.
    #[instrument(skip_all, fields(audit_id = tracing::field::Empty, method = %req.method(), path = %req.uri().path()))]
    pub async fn handle_request<B>(&self, req: Request<B>, peer: &PeerInfo) -> Response<ProxyBody>
    where
        B: Body<Data = Bytes> + Send,
        B::Error: Display,
    {
        let start = std::time::Instant::now();
        let (mut parts, body) = req.into_parts();

        if let Some(response) = health_response(&parts) {
            return response;
        }

        let audit_id = Uuid::new_v4().to_string();
        tracing::Span::current().record("audit_id", audit_id.as_str());

        let client_addr = self.client_ip.resolve(peer.addr, &parts.headers);
        let forwarded = forwarded_by(peer.addr, &parts.headers);
        let mut audit = self.audit.begin(
            &audit_id,
            &parts.method,
            &parts.uri,
            &parts.headers,
            client_addr,
            &forwarded,
        );
        if let Some(ref mut ctx) = audit {
            if !forwarded.is_empty() {
                ctx.annotate("proxy.cluster-gate.dev/forwarded-by", forwarded.as_str());
            }
        }

        let deadline = deadline_after(self.request_timeout(&parts.uri));
        let mut principals = Principals::default();

        let result = self
            .process(&mut parts, body, peer, deadline, &mut audit, &mut principals)
            .await;

        let mut response = match result {
            Ok(response) => response,
            Err(err) => {
                let status = err.status_code();
                warn!(
                    client = %client_addr,
                    status = status.as_u16(),
                    protocol_error = err.is_protocol_error(),
                    error = %err,
                    "Request rejected"
                );
                if let Some(mut ctx) = audit.take() {
                    for (key, value) in err.audit_annotations() {
                        ctx.annotate(key, value);
                    }
                    ctx.finish(err.outcome(), status.as_u16(), Some(err.to_string()));
                }
                err.to_response(Some(&audit_id)).map(full_body)
            }
        };

        if let Ok(value) = HeaderValue::from_str(&audit_id) {
            response.headers_mut().insert(AUDIT_ID_HEADER, value);
        }

        info!(
            method = %parts.method,
            path = %parts.uri.path(),
            status = response.status().as_u16(),
            user = principals.user.as_deref().unwrap_or("-"),
            impersonated_user = principals.impersonated.as_deref().unwrap_or("-"),
            client = %client_addr,
            latency_ms = start.elapsed().as_millis(),
            "Request completed"
        );

        response
    }

    async fn process<B>(
        &self,
        parts: &mut Parts,
        body: B,
        peer: &PeerInfo,
        deadline: Instant,
        audit: &mut Option<AuditContext>,
        principals: &mut Principals,
    ) -> Result<Response<ProxyBody>, ProxyError>
    where
        B: Body<Data = Bytes> + Send,
        B::Error: Display,
    {
        let user = timeout_at(deadline, self.auth_chain.authenticate(&parts.headers))
            .await
            .unwrap_or(Err(AuthError::Timeout))?;
        principals.user = Some(user.name.clone());
        if let Some(ctx) = audit.as_mut() {
            ctx.set_user(&user);
        }

        let target = timeout_at(
            deadline,
            self.impersonation
                .check_authorized_for_impersonation(&mut parts.headers, &user),
        )
        .await
        .unwrap_or(Err(ImpersonationError::Upstream(UpstreamError::Timeout)))?;

        if let Some(ref target) = target {
            principals.impersonated = Some(target.name.clone());
            if let Some(ctx) = audit.as_mut() {
                ctx.set_impersonated_user(target);
            }
        }

        let presentation = self.presentation(user, target);

        let body = timeout_at(deadline, self.upstream.read_body(body))
            .await
            .unwrap_or(Err(ProxyError::Timeout))?;

        let upstream_response = timeout_at(
            deadline,
            self.upstream
                .send(parts, body, &presentation, peer.addr, peer.tls),
        )
        .await
        .unwrap_or(Err(ProxyError::Timeout))?;

        let status = upstream_response.status().as_u16();
        let long_running = RequestInfo::from_parts(&parts.method, &parts.uri).long_running;
        let completion = match audit.take() {
            Some(ctx) if long_running => {
                ctx.finish(Outcome::Forwarded, status, None);
                None
            }
            Some(ctx) => Some(complete_on_body_end(ctx, status)),
            None => None,
        };

        let body_deadline = (!long_running).then_some(deadline);
        Ok(self
            .upstream
            .into_client_response(upstream_response, body_deadline, completion))
    }

    /// The identity the upstream should see and how it is conveyed.
    fn presentation(&self, user: Identity, target: Option<Identity>) -> Presentation {
        match target {
            Some(target) => Presentation::Impersonating(target),
            None if self.config.impersonate_caller => Presentation::Impersonating(user),
            None => Presentation::AsCaller,
        }
    }

    /// Configured timeout, shortened by a `timeout=` query parameter.
    fn request_timeout(&self, uri: &Uri) -> Duration {
        let configured = self.config.request_timeout();
        uri.query()
            .and_then(|q| query_param(q, "timeout"))
            .and_then(parse_timeout)
            .map_or(configured, |requested| requested.min(configured))
    }
}

/// Saturates instead of overflowing for very long timeouts.
fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout)
        .or_else(|| now.checked_add(FAR_FUTURE))
        .unwrap_or(now)
}

/// Closes the audit record once the response body has been fully relayed.
fn complete_on_body_end(ctx: AuditContext, status: u16) -> Completion {
    Box::new(move |result: Result<(), String>| match result {
        Ok(()) => ctx.finish(Outcome::Forwarded, status, None),
        Err(reason) => ctx.finish(Outcome::Error, status, Some(reason)),
    })
}

fn health_response(parts: &Parts) -> Option<Response<ProxyBody>> {
    if !HEALTH_PATHS.contains(&parts.uri.path()) {
        return None;
    }
    let mut response = Response::new(full_body(Full::new(Bytes::from_static(b"ok"))));
    *response.status_mut() = StatusCode::OK;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
    Some(response)
}

/// Accepts `30`, `30s`, `5m` and `1h`. Zero is ignored.
fn parse_timeout(value: &str) -> Option<Duration> {
    let value = value.trim();
    let (digits, unit) = match value.char_indices().find(|(_, c)| !c.is_ascii_digit()) {
        Some((idx, _)) => value.split_at(idx),
        None => (value, "s"),
    };
    let amount: u64 = digits.parse().ok()?;
    let seconds = match unit {
        "s" => amount,
        "m" => amount.checked_mul(60)?,
        "h" => amount.checked_mul(3600)?,
        _ => return None,
    };
    (seconds > 0).then(|| Duration::from_secs(seconds))
}
