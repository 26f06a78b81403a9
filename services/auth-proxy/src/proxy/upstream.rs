use std::fmt::Display;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use http::header::{AUTHORIZATION, CONNECTION, CONTENT_LENGTH, CONTENT_TYPE, HOST};
use http::request::Parts;
use http::{HeaderMap, HeaderValue, Response};
use http_body_util::BodyExt;
use hyper::body::Body;
use reqwest::Client;
use tracing::{debug, info, instrument};

use super::flush::{flush_interval_for, flushing_body, Completion, ProxyBody, StreamTracker};
use super::ProxyError;
use crate::auth::Identity;
use crate::client_ip::X_FORWARDED_FOR;
use crate::config::ProxyConfig;
use crate::impersonation::headers::{insert_impersonation_headers, strip_impersonation_headers};
use crate::kube::ApiClient;

/// Hop-by-hop headers never forwarded in either direction.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

/// How the final identity is presented to the upstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Presentation {
    /// Forward the caller's own credential untouched.
    AsCaller,
    /// Use the proxy's credential plus one impersonation header set.
    Impersonating(Identity),
}

/// Forwards authenticated requests to the single upstream API.
pub struct UpstreamClient {
    http_client: Client,
    base_url: String,
    proxy_token: Option<String>,
    max_body_size_bytes: usize,
    flush_interval: Duration,
    streams: StreamTracker,
}

impl UpstreamClient {
    /// Shares the connection pool of the review client.
    pub fn new(api: &ApiClient, config: &ProxyConfig) -> Self {
        Self {
            http_client: api.http_client().clone(),
            base_url: api.base_url().to_string(),
            proxy_token: api.bearer_token().map(str::to_string),
            max_body_size_bytes: config.max_body_size_bytes,
            flush_interval: config.flush_interval(),
            streams: StreamTracker::new(),
        }
    }

    /// Response copies still relaying upstream bodies.
    pub fn streams(&self) -> &StreamTracker {
        &self.streams
    }

    /// Reads the inbound body, refusing anything over the size limit.
    pub async fn read_body<B>(&self, body: B) -> Result<Bytes, ProxyError>
    where
        B: Body<Data = Bytes>,
        B::Error: Display,
    {
        let limit = self.max_body_size_bytes;
        let mut collected = BytesMut::new();
        let mut body = std::pin::pin!(body);

        while let Some(frame) = body.frame().await {
            let frame = frame
                .map_err(|e| ProxyError::BadRequest(format!("Failed to read request body: {}", e)))?;
            if let Ok(data) = frame.into_data() {
                collected.extend_from_slice(&data);
                if collected.len() > limit {
                    return Err(ProxyError::BodyTooLarge {
                        size: collected.len(),
                        limit,
                    });
                }
            }
        }

        Ok(collected.freeze())
    }

    /// Sends the request and returns once the upstream answered with headers.
    #[instrument(skip_all, fields(method = %parts.method, path = %parts.uri.path()))]
    pub async fn send(
        &self,
        parts: &Parts,
        body: Bytes,
        presentation: &Presentation,
        peer: SocketAddr,
        tls: bool,
    ) -> Result<reqwest::Response, ProxyError> {
        let path_and_query = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let upstream_url = format!("{}{}", self.base_url, path_and_query);

        let headers = self.upstream_headers(&parts.headers, presentation, peer, tls)?;

        debug!(upstream_url = %upstream_url, "Forwarding request to upstream");

        let mut request = self
            .http_client
            .request(parts.method.clone(), &upstream_url)
            .headers(headers);
        if !body.is_empty() {
            request = request.body(body);
        }

        let start = Instant::now();
        let response = request
            .send()
            .await
            .map_err(|e| ProxyError::Upstream(format!("Upstream request failed: {}", e)))?;

        info!(
            status = response.status().as_u16(),
            latency_ms = start.elapsed().as_millis(),
            "Upstream response received"
        );
        Ok(response)
    }

    pub(crate) fn upstream_headers(
        &self,
        inbound: &HeaderMap,
        presentation: &Presentation,
        peer: SocketAddr,
        tls: bool,
    ) -> Result<HeaderMap, ProxyError> {
        let mut headers = sanitize_headers(inbound);
        headers.remove(HOST);
        // Recomputed from the buffered body.
        headers.remove(CONTENT_LENGTH);
        strip_impersonation_headers(&mut headers);

        if let Presentation::Impersonating(ref identity) = presentation {
            headers.remove(AUTHORIZATION);
            if let Some(ref token) = self.proxy_token {
                let value = HeaderValue::from_str(&format!("Bearer {}", token))
                    .map_err(|_| ProxyError::Upstream("invalid upstream credential".to_string()))?;
                headers.insert(AUTHORIZATION, value);
            }
            insert_impersonation_headers(&mut headers, identity)?;
        }

        let mut chain: Vec<&str> = inbound
            .get_all(X_FORWARDED_FOR)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .collect();
        let peer_ip = peer.ip().to_string();
        chain.push(&peer_ip);
        let forwarded_for = chain.join(", ");
        if let Ok(value) = HeaderValue::from_str(&forwarded_for) {
            headers.insert(X_FORWARDED_FOR, value);
        }
        headers.insert(
            "x-forwarded-proto",
            HeaderValue::from_static(if tls { "https" } else { "http" }),
        );
        if let Some(host) = inbound.get(HOST) {
            headers.insert("x-forwarded-host", host.clone());
        }

        Ok(headers)
    }

    /// Converts the upstream response into a streamed client response.
    /// Relays the upstream response. `body_deadline` bounds the body copy;
    /// long-running responses pass `None`.
    pub fn into_client_response(
        &self,
        response: reqwest::Response,
        body_deadline: Option<tokio::time::Instant>,
        completion: Option<Completion>,
    ) -> Response<ProxyBody> {
        let status = response.status();
        let headers = sanitize_headers(response.headers());
        let interval = flush_interval_for(
            self.flush_interval,
            headers.get(CONTENT_TYPE).and_then(|v| v.to_str().ok()),
        );

        let body = flushing_body(
            response.bytes_stream(),
            interval,
            body_deadline,
            completion,
            self.streams.track(),
        );
        let mut client_response = Response::new(body);
        *client_response.status_mut() = status;
        *client_response.headers_mut() = headers;
        client_response
    }
}

/// Drops hop-by-hop headers, including any named by `Connection`.
fn sanitize_headers(headers: &HeaderMap) -> HeaderMap {
    let connection_listed: Vec<String> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|name| name.trim().to_ascii_lowercase())
        .filter(|name| !name.is_empty())
        .collect();

    let mut sanitized = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers.iter() {
        let lower = name.as_str();
        if HOP_BY_HOP.contains(&lower) || connection_listed.iter().any(|c| c == lower) {
            continue;
        }
        sanitized.append(name.clone(), value.clone());
    }
    sanitized
}
