//! Audit pipeline: one record per inbound request, delivered to an
//! optional backend.

pub mod backend;
pub mod context;
pub mod error;
pub mod record;
pub mod request_info;
pub mod signer;
pub mod webhook;

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use http::{HeaderMap, Method, Uri};
use tracing::{debug, info, warn};

pub use backend::{AuditBackend, LogBackend, UnionBackend};
pub use context::AuditContext;
pub use error::AuditError;
pub use record::{AuditRecord, Outcome, ResponseStatus, Stage, CANCELED_STATUS};
pub use request_info::{ObjectRef, RequestInfo};
pub use signer::AuditSigner;
pub use webhook::WebhookBackend;

use crate::config::AuditConfig;

pub struct AuditPipeline {
    backend: Option<Arc<dyn AuditBackend>>,
    signer: Option<AuditSigner>,
    omit_paths: Vec<String>,
    shut_down: AtomicBool,
}

impl AuditPipeline {
    pub fn new(
        backend: Option<Arc<dyn AuditBackend>>,
        signer: Option<AuditSigner>,
        omit_paths: Vec<String>,
    ) -> Self {
        Self {
            backend,
            signer,
            omit_paths,
            shut_down: AtomicBool::new(false),
        }
    }

    pub fn disabled() -> Self {
        Self::new(None, None, Vec::new())
    }

    /// Builds the configured backends; both may be active at once.
    pub fn from_config(config: &AuditConfig) -> Result<Self, AuditError> {
        let mut backends: Vec<Arc<dyn AuditBackend>> = Vec::new();
        if let Some(ref path) = config.log_path {
            backends.push(Arc::new(LogBackend::open(path)?));
        }
        if let Some(ref url) = config.webhook_url {
            backends.push(Arc::new(WebhookBackend::new(url, config)?));
        }

        let backend = match backends.len() {
            0 => None,
            1 => backends.pop(),
            _ => Some(Arc::new(UnionBackend::new(backends)) as Arc<dyn AuditBackend>),
        };

        let signer = config
            .hmac_secret
            .as_deref()
            .map(AuditSigner::new)
            .transpose()?;

        if let Some(ref backend) = backend {
            info!(
                backend = backend.name(),
                signed = signer.is_some(),
                "Audit pipeline enabled"
            );
        }

        Ok(Self::new(backend, signer, config.omit_paths.clone()))
    }

    pub fn is_enabled(&self) -> bool {
        self.backend.is_some()
    }

    /// Opens the audit context for one request, before authentication.
    /// `None` when auditing is off or the path is omitted.
    pub fn begin(
        self: &Arc<Self>,
        audit_id: &str,
        method: &Method,
        uri: &Uri,
        headers: &HeaderMap,
        client_addr: SocketAddr,
        forwarded_by: &str,
    ) -> Option<AuditContext> {
        if self.backend.is_none() || self.omit_paths.iter().any(|p| p == uri.path()) {
            return None;
        }

        let info = RequestInfo::from_parts(method, uri);
        let mut record = AuditRecord::new(audit_id.to_string(), uri.to_string(), info.verb);
        record.object_ref = info.object_ref;
        record.user_agent = headers
            .get(http::header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        record.source_ips = source_ips(client_addr, forwarded_by);

        Some(AuditContext::new(Arc::clone(self), record, info.long_running))
    }

    pub(crate) fn emit(&self, mut record: AuditRecord) {
        let Some(ref backend) = self.backend else {
            return;
        };

        if let Some(ref signer) = self.signer {
            match signer.sign(&record) {
                Ok(signature) => record.signature = Some(signature),
                Err(err) => {
                    warn!(audit_id = %record.audit_id, error = %err, "Failed to sign audit record");
                }
            }
        }

        debug!(
            audit_id = %record.audit_id,
            verb = %record.verb,
            outcome = ?record.outcome,
            "Audit record emitted"
        );
        backend.process(&record);
    }

    /// Drives the backend's delivery loop until `stop` resolves or the
    /// backend fails. Returns at once when auditing is off.
    pub async fn run<F>(&self, stop: F) -> Result<(), AuditError>
    where
        F: Future<Output = ()>,
    {
        let Some(ref backend) = self.backend else {
            return Ok(());
        };

        tokio::select! {
            result = backend.run() => result,
            _ = stop => Ok(()),
        }
    }

    /// Flushes and stops the backend. Later calls do nothing.
    pub async fn shutdown(&self) -> Result<(), AuditError> {
        let Some(ref backend) = self.backend else {
            return Ok(());
        };
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        backend.shutdown().await?;
        info!(backend = backend.name(), "Audit backend shut down");
        Ok(())
    }
}

/// Resolved client address first, then forwarding hops, without repeats.
fn source_ips(client_addr: SocketAddr, forwarded_by: &str) -> Vec<String> {
    let mut ips = vec![client_addr.ip().to_string()];
    for hop in forwarded_by.split(',').map(str::trim).filter(|h| !h.is_empty()) {
        if !ips.iter().any(|ip| ip == hop) {
            ips.push(hop.to_string());
        }
    }
    ips
}
