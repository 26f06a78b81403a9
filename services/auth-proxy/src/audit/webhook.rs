use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Mutex;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::backend::AuditBackend;
use super::error::AuditError;
use super::record::{AuditRecord, AUDIT_API_VERSION};
use crate::config::AuditConfig;

const MAX_RETRIES: u32 = 3;
const INITIAL_BACKOFF_MS: u64 = 100;
const MAX_BACKOFF_MS: u64 = 5000;
const DELIVERY_TIMEOUT: Duration = Duration::from_secs(10);

/// Batches records and posts them as an `EventList` to a remote collector.
pub struct WebhookBackend {
    http_client: Client,
    url: String,
    batch_size: usize,
    batch_interval: Duration,
    tx: mpsc::Sender<AuditRecord>,
    state: Mutex<WebhookState>,
}

struct WebhookState {
    rx: mpsc::Receiver<AuditRecord>,
    /// Records taken off the queue but not yet delivered.
    pending: Vec<AuditRecord>,
}

impl WebhookBackend {
    pub fn new(url: &str, config: &AuditConfig) -> Result<Self, AuditError> {
        let http_client = Client::builder()
            .timeout(DELIVERY_TIMEOUT)
            .user_agent(concat!("cluster-gate-auth-proxy/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|err| AuditError::Config(format!("failed to build webhook client: {}", err)))?;

        let (tx, rx) = mpsc::channel(config.buffer_size.max(1));

        Ok(Self {
            http_client,
            url: url.to_string(),
            batch_size: config.webhook_batch_size.max(1),
            batch_interval: Duration::from_millis(config.webhook_batch_interval_ms.max(1)),
            tx,
            state: Mutex::new(WebhookState {
                rx,
                pending: Vec::new(),
            }),
        })
    }

    async fn flush(&self, pending: &mut Vec<AuditRecord>) {
        while !pending.is_empty() {
            let take = pending.len().min(self.batch_size);
            match self.deliver(&pending[..take]).await {
                Ok(()) => {
                    debug!(count = take, "Delivered audit batch");
                }
                Err(err) => {
                    warn!(count = take, error = %err, "Dropping undeliverable audit batch");
                }
            }
            pending.drain(..take);
        }
    }

    async fn deliver(&self, batch: &[AuditRecord]) -> Result<(), AuditError> {
        let body = json!({
            "kind": "EventList",
            "apiVersion": AUDIT_API_VERSION,
            "items": batch,
        });

        let mut attempt = 0;
        let mut backoff = INITIAL_BACKOFF_MS;

        loop {
            let failure = match self.http_client.post(&self.url).json(&body).send().await {
                Ok(response) if response.status().is_success() => return Ok(()),
                Ok(response) if response.status().is_server_error() => {
                    format!("server error {}", response.status())
                }
                Ok(response) => {
                    return Err(AuditError::Delivery(format!(
                        "collector rejected batch with {}",
                        response.status()
                    )));
                }
                Err(err) => err.to_string(),
            };

            if attempt >= MAX_RETRIES {
                return Err(AuditError::Delivery(format!(
                    "{} after {} retries",
                    failure, MAX_RETRIES
                )));
            }

            let jitter = (rand::random::<f64>() * 0.5 * backoff as f64) as u64;
            let sleep_duration = backoff + jitter;
            debug!(
                attempt = attempt + 1,
                backoff_ms = sleep_duration,
                reason = %failure,
                "Retrying audit delivery"
            );
            sleep(Duration::from_millis(sleep_duration)).await;

            attempt += 1;
            backoff = (backoff * 2).min(MAX_BACKOFF_MS);
        }
    }
}

#[async_trait]
impl AuditBackend for WebhookBackend {
    fn name(&self) -> &'static str {
        "webhook"
    }

    fn process(&self, record: &AuditRecord) {
        match self.tx.try_send(record.clone()) {
            Ok(()) => {}
            Err(TrySendError::Full(record)) => {
                warn!(audit_id = %record.audit_id, "Audit buffer full, dropping record");
            }
            Err(TrySendError::Closed(record)) => {
                warn!(audit_id = %record.audit_id, "Audit webhook closed, dropping record");
            }
        }
    }

    async fn run(&self) -> Result<(), AuditError> {
        let mut state = self.state.lock().await;
        let WebhookState { rx, pending } = &mut *state;

        let mut ticker = interval(self.batch_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if !pending.is_empty() {
                        self.flush(pending).await;
                    }
                }
                received = rx.recv() => match received {
                    Some(record) => {
                        pending.push(record);
                        if pending.len() >= self.batch_size {
                            self.flush(pending).await;
                        }
                    }
                    None => return Ok(()),
                },
            }
        }
    }

    /// Waits for `run` to stop, then delivers everything still queued.
    async fn shutdown(&self) -> Result<(), AuditError> {
        let mut state = self.state.lock().await;
        let WebhookState { rx, pending } = &mut *state;

        while let Ok(record) = rx.try_recv() {
            pending.push(record);
        }

        let count = pending.len();
        self.flush(pending).await;
        info!(count, "Audit webhook drained");
        Ok(())
    }
}
