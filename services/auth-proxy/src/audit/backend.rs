use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures_util::future::try_join_all;
use tracing::{info, warn};

use super::error::AuditError;
use super::record::AuditRecord;

/// Destination for finished audit records.
///
/// `process` is called on the request path and must not block on I/O
/// that can stall; buffering backends queue and deliver from `run`.
#[async_trait]
pub trait AuditBackend: Send + Sync {
    fn name(&self) -> &'static str;

    fn process(&self, record: &AuditRecord);

    /// Delivery loop. Backends without one never complete.
    async fn run(&self) -> Result<(), AuditError> {
        std::future::pending().await
    }

    async fn shutdown(&self) -> Result<(), AuditError>;
}

/// Writes one JSON document per line.
pub struct LogBackend {
    writer: Mutex<Box<dyn Write + Send>>,
}

impl LogBackend {
    /// `-` writes to stdout; anything else is opened for append.
    pub fn open(path: &Path) -> Result<Self, AuditError> {
        if path.as_os_str() == "-" {
            return Ok(Self::from_writer(Box::new(io::stdout())));
        }

        let file = OpenOptions::new().create(true).append(true).open(path)?;
        info!(path = %path.display(), "Audit log opened");
        Ok(Self::from_writer(Box::new(file)))
    }

    pub fn from_writer(writer: Box<dyn Write + Send>) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    fn write_record(&self, record: &AuditRecord) -> Result<(), AuditError> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        let mut writer = self
            .writer
            .lock()
            .map_err(|_| AuditError::Delivery("audit log writer poisoned".into()))?;
        writer.write_all(&line)?;
        writer.flush()?;
        Ok(())
    }
}

#[async_trait]
impl AuditBackend for LogBackend {
    fn name(&self) -> &'static str {
        "log"
    }

    fn process(&self, record: &AuditRecord) {
        if let Err(err) = self.write_record(record) {
            warn!(audit_id = %record.audit_id, error = %err, "Failed to write audit record");
        }
    }

    async fn shutdown(&self) -> Result<(), AuditError> {
        let mut writer = self
            .writer
            .lock()
            .map_err(|_| AuditError::Delivery("audit log writer poisoned".into()))?;
        writer.flush()?;
        Ok(())
    }
}

/// Fans every record out to several backends.
pub struct UnionBackend {
    backends: Vec<Arc<dyn AuditBackend>>,
}

impl UnionBackend {
    pub fn new(backends: Vec<Arc<dyn AuditBackend>>) -> Self {
        Self { backends }
    }
}

#[async_trait]
impl AuditBackend for UnionBackend {
    fn name(&self) -> &'static str {
        "union"
    }

    fn process(&self, record: &AuditRecord) {
        for backend in &self.backends {
            backend.process(record);
        }
    }

    async fn run(&self) -> Result<(), AuditError> {
        try_join_all(self.backends.iter().map(|b| b.run())).await?;
        Ok(())
    }

    /// Every backend is shut down; the first error is returned.
    async fn shutdown(&self) -> Result<(), AuditError> {
        let mut first_error = None;
        for backend in &self.backends {
            if let Err(err) = backend.shutdown().await {
                warn!(backend = backend.name(), error = %err, "Audit backend shutdown failed");
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}
