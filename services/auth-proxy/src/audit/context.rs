use std::sync::Arc;

use chrono::Utc;

use super::record::{AuditRecord, Outcome, ResponseStatus, Stage, CANCELED_STATUS};
use super::AuditPipeline;
use crate::auth::Identity;

/// Request-scoped audit state. Consuming it with [`AuditContext::finish`]
/// emits the record; dropping it unfinished emits a canceled record, so a
/// request can never produce zero or two records.
pub struct AuditContext {
    pipeline: Arc<AuditPipeline>,
    record: Option<AuditRecord>,
    long_running: bool,
}

impl AuditContext {
    pub(crate) fn new(pipeline: Arc<AuditPipeline>, record: AuditRecord, long_running: bool) -> Self {
        Self {
            pipeline,
            record: Some(record),
            long_running,
        }
    }

    pub fn is_long_running(&self) -> bool {
        self.long_running
    }

    pub fn set_user(&mut self, user: &Identity) {
        if let Some(ref mut record) = self.record {
            record.user = Some(user.clone());
        }
    }

    pub fn set_impersonated_user(&mut self, target: &Identity) {
        if let Some(ref mut record) = self.record {
            record.impersonated_user = Some(target.clone());
        }
    }

    pub fn annotate(&mut self, key: impl Into<String>, value: impl Into<String>) {
        if let Some(ref mut record) = self.record {
            record.annotations.insert(key.into(), value.into());
        }
    }

    /// Long-running requests that were forwarded close at
    /// `ResponseStarted`; everything else at `ResponseComplete`.
    pub fn finish(mut self, outcome: Outcome, code: u16, message: Option<String>) {
        let stage = if self.long_running && outcome == Outcome::Forwarded {
            Stage::ResponseStarted
        } else {
            Stage::ResponseComplete
        };
        self.close(stage, outcome, code, message);
    }

    fn close(&mut self, stage: Stage, outcome: Outcome, code: u16, message: Option<String>) {
        let Some(mut record) = self.record.take() else {
            return;
        };
        record.stage = stage;
        record.outcome = outcome;
        record.response_status = Some(ResponseStatus { code, message });
        record.stage_timestamp = Utc::now();
        self.pipeline.emit(record);
    }
}

impl Drop for AuditContext {
    fn drop(&mut self) {
        self.close(
            Stage::ResponseComplete,
            Outcome::Error,
            CANCELED_STATUS,
            Some("request canceled before completion".to_string()),
        );
    }
}
