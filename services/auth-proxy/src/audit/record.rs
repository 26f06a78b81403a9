use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::request_info::ObjectRef;
use crate::auth::Identity;

pub const AUDIT_API_VERSION: &str = "audit.k8s.io/v1";
pub const AUDIT_EVENT_KIND: &str = "Event";

/// Status code recorded when the client went away before completion.
pub const CANCELED_STATUS: u16 = 499;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Stage {
    ResponseStarted,
    ResponseComplete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Forwarded,
    Unauthenticated,
    ImpersonationDenied,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseStatus {
    pub code: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// One record per inbound request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditRecord {
    pub kind: String,
    pub api_version: String,
    #[serde(rename = "auditID")]
    pub audit_id: String,
    pub stage: Stage,
    #[serde(rename = "requestURI")]
    pub request_uri: String,
    pub verb: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<Identity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub impersonated_user: Option<Identity>,
    #[serde(rename = "sourceIPs")]
    pub source_ips: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_ref: Option<ObjectRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_status: Option<ResponseStatus>,
    pub outcome: Outcome,
    pub request_received_timestamp: DateTime<Utc>,
    pub stage_timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

impl AuditRecord {
    pub fn new(audit_id: String, request_uri: String, verb: String) -> Self {
        let now = Utc::now();
        Self {
            kind: AUDIT_EVENT_KIND.to_string(),
            api_version: AUDIT_API_VERSION.to_string(),
            audit_id,
            stage: Stage::ResponseComplete,
            request_uri,
            verb,
            user: None,
            impersonated_user: None,
            source_ips: Vec::new(),
            user_agent: None,
            object_ref: None,
            response_status: None,
            outcome: Outcome::Error,
            request_received_timestamp: now,
            stage_timestamp: now,
            annotations: BTreeMap::new(),
            signature: None,
        }
    }
}
