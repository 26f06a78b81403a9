use std::collections::{BTreeMap, BTreeSet};

use k8s_openapi::api::authentication::v1::UserInfo;
use serde::{Deserialize, Serialize};

pub const SYSTEM_AUTHENTICATED: &str = "system:authenticated";
pub const SYSTEM_ANONYMOUS: &str = "system:anonymous";

/// An authenticated principal. Built once per request and never mutated
/// after the pipeline hands it on.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    #[serde(rename = "username")]
    pub name: String,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub groups: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, Vec<String>>,
}

impl Identity {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_groups<I, S>(mut self, groups: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.groups.extend(groups.into_iter().map(Into::into));
        self
    }

    pub fn with_uid(mut self, uid: impl Into<String>) -> Self {
        self.uid = Some(uid.into());
        self
    }

    pub fn with_extra(mut self, key: impl Into<String>, values: Vec<String>) -> Self {
        self.extra.entry(key.into()).or_default().extend(values);
        self
    }

    pub fn in_group(&self, group: &str) -> bool {
        self.groups.contains(group)
    }

    pub fn is_anonymous(&self) -> bool {
        self.name == SYSTEM_ANONYMOUS
    }

    /// Identity described by a review response; `None` without a username.
    pub fn from_user_info(user: UserInfo) -> Option<Self> {
        let name = user.username.filter(|n| !n.is_empty())?;
        Some(Self {
            name,
            groups: user.groups.unwrap_or_default().into_iter().collect(),
            uid: user.uid.filter(|u| !u.is_empty()),
            extra: user.extra.unwrap_or_default(),
        })
    }
}
