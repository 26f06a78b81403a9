//! Control-plane request classification from method and path.

use http::{Method, Uri};
use serde::{Deserialize, Serialize};

/// Subresources whose responses stay open.
const LONG_RUNNING_SUBRESOURCES: &[&str] = &["proxy", "log", "exec", "attach", "portforward"];

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectRef {
    pub resource: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub api_group: String,
    pub api_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subresource: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestInfo {
    pub verb: String,
    /// `None` for non-resource paths such as `/version`.
    pub object_ref: Option<ObjectRef>,
    pub long_running: bool,
}

impl RequestInfo {
    pub fn from_parts(method: &Method, uri: &Uri) -> Self {
        let query = uri.query().unwrap_or("");
        let segments: Vec<&str> = uri.path().split('/').filter(|s| !s.is_empty()).collect();

        let (api_group, api_version, mut rest) = match segments.as_slice() {
            ["api", version, rest @ ..] => ("", *version, rest),
            ["apis", group, version, rest @ ..] => (*group, *version, rest),
            _ => return Self::non_resource(method),
        };

        if rest.is_empty() {
            return Self::non_resource(method);
        }

        // Deprecated `/watch/` path prefix.
        let mut watch = false;
        if rest[0] == "watch" {
            watch = true;
            rest = &rest[1..];
        }

        let mut namespace = None;
        if rest.len() >= 2 && rest[0] == "namespaces" {
            namespace = Some(rest[1].to_string());
            // A bare namespace addresses the namespace object itself.
            if rest.len() > 2 {
                rest = &rest[2..];
            }
        }

        let resource = rest.first().map(|s| s.to_string()).unwrap_or_default();
        let name = rest.get(1).map(|s| s.to_string());
        let subresource = rest.get(2).map(|s| s.to_string());
        if resource == "namespaces" && name.as_deref() == namespace.as_deref() {
            namespace = None;
        }

        let verb = if watch || (name.is_none() && *method == Method::GET && query_flag(query, "watch")) {
            "watch"
        } else {
            match *method {
                Method::GET | Method::HEAD if name.is_some() => "get",
                Method::GET | Method::HEAD => "list",
                Method::POST => "create",
                Method::PUT => "update",
                Method::PATCH => "patch",
                Method::DELETE if name.is_some() => "delete",
                Method::DELETE => "deletecollection",
                _ => "",
            }
        };
        let verb = if verb.is_empty() {
            method.as_str().to_lowercase()
        } else {
            verb.to_string()
        };

        let long_running = verb == "watch"
            || query_flag(query, "follow")
            || subresource
                .as_deref()
                .is_some_and(|s| LONG_RUNNING_SUBRESOURCES.contains(&s));

        Self {
            verb,
            object_ref: Some(ObjectRef {
                resource,
                namespace,
                name,
                api_group: api_group.to_string(),
                api_version: api_version.to_string(),
                subresource,
            }),
            long_running,
        }
    }

    fn non_resource(method: &Method) -> Self {
        Self {
            verb: method.as_str().to_lowercase(),
            object_ref: None,
            long_running: false,
        }
    }
}

/// `true` for `name=true` or `name=1`.
pub(crate) fn query_flag(query: &str, name: &str) -> bool {
    query_param(query, name).is_some_and(|v| v == "true" || v == "1")
}

pub(crate) fn query_param<'a>(query: &'a str, name: &str) -> Option<&'a str> {
    query
        .split('&')
        .filter_map(|pair| pair.split_once('=').or(Some((pair, ""))))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value)
}
