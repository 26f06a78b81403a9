//! Classification of the `Impersonate-*` header family.
//!
//! Every header in the family is sorted into exactly one variant before any
//! authorization call is made.

use std::collections::BTreeMap;

use http::{HeaderMap, HeaderName, HeaderValue};
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};

use super::ImpersonationError;
use crate::auth::Identity;

pub const IMPERSONATE_PREFIX: &str = "impersonate-";
pub const IMPERSONATE_USER: &str = "impersonate-user";
pub const IMPERSONATE_GROUP: &str = "impersonate-group";
pub const IMPERSONATE_UID: &str = "impersonate-uid";
pub const IMPERSONATE_EXTRA_PREFIX: &str = "impersonate-extra-";

/// Bytes that may appear unescaped in an extra key header name.
const EXTRA_KEY_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'!')
    .remove(b'#')
    .remove(b'$')
    .remove(b'&')
    .remove(b'\'')
    .remove(b'*')
    .remove(b'+')
    .remove(b'-')
    .remove(b'.')
    .remove(b'^')
    .remove(b'_')
    .remove(b'`')
    .remove(b'|')
    .remove(b'~');

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImpersonationHeader {
    User,
    Group,
    Uid,
    /// Decoded, lower-cased extra key.
    Extra(String),
    Unknown,
}

impl ImpersonationHeader {
    /// `None` when the header is outside the family.
    pub fn classify(name: &HeaderName) -> Option<Self> {
        // HeaderName is always lower-case.
        let name = name.as_str();
        if !name.starts_with(IMPERSONATE_PREFIX) {
            return None;
        }

        Some(match name {
            IMPERSONATE_USER => ImpersonationHeader::User,
            IMPERSONATE_GROUP => ImpersonationHeader::Group,
            IMPERSONATE_UID => ImpersonationHeader::Uid,
            _ => match name.strip_prefix(IMPERSONATE_EXTRA_PREFIX) {
                Some(raw) if !raw.is_empty() => {
                    let key = percent_decode_str(raw).decode_utf8_lossy();
                    ImpersonationHeader::Extra(key.to_lowercase())
                }
                _ => ImpersonationHeader::Unknown,
            },
        })
    }
}

/// The identity a caller asked to act as, parsed from one request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImpersonationRequest {
    pub user: Option<String>,
    pub groups: Vec<String>,
    pub uid: Option<String>,
    pub extra: BTreeMap<String, Vec<String>>,
    /// Header names in the family that matched no facet.
    pub unknown: Vec<String>,
}

impl ImpersonationRequest {
    /// `Ok(None)` when no header of the family is present.
    pub fn parse(headers: &HeaderMap) -> Result<Option<Self>, ImpersonationError> {
        let mut request = ImpersonationRequest::default();
        let mut present = false;

        for name in headers.keys() {
            let Some(kind) = ImpersonationHeader::classify(name) else {
                continue;
            };
            present = true;

            let values = header_values(headers, name)?;
            match kind {
                ImpersonationHeader::User => {
                    request.user = Some(single(values, IMPERSONATE_USER)?);
                }
                ImpersonationHeader::Uid => {
                    request.uid = Some(single(values, IMPERSONATE_UID)?);
                }
                ImpersonationHeader::Group => request.groups.extend(values),
                ImpersonationHeader::Extra(key) => {
                    request.extra.entry(key).or_default().extend(values);
                }
                ImpersonationHeader::Unknown => request.unknown.push(name.to_string()),
            }
        }

        Ok(present.then_some(request))
    }
}

fn header_values(headers: &HeaderMap, name: &HeaderName) -> Result<Vec<String>, ImpersonationError> {
    headers
        .get_all(name)
        .iter()
        .map(|value| {
            value
                .to_str()
                .map(str::to_string)
                .map_err(|_| ImpersonationError::InvalidHeaderValue(name.to_string()))
        })
        .collect()
}

fn single(mut values: Vec<String>, header: &'static str) -> Result<String, ImpersonationError> {
    if values.len() != 1 {
        return Err(ImpersonationError::DuplicateHeader(header));
    }
    Ok(values.remove(0))
}

/// Remove every header of the family.
pub fn strip_impersonation_headers(headers: &mut HeaderMap) {
    let names: Vec<HeaderName> = headers
        .keys()
        .filter(|name| name.as_str().starts_with(IMPERSONATE_PREFIX))
        .cloned()
        .collect();

    for name in names {
        headers.remove(&name);
    }
}

/// Present `identity` through one authoritative header set.
pub fn insert_impersonation_headers(
    headers: &mut HeaderMap,
    identity: &Identity,
) -> Result<(), ImpersonationError> {
    let value = |name: &str, v: &str| {
        HeaderValue::from_str(v).map_err(|_| ImpersonationError::InvalidHeaderValue(name.to_string()))
    };

    headers.insert(IMPERSONATE_USER, value(IMPERSONATE_USER, &identity.name)?);
    for group in &identity.groups {
        headers.append(IMPERSONATE_GROUP, value(IMPERSONATE_GROUP, group)?);
    }
    if let Some(ref uid) = identity.uid {
        headers.insert(IMPERSONATE_UID, value(IMPERSONATE_UID, uid)?);
    }
    for (key, values) in &identity.extra {
        let header = format!(
            "{}{}",
            IMPERSONATE_EXTRA_PREFIX,
            utf8_percent_encode(key, EXTRA_KEY_ENCODE_SET)
        );
        let name = HeaderName::from_bytes(header.as_bytes())
            .map_err(|_| ImpersonationError::InvalidHeaderValue(header.clone()))?;
        for v in values {
            headers.append(name.clone(), value(&header, v)?);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for (name, value) in pairs {
            headers.append(
                HeaderName::from_bytes(name.as_bytes()).unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        headers
    }

    #[test]
    fn test_classify() {
        let classify =
            |n: &str| ImpersonationHeader::classify(&HeaderName::from_bytes(n.as_bytes()).unwrap());

        assert_eq!(classify("Impersonate-User"), Some(ImpersonationHeader::User));
        assert_eq!(classify("IMPERSONATE-GROUP"), Some(ImpersonationHeader::Group));
        assert_eq!(classify("impersonate-uid"), Some(ImpersonationHeader::Uid));
        assert_eq!(
            classify("Impersonate-Extra-Acme.com%2FProject"),
            Some(ImpersonationHeader::Extra("acme.com/project".to_string()))
        );
        assert_eq!(classify("Impersonate-Extra-"), Some(ImpersonationHeader::Unknown));
        assert_eq!(classify("Impersonate-Tenant"), Some(ImpersonationHeader::Unknown));
        assert_eq!(classify("Authorization"), None);
    }

    #[test]
    fn test_parse_full_request() {
        let request = ImpersonationRequest::parse(&headers(&[
            ("Impersonate-User", "jane"),
            ("Impersonate-Group", "developers"),
            ("Impersonate-Group", "admins"),
            ("Impersonate-Uid", "1234"),
            ("Impersonate-Extra-Scopes", "view"),
            ("Impersonate-Extra-scopes", "development"),
            ("Accept", "application/json"),
        ]))
        .unwrap()
        .unwrap();

        assert_eq!(request.user.as_deref(), Some("jane"));
        assert_eq!(request.groups, vec!["developers", "admins"]);
        assert_eq!(request.uid.as_deref(), Some("1234"));
        assert_eq!(request.extra["scopes"], vec!["view", "development"]);
        assert!(request.unknown.is_empty());
    }

    #[test]
    fn test_parse_without_family() {
        let parsed = ImpersonationRequest::parse(&headers(&[("Accept", "*/*")])).unwrap();
        assert!(parsed.is_none());
    }

    #[test]
    fn test_parse_duplicate_user() {
        let err = ImpersonationRequest::parse(&headers(&[
            ("Impersonate-User", "jane"),
            ("Impersonate-User", "joe"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ImpersonationError::DuplicateHeader(IMPERSONATE_USER)));
    }

    #[test]
    fn test_strip_and_insert_round_trip() {
        let mut map = headers(&[
            ("Impersonate-User", "jane"),
            ("Impersonate-Bogus", "x"),
            ("Accept", "*/*"),
        ]);
        strip_impersonation_headers(&mut map);
        assert_eq!(map.len(), 1);

        let identity = Identity::new("jane")
            .with_groups(["system:authenticated", "dev"])
            .with_uid("42")
            .with_extra("acme.com/project", vec!["apollo".to_string()]);
        insert_impersonation_headers(&mut map, &identity).unwrap();

        assert_eq!(map[IMPERSONATE_USER], "jane");
        assert_eq!(map.get_all(IMPERSONATE_GROUP).iter().count(), 2);
        assert_eq!(map[IMPERSONATE_UID], "42");
        assert_eq!(map["impersonate-extra-acme.com%2fproject"], "apollo");

        let parsed = ImpersonationRequest::parse(&map).unwrap().unwrap();
        assert_eq!(parsed.extra["acme.com/project"], vec!["apollo"]);
    }
}
