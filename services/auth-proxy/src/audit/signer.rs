use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use super::error::AuditError;
use super::record::AuditRecord;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_ALGORITHM: &str = "HMAC-SHA256";

const MIN_KEY_LEN: usize = 32;
const BASE64_PREFIX: &str = "base64:";

/// Signs audit records so tampering is detectable downstream.
pub struct AuditSigner {
    key: Vec<u8>,
}

impl AuditSigner {
    /// Raw secret bytes, or a base64 key when prefixed with `base64:`.
    pub fn new(secret: &str) -> Result<Self, AuditError> {
        let secret = secret.trim();
        if secret.is_empty() {
            return Err(AuditError::InvalidKey("secret cannot be empty".into()));
        }

        let key = match secret.strip_prefix(BASE64_PREFIX) {
            Some(encoded) => STANDARD
                .decode(encoded)
                .map_err(|err| AuditError::InvalidKey(format!("invalid base64 key: {}", err)))?,
            None => secret.as_bytes().to_vec(),
        };
        if key.len() < MIN_KEY_LEN {
            return Err(AuditError::InvalidKey(format!(
                "signing key must be at least {} bytes",
                MIN_KEY_LEN
            )));
        }

        Ok(Self { key })
    }

    fn mac(&self) -> Result<HmacSha256, AuditError> {
        HmacSha256::new_from_slice(&self.key).map_err(|err| AuditError::InvalidKey(err.to_string()))
    }

    pub fn sign(&self, record: &AuditRecord) -> Result<String, AuditError> {
        let mut mac = self.mac()?;
        mac.update(canonical_payload(record)?.as_bytes());
        Ok(STANDARD.encode(mac.finalize().into_bytes()))
    }

    /// `false` for unsigned records or a signature that does not match.
    pub fn verify(&self, record: &AuditRecord) -> Result<bool, AuditError> {
        let Some(ref signature) = record.signature else {
            return Ok(false);
        };
        let decoded = STANDARD
            .decode(signature)
            .map_err(|err| AuditError::Encoding(err.to_string()))?;

        let mut mac = self.mac()?;
        mac.update(canonical_payload(record)?.as_bytes());
        Ok(mac.verify_slice(&decoded).is_ok())
    }
}

/// Key-sorted JSON of the record with its signature field cleared.
fn canonical_payload(record: &AuditRecord) -> Result<String, AuditError> {
    let mut value = serde_json::to_value(record)?;
    if let serde_json::Value::Object(ref mut map) = value {
        map.remove("signature");
    }
    Ok(serde_json::to_string(&sort_json_keys(&value))?)
}

fn sort_json_keys(value: &serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => {
            let sorted: BTreeMap<String, serde_json::Value> = map
                .iter()
                .map(|(k, v)| (k.clone(), sort_json_keys(v)))
                .collect();
            serde_json::Value::Object(sorted.into_iter().collect())
        }
        serde_json::Value::Array(arr) => {
            serde_json::Value::Array(arr.iter().map(sort_json_keys).collect())
        }
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::Outcome;

    const SECRET: &str = "0123456789abcdef0123456789abcdef";

    fn record() -> AuditRecord {
        let mut record = AuditRecord::new(
            "a1".to_string(),
            "/api/v1/namespaces/default/pods".to_string(),
            "list".to_string(),
        );
        record.outcome = Outcome::Forwarded;
        record.source_ips = vec!["10.0.0.7".to_string()];
        record
    }

    #[test]
    fn test_sign_and_verify() {
        let signer = AuditSigner::new(SECRET).unwrap();
        let mut record = record();
        record.signature = Some(signer.sign(&record).unwrap());

        assert!(signer.verify(&record).unwrap());
    }

    #[test]
    fn test_tampering_detected() {
        let signer = AuditSigner::new(SECRET).unwrap();
        let mut record = record();
        record.signature = Some(signer.sign(&record).unwrap());
        record.verb = "delete".to_string();

        assert!(!signer.verify(&record).unwrap());
    }

    #[test]
    fn test_unsigned_record_fails_verification() {
        let signer = AuditSigner::new(SECRET).unwrap();
        assert!(!signer.verify(&record()).unwrap());
    }

    #[test]
    fn test_short_key_rejected() {
        assert!(matches!(
            AuditSigner::new("too-short"),
            Err(AuditError::InvalidKey(_))
        ));
        assert!(AuditSigner::new("  ").is_err());
    }

    #[test]
    fn test_base64_key_accepted() {
        let encoded = format!("base64:{}", STANDARD.encode([7u8; 32]));
        let signer = AuditSigner::new(&encoded).unwrap();
        assert_eq!(signer.key, vec![7u8; 32]);

        assert!(AuditSigner::new("base64:not*base64").is_err());
        let short = format!("base64:{}", STANDARD.encode([7u8; 16]));
        assert!(AuditSigner::new(&short).is_err());
    }

    #[test]
    fn test_raw_secret_used_verbatim_even_if_valid_base64() {
        assert!(STANDARD.decode(SECRET).is_ok());

        let signer = AuditSigner::new(SECRET).unwrap();
        assert_eq!(signer.key, SECRET.as_bytes());

        let mut record = record();
        record.signature = Some(signer.sign(&record).unwrap());
        let mut mac = HmacSha256::new_from_slice(SECRET.as_bytes()).unwrap();
        mac.update(canonical_payload(&record).unwrap().as_bytes());
        assert_eq!(
            record.signature.as_deref(),
            Some(STANDARD.encode(mac.finalize().into_bytes()).as_str())
        );
    }
}
