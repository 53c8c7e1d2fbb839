//! Pseudonymization tokens for direct identifiers.
//!
//! A token is the hex SHA-256 of `salt:identifier`, with the identifier
//! reduced to its digits first so formatting differences in the source do
//! not produce different tokens.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::PipelineError;
use crate::record::RawRecord;

/// Derive a token column from an identifying column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TokenizeSpec {
    /// Identifying column read.
    pub source: String,
    /// Token column written.
    pub target: String,
    /// Environment variable holding the salt.
    pub salt_env: String,
}

pub fn normalize_identifier(raw: &str) -> String {
    let digits: String = raw.chars().filter(char::is_ascii_digit).collect();
    if digits.is_empty() {
        raw.trim().to_ascii_uppercase()
    } else {
        digits
    }
}

pub fn token(identifier: &str, salt: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(b":");
    hasher.update(normalize_identifier(identifier).as_bytes());
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

/// A [`TokenizeSpec`] bound to its salt.
#[derive(Clone)]
pub struct Tokenizer {
    spec: TokenizeSpec,
    salt: String,
}

impl std::fmt::Debug for Tokenizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tokenizer")
            .field("spec", &self.spec)
            .field("salt", &"<redacted>")
            .finish()
    }
}

impl Tokenizer {
    pub fn new(spec: TokenizeSpec, salt: impl Into<String>) -> Result<Self, PipelineError> {
        let salt = salt.into();
        if salt.is_empty() {
            return Err(PipelineError::Config(format!(
                "tokenize salt for '{}' is empty",
                spec.target
            )));
        }
        Ok(Tokenizer { spec, salt })
    }

    /// Read the salt from the environment variable named by `salt_env`.
    pub fn from_env(spec: TokenizeSpec) -> Result<Self, PipelineError> {
        let salt = std::env::var(&spec.salt_env).map_err(|_| {
            PipelineError::Config(format!(
                "environment variable {} (tokenize salt) is not set",
                spec.salt_env
            ))
        })?;
        Tokenizer::new(spec, salt)
    }

    pub fn spec(&self) -> &TokenizeSpec {
        &self.spec
    }

    /// Fill the token column of a landed record when it is absent or blank
    /// and the source identifier is present.
    pub fn apply(&self, record: &mut RawRecord) {
        if record.get(&self.spec.target).is_some_and(|v| !is_blank(v)) {
            return;
        }
        let identifier = match record.get(&self.spec.source) {
            Some(serde_json::Value::String(s)) if !s.trim().is_empty() => s.clone(),
            Some(serde_json::Value::Number(n)) => n.to_string(),
            _ => return,
        };
        let token = token(&identifier, &self.salt);
        record.insert(self.spec.target.clone(), serde_json::Value::String(token));
    }
}

fn is_blank(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Null => true,
        serde_json::Value::String(s) => s.trim().is_empty(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn spec() -> TokenizeSpec {
        TokenizeSpec {
            source: "national_id".into(),
            target: "patient_token".into(),
            salt_env: "UNUSED".into(),
        }
    }

    #[test]
    fn formatting_does_not_change_token() {
        assert_eq!(token("123.456.789-09", "s"), token("12345678909", "s"));
        assert_ne!(token("12345678909", "s"), token("12345678909", "t"));
        assert_eq!(token("12345678909", "s").len(), 64);
    }

    #[test]
    fn apply_fills_missing_token_only() {
        let tokenizer = Tokenizer::new(spec(), "salt").unwrap();
        let mut record = json!({"national_id": "123.456.789-09", "patient_token": ""})
            .as_object()
            .cloned()
            .unwrap();
        tokenizer.apply(&mut record);
        assert_eq!(record["patient_token"], json!(token("12345678909", "salt")));

        let mut preset = json!({"national_id": "12345678909", "patient_token": "given"})
            .as_object()
            .cloned()
            .unwrap();
        tokenizer.apply(&mut preset);
        assert_eq!(preset["patient_token"], json!("given"));

        let mut anonymous = json!({"full_name": "Ana"}).as_object().cloned().unwrap();
        tokenizer.apply(&mut anonymous);
        assert!(!anonymous.contains_key("patient_token"));
    }

    #[test]
    fn empty_salt_is_rejected() {
        assert!(Tokenizer::new(spec(), "").is_err());
    }
}
