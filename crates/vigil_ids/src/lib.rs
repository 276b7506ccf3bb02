//! Shared identifier wrappers for Vigil.
//!
//! Identifiers are opaque strings. Freshly minted ones carry a short type
//! prefix followed by a v4 UUID, but any non-empty printable string coming
//! from an external producer (an ingestion layer, a backend, an operator) is
//! accepted as-is.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Longest identifier accepted from outside the process.
pub const MAX_ID_LEN: usize = 128;

/// Error returned when parsing an identifier fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdParseError {
    message: String,
}

impl IdParseError {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for IdParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for IdParseError {}

fn validate(value: &str, label: &str) -> Result<(), IdParseError> {
    if value.is_empty() {
        return Err(IdParseError::new(format!("Invalid {}: empty", label)));
    }
    if value.len() > MAX_ID_LEN {
        return Err(IdParseError::new(format!(
            "Invalid {}: longer than {} bytes",
            label, MAX_ID_LEN
        )));
    }
    if value.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(IdParseError::new(format!(
            "Invalid {}: contains whitespace or control characters",
            label
        )));
    }
    Ok(())
}

macro_rules! define_opaque_id {
    ($name:ident, $prefix:expr, $label:expr) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new() -> Self {
                Self(format!("{}-{}", $prefix, Uuid::new_v4()))
            }

            pub fn parse(value: &str) -> Result<Self, IdParseError> {
                validate(value, $label)?;
                Ok(Self(value.to_string()))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn into_string(self) -> String {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = IdParseError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

define_opaque_id!(EventId, "evt", "event ID");
define_opaque_id!(UploadId, "upl", "upload ID");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_ids_are_prefixed_and_unique() {
        let a = EventId::new();
        let b = EventId::new();
        assert!(a.as_str().starts_with("evt-"));
        assert_ne!(a, b);
        assert!(UploadId::new().as_str().starts_with("upl-"));
    }

    #[test]
    fn test_parse_accepts_external_ids() {
        let id: EventId = "ev-1".parse().unwrap();
        assert_eq!(id.as_str(), "ev-1");
        assert_eq!(id.to_string(), "ev-1");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(EventId::parse("").is_err());
        assert!(UploadId::parse("has space").is_err());
        assert!(UploadId::parse(&"x".repeat(MAX_ID_LEN + 1)).is_err());
    }

    #[test]
    fn test_serde_is_transparent() {
        let id = UploadId::parse("upl-42").unwrap();
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"upl-42\"");
        let back: UploadId = serde_json::from_str("\"upl-42\"").unwrap();
        assert_eq!(back, id);
    }
}
