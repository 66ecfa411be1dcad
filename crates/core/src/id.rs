//! Strongly-typed identifiers used across the event core.

use core::str::FromStr;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DomainError;

/// Maximum length of a textual identifier.
pub const MAX_ID_LEN: usize = 200;

/// Identifier of a stream (one aggregate instance, e.g. `portfolio-1`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct StreamId(String);

/// Identifier of an external consumer registered with the router.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ConsumerId(String);

/// Identifier of the producer that submitted an event (gateway, adapter, ...).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ProducerId(String);

/// Correlates every event caused by one external request.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(Uuid);

/// Identifies the event (or command) that caused an event.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CausationId(Uuid);

fn validate_text_id(kind: &str, value: &str) -> Result<(), DomainError> {
    if value.is_empty() {
        return Err(DomainError::invalid_id(format!("{kind}: must not be empty")));
    }
    if value.len() > MAX_ID_LEN {
        return Err(DomainError::invalid_id(format!(
            "{kind}: longer than {MAX_ID_LEN} bytes"
        )));
    }
    if let Some(bad) = value
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':' | '/')))
    {
        return Err(DomainError::invalid_id(format!(
            "{kind}: unexpected character {bad:?}"
        )));
    }
    Ok(())
}

macro_rules! impl_text_newtype {
    ($t:ty, $name:literal) => {
        impl $t {
            /// Validate and wrap an identifier.
            pub fn new(value: impl Into<String>) -> Result<Self, DomainError> {
                let value = value.into();
                validate_text_id($name, &value)?;
                Ok(Self(value))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl AsRef<str> for $t {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl TryFrom<String> for $t {
            type Error = DomainError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                Self::new(value)
            }
        }

        impl TryFrom<&str> for $t {
            type Error = DomainError;

            fn try_from(value: &str) -> Result<Self, Self::Error> {
                Self::new(value)
            }
        }

        impl From<$t> for String {
            fn from(value: $t) -> Self {
                value.0
            }
        }

        impl FromStr for $t {
            type Err = DomainError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::new(s)
            }
        }
    };
}

macro_rules! impl_uuid_newtype {
    ($t:ty, $name:literal) => {
        impl $t {
            /// Create a new identifier.
            ///
            /// Uses UUIDv7 (time-ordered). Prefer passing IDs explicitly in tests
            /// for determinism.
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }

            pub fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $t {
            fn default() -> Self {
                Self::new()
            }
        }

        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                core::fmt::Display::fmt(&self.0, f)
            }
        }

        impl From<Uuid> for $t {
            fn from(value: Uuid) -> Self {
                Self(value)
            }
        }

        impl FromStr for $t {
            type Err = DomainError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let uuid = Uuid::from_str(s)
                    .map_err(|e| DomainError::invalid_id(format!("{}: {}", $name, e)))?;
                Ok(Self(uuid))
            }
        }
    };
}

impl_text_newtype!(StreamId, "StreamId");
impl_text_newtype!(ConsumerId, "ConsumerId");
impl_text_newtype!(ProducerId, "ProducerId");
impl_uuid_newtype!(CorrelationId, "CorrelationId");
impl_uuid_newtype!(CausationId, "CausationId");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_id_accepts_typical_names() {
        for ok in ["portfolio-1", "quote:AAPL", "ledger/2024.q1", "a_b"] {
            assert!(StreamId::new(ok).is_ok(), "{ok} should be valid");
        }
    }

    #[test]
    fn stream_id_rejects_malformed_names() {
        assert!(matches!(StreamId::new(""), Err(DomainError::InvalidId(_))));
        assert!(StreamId::new("has space").is_err());
        assert!(StreamId::new("x".repeat(MAX_ID_LEN + 1)).is_err());
    }

    #[test]
    fn text_ids_validate_on_deserialize() {
        let ok: StreamId = serde_json::from_str("\"portfolio-1\"").unwrap();
        assert_eq!(ok.as_str(), "portfolio-1");

        let bad: Result<ConsumerId, _> = serde_json::from_str("\"\"");
        assert!(bad.is_err());
    }

    #[test]
    fn uuid_ids_round_trip_through_display() {
        let id = CorrelationId::new();
        let parsed: CorrelationId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }
}
