//! Strongly-typed identifiers used across the queue.

use core::str::FromStr;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::QueueError;

/// Globally unique id assigned to a message at first publish.
///
/// It never changes across redeliveries and is the idempotency key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

/// Tenant namespace for configuration entries.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(String);

macro_rules! impl_string_newtype {
    ($t:ty, $name:literal) => {
        impl $t {
            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn into_string(self) -> String {
                self.0
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

        impl FromStr for $t {
            type Err = QueueError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let trimmed = s.trim();
                if trimmed.is_empty() {
                    return Err(QueueError::ConfigInvalid(format!("{} must not be empty", $name)));
                }
                Ok(Self(trimmed.to_string()))
            }
        }

        impl From<&str> for $t {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $t {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

impl_string_newtype!(MessageId, "MessageId");
impl_string_newtype!(TenantId, "TenantId");

impl MessageId {
    /// Create a fresh message id.
    ///
    /// Uses UUIDv7 (time-ordered). Prefer passing ids explicitly in tests
    /// for determinism.
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl TenantId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }
}

impl Default for TenantId {
    fn default() -> Self {
        Self("default".to_string())
    }
}

/// Identity of one connector instance.
///
/// Generated once per connector and used as the key for partition
/// assignment and health heartbeats.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConsumerIdentity {
    pub host: String,
    pub pid: u32,
    pub uuid: Uuid,
}

impl ConsumerIdentity {
    /// Identity for the current process.
    pub fn generate() -> Self {
        let host = std::env::var("HOSTNAME")
            .ok()
            .filter(|h| !h.trim().is_empty())
            .unwrap_or_else(|| "localhost".to_string());

        Self {
            host,
            pid: std::process::id(),
            uuid: Uuid::new_v4(),
        }
    }

    pub fn new(host: impl Into<String>, pid: u32, uuid: Uuid) -> Self {
        Self {
            host: host.into(),
            pid,
            uuid,
        }
    }

    /// Stable string key (`host:pid:uuid`).
    pub fn key(&self) -> String {
        self.to_string()
    }
}

impl core::fmt::Display for ConsumerIdentity {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}:{}:{}", self.host, self.pid, self.uuid)
    }
}

impl FromStr for ConsumerIdentity {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Hostnames never contain ':', the uuid is always the last segment.
        let mut parts = s.rsplitn(3, ':');
        let uuid = parts.next();
        let pid = parts.next();
        let host = parts.next();

        match (host, pid, uuid) {
            (Some(host), Some(pid), Some(uuid)) => {
                let pid = pid
                    .parse::<u32>()
                    .map_err(|e| QueueError::Serialization(format!("consumer pid: {e}")))?;
                let uuid = Uuid::from_str(uuid)
                    .map_err(|e| QueueError::Serialization(format!("consumer uuid: {e}")))?;
                Ok(Self::new(host, pid, uuid))
            }
            _ => Err(QueueError::Serialization(format!(
                "malformed consumer identity: {s}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_ids_are_unique() {
        assert_ne!(MessageId::new(), MessageId::new());
    }

    #[test]
    fn empty_tenant_is_rejected() {
        assert!("  ".parse::<TenantId>().is_err());
        assert_eq!("acme".parse::<TenantId>().unwrap().as_str(), "acme");
    }

    #[test]
    fn consumer_identity_key_parses_back() {
        let id = ConsumerIdentity::new("worker-1", 42, Uuid::new_v4());
        let parsed: ConsumerIdentity = id.key().parse().unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn generated_identity_uses_current_pid() {
        let id = ConsumerIdentity::generate();
        assert_eq!(id.pid, std::process::id());
        assert!(!id.host.is_empty());
    }
}
