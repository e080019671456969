//! Typed ID definitions for orchestrator resources.
//!
//! Run IDs are random UUIDs minted by the ingestion side. Project IDs are
//! either supplied explicitly or derived from a stable hash of the
//! repository full name.

use sha2::{Digest, Sha256};

use crate::{define_id, IdError, Uuid};

define_id!(RunId, "run");
define_id!(ProjectId, "project");

/// Domain separator mixed into project ID derivation.
const PROJECT_DERIVATION_DOMAIN: &[u8] = b"runbay:project:";

impl ProjectId {
    /// Derives a stable project ID from a key (normally `owner/repo`).
    ///
    /// The key is trimmed and lower-cased before hashing, so `Org/Repo` and
    /// `org/repo` resolve to the same project.
    pub fn derive(key: &str) -> Result<Self, IdError> {
        let normalized = key.trim().to_lowercase();
        if normalized.is_empty() {
            return Err(IdError::BlankDerivationKey { kind: Self::KIND });
        }

        let mut hasher = Sha256::new();
        hasher.update(PROJECT_DERIVATION_DOMAIN);
        hasher.update(normalized.as_bytes());
        let digest = hasher.finalize();

        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(&digest[..16]);
        Ok(Self(uuid::Builder::from_custom_bytes(bytes).into_uuid()))
    }

    /// Derives the project ID for a run: from the repository full name when
    /// known, otherwise from the correlation ID.
    pub fn derive_for_run(
        repository_full_name: Option<&str>,
        correlation_id: &str,
    ) -> Result<Self, IdError> {
        match repository_full_name.map(str::trim).filter(|s| !s.is_empty()) {
            Some(repo) => Self::derive(repo),
            None => Self::derive(&format!("correlation:{correlation_id}")),
        }
    }
}

/// Keeps the ASCII alphanumerics of `input`, lower-cased, truncated to `len`.
#[must_use]
pub fn compact(input: &str, len: usize) -> String {
    input
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .map(|c| c.to_ascii_lowercase())
        .take(len)
        .collect()
}

/// Parses a UUID-shaped string without binding it to a resource kind.
pub fn parse_uuid(s: &str) -> Option<Uuid> {
    Uuid::parse_str(s.trim()).ok()
}

// =============================================================================
// Events
// =============================================================================

/// Flow event ID is a store-assigned monotonic integer, not UUID-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EventId(i64);

impl EventId {
    /// Creates a new EventId from an i64.
    #[must_use]
    pub const fn new(id: i64) -> Self {
        Self(id)
    }

    /// Returns the underlying i64 value.
    #[must_use]
    pub const fn value(&self) -> i64 {
        self.0
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for EventId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

impl serde::Serialize for EventId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_i64(self.0)
    }
}

impl<'de> serde::Deserialize<'de> for EventId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let id = i64::deserialize(deserializer)?;
        Ok(Self(id))
    }
}

// =============================================================================
// Tests
// =============================================================================
