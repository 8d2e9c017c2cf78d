//! Tenant and event identifiers.
//!
//! Both are opaque 128-bit values backed by [`uuid::Uuid`]. They are newtypes rather than
//! bare `Uuid` so that a tenant id can never be passed where an event id is expected, and
//! vice versa.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Error returned when parsing a [`TenantId`] or [`EventId`] from a string fails.
#[derive(Debug, thiserror::Error)]
#[error("invalid identifier: {0}")]
pub struct ParseIdError(String);

/// Opaque tenant identifier. Never nil; every event and every derived row carries one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(Uuid);

impl TenantId {
    /// Generate a fresh, random tenant id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing UUID, e.g. when reconstructing a [`TenantId`] from a database row.
    ///
    /// # Errors
    ///
    /// Returns [`ParseIdError`] if `id` is the nil UUID, since a tenant id must never be nil.
    /// A `tenant_id` column is `NOT NULL` but the database does not itself forbid the nil
    /// UUID, so a corrupted or legacy row can still produce one here.
    pub fn from_uuid(id: Uuid) -> Result<Self, ParseIdError> {
        if id.is_nil() {
            return Err(ParseIdError("tenant id must not be nil".to_string()));
        }
        Ok(Self(id))
    }

    /// The underlying UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for TenantId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TenantId {
    type Err = ParseIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let id = Uuid::parse_str(s).map_err(|e| ParseIdError(e.to_string()))?;
        if id.is_nil() {
            return Err(ParseIdError("tenant id must not be nil".to_string()));
        }
        Ok(Self(id))
    }
}

impl From<TenantId> for Uuid {
    fn from(value: TenantId) -> Self {
        value.0
    }
}

/// Globally unique event identifier, assigned by the producer. This is the identity used
/// throughout the outbox, the transport, and the idempotency ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(Uuid);

impl EventId {
    /// Generate a fresh, random event id. Collision probability is negligible at this
    /// system's scale; the outbox's unique index is the actual correctness guarantee.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing UUID, e.g. when reconstructing an [`EventId`] from a database row.
    #[must_use]
    pub const fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    /// The underlying UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for EventId {
    type Err = ParseIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| ParseIdError(e.to_string()))
    }
}

impl From<EventId> for Uuid {
    fn from(value: EventId) -> Self {
        value.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tenant_id_roundtrips_through_display_and_parse() {
        let id = TenantId::new();
        let parsed: TenantId = id.to_string().parse().expect("valid tenant id");
        assert_eq!(id, parsed);
    }

    #[test]
    fn tenant_id_rejects_nil() {
        let parsed = Uuid::nil().to_string().parse::<TenantId>();
        assert!(parsed.is_err());
    }

    #[test]
    fn tenant_id_from_uuid_rejects_nil() {
        assert!(TenantId::from_uuid(Uuid::nil()).is_err());
    }

    #[test]
    fn tenant_id_from_uuid_accepts_non_nil() {
        let id = Uuid::new_v4();
        assert_eq!(TenantId::from_uuid(id).expect("non-nil uuid").as_uuid(), id);
    }

    #[test]
    fn event_id_roundtrips_through_display_and_parse() {
        let id = EventId::new();
        let parsed: EventId = id.to_string().parse().expect("valid event id");
        assert_eq!(id, parsed);
    }

    #[test]
    fn event_ids_are_distinct() {
        assert_ne!(EventId::new(), EventId::new());
    }
}
