//! The event model: kinds, typed payloads, and the outbox row shape.
//!
//! # Wire encoding
//!
//! Events are encoded as JSON rather than a binary format. This is a deliberate departure
//! from bincode-style encodings: the payload must remain forward-compatible across binary
//! versions — a producer may add a field a consumer doesn't understand yet, and the
//! consumer must still be able to decode the envelope and apply the fields it recognizes.
//! Each payload variant therefore carries a `serde_json::Map` of any additional fields
//! alongside its typed ones, so a round trip through `encode`/`decode` never drops data.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::ids::{EventId, TenantId};

/// Errors raised while constructing or (de)serializing an event.
#[derive(Debug, Error)]
pub enum EventError {
    /// The payload does not match the schema for its declared [`EventKind`].
    #[error("invalid payload for event kind {kind}: {reason}")]
    InvalidPayload {
        /// The kind whose schema was violated.
        kind: EventKind,
        /// Human-readable reason.
        reason: String,
    },

    /// Encoding the event to its wire representation failed.
    #[error("failed to encode event: {0}")]
    Encode(String),

    /// Decoding an event from its wire representation failed.
    #[error("failed to decode event: {0}")]
    Decode(String),

    /// The wire representation names an event kind this binary does not recognize.
    ///
    /// Unlike the other variants, this is not necessarily a bug: it is the normal result
    /// of deploying a new producer before its consumers. Callers that see this should park
    /// the entry (see the dispatcher) rather than treat it as fatal.
    #[error("unknown event kind: {0}")]
    UnknownKind(String),
}

/// The closed set of business facts this system carries.
///
/// New kinds are added by extending this enum and registering a handler; the outbox and
/// transport are agnostic to which kinds exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// A sales quote was created.
    QuoteCreated,
    /// A sales quote was converted into an order.
    QuoteConverted,
    /// A sale was recorded against inventory.
    SaleRecorded,
    /// An order's status changed.
    OrderStatusChanged,
    /// A product's price changed. Reserved: no handler ships with this crate yet.
    ProductPriceUpdated,
    /// A product's stock level changed. Reserved: no handler ships with this crate yet.
    StockUpdated,
}

impl EventKind {
    /// All kinds, in declaration order. Used to enumerate streams at startup.
    #[must_use]
    pub const fn all() -> &'static [EventKind] {
        &[
            EventKind::QuoteCreated,
            EventKind::QuoteConverted,
            EventKind::SaleRecorded,
            EventKind::OrderStatusChanged,
            EventKind::ProductPriceUpdated,
            EventKind::StockUpdated,
        ]
    }

    /// The stable string tag used in storage, on the wire, and as the Redis stream name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            EventKind::QuoteCreated => "quote_created",
            EventKind::QuoteConverted => "quote_converted",
            EventKind::SaleRecorded => "sale_recorded",
            EventKind::OrderStatusChanged => "order_status_changed",
            EventKind::ProductPriceUpdated => "product_price_updated",
            EventKind::StockUpdated => "stock_updated",
        }
    }

    /// Parse a kind from its stable string tag.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::UnknownKind`] if `s` is not one of the recognized tags.
    pub fn parse(s: &str) -> Result<Self, EventError> {
        match s {
            "quote_created" => Ok(EventKind::QuoteCreated),
            "quote_converted" => Ok(EventKind::QuoteConverted),
            "sale_recorded" => Ok(EventKind::SaleRecorded),
            "order_status_changed" => Ok(EventKind::OrderStatusChanged),
            "product_price_updated" => Ok(EventKind::ProductPriceUpdated),
            "stock_updated" => Ok(EventKind::StockUpdated),
            other => Err(EventError::UnknownKind(other.to_string())),
        }
    }

    /// The name of the Redis stream carrying events of this kind.
    #[must_use]
    pub const fn stream_name(&self) -> &'static str {
        self.as_str()
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single line item shared by the quote/sale payload shapes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineItem {
    /// Opaque product identifier.
    pub product_id: String,
    /// Quantity as a decimal string, to avoid float rounding in monetary contexts.
    pub quantity: String,
    /// Unit price as a decimal string.
    pub unit_price: String,
    /// Extended total as a decimal string.
    pub total: String,
}

/// Normative v1.0 fields per [`EventKind`]. Each variant also carries `extra`, a map of any
/// additional fields present on the wire that this binary does not interpret but must
/// preserve.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Payload {
    /// See [`EventKind::QuoteCreated`].
    QuoteCreated {
        /// Quote identifier.
        quote_id: String,
        /// Client identifier.
        client_id: String,
        /// Line items on the quote.
        items: Vec<LineItem>,
        /// Fields not covered by this schema version.
        #[serde(flatten)]
        extra: Map<String, Value>,
    },
    /// See [`EventKind::QuoteConverted`].
    QuoteConverted {
        /// The quote that was converted.
        quote_id: String,
        /// The order created from the quote.
        order_id: String,
        /// Client identifier.
        client_id: String,
        /// Optional job/work identifier the order belongs to.
        #[serde(default)]
        work_id: Option<String>,
        /// Line items carried over from the quote.
        items: Vec<LineItem>,
        /// Total value as a decimal string.
        total_value: String,
        /// The user who performed the conversion.
        converted_by: String,
        /// When the conversion happened.
        converted_at: DateTime<Utc>,
        /// Fields not covered by this schema version.
        #[serde(flatten)]
        extra: Map<String, Value>,
    },
    /// See [`EventKind::SaleRecorded`].
    SaleRecorded {
        /// The order the sale was recorded against.
        order_id: String,
        /// Originating quote, if any.
        #[serde(default)]
        quote_id: Option<String>,
        /// Client identifier.
        client_id: String,
        /// Optional job/work identifier.
        #[serde(default)]
        work_id: Option<String>,
        /// When the sale was delivered.
        delivered_at: DateTime<Utc>,
        /// Total value as a decimal string.
        total_value: String,
        /// Items sold.
        items: Vec<LineItem>,
        /// Fields not covered by this schema version.
        #[serde(flatten)]
        extra: Map<String, Value>,
    },
    /// See [`EventKind::OrderStatusChanged`].
    OrderStatusChanged {
        /// The order whose status changed.
        order_id: String,
        /// Previous status, opaque to this crate.
        old_status: String,
        /// New status, opaque to this crate.
        new_status: String,
        /// When the change happened.
        changed_at: DateTime<Utc>,
        /// Who made the change.
        changed_by: String,
        /// Fields not covered by this schema version.
        #[serde(flatten)]
        extra: Map<String, Value>,
    },
    /// See [`EventKind::ProductPriceUpdated`]. Reserved; shape owned by the consuming engine.
    ProductPriceUpdated {
        /// Arbitrary fields, entirely engine-defined.
        #[serde(flatten)]
        extra: Map<String, Value>,
    },
    /// See [`EventKind::StockUpdated`]. Reserved; shape owned by the consuming engine.
    StockUpdated {
        /// Arbitrary fields, entirely engine-defined.
        #[serde(flatten)]
        extra: Map<String, Value>,
    },
}

impl Payload {
    /// The [`EventKind`] this payload was constructed for.
    #[must_use]
    pub const fn kind(&self) -> EventKind {
        match self {
            Payload::QuoteCreated { .. } => EventKind::QuoteCreated,
            Payload::QuoteConverted { .. } => EventKind::QuoteConverted,
            Payload::SaleRecorded { .. } => EventKind::SaleRecorded,
            Payload::OrderStatusChanged { .. } => EventKind::OrderStatusChanged,
            Payload::ProductPriceUpdated { .. } => EventKind::ProductPriceUpdated,
            Payload::StockUpdated { .. } => EventKind::StockUpdated,
        }
    }
}

/// Lifecycle status of an outbox row. See the transition graph in the module-level docs of
/// the outbox store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxStatus {
    /// Staged, not yet claimed by any relay instance.
    Pending,
    /// Claimed by a relay instance; in flight to the transport.
    Publishing,
    /// Durably appended to the transport.
    Published,
    /// Exhausted its retry budget; terminal.
    Failed,
}

impl OutboxStatus {
    /// Parse a status from its stable database string representation.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::Decode`] if `s` is not a recognized status.
    pub fn parse(s: &str) -> Result<Self, EventError> {
        match s {
            "pending" => Ok(OutboxStatus::Pending),
            "publishing" => Ok(OutboxStatus::Publishing),
            "published" => Ok(OutboxStatus::Published),
            "failed" => Ok(OutboxStatus::Failed),
            other => Err(EventError::Decode(format!("invalid outbox status: {other}"))),
        }
    }
}

impl fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OutboxStatus::Pending => "pending",
            OutboxStatus::Publishing => "publishing",
            OutboxStatus::Published => "published",
            OutboxStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// An outbox row: the authoritative record of one event, from staging through delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    /// Globally unique identity of this event.
    pub event_id: EventId,
    /// Owning tenant.
    pub tenant_id: TenantId,
    /// Business fact kind.
    pub kind: EventKind,
    /// Payload schema version, e.g. `"1.0"`.
    pub version: String,
    /// The typed payload.
    pub payload: Payload,
    /// Current lifecycle status.
    pub status: OutboxStatus,
    /// Number of publish attempts that have failed so far.
    pub retry_count: u32,
    /// The most recent failure reason, if any.
    pub error_message: Option<String>,
    /// When the row was staged.
    pub created_at: DateTime<Utc>,
    /// When the row transitioned to `published`, if it has.
    pub published_at: Option<DateTime<Utc>>,
    /// When the row transitioned to `failed`, if it has.
    pub failed_at: Option<DateTime<Utc>>,
}

impl EventRecord {
    /// Construct a new, unsaved event record in `pending` status.
    ///
    /// Assigns a fresh [`EventId`] and stamps `created_at`. Validates that `payload.kind()`
    /// matches `kind`; callers that already have a typed `Payload` rarely need to pass
    /// a mismatched kind, but this guards against a caller building the envelope by hand.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::InvalidPayload`] if the payload's kind does not match `kind`.
    pub fn new(
        tenant_id: TenantId,
        kind: EventKind,
        payload: Payload,
        version: impl Into<String>,
    ) -> Result<Self, EventError> {
        if payload.kind() != kind {
            return Err(EventError::InvalidPayload {
                kind,
                reason: format!("payload is for kind {}", payload.kind()),
            });
        }

        Ok(Self {
            event_id: EventId::new(),
            tenant_id,
            kind,
            version: version.into(),
            payload,
            status: OutboxStatus::Pending,
            retry_count: 0,
            error_message: None,
            created_at: Utc::now(),
            published_at: None,
            failed_at: None,
        })
    }

    /// Encode the event body (kind, tenant, payload) that the transport carries.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::Encode`] if JSON serialization fails, which can only happen
    /// for a non-finite float or similarly malformed payload.
    pub fn to_wire(&self) -> Result<WireEvent, EventError> {
        let payload = serde_json::to_value(&self.payload)
            .map_err(|e| EventError::Encode(e.to_string()))?;
        Ok(WireEvent {
            event_id: self.event_id,
            tenant_id: self.tenant_id,
            kind: self.kind,
            version: self.version.clone(),
            payload,
        })
    }
}

/// The self-describing JSON envelope that crosses the transport. Distinct from
/// [`EventRecord`] because the transport need not know about outbox-only fields like
/// `status` or `retry_count`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireEvent {
    /// Globally unique identity of this event.
    pub event_id: EventId,
    /// Owning tenant.
    pub tenant_id: TenantId,
    /// Business fact kind.
    pub kind: EventKind,
    /// Payload schema version.
    pub version: String,
    /// The payload as a generic JSON value; the dispatcher reparses it into a typed
    /// [`Payload`] only once it knows which handlers are about to run.
    pub payload: Value,
}

impl WireEvent {
    /// Serialize to the JSON bytes that `XADD` carries as the entry's `data` field.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::Encode`] if JSON serialization fails.
    pub fn to_bytes(&self) -> Result<Vec<u8>, EventError> {
        serde_json::to_vec(self).map_err(|e| EventError::Encode(e.to_string()))
    }

    /// Deserialize from the JSON bytes read back off the transport.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::Decode`] if the bytes are not valid JSON or do not match the
    /// envelope shape. Unknown payload fields are preserved, not rejected; only a malformed
    /// envelope (missing `event_id`, etc.) is an error here.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, EventError> {
        serde_json::from_slice(bytes).map_err(|e| EventError::Decode(e.to_string()))
    }

    /// Parse `self.payload` into a typed [`Payload`] for the declared `kind`.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::InvalidPayload`] if the JSON value does not match the schema
    /// for `self.kind`.
    pub fn typed_payload(&self) -> Result<Payload, EventError> {
        serde_json::from_value(self.payload.clone()).map_err(|e| EventError::InvalidPayload {
            kind: self.kind,
            reason: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_payload() -> Payload {
        Payload::SaleRecorded {
            order_id: "order-1".to_string(),
            quote_id: Some("quote-1".to_string()),
            client_id: "client-1".to_string(),
            work_id: None,
            delivered_at: Utc::now(),
            total_value: "320.00".to_string(),
            items: vec![LineItem {
                product_id: "sku-1".to_string(),
                quantity: "10.000".to_string(),
                unit_price: "32.00".to_string(),
                total: "320.00".to_string(),
            }],
            extra: Map::new(),
        }
    }

    #[test]
    fn new_rejects_mismatched_kind() {
        let err = EventRecord::new(
            TenantId::new(),
            EventKind::QuoteCreated,
            sample_payload(),
            "1.0",
        )
        .unwrap_err();
        assert!(matches!(err, EventError::InvalidPayload { .. }));
    }

    #[test]
    fn wire_roundtrip_preserves_unknown_fields() {
        let record =
            EventRecord::new(TenantId::new(), EventKind::SaleRecorded, sample_payload(), "1.0")
                .expect("valid record");
        let mut wire = record.to_wire().expect("encode");
        wire.payload
            .as_object_mut()
            .expect("object")
            .insert("future_field".to_string(), Value::String("x".to_string()));

        let bytes = wire.to_bytes().expect("encode bytes");
        let decoded = WireEvent::from_bytes(&bytes).expect("decode bytes");

        assert_eq!(decoded.event_id, record.event_id);
        assert_eq!(decoded.tenant_id, record.tenant_id);
        assert_eq!(decoded.kind, record.kind);
        assert_eq!(decoded.payload["future_field"], Value::String("x".to_string()));
    }

    #[test]
    fn event_kind_string_roundtrip() {
        for kind in EventKind::all() {
            assert_eq!(EventKind::parse(kind.as_str()).expect("parses"), *kind);
        }
    }

    #[test]
    fn unknown_kind_string_is_an_error() {
        let err = EventKind::parse("not_a_real_kind").unwrap_err();
        assert!(matches!(err, EventError::UnknownKind(_)));
    }
}
