//! Task envelope and payload wire schema.
//!
//! The payload is a closed, serde-tagged union: dispatch happens on the
//! `TaskKind` enum, never on free-form strings, so an unrecognized kind
//! fails at decode time with an explicit error instead of silently routing
//! nowhere.

use chrono::{DateTime, Utc};
use relay_core::{DeliveryId, Event};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{QueueError, Result};

/// Closed set of task kinds the pool can dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// Deliver one event to one processor config.
    Delivery,
    /// Run a named workflow.
    Workflow,
}

impl TaskKind {
    /// Stable wire representation, matching the envelope's `kind` tag.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Delivery => "delivery",
            Self::Workflow => "workflow",
        }
    }
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload of a delivery task.
///
/// Carries the full event so the handler needs no synchronous re-fetch;
/// the delivery row is the only state it loads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryTask {
    /// Delivery this task executes one attempt for.
    pub delivery_id: DeliveryId,
    /// The event being delivered.
    pub event: Event,
}

/// Payload of a workflow task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowTask {
    /// Name of the workflow to run.
    pub workflow: String,
    /// Opaque workflow input.
    pub input: Value,
}

/// Tagged task payload union.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskPayload {
    /// Event delivery work.
    Delivery(DeliveryTask),
    /// Workflow execution work.
    Workflow(WorkflowTask),
}

impl TaskPayload {
    /// Kind tag of this payload.
    pub const fn kind(&self) -> TaskKind {
        match self {
            Self::Delivery(_) => TaskKind::Delivery,
            Self::Workflow(_) => TaskKind::Workflow,
        }
    }
}

/// Durable unit of work stored in the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEnvelope {
    /// The work to perform.
    #[serde(flatten)]
    pub payload: TaskPayload,
    /// When the producer enqueued this task.
    pub enqueued_at: DateTime<Utc>,
}

impl TaskEnvelope {
    /// Creates an envelope around a payload.
    pub fn new(payload: TaskPayload, enqueued_at: DateTime<Utc>) -> Self {
        Self { payload, enqueued_at }
    }

    /// Kind tag of the wrapped payload.
    pub const fn kind(&self) -> TaskKind {
        self.payload.kind()
    }

    /// Serializes the envelope to its stored JSON form.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::Serialization` if encoding fails.
    pub fn to_json(&self) -> Result<Value> {
        serde_json::to_value(self).map_err(QueueError::from)
    }

    /// Decodes an envelope from its stored JSON form.
    ///
    /// An unrecognized `kind` tag maps to `QueueError::UnknownTaskKind` so
    /// the pool can surface it as a distinct failure instead of a generic
    /// decode error.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::UnknownTaskKind` for an unrecognized kind,
    /// `QueueError::Serialization` for any other malformed envelope.
    pub fn from_json(value: Value) -> Result<Self> {
        let kind = value.get("kind").and_then(Value::as_str).map(str::to_owned);

        match serde_json::from_value(value) {
            Ok(envelope) => Ok(envelope),
            Err(err) => match kind {
                Some(kind) if !matches!(kind.as_str(), "delivery" | "workflow") => {
                    Err(QueueError::UnknownTaskKind(kind))
                },
                _ => Err(QueueError::Serialization(err)),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use relay_core::{ClientId, EntityType, EventId, EventType};
    use uuid::Uuid;

    use super::*;

    fn sample_event() -> Event {
        Event {
            event_id: EventId::new(),
            event_type: EventType::Created,
            entity_type: EntityType::ChatMessage,
            entity_id: Uuid::new_v4(),
            client_id: ClientId::new(),
            parent_id: None,
            payload: serde_json::json!({"text": "hello"}),
            occurred_at: Utc::now(),
        }
    }

    #[test]
    fn delivery_envelope_round_trips() {
        let envelope = TaskEnvelope::new(
            TaskPayload::Delivery(DeliveryTask {
                delivery_id: DeliveryId::new(),
                event: sample_event(),
            }),
            Utc::now(),
        );

        let json = envelope.to_json().unwrap();
        assert_eq!(json["kind"], "delivery");

        let decoded = TaskEnvelope::from_json(json).unwrap();
        assert_eq!(decoded, envelope);
        assert_eq!(decoded.kind(), TaskKind::Delivery);
    }

    #[test]
    fn workflow_envelope_round_trips() {
        let envelope = TaskEnvelope::new(
            TaskPayload::Workflow(WorkflowTask {
                workflow: "close_stale_sessions".into(),
                input: serde_json::json!({"older_than_hours": 24}),
            }),
            Utc::now(),
        );

        let decoded = TaskEnvelope::from_json(envelope.to_json().unwrap()).unwrap();
        assert_eq!(decoded.kind(), TaskKind::Workflow);
    }

    #[test]
    fn unknown_kind_is_an_explicit_error() {
        let json = serde_json::json!({
            "kind": "send_email",
            "enqueued_at": Utc::now(),
        });

        match TaskEnvelope::from_json(json) {
            Err(QueueError::UnknownTaskKind(kind)) => assert_eq!(kind, "send_email"),
            other => panic!("expected UnknownTaskKind, got {other:?}"),
        }
    }

    #[test]
    fn malformed_known_kind_is_a_serialization_error() {
        let json = serde_json::json!({
            "kind": "delivery",
            "enqueued_at": Utc::now(),
        });

        assert!(matches!(TaskEnvelope::from_json(json), Err(QueueError::Serialization(_))));
    }
}
