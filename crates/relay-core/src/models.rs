//! Domain models and strongly-typed identifiers.
//!
//! Defines events, processor configurations, delivery records, and newtype
//! ID wrappers for compile-time type safety. Database codec impls live here
//! so the types round-trip through sqlx without ad-hoc casts at call sites.

use std::{fmt, str::FromStr, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

type PgDb = sqlx::Postgres;
type PgRow = sqlx::postgres::PgRow;
type PgValueRef<'r> = sqlx::postgres::PgValueRef<'r>;
type PgTypeInfo = sqlx::postgres::PgTypeInfo;
type PgArgumentBuffer = sqlx::postgres::PgArgumentBuffer;
type EncodeResult =
    Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync + 'static>>;
type BoxDynError = sqlx::error::BoxDynError;

/// Declares a UUID newtype with Display, conversions, and Postgres codecs.
macro_rules! uuid_id {
    ($(#[$attr:meta])* $name:ident) => {
        $(#[$attr])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Creates a new random identifier.
            pub fn new() -> Self {
                Self(Uuid::new_v4())
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

        impl From<Uuid> for $name {
            fn from(uuid: Uuid) -> Self {
                Self(uuid)
            }
        }

        impl sqlx::Type<PgDb> for $name {
            fn type_info() -> PgTypeInfo {
                <Uuid as sqlx::Type<PgDb>>::type_info()
            }
        }

        impl<'r> sqlx::Decode<'r, PgDb> for $name {
            fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
                Ok(Self(<Uuid as sqlx::Decode<PgDb>>::decode(value)?))
            }
        }

        impl sqlx::Encode<'_, PgDb> for $name {
            fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
                <Uuid as sqlx::Encode<PgDb>>::encode_by_ref(&self.0, buf)
            }
        }
    };
}

uuid_id! {
    /// Identifier of a domain event.
    ///
    /// Events are immutable facts; this ID follows an event from the domain
    /// mutation that produced it through every delivery created for it.
    EventId
}

uuid_id! {
    /// Identifier of a tenant (a client organization on the platform).
    ///
    /// All processor configs and deliveries are scoped to a client, which
    /// is the multi-tenancy isolation boundary.
    ClientId
}

uuid_id! {
    /// Identifier of a processor configuration.
    ConfigId
}

uuid_id! {
    /// Identifier of an event delivery (one event/config pairing).
    DeliveryId
}

uuid_id! {
    /// Identifier of a broker task.
    TaskId
}

/// Declares Display + FromStr + Postgres TEXT codecs for a string-backed
/// enum.
macro_rules! text_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            /// Stable wire/database representation.
            pub const fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(format!(
                        concat!("invalid ", stringify!($name), ": {}"),
                        other
                    )),
                }
            }
        }

        impl sqlx::Type<PgDb> for $name {
            fn type_info() -> PgTypeInfo {
                <&str as sqlx::Type<PgDb>>::type_info()
            }
        }

        impl<'r> sqlx::Decode<'r, PgDb> for $name {
            fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
                let s = <&str as sqlx::Decode<PgDb>>::decode(value)?;
                s.parse().map_err(Into::into)
            }
        }

        impl sqlx::Encode<'_, PgDb> for $name {
            fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
                <&str as sqlx::Encode<PgDb>>::encode_by_ref(&self.as_str(), buf)
            }
        }
    };
}

/// Kind of domain mutation an event describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// Entity was created.
    Created,
    /// Entity was updated.
    Updated,
    /// Entity was closed (sessions, surveys).
    Closed,
}

text_enum!(EventType {
    Created => "created",
    Updated => "updated",
    Closed => "closed",
});

/// Domain entity an event refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    /// A message within a chat session.
    ChatMessage,
    /// A chat session between a contact and agents.
    ChatSession,
    /// A CSAT survey response.
    CsatResponse,
}

text_enum!(EntityType {
    ChatMessage => "chat_message",
    ChatSession => "chat_session",
    CsatResponse => "csat_response",
});

/// Named broker queues consumed by the worker pool.
///
/// Queue names are stable wire strings; each queue has an independently
/// configured concurrency limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueName {
    /// Event delivery tasks.
    Events,
    /// Workflow execution tasks (heavier, long-running).
    Workflow,
    /// Low-priority background tasks.
    Default,
}

text_enum!(QueueName {
    Events => "events",
    Workflow => "workflow",
    Default => "default",
});

impl QueueName {
    /// All queues the worker pool consumes.
    pub const ALL: [QueueName; 3] = [Self::Events, Self::Workflow, Self::Default];
}

/// Delivery lifecycle status.
///
/// Transitions are strictly controlled by the tracking service:
///
/// ```text
/// pending ──▶ in_flight ──▶ succeeded
///    ▲            │
///    │            ├──▶ failed_retryable ──▶ (re-claimed once eligible)
///    │            │            │
///    └────────────┘            └──▶ exhausted
/// ```
///
/// `succeeded` and `exhausted` are terminal and never transition further.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    /// Created, waiting for a worker to claim it.
    Pending,
    /// A worker holds the in-flight gate and is attempting delivery.
    ///
    /// At most one attempt may hold this state per delivery at any time.
    InFlight,
    /// Delivered successfully. Terminal.
    Succeeded,
    /// Last attempt failed transiently; eligible for retry once
    /// `next_eligible_at` has elapsed.
    FailedRetryable,
    /// Retry budget spent or a permanent failure occurred. Terminal.
    Exhausted,
}

text_enum!(DeliveryStatus {
    Pending => "pending",
    InFlight => "in_flight",
    Succeeded => "succeeded",
    FailedRetryable => "failed_retryable",
    Exhausted => "exhausted",
});

impl DeliveryStatus {
    /// Whether this status permits no further transitions.
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Exhausted)
    }
}

/// Classification of a single delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    /// Destination accepted the delivery (2xx).
    Success,
    /// Retry-eligible failure: network error, timeout, or 5xx.
    TransientFailure,
    /// Non-retryable failure: 4xx, malformed target, validation error.
    PermanentFailure,
}

text_enum!(AttemptOutcome {
    Success => "success",
    TransientFailure => "transient_failure",
    PermanentFailure => "permanent_failure",
});

/// Strategy for computing retry delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Constant delay between attempts.
    Fixed,
    /// Delay grows by `base_delay` per attempt.
    Linear,
    /// Delay doubles each attempt.
    Exponential,
}

text_enum!(BackoffStrategy {
    Fixed => "fixed",
    Linear => "linear",
    Exponential => "exponential",
});

/// Per-config retry timing parameters.
///
/// Stored as JSONB alongside the processor config so tenants can tune retry
/// behavior per destination. Delay computation lives in `relay-delivery`;
/// whatever the strategy, delays are non-decreasing in the attempt count.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// Strategy for computing the delay from the attempt count.
    pub strategy: BackoffStrategy,
    /// Base delay in milliseconds.
    pub base_delay_ms: u64,
    /// Upper bound on any single delay, in milliseconds.
    pub max_delay_ms: u64,
    /// Additive jitter as a fraction of `base_delay_ms`, clamped to [0, 1].
    ///
    /// Kept below the base delay so jittered delays stay monotone across
    /// attempts.
    pub jitter_factor: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            strategy: BackoffStrategy::Linear,
            base_delay_ms: 10_000,
            max_delay_ms: 3_600_000,
            jitter_factor: 0.25,
        }
    }
}

impl BackoffPolicy {
    /// Base delay as a `Duration`.
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    /// Maximum delay as a `Duration`.
    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

/// An immutable fact describing a domain mutation.
///
/// Produced by the CRUD layer whenever a tracked entity changes; never
/// mutated afterwards. Deliveries reference events but do not own them, and
/// the full event rides inside the delivery task payload so workers need no
/// synchronous re-fetch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Unique identifier for this event.
    pub event_id: EventId,
    /// Kind of mutation.
    pub event_type: EventType,
    /// Entity the mutation applies to.
    pub entity_type: EntityType,
    /// Identifier of the mutated entity.
    pub entity_id: Uuid,
    /// Tenant that owns the entity.
    pub client_id: ClientId,
    /// Causing or containing entity, when threaded (e.g. the session a
    /// message belongs to).
    pub parent_id: Option<Uuid>,
    /// Opaque structured payload forwarded to processors.
    pub payload: Value,
    /// When the mutation happened.
    pub occurred_at: DateTime<Utc>,
}

/// Destination descriptor of a processor config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    /// Broker queue delivery tasks for this config are routed to.
    pub queue: QueueName,
    /// Destination webhook URL.
    pub url: String,
}

/// A tenant-scoped subscription rule mapping event criteria to a
/// destination.
///
/// Created and edited by the CRUD layer; read-only to this subsystem. Only
/// configs with `active = true` participate in matching.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessorConfig {
    /// Unique identifier for this config.
    pub id: ConfigId,
    /// Tenant that owns this config.
    pub client_id: ClientId,
    /// Entity type this config subscribes to.
    pub entity_type: EntityType,
    /// Event type filter; `None` subscribes to every event type.
    pub event_type: Option<EventType>,
    /// Delivery destination and queue routing.
    pub target: Target,
    /// Whether this config participates in matching.
    pub active: bool,
    /// Maximum delivery attempts, including the first.
    pub max_attempts: i32,
    /// Retry timing parameters.
    pub backoff: BackoffPolicy,
    /// When this config was created.
    pub created_at: DateTime<Utc>,
    /// When this config was last modified.
    pub updated_at: DateTime<Utc>,
}

impl ProcessorConfig {
    /// Whether this config subscribes to the given event.
    ///
    /// Inactive configs never match. The event type filter is satisfied by
    /// an exact match or by a wildcard (`None`) filter.
    pub fn matches(&self, event: &Event) -> bool {
        self.active
            && self.entity_type == event.entity_type
            && self.event_type.map_or(true, |t| t == event.event_type)
    }
}

impl<'r> sqlx::FromRow<'r, PgRow> for ProcessorConfig {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        use sqlx::Row;

        let backoff: sqlx::types::Json<BackoffPolicy> = row.try_get("backoff")?;

        Ok(Self {
            id: row.try_get("id")?,
            client_id: row.try_get("client_id")?,
            entity_type: row.try_get("entity_type")?,
            event_type: row.try_get("event_type")?,
            target: Target { queue: row.try_get("queue")?, url: row.try_get("url")? },
            active: row.try_get("active")?,
            max_attempts: row.try_get("max_attempts")?,
            backoff: backoff.0,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

/// One tracked fan-out target for one event.
///
/// Exactly one delivery exists per (`event_id`, `config_id`) pair; the
/// publisher enforces this with an idempotent create. Deliveries are never
/// deleted — terminal records are retained for audit.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct EventDelivery {
    /// Unique identifier for this delivery.
    pub id: DeliveryId,
    /// Event being delivered.
    pub event_id: EventId,
    /// Config this delivery targets.
    pub config_id: ConfigId,
    /// Current lifecycle status.
    pub status: DeliveryStatus,
    /// Number of completed attempts. Never exceeds the config's
    /// `max_attempts`.
    pub attempt_count: i32,
    /// Earliest time the next attempt may start, when retrying.
    pub next_eligible_at: Option<DateTime<Utc>>,
    /// When this delivery was created.
    pub created_at: DateTime<Utc>,
    /// When this delivery last changed state.
    pub updated_at: DateTime<Utc>,
}

impl EventDelivery {
    /// Creates a delivery in `pending` for a newly published event.
    pub fn pending(
        event_id: EventId,
        config_id: ConfigId,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: DeliveryId::new(),
            event_id,
            config_id,
            status: DeliveryStatus::Pending,
            attempt_count: 0,
            next_eligible_at: None,
            created_at,
            updated_at: created_at,
        }
    }
}

/// Immutable record of one delivery execution.
///
/// Appended on every attempt, including synthetic attempts recorded for
/// configuration errors that never reach the network. Never mutated or
/// deleted.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct DeliveryAttempt {
    /// Unique identifier for this attempt.
    pub id: Uuid,
    /// Delivery this attempt belongs to.
    pub delivery_id: DeliveryId,
    /// 1-based, monotonic per delivery.
    pub attempt_number: i32,
    /// When the attempt started.
    pub started_at: DateTime<Utc>,
    /// When the attempt finished.
    pub finished_at: DateTime<Utc>,
    /// Classified outcome.
    pub outcome: AttemptOutcome,
    /// Human-readable failure description, when failed.
    pub error_detail: Option<String>,
    /// Wall-clock duration of the attempt in milliseconds.
    pub latency_ms: i64,
}
