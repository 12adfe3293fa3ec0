use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;
use uuid::Uuid;

// ─── Scalar aliases ───────────────────────────────────────────

/// Model element identifier (unique within one process model).
pub type ElementId = String;

/// Routine (workflow or sub-workflow) instance identifier.
pub type RoutineId = String;

/// UTC wall-clock instant.
pub type Timestamp = DateTime<Utc>;

/// Variable / payload value. Opaque to the engine except where the
/// conditional expression language inspects it.
pub type Value = serde_json::Value;

// ─── Location ─────────────────────────────────────────────────

/// What a location points at: a plain node, or one of the suspend
/// kinds a catch event parks a branch in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LocationKind {
    Node,
    TimerWaiting,
    SignalWaiting,
    IntermediateWaiting,
    EventWaiting,
}

/// Serializable pointer to "where execution currently is" within a
/// routine instance. Owned by the executor; the navigator and the
/// intermediate event handler only ever construct new values.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Location {
    /// Model element this location points at.
    pub id: ElementId,
    pub routine_id: RoutineId,
    pub kind: LocationKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_node_id: Option<ElementId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<ElementId>,
    /// Kind-specific extras (serialized timer expiry, link name,
    /// condition text). Free-form on purpose.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, Value>,
}

impl Location {
    pub fn node(id: impl Into<ElementId>, routine_id: impl Into<RoutineId>) -> Self {
        Self {
            id: id.into(),
            routine_id: routine_id.into(),
            kind: LocationKind::Node,
            parent_node_id: None,
            event_id: None,
            metadata: BTreeMap::new(),
        }
    }

    /// True if this location parks a branch rather than pointing at
    /// an executable node.
    pub fn is_waiting(&self) -> bool {
        !matches!(self.kind, LocationKind::Node)
    }
}

// ─── Event instances ──────────────────────────────────────────

/// Intermediate event classification, extracted once from the model
/// element's event definition.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Timer,
    Signal,
    Message,
    Error,
    Escalation,
    Compensation,
    Conditional,
    Link,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventSource {
    IntermediateThrow,
    IntermediateCatch,
    External,
}

/// Immutable record of a fired event. `id` is time-ordered (UUIDv7)
/// so the fired log sorts chronologically by id.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EventInstance {
    pub id: String,
    /// Source model element id.
    pub event_id: ElementId,
    pub kind: EventKind,
    pub payload: Value,
    pub fired_at: Timestamp,
    pub source: EventSource,
}

impl EventInstance {
    pub fn new(
        event_id: impl Into<ElementId>,
        kind: EventKind,
        payload: Value,
        source: EventSource,
        now: Timestamp,
    ) -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            event_id: event_id.into(),
            kind,
            payload,
            fired_at: now,
            source,
        }
    }
}

// ─── Run state machine ────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    /// Parked on one or more catch events; resumable.
    Suspended,
    Stopped,
}

impl RunStatus {
    /// Returns true if no further progress is possible without an
    /// external resumption trigger.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Stopped
        )
    }
}

/// Per-run bookkeeping persisted by the context store.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: Uuid,
    pub routine_id: RoutineId,
    pub status: RunStatus,
    pub steps_executed: u32,
    pub credits_used: f64,
    /// Set when the hard step ceiling terminated a cyclic routine.
    /// The run still reports Completed — see ExecutorConfig docs.
    pub step_limit_reached: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StructuredError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<String>,
    pub started_at: Timestamp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<Timestamp>,
}

// ─── Steps ────────────────────────────────────────────────────

/// Execution strategy inferred for a step: fixed tool plumbing versus
/// model-driven reasoning.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    Deterministic,
    Reasoning,
}

/// What the navigator reports for an actionable node.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StepInfo {
    pub id: ElementId,
    pub name: String,
    pub step_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub config: Value,
    /// True for intermediate throw/catch nodes — the executor must
    /// route these through the event handler, never the step executor.
    pub is_event: bool,
}

/// Derived sub-request handed to the external step executor.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StepRequest {
    pub run_id: Uuid,
    pub routine_id: RoutineId,
    pub step_id: ElementId,
    pub tool: String,
    pub strategy: Strategy,
    pub inputs: BTreeMap<String, Value>,
    pub config: Value,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct StepMetadata {
    pub tokens_used: u64,
    pub credits_cost: f64,
    pub duration_ms: u64,
}

/// Result of one external step execution. Failures may also arrive as
/// rejected futures; both channels are treated as failure.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StepOutcome {
    pub success: bool,
    pub outputs: BTreeMap<String, Value>,
    pub metadata: StepMetadata,
}

// ─── Resource allocation ──────────────────────────────────────

/// Estimated requirements the executor passes to the allocator.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StepRequirements {
    pub step_id: ElementId,
    pub step_type: String,
    pub estimated_credits: f64,
}

/// A budget grant scoped to one step's execution.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Allocation {
    pub allocation_id: Uuid,
    pub credits_granted: f64,
    /// Exceeding this is a step failure.
    pub timeout_ms: u64,
}

/// Reported back to the allocator on release.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StepUsage {
    pub credits_used: f64,
    /// False when reporting partial usage after a failure.
    pub completed: bool,
}

// ─── Roles ────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    Agent,
    User,
    Guest,
}

// ─── Errors ───────────────────────────────────────────────────

/// Structured step failure surfaced on the run record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StructuredError {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tier: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<Strategy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_point: Option<ElementId>,
}

impl std::fmt::Display for StructuredError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

/// Engine error taxonomy. Modeling errors are fatal and never retried;
/// step failures carry the structured record that lands on the run.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("modeling error: {0}")]
    Modeling(String),
    #[error("Permission denied: role {role:?} may not execute '{step_type}' steps")]
    PermissionDenied { role: Role, step_type: String },
    #[error("step execution failed: {0}")]
    Step(StructuredError),
    #[error("resource allocation failed: {0}")]
    Allocation(String),
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn location_round_trips_through_serde() {
        let mut metadata = BTreeMap::new();
        metadata.insert("linkName".to_string(), Value::from("handoff"));
        metadata.insert("expiresAt".to_string(), Value::from("2026-01-01T00:00:00Z"));

        let loc = Location {
            id: "catch_1".to_string(),
            routine_id: "routine_a".to_string(),
            kind: LocationKind::SignalWaiting,
            parent_node_id: Some("task_3".to_string()),
            event_id: Some("ev_9".to_string()),
            metadata,
        };

        let json = serde_json::to_string(&loc).unwrap();
        let back: Location = serde_json::from_str(&json).unwrap();
        assert_eq!(back, loc);
    }

    #[test]
    fn location_kind_serializes_snake_case() {
        let json = serde_json::to_string(&LocationKind::TimerWaiting).unwrap();
        assert_eq!(json, "\"timer_waiting\"");
    }

    #[test]
    fn terminal_statuses() {
        assert!(RunStatus::Completed.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!(RunStatus::Stopped.is_terminal());
        assert!(!RunStatus::Suspended.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
        assert!(!RunStatus::Pending.is_terminal());
    }

    #[test]
    fn event_instance_ids_are_time_ordered() {
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let a = EventInstance::new("e1", EventKind::Signal, Value::Null, EventSource::IntermediateThrow, now);
        let b = EventInstance::new("e1", EventKind::Signal, Value::Null, EventSource::IntermediateThrow, now);
        assert!(a.id < b.id, "UUIDv7 ids must sort by creation order");
    }

    #[test]
    fn permission_error_message_is_pattern_matchable() {
        let err = EngineError::PermissionDenied {
            role: Role::Guest,
            step_type: "subroutine".to_string(),
        };
        assert!(err.to_string().contains("Permission denied"));
    }
}
