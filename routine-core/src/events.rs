use crate::types::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Runtime events — the durable audit trail for every routine run.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum RuntimeEvent {
    RunStarted {
        run_id: Uuid,
        routine_id: RoutineId,
        model_id: String,
    },
    StepStarted {
        step_id: ElementId,
        step_type: String,
        tool: String,
        strategy: Strategy,
    },
    StepCompleted {
        step_id: ElementId,
        credits_used: f64,
        duration_ms: u64,
    },
    StepFailed {
        step_id: ElementId,
        error: StructuredError,
    },
    EventThrown {
        event_id: ElementId,
        kind: EventKind,
        instance_id: String,
    },
    EventCaught {
        event_id: ElementId,
        kind: EventKind,
        instance_id: String,
    },
    TimerRegistered {
        event_id: ElementId,
        expires_at: Timestamp,
    },
    SignalPublished {
        signal_ref: String,
        scope: String,
    },
    SignalConsumed {
        signal_ref: String,
        signal_id: String,
        by_event: ElementId,
    },
    MessagePublished {
        message_ref: String,
    },
    MessageConsumed {
        message_ref: String,
        message_id: String,
        by_event: ElementId,
    },
    /// A branch parked on a catch event.
    WaitEntered {
        location: Location,
    },
    /// A link throw jumped directly to its matching catch.
    LinkJumped {
        from: ElementId,
        to: ElementId,
        link_name: String,
    },
    PermissionDenied {
        step_id: ElementId,
        step_type: String,
        role: Role,
    },
    RunSuspended {
        waiting_locations: Vec<Location>,
    },
    RunResumed {
        run_id: Uuid,
    },
    RunCompleted {
        steps_executed: u32,
        credits_used: f64,
    },
    RunFailed {
        error: StructuredError,
    },
    RunStopped {
        reason: String,
    },
    /// The hard step ceiling fired on a cyclic routine.
    StepLimitReached {
        limit: u32,
    },
}
