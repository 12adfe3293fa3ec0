use crate::model::{EventDefinition, SIGNAL_SCOPE_GLOBAL};
use crate::types::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Variable key under which error-throw events accumulate.
pub const ERRORS_VARIABLE: &str = "errors";

// ─── Event log entries ────────────────────────────────────────

/// An in-flight intermediate event awaiting completion.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PendingEvent {
    pub id: String,
    /// Source model element id.
    pub event_id: ElementId,
    pub kind: EventKind,
    pub waiting: bool,
    pub definition: EventDefinition,
}

/// An active timer, keyed by its source element id.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TimerEvent {
    pub event_id: ElementId,
    pub expires_at: Timestamp,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct EventLog {
    pub pending: Vec<PendingEvent>,
    /// Append-only log of completed event instances.
    pub fired: Vec<EventInstance>,
    pub timers: BTreeMap<ElementId, TimerEvent>,
}

// ─── External inboxes ─────────────────────────────────────────

/// A signal published by a throw event (or injected externally),
/// available for matching by catch events.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SignalEvent {
    pub id: String,
    pub signal_ref: String,
    pub scope: String,
    pub payload: Value,
    pub propagated_at: Timestamp,
}

/// A message awaiting correlation. `received_at = None` means the
/// message exists but has not been delivered yet — catch events only
/// match delivered messages.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MessageEvent {
    pub id: String,
    pub message_ref: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_key: Option<String>,
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub received_at: Option<Timestamp>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ExternalInbox {
    pub signal_events: Vec<SignalEvent>,
    pub message_events: Vec<MessageEvent>,
}

// ─── Execution context ────────────────────────────────────────

/// Run-scoped mutable state. One logical instance per run; the
/// executor is the single writer within a step, and branch merges are
/// serialized by the loop. Fully serializable for the context store.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub variables: BTreeMap<String, Value>,
    pub events: EventLog,
    pub external: ExternalInbox,
    /// Branch-arrival counters for parallel join gateways, keyed by
    /// gateway id. Persisted so a join survives suspension with some
    /// branches already arrived.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub join_arrivals: BTreeMap<ElementId, u32>,
}

impl ExecutionContext {
    pub fn new(initial_variables: BTreeMap<String, Value>) -> Self {
        Self {
            variables: initial_variables,
            ..Default::default()
        }
    }

    // ── Fired / pending ──

    /// Append an instance to the fired log. If a pending entry exists
    /// for the same source element, it is marked resolved.
    pub fn fire_event(&mut self, instance: EventInstance) {
        if let Some(pending) = self
            .events
            .pending
            .iter_mut()
            .find(|p| p.event_id == instance.event_id && p.waiting)
        {
            pending.waiting = false;
        }
        self.events.fired.push(instance);
    }

    /// Register a pending entry unless one is already waiting for the
    /// same element — revisits of a waiting catch must not duplicate.
    pub fn add_pending_event(&mut self, pending: PendingEvent) {
        let exists = self
            .events
            .pending
            .iter()
            .any(|p| p.event_id == pending.event_id && p.waiting);
        if !exists {
            self.events.pending.push(pending);
        }
    }

    // ── Timers ──

    pub fn add_timer_event(&mut self, timer: TimerEvent) {
        self.events.timers.insert(timer.event_id.clone(), timer);
    }

    pub fn timer(&self, event_id: &str) -> Option<&TimerEvent> {
        self.events.timers.get(event_id)
    }

    pub fn remove_timer(&mut self, event_id: &str) -> Option<TimerEvent> {
        self.events.timers.remove(event_id)
    }

    // ── Signals ──

    pub fn push_signal(&mut self, signal: SignalEvent) {
        self.external.signal_events.push(signal);
    }

    /// Consume the first signal matching `signal_ref` visible from
    /// `scope`. Removal enforces at-most-once consumption: a second
    /// catch never sees the same signal id.
    pub fn take_signal(&mut self, signal_ref: &str, scope: &str) -> Option<SignalEvent> {
        let idx = self.external.signal_events.iter().position(|s| {
            s.signal_ref == signal_ref
                && (s.scope == SIGNAL_SCOPE_GLOBAL || scope == SIGNAL_SCOPE_GLOBAL || s.scope == scope)
        })?;
        Some(self.external.signal_events.remove(idx))
    }

    // ── Messages ──

    pub fn push_message(&mut self, message: MessageEvent) {
        self.external.message_events.push(message);
    }

    /// Consume the first delivered message matching `message_ref` and,
    /// when given, the correlation key. Undelivered messages
    /// (`received_at = None`) never match.
    pub fn take_message(
        &mut self,
        message_ref: &str,
        correlation_key: Option<&str>,
    ) -> Option<MessageEvent> {
        let idx = self.external.message_events.iter().position(|m| {
            m.message_ref == message_ref
                && m.received_at.is_some()
                && match correlation_key {
                    Some(key) => m.correlation_key.as_deref() == Some(key),
                    None => true,
                }
        })?;
        Some(self.external.message_events.remove(idx))
    }

    // ── Join barriers ──

    /// Record one branch arrival at a parallel join gateway and return
    /// the arrival count so far.
    pub fn join_arrive(&mut self, gateway_id: &str) -> u32 {
        let count = self.join_arrivals.entry(gateway_id.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    /// Reset a join barrier after it releases, so a loop back through
    /// the same gateway starts a fresh count.
    pub fn clear_join(&mut self, gateway_id: &str) {
        self.join_arrivals.remove(gateway_id);
    }

    // ── Errors ──

    /// Append a structured error entry to `variables.errors`.
    pub fn record_error(&mut self, error: Value) {
        let entry = self
            .variables
            .entry(ERRORS_VARIABLE.to_string())
            .or_insert_with(|| Value::Array(Vec::new()));
        match entry {
            Value::Array(list) => list.push(error),
            other => *other = Value::Array(vec![other.clone(), error]),
        }
    }

    pub fn errors(&self) -> &[Value] {
        match self.variables.get(ERRORS_VARIABLE) {
            Some(Value::Array(list)) => list,
            _ => &[],
        }
    }

    /// Merge step outputs into variables. Last writer wins by key —
    /// the model assumes non-conflicting parallel writes.
    pub fn merge_outputs(&mut self, outputs: BTreeMap<String, Value>) {
        self.variables.extend(outputs);
    }
}
