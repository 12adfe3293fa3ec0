use crate::context::{ExecutionContext, MessageEvent, PendingEvent, SignalEvent, TimerEvent};
use crate::model::{Element, ElementKind, EventDefinition, ProcessModel};
use crate::types::*;
use chrono::Duration;
use serde_json::json;
use std::collections::BTreeMap;
use tracing::{debug, warn};
use uuid::Uuid;

/// Fallback for unparsable timer durations.
const DEFAULT_TIMER_DURATION_SECS: i64 = 5 * 60;

// ─── Event result ─────────────────────────────────────────────

/// Uniform outcome of processing one intermediate event node.
///
/// `should_wait = true` always comes with at least one waiting
/// location; the only path that yields neither a wait nor a next
/// location is a blocking error throw.
#[derive(Clone, Debug)]
pub struct EventResult {
    pub next_locations: Vec<Location>,
    pub context: ExecutionContext,
    pub should_wait: bool,
    pub thrown: Vec<EventInstance>,
    pub caught: Vec<EventInstance>,
}

impl EventResult {
    fn advance(next_locations: Vec<Location>, context: ExecutionContext) -> Self {
        Self {
            next_locations,
            context,
            should_wait: false,
            thrown: Vec::new(),
            caught: Vec::new(),
        }
    }

    fn wait_at(location: Location, context: ExecutionContext) -> Self {
        Self {
            next_locations: vec![location],
            context,
            should_wait: true,
            thrown: Vec::new(),
            caught: Vec::new(),
        }
    }

    fn thrown(mut self, instance: EventInstance) -> Self {
        self.thrown.push(instance);
        self
    }

    fn caught(mut self, instance: EventInstance) -> Self {
        self.caught.push(instance);
        self
    }

    /// Combine two results. Field rules: event lists concatenate,
    /// locations concatenate, `should_wait` takes the later value,
    /// the later context wins (it was threaded through the earlier
    /// handler before reaching the later one).
    pub fn merge(self, later: EventResult) -> EventResult {
        let mut next_locations = self.next_locations;
        next_locations.extend(later.next_locations);
        let mut thrown = self.thrown;
        thrown.extend(later.thrown);
        let mut caught = self.caught;
        caught.extend(later.caught);
        EventResult {
            next_locations,
            context: later.context,
            should_wait: later.should_wait,
            thrown,
            caught,
        }
    }

    /// The thrown instance, when exactly one event was thrown.
    pub fn single_thrown(&self) -> Option<&EventInstance> {
        match self.thrown.as_slice() {
            [one] => Some(one),
            _ => None,
        }
    }

    /// The caught instance, when exactly one event was caught.
    pub fn single_caught(&self) -> Option<&EventInstance> {
        match self.caught.as_slice() {
            [one] => Some(one),
            _ => None,
        }
    }
}

// ─── Entry point ──────────────────────────────────────────────

/// Process the intermediate event node `element_id`: classify throw
/// versus catch, dispatch on the event definition, and return the
/// uniform result. The context is taken by value and threaded through.
pub fn handle_intermediate_event(
    model: &ProcessModel,
    element_id: &str,
    location: &Location,
    context: ExecutionContext,
    now: Timestamp,
) -> Result<EventResult, EngineError> {
    let element = model.element_by_id(element_id).ok_or_else(|| {
        EngineError::Modeling(format!("intermediate event '{element_id}' not in model"))
    })?;

    match element.kind {
        ElementKind::IntermediateThrowEvent => handle_throw(model, element, location, context, now),
        ElementKind::IntermediateCatchEvent => handle_catch(model, element, location, context, now),
        _ => Err(EngineError::Modeling(format!(
            "element '{element_id}' is not an intermediate event"
        ))),
    }
}

/// Resolve the locations after a completed event: one node location
/// per outgoing flow. Shared by every continuing branch so downstream
/// flow resolution is never duplicated.
fn continue_after_event(
    model: &ProcessModel,
    element_id: &str,
    routine_id: &str,
    context: ExecutionContext,
) -> EventResult {
    let next = model
        .outgoing_flows(element_id)
        .iter()
        .map(|flow| Location::node(flow.target.clone(), routine_id))
        .collect();
    EventResult::advance(next, context)
}

// ─── Throw dispatch ───────────────────────────────────────────

fn handle_throw(
    model: &ProcessModel,
    element: &Element,
    location: &Location,
    mut context: ExecutionContext,
    now: Timestamp,
) -> Result<EventResult, EngineError> {
    let Some(definition) = element.primary_definition().cloned() else {
        // No definition — plain pass-through node.
        return Ok(continue_after_event(model, &element.id, &location.routine_id, context));
    };
    debug!(element = %element.id, kind = ?definition.kind(), "throw event");

    match definition {
        EventDefinition::Signal { signal_ref, scope } => {
            let payload = json!({ "signalRef": signal_ref, "scope": scope });
            context.push_signal(SignalEvent {
                id: Uuid::now_v7().to_string(),
                signal_ref,
                scope,
                payload: payload.clone(),
                propagated_at: now,
            });
            let instance = EventInstance::new(
                element.id.clone(),
                EventKind::Signal,
                payload,
                EventSource::IntermediateThrow,
                now,
            );
            context.fire_event(instance.clone());
            Ok(continue_after_event(model, &element.id, &location.routine_id, context)
                .thrown(instance))
        }

        EventDefinition::Message {
            message_ref,
            correlation_key,
        } => {
            let payload = json!({ "messageRef": message_ref, "correlationKey": correlation_key });
            context.push_message(MessageEvent {
                id: Uuid::now_v7().to_string(),
                message_ref,
                correlation_key,
                payload: payload.clone(),
                received_at: Some(now),
            });
            let instance = EventInstance::new(
                element.id.clone(),
                EventKind::Message,
                payload,
                EventSource::IntermediateThrow,
                now,
            );
            context.fire_event(instance.clone());
            Ok(continue_after_event(model, &element.id, &location.routine_id, context)
                .thrown(instance))
        }

        EventDefinition::Error {
            error_code,
            error_message,
        } => {
            let payload = json!({
                "errorCode": error_code,
                "errorMessage": error_message,
                "eventId": element.id,
                "thrownAt": now,
            });
            context.record_error(payload.clone());
            let instance = EventInstance::new(
                element.id.clone(),
                EventKind::Error,
                payload,
                EventSource::IntermediateThrow,
                now,
            );
            context.fire_event(instance.clone());
            // No continuation: propagation belongs to the boundary
            // handling layer above this core.
            Ok(EventResult::advance(Vec::new(), context).thrown(instance))
        }

        EventDefinition::Escalation { escalation_code } => {
            let instance = EventInstance::new(
                element.id.clone(),
                EventKind::Escalation,
                json!({ "escalationCode": escalation_code }),
                EventSource::IntermediateThrow,
                now,
            );
            context.fire_event(instance.clone());
            Ok(continue_after_event(model, &element.id, &location.routine_id, context)
                .thrown(instance))
        }

        EventDefinition::Compensation { activity_ref } => {
            let instance = EventInstance::new(
                element.id.clone(),
                EventKind::Compensation,
                json!({ "activityRef": activity_ref }),
                EventSource::IntermediateThrow,
                now,
            );
            context.fire_event(instance.clone());
            Ok(continue_after_event(model, &element.id, &location.routine_id, context)
                .thrown(instance))
        }

        EventDefinition::Link { name } => {
            let target = find_link_catch(model, &name).ok_or_else(|| {
                EngineError::Modeling(format!(
                    "link throw '{}' has no matching catch for link '{name}'",
                    element.id
                ))
            })?;
            let instance = EventInstance::new(
                element.id.clone(),
                EventKind::Link,
                json!({ "linkName": name, "target": target.id }),
                EventSource::IntermediateThrow,
                now,
            );
            context.fire_event(instance.clone());
            // Jump straight to the catch; its own activation is a
            // pass-through.
            let jump = Location::node(target.id.clone(), location.routine_id.clone());
            Ok(EventResult::advance(vec![jump], context).thrown(instance))
        }

        EventDefinition::Timer { .. } | EventDefinition::Conditional { .. } => {
            // Catch-only definitions on a throw node: nothing to emit.
            warn!(element = %element.id, "catch-only definition on throw event, passing through");
            Ok(continue_after_event(model, &element.id, &location.routine_id, context))
        }
    }
}

/// Locate the catch event for a link name. First match in document
/// order wins; models with duplicate link names are malformed but the
/// choice is still deterministic.
fn find_link_catch<'a>(model: &'a ProcessModel, name: &str) -> Option<&'a Element> {
    model
        .elements_of_kind(&ElementKind::IntermediateCatchEvent)
        .into_iter()
        .find(|el| {
            matches!(
                el.primary_definition(),
                Some(EventDefinition::Link { name: n }) if n == name
            )
        })
}

// ─── Catch dispatch ───────────────────────────────────────────

fn handle_catch(
    model: &ProcessModel,
    element: &Element,
    location: &Location,
    mut context: ExecutionContext,
    now: Timestamp,
) -> Result<EventResult, EngineError> {
    let Some(definition) = element.primary_definition().cloned() else {
        return Ok(continue_after_event(model, &element.id, &location.routine_id, context));
    };
    debug!(element = %element.id, kind = ?definition.kind(), "catch event");

    // Borrowed match: the waiting branches hand the whole definition to
    // `pending_for` after reading its fields.
    match &definition {
        EventDefinition::Timer { duration, due_date } => {
            match context.timer(&element.id).cloned() {
                None => {
                    // First visit: register and park.
                    let expires_at = match due_date {
                        Some(due) => *due,
                        None => now + parse_iso_duration(duration.as_deref()),
                    };
                    context.add_timer_event(TimerEvent {
                        event_id: element.id.clone(),
                        expires_at,
                    });
                    context.add_pending_event(pending_for(element, &definition));
                    let waiting = waiting_location(
                        element,
                        location,
                        LocationKind::TimerWaiting,
                        BTreeMap::from([(
                            "expiresAt".to_string(),
                            json!(expires_at),
                        )]),
                    );
                    Ok(EventResult::wait_at(waiting, context))
                }
                Some(timer) if now >= timer.expires_at => {
                    context.remove_timer(&element.id);
                    let instance = EventInstance::new(
                        element.id.clone(),
                        EventKind::Timer,
                        json!({ "expiresAt": timer.expires_at }),
                        EventSource::IntermediateCatch,
                        now,
                    );
                    context.fire_event(instance.clone());
                    Ok(continue_after_event(model, &element.id, &location.routine_id, context)
                        .caught(instance))
                }
                Some(timer) => {
                    // Registered but not yet due — identical wait on
                    // every revisit.
                    context.add_pending_event(pending_for(element, &definition));
                    let waiting = waiting_location(
                        element,
                        location,
                        LocationKind::TimerWaiting,
                        BTreeMap::from([(
                            "expiresAt".to_string(),
                            json!(timer.expires_at),
                        )]),
                    );
                    Ok(EventResult::wait_at(waiting, context))
                }
            }
        }

        EventDefinition::Signal { signal_ref, scope } => {
            match context.take_signal(signal_ref, scope) {
                Some(signal) => {
                    let instance = EventInstance::new(
                        element.id.clone(),
                        EventKind::Signal,
                        json!({ "signalRef": signal.signal_ref, "signalId": signal.id, "payload": signal.payload }),
                        EventSource::IntermediateCatch,
                        now,
                    );
                    context.fire_event(instance.clone());
                    Ok(continue_after_event(model, &element.id, &location.routine_id, context)
                        .caught(instance))
                }
                None => {
                    context.add_pending_event(pending_for(element, &definition));
                    let waiting = waiting_location(
                        element,
                        location,
                        LocationKind::SignalWaiting,
                        BTreeMap::from([
                            ("signalRef".to_string(), json!(signal_ref)),
                            ("scope".to_string(), json!(scope)),
                        ]),
                    );
                    Ok(EventResult::wait_at(waiting, context))
                }
            }
        }

        EventDefinition::Message {
            message_ref,
            correlation_key,
        } => match context.take_message(message_ref, correlation_key.as_deref()) {
            Some(message) => {
                let instance = EventInstance::new(
                    element.id.clone(),
                    EventKind::Message,
                    json!({ "messageRef": message.message_ref, "messageId": message.id, "payload": message.payload }),
                    EventSource::IntermediateCatch,
                    now,
                );
                context.fire_event(instance.clone());
                Ok(continue_after_event(model, &element.id, &location.routine_id, context)
                    .caught(instance))
            }
            None => {
                context.add_pending_event(pending_for(element, &definition));
                let waiting = waiting_location(
                    element,
                    location,
                    LocationKind::IntermediateWaiting,
                    BTreeMap::from([
                        ("messageRef".to_string(), json!(message_ref)),
                        ("correlationKey".to_string(), json!(correlation_key)),
                    ]),
                );
                Ok(EventResult::wait_at(waiting, context))
            }
        },

        EventDefinition::Conditional { condition } => {
            if eval_condition(condition, &context.variables) {
                let instance = EventInstance::new(
                    element.id.clone(),
                    EventKind::Conditional,
                    json!({ "condition": condition }),
                    EventSource::IntermediateCatch,
                    now,
                );
                context.fire_event(instance.clone());
                Ok(continue_after_event(model, &element.id, &location.routine_id, context)
                    .caught(instance))
            } else {
                // Re-evaluated on every visit; context stays unchanged.
                context.add_pending_event(pending_for(element, &definition));
                let waiting = waiting_location(
                    element,
                    location,
                    LocationKind::EventWaiting,
                    BTreeMap::from([("condition".to_string(), json!(condition))]),
                );
                Ok(EventResult::wait_at(waiting, context))
            }
        }

        EventDefinition::Link { .. } => {
            // Activation already implies the link jump happened.
            Ok(continue_after_event(model, &element.id, &location.routine_id, context))
        }

        EventDefinition::Error { .. }
        | EventDefinition::Escalation { .. }
        | EventDefinition::Compensation { .. } => {
            // Standalone catches for these kinds belong to boundary
            // handling, which lives above this core.
            warn!(element = %element.id, "unsupported standalone catch, passing through");
            Ok(continue_after_event(model, &element.id, &location.routine_id, context))
        }
    }
}

fn pending_for(element: &Element, definition: &EventDefinition) -> PendingEvent {
    PendingEvent {
        id: Uuid::now_v7().to_string(),
        event_id: element.id.clone(),
        kind: definition.kind(),
        waiting: true,
        definition: definition.clone(),
    }
}

fn waiting_location(
    element: &Element,
    location: &Location,
    kind: LocationKind,
    metadata: BTreeMap<String, Value>,
) -> Location {
    Location {
        id: element.id.clone(),
        routine_id: location.routine_id.clone(),
        kind,
        parent_node_id: location.parent_node_id.clone().or_else(|| Some(element.id.clone())),
        event_id: Some(element.id.clone()),
        metadata,
    }
}

// ─── Pending event queries / external resumption ──────────────

/// Waiting pending events, optionally filtered by kind. Supervisors
/// use this to learn what a suspended run is blocked on.
pub fn pending_intermediate_events<'a>(
    context: &'a ExecutionContext,
    kind: Option<EventKind>,
) -> Vec<&'a PendingEvent> {
    context
        .events
        .pending
        .iter()
        .filter(|p| p.waiting && kind.map_or(true, |k| p.kind == k))
        .collect()
}

/// External resumption hook: an outside actor (scheduler tick, API
/// message delivery) resolves a wait. Flips the pending entry and
/// appends a fired instance. Returns `None` when nothing is waiting
/// under `event_id`.
pub fn complete_intermediate_event(
    context: &mut ExecutionContext,
    event_id: &str,
    payload: Value,
    now: Timestamp,
) -> Option<EventInstance> {
    let pending = context
        .events
        .pending
        .iter_mut()
        .find(|p| p.event_id == event_id && p.waiting)?;
    pending.waiting = false;
    let kind = pending.kind;
    let instance = EventInstance::new(event_id, kind, payload, EventSource::External, now);
    context.events.fired.push(instance.clone());
    Some(instance)
}

// ─── Timer duration parsing ───────────────────────────────────

/// Parse the restricted ISO-8601 subset `PT[nH][nM][nS]`. Unparsable
/// or absent durations fall back to five minutes.
pub fn parse_iso_duration(spec: Option<&str>) -> Duration {
    fn parse(spec: &str) -> Option<Duration> {
        let body = spec.strip_prefix("PT")?;
        if body.is_empty() {
            return None;
        }
        let mut total = Duration::zero();
        let mut digits = String::new();
        for ch in body.chars() {
            if ch.is_ascii_digit() {
                digits.push(ch);
            } else {
                let n: i64 = digits.parse().ok()?;
                digits.clear();
                total = total
                    + match ch {
                        'H' => Duration::hours(n),
                        'M' => Duration::minutes(n),
                        'S' => Duration::seconds(n),
                        _ => return None,
                    };
            }
        }
        if !digits.is_empty() {
            return None; // trailing digits without a unit
        }
        Some(total)
    }

    match spec.and_then(parse) {
        Some(d) => d,
        None => Duration::seconds(DEFAULT_TIMER_DURATION_SECS),
    }
}

// ─── Conditional expression language ──────────────────────────

/// Evaluate the restricted boolean language: a bare variable name
/// (truthiness), or `<variable> <op> <literal>` with `==`, `!=`,
/// `>`, `<`.
pub fn eval_condition(expr: &str, variables: &BTreeMap<String, Value>) -> bool {
    let expr = expr.trim();
    for op in ["==", "!=", ">", "<"] {
        if let Some((lhs, rhs)) = expr.split_once(op) {
            let var = variables.get(lhs.trim());
            let literal = parse_literal(rhs.trim());
            return compare(var, op, &literal);
        }
    }
    variables.get(expr).map_or(false, is_truthy)
}

fn parse_literal(raw: &str) -> Value {
    let unquoted = raw
        .strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .or_else(|| raw.strip_prefix('\'').and_then(|s| s.strip_suffix('\'')));
    if let Some(s) = unquoted {
        return Value::from(s);
    }
    serde_json::from_str(raw).unwrap_or_else(|_| Value::from(raw))
}

fn compare(var: Option<&Value>, op: &str, literal: &Value) -> bool {
    match op {
        "==" => var.map_or(false, |v| loosely_equal(v, literal)),
        "!=" => var.map_or(true, |v| !loosely_equal(v, literal)),
        ">" | "<" => {
            let (Some(a), Some(b)) = (var.and_then(as_number), as_number(literal)) else {
                return false;
            };
            if op == ">" {
                a > b
            } else {
                a < b
            }
        }
        _ => false,
    }
}

/// Equality with string/number coercion, matching how variable values
/// arrive from loosely-typed step outputs.
fn loosely_equal(a: &Value, b: &Value) -> bool {
    if a == b {
        return true;
    }
    match (as_number(a), as_number(b)) {
        (Some(x), Some(y)) => x == y,
        _ => value_as_string(a) == value_as_string(b),
    }
}

fn as_number(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn value_as_string(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn is_truthy(v: &Value) -> bool {
    match v {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map_or(false, |f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}
