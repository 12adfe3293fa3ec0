use crate::context::ExecutionContext;
use crate::intermediate::eval_condition;
use crate::model::{ElementKind, ModelDialect, ProcessModel};
use crate::types::*;
use serde_json::json;
use tracing::debug;

/// Metadata key marking the synthetic "walked past the last step"
/// location a sequential model produces.
const SEQ_COMPLETED_KEY: &str = "completed";

/// Walks a model from a location to the next location(s) for normal
/// node types. One implementation per model dialect.
///
/// Contract for intermediate events: `next_locations` MUST NOT resolve
/// flows for a node whose kind is an intermediate event — it returns
/// the location unchanged and the caller routes it through the event
/// handler (`step_info` flags such nodes with `is_event = true`).
pub trait Navigator: Send + Sync {
    fn can_navigate(&self, model: &ProcessModel) -> bool;

    fn start_location(&self, model: &ProcessModel, routine_id: &str)
        -> Result<Location, EngineError>;

    /// Next location(s) after `location`. Empty means the branch ended.
    fn next_locations(
        &self,
        model: &ProcessModel,
        location: &Location,
        context: &ExecutionContext,
    ) -> Result<Vec<Location>, EngineError>;

    fn is_end_location(&self, model: &ProcessModel, location: &Location) -> bool;

    fn step_info(&self, model: &ProcessModel, location: &Location) -> Result<StepInfo, EngineError>;
}

/// Dispatch to the navigator for the model's dialect.
pub fn navigator_for(model: &ProcessModel) -> &'static dyn Navigator {
    match model.dialect {
        ModelDialect::Sequential => &SequentialNavigator,
        ModelDialect::Bpmn => &BpmnNavigator,
    }
}

fn info_for(model: &ProcessModel, element_id: &str) -> Result<StepInfo, EngineError> {
    let element = model
        .element_by_id(element_id)
        .ok_or_else(|| EngineError::Modeling(format!("element '{element_id}' not in model")))?;
    Ok(StepInfo {
        id: element.id.clone(),
        name: element.name.clone(),
        step_type: step_type_tag(&element.kind).to_string(),
        description: element.description.clone(),
        config: element.config.clone(),
        is_event: element.kind.is_intermediate_event(),
    })
}

fn step_type_tag(kind: &ElementKind) -> &str {
    match kind {
        ElementKind::StartEvent => "start_event",
        ElementKind::EndEvent => "end_event",
        ElementKind::Task => "task",
        ElementKind::SequentialStep => "sequential_step",
        ElementKind::ExclusiveGateway => "exclusive_gateway",
        ElementKind::ParallelGateway => "parallel_gateway",
        ElementKind::IntermediateThrowEvent => "intermediate_throw_event",
        ElementKind::IntermediateCatchEvent => "intermediate_catch_event",
        ElementKind::Subroutine => "subroutine",
        ElementKind::Other(tag) => tag,
    }
}

// ─── Sequential ───────────────────────────────────────────────

/// Positional walk over an ordered step list. Flows are ignored.
pub struct SequentialNavigator;

impl Navigator for SequentialNavigator {
    fn can_navigate(&self, model: &ProcessModel) -> bool {
        model.dialect == ModelDialect::Sequential
    }

    fn start_location(
        &self,
        model: &ProcessModel,
        routine_id: &str,
    ) -> Result<Location, EngineError> {
        let first = model
            .start_element()
            .ok_or_else(|| EngineError::Modeling(format!("model '{}' has no steps", model.id)))?;
        Ok(Location::node(first.id.clone(), routine_id))
    }

    fn next_locations(
        &self,
        model: &ProcessModel,
        location: &Location,
        _context: &ExecutionContext,
    ) -> Result<Vec<Location>, EngineError> {
        let pos = model.position_of(&location.id).ok_or_else(|| {
            EngineError::Modeling(format!("step '{}' not in model", location.id))
        })?;
        match model.element_at(pos + 1) {
            Some(next) => Ok(vec![Location::node(next.id.clone(), &location.routine_id)]),
            None => {
                // Walked past the last step: emit a terminal marker so
                // the end check fires exactly once per branch.
                let mut end = Location::node(location.id.clone(), &location.routine_id);
                end.metadata
                    .insert(SEQ_COMPLETED_KEY.to_string(), json!(true));
                Ok(vec![end])
            }
        }
    }

    fn is_end_location(&self, _model: &ProcessModel, location: &Location) -> bool {
        location
            .metadata
            .get(SEQ_COMPLETED_KEY)
            .map_or(false, |v| v == &json!(true))
    }

    fn step_info(&self, model: &ProcessModel, location: &Location) -> Result<StepInfo, EngineError> {
        info_for(model, &location.id)
    }
}

// ─── BPMN ─────────────────────────────────────────────────────

/// Flow-following navigation with gateway fan-out. Intermediate event
/// nodes are deferred to the event handler per the trait contract.
pub struct BpmnNavigator;

impl Navigator for BpmnNavigator {
    fn can_navigate(&self, model: &ProcessModel) -> bool {
        model.dialect == ModelDialect::Bpmn
    }

    fn start_location(
        &self,
        model: &ProcessModel,
        routine_id: &str,
    ) -> Result<Location, EngineError> {
        let start = model
            .start_element()
            .ok_or_else(|| EngineError::Modeling(format!("model '{}' has no start event", model.id)))?;
        Ok(Location::node(start.id.clone(), routine_id))
    }

    fn next_locations(
        &self,
        model: &ProcessModel,
        location: &Location,
        context: &ExecutionContext,
    ) -> Result<Vec<Location>, EngineError> {
        let element = model.element_by_id(&location.id).ok_or_else(|| {
            EngineError::Modeling(format!("element '{}' not in model", location.id))
        })?;

        if element.kind.is_intermediate_event() {
            // Deferred: the event handler owns traversal for these.
            debug!(element = %element.id, "deferring event node to the intermediate handler");
            return Ok(vec![location.clone()]);
        }

        let flows = model.outgoing_flows(&element.id);
        let next = match element.kind {
            ElementKind::ExclusiveGateway => {
                let taken = flows
                    .iter()
                    .find(|f| {
                        f.condition
                            .as_deref()
                            .map_or(false, |c| eval_condition(c, &context.variables))
                    })
                    .or_else(|| flows.iter().find(|f| f.is_default))
                    .or_else(|| flows.iter().find(|f| f.condition.is_none()))
                    .ok_or_else(|| {
                        EngineError::Modeling(format!(
                            "exclusive gateway '{}': no condition matched and no default flow",
                            element.id
                        ))
                    })?;
                vec![Location::node(taken.target.clone(), &location.routine_id)]
            }
            // Parallel gateways (and every plain node) fan out over all
            // outgoing flows — one concurrent location per flow.
            _ => flows
                .iter()
                .map(|f| Location::node(f.target.clone(), &location.routine_id))
                .collect(),
        };
        Ok(next)
    }

    fn is_end_location(&self, model: &ProcessModel, location: &Location) -> bool {
        model
            .element_by_id(&location.id)
            .map_or(false, |e| e.kind == ElementKind::EndEvent)
    }

    fn step_info(&self, model: &ProcessModel, location: &Location) -> Result<StepInfo, EngineError> {
        info_for(model, &location.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Element, EventDefinition, Flow};
    use serde_json::json;

    fn ctx() -> ExecutionContext {
        ExecutionContext::default()
    }

    // ── Sequential ──

    fn seq_model() -> ProcessModel {
        ProcessModel::new(
            "seq",
            ModelDialect::Sequential,
            vec![
                Element::new("s1", ElementKind::SequentialStep),
                Element::new("s2", ElementKind::SequentialStep),
            ],
            vec![],
        )
        .unwrap()
    }

    #[test]
    fn sequential_walk_ends_after_last_step() {
        let model = seq_model();
        let nav = navigator_for(&model);
        assert!(nav.can_navigate(&model));

        let first = nav.start_location(&model, "r1").unwrap();
        assert_eq!(first.id, "s1");
        assert!(!nav.is_end_location(&model, &first));

        let next = nav.next_locations(&model, &first, &ctx()).unwrap();
        assert_eq!(next.len(), 1);
        assert_eq!(next[0].id, "s2");
        assert!(!nav.is_end_location(&model, &next[0]));

        let last = nav.next_locations(&model, &next[0], &ctx()).unwrap();
        assert_eq!(last.len(), 1);
        assert!(nav.is_end_location(&model, &last[0]));
    }

    #[test]
    fn sequential_step_info() {
        let model = seq_model();
        let nav = navigator_for(&model);
        let loc = nav.start_location(&model, "r1").unwrap();
        let info = nav.step_info(&model, &loc).unwrap();
        assert_eq!(info.step_type, "sequential_step");
        assert!(!info.is_event);
    }

    // ── BPMN ──

    #[test]
    fn bpmn_follows_flows_from_start() {
        let model = ProcessModel::new(
            "m",
            ModelDialect::Bpmn,
            vec![
                Element::new("start", ElementKind::StartEvent),
                Element::new("a", ElementKind::Task),
                Element::new("end", ElementKind::EndEvent),
            ],
            vec![Flow::new("f1", "start", "a"), Flow::new("f2", "a", "end")],
        )
        .unwrap();
        let nav = navigator_for(&model);

        let start = nav.start_location(&model, "r1").unwrap();
        assert_eq!(start.id, "start");
        let next = nav.next_locations(&model, &start, &ctx()).unwrap();
        assert_eq!(next[0].id, "a");
        let next = nav.next_locations(&model, &next[0], &ctx()).unwrap();
        assert!(nav.is_end_location(&model, &next[0]));
    }

    #[test]
    fn parallel_gateway_fans_out() {
        let model = ProcessModel::new(
            "m",
            ModelDialect::Bpmn,
            vec![
                Element::new("start", ElementKind::StartEvent),
                Element::new("fork", ElementKind::ParallelGateway),
                Element::new("a", ElementKind::Task),
                Element::new("b", ElementKind::Task),
                Element::new("end", ElementKind::EndEvent),
            ],
            vec![
                Flow::new("f1", "start", "fork"),
                Flow::new("f2", "fork", "a"),
                Flow::new("f3", "fork", "b"),
                Flow::new("f4", "a", "end"),
                Flow::new("f5", "b", "end"),
            ],
        )
        .unwrap();
        let nav = navigator_for(&model);

        let fork = Location::node("fork", "r1");
        let branches = nav.next_locations(&model, &fork, &ctx()).unwrap();
        assert_eq!(branches.len(), 2);
        let ids: Vec<_> = branches.iter().map(|l| l.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn exclusive_gateway_takes_first_matching_condition() {
        let model = ProcessModel::new(
            "m",
            ModelDialect::Bpmn,
            vec![
                Element::new("start", ElementKind::StartEvent),
                Element::new("gw", ElementKind::ExclusiveGateway),
                Element::new("hot", ElementKind::Task),
                Element::new("cold", ElementKind::Task),
            ],
            vec![
                Flow::new("f1", "start", "gw"),
                Flow {
                    condition: Some("temp > 30".to_string()),
                    ..Flow::new("f2", "gw", "hot")
                },
                Flow {
                    is_default: true,
                    ..Flow::new("f3", "gw", "cold")
                },
            ],
        )
        .unwrap();
        let nav = navigator_for(&model);
        let gw = Location::node("gw", "r1");

        let mut context = ctx();
        context.variables.insert("temp".to_string(), json!(35));
        let next = nav.next_locations(&model, &gw, &context).unwrap();
        assert_eq!(next[0].id, "hot");

        context.variables.insert("temp".to_string(), json!(10));
        let next = nav.next_locations(&model, &gw, &context).unwrap();
        assert_eq!(next[0].id, "cold");
    }

    #[test]
    fn exclusive_gateway_without_match_or_default_is_fatal() {
        let model = ProcessModel::new(
            "m",
            ModelDialect::Bpmn,
            vec![
                Element::new("start", ElementKind::StartEvent),
                Element::new("gw", ElementKind::ExclusiveGateway),
                Element::new("a", ElementKind::Task),
            ],
            vec![
                Flow::new("f1", "start", "gw"),
                Flow {
                    condition: Some("never".to_string()),
                    ..Flow::new("f2", "gw", "a")
                },
            ],
        )
        .unwrap();
        let nav = navigator_for(&model);
        let err = nav
            .next_locations(&model, &Location::node("gw", "r1"), &ctx())
            .unwrap_err();
        assert!(matches!(err, EngineError::Modeling(_)));
    }

    #[test]
    fn event_nodes_are_deferred_to_the_handler() {
        let model = ProcessModel::new(
            "m",
            ModelDialect::Bpmn,
            vec![
                Element::new("start", ElementKind::StartEvent),
                Element::new("catch", ElementKind::IntermediateCatchEvent).with_definition(
                    EventDefinition::Signal {
                        signal_ref: "go".to_string(),
                        scope: "global".to_string(),
                    },
                ),
                Element::new("end", ElementKind::EndEvent),
            ],
            vec![
                Flow::new("f1", "start", "catch"),
                Flow::new("f2", "catch", "end"),
            ],
        )
        .unwrap();
        let nav = navigator_for(&model);

        let loc = Location::node("catch", "r1");
        // The navigator must not resolve flows for event nodes.
        let deferred = nav.next_locations(&model, &loc, &ctx()).unwrap();
        assert_eq!(deferred, vec![loc.clone()]);
        assert!(nav.step_info(&model, &loc).unwrap().is_event);
    }
}
