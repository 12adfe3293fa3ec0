use crate::types::*;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Dfs;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// ─── Element kinds ────────────────────────────────────────────

/// Strongly-typed element classification. Built once at model load —
/// there is no string `$type` matching anywhere downstream.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ElementKind {
    StartEvent,
    EndEvent,
    Task,
    SequentialStep,
    ExclusiveGateway,
    ParallelGateway,
    IntermediateThrowEvent,
    IntermediateCatchEvent,
    Subroutine,
    /// Unrecognized dialect extension. Navigated as a plain task.
    Other(String),
}

impl ElementKind {
    /// True for standalone intermediate throw/catch events — the nodes
    /// the navigator must route through the event handler.
    pub fn is_intermediate_event(&self) -> bool {
        matches!(
            self,
            ElementKind::IntermediateThrowEvent | ElementKind::IntermediateCatchEvent
        )
    }
}

// ─── Event definitions ────────────────────────────────────────

/// Scope "global" matches any waiting catch; anything else requires
/// exact string equality.
pub const SIGNAL_SCOPE_GLOBAL: &str = "global";

fn default_signal_scope() -> String {
    SIGNAL_SCOPE_GLOBAL.to_string()
}

/// Parsed event definition attached to an intermediate event element.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventDefinition {
    Timer {
        /// Restricted ISO-8601 duration (`PT[nH][nM][nS]`).
        #[serde(default, skip_serializing_if = "Option::is_none")]
        duration: Option<String>,
        /// Absolute due date. Takes priority over `duration`.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        due_date: Option<Timestamp>,
    },
    Signal {
        signal_ref: String,
        #[serde(default = "default_signal_scope")]
        scope: String,
    },
    Message {
        message_ref: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        correlation_key: Option<String>,
    },
    Error {
        error_code: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error_message: Option<String>,
    },
    Escalation {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        escalation_code: Option<String>,
    },
    Compensation {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        activity_ref: Option<String>,
    },
    Conditional {
        condition: String,
    },
    Link {
        name: String,
    },
}

impl EventDefinition {
    pub fn kind(&self) -> EventKind {
        match self {
            EventDefinition::Timer { .. } => EventKind::Timer,
            EventDefinition::Signal { .. } => EventKind::Signal,
            EventDefinition::Message { .. } => EventKind::Message,
            EventDefinition::Error { .. } => EventKind::Error,
            EventDefinition::Escalation { .. } => EventKind::Escalation,
            EventDefinition::Compensation { .. } => EventKind::Compensation,
            EventDefinition::Conditional { .. } => EventKind::Conditional,
            EventDefinition::Link { .. } => EventKind::Link,
        }
    }
}

// ─── Elements and flows ───────────────────────────────────────

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Element {
    pub id: ElementId,
    #[serde(default)]
    pub name: String,
    pub kind: ElementKind,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub event_definitions: Vec<EventDefinition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Step-type-specific configuration, opaque to navigation.
    #[serde(default)]
    pub config: Value,
}

impl Element {
    pub fn new(id: impl Into<ElementId>, kind: ElementKind) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            kind,
            event_definitions: Vec::new(),
            description: None,
            config: Value::Null,
        }
    }

    pub fn with_definition(mut self, def: EventDefinition) -> Self {
        self.event_definitions.push(def);
        self
    }

    /// The first event definition, which is the one that drives
    /// intermediate event dispatch. Multiple definitions on one
    /// element are not supported by this core.
    pub fn primary_definition(&self) -> Option<&EventDefinition> {
        self.event_definitions.first()
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Flow {
    pub id: String,
    pub source: ElementId,
    pub target: ElementId,
    /// Optional guard expression (exclusive gateway branches), in the
    /// same restricted language as conditional catch events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub is_default: bool,
}

fn is_false(v: &bool) -> bool {
    !*v
}

impl Flow {
    pub fn new(id: impl Into<String>, source: impl Into<ElementId>, target: impl Into<ElementId>) -> Self {
        Self {
            id: id.into(),
            source: source.into(),
            target: target.into(),
            condition: None,
            is_default: false,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelDialect {
    /// Ordered step list; flows are ignored, navigation is positional.
    Sequential,
    /// Graph of flows with gateways and intermediate events.
    Bpmn,
}

// ─── Location construction options ────────────────────────────

#[derive(Clone, Debug, Default)]
pub struct LocationOpts {
    pub parent_node_id: Option<ElementId>,
    pub event_id: Option<ElementId>,
    pub metadata: std::collections::BTreeMap<String, Value>,
}

// ─── Process model ────────────────────────────────────────────

/// Immutable parsed representation of one workflow version. Shared
/// across runs; every lookup is index-backed.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProcessModel {
    pub id: String,
    pub dialect: ModelDialect,
    elements: Vec<Element>,
    flows: Vec<Flow>,
    #[serde(skip)]
    by_id: HashMap<ElementId, usize>,
    #[serde(skip)]
    outgoing: HashMap<ElementId, Vec<usize>>,
    #[serde(skip)]
    incoming: HashMap<ElementId, Vec<usize>>,
    /// Non-fatal findings from load-time validation (e.g. elements
    /// unreachable from the start event).
    #[serde(skip)]
    warnings: Vec<String>,
}

impl ProcessModel {
    pub fn new(
        id: impl Into<String>,
        dialect: ModelDialect,
        elements: Vec<Element>,
        flows: Vec<Flow>,
    ) -> Result<Self, EngineError> {
        let mut model = Self {
            id: id.into(),
            dialect,
            elements,
            flows,
            by_id: HashMap::new(),
            outgoing: HashMap::new(),
            incoming: HashMap::new(),
            warnings: Vec::new(),
        };
        model.build_indexes()?;
        Ok(model)
    }

    /// Rebuild indexes after deserialization (serde skips them).
    pub fn from_parts(model: ProcessModel) -> Result<Self, EngineError> {
        Self::new(model.id, model.dialect, model.elements, model.flows)
    }

    fn build_indexes(&mut self) -> Result<(), EngineError> {
        let mut errors: Vec<String> = Vec::new();

        for (i, el) in self.elements.iter().enumerate() {
            if self.by_id.insert(el.id.clone(), i).is_some() {
                errors.push(format!("duplicate element id '{}'", el.id));
            }
        }

        for (i, flow) in self.flows.iter().enumerate() {
            if !self.by_id.contains_key(&flow.source) {
                errors.push(format!("flow '{}' source '{}' does not resolve", flow.id, flow.source));
            }
            if !self.by_id.contains_key(&flow.target) {
                errors.push(format!("flow '{}' target '{}' does not resolve", flow.id, flow.target));
            }
            self.outgoing.entry(flow.source.clone()).or_default().push(i);
            self.incoming.entry(flow.target.clone()).or_default().push(i);
        }

        if self.dialect == ModelDialect::Bpmn {
            let starts = self
                .elements
                .iter()
                .filter(|e| e.kind == ElementKind::StartEvent)
                .count();
            if starts != 1 {
                errors.push(format!("expected exactly one start event, found {starts}"));
            }
        }

        if !errors.is_empty() {
            return Err(EngineError::Modeling(errors.join("; ")));
        }

        if self.dialect == ModelDialect::Bpmn {
            self.check_reachability();
        }
        Ok(())
    }

    /// DFS from the start event; elements the walk never touches are
    /// recorded as warnings. Link catches are expected to be flow-less
    /// (they are reached by link throws), so they are exempt.
    fn check_reachability(&mut self) {
        let mut graph: DiGraph<&str, ()> = DiGraph::new();
        let mut node_index: HashMap<&str, NodeIndex> = HashMap::new();
        for el in &self.elements {
            node_index.insert(el.id.as_str(), graph.add_node(el.id.as_str()));
        }
        for flow in &self.flows {
            if let (Some(&a), Some(&b)) = (
                node_index.get(flow.source.as_str()),
                node_index.get(flow.target.as_str()),
            ) {
                graph.add_edge(a, b, ());
            }
        }

        let start = match self
            .elements
            .iter()
            .find(|e| e.kind == ElementKind::StartEvent)
        {
            Some(el) => node_index[el.id.as_str()],
            None => return,
        };

        let mut seen = std::collections::HashSet::new();
        let mut dfs = Dfs::new(&graph, start);
        while let Some(nx) = dfs.next(&graph) {
            seen.insert(graph[nx]);
        }

        for el in &self.elements {
            let link_catch = el.kind == ElementKind::IntermediateCatchEvent
                && matches!(el.primary_definition(), Some(EventDefinition::Link { .. }));
            if !seen.contains(el.id.as_str()) && !link_catch {
                self.warnings
                    .push(format!("element '{}' is unreachable from the start event", el.id));
            }
        }
    }

    // ── Lookups ──

    pub fn element_by_id(&self, id: &str) -> Option<&Element> {
        self.by_id.get(id).map(|&i| &self.elements[i])
    }

    pub fn elements_of_kind(&self, kind: &ElementKind) -> Vec<&Element> {
        self.elements.iter().filter(|e| &e.kind == kind).collect()
    }

    pub fn outgoing_flows(&self, node_id: &str) -> Vec<&Flow> {
        self.outgoing
            .get(node_id)
            .map(|idxs| idxs.iter().map(|&i| &self.flows[i]).collect())
            .unwrap_or_default()
    }

    pub fn incoming_flows(&self, node_id: &str) -> Vec<&Flow> {
        self.incoming
            .get(node_id)
            .map(|idxs| idxs.iter().map(|&i| &self.flows[i]).collect())
            .unwrap_or_default()
    }

    pub fn elements(&self) -> &[Element] {
        &self.elements
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    pub fn start_element(&self) -> Option<&Element> {
        match self.dialect {
            ModelDialect::Bpmn => self
                .elements
                .iter()
                .find(|e| e.kind == ElementKind::StartEvent),
            ModelDialect::Sequential => self.elements.first(),
        }
    }

    /// Position of an element in document order — the sequential
    /// navigator's step index.
    pub fn position_of(&self, id: &str) -> Option<usize> {
        self.by_id.get(id).copied()
    }

    pub fn element_at(&self, position: usize) -> Option<&Element> {
        self.elements.get(position)
    }

    // ── Location construction ──

    /// Build a Location pointing at `node_id`, validating that the
    /// node exists in this model.
    pub fn abstract_location(
        &self,
        node_id: &str,
        routine_id: &str,
        kind: LocationKind,
        opts: LocationOpts,
    ) -> Result<Location, EngineError> {
        if self.element_by_id(node_id).is_none() {
            return Err(EngineError::Modeling(format!(
                "cannot create location: element '{node_id}' not in model '{}'",
                self.id
            )));
        }
        Ok(Location {
            id: node_id.to_string(),
            routine_id: routine_id.to_string(),
            kind,
            parent_node_id: opts.parent_node_id,
            event_id: opts.event_id,
            metadata: opts.metadata,
        })
    }
}
