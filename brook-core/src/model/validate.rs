use super::{ElementKind, ElementModel, ProcessModel};
use crate::mapping::{Expression, VariablePath};
use petgraph::algo::is_cyclic_directed;
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub rule: String,
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.rule, self.message)
    }
}

fn error(rule: &str, message: String) -> ValidationError {
    ValidationError {
        rule: rule.to_string(),
        message,
    }
}

/// Validate a process model before deployment. Returns all errors found.
pub fn validate_model(model: &ProcessModel) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    if model.id.trim().is_empty() {
        errors.push(error("V1", "Process id must not be empty".to_string()));
    }

    // V1: ids are unique across elements and flows
    let mut elements: HashMap<&str, &ElementModel> = HashMap::new();
    let mut seen: HashSet<&str> = HashSet::new();
    seen.insert(model.id.as_str());
    for element in &model.elements {
        if element.id.trim().is_empty() {
            errors.push(error("V1", "Element id must not be empty".to_string()));
        }
        if !seen.insert(element.id.as_str()) {
            errors.push(error("V1", format!("Duplicate id: {}", element.id)));
        } else {
            elements.insert(element.id.as_str(), element);
        }
    }
    for flow in &model.flows {
        if !seen.insert(flow.id.as_str()) {
            errors.push(error("V1", format!("Duplicate id: {}", flow.id)));
        }
    }

    // V2: scopes reference sub-processes
    for element in &model.elements {
        if let Some(scope) = &element.scope {
            match elements.get(scope.as_str()) {
                Some(parent) if matches!(parent.kind, ElementKind::SubProcess) => {}
                _ => errors.push(error(
                    "V2",
                    format!("Element {} has unknown sub-process scope {}", element.id, scope),
                )),
            }
        }
    }

    // V3: the containment tree must be acyclic
    let mut graph: DiGraph<&str, ()> = DiGraph::new();
    let mut nodes: HashMap<&str, NodeIndex> = HashMap::new();
    for element in &model.elements {
        nodes.insert(element.id.as_str(), graph.add_node(element.id.as_str()));
    }
    for element in &model.elements {
        if let Some(scope) = &element.scope {
            if let (Some(&parent), Some(&child)) =
                (nodes.get(scope.as_str()), nodes.get(element.id.as_str()))
            {
                graph.add_edge(parent, child, ());
            }
        }
    }
    if is_cyclic_directed(&graph) {
        errors.push(error("V3", "Sub-process nesting contains a cycle".to_string()));
    }

    // V4: every scope has exactly one none start event
    let mut scopes: Vec<Option<&str>> = vec![None];
    scopes.extend(
        model
            .elements
            .iter()
            .filter(|e| matches!(e.kind, ElementKind::SubProcess))
            .map(|e| Some(e.id.as_str())),
    );
    for scope in scopes {
        let starts = model
            .elements
            .iter()
            .filter(|e| e.scope.as_deref() == scope && matches!(e.kind, ElementKind::StartEvent))
            .count();
        if starts != 1 {
            errors.push(error(
                "V4",
                format!(
                    "Scope {} must have exactly one start event, found {}",
                    scope.unwrap_or(&model.id),
                    starts
                ),
            ));
        }
    }

    // V5: flows connect existing elements of the same scope
    for flow in &model.flows {
        let (Some(from), Some(to)) = (elements.get(flow.from.as_str()), elements.get(flow.to.as_str()))
        else {
            errors.push(error(
                "V5",
                format!("Flow {} references unknown element ({} -> {})", flow.id, flow.from, flow.to),
            ));
            continue;
        };
        if from.scope != to.scope {
            errors.push(error(
                "V5",
                format!("Flow {} crosses a scope boundary", flow.id),
            ));
        }
        if matches!(to.kind, ElementKind::StartEvent | ElementKind::BoundaryEvent { .. }) {
            errors.push(error(
                "V5",
                format!("Flow {} must not target {}", flow.id, to.id),
            ));
        }
        if matches!(from.kind, ElementKind::EndEvent) {
            errors.push(error(
                "V5",
                format!("Flow {} must not leave end event {}", flow.id, from.id),
            ));
        }
        if flow.condition.is_some() && !matches!(from.kind, ElementKind::ExclusiveGateway { .. }) {
            errors.push(error(
                "V5",
                format!("Flow {} has a condition but does not leave an exclusive gateway", flow.id),
            ));
        }
        if let Some(condition) = &flow.condition {
            if let Err(e) = VariablePath::parse(&condition.variable) {
                errors.push(error("V5", format!("Flow {}: {}", flow.id, e)));
            }
        }
    }

    for element in &model.elements {
        let outgoing: Vec<_> = model.flows.iter().filter(|f| f.from == element.id).collect();

        match &element.kind {
            // V6: exclusive gateways have conditions or a default
            ElementKind::ExclusiveGateway { default_flow } => {
                if let Some(default) = default_flow {
                    if !outgoing.iter().any(|f| &f.id == default) {
                        errors.push(error(
                            "V6",
                            format!(
                                "Default flow {} is not an outgoing flow of {}",
                                default, element.id
                            ),
                        ));
                    }
                }
                if outgoing.len() > 1 {
                    for flow in &outgoing {
                        if flow.condition.is_none() && default_flow.as_ref() != Some(&flow.id) {
                            errors.push(error(
                                "V6",
                                format!("Flow {} leaving {} needs a condition", flow.id, element.id),
                            ));
                        }
                    }
                }
            }
            // V7: boundary events attach to an activity of the same scope
            ElementKind::BoundaryEvent {
                attached_to, timer, ..
            } => {
                let attached = elements.get(attached_to.as_str()).is_some_and(|activity| {
                    matches!(
                        activity.kind,
                        ElementKind::ServiceTask { .. } | ElementKind::SubProcess
                    ) && activity.scope == element.scope
                });
                if !attached {
                    errors.push(error(
                        "V7",
                        format!(
                            "Boundary event {} must be attached to a task or sub-process in its scope, found {}",
                            element.id, attached_to
                        ),
                    ));
                }
                if let Err(reason) = timer.check() {
                    errors.push(error("V11", format!("Timer of {} {}", element.id, reason)));
                }
            }
            // V11: timers stay within the supported range
            ElementKind::TimerCatchEvent { timer } => {
                if let Err(reason) = timer.check() {
                    errors.push(error("V11", format!("Timer of {} {}", element.id, reason)));
                }
            }
            // V8: service tasks name a job type
            ElementKind::ServiceTask { job_type, .. } => {
                if job_type.trim().is_empty() {
                    errors.push(error(
                        "V8",
                        format!("Service task {} has an empty job type", element.id),
                    ));
                }
            }
            _ => {}
        }

        // V9: multi-instance only on activities
        if let Some(lc) = &element.multi_instance {
            if !matches!(
                element.kind,
                ElementKind::ServiceTask { .. } | ElementKind::SubProcess
            ) {
                errors.push(error(
                    "V9",
                    format!("Element {} cannot be multi-instance", element.id),
                ));
            }
            if let Err(e) = Expression::parse(&lc.input_collection) {
                errors.push(error("V9", format!("Element {}: {}", element.id, e)));
            }
            if lc.output_collection.is_some() != lc.output_element.is_some() {
                errors.push(error(
                    "V9",
                    format!(
                        "Element {} must define output_collection and output_element together",
                        element.id
                    ),
                ));
            }
            if let Some(output) = &lc.output_element {
                if let Err(e) = Expression::parse(output) {
                    errors.push(error("V9", format!("Element {}: {}", element.id, e)));
                }
            }
            for name in [&lc.input_element, &lc.output_collection].into_iter().flatten() {
                let plain = VariablePath::parse_target(name)
                    .map(|path| path.segments.is_empty())
                    .unwrap_or(false);
                if !plain {
                    errors.push(error(
                        "V9",
                        format!("Element {}: '{}' must be a plain variable name", element.id, name),
                    ));
                }
            }
        }

        // V10: mappings parse
        for mapping in element.inputs.iter().chain(element.outputs.iter()) {
            if let Err(e) = Expression::parse(&mapping.source) {
                errors.push(error("V10", format!("Element {}: {}", element.id, e)));
            }
            if let Err(e) = VariablePath::parse_target(&mapping.target) {
                errors.push(error("V10", format!("Element {}: {}", element.id, e)));
            }
        }
    }

    errors
}
