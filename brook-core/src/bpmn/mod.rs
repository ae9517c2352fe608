//! BPMN element lifecycle.
//!
//! Each element type contributes one plain function per lifecycle state. The
//! functions live in a flat table keyed by `(element type, state)`, built once
//! when the processor starts.

pub mod behavior;
pub mod container;
pub mod element;
pub mod event;
pub mod gateway;
pub mod multi_instance;
pub mod task;

use crate::error::{EngineError, HandlerResult, ProcessingError};
use crate::model::ElementKind;
use crate::processor::ProcessingContext;
use crate::record::RejectionType;
use crate::state::ElementInstance;
use crate::types::{BpmnElementType, Intent, LifecycleState};
use behavior::{activate_element, model_element, transition_to};
use std::collections::HashMap;

pub type StepHandler = fn(&mut ProcessingContext<'_>, &ElementInstance) -> HandlerResult;

pub struct StepRegistry {
    handlers: HashMap<(BpmnElementType, LifecycleState), StepHandler>,
}

impl StepRegistry {
    pub fn empty() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    pub fn register(&mut self, element_type: BpmnElementType, state: LifecycleState, handler: StepHandler) {
        self.handlers.insert((element_type, state), handler);
    }

    pub fn get(&self, element_type: BpmnElementType, state: LifecycleState) -> Option<StepHandler> {
        self.handlers.get(&(element_type, state)).copied()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Steps for every supported element type.
    pub fn standard() -> Self {
        use BpmnElementType as T;
        use LifecycleState as S;

        let mut steps = Self::empty();

        // ── Containers ──
        steps.register(T::Process, S::Activating, container::process_activating);
        steps.register(T::Process, S::Activated, container::activated);
        steps.register(T::Process, S::Completing, container::process_completing);
        steps.register(T::SubProcess, S::Activating, element::activating);
        steps.register(T::SubProcess, S::Activated, container::activated);
        steps.register(T::SubProcess, S::Completing, element::completing);
        steps.register(T::MultiInstanceBody, S::Activating, multi_instance::activating);
        steps.register(T::MultiInstanceBody, S::Activated, multi_instance::activated);
        steps.register(T::MultiInstanceBody, S::Completing, multi_instance::completing);
        for container in [T::Process, T::SubProcess, T::MultiInstanceBody] {
            steps.register(container, S::Terminating, container::terminating);
        }

        // ── Service task ──
        steps.register(T::ServiceTask, S::Activating, task::activating);
        steps.register(T::ServiceTask, S::Activated, task::activated);
        steps.register(T::ServiceTask, S::Completing, element::completing);
        steps.register(T::ServiceTask, S::Terminating, task::terminating);

        // ── Events and gateways ──
        let flow_nodes = [
            T::StartEvent,
            T::EndEvent,
            T::ExclusiveGateway,
            T::ParallelGateway,
            T::IntermediateCatchEvent,
            T::BoundaryEvent,
        ];
        for node in flow_nodes {
            steps.register(node, S::Activating, element::activating);
            steps.register(node, S::Activated, element::activated);
            steps.register(node, S::Completing, element::completing);
            steps.register(node, S::Terminating, element::terminating);
        }
        steps.register(T::IntermediateCatchEvent, S::Activated, event::timer_catch_activated);
        steps.register(T::ExclusiveGateway, S::Completing, gateway::exclusive_completing);

        for element_type in [
            T::Process,
            T::SubProcess,
            T::MultiInstanceBody,
            T::ServiceTask,
            T::StartEvent,
            T::EndEvent,
            T::ExclusiveGateway,
            T::ParallelGateway,
            T::IntermediateCatchEvent,
            T::BoundaryEvent,
        ] {
            steps.register(element_type, S::Completed, element::completed);
            steps.register(element_type, S::Terminated, element::terminated);
        }

        steps
    }
}

impl Default for StepRegistry {
    fn default() -> Self {
        Self::standard()
    }
}

/// Processes an element lifecycle event by running the step for the element's
/// type and state. Events whose element moved on in the meantime are stale.
pub fn process_lifecycle_event(ctx: &mut ProcessingContext<'_>) -> HandlerResult {
    let Intent::ProcessInstance(intent) = ctx.record.intent else {
        return Err(ProcessingError::inconsistent("lifecycle step on a non process-instance record"));
    };
    let Some(state) = intent.lifecycle_state() else {
        return Err(ProcessingError::inconsistent(format!("{intent:?} is not a lifecycle intent")));
    };
    let key = ctx.record.key;
    let Some(instance) = ctx.state.elements.get(key).cloned() else {
        return Err(ProcessingError::rejected(
            RejectionType::NotFound,
            format!("element instance {key} no longer exists"),
        ));
    };
    if instance.state != state {
        return Err(ProcessingError::rejected(
            RejectionType::InvalidState,
            format!(
                "element instance {key} is {:?}, not {state:?}",
                instance.state
            ),
        ));
    }

    run_step(ctx, &instance)
}

/// Runs the step for the element's type and current state.
pub fn run_step(ctx: &mut ProcessingContext<'_>, instance: &ElementInstance) -> HandlerResult {
    let handler = ctx
        .steps
        .get(instance.element_type, instance.state)
        .ok_or(EngineError::MissingStepHandler {
            element_type: instance.element_type,
            state: instance.state,
        })?;
    handler(ctx, instance)
}

/// Processes SEQUENCE_FLOW_TAKEN: the token activates the flow's target, or
/// waits at a parallel join until every incoming flow delivered one.
pub fn process_sequence_flow_taken(ctx: &mut ProcessingContext<'_>) -> HandlerResult {
    let value = ctx
        .record
        .value
        .as_process_instance()
        .cloned()
        .ok_or_else(|| ProcessingError::inconsistent("sequence flow record without a process instance value"))?;
    let scope_key = value
        .flow_scope_key
        .ok_or_else(|| ProcessingError::inconsistent("sequence flow record without a flow scope"))?;
    let scope = ctx.element(scope_key)?;

    if scope.state != LifecycleState::Activated {
        // The token dies with its scope.
        let remaining = ctx.state.elements.decrement_active(scope_key)?;
        if scope.state == LifecycleState::Terminating && remaining == 0 {
            transition_to(ctx, scope_key, LifecycleState::Terminated)?;
        }
        return Ok(());
    }

    let def = ctx.definition(value.process_definition_key)?;
    let flow = def.flow(&value.element_id).ok_or_else(|| {
        ProcessingError::inconsistent(format!("sequence flow '{}' not found", value.element_id))
    })?;
    let target = model_element(&def, &flow.to)?;
    let incoming = def.incoming(&target.id);

    if matches!(target.kind, ElementKind::ParallelGateway) && incoming.len() > 1 {
        ctx.state.elements.join_arrive(scope_key, &target.id, &flow.id);
        let joined = incoming
            .iter()
            .all(|f| ctx.state.elements.join_count(scope_key, &target.id, f) > 0);
        if !joined {
            return Ok(());
        }
        activate_element(ctx, &def, &target.id, scope_key)?;
        ctx.state.elements.join_consume(scope_key, &target.id, incoming);
        for _ in incoming {
            ctx.state.elements.decrement_active(scope_key)?;
        }
        return Ok(());
    }

    activate_element(ctx, &def, &target.id, scope_key)?;
    ctx.state.elements.decrement_active(scope_key)?;
    Ok(())
}
