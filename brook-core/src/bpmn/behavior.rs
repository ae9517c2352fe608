//! Behaviors shared by the step handlers and the command processors.

use super::multi_instance;
use crate::error::{EngineError, Failure, HandlerResult, ProcessingError};
use crate::mapping::{self, VariablePath};
use crate::model::{ElementKind, ElementModel, ProcessDefinition, TimerDefinition};
use crate::processor::ProcessingContext;
use crate::record::{
    ErrorType, IncidentRecord, ProcessInstanceRecord, RecordValue, TimerRecord, VariableRecord,
};
use crate::state::{ElementInstance, EngineState, ProcessInstanceStatus, VariableWrite};
use crate::types::{
    BpmnElementType, IncidentIntent, Intent, Key, LifecycleState, ProcessInstanceIntent,
    TimerIntent, VariableIntent,
};
use serde_json::Value;

/// Local variable holding the 1-based index of an inner multi-instance element.
pub const LOOP_COUNTER: &str = "loopCounter";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildOutcome {
    Completed,
    Terminated,
}

// ── Lifecycle ──

/// Moves an element instance to `state` and writes the matching lifecycle event.
pub fn transition_to(
    ctx: &mut ProcessingContext<'_>,
    key: Key,
    state: LifecycleState,
) -> HandlerResult<ElementInstance> {
    let instance = ctx.state.elements.set_state(key, state)?;
    write_lifecycle_event(ctx, &instance)?;
    Ok(instance)
}

/// Writes the event for the instance's current state without changing it.
pub fn write_lifecycle_event(ctx: &mut ProcessingContext<'_>, instance: &ElementInstance) -> HandlerResult {
    ctx.writer.append_event(
        instance.key,
        Intent::ProcessInstance(instance.state.intent()),
        RecordValue::ProcessInstance(instance.to_record()),
    )
}

pub fn model_element<'d>(def: &'d ProcessDefinition, element_id: &str) -> HandlerResult<&'d ElementModel> {
    def.element(element_id).ok_or_else(|| {
        ProcessingError::inconsistent(format!(
            "element '{element_id}' not found in process '{}' version {}",
            def.bpmn_process_id, def.version
        ))
    })
}

/// Creates an element instance in `flow_scope_key` and writes ELEMENT_ACTIVATING.
///
/// An element with loop characteristics is first wrapped in a multi-instance body;
/// the body later activates the element itself as its inner instances.
pub fn activate_element(
    ctx: &mut ProcessingContext<'_>,
    def: &ProcessDefinition,
    element_id: &str,
    flow_scope_key: Key,
) -> HandlerResult<Key> {
    let scope = ctx.element(flow_scope_key)?;
    let element = model_element(def, element_id)?;
    let inside_own_body = scope.element_type == BpmnElementType::MultiInstanceBody
        && scope.element_id == element.id;
    let element_type = if element.multi_instance.is_some() && !inside_own_body {
        BpmnElementType::MultiInstanceBody
    } else {
        element.kind.element_type()
    };

    let key = ctx.next_key();
    let instance = ElementInstance {
        key,
        state: LifecycleState::Activating,
        element_id: element.id.clone(),
        element_type,
        flow_scope_key: Some(flow_scope_key),
        process_instance_key: scope.process_instance_key,
        process_definition_key: scope.process_definition_key,
        bpmn_process_id: scope.bpmn_process_id.clone(),
        version: scope.version,
        active_children: 0,
        job_key: None,
        loop_counter: 0,
        multi_instance: None,
        interrupted_by: None,
        selected_flow: None,
    };
    ctx.state.elements.insert(instance.clone())?;
    write_lifecycle_event(ctx, &instance)?;
    Ok(key)
}

/// Writes SEQUENCE_FLOW_TAKEN. The token counts as an active child of the scope
/// until the event is processed.
pub fn take_sequence_flow(
    ctx: &mut ProcessingContext<'_>,
    scope_key: Key,
    source: &ElementInstance,
    flow_id: &str,
) -> HandlerResult {
    let key = ctx.next_key();
    ctx.state.elements.increment_active(scope_key)?;
    let record = ProcessInstanceRecord {
        element_id: flow_id.to_string(),
        element_type: BpmnElementType::SequenceFlow,
        flow_scope_key: Some(scope_key),
        ..source.to_record()
    };
    ctx.writer.append_event(
        key,
        Intent::ProcessInstance(ProcessInstanceIntent::SequenceFlowTaken),
        RecordValue::ProcessInstance(record),
    )
}

/// Key of the multi-instance body wrapping `instance`, if it is an inner instance.
pub fn enclosing_body(state: &EngineState, instance: &ElementInstance) -> Option<Key> {
    if instance.element_type == BpmnElementType::MultiInstanceBody {
        return None;
    }
    let parent = state.elements.get(instance.flow_scope_key?)?;
    (parent.element_type == BpmnElementType::MultiInstanceBody
        && parent.element_id == instance.element_id)
        .then_some(parent.key)
}

/// Scope that receives the instance's output variables.
pub fn output_scope(state: &EngineState, instance: &ElementInstance) -> Option<Key> {
    match enclosing_body(state, instance) {
        Some(body) => state.elements.get(body).and_then(|b| b.flow_scope_key),
        None => instance.flow_scope_key,
    }
}

// ── Completion and termination ──

/// Generic ELEMENT_COMPLETED step: takes the outgoing flows, removes the instance
/// and hands control back to the flow scope.
pub fn element_completed(ctx: &mut ProcessingContext<'_>, instance: &ElementInstance) -> HandlerResult {
    if let Some(parent_key) = instance.flow_scope_key {
        let parent = ctx.element(parent_key)?;
        let inner = enclosing_body(ctx.state, instance).is_some();
        if parent.state == LifecycleState::Activated && !inner {
            let def = ctx.definition(instance.process_definition_key)?;
            let flows = match &instance.selected_flow {
                Some(flow) => vec![flow.clone()],
                None if instance.element_type == BpmnElementType::ExclusiveGateway => Vec::new(),
                None => def.outgoing(&instance.element_id).to_vec(),
            };
            for flow in &flows {
                take_sequence_flow(ctx, parent_key, instance, flow)?;
            }
        }
    }

    remove_instance(ctx, instance);
    match instance.flow_scope_key {
        Some(parent_key) => {
            ctx.state.elements.decrement_active(parent_key)?;
            on_child_finished(ctx, parent_key, ChildOutcome::Completed)
        }
        None => {
            ctx.state
                .elements
                .set_process_instance_status(instance.key, ProcessInstanceStatus::Completed);
            tracing::debug!(process_instance_key = instance.key, "Process instance completed");
            Ok(())
        }
    }
}

/// Generic ELEMENT_TERMINATED step. An instance interrupted by a boundary event
/// activates that event before releasing its flow scope.
pub fn element_terminated(ctx: &mut ProcessingContext<'_>, instance: &ElementInstance) -> HandlerResult {
    remove_instance(ctx, instance);
    let Some(parent_key) = instance.flow_scope_key else {
        ctx.state
            .elements
            .set_process_instance_status(instance.key, ProcessInstanceStatus::Terminated);
        tracing::debug!(process_instance_key = instance.key, "Process instance terminated");
        return Ok(());
    };

    if let Some(boundary_id) = &instance.interrupted_by {
        if ctx.element(parent_key)?.state == LifecycleState::Activated {
            let def = ctx.definition(instance.process_definition_key)?;
            activate_element(ctx, &def, boundary_id, parent_key)?;
        }
    }
    ctx.state.elements.decrement_active(parent_key)?;
    on_child_finished(ctx, parent_key, ChildOutcome::Terminated)
}

fn remove_instance(ctx: &mut ProcessingContext<'_>, instance: &ElementInstance) {
    ctx.state.elements.remove(instance.key);
    ctx.state.variables.remove_scope(instance.key);
}

/// Continues the flow scope's transition once one of its children is gone.
pub fn on_child_finished(
    ctx: &mut ProcessingContext<'_>,
    parent_key: Key,
    outcome: ChildOutcome,
) -> HandlerResult {
    let parent = ctx.element(parent_key)?;
    match parent.state {
        LifecycleState::Activated => {
            if parent.element_type == BpmnElementType::MultiInstanceBody
                && outcome == ChildOutcome::Completed
            {
                return multi_instance::on_inner_completed(ctx, &parent);
            }
            if parent.active_children == 0 {
                let next = match outcome {
                    ChildOutcome::Completed => LifecycleState::Completing,
                    ChildOutcome::Terminated => LifecycleState::Terminating,
                };
                transition_to(ctx, parent_key, next)?;
            }
        }
        LifecycleState::Terminating if parent.active_children == 0 => {
            transition_to(ctx, parent_key, LifecycleState::Terminated)?;
        }
        _ => {}
    }
    Ok(())
}

/// Terminates every child that can still be terminated and drops the tokens
/// waiting at joins. Returns the remaining active-children count.
pub fn terminate_children(ctx: &mut ProcessingContext<'_>, scope_key: Key) -> HandlerResult<u32> {
    let dropped = ctx.state.elements.clear_joins(scope_key);
    for _ in 0..dropped {
        ctx.state.elements.decrement_active(scope_key)?;
    }
    for child in ctx.state.elements.children(scope_key) {
        let terminable = ctx
            .state
            .elements
            .get(child)
            .is_some_and(|c| c.state.can_terminate());
        if terminable {
            transition_to(ctx, child, LifecycleState::Terminating)?;
        }
    }
    Ok(ctx.element(scope_key)?.active_children)
}

// ── Variables ──

/// Writes a variable into `scope` and emits Variable CREATED/UPDATED.
pub fn set_variable(ctx: &mut ProcessingContext<'_>, scope: Key, name: &str, value: Value) -> HandlerResult {
    let process_instance_key = ctx
        .state
        .elements
        .get(scope)
        .map(|i| i.process_instance_key)
        .ok_or_else(|| EngineError::ScopeTree(format!("variable scope {scope} not found")))?;
    let existing = ctx.state.variables.get_local(scope, name).map(|v| v.key);
    let new_key = match existing {
        Some(key) => key,
        None => ctx.next_key(),
    };
    let (key, write) = ctx
        .state
        .variables
        .set_local(scope, name, value.clone(), new_key);
    let intent = match write {
        VariableWrite::Created => VariableIntent::Created,
        VariableWrite::Updated => VariableIntent::Updated,
        VariableWrite::Unchanged => return Ok(()),
    };
    ctx.writer.append_event(
        key,
        Intent::Variable(intent),
        RecordValue::Variable(VariableRecord {
            name: name.to_string(),
            value,
            scope_key: scope,
            process_instance_key,
        }),
    )
}

/// Updates `name` in the nearest scope from `target_scope` upward that defines it,
/// or creates it in `target_scope`.
pub fn propagate_variable(
    ctx: &mut ProcessingContext<'_>,
    target_scope: Key,
    name: &str,
    value: Value,
) -> HandlerResult {
    let scope = ctx
        .state
        .defining_scope(target_scope, name)
        .unwrap_or(target_scope);
    set_variable(ctx, scope, name, value)
}

pub fn evaluate_in(
    ctx: &ProcessingContext<'_>,
    scope: Key,
    source: &str,
    error_type: ErrorType,
) -> HandlerResult<Value> {
    let state = &*ctx.state;
    mapping::evaluate(source, |name| state.visible_variable(scope, name))
        .map_err(|e| ProcessingError::business(error_type, e.to_string()))
}

fn parse_target(target: &str) -> HandlerResult<VariablePath> {
    VariablePath::parse_target(target)
        .map_err(|e| ProcessingError::business(ErrorType::IoMappingError, e.to_string()))
}

/// Evaluates the element's input mappings and writes the results as local variables.
pub fn apply_input_mappings(
    ctx: &mut ProcessingContext<'_>,
    instance: &ElementInstance,
    element: &ElementModel,
) -> HandlerResult {
    for input in &element.inputs {
        let value = evaluate_in(ctx, instance.key, &input.source, ErrorType::IoMappingError)?;
        let target = parse_target(&input.target)?;
        let current = ctx.state.visible_variable(instance.key, &target.root);
        let merged = mapping::assign(&target, current, value);
        set_variable(ctx, instance.key, &target.root, merged)?;
    }
    Ok(())
}

/// With output mappings only the mapped targets leave the element; without them
/// every local variable is propagated.
pub fn apply_output_behavior(
    ctx: &mut ProcessingContext<'_>,
    instance: &ElementInstance,
    element: &ElementModel,
) -> HandlerResult {
    let Some(target_scope) = output_scope(ctx.state, instance) else {
        return Ok(());
    };

    if element.outputs.is_empty() {
        let mut locals = ctx.state.variables.locals(instance.key);
        if enclosing_body(ctx.state, instance).is_some() {
            locals.remove(LOOP_COUNTER);
            if let Some(name) = element
                .multi_instance
                .as_ref()
                .and_then(|lc| lc.input_element.as_ref())
            {
                locals.remove(name);
            }
        }
        for (name, value) in locals {
            propagate_variable(ctx, target_scope, &name, value)?;
        }
        return Ok(());
    }

    for output in &element.outputs {
        let value = evaluate_in(ctx, instance.key, &output.source, ErrorType::IoMappingError)?;
        let target = parse_target(&output.target)?;
        let current = ctx.state.visible_variable(target_scope, &target.root);
        let merged = mapping::assign(&target, current, value);
        propagate_variable(ctx, target_scope, &target.root, merged)?;
    }
    Ok(())
}

// ── Timers ──

pub fn create_timer(
    ctx: &mut ProcessingContext<'_>,
    instance: &ElementInstance,
    target_element_id: &str,
    timer: &TimerDefinition,
) -> HandlerResult {
    let interval_ms = match timer {
        TimerDefinition::Cycle {
            interval_millis, ..
        } => *interval_millis,
        TimerDefinition::Duration { .. } => 0,
    };
    let due_date = ctx.now().checked_add(timer.first_delay()).ok_or_else(|| {
        ProcessingError::business(
            ErrorType::ExtractValueError,
            format!(
                "Expected timer '{timer}' of '{target_element_id}' to be due within range, but it overflows from {}",
                ctx.now()
            ),
        )
    })?;
    let record = TimerRecord {
        element_instance_key: instance.key,
        process_instance_key: instance.process_instance_key,
        process_definition_key: instance.process_definition_key,
        target_element_id: target_element_id.to_string(),
        due_date,
        repetitions: timer.repetitions(),
        interval_ms,
    };
    schedule_timer(ctx, record)
}

pub fn schedule_timer(ctx: &mut ProcessingContext<'_>, record: TimerRecord) -> HandlerResult {
    let key = ctx.next_key();
    ctx.state.timers.put(key, record.clone());
    ctx.writer
        .append_event(key, Intent::Timer(TimerIntent::Created), RecordValue::Timer(record))
}

/// Schedules the timers of the boundary events attached to an activity. Inner
/// multi-instance elements share the timers of their body.
pub fn schedule_boundary_timers(
    ctx: &mut ProcessingContext<'_>,
    def: &ProcessDefinition,
    instance: &ElementInstance,
) -> HandlerResult {
    if enclosing_body(ctx.state, instance).is_some() {
        return Ok(());
    }
    for boundary_id in def.boundary_events(&instance.element_id) {
        if let ElementKind::BoundaryEvent { timer, .. } = &model_element(def, boundary_id)?.kind {
            create_timer(ctx, instance, boundary_id, timer)?;
        }
    }
    Ok(())
}

pub fn cancel_timers(ctx: &mut ProcessingContext<'_>, element_instance_key: Key) -> HandlerResult {
    for (key, timer) in ctx.state.timers.for_element(element_instance_key) {
        ctx.state.timers.remove(key);
        ctx.writer
            .append_event(key, Intent::Timer(TimerIntent::Canceled), RecordValue::Timer(timer))?;
    }
    Ok(())
}

// ── Incidents ──

/// Stores an incident and writes CREATED. Returns `None` if the element already
/// has an active incident.
pub fn create_incident(ctx: &mut ProcessingContext<'_>, record: IncidentRecord) -> HandlerResult<Option<Key>> {
    if ctx.state.incidents.for_element(record.element_instance_key).is_some() {
        return Ok(None);
    }
    let key = ctx.next_key();
    ctx.state.incidents.create(key, record.clone());
    ctx.writer.append_event(
        key,
        Intent::Incident(IncidentIntent::Created),
        RecordValue::Incident(record),
    )?;
    Ok(Some(key))
}

/// Incident for a business failure raised while the element was in its current state.
pub fn raise_incident(
    ctx: &mut ProcessingContext<'_>,
    instance: &ElementInstance,
    failure: &Failure,
) -> HandlerResult<Option<Key>> {
    create_incident(
        ctx,
        IncidentRecord {
            error_type: failure.error_type,
            error_message: failure.message.clone(),
            bpmn_process_id: instance.bpmn_process_id.clone(),
            process_definition_key: instance.process_definition_key,
            process_instance_key: instance.process_instance_key,
            element_id: instance.element_id.clone(),
            element_instance_key: instance.key,
            job_key: None,
            variable_scope_key: instance.key,
            failed_state: Some(instance.state),
        },
    )
}

pub fn resolve_incident_of(ctx: &mut ProcessingContext<'_>, element_instance_key: Key) -> HandlerResult {
    let Some(incident_key) = ctx.state.incidents.for_element(element_instance_key) else {
        return Ok(());
    };
    if let Some(record) = ctx.state.incidents.resolve(incident_key) {
        ctx.writer.append_event(
            incident_key,
            Intent::Incident(IncidentIntent::Resolved),
            RecordValue::Incident(record),
        )?;
    }
    Ok(())
}
