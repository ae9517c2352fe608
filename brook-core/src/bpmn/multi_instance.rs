//! Multi-instance body steps.
//!
//! The body evaluates the input collection once, then spawns one inner instance
//! per item: all at once when parallel, one after another when sequential. Each
//! inner instance gets the item and its loop counter as local variables.

use super::behavior::{
    activate_element, cancel_timers, evaluate_in, model_element, propagate_variable,
    schedule_boundary_timers, set_variable, transition_to, LOOP_COUNTER,
};
use crate::error::{HandlerResult, ProcessingError};
use crate::model::{ElementModel, LoopCharacteristics, ProcessDefinition};
use crate::processor::ProcessingContext;
use crate::record::ErrorType;
use crate::state::{ElementInstance, MultiInstanceProgress};
use crate::types::{Key, LifecycleState};
use serde_json::Value;

fn loop_characteristics(element: &ElementModel) -> HandlerResult<&LoopCharacteristics> {
    element.multi_instance.as_ref().ok_or_else(|| {
        ProcessingError::inconsistent(format!("element '{}' is not multi-instance", element.id))
    })
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "NULL",
        Value::Bool(_) => "BOOLEAN",
        Value::Number(_) => "NUMBER",
        Value::String(_) => "STRING",
        Value::Array(_) => "ARRAY",
        Value::Object(_) => "OBJECT",
    }
}

pub fn activating(ctx: &mut ProcessingContext<'_>, body: &ElementInstance) -> HandlerResult {
    let def = ctx.definition(body.process_definition_key)?;
    let lc = loop_characteristics(model_element(&def, &body.element_id)?)?;

    let collection = evaluate_in(ctx, body.key, &lc.input_collection, ErrorType::ExtractValueError)?;
    let items = match collection {
        Value::Array(items) => items,
        other => {
            return Err(ProcessingError::business(
                ErrorType::ExtractValueError,
                format!(
                    "Expected result of the expression '{}' to be 'ARRAY', but was '{}'",
                    lc.input_collection,
                    type_name(&other)
                ),
            ))
        }
    };
    let count = items.len();
    ctx.state.elements.update(body.key, |b| {
        b.multi_instance = Some(MultiInstanceProgress { items, spawned: 0 })
    })?;
    if let Some(name) = &lc.output_collection {
        set_variable(ctx, body.key, name, Value::Array(vec![Value::Null; count]))?;
    }
    transition_to(ctx, body.key, LifecycleState::Activated)?;
    Ok(())
}

pub fn activated(ctx: &mut ProcessingContext<'_>, body: &ElementInstance) -> HandlerResult {
    let def = ctx.definition(body.process_definition_key)?;
    let lc = loop_characteristics(model_element(&def, &body.element_id)?)?;
    schedule_boundary_timers(ctx, &def, body)?;

    let total = body
        .multi_instance
        .as_ref()
        .map(|p| p.items.len())
        .unwrap_or(0);
    if total == 0 {
        transition_to(ctx, body.key, LifecycleState::Completing)?;
        return Ok(());
    }
    let initial = if lc.sequential { 1 } else { total };
    for _ in 0..initial {
        spawn_inner(ctx, &def, body.key)?;
    }
    Ok(())
}

/// Activates the next inner instance of the body.
fn spawn_inner(ctx: &mut ProcessingContext<'_>, def: &ProcessDefinition, body_key: Key) -> HandlerResult {
    let body = ctx.element(body_key)?;
    let progress = body
        .multi_instance
        .ok_or_else(|| ProcessingError::inconsistent(format!("body {body_key} has no input collection")))?;
    let item = progress
        .items
        .get(progress.spawned as usize)
        .cloned()
        .ok_or_else(|| ProcessingError::inconsistent(format!("body {body_key} has no items left")))?;
    let lc = loop_characteristics(model_element(def, &body.element_id)?)?;
    let loop_counter = progress.spawned + 1;

    ctx.state.elements.update(body_key, |b| {
        if let Some(p) = b.multi_instance.as_mut() {
            p.spawned = loop_counter;
        }
    })?;
    let inner = activate_element(ctx, def, &body.element_id, body_key)?;
    ctx.state
        .elements
        .update(inner, |i| i.loop_counter = loop_counter)?;
    if let Some(name) = &lc.input_element {
        set_variable(ctx, inner, name, item)?;
    }
    set_variable(ctx, inner, LOOP_COUNTER, Value::from(loop_counter))
}

/// Called after an inner instance completed and left the body.
pub fn on_inner_completed(ctx: &mut ProcessingContext<'_>, body: &ElementInstance) -> HandlerResult {
    let def = ctx.definition(body.process_definition_key)?;
    let lc = loop_characteristics(model_element(&def, &body.element_id)?)?;
    let remaining = body
        .multi_instance
        .as_ref()
        .map(|p| (p.spawned as usize) < p.items.len())
        .unwrap_or(false);

    if lc.sequential && remaining {
        spawn_inner(ctx, &def, body.key)
    } else {
        if body.active_children == 0 {
            transition_to(ctx, body.key, LifecycleState::Completing)?;
        }
        Ok(())
    }
}

/// Writes the inner instance's output element into the body's output collection.
pub fn collect_output(
    ctx: &mut ProcessingContext<'_>,
    inner: &ElementInstance,
    element: &ElementModel,
    body_key: Key,
) -> HandlerResult {
    let lc = loop_characteristics(element)?;
    let (Some(collection), Some(output)) = (&lc.output_collection, &lc.output_element) else {
        return Ok(());
    };
    let value = evaluate_in(ctx, inner.key, output, ErrorType::ExtractValueError)?;
    let mut items = match ctx.state.variables.get_local(body_key, collection) {
        Some(variable) => match &variable.value {
            Value::Array(items) => items.clone(),
            other => {
                return Err(ProcessingError::business(
                    ErrorType::ExtractValueError,
                    format!(
                        "Expected output collection '{collection}' to be 'ARRAY', but was '{}'",
                        type_name(other)
                    ),
                ))
            }
        },
        None => {
            return Err(ProcessingError::inconsistent(format!(
                "output collection '{collection}' missing on body {body_key}"
            )))
        }
    };
    let index = (inner.loop_counter as usize).saturating_sub(1);
    let Some(slot) = items.get_mut(index) else {
        return Err(ProcessingError::inconsistent(format!(
            "loop counter {} outside output collection '{collection}'",
            inner.loop_counter
        )));
    };
    *slot = value;
    set_variable(ctx, body_key, collection, Value::Array(items))
}

/// Hands the output collection to the body's flow scope.
pub fn completing(ctx: &mut ProcessingContext<'_>, body: &ElementInstance) -> HandlerResult {
    let def = ctx.definition(body.process_definition_key)?;
    let lc = loop_characteristics(model_element(&def, &body.element_id)?)?;
    if let (Some(name), Some(target)) = (&lc.output_collection, body.flow_scope_key) {
        let value = ctx
            .state
            .variables
            .get_local(body.key, name)
            .map(|v| v.value.clone());
        if let Some(value) = value {
            propagate_variable(ctx, target, name, value)?;
        }
    }
    cancel_timers(ctx, body.key)?;
    transition_to(ctx, body.key, LifecycleState::Completed)?;
    Ok(())
}
