//! Generic lifecycle steps used by most element types.

use super::behavior::{
    apply_input_mappings, apply_output_behavior, cancel_timers, element_completed,
    element_terminated, enclosing_body, model_element, resolve_incident_of, transition_to,
};
use super::multi_instance;
use crate::error::HandlerResult;
use crate::processor::ProcessingContext;
use crate::state::ElementInstance;
use crate::types::LifecycleState;

pub fn activating(ctx: &mut ProcessingContext<'_>, instance: &ElementInstance) -> HandlerResult {
    let def = ctx.definition(instance.process_definition_key)?;
    let element = model_element(&def, &instance.element_id)?;
    apply_input_mappings(ctx, instance, element)?;
    transition_to(ctx, instance.key, LifecycleState::Activated)?;
    Ok(())
}

/// Elements without a wait state move straight on.
pub fn activated(ctx: &mut ProcessingContext<'_>, instance: &ElementInstance) -> HandlerResult {
    transition_to(ctx, instance.key, LifecycleState::Completing)?;
    Ok(())
}

pub fn completing(ctx: &mut ProcessingContext<'_>, instance: &ElementInstance) -> HandlerResult {
    let def = ctx.definition(instance.process_definition_key)?;
    let element = model_element(&def, &instance.element_id)?;
    if let Some(body_key) = enclosing_body(ctx.state, instance) {
        multi_instance::collect_output(ctx, instance, element, body_key)?;
    }
    apply_output_behavior(ctx, instance, element)?;
    cancel_timers(ctx, instance.key)?;
    transition_to(ctx, instance.key, LifecycleState::Completed)?;
    Ok(())
}

pub fn completed(ctx: &mut ProcessingContext<'_>, instance: &ElementInstance) -> HandlerResult {
    element_completed(ctx, instance)
}

pub fn terminating(ctx: &mut ProcessingContext<'_>, instance: &ElementInstance) -> HandlerResult {
    resolve_incident_of(ctx, instance.key)?;
    cancel_timers(ctx, instance.key)?;
    transition_to(ctx, instance.key, LifecycleState::Terminated)?;
    Ok(())
}

pub fn terminated(ctx: &mut ProcessingContext<'_>, instance: &ElementInstance) -> HandlerResult {
    element_terminated(ctx, instance)
}
