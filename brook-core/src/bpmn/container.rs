//! Process and embedded sub-process steps.

use super::behavior::{
    activate_element, cancel_timers, resolve_incident_of, schedule_boundary_timers,
    terminate_children, transition_to,
};
use crate::error::{HandlerResult, ProcessingError};
use crate::processor::ProcessingContext;
use crate::state::ElementInstance;
use crate::types::{BpmnElementType, LifecycleState};

/// The process itself carries no mappings.
pub fn process_activating(ctx: &mut ProcessingContext<'_>, instance: &ElementInstance) -> HandlerResult {
    transition_to(ctx, instance.key, LifecycleState::Activated)?;
    Ok(())
}

pub fn process_completing(ctx: &mut ProcessingContext<'_>, instance: &ElementInstance) -> HandlerResult {
    transition_to(ctx, instance.key, LifecycleState::Completed)?;
    Ok(())
}

/// Activates the none start event of the container's scope.
pub fn activated(ctx: &mut ProcessingContext<'_>, instance: &ElementInstance) -> HandlerResult {
    let def = ctx.definition(instance.process_definition_key)?;
    let scope = match instance.element_type {
        BpmnElementType::Process => None,
        _ => {
            schedule_boundary_timers(ctx, &def, instance)?;
            Some(instance.element_id.as_str())
        }
    };
    let start = def.start_event(scope).ok_or_else(|| {
        ProcessingError::inconsistent(format!(
            "no start event in scope '{}' of process '{}'",
            instance.element_id, def.bpmn_process_id
        ))
    })?;
    activate_element(ctx, &def, &start.id, instance.key)?;
    Ok(())
}

/// Terminates the children; TERMINATED follows once the last one is gone.
pub fn terminating(ctx: &mut ProcessingContext<'_>, instance: &ElementInstance) -> HandlerResult {
    resolve_incident_of(ctx, instance.key)?;
    cancel_timers(ctx, instance.key)?;
    if terminate_children(ctx, instance.key)? == 0 {
        transition_to(ctx, instance.key, LifecycleState::Terminated)?;
    }
    Ok(())
}
