use super::context::ProcessingContext;
use crate::bpmn::behavior::{activate_element, cancel_timers, model_element, schedule_timer, transition_to};
use crate::error::{HandlerResult, ProcessingError};
use crate::model::ElementKind;
use crate::record::{RecordValue, RejectionType, TimerRecord};
use crate::types::{Intent, LifecycleState, TimerIntent};

/// Fires a due timer.
///
/// A catch event's own timer completes the event. A boundary timer either
/// interrupts the activity it is attached to, or activates the boundary event
/// next to it and, for cycles, schedules the next repetition.
pub fn trigger(ctx: &mut ProcessingContext<'_>) -> HandlerResult {
    let key = ctx.record.key;
    let timer = ctx.state.timers.get(key).cloned().ok_or_else(|| {
        ProcessingError::rejected(
            RejectionType::NotFound,
            format!("Expected to trigger timer with key '{key}', but no such timer was found"),
        )
    })?;
    let now = ctx.now();
    if timer.due_date > now {
        return Err(ProcessingError::rejected(
            RejectionType::InvalidState,
            format!(
                "Expected to trigger timer with key '{key}', but it is not due until {}",
                timer.due_date
            ),
        ));
    }
    let instance = ctx
        .state
        .elements
        .get(timer.element_instance_key)
        .filter(|i| i.state == LifecycleState::Activated)
        .cloned()
        .ok_or_else(|| {
            ProcessingError::rejected(
                RejectionType::InvalidState,
                format!(
                    "Expected to trigger timer with key '{key}', but element instance '{}' is not active",
                    timer.element_instance_key
                ),
            )
        })?;

    ctx.state.timers.remove(key);
    ctx.writer.append_event(
        key,
        Intent::Timer(TimerIntent::Triggered),
        RecordValue::Timer(timer.clone()),
    )?;

    if timer.target_element_id == instance.element_id {
        transition_to(ctx, instance.key, LifecycleState::Completing)?;
        return Ok(());
    }

    let def = ctx.definition(instance.process_definition_key)?;
    let ElementKind::BoundaryEvent { cancel_activity, .. } = model_element(&def, &timer.target_element_id)?.kind
    else {
        return Err(ProcessingError::inconsistent(format!(
            "timer target '{}' is not a boundary event",
            timer.target_element_id
        )));
    };

    if cancel_activity {
        let boundary_id = timer.target_element_id.clone();
        ctx.state
            .elements
            .update(instance.key, |i| i.interrupted_by = Some(boundary_id))?;
        cancel_timers(ctx, instance.key)?;
        transition_to(ctx, instance.key, LifecycleState::Terminating)?;
        return Ok(());
    }

    let scope_key = instance.flow_scope_key.ok_or_else(|| {
        ProcessingError::inconsistent(format!("boundary timer {key} attached to a root instance"))
    })?;
    activate_element(ctx, &def, &timer.target_element_id, scope_key)?;
    if timer.repetitions == -1 || timer.repetitions > 1 {
        let repetitions = if timer.repetitions > 1 {
            timer.repetitions - 1
        } else {
            -1
        };
        let Some(due_date) = now.checked_add(timer.interval_ms) else {
            tracing::warn!(
                timer_key = key,
                interval_ms = timer.interval_ms,
                "Timer: cycle ends, next due date overflows"
            );
            return Ok(());
        };
        schedule_timer(
            ctx,
            TimerRecord {
                due_date,
                repetitions,
                ..timer
            },
        )?;
    }
    Ok(())
}
