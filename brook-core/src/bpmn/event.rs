use super::behavior::{create_timer, model_element};
use crate::error::{HandlerResult, ProcessingError};
use crate::model::ElementKind;
use crate::processor::ProcessingContext;
use crate::state::ElementInstance;

/// An intermediate timer catch event waits for its own timer.
pub fn timer_catch_activated(ctx: &mut ProcessingContext<'_>, instance: &ElementInstance) -> HandlerResult {
    let def = ctx.definition(instance.process_definition_key)?;
    let element = model_element(&def, &instance.element_id)?;
    let ElementKind::TimerCatchEvent { timer } = &element.kind else {
        return Err(ProcessingError::inconsistent(format!(
            "element '{}' is not a timer catch event",
            element.id
        )));
    };
    create_timer(ctx, instance, &instance.element_id, timer)
}
