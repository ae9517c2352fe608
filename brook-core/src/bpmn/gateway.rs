use super::behavior::model_element;
use super::element;
use crate::error::{HandlerResult, ProcessingError};
use crate::model::ElementKind;
use crate::processor::ProcessingContext;
use crate::record::ErrorType;
use crate::state::ElementInstance;

/// Picks the first outgoing flow whose condition holds, falling back to the
/// default flow, then completes like any other element.
pub fn exclusive_completing(ctx: &mut ProcessingContext<'_>, instance: &ElementInstance) -> HandlerResult {
    let def = ctx.definition(instance.process_definition_key)?;
    let element = model_element(&def, &instance.element_id)?;
    let default_flow = match &element.kind {
        ElementKind::ExclusiveGateway { default_flow } => default_flow.as_ref(),
        _ => None,
    };
    let outgoing = def.outgoing(&instance.element_id);

    let mut selected = None;
    for flow_id in outgoing {
        if Some(flow_id) == default_flow {
            continue;
        }
        let Some(flow) = def.flow(flow_id) else {
            return Err(ProcessingError::inconsistent(format!("sequence flow '{flow_id}' not found")));
        };
        let taken = match &flow.condition {
            None => true,
            Some(condition) => {
                let state = &*ctx.state;
                condition
                    .evaluate(|name| state.visible_variable(instance.key, name))
                    .map_err(|e| ProcessingError::business(ErrorType::ConditionError, e.to_string()))?
            }
        };
        if taken {
            selected = Some(flow_id.clone());
            break;
        }
    }

    let selected = selected.or_else(|| default_flow.cloned());
    if selected.is_none() && !outgoing.is_empty() {
        return Err(ProcessingError::business(
            ErrorType::ConditionError,
            format!(
                "Expected at least one condition of gateway '{}' to evaluate to true, or to have a default flow",
                instance.element_id
            ),
        ));
    }
    ctx.state
        .elements
        .update(instance.key, |i| i.selected_flow = selected)?;
    element::completing(ctx, instance)
}
