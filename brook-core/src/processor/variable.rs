use super::context::ProcessingContext;
use crate::bpmn::behavior::set_variable;
use crate::error::{HandlerResult, ProcessingError};
use crate::record::{RecordValue, UpdateSemantics};
use crate::types::{Intent, VariableDocumentIntent};

/// Merges a variable document into a scope. Propagating updates write each
/// variable where it is already defined, or into the root scope.
pub fn update(ctx: &mut ProcessingContext<'_>) -> HandlerResult {
    let document = ctx
        .record
        .value
        .as_variable_document()
        .cloned()
        .ok_or_else(|| ProcessingError::inconsistent("variable document command without a document"))?;
    let scope = ctx.element_or_reject(document.scope_key)?;

    for (name, value) in &document.variables {
        let target = match document.update_semantics {
            UpdateSemantics::Local => scope.key,
            UpdateSemantics::Propagate => ctx
                .state
                .defining_scope(scope.key, name)
                .unwrap_or(scope.process_instance_key),
        };
        set_variable(ctx, target, name, value.clone())?;
    }

    let key = ctx.next_key();
    ctx.writer.append_event(
        key,
        Intent::VariableDocument(VariableDocumentIntent::Updated),
        RecordValue::VariableDocument(document),
    )
}
