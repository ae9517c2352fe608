use super::context::ProcessingContext;
use crate::bpmn::behavior::{set_variable, transition_to, write_lifecycle_event};
use crate::error::{HandlerResult, ProcessingError};
use crate::record::{ProcessInstanceCreationRecord, RecordValue, RejectionType};
use crate::state::{ElementInstance, ProcessInstanceEntry, ProcessInstanceStatus};
use crate::types::{BpmnElementType, Intent, LifecycleState, ProcessInstanceCreationIntent};

/// Creates a process instance of the latest (or a given) version and sends the
/// root element into ACTIVATING.
pub fn create(ctx: &mut ProcessingContext<'_>) -> HandlerResult {
    let creation = ctx
        .record
        .value
        .as_creation()
        .cloned()
        .ok_or_else(|| ProcessingError::inconsistent("creation command without a creation value"))?;

    let definition = match creation.version {
        Some(version) => ctx
            .state
            .definitions
            .by_version(&creation.bpmn_process_id, version),
        None => ctx.state.definitions.latest(&creation.bpmn_process_id),
    };
    let Some(def) = definition else {
        return Err(ProcessingError::rejected(
            RejectionType::NotFound,
            format!(
                "Expected to find process definition with process ID '{}', but none found",
                creation.bpmn_process_id
            ),
        ));
    };

    let key = ctx.next_key();
    let root = ElementInstance {
        key,
        state: LifecycleState::Activating,
        element_id: def.bpmn_process_id.clone(),
        element_type: BpmnElementType::Process,
        flow_scope_key: None,
        process_instance_key: key,
        process_definition_key: def.key,
        bpmn_process_id: def.bpmn_process_id.clone(),
        version: def.version,
        active_children: 0,
        job_key: None,
        loop_counter: 0,
        multi_instance: None,
        interrupted_by: None,
        selected_flow: None,
    };
    ctx.state.elements.insert(root.clone())?;
    ctx.state.elements.put_process_instance(ProcessInstanceEntry {
        key,
        process_definition_key: def.key,
        bpmn_process_id: def.bpmn_process_id.clone(),
        status: ProcessInstanceStatus::Active,
    });
    for (name, value) in &creation.variables {
        set_variable(ctx, key, name, value.clone())?;
    }

    ctx.writer.append_event(
        key,
        Intent::ProcessInstanceCreation(ProcessInstanceCreationIntent::Created),
        RecordValue::ProcessInstanceCreation(ProcessInstanceCreationRecord {
            bpmn_process_id: def.bpmn_process_id.clone(),
            version: Some(def.version),
            process_definition_key: def.key,
            process_instance_key: key,
            variables: creation.variables,
        }),
    )?;
    write_lifecycle_event(ctx, &root)
}

/// Cancels a whole process instance.
pub fn cancel(ctx: &mut ProcessingContext<'_>) -> HandlerResult {
    let key = ctx.record.key;
    let instance = ctx
        .state
        .elements
        .get(key)
        .filter(|i| i.is_root())
        .cloned()
        .ok_or_else(|| {
            ProcessingError::rejected(
                RejectionType::NotFound,
                format!("Expected to cancel a process instance with key '{key}', but no such process was found"),
            )
        })?;
    terminate(ctx, &instance)
}

/// Terminates a single element instance and everything below it.
pub fn terminate_element(ctx: &mut ProcessingContext<'_>) -> HandlerResult {
    let instance = ctx.element_or_reject(ctx.record.key)?;
    terminate(ctx, &instance)
}

fn terminate(ctx: &mut ProcessingContext<'_>, instance: &ElementInstance) -> HandlerResult {
    if !instance.state.can_terminate() {
        return Err(ProcessingError::rejected(
            RejectionType::InvalidState,
            format!(
                "Expected to terminate element instance '{}', but it is already {:?}",
                instance.key, instance.state
            ),
        ));
    }
    transition_to(ctx, instance.key, LifecycleState::Terminating)?;
    Ok(())
}
