//! Service task steps. The job is the task's wait state.

use super::behavior::{apply_input_mappings, model_element, schedule_boundary_timers, transition_to};
use super::element;
use crate::error::{EngineError, HandlerResult, ProcessingError};
use crate::model::ElementKind;
use crate::processor::ProcessingContext;
use crate::record::{JobRecord, RecordValue};
use crate::state::ElementInstance;
use crate::types::{Intent, JobIntent, LifecycleState};

pub fn activating(ctx: &mut ProcessingContext<'_>, instance: &ElementInstance) -> HandlerResult {
    let def = ctx.definition(instance.process_definition_key)?;
    let element = model_element(&def, &instance.element_id)?;
    apply_input_mappings(ctx, instance, element)?;

    let ElementKind::ServiceTask { job_type, retries } = &element.kind else {
        return Err(ProcessingError::inconsistent(format!(
            "element '{}' is not a service task",
            element.id
        )));
    };
    let job_key = ctx.next_key();
    let job = JobRecord {
        job_type: job_type.clone(),
        retries: *retries,
        bpmn_process_id: instance.bpmn_process_id.clone(),
        process_definition_key: instance.process_definition_key,
        process_instance_key: instance.process_instance_key,
        element_id: instance.element_id.clone(),
        element_instance_key: instance.key,
        ..Default::default()
    };
    ctx.state.jobs.create(job_key, job.clone());
    ctx.state
        .elements
        .update(instance.key, |i| i.job_key = Some(job_key))?;
    ctx.writer
        .append_event(job_key, Intent::Job(JobIntent::Created), RecordValue::Job(job))?;

    transition_to(ctx, instance.key, LifecycleState::Activated)?;
    Ok(())
}

/// Waits for the job; only the boundary timers are armed here.
pub fn activated(ctx: &mut ProcessingContext<'_>, instance: &ElementInstance) -> HandlerResult {
    let def = ctx.definition(instance.process_definition_key)?;
    schedule_boundary_timers(ctx, &def, instance)
}

pub fn terminating(ctx: &mut ProcessingContext<'_>, instance: &ElementInstance) -> HandlerResult {
    if let Some(job_key) = instance.job_key {
        let job = ctx
            .state
            .jobs
            .get(job_key)
            .ok_or(EngineError::MissingJob(job_key))?;
        let record = job.record.clone();
        ctx.writer
            .append_command(job_key, Intent::Job(JobIntent::Cancel), RecordValue::Job(record))?;
    }
    element::terminating(ctx, instance)
}
