use super::context::ProcessingContext;
use crate::bpmn::behavior::create_incident;
use crate::bpmn::run_step;
use crate::error::{HandlerResult, ProcessingError};
use crate::record::{RecordValue, RejectionType};
use crate::state::JobState;
use crate::types::{IncidentIntent, Intent};

/// Raises an incident for a job that ran out of retries.
pub fn create(ctx: &mut ProcessingContext<'_>) -> HandlerResult {
    let record = ctx
        .record
        .value
        .as_incident()
        .cloned()
        .ok_or_else(|| ProcessingError::inconsistent("incident command without an incident value"))?;
    let Some(job_key) = record.job_key else {
        return Err(ProcessingError::rejected(
            RejectionType::InvalidArgument,
            "Expected an incident command to reference a job",
        ));
    };
    let job = ctx.state.jobs.get(job_key).cloned().ok_or_else(|| {
        ProcessingError::rejected(
            RejectionType::NotFound,
            format!("Expected to create an incident for job '{job_key}', but no such job was found"),
        )
    })?;
    if job.state != JobState::Failed || job.record.retries > 0 {
        return Err(ProcessingError::rejected(
            RejectionType::InvalidState,
            format!(
                "Expected to create an incident for job '{job_key}' without retries, but it is {} with {} retries",
                job.state, job.record.retries
            ),
        ));
    }
    let element_key = record.element_instance_key;
    if create_incident(ctx, record)?.is_none() {
        return Err(ProcessingError::rejected(
            RejectionType::AlreadyExists,
            format!("Expected to create an incident for element instance '{element_key}', but it already has one"),
        ));
    }
    Ok(())
}

/// Resolves an incident and retries what failed: the job becomes activatable
/// again, or the element's failed lifecycle step runs once more. An element
/// incident is only resolved if that step now succeeds.
pub fn resolve(ctx: &mut ProcessingContext<'_>) -> HandlerResult {
    let key = ctx.record.key;
    let record = ctx.state.incidents.get(key).cloned().ok_or_else(|| {
        ProcessingError::rejected(
            RejectionType::NotFound,
            format!("Expected to resolve incident with key '{key}', but no such incident was found"),
        )
    })?;

    if let Some(job_key) = record.job_key {
        let job = ctx.state.jobs.get(job_key).cloned().ok_or_else(|| {
            ProcessingError::rejected(
                RejectionType::NotFound,
                format!("Expected to resolve incident '{key}' of job '{job_key}', but the job no longer exists"),
            )
        })?;
        if job.record.retries == 0 {
            return Err(ProcessingError::rejected(
                RejectionType::InvalidState,
                format!(
                    "Expected to resolve incident '{key}' after the retries of job '{job_key}' were updated, but it has no retries"
                ),
            ));
        }
        ctx.state.incidents.resolve(key);
        ctx.writer.append_event(
            key,
            Intent::Incident(IncidentIntent::Resolved),
            RecordValue::Incident(record),
        )?;
        if job.state == JobState::Failed {
            ctx.state.jobs.make_activatable(job_key);
            ctx.job_available(&job.record.job_type);
        }
        return Ok(());
    }

    let failed_state = record
        .failed_state
        .ok_or_else(|| ProcessingError::inconsistent(format!("incident {key} has neither a job nor a failed state")))?;
    let instance = ctx.element_or_reject(record.element_instance_key)?;
    if instance.state != failed_state {
        return Err(ProcessingError::rejected(
            RejectionType::InvalidState,
            format!(
                "Expected element instance '{}' to still be {failed_state:?} to resolve incident '{key}', but it is {:?}",
                instance.key, instance.state
            ),
        ));
    }
    ctx.state.incidents.resolve(key);
    ctx.writer.append_event(
        key,
        Intent::Incident(IncidentIntent::Resolved),
        RecordValue::Incident(record),
    )?;
    // A repeated failure rejects the resolve, which rolls all of the above back.
    run_step(ctx, &instance).map_err(|e| match e {
        ProcessingError::Business(failure) => ProcessingError::rejected(
            RejectionType::InvalidState,
            format!(
                "Expected to resolve incident '{key}', but element instance '{}' failed again in {failed_state:?}: {}",
                instance.key, failure.message
            ),
        ),
        other => other,
    })
}
