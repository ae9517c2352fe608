//! Job commands.
//!
//! A job moves CREATED -> ACTIVATABLE -> ACTIVATED and ends with COMPLETED or
//! CANCELED. FAILED with retries left, and TIMED_OUT, make it activatable again.

use super::context::ProcessingContext;
use crate::bpmn::behavior::{set_variable, transition_to};
use crate::error::{HandlerResult, ProcessingError};
use crate::record::{
    ErrorType, IncidentRecord, JobBatchRecord, JobRecord, RecordValue, RejectionType, NO_KEY,
};
use crate::state::{Job, JobState};
use crate::types::{IncidentIntent, Intent, JobBatchIntent, JobIntent, Key, LifecycleState};

fn job_value(ctx: &ProcessingContext<'_>) -> HandlerResult<JobRecord> {
    ctx.record
        .value
        .as_job()
        .cloned()
        .ok_or_else(|| ProcessingError::inconsistent("job record without a job value"))
}

fn find_job(ctx: &ProcessingContext<'_>, key: Key, action: &str) -> HandlerResult<Job> {
    ctx.state.jobs.get(key).cloned().ok_or_else(|| {
        ProcessingError::rejected(
            RejectionType::NotFound,
            format!("Expected to {action} job with key '{key}', but no such job was found"),
        )
    })
}

fn expect_state(job: &Job, expected: JobState, action: &str) -> HandlerResult {
    if job.state == expected {
        return Ok(());
    }
    Err(ProcessingError::rejected(
        RejectionType::InvalidState,
        format!(
            "Expected to {action} job with key '{}', but it is in state '{}'",
            job.key, job.state
        ),
    ))
}

/// The job's element and every scope around it must still be ACTIVATED. A
/// cancel or interrupt that got there first wins.
fn expect_scopes_active(ctx: &ProcessingContext<'_>, job: &Job, action: &str) -> HandlerResult {
    let element_key = job.record.element_instance_key;
    for scope in ctx.state.ancestry(element_key) {
        let state = ctx.state.elements.get(scope).map(|e| e.state);
        if state != Some(LifecycleState::Activated) {
            return Err(ProcessingError::rejected(
                RejectionType::InvalidState,
                format!(
                    "Expected to {action} job with key '{}', but element instance '{scope}' is {}",
                    job.key,
                    state.map_or_else(|| "gone".to_string(), |s| format!("{s:?}"))
                ),
            ));
        }
    }
    Ok(())
}

/// A freshly created job becomes available to workers.
pub fn created(ctx: &mut ProcessingContext<'_>) -> HandlerResult {
    let key = ctx.record.key;
    let job = find_job(ctx, key, "publish")?;
    expect_state(&job, JobState::Created, "publish")?;
    ctx.state.jobs.make_activatable(key);
    ctx.job_available(&job.record.job_type);
    Ok(())
}

/// Rejects activation timeouts that are not positive, exceed the configured
/// maximum, or push the deadline past the end of time.
fn activation_deadline(ctx: &ProcessingContext<'_>, timeout_ms: i64) -> Result<i64, String> {
    let max = ctx.writer.limits().max_job_timeout_ms;
    if timeout_ms <= 0 {
        return Err(format!(
            "Expected to activate jobs with a positive timeout, but it was {timeout_ms}"
        ));
    }
    if timeout_ms > max {
        return Err(format!(
            "Expected to activate jobs with a timeout of at most {max} ms, but it was {timeout_ms}"
        ));
    }
    ctx.now().checked_add(timeout_ms).ok_or_else(|| {
        format!("Expected a job deadline within range, but {} + {timeout_ms} overflows", ctx.now())
    })
}

fn activate_one(
    ctx: &mut ProcessingContext<'_>,
    key: Key,
    worker: &str,
    timeout_ms: i64,
    deadline: i64,
) -> HandlerResult<JobRecord> {
    let mut record = ctx
        .state
        .jobs
        .activate(key, worker, deadline)
        .map(|job| job.record.clone())
        .ok_or_else(|| ProcessingError::inconsistent(format!("activatable job {key} vanished")))?;
    record.timeout_ms = timeout_ms;
    record.variables = ctx.state.visible_variables(record.element_instance_key);
    Ok(record)
}

/// Activates one job for a worker.
pub fn activate(ctx: &mut ProcessingContext<'_>) -> HandlerResult {
    let key = ctx.record.key;
    let request = job_value(ctx)?;
    let deadline = activation_deadline(ctx, request.timeout_ms)
        .map_err(|reason| ProcessingError::rejected(RejectionType::InvalidArgument, reason))?;
    let job = find_job(ctx, key, "activate")?;
    expect_state(&job, JobState::Activatable, "activate")?;
    let record = activate_one(ctx, key, &request.worker, request.timeout_ms, deadline)?;
    ctx.writer.append_event(
        key,
        Intent::Job(JobIntent::Activated),
        RecordValue::Job(record),
    )
}

/// Activates up to `max_jobs_to_activate` jobs of one type, oldest first. An
/// empty batch is a valid answer.
pub fn activate_batch(ctx: &mut ProcessingContext<'_>) -> HandlerResult {
    let request = ctx
        .record
        .value
        .as_job_batch()
        .cloned()
        .ok_or_else(|| ProcessingError::inconsistent("job batch command without a batch value"))?;

    let deadline = if request.job_type.trim().is_empty() {
        Err("Expected to activate jobs of a non-empty type".to_string())
    } else if request.worker.trim().is_empty() {
        Err("Expected to activate jobs for a named worker".to_string())
    } else if request.max_jobs_to_activate == 0 {
        Err("Expected to activate at least one job".to_string())
    } else {
        activation_deadline(ctx, request.timeout_ms)
    }
    .map_err(|reason| ProcessingError::rejected(RejectionType::InvalidArgument, reason))?;

    let keys = ctx
        .state
        .jobs
        .activatable_of_type(&request.job_type, request.max_jobs_to_activate as usize);
    let mut batch = JobBatchRecord {
        job_keys: Vec::with_capacity(keys.len()),
        jobs: Vec::with_capacity(keys.len()),
        ..request
    };
    for key in keys {
        let record = activate_one(ctx, key, &batch.worker, batch.timeout_ms, deadline)?;
        batch.job_keys.push(key);
        batch.jobs.push(record);
    }

    let batch_key = ctx.next_key();
    ctx.writer.append_event(
        batch_key,
        Intent::JobBatch(JobBatchIntent::Activated),
        RecordValue::JobBatch(batch),
    )
}

/// Completes an activated job and lets its element move on.
pub fn complete(ctx: &mut ProcessingContext<'_>) -> HandlerResult {
    let key = ctx.record.key;
    let request = job_value(ctx)?;
    let job = find_job(ctx, key, "complete")?;
    expect_state(&job, JobState::Activated, "complete")?;

    let element_key = job.record.element_instance_key;
    expect_scopes_active(ctx, &job, "complete")?;

    for (name, value) in &request.variables {
        set_variable(ctx, element_key, name, value.clone())?;
    }
    ctx.state.elements.update(element_key, |e| e.job_key = None)?;
    ctx.state.jobs.remove(key);

    let mut record = job.record;
    record.variables = request.variables;
    ctx.writer.append_event(
        key,
        Intent::Job(JobIntent::Completed),
        RecordValue::Job(record),
    )?;
    transition_to(ctx, element_key, LifecycleState::Completing)?;
    Ok(())
}

/// Records a worker failure. Without retries left the job raises an incident.
pub fn fail(ctx: &mut ProcessingContext<'_>) -> HandlerResult {
    let key = ctx.record.key;
    let request = job_value(ctx)?;
    let job = find_job(ctx, key, "fail")?;
    expect_state(&job, JobState::Activated, "fail")?;
    expect_scopes_active(ctx, &job, "fail")?;

    let record = ctx
        .state
        .jobs
        .fail(key, request.retries, &request.error_message)
        .map(|job| job.record.clone())
        .ok_or_else(|| ProcessingError::inconsistent(format!("failed job {key} vanished")))?;
    ctx.writer.append_event(
        key,
        Intent::Job(JobIntent::Failed),
        RecordValue::Job(record.clone()),
    )?;

    if record.retries > 0 {
        ctx.job_available(&record.job_type);
        return Ok(());
    }

    let error_message = if record.error_message.is_empty() {
        "No more retries left.".to_string()
    } else {
        record.error_message.clone()
    };
    ctx.writer.append_command(
        NO_KEY,
        Intent::Incident(IncidentIntent::Create),
        RecordValue::Incident(IncidentRecord {
            error_type: ErrorType::JobNoRetries,
            error_message,
            bpmn_process_id: record.bpmn_process_id,
            process_definition_key: record.process_definition_key,
            process_instance_key: record.process_instance_key,
            element_id: record.element_id,
            element_instance_key: record.element_instance_key,
            job_key: Some(key),
            variable_scope_key: record.element_instance_key,
            failed_state: None,
        }),
    )
}

/// Takes an expired activation back from its worker.
pub fn time_out(ctx: &mut ProcessingContext<'_>) -> HandlerResult {
    let key = ctx.record.key;
    let job = find_job(ctx, key, "time out")?;
    expect_state(&job, JobState::Activated, "time out")?;
    let now = ctx.now();
    match job.record.deadline {
        Some(deadline) if deadline <= now => {}
        deadline => {
            return Err(ProcessingError::rejected(
                RejectionType::InvalidState,
                format!(
                    "Expected to time out job with key '{key}', but its deadline {deadline:?} is after {now}"
                ),
            ))
        }
    }
    ctx.state.jobs.make_activatable(key);
    ctx.job_available(&job.record.job_type);
    ctx.writer.append_event(
        key,
        Intent::Job(JobIntent::TimedOut),
        RecordValue::Job(job.record),
    )
}

/// Drops a job whose element is being terminated.
pub fn cancel(ctx: &mut ProcessingContext<'_>) -> HandlerResult {
    let key = ctx.record.key;
    let job = find_job(ctx, key, "cancel")?;
    ctx.state.jobs.remove(key);
    ctx.writer.append_event(
        key,
        Intent::Job(JobIntent::Canceled),
        RecordValue::Job(job.record),
    )
}

pub fn update_retries(ctx: &mut ProcessingContext<'_>) -> HandlerResult {
    let key = ctx.record.key;
    let request = job_value(ctx)?;
    if request.retries < 1 {
        return Err(ProcessingError::rejected(
            RejectionType::InvalidArgument,
            format!(
                "Expected to update retries of job with key '{key}' to a positive number, but it was {}",
                request.retries
            ),
        ));
    }
    find_job(ctx, key, "update retries of")?;
    let record = ctx
        .state
        .jobs
        .set_retries(key, request.retries)
        .map(|job| job.record.clone())
        .ok_or_else(|| ProcessingError::inconsistent(format!("job {key} vanished")))?;
    ctx.writer.append_event(
        key,
        Intent::Job(JobIntent::RetriesUpdated),
        RecordValue::Job(record),
    )
}
