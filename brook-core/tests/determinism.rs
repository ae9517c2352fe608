mod common;

use brook_core::record::RecordValue;
use brook_core::{
    EngineError, Intent, JobIntent, ManualClock, MemoryLog, OrderedLog, Phase, Record,
    StreamProcessor, TimerIntent, VariableIntent,
};
use common::*;
use serde_json::json;
use std::sync::Arc;

/// Drives a mix of processes through deployment, jobs, incidents and timers.
async fn run_mixed_workload(h: &mut Harness) {
    h.deploy(SIMPLE_TASK).await;
    h.deploy(BOUNDARY_TIMER).await;
    h.deploy(MULTI_INSTANCE).await;
    h.deploy(PARALLEL).await;

    let simple = h.create_instance("simple", json!({ "customer": "acme" })).await;
    h.create_instance("guarded", json!({})).await;
    h.create_instance("fan-out", json!({ "items": [3, 4] })).await;
    h.create_instance("fork-join", json!({})).await;

    for (key, _) in h.activate_jobs("double", 10).await {
        h.complete_job(key, json!({ "doubled": 0 })).await;
    }
    let (job, _) = h.activate_jobs("work", 1).await.remove(0);
    h.fail_job(job, 1, "flaky").await;
    let (job, _) = h.activate_jobs("work", 1).await.remove(0);
    h.complete_job(job, json!({ "done": true })).await;

    h.clock.advance(60_000);
    let timer = h.events(Intent::Timer(TimerIntent::Created))[0].key;
    h.execute(trigger_command(timer)).await;

    for job_type in ["a", "b"] {
        let (job, _) = h.activate_jobs(job_type, 1).await.remove(0);
        h.complete_job(job, json!({ job_type: 1 })).await;
    }
    assert!(h.status(simple).is_some());
}

fn trigger_command(timer_key: brook_core::Key) -> brook_core::RecordDraft {
    brook_core::RecordDraft::command(
        timer_key,
        Intent::Timer(TimerIntent::Trigger),
        RecordValue::Timer(Default::default()),
    )
}

async fn copy_log(records: &[Record], mutate: impl Fn(&mut Record)) -> (Arc<ManualClock>, MemoryLog) {
    let clock = Arc::new(ManualClock::new(START_MILLIS));
    let log = MemoryLog::new(1, clock.clone());
    for record in records {
        let mut record = record.clone();
        mutate(&mut record);
        clock.set(record.timestamp);
        log.append(vec![draft_of(&record)]).await.unwrap();
    }
    (clock, log)
}

#[tokio::test]
async fn test_same_input_same_log_and_state() {
    let mut first = Harness::new();
    let mut second = Harness::new();
    run_mixed_workload(&mut first).await;
    run_mixed_workload(&mut second).await;

    assert_eq!(first.records(), second.records());
    assert_eq!(first.state().digest().unwrap(), second.state().digest().unwrap());
}

#[tokio::test]
async fn test_recovery_rebuilds_identical_state() {
    let mut h = Harness::new();
    run_mixed_workload(&mut h).await;
    let live_digest = h.state().digest().unwrap();
    let log_length = h.records().len();

    let mut recovered = StreamProcessor::new(1, Default::default());
    let report = recovered.recover(&h.log).await.unwrap();
    assert_eq!(report.replayed, log_length);
    assert_eq!(report.last_position, log_length as u64);
    assert_eq!(recovered.phase(), Phase::Processing);
    assert_eq!(recovered.state().digest().unwrap(), live_digest);
    assert_eq!(recovered.next_position(), h.processor.next_position());

    // The recovered processor carries on where the live one stopped.
    h.processor = recovered;
    let pi = h.create_instance("simple", json!({})).await;
    let (job, _) = h.activate_jobs("work", 1).await.remove(0);
    h.complete_job(job, json!({})).await;
    assert_eq!(
        h.status(pi),
        Some(brook_core::state::ProcessInstanceStatus::Completed)
    );
}

#[tokio::test]
async fn test_recovery_stops_at_unprocessed_command() {
    let mut h = Harness::new();
    h.deploy(SIMPLE_TASK).await;
    let processed = h.records().len();
    h.submit(Harness::creation_command("simple", json!({})))
        .await;

    let mut recovered = StreamProcessor::new(1, Default::default());
    let report = recovered.recover(&h.log).await.unwrap();
    assert_eq!(report.replayed, processed);
    assert_eq!(report.next_position, processed as u64 + 1);
    assert!(recovered.state().elements.is_empty());

    // Processing resumes with the pending command.
    h.processor = recovered;
    h.drain().await;
    assert_eq!(h.state().elements.len(), 2);
}

#[tokio::test]
async fn test_tampered_log_halts_replay() {
    let mut h = Harness::new();
    h.deploy(SIMPLE_TASK).await;
    h.create_instance("simple", json!({ "total": 10 })).await;
    let (job, _) = h.activate_jobs("work", 1).await.remove(0);
    h.complete_job(job, json!({})).await;
    let records = h.records();

    let (_, untouched) = copy_log(&records, |_| {}).await;
    let mut replica = StreamProcessor::new(1, Default::default());
    replica.recover(&untouched).await.unwrap();
    assert_eq!(replica.state().digest().unwrap(), h.state().digest().unwrap());

    let tampered_position = records
        .iter()
        .find(|r| r.intent == Intent::Variable(VariableIntent::Created))
        .map(|r| r.position)
        .unwrap();
    let source_position = records[tampered_position as usize - 1].source_position.unwrap();
    let (_, tampered) = copy_log(&records, |record| {
        if record.position == tampered_position {
            if let RecordValue::Variable(variable) = &mut record.value {
                variable.value = json!(11);
            }
        }
    })
    .await;

    let mut replica = StreamProcessor::new(1, Default::default());
    let err = replica.recover(&tampered).await.unwrap_err();
    match err {
        EngineError::ReplayDivergence { position, .. } => assert_eq!(position, source_position),
        other => panic!("expected a replay divergence, got {other}"),
    }
    assert_eq!(replica.phase(), Phase::Halted);
    assert!(matches!(
        replica.process_next(&tampered).await,
        Err(EngineError::Halted(_))
    ));
}

#[tokio::test]
async fn test_follow_ups_reference_their_source() {
    let mut h = Harness::new();
    h.deploy(SIMPLE_TASK).await;
    h.create_instance("simple", json!({})).await;
    let (job, _) = h.activate_jobs("work", 1).await.remove(0);
    h.complete_job(job, json!({})).await;

    let records = h.records();
    for (index, record) in records.iter().enumerate() {
        assert_eq!(record.position, index as u64 + 1);
        match record.source_position {
            Some(source) => assert!(source < record.position),
            None => assert!(record.is_command(), "{} has no source", record.intent),
        }
    }
    let completed = h.events(Intent::Job(JobIntent::Completed));
    assert_eq!(completed.len(), 1);
    assert!(completed[0].request_id.is_some());

    // A whole batch shares one timestamp.
    let last = records.last().unwrap();
    assert!(h
        .log
        .read_from(1, records.len())
        .await
        .unwrap()
        .iter()
        .filter(|r| r.source_position == last.source_position)
        .all(|r| r.timestamp == last.timestamp));
}
