mod common;

use brook_core::record::{JobBatchRecord, RejectionType, UpdateSemantics, VariableMap};
use brook_core::state::ProcessInstanceStatus;
use brook_core::{
    ClientError, EngineConfig, Key, ManualClock, MemoryLog, OrderedLog, Partition, PartitionClient,
    PartitionHealth, ProcessModel,
};
use common::*;
use serde_json::json;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

fn test_config() -> EngineConfig {
    EngineConfig {
        due_date_check_interval_ms: 10,
        ..EngineConfig::default()
    }
}

async fn start(log: Arc<MemoryLog>, clock: Arc<ManualClock>) -> Partition {
    Partition::start(test_config(), log, clock)
        .await
        .expect("partition starts")
}

/// Polls `check` until it yields a value, for up to five seconds.
async fn eventually<T, F, Fut>(mut check: F) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Some(value) = check().await {
                return value;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached within 5s")
}

async fn activate_one(client: &PartitionClient, job_type: &str, timeout_ms: i64) -> JobBatchRecord {
    eventually(move || async move {
        let batch = client
            .activate_jobs(job_type, "partition-test", timeout_ms, 1)
            .await
            .expect("activation request");
        (!batch.job_keys.is_empty()).then_some(batch)
    })
    .await
}

async fn wait_for_status(client: &PartitionClient, key: Key, status: ProcessInstanceStatus) {
    eventually(move || async move {
        let entry = client.process_instance(key).await.expect("query");
        (entry.map(|e| e.status) == Some(status)).then_some(())
    })
    .await
}

fn vars(value: serde_json::Value) -> VariableMap {
    variables_of(value)
}

#[tokio::test]
async fn test_partition_round_trip_and_restart() {
    let clock = Arc::new(ManualClock::new(START_MILLIS));
    let log = Arc::new(MemoryLog::new(1, clock.clone()));
    let partition = start(log.clone(), clock.clone()).await;
    assert_eq!(partition.health(), PartitionHealth::Healthy);
    let client = partition.client();

    let model = ProcessModel::from_yaml(SIMPLE_TASK).unwrap();
    let deployed = client.deploy(model.clone()).await.unwrap();
    assert_eq!(deployed.version, 1);
    assert!(client.deploy(model).await.unwrap().duplicate);

    let pi = client
        .create_instance("simple", None, vars(json!({ "order": 1 })))
        .await
        .unwrap();
    let batch = activate_one(&client, "work", 60_000).await;
    assert_eq!(batch.jobs[0].variables.get("order"), Some(&json!(1)));
    client
        .complete_job(batch.job_keys[0], vars(json!({ "shipped": true })))
        .await
        .unwrap();
    wait_for_status(&client, pi, ProcessInstanceStatus::Completed).await;

    let digest = client.state_digest().await.unwrap();
    assert_eq!(digest.len(), 64);
    partition.shutdown().await;

    let restarted = start(log.clone(), clock).await;
    let client = restarted.client();
    assert_eq!(client.state_digest().await.unwrap(), digest);
    assert_eq!(
        client.process_instance(pi).await.unwrap().map(|e| e.status),
        Some(ProcessInstanceStatus::Completed)
    );
    restarted.shutdown().await;
}

#[tokio::test]
async fn test_rejections_reach_the_client() {
    let clock = Arc::new(ManualClock::new(START_MILLIS));
    let log = Arc::new(MemoryLog::new(1, clock.clone()));
    let partition = start(log, clock).await;
    let client = partition.client();

    let missing = client
        .create_instance("nope", None, VariableMap::new())
        .await
        .unwrap_err();
    assert!(matches!(
        missing,
        ClientError::Rejected(ref r) if r.rejection_type == RejectionType::NotFound
    ));

    let invalid = client.activate_jobs("work", "w", 0, 1).await.unwrap_err();
    assert!(matches!(
        invalid,
        ClientError::Rejected(ref r) if r.rejection_type == RejectionType::InvalidArgument
    ));

    let unknown_scope = client
        .set_variables(123, vars(json!({ "a": 1 })), UpdateSemantics::Local)
        .await
        .unwrap_err();
    assert!(matches!(unknown_scope, ClientError::Rejected(_)));
    assert_eq!(partition.health(), PartitionHealth::Healthy);
    partition.shutdown().await;
}

#[tokio::test]
async fn test_due_timer_fires_from_checker() {
    let clock = Arc::new(ManualClock::new(START_MILLIS));
    let log = Arc::new(MemoryLog::new(1, clock.clone()));
    let partition = start(log, clock.clone()).await;
    let client = partition.client();

    client
        .deploy(ProcessModel::from_yaml(TIMER_CATCH).unwrap())
        .await
        .unwrap();
    let pi = client
        .create_instance("delayed", None, VariableMap::new())
        .await
        .unwrap();

    let scheduler = partition.scheduler().clone();
    eventually(|| {
        let scheduler = scheduler.clone();
        async move { (scheduler.len() == 1).then_some(()) }
    })
    .await;
    assert_eq!(
        client.process_instance(pi).await.unwrap().map(|e| e.status),
        Some(ProcessInstanceStatus::Active)
    );

    clock.advance(1_000);
    wait_for_status(&client, pi, ProcessInstanceStatus::Completed).await;
    partition.shutdown().await;
}

#[tokio::test]
async fn test_expired_job_is_handed_out_again() {
    let clock = Arc::new(ManualClock::new(START_MILLIS));
    let log = Arc::new(MemoryLog::new(1, clock.clone()));
    let partition = start(log.clone(), clock.clone()).await;
    let client = partition.client();

    client
        .deploy(ProcessModel::from_yaml(SIMPLE_TASK).unwrap())
        .await
        .unwrap();
    client
        .create_instance("simple", None, VariableMap::new())
        .await
        .unwrap();
    let first = activate_one(&client, "work", 500).await;

    clock.advance(500);
    let second = activate_one(&client, "work", 60_000).await;
    assert_eq!(second.job_keys, first.job_keys);
    assert!(log
        .records()
        .iter()
        .any(|r| r.intent == brook_core::Intent::Job(brook_core::JobIntent::TimedOut)));
    assert!(log.last_position().await.unwrap() > 0);
    partition.shutdown().await;
}

#[tokio::test]
async fn test_incident_listing_through_client() {
    let clock = Arc::new(ManualClock::new(START_MILLIS));
    let log = Arc::new(MemoryLog::new(1, clock.clone()));
    let partition = start(log, clock).await;
    let client = partition.client();

    client
        .deploy(ProcessModel::from_yaml(INPUT_MAPPING).unwrap())
        .await
        .unwrap();
    let pi = client
        .create_instance("mapped", None, VariableMap::new())
        .await
        .unwrap();

    let client_ref = &client;
    let incidents = eventually(move || async move {
        let incidents = client_ref.list_incidents(pi).await.expect("query");
        (!incidents.is_empty()).then_some(incidents)
    })
    .await;
    assert_eq!(incidents.len(), 1);

    client
        .set_variables(pi, vars(json!({ "order": { "total": 5 } })), UpdateSemantics::Propagate)
        .await
        .unwrap();
    client.resolve_incident(incidents[0].key).await.unwrap();
    let batch = activate_one(&client, "charge", 60_000).await;
    assert_eq!(batch.jobs[0].variables.get("amount"), Some(&json!(5)));
    client
        .complete_job(batch.job_keys[0], VariableMap::new())
        .await
        .unwrap();
    wait_for_status(&client, pi, ProcessInstanceStatus::Completed).await;
    assert!(client.list_incidents(pi).await.unwrap().is_empty());
    partition.shutdown().await;
}
