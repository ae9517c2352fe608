//! Partition runtime: one processing task and one due-date checker per partition.
//!
//! The processing task owns the [`StreamProcessor`] and its state. Everything
//! else talks to it through the log (commands) or the query channel (reads).
//! Clients append commands tagged with a request id and wait for the record
//! that answers them.

use crate::config::{BackoffConfig, EngineConfig};
use crate::error::EngineError;
use crate::log::{Clock, LogError, OrderedLog};
use crate::model::ProcessModel;
use crate::processor::{Processed, StreamProcessor};
use crate::record::{
    DeploymentRecord, JobBatchRecord, JobRecord, ProcessInstanceCreationRecord, Record, RecordDraft,
    RecordValue, Rejection, UpdateSemantics, VariableDocumentRecord, VariableMap, NO_KEY,
};
use crate::scheduler::DueDateScheduler;
use crate::state::{EngineState, Incident, ProcessInstanceEntry};
use crate::types::*;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PartitionHealth {
    Recovering,
    Healthy,
    Unhealthy(String),
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("command rejected ({:?}): {}", .0.rejection_type, .0.reason)]
    Rejected(Rejection),

    #[error(transparent)]
    Log(#[from] LogError),

    #[error("partition is shut down")]
    Closed,

    #[error("no response was written for request {0}")]
    NoResponse(u64),

    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),

    #[error("partition unhealthy: {0}")]
    Unhealthy(String),

    #[error(transparent)]
    Engine(EngineError),
}

/// Read-only questions answered by the processing task between records.
#[derive(Debug)]
pub enum Query {
    Incidents {
        process_instance_key: Key,
        reply: oneshot::Sender<Vec<Incident>>,
    },
    ProcessInstance {
        key: Key,
        reply: oneshot::Sender<Option<ProcessInstanceEntry>>,
    },
    Digest {
        reply: oneshot::Sender<Result<String, EngineError>>,
    },
}

impl Query {
    fn answer(self, state: &EngineState) {
        // A dropped receiver means the client stopped waiting.
        match self {
            Query::Incidents {
                process_instance_key,
                reply,
            } => {
                let _ = reply.send(state.incidents.list_for_process(process_instance_key));
            }
            Query::ProcessInstance { key, reply } => {
                let _ = reply.send(state.elements.process_instance(key).cloned());
            }
            Query::Digest { reply } => {
                let _ = reply.send(state.digest());
            }
        }
    }
}

type Responder = oneshot::Sender<Result<Record, ClientError>>;

/// Clients waiting for the answer to a command, by request id.
#[derive(Debug, Default)]
pub struct ResponseRegistry {
    pending: Mutex<HashMap<u64, Responder>>,
}

impl ResponseRegistry {
    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u64, Responder>> {
        self.pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn register(&self, request_id: u64) -> oneshot::Receiver<Result<Record, ClientError>> {
        let (tx, rx) = oneshot::channel();
        self.lock().insert(request_id, tx);
        rx
    }

    pub fn forget(&self, request_id: u64) {
        self.lock().remove(&request_id);
    }

    pub fn complete(&self, request_id: u64, result: Result<Record, ClientError>) {
        if let Some(tx) = self.lock().remove(&request_id) {
            let _ = tx.send(result);
        }
    }

    pub fn fail_all(&self, reason: &str) {
        for (_, tx) in self.lock().drain() {
            let _ = tx.send(Err(ClientError::Unhealthy(reason.to_string())));
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Answers the request carried by a processed command, if any.
    fn route(&self, processed: &Processed) {
        let record = &processed.record;
        if record.record_type != RecordType::Command {
            return;
        }
        let Some(request_id) = record.request_id else {
            return;
        };
        let response = processed
            .written
            .iter()
            .find(|r| r.request_id == Some(request_id))
            .cloned();
        let result = match response {
            Some(Record {
                rejection: Some(rejection),
                ..
            }) => Err(ClientError::Rejected(rejection)),
            Some(response) => Ok(response),
            None => Err(ClientError::NoResponse(request_id)),
        };
        self.complete(request_id, result);
    }
}

/// Exponential delay for retriable errors. Unbounded in attempts, capped in delay.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Option<Duration>,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            initial: Duration::from_millis(config.initial_ms),
            max: Duration::from_millis(config.max_ms),
            current: None,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let next = match self.current {
            None => self.initial,
            Some(current) => (current * 2).min(self.max),
        };
        self.current = Some(next);
        next
    }

    pub fn reset(&mut self) {
        self.current = None;
    }
}

// ── Client ──

#[derive(Clone)]
pub struct PartitionClient {
    log: Arc<dyn OrderedLog>,
    responses: Arc<ResponseRegistry>,
    queries: mpsc::Sender<Query>,
    health: watch::Receiver<PartitionHealth>,
    next_request_id: Arc<AtomicU64>,
}

impl PartitionClient {
    pub fn health(&self) -> PartitionHealth {
        self.health.borrow().clone()
    }

    fn ensure_healthy(&self) -> Result<(), ClientError> {
        match &*self.health.borrow() {
            PartitionHealth::Unhealthy(reason) => Err(ClientError::Unhealthy(reason.clone())),
            _ => Ok(()),
        }
    }

    /// Appends a command and waits for the record that answers it.
    pub async fn request(&self, command: RecordDraft) -> Result<Record, ClientError> {
        self.ensure_healthy()?;
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let response = self.responses.register(request_id);
        if let Err(e) = self.log.append(vec![command.with_request_id(request_id)]).await {
            self.responses.forget(request_id);
            return Err(e.into());
        }
        response.await.map_err(|_| ClientError::Closed)?
    }

    async fn query<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Query) -> Result<T, ClientError> {
        let (tx, rx) = oneshot::channel();
        self.queries
            .send(build(tx))
            .await
            .map_err(|_| ClientError::Closed)?;
        rx.await.map_err(|_| ClientError::Closed)
    }

    pub async fn deploy(&self, model: ProcessModel) -> Result<DeploymentRecord, ClientError> {
        let record = self
            .request(RecordDraft::command(
                NO_KEY,
                Intent::Deployment(DeploymentIntent::Create),
                RecordValue::Deployment(DeploymentRecord::new(model)),
            ))
            .await?;
        record
            .value
            .as_deployment()
            .cloned()
            .ok_or_else(|| unexpected(&record))
    }

    /// Starts an instance of the latest version, or of `version`. Returns the instance key.
    pub async fn create_instance(
        &self,
        bpmn_process_id: &str,
        version: Option<u32>,
        variables: VariableMap,
    ) -> Result<Key, ClientError> {
        let record = self
            .request(RecordDraft::command(
                NO_KEY,
                Intent::ProcessInstanceCreation(ProcessInstanceCreationIntent::Create),
                RecordValue::ProcessInstanceCreation(ProcessInstanceCreationRecord {
                    bpmn_process_id: bpmn_process_id.to_string(),
                    version,
                    variables,
                    ..Default::default()
                }),
            ))
            .await?;
        Ok(record.key)
    }

    pub async fn cancel_instance(&self, process_instance_key: Key) -> Result<(), ClientError> {
        self.element_command(process_instance_key, ProcessInstanceIntent::Cancel)
            .await
    }

    pub async fn terminate_element(&self, element_instance_key: Key) -> Result<(), ClientError> {
        self.element_command(element_instance_key, ProcessInstanceIntent::TerminateElement)
            .await
    }

    async fn element_command(&self, key: Key, intent: ProcessInstanceIntent) -> Result<(), ClientError> {
        self.request(RecordDraft::command(
            key,
            Intent::ProcessInstance(intent),
            RecordValue::ProcessInstance(Default::default()),
        ))
        .await?;
        Ok(())
    }

    pub async fn activate_jobs(
        &self,
        job_type: &str,
        worker: &str,
        timeout_ms: i64,
        max_jobs_to_activate: u32,
    ) -> Result<JobBatchRecord, ClientError> {
        let record = self
            .request(RecordDraft::command(
                NO_KEY,
                Intent::JobBatch(JobBatchIntent::Activate),
                RecordValue::JobBatch(JobBatchRecord {
                    job_type: job_type.to_string(),
                    worker: worker.to_string(),
                    timeout_ms,
                    max_jobs_to_activate,
                    ..Default::default()
                }),
            ))
            .await?;
        record
            .value
            .as_job_batch()
            .cloned()
            .ok_or_else(|| unexpected(&record))
    }

    pub async fn complete_job(&self, job_key: Key, variables: VariableMap) -> Result<(), ClientError> {
        self.job_command(
            job_key,
            JobIntent::Complete,
            JobRecord {
                variables,
                ..Default::default()
            },
        )
        .await
    }

    pub async fn fail_job(&self, job_key: Key, retries: u32, error_message: &str) -> Result<(), ClientError> {
        self.job_command(
            job_key,
            JobIntent::Fail,
            JobRecord {
                retries,
                error_message: error_message.to_string(),
                ..Default::default()
            },
        )
        .await
    }

    pub async fn update_retries(&self, job_key: Key, retries: u32) -> Result<(), ClientError> {
        self.job_command(
            job_key,
            JobIntent::UpdateRetries,
            JobRecord {
                retries,
                ..Default::default()
            },
        )
        .await
    }

    async fn job_command(&self, key: Key, intent: JobIntent, value: JobRecord) -> Result<(), ClientError> {
        self.request(RecordDraft::command(key, Intent::Job(intent), RecordValue::Job(value)))
            .await?;
        Ok(())
    }

    pub async fn resolve_incident(&self, incident_key: Key) -> Result<(), ClientError> {
        self.request(RecordDraft::command(
            incident_key,
            Intent::Incident(IncidentIntent::Resolve),
            RecordValue::Incident(Default::default()),
        ))
        .await?;
        Ok(())
    }

    pub async fn set_variables(
        &self,
        scope_key: Key,
        variables: VariableMap,
        update_semantics: UpdateSemantics,
    ) -> Result<(), ClientError> {
        self.request(RecordDraft::command(
            NO_KEY,
            Intent::VariableDocument(VariableDocumentIntent::Update),
            RecordValue::VariableDocument(VariableDocumentRecord {
                scope_key,
                update_semantics,
                variables,
            }),
        ))
        .await?;
        Ok(())
    }

    /// Active incidents of a process instance.
    pub async fn list_incidents(&self, process_instance_key: Key) -> Result<Vec<Incident>, ClientError> {
        self.query(|reply| Query::Incidents {
            process_instance_key,
            reply,
        })
        .await
    }

    pub async fn process_instance(&self, key: Key) -> Result<Option<ProcessInstanceEntry>, ClientError> {
        self.query(|reply| Query::ProcessInstance { key, reply }).await
    }

    pub async fn state_digest(&self) -> Result<String, ClientError> {
        self.query(|reply| Query::Digest { reply })
            .await?
            .map_err(ClientError::Engine)
    }
}

fn unexpected(record: &Record) -> ClientError {
    ClientError::UnexpectedResponse(format!("{} {}", record.intent, record.key))
}

// ── Partition ──

pub struct Partition {
    partition_id: PartitionId,
    client: PartitionClient,
    scheduler: Arc<DueDateScheduler>,
    health: watch::Receiver<PartitionHealth>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Partition {
    /// Recovers the partition from `log` and starts its tasks.
    pub async fn start(
        config: EngineConfig,
        log: Arc<dyn OrderedLog>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, EngineError> {
        let partition_id = config.partition_id;
        let (health_tx, health_rx) = watch::channel(PartitionHealth::Recovering);

        tracing::info!(partition_id, "Partition: recovering from log");
        let mut processor = StreamProcessor::new(partition_id, config.limits);
        let report = match processor.recover(log.as_ref()).await {
            Ok(report) => report,
            Err(e) => {
                tracing::error!(partition_id, error = %e, "Partition: recovery failed");
                health_tx.send_replace(PartitionHealth::Unhealthy(e.to_string()));
                return Err(e);
            }
        };

        let scheduler = Arc::new(DueDateScheduler::new());
        scheduler.seed(processor.state());
        processor.add_listener(scheduler.clone());

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (query_tx, query_rx) = mpsc::channel(config.query_channel_capacity);
        let responses = Arc::new(ResponseRegistry::default());

        health_tx.send_replace(PartitionHealth::Healthy);
        tracing::info!(
            partition_id,
            replayed = report.replayed,
            next_position = report.next_position,
            scheduled = scheduler.len(),
            "Partition: healthy"
        );

        let processing = ProcessingTask {
            processor,
            log: log.clone(),
            responses: responses.clone(),
            queries: query_rx,
            health_tx,
            backoff: Backoff::new(config.backoff),
        };
        let checker = DueDateChecker {
            scheduler: scheduler.clone(),
            log: log.clone(),
            clock,
            interval: config.due_date_check_interval(),
        };
        let tasks = vec![
            tokio::spawn(processing.run(shutdown_rx.clone())),
            tokio::spawn(checker.run(shutdown_rx)),
        ];

        let client = PartitionClient {
            log,
            responses,
            queries: query_tx,
            health: health_rx.clone(),
            next_request_id: Arc::new(AtomicU64::new(initial_request_id())),
        };

        Ok(Self {
            partition_id,
            client,
            scheduler,
            health: health_rx,
            shutdown_tx,
            tasks,
        })
    }

    pub fn partition_id(&self) -> PartitionId {
        self.partition_id
    }

    pub fn client(&self) -> PartitionClient {
        self.client.clone()
    }

    pub fn health(&self) -> PartitionHealth {
        self.health.borrow().clone()
    }

    /// Waits for the next health change.
    pub async fn health_changed(&mut self) -> PartitionHealth {
        let _ = self.health.changed().await;
        self.health.borrow_and_update().clone()
    }

    pub fn scheduler(&self) -> &Arc<DueDateScheduler> {
        &self.scheduler
    }

    pub async fn shutdown(self) {
        tracing::info!(partition_id = self.partition_id, "Partition: shutting down");
        let _ = self.shutdown_tx.send(true);
        for task in self.tasks {
            let _ = task.await;
        }
        tracing::info!(partition_id = self.partition_id, "Partition: stopped");
    }
}

/// Request ids restart above anything a previous run could have issued.
fn initial_request_id() -> u64 {
    let millis = chrono::Utc::now().timestamp_millis().max(0) as u64;
    millis << 20
}

struct ProcessingTask {
    processor: StreamProcessor,
    log: Arc<dyn OrderedLog>,
    responses: Arc<ResponseRegistry>,
    queries: mpsc::Receiver<Query>,
    health_tx: watch::Sender<PartitionHealth>,
    backoff: Backoff,
}

impl ProcessingTask {
    async fn run(mut self, mut shutdown_rx: watch::Receiver<bool>) {
        tracing::info!("ProcessingTask started");

        loop {
            if *shutdown_rx.borrow() {
                break;
            }
            while let Ok(query) = self.queries.try_recv() {
                query.answer(self.processor.state());
            }

            match self.processor.process_next(self.log.as_ref()).await {
                Ok(Some(processed)) => {
                    self.backoff.reset();
                    self.responses.route(&processed);
                    continue;
                }
                Ok(None) => {}
                Err(e) if e.is_retriable() => {
                    let delay = self.backoff.next_delay();
                    tracing::warn!(
                        error = %e,
                        delay_ms = delay.as_millis() as u64,
                        position = self.processor.next_position(),
                        "ProcessingTask: retriable error, backing off"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown_rx.changed() => break,
                    }
                    continue;
                }
                Err(e) => {
                    tracing::error!(
                        error = %e,
                        position = self.processor.next_position(),
                        "ProcessingTask: fatal error, partition unhealthy"
                    );
                    let reason = e.to_string();
                    self.health_tx
                        .send_replace(PartitionHealth::Unhealthy(reason.clone()));
                    self.responses.fail_all(&reason);
                    self.serve_queries(shutdown_rx).await;
                    return;
                }
            }

            let next = self.processor.next_position();
            tokio::select! {
                biased;
                _ = shutdown_rx.changed() => break,
                Some(query) = self.queries.recv() => query.answer(self.processor.state()),
                _ = self.log.await_position(next) => {}
            }
        }

        tracing::info!("ProcessingTask stopped");
    }

    /// After a halt the state is frozen but stays readable.
    async fn serve_queries(&mut self, mut shutdown_rx: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                biased;
                _ = shutdown_rx.changed() => break,
                query = self.queries.recv() => match query {
                    Some(query) => query.answer(self.processor.state()),
                    None => break,
                },
            }
        }
        tracing::info!("ProcessingTask stopped after halt");
    }
}

struct DueDateChecker {
    scheduler: Arc<DueDateScheduler>,
    log: Arc<dyn OrderedLog>,
    clock: Arc<dyn Clock>,
    interval: Duration,
}

impl DueDateChecker {
    async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        tracing::info!("DueDateChecker started");

        loop {
            if *shutdown_rx.borrow() {
                break;
            }
            let now = self.clock.now_millis();
            if let Err(e) = self.scheduler.emit_due(self.log.as_ref(), now).await {
                tracing::warn!(error = %e, "DueDateChecker: failed to append due commands");
            }

            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                _ = shutdown_rx.changed() => break,
            }
        }

        tracing::info!("DueDateChecker stopped");
    }
}
