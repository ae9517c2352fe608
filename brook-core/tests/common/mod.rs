//! Shared harness for the engine integration tests: a memory log, a manual
//! clock and a stream processor driven record by record.

#![allow(dead_code)]

use brook_core::record::{
    DeploymentRecord, JobBatchRecord, JobRecord, ProcessInstanceCreationRecord, VariableDocumentRecord,
    VariableMap, NO_KEY,
};
use brook_core::state::{EngineState, ProcessInstanceStatus};
use brook_core::{
    DeploymentIntent, Intent, JobBatchIntent, JobIntent, Key, ManualClock, MemoryLog, ProcessInstanceCreationIntent,
    OrderedLog, ProcessInstanceIntent, ProcessModel, ProcessingLimits, Record, RecordDraft, RecordType, RecordValue,
    StreamProcessor, VariableDocumentIntent,
};
use serde_json::Value;
use std::sync::Arc;

pub const START_MILLIS: i64 = 1_700_000_000_000;

pub struct Harness {
    pub clock: Arc<ManualClock>,
    pub log: MemoryLog,
    pub processor: StreamProcessor,
    next_request_id: u64,
}

impl Harness {
    pub fn new() -> Self {
        let clock = Arc::new(ManualClock::new(START_MILLIS));
        let log = MemoryLog::new(1, clock.clone());
        Self {
            clock,
            log,
            processor: StreamProcessor::new(1, ProcessingLimits::default()),
            next_request_id: 1,
        }
    }

    pub fn state(&self) -> &EngineState {
        self.processor.state()
    }

    /// Appends a client command without processing it. Returns its request id.
    pub async fn submit(&mut self, command: RecordDraft) -> u64 {
        let request_id = self.next_request_id;
        self.next_request_id += 1;
        self.log
            .append(vec![command.with_request_id(request_id)])
            .await
            .expect("append failed");
        request_id
    }

    /// Processes records until the log is exhausted.
    pub async fn drain(&mut self) -> usize {
        let mut processed = 0;
        while self
            .processor
            .process_next(&self.log)
            .await
            .expect("processing failed")
            .is_some()
        {
            processed += 1;
        }
        processed
    }

    /// The record answering a request: an event or a rejection.
    pub fn response(&self, request_id: u64) -> Record {
        self.log
            .records()
            .into_iter()
            .find(|r| r.request_id == Some(request_id) && !r.is_command())
            .unwrap_or_else(|| panic!("no response for request {request_id}"))
    }

    pub async fn execute(&mut self, command: RecordDraft) -> Record {
        let request_id = self.submit(command).await;
        self.drain().await;
        self.response(request_id)
    }

    // ── Commands ──

    pub async fn deploy(&mut self, yaml: &str) -> DeploymentRecord {
        let model = ProcessModel::from_yaml(yaml).expect("model parses");
        let response = self
            .execute(RecordDraft::command(
                NO_KEY,
                Intent::Deployment(DeploymentIntent::Create),
                RecordValue::Deployment(DeploymentRecord::new(model)),
            ))
            .await;
        assert_eq!(response.record_type, RecordType::Event, "deployment rejected: {:?}", response.rejection);
        response.value.as_deployment().cloned().expect("deployment value")
    }

    pub fn creation_command(bpmn_process_id: &str, variables: Value) -> RecordDraft {
        RecordDraft::command(
            NO_KEY,
            Intent::ProcessInstanceCreation(ProcessInstanceCreationIntent::Create),
            RecordValue::ProcessInstanceCreation(ProcessInstanceCreationRecord {
                bpmn_process_id: bpmn_process_id.to_string(),
                variables: variables_of(variables),
                ..Default::default()
            }),
        )
    }

    pub async fn create_instance(&mut self, bpmn_process_id: &str, variables: Value) -> Key {
        let response = self
            .execute(Self::creation_command(bpmn_process_id, variables))
            .await;
        assert_eq!(response.record_type, RecordType::Event, "creation rejected: {:?}", response.rejection);
        response.key
    }

    pub async fn activate_jobs(&mut self, job_type: &str, max: u32) -> Vec<(Key, JobRecord)> {
        self.activate_jobs_with_timeout(job_type, max, 60_000).await
    }

    pub async fn activate_jobs_with_timeout(
        &mut self,
        job_type: &str,
        max: u32,
        timeout_ms: i64,
    ) -> Vec<(Key, JobRecord)> {
        let response = self
            .execute(RecordDraft::command(
                NO_KEY,
                Intent::JobBatch(JobBatchIntent::Activate),
                RecordValue::JobBatch(JobBatchRecord {
                    job_type: job_type.to_string(),
                    worker: "test-worker".to_string(),
                    timeout_ms,
                    max_jobs_to_activate: max,
                    ..Default::default()
                }),
            ))
            .await;
        let batch = response.value.as_job_batch().cloned().expect("job batch value");
        batch.job_keys.into_iter().zip(batch.jobs).collect()
    }

    pub fn job_command(key: Key, intent: JobIntent, value: JobRecord) -> RecordDraft {
        RecordDraft::command(key, Intent::Job(intent), RecordValue::Job(value))
    }

    pub async fn complete_job(&mut self, key: Key, variables: Value) -> Record {
        self.execute(Self::job_command(
            key,
            JobIntent::Complete,
            JobRecord {
                variables: variables_of(variables),
                ..Default::default()
            },
        ))
        .await
    }

    pub async fn fail_job(&mut self, key: Key, retries: u32, error_message: &str) -> Record {
        self.execute(Self::job_command(
            key,
            JobIntent::Fail,
            JobRecord {
                retries,
                error_message: error_message.to_string(),
                ..Default::default()
            },
        ))
        .await
    }

    pub async fn set_variables(&mut self, scope_key: Key, variables: Value) -> Record {
        self.execute(RecordDraft::command(
            NO_KEY,
            Intent::VariableDocument(VariableDocumentIntent::Update),
            RecordValue::VariableDocument(VariableDocumentRecord {
                scope_key,
                variables: variables_of(variables),
                ..Default::default()
            }),
        ))
        .await
    }

    pub async fn cancel_instance(&mut self, key: Key) -> Record {
        self.execute(RecordDraft::command(
            key,
            Intent::ProcessInstance(ProcessInstanceIntent::Cancel),
            RecordValue::ProcessInstance(Default::default()),
        ))
        .await
    }

    // ── Log inspection ──

    pub fn records(&self) -> Vec<Record> {
        self.log.records()
    }

    pub fn events(&self, intent: Intent) -> Vec<Record> {
        self.log
            .records()
            .into_iter()
            .filter(|r| r.is_event() && r.intent == intent)
            .collect()
    }

    /// Lifecycle intents written for an element id, in log order.
    pub fn lifecycle_of(&self, element_id: &str) -> Vec<ProcessInstanceIntent> {
        self.lifecycle_matching(|_, value_id| value_id == element_id)
    }

    /// Like [`lifecycle_of`](Self::lifecycle_of), restricted to one process instance.
    pub fn lifecycle_in(&self, process_instance_key: Key, element_id: &str) -> Vec<ProcessInstanceIntent> {
        self.lifecycle_matching(|value_pi, value_id| value_id == element_id && value_pi == process_instance_key)
    }

    fn lifecycle_matching(&self, matches: impl Fn(Key, &str) -> bool) -> Vec<ProcessInstanceIntent> {
        self.log
            .records()
            .into_iter()
            .filter(|r| r.is_event())
            .filter_map(|r| match (r.intent, r.value.as_process_instance()) {
                (Intent::ProcessInstance(intent), Some(value))
                    if intent.lifecycle_state().is_some()
                        && matches(value.process_instance_key, &value.element_id) =>
                {
                    Some(intent)
                }
                _ => None,
            })
            .collect()
    }

    pub fn status(&self, process_instance_key: Key) -> Option<ProcessInstanceStatus> {
        self.state()
            .elements
            .process_instance(process_instance_key)
            .map(|entry| entry.status)
    }

    /// Key of the live element instance with `element_id`.
    pub fn element_key(&self, element_id: &str) -> Option<Key> {
        self.state()
            .elements
            .instances()
            .find(|i| i.element_id == element_id)
            .map(|i| i.key)
    }

    /// Every flow scope exists and counts at least its live children.
    pub fn assert_scope_tree(&self) {
        let elements = &self.state().elements;
        for instance in elements.instances() {
            let Some(parent_key) = instance.flow_scope_key else {
                continue;
            };
            let parent = elements
                .get(parent_key)
                .unwrap_or_else(|| panic!("instance {} has a dangling flow scope {parent_key}", instance.key));
            let children = elements.children(parent_key).len() as u32;
            assert!(
                parent.active_children >= children,
                "scope {parent_key} counts {} active children but has {children}",
                parent.active_children
            );
        }
    }
}

pub fn variables_of(value: Value) -> VariableMap {
    serde_json::from_value(value).expect("variables must be a JSON object")
}

/// A record turned back into the draft that produced it.
pub fn draft_of(record: &Record) -> RecordDraft {
    RecordDraft {
        key: record.key,
        record_type: record.record_type,
        intent: record.intent,
        source_position: record.source_position,
        rejection: record.rejection.clone(),
        request_id: record.request_id,
        value: record.value.clone(),
    }
}

// ── Models ──

pub const SIMPLE_TASK: &str = r#"
id: simple
elements:
  - id: start
    kind: StartEvent
  - id: task
    kind: ServiceTask
    job_type: work
    retries: 2
  - id: end
    kind: EndEvent
flows:
  - { id: f1, from: start, to: task }
  - { id: f2, from: task, to: end }
"#;

pub const BOUNDARY_TIMER: &str = r#"
id: guarded
elements:
  - id: start
    kind: StartEvent
  - id: task
    kind: ServiceTask
    job_type: slow
  - id: deadline
    kind: BoundaryEvent
    attached_to: task
    timer: PT1M
  - id: done
    kind: EndEvent
  - id: expired
    kind: EndEvent
flows:
  - { id: f1, from: start, to: task }
  - { id: f2, from: task, to: done }
  - { id: f3, from: deadline, to: expired }
"#;

pub const SUB_PROCESS: &str = r#"
id: nested
elements:
  - id: start
    kind: StartEvent
  - id: inner
    kind: SubProcess
    outputs:
      - { source: innerResult, target: result }
  - id: inner_start
    kind: StartEvent
    scope: inner
  - id: inner_task
    kind: ServiceTask
    scope: inner
    job_type: inner-work
  - id: inner_end
    kind: EndEvent
    scope: inner
  - id: end
    kind: EndEvent
flows:
  - { id: f1, from: start, to: inner }
  - { id: f2, from: inner, to: end }
  - { id: f3, from: inner_start, to: inner_task }
  - { id: f4, from: inner_task, to: inner_end }
"#;

pub const PARALLEL: &str = r#"
id: fork-join
elements:
  - id: start
    kind: StartEvent
  - id: fork
    kind: ParallelGateway
  - id: a
    kind: ServiceTask
    job_type: a
  - id: b
    kind: ServiceTask
    job_type: b
  - id: join
    kind: ParallelGateway
  - id: end
    kind: EndEvent
flows:
  - { id: f1, from: start, to: fork }
  - { id: f2, from: fork, to: a }
  - { id: f3, from: fork, to: b }
  - { id: f4, from: a, to: join }
  - { id: f5, from: b, to: join }
  - { id: f6, from: join, to: end }
"#;

pub const EXCLUSIVE: &str = r#"
id: routing
elements:
  - id: start
    kind: StartEvent
  - id: check
    kind: ExclusiveGateway
    default_flow: to_low
  - id: high
    kind: EndEvent
  - id: low
    kind: EndEvent
flows:
  - { id: f1, from: start, to: check }
  - id: to_high
    from: check
    to: high
    condition: { variable: amount, op: ">", value: 100 }
  - { id: to_low, from: check, to: low }
"#;

pub const INPUT_MAPPING: &str = r#"
id: mapped
elements:
  - id: start
    kind: StartEvent
  - id: charge
    kind: ServiceTask
    job_type: charge
    inputs:
      - { source: order.total, target: amount }
  - id: end
    kind: EndEvent
flows:
  - { id: f1, from: start, to: charge }
  - { id: f2, from: charge, to: end }
"#;

pub const MULTI_INSTANCE: &str = r#"
id: fan-out
elements:
  - id: start
    kind: StartEvent
  - id: double
    kind: ServiceTask
    job_type: double
    multi_instance:
      input_collection: items
      input_element: item
      output_collection: results
      output_element: doubled
  - id: end
    kind: EndEvent
flows:
  - { id: f1, from: start, to: double }
  - { id: f2, from: double, to: end }
"#;

pub const SEQUENTIAL_MULTI_INSTANCE: &str = r#"
id: one-by-one
elements:
  - id: start
    kind: StartEvent
  - id: step
    kind: ServiceTask
    job_type: step
    multi_instance:
      sequential: true
      input_collection: items
      input_element: item
  - id: end
    kind: EndEvent
flows:
  - { id: f1, from: start, to: step }
  - { id: f2, from: step, to: end }
"#;

pub const TIMER_CATCH: &str = r#"
id: delayed
elements:
  - id: start
    kind: StartEvent
  - id: wait
    kind: TimerCatchEvent
    timer: PT1S
  - id: end
    kind: EndEvent
flows:
  - { id: f1, from: start, to: wait }
  - { id: f2, from: wait, to: end }
"#;
