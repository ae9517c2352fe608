use super::context::ProcessingContext;
use super::{deployment, incident, instance, job, timer, variable};
use crate::bpmn;
use crate::error::HandlerResult;
use crate::types::*;
use std::collections::HashMap;

pub type Processor = fn(&mut ProcessingContext<'_>) -> HandlerResult;

/// Dispatch table from (record type, intent) to processor.
///
/// Every record that can appear on the log needs an entry, including pure audit
/// events, which map to a no-op. A record without an entry halts the partition.
pub struct ProcessorRegistry {
    processors: HashMap<(RecordType, Intent), Processor>,
}

fn noop(_ctx: &mut ProcessingContext<'_>) -> HandlerResult {
    Ok(())
}

impl ProcessorRegistry {
    pub fn empty() -> Self {
        Self {
            processors: HashMap::new(),
        }
    }

    pub fn register(&mut self, record_type: RecordType, intent: Intent, processor: Processor) {
        self.processors.insert((record_type, intent), processor);
    }

    pub fn get(&self, record_type: RecordType, intent: Intent) -> Option<Processor> {
        self.processors.get(&(record_type, intent)).copied()
    }

    pub fn len(&self) -> usize {
        self.processors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processors.is_empty()
    }

    pub fn standard() -> Self {
        use RecordType::{Command, Event};

        let mut r = Self::empty();

        // ── Deployment ──
        r.register(Command, Intent::Deployment(DeploymentIntent::Create), deployment::create);
        r.register(Event, Intent::Deployment(DeploymentIntent::Created), noop);

        // ── Process instances ──
        r.register(
            Command,
            Intent::ProcessInstanceCreation(ProcessInstanceCreationIntent::Create),
            instance::create,
        );
        r.register(
            Event,
            Intent::ProcessInstanceCreation(ProcessInstanceCreationIntent::Created),
            noop,
        );
        r.register(
            Command,
            Intent::ProcessInstance(ProcessInstanceIntent::Cancel),
            instance::cancel,
        );
        r.register(
            Command,
            Intent::ProcessInstance(ProcessInstanceIntent::TerminateElement),
            instance::terminate_element,
        );
        r.register(
            Event,
            Intent::ProcessInstance(ProcessInstanceIntent::SequenceFlowTaken),
            bpmn::process_sequence_flow_taken,
        );
        for intent in [
            ProcessInstanceIntent::ElementActivating,
            ProcessInstanceIntent::ElementActivated,
            ProcessInstanceIntent::ElementCompleting,
            ProcessInstanceIntent::ElementCompleted,
            ProcessInstanceIntent::ElementTerminating,
            ProcessInstanceIntent::ElementTerminated,
        ] {
            r.register(Event, Intent::ProcessInstance(intent), bpmn::process_lifecycle_event);
        }

        // ── Jobs ──
        r.register(Event, Intent::Job(JobIntent::Created), job::created);
        r.register(Command, Intent::Job(JobIntent::Activate), job::activate);
        r.register(Command, Intent::Job(JobIntent::Complete), job::complete);
        r.register(Command, Intent::Job(JobIntent::Fail), job::fail);
        r.register(Command, Intent::Job(JobIntent::TimeOut), job::time_out);
        r.register(Command, Intent::Job(JobIntent::Cancel), job::cancel);
        r.register(Command, Intent::Job(JobIntent::UpdateRetries), job::update_retries);
        for intent in [
            JobIntent::Activated,
            JobIntent::Completed,
            JobIntent::Failed,
            JobIntent::TimedOut,
            JobIntent::Canceled,
            JobIntent::RetriesUpdated,
        ] {
            r.register(Event, Intent::Job(intent), noop);
        }
        r.register(Command, Intent::JobBatch(JobBatchIntent::Activate), job::activate_batch);
        r.register(Event, Intent::JobBatch(JobBatchIntent::Activated), noop);

        // ── Incidents ──
        r.register(Command, Intent::Incident(IncidentIntent::Create), incident::create);
        r.register(Command, Intent::Incident(IncidentIntent::Resolve), incident::resolve);
        r.register(Event, Intent::Incident(IncidentIntent::Created), noop);
        r.register(Event, Intent::Incident(IncidentIntent::Resolved), noop);

        // ── Variables ──
        r.register(Event, Intent::Variable(VariableIntent::Created), noop);
        r.register(Event, Intent::Variable(VariableIntent::Updated), noop);
        r.register(
            Command,
            Intent::VariableDocument(VariableDocumentIntent::Update),
            variable::update,
        );
        r.register(
            Event,
            Intent::VariableDocument(VariableDocumentIntent::Updated),
            noop,
        );

        // ── Timers ──
        r.register(Command, Intent::Timer(TimerIntent::Trigger), timer::trigger);
        for intent in [TimerIntent::Created, TimerIntent::Triggered, TimerIntent::Canceled] {
            r.register(Event, Intent::Timer(intent), noop);
        }

        r
    }
}

impl Default for ProcessorRegistry {
    fn default() -> Self {
        Self::standard()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_registry_covers_commands_and_events() {
        let registry = ProcessorRegistry::standard();
        assert!(registry
            .get(RecordType::Command, Intent::Job(JobIntent::Complete))
            .is_some());
        assert!(registry
            .get(RecordType::Event, Intent::Variable(VariableIntent::Updated))
            .is_some());
        // events are never issued as commands
        assert!(registry
            .get(RecordType::Command, Intent::Job(JobIntent::Completed))
            .is_none());
        assert!(ProcessorRegistry::empty().is_empty());
    }
}
