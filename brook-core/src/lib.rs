//! brook: a deterministic, log-driven BPMN workflow engine.
//!
//! Every change to a partition is a record on its ordered log. The
//! [`StreamProcessor`] applies records one at a time in log order; replaying
//! the log rebuilds exactly the same state.

pub mod bpmn;
pub mod config;
pub mod error;
pub mod log;
pub mod mapping;
pub mod model;
pub mod partition;
pub mod processor;
pub mod record;
pub mod scheduler;
pub mod state;
pub mod types;
pub mod writer;

pub use config::{BackoffConfig, ConfigError, EngineConfig};
pub use error::{EngineError, Failure, HandlerResult, ProcessingError};
pub use log::{Clock, FileLog, LogError, ManualClock, MemoryLog, OrderedLog, SystemClock};
pub use model::{ModelError, ProcessDefinition, ProcessModel};
pub use partition::{ClientError, Partition, PartitionClient, PartitionHealth};
pub use processor::{CommitListener, Phase, ProcessingResult, StreamProcessor};
pub use record::{Record, RecordDraft, RecordValue, Rejection, RejectionType};
pub use scheduler::DueDateScheduler;
pub use state::EngineState;
pub use types::*;
pub use writer::ProcessingLimits;
