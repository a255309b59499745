//! protocrash: a coverage-guided protocol fuzzer.
//!
//! A campaign runs N independent worker processes. Each worker owns its own
//! coverage map, corpus, scheduler, and mutation weights, and shares
//! discoveries with its peers through a filesystem queue with atomic
//! publish semantics. Crashes are classified, deduplicated by stack
//! fingerprint, minimized to a smallest reproducer, and persisted as
//! structured reports.

pub mod config;
pub mod corpus;
pub mod coverage;
pub mod crash;
pub mod dictionary;
pub mod driver;
pub mod executor;
pub mod minimizer;
pub mod mutation;
pub mod protocol;
pub mod scheduler;
pub mod stack_trace;
pub mod stats;
pub mod supervisor;
pub mod sync;

pub use config::FuzzConfig;
pub use corpus::{AddOutcome, CorpusEntry, CorpusError, CorpusStore};
pub use coverage::{CoverageCapture, CoverageError, CoverageMap, MAP_SIZE};
pub use crash::{CrashInfo, CrashRecord, CrashStore, CrashType, Exploitability};
pub use driver::{DriverError, FuzzDriver};
pub use executor::{CommandExecutor, ExecutionResult, ExecutorConfig, ExecutorError};
pub use minimizer::{MinimizeOutcome, Minimizer, Probe};
pub use mutation::{MutationEngine, Strategy, StrategyWeights};
pub use protocol::Protocol;
pub use scheduler::{QueueScheduler, SchedulerError};
pub use stats::{FuzzStats, WorkerStats};
pub use supervisor::{Supervisor, SupervisorError};
pub use sync::{SyncError, SyncedInput, Synchronizer};
