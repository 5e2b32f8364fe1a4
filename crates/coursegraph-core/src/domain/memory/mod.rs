//! Conversation memory and the fact-log sync path
//!
//! - **Events**: learning events and their idempotency keys
//! - **FactLog**: durable append-only WAL of events
//! - **Flush**: extraction before conversation compaction
//! - **SyncWorker**: drains the log into the graph behind a circuit breaker
//!
//! Only the sync worker moves WAL records between states.

mod circuit_breaker;
mod event;
mod flush;
mod retry;
mod wal;
mod worker;

pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStatus, CircuitStateKind, Permit,
};
pub use event::{LearningEvent, LearningEventType, anonymize_student_id};
pub use flush::{ConversationFlush, ConversationMessage, FlushResult, estimate_tokens};
pub use retry::{NextState, RetryPolicy, WriteOutcome};
pub use wal::{FactLog, WalRecord, WalState, WalStats};
pub use worker::{DrainReport, SyncWorker, SyncWaker, SyncWorkerHandle, WorkerCommand};
