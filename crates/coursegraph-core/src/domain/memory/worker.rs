//! WAL → graph sync worker
//!
//! A single consumer drains the fact log into the graph store. It is the
//! only component that moves WAL records between states. Graph writes are
//! upserts keyed by each record's idempotency key, so replaying a record
//! whose acknowledgement was lost leaves the graph unchanged.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::domain::knowledge::GraphStore;
use crate::error::{Error, Result};

use super::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitStateKind, Permit};
use super::retry::{RetryPolicy, WriteOutcome};
use super::wal::{FactLog, WalRecord, WalState};

/// Commands accepted by a running worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerCommand {
    /// New records were appended; drain now instead of at the next tick
    Wake,
    Shutdown,
}

/// What one drain pass did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrainReport {
    /// Records dispatched to the graph store
    pub dispatched: usize,
    pub committed: usize,
    /// Committed records whose effect was already in the graph
    pub already_applied: usize,
    pub failed: usize,
    pub dead_lettered: usize,
    /// Ready records left untouched because the circuit was open
    pub deferred: usize,
}

impl DrainReport {
    /// Whether the pass did anything at all
    pub fn is_idle(&self) -> bool {
        self.dispatched == 0 && self.dead_lettered == 0
    }
}

/// Drains the fact log into the graph store
pub struct SyncWorker {
    log: FactLog,
    store: Arc<dyn GraphStore>,
    breaker: CircuitBreaker,
    policy: RetryPolicy,
    batch_size: usize,
    poll_interval: Duration,
}

impl SyncWorker {
    pub fn new(log: FactLog, store: Arc<dyn GraphStore>, config: &SyncConfig) -> Self {
        Self {
            log,
            store,
            breaker: CircuitBreaker::new(CircuitBreakerConfig::new(
                config.failure_threshold,
                config.cooldown(),
            )),
            policy: RetryPolicy::from_config(config),
            batch_size: config.batch_size.max(1),
            poll_interval: config.poll_interval(),
        }
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn breaker_state(&self) -> CircuitStateKind {
        self.breaker.state()
    }

    /// Process at most one batch of ready records
    ///
    /// Errors from the graph store are absorbed into record state and the
    /// breaker; only fact-log errors are returned.
    pub async fn drain_once(&mut self) -> Result<DrainReport> {
        let ready = self.log.scan_ready(self.batch_size, Utc::now()).await?;
        let mut report = DrainReport::default();

        for (index, record) in ready.iter().enumerate() {
            if record.state == WalState::Failed && self.policy.is_exhausted(record.attempt_count) {
                self.dead_letter(record).await?;
                report.dead_lettered += 1;
                continue;
            }

            let permit = self.breaker.try_acquire();
            if permit == Permit::Rejected {
                report.deferred = ready.len() - index;
                debug!(deferred = report.deferred, "Circuit open; leaving records queued");
                break;
            }

            report.dispatched += 1;
            self.dispatch(record, permit, &mut report).await?;
        }

        if !report.is_idle() {
            info!(
                dispatched = report.dispatched,
                committed = report.committed,
                already_applied = report.already_applied,
                failed = report.failed,
                dead_lettered = report.dead_lettered,
                deferred = report.deferred,
                breaker = ?self.breaker.state(),
                "WAL drain pass complete"
            );
        }
        Ok(report)
    }

    async fn dispatch(&mut self, record: &WalRecord, permit: Permit, report: &mut DrainReport) -> Result<()> {
        let writing = self.log.transition(&record.record_id, WalState::Writing).await?;

        match self
            .store
            .apply_learning_event(&record.payload, &record.idempotency_key)
            .await
        {
            Ok(applied) => {
                self.breaker.record_success();
                self.log.transition(&record.record_id, WalState::Committed).await?;
                report.committed += 1;
                if !applied {
                    report.already_applied += 1;
                }
                debug!(
                    record_id = %record.record_id,
                    attempt = writing.attempt_count,
                    probe = permit == Permit::Probe,
                    applied,
                    "WAL record committed"
                );
            }
            Err(e) => {
                if e.is_store_failure() {
                    self.breaker.record_failure();
                } else {
                    // The store answered; only the record is bad
                    self.breaker.record_success();
                }
                let next = self
                    .policy
                    .next_state(writing.attempt_count, WriteOutcome::Failed, Utc::now());
                self.log
                    .fail(&record.record_id, &e.to_string(), next.next_attempt_at)
                    .await?;
                report.failed += 1;
                warn!(
                    record_id = %record.record_id,
                    attempt = writing.attempt_count,
                    error = %e,
                    "Graph write failed"
                );

                if next.state == WalState::DeadLetter {
                    let failed = WalRecord {
                        state: WalState::Failed,
                        ..writing
                    };
                    self.dead_letter(&failed).await?;
                    report.dead_lettered += 1;
                }
            }
        }
        Ok(())
    }

    async fn dead_letter(&self, record: &WalRecord) -> Result<()> {
        self.log
            .transition(&record.record_id, WalState::DeadLetter)
            .await?;
        let exhausted = Error::RecordExhausted {
            record_id: record.record_id.clone(),
            attempts: record.attempt_count,
        };
        warn!(
            record_id = %record.record_id,
            attempts = record.attempt_count,
            code = exhausted.code(),
            "{}",
            exhausted
        );
        Ok(())
    }

    /// Drain until a pass finds nothing dispatchable
    pub async fn drain_all(&mut self) -> Result<DrainReport> {
        let mut total = DrainReport::default();
        loop {
            let pass = self.drain_once().await?;
            total.dispatched += pass.dispatched;
            total.committed += pass.committed;
            total.already_applied += pass.already_applied;
            total.failed += pass.failed;
            total.dead_lettered += pass.dead_lettered;
            total.deferred = pass.deferred;

            if pass.is_idle() || pass.deferred > 0 || pass.failed > 0 {
                return Ok(total);
            }
        }
    }

    /// Run the worker as a background task
    ///
    /// Recovers interrupted records first, then drains on every `Wake`
    /// command and on each poll tick until shut down or cancelled.
    pub fn spawn(mut self, cancel: CancellationToken) -> SyncWorkerHandle {
        let (tx, mut rx) = mpsc::channel(64);
        let token = cancel.clone();

        let join = tokio::spawn(async move {
            if let Err(e) = self.log.recover().await {
                warn!(error = %e, "Fact log recovery failed");
            }

            let mut ticker = tokio::time::interval(self.poll_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    command = rx.recv() => match command {
                        Some(WorkerCommand::Wake) => {}
                        Some(WorkerCommand::Shutdown) | None => break,
                    },
                    _ = ticker.tick() => {}
                }

                if let Err(e) = self.drain_all().await {
                    warn!(error = %e, "WAL drain failed");
                }
            }

            info!("Sync worker stopped");
        });

        SyncWorkerHandle { tx, cancel, join }
    }
}

/// Cloneable way to nudge a running worker
#[derive(Debug, Clone)]
pub struct SyncWaker {
    tx: mpsc::Sender<WorkerCommand>,
}

impl SyncWaker {
    /// Ask the worker to drain soon; never blocks
    pub fn wake(&self) {
        // A full channel already holds a pending wake
        let _ = self.tx.try_send(WorkerCommand::Wake);
    }
}

/// Control handle for a spawned worker
pub struct SyncWorkerHandle {
    tx: mpsc::Sender<WorkerCommand>,
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

impl SyncWorkerHandle {
    pub fn wake(&self) {
        let _ = self.tx.try_send(WorkerCommand::Wake);
    }

    pub fn waker(&self) -> SyncWaker {
        SyncWaker {
            tx: self.tx.clone(),
        }
    }

    /// Stop the worker and wait for it to exit
    pub async fn shutdown(self) -> Result<()> {
        if self.tx.send(WorkerCommand::Shutdown).await.is_err() {
            self.cancel.cancel();
        }
        self.join
            .await
            .map_err(|e| Error::Other(format!("Sync worker panicked: {}", e)))
    }
}
