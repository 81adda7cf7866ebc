//! Scheduler — claims due enrollments and drives them through the
//! executor with bounded parallelism.
//!
//! Claims use a version-guarded conditional update, so a row is executed
//! by exactly one worker even with multiple schedulers polling. Work is
//! grouped by sender: each sender's enrollments run on one worker in due
//! order, which both serializes per-sender sends and keeps warmup
//! counters race-free.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::engine::executor::StepExecutor;
use crate::engine::{Clock, EngineContext};
use crate::error::Result;
use crate::model::{Enrollment, EnrollmentStatus, Sequence};
use crate::store::Store;

/// Central polling loop.
pub struct Scheduler {
    ctx: Arc<EngineContext>,
    executor: Arc<StepExecutor>,
    shutdown: Arc<AtomicBool>,
    sender_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl Scheduler {
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        Self {
            executor: Arc::new(StepExecutor::new(ctx.clone())),
            ctx,
            shutdown: Arc::new(AtomicBool::new(false)),
            sender_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Handle for signalling shutdown from outside the loop.
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    /// Startup recovery: revert stale `in_flight` rows, then rebuild the
    /// governor's pending reservations from whatever remains.
    pub async fn recover(&self) -> Result<()> {
        let now = self.ctx.clock.now();
        let threshold = now
            - chrono::Duration::from_std(self.ctx.config.stale_threshold)
                .unwrap_or_else(|_| chrono::Duration::minutes(10));
        let recovered = self
            .ctx
            .store
            .recover_stale_in_flight(threshold, now)
            .await?;
        if recovered > 0 {
            info!(recovered, "Reverted stale in-flight enrollments to pending");
        }
        self.ctx.governor.seed_pending().await?;
        Ok(())
    }

    /// Run until the shutdown handle flips.
    pub async fn run(&self) -> Result<()> {
        self.recover().await?;
        info!(
            concurrency = self.ctx.config.global_concurrency,
            "Scheduler started"
        );

        while !self.shutdown.load(Ordering::Relaxed) {
            match self.process_due().await {
                // Idle: nothing claimed, short sleep before the next poll.
                Ok(0) => tokio::time::sleep(self.ctx.config.poll_interval).await,
                // Processed work: loop immediately.
                Ok(_) => {}
                Err(e) => {
                    error!(error = %e, "Scheduler iteration failed");
                    tokio::time::sleep(self.ctx.config.poll_interval).await;
                }
            }
        }

        info!("Scheduler stopped");
        Ok(())
    }

    /// One iteration: claim due enrollments, execute them grouped per
    /// sender, wait for the batch. Returns how many were claimed.
    ///
    /// On shutdown the in-batch wait is bounded by `drain_timeout`;
    /// anything still running is left `in_flight` for startup recovery.
    pub async fn process_due(&self) -> Result<usize> {
        let now = self.ctx.clock.now();
        let due = self
            .ctx
            .store
            .list_due_enrollments(now, self.ctx.config.claim_batch_size)
            .await?;
        if due.is_empty() {
            return Ok(0);
        }

        // Claim under the version guard, then bucket per sender keeping
        // due order. Snapshots are fetched once per sequence.
        let mut snapshots: HashMap<Uuid, Arc<Sequence>> = HashMap::new();
        let mut groups: Vec<(String, Vec<(Enrollment, Arc<Sequence>)>)> = Vec::new();
        let mut claimed = 0usize;

        for mut enrollment in due {
            if self.shutdown.load(Ordering::Relaxed) {
                break;
            }
            if !self
                .ctx
                .store
                .try_claim_enrollment(enrollment.id, enrollment.version, now)
                .await?
            {
                // Another worker got there first.
                continue;
            }
            enrollment.version += 1;
            enrollment.status = EnrollmentStatus::InFlight;
            enrollment.updated_at = now;
            claimed += 1;

            let sequence = match snapshots.get(&enrollment.sequence_id) {
                Some(sequence) => sequence.clone(),
                None => match self.ctx.store.get_sequence(enrollment.sequence_id).await? {
                    Some(sequence) => {
                        let sequence = Arc::new(sequence);
                        snapshots.insert(enrollment.sequence_id, sequence.clone());
                        sequence
                    }
                    None => {
                        warn!(
                            enrollment = %enrollment.id,
                            sequence = %enrollment.sequence_id,
                            "Enrollment references a missing sequence"
                        );
                        enrollment.status = EnrollmentStatus::Failed;
                        enrollment.last_error_kind = Some("validation".into());
                        enrollment.last_error_message = Some("sequence not found".into());
                        let _ = self.ctx.store.update_enrollment(&enrollment, None).await;
                        continue;
                    }
                },
            };

            let sender_email = sequence.sender_email.clone();
            match groups.iter_mut().find(|(email, _)| *email == sender_email) {
                Some((_, items)) => items.push((enrollment, sequence)),
                None => groups.push((sender_email, vec![(enrollment, sequence)])),
            }
        }

        let semaphore = Arc::new(Semaphore::new(self.ctx.config.global_concurrency));
        let mut tasks: JoinSet<()> = JoinSet::new();

        for (sender_email, items) in groups {
            let permit = match semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            let lock = self.sender_lock(&sender_email).await;
            let executor = self.executor.clone();

            tasks.spawn(async move {
                let _permit = permit;
                // Per-sender concurrency cap of 1: the lock is held for
                // the whole run of this sender's batch.
                let _guard = lock.lock_owned().await;
                for (enrollment, sequence) in items {
                    let id = enrollment.id;
                    if let Err(e) = executor.execute(enrollment, &sequence).await {
                        error!(enrollment = %id, error = %e, "Step execution failed");
                    }
                }
            });
        }

        // Wait for the batch; a shutdown mid-batch gets a bounded drain.
        loop {
            let joined = if self.shutdown.load(Ordering::Relaxed) {
                match tokio::time::timeout(self.ctx.config.drain_timeout, tasks.join_next()).await {
                    Ok(joined) => joined,
                    Err(_) => {
                        warn!(
                            remaining = tasks.len(),
                            "Drain timeout; leaving in-flight rows for startup recovery"
                        );
                        tasks.abort_all();
                        break;
                    }
                }
            } else {
                tasks.join_next().await
            };
            let Some(result) = joined else { break };
            if let Err(e) = result {
                error!(error = %e, "Worker task panicked");
            }
        }

        debug!(claimed, "Scheduler iteration complete");
        Ok(claimed)
    }

    async fn sender_lock(&self, sender_email: &str) -> Arc<Mutex<()>> {
        let mut locks = self.sender_locks.lock().await;
        locks
            .entry(sender_email.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}
