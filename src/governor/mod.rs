//! Rate Governor — per-sender quota keeper.
//!
//! Grants send slots against the daily (or warmup) cap inside the
//! sender's send window. Reservation and commit are two-phase: a grant
//! holds an in-memory pending reservation until the send either commits
//! (persisted warmup count incremented) or releases (reservation dropped).
//!
//! Pending reservations are process-local. At startup they are
//! reconstructed by counting `in_flight` enrollments per sender.

pub mod ramp;
pub mod window;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{DatabaseError, DenyReason, RateDenied};
use crate::model::Sender;
use crate::store::Store;

/// A reserved send slot. Consume with [`RateGovernor::commit`] on a
/// successful send or [`RateGovernor::release`] on failure.
#[derive(Debug, Clone)]
pub struct SlotGrant {
    pub sender_email: String,
    /// Calendar date (window timezone) the slot counts against.
    pub date: NaiveDate,
}

/// Outcome of a slot request.
#[derive(Debug)]
pub enum SlotDecision {
    Granted(SlotGrant),
    Denied(RateDenied),
}

/// Per-sender quota keeper.
pub struct RateGovernor {
    store: Arc<dyn Store>,
    pending: Mutex<HashMap<String, u32>>,
}

impl RateGovernor {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Rebuild pending reservations from `in_flight` enrollments.
    /// Called once at startup, before the scheduler claims work.
    pub async fn seed_pending(&self) -> Result<(), DatabaseError> {
        let counts = self.store.count_in_flight_by_sender().await?;
        let mut pending = self.pending.lock().await;
        *pending = counts;
        debug!(senders = pending.len(), "Seeded pending reservations");
        Ok(())
    }

    /// Request a send slot for `sender` at `now`.
    pub async fn request_slot(
        &self,
        sender: &Sender,
        now: DateTime<Utc>,
    ) -> Result<SlotDecision, DatabaseError> {
        if sender.on_hold {
            // No schedule to predict here; re-check on the next sweep.
            return Ok(SlotDecision::Denied(RateDenied {
                reason: DenyReason::Paused,
                next_eligible_at: now + Duration::hours(1),
            }));
        }

        if !sender.window.contains(now) {
            return Ok(SlotDecision::Denied(RateDenied {
                reason: DenyReason::Window,
                next_eligible_at: sender.window.next_opening(now),
            }));
        }

        let date = sender.window.local_date(now);
        let cap = ramp::effective_cap(&sender.warmup, sender.daily_cap, date);

        // Hold the reservation lock across the persisted read so two
        // concurrent requests can't both see the last free slot.
        let mut pending = self.pending.lock().await;
        let committed = self.store.warmup_count(&sender.email, date).await?;
        let reserved = pending.get(&sender.email).copied().unwrap_or(0);

        if committed + reserved >= cap {
            debug!(
                sender = %sender.email,
                committed,
                reserved,
                cap,
                "Slot denied: quota"
            );
            return Ok(SlotDecision::Denied(RateDenied {
                reason: DenyReason::Quota,
                next_eligible_at: sender.window.next_opening_after_today(now),
            }));
        }

        *pending.entry(sender.email.clone()).or_insert(0) += 1;
        Ok(SlotDecision::Granted(SlotGrant {
            sender_email: sender.email.clone(),
            date,
        }))
    }

    /// Consume a grant after a successful send: persist the warmup count
    /// and drop the pending reservation.
    pub async fn commit(&self, grant: &SlotGrant) -> Result<(), DatabaseError> {
        self.store
            .increment_warmup_count(&grant.sender_email, grant.date)
            .await?;
        self.release(grant).await;
        Ok(())
    }

    /// Drop a pending reservation without counting a send.
    pub async fn release(&self, grant: &SlotGrant) {
        let mut pending = self.pending.lock().await;
        if let Some(count) = pending.get_mut(&grant.sender_email) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                pending.remove(&grant.sender_email);
            }
        }
    }
}
