//! `Store` trait — single async interface for all persistence.
//!
//! The state store is the single source of truth. Enrollment mutations
//! carry an optimistic version guard; a failed guard surfaces as
//! `DatabaseError::ConcurrencyConflict` and the caller abandons its claim.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::model::{
    EmailTemplate, Enrollment, LogEntry, Recipient, Sender, Sequence, Step,
};

/// Backend-agnostic persistence trait covering sequences, enrollments,
/// senders, the event log, and warmup counters.
#[async_trait]
pub trait Store: Send + Sync {
    /// Initialize schema (idempotent).
    async fn init_schema(&self) -> Result<(), DatabaseError>;

    // ── Sequences ───────────────────────────────────────────────────

    /// Insert a sequence together with its steps.
    async fn create_sequence(&self, sequence: &Sequence) -> Result<(), DatabaseError>;

    /// Load a sequence snapshot (steps in index order).
    async fn get_sequence(&self, id: Uuid) -> Result<Option<Sequence>, DatabaseError>;

    /// Replace a sequence's steps wholesale. The caller checks the
    /// no-in-flight precondition first.
    async fn replace_sequence_steps(&self, id: Uuid, steps: &[Step])
        -> Result<(), DatabaseError>;

    /// Whether any enrollment on this sequence is currently `in_flight`.
    async fn sequence_has_in_flight(&self, id: Uuid) -> Result<bool, DatabaseError>;

    // ── Enrollments ─────────────────────────────────────────────────

    /// Insert a new enrollment. Returns `false` (without inserting) when a
    /// live enrollment already exists for the (recipient, sequence) pair.
    async fn create_enrollment(&self, enrollment: &Enrollment) -> Result<bool, DatabaseError>;

    async fn get_enrollment(&self, id: Uuid) -> Result<Option<Enrollment>, DatabaseError>;

    /// Due rows (`pending` or `waiting`, due_at <= now), ordered by due_at
    /// then id so same-instant enrollments have a stable tie-break.
    async fn list_due_enrollments(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Enrollment>, DatabaseError>;

    /// Conditionally mark an enrollment `in_flight`. Returns `false` when
    /// the version guard misses (another worker claimed it).
    async fn try_claim_enrollment(
        &self,
        id: Uuid,
        version: i64,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    /// Persist an enrollment's new state, optionally together with a log
    /// entry, in one transaction. Fails with `ConcurrencyConflict` when the
    /// stored version no longer matches `enrollment.version`; on success
    /// the stored version is bumped.
    async fn update_enrollment(
        &self,
        enrollment: &Enrollment,
        log: Option<&LogEntry>,
    ) -> Result<(), DatabaseError>;

    /// Per-status enrollment counts for one sequence.
    async fn enrollment_status_counts(
        &self,
        sequence_id: Uuid,
    ) -> Result<HashMap<String, i64>, DatabaseError>;

    /// Failed enrollments for a sequence, for error surfacing.
    async fn list_failed_enrollments(
        &self,
        sequence_id: Uuid,
    ) -> Result<Vec<Enrollment>, DatabaseError>;

    /// Revert `in_flight` rows last touched before `older_than` back to
    /// `pending`, incrementing attempts. Returns how many were recovered.
    async fn recover_stale_in_flight(
        &self,
        older_than: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u64, DatabaseError>;

    /// Current `in_flight` count per sender email — used to reconstruct
    /// the Rate Governor's pending reservations at startup.
    async fn count_in_flight_by_sender(&self) -> Result<HashMap<String, u32>, DatabaseError>;

    /// Manual retry: clear attempts and error, set due-at to now, status
    /// `pending`. Returns `false` when the enrollment is not `failed`.
    async fn reset_failed_enrollment(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    // ── Recipients ──────────────────────────────────────────────────

    async fn upsert_recipient(&self, recipient: &Recipient) -> Result<(), DatabaseError>;

    async fn get_recipient(&self, id: &str) -> Result<Option<Recipient>, DatabaseError>;

    // ── Senders ─────────────────────────────────────────────────────

    async fn upsert_sender(&self, sender: &Sender) -> Result<(), DatabaseError>;

    async fn get_sender(&self, email: &str) -> Result<Option<Sender>, DatabaseError>;

    /// Toggle the on-hold flag. Returns `false` if the sender is unknown.
    async fn set_sender_hold(&self, email: &str, on_hold: bool) -> Result<bool, DatabaseError>;

    // ── Warmup counters ─────────────────────────────────────────────

    async fn warmup_count(
        &self,
        sender_email: &str,
        date: NaiveDate,
    ) -> Result<u32, DatabaseError>;

    /// Record one successful send for (sender, date). Never decremented.
    async fn increment_warmup_count(
        &self,
        sender_email: &str,
        date: NaiveDate,
    ) -> Result<(), DatabaseError>;

    // ── Event log ───────────────────────────────────────────────────

    /// Append-only insert.
    async fn append_log(&self, entry: &LogEntry) -> Result<(), DatabaseError>;

    async fn list_log_for_enrollment(
        &self,
        enrollment_id: Uuid,
    ) -> Result<Vec<LogEntry>, DatabaseError>;

    /// Most recent dispatch entry carrying this external reference.
    async fn find_log_by_external_ref(
        &self,
        external_ref: &str,
    ) -> Result<Option<LogEntry>, DatabaseError>;

    // ── Webhook dedupe ──────────────────────────────────────────────

    /// Record a webhook event key at `now`. Returns `true` the first
    /// time a (provider, event_id) pair is seen, `false` on duplicates.
    async fn try_mark_webhook_event(
        &self,
        provider: &str,
        event_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    // ── Email templates ─────────────────────────────────────────────

    async fn get_template(&self, key: &str) -> Result<Option<EmailTemplate>, DatabaseError>;

    async fn upsert_template(
        &self,
        template: &EmailTemplate,
        now: DateTime<Utc>,
    ) -> Result<(), DatabaseError>;
}
