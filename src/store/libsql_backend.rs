//! libSQL backend — async `Store` trait implementation.
//!
//! Supports local file and in-memory databases. All timestamps are
//! written as RFC 3339 UTC strings.

use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveTime, Utc, Weekday};
use libsql::{params, Connection, Database as LibSqlDatabase};
use tracing::info;
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::model::{
    Channel, EmailTemplate, Enrollment, EnrollmentStatus, LogEntry, LogOutcome, Recipient,
    SendWindow, Sender, Sequence, Step, WarmupState,
};
use crate::store::migrations;
use crate::store::traits::Store;

const ENROLLMENT_COLUMNS: &str = "id, recipient_id, sequence_id, step_index, due_at, status, \
     attempts, version, last_error_kind, last_error_message, updated_at";

const LOG_COLUMNS: &str = "id, enrollment_id, step_index, channel, sender_email, recipient_id, \
     status, external_ref, subject, timestamp, variant_tags_json";

const SENDER_COLUMNS: &str = "email, name, title, phone, signature_rich, signature_plain, \
     warmup_enabled, warmup_start_date, ramp_key, daily_cap, on_hold, \
     window_days, window_start, window_end, window_tz";

/// libSQL store backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlStore {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlStore {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Connection(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Connection(format!("Failed to open database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Connection(format!("Failed to create connection: {e}")))?;

        let store = Self {
            db: Arc::new(db),
            conn,
        };
        store.init_schema().await?;
        info!(path = %path.display(), "Database opened");
        Ok(store)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Connection(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Connection(format!("Failed to create connection: {e}")))?;

        let store = Self {
            db: Arc::new(db),
            conn,
        };
        store.init_schema().await?;
        Ok(store)
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn format_date(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

fn weekday_to_str(day: Weekday) -> &'static str {
    match day {
        Weekday::Mon => "mon",
        Weekday::Tue => "tue",
        Weekday::Wed => "wed",
        Weekday::Thu => "thu",
        Weekday::Fri => "fri",
        Weekday::Sat => "sat",
        Weekday::Sun => "sun",
    }
}

fn window_days_to_csv(days: &[Weekday]) -> String {
    days.iter()
        .map(|d| weekday_to_str(*d))
        .collect::<Vec<_>>()
        .join(",")
}

fn csv_to_window_days(csv: &str) -> Vec<Weekday> {
    csv.split(',')
        .filter_map(|s| Weekday::from_str(s.trim()).ok())
        .collect()
}

fn parse_clock(s: &str) -> NaiveTime {
    NaiveTime::parse_from_str(s, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M:%S"))
        .unwrap_or(NaiveTime::MIN)
}

fn step_kind(step: &Step) -> &'static str {
    match step {
        Step::Email { .. } => "email",
        Step::Wait { .. } => "wait",
        Step::Call { .. } => "call",
        Step::NetworkConnect { .. } => "network_connect",
        Step::NetworkMessage { .. } => "network_message",
    }
}

fn row_to_enrollment(row: &libsql::Row) -> Result<Enrollment, DatabaseError> {
    let id: String = row.get(0).map_err(query_err)?;
    let recipient_id: String = row.get(1).map_err(query_err)?;
    let sequence_id: String = row.get(2).map_err(query_err)?;
    let step_index: i64 = row.get(3).map_err(query_err)?;
    let due_at: String = row.get(4).map_err(query_err)?;
    let status: String = row.get(5).map_err(query_err)?;
    let attempts: i64 = row.get(6).map_err(query_err)?;
    let version: i64 = row.get(7).map_err(query_err)?;
    let last_error_kind: Option<String> = row.get::<String>(8).ok();
    let last_error_message: Option<String> = row.get::<String>(9).ok();
    let updated_at: String = row.get(10).map_err(query_err)?;

    Ok(Enrollment {
        id: Uuid::parse_str(&id).unwrap_or_else(|_| Uuid::nil()),
        recipient_id,
        sequence_id: Uuid::parse_str(&sequence_id).unwrap_or_else(|_| Uuid::nil()),
        step_index: step_index.max(0) as u32,
        due_at: parse_datetime(&due_at),
        status: EnrollmentStatus::parse(&status),
        attempts: attempts.max(0) as u32,
        version,
        last_error_kind,
        last_error_message,
        updated_at: parse_datetime(&updated_at),
    })
}

fn row_to_log_entry(row: &libsql::Row) -> Result<LogEntry, DatabaseError> {
    let id: String = row.get(0).map_err(query_err)?;
    let enrollment_id: Option<String> = row.get::<String>(1).ok();
    let step_index: i64 = row.get(2).map_err(query_err)?;
    let channel: String = row.get(3).map_err(query_err)?;
    let sender_email: String = row.get(4).map_err(query_err)?;
    let recipient_id: String = row.get(5).map_err(query_err)?;
    let status: String = row.get(6).map_err(query_err)?;
    let external_ref: Option<String> = row.get::<String>(7).ok();
    let subject: Option<String> = row.get::<String>(8).ok();
    let timestamp: String = row.get(9).map_err(query_err)?;
    let tags_json: String = row.get(10).map_err(query_err)?;

    // The log is the audit trail; never paper over a corrupted outcome.
    let outcome = LogOutcome::parse(&status)
        .ok_or_else(|| DatabaseError::Query(format!("unrecognized log outcome '{status}'")))?;

    Ok(LogEntry {
        id: Uuid::parse_str(&id).unwrap_or_else(|_| Uuid::nil()),
        enrollment_id: enrollment_id.and_then(|s| Uuid::parse_str(&s).ok()),
        step_index: step_index.max(0) as u32,
        channel: Channel::parse(&channel).unwrap_or(Channel::Email),
        sender_email,
        recipient_id,
        outcome,
        external_ref,
        subject,
        timestamp: parse_datetime(&timestamp),
        variant_tags: serde_json::from_str(&tags_json).unwrap_or_default(),
    })
}

fn row_to_sender(row: &libsql::Row) -> Result<Sender, DatabaseError> {
    let email: String = row.get(0).map_err(query_err)?;
    let name: String = row.get(1).map_err(query_err)?;
    let title: String = row.get(2).map_err(query_err)?;
    let phone: String = row.get(3).map_err(query_err)?;
    let signature_rich: String = row.get(4).map_err(query_err)?;
    let signature_plain: String = row.get(5).map_err(query_err)?;
    let warmup_enabled: i64 = row.get(6).map_err(query_err)?;
    let warmup_start: Option<String> = row.get::<String>(7).ok();
    let ramp_key: String = row.get(8).map_err(query_err)?;
    let daily_cap: i64 = row.get(9).map_err(query_err)?;
    let on_hold: i64 = row.get(10).map_err(query_err)?;
    let window_days: String = row.get(11).map_err(query_err)?;
    let window_start: String = row.get(12).map_err(query_err)?;
    let window_end: String = row.get(13).map_err(query_err)?;
    let window_tz: String = row.get(14).map_err(query_err)?;

    Ok(Sender {
        email,
        name,
        title,
        phone,
        signature_rich,
        signature_plain,
        warmup: WarmupState {
            enabled: warmup_enabled != 0,
            start_date: warmup_start
                .and_then(|s| NaiveDate::parse_from_str(&s, "%Y-%m-%d").ok()),
            ramp_key,
        },
        daily_cap: daily_cap.max(0) as u32,
        on_hold: on_hold != 0,
        window: SendWindow {
            days: csv_to_window_days(&window_days),
            start: parse_clock(&window_start),
            end: parse_clock(&window_end),
            timezone: window_tz.parse().unwrap_or(chrono_tz::UTC),
        },
    })
}

fn row_to_recipient(row: &libsql::Row) -> Result<Recipient, DatabaseError> {
    let id: String = row.get(0).map_err(query_err)?;
    let first_name: String = row.get(1).map_err(query_err)?;
    let last_name: String = row.get(2).map_err(query_err)?;
    let email: String = row.get(3).map_err(query_err)?;
    let title: String = row.get(4).map_err(query_err)?;
    let phone: Option<String> = row.get::<String>(5).ok().filter(|s| !s.is_empty());
    let network_url: Option<String> = row.get::<String>(6).ok().filter(|s| !s.is_empty());
    let company: String = row.get(7).map_err(query_err)?;
    let industry: String = row.get(8).map_err(query_err)?;
    let attributes_json: String = row.get(9).map_err(query_err)?;

    Ok(Recipient {
        id,
        first_name,
        last_name,
        email,
        title,
        phone,
        network_url,
        company,
        industry,
        attributes: serde_json::from_str(&attributes_json).unwrap_or_default(),
    })
}

fn query_err(e: libsql::Error) -> DatabaseError {
    DatabaseError::Query(e.to_string())
}

/// Insert a log entry on any connection (plain or transactional —
/// `Transaction` derefs to `Connection`).
async fn insert_log_entry(conn: &Connection, entry: &LogEntry) -> Result<(), DatabaseError> {
    let tags = serde_json::to_string(&entry.variant_tags)
        .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
    conn.execute(
        &format!(
            "INSERT INTO log_entries ({LOG_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"
        ),
        params![
            entry.id.to_string(),
            entry.enrollment_id.map(|id| id.to_string()),
            entry.step_index as i64,
            entry.channel.as_str(),
            entry.sender_email.clone(),
            entry.recipient_id.clone(),
            entry.outcome.as_str(),
            entry.external_ref.clone(),
            entry.subject.clone(),
            entry.timestamp.to_rfc3339(),
            tags,
        ],
    )
    .await
    .map_err(query_err)?;
    Ok(())
}

// ── Store impl ──────────────────────────────────────────────────────

#[async_trait]
impl Store for LibSqlStore {
    async fn init_schema(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(&self.conn).await
    }

    // ── Sequences ───────────────────────────────────────────────────

    async fn create_sequence(&self, sequence: &Sequence) -> Result<(), DatabaseError> {
        let tx = self
            .conn
            .transaction()
            .await
            .map_err(query_err)?;

        tx.execute(
            "INSERT INTO sequences (id, campaign_id, name, sender_email, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                sequence.id.to_string(),
                sequence.campaign_id.clone(),
                sequence.name.clone(),
                sequence.sender_email.clone(),
                sequence.created_at.to_rfc3339(),
            ],
        )
        .await
        .map_err(query_err)?;

        for (index, step) in sequence.steps.iter().enumerate() {
            let payload = serde_json::to_string(step)
                .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
            tx.execute(
                "INSERT INTO sequence_steps (sequence_id, step_index, kind, payload_json)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    sequence.id.to_string(),
                    index as i64,
                    step_kind(step),
                    payload,
                ],
            )
            .await
            .map_err(query_err)?;
        }

        tx.commit().await.map_err(query_err)
    }

    async fn get_sequence(&self, id: Uuid) -> Result<Option<Sequence>, DatabaseError> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, campaign_id, name, sender_email, created_at
                 FROM sequences WHERE id = ?1",
                params![id.to_string()],
            )
            .await
            .map_err(query_err)?;

        let Some(row) = rows.next().await.map_err(query_err)? else {
            return Ok(None);
        };

        let campaign_id: String = row.get(1).map_err(query_err)?;
        let name: String = row.get(2).map_err(query_err)?;
        let sender_email: String = row.get(3).map_err(query_err)?;
        let created_at: String = row.get(4).map_err(query_err)?;

        let mut steps = Vec::new();
        let mut step_rows = self
            .conn
            .query(
                "SELECT payload_json FROM sequence_steps
                 WHERE sequence_id = ?1 ORDER BY step_index ASC",
                params![id.to_string()],
            )
            .await
            .map_err(query_err)?;
        while let Some(step_row) = step_rows.next().await.map_err(query_err)? {
            let payload: String = step_row.get(0).map_err(query_err)?;
            let step: Step = serde_json::from_str(&payload)
                .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
            steps.push(step);
        }

        Ok(Some(Sequence {
            id,
            campaign_id,
            name,
            sender_email,
            steps,
            created_at: parse_datetime(&created_at),
        }))
    }

    async fn replace_sequence_steps(
        &self,
        id: Uuid,
        steps: &[Step],
    ) -> Result<(), DatabaseError> {
        let tx = self.conn.transaction().await.map_err(query_err)?;

        tx.execute(
            "DELETE FROM sequence_steps WHERE sequence_id = ?1",
            params![id.to_string()],
        )
        .await
        .map_err(query_err)?;

        for (index, step) in steps.iter().enumerate() {
            let payload = serde_json::to_string(step)
                .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
            tx.execute(
                "INSERT INTO sequence_steps (sequence_id, step_index, kind, payload_json)
                 VALUES (?1, ?2, ?3, ?4)",
                params![id.to_string(), index as i64, step_kind(step), payload],
            )
            .await
            .map_err(query_err)?;
        }

        tx.commit().await.map_err(query_err)
    }

    async fn sequence_has_in_flight(&self, id: Uuid) -> Result<bool, DatabaseError> {
        let mut rows = self
            .conn
            .query(
                "SELECT COUNT(*) FROM enrollments
                 WHERE sequence_id = ?1 AND status = 'in_flight'",
                params![id.to_string()],
            )
            .await
            .map_err(query_err)?;
        let row = rows.next().await.map_err(query_err)?;
        let count: i64 = row
            .map(|r| r.get(0).unwrap_or(0))
            .unwrap_or(0);
        Ok(count > 0)
    }

    // ── Enrollments ─────────────────────────────────────────────────

    async fn create_enrollment(&self, enrollment: &Enrollment) -> Result<bool, DatabaseError> {
        let result = self
            .conn
            .execute(
                &format!(
                    "INSERT INTO enrollments ({ENROLLMENT_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"
                ),
                params![
                    enrollment.id.to_string(),
                    enrollment.recipient_id.clone(),
                    enrollment.sequence_id.to_string(),
                    enrollment.step_index as i64,
                    enrollment.due_at.to_rfc3339(),
                    enrollment.status.as_str(),
                    enrollment.attempts as i64,
                    enrollment.version,
                    enrollment.last_error_kind.clone(),
                    enrollment.last_error_message.clone(),
                    enrollment.updated_at.to_rfc3339(),
                ],
            )
            .await;

        match result {
            Ok(_) => Ok(true),
            // The partial unique index guards at-most-one-live-enrollment.
            Err(e) if e.to_string().contains("UNIQUE") => Ok(false),
            Err(e) => Err(query_err(e)),
        }
    }

    async fn get_enrollment(&self, id: Uuid) -> Result<Option<Enrollment>, DatabaseError> {
        let mut rows = self
            .conn
            .query(
                &format!("SELECT {ENROLLMENT_COLUMNS} FROM enrollments WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(query_err)?;

        match rows.next().await.map_err(query_err)? {
            Some(row) => Ok(Some(row_to_enrollment(&row)?)),
            None => Ok(None),
        }
    }

    async fn list_due_enrollments(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Enrollment>, DatabaseError> {
        let mut rows = self
            .conn
            .query(
                &format!(
                    "SELECT {ENROLLMENT_COLUMNS} FROM enrollments
                     WHERE status IN ('pending', 'waiting') AND due_at <= ?1
                     ORDER BY due_at ASC, id ASC LIMIT ?2"
                ),
                params![now.to_rfc3339(), limit as i64],
            )
            .await
            .map_err(query_err)?;

        let mut due = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err)? {
            due.push(row_to_enrollment(&row)?);
        }
        Ok(due)
    }

    async fn try_claim_enrollment(
        &self,
        id: Uuid,
        version: i64,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let affected = self
            .conn
            .execute(
                "UPDATE enrollments
                 SET status = 'in_flight', version = version + 1, updated_at = ?1
                 WHERE id = ?2 AND version = ?3 AND status IN ('pending', 'waiting')",
                params![now.to_rfc3339(), id.to_string(), version],
            )
            .await
            .map_err(query_err)?;
        Ok(affected == 1)
    }

    async fn update_enrollment(
        &self,
        enrollment: &Enrollment,
        log: Option<&LogEntry>,
    ) -> Result<(), DatabaseError> {
        let tx = self.conn.transaction().await.map_err(query_err)?;

        let affected = tx
            .execute(
                "UPDATE enrollments
                 SET step_index = ?1, due_at = ?2, status = ?3, attempts = ?4,
                     last_error_kind = ?5, last_error_message = ?6,
                     updated_at = ?7, version = version + 1
                 WHERE id = ?8 AND version = ?9",
                params![
                    enrollment.step_index as i64,
                    enrollment.due_at.to_rfc3339(),
                    enrollment.status.as_str(),
                    enrollment.attempts as i64,
                    enrollment.last_error_kind.clone(),
                    enrollment.last_error_message.clone(),
                    enrollment.updated_at.to_rfc3339(),
                    enrollment.id.to_string(),
                    enrollment.version,
                ],
            )
            .await
            .map_err(query_err)?;

        if affected == 0 {
            let _ = tx.rollback().await;
            return Err(DatabaseError::ConcurrencyConflict {
                entity: "enrollment".into(),
                id: enrollment.id.to_string(),
            });
        }

        if let Some(entry) = log {
            insert_log_entry(&tx, entry).await?;
        }

        tx.commit().await.map_err(query_err)
    }

    async fn enrollment_status_counts(
        &self,
        sequence_id: Uuid,
    ) -> Result<HashMap<String, i64>, DatabaseError> {
        let mut rows = self
            .conn
            .query(
                "SELECT status, COUNT(*) FROM enrollments
                 WHERE sequence_id = ?1 GROUP BY status",
                params![sequence_id.to_string()],
            )
            .await
            .map_err(query_err)?;

        let mut counts = HashMap::new();
        while let Some(row) = rows.next().await.map_err(query_err)? {
            let status: String = row.get(0).map_err(query_err)?;
            let count: i64 = row.get(1).map_err(query_err)?;
            counts.insert(status, count);
        }
        Ok(counts)
    }

    async fn list_failed_enrollments(
        &self,
        sequence_id: Uuid,
    ) -> Result<Vec<Enrollment>, DatabaseError> {
        let mut rows = self
            .conn
            .query(
                &format!(
                    "SELECT {ENROLLMENT_COLUMNS} FROM enrollments
                     WHERE sequence_id = ?1 AND status = 'failed' ORDER BY id ASC"
                ),
                params![sequence_id.to_string()],
            )
            .await
            .map_err(query_err)?;

        let mut failed = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err)? {
            failed.push(row_to_enrollment(&row)?);
        }
        Ok(failed)
    }

    async fn recover_stale_in_flight(
        &self,
        older_than: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u64, DatabaseError> {
        self.conn
            .execute(
                "UPDATE enrollments
                 SET status = 'pending', attempts = attempts + 1,
                     version = version + 1, updated_at = ?1
                 WHERE status = 'in_flight' AND updated_at < ?2",
                params![now.to_rfc3339(), older_than.to_rfc3339()],
            )
            .await
            .map_err(query_err)
    }

    async fn count_in_flight_by_sender(&self) -> Result<HashMap<String, u32>, DatabaseError> {
        let mut rows = self
            .conn
            .query(
                "SELECT s.sender_email, COUNT(*)
                 FROM enrollments e JOIN sequences s ON e.sequence_id = s.id
                 WHERE e.status = 'in_flight'
                 GROUP BY s.sender_email",
                (),
            )
            .await
            .map_err(query_err)?;

        let mut counts = HashMap::new();
        while let Some(row) = rows.next().await.map_err(query_err)? {
            let sender: String = row.get(0).map_err(query_err)?;
            let count: i64 = row.get(1).map_err(query_err)?;
            counts.insert(sender, count.max(0) as u32);
        }
        Ok(counts)
    }

    async fn reset_failed_enrollment(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let affected = self
            .conn
            .execute(
                "UPDATE enrollments
                 SET status = 'pending', attempts = 0, due_at = ?1,
                     last_error_kind = NULL, last_error_message = NULL,
                     version = version + 1, updated_at = ?1
                 WHERE id = ?2 AND status = 'failed'",
                params![now.to_rfc3339(), id.to_string()],
            )
            .await
            .map_err(query_err)?;
        Ok(affected == 1)
    }

    // ── Recipients ──────────────────────────────────────────────────

    async fn upsert_recipient(&self, recipient: &Recipient) -> Result<(), DatabaseError> {
        let attributes = serde_json::to_string(&recipient.attributes)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
        self.conn
            .execute(
                "INSERT INTO recipients (id, first_name, last_name, email, title, phone,
                     network_url, company, industry, attributes_json)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                 ON CONFLICT(id) DO UPDATE SET
                     first_name = excluded.first_name,
                     last_name = excluded.last_name,
                     email = excluded.email,
                     title = excluded.title,
                     phone = excluded.phone,
                     network_url = excluded.network_url,
                     company = excluded.company,
                     industry = excluded.industry,
                     attributes_json = excluded.attributes_json",
                params![
                    recipient.id.clone(),
                    recipient.first_name.clone(),
                    recipient.last_name.clone(),
                    recipient.email.clone(),
                    recipient.title.clone(),
                    recipient.phone.clone(),
                    recipient.network_url.clone(),
                    recipient.company.clone(),
                    recipient.industry.clone(),
                    attributes,
                ],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }

    async fn get_recipient(&self, id: &str) -> Result<Option<Recipient>, DatabaseError> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, first_name, last_name, email, title, phone, network_url,
                        company, industry, attributes_json
                 FROM recipients WHERE id = ?1",
                params![id],
            )
            .await
            .map_err(query_err)?;

        match rows.next().await.map_err(query_err)? {
            Some(row) => Ok(Some(row_to_recipient(&row)?)),
            None => Ok(None),
        }
    }

    // ── Senders ─────────────────────────────────────────────────────

    async fn upsert_sender(&self, sender: &Sender) -> Result<(), DatabaseError> {
        self.conn
            .execute(
                &format!(
                    "INSERT INTO senders ({SENDER_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
                     ON CONFLICT(email) DO UPDATE SET
                         name = excluded.name,
                         title = excluded.title,
                         phone = excluded.phone,
                         signature_rich = excluded.signature_rich,
                         signature_plain = excluded.signature_plain,
                         warmup_enabled = excluded.warmup_enabled,
                         warmup_start_date = excluded.warmup_start_date,
                         ramp_key = excluded.ramp_key,
                         daily_cap = excluded.daily_cap,
                         on_hold = excluded.on_hold,
                         window_days = excluded.window_days,
                         window_start = excluded.window_start,
                         window_end = excluded.window_end,
                         window_tz = excluded.window_tz"
                ),
                params![
                    sender.email.clone(),
                    sender.name.clone(),
                    sender.title.clone(),
                    sender.phone.clone(),
                    sender.signature_rich.clone(),
                    sender.signature_plain.clone(),
                    sender.warmup.enabled as i64,
                    sender.warmup.start_date.map(format_date),
                    sender.warmup.ramp_key.clone(),
                    sender.daily_cap as i64,
                    sender.on_hold as i64,
                    window_days_to_csv(&sender.window.days),
                    sender.window.start.format("%H:%M").to_string(),
                    sender.window.end.format("%H:%M").to_string(),
                    sender.window.timezone.name(),
                ],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }

    async fn get_sender(&self, email: &str) -> Result<Option<Sender>, DatabaseError> {
        let mut rows = self
            .conn
            .query(
                &format!("SELECT {SENDER_COLUMNS} FROM senders WHERE email = ?1"),
                params![email],
            )
            .await
            .map_err(query_err)?;

        match rows.next().await.map_err(query_err)? {
            Some(row) => Ok(Some(row_to_sender(&row)?)),
            None => Ok(None),
        }
    }

    async fn set_sender_hold(&self, email: &str, on_hold: bool) -> Result<bool, DatabaseError> {
        let affected = self
            .conn
            .execute(
                "UPDATE senders SET on_hold = ?1 WHERE email = ?2",
                params![on_hold as i64, email],
            )
            .await
            .map_err(query_err)?;
        Ok(affected == 1)
    }

    // ── Warmup counters ─────────────────────────────────────────────

    async fn warmup_count(
        &self,
        sender_email: &str,
        date: NaiveDate,
    ) -> Result<u32, DatabaseError> {
        let mut rows = self
            .conn
            .query(
                "SELECT count FROM warmup_counts WHERE sender_email = ?1 AND date = ?2",
                params![sender_email, format_date(date)],
            )
            .await
            .map_err(query_err)?;

        match rows.next().await.map_err(query_err)? {
            Some(row) => {
                let count: i64 = row.get(0).map_err(query_err)?;
                Ok(count.max(0) as u32)
            }
            None => Ok(0),
        }
    }

    async fn increment_warmup_count(
        &self,
        sender_email: &str,
        date: NaiveDate,
    ) -> Result<(), DatabaseError> {
        self.conn
            .execute(
                "INSERT INTO warmup_counts (sender_email, date, count) VALUES (?1, ?2, 1)
                 ON CONFLICT(sender_email, date) DO UPDATE SET count = count + 1",
                params![sender_email, format_date(date)],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }

    // ── Event log ───────────────────────────────────────────────────

    async fn append_log(&self, entry: &LogEntry) -> Result<(), DatabaseError> {
        insert_log_entry(&self.conn, entry).await
    }

    async fn list_log_for_enrollment(
        &self,
        enrollment_id: Uuid,
    ) -> Result<Vec<LogEntry>, DatabaseError> {
        let mut rows = self
            .conn
            .query(
                &format!(
                    "SELECT {LOG_COLUMNS} FROM log_entries
                     WHERE enrollment_id = ?1 ORDER BY timestamp ASC, id ASC"
                ),
                params![enrollment_id.to_string()],
            )
            .await
            .map_err(query_err)?;

        let mut entries = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err)? {
            entries.push(row_to_log_entry(&row)?);
        }
        Ok(entries)
    }

    async fn find_log_by_external_ref(
        &self,
        external_ref: &str,
    ) -> Result<Option<LogEntry>, DatabaseError> {
        let mut rows = self
            .conn
            .query(
                &format!(
                    "SELECT {LOG_COLUMNS} FROM log_entries
                     WHERE external_ref = ?1 ORDER BY timestamp ASC LIMIT 1"
                ),
                params![external_ref],
            )
            .await
            .map_err(query_err)?;

        match rows.next().await.map_err(query_err)? {
            Some(row) => Ok(Some(row_to_log_entry(&row)?)),
            None => Ok(None),
        }
    }

    // ── Webhook dedupe ──────────────────────────────────────────────

    async fn try_mark_webhook_event(
        &self,
        provider: &str,
        event_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let affected = self
            .conn
            .execute(
                "INSERT OR IGNORE INTO webhook_events (provider, event_id, received_at)
                 VALUES (?1, ?2, ?3)",
                params![provider, event_id, now.to_rfc3339()],
            )
            .await
            .map_err(query_err)?;
        Ok(affected == 1)
    }

    // ── Email templates ─────────────────────────────────────────────

    async fn get_template(&self, key: &str) -> Result<Option<EmailTemplate>, DatabaseError> {
        let mut rows = self
            .conn
            .query(
                "SELECT key, subject, body FROM email_templates WHERE key = ?1",
                params![key],
            )
            .await
            .map_err(query_err)?;

        match rows.next().await.map_err(query_err)? {
            Some(row) => Ok(Some(EmailTemplate {
                key: row.get(0).map_err(query_err)?,
                subject: row.get(1).map_err(query_err)?,
                body: row.get(2).map_err(query_err)?,
            })),
            None => Ok(None),
        }
    }

    async fn upsert_template(
        &self,
        template: &EmailTemplate,
        now: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        self.conn
            .execute(
                "INSERT INTO email_templates (key, subject, body, updated_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(key) DO UPDATE SET
                     subject = excluded.subject,
                     body = excluded.body,
                     updated_at = excluded.updated_at",
                params![
                    template.key.clone(),
                    template.subject.clone(),
                    template.body.clone(),
                    now.to_rfc3339(),
                ],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::PersonalizationMode;
    use chrono::TimeZone;

    fn sequence(sender_email: &str) -> Sequence {
        Sequence {
            id: Uuid::new_v4(),
            campaign_id: "camp-1".into(),
            name: "Q3 warehouse outreach".into(),
            sender_email: sender_email.into(),
            steps: vec![
                Step::Email {
                    delay_days: 0,
                    template_key: None,
                    subject: Some("Hi {{first_name}}".into()),
                    body: Some("{{personalization_sentence}}".into()),
                    personalization_mode: PersonalizationMode::SignalBased,
                },
                Step::Wait { delay_days: 3 },
                Step::Call {
                    delay_days: 0,
                    script: "Ask about throughput".into(),
                },
            ],
            created_at: Utc.with_ymd_and_hms(2026, 6, 1, 12, 0, 0).unwrap(),
        }
    }

    #[tokio::test]
    async fn sequence_round_trip() {
        let store = LibSqlStore::new_memory().await.unwrap();
        let seq = sequence("a@b.c");
        store.create_sequence(&seq).await.unwrap();

        let loaded = store.get_sequence(seq.id).await.unwrap().unwrap();
        assert_eq!(loaded.name, seq.name);
        assert_eq!(loaded.steps.len(), 3);
        assert!(loaded.steps[1].is_wait());
        assert_eq!(loaded.created_at, seq.created_at);

        assert!(store
            .get_sequence(Uuid::new_v4())
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn replace_steps_keeps_order() {
        let store = LibSqlStore::new_memory().await.unwrap();
        let seq = sequence("a@b.c");
        store.create_sequence(&seq).await.unwrap();

        let new_steps = vec![Step::Wait { delay_days: 1 }, Step::Call {
            delay_days: 0,
            script: "hello".into(),
        }];
        store
            .replace_sequence_steps(seq.id, &new_steps)
            .await
            .unwrap();

        let loaded = store.get_sequence(seq.id).await.unwrap().unwrap();
        assert_eq!(loaded.steps.len(), 2);
        assert!(loaded.steps[0].is_wait());
    }

    #[tokio::test]
    async fn second_live_enrollment_is_rejected() {
        let store = LibSqlStore::new_memory().await.unwrap();
        let seq = sequence("a@b.c");
        store.create_sequence(&seq).await.unwrap();
        let now = Utc::now();

        assert!(store
            .create_enrollment(&Enrollment::new("r-1", seq.id, now))
            .await
            .unwrap());
        assert!(!store
            .create_enrollment(&Enrollment::new("r-1", seq.id, now))
            .await
            .unwrap());

        // A different recipient is fine.
        assert!(store
            .create_enrollment(&Enrollment::new("r-2", seq.id, now))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn claim_is_exclusive_per_version() {
        let store = LibSqlStore::new_memory().await.unwrap();
        let seq = sequence("a@b.c");
        store.create_sequence(&seq).await.unwrap();
        let now = Utc::now();

        let enrollment = Enrollment::new("r-1", seq.id, now);
        store.create_enrollment(&enrollment).await.unwrap();

        assert!(store
            .try_claim_enrollment(enrollment.id, 0, now)
            .await
            .unwrap());
        // Same version again — another worker loses the race.
        assert!(!store
            .try_claim_enrollment(enrollment.id, 0, now)
            .await
            .unwrap());

        let claimed = store.get_enrollment(enrollment.id).await.unwrap().unwrap();
        assert_eq!(claimed.status, EnrollmentStatus::InFlight);
        assert_eq!(claimed.version, 1);
    }

    #[tokio::test]
    async fn update_with_stale_version_conflicts() {
        let store = LibSqlStore::new_memory().await.unwrap();
        let seq = sequence("a@b.c");
        store.create_sequence(&seq).await.unwrap();
        let now = Utc::now();

        let mut enrollment = Enrollment::new("r-1", seq.id, now);
        store.create_enrollment(&enrollment).await.unwrap();
        store
            .try_claim_enrollment(enrollment.id, 0, now)
            .await
            .unwrap();

        // Enrollment still thinks version is 0 — guard must trip.
        enrollment.status = EnrollmentStatus::Completed;
        let result = store.update_enrollment(&enrollment, None).await;
        assert!(matches!(
            result,
            Err(DatabaseError::ConcurrencyConflict { .. })
        ));

        enrollment.version = 1;
        store.update_enrollment(&enrollment, None).await.unwrap();
        let stored = store.get_enrollment(enrollment.id).await.unwrap().unwrap();
        assert_eq!(stored.status, EnrollmentStatus::Completed);
        assert_eq!(stored.version, 2);
    }

    #[tokio::test]
    async fn update_persists_log_in_same_transaction() {
        let store = LibSqlStore::new_memory().await.unwrap();
        let seq = sequence("a@b.c");
        store.create_sequence(&seq).await.unwrap();
        let now = Utc::now();

        let mut enrollment = Enrollment::new("r-1", seq.id, now);
        store.create_enrollment(&enrollment).await.unwrap();

        enrollment.status = EnrollmentStatus::Waiting;
        let entry = LogEntry::new(&enrollment, Channel::Email, "a@b.c", LogOutcome::Sent, now)
            .with_subject(Some("Hi Mia".into()));
        store
            .update_enrollment(&enrollment, Some(&entry))
            .await
            .unwrap();

        let log = store.list_log_for_enrollment(enrollment.id).await.unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].outcome, LogOutcome::Sent);
        assert_eq!(log[0].subject.as_deref(), Some("Hi Mia"));
    }

    #[tokio::test]
    async fn due_listing_orders_by_due_then_id() {
        let store = LibSqlStore::new_memory().await.unwrap();
        let seq = sequence("a@b.c");
        store.create_sequence(&seq).await.unwrap();
        let now = Utc::now();

        let mut ids = Vec::new();
        for i in 0..3 {
            let e = Enrollment::new(&format!("r-{i}"), seq.id, now);
            ids.push(e.id.to_string());
            store.create_enrollment(&e).await.unwrap();
        }

        let due = store.list_due_enrollments(now, 10).await.unwrap();
        assert_eq!(due.len(), 3);
        let mut sorted = ids.clone();
        sorted.sort();
        let listed: Vec<String> = due.iter().map(|e| e.id.to_string()).collect();
        assert_eq!(listed, sorted);

        // Future rows are not due.
        let future = Enrollment::new("r-9", seq.id, now + chrono::Duration::hours(2));
        store.create_enrollment(&future).await.unwrap();
        let due = store.list_due_enrollments(now, 10).await.unwrap();
        assert_eq!(due.len(), 3);
    }

    #[tokio::test]
    async fn stale_in_flight_recovery() {
        let store = LibSqlStore::new_memory().await.unwrap();
        let seq = sequence("a@b.c");
        store.create_sequence(&seq).await.unwrap();
        let old = Utc::now() - chrono::Duration::minutes(30);

        let enrollment = Enrollment::new("r-1", seq.id, old);
        store.create_enrollment(&enrollment).await.unwrap();
        store
            .try_claim_enrollment(enrollment.id, 0, old)
            .await
            .unwrap();

        let threshold = Utc::now() - chrono::Duration::minutes(10);
        let recovered = store
            .recover_stale_in_flight(threshold, Utc::now())
            .await
            .unwrap();
        assert_eq!(recovered, 1);

        let row = store.get_enrollment(enrollment.id).await.unwrap().unwrap();
        assert_eq!(row.status, EnrollmentStatus::Pending);
        assert_eq!(row.attempts, 1);
    }

    #[tokio::test]
    async fn warmup_counts_accumulate() {
        let store = LibSqlStore::new_memory().await.unwrap();
        let date = NaiveDate::from_ymd_opt(2026, 7, 6).unwrap();

        assert_eq!(store.warmup_count("a@b.c", date).await.unwrap(), 0);
        store.increment_warmup_count("a@b.c", date).await.unwrap();
        store.increment_warmup_count("a@b.c", date).await.unwrap();
        assert_eq!(store.warmup_count("a@b.c", date).await.unwrap(), 2);

        // Different date is a fresh counter.
        let next = date.succ_opt().unwrap();
        assert_eq!(store.warmup_count("a@b.c", next).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn webhook_dedupe_accepts_first_only() {
        let store = LibSqlStore::new_memory().await.unwrap();
        let now = Utc.with_ymd_and_hms(2026, 7, 6, 10, 0, 0).unwrap();
        assert!(store
            .try_mark_webhook_event("voice", "evt-1", now)
            .await
            .unwrap());
        assert!(!store
            .try_mark_webhook_event("voice", "evt-1", now)
            .await
            .unwrap());
        assert!(store
            .try_mark_webhook_event("email", "evt-1", now)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn corrupted_log_outcome_is_an_error() {
        let store = LibSqlStore::new_memory().await.unwrap();
        let enrollment_id = Uuid::new_v4();

        // Bypass the typed API to plant an outcome no release ever wrote.
        store
            .conn
            .execute(
                "INSERT INTO log_entries (id, enrollment_id, step_index, channel,
                     sender_email, recipient_id, status, timestamp)
                 VALUES (?1, ?2, 0, 'email', 'a@b.c', 'r-1', 'beamed_up',
                     '2026-07-06T10:00:00+00:00')",
                params![Uuid::new_v4().to_string(), enrollment_id.to_string()],
            )
            .await
            .unwrap();

        let result = store.list_log_for_enrollment(enrollment_id).await;
        assert!(matches!(result, Err(DatabaseError::Query(_))));
    }

    #[tokio::test]
    async fn sender_round_trip_preserves_window() {
        let store = LibSqlStore::new_memory().await.unwrap();
        let sender = Sender {
            email: "aaron@example.io".into(),
            name: "Aaron".into(),
            title: "Engineer".into(),
            phone: "555".into(),
            signature_rich: "<p>Aaron</p>".into(),
            signature_plain: "Aaron".into(),
            warmup: WarmupState {
                enabled: true,
                start_date: NaiveDate::from_ymd_opt(2026, 6, 1),
                ramp_key: "moderate".into(),
            },
            daily_cap: 40,
            on_hold: false,
            window: SendWindow {
                days: vec![Weekday::Fri, Weekday::Sat],
                start: NaiveTime::from_hms_opt(22, 0, 0).unwrap(),
                end: NaiveTime::from_hms_opt(2, 0, 0).unwrap(),
                timezone: chrono_tz::America::Denver,
            },
        };
        store.upsert_sender(&sender).await.unwrap();

        let loaded = store.get_sender("aaron@example.io").await.unwrap().unwrap();
        assert_eq!(loaded.window, sender.window);
        assert_eq!(loaded.warmup.ramp_key, "moderate");
        assert_eq!(loaded.warmup.start_date, sender.warmup.start_date);
        assert_eq!(loaded.daily_cap, 40);

        assert!(store.set_sender_hold("aaron@example.io", true).await.unwrap());
        let held = store.get_sender("aaron@example.io").await.unwrap().unwrap();
        assert!(held.on_hold);
        assert!(!store.set_sender_hold("nobody@x.y", true).await.unwrap());
    }

    #[tokio::test]
    async fn recipient_round_trip_preserves_attributes() {
        let store = LibSqlStore::new_memory().await.unwrap();
        let mut attributes = HashMap::new();
        attributes.insert("job_postings_count".to_string(), "3".to_string());

        let recipient = Recipient {
            id: "r-1".into(),
            first_name: "Mia".into(),
            last_name: "Chen".into(),
            email: "mia@acme.test".into(),
            title: "Director".into(),
            phone: Some("+18015550100".into()),
            network_url: None,
            company: "Acme".into(),
            industry: "Logistics".into(),
            attributes,
        };
        store.upsert_recipient(&recipient).await.unwrap();

        let loaded = store.get_recipient("r-1").await.unwrap().unwrap();
        assert_eq!(loaded.phone.as_deref(), Some("+18015550100"));
        assert_eq!(loaded.network_url, None);
        assert_eq!(loaded.attributes["job_postings_count"], "3");
    }

    #[tokio::test]
    async fn external_ref_lookup_finds_original_entry() {
        let store = LibSqlStore::new_memory().await.unwrap();
        let seq = sequence("a@b.c");
        store.create_sequence(&seq).await.unwrap();
        let now = Utc::now();
        let enrollment = Enrollment::new("r-1", seq.id, now);
        store.create_enrollment(&enrollment).await.unwrap();

        let entry = LogEntry::new(&enrollment, Channel::Call, "a@b.c", LogOutcome::Sent, now)
            .with_external_ref(Some("c-7".into()));
        store.append_log(&entry).await.unwrap();

        let found = store.find_log_by_external_ref("c-7").await.unwrap().unwrap();
        assert_eq!(found.enrollment_id, Some(enrollment.id));
        assert!(store.find_log_by_external_ref("c-8").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn template_round_trip() {
        let store = LibSqlStore::new_memory().await.unwrap();
        let template = EmailTemplate {
            key: "intro_v2".into(),
            subject: "Quick question, {{first_name}}".into(),
            body: "{{personalization_sentence}}\n\n{{pain_statement}}".into(),
        };
        store
            .upsert_template(&template, Utc.with_ymd_and_hms(2026, 7, 6, 10, 0, 0).unwrap())
            .await
            .unwrap();

        let loaded = store.get_template("intro_v2").await.unwrap().unwrap();
        assert_eq!(loaded.subject, template.subject);
        assert!(store.get_template("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn reset_failed_requires_failed_status() {
        let store = LibSqlStore::new_memory().await.unwrap();
        let seq = sequence("a@b.c");
        store.create_sequence(&seq).await.unwrap();
        let now = Utc::now();

        let mut enrollment = Enrollment::new("r-1", seq.id, now);
        store.create_enrollment(&enrollment).await.unwrap();

        // Not failed yet.
        assert!(!store.reset_failed_enrollment(enrollment.id, now).await.unwrap());

        enrollment.status = EnrollmentStatus::Failed;
        enrollment.attempts = 5;
        enrollment.last_error_kind = Some("permanent_failure".into());
        store.update_enrollment(&enrollment, None).await.unwrap();

        assert!(store.reset_failed_enrollment(enrollment.id, now).await.unwrap());
        let reset = store.get_enrollment(enrollment.id).await.unwrap().unwrap();
        assert_eq!(reset.status, EnrollmentStatus::Pending);
        assert_eq!(reset.attempts, 0);
        assert_eq!(reset.last_error_kind, None);
    }
}
