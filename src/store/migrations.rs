//! Version-tracked database migrations for the libSQL backend.
//!
//! Each migration has a version number and SQL. `run_migrations()` checks
//! the current version and applies only the new ones sequentially.

use libsql::Connection;

use crate::error::DatabaseError;

/// A single migration step.
struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// All migrations in order. Add new versions to the end.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "initial_schema",
        sql: r#"
            CREATE TABLE IF NOT EXISTS sequences (
                id TEXT PRIMARY KEY,
                campaign_id TEXT NOT NULL,
                name TEXT NOT NULL,
                sender_email TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_sequences_campaign ON sequences(campaign_id);

            CREATE TABLE IF NOT EXISTS sequence_steps (
                sequence_id TEXT NOT NULL REFERENCES sequences(id) ON DELETE CASCADE,
                step_index INTEGER NOT NULL,
                kind TEXT NOT NULL,
                payload_json TEXT NOT NULL,
                UNIQUE (sequence_id, step_index)
            );

            CREATE TABLE IF NOT EXISTS recipients (
                id TEXT PRIMARY KEY,
                first_name TEXT NOT NULL DEFAULT '',
                last_name TEXT NOT NULL DEFAULT '',
                email TEXT NOT NULL,
                title TEXT NOT NULL DEFAULT '',
                phone TEXT,
                network_url TEXT,
                company TEXT NOT NULL DEFAULT '',
                industry TEXT NOT NULL DEFAULT '',
                attributes_json TEXT NOT NULL DEFAULT '{}'
            );

            CREATE TABLE IF NOT EXISTS enrollments (
                id TEXT PRIMARY KEY,
                recipient_id TEXT NOT NULL,
                sequence_id TEXT NOT NULL,
                step_index INTEGER NOT NULL DEFAULT 0,
                due_at TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                attempts INTEGER NOT NULL DEFAULT 0,
                version INTEGER NOT NULL DEFAULT 0,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_enrollments_due ON enrollments(status, due_at);
            CREATE INDEX IF NOT EXISTS idx_enrollments_sequence ON enrollments(sequence_id);
            CREATE UNIQUE INDEX IF NOT EXISTS idx_enrollments_live
                ON enrollments(recipient_id, sequence_id)
                WHERE status IN ('pending', 'in_flight', 'waiting');

            CREATE TABLE IF NOT EXISTS log_entries (
                id TEXT PRIMARY KEY,
                enrollment_id TEXT,
                step_index INTEGER NOT NULL,
                channel TEXT NOT NULL,
                sender_email TEXT NOT NULL,
                recipient_id TEXT NOT NULL,
                status TEXT NOT NULL,
                external_ref TEXT,
                subject TEXT,
                timestamp TEXT NOT NULL,
                variant_tags_json TEXT NOT NULL DEFAULT '[]'
            );
            CREATE INDEX IF NOT EXISTS idx_log_entries_enrollment ON log_entries(enrollment_id);
            CREATE INDEX IF NOT EXISTS idx_log_entries_external_ref ON log_entries(external_ref);

            CREATE TABLE IF NOT EXISTS senders (
                email TEXT PRIMARY KEY,
                name TEXT NOT NULL DEFAULT '',
                title TEXT NOT NULL DEFAULT '',
                phone TEXT NOT NULL DEFAULT '',
                signature_rich TEXT NOT NULL DEFAULT '',
                signature_plain TEXT NOT NULL DEFAULT '',
                warmup_enabled INTEGER NOT NULL DEFAULT 0,
                warmup_start_date TEXT,
                ramp_key TEXT NOT NULL DEFAULT 'conservative',
                daily_cap INTEGER NOT NULL DEFAULT 50,
                on_hold INTEGER NOT NULL DEFAULT 0,
                window_days TEXT NOT NULL DEFAULT 'mon,tue,wed,thu,fri',
                window_start TEXT NOT NULL DEFAULT '09:00',
                window_end TEXT NOT NULL DEFAULT '17:00',
                window_tz TEXT NOT NULL DEFAULT 'UTC'
            );

            CREATE TABLE IF NOT EXISTS warmup_counts (
                sender_email TEXT NOT NULL,
                date TEXT NOT NULL,
                count INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (sender_email, date)
            );
        "#,
    },
    Migration {
        version: 2,
        name: "webhook_dedupe",
        sql: r#"
            CREATE TABLE IF NOT EXISTS webhook_events (
                provider TEXT NOT NULL,
                event_id TEXT NOT NULL,
                received_at TEXT NOT NULL DEFAULT (datetime('now')),
                PRIMARY KEY (provider, event_id)
            );
        "#,
    },
    Migration {
        version: 3,
        name: "templates_and_last_error",
        sql: r#"
            CREATE TABLE IF NOT EXISTS email_templates (
                key TEXT PRIMARY KEY,
                subject TEXT NOT NULL,
                body TEXT NOT NULL,
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            ALTER TABLE enrollments ADD COLUMN last_error_kind TEXT;
            ALTER TABLE enrollments ADD COLUMN last_error_message TEXT;
        "#,
    },
];

/// Run all pending migrations against the given connection.
///
/// Creates the `_migrations` table if it doesn't exist.
pub async fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        (),
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to create _migrations table: {e}")))?;

    let current_version = get_current_version(conn).await?;

    for migration in MIGRATIONS {
        if migration.version > current_version {
            tracing::info!(
                version = migration.version,
                name = migration.name,
                "Applying migration"
            );
            conn.execute_batch(migration.sql).await.map_err(|e| {
                DatabaseError::Migration(format!(
                    "Migration V{} ({}) failed: {e}",
                    migration.version, migration.name
                ))
            })?;
            conn.execute(
                "INSERT OR IGNORE INTO _migrations (version, name) VALUES (?1, ?2)",
                libsql::params![migration.version, migration.name],
            )
            .await
            .map_err(|e| {
                DatabaseError::Migration(format!(
                    "Failed to record migration V{}: {e}",
                    migration.version
                ))
            })?;
        }
    }

    Ok(())
}

/// Get the highest applied migration version, or 0 if none.
async fn get_current_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to query migration version: {e}")))?;

    let row = rows
        .next()
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to read migration version: {e}")))?;

    match row {
        Some(row) => {
            let version: i64 = row.get(0).map_err(|e| {
                DatabaseError::Migration(format!("Failed to parse migration version: {e}"))
            })?;
            Ok(version)
        }
        None => Ok(0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_conn() -> Connection {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .unwrap();
        db.connect().unwrap()
    }

    #[tokio::test]
    async fn migrations_create_all_tables() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();

        for table in &[
            "sequences",
            "sequence_steps",
            "recipients",
            "enrollments",
            "log_entries",
            "senders",
            "warmup_counts",
            "webhook_events",
            "email_templates",
            "_migrations",
        ] {
            let mut rows = conn
                .query(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name=?1",
                    libsql::params![*table],
                )
                .await
                .unwrap();
            let row = rows.next().await.unwrap().unwrap();
            let count: i64 = row.get(0).unwrap();
            assert_eq!(count, 1, "Table '{}' should exist", table);
        }
    }

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();
        run_migrations(&conn).await.unwrap();

        let version = get_current_version(&conn).await.unwrap();
        assert_eq!(version, 3);
    }

    #[tokio::test]
    async fn live_enrollment_index_enforces_uniqueness() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();

        conn.execute(
            "INSERT INTO enrollments (id, recipient_id, sequence_id, due_at, status, updated_at)
             VALUES ('e1', 'r1', 's1', '2026-01-01T00:00:00Z', 'pending', '2026-01-01T00:00:00Z')",
            (),
        )
        .await
        .unwrap();

        // Second live row for the same pair must violate the partial index.
        let dup = conn
            .execute(
                "INSERT INTO enrollments (id, recipient_id, sequence_id, due_at, status, updated_at)
                 VALUES ('e2', 'r1', 's1', '2026-01-01T00:00:00Z', 'waiting', '2026-01-01T00:00:00Z')",
                (),
            )
            .await;
        assert!(dup.is_err());

        // A completed row does not count as live.
        conn.execute(
            "INSERT INTO enrollments (id, recipient_id, sequence_id, due_at, status, updated_at)
             VALUES ('e3', 'r1', 's1', '2026-01-01T00:00:00Z', 'completed', '2026-01-01T00:00:00Z')",
            (),
        )
        .await
        .unwrap();
    }
}
