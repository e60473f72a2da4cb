//! Version-tracked database migrations for the libSQL backend.
//!
//! Each migration has a version number and SQL. `run_all()` checks the
//! current version and applies only the new ones sequentially.

use libsql::Connection;

use crate::error::DatabaseError;

/// A single migration step.
struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// All migrations in order. Add new versions to the end.
static MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    name: "initial_schema",
    sql: r#"
        CREATE TABLE IF NOT EXISTS inbound_events (
            account_id TEXT NOT NULL,
            event_id TEXT NOT NULL,
            sender_id TEXT NOT NULL,
            sender_handle TEXT,
            text TEXT,
            attachments TEXT NOT NULL DEFAULT '[]',
            kind TEXT NOT NULL DEFAULT 'message',
            received_at TEXT NOT NULL,
            created_at TEXT NOT NULL,
            PRIMARY KEY (account_id, event_id)
        );
        CREATE INDEX IF NOT EXISTS idx_events_received ON inbound_events(received_at);

        CREATE TABLE IF NOT EXISTS conversations (
            account_id TEXT NOT NULL,
            sender_id TEXT NOT NULL,
            first_message_at TEXT NOT NULL,
            last_message_at TEXT NOT NULL,
            PRIMARY KEY (account_id, sender_id)
        );

        CREATE TABLE IF NOT EXISTS conversation_messages (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            account_id TEXT NOT NULL,
            sender_id TEXT NOT NULL,
            role TEXT NOT NULL,
            content TEXT NOT NULL,
            timestamp TEXT NOT NULL,
            event_id TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_conv_messages
            ON conversation_messages(account_id, sender_id, timestamp);
        CREATE UNIQUE INDEX IF NOT EXISTS idx_conv_messages_event
            ON conversation_messages(account_id, sender_id, event_id)
            WHERE event_id IS NOT NULL;

        CREATE TABLE IF NOT EXISTS automation_rules (
            id TEXT PRIMARY KEY,
            account_id TEXT NOT NULL,
            name TEXT NOT NULL,
            is_active INTEGER NOT NULL DEFAULT 1,
            trigger_json TEXT NOT NULL,
            action_json TEXT NOT NULL,
            priority INTEGER NOT NULL DEFAULT 0
        );
        CREATE INDEX IF NOT EXISTS idx_rules_account
            ON automation_rules(account_id, is_active);

        CREATE TABLE IF NOT EXISTS leads (
            account_id TEXT NOT NULL,
            sender_id TEXT NOT NULL,
            sender_handle TEXT,
            tags TEXT NOT NULL DEFAULT '[]',
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            PRIMARY KEY (account_id, sender_id)
        );

        CREATE TABLE IF NOT EXISTS activity_logs (
            id TEXT PRIMARY KEY,
            account_id TEXT NOT NULL,
            sender_id TEXT NOT NULL,
            event_id TEXT NOT NULL,
            automation_id TEXT,
            incoming_message TEXT NOT NULL,
            outgoing_response TEXT,
            status TEXT NOT NULL DEFAULT 'pending',
            error_message TEXT,
            processing_time_ms INTEGER,
            ai_model TEXT,
            ai_tokens_used INTEGER,
            ai_cost TEXT,
            sentiment TEXT,
            platform_message_id TEXT,
            created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_activity_account
            ON activity_logs(account_id, created_at);

        CREATE TABLE IF NOT EXISTS queue_jobs (
            id TEXT PRIMARY KEY,
            kind TEXT NOT NULL,
            payload TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            attempts INTEGER NOT NULL DEFAULT 0,
            max_attempts INTEGER NOT NULL DEFAULT 3,
            visible_at TEXT NOT NULL,
            last_error TEXT,
            created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_jobs_claim
            ON queue_jobs(kind, status, visible_at);
    "#,
}];

/// Apply all pending migrations.
pub async fn run_all(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL
        )",
        (),
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("create _migrations: {e}")))?;

    let current = current_version(conn).await?;

    for migration in MIGRATIONS.iter().filter(|m| m.version > current) {
        conn.execute_batch(migration.sql)
            .await
            .map_err(|e| {
                DatabaseError::Migration(format!("apply {} (v{}): {e}", migration.name, migration.version))
            })?;
        conn.execute(
            "INSERT INTO _migrations (version, name, applied_at) VALUES (?1, ?2, ?3)",
            libsql::params![
                migration.version,
                migration.name,
                chrono::Utc::now().to_rfc3339()
            ],
        )
        .await
        .map_err(|e| DatabaseError::Migration(format!("record {}: {e}", migration.name)))?;
        tracing::info!(version = migration.version, name = migration.name, "Applied migration");
    }

    Ok(())
}

async fn current_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(|e| DatabaseError::Migration(format!("read version: {e}")))?;
    let row = rows
        .next()
        .await
        .map_err(|e| DatabaseError::Migration(format!("read version row: {e}")))?;
    match row {
        Some(row) => row
            .get::<i64>(0)
            .map_err(|e| DatabaseError::Migration(format!("decode version: {e}"))),
        None => Ok(0),
    }
}
