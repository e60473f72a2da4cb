//! libSQL backend — async `Database` trait implementation.
//!
//! Supports local file and in-memory databases. A single connection is
//! reused for all operations; `libsql::Connection` is `Send + Sync` and
//! safe for concurrent async use.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, Row, params};
use serde_json::Value;
use tracing::info;
use uuid::Uuid;

use crate::activity::{ActivityLog, ActivityStatus, ActivityUpdate};
use crate::error::DatabaseError;
use crate::event::{EventKind, InboundEvent};
use crate::queue::{JobKind, JobStatus, QueueJob};
use crate::rules::model::AutomationRule;
use crate::store::migrations;
use crate::store::traits::{ConversationMessage, ConversationMeta, Database};

/// libSQL database backend.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
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

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
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

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        Ok(backend)
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }
}

#[cfg(test)]
impl LibSqlBackend {
    /// Run arbitrary SQL, for tests that need to break the schema.
    pub(crate) async fn execute_raw(&self, sql: &str) {
        self.conn().execute(sql, ()).await.unwrap();
    }
}

// ── Helper functions ────────────────────────────────────────────────

fn query_err(e: libsql::Error) -> DatabaseError {
    DatabaseError::Query(e.to_string())
}

/// Parse an RFC 3339 datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn parse_uuid(s: &str) -> Result<Uuid, DatabaseError> {
    Uuid::parse_str(s).map_err(|e| DatabaseError::Serialization(format!("bad uuid '{s}': {e}")))
}

/// Map a row to an InboundEvent.
///
/// Column order: 0:account_id, 1:event_id, 2:sender_id, 3:sender_handle,
/// 4:text, 5:attachments, 6:kind, 7:received_at
fn map_event(row: &Row) -> Result<InboundEvent, DatabaseError> {
    let attachments_json: String = row.get(5).map_err(query_err)?;
    let attachments = serde_json::from_str(&attachments_json)
        .map_err(|e| DatabaseError::Serialization(format!("attachments: {e}")))?;
    let kind: String = row.get(6).map_err(query_err)?;
    let received_at: String = row.get(7).map_err(query_err)?;
    Ok(InboundEvent {
        account_id: row.get(0).map_err(query_err)?,
        event_id: row.get(1).map_err(query_err)?,
        sender_id: row.get(2).map_err(query_err)?,
        sender_handle: row.get(3).map_err(query_err)?,
        text: row.get(4).map_err(query_err)?,
        attachments,
        kind: EventKind::parse(&kind),
        received_at: parse_datetime(&received_at),
    })
}

/// Map a row to a QueueJob.
///
/// Column order: 0:id, 1:kind, 2:payload, 3:status, 4:attempts,
/// 5:max_attempts, 6:visible_at, 7:last_error, 8:created_at
fn map_job(row: &Row) -> Result<QueueJob, DatabaseError> {
    let id: String = row.get(0).map_err(query_err)?;
    let kind: String = row.get(1).map_err(query_err)?;
    let payload: String = row.get(2).map_err(query_err)?;
    let status: String = row.get(3).map_err(query_err)?;
    let visible_at: String = row.get(6).map_err(query_err)?;
    let created_at: String = row.get(8).map_err(query_err)?;
    Ok(QueueJob {
        id: parse_uuid(&id)?,
        kind: JobKind::parse(&kind)
            .ok_or_else(|| DatabaseError::Serialization(format!("unknown job kind '{kind}'")))?,
        payload: serde_json::from_str(&payload)
            .map_err(|e| DatabaseError::Serialization(format!("job payload: {e}")))?,
        status: JobStatus::parse(&status),
        attempts: row.get::<i64>(4).map_err(query_err)? as u32,
        max_attempts: row.get::<i64>(5).map_err(query_err)? as u32,
        visible_at: parse_datetime(&visible_at),
        last_error: row.get(7).map_err(query_err)?,
        created_at: parse_datetime(&created_at),
    })
}

/// Map a row to an ActivityLog.
///
/// Column order: 0:id, 1:account_id, 2:sender_id, 3:event_id,
/// 4:automation_id, 5:incoming_message, 6:outgoing_response, 7:status,
/// 8:error_message, 9:processing_time_ms, 10:ai_model, 11:ai_tokens_used,
/// 12:ai_cost, 13:sentiment, 14:platform_message_id, 15:created_at
fn map_activity(row: &Row) -> Result<ActivityLog, DatabaseError> {
    let id: String = row.get(0).map_err(query_err)?;
    let automation_id: Option<String> = row.get(4).map_err(query_err)?;
    let status: String = row.get(7).map_err(query_err)?;
    let ai_cost: Option<String> = row.get(12).map_err(query_err)?;
    let created_at: String = row.get(15).map_err(query_err)?;
    Ok(ActivityLog {
        id: parse_uuid(&id)?,
        account_id: row.get(1).map_err(query_err)?,
        sender_id: row.get(2).map_err(query_err)?,
        event_id: row.get(3).map_err(query_err)?,
        automation_id: automation_id.as_deref().map(parse_uuid).transpose()?,
        incoming_message: row.get(5).map_err(query_err)?,
        outgoing_response: row.get(6).map_err(query_err)?,
        status: ActivityStatus::parse(&status),
        error_message: row.get(8).map_err(query_err)?,
        processing_time_ms: row.get(9).map_err(query_err)?,
        ai_model: row.get(10).map_err(query_err)?,
        ai_tokens_used: row.get(11).map_err(query_err)?,
        ai_cost: ai_cost
            .as_deref()
            .map(|s| {
                s.parse()
                    .map_err(|e| DatabaseError::Serialization(format!("ai_cost: {e}")))
            })
            .transpose()?,
        sentiment: row.get(13).map_err(query_err)?,
        platform_message_id: row.get(14).map_err(query_err)?,
        created_at: parse_datetime(&created_at),
    })
}

const JOB_COLUMNS: &str =
    "id, kind, payload, status, attempts, max_attempts, visible_at, last_error, created_at";

const ACTIVITY_COLUMNS: &str = "id, account_id, sender_id, event_id, automation_id, \
     incoming_message, outgoing_response, status, error_message, processing_time_ms, \
     ai_model, ai_tokens_used, ai_cost, sentiment, platform_message_id, created_at";

#[async_trait]
impl Database for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        migrations::run_all(self.conn()).await
    }

    // ── Inbound events ──────────────────────────────────────────────

    async fn ingest_event(
        &self,
        event: &InboundEvent,
        job_kind: JobKind,
        job_payload: &Value,
        job_max_attempts: u32,
    ) -> Result<bool, DatabaseError> {
        let attachments = serde_json::to_string(&event.attachments)
            .map_err(|e| DatabaseError::Serialization(format!("attachments: {e}")))?;
        let payload = serde_json::to_string(job_payload)
            .map_err(|e| DatabaseError::Serialization(format!("job payload: {e}")))?;
        let now = Utc::now().to_rfc3339();

        let tx = self
            .conn()
            .transaction()
            .await
            .map_err(|e| DatabaseError::Query(format!("begin: {e}")))?;

        let inserted = tx
            .execute(
                "INSERT OR IGNORE INTO inbound_events
                 (account_id, event_id, sender_id, sender_handle, text, attachments, kind, received_at, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    event.account_id.as_str(),
                    event.event_id.as_str(),
                    event.sender_id.as_str(),
                    event.sender_handle.clone(),
                    event.text.clone(),
                    attachments,
                    event.kind.as_str(),
                    event.received_at.to_rfc3339(),
                    now.clone()
                ],
            )
            .await
            .map_err(query_err)?;

        if inserted == 0 {
            tx.rollback()
                .await
                .map_err(|e| DatabaseError::Query(format!("rollback: {e}")))?;
            return Ok(false);
        }

        tx.execute(
            "INSERT INTO queue_jobs (id, kind, payload, status, attempts, max_attempts, visible_at, created_at)
             VALUES (?1, ?2, ?3, 'pending', 0, ?4, ?5, ?6)",
            params![
                Uuid::new_v4().to_string(),
                job_kind.as_str(),
                payload,
                job_max_attempts as i64,
                now.clone(),
                now
            ],
        )
        .await
        .map_err(query_err)?;

        tx.commit()
            .await
            .map_err(|e| DatabaseError::Query(format!("commit: {e}")))?;
        Ok(true)
    }

    async fn get_event(
        &self,
        account_id: &str,
        event_id: &str,
    ) -> Result<Option<InboundEvent>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT account_id, event_id, sender_id, sender_handle, text, attachments, kind, received_at
                 FROM inbound_events WHERE account_id = ?1 AND event_id = ?2",
                params![account_id, event_id],
            )
            .await
            .map_err(query_err)?;
        match rows.next().await.map_err(query_err)? {
            Some(row) => Ok(Some(map_event(&row)?)),
            None => Ok(None),
        }
    }

    async fn prune_events(&self, keep_days: u32) -> Result<usize, DatabaseError> {
        let cutoff = (Utc::now() - chrono::Duration::days(keep_days as i64)).to_rfc3339();
        let removed = self
            .conn()
            .execute(
                "DELETE FROM inbound_events WHERE received_at < ?1",
                params![cutoff],
            )
            .await
            .map_err(query_err)?;
        Ok(removed as usize)
    }

    // ── Conversations ───────────────────────────────────────────────

    async fn append_conversation_message(
        &self,
        account_id: &str,
        sender_id: &str,
        role: &str,
        content: &str,
        timestamp: DateTime<Utc>,
        event_id: Option<&str>,
    ) -> Result<bool, DatabaseError> {
        let ts = timestamp.to_rfc3339();
        let tx = self
            .conn()
            .transaction()
            .await
            .map_err(|e| DatabaseError::Query(format!("begin: {e}")))?;

        // OR IGNORE collides with the unique event index, so an event's
        // message lands at most once regardless of how often the attempt
        // is replayed.
        let inserted = tx
            .execute(
                "INSERT OR IGNORE INTO conversation_messages
                 (account_id, sender_id, role, content, timestamp, event_id)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    account_id,
                    sender_id,
                    role,
                    content,
                    ts.clone(),
                    event_id.map(str::to_string)
                ],
            )
            .await
            .map_err(query_err)?;

        if inserted == 0 {
            tx.rollback()
                .await
                .map_err(|e| DatabaseError::Query(format!("rollback: {e}")))?;
            return Ok(false);
        }

        tx.execute(
            "INSERT INTO conversations (account_id, sender_id, first_message_at, last_message_at)
             VALUES (?1, ?2, ?3, ?3)
             ON CONFLICT (account_id, sender_id) DO UPDATE SET
                 first_message_at = MIN(first_message_at, excluded.first_message_at),
                 last_message_at = MAX(last_message_at, excluded.last_message_at)",
            params![account_id, sender_id, ts],
        )
        .await
        .map_err(query_err)?;

        tx.commit()
            .await
            .map_err(|e| DatabaseError::Query(format!("commit: {e}")))?;
        Ok(true)
    }

    async fn count_inbound_messages(
        &self,
        account_id: &str,
        sender_id: &str,
    ) -> Result<usize, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT COUNT(*) FROM conversation_messages
                 WHERE account_id = ?1 AND sender_id = ?2 AND role = 'user'",
                params![account_id, sender_id],
            )
            .await
            .map_err(query_err)?;
        match rows.next().await.map_err(query_err)? {
            Some(row) => Ok(row.get::<i64>(0).map_err(query_err)? as usize),
            None => Ok(0),
        }
    }

    async fn list_conversation_messages(
        &self,
        account_id: &str,
        sender_id: &str,
        limit: usize,
    ) -> Result<Vec<ConversationMessage>, DatabaseError> {
        // Window of the most recent `limit` by timestamp, returned oldest
        // first so callers can feed it straight into an AI context.
        let mut rows = self
            .conn()
            .query(
                "SELECT role, content, timestamp FROM (
                     SELECT role, content, timestamp, id FROM conversation_messages
                     WHERE account_id = ?1 AND sender_id = ?2
                     ORDER BY timestamp DESC, id DESC LIMIT ?3
                 ) ORDER BY timestamp ASC, id ASC",
                params![account_id, sender_id, limit as i64],
            )
            .await
            .map_err(query_err)?;

        let mut messages = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err)? {
            let timestamp: String = row.get(2).map_err(query_err)?;
            messages.push(ConversationMessage {
                role: row.get(0).map_err(query_err)?,
                content: row.get(1).map_err(query_err)?,
                timestamp: parse_datetime(&timestamp),
            });
        }
        Ok(messages)
    }

    async fn get_conversation(
        &self,
        account_id: &str,
        sender_id: &str,
    ) -> Result<Option<ConversationMeta>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT first_message_at, last_message_at FROM conversations
                 WHERE account_id = ?1 AND sender_id = ?2",
                params![account_id, sender_id],
            )
            .await
            .map_err(query_err)?;
        match rows.next().await.map_err(query_err)? {
            Some(row) => {
                let first: String = row.get(0).map_err(query_err)?;
                let last: String = row.get(1).map_err(query_err)?;
                Ok(Some(ConversationMeta {
                    account_id: account_id.to_string(),
                    sender_id: sender_id.to_string(),
                    first_message_at: parse_datetime(&first),
                    last_message_at: parse_datetime(&last),
                }))
            }
            None => Ok(None),
        }
    }

    // ── Automation rules ────────────────────────────────────────────

    async fn find_active_rules(
        &self,
        account_id: &str,
    ) -> Result<Vec<AutomationRule>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id, account_id, name, is_active, trigger_json, action_json, priority
                 FROM automation_rules WHERE account_id = ?1 AND is_active = 1",
                params![account_id],
            )
            .await
            .map_err(query_err)?;

        let mut rules = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err)? {
            let id: String = row.get(0).map_err(query_err)?;
            let trigger_json: String = row.get(4).map_err(query_err)?;
            let action_json: String = row.get(5).map_err(query_err)?;
            rules.push(AutomationRule {
                id: parse_uuid(&id)?,
                account_id: row.get(1).map_err(query_err)?,
                name: row.get(2).map_err(query_err)?,
                is_active: row.get::<i64>(3).map_err(query_err)? != 0,
                trigger: serde_json::from_str(&trigger_json)
                    .map_err(|e| DatabaseError::Serialization(format!("trigger: {e}")))?,
                action: serde_json::from_str(&action_json)
                    .map_err(|e| DatabaseError::Serialization(format!("action: {e}")))?,
                priority: row.get(6).map_err(query_err)?,
            });
        }
        Ok(rules)
    }

    async fn upsert_rule(&self, rule: &AutomationRule) -> Result<(), DatabaseError> {
        let trigger = serde_json::to_string(&rule.trigger)
            .map_err(|e| DatabaseError::Serialization(format!("trigger: {e}")))?;
        let action = serde_json::to_string(&rule.action)
            .map_err(|e| DatabaseError::Serialization(format!("action: {e}")))?;
        self.conn()
            .execute(
                "INSERT OR REPLACE INTO automation_rules
                 (id, account_id, name, is_active, trigger_json, action_json, priority)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    rule.id.to_string(),
                    rule.account_id.as_str(),
                    rule.name.as_str(),
                    rule.is_active as i64,
                    trigger,
                    action,
                    rule.priority
                ],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }

    // ── Leads / tags ────────────────────────────────────────────────

    async fn save_lead(
        &self,
        account_id: &str,
        sender_id: &str,
        sender_handle: Option<&str>,
        tags: &[String],
    ) -> Result<(), DatabaseError> {
        let existing = self.get_user_tags(account_id, sender_id).await?;
        let merged = merge_tags(&existing, tags);
        let tags_json = serde_json::to_string(&merged)
            .map_err(|e| DatabaseError::Serialization(format!("tags: {e}")))?;
        let now = Utc::now().to_rfc3339();
        self.conn()
            .execute(
                "INSERT INTO leads (account_id, sender_id, sender_handle, tags, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?5)
                 ON CONFLICT (account_id, sender_id) DO UPDATE SET
                     sender_handle = COALESCE(excluded.sender_handle, sender_handle),
                     tags = excluded.tags,
                     updated_at = excluded.updated_at",
                params![
                    account_id,
                    sender_id,
                    sender_handle.map(str::to_string),
                    tags_json,
                    now
                ],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }

    async fn tag_user(
        &self,
        account_id: &str,
        sender_id: &str,
        tags: &[String],
    ) -> Result<(), DatabaseError> {
        self.save_lead(account_id, sender_id, None, tags).await
    }

    async fn get_user_tags(
        &self,
        account_id: &str,
        sender_id: &str,
    ) -> Result<Vec<String>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT tags FROM leads WHERE account_id = ?1 AND sender_id = ?2",
                params![account_id, sender_id],
            )
            .await
            .map_err(query_err)?;
        match rows.next().await.map_err(query_err)? {
            Some(row) => {
                let tags_json: String = row.get(0).map_err(query_err)?;
                serde_json::from_str(&tags_json)
                    .map_err(|e| DatabaseError::Serialization(format!("tags: {e}")))
            }
            None => Ok(Vec::new()),
        }
    }

    // ── Activity log ────────────────────────────────────────────────

    async fn insert_activity(&self, log: &ActivityLog) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO activity_logs
                 (id, account_id, sender_id, event_id, automation_id, incoming_message,
                  outgoing_response, status, error_message, processing_time_ms,
                  ai_model, ai_tokens_used, ai_cost, sentiment, platform_message_id, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
                params![
                    log.id.to_string(),
                    log.account_id.as_str(),
                    log.sender_id.as_str(),
                    log.event_id.as_str(),
                    log.automation_id.map(|id| id.to_string()),
                    log.incoming_message.as_str(),
                    log.outgoing_response.clone(),
                    log.status.as_str(),
                    log.error_message.clone(),
                    log.processing_time_ms,
                    log.ai_model.clone(),
                    log.ai_tokens_used,
                    log.ai_cost.map(|c| c.to_string()),
                    log.sentiment.clone(),
                    log.platform_message_id.clone(),
                    log.created_at.to_rfc3339()
                ],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }

    async fn update_activity(
        &self,
        id: Uuid,
        update: &ActivityUpdate,
    ) -> Result<(), DatabaseError> {
        let changed = self
            .conn()
            .execute(
                "UPDATE activity_logs SET
                     status = COALESCE(?2, status),
                     automation_id = COALESCE(?3, automation_id),
                     outgoing_response = COALESCE(?4, outgoing_response),
                     error_message = COALESCE(?5, error_message),
                     processing_time_ms = COALESCE(?6, processing_time_ms),
                     ai_model = COALESCE(?7, ai_model),
                     ai_tokens_used = COALESCE(?8, ai_tokens_used),
                     ai_cost = COALESCE(?9, ai_cost),
                     sentiment = COALESCE(?10, sentiment),
                     platform_message_id = COALESCE(?11, platform_message_id)
                 WHERE id = ?1",
                params![
                    id.to_string(),
                    update.status.map(|s| s.as_str()),
                    update.automation_id.map(|a| a.to_string()),
                    update.outgoing_response.clone(),
                    update.error_message.clone(),
                    update.processing_time_ms,
                    update.ai_model.clone(),
                    update.ai_tokens_used,
                    update.ai_cost.map(|c| c.to_string()),
                    update.sentiment.clone(),
                    update.platform_message_id.clone()
                ],
            )
            .await
            .map_err(query_err)?;
        if changed == 0 {
            return Err(DatabaseError::NotFound {
                entity: "activity_log".into(),
                id: id.to_string(),
            });
        }
        Ok(())
    }

    async fn get_activity(&self, id: Uuid) -> Result<Option<ActivityLog>, DatabaseError> {
        let sql = format!("SELECT {ACTIVITY_COLUMNS} FROM activity_logs WHERE id = ?1");
        let mut rows = self
            .conn()
            .query(&sql, params![id.to_string()])
            .await
            .map_err(query_err)?;
        match rows.next().await.map_err(query_err)? {
            Some(row) => Ok(Some(map_activity(&row)?)),
            None => Ok(None),
        }
    }

    async fn find_pending_activity(
        &self,
        account_id: &str,
        event_id: &str,
    ) -> Result<Option<Uuid>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id FROM activity_logs
                 WHERE account_id = ?1 AND event_id = ?2 AND status = 'pending'
                 ORDER BY created_at DESC LIMIT 1",
                params![account_id, event_id],
            )
            .await
            .map_err(query_err)?;
        match rows.next().await.map_err(query_err)? {
            Some(row) => {
                let id: String = row.get(0).map_err(query_err)?;
                Ok(Some(parse_uuid(&id)?))
            }
            None => Ok(None),
        }
    }

    // ── Queue ───────────────────────────────────────────────────────

    async fn enqueue_job(
        &self,
        kind: JobKind,
        payload: &Value,
        max_attempts: u32,
        visible_at: DateTime<Utc>,
    ) -> Result<Uuid, DatabaseError> {
        let id = Uuid::new_v4();
        let payload = serde_json::to_string(payload)
            .map_err(|e| DatabaseError::Serialization(format!("job payload: {e}")))?;
        self.conn()
            .execute(
                "INSERT INTO queue_jobs (id, kind, payload, status, attempts, max_attempts, visible_at, created_at)
                 VALUES (?1, ?2, ?3, 'pending', 0, ?4, ?5, ?6)",
                params![
                    id.to_string(),
                    kind.as_str(),
                    payload,
                    max_attempts as i64,
                    visible_at.to_rfc3339(),
                    Utc::now().to_rfc3339()
                ],
            )
            .await
            .map_err(query_err)?;
        Ok(id)
    }

    async fn claim_job(
        &self,
        kind: JobKind,
        reclaim_at: DateTime<Utc>,
    ) -> Result<Option<QueueJob>, DatabaseError> {
        // Single-statement claim: pending jobs and in-flight jobs whose
        // visibility timeout lapsed are both claimable.
        let sql = format!(
            "UPDATE queue_jobs
             SET status = 'in_flight', attempts = attempts + 1, visible_at = ?1
             WHERE id = (
                 SELECT id FROM queue_jobs
                 WHERE kind = ?2 AND status IN ('pending', 'in_flight') AND visible_at <= ?3
                 ORDER BY visible_at ASC, created_at ASC LIMIT 1
             )
             RETURNING {JOB_COLUMNS}"
        );
        let mut rows = self
            .conn()
            .query(
                &sql,
                params![
                    reclaim_at.to_rfc3339(),
                    kind.as_str(),
                    Utc::now().to_rfc3339()
                ],
            )
            .await
            .map_err(query_err)?;
        match rows.next().await.map_err(query_err)? {
            Some(row) => Ok(Some(map_job(&row)?)),
            None => Ok(None),
        }
    }

    async fn finish_job(&self, id: Uuid) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE queue_jobs SET status = 'done' WHERE id = ?1",
                params![id.to_string()],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }

    async fn release_job(
        &self,
        id: Uuid,
        error: &str,
        visible_at: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE queue_jobs SET status = 'pending', last_error = ?2, visible_at = ?3
                 WHERE id = ?1",
                params![id.to_string(), error, visible_at.to_rfc3339()],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }

    async fn dead_letter_job(&self, id: Uuid, error: &str) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE queue_jobs SET status = 'dead', last_error = ?2 WHERE id = ?1",
                params![id.to_string(), error],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<QueueJob>, DatabaseError> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM queue_jobs WHERE id = ?1");
        let mut rows = self
            .conn()
            .query(&sql, params![id.to_string()])
            .await
            .map_err(query_err)?;
        match rows.next().await.map_err(query_err)? {
            Some(row) => Ok(Some(map_job(&row)?)),
            None => Ok(None),
        }
    }

    async fn count_jobs(&self, kind: JobKind, status: JobStatus) -> Result<usize, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT COUNT(*) FROM queue_jobs WHERE kind = ?1 AND status = ?2",
                params![kind.as_str(), status.as_str()],
            )
            .await
            .map_err(query_err)?;
        match rows.next().await.map_err(query_err)? {
            Some(row) => Ok(row.get::<i64>(0).map_err(query_err)? as usize),
            None => Ok(0),
        }
    }
}

/// Merge tag lists preserving order, dropping duplicates.
fn merge_tags(existing: &[String], new: &[String]) -> Vec<String> {
    let mut merged = existing.to_vec();
    for tag in new {
        if !merged.contains(tag) {
            merged.push(tag.clone());
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventKind;
    use serde_json::json;

    fn make_event(event_id: &str) -> InboundEvent {
        InboundEvent {
            event_id: event_id.into(),
            account_id: "acct_1".into(),
            sender_id: "user_9".into(),
            sender_handle: Some("@ana".into()),
            text: Some("hi there".into()),
            attachments: vec![],
            kind: EventKind::Message,
            received_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn ingest_is_idempotent_per_account() {
        let db = LibSqlBackend::new_memory().await.unwrap();
        let event = make_event("evt_1");
        let payload = json!({"account_id": "acct_1", "event_id": "evt_1"});

        assert!(db.ingest_event(&event, JobKind::ProcessMessage, &payload, 3).await.unwrap());
        // Redelivery: no second event, no second job
        assert!(!db.ingest_event(&event, JobKind::ProcessMessage, &payload, 3).await.unwrap());
        assert_eq!(
            db.count_jobs(JobKind::ProcessMessage, JobStatus::Pending).await.unwrap(),
            1
        );

        // Same event id on a different account is a different event
        let mut other = make_event("evt_1");
        other.account_id = "acct_2".into();
        assert!(db.ingest_event(&other, JobKind::ProcessMessage, &payload, 3).await.unwrap());
    }

    #[tokio::test]
    async fn event_round_trips() {
        let db = LibSqlBackend::new_memory().await.unwrap();
        let event = make_event("evt_rt");
        db.ingest_event(&event, JobKind::ProcessMessage, &json!({}), 3)
            .await
            .unwrap();

        let stored = db.get_event("acct_1", "evt_rt").await.unwrap().unwrap();
        assert_eq!(stored.sender_id, "user_9");
        assert_eq!(stored.sender_handle.as_deref(), Some("@ana"));
        assert_eq!(stored.kind, EventKind::Message);
        assert!(db.get_event("acct_1", "missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn conversation_messages_come_back_in_timestamp_order() {
        let db = LibSqlBackend::new_memory().await.unwrap();
        let base = Utc::now();

        // Insert out of true order: the later message lands first
        db.append_conversation_message("a", "s", "user", "second", base + chrono::Duration::seconds(5), None)
            .await
            .unwrap();
        db.append_conversation_message("a", "s", "user", "first", base, None)
            .await
            .unwrap();

        let messages = db.list_conversation_messages("a", "s", 10).await.unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].content, "first");
        assert_eq!(messages[1].content, "second");

        let meta = db.get_conversation("a", "s").await.unwrap().unwrap();
        assert_eq!(meta.first_message_at, messages[0].timestamp);
        assert_eq!(meta.last_message_at, messages[1].timestamp);
    }

    #[tokio::test]
    async fn inbound_count_ignores_assistant_messages() {
        let db = LibSqlBackend::new_memory().await.unwrap();
        let now = Utc::now();
        db.append_conversation_message("a", "s", "user", "hi", now, None).await.unwrap();
        db.append_conversation_message("a", "s", "assistant", "hello!", now, None).await.unwrap();
        assert_eq!(db.count_inbound_messages("a", "s").await.unwrap(), 1);
        assert_eq!(db.count_inbound_messages("a", "other").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn event_keyed_append_lands_at_most_once() {
        let db = LibSqlBackend::new_memory().await.unwrap();
        let now = Utc::now();

        assert!(
            db.append_conversation_message("a", "s", "user", "hi", now, Some("evt_1"))
                .await
                .unwrap()
        );
        // Replayed attempt: same event, no second message
        assert!(
            !db.append_conversation_message("a", "s", "user", "hi", now, Some("evt_1"))
                .await
                .unwrap()
        );
        assert_eq!(db.count_inbound_messages("a", "s").await.unwrap(), 1);

        // A different event from the same sender still appends
        assert!(
            db.append_conversation_message("a", "s", "user", "again", now, Some("evt_2"))
                .await
                .unwrap()
        );
        assert_eq!(db.count_inbound_messages("a", "s").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn lead_tags_merge() {
        let db = LibSqlBackend::new_memory().await.unwrap();
        db.save_lead("a", "s", Some("@ana"), &["hot".into()]).await.unwrap();
        db.tag_user("a", "s", &["vip".into(), "hot".into()]).await.unwrap();

        let tags = db.get_user_tags("a", "s").await.unwrap();
        assert_eq!(tags, vec!["hot".to_string(), "vip".to_string()]);
    }

    #[tokio::test]
    async fn activity_update_applies_terminal_fields() {
        let db = LibSqlBackend::new_memory().await.unwrap();
        let event = make_event("evt_act");
        let recorder_log = ActivityLog {
            id: Uuid::new_v4(),
            account_id: event.account_id.clone(),
            sender_id: event.sender_id.clone(),
            event_id: event.event_id.clone(),
            automation_id: None,
            incoming_message: "hi there".into(),
            outgoing_response: None,
            status: ActivityStatus::Pending,
            error_message: None,
            processing_time_ms: None,
            ai_model: None,
            ai_tokens_used: None,
            ai_cost: None,
            sentiment: None,
            platform_message_id: None,
            created_at: Utc::now(),
        };
        db.insert_activity(&recorder_log).await.unwrap();

        db.update_activity(
            recorder_log.id,
            &ActivityUpdate {
                status: Some(ActivityStatus::Success),
                outgoing_response: Some("Thanks!".into()),
                processing_time_ms: Some(42),
                ai_model: Some("claude-3-5-haiku-latest".into()),
                ai_tokens_used: Some(150),
                ai_cost: Some("0.000375".parse().unwrap()),
                platform_message_id: Some("mid.123".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let log = db.get_activity(recorder_log.id).await.unwrap().unwrap();
        assert_eq!(log.status, ActivityStatus::Success);
        assert_eq!(log.outgoing_response.as_deref(), Some("Thanks!"));
        assert_eq!(log.ai_tokens_used, Some(150));
        assert_eq!(log.ai_cost, Some("0.000375".parse().unwrap()));
        assert_eq!(log.platform_message_id.as_deref(), Some("mid.123"));
    }

    #[tokio::test]
    async fn claim_respects_visibility_and_reclaims_lapsed() {
        let db = LibSqlBackend::new_memory().await.unwrap();
        db.enqueue_job(JobKind::SendMessage, &json!({"n": 1}), 3, Utc::now())
            .await
            .unwrap();

        // First claim holds the job for an hour
        let far = Utc::now() + chrono::Duration::hours(1);
        let job = db.claim_job(JobKind::SendMessage, far).await.unwrap().unwrap();
        assert_eq!(job.attempts, 1);
        assert_eq!(job.status, JobStatus::InFlight);

        // While held, nothing is claimable
        assert!(db.claim_job(JobKind::SendMessage, far).await.unwrap().is_none());

        // Simulate a lapsed visibility timeout: push visible_at into the past
        db.release_job(job.id, "worker stalled", Utc::now() - chrono::Duration::seconds(1))
            .await
            .unwrap();
        let reclaimed = db.claim_job(JobKind::SendMessage, far).await.unwrap().unwrap();
        assert_eq!(reclaimed.id, job.id);
        assert_eq!(reclaimed.attempts, 2);
    }

    #[tokio::test]
    async fn local_database_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dm.db");
        {
            let db = LibSqlBackend::new_local(&path).await.unwrap();
            db.ingest_event(&make_event("evt_persist"), JobKind::ProcessMessage, &json!({}), 3)
                .await
                .unwrap();
        }
        let db = LibSqlBackend::new_local(&path).await.unwrap();
        assert!(db.get_event("acct_1", "evt_persist").await.unwrap().is_some());
    }

    #[test]
    fn merge_tags_dedupes() {
        let merged = merge_tags(&["a".into(), "b".into()], &["b".into(), "c".into()]);
        assert_eq!(merged, vec!["a".to_string(), "b".to_string(), "c".to_string()]);
    }
}
