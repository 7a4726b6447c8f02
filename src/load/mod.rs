//! Loading phase
//!
//! Batched inserts into PostgreSQL with two strategies: bulk multi-row
//! statements for the high-volume tables, falling back to row-at-a-time
//! (under savepoints) when a batch trips a constraint, and individual
//! statements for the low-volume archive and side tables. Each
//! conversation's messages are written in their own transaction, so a
//! mid-run failure never leaves a conversation half-loaded.

pub mod schema;

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Acquire, Postgres};

use crate::config::DatabaseConfig;
use crate::error::{Error, Result};
use crate::models::{RawExport, TransformedConversation, TransformedExport, TransformedMessage};
use crate::transform::content;
use crate::transform::handlers::StructuredData;

/// Reconnect attempts after a lost connection, per the backoff schedule
const RECONNECT_ATTEMPTS: u32 = 3;
const RECONNECT_BASE_DELAY: Duration = Duration::from_millis(500);

/// Default per-statement timeout in seconds
const DEFAULT_STATEMENT_TIMEOUT_SECS: u64 = 60;

const MESSAGE_COLUMNS: [&str; 9] = [
    "conversation_id",
    "timestamp",
    "sender_id",
    "sender_name",
    "message_type",
    "raw_content",
    "cleaned_content",
    "is_edited",
    "structured_data",
];

const CONVERSATION_COLUMNS: [&str; 6] = [
    "conversation_id",
    "display_name",
    "archive_id",
    "first_message_time",
    "last_message_time",
    "message_count",
];

const CONVERSATION_UPSERT: &str = "ON CONFLICT (conversation_id) DO UPDATE SET
        display_name = EXCLUDED.display_name,
        archive_id = EXCLUDED.archive_id,
        first_message_time = EXCLUDED.first_message_time,
        last_message_time = EXCLUDED.last_message_time,
        message_count = EXCLUDED.message_count,
        updated_at = now()";

/// Everything the loader needs for a full (non-streaming) load.
///
/// The orchestrator reads `file_path` out of the context and passes it in
/// here, and folds the returned report back; the loader itself never
/// touches the context.
pub struct LoadRequest<'a> {
    pub raw: &'a RawExport,
    pub transformed: &'a TransformedExport,
    pub file_path: Option<&'a str>,
}

/// Inputs for registering (or re-registering) an archive row
pub struct ArchiveRegistration<'a> {
    pub user_id: &'a str,
    pub export_date: &'a str,
    pub raw_data: Value,
    pub file_path: Option<&'a str>,
}

/// Counts and non-fatal incidents from a load operation
#[derive(Debug, Clone, Default)]
pub struct LoadReport {
    pub archive_id: i64,
    pub conversations: u64,
    pub messages: u64,
    pub skipped_rows: u64,
    pub incidents: Vec<String>,
}

#[derive(Debug, Default)]
struct ConversationLoadStats {
    inserted: u64,
    skipped: u64,
    incidents: Vec<String>,
}

/// Loading phase component
pub struct Loader {
    pool: Option<PgPool>,
    config: Option<DatabaseConfig>,
    batch_size: usize,
    statement_timeout_secs: u64,
}

impl Loader {
    pub fn new(batch_size: usize) -> Self {
        Self {
            pool: None,
            config: None,
            batch_size: batch_size.max(1),
            statement_timeout_secs: DEFAULT_STATEMENT_TIMEOUT_SECS,
        }
    }

    pub fn with_statement_timeout(mut self, seconds: u64) -> Self {
        self.statement_timeout_secs = seconds;
        self
    }

    /// Connect and make sure the schema exists and is a version we know.
    pub async fn connect(&mut self, config: &DatabaseConfig) -> Result<()> {
        self.config = Some(config.clone());

        let mut delay = RECONNECT_BASE_DELAY;
        let mut attempt = 0;
        let pool = loop {
            match try_connect(config, self.statement_timeout_secs).await {
                Ok(pool) => break pool,
                Err(e) if attempt < RECONNECT_ATTEMPTS => {
                    attempt += 1;
                    tracing::warn!(attempt, error = %e, "Database connection failed; retrying");
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
                Err(e) => {
                    return Err(Error::Load(format!(
                        "database connection failed after {RECONNECT_ATTEMPTS} retries: {e}"
                    )))
                }
            }
        };

        ensure_schema(&pool).await?;
        self.pool = Some(pool);
        tracing::info!(host = %config.host, dbname = %config.dbname, "Database connected");
        Ok(())
    }

    pub async fn close(&mut self) {
        if let Some(pool) = self.pool.take() {
            pool.close().await;
            tracing::info!("Database connection closed");
        }
    }

    fn pool(&self) -> Result<&PgPool> {
        self.pool
            .as_ref()
            .ok_or_else(|| Error::Load("loader is not connected".to_string()))
    }

    /// Load a whole transformed export: archive, conversations, then each
    /// conversation's messages in its own transaction.
    pub async fn load(&mut self, request: LoadRequest<'_>) -> Result<LoadReport> {
        let raw_blob = serde_json::to_value(request.raw)?;
        let archive_id = self
            .register_archive(ArchiveRegistration {
                user_id: &request.transformed.metadata.user_id,
                export_date: &request.transformed.metadata.export_date,
                raw_data: raw_blob,
                file_path: request.file_path,
            })
            .await?;

        let mut report = LoadReport {
            archive_id,
            ..Default::default()
        };

        let conversations: Vec<&TransformedConversation> =
            request.transformed.conversations.values().collect();

        for batch in conversations.chunks(self.batch_size) {
            self.insert_conversation_batch(archive_id, batch).await?;
            report.conversations += batch.len() as u64;
        }

        for conversation in conversations.iter().copied() {
            let stats = self.load_conversation_with_retry(conversation).await?;
            report.messages += stats.inserted;
            report.skipped_rows += stats.skipped;
            report.incidents.extend(stats.incidents);
        }

        tracing::info!(
            archive_id,
            conversations = report.conversations,
            messages = report.messages,
            "Load complete"
        );
        Ok(report)
    }

    /// Upsert the archive row for `(user_id, export_date)`. An existing row
    /// keeps its id; the raw blob and path columns are overwritten.
    pub async fn register_archive(
        &mut self,
        registration: ArchiveRegistration<'_>,
    ) -> Result<i64> {
        let export_date = content::parse_timestamp(registration.export_date)
            .map(|(_, _, instant)| instant)
            .ok_or_else(|| {
                Error::Load(format!(
                    "exportDate is not a timestamp: {}",
                    registration.export_date
                ))
            })?;

        let file_path = normalize_file_path(registration.file_path);
        let file_name = Path::new(&file_path)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| file_path.clone());
        let file_size = registration
            .file_path
            .and_then(|p| std::fs::metadata(p).ok())
            .map(|m| m.len() as i64)
            .unwrap_or(0);

        let (archive_id,): (i64,) = sqlx::query_as(
            "INSERT INTO archives (user_id, export_date, file_path, file_name, file_size, raw_data)
             VALUES ($1, $2, $3, $4, $5, $6)
             ON CONFLICT (user_id, export_date) DO UPDATE SET
                raw_data = EXCLUDED.raw_data,
                file_path = EXCLUDED.file_path,
                file_name = EXCLUDED.file_name,
                file_size = EXCLUDED.file_size
             RETURNING archive_id",
        )
        .bind(registration.user_id)
        .bind(export_date)
        .bind(&file_path)
        .bind(&file_name)
        .bind(file_size)
        .bind(&registration.raw_data)
        .fetch_one(self.pool()?)
        .await?;

        tracing::info!(
            archive_id,
            user_id = %registration.user_id,
            file_path = %file_path,
            "Archive registered"
        );
        Ok(archive_id)
    }

    /// Streaming entry point: one conversation, transactionally.
    pub async fn load_streaming_batch(
        &mut self,
        archive_id: i64,
        conversation: &TransformedConversation,
    ) -> Result<LoadReport> {
        self.insert_conversation_batch(archive_id, &[conversation])
            .await?;
        let stats = self.load_conversation_with_retry(conversation).await?;
        Ok(LoadReport {
            archive_id,
            conversations: 1,
            messages: stats.inserted,
            skipped_rows: stats.skipped,
            incidents: stats.incidents,
        })
    }

    /// Bulk-upsert a batch of conversation rows, falling back to
    /// one-at-a-time on a constraint error.
    async fn insert_conversation_batch(
        &self,
        archive_id: i64,
        batch: &[&TransformedConversation],
    ) -> Result<()> {
        let sql = schema::build_batch_insert(
            "conversations",
            &CONVERSATION_COLUMNS,
            batch.len(),
            CONVERSATION_UPSERT,
        );

        let mut query = sqlx::query(&sql);
        for conversation in batch.iter().copied() {
            query = bind_conversation(query, archive_id, conversation);
        }

        match query.execute(self.pool()?).await {
            Ok(_) => Ok(()),
            Err(e) if is_constraint_violation(&e) => {
                tracing::warn!(
                    error = %e,
                    "Conversation batch hit a constraint; inserting individually"
                );
                for conversation in batch.iter().copied() {
                    let single = schema::build_batch_insert(
                        "conversations",
                        &CONVERSATION_COLUMNS,
                        1,
                        CONVERSATION_UPSERT,
                    );
                    let query = bind_conversation(sqlx::query(&single), archive_id, conversation);
                    if let Err(e) = query.execute(self.pool()?).await {
                        if is_constraint_violation(&e) {
                            tracing::warn!(
                                conversation_id = %conversation.id,
                                error = %e,
                                "Skipping conversation row"
                            );
                        } else {
                            return Err(e.into());
                        }
                    }
                }
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Message loading for one conversation with the reconnect policy
    /// wrapped around it.
    async fn load_conversation_with_retry(
        &mut self,
        conversation: &TransformedConversation,
    ) -> Result<ConversationLoadStats> {
        let mut attempt = 0;
        let mut delay = RECONNECT_BASE_DELAY;

        loop {
            match self.load_conversation(conversation).await {
                Ok(stats) => return Ok(stats),
                Err(e) if is_connection_error(&e) => {
                    if attempt >= RECONNECT_ATTEMPTS {
                        return Err(Error::Load(format!(
                            "giving up on conversation {} after {RECONNECT_ATTEMPTS} reconnect attempts: {e}",
                            conversation.id
                        )));
                    }
                    attempt += 1;
                    tracing::warn!(
                        attempt,
                        conversation_id = %conversation.id,
                        error = %e,
                        "Database connection lost; reconnecting"
                    );
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                    if let Err(reconnect_err) = self.reconnect().await {
                        tracing::warn!(attempt, error = %reconnect_err, "Reconnect failed");
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn reconnect(&mut self) -> Result<()> {
        let config = self
            .config
            .clone()
            .ok_or_else(|| Error::Load("loader has no connection parameters".to_string()))?;
        let pool = try_connect(&config, self.statement_timeout_secs)
            .await
            .map_err(|e| Error::Load(format!("reconnect failed: {e}")))?;
        self.pool = Some(pool);
        Ok(())
    }

    async fn load_conversation(
        &self,
        conversation: &TransformedConversation,
    ) -> Result<ConversationLoadStats> {
        match self.load_conversation_bulk(conversation).await {
            Ok(stats) => Ok(stats),
            Err(e) if is_constraint_violation_err(&e) => {
                tracing::warn!(
                    conversation_id = %conversation.id,
                    error = %e,
                    "Bulk message insert hit a constraint; retrying rows individually"
                );
                self.load_conversation_individual(conversation).await
            }
            Err(e) => Err(e),
        }
    }

    /// Happy path: delete-then-bulk-insert inside one transaction.
    async fn load_conversation_bulk(
        &self,
        conversation: &TransformedConversation,
    ) -> Result<ConversationLoadStats> {
        let mut tx = self.pool()?.begin().await?;

        // Re-runs replace the conversation's messages; side tables follow
        // via ON DELETE CASCADE
        sqlx::query("DELETE FROM messages WHERE conversation_id = $1")
            .bind(&conversation.id)
            .execute(&mut *tx)
            .await?;

        let mut stats = ConversationLoadStats::default();

        for batch in conversation.messages.chunks(self.batch_size) {
            let sql = schema::build_batch_insert(
                "messages",
                &MESSAGE_COLUMNS,
                batch.len(),
                "RETURNING message_id",
            );

            let mut query = sqlx::query_scalar::<Postgres, i64>(&sql);
            for message in batch {
                query = bind_message(query, &conversation.id, message)?;
            }
            let ids: Vec<i64> = query.fetch_all(&mut *tx).await?;

            for (message_id, message) in ids.iter().zip(batch) {
                insert_side_tables(&mut tx, *message_id, &message.structured_data).await?;
            }
            stats.inserted += batch.len() as u64;
        }

        tx.commit().await?;
        Ok(stats)
    }

    /// Fallback: fresh transaction, one row per statement under a
    /// savepoint, so an offending row can be skipped while the rest of the
    /// conversation still commits atomically.
    async fn load_conversation_individual(
        &self,
        conversation: &TransformedConversation,
    ) -> Result<ConversationLoadStats> {
        let mut tx = self.pool()?.begin().await?;

        sqlx::query("DELETE FROM messages WHERE conversation_id = $1")
            .bind(&conversation.id)
            .execute(&mut *tx)
            .await?;

        let mut stats = ConversationLoadStats::default();
        let single_sql =
            schema::build_batch_insert("messages", &MESSAGE_COLUMNS, 1, "RETURNING message_id");

        for (index, message) in conversation.messages.iter().enumerate() {
            let mut savepoint = tx.begin().await?;

            let insert = async {
                let query = bind_message(
                    sqlx::query_scalar::<Postgres, i64>(&single_sql),
                    &conversation.id,
                    message,
                )?;
                let message_id: i64 = query.fetch_one(&mut *savepoint).await?;
                insert_side_tables(&mut savepoint, message_id, &message.structured_data).await?;
                Ok::<_, Error>(())
            }
            .await;

            match insert {
                Ok(()) => {
                    savepoint.commit().await?;
                    stats.inserted += 1;
                }
                Err(e) if is_constraint_violation_err(&e) => {
                    savepoint.rollback().await?;
                    stats.skipped += 1;
                    stats.incidents.push(format!(
                        "message {} in conversation {} violated a constraint: {}",
                        index, conversation.id, e
                    ));
                }
                Err(e) => return Err(e),
            }
        }

        tx.commit().await?;
        Ok(stats)
    }
}

async fn try_connect(
    config: &DatabaseConfig,
    statement_timeout_secs: u64,
) -> std::result::Result<PgPool, sqlx::Error> {
    let timeout_ms = statement_timeout_secs * 1000;
    PgPoolOptions::new()
        .max_connections(5)
        .after_connect(move |conn, _meta| {
            Box::pin(async move {
                sqlx::query(&format!("SET statement_timeout = {timeout_ms}"))
                    .execute(&mut *conn)
                    .await?;
                Ok(())
            })
        })
        .connect(&config.url())
        .await
}

async fn ensure_schema(pool: &PgPool) -> Result<()> {
    for statement in schema::CREATE_TABLES {
        sqlx::query(statement)
            .execute(pool)
            .await
            .map_err(|e| Error::Load(format!("schema creation failed: {e}")))?;
    }

    let existing: Option<(i32,)> = sqlx::query_as("SELECT version FROM schema_version LIMIT 1")
        .fetch_optional(pool)
        .await?;
    match existing {
        None => {
            sqlx::query("INSERT INTO schema_version (version) VALUES ($1)")
                .bind(schema::SCHEMA_VERSION)
                .execute(pool)
                .await?;
        }
        Some((version,)) if version == schema::SCHEMA_VERSION => {}
        Some((version,)) => {
            return Err(Error::Load(format!(
                "unsupported schema version {version}; this build understands {}",
                schema::SCHEMA_VERSION
            )));
        }
    }

    Ok(())
}

type PgQuery<'q> =
    sqlx::query::Query<'q, Postgres, sqlx::postgres::PgArguments>;
type PgScalar<'q, T> =
    sqlx::query::QueryScalar<'q, Postgres, T, sqlx::postgres::PgArguments>;

fn bind_conversation<'q>(
    query: PgQuery<'q>,
    archive_id: i64,
    conversation: &TransformedConversation,
) -> PgQuery<'q> {
    query
        .bind(conversation.id.clone())
        .bind(conversation.display_name.clone())
        .bind(archive_id)
        .bind(parse_optional_timestamp(conversation.first_message_time.as_deref()))
        .bind(parse_optional_timestamp(conversation.last_message_time.as_deref()))
        .bind(conversation.message_count as i32)
}

fn bind_message<'q>(
    query: PgScalar<'q, i64>,
    conversation_id: &str,
    message: &TransformedMessage,
) -> Result<PgScalar<'q, i64>> {
    let timestamp = message
        .parsed_timestamp
        .or_else(|| content::parse_timestamp(&message.timestamp).map(|(_, _, t)| t));
    let structured = serde_json::to_value(&message.structured_data)?;

    Ok(query
        .bind(conversation_id.to_string())
        .bind(timestamp)
        .bind(message.from_id.clone())
        .bind(message.from_name.clone())
        .bind(message.message_type.clone())
        .bind(message.raw_content.clone())
        .bind(message.cleaned_content.clone())
        .bind(message.is_edited)
        .bind(structured))
}

fn parse_optional_timestamp(raw: Option<&str>) -> Option<DateTime<Utc>> {
    raw.and_then(|s| content::parse_timestamp(s).map(|(_, _, instant)| instant))
}

/// Write the variant's side-table row(s), when the variant has one.
async fn insert_side_tables(
    tx: &mut sqlx::Transaction<'_, Postgres>,
    message_id: i64,
    structured: &StructuredData,
) -> Result<()> {
    match structured {
        StructuredData::Media {
            filename,
            filesize,
            filetype,
            url,
            thumbnail_url,
            width,
            height,
            duration,
            description,
        } => {
            sqlx::query(
                "INSERT INTO message_media
                 (message_id, filename, filesize, filetype, url, thumbnail_url,
                  width, height, duration, description)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
            )
            .bind(message_id)
            .bind(filename)
            .bind(filesize)
            .bind(filetype)
            .bind(url)
            .bind(thumbnail_url)
            .bind(width)
            .bind(height)
            .bind(duration)
            .bind(description)
            .execute(&mut **tx)
            .await?;
        }
        StructuredData::Poll { question, options } => {
            let (poll_id,): (i64,) = sqlx::query_as(
                "INSERT INTO message_poll (message_id, question) VALUES ($1, $2)
                 RETURNING poll_id",
            )
            .bind(message_id)
            .bind(question)
            .fetch_one(&mut **tx)
            .await?;

            for (order, option) in options.iter().enumerate() {
                sqlx::query(
                    "INSERT INTO message_poll_option (poll_id, option_text, display_order)
                     VALUES ($1, $2, $3)",
                )
                .bind(poll_id)
                .bind(option)
                .bind(order as i32)
                .execute(&mut **tx)
                .await?;
            }
        }
        StructuredData::Location {
            latitude,
            longitude,
            address,
        } => {
            sqlx::query(
                "INSERT INTO message_location (message_id, latitude, longitude, address)
                 VALUES ($1, $2, $3, $4)",
            )
            .bind(message_id)
            .bind(latitude)
            .bind(longitude)
            .bind(address)
            .execute(&mut **tx)
            .await?;
        }
        _ => {}
    }
    Ok(())
}

/// Normalize a source path to satisfy the `file_path LIKE '%.tar'` CHECK
/// constraint on the archives table.
pub fn normalize_file_path(file_path: Option<&str>) -> String {
    match file_path {
        Some(path) if path.to_ascii_lowercase().ends_with(".tar") => path.to_string(),
        Some(path) => {
            let normalized = {
                let as_path = Path::new(path);
                if as_path.extension().is_some() {
                    as_path.with_extension("tar").to_string_lossy().into_owned()
                } else {
                    format!("{path}.tar")
                }
            };
            tracing::warn!(
                original = %path,
                normalized = %normalized,
                "Modified file path to satisfy archive constraint"
            );
            normalized
        }
        None => {
            let synthesized = format!(
                "unknown_export_{}.tar",
                chrono::Local::now().format("%Y%m%d_%H%M%S")
            );
            tracing::warn!(
                file_path = %synthesized,
                "No file path available; using placeholder"
            );
            synthesized
        }
    }
}

fn is_constraint_violation(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db) => db
            .code()
            .map(|code| code.starts_with("23"))
            .unwrap_or(false),
        _ => false,
    }
}

fn is_constraint_violation_err(e: &Error) -> bool {
    match e {
        Error::Sql(sql) => is_constraint_violation(sql),
        _ => false,
    }
}

/// Connection-level failures that trigger the reconnect policy. Statement
/// timeouts (57014) escalate here too.
fn is_connection_error(e: &Error) -> bool {
    match e {
        Error::Sql(sqlx::Error::Io(_))
        | Error::Sql(sqlx::Error::PoolTimedOut)
        | Error::Sql(sqlx::Error::PoolClosed)
        | Error::Sql(sqlx::Error::WorkerCrashed) => true,
        Error::Sql(sqlx::Error::Database(db)) => db
            .code()
            .map(|code| code.starts_with("57") || code.starts_with("08"))
            .unwrap_or(false),
        _ => false,
    }
}
