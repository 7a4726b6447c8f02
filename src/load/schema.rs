//! Relational schema for persisted exports
//!
//! Creation is idempotent and runs on connect. A single-row
//! `schema_version` table gates the loader: it refuses to operate against
//! a version it does not understand.

/// Schema version this loader understands
pub const SCHEMA_VERSION: i32 = 1;

/// Idempotent DDL, executed in order on connect
pub const CREATE_TABLES: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS schema_version (
        version INTEGER PRIMARY KEY
    )",
    "CREATE TABLE IF NOT EXISTS archives (
        archive_id BIGSERIAL PRIMARY KEY,
        user_id TEXT NOT NULL,
        export_date TIMESTAMPTZ NOT NULL,
        file_path TEXT NOT NULL CHECK (file_path LIKE '%.tar'),
        file_name TEXT,
        file_size BIGINT NOT NULL DEFAULT 0,
        raw_data JSONB NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        UNIQUE (user_id, export_date)
    )",
    "CREATE TABLE IF NOT EXISTS conversations (
        conversation_id TEXT PRIMARY KEY,
        display_name TEXT,
        archive_id BIGINT NOT NULL REFERENCES archives(archive_id),
        first_message_time TIMESTAMPTZ,
        last_message_time TIMESTAMPTZ,
        message_count INTEGER NOT NULL DEFAULT 0,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )",
    "CREATE TABLE IF NOT EXISTS messages (
        message_id BIGSERIAL PRIMARY KEY,
        conversation_id TEXT NOT NULL REFERENCES conversations(conversation_id),
        timestamp TIMESTAMPTZ,
        sender_id TEXT,
        sender_name TEXT,
        message_type TEXT,
        raw_content TEXT,
        cleaned_content TEXT,
        is_edited BOOLEAN NOT NULL DEFAULT FALSE,
        structured_data JSONB,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )",
    "CREATE INDEX IF NOT EXISTS idx_messages_conversation_timestamp
        ON messages (conversation_id, timestamp)",
    "CREATE TABLE IF NOT EXISTS message_media (
        media_id BIGSERIAL PRIMARY KEY,
        message_id BIGINT NOT NULL REFERENCES messages(message_id) ON DELETE CASCADE,
        filename TEXT,
        filesize BIGINT,
        filetype TEXT,
        url TEXT,
        thumbnail_url TEXT,
        width INTEGER,
        height INTEGER,
        duration TEXT,
        description TEXT
    )",
    "CREATE TABLE IF NOT EXISTS message_poll (
        poll_id BIGSERIAL PRIMARY KEY,
        message_id BIGINT NOT NULL REFERENCES messages(message_id) ON DELETE CASCADE,
        question TEXT
    )",
    "CREATE TABLE IF NOT EXISTS message_poll_option (
        option_id BIGSERIAL PRIMARY KEY,
        poll_id BIGINT NOT NULL REFERENCES message_poll(poll_id) ON DELETE CASCADE,
        option_text TEXT,
        display_order INTEGER NOT NULL DEFAULT 0
    )",
    "CREATE TABLE IF NOT EXISTS message_location (
        location_id BIGSERIAL PRIMARY KEY,
        message_id BIGINT NOT NULL REFERENCES messages(message_id) ON DELETE CASCADE,
        latitude TEXT,
        longitude TEXT,
        address TEXT
    )",
];

/// Build a multi-row INSERT statement with `$n` placeholders.
///
/// Returns the SQL only; callers bind `num_rows * columns.len()` values in
/// row-major order.
pub fn build_batch_insert(table: &str, columns: &[&str], num_rows: usize, suffix: &str) -> String {
    let num_cols = columns.len();

    let mut query = format!("INSERT INTO {} (", table);
    query.push_str(&columns.join(", "));
    query.push_str(") VALUES ");

    let mut value_clauses = Vec::with_capacity(num_rows);
    for row_idx in 0..num_rows {
        let mut placeholders = Vec::with_capacity(num_cols);
        for col_idx in 0..num_cols {
            let param_num = row_idx * num_cols + col_idx + 1;
            placeholders.push(format!("${}", param_num));
        }
        value_clauses.push(format!("({})", placeholders.join(", ")));
    }

    query.push_str(&value_clauses.join(", "));
    if !suffix.is_empty() {
        query.push(' ');
        query.push_str(suffix);
    }

    query
}
