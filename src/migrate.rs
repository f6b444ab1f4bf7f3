use anyhow::Result;
use sqlx::SqlitePool;

/// Create every table and index the relational store needs. Idempotent.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    // One row per ingestion or conversion run
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sessions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            run_id TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            parent_id INTEGER REFERENCES sessions(id),
            from_ts TEXT,
            to_ts TEXT,
            files_enabled INTEGER NOT NULL DEFAULT 0,
            avatars_enabled INTEGER NOT NULL DEFAULT 0,
            mode TEXT NOT NULL,
            args TEXT NOT NULL DEFAULT '',
            finished INTEGER NOT NULL DEFAULT 0
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Raw records, in insertion order per session
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS records (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            session_id INTEGER NOT NULL REFERENCES sessions(id),
            unit TEXT NOT NULL,
            group_id TEXT NOT NULL,
            kind TEXT NOT NULL,
            seq INTEGER NOT NULL,
            digest TEXT NOT NULL,
            payload TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            UNIQUE(session_id, unit, digest)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS messages (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            record_id INTEGER NOT NULL REFERENCES records(id),
            session_id INTEGER NOT NULL REFERENCES sessions(id),
            channel_id TEXT NOT NULL,
            ts TEXT NOT NULL,
            ts_micros INTEGER NOT NULL,
            thread_ts TEXT NOT NULL DEFAULT '',
            is_parent INTEGER NOT NULL DEFAULT 0,
            seq INTEGER NOT NULL,
            data TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS channels (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            record_id INTEGER NOT NULL REFERENCES records(id),
            session_id INTEGER NOT NULL REFERENCES sessions(id),
            channel_id TEXT NOT NULL,
            data TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS users (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            record_id INTEGER NOT NULL REFERENCES records(id),
            session_id INTEGER NOT NULL REFERENCES sessions(id),
            user_id TEXT NOT NULL,
            data TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS files (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            record_id INTEGER NOT NULL REFERENCES records(id),
            session_id INTEGER NOT NULL REFERENCES sessions(id),
            file_id TEXT NOT NULL,
            channel_id TEXT NOT NULL,
            message_ts TEXT NOT NULL,
            data TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Latest-seen timestamp per logical unit
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS checkpoints (
            unit TEXT PRIMARY KEY,
            latest_ts TEXT NOT NULL,
            latest_micros INTEGER NOT NULL,
            session_id INTEGER REFERENCES sessions(id),
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create indexes
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_records_session_unit ON records(session_id, unit)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_messages_channel ON messages(channel_id, thread_ts, ts_micros)",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_channels_channel ON channels(channel_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_users_user ON users(user_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_files_channel ON files(channel_id)")
        .execute(pool)
        .await?;

    Ok(())
}
