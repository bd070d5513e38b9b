use tracing::info;

use super::DbPool;
use crate::storage::StoreError;

/// Policy tables keep the full object in `data` and lift out the columns
/// that are looked up or constrained.
const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS keys (
        key_id        TEXT PRIMARY KEY,
        hashed_secret TEXT NOT NULL UNIQUE,
        revoked       BOOLEAN NOT NULL DEFAULT FALSE,
        created_at    BIGINT NOT NULL,
        updated_at    BIGINT NOT NULL,
        data          JSONB NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS keys_updated_at_idx ON keys (updated_at)",
    r#"
    CREATE TABLE IF NOT EXISTS provider_settings (
        id         TEXT PRIMARY KEY,
        provider   TEXT NOT NULL,
        created_at BIGINT NOT NULL,
        updated_at BIGINT NOT NULL,
        data       JSONB NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS routes (
        id         TEXT PRIMARY KEY,
        path       TEXT NOT NULL UNIQUE,
        created_at BIGINT NOT NULL,
        updated_at BIGINT NOT NULL,
        data       JSONB NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS custom_providers (
        id         TEXT PRIMARY KEY,
        provider   TEXT NOT NULL UNIQUE,
        created_at BIGINT NOT NULL,
        updated_at BIGINT NOT NULL,
        data       JSONB NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS events (
        id                     TEXT PRIMARY KEY,
        created_at             BIGINT NOT NULL,
        key_id                 TEXT NOT NULL,
        tags                   JSONB NOT NULL DEFAULT '[]',
        provider               TEXT NOT NULL,
        model                  TEXT NOT NULL,
        path                   TEXT NOT NULL,
        method                 TEXT NOT NULL,
        status                 INTEGER NOT NULL,
        prompt_token_count     BIGINT NOT NULL,
        completion_token_count BIGINT NOT NULL,
        cost_in_usd            DOUBLE PRECISION NOT NULL,
        latency_ms             BIGINT NOT NULL,
        custom_id              TEXT
    )
    "#,
    "CREATE INDEX IF NOT EXISTS events_key_created_idx ON events (key_id, created_at)",
    "CREATE INDEX IF NOT EXISTS events_custom_id_idx ON events (custom_id)",
];

/// Create any missing tables and indexes.
pub async fn migrate(pool: &DbPool) -> Result<(), StoreError> {
    let client = pool.get_client().await?;
    for statement in SCHEMA {
        client.batch_execute(statement).await?;
    }
    info!(statements = SCHEMA.len(), "database schema ensured");
    Ok(())
}
