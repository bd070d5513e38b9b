use common::models::Event;
use serde_json::Value;
use tokio_postgres::{Client, Row};

use crate::storage::{DataPoint, EventQuery, ReportingRequest};

/// Tables that store a policy object as a JSONB document.
#[derive(Debug, Clone, Copy)]
pub enum PolicyTable {
    Keys,
    ProviderSettings,
    Routes,
    CustomProviders,
}

impl PolicyTable {
    fn name(&self) -> &'static str {
        match self {
            PolicyTable::Keys => "keys",
            PolicyTable::ProviderSettings => "provider_settings",
            PolicyTable::Routes => "routes",
            PolicyTable::CustomProviders => "custom_providers",
        }
    }

    fn id_column(&self) -> &'static str {
        match self {
            PolicyTable::Keys => "key_id",
            _ => "id",
        }
    }
}

// ---------------------------------------------------------------------------
// Policy documents
// ---------------------------------------------------------------------------

pub async fn insert_key(
    client: &Client,
    key_id: &str,
    hashed_secret: &str,
    created_at: i64,
    data: &Value,
) -> Result<u64, tokio_postgres::Error> {
    client
        .execute(
            r#"
            INSERT INTO keys (key_id, hashed_secret, revoked, created_at, updated_at, data)
            VALUES ($1, $2, false, $3, $3, $4)
            "#,
            &[&key_id, &hashed_secret, &created_at, data],
        )
        .await
}

pub async fn update_key(
    client: &Client,
    key_id: &str,
    revoked: bool,
    updated_at: i64,
    data: &Value,
) -> Result<u64, tokio_postgres::Error> {
    client
        .execute(
            r#"
            UPDATE keys
            SET revoked = $2, updated_at = GREATEST(updated_at, $3), data = $4
            WHERE key_id = $1
            "#,
            &[&key_id, &revoked, &updated_at, data],
        )
        .await
}

/// Conditional revoke; affects one row only while the key is still active.
pub async fn revoke_key(
    client: &Client,
    key_id: &str,
    reason: &str,
    updated_at: i64,
) -> Result<u64, tokio_postgres::Error> {
    client
        .execute(
            r#"
            UPDATE keys
            SET revoked = true,
                updated_at = GREATEST(updated_at, $3),
                data = data
                    || jsonb_build_object('revoked', true, 'revokedReason', $2::text)
                    || jsonb_build_object('updatedAt', GREATEST(updated_at, $3))
            WHERE key_id = $1 AND revoked = false
            "#,
            &[&key_id, &reason, &updated_at],
        )
        .await
}

pub async fn insert_document(
    client: &Client,
    table: PolicyTable,
    id: &str,
    unique_column: Option<(&str, &str)>,
    created_at: i64,
    data: &Value,
) -> Result<u64, tokio_postgres::Error> {
    match unique_column {
        Some((column, value)) => {
            let sql = format!(
                "INSERT INTO {} (id, {column}, created_at, updated_at, data) VALUES ($1, $2, $3, $3, $4)",
                table.name()
            );
            client.execute(&sql, &[&id, &value, &created_at, data]).await
        }
        None => {
            let sql = format!(
                "INSERT INTO {} (id, created_at, updated_at, data) VALUES ($1, $2, $2, $3)",
                table.name()
            );
            client.execute(&sql, &[&id, &created_at, data]).await
        }
    }
}

pub async fn update_document(
    client: &Client,
    table: PolicyTable,
    id: &str,
    updated_at: i64,
    data: &Value,
) -> Result<u64, tokio_postgres::Error> {
    let sql = format!(
        "UPDATE {} SET updated_at = GREATEST(updated_at, $2), data = $3 WHERE {} = $1",
        table.name(),
        table.id_column()
    );
    client.execute(&sql, &[&id, &updated_at, data]).await
}

pub async fn get_document(
    client: &Client,
    table: PolicyTable,
    id: &str,
) -> Result<Option<Value>, tokio_postgres::Error> {
    let sql = format!(
        "SELECT data FROM {} WHERE {} = $1",
        table.name(),
        table.id_column()
    );
    let row = client.query_opt(&sql, &[&id]).await?;
    Ok(row.map(|r| r.get("data")))
}

/// All documents, or only those touched at or after `since`.
pub async fn list_documents(
    client: &Client,
    table: PolicyTable,
    since: Option<i64>,
) -> Result<Vec<Value>, tokio_postgres::Error> {
    let rows = match since {
        Some(since) => {
            let sql = format!(
                "SELECT data FROM {} WHERE updated_at >= $1 ORDER BY updated_at",
                table.name()
            );
            client.query(&sql, &[&since]).await?
        }
        None => {
            let sql = format!("SELECT data FROM {} ORDER BY created_at", table.name());
            client.query(&sql, &[]).await?
        }
    };
    Ok(rows.iter().map(|r| r.get("data")).collect())
}

pub async fn list_keys_by_tag(
    client: &Client,
    tag: &str,
) -> Result<Vec<Value>, tokio_postgres::Error> {
    let rows = client
        .query(
            r#"
            SELECT data FROM keys
            WHERE data->'tags' ? $1
            ORDER BY created_at
            "#,
            &[&tag],
        )
        .await?;
    Ok(rows.iter().map(|r| r.get("data")).collect())
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

pub async fn insert_event(client: &Client, e: &Event) -> Result<u64, tokio_postgres::Error> {
    let tags = serde_json::json!(e.tags);
    let status = e.status as i32;
    client
        .execute(
            r#"
            INSERT INTO events
                (id, created_at, key_id, tags, provider, model, path, method, status,
                 prompt_token_count, completion_token_count, cost_in_usd, latency_ms, custom_id)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            ON CONFLICT (id) DO NOTHING
            "#,
            &[
                &e.id,
                &e.created_at,
                &e.key_id,
                &tags,
                &e.provider,
                &e.model,
                &e.path,
                &e.method,
                &status,
                &e.prompt_token_count,
                &e.completion_token_count,
                &e.cost_in_usd,
                &e.latency_ms,
                &e.custom_id,
            ],
        )
        .await
}

pub async fn query_events(
    client: &Client,
    query: &EventQuery,
) -> Result<Vec<Event>, tokio_postgres::Error> {
    let limit = query.limit.unwrap_or(1000);
    let rows = client
        .query(
            r#"
            SELECT id, created_at, key_id, tags, provider, model, path, method, status,
                   prompt_token_count, completion_token_count, cost_in_usd, latency_ms, custom_id
            FROM events
            WHERE ($1::text IS NULL OR custom_id = $1)
              AND (cardinality($2::text[]) = 0 OR key_id = ANY($2))
              AND (cardinality($3::text[]) = 0 OR tags ?| $3)
              AND ($4::bigint IS NULL OR created_at >= $4)
              AND ($5::bigint IS NULL OR created_at < $5)
            ORDER BY created_at DESC
            LIMIT $6
            "#,
            &[
                &query.custom_id,
                &query.key_ids,
                &query.tags,
                &query.start,
                &query.end,
                &limit,
            ],
        )
        .await?;

    Ok(rows.iter().map(event_from_row).collect())
}

pub async fn aggregate_events(
    client: &Client,
    request: &ReportingRequest,
) -> Result<Vec<DataPoint>, tokio_postgres::Error> {
    let rows = client
        .query(
            r#"
            SELECT ($1 + FLOOR((created_at - $1)::double precision / $3::bigint) * $3::bigint)::bigint AS time_stamp,
                   COUNT(*) AS number_of_requests,
                   COALESCE(SUM(cost_in_usd), 0)::double precision AS cost_in_usd,
                   COALESCE(AVG(latency_ms), 0)::double precision AS latency_in_ms,
                   COALESCE(SUM(prompt_token_count), 0)::bigint AS prompt_token_count,
                   COALESCE(SUM(completion_token_count), 0)::bigint AS completion_token_count
            FROM events
            WHERE created_at >= $1 AND created_at < $2
              AND (cardinality($4::text[]) = 0 OR key_id = ANY($4))
              AND (cardinality($5::text[]) = 0 OR tags ?| $5)
            GROUP BY 1
            ORDER BY 1
            "#,
            &[
                &request.start,
                &request.end,
                &request.increment,
                &request.key_ids,
                &request.tags,
            ],
        )
        .await?;

    Ok(rows
        .iter()
        .map(|r| DataPoint {
            time_stamp: r.get("time_stamp"),
            number_of_requests: r.get("number_of_requests"),
            cost_in_usd: r.get("cost_in_usd"),
            latency_in_ms: r.get("latency_in_ms"),
            prompt_token_count: r.get("prompt_token_count"),
            completion_token_count: r.get("completion_token_count"),
        })
        .collect())
}

fn event_from_row(r: &Row) -> Event {
    let tags: Value = r.get("tags");
    let status: i32 = r.get("status");
    Event {
        id: r.get("id"),
        created_at: r.get("created_at"),
        key_id: r.get("key_id"),
        tags: serde_json::from_value(tags).unwrap_or_default(),
        provider: r.get("provider"),
        model: r.get("model"),
        path: r.get("path"),
        method: r.get("method"),
        status: status as u16,
        prompt_token_count: r.get("prompt_token_count"),
        completion_token_count: r.get("completion_token_count"),
        cost_in_usd: r.get("cost_in_usd"),
        latency_ms: r.get("latency_ms"),
        custom_id: r.get("custom_id"),
    }
}
