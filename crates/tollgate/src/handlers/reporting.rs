use hyper::StatusCode;

use super::management::AdminError;
use super::response::{json_response, ProxyResponse};
use crate::app_state::AppState;
use crate::storage::{EventQuery, ReportingRequest};

/// `POST /api/reporting/events`: time-bucketed totals.
pub async fn handle_aggregate(state: &AppState, body: &[u8]) -> Result<ProxyResponse, AdminError> {
    let request: ReportingRequest = serde_json::from_slice(body)
        .map_err(|e| AdminError::BadRequest(format!("invalid JSON: {e}")))?;
    request.validate().map_err(AdminError::BadRequest)?;

    let points = state.event_store.aggregate_events(&request).await?;
    Ok(json_response(
        StatusCode::OK,
        &serde_json::json!({ "dataPoints": points }),
    ))
}

/// `GET /api/events`.
pub async fn handle_query_events(
    state: &AppState,
    params: &[(String, String)],
) -> Result<ProxyResponse, AdminError> {
    let query = parse_event_query(params)?;
    let events = state.event_store.query_events(&query).await?;
    Ok(json_response(StatusCode::OK, &events))
}

/// List parameters accept repeats and comma-separated values alike.
fn parse_event_query(params: &[(String, String)]) -> Result<EventQuery, AdminError> {
    let int = |name: &str, value: &str| {
        value
            .parse::<i64>()
            .map_err(|_| AdminError::BadRequest(format!("{name} must be an integer")))
    };
    let list = |value: &str| {
        value
            .split(',')
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
            .collect::<Vec<_>>()
    };

    let mut query = EventQuery::default();
    for (name, value) in params {
        match name.as_str() {
            "customId" => query.custom_id = Some(value.clone()).filter(|v| !v.is_empty()),
            "keyIds" => query.key_ids.extend(list(value)),
            "tags" => query.tags.extend(list(value)),
            "start" => query.start = Some(int(name, value)?),
            "end" => query.end = Some(int(name, value)?),
            "limit" => query.limit = Some(int(name, value)?),
            _ => {}
        }
    }
    if let (Some(start), Some(end)) = (query.start, query.end) {
        if end <= start {
            return Err(AdminError::BadRequest("end must be after start".into()));
        }
    }
    Ok(query)
}
