//! HTTP surface: inbound CRM webhooks and the admin webhook controls.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use dealsync_core::EventStatus;
use dealsync_storage::StoreError;
use dealsync_sync::{
    parse_query_date, pipedrive_delivery, EventQuery, RetryResult, StatsPeriod, WebhookPipeline,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use tokio::net::TcpListener;
use tracing::{error, info};
use uuid::Uuid;

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<WebhookPipeline>,
}

impl AppState {
    pub fn new(pipeline: Arc<WebhookPipeline>) -> Self {
        Self { pipeline }
    }
}

#[derive(Debug, Default, Deserialize)]
struct StatsQuery {
    period: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EventsQuery {
    page: Option<String>,
    limit: Option<String>,
    status: Option<String>,
    start_date: Option<String>,
    end_date: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RetryBody {
    #[serde(default)]
    reset_retry_count: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RetryResponse {
    success: bool,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    event: Option<dealsync_core::WebhookEvent>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/webhooks/pipedrive", post(pipedrive_webhook_handler))
        .route("/admin/webhooks/stats", get(stats_handler))
        .route("/admin/webhooks/events", get(events_handler))
        .route("/admin/webhooks/failed", get(failed_handler))
        .route("/admin/webhooks/events/retry-all", post(retry_all_handler))
        .route("/admin/webhooks/events/{id}/retry", post(retry_event_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(pipeline: Arc<WebhookPipeline>, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "http server listening");
    axum::serve(listener, app(AppState::new(pipeline))).await?;
    Ok(())
}

async fn health_handler() -> Response {
    Json(json!({"status": "ok"})).into_response()
}

async fn pipedrive_webhook_handler(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    let body = match serde_json::from_slice::<JsonValue>(&body) {
        Ok(body) => body,
        Err(err) => return bad_request(format!("invalid webhook body: {err}")),
    };
    let delivery = pipedrive_delivery(body);
    match state.pipeline.ingestor.receive(delivery).await {
        Ok(receipt) => Json(json!({
            "received": true,
            "eventId": receipt.event_id,
            "status": receipt.status,
        }))
        .into_response(),
        Err(err) => store_error(err),
    }
}

async fn stats_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<StatsQuery>,
) -> Response {
    let period = match query.period.as_deref().map(str::parse::<StatsPeriod>) {
        None => StatsPeriod::default(),
        Some(Ok(period)) => period,
        Some(Err(msg)) => return bad_request(msg),
    };
    match state.pipeline.admin.stats(period).await {
        Ok(report) => Json(report).into_response(),
        Err(err) => store_error(err),
    }
}

async fn events_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<EventsQuery>,
) -> Response {
    let query = match parse_events_query(&query) {
        Ok(query) => query,
        Err(msg) => return bad_request(msg),
    };
    match state.pipeline.admin.list_events(&query).await {
        Ok(listing) => Json(listing).into_response(),
        Err(err) => store_error(err),
    }
}

fn parse_events_query(raw: &EventsQuery) -> Result<EventQuery, String> {
    fn number(field: &str, value: &Option<String>) -> Result<Option<i64>, String> {
        value
            .as_deref()
            .filter(|v| !v.trim().is_empty())
            .map(|v| v.trim().parse::<i64>().map_err(|_| format!("invalid {field}: {v}")))
            .transpose()
    }
    fn date(field: &str, value: &Option<String>, end_of_day: bool) -> Result<Option<chrono::DateTime<chrono::Utc>>, String> {
        value
            .as_deref()
            .filter(|v| !v.trim().is_empty())
            .map(|v| parse_query_date(v, end_of_day).ok_or_else(|| format!("invalid {field}: {v}")))
            .transpose()
    }

    let status = raw
        .status
        .as_deref()
        .filter(|v| !v.trim().is_empty())
        .map(|v| v.parse::<EventStatus>().map_err(|err| err.to_string()))
        .transpose()?;
    Ok(EventQuery {
        page: number("page", &raw.page)?,
        limit: number("limit", &raw.limit)?,
        status,
        start: date("startDate", &raw.start_date, false)?,
        end: date("endDate", &raw.end_date, true)?,
    })
}

async fn failed_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.pipeline.admin.failed_events().await {
        Ok(events) => Json(json!({"count": events.len(), "events": events})).into_response(),
        Err(err) => store_error(err),
    }
}

/// Empty bodies mean `resetRetryCount = false`.
fn parse_retry_body(body: &Bytes) -> Result<RetryBody, String> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(RetryBody::default());
    }
    serde_json::from_slice(body).map_err(|err| format!("invalid retry body: {err}"))
}

async fn retry_event_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    body: Bytes,
) -> Response {
    let Ok(event_id) = Uuid::parse_str(&id) else {
        return bad_request(format!("invalid event id: {id}"));
    };
    let retry = match parse_retry_body(&body) {
        Ok(retry) => retry,
        Err(msg) => return bad_request(msg),
    };
    match state
        .pipeline
        .admin
        .retry_event(event_id, retry.reset_retry_count)
        .await
    {
        Ok(RetryResult::Rearmed(event)) => Json(RetryResponse {
            success: true,
            message: format!("Event {event_id} queued for retry"),
            event: Some(event),
        })
        .into_response(),
        Ok(RetryResult::NotFound) => json_error(StatusCode::NOT_FOUND, format!("event {event_id} not found")),
        Ok(RetryResult::AlreadySucceeded) => {
            json_error(StatusCode::CONFLICT, format!("event {event_id} already succeeded"))
        }
        Err(err) => store_error(err),
    }
}

async fn retry_all_handler(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    let retry = match parse_retry_body(&body) {
        Ok(retry) => retry,
        Err(msg) => return bad_request(msg),
    };
    match state.pipeline.admin.retry_all(retry.reset_retry_count).await {
        Ok(report) => Json(json!({
            "success": true,
            "count": report.count,
            "message": report.message,
        }))
        .into_response(),
        Err(err) => store_error(err),
    }
}

fn json_error(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({"error": message.into()}))).into_response()
}

fn bad_request(message: impl Into<String>) -> Response {
    json_error(StatusCode::BAD_REQUEST, message)
}

fn store_error(err: StoreError) -> Response {
    error!(error = %err, "admin request failed");
    json_error(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use chrono::{TimeZone, Utc};
    use dealsync_adapters::{Deal, Person, PersonLookup};
    use dealsync_core::{Clock, ManualClock};
    use dealsync_storage::{CrmError, CrmPage, EventStore, LeadStore, MemoryStore};
    use dealsync_sync::{DealSource, ServiceConfig, Taxonomy, TaxonomyError, TaxonomySource};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    struct StubCrm {
        fail_people: bool,
    }

    #[async_trait]
    impl PersonLookup for StubCrm {
        async fn get_person(&self, person_id: i64) -> Result<Person, CrmError> {
            if self.fail_people {
                return Err(CrmError::Unsuccessful { path: format!("persons/{person_id}") });
            }
            Ok(serde_json::from_value(json!({"id": person_id, "name": "Ana Ruiz", "email": ["ana@example.com"]})).unwrap())
        }
    }

    #[async_trait]
    impl TaxonomySource for StubCrm {
        async fn fetch_taxonomy(&self) -> Result<Taxonomy, TaxonomyError> {
            Ok(Taxonomy::default())
        }
    }

    #[async_trait]
    impl DealSource for StubCrm {
        async fn deal_page(&self, _start: u64, _limit: u64) -> Result<CrmPage<Deal>, CrmError> {
            Ok(CrmPage { items: Vec::new(), next_start: None })
        }
    }

    fn setup(fail_people: bool) -> (Router, Arc<MemoryStore>, ManualClock) {
        let store = Arc::new(MemoryStore::new());
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).single().unwrap());
        let pipeline = WebhookPipeline::new(
            &ServiceConfig::default(),
            store.clone(),
            Arc::new(StubCrm { fail_people }),
            Arc::new(clock.clone()),
        )
        .unwrap();
        (app(AppState::new(Arc::new(pipeline))), store, clock)
    }

    fn webhook_body(deal_id: i64) -> String {
        json!({
            "event": "added.deal",
            "meta": {"id": deal_id},
            "current": {
                "id": deal_id,
                "title": "Ruiz Wedding - CO",
                "add_time": "2026-02-27 15:00:00",
                "city": "Denver",
                "person_id": 8
            }
        })
        .to_string()
    }

    async fn send(app: &Router, request: Request<Body>) -> (StatusCode, JsonValue) {
        let resp = app.clone().oneshot(request).await.unwrap();
        let status = resp.status();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let body = if bytes.is_empty() {
            JsonValue::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, body)
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn post_json(uri: &str, body: String) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body))
            .unwrap()
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let (app, _, _) = setup(false);
        let (status, body) = send(&app, get("/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn webhook_is_recorded_and_processed() {
        let (app, store, _) = setup(false);
        let (status, body) = send(&app, post_json("/webhooks/pipedrive", webhook_body(501))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "SUCCESS");
        let lead = store.find_lead("501").await.unwrap().unwrap();
        assert_eq!(lead.fields.location.as_deref(), Some("Denver, CO"));
    }

    #[tokio::test]
    async fn malformed_webhook_body_gets_a_json_error_and_no_row() {
        let (app, store, _) = setup(false);
        let request = Request::builder()
            .method("POST")
            .uri("/webhooks/pipedrive")
            .header("content-type", "text/plain")
            .body(Body::from("deal=501"))
            .unwrap();
        let (status, body) = send(&app, request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().starts_with("invalid webhook body"));
        assert!(store.events().await.is_empty());
    }

    #[tokio::test]
    async fn failed_webhook_still_answers_ok_and_shows_in_admin_views() {
        let (app, _, _) = setup(true);
        let (status, body) = send(&app, post_json("/webhooks/pipedrive", webhook_body(502))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "RETRYING");

        let (_, stats) = send(&app, get("/admin/webhooks/stats?period=today")).await;
        assert_eq!(stats["total"], 1);
        assert_eq!(stats["retrying"], 1);
        assert_eq!(stats["successRate"], 0.0);

        let (_, failed) = send(&app, get("/admin/webhooks/failed")).await;
        assert_eq!(failed["count"], 1);
        assert_eq!(failed["events"][0]["retryCount"], 1);
        assert!(failed["events"][0]["error"].as_str().unwrap().contains("person lookup"));
    }

    #[tokio::test]
    async fn events_listing_clamps_and_validates() {
        let (app, _, _) = setup(false);
        send(&app, post_json("/webhooks/pipedrive", webhook_body(503))).await;

        let (status, listing) = send(&app, get("/admin/webhooks/events?page=0&limit=1000&status=success")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(listing["page"], 1);
        assert_eq!(listing["limit"], 100);
        assert_eq!(listing["total"], 1);
        assert_eq!(listing["events"][0]["payload"]["current"]["id"], 503);

        let (status, body) = send(&app, get("/admin/webhooks/events?status=DELIVERED")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("DELIVERED"));

        let (status, _) = send(&app, get("/admin/webhooks/events?startDate=last-week")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(&app, get("/admin/webhooks/stats?period=year")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn retry_endpoints_rearm_and_report() {
        let (app, store, clock) = setup(true);
        let (_, body) = send(&app, post_json("/webhooks/pipedrive", webhook_body(504))).await;
        let event_id = body["eventId"].as_str().unwrap().to_string();

        let (status, _) = send(
            &app,
            post_json(&format!("/admin/webhooks/events/{}/retry", Uuid::new_v4()), String::new()),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = send(&app, post_json("/admin/webhooks/events/not-a-uuid/retry", String::new())).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        clock.advance(chrono::Duration::minutes(3));
        let (status, body) = send(
            &app,
            post_json(
                &format!("/admin/webhooks/events/{event_id}/retry"),
                json!({"resetRetryCount": true}).to_string(),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["event"]["status"], "PENDING");
        assert_eq!(body["event"]["retryCount"], 0);

        let id = Uuid::parse_str(&event_id).unwrap();
        let row = store.get_event(id).await.unwrap().unwrap();
        assert_eq!(row.next_retry_at, Some(clock.now()));

        let (status, body) = send(&app, post_json("/admin/webhooks/events/retry-all", String::new())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["count"], 0);
        assert_eq!(body["message"], "No failed events to retry");
    }

    #[tokio::test]
    async fn retrying_a_succeeded_event_conflicts() {
        let (app, _, _) = setup(false);
        let (_, body) = send(&app, post_json("/webhooks/pipedrive", webhook_body(505))).await;
        let event_id = body["eventId"].as_str().unwrap().to_string();
        let (status, _) = send(
            &app,
            post_json(&format!("/admin/webhooks/events/{event_id}/retry"), "{}".to_string()),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
    }
}
