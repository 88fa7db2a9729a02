use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
};
use harvest_common::{Candidate, JobCounters, JobLimits, NewEntity};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::errors::HarvestError;
use crate::orchestrator::{ModesPatch, Orchestrator};
use crate::queue::EntityFilter;

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub orchestrator: Orchestrator,
    pub ws_tx: broadcast::Sender<String>,
}

pub type SharedState = Arc<AppState>;

// ── Request payload types ─────────────────────────────────────────────

#[derive(Deserialize)]
pub struct StartJobRequest {
    pub source_url: String,
    #[serde(default)]
    pub max_entities: Option<u32>,
    #[serde(default)]
    pub max_pages: Option<u32>,
    #[serde(default)]
    pub resume: bool,
}

#[derive(Deserialize)]
pub struct IngestRequest {
    pub entities: Vec<NewEntity>,
}

#[derive(Deserialize)]
pub struct ProgressRequest {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub counters: JobCounters,
}

#[derive(Deserialize)]
pub struct FailRequest {
    pub error: String,
}

#[derive(Deserialize)]
pub struct AttachAddressRequest {
    pub address: String,
}

#[derive(Deserialize)]
pub struct ContactsRequest {
    #[serde(default)]
    pub contacts: Vec<String>,
}

#[derive(Deserialize)]
pub struct SubmitSearchRequest {
    pub query: String,
    #[serde(default)]
    pub context: serde_json::Value,
}

#[derive(Deserialize)]
pub struct CompleteSearchRequest {
    #[serde(default)]
    pub results: Vec<Candidate>,
}

#[derive(Deserialize)]
pub struct EntityListQuery {
    /// `pending`, `all`, or one entity status.
    pub status: Option<String>,
}

#[derive(Deserialize)]
pub struct StatisticsQuery {
    pub job_id: Option<i64>,
}

#[derive(Serialize)]
pub struct SubmitSearchResponse {
    pub request_id: String,
}

// ── Error handling ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Conflict(String),
    Unavailable(String),
    Timeout(String),
    Internal(String),
}

impl From<HarvestError> for ApiError {
    fn from(err: HarvestError) -> Self {
        let message = err.to_string();
        match err {
            e if e.is_not_found() => ApiError::NotFound(message),
            HarvestError::Invalid { .. } => ApiError::BadRequest(message),
            HarvestError::AlreadyRunning { .. } => ApiError::Conflict(message),
            HarvestError::AgentUnavailable => ApiError::Unavailable(message),
            HarvestError::Timeout { .. } => ApiError::Timeout(message),
            other => {
                tracing::error!(error = %other, "request failed");
                ApiError::Internal(message)
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
            ApiError::Timeout(msg) => (StatusCode::GATEWAY_TIMEOUT, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/api/jobs", get(list_jobs).post(start_job))
        .route("/api/jobs/{id}", get(get_job))
        .route("/api/jobs/{id}/entities", get(list_job_entities).post(ingest_entities))
        .route("/api/jobs/{id}/progress", post(report_progress))
        .route("/api/jobs/{id}/harvest/complete", post(complete_harvest))
        .route("/api/jobs/{id}/harvest/fail", post(fail_harvest))
        .route("/api/jobs/{id}/advance", post(advance_job))
        .route("/api/loop", get(loop_snapshot))
        .route("/api/entities/{id}", get(get_entity))
        .route("/api/entities/{id}/resolve", post(resolve_entity))
        .route("/api/entities/{id}/skip", post(skip_entity))
        .route("/api/entities/{id}/address", put(attach_address))
        .route("/api/entities/{id}/contacts", post(record_contacts))
        .route("/api/settings/modes", get(get_modes).put(update_modes))
        .route("/api/search", post(submit_search))
        .route("/api/search/pending", get(pending_searches))
        .route("/api/search/{id}", get(poll_search))
        .route("/api/search/{id}/complete", post(complete_search))
        .route("/api/search/{id}/fail", post(fail_search))
        .route("/api/statistics", get(statistics))
        .route("/health", get(health_check))
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok"}))
}

// Jobs

async fn start_job(
    State(state): State<SharedState>,
    Json(req): Json<StartJobRequest>,
) -> ApiResult<impl IntoResponse> {
    let limits = JobLimits::new(req.max_entities, req.max_pages);
    let outcome = state
        .orchestrator
        .jobs()
        .start(&req.source_url, limits, req.resume)
        .await?;
    let status = if outcome.resumed {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };
    Ok((status, Json(outcome)))
}

async fn list_jobs(State(state): State<SharedState>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.orchestrator.jobs().list().await?))
}

async fn get_job(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    let jobs = state.orchestrator.jobs();
    let job = jobs.get(id).await?;
    let statistics = jobs.statistics(Some(id)).await?;
    Ok(Json(serde_json::json!({"job": job, "statistics": statistics})))
}

async fn list_job_entities(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    Query(query): Query<EntityListQuery>,
) -> ApiResult<impl IntoResponse> {
    let filter = match query.status.as_deref() {
        Some(raw) => raw.parse::<EntityFilter>()?,
        None => EntityFilter::All,
    };
    state.orchestrator.jobs().get(id).await?;
    Ok(Json(state.orchestrator.queue().list_matching(id, filter).await?))
}

async fn ingest_entities(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    Json(req): Json<IngestRequest>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.orchestrator.jobs().ingest_entities(id, req.entities).await?))
}

async fn report_progress(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    Json(req): Json<ProgressRequest>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(
        state
            .orchestrator
            .jobs()
            .report_progress(id, req.message, req.counters)
            .await?,
    ))
}

async fn complete_harvest(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.orchestrator.jobs().complete_harvest(id).await?))
}

async fn fail_harvest(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    Json(req): Json<FailRequest>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.orchestrator.jobs().fail(id, &req.error).await?))
}

async fn advance_job(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.orchestrator.advance(id).await?))
}

// Loop and entities

async fn loop_snapshot(State(state): State<SharedState>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.orchestrator.snapshot().await?))
}

async fn get_entity(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.orchestrator.queue().get_by_id(id).await?))
}

async fn resolve_entity(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    let started = state.orchestrator.resolve(id).await?;
    Ok((StatusCode::ACCEPTED, Json(serde_json::json!({"resolve": started}))))
}

async fn skip_entity(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.orchestrator.skip(id).await?))
}

async fn attach_address(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    Json(req): Json<AttachAddressRequest>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.orchestrator.attach_address(id, &req.address).await?))
}

async fn record_contacts(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    Json(req): Json<ContactsRequest>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.orchestrator.record_contacts(id, req.contacts).await?))
}

// Settings

async fn get_modes(State(state): State<SharedState>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.orchestrator.modes().await?))
}

async fn update_modes(
    State(state): State<SharedState>,
    Json(patch): Json<ModesPatch>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.orchestrator.update_modes(patch).await?))
}

// Search broker

async fn submit_search(
    State(state): State<SharedState>,
    Json(req): Json<SubmitSearchRequest>,
) -> ApiResult<impl IntoResponse> {
    let request_id = state.orchestrator.broker().submit(&req.query, req.context).await?;
    Ok((StatusCode::ACCEPTED, Json(SubmitSearchResponse { request_id })))
}

async fn pending_searches(State(state): State<SharedState>) -> impl IntoResponse {
    Json(state.orchestrator.broker().pending().await)
}

async fn poll_search(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.orchestrator.broker().poll(&id).await?))
}

async fn complete_search(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(req): Json<CompleteSearchRequest>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.orchestrator.broker().complete(&id, req.results).await?))
}

async fn fail_search(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(req): Json<FailRequest>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.orchestrator.broker().fail(&id, &req.error).await?))
}

async fn statistics(
    State(state): State<SharedState>,
    Query(query): Query<StatisticsQuery>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.orchestrator.jobs().statistics(query.job_id).await?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::{Collaborators, LoopSettings};
    use crate::search::PullAgent;
    use crate::store::DbHandle;
    use axum::body::Body;
    use axum::http::{Method, Request};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn test_state(collaborators: Collaborators) -> SharedState {
        let (ws_tx, _) = broadcast::channel(64);
        let orchestrator = Orchestrator::new(
            DbHandle::in_memory().unwrap(),
            collaborators,
            LoopSettings::default(),
            ws_tx.clone(),
        );
        Arc::new(AppState { orchestrator, ws_tx })
    }

    fn test_app() -> (Router, SharedState) {
        let state = test_state(Collaborators::default());
        (api_router().with_state(state.clone()), state)
    }

    async fn send(app: &Router, method: Method, uri: &str, body: Option<serde_json::Value>) -> (StatusCode, serde_json::Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(json) => {
                builder = builder.header("content-type", "application/json");
                Body::from(json.to_string())
            }
            None => Body::empty(),
        };
        let resp = app.clone().oneshot(builder.body(body).unwrap()).await.unwrap();
        let status = resp.status();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let json = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, json)
    }

    async fn harvested_job(app: &Router, names: &[&str]) -> i64 {
        let (status, body) = send(
            app,
            Method::POST,
            "/api/jobs",
            Some(serde_json::json!({"source_url": "https://apps.example.com/acme/reviews"})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let id = body["job"]["id"].as_i64().unwrap();
        let entities: Vec<_> = names.iter().map(|n| serde_json::json!({"name": n})).collect();
        let (status, _) = send(
            app,
            Method::POST,
            &format!("/api/jobs/{}/entities", id),
            Some(serde_json::json!({"entities": entities})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = send(app, Method::POST, &format!("/api/jobs/{}/harvest/complete", id), None).await;
        assert_eq!(status, StatusCode::OK);
        id
    }

    #[tokio::test]
    async fn test_health_check() {
        let (app, _) = test_app();
        let (status, body) = send(&app, Method::GET, "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_start_job_twice_conflicts() {
        let (app, _) = test_app();
        let body = serde_json::json!({"source_url": "https://apps.example.com/acme/reviews"});
        let (status, created) = send(&app, Method::POST, "/api/jobs", Some(body.clone())).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(created["job"]["label"], "acme");

        let (status, err) = send(&app, Method::POST, "/api/jobs", Some(body)).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert!(err["error"].as_str().unwrap().contains("already running"));

        let (status, resumed) = send(
            &app,
            Method::POST,
            "/api/jobs",
            Some(serde_json::json!({"source_url": "https://apps.example.com/acme/reviews", "resume": true})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(resumed["resumed"], true);
    }

    #[tokio::test]
    async fn test_start_job_invalid_url() {
        let (app, _) = test_app();
        let (status, _) = send(
            &app,
            Method::POST,
            "/api/jobs",
            Some(serde_json::json!({"source_url": "not a url"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_unknown_job_and_entity_are_404() {
        let (app, _) = test_app();
        let (status, body) = send(&app, Method::GET, "/api/jobs/99", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].as_str().unwrap().contains("99"));
        let (status, _) = send(&app, Method::POST, "/api/entities/99/skip", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_job_detail_includes_statistics() {
        let (app, _) = test_app();
        let id = harvested_job(&app, &["alpha", "beta"]).await;
        let (status, body) = send(&app, Method::GET, &format!("/api/jobs/{}", id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["job"]["phase"], "resolving_addresses");
        assert_eq!(body["statistics"]["total"], 2);
        assert_eq!(body["statistics"]["pending_address"], 2);
    }

    #[tokio::test]
    async fn test_list_job_entities_with_status_filter() {
        let (app, _) = test_app();
        let id = harvested_job(&app, &["alpha", "beta", "gamma"]).await;

        let (status, all) = send(&app, Method::GET, &format!("/api/jobs/{}/entities", id), None).await;
        assert_eq!(status, StatusCode::OK);
        let all = all.as_array().unwrap().clone();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0]["name"], "alpha");
        let alpha_id = all[0]["id"].as_i64().unwrap();

        let (status, _) = send(&app, Method::POST, &format!("/api/entities/{}/skip", alpha_id), None).await;
        assert_eq!(status, StatusCode::OK);

        let (status, pending) =
            send(&app, Method::GET, &format!("/api/jobs/{}/entities?status=pending", id), None).await;
        assert_eq!(status, StatusCode::OK);
        let names: Vec<&str> = pending
            .as_array()
            .unwrap()
            .iter()
            .map(|e| e["name"].as_str().unwrap())
            .collect();
        assert_eq!(names, vec!["beta", "gamma"]);

        let (_, skipped) =
            send(&app, Method::GET, &format!("/api/jobs/{}/entities?status=skipped", id), None).await;
        assert_eq!(skipped.as_array().unwrap().len(), 1);

        let (status, _) =
            send(&app, Method::GET, &format!("/api/jobs/{}/entities?status=bogus", id), None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let (status, _) = send(&app, Method::GET, "/api/jobs/99/entities", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_manual_flow_through_api() {
        let (app, _) = test_app();
        let id = harvested_job(&app, &["alpha"]).await;

        let (status, outcome) = send(&app, Method::POST, &format!("/api/jobs/{}/advance", id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(outcome["outcome"], "awaiting_operator");
        let entity_id = outcome["entity"]["id"].as_i64().unwrap();

        let (status, snapshot) = send(&app, Method::GET, "/api/loop", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(snapshot["state"]["state"], "owned");
        assert_eq!(snapshot["entity"]["name"], "alpha");

        let (status, _) = send(
            &app,
            Method::PUT,
            &format!("/api/entities/{}/address", entity_id),
            Some(serde_json::json!({"address": "ftp://alpha.test"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, entity) = send(
            &app,
            Method::PUT,
            &format!("/api/entities/{}/address", entity_id),
            Some(serde_json::json!({"address": "alpha.test/contact?ref=1"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(entity["address"], "https://alpha.test/contact");
        assert_eq!(entity["status"], "address_set");

        let (status, entity) = send(
            &app,
            Method::POST,
            &format!("/api/entities/{}/contacts", entity_id),
            Some(serde_json::json!({"contacts": ["info@alpha.test", "INFO@alpha.test"]})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(entity["status"], "resolved");
        assert_eq!(entity["contacts"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_resolve_without_agent_is_503() {
        let (app, _) = test_app();
        let id = harvested_job(&app, &["alpha"]).await;
        let (_, outcome) = send(&app, Method::POST, &format!("/api/jobs/{}/advance", id), None).await;
        let entity_id = outcome["entity"]["id"].as_i64().unwrap();

        let (status, body) = send(&app, Method::POST, &format!("/api/entities/{}/resolve", entity_id), None).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(body["error"].as_str().unwrap().contains("manually"));
    }

    #[tokio::test]
    async fn test_modes_round_trip() {
        let (app, _) = test_app();
        let (status, modes) = send(&app, Method::GET, "/api/settings/modes", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(modes["auto_advance"], false);

        let (status, modes) = send(
            &app,
            Method::PUT,
            "/api/settings/modes",
            Some(serde_json::json!({"auto_select": true})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(modes["auto_select"], true);
        assert_eq!(modes["auto_advance"], false);
    }

    #[tokio::test]
    async fn test_search_without_agent_is_503() {
        let (app, _) = test_app();
        let (status, _) = send(
            &app,
            Method::POST,
            "/api/search",
            Some(serde_json::json!({"query": "alpha bakery"})),
        )
        .await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_pull_agent_search_lifecycle() {
        let state = test_state(Collaborators {
            search_agent: Some(Arc::new(PullAgent)),
            ..Default::default()
        });
        let app = api_router().with_state(state);

        let (status, body) = send(
            &app,
            Method::POST,
            "/api/search",
            Some(serde_json::json!({"query": "alpha bakery", "context": {"entity_id": 1}})),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        let request_id = body["request_id"].as_str().unwrap().to_string();

        let (_, pending) = send(&app, Method::GET, "/api/search/pending", None).await;
        assert_eq!(pending[0]["request_id"], request_id.as_str());

        let (status, snapshot) = send(
            &app,
            Method::POST,
            &format!("/api/search/{}/complete", request_id),
            Some(serde_json::json!({"results": [{"address": "https://alpha.test"}]})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(snapshot["status"], "complete");

        let (_, polled) = send(&app, Method::GET, &format!("/api/search/{}", request_id), None).await;
        assert_eq!(polled["results"][0]["address"], "https://alpha.test");

        let (status, _) = send(&app, Method::GET, "/api/search/unknown-id", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_global_statistics() {
        let (app, _) = test_app();
        harvested_job(&app, &["alpha", "beta", "gamma"]).await;
        let (status, stats) = send(&app, Method::GET, "/api/statistics", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(stats["total"], 3);
        assert_eq!(stats["total_contacts"], 0);
    }
}
