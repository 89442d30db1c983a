//! JSON control API over the harvest engine.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path as AxumPath, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use harvest_sync::{Controller, HarvestRuntime, SyncOp};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{error, info};

#[derive(Clone)]
pub struct AppState {
    pub controller: Arc<Controller>,
}

impl AppState {
    pub fn new(controller: Arc<Controller>) -> Self {
        Self { controller }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueryRequest {
    pub identities: Vec<String>,
    /// Report presence only.
    #[serde(default)]
    pub found_only: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HarvestRequest {
    pub identities: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SimilarRequest {
    pub identity: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct IngestRequest {
    /// Defaults to the engine's own append log.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/status", get(status_handler))
        .route("/reset", post(reset_handler))
        .route("/start", post(start_handler))
        .route("/stop", post(stop_handler))
        .route("/cycle", post(cycle_handler))
        .route("/stats", get(stats_handler))
        .route("/sync/{op}", post(sync_handler))
        .route("/ingest-log", post(ingest_handler))
        .route("/query", post(query_handler))
        .route("/harvest", post(harvest_handler))
        .route("/harvest-similar", post(similar_handler))
        .with_state(Arc::new(state))
}

/// Serve until the listener fails or a cycle fails fatally. A fatal cycle
/// shuts the server down and is returned as the error.
pub async fn serve(runtime: HarvestRuntime) -> anyhow::Result<()> {
    let mut fatal = runtime.fatal_signal();
    let listener = TcpListener::bind(("0.0.0.0", runtime.config.web_port)).await?;
    info!(port = runtime.config.web_port, "control API listening");

    let mut shutdown = fatal.clone();
    axum::serve(listener, app(AppState::new(runtime.controller.clone())))
        .with_graceful_shutdown(async move {
            while shutdown.changed().await.is_ok() {
                if shutdown.borrow().is_some() {
                    break;
                }
            }
        })
        .await?;

    let halted = fatal.borrow_and_update().clone();
    if let Some(message) = halted {
        error!(error = %message, "engine halted; exiting");
        anyhow::bail!("engine halted after fatal cycle error: {message}");
    }
    Ok(())
}

async fn status_handler(State(state): State<Arc<AppState>>) -> Response {
    respond(state.controller.status().await)
}

async fn reset_handler(State(state): State<Arc<AppState>>) -> Response {
    respond(state.controller.reset_cooldown().await)
}

async fn start_handler(State(state): State<Arc<AppState>>) -> Response {
    respond(state.controller.start().await)
}

async fn stop_handler(State(state): State<Arc<AppState>>) -> Response {
    respond(state.controller.stop().await)
}

async fn cycle_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(state.controller.run_now().await).into_response()
}

async fn stats_handler(State(state): State<Arc<AppState>>) -> Response {
    respond(state.controller.stats().await)
}

async fn sync_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(op): AxumPath<String>,
) -> Response {
    match op.parse::<SyncOp>() {
        Ok(op) => respond(state.controller.sync(op).await),
        Err(err) => error_response(StatusCode::NOT_FOUND, err),
    }
}

async fn ingest_handler(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    let request = if body.is_empty() {
        IngestRequest::default()
    } else {
        match serde_json::from_slice::<IngestRequest>(&body) {
            Ok(request) => request,
            Err(err) => return error_response(StatusCode::BAD_REQUEST, err.into()),
        }
    };
    respond(state.controller.load_log(request.path.as_deref()).await)
}

async fn query_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<QueryRequest>,
) -> Response {
    let identities = request
        .identities
        .into_iter()
        .map(|i| i.trim().to_string())
        .filter(|i| !i.is_empty())
        .collect::<BTreeSet<_>>();
    if request.found_only {
        respond(state.controller.query_found(&identities).await)
    } else {
        respond(state.controller.query(&identities).await)
    }
}

async fn harvest_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<HarvestRequest>,
) -> Response {
    respond(state.controller.harvest_accounts(request.identities).await)
}

async fn similar_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<SimilarRequest>,
) -> Response {
    respond(state.controller.harvest_similar(request.identity.trim()).await)
}

fn respond<T: Serialize>(result: anyhow::Result<T>) -> Response {
    match result {
        Ok(value) => Json(value).into_response(),
        Err(err) => error_response(StatusCode::INTERNAL_SERVER_ERROR, err),
    }
}

fn error_response(status: StatusCode, err: anyhow::Error) -> Response {
    (
        status,
        Json(ErrorBody {
            error: format!("{err:#}"),
        }),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{header, Request};
    use chrono::{TimeZone, Utc};
    use harvest_adapters::{FixtureFeed, FixturePost, FixtureProfile, FixtureProvider};
    use harvest_core::ProfileSnapshot;
    use harvest_sync::{HarvestConfig, Startup};
    use http_body_util::BodyExt;
    use serde_json::Value;
    use tempfile::{tempdir, TempDir};
    use tower::ServiceExt;

    async fn test_app() -> (TempDir, Arc<FixtureProvider>, Router) {
        let dir = tempdir().expect("tempdir");
        let published_at = Utc
            .with_ymd_and_hms(2026, 3, 1, 9, 0, 0)
            .single()
            .expect("valid timestamp");
        let provider = Arc::new(FixtureProvider::new(FixtureFeed {
            posts: vec![FixturePost::new("p1", published_at, &[])],
            ..FixtureFeed::default()
        }));
        provider
            .set_profile(
                "maple.studio",
                FixtureProfile::Profile(ProfileSnapshot {
                    username: "maple.studio".into(),
                    media_count: 40,
                    followers: 900,
                    followees: 120,
                    is_private: false,
                    biography: "studio@maple.example".into(),
                    external_url: None,
                    is_verified: false,
                }),
            )
            .await;
        let mut config = HarvestConfig::rooted_at(dir.path());
        config.cycle_cron = "0 0 0 1 1 *".into();
        let runtime = HarvestRuntime::build(config, provider.clone(), Startup::Resume)
            .await
            .expect("runtime");
        (dir, provider, app(AppState::new(runtime.controller)))
    }

    async fn call(
        app: &Router,
        method: &str,
        uri: &str,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut request = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(json) => {
                request = request.header(header::CONTENT_TYPE, "application/json");
                Body::from(json.to_string())
            }
            None => Body::empty(),
        };
        let resp = app
            .clone()
            .oneshot(request.body(body).expect("request"))
            .await
            .expect("response");
        let status = resp.status();
        let bytes = resp.into_body().collect().await.expect("body").to_bytes();
        (status, serde_json::from_slice(&bytes).expect("json body"))
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn status_reflects_start_and_stop() {
        let (_dir, _provider, app) = test_app().await;

        let (status, body) = call(&app, "GET", "/status", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["initialized"], true);
        assert_eq!(body["cooldown"], false);
        assert_eq!(body["scheduled"], false);

        let (_, body) = call(&app, "POST", "/start", None).await;
        assert_eq!(body["scheduled"], true);
        let (_, body) = call(&app, "POST", "/stop", None).await;
        assert_eq!(body["scheduled"], false);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn cycle_reports_its_outcome() {
        let (_dir, _provider, app) = test_app().await;
        let (status, body) = call(&app, "POST", "/cycle", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["result"], "ran");
        assert_eq!(body["outcome"]["outcome"], "refilled");
        assert_eq!(body["outcome"]["added"], 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn harvest_sync_and_query_round() {
        let (_dir, _provider, app) = test_app().await;
        let (status, body) = call(
            &app,
            "POST",
            "/harvest",
            Some(serde_json::json!({"identities": ["maple.studio", "nobody"]})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["stored"], 1);

        let (status, body) = call(&app, "POST", "/sync/flush-primary", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["rows_read"], 1);

        let (_, body) = call(
            &app,
            "POST",
            "/query",
            Some(serde_json::json!({"identities": ["maple.studio", "nobody"]})),
        )
        .await;
        assert_eq!(body["maple.studio"]["follower_count"], 900);
        assert_eq!(body["maple.studio"]["bio_has_contact_marker"], true);
        assert!(body["nobody"].is_null());

        let (_, body) = call(&app, "GET", "/stats", None).await;
        assert_eq!(body["tiers"]["primary"], 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn similar_accounts_are_harvested() {
        let (_dir, provider, app) = test_app().await;
        provider
            .set_similar("maple.studio", &["maple.studio", "nobody"])
            .await;
        let (status, body) = call(
            &app,
            "POST",
            "/harvest-similar",
            Some(serde_json::json!({"identity": "maple.studio"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["stored"], 1);
        assert_eq!(body["not_found"], serde_json::json!(["nobody"]));

        let (status, _) = call(
            &app,
            "POST",
            "/harvest-similar",
            Some(serde_json::json!({"identity": "nobody"})),
        )
        .await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unknown_sync_operation_is_not_found() {
        let (_dir, _provider, app) = test_app().await;
        let (status, body) = call(&app, "POST", "/sync/truncate", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].as_str().expect("message").contains("truncate"));
    }
}
