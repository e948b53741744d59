//! Thin HTTP adapter, gated behind the `rest-api` feature.
//!
//! Scope is deliberately narrow: a liveness probe for orchestrators, and a
//! manual-trigger endpoint. The full CRUD surface the original project
//! exposes over REST is out of scope here — [`crate::scheduler::Scheduler`]
//! is driven by cron internally and by direct calls from whatever owns the
//! process for everything else.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use tower_http::trace::TraceLayer;

use crate::scheduler::Scheduler;
use crate::store::models::Id;
use crate::store::Store;

#[derive(Clone)]
struct ApiState {
    store: Arc<Store>,
    scheduler: Arc<Scheduler>,
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Serialize)]
struct TriggerBody {
    task_id: Id,
    status: &'static str,
}

pub fn router(store: Arc<Store>, scheduler: Arc<Scheduler>) -> Router {
    let state = ApiState { store, scheduler };
    Router::new()
        .route("/healthz", get(healthz))
        .route("/tasks/{id}/run", post(trigger_task))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Binds and serves until the process is shut down. Returns once the
/// listener is closed; callers typically race this against a shutdown
/// signal with `tokio::select!`.
pub async fn run_server(bind_addr: &str, store: Arc<Store>, scheduler: Arc<Scheduler>) -> anyhow::Result<()> {
    let app = router(store, scheduler);
    let addr: SocketAddr = bind_addr.parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "http adapter listening");
    axum::serve(listener, app).await?;
    Ok(())
}

async fn healthz() -> impl IntoResponse {
    StatusCode::OK
}

async fn trigger_task(State(state): State<ApiState>, Path(task_id): Path<Id>) -> impl IntoResponse {
    match state.store.get_task(task_id).await {
        Ok(Some(task)) => {
            state.scheduler.execute_now(task);
            (
                StatusCode::ACCEPTED,
                Json(TriggerBody {
                    task_id,
                    status: "queued",
                }),
            )
                .into_response()
        }
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(ErrorBody {
                error: format!("task {task_id} not found"),
            }),
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorBody { error: e.to_string() }),
        )
            .into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::crypto::Codec;
    use crate::pipeline::Pipeline;
    use crate::providers::registry::Registry;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    async fn test_state() -> (Arc<Store>, Arc<Scheduler>) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("api-test.db");
        let url = format!("sqlite://{}?mode=rwc", path.display());
        let codec = Codec::from_master_secret(b"test-master-secret-32-bytes-long");
        let store = Arc::new(Store::connect(&url, codec).await.unwrap());
        std::mem::forget(dir);

        let settings = Settings::default();
        let cli_mutex = Arc::new(tokio::sync::Mutex::new(()));
        let registry = Arc::new(Registry::new(&settings, cli_mutex.clone()));
        let pipeline = Arc::new(Pipeline::new(settings.clone(), store.clone(), registry, cli_mutex));
        let scheduler = Scheduler::new(&settings, store.clone(), pipeline);
        (store, scheduler)
    }

    #[tokio::test]
    async fn healthz_returns_ok() {
        let (store, scheduler) = test_state().await;
        let app = router(store, scheduler);
        let response = app
            .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn trigger_unknown_task_is_not_found() {
        let (store, scheduler) = test_state().await;
        let app = router(store, scheduler);
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/tasks/999/run")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
