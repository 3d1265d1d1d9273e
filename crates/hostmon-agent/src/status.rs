use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use hostmon_scheduler::{ManagerHandle, SchedulerError};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct StatusParams {
    #[serde(default = "default_command")]
    query: String,
}

fn default_command() -> String {
    "metrics".to_string()
}

pub fn status_routes(handle: ManagerHandle) -> Router {
    Router::new().route("/status", get(status)).with_state(handle)
}

/// `GET /status[?query=<command>]`: the scheduler's answer as plain text.
async fn status(
    State(handle): State<ManagerHandle>,
    Query(params): Query<StatusParams>,
) -> impl IntoResponse {
    match handle.query(&params.query).await {
        Ok(report) => (StatusCode::OK, report),
        Err(e @ SchedulerError::UnknownRequest(_)) => (StatusCode::BAD_REQUEST, e.to_string()),
        Err(e) => {
            tracing::error!(error = %e, "Status query failed");
            (StatusCode::SERVICE_UNAVAILABLE, e.to_string())
        }
    }
}
