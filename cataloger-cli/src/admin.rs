//! Small admin HTTP surface: a liveness/metrics endpoint and a webhook the
//! document service can call right after it finishes consuming a file, so
//! the next poll doesn't have to wait out the rest of the interval.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use cataloger::workflow::Cataloger;

#[derive(Clone)]
struct AdminState {
    cataloger: Arc<Cataloger>,
}

async fn metrics(State(state): State<AdminState>) -> String {
    format!("cataloger_up 1\ncataloger_cancelled {}\n", state.cataloger.cancellation_token().is_cancelled() as u8)
}

async fn notify_post_consumption(State(state): State<AdminState>) -> StatusCode {
    state.cataloger.notify_handle().notify_one();
    StatusCode::NO_CONTENT
}

/// Serves the admin endpoints on `listen_address` until `shutdown` fires,
/// then waits up to ten seconds for in-flight requests to finish.
pub async fn serve(listen_address: String, cataloger: Arc<Cataloger>, shutdown: CancellationToken) -> anyhow::Result<()> {
    let state = AdminState { cataloger };
    let app = Router::new()
        .route("/metrics", get(metrics))
        .route("/notify/post-consumption", post(notify_post_consumption))
        .with_state(state);

    let listener = TcpListener::bind(&listen_address).await?;
    tracing::info!(%listen_address, "admin server listening");

    let serving = axum::serve(listener, app).with_graceful_shutdown(async move {
        shutdown.cancelled().await;
        tracing::info!("admin server shutting down");
    });

    match tokio::time::timeout(Duration::from_secs(10), serving).await {
        Ok(result) => result.map_err(Into::into),
        Err(_) => {
            tracing::warn!("admin server did not drain in time, dropping remaining connections");
            Ok(())
        }
    }
}
