//! HTTP surface of the orchestrator.

pub mod error;
pub mod handlers;
pub mod middleware;

use std::sync::Arc;

use axum::Router;
use axum::middleware::from_fn_with_state;
use axum::routing::{get, post};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::orchestrator::Orchestrator;
use crate::review::ReviewQueue;

pub use error::ApiError;

pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub reviews: ReviewQueue,
}

impl AppState {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self {
            reviews: orchestrator.review_queue(),
            orchestrator,
        }
    }
}

/// Every route but health sits behind the bearer check. Generation routes and
/// everything else count against separate rate-limit classes; auth runs first so
/// rejected requests do not use up a caller's window.
pub fn create_router(state: Arc<AppState>) -> Router {
    let generation = Router::new()
        .route("/orchestrator/generate-batch", post(handlers::generate_batch))
        .route("/orchestrator/trigger/:kind", post(handlers::trigger))
        .route_layer(from_fn_with_state(
            Arc::clone(&state),
            middleware::generation_limit,
        ));

    let status = Router::new()
        .route("/orchestrator/jobs", get(handlers::list_jobs))
        .route("/orchestrator/jobs/:job_id", get(handlers::get_job))
        .route("/orchestrator/jobs/:job_id/cancel", post(handlers::cancel_job))
        .route("/orchestrator/metrics", get(handlers::metrics))
        .route(
            "/orchestrator/decks/:course_id/:module_id",
            get(handlers::module_deck),
        )
        .route("/modules/:module_id/flashcards", get(handlers::module_flashcards))
        .route("/flashcards/review-queue", get(handlers::review_queue))
        .route("/flashcards/:card_id/approve", post(handlers::approve_card))
        .route("/flashcards/:card_id/edit", post(handlers::edit_card))
        .route_layer(from_fn_with_state(
            Arc::clone(&state),
            middleware::status_limit,
        ));

    let protected = generation
        .merge(status)
        .route_layer(from_fn_with_state(
            Arc::clone(&state),
            middleware::require_token,
        ));

    let public = Router::new()
        .route("/orchestrator/health", get(handlers::health))
        .route_layer(from_fn_with_state(
            Arc::clone(&state),
            middleware::status_limit,
        ));

    public
        .merge(protected)
        .layer(from_fn_with_state(
            Arc::clone(&state),
            middleware::redact_internal_errors,
        ))
        .with_state(state)
}

/// Serve until `shutdown` resolves, then drain the orchestrator.
pub async fn serve(
    orchestrator: Arc<Orchestrator>,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let bind = orchestrator.config().server.bind.clone();
    let listener = TcpListener::bind(&bind).await?;
    info!(addr = %listener.local_addr()?, mock_mode = orchestrator.is_mock(), "listening");

    let sweeper_stop = CancellationToken::new();
    let sweeper = orchestrator
        .registry()
        .spawn_window_sweeper(sweeper_stop.clone());

    let router = create_router(Arc::new(AppState::new(Arc::clone(&orchestrator))));
    let served = axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await;
    sweeper_stop.cancel();
    if let Err(e) = sweeper.await {
        warn!(error = %e, "rate window sweeper panicked");
    }
    orchestrator.shutdown().await;
    served
}
