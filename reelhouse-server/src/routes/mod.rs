use axum::{
    Router,
    http::Method,
    routing::{get, post},
};
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::{
    handlers::{jobs, system},
    infra::app_state::AppState,
};

/// Job control API, mounted under `/api`.
pub fn create_api_router() -> Router<AppState> {
    Router::new()
        .route(
            "/jobs",
            post(jobs::submit_job_handler).get(jobs::list_jobs_handler),
        )
        .route("/jobs/{id}", get(jobs::job_status_handler))
        .route("/jobs/{id}/cancel", post(jobs::cancel_job_handler))
        .route("/capabilities", get(system::capabilities_handler))
        .route("/queue", get(system::queue_handler))
}

/// Full application router with middleware.
pub fn create_app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(system::health_handler))
        .nest("/api", create_api_router())
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors),
        )
        .with_state(state)
}
