//! HTTP server and routes.

mod handlers;
mod state;

pub use state::AppState;

use axum::{Router, http::StatusCode, routing::get};
use tower_http::{cors::CorsLayer, timeout::TimeoutLayer, trace::TraceLayer};

/// Create the application router.
pub fn create_router(state: AppState) -> Router {
    let timeout = state.config.server.request_timeout();

    let book_routes = Router::new()
        .route("/{id}", get(handlers::book_entry))
        .route("/{id}/file/{format}", get(handlers::book_download))
        .route("/{id}/cover", get(handlers::book_cover));

    let opds_routes = Router::new()
        .route("/", get(handlers::catalog_root))
        .route("/opensearch.xml", get(handlers::opensearch))
        .route("/search", get(handlers::catalog_search))
        .route("/new", get(handlers::catalog_new))
        .route("/titles", get(handlers::catalog_titles))
        .route("/authors", get(handlers::authors))
        .route("/authors/{id}", get(handlers::author_books))
        .route("/series", get(handlers::series))
        .route("/series/{id}", get(handlers::series_books))
        .route("/tags", get(handlers::tags))
        .route("/tags/{id}", get(handlers::tag_books))
        .nest("/books", book_routes);

    Router::new()
        .route("/healthz", get(handlers::healthz))
        .route("/ready", get(handlers::ready))
        .nest("/opds", opds_routes)
        .layer(TimeoutLayer::with_status_code(StatusCode::REQUEST_TIMEOUT, timeout))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
