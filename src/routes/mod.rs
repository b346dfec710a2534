pub mod assets;
pub mod auth;
pub mod feed;
pub mod home;
pub mod media;
pub mod profile;

use axum::middleware;
use axum::routing::get;
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::extractors::session_layer;
use crate::state::AppState;

/// Every page and form endpoint, with request tracing. Pages that need the
/// caller go through the session layer, which also renews expired tokens.
pub fn build_router(state: AppState) -> Router {
    let pages = Router::new()
        .route("/", get(home::index))
        .merge(feed::router())
        .merge(profile::router())
        .route_layer(middleware::from_fn_with_state(state.clone(), session_layer));

    Router::new()
        .route("/assets/{*path}", get(assets::serve))
        .route("/media/{*path}", get(media::serve))
        .merge(auth::router())
        .merge(pages)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
