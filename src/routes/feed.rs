use askama::Template;
use axum::extract::State;
use axum::routing::get;
use axum::Router;

use crate::extractors::CurrentSession;
use crate::feed::{self, FeedEntry};
use crate::routes::home::Html;
use crate::state::AppState;

#[derive(Template)]
#[template(path = "pages/feed.html")]
pub struct FeedTemplate {
    pub entries: Vec<FeedEntry>,
    pub error: Option<String>,
}

pub fn router() -> Router<AppState> {
    Router::new().route("/feed", get(feed_page))
}

async fn feed_page(
    State(state): State<AppState>,
    CurrentSession(session): CurrentSession,
) -> Html<FeedTemplate> {
    match feed::load(state.backend.as_ref(), &session).await {
        Ok(entries) => Html(FeedTemplate {
            entries,
            error: None,
        }),
        Err(e) => {
            tracing::error!(user_id = %session.user_id, error = %e, "Feed load failed");
            Html(FeedTemplate {
                entries: Vec::new(),
                error: Some("Something went wrong. Please try again.".to_string()),
            })
        }
    }
}
