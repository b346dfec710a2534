use chrono::{DateTime, Datelike, Utc};

use crate::auth::SessionContext;
use crate::backend::{Backend, BackendResult};
use crate::db::models::FeedPost;

/// A post prepared for the feed template.
pub struct FeedEntry {
    pub id: String,
    pub author: String,
    pub author_initial: String,
    pub author_avatar: Option<String>,
    pub age: String,
    pub image_url: String,
    pub alt: String,
    pub description: Option<String>,
    pub like_count: usize,
}

impl FeedEntry {
    pub fn from_post(post: FeedPost, now: DateTime<Utc>) -> Self {
        let (author, author_initial, author_avatar) = match post.author {
            Some(a) => {
                let letter = initial(&a.handle);
                (a.handle, letter, a.avatar_url)
            }
            None => ("Unknown user".to_string(), "?".to_string(), None),
        };
        let alt = post
            .title
            .filter(|t| !t.trim().is_empty())
            .unwrap_or_else(|| "Post".to_string());

        FeedEntry {
            id: post.id,
            author_initial,
            author,
            author_avatar: author_avatar.filter(|u| !u.is_empty()),
            age: format_relative_time(post.created_at, now),
            image_url: post.image_url,
            alt,
            description: post.description.filter(|d| !d.trim().is_empty()),
            like_count: post.like_count,
        }
    }
}

/// Uppercased first character of a handle, `?` when there is none.
pub fn initial(handle: &str) -> String {
    handle
        .chars()
        .next()
        .map(|c| c.to_uppercase().collect())
        .unwrap_or_else(|| "?".to_string())
}

/// Load the feed, newest first, as the caller sees it.
pub async fn load(backend: &dyn Backend, session: &SessionContext) -> BackendResult<Vec<FeedEntry>> {
    let posts = backend.list_feed(&session.access_token).await?;
    tracing::debug!(count = posts.len(), "Loaded feed");

    let now = Utc::now();
    Ok(posts
        .into_iter()
        .map(|post| FeedEntry::from_post(post, now))
        .collect())
}

/// Label the age of `created` relative to `now`.
///
/// Under a minute (or in the future) is `now`; then whole minutes, hours
/// and days up to a week; older posts get a short date, with the year only
/// when it differs from `now`'s.
pub fn format_relative_time(created: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let diff = now.signed_duration_since(created);

    let seconds = diff.num_seconds();
    if seconds < 60 {
        return "now".to_string();
    }

    let minutes = diff.num_minutes();
    if minutes < 60 {
        return format!("{}m", minutes);
    }

    let hours = diff.num_hours();
    if hours < 24 {
        return format!("{}h", hours);
    }

    let days = diff.num_days();
    if days < 7 {
        return format!("{}d", days);
    }

    if created.year() == now.year() {
        created.format("%b %-d").to_string()
    } else {
        created.format("%b %-d, %Y").to_string()
    }
}
