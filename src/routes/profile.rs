use askama::Template;
use axum::extract::multipart::MultipartError;
use axum::extract::{DefaultBodyLimit, Multipart, State};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;

use crate::auth::SessionContext;
use crate::db::models::PostThumb;
use crate::error::{AppError, AppResult};
use crate::extractors::CurrentSession;
use crate::feed::initial;
use crate::profile::{self, avatar, AvatarFile, ProfileError, MAX_AVATAR_BYTES};
use crate::routes::home::Html;
use crate::state::AppState;

/// Request body cap for the edit form: one avatar plus the text fields.
/// Kept above the avatar limit so oversize images get a form message.
const EDIT_BODY_LIMIT: usize = MAX_AVATAR_BYTES + 4 * 1024 * 1024;

// --- Templates ---

#[derive(Template)]
#[template(path = "pages/profile.html")]
pub struct ProfileTemplate {
    pub handle: String,
    pub bio: String,
    pub initial: String,
    pub avatar_src: Option<String>,
    pub post_count: usize,
    pub post_label: &'static str,
    pub posts: Vec<PostThumb>,
}

#[derive(Template)]
#[template(path = "pages/edit_profile.html")]
pub struct EditProfileTemplate {
    pub handle: String,
    pub bio: String,
    /// Pending or current avatar, sent back on save
    pub avatar_url: String,
    pub avatar_src: Option<String>,
    pub initial: String,
    pub error: Option<String>,
    pub notice: Option<String>,
    pub saved: bool,
}

impl EditProfileTemplate {
    fn new(handle: String, bio: String, avatar_url: String) -> Self {
        let avatar_src = Some(avatar_url.as_str())
            .filter(|url| !url.is_empty())
            .map(cache_busted);
        EditProfileTemplate {
            initial: initial(&handle),
            handle,
            bio,
            avatar_url,
            avatar_src,
            error: None,
            notice: None,
            saved: false,
        }
    }
}

// --- Forms ---

/// Fields of the multipart edit form.
#[derive(Debug, Default)]
struct EditForm {
    handle: String,
    bio: String,
    avatar_url: String,
    avatar: Option<AvatarFile>,
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/profile", get(profile_page))
        .route("/profile/edit", get(edit_page).post(save))
        .route("/profile/edit/avatar", post(upload_avatar))
        .layer(DefaultBodyLimit::max(EDIT_BODY_LIMIT))
}

/// Append a `t=` query so browsers refetch a replaced avatar.
fn cache_busted(url: &str) -> String {
    let sep = if url.contains('?') { '&' } else { '?' };
    format!("{}{}t={}", url, sep, chrono::Utc::now().timestamp_millis())
}

fn post_label(count: usize) -> &'static str {
    if count == 1 {
        "post"
    } else {
        "posts"
    }
}

fn load_failed(e: ProfileError) -> AppError {
    tracing::debug!(error = %e, "Profile unavailable");
    AppError::Unavailable
}

fn bad_multipart(e: MultipartError) -> AppError {
    AppError::BadRequest(e.body_text())
}

async fn read_edit_form(mut multipart: Multipart) -> AppResult<EditForm> {
    let mut form = EditForm::default();

    while let Some(field) = multipart.next_field().await.map_err(bad_multipart)? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "handle" => form.handle = field.text().await.map_err(bad_multipart)?,
            "bio" => form.bio = field.text().await.map_err(bad_multipart)?,
            "avatar_url" => form.avatar_url = field.text().await.map_err(bad_multipart)?,
            "avatar" => {
                let file_name = field.file_name().unwrap_or_default().to_string();
                let content_type = field.content_type().unwrap_or_default().to_string();
                let data = field.bytes().await.map_err(bad_multipart)?;
                // Browsers send an empty part when no file was chosen
                if !(file_name.is_empty() && data.is_empty()) {
                    form.avatar = Some(AvatarFile {
                        file_name,
                        content_type,
                        data,
                    });
                }
            }
            _ => {}
        }
    }

    Ok(form)
}

// --- Handlers ---

/// GET /profile
async fn profile_page(
    State(state): State<AppState>,
    CurrentSession(session): CurrentSession,
) -> AppResult<Html<ProfileTemplate>> {
    let page = profile::load_page(state.backend.as_ref(), &session)
        .await
        .map_err(load_failed)?;

    let user = page.user;
    let post_count = page.posts.len();
    Ok(Html(ProfileTemplate {
        initial: initial(&user.handle),
        avatar_src: user
            .avatar_url
            .as_deref()
            .filter(|url| !url.is_empty())
            .map(cache_busted),
        handle: user.handle,
        bio: user.bio.unwrap_or_default(),
        post_count,
        post_label: post_label(post_count),
        posts: page.posts,
    }))
}

/// GET /profile/edit
async fn edit_page(
    State(state): State<AppState>,
    CurrentSession(session): CurrentSession,
) -> AppResult<Html<EditProfileTemplate>> {
    let user = profile::load_or_bootstrap(state.backend.as_ref(), &session)
        .await
        .map_err(load_failed)?;

    Ok(Html(EditProfileTemplate::new(
        user.handle,
        user.bio.unwrap_or_default(),
        user.avatar_url.unwrap_or_default(),
    )))
}

/// POST /profile/edit/avatar: store the photo and re-render the form with
/// it pending. Nothing is written to the profile until save.
async fn upload_avatar(
    State(state): State<AppState>,
    CurrentSession(session): CurrentSession,
    multipart: Multipart,
) -> AppResult<Response> {
    let mut form = read_edit_form(multipart).await?;

    let (pending, error) = match form.avatar.take() {
        Some(file) => match avatar::upload(state.backend.as_ref(), &session, file).await {
            Ok(url) => (url, None),
            Err(e) => (form.avatar_url, Some(e.to_string())),
        },
        None => (form.avatar_url, Some(avatar::AvatarError::Missing.to_string())),
    };

    let mut page = EditProfileTemplate::new(form.handle, form.bio, pending);
    page.notice = error
        .is_none()
        .then(|| "Photo uploaded. Save to apply it.".to_string());
    page.error = error;
    Ok(Html(page).into_response())
}

/// POST /profile/edit: validate and persist handle, bio and avatar. A file
/// chosen without pressing upload is stored once the text fields pass.
async fn save(
    State(state): State<AppState>,
    CurrentSession(session): CurrentSession,
    multipart: Multipart,
) -> AppResult<Response> {
    let mut form = read_edit_form(multipart).await?;

    // A form that cannot be saved must not leave a stored file behind
    if let Err(e) = profile::validate_changes(&form.handle, &form.bio, None) {
        return Ok(rerender(form, e.to_string()));
    }

    if let Some(file) = form.avatar.take() {
        match avatar::upload(state.backend.as_ref(), &session, file).await {
            Ok(url) => form.avatar_url = url,
            Err(e) => return Ok(rerender(form, e.to_string())),
        }
    }

    match persist(&state, &session, &form).await {
        Ok(()) => {
            let mut page = EditProfileTemplate::new(
                form.handle.trim().to_string(),
                form.bio.trim().to_string(),
                form.avatar_url,
            );
            page.notice = Some("Changes saved".to_string());
            page.saved = true;
            Ok(Html(page).into_response())
        }
        Err(e) => Ok(rerender(form, e.to_string())),
    }
}

async fn persist(
    state: &AppState,
    session: &SessionContext,
    form: &EditForm,
) -> Result<(), ProfileError> {
    profile::save(
        state.backend.as_ref(),
        session,
        &form.handle,
        &form.bio,
        Some(form.avatar_url.as_str()),
    )
    .await
    .map(|_| ())
}

fn rerender(form: EditForm, error: String) -> Response {
    let mut page = EditProfileTemplate::new(form.handle, form.bio, form.avatar_url);
    page.error = Some(error);
    Html(page).into_response()
}
