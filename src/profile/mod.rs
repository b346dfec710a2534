//! Profile loading, bootstrap and editing.

pub mod avatar;

use thiserror::Error;
use tracing::{error, info, warn};

use crate::auth::SessionContext;
use crate::backend::Backend;
use crate::db::models::{NewUser, PostThumb, ProfileChanges, User};

pub use avatar::{AvatarError, AvatarFile, AVATAR_BUCKET, MAX_AVATAR_BYTES};

pub const MIN_HANDLE_CHARS: usize = 3;
pub const MAX_BIO_CHARS: usize = 200;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProfileError {
    #[error("Could not load the profile.")]
    LoadFailed,
    #[error("Handle is required.")]
    HandleRequired,
    #[error("Handle must be at least 3 characters.")]
    HandleTooShort,
    #[error("Bio must be 200 characters or fewer.")]
    BioTooLong,
    #[error("That photo does not belong to this account.")]
    ForeignAvatar,
    #[error("That handle is already in use.")]
    HandleTaken,
    #[error("Could not save changes.")]
    SaveFailed,
}

/// A profile with its posts, newest first.
#[derive(Debug, Clone)]
pub struct ProfilePage {
    pub user: User,
    pub posts: Vec<PostThumb>,
}

/// Handle given to a bootstrapped row: the email's local part.
pub fn default_handle(email: &str) -> String {
    email
        .split('@')
        .next()
        .map(str::trim)
        .filter(|local| !local.is_empty())
        .unwrap_or("user")
        .to_string()
}

/// Handles to try for a bootstrapped row: the one picked at sign-up, then
/// the email's local part.
fn bootstrap_handles(session: &SessionContext) -> Vec<String> {
    let mut handles = Vec::with_capacity(2);
    if let Some(chosen) = session
        .preferred_handle
        .as_deref()
        .map(str::trim)
        .filter(|h| !h.is_empty())
    {
        handles.push(chosen.to_string());
    }
    let fallback = default_handle(&session.email);
    if !handles.contains(&fallback) {
        handles.push(fallback);
    }
    handles
}

/// Fetch the caller's row, creating it when missing. Creation is
/// best-effort: a failed insert is logged and the defaults are returned.
pub async fn load_or_bootstrap(
    backend: &dyn Backend,
    session: &SessionContext,
) -> Result<User, ProfileError> {
    match backend.find_user(&session.access_token, &session.user_id).await {
        Ok(Some(user)) => Ok(user),
        Ok(None) => {
            let mut row = NewUser {
                id: session.user_id.clone(),
                handle: String::new(),
                email: session.email.clone(),
                bio: String::new(),
            };
            for handle in bootstrap_handles(session) {
                row.handle = handle;
                match backend.insert_user(&session.access_token, &row).await {
                    Ok(()) => {
                        info!(user_id = %row.id, handle = %row.handle, "Bootstrapped user row");
                        break;
                    }
                    // Someone took the handle since sign-up; try the next one
                    Err(e) if e.is_conflict() => {
                        warn!(user_id = %row.id, handle = %row.handle, "Bootstrap handle taken")
                    }
                    Err(e) => {
                        warn!(user_id = %row.id, error = %e, "Could not bootstrap user row");
                        break;
                    }
                }
            }
            Ok(User {
                id: row.id,
                handle: row.handle,
                email: row.email,
                bio: Some(row.bio),
                avatar_url: None,
            })
        }
        Err(e) => {
            error!(user_id = %session.user_id, error = %e, "Profile load failed");
            Err(ProfileError::LoadFailed)
        }
    }
}

pub async fn load_page(
    backend: &dyn Backend,
    session: &SessionContext,
) -> Result<ProfilePage, ProfileError> {
    let user = load_or_bootstrap(backend, session).await?;
    let posts = backend
        .list_user_posts(&session.access_token, &session.user_id)
        .await
        .unwrap_or_else(|e| {
            warn!(user_id = %session.user_id, error = %e, "Could not load profile posts");
            Vec::new()
        });
    Ok(ProfilePage { user, posts })
}

/// Local checks for the edit form. Handle and bio are trimmed; an empty
/// avatar URL means "no avatar".
pub fn validate_changes(
    handle: &str,
    bio: &str,
    avatar_url: Option<&str>,
) -> Result<ProfileChanges, ProfileError> {
    let handle = handle.trim();
    if handle.is_empty() {
        return Err(ProfileError::HandleRequired);
    }
    if handle.chars().count() < MIN_HANDLE_CHARS {
        return Err(ProfileError::HandleTooShort);
    }

    let bio = bio.trim();
    if bio.chars().count() > MAX_BIO_CHARS {
        return Err(ProfileError::BioTooLong);
    }

    Ok(ProfileChanges {
        handle: handle.to_string(),
        bio: bio.to_string(),
        avatar_url: avatar_url
            .map(str::trim)
            .filter(|url| !url.is_empty())
            .map(str::to_string),
    })
}

/// Validate and persist the edit form, including a pending avatar URL.
pub async fn save(
    backend: &dyn Backend,
    session: &SessionContext,
    handle: &str,
    bio: &str,
    avatar_url: Option<&str>,
) -> Result<ProfileChanges, ProfileError> {
    let changes = validate_changes(handle, bio, avatar_url)?;

    if let Some(url) = changes.avatar_url.as_deref() {
        if !avatar::is_owned_url(backend, &session.user_id, url) {
            // Only the avatar already on file may come from elsewhere
            let current = backend
                .find_user(&session.access_token, &session.user_id)
                .await
                .map_err(|e| {
                    error!(user_id = %session.user_id, error = %e, "Profile lookup failed");
                    ProfileError::SaveFailed
                })?
                .and_then(|u| u.avatar_url);
            if current.as_deref() != Some(url) {
                warn!(user_id = %session.user_id, "Rejected avatar outside the caller's namespace");
                return Err(ProfileError::ForeignAvatar);
            }
        }
    }

    match backend
        .update_user(&session.access_token, &session.user_id, &changes)
        .await
    {
        Ok(()) => {
            info!(user_id = %session.user_id, "Profile saved");
            Ok(changes)
        }
        Err(e) if e.is_conflict() => Err(ProfileError::HandleTaken),
        Err(e) => {
            error!(user_id = %session.user_id, error = %e, "Profile save failed");
            Err(ProfileError::SaveFailed)
        }
    }
}
