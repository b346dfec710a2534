use bytes::Bytes;
use thiserror::Error;

use crate::auth::SessionContext;
use crate::backend::{Backend, BlobUpload};

pub const AVATAR_BUCKET: &str = "imagenes_perfil";

/// Largest accepted avatar, inclusive.
pub const MAX_AVATAR_BYTES: usize = 15 * 1024 * 1024;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AvatarError {
    #[error("Choose an image to upload.")]
    Missing,
    #[error("Only images are allowed.")]
    NotAnImage,
    #[error("The image is too large (max 15MB).")]
    TooLarge,
    #[error("Could not upload the photo.")]
    UploadFailed,
}

/// A file received from the edit form.
#[derive(Debug, Clone)]
pub struct AvatarFile {
    pub file_name: String,
    pub content_type: String,
    pub data: Bytes,
}

pub fn validate(content_type: &str, size: usize) -> Result<(), AvatarError> {
    if !content_type.starts_with("image/") {
        return Err(AvatarError::NotAnImage);
    }
    if size > MAX_AVATAR_BYTES {
        return Err(AvatarError::TooLarge);
    }
    Ok(())
}

/// Storage key `{user_id}/{unix_millis}-{file_name}`. The timestamp keeps
/// successive uploads from colliding; the name is reduced to a safe set.
pub fn object_key(user_id: &str, unix_millis: i64, file_name: &str) -> String {
    let base = file_name.rsplit(['/', '\\']).next().unwrap_or_default();
    let sanitized: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let name = sanitized.trim_start_matches('.');
    let name = if name.is_empty() { "avatar" } else { name };
    format!("{}/{}-{}", user_id, unix_millis, name)
}

/// Prefix every avatar URL of `user_id` starts with.
pub fn owned_prefix(backend: &dyn Backend, user_id: &str) -> String {
    backend.public_url(AVATAR_BUCKET, &format!("{}/", user_id))
}

/// Whether `url` names an object directly inside the caller's namespace.
/// The rest after [`owned_prefix`] must be one key segment of the shape
/// [`object_key`] produces, so `..`, nested paths and percent escapes that
/// could climb into another namespace are refused.
pub fn is_owned_url(backend: &dyn Backend, user_id: &str, url: &str) -> bool {
    let Some(rest) = url.strip_prefix(&owned_prefix(backend, user_id)) else {
        return false;
    };
    !rest.is_empty()
        && !rest.starts_with('.')
        && rest
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
}

/// Validate and store an avatar, returning its public URL. The URL is not
/// written to the profile; saving the form does that.
pub async fn upload(
    backend: &dyn Backend,
    session: &SessionContext,
    file: AvatarFile,
) -> Result<String, AvatarError> {
    if file.data.is_empty() && file.file_name.is_empty() {
        return Err(AvatarError::Missing);
    }
    validate(&file.content_type, file.data.len())?;

    let key = object_key(
        &session.user_id,
        chrono::Utc::now().timestamp_millis(),
        &file.file_name,
    );
    let blob = BlobUpload {
        bucket: AVATAR_BUCKET.to_string(),
        key: key.clone(),
        content_type: file.content_type,
        data: file.data,
        upsert: true,
    };

    backend
        .upload(&session.access_token, blob)
        .await
        .map_err(|e| {
            tracing::error!(user_id = %session.user_id, error = %e, "Avatar upload failed");
            AvatarError::UploadFailed
        })?;

    tracing::info!(user_id = %session.user_id, key = %key, "Avatar uploaded");
    Ok(backend.public_url(AVATAR_BUCKET, &key))
}
