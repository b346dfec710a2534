//! The managed service boundary: identity, the `usuarios` and
//! `publicaciones` tables, and blob storage.
//!
//! Two implementations exist. [`SupabaseBackend`] talks to a hosted
//! Supabase project over HTTP; [`LocalBackend`] keeps the same contract on
//! top of SQLite and the filesystem.

pub mod local;
pub mod supabase;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

use crate::db::models::{AuthSession, AuthUser, FeedPost, NewUser, PostThumb, ProfileChanges, User};

pub use self::local::LocalBackend;
pub use self::supabase::SupabaseBackend;

pub const USERS_TABLE: &str = "usuarios";
pub const POSTS_TABLE: &str = "publicaciones";

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("Invalid credentials")]
    InvalidCredentials,

    /// A unique constraint rejected the write (Postgres `23505`).
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Backend returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("Storage error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Password hash error: {0}")]
    Hash(#[from] bcrypt::BcryptError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl BackendError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, BackendError::Conflict(_))
    }
}

pub type BackendResult<T> = Result<T, BackendError>;

/// Result of an account sign-up. Backends that require email confirmation
/// return no session.
#[derive(Debug, Clone)]
pub struct SignUp {
    pub user: AuthUser,
    pub session: Option<AuthSession>,
}

/// A blob to store. `content_type` is the type declared by the uploader.
#[derive(Debug, Clone)]
pub struct BlobUpload {
    pub bucket: String,
    pub key: String,
    pub content_type: String,
    pub data: Bytes,
    pub upsert: bool,
}

/// Everything the application asks of its backend.
///
/// Data calls take the caller's access token so the backend can apply its
/// own row-level rules; handle lookup happens before sign-in and is
/// anonymous.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Create an identity. `handle` is stored with it so a row can be
    /// created later when the backend withholds the session.
    async fn sign_up(&self, email: &str, password: &str, handle: Option<&str>)
        -> BackendResult<SignUp>;

    async fn sign_in_with_password(&self, email: &str, password: &str)
        -> BackendResult<AuthSession>;

    /// Resolve an access token. `Ok(None)` means the token is unknown,
    /// expired or revoked.
    async fn get_user(&self, access_token: &str) -> BackendResult<Option<AuthUser>>;

    /// Trade a refresh token for a new session. `Ok(None)` means the
    /// refresh token is no longer valid.
    async fn refresh_session(&self, refresh_token: &str) -> BackendResult<Option<AuthSession>>;

    async fn sign_out(&self, access_token: &str) -> BackendResult<()>;

    async fn find_user(&self, access_token: &str, user_id: &str) -> BackendResult<Option<User>>;

    async fn find_email_by_handle(&self, handle: &str) -> BackendResult<Option<String>>;

    /// Insert a user row, doing nothing if a row with the same id exists.
    async fn insert_user(&self, access_token: &str, user: &NewUser) -> BackendResult<()>;

    async fn update_user(
        &self,
        access_token: &str,
        user_id: &str,
        changes: &ProfileChanges,
    ) -> BackendResult<()>;

    /// All posts, newest first, joined with author and likes.
    async fn list_feed(&self, access_token: &str) -> BackendResult<Vec<FeedPost>>;

    /// One user's posts, newest first.
    async fn list_user_posts(&self, access_token: &str, user_id: &str)
        -> BackendResult<Vec<PostThumb>>;

    async fn upload(&self, access_token: &str, blob: BlobUpload) -> BackendResult<()>;

    /// Public URL for a stored blob. Pure; does not check existence.
    fn public_url(&self, bucket: &str, key: &str) -> String;
}
