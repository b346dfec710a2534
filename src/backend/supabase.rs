//! Supabase client: GoTrue for identity, PostgREST for the tables and
//! Storage for blobs.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, error, warn};

use super::{Backend, BackendError, BackendResult, BlobUpload, SignUp, POSTS_TABLE, USERS_TABLE};
use crate::db::models::{
    deserialize_timestamp, AuthSession, AuthUser, Author, FeedPost, NewUser, PostThumb,
    ProfileChanges, User,
};

/// Postgres `unique_violation`.
const UNIQUE_VIOLATION: &str = "23505";

const FEED_SELECT: &str = "id_publicacion,titulo,descripcion,imagen_url,fecha_publicacion,\
                           usuarios(usuario,foto_perfil),likes(id_like)";

#[derive(Clone)]
pub struct SupabaseBackend {
    http_client: reqwest::Client,
    api_url: String,
    anon_key: String,
}

/// PostgREST / GoTrue error payload. Fields vary between services.
#[derive(Debug, Default, Deserialize)]
struct ApiErrorBody {
    code: Option<serde_json::Value>,
    message: Option<String>,
    msg: Option<String>,
    error_description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FeedRow {
    id_publicacion: String,
    titulo: Option<String>,
    descripcion: Option<String>,
    imagen_url: String,
    #[serde(deserialize_with = "deserialize_timestamp")]
    fecha_publicacion: DateTime<Utc>,
    #[serde(default)]
    usuarios: Option<Embedded<AuthorRow>>,
    #[serde(default)]
    likes: Option<Vec<serde_json::Value>>,
}

#[derive(Debug, Deserialize)]
struct AuthorRow {
    usuario: String,
    foto_perfil: Option<String>,
}

/// PostgREST embeds a to-one relation as an object, but older schemas
/// expose it as a one-element array.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Embedded<T> {
    One(T),
    Many(Vec<T>),
}

impl<T> Embedded<T> {
    fn into_first(self) -> Option<T> {
        match self {
            Embedded::One(item) => Some(item),
            Embedded::Many(items) => items.into_iter().next(),
        }
    }
}

impl From<FeedRow> for FeedPost {
    fn from(row: FeedRow) -> Self {
        FeedPost {
            id: row.id_publicacion,
            title: row.titulo,
            description: row.descripcion,
            image_url: row.imagen_url,
            created_at: row.fecha_publicacion,
            author: row
                .usuarios
                .and_then(Embedded::into_first)
                .map(|a| Author {
                    handle: a.usuario,
                    avatar_url: a.foto_perfil,
                }),
            like_count: row.likes.map(|l| l.len()).unwrap_or(0),
        }
    }
}

#[derive(Debug, Deserialize)]
struct EmailRow {
    correo: String,
}

impl SupabaseBackend {
    /// Create a new client.
    ///
    /// # Arguments
    /// * `api_url` - The project API URL (e.g., `https://xyz.supabase.co`)
    /// * `anon_key` - The project's anonymous API key
    /// * `timeout` - Per-request timeout
    pub fn new(
        api_url: impl Into<String>,
        anon_key: impl Into<String>,
        timeout: Duration,
    ) -> BackendResult<Self> {
        let http_client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http_client,
            api_url: api_url.into().trim_end_matches('/').to_string(),
            anon_key: anon_key.into(),
        })
    }

    fn rest_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{}", self.api_url, table)
    }

    fn auth_url(&self, path: &str) -> String {
        format!("{}/auth/v1/{}", self.api_url, path)
    }

    fn object_url(&self, bucket: &str, key: &str) -> String {
        format!("{}/storage/v1/object/{}/{}", self.api_url, bucket, key)
    }

    fn request(
        &self,
        method: reqwest::Method,
        url: &str,
        access_token: &str,
    ) -> reqwest::RequestBuilder {
        self.http_client
            .request(method, url)
            .header("apikey", &self.anon_key)
            .header("Authorization", format!("Bearer {}", access_token))
    }

    /// Turn a non-success response into a [`BackendError`].
    async fn check(response: reqwest::Response) -> BackendResult<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(classify_error(status.as_u16(), &body))
    }
}

/// Map a failed response onto the error taxonomy.
fn classify_error(status: u16, body: &str) -> BackendError {
    let parsed: ApiErrorBody = serde_json::from_str(body).unwrap_or_default();
    let code = parsed.code.as_ref().map(|c| match c {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    });
    let message = parsed
        .message
        .or(parsed.msg)
        .or(parsed.error_description)
        .unwrap_or_else(|| body.to_string());

    if code.as_deref() == Some(UNIQUE_VIOLATION) {
        return BackendError::Conflict(message);
    }
    error!(status, message = %message, "Supabase request failed");
    BackendError::Api { status, message }
}

/// GoTrue keeps `data` as the user's metadata, so the chosen handle
/// survives a sign-up that waits for email confirmation.
fn sign_up_body(email: &str, password: &str, handle: Option<&str>) -> serde_json::Value {
    match handle {
        Some(handle) => serde_json::json!({
            "email": email,
            "password": password,
            "data": { "handle": handle },
        }),
        None => serde_json::json!({ "email": email, "password": password }),
    }
}

fn parse_session(body: serde_json::Value) -> BackendResult<AuthSession> {
    Ok(serde_json::from_value(body)?)
}

fn parse_sign_up(body: serde_json::Value) -> BackendResult<SignUp> {
    // With autoconfirm GoTrue answers with a session; otherwise with the bare user
    if body.get("access_token").is_some() {
        let session = parse_session(body)?;
        return Ok(SignUp {
            user: session.user.clone(),
            session: Some(session),
        });
    }
    let user: AuthUser = match body.get("user") {
        Some(user) => serde_json::from_value(user.clone())?,
        None => serde_json::from_value(body)?,
    };
    Ok(SignUp {
        user,
        session: None,
    })
}

#[async_trait]
impl Backend for SupabaseBackend {
    async fn sign_up(
        &self,
        email: &str,
        password: &str,
        handle: Option<&str>,
    ) -> BackendResult<SignUp> {
        let response = self
            .http_client
            .post(self.auth_url("signup"))
            .header("apikey", &self.anon_key)
            .json(&sign_up_body(email, password, handle))
            .send()
            .await?;
        let body: serde_json::Value = Self::check(response).await?.json().await?;
        parse_sign_up(body)
    }

    async fn sign_in_with_password(
        &self,
        email: &str,
        password: &str,
    ) -> BackendResult<AuthSession> {
        let response = self
            .http_client
            .post(self.auth_url("token?grant_type=password"))
            .header("apikey", &self.anon_key)
            .json(&serde_json::json!({ "email": email, "password": password }))
            .send()
            .await?;

        // GoTrue answers 400 for a bad email/password pair
        if response.status() == reqwest::StatusCode::BAD_REQUEST {
            let body = response.text().await.unwrap_or_default();
            debug!(body = %body, "Password sign-in rejected");
            return Err(BackendError::InvalidCredentials);
        }
        let session = Self::check(response).await?.json().await?;
        Ok(session)
    }

    async fn get_user(&self, access_token: &str) -> BackendResult<Option<AuthUser>> {
        let response = self
            .request(reqwest::Method::GET, &self.auth_url("user"), access_token)
            .send()
            .await?;

        match response.status() {
            reqwest::StatusCode::UNAUTHORIZED | reqwest::StatusCode::FORBIDDEN => {
                debug!("Access token rejected");
                Ok(None)
            }
            _ => {
                let user = Self::check(response).await?.json().await?;
                Ok(Some(user))
            }
        }
    }

    async fn refresh_session(&self, refresh_token: &str) -> BackendResult<Option<AuthSession>> {
        let response = self
            .http_client
            .post(self.auth_url("token?grant_type=refresh_token"))
            .header("apikey", &self.anon_key)
            .json(&serde_json::json!({ "refresh_token": refresh_token }))
            .send()
            .await?;

        // Revoked, reused or unknown refresh tokens come back as 400
        match response.status() {
            reqwest::StatusCode::BAD_REQUEST | reqwest::StatusCode::UNAUTHORIZED => {
                debug!("Refresh token rejected");
                Ok(None)
            }
            _ => {
                let body: serde_json::Value = Self::check(response).await?.json().await?;
                Ok(Some(parse_session(body)?))
            }
        }
    }

    async fn sign_out(&self, access_token: &str) -> BackendResult<()> {
        let response = self
            .request(reqwest::Method::POST, &self.auth_url("logout"), access_token)
            .send()
            .await?;
        if !response.status().is_success() {
            warn!(status = %response.status(), "Sign-out request failed");
        }
        Ok(())
    }

    async fn find_user(&self, access_token: &str, user_id: &str) -> BackendResult<Option<User>> {
        let response = self
            .request(reqwest::Method::GET, &self.rest_url(USERS_TABLE), access_token)
            .query(&[
                ("select", "id_usuario,usuario,correo,bio,foto_perfil".to_string()),
                ("id_usuario", format!("eq.{}", user_id)),
            ])
            .send()
            .await?;
        let rows: Vec<User> = Self::check(response).await?.json().await?;
        Ok(rows.into_iter().next())
    }

    async fn find_email_by_handle(&self, handle: &str) -> BackendResult<Option<String>> {
        let response = self
            .request(reqwest::Method::GET, &self.rest_url(USERS_TABLE), &self.anon_key)
            .query(&[
                ("select", "correo".to_string()),
                ("usuario", format!("eq.{}", handle)),
                ("limit", "1".to_string()),
            ])
            .send()
            .await?;
        let rows: Vec<EmailRow> = Self::check(response).await?.json().await?;
        Ok(rows.into_iter().next().map(|r| r.correo))
    }

    async fn insert_user(&self, access_token: &str, user: &NewUser) -> BackendResult<()> {
        let response = self
            .request(reqwest::Method::POST, &self.rest_url(USERS_TABLE), access_token)
            .query(&[("on_conflict", "id_usuario")])
            .header("Prefer", "resolution=ignore-duplicates,return=minimal")
            .json(user)
            .send()
            .await?;
        Self::check(response).await?;
        debug!(user_id = %user.id, "User row ensured");
        Ok(())
    }

    async fn update_user(
        &self,
        access_token: &str,
        user_id: &str,
        changes: &ProfileChanges,
    ) -> BackendResult<()> {
        let response = self
            .request(reqwest::Method::PATCH, &self.rest_url(USERS_TABLE), access_token)
            .query(&[("id_usuario", format!("eq.{}", user_id))])
            .header("Prefer", "return=minimal")
            .json(changes)
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    async fn list_feed(&self, access_token: &str) -> BackendResult<Vec<FeedPost>> {
        let response = self
            .request(reqwest::Method::GET, &self.rest_url(POSTS_TABLE), access_token)
            .query(&[("select", FEED_SELECT), ("order", "fecha_publicacion.desc")])
            .send()
            .await?;
        let rows: Vec<FeedRow> = Self::check(response).await?.json().await?;
        Ok(rows.into_iter().map(FeedPost::from).collect())
    }

    async fn list_user_posts(
        &self,
        access_token: &str,
        user_id: &str,
    ) -> BackendResult<Vec<PostThumb>> {
        let response = self
            .request(reqwest::Method::GET, &self.rest_url(POSTS_TABLE), access_token)
            .query(&[
                ("select", "id_publicacion,imagen_url".to_string()),
                ("id_usuario", format!("eq.{}", user_id)),
                ("order", "fecha_publicacion.desc".to_string()),
            ])
            .send()
            .await?;
        let rows = Self::check(response).await?.json().await?;
        Ok(rows)
    }

    async fn upload(&self, access_token: &str, blob: BlobUpload) -> BackendResult<()> {
        let url = self.object_url(&blob.bucket, &blob.key);
        debug!(key = %blob.key, bytes = blob.data.len(), "Uploading blob");

        let response = self
            .request(reqwest::Method::POST, &url, access_token)
            .header("Content-Type", blob.content_type)
            .header("x-upsert", if blob.upsert { "true" } else { "false" })
            .body(blob.data)
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    fn public_url(&self, bucket: &str, key: &str) -> String {
        format!("{}/storage/v1/object/public/{}/{}", self.api_url, bucket, key)
    }
}

impl std::fmt::Debug for SupabaseBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SupabaseBackend")
            .field("api_url", &self.api_url)
            .finish_non_exhaustive()
    }
}
