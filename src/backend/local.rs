// Embedded backend: SQLite tables, bcrypt identities and on-disk blobs
use async_trait::async_trait;
use rand::Rng;
use rusqlite::{params, OptionalExtension};
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};

use super::{Backend, BackendError, BackendResult, BlobUpload, SignUp};
use crate::db::models::{
    parse_timestamp, AuthSession, AuthUser, Author, FeedPost, NewUser, PostThumb, ProfileChanges,
    User, UserMetadata,
};
use crate::state::DbPool;

/// Mount point of [`LocalBackend`] blobs in the HTTP router.
pub const MEDIA_PREFIX: &str = "/media";

#[derive(Clone)]
pub struct LocalBackend {
    db: DbPool,
    media_root: PathBuf,
    session_hours: u64,
    hash_cost: u32,
}

impl LocalBackend {
    pub fn new(db: DbPool, media_root: impl Into<PathBuf>, session_hours: u64) -> Self {
        Self {
            db,
            media_root: media_root.into(),
            session_hours,
            hash_cost: bcrypt::DEFAULT_COST,
        }
    }

    /// Override the bcrypt cost. Tests use 4, the lowest bcrypt accepts.
    pub fn with_hash_cost(mut self, cost: u32) -> Self {
        self.hash_cost = cost;
        self
    }

    pub fn db(&self) -> &DbPool {
        &self.db
    }

    pub fn media_root(&self) -> &Path {
        &self.media_root
    }

    /// Resolve a blob path relative to the media root, rejecting anything
    /// that would escape it.
    pub fn blob_path(&self, relative: &str) -> Option<PathBuf> {
        let relative = Path::new(relative);
        let safe = relative
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
        if !safe || relative.as_os_str().is_empty() {
            return None;
        }
        Some(self.media_root.join(relative))
    }

    /// Issue an access token and its single-use refresh token.
    fn create_session(&self, user: AuthUser) -> BackendResult<AuthSession> {
        let conn = self.db.get()?;
        let token = generate_token();
        let refresh_token = generate_token();
        let id = uuid::Uuid::now_v7().to_string();

        conn.execute(
            "INSERT INTO sessions (id, user_id, token, refresh_token, expires_at) \
             VALUES (?1, ?2, ?3, ?4, datetime('now', ?5))",
            params![id, user.id, token, refresh_token, format!("+{} hours", self.session_hours)],
        )?;

        Ok(AuthSession {
            access_token: token,
            refresh_token: Some(refresh_token),
            expires_in: Some(self.session_hours * 3600),
            user,
        })
    }
}

#[async_trait]
impl Backend for LocalBackend {
    async fn sign_up(
        &self,
        email: &str,
        password: &str,
        handle: Option<&str>,
    ) -> BackendResult<SignUp> {
        let hash = bcrypt::hash(password, self.hash_cost)?;
        let id = uuid::Uuid::now_v7().to_string();

        {
            let conn = self.db.get()?;
            conn.execute(
                "INSERT INTO auth_users (id, email, password_hash, handle) VALUES (?1, ?2, ?3, ?4)",
                params![id, email, hash, handle],
            )
            .map_err(map_constraint)?;
        }

        tracing::info!(user_id = %id, "Account created");
        let user = AuthUser {
            id,
            email: email.to_string(),
            user_metadata: UserMetadata {
                handle: handle.map(str::to_string),
            },
        };
        let session = self.create_session(user.clone())?;

        Ok(SignUp {
            user,
            session: Some(session),
        })
    }

    async fn sign_in_with_password(
        &self,
        email: &str,
        password: &str,
    ) -> BackendResult<AuthSession> {
        let row: Option<(AuthUser, String)> = {
            let conn = self.db.get()?;
            conn.query_row(
                "SELECT id, email, handle, password_hash FROM auth_users WHERE email = ?1",
                params![email],
                |r| Ok((auth_user(r)?, r.get(3)?)),
            )
            .optional()?
        };

        let Some((user, hash)) = row else {
            return Err(BackendError::InvalidCredentials);
        };
        if !bcrypt::verify(password, &hash)? {
            return Err(BackendError::InvalidCredentials);
        }

        self.create_session(user)
    }

    async fn get_user(&self, access_token: &str) -> BackendResult<Option<AuthUser>> {
        let conn = self.db.get()?;
        let user = conn
            .query_row(
                "SELECT u.id, u.email, u.handle FROM sessions s \
                 JOIN auth_users u ON u.id = s.user_id \
                 WHERE s.token = ?1 AND s.expires_at > datetime('now')",
                params![access_token],
                auth_user,
            )
            .optional()?;
        Ok(user)
    }

    async fn refresh_session(&self, refresh_token: &str) -> BackendResult<Option<AuthSession>> {
        let user = {
            let conn = self.db.get()?;
            let user = conn
                .query_row(
                    "SELECT u.id, u.email, u.handle FROM sessions s \
                     JOIN auth_users u ON u.id = s.user_id \
                     WHERE s.refresh_token = ?1",
                    params![refresh_token],
                    auth_user,
                )
                .optional()?;
            // Single use: the old pair is retired either way
            conn.execute(
                "DELETE FROM sessions WHERE refresh_token = ?1",
                params![refresh_token],
            )?;
            user
        };

        match user {
            Some(user) => {
                tracing::debug!(user_id = %user.id, "Session refreshed");
                Ok(Some(self.create_session(user)?))
            }
            None => Ok(None),
        }
    }

    async fn sign_out(&self, access_token: &str) -> BackendResult<()> {
        let conn = self.db.get()?;
        conn.execute("DELETE FROM sessions WHERE token = ?1", params![access_token])?;
        Ok(())
    }

    async fn find_user(&self, _access_token: &str, user_id: &str) -> BackendResult<Option<User>> {
        let conn = self.db.get()?;
        let user = conn
            .query_row(
                "SELECT id_usuario, usuario, correo, bio, foto_perfil FROM usuarios WHERE id_usuario = ?1",
                params![user_id],
                |r| {
                    Ok(User {
                        id: r.get(0)?,
                        handle: r.get(1)?,
                        email: r.get(2)?,
                        bio: r.get(3)?,
                        avatar_url: r.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(user)
    }

    async fn find_email_by_handle(&self, handle: &str) -> BackendResult<Option<String>> {
        let conn = self.db.get()?;
        let email = conn
            .query_row(
                "SELECT correo FROM usuarios WHERE usuario = ?1",
                params![handle],
                |r| r.get(0),
            )
            .optional()?;
        Ok(email)
    }

    async fn insert_user(&self, _access_token: &str, user: &NewUser) -> BackendResult<()> {
        let conn = self.db.get()?;
        conn.execute(
            "INSERT INTO usuarios (id_usuario, usuario, correo, bio) VALUES (?1, ?2, ?3, ?4) \
             ON CONFLICT(id_usuario) DO NOTHING",
            params![user.id, user.handle, user.email, user.bio],
        )
        .map_err(map_constraint)?;
        Ok(())
    }

    async fn update_user(
        &self,
        _access_token: &str,
        user_id: &str,
        changes: &ProfileChanges,
    ) -> BackendResult<()> {
        let conn = self.db.get()?;
        conn.execute(
            "UPDATE usuarios SET usuario = ?1, bio = ?2, foto_perfil = ?3 WHERE id_usuario = ?4",
            params![changes.handle, changes.bio, changes.avatar_url, user_id],
        )
        .map_err(map_constraint)?;
        Ok(())
    }

    async fn list_feed(&self, _access_token: &str) -> BackendResult<Vec<FeedPost>> {
        let conn = self.db.get()?;

        let mut likes = HashMap::new();
        {
            let mut stmt =
                conn.prepare("SELECT id_publicacion, COUNT(*) FROM likes GROUP BY id_publicacion")?;
            let rows = stmt.query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?)))?;
            for row in rows {
                let (post_id, count) = row?;
                likes.insert(post_id, count as usize);
            }
        }

        let mut stmt = conn.prepare(
            "SELECT p.id_publicacion, p.titulo, p.descripcion, p.imagen_url, p.fecha_publicacion,
                    u.usuario, u.foto_perfil
             FROM publicaciones p
             LEFT JOIN usuarios u ON u.id_usuario = p.id_usuario
             ORDER BY p.fecha_publicacion DESC",
        )?;

        let rows = stmt.query_map([], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, Option<String>>(1)?,
                r.get::<_, Option<String>>(2)?,
                r.get::<_, String>(3)?,
                r.get::<_, String>(4)?,
                r.get::<_, Option<String>>(5)?,
                r.get::<_, Option<String>>(6)?,
            ))
        })?;

        let mut posts = Vec::new();
        for row in rows {
            let (id, title, description, image_url, created_at, handle, avatar_url) = row?;
            let Some(created_at) = parse_timestamp(&created_at) else {
                tracing::warn!(post_id = %id, raw = %created_at, "Skipping post with unreadable date");
                continue;
            };
            let like_count = likes.get(&id).copied().unwrap_or(0);
            posts.push(FeedPost {
                id,
                title,
                description,
                image_url,
                created_at,
                author: handle.map(|handle| Author { handle, avatar_url }),
                like_count,
            });
        }

        Ok(posts)
    }

    async fn list_user_posts(
        &self,
        _access_token: &str,
        user_id: &str,
    ) -> BackendResult<Vec<PostThumb>> {
        let conn = self.db.get()?;
        let mut stmt = conn.prepare(
            "SELECT id_publicacion, imagen_url FROM publicaciones
             WHERE id_usuario = ?1
             ORDER BY fecha_publicacion DESC",
        )?;
        let posts = stmt
            .query_map(params![user_id], |r| {
                Ok(PostThumb {
                    id: r.get(0)?,
                    image_url: r.get(1)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(posts)
    }

    async fn upload(&self, _access_token: &str, blob: BlobUpload) -> BackendResult<()> {
        let relative = format!("{}/{}", blob.bucket, blob.key);
        let path = self.blob_path(&relative).ok_or_else(|| BackendError::Api {
            status: 400,
            message: format!("Invalid object key: {}", blob.key),
        })?;

        if !blob.upsert && tokio::fs::try_exists(&path).await? {
            return Err(BackendError::Conflict(format!("{} already exists", relative)));
        }
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, &blob.data).await?;

        tracing::debug!(key = %relative, bytes = blob.data.len(), content_type = %blob.content_type, "Stored blob");
        Ok(())
    }

    fn public_url(&self, bucket: &str, key: &str) -> String {
        format!("{}/{}/{}", MEDIA_PREFIX, bucket, key)
    }
}

/// Row mapper for `id, email, handle` selections of `auth_users`.
fn auth_user(r: &rusqlite::Row<'_>) -> rusqlite::Result<AuthUser> {
    Ok(AuthUser {
        id: r.get(0)?,
        email: r.get(1)?,
        user_metadata: UserMetadata { handle: r.get(2)? },
    })
}

/// Map unique-constraint failures onto [`BackendError::Conflict`].
fn map_constraint(err: rusqlite::Error) -> BackendError {
    match err {
        rusqlite::Error::SqliteFailure(e, msg)
            if e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                || e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY =>
        {
            BackendError::Conflict(msg.unwrap_or_else(|| "unique constraint".to_string()))
        }
        other => BackendError::Database(other),
    }
}

/// Generate a cryptographically random 32-byte hex token.
fn generate_token() -> String {
    let mut rng = rand::thread_rng();
    let bytes: [u8; 32] = rng.gen();
    hex::encode(bytes)
}

/// Lowest cost bcrypt accepts; keeps hashing in tests fast.
#[cfg(test)]
pub(crate) const TEST_HASH_COST: u32 = 4;

/// In-memory backend with cheap password hashing, for unit tests.
#[cfg(test)]
pub(crate) fn test_backend() -> (tempfile::TempDir, LocalBackend) {
    let tmp = tempfile::tempdir().unwrap();
    let pool = crate::db::memory_pool().unwrap();
    crate::db::run_migrations(&pool).unwrap();
    let backend =
        LocalBackend::new(pool, tmp.path().join("media"), 24).with_hash_cost(TEST_HASH_COST);
    (tmp, backend)
}
