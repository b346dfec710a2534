use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// Identity as reported by the backend's auth service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthUser {
    pub id: String,
    #[serde(default)]
    pub email: String,
    #[serde(default, deserialize_with = "nullable_metadata")]
    pub user_metadata: UserMetadata,
}

impl AuthUser {
    /// Handle chosen at sign-up, if the identity carries one.
    pub fn handle(&self) -> Option<&str> {
        self.user_metadata
            .handle
            .as_deref()
            .filter(|h| !h.trim().is_empty())
    }
}

/// Data attached to an identity at sign-up.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handle: Option<String>,
}

fn nullable_metadata<'de, D>(deserializer: D) -> Result<UserMetadata, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<UserMetadata>::deserialize(deserializer)?.unwrap_or_default())
}

/// A signed-in session. `access_token` is what the session cookie carries;
/// `refresh_token` renews it once the backend stops accepting it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthSession {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// Lifetime of `access_token` in seconds, when the backend reports one
    #[serde(default)]
    pub expires_in: Option<u64>,
    pub user: AuthUser,
}

/// Row of the `usuarios` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    #[serde(rename = "id_usuario")]
    pub id: String,
    #[serde(rename = "usuario")]
    pub handle: String,
    #[serde(rename = "correo", default)]
    pub email: String,
    #[serde(default)]
    pub bio: Option<String>,
    #[serde(rename = "foto_perfil", default)]
    pub avatar_url: Option<String>,
}

/// Insert payload for a `usuarios` row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NewUser {
    #[serde(rename = "id_usuario")]
    pub id: String,
    #[serde(rename = "usuario")]
    pub handle: String,
    #[serde(rename = "correo")]
    pub email: String,
    pub bio: String,
}

/// Update payload for the profile editor. A `None` avatar clears the column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProfileChanges {
    #[serde(rename = "usuario")]
    pub handle: String,
    pub bio: String,
    #[serde(rename = "foto_perfil")]
    pub avatar_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Author {
    pub handle: String,
    pub avatar_url: Option<String>,
}

/// A post joined with its author and like count, as the feed shows it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedPost {
    pub id: String,
    pub title: Option<String>,
    pub description: Option<String>,
    pub image_url: String,
    pub created_at: DateTime<Utc>,
    pub author: Option<Author>,
    pub like_count: usize,
}

/// A post as shown in a profile's gallery.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PostThumb {
    #[serde(rename = "id_publicacion")]
    pub id: String,
    #[serde(rename = "imagen_url")]
    pub image_url: String,
}

/// Read a stored timestamp. Zoned values are RFC 3339; values without a
/// zone (SQLite `datetime()`, Postgres `timestamp`) are taken as UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|dt| dt.and_utc())
}

/// `deserialize_with` adapter for [`parse_timestamp`].
pub fn deserialize_timestamp<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_timestamp(&raw)
        .ok_or_else(|| serde::de::Error::custom(format!("unreadable timestamp {:?}", raw)))
}
