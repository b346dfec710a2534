use axum::http::{header, HeaderMap};

use crate::backend::{Backend, BackendResult};
use crate::config::AuthConfig;
use crate::db::models::{AuthSession, AuthUser};

/// The signed-in caller, resolved once per request and handed explicitly to
/// every data-fetching call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionContext {
    pub user_id: String,
    pub email: String,
    pub access_token: String,
    /// Handle picked at sign-up, used when the profile row is bootstrapped
    pub preferred_handle: Option<String>,
}

impl SessionContext {
    pub fn new(user: AuthUser, access_token: impl Into<String>) -> Self {
        let preferred_handle = user.handle().map(str::to_string);
        SessionContext {
            user_id: user.id,
            email: user.email,
            access_token: access_token.into(),
            preferred_handle,
        }
    }
}

/// Outcome of reading the session cookies. `refreshed` holds a new token
/// pair that must be written back to the browser.
#[derive(Debug, Clone, Default)]
pub struct Resolution {
    pub context: Option<SessionContext>,
    pub refreshed: Option<AuthSession>,
}

/// Ask the backend who owns `token`. `Ok(None)` means "not signed in".
pub async fn resolve(
    backend: &dyn Backend,
    token: Option<&str>,
) -> BackendResult<Option<SessionContext>> {
    let Some(token) = token.filter(|t| !t.is_empty()) else {
        return Ok(None);
    };

    let user = backend.get_user(token).await?;
    Ok(user.map(|user| SessionContext::new(user, token)))
}

/// Like [`resolve`], but trades the refresh token for a new pair once the
/// access token is no longer accepted.
pub async fn resolve_or_refresh(
    backend: &dyn Backend,
    access_token: Option<&str>,
    refresh_token: Option<&str>,
) -> BackendResult<Resolution> {
    if let Some(context) = resolve(backend, access_token).await? {
        return Ok(Resolution {
            context: Some(context),
            refreshed: None,
        });
    }

    let Some(refresh_token) = refresh_token.filter(|t| !t.is_empty()) else {
        return Ok(Resolution::default());
    };
    match backend.refresh_session(refresh_token).await? {
        Some(session) => {
            tracing::debug!(user_id = %session.user.id, "Access token renewed");
            Ok(Resolution {
                context: Some(SessionContext::new(
                    session.user.clone(),
                    session.access_token.clone(),
                )),
                refreshed: Some(session),
            })
        }
        None => Ok(Resolution::default()),
    }
}

pub fn refresh_cookie_name(cookie_name: &str) -> String {
    format!("{}_refresh", cookie_name)
}

/// `Set-Cookie` values for a new session: the access token, and the
/// refresh token when the backend issued one.
pub fn login_cookies(cfg: &AuthConfig, session: &AuthSession) -> Vec<String> {
    let mut cookies = vec![session_cookie(
        &cfg.cookie_name,
        &session.access_token,
        cfg.session_hours,
        cfg.secure_cookie,
    )];
    if let Some(refresh) = session.refresh_token.as_deref() {
        cookies.push(session_cookie(
            &refresh_cookie_name(&cfg.cookie_name),
            refresh,
            cfg.session_hours,
            cfg.secure_cookie,
        ));
    }
    cookies
}

pub fn logout_cookies(cookie_name: &str) -> Vec<String> {
    vec![
        clear_session_cookie(cookie_name),
        clear_session_cookie(&refresh_cookie_name(cookie_name)),
    ]
}

pub fn session_cookie(name: &str, token: &str, max_age_hours: u64, secure: bool) -> String {
    let max_age_secs = max_age_hours * 3600;
    let secure = if secure { "; Secure" } else { "" };
    format!(
        "{}={}; HttpOnly; SameSite=Lax; Path=/; Max-Age={}{}",
        name, token, max_age_secs, secure
    )
}

pub fn clear_session_cookie(name: &str) -> String {
    format!("{}=; HttpOnly; SameSite=Lax; Path=/; Max-Age=0", name)
}

pub fn cookie_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|s| s.split(';'))
        .map(|s| s.trim())
        .find_map(|cookie| {
            let mut split = cookie.splitn(2, '=');
            let key = split.next()?.trim();
            let val = split.next()?.trim();
            if key == name {
                Some(val)
            } else {
                None
            }
        })
}
