use askama::Template;
use axum::extract::State;
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Form, Router};
use serde::Deserialize;

use crate::auth::{self, session, Registration};
use crate::routes::home::Html;
use crate::state::AppState;

// -- Templates --

#[derive(Template)]
#[template(path = "pages/login.html")]
pub struct LoginTemplate {
    pub identifier: String,
    pub error: Option<String>,
    pub notice: Option<String>,
}

#[derive(Template)]
#[template(path = "pages/register.html")]
pub struct RegisterTemplate {
    pub handle: String,
    pub email: String,
    pub error: Option<String>,
    pub notice: Option<String>,
}

// -- Forms --

#[derive(Deserialize)]
pub struct LoginForm {
    #[serde(default)]
    pub identifier: String,
    #[serde(default)]
    pub password: String,
}

#[derive(Deserialize)]
pub struct RegisterForm {
    #[serde(default)]
    pub handle: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub password: String,
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/login", get(login_page).post(login))
        .route("/register", get(register_page).post(register))
        .route("/logout", post(logout))
}

fn see_other(location: &str, cookies: Vec<String>) -> Response {
    let mut response = (StatusCode::SEE_OTHER, [(header::LOCATION, location)]).into_response();
    for cookie in cookies {
        match HeaderValue::from_str(&cookie) {
            Ok(value) => {
                response.headers_mut().append(header::SET_COOKIE, value);
            }
            Err(e) => tracing::warn!(error = %e, "Cookie not representable as a header"),
        }
    }
    response
}

/// GET /login
async fn login_page() -> Html<LoginTemplate> {
    Html(LoginTemplate {
        identifier: String::new(),
        error: None,
        notice: None,
    })
}

/// POST /login: sign in by email or handle and set the session cookie
async fn login(State(state): State<AppState>, Form(form): Form<LoginForm>) -> Response {
    match auth::login(state.backend.as_ref(), &form.identifier, &form.password).await {
        Ok(signed_in) => see_other("/feed", session::login_cookies(&state.config.auth, &signed_in)),
        Err(e) => Html(LoginTemplate {
            identifier: form.identifier.trim().to_string(),
            error: Some(e.to_string()),
            notice: None,
        })
        .into_response(),
    }
}

/// GET /register
async fn register_page() -> Html<RegisterTemplate> {
    Html(RegisterTemplate {
        handle: String::new(),
        email: String::new(),
        error: None,
        notice: None,
    })
}

/// POST /register: create the account, then send the visitor to /login
async fn register(
    State(state): State<AppState>,
    Form(form): Form<RegisterForm>,
) -> Html<RegisterTemplate> {
    let registration = Registration {
        handle: form.handle,
        email: form.email,
        password: form.password,
    };

    let outcome = auth::register(state.backend.as_ref(), &registration).await;
    let (error, notice) = match outcome {
        Ok(_) => (None, Some("Account created. Redirecting…".to_string())),
        Err(e) => (Some(e.to_string()), None),
    };

    Html(RegisterTemplate {
        handle: registration.handle.trim().to_string(),
        email: registration.email.trim().to_string(),
        error,
        notice,
    })
}

/// POST /logout: revoke the session and clear both cookies
async fn logout(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let cookie_name = &state.config.auth.cookie_name;

    if let Some(token) = session::cookie_value(&headers, cookie_name) {
        if let Err(e) = state.backend.sign_out(token).await {
            tracing::debug!(error = %e, "Sign-out failed; clearing cookie anyway");
        }
    }

    see_other("/login", session::logout_cookies(cookie_name))
}
