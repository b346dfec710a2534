use axum::extract::{FromRequestParts, Request, State};
use axum::http::request::Parts;
use axum::http::{header, HeaderValue};
use axum::middleware::Next;
use axum::response::{IntoResponse, Redirect, Response};

use crate::auth::session::{self, SessionContext};
use crate::error::AppError;
use crate::state::AppState;

/// Session resolved by [`session_layer`] for the rest of the request.
#[derive(Debug, Clone)]
struct ResolvedSession(Option<SessionContext>);

/// Resolve the session cookies once per request, renewing an expired
/// access token from the refresh cookie. New tokens go back to the
/// browser on the response.
pub async fn session_layer(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let cfg = &state.config.auth;
    let refresh_name = session::refresh_cookie_name(&cfg.cookie_name);
    let resolution = {
        let headers = request.headers();
        let access = session::cookie_value(headers, &cfg.cookie_name);
        let refresh = session::cookie_value(headers, &refresh_name);
        session::resolve_or_refresh(state.backend.as_ref(), access, refresh).await
    };

    let resolution = match resolution {
        Ok(resolution) => resolution,
        Err(e) => {
            // Transient failures are not retried
            tracing::error!(error = %e, "Session lookup failed");
            return AppError::Unavailable.into_response();
        }
    };

    request
        .extensions_mut()
        .insert(ResolvedSession(resolution.context));
    let mut response = next.run(request).await;

    if let Some(renewed) = resolution.refreshed {
        for cookie in session::login_cookies(cfg, &renewed) {
            match HeaderValue::from_str(&cookie) {
                Ok(value) => {
                    response.headers_mut().append(header::SET_COOKIE, value);
                }
                Err(e) => tracing::warn!(error = %e, "Renewed session cookie not representable"),
            }
        }
    }
    response
}

/// The signed-in caller.
/// Redirects to `/login` when there is no valid session.
#[derive(Debug, Clone)]
pub struct CurrentSession(pub SessionContext);

impl FromRequestParts<AppState> for CurrentSession {
    type Rejection = Response;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        match MaybeSession::from_request_parts(parts, state).await {
            Ok(MaybeSession(Some(ctx))) => Ok(CurrentSession(ctx)),
            Ok(MaybeSession(None)) => Err(Redirect::to("/login").into_response()),
            Err(e) => Err(e.into_response()),
        }
    }
}

/// Optional session extractor: `None` instead of a redirect.
pub struct MaybeSession(pub Option<SessionContext>);

impl FromRequestParts<AppState> for MaybeSession {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        if let Some(ResolvedSession(ctx)) = parts.extensions.get::<ResolvedSession>() {
            return Ok(MaybeSession(ctx.clone()));
        }

        // Routes outside the session layer read the access cookie directly
        let token = session::cookie_value(&parts.headers, &state.config.auth.cookie_name);
        match session::resolve(state.backend.as_ref(), token).await {
            Ok(ctx) => Ok(MaybeSession(ctx)),
            Err(e) => {
                tracing::error!(error = %e, "Session lookup failed");
                Err(AppError::Unavailable)
            }
        }
    }
}
