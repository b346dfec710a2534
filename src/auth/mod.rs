//! Login and registration flows.
//!
//! Failures that concern credentials never say which part was wrong: an
//! unknown handle, an unknown email and a wrong password all read as
//! [`LoginError::InvalidCredentials`], and a rejected sign-up reads as
//! [`RegisterError::SignUpFailed`]. Handles are public, so a taken handle
//! is reported as such.

pub mod session;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::backend::{Backend, BackendError, SignUp};
use crate::db::models::{AuthSession, NewUser};

pub use session::SessionContext;

pub const MIN_PASSWORD_CHARS: usize = 6;
pub const HANDLE_CHARS: std::ops::RangeInclusive<usize> = 5..=20;

/// How a login identifier is resolved to an email.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginTarget<'a> {
    Email(&'a str),
    Handle(&'a str),
}

impl<'a> LoginTarget<'a> {
    pub fn parse(identifier: &'a str) -> Self {
        if identifier.contains('@') {
            LoginTarget::Email(identifier)
        } else {
            LoginTarget::Handle(identifier)
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LoginError {
    #[error("All fields are required.")]
    MissingFields,
    #[error("Incorrect user or password.")]
    InvalidCredentials,
    #[error("Something went wrong. Please try again.")]
    Unavailable,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegisterError {
    #[error("All fields are required.")]
    MissingFields,
    #[error("The handle must be 5 to 20 letters or numbers, without spaces.")]
    InvalidHandle,
    #[error("Invalid email address.")]
    InvalidEmail,
    #[error("The password must be at least 6 characters.")]
    WeakPassword,
    #[error("That handle is already in use.")]
    HandleTaken,
    #[error("Could not create the account.")]
    SignUpFailed,
    #[error("Something went wrong. Please try again.")]
    Unavailable,
}

#[derive(Debug, Clone, Default)]
pub struct Registration {
    pub handle: String,
    pub email: String,
    pub password: String,
}

/// ASCII letters and digits only, 5 to 20 of them.
pub fn is_valid_handle(handle: &str) -> bool {
    HANDLE_CHARS.contains(&handle.len()) && handle.chars().all(|c| c.is_ascii_alphanumeric())
}

pub fn is_valid_email(email: &str) -> bool {
    email.contains('@')
}

pub fn is_valid_password(password: &str) -> bool {
    password.chars().count() >= MIN_PASSWORD_CHARS
}

/// Sign in with an email or a handle.
pub async fn login(
    backend: &dyn Backend,
    identifier: &str,
    password: &str,
) -> Result<AuthSession, LoginError> {
    let identifier = identifier.trim();
    if identifier.is_empty() || password.is_empty() {
        return Err(LoginError::MissingFields);
    }

    let email = match LoginTarget::parse(identifier) {
        LoginTarget::Email(email) => email.to_string(),
        LoginTarget::Handle(handle) => match backend.find_email_by_handle(handle).await {
            Ok(Some(email)) => email,
            Ok(None) => {
                debug!(handle, "Login handle not found");
                return Err(LoginError::InvalidCredentials);
            }
            Err(e) => {
                warn!(error = %e, "Handle lookup failed");
                return Err(LoginError::Unavailable);
            }
        },
    };

    match backend.sign_in_with_password(&email, password).await {
        Ok(session) => {
            info!(user_id = %session.user.id, "Signed in");
            Ok(session)
        }
        Err(BackendError::InvalidCredentials) => Err(LoginError::InvalidCredentials),
        Err(e) => {
            warn!(error = %e, "Sign-in failed");
            Err(LoginError::Unavailable)
        }
    }
}

pub fn validate_registration(form: &Registration) -> Result<(), RegisterError> {
    let handle = form.handle.trim();
    let email = form.email.trim();
    if handle.is_empty() || email.is_empty() || form.password.is_empty() {
        return Err(RegisterError::MissingFields);
    }
    if !is_valid_handle(handle) {
        return Err(RegisterError::InvalidHandle);
    }
    if !is_valid_email(email) {
        return Err(RegisterError::InvalidEmail);
    }
    if !is_valid_password(&form.password) {
        return Err(RegisterError::WeakPassword);
    }
    Ok(())
}

/// Create an account and its `usuarios` row.
///
/// The application owns row creation: the row is inserted here with the
/// chosen handle, idempotently by identity id. The handle also travels with
/// the identity, so when the backend defers the session (email
/// confirmation) the first profile visit creates the row with it.
pub async fn register(backend: &dyn Backend, form: &Registration) -> Result<SignUp, RegisterError> {
    validate_registration(form)?;
    let handle = form.handle.trim();
    let email = form.email.trim();

    match backend.find_email_by_handle(handle).await {
        Ok(Some(_)) => return Err(RegisterError::HandleTaken),
        Ok(None) => {}
        Err(e) => {
            warn!(error = %e, "Handle availability check failed");
            return Err(RegisterError::Unavailable);
        }
    }

    let signup = backend
        .sign_up(email, &form.password, Some(handle))
        .await
        .map_err(|e| {
            warn!(error = %e, "Sign-up rejected");
            match e {
                BackendError::Http(_) => RegisterError::Unavailable,
                _ => RegisterError::SignUpFailed,
            }
        })?;

    match &signup.session {
        Some(session) => {
            let row = NewUser {
                id: signup.user.id.clone(),
                handle: handle.to_string(),
                email: email.to_string(),
                bio: String::new(),
            };
            let inserted = backend.insert_user(&session.access_token, &row).await;
            // Registration ends on the login page, so this session is not kept
            if let Err(e) = backend.sign_out(&session.access_token).await {
                debug!(error = %e, "Could not revoke sign-up session");
            }
            match inserted {
                Ok(()) => {}
                // Taken between the availability check and the insert
                Err(e) if e.is_conflict() => {
                    warn!(user_id = %row.id, handle, "Handle taken during sign-up");
                    return Err(RegisterError::HandleTaken);
                }
                Err(e) => {
                    warn!(user_id = %row.id, error = %e, "Could not create user row at sign-up");
                }
            }
        }
        None => {
            info!(user_id = %signup.user.id, handle, "Sign-up pending confirmation; row created on first profile visit");
        }
    }

    info!(user_id = %signup.user.id, "Account registered");
    Ok(signup)
}
