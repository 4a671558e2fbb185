//! Access codes, roles and cookie sessions.
//!
//! There are no user accounts: a shared numeric code grants a role, and the
//! role decides which pages are reachable. Sessions are kept in memory and
//! identified by a random cookie value.

#[cfg(feature = "web")]
use std::sync::Arc;
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, SystemTime};

#[cfg(feature = "web")]
use axum::{
    Form,
    extract::{Request, State},
    middleware::Next,
    response::{Html, IntoResponse, Redirect, Response},
};
#[cfg(feature = "web")]
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use lazy_static::lazy_static;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[cfg(feature = "web")]
use crate::app::AppState;
#[cfg(feature = "web")]
use crate::error::{AppError, AppResult};

pub const SESSION_COOKIE: &str = "session";
pub const BAD_CODE_MESSAGE: &str = "Code d'accès incorrect.";

/// Operator role, ordered by what it may access.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum Role {
    /// Daily entry and visualisation.
    Operator,
    /// Adds the monthly photo log.
    Reader,
    /// Adds reports, workbook management and exports.
    Manager,
}

impl Role {
    pub fn label(self) -> &'static str {
        match self {
            Role::Operator => "Opérateur",
            Role::Reader => "Releveur",
            Role::Manager => "Responsable",
        }
    }

    /// Role granted by `code`. The configured codes are listed from the
    /// lowest role up; any code past the third grants the highest role.
    pub fn for_code(code: &str, codes: &[u8]) -> Option<Role> {
        let code: u8 = code.trim().parse().ok()?;
        match codes.iter().position(|c| *c == code)? {
            0 => Some(Role::Operator),
            1 => Some(Role::Reader),
            _ => Some(Role::Manager),
        }
    }
}

/// An authenticated session
#[derive(Debug, Clone)]
pub struct Session {
    pub role: Role,
    pub expires_at: SystemTime,
}

lazy_static! {
    static ref SESSIONS: RwLock<HashMap<String, Session>> = RwLock::new(HashMap::new());
}

/// Opens a session for `role` and returns its id. Expired sessions are
/// dropped on the way.
pub fn create_session(role: Role, ttl: Duration) -> String {
    let session_id = Uuid::new_v4().to_string();
    let now = SystemTime::now();
    let session = Session {
        role,
        expires_at: now + ttl,
    };

    match SESSIONS.write() {
        Ok(mut sessions) => {
            sessions.retain(|_, s| s.expires_at > now);
            sessions.insert(session_id.clone(), session);
        }
        Err(_) => warn!("Session store poisoned; session not kept"),
    }
    session_id
}

/// Role of a live session.
pub fn validate_session(session_id: &str) -> Option<Role> {
    let sessions = SESSIONS.read().ok()?;
    sessions
        .get(session_id)
        .filter(|s| s.expires_at > SystemTime::now())
        .map(|s| s.role)
}

pub fn end_session(session_id: &str) {
    if let Ok(mut sessions) = SESSIONS.write() {
        sessions.remove(session_id);
    }
}

#[derive(Debug, Deserialize)]
pub struct LoginForm {
    #[serde(default)]
    pub code: String,
}

#[cfg(feature = "web")]
pub async fn serve_login_page(State(state): State<Arc<AppState>>) -> AppResult<Html<String>> {
    state.templates.login(None)
}

/// Checks the access code and opens a session.
#[cfg(feature = "web")]
pub async fn handle_login(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    Form(form): Form<LoginForm>,
) -> AppResult<Response> {
    let Some(role) = Role::for_code(&form.code, &state.config.access_codes) else {
        warn!("Rejected access code");
        return Ok(state.templates.login(Some(BAD_CODE_MESSAGE))?.into_response());
    };

    let session_id = create_session(role, state.config.session_ttl);
    info!("New {} session", role.label());
    let cookie = Cookie::build((SESSION_COOKIE, session_id))
        .path("/")
        .http_only(true)
        .same_site(SameSite::Lax);
    Ok((jar.add(cookie), Redirect::to("/")).into_response())
}

#[cfg(feature = "web")]
pub async fn handle_logout(jar: CookieJar) -> (CookieJar, Redirect) {
    if let Some(cookie) = jar.get(SESSION_COOKIE) {
        end_session(cookie.value());
    }
    (
        jar.remove(Cookie::build(SESSION_COOKIE).path("/")),
        Redirect::to("/login"),
    )
}

/// Role of the request's session, if any.
#[cfg(feature = "web")]
pub fn session_role(jar: &CookieJar) -> Option<Role> {
    jar.get(SESSION_COOKIE).and_then(|c| validate_session(c.value()))
}

/// Middleware letting through sessions with at least `minimum`. The role is
/// stored in the request extensions for handlers.
#[cfg(feature = "web")]
pub async fn require_role(
    State(minimum): State<Role>,
    jar: CookieJar,
    mut request: Request,
    next: Next,
) -> Response {
    match session_role(&jar) {
        Some(role) if role >= minimum => {
            request.extensions_mut().insert(role);
            next.run(request).await
        }
        _ => AppError::Unauthorized.into_response(),
    }
}
