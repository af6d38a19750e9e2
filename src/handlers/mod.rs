//! HTTP routes.

pub mod admin;
pub mod auth;

use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;
use tracing::warn;

use crate::session::{Session, SessionId};
use crate::state::AppState;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/auth/saml", get(auth::login))
        .route("/sso/assert", post(auth::assert))
        .route("/auth/saml/callback", post(auth::assert))
        .route("/auth/saml/logout", get(auth::logout))
        .route("/auth/saml/metadata", get(auth::metadata))
        .route("/api/sso-saml/strategy", get(auth::strategy))
        .route(
            "/api/admin/plugins/sso-saml",
            get(admin::get_settings).put(admin::put_settings),
        )
        .route("/health", get(|| async { "OK" }))
        .with_state(state)
}

/// A 302 redirect.
pub(crate) fn found(location: &str) -> Response {
    (StatusCode::FOUND, [(header::LOCATION, location.to_string())]).into_response()
}

/// Only same-origin absolute paths are followed after login. Control
/// characters are refused since the target ends up in a `Location` header.
pub(crate) fn is_safe_redirect(target: &str) -> bool {
    target.starts_with('/')
        && !target.starts_with("//")
        && !target.starts_with("/\\")
        && !target.chars().any(char::is_control)
}

/// The session named by the request's cookie, if it is still live.
pub(crate) fn current_session(state: &AppState, headers: &HeaderMap) -> Option<Session> {
    let id = session_id_from_headers(state, headers)?;
    match state.sessions.get(id) {
        Ok(session) => session,
        Err(e) => {
            warn!(error = %e, "Session lookup failed");
            None
        }
    }
}

pub(crate) fn session_id_from_headers(state: &AppState, headers: &HeaderMap) -> Option<SessionId> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .find_map(|cookie| state.session_config.parse_session_cookie(cookie))
        .and_then(|value| SessionId::from_hex(&value))
}
