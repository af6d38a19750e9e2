//! Admin settings API.

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use std::sync::Arc;
use tracing::{error, info, warn};

use super::current_session;
use crate::forum::ADMINISTRATORS_GROUP;
use crate::saml::SamlSettingsJson;
use crate::state::AppState;

/// Resolve the calling administrator, or the response to send instead.
fn require_admin(state: &AppState, headers: &HeaderMap) -> Result<u64, Response> {
    let session = current_session(state, headers)
        .ok_or_else(|| (StatusCode::UNAUTHORIZED, "Not logged in").into_response())?;

    match state.groups.is_member(ADMINISTRATORS_GROUP, session.uid) {
        Ok(true) => Ok(session.uid),
        Ok(false) => {
            warn!(uid = session.uid, "Non-admin tried to access SAML settings");
            Err((StatusCode::FORBIDDEN, "Forbidden").into_response())
        }
        Err(e) => {
            error!(error = %e, "Group lookup failed");
            Err(StatusCode::INTERNAL_SERVER_ERROR.into_response())
        }
    }
}

pub async fn get_settings(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    if let Err(response) = require_admin(&state, &headers) {
        return response;
    }

    match state.settings() {
        Ok(settings) => Json(settings.redacted()).into_response(),
        Err(e) => {
            error!(error = %e, "Failed to read SAML settings");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

pub async fn put_settings(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Result<Json<SamlSettingsJson>, JsonRejection>,
) -> Response {
    let uid = match require_admin(&state, &headers) {
        Ok(uid) => uid,
        Err(response) => return response,
    };

    let Json(update) = match body {
        Ok(body) => body,
        Err(e) => return (StatusCode::BAD_REQUEST, e.body_text()).into_response(),
    };

    let mut settings = match state.settings() {
        Ok(settings) => settings,
        Err(e) => {
            error!(error = %e, "Failed to read SAML settings");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };
    update.apply_to(&mut settings);

    if let Err(e) = state.update_settings(settings.clone()) {
        warn!(uid = uid, error = %e, "Rejected SAML settings update");
        return (StatusCode::BAD_REQUEST, e.to_string()).into_response();
    }

    info!(uid = uid, "SAML settings saved");
    Json(settings.redacted()).into_response()
}
