//! Login, assertion consumer, logout and metadata endpoints.

use anyhow::{anyhow, bail, Result};
use axum::extract::rejection::FormRejection;
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{Form, Json};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::{current_session, found, is_safe_redirect, session_id_from_headers};
use crate::accounts::SamlUser;
use crate::saml::SamlSettings;
use crate::session::{SamlLogin, Session};
use crate::state::AppState;

const LOGIN_FAILURE_REDIRECT: &str = "/login";

#[derive(Debug, Deserialize)]
pub struct LoginQuery {
    #[serde(rename = "returnTo")]
    pub return_to: Option<String>,
}

/// Redirect the browser to the IdP.
pub async fn login(State(state): State<Arc<AppState>>, Query(query): Query<LoginQuery>) -> Response {
    let relay_state = query.return_to.as_deref().filter(|r| is_safe_redirect(r));

    match state.provider().and_then(|p| p.login_url(relay_state)) {
        Ok(url) => {
            info!(relay_state = ?relay_state, "Redirecting to SAML IdP");
            found(&url)
        }
        Err(e) => {
            error!(error = %e, "Failed to create SAML login URL");
            (StatusCode::INTERNAL_SERVER_ERROR, "Login Error").into_response()
        }
    }
}

/// Assertion consumer service.
pub async fn assert(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    form: Result<Form<HashMap<String, String>>, FormRejection>,
) -> Response {
    let form = match form {
        Ok(Form(form)) => form,
        Err(e) => {
            error!(error = %e, "Unreadable SAML assertion POST");
            return found(LOGIN_FAILURE_REDIRECT);
        }
    };

    match complete_login(&state, &headers, &form) {
        Ok((cookie, location)) => (
            StatusCode::FOUND,
            [(header::LOCATION, location), (header::SET_COOKIE, cookie)],
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "SAML login failed");
            found(LOGIN_FAILURE_REDIRECT)
        }
    }
}

/// Validate the assertion, link the account and open a session.
/// Returns the session cookie and the post-login location.
fn complete_login(
    state: &AppState,
    headers: &HeaderMap,
    form: &HashMap<String, String>,
) -> Result<(String, String)> {
    let provider = state.provider()?;
    let assertion = provider.assert_login(form)?;

    if state.sessions.is_assertion_used(&assertion.assertion_id)? {
        bail!("SAML assertion replay detected: {}", assertion.assertion_id);
    }

    let settings = state.settings()?;
    // Decided before any state changes so the redirect cannot fail afterwards.
    let location = post_login_location(form, &settings);

    let user = SamlUser::from_assertion(&assertion, &settings.attribute_names);
    debug!(attributes = ?user.attributes, "SAML attributes");
    let uid = state.accounts.get_or_create_user(&user, &settings.role_map)?;

    if let Some(previous) = session_id_from_headers(state, headers) {
        state.sessions.delete(previous)?;
    }

    let login = SamlLogin {
        saml_id: user.saml_id.clone().unwrap_or_default(),
        name_id: assertion.name_id,
        name_id_format: assertion.name_id_format,
        session_index: assertion.session_index,
        assertion_id: assertion.assertion_id,
        idp_entity_id: assertion.idp_entity_id,
    };
    let session_id = state
        .sessions
        .create(Session::new(uid, login, state.sessions.ttl_secs()))?;

    info!(uid = uid, session_id = %session_id, "SAML login completed");

    Ok((
        state.session_config.build_cookie(&session_id.to_hex()),
        location,
    ))
}

/// Safe `RelayState`, else the configured success URL, else `/`.
fn post_login_location(form: &HashMap<String, String>, settings: &SamlSettings) -> String {
    let configured = settings.login_success_redirect_url.trim();
    form.get("RelayState")
        .map(|s| s.trim())
        .filter(|s| is_safe_redirect(s))
        .or_else(|| (!configured.is_empty()).then_some(configured))
        .filter(|s| HeaderValue::from_str(s).is_ok())
        .unwrap_or("/")
        .to_string()
}

/// End the local session and continue to the IdP logout endpoint.
pub async fn logout(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    let Some(session) = current_session(&state, &headers) else {
        return found("/");
    };

    let logout_url = match idp_logout_url(&state, &session) {
        Ok(url) => Some(url),
        Err(e) => {
            warn!(uid = session.uid, error = %e, "Could not build SAML logout URL");
            None
        }
    };

    if let Err(e) = state.sessions.delete(session.id) {
        error!(uid = session.uid, error = %e, "Failed to destroy session");
    }
    info!(uid = session.uid, "Logged out");

    let location = logout_url.unwrap_or_else(|| "/".to_string());
    (
        StatusCode::FOUND,
        [
            (header::LOCATION, location),
            (header::SET_COOKIE, state.session_config.clear_cookie()),
        ],
    )
        .into_response()
}

fn idp_logout_url(state: &AppState, session: &Session) -> Result<String> {
    let provider = state.provider()?;
    let mut subject = state
        .accounts
        .get_user_info(session.uid)?
        .ok_or_else(|| anyhow!("No SAML identity stored for uid {}", session.uid))?;

    // The NameID format only applies when the stored id is the NameID itself.
    if subject.name_id == session.login.name_id {
        subject.name_id_format = session.login.name_id_format.clone();
    }
    subject.session_index = session.login.session_index.clone();

    provider.logout_url(&subject)
}

/// SP metadata for registering the forum with an IdP.
pub async fn metadata(State(state): State<Arc<AppState>>) -> Response {
    match state.provider().and_then(|p| p.metadata()) {
        Ok(xml) => ([(header::CONTENT_TYPE, "application/samlmetadata+xml")], xml).into_response(),
        Err(e) => {
            error!(error = %e, "Failed to generate SP metadata");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Login strategy and button descriptors for the forum UI.
pub async fn strategy(State(state): State<Arc<AppState>>) -> Response {
    let button_text = match state.settings() {
        Ok(settings) => settings.login_button_text,
        Err(e) => {
            error!(error = %e, "Failed to read SAML settings");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    Json(serde_json::json!({
        "strategy": {
            "name": "saml 2",
            "url": "/auth/saml",
            "callbackURL": "/auth/saml/callback",
            "icon": "fa-sign-in-alt",
            "scope": "",
        },
        "loginButton": {
            "url": "/auth/saml",
            "text": button_text,
            "icon": "fa-sign-in-alt",
        },
        "adminNavigation": {
            "route": "/plugins/sso-saml",
            "icon": "fa-tint",
            "name": "SAML 2",
        },
    }))
    .into_response()
}
