//! Forum SAML SSO service
//!
//! Adds SAML 2.0 single sign-on to the forum: redirects users to the
//! identity provider, consumes the POSTed assertion, links or provisions the
//! local account, and manages the resulting session and logout.

mod accounts;
mod forum;
mod handlers;
mod saml;
mod session;
mod state;

use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};

use accounts::AccountLinker;
use forum::{ForumGroups, ForumUsers, ObjectStore, SettingsStore};
use saml::{SamlSettings, SamlSettingsJson, SETTINGS_PLUGIN_ID};
use session::{spawn_cleanup_task, SessionConfig, SessionStore, DEFAULT_CLEANUP_INTERVAL_SECS};
use state::{saml_provider_factory, AppState};

/// Command line arguments
#[derive(Parser, Debug)]
#[command(name = "forum-sso-saml")]
#[command(about = "SAML 2.0 single sign-on for the forum")]
struct Args {
    /// Address to listen on
    #[arg(long, default_value = "127.0.0.1:4567", env = "SSO_LISTEN")]
    listen: SocketAddr,

    /// Directory holding the forum and session databases
    #[arg(long, default_value = "/var/lib/forum-sso-saml", env = "SSO_DATA_DIR")]
    data_dir: PathBuf,

    /// JSON file of plugin settings merged into the stored settings at startup
    #[arg(long, env = "SSO_SETTINGS_FILE")]
    settings_file: Option<PathBuf>,

    /// Session cookie name
    #[arg(long, default_value = "forum_sso_session", env = "SSO_COOKIE_NAME")]
    cookie_name: String,

    /// Session cookie domain
    #[arg(long, env = "SSO_COOKIE_DOMAIN")]
    cookie_domain: Option<String>,

    /// Issue cookies without the Secure flag (plain HTTP development setups)
    #[arg(long, env = "SSO_INSECURE_COOKIES")]
    insecure_cookies: bool,

    /// Session lifetime in seconds
    #[arg(long, default_value_t = 14 * 24 * 60 * 60, env = "SSO_SESSION_TTL")]
    session_ttl_secs: u64,

    /// Interval between expired-session sweeps in seconds
    #[arg(long, default_value_t = DEFAULT_CLEANUP_INTERVAL_SECS, env = "SSO_CLEANUP_INTERVAL")]
    cleanup_interval_secs: u64,

    /// Enable verbose logging
    #[arg(short, long, env = "SSO_VERBOSE")]
    verbose: bool,
}

impl Args {
    fn session_config(&self) -> SessionConfig {
        SessionConfig {
            cookie_name: self.cookie_name.clone(),
            cookie_domain: self.cookie_domain.clone(),
            cookie_secure: !self.insecure_cookies,
            ttl_secs: self.session_ttl_secs,
            ..SessionConfig::default()
        }
    }
}

/// Merge a JSON settings file into the stored plugin settings.
fn seed_settings(store: &SettingsStore, path: &Path) -> Result<()> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read settings file: {:?}", path))?;
    let seed: SamlSettingsJson = serde_json::from_str(&raw)
        .with_context(|| format!("Failed to parse settings file: {:?}", path))?;

    let mut settings: SamlSettings = store.get(SETTINGS_PLUGIN_ID)?;
    seed.apply_to(&mut settings);
    store.set(SETTINGS_PLUGIN_ID, &settings)?;

    info!(path = ?path, "Seeded SAML settings");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(format!("{}={}", env!("CARGO_CRATE_NAME"), log_level))
        .json()
        .init();

    info!("Starting forum SAML SSO service");

    std::fs::create_dir_all(&args.data_dir)
        .with_context(|| format!("Failed to create data directory: {:?}", args.data_dir))?;

    let objects = Arc::new(ObjectStore::open(args.data_dir.join("forum.redb"))?);
    let groups = Arc::new(ForumGroups::new(Arc::clone(&objects)));
    groups.ensure_system_groups()?;
    if groups.members(forum::ADMINISTRATORS_GROUP)?.is_empty() {
        warn!("No forum administrators yet, map an IdP role to administrators to manage SAML settings");
    }
    let users = Arc::new(ForumUsers::new(Arc::clone(&objects), groups.clone()));

    let settings_store = SettingsStore::new(Arc::clone(&objects));
    if let Some(ref path) = args.settings_file {
        seed_settings(&settings_store, path)?;
    }

    let session_config = args.session_config();
    let sessions = Arc::new(SessionStore::open(
        args.data_dir.join("sessions.redb"),
        session_config.ttl_secs,
    )?);
    info!(
        sessions = sessions.session_count()?,
        ttl_secs = session_config.ttl_secs,
        "Session store initialized"
    );

    let accounts = AccountLinker::new(users, groups.clone(), Arc::clone(&objects));
    let state = Arc::new(AppState::new(
        Arc::clone(&sessions),
        session_config,
        accounts,
        groups,
        settings_store,
        saml_provider_factory,
    ));
    state.load_settings()?;

    let _cleanup_handle = spawn_cleanup_task(Arc::clone(&sessions), args.cleanup_interval_secs);

    let listener = TcpListener::bind(args.listen)
        .await
        .with_context(|| format!("Failed to bind {}", args.listen))?;
    info!(listen = %args.listen, "Listening");

    axum::serve(listener, handlers::router(state)).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forum::store::test_store;
    use std::io::Write;

    #[test]
    fn test_args_defaults() {
        let args = Args::try_parse_from(["forum-sso-saml"]).unwrap();
        assert_eq!(args.listen.port(), 4567);
        assert!(args.settings_file.is_none());

        let config = args.session_config();
        assert!(config.cookie_secure);
        assert_eq!(config.cookie_name, "forum_sso_session");
        assert_eq!(config.ttl_secs, 14 * 24 * 60 * 60);
    }

    #[test]
    fn test_args_cookie_options() {
        let args = Args::try_parse_from([
            "forum-sso-saml",
            "--insecure-cookies",
            "--cookie-domain",
            "forum.example.com",
            "--session-ttl-secs",
            "60",
        ])
        .unwrap();

        let config = args.session_config();
        assert!(!config.cookie_secure);
        assert_eq!(config.cookie_domain.as_deref(), Some("forum.example.com"));
        assert_eq!(config.ttl_secs, 60);
    }

    #[test]
    fn test_seed_settings_merges() {
        let (objects, _dir) = test_store();
        let store = SettingsStore::new(Arc::new(objects));
        store
            .set(
                SETTINGS_PLUGIN_ID,
                &SamlSettings {
                    login_button_text: "Sign in".to_string(),
                    ..SamlSettings::default()
                },
            )
            .unwrap();

        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"idpLoginUrl": "https://idp.example.com/sso", "loginsuccessredirecturl": "/recent"}}"#
        )
        .unwrap();

        seed_settings(&store, file.path()).unwrap();

        let settings: SamlSettings = store.get(SETTINGS_PLUGIN_ID).unwrap();
        assert_eq!(settings.idp_login_url, "https://idp.example.com/sso");
        assert_eq!(settings.login_success_redirect_url, "/recent");
        assert_eq!(settings.login_button_text, "Sign in");
    }

    #[test]
    fn test_seed_settings_rejects_bad_file() {
        let (objects, _dir) = test_store();
        let store = SettingsStore::new(Arc::new(objects));

        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();
        assert!(seed_settings(&store, file.path()).is_err());
        assert!(seed_settings(&store, Path::new("/nonexistent/settings.json")).is_err());
    }
}
