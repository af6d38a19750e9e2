//! Shared application state for the HTTP handlers.

use anyhow::{anyhow, Result};
use std::sync::{Arc, RwLock};
use tracing::{info, warn};

use crate::accounts::AccountLinker;
use crate::forum::{GroupDirectory, SettingsStore};
use crate::saml::{SamlProvider, SamlSettings, SsoProvider, SETTINGS_PLUGIN_ID};
use crate::session::{SessionConfig, SessionStore};

/// Builds a provider from settings.
pub type ProviderFactory = fn(SamlSettings) -> Result<Arc<dyn SsoProvider>>;

/// Provider factory used by the service.
pub fn saml_provider_factory(settings: SamlSettings) -> Result<Arc<dyn SsoProvider>> {
    Ok(Arc::new(SamlProvider::new(settings)?))
}

pub struct AppState {
    provider: RwLock<Option<Arc<dyn SsoProvider>>>,
    settings: RwLock<SamlSettings>,
    factory: ProviderFactory,
    pub sessions: Arc<SessionStore>,
    pub session_config: SessionConfig,
    pub accounts: AccountLinker,
    pub groups: Arc<dyn GroupDirectory>,
    pub settings_store: SettingsStore,
}

impl AppState {
    pub fn new(
        sessions: Arc<SessionStore>,
        session_config: SessionConfig,
        accounts: AccountLinker,
        groups: Arc<dyn GroupDirectory>,
        settings_store: SettingsStore,
        factory: ProviderFactory,
    ) -> Self {
        Self {
            provider: RwLock::new(None),
            settings: RwLock::new(SamlSettings::default()),
            factory,
            sessions,
            session_config,
            accounts,
            groups,
            settings_store,
        }
    }

    /// Current plugin settings.
    pub fn settings(&self) -> Result<SamlSettings> {
        self.settings
            .read()
            .map(|s| s.clone())
            .map_err(|_| anyhow!("Settings lock poisoned"))
    }

    /// The configured provider, or an error when SAML is not set up.
    pub fn provider(&self) -> Result<Arc<dyn SsoProvider>> {
        let guard = self
            .provider
            .read()
            .map_err(|_| anyhow!("SAML provider lock poisoned"))?;
        guard
            .as_ref()
            .cloned()
            .ok_or_else(|| anyhow!("SAML provider not configured"))
    }

    /// Build a provider for the settings and install both.
    ///
    /// Unconfigured settings clear the provider. A build failure leaves the
    /// previous state untouched.
    pub fn configure(&self, settings: SamlSettings) -> Result<()> {
        let provider = if settings.is_configured() {
            Some((self.factory)(settings.clone())?)
        } else {
            None
        };

        let configured = provider.is_some();
        {
            let mut guard = self
                .provider
                .write()
                .map_err(|_| anyhow!("SAML provider lock poisoned"))?;
            *guard = provider;
        }
        {
            let mut guard = self
                .settings
                .write()
                .map_err(|_| anyhow!("Settings lock poisoned"))?;
            *guard = settings;
        }

        if configured {
            info!("SAML provider installed");
        } else {
            warn!("SAML is not configured, logins are disabled until idpLoginUrl is set");
        }
        Ok(())
    }

    /// Load the persisted settings and try to build the provider.
    pub fn load_settings(&self) -> Result<()> {
        let settings: SamlSettings = self.settings_store.get(SETTINGS_PLUGIN_ID)?;
        if let Err(e) = self.configure(settings.clone()) {
            warn!(error = %e, "Stored SAML settings are unusable, SAML login disabled");
            let mut guard = self
                .settings
                .write()
                .map_err(|_| anyhow!("Settings lock poisoned"))?;
            *guard = settings;
        }
        Ok(())
    }

    /// Validate, build and persist new settings.
    pub fn update_settings(&self, settings: SamlSettings) -> Result<()> {
        if settings.is_configured() {
            settings.validate().map_err(|e| anyhow!(e))?;
        }
        self.configure(settings.clone())?;
        self.settings_store.set(SETTINGS_PLUGIN_ID, &settings)?;
        info!("SAML settings updated");
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::forum::store::test_store as object_test_store;
    use crate::forum::{ForumGroups, ForumUsers, ObjectStore};
    use crate::saml::{LogoutSubject, ProcessedAssertion};
    use crate::session::store::test_store as session_test_store;
    use std::collections::HashMap;

    /// Provider that accepts `SAMLResponse` values of the form
    /// `<assertion id>|<name id>|<attr>=<v1>;<v2>|...`.
    pub(crate) struct FakeProvider {
        pub logout_url: Option<String>,
    }

    impl SsoProvider for FakeProvider {
        fn login_url(&self, relay_state: Option<&str>) -> Result<String> {
            Ok(match relay_state {
                Some(state) => format!(
                    "https://idp.example.com/sso?SAMLRequest=req&RelayState={}",
                    urlencoding::encode(state)
                ),
                None => "https://idp.example.com/sso?SAMLRequest=req".to_string(),
            })
        }

        fn assert_login(&self, form: &HashMap<String, String>) -> Result<ProcessedAssertion> {
            let response = form
                .get("SAMLResponse")
                .ok_or_else(|| anyhow!("Missing SAMLResponse"))?;
            let mut parts = response.split('|');
            let assertion_id = parts.next().unwrap_or_default().to_string();
            if assertion_id == "invalid" {
                return Err(anyhow!("signature mismatch"));
            }
            let name_id = parts.next().unwrap_or_default().to_string();
            let attributes = parts
                .filter_map(|attr| attr.split_once('='))
                .map(|(k, v)| (k.to_string(), v.split(';').map(str::to_string).collect()))
                .collect();
            Ok(ProcessedAssertion {
                name_id,
                assertion_id,
                idp_entity_id: "https://idp.example.com".to_string(),
                session_index: Some("_idx".to_string()),
                attributes,
                ..Default::default()
            })
        }

        fn logout_url(&self, subject: &LogoutSubject) -> Result<String> {
            let base = self
                .logout_url
                .as_deref()
                .ok_or_else(|| anyhow!("IdP logout URL not configured"))?;
            Ok(format!(
                "{}?name_id={}&session_index={}",
                base,
                subject.name_id,
                subject.session_index.as_deref().unwrap_or_default()
            ))
        }

        fn metadata(&self) -> Result<String> {
            Ok("<EntityDescriptor/>".to_string())
        }
    }

    pub(crate) fn fake_factory(settings: SamlSettings) -> Result<Arc<dyn SsoProvider>> {
        let logout_url = Some(settings.idp_logout_url.trim())
            .filter(|url| !url.is_empty())
            .map(str::to_string);
        Ok(Arc::new(FakeProvider { logout_url }))
    }

    pub(crate) struct TestApp {
        pub state: Arc<AppState>,
        pub objects: Arc<ObjectStore>,
        pub users: Arc<ForumUsers>,
        pub groups: Arc<ForumGroups>,
        _dirs: (tempfile::TempDir, tempfile::TempDir),
    }

    /// State with fresh stores and a fake provider configured from
    /// `settings`.
    pub(crate) fn test_app(settings: SamlSettings) -> TestApp {
        let (objects, objects_dir) = object_test_store();
        let objects = Arc::new(objects);
        let (sessions, sessions_dir) = session_test_store();

        let groups = Arc::new(ForumGroups::new(Arc::clone(&objects)));
        groups.ensure_system_groups().unwrap();
        let users = Arc::new(ForumUsers::new(Arc::clone(&objects), groups.clone()));
        let accounts = AccountLinker::new(users.clone(), groups.clone(), Arc::clone(&objects));

        let state = Arc::new(AppState::new(
            Arc::new(sessions),
            SessionConfig::default(),
            accounts,
            groups.clone(),
            SettingsStore::new(Arc::clone(&objects)),
            fake_factory,
        ));
        state.configure(settings).unwrap();

        TestApp {
            state,
            objects,
            users,
            groups,
            _dirs: (objects_dir, sessions_dir),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::test_app;
    use super::*;
    use crate::saml::config::test_settings;

    #[test]
    fn test_unconfigured_has_no_provider() {
        let app = test_app(SamlSettings::default());
        assert!(app.state.provider().is_err());
    }

    #[test]
    fn test_configure_installs_provider() {
        let app = test_app(test_settings());
        assert!(app.state.provider().is_ok());
        assert_eq!(
            app.state.settings().unwrap().idp_login_url,
            "https://idp.example.com/sso"
        );
    }

    #[test]
    fn test_update_settings_persists_and_reloads() {
        let app = test_app(SamlSettings::default());
        app.state.update_settings(test_settings()).unwrap();
        assert!(app.state.provider().is_ok());

        let stored: SamlSettings = app.state.settings_store.get(SETTINGS_PLUGIN_ID).unwrap();
        assert_eq!(stored.idp_login_url, "https://idp.example.com/sso");

        app.state.configure(SamlSettings::default()).unwrap();
        app.state.load_settings().unwrap();
        assert!(app.state.provider().is_ok());
    }

    #[test]
    fn test_update_settings_rejects_invalid() {
        let app = test_app(SamlSettings::default());
        let invalid = SamlSettings {
            idp_login_url: "ftp://idp".to_string(),
            ..test_settings()
        };
        assert!(app.state.update_settings(invalid).is_err());
        assert!(app.state.provider().is_err());
    }
}
