//! SAML 2.0 Service Provider.
//!
//! Plugin settings plus the redirect-binding provider used by the HTTP
//! handlers.

pub mod config;
pub mod provider;

pub use config::{AttributeNames, SamlSettings, SamlSettingsJson, SETTINGS_PLUGIN_ID};
pub use provider::{LogoutSubject, ProcessedAssertion, SamlProvider, SsoProvider};
