//! SSO plugin settings.
//!
//! Field names match what the forum admin page persists under
//! `settings:sso-saml`, so existing installations keep their configuration.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Settings hash name in the forum settings store.
pub const SETTINGS_PLUGIN_ID: &str = "sso-saml";

/// Transient NameID format, requested unless configured otherwise.
pub const NAMEID_FORMAT_TRANSIENT: &str = "urn:oasis:names:tc:SAML:2.0:nameid-format:transient";

/// Password-protected authentication context class.
pub const AUTHN_CONTEXT_PASSWORD: &str = "urn:oasis:names:tc:SAML:1.0:am:password";

/// Names of the assertion attributes used for account linking.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AttributeNames {
    /// Stable subject identifier attribute.
    pub id: String,
    pub email: String,
    /// Used as the username of created accounts.
    pub first_name: String,
    /// Comma-separated role list.
    pub roles: String,
}

impl Default for AttributeNames {
    fn default() -> Self {
        Self {
            id: "ID".to_string(),
            email: "Email".to_string(),
            first_name: "FirstName".to_string(),
            roles: "Roles".to_string(),
        }
    }
}

/// Persisted SSO settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SamlSettings {
    /// SP entity ID (issuer of our requests, audience of assertions).
    pub sp_entity_id: String,

    /// SP certificate (PEM text or path to a PEM file).
    pub sp_cert: String,

    /// SP private key (PEM text or path), used to sign redirect requests.
    pub sp_key: String,

    /// IdP signing certificate (PEM text or path).
    pub idp_cert: String,

    /// IdP single sign-on URL (redirect binding).
    pub idp_login_url: String,

    /// IdP single logout URL (redirect binding). Optional.
    pub idp_logout_url: String,

    /// IdP entity ID. Defaults to the login URL when empty.
    pub idp_entity_id: String,

    /// Inline IdP metadata XML. Overrides the metadata synthesized from the
    /// fields above.
    pub idp_metadata_xml: String,

    /// Absolute URL of our assertion consumer service.
    pub assert_endpoint: String,

    /// Where to send users after a successful login.
    #[serde(rename = "loginsuccessredirecturl")]
    pub login_success_redirect_url: String,

    pub name_id_format: String,

    /// Ask the IdP to re-authenticate even with an existing IdP session.
    pub force_authn: bool,

    /// Requested authentication context classes (exact comparison).
    pub authn_context_class_refs: Vec<String>,

    /// Sign redirect-binding requests when an SP key is configured.
    pub sign_requests: bool,

    pub attribute_names: AttributeNames,

    /// SAML role -> forum group.
    pub role_map: BTreeMap<String, String>,

    /// Label of the SSO button on the forum login page.
    pub login_button_text: String,
}

impl Default for SamlSettings {
    fn default() -> Self {
        let mut role_map = BTreeMap::new();
        role_map.insert(
            "MDDAP-Portal-Admin".to_string(),
            "administrators".to_string(),
        );

        Self {
            sp_entity_id: "http://localhost:4567".to_string(),
            sp_cert: String::new(),
            sp_key: String::new(),
            idp_cert: String::new(),
            idp_login_url: String::new(),
            idp_logout_url: String::new(),
            idp_entity_id: String::new(),
            idp_metadata_xml: String::new(),
            assert_endpoint: "http://localhost:4567/auth/saml/callback".to_string(),
            login_success_redirect_url: String::new(),
            name_id_format: NAMEID_FORMAT_TRANSIENT.to_string(),
            force_authn: true,
            authn_context_class_refs: vec![AUTHN_CONTEXT_PASSWORD.to_string()],
            sign_requests: true,
            attribute_names: AttributeNames::default(),
            role_map,
            login_button_text: "Login with SSO".to_string(),
        }
    }
}

impl SamlSettings {
    /// Whether enough is configured to attempt a login.
    pub fn is_configured(&self) -> bool {
        !self.idp_login_url.trim().is_empty()
    }

    /// Validate the settings before building a provider.
    pub fn validate(&self) -> Result<(), String> {
        if self.sp_entity_id.trim().is_empty() {
            return Err("spEntityId is required".to_string());
        }
        if self.assert_endpoint.trim().is_empty() {
            return Err("assertEndpoint is required".to_string());
        }
        if self.idp_login_url.trim().is_empty() {
            return Err("idpLoginUrl is required".to_string());
        }
        if self.idp_cert.trim().is_empty() && self.idp_metadata_xml.trim().is_empty() {
            return Err("idpCert or idpMetadataXml is required".to_string());
        }
        for url in [&self.idp_login_url, &self.idp_logout_url, &self.assert_endpoint] {
            let url = url.trim();
            if !url.is_empty() && !(url.starts_with("https://") || url.starts_with("http://")) {
                return Err(format!("'{}' is not an absolute http(s) URL", url));
            }
        }
        Ok(())
    }

    /// IdP entity ID, falling back to the login URL.
    pub fn idp_entity_id(&self) -> &str {
        if self.idp_entity_id.trim().is_empty() {
            self.idp_login_url.trim()
        } else {
            self.idp_entity_id.trim()
        }
    }

    /// Copy with secrets blanked, for the admin API.
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        if !copy.sp_key.is_empty() {
            copy.sp_key = REDACTED.to_string();
        }
        copy
    }
}

/// Placeholder returned instead of the SP key.
pub const REDACTED: &str = "********";

/// Load PEM material given either inline or as a file path.
pub fn read_pem(path_or_content: &str) -> Result<String> {
    let trimmed = path_or_content.trim();
    if trimmed.starts_with("-----BEGIN") {
        return Ok(path_or_content.to_string());
    }

    std::fs::read_to_string(trimmed)
        .map_err(|_| anyhow!("Cannot read certificate from path: {}", path_or_content))
}

/// Strip PEM armour and whitespace, leaving the base64 body.
pub fn pem_body(pem: &str) -> String {
    pem.lines()
        .map(str::trim)
        .filter(|line| !line.starts_with("-----"))
        .collect()
}

/// Partial settings for admin updates and seed files.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct SamlSettingsJson {
    pub sp_entity_id: Option<String>,
    pub sp_cert: Option<String>,
    pub sp_key: Option<String>,
    pub idp_cert: Option<String>,
    pub idp_login_url: Option<String>,
    pub idp_logout_url: Option<String>,
    pub idp_entity_id: Option<String>,
    pub idp_metadata_xml: Option<String>,
    pub assert_endpoint: Option<String>,
    #[serde(rename = "loginsuccessredirecturl")]
    pub login_success_redirect_url: Option<String>,
    pub name_id_format: Option<String>,
    pub force_authn: Option<bool>,
    pub authn_context_class_refs: Option<Vec<String>>,
    pub sign_requests: Option<bool>,
    pub attribute_names: Option<AttributeNames>,
    pub role_map: Option<BTreeMap<String, String>>,
    pub login_button_text: Option<String>,
}

impl SamlSettingsJson {
    /// Merge into existing settings. A redacted SP key leaves the stored key
    /// untouched.
    pub fn apply_to(&self, settings: &mut SamlSettings) {
        fn set<T: Clone>(target: &mut T, value: &Option<T>) {
            if let Some(v) = value {
                *target = v.clone();
            }
        }

        set(&mut settings.sp_entity_id, &self.sp_entity_id);
        set(&mut settings.sp_cert, &self.sp_cert);
        if self.sp_key.as_deref() != Some(REDACTED) {
            set(&mut settings.sp_key, &self.sp_key);
        }
        set(&mut settings.idp_cert, &self.idp_cert);
        set(&mut settings.idp_login_url, &self.idp_login_url);
        set(&mut settings.idp_logout_url, &self.idp_logout_url);
        set(&mut settings.idp_entity_id, &self.idp_entity_id);
        set(&mut settings.idp_metadata_xml, &self.idp_metadata_xml);
        set(&mut settings.assert_endpoint, &self.assert_endpoint);
        set(
            &mut settings.login_success_redirect_url,
            &self.login_success_redirect_url,
        );
        set(&mut settings.name_id_format, &self.name_id_format);
        set(&mut settings.force_authn, &self.force_authn);
        set(
            &mut settings.authn_context_class_refs,
            &self.authn_context_class_refs,
        );
        set(&mut settings.sign_requests, &self.sign_requests);
        set(&mut settings.attribute_names, &self.attribute_names);
        set(&mut settings.role_map, &self.role_map);
        set(&mut settings.login_button_text, &self.login_button_text);
    }
}

#[cfg(test)]
pub(crate) const TEST_CERT_PEM: &str = "-----BEGIN CERTIFICATE-----
MIIBszCCAVmgAwIBAgIUTestCertificateBodyOnlyForUnitTests0wCgYIKoZI
zj0EAwIwGDEWMBQGA1UEAwwNaWRwLmV4YW1wbGUuY29tMB4XDTI0MDEwMTAwMDAw
-----END CERTIFICATE-----
";

#[cfg(test)]
pub(crate) fn test_settings() -> SamlSettings {
    SamlSettings {
        sp_entity_id: "https://forum.example.com".to_string(),
        idp_cert: TEST_CERT_PEM.to_string(),
        idp_login_url: "https://idp.example.com/sso".to_string(),
        idp_logout_url: "https://idp.example.com/slo".to_string(),
        idp_entity_id: "https://idp.example.com".to_string(),
        assert_endpoint: "https://forum.example.com/sso/assert".to_string(),
        ..Default::default()
    }
}
