//! SAML Service Provider.
//!
//! Builds redirect-binding login and logout requests and hands POSTed
//! responses to samael for validation.

use anyhow::{anyhow, Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::Utc;
use openssl::hash::MessageDigest;
use openssl::pkey::{PKey, Private};
use openssl::sign::Signer;
use openssl::x509::X509;
use quick_xml::escape::escape;
use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;
use samael::metadata::EntityDescriptor;
use samael::schema::{
    AuthnContextClassRef, AuthnContextComparison, AuthnRequest, Issuer, NameIdPolicy,
    RequestedAuthnContext,
};
use samael::service_provider::ServiceProvider;
use samael::traits::ToXml;
use std::collections::HashMap;
use tracing::{debug, info, warn};

use super::config::{pem_body, read_pem, SamlSettings};

const PROTOCOL_NS: &str = "urn:oasis:names:tc:SAML:2.0:protocol";
const ASSERTION_NS: &str = "urn:oasis:names:tc:SAML:2.0:assertion";
const BINDING_HTTP_POST: &str = "urn:oasis:names:tc:SAML:2.0:bindings:HTTP-POST";
const BINDING_HTTP_REDIRECT: &str = "urn:oasis:names:tc:SAML:2.0:bindings:HTTP-Redirect";
const SIG_ALG_RSA_SHA256: &str = "http://www.w3.org/2001/04/xmldsig-more#rsa-sha256";

/// Identity extracted from a validated assertion.
#[derive(Debug, Clone, Default)]
pub struct ProcessedAssertion {
    /// NameID value of the assertion subject.
    pub name_id: String,
    pub name_id_format: Option<String>,
    pub assertion_id: String,
    pub idp_entity_id: String,
    pub session_index: Option<String>,
    /// Attribute name -> values. SAML attributes may be multi-valued.
    pub attributes: HashMap<String, Vec<String>>,
}

/// Who to log out at the IdP.
#[derive(Debug, Clone, Default)]
pub struct LogoutSubject {
    pub name_id: String,
    pub name_id_format: Option<String>,
    pub session_index: Option<String>,
}

/// The SSO protocol operations the HTTP layer depends on.
pub trait SsoProvider: Send + Sync {
    /// URL that starts an SP-initiated login at the IdP.
    fn login_url(&self, relay_state: Option<&str>) -> Result<String>;

    /// Validate the `SAMLResponse` of a POSTed form and extract the identity.
    fn assert_login(&self, form: &HashMap<String, String>) -> Result<ProcessedAssertion>;

    /// URL that logs the subject out at the IdP.
    fn logout_url(&self, subject: &LogoutSubject) -> Result<String>;

    /// SP metadata XML.
    fn metadata(&self) -> Result<String>;
}

/// samael-backed provider built from the plugin settings.
pub struct SamlProvider {
    settings: SamlSettings,
    sp: ServiceProvider,
    signing_key: Option<PKey<Private>>,
}

impl SamlProvider {
    /// Build a provider. Fails on invalid settings or unreadable key material.
    pub fn new(settings: SamlSettings) -> Result<Self> {
        settings.validate().map_err(|e| anyhow!(e))?;

        let metadata_xml = if settings.idp_metadata_xml.trim().is_empty() {
            let idp_cert = read_pem(&settings.idp_cert)?;
            idp_metadata_xml(&settings, &pem_body(&idp_cert))
        } else {
            settings.idp_metadata_xml.clone()
        };
        let idp_metadata: EntityDescriptor =
            samael::metadata::de::from_str(&metadata_xml).context("Failed to parse IdP metadata")?;

        let signing_key = if settings.sign_requests {
            if settings.sp_key.trim().is_empty() {
                warn!("signRequests is on but no spKey is configured, requests will be unsigned");
                None
            } else {
                let pem = read_pem(&settings.sp_key)?;
                Some(PKey::private_key_from_pem(pem.as_bytes()).context("Failed to parse spKey")?)
            }
        } else {
            None
        };

        let certificate = if settings.sp_cert.trim().is_empty() {
            if signing_key.is_some() {
                warn!("Requests are signed but no spCert is configured, the IdP cannot verify them from metadata");
            }
            None
        } else {
            let pem = read_pem(&settings.sp_cert)?;
            let cert = X509::from_pem(pem.as_bytes()).context("Failed to parse spCert")?;
            if let Some(ref key) = signing_key {
                let public = cert.public_key().context("Failed to read spCert public key")?;
                if !public.public_eq(key) {
                    return Err(anyhow!("spCert does not match spKey"));
                }
            }
            Some(cert)
        };

        let sp = ServiceProvider {
            entity_id: Some(settings.sp_entity_id.trim().to_string()),
            acs_url: Some(settings.assert_endpoint.trim().to_string()),
            key: signing_key.clone(),
            certificate,
            idp_metadata,
            // Responses are not correlated with request IDs.
            allow_idp_initiated: true,
            ..ServiceProvider::default()
        };

        info!(
            sp_entity_id = %settings.sp_entity_id,
            idp_entity_id = %settings.idp_entity_id(),
            signed_requests = signing_key.is_some(),
            "SAML provider configured"
        );

        Ok(Self {
            settings,
            sp,
            signing_key,
        })
    }

    fn authn_request(&self, request_id: &str) -> AuthnRequest {
        let s = &self.settings;

        // samael writes element text as given, so text content is escaped here.
        let requested_authn_context = (!s.authn_context_class_refs.is_empty()).then(|| {
            RequestedAuthnContext {
                authn_context_class_refs: Some(
                    s.authn_context_class_refs
                        .iter()
                        .map(|class_ref| AuthnContextClassRef {
                            value: Some(escape(class_ref).into_owned()),
                        })
                        .collect(),
                ),
                authn_context_decl_refs: None,
                comparison: Some(AuthnContextComparison::Exact),
            }
        });

        AuthnRequest {
            id: request_id.to_string(),
            version: "2.0".to_string(),
            issue_instant: Utc::now(),
            destination: Some(s.idp_login_url.trim().to_string()),
            issuer: Some(Issuer {
                value: Some(escape(s.sp_entity_id.trim()).into_owned()),
                ..Issuer::default()
            }),
            name_id_policy: (!s.name_id_format.is_empty()).then(|| NameIdPolicy {
                format: Some(s.name_id_format.clone()),
                allow_create: Some(true),
                ..NameIdPolicy::default()
            }),
            requested_authn_context,
            force_authn: s.force_authn.then_some(true),
            assertion_consumer_service_url: Some(s.assert_endpoint.trim().to_string()),
            protocol_binding: Some(BINDING_HTTP_POST.to_string()),
            ..AuthnRequest::default()
        }
    }

    /// LogoutRequest XML. Written directly since samael's serializer puts
    /// SessionIndex ahead of NameID, which the protocol schema does not allow.
    fn logout_request_xml(&self, request_id: &str, subject: &LogoutSubject) -> Result<String> {
        let s = &self.settings;
        let format = subject
            .name_id_format
            .as_deref()
            .unwrap_or(s.name_id_format.as_str());
        let issue_instant = issue_instant();

        let mut writer = Writer::new(Vec::new());
        let mut root = BytesStart::new("samlp:LogoutRequest");
        root.push_attribute(("xmlns:samlp", PROTOCOL_NS));
        root.push_attribute(("xmlns:saml", ASSERTION_NS));
        root.push_attribute(("ID", request_id));
        root.push_attribute(("Version", "2.0"));
        root.push_attribute(("IssueInstant", issue_instant.as_str()));
        root.push_attribute(("Destination", s.idp_logout_url.trim()));
        writer.write_event(Event::Start(root))?;

        write_text_element(&mut writer, "saml:Issuer", &[], s.sp_entity_id.trim())?;

        let name_id_attributes = if format.is_empty() {
            Vec::new()
        } else {
            vec![("Format", format)]
        };
        write_text_element(&mut writer, "saml:NameID", &name_id_attributes, &subject.name_id)?;

        if let Some(ref index) = subject.session_index {
            write_text_element(&mut writer, "samlp:SessionIndex", &[], index)?;
        }

        writer.write_event(Event::End(BytesEnd::new("samlp:LogoutRequest")))?;
        String::from_utf8(writer.into_inner()).context("LogoutRequest is not UTF-8")
    }

    /// Encode a message for the HTTP-Redirect binding, signing the query
    /// string when an SP key is available.
    fn redirect_url(
        &self,
        endpoint: &str,
        parameter: &str,
        xml: &str,
        relay_state: Option<&str>,
    ) -> Result<String> {
        let encoded = deflate_and_encode(xml)?;

        let mut query = format!("{}={}", parameter, urlencoding::encode(&encoded));
        if let Some(state) = relay_state {
            query.push_str(&format!("&RelayState={}", urlencoding::encode(state)));
        }
        if let Some(ref key) = self.signing_key {
            query.push_str(&format!("&SigAlg={}", urlencoding::encode(SIG_ALG_RSA_SHA256)));
            let signature = sign_sha256(key, query.as_bytes())?;
            query.push_str(&format!("&Signature={}", urlencoding::encode(&signature)));
        }

        let separator = if endpoint.contains('?') { '&' } else { '?' };
        Ok(format!("{}{}{}", endpoint, separator, query))
    }
}

impl SsoProvider for SamlProvider {
    fn login_url(&self, relay_state: Option<&str>) -> Result<String> {
        let request_id = new_request_id();
        let xml = self
            .authn_request(&request_id)
            .to_string()
            .map_err(|e| anyhow!("Failed to serialize AuthnRequest: {}", e))?;
        let url = self.redirect_url(
            self.settings.idp_login_url.trim(),
            "SAMLRequest",
            &xml,
            relay_state,
        )?;

        debug!(request_id = %request_id, "Created SAML AuthnRequest redirect");
        Ok(url)
    }

    fn assert_login(&self, form: &HashMap<String, String>) -> Result<ProcessedAssertion> {
        let saml_response = form
            .get("SAMLResponse")
            .ok_or_else(|| anyhow!("Missing SAMLResponse"))?;

        // Form decoding turns '+' into ' ', which is never valid base64.
        let compact: String = saml_response
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect();

        let assertion = self
            .sp
            .parse_base64_response(&compact, None)
            .map_err(|e| anyhow!("SAML assertion validation failed: {}", e))?;

        let processed = extract_assertion(&assertion)?;

        info!(
            name_id = %processed.name_id,
            idp = %processed.idp_entity_id,
            attributes = processed.attributes.len(),
            "SAML assertion validated"
        );

        Ok(processed)
    }

    fn logout_url(&self, subject: &LogoutSubject) -> Result<String> {
        let endpoint = self.settings.idp_logout_url.trim();
        if endpoint.is_empty() {
            return Err(anyhow!("IdP logout URL not configured"));
        }
        if subject.name_id.is_empty() {
            return Err(anyhow!("Cannot build logout request without a NameID"));
        }

        let request_id = new_request_id();
        let xml = self.logout_request_xml(&request_id, subject)?;
        let url = self.redirect_url(endpoint, "SAMLRequest", &xml, None)?;

        debug!(request_id = %request_id, "Created SAML LogoutRequest redirect");
        Ok(url)
    }

    fn metadata(&self) -> Result<String> {
        let descriptor = self
            .sp
            .metadata()
            .map_err(|e| anyhow!("Failed to build SP metadata: {}", e))?;
        descriptor
            .to_string()
            .map_err(|e| anyhow!("Failed to serialize SP metadata: {}", e))
    }
}

/// Pull the subject, session index and attributes out of a validated assertion.
fn extract_assertion(assertion: &samael::schema::Assertion) -> Result<ProcessedAssertion> {
    let name_id = assertion
        .subject
        .as_ref()
        .and_then(|subject| subject.name_id.as_ref())
        .ok_or_else(|| anyhow!("SAML assertion missing NameID"))?;

    let session_index = assertion
        .authn_statements
        .as_ref()
        .and_then(|stmts| stmts.first())
        .and_then(|s| s.session_index.clone());

    let mut attributes: HashMap<String, Vec<String>> = HashMap::new();
    for statement in assertion.attribute_statements.iter().flatten() {
        for attr in &statement.attributes {
            let Some(ref name) = attr.name else {
                continue;
            };
            let values: Vec<String> = attr.values.iter().filter_map(|v| v.value.clone()).collect();
            if !values.is_empty() {
                attributes.entry(name.clone()).or_default().extend(values);
            }
        }
    }

    Ok(ProcessedAssertion {
        name_id: name_id.value.clone(),
        name_id_format: name_id.format.clone(),
        assertion_id: assertion.id.clone(),
        idp_entity_id: assertion
            .issuer
            .value
            .clone()
            .unwrap_or_else(|| "unknown".to_string()),
        session_index,
        attributes,
    })
}

/// IdP metadata describing the configured endpoints and signing certificate.
fn idp_metadata_xml(settings: &SamlSettings, certificate_b64: &str) -> String {
    let mut xml = format!(
        r#"<EntityDescriptor xmlns="urn:oasis:names:tc:SAML:2.0:metadata" xmlns:ds="http://www.w3.org/2000/09/xmldsig#" entityID="{}">"#,
        escape(settings.idp_entity_id())
    );
    xml.push_str(&format!(
        r#"<IDPSSODescriptor protocolSupportEnumeration="{}">"#,
        PROTOCOL_NS
    ));
    xml.push_str(&format!(
        r#"<KeyDescriptor use="signing"><ds:KeyInfo><ds:X509Data><ds:X509Certificate>{}</ds:X509Certificate></ds:X509Data></ds:KeyInfo></KeyDescriptor>"#,
        escape(certificate_b64)
    ));
    let logout_url = settings.idp_logout_url.trim();
    if !logout_url.is_empty() {
        xml.push_str(&format!(
            r#"<SingleLogoutService Binding="{}" Location="{}"/>"#,
            BINDING_HTTP_REDIRECT,
            escape(logout_url)
        ));
    }
    xml.push_str(&format!(
        r#"<SingleSignOnService Binding="{}" Location="{}"/>"#,
        BINDING_HTTP_REDIRECT,
        escape(settings.idp_login_url.trim())
    ));
    xml.push_str("</IDPSSODescriptor></EntityDescriptor>");
    xml
}

fn write_text_element(
    writer: &mut Writer<Vec<u8>>,
    name: &str,
    attributes: &[(&str, &str)],
    text: &str,
) -> Result<()> {
    let mut start = BytesStart::new(name);
    for &attribute in attributes {
        start.push_attribute(attribute);
    }
    writer.write_event(Event::Start(start))?;
    writer.write_event(Event::Text(BytesText::new(text)))?;
    writer.write_event(Event::End(BytesEnd::new(name)))?;
    Ok(())
}

fn new_request_id() -> String {
    format!("_id{}", uuid::Uuid::new_v4().simple())
}

fn issue_instant() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

/// Deflate and base64 encode for SAML redirect binding.
fn deflate_and_encode(xml: &str) -> Result<String> {
    use std::io::Write;

    let mut encoder =
        flate2::write::DeflateEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(xml.as_bytes())?;
    let compressed = encoder.finish()?;
    Ok(BASE64.encode(compressed))
}

fn sign_sha256(key: &PKey<Private>, data: &[u8]) -> Result<String> {
    let mut signer =
        Signer::new(MessageDigest::sha256(), key).context("Failed to create request signer")?;
    signer.update(data)?;
    let signature = signer.sign_to_vec().context("Failed to sign request")?;
    Ok(BASE64.encode(signature))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::saml::config::test_settings;
    use openssl::asn1::Asn1Time;
    use openssl::rsa::Rsa;
    use openssl::sign::Verifier;
    use openssl::x509::{X509Builder, X509NameBuilder};
    use samael::schema::Assertion;
    use std::io::Read;

    fn query_param(url: &str, name: &str) -> Option<String> {
        let query = url.split_once('?')?.1;
        query.split('&').find_map(|pair| {
            let (key, value) = pair.split_once('=')?;
            (key == name).then(|| urlencoding::decode(value).unwrap().into_owned())
        })
    }

    fn inflate(encoded: &str) -> String {
        let compressed = BASE64.decode(encoded).unwrap();
        let mut decoder = flate2::read::DeflateDecoder::new(compressed.as_slice());
        let mut xml = String::new();
        decoder.read_to_string(&mut xml).unwrap();
        xml
    }

    fn rsa_key() -> (PKey<Private>, String) {
        let key = PKey::from_rsa(Rsa::generate(2048).unwrap()).unwrap();
        let pem = String::from_utf8(key.private_key_to_pem_pkcs8().unwrap()).unwrap();
        (key, pem)
    }

    /// Self-signed certificate for `key`, as PEM.
    fn self_signed_cert(key: &PKey<Private>) -> String {
        let mut name = X509NameBuilder::new().unwrap();
        name.append_entry_by_text("CN", "forum.example.com").unwrap();
        let name = name.build();

        let mut builder = X509Builder::new().unwrap();
        builder.set_version(2).unwrap();
        builder.set_subject_name(&name).unwrap();
        builder.set_issuer_name(&name).unwrap();
        builder.set_pubkey(key).unwrap();
        builder
            .set_not_before(&Asn1Time::days_from_now(0).unwrap())
            .unwrap();
        builder
            .set_not_after(&Asn1Time::days_from_now(30).unwrap())
            .unwrap();
        builder.sign(key, MessageDigest::sha256()).unwrap();
        String::from_utf8(builder.build().to_pem().unwrap()).unwrap()
    }

    const ASSERTION_XML: &str = r#"<saml:Assertion xmlns:saml="urn:oasis:names:tc:SAML:2.0:assertion" xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance" xmlns:xs="http://www.w3.org/2001/XMLSchema" ID="_assertion42" Version="2.0" IssueInstant="2024-05-01T10:00:00Z">
  <saml:Issuer>https://idp.example.com</saml:Issuer>
  <saml:Subject>
    <saml:NameID Format="urn:oasis:names:tc:SAML:1.1:nameid-format:emailAddress">jdoe@example.com</saml:NameID>
  </saml:Subject>
  <saml:AuthnStatement AuthnInstant="2024-05-01T10:00:00Z" SessionIndex="_session7">
    <saml:AuthnContext>
      <saml:AuthnContextClassRef>urn:oasis:names:tc:SAML:2.0:ac:classes:Password</saml:AuthnContextClassRef>
    </saml:AuthnContext>
  </saml:AuthnStatement>
  <saml:AttributeStatement>
    <saml:Attribute Name="Email">
      <saml:AttributeValue xsi:type="xs:string">jdoe@example.com</saml:AttributeValue>
    </saml:Attribute>
    <saml:Attribute Name="Roles">
      <saml:AttributeValue xsi:type="xs:string">Editors</saml:AttributeValue>
      <saml:AttributeValue xsi:type="xs:string">Readers</saml:AttributeValue>
    </saml:Attribute>
    <saml:Attribute FriendlyName="nameless">
      <saml:AttributeValue xsi:type="xs:string">dropped</saml:AttributeValue>
    </saml:Attribute>
  </saml:AttributeStatement>
  <saml:AttributeStatement>
    <saml:Attribute Name="Roles">
      <saml:AttributeValue xsi:type="xs:string">MDDAP-Portal-Admin</saml:AttributeValue>
    </saml:Attribute>
    <saml:Attribute Name="FirstName">
      <saml:AttributeValue xsi:type="xs:string">Jane</saml:AttributeValue>
    </saml:Attribute>
  </saml:AttributeStatement>
</saml:Assertion>"#;

    #[test]
    fn test_new_with_test_settings() {
        assert!(SamlProvider::new(test_settings()).is_ok());
    }

    #[test]
    fn test_invalid_settings_rejected() {
        let settings = SamlSettings {
            idp_login_url: String::new(),
            ..test_settings()
        };
        assert!(SamlProvider::new(settings).is_err());

        let settings = SamlSettings {
            idp_cert: "/nonexistent/idp.pem".to_string(),
            ..test_settings()
        };
        assert!(SamlProvider::new(settings).is_err());

        let settings = SamlSettings {
            sp_cert: "-----BEGIN CERTIFICATE-----\nnot a cert\n-----END CERTIFICATE-----".to_string(),
            ..test_settings()
        };
        assert!(SamlProvider::new(settings).is_err());
    }

    #[test]
    fn test_login_url() {
        let provider = SamlProvider::new(test_settings()).unwrap();

        let url = provider.login_url(Some("/category/2")).unwrap();
        assert!(url.starts_with("https://idp.example.com/sso?SAMLRequest="));
        assert_eq!(query_param(&url, "RelayState").as_deref(), Some("/category/2"));
        assert!(query_param(&url, "Signature").is_none());

        let xml = inflate(&query_param(&url, "SAMLRequest").unwrap());
        let request: AuthnRequest = xml.parse().unwrap();
        assert_eq!(request.version, "2.0");
        assert!(request.id.starts_with("_id"));
        assert_eq!(request.destination.as_deref(), Some("https://idp.example.com/sso"));
        assert_eq!(
            request.assertion_consumer_service_url.as_deref(),
            Some("https://forum.example.com/sso/assert")
        );
        assert_eq!(request.protocol_binding.as_deref(), Some(BINDING_HTTP_POST));
        assert_eq!(request.force_authn, Some(true));
        assert_eq!(request.issuer_value().as_deref(), Some("https://forum.example.com"));
        assert!(xml.contains("nameid-format:transient"));
        assert!(xml.contains(r#"Comparison="exact""#));
        assert!(xml.contains("urn:oasis:names:tc:SAML:1.0:am:password"));
    }

    #[test]
    fn test_login_url_escapes_text() {
        let settings = SamlSettings {
            sp_entity_id: "https://forum.example.com/?a=1&b=2".to_string(),
            ..test_settings()
        };
        let provider = SamlProvider::new(settings).unwrap();

        let url = provider.login_url(None).unwrap();
        assert!(query_param(&url, "RelayState").is_none());

        let xml = inflate(&query_param(&url, "SAMLRequest").unwrap());
        assert!(xml.contains("https://forum.example.com/?a=1&amp;b=2</saml2:Issuer>"));
    }

    #[test]
    fn test_signed_redirect() {
        let (key, pem) = rsa_key();
        let settings = SamlSettings {
            sp_key: pem,
            ..test_settings()
        };
        let provider = SamlProvider::new(settings).unwrap();

        let url = provider.login_url(Some("/")).unwrap();
        assert_eq!(query_param(&url, "SigAlg").as_deref(), Some(SIG_ALG_RSA_SHA256));

        // The signature covers the raw query up to (not including) &Signature=.
        let query = url.split_once('?').unwrap().1;
        let signed_part = query.split("&Signature=").next().unwrap();
        let signature = BASE64
            .decode(query_param(&url, "Signature").unwrap())
            .unwrap();

        let mut verifier = Verifier::new(MessageDigest::sha256(), &key).unwrap();
        verifier.update(signed_part.as_bytes()).unwrap();
        assert!(verifier.verify(&signature).unwrap());
    }

    #[test]
    fn test_metadata_publishes_sp_certificate() {
        let (key, key_pem) = rsa_key();
        let cert_pem = self_signed_cert(&key);

        let provider = SamlProvider::new(SamlSettings {
            sp_cert: cert_pem.clone(),
            sp_key: key_pem,
            ..test_settings()
        })
        .unwrap();
        let metadata = provider.metadata().unwrap();
        assert!(metadata.contains(r#"entityID="https://forum.example.com""#));
        assert!(metadata.contains(r#"use="signing""#));
        assert!(metadata.contains(&pem_body(&cert_pem)));

        let provider = SamlProvider::new(test_settings()).unwrap();
        let metadata = provider.metadata().unwrap();
        assert!(!metadata.contains("X509Certificate"));
    }

    #[test]
    fn test_sp_certificate_must_match_key() {
        let (key, _) = rsa_key();
        let (_, other_key_pem) = rsa_key();

        let result = SamlProvider::new(SamlSettings {
            sp_cert: self_signed_cert(&key),
            sp_key: other_key_pem,
            ..test_settings()
        });
        let err = result.err().unwrap();
        assert_eq!(err.to_string(), "spCert does not match spKey");
    }

    #[test]
    fn test_logout_url() {
        let provider = SamlProvider::new(test_settings()).unwrap();

        let url = provider
            .logout_url(&LogoutSubject {
                name_id: "jdoe@example.com".to_string(),
                name_id_format: None,
                session_index: Some("_session<1>".to_string()),
            })
            .unwrap();
        assert!(url.starts_with("https://idp.example.com/slo?SAMLRequest="));

        let xml = inflate(&query_param(&url, "SAMLRequest").unwrap());
        assert!(xml.starts_with("<samlp:LogoutRequest"));
        assert!(xml.contains(r#"Destination="https://idp.example.com/slo""#));
        assert!(xml.contains("<saml:Issuer>https://forum.example.com</saml:Issuer>"));
        assert!(xml.contains("nameid-format:transient\">jdoe@example.com</saml:NameID>"));
        assert!(xml.contains("<samlp:SessionIndex>_session&lt;1&gt;</samlp:SessionIndex>"));
        assert!(xml.find("</saml:NameID>").unwrap() < xml.find("<samlp:SessionIndex>").unwrap());
    }

    #[test]
    fn test_logout_url_errors() {
        let provider = SamlProvider::new(test_settings()).unwrap();
        assert!(provider.logout_url(&LogoutSubject::default()).is_err());

        let provider = SamlProvider::new(SamlSettings {
            idp_logout_url: String::new(),
            ..test_settings()
        })
        .unwrap();
        let result = provider.logout_url(&LogoutSubject {
            name_id: "jdoe".to_string(),
            ..Default::default()
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_assert_rejects_bad_forms() {
        let provider = SamlProvider::new(test_settings()).unwrap();
        let form = |value: String| HashMap::from([("SAMLResponse".to_string(), value)]);

        let err = provider.assert_login(&HashMap::new()).unwrap_err();
        assert_eq!(err.to_string(), "Missing SAMLResponse");
        assert!(provider.assert_login(&form("not base64 at all!".into())).is_err());
        assert!(provider.assert_login(&form(BASE64.encode("<notsaml/>"))).is_err());
    }

    #[test]
    fn test_extract_assertion() {
        let assertion: Assertion = ASSERTION_XML.parse().unwrap();
        let processed = extract_assertion(&assertion).unwrap();

        assert_eq!(processed.name_id, "jdoe@example.com");
        assert_eq!(
            processed.name_id_format.as_deref(),
            Some("urn:oasis:names:tc:SAML:1.1:nameid-format:emailAddress")
        );
        assert_eq!(processed.assertion_id, "_assertion42");
        assert_eq!(processed.idp_entity_id, "https://idp.example.com");
        assert_eq!(processed.session_index.as_deref(), Some("_session7"));

        // Values of the same attribute merge across statements, in order.
        assert_eq!(
            processed.attributes["Roles"],
            vec!["Editors", "Readers", "MDDAP-Portal-Admin"]
        );
        assert_eq!(processed.attributes["Email"], vec!["jdoe@example.com"]);
        assert_eq!(processed.attributes["FirstName"], vec!["Jane"]);
        // Attributes without a Name are skipped.
        assert_eq!(processed.attributes.len(), 3);
    }

    #[test]
    fn test_extract_assertion_fallbacks() {
        let mut assertion: Assertion = ASSERTION_XML.parse().unwrap();
        assertion.issuer.value = None;
        assertion.authn_statements = None;
        assertion.attribute_statements = None;

        let processed = extract_assertion(&assertion).unwrap();
        assert_eq!(processed.idp_entity_id, "unknown");
        assert!(processed.session_index.is_none());
        assert!(processed.attributes.is_empty());

        assertion.subject = None;
        let err = extract_assertion(&assertion).unwrap_err();
        assert_eq!(err.to_string(), "SAML assertion missing NameID");
    }

    #[test]
    fn test_idp_metadata_xml() {
        let settings = SamlSettings {
            idp_login_url: "https://idp.example.com/sso?app=forum&x=1".to_string(),
            ..test_settings()
        };
        let xml = idp_metadata_xml(&settings, "MIIB");
        assert!(xml.contains(r#"entityID="https://idp.example.com""#));
        assert!(xml.contains("<ds:X509Certificate>MIIB</ds:X509Certificate>"));
        assert!(xml.contains(r#"Location="https://idp.example.com/sso?app=forum&amp;x=1""#));
        assert!(xml.contains(r#"Location="https://idp.example.com/slo""#));

        let parsed: EntityDescriptor = samael::metadata::de::from_str(&xml).unwrap();
        assert_eq!(parsed.entity_id.as_deref(), Some("https://idp.example.com"));
    }
}
