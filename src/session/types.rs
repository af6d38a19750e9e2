//! Local forum sessions established through SAML login.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Upper bound on session lifetime (100 years).
const MAX_TTL_SECS: u64 = 100 * 365 * 24 * 60 * 60;

/// Unique session identifier (16 random bytes, hex-encoded in cookies).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId([u8; 16]);

impl SessionId {
    /// Generate a new random session ID.
    pub fn new() -> Self {
        Self(rand::random())
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse a cookie value. Anything but 32 hex digits is rejected.
    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes: [u8; 16] = hex::decode(s).ok()?.try_into().ok()?;
        Some(Self(bytes))
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// What the IdP told us about the login that created a session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SamlLogin {
    /// Subject identifier used for account linking.
    pub saml_id: String,
    /// NameID value from the assertion subject.
    pub name_id: String,
    /// NameID format, if the IdP sent one.
    pub name_id_format: Option<String>,
    /// SessionIndex from the AuthnStatement (needed for IdP logout).
    pub session_index: Option<String>,
    /// Assertion ID (replay prevention).
    pub assertion_id: String,
    /// Issuer of the assertion.
    pub idp_entity_id: String,
}

/// A logged-in forum session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    /// Local forum user id.
    pub uid: u64,
    pub login: SamlLogin,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
}

impl Session {
    pub fn new(uid: u64, login: SamlLogin, ttl_secs: u64) -> Self {
        let now = Utc::now();
        let ttl = ttl_secs.min(MAX_TTL_SECS) as i64;
        Self {
            id: SessionId::new(),
            uid,
            login,
            created_at: now,
            expires_at: now + Duration::seconds(ttl),
            last_accessed: now,
        }
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }

    pub fn touch(&mut self) {
        self.last_accessed = Utc::now();
    }
}

#[cfg(test)]
pub(crate) fn test_login(assertion_id: &str) -> SamlLogin {
    SamlLogin {
        saml_id: "jdoe".to_string(),
        name_id: "jdoe@example.com".to_string(),
        name_id_format: None,
        session_index: Some("_idx1".to_string()),
        assertion_id: assertion_id.to_string(),
        idp_entity_id: "https://idp.example.com".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_id_hex() {
        let id = SessionId::new();
        assert_eq!(SessionId::from_hex(&id.to_hex()), Some(id));
        assert_eq!(id.to_string().len(), 32);

        assert!(SessionId::from_hex("zz").is_none());
        assert!(SessionId::from_hex("abcd").is_none());
        assert!(SessionId::from_hex("").is_none());
    }

    #[test]
    fn test_session_expiry() {
        let mut session = Session::new(4, test_login("a-1"), 60);
        assert!(!session.is_expired());
        assert!(session.expires_at > session.created_at);

        session.expires_at = Utc::now() - Duration::seconds(1);
        assert!(session.is_expired());
    }

    #[test]
    fn test_huge_ttl_does_not_overflow() {
        let session = Session::new(4, test_login("a-2"), u64::MAX);
        assert!(!session.is_expired());
    }
}
