//! Session cookie configuration.

use serde::{Deserialize, Serialize};

/// How the session cookie is issued and read.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Cookie name for the session ID.
    #[serde(default = "default_cookie_name")]
    pub cookie_name: String,

    /// Cookie domain (optional, defaults to request host).
    #[serde(default)]
    pub cookie_domain: Option<String>,

    #[serde(default = "default_cookie_path")]
    pub cookie_path: String,

    /// Require HTTPS for cookies (Secure flag).
    #[serde(default = "default_true")]
    pub cookie_secure: bool,

    #[serde(default = "default_true")]
    pub cookie_http_only: bool,

    /// Lax is required: the IdP posts the assertion cross-site.
    #[serde(default = "default_same_site")]
    pub cookie_same_site: String,

    /// Session lifetime in seconds (default: 14 days).
    #[serde(default = "default_ttl")]
    pub ttl_secs: u64,
}

fn default_cookie_name() -> String {
    "forum_sso_session".to_string()
}

fn default_cookie_path() -> String {
    "/".to_string()
}

fn default_true() -> bool {
    true
}

fn default_same_site() -> String {
    "Lax".to_string()
}

fn default_ttl() -> u64 {
    14 * 24 * 60 * 60
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            cookie_name: default_cookie_name(),
            cookie_domain: None,
            cookie_path: default_cookie_path(),
            cookie_secure: true,
            cookie_http_only: true,
            cookie_same_site: default_same_site(),
            ttl_secs: default_ttl(),
        }
    }
}

impl SessionConfig {
    /// Build the `Set-Cookie` value for a new session.
    pub fn build_cookie(&self, session_id: &str) -> String {
        self.cookie_with(session_id, self.ttl_secs)
    }

    /// Build a `Set-Cookie` value that removes the session cookie.
    pub fn clear_cookie(&self) -> String {
        self.cookie_with("", 0)
    }

    fn cookie_with(&self, value: &str, max_age: u64) -> String {
        let mut cookie = format!("{}={}", self.cookie_name, value);

        if let Some(ref domain) = self.cookie_domain {
            cookie.push_str(&format!("; Domain={}", domain));
        }
        cookie.push_str(&format!("; Path={}", self.cookie_path));
        if self.cookie_secure {
            cookie.push_str("; Secure");
        }
        if self.cookie_http_only {
            cookie.push_str("; HttpOnly");
        }
        cookie.push_str(&format!("; SameSite={}", self.cookie_same_site));
        cookie.push_str(&format!("; Max-Age={}", max_age));

        cookie
    }

    /// Extract the session ID from a `Cookie` header.
    pub fn parse_session_cookie(&self, cookie_header: &str) -> Option<String> {
        let prefix = format!("{}=", self.cookie_name);
        cookie_header
            .split(';')
            .map(str::trim)
            .find_map(|part| part.strip_prefix(prefix.as_str()))
            .filter(|value| !value.is_empty())
            .map(str::to_string)
    }
}
