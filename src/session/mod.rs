//! Local sessions for users logged in through SAML.
//!
//! Persistent storage backed by redb, with in-memory caching, assertion
//! replay prevention and background cleanup.

pub mod cleanup;
pub mod config;
pub mod store;
pub mod types;

pub use cleanup::{spawn_cleanup_task, DEFAULT_CLEANUP_INTERVAL_SECS};
pub use config::SessionConfig;
pub use store::SessionStore;
pub use types::{SamlLogin, Session, SessionId};
