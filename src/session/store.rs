//! Session store backed by redb embedded database.
//!
//! Sessions are persisted as MessagePack records and mirrored in an
//! in-memory cache. Consumed assertion IDs are remembered until the session
//! they created would have expired, so a captured SAMLResponse cannot be
//! posted twice.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use redb::{Database, ReadableTable, ReadableTableMetadata, TableDefinition};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::RwLock;
use tracing::{debug, warn};

use super::types::{Session, SessionId};

/// Sessions (key: session id hex, value: MessagePack session).
const SESSIONS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("sso_sessions");

/// Consumed assertion IDs (key: assertion id, value: MessagePack expiry).
const ASSERTIONS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("sso_assertions");

const MAX_CACHE_SIZE: usize = 10_000;

pub struct SessionStore {
    db: Database,
    cache: RwLock<HashMap<SessionId, Session>>,
    ttl_secs: u64,
}

impl SessionStore {
    /// Open or create a session store at the given path.
    pub fn open(path: PathBuf, ttl_secs: u64) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {:?}", parent))?;
        }

        let db = Database::create(&path)
            .with_context(|| format!("Failed to open session database: {:?}", path))?;

        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(SESSIONS_TABLE)?;
            let _ = write_txn.open_table(ASSERTIONS_TABLE)?;
        }
        write_txn.commit()?;

        let cache = Self::load_active_sessions(&db)?;
        debug!(sessions = cache.len(), "Loaded active sessions into cache");

        Ok(Self {
            db,
            cache: RwLock::new(cache),
            ttl_secs,
        })
    }

    /// Lifetime given to new sessions.
    pub fn ttl_secs(&self) -> u64 {
        self.ttl_secs
    }

    /// Store a new session, consuming its assertion ID.
    pub fn create(&self, session: Session) -> Result<SessionId> {
        let id = session.id;
        let assertion_id = session.login.assertion_id.as_str();
        let data = rmp_serde::to_vec(&session).context("Failed to serialize session")?;
        let consumed_until =
            rmp_serde::to_vec(&session.expires_at).context("Failed to serialize expiry")?;

        // The replay check and both inserts share one write transaction.
        let write_txn = self.db.begin_write()?;
        {
            let mut assertions = write_txn.open_table(ASSERTIONS_TABLE)?;
            if assertions.get(assertion_id)?.is_some() {
                bail!("SAML assertion replay detected: {}", assertion_id);
            }
            assertions.insert(assertion_id, consumed_until.as_slice())?;

            let mut sessions = write_txn.open_table(SESSIONS_TABLE)?;
            sessions.insert(id.to_hex().as_str(), data.as_slice())?;
        }
        write_txn.commit()?;

        if let Ok(mut cache) = self.cache.write() {
            if cache.len() >= MAX_CACHE_SIZE {
                evict_least_recent(&mut cache);
            }
            cache.insert(id, session);
        }

        Ok(id)
    }

    /// Look up a live session, refreshing its last access time.
    pub fn get(&self, id: SessionId) -> Result<Option<Session>> {
        let cached = match self.cache.write() {
            Ok(mut cache) => match cache.get_mut(&id) {
                Some(session) if session.is_expired() => {
                    cache.remove(&id);
                    return Ok(None);
                }
                Some(session) => {
                    session.touch();
                    Some(session.clone())
                }
                None => None,
            },
            Err(_) => None,
        };

        let session = match cached {
            Some(session) => session,
            None => {
                let stored = {
                    let read_txn = self.db.begin_read()?;
                    let table = read_txn.open_table(SESSIONS_TABLE)?;
                    let key = id.to_hex();
                    match table.get(key.as_str())? {
                        Some(value) => Some(
                            rmp_serde::from_slice::<Session>(value.value())
                                .context("Failed to deserialize session")?,
                        ),
                        None => None,
                    }
                };

                let Some(mut session) = stored else {
                    return Ok(None);
                };
                if session.is_expired() {
                    return Ok(None);
                }
                session.touch();
                if let Ok(mut cache) = self.cache.write() {
                    cache.insert(id, session.clone());
                }
                session
            }
        };

        if let Err(e) = self.persist(&session) {
            warn!(session_id = %id, error = %e, "Failed to persist session access time");
        }

        Ok(Some(session))
    }

    /// Delete a session. Returns whether it existed.
    pub fn delete(&self, id: SessionId) -> Result<bool> {
        if let Ok(mut cache) = self.cache.write() {
            cache.remove(&id);
        }

        let write_txn = self.db.begin_write()?;
        let removed = {
            let mut table = write_txn.open_table(SESSIONS_TABLE)?;
            let key = id.to_hex();
            let result = table.remove(key.as_str())?;
            result.is_some()
        };
        write_txn.commit()?;

        Ok(removed)
    }

    /// Check whether an assertion ID has already been consumed.
    pub fn is_assertion_used(&self, assertion_id: &str) -> Result<bool> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(ASSERTIONS_TABLE)?;
        Ok(table.get(assertion_id)?.is_some())
    }

    /// Remove expired sessions and assertion records.
    /// Returns the number of sessions removed.
    pub fn evict_expired(&self) -> Result<usize> {
        let now = Utc::now();

        if let Ok(mut cache) = self.cache.write() {
            cache.retain(|_, session| !session.is_expired());
        }

        let write_txn = self.db.begin_write()?;
        let evicted = {
            let mut sessions = write_txn.open_table(SESSIONS_TABLE)?;
            let mut expired: Vec<String> = Vec::new();
            for entry in sessions.iter()? {
                let (key, value) = entry?;
                match rmp_serde::from_slice::<Session>(value.value()) {
                    Ok(session) if session.is_expired() => expired.push(key.value().to_string()),
                    Ok(_) => {}
                    Err(e) => {
                        warn!(key = key.value(), error = %e, "Dropping undecodable session");
                        expired.push(key.value().to_string());
                    }
                }
            }
            for key in &expired {
                sessions.remove(key.as_str())?;
            }

            let mut assertions = write_txn.open_table(ASSERTIONS_TABLE)?;
            let mut stale: Vec<String> = Vec::new();
            for entry in assertions.iter()? {
                let (key, value) = entry?;
                match rmp_serde::from_slice::<DateTime<Utc>>(value.value()) {
                    Ok(until) if until >= now => {}
                    _ => stale.push(key.value().to_string()),
                }
            }
            for key in &stale {
                assertions.remove(key.as_str())?;
            }

            expired.len()
        };
        write_txn.commit()?;

        Ok(evicted)
    }

    /// Number of stored sessions, expired ones included until eviction.
    pub fn session_count(&self) -> Result<usize> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(SESSIONS_TABLE)?;
        Ok(table.len()? as usize)
    }

    fn persist(&self, session: &Session) -> Result<()> {
        let data = rmp_serde::to_vec(session).context("Failed to serialize session")?;
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(SESSIONS_TABLE)?;
            table.insert(session.id.to_hex().as_str(), data.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn load_active_sessions(db: &Database) -> Result<HashMap<SessionId, Session>> {
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(SESSIONS_TABLE)?;

        let mut sessions = HashMap::new();
        for entry in table.iter()? {
            let (_, value) = entry?;
            if let Ok(session) = rmp_serde::from_slice::<Session>(value.value()) {
                if !session.is_expired() {
                    sessions.insert(session.id, session);
                }
            }
        }
        Ok(sessions)
    }
}

fn evict_least_recent(cache: &mut HashMap<SessionId, Session>) {
    if let Some(oldest) = cache
        .iter()
        .min_by_key(|(_, s)| s.last_accessed)
        .map(|(id, _)| *id)
    {
        cache.remove(&oldest);
    }
}

#[cfg(test)]
pub(crate) fn test_store() -> (SessionStore, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let store = SessionStore::open(dir.path().join("sessions.redb"), 3600).unwrap();
    (store, dir)
}
