//! Generic object store backed by redb embedded database.
//!
//! Mirrors the forum's key/value database API:
//! - hashes addressed by `(key, field)`
//! - scored sets addressed by `(key, member)`
//!
//! Composite keys are stored as `key\0field`, so a prefix range scan over
//! `key\0` yields every field of one object.

use anyhow::{anyhow, Context, Result};
use redb::{Database, ReadableTable, TableDefinition};
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::debug;

/// redb table for hash fields (key: `key\0field`, value: field value).
const OBJECTS_TABLE: TableDefinition<&str, &str> = TableDefinition::new("objects");

/// redb table for scored set members (key: `key\0member`, value: score).
const SORTED_SETS_TABLE: TableDefinition<&str, i64> = TableDefinition::new("sorted_sets");

const SEPARATOR: char = '\0';

fn composite_key(key: &str, field: &str) -> String {
    format!("{}{}{}", key, SEPARATOR, field)
}

fn key_prefix(key: &str) -> String {
    format!("{}{}", key, SEPARATOR)
}

/// Persistent key/field store shared by users, groups, settings and the
/// SAML id mapping.
pub struct ObjectStore {
    db: Database,
}

impl ObjectStore {
    /// Open or create an object store at the given path.
    pub fn open(path: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {:?}", parent))?;
        }

        let db = Database::create(&path)
            .with_context(|| format!("Failed to open forum database: {:?}", path))?;

        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(OBJECTS_TABLE)?;
            let _ = write_txn.open_table(SORTED_SETS_TABLE)?;
        }
        write_txn.commit()?;

        debug!(path = ?path, "Opened forum object store");

        Ok(Self { db })
    }

    /// Read a single field of a hash.
    pub fn get_object_field(&self, key: &str, field: &str) -> Result<Option<String>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(OBJECTS_TABLE)?;
        let value = table
            .get(composite_key(key, field).as_str())?
            .map(|v| v.value().to_string());
        Ok(value)
    }

    /// Write a single field of a hash.
    pub fn set_object_field(&self, key: &str, field: &str, value: &str) -> Result<()> {
        self.set_object_fields(key, &[(field, value)])
    }

    /// Write several fields of a hash in one transaction.
    pub fn set_object_fields(&self, key: &str, fields: &[(&str, &str)]) -> Result<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(OBJECTS_TABLE)?;
            for (field, value) in fields {
                table.insert(composite_key(key, field).as_str(), *value)?;
            }
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Read every field of a hash. Missing objects read as empty.
    pub fn get_object(&self, key: &str) -> Result<HashMap<String, String>> {
        let prefix = key_prefix(key);
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(OBJECTS_TABLE)?;

        let mut object = HashMap::new();
        for entry in table.range(prefix.as_str()..)? {
            let (k, v) = entry?;
            let Some(field) = k.value().strip_prefix(prefix.as_str()) else {
                break;
            };
            object.insert(field.to_string(), v.value().to_string());
        }
        Ok(object)
    }

    /// Check whether a hash has at least one field.
    pub fn exists(&self, key: &str) -> Result<bool> {
        let prefix = key_prefix(key);
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(OBJECTS_TABLE)?;
        let first = table.range(prefix.as_str()..)?.next();
        match first {
            Some(entry) => {
                let (k, _) = entry?;
                Ok(k.value().starts_with(prefix.as_str()))
            }
            None => Ok(false),
        }
    }

    /// Remove a single field of a hash. Returns whether it existed.
    pub fn delete_object_field(&self, key: &str, field: &str) -> Result<bool> {
        let write_txn = self.db.begin_write()?;
        let removed = {
            let mut table = write_txn.open_table(OBJECTS_TABLE)?;
            let result = table.remove(composite_key(key, field).as_str())?;
            result.is_some()
        };
        write_txn.commit()?;
        Ok(removed)
    }

    /// Atomically increment an integer field, returning the new value.
    /// A missing field counts as zero.
    pub fn increment_object_field(&self, key: &str, field: &str) -> Result<i64> {
        let ck = composite_key(key, field);
        let write_txn = self.db.begin_write()?;
        let next = {
            let mut table = write_txn.open_table(OBJECTS_TABLE)?;
            let current = match table.get(ck.as_str())? {
                Some(v) => v
                    .value()
                    .parse::<i64>()
                    .map_err(|_| anyhow!("Field {}.{} is not an integer", key, field))?,
                None => 0,
            };
            let next = current + 1;
            table.insert(ck.as_str(), next.to_string().as_str())?;
            next
        };
        write_txn.commit()?;
        Ok(next)
    }

    /// Add a member to a scored set, replacing its score if present.
    pub fn sorted_set_add(&self, key: &str, score: i64, member: &str) -> Result<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(SORTED_SETS_TABLE)?;
            table.insert(composite_key(key, member).as_str(), score)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Check membership of a scored set.
    pub fn is_sorted_set_member(&self, key: &str, member: &str) -> Result<bool> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(SORTED_SETS_TABLE)?;
        Ok(table.get(composite_key(key, member).as_str())?.is_some())
    }

    /// List members of a scored set ordered by ascending score.
    pub fn sorted_set_members(&self, key: &str) -> Result<Vec<String>> {
        let prefix = key_prefix(key);
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(SORTED_SETS_TABLE)?;

        let mut members: Vec<(i64, String)> = Vec::new();
        for entry in table.range(prefix.as_str()..)? {
            let (k, v) = entry?;
            let Some(member) = k.value().strip_prefix(prefix.as_str()) else {
                break;
            };
            members.push((v.value(), member.to_string()));
        }
        members.sort();
        Ok(members.into_iter().map(|(_, m)| m).collect())
    }
}

#[cfg(test)]
pub(crate) fn test_store() -> (ObjectStore, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let store = ObjectStore::open(dir.path().join("forum.redb")).unwrap();
    (store, dir)
}
