//! Forum groups and memberships.

use anyhow::{anyhow, Result};
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info};

use super::store::ObjectStore;

/// Group whose members administer the forum.
pub const ADMINISTRATORS_GROUP: &str = "administrators";
/// Group every account joins on creation.
pub const REGISTERED_USERS_GROUP: &str = "registered-users";

/// Group operations the SSO integration needs from the forum.
pub trait GroupDirectory: Send + Sync {
    /// Check whether a group exists.
    fn exists(&self, name: &str) -> Result<bool>;

    /// Add a user to an existing group. Joining twice is a no-op.
    fn join(&self, name: &str, uid: u64) -> Result<()>;

    /// Check group membership.
    fn is_member(&self, name: &str, uid: u64) -> Result<bool>;
}

fn group_key(name: &str) -> String {
    format!("group:{}", name)
}

fn members_key(name: &str) -> String {
    format!("group:{}:members", name)
}

/// Group directory backed by the forum object store.
pub struct ForumGroups {
    store: Arc<ObjectStore>,
}

impl ForumGroups {
    pub fn new(store: Arc<ObjectStore>) -> Self {
        Self { store }
    }

    /// Create a group if it does not exist yet. Returns whether it was created.
    pub fn create_group(&self, name: &str, system: bool) -> Result<bool> {
        if name.trim().is_empty() {
            return Err(anyhow!("Group name is required"));
        }
        if self.exists(name)? {
            return Ok(false);
        }

        let created = Utc::now().timestamp_millis().to_string();
        self.store.set_object_fields(
            &group_key(name),
            &[
                ("name", name),
                ("createtime", created.as_str()),
                ("system", if system { "1" } else { "0" }),
                ("memberCount", "0"),
            ],
        )?;

        info!(group = %name, "Created forum group");
        Ok(true)
    }

    /// Create the groups the forum always has.
    pub fn ensure_system_groups(&self) -> Result<()> {
        self.create_group(ADMINISTRATORS_GROUP, true)?;
        self.create_group(REGISTERED_USERS_GROUP, true)?;
        Ok(())
    }

    /// List member uids in join order.
    pub fn members(&self, name: &str) -> Result<Vec<u64>> {
        Ok(self
            .store
            .sorted_set_members(&members_key(name))?
            .iter()
            .filter_map(|uid| uid.parse().ok())
            .collect())
    }
}

impl GroupDirectory for ForumGroups {
    fn exists(&self, name: &str) -> Result<bool> {
        self.store.exists(&group_key(name))
    }

    fn join(&self, name: &str, uid: u64) -> Result<()> {
        if !self.exists(name)? {
            return Err(anyhow!("Group '{}' does not exist", name));
        }

        let uid_str = uid.to_string();
        let key = members_key(name);
        if self.store.is_sorted_set_member(&key, &uid_str)? {
            debug!(group = %name, uid = uid, "User already a group member");
            return Ok(());
        }

        self.store
            .sorted_set_add(&key, Utc::now().timestamp_millis(), &uid_str)?;
        self.store
            .increment_object_field(&group_key(name), "memberCount")?;
        Ok(())
    }

    fn is_member(&self, name: &str, uid: u64) -> Result<bool> {
        self.store
            .is_sorted_set_member(&members_key(name), &uid.to_string())
    }
}
