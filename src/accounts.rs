//! Reconciles SAML identities with forum accounts.
//!
//! A subject identifier is linked to a local uid through the `samlid:uid`
//! hash. Unknown subjects are matched by email before a new user is created.

use anyhow::{anyhow, Result};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use crate::forum::{GroupDirectory, NewUser, ObjectStore, UserDirectory};
use crate::saml::{AttributeNames, LogoutSubject, ProcessedAssertion};

/// Hash mapping subject identifier -> uid.
pub const SAMLID_UID_KEY: &str = "samlid:uid";
/// User field holding the subject identifier.
pub const SAMLID_FIELD: &str = "samlid";

const FALLBACK_USERNAME: &str = "saml-user";

/// Reduce multi-valued attributes to their first value.
pub fn normalize_attributes(raw: &HashMap<String, Vec<String>>) -> HashMap<String, String> {
    raw.iter()
        .filter_map(|(name, values)| values.first().map(|v| (name.clone(), v.clone())))
        .collect()
}

/// The identity a validated assertion describes.
#[derive(Debug, Clone, Default)]
pub struct SamlUser {
    /// Stable subject identifier, if the assertion carries one.
    pub saml_id: Option<String>,
    pub email: Option<String>,
    pub first_name: Option<String>,
    pub roles: Vec<String>,
    pub attributes: HashMap<String, String>,
}

impl SamlUser {
    pub fn from_assertion(assertion: &ProcessedAssertion, names: &AttributeNames) -> Self {
        let attributes = normalize_attributes(&assertion.attributes);
        let non_empty = |name: &str| {
            attributes
                .get(name)
                .map(|v| v.trim())
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };

        let email = non_empty(&names.email);
        let first_name = non_empty(&names.first_name);
        let name_id = assertion.name_id.trim();
        let saml_id = non_empty(&names.id)
            .or_else(|| (!name_id.is_empty()).then(|| name_id.to_string()))
            .or_else(|| email.clone());

        let roles = assertion
            .attributes
            .get(&names.roles)
            .map(|values| {
                values
                    .iter()
                    .flat_map(|v| v.split(','))
                    .map(str::trim)
                    .filter(|r| !r.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        Self {
            saml_id,
            email,
            first_name,
            roles,
            attributes,
        }
    }

    /// Username for a new account.
    fn username(&self) -> String {
        if let Some(ref first_name) = self.first_name {
            return first_name.clone();
        }
        self.email
            .as_deref()
            .and_then(|email| email.split('@').next())
            .map(str::trim)
            .filter(|local| !local.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| FALLBACK_USERNAME.to_string())
    }
}

/// Links SAML subjects to forum users and applies role mappings.
pub struct AccountLinker {
    users: Arc<dyn UserDirectory>,
    groups: Arc<dyn GroupDirectory>,
    store: Arc<ObjectStore>,
    /// Held from mapping lookup to mapping write, so concurrent first logins
    /// of one subject create a single account.
    link_lock: Mutex<()>,
}

impl AccountLinker {
    pub fn new(
        users: Arc<dyn UserDirectory>,
        groups: Arc<dyn GroupDirectory>,
        store: Arc<ObjectStore>,
    ) -> Self {
        Self {
            users,
            groups,
            store,
            link_lock: Mutex::new(()),
        }
    }

    /// Resolve the forum uid for a SAML user, creating the account if needed.
    pub fn get_or_create_user(
        &self,
        user: &SamlUser,
        role_map: &BTreeMap<String, String>,
    ) -> Result<u64> {
        let saml_id = user
            .saml_id
            .as_deref()
            .ok_or_else(|| anyhow!("Missing name_id or email in SAML response"))?;

        let uid = {
            let _guard = self
                .link_lock
                .lock()
                .map_err(|_| anyhow!("Account link lock poisoned"))?;
            match self.linked_uid(saml_id)? {
                Some(uid) => {
                    debug!(uid = uid, saml_id = %saml_id, "Found linked account");
                    uid
                }
                None => self.link_account(saml_id, user)?,
            }
        };

        self.apply_roles(uid, &user.roles, role_map);

        Ok(uid)
    }

    /// The uid mapped to a subject, if that user still exists.
    fn linked_uid(&self, saml_id: &str) -> Result<Option<u64>> {
        let Some(value) = self.store.get_object_field(SAMLID_UID_KEY, saml_id)? else {
            return Ok(None);
        };
        match value.parse::<u64>() {
            Ok(uid) if self.users.exists(uid)? => return Ok(Some(uid)),
            Ok(uid) => warn!(uid = uid, saml_id = %saml_id, "Linked user no longer exists, relinking"),
            Err(_) => warn!(saml_id = %saml_id, value = %value, "Ignoring malformed samlid mapping"),
        }
        self.store.delete_object_field(SAMLID_UID_KEY, saml_id)?;
        Ok(None)
    }

    fn link_account(&self, saml_id: &str, user: &SamlUser) -> Result<u64> {
        let existing = match user.email {
            Some(ref email) => self.users.get_uid_by_email(email)?,
            None => None,
        };

        let uid = match existing {
            Some(uid) => {
                info!(uid = uid, saml_id = %saml_id, "Linking existing account by email");
                uid
            }
            None => {
                let uid = self.users.create_user(NewUser {
                    username: user.username(),
                    email: user.email.clone(),
                })?;
                info!(uid = uid, saml_id = %saml_id, "Created account for SAML user");
                uid
            }
        };

        self.users.set_user_field(uid, SAMLID_FIELD, saml_id)?;
        self.store
            .set_object_field(SAMLID_UID_KEY, saml_id, &uid.to_string())?;

        Ok(uid)
    }

    fn apply_roles(&self, uid: u64, roles: &[String], role_map: &BTreeMap<String, String>) {
        let mut groups: Vec<&str> = roles
            .iter()
            .filter_map(|role| role_map.get(role).map(String::as_str))
            .collect();
        groups.sort_unstable();
        groups.dedup();

        for group in groups {
            match self.groups.join(group, uid) {
                Ok(()) => debug!(uid = uid, group = %group, "Applied role mapping"),
                Err(e) => warn!(uid = uid, group = %group, error = %e, "Failed to join mapped group"),
            }
        }
    }

    /// Logout subject for a user; the session index comes from the session.
    pub fn get_user_info(&self, uid: u64) -> Result<Option<LogoutSubject>> {
        Ok(self
            .users
            .get_user_field(uid, SAMLID_FIELD)?
            .filter(|id| !id.is_empty())
            .map(|name_id| LogoutSubject {
                name_id,
                ..Default::default()
            }))
    }
}
