//! Forum user accounts.

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info};

use super::groups::{GroupDirectory, REGISTERED_USERS_GROUP};
use super::store::ObjectStore;

/// Hash mapping lowercase email -> uid.
const EMAIL_UID_KEY: &str = "email:uid";
/// Hash mapping username -> uid.
const USERNAME_UID_KEY: &str = "username:uid";
/// Hash holding global counters.
const GLOBAL_KEY: &str = "global";
/// Scored set of uids by join date.
const USERS_JOINDATE_KEY: &str = "users:joindate";

/// Data for a user created through SSO.
#[derive(Debug, Clone, Default)]
pub struct NewUser {
    pub username: String,
    pub email: Option<String>,
}

/// User operations the SSO integration needs from the forum.
pub trait UserDirectory: Send + Sync {
    /// Resolve a uid from an email address (case-insensitive).
    fn get_uid_by_email(&self, email: &str) -> Result<Option<u64>>;

    /// Create a user and return its uid.
    fn create_user(&self, user: NewUser) -> Result<u64>;

    /// Check whether a user exists.
    fn exists(&self, uid: u64) -> Result<bool>;

    /// Set a field on the user object.
    fn set_user_field(&self, uid: u64, field: &str, value: &str) -> Result<()>;

    /// Read a field from the user object.
    fn get_user_field(&self, uid: u64, field: &str) -> Result<Option<String>>;
}

fn user_key(uid: u64) -> String {
    format!("user:{}", uid)
}

/// Slugify a username the way the forum does for profile URLs.
pub fn slugify(username: &str) -> String {
    let mut slug = String::with_capacity(username.len());
    let mut last_dash = false;
    for c in username.trim().chars() {
        if c.is_alphanumeric() {
            slug.extend(c.to_lowercase());
            last_dash = false;
        } else if !last_dash && !slug.is_empty() {
            slug.push('-');
            last_dash = true;
        }
    }
    slug.trim_end_matches('-').to_string()
}

/// User directory backed by the forum object store.
pub struct ForumUsers {
    store: Arc<ObjectStore>,
    groups: Arc<dyn GroupDirectory>,
}

impl ForumUsers {
    pub fn new(store: Arc<ObjectStore>, groups: Arc<dyn GroupDirectory>) -> Self {
        Self { store, groups }
    }

    /// Find a free username by appending an increasing suffix.
    fn unique_username(&self, base: &str) -> Result<String> {
        let base = base.trim();
        if self.store.get_object_field(USERNAME_UID_KEY, base)?.is_none() {
            return Ok(base.to_string());
        }

        let mut suffix: u64 = 1;
        loop {
            let candidate = format!("{} {}", base, suffix);
            if self
                .store
                .get_object_field(USERNAME_UID_KEY, &candidate)?
                .is_none()
            {
                return Ok(candidate);
            }
            suffix += 1;
        }
    }
}

impl UserDirectory for ForumUsers {
    fn get_uid_by_email(&self, email: &str) -> Result<Option<u64>> {
        let email = email.trim().to_lowercase();
        if email.is_empty() {
            return Ok(None);
        }

        self.store
            .get_object_field(EMAIL_UID_KEY, &email)?
            .map(|uid| {
                uid.parse::<u64>()
                    .with_context(|| format!("Invalid uid stored for email {}", email))
            })
            .transpose()
    }

    fn create_user(&self, user: NewUser) -> Result<u64> {
        if user.username.trim().is_empty() {
            return Err(anyhow!("Username is required"));
        }

        let email = user
            .email
            .as_deref()
            .map(|e| e.trim().to_lowercase())
            .filter(|e| !e.is_empty());

        if let Some(ref email) = email {
            if self.store.get_object_field(EMAIL_UID_KEY, email)?.is_some() {
                return Err(anyhow!("Email '{}' is already taken", email));
            }
        }

        let username = self.unique_username(&user.username)?;
        let userslug = slugify(&username);
        let uid = u64::try_from(self.store.increment_object_field(GLOBAL_KEY, "nextUid")?)
            .context("uid counter went negative")?;
        let uid_str = uid.to_string();
        let joindate = Utc::now().timestamp_millis();
        let joindate_str = joindate.to_string();

        let mut fields = vec![
            ("uid", uid_str.as_str()),
            ("username", username.as_str()),
            ("userslug", userslug.as_str()),
            ("joindate", joindate_str.as_str()),
        ];
        if let Some(ref email) = email {
            fields.push(("email", email.as_str()));
        }

        self.store.set_object_fields(&user_key(uid), &fields)?;
        self.store
            .set_object_field(USERNAME_UID_KEY, &username, &uid_str)?;
        if let Some(ref email) = email {
            self.store.set_object_field(EMAIL_UID_KEY, email, &uid_str)?;
        }
        self.store
            .sorted_set_add(USERS_JOINDATE_KEY, joindate, &uid_str)?;
        self.groups.join(REGISTERED_USERS_GROUP, uid)?;

        info!(uid = uid, username = %username, "Created forum user");
        Ok(uid)
    }

    fn exists(&self, uid: u64) -> Result<bool> {
        self.store.exists(&user_key(uid))
    }

    fn set_user_field(&self, uid: u64, field: &str, value: &str) -> Result<()> {
        debug!(uid = uid, field = field, "Setting user field");
        self.store.set_object_field(&user_key(uid), field, value)
    }

    fn get_user_field(&self, uid: u64, field: &str) -> Result<Option<String>> {
        self.store.get_object_field(&user_key(uid), field)
    }
}
