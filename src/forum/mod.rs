//! Forum host collaborators.
//!
//! The SSO integration only needs a narrow slice of the forum: a generic
//! key/field store, user lookup/creation, group membership and plugin
//! settings. They are backed here by a redb database so the service can run
//! standalone.

pub mod groups;
pub mod settings;
pub mod store;
pub mod users;

pub use groups::{ForumGroups, GroupDirectory, ADMINISTRATORS_GROUP};
pub use settings::SettingsStore;
pub use store::ObjectStore;
pub use users::{ForumUsers, NewUser, UserDirectory};
