//! Plugin settings persisted in the forum's generic settings hash.

use anyhow::{anyhow, Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;

use super::store::ObjectStore;

/// Typed access to `settings:<plugin>` hashes.
///
/// Each top-level setting is one hash field holding its JSON encoding, so
/// scalar settings stay readable by other forum tooling.
pub struct SettingsStore {
    store: Arc<ObjectStore>,
}

fn settings_key(plugin: &str) -> String {
    format!("settings:{}", plugin)
}

impl SettingsStore {
    pub fn new(store: Arc<ObjectStore>) -> Self {
        Self { store }
    }

    /// Load the settings of a plugin. Fields absent from the store take the
    /// type's serde defaults.
    pub fn get<T: DeserializeOwned>(&self, plugin: &str) -> Result<T> {
        let fields = self.store.get_object(&settings_key(plugin))?;

        let mut object = serde_json::Map::new();
        for (field, raw) in fields {
            let value = serde_json::from_str(&raw)
                .with_context(|| format!("Setting {}.{} is not valid JSON", plugin, field))?;
            object.insert(field, value);
        }

        serde_json::from_value(serde_json::Value::Object(object))
            .with_context(|| format!("Failed to decode settings for {}", plugin))
    }

    /// Persist the settings of a plugin.
    pub fn set<T: Serialize>(&self, plugin: &str, settings: &T) -> Result<()> {
        let value = serde_json::to_value(settings)
            .with_context(|| format!("Failed to encode settings for {}", plugin))?;
        let object = match value {
            serde_json::Value::Object(object) => object,
            _ => return Err(anyhow!("Settings for {} must be an object", plugin)),
        };

        let mut encoded: Vec<(String, String)> = Vec::with_capacity(object.len());
        for (field, value) in object {
            let raw = serde_json::to_string(&value)?;
            encoded.push((field, raw));
        }
        let fields: Vec<(&str, &str)> = encoded
            .iter()
            .map(|(f, v)| (f.as_str(), v.as_str()))
            .collect();

        self.store.set_object_fields(&settings_key(plugin), &fields)
    }
}
