use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::SettingsError;

pub const FORUM_MOD_VISIBLE: &str = "forum_mod_visible";

const FORUM_MODERATOR_KEYS: [&str; 6] = [
    FORUM_MOD_VISIBLE,
    "forum_mod_edit_posts",
    "forum_mod_delete_posts",
    "forum_mod_close_topics",
    "forum_mod_pin_topics",
    "forum_mod_move_topics",
];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SettingKey {
    pub name: String,
    pub empty_value: Value,
}

/// Recognized setting keys with the empty value returned when a section has
/// no stored entry, plus the key that drives `visible_assignees`.
#[derive(Debug, Clone, PartialEq)]
pub struct SettingKeyRegistry {
    keys: Vec<SettingKey>,
    visibility_key: String,
}

impl SettingKeyRegistry {
    /// Build a registry from an ordered key list.
    ///
    /// # Errors
    /// Returns [`SettingsError::Validation`] when a key name is blank or repeated,
    /// or when `visibility_key` is not one of the registered keys.
    pub fn new(keys: Vec<SettingKey>, visibility_key: &str) -> Result<Self, SettingsError> {
        let mut seen = BTreeSet::new();
        for key in &keys {
            if key.name.trim().is_empty() {
                return Err(SettingsError::Validation(
                    "setting key names MUST be non-empty".to_string(),
                ));
            }
            if !seen.insert(key.name.as_str()) {
                return Err(SettingsError::Validation(format!(
                    "setting key `{}` is registered twice",
                    key.name
                )));
            }
        }

        if !seen.contains(visibility_key) {
            return Err(SettingsError::Validation(format!(
                "visibility key `{visibility_key}` is not a registered setting key"
            )));
        }

        Ok(Self { keys, visibility_key: visibility_key.to_string() })
    }

    /// Keys managed by the forum section moderator store. All of them are
    /// boolean flags with `false` as the empty value.
    #[must_use]
    pub fn forum_moderator_defaults() -> Self {
        Self {
            keys: FORUM_MODERATOR_KEYS
                .iter()
                .map(|name| SettingKey { name: (*name).to_string(), empty_value: Value::Bool(false) })
                .collect(),
            visibility_key: FORUM_MOD_VISIBLE.to_string(),
        }
    }

    #[must_use]
    pub fn keys(&self) -> &[SettingKey] {
        &self.keys
    }

    pub fn names(&self) -> impl Iterator<Item = &str> + '_ {
        self.keys.iter().map(|key| key.name.as_str())
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.keys.iter().any(|key| key.name == name)
    }

    #[must_use]
    pub fn empty_value(&self, name: &str) -> Option<&Value> {
        self.keys.iter().find(|key| key.name == name).map(|key| &key.empty_value)
    }

    #[must_use]
    pub fn visibility_key(&self) -> &str {
        &self.visibility_key
    }
}
