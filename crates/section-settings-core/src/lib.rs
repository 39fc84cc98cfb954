use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use ulid::Ulid;

mod recompute;
mod registry;
mod repository;
mod resolver;
mod snapshot;

pub use recompute::{plan_recompute, RecomputePlan};
pub use registry::{SettingKey, SettingKeyRegistry, FORUM_MOD_VISIBLE};
pub use repository::{MemorySectionRepository, SectionRepository};
pub use resolver::{candidate_users, resolve};
pub use snapshot::ForestSnapshot;

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("forum section {0} does not exist")]
    NotFound(SectionId),
    #[error("data integrity error: {0}")]
    DataIntegrity(String),
    #[error("section {section_id} was modified concurrently (expected revision {expected_revision})")]
    Conflict { section_id: SectionId, expected_revision: u64 },
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl SettingsError {
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct SectionId(pub Ulid);

impl SectionId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for SectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for SectionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for SectionId {
    type Err = SettingsError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Ulid::from_string(value)
            .map(Self)
            .map_err(|err| SettingsError::Validation(format!("invalid section id {value}: {err}")))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct UserId(pub Ulid);

impl UserId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for UserId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for UserId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for UserId {
    type Err = SettingsError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Ulid::from_string(value)
            .map(Self)
            .map_err(|err| SettingsError::Validation(format!("invalid user id {value}: {err}")))
    }
}

/// One stored setting value. `own` marks an override set directly on the
/// section; otherwise the value is a copy of the nearest ancestor override.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SettingEntry {
    pub value: Value,
    pub own: bool,
}

impl SettingEntry {
    #[must_use]
    pub fn own(value: Value) -> Self {
        Self { value, own: true }
    }

    #[must_use]
    pub fn inherited(value: Value) -> Self {
        Self { value, own: false }
    }
}

pub type UserSettings = BTreeMap<String, SettingEntry>;
pub type SectionSettings = BTreeMap<UserId, UserSettings>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SectionNode {
    pub id: SectionId,
    pub parent: Option<SectionId>,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub settings: SectionSettings,
    #[serde(default)]
    pub visible_assignees: Vec<UserId>,
    #[serde(default)]
    pub revision: u64,
}

impl SectionNode {
    #[must_use]
    pub fn new(id: SectionId, parent: Option<SectionId>, title: impl Into<String>) -> Self {
        Self {
            id,
            parent,
            title: title.into(),
            settings: SectionSettings::new(),
            visible_assignees: Vec::new(),
            revision: 0,
        }
    }

    #[must_use]
    pub fn entry(&self, user_id: UserId, key: &str) -> Option<&SettingEntry> {
        self.settings.get(&user_id).and_then(|user_settings| user_settings.get(key))
    }

    #[must_use]
    pub fn own_entry(&self, user_id: UserId, key: &str) -> Option<&SettingEntry> {
        self.entry(user_id, key).filter(|entry| entry.own)
    }

    /// Per-user own/inherited counts, sorted by the user id string form.
    #[must_use]
    pub fn moderator_stats(&self) -> Vec<ModeratorInfo> {
        let mut stats = self
            .settings
            .iter()
            .map(|(user_id, user_settings)| {
                let own_count = user_settings.values().filter(|entry| entry.own).count();
                ModeratorInfo {
                    user_id: *user_id,
                    own_count,
                    inherited_count: user_settings.len() - own_count,
                }
            })
            .collect::<Vec<_>>();
        stats.sort_by_key(|info| info.user_id.to_string());
        stats
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ModeratorInfo {
    pub user_id: UserId,
    pub own_count: usize,
    pub inherited_count: usize,
}

/// Loose truthiness used for the visibility key: `null`, `false`, `0` and
/// `""` are falsy, everything else is truthy.
#[must_use]
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(flag) => *flag,
        Value::Number(number) => number.as_f64().is_some_and(|n| n != 0.0 && !n.is_nan()),
        Value::String(text) => !text.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Users whose stored value for `visibility_key` is truthy, in user id order.
#[must_use]
pub fn visible_assignees(settings: &SectionSettings, visibility_key: &str) -> Vec<UserId> {
    settings
        .iter()
        .filter(|(_, user_settings)| {
            user_settings.get(visibility_key).is_some_and(|entry| is_truthy(&entry.value))
        })
        .map(|(user_id, _)| *user_id)
        .collect()
}
