use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use section_settings_core::{
    plan_recompute, ForestSnapshot, ModeratorInfo, SectionId, SectionNode, SectionRepository,
    SettingEntry, SettingKeyRegistry, SettingsError, UserId,
};
use section_settings_store_sqlite::SqliteSectionStore;
use serde::{Deserialize, Serialize};
use serde_json::Value;

mod cache;

pub use cache::ReadCache;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    /// How long a cached section may be served; zero disables caching.
    pub cache_ttl: Duration,
    pub max_conflict_retries: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self { cache_ttl: Duration::from_secs(30), max_conflict_retries: 3 }
    }
}

/// Addressing for one user's settings at one section. Both ids are optional
/// so callers can pass through partially populated requests; every operation
/// that needs them rejects a missing one.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoreParams {
    pub section_id: Option<SectionId>,
    pub user_id: Option<UserId>,
}

impl StoreParams {
    #[must_use]
    pub fn new(section_id: SectionId, user_id: UserId) -> Self {
        Self { section_id: Some(section_id), user_id: Some(user_id) }
    }

    fn require(&self) -> Result<(SectionId, UserId), SettingsError> {
        let section_id = self
            .section_id
            .ok_or_else(|| SettingsError::Validation("section_id is required".to_string()))?;
        let user_id = self
            .user_id
            .ok_or_else(|| SettingsError::Validation("user_id is required".to_string()))?;
        Ok((section_id, user_id))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GetOptions {
    pub skip_cache: bool,
    /// Report whether each value is an own override or an inherited copy.
    pub extended: bool,
}

/// One answered key. `force` marks a value this store actually holds, as
/// opposed to the registry's empty value returned so lower-priority stores
/// can still answer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoreSetting {
    pub value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub own: Option<bool>,
    pub force: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RecomputeReport {
    pub scanned: usize,
    pub updated: Vec<SectionId>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EditView {
    pub settings: BTreeMap<String, StoreSetting>,
    pub parent_settings: Option<BTreeMap<String, StoreSetting>>,
}

/// Per-user section settings store: override reads and writes plus the
/// inheritance maintenance that keeps descendant copies consistent.
pub struct SectionModeratorStore<R> {
    repository: R,
    registry: SettingKeyRegistry,
    config: StoreConfig,
    cache: ReadCache,
}

/// Open (and migrate) a `SQLite` section store with the forum moderator keys.
///
/// # Errors
/// Returns an error when the database cannot be opened or migrated.
pub fn open_sqlite(
    db_path: &Path,
    config: StoreConfig,
) -> Result<SectionModeratorStore<SqliteSectionStore>> {
    let mut repository = SqliteSectionStore::open(db_path)?;
    repository.migrate()?;
    Ok(SectionModeratorStore::new(
        repository,
        SettingKeyRegistry::forum_moderator_defaults(),
        config,
    ))
}

impl<R> SectionModeratorStore<R>
where
    R: SectionRepository,
{
    #[must_use]
    pub fn new(repository: R, registry: SettingKeyRegistry, config: StoreConfig) -> Self {
        let cache = ReadCache::new(config.cache_ttl);
        Self { repository, registry, config, cache }
    }

    #[must_use]
    pub fn repository(&self) -> &R {
        &self.repository
    }

    /// Recognized setting keys with their empty values.
    #[must_use]
    pub fn keys(&self) -> &SettingKeyRegistry {
        &self.registry
    }

    #[must_use]
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Read `keys` for one user at one section.
    ///
    /// # Errors
    /// Returns [`SettingsError::Validation`] for a missing id or unknown key,
    /// [`SettingsError::NotFound`] when the section does not exist, or the
    /// repository error.
    pub fn get(
        &self,
        keys: &[String],
        params: &StoreParams,
        options: GetOptions,
    ) -> Result<BTreeMap<String, StoreSetting>, SettingsError> {
        let (section_id, user_id) = params.require()?;
        self.check_keys(keys.iter().map(String::as_str))?;

        let node = self.load_cached(section_id, options.skip_cache)?;
        Ok(self.answer(&node, user_id, keys, options.extended))
    }

    /// Apply own overrides for one user at one section. `Some` stores the
    /// value as an own entry, `None` removes the entry. Descendants are
    /// recomputed before returning.
    ///
    /// # Errors
    /// Returns [`SettingsError::Validation`] for a missing id or unknown key,
    /// [`SettingsError::NotFound`] when the section does not exist, or the
    /// first repository error hit while saving.
    pub fn set(
        &self,
        values: &BTreeMap<String, Option<Value>>,
        params: &StoreParams,
    ) -> Result<RecomputeReport, SettingsError> {
        let (section_id, user_id) = params.require()?;
        self.check_keys(values.keys().map(String::as_str))?;

        self.with_conflict_retry("set", || {
            let mut node = self.load_fresh(section_id)?;
            let user_settings = node.settings.entry(user_id).or_default();
            for (key, value) in values {
                match value {
                    Some(value) => {
                        user_settings.insert(key.clone(), SettingEntry::own(value.clone()));
                    }
                    None => {
                        user_settings.remove(key);
                    }
                }
            }
            if user_settings.is_empty() {
                node.settings.remove(&user_id);
            }
            self.repository.save(&node)
        })?;
        tracing::debug!(section_id = %section_id, user_id = %user_id, keys = values.len(), "stored setting overrides");

        self.recompute(Some(section_id))
    }

    /// Per-user override counts at one section, read without the cache.
    ///
    /// # Errors
    /// Returns [`SettingsError::NotFound`] when the section does not exist.
    pub fn get_moderators_info(
        &self,
        section_id: SectionId,
    ) -> Result<Vec<ModeratorInfo>, SettingsError> {
        Ok(self.load_fresh(section_id)?.moderator_stats())
    }

    /// Drop every entry of `user_id` at `section_id` and recompute the
    /// subtree. Removing an absent moderator succeeds without writing.
    ///
    /// # Errors
    /// Returns [`SettingsError::NotFound`] when the section does not exist, or
    /// the first repository error hit while saving.
    pub fn remove_moderator(
        &self,
        section_id: SectionId,
        user_id: UserId,
    ) -> Result<RecomputeReport, SettingsError> {
        let removed = self.with_conflict_retry("remove_moderator", || {
            let mut node = self.load_fresh(section_id)?;
            if node.settings.remove(&user_id).is_none() {
                return Ok(false);
            }
            self.repository.save(&node)?;
            Ok(true)
        })?;

        if !removed {
            return Ok(RecomputeReport::default());
        }
        tracing::debug!(section_id = %section_id, user_id = %user_id, "removed section moderator");
        self.recompute(Some(section_id))
    }

    /// Drop `user_id` from every section, saving each section on its own.
    /// Inheritance is not recomputed afterwards; [`Self::verify`] reports the
    /// sections left inconsistent.
    ///
    /// # Errors
    /// Returns the first repository error; sections saved before it keep the
    /// removal.
    pub fn remove_user(&self, user_id: UserId) -> Result<Vec<SectionId>, SettingsError> {
        let holders = self
            .repository
            .fetch_all()?
            .into_iter()
            .filter(|node| node.settings.contains_key(&user_id))
            .map(|node| node.id)
            .collect::<Vec<_>>();

        let mut touched = Vec::with_capacity(holders.len());
        for section_id in holders {
            let saved = self.with_conflict_retry("remove_user", || {
                let Some(mut node) = self.repository.fetch_by_id(section_id)? else {
                    return Ok(false);
                };
                if node.settings.remove(&user_id).is_none() {
                    return Ok(false);
                }
                self.repository.save(&node)?;
                Ok(true)
            })?;
            if saved {
                touched.push(section_id);
            }
        }

        tracing::info!(user_id = %user_id, sections = touched.len(), "removed user from forum sections");
        Ok(touched)
    }

    /// Rebuild inherited entries and visible assignees for `scope` and its
    /// descendants, or for the whole forest.
    ///
    /// # Errors
    /// Returns [`SettingsError::NotFound`] for an unknown scope,
    /// [`SettingsError::DataIntegrity`] on a parent cycle, or the first save
    /// error. Sections saved before a failure stay saved.
    pub fn recompute(&self, scope: Option<SectionId>) -> Result<RecomputeReport, SettingsError> {
        self.with_conflict_retry("recompute", || self.recompute_once(scope))
    }

    /// Sections whose stored inherited state differs from what a whole-forest
    /// recompute would write. Nothing is saved.
    ///
    /// # Errors
    /// Returns the repository error or [`SettingsError::DataIntegrity`].
    pub fn verify(&self) -> Result<Vec<SectionId>, SettingsError> {
        let snapshot = ForestSnapshot::load(&self.repository)?;
        Ok(plan_recompute(&snapshot, None, &self.registry)?.changed_ids())
    }

    /// Every registered key for `user_id` at `section_id` and at its parent,
    /// read fresh with own/inherited flags.
    ///
    /// # Errors
    /// Returns [`SettingsError::NotFound`] when the section does not exist.
    pub fn edit_view(
        &self,
        section_id: SectionId,
        user_id: UserId,
    ) -> Result<EditView, SettingsError> {
        let keys = self.registry.names().map(str::to_string).collect::<Vec<_>>();
        let node = self.load_fresh(section_id)?;
        let settings = self.answer(&node, user_id, &keys, true);

        let parent_settings = match node.parent {
            Some(parent_id) => self
                .repository
                .fetch_by_id(parent_id)?
                .map(|parent| self.answer(&parent, user_id, &keys, true)),
            None => None,
        };

        Ok(EditView { settings, parent_settings })
    }

    fn recompute_once(&self, scope: Option<SectionId>) -> Result<RecomputeReport, SettingsError> {
        let snapshot = ForestSnapshot::load(&self.repository)?;
        let plan = plan_recompute(&snapshot, scope, &self.registry)?;

        let mut updated = Vec::with_capacity(plan.changed.len());
        for node in &plan.changed {
            let revision = self.repository.save(node)?;
            tracing::debug!(section_id = %node.id, revision, "saved recomputed section");
            updated.push(node.id);
        }

        tracing::info!(
            scope = ?scope.map(|id| id.to_string()),
            scanned = plan.scanned,
            updated = updated.len(),
            "recomputed inherited section settings"
        );
        Ok(RecomputeReport { scanned: plan.scanned, updated })
    }

    fn with_conflict_retry<T, F>(&self, operation: &str, mut attempt: F) -> Result<T, SettingsError>
    where
        F: FnMut() -> Result<T, SettingsError>,
    {
        let mut retries = 0_usize;
        loop {
            match attempt() {
                Err(err) if err.is_conflict() && retries < self.config.max_conflict_retries => {
                    retries += 1;
                    tracing::warn!(operation, retries, error = %err, "retrying after concurrent section update");
                }
                outcome => return outcome,
            }
        }
    }

    fn check_keys<'a>(&self, keys: impl IntoIterator<Item = &'a str>) -> Result<(), SettingsError> {
        for key in keys {
            if !self.registry.contains(key) {
                return Err(SettingsError::Validation(format!("unknown setting key {key}")));
            }
        }
        Ok(())
    }

    fn load_cached(
        &self,
        section_id: SectionId,
        skip_cache: bool,
    ) -> Result<Arc<SectionNode>, SettingsError> {
        self.cache
            .get_or_fetch(section_id, skip_cache, || self.repository.fetch_by_id(section_id))?
            .ok_or(SettingsError::NotFound(section_id))
    }

    fn load_fresh(&self, section_id: SectionId) -> Result<SectionNode, SettingsError> {
        self.repository.fetch_by_id(section_id)?.ok_or(SettingsError::NotFound(section_id))
    }

    fn answer(
        &self,
        node: &SectionNode,
        user_id: UserId,
        keys: &[String],
        extended: bool,
    ) -> BTreeMap<String, StoreSetting> {
        keys.iter()
            .map(|key| {
                let setting = match node.entry(user_id, key) {
                    Some(entry) => StoreSetting {
                        value: entry.value.clone(),
                        own: extended.then_some(entry.own),
                        force: true,
                    },
                    None => StoreSetting {
                        value: self.registry.empty_value(key).cloned().unwrap_or(Value::Null),
                        own: None,
                        force: false,
                    },
                };
                (key.clone(), setting)
            })
            .collect()
    }
}
