use std::collections::BTreeMap;

use anyhow::anyhow;
use parking_lot::Mutex;

use crate::{SectionId, SectionNode, SettingsError};

/// Document-style persistence for section nodes.
///
/// `save` is a whole-document overwrite guarded by the node revision: it only
/// succeeds while the stored revision still equals `node.revision`, and
/// returns the revision now stored.
pub trait SectionRepository {
    /// # Errors
    /// Returns [`SettingsError::Storage`] when the lookup fails.
    fn fetch_by_id(&self, id: SectionId) -> Result<Option<SectionNode>, SettingsError>;

    /// # Errors
    /// Returns [`SettingsError::Storage`] when the scan fails.
    fn fetch_all(&self) -> Result<Vec<SectionNode>, SettingsError>;

    /// # Errors
    /// Returns [`SettingsError::Conflict`] when the stored revision moved on,
    /// [`SettingsError::NotFound`] when the node disappeared, or
    /// [`SettingsError::Storage`] when the write fails.
    fn save(&self, node: &SectionNode) -> Result<u64, SettingsError>;

    /// Create a section. Node creation belongs to the callers that own the
    /// forum structure; the settings engine never inserts or deletes nodes.
    ///
    /// # Errors
    /// Returns [`SettingsError::Validation`] when the id is already taken, or
    /// [`SettingsError::Storage`] when the write fails.
    fn insert(&self, node: &SectionNode) -> Result<(), SettingsError>;
}

/// In-process repository used by tests and embedders without a database.
#[derive(Debug, Default)]
pub struct MemorySectionRepository {
    nodes: Mutex<BTreeMap<SectionId, SectionNode>>,
    saves: Mutex<usize>,
    fail_saves_after: Mutex<Option<usize>>,
}

impl MemorySectionRepository {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_nodes(nodes: impl IntoIterator<Item = SectionNode>) -> Self {
        let repository = Self::new();
        {
            let mut stored = repository.nodes.lock();
            for node in nodes {
                stored.insert(node.id, node);
            }
        }
        repository
    }

    /// Make every save after the first `successful` ones fail with a storage
    /// error. `None` clears the fault.
    pub fn fail_saves_after(&self, successful: Option<usize>) {
        *self.saves.lock() = 0;
        *self.fail_saves_after.lock() = successful;
    }

    #[must_use]
    pub fn save_count(&self) -> usize {
        *self.saves.lock()
    }

    #[must_use]
    pub fn get(&self, id: SectionId) -> Option<SectionNode> {
        self.nodes.lock().get(&id).cloned()
    }

    /// Replace a stored node without the revision check, bumping its revision
    /// the way an unrelated writer would.
    pub fn overwrite(&self, mut node: SectionNode) {
        let mut nodes = self.nodes.lock();
        let revision = nodes.get(&node.id).map_or(0, |stored| stored.revision + 1);
        node.revision = revision;
        nodes.insert(node.id, node);
    }
}

impl SectionRepository for MemorySectionRepository {
    fn fetch_by_id(&self, id: SectionId) -> Result<Option<SectionNode>, SettingsError> {
        Ok(self.get(id))
    }

    fn fetch_all(&self) -> Result<Vec<SectionNode>, SettingsError> {
        Ok(self.nodes.lock().values().cloned().collect())
    }

    fn save(&self, node: &SectionNode) -> Result<u64, SettingsError> {
        {
            let mut saves = self.saves.lock();
            if let Some(limit) = *self.fail_saves_after.lock() {
                if *saves >= limit {
                    return Err(SettingsError::Storage(anyhow!(
                        "injected save failure for section {}",
                        node.id
                    )));
                }
            }
            *saves += 1;
        }

        let mut nodes = self.nodes.lock();
        let Some(stored) = nodes.get_mut(&node.id) else {
            return Err(SettingsError::NotFound(node.id));
        };
        if stored.revision != node.revision {
            return Err(SettingsError::Conflict {
                section_id: node.id,
                expected_revision: node.revision,
            });
        }

        let mut next = node.clone();
        next.revision = node.revision + 1;
        *stored = next;
        Ok(node.revision + 1)
    }

    fn insert(&self, node: &SectionNode) -> Result<(), SettingsError> {
        let mut nodes = self.nodes.lock();
        if nodes.contains_key(&node.id) {
            return Err(SettingsError::Validation(format!("section {} already exists", node.id)));
        }
        let mut stored = node.clone();
        stored.revision = 0;
        nodes.insert(node.id, stored);
        Ok(())
    }
}
