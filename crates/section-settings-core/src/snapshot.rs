use std::collections::{BTreeMap, BTreeSet, VecDeque};

use crate::{SectionId, SectionNode, SectionRepository, SettingsError};

/// Immutable view of the whole section forest, taken in one `fetch_all`.
///
/// Children are indexed by parent once at construction; ancestor chains are
/// walked on demand. A parent reference to a missing section is logged and
/// treated as "no parent".
#[derive(Debug, Clone, Default)]
pub struct ForestSnapshot {
    nodes: BTreeMap<SectionId, SectionNode>,
    children: BTreeMap<SectionId, Vec<SectionId>>,
    roots: Vec<SectionId>,
}

impl ForestSnapshot {
    /// Load every section from `repository`.
    ///
    /// # Errors
    /// Returns the repository error unchanged; nothing is written.
    pub fn load<R>(repository: &R) -> Result<Self, SettingsError>
    where
        R: SectionRepository + ?Sized,
    {
        Ok(Self::from_nodes(repository.fetch_all()?))
    }

    #[must_use]
    pub fn from_nodes(nodes: impl IntoIterator<Item = SectionNode>) -> Self {
        let nodes = nodes.into_iter().map(|node| (node.id, node)).collect::<BTreeMap<_, _>>();
        let mut children: BTreeMap<SectionId, Vec<SectionId>> = BTreeMap::new();
        let mut roots = Vec::new();

        for node in nodes.values() {
            match node.parent {
                Some(parent) if nodes.contains_key(&parent) => {
                    children.entry(parent).or_default().push(node.id);
                }
                Some(parent) => {
                    tracing::warn!(
                        section_id = %node.id,
                        parent_id = %parent,
                        "forum sections collection contains a reference to non-existent section"
                    );
                    roots.push(node.id);
                }
                None => roots.push(node.id),
            }
        }

        Self { nodes, children, roots }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    #[must_use]
    pub fn get(&self, id: SectionId) -> Option<&SectionNode> {
        self.nodes.get(&id)
    }

    #[must_use]
    pub fn contains(&self, id: SectionId) -> bool {
        self.nodes.contains_key(&id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &SectionNode> + '_ {
        self.nodes.values()
    }

    #[must_use]
    pub fn roots(&self) -> &[SectionId] {
        &self.roots
    }

    #[must_use]
    pub fn children(&self, id: SectionId) -> &[SectionId] {
        self.children.get(&id).map(Vec::as_slice).unwrap_or_default()
    }

    /// Parent of `id` when it resolves inside the snapshot.
    #[must_use]
    pub fn parent_of(&self, id: SectionId) -> Option<SectionId> {
        self.nodes
            .get(&id)
            .and_then(|node| node.parent)
            .filter(|parent| self.nodes.contains_key(parent))
    }

    /// Ancestors of `id`, nearest first, excluding `id` itself.
    ///
    /// # Errors
    /// Returns [`SettingsError::DataIntegrity`] when the chain is longer than
    /// the forest, which only happens when parent links form a cycle.
    pub fn ancestors(&self, id: SectionId) -> Result<Vec<SectionId>, SettingsError> {
        let mut chain = Vec::new();
        let mut current = self.parent_of(id);
        while let Some(ancestor) = current {
            if chain.len() >= self.nodes.len() {
                return Err(cycle_error(id));
            }
            chain.push(ancestor);
            current = self.parent_of(ancestor);
        }
        Ok(chain)
    }

    /// `id` followed by all of its descendants, breadth first.
    ///
    /// # Errors
    /// Returns [`SettingsError::NotFound`] when `id` is not in the snapshot.
    pub fn subtree_in_order(&self, id: SectionId) -> Result<Vec<SectionId>, SettingsError> {
        if !self.contains(id) {
            return Err(SettingsError::NotFound(id));
        }
        let mut visited = BTreeSet::new();
        let mut order = Vec::new();
        self.walk_breadth_first(id, &mut visited, &mut order);
        Ok(order)
    }

    /// Every section with parents ahead of their children. Sections that are
    /// only reachable through a parent cycle come last, in id order.
    #[must_use]
    pub fn all_in_order(&self) -> Vec<SectionId> {
        let mut visited = BTreeSet::new();
        let mut order = Vec::with_capacity(self.nodes.len());
        for root in &self.roots {
            self.walk_breadth_first(*root, &mut visited, &mut order);
        }
        for id in self.nodes.keys() {
            if visited.insert(*id) {
                order.push(*id);
            }
        }
        order
    }

    fn walk_breadth_first(
        &self,
        start: SectionId,
        visited: &mut BTreeSet<SectionId>,
        order: &mut Vec<SectionId>,
    ) {
        let mut queue = VecDeque::from([start]);
        while let Some(id) = queue.pop_front() {
            if !visited.insert(id) {
                continue;
            }
            order.push(id);
            queue.extend(self.children(id).iter().copied());
        }
    }
}

pub(crate) fn cycle_error(id: SectionId) -> SettingsError {
    SettingsError::DataIntegrity(format!("parent references starting at section {id} form a cycle"))
}
