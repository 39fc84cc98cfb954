use std::collections::BTreeSet;

use crate::snapshot::cycle_error;
use crate::{ForestSnapshot, SectionId, SettingEntry, SettingsError, UserId};

/// Find the nearest section, starting at `section_id` and walking up through
/// parents, that holds an own entry for `(user_id, key)`.
///
/// A start section missing from the snapshot resolves to `None`, as does a
/// chain ending in a dangling parent reference.
///
/// # Errors
/// Returns [`SettingsError::DataIntegrity`] when the walk visits more sections
/// than the snapshot holds (a parent cycle).
pub fn resolve<'a>(
    snapshot: &'a ForestSnapshot,
    section_id: SectionId,
    user_id: UserId,
    key: &str,
) -> Result<Option<&'a SettingEntry>, SettingsError> {
    let mut current = Some(section_id);
    let mut depth = 0_usize;

    while let Some(id) = current {
        let Some(node) = snapshot.get(id) else {
            return Ok(None);
        };
        if depth >= snapshot.len() {
            return Err(cycle_error(section_id));
        }
        depth += 1;

        if let Some(entry) = node.own_entry(user_id, key) {
            return Ok(Some(entry));
        }
        current = snapshot.parent_of(id);
    }

    Ok(None)
}

/// Users holding any entry, own or inherited, at `section_id` or one of its
/// ancestors.
///
/// # Errors
/// Returns [`SettingsError::DataIntegrity`] on a parent cycle.
pub fn candidate_users(
    snapshot: &ForestSnapshot,
    section_id: SectionId,
) -> Result<BTreeSet<UserId>, SettingsError> {
    let mut users = BTreeSet::new();
    let Some(node) = snapshot.get(section_id) else {
        return Ok(users);
    };
    users.extend(node.settings.keys().copied());

    for ancestor in snapshot.ancestors(section_id)? {
        if let Some(node) = snapshot.get(ancestor) {
            users.extend(node.settings.keys().copied());
        }
    }
    Ok(users)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use serde_json::json;

    use super::*;
    use crate::SectionNode;

    fn with_entry(mut node: SectionNode, user: UserId, key: &str, entry: SettingEntry) -> SectionNode {
        node.settings.entry(user).or_default().insert(key.to_string(), entry);
        node
    }

    #[test]
    fn nearest_own_ancestor_wins() {
        let user = UserId::new();
        let root = with_entry(
            SectionNode::new(SectionId::new(), None, "root"),
            user,
            "visible",
            SettingEntry::own(json!(true)),
        );
        let middle = with_entry(
            SectionNode::new(SectionId::new(), Some(root.id), "middle"),
            user,
            "visible",
            SettingEntry::own(json!(false)),
        );
        let leaf = SectionNode::new(SectionId::new(), Some(middle.id), "leaf");
        let snapshot = ForestSnapshot::from_nodes([root.clone(), middle.clone(), leaf.clone()]);

        let resolved = resolve(&snapshot, leaf.id, user, "visible");
        assert!(matches!(resolved, Ok(Some(entry)) if entry.value == json!(false) && entry.own));

        let from_root = resolve(&snapshot, root.id, user, "visible");
        assert!(matches!(from_root, Ok(Some(entry)) if entry.value == json!(true)));
    }

    #[test]
    fn inherited_entries_are_skipped_while_walking() {
        let user = UserId::new();
        let root = with_entry(
            SectionNode::new(SectionId::new(), None, "root"),
            user,
            "visible",
            SettingEntry::own(json!(1)),
        );
        let stale = with_entry(
            SectionNode::new(SectionId::new(), Some(root.id), "stale"),
            user,
            "visible",
            SettingEntry::inherited(json!(99)),
        );
        let snapshot = ForestSnapshot::from_nodes([root, stale.clone()]);

        let resolved = resolve(&snapshot, stale.id, user, "visible");
        assert!(matches!(resolved, Ok(Some(entry)) if entry.value == json!(1)));
    }

    #[test]
    fn unset_when_no_ancestor_owns_the_key() {
        let user = UserId::new();
        let root = SectionNode::new(SectionId::new(), None, "root");
        let orphan = SectionNode::new(SectionId::new(), Some(SectionId::new()), "orphan");
        let snapshot = ForestSnapshot::from_nodes([root.clone(), orphan.clone()]);

        assert!(matches!(resolve(&snapshot, root.id, user, "visible"), Ok(None)));
        assert!(matches!(resolve(&snapshot, orphan.id, user, "visible"), Ok(None)));
        assert!(matches!(resolve(&snapshot, SectionId::new(), user, "visible"), Ok(None)));
    }

    #[test]
    fn cycle_is_reported_as_data_integrity_error() {
        let a_id = SectionId::new();
        let b_id = SectionId::new();
        let snapshot = ForestSnapshot::from_nodes([
            SectionNode::new(a_id, Some(b_id), "a"),
            SectionNode::new(b_id, Some(a_id), "b"),
        ]);

        let resolved = resolve(&snapshot, a_id, UserId::new(), "visible");
        assert!(matches!(resolved, Err(SettingsError::DataIntegrity(_))));
        assert!(matches!(candidate_users(&snapshot, b_id), Err(SettingsError::DataIntegrity(_))));
    }

    #[test]
    fn candidate_users_collects_node_and_ancestor_users() {
        let (first, second, third) = (UserId::new(), UserId::new(), UserId::new());
        let mut root = SectionNode::new(SectionId::new(), None, "root");
        root.settings.insert(first, BTreeMap::new());
        let mut child = SectionNode::new(SectionId::new(), Some(root.id), "child");
        child.settings.insert(second, BTreeMap::new());
        let mut sibling = SectionNode::new(SectionId::new(), Some(root.id), "sibling");
        sibling.settings.insert(third, BTreeMap::new());
        let snapshot = ForestSnapshot::from_nodes([root, child.clone(), sibling]);

        let users = candidate_users(&snapshot, child.id);
        assert!(matches!(users, Ok(ref users) if *users == BTreeSet::from([first, second])));
    }
}
