use crate::{
    candidate_users, resolve, visible_assignees, ForestSnapshot, SectionId, SectionNode,
    SettingEntry, SettingKeyRegistry, SettingsError,
};

/// Outcome of a planning pass: how many sections were examined and the
/// rewritten copies of those that need saving.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecomputePlan {
    pub scanned: usize,
    pub changed: Vec<SectionNode>,
}

impl RecomputePlan {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.changed.is_empty()
    }

    #[must_use]
    pub fn changed_ids(&self) -> Vec<SectionId> {
        self.changed.iter().map(|node| node.id).collect()
    }
}

/// Recompute inherited entries and visible assignees for `scope` and its
/// descendants, or for every section when `scope` is `None`.
///
/// Own entries are left as they are. For every registered key, a non-own
/// entry is replaced by the value of the nearest own entry above the section,
/// or removed when there is none. Users left with no keys are dropped.
/// Sections come out parents first; unchanged sections are omitted.
///
/// # Errors
/// Returns [`SettingsError::NotFound`] when `scope` is not in the snapshot, or
/// [`SettingsError::DataIntegrity`] when parent links form a cycle.
pub fn plan_recompute(
    snapshot: &ForestSnapshot,
    scope: Option<SectionId>,
    registry: &SettingKeyRegistry,
) -> Result<RecomputePlan, SettingsError> {
    let targets = match scope {
        Some(section_id) => snapshot.subtree_in_order(section_id)?,
        None => snapshot.all_in_order(),
    };

    let mut changed = Vec::new();
    for section_id in &targets {
        let Some(node) = snapshot.get(*section_id) else {
            continue;
        };
        let recomputed = recompute_section(snapshot, node, registry)?;
        if recomputed.settings != node.settings
            || recomputed.visible_assignees != node.visible_assignees
        {
            changed.push(recomputed);
        }
    }

    Ok(RecomputePlan { scanned: targets.len(), changed })
}

fn recompute_section(
    snapshot: &ForestSnapshot,
    node: &SectionNode,
    registry: &SettingKeyRegistry,
) -> Result<SectionNode, SettingsError> {
    let parent = snapshot.parent_of(node.id);
    let mut next = node.clone();

    for user_id in candidate_users(snapshot, node.id)? {
        let mut user_settings = next.settings.remove(&user_id).unwrap_or_default();

        for key in registry.names() {
            if user_settings.get(key).is_some_and(|entry| entry.own) {
                continue;
            }

            let inherited = match parent {
                Some(parent_id) => resolve(snapshot, parent_id, user_id, key)?,
                None => None,
            };
            match inherited {
                Some(entry) => {
                    let copy = SettingEntry::inherited(entry.value.clone());
                    user_settings.insert(key.to_string(), copy);
                }
                None => {
                    user_settings.remove(key);
                }
            }
        }

        if !user_settings.is_empty() {
            next.settings.insert(user_id, user_settings);
        }
    }

    next.visible_assignees = visible_assignees(&next.settings, registry.visibility_key());
    Ok(next)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use proptest::prelude::*;
    use serde_json::{json, Value};

    use super::*;
    use crate::{SettingKey, UserId, FORUM_MOD_VISIBLE};

    const EDIT: &str = "forum_mod_edit_posts";

    fn registry() -> SettingKeyRegistry {
        SettingKeyRegistry::forum_moderator_defaults()
    }

    fn set_own(node: &mut SectionNode, user: UserId, key: &str, value: Value) {
        node.settings.entry(user).or_default().insert(key.to_string(), SettingEntry::own(value));
    }

    fn apply(snapshot: &ForestSnapshot, plan: &RecomputePlan) -> ForestSnapshot {
        let mut nodes =
            snapshot.nodes().map(|node| (node.id, node.clone())).collect::<BTreeMap<_, _>>();
        for node in &plan.changed {
            nodes.insert(node.id, node.clone());
        }
        ForestSnapshot::from_nodes(nodes.into_values())
    }

    fn plan(snapshot: &ForestSnapshot, scope: Option<SectionId>) -> RecomputePlan {
        match plan_recompute(snapshot, scope, &registry()) {
            Ok(plan) => plan,
            Err(err) => panic!("recompute should plan: {err}"),
        }
    }

    fn entry(snapshot: &ForestSnapshot, id: SectionId, user: UserId, key: &str) -> Option<SettingEntry> {
        snapshot.get(id).and_then(|node| node.entry(user, key)).cloned()
    }

    /// Every non-own entry mirrors the nearest own ancestor, and every
    /// resolvable registered key is materialized.
    fn assert_converged(snapshot: &ForestSnapshot, registry: &SettingKeyRegistry) {
        for node in snapshot.nodes() {
            let users = match candidate_users(snapshot, node.id) {
                Ok(users) => users,
                Err(err) => panic!("candidate users should resolve: {err}"),
            };
            for user in users {
                for key in registry.names() {
                    let stored = node.entry(user, key);
                    if stored.is_some_and(|entry| entry.own) {
                        continue;
                    }
                    let expected = match snapshot.parent_of(node.id) {
                        Some(parent) => match resolve(snapshot, parent, user, key) {
                            Ok(found) => found.map(|entry| entry.value.clone()),
                            Err(err) => panic!("resolve should succeed: {err}"),
                        },
                        None => None,
                    };
                    assert_eq!(stored.map(|entry| entry.value.clone()), expected);
                }
            }
            for user_settings in node.settings.values() {
                assert!(!user_settings.is_empty(), "empty user maps must not persist");
            }
            assert_eq!(node.visible_assignees, visible_assignees(&node.settings, FORUM_MOD_VISIBLE));
        }
    }

    #[test]
    fn chain_scenario_follows_nearest_override() {
        let user = UserId::new();
        let mut a = SectionNode::new(SectionId::new(), None, "A");
        let b = SectionNode::new(SectionId::new(), Some(a.id), "B");
        let c = SectionNode::new(SectionId::new(), Some(b.id), "C");
        set_own(&mut a, user, FORUM_MOD_VISIBLE, json!(true));

        let snapshot = ForestSnapshot::from_nodes([a.clone(), b.clone(), c.clone()]);
        let snapshot = apply(&snapshot, &plan(&snapshot, Some(a.id)));
        for id in [b.id, c.id] {
            assert_eq!(
                entry(&snapshot, id, user, FORUM_MOD_VISIBLE),
                Some(SettingEntry::inherited(json!(true)))
            );
            assert_eq!(snapshot.get(id).map(|node| node.visible_assignees.clone()), Some(vec![user]));
        }

        let mut b_own = snapshot.get(b.id).cloned().unwrap_or_else(|| unreachable!());
        set_own(&mut b_own, user, FORUM_MOD_VISIBLE, json!(false));
        let snapshot = apply(&snapshot, &RecomputePlan { scanned: 1, changed: vec![b_own] });
        let snapshot = apply(&snapshot, &plan(&snapshot, Some(b.id)));
        assert_eq!(
            entry(&snapshot, b.id, user, FORUM_MOD_VISIBLE),
            Some(SettingEntry::own(json!(false)))
        );
        assert_eq!(
            entry(&snapshot, c.id, user, FORUM_MOD_VISIBLE),
            Some(SettingEntry::inherited(json!(false)))
        );
        assert_eq!(snapshot.get(c.id).map(|node| node.visible_assignees.len()), Some(0));

        let mut b_cleared = snapshot.get(b.id).cloned().unwrap_or_else(|| unreachable!());
        b_cleared.settings.remove(&user);
        let snapshot = apply(&snapshot, &RecomputePlan { scanned: 1, changed: vec![b_cleared] });
        let snapshot = apply(&snapshot, &plan(&snapshot, Some(b.id)));
        assert_eq!(
            entry(&snapshot, c.id, user, FORUM_MOD_VISIBLE),
            Some(SettingEntry::inherited(json!(true)))
        );
        assert_eq!(
            entry(&snapshot, b.id, user, FORUM_MOD_VISIBLE),
            Some(SettingEntry::inherited(json!(true)))
        );
    }

    #[test]
    fn removing_the_only_override_drops_descendant_copies_and_empty_users() {
        let user = UserId::new();
        let root = SectionNode::new(SectionId::new(), None, "root");
        let mut child = SectionNode::new(SectionId::new(), Some(root.id), "child");
        let mut leaf = SectionNode::new(SectionId::new(), Some(child.id), "leaf");
        child
            .settings
            .insert(user, BTreeMap::from([(EDIT.to_string(), SettingEntry::inherited(json!(true)))]));
        leaf.settings
            .insert(user, BTreeMap::from([(EDIT.to_string(), SettingEntry::inherited(json!(true)))]));
        leaf.visible_assignees = vec![user];

        let snapshot = ForestSnapshot::from_nodes([root.clone(), child.clone(), leaf.clone()]);
        let plan = plan(&snapshot, Some(root.id));
        assert_eq!(plan.scanned, 3);
        assert_eq!(plan.changed_ids(), vec![child.id, leaf.id]);

        let snapshot = apply(&snapshot, &plan);
        for id in [child.id, leaf.id] {
            let node = snapshot.get(id).cloned().unwrap_or_else(|| unreachable!());
            assert!(!node.settings.contains_key(&user));
            assert!(node.visible_assignees.is_empty());
        }
    }

    #[test]
    fn scoped_pass_leaves_other_subtrees_alone() {
        let user = UserId::new();
        let mut left = SectionNode::new(SectionId::new(), None, "left");
        set_own(&mut left, user, EDIT, json!(true));
        let left_child = SectionNode::new(SectionId::new(), Some(left.id), "left child");
        let right = SectionNode::new(SectionId::new(), None, "right");
        let mut right_child = SectionNode::new(SectionId::new(), Some(right.id), "right child");
        right_child
            .settings
            .insert(user, BTreeMap::from([(EDIT.to_string(), SettingEntry::inherited(json!(1)))]));

        let snapshot = ForestSnapshot::from_nodes([left.clone(), left_child.clone(), right, right_child]);
        let plan = plan(&snapshot, Some(left.id));
        assert_eq!(plan.scanned, 2);
        assert_eq!(plan.changed_ids(), vec![left_child.id]);
    }

    #[test]
    fn keys_outside_the_registry_are_not_touched() {
        let user = UserId::new();
        let root = SectionNode::new(SectionId::new(), None, "root");
        let mut child = SectionNode::new(SectionId::new(), Some(root.id), "child");
        child.settings.insert(
            user,
            BTreeMap::from([("legacy_flag".to_string(), SettingEntry::inherited(json!(true)))]),
        );
        let snapshot = ForestSnapshot::from_nodes([root, child.clone()]);

        let plan = plan(&snapshot, None);
        assert!(plan.is_empty());
    }

    #[test]
    fn unknown_scope_is_not_found_and_cycle_is_refused() {
        let snapshot = ForestSnapshot::from_nodes([SectionNode::new(SectionId::new(), None, "root")]);
        let missing = SectionId::new();
        assert!(matches!(
            plan_recompute(&snapshot, Some(missing), &registry()),
            Err(SettingsError::NotFound(id)) if id == missing
        ));

        let a_id = SectionId::new();
        let b_id = SectionId::new();
        let cyclic = ForestSnapshot::from_nodes([
            SectionNode::new(a_id, Some(b_id), "a"),
            SectionNode::new(b_id, Some(a_id), "b"),
        ]);
        assert!(matches!(
            plan_recompute(&cyclic, None, &registry()),
            Err(SettingsError::DataIntegrity(_))
        ));
    }

    #[test]
    fn dangling_parent_acts_as_root() {
        let user = UserId::new();
        let mut orphan = SectionNode::new(SectionId::new(), Some(SectionId::new()), "orphan");
        orphan
            .settings
            .insert(user, BTreeMap::from([(EDIT.to_string(), SettingEntry::inherited(json!(true)))]));
        let snapshot = ForestSnapshot::from_nodes([orphan.clone()]);

        let snapshot = apply(&snapshot, &plan(&snapshot, None));
        assert!(snapshot.get(orphan.id).is_some_and(|node| node.settings.is_empty()));
    }

    #[test]
    fn custom_registry_uses_its_own_visibility_key() {
        let registry = match SettingKeyRegistry::new(
            vec![
                SettingKey { name: "listed".to_string(), empty_value: json!(0) },
                SettingKey { name: "quota".to_string(), empty_value: json!(0) },
            ],
            "listed",
        ) {
            Ok(registry) => registry,
            Err(err) => panic!("registry should build: {err}"),
        };
        let user = UserId::new();
        let mut root = SectionNode::new(SectionId::new(), None, "root");
        set_own(&mut root, user, "listed", json!(3));
        let child = SectionNode::new(SectionId::new(), Some(root.id), "child");
        let snapshot = ForestSnapshot::from_nodes([root.clone(), child.clone()]);

        let plan = match plan_recompute(&snapshot, None, &registry) {
            Ok(plan) => plan,
            Err(err) => panic!("recompute should plan: {err}"),
        };
        let snapshot = apply(&snapshot, &plan);
        assert_eq!(snapshot.get(root.id).map(|node| node.visible_assignees.clone()), Some(vec![user]));
        assert_eq!(snapshot.get(child.id).map(|node| node.visible_assignees.clone()), Some(vec![user]));
    }

    #[derive(Debug, Clone)]
    struct ForestSeed {
        parents: Vec<Option<usize>>,
        entries: Vec<(usize, usize, usize, bool, i64)>,
    }

    fn forest_seed() -> impl Strategy<Value = ForestSeed> {
        (1_usize..9)
            .prop_flat_map(|size| {
                let parents = (0..size)
                    .map(|index| {
                        if index == 0 {
                            Just(None).boxed()
                        } else {
                            prop_oneof![Just(None), (0..index).prop_map(Some)].boxed()
                        }
                    })
                    .collect::<Vec<_>>();
                let entries = prop::collection::vec(
                    (0..size, 0_usize..3, 0_usize..3, any::<bool>(), -2_i64..3),
                    0..16,
                );
                (parents, entries)
            })
            .prop_map(|(parents, entries)| ForestSeed { parents, entries })
    }

    fn build_forest(seed: &ForestSeed) -> ForestSnapshot {
        let registry = registry();
        let keys = registry.names().take(3).collect::<Vec<_>>();
        let users = (0..3).map(|_| UserId::new()).collect::<Vec<_>>();
        let ids = seed.parents.iter().map(|_| SectionId::new()).collect::<Vec<_>>();
        let mut nodes = seed
            .parents
            .iter()
            .enumerate()
            .map(|(index, parent)| {
                SectionNode::new(ids[index], parent.map(|parent| ids[parent]), format!("s{index}"))
            })
            .collect::<Vec<_>>();
        for (section, user, key, own, value) in &seed.entries {
            nodes[*section].settings.entry(users[*user]).or_default().insert(
                keys[*key].to_string(),
                SettingEntry { value: json!(value), own: *own },
            );
        }
        ForestSnapshot::from_nodes(nodes)
    }

    proptest! {
        #[test]
        fn property_recompute_converges_to_nearest_own_value(seed in forest_seed()) {
            let snapshot = build_forest(&seed);
            let converged = apply(&snapshot, &plan(&snapshot, None));
            assert_converged(&converged, &registry());
        }

        #[test]
        fn property_recompute_is_idempotent(seed in forest_seed()) {
            let snapshot = build_forest(&seed);
            let converged = apply(&snapshot, &plan(&snapshot, None));
            let second = plan(&converged, None);
            prop_assert!(second.is_empty());
        }

        #[test]
        fn property_recompute_preserves_own_entries(seed in forest_seed()) {
            let snapshot = build_forest(&seed);
            let converged = apply(&snapshot, &plan(&snapshot, None));
            for node in snapshot.nodes() {
                for (user, user_settings) in &node.settings {
                    for (key, stored) in user_settings.iter().filter(|(_, entry)| entry.own) {
                        prop_assert_eq!(entry(&converged, node.id, *user, key), Some(stored.clone()));
                    }
                }
            }
        }
    }
}
