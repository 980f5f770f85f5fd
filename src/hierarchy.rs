// Copyright 2024 Saptak Santra
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! `(ChildOf, parent)` relation helpers: building/reading the pair id, the
//! named-child lookup on [`ComponentRecord::child_names`], and the cascade
//! depth a query's grouping (spec §4.6) orders by.

use crate::component::ComponentIndex;
use crate::consts::RELATION_CHILD_OF;
use crate::entity::EntityId;

/// Builds the `(ChildOf, parent)` pair id for `parent`.
pub fn child_of(parent: EntityId) -> EntityId {
    EntityId::pair(RELATION_CHILD_OF, parent.index())
}

pub fn is_child_of_pair(id: EntityId) -> bool {
    id.is_pair() && id.pair_relation() == RELATION_CHILD_OF
}

/// Recovers the parent entity from a `(ChildOf, parent)` pair id. The
/// parent's generation isn't carried in the pair encoding (only its index
/// is, see `entity.rs`'s pair-field note), so the returned id always has
/// generation 0 — callers resolve the live entity via the entity index by
/// index only, the same way [`crate::archetype::Table::new`] compares
/// built-in tags.
pub fn parent_of_pair(id: EntityId) -> Option<EntityId> {
    is_child_of_pair(id).then(|| EntityId::from_parts(id.pair_object(), 0))
}

/// Finds the `(ChildOf, _)` pair in a table's type, if any. A table's type
/// is the same for every entity in it, so there is at most one such pair.
pub fn parent_in_type(type_ids: &[EntityId]) -> Option<EntityId> {
    type_ids.iter().copied().find_map(parent_of_pair)
}

/// Depth of `type_ids`'s entity within the `ChildOf` ancestor chain —
/// root entities (no parent) are depth 0 — used as a cascade query's group
/// id so ancestors always sort before their descendants. `parent_type_of`
/// resolves a parent entity's own table type to continue the walk upward;
/// capped at a depth no real hierarchy should reach, as a cycle guard.
pub fn cascade_depth(
    type_ids: &[EntityId],
    parent_type_of: &impl Fn(EntityId) -> Option<Vec<EntityId>>,
) -> u32 {
    const MAX_DEPTH: u32 = 10_000;
    let mut depth = 0;
    let mut current = parent_in_type(type_ids);
    while let Some(parent) = current {
        depth += 1;
        if depth >= MAX_DEPTH {
            break;
        }
        current = parent_type_of(parent).and_then(|t| parent_in_type(&t));
    }
    depth
}

/// Registers `child` under `parent`'s name index, creating the
/// `(ChildOf, parent)` record if this is the first named child.
pub fn register_child_name(index: &mut ComponentIndex, parent: EntityId, name: &str, child: EntityId) {
    let record = index.ensure(child_of(parent));
    record
        .child_names
        .get_or_insert_with(Default::default)
        .insert(name.to_string(), child);
}

pub fn unregister_child_name(index: &mut ComponentIndex, parent: EntityId, name: &str) {
    if let Some(record) = index.get_mut(child_of(parent)) {
        if let Some(names) = record.child_names.as_mut() {
            names.remove(name);
        }
    }
}

/// Looks up a child entity by name under `parent`'s scope. Out of scope:
/// multi-segment path resolution (`"a/b/c"`) — see SPEC_FULL.md Non-goals.
pub fn find_child_by_name(index: &ComponentIndex, parent: EntityId, name: &str) -> Option<EntityId> {
    index.get(child_of(parent))?.child_names.as_ref()?.get(name).copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: u32) -> EntityId {
        EntityId::from_parts(n, 1)
    }

    #[test]
    fn child_of_pair_round_trips_parent_index() {
        let parent = id(5);
        let pair = child_of(parent);
        assert!(is_child_of_pair(pair));
        assert_eq!(parent_of_pair(pair).unwrap().index(), parent.index());
    }

    #[test]
    fn cascade_depth_counts_ancestor_chain() {
        let grandparent = id(1);
        let parent = id(2);
        let leaf_type = vec![child_of(parent)];
        let parent_type_of = move |p: EntityId| -> Option<Vec<EntityId>> {
            if p.index() == parent.index() {
                Some(vec![child_of(grandparent)])
            } else if p.index() == grandparent.index() {
                Some(vec![])
            } else {
                None
            }
        };
        assert_eq!(cascade_depth(&leaf_type, &parent_type_of), 2);
        assert_eq!(cascade_depth(&[], &parent_type_of), 0);
    }

    #[test]
    fn named_child_lookup_round_trips() {
        let mut index = ComponentIndex::new();
        let parent = id(10);
        let child = id(20);
        register_child_name(&mut index, parent, "weapon", child);
        assert_eq!(find_child_by_name(&index, parent, "weapon"), Some(child));
        unregister_child_name(&mut index, parent, "weapon");
        assert_eq!(find_child_by_name(&index, parent, "weapon"), None);
    }
}
