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

//! The archetype graph: per-table add/remove edges connecting tables whose
//! types differ by one id, plus prefab traversal and edge teardown.
//!
//! The spec's "intrusive doubly-linked incoming list" is implemented here as
//! a plain `Vec` of reverse-edge descriptors per table rather than hand-rolled
//! linked-list pointers: the re-architecture note already steers pointer-
//! heavy intrusive structures toward arena-indexed compact ids, and a `Vec`
//! indexed by [`crate::archetype::TableId`] is the natural Rust expression of
//! that — O(1) amortised append, O(k) teardown over the `k` incoming edges,
//! without unsafe linked-list surgery. See DESIGN.md.

use std::sync::{Arc, OnceLock};

use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::archetype::TableId;
use crate::consts::{INLINE_TERMS, RELATION_IS_A, SMALL_ID_THRESHOLD, TAG_PREFAB};
use crate::entity::EntityId;

/// Ids added/removed beyond the single explicit id an edge is keyed by.
/// Populated only for prefab-traversal edges, which can pull in many of the
/// base entity's component ids at once; a plain `add(e, c)` edge's diff is
/// empty (the single changed id is already the edge's own key) and shares
/// [`empty_diff`]'s singleton rather than allocating.
#[derive(Debug, Default)]
pub struct Diff {
    pub added: SmallVec<[EntityId; INLINE_TERMS]>,
    pub removed: SmallVec<[EntityId; INLINE_TERMS]>,
}

impl Diff {
    fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

fn empty_diff() -> Arc<Diff> {
    static EMPTY: OnceLock<Arc<Diff>> = OnceLock::new();
    EMPTY.get_or_init(|| Arc::new(Diff::default())).clone()
}

#[derive(Clone)]
struct Edge {
    to: TableId,
    diff: Arc<Diff>,
}

/// Outgoing edge table for one table, split between a fixed inline array for
/// ids below [`SMALL_ID_THRESHOLD`] and a hash map for everything else
/// (pairs included — a pair's packed id almost always exceeds the inline
/// range).
struct EdgeMap {
    inline: Box<[Option<Edge>]>,
    overflow: FxHashMap<u64, Edge>,
}

impl EdgeMap {
    fn new() -> Self {
        Self {
            inline: vec![None; SMALL_ID_THRESHOLD as usize].into_boxed_slice(),
            overflow: FxHashMap::default(),
        }
    }

    fn uses_inline(id: EntityId) -> bool {
        !id.is_pair() && id.index() < SMALL_ID_THRESHOLD
    }

    fn get(&self, id: EntityId) -> Option<&Edge> {
        if Self::uses_inline(id) {
            self.inline[id.index() as usize].as_ref()
        } else {
            self.overflow.get(&id.raw())
        }
    }

    fn set(&mut self, id: EntityId, edge: Edge) {
        if Self::uses_inline(id) {
            self.inline[id.index() as usize] = Some(edge);
        } else {
            self.overflow.insert(id.raw(), edge);
        }
    }

    fn remove(&mut self, id: EntityId) -> Option<Edge> {
        if Self::uses_inline(id) {
            self.inline[id.index() as usize].take()
        } else {
            self.overflow.remove(&id.raw())
        }
    }

    fn iter(&self) -> impl Iterator<Item = (EntityId, &Edge)> {
        let inline = self.inline.iter().enumerate().filter_map(|(i, e)| {
            e.as_ref()
                .map(|edge| (EntityId::from_parts(i as u32, 0), edge))
        });
        let overflow = self
            .overflow
            .iter()
            .map(|(&raw, edge)| (EntityId::from_raw(raw), edge));
        inline.chain(overflow)
    }
}

/// One reverse-edge record: `from` has an edge to the table owning this
/// record, over `id`, of kind `is_add`.
struct Incoming {
    from: TableId,
    id: EntityId,
    is_add: bool,
}

struct GraphNode {
    add_edges: EdgeMap,
    remove_edges: EdgeMap,
    incoming: Vec<Incoming>,
}

impl GraphNode {
    fn new() -> Self {
        Self {
            add_edges: EdgeMap::new(),
            remove_edges: EdgeMap::new(),
            incoming: Vec::new(),
        }
    }
}

/// The world-wide archetype graph: one [`GraphNode`] per table, plus the
/// type-hash-to-table map used to dedupe tables with the same sorted type.
/// Tables themselves live in the world's table arena; this module only
/// tracks which id transitions connect them.
pub struct Graph {
    nodes: Vec<GraphNode>,
    type_to_table: FxHashMap<Vec<EntityId>, TableId>,
}

impl Default for Graph {
    fn default() -> Self {
        Self::new()
    }
}

impl Graph {
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            type_to_table: FxHashMap::default(),
        }
    }

    fn ensure_node(&mut self, table: TableId) -> &mut GraphNode {
        let idx = table.raw() as usize;
        if idx >= self.nodes.len() {
            self.nodes.resize_with(idx + 1, GraphNode::new);
        }
        &mut self.nodes[idx]
    }

    pub fn register_table(&mut self, table: TableId, type_ids: &[EntityId]) {
        self.ensure_node(table);
        self.type_to_table.insert(type_ids.to_vec(), table);
    }

    pub fn table_for_type(&self, type_ids: &[EntityId]) -> Option<TableId> {
        self.type_to_table.get(type_ids).copied()
    }

    /// Computes the destination type for adding `id` to `from_type`
    /// (sorted, deduplicated insertion), expanded with prefab-inherited ids
    /// when `id` is an `(IsA, prefab)` pair (spec §4.3 "Prefab traversal"):
    /// every non-prefab, non-tag id from the prefab's own table is appended
    /// in reverse order, recursively, via `prefab_type_of`. Returns the full
    /// destination type and the ids that are genuinely new beyond `id`
    /// itself (the edge's diff).
    fn compute_add_destination(
        id: EntityId,
        from_type: &[EntityId],
        prefab_type_of: &impl Fn(EntityId) -> Option<Vec<EntityId>>,
    ) -> (Vec<EntityId>, SmallVec<[EntityId; INLINE_TERMS]>) {
        let mut dest = from_type.to_vec();
        let mut extra: SmallVec<[EntityId; INLINE_TERMS]> = SmallVec::new();
        insert_sorted(&mut dest, id);

        if id.is_pair() && id.pair_relation() == RELATION_IS_A {
            let prefab = EntityId::from_parts(id.pair_object(), 0);
            if let Some(prefab_type) = prefab_type_of(prefab) {
                for &inherited in prefab_type.iter().rev() {
                    if inherited.index() == TAG_PREFAB {
                        continue;
                    }
                    if dest.binary_search(&inherited).is_ok() {
                        continue;
                    }
                    insert_sorted(&mut dest, inherited);
                    extra.push(inherited);
                }
            }
        }
        (dest, extra)
    }

    /// Ensures (creating if necessary) and returns the destination table for
    /// adding `id` to `from`. `tables` creates a fresh table for a new type
    /// via the supplied callback; `prefab_type_of` resolves a prefab
    /// entity's current table type for prefab traversal.
    #[allow(clippy::too_many_arguments)]
    pub fn traverse_add(
        &mut self,
        from: TableId,
        from_type: &[EntityId],
        id: EntityId,
        prefab_type_of: &impl Fn(EntityId) -> Option<Vec<EntityId>>,
        create_table: &mut impl FnMut(Vec<EntityId>) -> TableId,
    ) -> (TableId, Arc<Diff>) {
        if let Some(edge) = self.ensure_node(from).add_edges.get(id) {
            return (edge.to, edge.diff.clone());
        }

        let (dest_type, extra) = Self::compute_add_destination(id, from_type, prefab_type_of);
        let to = match self.table_for_type(&dest_type) {
            Some(t) => t,
            None => {
                let t = create_table(dest_type.clone());
                self.register_table(t, &dest_type);
                t
            }
        };

        let diff = if extra.is_empty() {
            empty_diff()
        } else {
            Arc::new(Diff {
                added: extra,
                removed: SmallVec::new(),
            })
        };

        self.ensure_node(from).add_edges.set(
            id,
            Edge {
                to,
                diff: diff.clone(),
            },
        );
        self.ensure_node(to).incoming.push(Incoming { from, id, is_add: true });

        (to, diff)
    }

    /// Symmetric to [`traverse_add`](Self::traverse_add): ensures the edge
    /// for removing `id` from `from_type`, creating the destination table if
    /// it doesn't exist yet.
    pub fn traverse_remove(
        &mut self,
        from: TableId,
        from_type: &[EntityId],
        id: EntityId,
        create_table: &mut impl FnMut(Vec<EntityId>) -> TableId,
    ) -> TableId {
        if let Some(edge) = self.ensure_node(from).remove_edges.get(id) {
            return edge.to;
        }

        let mut dest_type = from_type.to_vec();
        if let Ok(pos) = dest_type.binary_search(&id) {
            dest_type.remove(pos);
        }

        let to = match self.table_for_type(&dest_type) {
            Some(t) => t,
            None => {
                let t = create_table(dest_type.clone());
                self.register_table(t, &dest_type);
                t
            }
        };

        self.ensure_node(from).remove_edges.set(
            id,
            Edge {
                to,
                diff: empty_diff(),
            },
        );
        self.ensure_node(to).incoming.push(Incoming {
            from,
            id,
            is_add: false,
        });

        to
    }

    /// Detaches every edge pointing at `table` (both add- and remove-edges
    /// from other tables) and every edge `table` itself owns, called once
    /// when `table` is freed. Small-id inline slots are zeroed in place;
    /// overflow entries are dropped from the hash map (there is no separate
    /// freelist to return them to — `FxHashMap`'s own allocator handles
    /// reuse).
    pub fn teardown_table(&mut self, table: TableId) {
        let idx = table.raw() as usize;
        if idx >= self.nodes.len() {
            return;
        }
        let incoming = std::mem::take(&mut self.nodes[idx].incoming);
        for inc in incoming {
            let from_idx = inc.from.raw() as usize;
            if from_idx >= self.nodes.len() {
                continue;
            }
            if inc.is_add {
                self.nodes[from_idx].add_edges.remove(inc.id);
            } else {
                self.nodes[from_idx].remove_edges.remove(inc.id);
            }
        }
        self.nodes[idx] = GraphNode::new();
    }

    /// Iterates every outgoing add-edge from `table`, for iterator/debug
    /// tooling that wants to walk the graph without mutating it.
    pub fn add_edges(&self, table: TableId) -> impl Iterator<Item = (EntityId, TableId)> + '_ {
        let idx = table.raw() as usize;
        self.nodes
            .get(idx)
            .into_iter()
            .flat_map(|n| n.add_edges.iter().map(|(id, e)| (id, e.to)))
    }
}

fn insert_sorted(type_ids: &mut Vec<EntityId>, id: EntityId) {
    match type_ids.binary_search(&id) {
        Ok(_) => {}
        Err(pos) => type_ids.insert(pos, id),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: u32) -> EntityId {
        EntityId::from_parts(n, 1)
    }

    fn no_prefab(_: EntityId) -> Option<Vec<EntityId>> {
        None
    }

    #[test]
    fn traverse_add_creates_and_caches_destination_table() {
        let mut graph = Graph::new();
        let root = TableId::from_raw(0);
        graph.register_table(root, &[]);
        let mut next = 1u32;
        let mut create = |_ty: Vec<EntityId>| {
            let t = TableId::from_raw(next);
            next += 1;
            t
        };

        let (to1, _) = graph.traverse_add(root, &[], id(10), &no_prefab, &mut create);
        let (to2, _) = graph.traverse_add(root, &[], id(10), &no_prefab, &mut create);
        assert_eq!(to1, to2, "second traversal must hit the cached edge");
    }

    #[test]
    fn traverse_remove_reaches_the_original_table() {
        let mut graph = Graph::new();
        let root = TableId::from_raw(0);
        graph.register_table(root, &[]);
        let mut next = 1u32;
        let mut create = |_ty: Vec<EntityId>| {
            let t = TableId::from_raw(next);
            next += 1;
            t
        };
        let (with_c, _) = graph.traverse_add(root, &[], id(10), &no_prefab, &mut create);
        let back = graph.traverse_remove(with_c, &[id(10)], id(10), &mut create);
        assert_eq!(back, root);
    }

    #[test]
    fn prefab_traversal_inherits_non_tag_ids() {
        let mut graph = Graph::new();
        let root = TableId::from_raw(0);
        graph.register_table(root, &[]);

        let prefab_component = id(20);
        let prefab_entity = EntityId::from_parts(99, 1);
        let prefab_type = vec![prefab_component, EntityId::from_parts(TAG_PREFAB, 1)];
        let prefab_lookup = |e: EntityId| {
            if e.index() == prefab_entity.index() {
                Some(prefab_type.clone())
            } else {
                None
            }
        };

        let mut next = 1u32;
        let mut create = |_ty: Vec<EntityId>| {
            let t = TableId::from_raw(next);
            next += 1;
            t
        };
        let is_a_prefab = EntityId::pair(RELATION_IS_A, prefab_entity.index());
        let (_, diff) = graph.traverse_add(root, &[], is_a_prefab, &prefab_lookup, &mut create);
        assert!(diff.added.contains(&prefab_component));
        assert!(!diff.added.iter().any(|&e| e.index() == TAG_PREFAB));
    }

    #[test]
    fn teardown_detaches_incoming_edges() {
        let mut graph = Graph::new();
        let root = TableId::from_raw(0);
        graph.register_table(root, &[]);
        let mut next = 1u32;
        let mut create = |_ty: Vec<EntityId>| {
            let t = TableId::from_raw(next);
            next += 1;
            t
        };
        let (with_c, _) = graph.traverse_add(root, &[], id(10), &no_prefab, &mut create);
        graph.teardown_table(with_c);
        assert!(graph.ensure_node(root).add_edges.get(id(10)).is_none());
    }
}
