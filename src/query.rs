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

//! The query cache (spec §4.6): an ordered table list per filter, patched in
//! place as tables transition empty/non-empty, optionally grouped by cascade
//! depth or resorted by entity id, with a per-match dirty monitor.

use rustc_hash::FxHashMap;
use smallvec::{smallvec, SmallVec};

use crate::archetype::TableId;
use crate::consts::INLINE_TERMS;
use crate::entity::EntityId;
use crate::error::CoreError;
use crate::term::{Filter, Term};

/// One table's match record: the resolved storage-column index per term
/// (`None` for tag/filter-only terms), its cascade group id, and the dirty
/// snapshot [`Query::check_table_monitor`] compares against.
#[derive(Clone, Debug)]
pub struct QueryTableMatch {
    pub table: TableId,
    pub columns: SmallVec<[Option<usize>; INLINE_TERMS]>,
    pub group_id: u32,
    table_dirty_snapshot: u32,
    column_dirty_snapshot: SmallVec<[u32; INLINE_TERMS]>,
}

/// Picks the pivot term: the one whose candidate id has the fewest matching
/// tables, per `cache_len`. Only terms with a concrete (non-wildcard) id can
/// serve as pivot, since only those have a component record with a table
/// cache to walk.
pub fn select_pivot(filter: &Filter, cache_len: impl Fn(EntityId) -> usize) -> Option<usize> {
    filter
        .terms
        .iter()
        .enumerate()
        .filter_map(|(i, t)| t.id.map(|id| (i, cache_len(id))))
        .min_by_key(|&(_, len)| len)
        .map(|(i, _)| i)
}

/// A built, matchable query: a filter plus the table list it currently
/// matches. Table membership is maintained incrementally by the world
/// calling [`Query::try_match`]/[`Query::set_empty`]/[`Query::remove_table`]
/// as tables are created, transition empty/non-empty, or are freed — a
/// query never re-runs its own match sweep.
pub struct Query {
    pub filter: Filter,
    pivot_index: usize,
    non_empty: Vec<TableId>,
    empty: Vec<TableId>,
    matches: FxHashMap<TableId, QueryTableMatch>,
    cascading: bool,
    order_by: bool,
}

impl Query {
    /// Builds a query from `filter` and a `pivot_index` chosen by
    /// [`select_pivot`]. Rejects `order_by` combined with a cascade term
    /// (spec open question, resolved as "reject the combination").
    pub fn new(filter: Filter, pivot_index: usize, order_by: bool) -> Result<Self, CoreError> {
        let cascading = filter.cascade_term().is_some();
        if order_by && cascading {
            return Err(CoreError::QueryUnsupported(
                "order_by combined with cascade grouping",
            ));
        }
        Ok(Self {
            filter,
            pivot_index,
            non_empty: Vec::new(),
            empty: Vec::new(),
            matches: FxHashMap::default(),
            cascading,
            order_by,
        })
    }

    pub fn pivot_term(&self) -> &Term {
        &self.filter.terms[self.pivot_index]
    }

    pub fn pivot_index(&self) -> usize {
        self.pivot_index
    }

    /// Tests `table` against every non-pivot term and, on a match, records
    /// its [`QueryTableMatch`] and splices it into the ordered table list
    /// (or the empty list, per `is_empty`). Returns whether it matched.
    pub fn try_match(
        &mut self,
        table_id: TableId,
        type_ids: &[EntityId],
        storage_ids: &[EntityId],
        is_empty: bool,
        group_id: u32,
    ) -> bool {
        if !self.filter.matches_table(type_ids, self.pivot_index) {
            return false;
        }
        let columns: SmallVec<[Option<usize>; INLINE_TERMS]> = self
            .filter
            .terms
            .iter()
            .map(|t| {
                t.id
                    .and_then(|id| storage_ids.iter().position(|&s| s == id))
            })
            .collect();
        let m = QueryTableMatch {
            table: table_id,
            columns,
            group_id,
            table_dirty_snapshot: 0,
            column_dirty_snapshot: smallvec![0; storage_ids.len()],
        };
        if is_empty {
            self.empty.push(table_id);
        } else {
            self.insert_ordered(table_id, group_id);
        }
        self.matches.insert(table_id, m);
        true
    }

    /// Splices `table` into the ordered non-empty list. Without cascade
    /// grouping this is a plain append (iteration order is insertion order);
    /// with cascade grouping, finds the closest existing group id less than
    /// `group_id` and splices before it, keeping groups in ascending
    /// group-id order.
    fn insert_ordered(&mut self, table: TableId, group_id: u32) {
        if !self.cascading {
            self.non_empty.push(table);
            return;
        }
        let mut insert_at = self.non_empty.len();
        for (i, &t) in self.non_empty.iter().enumerate() {
            let other = self.matches.get(&t).map(|m| m.group_id).unwrap_or(0);
            if other > group_id {
                insert_at = i;
                break;
            }
        }
        self.non_empty.insert(insert_at, table);
    }

    /// Patches a table's list membership in place on a `TableEmpty`/
    /// `TableFill` transition, without re-running the match.
    pub fn set_empty(&mut self, table: TableId, is_empty: bool) {
        let group_id = self.matches.get(&table).map(|m| m.group_id).unwrap_or(0);
        if is_empty {
            if let Some(pos) = self.non_empty.iter().position(|&t| t == table) {
                self.non_empty.remove(pos);
                self.empty.push(table);
            }
        } else if let Some(pos) = self.empty.iter().position(|&t| t == table) {
            self.empty.remove(pos);
            self.insert_ordered(table, group_id);
        }
    }

    pub fn remove_table(&mut self, table: TableId) {
        self.non_empty.retain(|&t| t != table);
        self.empty.retain(|&t| t != table);
        self.matches.remove(&table);
    }

    pub fn ordered_tables(&self) -> &[TableId] {
        &self.non_empty
    }

    pub fn empty_tables(&self) -> &[TableId] {
        &self.empty
    }

    pub fn match_for(&self, table: TableId) -> Option<&QueryTableMatch> {
        self.matches.get(&table)
    }

    pub fn uses_order_by(&self) -> bool {
        self.order_by
    }

    /// True when any of `table_dirty`/`column_dirty` differs from the
    /// snapshot recorded at the match's last sync.
    pub fn check_table_monitor(&self, table: TableId, table_dirty: u32, column_dirty: &[u32]) -> bool {
        let Some(m) = self.matches.get(&table) else {
            return false;
        };
        if m.table_dirty_snapshot != table_dirty {
            return true;
        }
        m.column_dirty_snapshot
            .iter()
            .zip(column_dirty)
            .any(|(a, b)| a != b)
    }

    pub fn sync_table_monitor(&mut self, table: TableId, table_dirty: u32, column_dirty: &[u32]) {
        if let Some(m) = self.matches.get_mut(&table) {
            m.table_dirty_snapshot = table_dirty;
            m.column_dirty_snapshot = column_dirty.iter().copied().collect();
        }
    }

    /// N-way merge over each non-empty table's (already sorted-by-entity)
    /// column, producing contiguous `{table, offset, count}` slices in
    /// ascending global entity-id order, for an `order_by` query's iterator
    /// to walk in place of the raw table list. `entities_of` must return
    /// each table's entity column already sorted ascending (callers run
    /// [`crate::archetype::Table::sort_by_entity`] first on any dirty
    /// table). This merges cursor-at-a-time rather than via a binary heap —
    /// query term counts and table counts are small enough in practice that
    /// the simpler O(n*k) merge isn't worth a heap's bookkeeping.
    pub fn order_by_merge(
        &self,
        entities_of: impl Fn(TableId) -> Vec<EntityId>,
    ) -> Vec<(TableId, usize, usize)> {
        let mut cursors: Vec<(TableId, Vec<EntityId>, usize)> = self
            .non_empty
            .iter()
            .map(|&t| (t, entities_of(t), 0))
            .collect();
        let mut slices = Vec::new();
        loop {
            let mut best: Option<usize> = None;
            for (i, (_, ents, pos)) in cursors.iter().enumerate() {
                if *pos >= ents.len() {
                    continue;
                }
                match best {
                    None => best = Some(i),
                    Some(b) => {
                        if ents[*pos] < cursors[b].1[cursors[b].2] {
                            best = Some(i);
                        }
                    }
                }
            }
            let Some(i) = best else { break };
            let start = cursors[i].2;
            let table = cursors[i].0;
            cursors[i].2 += 1;
            while cursors[i].2 < cursors[i].1.len() {
                let next = cursors[i].1[cursors[i].2];
                let is_min = cursors
                    .iter()
                    .enumerate()
                    .all(|(j, (_, ents, pos))| j == i || *pos >= ents.len() || next <= ents[*pos]);
                if !is_min {
                    break;
                }
                cursors[i].2 += 1;
            }
            slices.push((table, start, cursors[i].2 - start));
        }
        slices
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::term::Term;

    fn id(n: u32) -> EntityId {
        EntityId::from_parts(n, 1)
    }

    fn table(n: u32) -> TableId {
        TableId::from_raw(n)
    }

    fn build_filter(ids: &[EntityId]) -> Filter {
        let mut f = Filter::new();
        for &i in ids {
            f = f.with_term(Term::component(i)).unwrap();
        }
        f.build().unwrap()
    }

    #[test]
    fn select_pivot_picks_smallest_cache() {
        let filter = build_filter(&[id(1), id(2)]);
        let pivot = select_pivot(&filter, |i| if i == id(1) { 10 } else { 2 }).unwrap();
        assert_eq!(pivot, 1);
    }

    #[test]
    fn try_match_adds_to_non_empty_list() {
        let filter = build_filter(&[id(1)]);
        let mut q = Query::new(filter, 0, false).unwrap();
        let matched = q.try_match(table(0), &[id(1)], &[id(1)], false, 0);
        assert!(matched);
        assert_eq!(q.ordered_tables(), &[table(0)]);
    }

    #[test]
    fn set_empty_moves_table_between_lists() {
        let filter = build_filter(&[id(1)]);
        let mut q = Query::new(filter, 0, false).unwrap();
        q.try_match(table(0), &[id(1)], &[id(1)], false, 0);
        q.set_empty(table(0), true);
        assert!(q.ordered_tables().is_empty());
        assert_eq!(q.empty_tables(), &[table(0)]);
        q.set_empty(table(0), false);
        assert_eq!(q.ordered_tables(), &[table(0)]);
    }

    #[test]
    fn order_by_and_cascade_combination_is_rejected() {
        let mut filter = build_filter(&[id(1)]);
        filter.terms[0] = filter.terms[0].clone().cascade();
        assert!(matches!(
            Query::new(filter, 0, true),
            Err(CoreError::QueryUnsupported(_))
        ));
    }

    #[test]
    fn order_by_merge_interleaves_tables_by_entity_id() {
        let filter = build_filter(&[id(1)]);
        let mut q = Query::new(filter, 0, false).unwrap();
        q.try_match(table(0), &[id(1)], &[id(1)], false, 0);
        q.try_match(table(1), &[id(1)], &[id(1)], false, 0);

        let a = table(0);
        let b = table(1);
        let entities_of = move |t: TableId| -> Vec<EntityId> {
            if t == a {
                vec![EntityId::from_parts(1, 1), EntityId::from_parts(4, 1)]
            } else {
                vec![EntityId::from_parts(2, 1), EntityId::from_parts(3, 1)]
            }
        };
        let slices = q.order_by_merge(entities_of);
        // entity ids interleave 1,2,3,4 across tables a,b,b,a.
        assert_eq!(slices, vec![(a, 0, 1), (b, 0, 2), (a, 1, 1)]);
    }
}
