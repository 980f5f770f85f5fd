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

//! Walks a [`Query`]'s matched tables, handing out typed column slices per
//! chunk. A chunk is a contiguous row range within one table — the whole
//! table for the serial walk in [`chunks`], a balanced sub-range for the
//! worker split in [`par_for_each`].

use smallvec::SmallVec;

use crate::archetype::{Table, IS_DISABLED, IS_PREFAB};
use crate::consts::INLINE_TERMS;
use crate::entity::EntityId;
use crate::query::Query;

/// One term's resolved column for the current table: a raw pointer to
/// element 0 and the element size, or `None` for a tag/filter-only term.
type TermColumn = Option<(*mut u8, usize)>;

/// A contiguous row range of one matched table, with each term's column
/// already resolved to a raw pointer. Built fresh per table by [`chunks`]/
/// [`par_for_each`] — never stored past the call that produced it, since a
/// table's column pointers move when rows are added or removed.
pub struct TableChunk<'a> {
    table: &'a Table,
    columns: SmallVec<[TermColumn; INLINE_TERMS]>,
    row_start: usize,
    row_len: usize,
    worker_index: Option<usize>,
}

impl<'a> TableChunk<'a> {
    pub fn len(&self) -> usize {
        self.row_len
    }

    pub fn is_empty(&self) -> bool {
        self.row_len == 0
    }

    /// The worker this chunk's row range was assigned to by
    /// [`par_for_each`]'s split, or `None` for the serial [`chunks`]/
    /// [`ordered_chunks`] walk. A caller staging deferred writes from inside
    /// the parallel callback uses this to pick the matching
    /// `World::stage_mut` index to replay them through afterwards.
    pub fn worker_index(&self) -> Option<usize> {
        self.worker_index
    }

    pub fn entities(&self) -> &'a [EntityId] {
        &self.table.entities()[self.row_start..self.row_start + self.row_len]
    }

    /// Reads term `term_index`'s column as `&[T]` over this chunk's row
    /// range. Returns `None` for a tag/filter-only term.
    ///
    /// # Safety
    /// `T` must match the component registered at this term's id — the
    /// chunk has no `TypeId` to check this against.
    pub unsafe fn column<T>(&self, term_index: usize) -> Option<&'a [T]> {
        let (ptr, size) = (*self.columns.get(term_index)?)?;
        debug_assert_eq!(size, std::mem::size_of::<T>());
        let base = ptr.cast::<T>().add(self.row_start);
        Some(std::slice::from_raw_parts(base, self.row_len))
    }

    /// Same as [`column`](Self::column) but mutable. Callers writing through
    /// this slice are responsible for calling
    /// [`Table::mark_modified`]/emitting `OnSet` themselves — the chunk
    /// iterator doesn't track writes on its own.
    ///
    /// # Safety
    /// Same as [`column`](Self::column); additionally the caller must not
    /// alias this with another live reference into the same column.
    pub unsafe fn column_mut<T>(&self, term_index: usize) -> Option<&'a mut [T]> {
        let (ptr, size) = (*self.columns.get(term_index)?)?;
        debug_assert_eq!(size, std::mem::size_of::<T>());
        let base = ptr.cast::<T>().add(self.row_start);
        Some(std::slice::from_raw_parts_mut(base, self.row_len))
    }

    pub fn table(&self) -> &'a Table {
        self.table
    }
}

fn resolve_columns(
    query: &Query,
    table: &Table,
) -> Option<SmallVec<[TermColumn; INLINE_TERMS]>> {
    let m = query.match_for(table.id())?;
    Some(
        m.columns
            .iter()
            .map(|opt| {
                opt.and_then(|storage_index| {
                    let ptr = table.column_ptr(storage_index)?;
                    let size = table.column_element_size(storage_index)?;
                    Some((ptr, size))
                })
            })
            .collect(),
    )
}

fn skip_table(table: &Table) -> bool {
    table.has_flag(IS_PREFAB) || table.has_flag(IS_DISABLED)
}

/// Serial walk of `query`'s matched tables (or, for an `order_by` query, the
/// slices from [`Query::order_by_merge`]), each handed out as one whole-table
/// [`TableChunk`]. `tables` is the world's table arena, indexed by
/// `TableId::raw()`.
pub fn chunks<'a>(query: &'a Query, tables: &'a [Table]) -> impl Iterator<Item = TableChunk<'a>> + 'a {
    query.ordered_tables().iter().filter_map(move |&tid| {
        let table = tables.get(tid.raw() as usize)?;
        if skip_table(table) {
            return None;
        }
        let columns = resolve_columns(query, table)?;
        Some(TableChunk {
            table,
            columns,
            row_start: 0,
            row_len: table.len(),
            worker_index: None,
        })
    })
}

/// Same as [`chunks`] but walking the ordering produced by
/// [`Query::order_by_merge`] instead of raw table order.
pub fn ordered_chunks<'a>(
    query: &'a Query,
    tables: &'a [Table],
    slices: &'a [(crate::archetype::TableId, usize, usize)],
) -> impl Iterator<Item = TableChunk<'a>> + 'a {
    slices.iter().filter_map(move |&(tid, start, len)| {
        let table = tables.get(tid.raw() as usize)?;
        if skip_table(table) {
            return None;
        }
        let columns = resolve_columns(query, table)?;
        Some(TableChunk {
            table,
            columns,
            row_start: start,
            row_len: len,
            worker_index: None,
        })
    })
}

/// Splits `n` rows into `count` ranges `[index*n/count, (index+1)*n/count)`
/// with the remainder distributed one-each to the lowest-index workers
/// (spec §4.7). Returns `(start, end)`; `start == end` for a worker that
/// gets no rows because `count > n`.
fn split_range(n: usize, index: usize, count: usize) -> (usize, usize) {
    let base = n / count;
    let remainder = n % count;
    let start = index * base + index.min(remainder);
    let extra = usize::from(index < remainder);
    (start, start + base + extra)
}

/// Wraps a raw pointer bundle so it can cross a `rayon` scope boundary —
/// mirrors the donor's `parallel.rs` cast-to-`usize`-and-back trick, except
/// the pointer never actually leaves the struct: each worker only ever reads
/// the range of rows assigned to it, and no two workers' ranges overlap.
struct WorkerJob<'a> {
    worker_index: usize,
    table: &'a Table,
    columns: SmallVec<[TermColumn; INLINE_TERMS]>,
    row_start: usize,
    row_len: usize,
}

unsafe impl<'a> Send for WorkerJob<'a> {}
unsafe impl<'a> Sync for WorkerJob<'a> {}

/// Builds one job per (table, worker) pair whose worker actually gets rows:
/// for each of `query`'s matched tables independently, the table's row
/// range is split `[index·N/count, (index+1)·N/count)` across
/// `0..num_workers`, remainder going to the low-index workers (spec §4.7,
/// "computed per chained batch, not per query" — a "chained batch" here is
/// one matched table).
fn build_jobs<'a>(query: &'a Query, tables: &'a [Table], num_workers: usize) -> Vec<WorkerJob<'a>> {
    let workers = num_workers.max(1);
    let matched: Vec<&Table> = query
        .ordered_tables()
        .iter()
        .filter_map(|&tid| tables.get(tid.raw() as usize))
        .filter(|t| !skip_table(t))
        .collect();

    let mut jobs = Vec::new();
    for table in matched {
        let n = table.len();
        if n == 0 {
            continue;
        }
        let Some(columns) = resolve_columns(query, table) else {
            continue;
        };
        for index in 0..workers {
            let (start, end) = split_range(n, index, workers);
            if start == end {
                continue;
            }
            jobs.push(WorkerJob {
                worker_index: index,
                table,
                columns: columns.clone(),
                row_start: start,
                row_len: end - start,
            });
        }
    }
    jobs
}

/// Splits each of `query`'s matched tables into `num_workers` index-
/// proportional row ranges (spec §4.7) and runs `f` over each range in
/// parallel via `rayon`. Every chunk's
/// [`worker_index`](TableChunk::worker_index) reports which of the
/// `num_workers` logical slots its range belongs to.
#[cfg(feature = "parallel")]
pub fn par_for_each<'a, F>(query: &'a Query, tables: &'a [Table], num_workers: usize, f: F)
where
    F: Fn(TableChunk<'a>) + Send + Sync,
{
    use rayon::prelude::*;

    let jobs = build_jobs(query, tables, num_workers);
    jobs.into_par_iter().for_each(|job| {
        let chunk = TableChunk {
            table: job.table,
            columns: job.columns,
            row_start: job.row_start,
            row_len: job.row_len,
            worker_index: Some(job.worker_index),
        };
        f(chunk);
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archetype::TableId;
    use crate::component::{ComponentHooks, ComponentTypeInfo};
    use crate::query::Query;
    use crate::term::{Filter, Term};

    fn id(n: u32) -> EntityId {
        EntityId::from_parts(n, 1)
    }

    fn position_info() -> ComponentTypeInfo {
        ComponentTypeInfo::new(8, 4, ComponentHooks::default())
    }

    fn build_table(tid: u32, entities: &[EntityId]) -> Table {
        let position = id(1);
        let lookup = move |i: EntityId| if i == position { Some(position_info()) } else { None };
        let mut table = Table::new(TableId::from_raw(tid), vec![position], &lookup);
        for &e in entities {
            table.append_new_entity(e, true, &|_| position_info());
        }
        table
    }

    #[test]
    fn chunks_yields_whole_table_with_resolved_columns() {
        let position = id(1);
        let table = build_table(0, &[id(100), id(101)]);
        let tables = vec![table];

        let filter = Filter::new()
            .with_term(Term::component(position))
            .unwrap()
            .build()
            .unwrap();
        let mut query = Query::new(filter, 0, false).unwrap();
        query.try_match(
            tables[0].id(),
            tables[0].type_ids(),
            tables[0].storage_ids(),
            tables[0].is_empty(),
            0,
        );

        let all: Vec<_> = chunks(&query, &tables).collect();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].len(), 2);
        assert_eq!(all[0].entities(), &[id(100), id(101)]);
        unsafe {
            let slice = all[0].column::<[f32; 2]>(0).unwrap();
            assert_eq!(slice.len(), 2);
        }
    }

    #[test]
    fn prefab_tables_are_skipped() {
        use crate::archetype::IS_PREFAB;
        let position = id(1);
        let mut table = build_table(0, &[id(100)]);
        // Synthesize a prefab-flagged table by rebuilding with the tag id
        // present in its type (flags are derived in Table::new from type ids,
        // so we can't just poke the bitflag directly on an existing table).
        let prefab_tag = EntityId::from_parts(crate::consts::TAG_PREFAB, 0);
        let lookup = move |i: EntityId| if i == position { Some(position_info()) } else { None };
        let mut type_ids = vec![prefab_tag, position];
        type_ids.sort();
        table = Table::new(TableId::from_raw(0), type_ids, &lookup);
        table.append_new_entity(id(100), true, &|_| position_info());
        assert!(table.has_flag(IS_PREFAB));

        let tables = vec![table];
        let filter = Filter::new()
            .with_term(Term::component(position))
            .unwrap()
            .build()
            .unwrap();
        let mut query = Query::new(filter, 0, false).unwrap();
        query.try_match(
            tables[0].id(),
            tables[0].type_ids(),
            tables[0].storage_ids(),
            tables[0].is_empty(),
            0,
        );

        assert_eq!(chunks(&query, &tables).count(), 0);
    }

    #[test]
    fn build_jobs_splits_rows_across_workers() {
        let position = id(1);
        let table = build_table(0, &[id(1), id(2), id(3), id(4)]);
        let tables = vec![table];
        let filter = Filter::new()
            .with_term(Term::component(position))
            .unwrap()
            .build()
            .unwrap();
        let mut query = Query::new(filter, 0, false).unwrap();
        query.try_match(
            tables[0].id(),
            tables[0].type_ids(),
            tables[0].storage_ids(),
            tables[0].is_empty(),
            0,
        );

        let jobs = build_jobs(&query, &tables, 2);
        let total: usize = jobs.iter().map(|j| j.row_len).sum();
        assert_eq!(total, 4);
        assert!(jobs.len() <= 2);
    }

    #[test]
    fn split_range_distributes_remainder_to_low_index_workers() {
        assert_eq!(split_range(4, 0, 2), (0, 2));
        assert_eq!(split_range(4, 1, 2), (2, 4));

        // 5 rows over 2 workers: the remainder goes to worker 0.
        assert_eq!(split_range(5, 0, 2), (0, 3));
        assert_eq!(split_range(5, 1, 2), (3, 5));

        // more workers than rows: high-index workers get an empty range.
        assert_eq!(split_range(2, 0, 3), (0, 1));
        assert_eq!(split_range(2, 1, 3), (1, 2));
        assert_eq!(split_range(2, 2, 3), (2, 2));
    }

    #[test]
    fn build_jobs_tags_each_job_with_its_worker_index() {
        let position = id(1);
        let table = build_table(0, &[id(1), id(2), id(3), id(4), id(5)]);
        let tables = vec![table];
        let filter = Filter::new()
            .with_term(Term::component(position))
            .unwrap()
            .build()
            .unwrap();
        let mut query = Query::new(filter, 0, false).unwrap();
        query.try_match(
            tables[0].id(),
            tables[0].type_ids(),
            tables[0].storage_ids(),
            tables[0].is_empty(),
            0,
        );

        let jobs = build_jobs(&query, &tables, 2);
        assert_eq!(jobs.len(), 2);
        assert_eq!((jobs[0].worker_index, jobs[0].row_start, jobs[0].row_len), (0, 0, 3));
        assert_eq!((jobs[1].worker_index, jobs[1].row_start, jobs[1].row_len), (1, 3, 2));
    }
}
