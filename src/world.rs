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

//! The world: owns the entity index, the table arena, the archetype graph,
//! component records, observers, and the deferred-command stages, and wires
//! them together into the mutation primitives (spec §4.2/§4.8) and the
//! query registry (§4.6).

use rustc_hash::FxHashMap;

#[cfg(feature = "profiling")]
use tracing::trace;

use crate::archetype::{move_row, Table, TableId};
use crate::component::{ComponentHooks, ComponentIndex, ComponentTypeInfo};
use crate::consts::{EVENT_ON_ADD, EVENT_ON_REMOVE, EVENT_ON_SET, TAG_DISABLED};
use crate::entity::{EntityId, EntityIndex};
use crate::error::{CoreError, Result};
use crate::graph::Graph;
use crate::hierarchy;
use crate::iter::{self, TableChunk};
use crate::observer::{Observable, ObserverFn, ObserverId};
use crate::query::{select_pivot, Query};
use crate::stage::{OpKind, Stage};
use crate::term::Filter;

/// Function-pointer hooks a host can supply in place of Rust's global
/// allocator / `crossbeam::thread::scope`, mirroring the donor's platform
/// abstraction layer. All `None` by default — every hook in this crate that
/// would consult `SystemApi` falls back to the Rust-native equivalent
/// instead when unset (see DESIGN.md); no call site currently threads these
/// through to `archetype::Column`'s allocation path.
#[derive(Clone, Copy, Default)]
pub struct SystemApi {
    pub malloc: Option<fn(usize) -> *mut u8>,
    pub calloc: Option<fn(usize, usize) -> *mut u8>,
    pub realloc: Option<fn(*mut u8, usize) -> *mut u8>,
    pub free: Option<fn(*mut u8)>,
    pub strdup: Option<fn(&str) -> Box<str>>,
    pub thread_run: Option<fn(usize, fn(usize))>,
    pub thread_sync: Option<fn()>,
}

/// World-wide tunables (spec §4.9 / SPEC_FULL.md §4): initial table/hashmap
/// capacity hints, how many [`Stage`]s to allocate for a parallel system run,
/// and the optional [`SystemApi`] override.
#[derive(Clone, Copy)]
pub struct WorldConfig {
    pub table_capacity: usize,
    pub hashmap_capacity: usize,
    pub worker_stage_count: usize,
    pub system_api: SystemApi,
}

impl Default for WorldConfig {
    fn default() -> Self {
        Self {
            table_capacity: 64,
            hashmap_capacity: 128,
            worker_stage_count: 1,
            system_api: SystemApi::default(),
        }
    }
}

pub type QueryId = u32;

fn type_info_closure(components: &ComponentIndex) -> impl Fn(EntityId) -> ComponentTypeInfo + '_ {
    move |id: EntityId| {
        components
            .get(id)
            .and_then(|r| r.type_info)
            .unwrap_or_else(ComponentTypeInfo::tag)
    }
}

fn optional_type_info_closure(components: &ComponentIndex) -> impl Fn(EntityId) -> Option<ComponentTypeInfo> + '_ {
    move |id: EntityId| components.get(id).and_then(|r| r.type_info)
}

fn no_type_info(_: EntityId) -> ComponentTypeInfo {
    unreachable!("the root table has no storage columns")
}

/// Borrows two distinct elements of `v` mutably at once. Panics if `a == b`
/// or either index is out of range — the world never calls this with the
/// same table on both sides (an add/remove edge always changes a table's
/// type, so source and destination are always distinct tables).
fn two_mut<T>(v: &mut [T], a: usize, b: usize) -> (&mut T, &mut T) {
    assert_ne!(a, b, "two_mut requires distinct indices");
    if a < b {
        let (left, right) = v.split_at_mut(b);
        (&mut left[a], &mut right[0])
    } else {
        let (left, right) = v.split_at_mut(a);
        (&mut right[0], &mut left[b])
    }
}

/// The archetype world: every entity, table, and the graph connecting them,
/// plus the registries (components, observers, queries) layered on top.
pub struct World {
    entities: EntityIndex,
    tables: Vec<Table>,
    graph: Graph,
    components: ComponentIndex,
    observable: Observable,
    stages: Vec<Stage>,
    queries: FxHashMap<QueryId, Query>,
    next_query_id: QueryId,
    config: WorldConfig,
    /// Table empty/non-empty transitions queued since the last
    /// [`flush_pending_tables`](World::flush_pending_tables) (spec §2/§4.8):
    /// keyed by table so a table that flickers before the next flush only
    /// ever replays its latest state.
    pending_tables: FxHashMap<TableId, bool>,
}

impl Default for World {
    fn default() -> Self {
        Self::new()
    }
}

impl World {
    pub fn new() -> Self {
        Self::with_config(WorldConfig::default())
    }

    pub fn with_config(config: WorldConfig) -> Self {
        let mut graph = Graph::new();
        let root = TableId::from_raw(0);
        let root_table = Table::new(root, Vec::new(), &|_| None);
        graph.register_table(root, &[]);

        let worker_stage_count = config.worker_stage_count.max(1);
        let stages = (0..worker_stage_count).map(|_| Stage::new()).collect();

        Self {
            entities: EntityIndex::new(),
            tables: vec![root_table],
            graph,
            components: ComponentIndex::new(),
            observable: Observable::new(),
            stages,
            queries: FxHashMap::default(),
            next_query_id: 0,
            config,
            pending_tables: FxHashMap::default(),
        }
    }

    pub fn config(&self) -> &WorldConfig {
        &self.config
    }

    // ---- component registration -------------------------------------

    pub fn register_component(&mut self, id: EntityId, size: usize, alignment: usize, hooks: ComponentHooks) {
        self.components
            .set_type_info(id, ComponentTypeInfo::new(size, alignment, hooks));
    }

    pub fn register_tag(&mut self, id: EntityId) {
        self.components.ensure(id);
    }

    pub fn is_alive(&self, entity: EntityId) -> bool {
        self.entities.is_alive(entity)
    }

    pub fn has(&self, entity: EntityId, id: EntityId) -> Result<bool> {
        let info = self.entities.get(entity).ok_or(CoreError::EntityNotFound)?;
        let Some(table) = info.table else {
            return Ok(false);
        };
        Ok(self.tables[table.raw() as usize]
            .type_ids()
            .binary_search(&id)
            .is_ok())
    }

    pub fn entity_type(&self, entity: EntityId) -> Result<&[EntityId]> {
        let info = self.entities.get(entity).ok_or(CoreError::EntityNotFound)?;
        match info.table {
            Some(table) => Ok(self.tables[table.raw() as usize].type_ids()),
            None => Ok(&[]),
        }
    }

    // ---- table transitions / query + observer notification ----------

    /// Queues an empty/non-empty table transition rather than applying it
    /// immediately (spec §2: "queued in a pending-tables buffer, flushed on
    /// iterator entry"). A table that flips more than once before the next
    /// flush only keeps its latest state — the map overwrites in place.
    fn notify_table_transition(&mut self, table: TableId, is_empty: bool) {
        self.pending_tables.insert(table, is_empty);
    }

    /// Drains the pending-tables buffer, patching every query's cache and
    /// emitting `TableEmpty`/`TableFill` to observers for each table that
    /// flipped state since the last flush. Spec §5: only called outside a
    /// readonly window; callers (`query_chunks`/`query_chunks_ordered`/
    /// `query_par_for_each`/`end_readonly`) never call it while
    /// [`is_readonly`](World::is_readonly) is still true.
    fn flush_pending_tables(&mut self) {
        if self.pending_tables.is_empty() {
            return;
        }
        let pending = std::mem::take(&mut self.pending_tables);
        for (table, is_empty) in pending {
            let type_ids = self.tables[table.raw() as usize].type_ids().to_vec();
            for q in self.queries.values_mut() {
                q.set_empty(table, is_empty);
            }
            let event = EntityId::from_parts(
                if is_empty {
                    crate::consts::EVENT_TABLE_EMPTY
                } else {
                    crate::consts::EVENT_TABLE_FILL
                },
                0,
            );
            self.observable.emit_table_event(event, &type_ids);
        }
    }

    fn group_id_for(&self, type_ids: &[EntityId]) -> u32 {
        hierarchy::cascade_depth(type_ids, &|parent| {
            self.entities
                .info_by_index(parent.index())
                .and_then(|info| info.table)
                .map(|t| self.tables[t.raw() as usize].type_ids().to_vec())
        })
    }

    // ---- entity creation / destruction --------------------------------

    fn apply_new(&mut self, entity: EntityId) {
        let root = TableId::from_raw(0);
        let was_empty = self.tables[0].is_empty();
        let row = self.tables[0].append_new_entity(entity, true, &no_type_info);
        if let Some(info) = self.entities.get_mut(entity) {
            info.table = Some(root);
            info.row = row;
        }
        if was_empty {
            self.notify_table_transition(root, false);
        }
        #[cfg(feature = "profiling")]
        trace!(entity = entity.index(), "world.spawn");
    }

    /// Allocates a fresh entity id. If the active stage is deferred, the id
    /// is reserved immediately but placement into the root table is staged
    /// (spec: entity-id reservation is never deferred, structural placement
    /// is).
    pub fn spawn(&mut self) -> EntityId {
        self.spawn_on_stage(0)
    }

    /// Same as [`spawn`](Self::spawn) but routes any deferred placement
    /// through worker stage `stage` instead of stage 0 — the entry point a
    /// parallel system's worker `stage` uses so its writes replay on its own
    /// queue (spec §5: "across stages, the drain order is stage-index
    /// order").
    pub fn spawn_on_stage(&mut self, stage: usize) -> EntityId {
        let entity = self.entities.create();
        if self.stages[stage].is_deferred() {
            self.stages[stage].push_new(entity);
        } else {
            self.apply_new(entity);
        }
        entity
    }

    pub fn despawn(&mut self, entity: EntityId) -> Result<()> {
        self.despawn_on_stage(0, entity)
    }

    pub fn despawn_on_stage(&mut self, stage: usize, entity: EntityId) -> Result<()> {
        if self.stages[stage].is_deferred() {
            self.stages[stage].push_delete(entity);
            return Ok(());
        }
        self.despawn_now(entity)
    }

    fn despawn_now(&mut self, entity: EntityId) -> Result<()> {
        let info = *self.entities.get(entity).ok_or(CoreError::EntityNotFound)?;
        let Some(table_id) = info.table else {
            self.entities.delete(entity);
            return Ok(());
        };
        let row = info.row;
        let type_ids = self.tables[table_id.raw() as usize].type_ids().to_vec();
        let on_remove = EntityId::from_parts(EVENT_ON_REMOVE, 0);
        for &id in &type_ids {
            self.observable.emit(on_remove, id, entity, &type_ids);
        }

        let swapped = {
            let World { tables, components, .. } = self;
            let type_info = type_info_closure(components);
            tables[table_id.raw() as usize].delete_entity(row, true, &type_info)
        };
        if let Some(swapped_entity) = swapped {
            if let Some(swapped_info) = self.entities.get_mut(swapped_entity) {
                swapped_info.row = row;
            }
        }
        self.entities.delete(entity);
        if self.tables[table_id.raw() as usize].is_empty() {
            self.notify_table_transition(table_id, true);
        }
        #[cfg(feature = "profiling")]
        trace!(entity = entity.index(), "world.despawn");
        Ok(())
    }

    // ---- graph traversal helpers ---------------------------------------

    /// Resolves (creating if necessary) the destination table for adding
    /// `id` to `from`'s type. The `create_table` closure only allocates the
    /// `Table` and registers it into each of its ids' component caches —
    /// `Graph::traverse_add` registers the table into the graph itself once
    /// this closure returns.
    fn table_after_add(&mut self, from: TableId, id: EntityId) -> (TableId, std::sync::Arc<crate::graph::Diff>) {
        let from_type = self.tables[from.raw() as usize].type_ids().to_vec();

        // The prefab-traversal closure must not hold a live borrow of
        // `self.tables`/`self.entities`, since `create_table` below needs to
        // mutably borrow `self.tables` within the same `traverse_add` call.
        // `compute_add_destination` only ever resolves `id`'s own prefab
        // object once, so an eager snapshot is equivalent to a live lookup.
        let prefab_snapshot: Option<Vec<EntityId>> = if id.is_pair() && id.pair_relation() == crate::consts::RELATION_IS_A {
            let prefab_index = id.pair_object();
            self.entities
                .info_by_index(prefab_index)
                .and_then(|info| info.table)
                .map(|t| self.tables[t.raw() as usize].type_ids().to_vec())
        } else {
            None
        };
        let prefab_type_of = move |_: EntityId| prefab_snapshot.clone();

        let World {
            graph,
            tables,
            components,
            ..
        } = self;
        let mut create_table = |type_ids: Vec<EntityId>| {
            let new_id = TableId::from_raw(tables.len() as u32);
            let lookup = optional_type_info_closure(components);
            let table = Table::new(new_id, type_ids.clone(), &lookup);
            tables.push(table);
            for &tid in &type_ids {
                components.ensure(tid).cache.insert(new_id, true);
            }
            new_id
        };

        graph.traverse_add(from, &from_type, id, &prefab_type_of, &mut create_table)
    }

    fn table_after_remove(&mut self, from: TableId, id: EntityId) -> TableId {
        let from_type = self.tables[from.raw() as usize].type_ids().to_vec();
        let World {
            graph,
            tables,
            components,
            ..
        } = self;
        let mut create_table = |type_ids: Vec<EntityId>| {
            let new_id = TableId::from_raw(tables.len() as u32);
            let lookup = optional_type_info_closure(components);
            let table = Table::new(new_id, type_ids.clone(), &lookup);
            tables.push(table);
            for &tid in &type_ids {
                components.ensure(tid).cache.insert(new_id, true);
            }
            new_id
        };
        graph.traverse_remove(from, &from_type, id, &mut create_table)
    }

    fn relocate_row(&mut self, from: TableId, row: usize, to: TableId) -> (usize, Option<EntityId>) {
        let World { tables, components, .. } = self;
        let type_info = type_info_closure(components);
        let (src, dst) = two_mut(tables, from.raw() as usize, to.raw() as usize);
        move_row(src, row, dst, true, true, &type_info)
    }

    /// Moves `entity`'s row from `from` to `to`, patching both its own
    /// location and whichever entity got swapped into `row` by the source
    /// table's bookkeeping-only delete, then fires the empty/non-empty table
    /// transition on whichever side crossed zero.
    fn apply_relocation(&mut self, entity: EntityId, from: TableId, row: usize, to: TableId) {
        let (new_row, swapped) = self.relocate_row(from, row, to);
        if let Some(swapped_entity) = swapped {
            if let Some(info) = self.entities.get_mut(swapped_entity) {
                info.row = row;
            }
        }
        if let Some(info) = self.entities.get_mut(entity) {
            info.table = Some(to);
            info.row = new_row;
        }
        if self.tables[from.raw() as usize].is_empty() {
            self.notify_table_transition(from, true);
        }
        if self.tables[to.raw() as usize].len() == 1 {
            self.notify_table_transition(to, false);
        }
    }

    // ---- add / remove / clear / enable / disable -----------------------

    fn add_id_now(&mut self, entity: EntityId, id: EntityId) -> Result<()> {
        let info = *self.entities.get(entity).ok_or(CoreError::EntityNotFound)?;
        let from = info.table.ok_or(CoreError::EntityNotFound)?;
        let row = info.row;
        let from_type = self.tables[from.raw() as usize].type_ids().to_vec();
        if from_type.binary_search(&id).is_ok() {
            return Ok(());
        }

        let (to, diff) = self.table_after_add(from, id);
        self.apply_relocation(entity, from, row, to);

        let dst_type = self.tables[to.raw() as usize].type_ids().to_vec();
        let on_add = EntityId::from_parts(EVENT_ON_ADD, 0);
        self.observable.emit(on_add, id, entity, &dst_type);
        for &extra in &diff.added {
            self.observable.emit(on_add, extra, entity, &dst_type);
        }
        #[cfg(feature = "profiling")]
        trace!(entity = entity.index(), id = id.index(), "world.add");
        Ok(())
    }

    fn remove_id_now(&mut self, entity: EntityId, id: EntityId) -> Result<()> {
        let info = *self.entities.get(entity).ok_or(CoreError::EntityNotFound)?;
        let from = info.table.ok_or(CoreError::EntityNotFound)?;
        let row = info.row;
        let from_type = self.tables[from.raw() as usize].type_ids().to_vec();
        if from_type.binary_search(&id).is_err() {
            // No-op on double-remove (spec §9 open question, resolved this way).
            return Ok(());
        }

        let on_remove = EntityId::from_parts(EVENT_ON_REMOVE, 0);
        self.observable.emit(on_remove, id, entity, &from_type);

        let to = self.table_after_remove(from, id);
        self.apply_relocation(entity, from, row, to);
        #[cfg(feature = "profiling")]
        trace!(entity = entity.index(), id = id.index(), "world.remove");
        Ok(())
    }

    pub fn add(&mut self, entity: EntityId, id: EntityId) -> Result<()> {
        self.add_on_stage(0, entity, id)
    }

    pub fn add_on_stage(&mut self, stage: usize, entity: EntityId, id: EntityId) -> Result<()> {
        if self.stages[stage].is_deferred() {
            self.stages[stage].push_add(entity, id);
            return Ok(());
        }
        self.add_id_now(entity, id)
    }

    pub fn remove(&mut self, entity: EntityId, id: EntityId) -> Result<()> {
        self.remove_on_stage(0, entity, id)
    }

    pub fn remove_on_stage(&mut self, stage: usize, entity: EntityId, id: EntityId) -> Result<()> {
        if self.stages[stage].is_deferred() {
            self.stages[stage].push_remove(entity, id);
            return Ok(());
        }
        self.remove_id_now(entity, id)
    }

    /// Removes every component/tag/relation from `entity`, relocating it
    /// back to the empty root table. The entity itself stays alive.
    pub fn clear(&mut self, entity: EntityId) -> Result<()> {
        self.clear_on_stage(0, entity)
    }

    pub fn clear_on_stage(&mut self, stage: usize, entity: EntityId) -> Result<()> {
        if self.stages[stage].is_deferred() {
            self.stages[stage].push_clear(entity);
            return Ok(());
        }
        self.clear_now(entity)
    }

    fn clear_now(&mut self, entity: EntityId) -> Result<()> {
        let info = *self.entities.get(entity).ok_or(CoreError::EntityNotFound)?;
        let Some(from) = info.table else { return Ok(()) };
        let row = info.row;
        if from == TableId::from_raw(0) {
            return Ok(());
        }
        let from_type = self.tables[from.raw() as usize].type_ids().to_vec();
        let on_remove = EntityId::from_parts(EVENT_ON_REMOVE, 0);
        for &id in &from_type {
            self.observable.emit(on_remove, id, entity, &from_type);
        }
        self.apply_relocation(entity, from, row, TableId::from_raw(0));
        Ok(())
    }

    pub fn enable(&mut self, entity: EntityId) -> Result<()> {
        self.enable_on_stage(0, entity)
    }

    pub fn enable_on_stage(&mut self, stage: usize, entity: EntityId) -> Result<()> {
        if self.stages[stage].is_deferred() {
            self.stages[stage].push_enable(entity);
            return Ok(());
        }
        let disabled = EntityId::from_parts(TAG_DISABLED, 0);
        self.remove_id_now(entity, disabled)
    }

    pub fn disable(&mut self, entity: EntityId) -> Result<()> {
        self.disable_on_stage(0, entity)
    }

    pub fn disable_on_stage(&mut self, stage: usize, entity: EntityId) -> Result<()> {
        if self.stages[stage].is_deferred() {
            self.stages[stage].push_disable(entity);
            return Ok(());
        }
        let disabled = EntityId::from_parts(TAG_DISABLED, 0);
        self.add_id_now(entity, disabled)
    }

    /// Spawns a new entity as an instance of `prefab` (spec §4.3 "Prefab
    /// traversal"): adds the `(IsA, prefab)` pair — which, via the archetype
    /// graph, also brings in every one of the prefab's own non-tag ids —
    /// then copy-constructs each inherited storage column's bytes from the
    /// prefab's row onto the instance's row. `table_after_add` only extends
    /// the destination *type*; new storage columns it creates are still
    /// default-constructed, so the value copy here is a second, explicit
    /// step the graph traversal alone can't express.
    pub fn instantiate(&mut self, prefab: EntityId) -> Result<EntityId> {
        let entity = self.spawn();
        let is_a_prefab = EntityId::pair(crate::consts::RELATION_IS_A, prefab.index());
        self.add_id_now(entity, is_a_prefab)?;

        let prefab_type = self.entity_type(prefab)?.to_vec();
        for id in prefab_type {
            if id.is_pair() || id.index() == crate::consts::TAG_PREFAB {
                continue;
            }
            if let Some(bytes) = self.get_raw(prefab, id)?.map(|b| b.to_vec()) {
                self.set_raw_now(entity, id, &bytes)?;
            }
        }
        Ok(entity)
    }

    // ---- component data access -----------------------------------------

    pub fn get_raw(&self, entity: EntityId, id: EntityId) -> Result<Option<&[u8]>> {
        let info = self.entities.get(entity).ok_or(CoreError::EntityNotFound)?;
        let Some(table_id) = info.table else { return Ok(None) };
        let table = &self.tables[table_id.raw() as usize];
        let Some(storage_index) = table.storage_index_of(id) else {
            return Ok(None);
        };
        let Some(ptr) = table.column_ptr(storage_index) else {
            return Ok(None);
        };
        let size = table.column_element_size(storage_index).unwrap_or(0);
        let row = info.row;
        Ok(Some(unsafe {
            std::slice::from_raw_parts(ptr.add(row * size) as *const u8, size)
        }))
    }

    /// Mutable access to `id`'s bytes on `entity`, without marking the
    /// column dirty — callers must follow up with [`World::modified`] (spec
    /// distinguishes "write through a pointer" from "declare the write
    /// done", matching the `Mut`/`Modified` staged-op split in `stage.rs`).
    pub fn get_mut_raw(&mut self, entity: EntityId, id: EntityId) -> Result<Option<&mut [u8]>> {
        let info = *self.entities.get(entity).ok_or(CoreError::EntityNotFound)?;
        let Some(table_id) = info.table else { return Ok(None) };
        let row = info.row;
        let table = &mut self.tables[table_id.raw() as usize];
        let Some(storage_index) = table.storage_index_of(id) else {
            return Ok(None);
        };
        let Some(ptr) = table.column_ptr(storage_index) else {
            return Ok(None);
        };
        let size = table.column_element_size(storage_index).unwrap_or(0);
        Ok(Some(unsafe {
            std::slice::from_raw_parts_mut(ptr.add(row * size), size)
        }))
    }

    pub fn set_raw(&mut self, entity: EntityId, id: EntityId, bytes: &[u8]) -> Result<()> {
        self.set_raw_on_stage(0, entity, id, bytes)
    }

    pub fn set_raw_on_stage(&mut self, stage: usize, entity: EntityId, id: EntityId, bytes: &[u8]) -> Result<()> {
        if self.stages[stage].is_deferred() {
            self.stages[stage].push_set(entity, id, bytes);
            return Ok(());
        }
        self.set_raw_now(entity, id, bytes)
    }

    fn set_raw_now(&mut self, entity: EntityId, id: EntityId, bytes: &[u8]) -> Result<()> {
        let info = *self.entities.get(entity).ok_or(CoreError::EntityNotFound)?;
        let needs_add = match info.table {
            Some(table) => self.tables[table.raw() as usize]
                .type_ids()
                .binary_search(&id)
                .is_err(),
            None => true,
        };
        if needs_add {
            self.add_id_now(entity, id)?;
        }

        let info = *self.entities.get(entity).ok_or(CoreError::EntityNotFound)?;
        let table_id = info.table.ok_or(CoreError::EntityNotFound)?;
        let row = info.row;

        let type_ids;
        {
            let table = &mut self.tables[table_id.raw() as usize];
            let storage_index = table.storage_index_of(id).ok_or(CoreError::InvalidComponent)?;
            let ptr = table.column_ptr(storage_index).ok_or(CoreError::InvalidComponent)?;
            let size = table
                .column_element_size(storage_index)
                .ok_or(CoreError::InvalidComponent)?;
            if size != bytes.len() {
                return Err(CoreError::InvalidComponent);
            }
            unsafe {
                std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr.add(row * size), size);
            }
            table.mark_modified(storage_index);
            type_ids = table.type_ids().to_vec();
        }
        let on_set = EntityId::from_parts(EVENT_ON_SET, 0);
        self.observable.emit(on_set, id, entity, &type_ids);
        Ok(())
    }

    pub fn modified(&mut self, entity: EntityId, id: EntityId) -> Result<()> {
        self.modified_on_stage(0, entity, id)
    }

    pub fn modified_on_stage(&mut self, stage: usize, entity: EntityId, id: EntityId) -> Result<()> {
        if self.stages[stage].is_deferred() {
            self.stages[stage].push_modified(entity, id);
            return Ok(());
        }
        self.modified_now(entity, id)
    }

    fn modified_now(&mut self, entity: EntityId, id: EntityId) -> Result<()> {
        let info = *self.entities.get(entity).ok_or(CoreError::EntityNotFound)?;
        let Some(table_id) = info.table else { return Ok(()) };
        let type_ids;
        {
            let table = &mut self.tables[table_id.raw() as usize];
            let Some(storage_index) = table.storage_index_of(id) else {
                return Ok(());
            };
            table.mark_modified(storage_index);
            type_ids = table.type_ids().to_vec();
        }
        let on_set = EntityId::from_parts(EVENT_ON_SET, 0);
        self.observable.emit(on_set, id, entity, &type_ids);
        Ok(())
    }

    // ---- hierarchy convenience ------------------------------------------

    pub fn set_parent(&mut self, child: EntityId, parent: EntityId) -> Result<()> {
        self.add(child, hierarchy::child_of(parent))
    }

    pub fn parent_of(&self, child: EntityId) -> Result<Option<EntityId>> {
        Ok(hierarchy::parent_in_type(self.entity_type(child)?))
    }

    pub fn set_name(&mut self, parent: EntityId, name: &str, child: EntityId) {
        hierarchy::register_child_name(&mut self.components, parent, name, child);
    }

    pub fn child_by_name(&self, parent: EntityId, name: &str) -> Option<EntityId> {
        hierarchy::find_child_by_name(&self.components, parent, name)
    }

    // ---- observers --------------------------------------------------------

    pub fn register_observer(
        &mut self,
        filter: Filter,
        events: &[EntityId],
        callback: ObserverFn,
        ctx: usize,
    ) -> ObserverId {
        self.observable.register(filter, events, callback, ctx)
    }

    pub fn unregister_observer(&mut self, id: ObserverId) {
        self.observable.unregister(id);
    }

    // ---- queries ------------------------------------------------------

    /// Builds a query from `filter`, matching it against every table that
    /// currently exists, and registers it so future table creations and
    /// empty/non-empty transitions keep it in sync (spec §4.6).
    pub fn new_query(&mut self, filter: Filter, order_by: bool) -> Result<QueryId> {
        let pivot = select_pivot(&filter, |id| {
            self.components.get(id).map(|r| r.cache.len()).unwrap_or(0)
        })
        .ok_or(CoreError::InvalidTerm)?;
        let mut query = Query::new(filter, pivot, order_by)?;
        for table in &self.tables {
            let group_id = self.group_id_for(table.type_ids());
            query.try_match(
                table.id(),
                table.type_ids(),
                table.storage_ids(),
                table.is_empty(),
                group_id,
            );
        }
        let id = self.next_query_id;
        self.next_query_id += 1;
        self.queries.insert(id, query);
        Ok(id)
    }

    pub fn drop_query(&mut self, id: QueryId) {
        self.queries.remove(&id);
    }

    pub fn query(&self, id: QueryId) -> Option<&Query> {
        self.queries.get(&id)
    }

    /// Whole-table chunks for `id`'s matched tables, in insertion (or
    /// cascade-grouped) order. Flushes the pending-tables buffer first (spec
    /// §2: "flushed on iterator entry"), so a table that flipped empty/
    /// non-empty since the last flush is reflected in this call's result.
    pub fn query_chunks(&mut self, id: QueryId) -> Option<impl Iterator<Item = TableChunk<'_>> + '_> {
        self.flush_pending_tables();
        let q = self.queries.get(&id)?;
        Some(iter::chunks(q, &self.tables))
    }

    /// Sorts every one of `id`'s matched tables by entity id, then returns
    /// the chunks in merged ascending-entity-id order. Requires the query
    /// to have been built with `order_by = true`. Flushes the pending-tables
    /// buffer first, same as [`query_chunks`](Self::query_chunks).
    pub fn query_chunks_ordered(&mut self, id: QueryId) -> Result<Vec<(TableId, usize, usize)>> {
        self.flush_pending_tables();
        let Some(query) = self.queries.get(&id) else {
            return Ok(Vec::new());
        };
        if !query.uses_order_by() {
            return Err(CoreError::QueryUnsupported("query was not built with order_by"));
        }
        for &tid in query.ordered_tables() {
            self.tables[tid.raw() as usize].sort_by_entity();
        }
        let query = self.queries.get(&id).unwrap();
        let tables = &self.tables;
        Ok(query.order_by_merge(|t| tables[t.raw() as usize].entities().to_vec()))
    }

    /// Runs `f` over `id`'s matched rows split across `num_workers` roughly
    /// even per-table ranges (spec §4.7). Each chunk carries the worker
    /// index its range was assigned to
    /// ([`TableChunk::worker_index`](crate::iter::TableChunk::worker_index)),
    /// so a caller collecting deferred writes out of `f` (itself `Fn`, not
    /// `FnMut` — it cannot hold a live `&mut Stage`) knows which
    /// [`stage_mut`](Self::stage_mut) index to replay them through
    /// afterwards. Flushes the pending-tables buffer first, same as
    /// [`query_chunks`](Self::query_chunks).
    #[cfg(feature = "parallel")]
    pub fn query_par_for_each<F>(&mut self, id: QueryId, num_workers: usize, f: F)
    where
        F: Fn(TableChunk<'_>) + Send + Sync,
    {
        self.flush_pending_tables();
        let Some(q) = self.queries.get(&id) else { return };
        iter::par_for_each(q, &self.tables, num_workers, f);
    }

    // ---- defer / readonly windows ---------------------------------------

    pub fn begin_defer(&mut self) {
        self.stages[0].begin_defer();
    }

    /// Closes the outermost `begin_defer` span and replays every staged
    /// operation in queue order. A nested `end_defer` that doesn't reach
    /// depth zero returns `Ok(())` without draining anything.
    pub fn end_defer(&mut self) -> Result<()> {
        if !self.stages[0].end_defer() {
            return Ok(());
        }
        let (ops, _arena) = self.stages[0].take();
        for op in ops {
            self.replay_op(op)?;
        }
        #[cfg(feature = "profiling")]
        trace!("world.end_defer: queue drained");
        Ok(())
    }

    fn replay_op(&mut self, op: crate::stage::Operation) -> Result<()> {
        // Entities deleted earlier in the same queue are silently skipped
        // for any later op referencing them.
        if op.kind != OpKind::New && !self.entities.is_alive(op.entity) {
            return Ok(());
        }
        match op.kind {
            OpKind::New => self.apply_new(op.entity),
            OpKind::Add => self.add_id_now(op.entity, op.id.unwrap())?,
            OpKind::Remove => self.remove_id_now(op.entity, op.id.unwrap())?,
            OpKind::Set | OpKind::Mut => {
                let id = op.id.unwrap();
                let bytes = if op.size == 0 {
                    &[][..]
                } else {
                    unsafe { std::slice::from_raw_parts(op.value.unwrap(), op.size) }
                };
                self.set_raw_now(op.entity, id, bytes)?;
            }
            OpKind::Modified => self.modified_now(op.entity, op.id.unwrap())?,
            OpKind::Delete => self.despawn_now(op.entity)?,
            OpKind::Clear => self.clear_now(op.entity)?,
            OpKind::Enable => {
                let disabled = EntityId::from_parts(TAG_DISABLED, 0);
                self.remove_id_now(op.entity, disabled)?;
            }
            OpKind::Disable => {
                let disabled = EntityId::from_parts(TAG_DISABLED, 0);
                self.add_id_now(op.entity, disabled)?;
            }
        }
        Ok(())
    }

    /// Enters a readonly window: marks the world immutable to direct
    /// mutation and calls `begin_defer` on every worker stage (spec §4.9:
    /// "begin_readonly(world) calls begin_defer on every stage"), so every
    /// mutation entry point — on stage 0 or any worker stage — queues into
    /// its stage instead of touching the live tables until `end_readonly`.
    pub fn begin_readonly(&mut self) {
        for stage in &mut self.stages {
            stage.begin_readonly();
            stage.begin_defer();
        }
    }

    /// Closes the outermost `begin_readonly` span: drains every stage's
    /// queue in stage-index order (spec §5: "across stages, the drain order
    /// is stage-index order"), then, once no stage is still inside a nested
    /// readonly window, flushes the pending-tables buffer accumulated during
    /// the window (spec §5: "pending entries accumulated during readonly are
    /// drained on exit").
    pub fn end_readonly(&mut self) -> Result<()> {
        for i in 0..self.stages.len() {
            let should_drain = self.stages[i].end_defer();
            self.stages[i].end_readonly();
            if should_drain {
                let (ops, _arena) = self.stages[i].take();
                for op in ops {
                    self.replay_op(op)?;
                }
            }
        }
        if !self.is_readonly() {
            self.flush_pending_tables();
        }
        Ok(())
    }

    pub fn is_readonly(&self) -> bool {
        self.stages[0].is_readonly()
    }

    /// Suspends stage 0's readonly (and paired defer) state for a
    /// single-threaded internal that must briefly mutate directly — e.g.
    /// assigning a name during entity creation — restoring it afterwards via
    /// [`resume_readonly`](Self::resume_readonly).
    pub fn suspend_readonly(&mut self) -> (u32, u32) {
        self.stages[0].suspend_readonly()
    }

    pub fn resume_readonly(&mut self, state: (u32, u32)) {
        self.stages[0].resume_readonly(state);
    }

    /// The `index`th worker stage, for a parallel system run handing each
    /// worker its own deferred command buffer.
    pub fn stage_mut(&mut self, index: usize) -> &mut Stage {
        &mut self.stages[index]
    }

    pub fn worker_stage_count(&self) -> usize {
        self.stages.len()
    }
}

impl Drop for World {
    fn drop(&mut self) {
        let World { tables, components, .. } = self;
        let type_info = type_info_closure(components);
        for table in tables.iter_mut() {
            table.destruct_all_rows(&type_info);
        }
    }
}
