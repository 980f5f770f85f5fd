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

//! Component type info, hooks, and the component-to-table index.
//!
//! A component is identified by a raw [`ComponentId`], not a Rust type: the
//! type-safe façade that would map `TypeId -> ComponentId` is a separate
//! concern (see SPEC_FULL.md §1) and lives outside this crate. Hooks are a
//! record of function pointers plus an opaque context rather than a vtable,
//! per the "inheritance-by-callback" design note.

use rustc_hash::FxHashMap;

use crate::archetype::TableId;
use crate::entity::EntityId;

pub type ComponentId = u32;

/// Constructs `count` elements starting at `ptr`.
///
/// # Safety
/// `ptr` must be valid for `count` writes of the component's layout.
pub type CtorFn = unsafe fn(ptr: *mut u8, count: usize);
/// Destroys `count` elements starting at `ptr`, without freeing `ptr` itself.
///
/// # Safety
/// `ptr` must point at `count` live, constructed elements.
pub type DtorFn = unsafe fn(ptr: *mut u8, count: usize);
/// Copies `count` elements from `src` to a separately constructed `dst`.
///
/// # Safety
/// `dst`/`src` must be valid, non-overlapping, for `count` elements.
pub type CopyFn = unsafe fn(dst: *mut u8, src: *const u8, count: usize);
/// Moves `count` elements from `src` into `dst`, leaving `src` logically
/// destroyed (a paired `dtor` call on `src` would be undefined behaviour).
///
/// # Safety
/// `dst`/`src` must be valid, non-overlapping, for `count` elements.
pub type MoveFn = unsafe fn(dst: *mut u8, src: *mut u8, count: usize);
/// An `on_add`/`on_remove`/`on_set` lifecycle callback for a single row.
///
/// # Safety
/// `ptr` must point at one live, constructed element of the component.
pub type LifecycleFn = unsafe fn(entity: EntityId, ptr: *mut u8, ctx: usize);

/// Function-pointer bundle describing how a component is constructed,
/// destroyed, and relocated. Missing compound hooks (`copyCtor`, `moveCtor`,
/// `moveDtor`) are synthesised from the primitives the caller does supply —
/// see [`ComponentHooks::synthesize`]. `ctx` is an opaque caller-owned value
/// (typically a cast pointer) threaded through to the lifecycle callbacks;
/// stored as `usize` rather than a raw pointer so the hook bundle stays
/// `Send + Sync` across worker threads, the same trick the donor's
/// `parallel.rs` uses to carry raw pointers across a `rayon` scope.
#[derive(Clone, Copy, Default)]
pub struct ComponentHooks {
    pub ctor: Option<CtorFn>,
    pub dtor: Option<DtorFn>,
    pub copy: Option<CopyFn>,
    pub mov: Option<MoveFn>,
    pub copy_ctor: Option<CopyFn>,
    pub move_ctor: Option<MoveFn>,
    pub move_dtor: Option<MoveFn>,
    pub on_add: Option<LifecycleFn>,
    pub on_remove: Option<LifecycleFn>,
    pub on_set: Option<LifecycleFn>,
    pub ctx: usize,
}

impl std::fmt::Debug for ComponentHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComponentHooks")
            .field("ctor", &self.ctor.is_some())
            .field("dtor", &self.dtor.is_some())
            .field("copy", &self.copy.is_some())
            .field("mov", &self.mov.is_some())
            .field("copy_ctor", &self.copy_ctor.is_some())
            .field("move_ctor", &self.move_ctor.is_some())
            .field("move_dtor", &self.move_dtor.is_some())
            .field("on_add", &self.on_add.is_some())
            .field("on_remove", &self.on_remove.is_some())
            .field("on_set", &self.on_set.is_some())
            .finish()
    }
}

/// Bytewise relocation used as the `moveDtor` fallback for trivially
/// relocatable components (none of `move`/`dtor` supplied).
///
/// # Safety
/// `dst`/`src` must be valid, non-overlapping ranges of `count * size` bytes.
unsafe fn memcpy_relocate(dst: *mut u8, src: *mut u8, count: usize, size: usize) {
    std::ptr::copy_nonoverlapping(src, dst, count * size);
}

/// Zero-fills `count * size` bytes at `ptr`, the default `ctor` synthesised
/// when the caller supplies `dtor`/`copy`/`move` but no constructor.
///
/// # Safety
/// `ptr` must be valid for `count * size` writable bytes.
unsafe fn zero_fill(ptr: *mut u8, count: usize, size: usize) {
    std::ptr::write_bytes(ptr, 0, count * size);
}

impl ComponentHooks {
    /// Fills in `copyCtor`, `moveCtor`, and `moveDtor` when the caller left
    /// them unset, following the deterministic rules in SPEC_FULL.md §6:
    /// `copyCtor := ctor+copy`, `moveCtor := ctor+move`, `moveDtor :=
    /// move+dtor`, falling back to `move` alone. The zero-fill default for a
    /// missing `ctor` is applied lazily by [`construct`](Self::construct)
    /// rather than stored back into `self.ctor`, since a synthesised
    /// zero-fill needs the component's size and there is no function-pointer
    /// shape that closes over it. `size` is accepted for symmetry with that
    /// lazy default and reserved for future compound synthesis.
    pub fn synthesize(mut self, size: usize) -> Self {
        let _ = size;
        if self.copy_ctor.is_none() {
            if let (Some(_), Some(copy)) = (self.ctor, self.copy) {
                self.copy_ctor = Some(copy);
            }
        }
        if self.move_ctor.is_none() {
            if let (Some(_), Some(mov)) = (self.ctor, self.mov) {
                self.move_ctor = Some(mov);
            }
        }
        if self.move_dtor.is_none() {
            self.move_dtor = self.mov;
        }
        self
    }

    /// Constructs `count` elements at `ptr`, using the explicit `ctor` hook
    /// if supplied, or zero-filling `size`-byte elements otherwise (the
    /// synthesised default described in [`synthesize`](Self::synthesize)).
    ///
    /// # Safety
    /// `ptr` must be valid for `count` elements of `size` bytes.
    pub unsafe fn construct(&self, ptr: *mut u8, count: usize, size: usize) {
        match self.ctor {
            Some(ctor) => ctor(ptr, count),
            None => zero_fill(ptr, count, size),
        }
    }

    /// Destroys `count` elements at `ptr` if a `dtor` hook was supplied;
    /// tag-like components with no `dtor` are a no-op.
    ///
    /// # Safety
    /// `ptr` must point at `count` live elements.
    pub unsafe fn destruct(&self, ptr: *mut u8, count: usize) {
        if let Some(dtor) = self.dtor {
            dtor(ptr, count);
        }
    }

    /// Relocates one element from `src` to a freshly-reserved `dst`, using
    /// `moveDtor` if present, or a raw byte copy for trivially relocatable
    /// components. This is the sole primitive `archetype::Table` uses to
    /// shift the table's last row over a deleted row's slot, and to move a
    /// row's storage columns between tables.
    ///
    /// # Safety
    /// `dst`/`src` must be valid, non-overlapping, `size`-byte ranges; `src`
    /// is logically destroyed afterwards (its `dtor` must not run again).
    pub unsafe fn relocate(&self, dst: *mut u8, src: *mut u8, size: usize) {
        match self.move_dtor {
            Some(move_dtor) => move_dtor(dst, src, 1),
            None => memcpy_relocate(dst, src, 1, size),
        }
    }

    /// Copy-constructs one element from `src` into a freshly-reserved `dst`.
    /// Falls back to a raw byte copy when neither `copyCtor` nor `copy` was
    /// supplied (trivially copyable components).
    ///
    /// # Safety
    /// `dst`/`src` must be valid, non-overlapping, `size`-byte ranges.
    pub unsafe fn copy_construct(&self, dst: *mut u8, src: *const u8, size: usize) {
        match self.copy_ctor.or(self.copy) {
            Some(copy) => copy(dst, src, 1),
            None => std::ptr::copy_nonoverlapping(src, dst, size),
        }
    }

    pub fn has_dtor(&self) -> bool {
        self.dtor.is_some()
    }

    pub fn has_ctor(&self) -> bool {
        self.ctor.is_some()
    }

    pub fn has_copy(&self) -> bool {
        self.copy.is_some() || self.copy_ctor.is_some()
    }

    pub fn has_move(&self) -> bool {
        self.mov.is_some() || self.move_ctor.is_some() || self.move_dtor.is_some()
    }
}

/// `{ size, alignment, hooks }` describing one storage component. Tags (and
/// explicit `PropertyTag` components) have no `ComponentTypeInfo`: they
/// contribute to a table's type but not to its storage columns.
#[derive(Clone, Copy, Debug)]
pub struct ComponentTypeInfo {
    pub size: usize,
    pub alignment: usize,
    pub hooks: ComponentHooks,
}

impl ComponentTypeInfo {
    pub fn new(size: usize, alignment: usize, hooks: ComponentHooks) -> Self {
        Self {
            size,
            alignment,
            hooks: hooks.synthesize(size),
        }
    }

    /// A zero-sized tag-like type info: no hooks ever run on it.
    pub fn tag() -> Self {
        Self {
            size: 0,
            alignment: 1,
            hooks: ComponentHooks::default(),
        }
    }

    pub fn is_tag(&self) -> bool {
        self.size == 0
    }
}

/// Split table-cache lists for one component id: every table whose type
/// contains this id appears in exactly one of these lists, moved between
/// them as its entity count crosses zero (spec: "`TableEmpty`/`TableFill`
/// ... patched in place"). A side index gives O(1) removal without an
/// intrusive linked list, since tables are cheaply addressed by [`TableId`].
#[derive(Default)]
pub struct TableCache {
    non_empty: Vec<TableId>,
    empty: Vec<TableId>,
    /// table -> (is_empty, position in the corresponding Vec above)
    index: FxHashMap<TableId, (bool, usize)>,
}

impl TableCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, table: TableId, is_empty: bool) {
        let list = if is_empty {
            &mut self.empty
        } else {
            &mut self.non_empty
        };
        let pos = list.len();
        list.push(table);
        self.index.insert(table, (is_empty, pos));
    }

    pub fn remove(&mut self, table: TableId) {
        let Some((is_empty, pos)) = self.index.remove(&table) else {
            return;
        };
        let list = if is_empty {
            &mut self.empty
        } else {
            &mut self.non_empty
        };
        let last = list.len() - 1;
        list.swap(pos, last);
        list.pop();
        if pos != last {
            let moved = list[pos];
            self.index.get_mut(&moved).unwrap().1 = pos;
        }
    }

    /// Moves `table` between the empty and non-empty lists, called when its
    /// row count crosses zero in either direction.
    pub fn set_empty(&mut self, table: TableId, is_empty: bool) {
        if let Some(&(was_empty, _)) = self.index.get(&table) {
            if was_empty == is_empty {
                return;
            }
            self.remove(table);
        }
        self.insert(table, is_empty);
    }

    pub fn non_empty(&self) -> &[TableId] {
        &self.non_empty
    }

    pub fn empty(&self) -> &[TableId] {
        &self.empty
    }

    pub fn contains(&self, table: TableId) -> bool {
        self.index.contains_key(&table)
    }

    pub fn len(&self) -> usize {
        self.non_empty.len() + self.empty.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Per-component-id record: resolved type info (`None` for tags), the
/// table cache every table with this id in its type is registered in, and
/// — only for `(ChildOf, parent)` pair records — a name index supporting
/// simple child-of lookup (finding a named child under a parent scope; full
/// string-path resolution is out of scope, see SPEC_FULL.md NON-GOALS).
#[derive(Default)]
pub struct ComponentRecord {
    pub type_info: Option<ComponentTypeInfo>,
    pub cache: TableCache,
    pub child_names: Option<FxHashMap<String, EntityId>>,
}

impl ComponentRecord {
    pub fn new(type_info: Option<ComponentTypeInfo>) -> Self {
        Self {
            type_info,
            cache: TableCache::new(),
            child_names: None,
        }
    }

    /// Record for a `(ChildOf, parent)` pair: carries a name index so
    /// children can be looked up by name under this parent.
    pub fn for_child_of() -> Self {
        Self {
            type_info: None,
            cache: TableCache::new(),
            child_names: Some(FxHashMap::default()),
        }
    }

    pub fn is_tag(&self) -> bool {
        self.type_info.is_none()
    }
}

/// World-wide registry of [`ComponentRecord`]s, keyed by raw component or
/// pair id. Created lazily: a record only exists once some table references
/// that id.
#[derive(Default)]
pub struct ComponentIndex {
    records: FxHashMap<EntityId, ComponentRecord>,
}

impl ComponentIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: EntityId) -> Option<&ComponentRecord> {
        self.records.get(&id)
    }

    pub fn get_mut(&mut self, id: EntityId) -> Option<&mut ComponentRecord> {
        self.records.get_mut(&id)
    }

    pub fn ensure(&mut self, id: EntityId) -> &mut ComponentRecord {
        self.records.entry(id).or_insert_with(|| {
            if id.is_pair() && id.pair_relation() == crate::consts::RELATION_CHILD_OF {
                ComponentRecord::for_child_of()
            } else {
                ComponentRecord::new(None)
            }
        })
    }

    pub fn set_type_info(&mut self, id: EntityId, info: ComponentTypeInfo) {
        self.ensure(id).type_info = Some(info);
    }

    pub fn remove(&mut self, id: EntityId) {
        self.records.remove(&id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    unsafe fn noop_ctor(_ptr: *mut u8, _count: usize) {}
    unsafe fn noop_dtor(_ptr: *mut u8, _count: usize) {}

    #[test]
    fn synthesize_fills_copy_ctor_from_ctor_and_copy() {
        unsafe fn copy(_dst: *mut u8, _src: *const u8, _count: usize) {}
        let hooks = ComponentHooks {
            ctor: Some(noop_ctor),
            copy: Some(copy),
            ..Default::default()
        }
        .synthesize(4);
        assert!(hooks.copy_ctor.is_some());
    }

    #[test]
    fn synthesize_falls_back_move_dtor_to_move() {
        unsafe fn mov(_dst: *mut u8, _src: *mut u8, _count: usize) {}
        let hooks = ComponentHooks {
            mov: Some(mov),
            ..Default::default()
        }
        .synthesize(4);
        assert!(hooks.move_dtor.is_some());
    }

    #[test]
    fn tag_type_info_has_no_hooks() {
        let info = ComponentTypeInfo::tag();
        assert!(info.is_tag());
        assert!(!info.hooks.has_ctor());
    }

    #[test]
    fn table_cache_moves_between_empty_and_non_empty() {
        let mut cache = TableCache::new();
        let t = TableId::from_raw(1);
        cache.insert(t, false);
        assert!(cache.non_empty().contains(&t));
        cache.set_empty(t, true);
        assert!(cache.empty().contains(&t));
        assert!(!cache.non_empty().contains(&t));
    }

    #[test]
    fn table_cache_remove_keeps_other_entries() {
        let mut cache = TableCache::new();
        let a = TableId::from_raw(1);
        let b = TableId::from_raw(2);
        cache.insert(a, false);
        cache.insert(b, false);
        cache.remove(a);
        assert!(!cache.contains(a));
        assert!(cache.contains(b));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn component_index_lazily_creates_records() {
        let mut index = ComponentIndex::new();
        let id = EntityId::from_parts(10, 1);
        assert!(index.get(id).is_none());
        index.set_type_info(id, ComponentTypeInfo::new(4, 4, ComponentHooks::default()));
        assert!(index.get(id).unwrap().type_info.is_some());
    }

    #[test]
    fn construct_zero_fills_when_no_ctor_supplied() {
        let hooks = ComponentHooks {
            dtor: Some(noop_dtor),
            ..Default::default()
        }
        .synthesize(4);
        let mut buf = [0xFFu8; 4];
        unsafe {
            hooks.construct(buf.as_mut_ptr(), 1, 4);
        }
        assert_eq!(buf, [0u8; 4]);
    }
}
