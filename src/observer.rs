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

//! Observer/trigger fan-out for the built-in lifecycle events
//! (`TableEmpty`/`TableFill`/`OnAdd`/`OnRemove`/`OnSet`, spec §4.7).
//!
//! An [`Observer`] is a [`Filter`] plus one callback; it's routed to via a
//! trigger registered per `(event, component id)` pair it cares about, the
//! same "function pointer + opaque ctx" shape as [`crate::component::ComponentHooks`]
//! rather than a boxed closure, so observers stay `Send + Sync` across a
//! worker-split query without extra indirection.

use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::entity::EntityId;
use crate::term::Filter;

pub type ObserverId = u32;

/// Called once per matching entity/event, with `component` identifying
/// which id on the entity the event concerns (`EntityId::NULL` for the
/// table-level events, which aren't about one component).
pub type ObserverFn = fn(ctx: usize, entity: EntityId, component: EntityId);

pub struct Observer {
    pub id: ObserverId,
    pub filter: Filter,
    pub events: SmallVec<[EntityId; 4]>,
    pub callback: ObserverFn,
    pub ctx: usize,
}

/// Registry of observers and the `event -> component id -> observer ids`
/// trigger table used to fan an event out without scanning every observer.
#[derive(Default)]
pub struct Observable {
    triggers: FxHashMap<EntityId, FxHashMap<EntityId, SmallVec<[ObserverId; 4]>>>,
    observers: FxHashMap<ObserverId, Observer>,
    next_id: ObserverId,
}

impl Observable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `filter` against `events`, routing a trigger per concrete
    /// term id in the filter. A filter with only wildcard terms (no
    /// concrete id to index by) never fires — observers need at least one
    /// concrete component/pair to anchor on, same restriction as a query's
    /// pivot term.
    pub fn register(
        &mut self,
        filter: Filter,
        events: &[EntityId],
        callback: ObserverFn,
        ctx: usize,
    ) -> ObserverId {
        let id = self.next_id;
        self.next_id += 1;
        for &event in events {
            for term in &filter.terms {
                if let Some(cid) = term.id {
                    self.triggers
                        .entry(event)
                        .or_default()
                        .entry(cid)
                        .or_default()
                        .push(id);
                }
            }
        }
        self.observers.insert(
            id,
            Observer {
                id,
                filter,
                events: events.iter().copied().collect(),
                callback,
                ctx,
            },
        );
        id
    }

    pub fn unregister(&mut self, id: ObserverId) {
        let Some(obs) = self.observers.remove(&id) else {
            return;
        };
        for &event in &obs.events {
            for term in &obs.filter.terms {
                if let Some(cid) = term.id {
                    if let Some(by_component) = self.triggers.get_mut(&event) {
                        if let Some(list) = by_component.get_mut(&cid) {
                            list.retain(|&o| o != id);
                        }
                    }
                }
            }
        }
    }

    /// Fans a per-component event (`OnAdd`/`OnRemove`/`OnSet`) out to every
    /// observer whose filter matches the entity's current type. An observer
    /// with several terms matching this one event/component pair still
    /// fires its callback exactly once.
    pub fn emit(&self, event: EntityId, component: EntityId, entity: EntityId, type_ids: &[EntityId]) {
        let Some(by_component) = self.triggers.get(&event) else {
            return;
        };
        let Some(candidates) = by_component.get(&component) else {
            return;
        };
        let mut fired: SmallVec<[ObserverId; 8]> = SmallVec::new();
        for &oid in candidates {
            if fired.contains(&oid) {
                continue;
            }
            let Some(obs) = self.observers.get(&oid) else {
                continue;
            };
            if obs.filter.terms.iter().all(|t| t.matches_type(type_ids)) {
                fired.push(oid);
                (obs.callback)(obs.ctx, entity, component);
            }
        }
    }

    /// Fans a table-level event (`TableEmpty`/`TableFill`) out to every
    /// observer registered for it whose filter matches the table's type.
    /// Not keyed by a single component since the event concerns the whole
    /// table transitioning, not one id being added/removed.
    pub fn emit_table_event(&self, event: EntityId, table_type_ids: &[EntityId]) {
        let Some(by_component) = self.triggers.get(&event) else {
            return;
        };
        let mut fired: SmallVec<[ObserverId; 8]> = SmallVec::new();
        for ids in by_component.values() {
            for &oid in ids {
                if fired.contains(&oid) {
                    continue;
                }
                let Some(obs) = self.observers.get(&oid) else {
                    continue;
                };
                if obs.filter.terms.iter().all(|t| t.matches_type(table_type_ids)) {
                    fired.push(oid);
                    (obs.callback)(obs.ctx, EntityId::NULL, EntityId::NULL);
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.observers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }
}
