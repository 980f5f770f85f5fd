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

//! Deferred command buffer (spec §4.8): while a stage is in a
//! `begin_defer`/`end_defer` span, mutations are staged here instead of
//! applied immediately, then replayed in queue order once the span closes.
//! Staged component bytes live in a `bumpalo` arena rather than per-op
//! heap allocations, reclaimed all at once when the queue drains.

use bumpalo::Bump;

use crate::entity::EntityId;
use crate::error::{CoreError, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpKind {
    New,
    Add,
    Remove,
    Set,
    Mut,
    Modified,
    Delete,
    Clear,
    Enable,
    Disable,
}

/// One staged mutation. `value`/`size` are only meaningful for
/// `Set`/`Mut`, pointing into the stage's arena; the pointer stays valid
/// until [`Stage::take`]'s returned arena is dropped.
pub struct Operation {
    pub kind: OpKind,
    pub entity: EntityId,
    pub id: Option<EntityId>,
    pub value: Option<*mut u8>,
    pub size: usize,
}

/// A stage's queue plus its defer/readonly nesting counters. One `Stage`
/// per worker in a parallel system run, each draining independently so
/// ordering between workers is undefined but ordering *within* one worker's
/// queue is preserved (spec: "stage-index-ordered drain").
pub struct Stage {
    defer_depth: u32,
    readonly_depth: u32,
    queue: Vec<Operation>,
    arena: Bump,
}

impl Default for Stage {
    fn default() -> Self {
        Self::new()
    }
}

impl Stage {
    pub fn new() -> Self {
        Self {
            defer_depth: 0,
            readonly_depth: 0,
            queue: Vec::new(),
            arena: Bump::new(),
        }
    }

    pub fn begin_defer(&mut self) {
        self.defer_depth += 1;
    }

    /// Returns `true` once depth reaches zero — the caller should drain and
    /// apply the queue only then, not on every nested `end_defer`.
    pub fn end_defer(&mut self) -> bool {
        self.defer_depth = self.defer_depth.saturating_sub(1);
        self.defer_depth == 0
    }

    pub fn is_deferred(&self) -> bool {
        self.defer_depth > 0
    }

    pub fn begin_readonly(&mut self) {
        self.readonly_depth += 1;
    }

    pub fn end_readonly(&mut self) {
        self.readonly_depth = self.readonly_depth.saturating_sub(1);
    }

    /// Drops readonly and defer to depth 0 and returns both prior depths, for
    /// a caller (e.g. a system that needs to mutate directly for one call,
    /// such as assigning a name during entity creation) to restore later via
    /// [`resume_readonly`](Self::resume_readonly). Since `begin_readonly`
    /// pairs every readonly level with a defer level, suspending one without
    /// the other would leave the stage deferred with no readonly window
    /// around it.
    pub fn suspend_readonly(&mut self) -> (u32, u32) {
        (
            std::mem::replace(&mut self.readonly_depth, 0),
            std::mem::replace(&mut self.defer_depth, 0),
        )
    }

    pub fn resume_readonly(&mut self, state: (u32, u32)) {
        self.readonly_depth = state.0;
        self.defer_depth = state.1;
    }

    pub fn is_readonly(&self) -> bool {
        self.readonly_depth > 0
    }

    /// Debug-only guard: a mutation queued while neither deferred nor
    /// readonly-suspended is a misuse of the stage. Release builds skip the
    /// check entirely, per spec.
    pub fn check_deferred(&self) -> Result<()> {
        #[cfg(debug_assertions)]
        {
            if !self.is_deferred() {
                return Err(CoreError::StageMisuse(
                    "mutation queued outside begin_defer/end_defer".to_string(),
                ));
            }
        }
        Ok(())
    }

    pub fn push_new(&mut self, entity: EntityId) {
        self.queue.push(Operation {
            kind: OpKind::New,
            entity,
            id: None,
            value: None,
            size: 0,
        });
    }

    pub fn push_add(&mut self, entity: EntityId, id: EntityId) {
        self.queue.push(Operation {
            kind: OpKind::Add,
            entity,
            id: Some(id),
            value: None,
            size: 0,
        });
    }

    pub fn push_remove(&mut self, entity: EntityId, id: EntityId) {
        self.queue.push(Operation {
            kind: OpKind::Remove,
            entity,
            id: Some(id),
            value: None,
            size: 0,
        });
    }

    /// Copies `bytes` into the arena and stages a `Set` replaying those
    /// bytes onto `id`'s column for `entity` once the queue drains.
    pub fn push_set(&mut self, entity: EntityId, id: EntityId, bytes: &[u8]) {
        let ptr = if bytes.is_empty() {
            std::ptr::null_mut()
        } else {
            self.arena.alloc_slice_copy(bytes).as_mut_ptr()
        };
        self.queue.push(Operation {
            kind: OpKind::Set,
            entity,
            id: Some(id),
            value: Some(ptr),
            size: bytes.len(),
        });
    }

    /// Reserves `size` zeroed bytes in the arena for the caller to write
    /// into directly, staging a `Mut` that replays those bytes the same way
    /// `Set` does. Returns the arena pointer.
    pub fn push_mut(&mut self, entity: EntityId, id: EntityId, size: usize) -> *mut u8 {
        let ptr = if size == 0 {
            std::ptr::null_mut()
        } else {
            let layout = std::alloc::Layout::from_size_align(size, 1).unwrap();
            self.arena.alloc_layout(layout).as_ptr()
        };
        self.queue.push(Operation {
            kind: OpKind::Mut,
            entity,
            id: Some(id),
            value: Some(ptr),
            size,
        });
        ptr
    }

    pub fn push_modified(&mut self, entity: EntityId, id: EntityId) {
        self.queue.push(Operation {
            kind: OpKind::Modified,
            entity,
            id: Some(id),
            value: None,
            size: 0,
        });
    }

    pub fn push_delete(&mut self, entity: EntityId) {
        self.queue.push(Operation {
            kind: OpKind::Delete,
            entity,
            id: None,
            value: None,
            size: 0,
        });
    }

    pub fn push_clear(&mut self, entity: EntityId) {
        self.queue.push(Operation {
            kind: OpKind::Clear,
            entity,
            id: None,
            value: None,
            size: 0,
        });
    }

    pub fn push_enable(&mut self, entity: EntityId) {
        self.queue.push(Operation {
            kind: OpKind::Enable,
            entity,
            id: None,
            value: None,
            size: 0,
        });
    }

    pub fn push_disable(&mut self, entity: EntityId) {
        self.queue.push(Operation {
            kind: OpKind::Disable,
            entity,
            id: None,
            value: None,
            size: 0,
        });
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Takes the queue and its backing arena together — the caller must
    /// keep the returned `Bump` alive for as long as it dereferences any
    /// operation's `value` pointer.
    pub fn take(&mut self) -> (Vec<Operation>, Bump) {
        let queue = std::mem::take(&mut self.queue);
        let arena = std::mem::replace(&mut self.arena, Bump::new());
        (queue, arena)
    }
}
