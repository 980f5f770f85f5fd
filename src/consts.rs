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

//! Reserved component/tag/relation/event ids.
//!
//! Low 256 ids are built-in components, 256..384 are built-in tags, relations
//! and events. User component ids start at `USER_COMPONENT_START`. Assigned
//! as plain constants rather than derived from static-init order, per the
//! "global built-in ids" design note.

/// First id available to callers for their own components/tags/relations.
pub const USER_COMPONENT_START: u32 = 384;

pub const INFO_COMPONENT: u32 = 1;
pub const NAME_COMPONENT: u32 = 2;
pub const SYSTEM_COMPONENT: u32 = 3;
pub const PIPELINE_COMPONENT: u32 = 4;
pub const TRIGGER_COMPONENT: u32 = 5;
pub const OBSERVER_COMPONENT: u32 = 6;

pub const PROPERTY_TAG: u32 = 256;
pub const PROPERTY_NONE: u32 = 257;
pub const PROPERTY_THIS: u32 = 258;

pub const TAG_PREFAB: u32 = 260;
pub const TAG_DISABLED: u32 = 261;

pub const EVENT_TABLE_EMPTY: u32 = 270;
pub const EVENT_TABLE_FILL: u32 = 271;
pub const EVENT_ON_ADD: u32 = 272;
pub const EVENT_ON_REMOVE: u32 = 273;
pub const EVENT_ON_SET: u32 = 274;

pub const RELATION_IS_A: u32 = 280;
pub const RELATION_CHILD_OF: u32 = 281;

/// Component id below which archetype-graph edges live in a fixed inline
/// array rather than a hash map (spec §4.3).
pub const SMALL_ID_THRESHOLD: u32 = 256;

/// Sparse-index chunk size (spec §4.1): 4096 slots per page.
pub const SPARSE_CHUNK_SIZE: usize = 4096;

/// Variable slot for the implicit `This` query source (spec §4.5).
pub const VAR_THIS: usize = 0;

/// Maximum terms a filter may contain before it is rejected at build time.
pub const MAX_FILTER_TERMS: usize = 16;

/// Inline capacity for filter term storage and per-term iterator arrays.
pub const INLINE_TERMS: usize = 4;
