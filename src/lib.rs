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

//! A standalone archetype ECS core: entities, columnar archetype tables
//! connected by an add/remove graph, a term/filter query engine with
//! pivot-term matching, observer/trigger fan-out, and a deferred command
//! buffer for mutating the world from inside an iteration.
//!
//! This crate covers the storage and matching core only — no scheduler, no
//! typed component wrappers. See SPEC_FULL.md for the full module map.

pub mod archetype;
pub mod component;
pub mod consts;
pub mod entity;
pub mod error;
pub mod graph;
pub mod hierarchy;
pub mod iter;
pub mod observer;
pub mod prelude;
pub mod query;
pub mod sparse;
pub mod stage;
pub mod term;
pub mod utils;
pub mod world;

pub use entity::EntityId;
pub use error::{CoreError, Result};
pub use world::{QueryId, SystemApi, World, WorldConfig};
