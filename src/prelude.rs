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

//! Convenient re-exports of the commonly used types.
//!
//! ```
//! use archetype_core::prelude::*;
//! ```

pub use crate::component::{ComponentHooks, ComponentTypeInfo};
pub use crate::entity::EntityId;
pub use crate::error::{CoreError, Result};
pub use crate::iter::TableChunk;
pub use crate::observer::{ObserverFn, ObserverId};
pub use crate::term::{Filter, InOut, Term, TermRef};
pub use crate::world::{QueryId, SystemApi, World, WorldConfig};
