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

//! Error types for the recoverable boundary cases in SPEC_FULL.md §7.
//! Internal-inconsistency paths (a corrupt table, a dangling graph edge)
//! `panic!`/`debug_assert!` instead of going through this enum.

use std::fmt;

/// Boundary errors callers can recover from.
#[derive(Debug, Clone)]
pub enum CoreError {
    /// The entity id presented is dead or was never allocated.
    EntityNotFound,
    /// A component/tag/relation id used in a mutation has no registered
    /// type info where one was required.
    InvalidComponent,
    /// A query term could not be finalised (see [`crate::term::Term::finalize`]).
    InvalidTerm,
    /// A filter was built with more than [`crate::consts::MAX_FILTER_TERMS`] terms.
    FilterTooManyTerms,
    /// A query combination the engine doesn't support, e.g. `order_by`
    /// combined with cascade grouping.
    QueryUnsupported(&'static str),
    /// A stage was used outside of a `begin_defer`/`end_defer` pair, or a
    /// readonly mutation was attempted without one. Debug builds only —
    /// release builds skip the check, per spec.
    StageMisuse(String),
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoreError::EntityNotFound => write!(f, "entity not found or no longer alive"),
            CoreError::InvalidComponent => write!(f, "component has no registered type info"),
            CoreError::InvalidTerm => write!(f, "query term failed to finalize"),
            CoreError::FilterTooManyTerms => {
                write!(f, "filter exceeds the maximum term count")
            }
            CoreError::QueryUnsupported(why) => write!(f, "unsupported query: {why}"),
            CoreError::StageMisuse(why) => write!(f, "stage misuse: {why}"),
        }
    }
}

impl std::error::Error for CoreError {}

pub type Result<T> = std::result::Result<T, CoreError>;
