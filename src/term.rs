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

//! Query terms and filters: one clause ("has component C", "has relation
//! pair (R, O)") finalised in three passes, collected into a [`Filter`].

use smallvec::SmallVec;

use crate::consts::{INLINE_TERMS, MAX_FILTER_TERMS, RELATION_CHILD_OF, VAR_THIS};
use crate::entity::EntityId;
use crate::error::CoreError;

/// What a term's source/first/second slot is bound to. `Wildcard` and an
/// unbound `Variable` both stay unresolved until a candidate table is
/// checked in [`Term::matches_type`] — full cross-product fan-out across
/// multiple matches of the same wildcard in one table is out of scope here;
/// a table either matches a wildcard term or it doesn't (see DESIGN.md).
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TermRef {
    Entity(EntityId),
    Variable(usize),
    Wildcard,
}

/// Read/write intent, used by the query cache's dirty monitor to exclude
/// read-only terms from write-tracking.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum InOut {
    In,
    Out,
    InOut,
    /// Existence-only: no column data is read through this term.
    Filter,
}

/// Binds this term's traversal relation to [`RELATION_CHILD_OF`] — the term
/// is evaluated relative to the source's parent rather than the source
/// itself, feeding the query cache's cascade grouping (spec §4.6).
pub const TERM_PARENT: u8 = 1 << 0;
/// Marks a term as the grouping key for cascade ordering.
pub const TERM_CASCADE: u8 = 1 << 1;

/// One query clause. Built via [`Term::component`] or [`Term::pair`], then
/// finalised (by [`Filter::build`]) into a form `match_table` can test
/// directly against a candidate table's type.
#[derive(Clone, Debug)]
pub struct Term {
    pub id: Option<EntityId>,
    pub source: TermRef,
    pub first: Option<TermRef>,
    pub second: Option<TermRef>,
    pub inout: InOut,
    pub flags: u8,
    pub index: usize,
}

impl Term {
    /// A plain "has component/tag `id`" term against the implicit `This`
    /// source.
    pub fn component(id: EntityId) -> Self {
        Self {
            id: Some(id),
            source: TermRef::Variable(VAR_THIS),
            first: None,
            second: None,
            inout: InOut::InOut,
            flags: 0,
            index: 0,
        }
    }

    /// A relational "has pair (first, second)" term; either side may be a
    /// concrete entity, a query variable, or a wildcard.
    pub fn pair(first: TermRef, second: TermRef) -> Self {
        Self {
            id: None,
            source: TermRef::Variable(VAR_THIS),
            first: Some(first),
            second: Some(second),
            inout: InOut::InOut,
            flags: 0,
            index: 0,
        }
    }

    pub fn filter_only(mut self) -> Self {
        self.inout = InOut::Filter;
        self
    }

    pub fn cascade(mut self) -> Self {
        self.flags |= TERM_CASCADE | TERM_PARENT;
        self
    }

    pub fn traverse_relation(&self) -> EntityId {
        EntityId::from_parts(RELATION_CHILD_OF, 0)
    }

    /// Three-pass finalisation (spec §4.5): derive `id` from whichever form
    /// was supplied, ensure every slot is either an entity or a variable,
    /// and synthesise `id` back from `first`/`second` when only the
    /// relational form was given. Terms with a wildcard/variable side stay
    /// without a concrete `id` — resolved per-candidate-table instead.
    pub fn finalize(&mut self) -> Result<(), CoreError> {
        // Pass 1: derive id/first from whichever form was given.
        if self.id.is_none() {
            if self.first.is_none() {
                return Err(CoreError::InvalidTerm);
            }
        } else if self.first.is_none() {
            self.first = Some(TermRef::Entity(self.id.unwrap()));
        }

        // Pass 2: every source/first/second slot must already be Entity,
        // Variable, or Wildcard by construction — nothing further to
        // normalise beyond validating `source`.
        if let TermRef::Entity(_) | TermRef::Variable(_) | TermRef::Wildcard = self.source {
            // always true; kept as a pass marker for readability.
        }

        // Pass 3: synthesise the pair id back from first/second when both
        // sides resolved to concrete entities and no explicit id was given.
        if self.id.is_none() {
            if let (Some(TermRef::Entity(r)), Some(TermRef::Entity(o))) = (self.first, self.second)
            {
                self.id = Some(EntityId::pair(r.index(), o.index()));
            }
        }

        let has_pattern = self.id.is_some() || (self.first.is_some() && self.second.is_some());
        if !has_pattern {
            return Err(CoreError::InvalidTerm);
        }
        Ok(())
    }

    /// Tests whether a candidate table's sorted type satisfies this term.
    pub fn matches_type(&self, type_ids: &[EntityId]) -> bool {
        if let Some(id) = self.id {
            return type_ids.binary_search(&id).is_ok();
        }
        type_ids.iter().any(|&t| self.matches_pair_pattern(t))
    }

    fn matches_pair_pattern(&self, candidate: EntityId) -> bool {
        if !candidate.is_pair() {
            return false;
        }
        let rel_ok = match self.first {
            Some(TermRef::Entity(r)) => candidate.pair_relation() == r.index(),
            _ => true,
        };
        let obj_ok = match self.second {
            Some(TermRef::Entity(o)) => candidate.pair_object() == o.index(),
            _ => true,
        };
        rel_ok && obj_ok
    }
}

/// An ordered, small-inline collection of terms (spec: term count ≤ 16,
/// inline storage for ≤ 4 — the common case).
#[derive(Clone, Debug, Default)]
pub struct Filter {
    pub terms: SmallVec<[Term; INLINE_TERMS]>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_term(mut self, mut term: Term) -> Result<Self, CoreError> {
        if self.terms.len() >= MAX_FILTER_TERMS {
            return Err(CoreError::FilterTooManyTerms);
        }
        term.index = self.terms.len();
        self.terms.push(term);
        Ok(self)
    }

    /// Finalises every term; a filter is valid iff every term finalises and
    /// the term count is within [`MAX_FILTER_TERMS`].
    pub fn build(mut self) -> Result<Self, CoreError> {
        if self.terms.len() > MAX_FILTER_TERMS {
            return Err(CoreError::FilterTooManyTerms);
        }
        for term in &mut self.terms {
            term.finalize()?;
        }
        Ok(self)
    }

    /// All non-pivot terms match `type_ids`; the pivot term's membership is
    /// already guaranteed by the caller having walked its table cache.
    pub fn matches_table(&self, type_ids: &[EntityId], pivot_index: usize) -> bool {
        self.terms
            .iter()
            .enumerate()
            .all(|(i, term)| i == pivot_index || term.matches_type(type_ids))
    }

    pub fn cascade_term(&self) -> Option<&Term> {
        self.terms.iter().find(|t| t.flags & TERM_CASCADE != 0)
    }
}
