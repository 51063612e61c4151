//! Ancestor tracking for cheap merges of a value with its own predecessor.
//!
//! A mutated value remembers the identity of the value it was derived from.
//! Merging a value with that ancestor (the common case when the replicator
//! writes back the result of an update) then returns the descendant without
//! walking the structure. Identities are process-local and never serialized;
//! a value without a matching ancestor always takes the full merge path.

use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_IDENTITY: AtomicU64 = AtomicU64::new(1);

fn next_identity() -> u64 {
    NEXT_IDENTITY.fetch_add(1, Ordering::Relaxed)
}

/// Identity of one value version plus the root of its mutation chain.
#[derive(Clone, Debug)]
pub struct Lineage {
    id: u64,
    ancestor: Option<u64>,
}

/// Outcome of comparing two lineages before a merge.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Shortcut {
    /// Both sides are the same version, or `other` is an ancestor of `self`.
    KeepSelf,
    /// `self` is an ancestor of `other`.
    TakeOther,
    /// No relation known; a structural merge is required.
    FullMerge,
}

impl Lineage {
    pub fn new() -> Self {
        Self {
            id: next_identity(),
            ancestor: None,
        }
    }

    /// Record a mutation: the current version becomes the ancestor (unless a
    /// chain root is already recorded) and this value gets a fresh identity.
    pub fn advance(&mut self) {
        if self.ancestor.is_none() {
            self.ancestor = Some(self.id);
        }
        self.id = next_identity();
    }

    /// Forget the ancestor; used on merge results.
    pub fn detach(&mut self) {
        self.ancestor = None;
    }

    pub fn shortcut(&self, other: &Lineage) -> Shortcut {
        if self.id == other.id || self.ancestor == Some(other.id) {
            Shortcut::KeepSelf
        } else if other.ancestor == Some(self.id) {
            Shortcut::TakeOther
        } else {
            Shortcut::FullMerge
        }
    }
}

impl Default for Lineage {
    fn default() -> Self {
        Self::new()
    }
}
