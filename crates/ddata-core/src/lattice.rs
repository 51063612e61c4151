//! Join-semilattice and delta traits shared by every replicated type.
//!
//! A join-semilattice (S, ⊔) satisfies:
//! - Commutativity: a ⊔ b = b ⊔ a
//! - Associativity: (a ⊔ b) ⊔ c = a ⊔ (b ⊔ c)
//! - Idempotence:  a ⊔ a = a
//!
//! Replicas that exchange state and join it converge regardless of message
//! order or duplication.

use std::cmp::Ordering;

/// The core CRDT trait. All state-based replicated types implement this.
pub trait Lattice: Clone + PartialEq {
    /// The bottom element (identity for join)
    fn bottom() -> Self;

    /// Join operation (least upper bound)
    fn join(&self, other: &Self) -> Self;

    /// Partial order derived from join: a ≤ b iff a ⊔ b = b
    fn partial_cmp_lattice(&self, other: &Self) -> Option<Ordering> {
        let joined = self.join(other);
        if &joined == self && &joined == other {
            Some(Ordering::Equal)
        } else if &joined == other {
            Some(Ordering::Less)
        } else if &joined == self {
            Some(Ordering::Greater)
        } else {
            None
        }
    }

    /// Check if self ≤ other in the lattice order
    fn leq(&self, other: &Self) -> bool {
        matches!(
            self.partial_cmp_lattice(other),
            Some(Ordering::Less) | Some(Ordering::Equal)
        )
    }
}

/// A delta produced by a mutator.
///
/// Deltas accumulated by successive mutations are folded with
/// [`DeltaOp::merge_op`], earlier delta on the left.
pub trait DeltaOp: Clone {
    /// Fold a later delta into this one.
    fn merge_op(&self, later: &Self) -> Self;

    /// Whether deltas of this kind must be applied in sequence order on the
    /// receiving replica. Observed-remove deltas carry only the causal context
    /// of the mutation and are unsafe to apply out of order.
    fn requires_causal_delivery(&self) -> bool {
        false
    }

    /// Number of primitive operations folded into this delta. Used to fall
    /// back to full-state replication when a group grows too large.
    fn op_count(&self) -> usize {
        1
    }
}

/// A replicated type that records the delta of its local mutations.
pub trait DeltaCrdt: Lattice {
    type Delta: DeltaOp;

    /// The delta accumulated since the last reset, if any.
    fn delta(&self) -> Option<Self::Delta>;

    /// Apply a delta produced by another replica.
    fn merge_delta(&self, delta: &Self::Delta) -> Self;

    /// Drop the accumulated delta.
    fn reset_delta(&mut self);

    /// Take the accumulated delta and reset it.
    fn split_delta(&mut self) -> Option<Self::Delta> {
        let delta = self.delta();
        self.reset_delta();
        delta
    }
}
