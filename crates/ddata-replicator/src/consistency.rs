//! Read and write consistency levels.
//!
//! Every level except `Local` carries a timeout after which the aggregator
//! gives up and replies with whatever it has.

use serde::{Deserialize, Serialize};

/// Majority of `num_nodes` plus `additional`, raised to `min_cap` and never
/// more than `num_nodes`.
pub fn calculate_majority(min_cap: usize, num_nodes: usize, additional: usize) -> usize {
    let majority = num_nodes / 2 + 1;
    num_nodes.min((majority + additional).max(min_cap))
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReadConsistency {
    Local,
    From {
        n: usize,
        timeout_ms: u64,
    },
    Majority {
        timeout_ms: u64,
        min_cap: usize,
    },
    MajorityPlus {
        timeout_ms: u64,
        additional: usize,
        min_cap: usize,
    },
    All {
        timeout_ms: u64,
    },
}

impl ReadConsistency {
    pub fn from(n: usize, timeout_ms: u64) -> Self {
        Self::From { n, timeout_ms }
    }

    pub fn majority(timeout_ms: u64) -> Self {
        Self::Majority {
            timeout_ms,
            min_cap: 0,
        }
    }

    pub fn all(timeout_ms: u64) -> Self {
        Self::All { timeout_ms }
    }

    pub fn timeout_ms(&self) -> u64 {
        match self {
            Self::Local => 0,
            Self::From { timeout_ms, .. }
            | Self::Majority { timeout_ms, .. }
            | Self::MajorityPlus { timeout_ms, .. }
            | Self::All { timeout_ms } => *timeout_ms,
        }
    }

    /// Whether the read can be answered from the local replica alone, given
    /// the number of other nodes.
    pub fn is_local(&self, other_nodes: usize) -> bool {
        match self {
            Self::Local => true,
            Self::Majority { .. } | Self::MajorityPlus { .. } | Self::All { .. } => other_nodes == 0,
            Self::From { .. } => false,
        }
    }

    /// Number of replies, out of the other nodes, after which the read is
    /// done. Negative when the level asks for more replicas than exist.
    pub fn done_when_remaining(&self, other_nodes: usize) -> isize {
        let total = other_nodes as isize + 1;
        match *self {
            Self::Local => 0,
            Self::From { n, .. } => other_nodes as isize - (n as isize - 1),
            Self::All { .. } => 0,
            Self::Majority { min_cap, .. } => {
                total - calculate_majority(min_cap, total as usize, 0) as isize
            }
            Self::MajorityPlus {
                additional, min_cap, ..
            } => total - calculate_majority(min_cap, total as usize, additional) as isize,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum WriteConsistency {
    Local,
    To {
        n: usize,
        timeout_ms: u64,
    },
    Majority {
        timeout_ms: u64,
        min_cap: usize,
    },
    MajorityPlus {
        timeout_ms: u64,
        additional: usize,
        min_cap: usize,
    },
    All {
        timeout_ms: u64,
    },
}

impl WriteConsistency {
    pub fn to(n: usize, timeout_ms: u64) -> Self {
        Self::To { n, timeout_ms }
    }

    pub fn majority(timeout_ms: u64) -> Self {
        Self::Majority {
            timeout_ms,
            min_cap: 0,
        }
    }

    pub fn all(timeout_ms: u64) -> Self {
        Self::All { timeout_ms }
    }

    pub fn timeout_ms(&self) -> u64 {
        match self {
            Self::Local => 0,
            Self::To { timeout_ms, .. }
            | Self::Majority { timeout_ms, .. }
            | Self::MajorityPlus { timeout_ms, .. }
            | Self::All { timeout_ms } => *timeout_ms,
        }
    }

    pub fn is_local(&self, other_nodes: usize) -> bool {
        match self {
            Self::Local => true,
            Self::Majority { .. } | Self::MajorityPlus { .. } | Self::All { .. } => other_nodes == 0,
            Self::To { .. } => false,
        }
    }

    /// Number of outstanding acks, out of the other nodes, at which the
    /// write is done. Negative when the level asks for more replicas than
    /// exist.
    pub fn done_when_remaining(&self, other_nodes: usize) -> isize {
        let total = other_nodes as isize + 1;
        match *self {
            Self::Local => 0,
            Self::To { n, .. } => other_nodes as isize - (n as isize - 1),
            Self::All { .. } => 0,
            Self::Majority { min_cap, .. } => {
                total - calculate_majority(min_cap, total as usize, 0) as isize
            }
            Self::MajorityPlus {
                additional, min_cap, ..
            } => total - calculate_majority(min_cap, total as usize, additional) as isize,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn majority_arithmetic() {
        assert_eq!(calculate_majority(0, 5, 0), 3);
        assert_eq!(calculate_majority(4, 3, 0), 3);
        assert_eq!(calculate_majority(0, 4, 0), 3);
        assert_eq!(calculate_majority(0, 5, 1), 4);
        assert_eq!(calculate_majority(0, 5, 9), 5);
        assert_eq!(calculate_majority(5, 9, 0), 5);
        assert_eq!(calculate_majority(0, 1, 0), 1);
    }

    #[test]
    fn done_when_remaining_for_writes() {
        // four other nodes, five replicas in total
        assert_eq!(WriteConsistency::to(1, 100).done_when_remaining(4), 4);
        assert_eq!(WriteConsistency::to(3, 100).done_when_remaining(4), 2);
        assert_eq!(WriteConsistency::majority(100).done_when_remaining(4), 2);
        assert_eq!(WriteConsistency::all(100).done_when_remaining(4), 0);
        let plus = WriteConsistency::MajorityPlus {
            timeout_ms: 100,
            additional: 1,
            min_cap: 0,
        };
        assert_eq!(plus.done_when_remaining(4), 1);
        assert_eq!(WriteConsistency::to(7, 100).done_when_remaining(4), -2);
    }

    #[test]
    fn done_when_remaining_for_reads() {
        assert_eq!(ReadConsistency::from(2, 100).done_when_remaining(1), 0);
        assert_eq!(ReadConsistency::majority(100).done_when_remaining(2), 1);
        let capped = ReadConsistency::Majority {
            timeout_ms: 100,
            min_cap: 3,
        };
        assert_eq!(capped.done_when_remaining(2), 0);
    }

    #[test]
    fn local_levels() {
        assert!(ReadConsistency::Local.is_local(3));
        assert!(ReadConsistency::majority(10).is_local(0));
        assert!(!ReadConsistency::from(1, 10).is_local(0));
        assert!(WriteConsistency::all(10).is_local(0));
        assert!(!WriteConsistency::all(10).is_local(1));
        assert_eq!(WriteConsistency::Local.timeout_ms(), 0);
        assert_eq!(ReadConsistency::all(250).timeout_ms(), 250);
    }

    proptest! {
        #[test]
        fn majority_is_a_quorum(num_nodes in 1usize..50, min_cap in 0usize..60, additional in 0usize..5) {
            let majority = calculate_majority(min_cap, num_nodes, additional);
            prop_assert!(majority <= num_nodes);
            prop_assert!(majority * 2 > num_nodes);
        }

        #[test]
        fn write_majority_overlaps_read_majority(other_nodes in 0usize..50) {
            let total = other_nodes as isize + 1;
            let writes = total - WriteConsistency::majority(100).done_when_remaining(other_nodes);
            let reads = total - ReadConsistency::majority(100).done_when_remaining(other_nodes);
            prop_assert!(writes + reads > total);
        }
    }
}
