//! Ballots and the per-instance ballot generator.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;

use serde::{Deserialize, Serialize};

/// Totally ordered proposal number. Ordered by `number` first, then by
/// `proposer` identity bytes as tie-break (derived field order).
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Ballot {
    /// Monotonic round number of the proposer.
    pub number: u64,

    /// Identity of the proposer that generated this ballot.
    pub proposer: Bytes,
}

impl Ballot {
    pub fn new(number: u64, proposer: impl Into<Bytes>) -> Self {
        Ballot {
            number,
            proposer: proposer.into(),
        }
    }
}

impl fmt::Display for Ballot {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}@", self.number)?;
        for b in self.proposer.iter().take(4) {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

/// Produces strictly increasing ballots for one proposer within one scope
/// (typically one instance). Safe to share across tasks.
///
/// Round numbers start from the current wall-clock milliseconds, so a
/// restarted proposer does not re-issue numbers from its previous life.
#[derive(Debug)]
pub struct BallotGenerator {
    /// Last round number handed out or observed.
    last: AtomicU64,
}

impl BallotGenerator {
    /// Creates a generator seeded from the system clock.
    pub fn new() -> Self {
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self::with_seed(seed)
    }

    /// Creates a generator whose first ballot number is `seed + 1`.
    pub fn with_seed(seed: u64) -> Self {
        BallotGenerator {
            last: AtomicU64::new(seed),
        }
    }

    /// Returns a ballot strictly greater than any previously returned by
    /// this generator, or observed through `observe()`.
    pub fn next(&self, proposer: &Bytes) -> Ballot {
        let number = self.last.fetch_add(1, Ordering::AcqRel) + 1;
        Ballot::new(number, proposer.clone())
    }

    /// Bumps the counter past a ballot seen elsewhere (e.g., in a
    /// rejection), so the next ballot can outrank it.
    pub fn observe(&self, seen: &Ballot) {
        self.last.fetch_max(seen.number, Ordering::AcqRel);
    }
}

impl Default for BallotGenerator {
    fn default() -> Self {
        Self::new()
    }
}
