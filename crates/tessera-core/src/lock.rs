//! Lock modes for `lock()`, `find_with_lock()` and locked queries.

use serde::{Deserialize, Serialize};

/// How an entity or query result should be locked.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LockMode {
    /// No lock; state may come from the persistence context.
    #[default]
    None,
    /// Verify the version is still current against the database.
    Read,
    /// Verify the version is still current at flush time.
    Optimistic,
    /// Increment the version at flush time even if nothing else changed.
    OptimisticForceIncrement,
    /// Shared row lock (`FOR SHARE`).
    PessimisticRead,
    /// Exclusive row lock (`FOR UPDATE`).
    PessimisticWrite,
}

impl LockMode {
    /// Does this mode require a round trip to the database when applied?
    pub const fn requires_round_trip(self) -> bool {
        matches!(
            self,
            LockMode::Read | LockMode::PessimisticRead | LockMode::PessimisticWrite
        )
    }

    /// Is this a row lock taken through a `SELECT ... FOR` clause?
    pub const fn is_pessimistic(self) -> bool {
        matches!(self, LockMode::PessimisticRead | LockMode::PessimisticWrite)
    }

    /// Ordering used when a stronger lock replaces a weaker one.
    pub const fn strength(self) -> u8 {
        match self {
            LockMode::None => 0,
            LockMode::Read => 1,
            LockMode::Optimistic => 2,
            LockMode::OptimisticForceIncrement => 3,
            LockMode::PessimisticRead => 4,
            LockMode::PessimisticWrite => 5,
        }
    }
}
