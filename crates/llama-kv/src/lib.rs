//! # llama-kv
//!
//! Cache-cell accounting for the single shared inference context.
//!
//! Supports:
//! - **Snapshot**: [`ContextState`] reports `{used_cells, capacity}` and answers
//!   whether a pending batch still fits
//! - **Ledger**: [`CellLedger`] is the mutable occupancy counter an in-process
//!   backend keeps next to its cache, so `used <= capacity` holds by construction
//!
//! One cache cell is consumed per processed token. The only way back to an
//! empty cache is an explicit `clear()`.

use std::fmt;

/// Error type for cache-capacity operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KVError {
    #[error("KV cache capacity exceeded: {used} used + {requested} requested > {capacity}")]
    CapacityExceeded {
        requested: usize,
        used: usize,
        capacity: usize,
    },

    #[error("KV cache capacity must be > 0")]
    ZeroCapacity,

    #[error("Inconsistent cache state: {used} used cells > capacity {capacity}")]
    Inconsistent { used: usize, capacity: usize },
}

pub type KVResult<T> = Result<T, KVError>;

/// Point-in-time view of the shared context's cache occupancy.
///
/// # Invariants
/// - `capacity > 0`
/// - `used_cells <= capacity`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextState {
    used_cells: usize,
    capacity: usize,
}

impl ContextState {
    /// Build a snapshot, rejecting states that break the invariants.
    pub fn new(used_cells: usize, capacity: usize) -> KVResult<Self> {
        if capacity == 0 {
            return Err(KVError::ZeroCapacity);
        }
        if used_cells > capacity {
            return Err(KVError::Inconsistent {
                used: used_cells,
                capacity,
            });
        }
        Ok(Self {
            used_cells,
            capacity,
        })
    }

    /// Build a snapshot from engine-reported counters, clamping them into the
    /// invariants (capacity at least 1, used at most capacity).
    pub fn saturating(used_cells: usize, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            used_cells: used_cells.min(capacity),
            capacity,
        }
    }

    pub fn used_cells(&self) -> usize {
        self.used_cells
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Cells still free.
    pub fn remaining(&self) -> usize {
        self.capacity - self.used_cells
    }

    /// True when nothing has been decoded since the last clear.
    pub fn is_empty(&self) -> bool {
        self.used_cells == 0
    }

    /// Check `used_cells + batch_size <= capacity`.
    pub fn check_fits(&self, batch_size: usize) -> KVResult<()> {
        match self.used_cells.checked_add(batch_size) {
            Some(total) if total <= self.capacity => Ok(()),
            _ => Err(KVError::CapacityExceeded {
                requested: batch_size,
                used: self.used_cells,
                capacity: self.capacity,
            }),
        }
    }
}

impl fmt::Display for ContextState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[cells:{}/{}]", self.used_cells, self.capacity)
    }
}

/// Mutable occupancy counter for a capacity-bounded cache.
///
/// `occupy` is all-or-nothing: a batch that does not fit leaves the ledger
/// untouched.
#[derive(Debug, Clone)]
pub struct CellLedger {
    used: usize,
    capacity: usize,
}

impl CellLedger {
    /// Create an empty ledger holding at most `capacity` cells.
    pub fn new(capacity: usize) -> KVResult<Self> {
        if capacity == 0 {
            return Err(KVError::ZeroCapacity);
        }
        Ok(Self { used: 0, capacity })
    }

    /// Claim `n` cells for a decoded batch.
    ///
    /// # Errors
    /// - `CapacityExceeded`: if the batch would overflow; nothing is claimed
    pub fn occupy(&mut self, n: usize) -> KVResult<()> {
        self.state().check_fits(n)?;
        self.used += n;
        Ok(())
    }

    /// Release every cell.
    pub fn clear(&mut self) {
        self.used = 0;
    }

    pub fn used(&self) -> usize {
        self.used
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Current snapshot.
    pub fn state(&self) -> ContextState {
        ContextState {
            used_cells: self.used,
            capacity: self.capacity,
        }
    }
}
