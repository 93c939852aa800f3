//! VRAM Ledger - byte accounting for accelerator memory.
//!
//! Pure bookkeeping, no I/O. The ledger is the only place capacity is
//! computed: callers reserve before a load, then commit or roll back.
//!
//! Capacity is `total - reserved`. Pending reservations count against it, so
//! `committed + pending <= capacity` holds at every instant, not just at
//! commit points.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::ModelId;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("Insufficient VRAM: requested {requested} bytes, available {available}")]
    Insufficient { requested: u64, available: u64 },

    #[error("Reserved margin {reserved} exceeds total {total}")]
    InvalidBudget { total: u64, reserved: u64 },

    #[error("Unknown reservation token {0}")]
    UnknownToken(u64),
}

/// Point-in-time view of the budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VramBudget {
    pub total_bytes: u64,
    pub reserved_bytes: u64,
    /// Committed allocations of resident models.
    pub used_bytes: u64,
    /// In-flight reservations not yet committed.
    pub pending_bytes: u64,
}

impl VramBudget {
    pub fn capacity(&self) -> u64 {
        self.total_bytes - self.reserved_bytes
    }

    pub fn available(&self) -> u64 {
        self.capacity()
            .saturating_sub(self.used_bytes + self.pending_bytes)
    }

    pub fn utilization(&self) -> f64 {
        if self.capacity() == 0 {
            return 0.0;
        }
        self.used_bytes as f64 / self.capacity() as f64
    }
}

/// Proof of a pending reservation. Must be passed to exactly one of
/// [`VramLedger::commit`] or [`VramLedger::rollback`].
#[derive(Debug)]
#[must_use = "a reservation must be committed or rolled back"]
pub struct ReservationToken {
    id: u64,
    model: ModelId,
    bytes: u64,
    predictive: bool,
}

impl ReservationToken {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    pub fn model(&self) -> &ModelId {
        &self.model
    }

    pub fn is_predictive(&self) -> bool {
        self.predictive
    }
}

#[derive(Debug, Clone, Copy)]
struct Allocation {
    bytes: u64,
    predictive: bool,
}

/// Lock-free VRAM accounting.
pub struct VramLedger {
    total: u64,
    reserved: u64,
    /// committed + pending
    in_use: AtomicU64,
    pending: AtomicU64,
    next_token: AtomicU64,
    reservations: DashMap<u64, ModelId>,
    allocations: DashMap<ModelId, Allocation>,
}

impl VramLedger {
    pub fn new(total_bytes: u64, reserved_bytes: u64) -> Result<Self, LedgerError> {
        if reserved_bytes > total_bytes {
            return Err(LedgerError::InvalidBudget {
                total: total_bytes,
                reserved: reserved_bytes,
            });
        }
        Ok(Self {
            total: total_bytes,
            reserved: reserved_bytes,
            in_use: AtomicU64::new(0),
            pending: AtomicU64::new(0),
            next_token: AtomicU64::new(1),
            reservations: DashMap::new(),
            allocations: DashMap::new(),
        })
    }

    pub fn capacity(&self) -> u64 {
        self.total - self.reserved
    }

    /// Claim `bytes` for `model`. Never blocks: fails immediately when the
    /// headroom is short.
    pub fn reserve(
        &self,
        model: &ModelId,
        bytes: u64,
        predictive: bool,
    ) -> Result<ReservationToken, LedgerError> {
        let capacity = self.capacity();
        let mut current = self.in_use.load(Ordering::Acquire);
        loop {
            let next = match current.checked_add(bytes) {
                Some(n) if n <= capacity => n,
                _ => {
                    return Err(LedgerError::Insufficient {
                        requested: bytes,
                        available: capacity.saturating_sub(current),
                    })
                }
            };
            match self.in_use.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }
        self.pending.fetch_add(bytes, Ordering::AcqRel);

        let id = self.next_token.fetch_add(1, Ordering::Relaxed);
        self.reservations.insert(id, model.clone());
        Ok(ReservationToken {
            id,
            model: model.clone(),
            bytes,
            predictive,
        })
    }

    /// Turn a pending reservation into a committed allocation.
    pub fn commit(&self, token: ReservationToken) -> Result<(), LedgerError> {
        if self.reservations.remove(&token.id).is_none() {
            return Err(LedgerError::UnknownToken(token.id));
        }
        self.allocations
            .entry(token.model.clone())
            .and_modify(|a| {
                a.bytes += token.bytes;
                a.predictive &= token.predictive;
            })
            .or_insert(Allocation {
                bytes: token.bytes,
                predictive: token.predictive,
            });
        self.pending.fetch_sub(token.bytes, Ordering::AcqRel);
        Ok(())
    }

    /// Return a pending reservation's bytes to the pool.
    pub fn rollback(&self, token: ReservationToken) -> Result<(), LedgerError> {
        if self.reservations.remove(&token.id).is_none() {
            return Err(LedgerError::UnknownToken(token.id));
        }
        self.pending.fetch_sub(token.bytes, Ordering::AcqRel);
        self.in_use.fetch_sub(token.bytes, Ordering::AcqRel);
        Ok(())
    }

    /// Free a model's committed allocation. Returns the bytes freed.
    pub fn release(&self, model: &ModelId) -> Option<u64> {
        let (_, allocation) = self.allocations.remove(model)?;
        self.in_use.fetch_sub(allocation.bytes, Ordering::AcqRel);
        Some(allocation.bytes)
    }

    pub fn allocation(&self, model: &ModelId) -> Option<u64> {
        self.allocations.get(model).map(|a| a.bytes)
    }

    pub fn is_predictive(&self, model: &ModelId) -> bool {
        self.allocations
            .get(model)
            .map(|a| a.predictive)
            .unwrap_or(false)
    }

    /// Mark a predictively loaded model as demand-used. Returns true if the
    /// flag was set before.
    pub fn promote(&self, model: &ModelId) -> bool {
        match self.allocations.get_mut(model) {
            Some(mut a) if a.predictive => {
                a.predictive = false;
                true
            }
            _ => false,
        }
    }

    pub fn used_bytes(&self) -> u64 {
        self.in_use
            .load(Ordering::Acquire)
            .saturating_sub(self.pending.load(Ordering::Acquire))
    }

    pub fn pending_bytes(&self) -> u64 {
        self.pending.load(Ordering::Acquire)
    }

    /// Bytes that can be reserved right now.
    pub fn available_bytes(&self) -> u64 {
        self.capacity()
            .saturating_sub(self.in_use.load(Ordering::Acquire))
    }

    /// Committed plus pending bytes; never exceeds `capacity()`.
    pub fn in_use_bytes(&self) -> u64 {
        self.in_use.load(Ordering::Acquire)
    }

    pub fn snapshot(&self) -> VramBudget {
        let in_use = self.in_use.load(Ordering::Acquire);
        let pending = self.pending.load(Ordering::Acquire).min(in_use);
        VramBudget {
            total_bytes: self.total,
            reserved_bytes: self.reserved,
            used_bytes: in_use - pending,
            pending_bytes: pending,
        }
    }
}

#[cfg(test)]
#[path = "vram_ledger_tests.rs"]
mod tests;
