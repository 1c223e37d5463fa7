use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use episode_kernel_core::KernelConfig;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::IngestError;

#[derive(Debug, Default)]
struct Budget {
    outstanding_tickets: usize,
    reserved_bytes: u64,
    reads_in_flight: usize,
    admitted_total: u64,
    rejected_total: u64,
    reads_total: u64,
}

#[derive(Debug)]
struct GuardState {
    max_tickets: usize,
    admissible_bytes: u64,
    budget: Mutex<Budget>,
}

impl GuardState {
    fn budget(&self) -> MutexGuard<'_, Budget> {
        self.budget.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn release(&self, cost: u64) {
        let mut budget = self.budget();
        budget.outstanding_tickets = budget.outstanding_tickets.saturating_sub(1);
        budget.reserved_bytes = budget.reserved_bytes.saturating_sub(cost);
        debug!(
            cost,
            outstanding = budget.outstanding_tickets,
            reserved_bytes = budget.reserved_bytes,
            "released ingestion ticket"
        );
    }
}

/// Process-wide admission control over concurrent ingestion slots and reserved bytes.
///
/// Cloning shares the same budget.
#[derive(Debug, Clone)]
pub struct Guard {
    state: Arc<GuardState>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct GuardStats {
    pub outstanding_tickets: usize,
    pub max_tickets: usize,
    pub reserved_bytes: u64,
    pub admissible_bytes: u64,
    pub reads_in_flight: usize,
    pub admitted_total: u64,
    pub rejected_total: u64,
    pub reads_total: u64,
}

impl Guard {
    #[must_use]
    pub fn new(config: &KernelConfig) -> Self {
        Self::with_limits(config.max_concurrent_episodes, config.admissible_bytes())
    }

    #[must_use]
    pub fn with_limits(max_tickets: usize, admissible_bytes: u64) -> Self {
        Self {
            state: Arc::new(GuardState {
                max_tickets,
                admissible_bytes,
                budget: Mutex::new(Budget::default()),
            }),
        }
    }

    /// Reserve one slot and `estimated_cost` bytes, or fail immediately.
    ///
    /// Check and reservation happen under one lock, so racing callers cannot both
    /// take the last slot.
    ///
    /// # Errors
    /// Returns [`IngestError::Validation`] when `estimated_cost` alone exceeds the
    /// admissible bytes, since no amount of waiting would admit it. Returns
    /// [`IngestError::AdmissionRejected`] when either limit would be exceeded now.
    pub fn admit(&self, estimated_cost: u64) -> Result<AdmissionTicket, IngestError> {
        if estimated_cost > self.state.admissible_bytes {
            warn!(estimated_cost, admissible_bytes = self.state.admissible_bytes, "episode can never fit");
            return Err(IngestError::Validation(format!(
                "episode needs {estimated_cost} bytes but at most {} are admissible",
                self.state.admissible_bytes
            )));
        }
        let mut budget = self.state.budget();
        let slots_ok = budget.outstanding_tickets < self.state.max_tickets;
        let bytes_ok = budget
            .reserved_bytes
            .checked_add(estimated_cost)
            .is_some_and(|total| total <= self.state.admissible_bytes);

        if !(slots_ok && bytes_ok) {
            budget.rejected_total += 1;
            let reason = if slots_ok {
                format!(
                    "reserving {estimated_cost} bytes would exceed {} of {} admissible bytes in use",
                    budget.reserved_bytes, self.state.admissible_bytes
                )
            } else {
                format!(
                    "{} of {} ingestion slots in use",
                    budget.outstanding_tickets, self.state.max_tickets
                )
            };
            warn!(estimated_cost, %reason, "admission rejected");
            return Err(IngestError::AdmissionRejected(reason));
        }

        budget.outstanding_tickets += 1;
        budget.reserved_bytes += estimated_cost;
        budget.admitted_total += 1;
        debug!(
            estimated_cost,
            outstanding = budget.outstanding_tickets,
            reserved_bytes = budget.reserved_bytes,
            "admitted ingestion ticket"
        );

        Ok(AdmissionTicket { state: Arc::clone(&self.state), cost: estimated_cost, released: false })
    }

    /// Account for one query in flight. Reads are never rejected.
    #[must_use]
    pub fn begin_read(&self) -> ReadPermit {
        let mut budget = self.state.budget();
        budget.reads_in_flight += 1;
        budget.reads_total += 1;
        ReadPermit { state: Arc::clone(&self.state) }
    }

    #[must_use]
    pub fn stats(&self) -> GuardStats {
        let budget = self.state.budget();
        GuardStats {
            outstanding_tickets: budget.outstanding_tickets,
            max_tickets: self.state.max_tickets,
            reserved_bytes: budget.reserved_bytes,
            admissible_bytes: self.state.admissible_bytes,
            reads_in_flight: budget.reads_in_flight,
            admitted_total: budget.admitted_total,
            rejected_total: budget.rejected_total,
            reads_total: budget.reads_total,
        }
    }
}

/// A reservation held for the lifetime of one episode's pipeline.
///
/// Released exactly once, either explicitly or on drop (including when the owning
/// future is cancelled).
#[derive(Debug)]
pub struct AdmissionTicket {
    state: Arc<GuardState>,
    cost: u64,
    released: bool,
}

impl AdmissionTicket {
    #[must_use]
    pub fn cost(&self) -> u64 {
        self.cost
    }

    pub fn release(mut self) {
        self.release_once();
    }

    fn release_once(&mut self) {
        if !self.released {
            self.released = true;
            self.state.release(self.cost);
        }
    }
}

impl Drop for AdmissionTicket {
    fn drop(&mut self) {
        self.release_once();
    }
}

#[derive(Debug)]
pub struct ReadPermit {
    state: Arc<GuardState>,
}

impl Drop for ReadPermit {
    fn drop(&mut self) {
        let mut budget = self.state.budget();
        budget.reads_in_flight = budget.reads_in_flight.saturating_sub(1);
    }
}
