//! Concurrency control for validation jobs.
//!
//! At most `max_running` engine processes run at once. Past that, a
//! submission is either rejected or parked in a bounded queue, depending on
//! the [`OverflowPolicy`]. Slots are released by dropping the [`Admission`]
//! or [`RunPermit`] that holds them, so every exit path gives them back.

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use log::debug;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Fail with `CapacityExceeded` once every running slot is taken.
    Reject,
    /// Park up to `depth` jobs until a running slot frees up.
    Queue { depth: usize },
}

#[derive(Debug, Default)]
struct Counts {
    running: usize,
    queued: usize,
}

#[derive(Debug)]
pub struct ConcurrencyController {
    max_running: usize,
    policy: OverflowPolicy,
    counts: Mutex<Counts>,
    freed: Condvar,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Running,
    Queued,
}

/// A reserved running or queue slot.
#[derive(Debug)]
#[must_use = "dropping an Admission releases its slot"]
pub struct Admission {
    controller: Arc<ConcurrencyController>,
    slot: Option<Slot>,
}

/// A held running slot; released on drop.
#[derive(Debug)]
pub struct RunPermit {
    controller: Arc<ConcurrencyController>,
}

impl ConcurrencyController {
    pub fn new(max_running: usize, policy: OverflowPolicy) -> Arc<Self> {
        Arc::new(Self {
            max_running: max_running.max(1),
            policy,
            counts: Mutex::new(Counts::default()),
            freed: Condvar::new(),
        })
    }

    pub fn max_running(&self) -> usize {
        self.max_running
    }

    pub fn policy(&self) -> OverflowPolicy {
        self.policy
    }

    /// Current (running, queued) counts.
    pub fn snapshot(&self) -> (usize, usize) {
        let counts = self.lock();
        (counts.running, counts.queued)
    }

    /// Reserve a running slot, or a queue slot if the policy allows.
    pub fn admit(self: &Arc<Self>) -> Result<Admission> {
        let mut counts = self.lock();

        let slot = if counts.running < self.max_running {
            counts.running += 1;
            Slot::Running
        } else {
            match self.policy {
                OverflowPolicy::Queue { depth } if counts.queued < depth => {
                    counts.queued += 1;
                    Slot::Queued
                }
                _ => {
                    return Err(Error::CapacityExceeded {
                        running: counts.running,
                        queued: counts.queued,
                        max_running: self.max_running,
                    });
                }
            }
        };

        debug!(
            "slot={:?} running={} queued={} Admitted job",
            slot, counts.running, counts.queued
        );
        Ok(Admission {
            controller: Arc::clone(self),
            slot: Some(slot),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Counts> {
        self.counts.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn release(&self, slot: Slot) {
        let mut counts = self.lock();
        match slot {
            Slot::Running => counts.running = counts.running.saturating_sub(1),
            Slot::Queued => counts.queued = counts.queued.saturating_sub(1),
        }
        drop(counts);
        self.freed.notify_all();
    }
}

impl Admission {
    pub fn is_queued(&self) -> bool {
        self.slot == Some(Slot::Queued)
    }

    /// Block until a running slot is held.
    pub fn wait_for_slot(mut self) -> RunPermit {
        let controller = Arc::clone(&self.controller);

        if self.slot.take() == Some(Slot::Queued) {
            let mut counts = controller.lock();
            while counts.running >= controller.max_running {
                counts = controller
                    .freed
                    .wait(counts)
                    .unwrap_or_else(PoisonError::into_inner);
            }
            counts.queued = counts.queued.saturating_sub(1);
            counts.running += 1;
        }

        RunPermit { controller }
    }
}

impl Drop for Admission {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            self.controller.release(slot);
        }
    }
}

impl Drop for RunPermit {
    fn drop(&mut self) {
        self.controller.release(Slot::Running);
    }
}
