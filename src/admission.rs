//! Bounded-capacity admission gate shared by all renders of one engine.
//!
//! Renders below the cap are admitted on a lock-free fast path and never
//! serialize against each other. Once the cap is in sight, admission goes
//! through a single rendezvous slot, so at most one over-cap render is
//! waiting to start at a time. The fast-path predicate is strictly
//! `active + 1 < max`, which reserves the last admission for the slot; see
//! DESIGN.md.

use std::sync::atomic::{AtomicI64, Ordering};

use tokio::sync::{Semaphore, SemaphorePermit};
use tokio::time::{timeout_at, Instant};
use tracing::debug;

use crate::error::{RenderError, RenderErrorKind};

#[derive(Debug)]
pub(crate) struct Admission {
    active: AtomicI64,
    slot: Semaphore,
}

/// Proof of admission. Dropping it releases the gate.
#[derive(Debug)]
pub(crate) struct AdmissionPermit<'a> {
    gate: &'a Admission,
    _slot: Option<SemaphorePermit<'a>>,
}

impl Admission {
    pub(crate) fn new() -> Self {
        Self {
            active: AtomicI64::new(0),
            slot: Semaphore::new(1),
        }
    }

    pub(crate) async fn acquire(
        &self,
        deadline: Instant,
        max_connections: i64,
        wait_for_connection: bool,
    ) -> Result<AdmissionPermit<'_>, RenderError> {
        const OP: &str = "admission.acquire";

        let fast = self
            .active
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                (current + 1 < max_connections).then_some(current + 1)
            })
            .is_ok();
        if fast {
            debug!(target: "admission", "admitted without the slot");
            return Ok(AdmissionPermit {
                gate: self,
                _slot: None,
            });
        }

        if self.active.load(Ordering::SeqCst) >= max_connections && !wait_for_connection {
            return Err(RenderError::new(RenderErrorKind::NoCapacity, OP)
                .with_detail("no available connections"));
        }

        debug!(target: "admission", "waiting for the slot");
        match timeout_at(deadline, self.slot.acquire()).await {
            Ok(Ok(permit)) => {
                self.active.fetch_add(1, Ordering::SeqCst);
                debug!(target: "admission", "slot acquired");
                Ok(AdmissionPermit {
                    gate: self,
                    _slot: Some(permit),
                })
            }
            Ok(Err(_)) => Err(RenderError::new(RenderErrorKind::Unexpected, OP)
                .with_detail("admission slot closed")),
            Err(_) => Err(RenderError::new(RenderErrorKind::DeadlineExceeded, OP)
                .with_detail("no slot before the deadline")),
        }
    }

    #[cfg(test)]
    fn active(&self) -> i64 {
        self.active.load(Ordering::SeqCst)
    }
}

impl Drop for AdmissionPermit<'_> {
    fn drop(&mut self) {
        self.gate.active.fetch_sub(1, Ordering::SeqCst);
    }
}
