//! Capacity gates bounding the number of in-flight calls.

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Fixed-size counting semaphore shared by every clone.
///
/// One gate is created per pipeline and handed to the classifier at
/// composition time; all of its workers draw from the same pool.
#[derive(Debug, Clone)]
pub struct CapacityGate {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

/// Slot held while a call is in flight. Dropping it frees the slot.
#[derive(Debug)]
pub struct GatePermit {
    _permit: OwnedSemaphorePermit,
}

impl CapacityGate {
    /// Create a gate with `capacity` slots (at least one).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Slots currently free.
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Wait for a free slot.
    pub async fn acquire(&self) -> GatePermit {
        // The semaphore is never closed, so acquisition cannot fail.
        let permit = match Arc::clone(&self.semaphore).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => unreachable!("capacity gate semaphore closed"),
        };
        GatePermit { _permit: permit }
    }
}

/// Optional per-stage bound on fan-out.
#[derive(Debug, Clone, Default)]
pub struct ConcurrencyLimit {
    gate: Option<CapacityGate>,
}

impl ConcurrencyLimit {
    /// No bound: every item gets its own worker immediately.
    pub fn unbounded() -> Self {
        Self { gate: None }
    }

    /// At most `max` workers at a time.
    pub fn bounded(max: usize) -> Self {
        Self {
            gate: Some(CapacityGate::new(max)),
        }
    }

    pub fn from_option(max: Option<usize>) -> Self {
        max.map(Self::bounded).unwrap_or_default()
    }

    /// Wait for room to start another worker. `None` when unbounded.
    pub async fn acquire(&self) -> Option<GatePermit> {
        match &self.gate {
            Some(gate) => Some(gate.acquire().await),
            None => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn permits_are_returned_on_drop() {
        let gate = CapacityGate::new(2);
        let a = gate.acquire().await;
        let _b = gate.acquire().await;
        assert_eq!(gate.available(), 0);

        drop(a);
        assert_eq!(gate.available(), 1);
    }

    #[tokio::test]
    async fn clones_share_capacity() {
        let gate = CapacityGate::new(1);
        let other = gate.clone();
        let _held = gate.acquire().await;

        let blocked = tokio::time::timeout(Duration::from_millis(50), other.acquire()).await;
        assert!(blocked.is_err(), "second acquire should wait for the held slot");
    }

    #[test]
    fn zero_capacity_is_raised_to_one() {
        assert_eq!(CapacityGate::new(0).capacity(), 1);
    }

    #[tokio::test]
    async fn unbounded_limit_never_waits() {
        let limit = ConcurrencyLimit::unbounded();
        assert!(limit.acquire().await.is_none());
        assert!(ConcurrencyLimit::from_option(None).acquire().await.is_none());
        assert!(ConcurrencyLimit::from_option(Some(3)).acquire().await.is_some());
    }
}
