// SPDX-License-Identifier: Apache-2.0

//! Admission control: a counting semaphore capping in-flight messages.
//!
//! The polling loop acquires a [`Window`] of slots before each receive call
//! and hands one [`Slot`] to every spawned processor. A slot releases its
//! permit on drop, so exactly one permit returns per admitted message no
//! matter how the processor exits, panic included. Surplus slots from a
//! short poll response release when the window is dropped.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Bounded counting semaphore sized to `max_concurrent_messages`.
#[derive(Clone)]
pub struct Admitter {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

impl Admitter {
    /// Creates an admitter with the given number of permits.
    pub fn new(capacity: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// Total number of permits.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Permits not currently held by a window or slot.
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Acquires between one and `max` slots: waits until at least one permit
    /// is free, then greedily takes whatever else is available up to `max`.
    ///
    /// The returned window size is the ceiling for the next receive call, so
    /// a poll can never return more messages than the container may process
    /// concurrently.
    pub async fn admit_window(&self, max: usize) -> Window {
        let mut slots = Vec::with_capacity(max);
        match Arc::clone(&self.semaphore).acquire_owned().await {
            Ok(permit) => slots.push(Slot { _permit: permit }),
            // The semaphore is never closed; treat a closed semaphore as an
            // empty window so callers fall through to their stop check.
            Err(_closed) => return Window { slots },
        }
        while slots.len() < max {
            match Arc::clone(&self.semaphore).try_acquire_owned() {
                Ok(permit) => slots.push(Slot { _permit: permit }),
                Err(_) => break,
            }
        }
        Window { slots }
    }

    /// Waits until every permit is back, i.e. no message is in flight.
    ///
    /// Returns `false` when the deadline passes first; callers abandon the
    /// stragglers in that case.
    pub async fn drain(&self, grace: Duration) -> bool {
        let capacity = u32::try_from(self.capacity).unwrap_or(u32::MAX);
        match tokio::time::timeout(grace, self.semaphore.acquire_many(capacity)).await {
            Ok(Ok(_all_permits)) => true,
            Ok(Err(_closed)) => true,
            Err(_elapsed) => false,
        }
    }
}

/// A batch of admission slots acquired for one receive call.
pub struct Window {
    slots: Vec<Slot>,
}

impl Window {
    /// Number of slots remaining in the window.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether the window has no slots left.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Takes one slot out of the window.
    pub fn take_slot(&mut self) -> Option<Slot> {
        self.slots.pop()
    }
}

/// Permission for one message to be in flight. Dropping it releases the
/// permit back to the admitter.
pub struct Slot {
    _permit: OwnedSemaphorePermit,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn window_is_bounded_by_availability_and_max() {
        let admitter = Admitter::new(4);
        let window = admitter.admit_window(10).await;
        assert_eq!(window.len(), 4);
        assert_eq!(admitter.available(), 0);
        drop(window);
        assert_eq!(admitter.available(), 4);

        let window = admitter.admit_window(2).await;
        assert_eq!(window.len(), 2);
        assert_eq!(admitter.available(), 2);
    }

    #[tokio::test]
    async fn slots_release_individually() {
        let admitter = Admitter::new(3);
        let mut window = admitter.admit_window(3).await;
        let slot = window.take_slot().expect("window has slots");
        drop(window);
        assert_eq!(admitter.available(), 2);
        drop(slot);
        assert_eq!(admitter.available(), 3);
    }

    #[tokio::test]
    async fn admission_waits_for_a_free_permit() {
        let admitter = Admitter::new(1);
        let window = admitter.admit_window(1).await;

        let waiter = {
            let admitter = admitter.clone();
            tokio::spawn(async move { admitter.admit_window(1).await })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        drop(window);
        let window = waiter.await.expect("waiter completes");
        assert_eq!(window.len(), 1);
    }

    #[tokio::test]
    async fn slot_released_on_processor_panic() {
        let admitter = Admitter::new(1);
        let mut window = admitter.admit_window(1).await;
        let slot = window.take_slot().expect("window has slots");
        let task = tokio::spawn(async move {
            let _slot = slot;
            panic!("processor blew up");
        });
        assert!(task.await.is_err());
        assert_eq!(admitter.available(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn drain_times_out_while_a_slot_is_held() {
        let admitter = Admitter::new(2);
        let mut window = admitter.admit_window(2).await;
        let slot = window.take_slot().expect("window has slots");
        drop(window);

        assert!(!admitter.drain(Duration::from_millis(50)).await);
        drop(slot);
        assert!(admitter.drain(Duration::from_millis(50)).await);
    }
}
