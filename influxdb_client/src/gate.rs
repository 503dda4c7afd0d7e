//! Process-wide bound on in-flight backend writes.

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// A counting semaphore capping the number of concurrent backend writes
/// across all batches.
///
/// The write adapter takes one slot per backend task; when all slots are
/// taken, `acquire` blocks the caller, which in turn throttles the bus pull
/// rate. This is the sole backpressure mechanism on the write path.
#[derive(Debug, Clone)]
pub struct WriteGate {
    semaphore: Arc<Semaphore>,
}

impl WriteGate {
    /// Creates a gate with `capacity` slots.
    pub fn new(capacity: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
        }
    }

    /// Waits until a slot is free and takes it. The slot is released when
    /// the returned permit is dropped.
    pub async fn acquire(&self) -> OwnedSemaphorePermit {
        Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .expect("write gate semaphore closed")
    }

    /// Number of currently free slots.
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }
}
