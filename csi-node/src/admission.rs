//! Node-wide admission gate for publish operations.
//!
//! The gate never queues: a publish arriving while the node is full is
//! rejected with [`NodeError::Busy`] and left to the caller to retry.

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

use crate::error::NodeError;
use crate::metrics;

/// Default number of publishes allowed in flight.
pub const DEFAULT_CAPACITY: usize = 1;

/// Bounds concurrent publishes. Cheap to clone; clones share the same permits.
#[derive(Debug, Clone)]
pub struct AdmissionGate {
    permits: Arc<Semaphore>,
    capacity: usize,
}

/// Proof of admission. The slot is released when this is dropped.
#[derive(Debug)]
pub struct AdmissionPermit {
    _permit: OwnedSemaphorePermit,
}

impl AdmissionPermit {
    /// Leave the gate explicitly.
    pub fn exit(self) {}
}

impl Default for AdmissionGate {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl AdmissionGate {
    pub fn new(capacity: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// Enter the gate without waiting.
    ///
    /// Returns [`NodeError::Busy`] when all slots are taken.
    pub fn try_enter(&self) -> Result<AdmissionPermit, NodeError> {
        match self.permits.clone().try_acquire_owned() {
            Ok(permit) => {
                debug!(
                    available = self.permits.available_permits(),
                    "Admission permit acquired"
                );
                Ok(AdmissionPermit { _permit: permit })
            }
            Err(_) => {
                metrics::record_admission_rejected();
                warn!(
                    capacity = self.capacity,
                    "Too many concurrent publish operations, rejecting request"
                );
                Err(NodeError::Busy)
            }
        }
    }

    /// Number of free slots.
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
