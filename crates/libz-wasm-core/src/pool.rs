//! Reuse of idle engine instances.
//!
//! Creating an instance means instantiating the module and resolving its
//! entry points, which dominates the cost of small calls. The
//! [`InstancePool`] keeps instances that finished a call so the next small
//! call can skip that work.
//!
//! Instances are checked out as a [`Lease`]. Dropping the lease puts the
//! instance back. It closes the instance instead if the lease was for a
//! one-off instance, the instance is poisoned, or the holder panicked
//! mid-call.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use libz_wasm_common::LibzError;

use crate::instance::Instance;
use crate::sandbox::Sandbox;

/// Snapshot of pool counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Instances currently parked in the pool.
    pub idle: usize,
    /// Instances created because the pool was empty.
    pub created: u64,
    /// Acquisitions served by a parked instance.
    pub reused: u64,
}

/// Unbounded pool of idle instances.
///
/// Each instance is held by at most one lease at a time; the lock only
/// guards the idle list and is never held while an instance runs.
pub struct InstancePool<S: Sandbox> {
    idle: Mutex<Vec<Instance<S>>>,
    created: AtomicU64,
    reused: AtomicU64,
}

impl<S: Sandbox> InstancePool<S> {
    /// Create an empty pool.
    pub fn new() -> Self {
        Self {
            idle: Mutex::new(Vec::new()),
            created: AtomicU64::new(0),
            reused: AtomicU64::new(0),
        }
    }

    /// Take an idle instance, or build one with `create` if none is parked.
    ///
    /// # Errors
    ///
    /// Returns whatever `create` fails with.
    pub fn acquire(
        &self,
        create: impl FnOnce() -> Result<Instance<S>, LibzError>,
    ) -> Result<Lease<'_, S>, LibzError> {
        let parked = self.idle.lock().pop();

        let instance = match parked {
            Some(instance) => {
                self.reused.fetch_add(1, Ordering::Relaxed);
                trace!(instance = %instance.name(), "Reusing pooled instance");
                instance
            }
            None => {
                let instance = create()?;
                self.created.fetch_add(1, Ordering::Relaxed);
                debug!(instance = %instance.name(), "Created pooled instance");
                instance
            }
        };

        Ok(Lease {
            instance: Some(instance),
            pool: Some(self),
        })
    }

    /// Park an instance for reuse. A poisoned instance is closed instead.
    pub fn release(&self, instance: Instance<S>) {
        if instance.is_poisoned() {
            debug!(instance = %instance.name(), "Closing poisoned instance");
            instance.close();
            return;
        }
        trace!(instance = %instance.name(), "Returning instance to pool");
        self.idle.lock().push(instance);
    }

    /// Close every parked instance.
    pub fn clear(&self) {
        let drained: Vec<_> = std::mem::take(&mut *self.idle.lock());
        for instance in drained {
            instance.close();
        }
    }

    /// Current counters.
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            idle: self.idle.lock().len(),
            created: self.created.load(Ordering::Relaxed),
            reused: self.reused.load(Ordering::Relaxed),
        }
    }
}

impl<S: Sandbox> Default for InstancePool<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: Sandbox> Drop for InstancePool<S> {
    fn drop(&mut self) {
        for instance in self.idle.get_mut().drain(..) {
            instance.close();
        }
    }
}

impl<S: Sandbox> std::fmt::Debug for InstancePool<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstancePool")
            .field("stats", &self.stats())
            .finish()
    }
}

/// Exclusive use of one instance for the duration of a call.
pub struct Lease<'a, S: Sandbox> {
    instance: Option<Instance<S>>,
    pool: Option<&'a InstancePool<S>>,
}

impl<S: Sandbox> Lease<'_, S> {
    /// Lease an instance that is closed, not pooled, when dropped.
    pub fn fresh(instance: Instance<S>) -> Self {
        Self {
            instance: Some(instance),
            pool: None,
        }
    }

    /// Returns `true` if the instance goes back to a pool when dropped.
    pub fn is_pooled(&self) -> bool {
        self.pool.is_some()
    }
}

impl<S: Sandbox> Deref for Lease<'_, S> {
    type Target = Instance<S>;

    fn deref(&self) -> &Instance<S> {
        self.instance
            .as_ref()
            .expect("lease holds its instance until dropped")
    }
}

impl<S: Sandbox> DerefMut for Lease<'_, S> {
    fn deref_mut(&mut self) -> &mut Instance<S> {
        self.instance
            .as_mut()
            .expect("lease holds its instance until dropped")
    }
}

impl<S: Sandbox> Drop for Lease<'_, S> {
    fn drop(&mut self) {
        let Some(instance) = self.instance.take() else {
            return;
        };

        match self.pool {
            // The instance may be mid-call with scratch memory still live
            Some(_) if std::thread::panicking() => {
                warn!(instance = %instance.name(), "Discarding instance after panic");
                instance.close();
            }
            Some(pool) => pool.release(instance),
            None => instance.close(),
        }
    }
}
