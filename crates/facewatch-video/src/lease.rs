//! Exclusive leases on capture devices.
//!
//! A V4L2 device streams to one reader at a time. Pipelines take a lease on
//! the device index before opening it; a second pipeline asking for the same
//! index is refused instead of fighting over the handle.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

/// Process-wide registry of leased device indices. Cheap to clone.
#[derive(Debug, Clone, Default)]
pub struct DeviceLeases {
    held: Arc<Mutex<HashSet<u32>>>,
}

impl DeviceLeases {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lease `index`, or `None` if another holder has it.
    pub fn try_acquire(&self, index: u32) -> Option<DeviceLease> {
        let mut held = self.held.lock().unwrap_or_else(|p| p.into_inner());
        if !held.insert(index) {
            return None;
        }
        Some(DeviceLease {
            index,
            held: Arc::clone(&self.held),
        })
    }

    pub fn is_held(&self, index: u32) -> bool {
        self.held
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .contains(&index)
    }
}

/// Held lease; released on drop.
#[derive(Debug)]
pub struct DeviceLease {
    index: u32,
    held: Arc<Mutex<HashSet<u32>>>,
}

impl DeviceLease {
    pub fn index(&self) -> u32 {
        self.index
    }
}

impl Drop for DeviceLease {
    fn drop(&mut self) {
        self.held
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&self.index);
        tracing::debug!(index = self.index, "device lease released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_acquire_refused_until_release() {
        let leases = DeviceLeases::new();
        let first = leases.try_acquire(0).unwrap();
        assert!(leases.try_acquire(0).is_none());
        assert!(leases.is_held(0));

        let other = leases.try_acquire(1).unwrap();
        assert_eq!(other.index(), 1);

        drop(first);
        assert!(!leases.is_held(0));
        assert!(leases.try_acquire(0).is_some());
    }

    #[test]
    fn test_clones_share_registry() {
        let leases = DeviceLeases::new();
        let clone = leases.clone();
        let _lease = leases.try_acquire(3).unwrap();
        assert!(clone.try_acquire(3).is_none());
    }
}
