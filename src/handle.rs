//! Atomically swappable native handle holder.
//!
//! Every resource type wraps its native handle in a [`HandleBox`], giving
//! idempotent release (first closer wins, the rest see zero and do nothing)
//! and use-after-release detection without a blocking lock. Release must
//! never block on unrelated device work.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{Error, Result};

/// The value `0` denotes released/absent.
pub const NULL_HANDLE: u64 = 0;

/// Holder for one native-side resource token (device pointer, stream, event,
/// module or options handle).
#[derive(Debug)]
pub struct HandleBox {
    raw: AtomicU64,
}

impl HandleBox {
    /// Box an already-created native handle.
    pub fn new(raw: u64) -> Self {
        Self {
            raw: AtomicU64::new(raw),
        }
    }

    /// An empty box, to be filled later via [`HandleBox::publish`].
    pub fn empty() -> Self {
        Self::new(NULL_HANDLE)
    }

    /// Atomically read and zero the handle.
    ///
    /// Single-consumer release: under concurrent release attempts exactly one
    /// caller observes the live value, all others observe zero.
    pub fn take(&self) -> u64 {
        self.raw.swap(NULL_HANDLE, Ordering::AcqRel)
    }

    /// Current value, or `InvalidState` if the handle has been released or
    /// was never materialized.
    pub fn get(&self) -> Result<u64> {
        match self.raw.load(Ordering::Acquire) {
            NULL_HANDLE => Err(Error::InvalidState("handle released or absent")),
            raw => Ok(raw),
        }
    }

    /// Current value without raising; zero means released/absent.
    pub fn peek(&self) -> u64 {
        self.raw.load(Ordering::Acquire)
    }

    /// Construct-or-adopt: install `candidate` if the box is empty.
    ///
    /// Returns the canonical value. When another thread won the race the
    /// caller's freshly built candidate is *not* installed and must be
    /// destroyed by the caller.
    pub fn publish(&self, candidate: u64) -> u64 {
        match self
            .raw
            .compare_exchange(NULL_HANDLE, candidate, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => candidate,
            Err(winner) => winner,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_take_is_one_shot() {
        let hb = HandleBox::new(42);
        assert_eq!(hb.take(), 42);
        assert_eq!(hb.take(), NULL_HANDLE);
        assert!(hb.get().is_err());
    }

    #[test]
    fn test_get_after_new() {
        let hb = HandleBox::new(7);
        assert_eq!(hb.get().unwrap(), 7);
        assert_eq!(hb.peek(), 7);
    }

    #[test]
    fn test_publish_adopts_winner() {
        let hb = HandleBox::empty();
        assert_eq!(hb.publish(10), 10);
        // Loser keeps the winner's value.
        assert_eq!(hb.publish(20), 10);
        assert_eq!(hb.get().unwrap(), 10);
    }

    #[test]
    fn test_concurrent_take_single_winner() {
        let hb = Arc::new(HandleBox::new(99));
        let mut handles = Vec::new();

        for _ in 0..8 {
            let hb = hb.clone();
            handles.push(std::thread::spawn(move || hb.take()));
        }

        let winners: Vec<u64> = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|&v| v != NULL_HANDLE)
            .collect();

        assert_eq!(winners, vec![99]);
    }
}
