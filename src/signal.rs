//! Completion flags set from interrupt context.
//!
//! A [`CompletionFlag`] replaces the `volatile bool` that an interrupt handler
//! sets and the driver busy-waits on. The contract is "signal once": the
//! driver [`arm`](CompletionFlag::arm)s the flag before starting a transfer,
//! the interrupt [`signal`](CompletionFlag::signal)s it, and
//! [`wait`](CompletionFlag::wait) consumes the signal.

use portable_atomic::{AtomicBool, AtomicU32, Ordering};

use crate::DriverError;

/// Atomic completion flag with a running count of signals.
#[derive(Debug)]
pub struct CompletionFlag {
    done: AtomicBool,
    count: AtomicU32,
}

impl CompletionFlag {
    /// Create a cleared flag.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            done: AtomicBool::new(false),
            count: AtomicU32::new(0),
        }
    }

    /// Clear any stale signal. Call before starting the transfer that will
    /// signal this flag.
    pub fn arm(&self) {
        self.done.store(false, Ordering::Release);
    }

    /// Mark the transfer complete. Safe to call from an interrupt handler.
    pub fn signal(&self) {
        self.count.fetch_add(1, Ordering::Relaxed);
        self.done.store(true, Ordering::Release);
    }

    /// Whether a signal is pending.
    #[must_use]
    pub fn is_set(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    /// Total number of signals received.
    #[must_use]
    pub fn count(&self) -> u32 {
        self.count.load(Ordering::Relaxed)
    }

    /// Block until the flag is signalled, then consume the signal.
    ///
    /// `poll` runs on every spin. Hardware backends pass a no-op; hosted fakes
    /// use it to make progress. With `spin_limit` set to `None` this never
    /// gives up, so a lost interrupt hangs the caller.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::Timeout`] once `spin_limit` spins have elapsed
    /// without a signal.
    pub fn wait(&self, spin_limit: Option<u32>, mut poll: impl FnMut()) -> Result<(), DriverError> {
        let mut spins: u32 = 0;
        loop {
            if self.done.swap(false, Ordering::AcqRel) {
                return Ok(());
            }
            if let Some(limit) = spin_limit {
                if spins >= limit {
                    warn!("completion wait gave up after {} spins", spins);
                    return Err(DriverError::Timeout);
                }
                spins += 1;
            }
            poll();
            core::hint::spin_loop();
        }
    }
}

impl Default for CompletionFlag {
    fn default() -> Self {
        Self::new()
    }
}
