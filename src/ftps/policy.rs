//! Connection policy: caps concurrent logins

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Maximum number of concurrent logins per FTPS fixture.
pub const MAX_LOGINS: usize = 30;

#[derive(Debug)]
pub struct ConnectionPolicy {
    max_logins: usize,
    active: Arc<AtomicUsize>,
}

impl ConnectionPolicy {
    #[must_use]
    pub fn new(max_logins: usize) -> Self {
        Self {
            max_logins,
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    #[must_use]
    pub const fn max_logins(&self) -> usize {
        self.max_logins
    }

    #[must_use]
    pub fn active_logins(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Reserve a login slot. The slot is released when the guard drops.
    #[must_use]
    pub fn try_login(&self) -> Option<LoginGuard> {
        self.active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.max_logins).then_some(n + 1)
            })
            .ok()
            .map(|_| LoginGuard {
                active: Arc::clone(&self.active),
            })
    }
}

/// Holds one login slot.
#[derive(Debug)]
pub struct LoginGuard {
    active: Arc<AtomicUsize>,
}

impl Drop for LoginGuard {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::AcqRel);
    }
}
