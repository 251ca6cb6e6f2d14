//! Admission quotas.
//!
//! A [`Quota`] limits how many of some resource can be in use at once
//! across all clients. Acquiring never blocks: [`Quota::try_acquire`]
//! either hands out a [`QuotaHandle`] or refuses, and what to do about a
//! refusal is up to the caller. The handle gives its share back when it is
//! dropped.
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

//------------ Quota ---------------------------------------------------------

/// A counting admission quota with an optional soft limit.
#[derive(Debug)]
pub struct Quota {
    /// The hard limit. Zero means unlimited.
    max: AtomicUsize,

    /// The soft limit. Zero means none.
    soft: AtomicUsize,

    /// The number of handles currently out.
    used: AtomicUsize,
}

impl Quota {
    pub fn new(max: usize, soft: usize) -> Self {
        Quota {
            max: AtomicUsize::new(max),
            soft: AtomicUsize::new(soft),
            used: AtomicUsize::new(0),
        }
    }

    /// Changes the limits.
    ///
    /// Handles already out are not affected.
    pub fn set_limits(&self, max: usize, soft: usize) {
        self.max.store(max, Ordering::Relaxed);
        self.soft.store(soft, Ordering::Relaxed);
    }

    pub fn max(&self) -> usize {
        self.max.load(Ordering::Relaxed)
    }

    pub fn in_use(&self) -> usize {
        self.used.load(Ordering::Relaxed)
    }

    /// Tries to acquire a share of the quota.
    ///
    /// Returns `None` if the hard limit is reached. A handle acquired beyond
    /// the soft limit says so via [`QuotaHandle::soft_exceeded`].
    pub fn try_acquire(self: &Arc<Self>) -> Option<QuotaHandle> {
        let max = self.max();
        let soft = self.soft.load(Ordering::Relaxed);
        let mut used = self.used.load(Ordering::Relaxed);
        loop {
            if max != 0 && used >= max {
                return None;
            }
            match self.used.compare_exchange_weak(
                used,
                used + 1,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    return Some(QuotaHandle {
                        quota: self.clone(),
                        soft_exceeded: soft != 0 && used >= soft,
                    })
                }
                Err(actual) => used = actual,
            }
        }
    }
}

//------------ QuotaHandle ---------------------------------------------------

/// One acquired share of a [`Quota`].
#[derive(Debug)]
pub struct QuotaHandle {
    quota: Arc<Quota>,
    soft_exceeded: bool,
}

impl QuotaHandle {
    /// Returns whether the share was acquired beyond the soft limit.
    pub fn soft_exceeded(&self) -> bool {
        self.soft_exceeded
    }
}

impl Drop for QuotaHandle {
    fn drop(&mut self) {
        self.quota.used.fetch_sub(1, Ordering::AcqRel);
    }
}

//============ Testing =======================================================
