//! Client lifecycle related metrics.

//------------ ServerMetrics -------------------------------------------------

use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

/// Metrics shared by all clients of a server context.
///
/// All counters are monotonic except for the number of clients which
/// reflects the clients currently allocated by the pool.
#[derive(Debug, Default)]
pub struct ServerMetrics {
    num_clients: AtomicUsize,

    num_requests: AtomicUsize,

    num_responses: AtomicUsize,

    num_dropped: AtomicUsize,

    num_formerr_loops: AtomicUsize,

    num_truncated: AtomicUsize,

    num_recursions: AtomicUsize,
}

impl ServerMetrics {
    /// Creates a new set of metrics with all counters at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// The number of client objects currently allocated.
    pub fn num_clients(&self) -> usize {
        self.num_clients.load(Ordering::Relaxed)
    }

    /// The number of requests received.
    pub fn num_requests(&self) -> usize {
        self.num_requests.load(Ordering::Relaxed)
    }

    /// The number of responses handed to the transport.
    pub fn num_responses(&self) -> usize {
        self.num_responses.load(Ordering::Relaxed)
    }

    /// The number of requests dropped without a response.
    pub fn num_dropped(&self) -> usize {
        self.num_dropped.load(Ordering::Relaxed)
    }

    /// The number of FORMERR responses suppressed as a likely error loop.
    pub fn num_formerr_loops(&self) -> usize {
        self.num_formerr_loops.load(Ordering::Relaxed)
    }

    /// The number of responses sent with the TC flag.
    pub fn num_truncated(&self) -> usize {
        self.num_truncated.load(Ordering::Relaxed)
    }

    /// The number of recursions started.
    pub fn num_recursions(&self) -> usize {
        self.num_recursions.load(Ordering::Relaxed)
    }

    pub(super) fn inc_clients(&self) {
        self.num_clients.fetch_add(1, Ordering::Relaxed);
    }

    pub(super) fn dec_clients(&self) {
        self.num_clients.fetch_sub(1, Ordering::Relaxed);
    }

    pub(super) fn inc_requests(&self) {
        self.num_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub(super) fn inc_responses(&self) {
        self.num_responses.fetch_add(1, Ordering::Relaxed);
    }

    pub(super) fn inc_dropped(&self) {
        self.num_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub(super) fn inc_formerr_loops(&self) {
        self.num_formerr_loops.fetch_add(1, Ordering::Relaxed);
    }

    pub(super) fn inc_truncated(&self) {
        self.num_truncated.fetch_add(1, Ordering::Relaxed);
    }

    pub(super) fn inc_recursions(&self) {
        self.num_recursions.fetch_add(1, Ordering::Relaxed);
    }
}
