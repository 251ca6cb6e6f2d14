//! Configuration of the client lifecycle.
//!
//! A [`Config`] is held by the [`ServerContext`] behind an [`ArcSwap`] so
//! that it can be replaced while clients are running. Every request loads
//! the snapshot that is current when it starts, i.e., a reconfiguration
//! only affects requests received after it happened.
//!
//! [`ArcSwap`]: arc_swap::ArcSwap
//! [`ServerContext`]: super::context::ServerContext

use std::time::Duration;

use crate::utils::config::DefMinMax;

/// How long a TCP connection may stay idle while waiting for a request.
///
/// The value has to be between 200ms and 30 days. The default value is 30
/// seconds.
const TCP_IDLE_TIMEOUT: DefMinMax<Duration> = DefMinMax::new(
    Duration::from_secs(30),
    Duration::from_millis(200),
    Duration::from_secs(30 * 24 * 60 * 60),
);

/// How long a request may take once it needs asynchronous work.
///
/// The value has to be between 1 second and 1 hour. The default value is
/// 60 seconds.
const REQUEST_LIFETIME: DefMinMax<Duration> = DefMinMax::new(
    Duration::from_secs(60),
    Duration::from_secs(1),
    Duration::from_secs(60 * 60),
);

/// How long to wait before listening again after a failed accept or
/// receive.
///
/// The value has to be between 10ms and 60 seconds. The default value is 1
/// second.
const LISTEN_RETRY_DELAY: DefMinMax<Duration> = DefMinMax::new(
    Duration::from_secs(1),
    Duration::from_millis(10),
    Duration::from_secs(60),
);

/// The largest UDP response the server will send.
///
/// The value has to be between 512 and 4,096 per [RFC 6891]. The default
/// value is 1232 per the [2020 DNS Flag Day].
///
/// [2020 DNS Flag Day]: http://www.dnsflagday.net/2020/
/// [RFC 6891]: https://datatracker.ietf.org/doc/html/rfc6891#section-6.2.5
const MAX_UDP_SIZE: DefMinMax<u16> = DefMinMax::new(1232, 512, 4096);

/// The maximum number of client objects a pool will allocate.
const MAX_CLIENTS: DefMinMax<usize> = DefMinMax::new(10_000, 1, 1_000_000);

/// The number of buffer contexts shared among clients.
const MEMORY_CONTEXTS: DefMinMax<usize> = DefMinMax::new(16, 1, 256);

/// The maximum number of concurrent TCP connections.
const TCP_CLIENTS: DefMinMax<usize> = DefMinMax::new(100, 1, 65_535);

/// The maximum number of concurrent recursive queries.
const RECURSIVE_CLIENTS: DefMinMax<usize> =
    DefMinMax::new(1000, 1, 1_000_000);

/// The maximum silence between two identical FORMERR responses to the same
/// peer after which the second one is considered part of an error loop.
pub const FORMERR_LOOP_WINDOW: Duration = Duration::from_secs(2);

/// The size of a UDP response if the request has no EDNS.
pub const MIN_UDP_SIZE: u16 = 512;

//----------- Config ---------------------------------------------------------

/// Configuration for the client lifecycle.
#[derive(Clone, Copy, Debug)]
pub struct Config {
    /// Idle timeout of TCP connections between requests.
    tcp_idle_timeout: Duration,

    /// Lifetime of requests that need asynchronous work.
    request_lifetime: Duration,

    /// Back-off after a failed accept or receive.
    listen_retry_delay: Duration,

    /// The server-wide ceiling on UDP responses.
    max_udp_size: u16,

    /// The maximum number of client objects.
    max_clients: usize,

    /// The number of shared buffer contexts.
    memory_contexts: usize,

    /// The TCP connection quota.
    tcp_clients: usize,

    /// The recursion quota.
    recursive_clients: usize,
}

impl Config {
    /// Creates a new, default config.
    pub fn new() -> Self {
        Default::default()
    }

    /// Returns the idle timeout of TCP connections.
    pub fn tcp_idle_timeout(&self) -> Duration {
        self.tcp_idle_timeout
    }

    /// Sets the time a TCP connection may stay idle between requests.
    ///
    /// The value has to be between 200ms and 30 days. The default value is
    /// 30 seconds. Values outside of the range are clamped.
    pub fn set_tcp_idle_timeout(&mut self, value: Duration) {
        self.tcp_idle_timeout = TCP_IDLE_TIMEOUT.limit(value);
    }

    /// Returns the lifetime of requests that need asynchronous work.
    pub fn request_lifetime(&self) -> Duration {
        self.request_lifetime
    }

    /// Sets the lifetime of requests that need asynchronous work.
    ///
    /// The timer is armed when a query starts recursion and when an UPDATE
    /// or NOTIFY request is handed over. When it fires, the request is
    /// abandoned.
    ///
    /// The value has to be between 1 second and 1 hour. The default value
    /// is 60 seconds.
    pub fn set_request_lifetime(&mut self, value: Duration) {
        self.request_lifetime = REQUEST_LIFETIME.limit(value);
    }

    /// Returns how long to wait before listening again after a failure.
    pub fn listen_retry_delay(&self) -> Duration {
        self.listen_retry_delay
    }

    /// Sets how long to wait before listening again after a failure.
    ///
    /// The value has to be between 10ms and 60 seconds. The default value
    /// is 1 second.
    pub fn set_listen_retry_delay(&mut self, value: Duration) {
        self.listen_retry_delay = LISTEN_RETRY_DELAY.limit(value);
    }

    /// Returns the largest UDP response the server will send.
    pub fn max_udp_size(&self) -> u16 {
        self.max_udp_size
    }

    /// Sets the largest UDP response the server will send.
    ///
    /// This is also the payload size advertised in the OPT record of
    /// responses. The value has to be between 512 and 4,096. The default
    /// value is 1232.
    pub fn set_max_udp_size(&mut self, value: u16) {
        self.max_udp_size = MAX_UDP_SIZE.limit(value);
    }

    /// Returns the maximum number of client objects.
    pub fn max_clients(&self) -> usize {
        self.max_clients
    }

    /// Sets the maximum number of client objects a pool allocates.
    ///
    /// # Reconfigure
    ///
    /// Lowering the limit does not free existing clients. It only stops new
    /// ones from being allocated.
    pub fn set_max_clients(&mut self, value: usize) {
        self.max_clients = MAX_CLIENTS.limit(value);
    }

    /// Returns the number of shared buffer contexts.
    pub fn memory_contexts(&self) -> usize {
        self.memory_contexts
    }

    /// Sets the number of shared buffer contexts.
    ///
    /// # Reconfigure
    ///
    /// The contexts are created together with the pool. Changing the value
    /// later has no effect.
    pub fn set_memory_contexts(&mut self, value: usize) {
        self.memory_contexts = MEMORY_CONTEXTS.limit(value);
    }

    /// Returns the TCP connection quota.
    pub fn tcp_clients(&self) -> usize {
        self.tcp_clients
    }

    /// Sets the maximum number of concurrently served TCP connections.
    pub fn set_tcp_clients(&mut self, value: usize) {
        self.tcp_clients = TCP_CLIENTS.limit(value);
    }

    /// Returns the recursion quota.
    pub fn recursive_clients(&self) -> usize {
        self.recursive_clients
    }

    /// Returns the soft limit of the recursion quota.
    ///
    /// Beyond it, each new recursion aborts the oldest one. Only quotas
    /// above 1000 have a soft limit, 100 below the hard one. Zero means
    /// there is none.
    pub fn recursive_clients_soft(&self) -> usize {
        if self.recursive_clients > 1000 {
            self.recursive_clients - 100
        } else {
            0
        }
    }

    /// Sets the maximum number of concurrent recursive queries.
    pub fn set_recursive_clients(&mut self, value: usize) {
        self.recursive_clients = RECURSIVE_CLIENTS.limit(value);
    }
}

//--- Default

impl Default for Config {
    fn default() -> Self {
        Self {
            tcp_idle_timeout: TCP_IDLE_TIMEOUT.default(),
            request_lifetime: REQUEST_LIFETIME.default(),
            listen_retry_delay: LISTEN_RETRY_DELAY.default(),
            max_udp_size: MAX_UDP_SIZE.default(),
            max_clients: MAX_CLIENTS.default(),
            memory_contexts: MEMORY_CONTEXTS.default(),
            tcp_clients: TCP_CLIENTS.default(),
            recursive_clients: RECURSIVE_CLIENTS.default(),
        }
    }
}

//============ Testing =======================================================
