//! State shared by all clients of a server.
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use arc_swap::ArcSwap;

use super::config::Config;
use super::handler::Handlers;
use super::metrics::ServerMetrics;
use super::quota::Quota;
use super::signature::{NoKeys, SignatureVerifier};
use super::view::{Acl, ViewMatcher};

//------------ ResponseSink --------------------------------------------------

/// Receives DNS responses that arrive on a server socket.
///
/// Those belong to the server's own outgoing queries rather than being
/// requests, and are handed over here instead of being processed.
pub trait ResponseSink: Send + Sync {
    fn import(&self, msg: &[u8], peer: SocketAddr);
}

//------------ ServerContext -------------------------------------------------

/// Configuration and collaborators shared by all clients.
pub struct ServerContext {
    /// The configuration. Requests load the current snapshot.
    config: ArcSwap<Config>,

    views: Arc<dyn ViewMatcher>,

    verifier: Arc<dyn SignatureVerifier>,

    handlers: Handlers,

    /// Sources that are ignored entirely.
    blackhole: Acl,

    response_sink: Option<Arc<dyn ResponseSink>>,

    recursion_quota: Arc<Quota>,

    tcp_quota: Arc<Quota>,

    metrics: Arc<ServerMetrics>,
}

/// # Creation
///
impl ServerContext {
    /// Creates a context with the default handlers and verifier.
    ///
    /// Nothing is blackholed and responses arriving on server sockets are
    /// dropped.
    pub fn new(config: Config, views: Arc<dyn ViewMatcher>) -> Self {
        ServerContext {
            recursion_quota: Arc::new(Quota::new(
                config.recursive_clients(),
                config.recursive_clients_soft(),
            )),
            tcp_quota: Arc::new(Quota::new(config.tcp_clients(), 0)),
            config: ArcSwap::from_pointee(config),
            views,
            verifier: Arc::new(NoKeys),
            handlers: Handlers::default(),
            blackhole: Acl::None,
            response_sink: None,
            metrics: Arc::new(ServerMetrics::new()),
        }
    }

    pub fn with_verifier(mut self, verifier: Arc<dyn SignatureVerifier>) -> Self {
        self.verifier = verifier;
        self
    }

    pub fn with_handlers(mut self, handlers: Handlers) -> Self {
        self.handlers = handlers;
        self
    }

    pub fn with_blackhole(mut self, acl: Acl) -> Self {
        self.blackhole = acl;
        self
    }

    pub fn with_response_sink(mut self, sink: Arc<dyn ResponseSink>) -> Self {
        self.response_sink = Some(sink);
        self
    }
}

/// # Access
///
impl ServerContext {
    /// Returns the current configuration.
    pub fn config(&self) -> Arc<Config> {
        self.config.load_full()
    }

    /// Replaces the configuration.
    ///
    /// Requests already in progress keep the configuration they started
    /// with. The quota limits change immediately.
    pub fn reconfigure(&self, config: Config) {
        self.recursion_quota.set_limits(
            config.recursive_clients(),
            config.recursive_clients_soft(),
        );
        self.tcp_quota.set_limits(config.tcp_clients(), 0);
        self.config.store(Arc::new(config));
    }

    pub fn views(&self) -> &dyn ViewMatcher {
        self.views.as_ref()
    }

    pub fn verifier(&self) -> &dyn SignatureVerifier {
        self.verifier.as_ref()
    }

    pub fn handlers(&self) -> &Handlers {
        &self.handlers
    }

    pub fn blackhole(&self) -> &Acl {
        &self.blackhole
    }

    /// Returns whether requests from `addr` are to be ignored.
    pub fn is_blackholed(&self, addr: IpAddr) -> bool {
        self.blackhole.allows(addr)
    }

    pub fn response_sink(&self) -> Option<&Arc<dyn ResponseSink>> {
        self.response_sink.as_ref()
    }

    pub fn recursion_quota(&self) -> &Arc<Quota> {
        &self.recursion_quota
    }

    pub fn tcp_quota(&self) -> &Arc<Quota> {
        &self.tcp_quota
    }

    pub fn metrics(&self) -> &Arc<ServerMetrics> {
        &self.metrics
    }
}
