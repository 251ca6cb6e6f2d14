//! Network interfaces served by clients.
//!
//! An [`Interface`] is a local address together with the sockets listening
//! on it and, per transport, a [`Gauge`] of how many clients are currently
//! listening against how many should be. Clients consult the gauge when
//! they decide whether they are still needed after a request.
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::net::{TcpListener, UdpSocket};

//------------ Transport -----------------------------------------------------

/// The transport a client serves.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Transport {
    Udp,
    Tcp,
}

impl Transport {
    pub fn is_tcp(self) -> bool {
        matches!(self, Transport::Tcp)
    }
}

//------------ Gauge ---------------------------------------------------------

/// Counts listening clients against a target.
///
/// The current value is the number of accepts or receives outstanding on
/// the interface. It goes up when a client starts listening and down when
/// the accept or receive completes.
#[derive(Debug)]
pub struct Gauge {
    current: AtomicUsize,
    target: usize,
}

impl Gauge {
    fn new(target: usize) -> Self {
        Gauge {
            current: AtomicUsize::new(0),
            target,
        }
    }

    pub fn current(&self) -> usize {
        self.current.load(Ordering::Relaxed)
    }

    pub fn target(&self) -> usize {
        self.target
    }

    /// Returns whether fewer clients are listening than should be.
    pub fn is_short(&self) -> bool {
        self.current() < self.target
    }

    pub(super) fn inc(&self) {
        self.current.fetch_add(1, Ordering::Relaxed);
    }

    pub(super) fn dec(&self) {
        let prev = self.current.fetch_sub(1, Ordering::Relaxed);
        debug_assert!(prev > 0, "gauge dropped below zero");
    }
}

//------------ Interface -----------------------------------------------------

/// A local address served by clients.
///
/// An interface serves a transport if its target number of listening
/// clients for that transport is not zero.
#[derive(Debug)]
pub struct Interface {
    local_addr: SocketAddr,
    udp: Option<Arc<UdpSocket>>,
    tcp: Option<Arc<TcpListener>>,
    udp_gauge: Gauge,
    tcp_gauge: Gauge,
}

/// # Creation
///
impl Interface {
    /// Creates an interface without sockets.
    ///
    /// This is for I/O runtimes that keep their sockets elsewhere.
    pub fn new(local_addr: SocketAddr, udp_target: usize, tcp_target: usize) -> Self {
        Interface {
            local_addr,
            udp: None,
            tcp: None,
            udp_gauge: Gauge::new(udp_target),
            tcp_gauge: Gauge::new(tcp_target),
        }
    }

    /// Binds UDP and TCP sockets to `addr`.
    ///
    /// If the port of `addr` is zero, the TCP listener is bound to the port
    /// picked for UDP.
    pub async fn bind(
        addr: SocketAddr,
        udp_target: usize,
        tcp_target: usize,
    ) -> io::Result<Self> {
        let udp = UdpSocket::bind(addr).await?;
        let local_addr = udp.local_addr()?;
        let tcp = TcpListener::bind(local_addr).await?;
        Ok(Interface::new(local_addr, udp_target, tcp_target)
            .with_udp_socket(Arc::new(udp))
            .with_tcp_listener(Arc::new(tcp)))
    }

    pub fn with_udp_socket(mut self, sock: Arc<UdpSocket>) -> Self {
        self.udp = Some(sock);
        self
    }

    pub fn with_tcp_listener(mut self, listener: Arc<TcpListener>) -> Self {
        self.tcp = Some(listener);
        self
    }
}

/// # Access
///
impl Interface {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn udp_socket(&self) -> Option<&Arc<UdpSocket>> {
        self.udp.as_ref()
    }

    pub fn tcp_listener(&self) -> Option<&Arc<TcpListener>> {
        self.tcp.as_ref()
    }

    pub fn serves(&self, transport: Transport) -> bool {
        self.gauge(transport).target() > 0
    }

    pub fn gauge(&self, transport: Transport) -> &Gauge {
        match transport {
            Transport::Udp => &self.udp_gauge,
            Transport::Tcp => &self.tcp_gauge,
        }
    }
}
