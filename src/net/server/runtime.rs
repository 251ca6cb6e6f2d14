//! Running clients on tokio.
//!
//! [`TokioExecutor`] runs each client as its own task which takes events
//! from the client's mailbox and feeds them to
//! [`ClientState::handle_event`]. The task keeps a [`TokioIo`] next to the
//! client through which all network operations and the timer run.
//!
//! Each operation is a spawned task of its own that posts its completion
//! back into the mailbox. Cancelling an operation signals its task, which
//! then completes it with [`canceled()`]: the client always learns about
//! the end of an operation through an event.
use core::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, trace};

use super::buf::{RequestBuffer, SendBuffer};
use super::client::{ClientState, Disposition};
use super::event::{Event, Events, InFlight, Mailbox, RecvMeta};
use super::interface::Interface;
use super::pool::ClientExecutor;
use super::sock::{canceled, ClientIo, SendStatus};

//------------ TokioExecutor -------------------------------------------------

/// Runs every client as a task on a tokio runtime.
#[derive(Clone, Debug)]
pub struct TokioExecutor {
    handle: Handle,
}

impl TokioExecutor {
    pub fn new(handle: Handle) -> Self {
        TokioExecutor { handle }
    }

    /// Creates an executor for the runtime we are running on.
    pub fn current() -> io::Result<Self> {
        Handle::try_current()
            .map(Self::new)
            .map_err(|err| io::Error::new(io::ErrorKind::Other, err))
    }
}

impl ClientExecutor for TokioExecutor {
    fn spawn(&self, client: ClientState, events: Events) {
        self.handle.spawn(run_client(client, events));
    }
}

/// The task of a client.
async fn run_client(mut client: ClientState, mut events: Events) {
    let (Some(interface), Some(mailbox)) =
        (client.interface().cloned(), client.mailbox().cloned())
    else {
        error!(client = %client.id(), "client spawned without interface");
        return;
    };
    let pool = client.pool.clone();
    let mut io = TokioIo::new(interface, mailbox);
    while let Some(event) = events.recv().await {
        match client.handle_event(event, &mut io) {
            Disposition::Continue => {}
            Disposition::Parked => {
                trace!(client = %client.id(), "client task parks client");
                drop(io);
                pool.park(client);
                return;
            }
            Disposition::Freed => {
                trace!(client = %client.id(), "client task done");
                return;
            }
        }
    }
}

//------------ TokioIo -------------------------------------------------------

/// The accepted connection and its peer.
type StreamSlot = Arc<Mutex<Option<(TcpStream, SocketAddr)>>>;

/// Network operations of a client on the sockets of its interface.
pub struct TokioIo {
    interface: Arc<Interface>,
    mailbox: Mailbox,

    /// The accepted TCP connection.
    ///
    /// The slot is filled by the accept task. Closing the connection
    /// swaps in a fresh slot, the old one goes away with the last task
    /// using it.
    stream: StreamSlot,

    recv_cancel: Option<oneshot::Sender<()>>,
    accept_cancel: Option<oneshot::Sender<()>>,
    read_cancel: Option<oneshot::Sender<()>>,
    send_cancel: Option<oneshot::Sender<()>>,
    timer: Option<JoinHandle<()>>,
}

impl TokioIo {
    pub fn new(interface: Arc<Interface>, mailbox: Mailbox) -> Self {
        TokioIo {
            interface,
            mailbox,
            stream: Arc::new(Mutex::new(None)),
            recv_cancel: None,
            accept_cancel: None,
            read_cancel: None,
            send_cancel: None,
            timer: None,
        }
    }

    fn cancel_op(slot: &mut Option<oneshot::Sender<()>>) {
        if let Some(tx) = slot.take() {
            let _ = tx.send(());
        }
    }
}

fn post(mailbox: &Mailbox, event: Event) {
    if let Err(err) = mailbox.send(event) {
        trace!(event = err.0.name(), "completion for a client that is gone");
    }
}

fn not_connected() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "no socket for transport")
}

/// Reads one length-prefixed message into `storage`.
async fn read_message(
    stream: &mut TcpStream,
    storage: &mut [u8],
) -> io::Result<usize> {
    let len = usize::from(stream.read_u16().await?);
    let Some(target) = storage.get_mut(..len) else {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "message too long",
        ));
    };
    stream.read_exact(target).await?;
    Ok(len)
}

impl ClientIo for TokioIo {
    fn start_recv(&mut self, token: InFlight, mut buf: RequestBuffer) {
        let mailbox = self.mailbox.clone();
        let Some(sock) = self.interface.udp_socket().cloned() else {
            post(&mailbox, Event::Request {
                token,
                buf,
                result: Err(not_connected()),
            });
            return;
        };
        let local = self.interface.local_addr();
        let (tx, rx) = oneshot::channel();
        self.recv_cancel = Some(tx);
        tokio::spawn(async move {
            let res = tokio::select! {
                res = sock.recv_from(buf.storage_mut()) => res,
                _ = rx => Err(canceled()),
            };
            let result = res.map(|(len, peer)| {
                buf.set_len(len);
                RecvMeta::new(peer, Some(local))
            });
            post(&mailbox, Event::Request { token, buf, result });
        });
    }

    fn start_accept(&mut self, token: InFlight) {
        let mailbox = self.mailbox.clone();
        let Some(listener) = self.interface.tcp_listener().cloned() else {
            post(&mailbox, Event::NewConnection {
                token,
                result: Err(not_connected()),
            });
            return;
        };
        let slot = self.stream.clone();
        let (tx, rx) = oneshot::channel();
        self.accept_cancel = Some(tx);
        tokio::spawn(async move {
            let res = tokio::select! {
                res = listener.accept() => res,
                _ = rx => Err(canceled()),
            };
            let result = match res {
                Ok((stream, peer)) => {
                    *slot.lock().await = Some((stream, peer));
                    Ok(peer)
                }
                Err(err) => Err(err),
            };
            post(&mailbox, Event::NewConnection { token, result });
        });
    }

    fn start_read(&mut self, token: InFlight, mut buf: RequestBuffer) {
        let mailbox = self.mailbox.clone();
        let slot = self.stream.clone();
        let local = self.interface.local_addr();
        let (tx, rx) = oneshot::channel();
        self.read_cancel = Some(tx);
        tokio::spawn(async move {
            let res = {
                let mut guard = slot.lock().await;
                match guard.as_mut() {
                    Some((stream, peer)) => {
                        let peer = *peer;
                        tokio::select! {
                            res = read_message(stream, buf.storage_mut()) => {
                                res.map(|len| (len, peer))
                            }
                            _ = rx => Err(canceled()),
                        }
                    }
                    None => Err(not_connected()),
                }
            };
            let result = res.map(|(len, peer)| {
                buf.set_len(len);
                RecvMeta::new(peer, Some(local))
            });
            post(&mailbox, Event::Request { token, buf, result });
        });
    }

    fn start_send(
        &mut self,
        token: InFlight,
        buf: SendBuffer,
        peer: SocketAddr,
    ) -> SendStatus {
        let mailbox = self.mailbox.clone();
        let (tx, rx) = oneshot::channel();

        if !buf.is_prefixed() {
            let Some(sock) = self.interface.udp_socket().cloned() else {
                return SendStatus::Done {
                    token,
                    buf,
                    result: Err(not_connected()),
                };
            };
            match sock.try_send_to(buf.as_wire(), peer) {
                Ok(_) => {
                    return SendStatus::Done {
                        token,
                        buf,
                        result: Ok(()),
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
                Err(err) => {
                    return SendStatus::Done {
                        token,
                        buf,
                        result: Err(err),
                    }
                }
            }
            self.send_cancel = Some(tx);
            tokio::spawn(async move {
                let res = tokio::select! {
                    res = sock.send_to(buf.as_wire(), peer) => res.map(|_| ()),
                    _ = rx => Err(canceled()),
                };
                post(&mailbox, Event::SendDone {
                    token,
                    buf,
                    result: res,
                });
            });
            return SendStatus::Pending;
        }

        let slot = self.stream.clone();
        self.send_cancel = Some(tx);
        tokio::spawn(async move {
            let res = {
                let mut guard = slot.lock().await;
                match guard.as_mut() {
                    Some((stream, _)) => tokio::select! {
                        res = stream.write_all(buf.as_wire()) => res,
                        _ = rx => Err(canceled()),
                    },
                    None => Err(not_connected()),
                }
            };
            post(&mailbox, Event::SendDone {
                token,
                buf,
                result: res,
            });
        });
        SendStatus::Pending
    }

    fn cancel_recv(&mut self) {
        Self::cancel_op(&mut self.recv_cancel)
    }

    fn cancel_accept(&mut self) {
        Self::cancel_op(&mut self.accept_cancel)
    }

    fn cancel_read(&mut self) {
        Self::cancel_op(&mut self.read_cancel)
    }

    fn cancel_send(&mut self) {
        Self::cancel_op(&mut self.send_cancel)
    }

    fn close_connection(&mut self) {
        self.stream = Arc::new(Mutex::new(None));
    }

    fn set_timer(&mut self, generation: u64, after: Duration) {
        self.cancel_timer();
        let mailbox = self.mailbox.clone();
        self.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(after).await;
            post(&mailbox, Event::Timeout { generation });
        }));
    }

    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

impl Drop for TokioIo {
    fn drop(&mut self) {
        self.cancel_timer();
    }
}

impl fmt::Debug for TokioIo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokioIo")
            .field("local_addr", &self.interface.local_addr())
            .finish_non_exhaustive()
    }
}
