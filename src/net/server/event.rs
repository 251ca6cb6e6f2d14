//! Events delivered to clients and in-flight operation bookkeeping.
//!
//! A client never changes state on its own. Everything it does is the
//! result of an [`Event`] taken from its [`Mailbox`], one at a time. Each
//! asynchronous operation a client issues is represented by an [`InFlight`]
//! token that travels with the operation and comes back inside the
//! completion event, where it is handed to [`Pending::complete`]. The
//! counters in [`Pending`] thus always equal the number of tokens out.
use core::fmt;
use std::io;
use std::net::SocketAddr;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::error;

use super::buf::{RequestBuffer, SendBuffer};
use super::recursion::RecursionOutcome;
use crate::base::iana::OptRcode;

//------------ Mailbox -------------------------------------------------------

/// The sending half of a client's event queue.
pub type Mailbox = mpsc::UnboundedSender<Event>;

/// The receiving half of a client's event queue.
pub type Events = mpsc::UnboundedReceiver<Event>;

/// Creates a new event queue.
pub fn mailbox() -> (Mailbox, Events) {
    mpsc::unbounded_channel()
}

//------------ OpKind --------------------------------------------------------

/// The kinds of asynchronous operations a client keeps count of.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum OpKind {
    /// A TCP accept.
    Accept,

    /// A length-prefixed TCP read.
    Read,

    /// A send of a response.
    Send,

    /// A UDP receive.
    Recv,

    /// An UPDATE handed to its handler.
    Update,

    /// A control event posted to the client itself.
    Control,
}

impl OpKind {
    const COUNT: usize = 6;

    fn index(self) -> usize {
        match self {
            OpKind::Accept => 0,
            OpKind::Read => 1,
            OpKind::Send => 2,
            OpKind::Recv => 3,
            OpKind::Update => 4,
            OpKind::Control => 5,
        }
    }
}

//------------ InFlight ------------------------------------------------------

/// Proof of one outstanding asynchronous operation.
///
/// Tokens are created by [`Pending::issue`] and consumed by
/// [`Pending::complete`]. They cannot be cloned. A token that is dropped
/// without having been completed is a bookkeeping error and gets logged.
#[must_use = "an in-flight operation has to be completed"]
pub struct InFlight {
    kind: OpKind,
    armed: bool,
}

impl InFlight {
    pub fn kind(&self) -> OpKind {
        self.kind
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        if self.armed {
            error!(kind = ?self.kind, "in-flight operation dropped without completion");
        }
    }
}

impl fmt::Debug for InFlight {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("InFlight").field(&self.kind).finish()
    }
}

//------------ Pending -------------------------------------------------------

/// Counters of outstanding asynchronous operations.
#[derive(Debug, Default)]
pub struct Pending {
    counts: [u32; OpKind::COUNT],
}

impl Pending {
    /// Records a new operation and returns its token.
    pub fn issue(&mut self, kind: OpKind) -> InFlight {
        self.counts[kind.index()] += 1;
        InFlight { kind, armed: true }
    }

    /// Records the completion of the operation behind `token`.
    pub fn complete(&mut self, mut token: InFlight) {
        let count = &mut self.counts[token.kind.index()];
        debug_assert!(*count > 0, "{:?} completed more often than issued", token.kind);
        *count = count.saturating_sub(1);
        token.armed = false;
    }

    /// Returns the number of outstanding operations of a kind.
    pub fn count(&self, kind: OpKind) -> u32 {
        self.counts[kind.index()]
    }

    /// Returns whether no operation at all is outstanding.
    pub fn is_idle(&self) -> bool {
        self.counts.iter().all(|&count| count == 0)
    }
}

//------------ RecvMeta ------------------------------------------------------

/// Where and when a request was received.
#[derive(Clone, Copy, Debug)]
pub struct RecvMeta {
    /// The address of the sender.
    pub peer: SocketAddr,

    /// The local address the request was sent to, if known.
    pub dest: Option<SocketAddr>,

    /// When the request was received.
    pub received_at: Instant,
}

impl RecvMeta {
    pub fn new(peer: SocketAddr, dest: Option<SocketAddr>) -> Self {
        RecvMeta {
            peer,
            dest,
            received_at: Instant::now(),
        }
    }
}

//------------ Event ---------------------------------------------------------

/// Everything that can happen to a client.
#[derive(Debug)]
pub enum Event {
    /// The client was attached to an interface and should start listening.
    Start { token: InFlight },

    /// The client should go away.
    Shutdown,

    /// A TCP accept completed.
    ///
    /// On success, the I/O runtime holds on to the connection until it is
    /// closed by the client.
    NewConnection {
        token: InFlight,
        result: io::Result<SocketAddr>,
    },

    /// A UDP receive or TCP read completed.
    ///
    /// The buffer comes back whether the operation succeeded or not.
    Request {
        token: InFlight,
        buf: RequestBuffer,
        result: io::Result<RecvMeta>,
    },

    /// A send completed.
    SendDone {
        token: InFlight,
        buf: SendBuffer,
        result: io::Result<()>,
    },

    /// A timer fired.
    ///
    /// Only the timer armed last is current. Events of earlier generations
    /// are ignored.
    Timeout { generation: u64 },

    /// A recursion started by the client finished.
    RecursionDone { outcome: RecursionOutcome },

    /// The client's recursion was picked to make room for others.
    KillRecursion,

    /// A deferred UPDATE finished with the given response code.
    UpdateDone { token: InFlight, rcode: OptRcode },
}

impl Event {
    /// Returns a short name of the event for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Event::Start { .. } => "start",
            Event::Shutdown => "shutdown",
            Event::NewConnection { .. } => "new connection",
            Event::Request { .. } => "request",
            Event::SendDone { .. } => "send done",
            Event::Timeout { .. } => "timeout",
            Event::RecursionDone { .. } => "recursion done",
            Event::KillRecursion => "kill recursion",
            Event::UpdateDone { .. } => "update done",
        }
    }
}

//============ Testing =======================================================
