//! The I/O runtime contract of a client.
//!
//! A client issues network operations through a [`ClientIo`]. Every
//! operation is asynchronous: the call only starts it, and its completion
//! arrives later as an [`Event`] in the client's mailbox, carrying back the
//! [`InFlight`] token and any buffer that was handed over. Cancelling an
//! operation never completes it synchronously either. A canceled operation
//! still delivers its completion, with an error for which [`is_canceled`]
//! is true.
//!
//! The only exception is [`ClientIo::start_send`], which may finish right
//! away and say so through [`SendStatus::Done`].
//!
//! [`Event`]: super::event::Event
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use super::buf::{RequestBuffer, SendBuffer};
use super::event::InFlight;

//------------ ClientIo ------------------------------------------------------

/// Network and timer primitives of one client.
pub trait ClientIo {
    /// Starts receiving a UDP datagram into `buf`.
    fn start_recv(&mut self, token: InFlight, buf: RequestBuffer);

    /// Starts accepting a TCP connection.
    fn start_accept(&mut self, token: InFlight);

    /// Starts reading one length-prefixed message from the accepted
    /// connection into `buf`.
    fn start_read(&mut self, token: InFlight, buf: RequestBuffer);

    /// Starts sending a response to `peer`, via UDP or over the accepted
    /// connection.
    fn start_send(
        &mut self,
        token: InFlight,
        buf: SendBuffer,
        peer: SocketAddr,
    ) -> SendStatus;

    fn cancel_recv(&mut self);

    fn cancel_accept(&mut self);

    fn cancel_read(&mut self);

    fn cancel_send(&mut self);

    /// Closes the accepted TCP connection, if any.
    fn close_connection(&mut self);

    /// Arms the timer, replacing any timer armed before.
    ///
    /// When it fires, an `Event::Timeout` with the given generation is
    /// posted.
    fn set_timer(&mut self, generation: u64, after: Duration);

    /// Disarms the timer.
    ///
    /// A timeout event that is already queued may still arrive.
    fn cancel_timer(&mut self);
}

//------------ SendStatus ----------------------------------------------------

/// What became of a send after it was started.
#[derive(Debug)]
pub enum SendStatus {
    /// The send is in progress and completes through an event.
    Pending,

    /// The send finished immediately.
    Done {
        token: InFlight,
        buf: SendBuffer,
        result: io::Result<()>,
    },
}

//------------ Cancellation --------------------------------------------------

/// Returns the error a canceled operation completes with.
pub fn canceled() -> io::Error {
    io::Error::new(io::ErrorKind::Interrupted, "operation canceled")
}

/// Returns whether an operation completed because it was canceled.
pub fn is_canceled(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::Interrupted
}
