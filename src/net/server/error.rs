//! Server related errors.

use core::fmt;
use std::io;

//------------ Error ---------------------------------------------------------

/// Errors raised by the client pool.
///
/// Only failures of the pool itself are reported through this type. What
/// goes wrong while handling a single request never leaves the client.
#[derive(Debug)]
pub enum Error {
    /// The pool is being destroyed and doesn't create new clients.
    ShuttingDown,

    /// No client could be created because the pool is at its limit.
    ClientLimit,

    /// The interface doesn't serve the requested transport.
    NoTransport,

    /// An I/O error happened while bringing up an interface.
    Io(io::Error),
}

//--- From

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err)
    }
}

//--- Display and Error

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::ShuttingDown => f.write_str("client pool is shutting down"),
            Error::ClientLimit => f.write_str("client limit reached"),
            Error::NoTransport => {
                f.write_str("interface does not serve this transport")
            }
            Error::Io(err) => write!(f, "I/O error: {err}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(err) => Some(err),
            _ => None,
        }
    }
}

//------------ RequestError --------------------------------------------------

/// The reason a request did not complete with a sent response.
///
/// On TCP, any of these severs the connection.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RequestError {
    /// A receive or send primitive failed.
    Io(io::ErrorKind),

    /// The request was abandoned by cancellation.
    Canceled,

    /// The request could not be understood well enough to answer it.
    Malformed,

    /// The response did not fit into the available buffer.
    NoSpace,

    /// The request was refused without a response.
    Refused,

    /// The request was dropped on purpose.
    Dropped,
}

impl From<io::Error> for RequestError {
    fn from(err: io::Error) -> Self {
        RequestError::Io(err.kind())
    }
}

impl fmt::Display for RequestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestError::Io(kind) => write!(f, "I/O error: {kind}"),
            RequestError::Canceled => f.write_str("canceled"),
            RequestError::Malformed => f.write_str("malformed request"),
            RequestError::NoSpace => f.write_str("no space for response"),
            RequestError::Refused => f.write_str("refused"),
            RequestError::Dropped => f.write_str("dropped"),
        }
    }
}

impl std::error::Error for RequestError {}

//------------ ShutdownReason ------------------------------------------------

/// Why an in-progress request is asked to stop its asynchronous work.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ShutdownReason {
    /// The client is shutting down.
    ShuttingDown,

    /// The request outlived its idle or lifetime timer.
    TimedOut,

    /// The request was picked to make room for others.
    Canceled,
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ShutdownReason::ShuttingDown => "shutting down",
            ShutdownReason::TimedOut => "timed out",
            ShutdownReason::Canceled => "canceled",
        })
    }
}
