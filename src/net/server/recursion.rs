//! The contract with the recursion engine.
//!
//! A client hands a question to a [`Resolver`] together with a
//! [`RecursionCallback`]. The resolver eventually completes the callback,
//! which posts [`Event::RecursionDone`] to the client. The callback
//! guarantees that this happens exactly once: if the resolver drops it
//! without completing, the client learns about a failed recursion instead.
//!
//! [`Event::RecursionDone`]: super::event::Event::RecursionDone
use core::fmt;

use tracing::trace;

use super::event::{Event, Mailbox};
use crate::base::iana::Rcode;
use crate::base::message::{Question, Record};

//------------ RecursionOutcome ----------------------------------------------

/// How a recursion ended.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RecursionOutcome {
    /// The resolver found an answer.
    Answered {
        rcode: Rcode,
        answer: Vec<Record>,
        authority: Vec<Record>,
    },

    /// The resolver could not find an answer.
    Failed,

    /// The recursion was canceled by the client.
    Canceled,

    /// The resolver gave up after its own timeout.
    TimedOut,
}

//------------ RecursionHandle -----------------------------------------------

/// Identifies a recursion towards the resolver that started it.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct RecursionHandle(u64);

impl RecursionHandle {
    pub fn new(id: u64) -> Self {
        RecursionHandle(id)
    }

    pub fn id(self) -> u64 {
        self.0
    }
}

//------------ Resolver ------------------------------------------------------

/// A recursion engine.
pub trait Resolver: Send + Sync {
    /// Starts resolving `query`.
    ///
    /// The resolver must eventually complete `callback`. It may do so from
    /// any thread and even before returning.
    fn start_recursion(
        &self,
        query: Question,
        callback: RecursionCallback,
    ) -> RecursionHandle;

    /// Asks the resolver to abandon a recursion.
    ///
    /// The recursion still completes through its callback, typically with
    /// [`RecursionOutcome::Canceled`].
    fn cancel_recursion(&self, handle: RecursionHandle);
}

//------------ RecursionCallback ---------------------------------------------

/// Delivers the outcome of one recursion to the client that started it.
pub struct RecursionCallback {
    mailbox: Option<Mailbox>,
}

impl RecursionCallback {
    pub(super) fn new(mailbox: Mailbox) -> Self {
        RecursionCallback {
            mailbox: Some(mailbox),
        }
    }

    /// Completes the recursion.
    pub fn complete(mut self, outcome: RecursionOutcome) {
        self.post(outcome)
    }

    fn post(&mut self, outcome: RecursionOutcome) {
        if let Some(mailbox) = self.mailbox.take() {
            if mailbox.send(Event::RecursionDone { outcome }).is_err() {
                trace!("recursion completed for a client that is gone");
            }
        }
    }
}

impl Drop for RecursionCallback {
    fn drop(&mut self) {
        self.post(RecursionOutcome::Failed)
    }
}

impl fmt::Debug for RecursionCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecursionCallback")
            .field("completed", &self.mailbox.is_none())
            .finish()
    }
}

//============ Testing =======================================================
