//! Request handlers.
//!
//! Once a request has been parsed, matched to a view and checked, the
//! client hands it to the [`RequestHandler`] for its opcode, wrapped in an
//! [`Exchange`]. The exchange gives access to the request and to what the
//! client learned about it, and it offers the ways a request can end:
//! responding, failing, starting a recursion, or deferring an UPDATE. Each
//! of those consumes the exchange. Dropping an exchange without using one
//! of them drops the request.
use core::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, trace, warn};

use super::client::{ClientState, TimerPurpose};
use super::error::{Error, RequestError};
use super::event::{Event, InFlight, Mailbox, OpKind};
use super::pool::ListId;
use super::recursion::{RecursionCallback, RecursionOutcome};
use super::sock::ClientIo;
use super::view::View;
use crate::base::iana::OptRcode;
use crate::base::message::ParsedMessage;

//------------ RequestHandler ------------------------------------------------

/// Handles the requests of one opcode.
pub trait RequestHandler: Send + Sync {
    /// Handles a new request.
    fn handle(&self, exchange: Exchange<'_>);

    /// Continues a request after the recursion it started has finished.
    fn recursion_done(&self, exchange: Exchange<'_>, outcome: RecursionOutcome) {
        let _ = outcome;
        exchange.send_error(OptRcode::SERVFAIL)
    }
}

//------------ Handlers ------------------------------------------------------

/// The handlers for the opcodes a client dispatches.
#[derive(Clone)]
pub struct Handlers {
    pub query: Arc<dyn RequestHandler>,
    pub update: Arc<dyn RequestHandler>,
    pub notify: Arc<dyn RequestHandler>,
}

impl Default for Handlers {
    /// Queries go to a [`QueryHandler`], everything else is refused as not
    /// implemented.
    fn default() -> Self {
        Handlers {
            query: Arc::new(QueryHandler),
            update: Arc::new(NotImplemented),
            notify: Arc::new(NotImplemented),
        }
    }
}

impl fmt::Debug for Handlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handlers").finish_non_exhaustive()
    }
}

//------------ Exchange ------------------------------------------------------

/// A request being handled.
pub struct Exchange<'a> {
    client: &'a mut ClientState,
    io: &'a mut dyn ClientIo,
    finished: bool,
}

impl<'a> Exchange<'a> {
    pub(super) fn new(
        client: &'a mut ClientState,
        io: &'a mut dyn ClientIo,
    ) -> Self {
        Exchange {
            client,
            io,
            finished: false,
        }
    }

    /// Returns the request, or the response being built from it.
    pub fn message(&self) -> &ParsedMessage {
        &self.client.message
    }

    pub fn message_mut(&mut self) -> &mut ParsedMessage {
        &mut self.client.message
    }

    /// Returns the view the request was matched to.
    pub fn view(&self) -> Option<&Arc<View>> {
        self.client.view.as_ref()
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.client.peer
    }

    pub fn is_tcp(&self) -> bool {
        self.client.is_tcp()
    }

    /// Returns whether the peer may use recursion.
    pub fn recursion_available(&self) -> bool {
        self.client.attributes.ra
    }

    /// Returns whether the request set the DNSSEC OK bit.
    pub fn want_dnssec(&self) -> bool {
        self.client.attributes.want_dnssec
    }

    /// Returns the size limit of a UDP response.
    pub fn udp_size(&self) -> u16 {
        self.client.udp_size
    }

    /// Rearms the request's lifetime timer.
    pub fn set_timeout(&mut self, after: Duration) {
        self.client
            .set_timer(self.io, TimerPurpose::Lifetime, after);
    }

    /// Has a new client take over listening while this request waits.
    pub fn replace(&mut self) -> Result<(), Error> {
        if self.client.mortal {
            return Ok(());
        }
        self.client.replace()
    }

    /// Sends the message as the response.
    pub fn send_response(mut self) {
        self.finished = true;
        self.client.send_response(self.io)
    }

    /// Responds with an error code and no records.
    pub fn send_error(mut self, rcode: OptRcode) {
        self.finished = true;
        self.client.send_error(self.io, rcode)
    }

    /// Ends the request without a response.
    pub fn complete(mut self, result: Result<(), RequestError>) {
        self.finished = true;
        self.client.complete_request(self.io, result)
    }

    /// Hands the request's question to the view's resolver.
    ///
    /// The handler's [`RequestHandler::recursion_done`] is called once the
    /// recursion has finished.
    pub fn start_recursion(mut self) {
        self.finished = true;
        self.client.start_recursion(self.io)
    }

    /// Keeps the request open until the returned ticket is finished.
    pub fn defer_update(mut self) -> UpdateTicket {
        self.finished = true;
        let token = self.client.pending.issue(OpKind::Update);
        UpdateTicket {
            token: Some(token),
            mailbox: self.client.mailbox.clone(),
        }
    }
}

impl Drop for Exchange<'_> {
    fn drop(&mut self) {
        if !self.finished {
            warn!(client = %self.client.id, "request dropped by its handler");
            self.client.drop_request(self.io, "not handled");
        }
    }
}

//------------ UpdateTicket --------------------------------------------------

/// An UPDATE in progress somewhere else.
///
/// The client waits for the ticket before it does anything else. Dropping
/// an unfinished ticket answers with SERVFAIL.
#[derive(Debug)]
pub struct UpdateTicket {
    token: Option<InFlight>,
    mailbox: Option<Mailbox>,
}

impl UpdateTicket {
    /// Finishes the update, responding with `rcode`.
    pub fn finish(mut self, rcode: OptRcode) {
        self.post(rcode)
    }

    fn post(&mut self, rcode: OptRcode) {
        let (Some(token), Some(mailbox)) = (self.token.take(), self.mailbox.take())
        else {
            return;
        };
        if mailbox.send(Event::UpdateDone { token, rcode }).is_err() {
            trace!("update finished for a client that is gone");
        }
    }
}

impl Drop for UpdateTicket {
    fn drop(&mut self) {
        self.post(OptRcode::SERVFAIL)
    }
}

//------------ QueryHandler --------------------------------------------------

/// Answers queries by recursion.
///
/// There is no authoritative data here. A query that asks for recursion
/// and may use it is resolved, everything else is refused.
#[derive(Clone, Copy, Debug, Default)]
pub struct QueryHandler;

impl RequestHandler for QueryHandler {
    fn handle(&self, exchange: Exchange<'_>) {
        if exchange.message().header().rd() && exchange.recursion_available() {
            exchange.start_recursion()
        } else {
            exchange.send_error(OptRcode::REFUSED)
        }
    }

    fn recursion_done(&self, mut exchange: Exchange<'_>, outcome: RecursionOutcome) {
        match outcome {
            RecursionOutcome::Answered {
                rcode,
                answer,
                authority,
            } => {
                let msg = exchange.message_mut();
                if msg.reply(true).is_err() {
                    exchange.send_error(OptRcode::SERVFAIL);
                    return;
                }
                msg.set_rcode(rcode.into());
                for record in answer {
                    msg.push_answer(record);
                }
                for record in authority {
                    msg.push_authority(record);
                }
                exchange.send_response()
            }
            RecursionOutcome::Canceled => {
                exchange.complete(Err(RequestError::Canceled))
            }
            RecursionOutcome::Failed | RecursionOutcome::TimedOut => {
                exchange.send_error(OptRcode::SERVFAIL)
            }
        }
    }
}

//------------ NotImplemented ------------------------------------------------

/// Responds NOTIMP to everything.
#[derive(Clone, Copy, Debug, Default)]
pub struct NotImplemented;

impl RequestHandler for NotImplemented {
    fn handle(&self, exchange: Exchange<'_>) {
        exchange.send_error(OptRcode::NOTIMP)
    }
}

//------------ Recursion -----------------------------------------------------

impl ClientState {
    /// Starts a recursion for the current request.
    ///
    /// The recursion has to fit into the recursion quota. If it does not,
    /// the longest running recursion is canceled to make room for later
    /// requests and this one fails. Past the soft limit, the oldest
    /// recursion is canceled but this one still goes ahead.
    pub(super) fn start_recursion(&mut self, io: &mut dyn ClientIo) {
        let Some(question) = self.message.first_question().cloned() else {
            self.send_error(io, OptRcode::FORMERR);
            return;
        };
        let Some(resolver) =
            self.view.as_ref().and_then(|view| view.resolver().cloned())
        else {
            debug!(client = %self.id, "no resolver for recursion");
            self.send_error(io, OptRcode::SERVFAIL);
            return;
        };
        let Some(mailbox) = self.mailbox.clone() else {
            self.drop_request(io, "detached client");
            return;
        };

        let quota = match self.context.recursion_quota().try_acquire() {
            Some(quota) => {
                if quota.soft_exceeded() {
                    debug!(client = %self.id, "recursive clients soft limit exceeded");
                    self.pool.kill_oldest_recursing();
                }
                quota
            }
            None => {
                warn!(client = %self.id, "no more recursive clients");
                self.pool.kill_oldest_recursing();
                self.send_error(io, OptRcode::SERVFAIL);
                return;
            }
        };

        if !self.mortal && !self.is_tcp() {
            if let Err(err) = self.replace() {
                debug!(client = %self.id, %err, "no client to take over listening");
                drop(quota);
                self.send_error(io, OptRcode::SERVFAIL);
                return;
            }
        }

        self.recursion_quota = Some(quota);
        self.pool.move_to(self.id, ListId::Recursing);
        self.recursing = true;
        self.references += 1;
        let lifetime = self.config.request_lifetime();
        self.set_timer(io, TimerPurpose::Lifetime, lifetime);

        trace!(client = %self.id, qname = %question.qname, "starting recursion");
        let handle = resolver
            .start_recursion(question, RecursionCallback::new(mailbox));
        self.shutdown_hook = Some(Box::new(move |reason| {
            debug!(%reason, "canceling recursion");
            resolver.cancel_recursion(handle)
        }));
        self.context.metrics().inc_recursions();
    }
}
