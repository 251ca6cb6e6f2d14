//! The per-client state machine.
//!
//! A [`ClientState`] serves one transport on one interface. For UDP it
//! receives a datagram, handles it, responds, and receives the next one.
//! For TCP it accepts a connection, reads requests from it one after
//! another, and goes back to accepting once the connection is done.
//!
//! The client moves through the [`State`]s `Ready`, `Reading` (TCP only)
//! and `Working` as events arrive. Going back down is never done directly.
//! Instead, a lower target is requested via the pending state, and
//! [`ClientState::advance`] walks down one level at a time, but only once
//! every asynchronous operation belonging to the level being left has
//! delivered its completion. Calling it again after each completion is
//! safe; only the call that finds everything drained performs the step.
use core::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, trace, warn};

use super::buf::{BufContext, RequestBuffer, SendBuffer};
use super::config::{Config, FORMERR_LOOP_WINDOW, MIN_UDP_SIZE};
use super::context::ServerContext;
use super::error::{Error, RequestError, ShutdownReason};
use super::event::{InFlight, Mailbox, OpKind, Pending};
use super::interface::{Interface, Transport};
use super::pool::{ClientPool, ListId};
use super::quota::QuotaHandle;
use super::sock::{ClientIo, SendStatus};
use super::util::to_pcap_text;
use super::view::View;
use crate::base::iana::OptRcode;
use crate::base::message::{Name, Opt, ParsedMessage};

//------------ ClientId ------------------------------------------------------

/// Identifies a client within its pool.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct ClientId(pub(super) usize);

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client#{}", self.0)
    }
}

//------------ State ---------------------------------------------------------

/// The lifecycle states of a client, ordered from least to most active.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub enum State {
    /// The client is gone. Only ever a target.
    Freed,

    /// The client is idle in the pool.
    Inactive,

    /// The client is listening for a connection or datagram.
    Ready,

    /// The client has an accepted TCP connection and reads from it.
    Reading,

    /// The client is handling a request.
    Working,
}

//------------ Advance -------------------------------------------------------

/// The result of [`ClientState::advance`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Advance {
    /// No lower state is pending. The caller carries on.
    NotTransitioning,

    /// A lower state is pending but operations are still outstanding.
    Busy,

    /// The pending state has been reached and the client listens or reads
    /// again.
    Settled,

    /// The client went inactive and is to be handed back to the pool.
    Parked,

    /// The client has been freed.
    Freed,
}

impl Advance {
    /// Returns whether the caller has to stop handling the current event.
    pub fn should_stop(self) -> bool {
        !matches!(self, Advance::NotTransitioning)
    }
}

//------------ Disposition ---------------------------------------------------

/// What the owner of a client is to do after it handled an event.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum Disposition {
    /// Keep delivering events.
    #[default]
    Continue,

    /// Hand the client back to its pool via [`ClientPool::park`].
    Parked,

    /// Drop the client. It has already left its pool.
    Freed,
}

//------------ TimerPurpose --------------------------------------------------

/// What the client's single timer is currently armed for.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TimerPurpose {
    /// A TCP connection waits for its next request.
    Idle,

    /// A request waits for asynchronous work.
    Lifetime,

    /// Listening is retried after a failed accept or receive.
    ListenRetry,
}

#[derive(Clone, Copy, Debug)]
pub(super) struct ArmedTimer {
    pub(super) generation: u64,
    pub(super) purpose: TimerPurpose,
}

//------------ FormerrCache --------------------------------------------------

/// The identity of the last FORMERR response sent.
#[derive(Clone, Copy, Debug)]
pub(super) struct FormerrCache {
    peer: SocketAddr,
    id: u16,
    time: Instant,
}

//------------ Attributes ----------------------------------------------------

/// Per-request flags.
#[derive(Clone, Copy, Debug, Default)]
pub(super) struct Attributes {
    /// Recursion is available to the request.
    pub(super) ra: bool,

    /// The request asked for DNSSEC records.
    pub(super) want_dnssec: bool,
}

/// Called when a request's asynchronous work has to stop.
pub type ShutdownHook = Box<dyn FnOnce(ShutdownReason) + Send>;

//------------ ClientState ---------------------------------------------------

/// A client.
///
/// The object is reused for many requests and, via the pool, for many
/// interfaces. It is owned by exactly one party at a time: the task
/// delivering its events while it is active, or the pool while it is
/// inactive. No field is shared, so nothing in here is locked.
pub struct ClientState {
    pub(super) id: ClientId,
    pub(super) pool: Arc<ClientPool>,
    pub(super) context: Arc<ServerContext>,
    pub(super) buffers: Arc<BufContext>,

    /// The sending half of the client's own event queue.
    pub(super) mailbox: Option<Mailbox>,

    /// The configuration snapshot of the current request.
    pub(super) config: Arc<Config>,

    pub(super) state: State,

    /// The lower state requested, if any. Always below `state`.
    pub(super) pending_state: Option<State>,

    pub(super) transport: Option<Transport>,
    pub(super) interface: Option<Arc<Interface>>,

    /// The I/O runtime holds an accepted TCP connection for us.
    pub(super) connected: bool,

    /// The reusable message. Reset at the end of every request.
    pub(super) message: ParsedMessage,

    pub(super) recv_buf: Option<RequestBuffer>,
    pub(super) send_buf: Option<SendBuffer>,

    /// The matched view while a request is working.
    pub(super) view: Option<Arc<View>>,

    pub(super) pending: Pending,

    /// Handles held by asynchronous subsystems, i.e., recursion.
    pub(super) references: u32,

    pub(super) recursion_quota: Option<QuotaHandle>,
    pub(super) tcp_quota: Option<QuotaHandle>,

    /// The client is on the pool's recursing list.
    pub(super) recursing: bool,

    /// A replacement took over listening and this client may retire.
    pub(super) mortal: bool,

    pub(super) formerr_cache: Option<FormerrCache>,

    pub(super) peer: Option<SocketAddr>,
    pub(super) dest: Option<SocketAddr>,
    pub(super) request_time: Option<Instant>,
    pub(super) attributes: Attributes,

    /// The UDP response size negotiated for the current request.
    pub(super) udp_size: u16,

    /// The OPT record to include in the response.
    pub(super) reply_opt: Option<Opt>,

    /// The key a valid request signature was made with.
    pub(super) signer: Option<Name>,

    pub(super) shutdown_hook: Option<ShutdownHook>,

    pub(super) timer: Option<ArmedTimer>,
    pub(super) timer_generation: u64,

    pub(super) disposition: Disposition,
}

/// # Creation
///
impl ClientState {
    /// Creates a new, inactive client.
    pub(super) fn new(
        id: ClientId,
        pool: Arc<ClientPool>,
        buffers: Arc<BufContext>,
    ) -> Self {
        let context = pool.context().clone();
        context.metrics().inc_clients();
        ClientState {
            id,
            pool,
            config: context.config(),
            context,
            buffers,
            mailbox: None,
            state: State::Inactive,
            pending_state: None,
            transport: None,
            interface: None,
            connected: false,
            message: ParsedMessage::new(),
            recv_buf: None,
            send_buf: None,
            view: None,
            pending: Pending::default(),
            references: 0,
            recursion_quota: None,
            tcp_quota: None,
            recursing: false,
            mortal: false,
            formerr_cache: None,
            peer: None,
            dest: None,
            request_time: None,
            attributes: Attributes::default(),
            udp_size: MIN_UDP_SIZE,
            reply_opt: None,
            signer: None,
            shutdown_hook: None,
            timer: None,
            timer_generation: 0,
            disposition: Disposition::Continue,
        }
    }

    /// Attaches an inactive client to an interface, making it ready.
    pub(super) fn attach(
        &mut self,
        interface: Arc<Interface>,
        transport: Transport,
        mailbox: Mailbox,
    ) {
        debug_assert_eq!(self.state, State::Inactive);
        if let Some(buf) = self.recv_buf.take() {
            let wanted = if transport.is_tcp() {
                super::buf::TCP_RECV_SIZE
            } else {
                super::buf::UDP_RECV_SIZE
            };
            if buf.capacity() == wanted {
                self.recv_buf = Some(buf);
            } else {
                self.buffers.give_request(buf);
            }
        }
        self.interface = Some(interface);
        self.transport = Some(transport);
        self.mailbox = Some(mailbox);
        self.config = self.context.config();
        self.disposition = Disposition::Continue;
        self.state = State::Ready;
    }
}

/// # Access
///
impl ClientState {
    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn pending_state(&self) -> Option<State> {
        self.pending_state
    }

    /// Returns the number of outstanding operations of a kind.
    pub fn pending(&self, kind: OpKind) -> u32 {
        self.pending.count(kind)
    }

    pub fn references(&self) -> u32 {
        self.references
    }

    pub fn transport(&self) -> Option<Transport> {
        self.transport
    }

    pub fn interface(&self) -> Option<&Arc<Interface>> {
        self.interface.as_ref()
    }

    pub fn is_tcp(&self) -> bool {
        self.transport.map_or(false, Transport::is_tcp)
    }

    pub fn is_mortal(&self) -> bool {
        self.mortal
    }

    pub fn holds_recursion_quota(&self) -> bool {
        self.recursion_quota.is_some()
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn message(&self) -> &ParsedMessage {
        &self.message
    }

    pub fn mailbox(&self) -> Option<&Mailbox> {
        self.mailbox.as_ref()
    }

    /// Returns and resets what the owner is to do with the client.
    pub fn take_disposition(&mut self) -> Disposition {
        core::mem::take(&mut self.disposition)
    }
}

/// # State Transitions
///
impl ClientState {
    /// Requests a transition down to `target`.
    ///
    /// The pending state only ever tightens. Targets not below the current
    /// state are ignored.
    pub(super) fn request_state(&mut self, target: State) {
        if target < self.state {
            self.pending_state = Some(match self.pending_state {
                Some(pending) => pending.min(target),
                None => target,
            });
        }
    }

    /// Moves the client towards its pending state as far as possible.
    pub(super) fn advance(&mut self, io: &mut dyn ClientIo) -> Advance {
        let mut target = match self.pending_state {
            Some(target) if target < self.state => target,
            Some(_) => {
                self.pending_state = None;
                return Advance::NotTransitioning;
            }
            None => return Advance::NotTransitioning,
        };

        if self.state == State::Working {
            if self.pending.count(OpKind::Update) > 0 {
                trace!(client = %self.id, "waiting for update to finish");
                return Advance::Busy;
            }
            if self.pending.count(OpKind::Send) > 0 {
                io.cancel_send();
            }
            if self.pending.count(OpKind::Send) > 0
                || self.pending.count(OpKind::Recv) > 0
                || self.references > 0
            {
                trace!(
                    client = %self.id,
                    sends = self.pending.count(OpKind::Send),
                    references = self.references,
                    "waiting to leave working state"
                );
                return Advance::Busy;
            }
            self.end_request(io);
            self.state = State::Reading;
            if target == State::Reading {
                self.pending_state = None;
                self.start_read(io);
                return Advance::Settled;
            }
        }

        if self.state == State::Reading {
            if self.pending.count(OpKind::Read) > 0 {
                io.cancel_read();
                return Advance::Busy;
            }
            if self.connected {
                io.close_connection();
                self.connected = false;
            }
            self.tcp_quota = None;
            self.cancel_timer(io);
            self.peer = None;
            self.dest = None;
            self.state = State::Ready;
            self.check_still_needed();
            target = self.pending_state.unwrap_or(target);
            if target == State::Ready {
                self.pending_state = None;
                self.listen(io);
                return Advance::Settled;
            }
        }

        if self.state == State::Ready {
            if self.pending.count(OpKind::Accept) > 0 {
                io.cancel_accept();
            }
            if self.pending.count(OpKind::Recv) > 0 {
                io.cancel_recv();
            }
            if self.pending.count(OpKind::Accept) > 0
                || self.pending.count(OpKind::Recv) > 0
                || self.pending.count(OpKind::Control) > 0
            {
                trace!(client = %self.id, "waiting to leave ready state");
                return Advance::Busy;
            }
            self.cancel_timer(io);
            self.interface = None;
            self.transport = None;
            self.attributes = Attributes::default();
            self.mortal = false;
            self.state = State::Inactive;
            if target == State::Inactive {
                debug!(client = %self.id, "client inactive");
                self.pending_state = None;
                self.disposition = Disposition::Parked;
                return Advance::Parked;
            }
        }

        debug_assert_eq!(self.state, State::Inactive);
        debug!(client = %self.id, "client freed");
        self.release_resources();
        self.pending_state = None;
        self.pool.remove(self.id);
        self.disposition = Disposition::Freed;
        Advance::Freed
    }

    /// Decides whether a mortal client keeps listening.
    ///
    /// It does as long as its interface has fewer listeners than it should.
    /// Otherwise it retires and goes inactive.
    fn check_still_needed(&mut self) {
        if !self.mortal {
            return;
        }
        let (Some(interface), Some(transport)) =
            (self.interface.as_ref(), self.transport)
        else {
            return;
        };
        if interface.gauge(transport).is_short() {
            trace!(client = %self.id, "mortal client still needed");
            self.mortal = false;
        } else {
            self.request_state(State::Inactive);
        }
    }

    /// Releases everything belonging to the current request.
    fn end_request(&mut self, io: &mut dyn ClientIo) {
        self.signer = None;
        debug_assert!(
            self.recursion_quota.is_none(),
            "recursion quota held past the request"
        );
        self.recursion_quota = None;
        if self.recursing {
            self.pool.move_to(self.id, ListId::Active);
            self.recursing = false;
        }
        self.shutdown_hook = None;
        self.view = None;
        self.message.reset();
        self.cancel_timer(io);
        self.reply_opt = None;
        self.udp_size = MIN_UDP_SIZE;
        self.attributes = Attributes::default();
        self.request_time = None;
    }

    /// Gives back everything the client owns.
    ///
    /// This is the last thing that happens to a client.
    pub(super) fn release_resources(&mut self) {
        if self.state == State::Freed {
            return;
        }
        if let Some(buf) = self.recv_buf.take() {
            self.buffers.give_request(buf);
        }
        if let Some(buf) = self.send_buf.take() {
            self.buffers.give_send(buf);
        }
        self.message.reset();
        self.mailbox = None;
        self.view = None;
        self.shutdown_hook = None;
        self.formerr_cache = None;
        self.state = State::Freed;
        self.context.metrics().dec_clients();
    }
}

/// # Listening and Timers
///
impl ClientState {
    /// Starts accepting or receiving unless that is already happening.
    pub(super) fn listen(&mut self, io: &mut dyn ClientIo) {
        let (Some(interface), Some(transport)) =
            (self.interface.clone(), self.transport)
        else {
            return;
        };
        match transport {
            Transport::Tcp => {
                if self.pending.count(OpKind::Accept) == 0 {
                    interface.gauge(transport).inc();
                    let token = self.pending.issue(OpKind::Accept);
                    trace!(client = %self.id, "accepting");
                    io.start_accept(token);
                }
            }
            Transport::Udp => {
                if self.pending.count(OpKind::Recv) == 0 {
                    interface.gauge(transport).inc();
                    let buf = self.take_recv_buf(false);
                    let token = self.pending.issue(OpKind::Recv);
                    trace!(client = %self.id, "receiving");
                    io.start_recv(token, buf);
                }
            }
        }
    }

    /// Starts reading the next request from the TCP connection.
    pub(super) fn start_read(&mut self, io: &mut dyn ClientIo) {
        let buf = self.take_recv_buf(true);
        let token = self.pending.issue(OpKind::Read);
        io.start_read(token, buf);
        let idle = self.config.tcp_idle_timeout();
        self.set_timer(io, TimerPurpose::Idle, idle);
    }

    fn take_recv_buf(&mut self, tcp: bool) -> RequestBuffer {
        match self.recv_buf.take() {
            Some(buf) => buf,
            None => self.buffers.take_request(tcp),
        }
    }

    pub(super) fn set_timer(
        &mut self,
        io: &mut dyn ClientIo,
        purpose: TimerPurpose,
        after: Duration,
    ) {
        self.timer_generation += 1;
        self.timer = Some(ArmedTimer {
            generation: self.timer_generation,
            purpose,
        });
        io.set_timer(self.timer_generation, after);
    }

    pub(super) fn cancel_timer(&mut self, io: &mut dyn ClientIo) {
        if self.timer.take().is_some() {
            io.cancel_timer();
        }
    }
}

/// # Completing Requests
///
impl ClientState {
    /// Finishes the current request.
    ///
    /// A TCP connection stays open for the next request only if the
    /// request succeeded. UDP clients go back to receiving either way.
    pub(super) fn complete_request(
        &mut self,
        io: &mut dyn ClientIo,
        result: Result<(), RequestError>,
    ) {
        let target = match result {
            Ok(()) if self.is_tcp() => State::Reading,
            Ok(()) => State::Ready,
            Err(err) => {
                debug!(client = %self.id, %err, "request failed");
                State::Ready
            }
        };
        self.request_state(target);
        self.advance(io);
    }

    /// Drops the current request without a response.
    pub(super) fn drop_request(&mut self, io: &mut dyn ClientIo, why: &str) {
        debug!(client = %self.id, peer = ?self.peer, why, "dropping request");
        self.context.metrics().inc_dropped();
        self.complete_request(io, Err(RequestError::Dropped));
    }

    /// Spawns a new client to take over listening on our interface.
    ///
    /// On success this client becomes mortal.
    pub(super) fn replace(&mut self) -> Result<(), Error> {
        let (Some(interface), Some(transport)) =
            (self.interface.clone(), self.transport)
        else {
            return Err(Error::NoTransport);
        };
        self.pool.create_clients(1, &interface, transport)?;
        self.mortal = true;
        Ok(())
    }

    /// Responds with nothing but an error code.
    ///
    /// The reply keeps the question if it can. Repeated FORMERR responses
    /// to the same peer and message ID within a short window are dropped
    /// to break error loops.
    pub(super) fn send_error(&mut self, io: &mut dyn ClientIo, rcode: OptRcode) {
        if self.message.reply(true).is_err() {
            if let Err(err) = self.message.reply(false) {
                debug!(client = %self.id, %err, "cannot form error reply");
                self.complete_request(io, Err(RequestError::Malformed));
                return;
            }
        }
        self.message.set_rcode(rcode);

        if rcode == OptRcode::FORMERR {
            let id = self.message.header().id();
            let now = self.request_time.unwrap_or_else(Instant::now);
            if let (Some(peer), Some(cache)) = (self.peer, self.formerr_cache) {
                if cache.peer == peer
                    && cache.id == id
                    && now.saturating_duration_since(cache.time)
                        < FORMERR_LOOP_WINDOW
                {
                    debug!(
                        client = %self.id,
                        %peer,
                        "possible error packet loop, FORMERR dropped"
                    );
                    self.context.metrics().inc_formerr_loops();
                    self.complete_request(io, Ok(()));
                    return;
                }
            }
            if let Some(peer) = self.peer {
                self.formerr_cache = Some(FormerrCache {
                    peer,
                    id,
                    time: now,
                });
            }
        }
        self.send_response(io);
    }

    /// Renders the message and sends it to the peer.
    pub(super) fn send_response(&mut self, io: &mut dyn ClientIo) {
        let Some(peer) = self.peer else {
            self.drop_request(io, "no peer to respond to");
            return;
        };
        let tcp = self.is_tcp();
        if self.attributes.ra {
            self.message.header_mut().set_ra(true);
        }
        self.message.set_outgoing_opt(self.reply_opt.clone());
        let limit = if tcp {
            usize::from(u16::MAX)
        } else if self.reply_opt.is_some() {
            usize::from(self.udp_size)
        } else {
            usize::from(MIN_UDP_SIZE)
        };

        let mut buf = match self.send_buf.take() {
            Some(buf) if buf.is_prefixed() == tcp => buf,
            Some(buf) => {
                self.buffers.give_send(buf);
                self.buffers.take_send(tcp)
            }
            None => self.buffers.take_send(tcp),
        };
        buf.begin();
        match self.message.render(limit, buf.target()) {
            Ok(truncated) => {
                if truncated {
                    trace!(client = %self.id, limit, "response truncated");
                    self.context.metrics().inc_truncated();
                }
            }
            Err(err) => {
                warn!(client = %self.id, %err, "cannot render response");
                self.send_buf = Some(buf);
                self.complete_request(io, Err(RequestError::NoSpace));
                return;
            }
        }
        buf.finish();

        if tracing::enabled!(tracing::Level::TRACE) {
            let bytes = buf.message();
            let pcap_text = to_pcap_text(bytes, bytes.len());
            trace!(client = %self.id, %peer, pcap_text, "Sending response");
        }
        self.context.metrics().inc_responses();

        let token = self.pending.issue(OpKind::Send);
        match io.start_send(token, buf, peer) {
            SendStatus::Pending => {}
            SendStatus::Done { token, buf, result } => {
                self.on_send_done(io, token, buf, result)
            }
        }
    }

    /// Handles the completion of a send.
    pub(super) fn on_send_done(
        &mut self,
        io: &mut dyn ClientIo,
        token: InFlight,
        buf: SendBuffer,
        result: std::io::Result<()>,
    ) {
        self.pending.complete(token);
        if buf.is_prefixed() {
            self.buffers.give_send(buf);
        } else {
            self.send_buf = Some(buf);
        }
        if let Err(err) = &result {
            if !super::sock::is_canceled(err) {
                warn!(client = %self.id, %err, "error sending response");
            }
        }
        if self.advance(io).should_stop() {
            return;
        }
        self.complete_request(io, result.map_err(RequestError::from));
    }
}

impl fmt::Debug for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientState")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("pending_state", &self.pending_state)
            .field("transport", &self.transport)
            .field("pending", &self.pending)
            .field("references", &self.references)
            .field("mortal", &self.mortal)
            .finish_non_exhaustive()
    }
}
