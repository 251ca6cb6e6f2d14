//! Tests of the client lifecycle against a scripted I/O runtime.
//!
//! Clients are driven by hand here: [`MockIo`] records every primitive a
//! client issues and keeps the tokens of outstanding operations so a test
//! can complete them in whatever order it likes. [`ManualExecutor`] simply
//! collects the clients the pool spawns.
use core::sync::atomic::{AtomicU64, Ordering};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use parking_lot::Mutex;

use super::buf::{RequestBuffer, SendBuffer};
use super::client::{ClientState, Disposition, State};
use super::config::Config;
use super::context::{ResponseSink, ServerContext};
use super::error::Error;
use super::event::{Event, Events, InFlight, Mailbox, OpKind, RecvMeta};
use super::handler::{Exchange, Handlers, RequestHandler, UpdateTicket};
use super::interface::{Interface, Transport};
use super::pool::{ClientExecutor, ClientPool, ListId};
use super::recursion::{
    RecursionCallback, RecursionHandle, RecursionOutcome, Resolver,
};
use super::sock::{canceled, ClientIo, SendStatus};
use super::view::{Acl, PeerConfig, View, ViewList};
use crate::base::iana::{Class, Opcode, OptRcode, Rcode, Rtype};
use crate::base::message::{Name, Opt, ParsedMessage, Question, Record};

//------------ MockIo --------------------------------------------------------

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Op {
    Recv,
    Accept,
    Read,
    Send,
    CancelRecv,
    CancelAccept,
    CancelRead,
    CancelSend,
    Close,
    SetTimer,
    CancelTimer,
}

struct MockIo {
    mailbox: Mailbox,
    ops: Vec<Op>,
    recv: Option<(InFlight, RequestBuffer)>,
    accept: Option<InFlight>,
    read: Option<(InFlight, RequestBuffer)>,
    send: Option<(InFlight, SendBuffer)>,

    /// Sends complete right away instead of waiting for the test.
    sync_send: bool,

    /// Every message sent, without a length prefix.
    sent: Vec<(SocketAddr, Vec<u8>)>,
    timer: Option<(u64, Duration)>,
    peer: Option<SocketAddr>,
}

impl MockIo {
    fn new(mailbox: Mailbox) -> Self {
        MockIo {
            mailbox,
            ops: Vec::new(),
            recv: None,
            accept: None,
            read: None,
            send: None,
            sync_send: true,
            sent: Vec::new(),
            timer: None,
            peer: None,
        }
    }

    fn count(&self, op: Op) -> usize {
        self.ops.iter().filter(|&&item| item == op).count()
    }

    fn post(&self, event: Event) {
        self.mailbox.send(event).expect("mailbox closed");
    }
}

impl ClientIo for MockIo {
    fn start_recv(&mut self, token: InFlight, buf: RequestBuffer) {
        assert!(self.recv.is_none(), "second receive started");
        self.ops.push(Op::Recv);
        self.recv = Some((token, buf));
    }

    fn start_accept(&mut self, token: InFlight) {
        assert!(self.accept.is_none(), "second accept started");
        self.ops.push(Op::Accept);
        self.accept = Some(token);
    }

    fn start_read(&mut self, token: InFlight, buf: RequestBuffer) {
        assert!(self.read.is_none(), "second read started");
        self.ops.push(Op::Read);
        self.read = Some((token, buf));
    }

    fn start_send(
        &mut self,
        token: InFlight,
        buf: SendBuffer,
        peer: SocketAddr,
    ) -> SendStatus {
        self.ops.push(Op::Send);
        self.sent.push((peer, buf.message().to_vec()));
        if self.sync_send {
            SendStatus::Done {
                token,
                buf,
                result: Ok(()),
            }
        } else {
            self.send = Some((token, buf));
            SendStatus::Pending
        }
    }

    fn cancel_recv(&mut self) {
        self.ops.push(Op::CancelRecv);
        if let Some((token, buf)) = self.recv.take() {
            self.post(Event::Request {
                token,
                buf,
                result: Err(canceled()),
            });
        }
    }

    fn cancel_accept(&mut self) {
        self.ops.push(Op::CancelAccept);
        if let Some(token) = self.accept.take() {
            self.post(Event::NewConnection {
                token,
                result: Err(canceled()),
            });
        }
    }

    fn cancel_read(&mut self) {
        self.ops.push(Op::CancelRead);
        if let Some((token, buf)) = self.read.take() {
            self.post(Event::Request {
                token,
                buf,
                result: Err(canceled()),
            });
        }
    }

    fn cancel_send(&mut self) {
        self.ops.push(Op::CancelSend);
        if let Some((token, buf)) = self.send.take() {
            self.post(Event::SendDone {
                token,
                buf,
                result: Err(canceled()),
            });
        }
    }

    fn close_connection(&mut self) {
        self.ops.push(Op::Close);
        self.peer = None;
    }

    fn set_timer(&mut self, generation: u64, after: Duration) {
        self.ops.push(Op::SetTimer);
        self.timer = Some((generation, after));
    }

    fn cancel_timer(&mut self) {
        self.ops.push(Op::CancelTimer);
        self.timer = None;
    }
}

//------------ ManualExecutor ------------------------------------------------

#[derive(Default)]
struct ManualExecutor {
    spawned: Mutex<Vec<(ClientState, Events)>>,
}

impl ManualExecutor {
    fn take(&self) -> Vec<(ClientState, Events)> {
        core::mem::take(&mut *self.spawned.lock())
    }
}

impl ClientExecutor for ManualExecutor {
    fn spawn(&self, client: ClientState, events: Events) {
        self.spawned.lock().push((client, events));
    }
}

//------------ StubResolver --------------------------------------------------

#[derive(Default)]
struct StubResolver {
    next_id: AtomicU64,

    /// Complete every recursion with this right away.
    immediate: Option<RecursionOutcome>,

    pending: Mutex<Vec<(RecursionHandle, Question, RecursionCallback)>>,
    canceled: Mutex<Vec<RecursionHandle>>,
}

impl StubResolver {
    fn immediate(outcome: RecursionOutcome) -> Self {
        StubResolver {
            immediate: Some(outcome),
            ..Default::default()
        }
    }

    fn num_pending(&self) -> usize {
        self.pending.lock().len()
    }

    fn complete_next(&self, outcome: RecursionOutcome) {
        let (_, _, callback) = self.pending.lock().remove(0);
        callback.complete(outcome);
    }
}

impl Resolver for StubResolver {
    fn start_recursion(
        &self,
        query: Question,
        callback: RecursionCallback,
    ) -> RecursionHandle {
        let handle =
            RecursionHandle::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        match self.immediate.clone() {
            Some(outcome) => callback.complete(outcome),
            None => self.pending.lock().push((handle, query, callback)),
        }
        handle
    }

    fn cancel_recursion(&self, handle: RecursionHandle) {
        self.canceled.lock().push(handle);
        let found = {
            let mut pending = self.pending.lock();
            pending
                .iter()
                .position(|(item, _, _)| *item == handle)
                .map(|idx| pending.remove(idx))
        };
        if let Some((_, _, callback)) = found {
            callback.complete(RecursionOutcome::Canceled);
        }
    }
}

//------------ Handlers for testing ------------------------------------------

#[derive(Default)]
struct DeferringUpdates {
    tickets: Mutex<Vec<UpdateTicket>>,
}

impl RequestHandler for DeferringUpdates {
    fn handle(&self, exchange: Exchange<'_>) {
        self.tickets.lock().push(exchange.defer_update());
    }
}

struct Forgetful;

impl RequestHandler for Forgetful {
    fn handle(&self, _exchange: Exchange<'_>) {}
}

#[derive(Default)]
struct RecordingSink {
    imported: Mutex<Vec<(Vec<u8>, SocketAddr)>>,
}

impl ResponseSink for RecordingSink {
    fn import(&self, msg: &[u8], peer: SocketAddr) {
        self.imported.lock().push((msg.to_vec(), peer));
    }
}

//------------ TestClient ----------------------------------------------------

/// A client driven by hand.
struct TestClient {
    client: Option<ClientState>,
    events: Events,
    io: MockIo,
    pool: Arc<ClientPool>,
    gone: Option<Disposition>,
}

impl TestClient {
    fn new((client, events): (ClientState, Events), pool: Arc<ClientPool>) -> Self {
        let mailbox = client.mailbox().cloned().expect("client not attached");
        TestClient {
            client: Some(client),
            events,
            io: MockIo::new(mailbox),
            pool,
            gone: None,
        }
    }

    fn client(&self) -> &ClientState {
        self.client.as_ref().expect("client is gone")
    }

    fn state(&self) -> State {
        match (&self.client, self.gone) {
            (Some(client), _) => client.state(),
            (None, Some(Disposition::Parked)) => State::Inactive,
            (None, _) => State::Freed,
        }
    }

    /// Handles a single event and checks the invariants afterwards.
    fn handle(&mut self, event: Event) -> Disposition {
        let client = self.client.as_mut().expect("client is gone");
        let before = (client.state(), client.pending_state());
        let res = client.handle_event(event, &mut self.io);

        if res == Disposition::Continue {
            if let (_, Some(target)) = before {
                if client.pending_state().is_some() {
                    // Still tearing down towards `target` or below.
                    assert!(client.state() <= before.0);
                    assert!(client.pending_state() <= Some(target));
                }
            }
            if let Some(pending) = client.pending_state() {
                assert!(pending < client.state());
            }
            if client.holds_recursion_quota() {
                assert_eq!(client.state(), State::Working);
            }
            let membership = self.pool.membership(client.id());
            assert!(
                membership == ListId::Active || membership == ListId::Recursing,
                "active client on {membership:?}"
            );
        }

        match res {
            Disposition::Continue => {}
            Disposition::Parked => {
                let client = self.client.take().expect("client is gone");
                assert!(client.pending(OpKind::Recv) == 0);
                assert!(client.pending(OpKind::Accept) == 0);
                self.pool.park(client);
                self.gone = Some(res);
            }
            Disposition::Freed => {
                let client = self.client.take().expect("client is gone");
                assert_eq!(client.state(), State::Freed);
                self.gone = Some(res);
            }
        }
        res
    }

    /// Handles everything queued in the mailbox.
    fn pump(&mut self) {
        while self.client.is_some() {
            match self.events.try_recv() {
                Ok(event) => {
                    self.handle(event);
                }
                Err(_) => break,
            }
        }
    }

    fn deliver_udp(&mut self, data: &[u8], peer: SocketAddr) {
        let (token, mut buf) = self.io.recv.take().expect("not receiving");
        buf.storage_mut()[..data.len()].copy_from_slice(data);
        buf.set_len(data.len());
        self.handle(Event::Request {
            token,
            buf,
            result: Ok(RecvMeta::new(peer, None)),
        });
        self.pump();
    }

    fn accept(&mut self, peer: SocketAddr) {
        let token = self.io.accept.take().expect("not accepting");
        self.io.peer = Some(peer);
        self.handle(Event::NewConnection {
            token,
            result: Ok(peer),
        });
        self.pump();
    }

    fn deliver_tcp(&mut self, data: &[u8]) {
        let (token, mut buf) = self.io.read.take().expect("not reading");
        let peer = self.io.peer.expect("not connected");
        buf.storage_mut()[..data.len()].copy_from_slice(data);
        buf.set_len(data.len());
        self.handle(Event::Request {
            token,
            buf,
            result: Ok(RecvMeta::new(peer, None)),
        });
        self.pump();
    }

    fn fail_read(&mut self, kind: io::ErrorKind) {
        let (token, buf) = self.io.read.take().expect("not reading");
        self.handle(Event::Request {
            token,
            buf,
            result: Err(kind.into()),
        });
        self.pump();
    }

    fn fail_accept(&mut self, kind: io::ErrorKind) {
        let token = self.io.accept.take().expect("not accepting");
        self.handle(Event::NewConnection {
            token,
            result: Err(kind.into()),
        });
        self.pump();
    }

    fn fail_recv(&mut self, kind: io::ErrorKind) {
        let (token, buf) = self.io.recv.take().expect("not receiving");
        self.handle(Event::Request {
            token,
            buf,
            result: Err(kind.into()),
        });
        self.pump();
    }

    fn complete_send(&mut self) {
        let (token, buf) = self.io.send.take().expect("not sending");
        self.handle(Event::SendDone {
            token,
            buf,
            result: Ok(()),
        });
        self.pump();
    }

    fn fire_timer(&mut self) {
        let (generation, _) = self.io.timer.take().expect("no timer armed");
        self.handle(Event::Timeout { generation });
        self.pump();
    }

    fn sent(&self, idx: usize) -> ParsedMessage {
        parse(&self.io.sent[idx].1)
    }
}

//------------ Harness -------------------------------------------------------

struct Harness {
    executor: Arc<ManualExecutor>,
    pool: Arc<ClientPool>,
    interface: Arc<Interface>,
    context: Arc<ServerContext>,
}

impl Harness {
    fn new(context: ServerContext, udp_target: usize, tcp_target: usize) -> Self {
        crate::logging::init_logging();
        let context = Arc::new(context);
        let executor = Arc::new(ManualExecutor::default());
        let pool = ClientPool::new(context.clone(), executor.clone());
        let interface = Arc::new(Interface::new(
            "192.0.2.53:53".parse().unwrap(),
            udp_target,
            tcp_target,
        ));
        Harness {
            executor,
            pool,
            interface,
            context,
        }
    }

    /// Attaches `n` clients and lets them start listening.
    fn start(&self, n: usize, transport: Transport) -> Vec<TestClient> {
        let created = self
            .pool
            .create_clients(n, &self.interface, transport)
            .unwrap();
        assert_eq!(created, n);
        self.spawned()
    }

    /// Takes and starts the clients spawned since the last call.
    fn spawned(&self) -> Vec<TestClient> {
        self.executor
            .take()
            .into_iter()
            .map(|spawned| {
                let mut client = TestClient::new(spawned, self.pool.clone());
                client.pump();
                client
            })
            .collect()
    }

    fn start_one(&self, transport: Transport) -> TestClient {
        self.start(1, transport).pop().unwrap()
    }
}

//------------ Helpers -------------------------------------------------------

fn peer() -> SocketAddr {
    "198.51.100.7:4321".parse().unwrap()
}

fn question(name: &str, class: Class) -> Question {
    Question::new(name.parse().unwrap(), Rtype::A, class)
}

fn wire(msg: &ParsedMessage) -> Vec<u8> {
    let mut buf = BytesMut::new();
    msg.render(65535, &mut buf).unwrap();
    buf.to_vec()
}

fn parse(data: &[u8]) -> ParsedMessage {
    let mut msg = ParsedMessage::new();
    msg.parse(data).unwrap();
    msg
}

fn query(id: u16, rd: bool) -> ParsedMessage {
    let mut msg = ParsedMessage::query(id, question("example.com", Class::IN));
    msg.header_mut().set_rd(rd);
    msg
}

fn answer_records(n: usize) -> Vec<Record> {
    let owner: Name = "example.com".parse().unwrap();
    (0..n)
        .map(|i| {
            Record::new(owner.clone(), Rtype::A, Class::IN, 300, vec![192, 0, 2, i as u8])
        })
        .collect()
}

fn plain_context() -> ServerContext {
    let views = ViewList::new().with_view(View::new("default", Class::IN));
    ServerContext::new(Config::default(), Arc::new(views))
}

fn recursive_context(resolver: Arc<StubResolver>, config: Config) -> ServerContext {
    let views = ViewList::new()
        .with_view(View::new("default", Class::IN).with_resolver(resolver));
    ServerContext::new(config, Arc::new(views))
}

//------------ UDP -----------------------------------------------------------

#[test]
fn udp_client_listens_after_start() {
    let harness = Harness::new(plain_context(), 1, 0);
    let client = harness.start_one(Transport::Udp);
    assert_eq!(client.state(), State::Ready);
    assert_eq!(client.io.ops, [Op::Recv]);
    assert_eq!(client.client().pending(OpKind::Recv), 1);
    assert_eq!(client.client().pending(OpKind::Control), 0);
    assert_eq!(harness.interface.gauge(Transport::Udp).current(), 1);
}

#[test]
fn udp_query_without_recursion_is_refused() {
    let harness = Harness::new(plain_context(), 1, 0);
    let mut client = harness.start_one(Transport::Udp);
    client.deliver_udp(&wire(&query(7, true)), peer());

    assert_eq!(client.io.sent.len(), 1);
    assert_eq!(client.io.sent[0].0, peer());
    let response = client.sent(0);
    assert!(response.header().qr());
    assert_eq!(response.header().id(), 7);
    assert_eq!(response.header().rcode(), Rcode::REFUSED);
    assert_eq!(response.question().len(), 1);

    assert_eq!(client.state(), State::Ready);
    assert_eq!(client.io.count(Op::Recv), 2);
    assert!(client.client().message().question().is_empty());
    assert_eq!(harness.context.metrics().num_requests(), 1);
    assert_eq!(harness.context.metrics().num_responses(), 1);
}

#[test]
fn recursion_answer_reaches_peer() {
    let resolver = Arc::new(StubResolver::immediate(RecursionOutcome::Answered {
        rcode: Rcode::NXDOMAIN,
        answer: Vec::new(),
        authority: Vec::new(),
    }));
    let harness =
        Harness::new(recursive_context(resolver.clone(), Config::default()), 1, 0);
    let mut client = harness.start_one(Transport::Udp);
    client.deliver_udp(&wire(&query(42, true)), peer());

    assert_eq!(client.io.sent.len(), 1);
    let response = client.sent(0);
    assert!(response.header().qr());
    assert!(response.header().ra());
    assert_eq!(response.header().rcode(), Rcode::NXDOMAIN);
    assert_eq!(response.header().id(), 42);

    // Back to receiving, with exactly one new receive.
    assert_eq!(client.state(), State::Ready);
    assert_eq!(client.io.count(Op::Recv), 2);
    assert!(!client.client().holds_recursion_quota());
    assert_eq!(client.client().references(), 0);
    assert_eq!(harness.context.recursion_quota().in_use(), 0);
    assert_eq!(harness.context.metrics().num_recursions(), 1);
    assert_eq!(harness.pool.membership(client.client().id()), ListId::Active);
}

#[test]
fn recursion_keeps_client_on_recursing_list() {
    let resolver = Arc::new(StubResolver::default());
    let harness =
        Harness::new(recursive_context(resolver.clone(), Config::default()), 1, 0);
    let mut client = harness.start_one(Transport::Udp);
    client.deliver_udp(&wire(&query(1, true)), peer());

    assert_eq!(client.state(), State::Working);
    assert_eq!(client.client().references(), 1);
    assert!(client.client().holds_recursion_quota());
    assert!(client.client().is_mortal());
    assert_eq!(harness.pool.membership(client.client().id()), ListId::Recursing);
    assert_eq!(harness.pool.list_len(ListId::Recursing), 1);
    assert_eq!(resolver.num_pending(), 1);

    // The replacement was spawned and listens.
    let replacements = harness.spawned();
    assert_eq!(replacements.len(), 1);
    assert_eq!(replacements[0].state(), State::Ready);

    resolver.complete_next(RecursionOutcome::Answered {
        rcode: Rcode::NOERROR,
        answer: answer_records(2),
        authority: Vec::new(),
    });
    client.pump();
    assert_eq!(client.sent(0).answer().len(), 2);
    assert_eq!(harness.pool.list_len(ListId::Recursing), 0);
    assert!(!client.client().holds_recursion_quota());
}

#[test]
fn mortal_udp_client_rearms_while_interface_is_short() {
    let resolver = Arc::new(StubResolver::immediate(RecursionOutcome::Failed));
    let harness =
        Harness::new(recursive_context(resolver, Config::default()), 1, 0);
    let mut client = harness.start_one(Transport::Udp);
    client.deliver_udp(&wire(&query(3, true)), peer());

    // The replacement has not started listening yet, so this client is
    // still needed.
    assert_eq!(client.sent(0).header().rcode(), Rcode::SERVFAIL);
    assert_eq!(client.state(), State::Ready);
    assert!(!client.client().is_mortal());
    assert_eq!(client.io.count(Op::Recv), 2);
    assert_eq!(harness.interface.gauge(Transport::Udp).current(), 1);
}

#[test]
fn mortal_udp_client_retires_only_at_full_capacity() {
    let resolver = Arc::new(StubResolver::default());
    let harness =
        Harness::new(recursive_context(resolver.clone(), Config::default()), 1, 0);
    let mut client = harness.start_one(Transport::Udp);
    client.deliver_udp(&wire(&query(3, true)), peer());
    let replacement = harness.spawned();
    assert_eq!(replacement[0].state(), State::Ready);

    resolver.complete_next(RecursionOutcome::Failed);
    client.pump();

    assert_eq!(client.io.sent.len(), 1);
    assert_eq!(client.state(), State::Inactive);
    assert_eq!(harness.pool.list_len(ListId::Inactive), 1);
    let gauge = harness.interface.gauge(Transport::Udp);
    assert!(gauge.current() >= gauge.target());

    // Parked clients are reused before new ones are created.
    let clients = harness.pool.num_clients();
    harness
        .pool
        .create_clients(1, &harness.interface, Transport::Udp)
        .unwrap();
    assert_eq!(harness.pool.num_clients(), clients);
    assert_eq!(harness.pool.list_len(ListId::Inactive), 0);
}

#[test]
fn exhausted_recursion_quota_kills_oldest() {
    let resolver = Arc::new(StubResolver::default());
    let mut config = Config::default();
    config.set_recursive_clients(1);
    let harness = Harness::new(recursive_context(resolver.clone(), config), 2, 0);
    let mut clients = harness.start(2, Transport::Udp);
    let mut second = clients.pop().unwrap();
    let mut first = clients.pop().unwrap();

    first.deliver_udp(&wire(&query(1, true)), peer());
    assert_eq!(first.state(), State::Working);
    assert_eq!(harness.pool.list_len(ListId::Recursing), 1);

    second.deliver_udp(&wire(&query(2, true)), peer());
    assert_eq!(second.sent(0).header().rcode(), Rcode::SERVFAIL);
    assert_eq!(second.state(), State::Ready);
    assert_eq!(harness.pool.membership(first.client().id()), ListId::Active);

    first.pump();
    assert_eq!(resolver.canceled.lock().len(), 1);
    assert!(first.io.sent.is_empty());
    assert_eq!(first.state(), State::Ready);
    assert_eq!(harness.context.recursion_quota().in_use(), 0);
}

#[test]
fn soft_recursion_limit_kills_oldest_and_proceeds() {
    let resolver = Arc::new(StubResolver::default());
    let harness = Harness::new(
        recursive_context(resolver.clone(), Config::default()),
        3,
        0,
    );
    harness.context.recursion_quota().set_limits(3, 2);
    let mut clients = harness.start(3, Transport::Udp);
    let mut third = clients.pop().unwrap();
    let mut second = clients.pop().unwrap();
    let mut first = clients.pop().unwrap();

    first.deliver_udp(&wire(&query(1, true)), peer());
    second.deliver_udp(&wire(&query(2, true)), peer());
    assert_eq!(harness.pool.list_len(ListId::Recursing), 2);
    assert_eq!(harness.context.recursion_quota().in_use(), 2);

    third.deliver_udp(&wire(&query(3, true)), peer());
    assert_eq!(third.state(), State::Working);
    assert!(third.io.sent.is_empty());
    assert!(third.client().holds_recursion_quota());
    assert_eq!(harness.pool.membership(first.client().id()), ListId::Active);
    assert_eq!(harness.pool.membership(second.client().id()), ListId::Recursing);

    first.pump();
    assert_eq!(resolver.canceled.lock().len(), 1);
    assert!(first.io.sent.is_empty());
    assert_eq!(first.state(), State::Ready);
    assert_eq!(harness.pool.membership(first.client().id()), ListId::Active);
    assert_eq!(second.state(), State::Working);
    assert_eq!(harness.context.recursion_quota().in_use(), 2);
    assert_eq!(harness.pool.list_len(ListId::Recursing), 2);
}

#[test]
fn failed_receive_waits_for_retry_timer() {
    let harness = Harness::new(plain_context(), 1, 0);
    let mut client = harness.start_one(Transport::Udp);
    client.fail_recv(io::ErrorKind::ConnectionRefused);

    assert_eq!(client.state(), State::Ready);
    assert_eq!(client.io.count(Op::Recv), 1);
    assert_eq!(client.client().pending(OpKind::Recv), 0);
    let (_, after) = client.io.timer.expect("no retry timer");
    assert_eq!(after, Config::default().listen_retry_delay());

    client.fire_timer();
    assert_eq!(client.io.count(Op::Recv), 2);
    assert_eq!(client.client().pending(OpKind::Recv), 1);
    client.deliver_udp(&wire(&query(1, false)), peer());
    assert_eq!(client.io.sent.len(), 1);
}

#[test]
fn udp_response_is_limited_by_peer_settings() {
    let resolver = Arc::new(StubResolver::immediate(RecursionOutcome::Answered {
        rcode: Rcode::NOERROR,
        answer: answer_records(30),
        authority: Vec::new(),
    }));
    let view = View::new("default", Class::IN)
        .with_resolver(resolver)
        .with_peer(PeerConfig {
            addr: "198.51.100.0/24".parse().unwrap(),
            max_udp_size: 600,
        });
    let context = ServerContext::new(
        Config::default(),
        Arc::new(ViewList::new().with_view(view)),
    );
    let harness = Harness::new(context, 1, 0);
    let mut client = harness.start_one(Transport::Udp);

    let mut msg = query(1, true);
    msg.set_outgoing_opt(Some(Opt::new(4096)));
    client.deliver_udp(&wire(&msg), peer());
    assert!(client.io.sent[0].1.len() <= 600);
    assert!(client.sent(0).header().tc());

    // Other peers get the server-wide limit.
    client.deliver_udp(&wire(&msg), "203.0.113.9:4321".parse().unwrap());
    assert!(client.io.sent[1].1.len() > 600);
    assert!(!client.sent(1).header().tc());
}

#[test]
fn truncated_header_is_dropped() {
    let harness = Harness::new(plain_context(), 1, 0);
    let mut client = harness.start_one(Transport::Udp);
    client.deliver_udp(&[0x12, 0x34, 0x01], peer());
    assert!(client.io.sent.is_empty());
    assert_eq!(client.state(), State::Ready);
    assert_eq!(client.io.count(Op::Recv), 2);
    assert_eq!(harness.context.metrics().num_dropped(), 1);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn formerr_loops_are_suppressed() {
    let harness = Harness::new(plain_context(), 1, 0);
    let mut client = harness.start_one(Transport::Udp);
    let malformed = [0x12, 0x34, 0x01, 0x00, 0x00, 0x01];

    for _ in 0..3 {
        client.deliver_udp(&malformed, peer());
        assert_eq!(client.state(), State::Ready);
        tokio::time::advance(Duration::from_millis(300)).await;
    }
    assert_eq!(client.io.sent.len(), 1);
    let response = client.sent(0);
    assert_eq!(response.header().id(), 0x1234);
    assert_eq!(response.header().rcode(), Rcode::FORMERR);
    assert!(response.question().is_empty());
    assert_eq!(harness.context.metrics().num_formerr_loops(), 2);

    tokio::time::advance(Duration::from_secs(2)).await;
    client.deliver_udp(&malformed, peer());
    assert_eq!(client.io.sent.len(), 2);
}

#[test]
fn formerr_to_other_ids_is_sent() {
    let harness = Harness::new(plain_context(), 1, 0);
    let mut client = harness.start_one(Transport::Udp);
    client.deliver_udp(&[0x00, 0x01, 0x01, 0x00, 0x00, 0x01], peer());
    client.deliver_udp(&[0x00, 0x02, 0x01, 0x00, 0x00, 0x01], peer());
    assert_eq!(client.io.sent.len(), 2);
}

#[test]
fn unknown_opcode_gets_notimp() {
    let harness = Harness::new(plain_context(), 1, 0);
    let mut client = harness.start_one(Transport::Udp);
    let mut msg = query(5, false);
    msg.header_mut().set_opcode(Opcode::STATUS);
    client.deliver_udp(&wire(&msg), peer());
    assert_eq!(client.sent(0).header().rcode(), Rcode::NOTIMP);

    // A malformed message with an unknown opcode also gets NOTIMP.
    client.deliver_udp(&[0x00, 0x09, 0x10, 0x00, 0x00], peer());
    assert_eq!(client.sent(1).header().rcode(), Rcode::NOTIMP);
}

#[test]
fn unsupported_edns_version_gets_badvers() {
    let harness = Harness::new(plain_context(), 1, 0);
    let mut client = harness.start_one(Transport::Udp);
    let mut msg = query(9, false);
    msg.set_outgoing_opt(Some(Opt {
        version: 1,
        ..Opt::new(4096)
    }));
    client.deliver_udp(&wire(&msg), peer());

    let response = client.sent(0);
    let opt = response.opt().expect("response without OPT");
    assert_eq!(
        OptRcode::from_parts(response.header().rcode(), opt.ext_rcode),
        OptRcode::BADVERS
    );
    assert_eq!(opt.udp_payload_size, Config::default().max_udp_size());
}

#[test]
fn request_without_matching_view_is_refused() {
    let harness = Harness::new(plain_context(), 1, 0);
    let mut client = harness.start_one(Transport::Udp);
    let msg = ParsedMessage::query(11, question("example.com", Class::CH));
    client.deliver_udp(&wire(&msg), peer());
    assert_eq!(client.sent(0).header().rcode(), Rcode::REFUSED);
}

#[test]
fn message_without_question_is_formerr() {
    let harness = Harness::new(plain_context(), 1, 0);
    let mut client = harness.start_one(Transport::Udp);
    let mut msg = query(12, false);
    msg.reply(false).unwrap();
    msg.header_mut().set_qr(false);
    client.deliver_udp(&wire(&msg), peer());
    assert_eq!(client.sent(0).header().rcode(), Rcode::FORMERR);
}

#[test]
fn bad_signature_is_notauth_except_for_updates() {
    let harness = Harness::new(plain_context(), 1, 0);
    let mut client = harness.start_one(Transport::Udp);
    let tsig = Record::new(
        "key.example".parse().unwrap(),
        Rtype::TSIG,
        Class::ANY,
        0,
        Vec::new(),
    );

    let mut msg = query(13, false);
    msg.push_additional(tsig.clone());
    client.deliver_udp(&wire(&msg), peer());
    assert_eq!(client.sent(0).header().rcode(), Rcode::NOTAUTH);

    // An update signed by an unknown key is passed on to its handler.
    let mut msg = query(14, false);
    msg.header_mut().set_opcode(Opcode::UPDATE);
    msg.push_additional(tsig);
    client.deliver_udp(&wire(&msg), peer());
    assert_eq!(client.sent(1).header().rcode(), Rcode::NOTIMP);
}

#[test]
fn udp_response_without_edns_is_truncated() {
    let resolver = Arc::new(StubResolver::immediate(RecursionOutcome::Answered {
        rcode: Rcode::NOERROR,
        answer: answer_records(40),
        authority: Vec::new(),
    }));
    let harness =
        Harness::new(recursive_context(resolver, Config::default()), 1, 0);
    let mut client = harness.start_one(Transport::Udp);

    client.deliver_udp(&wire(&query(1, true)), peer());
    assert!(client.io.sent[0].1.len() <= 512);
    assert!(client.sent(0).header().tc());
    assert_eq!(harness.context.metrics().num_truncated(), 1);

    let mut msg = query(2, true);
    msg.set_outgoing_opt(Some(Opt::new(4096)));
    client.deliver_udp(&wire(&msg), peer());
    let response = client.sent(1);
    assert!(!response.header().tc());
    assert_eq!(response.answer().len(), 40);
    assert!(client.io.sent[1].1.len() <= usize::from(Config::default().max_udp_size()));
}

#[test]
fn responses_are_forwarded_to_sink() {
    let sink = Arc::new(RecordingSink::default());
    let harness = Harness::new(plain_context().with_response_sink(sink.clone()), 1, 0);
    let mut client = harness.start_one(Transport::Udp);
    let mut msg = query(20, false);
    msg.header_mut().set_qr(true);
    let data = wire(&msg);

    client.deliver_udp(&data, peer());
    assert!(client.io.sent.is_empty());
    assert_eq!(sink.imported.lock().as_slice(), [(data.clone(), peer())]);

    // Responses from the kpasswd port are dropped instead.
    client.deliver_udp(&data, "198.51.100.7:464".parse().unwrap());
    assert_eq!(sink.imported.lock().len(), 1);
    assert_eq!(client.state(), State::Ready);
}

#[test]
fn udp_requests_from_suspicious_sources_are_dropped() {
    let blackhole = Acl::List(vec!["203.0.113.0/24".parse().unwrap()]);
    let harness = Harness::new(plain_context().with_blackhole(blackhole), 1, 0);
    let mut client = harness.start_one(Transport::Udp);
    let data = wire(&query(30, false));

    client.deliver_udp(&data, "198.51.100.7:7".parse().unwrap());
    client.deliver_udp(&data, "198.51.100.7:19".parse().unwrap());
    client.deliver_udp(&data, "224.0.0.251:5353".parse().unwrap());
    client.deliver_udp(&data, "203.0.113.9:4321".parse().unwrap());
    assert!(client.io.sent.is_empty());
    assert_eq!(harness.context.metrics().num_dropped(), 4);
    assert_eq!(client.state(), State::Ready);

    client.deliver_udp(&data, peer());
    assert_eq!(client.io.sent.len(), 1);
}

#[test]
fn exchange_dropped_by_handler_drops_request() {
    let handlers = Handlers {
        query: Arc::new(Forgetful),
        ..Default::default()
    };
    let harness = Harness::new(plain_context().with_handlers(handlers), 1, 0);
    let mut client = harness.start_one(Transport::Udp);
    client.deliver_udp(&wire(&query(1, false)), peer());
    assert!(client.io.sent.is_empty());
    assert_eq!(client.state(), State::Ready);
    assert_eq!(harness.context.metrics().num_dropped(), 1);
}

#[test]
fn deferred_update_is_answered_when_finished() {
    let updates = Arc::new(DeferringUpdates::default());
    let handlers = Handlers {
        update: updates.clone(),
        ..Default::default()
    };
    let harness = Harness::new(plain_context().with_handlers(handlers), 1, 0);
    let mut client = harness.start_one(Transport::Udp);
    let mut msg = query(50, false);
    msg.header_mut().set_opcode(Opcode::UPDATE);
    client.deliver_udp(&wire(&msg), peer());

    assert_eq!(client.state(), State::Working);
    assert_eq!(client.client().pending(OpKind::Update), 1);
    assert!(client.io.timer.is_some());

    let ticket = updates.tickets.lock().pop().unwrap();
    ticket.finish(OptRcode::NOERROR);
    client.pump();

    let response = client.sent(0);
    assert_eq!(response.header().opcode(), Opcode::UPDATE);
    assert_eq!(response.header().rcode(), Rcode::NOERROR);
    assert_eq!(client.state(), State::Ready);
}

#[test]
fn timed_out_update_waits_for_its_ticket() {
    let updates = Arc::new(DeferringUpdates::default());
    let handlers = Handlers {
        update: updates.clone(),
        ..Default::default()
    };
    let harness = Harness::new(plain_context().with_handlers(handlers), 1, 0);
    let mut client = harness.start_one(Transport::Udp);
    let mut msg = query(51, false);
    msg.header_mut().set_opcode(Opcode::UPDATE);
    client.deliver_udp(&wire(&msg), peer());

    client.fire_timer();
    assert_eq!(client.state(), State::Working);
    assert_eq!(client.client().pending_state(), Some(State::Ready));

    drop(updates.tickets.lock().pop());
    client.pump();
    assert!(client.io.sent.is_empty());
    assert_eq!(client.state(), State::Ready);
    assert_eq!(client.client().pending(OpKind::Update), 0);
}

//------------ TCP -----------------------------------------------------------

#[test]
fn tcp_connection_stays_open_between_requests() {
    let harness = Harness::new(plain_context(), 0, 1);
    let mut client = harness.start_one(Transport::Tcp);
    assert_eq!(client.io.ops, [Op::Accept]);

    client.accept(peer());
    assert_eq!(client.state(), State::Reading);
    assert!(client.client().is_mortal());
    assert_eq!(harness.executor.spawned.lock().len(), 1);
    assert_eq!(harness.context.tcp_quota().in_use(), 1);

    client.deliver_tcp(&wire(&query(1, false)));
    client.deliver_tcp(&wire(&query(2, false)));
    assert_eq!(client.io.sent.len(), 2);
    assert_eq!(client.sent(1).header().id(), 2);
    assert_eq!(client.state(), State::Reading);
    assert_eq!(client.io.count(Op::Read), 3);
    assert_eq!(client.io.count(Op::Close), 0);

    // The peer goes away.
    client.fail_read(io::ErrorKind::UnexpectedEof);
    assert_eq!(client.io.count(Op::Close), 1);
    assert_eq!(client.state(), State::Ready);
    assert_eq!(client.io.count(Op::Accept), 2);
    assert_eq!(harness.context.tcp_quota().in_use(), 0);
}

#[test]
fn failed_accept_waits_for_retry_timer() {
    let harness = Harness::new(plain_context(), 0, 1);
    let mut client = harness.start_one(Transport::Tcp);
    client.fail_accept(io::ErrorKind::ConnectionAborted);

    assert_eq!(client.state(), State::Ready);
    assert_eq!(client.io.count(Op::Accept), 1);
    assert_eq!(client.client().pending(OpKind::Accept), 0);
    assert_eq!(harness.interface.gauge(Transport::Tcp).current(), 0);
    assert!(harness.executor.spawned.lock().is_empty());
    let (_, after) = client.io.timer.expect("no retry timer");
    assert_eq!(after, Config::default().listen_retry_delay());

    client.fire_timer();
    assert_eq!(client.io.count(Op::Accept), 2);
    assert_eq!(harness.interface.gauge(Transport::Tcp).current(), 1);
    client.accept(peer());
    assert_eq!(client.state(), State::Reading);
}

#[test]
fn idle_tcp_connection_times_out() {
    let harness = Harness::new(plain_context(), 0, 1);
    let mut client = harness.start_one(Transport::Tcp);
    client.accept(peer());
    assert!(client.io.timer.is_some());

    client.fire_timer();
    assert_eq!(client.io.count(Op::CancelRead), 1);
    assert_eq!(client.io.count(Op::Close), 1);
    assert_eq!(client.state(), State::Ready);
    assert_eq!(client.io.ops.last(), Some(&Op::Accept));
}

#[test]
fn stale_timeouts_are_ignored() {
    let harness = Harness::new(plain_context(), 0, 1);
    let mut client = harness.start_one(Transport::Tcp);
    client.accept(peer());
    let (generation, _) = client.io.timer.unwrap();
    client.deliver_tcp(&wire(&query(1, false)));

    // The read after the response armed a new timer.
    assert_ne!(client.io.timer.unwrap().0, generation);
    client.handle(Event::Timeout { generation });
    assert_eq!(client.state(), State::Reading);
    assert_eq!(client.io.count(Op::Close), 0);
}

#[test]
fn response_over_tcp_severs_connection() {
    let harness = Harness::new(plain_context(), 0, 1);
    let mut client = harness.start_one(Transport::Tcp);
    client.accept(peer());
    let mut msg = query(1, false);
    msg.header_mut().set_qr(true);
    client.deliver_tcp(&wire(&msg));
    assert!(client.io.sent.is_empty());
    assert_eq!(client.io.count(Op::Close), 1);
    assert_eq!(client.state(), State::Ready);
}

#[test]
fn blackholed_connection_is_closed() {
    let blackhole = Acl::List(vec!["198.51.100.0/24".parse().unwrap()]);
    let harness = Harness::new(plain_context().with_blackhole(blackhole), 0, 1);
    let mut client = harness.start_one(Transport::Tcp);
    client.accept(peer());
    assert_eq!(client.io.count(Op::Read), 0);
    assert_eq!(client.io.count(Op::Close), 1);
    assert_eq!(client.state(), State::Ready);
    assert!(harness.executor.spawned.lock().is_empty());
}

#[test]
fn tcp_quota_gates_replacement() {
    let mut config = Config::default();
    config.set_tcp_clients(1);
    let views = ViewList::new().with_view(View::new("default", Class::IN));
    let harness = Harness::new(ServerContext::new(config, Arc::new(views)), 0, 2);
    let mut clients = harness.start(2, Transport::Tcp);

    clients[0].accept(peer());
    assert_eq!(harness.executor.spawned.lock().len(), 1);
    clients[1].accept("198.51.100.8:1234".parse().unwrap());
    assert_eq!(harness.executor.spawned.lock().len(), 1);

    // The connection over quota is still served.
    assert_eq!(clients[1].state(), State::Reading);
    assert!(!clients[1].client().is_mortal());
}

//------------ Shutdown ------------------------------------------------------

#[test]
fn shutdown_waits_for_outstanding_send() {
    let harness = Harness::new(plain_context(), 0, 1);
    let mut client = harness.start_one(Transport::Tcp);
    client.io.sync_send = false;
    client.accept(peer());
    client.deliver_tcp(&wire(&query(1, false)));
    assert_eq!(client.client().pending(OpKind::Send), 1);

    harness.pool.destroy();
    let event = client.events.try_recv().unwrap();
    assert!(matches!(event, Event::Shutdown));
    client.handle(event);
    assert_eq!(client.state(), State::Working);
    assert_eq!(client.client().pending_state(), Some(State::Freed));
    assert_eq!(client.io.count(Op::CancelSend), 1);

    client.pump();
    assert_eq!(client.state(), State::Freed);
    assert!(!harness.pool.is_destroyed());

    // The replacement spawned at accept is shut down, too.
    let mut replacements = harness.spawned();
    replacements[0].pump();
    assert_eq!(replacements[0].state(), State::Freed);
    assert!(harness.pool.is_destroyed());
    assert_eq!(harness.pool.buffers().outstanding(), 0);
    assert_eq!(harness.context.metrics().num_clients(), 0);
}

#[test]
fn shutdown_cancels_outstanding_receive() {
    let harness = Harness::new(plain_context(), 2, 0);
    let mut clients = harness.start(2, Transport::Udp);
    harness.pool.destroy();
    for client in &mut clients {
        let event = client.events.try_recv().unwrap();
        client.handle(event);
        assert_eq!(client.state(), State::Ready);
        assert_eq!(client.client().pending(OpKind::Recv), 1);
        client.pump();
        assert_eq!(client.state(), State::Freed);
    }
    assert!(harness.pool.is_destroyed());
    assert_eq!(harness.pool.buffers().outstanding(), 0);
    assert_eq!(harness.interface.gauge(Transport::Udp).current(), 0);
}

#[test]
fn shutdown_during_recursion_cancels_it() {
    let resolver = Arc::new(StubResolver::default());
    let harness =
        Harness::new(recursive_context(resolver.clone(), Config::default()), 1, 0);
    let mut client = harness.start_one(Transport::Udp);
    client.deliver_udp(&wire(&query(1, true)), peer());
    let mut replacement = harness.spawned().pop().unwrap();

    harness.pool.destroy();
    client.pump();
    replacement.pump();
    assert_eq!(resolver.canceled.lock().len(), 1);
    assert!(client.io.sent.is_empty());
    assert_eq!(client.state(), State::Freed);
    assert_eq!(replacement.state(), State::Freed);
    assert!(harness.pool.is_destroyed());
    assert_eq!(harness.context.recursion_quota().in_use(), 0);
    assert_eq!(harness.pool.buffers().outstanding(), 0);
}

#[test]
fn destroy_frees_inactive_clients() {
    let resolver = Arc::new(StubResolver::default());
    let harness =
        Harness::new(recursive_context(resolver.clone(), Config::default()), 1, 0);
    let mut client = harness.start_one(Transport::Udp);
    client.deliver_udp(&wire(&query(3, true)), peer());
    let mut replacement = harness.spawned().pop().unwrap();
    resolver.complete_next(RecursionOutcome::Failed);
    client.pump();
    assert_eq!(client.state(), State::Inactive);

    harness.pool.destroy();
    assert_eq!(harness.pool.list_len(ListId::Inactive), 0);
    assert_eq!(harness.pool.num_clients(), 1);
    replacement.pump();
    assert!(harness.pool.is_destroyed());
    assert_eq!(harness.pool.buffers().outstanding(), 0);
}

//------------ Pool ----------------------------------------------------------

#[test]
fn create_clients_honours_limits() {
    let mut config = Config::default();
    config.set_max_clients(2);
    let views = ViewList::new().with_view(View::new("default", Class::IN));
    let harness = Harness::new(ServerContext::new(config, Arc::new(views)), 3, 0);

    assert!(matches!(
        harness.pool.create_clients(1, &harness.interface, Transport::Tcp),
        Err(Error::NoTransport)
    ));
    assert_eq!(
        harness
            .pool
            .create_clients(3, &harness.interface, Transport::Udp)
            .unwrap(),
        2
    );
    assert!(matches!(
        harness.pool.create_clients(1, &harness.interface, Transport::Udp),
        Err(Error::ClientLimit)
    ));
    assert_eq!(harness.pool.list_len(ListId::Active), 2);

    harness.pool.destroy();
    assert!(matches!(
        harness.pool.create_clients(1, &harness.interface, Transport::Udp),
        Err(Error::ShuttingDown)
    ));
}

#[test]
fn serve_interface_meets_targets() {
    let harness = Harness::new(plain_context(), 3, 2);
    assert_eq!(harness.pool.serve_interface(&harness.interface).unwrap(), 5);
    let clients = harness.spawned();
    assert_eq!(clients.len(), 5);
    assert_eq!(harness.interface.gauge(Transport::Udp).current(), 3);
    assert_eq!(harness.interface.gauge(Transport::Tcp).current(), 2);
}
