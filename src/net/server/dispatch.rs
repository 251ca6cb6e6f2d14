//! Dispatching events to a client.
//!
//! Every completion handler starts the same way: it accounts for the
//! operation that completed and then calls [`ClientState::advance`]. If a
//! transition was pending, the event has served its purpose and handling
//! stops there. Only otherwise does the handler go on with what the event
//! is actually about.
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tracing::{debug, trace, warn};

use super::buf::RequestBuffer;
use super::client::{ClientState, Disposition, State, TimerPurpose};
use super::config::MIN_UDP_SIZE;
use super::error::{RequestError, ShutdownReason};
use super::event::{Event, InFlight, RecvMeta};
use super::handler::{Exchange, RequestHandler};
use super::interface::Transport;
use super::pool::ListId;
use super::recursion::RecursionOutcome;
use super::signature::SigStatus;
use super::sock::{is_canceled, ClientIo};
use super::util::to_pcap_text;
use crate::base::header::Header;
use crate::base::iana::{Opcode, OptRcode};
use crate::base::message::{Opt, ParseError};

/// Source ports of services whose traffic is never answered.
const DROP_REQUEST_PORTS: [u16; 4] = [7, 13, 19, 37];

/// The source port of responses that are never imported.
const DROP_RESPONSE_PORT: u16 = 464;

impl ClientState {
    /// Handles one event.
    ///
    /// Returns what the owner of the client has to do with it next.
    pub fn handle_event(
        &mut self,
        event: Event,
        io: &mut dyn ClientIo,
    ) -> Disposition {
        trace!(
            client = %self.id,
            event = event.name(),
            state = ?self.state,
            "handling event"
        );
        match event {
            Event::Start { token } => self.on_start(io, token),
            Event::Shutdown => self.on_shutdown(io),
            Event::NewConnection { token, result } => {
                self.on_new_connection(io, token, result)
            }
            Event::Request { token, buf, result } => {
                self.on_request(io, token, buf, result)
            }
            Event::SendDone { token, buf, result } => {
                self.on_send_done(io, token, buf, result)
            }
            Event::Timeout { generation } => self.on_timeout(io, generation),
            Event::RecursionDone { outcome } => {
                self.on_recursion_done(io, outcome)
            }
            Event::KillRecursion => self.on_kill(),
            Event::UpdateDone { token, rcode } => {
                self.on_update_done(io, token, rcode)
            }
        }
        self.take_disposition()
    }

    fn on_start(&mut self, io: &mut dyn ClientIo, token: InFlight) {
        self.pending.complete(token);
        if self.advance(io).should_stop() {
            return;
        }
        self.listen(io);
    }

    fn on_shutdown(&mut self, io: &mut dyn ClientIo) {
        debug!(client = %self.id, state = ?self.state, "shutting down");
        if let Some(hook) = self.shutdown_hook.take() {
            hook(ShutdownReason::ShuttingDown);
        }
        self.request_state(State::Freed);
        self.advance(io);
    }

    fn on_new_connection(
        &mut self,
        io: &mut dyn ClientIo,
        token: InFlight,
        result: io::Result<SocketAddr>,
    ) {
        self.pending.complete(token);
        if let Some(interface) = self.interface.as_ref() {
            interface.gauge(Transport::Tcp).dec();
        }
        let peer = match result {
            Ok(peer) => {
                self.state = State::Reading;
                self.connected = true;
                self.peer = Some(peer);
                Some(peer)
            }
            Err(err) => {
                if !is_canceled(&err) {
                    warn!(client = %self.id, %err, "accept failed");
                }
                None
            }
        };
        if self.advance(io).should_stop() {
            return;
        }

        let Some(peer) = peer else {
            let delay = self.config.listen_retry_delay();
            self.set_timer(io, TimerPurpose::ListenRetry, delay);
            return;
        };
        if self.context.is_blackholed(peer.ip()) {
            debug!(client = %self.id, %peer, "blackholed connection");
            self.request_state(State::Ready);
            self.advance(io);
            return;
        }

        trace!(client = %self.id, %peer, "new TCP connection");
        match self.context.tcp_quota().try_acquire() {
            Some(quota) => {
                self.tcp_quota = Some(quota);
                if let Err(err) = self.replace() {
                    debug!(client = %self.id, %err, "no more TCP clients");
                }
            }
            None => {
                debug!(client = %self.id, "no more TCP clients: quota reached");
            }
        }
        self.start_read(io);
    }

    fn on_timeout(&mut self, io: &mut dyn ClientIo, generation: u64) {
        let timer = match self.timer {
            Some(timer) if timer.generation == generation => timer,
            _ => {
                trace!(client = %self.id, generation, "stale timeout");
                return;
            }
        };
        self.timer = None;
        match timer.purpose {
            TimerPurpose::ListenRetry => {
                if self.advance(io).should_stop() {
                    return;
                }
                self.listen(io);
            }
            TimerPurpose::Idle | TimerPurpose::Lifetime => {
                debug!(
                    client = %self.id,
                    purpose = ?timer.purpose,
                    state = ?self.state,
                    "timed out"
                );
                if let Some(hook) = self.shutdown_hook.take() {
                    hook(ShutdownReason::TimedOut);
                }
                self.request_state(State::Ready);
                self.advance(io);
            }
        }
    }

    fn on_request(
        &mut self,
        io: &mut dyn ClientIo,
        token: InFlight,
        buf: RequestBuffer,
        result: io::Result<RecvMeta>,
    ) {
        self.pending.complete(token);
        let tcp = self.is_tcp();
        if !tcp {
            if let Some(interface) = self.interface.as_ref() {
                interface.gauge(Transport::Udp).dec();
            }
        }
        self.recv_buf = Some(buf);
        if self.advance(io).should_stop() {
            return;
        }

        let meta = match result {
            Ok(meta) => meta,
            Err(err) if tcp => {
                if !is_canceled(&err) && err.kind() != io::ErrorKind::UnexpectedEof {
                    debug!(client = %self.id, %err, "TCP read failed");
                }
                self.state = State::Working;
                self.complete_request(io, Err(err.into()));
                return;
            }
            Err(err) => {
                if !is_canceled(&err) {
                    warn!(client = %self.id, %err, "UDP receive failed");
                }
                let delay = self.config.listen_retry_delay();
                self.set_timer(io, TimerPurpose::ListenRetry, delay);
                return;
            }
        };

        self.state = State::Working;
        self.config = self.context.config();
        self.request_time = Some(meta.received_at);
        self.peer = Some(meta.peer);
        if !tcp {
            self.dest = meta.dest;
        }
        if tcp {
            self.cancel_timer(io);
        }
        self.context.metrics().inc_requests();
        let peer = meta.peer;

        if tracing::enabled!(tracing::Level::TRACE) {
            if let Some(buf) = self.recv_buf.as_ref() {
                let pcap_text = to_pcap_text(buf.as_slice(), buf.len());
                trace!(client = %self.id, %peer, pcap_text, "Received message");
            }
        }

        if !tcp {
            if self.context.is_blackholed(peer.ip()) {
                self.drop_request(io, "blackholed");
                return;
            }
            if peer.ip().is_multicast()
                || self.dest.map_or(false, |dest| dest.ip().is_multicast())
            {
                self.drop_request(io, "multicast");
                return;
            }
            if DROP_REQUEST_PORTS.contains(&peer.port()) {
                self.drop_request(io, "source port in drop list");
                return;
            }
        }

        let Some(header) = self
            .recv_buf
            .as_ref()
            .and_then(|buf| Header::from_message_slice(buf.as_slice()))
        else {
            self.drop_request(io, "short header");
            return;
        };

        if header.qr() {
            if tcp {
                debug!(client = %self.id, %peer, "response received over TCP");
                self.complete_request(io, Err(RequestError::Malformed));
                return;
            }
            if peer.port() == DROP_RESPONSE_PORT {
                self.drop_request(io, "response from port in drop list");
                return;
            }
            if let (Some(sink), Some(buf)) =
                (self.context.response_sink(), self.recv_buf.as_ref())
            {
                trace!(client = %self.id, %peer, "forwarding response");
                sink.import(buf.as_slice(), peer);
            }
            self.complete_request(io, Ok(()));
            return;
        }

        let parsed = match self.recv_buf.as_ref() {
            Some(buf) => self.message.parse(buf.as_slice()),
            None => Err(ParseError::ShortHeader),
        };
        if let Err(err) = parsed {
            debug!(client = %self.id, %peer, %err, "message parsing failed");
            let opcode = header.opcode();
            let rcode = if opcode == Opcode::QUERY
                || opcode == Opcode::NOTIFY
                || opcode == Opcode::UPDATE
            {
                OptRcode::FORMERR
            } else {
                OptRcode::NOTIMP
            };
            self.send_error(io, rcode);
            return;
        }

        if let Some(opt) = self.message.opt().cloned() {
            self.udp_size = opt.udp_payload_size.max(MIN_UDP_SIZE);
            self.attributes.want_dnssec = opt.dnssec_ok;
            let mut reply_opt = Opt::new(self.config.max_udp_size());
            reply_opt.dnssec_ok = opt.dnssec_ok;
            self.reply_opt = Some(reply_opt);
            if opt.version > 0 {
                debug!(client = %self.id, version = opt.version, "unsupported EDNS version");
                self.send_error(io, OptRcode::BADVERS);
                return;
            }
        }

        let Some(class) = self.message.class() else {
            debug!(client = %self.id, "message class could not be determined");
            self.send_error(io, OptRcode::FORMERR);
            return;
        };

        let signer = self.message.signature().map(|sig| sig.owner.clone());
        let Some(view) = self.context.views().find_matching_view(
            peer.ip(),
            self.dest.map(|dest| dest.ip()),
            class,
            signer.as_ref(),
        ) else {
            debug!(client = %self.id, %peer, ?class, "no matching view");
            self.send_error(io, OptRcode::REFUSED);
            return;
        };

        match self.context.verifier().verify(&self.message, &view) {
            SigStatus::Valid { signer } => {
                debug!(client = %self.id, %signer, "request has valid signature");
                self.signer = Some(signer);
            }
            SigStatus::Absent => {
                trace!(client = %self.id, "request is not signed");
            }
            SigStatus::NoIdentity => {
                debug!(client = %self.id, "request is signed by a key without identity");
            }
            SigStatus::Invalid { bad_key } => {
                if bad_key && header.opcode() == Opcode::UPDATE {
                    debug!(
                        client = %self.id,
                        "update signed by unknown key, passing on"
                    );
                } else {
                    debug!(client = %self.id, bad_key, "request has invalid signature");
                    self.send_error(io, OptRcode::NOTAUTH);
                    return;
                }
            }
        }

        self.attributes.ra = view.recursion_allowed(peer.ip());
        if let Some(limit) = view.peer_udp_size(peer.ip()) {
            self.udp_size = self.udp_size.min(limit);
        }
        self.udp_size = self
            .udp_size
            .min(self.config.max_udp_size())
            .max(MIN_UDP_SIZE);
        trace!(
            client = %self.id,
            view = view.name(),
            ra = self.attributes.ra,
            udp_size = self.udp_size,
            "request accepted"
        );
        self.view = Some(view);

        let opcode = header.opcode();
        let Some(handler) = self.handler_for(opcode) else {
            debug!(client = %self.id, %opcode, "opcode not implemented");
            self.send_error(io, OptRcode::NOTIMP);
            return;
        };
        if opcode == Opcode::UPDATE || opcode == Opcode::NOTIFY {
            let lifetime = self.config.request_lifetime();
            self.set_timer(io, TimerPurpose::Lifetime, lifetime);
        }
        handler.handle(Exchange::new(self, io));
    }

    fn handler_for(&self, opcode: Opcode) -> Option<Arc<dyn RequestHandler>> {
        let handlers = self.context.handlers();
        if opcode == Opcode::QUERY {
            Some(handlers.query.clone())
        } else if opcode == Opcode::UPDATE {
            Some(handlers.update.clone())
        } else if opcode == Opcode::NOTIFY {
            Some(handlers.notify.clone())
        } else {
            None
        }
    }

    fn on_recursion_done(
        &mut self,
        io: &mut dyn ClientIo,
        outcome: RecursionOutcome,
    ) {
        debug_assert!(self.references > 0, "recursion done without reference");
        self.references = self.references.saturating_sub(1);
        self.recursion_quota = None;
        self.shutdown_hook = None;
        if self.recursing {
            self.pool.move_to(self.id, ListId::Active);
            self.recursing = false;
        }
        if self.advance(io).should_stop() {
            return;
        }
        match self.handler_for(self.message.opcode()) {
            Some(handler) => {
                handler.recursion_done(Exchange::new(self, io), outcome)
            }
            None => self.send_error(io, OptRcode::SERVFAIL),
        }
    }

    fn on_kill(&mut self) {
        match self.shutdown_hook.take() {
            Some(hook) => hook(ShutdownReason::Canceled),
            None => trace!(client = %self.id, "nothing to cancel"),
        }
    }

    fn on_update_done(
        &mut self,
        io: &mut dyn ClientIo,
        token: InFlight,
        rcode: OptRcode,
    ) {
        self.pending.complete(token);
        if self.advance(io).should_stop() {
            return;
        }
        self.send_error(io, rcode);
    }
}
