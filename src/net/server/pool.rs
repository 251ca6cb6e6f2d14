//! The pool of clients.
//!
//! The pool knows every client that exists and keeps it on exactly one of
//! three lists. Active clients serve an interface and live in their own
//! task, the pool only holds on to their mailbox. Recursing clients are
//! active clients with a recursion in progress, kept in the order their
//! recursions started so the oldest can be found. Inactive clients have
//! been handed back and are stored in the pool itself until they are
//! attached to an interface again.
//!
//! All of this sits behind a single lock. It is only taken for list
//! manipulation, never while a client handles an event.
use std::sync::Arc;

use parking_lot::Mutex;
use slab::Slab;
use tokio::sync::Notify;
use tracing::{debug, trace};

use super::buf::ContextPool;
use super::client::{ClientId, ClientState};
use super::context::ServerContext;
use super::error::Error;
use super::event::{mailbox, Event, Events, Mailbox, OpKind};
use super::interface::{Interface, Transport};

//------------ ClientExecutor ------------------------------------------------

/// Runs clients.
///
/// The executor is handed a freshly attached client together with the
/// receiving half of its mailbox. It has to feed every event to
/// [`ClientState::handle_event`] and act on the disposition returned.
pub trait ClientExecutor: Send + Sync {
    fn spawn(&self, client: ClientState, events: Events);
}

//------------ ListId --------------------------------------------------------

/// The pool lists a client can be on.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ListId {
    Active,
    Recursing,
    Inactive,

    /// On no list at all.
    None,
}

impl ListId {
    fn index(self) -> Option<usize> {
        match self {
            ListId::Active => Some(0),
            ListId::Recursing => Some(1),
            ListId::Inactive => Some(2),
            ListId::None => None,
        }
    }
}

//------------ Entry and Lists -----------------------------------------------

struct Entry {
    list: ListId,
    prev: Option<usize>,
    next: Option<usize>,

    /// The mailbox of an active client.
    mailbox: Option<Mailbox>,

    /// The client itself while it is inactive.
    parked: Option<ClientState>,
}

impl Entry {
    fn new() -> Self {
        Entry {
            list: ListId::None,
            prev: None,
            next: None,
            mailbox: None,
            parked: None,
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
struct Links {
    head: Option<usize>,
    tail: Option<usize>,
    len: usize,
}

struct Lists {
    slab: Slab<Entry>,
    links: [Links; 3],
    shutting_down: bool,
    destroyed: bool,
}

impl Lists {
    fn new() -> Self {
        Lists {
            slab: Slab::new(),
            links: Default::default(),
            shutting_down: false,
            destroyed: false,
        }
    }

    fn head(&self, list: ListId) -> Option<usize> {
        list.index().and_then(|idx| self.links[idx].head)
    }

    /// Appends an entry to the tail of a list.
    fn link(&mut self, key: usize, list: ListId) {
        let Some(idx) = list.index() else {
            self.slab[key].list = ListId::None;
            return;
        };
        let tail = self.links[idx].tail;
        let entry = &mut self.slab[key];
        entry.list = list;
        entry.prev = tail;
        entry.next = None;
        match tail {
            Some(tail) => self.slab[tail].next = Some(key),
            None => self.links[idx].head = Some(key),
        }
        self.links[idx].tail = Some(key);
        self.links[idx].len += 1;
    }

    fn unlink(&mut self, key: usize) {
        let Some(entry) = self.slab.get_mut(key) else {
            return;
        };
        let list = core::mem::replace(&mut entry.list, ListId::None);
        let prev = entry.prev.take();
        let next = entry.next.take();
        let Some(idx) = list.index() else {
            return;
        };
        match prev {
            Some(prev) => self.slab[prev].next = next,
            None => self.links[idx].head = next,
        }
        match next {
            Some(next) => self.slab[next].prev = prev,
            None => self.links[idx].tail = prev,
        }
        self.links[idx].len -= 1;
    }

    fn keys(&self, list: ListId) -> Vec<usize> {
        let mut res = Vec::new();
        let mut cursor = self.head(list);
        while let Some(key) = cursor {
            res.push(key);
            cursor = self.slab[key].next;
        }
        res
    }

    /// Removes an entry, marking the pool destroyed if it was the last.
    fn remove(&mut self, key: usize) -> Option<Entry> {
        self.unlink(key);
        let res = self.slab.try_remove(key);
        if self.shutting_down && self.slab.is_empty() {
            self.destroyed = true;
        }
        res
    }
}

//------------ ClientPool ----------------------------------------------------

/// The pool of all clients of a server.
pub struct ClientPool {
    context: Arc<ServerContext>,
    buffers: ContextPool,
    executor: Arc<dyn ClientExecutor>,
    lists: Mutex<Lists>,
    destroyed: Notify,
}

/// # Creation
///
impl ClientPool {
    pub fn new(
        context: Arc<ServerContext>,
        executor: Arc<dyn ClientExecutor>,
    ) -> Arc<Self> {
        let buffers = ContextPool::new(context.config().memory_contexts());
        Arc::new(ClientPool {
            context,
            buffers,
            executor,
            lists: Mutex::new(Lists::new()),
            destroyed: Notify::new(),
        })
    }
}

/// # Access
///
impl ClientPool {
    pub fn context(&self) -> &Arc<ServerContext> {
        &self.context
    }

    pub fn buffers(&self) -> &ContextPool {
        &self.buffers
    }

    /// Returns the number of clients that exist.
    pub fn num_clients(&self) -> usize {
        self.lists.lock().slab.len()
    }

    /// Returns the number of clients on a list.
    pub fn list_len(&self, list: ListId) -> usize {
        match list.index() {
            Some(idx) => self.lists.lock().links[idx].len,
            None => {
                let lists = self.lists.lock();
                lists
                    .slab
                    .iter()
                    .filter(|(_, entry)| entry.list == ListId::None)
                    .count()
            }
        }
    }

    /// Returns the list a client is on.
    pub fn membership(&self, id: ClientId) -> ListId {
        self.lists
            .lock()
            .slab
            .get(id.0)
            .map_or(ListId::None, |entry| entry.list)
    }

    pub fn is_shutting_down(&self) -> bool {
        self.lists.lock().shutting_down
    }

    /// Returns whether the pool has been shut down and all clients are gone.
    pub fn is_destroyed(&self) -> bool {
        self.lists.lock().destroyed
    }
}

/// # Clients
///
impl ClientPool {
    /// Attaches up to `n` clients to the given transport of an interface.
    ///
    /// Inactive clients are reused first. New clients are only created as
    /// long as there are fewer than the configured maximum. Every client
    /// attached starts listening once its executor runs it.
    ///
    /// Returns the number of clients attached, which is only less than `n`
    /// if the client limit was hit.
    pub fn create_clients(
        self: &Arc<Self>,
        n: usize,
        interface: &Arc<Interface>,
        transport: Transport,
    ) -> Result<usize, Error> {
        if !interface.serves(transport) {
            return Err(Error::NoTransport);
        }
        let max_clients = self.context.config().max_clients();
        let mut started = Vec::with_capacity(n);
        {
            let mut lists = self.lists.lock();
            if lists.shutting_down {
                return Err(Error::ShuttingDown);
            }
            for _ in 0..n {
                let mut client = if let Some(key) = lists.head(ListId::Inactive) {
                    lists.unlink(key);
                    match lists.slab[key].parked.take() {
                        Some(client) => client,
                        None => {
                            debug_assert!(false, "inactive entry without client");
                            lists.remove(key);
                            continue;
                        }
                    }
                } else if lists.slab.len() < max_clients {
                    let key = lists.slab.insert(Entry::new());
                    ClientState::new(ClientId(key), self.clone(), self.buffers.get())
                } else {
                    debug!(max_clients, "client limit reached");
                    break;
                };

                let (tx, rx) = mailbox();
                client.attach(interface.clone(), transport, tx.clone());
                let token = client.pending.issue(OpKind::Control);
                // The receiver is in our hands, so this cannot fail.
                let _ = tx.send(Event::Start { token });
                let key = client.id.0;
                lists.slab[key].mailbox = Some(tx);
                lists.link(key, ListId::Active);
                trace!(client = %client.id, ?transport, "client attached");
                started.push((client, rx));
            }
        }
        if started.is_empty() {
            return Err(Error::ClientLimit);
        }
        let count = started.len();
        for (client, events) in started {
            self.executor.spawn(client, events);
        }
        Ok(count)
    }

    /// Attaches as many clients to an interface as it wants listening.
    pub fn serve_interface(
        self: &Arc<Self>,
        interface: &Arc<Interface>,
    ) -> Result<usize, Error> {
        let mut count = 0;
        for transport in [Transport::Udp, Transport::Tcp] {
            if interface.serves(transport) {
                let target = interface.gauge(transport).target();
                count += self.create_clients(target, interface, transport)?;
            }
        }
        Ok(count)
    }

    /// Takes back a client that went inactive.
    ///
    /// While shutting down, the client is freed instead.
    pub fn park(&self, mut client: ClientState) {
        let key = client.id.0;
        let mut lists = self.lists.lock();
        if lists.shutting_down {
            client.release_resources();
            lists.remove(key);
            let destroyed = lists.destroyed;
            drop(lists);
            if destroyed {
                self.destroyed.notify_waiters();
            }
            return;
        }
        lists.unlink(key);
        match lists.slab.get_mut(key) {
            Some(entry) => {
                entry.mailbox = None;
                entry.parked = Some(client);
            }
            None => {
                debug_assert!(false, "parked client not in pool");
                return;
            }
        }
        lists.link(key, ListId::Inactive);
    }

    /// Forgets a client that has been freed.
    pub(super) fn remove(&self, id: ClientId) {
        let mut lists = self.lists.lock();
        lists.remove(id.0);
        let destroyed = lists.destroyed;
        drop(lists);
        if destroyed {
            debug!("client pool destroyed");
            self.destroyed.notify_waiters();
        }
    }

    /// Moves a client to another list.
    pub(super) fn move_to(&self, id: ClientId, list: ListId) {
        let mut lists = self.lists.lock();
        match lists.slab.get(id.0) {
            Some(entry) if entry.list != list => {}
            _ => return,
        }
        lists.unlink(id.0);
        lists.link(id.0, list);
    }

    /// Cancels the recursion that has been running longest.
    ///
    /// The client is moved back to the active list and told to stop.
    pub fn kill_oldest_recursing(&self) {
        let mailbox = {
            let mut lists = self.lists.lock();
            let Some(key) = lists.head(ListId::Recursing) else {
                return;
            };
            // The client's own recursing flag stays set until its
            // recursion is done. Its move to the active list then is a
            // no-op.
            lists.unlink(key);
            lists.link(key, ListId::Active);
            lists.slab[key].mailbox.clone()
        };
        if let Some(mailbox) = mailbox {
            debug!("canceling oldest recursion");
            let _ = mailbox.send(Event::KillRecursion);
        }
    }

    /// Shuts the pool down.
    ///
    /// Inactive clients are freed right away. Every other client is told
    /// to shut down and frees itself once its outstanding operations have
    /// completed. No new clients can be attached from now on.
    pub fn destroy(&self) {
        let (mailboxes, parked, destroyed) = {
            let mut lists = self.lists.lock();
            lists.shutting_down = true;
            let mut mailboxes = Vec::new();
            for list in [ListId::Active, ListId::Recursing] {
                for key in lists.keys(list) {
                    if let Some(mailbox) = lists.slab[key].mailbox.clone() {
                        mailboxes.push(mailbox);
                    }
                }
            }
            let mut parked = Vec::new();
            for key in lists.keys(ListId::Inactive) {
                if let Some(client) = lists.remove(key).and_then(|e| e.parked) {
                    parked.push(client);
                }
            }
            if lists.slab.is_empty() {
                lists.destroyed = true;
            }
            (mailboxes, parked, lists.destroyed)
        };
        debug!(
            active = mailboxes.len(),
            inactive = parked.len(),
            "shutting down client pool"
        );
        for mut client in parked {
            client.release_resources();
        }
        for mailbox in mailboxes {
            let _ = mailbox.send(Event::Shutdown);
        }
        if destroyed {
            self.destroyed.notify_waiters();
        }
    }

    /// Waits until the pool has been destroyed and all clients are gone.
    pub async fn wait_destroyed(&self) {
        loop {
            let notified = self.destroyed.notified();
            if self.is_destroyed() {
                return;
            }
            notified.await;
        }
    }
}
