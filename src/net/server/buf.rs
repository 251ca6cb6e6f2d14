//! Request and response buffers.
//!
//! Every client owns at most one [`RequestBuffer`] and one [`SendBuffer`].
//! Both are drawn from a [`BufContext`], a small set of lock-free free lists
//! shared by many clients. The contexts themselves are handed out round
//! robin by a [`ContextPool`] so that heavy concurrency spreads over several
//! free lists instead of contending for one.
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::{BufMut, BytesMut};
use crossbeam_queue::ArrayQueue;

/// The size of a buffer for receiving UDP requests.
pub const UDP_RECV_SIZE: usize = 4096;

/// The size of a buffer for reading a TCP request.
///
/// This is the largest message a two octet length prefix can announce.
pub const TCP_RECV_SIZE: usize = 65_535;

/// The number of buffers of each kind a context keeps for reuse.
const FREE_LIST_LEN: usize = 64;

//------------ RequestBuffer -------------------------------------------------

/// A fixed-capacity buffer holding one received message.
#[derive(Debug)]
pub struct RequestBuffer {
    /// The storage, always filled up to its capacity.
    buf: Box<[u8]>,

    /// The number of octets of the message.
    len: usize,
}

impl RequestBuffer {
    /// Creates a new buffer of the given capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        RequestBuffer {
            buf: vec![0; capacity].into_boxed_slice(),
            len: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Returns the received message.
    pub fn as_slice(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns the whole storage for receiving into it.
    ///
    /// Call [`set_len`][Self::set_len] afterwards.
    pub fn storage_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }

    /// Sets the length of the received message.
    ///
    /// The length is capped at the capacity.
    pub fn set_len(&mut self, len: usize) {
        self.len = len.min(self.buf.len());
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }
}

//------------ SendBuffer ----------------------------------------------------

/// A buffer holding one rendered response.
///
/// For TCP the buffer starts with the two octet length prefix.
#[derive(Debug)]
pub struct SendBuffer {
    buf: BytesMut,
    prefixed: bool,
}

impl SendBuffer {
    fn new(buf: BytesMut, prefixed: bool) -> Self {
        SendBuffer { buf, prefixed }
    }

    /// Empties the buffer for rendering a new message.
    pub fn begin(&mut self) {
        self.buf.clear();
        if self.prefixed {
            self.buf.put_u16(0);
        }
    }

    /// Returns the target to render the message into.
    pub fn target(&mut self) -> &mut BytesMut {
        &mut self.buf
    }

    /// Completes the message by filling in the length prefix if needed.
    pub fn finish(&mut self) {
        if self.prefixed && self.buf.len() >= 2 {
            let len = u16::try_from(self.buf.len() - 2).unwrap_or(u16::MAX);
            self.buf[..2].copy_from_slice(&len.to_be_bytes());
        }
    }

    /// Returns the octets to hand to the transport.
    pub fn as_wire(&self) -> &[u8] {
        &self.buf
    }

    /// Returns the message without a length prefix.
    pub fn message(&self) -> &[u8] {
        if self.prefixed {
            self.buf.get(2..).unwrap_or_default()
        } else {
            &self.buf
        }
    }

    pub fn is_prefixed(&self) -> bool {
        self.prefixed
    }
}

//------------ BufContext ----------------------------------------------------

/// A set of free lists for buffers.
///
/// Buffers are taken from a context and have to be given back to the same
/// context. The context keeps count of the buffers currently out.
#[derive(Debug)]
pub struct BufContext {
    index: usize,
    udp_requests: ArrayQueue<RequestBuffer>,
    tcp_requests: ArrayQueue<RequestBuffer>,
    sends: ArrayQueue<BytesMut>,
    outstanding: AtomicUsize,
}

impl BufContext {
    pub fn new(index: usize) -> Self {
        BufContext {
            index,
            udp_requests: ArrayQueue::new(FREE_LIST_LEN),
            tcp_requests: ArrayQueue::new(FREE_LIST_LEN),
            sends: ArrayQueue::new(FREE_LIST_LEN),
            outstanding: AtomicUsize::new(0),
        }
    }

    /// Returns the position of the context in its pool.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Takes a request buffer sized for the given transport.
    pub fn take_request(&self, tcp: bool) -> RequestBuffer {
        self.outstanding.fetch_add(1, Ordering::Relaxed);
        let (queue, size) = if tcp {
            (&self.tcp_requests, TCP_RECV_SIZE)
        } else {
            (&self.udp_requests, UDP_RECV_SIZE)
        };
        match queue.pop() {
            Some(mut buf) => {
                buf.clear();
                buf
            }
            None => RequestBuffer::with_capacity(size),
        }
    }

    /// Returns a request buffer.
    pub fn give_request(&self, buf: RequestBuffer) {
        self.outstanding.fetch_sub(1, Ordering::Relaxed);
        let queue = if buf.capacity() == TCP_RECV_SIZE {
            &self.tcp_requests
        } else {
            &self.udp_requests
        };
        // A full free list simply lets the buffer go.
        let _ = queue.push(buf);
    }

    /// Takes a send buffer for the given transport.
    pub fn take_send(&self, tcp: bool) -> SendBuffer {
        self.outstanding.fetch_add(1, Ordering::Relaxed);
        let buf = self.sends.pop().unwrap_or_default();
        SendBuffer::new(buf, tcp)
    }

    /// Returns a send buffer.
    pub fn give_send(&self, buf: SendBuffer) {
        self.outstanding.fetch_sub(1, Ordering::Relaxed);
        let mut buf = buf.buf;
        buf.clear();
        let _ = self.sends.push(buf);
    }

    /// The number of buffers taken and not yet given back.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Relaxed)
    }
}

//------------ ContextPool ---------------------------------------------------

/// A fixed number of buffer contexts handed out round robin.
#[derive(Debug)]
pub struct ContextPool {
    contexts: Vec<Arc<BufContext>>,
    next: AtomicUsize,
}

impl ContextPool {
    /// Creates a pool of `count` contexts, at least one.
    pub fn new(count: usize) -> Self {
        ContextPool {
            contexts: (0..count.max(1))
                .map(|index| Arc::new(BufContext::new(index)))
                .collect(),
            next: AtomicUsize::new(0),
        }
    }

    /// Returns the next context in turn.
    pub fn get(&self) -> Arc<BufContext> {
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.contexts.len();
        self.contexts[idx].clone()
    }

    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }

    /// The number of buffers out across all contexts.
    pub fn outstanding(&self) -> usize {
        self.contexts.iter().map(|ctx| ctx.outstanding()).sum()
    }
}

//============ Testing =======================================================
