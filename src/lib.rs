//! The client request lifecycle of a DNS name server.
//!
//! A name server answers requests through _clients_, objects that listen
//! on one transport of one network interface, take a request, see it
//! through to its response and then listen again. This crate provides
//! those clients, the pool managing them, and everything a client needs to
//! decide how to treat a request, while leaving the actual answering to
//! pluggable handlers.
//!
//! The crate is organised in these modules:
//!
//! * [base] contains the minimal DNS wire format handling a client needs:
//!   message headers, a few IANA registries and a reusable message that
//!   can be parsed, turned into a reply and rendered again.
//! * [net] contains the server side: client state machine, pool, buffers,
//!   views, quotas and a runtime driving it all on tokio.
//!
//! # Reference of feature flags
//!
//! * `logging`: provides `logging::init_logging()` to install a
//!   `tracing-subscriber` subscriber that honours `RUST_LOG`.
#![allow(renamed_and_removed_lints)]
#![allow(clippy::unknown_clippy_lints)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod base;
pub mod net;

#[cfg(any(test, feature = "logging"))]
pub mod logging;

mod utils;
