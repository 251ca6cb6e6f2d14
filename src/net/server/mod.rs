//! The request lifecycle of a name server.
//!
//! This module implements the objects that receive DNS requests, see them
//! through to a response, and then go back to waiting for the next one.
//!
//! # Architecture
//!
//! ```text
//!                     +------------+
//!                     | ClientPool |  active / recursing / inactive lists
//!                     +------------+
//!                       |  attach, park, free
//!                       v
//!   Interface --> ClientState <-- Event (mailbox) <-- ClientIo completions
//!                       |                          <-- timers, resolver
//!                       v
//!                 RequestHandler (via Exchange)
//! ```
//!
//! A [`ClientState`] serves one transport of one [`Interface`]. It issues
//! asynchronous operations through a [`ClientIo`] and learns about their
//! completion through [`Event`]s in its mailbox, handled one at a time by
//! [`ClientState::handle_event`]. Everything a client does in between
//! events is synchronous.
//!
//! The life of a client follows the [`State`]s `Ready` (listening),
//! `Reading` (TCP only, a connection is open) and `Working` (a request is
//! being handled). Going back down is always done through a requested
//! pending state which is only taken once every operation belonging to the
//! current state has completed. This is what makes it safe to shut a
//! client down, time it out, or retire it at any moment.
//!
//! Requests are parsed into a reusable [`ParsedMessage`], matched to a
//! [`View`], checked for their signature and EDNS options and then handed
//! to a [`RequestHandler`] inside an [`Exchange`]. Handlers either respond
//! right away or start asynchronous work such as a recursion through the
//! view's [`Resolver`].
//!
//! A [`ClientPool`] keeps track of all clients and runs them via a
//! [`ClientExecutor`]. The [`runtime`] module provides one for tokio
//! together with a [`ClientIo`] on tokio sockets.
//!
//! # Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use domain_nsclient::base::iana::Class;
//! use domain_nsclient::net::server::config::Config;
//! use domain_nsclient::net::server::context::ServerContext;
//! use domain_nsclient::net::server::interface::Interface;
//! use domain_nsclient::net::server::pool::ClientPool;
//! use domain_nsclient::net::server::runtime::TokioExecutor;
//! use domain_nsclient::net::server::view::{View, ViewList};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let views = ViewList::new().with_view(View::new("default", Class::IN));
//! let context = Arc::new(ServerContext::new(Config::default(), Arc::new(views)));
//! let pool = ClientPool::new(context, Arc::new(TokioExecutor::current()?));
//! let interface = Arc::new(Interface::bind("127.0.0.1:8053".parse()?, 4, 2).await?);
//! pool.serve_interface(&interface)?;
//! // ...
//! pool.destroy();
//! pool.wait_destroyed().await;
//! # Ok(())
//! # }
//! ```
//!
//! [`ParsedMessage`]: crate::base::message::ParsedMessage
//! [`ClientState`]: client::ClientState
//! [`ClientState::handle_event`]: client::ClientState::handle_event
//! [`State`]: client::State
//! [`ClientIo`]: sock::ClientIo
//! [`Event`]: event::Event
//! [`Interface`]: interface::Interface
//! [`View`]: view::View
//! [`RequestHandler`]: handler::RequestHandler
//! [`Exchange`]: handler::Exchange
//! [`Resolver`]: recursion::Resolver
//! [`ClientPool`]: pool::ClientPool
//! [`ClientExecutor`]: pool::ClientExecutor

pub mod buf;
pub mod client;
pub mod config;
pub mod context;
mod dispatch;
pub mod error;
pub mod event;
pub mod handler;
pub mod interface;
pub mod metrics;
pub mod pool;
pub mod quota;
pub mod recursion;
pub mod runtime;
pub mod signature;
pub mod sock;
pub mod view;

mod util;

#[cfg(test)]
mod tests;
