//! Receiving and answering DNS requests.
//!
//! Currently, the module only provides the [`server`] sub-module containing
//! the request lifecycle of a name server.

pub mod server;
