//! Basics.
//!
//! This module provides the small amount of DNS message handling the client
//! lifecycle needs in order to route a request: the message header, the
//! IANA registry values it looks at, and a reusable message object that can
//! be parsed into, turned into a reply, and rendered again.
//!
//! The types are deliberately simple. Record data is kept opaque, names are
//! decompressed when parsed and never compressed when rendered.

pub use self::header::{Header, HeaderCounts};
pub use self::message::{
    Name, Opt, ParseError, ParsedMessage, Question, Record, RenderError,
    ReplyError,
};

pub mod header;
pub mod iana;
pub mod message;
