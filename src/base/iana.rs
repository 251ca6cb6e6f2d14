//! IANA definitions for DNS.
//!
//! This module contains the handful of registry values the request
//! lifecycle needs to look at: opcodes to pick a handler, response codes to
//! answer with, classes to pick a view, and the record types that carry
//! EDNS and transaction signatures.
//!
//! All of them are thin wrappers around their wire integers so that values
//! outside of the ones named here survive a round trip unchanged.
#![allow(clippy::upper_case_acronyms)]

use core::fmt;

//------------ int_code! -----------------------------------------------------

macro_rules! int_code {
    (
        $(#[$attr:meta])*
        $ianatype:ident, $inttype:ident;
        $(
            $(#[$variant_attr:meta])*
            ($variant:ident => $value:literal, $mnemonic:literal)
        )*
    ) => {
        $(#[$attr])*
        #[derive(Clone, Copy, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
        pub struct $ianatype($inttype);

        impl $ianatype {
            $(
                $(#[$variant_attr])*
                pub const $variant: $ianatype = $ianatype($value);
            )*

            /// Returns the value for the given integer.
            pub const fn from_int(value: $inttype) -> Self {
                Self(value)
            }

            /// Returns the integer value.
            pub const fn to_int(self) -> $inttype {
                self.0
            }

            /// Returns the mnemonic for this value if there is one.
            pub fn to_mnemonic(self) -> Option<&'static str> {
                match self.0 {
                    $( $value => Some($mnemonic), )*
                    _ => None,
                }
            }
        }

        impl From<$inttype> for $ianatype {
            fn from(value: $inttype) -> Self {
                Self(value)
            }
        }

        impl From<$ianatype> for $inttype {
            fn from(value: $ianatype) -> Self {
                value.0
            }
        }

        impl fmt::Display for $ianatype {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                match self.to_mnemonic() {
                    Some(m) => f.write_str(m),
                    None => write!(f, "{}{}", stringify!($ianatype), self.0),
                }
            }
        }

        impl fmt::Debug for $ianatype {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                match self.to_mnemonic() {
                    Some(m) => write!(f, "{}::{}", stringify!($ianatype), m),
                    None => write!(f, "{}({})", stringify!($ianatype), self.0),
                }
            }
        }
    };
}

//------------ Opcode --------------------------------------------------------

int_code! {
    /// DNS OpCodes.
    ///
    /// The opcode specifies the kind of query to be performed. Only the
    /// four low bits are meaningful; see [`Header::opcode`].
    ///
    /// [`Header::opcode`]: super::header::Header::opcode
    Opcode, u8;

    /// A standard query (0).
    (QUERY => 0, "QUERY")

    /// An inverse query (1, obsolete).
    (IQUERY => 1, "IQUERY")

    /// A server status request (2).
    (STATUS => 2, "STATUS")

    /// A NOTIFY query (4).
    (NOTIFY => 4, "NOTIFY")

    /// An UPDATE query (5).
    (UPDATE => 5, "UPDATE")
}

//------------ Rcode ---------------------------------------------------------

int_code! {
    /// DNS Response Codes.
    ///
    /// The four bit response code carried in the message header. Codes
    /// larger than fifteen need the OPT record and are represented by
    /// [`OptRcode`].
    Rcode, u8;

    /// No error condition.
    (NOERROR => 0, "NOERROR")

    /// Format error: the name server was unable to interpret the query.
    (FORMERR => 1, "FORMERR")

    /// Server failure.
    (SERVFAIL => 2, "SERVFAIL")

    /// Name error: the domain name referenced does not exist.
    (NXDOMAIN => 3, "NXDOMAIN")

    /// Not implemented.
    (NOTIMP => 4, "NOTIMP")

    /// Query refused.
    (REFUSED => 5, "REFUSED")

    /// Server not authoritative for zone or client not authorized.
    (NOTAUTH => 9, "NOTAUTH")
}

//------------ OptRcode ------------------------------------------------------

int_code! {
    /// Extended DNS Response Codes.
    ///
    /// The lower four bits live in the message header, the upper eight in
    /// the OPT record.
    OptRcode, u16;

    /// No error condition.
    (NOERROR => 0, "NOERROR")

    /// Format error.
    (FORMERR => 1, "FORMERR")

    /// Server failure.
    (SERVFAIL => 2, "SERVFAIL")

    /// Name error.
    (NXDOMAIN => 3, "NXDOMAIN")

    /// Not implemented.
    (NOTIMP => 4, "NOTIMP")

    /// Query refused.
    (REFUSED => 5, "REFUSED")

    /// Not authorized.
    (NOTAUTH => 9, "NOTAUTH")

    /// Bad OPT version (16).
    (BADVERS => 16, "BADVERS")
}

impl OptRcode {
    /// Returns the part of the code that goes into the message header.
    pub fn rcode(self) -> Rcode {
        Rcode::from_int((self.0 & 0x0F) as u8)
    }

    /// Returns the part of the code that goes into the OPT record.
    pub fn ext(self) -> u8 {
        (self.0 >> 4) as u8
    }

    /// Returns whether the code can only be expressed with an OPT record.
    pub fn is_ext(self) -> bool {
        self.0 > 0x0F
    }

    /// Combines the header and OPT parts of a response code.
    pub fn from_parts(rcode: Rcode, ext: u8) -> Self {
        Self((u16::from(ext) << 4) | u16::from(rcode.to_int() & 0x0F))
    }
}

impl From<Rcode> for OptRcode {
    fn from(rcode: Rcode) -> Self {
        Self(u16::from(rcode.to_int()))
    }
}

//------------ Class ---------------------------------------------------------

int_code! {
    /// DNS classes.
    Class, u16;

    /// Internet (IN).
    (IN => 1, "IN")

    /// Chaosnet (CH).
    (CH => 3, "CH")

    /// Hesiod (HS).
    (HS => 4, "HS")

    /// Query class None as used by UPDATE.
    (NONE => 254, "NONE")

    /// Query class * (ANY).
    (ANY => 255, "ANY")
}

//------------ Rtype ---------------------------------------------------------

int_code! {
    /// Resource record types.
    Rtype, u16;

    /// A host address.
    (A => 1, "A")

    /// An authoritative name server.
    (NS => 2, "NS")

    /// The canonical name for an alias.
    (CNAME => 5, "CNAME")

    /// Marks the start of a zone of authority.
    (SOA => 6, "SOA")

    /// A signature, used here for SIG(0) transaction signatures.
    (SIG => 24, "SIG")

    /// An IPv6 host address.
    (AAAA => 28, "AAAA")

    /// The EDNS pseudo-record.
    (OPT => 41, "OPT")

    /// A transaction signature.
    (TSIG => 250, "TSIG")
}

//============ Testing =======================================================
