//! Classification of request signatures.
//!
//! Verifying TSIG or SIG(0) signatures is not done here. A
//! [`SignatureVerifier`] looks at the request and the matched view and
//! reports a [`SigStatus`]. The client only acts on the classification.
use super::view::View;
use crate::base::message::{Name, ParsedMessage};

//------------ SigStatus -----------------------------------------------------

/// The result of checking the signature of a request.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SigStatus {
    /// The request is not signed.
    Absent,

    /// The request carries a valid signature by the given key.
    Valid { signer: Name },

    /// The request is signed by a key the view does not know as an
    /// identity.
    NoIdentity,

    /// The signature did not verify.
    ///
    /// `bad_key` is set if verification failed because the key itself is
    /// unknown.
    Invalid { bad_key: bool },
}

//------------ SignatureVerifier ---------------------------------------------

/// Checks request signatures.
pub trait SignatureVerifier: Send + Sync {
    fn verify(&self, msg: &ParsedMessage, view: &View) -> SigStatus;
}

//------------ NoKeys --------------------------------------------------------

/// A verifier that knows no keys at all.
///
/// Unsigned requests are absent, every signed request has a bad key.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoKeys;

impl SignatureVerifier for NoKeys {
    fn verify(&self, msg: &ParsedMessage, _view: &View) -> SigStatus {
        if msg.signature().is_some() {
            SigStatus::Invalid { bad_key: true }
        } else {
            SigStatus::Absent
        }
    }
}
