//! Response key derivation.
//!
//! The correlation scheme is protocol specific, so it is injected into the
//! message manager as a [`Correlator`] rather than hard-coded. Two schemes
//! ship with the crate:
//!
//! - [`EchoCorrelator`]: the response key is the whole message. Suits devices
//!   that echo each command back verbatim.
//! - [`FunctionUnitCorrelator`]: messages start with a two-digit function unit,
//!   one status digit and a two-digit command id (`UUECC...`). Request and
//!   response share the key `UU` + `CC`; a nonzero status digit marks an error
//!   response. Messages starting with `$` are unsolicited events keyed by
//!   their first six bytes (`$UUECC`).

use bytes::Bytes;
use std::fmt;

/// Opaque key used to pair a response with the request that caused it.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResponseKey(Bytes);

impl ResponseKey {
    /// Wrap raw key bytes.
    pub fn new(key: impl Into<Bytes>) -> Self {
        Self(key.into())
    }

    /// The raw key bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for ResponseKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

impl fmt::Debug for ResponseKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ResponseKey({:?})", String::from_utf8_lossy(&self.0))
    }
}

impl From<&'static str> for ResponseKey {
    fn from(key: &'static str) -> Self {
        Self(Bytes::from_static(key.as_bytes()))
    }
}

impl From<String> for ResponseKey {
    fn from(key: String) -> Self {
        Self(Bytes::from(key))
    }
}

impl From<&[u8]> for ResponseKey {
    fn from(key: &[u8]) -> Self {
        Self(Bytes::copy_from_slice(key))
    }
}

/// Protocol-specific pairing rules shared by a manager and its devices.
pub trait Correlator: Send + Sync {
    /// Key under which the response to `request` will arrive.
    fn request_key(&self, request: &[u8]) -> ResponseKey;

    /// Key carried by an incoming message.
    fn response_key(&self, response: &[u8]) -> ResponseKey;

    /// Whether a well-formed response carries a device error code.
    fn is_error(&self, _response: &[u8]) -> bool {
        false
    }

    /// Whether a message is a device-initiated event rather than a reply.
    ///
    /// Only affects how unmatched messages are logged.
    fn is_unsolicited(&self, _response: &[u8]) -> bool {
        false
    }
}

/// The whole message is the key.
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoCorrelator;

impl Correlator for EchoCorrelator {
    fn request_key(&self, request: &[u8]) -> ResponseKey {
        ResponseKey::from(request)
    }

    fn response_key(&self, response: &[u8]) -> ResponseKey {
        ResponseKey::from(response)
    }
}

/// `UUECC` function-unit framing; see the module docs.
#[derive(Debug, Clone, Copy, Default)]
pub struct FunctionUnitCorrelator;

const EVENT_MARKER: u8 = b'$';
const EVENT_KEY_LEN: usize = 6;

impl FunctionUnitCorrelator {
    fn unit_and_command(message: &[u8]) -> ResponseKey {
        let unit = message.get(..2).unwrap_or(message);
        let command = message.get(3..5).unwrap_or_default();
        let mut key = Vec::with_capacity(unit.len() + command.len());
        key.extend_from_slice(unit);
        key.extend_from_slice(command);
        ResponseKey::new(key)
    }
}

impl Correlator for FunctionUnitCorrelator {
    fn request_key(&self, request: &[u8]) -> ResponseKey {
        Self::unit_and_command(request)
    }

    fn response_key(&self, response: &[u8]) -> ResponseKey {
        if self.is_unsolicited(response) {
            let end = response.len().min(EVENT_KEY_LEN);
            ResponseKey::from(&response[..end])
        } else {
            Self::unit_and_command(response)
        }
    }

    fn is_error(&self, response: &[u8]) -> bool {
        let status = if self.is_unsolicited(response) {
            response.get(3)
        } else {
            response.get(2)
        };
        matches!(status, Some(digit) if *digit != b'0')
    }

    fn is_unsolicited(&self, response: &[u8]) -> bool {
        response.first() == Some(&EVENT_MARKER)
    }
}
