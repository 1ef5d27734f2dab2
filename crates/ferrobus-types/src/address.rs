//! Peer identifiers and bus-address classification.
//!
//! Unique names have the shape `:1.N` where `N` is the 64-bit peer id
//! assigned by the broker at connection time. Ids increase monotonically and
//! are never reused, so an id below the allocator's high-water mark that no
//! longer resolves belongs to a peer that is gone for good.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Broker-assigned identity of one peer connection.
///
/// Rendered on the wire as the unique name `:1.N`. The id space is
/// monotonic: the broker hands out `0, 1, 2, …` and never reuses a value,
/// which lets subscription placement distinguish "peer not yet connected"
/// from "peer gone forever".
///
/// # Example
///
/// ```
/// use ferrobus_types::PeerId;
///
/// let id = PeerId::new(3);
/// assert_eq!(id.unique_name(), ":1.3");
/// assert!(id < PeerId::new(4));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PeerId(u64);

impl PeerId {
    /// Reserved sentinel meaning "no peer". Never allocated to a real peer.
    pub const INVALID: PeerId = PeerId(u64::MAX);

    /// Wraps a raw 64-bit id.
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw 64-bit value.
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Returns the wire form `:1.N`.
    #[must_use]
    pub fn unique_name(self) -> String {
        format!(":1.{}", self.0)
    }

    /// Returns `true` for the reserved never-allocated sentinel.
    #[must_use]
    pub const fn is_invalid(self) -> bool {
        self.0 == u64::MAX
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, ":1.{}", self.0)
    }
}

/// Classification of a sender or destination string.
///
/// # Example
///
/// ```
/// use ferrobus_types::{Address, PeerId};
///
/// assert_eq!(Address::parse(":1.0"), Address::Id(PeerId::new(0)));
/// assert_eq!(Address::parse("org.example.Svc"), Address::Name("org.example.Svc".into()));
/// assert_eq!(Address::parse(":2.0"), Address::Other);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    /// A unique name `:1.N`.
    Id(PeerId),
    /// A well-known bus name.
    Name(String),
    /// Neither shape; `:`-prefixed strings outside the unique-name grammar.
    Other,
}

impl Address {
    /// Parses an address string.
    ///
    /// `:1.N` with a decimal `N` that fits 64 bits (and is below the
    /// [`PeerId::INVALID`] sentinel) yields [`Address::Id`]. Any other
    /// `:`-prefixed string yields [`Address::Other`]. Everything else is
    /// treated as a well-known name; name validity is not checked here.
    #[must_use]
    pub fn parse(s: &str) -> Self {
        if let Some(rest) = s.strip_prefix(':') {
            let Some(digits) = rest.strip_prefix("1.") else {
                return Address::Other;
            };
            if digits.is_empty() || digits.bytes().any(|b| !b.is_ascii_digit()) {
                return Address::Other;
            }
            match digits.parse::<u64>() {
                Ok(raw) if raw != PeerId::INVALID.raw() => Address::Id(PeerId::new(raw)),
                _ => Address::Other,
            }
        } else {
            Address::Name(s.to_owned())
        }
    }

    /// Returns the peer id if this is a unique-name address.
    #[must_use]
    pub fn id(&self) -> Option<PeerId> {
        match self {
            Address::Id(id) => Some(*id),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unique_name_round_trip() {
        for raw in [0u64, 1, 99, 1 << 40] {
            let id = PeerId::new(raw);
            assert_eq!(Address::parse(&id.unique_name()), Address::Id(id));
        }
    }

    #[test]
    fn invalid_sentinel_is_never_parsed() {
        let s = format!(":1.{}", u64::MAX);
        assert_eq!(Address::parse(&s), Address::Other);
        assert!(PeerId::INVALID.is_invalid());
        assert!(!PeerId::new(0).is_invalid());
    }

    #[test]
    fn malformed_unique_names_are_other() {
        for s in [":", ":1.", ":1.x", ":2.0", ":1.0.1", ":99", ":1.18446744073709551616"] {
            assert_eq!(Address::parse(s), Address::Other, "{s}");
        }
    }

    #[test]
    fn bus_names_pass_through() {
        assert_eq!(
            Address::parse("org.freedesktop.DBus"),
            Address::Name("org.freedesktop.DBus".into())
        );
        // Validity is the caller's concern.
        assert_eq!(Address::parse("not a name"), Address::Name("not a name".into()));
    }

    #[test]
    fn display_matches_unique_name() {
        assert_eq!(PeerId::new(12).to_string(), ":1.12");
    }
}
