//! Peer records.

use crate::connection::Connection;
use crate::matches::{MatchOwner, MatchRegistry};
use crate::reply::{ReplyOwner, ReplyRegistry};
use crate::user::{User, UserCharge};
use ferrobus_policy::PeerPolicy;
use ferrobus_types::PeerId;
use std::collections::BTreeSet;

/// Socket-derived credentials of a connection.
#[derive(Debug, Clone, Default)]
pub struct PeerCreds {
    pub uid: u32,
    pub gid: u32,
    pub pid: u32,
    /// Auxiliary groups; resolved only when the policy constrains on them.
    pub gids: Vec<u32>,
    /// LSM label, when the socket exposes one.
    pub seclabel: Option<String>,
}

/// One connected peer and everything it owns on the bus.
///
/// `registered` flips on after the `Hello` handshake; only registered
/// peers may own names, subscribe general traffic, or exchange messages
/// beyond the driver. `monitor` is a one-way flag: once set, the peer only
/// observes and can never emit again.
pub struct Peer {
    pub id: PeerId,
    pub pid: u32,
    pub seclabel: Option<String>,
    pub user: User,
    pub connection: Box<dyn Connection>,
    pub policy: PeerPolicy,
    pub registered: bool,
    pub monitor: bool,
    /// Well-known names this peer claims (primary or queued).
    pub owned_names: BTreeSet<String>,
    /// Rules other peers subscribed with this peer's unique id as sender.
    pub matches: MatchRegistry,
    /// Rules this peer subscribed.
    pub owned_matches: MatchOwner,
    /// Replies this peer owes, keyed (caller, serial).
    pub replies_outgoing: ReplyRegistry,
    /// Calls this peer is awaiting answers for.
    pub owned_replies: ReplyOwner,
    /// Connection-lifetime charges: bytes, fds, objects.
    pub(crate) _charges: [UserCharge; 3],
}

impl Peer {
    /// The peer's wire identity.
    #[must_use]
    pub fn unique_name(&self) -> String {
        self.id.unique_name()
    }

    /// The peer's owned names, for policy evaluation.
    #[must_use]
    pub fn name_refs(&self) -> Vec<&str> {
        self.owned_names.iter().map(String::as_str).collect()
    }
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.id)
            .field("uid", &self.user.uid())
            .field("pid", &self.pid)
            .field("registered", &self.registered)
            .field("monitor", &self.monitor)
            .field("owned_names", &self.owned_names)
            .finish_non_exhaustive()
    }
}
