//! The bus singleton and the two-phase peer dispatch.

use crate::connection::{Connection, EventSet};
use crate::driver;
use crate::error::PeerError;
use crate::matches::{MatchRegistry, RuleId};
use crate::names::NameRegistry;
use crate::peer::{Peer, PeerCreds};
use crate::reply::{ReplyOwner, ReplyRegistry};
use crate::user::{User, UserLimits, UserRegistry, UserSlot};
use ferrobus_policy::PolicyRegistry;
use ferrobus_types::PeerId;
use std::collections::BTreeMap;
use tracing::{debug, trace};

/// All peers of the bus, keyed by id.
///
/// Ids increase monotonically and are never reused; `next_id` is the
/// allocator high-water mark the match-placement logic compares against.
#[derive(Default)]
pub struct PeerRegistry {
    peers: BTreeMap<PeerId, Peer>,
    next_id: u64,
}

impl PeerRegistry {
    fn allocate(&mut self) -> PeerId {
        let id = PeerId::new(self.next_id);
        self.next_id += 1;
        id
    }

    /// The id the next peer will receive.
    #[must_use]
    pub fn next_id(&self) -> u64 {
        self.next_id
    }

    /// Looks up a peer in any lifecycle state.
    #[must_use]
    pub fn get(&self, id: PeerId) -> Option<&Peer> {
        self.peers.get(&id)
    }

    pub fn get_mut(&mut self, id: PeerId) -> Option<&mut Peer> {
        self.peers.get_mut(&id)
    }

    /// Looks up a peer that completed `Hello`; unregistered and monitor
    /// peers are unaddressable.
    #[must_use]
    pub fn find_registered(&self, id: PeerId) -> Option<&Peer> {
        self.peers.get(&id).filter(|p| p.registered)
    }

    pub(crate) fn insert(&mut self, peer: Peer) {
        let prev = self.peers.insert(peer.id, peer);
        debug_assert!(prev.is_none(), "peer ids are never reused");
    }

    pub(crate) fn remove(&mut self, id: PeerId) -> Option<Peer> {
        self.peers.remove(&id)
    }

    /// All peer ids, in id order.
    #[must_use]
    pub fn ids(&self) -> Vec<PeerId> {
        self.peers.keys().copied().collect()
    }

    /// Iterates peers in id order.
    pub fn iter(&self) -> impl Iterator<Item = &Peer> {
        self.peers.values()
    }

    /// Number of live peers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    /// True when no peer is connected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

/// The process-wide broker state: every registry, every allocator.
///
/// Mutated only from the dispatch loop; subsystems receive it explicitly
/// instead of reaching for globals.
pub struct Bus {
    guid: String,
    owner: User,
    pub users: UserRegistry,
    pub names: NameRegistry,
    pub peers: PeerRegistry,
    /// Rules with no sender constraint (plus forthcoming-id senders).
    pub wildcard_matches: MatchRegistry,
    /// Rules subscribed to the driver's name.
    pub driver_matches: MatchRegistry,
    pub policy: PolicyRegistry,
    next_txid: u64,
    next_rule_id: RuleId,
    driver_serial: u32,
}

impl Bus {
    /// Creates a bus owned by `owner_uid` (the broker's own uid).
    #[must_use]
    pub fn new(policy: PolicyRegistry, limits: UserLimits, owner_uid: u32) -> Self {
        let users = UserRegistry::new(limits);
        let owner = users.user(owner_uid);
        Self {
            guid: uuid::Uuid::new_v4().simple().to_string(),
            owner,
            users,
            names: NameRegistry::default(),
            peers: PeerRegistry::default(),
            wildcard_matches: MatchRegistry::default(),
            driver_matches: MatchRegistry::default(),
            policy,
            next_txid: 0,
            next_rule_id: 0,
            driver_serial: 0,
        }
    }

    /// The GUID advertised during the handshake and by `GetId`.
    #[must_use]
    pub fn guid(&self) -> &str {
        &self.guid
    }

    /// The broker's own accounting record.
    #[must_use]
    pub fn owner(&self) -> &User {
        &self.owner
    }

    /// Admits an authenticated connection as a new peer.
    ///
    /// Order matters: credentials are checked against connect policy, the
    /// peer's baseline charges are taken, the policy snapshot is frozen,
    /// and only then is an id allocated and the peer linked in. A failure
    /// anywhere leaves no trace.
    pub fn add_peer(
        &mut self,
        connection: Box<dyn Connection>,
        creds: PeerCreds,
    ) -> Result<PeerId, PeerError> {
        self.policy
            .check_connect(creds.uid, &creds.gids, creds.seclabel.as_deref())
            .map_err(|_| PeerError::ConnectionRefused)?;

        let user = self.users.user(creds.uid);
        let charges = [
            user.charge(UserSlot::Bytes, std::mem::size_of::<Peer>() as u64),
            user.charge(UserSlot::Fds, 1),
            user.charge(UserSlot::Objects, 1),
        ];
        let mut taken = Vec::with_capacity(3);
        for charge in charges {
            taken.push(charge.map_err(|_| PeerError::Quota)?);
        }
        let charges: [_; 3] = taken.try_into().expect("three charges");

        let policy = self.policy.instantiate(creds.uid, &creds.gids);
        let id = self.peers.allocate();
        let peer = Peer {
            id,
            pid: creds.pid,
            seclabel: creds.seclabel,
            user,
            connection,
            policy,
            registered: false,
            monitor: false,
            owned_names: Default::default(),
            matches: MatchRegistry::default(),
            owned_matches: Default::default(),
            replies_outgoing: ReplyRegistry::default(),
            owned_replies: ReplyOwner::default(),
            _charges: charges,
        };
        self.peers.insert(peer);
        debug!(peer = %id, uid = creds.uid, pid = creds.pid, "peer connected");
        Ok(id)
    }

    /// Dispatches one readiness wake-up for a peer, in two phases.
    ///
    /// Phase one handles read/hangup, draining inbound messages and any
    /// synchronous driver replies they produce; phase two flushes writes.
    /// The connection's interest is re-queried between phases because the
    /// first phase may have registered write interest. Splitting this way
    /// lets a driver request and its reply complete in one wake-up.
    pub fn dispatch_peer(&mut self, id: PeerId, events: EventSet) -> Result<(), PeerError> {
        let phases = [EventSet::READABLE | EventSet::HANGUP, EventSet::WRITABLE];

        let mut failure = None;
        for phase in phases {
            let Some(peer) = self.peers.get(id) else {
                return Ok(());
            };
            if !peer.connection.interest().intersects(phase) {
                continue;
            }
            if let Err(err) = self.dispatch_connection(id, events.intersection(phase)) {
                failure = Some(err);
                break;
            }
        }

        match failure {
            None => {}
            Some(PeerError::Eof) => {
                trace!(peer = %id, "peer hung up");
                driver::goodbye(self, id, false);
                if let Some(peer) = self.peers.get_mut(id) {
                    peer.connection.shutdown();
                }
            }
            Some(PeerError::ProtocolViolation) => {
                debug!(peer = %id, "protocol violation, disconnecting");
                if let Some(peer) = self.peers.get_mut(id) {
                    peer.connection.close();
                }
                driver::goodbye(self, id, false);
            }
            Some(err) => return Err(err),
        }

        if self
            .peers
            .get(id)
            .is_some_and(|peer| !peer.connection.is_running())
        {
            // The transport may have been shut down mid-dispatch (outbox
            // overflow); the cascade is a no-op when it already ran.
            driver::goodbye(self, id, false);
            self.free_peer(id);
        }
        Ok(())
    }

    /// Feeds events into the transport and drains its inbound messages.
    fn dispatch_connection(&mut self, id: PeerId, events: EventSet) -> Result<(), PeerError> {
        if let Some(peer) = self.peers.get_mut(id) {
            peer.connection.dispatch(events)?;
        }
        loop {
            let Some(peer) = self.peers.get_mut(id) else {
                return Ok(());
            };
            let Some(message) = peer.connection.dequeue()? else {
                return Ok(());
            };
            driver::dispatch_message(self, id, message)?;
        }
    }

    /// Removes a peer whose connection finished. The goodbye cascade must
    /// have run already.
    pub(crate) fn free_peer(&mut self, id: PeerId) {
        if let Some(peer) = self.peers.remove(id) {
            debug_assert!(!peer.registered, "goodbye precedes free");
            debug_assert!(peer.owned_names.is_empty());
            debug_assert!(peer.owned_matches.is_empty());
            debug!(peer = %id, "peer freed");
        }
    }

    /// Silently disconnects every peer; bus teardown.
    pub fn flush_peers(&mut self) {
        for id in self.peers.ids() {
            driver::goodbye(self, id, true);
            if let Some(peer) = self.peers.get_mut(id) {
                peer.connection.close();
            }
            self.free_peer(id);
        }
    }

    /// Starts a new multicast transaction.
    pub(crate) fn next_txid(&mut self) -> u64 {
        self.next_txid += 1;
        self.next_txid
    }

    pub(crate) fn allocate_rule_id(&mut self) -> RuleId {
        self.next_rule_id += 1;
        self.next_rule_id
    }

    /// Serial allocator for driver-originated messages.
    pub(crate) fn next_driver_serial(&mut self) -> u32 {
        self.driver_serial = self.driver_serial.wrapping_add(1).max(1);
        self.driver_serial
    }

    /// Whether `peer` may use privileged driver surfaces.
    #[must_use]
    pub fn is_privileged(&self, peer: &Peer) -> bool {
        peer.user.uid() == 0 || peer.user.uid() == self.owner.uid()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{memory_pair, MemoryHandle};

    fn bus() -> Bus {
        Bus::new(PolicyRegistry::allow_all(), UserLimits::default(), 0)
    }

    fn connect(bus: &mut Bus, uid: u32) -> (PeerId, MemoryHandle) {
        let (connection, handle) = memory_pair(u64::MAX);
        let id = bus
            .add_peer(
                Box::new(connection),
                PeerCreds {
                    uid,
                    ..PeerCreds::default()
                },
            )
            .expect("admitted");
        (id, handle)
    }

    #[test]
    fn peer_ids_increase_and_never_reuse() {
        let mut bus = bus();
        let (a, _ha) = connect(&mut bus, 1);
        let (b, hb) = connect(&mut bus, 1);
        assert!(a < b);
        assert!(a.raw() < bus.peers.next_id());

        hb.push_eof();
        bus.dispatch_peer(b, EventSet::READABLE).expect("dispatch");
        let (c, _hc) = connect(&mut bus, 1);
        assert!(b < c, "freed ids are not recycled");
    }

    #[test]
    fn admission_charges_are_refunded_on_free() {
        let mut bus = bus();
        let user = bus.users.user(9);
        let (id, handle) = connect(&mut bus, 9);
        assert_eq!(user.usage(UserSlot::Objects), 1);
        assert_eq!(user.usage(UserSlot::Fds), 1);

        handle.push_eof();
        bus.dispatch_peer(id, EventSet::READABLE).expect("dispatch");
        assert!(bus.peers.get(id).is_none());
        assert_eq!(user.usage(UserSlot::Objects), 0);
        assert_eq!(user.usage(UserSlot::Fds), 0);
        assert_eq!(user.usage(UserSlot::Bytes), 0);
    }

    #[test]
    fn refused_connections_leave_nothing() {
        use ferrobus_policy::{Action, ConnectRule, PolicyConfig};
        let policy = PolicyRegistry::new(PolicyConfig {
            connect: vec![ConnectRule {
                action: Action::Deny,
                uid: Some(13),
                gid: None,
            }],
            ..PolicyConfig::default()
        });
        let mut bus = Bus::new(policy, UserLimits::default(), 0);
        let (connection, _handle) = memory_pair(u64::MAX);
        let err = bus
            .add_peer(
                Box::new(connection),
                PeerCreds {
                    uid: 13,
                    ..PeerCreds::default()
                },
            )
            .unwrap_err();
        assert_eq!(err, PeerError::ConnectionRefused);
        assert!(bus.peers.is_empty());
        assert_eq!(bus.users.user(13).usage(UserSlot::Objects), 0);
    }

    #[test]
    fn quota_bounds_connections_per_uid() {
        let mut bus = Bus::new(
            PolicyRegistry::allow_all(),
            UserLimits {
                max_fds: 1,
                ..UserLimits::default()
            },
            0,
        );
        let (_a, _ha) = connect(&mut bus, 5);
        let (connection, _handle) = memory_pair(u64::MAX);
        let err = bus
            .add_peer(
                Box::new(connection),
                PeerCreds {
                    uid: 5,
                    ..PeerCreds::default()
                },
            )
            .unwrap_err();
        assert_eq!(err, PeerError::Quota);
    }

    #[test]
    fn find_registered_hides_pre_hello_peers() {
        let mut bus = bus();
        let (id, _handle) = connect(&mut bus, 1);
        assert!(bus.peers.find_registered(id).is_none());
        assert!(bus.peers.get(id).is_some());
    }

    #[test]
    fn flush_peers_empties_the_bus() {
        let mut bus = bus();
        let (_a, _ha) = connect(&mut bus, 1);
        let (_b, _hb) = connect(&mut bus, 2);
        bus.flush_peers();
        assert!(bus.peers.is_empty());
    }
}
