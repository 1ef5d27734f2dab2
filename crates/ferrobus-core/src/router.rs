//! Routing operations on the bus: unicast calls and replies, multicast
//! fan-out, and the linking of match rules into their target registries.

use crate::bus::{Bus, PeerRegistry};
use crate::error::{MatchError, PeerError, ReplyError};
use crate::matches::{
    MatchFilter, MatchOwner, MatchRegistry, RefRule, RuleId, RuleList, RulePlacement, RuleRef,
};
use crate::peer::Peer;
use ferrobus_message::{wire, Message};
use ferrobus_policy::PeerPolicy;
use ferrobus_types::{Address, PeerId};
use tracing::trace;

/// One planned delivery out of a multicast sweep.
struct Delivery {
    receiver: PeerId,
    /// Monitor deliveries bypass policy.
    monitor: bool,
}

fn policy_allows(
    sender_policy: Option<&PeerPolicy>,
    sender_names: &[&str],
    receiver: &Peer,
    message: &Message,
) -> bool {
    let receiver_names = receiver.name_refs();
    let interface = message.interface.as_deref();
    let member = message.member.as_deref();
    let path = message.path.as_deref();
    if let Some(policy) = sender_policy {
        if policy
            .check_send(&receiver_names, interface, member, path, message.kind)
            .is_err()
        {
            return false;
        }
    }
    receiver
        .policy
        .check_receive(sender_names, interface, member, path, message.kind)
        .is_ok()
}

/// Sweeps one registry for matching rules, policy-filtering as it goes.
///
/// The addressed unicast receiver is skipped (it already has the message);
/// monitor rules are swept for every routed message and skip policy.
fn collect_from_registry(
    peers: &PeerRegistry,
    registry: &MatchRegistry,
    sender_policy: Option<&PeerPolicy>,
    sender_names: &[&str],
    filter: &MatchFilter,
    message: &Message,
    out: &mut Vec<Delivery>,
) {
    let unicast = filter.destination.is_some();
    for rule_ref in registry.candidates(unicast) {
        if Some(rule_ref.owner) == filter.destination {
            continue;
        }
        let Some(owner) = peers.get(rule_ref.owner) else {
            continue;
        };
        let Some(rule) = owner.owned_matches.get(rule_ref.rule) else {
            continue;
        };
        if !rule.matches(filter) {
            continue;
        }
        if !policy_allows(sender_policy, sender_names, owner, message) {
            continue;
        }
        out.push(Delivery {
            receiver: rule_ref.owner,
            monitor: false,
        });
    }
    for rule_ref in registry.monitors() {
        if Some(rule_ref.owner) == filter.destination {
            continue;
        }
        let Some(owner) = peers.get(rule_ref.owner) else {
            continue;
        };
        let Some(rule) = owner.owned_matches.get(rule_ref.rule) else {
            continue;
        };
        if rule.matches(filter) {
            out.push(Delivery {
                receiver: rule_ref.owner,
                monitor: true,
            });
        }
    }
}

impl Bus {
    /// Routes a unicast message to `receiver_id`, tracking a reply slot
    /// for calls that expect one, then re-broadcasts for eavesdroppers.
    ///
    /// Either every side effect lands or none: a policy or quota failure
    /// after slot creation retracts the slot.
    pub(crate) fn queue_call(
        &mut self,
        sender_id: PeerId,
        receiver_id: PeerId,
        message: &Message,
    ) -> Result<(), PeerError> {
        let track_reply = message.expects_reply();
        if track_reply {
            let sender_user = self
                .peers
                .get(sender_id)
                .map(|p| p.user.clone())
                .ok_or_else(|| PeerError::Internal("sender vanished".into()))?;
            let receiver = self
                .peers
                .get_mut(receiver_id)
                .ok_or_else(|| PeerError::Internal("receiver vanished".into()))?;
            match receiver
                .replies_outgoing
                .insert(sender_id, &sender_user, message.serial)
            {
                Ok(()) => {}
                Err(ReplyError::Exists) => return Err(PeerError::ReplyExists),
                Err(ReplyError::Quota) => return Err(PeerError::Quota),
            }
            if let Some(sender) = self.peers.get_mut(sender_id) {
                sender.owned_replies.insert(receiver_id, message.serial);
            }
        }

        let result = self.queue_call_inner(sender_id, receiver_id, message);
        if result.is_err() && track_reply {
            if let Some(receiver) = self.peers.get_mut(receiver_id) {
                drop(receiver.replies_outgoing.remove(sender_id, message.serial));
            }
            if let Some(sender) = self.peers.get_mut(sender_id) {
                sender.owned_replies.remove(receiver_id, message.serial);
            }
        }
        result?;

        // Eavesdroppers and monitors observe the unicast; the addressed
        // receiver is suppressed by the broadcast sweep.
        self.broadcast(Some(sender_id), Some(receiver_id), None, message)
    }

    fn queue_call_inner(
        &mut self,
        sender_id: PeerId,
        receiver_id: PeerId,
        message: &Message,
    ) -> Result<(), PeerError> {
        let interface = message.interface.as_deref();
        let member = message.member.as_deref();
        let path = message.path.as_deref();

        {
            let sender = self
                .peers
                .get(sender_id)
                .ok_or_else(|| PeerError::Internal("sender vanished".into()))?;
            let receiver = self
                .peers
                .get(receiver_id)
                .ok_or_else(|| PeerError::Internal("receiver vanished".into()))?;
            receiver
                .policy
                .check_receive(&sender.name_refs(), interface, member, path, message.kind)
                .map_err(|_| PeerError::ReceiveDenied)?;
            sender
                .policy
                .check_send(&receiver.name_refs(), interface, member, path, message.kind)
                .map_err(|_| PeerError::SendDenied)?;
        }

        let sender_user = self
            .peers
            .get(sender_id)
            .map(|p| p.user.clone())
            .ok_or_else(|| PeerError::Internal("sender vanished".into()))?;
        let receiver = self
            .peers
            .get_mut(receiver_id)
            .ok_or_else(|| PeerError::Internal("receiver vanished".into()))?;
        receiver
            .connection
            .queue(Some(&sender_user), 0, message.clone())
            .map_err(PeerError::from)
    }

    /// Routes a reply back through the slot it answers.
    ///
    /// A reply with no matching outstanding slot is a protocol-level
    /// surprise surfaced as [`PeerError::UnexpectedReply`]. An overflowing
    /// reply receiver is shut down rather than failing the reply path.
    pub(crate) fn queue_reply(
        &mut self,
        sender_id: PeerId,
        destination: &str,
        reply_serial: u32,
        message: &Message,
    ) -> Result<(), PeerError> {
        let Address::Id(caller_id) = Address::parse(destination) else {
            return Err(PeerError::UnexpectedReply);
        };
        let sender = self
            .peers
            .get_mut(sender_id)
            .ok_or_else(|| PeerError::Internal("sender vanished".into()))?;
        let Some(slot) = sender.replies_outgoing.remove(caller_id, reply_serial) else {
            return Err(PeerError::UnexpectedReply);
        };
        drop(slot);

        if let Some(caller) = self.peers.get_mut(caller_id) {
            caller.owned_replies.remove(sender_id, reply_serial);
            if let Err(err) = caller.connection.queue(None, 0, message.clone()) {
                match err {
                    crate::error::ConnectionError::Quota => caller.connection.shutdown(),
                    other => return Err(PeerError::from(other)),
                }
            }
        }

        self.broadcast(Some(sender_id), Some(caller_id), None, message)
    }

    /// Fans a message out to every matching subscription.
    ///
    /// A fresh transaction id tags the sweep so a peer matching several
    /// rules still receives the message once. The sweep order is the
    /// wildcard registry, the registry attached to the sender's own unique
    /// id, then the registries of the names the sender is primary on — or
    /// the driver registry for driver-originated traffic.
    pub(crate) fn broadcast(
        &mut self,
        sender: Option<PeerId>,
        addressed_receiver: Option<PeerId>,
        filter: Option<MatchFilter>,
        message: &Message,
    ) -> Result<(), PeerError> {
        let filter =
            filter.unwrap_or_else(|| MatchFilter::for_message(message, sender, addressed_receiver));
        let txid = self.next_txid();

        let mut deliveries = Vec::new();
        {
            let sender_peer = sender.and_then(|id| self.peers.get(id));
            let sender_policy = sender_peer.map(|p| &p.policy);
            let sender_names: Vec<&str> =
                sender_peer.map(Peer::name_refs).unwrap_or_default();

            collect_from_registry(
                &self.peers,
                &self.wildcard_matches,
                sender_policy,
                &sender_names,
                &filter,
                message,
                &mut deliveries,
            );
            if let Some(sender_peer) = sender_peer {
                collect_from_registry(
                    &self.peers,
                    &sender_peer.matches,
                    sender_policy,
                    &sender_names,
                    &filter,
                    message,
                    &mut deliveries,
                );
                for name in &sender_peer.owned_names {
                    if self.names.primary_owner(name) != Some(sender_peer.id) {
                        continue;
                    }
                    let Some(entry) = self.names.get(name) else {
                        continue;
                    };
                    collect_from_registry(
                        &self.peers,
                        &entry.matches,
                        sender_policy,
                        &sender_names,
                        &filter,
                        message,
                        &mut deliveries,
                    );
                }
            } else {
                collect_from_registry(
                    &self.peers,
                    &self.driver_matches,
                    None,
                    &sender_names,
                    &filter,
                    message,
                    &mut deliveries,
                );
            }
        }

        for delivery in deliveries {
            let Some(receiver) = self.peers.get_mut(delivery.receiver) else {
                continue;
            };
            match receiver.connection.queue(None, txid, message.clone()) {
                Ok(()) => {}
                Err(crate::error::ConnectionError::Quota) => {
                    trace!(peer = %delivery.receiver, monitor = delivery.monitor,
                           "receiver over quota during multicast, shutting down");
                    receiver.connection.shutdown();
                }
                Err(other) => return Err(PeerError::from(other)),
            }
        }
        Ok(())
    }

    /// Adds a subscription for `peer_id` and links it to its target.
    pub(crate) fn add_match(
        &mut self,
        peer_id: PeerId,
        rule_string: &str,
        force_eavesdrop: bool,
    ) -> Result<(), MatchError> {
        let rule_id = self.allocate_rule_id();
        let peer = self
            .peers
            .get_mut(peer_id)
            .ok_or(MatchError::NotFound)?;
        let user = peer.user.clone();
        let monitor = peer.monitor;
        match peer.owned_matches.ref_rule(rule_id, &user, rule_string)? {
            RefRule::Coalesced(_) => Ok(()),
            RefRule::New(id) => {
                if force_eavesdrop {
                    if let Some(rule) = peer.owned_matches.get_mut(id) {
                        rule.keys.eavesdrop = true;
                    }
                }
                self.link_match(peer_id, id, monitor);
                Ok(())
            }
        }
    }

    /// Drops one reference to a subscription, unlinking on the last.
    pub(crate) fn remove_match(
        &mut self,
        peer_id: PeerId,
        rule_string: &str,
    ) -> Result<(), MatchError> {
        let peer = self
            .peers
            .get_mut(peer_id)
            .ok_or(MatchError::NotFound)?;
        let id = peer
            .owned_matches
            .find(rule_string)?
            .ok_or(MatchError::NotFound)?;
        let last = {
            let rule = peer.owned_matches.get_mut(id).ok_or(MatchError::NotFound)?;
            if rule.n_user_refs > 1 {
                rule.n_user_refs -= 1;
                false
            } else {
                true
            }
        };
        if last {
            // Last reference: unlink from the target registry first so no
            // dangling reference survives, then drop the rule itself.
            self.detach_rule(peer_id, id, true);
        }
        Ok(())
    }

    /// Unlinks and drops every subscription of `peer_id`.
    pub(crate) fn flush_matches(&mut self, peer_id: PeerId) {
        let Some(peer) = self.peers.get_mut(peer_id) else {
            return;
        };
        for id in peer.owned_matches.rule_ids() {
            self.detach_rule(peer_id, id, true);
        }
    }

    /// Moves every existing subscription of `peer_id` onto the monitor
    /// lists of its target registries, forcing `eavesdrop`.
    pub(crate) fn relink_matches_as_monitor(&mut self, peer_id: PeerId) {
        let Some(peer) = self.peers.get_mut(peer_id) else {
            return;
        };
        for id in peer.owned_matches.rule_ids() {
            self.detach_rule(peer_id, id, false);
            if let Some(peer) = self.peers.get_mut(peer_id) {
                if let Some(rule) = peer.owned_matches.get_mut(id) {
                    rule.keys.eavesdrop = true;
                }
            }
            self.link_match(peer_id, id, true);
        }
    }

    /// Installs a pre-charged replacement subscription set (monitor
    /// promotion with explicit rules). Past this point only fatal errors
    /// are possible; the peer stays internally consistent throughout.
    pub(crate) fn install_matches(&mut self, peer_id: PeerId, owner: MatchOwner) {
        self.flush_matches(peer_id);
        if let Some(peer) = self.peers.get_mut(peer_id) {
            peer.owned_matches = owner;
        }
    }

    /// Links a rule into the registry its sender key selects.
    pub(crate) fn link_match(&mut self, owner_id: PeerId, rule_id: RuleId, monitor: bool) {
        let Some(owner) = self.peers.get(owner_id) else {
            return;
        };
        let Some(rule) = owner.owned_matches.get(rule_id) else {
            return;
        };
        let sender_key = rule.keys.sender.clone();
        let list = if monitor {
            RuleList::Monitor
        } else if rule.keys.eavesdrop {
            RuleList::Eavesdrop
        } else {
            RuleList::Rules
        };
        let rule_ref = RuleRef {
            owner: owner_id,
            rule: rule_id,
        };

        let mut resolved_sender = None;
        let placement = match sender_key {
            None => {
                self.wildcard_matches.link(rule_ref, list);
                Some(RulePlacement::Wildcard)
            }
            Some(ref s) if s.as_str() == wire::DRIVER_NAME => {
                self.driver_matches.link(rule_ref, list);
                Some(RulePlacement::Driver)
            }
            Some(s) => match Address::parse(&s) {
                Address::Id(id) => {
                    if self.peers.find_registered(id).is_some() {
                        let sender = self.peers.get_mut(id).expect("just found");
                        sender.matches.link(rule_ref, list);
                        Some(RulePlacement::Peer(id))
                    } else if id.raw() >= self.peers.next_id() {
                        // Not allocated yet; the peer may appear later, so
                        // park the rule with the wildcards carrying a
                        // resolved sender filter. It stays there even if
                        // the peer shows up.
                        resolved_sender = Some(id);
                        self.wildcard_matches.link(rule_ref, list);
                        Some(RulePlacement::Wildcard)
                    } else {
                        // Below the high-water mark and gone: the id will
                        // never be allocated again, so the rule can never
                        // fire. It stays tracked in its owner only.
                        None
                    }
                }
                Address::Name(_) | Address::Other => {
                    // Sender is (shaped like) a well-known name; the name
                    // entry is pinned until the rule is dropped. Invalid
                    // names are not rejected here, they simply never fire.
                    let entry = self.names.pin(&s);
                    entry.matches.link(rule_ref, list);
                    Some(RulePlacement::Name(s))
                }
            },
        };

        if let Some(peer) = self.peers.get_mut(owner_id) {
            if let Some(rule) = peer.owned_matches.get_mut(rule_id) {
                if resolved_sender.is_some() {
                    rule.sender_id = resolved_sender;
                }
                rule.placement = placement;
                rule.list = list;
            }
        }
    }

    /// Unlinks a rule from its registry; with `drop_rule` it is removed
    /// from its owner too, refunding its charges.
    fn detach_rule(&mut self, owner_id: PeerId, rule_id: RuleId, drop_rule: bool) {
        let Some(peer) = self.peers.get_mut(owner_id) else {
            return;
        };
        let (placement, list) = match peer.owned_matches.get_mut(rule_id) {
            Some(rule) => (rule.placement.take(), rule.list),
            None => return,
        };
        let rule_ref = RuleRef {
            owner: owner_id,
            rule: rule_id,
        };
        match placement {
            None => {}
            Some(RulePlacement::Wildcard) => self.wildcard_matches.unlink(rule_ref, list),
            Some(RulePlacement::Driver) => self.driver_matches.unlink(rule_ref, list),
            Some(RulePlacement::Peer(id)) => {
                if let Some(target) = self.peers.get_mut(id) {
                    target.matches.unlink(rule_ref, list);
                }
            }
            Some(RulePlacement::Name(name)) => {
                if let Some(entry) = self.names.get_mut(&name) {
                    entry.matches.unlink(rule_ref, list);
                }
                self.names.unpin(&name);
            }
        }
        if drop_rule {
            if let Some(peer) = self.peers.get_mut(owner_id) {
                drop(peer.owned_matches.take(rule_id));
            }
        }
    }
}
