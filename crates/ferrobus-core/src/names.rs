//! Well-known name ownership.
//!
//! Each name keeps its claimants in acquisition order; the queue head is
//! the primary owner and the destination for messages addressed to the
//! name. A name entry stays alive while it has claimants, while match
//! rules pin it, or while its match registry holds rules.

use crate::error::NameError;
use crate::matches::MatchRegistry;
use crate::user::{User, UserCharge, UserSlot};
use ferrobus_types::PeerId;
use std::collections::{HashMap, VecDeque};

/// RequestName flag set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NameFlags {
    pub allow_replacement: bool,
    pub replace_existing: bool,
    pub do_not_queue: bool,
}

impl NameFlags {
    /// Decodes the wire flag bits.
    #[must_use]
    pub fn from_bits(bits: u32) -> Self {
        Self {
            allow_replacement: bits & ferrobus_message::wire::NAME_FLAG_ALLOW_REPLACEMENT != 0,
            replace_existing: bits & ferrobus_message::wire::NAME_FLAG_REPLACE_EXISTING != 0,
            do_not_queue: bits & ferrobus_message::wire::NAME_FLAG_DO_NOT_QUEUE != 0,
        }
    }
}

/// One claim by one peer, queued on one name.
#[derive(Debug)]
struct NameOwnership {
    peer: PeerId,
    allow_replacement: bool,
    do_not_queue: bool,
    _charge: UserCharge,
}

/// One well-known name and its claimant queue.
#[derive(Debug, Default)]
pub struct Name {
    queue: VecDeque<NameOwnership>,
    /// Rules subscribed with this name as sender.
    pub matches: MatchRegistry,
    /// Match rules holding this entry alive.
    pins: usize,
}

impl Name {
    fn primary(&self) -> Option<PeerId> {
        self.queue.front().map(|o| o.peer)
    }

    fn position_of(&self, peer: PeerId) -> Option<usize> {
        self.queue.iter().position(|o| o.peer == peer)
    }

    fn removable(&self) -> bool {
        self.queue.is_empty() && self.pins == 0 && self.matches.is_empty()
    }
}

/// Primary-owner transition, consumed by the router to emit
/// `NameOwnerChanged` (and `NameAcquired`/`NameLost` to the peers moved).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameChange {
    pub name: String,
    pub old: Option<PeerId>,
    pub new: Option<PeerId>,
}

/// Outcome of a name request, in wire-reply terms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestReply {
    PrimaryOwner,
    InQueue,
    Exists,
    AlreadyOwner,
}

/// All well-known names of the bus.
#[derive(Debug, Default)]
pub struct NameRegistry {
    names: HashMap<String, Name>,
}

impl NameRegistry {
    /// Requests `name` for `peer`, applying the replacement flag matrix.
    ///
    /// Returns the wire reply and the primary transition, if any. Callers
    /// reject reserved and unique-shaped names before getting here.
    pub fn request(
        &mut self,
        peer: PeerId,
        user: &User,
        name: &str,
        flags: NameFlags,
    ) -> Result<(RequestReply, Option<NameChange>), NameError> {
        let entry = self.names.entry(name.to_owned()).or_default();

        if let Some(pos) = entry.position_of(peer) {
            // Re-request refreshes the stored flags.
            let ownership = &mut entry.queue[pos];
            ownership.allow_replacement = flags.allow_replacement;
            ownership.do_not_queue = flags.do_not_queue;
            let reply = if pos == 0 {
                RequestReply::AlreadyOwner
            } else {
                RequestReply::InQueue
            };
            return Ok((reply, None));
        }

        let charge = user.charge(UserSlot::Names, 1).map_err(|err| {
            self.drop_if_unused(name);
            NameError::from(err)
        })?;
        let ownership = NameOwnership {
            peer,
            allow_replacement: flags.allow_replacement,
            do_not_queue: flags.do_not_queue,
            _charge: charge,
        };
        let entry = self.names.get_mut(name).expect("entry created above");

        let Some(primary) = entry.primary() else {
            entry.queue.push_front(ownership);
            let change = NameChange {
                name: name.to_owned(),
                old: None,
                new: Some(peer),
            };
            return Ok((RequestReply::PrimaryOwner, Some(change)));
        };

        let replaceable = entry.queue.front().expect("primary exists").allow_replacement;
        if replaceable && flags.replace_existing {
            if entry.queue.front().expect("primary exists").do_not_queue {
                entry.queue.pop_front();
            }
            entry.queue.push_front(ownership);
            let change = NameChange {
                name: name.to_owned(),
                old: Some(primary),
                new: Some(peer),
            };
            Ok((RequestReply::PrimaryOwner, Some(change)))
        } else if flags.do_not_queue {
            // The ownership is dropped here, refunding its charge.
            self.drop_if_unused(name);
            Ok((RequestReply::Exists, None))
        } else {
            entry.queue.push_back(ownership);
            Ok((RequestReply::InQueue, None))
        }
    }

    /// Releases `peer`'s claim on `name`.
    ///
    /// Releasing the primary promotes the next queued claimant, chaining
    /// the transition into the returned change.
    pub fn release(&mut self, peer: PeerId, name: &str) -> Result<Option<NameChange>, NameError> {
        let entry = self.names.get_mut(name).ok_or(NameError::NotFound)?;
        let pos = entry.position_of(peer).ok_or(NameError::NotOwner)?;

        let _ = entry.queue.remove(pos);
        let change = (pos == 0).then(|| NameChange {
            name: name.to_owned(),
            old: Some(peer),
            new: entry.primary(),
        });
        self.drop_if_unused(name);
        Ok(change)
    }

    /// The current primary owner of `name`.
    #[must_use]
    pub fn primary_owner(&self, name: &str) -> Option<PeerId> {
        self.names.get(name).and_then(Name::primary)
    }

    /// Claimants of `name` in queue order.
    #[must_use]
    pub fn queued_owners(&self, name: &str) -> Option<Vec<PeerId>> {
        let entry = self.names.get(name)?;
        if entry.queue.is_empty() {
            return None;
        }
        Some(entry.queue.iter().map(|o| o.peer).collect())
    }

    /// Names currently having a primary owner.
    pub fn owned_names(&self) -> impl Iterator<Item = &str> {
        self.names
            .iter()
            .filter(|(_, entry)| !entry.queue.is_empty())
            .map(|(name, _)| name.as_str())
    }

    /// Pins the entry for `name` alive for a match rule, creating it when
    /// missing. The pin must be dropped with [`unpin`](Self::unpin).
    pub fn pin(&mut self, name: &str) -> &mut Name {
        let entry = self.names.entry(name.to_owned()).or_default();
        entry.pins += 1;
        entry
    }

    /// Releases a match-rule pin taken with [`pin`](Self::pin).
    pub fn unpin(&mut self, name: &str) {
        if let Some(entry) = self.names.get_mut(name) {
            debug_assert!(entry.pins > 0);
            entry.pins = entry.pins.saturating_sub(1);
            self.drop_if_unused(name);
        }
    }

    /// Mutable access to a name's entry (match registry linkage).
    pub fn get_mut(&mut self, name: &str) -> Option<&mut Name> {
        self.names.get_mut(name)
    }

    /// Shared access to a name's entry.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Name> {
        self.names.get(name)
    }

    /// Drops `name` when nothing references it anymore.
    pub fn drop_if_unused(&mut self, name: &str) {
        if self.names.get(name).is_some_and(Name::removable) {
            self.names.remove(name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::user::{UserLimits, UserRegistry};

    fn users() -> UserRegistry {
        UserRegistry::new(UserLimits::default())
    }

    const FREE: NameFlags = NameFlags {
        allow_replacement: false,
        replace_existing: false,
        do_not_queue: false,
    };

    #[test]
    fn first_requester_becomes_primary() {
        let registry_users = users();
        let user = registry_users.user(1);
        let mut names = NameRegistry::default();
        let a = PeerId::new(0);

        let (reply, change) = names.request(a, &user, "com.x", FREE).expect("request");
        assert_eq!(reply, RequestReply::PrimaryOwner);
        assert_eq!(
            change,
            Some(NameChange {
                name: "com.x".into(),
                old: None,
                new: Some(a),
            })
        );
        assert_eq!(names.primary_owner("com.x"), Some(a));
        assert_eq!(user.usage(UserSlot::Names), 1);
    }

    #[test]
    fn second_requester_queues() {
        let registry_users = users();
        let user = registry_users.user(1);
        let mut names = NameRegistry::default();
        let (a, b) = (PeerId::new(0), PeerId::new(1));

        names.request(a, &user, "com.x", FREE).expect("a");
        let (reply, change) = names.request(b, &user, "com.x", FREE).expect("b");
        assert_eq!(reply, RequestReply::InQueue);
        assert_eq!(change, None);
        assert_eq!(names.queued_owners("com.x"), Some(vec![a, b]));
    }

    #[test]
    fn replacement_demotes_primary() {
        let registry_users = users();
        let user = registry_users.user(1);
        let mut names = NameRegistry::default();
        let (a, b) = (PeerId::new(0), PeerId::new(1));

        let allow = NameFlags {
            allow_replacement: true,
            ..FREE
        };
        let replace = NameFlags {
            replace_existing: true,
            ..FREE
        };
        names.request(a, &user, "com.x", allow).expect("a");
        let (reply, change) = names.request(b, &user, "com.x", replace).expect("b");
        assert_eq!(reply, RequestReply::PrimaryOwner);
        assert_eq!(change.expect("transition").old, Some(a));
        assert_eq!(names.queued_owners("com.x"), Some(vec![b, a]));
    }

    #[test]
    fn replacement_removes_do_not_queue_primary() {
        let registry_users = users();
        let user = registry_users.user(1);
        let mut names = NameRegistry::default();
        let (a, b) = (PeerId::new(0), PeerId::new(1));

        let allow_dnq = NameFlags {
            allow_replacement: true,
            do_not_queue: true,
            ..FREE
        };
        let replace = NameFlags {
            replace_existing: true,
            ..FREE
        };
        names.request(a, &user, "com.x", allow_dnq).expect("a");
        names.request(b, &user, "com.x", replace).expect("b");
        assert_eq!(names.queued_owners("com.x"), Some(vec![b]));
        // The removed ownership refunded its charge.
        assert_eq!(user.usage(UserSlot::Names), 1);
    }

    #[test]
    fn unreplaceable_primary_with_do_not_queue_yields_exists() {
        let registry_users = users();
        let user = registry_users.user(1);
        let mut names = NameRegistry::default();
        let (a, b) = (PeerId::new(0), PeerId::new(1));

        names.request(a, &user, "com.x", FREE).expect("a");
        let dnq = NameFlags {
            replace_existing: true,
            do_not_queue: true,
            ..FREE
        };
        let (reply, change) = names.request(b, &user, "com.x", dnq).expect("b");
        assert_eq!(reply, RequestReply::Exists);
        assert_eq!(change, None);
        assert_eq!(user.usage(UserSlot::Names), 1);
    }

    #[test]
    fn re_request_reports_current_position() {
        let registry_users = users();
        let user = registry_users.user(1);
        let mut names = NameRegistry::default();
        let (a, b) = (PeerId::new(0), PeerId::new(1));

        names.request(a, &user, "com.x", FREE).expect("a");
        names.request(b, &user, "com.x", FREE).expect("b");
        let (reply, _) = names.request(a, &user, "com.x", FREE).expect("a again");
        assert_eq!(reply, RequestReply::AlreadyOwner);
        let (reply, _) = names.request(b, &user, "com.x", FREE).expect("b again");
        assert_eq!(reply, RequestReply::InQueue);
        assert_eq!(user.usage(UserSlot::Names), 2);
    }

    #[test]
    fn release_promotes_next_in_queue() {
        let registry_users = users();
        let user = registry_users.user(1);
        let mut names = NameRegistry::default();
        let (a, b) = (PeerId::new(0), PeerId::new(1));

        names.request(a, &user, "com.x", FREE).expect("a");
        names.request(b, &user, "com.x", FREE).expect("b");

        let change = names.release(a, "com.x").expect("release").expect("change");
        assert_eq!(change.old, Some(a));
        assert_eq!(change.new, Some(b));
        assert_eq!(names.primary_owner("com.x"), Some(b));

        // Releasing a queued non-primary is silent.
        names.request(a, &user, "com.x", FREE).expect("a requeues");
        assert_eq!(names.release(a, "com.x").expect("release"), None);
    }

    #[test]
    fn release_restores_original_state() {
        let registry_users = users();
        let user = registry_users.user(1);
        let mut names = NameRegistry::default();
        let (a, b) = (PeerId::new(0), PeerId::new(1));

        names.request(a, &user, "com.x", FREE).expect("a");
        names.request(b, &user, "com.x", FREE).expect("b");
        names.release(b, "com.x").expect("b out");
        let change = names.release(a, "com.x").expect("a out").expect("change");
        assert_eq!(change.new, None);
        assert_eq!(names.primary_owner("com.x"), None);
        assert_eq!(user.usage(UserSlot::Names), 0);
    }

    #[test]
    fn release_errors() {
        let registry_users = users();
        let user = registry_users.user(1);
        let mut names = NameRegistry::default();
        let (a, b) = (PeerId::new(0), PeerId::new(1));

        assert_eq!(names.release(a, "com.x"), Err(NameError::NotFound));
        names.request(a, &user, "com.x", FREE).expect("a");
        assert_eq!(names.release(b, "com.x"), Err(NameError::NotOwner));
    }

    #[test]
    fn quota_limits_ownerships() {
        let registry_users = UserRegistry::new(UserLimits {
            max_names: 1,
            ..UserLimits::default()
        });
        let user = registry_users.user(1);
        let mut names = NameRegistry::default();
        let a = PeerId::new(0);

        names.request(a, &user, "com.x", FREE).expect("first");
        assert_eq!(names.request(a, &user, "com.y", FREE), Err(NameError::Quota));
        // The failed request left no entry behind.
        assert!(names.get("com.y").is_none());
    }

    #[test]
    fn pins_keep_entries_alive() {
        let registry_users = users();
        let user = registry_users.user(1);
        let mut names = NameRegistry::default();
        let a = PeerId::new(0);

        names.pin("com.x");
        assert!(names.get("com.x").is_some());

        names.request(a, &user, "com.x", FREE).expect("a");
        names.release(a, "com.x").expect("release");
        // Still pinned.
        assert!(names.get("com.x").is_some());
        names.unpin("com.x");
        assert!(names.get("com.x").is_none());
    }
}
