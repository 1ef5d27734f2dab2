//! Outstanding method-call tracking.
//!
//! When a call expecting a reply is routed to a peer, a slot is recorded in
//! the *callee's* [`ReplyRegistry`], keyed by (caller, serial) — those are
//! the replies the callee will send out. The caller's [`ReplyOwner`] holds
//! the (callee, serial) back-references so both disconnect directions can
//! clean up: a dying callee owes synthesized errors to its callers, a dying
//! caller silently retracts what it was waiting for.

use crate::error::ReplyError;
use crate::user::{User, UserCharge, UserSlot};
use ferrobus_types::PeerId;
use std::collections::{BTreeSet, HashMap};

/// One reply owed to `caller` for `serial`.
#[derive(Debug)]
pub struct ReplySlot {
    pub caller: PeerId,
    pub serial: u32,
    _charge: UserCharge,
}

/// Replies a peer owes, keyed by (caller, serial).
#[derive(Debug, Default)]
pub struct ReplyRegistry {
    slots: HashMap<(PeerId, u32), ReplySlot>,
}

impl ReplyRegistry {
    /// Records an outstanding call from `caller`.
    ///
    /// The REPLIES charge is taken on the caller's user: the caller is the
    /// actor filling the callee's reply table. Serial reuse while a reply
    /// is outstanding is a protocol error surfaced as [`ReplyError::Exists`].
    pub fn insert(
        &mut self,
        caller: PeerId,
        caller_user: &User,
        serial: u32,
    ) -> Result<(), ReplyError> {
        if self.slots.contains_key(&(caller, serial)) {
            return Err(ReplyError::Exists);
        }
        let charge = caller_user.charge(UserSlot::Replies, 1)?;
        self.slots.insert(
            (caller, serial),
            ReplySlot {
                caller,
                serial,
                _charge: charge,
            },
        );
        Ok(())
    }

    /// Takes the slot for (caller, serial), refunding its charge on drop.
    pub fn remove(&mut self, caller: PeerId, serial: u32) -> Option<ReplySlot> {
        self.slots.remove(&(caller, serial))
    }

    /// Drains every slot, for the callee's disconnect cascade.
    pub fn drain(&mut self) -> Vec<ReplySlot> {
        self.slots.drain().map(|(_, slot)| slot).collect()
    }

    /// Number of outstanding replies owed.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// True when nothing is owed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

/// Calls a peer is awaiting answers for: (callee, serial) pairs.
#[derive(Debug, Default)]
pub struct ReplyOwner {
    pending: BTreeSet<(PeerId, u32)>,
}

impl ReplyOwner {
    pub fn insert(&mut self, callee: PeerId, serial: u32) {
        self.pending.insert((callee, serial));
    }

    pub fn remove(&mut self, callee: PeerId, serial: u32) {
        self.pending.remove(&(callee, serial));
    }

    /// Drains every pending pair, for the caller's disconnect cascade.
    pub fn drain(&mut self) -> Vec<(PeerId, u32)> {
        std::mem::take(&mut self.pending).into_iter().collect()
    }

    /// True while an answer from `callee` for `serial` is awaited.
    #[must_use]
    pub fn contains(&self, callee: PeerId, serial: u32) -> bool {
        self.pending.contains(&(callee, serial))
    }

    /// True when nothing is awaited.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::user::{UserLimits, UserRegistry};

    #[test]
    fn duplicate_serial_is_rejected() {
        let users = UserRegistry::new(UserLimits::default());
        let user = users.user(1);
        let mut registry = ReplyRegistry::default();
        let caller = PeerId::new(2);

        registry.insert(caller, &user, 7).expect("first");
        assert_eq!(registry.insert(caller, &user, 7), Err(ReplyError::Exists));
        // A different caller may use the same serial.
        registry.insert(PeerId::new(3), &user, 7).expect("other caller");
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn remove_refunds_the_charge() {
        let users = UserRegistry::new(UserLimits::default());
        let user = users.user(1);
        let mut registry = ReplyRegistry::default();
        let caller = PeerId::new(2);

        registry.insert(caller, &user, 7).expect("insert");
        assert_eq!(user.usage(UserSlot::Replies), 1);
        let slot = registry.remove(caller, 7).expect("slot");
        assert_eq!(slot.caller, caller);
        assert_eq!(slot.serial, 7);
        drop(slot);
        assert_eq!(user.usage(UserSlot::Replies), 0);
        assert!(registry.remove(caller, 7).is_none());
    }

    #[test]
    fn quota_bounds_outstanding_calls() {
        let users = UserRegistry::new(UserLimits {
            max_replies: 1,
            ..UserLimits::default()
        });
        let user = users.user(1);
        let mut registry = ReplyRegistry::default();
        let caller = PeerId::new(2);

        registry.insert(caller, &user, 1).expect("first");
        assert_eq!(registry.insert(caller, &user, 2), Err(ReplyError::Quota));
    }

    #[test]
    fn owner_tracks_awaited_pairs() {
        let mut owner = ReplyOwner::default();
        let callee = PeerId::new(5);
        owner.insert(callee, 7);
        assert!(owner.contains(callee, 7));
        owner.remove(callee, 7);
        assert!(owner.is_empty());
    }
}
