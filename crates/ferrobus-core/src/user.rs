//! Per-user resource accounting.
//!
//! Every bounded resource on the bus is tracked in one of six slots per
//! uid. A successful [`User::charge`] hands back a [`UserCharge`] token;
//! the token is the *only* way usage comes back, either through
//! [`UserCharge::release`] or on drop. Callers acquire charges before
//! linking an object into any registry and let the charge go only after
//! unlinking, so aborted creation paths can simply drop what they hold.
//!
//! Charges are actor-attributed: when peer A causes consumption on peer
//! B's behalf (queueing into B's outbox), the charge is taken on A's
//! `User`, so a flood by A exhausts A's budget, not B's.

use crate::error::UserError;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Weak};

/// The bounded resource kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserSlot {
    Bytes,
    Fds,
    Matches,
    Objects,
    Names,
    Replies,
}

const N_SLOTS: usize = 6;

impl UserSlot {
    fn index(self) -> usize {
        match self {
            Self::Bytes => 0,
            Self::Fds => 1,
            Self::Matches => 2,
            Self::Objects => 3,
            Self::Names => 4,
            Self::Replies => 5,
        }
    }
}

/// Configured per-uid limits, one per slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserLimits {
    pub max_bytes: u64,
    pub max_fds: u64,
    pub max_matches: u64,
    pub max_objects: u64,
    pub max_names: u64,
    pub max_replies: u64,
}

impl Default for UserLimits {
    fn default() -> Self {
        Self {
            max_bytes: 16 * 1024 * 1024,
            max_fds: 64,
            max_matches: 10_000,
            max_objects: 1_024,
            max_names: 256,
            max_replies: 8_192,
        }
    }
}

impl UserLimits {
    fn limit(&self, slot: UserSlot) -> u64 {
        match slot {
            UserSlot::Bytes => self.max_bytes,
            UserSlot::Fds => self.max_fds,
            UserSlot::Matches => self.max_matches,
            UserSlot::Objects => self.max_objects,
            UserSlot::Names => self.max_names,
            UserSlot::Replies => self.max_replies,
        }
    }
}

#[derive(Debug)]
struct UserEntry {
    uid: u32,
    limits: UserLimits,
    usage: Mutex<[u64; N_SLOTS]>,
}

/// Shared accounting record of one uid.
#[derive(Debug, Clone)]
pub struct User(Arc<UserEntry>);

impl User {
    /// The uid this record accounts for.
    #[must_use]
    pub fn uid(&self) -> u32 {
        self.0.uid
    }

    /// Reserves `amount` units of `slot`.
    ///
    /// All-or-nothing: on `Err` no usage changes. The returned token
    /// refunds the reservation when released or dropped.
    pub fn charge(&self, slot: UserSlot, amount: u64) -> Result<UserCharge, UserError> {
        let mut usage = self.0.usage.lock();
        let idx = slot.index();
        let next = usage[idx].saturating_add(amount);
        if next > self.0.limits.limit(slot) {
            return Err(UserError::Quota { slot });
        }
        usage[idx] = next;
        drop(usage);
        Ok(UserCharge {
            entry: Some(Arc::clone(&self.0)),
            slot,
            amount,
        })
    }

    /// Current usage of `slot`.
    #[must_use]
    pub fn usage(&self, slot: UserSlot) -> u64 {
        self.0.usage.lock()[slot.index()]
    }

    fn same_entry(&self, other: &User) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

/// A held reservation against one user slot.
///
/// Move-only; refunds exactly once, on [`release`](Self::release) or drop.
#[derive(Debug)]
pub struct UserCharge {
    entry: Option<Arc<UserEntry>>,
    slot: UserSlot,
    amount: u64,
}

impl UserCharge {
    /// Refunds the reservation now.
    pub fn release(mut self) {
        self.refund();
    }

    /// The reserved amount.
    #[must_use]
    pub fn amount(&self) -> u64 {
        self.amount
    }

    fn refund(&mut self) {
        if let Some(entry) = self.entry.take() {
            let mut usage = entry.usage.lock();
            let idx = self.slot.index();
            usage[idx] = usage[idx].saturating_sub(self.amount);
        }
    }
}

impl Drop for UserCharge {
    fn drop(&mut self) {
        self.refund();
    }
}

/// Registry of all live per-uid accounting records.
///
/// Records are shared by weak reference; a uid whose last peer and last
/// charge are gone costs nothing.
#[derive(Debug)]
pub struct UserRegistry {
    limits: UserLimits,
    users: Mutex<HashMap<u32, Weak<UserEntry>>>,
}

impl UserRegistry {
    /// Creates a registry handing every uid the same limits.
    #[must_use]
    pub fn new(limits: UserLimits) -> Self {
        Self {
            limits,
            users: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the shared record for `uid`, creating it on first use.
    #[must_use]
    pub fn user(&self, uid: u32) -> User {
        let mut users = self.users.lock();
        if let Some(existing) = users.get(&uid).and_then(Weak::upgrade) {
            return User(existing);
        }
        let entry = Arc::new(UserEntry {
            uid,
            limits: self.limits,
            usage: Mutex::new([0; N_SLOTS]),
        });
        users.retain(|_, weak| weak.strong_count() > 0);
        users.insert(uid, Arc::downgrade(&entry));
        User(entry)
    }

    /// The limits applied to every uid.
    #[must_use]
    pub fn limits(&self) -> UserLimits {
        self.limits
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny_limits() -> UserLimits {
        UserLimits {
            max_bytes: 100,
            max_fds: 2,
            max_matches: 3,
            max_objects: 2,
            max_names: 2,
            max_replies: 2,
        }
    }

    #[test]
    fn same_uid_shares_usage() {
        let registry = UserRegistry::new(tiny_limits());
        let a = registry.user(1000);
        let b = registry.user(1000);
        assert!(a.same_entry(&b));

        let charge = a.charge(UserSlot::Names, 1).expect("charge");
        assert_eq!(b.usage(UserSlot::Names), 1);
        charge.release();
        assert_eq!(b.usage(UserSlot::Names), 0);
    }

    #[test]
    fn quota_is_all_or_nothing() {
        let registry = UserRegistry::new(tiny_limits());
        let user = registry.user(1);
        let _held = user.charge(UserSlot::Bytes, 90).expect("charge");
        let err = user.charge(UserSlot::Bytes, 11).unwrap_err();
        assert_eq!(err, UserError::Quota { slot: UserSlot::Bytes });
        assert_eq!(user.usage(UserSlot::Bytes), 90);
    }

    #[test]
    fn drop_refunds_once() {
        let registry = UserRegistry::new(tiny_limits());
        let user = registry.user(1);
        {
            let _charge = user.charge(UserSlot::Matches, 2).expect("charge");
            assert_eq!(user.usage(UserSlot::Matches), 2);
        }
        assert_eq!(user.usage(UserSlot::Matches), 0);
    }

    #[test]
    fn slots_are_independent() {
        let registry = UserRegistry::new(tiny_limits());
        let user = registry.user(1);
        let _names = user.charge(UserSlot::Names, 2).expect("names");
        assert!(user.charge(UserSlot::Names, 1).is_err());
        assert!(user.charge(UserSlot::Replies, 1).is_ok());
    }

    #[test]
    fn record_is_dropped_with_last_holder() {
        let registry = UserRegistry::new(tiny_limits());
        {
            let user = registry.user(7);
            let _c = user.charge(UserSlot::Objects, 2).expect("charge");
            // Same record while alive, limits still enforced.
            assert!(registry.user(7).charge(UserSlot::Objects, 1).is_err());
        }
        // The previous record died with its last holder; usage restarts.
        let fresh = registry.user(7);
        assert_eq!(fresh.usage(UserSlot::Objects), 0);
        assert!(fresh.charge(UserSlot::Objects, 2).is_ok());
    }
}
