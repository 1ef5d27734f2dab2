//! The transport seam between the core and the socket/codec layer.
//!
//! The broker core never touches sockets. It drives a [`Connection`]
//! through the contract below; the binary crate implements it over a real
//! stream, the test harness over in-memory queues. The dispatcher calls
//! [`Connection::dispatch`] with the phase's events and then loops
//! [`Connection::dequeue`] until it yields nothing, because dequeue is the
//! sole forward-progress primitive of the seam.

use crate::error::ConnectionError;
use crate::user::{User, UserCharge, UserSlot};
use ferrobus_message::{Arg, Message};
use std::collections::VecDeque;
use std::ops::BitOr;

/// Readiness event mask.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EventSet(u8);

impl EventSet {
    pub const EMPTY: EventSet = EventSet(0);
    pub const READABLE: EventSet = EventSet(1);
    pub const WRITABLE: EventSet = EventSet(2);
    pub const HANGUP: EventSet = EventSet(4);

    /// True when any event of `other` is present.
    #[must_use]
    pub const fn intersects(self, other: EventSet) -> bool {
        self.0 & other.0 != 0
    }

    /// The events present in both sets.
    #[must_use]
    pub const fn intersection(self, other: EventSet) -> EventSet {
        EventSet(self.0 & other.0)
    }

    /// True when no event is present.
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for EventSet {
    type Output = EventSet;
    fn bitor(self, rhs: EventSet) -> EventSet {
        EventSet(self.0 | rhs.0)
    }
}

/// One authenticated peer transport.
///
/// Implementations own the socket, the codec, and the SASL state; the core
/// sees parsed [`Message`]s only.
pub trait Connection: Send {
    /// Feeds one phase of readiness events into the transport.
    fn dispatch(&mut self, events: EventSet) -> Result<(), ConnectionError>;

    /// Pops the next fully parsed inbound message.
    ///
    /// `Ok(None)` means no complete message is buffered;
    /// [`ConnectionError::Eof`] reports the orderly end of the stream.
    fn dequeue(&mut self) -> Result<Option<Message>, ConnectionError>;

    /// Queues an outbound message.
    ///
    /// With `charge_user` set, the message bytes are charged against that
    /// user (the sending actor). Without it, the implementation bounds the
    /// queue itself and reports [`ConnectionError::Quota`] on overflow.
    /// `txid` de-duplicates multicast delivery: a repeated non-zero txid is
    /// silently dropped.
    fn queue(
        &mut self,
        charge_user: Option<&User>,
        txid: u64,
        message: Message,
    ) -> Result<(), ConnectionError>;

    /// The events the transport currently cares about. Queried between
    /// dispatch phases because handling inbound traffic may register write
    /// interest.
    fn interest(&self) -> EventSet;

    /// Stops reading, flushes what is queued, then closes.
    fn shutdown(&mut self);

    /// Closes immediately, discarding queued output.
    fn close(&mut self);

    /// False once the transport is finished and the peer can be freed.
    fn is_running(&self) -> bool;
}

/// Rough in-memory footprint of a message, for byte accounting.
#[must_use]
pub fn message_size(message: &Message) -> u64 {
    let strings = [
        message.sender.as_deref(),
        message.destination.as_deref(),
        message.path.as_deref(),
        message.interface.as_deref(),
        message.member.as_deref(),
        message.error_name.as_deref(),
        message.signature.as_deref(),
    ]
    .into_iter()
    .flatten()
    .map(str::len)
    .sum::<usize>();
    let args = message
        .args
        .iter()
        .map(|arg| match arg {
            Arg::Str(s) | Arg::ObjectPath(s) => s.len(),
            Arg::U32(_) | Arg::Bool(_) => 4,
            Arg::StrList(v) => v.iter().map(|s| s.len() + 8).sum(),
            Arg::Map(v) => v.to_string().len(),
        })
        .sum::<usize>();
    (std::mem::size_of::<Message>() + strings + args) as u64
}

struct QueuedMessage {
    message: Message,
    size: u64,
    _charge: Option<UserCharge>,
}

/// Shared outbound queue logic: byte bounding, sender charging, and
/// per-transaction de-duplication.
pub struct OutboundQueue {
    entries: VecDeque<QueuedMessage>,
    last_txid: u64,
    queued_bytes: u64,
    max_bytes: u64,
}

impl OutboundQueue {
    /// Creates a queue bounded at `max_bytes` for uncharged traffic.
    #[must_use]
    pub fn new(max_bytes: u64) -> Self {
        Self {
            entries: VecDeque::new(),
            last_txid: 0,
            queued_bytes: 0,
            max_bytes,
        }
    }

    /// Queues a message; see [`Connection::queue`] for the contract.
    pub fn queue(
        &mut self,
        charge_user: Option<&User>,
        txid: u64,
        message: Message,
    ) -> Result<(), ConnectionError> {
        if txid != 0 && txid == self.last_txid {
            // Already delivered within this transaction.
            return Ok(());
        }
        let size = message_size(&message);
        let charge = match charge_user {
            Some(user) => Some(
                user.charge(UserSlot::Bytes, size)
                    .map_err(|_| ConnectionError::Quota)?,
            ),
            None => {
                if self.queued_bytes.saturating_add(size) > self.max_bytes {
                    return Err(ConnectionError::Quota);
                }
                None
            }
        };
        if txid != 0 {
            self.last_txid = txid;
        }
        self.queued_bytes += size;
        self.entries.push_back(QueuedMessage {
            message,
            size,
            _charge: charge,
        });
        Ok(())
    }

    /// Pops the next message for the wire, refunding its charge.
    pub fn pop(&mut self) -> Option<Message> {
        let entry = self.entries.pop_front()?;
        self.queued_bytes = self.queued_bytes.saturating_sub(entry.size);
        Some(entry.message)
    }

    /// Drops everything queued, refunding all charges.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.queued_bytes = 0;
    }

    /// Number of queued messages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::user::{UserLimits, UserRegistry};

    fn message() -> Message {
        Message::signal(1, "/", "com.x.I", "Ping")
    }

    #[test]
    fn repeated_txid_is_dropped() {
        let mut queue = OutboundQueue::new(u64::MAX);
        queue.queue(None, 9, message()).expect("first");
        queue.queue(None, 9, message()).expect("duplicate is a no-op");
        assert_eq!(queue.len(), 1);
        queue.queue(None, 10, message()).expect("next transaction");
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn unicast_does_not_disturb_txid_dedup() {
        let mut queue = OutboundQueue::new(u64::MAX);
        queue.queue(None, 9, message()).expect("broadcast");
        queue.queue(None, 0, message()).expect("unicast");
        queue.queue(None, 9, message()).expect("still duplicate");
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn uncharged_overflow_reports_quota() {
        let mut queue = OutboundQueue::new(1);
        assert_eq!(queue.queue(None, 0, message()), Err(ConnectionError::Quota));
        assert!(queue.is_empty());
    }

    #[test]
    fn charged_messages_bill_the_sender() {
        let users = UserRegistry::new(UserLimits::default());
        let sender = users.user(1);
        let mut queue = OutboundQueue::new(0); // bound irrelevant when charged

        queue.queue(Some(&sender), 0, message()).expect("queued");
        assert!(sender.usage(UserSlot::Bytes) > 0);
        let _ = queue.pop().expect("popped");
        assert_eq!(sender.usage(UserSlot::Bytes), 0);
    }

    #[test]
    fn charged_overflow_reports_quota() {
        let users = UserRegistry::new(UserLimits {
            max_bytes: 1,
            ..UserLimits::default()
        });
        let sender = users.user(1);
        let mut queue = OutboundQueue::new(u64::MAX);
        assert_eq!(
            queue.queue(Some(&sender), 0, message()),
            Err(ConnectionError::Quota)
        );
    }

    #[test]
    fn clear_refunds_charges() {
        let users = UserRegistry::new(UserLimits::default());
        let sender = users.user(1);
        let mut queue = OutboundQueue::new(u64::MAX);
        queue.queue(Some(&sender), 0, message()).expect("queued");
        queue.clear();
        assert_eq!(sender.usage(UserSlot::Bytes), 0);
        assert!(queue.is_empty());
    }
}
