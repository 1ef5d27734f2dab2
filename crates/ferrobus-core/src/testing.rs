//! Testing harnesses for the broker core.
//!
//! Provides an in-memory [`Connection`] and a [`TestBus`] wrapper so unit
//! and end-to-end tests can drive the whole routing engine without
//! sockets, codecs, or an event loop. Deterministic and synchronous: a
//! call to [`TestBus::deliver`] runs the full two-phase dispatch for the
//! pushed message before returning.
//!
//! # Example
//!
//! ```
//! use ferrobus_core::testing::{driver_call, TestBus};
//! use ferrobus_message::MessageKind;
//!
//! let mut bus = TestBus::new();
//! let peer = bus.connect_and_hello(1000);
//! let reply = bus.roundtrip(&peer, driver_call(5, "ListNames", vec![]));
//! assert_eq!(reply.kind, MessageKind::MethodReturn);
//! ```

use crate::bus::Bus;
use crate::connection::{Connection, EventSet, OutboundQueue};
use crate::dispatch::BusEvent;
use crate::error::ConnectionError;
use crate::peer::PeerCreds;
use crate::user::{User, UserLimits};
use ferrobus_message::{wire, Arg, Message, MessageKind};
use ferrobus_policy::PolicyRegistry;
use ferrobus_types::PeerId;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

#[derive(Clone, Copy, PartialEq, Eq)]
enum MemoryState {
    Running,
    ShutDown,
    Closed,
}

struct MemoryShared {
    inbound: VecDeque<Message>,
    eof: bool,
    outbound: OutboundQueue,
    flushed: Vec<Message>,
    state: MemoryState,
}

impl MemoryShared {
    fn flush(&mut self) {
        while let Some(message) = self.outbound.pop() {
            self.flushed.push(message);
        }
    }
}

/// In-memory transport for tests.
pub struct MemoryConnection {
    shared: Arc<Mutex<MemoryShared>>,
}

/// Test-side handle onto a [`MemoryConnection`].
#[derive(Clone)]
pub struct MemoryHandle {
    shared: Arc<Mutex<MemoryShared>>,
}

/// Creates a connected in-memory transport and its inspection handle.
///
/// `max_queued_bytes` bounds uncharged (broadcast/reply) output, standing
/// in for the receiver-side outbox bound of a real transport.
#[must_use]
pub fn memory_pair(max_queued_bytes: u64) -> (MemoryConnection, MemoryHandle) {
    let shared = Arc::new(Mutex::new(MemoryShared {
        inbound: VecDeque::new(),
        eof: false,
        outbound: OutboundQueue::new(max_queued_bytes),
        flushed: Vec::new(),
        state: MemoryState::Running,
    }));
    (
        MemoryConnection {
            shared: Arc::clone(&shared),
        },
        MemoryHandle { shared },
    )
}

impl Connection for MemoryConnection {
    fn dispatch(&mut self, events: EventSet) -> Result<(), ConnectionError> {
        let mut shared = self.shared.lock();
        if events.intersects(EventSet::WRITABLE) {
            shared.flush();
            if shared.state == MemoryState::ShutDown && shared.outbound.is_empty() {
                shared.state = MemoryState::Closed;
            }
        }
        Ok(())
    }

    fn dequeue(&mut self) -> Result<Option<Message>, ConnectionError> {
        let mut shared = self.shared.lock();
        if shared.state != MemoryState::Running {
            return Ok(None);
        }
        match shared.inbound.pop_front() {
            Some(message) => Ok(Some(message)),
            None if shared.eof => Err(ConnectionError::Eof),
            None => Ok(None),
        }
    }

    fn queue(
        &mut self,
        charge_user: Option<&User>,
        txid: u64,
        message: Message,
    ) -> Result<(), ConnectionError> {
        let mut shared = self.shared.lock();
        if shared.state == MemoryState::Closed {
            // Late traffic to a dying peer is discarded, not an error.
            return Ok(());
        }
        shared.outbound.queue(charge_user, txid, message)
    }

    fn interest(&self) -> EventSet {
        let shared = self.shared.lock();
        match shared.state {
            MemoryState::Closed => EventSet::EMPTY,
            MemoryState::ShutDown => EventSet::WRITABLE,
            MemoryState::Running => {
                if shared.outbound.is_empty() {
                    EventSet::READABLE | EventSet::HANGUP
                } else {
                    EventSet::READABLE | EventSet::HANGUP | EventSet::WRITABLE
                }
            }
        }
    }

    fn shutdown(&mut self) {
        let mut shared = self.shared.lock();
        if shared.state == MemoryState::Running {
            shared.state = MemoryState::ShutDown;
        }
        // Flush whatever is pending; tests have no write phase after this.
        shared.flush();
        shared.state = MemoryState::Closed;
    }

    fn close(&mut self) {
        let mut shared = self.shared.lock();
        shared.outbound.clear();
        shared.state = MemoryState::Closed;
    }

    fn is_running(&self) -> bool {
        self.shared.lock().state != MemoryState::Closed
    }
}

impl MemoryHandle {
    /// Pushes an inbound message, as if parsed off the wire.
    pub fn push(&self, message: Message) {
        self.shared.lock().inbound.push_back(message);
    }

    /// Marks the orderly end of the inbound stream.
    pub fn push_eof(&self) {
        self.shared.lock().eof = true;
    }

    /// Takes everything the peer has been sent so far, flushing the
    /// outbox first (receivers of broadcasts see no write phase).
    pub fn take_sent(&self) -> Vec<Message> {
        let mut shared = self.shared.lock();
        shared.flush();
        std::mem::take(&mut shared.flushed)
    }

    /// Puts drained messages back, ahead of anything sent since.
    fn restore(&self, mut messages: Vec<Message>) {
        let mut shared = self.shared.lock();
        messages.append(&mut shared.flushed);
        shared.flushed = messages;
    }

    /// True until the transport is closed.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.shared.lock().state != MemoryState::Closed
    }
}

/// One connected test peer.
pub struct TestPeer {
    pub id: PeerId,
    pub handle: MemoryHandle,
}

impl TestPeer {
    /// The peer's wire identity.
    #[must_use]
    pub fn unique_name(&self) -> String {
        self.id.unique_name()
    }

    /// Everything sent to this peer since the last call.
    #[must_use]
    pub fn sent(&self) -> Vec<Message> {
        self.handle.take_sent()
    }
}

/// A method call addressed to the driver.
#[must_use]
pub fn driver_call(serial: u32, member: &str, args: Vec<Arg>) -> Message {
    Message::method_call(
        serial,
        wire::DRIVER_NAME,
        wire::DRIVER_PATH,
        wire::INTERFACE_DBUS,
        member,
    )
    .with_args(args)
}

/// A whole bus with in-memory peers, driven synchronously.
pub struct TestBus {
    pub bus: Bus,
    /// Outbox bound handed to each new memory connection.
    pub outbox_bytes: u64,
}

impl TestBus {
    /// A permissive bus with default limits.
    #[must_use]
    pub fn new() -> Self {
        Self::with_bus(Bus::new(PolicyRegistry::allow_all(), UserLimits::default(), 0))
    }

    /// A bus with specific per-user limits.
    #[must_use]
    pub fn with_limits(limits: UserLimits) -> Self {
        Self::with_bus(Bus::new(PolicyRegistry::allow_all(), limits, 0))
    }

    /// A bus with a specific policy registry.
    #[must_use]
    pub fn with_policy(policy: PolicyRegistry) -> Self {
        Self::with_bus(Bus::new(policy, UserLimits::default(), 0))
    }

    /// Wraps an already configured bus.
    #[must_use]
    pub fn with_bus(bus: Bus) -> Self {
        Self {
            bus,
            outbox_bytes: u64::MAX,
        }
    }

    /// Connects a new peer with the given uid.
    ///
    /// # Panics
    ///
    /// Panics when admission fails; tests expecting refusal go through
    /// [`Bus::add_peer`] directly.
    pub fn connect(&mut self, uid: u32) -> TestPeer {
        self.connect_with_creds(PeerCreds {
            uid,
            gid: uid,
            pid: 4242,
            gids: vec![uid],
            seclabel: None,
        })
    }

    /// Connects a new peer with full credentials.
    pub fn connect_with_creds(&mut self, creds: PeerCreds) -> TestPeer {
        let (connection, handle) = memory_pair(self.outbox_bytes);
        let id = self
            .bus
            .add_peer(Box::new(connection), creds)
            .expect("test peer admitted");
        TestPeer { id, handle }
    }

    /// Connects and completes the `Hello` handshake, discarding the
    /// handshake traffic.
    pub fn connect_and_hello(&mut self, uid: u32) -> TestPeer {
        let peer = self.connect(uid);
        self.deliver(&peer, driver_call(1, "Hello", vec![]));
        let _ = peer.sent();
        peer
    }

    /// Delivers one message from `peer` and runs a full two-phase
    /// dispatch wake-up for it.
    pub fn deliver(&mut self, peer: &TestPeer, message: Message) {
        peer.handle.push(message);
        self.bus
            .dispatch_peer(peer.id, EventSet::READABLE | EventSet::WRITABLE)
            .expect("dispatch");
    }

    /// Delivers a driver call and returns the driver's direct answer.
    /// Everything else sent to the peer (signals, routed traffic) stays
    /// available through [`TestPeer::sent`].
    ///
    /// # Panics
    ///
    /// Panics when the driver sent nothing back.
    pub fn roundtrip(&mut self, peer: &TestPeer, message: Message) -> Message {
        let serial = message.serial;
        self.deliver(peer, message);
        let mut sent = peer.handle.take_sent();
        let position = sent
            .iter()
            .position(|m| {
                m.reply_serial == Some(serial)
                    && matches!(m.kind, MessageKind::MethodReturn | MessageKind::Error)
            })
            .expect("driver replied");
        let reply = sent.remove(position);
        peer.handle.restore(sent);
        reply
    }

    /// Signals the orderly end of `peer`'s stream and dispatches it.
    pub fn hangup(&mut self, peer: &TestPeer) {
        peer.handle.push_eof();
        self.bus
            .dispatch_peer(peer.id, EventSet::READABLE | EventSet::HANGUP)
            .expect("dispatch");
    }
}

impl Default for TestBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Builds the `BusEvent` feeding path for engine-level tests.
#[must_use]
pub fn accept_event(
    connection: MemoryConnection,
    creds: PeerCreds,
) -> (BusEvent, tokio::sync::oneshot::Receiver<Option<PeerId>>) {
    let (tx, rx) = tokio::sync::oneshot::channel();
    (
        BusEvent::Accept {
            connection: Box::new(connection),
            creds,
            admitted: tx,
        },
        rx,
    )
}
