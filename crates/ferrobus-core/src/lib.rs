//! Routing, subscription, and resource-accounting engine of ferrobus.
//!
//! This crate is the broker core: everything between "a parsed message
//! arrived from an authenticated peer" and "messages are sitting in the
//! right outboxes". The wire codec, the SASL handshake, and the socket
//! readiness layer live behind the [`Connection`] seam; the
//! `ferrobus-broker` binary supplies the real transport and feeds
//! [`BusEvent`]s into the [`Engine`].
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                          Engine                              │
//! │   BusEvent mpsc ──► single-threaded dispatch loop            │
//! │                                                              │
//! │  ┌────────────────────────────────────────────────────────┐  │
//! │  │                         Bus                            │  │
//! │  │  PeerRegistry   NameRegistry   UserRegistry            │  │
//! │  │  wildcard/driver MatchRegistry   txid allocator        │  │
//! │  └────────────────────────────────────────────────────────┘  │
//! │        │ two-phase dispatch (read|hup, then write)           │
//! │        ▼                                                     │
//! │   Peer ──► driver (org.freedesktop.DBus) or router           │
//! │        ──► policy check ──► receiver outbox (Connection)     │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Ownership model
//!
//! The cyclic object graph of the domain (peers own names, names carry
//! match registries, match rules point back at their owners) is expressed
//! as ids and handles resolved through the [`Bus`], never as owning
//! pointers: registries store [`RuleRef`]s, rules record their placement,
//! and a rule whose sender is a well-known name holds an explicit pin on
//! the [`NameRegistry`] entry that is released when the rule is dropped.
//!
//! Every quota-consuming object holds a [`UserCharge`] acquired *before*
//! the object is linked anywhere and released only after it is unlinked,
//! so an aborted creation path never leaves usage behind.

mod bus;
mod connection;
mod dispatch;
mod driver;
mod error;
mod matches;
mod names;
mod peer;
mod reply;
mod router;
pub mod testing;
mod user;

pub use bus::{Bus, PeerRegistry};
pub use connection::{Connection, EventSet, OutboundQueue};
pub use dispatch::{BusEvent, Engine, EventSender};
pub use error::{
    ConnectionError, DriverError, MatchError, NameError, PeerError, ReplyError, UserError,
};
pub use matches::{
    MatchFilter, MatchOwner, MatchRegistry, MatchRule, MatchRuleKeys, RuleId, RuleList, RuleRef,
};
pub use names::{Name, NameChange, NameFlags, NameRegistry, RequestReply};
pub use peer::{Peer, PeerCreds};
pub use reply::{ReplyOwner, ReplyRegistry, ReplySlot};
pub use user::{User, UserCharge, UserLimits, UserRegistry, UserSlot};
