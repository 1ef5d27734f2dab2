//! Access-control policy for the ferrobus broker.
//!
//! A [`PolicyRegistry`] holds the immutable ruleset loaded at startup.
//! Policy-file parsing lives outside the core; this crate consumes the
//! already-structured [`PolicyConfig`].
//!
//! There are four decision points:
//!
//! | Decision | Asked | Question |
//! |----------|-------|----------|
//! | connect  | at accept | may this uid/gid set connect at all? |
//! | own      | on `RequestName` | may the peer own this name? |
//! | send     | on every routed message | may the sender talk to these names? |
//! | receive  | on every routed message | may the receiver hear from these names? |
//!
//! `connect` is evaluated against the registry directly. The other three are
//! evaluated against a [`PeerPolicy`] — an immutable snapshot instantiated
//! when the peer connects, from its uid and auxiliary gids. Group membership
//! changes after connection time deliberately do not affect live peers.
//!
//! Rule resolution is last-match-wins over the configured rule list, with
//! the configured default action as the base.

mod error;
mod peer;
mod registry;

pub use error::PolicyError;
pub use peer::PeerPolicy;
pub use registry::{Action, ConnectRule, OwnRule, PolicyConfig, PolicyRegistry, TransferRule};
