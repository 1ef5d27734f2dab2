//! Core types for the ferrobus message broker.
//!
//! This crate is the leaf of the workspace: identifier and address types
//! shared by every other crate, plus the [`ErrorCode`] trait that gives all
//! ferrobus errors a uniform machine-readable surface.
//!
//! # Crate Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │  ferrobus-types   : PeerId, Address, ErrorCode  ◄── HERE │
//! │  ferrobus-message : Message, wire constants              │
//! │  ferrobus-policy  : rulesets, peer snapshots             │
//! │  ferrobus-core    : registries, router, dispatch loop    │
//! │  ferrobus-broker  : ferrobusd binary                     │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! # Addressing
//!
//! A connected peer is identified on the wire by its *unique name*
//! (`:1.N`, where `N` is the broker-assigned [`PeerId`]) and optionally by
//! any number of *well-known names* it has acquired. [`Address`] classifies
//! a destination or sender string into one of those shapes:
//!
//! ```
//! use ferrobus_types::{Address, PeerId};
//!
//! assert_eq!(Address::parse(":1.7"), Address::Id(PeerId::new(7)));
//! assert_eq!(Address::parse("com.example.Widget"), Address::Name("com.example.Widget".into()));
//! ```

mod address;
mod error;

pub use address::{Address, PeerId};
pub use error::{assert_error_code, assert_error_codes, ErrorCode};
