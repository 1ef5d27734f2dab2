//! Message model for the ferrobus broker.
//!
//! The broker core routes *already parsed* messages; the concrete wire codec
//! and the SASL handshake live behind the transport seam. This crate defines
//! the parsed form — [`Message`], its [`MessageKind`], header flags, and
//! typed body arguments — together with the protocol constants the driver
//! and router speak ([`wire`]).
//!
//! # Message Types
//!
//! | Kind | Direction | Reply | Use |
//! |------|-----------|-------|-----|
//! | [`MessageKind::MethodCall`] | peer → peer/driver | expected unless flagged | RPC |
//! | [`MessageKind::MethodReturn`] | callee → caller | no | RPC result |
//! | [`MessageKind::Error`] | callee → caller | no | RPC failure |
//! | [`MessageKind::Signal`] | peer/driver → subscribers | no | broadcast |
//!
//! # Usage
//!
//! ```
//! use ferrobus_message::{Arg, Message, wire};
//!
//! let call = Message::method_call(7, wire::DRIVER_NAME, wire::DRIVER_PATH,
//!                                 wire::INTERFACE_DBUS, "RequestName")
//!     .with_args(vec![Arg::Str("com.example.Svc".into()), Arg::U32(0)]);
//!
//! assert!(call.expects_reply());
//! assert_eq!(call.arg_str(0), Some("com.example.Svc"));
//! ```

mod message;
pub mod wire;

pub use message::{Arg, Message, MessageFlags, MessageKind};
