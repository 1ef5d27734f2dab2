//! Shared builders for the end-to-end bus tests.

#![allow(dead_code)]

use ferrobus_message::{wire, Arg, Message, MessageKind};

/// A method call between peers.
pub fn call_to(serial: u32, destination: &str, member: &str) -> Message {
    Message::method_call(serial, destination, "/com/test", "com.test.Iface", member)
}

/// A broadcast signal.
pub fn broadcast_signal(serial: u32, member: &str) -> Message {
    Message::signal(serial, "/com/test", "com.test.Iface", member)
}

/// A method return answering `reply_serial`.
pub fn reply_to(serial: u32, reply_serial: u32, destination: &str) -> Message {
    Message::method_return(serial, reply_serial, destination)
}

/// A `RequestName` driver call with raw flag bits.
pub fn request_name(serial: u32, name: &str, flags: u32) -> Message {
    ferrobus_core::testing::driver_call(
        serial,
        "RequestName",
        vec![Arg::Str(name.into()), Arg::U32(flags)],
    )
}

/// An `AddMatch` driver call.
pub fn add_match(serial: u32, rule: &str) -> Message {
    ferrobus_core::testing::driver_call(serial, "AddMatch", vec![Arg::Str(rule.into())])
}

/// A `BecomeMonitor` call on the monitoring interface.
pub fn become_monitor(serial: u32, rules: Vec<String>) -> Message {
    Message::method_call(
        serial,
        wire::DRIVER_NAME,
        wire::DRIVER_PATH,
        wire::INTERFACE_MONITORING,
        "BecomeMonitor",
    )
    .with_args(vec![Arg::StrList(rules), Arg::U32(0)])
}

/// Filters `messages` down to signals named `member`.
pub fn signals_named(messages: &[Message], member: &str) -> Vec<Message> {
    messages
        .iter()
        .filter(|m| m.kind == MessageKind::Signal && m.member.as_deref() == Some(member))
        .cloned()
        .collect()
}

/// The string args of a message.
pub fn str_args(message: &Message) -> Vec<&str> {
    message.args.iter().filter_map(Arg::as_str).collect()
}
