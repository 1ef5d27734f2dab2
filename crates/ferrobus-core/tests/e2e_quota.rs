//! End-to-end quota enforcement: exhausted limits surface as
//! `LimitsExceeded` and leave no partial state behind.

mod common;

use common::{add_match, request_name};
use ferrobus_core::testing::TestBus;
use ferrobus_core::{UserLimits, UserSlot};
use ferrobus_message::{wire, MessageKind};

fn limits(max_matches: u64, max_names: u64) -> UserLimits {
    UserLimits {
        max_matches,
        max_names,
        ..UserLimits::default()
    }
}

#[test]
fn fourth_match_rule_is_rejected_without_partial_state() {
    let mut bus = TestBus::with_limits(limits(3, 256));
    let a = bus.connect_and_hello(1000);

    for (serial, rule) in [(2, "member=A"), (3, "member=B"), (4, "member=C")] {
        let reply = bus.roundtrip(&a, add_match(serial, rule));
        assert_eq!(reply.kind, MessageKind::MethodReturn, "{rule}");
    }

    let reply = bus.roundtrip(&a, add_match(5, "member=D"));
    assert_eq!(reply.kind, MessageKind::Error);
    assert_eq!(reply.error_name.as_deref(), Some(wire::ERR_LIMITS_EXCEEDED));

    let peer = bus.bus.peers.get(a.id).expect("a");
    assert_eq!(peer.owned_matches.len(), 3);
    assert_eq!(peer.user.usage(UserSlot::Matches), 3);
}

#[test]
fn removing_a_rule_makes_room_again() {
    let mut bus = TestBus::with_limits(limits(1, 256));
    let a = bus.connect_and_hello(1000);

    bus.roundtrip(&a, add_match(2, "member=A"));
    let reply = bus.roundtrip(&a, add_match(3, "member=B"));
    assert_eq!(reply.error_name.as_deref(), Some(wire::ERR_LIMITS_EXCEEDED));

    let reply = bus.roundtrip(
        &a,
        ferrobus_core::testing::driver_call(
            4,
            "RemoveMatch",
            vec![ferrobus_message::Arg::Str("member=A".into())],
        ),
    );
    assert_eq!(reply.kind, MessageKind::MethodReturn);
    let reply = bus.roundtrip(&a, add_match(5, "member=B"));
    assert_eq!(reply.kind, MessageKind::MethodReturn);
}

#[test]
fn name_quota_is_independent_and_enforced() {
    let mut bus = TestBus::with_limits(limits(256, 1));
    let a = bus.connect_and_hello(1000);

    let reply = bus.roundtrip(&a, request_name(2, "com.one", 0));
    assert_eq!(reply.arg_u32(0), Some(wire::REQUEST_NAME_REPLY_PRIMARY_OWNER));

    let reply = bus.roundtrip(&a, request_name(3, "com.two", 0));
    assert_eq!(reply.kind, MessageKind::Error);
    assert_eq!(reply.error_name.as_deref(), Some(wire::ERR_LIMITS_EXCEEDED));

    // Match quota is untouched.
    let reply = bus.roundtrip(&a, add_match(4, "member=A"));
    assert_eq!(reply.kind, MessageKind::MethodReturn);
}

#[test]
fn quota_is_per_user_not_per_peer() {
    let mut bus = TestBus::with_limits(limits(2, 256));
    let a = bus.connect_and_hello(1000);
    let b = bus.connect_and_hello(1000); // same uid
    let c = bus.connect_and_hello(2000);

    bus.roundtrip(&a, add_match(2, "member=A"));
    bus.roundtrip(&b, add_match(2, "member=B"));

    // The shared uid is exhausted across both connections.
    let reply = bus.roundtrip(&a, add_match(3, "member=C"));
    assert_eq!(reply.error_name.as_deref(), Some(wire::ERR_LIMITS_EXCEEDED));

    // A different uid has its own budget.
    let reply = bus.roundtrip(&c, add_match(2, "member=C"));
    assert_eq!(reply.kind, MessageKind::MethodReturn);
}

#[test]
fn disconnect_refunds_every_slot() {
    let mut bus = TestBus::with_limits(limits(4, 4));
    let a = bus.connect_and_hello(1000);
    let user = bus.bus.users.user(1000);

    bus.roundtrip(&a, add_match(2, "member=A"));
    bus.roundtrip(&a, request_name(3, "com.one", 0));
    assert_eq!(user.usage(UserSlot::Matches), 1);
    assert_eq!(user.usage(UserSlot::Names), 1);

    bus.hangup(&a);
    assert_eq!(user.usage(UserSlot::Matches), 0);
    assert_eq!(user.usage(UserSlot::Names), 0);
    assert_eq!(user.usage(UserSlot::Objects), 0);
    assert_eq!(user.usage(UserSlot::Fds), 0);
    assert_eq!(user.usage(UserSlot::Bytes), 0);
}
