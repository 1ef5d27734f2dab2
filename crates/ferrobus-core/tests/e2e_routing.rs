//! End-to-end routing: calls, replies, broadcast fan-out, eavesdrop, and
//! the disconnect cascade.

mod common;

use common::{add_match, broadcast_signal, call_to, reply_to, request_name};
use ferrobus_core::testing::TestBus;
use ferrobus_message::{wire, MessageKind};

#[test]
fn method_call_and_reply_round_trip() {
    let mut bus = TestBus::new();
    let a = bus.connect_and_hello(1);
    let b = bus.connect_and_hello(2);

    bus.deliver(&a, call_to(7, &b.unique_name(), "DoThing"));
    let inbox = b.sent();
    assert_eq!(inbox.len(), 1);
    assert_eq!(inbox[0].kind, MessageKind::MethodCall);
    assert_eq!(inbox[0].sender.as_deref(), Some(":1.0"));
    assert_eq!(inbox[0].serial, 7);

    // The slot is tracked on the callee until answered.
    assert_eq!(bus.bus.peers.get(b.id).expect("b").replies_outgoing.len(), 1);

    bus.deliver(&b, reply_to(1, 7, &a.unique_name()));
    let inbox = a.sent();
    assert_eq!(inbox.len(), 1);
    assert_eq!(inbox[0].kind, MessageKind::MethodReturn);
    assert_eq!(inbox[0].reply_serial, Some(7));

    assert!(bus.bus.peers.get(b.id).expect("b").replies_outgoing.is_empty());
    assert!(bus.bus.peers.get(a.id).expect("a").owned_replies.is_empty());
}

#[test]
fn unexpected_reply_disconnects_the_sender() {
    let mut bus = TestBus::new();
    let a = bus.connect_and_hello(1);
    let b = bus.connect_and_hello(2);

    bus.deliver(&b, reply_to(1, 99, &a.unique_name()));
    assert!(bus.bus.peers.get(b.id).is_none(), "b was disconnected");
    assert!(a.sent().is_empty());
}

#[test]
fn duplicate_outstanding_serial_disconnects_the_caller() {
    let mut bus = TestBus::new();
    let a = bus.connect_and_hello(1);
    let b = bus.connect_and_hello(2);

    bus.deliver(&a, call_to(7, &b.unique_name(), "One"));
    bus.deliver(&a, call_to(7, &b.unique_name(), "Two"));
    assert!(bus.bus.peers.get(a.id).is_none(), "a was disconnected");
    // The first call still went through.
    assert_eq!(b.sent().len(), 1);
}

#[test]
fn call_to_unowned_name_reports_service_unknown() {
    let mut bus = TestBus::new();
    let a = bus.connect_and_hello(1);

    bus.deliver(&a, call_to(3, "com.gone", "DoThing"));
    let inbox = a.sent();
    assert_eq!(inbox.len(), 1);
    assert_eq!(inbox[0].kind, MessageKind::Error);
    assert_eq!(inbox[0].error_name.as_deref(), Some(wire::ERR_SERVICE_UNKNOWN));
}

#[test]
fn well_known_destination_routes_to_primary() {
    let mut bus = TestBus::new();
    let a = bus.connect_and_hello(1);
    let b = bus.connect_and_hello(2);
    bus.roundtrip(&b, request_name(2, "com.svc", 0));
    let _ = b.sent();

    bus.deliver(&a, call_to(5, "com.svc", "DoThing"));
    let inbox = b.sent();
    assert_eq!(inbox.len(), 1);
    assert_eq!(inbox[0].member.as_deref(), Some("DoThing"));
}

#[test]
fn broadcast_reaches_subscribers_once() {
    let mut bus = TestBus::new();
    let a = bus.connect_and_hello(1);
    let c = bus.connect_and_hello(2);

    // Two overlapping subscriptions still mean one delivery per message.
    bus.roundtrip(&c, add_match(2, "type=signal"));
    bus.roundtrip(&c, add_match(3, "member=Ping"));
    let _ = c.sent();

    bus.deliver(&a, broadcast_signal(4, "Ping"));
    let inbox = c.sent();
    assert_eq!(inbox.len(), 1);
    assert_eq!(inbox[0].member.as_deref(), Some("Ping"));
    assert_eq!(inbox[0].sender.as_deref(), Some(":1.0"));
}

#[test]
fn broadcast_respects_filters() {
    let mut bus = TestBus::new();
    let a = bus.connect_and_hello(1);
    let c = bus.connect_and_hello(2);

    bus.roundtrip(&c, add_match(2, "member=Interesting"));
    let _ = c.sent();

    bus.deliver(&a, broadcast_signal(3, "Boring"));
    assert!(c.sent().is_empty());
}

#[test]
fn match_on_not_yet_existing_peer_fires_when_it_appears() {
    let mut bus = TestBus::new();
    let _a = bus.connect_and_hello(1); // :1.0
    let c = bus.connect_and_hello(2); // :1.1

    // :1.3 is beyond the allocator; the rule parks with the wildcards.
    bus.roundtrip(&c, add_match(2, "sender=:1.3"));
    let _ = c.sent();

    let d = bus.connect_and_hello(3); // :1.2
    bus.deliver(&d, broadcast_signal(2, "Early"));
    assert!(c.sent().is_empty(), "wrong sender must not fire");

    let e = bus.connect_and_hello(4); // :1.3
    assert_eq!(e.unique_name(), ":1.3");
    bus.deliver(&e, broadcast_signal(2, "Late"));
    let inbox = c.sent();
    assert_eq!(inbox.len(), 1);
    assert_eq!(inbox[0].member.as_deref(), Some("Late"));
}

#[test]
fn unique_id_sender_subscription_targets_one_peer() {
    let mut bus = TestBus::new();
    let a = bus.connect_and_hello(1);
    let d = bus.connect_and_hello(2);
    let c = bus.connect_and_hello(3);

    bus.roundtrip(&c, add_match(2, &format!("sender={}", a.unique_name())));
    let _ = c.sent();

    bus.deliver(&a, broadcast_signal(3, "Mine"));
    assert_eq!(c.sent().len(), 1);
    bus.deliver(&d, broadcast_signal(3, "Other"));
    assert!(c.sent().is_empty());
}

#[test]
fn subscription_on_departed_peer_never_fires_but_stays_removable() {
    let mut bus = TestBus::new();
    let a = bus.connect_and_hello(1);
    let c = bus.connect_and_hello(2);
    let gone = a.unique_name();
    bus.hangup(&a);

    // The id is below the allocator's high-water mark and gone for good.
    let reply = bus.roundtrip(&c, add_match(2, &format!("sender={gone}")));
    assert_eq!(reply.kind, MessageKind::MethodReturn);

    let d = bus.connect_and_hello(3);
    bus.deliver(&d, broadcast_signal(3, "Noise"));
    assert!(c.sent().is_empty());

    // Tracked in its owner, so removal still succeeds.
    let reply = bus.roundtrip(
        &c,
        ferrobus_core::testing::driver_call(
            4,
            "RemoveMatch",
            vec![ferrobus_message::Arg::Str(format!("sender={gone}"))],
        ),
    );
    assert_eq!(reply.kind, MessageKind::MethodReturn);
    assert!(bus.bus.peers.get(c.id).expect("c").owned_matches.is_empty());
}

#[test]
fn sender_name_subscription_follows_primary_ownership() {
    let mut bus = TestBus::new();
    let a = bus.connect_and_hello(1);
    let b = bus.connect_and_hello(2);
    let c = bus.connect_and_hello(3);

    bus.roundtrip(&c, add_match(2, "sender=com.x"));
    bus.roundtrip(&a, request_name(2, "com.x", 0));
    bus.roundtrip(&b, request_name(2, "com.x", 0)); // queued, not primary
    let _ = c.sent();

    bus.deliver(&a, broadcast_signal(3, "FromPrimary"));
    assert_eq!(c.sent().len(), 1);

    bus.deliver(&b, broadcast_signal(3, "FromQueued"));
    assert!(c.sent().is_empty(), "queued owners do not speak for the name");
}

#[test]
fn eavesdropper_observes_unicast_without_double_delivery() {
    let mut bus = TestBus::new();
    let a = bus.connect_and_hello(1);
    let b = bus.connect_and_hello(2);
    let e = bus.connect_and_hello(3);
    let f = bus.connect_and_hello(4);

    bus.roundtrip(&e, add_match(2, "eavesdrop=true"));
    bus.roundtrip(&f, add_match(2, "type=method_call"));
    let _ = e.sent();
    let _ = f.sent();

    bus.deliver(&a, call_to(5, &b.unique_name(), "Secret"));

    // The addressed receiver sees the call exactly once.
    assert_eq!(b.sent().len(), 1);
    // The eavesdropper observes it.
    let observed = e.sent();
    assert_eq!(observed.len(), 1);
    assert_eq!(observed[0].member.as_deref(), Some("Secret"));
    // A plain subscription never matches unicast traffic.
    assert!(f.sent().is_empty());
}

#[test]
fn callee_disconnect_synthesizes_no_reply_errors() {
    let mut bus = TestBus::new();
    let a = bus.connect_and_hello(1);
    let b = bus.connect_and_hello(2);

    bus.deliver(&a, call_to(7, &b.unique_name(), "DoThing"));
    let _ = b.sent();

    bus.hangup(&b);
    let inbox = a.sent();
    assert_eq!(inbox.len(), 1);
    assert_eq!(inbox[0].kind, MessageKind::Error);
    assert_eq!(inbox[0].error_name.as_deref(), Some(wire::ERR_NO_REPLY));
    assert_eq!(inbox[0].reply_serial, Some(7));
    assert!(bus.bus.peers.get(a.id).expect("a").owned_replies.is_empty());
}

#[test]
fn caller_disconnect_retracts_outstanding_slots() {
    let mut bus = TestBus::new();
    let a = bus.connect_and_hello(1);
    let b = bus.connect_and_hello(2);

    bus.deliver(&a, call_to(7, &b.unique_name(), "DoThing"));
    let _ = b.sent();
    bus.hangup(&a);

    assert!(bus.bus.peers.get(b.id).expect("b").replies_outgoing.is_empty());
    // A late reply from B is now unexpected and disconnects B.
    bus.deliver(&b, reply_to(1, 7, ":1.0"));
    assert!(bus.bus.peers.get(b.id).is_none());
}

#[test]
fn broadcast_overflow_shuts_down_the_receiver() {
    let mut bus = TestBus::new();
    bus.outbox_bytes = 1;
    let c = bus.connect(5);
    // Hello reply itself overflows the one-byte outbox; keep the peer
    // alive by reading nothing and watch a broadcast kill it instead.
    bus.deliver(&c, ferrobus_core::testing::driver_call(1, "Hello", vec![]));
    assert!(
        !c.handle.is_running(),
        "over-quota receiver is shut down rather than erroring the sender"
    );
}
