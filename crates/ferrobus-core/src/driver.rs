//! The in-process driver: message ingress, the `org.freedesktop.DBus`
//! method surface, its signals, and the disconnect cascade.
//!
//! Driver replies are synchronous within the dispatch turn: a handler
//! queues its reply into the caller's outbox before the write phase of the
//! same wake-up flushes it. Driver traffic is re-broadcast driver-originated
//! so monitors and driver eavesdroppers observe it.

use crate::bus::Bus;
use crate::error::{DriverError, MatchError, NameError, PeerError};
use crate::matches::{MatchOwner, RefRule};
use crate::names::{NameChange, NameFlags, RequestReply};
use ferrobus_message::{wire, Arg, Message, MessageKind};
use ferrobus_types::{Address, PeerId};
use tracing::{debug, warn};

const INTROSPECT_XML: &str = r#"<!DOCTYPE node PUBLIC "-//freedesktop//DTD D-BUS Object Introspection 1.0//EN"
 "http://www.freedesktop.org/standards/dbus/1.0/introspect.dtd">
<node>
 <interface name="org.freedesktop.DBus">
  <method name="Hello"><arg type="s" direction="out"/></method>
  <method name="RequestName"><arg type="s" direction="in"/><arg type="u" direction="in"/><arg type="u" direction="out"/></method>
  <method name="ReleaseName"><arg type="s" direction="in"/><arg type="u" direction="out"/></method>
  <method name="ListNames"><arg type="as" direction="out"/></method>
  <method name="ListActivatableNames"><arg type="as" direction="out"/></method>
  <method name="NameHasOwner"><arg type="s" direction="in"/><arg type="b" direction="out"/></method>
  <method name="GetNameOwner"><arg type="s" direction="in"/><arg type="s" direction="out"/></method>
  <method name="ListQueuedOwners"><arg type="s" direction="in"/><arg type="as" direction="out"/></method>
  <method name="StartServiceByName"><arg type="s" direction="in"/><arg type="u" direction="in"/><arg type="u" direction="out"/></method>
  <method name="AddMatch"><arg type="s" direction="in"/></method>
  <method name="RemoveMatch"><arg type="s" direction="in"/></method>
  <method name="GetConnectionUnixUser"><arg type="s" direction="in"/><arg type="u" direction="out"/></method>
  <method name="GetConnectionUnixProcessID"><arg type="s" direction="in"/><arg type="u" direction="out"/></method>
  <method name="GetConnectionCredentials"><arg type="s" direction="in"/><arg type="a{sv}" direction="out"/></method>
  <method name="GetId"><arg type="s" direction="out"/></method>
  <signal name="NameOwnerChanged"><arg type="s"/><arg type="s"/><arg type="s"/></signal>
  <signal name="NameLost"><arg type="s"/></signal>
  <signal name="NameAcquired"><arg type="s"/></signal>
 </interface>
 <interface name="org.freedesktop.DBus.Monitoring">
  <method name="BecomeMonitor"><arg type="as" direction="in"/><arg type="u" direction="in"/></method>
 </interface>
 <interface name="org.freedesktop.DBus.Peer">
  <method name="Ping"/>
 </interface>
 <interface name="org.freedesktop.DBus.Introspectable">
  <method name="Introspect"><arg type="s" direction="out"/></method>
 </interface>
</node>
"#;

/// Entry point for every message a peer sends.
pub(crate) fn dispatch_message(
    bus: &mut Bus,
    id: PeerId,
    mut message: Message,
) -> Result<(), PeerError> {
    let (registered, monitor, unique) = {
        let peer = bus
            .peers
            .get(id)
            .ok_or_else(|| PeerError::Internal("peer vanished".into()))?;
        (peer.registered, peer.monitor, peer.unique_name())
    };

    // Monitors renounced the ability to emit anything.
    if monitor {
        return Err(PeerError::ProtocolViolation);
    }
    if message.serial == 0 {
        return Err(PeerError::ProtocolViolation);
    }
    // The broker stamps the sender; peers cannot spoof it.
    message.sender = Some(unique);

    let to_driver = message.destination.as_deref() == Some(wire::DRIVER_NAME);
    if !registered
        && !(to_driver
            && message.kind == MessageKind::MethodCall
            && message.member.as_deref() == Some("Hello"))
    {
        return Err(PeerError::ProtocolViolation);
    }
    if to_driver {
        return dispatch_driver_call(bus, id, &message);
    }

    match message.kind {
        MessageKind::Signal => match message.destination.clone() {
            None => bus.broadcast(Some(id), None, None, &message),
            Some(dest) => route_unicast(bus, id, &dest, &message),
        },
        MessageKind::MethodCall => {
            let Some(dest) = message.destination.clone() else {
                return Err(PeerError::ProtocolViolation);
            };
            route_unicast(bus, id, &dest, &message)
        }
        MessageKind::MethodReturn | MessageKind::Error => {
            let Some(dest) = message.destination.clone() else {
                return Err(PeerError::ProtocolViolation);
            };
            let reply_serial = message.reply_serial.unwrap_or(0);
            match bus.queue_reply(id, &dest, reply_serial, &message) {
                // A reply nobody is waiting for is a protocol breach.
                Err(PeerError::UnexpectedReply) => Err(PeerError::ProtocolViolation),
                other => other,
            }
        }
    }
}

/// Routes a unicast call or directed signal, mapping failures onto wire
/// errors for calls and silence for signals.
fn route_unicast(
    bus: &mut Bus,
    sender: PeerId,
    destination: &str,
    message: &Message,
) -> Result<(), PeerError> {
    let resolved = match Address::parse(destination) {
        Address::Id(id) => bus
            .peers
            .find_registered(id)
            .map(|p| p.id)
            .ok_or(wire::ERR_NAME_HAS_NO_OWNER),
        Address::Name(name) => bus
            .names
            .primary_owner(&name)
            .ok_or(wire::ERR_SERVICE_UNKNOWN),
        Address::Other => Err(wire::ERR_SERVICE_UNKNOWN),
    };

    let receiver = match resolved {
        Ok(receiver) => receiver,
        Err(error_name) => {
            send_error(bus, sender, message, error_name, "destination has no owner")?;
            return Ok(());
        }
    };

    match bus.queue_call(sender, receiver, message) {
        Ok(()) => Ok(()),
        Err(PeerError::ReplyExists) => Err(PeerError::ProtocolViolation),
        Err(PeerError::Quota) => {
            send_error(
                bus,
                sender,
                message,
                wire::ERR_LIMITS_EXCEEDED,
                "resource quota exhausted",
            )?;
            Ok(())
        }
        Err(PeerError::SendDenied) | Err(PeerError::ReceiveDenied) => {
            // Denied calls get an error; denied signals vanish.
            send_error(
                bus,
                sender,
                message,
                wire::ERR_ACCESS_DENIED,
                "message rejected by policy",
            )?;
            Ok(())
        }
        Err(other) => Err(other),
    }
}

/// Dispatches a method call addressed to the driver.
fn dispatch_driver_call(bus: &mut Bus, id: PeerId, message: &Message) -> Result<(), PeerError> {
    if message.kind != MessageKind::MethodCall {
        // Signals and replies addressed to the driver are discarded.
        return Ok(());
    }
    let Some(member) = message.member.as_deref() else {
        return Err(PeerError::ProtocolViolation);
    };

    let result = match message.interface.as_deref() {
        None => handle_any_interface(bus, id, member, message),
        Some(wire::INTERFACE_DBUS) => handle_dbus(bus, id, member, message),
        Some(wire::INTERFACE_MONITORING) => handle_monitoring(bus, id, member, message),
        Some(wire::INTERFACE_PEER) => handle_peer_interface(member),
        Some(wire::INTERFACE_INTROSPECTABLE) => handle_introspectable(member),
        Some(other) => Err(DriverError::wire(
            wire::ERR_UNKNOWN_METHOD,
            format!("unknown interface {other}"),
        )),
    };

    match result {
        Ok(args) => send_return(bus, id, message, args),
        Err(DriverError::Wire { name, text }) => send_error(bus, id, message, name, &text),
        Err(DriverError::Violation) => Err(PeerError::ProtocolViolation),
        Err(DriverError::Internal(msg)) => Err(PeerError::Internal(msg)),
    }
}

fn unknown_method(member: &str) -> DriverError {
    DriverError::wire(wire::ERR_UNKNOWN_METHOD, format!("unknown method {member}"))
}

fn handle_any_interface(
    bus: &mut Bus,
    id: PeerId,
    member: &str,
    message: &Message,
) -> Result<Vec<Arg>, DriverError> {
    match member {
        "Ping" => handle_peer_interface(member),
        "Introspect" => handle_introspectable(member),
        "BecomeMonitor" => handle_monitoring(bus, id, member, message),
        _ => handle_dbus(bus, id, member, message),
    }
}

fn handle_dbus(
    bus: &mut Bus,
    id: PeerId,
    member: &str,
    message: &Message,
) -> Result<Vec<Arg>, DriverError> {
    match member {
        "Hello" => hello(bus, id),
        "RequestName" => request_name(bus, id, message),
        "ReleaseName" => release_name(bus, id, message),
        "ListNames" => list_names(bus),
        "ListActivatableNames" => Ok(vec![Arg::StrList(vec![wire::DRIVER_NAME.to_owned()])]),
        "NameHasOwner" => name_has_owner(bus, message),
        "GetNameOwner" => get_name_owner(bus, message),
        "ListQueuedOwners" => list_queued_owners(bus, message),
        "StartServiceByName" => start_service_by_name(bus, message),
        "AddMatch" => add_match(bus, id, message),
        "RemoveMatch" => remove_match(bus, id, message),
        "GetConnectionUnixUser" => connection_uid(bus, message),
        "GetConnectionUnixProcessID" => connection_pid(bus, message),
        "GetConnectionCredentials" => connection_credentials(bus, message),
        "GetId" => Ok(vec![Arg::Str(bus.guid().to_owned())]),
        _ => Err(unknown_method(member)),
    }
}

fn handle_monitoring(
    bus: &mut Bus,
    id: PeerId,
    member: &str,
    message: &Message,
) -> Result<Vec<Arg>, DriverError> {
    match member {
        "BecomeMonitor" => become_monitor(bus, id, message),
        _ => Err(unknown_method(member)),
    }
}

fn handle_peer_interface(member: &str) -> Result<Vec<Arg>, DriverError> {
    match member {
        "Ping" => Ok(vec![]),
        _ => Err(unknown_method(member)),
    }
}

fn handle_introspectable(member: &str) -> Result<Vec<Arg>, DriverError> {
    match member {
        "Introspect" => Ok(vec![Arg::Str(INTROSPECT_XML.to_owned())]),
        _ => Err(unknown_method(member)),
    }
}

// ─── org.freedesktop.DBus methods ──────────────────────────────────

fn hello(bus: &mut Bus, id: PeerId) -> Result<Vec<Arg>, DriverError> {
    let unique = {
        let peer = bus
            .peers
            .get_mut(id)
            .ok_or_else(|| DriverError::Internal("peer vanished".into()))?;
        if peer.registered {
            // A second Hello is a handshake breach.
            return Err(DriverError::Violation);
        }
        peer.registered = true;
        peer.unique_name()
    };
    debug!(peer = %id, "peer registered");

    send_name_signal(bus, id, wire::SIG_NAME_ACQUIRED, &unique)
        .map_err(|e| DriverError::Internal(e.to_string()))?;
    name_owner_changed(bus, &unique, None, Some(id))
        .map_err(|e| DriverError::Internal(e.to_string()))?;
    Ok(vec![Arg::Str(unique)])
}

fn checked_name(message: &Message) -> Result<&str, DriverError> {
    let name = message
        .arg_str(0)
        .ok_or_else(|| DriverError::wire(wire::ERR_INVALID_ARGS, "expected a name argument"))?;
    if name == wire::DRIVER_NAME {
        return Err(DriverError::wire(
            wire::ERR_INVALID_ARGS,
            "the driver's name is reserved",
        ));
    }
    if name.starts_with(':') {
        return Err(DriverError::wire(
            wire::ERR_INVALID_ARGS,
            "unique names cannot be requested or released",
        ));
    }
    Ok(name)
}

fn request_name(bus: &mut Bus, id: PeerId, message: &Message) -> Result<Vec<Arg>, DriverError> {
    let name = checked_name(message)?.to_owned();
    let flags = message
        .arg_u32(1)
        .ok_or_else(|| DriverError::wire(wire::ERR_INVALID_ARGS, "expected a flags argument"))?;

    {
        let peer = bus
            .peers
            .get(id)
            .ok_or_else(|| DriverError::Internal("peer vanished".into()))?;
        peer.policy.check_own(&name).map_err(|_| {
            DriverError::wire(wire::ERR_ACCESS_DENIED, "name ownership denied by policy")
        })?;
    }

    let user = bus.peers.get(id).expect("checked above").user.clone();
    let (reply, change) = bus
        .names
        .request(id, &user, &name, NameFlags::from_bits(flags))
        .map_err(|err| match err {
            NameError::Quota => DriverError::wire(wire::ERR_LIMITS_EXCEEDED, "name quota exhausted"),
            other => DriverError::Internal(other.to_string()),
        })?;

    let code = match reply {
        RequestReply::PrimaryOwner => {
            if let Some(peer) = bus.peers.get_mut(id) {
                peer.owned_names.insert(name.clone());
            }
            wire::REQUEST_NAME_REPLY_PRIMARY_OWNER
        }
        RequestReply::InQueue => {
            if let Some(peer) = bus.peers.get_mut(id) {
                peer.owned_names.insert(name.clone());
            }
            wire::REQUEST_NAME_REPLY_IN_QUEUE
        }
        RequestReply::Exists => wire::REQUEST_NAME_REPLY_EXISTS,
        RequestReply::AlreadyOwner => wire::REQUEST_NAME_REPLY_ALREADY_OWNER,
    };

    if let Some(change) = change {
        sync_displaced_owner(bus, &change);
        notify_name_change(bus, &change).map_err(|e| DriverError::Internal(e.to_string()))?;
    }
    Ok(vec![Arg::U32(code)])
}

fn release_name(bus: &mut Bus, id: PeerId, message: &Message) -> Result<Vec<Arg>, DriverError> {
    let name = checked_name(message)?.to_owned();
    match bus.names.release(id, &name) {
        Err(NameError::NotFound) => Ok(vec![Arg::U32(wire::RELEASE_NAME_REPLY_NON_EXISTENT)]),
        Err(NameError::NotOwner) => Ok(vec![Arg::U32(wire::RELEASE_NAME_REPLY_NOT_OWNER)]),
        Err(other) => Err(DriverError::Internal(other.to_string())),
        Ok(change) => {
            if let Some(peer) = bus.peers.get_mut(id) {
                peer.owned_names.remove(&name);
            }
            if let Some(change) = change {
                notify_name_change(bus, &change)
                    .map_err(|e| DriverError::Internal(e.to_string()))?;
            }
            Ok(vec![Arg::U32(wire::RELEASE_NAME_REPLY_RELEASED)])
        }
    }
}

fn list_names(bus: &Bus) -> Result<Vec<Arg>, DriverError> {
    let mut names = vec![wire::DRIVER_NAME.to_owned()];
    names.extend(
        bus.peers
            .iter()
            .filter(|p| p.registered)
            .map(|p| p.unique_name()),
    );
    let mut owned: Vec<String> = bus.names.owned_names().map(str::to_owned).collect();
    owned.sort();
    names.extend(owned);
    Ok(vec![Arg::StrList(names)])
}

fn named_argument(message: &Message) -> Result<&str, DriverError> {
    message
        .arg_str(0)
        .ok_or_else(|| DriverError::wire(wire::ERR_INVALID_ARGS, "expected a name argument"))
}

/// Resolves a name argument to a live registered peer.
fn resolve_peer_argument(bus: &Bus, name: &str) -> Option<PeerId> {
    match Address::parse(name) {
        Address::Id(id) => bus.peers.find_registered(id).map(|p| p.id),
        Address::Name(n) => bus.names.primary_owner(&n),
        Address::Other => None,
    }
}

fn name_has_owner(bus: &Bus, message: &Message) -> Result<Vec<Arg>, DriverError> {
    let name = named_argument(message)?;
    let has = name == wire::DRIVER_NAME || resolve_peer_argument(bus, name).is_some();
    Ok(vec![Arg::Bool(has)])
}

fn get_name_owner(bus: &Bus, message: &Message) -> Result<Vec<Arg>, DriverError> {
    let name = named_argument(message)?;
    if name == wire::DRIVER_NAME {
        return Ok(vec![Arg::Str(wire::DRIVER_NAME.to_owned())]);
    }
    resolve_peer_argument(bus, name)
        .map(|id| vec![Arg::Str(id.unique_name())])
        .ok_or_else(|| {
            DriverError::wire(wire::ERR_NAME_HAS_NO_OWNER, format!("{name} has no owner"))
        })
}

fn list_queued_owners(bus: &Bus, message: &Message) -> Result<Vec<Arg>, DriverError> {
    let name = named_argument(message)?;
    if name == wire::DRIVER_NAME {
        return Ok(vec![Arg::StrList(vec![wire::DRIVER_NAME.to_owned()])]);
    }
    bus.names
        .queued_owners(name)
        .map(|owners| {
            vec![Arg::StrList(
                owners.into_iter().map(|id| id.unique_name()).collect(),
            )]
        })
        .ok_or_else(|| {
            DriverError::wire(wire::ERR_NAME_HAS_NO_OWNER, format!("{name} has no owner"))
        })
}

fn start_service_by_name(bus: &Bus, message: &Message) -> Result<Vec<Arg>, DriverError> {
    let name = named_argument(message)?;
    // No activation backend: a running owner is the only success.
    if name == wire::DRIVER_NAME || bus.names.primary_owner(name).is_some() {
        return Ok(vec![Arg::U32(wire::START_REPLY_ALREADY_RUNNING)]);
    }
    Err(DriverError::wire(
        wire::ERR_SERVICE_UNKNOWN,
        format!("{name} is not activatable"),
    ))
}

fn add_match(bus: &mut Bus, id: PeerId, message: &Message) -> Result<Vec<Arg>, DriverError> {
    let rule = message
        .arg_str(0)
        .ok_or_else(|| DriverError::wire(wire::ERR_INVALID_ARGS, "expected a rule argument"))?
        .to_owned();
    match bus.add_match(id, &rule, false) {
        Ok(()) => Ok(vec![]),
        Err(MatchError::Invalid) => Err(DriverError::wire(
            wire::ERR_MATCH_RULE_INVALID,
            "cannot parse match rule",
        )),
        Err(MatchError::Quota) => Err(DriverError::wire(
            wire::ERR_LIMITS_EXCEEDED,
            "match quota exhausted",
        )),
        Err(other) => Err(DriverError::Internal(other.to_string())),
    }
}

fn remove_match(bus: &mut Bus, id: PeerId, message: &Message) -> Result<Vec<Arg>, DriverError> {
    let rule = message
        .arg_str(0)
        .ok_or_else(|| DriverError::wire(wire::ERR_INVALID_ARGS, "expected a rule argument"))?
        .to_owned();
    match bus.remove_match(id, &rule) {
        Ok(()) => Ok(vec![]),
        Err(MatchError::Invalid) => Err(DriverError::wire(
            wire::ERR_MATCH_RULE_INVALID,
            "cannot parse match rule",
        )),
        Err(MatchError::NotFound) => Err(DriverError::wire(
            wire::ERR_MATCH_RULE_NOT_FOUND,
            "no such match rule",
        )),
        Err(other) => Err(DriverError::Internal(other.to_string())),
    }
}

fn connection_uid(bus: &Bus, message: &Message) -> Result<Vec<Arg>, DriverError> {
    let name = named_argument(message)?;
    if name == wire::DRIVER_NAME {
        return Ok(vec![Arg::U32(bus.owner().uid())]);
    }
    resolve_peer_argument(bus, name)
        .and_then(|id| bus.peers.get(id))
        .map(|peer| vec![Arg::U32(peer.user.uid())])
        .ok_or_else(|| {
            DriverError::wire(wire::ERR_NAME_HAS_NO_OWNER, format!("{name} has no owner"))
        })
}

fn connection_pid(bus: &Bus, message: &Message) -> Result<Vec<Arg>, DriverError> {
    let name = named_argument(message)?;
    if name == wire::DRIVER_NAME {
        return Ok(vec![Arg::U32(std::process::id())]);
    }
    resolve_peer_argument(bus, name)
        .and_then(|id| bus.peers.get(id))
        .map(|peer| vec![Arg::U32(peer.pid)])
        .ok_or_else(|| {
            DriverError::wire(wire::ERR_NAME_HAS_NO_OWNER, format!("{name} has no owner"))
        })
}

fn connection_credentials(bus: &Bus, message: &Message) -> Result<Vec<Arg>, DriverError> {
    let name = named_argument(message)?;
    let (uid, pid, label) = if name == wire::DRIVER_NAME {
        (bus.owner().uid(), std::process::id(), None)
    } else {
        let peer = resolve_peer_argument(bus, name)
            .and_then(|id| bus.peers.get(id))
            .ok_or_else(|| {
                DriverError::wire(wire::ERR_NAME_HAS_NO_OWNER, format!("{name} has no owner"))
            })?;
        (peer.user.uid(), peer.pid, peer.seclabel.clone())
    };
    let mut credentials = serde_json::json!({
        "UnixUserID": uid,
        "ProcessID": pid,
    });
    if let Some(label) = label {
        credentials["LinuxSecurityLabel"] = serde_json::Value::String(label);
    }
    Ok(vec![Arg::Map(credentials)])
}

// ─── org.freedesktop.DBus.Monitoring ───────────────────────────────

fn become_monitor(bus: &mut Bus, id: PeerId, message: &Message) -> Result<Vec<Arg>, DriverError> {
    let rules: Vec<String> = message
        .arg_str_list(0)
        .ok_or_else(|| DriverError::wire(wire::ERR_INVALID_ARGS, "expected a rule list"))?
        .to_vec();
    let flags = message
        .arg_u32(1)
        .ok_or_else(|| DriverError::wire(wire::ERR_INVALID_ARGS, "expected a flags argument"))?;
    if flags != 0 {
        return Err(DriverError::wire(
            wire::ERR_INVALID_ARGS,
            "monitoring flags must be zero",
        ));
    }
    {
        let peer = bus
            .peers
            .get(id)
            .ok_or_else(|| DriverError::Internal("peer vanished".into()))?;
        if !bus.is_privileged(peer) {
            return Err(DriverError::wire(
                wire::ERR_ACCESS_DENIED,
                "monitoring requires a privileged connection",
            ));
        }
    }

    // Build the replacement subscription set up front, fully charged, so
    // nothing destructive happens on an invalid rule or exhausted quota.
    let user = bus.peers.get(id).expect("checked above").user.clone();
    let has_rules = !bus
        .peers
        .get(id)
        .map(|p| p.owned_matches.is_empty())
        .unwrap_or(true);
    let replacement = if rules.is_empty() && has_rules {
        None
    } else {
        let sources: Vec<&str> = if rules.is_empty() {
            // Monitor everything when no rule is given.
            vec![""]
        } else {
            rules.iter().map(String::as_str).collect()
        };
        let mut owner = MatchOwner::default();
        for source in sources {
            let rule_id = bus.allocate_rule_id();
            match owner.ref_rule(rule_id, &user, source) {
                Ok(RefRule::New(_)) | Ok(RefRule::Coalesced(_)) => {}
                Err(MatchError::Invalid) => {
                    return Err(DriverError::wire(
                        wire::ERR_MATCH_RULE_INVALID,
                        "cannot parse match rule",
                    ))
                }
                Err(MatchError::Quota) => {
                    return Err(DriverError::wire(
                        wire::ERR_LIMITS_EXCEEDED,
                        "match quota exhausted",
                    ))
                }
                Err(other) => return Err(DriverError::Internal(other.to_string())),
            }
        }
        Some(owner)
    };

    // Past this point the transition is one-way; the peer stays internally
    // consistent throughout.
    let unique = bus
        .peers
        .get(id)
        .map(|p| p.unique_name())
        .unwrap_or_default();
    flush_names(bus, id, false);
    cancel_replies(bus, id, false);
    if let Some(owner) = replacement {
        bus.install_matches(id, owner);
    }
    if let Some(peer) = bus.peers.get_mut(id) {
        peer.registered = false;
        peer.monitor = true;
    }
    bus.relink_matches_as_monitor(id);
    debug!(peer = %id, "peer became a monitor");

    if let Err(err) = name_owner_changed(bus, &unique, Some(id), None) {
        warn!(peer = %id, error = %err, "monitor obituary broadcast failed");
    }
    Ok(vec![])
}

// ─── Driver egress ─────────────────────────────────────────────────

/// Queues a driver-originated message to one peer, then re-broadcasts it
/// driver-originated so monitors and driver eavesdroppers observe it.
fn driver_unicast(bus: &mut Bus, to: PeerId, message: Message) -> Result<(), PeerError> {
    if let Some(peer) = bus.peers.get_mut(to) {
        match peer.connection.queue(None, 0, message.clone()) {
            Ok(()) => {}
            Err(crate::error::ConnectionError::Quota) => peer.connection.shutdown(),
            Err(other) => return Err(PeerError::from(other)),
        }
    }
    bus.broadcast(None, Some(to), None, &message)
}

fn send_return(
    bus: &mut Bus,
    to: PeerId,
    call: &Message,
    args: Vec<Arg>,
) -> Result<(), PeerError> {
    if !call.expects_reply() {
        return Ok(());
    }
    let destination = bus
        .peers
        .get(to)
        .map(|p| p.unique_name())
        .unwrap_or_default();
    let serial = bus.next_driver_serial();
    let reply = Message::method_return(serial, call.serial, destination)
        .with_sender(wire::DRIVER_NAME)
        .with_args(args);
    driver_unicast(bus, to, reply)
}

fn send_error(
    bus: &mut Bus,
    to: PeerId,
    call: &Message,
    error_name: &str,
    text: &str,
) -> Result<(), PeerError> {
    if !call.expects_reply() {
        return Ok(());
    }
    send_error_raw(bus, to, call.serial, error_name, text)
}

fn send_error_raw(
    bus: &mut Bus,
    to: PeerId,
    reply_serial: u32,
    error_name: &str,
    text: &str,
) -> Result<(), PeerError> {
    let destination = bus
        .peers
        .get(to)
        .map(|p| p.unique_name())
        .unwrap_or_default();
    let serial = bus.next_driver_serial();
    let error = Message::error(serial, reply_serial, destination, error_name, text)
        .with_sender(wire::DRIVER_NAME);
    driver_unicast(bus, to, error)
}

/// Sends `NameAcquired`/`NameLost` to the peer it concerns.
fn send_name_signal(
    bus: &mut Bus,
    to: PeerId,
    member: &str,
    name: &str,
) -> Result<(), PeerError> {
    let destination = bus
        .peers
        .get(to)
        .map(|p| p.unique_name())
        .unwrap_or_default();
    let serial = bus.next_driver_serial();
    let signal = Message::signal(serial, wire::DRIVER_PATH, wire::INTERFACE_DBUS, member)
        .with_sender(wire::DRIVER_NAME)
        .with_destination(destination)
        .with_args(vec![Arg::Str(name.to_owned())]);
    driver_unicast(bus, to, signal)
}

/// Broadcasts `NameOwnerChanged`.
fn name_owner_changed(
    bus: &mut Bus,
    name: &str,
    old: Option<PeerId>,
    new: Option<PeerId>,
) -> Result<(), PeerError> {
    let serial = bus.next_driver_serial();
    let signal = Message::signal(
        serial,
        wire::DRIVER_PATH,
        wire::INTERFACE_DBUS,
        wire::SIG_NAME_OWNER_CHANGED,
    )
    .with_sender(wire::DRIVER_NAME)
    .with_args(vec![
        Arg::Str(name.to_owned()),
        Arg::Str(old.map(PeerId::unique_name).unwrap_or_default()),
        Arg::Str(new.map(PeerId::unique_name).unwrap_or_default()),
    ]);
    bus.broadcast(None, None, None, &signal)
}

/// Emits the full signal set for a primary-owner transition.
fn notify_name_change(bus: &mut Bus, change: &NameChange) -> Result<(), PeerError> {
    if let Some(old) = change.old {
        send_name_signal(bus, old, wire::SIG_NAME_LOST, &change.name)?;
    }
    if let Some(new) = change.new {
        send_name_signal(bus, new, wire::SIG_NAME_ACQUIRED, &change.name)?;
    }
    name_owner_changed(bus, &change.name, change.old, change.new)
}

/// After a replacement, a displaced primary that was dropped from the
/// queue entirely (do-not-queue) must forget the name.
fn sync_displaced_owner(bus: &mut Bus, change: &NameChange) {
    let Some(old) = change.old else {
        return;
    };
    let still_queued = bus
        .names
        .queued_owners(&change.name)
        .is_some_and(|queue| queue.contains(&old));
    if !still_queued {
        if let Some(peer) = bus.peers.get_mut(old) {
            peer.owned_names.remove(&change.name);
        }
    }
}

// ─── Disconnect cascade ────────────────────────────────────────────

/// Releases every owned name with the usual signals.
fn flush_names(bus: &mut Bus, id: PeerId, silent: bool) {
    let names: Vec<String> = bus
        .peers
        .get(id)
        .map(|p| p.owned_names.iter().cloned().collect())
        .unwrap_or_default();
    for name in names {
        let change = match bus.names.release(id, &name) {
            Ok(change) => change,
            Err(err) => {
                warn!(peer = %id, name, error = %err, "owned name missing from registry");
                None
            }
        };
        if let Some(peer) = bus.peers.get_mut(id) {
            peer.owned_names.remove(&name);
        }
        if silent {
            continue;
        }
        if let Some(change) = change {
            if let Err(err) = notify_name_change(bus, &change) {
                warn!(peer = %id, name = change.name, error = %err, "name change signals failed");
            }
        }
    }
}

/// Cancels reply tracking in both directions: calls this peer owes get
/// synthesized errors back to their callers, calls it awaited are retracted.
fn cancel_replies(bus: &mut Bus, id: PeerId, silent: bool) {
    let owed = bus
        .peers
        .get_mut(id)
        .map(|p| p.replies_outgoing.drain())
        .unwrap_or_default();
    for slot in owed {
        if let Some(caller) = bus.peers.get_mut(slot.caller) {
            caller.owned_replies.remove(id, slot.serial);
        }
        if !silent {
            if let Err(err) = send_error_raw(
                bus,
                slot.caller,
                slot.serial,
                wire::ERR_NO_REPLY,
                "remote peer disconnected",
            ) {
                warn!(peer = %id, caller = %slot.caller, error = %err, "reply cancellation failed");
            }
        }
    }

    let awaited = bus
        .peers
        .get_mut(id)
        .map(|p| p.owned_replies.drain())
        .unwrap_or_default();
    for (callee, serial) in awaited {
        if let Some(callee) = bus.peers.get_mut(callee) {
            drop(callee.replies_outgoing.remove(id, serial));
        }
    }
}

/// The disconnect cascade. Step order matters: names release before match
/// rules so the ownership-changed signals still reach subscribers attached
/// to those names.
pub(crate) fn goodbye(bus: &mut Bus, id: PeerId, silent: bool) {
    let Some(peer) = bus.peers.get_mut(id) else {
        return;
    };
    let was_registered = peer.registered;
    let unique = peer.unique_name();
    peer.registered = false;

    flush_names(bus, id, silent);
    cancel_replies(bus, id, silent);
    bus.flush_matches(id);

    if !silent && was_registered {
        if let Err(err) = name_owner_changed(bus, &unique, Some(id), None) {
            warn!(peer = %id, error = %err, "obituary broadcast failed");
        }
    }
    debug!(peer = %id, silent, "goodbye complete");
}
