//! Per-peer policy snapshots.

use crate::{Action, OwnRule, PolicyError, TransferRule};
use ferrobus_message::MessageKind;

/// The immutable policy view of one connected peer.
///
/// Created once at connection time by
/// [`PolicyRegistry::instantiate`](crate::PolicyRegistry::instantiate); the
/// snapshot never changes afterwards.
#[derive(Debug, Clone)]
pub struct PeerPolicy {
    uid: u32,
    default_action: Action,
    own: Vec<OwnRule>,
    send: Vec<TransferRule>,
    receive: Vec<TransferRule>,
}

fn name_in<'a>(selector: &str, mut names: impl Iterator<Item = &'a str>) -> bool {
    names.any(|n| n == selector)
}

fn transfer_matches<'a>(
    rule: &TransferRule,
    names: &[&'a str],
    interface: Option<&str>,
    member: Option<&str>,
    path: Option<&str>,
    kind: MessageKind,
) -> bool {
    if let Some(sel) = &rule.name {
        if !name_in(sel, names.iter().copied()) {
            return false;
        }
    }
    if let Some(sel) = &rule.interface {
        if interface != Some(sel.as_str()) {
            return false;
        }
    }
    if let Some(sel) = &rule.member {
        if member != Some(sel.as_str()) {
            return false;
        }
    }
    if let Some(sel) = &rule.path {
        if path != Some(sel.as_str()) {
            return false;
        }
    }
    if let Some(sel) = rule.kind {
        if sel != kind {
            return false;
        }
    }
    true
}

impl PeerPolicy {
    pub(crate) fn new(
        uid: u32,
        default_action: Action,
        own: Vec<OwnRule>,
        send: Vec<TransferRule>,
        receive: Vec<TransferRule>,
    ) -> Self {
        Self {
            uid,
            default_action,
            own,
            send,
            receive,
        }
    }

    /// A snapshot that allows everything; test and driver use.
    #[must_use]
    pub fn allow_all(uid: u32) -> Self {
        Self::new(uid, Action::Allow, Vec::new(), Vec::new(), Vec::new())
    }

    /// The uid the snapshot was instantiated for.
    #[must_use]
    pub fn uid(&self) -> u32 {
        self.uid
    }

    /// Decides whether this peer may own `name`.
    pub fn check_own(&self, name: &str) -> Result<(), PolicyError> {
        let mut action = self.default_action;
        for rule in &self.own {
            let applies = match (&rule.name, &rule.prefix) {
                (Some(sel), _) => sel == name,
                (None, Some(prefix)) => {
                    name == prefix
                        || (name.len() > prefix.len()
                            && name.starts_with(prefix.as_str())
                            && name.as_bytes()[prefix.len()] == b'.')
                }
                (None, None) => true,
            };
            if applies {
                action = rule.action;
            }
        }
        match action {
            Action::Allow => Ok(()),
            Action::Deny => Err(PolicyError::AccessDenied),
        }
    }

    /// Decides whether this peer may send a message to a peer currently
    /// holding `receiver_names`.
    pub fn check_send(
        &self,
        receiver_names: &[&str],
        interface: Option<&str>,
        member: Option<&str>,
        path: Option<&str>,
        kind: MessageKind,
    ) -> Result<(), PolicyError> {
        self.check_transfer(&self.send, receiver_names, interface, member, path, kind)
    }

    /// Decides whether this peer may receive a message from a peer
    /// currently holding `sender_names`.
    pub fn check_receive(
        &self,
        sender_names: &[&str],
        interface: Option<&str>,
        member: Option<&str>,
        path: Option<&str>,
        kind: MessageKind,
    ) -> Result<(), PolicyError> {
        self.check_transfer(&self.receive, sender_names, interface, member, path, kind)
    }

    fn check_transfer(
        &self,
        rules: &[TransferRule],
        names: &[&str],
        interface: Option<&str>,
        member: Option<&str>,
        path: Option<&str>,
        kind: MessageKind,
    ) -> Result<(), PolicyError> {
        let mut action = self.default_action;
        for rule in rules {
            if transfer_matches(rule, names, interface, member, path, kind) {
                action = rule.action;
            }
        }
        match action {
            Action::Allow => Ok(()),
            Action::Deny => Err(PolicyError::AccessDenied),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deny_own(prefix: Option<&str>, name: Option<&str>) -> PeerPolicy {
        PeerPolicy::new(
            0,
            Action::Allow,
            vec![OwnRule {
                action: Action::Deny,
                uid: None,
                gid: None,
                name: name.map(str::to_owned),
                prefix: prefix.map(str::to_owned),
            }],
            Vec::new(),
            Vec::new(),
        )
    }

    #[test]
    fn own_exact_name() {
        let policy = deny_own(None, Some("com.example.Svc"));
        assert!(policy.check_own("com.example.Svc").is_err());
        assert!(policy.check_own("com.example.Svc2").is_ok());
    }

    #[test]
    fn own_prefix_matches_dot_children_only() {
        let policy = deny_own(Some("com.example"), None);
        assert!(policy.check_own("com.example").is_err());
        assert!(policy.check_own("com.example.Svc").is_err());
        assert!(policy.check_own("com.exampleSvc").is_ok());
        assert!(policy.check_own("org.other").is_ok());
    }

    #[test]
    fn send_matches_on_receiver_names() {
        let policy = PeerPolicy::new(
            0,
            Action::Allow,
            Vec::new(),
            vec![TransferRule {
                action: Action::Deny,
                name: Some("com.locked".into()),
                ..TransferRule::default()
            }],
            Vec::new(),
        );

        assert!(policy
            .check_send(&["com.locked"], None, None, None, MessageKind::MethodCall)
            .is_err());
        assert!(policy
            .check_send(&["com.open"], None, None, None, MessageKind::MethodCall)
            .is_ok());
        assert!(policy
            .check_send(&[], None, None, None, MessageKind::MethodCall)
            .is_ok());
    }

    #[test]
    fn receive_matches_interface_and_kind() {
        let policy = PeerPolicy::new(
            0,
            Action::Allow,
            Vec::new(),
            Vec::new(),
            vec![TransferRule {
                action: Action::Deny,
                interface: Some("com.x.Secret".into()),
                kind: Some(MessageKind::Signal),
                ..TransferRule::default()
            }],
        );

        assert!(policy
            .check_receive(&[], Some("com.x.Secret"), None, None, MessageKind::Signal)
            .is_err());
        assert!(policy
            .check_receive(&[], Some("com.x.Secret"), None, None, MessageKind::MethodCall)
            .is_ok());
        assert!(policy
            .check_receive(&[], Some("com.x.Pub"), None, None, MessageKind::Signal)
            .is_ok());
    }

    #[test]
    fn deny_default_with_allow_carveout() {
        let policy = PeerPolicy::new(
            0,
            Action::Deny,
            vec![OwnRule {
                action: Action::Allow,
                name: Some("com.mine".into()),
                ..OwnRule::default()
            }],
            Vec::new(),
            Vec::new(),
        );
        assert!(policy.check_own("com.mine").is_ok());
        assert!(policy.check_own("com.other").is_err());
    }
}
