//! The immutable policy ruleset.

use crate::{PeerPolicy, PolicyError};
use ferrobus_message::MessageKind;
use serde::{Deserialize, Serialize};

/// Verdict attached to a rule, and the registry-wide default.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    #[default]
    Allow,
    Deny,
}

/// Scope shared by all rule kinds: which peers a rule applies to.
///
/// `uid`/`gid` of `None` means "any". A rule with a gid constraint forces
/// the broker to resolve auxiliary groups at accept time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectRule {
    pub action: Action,
    #[serde(default)]
    pub uid: Option<u32>,
    #[serde(default)]
    pub gid: Option<u32>,
}

/// Controls `RequestName`.
///
/// `name` matches exactly; `prefix` matches the name itself or any
/// dot-separated child of it. Both unset means "any name".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnRule {
    pub action: Action,
    #[serde(default)]
    pub uid: Option<u32>,
    #[serde(default)]
    pub gid: Option<u32>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub prefix: Option<String>,
}

/// Controls message transfer, in either direction.
///
/// For `send` rules, `name` is matched against the *receiver's* names; for
/// `receive` rules, against the *sender's* names. The empty name set (a
/// peer with no well-known names) only matches rules without a `name`
/// constraint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRule {
    pub action: Action,
    #[serde(default)]
    pub uid: Option<u32>,
    #[serde(default)]
    pub gid: Option<u32>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub interface: Option<String>,
    #[serde(default)]
    pub member: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub kind: Option<MessageKind>,
}

/// Structured policy, as loaded from configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Base verdict when no rule matches.
    #[serde(default)]
    pub default_action: Action,
    #[serde(default)]
    pub connect: Vec<ConnectRule>,
    #[serde(default)]
    pub own: Vec<OwnRule>,
    #[serde(default)]
    pub send: Vec<TransferRule>,
    #[serde(default)]
    pub receive: Vec<TransferRule>,
}

/// The immutable ruleset shared by all peers of one bus.
#[derive(Debug, Clone, Default)]
pub struct PolicyRegistry {
    config: PolicyConfig,
}

fn applies_to(uid_sel: Option<u32>, gid_sel: Option<u32>, uid: u32, gids: &[u32]) -> bool {
    if let Some(u) = uid_sel {
        if u != uid {
            return false;
        }
    }
    if let Some(g) = gid_sel {
        if !gids.contains(&g) {
            return false;
        }
    }
    true
}

impl PolicyRegistry {
    /// Builds a registry from structured configuration.
    #[must_use]
    pub fn new(config: PolicyConfig) -> Self {
        Self { config }
    }

    /// A registry that allows everything. Used by tests and as the session
    /// default when no policy is configured.
    #[must_use]
    pub fn allow_all() -> Self {
        Self::new(PolicyConfig::default())
    }

    /// Whether any rule constrains on group membership.
    ///
    /// When false the broker can skip auxiliary-group resolution entirely.
    #[must_use]
    pub fn needs_groups(&self) -> bool {
        self.config.connect.iter().any(|r| r.gid.is_some())
            || self.config.own.iter().any(|r| r.gid.is_some())
            || self.config.send.iter().any(|r| r.gid.is_some())
            || self.config.receive.iter().any(|r| r.gid.is_some())
    }

    /// Decides whether a connection from `uid`/`gids` is accepted.
    ///
    /// The security label is accepted for future label-based rules; the
    /// structured ruleset does not currently constrain on it.
    pub fn check_connect(
        &self,
        uid: u32,
        gids: &[u32],
        _seclabel: Option<&str>,
    ) -> Result<(), PolicyError> {
        let mut action = self.config.default_action;
        for rule in &self.config.connect {
            if applies_to(rule.uid, rule.gid, uid, gids) {
                action = rule.action;
            }
        }
        match action {
            Action::Allow => Ok(()),
            Action::Deny => Err(PolicyError::AccessDenied),
        }
    }

    /// Freezes the per-peer view of the ruleset.
    ///
    /// Only rules applicable to `uid`/`gids` are retained; the snapshot is
    /// immutable for the lifetime of the peer, so later group changes do
    /// not affect active connections.
    #[must_use]
    pub fn instantiate(&self, uid: u32, gids: &[u32]) -> PeerPolicy {
        let own = self
            .config
            .own
            .iter()
            .filter(|r| applies_to(r.uid, r.gid, uid, gids))
            .cloned()
            .collect();
        let send = self
            .config
            .send
            .iter()
            .filter(|r| applies_to(r.uid, r.gid, uid, gids))
            .cloned()
            .collect();
        let receive = self
            .config
            .receive
            .iter()
            .filter(|r| applies_to(r.uid, r.gid, uid, gids))
            .cloned()
            .collect();
        PeerPolicy::new(uid, self.config.default_action, own, send, receive)
    }
}
