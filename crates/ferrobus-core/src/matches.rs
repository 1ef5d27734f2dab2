//! Match rules: subscription grammar, owner index, target registries, and
//! filter evaluation.
//!
//! A rule lives in exactly one owner index (its subscriber's
//! [`MatchOwner`]) and in at most one target registry list. The registry a
//! rule links into depends on its `sender` key: none → the bus wildcard
//! registry, the driver's name → the driver registry, a unique id → that
//! peer's registry (or the wildcard registry with a resolved sender filter
//! when the id has not been allocated yet), a well-known name → that
//! name's registry, pinning the name entry alive.
//!
//! Rules subscribed by monitors go on the monitor list of their target
//! registry; rules carrying `eavesdrop=true` go on the eavesdrop list;
//! everything else on the plain rule list. Iteration is insertion-ordered,
//! eavesdrop list first, and unicast filters never reach the plain list.

use crate::error::MatchError;
use crate::user::{User, UserCharge, UserSlot};
use ferrobus_message::{Arg, Message, MessageKind};
use ferrobus_types::{Address, PeerId};
use std::collections::{BTreeMap, HashMap};

/// Highest argument index addressable by `argN`/`argNpath`.
pub const MAX_MATCH_ARG: u8 = 63;

/// Identifier of one rule within its owner, unique bus-wide.
pub type RuleId = u64;

/// The parsed key set of a rule string.
///
/// Ordered so an owner's rules form a tree keyed by the full tuple;
/// equality is what coalesces duplicate subscriptions.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct MatchRuleKeys {
    pub sender: Option<String>,
    pub destination: Option<String>,
    pub interface: Option<String>,
    pub member: Option<String>,
    pub path: Option<String>,
    pub path_namespace: Option<String>,
    pub arg0namespace: Option<String>,
    pub kind: Option<MessageKind>,
    pub eavesdrop: bool,
    pub args: BTreeMap<u8, String>,
    pub argpaths: BTreeMap<u8, String>,
}

/// `string` starts with `prefix`, and the boundary falls on `delimiter`.
///
/// With `delimiter_included`, the prefix itself must end in the delimiter
/// (or consume the whole string); otherwise the remainder must start with
/// it (or be empty).
fn string_prefix(string: &str, prefix: &str, delimiter: char, delimiter_included: bool) -> bool {
    let Some(tail) = string.strip_prefix(prefix) else {
        return false;
    };
    if delimiter_included {
        if prefix.is_empty() {
            return false;
        }
        if !tail.is_empty() && !prefix.ends_with(delimiter) {
            return false;
        }
    } else if !tail.is_empty() && !tail.starts_with(delimiter) {
        return false;
    }
    true
}

impl MatchRuleKeys {
    /// Parses a rule string: comma-separated `key=value` pairs, values
    /// optionally single-quoted.
    ///
    /// Inside quotes a backslash is literal and an apostrophe closes the
    /// section; outside quotes `\'` yields an apostrophe and any other
    /// backslash is literal. Whitespace and stray `=` before a key are
    /// skipped; whitespace between a key and its `=` is dropped.
    pub fn parse(rule_string: &str) -> Result<Self, MatchError> {
        let mut keys = MatchRuleKeys::default();
        let mut it = rule_string.chars().peekable();

        loop {
            // Leading whitespace and stray equal signs before the key.
            while matches!(it.peek(), Some(c) if " \t\n\r=".contains(*c)) {
                it.next();
            }
            if it.peek().is_none() {
                break;
            }

            let mut key = String::new();
            while let Some(&c) = it.peek() {
                if " \t\n\r=".contains(c) {
                    break;
                }
                key.push(c);
                it.next();
            }
            if it.peek().is_none() {
                return Err(MatchError::Invalid);
            }
            while matches!(it.peek(), Some(c) if " \t\n\r".contains(*c)) {
                it.next();
            }
            if it.next() != Some('=') {
                return Err(MatchError::Invalid);
            }

            let mut value = String::new();
            let mut quoted = false;
            loop {
                while matches!(it.peek(), Some('\'')) {
                    it.next();
                    quoted = !quoted;
                }
                match it.next() {
                    None => break,
                    Some(',') => {
                        if quoted {
                            value.push(',');
                        } else {
                            break;
                        }
                    }
                    Some('\\') => {
                        if !quoted && matches!(it.peek(), Some('\'')) {
                            it.next();
                            value.push('\'');
                        } else {
                            value.push('\\');
                        }
                    }
                    Some(c) => value.push(c),
                }
            }
            if quoted {
                return Err(MatchError::Invalid);
            }

            keys.assign(&key, value)?;
        }

        Ok(keys)
    }

    /// Renders the canonical rule string; re-parsing it yields an equal
    /// key set.
    #[must_use]
    pub fn to_rule_string(&self) -> String {
        fn quoted(value: &str) -> String {
            // An apostrophe cannot appear inside a quoted section, so it
            // is emitted between sections as an escaped literal.
            let segments: Vec<String> = value.split('\'').map(|s| format!("'{s}'")).collect();
            segments.join(r"\'")
        }

        let mut parts = Vec::new();
        if let Some(kind) = self.kind {
            parts.push(format!("type={}", quoted(kind.rule_value())));
        }
        let strings = [
            ("sender", &self.sender),
            ("destination", &self.destination),
            ("interface", &self.interface),
            ("member", &self.member),
            ("path", &self.path),
            ("path_namespace", &self.path_namespace),
            ("arg0namespace", &self.arg0namespace),
        ];
        for (key, value) in strings {
            if let Some(value) = value {
                parts.push(format!("{key}={}", quoted(value)));
            }
        }
        if self.eavesdrop {
            parts.push("eavesdrop='true'".to_owned());
        }
        for (i, value) in &self.args {
            parts.push(format!("arg{i}={}", quoted(value)));
        }
        for (i, value) in &self.argpaths {
            parts.push(format!("arg{i}path={}", quoted(value)));
        }
        parts.join(",")
    }

    fn assign(&mut self, key: &str, value: String) -> Result<(), MatchError> {
        match key {
            "type" => {
                if self.kind.is_some() {
                    return Err(MatchError::Invalid);
                }
                self.kind = Some(MessageKind::from_rule_value(&value).ok_or(MatchError::Invalid)?);
            }
            "sender" => {
                if self.sender.is_some() {
                    return Err(MatchError::Invalid);
                }
                self.sender = Some(value);
            }
            "destination" => {
                if self.destination.is_some() {
                    return Err(MatchError::Invalid);
                }
                self.destination = Some(value);
            }
            "interface" => {
                if self.interface.is_some() {
                    return Err(MatchError::Invalid);
                }
                self.interface = Some(value);
            }
            "member" => {
                if self.member.is_some() {
                    return Err(MatchError::Invalid);
                }
                self.member = Some(value);
            }
            "path" => {
                if self.path.is_some() || self.path_namespace.is_some() {
                    return Err(MatchError::Invalid);
                }
                self.path = Some(value);
            }
            "path_namespace" => {
                if self.path_namespace.is_some() || self.path.is_some() {
                    return Err(MatchError::Invalid);
                }
                self.path_namespace = Some(value);
            }
            "eavesdrop" => match value.as_str() {
                "true" => self.eavesdrop = true,
                "false" => self.eavesdrop = false,
                _ => return Err(MatchError::Invalid),
            },
            "arg0namespace" => {
                if self.arg0namespace.is_some()
                    || self.args.contains_key(&0)
                    || self.argpaths.contains_key(&0)
                {
                    return Err(MatchError::Invalid);
                }
                self.arg0namespace = Some(value);
            }
            _ => {
                let Some(rest) = key.strip_prefix("arg") else {
                    return Err(MatchError::Invalid);
                };
                // At most two digits of index, remainder selects the kind.
                let digits: String = rest.chars().take(2).take_while(char::is_ascii_digit).collect();
                let remainder = &rest[digits.len()..];
                let index: u32 = digits.parse().unwrap_or(0);

                if index == 0 && self.arg0namespace.is_some() {
                    return Err(MatchError::Invalid);
                }
                if index > u32::from(MAX_MATCH_ARG) {
                    return Err(MatchError::Invalid);
                }
                let index = index as u8;
                if self.args.contains_key(&index) || self.argpaths.contains_key(&index) {
                    return Err(MatchError::Invalid);
                }
                match remainder {
                    "" => {
                        self.args.insert(index, value);
                    }
                    "path" => {
                        self.argpaths.insert(index, value);
                    }
                    _ => return Err(MatchError::Invalid),
                }
            }
        }
        Ok(())
    }
}

/// The message-side view a rule is evaluated against.
///
/// `sender`/`destination` are `None` for driver-originated resp. broadcast
/// traffic. Only string args populate `args`; strings and object paths
/// populate `argpaths`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MatchFilter {
    pub kind: Option<MessageKind>,
    pub sender: Option<PeerId>,
    pub destination: Option<PeerId>,
    pub interface: Option<String>,
    pub member: Option<String>,
    pub path: Option<String>,
    pub args: BTreeMap<u8, String>,
    pub argpaths: BTreeMap<u8, String>,
}

impl MatchFilter {
    /// Builds the filter for a routed message.
    #[must_use]
    pub fn for_message(
        message: &Message,
        sender: Option<PeerId>,
        destination: Option<PeerId>,
    ) -> Self {
        let mut filter = MatchFilter {
            kind: Some(message.kind),
            sender,
            destination,
            interface: message.interface.clone(),
            member: message.member.clone(),
            path: message.path.clone(),
            args: BTreeMap::new(),
            argpaths: BTreeMap::new(),
        };
        for (i, arg) in message.args.iter().enumerate().take(usize::from(MAX_MATCH_ARG) + 1) {
            let i = i as u8;
            match arg {
                Arg::Str(s) => {
                    filter.args.insert(i, s.clone());
                    filter.argpaths.insert(i, s.clone());
                }
                Arg::ObjectPath(p) => {
                    filter.argpaths.insert(i, p.clone());
                }
                _ => {}
            }
        }
        filter
    }
}

/// One subscription held by a peer.
#[derive(Debug)]
pub struct MatchRule {
    pub id: RuleId,
    pub keys: MatchRuleKeys,
    /// Resolved numeric sender constraint; set when the `sender` key is a
    /// unique id (including not-yet-allocated ids parked in the wildcard
    /// registry).
    pub sender_id: Option<PeerId>,
    /// Resolved numeric destination constraint from the `destination` key.
    pub destination_id: Option<PeerId>,
    /// How many identical subscriptions coalesced into this rule.
    pub n_user_refs: u32,
    /// Registry this rule is linked into, if any. A rule whose sender is a
    /// stale unique id is tracked in its owner but linked nowhere.
    pub placement: Option<RulePlacement>,
    /// Which list of the placement registry holds the rule.
    pub list: RuleList,
    _charges: [UserCharge; 2],
}

impl MatchRule {
    /// Evaluates this rule against a message filter.
    #[must_use]
    pub fn matches(&self, filter: &MatchFilter) -> bool {
        let keys = &self.keys;
        if keys.kind.is_some() && keys.kind != filter.kind {
            return false;
        }
        if self.destination_id.is_some() && self.destination_id != filter.destination {
            return false;
        }
        if self.sender_id.is_some() && self.sender_id != filter.sender {
            return false;
        }
        if keys.interface.is_some() && keys.interface != filter.interface {
            return false;
        }
        if keys.member.is_some() && keys.member != filter.member {
            return false;
        }
        if keys.path.is_some() && keys.path != filter.path {
            return false;
        }
        if let Some(ns) = &keys.path_namespace {
            match &filter.path {
                Some(path) if string_prefix(path, ns, '/', false) => {}
                _ => return false,
            }
        }
        if let Some(ns) = &keys.arg0namespace {
            // A non-string arg0 never populates the filter, so it never
            // satisfies the namespace key.
            match filter.args.get(&0) {
                Some(arg0) if string_prefix(arg0, ns, '.', false) => {}
                _ => return false,
            }
        }
        for (i, want) in &keys.args {
            if filter.args.get(i) != Some(want) {
                return false;
            }
        }
        for (i, want) in &keys.argpaths {
            match filter.argpaths.get(i) {
                Some(have)
                    if string_prefix(have, want, '/', true)
                        || string_prefix(want, have, '/', true) => {}
                _ => return false,
            }
        }
        true
    }
}

/// Where a rule is linked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RulePlacement {
    Wildcard,
    Driver,
    Peer(PeerId),
    Name(String),
}

/// The three lists of a registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleList {
    Rules,
    Eavesdrop,
    Monitor,
}

/// A registry-side reference to a rule, resolved through its owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuleRef {
    pub owner: PeerId,
    pub rule: RuleId,
}

/// The per-target rule lists (bus wildcard, driver, per-peer, per-name).
#[derive(Debug, Default)]
pub struct MatchRegistry {
    rule_list: Vec<RuleRef>,
    eavesdrop_list: Vec<RuleRef>,
    monitor_list: Vec<RuleRef>,
}

impl MatchRegistry {
    pub(crate) fn link(&mut self, rule: RuleRef, list: RuleList) {
        match list {
            RuleList::Rules => self.rule_list.push(rule),
            RuleList::Eavesdrop => self.eavesdrop_list.push(rule),
            RuleList::Monitor => self.monitor_list.push(rule),
        }
    }

    pub(crate) fn unlink(&mut self, rule: RuleRef, list: RuleList) {
        let entries = match list {
            RuleList::Rules => &mut self.rule_list,
            RuleList::Eavesdrop => &mut self.eavesdrop_list,
            RuleList::Monitor => &mut self.monitor_list,
        };
        entries.retain(|r| *r != rule);
    }

    /// Candidate rules for a routed message, in delivery order: the
    /// eavesdrop list, then (for broadcast filters only) the plain list.
    pub fn candidates(&self, unicast: bool) -> impl Iterator<Item = RuleRef> + '_ {
        let rules = if unicast { &[] as &[RuleRef] } else { &self.rule_list[..] };
        self.eavesdrop_list.iter().chain(rules.iter()).copied()
    }

    /// Monitor rules, walked for every routed message.
    pub fn monitors(&self) -> impl Iterator<Item = RuleRef> + '_ {
        self.monitor_list.iter().copied()
    }

    /// True when no list holds any rule.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rule_list.is_empty() && self.eavesdrop_list.is_empty() && self.monitor_list.is_empty()
    }
}

/// The rules subscribed by one peer, indexed by their full key tuple.
#[derive(Debug, Default)]
pub struct MatchOwner {
    tree: BTreeMap<MatchRuleKeys, RuleId>,
    rules: HashMap<RuleId, MatchRule>,
}

/// Outcome of [`MatchOwner::ref_rule`].
#[derive(Debug)]
pub(crate) enum RefRule {
    /// A fresh rule that still needs linking into its target registry.
    New(RuleId),
    /// An identical subscription existed; its refcount was bumped.
    Coalesced(RuleId),
}

impl MatchOwner {
    /// Adds a subscription, charging `user`, coalescing duplicates.
    ///
    /// Charges are taken before the duplicate check, so quota exhaustion
    /// fails the call even for a rule the owner already holds.
    pub(crate) fn ref_rule(
        &mut self,
        id: RuleId,
        user: &User,
        rule_string: &str,
    ) -> Result<RefRule, MatchError> {
        let size = std::mem::size_of::<MatchRule>() as u64 + rule_string.len() as u64 + 1;
        let byte_charge = user.charge(UserSlot::Bytes, size)?;
        let match_charge = user.charge(UserSlot::Matches, 1)?;

        let keys = MatchRuleKeys::parse(rule_string)?;

        if let Some(&existing) = self.tree.get(&keys) {
            // Identical subscription: bump its refcount, refund ours.
            drop((byte_charge, match_charge));
            let rule = self.rules.get_mut(&existing).expect("tree entry has a rule");
            rule.n_user_refs += 1;
            return Ok(RefRule::Coalesced(existing));
        }

        let destination_id = keys
            .destination
            .as_deref()
            .and_then(|d| Address::parse(d).id());
        self.tree.insert(keys.clone(), id);
        self.rules.insert(
            id,
            MatchRule {
                id,
                keys,
                sender_id: None,
                destination_id,
                n_user_refs: 1,
                placement: None,
                list: RuleList::Rules,
                _charges: [byte_charge, match_charge],
            },
        );
        Ok(RefRule::New(id))
    }

    /// Finds the rule with exactly these keys.
    pub fn find(&self, rule_string: &str) -> Result<Option<RuleId>, MatchError> {
        let keys = MatchRuleKeys::parse(rule_string)?;
        Ok(self.tree.get(&keys).copied())
    }

    /// Removes a rule outright regardless of refcount.
    ///
    /// The tree entry is located by id: the rule's live keys may have had
    /// `eavesdrop` forced on after insertion (monitor promotion), so they
    /// no longer necessarily equal the indexed tuple.
    pub(crate) fn take(&mut self, id: RuleId) -> Option<MatchRule> {
        let rule = self.rules.remove(&id)?;
        self.tree.retain(|_, v| *v != id);
        Some(rule)
    }

    pub(crate) fn get(&self, id: RuleId) -> Option<&MatchRule> {
        self.rules.get(&id)
    }

    pub(crate) fn get_mut(&mut self, id: RuleId) -> Option<&mut MatchRule> {
        self.rules.get_mut(&id)
    }

    /// Ids of every rule, for flush and monitor conversion.
    #[must_use]
    pub fn rule_ids(&self) -> Vec<RuleId> {
        self.rules.keys().copied().collect()
    }

    /// Number of distinct rules held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// True when the owner holds no rules.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}
