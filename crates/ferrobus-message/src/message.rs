//! Parsed message representation.

use serde::{Deserialize, Serialize};

/// The four D-Bus message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    MethodCall,
    MethodReturn,
    Error,
    Signal,
}

impl MessageKind {
    /// Parses the `type=` value of a match rule.
    #[must_use]
    pub fn from_rule_value(s: &str) -> Option<Self> {
        match s {
            "method_call" => Some(Self::MethodCall),
            "method_return" => Some(Self::MethodReturn),
            "error" => Some(Self::Error),
            "signal" => Some(Self::Signal),
            _ => None,
        }
    }

    /// The `type=` value naming this kind in a match rule.
    #[must_use]
    pub fn rule_value(self) -> &'static str {
        match self {
            Self::MethodCall => "method_call",
            Self::MethodReturn => "method_return",
            Self::Error => "error",
            Self::Signal => "signal",
        }
    }
}

/// Header flags relevant to routing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageFlags {
    /// The caller does not want a method return.
    #[serde(default)]
    pub no_reply_expected: bool,
    /// Do not start a service to handle this message.
    #[serde(default)]
    pub no_auto_start: bool,
}

/// One typed body argument.
///
/// The codec surfaces only the shapes routing and the driver care about:
/// strings and object paths participate in match-rule `argN`/`argNpath`
/// filtering, the scalar shapes carry driver call parameters, and
/// [`Arg::Map`] carries structured driver replies such as connection
/// credentials.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Arg {
    Str(String),
    ObjectPath(String),
    U32(u32),
    Bool(bool),
    StrList(Vec<String>),
    Map(serde_json::Value),
}

impl Arg {
    /// Returns the string value for [`Arg::Str`].
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Arg::Str(s) => Some(s),
            _ => None,
        }
    }
}

/// A parsed message as consumed and produced by the broker core.
///
/// `sender` is stamped by the broker on ingress; peers cannot spoof it.
/// `serial` is the sender-scoped cookie used to correlate replies; the
/// broker never interprets it beyond reply tracking (serial 0 is reserved
/// and never matches an outstanding call).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub kind: MessageKind,
    pub serial: u32,
    #[serde(default)]
    pub flags: MessageFlags,
    #[serde(default)]
    pub sender: Option<String>,
    #[serde(default)]
    pub destination: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub interface: Option<String>,
    #[serde(default)]
    pub member: Option<String>,
    #[serde(default)]
    pub error_name: Option<String>,
    #[serde(default)]
    pub reply_serial: Option<u32>,
    #[serde(default)]
    pub signature: Option<String>,
    #[serde(default)]
    pub args: Vec<Arg>,
}

impl Message {
    /// Creates a method call addressed to `destination`.
    #[must_use]
    pub fn method_call(
        serial: u32,
        destination: impl Into<String>,
        path: impl Into<String>,
        interface: impl Into<String>,
        member: impl Into<String>,
    ) -> Self {
        Self {
            kind: MessageKind::MethodCall,
            serial,
            flags: MessageFlags::default(),
            sender: None,
            destination: Some(destination.into()),
            path: Some(path.into()),
            interface: Some(interface.into()),
            member: Some(member.into()),
            error_name: None,
            reply_serial: None,
            signature: None,
            args: Vec::new(),
        }
    }

    /// Creates a method return answering `reply_serial` at `destination`.
    #[must_use]
    pub fn method_return(serial: u32, reply_serial: u32, destination: impl Into<String>) -> Self {
        Self {
            kind: MessageKind::MethodReturn,
            serial,
            flags: MessageFlags {
                no_reply_expected: true,
                no_auto_start: false,
            },
            sender: None,
            destination: Some(destination.into()),
            path: None,
            interface: None,
            member: None,
            error_name: None,
            reply_serial: Some(reply_serial),
            signature: None,
            args: Vec::new(),
        }
    }

    /// Creates an error reply answering `reply_serial` at `destination`.
    #[must_use]
    pub fn error(
        serial: u32,
        reply_serial: u32,
        destination: impl Into<String>,
        error_name: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            kind: MessageKind::Error,
            serial,
            flags: MessageFlags {
                no_reply_expected: true,
                no_auto_start: false,
            },
            sender: None,
            destination: Some(destination.into()),
            path: None,
            interface: None,
            member: None,
            error_name: Some(error_name.into()),
            reply_serial: Some(reply_serial),
            signature: None,
            args: vec![Arg::Str(text.into())],
        }
    }

    /// Creates a broadcast signal.
    #[must_use]
    pub fn signal(
        serial: u32,
        path: impl Into<String>,
        interface: impl Into<String>,
        member: impl Into<String>,
    ) -> Self {
        Self {
            kind: MessageKind::Signal,
            serial,
            flags: MessageFlags {
                no_reply_expected: true,
                no_auto_start: false,
            },
            sender: None,
            destination: None,
            path: Some(path.into()),
            interface: Some(interface.into()),
            member: Some(member.into()),
            error_name: None,
            reply_serial: None,
            signature: None,
            args: Vec::new(),
        }
    }

    /// Sets the body arguments.
    #[must_use]
    pub fn with_args(mut self, args: Vec<Arg>) -> Self {
        self.args = args;
        self
    }

    /// Sets the sender field.
    #[must_use]
    pub fn with_sender(mut self, sender: impl Into<String>) -> Self {
        self.sender = Some(sender.into());
        self
    }

    /// Sets the unicast destination.
    #[must_use]
    pub fn with_destination(mut self, destination: impl Into<String>) -> Self {
        self.destination = Some(destination.into());
        self
    }

    /// Marks the call as not expecting a reply.
    #[must_use]
    pub fn without_reply(mut self) -> Self {
        self.flags.no_reply_expected = true;
        self
    }

    /// Whether a reply slot must be tracked for this message.
    #[must_use]
    pub fn expects_reply(&self) -> bool {
        self.kind == MessageKind::MethodCall && !self.flags.no_reply_expected
    }

    /// Body argument `i` as a string, for `Str` args.
    #[must_use]
    pub fn arg_str(&self, i: usize) -> Option<&str> {
        self.args.get(i).and_then(Arg::as_str)
    }

    /// Body argument `i` as a u32.
    #[must_use]
    pub fn arg_u32(&self, i: usize) -> Option<u32> {
        match self.args.get(i) {
            Some(Arg::U32(v)) => Some(*v),
            _ => None,
        }
    }

    /// Body argument `i` as a string list.
    #[must_use]
    pub fn arg_str_list(&self, i: usize) -> Option<&[String]> {
        match self.args.get(i) {
            Some(Arg::StrList(v)) => Some(v),
            _ => None,
        }
    }
}
