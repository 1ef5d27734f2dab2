//! Protocol constants: bus names, interfaces, wire error names, and the
//! numeric flag/reply codes of the driver's name-management calls.

/// The driver's reserved bus name.
pub const DRIVER_NAME: &str = "org.freedesktop.DBus";
/// The driver's object path.
pub const DRIVER_PATH: &str = "/org/freedesktop/DBus";

/// Core driver interface.
pub const INTERFACE_DBUS: &str = "org.freedesktop.DBus";
/// Monitoring interface (`BecomeMonitor`).
pub const INTERFACE_MONITORING: &str = "org.freedesktop.DBus.Monitoring";
/// Liveness interface (`Ping`).
pub const INTERFACE_PEER: &str = "org.freedesktop.DBus.Peer";
/// Introspection interface.
pub const INTERFACE_INTROSPECTABLE: &str = "org.freedesktop.DBus.Introspectable";

// Driver signal members.
pub const SIG_NAME_OWNER_CHANGED: &str = "NameOwnerChanged";
pub const SIG_NAME_ACQUIRED: &str = "NameAcquired";
pub const SIG_NAME_LOST: &str = "NameLost";

// Wire error names.
pub const ERR_NAME_HAS_NO_OWNER: &str = "org.freedesktop.DBus.Error.NameHasNoOwner";
pub const ERR_ACCESS_DENIED: &str = "org.freedesktop.DBus.Error.AccessDenied";
pub const ERR_LIMITS_EXCEEDED: &str = "org.freedesktop.DBus.Error.LimitsExceeded";
pub const ERR_INVALID_ARGS: &str = "org.freedesktop.DBus.Error.InvalidArgs";
pub const ERR_MATCH_RULE_INVALID: &str = "org.freedesktop.DBus.Error.MatchRuleInvalid";
pub const ERR_MATCH_RULE_NOT_FOUND: &str = "org.freedesktop.DBus.Error.MatchRuleNotFound";
pub const ERR_NOT_SUPPORTED: &str = "org.freedesktop.DBus.Error.NotSupported";
pub const ERR_TIMEOUT: &str = "org.freedesktop.DBus.Error.Timeout";
pub const ERR_NO_REPLY: &str = "org.freedesktop.DBus.Error.NoReply";
pub const ERR_SERVICE_UNKNOWN: &str = "org.freedesktop.DBus.Error.ServiceUnknown";
pub const ERR_UNKNOWN_METHOD: &str = "org.freedesktop.DBus.Error.UnknownMethod";
pub const ERR_FAILED: &str = "org.freedesktop.DBus.Error.Failed";

// RequestName flag bits.
pub const NAME_FLAG_ALLOW_REPLACEMENT: u32 = 0x1;
pub const NAME_FLAG_REPLACE_EXISTING: u32 = 0x2;
pub const NAME_FLAG_DO_NOT_QUEUE: u32 = 0x4;

// RequestName reply codes.
pub const REQUEST_NAME_REPLY_PRIMARY_OWNER: u32 = 1;
pub const REQUEST_NAME_REPLY_IN_QUEUE: u32 = 2;
pub const REQUEST_NAME_REPLY_EXISTS: u32 = 3;
pub const REQUEST_NAME_REPLY_ALREADY_OWNER: u32 = 4;

// ReleaseName reply codes.
pub const RELEASE_NAME_REPLY_RELEASED: u32 = 1;
pub const RELEASE_NAME_REPLY_NON_EXISTENT: u32 = 2;
pub const RELEASE_NAME_REPLY_NOT_OWNER: u32 = 3;

// StartServiceByName reply codes.
pub const START_REPLY_SUCCESS: u32 = 1;
pub const START_REPLY_ALREADY_RUNNING: u32 = 2;
