//! Protocol constants and configuration values

/// Default Asterisk manager port for client connections
pub const DEFAULT_AMI_PORT: u16 = 5038;

/// Socket buffer size for reading from TCP stream (64KB) - standard TCP receive window
pub const SOCKET_BUF_SIZE: usize = 65536;

/// Maximum total receive buffer size (16MB) - safety limit to prevent runaway memory.
/// AMI packets are small; exceeding this indicates a desynced or hostile peer.
pub const MAX_BUFFER_SIZE: usize = 16 * 1024 * 1024;

/// Protocol packet terminator
pub const PACKET_TERMINATOR: &[u8] = b"\r\n\r\n";
/// Protocol line terminator
pub const LINE_TERMINATOR: &[u8] = b"\r\n";

/// Maximum length of the server greeting line in bytes
pub const MAX_SIGNATURE_LEN: usize = 200;

/// Wire discriminator: client-initiated action (the first key of every packet,
/// compared lower-case).
pub const KEY_ACTION: &str = "action";
/// Wire discriminator: server reply to an action.
pub const KEY_RESPONSE: &str = "response";
/// Wire discriminator: asynchronous server event.
pub const KEY_EVENT: &str = "event";
/// Correlation field linking an action to its responses and events.
pub const KEY_ACTION_ID: &str = "actionid";

/// Default connection timeout in milliseconds
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5000;

/// Maximum number of queued events before dropping
pub const MAX_EVENT_QUEUE_SIZE: usize = 1000;
