//! Error types for the manager client

use std::io;
use thiserror::Error;

/// Crate-wide result alias.
pub type AmiResult<T> = Result<T, AmiError>;

/// Errors produced by the manager client.
///
/// Variants fall into four classes:
/// - caller misuse ([`Programming`](Self::Programming), [`NotConnected`](Self::NotConnected)) —
///   fixed in code, never retried;
/// - malformed wire data ([`Protocol`](Self::Protocol), [`UnsupportedPacketType`](Self::UnsupportedPacketType),
///   [`EmptyPacket`](Self::EmptyPacket), [`MissingEventField`](Self::MissingEventField),
///   [`InvalidEventField`](Self::InvalidEventField)) — the offending frame is rejected;
/// - environment and remote failures ([`Connect`](Self::Connect), [`ConnectTimeout`](Self::ConnectTimeout),
///   [`Authentication`](Self::Authentication), [`ConnectionClosed`](Self::ConnectionClosed),
///   [`ConnectionLost`](Self::ConnectionLost), [`Io`](Self::Io), [`QueueFull`](Self::QueueFull));
/// - broken internal invariants ([`Internal`](Self::Internal)) — defects, kept distinct so they
///   are never mistaken for ordinary run errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum AmiError {
    /// Incorrect client usage, e.g. sending an action whose id is already pending.
    #[error("programming error: {message}")]
    Programming {
        /// What the caller did wrong.
        message: String,
    },

    /// Operation requires an established connection.
    #[error("client is not connected")]
    NotConnected,

    /// Malformed wire data.
    #[error("protocol error: {message}")]
    Protocol {
        /// What was wrong with the data.
        message: String,
    },

    /// The first key of an incoming packet is neither `Response` nor `Event`.
    #[error("unsupported incoming packet type: {packet_type}")]
    UnsupportedPacketType {
        /// The offending discriminator, lower-cased.
        packet_type: String,
    },

    /// A packet must carry at least one field beyond its main header.
    #[error("cannot build a packet without fields")]
    EmptyPacket,

    /// A registered event schema declares the field as required but the event lacks it.
    #[error("event {event} is missing required field {field}")]
    MissingEventField {
        /// Event name.
        event: String,
        /// Declared field name.
        field: String,
    },

    /// A declared event field could not be converted to its schema type.
    #[error("event {event} field {field} has unconvertible value {value:?}")]
    InvalidEventField {
        /// Event name.
        event: String,
        /// Declared field name.
        field: String,
        /// The raw wire value.
        value: String,
    },

    /// TCP connection could not be established.
    #[error("connection to {host}:{port} failed: {source}")]
    Connect {
        /// Remote host.
        host: String,
        /// Remote port.
        port: u16,
        /// Underlying OS error.
        #[source]
        source: io::Error,
    },

    /// TCP connection attempt exceeded the configured timeout.
    #[error("connection to {host}:{port} timed out after {timeout_ms}ms")]
    ConnectTimeout {
        /// Remote host.
        host: String,
        /// Remote port.
        port: u16,
        /// The timeout that elapsed.
        timeout_ms: u64,
    },

    /// The server rejected the login action.
    #[error("authentication failed: {message}")]
    Authentication {
        /// The server's message field.
        message: String,
    },

    /// The remote server closed the connection.
    #[error("connection closed by remote server")]
    ConnectionClosed,

    /// The connection went down while an action was still pending.
    #[error("connection lost while the action was pending")]
    ConnectionLost,

    /// Events were dropped because the event queue was full.
    #[error("event queue full, events were dropped")]
    QueueFull,

    /// Socket-level I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Broken internal invariant.
    #[error("internal error: {message}")]
    Internal {
        /// Which invariant broke.
        message: String,
    },
}

impl AmiError {
    /// Build a [`Protocol`](Self::Protocol) error.
    pub(crate) fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Build a [`Programming`](Self::Programming) error.
    pub(crate) fn programming(message: impl Into<String>) -> Self {
        Self::Programming {
            message: message.into(),
        }
    }

    /// Build an [`Internal`](Self::Internal) error.
    pub(crate) fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}
