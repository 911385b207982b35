//! Manager wire protocol: greeting, framing, parsing and serialization

use std::fmt;

use tracing::{trace, warn};

use crate::action::Response;
use crate::buffer::PacketBuffer;
use crate::constants::{
    KEY_EVENT, KEY_RESPONSE, LINE_TERMINATOR, MAX_SIGNATURE_LEN, PACKET_TERMINATOR,
};
use crate::error::{AmiError, AmiResult};
use crate::event::{Event, EventRegistry};
use crate::packet::{Packet, PacketKind};

/// Remote server identity parsed from the greeting line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerSignature {
    /// The greeting line as received.
    pub raw: String,
    /// Product name before the first `/`.
    pub name: String,
    /// Version after the first `/`, when present.
    pub version: Option<String>,
}

impl fmt::Display for ServerSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.version {
            Some(version) => write!(f, "{} v{}", self.name, version),
            None => f.write_str(&self.raw),
        }
    }
}

/// Parse the single-line server greeting, e.g. `Asterisk Call Manager/5.0.1`.
///
/// Rejected when it spans more than one line or exceeds 200 bytes.
pub fn parse_server_signature(content: &[u8]) -> AmiResult<ServerSignature> {
    let trimmed = content.trim_ascii();
    if trimmed.is_empty() || trimmed.len() > MAX_SIGNATURE_LEN {
        return Err(AmiError::protocol(format!(
            "malformed server greeting ({} bytes)",
            trimmed.len()
        )));
    }
    if trimmed.contains(&b'\r') || trimmed.contains(&b'\n') {
        return Err(AmiError::protocol(
            "malformed server greeting: expected a single line",
        ));
    }
    let raw = std::str::from_utf8(trimmed)
        .map_err(|_| AmiError::protocol("server greeting is not valid UTF-8"))?
        .to_string();
    let (name, version) = match raw.split_once('/') {
        Some((name, version)) => (name.to_string(), Some(version.to_string())),
        None => (raw.clone(), None),
    };
    Ok(ServerSignature { raw, name, version })
}

/// Incoming packet: the server only ever sends responses and events.
#[derive(Debug, Clone)]
pub enum IncomingPacket {
    /// Reply to a sent action.
    Response(Response),
    /// Asynchronous event.
    Event(Event),
}

impl IncomingPacket {
    /// Correlation id, when the packet carries one.
    pub fn action_id(&self) -> Option<&str> {
        match self {
            IncomingPacket::Response(response) => response.action_id(),
            IncomingPacket::Event(event) => event.action_id(),
        }
    }

    /// One-line summary for logging.
    pub fn signature(&self) -> String {
        match self {
            IncomingPacket::Response(response) => response.signature(),
            IncomingPacket::Event(event) => event.signature(),
        }
    }
}

/// Streaming protocol parser owning the receive buffer.
///
/// Feed raw socket bytes with [`add_data()`](Self::add_data), then drain
/// complete packets with [`parse_packet()`](Self::parse_packet) until it
/// returns `Ok(None)`. Chunk boundaries are irrelevant: any split of the byte
/// stream yields the same packet sequence.
#[derive(Debug, Default)]
pub struct Parser {
    buffer: PacketBuffer,
}

impl Parser {
    /// Create a parser with an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append raw bytes from the socket.
    pub fn add_data(&mut self, data: &[u8]) -> AmiResult<()> {
        self.buffer.extend_from_slice(data);
        self.buffer.check_size_limits()
    }

    /// Unconsumed byte count (used to bound the greeting read).
    pub(crate) fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// Extract the greeting line once fully buffered, leaving any trailing
    /// bytes for packet parsing.
    pub(crate) fn take_signature_line(&mut self) -> Option<Vec<u8>> {
        let line = self.buffer.extract_until_pattern(LINE_TERMINATOR)?;
        self.buffer.compact();
        Some(line)
    }

    /// Try to parse one complete packet from the buffer.
    pub fn parse_packet(&mut self, registry: &EventRegistry) -> AmiResult<Option<IncomingPacket>> {
        let Some(frame) = self.buffer.extract_until_pattern(PACKET_TERMINATOR) else {
            return Ok(None);
        };
        self.buffer.compact();
        parse_frame(&frame, registry).map(Some)
    }
}

/// Parse one terminator-delimited frame into a packet.
///
/// Lines split on the first `:` with surrounding whitespace trimmed; lines
/// without a colon are logged and dropped. The first key selects the packet
/// kind; anything other than `Response`/`Event` is rejected.
pub fn parse_frame(frame: &[u8], registry: &EventRegistry) -> AmiResult<IncomingPacket> {
    let mut entries: Vec<(String, String)> = Vec::new();
    for line in frame.split(|&b| b == b'\n') {
        let Ok(line) = std::str::from_utf8(line) else {
            warn!("dropping non-UTF-8 line in incoming packet");
            continue;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Some((key, value)) = line.split_once(':') else {
            warn!("dropping unparsable line {line:?} in incoming packet");
            continue;
        };
        entries.push((key.trim().to_string(), value.trim().to_string()));
    }

    if entries.is_empty() {
        return Err(AmiError::EmptyPacket);
    }
    let (first_key, main_value) = entries.remove(0);
    trace!("parsing incoming {first_key}: {main_value}");

    match first_key.to_lowercase().as_str() {
        KEY_RESPONSE => {
            let packet = Packet::new(PacketKind::Response, main_value, entries)?;
            Ok(IncomingPacket::Response(Response::from_packet(packet)))
        }
        KEY_EVENT => {
            let packet = Packet::new(PacketKind::Event, main_value, entries)?;
            let mut event = Event::from_packet(packet);
            if let Some(schema) = registry.lookup(event.name()) {
                event.apply_schema(schema, registry.missing_policy())?;
            }
            Ok(IncomingPacket::Event(event))
        }
        other => Err(AmiError::UnsupportedPacketType {
            packet_type: other.to_string(),
        }),
    }
}

/// Serialize an outgoing packet: main header first, then fields in insertion
/// order, keys capitalized, lines joined with `\r\n`. The caller appends the
/// packet terminator.
pub fn serialize_packet(packet: &Packet) -> Vec<u8> {
    let mut lines = Vec::with_capacity(1 + packet.fields().count());
    lines.push(format!("{}: {}", packet.kind(), packet.value()));
    for (key, value) in packet.fields() {
        lines.push(format!("{}: {}", capitalize_key(key), value));
    }
    lines.join("\r\n").into_bytes()
}

fn capitalize_key(key: &str) -> String {
    let mut chars = key.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
