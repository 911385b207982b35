//! Wire packet model shared by actions, responses and events

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::constants::{KEY_ACTION, KEY_ACTION_ID, KEY_EVENT, KEY_RESPONSE};
use crate::error::{AmiError, AmiResult};

/// Wire discriminator carried as the first key of every manager packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PacketKind {
    /// Client-initiated request.
    Action,
    /// Server reply to an action.
    Response,
    /// Asynchronous server event.
    Event,
}

impl PacketKind {
    /// Lower-case wire key for this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            PacketKind::Action => KEY_ACTION,
            PacketKind::Response => KEY_RESPONSE,
            PacketKind::Event => KEY_EVENT,
        }
    }
}

impl fmt::Display for PacketKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PacketKind::Action => "Action",
            PacketKind::Response => "Response",
            PacketKind::Event => "Event",
        };
        f.write_str(name)
    }
}

/// One manager-protocol packet: a main header plus supplementary fields.
///
/// Field keys are case-insensitive and stored lower-case; insertion order is
/// preserved so serialization is deterministic. The main header (e.g.
/// `Action: Login`) is held apart from the field list and read through
/// [`value()`](Self::value) — it can never be overwritten through
/// [`set()`](Self::set).
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    kind: PacketKind,
    value: String,
    fields: Vec<(String, String)>,
}

impl Packet {
    /// Build a packet from a main-header value and supplementary fields.
    ///
    /// Every real packet carries at least one field beyond its header, so an
    /// empty field set is rejected with [`AmiError::EmptyPacket`]. A field
    /// whose key repeats the kind discriminator is an internal error; a key
    /// repeated within `fields` keeps the last value.
    pub fn new<K, V, I>(kind: PacketKind, value: impl Into<String>, fields: I) -> AmiResult<Self>
    where
        K: AsRef<str>,
        V: Into<String>,
        I: IntoIterator<Item = (K, V)>,
    {
        let mut packet = Self {
            kind,
            value: value.into(),
            fields: Vec::new(),
        };
        for (key, value) in fields {
            let key = key.as_ref().to_lowercase();
            if key == kind.as_str() {
                return Err(AmiError::internal(format!(
                    "packet field {key:?} would shadow the main header"
                )));
            }
            packet.put(key, value.into());
        }
        if packet.fields.is_empty() {
            return Err(AmiError::EmptyPacket);
        }
        Ok(packet)
    }

    fn put(&mut self, key: String, value: String) {
        match self.fields.iter_mut().find(|(k, _)| *k == key) {
            Some((_, slot)) => *slot = value,
            None => self.fields.push((key, value)),
        }
    }

    /// Packet kind.
    pub fn kind(&self) -> PacketKind {
        self.kind
    }

    /// Main-header value (the action name, response status or event name).
    pub fn value(&self) -> &str {
        &self.value
    }

    /// Case-insensitive field lookup. The kind discriminator itself resolves
    /// to the main-header value, so `get("event")` on an event packet returns
    /// the event name.
    pub fn get(&self, key: impl AsRef<str>) -> Option<&str> {
        let key = key.as_ref().to_lowercase();
        if key == self.kind.as_str() {
            return Some(&self.value);
        }
        self.fields
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Field lookup with a default for absent keys.
    pub fn get_or<'a>(&'a self, key: impl AsRef<str>, default: &'a str) -> &'a str {
        self.get(key).unwrap_or(default)
    }

    /// Whether a field (or the main header) is present.
    pub fn contains(&self, key: impl AsRef<str>) -> bool {
        self.get(key).is_some()
    }

    /// Insert or replace a supplementary field. The value is rendered to a
    /// string; writing the main-header key is an internal error.
    pub fn set(&mut self, key: impl AsRef<str>, value: impl ToString) -> AmiResult<()> {
        let key = key.as_ref().to_lowercase();
        if key == self.kind.as_str() {
            return Err(AmiError::internal(format!(
                "cannot overwrite the main {} header",
                self.kind.as_str()
            )));
        }
        self.put(key, value.to_string());
        Ok(())
    }

    /// Supplementary `(key, value)` pairs in insertion order. The main header
    /// is not included; serialization renders it separately, first.
    pub fn fields(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Correlation id, when the packet carries one.
    pub fn action_id(&self) -> Option<&str> {
        self.get(KEY_ACTION_ID)
    }

    /// One-line summary for logging, e.g. `Action: Login (some-id)`.
    pub fn signature(&self) -> String {
        match self.action_id() {
            Some(id) => format!("{}: {} ({})", self.kind, self.value, id),
            None => format!("{}: {}", self.kind, self.value),
        }
    }
}
