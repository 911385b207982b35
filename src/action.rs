//! Action packets, responses and pending-action correlation

use std::collections::HashMap;

use tokio::sync::oneshot;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::constants::KEY_ACTION_ID;
use crate::error::{AmiError, AmiResult};
use crate::event::Event;
use crate::packet::{Packet, PacketKind};

/// Server reply to an action.
///
/// The main-header value classifies the reply: `Success`, `Error`, or
/// `Follows` (a partial reply — further events under the same id will arrive
/// before the action completes). Matching is case-insensitive.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    packet: Packet,
}

impl Response {
    /// Build a response in memory (tests, mock servers).
    pub fn new<K, V, I>(status: impl Into<String>, fields: I) -> AmiResult<Self>
    where
        K: AsRef<str>,
        V: Into<String>,
        I: IntoIterator<Item = (K, V)>,
    {
        Ok(Self::from_packet(Packet::new(
            PacketKind::Response,
            status,
            fields,
        )?))
    }

    pub(crate) fn from_packet(packet: Packet) -> Self {
        Self { packet }
    }

    /// Raw status string (the main-header value).
    pub fn status(&self) -> &str {
        self.packet.value()
    }

    /// Whether the status is `Success`.
    pub fn is_success(&self) -> bool {
        self.status().eq_ignore_ascii_case("success")
    }

    /// Whether the status is `Error`.
    pub fn is_error(&self) -> bool {
        self.status().eq_ignore_ascii_case("error")
    }

    /// Whether the status is `Follows`.
    pub fn is_follows(&self) -> bool {
        self.status().eq_ignore_ascii_case("follows")
    }

    /// The `Message` field, or an empty string when absent.
    pub fn message(&self) -> &str {
        self.packet.get_or("message", "")
    }

    /// Case-insensitive field lookup.
    pub fn get(&self, key: impl AsRef<str>) -> Option<&str> {
        self.packet.get(key)
    }

    /// Correlation id, when present.
    pub fn action_id(&self) -> Option<&str> {
        self.packet.action_id()
    }

    /// One-line summary for logging.
    pub fn signature(&self) -> String {
        self.packet.signature()
    }

    /// Underlying packet.
    pub fn packet(&self) -> &Packet {
        &self.packet
    }
}

/// Client-initiated request.
///
/// Every action carries an `ActionID`; one is generated when the caller does
/// not supply its own. Supplementary fields may still be added with
/// [`set()`](Self::set) before the action is sent.
#[derive(Debug, Clone, PartialEq)]
pub struct Action {
    packet: Packet,
    id: String,
}

impl Action {
    /// Build an action. A random unique `ActionID` is appended when `fields`
    /// does not carry one.
    pub fn new<K, V, I>(name: impl Into<String>, fields: I) -> AmiResult<Self>
    where
        K: AsRef<str>,
        V: Into<String>,
        I: IntoIterator<Item = (K, V)>,
    {
        let mut packet = Packet::new(PacketKind::Action, name, fields)?;
        if packet.get(KEY_ACTION_ID).is_none() {
            packet.set(KEY_ACTION_ID, Uuid::new_v4())?;
        }
        let id = packet
            .get(KEY_ACTION_ID)
            .map(str::to_string)
            .ok_or_else(|| AmiError::internal("action constructed without an id"))?;
        Ok(Self { packet, id })
    }

    /// The login handshake action.
    pub fn login(username: &str, secret: &str) -> AmiResult<Self> {
        Self::new("Login", [("username", username), ("secret", secret)])
    }

    /// Action name (the main-header value).
    pub fn name(&self) -> &str {
        self.packet.value()
    }

    /// Correlation id.
    pub fn action_id(&self) -> &str {
        &self.id
    }

    /// Insert or replace a supplementary field before sending. The action
    /// name and the `ActionID` cannot be changed.
    pub fn set(&mut self, key: impl AsRef<str>, value: impl ToString) -> AmiResult<()> {
        if key.as_ref().eq_ignore_ascii_case(KEY_ACTION_ID) {
            return Err(AmiError::programming(
                "the ActionID of a built action cannot be changed",
            ));
        }
        self.packet.set(key, value)
    }

    /// Case-insensitive field lookup.
    pub fn get(&self, key: impl AsRef<str>) -> Option<&str> {
        self.packet.get(key)
    }

    /// One-line summary for logging.
    pub fn signature(&self) -> String {
        self.packet.signature()
    }

    /// Underlying packet.
    pub fn packet(&self) -> &Packet {
        &self.packet
    }
}

/// Terminal outcome of a sent action.
#[derive(Debug)]
pub struct CompletedAction {
    /// `true` unless the final response classified as an error.
    pub ok: bool,
    /// The response that completed the action.
    pub response: Response,
    /// Events observed under this action's id while it was outstanding.
    pub events: Vec<Event>,
}

/// Completion signal for one sent action.
///
/// Resolves independently of any other in-flight action, as soon as the read
/// path processes the action's terminal response.
#[derive(Debug)]
pub struct ActionHandle {
    id: String,
    rx: oneshot::Receiver<AmiResult<CompletedAction>>,
}

impl ActionHandle {
    /// Correlation id of the action this handle tracks.
    pub fn action_id(&self) -> &str {
        &self.id
    }

    /// Wait for the action to complete.
    ///
    /// Returns [`AmiError::ConnectionLost`] when the connection goes down
    /// before the terminal response arrives.
    pub async fn wait(self) -> AmiResult<CompletedAction> {
        match self.rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(AmiError::ConnectionLost),
        }
    }
}

struct PendingEntry {
    name: String,
    events: Vec<Event>,
    tx: oneshot::Sender<AmiResult<CompletedAction>>,
}

/// Table of in-flight actions keyed by correlation id.
///
/// State per entry: pending until a response arrives; a `Follows` response
/// keeps the entry open and accumulating events; the first non-`Follows`
/// response removes the entry and resolves its handle. Removal-on-completion
/// makes double resolution structurally impossible.
#[derive(Default)]
pub(crate) struct PendingActions {
    entries: HashMap<String, PendingEntry>,
}

impl PendingActions {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Register an action and hand back its completion signal. A duplicate id
    /// is caller misuse.
    pub(crate) fn register(&mut self, action: &Action) -> AmiResult<ActionHandle> {
        let id = action.action_id().to_string();
        if self.entries.contains_key(&id) {
            return Err(AmiError::programming(format!(
                "an action with id {id} is already pending"
            )));
        }
        let (tx, rx) = oneshot::channel();
        self.entries.insert(
            id.clone(),
            PendingEntry {
                name: action.name().to_string(),
                events: Vec::new(),
                tx,
            },
        );
        Ok(ActionHandle { id, rx })
    }

    /// Drop a registration whose action never reached the wire.
    pub(crate) fn remove(&mut self, id: &str) {
        self.entries.remove(id);
    }

    /// Route a response to its pending action. Returns `false` when the
    /// response carries no id or no matching entry exists.
    pub(crate) fn handle_response(&mut self, response: Response) -> bool {
        let Some(id) = response.action_id().map(str::to_string) else {
            return false;
        };
        if !self.entries.contains_key(&id) {
            return false;
        }
        if response.is_follows() {
            debug!(
                "action {id} response follows, holding open for trailing events"
            );
            return true;
        }
        let Some(entry) = self.entries.remove(&id) else {
            return false;
        };
        let ok = !response.is_error();
        let completed = CompletedAction {
            ok,
            response,
            events: entry.events,
        };
        if entry.tx.send(Ok(completed)).is_err() {
            debug!("action {} ({id}) completed but its handle was dropped", entry.name);
        }
        true
    }

    /// Append an event to the open action it belongs to. Returns `false` when
    /// the event carries no id or no matching entry exists.
    pub(crate) fn handle_event(&mut self, event: &Event) -> bool {
        let Some(id) = event.action_id() else {
            return false;
        };
        match self.entries.get_mut(id) {
            Some(entry) => {
                entry.events.push(event.clone());
                true
            }
            None => false,
        }
    }

    /// Fail every outstanding action with [`AmiError::ConnectionLost`].
    /// Called on teardown so no waiter hangs on a dead connection.
    pub(crate) fn fail_all(&mut self) {
        if self.entries.is_empty() {
            return;
        }
        warn!(
            "failing {} pending action(s): connection lost",
            self.entries.len()
        );
        for (_, entry) in self.entries.drain() {
            let _ = entry.tx.send(Err(AmiError::ConnectionLost));
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}
