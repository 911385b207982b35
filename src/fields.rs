//! Typed well-known field names for manager events.

/// Error returned when parsing an unrecognized event field name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseEventFieldError(pub String);

impl std::fmt::Display for ParseEventFieldError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "unknown event field: {}", self.0)
    }
}

impl std::error::Error for ParseEventFieldError {}

define_header_enum! {
    error_type: ParseEventFieldError,
    /// Field names that appear across most channel-related manager events.
    ///
    /// These are the fields of the parsed event itself (not the framing
    /// discriminators like `Event` or `ActionID`). Anything accepting
    /// `impl AsRef<str>` — [`Event::get()`](crate::event::Event::get), the
    /// filter builder — takes them directly.
    pub enum EventField {
        Channel => "Channel",
        ChannelState => "ChannelState",
        ChannelStateDesc => "ChannelStateDesc",
        CallerIdNum => "CallerIDNum",
        CallerIdName => "CallerIDName",
        ConnectedLineNum => "ConnectedLineNum",
        ConnectedLineName => "ConnectedLineName",
        Language => "Language",
        AccountCode => "AccountCode",
        Context => "Context",
        Exten => "Exten",
        Priority => "Priority",
        Uniqueid => "Uniqueid",
        Linkedid => "Linkedid",
        DestChannel => "DestChannel",
        DestUniqueid => "DestUniqueid",
        DialString => "DialString",
        DialStatus => "DialStatus",
        Cause => "Cause",
        CauseTxt => "Cause-txt",
        Queue => "Queue",
        Interface => "Interface",
        MemberName => "MemberName",
        Variable => "Variable",
        Value => "Value",
    }
}
