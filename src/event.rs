//! Event packets and the named-event schema registry

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{AmiError, AmiResult};
use crate::packet::{Packet, PacketKind};

/// Asynchronous server event.
///
/// Every event exposes its raw string fields through [`get()`](Self::get).
/// When an [`EventRegistry`] schema matches the event name, declared fields
/// are additionally coerced to their primitive types and readable through
/// [`typed()`](Self::typed) / [`int_field()`](Self::int_field) /
/// [`bool_field()`](Self::bool_field).
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    packet: Packet,
    typed: HashMap<String, FieldValue>,
    schema_name: Option<String>,
}

impl Event {
    /// Build an event in memory (handler tests, filter evaluation).
    pub fn new<K, V, I>(name: impl Into<String>, fields: I) -> AmiResult<Self>
    where
        K: AsRef<str>,
        V: Into<String>,
        I: IntoIterator<Item = (K, V)>,
    {
        Ok(Self::from_packet(Packet::new(
            PacketKind::Event,
            name,
            fields,
        )?))
    }

    pub(crate) fn from_packet(packet: Packet) -> Self {
        Self {
            packet,
            typed: HashMap::new(),
            schema_name: None,
        }
    }

    /// Event name (the main-header value).
    pub fn name(&self) -> &str {
        self.packet.value()
    }

    /// Case-insensitive raw field lookup.
    pub fn get(&self, key: impl AsRef<str>) -> Option<&str> {
        self.packet.get(key)
    }

    /// Whether a field is present.
    pub fn contains(&self, key: impl AsRef<str>) -> bool {
        self.packet.contains(key)
    }

    /// Correlation id, when this event belongs to an action.
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

    /// Name of the registry schema that matched this event, if any.
    pub fn schema_name(&self) -> Option<&str> {
        self.schema_name.as_deref()
    }

    /// Coerced value of a schema-declared field.
    ///
    /// Fields absent from the wire but declared optional carry the registry's
    /// placeholder: an empty string under
    /// [`MissingOptional::EmptyString`], [`FieldValue::Absent`] under
    /// [`MissingOptional::Marker`].
    pub fn typed(&self, key: impl AsRef<str>) -> Option<&FieldValue> {
        self.typed.get(&key.as_ref().to_lowercase())
    }

    /// Coerced integer value of a schema-declared field.
    pub fn int_field(&self, key: impl AsRef<str>) -> Option<i64> {
        match self.typed(key) {
            Some(FieldValue::Int(n)) => Some(*n),
            _ => None,
        }
    }

    /// Coerced boolean value of a schema-declared field.
    pub fn bool_field(&self, key: impl AsRef<str>) -> Option<bool> {
        match self.typed(key) {
            Some(FieldValue::Bool(b)) => Some(*b),
            _ => None,
        }
    }

    /// Coerce fields declared by `schema`, recording the result in the typed
    /// map. Missing required fields and unconvertible values reject the whole
    /// event.
    pub(crate) fn apply_schema(
        &mut self,
        schema: &EventSchema,
        missing: MissingOptional,
    ) -> AmiResult<()> {
        for spec in &schema.fields {
            let value = match self.packet.get(&spec.name) {
                Some(raw) => spec.ty.coerce(raw).ok_or_else(|| AmiError::InvalidEventField {
                    event: self.name().to_string(),
                    field: spec.name.clone(),
                    value: raw.to_string(),
                })?,
                None if spec.required => {
                    return Err(AmiError::MissingEventField {
                        event: self.name().to_string(),
                        field: spec.name.clone(),
                    })
                }
                None => match missing {
                    MissingOptional::EmptyString => FieldValue::Str(String::new()),
                    MissingOptional::Marker => FieldValue::Absent,
                },
            };
            self.typed.insert(spec.name.clone(), value);
        }
        self.schema_name = Some(schema.name.clone());
        Ok(())
    }
}

/// Primitive type a schema field is coerced to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FieldType {
    /// Kept as-is.
    Str,
    /// Parsed as a signed 64-bit integer.
    Int,
    /// Parsed from the usual wire spellings (`yes`/`no`, `true`/`false`,
    /// `on`/`off`, `1`/`0`, case-insensitive).
    Bool,
}

impl FieldType {
    fn coerce(&self, raw: &str) -> Option<FieldValue> {
        match self {
            FieldType::Str => Some(FieldValue::Str(raw.to_string())),
            FieldType::Int => raw.trim().parse::<i64>().ok().map(FieldValue::Int),
            FieldType::Bool => match raw.trim().to_lowercase().as_str() {
                "true" | "yes" | "on" | "1" => Some(FieldValue::Bool(true)),
                "false" | "no" | "off" | "0" => Some(FieldValue::Bool(false)),
                _ => None,
            },
        }
    }
}

/// Coerced field value.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    /// String field.
    Str(String),
    /// Integer field.
    Int(i64),
    /// Boolean field.
    Bool(bool),
    /// Optional field absent from the wire (under [`MissingOptional::Marker`]).
    Absent,
}

impl FieldValue {
    /// String content, if this is a string value.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Whether this is the absent-field marker.
    pub fn is_absent(&self) -> bool {
        matches!(self, FieldValue::Absent)
    }
}

#[derive(Debug, Clone)]
struct FieldSpec {
    name: String,
    ty: FieldType,
    required: bool,
}

/// Declared shape of a named event: an ordered set of typed fields.
#[derive(Debug, Clone)]
pub struct EventSchema {
    name: String,
    fields: Vec<FieldSpec>,
}

impl EventSchema {
    /// Start a schema for the given event name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: Vec::new(),
        }
    }

    /// Declare a field that must be present on the wire.
    pub fn required(mut self, name: impl AsRef<str>, ty: FieldType) -> Self {
        self.fields.push(FieldSpec {
            name: name.as_ref().to_lowercase(),
            ty,
            required: true,
        });
        self
    }

    /// Declare a field that may be absent.
    pub fn optional(mut self, name: impl AsRef<str>, ty: FieldType) -> Self {
        self.fields.push(FieldSpec {
            name: name.as_ref().to_lowercase(),
            ty,
            required: false,
        });
        self
    }

    /// Event name this schema describes.
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Placeholder policy for declared-optional fields absent from the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MissingOptional {
    /// Read back as an empty string.
    #[default]
    EmptyString,
    /// Read back as the distinguished [`FieldValue::Absent`] marker.
    Marker,
}

/// Lookup table from lower-cased event name to its declared schema.
///
/// The registry starts empty — which event names carry which typed fields is
/// the consumer's knowledge, not the protocol engine's.
#[derive(Debug, Clone, Default)]
pub struct EventRegistry {
    schemas: HashMap<String, EventSchema>,
    missing: MissingOptional,
}

impl EventRegistry {
    /// Empty registry with the default placeholder policy.
    pub fn new() -> Self {
        Self::default()
    }

    /// Empty registry with an explicit placeholder policy.
    pub fn with_missing_policy(missing: MissingOptional) -> Self {
        Self {
            schemas: HashMap::new(),
            missing,
        }
    }

    /// Register a schema, replacing any previous one for the same name.
    pub fn register(&mut self, schema: EventSchema) {
        self.schemas.insert(schema.name.to_lowercase(), schema);
    }

    /// Look up the schema for an event name (case-insensitive).
    pub fn lookup(&self, name: &str) -> Option<&EventSchema> {
        self.schemas.get(&name.to_lowercase())
    }

    /// Placeholder policy applied during coercion.
    pub fn missing_policy(&self) -> MissingOptional {
        self.missing
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fields::EventField;

    fn dial_end() -> Event {
        Event::new(
            "DialEnd",
            [
                ("Channel", "SIP/100-1"),
                ("Priority", "3"),
                ("Forwarded", "Yes"),
            ],
        )
        .unwrap()
    }

    fn dial_end_schema() -> EventSchema {
        EventSchema::new("DialEnd")
            .required("channel", FieldType::Str)
            .required("priority", FieldType::Int)
            .optional("forwarded", FieldType::Bool)
            .optional("dialstatus", FieldType::Str)
    }

    #[test]
    fn test_schema_coercion() {
        let mut event = dial_end();
        event
            .apply_schema(&dial_end_schema(), MissingOptional::EmptyString)
            .unwrap();

        assert_eq!(event.schema_name(), Some("DialEnd"));
        assert_eq!(
            event.typed(EventField::Channel),
            Some(&FieldValue::Str("SIP/100-1".to_string()))
        );
        assert_eq!(event.int_field(EventField::Priority), Some(3));
        assert_eq!(event.bool_field("Forwarded"), Some(true));
        // Raw access still works alongside the typed view
        assert_eq!(event.get("priority"), Some("3"));
        assert_eq!(event.get(EventField::Channel), Some("SIP/100-1"));
    }

    #[test]
    fn test_missing_optional_empty_string_policy() {
        let mut event = dial_end();
        event
            .apply_schema(&dial_end_schema(), MissingOptional::EmptyString)
            .unwrap();
        assert_eq!(
            event.typed("dialstatus"),
            Some(&FieldValue::Str(String::new()))
        );
        // The placeholder lives in the typed view only
        assert_eq!(event.get("dialstatus"), None);
    }

    #[test]
    fn test_missing_optional_marker_policy() {
        let mut event = dial_end();
        event
            .apply_schema(&dial_end_schema(), MissingOptional::Marker)
            .unwrap();
        assert!(event.typed("dialstatus").unwrap().is_absent());
    }

    #[test]
    fn test_missing_required_field_rejected() {
        let mut event = Event::new("DialEnd", [("Priority", "3")]).unwrap();
        let err = event
            .apply_schema(&dial_end_schema(), MissingOptional::EmptyString)
            .unwrap_err();
        match err {
            AmiError::MissingEventField { event, field } => {
                assert_eq!(event, "DialEnd");
                assert_eq!(field, "channel");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_unconvertible_field_rejected() {
        let mut event = Event::new(
            "DialEnd",
            [("Channel", "SIP/100-1"), ("Priority", "three")],
        )
        .unwrap();
        let err = event
            .apply_schema(&dial_end_schema(), MissingOptional::EmptyString)
            .unwrap_err();
        match err {
            AmiError::InvalidEventField { event, field, value } => {
                assert_eq!(event, "DialEnd");
                assert_eq!(field, "priority");
                assert_eq!(value, "three");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_registry_lookup_is_case_insensitive() {
        let mut registry = EventRegistry::new();
        registry.register(dial_end_schema());
        assert!(registry.lookup("dialend").is_some());
        assert!(registry.lookup("DIALEND").is_some());
        assert!(registry.lookup("DialBegin").is_none());
    }

    #[test]
    fn test_bool_spellings() {
        for (raw, expected) in [
            ("Yes", true),
            ("no", false),
            ("TRUE", true),
            ("off", false),
            ("1", true),
            ("0", false),
        ] {
            assert_eq!(
                FieldType::Bool.coerce(raw),
                Some(FieldValue::Bool(expected)),
                "coercing {raw}"
            );
        }
        assert_eq!(FieldType::Bool.coerce("maybe"), None);
    }
}
