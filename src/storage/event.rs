use crate::error::Result;
use bincode::{config, Decode, Encode};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Opaque serialized payload with its type name and revision.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize, Encode, Decode)]
pub struct SerializedObject {
    pub type_name: String,
    pub revision: String,
    pub data: Vec<u8>,
}

impl SerializedObject {
    pub fn new(type_name: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            type_name: type_name.into(),
            revision: String::new(),
            data,
        }
    }
}

/// A stored business event.
///
/// Events with an aggregate identifier are domain events and take part in
/// per-aggregate sequencing; all other events are appended as-is.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize, Encode, Decode)]
pub struct Event {
    pub message_identifier: String,
    pub aggregate_identifier: Option<String>,
    pub aggregate_sequence_number: u64,
    pub aggregate_type: Option<String>,
    pub timestamp: i64,
    pub payload: SerializedObject,
    pub metadata: BTreeMap<String, String>,
}

impl Event {
    pub fn domain(
        aggregate_identifier: impl Into<String>,
        aggregate_sequence_number: u64,
        aggregate_type: impl Into<String>,
        payload: SerializedObject,
    ) -> Self {
        Self {
            aggregate_identifier: Some(aggregate_identifier.into()),
            aggregate_sequence_number,
            aggregate_type: Some(aggregate_type.into()),
            payload,
            ..Default::default()
        }
    }

    pub fn non_domain(payload: SerializedObject) -> Self {
        Self {
            payload,
            ..Default::default()
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn is_domain_event(&self) -> bool {
        self.aggregate_identifier
            .as_deref()
            .is_some_and(|id| !id.is_empty())
    }

    pub fn aggregate_id(&self) -> Option<&str> {
        self.aggregate_identifier.as_deref().filter(|id| !id.is_empty())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::encode_to_vec(self, config::standard())?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let (event, _) = bincode::decode_from_slice(bytes, config::standard())?;
        Ok(event)
    }
}

/// The two independent logs kept per context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    Event,
    Snapshot,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventType::Event => write!(f, "EVENT"),
            EventType::Snapshot => write!(f, "SNAPSHOT"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EventTypeContext {
    pub context: String,
    pub event_type: EventType,
}

impl EventTypeContext {
    pub fn new(context: impl Into<String>, event_type: EventType) -> Self {
        Self {
            context: context.into(),
            event_type,
        }
    }

    pub fn events(context: impl Into<String>) -> Self {
        Self::new(context, EventType::Event)
    }
}

impl fmt::Display for EventTypeContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.context, self.event_type)
    }
}

/// An event serialized once, ready to be copied into a segment.
#[derive(Debug, Clone)]
pub struct ProcessedEvent {
    bytes: Vec<u8>,
    aggregate_identifier: Option<String>,
    aggregate_sequence_number: u64,
}

impl ProcessedEvent {
    pub fn new(event: &Event) -> Result<Self> {
        Ok(Self {
            bytes: event.to_bytes()?,
            aggregate_identifier: event.aggregate_id().map(str::to_string),
            aggregate_sequence_number: event.aggregate_sequence_number,
        })
    }

    pub fn serialized_size(&self) -> usize {
        self.bytes.len()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn is_domain_event(&self) -> bool {
        self.aggregate_identifier.is_some()
    }

    pub fn aggregate_identifier(&self) -> Option<&str> {
        self.aggregate_identifier.as_deref()
    }

    pub fn aggregate_sequence_number(&self) -> u64 {
        self.aggregate_sequence_number
    }
}

/// An event read back from a segment together with its location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventInformation {
    pub token: i64,
    pub position: usize,
    pub event: Event,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventWithToken {
    pub token: i64,
    pub event: Event,
}

/// A complete stored transaction; `token` is the token of its first event.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct TransactionWithToken {
    pub token: i64,
    pub version: u8,
    pub events: Vec<Event>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_domain_event_detection() {
        let domain = Event::domain("agg-1", 0, "Order", SerializedObject::default());
        assert!(domain.is_domain_event());
        assert_eq!(domain.aggregate_id(), Some("agg-1"));

        let plain = Event::non_domain(SerializedObject::new("Ping", vec![1]));
        assert!(!plain.is_domain_event());

        let empty_id = Event {
            aggregate_identifier: Some(String::new()),
            ..Default::default()
        };
        assert!(!empty_id.is_domain_event());
        assert_eq!(empty_id.aggregate_id(), None);
    }

    #[test]
    fn test_event_bytes() {
        let event = Event::domain("a", 3, "T", SerializedObject::new("P", vec![1, 2, 3]))
            .with_metadata("trace", "abc");
        let decoded = Event::from_bytes(&event.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, event);
    }

    #[test]
    fn test_processed_event() {
        let event = Event::domain("agg", 7, "T", SerializedObject::new("P", vec![9; 16]));
        let processed = ProcessedEvent::new(&event).unwrap();
        assert!(processed.is_domain_event());
        assert_eq!(processed.aggregate_sequence_number(), 7);
        assert_eq!(processed.serialized_size(), event.to_bytes().unwrap().len());
    }
}
