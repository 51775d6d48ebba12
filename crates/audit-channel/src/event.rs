use std::fmt;

use crate::message::{EventId, MessageType, ReplyMessage};

/// A logically complete audit event.
///
/// `primary` is the record that closed or constituted the event: the EOE
/// marker for aggregated events, the record itself for standalone ones.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedEvent {
    primary: ReplyMessage,
    continuations: Vec<ReplyMessage>,
}

impl DecodedEvent {
    pub fn standalone(primary: ReplyMessage) -> Self {
        Self {
            primary,
            continuations: Vec::new(),
        }
    }

    pub fn primary(&self) -> &ReplyMessage {
        &self.primary
    }

    pub fn primary_type(&self) -> MessageType {
        self.primary.msg_type()
    }

    pub fn continuations(&self) -> &[ReplyMessage] {
        &self.continuations
    }

    /// Serial shared by the records, taken from the first one carrying it.
    pub fn id(&self) -> Option<EventId> {
        self.continuations
            .iter()
            .chain(std::iter::once(&self.primary))
            .find_map(ReplyMessage::event_id)
    }
}

impl fmt::Display for DecodedEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.primary_type())?;
        if let Some(id) = self.id() {
            write!(f, " audit({id})")?;
        }
        if !self.primary.payload().is_empty() && !self.primary_type().is_control() {
            write!(f, " {}", self.primary.body())?;
        }
        for record in &self.continuations {
            write!(f, "\n  {} {}", record.msg_type(), record.body())?;
        }
        Ok(())
    }
}

/// Continuation records waiting for their end-of-event marker.
#[derive(Debug, Default)]
pub struct EventAccumulator {
    records: Vec<ReplyMessage>,
}

impl EventAccumulator {
    pub fn push(&mut self, record: ReplyMessage) {
        self.records.push(record);
    }

    /// Close the current event with `eoe`, leaving the accumulator empty.
    pub fn drain(&mut self, eoe: ReplyMessage) -> DecodedEvent {
        DecodedEvent {
            primary: eoe,
            continuations: std::mem::take(&mut self.records),
        }
    }

    pub fn reset(&mut self) {
        if !self.records.is_empty() {
            log::debug!("dropping {} partial records", self.records.len());
        }
        self.records.clear();
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::encode_request;

    fn record(msg_type: MessageType, text: &str) -> ReplyMessage {
        let data = encode_request(msg_type, 0, 0, text.as_bytes());
        ReplyMessage::decode_all(&data).unwrap().remove(0)
    }

    #[test]
    fn drain_empties() {
        let mut accumulator = EventAccumulator::default();
        accumulator.push(record(MessageType::PATH, "audit(1.000:9): item=0"));
        accumulator.push(record(MessageType::PROCTITLE, "audit(1.000:9): proctitle=6C73"));
        assert_eq!(accumulator.len(), 2);
        let event = accumulator.drain(record(MessageType::EOE, "audit(1.000:9): "));
        assert!(accumulator.is_empty());
        assert_eq!(event.primary_type(), MessageType::EOE);
        assert_eq!(event.continuations().len(), 2);
        assert_eq!(event.id().map(|id| id.serial), Some(9));
    }

    #[test]
    fn drain_without_records() {
        let mut accumulator = EventAccumulator::default();
        let event = accumulator.drain(record(MessageType::EOE, ""));
        assert!(event.continuations().is_empty());
        assert_eq!(event.id(), None);
    }

    #[test]
    fn display() {
        let event = DecodedEvent::standalone(record(
            MessageType::CONFIG_CHANGE,
            "audit(1700000000.001:5): op=add_rule res=1",
        ));
        assert_eq!(
            event.to_string(),
            "CONFIG_CHANGE audit(1700000000.001:5) op=add_rule res=1"
        );
    }
}
