use chrono::{DateTime, Utc};
use drover_core::types::{AwaitingReason, MessageRole, TicketStatus};
use serde::{Deserialize, Serialize};

/// Where an event is delivered: a per-ticket room or the global console.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "topic", content = "room", rename_all = "snake_case")]
pub enum Topic {
    Ticket(i64),
    Console,
}

/// Typed events published by the core. Internally tagged so the UI bridge
/// can dispatch on `type` without peeking at payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BusEvent {
    /// A ticket changed status (includes the awaiting reason when set).
    TicketStatus {
        ticket_id: i64,
        ticket_number: String,
        status: TicketStatus,
        reason: Option<AwaitingReason>,
    },
    /// A conversation row was appended.
    MessageAppended {
        ticket_id: i64,
        message_id: i64,
        role: MessageRole,
    },
    /// Streaming assistant text for live console views.
    AgentOutput { ticket_id: i64, content: String },
    /// Token usage rolled into the running session.
    UsageUpdate {
        ticket_id: i64,
        input_tokens: i64,
        output_tokens: i64,
    },
    /// The agent asked for permission; the ticket is now awaiting input.
    PermissionRequested {
        ticket_id: i64,
        tool: String,
        input: serde_json::Value,
    },
    /// The watchdog cut a session short.
    WatchdogAlert {
        ticket_id: i64,
        ticket_number: String,
        reason: String,
    },
    /// The project map expired; an external regeneration should run.
    MapRegenerationRequested { project_id: i64 },
    /// Marker injected for a subscriber that fell behind; `missed` events
    /// between the previous delivery and this one were not delivered.
    Dropped { missed: u64 },
}

/// A published event with its room and timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub topic: Topic,
    pub event: BusEvent,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_tag_on_type() {
        let event = BusEvent::TicketStatus {
            ticket_id: 3,
            ticket_number: "SHOP-0003".into(),
            status: TicketStatus::AwaitingInput,
            reason: Some(AwaitingReason::Completed),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "ticket_status");
        assert_eq!(json["status"], "awaiting_input");
        assert_eq!(json["reason"], "completed");
    }

    #[test]
    fn envelope_round_trip() {
        let envelope = Envelope {
            topic: Topic::Ticket(9),
            event: BusEvent::Dropped { missed: 4 },
            timestamp: Utc::now(),
        };
        let json = serde_json::to_string(&envelope).unwrap();
        let back: Envelope = serde_json::from_str(&json).unwrap();
        assert_eq!(back, envelope);
    }
}
