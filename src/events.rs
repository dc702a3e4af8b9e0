use std::fmt::{Display, Formatter};
use std::sync::Arc;

use log::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventAction {
    Create,
    Delete,
    Tag,
    Untag,
    Pull,
    Push
}

impl Display for EventAction {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            EventAction::Create => write!(f, "create"),
            EventAction::Delete => write!(f, "delete"),
            EventAction::Tag => write!(f, "tag"),
            EventAction::Untag => write!(f, "untag"),
            EventAction::Pull => write!(f, "pull"),
            EventAction::Push => write!(f, "push")
        }
    }
}

/// Receives image lifecycle events.
pub trait EventsSink: Send + Sync {
    fn log(&self, action: EventAction, id: &str, name: &str) -> Result<(), String>;
}

pub type EventsSinkRef = Arc<dyn EventsSink>;

/// Writes events to the log.
pub struct LogEvents;

impl LogEvents {
    pub fn new() -> Arc<LogEvents> {
        Arc::new(LogEvents)
    }
}

impl EventsSink for LogEvents {
    fn log(&self, action: EventAction, id: &str, name: &str) -> Result<(), String> {
        if name.is_empty() {
            info!("Image {}: {}", action, id);
        } else {
            info!("Image {}: {} ({})", action, id, name);
        }

        Ok(())
    }
}

/// Delivers an event. Delivery failures never fail the operation that caused the event.
pub fn emit(events: &EventsSinkRef, action: EventAction, id: &str, name: &str) {
    if let Err(err) = events.log(action, id, name) {
        warn!("Failed to deliver {} event for {}: {}", action, id, err);
    }
}

#[test]
fn test_emit_ignores_failure() {
    struct FailingEvents;

    impl EventsSink for FailingEvents {
        fn log(&self, _action: EventAction, _id: &str, _name: &str) -> Result<(), String> {
            Err("unavailable".to_owned())
        }
    }

    let events: EventsSinkRef = Arc::new(FailingEvents);
    emit(&events, EventAction::Create, "sha256:1234", "");
}

#[test]
fn test_action_display() {
    assert_eq!("create", EventAction::Create.to_string());
    assert_eq!("untag", EventAction::Untag.to_string());
}
