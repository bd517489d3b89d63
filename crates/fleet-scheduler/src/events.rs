use fleet_bus::Event;
use uuid::Uuid;

use crate::types::Schedule;

/// Bus topics the scheduler listens on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScheduleTopic {
    Add,
    Remove,
}

/// Live-trigger changes. `Add` carries the full row so the handler never has
/// to re-read storage.
#[derive(Debug, Clone)]
pub enum ScheduleEvent {
    Add(Schedule),
    Remove(Uuid),
}

impl Event for ScheduleEvent {
    type Topic = ScheduleTopic;

    fn topic(&self) -> ScheduleTopic {
        match self {
            ScheduleEvent::Add(_) => ScheduleTopic::Add,
            ScheduleEvent::Remove(_) => ScheduleTopic::Remove,
        }
    }
}
