use crate::agent::ServerEvent;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// A persistent room event with its id. Ids increase monotonically and
/// double as the room version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggedEvent {
    pub id: u64,
    pub event: ServerEvent,
}

/// Bounded log of recent persistent events, replayed to joining agents.
#[derive(Debug, Clone)]
pub struct Backlog {
    events: VecDeque<LoggedEvent>,
    capacity: usize,
}

impl Backlog {
    pub fn new(capacity: usize) -> Self {
        Self {
            events: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Restore from persisted events, keeping the newest that fit.
    pub fn restore(capacity: usize, mut events: Vec<LoggedEvent>) -> Self {
        events.sort_by_key(|e| e.id);
        let skip = events.len().saturating_sub(capacity);
        Self {
            events: events.into_iter().skip(skip).collect(),
            capacity,
        }
    }

    pub fn push(&mut self, entry: LoggedEvent) {
        self.events.push_back(entry);
        while self.events.len() > self.capacity {
            self.events.pop_front();
        }
    }

    /// Events with an id greater than `after`, oldest first.
    pub fn since(&self, after: u64) -> impl Iterator<Item = &LoggedEvent> {
        self.events.iter().filter(move |e| e.id > after)
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn to_vec(&self) -> Vec<LoggedEvent> {
        self.events.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn join(id: u64) -> LoggedEvent {
        LoggedEvent {
            id,
            event: ServerEvent::Join {
                user_id: format!("u{}", id),
                username: "someone".into(),
            },
        }
    }

    #[test]
    fn test_bounded_and_ordered() {
        let mut backlog = Backlog::new(3);
        for id in 1..=5 {
            backlog.push(join(id));
        }
        let ids: Vec<u64> = backlog.since(0).map(|e| e.id).collect();
        assert_eq!(ids, vec![3, 4, 5]);
        let ids: Vec<u64> = backlog.since(4).map(|e| e.id).collect();
        assert_eq!(ids, vec![5]);
    }

    #[test]
    fn test_restore_keeps_newest() {
        let backlog = Backlog::restore(2, vec![join(9), join(7), join(8)]);
        let ids: Vec<u64> = backlog.since(0).map(|e| e.id).collect();
        assert_eq!(ids, vec![8, 9]);
    }
}
