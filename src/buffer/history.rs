use super::SyncError;
use crate::agent::AgentId;
use crate::fingerprint::Fingerprint;
use crate::patch::Patch;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

/// One state the buffer passed through.
#[derive(Debug, Clone)]
pub struct HistoryEntry {
    pub fingerprint: Fingerprint,
    pub state: Arc<[u8]>,
    /// Patch that turned the previous entry's state into this one.
    /// `None` for a root entry (load, create).
    pub patch: Option<Patch>,
    pub author: Option<AgentId>,
}

impl HistoryEntry {
    pub fn root(state: Arc<[u8]>) -> Self {
        Self {
            fingerprint: Fingerprint::of(&state),
            state,
            patch: None,
            author: None,
        }
    }
}

/// Result of replaying a stale patch through history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Replay {
    /// The sender's state reproduces a state the buffer already passed
    /// through. The sender should be sent an undo patch instead.
    Rewind { agent_state: Vec<u8> },
    /// The sender's state rolled forward through every later entry.
    Forward { agent_state: Vec<u8> },
}

/// Bounded FIFO of recent buffer states. The newest entry is always the
/// buffer's current state.
#[derive(Debug, Clone)]
pub struct BufferHistory {
    entries: VecDeque<HistoryEntry>,
    capacity: usize,
}

impl BufferHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Forget everything and start over from `state`.
    pub fn seed(&mut self, state: Arc<[u8]>) {
        self.entries.clear();
        self.entries.push_back(HistoryEntry::root(state));
    }

    pub fn push(&mut self, entry: HistoryEntry) {
        self.entries.push_back(entry);
        while self.entries.len() > self.capacity {
            self.entries.pop_front();
        }
    }

    pub fn current(&self) -> Option<&HistoryEntry> {
        self.entries.back()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn iter(&self) -> impl Iterator<Item = &HistoryEntry> {
        self.entries.iter()
    }

    /// Oldest entry with this fingerprint.
    pub fn position(&self, fingerprint: &Fingerprint) -> Option<usize> {
        self.entries.iter().position(|e| &e.fingerprint == fingerprint)
    }

    /// Apply `patch` to the state the sender started from, then roll the
    /// result forward through every later entry's patch.
    ///
    /// Stops early with [`Replay::Rewind`] as soon as the sender's state
    /// matches any entry newer than the one it has been replayed onto.
    pub fn replay(&self, before: &Fingerprint, patch: &Patch) -> Result<Replay, SyncError> {
        let start = self
            .position(before)
            .ok_or_else(|| SyncError::HistoryMiss(before.clone()))?;

        let applied = patch.apply(&self.entries[start].state);
        if !applied.is_clean() {
            return Err(SyncError::ApplyFailed);
        }
        let mut agent_state = applied.content;

        // Newest index of each fingerprint.
        let newest: HashMap<&Fingerprint, usize> = self
            .entries
            .iter()
            .enumerate()
            .map(|(i, e)| (&e.fingerprint, i))
            .collect();
        let passed = |state: &[u8], at: usize| {
            newest
                .get(&Fingerprint::of(state))
                .is_some_and(|&i| i > at)
        };

        for (index, entry) in self.entries.iter().enumerate().skip(start + 1) {
            if passed(&agent_state[..], index - 1) {
                return Ok(Replay::Rewind { agent_state });
            }
            let Some(step) = &entry.patch else {
                return Err(SyncError::ApplyFailed);
            };
            let applied = step.apply(&agent_state);
            if !applied.is_clean() {
                return Err(SyncError::ApplyFailed);
            }
            agent_state = applied.content;
        }
        Ok(Replay::Forward { agent_state })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(s: &str) -> Arc<[u8]> {
        Arc::from(s.as_bytes())
    }

    /// History of "abc" -> "abcd" -> "abcde".
    fn abcde() -> BufferHistory {
        let mut history = BufferHistory::new(15);
        history.seed(state("abc"));
        for (prev, next) in [("abc", "abcd"), ("abcd", "abcde")] {
            history.push(HistoryEntry {
                fingerprint: Fingerprint::of(next.as_bytes()),
                state: state(next),
                patch: Some(Patch::diff(prev.as_bytes(), next.as_bytes())),
                author: Some("a1".into()),
            });
        }
        history
    }

    #[test]
    fn test_bounded_fifo() {
        let mut history = BufferHistory::new(3);
        history.seed(state("0"));
        for i in 1..10 {
            let s = i.to_string();
            history.push(HistoryEntry {
                fingerprint: Fingerprint::of(s.as_bytes()),
                state: state(&s),
                patch: None,
                author: None,
            });
            assert!(history.len() <= 3);
        }
        let kept: Vec<&[u8]> = history.iter().map(|e| &e.state[..]).collect();
        assert_eq!(kept, vec![&b"7"[..], b"8", b"9"]);
        assert_eq!(&history.current().unwrap().state[..], b"9");
    }

    #[test]
    fn test_seed_resets() {
        let mut history = abcde();
        history.seed(state("x"));
        assert_eq!(history.len(), 1);
        assert!(history.current().unwrap().patch.is_none());
    }

    #[test]
    fn test_replay_rolls_forward() {
        let history = abcde();
        // Sender prepended to "abc" without seeing the later edits.
        let patch = Patch::diff(b"abc", b">abc");
        let replay = history.replay(&Fingerprint::of(b"abc"), &patch).unwrap();
        assert_eq!(
            replay,
            Replay::Forward {
                agent_state: b">abcde".to_vec()
            }
        );
    }

    #[test]
    fn test_replay_detects_rewind() {
        let history = abcde();
        // Sender independently made the same abc -> abcd edit.
        let patch = Patch::diff(b"abc", b"abcd");
        let replay = history.replay(&Fingerprint::of(b"abc"), &patch).unwrap();
        assert_eq!(
            replay,
            Replay::Rewind {
                agent_state: b"abcd".to_vec()
            }
        );
    }

    #[test]
    fn test_replay_detects_rewind_past_several_entries() {
        let history = abcde();
        // Sender folded both edits into one patch.
        let patch = Patch::diff(b"abc", b"abcde");
        let replay = history.replay(&Fingerprint::of(b"abc"), &patch).unwrap();
        assert_eq!(
            replay,
            Replay::Rewind {
                agent_state: b"abcde".to_vec()
            }
        );
    }

    #[test]
    fn test_replay_history_miss() {
        let history = abcde();
        let patch = Patch::diff(b"zzz", b"zzzz");
        let err = history.replay(&Fingerprint::of(b"zzz"), &patch).unwrap_err();
        assert!(matches!(err, SyncError::HistoryMiss(_)));
    }

    #[test]
    fn test_replay_unclean_apply() {
        let history = abcde();
        let patch = Patch::diff(b"something else entirely", b"something else, entirely");
        let err = history.replay(&Fingerprint::of(b"abc"), &patch).unwrap_err();
        assert!(matches!(err, SyncError::ApplyFailed));
    }
}
