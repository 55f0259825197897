// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Change log entries and the logical clock that stamps them.
//!
//! Every mutation of a synced record type appends one [`Change`]. Changes are
//! local bookkeeping (never synced themselves) and are what the outbound
//! synchronizer replays from a client's watermark.

use std::sync::atomic::{AtomicI64, Ordering};

use serde::{Deserialize, Serialize};

use crate::record::Timestamp;

/// Current wall time in epoch milliseconds.
#[must_use]
pub fn now_millis() -> Timestamp {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as Timestamp
}

/// Kind of mutation recorded in the change log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeAction {
    Save,
    Remove,
    Wipe,
}

impl ChangeAction {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Save => "save",
            Self::Remove => "remove",
            Self::Wipe => "wipe",
        }
    }

    /// Case-insensitive parse (clients send `SAVE`, `save`, ...).
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "save" => Some(Self::Save),
            "remove" => Some(Self::Remove),
            "wipe" => Some(Self::Wipe),
            _ => None,
        }
    }
}

impl std::fmt::Display for ChangeAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One append-only change log entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Change {
    pub id: String,
    pub action: ChangeAction,
    pub record_id: String,
    pub record_type: String,
    /// Logical write time, strictly increasing per store
    pub timestamp: Timestamp,
}

/// Strictly increasing timestamp source.
///
/// In wall mode each tick is `max(now_ms, last + 1)`. Manual mode ignores the
/// wall clock and counts up from its start value, which makes change
/// timestamps predictable in tests.
#[derive(Debug)]
pub struct LogicalClock {
    last: AtomicI64,
    wall: bool,
}

impl Default for LogicalClock {
    fn default() -> Self {
        Self::wall()
    }
}

impl LogicalClock {
    #[must_use]
    pub fn wall() -> Self {
        Self {
            last: AtomicI64::new(0),
            wall: true,
        }
    }

    /// Counts `start + 1`, `start + 2`, ...
    #[must_use]
    pub fn manual(start: Timestamp) -> Self {
        Self {
            last: AtomicI64::new(start),
            wall: false,
        }
    }

    /// Next timestamp; never equal to or below any earlier tick.
    pub fn tick(&self) -> Timestamp {
        let floor = if self.wall { now_millis() } else { Timestamp::MIN };
        let previous = self
            .last
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |last| {
                Some(floor.max(last.saturating_add(1)))
            })
            .unwrap_or_else(|last| last);
        floor.max(previous.saturating_add(1))
    }

    /// Last timestamp handed out.
    #[must_use]
    pub fn last(&self) -> Timestamp {
        self.last.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_parse_is_case_insensitive() {
        assert_eq!(ChangeAction::parse("SAVE"), Some(ChangeAction::Save));
        assert_eq!(ChangeAction::parse("Remove"), Some(ChangeAction::Remove));
        assert_eq!(ChangeAction::parse(" wipe "), Some(ChangeAction::Wipe));
        assert_eq!(ChangeAction::parse("upsert"), None);
        assert_eq!(ChangeAction::parse(""), None);
    }

    #[test]
    fn test_action_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&ChangeAction::Remove).unwrap(), "\"remove\"");
        assert_eq!(format!("{}", ChangeAction::Save), "save");
    }

    #[test]
    fn test_change_serializes_camel_case() {
        let change = Change {
            id: "c1".into(),
            action: ChangeAction::Save,
            record_id: "p1".into(),
            record_type: "patient".into(),
            timestamp: 1001,
        };
        let json = serde_json::to_value(&change).unwrap();
        assert_eq!(json["recordId"], "p1");
        assert_eq!(json["recordType"], "patient");
        assert_eq!(json["timestamp"], 1001);
    }

    #[test]
    fn test_manual_clock_counts_from_start() {
        let clock = LogicalClock::manual(1000);
        assert_eq!(clock.tick(), 1001);
        assert_eq!(clock.tick(), 1002);
        assert_eq!(clock.last(), 1002);
    }

    #[test]
    fn test_wall_clock_is_strictly_increasing() {
        let clock = LogicalClock::wall();
        let mut previous = clock.tick();
        assert!(previous >= now_millis() - 1000);
        for _ in 0..1000 {
            let next = clock.tick();
            assert!(next > previous);
            previous = next;
        }
    }

    #[test]
    fn test_clock_is_monotonic_across_threads() {
        use std::sync::Arc;

        let clock = Arc::new(LogicalClock::manual(0));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let clock = clock.clone();
                std::thread::spawn(move || (0..250).map(|_| clock.tick()).collect::<Vec<_>>())
            })
            .collect();

        let mut all: Vec<Timestamp> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), 1000);
        assert_eq!(clock.last(), 1000);
    }
}
