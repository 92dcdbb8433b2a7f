use std::fmt::Display;

use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize, Serializer};

pub const STATUS_HISTORY_CAPACITY: usize = 256;

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum StatusCode {
    #[default]
    Ok,
    Warning,
    Failure,
    Disabled,
}

impl Display for StatusCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StatusCode::Ok => write!(f, "OK"),
            StatusCode::Warning => write!(f, "Warning"),
            StatusCode::Failure => write!(f, "Failure"),
            StatusCode::Disabled => write!(f, "Disabled"),
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct StatusEntry {
    pub code: StatusCode,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl Display for StatusEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} - {}: {}",
            self.timestamp.to_rfc3339_opts(SecondsFormat::Secs, true),
            self.code,
            self.message
        )
    }
}

#[derive(Clone, Debug)]
struct Ring {
    entries: Vec<StatusEntry>,
    cursor: usize,
    capacity: usize,
}

impl Ring {
    fn last_index(&self) -> usize {
        (self.cursor + self.capacity - 1) % self.capacity
    }

    fn push(&mut self, entry: StatusEntry) {
        if self.entries.len() < self.capacity {
            self.entries.push(entry);
        } else {
            self.entries[self.cursor] = entry;
        }
        self.cursor = (self.cursor + 1) % self.capacity;
    }
}

/// Bounded log of status changes for one endpoint. Once full the oldest
/// entry is overwritten. Has its own lock, independent of the registry.
#[derive(Debug)]
pub struct StatusHistory {
    ring: RwLock<Ring>,
}

impl Default for StatusHistory {
    fn default() -> Self {
        Self::with_capacity(STATUS_HISTORY_CAPACITY)
    }
}

impl Clone for StatusHistory {
    fn clone(&self) -> Self {
        Self {
            ring: RwLock::new(self.ring.read().clone()),
        }
    }
}

impl StatusHistory {
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            ring: RwLock::new(Ring {
                entries: Vec::with_capacity(capacity),
                cursor: 0,
                capacity,
            }),
        }
    }

    pub fn log(&self, code: StatusCode, message: impl Into<String>) {
        self.log_at(code, message, Utc::now());
    }

    pub fn log_ok(&self, message: impl Into<String>) {
        self.log(StatusCode::Ok, message);
    }

    pub fn log_at(&self, code: StatusCode, message: impl Into<String>, timestamp: DateTime<Utc>) {
        self.ring.write().push(StatusEntry {
            code,
            message: message.into(),
            timestamp,
        });
    }

    pub fn len(&self) -> usize {
        self.ring.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn last(&self) -> Option<StatusEntry> {
        let ring = self.ring.read();
        if ring.entries.is_empty() {
            return None;
        }
        ring.entries.get(ring.last_index()).cloned()
    }

    /// All retained entries, newest first.
    pub fn dump_log(&self) -> Vec<StatusEntry> {
        let ring = self.ring.read();
        let len = ring.entries.len();
        let mut out = Vec::with_capacity(len);
        let mut idx = ring.last_index();
        for _ in 0..len {
            out.push(ring.entries[idx].clone());
            idx = (idx + ring.capacity - 1) % ring.capacity;
        }
        out
    }

    /// One line per entry, newest first. `OK` when nothing has been logged.
    pub fn render_log(&self) -> String {
        let lines: Vec<String> = self.dump_log().iter().map(|e| e.to_string()).collect();
        if lines.is_empty() {
            return StatusCode::Ok.to_string();
        }
        lines.join("\n")
    }
}

/// The code of the latest entry, or `OK` when empty.
impl Display for StatusHistory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.last() {
            Some(entry) => write!(f, "{}", entry.code),
            None => write!(f, "{}", StatusCode::Ok),
        }
    }
}

impl Serialize for StatusHistory {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.dump_log().serialize(serializer)
    }
}

#[cfg(test)]
mod test {
    use chrono::TimeZone;

    use super::*;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn test_empty_history() {
        let status = StatusHistory::default();
        assert!(status.last().is_none());
        assert!(status.dump_log().is_empty());
        assert_eq!(status.render_log(), "OK");
        assert_eq!(status.to_string(), "OK");
    }

    #[test]
    fn test_partial_history_newest_first() {
        let status = StatusHistory::default();
        status.log_at(StatusCode::Ok, "first", at(1));
        status.log_at(StatusCode::Warning, "second", at(2));
        status.log_at(StatusCode::Failure, "third", at(3));

        let log = status.dump_log();
        let messages: Vec<&str> = log.iter().map(|e| e.message.as_str()).collect();
        assert_eq!(messages, vec!["third", "second", "first"]);
        assert_eq!(status.to_string(), "Failure");
        assert_eq!(
            status.render_log().lines().next(),
            Some("1970-01-01T00:00:03Z - Failure: third")
        );
    }

    #[test]
    fn test_overflow_keeps_last_capacity_entries() {
        let status = StatusHistory::default();
        let total = STATUS_HISTORY_CAPACITY + 44;
        for i in 0..total {
            status.log_at(StatusCode::Ok, format!("entry {i}"), at(i as i64));
        }

        let log = status.dump_log();
        assert_eq!(log.len(), STATUS_HISTORY_CAPACITY);
        for (n, entry) in log.iter().enumerate() {
            assert_eq!(entry.message, format!("entry {}", total - 1 - n));
        }
        assert_eq!(status.last().unwrap().message, format!("entry {}", total - 1));
    }

    #[test]
    fn test_exactly_full_ring() {
        let status = StatusHistory::with_capacity(3);
        for i in 0..3 {
            status.log_at(StatusCode::Ok, format!("{i}"), at(i));
        }
        let messages: Vec<String> = status.dump_log().into_iter().map(|e| e.message).collect();
        assert_eq!(messages, vec!["2", "1", "0"]);

        status.log_at(StatusCode::Ok, "3", at(3));
        let messages: Vec<String> = status.dump_log().into_iter().map(|e| e.message).collect();
        assert_eq!(messages, vec!["3", "2", "1"]);
    }

    #[test]
    fn test_clone_is_independent() {
        let status = StatusHistory::default();
        status.log_ok("created");
        let copy = status.clone();
        status.log_ok("changed");
        assert_eq!(copy.len(), 1);
        assert_eq!(status.len(), 2);
    }
}
