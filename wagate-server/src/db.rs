//! In-memory message log.
//!
//! Keeps the most recent inbound and outbound messages for `/health` and
//! debugging. Nothing survives a restart.

use std::collections::VecDeque;

use parking_lot::Mutex;
use serde::Serialize;

/// Maximum number of records kept; the oldest is evicted first.
pub const MAX_HISTORY: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Inbound,
    Outbound,
}

#[derive(Debug, Clone, Serialize)]
pub struct MessageRecord {
    pub direction: Direction,
    pub phone: String,
    pub body: String,
    /// Unix seconds.
    pub timestamp: i64,
}

#[derive(Debug, Default)]
pub struct MemoryDb {
    records: Mutex<VecDeque<MessageRecord>>,
}

impl MemoryDb {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, direction: Direction, phone: &str, body: &str) {
        let record = MessageRecord {
            direction,
            phone: phone.to_string(),
            body: body.to_string(),
            timestamp: chrono::Utc::now().timestamp(),
        };
        let mut records = self.records.lock();
        if records.len() >= MAX_HISTORY {
            records.pop_front();
        }
        records.push_back(record);
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    /// Up to `limit` most recent records, oldest first.
    pub fn recent(&self, limit: usize) -> Vec<MessageRecord> {
        let records = self.records.lock();
        let skip = records.len().saturating_sub(limit);
        records.iter().skip(skip).cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recent_returns_tail_in_order() {
        let db = MemoryDb::new();
        db.record(Direction::Inbound, "111", "hola");
        db.record(Direction::Outbound, "111", "Buenas!");
        db.record(Direction::Outbound, "222", "aviso");

        let last_two = db.recent(2);
        assert_eq!(last_two.len(), 2);
        assert_eq!(last_two[0].body, "Buenas!");
        assert_eq!(last_two[1].phone, "222");
        assert_eq!(db.recent(10).len(), 3);
    }

    #[test]
    fn evicts_oldest_past_capacity() {
        let db = MemoryDb::new();
        for i in 0..MAX_HISTORY + 3 {
            db.record(Direction::Inbound, "111", &format!("msg {i}"));
        }
        assert_eq!(db.len(), MAX_HISTORY);
        assert_eq!(db.recent(MAX_HISTORY)[0].body, "msg 3");
    }

    #[test]
    fn direction_serializes_lowercase() {
        let db = MemoryDb::new();
        db.record(Direction::Outbound, "111", "x");
        let json = serde_json::to_value(&db.recent(1)[0]).unwrap();
        assert_eq!(json["direction"], "outbound");
    }
}
