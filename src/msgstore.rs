//! Message store interface and the in-memory implementation.
//!
//! The store is an append-only per-target log addressed by opaque internal
//! message IDs, with lookups by ID and by `server-time` bounds. It is
//! shared across user tasks and must be safe for concurrent use; calls are
//! synchronous and expected to be bounded in latency.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use thiserror::Error;

use slbnc_proto::{parse_server_time, Message};

use crate::db;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("message store error: {0}")]
    Internal(String),
}

/// Append-only message log, per (network, target).
pub trait MessageStore: Send + Sync {
    /// Append a message; returns its internal ID, or `None` when the
    /// message kind isn't recorded.
    fn append(
        &self,
        network: &db::Network,
        target: &str,
        msg: &Message,
    ) -> Result<Option<String>, StoreError>;

    /// ID of the most recent message for a target.
    fn last_msg_id(&self, network: &db::Network, target: &str)
        -> Result<Option<String>, StoreError>;

    /// Messages strictly after the given ID, oldest first, capped.
    fn load_after_id(
        &self,
        network: &db::Network,
        target: &str,
        id: &str,
        limit: usize,
    ) -> Result<Vec<Message>, StoreError>;

    /// Latest messages strictly before `t`, returned oldest first, capped.
    fn load_before_time(
        &self,
        network: &db::Network,
        target: &str,
        t: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Message>, StoreError>;

    /// Messages in `[start, end)`, oldest first, capped.
    fn load_between_time(
        &self,
        network: &db::Network,
        target: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Message>, StoreError>;
}

/// Commands worth recording.
fn is_loggable(msg: &Message) -> bool {
    matches!(
        msg.command.as_str(),
        "PRIVMSG" | "NOTICE" | "TAGMSG" | "JOIN" | "PART" | "KICK" | "QUIT" | "NICK" | "TOPIC"
            | "MODE"
    )
}

struct StoredMessage {
    id: u64,
    time: DateTime<Utc>,
    msg: Message,
}

/// Volatile in-memory store. IDs are `m<seq>` with a store-global
/// sequence, so they are opaque but positionally comparable per target.
#[derive(Default)]
pub struct MemoryStore {
    seq: AtomicU64,
    targets: Mutex<HashMap<(i64, String), Vec<StoredMessage>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore::default()
    }

    fn key(network: &db::Network, target: &str) -> (i64, String) {
        (network.id, target.to_owned())
    }
}

fn msg_time(msg: &Message) -> DateTime<Utc> {
    msg.server_time()
        .and_then(parse_server_time)
        .unwrap_or_else(Utc::now)
}

fn parse_id(id: &str) -> Option<u64> {
    id.strip_prefix('m')?.parse().ok()
}

impl MessageStore for MemoryStore {
    fn append(
        &self,
        network: &db::Network,
        target: &str,
        msg: &Message,
    ) -> Result<Option<String>, StoreError> {
        if !is_loggable(msg) {
            return Ok(None);
        }
        let id = self.seq.fetch_add(1, Ordering::Relaxed) + 1;
        let mut targets = self.targets.lock().unwrap();
        targets
            .entry(Self::key(network, target))
            .or_default()
            .push(StoredMessage {
                id,
                time: msg_time(msg),
                msg: msg.clone(),
            });
        Ok(Some(format!("m{}", id)))
    }

    fn last_msg_id(
        &self,
        network: &db::Network,
        target: &str,
    ) -> Result<Option<String>, StoreError> {
        let targets = self.targets.lock().unwrap();
        Ok(targets
            .get(&Self::key(network, target))
            .and_then(|log| log.last())
            .map(|m| format!("m{}", m.id)))
    }

    fn load_after_id(
        &self,
        network: &db::Network,
        target: &str,
        id: &str,
        limit: usize,
    ) -> Result<Vec<Message>, StoreError> {
        let floor = parse_id(id).unwrap_or(0);
        let targets = self.targets.lock().unwrap();
        let Some(log) = targets.get(&Self::key(network, target)) else {
            return Ok(Vec::new());
        };
        Ok(log
            .iter()
            .filter(|m| m.id > floor)
            .take(limit)
            .map(|m| m.msg.clone())
            .collect())
    }

    fn load_before_time(
        &self,
        network: &db::Network,
        target: &str,
        t: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Message>, StoreError> {
        let targets = self.targets.lock().unwrap();
        let Some(log) = targets.get(&Self::key(network, target)) else {
            return Ok(Vec::new());
        };
        let mut picked: Vec<&StoredMessage> =
            log.iter().filter(|m| m.time < t).collect();
        if picked.len() > limit {
            picked.drain(..picked.len() - limit);
        }
        Ok(picked.into_iter().map(|m| m.msg.clone()).collect())
    }

    fn load_between_time(
        &self,
        network: &db::Network,
        target: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Message>, StoreError> {
        let (lo, hi) = if start <= end { (start, end) } else { (end, start) };
        let targets = self.targets.lock().unwrap();
        let Some(log) = targets.get(&Self::key(network, target)) else {
            return Ok(Vec::new());
        };
        Ok(log
            .iter()
            .filter(|m| m.time >= lo && m.time < hi)
            .take(limit)
            .map(|m| m.msg.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use slbnc_proto::format_server_time;

    fn network() -> db::Network {
        db::Network {
            id: 1,
            ..Default::default()
        }
    }

    fn privmsg_at(text: &str, secs: u32) -> Message {
        let t = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, secs).unwrap();
        Message::new("PRIVMSG", vec!["#chan".into(), text.into()])
            .with_tag("time", Some(format_server_time(t)))
    }

    #[test]
    fn append_assigns_increasing_ids() {
        let store = MemoryStore::new();
        let net = network();
        let a = store.append(&net, "#chan", &privmsg_at("a", 1)).unwrap().unwrap();
        let b = store.append(&net, "#chan", &privmsg_at("b", 2)).unwrap().unwrap();
        assert_ne!(a, b);
        assert_eq!(store.last_msg_id(&net, "#chan").unwrap(), Some(b));
    }

    #[test]
    fn ping_is_not_logged() {
        let store = MemoryStore::new();
        let net = network();
        let id = store
            .append(&net, "#chan", &Message::new("PING", vec!["x".into()]))
            .unwrap();
        assert_eq!(id, None);
    }

    #[test]
    fn load_after_id_returns_tail() {
        let store = MemoryStore::new();
        let net = network();
        let first = store.append(&net, "#chan", &privmsg_at("a", 1)).unwrap().unwrap();
        store.append(&net, "#chan", &privmsg_at("b", 2)).unwrap();
        store.append(&net, "#chan", &privmsg_at("c", 3)).unwrap();

        let tail = store.load_after_id(&net, "#chan", &first, 100).unwrap();
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].params[1], "b");
        assert_eq!(tail[1].params[1], "c");

        let capped = store.load_after_id(&net, "#chan", &first, 1).unwrap();
        assert_eq!(capped.len(), 1);
    }

    #[test]
    fn load_by_time_bounds() {
        let store = MemoryStore::new();
        let net = network();
        for (i, text) in ["a", "b", "c", "d"].iter().enumerate() {
            store
                .append(&net, "#chan", &privmsg_at(text, (i + 1) as u32 * 10))
                .unwrap();
        }
        let t = |secs| Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, secs).unwrap();

        let before = store.load_before_time(&net, "#chan", t(30), 1).unwrap();
        assert_eq!(before.len(), 1);
        assert_eq!(before[0].params[1], "b", "latest before the bound wins");

        let between = store
            .load_between_time(&net, "#chan", t(10), t(40), 100)
            .unwrap();
        assert_eq!(between.len(), 3);

        // Reversed bounds are normalized.
        let between = store
            .load_between_time(&net, "#chan", t(40), t(10), 100)
            .unwrap();
        assert_eq!(between.len(), 3);
    }
}
