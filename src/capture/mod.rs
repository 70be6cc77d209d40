//! In-memory capture log.
//!
//! Every logical exchange the proxy observes ends up here as one
//! [`CapturedExchange`]. The log is bounded (oldest entries are evicted
//! first) and session scoped; nothing is persisted.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Serialize, Serializer};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::watch;

/// One request/response pair (or one opaque tunnel) seen by the proxy.
/// Immutable once it is in the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CapturedExchange {
    /// Assigned by [`CaptureStore::add`]; 0 until then.
    pub id: u64,
    pub timestamp: DateTime<Utc>,
    pub method: String,
    pub target_host: String,
    pub url: String,
    pub request_header_count: usize,
    pub request_body_size: u64,
    /// 0 when no response was received.
    pub response_status_code: u16,
    pub response_header_count: usize,
    pub response_body_size: u64,
    #[serde(rename = "durationMs", serialize_with = "serialize_millis")]
    pub duration: Duration,
    pub intercepted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CapturedExchange {
    pub fn new(
        method: impl Into<String>,
        target_host: impl Into<String>,
        url: impl Into<String>,
    ) -> Self {
        Self {
            id: 0,
            timestamp: Utc::now(),
            method: method.into(),
            target_host: target_host.into(),
            url: url.into(),
            request_header_count: 0,
            request_body_size: 0,
            response_status_code: 0,
            response_header_count: 0,
            response_body_size: 0,
            duration: Duration::ZERO,
            intercepted: false,
            error: None,
        }
    }
}

fn serialize_millis<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64(duration.as_micros() as f64 / 1000.0)
}

#[derive(Debug)]
struct CaptureLog {
    entries: VecDeque<CapturedExchange>,
    next_id: u64,
}

/// Bounded, insertion-ordered, thread-safe log of captured exchanges.
///
/// All operations take one short-lived lock around in-memory work only.
/// IDs follow the order in which `add` completes, so a fast exchange can be
/// numbered before a slower one that started earlier.
pub struct CaptureStore {
    log: Mutex<CaptureLog>,
    max_captures: usize,
    revision: watch::Sender<u64>,
}

impl CaptureStore {
    pub fn new(max_captures: usize) -> Self {
        let (revision, _) = watch::channel(0);
        Self {
            log: Mutex::new(CaptureLog {
                entries: VecDeque::with_capacity(max_captures.min(1024)),
                next_id: 1,
            }),
            max_captures: max_captures.max(1),
            revision,
        }
    }

    /// Append `exchange` with a fresh ID, evicting the oldest entry when the
    /// log is full. Returns the assigned ID.
    pub fn add(&self, mut exchange: CapturedExchange) -> u64 {
        let id = {
            let mut log = self.log.lock();
            let id = log.next_id;
            log.next_id += 1;
            exchange.id = id;

            while log.entries.len() >= self.max_captures {
                log.entries.pop_front();
            }
            log.entries.push_back(exchange);
            id
        };

        self.revision.send_modify(|rev| *rev += 1);
        id
    }

    /// Copy of the log in insertion order. A non-empty `method_filter` keeps
    /// only entries whose method matches it exactly (case-sensitive).
    pub fn list(&self, method_filter: &str) -> Vec<CapturedExchange> {
        let log = self.log.lock();
        log.entries
            .iter()
            .filter(|e| matches_filter(e, method_filter))
            .cloned()
            .collect()
    }

    /// Same filtering as [`list`](Self::list) without cloning anything.
    pub fn count(&self, method_filter: &str) -> usize {
        let log = self.log.lock();
        if method_filter.is_empty() {
            return log.entries.len();
        }
        log.entries
            .iter()
            .filter(|e| matches_filter(e, method_filter))
            .count()
    }

    /// Empty the log and restart IDs at 1.
    pub fn clear(&self) {
        {
            let mut log = self.log.lock();
            log.entries.clear();
            log.next_id = 1;
        }
        self.revision.send_modify(|rev| *rev += 1);
    }

    pub fn get(&self, id: u64) -> Option<CapturedExchange> {
        let log = self.log.lock();
        // IDs are strictly increasing, so the deque is sorted by id.
        log.entries
            .binary_search_by_key(&id, |e| e.id)
            .ok()
            .map(|idx| log.entries[idx].clone())
    }

    /// Entries with an ID greater than `after_id`, oldest first.
    pub fn since(&self, after_id: u64) -> Vec<CapturedExchange> {
        let log = self.log.lock();
        let start = log.entries.partition_point(|e| e.id <= after_id);
        log.entries.range(start..).cloned().collect()
    }

    /// Revision counter bumped on every `add` and `clear`.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }

    pub fn len(&self) -> usize {
        self.log.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn max_captures(&self) -> usize {
        self.max_captures
    }
}

fn matches_filter(exchange: &CapturedExchange, method_filter: &str) -> bool {
    method_filter.is_empty() || exchange.method == method_filter
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn exchange(method: &str, path: &str) -> CapturedExchange {
        CapturedExchange::new(method, "example.test", format!("http://example.test{path}"))
    }

    #[test]
    fn test_ids_increase_from_one() {
        let store = CaptureStore::new(10);
        assert_eq!(store.add(exchange("GET", "/a")), 1);
        assert_eq!(store.add(exchange("GET", "/b")), 2);

        let ids: Vec<u64> = store.list("").iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![1, 2]);
    }

    #[test]
    fn test_method_filter_is_exact() {
        let store = CaptureStore::new(10);
        store.add(exchange("GET", "/a"));
        store.add(exchange("POST", "/b"));
        store.add(exchange("get", "/c"));
        store.add(exchange("GET", "/d"));

        let gets = store.list("GET");
        assert_eq!(gets.len(), 2);
        assert!(gets.iter().all(|e| e.method == "GET"));
        assert_eq!(store.count("GET"), gets.len());
        assert_eq!(store.count("POST"), 1);
        assert_eq!(store.count(""), 4);
        assert_eq!(store.count("PUT"), 0);
    }

    #[test]
    fn test_oldest_entries_are_evicted() {
        let store = CaptureStore::new(3);
        for i in 0..5 {
            store.add(exchange("GET", &format!("/{i}")));
        }

        let entries = store.list("");
        assert_eq!(entries.len(), 3);
        assert_eq!(
            entries.iter().map(|e| e.id).collect::<Vec<_>>(),
            vec![3, 4, 5]
        );
        assert!(entries[0].url.ends_with("/2"));
    }

    #[test]
    fn test_clear_resets_ids() {
        let store = CaptureStore::new(10);
        store.add(exchange("GET", "/a"));
        store.add(exchange("GET", "/b"));
        store.clear();

        assert_eq!(store.count(""), 0);
        assert!(store.is_empty());
        assert_eq!(store.add(exchange("GET", "/c")), 1);
    }

    #[test]
    fn test_list_returns_a_copy() {
        let store = CaptureStore::new(10);
        store.add(exchange("GET", "/a"));

        let mut snapshot = store.list("");
        snapshot[0].method = "DELETE".to_string();
        store.clear();

        assert_eq!(snapshot.len(), 1);
        assert_eq!(store.count("DELETE"), 0);
    }

    #[test]
    fn test_get_and_since() {
        let store = CaptureStore::new(3);
        for i in 0..5 {
            store.add(exchange("GET", &format!("/{i}")));
        }

        assert!(store.get(1).is_none());
        assert_eq!(store.get(4).map(|e| e.url), Some("http://example.test/3".into()));

        let newer: Vec<u64> = store.since(3).iter().map(|e| e.id).collect();
        assert_eq!(newer, vec![4, 5]);
        assert_eq!(store.since(0).len(), 3);
        assert!(store.since(5).is_empty());
    }

    #[tokio::test]
    async fn test_subscribe_sees_new_captures() {
        let store = CaptureStore::new(10);
        let mut rx = store.subscribe();
        let seen = *rx.borrow_and_update();

        store.add(exchange("GET", "/a"));
        rx.changed().await.unwrap();
        assert!(*rx.borrow_and_update() > seen);
    }

    #[test]
    fn test_concurrent_adds_get_unique_ids() {
        let store = Arc::new(CaptureStore::new(1000));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        store.add(exchange("GET", "/"));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let ids: Vec<u64> = store.list("").iter().map(|e| e.id).collect();
        assert_eq!(ids.len(), 400);
        assert!(ids.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_serializes_camel_case() {
        let mut entry = exchange("GET", "/a");
        entry.duration = Duration::from_millis(12);
        entry.response_status_code = 200;

        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["responseStatusCode"], 200);
        assert_eq!(json["durationMs"], 12.0);
        assert_eq!(json["targetHost"], "example.test");
        assert!(json.get("error").is_none());
    }
}
