use std::{
    collections::{BTreeSet, HashMap},
    sync::{Arc, RwLock},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use bytes::Bytes;
use tokio::{sync::Notify, time::Instant};
use tracing::debug;

use crate::snapshot::Entry as SnapshotEntry;

/// Key space shared by every client connection and the replication applier.
///
/// `Db` is a handle: clones share the same keys. A background task removes
/// keys once their deadline passes; until it runs, reads already treat them
/// as absent.
#[derive(Debug, Clone)]
pub struct Db {
    shared: Arc<Shared>,
}

#[derive(Debug)]
struct Shared {
    /// Critical sections never await, so a std lock is enough.
    keys: RwLock<KeySpace>,
    /// Wakes the expiration task when the earliest deadline changes or the
    /// key space closes.
    wake: Notify,
}

#[derive(Debug, Default)]
struct KeySpace {
    values: HashMap<String, Value>,
    /// Pending deadlines, earliest first.
    deadlines: BTreeSet<(Instant, String)>,
    closed: bool,
}

#[derive(Debug)]
struct Value {
    data: Bytes,
    deadline: Option<Instant>,
}

impl Value {
    fn is_live(&self, now: Instant) -> bool {
        self.deadline.map_or(true, |deadline| deadline > now)
    }
}

/// Owns the server's `Db` and stops its expiration task when dropped.
#[derive(Debug)]
pub(crate) struct DbDropGuard {
    db: Db,
}

impl DbDropGuard {
    pub(crate) fn new() -> Self {
        DbDropGuard { db: Db::new() }
    }

    pub(crate) fn db(&self) -> Db {
        self.db.clone()
    }
}

impl Drop for DbDropGuard {
    fn drop(&mut self) {
        self.db.close();
    }
}

impl Db {
    /// Create an empty key space and spawn its expiration task.
    pub fn new() -> Self {
        let shared = Arc::new(Shared {
            keys: RwLock::new(KeySpace::default()),
            wake: Notify::new(),
        });
        tokio::spawn(expire_keys(shared.clone()));
        Self { shared }
    }

    /// Value stored at `key`, `None` when missing or expired.
    pub fn get(&self, key: &str) -> Option<Bytes> {
        let keys = self.shared.keys.read().unwrap();
        keys.values
            .get(key)
            .filter(|value| value.is_live(Instant::now()))
            .map(|value| value.data.clone())
    }

    /// Store `value` at `key`, replacing any previous value and deadline.
    pub fn set(&self, key: String, value: Bytes, expire: Option<Duration>) {
        let deadline = expire.map(|ttl| Instant::now() + ttl);

        let mut keys = self.shared.keys.write().unwrap();
        let earliest = keys.next_deadline();
        let previous = keys.values.insert(
            key.clone(),
            Value {
                data: value,
                deadline,
            },
        );
        if let Some(old) = previous.and_then(|value| value.deadline) {
            keys.deadlines.remove(&(old, key.clone()));
        }
        if let Some(deadline) = deadline {
            keys.deadlines.insert((deadline, key));
        }
        drop(keys);

        // only a new earliest deadline changes when the task must wake up
        if deadline.is_some_and(|deadline| earliest.map_or(true, |e| deadline < e)) {
            self.shared.wake.notify_one();
        }
    }

    /// Number of stored keys, including expired ones not yet removed.
    pub fn len(&self) -> usize {
        self.shared.keys.read().unwrap().values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let mut keys = self.shared.keys.write().unwrap();
        keys.values.clear();
        keys.deadlines.clear();
    }

    /// Live keys ordered by name, with deadlines as unix milliseconds.
    pub fn dump(&self) -> Vec<SnapshotEntry> {
        let keys = self.shared.keys.read().unwrap();
        let now = Instant::now();
        let wall = SystemTime::now();

        let mut entries: Vec<SnapshotEntry> = keys
            .values
            .iter()
            .filter(|(_, value)| value.is_live(now))
            .map(|(key, value)| SnapshotEntry {
                key: key.clone(),
                value: value.data.clone(),
                expires_at_ms: value
                    .deadline
                    .map(|deadline| unix_millis(wall + (deadline - now))),
            })
            .collect();
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        entries
    }

    /// Replace the whole key space with `entries`, skipping those whose
    /// deadline already passed. Returns how many were loaded.
    pub fn load(&self, entries: Vec<SnapshotEntry>) -> usize {
        self.clear();
        let now_ms = unix_millis(SystemTime::now());
        let mut loaded = 0;

        for entry in entries {
            let expire = match entry.expires_at_ms {
                Some(at) if at <= now_ms => {
                    debug!(key = %entry.key, "skipping expired snapshot entry");
                    continue;
                }
                Some(at) => Some(Duration::from_millis(at - now_ms)),
                None => None,
            };
            self.set(entry.key, entry.value, expire);
            loaded += 1;
        }
        loaded
    }

    fn close(&self) {
        self.shared.keys.write().unwrap().closed = true;
        self.shared.wake.notify_one();
    }
}

impl KeySpace {
    fn next_deadline(&self) -> Option<Instant> {
        self.deadlines.first().map(|(deadline, _)| *deadline)
    }

    /// Remove every key whose deadline passed, returning the next deadline.
    fn remove_expired(&mut self, now: Instant) -> Option<Instant> {
        while let Some((deadline, key)) = self.deadlines.pop_first() {
            if deadline > now {
                self.deadlines.insert((deadline, key));
                return Some(deadline);
            }
            debug!(%key, "key expired");
            self.values.remove(&key);
        }
        None
    }
}

#[tracing::instrument(skip_all)]
async fn expire_keys(shared: Arc<Shared>) {
    loop {
        let next = {
            let mut keys = shared.keys.write().unwrap();
            if keys.closed {
                break;
            }
            keys.remove_expired(Instant::now())
        };

        match next {
            Some(deadline) => {
                tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => {}
                    _ = shared.wake.notified() => {}
                }
            }
            None => shared.wake.notified().await,
        }
    }
    debug!("expiration task stopped");
}

fn unix_millis(at: SystemTime) -> u64 {
    at.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_get_and_expire() {
        let db = Db::new();
        db.set("a".into(), Bytes::from("1"), None);
        db.set("b".into(), Bytes::from("2"), Some(Duration::from_millis(20)));
        assert_eq!(db.get("a"), Some(Bytes::from("1")));
        assert_eq!(db.get("b"), Some(Bytes::from("2")));

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(db.get("b"), None);
        assert_eq!(db.len(), 1);
        db.close();
    }

    #[tokio::test]
    async fn test_overwrite_drops_deadline() {
        let db = Db::new();
        db.set("k".into(), Bytes::from("old"), Some(Duration::from_millis(20)));
        db.set("k".into(), Bytes::from("new"), None);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(db.get("k"), Some(Bytes::from("new")));
        assert!(db.shared.keys.read().unwrap().deadlines.is_empty());
        db.close();
    }

    #[tokio::test]
    async fn test_dump_and_load() {
        let db = Db::new();
        db.set("b".into(), Bytes::from("2"), Some(Duration::from_secs(60)));
        db.set("a".into(), Bytes::from("1"), None);

        let dump = db.dump();
        assert_eq!(dump.len(), 2);
        assert_eq!(dump[0].key, "a");
        assert_eq!(dump[0].expires_at_ms, None);
        assert!(dump[1].expires_at_ms.is_some());

        let other = Db::new();
        other.set("stale".into(), Bytes::from("x"), None);
        let expired = SnapshotEntry {
            key: "gone".into(),
            value: Bytes::from("x"),
            expires_at_ms: Some(1),
        };
        let mut entries = dump;
        entries.push(expired);

        assert_eq!(other.load(entries), 2);
        assert_eq!(other.get("stale"), None);
        assert_eq!(other.get("gone"), None);
        assert_eq!(other.get("b"), Some(Bytes::from("2")));
        db.close();
        other.close();
    }
}
