use crate::error::{AppError, AppResult};
use crate::store::gateway::StoreGateway;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::{Instant, interval, sleep};
use tracing::{debug, error, info, warn};

const BACKOFF_INITIAL_MS: u64 = 50;
const BACKOFF_MAX_MS: u64 = 5_000;

/// A single mutating store operation, keyed by its target key at submission.
#[derive(Debug, Clone)]
pub enum WriteOp {
    Set { value: String, ttl: Option<u64> },
    HSet { fields: Vec<(String, String)> },
    SAdd { members: Vec<String> },
    SRem { members: Vec<String> },
    ZAdd { member: String, score: f64 },
    ZRem { members: Vec<String> },
    Expire { ttl: u64 },
    Del,
}

/// Coalesced state for one key. Only the reduction of everything submitted
/// since the last flush is kept; the flusher emits it as at most three store
/// commands (DEL, write, EXPIRE).
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum CoalescedWrite {
    Scalar {
        value: String,
    },
    Hash {
        fields: HashMap<String, String>,
    },
    Members {
        add: HashSet<String>,
        rem: HashSet<String>,
    },
    Scored {
        add: HashMap<String, String>,
        rem: HashSet<String>,
    },
}

#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct PendingEntry {
    pub delete_first: bool,
    pub write: Option<CoalescedWrite>,
    pub ttl: Option<u64>,
}

impl PendingEntry {
    fn apply(&mut self, op: WriteOp) {
        match op {
            WriteOp::Del => {
                // A delete supersedes and cancels everything pending.
                self.delete_first = true;
                self.write = None;
                self.ttl = None;
            }
            WriteOp::Set { value, ttl } => {
                // SET overwrites the whole key; no need to delete first.
                self.delete_first = false;
                self.write = Some(CoalescedWrite::Scalar { value });
                self.ttl = ttl;
            }
            WriteOp::HSet { fields } => {
                let map = match &mut self.write {
                    Some(CoalescedWrite::Hash { fields }) => fields,
                    _ => {
                        self.write = Some(CoalescedWrite::Hash {
                            fields: HashMap::new(),
                        });
                        match &mut self.write {
                            Some(CoalescedWrite::Hash { fields }) => fields,
                            _ => unreachable!(),
                        }
                    }
                };
                for (field, value) in fields {
                    map.insert(field, value);
                }
            }
            WriteOp::SAdd { members } => {
                let (add, rem) = self.members_mut();
                for member in members {
                    rem.remove(&member);
                    add.insert(member);
                }
            }
            WriteOp::SRem { members } => {
                let (add, rem) = self.members_mut();
                for member in members {
                    add.remove(&member);
                    rem.insert(member);
                }
            }
            WriteOp::ZAdd { member, score } => {
                let (add, rem) = self.scored_mut();
                rem.remove(&member);
                add.insert(member, score.to_string());
            }
            WriteOp::ZRem { members } => {
                let (add, rem) = self.scored_mut();
                for member in members {
                    add.remove(&member);
                    rem.insert(member);
                }
            }
            WriteOp::Expire { ttl } => {
                self.ttl = Some(ttl);
            }
        }
    }

    fn members_mut(&mut self) -> (&mut HashSet<String>, &mut HashSet<String>) {
        if !matches!(self.write, Some(CoalescedWrite::Members { .. })) {
            self.write = Some(CoalescedWrite::Members {
                add: HashSet::new(),
                rem: HashSet::new(),
            });
        }
        match &mut self.write {
            Some(CoalescedWrite::Members { add, rem }) => (add, rem),
            _ => unreachable!(),
        }
    }

    fn scored_mut(&mut self) -> (&mut HashMap<String, String>, &mut HashSet<String>) {
        if !matches!(self.write, Some(CoalescedWrite::Scored { .. })) {
            self.write = Some(CoalescedWrite::Scored {
                add: HashMap::new(),
                rem: HashSet::new(),
            });
        }
        match &mut self.write {
            Some(CoalescedWrite::Scored { add, rem }) => (add, rem),
            _ => unreachable!(),
        }
    }

    /// Re-apply the state of `newer` on top of an older entry that failed to
    /// flush, so nothing submitted in the meantime is lost or reordered.
    fn rebase_onto(self, newer: PendingEntry) -> PendingEntry {
        if newer.delete_first || matches!(newer.write, Some(CoalescedWrite::Scalar { .. })) {
            // The newer entry wipes the key; the older state is irrelevant.
            return newer;
        }

        let mut merged = self;
        match newer.write {
            None => {}
            Some(CoalescedWrite::Hash { fields }) => merged.apply(WriteOp::HSet {
                fields: fields.into_iter().collect(),
            }),
            Some(CoalescedWrite::Members { add, rem }) => {
                merged.apply(WriteOp::SRem {
                    members: rem.into_iter().collect(),
                });
                merged.apply(WriteOp::SAdd {
                    members: add.into_iter().collect(),
                });
            }
            Some(CoalescedWrite::Scored { add, rem }) => {
                merged.apply(WriteOp::ZRem {
                    members: rem.into_iter().collect(),
                });
                for (member, score) in add {
                    let score = score.parse().unwrap_or(0.0);
                    merged.apply(WriteOp::ZAdd { member, score });
                }
            }
            Some(CoalescedWrite::Scalar { .. }) => unreachable!(),
        }
        if newer.ttl.is_some() {
            merged.ttl = newer.ttl;
        }
        merged
    }
}

/// Per-key coalescing table. Pure data structure so the reduction rules are
/// testable without a store.
#[derive(Debug, Default)]
pub(crate) struct PendingWrites {
    entries: HashMap<String, PendingEntry>,
}

impl PendingWrites {
    pub fn submit(&mut self, key: &str, op: WriteOp) {
        self.entries.entry(key.to_string()).or_default().apply(op);
    }

    pub fn take_all(&mut self) -> Vec<(String, PendingEntry)> {
        self.entries.drain().collect()
    }

    /// Put a failed entry back, underneath anything submitted since.
    pub fn restore(&mut self, key: String, older: PendingEntry) {
        let merged = match self.entries.remove(&key) {
            Some(newer) => older.rebase_onto(newer),
            None => older,
        };
        self.entries.insert(key, merged);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[cfg(test)]
    pub fn get(&self, key: &str) -> Option<&PendingEntry> {
        self.entries.get(key)
    }
}

/// Write-behind coalescing layer between the registries and the store.
/// Callers get immediate local acknowledgment; a background flusher emits
/// coalesced writes every flush interval.
#[derive(Clone)]
pub struct WriteBehindBatcher {
    store: StoreGateway,
    pending: Arc<Mutex<PendingWrites>>,
    flush_interval: Duration,
    high_water: usize,
    synchronous: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
}

impl WriteBehindBatcher {
    pub fn new(store: StoreGateway, flush_interval: Duration, high_water: usize) -> Self {
        Self {
            store,
            pending: Arc::new(Mutex::new(PendingWrites::default())),
            flush_interval,
            high_water,
            synchronous: Arc::new(AtomicBool::new(false)),
            running: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Enqueue a mutating op. Returns once the op is locally acknowledged;
    /// the durable write happens on the next flush. Above the high-water
    /// mark the batcher degrades to synchronous writes until drained.
    pub async fn submit(&self, key: &str, op: WriteOp) -> AppResult<()> {
        if self.synchronous.load(Ordering::Relaxed) {
            let mut entry = PendingEntry::default();
            entry.apply(op);
            return self.write_entry(key, &entry).await;
        }

        let pending_len = {
            let mut pending = self.lock_pending();
            pending.submit(key, op);
            pending.len()
        };

        if pending_len > self.high_water && !self.synchronous.swap(true, Ordering::Relaxed) {
            warn!(
                pending = pending_len,
                high_water = self.high_water,
                "Batcher high-water mark exceeded; switching to synchronous writes"
            );
        }
        Ok(())
    }

    pub fn pending_len(&self) -> usize {
        self.lock_pending().len()
    }

    pub fn spawn_flusher(&self) -> tokio::task::JoinHandle<()> {
        let batcher = self.clone();
        tokio::spawn(async move { batcher.run().await })
    }

    async fn run(&self) {
        let mut ticker = interval(self.flush_interval);
        let mut backoff_ms = BACKOFF_INITIAL_MS;

        loop {
            ticker.tick().await;
            if !self.running.load(Ordering::Relaxed) {
                break;
            }

            match self.flush_once().await {
                Ok(flushed) => {
                    backoff_ms = BACKOFF_INITIAL_MS;
                    if flushed > 0 {
                        debug!(keys = flushed, "Flushed coalesced writes");
                    }
                }
                Err(e) if e.is_transient() => {
                    warn!(error = %e, backoff_ms, "Flush failed; backing off");
                    sleep(Duration::from_millis(backoff_ms)).await;
                    backoff_ms = (backoff_ms * 2).min(BACKOFF_MAX_MS);
                }
                Err(e) => {
                    // Not a store transient; retrying on a schedule will not
                    // help, but the coalesced state was restored and the
                    // next interval picks it up.
                    error!(error = %e, "Flush failed with non-transient error");
                    backoff_ms = BACKOFF_INITIAL_MS;
                }
            }
        }
    }

    /// Flush the current coalesced state. Keys that fail to write are put
    /// back underneath anything submitted in the meantime, so the state is
    /// never lost.
    async fn flush_once(&self) -> AppResult<usize> {
        let snapshot = self.lock_pending().take_all();
        if snapshot.is_empty() {
            self.synchronous.store(false, Ordering::Relaxed);
            return Ok(0);
        }

        let total = snapshot.len();
        let mut first_error: Option<AppError> = None;

        for (key, entry) in snapshot {
            if let Err(e) = self.write_entry(&key, &entry).await {
                self.lock_pending().restore(key, entry);
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }

        if self.lock_pending().is_empty() {
            self.synchronous.store(false, Ordering::Relaxed);
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(total),
        }
    }

    async fn write_entry(&self, key: &str, entry: &PendingEntry) -> AppResult<()> {
        if entry.delete_first {
            self.store.delete(key).await?;
        }

        match &entry.write {
            None => {}
            Some(CoalescedWrite::Scalar { value }) => {
                self.store.set(key, value, entry.ttl).await?;
                return Ok(());
            }
            Some(CoalescedWrite::Hash { fields }) => {
                let fields: Vec<(String, String)> =
                    fields.iter().map(|(f, v)| (f.clone(), v.clone())).collect();
                self.store.hset_multiple(key, &fields).await?;
            }
            Some(CoalescedWrite::Members { add, rem }) => {
                let rem: Vec<String> = rem.iter().cloned().collect();
                self.store.srem(key, &rem).await?;
                let add: Vec<String> = add.iter().cloned().collect();
                self.store.sadd(key, &add).await?;
            }
            Some(CoalescedWrite::Scored { add, rem }) => {
                let rem: Vec<String> = rem.iter().cloned().collect();
                self.store.zrem(key, &rem).await?;
                for (member, score) in add {
                    let score = score.parse().unwrap_or(0.0);
                    self.store.zadd(key, member, score).await?;
                }
            }
        }

        if let Some(ttl) = entry.ttl {
            self.store.expire(key, ttl).await?;
        }
        Ok(())
    }

    /// Flush everything and stop the flusher. Blocks until the pending set
    /// is empty or the deadline elapses. Used during shutdown, after the
    /// sockets have drained.
    pub async fn drain(&self, deadline: Duration) -> AppResult<()> {
        let stop_at = Instant::now() + deadline;
        self.running.store(false, Ordering::Relaxed);

        loop {
            match self.flush_once().await {
                Ok(_) if self.lock_pending().is_empty() => {
                    info!("Batcher drained");
                    return Ok(());
                }
                Ok(_) => {}
                Err(e) if Instant::now() >= stop_at => {
                    warn!(error = %e, "Batcher drain deadline elapsed with pending writes");
                    return Err(e);
                }
                Err(e) => {
                    debug!(error = %e, "Drain flush failed; retrying");
                    sleep(Duration::from_millis(BACKOFF_INITIAL_MS)).await;
                }
            }
            if Instant::now() >= stop_at {
                let remaining = self.lock_pending().len();
                warn!(remaining, "Batcher drain deadline elapsed");
                return Err(AppError::internal("batcher drain deadline elapsed"));
            }
        }
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, PendingWrites> {
        match self.pending.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(value: &str) -> WriteOp {
        WriteOp::Set {
            value: value.to_string(),
            ttl: None,
        }
    }

    fn hset(pairs: &[(&str, &str)]) -> WriteOp {
        WriteOp::HSet {
            fields: pairs
                .iter()
                .map(|(f, v)| (f.to_string(), v.to_string()))
                .collect(),
        }
    }

    #[test]
    fn test_identical_sets_coalesce_to_one_write() {
        let mut pending = PendingWrites::default();
        for _ in 0..50 {
            pending.submit("sessions:s1", set("v"));
        }
        assert_eq!(pending.len(), 1);

        let entry = pending.get("sessions:s1").unwrap();
        assert_eq!(
            entry.write,
            Some(CoalescedWrite::Scalar {
                value: "v".to_string()
            })
        );
    }

    #[test]
    fn test_last_writer_wins_per_field() {
        let mut pending = PendingWrites::default();
        for i in 1..=50 {
            pending.submit("sessions:s1", hset(&[("data", &format!("K{}", i))]));
        }

        let entry = pending.get("sessions:s1").unwrap();
        match &entry.write {
            Some(CoalescedWrite::Hash { fields }) => {
                assert_eq!(fields.len(), 1);
                assert_eq!(fields.get("data").map(String::as_str), Some("K50"));
            }
            other => panic!("unexpected coalesced state: {:?}", other),
        }
    }

    #[test]
    fn test_hash_fields_merge() {
        let mut pending = PendingWrites::default();
        pending.submit("sessions:s1", hset(&[("chat_id", "a"), ("data", "{}")]));
        pending.submit("sessions:s1", hset(&[("last_access", "7")]));

        let entry = pending.get("sessions:s1").unwrap();
        match &entry.write {
            Some(CoalescedWrite::Hash { fields }) => {
                assert_eq!(fields.len(), 3);
                assert_eq!(fields.get("chat_id").map(String::as_str), Some("a"));
            }
            other => panic!("unexpected coalesced state: {:?}", other),
        }
    }

    #[test]
    fn test_delete_cancels_pending_writes() {
        let mut pending = PendingWrites::default();
        pending.submit("sessions:s1", hset(&[("data", "x")]));
        pending.submit("sessions:s1", WriteOp::Expire { ttl: 60 });
        pending.submit("sessions:s1", WriteOp::Del);

        let entry = pending.get("sessions:s1").unwrap();
        assert!(entry.delete_first);
        assert!(entry.write.is_none());
        assert!(entry.ttl.is_none());
    }

    #[test]
    fn test_write_after_delete_keeps_delete_first() {
        let mut pending = PendingWrites::default();
        pending.submit("sessions:s1", WriteOp::Del);
        pending.submit("sessions:s1", hset(&[("data", "fresh")]));

        let entry = pending.get("sessions:s1").unwrap();
        assert!(entry.delete_first);
        assert!(matches!(entry.write, Some(CoalescedWrite::Hash { .. })));
    }

    #[test]
    fn test_set_members_union() {
        let mut pending = PendingWrites::default();
        pending.submit(
            "user_sessions:alice",
            WriteOp::SAdd {
                members: vec!["s1".to_string(), "s2".to_string()],
            },
        );
        pending.submit(
            "user_sessions:alice",
            WriteOp::SRem {
                members: vec!["s1".to_string()],
            },
        );
        pending.submit(
            "user_sessions:alice",
            WriteOp::SAdd {
                members: vec!["s3".to_string()],
            },
        );

        let entry = pending.get("user_sessions:alice").unwrap();
        match &entry.write {
            Some(CoalescedWrite::Members { add, rem }) => {
                assert!(add.contains("s2") && add.contains("s3"));
                assert!(!add.contains("s1"));
                assert!(rem.contains("s1"));
            }
            other => panic!("unexpected coalesced state: {:?}", other),
        }
    }

    #[test]
    fn test_sorted_set_latest_score_wins() {
        let mut pending = PendingWrites::default();
        pending.submit(
            "connected_users",
            WriteOp::ZAdd {
                member: "s1".to_string(),
                score: 1.0,
            },
        );
        pending.submit(
            "connected_users",
            WriteOp::ZAdd {
                member: "s1".to_string(),
                score: 9.0,
            },
        );

        let entry = pending.get("connected_users").unwrap();
        match &entry.write {
            Some(CoalescedWrite::Scored { add, .. }) => {
                assert_eq!(add.get("s1").map(String::as_str), Some("9"));
            }
            other => panic!("unexpected coalesced state: {:?}", other),
        }
    }

    #[test]
    fn test_restore_keeps_newer_writes_on_top() {
        let mut pending = PendingWrites::default();
        pending.submit("sessions:s1", hset(&[("data", "old"), ("chat_id", "c")]));
        let mut snapshot = pending.take_all();
        assert!(pending.is_empty());

        // A newer write arrives while the snapshot is failing to flush.
        pending.submit("sessions:s1", hset(&[("data", "new")]));

        let (key, older) = snapshot.pop().unwrap();
        pending.restore(key, older);

        let entry = pending.get("sessions:s1").unwrap();
        match &entry.write {
            Some(CoalescedWrite::Hash { fields }) => {
                assert_eq!(fields.get("data").map(String::as_str), Some("new"));
                assert_eq!(fields.get("chat_id").map(String::as_str), Some("c"));
            }
            other => panic!("unexpected coalesced state: {:?}", other),
        }
    }

    #[test]
    fn test_restore_respects_newer_delete() {
        let mut pending = PendingWrites::default();
        pending.submit("sessions:s1", hset(&[("data", "old")]));
        let mut snapshot = pending.take_all();

        pending.submit("sessions:s1", WriteOp::Del);

        let (key, older) = snapshot.pop().unwrap();
        pending.restore(key, older);

        let entry = pending.get("sessions:s1").unwrap();
        assert!(entry.delete_first);
        assert!(entry.write.is_none());
    }
}
