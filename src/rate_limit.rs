//! Fixed-window admission control keyed by client.
//!
//! Every client key gets a counter and a window deadline. The table is
//! capped: when an insert pushes it past `max_entries`, a bounded expiry
//! sweep runs first and, if that was not enough, the entries with the
//! earliest deadlines are evicted.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use crate::metrics::{RATE_TABLE_EVICTIONS, TRACKED_CLIENTS};

pub const DEFAULT_WINDOW: Duration = Duration::from_secs(60);
pub const DEFAULT_MAX_ENTRIES: usize = 5_000;
pub const DEFAULT_CLEANUP_BATCH: usize = 100;

// Rate limit entry - tracks requests per client key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateRecord {
    pub count: u32,
    pub window_reset_at: Instant,
}

impl RateRecord {
    fn fresh(now: Instant, window: Duration) -> Self {
        Self {
            count: 1,
            // A window too large for the clock never resets, which is what a caller asking for it wants.
            window_reset_at: now.checked_add(window).unwrap_or(now),
        }
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now > self.window_reset_at
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Admitted,
    Rejected,
}

impl Decision {
    pub fn is_admitted(self) -> bool {
        matches!(self, Decision::Admitted)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    pub window: Duration,
    pub max_entries: usize,
    pub cleanup_batch: usize,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window: DEFAULT_WINDOW,
            max_entries: DEFAULT_MAX_ENTRIES,
            cleanup_batch: DEFAULT_CLEANUP_BATCH,
        }
    }
}

// Outcome of one capacity maintenance pass
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub expired: usize,
    pub evicted: usize,
}

pub struct AdmissionController {
    table: DashMap<String, RateRecord>,
    config: RateLimitConfig,
    maintaining: AtomicBool,
    // where the next expiry batch starts, in iteration order
    sweep_cursor: AtomicUsize,
    // set while evictions keep happening, so the warning is logged once
    over_capacity: AtomicBool,
}

impl AdmissionController {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            table: DashMap::new(),
            config,
            maintaining: AtomicBool::new(false),
            sweep_cursor: AtomicUsize::new(0),
            over_capacity: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    pub fn record(&self, key: &str) -> Option<RateRecord> {
        self.table.get(key).map(|r| *r)
    }

    // Same as check_and_record, reading the clock itself
    pub fn check(&self, key: &str, limit: u32) -> Decision {
        self.check_and_record(key, Instant::now(), limit)
    }

    /// Decides whether `key` may make another request at `now`.
    ///
    /// The shard lock for `key` is held across lookup and mutation, so two
    /// concurrent calls for the same key can never both open a new window.
    /// Rejections leave the record untouched.
    pub fn check_and_record(&self, key: &str, now: Instant, limit: u32) -> Decision {
        match self.table.entry(key.to_owned()) {
            Entry::Occupied(mut occupied) => {
                let record = occupied.get_mut();
                if record.is_expired(now) {
                    *record = RateRecord::fresh(now, self.config.window);
                } else if record.count >= limit {
                    return Decision::Rejected;
                } else {
                    record.count += 1;
                    return Decision::Admitted;
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(RateRecord::fresh(now, self.config.window));
            }
        }

        // New window opened; the shard lock is released by now.
        if self.table.len() > self.config.max_entries {
            self.maintain(now);
        }
        Decision::Admitted
    }

    /// Brings the table back under `max_entries`.
    ///
    /// Skipped when another thread is already running it.
    pub fn maintain(&self, now: Instant) -> MaintenanceReport {
        if self.maintaining.swap(true, Ordering::Acquire) {
            return MaintenanceReport::default();
        }

        let expired = self.sweep_expired_batch(now);
        let evicted = self.evict_oldest();
        self.maintaining.store(false, Ordering::Release);

        let report = MaintenanceReport { expired, evicted };
        if evicted > 0 {
            RATE_TABLE_EVICTIONS.inc_by(evicted as f64);
            if !self.over_capacity.swap(true, Ordering::Relaxed) {
                tracing::warn!(
                    expired,
                    evicted,
                    tracked = self.table.len(),
                    "rate table over capacity, evicting oldest windows"
                );
            } else {
                tracing::debug!(expired, evicted, tracked = self.table.len(), "evicted oldest windows");
            }
        } else {
            if self.over_capacity.swap(false, Ordering::Relaxed) {
                tracing::info!(tracked = self.table.len(), "rate table back under capacity");
            }
            tracing::debug!(expired, tracked = self.table.len(), "rate table maintenance");
        }
        TRACKED_CLIENTS.set(self.table.len() as f64);
        report
    }

    /// Removes every expired record. Returns how many were removed.
    pub fn sweep_expired(&self, now: Instant) -> usize {
        let before = self.table.len();
        self.table.retain(|_, record| !record.is_expired(now));
        let removed = before.saturating_sub(self.table.len());
        if self.table.len() <= self.config.max_entries {
            self.over_capacity.store(false, Ordering::Relaxed);
        }
        TRACKED_CLIENTS.set(self.table.len() as f64);
        removed
    }

    // Phase 1: look at no more than `cleanup_batch` entries, resuming where
    // the previous batch stopped so successive passes cover the whole table
    fn sweep_expired_batch(&self, now: Instant) -> usize {
        let len = self.table.len();
        let over = len.saturating_sub(self.config.max_entries);
        if over == 0 {
            return 0;
        }

        let mut start = self.sweep_cursor.load(Ordering::Relaxed);
        if start >= len {
            start = 0;
        }

        // Collect first: removing while iterating would deadlock on the shard.
        let mut expired = Vec::new();
        let mut scanned = 0;
        for entry in self.table.iter().skip(start).take(self.config.cleanup_batch) {
            scanned += 1;
            if entry.value().is_expired(now) {
                expired.push(entry.key().clone());
                if expired.len() >= over {
                    break;
                }
            }
        }

        let reached_end = scanned < self.config.cleanup_batch && expired.len() < over;
        let next = if reached_end { 0 } else { start + scanned };
        self.sweep_cursor.store(next, Ordering::Relaxed);

        expired
            .into_iter()
            .filter(|key| {
                self.table
                    .remove_if(key, |_, record| record.is_expired(now))
                    .is_some()
            })
            .count()
    }

    // Phase 2: hard cap, drop the earliest deadlines
    fn evict_oldest(&self) -> usize {
        let excess = self.table.len().saturating_sub(self.config.max_entries);
        if excess == 0 {
            return 0;
        }

        let snapshot: Vec<(String, Instant)> = self
            .table
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().window_reset_at))
            .collect();

        oldest_keys(snapshot, excess)
            .into_iter()
            .filter(|(key, reset_at)| {
                // A record refreshed since the snapshot is no longer among the oldest.
                self.table
                    .remove_if(key, |_, record| record.window_reset_at == *reset_at)
                    .is_some()
            })
            .count()
    }
}

/// Picks the `k` entries with the smallest deadlines, in no particular order.
///
/// Expected O(n). Entries with equal deadlines on the selection boundary may
/// land on either side.
pub fn oldest_keys<K>(mut entries: Vec<(K, Instant)>, k: usize) -> Vec<(K, Instant)> {
    if k == 0 {
        return Vec::new();
    }
    if k < entries.len() {
        entries.select_nth_unstable_by_key(k - 1, |(_, reset_at)| *reset_at);
        entries.truncate(k);
    }
    entries
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller(max_entries: usize, cleanup_batch: usize) -> AdmissionController {
        AdmissionController::new(RateLimitConfig {
            window: Duration::from_secs(60),
            max_entries,
            cleanup_batch,
        })
    }

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    #[test]
    fn first_request_opens_window() {
        let limiter = controller(100, 10);
        let t0 = Instant::now();

        assert_eq!(limiter.check_and_record("1.2.3.4", t0, 60), Decision::Admitted);
        let record = limiter.record("1.2.3.4").unwrap();
        assert_eq!(record.count, 1);
        assert_eq!(record.window_reset_at, t0 + secs(60));
    }

    #[test]
    fn limit_then_reset_after_window() {
        let limiter = controller(100, 10);
        let t0 = Instant::now();
        let key = "1.2.3.4";

        let outcomes: Vec<_> = [0, 10, 20, 30]
            .iter()
            .map(|s| limiter.check_and_record(key, t0 + secs(*s), 3))
            .collect();
        assert_eq!(
            outcomes,
            vec![
                Decision::Admitted,
                Decision::Admitted,
                Decision::Admitted,
                Decision::Rejected
            ]
        );
        assert_eq!(limiter.record(key).unwrap().count, 3);

        // still inside the window at exactly the deadline
        assert_eq!(limiter.check_and_record(key, t0 + secs(60), 3), Decision::Rejected);

        assert_eq!(limiter.check_and_record(key, t0 + secs(61), 3), Decision::Admitted);
        let record = limiter.record(key).unwrap();
        assert_eq!(record.count, 1);
        assert_eq!(record.window_reset_at, t0 + secs(121));
    }

    #[test]
    fn rejection_does_not_mutate() {
        let limiter = controller(100, 10);
        let t0 = Instant::now();

        limiter.check_and_record("k", t0, 1);
        let before = limiter.record("k").unwrap();
        for i in 1..20 {
            assert_eq!(limiter.check_and_record("k", t0 + secs(i), 1), Decision::Rejected);
        }
        assert_eq!(limiter.record("k").unwrap(), before);
    }

    #[test]
    fn keys_are_isolated() {
        let limiter = controller(100, 10);
        let t0 = Instant::now();

        for _ in 0..5 {
            limiter.check_and_record("a", t0, 5);
        }
        assert_eq!(limiter.check_and_record("a", t0, 5), Decision::Rejected);
        assert_eq!(limiter.check_and_record("b", t0 + secs(30), 5), Decision::Admitted);

        let a = limiter.record("a").unwrap();
        let b = limiter.record("b").unwrap();
        assert_eq!(a.count, 5);
        assert_eq!(a.window_reset_at, t0 + secs(60));
        assert_eq!(b.count, 1);
        assert_eq!(b.window_reset_at, t0 + secs(90));
    }

    #[test]
    fn unknown_bucket_has_stricter_limit() {
        let limiter = controller(100, 10);
        let t0 = Instant::now();

        for _ in 0..10 {
            assert!(limiter.check_and_record("unknown", t0, 10).is_admitted());
            assert!(limiter.check_and_record("9.9.9.9", t0, 60).is_admitted());
        }
        assert_eq!(limiter.check_and_record("unknown", t0, 10), Decision::Rejected);
        assert_eq!(limiter.check_and_record("9.9.9.9", t0, 60), Decision::Admitted);
    }

    #[test]
    fn expired_record_behaves_like_absent() {
        let t0 = Instant::now();
        let later = t0 + secs(500);

        let reused = controller(100, 10);
        for _ in 0..4 {
            reused.check_and_record("k", t0, 3);
        }
        let fresh = controller(100, 10);

        assert_eq!(
            reused.check_and_record("k", later, 3),
            fresh.check_and_record("k", later, 3)
        );
        assert_eq!(reused.record("k"), fresh.record("k"));
    }

    #[test]
    fn capacity_bound_restored_after_insert() {
        let limiter = controller(50, 10);
        let t0 = Instant::now();

        for i in 0..500u64 {
            limiter.check_and_record(&format!("10.0.{}.{}", i / 256, i % 256), t0 + Duration::from_millis(i), 60);
            assert!(limiter.len() <= 50, "size {} after insert {}", limiter.len(), i);
        }
    }

    #[test]
    fn expired_entries_go_first() {
        let limiter = controller(3, 100);
        let t0 = Instant::now();

        limiter.check_and_record("old", t0, 60);
        limiter.check_and_record("a", t0 + secs(50), 60);
        limiter.check_and_record("b", t0 + secs(55), 60);
        // "old" expired at t0+60
        limiter.check_and_record("c", t0 + secs(70), 60);

        assert_eq!(limiter.len(), 3);
        assert!(limiter.record("old").is_none());
        for key in ["a", "b", "c"] {
            assert!(limiter.record(key).is_some(), "{key} evicted");
        }
    }

    #[test]
    fn hard_cap_evicts_earliest_deadlines() {
        // Nothing is expired, so only phase 2 can make room.
        let limiter = controller(5, 100);
        let t0 = Instant::now();

        for i in 0..8u64 {
            limiter.check_and_record(&format!("k{i}"), t0 + secs(i), 60);
        }

        assert_eq!(limiter.len(), 5);
        for i in 0..3 {
            assert!(limiter.record(&format!("k{i}")).is_none());
        }
        for i in 3..8 {
            assert!(limiter.record(&format!("k{i}")).is_some());
        }
    }

    // Inserts straight into the table, skipping the maintenance check_and_record runs.
    fn fill(limiter: &AdmissionController, prefix: &str, n: usize, reset_at: Instant) {
        for i in 0..n {
            limiter.table.insert(
                format!("{prefix}{i}"),
                RateRecord {
                    count: 1,
                    window_reset_at: reset_at,
                },
            );
        }
    }

    // Rewrites every deadline by position in iteration order and returns the keys in that order.
    fn set_deadlines(
        limiter: &AdmissionController,
        expired_at: Instant,
        live_until: Instant,
        expired: impl Fn(usize) -> bool,
    ) -> Vec<String> {
        let mut keys = Vec::new();
        for (i, mut entry) in limiter.table.iter_mut().enumerate() {
            entry.window_reset_at = if expired(i) { expired_at } else { live_until };
            keys.push(entry.key().clone());
        }
        keys
    }

    #[test]
    fn expiry_batch_stops_at_cleanup_batch() {
        let limiter = controller(10, 4);
        let t0 = Instant::now();
        fill(&limiter, "k", 14, t0 + secs(60));
        // only entries past the first batch are expired
        let keys = set_deadlines(&limiter, t0, t0 + secs(60), |i| i >= 4);

        let report = limiter.maintain(t0 + secs(1));

        assert_eq!(report, MaintenanceReport { expired: 0, evicted: 4 });
        assert_eq!(limiter.len(), 10);
        for key in &keys[..4] {
            assert!(limiter.record(key).is_some(), "{key} evicted");
        }
    }

    #[test]
    fn expiry_batch_stops_once_under_bound() {
        let limiter = controller(10, 4);
        let t0 = Instant::now();
        fill(&limiter, "k", 11, t0 + secs(60));
        let keys = set_deadlines(&limiter, t0, t0 + secs(60), |i| i < 3);

        let report = limiter.maintain(t0 + secs(1));

        assert_eq!(report, MaintenanceReport { expired: 1, evicted: 0 });
        assert_eq!(limiter.len(), 10);
        let expired_left = keys[..3]
            .iter()
            .filter(|key| limiter.record(key).is_some())
            .count();
        assert_eq!(expired_left, 2);
    }

    #[test]
    fn expiry_batch_resumes_where_previous_stopped() {
        let limiter = controller(12, 4);
        let t0 = Instant::now();
        let now = t0 + secs(1);
        let live = t0 + secs(60);
        fill(&limiter, "k", 13, live);

        // Expired entries sit from position 8 on; each pass is one entry over.
        set_deadlines(&limiter, t0, live, |i| i >= 8);
        assert_eq!(limiter.maintain(now), MaintenanceReport { expired: 0, evicted: 1 });

        fill(&limiter, "second", 1, live);
        set_deadlines(&limiter, t0, live, |i| i >= 8);
        assert_eq!(limiter.maintain(now), MaintenanceReport { expired: 0, evicted: 1 });

        // third batch starts at position 8
        fill(&limiter, "third", 1, live);
        set_deadlines(&limiter, t0, live, |i| i >= 8);
        assert_eq!(limiter.maintain(now), MaintenanceReport { expired: 1, evicted: 0 });
        assert_eq!(limiter.len(), 12);
    }

    #[test]
    fn expiry_batch_wraps_to_start() {
        let limiter = controller(5, 4);
        let t0 = Instant::now();
        let live = t0 + secs(60);
        fill(&limiter, "k", 6, live);
        limiter.sweep_cursor.store(100, Ordering::Relaxed);
        set_deadlines(&limiter, t0, live, |i| i == 0);

        assert_eq!(
            limiter.maintain(t0 + secs(1)),
            MaintenanceReport { expired: 1, evicted: 0 }
        );
    }

    #[test]
    fn over_capacity_flag_spans_one_episode() {
        let limiter = controller(3, 10);
        let t0 = Instant::now();
        fill(&limiter, "k", 5, t0 + secs(60));

        assert_eq!(limiter.maintain(t0).evicted, 2);
        assert!(limiter.over_capacity.load(Ordering::Relaxed));

        // still evicting: same episode
        fill(&limiter, "more", 1, t0 + secs(60));
        assert_eq!(limiter.maintain(t0).evicted, 1);
        assert!(limiter.over_capacity.load(Ordering::Relaxed));

        assert_eq!(limiter.maintain(t0), MaintenanceReport::default());
        assert!(!limiter.over_capacity.load(Ordering::Relaxed));

        // a full sweep that leaves the table within bounds also ends it
        fill(&limiter, "late", 2, t0 + secs(60));
        limiter.maintain(t0);
        assert!(limiter.over_capacity.load(Ordering::Relaxed));
        limiter.sweep_expired(t0);
        assert!(!limiter.over_capacity.load(Ordering::Relaxed));
    }

    #[test]
    fn oldest_keys_matches_sorted_reference() {
        let t0 = Instant::now();
        // deliberate duplicates
        let offsets = [42u64, 7, 19, 7, 88, 3, 61, 19, 19, 55, 0, 90, 12, 33, 7];
        let entries: Vec<(usize, Instant)> = offsets
            .iter()
            .enumerate()
            .map(|(i, s)| (i, t0 + secs(*s)))
            .collect();

        for k in 0..=entries.len() + 2 {
            let picked = oldest_keys(entries.clone(), k);

            let mut reference: Vec<Instant> = entries.iter().map(|(_, at)| *at).collect();
            reference.sort();
            let kept_reference: Vec<Instant> = reference.iter().skip(k).copied().collect();
            reference.truncate(k);

            let mut picked_times: Vec<Instant> = picked.iter().map(|(_, at)| *at).collect();
            picked_times.sort();
            assert_eq!(picked_times, reference, "k = {k}");

            let mut kept: Vec<Instant> = entries
                .iter()
                .filter(|(i, _)| !picked.iter().any(|(p, _)| p == i))
                .map(|(_, at)| *at)
                .collect();
            kept.sort();
            assert_eq!(kept, kept_reference, "k = {k}");
        }
    }

    #[test]
    fn sweep_removes_only_expired() {
        let limiter = controller(100, 10);
        let t0 = Instant::now();

        limiter.check_and_record("a", t0, 60);
        limiter.check_and_record("b", t0 + secs(30), 60);
        limiter.check_and_record("c", t0 + secs(90), 60);

        assert_eq!(limiter.sweep_expired(t0 + secs(95)), 2);
        assert_eq!(limiter.len(), 1);
        assert!(limiter.record("c").is_some());
    }

    #[test]
    fn concurrent_callers_share_one_window() {
        use std::sync::Arc;

        let limiter = Arc::new(controller(100, 10));
        let t0 = Instant::now();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                std::thread::spawn(move || {
                    (0..50)
                        .filter(|_| limiter.check_and_record("shared", t0, 100).is_admitted())
                        .count()
                })
            })
            .collect();

        let admitted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(admitted, 100);
        assert_eq!(limiter.record("shared").unwrap().count, 100);
    }
}
