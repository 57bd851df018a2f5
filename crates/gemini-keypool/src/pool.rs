//! Pool state machine and round-robin key selection
//!
//! The pool owns a fixed ring of key slots (record fields, runtime state,
//! and a lazily created token bucket) plus the rotation cursor. Selection
//! scans the ring from the cursor, skips keys that are not active or have
//! no bucket capacity, and on success advances the cursor past the
//! dispensed key, so eligible keys are served round-robin and none is
//! starved while it keeps regaining tokens.
//!
//! All mutable state sits behind one `tokio::sync::Mutex`. The coarse
//! critical section is deliberate: call volume is bounded by the latency of
//! the upstream API call each key is about to perform, so contention on a
//! single lock is negligible and per-field locking would add risk without
//! benefit. Nothing awaits or does I/O while the lock is held.

use std::fmt;
use std::time::{Duration, Instant};

use gemini_keystore::{KeyRecord, KeyStatus, Secret, mask_key};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::bucket::TokenBucket;
use crate::error::{Error, Result};
use crate::metrics;

/// Runtime state of a pooled key.
///
/// Transitions:
/// - Active → Inactive (failure reported, default policy; terminal)
/// - Active → CoolingDown (failure reported, cooldown policy)
/// - CoolingDown → Active (cooldown expired, checked at selection time)
///
/// Nothing in the pool reactivates an `Inactive` key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyState {
    Active,
    CoolingDown { until: Instant },
    Inactive,
}

impl KeyState {
    /// State label for health output and logging.
    pub fn label(&self) -> &'static str {
        match self {
            KeyState::Active => "active",
            KeyState::CoolingDown { .. } => "cooling_down",
            KeyState::Inactive => "inactive",
        }
    }
}

/// What `report_failure` does to a key.
///
/// `Retire` is the default: any reported failure permanently removes the
/// key from rotation for the rest of the process lifetime. `Cooldown`
/// trades that bluntness for a reactivation window - the key re-enters
/// rotation once the window elapses, the same way a tripped circuit
/// breaker half-opens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    Retire,
    Cooldown(Duration),
}

/// A selected key, ready for an upstream call.
///
/// `key` is the raw key material; callers need it for the request itself,
/// and they hand it back verbatim to `report_success`/`report_failure`.
/// Log only the masked form.
pub struct SelectedKey {
    pub key: String,
    pub rpm_limit: u32,
}

impl fmt::Debug for SelectedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SelectedKey")
            .field("key", &mask_key(&self.key))
            .field("rpm_limit", &self.rpm_limit)
            .finish()
    }
}

/// One ring position: record fields plus runtime state.
#[derive(Debug)]
struct Slot {
    key: Secret<String>,
    rpm_limit: u32,
    used_count: u64,
    state: KeyState,
    bucket: Option<TokenBucket>,
}

#[derive(Debug)]
struct Inner {
    slots: Vec<Slot>,
    cursor: usize,
}

/// Admission pool over a fixed ring of API keys.
///
/// Construct once at service start and share by reference (`Arc<KeyPool>`);
/// a second instance would lose bucket levels and the rotation position.
#[derive(Debug)]
pub struct KeyPool {
    inner: Mutex<Inner>,
    failure_policy: FailurePolicy,
}

impl KeyPool {
    /// Create a pool with the default failure policy (`Retire`).
    pub fn new(records: Vec<KeyRecord>) -> Result<Self> {
        Self::with_policy(records, FailurePolicy::Retire)
    }

    /// Create a pool with an explicit failure policy.
    ///
    /// Record order is the rotation order. Returns `Error::Empty` for an
    /// empty record list so a never-configured pool stays distinguishable
    /// from an exhausted one.
    pub fn with_policy(records: Vec<KeyRecord>, failure_policy: FailurePolicy) -> Result<Self> {
        if records.is_empty() {
            return Err(Error::Empty);
        }
        let slots: Vec<Slot> = records
            .into_iter()
            .map(|record| {
                let state = match record.status {
                    KeyStatus::Active => KeyState::Active,
                    KeyStatus::Inactive => KeyState::Inactive,
                };
                Slot {
                    key: record.key,
                    rpm_limit: record.quota.rpm_limit,
                    used_count: record.quota.used_count,
                    state,
                    bucket: None,
                }
            })
            .collect();
        info!(keys = slots.len(), policy = ?failure_policy, "key pool initialized");
        Ok(Self {
            inner: Mutex::new(Inner { slots, cursor: 0 }),
            failure_policy,
        })
    }

    /// Select the next usable key round-robin.
    ///
    /// Scans the ring starting at the cursor. Keys that are inactive or in
    /// an unexpired cooldown are skipped; an expired cooldown transitions
    /// back to active and the key is considered. For each candidate the
    /// bucket (created on first use) is asked for one token; the first key
    /// that yields a token is returned and the cursor moves past it.
    ///
    /// A full wrap with no success returns `Error::Exhausted` carrying a
    /// JSON summary of pool counts. The probe never blocks and a failed
    /// scan leaves the cursor and every token count untouched, so repeating
    /// it without elapsed time or state change repeats the result.
    pub async fn select(&self) -> Result<SelectedKey> {
        let mut inner = self.inner.lock().await;
        let n = inner.slots.len();
        let now = Instant::now();
        let start = inner.cursor;

        for offset in 0..n {
            let idx = (start + offset) % n;
            let slot = &mut inner.slots[idx];

            match slot.state {
                KeyState::Active => {}
                KeyState::CoolingDown { until } if now >= until => {
                    info!(key = %slot.key.masked(), "cooldown expired, key active again");
                    slot.state = KeyState::Active;
                }
                _ => continue,
            }

            let rpm_limit = slot.rpm_limit;
            let bucket = slot.bucket.get_or_insert_with(|| TokenBucket::new(rpm_limit));
            if bucket.try_consume_at(1.0, now) {
                let selected = SelectedKey {
                    key: slot.key.expose().clone(),
                    rpm_limit,
                };
                debug!(key = %slot.key.masked(), "key selected");
                inner.cursor = (idx + 1) % n;
                metrics::record_selection();
                return Ok(selected);
            }
        }

        let (total, active, cooling, inactive) = inner.count_states(now);
        debug!(total, active, cooling, inactive, "ring exhausted, no key admitted");
        metrics::record_exhausted();
        Err(Error::Exhausted(exhausted_message(
            total, active, cooling, inactive,
        )))
    }

    /// Record a successful upstream call for `key`.
    ///
    /// Bumps the informational usage counter only; the bucket was already
    /// debited at selection time. Unknown keys are logged and ignored.
    pub async fn report_success(&self, key: &str) {
        let mut inner = self.inner.lock().await;
        match inner.slots.iter_mut().find(|s| s.key.expose() == key) {
            Some(slot) => {
                slot.used_count += 1;
                debug!(key = %slot.key.masked(), used_count = slot.used_count, "usage recorded");
                metrics::record_report("success");
            }
            None => warn!(key = %mask_key(key), "success reported for unknown key"),
        }
    }

    /// Record a failed upstream call for `key`.
    ///
    /// Under the default `Retire` policy the key is set inactive and never
    /// selected again; under `Cooldown` it re-enters rotation once the
    /// window elapses. Unknown keys are logged and ignored.
    pub async fn report_failure(&self, key: &str) {
        let mut inner = self.inner.lock().await;
        let Some(slot) = inner.slots.iter_mut().find(|s| s.key.expose() == key) else {
            warn!(key = %mask_key(key), "failure reported for unknown key");
            return;
        };
        match self.failure_policy {
            FailurePolicy::Retire => {
                warn!(key = %slot.key.masked(), "key retired (failure reported)");
                slot.state = KeyState::Inactive;
            }
            FailurePolicy::Cooldown(duration) => {
                warn!(
                    key = %slot.key.masked(),
                    cooldown_secs = duration.as_secs(),
                    "key entering cooldown (failure reported)"
                );
                slot.state = KeyState::CoolingDown {
                    until: Instant::now() + duration,
                };
            }
        }
        metrics::record_report("failure");
    }

    /// Pool snapshot for a health endpoint.
    ///
    /// Returns per-key entries (masked key material only) and aggregate
    /// counts. Status mapping: all keys active → healthy, some active →
    /// degraded, none active → unhealthy. An expired cooldown counts as
    /// active even before the next selection performs the transition.
    pub async fn health(&self) -> serde_json::Value {
        let inner = self.inner.lock().await;
        let now = Instant::now();

        let mut keys = Vec::new();
        let mut active = 0usize;
        let mut cooling = 0usize;
        let mut inactive = 0usize;

        for slot in &inner.slots {
            match slot.state {
                KeyState::CoolingDown { until } if now < until => {
                    cooling += 1;
                    keys.push(serde_json::json!({
                        "key": slot.key.masked(),
                        "status": slot.state.label(),
                        "rpm_limit": slot.rpm_limit,
                        "used_count": slot.used_count,
                        "cooldown_remaining_secs": (until - now).as_secs(),
                    }));
                }
                KeyState::Inactive => {
                    inactive += 1;
                    keys.push(serde_json::json!({
                        "key": slot.key.masked(),
                        "status": slot.state.label(),
                        "rpm_limit": slot.rpm_limit,
                        "used_count": slot.used_count,
                    }));
                }
                _ => {
                    active += 1;
                    keys.push(serde_json::json!({
                        "key": slot.key.masked(),
                        "status": "active",
                        "rpm_limit": slot.rpm_limit,
                        "used_count": slot.used_count,
                    }));
                }
            }
        }

        let total = inner.slots.len();
        let status = if active == total && total > 0 {
            "healthy"
        } else if active > 0 {
            "degraded"
        } else {
            "unhealthy"
        };

        serde_json::json!({
            "status": status,
            "keys_total": total,
            "keys_active": active,
            "keys_cooling_down": cooling,
            "keys_inactive": inactive,
            "keys": keys,
        })
    }

    /// Number of keys in the ring (all states).
    pub async fn len(&self) -> usize {
        self.inner.lock().await.slots.len()
    }

    /// Whether the ring is empty. Always false for a constructed pool.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl Inner {
    /// Count slots by state: (total, active, cooling, inactive). An expired
    /// cooldown counts as active.
    fn count_states(&self, now: Instant) -> (usize, usize, usize, usize) {
        let total = self.slots.len();
        let mut active = 0usize;
        let mut cooling = 0usize;
        let mut inactive = 0usize;
        for slot in &self.slots {
            match slot.state {
                KeyState::Active => active += 1,
                KeyState::CoolingDown { until } => {
                    if now >= until {
                        active += 1;
                    } else {
                        cooling += 1;
                    }
                }
                KeyState::Inactive => inactive += 1,
            }
        }
        (total, active, cooling, inactive)
    }
}

/// Build the exhausted error payload.
fn exhausted_message(total: usize, active: usize, cooling: usize, inactive: usize) -> String {
    serde_json::json!({
        "error": {
            "type": "pool_exhausted",
            "message": "no API key available",
            "pool": {
                "keys_total": total,
                "keys_active": active,
                "keys_cooling_down": cooling,
                "keys_inactive": inactive
            }
        }
    })
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use gemini_keystore::KeyQuota;
    use std::sync::Arc;

    fn record(key: &str, rpm_limit: u32) -> KeyRecord {
        KeyRecord {
            key: Secret::new(key.to_string()),
            status: KeyStatus::Active,
            quota: KeyQuota {
                rpm_limit,
                used_count: 0,
            },
        }
    }

    fn inactive_record(key: &str, rpm_limit: u32) -> KeyRecord {
        KeyRecord {
            status: KeyStatus::Inactive,
            ..record(key, rpm_limit)
        }
    }

    /// Parse the JSON summary out of an `Exhausted` error.
    fn exhausted_json(err: &Error) -> serde_json::Value {
        let msg = err.to_string();
        let payload = msg
            .strip_prefix("key pool exhausted: ")
            .unwrap_or_else(|| panic!("unexpected error display: {msg}"));
        serde_json::from_str(payload).unwrap()
    }

    #[tokio::test]
    async fn round_robin_cycles_through_keys() {
        let pool = KeyPool::new(vec![
            record("key-a", 600),
            record("key-b", 600),
            record("key-c", 600),
        ])
        .unwrap();

        let order: Vec<String> = [
            pool.select().await.unwrap(),
            pool.select().await.unwrap(),
            pool.select().await.unwrap(),
            pool.select().await.unwrap(),
        ]
        .into_iter()
        .map(|s| s.key)
        .collect();

        assert_eq!(order, vec!["key-a", "key-b", "key-c", "key-a"]);
    }

    #[tokio::test]
    async fn select_returns_key_material_and_limit() {
        let pool = KeyPool::new(vec![record("key-a", 60)]).unwrap();

        let selected = pool.select().await.unwrap();
        assert_eq!(selected.key, "key-a");
        assert_eq!(selected.rpm_limit, 60);
    }

    #[tokio::test]
    async fn capacity_two_pair_interleaves_then_exhausts() {
        // Two keys with a burst of 2 each: rotation interleaves them, the
        // fifth call finds both buckets empty.
        let pool = KeyPool::new(vec![record("key-a", 2), record("key-b", 2)]).unwrap();

        let order: Vec<String> = [
            pool.select().await.unwrap(),
            pool.select().await.unwrap(),
            pool.select().await.unwrap(),
            pool.select().await.unwrap(),
        ]
        .into_iter()
        .map(|s| s.key)
        .collect();
        assert_eq!(order, vec!["key-a", "key-b", "key-a", "key-b"]);

        let err = pool.select().await.unwrap_err();
        let json = exhausted_json(&err);
        assert_eq!(json["error"]["type"], "pool_exhausted");
        assert_eq!(json["error"]["pool"]["keys_total"], 2);
        // Both keys are still active, just momentarily out of tokens
        assert_eq!(json["error"]["pool"]["keys_active"], 2);
        assert_eq!(json["error"]["pool"]["keys_inactive"], 0);

        // A failed probe has no hidden side effects: probing again without
        // state change yields the same outcome
        let again = pool.select().await.unwrap_err();
        assert!(matches!(again, Error::Exhausted(_)));
    }

    #[tokio::test]
    async fn rate_limited_key_is_skipped() {
        // key-a runs out after two requests; subsequent selections all land
        // on key-b without an exhaustion error.
        let pool = KeyPool::new(vec![record("key-a", 2), record("key-b", 600)]).unwrap();

        let mut order = Vec::new();
        for _ in 0..6 {
            order.push(pool.select().await.unwrap().key);
        }
        assert_eq!(
            order,
            vec!["key-a", "key-b", "key-a", "key-b", "key-b", "key-b"]
        );
    }

    #[tokio::test]
    async fn reported_failure_retires_key_permanently() {
        let pool = KeyPool::new(vec![record("key-a", 600), record("key-b", 600)]).unwrap();

        pool.report_failure("key-a").await;

        // key-a's bucket is full, but it is never selected again
        for _ in 0..5 {
            assert_eq!(pool.select().await.unwrap().key, "key-b");
        }

        // Time passing does not bring it back under the default policy
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(pool.select().await.unwrap().key, "key-b");

        let health = pool.health().await;
        assert_eq!(health["keys_inactive"], 1);
        assert_eq!(health["status"], "degraded");
    }

    #[tokio::test]
    async fn all_keys_retired_is_unhealthy_and_exhausted() {
        let pool = KeyPool::new(vec![record("key-a", 600), record("key-b", 600)]).unwrap();

        pool.report_failure("key-a").await;
        pool.report_failure("key-b").await;

        let err = pool.select().await.unwrap_err();
        let json = exhausted_json(&err);
        assert_eq!(json["error"]["pool"]["keys_active"], 0);
        assert_eq!(json["error"]["pool"]["keys_inactive"], 2);

        let health = pool.health().await;
        assert_eq!(health["status"], "unhealthy");
    }

    #[tokio::test]
    async fn inactive_seed_is_never_selected() {
        let pool = KeyPool::new(vec![inactive_record("key-a", 600), record("key-b", 600)]).unwrap();

        for _ in 0..3 {
            assert_eq!(pool.select().await.unwrap().key, "key-b");
        }

        let health = pool.health().await;
        assert_eq!(health["keys_inactive"], 1);
    }

    #[tokio::test]
    async fn report_success_increments_used_count_from_seed() {
        let mut seeded = record("key-a", 600);
        seeded.quota.used_count = 41;
        let pool = KeyPool::new(vec![seeded]).unwrap();

        pool.report_success("key-a").await;
        pool.report_success("key-a").await;

        let health = pool.health().await;
        assert_eq!(health["keys"][0]["used_count"], 43);

        // Failure feedback must not touch the usage counter
        pool.report_failure("key-a").await;
        let health = pool.health().await;
        assert_eq!(health["keys"][0]["used_count"], 43);
    }

    #[tokio::test]
    async fn unknown_key_reports_are_ignored() {
        let pool = KeyPool::new(vec![record("key-a", 600)]).unwrap();

        pool.report_success("ghost-key").await;
        pool.report_failure("ghost-key").await;

        let health = pool.health().await;
        assert_eq!(health["keys_active"], 1);
        assert_eq!(health["keys"][0]["used_count"], 0);
    }

    #[tokio::test]
    async fn empty_record_list_is_a_constructor_error() {
        let err = KeyPool::new(vec![]).unwrap_err();
        assert!(matches!(err, Error::Empty));
    }

    #[tokio::test]
    async fn cooldown_policy_reactivates_after_window() {
        let pool = KeyPool::with_policy(
            vec![record("key-a", 600)],
            FailurePolicy::Cooldown(Duration::ZERO),
        )
        .unwrap();

        pool.report_failure("key-a").await;

        // Zero-length window: expired by the time we look again
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(pool.select().await.unwrap().key, "key-a");
    }

    #[tokio::test]
    async fn cooldown_policy_skips_while_cooling() {
        let pool = KeyPool::with_policy(
            vec![record("key-a", 600), record("key-b", 600)],
            FailurePolicy::Cooldown(Duration::from_secs(7200)),
        )
        .unwrap();

        pool.report_failure("key-a").await;

        for _ in 0..3 {
            assert_eq!(pool.select().await.unwrap().key, "key-b");
        }

        let health = pool.health().await;
        assert_eq!(health["status"], "degraded");
        assert_eq!(health["keys_cooling_down"], 1);
        let remaining = health["keys"][0]["cooldown_remaining_secs"].as_u64().unwrap();
        assert!(remaining > 0, "remaining should be > 0, got {remaining}");
    }

    #[tokio::test]
    async fn exhausted_pool_recovers_after_refill() {
        // One key at 60 rpm: the full burst drains, then one token comes
        // back after a second.
        let pool = KeyPool::new(vec![record("key-a", 60)]).unwrap();

        for i in 0..60 {
            assert!(pool.select().await.is_ok(), "select {i} within burst");
        }
        assert!(matches!(
            pool.select().await.unwrap_err(),
            Error::Exhausted(_)
        ));

        tokio::time::sleep(Duration::from_millis(1050)).await;
        assert_eq!(pool.select().await.unwrap().key, "key-a");
    }

    #[tokio::test]
    async fn health_masks_key_material() {
        let pool = KeyPool::new(vec![record("AIzaSyD4X9c2W-example-7Qk3", 60)]).unwrap();

        let rendered = pool.health().await.to_string();
        assert!(
            !rendered.contains("AIzaSyD4X9c2W-example-7Qk3"),
            "raw key leaked into health output: {rendered}"
        );
        assert!(rendered.contains("AIzaSy****7Qk3"));
    }

    #[tokio::test]
    async fn selected_key_debug_masks_material() {
        let pool = KeyPool::new(vec![record("AIzaSyD4X9c2W-example-7Qk3", 60)]).unwrap();

        let selected = pool.select().await.unwrap();
        let debug = format!("{selected:?}");
        assert!(!debug.contains("example"), "raw key leaked: {debug}");
        assert!(debug.contains("AIzaSy****7Qk3"));
    }

    #[tokio::test]
    async fn health_all_active_is_healthy() {
        let pool = KeyPool::new(vec![record("key-a", 600), record("key-b", 600)]).unwrap();

        let health = pool.health().await;
        assert_eq!(health["status"], "healthy");
        assert_eq!(health["keys_total"], 2);
        assert_eq!(health["keys_active"], 2);
    }

    #[tokio::test]
    async fn concurrent_callers_are_serialized() {
        let pool = Arc::new(
            KeyPool::new(vec![record("key-a", 600), record("key-b", 600)]).unwrap(),
        );

        let mut handles = Vec::new();
        for _ in 0..10 {
            let pool = Arc::clone(&pool);
            handles.push(tokio::spawn(async move {
                let selected = pool.select().await.unwrap();
                pool.report_success(&selected.key).await;
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        // Every selection and report landed exactly once
        let health = pool.health().await;
        let total_used: u64 = health["keys"]
            .as_array()
            .unwrap()
            .iter()
            .map(|k| k["used_count"].as_u64().unwrap())
            .sum();
        assert_eq!(total_used, 10);
    }
}
