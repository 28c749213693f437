//! Tiered sliding-window admission control with an explicit block list.
//!
//! Every call passes through four stages, stopping at the first rejection:
//!
//! 1. **Block list**: an active [`BlockEntry`] for the user rejects outright;
//!    an expired one is removed on the spot.
//! 2. **User tier**: `max_calls` per `(user, api_type)` window.
//! 3. **Address tier**: `2 × max_calls` per `(address, api_type)`, only when an
//!    address is supplied.
//! 4. **Global tier**: `100 × max_calls` per `api_type`.
//!
//! Tiers are checked against pruned logs first and the call's timestamp is
//! appended to all of them only once every tier has passed, so a call
//! rejected by the global tier does not consume the user's own budget.

mod types;
mod window;

pub use types::{BlockEntry, CleanupReport, Decision, LimiterMetadata, RateLimitStats, Tier, UserRateInfo};
pub use window::WindowLog;

use crate::clock::{millis_to_utc, Clock, SystemClock};
use crate::config::{AbusePolicy, MonitorConfig, PolicyTable, SharedPolicy};
use crate::error::RateLimitExceeded;
use crate::maintenance::{spawn_periodic, MaintenanceHandle};
use crate::store::{parse_entries, SnapshotStore};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, info, warn};

const MINUTE_MS: u64 = 60_000;
const HOUR_MS: u64 = 60 * MINUTE_MS;
const RETAIN_MS: u64 = 24 * HOUR_MS;
const ADDRESS_MULTIPLIER: usize = 2;
const GLOBAL_MULTIPLIER: usize = 100;
// detached snapshot whenever a global log reaches a multiple of this length
const SNAPSHOT_EVERY: usize = 10;

type LogsByApi = BTreeMap<String, WindowLog>;

#[derive(Debug)]
struct LimiterState {
    metadata: LimiterMetadata,
    user_limits: BTreeMap<String, LogsByApi>,
    ip_limits: BTreeMap<String, LogsByApi>,
    global_limits: LogsByApi,
    blocked_users: BTreeMap<String, BlockEntry>,
    extra: Map<String, Value>,
    // per-user rejections feeding auto-blocking; not persisted
    denials: BTreeMap<String, WindowLog>,
    generation: u64,
}

#[derive(Serialize)]
struct LimiterDocument<'a> {
    metadata: &'a LimiterMetadata,
    user_limits: &'a BTreeMap<String, LogsByApi>,
    ip_limits: &'a BTreeMap<String, LogsByApi>,
    global_limits: &'a LogsByApi,
    blocked_users: &'a BTreeMap<String, BlockEntry>,
    #[serde(flatten)]
    extra: &'a Map<String, Value>,
}

/// Prune `log` to the window and report the wait if it is full.
fn tier_wait(log: &mut WindowLog, limit: usize, window_ms: u64, now_ms: u64) -> Option<Duration> {
    log.prune(now_ms.saturating_sub(window_ms));
    if log.len() < limit {
        return None;
    }
    let oldest = log.oldest().unwrap_or(now_ms);
    Some(Duration::from_millis((oldest + window_ms).saturating_sub(now_ms)))
}

fn prune_nested(logs: &mut BTreeMap<String, LogsByApi>, cutoff_ms: u64, report: &mut CleanupReport) {
    logs.retain(|_, by_api| {
        prune_flat(by_api, cutoff_ms, report);
        !by_api.is_empty()
    });
}

fn prune_flat(logs: &mut LogsByApi, cutoff_ms: u64, report: &mut CleanupReport) {
    logs.retain(|_, log| {
        let before = log.len();
        log.prune(cutoff_ms);
        report.timestamps_removed += before - log.len();
        if log.is_empty() {
            report.logs_removed += 1;
            false
        } else {
            true
        }
    });
}

impl LimiterState {
    fn fresh(now_ms: u64) -> Self {
        Self {
            metadata: LimiterMetadata::fresh(millis_to_utc(now_ms)),
            user_limits: BTreeMap::new(),
            ip_limits: BTreeMap::new(),
            global_limits: BTreeMap::new(),
            blocked_users: BTreeMap::new(),
            extra: Map::new(),
            denials: BTreeMap::new(),
            generation: 0,
        }
    }

    fn to_document(&self) -> Value {
        let doc = LimiterDocument {
            metadata: &self.metadata,
            user_limits: &self.user_limits,
            ip_limits: &self.ip_limits,
            global_limits: &self.global_limits,
            blocked_users: &self.blocked_users,
            extra: &self.extra,
        };
        serde_json::to_value(doc).unwrap_or_else(|e| {
            warn!(error = %e, "limiter snapshot serialization failed");
            Value::Null
        })
    }

    fn from_document(doc: Value, now_ms: u64) -> Self {
        let mut state = Self::fresh(now_ms);
        let Value::Object(mut doc) = doc else {
            return state;
        };
        if let Some(metadata) = doc.remove("metadata") {
            match serde_json::from_value(metadata) {
                Ok(metadata) => state.metadata = metadata,
                Err(e) => warn!(branch = "metadata", error = %e, "malformed snapshot branch replaced with default"),
            }
        }
        let key = |k: &str| Some(k.to_string());
        state.user_limits = parse_entries(&mut doc, "user_limits", key);
        state.ip_limits = parse_entries(&mut doc, "ip_limits", key);
        state.global_limits = parse_entries(&mut doc, "global_limits", key);
        state.blocked_users = parse_entries(&mut doc, "blocked_users", key);
        state.extra = doc;
        state
    }

    fn snapshot(&mut self, now_ms: u64) -> (Value, u64) {
        self.metadata.last_updated = millis_to_utc(now_ms);
        self.generation += 1;
        (self.to_document(), self.generation)
    }

    /// Run the pipeline. The flag asks for a detached snapshot.
    fn admit(
        &mut self,
        api_type: &str,
        user: Option<&str>,
        address: Option<&str>,
        limit: usize,
        window_ms: u64,
        now_ms: u64,
    ) -> (Decision, bool) {
        if let Some(user) = user {
            if let Some(entry) = self.blocked_users.get(user) {
                if entry.is_active(now_ms) {
                    let decision = Decision::Denied {
                        tier: Tier::Blocked,
                        reason: format!("User blocked: {}", entry.reason),
                        retry_after: Duration::from_millis(entry.until_ms - now_ms),
                    };
                    return (decision, false);
                }
                debug!(user, "expired block removed");
                self.blocked_users.remove(user);
            }
        }

        let mut user_log = None;
        if let Some(u) = user {
            user_log = Some(self.user_limits.entry(u.to_string()).or_default().entry(api_type.to_string()).or_default());
        }
        if let Some(log) = user_log.as_deref_mut() {
            if let Some(retry_after) = tier_wait(log, limit, window_ms, now_ms) {
                let reason = format!("Rate limit exceeded for {api_type}");
                return (Decision::Denied { tier: Tier::User, reason, retry_after }, false);
            }
        }

        let mut address_log = None;
        if let Some(a) = address {
            address_log = Some(self.ip_limits.entry(a.to_string()).or_default().entry(api_type.to_string()).or_default());
        }
        if let Some(log) = address_log.as_deref_mut() {
            let address_limit = limit.saturating_mul(ADDRESS_MULTIPLIER);
            if let Some(retry_after) = tier_wait(log, address_limit, window_ms, now_ms) {
                let reason = format!("IP rate limit exceeded for {api_type}");
                return (Decision::Denied { tier: Tier::Address, reason, retry_after }, false);
            }
        }

        let global_log = self.global_limits.entry(api_type.to_string()).or_default();
        let global_limit = limit.saturating_mul(GLOBAL_MULTIPLIER);
        if let Some(retry_after) = tier_wait(global_log, global_limit, window_ms, now_ms) {
            let reason = format!("Global rate limit exceeded for {api_type}");
            return (Decision::Denied { tier: Tier::Global, reason, retry_after }, false);
        }

        if let Some(log) = user_log {
            log.push(now_ms);
        }
        if let Some(log) = address_log {
            log.push(now_ms);
        }
        global_log.push(now_ms);
        (Decision::Allowed, global_log.len() % SNAPSHOT_EVERY == 0)
    }

    fn purge_expired_blocks(&mut self, now_ms: u64) -> usize {
        let before = self.blocked_users.len();
        self.blocked_users.retain(|_, entry| entry.is_active(now_ms));
        before - self.blocked_users.len()
    }
}

#[derive(Debug)]
struct LimiterInner {
    state: Mutex<LimiterState>,
    store: SnapshotStore,
    clock: Arc<dyn Clock>,
    policies: SharedPolicy<PolicyTable>,
    abuse: SharedPolicy<AbusePolicy>,
    cleanup_interval: Duration,
}

/// Admission control shared by every caller of an external API.
///
/// Clones share the same logs and block list.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    inner: Arc<LimiterInner>,
}

impl RateLimiter {
    /// Open the limiter stored under `config.storage_path` using the system clock.
    pub fn open(config: &MonitorConfig) -> Self {
        Self::open_with_clock(config, Arc::new(SystemClock))
    }

    /// Open with an explicit clock.
    pub fn open_with_clock(config: &MonitorConfig, clock: Arc<dyn Clock>) -> Self {
        Self::open_with(
            config,
            clock,
            SharedPolicy::new(config.rate_limits.clone()),
            SharedPolicy::new(config.abuse),
        )
    }

    pub(crate) fn open_with(
        config: &MonitorConfig,
        clock: Arc<dyn Clock>,
        policies: SharedPolicy<PolicyTable>,
        abuse: SharedPolicy<AbusePolicy>,
    ) -> Self {
        let now_ms = clock.now_millis();
        let store = SnapshotStore::new(config.rate_limits_file());
        let existed = store.path().exists();
        let merged = store.load_merged(LimiterState::fresh(now_ms).to_document());
        let state = LimiterState::from_document(merged, now_ms);
        info!(
            path = %store.path().display(),
            users = state.user_limits.len(),
            addresses = state.ip_limits.len(),
            blocked = state.blocked_users.len(),
            "rate limiter loaded"
        );

        let limiter = Self {
            inner: Arc::new(LimiterInner {
                state: Mutex::new(state),
                store,
                clock,
                policies,
                abuse,
                cleanup_interval: config.cleanup_interval(),
            }),
        };
        if !existed {
            limiter.snapshot_now();
        }
        limiter
    }

    fn lock(&self) -> MutexGuard<'_, LimiterState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Path of `rate_limits.json`.
    pub fn snapshot_path(&self) -> &Path {
        self.inner.store.path()
    }

    /// The live policy table.
    pub fn policies(&self) -> Arc<PolicyTable> {
        self.inner.policies.load()
    }

    /// Swap the policy table; the next admission check uses it.
    pub fn set_policies(&self, table: PolicyTable) {
        self.inner.policies.store(table);
    }

    /// Swap the thresholds used by [`auto_block_if_abuse`](Self::auto_block_if_abuse).
    pub fn set_abuse_policy(&self, abuse: AbusePolicy) {
        self.inner.abuse.store(abuse);
    }

    /// Decide whether a call may proceed. `max_calls` and `window_minutes`
    /// override the policy table when given and non-zero.
    pub fn is_rate_limited(
        &self,
        api_type: &str,
        user: Option<&str>,
        address: Option<&str>,
        max_calls: Option<u32>,
        window_minutes: Option<u32>,
    ) -> Decision {
        let policy = self.inner.policies.load().policy_for(api_type);
        let max_calls = max_calls.filter(|n| *n > 0).unwrap_or(policy.max_calls);
        let window_minutes = window_minutes.filter(|n| *n > 0).unwrap_or(policy.window_minutes);
        let limit = usize::try_from(max_calls).unwrap_or(usize::MAX);
        let window_ms = u64::from(window_minutes) * MINUTE_MS;
        let now_ms = self.inner.clock.now_millis();

        let (decision, snapshot) = {
            let mut state = self.lock();
            let (decision, wants_snapshot) = state.admit(api_type, user, address, limit, window_ms, now_ms);
            if let (Some(user), Some(tier)) = (user, decision.tier()) {
                if tier != Tier::Blocked {
                    state.denials.entry(user.to_string()).or_default().push(now_ms);
                }
            }
            (decision, wants_snapshot.then(|| state.snapshot(now_ms)))
        };
        if let Some((doc, generation)) = snapshot {
            self.inner.store.save_detached(doc, generation);
        }

        if let Decision::Denied { tier, reason, retry_after } = &decision {
            debug!(
                api_type,
                user = user.unwrap_or("-"),
                address = address.unwrap_or("-"),
                %tier,
                retry_after_ms = u64::try_from(retry_after.as_millis()).unwrap_or(u64::MAX),
                reason = reason.as_str(),
                "call denied"
            );
        }
        decision
    }

    /// [`is_rate_limited`](Self::is_rate_limited) with policy limits, as a `Result`.
    pub fn check(&self, api_type: &str, user: Option<&str>, address: Option<&str>) -> Result<(), RateLimitExceeded> {
        self.is_rate_limited(api_type, user, address, None, None).into_result()
    }

    /// Block `user` for `duration_minutes`, replacing any existing block.
    pub fn block_user(&self, user: &str, reason: &str, duration_minutes: u32) -> BlockEntry {
        let now_ms = self.inner.clock.now_millis();
        let entry = BlockEntry {
            reason: reason.to_string(),
            blocked_at: millis_to_utc(now_ms),
            until_ms: now_ms + u64::from(duration_minutes) * MINUTE_MS,
        };
        self.lock().blocked_users.insert(user.to_string(), entry.clone());
        self.snapshot_now();
        warn!(user, duration_minutes, reason, "user blocked");
        entry
    }

    /// Lift a block. Returns whether one existed.
    pub fn unblock_user(&self, user: &str) -> bool {
        let removed = self.lock().blocked_users.remove(user).is_some();
        if removed {
            self.snapshot_now();
            info!(user, "user unblocked");
        }
        removed
    }

    /// Active block for `user`, if any.
    pub fn block_for(&self, user: &str) -> Option<BlockEntry> {
        let now_ms = self.inner.clock.now_millis();
        self.lock().blocked_users.get(user).filter(|e| e.is_active(now_ms)).cloned()
    }

    /// Block `user` once their rejections within the abuse window reach the
    /// threshold. Returns the new block, or `None` when no block was placed.
    pub fn auto_block_if_abuse(&self, user: &str, api_type: &str) -> Option<BlockEntry> {
        let abuse = self.inner.abuse.load();
        let now_ms = self.inner.clock.now_millis();
        let window_ms = u64::from(abuse.window_minutes) * MINUTE_MS;
        let denials = {
            let mut state = self.lock();
            if state.blocked_users.get(user).is_some_and(|e| e.is_active(now_ms)) {
                return None;
            }
            let log = state.denials.get_mut(user)?;
            log.prune(now_ms.saturating_sub(window_ms));
            let denials = log.len();
            if denials < usize::try_from(abuse.denials_threshold).unwrap_or(usize::MAX) {
                return None;
            }
            state.denials.remove(user);
            denials
        };
        let reason = format!(
            "Automatic block: {denials} rate limit violations for {api_type} in {} minutes",
            abuse.window_minutes
        );
        Some(self.block_user(user, &reason, abuse.block_minutes))
    }

    /// Where `user` stands against `api_type`'s policy. Read-only.
    pub fn user_rate_info(&self, user: &str, api_type: &str) -> UserRateInfo {
        let policy = self.inner.policies.load().policy_for(api_type);
        let window_ms = u64::from(policy.window_minutes) * MINUTE_MS;
        let now_ms = self.inner.clock.now_millis();
        let cutoff = now_ms.saturating_sub(window_ms);

        let (calls_made, oldest) = {
            let state = self.lock();
            state
                .user_limits
                .get(user)
                .and_then(|by_api| by_api.get(api_type))
                .map_or((0, None), |log| (log.count_since(cutoff), log.oldest_since(cutoff)))
        };
        let limit = usize::try_from(policy.max_calls).unwrap_or(usize::MAX);
        let reset_ms = oldest.map(|ts| ts + window_ms);
        UserRateInfo {
            api_type: api_type.to_string(),
            max_calls: policy.max_calls,
            window_minutes: policy.window_minutes,
            calls_made,
            calls_remaining: limit.saturating_sub(calls_made),
            reset_at: reset_ms.map(millis_to_utc),
            reset_in_seconds: reset_ms.map_or(0, |reset| reset.saturating_sub(now_ms).div_ceil(1_000)),
        }
    }

    /// Activity over the last hour. Expired blocks are purged as a side effect.
    pub fn rate_limit_stats(&self) -> RateLimitStats {
        let now_ms = self.inner.clock.now_millis();
        let cutoff = now_ms.saturating_sub(HOUR_MS);
        let mut state = self.lock();
        state.purge_expired_blocks(now_ms);

        let active = |logs: &BTreeMap<String, LogsByApi>| {
            logs.values().filter(|by_api| by_api.values().any(|log| log.count_since(cutoff) > 0)).count()
        };
        let mut api_usage_last_hour: BTreeMap<String, usize> = BTreeMap::new();
        for by_api in state.user_limits.values() {
            for (api_type, log) in by_api {
                *api_usage_last_hour.entry(api_type.clone()).or_default() += log.count_since(cutoff);
            }
        }

        RateLimitStats {
            active_users_last_hour: active(&state.user_limits),
            active_addresses_last_hour: active(&state.ip_limits),
            blocked_users: state.blocked_users.len(),
            blocked_user_list: state.blocked_users.keys().cloned().collect(),
            api_usage_last_hour,
            total_users_tracked: state.user_limits.len(),
            total_addresses_tracked: state.ip_limits.len(),
        }
    }

    /// Forget `user`'s window logs, for one API type or all of them.
    /// Returns whether the user had any.
    pub fn reset_user_limits(&self, user: &str, api_type: Option<&str>) -> bool {
        let tracked = {
            let mut state = self.lock();
            match (api_type, state.user_limits.get_mut(user)) {
                (Some(api_type), Some(by_api)) => {
                    by_api.remove(api_type);
                    true
                }
                (None, Some(_)) => {
                    state.user_limits.remove(user);
                    true
                }
                (_, None) => false,
            }
        };
        if tracked {
            self.snapshot_now();
            info!(user, api_type = api_type.unwrap_or("*"), "rate limits reset");
        }
        tracked
    }

    /// Drop timestamps older than 24 hours, empty logs and expired blocks,
    /// then snapshot.
    pub fn run_cleanup(&self) -> CleanupReport {
        let now_ms = self.inner.clock.now_millis();
        let cutoff = now_ms.saturating_sub(RETAIN_MS);
        let abuse_cutoff = now_ms.saturating_sub(u64::from(self.inner.abuse.load().window_minutes) * MINUTE_MS);
        let mut report = CleanupReport::default();
        {
            let mut state = self.lock();
            let state = &mut *state;
            prune_nested(&mut state.user_limits, cutoff, &mut report);
            prune_nested(&mut state.ip_limits, cutoff, &mut report);
            prune_flat(&mut state.global_limits, cutoff, &mut report);
            report.blocks_expired = state.purge_expired_blocks(now_ms);
            state.denials.retain(|_, log| {
                log.prune(abuse_cutoff);
                !log.is_empty()
            });
            state.metadata.last_cleanup = millis_to_utc(now_ms);
            report.users_remaining = state.user_limits.len();
            report.addresses_remaining = state.ip_limits.len();
        }
        self.snapshot_now();
        info!(
            timestamps_removed = report.timestamps_removed,
            logs_removed = report.logs_removed,
            blocks_expired = report.blocks_expired,
            users_remaining = report.users_remaining,
            addresses_remaining = report.addresses_remaining,
            "rate limiter cleanup completed"
        );
        report
    }

    /// Write the current state atomically. Failures are logged.
    pub fn snapshot_now(&self) -> bool {
        let now_ms = self.inner.clock.now_millis();
        let (doc, generation) = self.lock().snapshot(now_ms);
        match self.inner.store.save_generation(&doc, generation) {
            Ok(written) => written,
            Err(e) => {
                warn!(error = %e, "rate limit snapshot failed; in-memory state kept");
                false
            }
        }
    }

    /// Start the periodic cleanup loop on the current tokio runtime.
    pub fn spawn_cleanup(&self) -> MaintenanceHandle {
        let limiter = self.clone();
        spawn_periodic("limiter-cleanup", self.inner.cleanup_interval, move || {
            limiter.run_cleanup();
        })
    }
}
