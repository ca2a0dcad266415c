//! Process-wide access guarding: the short-id brute-force blocker, per-client
//! token buckets and access-code verification.
//!
//! State is in-memory behind mutexes; a multi-node deployment would back it
//! with a shared TTL store instead. Client keys are opaque strings.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tracing::{debug, instrument};

use crate::Error;

const CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

/// Rate-limit keyspaces. Admin endpoints are limited separately from the
/// public surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Bucket {
    Downloads,
    Creates,
    Admin,
}

#[derive(Debug, Clone)]
pub struct GuardConfig {
    /// 404s on short ids tolerated per client before blocking.
    pub max_lookup_failures: u32,
    pub block_duration: Duration,
    pub downloads_per_minute: u32,
    pub creates_per_minute: u32,
    pub admin_per_minute: u32,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            max_lookup_failures: 20,
            block_duration: Duration::from_secs(5 * 60),
            downloads_per_minute: 60,
            creates_per_minute: 30,
            admin_per_minute: 30,
        }
    }
}

impl GuardConfig {
    fn quota(&self, bucket: Bucket) -> u32 {
        match bucket {
            Bucket::Downloads => self.downloads_per_minute,
            Bucket::Creates => self.creates_per_minute,
            Bucket::Admin => self.admin_per_minute,
        }
    }
}

#[derive(Debug)]
struct BlockEntry {
    failures: u32,
    blocked_until: Option<Instant>,
    last_seen: Instant,
}

#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

pub struct AccessGuard {
    config: GuardConfig,
    blocker: Mutex<HashMap<String, BlockEntry>>,
    buckets: Mutex<HashMap<(Bucket, String), TokenBucket>>,
}

impl AccessGuard {
    pub fn new(config: GuardConfig) -> Self {
        Self {
            config,
            blocker: Mutex::new(HashMap::new()),
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Rejects clients currently blocked for brute-forcing short ids. Called
    /// before any metadata lookup; a blocked client never reaches the store.
    pub fn check_blocked(&self, client: &str) -> Result<(), Error> {
        self.check_blocked_at(client, Instant::now())
    }

    fn check_blocked_at(&self, client: &str, now: Instant) -> Result<(), Error> {
        let mut blocker = self.blocker.lock();
        let Some(entry) = blocker.get_mut(client) else {
            return Ok(());
        };
        if let Some(until) = entry.blocked_until {
            if until > now {
                return Err(Error::RateLimited {
                    retry_after: until - now,
                });
            }
            // Block elapsed; start over.
            entry.blocked_until = None;
            entry.failures = 0;
        }
        Ok(())
    }

    /// Records a 404 on a lookup. Only short ids count toward blocking.
    #[instrument(skip(self))]
    pub fn record_lookup_failure(&self, client: &str, short_id: bool) {
        if !short_id {
            return;
        }
        self.record_failure_at(client, Instant::now());
    }

    /// Records a failed access-code attempt; counted like a short-id miss.
    pub fn record_access_failure(&self, client: &str) {
        self.record_failure_at(client, Instant::now());
    }

    fn record_failure_at(&self, client: &str, now: Instant) {
        let mut blocker = self.blocker.lock();
        let entry = blocker.entry(client.to_string()).or_insert(BlockEntry {
            failures: 0,
            blocked_until: None,
            last_seen: now,
        });
        entry.failures += 1;
        entry.last_seen = now;
        if entry.failures >= self.config.max_lookup_failures {
            debug!(failures = entry.failures, "blocking client");
            entry.blocked_until = Some(now + self.config.block_duration);
        }
    }

    /// A successful lookup resets the failure counter.
    pub fn record_lookup_success(&self, client: &str) {
        self.blocker.lock().remove(client);
    }

    /// Takes one token from the client's bucket, or reports how long until
    /// one becomes available.
    pub fn check_rate(&self, bucket: Bucket, client: &str) -> Result<(), Error> {
        self.check_rate_at(bucket, client, Instant::now())
    }

    fn check_rate_at(&self, bucket: Bucket, client: &str, now: Instant) -> Result<(), Error> {
        let quota = self.config.quota(bucket);
        let capacity = quota as f64;
        let per_second = capacity / 60.0;

        let mut buckets = self.buckets.lock();
        let state = buckets
            .entry((bucket, client.to_string()))
            .or_insert(TokenBucket {
                tokens: capacity,
                last_refill: now,
            });

        let elapsed = now.saturating_duration_since(state.last_refill);
        state.tokens = (state.tokens + elapsed.as_secs_f64() * per_second).min(capacity);
        state.last_refill = now;

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            Ok(())
        } else {
            let missing = 1.0 - state.tokens;
            Err(Error::RateLimited {
                retry_after: Duration::from_secs_f64(missing / per_second),
            })
        }
    }

    /// Drops entries that carry no state worth keeping: expired blocks, idle
    /// failure counters and full buckets.
    pub fn cleanup(&self) {
        self.cleanup_at(Instant::now())
    }

    fn cleanup_at(&self, now: Instant) {
        self.blocker.lock().retain(|_, entry| {
            match entry.blocked_until {
                Some(until) => until > now,
                None => now.saturating_duration_since(entry.last_seen) < CLEANUP_INTERVAL,
            }
        });
        self.buckets.lock().retain(|(bucket, _), state| {
            let capacity = self.config.quota(*bucket) as f64;
            let refilled = state.tokens
                + now.saturating_duration_since(state.last_refill).as_secs_f64() * capacity / 60.0;
            refilled < capacity
        });
    }

    /// Spawns the minutely cleanup timer.
    pub fn spawn_cleanup(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let guard = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(CLEANUP_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                guard.cleanup();
            }
        })
    }

    /// Verifies an access code against its stored SHA-256 hex digest in
    /// constant time. The code itself is never logged.
    pub fn verify_access_code(code: &str, expected_hex: &str) -> bool {
        let digest = Sha256::digest(code.as_bytes());
        let got = data_encoding::HEXLOWER.encode(&digest);
        constant_time_eq(got.as_bytes(), expected_hex.as_bytes())
    }
}

/// Equality without an early exit on the first differing byte. Used for
/// access-code digests and the admin bearer token.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
