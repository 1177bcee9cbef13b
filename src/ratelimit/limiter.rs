//! Client identity → policy → bucket mapping — §4.3.
//!
//! Grounded on original_source's `internal/service/ratelimit.go`
//! (`RateLimiter`): a bucket manager plus a parallel map of
//! [`ClientPolicy`] keyed by the same client id, with the classification
//! rule for first-sighting an unknown id (`ip:`-prefixed → IP-based
//! defaults, else global defaults).

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;

use super::{manager::BucketManager, TokenBucket};

/// A client's rate-limit policy — §3. One policy per client id, joined to
/// exactly one [`TokenBucket`] by that id.
#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
pub struct ClientPolicy {
    pub capacity: u32,
    pub refill_rate: f64,
}

/// Defaults applied when a client is first seen (§4.3's classification
/// rule) or reconfigured via [`RateLimiter::set_ip_policy`].
#[derive(Debug, Clone, Copy)]
pub struct PolicyDefaults {
    pub global: ClientPolicy,
    pub ip_based: ClientPolicy,
}

/// Prefix that marks a client id as IP-derived (§4.3, §4.4).
pub const IP_PREFIX: &str = "ip:";

/// Owns the [`BucketManager`] and the parallel client-policy map.
pub struct RateLimiter {
    buckets: Arc<BucketManager>,
    policies: DashMap<String, ClientPolicy>,
    defaults: std::sync::RwLock<PolicyDefaults>,
}

impl RateLimiter {
    pub fn new(refill_interval: Duration, defaults: PolicyDefaults) -> Arc<Self> {
        Arc::new(Self {
            buckets: BucketManager::new(refill_interval),
            policies: DashMap::new(),
            defaults: std::sync::RwLock::new(defaults),
        })
    }

    fn classify(&self, id: &str) -> ClientPolicy {
        let defaults = self.defaults.read().expect("policy defaults lock poisoned");
        if id.starts_with(IP_PREFIX) {
            defaults.ip_based
        } else {
            defaults.global
        }
    }

    /// Materialise a bucket + policy for `id` if one doesn't already exist,
    /// using the classification rule, then return the (possibly
    /// newly-created) bucket. Idempotent under concurrency: `DashMap::entry`
    /// holds the shard lock across the check-then-create, so two
    /// simultaneous first-sightings of the same id still yield exactly one
    /// bucket and one policy.
    fn get_or_create_bucket(&self, id: &str) -> Arc<TokenBucket> {
        if let Some(bucket) = self.buckets.get(id) {
            return bucket;
        }
        let policy = self.classify(id);
        self.policies.entry(id.to_string()).or_insert(policy);
        self.buckets
            .get_or_insert_with(id, || Arc::new(TokenBucket::new(policy.capacity, policy.refill_rate)))
    }

    /// §4.3's `is_allowed`: create-or-get, then take.
    pub fn is_allowed(&self, id: &str) -> bool {
        self.get_or_create_bucket(id).take()
    }

    pub fn get_client(&self, id: &str) -> Option<ClientPolicy> {
        self.policies.get(id).map(|entry| *entry.value())
    }

    pub fn list_clients(&self) -> Vec<(String, ClientPolicy)> {
        self.policies.iter().map(|entry| (entry.key().clone(), *entry.value())).collect()
    }

    pub fn tokens_remaining(&self, id: &str) -> Option<f64> {
        self.buckets.get(id).map(|bucket| bucket.peek())
    }

    /// Create or update a client's policy.
    ///
    /// If the client already has a bucket whose capacity is unchanged, only
    /// the refill rate is replaced on the live bucket (no burst lost). If
    /// the capacity changes, the bucket is replaced outright — unused
    /// tokens are drained — per the Open Question resolution recorded in
    /// DESIGN.md (the original Go source keeps the old bucket and only ever
    /// swaps the rate; this spec treats capacity as immutable per-bucket and
    /// requires recreation on change).
    pub fn upsert_client(&self, id: &str, capacity: u32, refill_rate: f64) {
        let policy = ClientPolicy { capacity, refill_rate };
        match self.buckets.get(id) {
            Some(existing) if existing.capacity() == capacity => {
                existing.set_rate(refill_rate);
            }
            _ => {
                self.buckets.insert(id, Arc::new(TokenBucket::new(capacity, refill_rate)));
            }
        }
        self.policies.insert(id.to_string(), policy);
    }

    /// Remove both the bucket and the policy atomically (from the caller's
    /// point of view — no request in flight can observe one without the
    /// other once this returns, since both maps are updated before
    /// `delete_client` returns and no other path re-creates an id once
    /// policy-less reads see it as new again only after full removal).
    pub fn delete_client(&self, id: &str) -> bool {
        let existed = self.policies.remove(id).is_some();
        self.buckets.remove(id);
        existed
    }

    pub fn set_ip_policy(&self, capacity: u32, refill_rate: f64) {
        self.defaults.write().expect("policy defaults lock poisoned").ip_based =
            ClientPolicy { capacity, refill_rate };
    }

    pub fn stop(&self) {
        self.buckets.stop();
    }
}
