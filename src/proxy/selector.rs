//! Quota-aware proxy selection.
//!
//! Picks the candidate with the most bucket headroom for a base key,
//! rotating among equally-loaded candidates, and reserves `weight` tokens
//! from that candidate's bucket. Only insufficient-quota failures move on
//! to the next candidate; anything else aborts the call.

use prometheus::{IntCounterVec, Opts, Registry};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::proxy::bucket_options::{BucketOptionsRegistry, OptionsCheck};
use crate::proxy::directory::NodeHandle;
use crate::proxy::error::{ProxyError, Result};
use crate::proxy::path::encode_path;
use crate::proxy::pool::ProxyPool;
use crate::proxy::quota::{BucketOptions, BucketProvider, QuotaBucket, QuotaError};
use crate::proxy::trust::Candidate;

pub const MAX_BASE_KEY_CURSORS: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcquireResult {
    pub ip: String,
    pub node_id: String,
    pub bucket_key: String,
}

/// Round-robin cursors, one per base key, oldest evicted past the cap.
#[derive(Debug)]
pub struct SelectorState {
    cursors: HashMap<String, usize>,
    order: VecDeque<String>,
    max_keys: usize,
}

impl SelectorState {
    pub fn new(max_keys: usize) -> Self {
        Self {
            cursors: HashMap::new(),
            order: VecDeque::new(),
            max_keys: max_keys.max(1),
        }
    }

    pub fn cursor(&self, base_key: &str) -> usize {
        self.cursors.get(base_key).copied().unwrap_or(0)
    }

    /// Moves the cursor one step forward, wrapping at `candidate_count`.
    pub fn advance(&mut self, base_key: &str, candidate_count: usize) {
        let next = (self.cursor(base_key) + 1) % candidate_count.max(1);
        if let Some(cursor) = self.cursors.get_mut(base_key) {
            *cursor = next;
            return;
        }
        while self.cursors.len() >= self.max_keys {
            match self.order.pop_front() {
                Some(oldest) => {
                    self.cursors.remove(&oldest);
                }
                None => break,
            }
        }
        self.cursors.insert(base_key.to_string(), next);
        self.order.push_back(base_key.to_string());
    }

    pub fn len(&self) -> usize {
        self.cursors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cursors.is_empty()
    }
}

impl Default for SelectorState {
    fn default() -> Self {
        Self::new(MAX_BASE_KEY_CURSORS)
    }
}

struct Slot<'a> {
    candidate: &'a Candidate,
    bucket_key: String,
    bucket: Arc<dyn QuotaBucket>,
    tokens: u64,
}

pub struct QuotaSelector {
    buckets: Arc<dyn BucketProvider>,
    options: BucketOptionsRegistry,
    state: Mutex<SelectorState>,
    conflicts: IntCounterVec,
    node_id: String,
}

impl QuotaSelector {
    /// Selector with metrics on a private registry.
    pub fn new(buckets: Arc<dyn BucketProvider>, node: &NodeHandle) -> Self {
        Self::build(buckets, node, conflict_counter())
    }

    /// Selector whose conflict counter is registered on `registry`.
    pub fn with_registry(
        buckets: Arc<dyn BucketProvider>,
        node: &NodeHandle,
        registry: &Registry,
    ) -> std::result::Result<Self, prometheus::Error> {
        let conflicts = conflict_counter();
        registry.register(Box::new(conflicts.clone()))?;
        Ok(Self::build(buckets, node, conflicts))
    }

    fn build(buckets: Arc<dyn BucketProvider>, node: &NodeHandle, conflicts: IntCounterVec) -> Self {
        Self {
            buckets,
            options: BucketOptionsRegistry::new(),
            state: Mutex::new(SelectorState::default()),
            conflicts,
            node_id: node.node_id().to_string(),
        }
    }

    fn state(&self) -> MutexGuard<'_, SelectorState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn cursor(&self, base_key: &str) -> usize {
        self.state().cursor(base_key)
    }

    pub fn conflict_count(&self, base_key: &str, bucket_key: &str) -> u64 {
        self.conflicts
            .with_label_values(&[base_key, bucket_key])
            .get()
    }

    /// Reserves `weight` tokens on one trusted proxy from `pool`.
    pub fn acquire<F>(
        &self,
        base_key: &str,
        weight: u64,
        pool: &ProxyPool,
        options: F,
    ) -> Result<AcquireResult>
    where
        F: FnOnce() -> BucketOptions,
    {
        let candidates = pool.candidates();
        self.acquire_from(base_key, weight, &candidates, options)
    }

    /// Same as [`acquire`](Self::acquire) over an explicit candidate list.
    /// `candidates` must already be trust-filtered and in stable order.
    pub fn acquire_from<F>(
        &self,
        base_key: &str,
        weight: u64,
        candidates: &[Candidate],
        options: F,
    ) -> Result<AcquireResult>
    where
        F: FnOnce() -> BucketOptions,
    {
        if candidates.is_empty() {
            return Err(ProxyError::TargetNotFound {
                reason: "no_trusted_candidate",
                node_id: self.node_id.clone(),
                base_key: Some(base_key.to_string()),
                timeout_ms: None,
            });
        }

        let options = options();
        let mut slots = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            let bucket_key = encode_path(&[base_key, candidate.ip.as_str()]);
            if let OptionsCheck::Conflict { .. } = self.options.check(&bucket_key, &options) {
                self.conflicts
                    .with_label_values(&[base_key, bucket_key.as_str()])
                    .inc();
                return Err(ProxyError::BucketOptionsConflict {
                    base_key: base_key.to_string(),
                    bucket_key,
                });
            }
            let bucket = self.buckets.bucket(&bucket_key, &options).map_err(|source| {
                ProxyError::AcquireInternal {
                    base_key: base_key.to_string(),
                    bucket_key: bucket_key.clone(),
                    node_id: candidate.node_id.clone(),
                    ip: candidate.ip.clone(),
                    weight,
                    source,
                }
            })?;
            slots.push(Slot {
                candidate,
                bucket_key,
                bucket,
                tokens: 0,
            });
        }
        for slot in slots.iter_mut() {
            slot.tokens = slot.bucket.read();
        }

        let cursor = self.cursor(base_key);
        let order = attempt_order(slots, weight, cursor);
        let candidate_count = candidates.len();

        let mut last_error: Option<QuotaError> = None;
        for slot in order {
            match slot.bucket.acquire(weight) {
                Ok(()) => {
                    self.state().advance(base_key, candidate_count);
                    tracing::debug!(
                        base_key,
                        weight,
                        node_id = %slot.candidate.node_id,
                        ip = %slot.candidate.ip,
                        tokens_before = slot.tokens,
                        "proxy quota acquired"
                    );
                    return Ok(AcquireResult {
                        ip: slot.candidate.ip.clone(),
                        node_id: slot.candidate.node_id.clone(),
                        bucket_key: slot.bucket_key,
                    });
                }
                Err(err) if err.is_insufficient() => {
                    last_error = Some(err);
                }
                Err(source) => {
                    tracing::error!(
                        base_key,
                        bucket_key = %slot.bucket_key,
                        error = %source,
                        "quota acquire failed"
                    );
                    return Err(ProxyError::AcquireInternal {
                        base_key: base_key.to_string(),
                        bucket_key: slot.bucket_key,
                        node_id: slot.candidate.node_id.clone(),
                        ip: slot.candidate.ip.clone(),
                        weight,
                        source,
                    });
                }
            }
        }

        tracing::warn!(base_key, weight, candidate_count, "all proxy buckets exhausted");
        Err(ProxyError::BucketExhausted {
            base_key: base_key.to_string(),
            weight,
            candidate_count,
            last_error,
        })
    }
}

fn conflict_counter() -> IntCounterVec {
    let opts = Opts::new(
        "bucket_options_conflict_total",
        "Bucket keys reused with different options",
    );
    match IntCounterVec::new(opts, &["base_key", "bucket_key"]) {
        Ok(counter) => counter,
        // Only reachable with an invalid metric name, which this one is not.
        Err(e) => unreachable!("bucket_options_conflict_total: {e}"),
    }
}

/// Candidates with enough tokens go first, most tokens first, each tie
/// rotated by the cursor. With no such candidate, everyone is tried in
/// round-robin order from the cursor.
fn attempt_order(slots: Vec<Slot<'_>>, weight: u64, cursor: usize) -> Vec<Slot<'_>> {
    let (mut priority, mut rest): (Vec<_>, Vec<_>) =
        slots.into_iter().partition(|s| s.tokens >= weight);

    if priority.is_empty() {
        let len = rest.len();
        if len > 0 {
            rest.rotate_left(cursor % len);
        }
        return rest;
    }

    priority.sort_by(|a, b| b.tokens.cmp(&a.tokens));
    let mut start = 0;
    while start < priority.len() {
        let tokens = priority[start].tokens;
        let end = priority[start..]
            .iter()
            .position(|s| s.tokens != tokens)
            .map_or(priority.len(), |offset| start + offset);
        let tied = &mut priority[start..end];
        let len = tied.len();
        tied.rotate_left(cursor % len);
        start = end;
    }
    priority
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::directory::InMemoryDirectory;
    use crate::proxy::quota::TokenBucketRegistry;
    use crate::proxy::trust::tests::proxy_node;
    use crate::proxy::trust::{TrustedNodeIds, TRUSTED_PROXY_IP_SOURCE};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Bucket whose `read()` is fixed unless an acquire consumes tokens.
    struct FakeBucket {
        key: String,
        tokens: Mutex<u64>,
        drain: bool,
        fail_with: Option<QuotaError>,
        acquire_calls: AtomicUsize,
    }

    impl QuotaBucket for FakeBucket {
        fn read(&self) -> u64 {
            *self.tokens.lock().unwrap()
        }

        fn acquire(&self, tokens: u64) -> std::result::Result<(), QuotaError> {
            self.acquire_calls.fetch_add(1, Ordering::SeqCst);
            if let Some(err) = &self.fail_with {
                return Err(err.clone());
            }
            let mut current = self.tokens.lock().unwrap();
            if *current < tokens {
                return Err(QuotaError::Insufficient {
                    bucket_key: self.key.clone(),
                    requested: tokens,
                    available: *current,
                });
            }
            if self.drain {
                *current -= tokens;
            }
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeProvider {
        buckets: Mutex<HashMap<String, Arc<FakeBucket>>>,
    }

    impl FakeProvider {
        fn set(&self, key: &str, tokens: u64, drain: bool, fail_with: Option<QuotaError>) {
            self.buckets.lock().unwrap().insert(
                key.to_string(),
                Arc::new(FakeBucket {
                    key: key.to_string(),
                    tokens: Mutex::new(tokens),
                    drain,
                    fail_with,
                    acquire_calls: AtomicUsize::new(0),
                }),
            );
        }

        fn acquire_calls(&self, key: &str) -> usize {
            self.buckets.lock().unwrap()[key]
                .acquire_calls
                .load(Ordering::SeqCst)
        }
    }

    impl BucketProvider for FakeProvider {
        fn bucket(
            &self,
            bucket_key: &str,
            _options: &BucketOptions,
        ) -> std::result::Result<Arc<dyn QuotaBucket>, QuotaError> {
            let bucket = self
                .buckets
                .lock()
                .unwrap()
                .get(bucket_key)
                .cloned()
                .ok_or_else(|| QuotaError::Backend(format!("no bucket {bucket_key}")))?;
            let bucket: Arc<dyn QuotaBucket> = bucket;
            Ok(bucket)
        }
    }

    fn candidates(entries: &[(&str, &str)]) -> Vec<Candidate> {
        entries
            .iter()
            .map(|(node_id, ip)| Candidate {
                node_id: node_id.to_string(),
                ip: ip.to_string(),
            })
            .collect()
    }

    fn opts() -> BucketOptions {
        BucketOptions::new(10, 10, Duration::from_secs(1))
    }

    fn selector(provider: Arc<FakeProvider>) -> QuotaSelector {
        QuotaSelector::new(provider, &NodeHandle::new("client-0"))
    }

    #[test]
    fn test_equal_buckets_alternate() {
        let pool = candidates(&[("n1", "10.0.0.1"), ("n2", "10.0.0.2")]);
        let selector = QuotaSelector::new(
            Arc::new(TokenBucketRegistry::new()),
            &NodeHandle::new("client-0"),
        );
        let five = || BucketOptions::new(5, 5, Duration::from_secs(60));
        let picks: Vec<String> = (0..4)
            .map(|_| selector.acquire_from("orders", 1, &pool, five).unwrap().node_id)
            .collect();
        assert_eq!(picks, vec!["n1", "n2", "n1", "n2"]);
    }

    #[test]
    fn test_greedy_pick_leaves_other_buckets_untouched() {
        let provider = Arc::new(FakeProvider::default());
        provider.set("orders/10.0.0.1", 1, true, None);
        provider.set("orders/10.0.0.2", 8, true, None);
        let selector = selector(provider.clone());
        let pool = candidates(&[("n1", "10.0.0.1"), ("n2", "10.0.0.2")]);

        let result = selector.acquire_from("orders", 5, &pool, opts).unwrap();
        assert_eq!(result.node_id, "n2");
        assert_eq!(result.ip, "10.0.0.2");
        assert_eq!(result.bucket_key, "orders/10.0.0.2");
        assert_eq!(provider.acquire_calls("orders/10.0.0.1"), 0);
        assert_eq!(provider.acquire_calls("orders/10.0.0.2"), 1);
    }

    #[test]
    fn test_strict_maximum_first() {
        let provider = Arc::new(FakeProvider::default());
        provider.set("k/10.0.0.1", 3, false, None);
        provider.set("k/10.0.0.2", 9, false, None);
        provider.set("k/10.0.0.3", 6, false, None);
        let selector = selector(provider.clone());
        let pool = candidates(&[("n1", "10.0.0.1"), ("n2", "10.0.0.2"), ("n3", "10.0.0.3")]);

        for _ in 0..3 {
            let result = selector.acquire_from("k", 2, &pool, opts).unwrap();
            assert_eq!(result.node_id, "n2");
        }
        assert_eq!(provider.acquire_calls("k/10.0.0.1"), 0);
        assert_eq!(provider.acquire_calls("k/10.0.0.3"), 0);
    }

    #[test]
    fn test_tied_candidates_visited_once_each() {
        let provider = Arc::new(FakeProvider::default());
        for ip in ["10.0.0.1", "10.0.0.2", "10.0.0.3"] {
            provider.set(&format!("k/{ip}"), 5, false, None);
        }
        let selector = selector(provider);
        let pool = candidates(&[("n1", "10.0.0.1"), ("n2", "10.0.0.2"), ("n3", "10.0.0.3")]);

        let round: Vec<String> = (0..3)
            .map(|_| selector.acquire_from("k", 1, &pool, opts).unwrap().node_id)
            .collect();
        assert_eq!(round, vec!["n1", "n2", "n3"]);
        let again: Vec<String> = (0..3)
            .map(|_| selector.acquire_from("k", 1, &pool, opts).unwrap().node_id)
            .collect();
        assert_eq!(again, round);
    }

    #[test]
    fn test_base_keys_have_independent_cursors() {
        let provider = Arc::new(FakeProvider::default());
        for base in ["a", "b"] {
            provider.set(&format!("{base}/10.0.0.1"), 5, false, None);
            provider.set(&format!("{base}/10.0.0.2"), 5, false, None);
        }
        let selector = selector(provider);
        let pool = candidates(&[("n1", "10.0.0.1"), ("n2", "10.0.0.2")]);

        assert_eq!(selector.acquire_from("a", 1, &pool, opts).unwrap().node_id, "n1");
        assert_eq!(selector.acquire_from("a", 1, &pool, opts).unwrap().node_id, "n2");
        assert_eq!(selector.acquire_from("b", 1, &pool, opts).unwrap().node_id, "n1");
        assert_eq!(selector.cursor("a"), 0);
        assert_eq!(selector.cursor("b"), 1);
    }

    #[test]
    fn test_fallback_tries_everyone_then_exhausts() {
        let provider = Arc::new(FakeProvider::default());
        provider.set("k/10.0.0.1", 0, true, None);
        provider.set("k/10.0.0.2", 1, true, None);
        let selector = selector(provider.clone());
        let pool = candidates(&[("n1", "10.0.0.1"), ("n2", "10.0.0.2")]);

        let err = selector.acquire_from("k", 3, &pool, opts).unwrap_err();
        assert_eq!(err.code(), "E_PROXY_BUCKET_EXHAUSTED");
        match err {
            ProxyError::BucketExhausted {
                candidate_count,
                last_error,
                ..
            } => {
                assert_eq!(candidate_count, 2);
                assert!(last_error.map(|e| e.is_insufficient()).unwrap_or(false));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(provider.acquire_calls("k/10.0.0.1"), 1);
        assert_eq!(provider.acquire_calls("k/10.0.0.2"), 1);
        assert_eq!(selector.cursor("k"), 0);
    }

    #[test]
    fn test_internal_error_aborts_without_trying_others() {
        let provider = Arc::new(FakeProvider::default());
        provider.set("k/10.0.0.1", 5, true, Some(QuotaError::Backend("store offline".into())));
        provider.set("k/10.0.0.2", 5, true, None);
        let selector = selector(provider.clone());
        let pool = candidates(&[("n1", "10.0.0.1"), ("n2", "10.0.0.2")]);

        let err = selector.acquire_from("k", 1, &pool, opts).unwrap_err();
        assert_eq!(err.code(), "E_PROXY_ACQUIRE_INTERNAL_ERROR");
        assert!(std::error::Error::source(&err).is_some());
        assert_eq!(provider.acquire_calls("k/10.0.0.2"), 0);
    }

    #[test]
    fn test_options_conflict_rejected_regardless_of_weight() {
        let registry = Registry::new();
        let selector = QuotaSelector::with_registry(
            Arc::new(TokenBucketRegistry::new()),
            &NodeHandle::new("client-0"),
            &registry,
        )
        .unwrap();
        let pool = candidates(&[("n1", "10.0.0.1")]);

        selector
            .acquire_from("orders", 1, &pool, || BucketOptions::new(5, 5, Duration::from_secs(1)))
            .unwrap();
        for weight in [1, 100] {
            let err = selector
                .acquire_from("orders", weight, &pool, || {
                    BucketOptions::new(50, 5, Duration::from_secs(1))
                })
                .unwrap_err();
            assert_eq!(err.code(), "E_BUCKET_OPTIONS_CONFLICT");
        }
        assert_eq!(selector.conflict_count("orders", "orders/10.0.0.1"), 2);
        assert!(registry
            .gather()
            .iter()
            .any(|family| family.get_name() == "bucket_options_conflict_total"));
    }

    #[test]
    fn test_empty_candidates_is_target_not_found() {
        let selector = selector(Arc::new(FakeProvider::default()));
        let err = selector.acquire_from("k", 1, &[], opts).unwrap_err();
        assert_eq!(err.code(), "E_PROXY_TARGET_NOT_FOUND");
    }

    #[test]
    fn test_pool_with_empty_allow_list_fails_closed() {
        let directory = Arc::new(InMemoryDirectory::new());
        directory.publish(vec![
            proxy_node("n1", "10.0.0.1", TRUSTED_PROXY_IP_SOURCE),
            proxy_node("n2", "10.0.0.2", TRUSTED_PROXY_IP_SOURCE),
        ]);
        let node = NodeHandle::new("client-0");
        let pool = ProxyPool::new(directory, &node, TrustedNodeIds::default());
        let selector = QuotaSelector::new(Arc::new(TokenBucketRegistry::new()), &node);

        let err = selector.acquire("k", 1, &pool, opts).unwrap_err();
        assert_eq!(err.code(), "E_PROXY_TARGET_NOT_FOUND");
    }

    #[test]
    fn test_duplicate_ip_resolves_to_trusted_node() {
        let directory = Arc::new(InMemoryDirectory::new());
        directory.publish(vec![
            proxy_node("a-untrusted", "10.0.7.1", TRUSTED_PROXY_IP_SOURCE),
            proxy_node("trusted-proxy", "10.0.7.1", TRUSTED_PROXY_IP_SOURCE),
        ]);
        let node = NodeHandle::new("client-0");
        let trusted: TrustedNodeIds = ["trusted-proxy"].into_iter().collect();
        let pool = ProxyPool::new(directory, &node, trusted);
        let selector = QuotaSelector::new(Arc::new(TokenBucketRegistry::new()), &node);

        let result = selector.acquire("k", 1, &pool, opts).unwrap();
        assert_eq!(result.node_id, "trusted-proxy");
        assert_eq!(result.ip, "10.0.7.1");
    }

    #[test]
    fn test_cursor_table_evicts_oldest() {
        let mut state = SelectorState::new(2);
        state.advance("a", 3);
        state.advance("b", 3);
        state.advance("a", 3);
        state.advance("c", 3);
        assert_eq!(state.len(), 2);
        assert_eq!(state.cursor("a"), 0);
        assert_eq!(state.cursor("b"), 1);
        assert_eq!(state.cursor("c"), 1);
    }
}
