//! Quota primitive: token buckets keyed by an opaque bucket key.
//!
//! The selector only depends on [`QuotaBucket`] and [`BucketProvider`];
//! [`TokenBucketRegistry`] is the in-process implementation wired in by
//! default.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum QuotaError {
    /// Not enough tokens right now. The only retry-worthy failure.
    #[error("insufficient quota: bucket={bucket_key} requested={requested} available={available}")]
    Insufficient {
        bucket_key: String,
        requested: u64,
        available: u64,
    },

    /// The request can never be satisfied by this bucket.
    #[error("invalid acquire: bucket={bucket_key} requested={requested} capacity={capacity}")]
    InvalidAcquire {
        bucket_key: String,
        requested: u64,
        capacity: u64,
    },

    #[error("invalid bucket options for {bucket_key}: {reason}")]
    InvalidOptions { bucket_key: String, reason: String },

    #[error("quota backend failure: {0}")]
    Backend(String),
}

impl QuotaError {
    pub fn is_insufficient(&self) -> bool {
        matches!(self, QuotaError::Insufficient { .. })
    }
}

/// Limits of one bucket. Fixed at first use of a bucket key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BucketOptions {
    pub capacity: u64,
    pub refill_amount: u64,
    /// Milliseconds between refills
    pub refill_interval: u64,
}

impl BucketOptions {
    pub fn new(capacity: u64, refill_amount: u64, refill_interval: Duration) -> Self {
        Self {
            capacity,
            refill_amount,
            refill_interval: refill_interval.as_millis() as u64,
        }
    }

    /// Canonical string form, used to compare options across calls.
    pub fn fingerprint(&self) -> String {
        format!(
            "capacity={};refillAmount={};refillInterval={}",
            self.capacity, self.refill_amount, self.refill_interval
        )
    }

    fn validate(&self, bucket_key: &str) -> Result<(), QuotaError> {
        let reason = if self.capacity == 0 {
            "capacity must be positive"
        } else if self.refill_amount == 0 {
            "refill amount must be positive"
        } else if self.refill_interval == 0 {
            "refill interval must be positive"
        } else {
            return Ok(());
        };
        Err(QuotaError::InvalidOptions {
            bucket_key: bucket_key.to_string(),
            reason: reason.to_string(),
        })
    }
}

impl Default for BucketOptions {
    fn default() -> Self {
        Self {
            capacity: 1,
            refill_amount: 1,
            refill_interval: 1000,
        }
    }
}

/// A rate limiter the selector can probe and draw from.
pub trait QuotaBucket: Send + Sync {
    /// Current tokens, without consuming any.
    fn read(&self) -> u64;

    /// Deducts `tokens` atomically, or fails without side effects.
    fn acquire(&self, tokens: u64) -> Result<(), QuotaError>;
}

/// Resolves the bucket for a key, creating it on first use.
pub trait BucketProvider: Send + Sync {
    fn bucket(
        &self,
        bucket_key: &str,
        options: &BucketOptions,
    ) -> Result<Arc<dyn QuotaBucket>, QuotaError>;
}

struct BucketState {
    tokens: u64,
    last_refill: Instant,
}

/// Token bucket that starts full and refills `refill_amount` tokens every
/// `refill_interval`, never above `capacity`. Refill is computed lazily.
pub struct TokenBucket {
    key: String,
    capacity: u64,
    refill_amount: u64,
    refill_interval: Duration,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    pub fn new(key: impl Into<String>, options: &BucketOptions) -> Result<Self, QuotaError> {
        let key = key.into();
        options.validate(&key)?;
        Ok(Self {
            key,
            capacity: options.capacity,
            refill_amount: options.refill_amount,
            refill_interval: Duration::from_millis(options.refill_interval),
            state: Mutex::new(BucketState {
                tokens: options.capacity,
                last_refill: Instant::now(),
            }),
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    fn refill(&self, state: &mut BucketState) {
        let elapsed = state.last_refill.elapsed();
        let intervals = (elapsed.as_millis() / self.refill_interval.as_millis().max(1)) as u64;
        if intervals == 0 {
            return;
        }
        let added = intervals.saturating_mul(self.refill_amount);
        state.tokens = state.tokens.saturating_add(added).min(self.capacity);
        // u32 is plenty for interval counts between two reads
        let advance = self.refill_interval * intervals.min(u32::MAX as u64) as u32;
        state.last_refill += advance;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BucketState> {
        // A poisoned bucket still holds a valid token count.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl QuotaBucket for TokenBucket {
    fn read(&self) -> u64 {
        let mut state = self.lock();
        self.refill(&mut state);
        state.tokens
    }

    fn acquire(&self, tokens: u64) -> Result<(), QuotaError> {
        if tokens == 0 || tokens > self.capacity {
            return Err(QuotaError::InvalidAcquire {
                bucket_key: self.key.clone(),
                requested: tokens,
                capacity: self.capacity,
            });
        }
        let mut state = self.lock();
        self.refill(&mut state);
        if state.tokens < tokens {
            return Err(QuotaError::Insufficient {
                bucket_key: self.key.clone(),
                requested: tokens,
                available: state.tokens,
            });
        }
        state.tokens -= tokens;
        Ok(())
    }
}

/// Process-wide table of token buckets. The first options seen for a key
/// define the bucket; later callers get the same bucket.
pub struct TokenBucketRegistry {
    buckets: DashMap<String, Arc<TokenBucket>>,
}

impl TokenBucketRegistry {
    pub fn new() -> Self {
        Self {
            buckets: DashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}

impl Default for TokenBucketRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl BucketProvider for TokenBucketRegistry {
    fn bucket(
        &self,
        bucket_key: &str,
        options: &BucketOptions,
    ) -> Result<Arc<dyn QuotaBucket>, QuotaError> {
        if let Some(existing) = self.buckets.get(bucket_key) {
            let bucket: Arc<dyn QuotaBucket> = existing.value().clone();
            return Ok(bucket);
        }
        let created = Arc::new(TokenBucket::new(bucket_key, options)?);
        let stored = self
            .buckets
            .entry(bucket_key.to_string())
            .or_insert(created)
            .value()
            .clone();
        tracing::debug!(bucket_key, capacity = stored.capacity(), "token bucket created");
        let bucket: Arc<dyn QuotaBucket> = stored;
        Ok(bucket)
    }
}
