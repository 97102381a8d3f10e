use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::proxy::quota::BucketOptions;

/// Outcome of checking options against the first ones recorded for a key
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OptionsCheck {
    /// First use of the bucket key; options recorded
    Recorded,
    Consistent,
    /// Options differ from what the key was first used with
    Conflict { recorded: String, requested: String },
}

/// Bucket key -> options fingerprint, fixed at first use.
///
/// Entries are never removed or overwritten, so a bucket can't silently
/// be reused with different limits.
pub struct BucketOptionsRegistry {
    recorded: DashMap<String, String>,
}

impl BucketOptionsRegistry {
    pub fn new() -> Self {
        Self {
            recorded: DashMap::new(),
        }
    }

    pub fn check(&self, bucket_key: &str, options: &BucketOptions) -> OptionsCheck {
        let requested = options.fingerprint();
        match self.recorded.entry(bucket_key.to_string()) {
            Entry::Vacant(slot) => {
                slot.insert(requested);
                OptionsCheck::Recorded
            }
            Entry::Occupied(existing) if *existing.get() == requested => OptionsCheck::Consistent,
            Entry::Occupied(existing) => {
                tracing::warn!(
                    bucket_key,
                    recorded = %existing.get(),
                    requested = %requested,
                    "bucket options conflict"
                );
                OptionsCheck::Conflict {
                    recorded: existing.get().clone(),
                    requested,
                }
            }
        }
    }

    pub fn recorded(&self, bucket_key: &str) -> Option<String> {
        self.recorded.get(bucket_key).map(|v| v.value().clone())
    }

    pub fn len(&self) -> usize {
        self.recorded.len()
    }

    pub fn is_empty(&self) -> bool {
        self.recorded.is_empty()
    }
}

impl Default for BucketOptionsRegistry {
    fn default() -> Self {
        Self::new()
    }
}
