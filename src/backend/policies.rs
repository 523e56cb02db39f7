use crate::policy::RateLimit;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;

/// Lower bound of the wait reported for an exhausted quota, so a retrying caller always sleeps.
pub(crate) const MIN_WAIT: Duration = Duration::from_millis(1);

/// Process-local table of registered policies, shared by the bundled stores.
#[derive(Clone, Default)]
pub(crate) struct PolicyTable(Arc<DashMap<String, Arc<[RateLimit]>>>);

impl PolicyTable {
    /// Re-registering identical rules is a no-op, differing rules replace the previous ones.
    pub(crate) fn register(&self, policy_key: &str, rate_limits: Vec<RateLimit>) {
        match self.0.entry(policy_key.to_owned()) {
            Entry::Occupied(mut entry) => {
                if entry.get()[..] != rate_limits[..] {
                    log::warn!(
                        "Replacing rate limits for policy {policy_key}: {:?} -> {:?}",
                        entry.get(),
                        rate_limits
                    );
                    entry.insert(rate_limits.into());
                }
            }
            Entry::Vacant(entry) => {
                log::debug!("Registered rate limits for policy {policy_key}: {rate_limits:?}");
                entry.insert(rate_limits.into());
            }
        }
    }

    pub(crate) fn get(&self, policy_key: &str) -> Option<Arc<[RateLimit]>> {
        self.0.get(policy_key).map(|rate_limits| rate_limits.value().clone())
    }
}

/// The store key of the counter for one rule of a policy, for one subject.
///
/// Policy keys and subjects may both contain `:` (IPv6 subjects do), so the policy key is
/// prefixed with its length. The index never contains `:`, which makes the split unambiguous.
pub(crate) fn bucket_key(policy_key: &str, subject_id: &str, index: usize) -> String {
    format!("{}:{policy_key}:{subject_id}:{index}", policy_key.len())
}
