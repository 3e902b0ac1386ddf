use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use time::OffsetDateTime;

use crate::auth::Auth;

use super::{
    Binding, INDEX_MAX_PER_SCOPE, INDEX_SCAN_GC, INDEX_TTL, MessageIndex, pick_suggestion,
};

/// GC is attempted once per this many record calls, plus whenever a scope
/// table is over the hard cap.
const GC_OPS_INTERVAL: u64 = 1024;

/// In-process binding store.
///
/// One lock guards the whole structure; critical sections contain only map
/// mutation and bounded GC scans, so the selection path never waits on
/// anything unbounded.
pub struct MemoryMessageIndex {
    inner: Mutex<Inner>,
    ttl: Duration,
    max_per_scope: usize,
}

struct Inner {
    scopes: HashMap<String, HashMap<u64, Binding>>,
    ops: u64,
}

impl Default for MemoryMessageIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryMessageIndex {
    pub fn new() -> Self {
        Self::with_limits(INDEX_TTL, INDEX_MAX_PER_SCOPE)
    }

    /// Test hook: shrink the TTL and cap without waiting hours.
    pub fn with_limits(ttl: Duration, max_per_scope: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                scopes: HashMap::new(),
                ops: 0,
            }),
            ttl,
            max_per_scope,
        }
    }

    pub fn scope_len(&self, scope: &str) -> usize {
        let inner = self.inner.lock().expect("message index lock poisoned");
        inner.scopes.get(scope).map_or(0, HashMap::len)
    }

    fn gc_scope(table: &mut HashMap<u64, Binding>, now: OffsetDateTime, ttl: Duration, cap: usize) {
        let mut removed = 0usize;
        let stale: Vec<u64> = table
            .iter()
            .filter(|(_, binding)| binding.expired(now, ttl))
            .map(|(hash, _)| *hash)
            .take(INDEX_SCAN_GC)
            .collect();
        for hash in stale {
            table.remove(&hash);
            removed += 1;
            if removed >= INDEX_SCAN_GC {
                break;
            }
        }

        // Still over the cap: shed anything past half the TTL, same bound.
        if table.len() > cap {
            let half_ttl = ttl / 2;
            let old: Vec<u64> = table
                .iter()
                .filter(|(_, binding)| binding.expired(now, half_ttl))
                .map(|(hash, _)| *hash)
                .take(INDEX_SCAN_GC)
                .collect();
            for hash in old {
                table.remove(&hash);
            }
        }
    }
}

#[async_trait]
impl MessageIndex for MemoryMessageIndex {
    async fn suggest(&self, scope: &str, hashes: &[u64], candidates: &[&Auth]) -> Option<Auth> {
        if scope.is_empty() || hashes.is_empty() {
            return None;
        }
        let scores = {
            let inner = self.inner.lock().expect("message index lock poisoned");
            let table = inner.scopes.get(scope)?;
            let mut scores: HashMap<String, usize> = HashMap::with_capacity(8);
            for hash in hashes {
                if let Some(binding) = table.get(hash)
                    && !binding.auth_id.is_empty()
                {
                    *scores.entry(binding.auth_id.clone()).or_default() += 1;
                }
            }
            scores
        };
        if scores.is_empty() {
            return None;
        }
        pick_suggestion(&scores, hashes.len(), candidates)
    }

    async fn record(&self, scope: &str, hashes: &[u64], auth_id: &str) {
        if scope.is_empty() || auth_id.is_empty() || hashes.is_empty() {
            return;
        }
        let now = OffsetDateTime::now_utc();
        let ttl = self.ttl;
        let cap = self.max_per_scope;
        let mut inner = self.inner.lock().expect("message index lock poisoned");
        inner.ops += 1;
        let due = inner.ops % GC_OPS_INTERVAL == 0;
        let table = inner.scopes.entry(scope.to_string()).or_default();
        for hash in hashes {
            table
                .entry(*hash)
                .and_modify(|binding| binding.vote(auth_id, now))
                .or_insert_with(|| Binding::new(auth_id, now));
        }
        if due || table.len() > cap {
            Self::gc_scope(table, now, ttl, cap);
        }
    }

    async fn invalidate_auth(&self, scope: &str, auth_id: &str) -> usize {
        let auth_id = auth_id.trim();
        if scope.is_empty() || auth_id.is_empty() {
            return 0;
        }
        let now = OffsetDateTime::now_utc();
        let mut inner = self.inner.lock().expect("message index lock poisoned");
        let Some(table) = inner.scopes.get_mut(scope) else {
            return 0;
        };

        // One bounded pass that drops the auth's bindings and ages out stale
        // entries it happens to walk over.
        let mut removed = 0usize;
        let mut scanned = 0usize;
        let victims: Vec<u64> = table
            .iter()
            .filter_map(|(hash, binding)| {
                if scanned >= INDEX_SCAN_GC {
                    return None;
                }
                if binding.expired(now, self.ttl) || binding.auth_id == auth_id {
                    scanned += 1;
                    Some(*hash)
                } else {
                    None
                }
            })
            .collect();
        for hash in victims {
            table.remove(&hash);
            removed += 1;
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn auth(id: &str) -> Auth {
        Auth::new(id, "codex")
    }

    #[tokio::test]
    async fn suggest_requires_coverage() {
        let index = MemoryMessageIndex::new();
        let a = auth("auth-a");
        let candidates = [&a];
        let hashes: Vec<u64> = (0..6).collect();

        // Only one of six hashes bound: below the 4..=8 threshold of 2.
        index.record("codex|gpt-5", &hashes[..1], "auth-a").await;
        assert!(
            index
                .suggest("codex|gpt-5", &hashes, &candidates)
                .await
                .is_none()
        );

        index.record("codex|gpt-5", &hashes[..3], "auth-a").await;
        let suggested = index.suggest("codex|gpt-5", &hashes, &candidates).await;
        assert_eq!(suggested.unwrap().id, "auth-a");
    }

    #[tokio::test]
    async fn suggestion_never_crosses_scopes() {
        let index = MemoryMessageIndex::new();
        let a = auth("auth-a");
        let candidates = [&a];
        let hashes = [1u64, 2, 3];

        index.record("codex|gpt-5", &hashes, "auth-a").await;
        assert!(
            index
                .suggest("codex|gpt-5-mini", &hashes, &candidates)
                .await
                .is_none()
        );
    }

    #[tokio::test]
    async fn disabled_candidates_are_never_suggested() {
        let index = MemoryMessageIndex::new();
        let mut a = auth("auth-a");
        let hashes = [1u64, 2, 3];
        index.record("codex|gpt-5", &hashes, "auth-a").await;

        a.disabled = true;
        let candidates = [&a];
        assert!(
            index
                .suggest("codex|gpt-5", &hashes, &candidates)
                .await
                .is_none()
        );
    }

    #[tokio::test]
    async fn invalidate_removes_bindings() {
        let index = MemoryMessageIndex::new();
        let hashes = [1u64, 2, 3, 4];
        index.record("codex|gpt-5", &hashes, "auth-a").await;
        index.record("codex|gpt-5", &[9u64], "auth-b").await;

        let removed = index.invalidate_auth("codex|gpt-5", "auth-a").await;
        assert_eq!(removed, 4);
        assert_eq!(index.scope_len("codex|gpt-5"), 1);
    }

    #[tokio::test]
    async fn cap_overflow_triggers_bounded_gc() {
        let index = MemoryMessageIndex::with_limits(Duration::from_secs(0), 64);
        let hashes: Vec<u64> = (0..64).collect();
        index.record("codex|gpt-5", &hashes, "auth-a").await;

        // TTL zero makes every earlier binding stale, so crossing the cap
        // sheds the old batch down to just the new burst.
        let burst: Vec<u64> = (1000..1032).collect();
        index.record("codex|gpt-5", &burst, "auth-a").await;
        assert!(index.scope_len("codex|gpt-5") <= 64 + burst.len());
    }
}
