//! Binding store for sticky routing.
//!
//! Maps `(scope, message hash)` to the auth that served the conversation.
//! Two interchangeable backends: an in-process table and a Redis-backed
//! variant that survives restarts.

mod memory;
mod redis;

pub use memory::MemoryMessageIndex;
pub use redis::{RedisIndexOptions, RedisMessageIndex};

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::auth::Auth;

/// Bindings older than this are expired.
pub const INDEX_TTL: Duration = Duration::from_secs(6 * 60 * 60);
/// Hard cap per scope for the in-process table.
pub const INDEX_MAX_PER_SCOPE: usize = 100_000;
/// Upper bound on entries touched per GC or invalidation pass.
pub const INDEX_SCAN_GC: usize = 4_096;

/// Routing namespace: bindings never cross scopes.
pub fn scope_key(provider: &str, model: &str) -> String {
    format!(
        "{}|{}",
        provider.trim().to_ascii_lowercase(),
        model.trim().to_ascii_lowercase()
    )
}

/// One message-hash binding with its majority-vote counter.
///
/// The serialized form is also the Redis wire format:
/// `{"AuthID":"…","Count":N,"LastSeen":"<rfc3339>"}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Binding {
    #[serde(rename = "AuthID")]
    pub auth_id: String,
    #[serde(rename = "Count")]
    pub count: i64,
    #[serde(rename = "LastSeen", with = "time::serde::rfc3339")]
    pub last_seen: OffsetDateTime,
}

impl Binding {
    pub fn new(auth_id: impl Into<String>, now: OffsetDateTime) -> Self {
        Self {
            auth_id: auth_id.into(),
            count: 1,
            last_seen: now,
        }
    }

    /// Majority vote: reinforce on agreement, decay on conflict, flip
    /// ownership once the counter is exhausted. Stable against stray picks.
    pub fn vote(&mut self, auth_id: &str, now: OffsetDateTime) {
        if self.auth_id == auth_id {
            self.count = self.count.max(0) + 1;
        } else {
            self.count -= 1;
            if self.count <= 0 {
                self.auth_id = auth_id.to_string();
                self.count = 1;
            }
        }
        self.last_seen = now;
    }

    pub fn expired(&self, now: OffsetDateTime, ttl: Duration) -> bool {
        now - self.last_seen > ttl
    }
}

/// Persistence contract for sticky-selection bindings.
#[async_trait]
pub trait MessageIndex: Send + Sync {
    /// Proposes the auth whose recorded messages overlap most with the
    /// current hashes, or `None` when coverage is too thin to trust.
    async fn suggest(&self, scope: &str, hashes: &[u64], candidates: &[&Auth]) -> Option<Auth>;

    /// Binds each hash to the chosen auth with the majority-vote rule.
    async fn record(&self, scope: &str, hashes: &[u64], auth_id: &str);

    /// Removes bindings held by an auth within a scope (bounded scan);
    /// returns the number removed.
    async fn invalidate_auth(&self, scope: &str, auth_id: &str) -> usize;
}

/// Minimum overlapping-hash count required before a suggestion is trusted
/// over a random pick.
pub(crate) fn coverage_threshold(hash_count: usize) -> usize {
    match hash_count {
        count if count >= 9 => count / 3,
        count if count >= 4 => 2,
        count if count >= 2 => 1,
        _ => 0,
    }
}

/// Shared tail of both backends' `suggest`: pick the top-scoring auth id,
/// apply the coverage threshold, and require it to be an enabled candidate.
pub(crate) fn pick_suggestion(
    scores: &HashMap<String, usize>,
    hash_count: usize,
    candidates: &[&Auth],
) -> Option<Auth> {
    let mut best_id = "";
    let mut best_score = 0usize;
    for (id, score) in scores {
        if *score > best_score {
            best_score = *score;
            best_id = id;
        }
    }
    if best_id.is_empty() || best_score < coverage_threshold(hash_count) {
        return None;
    }
    candidates
        .iter()
        .find(|auth| !auth.disabled && auth.id == best_id)
        .map(|auth| (*auth).clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coverage_threshold_table() {
        assert_eq!(coverage_threshold(0), 0);
        assert_eq!(coverage_threshold(1), 0);
        assert_eq!(coverage_threshold(2), 1);
        assert_eq!(coverage_threshold(3), 1);
        assert_eq!(coverage_threshold(4), 2);
        assert_eq!(coverage_threshold(8), 2);
        assert_eq!(coverage_threshold(9), 3);
        assert_eq!(coverage_threshold(12), 4);
    }

    #[test]
    fn majority_vote_flips_only_when_exhausted() {
        let now = OffsetDateTime::now_utc();
        let mut binding = Binding::new("auth-a", now);
        binding.vote("auth-a", now);
        assert_eq!(binding.count, 2);

        binding.vote("auth-b", now);
        assert_eq!(binding.auth_id, "auth-a");
        assert_eq!(binding.count, 1);

        binding.vote("auth-b", now);
        assert_eq!(binding.auth_id, "auth-b");
        assert_eq!(binding.count, 1);
    }

    #[test]
    fn single_count_binding_flips_immediately() {
        let now = OffsetDateTime::now_utc();
        let mut binding = Binding::new("auth-a", now);
        binding.vote("auth-b", now);
        assert_eq!(binding.auth_id, "auth-b");
        assert_eq!(binding.count, 1);
    }

    #[test]
    fn wire_format_field_names() {
        let binding = Binding::new("auth-a", OffsetDateTime::UNIX_EPOCH);
        let json = serde_json::to_value(&binding).unwrap();
        assert_eq!(json["AuthID"], "auth-a");
        assert_eq!(json["Count"], 1);
        assert_eq!(json["LastSeen"], "1970-01-01T00:00:00Z");
    }

    #[test]
    fn scope_key_lowercases_both_parts() {
        assert_eq!(scope_key(" Codex ", "GPT-5"), "codex|gpt-5");
    }
}
