use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use rand::Rng;

use crate::auth::Auth;
use crate::error::AuthNotFound;
use crate::executor::Options;
use crate::fingerprint::extract_message_hashes;
use crate::index::{MessageIndex, scope_key};

/// Providers whose upstream caches are per-account, making affinity valuable.
const STICKY_PROVIDER: &str = "codex";

type RandomIndex = dyn Fn(usize) -> usize + Send + Sync;

/// Chooses one auth from a candidate slice.
///
/// For the sticky provider the choice follows the conversation fingerprint
/// through the message index so long conversations keep hitting the same
/// upstream account; everything else gets per-scope round-robin. Returned
/// auths are always clones, never references into shared state.
pub struct StickySelector {
    index: Arc<dyn MessageIndex>,
    /// Round-robin cursor per scope. Cursors are process-local; losing them
    /// on restart is acceptable.
    cursors: Mutex<HashMap<String, usize>>,
    /// Every scope this selector has served, for disable-time invalidation.
    seen_scopes: Mutex<HashSet<String>>,
    pick_random: Box<RandomIndex>,
}

impl StickySelector {
    pub fn new(index: Arc<dyn MessageIndex>) -> Self {
        Self::with_rng(
            index,
            Box::new(|len| {
                if len <= 1 {
                    0
                } else {
                    rand::rng().random_range(0..len)
                }
            }),
        )
    }

    /// Injects the ambiguous-case chooser so tests can be deterministic.
    pub fn with_rng(index: Arc<dyn MessageIndex>, pick_random: Box<RandomIndex>) -> Self {
        Self {
            index,
            cursors: Mutex::new(HashMap::new()),
            seen_scopes: Mutex::new(HashSet::new()),
            pick_random,
        }
    }

    /// Picks an auth for `(provider, model)` among `candidates`.
    ///
    /// Never returns a disabled auth or one outside the candidate slice.
    pub async fn pick(
        &self,
        provider: &str,
        model: &str,
        opts: &Options,
        candidates: &[Auth],
    ) -> Result<Auth, AuthNotFound> {
        let filtered: Vec<&Auth> = candidates.iter().filter(|auth| !auth.disabled).collect();
        if filtered.is_empty() {
            return Err(AuthNotFound);
        }

        let scope = scope_key(provider, model);
        self.seen_scopes
            .lock()
            .expect("selector scope set lock poisoned")
            .insert(scope.clone());

        if provider.trim().eq_ignore_ascii_case(STICKY_PROVIDER) {
            let hashes = extract_message_hashes(&opts.original_request);
            if !hashes.is_empty() {
                if let Some(chosen) = self.index.suggest(&scope, &hashes, &filtered).await {
                    self.index.record(&scope, &hashes, &chosen.id).await;
                    return Ok(chosen);
                }
                // Messages are present but affinity is ambiguous: pick
                // uniformly at random, not "second best", and seed bindings
                // from this pick.
                let choice = (self.pick_random)(filtered.len()).min(filtered.len() - 1);
                let chosen = filtered[choice].clone();
                self.index.record(&scope, &hashes, &chosen.id).await;
                return Ok(chosen);
            }
            // No usable conversation fingerprint: fall through to round-robin.
        }

        let mut cursors = self.cursors.lock().expect("selector cursor lock poisoned");
        let cursor = cursors.get(&scope).copied().unwrap_or(0) % filtered.len();
        cursors.insert(scope, (cursor + 1) % filtered.len());
        Ok(filtered[cursor].clone())
    }

    /// Purges sticky bindings for `(scope, auth_id)`.
    pub async fn invalidate_auth(&self, scope: &str, auth_id: &str) -> usize {
        self.index.invalidate_auth(scope, auth_id).await
    }

    /// Purges the auth's bindings in every scope this selector has served for
    /// its provider.
    pub async fn invalidate_auth_everywhere(&self, provider: &str, auth_id: &str) -> usize {
        let prefix = format!("{}|", provider.trim().to_ascii_lowercase());
        let scopes: Vec<String> = {
            let seen = self
                .seen_scopes
                .lock()
                .expect("selector scope set lock poisoned");
            seen.iter()
                .filter(|scope| scope.starts_with(&prefix))
                .cloned()
                .collect()
        };
        let mut removed = 0usize;
        for scope in scopes {
            removed += self.index.invalidate_auth(&scope, auth_id).await;
        }
        removed
    }
}
