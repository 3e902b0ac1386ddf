use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::auth::Auth;

use super::{Binding, INDEX_SCAN_GC, INDEX_TTL, MessageIndex, pick_suggestion};

const DEFAULT_PREFIX: &str = "msgidx";
const SCAN_PAGE: usize = 512;

/// Connection options for the Redis-backed binding store.
#[derive(Debug, Clone, Default)]
pub struct RedisIndexOptions {
    /// `host:port`, e.g. `127.0.0.1:6379`.
    pub addr: String,
    pub password: Option<String>,
    pub db: i64,
    /// Key prefix; empty uses `msgidx`.
    pub prefix: Option<String>,
    /// Binding expiry; `None` uses the package default.
    pub ttl: Option<Duration>,
}

/// Binding store persisted in Redis so sticky affinity survives restarts.
///
/// Values live at `prefix:scope:hash` with a per-key TTL. The store is
/// strictly best-effort: construction never hard-fails on an unreachable
/// server, and every operation degrades to a miss or no-op on transport
/// errors, leaving the selector to fall through to random/round-robin.
pub struct RedisMessageIndex {
    client: redis::Client,
    conn: Mutex<Option<ConnectionManager>>,
    prefix: String,
    ttl: Duration,
}

impl RedisMessageIndex {
    /// Builds the store and attempts a best-effort ping; an unreachable
    /// server is logged, not fatal.
    pub async fn connect(opts: RedisIndexOptions) -> Result<Self, redis::RedisError> {
        let index = Self::new(opts)?;
        if let Some(mut conn) = index.connection().await {
            let ping: Result<String, _> = redis::cmd("PING").query_async(&mut conn).await;
            if let Err(err) = ping {
                warn!(error = %err, "sticky index redis ping failed; continuing degraded");
            }
        }
        Ok(index)
    }

    /// Fails only on an invalid address, never on server availability.
    pub fn new(opts: RedisIndexOptions) -> Result<Self, redis::RedisError> {
        let (host, port) = split_addr(&opts.addr);
        let info = redis::ConnectionInfo {
            addr: redis::ConnectionAddr::Tcp(host, port),
            redis: redis::RedisConnectionInfo {
                db: opts.db,
                username: None,
                password: opts.password.filter(|password| !password.is_empty()),
                ..Default::default()
            },
        };
        let client = redis::Client::open(info)?;
        let prefix = opts
            .prefix
            .map(|prefix| prefix.trim().to_string())
            .filter(|prefix| !prefix.is_empty())
            .unwrap_or_else(|| DEFAULT_PREFIX.to_string());
        Ok(Self {
            client,
            conn: Mutex::new(None),
            prefix,
            ttl: opts.ttl.filter(|ttl| !ttl.is_zero()).unwrap_or(INDEX_TTL),
        })
    }

    fn key(&self, scope: &str, hash: u64) -> String {
        format!(
            "{}:{}:{}",
            self.prefix,
            scope.trim().to_ascii_lowercase(),
            hash
        )
    }

    /// Returns a live connection, dialing lazily on first use. The manager
    /// reconnects on its own afterwards; a failed dial leaves the store
    /// degraded until the next attempt.
    async fn connection(&self) -> Option<ConnectionManager> {
        let mut guard = self.conn.lock().await;
        if let Some(conn) = guard.as_ref() {
            return Some(conn.clone());
        }
        match ConnectionManager::new(self.client.clone()).await {
            Ok(conn) => {
                *guard = Some(conn.clone());
                Some(conn)
            }
            Err(err) => {
                debug!(error = %err, "sticky index redis unavailable");
                None
            }
        }
    }
}

#[async_trait]
impl MessageIndex for RedisMessageIndex {
    async fn suggest(&self, scope: &str, hashes: &[u64], candidates: &[&Auth]) -> Option<Auth> {
        if scope.is_empty() || hashes.is_empty() {
            return None;
        }
        let mut conn = self.connection().await?;
        let keys: Vec<String> = hashes.iter().map(|hash| self.key(scope, *hash)).collect();
        let values: Vec<Option<String>> = match redis::Cmd::mget(&keys).query_async(&mut conn).await
        {
            Ok(values) => values,
            Err(err) => {
                debug!(error = %err, "sticky index mget failed");
                return None;
            }
        };

        let mut scores: HashMap<String, usize> = HashMap::with_capacity(8);
        for value in values.into_iter().flatten() {
            if let Ok(binding) = serde_json::from_str::<Binding>(&value)
                && !binding.auth_id.is_empty()
            {
                *scores.entry(binding.auth_id).or_default() += 1;
            }
        }
        if scores.is_empty() {
            return None;
        }
        pick_suggestion(&scores, hashes.len(), candidates)
    }

    async fn record(&self, scope: &str, hashes: &[u64], auth_id: &str) {
        if scope.is_empty() || auth_id.is_empty() || hashes.is_empty() {
            return;
        }
        let Some(mut conn) = self.connection().await else {
            return;
        };
        let now = OffsetDateTime::now_utc();
        let ttl_secs = self.ttl.as_secs();
        for hash in hashes {
            let key = self.key(scope, *hash);
            let existing: Option<String> = redis::Cmd::get(&key)
                .query_async(&mut conn)
                .await
                .unwrap_or_default();
            let binding = match existing.as_deref().map(serde_json::from_str::<Binding>) {
                Some(Ok(mut binding)) => {
                    binding.vote(auth_id, now);
                    binding
                }
                _ => Binding::new(auth_id, now),
            };
            let Ok(payload) = serde_json::to_string(&binding) else {
                continue;
            };
            let written: Result<(), _> = redis::Cmd::set_ex(&key, payload, ttl_secs)
                .query_async(&mut conn)
                .await;
            if let Err(err) = written {
                debug!(error = %err, "sticky index write failed");
                return;
            }
        }
    }

    async fn invalidate_auth(&self, scope: &str, auth_id: &str) -> usize {
        let auth_id = auth_id.trim();
        if scope.is_empty() || auth_id.is_empty() {
            return 0;
        }
        let Some(mut conn) = self.connection().await else {
            return 0;
        };
        let pattern = format!("{}:{}:*", self.prefix, scope.trim().to_ascii_lowercase());
        let now = OffsetDateTime::now_utc();
        let mut cursor: u64 = 0;
        let mut removed = 0usize;
        let mut scanned = 0usize;

        loop {
            let page: Result<(u64, Vec<String>), _> = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_PAGE)
                .query_async(&mut conn)
                .await;
            let (next, keys) = match page {
                Ok(page) => page,
                Err(err) => {
                    debug!(error = %err, "sticky index scan failed");
                    return removed;
                }
            };
            cursor = next;

            if !keys.is_empty() {
                let values: Vec<Option<String>> =
                    match redis::Cmd::mget(&keys).query_async(&mut conn).await {
                        Ok(values) => values,
                        Err(_) => return removed,
                    };
                for (key, value) in keys.iter().zip(values) {
                    let Some(value) = value else { continue };
                    scanned += 1;
                    let Ok(binding) = serde_json::from_str::<Binding>(&value) else {
                        continue;
                    };
                    if binding.auth_id == auth_id {
                        let _: Result<(), _> = redis::Cmd::del(key).query_async(&mut conn).await;
                        removed += 1;
                        if removed >= INDEX_SCAN_GC {
                            return removed;
                        }
                    } else if binding.expired(now, self.ttl) {
                        // Opportunistic cleanup of stale bindings on the way.
                        let _: Result<(), _> = redis::Cmd::del(key).query_async(&mut conn).await;
                    }
                    if scanned >= INDEX_SCAN_GC {
                        return removed;
                    }
                }
            }

            if cursor == 0 {
                return removed;
            }
        }
    }
}

fn split_addr(addr: &str) -> (String, u16) {
    let addr = addr.trim();
    match addr.rsplit_once(':') {
        Some((host, port)) => match port.parse::<u16>() {
            Ok(port) => (host.to_string(), port),
            Err(_) => (addr.to_string(), 6379),
        },
        None => (addr.to_string(), 6379),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn addr_parsing_defaults_the_port() {
        assert_eq!(split_addr("127.0.0.1:6380"), ("127.0.0.1".to_string(), 6380));
        assert_eq!(split_addr("redis.internal"), ("redis.internal".to_string(), 6379));
    }

    #[test]
    fn key_shape_is_prefix_scope_hash() {
        let index = RedisMessageIndex::new(RedisIndexOptions {
            addr: "127.0.0.1:6379".to_string(),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(index.key("Codex|GPT-5", 42), "msgidx:codex|gpt-5:42");
    }
}
