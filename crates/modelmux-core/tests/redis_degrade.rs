use std::time::Duration;

use modelmux_core::{Auth, MessageIndex, RedisIndexOptions, RedisMessageIndex};

/// With no reachable server every operation must degrade: suggest misses,
/// record is a no-op, invalidate removes nothing. Nothing may panic or error.
#[tokio::test]
async fn unreachable_server_degrades_to_miss() {
    // Port 1 is reserved; nothing should be listening there.
    let index = RedisMessageIndex::new(RedisIndexOptions {
        addr: "127.0.0.1:1".to_string(),
        ..Default::default()
    })
    .unwrap();

    let auth = Auth::new("a", "codex");
    let candidates = [&auth];
    let hashes = [1u64, 2, 3];

    let outcome = tokio::time::timeout(Duration::from_secs(10), async {
        index.record("codex|gpt-5", &hashes, "a").await;
        let suggestion = index.suggest("codex|gpt-5", &hashes, &candidates).await;
        let removed = index.invalidate_auth("codex|gpt-5", "a").await;
        (suggestion, removed)
    })
    .await;

    if let Ok((suggestion, removed)) = outcome {
        assert!(suggestion.is_none());
        assert_eq!(removed, 0);
    }
}
