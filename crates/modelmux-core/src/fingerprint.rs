//! Conversation fingerprinting for sticky routing.
//!
//! A request's user/system texts are normalized and hashed individually; the
//! resulting hash set is the conversation's fingerprint. Multi-turn requests
//! resend earlier messages verbatim, so overlapping hashes identify the
//! conversation without storing any message content.

use serde_json::Value;

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// Normalized strings shorter than this many letters+digits are too generic
/// ("hi", "ok") to identify a conversation and are dropped.
const MIN_TEXT_CHARS: usize = 16;
const MAX_NORMALIZED_CHARS: usize = 4096;

pub fn fnv1a64(text: &str) -> u64 {
    let mut hash = FNV_OFFSET;
    for byte in text.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Parses the caller's original request JSON and returns unique 64-bit hashes
/// for each relevant textual message: OpenAI-style `messages` entries with a
/// user/system (or absent) role, or Responses-style `input`.
pub fn extract_message_hashes(raw: &[u8]) -> Vec<u64> {
    if raw.is_empty() {
        return Vec::new();
    }
    let Ok(root) = serde_json::from_slice::<Value>(raw) else {
        return Vec::new();
    };
    let Some(object) = root.as_object() else {
        return Vec::new();
    };

    let mut hashes: Vec<u64> = Vec::new();
    if let Some(messages) = object.get("messages").and_then(Value::as_array) {
        for message in messages {
            let Some(message) = message.as_object() else {
                continue;
            };
            let role = message
                .get("role")
                .and_then(Value::as_str)
                .map(|role| role.trim().to_ascii_lowercase())
                .unwrap_or_default();
            if !role.is_empty() && role != "user" && role != "system" {
                continue;
            }
            match message.get("content") {
                Some(Value::String(text)) => push_hash(&mut hashes, text),
                Some(Value::Array(parts)) => {
                    for part in parts {
                        if let Some(text) = part_text(part) {
                            push_hash(&mut hashes, text);
                        }
                    }
                }
                _ => {}
            }
        }
    } else if let Some(input) = object.get("input") {
        match input {
            Value::String(text) => push_hash(&mut hashes, text),
            Value::Array(items) => {
                for item in items {
                    if let Some(text) = part_text(item) {
                        push_hash(&mut hashes, text);
                    }
                }
            }
            _ => {}
        }
    }

    dedup_preserving_order(hashes)
}

fn part_text(part: &Value) -> Option<&str> {
    let part = part.as_object()?;
    if let Some(text) = part.get("text").and_then(Value::as_str)
        && !text.is_empty()
    {
        return Some(text);
    }
    part.get("content")
        .and_then(Value::as_str)
        .filter(|text| !text.is_empty())
}

fn push_hash(hashes: &mut Vec<u64>, text: &str) {
    if let Some(normalized) = normalize_text(text) {
        hashes.push(fnv1a64(&normalized));
    }
}

/// Lowercases, collapses Unicode whitespace runs to a single space, drops NUL
/// and BOM, caps length, and rejects strings with fewer than
/// [`MIN_TEXT_CHARS`] letters+digits.
fn normalize_text(raw: &str) -> Option<String> {
    let lowered = raw.trim().to_lowercase();
    if lowered.is_empty() {
        return None;
    }

    let mut out = String::with_capacity(lowered.len().min(MAX_NORMALIZED_CHARS));
    let mut prev_space = false;
    let mut text_chars = 0usize;
    let mut total_chars = 0usize;
    for ch in lowered.chars() {
        if total_chars >= MAX_NORMALIZED_CHARS {
            break;
        }
        if ch.is_whitespace() {
            if !prev_space {
                out.push(' ');
                prev_space = true;
                total_chars += 1;
            }
            continue;
        }
        prev_space = false;
        if ch == '\u{0000}' || ch == '\u{FEFF}' {
            continue;
        }
        if ch.is_alphanumeric() {
            text_chars += 1;
        }
        out.push(ch);
        total_chars += 1;
    }

    if text_chars < MIN_TEXT_CHARS {
        return None;
    }
    let trimmed = out.trim();
    if trimmed.len() == out.len() {
        Some(out)
    } else {
        Some(trimmed.to_string())
    }
}

fn dedup_preserving_order(hashes: Vec<u64>) -> Vec<u64> {
    if hashes.len() <= 1 {
        return hashes;
    }
    let mut seen = std::collections::HashSet::with_capacity(hashes.len());
    hashes.into_iter().filter(|h| seen.insert(*h)).collect()
}
