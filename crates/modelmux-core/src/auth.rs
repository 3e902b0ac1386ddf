use std::collections::HashMap;

use tokio::time::Instant;

pub type Metadata = HashMap<String, serde_json::Value>;

/// One upstream credential, addressable by a stable id and enumerable by
/// provider. Mutated only by the [`AuthManager`](crate::AuthManager); every
/// hand-out across an API boundary is a deep clone so callers cannot touch
/// shared state.
#[derive(Debug, Clone)]
pub struct Auth {
    pub id: String,
    /// Lowercase provider tag, e.g. `codex`, `gemini`, `claude`,
    /// `openai-compat:<name>`.
    pub provider: String,
    pub label: Option<String>,
    pub disabled: bool,
    /// Set while the credential sits out a retriable-failure window.
    pub quarantined_until: Option<Instant>,
    pub metadata: Metadata,
}

impl Auth {
    pub fn new(id: impl Into<String>, provider: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            provider: provider.into().trim().to_ascii_lowercase(),
            label: None,
            disabled: false,
            quarantined_until: None,
            metadata: Metadata::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn is_quarantined(&self, now: Instant) -> bool {
        matches!(self.quarantined_until, Some(until) if until > now)
    }

    /// Eligible as a selection candidate right now.
    pub fn is_selectable(&self, now: Instant) -> bool {
        !self.disabled && !self.is_quarantined(now)
    }
}
