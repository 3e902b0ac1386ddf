use std::collections::HashMap;

use serde_json::json;

use crate::auth::Metadata;
use crate::error::UnknownProvider;

/// Separator for dynamic `provider://model` routes.
const DYNAMIC_ROUTE_SEPARATOR: &str = "://";
const THINKING_SUFFIX_MARKER: &str = "-thinking-";

/// Outcome of model resolution: candidate providers in preference order, the
/// normalized model name, and any metadata extracted from suffixes.
#[derive(Debug, Clone)]
pub struct ResolvedModel {
    pub providers: Vec<String>,
    pub model: String,
    pub metadata: Metadata,
}

/// Prefix-based routing table from model names to providers.
///
/// Longest matching prefix wins; exact entries are just prefixes that happen
/// to cover the whole name.
#[derive(Debug, Clone)]
pub struct RouteTable {
    rules: Vec<(String, Vec<String>)>,
}

impl RouteTable {
    /// Routing for the stock provider families.
    pub fn builtin() -> Self {
        Self {
            rules: vec![
                ("claude-".to_string(), vec!["claude".to_string()]),
                ("gemini-".to_string(), vec!["gemini".to_string()]),
                ("gpt-".to_string(), vec!["codex".to_string()]),
                ("codex-".to_string(), vec!["codex".to_string()]),
            ],
        }
    }

    pub fn empty() -> Self {
        Self { rules: Vec::new() }
    }

    /// Layers extra rules over the table; later additions win ties by being
    /// checked as longer-or-equal prefixes first.
    pub fn add_rule(&mut self, prefix: impl Into<String>, providers: Vec<String>) {
        self.rules.push((prefix.into(), providers));
    }

    fn providers_for(&self, model: &str) -> Vec<String> {
        let mut best: Option<&(String, Vec<String>)> = None;
        for rule in &self.rules {
            if model.starts_with(rule.0.as_str())
                && best.is_none_or(|current| rule.0.len() > current.0.len())
            {
                best = Some(rule);
            }
        }
        best.map(|(_, providers)| providers.clone()).unwrap_or_default()
    }
}

/// Maps a possibly-prefixed model name onto candidate providers.
#[derive(Debug, Clone)]
pub struct ModelResolver {
    table: RouteTable,
    /// Provider names eligible for `name://model` dynamic routes.
    compat_providers: Vec<String>,
    /// Stateless alias table; resolves e.g. `auto` before any other step.
    aliases: HashMap<String, String>,
}

impl ModelResolver {
    pub fn new(table: RouteTable, compat_providers: Vec<String>) -> Self {
        let mut aliases = HashMap::new();
        aliases.insert("auto".to_string(), "gpt-5".to_string());
        Self {
            table,
            compat_providers,
            aliases,
        }
    }

    pub fn set_alias(&mut self, alias: impl Into<String>, target: impl Into<String>) {
        self.aliases.insert(alias.into(), target.into());
    }

    pub fn resolve(&self, model_name: &str) -> Result<ResolvedModel, UnknownProvider> {
        let name = model_name.trim();
        let name = self
            .aliases
            .get(name)
            .map(String::as_str)
            .unwrap_or(name);

        // Dynamic routes skip normalization: the model part belongs to the
        // named openai-compat provider verbatim.
        if let Some((provider_part, model_part)) = name.split_once(DYNAMIC_ROUTE_SEPARATOR)
            && self
                .compat_providers
                .iter()
                .any(|candidate| candidate == provider_part)
        {
            return Ok(ResolvedModel {
                providers: vec![provider_part.to_string()],
                model: model_part.to_string(),
                metadata: Metadata::new(),
            });
        }

        let (normalized, metadata) = normalize_model_metadata(name);
        let providers = self.table.providers_for(&normalized);
        if providers.is_empty() {
            return Err(UnknownProvider {
                model: model_name.to_string(),
            });
        }
        Ok(ResolvedModel {
            providers,
            model: normalized,
            metadata,
        })
    }
}

/// Strips provider-specific suffixes, recording what they carried.
///
/// Today that is the Gemini `-thinking-<N>` suffix, which becomes
/// `metadata["thinking_budget"] = N`.
fn normalize_model_metadata(name: &str) -> (String, Metadata) {
    let mut metadata = Metadata::new();
    if !name.starts_with("gemini-") {
        return (name.to_string(), metadata);
    }
    if let Some(pos) = name.rfind(THINKING_SUFFIX_MARKER) {
        let budget = &name[pos + THINKING_SUFFIX_MARKER.len()..];
        if !budget.is_empty()
            && budget.bytes().all(|b| b.is_ascii_digit())
            && let Ok(value) = budget.parse::<i64>()
        {
            metadata.insert("thinking_budget".to_string(), json!(value));
            return (name[..pos].to_string(), metadata);
        }
    }
    (name.to_string(), metadata)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver() -> ModelResolver {
        let mut table = RouteTable::builtin();
        table.add_rule("llama-", vec!["groq".to_string()]);
        ModelResolver::new(table, vec!["groq".to_string()])
    }

    #[test]
    fn static_table_routes_by_prefix() {
        let resolved = resolver().resolve("claude-sonnet-4-5").unwrap();
        assert_eq!(resolved.providers, vec!["claude"]);
        assert_eq!(resolved.model, "claude-sonnet-4-5");
        assert!(resolved.metadata.is_empty());
    }

    #[test]
    fn dynamic_route_skips_normalization() {
        let resolved = resolver().resolve("groq://llama-3.1-8b").unwrap();
        assert_eq!(resolved.providers, vec!["groq"]);
        assert_eq!(resolved.model, "llama-3.1-8b");
    }

    #[test]
    fn dynamic_route_requires_configured_provider() {
        let err = resolver().resolve("nobody://some-model").unwrap_err();
        assert_eq!(err.model, "nobody://some-model");
    }

    #[test]
    fn thinking_suffix_is_extracted() {
        let resolved = resolver().resolve("gemini-2.5-flash-thinking-1024").unwrap();
        assert_eq!(resolved.model, "gemini-2.5-flash");
        assert_eq!(resolved.providers, vec!["gemini"]);
        assert_eq!(resolved.metadata["thinking_budget"], json!(1024));
    }

    #[test]
    fn non_numeric_thinking_suffix_is_kept() {
        let resolved = resolver().resolve("gemini-2.5-flash-thinking-big").unwrap();
        assert_eq!(resolved.model, "gemini-2.5-flash-thinking-big");
        assert!(resolved.metadata.is_empty());
    }

    #[test]
    fn auto_resolves_via_alias_table() {
        let resolved = resolver().resolve("auto").unwrap();
        assert_eq!(resolved.providers, vec!["codex"]);
        assert_eq!(resolved.model, "gpt-5");
    }

    #[test]
    fn unknown_model_is_an_error() {
        assert!(resolver().resolve("mystery-model").is_err());
    }
}
