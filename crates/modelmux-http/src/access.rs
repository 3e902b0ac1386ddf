use std::collections::HashSet;

use http::{HeaderMap, StatusCode};
use modelmux_core::ErrorRecord;

/// Downstream API-key gate.
///
/// An empty key set leaves the surface open, which is the common local-proxy
/// deployment.
pub struct AccessControl {
    keys: HashSet<String>,
}

impl AccessControl {
    pub fn new(keys: Vec<String>) -> Self {
        Self {
            keys: keys
                .into_iter()
                .map(|key| key.trim().to_string())
                .filter(|key| !key.is_empty())
                .collect(),
        }
    }

    pub fn open() -> Self {
        Self {
            keys: HashSet::new(),
        }
    }

    pub fn authenticate(&self, headers: &HeaderMap) -> Result<(), ErrorRecord> {
        if self.keys.is_empty() {
            return Ok(());
        }
        let Some(presented) = extract_api_key(headers) else {
            return Err(ErrorRecord {
                status: StatusCode::UNAUTHORIZED,
                message: "missing api key".to_string(),
                headers: None,
            });
        };
        if self.keys.contains(presented.trim()) {
            Ok(())
        } else {
            Err(ErrorRecord {
                status: StatusCode::FORBIDDEN,
                message: "invalid api key".to_string(),
                headers: None,
            })
        }
    }
}

/// Accepts the key wherever the four dialects put it.
fn extract_api_key(headers: &HeaderMap) -> Option<String> {
    for name in ["x-api-key", "x-goog-api-key"] {
        if let Some(value) = headers.get(name).and_then(|value| value.to_str().ok()) {
            return Some(value.to_string());
        }
    }
    let auth = headers.get("authorization")?.to_str().ok()?.trim();
    if let Some(token) = auth.strip_prefix("Bearer ") {
        return Some(token.trim().to_string());
    }
    if let Some(token) = auth.strip_prefix("bearer ") {
        return Some(token.trim().to_string());
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(name: &str, value: &str) -> HeaderMap {
        let mut map = HeaderMap::new();
        map.insert(
            http::header::HeaderName::from_bytes(name.as_bytes()).unwrap(),
            value.parse().unwrap(),
        );
        map
    }

    #[test]
    fn open_gate_admits_everyone() {
        assert!(AccessControl::open().authenticate(&HeaderMap::new()).is_ok());
    }

    #[test]
    fn bearer_and_api_key_headers_are_accepted() {
        let gate = AccessControl::new(vec!["sk-local".to_string()]);
        assert!(gate.authenticate(&headers("x-api-key", "sk-local")).is_ok());
        assert!(gate.authenticate(&headers("x-goog-api-key", "sk-local")).is_ok());
        assert!(
            gate.authenticate(&headers("authorization", "Bearer sk-local"))
                .is_ok()
        );
    }

    #[test]
    fn missing_and_wrong_keys_are_distinct() {
        let gate = AccessControl::new(vec!["sk-local".to_string()]);
        let missing = gate.authenticate(&HeaderMap::new()).unwrap_err();
        assert_eq!(missing.status, StatusCode::UNAUTHORIZED);
        let wrong = gate.authenticate(&headers("x-api-key", "nope")).unwrap_err();
        assert_eq!(wrong.status, StatusCode::FORBIDDEN);
    }
}
