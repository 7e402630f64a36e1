// SPDX-License-Identifier: MIT OR Apache-2.0
//! Typed registry of named [`BackendAdapter`] implementations, keyed by
//! `"{persona}:{stage}"` (writer/auditor/stamp) so the supervisor can look
//! up the right adapter for each leg of a role's loop.

use std::collections::HashMap;
use std::sync::Arc;

use pe_backend::BackendAdapter;
use pe_error::{ErrorCode, PeError};

/// A typed registry of named [`BackendAdapter`] implementations.
#[derive(Default, Clone)]
pub struct BackendRegistry {
    backends: HashMap<String, Arc<dyn BackendAdapter>>,
}

impl BackendRegistry {
    /// Register a backend under the given name, replacing any previous entry.
    pub fn register(&mut self, name: impl Into<String>, backend: impl BackendAdapter + 'static) {
        self.backends.insert(name.into(), Arc::new(backend));
    }

    /// Look up a backend by name, erroring with [`ErrorCode::Internal`] if
    /// it isn't registered — an unregistered writer/auditor/stamp backend
    /// is a wiring mistake, not a runtime condition callers should branch on.
    pub fn get(&self, name: &str) -> Result<&dyn BackendAdapter, PeError> {
        self.backends
            .get(name)
            .map(|b| &**b)
            .ok_or_else(|| PeError::new(ErrorCode::Internal, format!("no backend registered under {name:?}")))
    }

    /// Return a sorted list of registered backend names.
    #[must_use]
    pub fn list(&self) -> Vec<&str> {
        let mut v: Vec<&str> = self.backends.keys().map(String::as_str).collect();
        v.sort_unstable();
        v
    }

    /// Check whether a backend with the given name is registered.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.backends.contains_key(name)
    }

    /// Remove a backend by name.
    pub fn remove(&mut self, name: &str) -> Option<Arc<dyn BackendAdapter>> {
        self.backends.remove(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use pe_backend::{BackendCall, CallOptions, Usage};
    use serde_json::Value;

    struct Echo;

    #[async_trait]
    impl BackendAdapter for Echo {
        fn name(&self) -> &str {
            "echo"
        }
        async fn call(&self, _persona: &str, payload: &Value, _options: &CallOptions) -> Result<BackendCall, PeError> {
            Ok(BackendCall {
                text: payload.to_string(),
                usage: Usage::default(),
                latency_ms: 0,
            })
        }
    }

    #[test]
    fn get_missing_backend_is_internal_error() {
        let registry = BackendRegistry::default();
        let err = match registry.get("coder:writer") {
            Err(e) => e,
            Ok(_) => panic!("expected an error"),
        };
        assert_eq!(err.code, ErrorCode::Internal);
    }

    #[test]
    fn register_then_get_round_trips() {
        let mut registry = BackendRegistry::default();
        registry.register("coder:writer", Echo);
        assert!(registry.contains("coder:writer"));
        assert_eq!(registry.list(), vec!["coder:writer"]);
        assert!(registry.get("coder:writer").is_ok());
    }

    #[test]
    fn remove_drops_the_entry() {
        let mut registry = BackendRegistry::default();
        registry.register("coder:writer", Echo);
        assert!(registry.remove("coder:writer").is_some());
        assert!(!registry.contains("coder:writer"));
    }
}
