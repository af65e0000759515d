//! Backend factories keyed by type name.
//!
//! The runtime configuration names a backend type (`"ollama"`,
//! `"openai_compatible"`) and carries free-form JSON settings. The registry
//! maps the name to a factory that builds the backend.
//!
//! ```ignore
//! let registry = BackendRegistry::with_defaults();
//! let backend = registry.create("ollama", &serde_json::json!({"model": "qwen3:8b"}))?;
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value as JsonValue;

use super::{Backend, BackendError, BackendKind};

/// Builds one type of backend from JSON settings.
pub trait BackendFactory: Send + Sync {
    /// Type name used in configuration.
    fn backend_type(&self) -> &'static str;

    /// Kind of the backends this factory builds.
    fn kind(&self) -> BackendKind;

    /// Build a backend.
    fn create(&self, config: &JsonValue) -> Result<Arc<dyn Backend>, BackendError>;

    /// Check settings without building.
    fn validate_config(&self, config: &JsonValue) -> Result<(), BackendError>;

    /// Settings used when a field is omitted.
    fn default_config(&self) -> JsonValue {
        serde_json::json!({})
    }

    fn description(&self) -> &'static str {
        "LLM backend"
    }
}

/// Registry of backend factories.
#[derive(Default)]
pub struct BackendRegistry {
    factories: BTreeMap<String, Arc<dyn BackendFactory>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory, replacing any with the same type name.
    pub fn register(&mut self, factory: Arc<dyn BackendFactory>) {
        self.factories
            .insert(factory.backend_type().to_string(), factory);
    }

    /// Build a backend from its type name and settings.
    pub fn create(
        &self,
        backend_type: &str,
        config: &JsonValue,
    ) -> Result<Arc<dyn Backend>, BackendError> {
        self.factory(backend_type)?.create(config)
    }

    /// Validate settings for a backend type.
    pub fn validate(&self, backend_type: &str, config: &JsonValue) -> Result<(), BackendError> {
        self.factory(backend_type)?.validate_config(config)
    }

    /// Kind of a registered backend type.
    pub fn kind_of(&self, backend_type: &str) -> Option<BackendKind> {
        self.factories.get(backend_type).map(|f| f.kind())
    }

    pub fn available_types(&self) -> Vec<&str> {
        self.factories.keys().map(|s| s.as_str()).collect()
    }

    pub fn has_backend(&self, backend_type: &str) -> bool {
        self.factories.contains_key(backend_type)
    }

    pub fn default_config(&self, backend_type: &str) -> Option<JsonValue> {
        self.factories.get(backend_type).map(|f| f.default_config())
    }

    fn factory(&self, backend_type: &str) -> Result<&Arc<dyn BackendFactory>, BackendError> {
        self.factories.get(backend_type).ok_or_else(|| {
            BackendError::NotConfigured(format!(
                "Unknown backend type: '{}'. Available: {:?}",
                backend_type,
                self.available_types()
            ))
        })
    }

    /// Registry with every backend compiled into this build.
    pub fn with_defaults() -> Self {
        #[allow(unused_mut)]
        let mut registry = Self::new();
        #[cfg(feature = "local")]
        registry.register(Arc::new(super::OllamaBackendFactory));
        #[cfg(feature = "cloud")]
        registry.register(Arc::new(super::OpenAiCompatibleBackendFactory));
        registry
    }
}

impl std::fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendRegistry")
            .field("backends", &self.available_types())
            .finish()
    }
}
