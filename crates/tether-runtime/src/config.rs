//! Runtime configuration.
//!
//! ```yaml
//! selector:
//!   mode: auto
//!   fallback_to_cloud: true
//!   load_timeout: 30s
//! evaluator:
//!   max_tokens: 512
//! local:
//!   type: ollama
//!   settings:
//!     model: qwen3:8b
//! cloud:
//!   type: openai_compatible
//!   settings:
//!     model: qwen-plus
//! ```
//!
//! Backend sections name a registered backend type and carry its settings
//! as free-form JSON. Secrets belong in the environment, not in this file.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

use crate::backends::{Backend, BackendError, BackendKind, BackendRegistry};
use crate::evaluator::{CriterionEvaluator, EvaluatorConfig};
use crate::executor::ExecutionCore;
use crate::selector::{BackendSelector, SelectionMode, SelectorConfig};

/// Errors loading or applying runtime configuration.
#[derive(Error, Debug)]
pub enum RuntimeConfigError {
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Backend '{backend_type}' in the {section} section: {source}")]
    Backend {
        section: BackendKind,
        backend_type: String,
        source: BackendError,
    },

    #[error("Backend '{backend_type}' is {actual}, but configured as {section}")]
    KindMismatch {
        section: BackendKind,
        backend_type: String,
        actual: BackendKind,
    },
}

/// A backend type plus its settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendSection {
    #[serde(rename = "type")]
    pub backend_type: String,

    #[serde(default)]
    pub settings: JsonValue,
}

impl BackendSection {
    pub fn new(backend_type: impl Into<String>, settings: JsonValue) -> Self {
        Self {
            backend_type: backend_type.into(),
            settings,
        }
    }
}

/// Everything needed to build an [`ExecutionCore`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub selector: SelectorConfig,

    #[serde(default)]
    pub evaluator: EvaluatorConfig,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local: Option<BackendSection>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cloud: Option<BackendSection>,
}

impl Default for RuntimeConfig {
    /// Ollama locally and an OpenAI-compatible cloud, auto mode.
    fn default() -> Self {
        Self {
            selector: SelectorConfig::default(),
            evaluator: EvaluatorConfig::default(),
            local: Some(BackendSection::new("ollama", JsonValue::Null)),
            cloud: Some(BackendSection::new("openai_compatible", JsonValue::Null)),
        }
    }
}

impl RuntimeConfig {
    pub fn from_yaml(yaml: &str) -> Result<Self, RuntimeConfigError> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, RuntimeConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Override the selection mode.
    pub fn with_mode(mut self, mode: SelectionMode) -> Self {
        self.selector.mode = mode;
        self
    }

    /// Build the configured backends.
    ///
    /// A backend whose settings are incomplete (for example a missing API
    /// key) is left out with a warning; selection then treats it as a
    /// failed load. Unknown types and kind mismatches are errors.
    pub fn build_backends(
        &self,
        registry: &BackendRegistry,
    ) -> Result<(Option<Arc<dyn Backend>>, Option<Arc<dyn Backend>>), RuntimeConfigError> {
        let local = Self::build_section(registry, BackendKind::Local, self.local.as_ref())?;
        let cloud = Self::build_section(registry, BackendKind::Cloud, self.cloud.as_ref())?;
        Ok((local, cloud))
    }

    pub fn build_selector(
        &self,
        registry: &BackendRegistry,
    ) -> Result<BackendSelector, RuntimeConfigError> {
        let (local, cloud) = self.build_backends(registry)?;
        Ok(BackendSelector::new(self.selector.clone(), local, cloud))
    }

    /// Build an execution core with every backend compiled into this build.
    pub fn build_core(&self) -> Result<ExecutionCore, RuntimeConfigError> {
        let selector = self.build_selector(&BackendRegistry::with_defaults())?;
        Ok(ExecutionCore::new(Arc::new(selector))
            .with_evaluator(CriterionEvaluator::new(self.evaluator.clone())))
    }

    fn build_section(
        registry: &BackendRegistry,
        section: BackendKind,
        config: Option<&BackendSection>,
    ) -> Result<Option<Arc<dyn Backend>>, RuntimeConfigError> {
        let Some(config) = config else {
            return Ok(None);
        };
        let backend_type = config.backend_type.as_str();

        let actual = registry
            .kind_of(backend_type)
            .ok_or_else(|| RuntimeConfigError::Backend {
                section,
                backend_type: backend_type.to_string(),
                source: BackendError::NotConfigured(format!(
                    "unknown backend type, available: {:?}",
                    registry.available_types()
                )),
            })?;
        if actual != section {
            return Err(RuntimeConfigError::KindMismatch {
                section,
                backend_type: backend_type.to_string(),
                actual,
            });
        }

        match registry.create(backend_type, &config.settings) {
            Ok(backend) => Ok(Some(backend)),
            Err(BackendError::NotConfigured(reason)) => {
                tracing::warn!(
                    section = %section,
                    backend = backend_type,
                    reason = %reason,
                    "Backend not configured, leaving it out"
                );
                Ok(None)
            }
            Err(source) => Err(RuntimeConfigError::Backend {
                section,
                backend_type: backend_type.to_string(),
                source,
            }),
        }
    }
}
