//! Backend selection with local/cloud failover.
//!
//! The selector owns at most one local and one cloud backend and decides
//! which one serves generations. The policy is the pure table in
//! [`next_step`]; [`BackendSelector`] drives it against real loads.
//!
//! # Locking
//! The active backend sits behind a `tokio::sync::RwLock`. Callers hold a
//! [`BackendLease`] (a read guard) for the duration of one attempt.
//! Selection, [`BackendSelector::switch_mode`] and
//! [`BackendSelector::invalidate`] take the write side, so a mode switch
//! waits for in-flight leases to drop.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{OwnedRwLockReadGuard, RwLock};

use crate::backends::{Backend, BackendKind};

/// Which backends the selector may use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SelectionMode {
    Local,
    Cloud,
    Auto,
}

impl fmt::Display for SelectionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SelectionMode::Local => write!(f, "local"),
            SelectionMode::Cloud => write!(f, "cloud"),
            SelectionMode::Auto => write!(f, "auto"),
        }
    }
}

impl FromStr for SelectionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(SelectionMode::Local),
            "cloud" => Ok(SelectionMode::Cloud),
            "auto" => Ok(SelectionMode::Auto),
            other => Err(format!(
                "unknown mode '{}', expected local, cloud or auto",
                other
            )),
        }
    }
}

/// Selector settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectorConfig {
    #[serde(default = "default_mode")]
    pub mode: SelectionMode,

    /// In auto mode, try cloud when local fails to load
    #[serde(default = "default_true")]
    pub fallback_to_cloud: bool,

    #[serde(default = "default_load_timeout", with = "tether_core::duration")]
    pub load_timeout: Duration,

    #[serde(default = "default_health_timeout", with = "tether_core::duration")]
    pub health_timeout: Duration,

    /// Re-check health before each lease and fail over when unhealthy
    #[serde(default = "default_true")]
    pub health_gate: bool,
}

fn default_mode() -> SelectionMode {
    SelectionMode::Auto
}

fn default_true() -> bool {
    true
}

fn default_load_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_health_timeout() -> Duration {
    Duration::from_secs(10)
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            mode: default_mode(),
            fallback_to_cloud: true,
            load_timeout: default_load_timeout(),
            health_timeout: default_health_timeout(),
            health_gate: true,
        }
    }
}

/// Result of one load attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    Loaded,
    Failed,
}

/// What the selector does next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionStep {
    /// Load this backend
    Try(BackendKind),
    /// Make this backend active
    Select(BackendKind),
    /// Give up
    Fail,
}

/// Selection policy as a decision table.
///
/// `last` is the most recent load and its outcome, `None` before the first.
pub fn next_step(
    mode: SelectionMode,
    fallback_to_cloud: bool,
    last: Option<(BackendKind, LoadOutcome)>,
) -> SelectionStep {
    match (mode, last) {
        (_, Some((kind, LoadOutcome::Loaded))) => SelectionStep::Select(kind),
        (SelectionMode::Local | SelectionMode::Auto, None) => {
            SelectionStep::Try(BackendKind::Local)
        }
        (SelectionMode::Cloud, None) => SelectionStep::Try(BackendKind::Cloud),
        (SelectionMode::Auto, Some((BackendKind::Local, LoadOutcome::Failed)))
            if fallback_to_cloud =>
        {
            SelectionStep::Try(BackendKind::Cloud)
        }
        (_, Some((_, LoadOutcome::Failed))) => SelectionStep::Fail,
    }
}

/// Lifecycle of a backend as seen by the selector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum LoadState {
    Unloaded,
    Loading,
    Ready,
    Failed(String),
}

/// Snapshot of one configured backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendDescriptor {
    pub kind: BackendKind,
    pub name: String,
    pub endpoint: String,
    pub model: String,
    pub state: LoadState,
}

/// Errors from the selector.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SelectorError {
    #[error("No backend available in {mode} mode: {}", .reasons.join("; "))]
    NoBackendAvailable {
        mode: SelectionMode,
        reasons: Vec<String>,
    },
}

struct SelectorState {
    mode: SelectionMode,
    active: Option<BackendKind>,
}

/// Shared access to the active backend for one attempt.
///
/// Holding a lease blocks mode switches and invalidation.
pub struct BackendLease {
    _guard: OwnedRwLockReadGuard<SelectorState>,
    backend: Arc<dyn Backend>,
}

impl BackendLease {
    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    pub fn kind(&self) -> BackendKind {
        self.backend.kind()
    }
}

impl std::ops::Deref for BackendLease {
    type Target = dyn Backend;

    fn deref(&self) -> &Self::Target {
        self.backend.as_ref()
    }
}

impl fmt::Debug for BackendLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendLease")
            .field("backend", &self.backend.name())
            .field("kind", &self.backend.kind())
            .finish()
    }
}

/// Chooses and guards the backend that serves generations.
pub struct BackendSelector {
    config: SelectorConfig,
    backends: BTreeMap<BackendKind, Arc<dyn Backend>>,
    state: Arc<RwLock<SelectorState>>,
    descriptors: Mutex<BTreeMap<BackendKind, BackendDescriptor>>,
}

impl BackendSelector {
    pub fn new(
        config: SelectorConfig,
        local: Option<Arc<dyn Backend>>,
        cloud: Option<Arc<dyn Backend>>,
    ) -> Self {
        let mut backends = BTreeMap::new();
        if let Some(local) = local {
            backends.insert(BackendKind::Local, local);
        }
        if let Some(cloud) = cloud {
            backends.insert(BackendKind::Cloud, cloud);
        }

        let descriptors = backends
            .iter()
            .map(|(kind, backend)| {
                (
                    *kind,
                    BackendDescriptor {
                        kind: *kind,
                        name: backend.name().to_string(),
                        endpoint: backend.endpoint().to_string(),
                        model: backend.model().to_string(),
                        state: LoadState::Unloaded,
                    },
                )
            })
            .collect();

        Self {
            state: Arc::new(RwLock::new(SelectorState {
                mode: config.mode,
                active: None,
            })),
            config,
            backends,
            descriptors: Mutex::new(descriptors),
        }
    }

    pub fn config(&self) -> &SelectorConfig {
        &self.config
    }

    pub async fn current_mode(&self) -> SelectionMode {
        self.state.read().await.mode
    }

    /// Kind of the active backend, if one has been selected.
    pub async fn active_kind(&self) -> Option<BackendKind> {
        self.state.read().await.active
    }

    /// Snapshot of every configured backend.
    pub fn descriptors(&self) -> Vec<BackendDescriptor> {
        self.descriptors.lock().values().cloned().collect()
    }

    /// Descriptor and health of every configured backend.
    pub async fn health(&self) -> Vec<(BackendDescriptor, bool)> {
        let mut report = Vec::with_capacity(self.backends.len());
        for descriptor in self.descriptors() {
            let healthy = match self.backends.get(&descriptor.kind) {
                Some(backend) => self.is_healthy(backend).await,
                None => false,
            };
            report.push((descriptor, healthy));
        }
        report
    }

    /// Lease the active backend, selecting one first if needed.
    pub async fn acquire(&self) -> Result<BackendLease, SelectorError> {
        let mut unhealthy = None;
        {
            let guard = self.state.clone().read_owned().await;
            if let Some(kind) = guard.active {
                if let Some(backend) = self.backends.get(&kind).cloned() {
                    if !self.config.health_gate || self.is_healthy(&backend).await {
                        return Ok(BackendLease {
                            _guard: guard,
                            backend,
                        });
                    }
                    unhealthy = Some(kind);
                }
            }
        }

        let mut guard = self.state.clone().write_owned().await;
        if let Some(kind) = guard.active {
            if unhealthy == Some(kind) {
                tracing::warn!(backend = %kind, "Active backend failed health check, reselecting");
                self.teardown(kind).await;
                guard.active = None;
            }
        }

        let kind = match guard.active {
            Some(kind) => kind,
            None => {
                let kind = self.select(guard.mode).await?;
                guard.active = Some(kind);
                kind
            }
        };

        let backend = self
            .backends
            .get(&kind)
            .cloned()
            .ok_or_else(|| SelectorError::NoBackendAvailable {
                mode: guard.mode,
                reasons: vec![format!("{}: not configured", kind)],
            })?;

        Ok(BackendLease {
            _guard: guard.downgrade(),
            backend,
        })
    }

    /// Change mode, unload the current backend and select again.
    ///
    /// Waits for outstanding leases.
    pub async fn switch_mode(&self, mode: SelectionMode) -> Result<BackendKind, SelectorError> {
        let mut guard = self.state.write().await;
        if let Some(kind) = guard.active.take() {
            self.teardown(kind).await;
        }
        for descriptor in self.descriptors.lock().values_mut() {
            descriptor.state = LoadState::Unloaded;
        }

        tracing::info!(from = %guard.mode, to = %mode, "Switching backend mode");
        guard.mode = mode;
        let kind = self.select(mode).await?;
        guard.active = Some(kind);
        Ok(kind)
    }

    /// Tear down the active backend so the next lease reselects.
    ///
    /// Must not be called while holding a lease.
    pub async fn invalidate(&self) {
        let mut guard = self.state.write().await;
        if let Some(kind) = guard.active.take() {
            tracing::warn!(backend = %kind, "Invalidating active backend");
            self.teardown(kind).await;
        }
    }

    /// Unload the active backend.
    pub async fn shutdown(&self) {
        let mut guard = self.state.write().await;
        if let Some(kind) = guard.active.take() {
            self.teardown(kind).await;
        }
    }

    async fn select(&self, mode: SelectionMode) -> Result<BackendKind, SelectorError> {
        let mut last = None;
        let mut reasons = Vec::new();
        loop {
            match next_step(mode, self.config.fallback_to_cloud, last) {
                SelectionStep::Select(kind) => {
                    tracing::info!(mode = %mode, backend = %kind, "Backend selected");
                    return Ok(kind);
                }
                SelectionStep::Try(kind) => {
                    let outcome = match self.load(kind).await {
                        Ok(()) => LoadOutcome::Loaded,
                        Err(reason) => {
                            tracing::warn!(mode = %mode, backend = %kind, reason = %reason, "Backend failed to load");
                            reasons.push(format!("{}: {}", kind, reason));
                            LoadOutcome::Failed
                        }
                    };
                    last = Some((kind, outcome));
                }
                SelectionStep::Fail => {
                    return Err(SelectorError::NoBackendAvailable { mode, reasons });
                }
            }
        }
    }

    async fn load(&self, kind: BackendKind) -> Result<(), String> {
        let Some(backend) = self.backends.get(&kind) else {
            return Err("not configured".to_string());
        };

        self.set_state(kind, LoadState::Loading);
        let result = match tokio::time::timeout(self.config.load_timeout, backend.load()).await {
            Ok(Ok(true)) => Ok(()),
            Ok(Ok(false)) => Err("load reported not ready".to_string()),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!(
                "load timed out after {:?}",
                self.config.load_timeout
            )),
        };

        match &result {
            Ok(()) => self.set_state(kind, LoadState::Ready),
            Err(reason) => self.set_state(kind, LoadState::Failed(reason.clone())),
        }
        result
    }

    async fn teardown(&self, kind: BackendKind) {
        if let Some(backend) = self.backends.get(&kind) {
            backend.unload().await;
        }
        self.set_state(kind, LoadState::Unloaded);
    }

    async fn is_healthy(&self, backend: &Arc<dyn Backend>) -> bool {
        tokio::time::timeout(self.config.health_timeout, backend.health_check())
            .await
            .unwrap_or(false)
    }

    fn set_state(&self, kind: BackendKind, state: LoadState) {
        if let Some(descriptor) = self.descriptors.lock().get_mut(&kind) {
            descriptor.state = state;
        }
    }
}

impl fmt::Debug for BackendSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendSelector")
            .field("config", &self.config)
            .field("descriptors", &self.descriptors())
            .finish()
    }
}
