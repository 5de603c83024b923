//! A set of processes sharing a port range and a swap policy.
//!
//! Members get stable ports (`base_port + index` in declared order) for
//! the group's lifetime. In a swap group the swap mutex serializes the
//! stop-sibling / start-target sequence, so at most one member is ever
//! Starting or Ready. The mutex is released once the target is admitted;
//! request bytes are copied outside it.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures_util::future::join_all;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info};

use clara_core::{GroupConfig, ModelConfig, ProxyError, ResolvedGroup};

use crate::logmux::LogMux;
use crate::process::{AdmissionMode, Process, StopMode, Ticket};
use crate::settings::RuntimeSettings;

pub struct Group {
    id: String,
    config: GroupConfig,
    /// Members in declared order; order fixes the port assignment.
    processes: Vec<(String, Process)>,
    /// Swap decisions: which member served the previous request.
    last_used: Mutex<Option<String>>,
}

impl Group {
    /// Build a group from a resolved definition.
    ///
    /// `member_configs` must follow the declared member order. Processes
    /// found in `reuse` (keyed by model id) are carried over instead of
    /// being recreated; used by config reload.
    #[must_use]
    pub fn new(
        resolved: ResolvedGroup,
        member_configs: Vec<(String, ModelConfig)>,
        settings: RuntimeSettings,
        logs: &Arc<LogMux>,
        lifecycle: &Arc<Notify>,
        reuse: &mut BTreeMap<String, Process>,
    ) -> Self {
        let mut processes = Vec::with_capacity(member_configs.len());
        for (index, (id, config)) in member_configs.into_iter().enumerate() {
            let port = resolved
                .base_port
                .saturating_add(u16::try_from(index).unwrap_or(u16::MAX));
            let process = reuse.remove(&id).unwrap_or_else(|| {
                Process::new(
                    id.clone(),
                    config,
                    port,
                    settings,
                    Arc::clone(logs),
                    Arc::clone(lifecycle),
                )
            });
            processes.push((id, process));
        }
        Self {
            id: resolved.id,
            config: resolved.config,
            processes,
            last_used: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn config(&self) -> &GroupConfig {
        &self.config
    }

    #[must_use]
    pub fn member(&self, model: &str) -> Option<&Process> {
        self.processes
            .iter()
            .find(|(id, _)| id == model)
            .map(|(_, p)| p)
    }

    pub fn members(&self) -> impl Iterator<Item = (&String, &Process)> {
        self.processes.iter().map(|(id, p)| (id, p))
    }

    /// True when any member is Starting or Ready.
    #[must_use]
    pub fn has_active_member(&self) -> bool {
        self.processes.iter().any(|(_, p)| p.state().is_active())
    }

    /// Admit a request for `model`, swapping the active member first when
    /// the policy demands it.
    ///
    /// # Errors
    ///
    /// `NotFound` for non-members; otherwise whatever the member's
    /// [`Process::acquire`] surfaces.
    pub async fn acquire(&self, model: &str, mode: AdmissionMode) -> Result<Ticket, ProxyError> {
        let process = self
            .member(model)
            .ok_or_else(|| ProxyError::NotFound(model.to_string()))?;

        if !self.config.swap {
            return process.acquire(mode).await;
        }

        let mut last_used = self.last_used.lock().await;
        if last_used.as_deref() != Some(model) {
            // The previous member must be fully stopped before the new
            // one starts; stop() on an already-stopped member is a no-op.
            let stops: Vec<_> = self
                .processes
                .iter()
                .filter(|(id, _)| id != model)
                .map(|(_, p)| p.stop(StopMode::Graceful))
                .collect();
            if !stops.is_empty() {
                info!(group = %self.id, model, "swapping active model");
                join_all(stops).await;
            }
        }

        let ticket = process.acquire(mode).await?;
        *last_used = Some(model.to_string());
        debug!(group = %self.id, model, "swap slot held by {model}");
        Ok(ticket)
    }

    /// Member that served the previous request, if any.
    pub async fn last_used(&self) -> Option<String> {
        self.last_used.lock().await.clone()
    }

    /// Stop every member in parallel.
    pub async fn stop_all(&self, mode: StopMode) {
        join_all(self.processes.iter().map(|(_, p)| p.stop(mode))).await;
    }

    /// Terminal stop of every member in parallel.
    pub async fn shutdown(&self) {
        self.stop_all(StopMode::Shutdown).await;
    }
}

impl std::fmt::Debug for Group {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Group")
            .field("id", &self.id)
            .field("members", &self.processes.len())
            .field("swap", &self.config.swap)
            .field("exclusive", &self.config.exclusive)
            .finish_non_exhaustive()
    }
}
