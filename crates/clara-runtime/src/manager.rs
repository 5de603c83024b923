//! Global registry: model → group → process resolution, cross-group
//! exclusion and configuration reload.
//!
//! The manager is an explicit value handed to the HTTP layer, created at
//! startup and shut down on termination. Long-running operations (stops,
//! health waits) never run under the registry lock; the exclusion mutex
//! linearizes exclusive acquisitions and is released before the group
//! takes over.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures_util::future::join_all;
use tokio::sync::{Mutex, Notify, RwLock};
use tokio::time::{Instant, timeout};
use tracing::{info, warn};

use clara_core::{Config, ProxyError};

use crate::group::Group;
use crate::logmux::LogMux;
use crate::process::{AdmissionMode, Process, ProcessState, StopMode, Ticket};
use crate::settings::RuntimeSettings;

/// Listing entry for one configured model.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ModelStatus {
    pub id: String,
    pub state: ProcessState,
    pub group: String,
}

struct Registry {
    config: Config,
    settings: RuntimeSettings,
    groups: BTreeMap<String, Arc<Group>>,
    model_index: BTreeMap<String, String>,
}

pub struct Manager {
    registry: RwLock<Registry>,
    /// Linearizes exclusive acquisitions across groups.
    exclusion: Mutex<()>,
    /// Pinged on every process transition; exclusion waiters re-check on
    /// each ping.
    lifecycle: Arc<Notify>,
    logs: Arc<LogMux>,
}

impl Manager {
    #[must_use]
    pub fn new(config: Config, logs: Arc<LogMux>) -> Arc<Self> {
        let lifecycle = Arc::new(Notify::new());
        let registry = build_registry(config, &logs, &lifecycle, &mut BTreeMap::new());
        Arc::new(Self {
            registry: RwLock::new(registry),
            exclusion: Mutex::new(()),
            lifecycle,
            logs,
        })
    }

    #[must_use]
    pub fn logs(&self) -> Arc<LogMux> {
        Arc::clone(&self.logs)
    }

    /// Resolve `model`, enforce cross-group exclusion, and admit the
    /// request through the owning group.
    ///
    /// # Errors
    ///
    /// `NotFound` for unknown models, `Conflict` when an exclusive peer
    /// group does not drain within the exclusion timeout, and whatever
    /// the group's admission surfaces.
    pub async fn acquire(&self, model: &str, mode: AdmissionMode) -> Result<Ticket, ProxyError> {
        let (group, settings) = {
            let registry = self.registry.read().await;
            let group_id = registry
                .model_index
                .get(model)
                .ok_or_else(|| ProxyError::NotFound(model.to_string()))?;
            let group = registry
                .groups
                .get(group_id)
                .ok_or_else(|| ProxyError::NotFound(model.to_string()))?;
            (Arc::clone(group), registry.settings)
        };

        self.enforce_exclusion(&group, settings).await?;
        group.acquire(model, mode).await
    }

    /// Current process for `model`, if configured.
    pub async fn find_process(&self, model: &str) -> Option<Process> {
        let registry = self.registry.read().await;
        let group_id = registry.model_index.get(model)?;
        registry.groups.get(group_id)?.member(model).cloned()
    }

    /// Group by id. Mostly useful for tests and introspection.
    pub async fn find_group(&self, group: &str) -> Option<Arc<Group>> {
        let registry = self.registry.read().await;
        registry.groups.get(group).map(Arc::clone)
    }

    /// All non-unlisted models with their current state.
    pub async fn list_models(&self) -> Vec<ModelStatus> {
        let registry = self.registry.read().await;
        let mut out = Vec::new();
        for group in registry.groups.values() {
            for (id, process) in group.members() {
                if registry
                    .config
                    .models
                    .get(id)
                    .is_some_and(|m| m.unlisted)
                {
                    continue;
                }
                out.push(ModelStatus {
                    id: id.clone(),
                    state: process.state(),
                    group: group.id().to_string(),
                });
            }
        }
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    /// Stop every process in every group in parallel. Processes stay
    /// registered and restart on the next request ("soft restart").
    pub async fn unload_all(&self) {
        let groups: Vec<Arc<Group>> = {
            let registry = self.registry.read().await;
            registry.groups.values().cloned().collect()
        };
        info!(groups = groups.len(), "unloading all models");
        join_all(groups.iter().map(|g| g.stop_all(StopMode::Graceful))).await;
    }

    /// Terminal stop of everything. The manager accepts no further
    /// requests for the shut-down processes.
    pub async fn shutdown_all(&self) {
        let groups: Vec<Arc<Group>> = {
            let registry = self.registry.read().await;
            registry.groups.values().cloned().collect()
        };
        info!("shutting down all models");
        join_all(groups.iter().map(|g| g.shutdown())).await;
    }

    /// Replace the configuration.
    ///
    /// Models whose definition and port assignment are unchanged keep
    /// their running process; removed or changed models are shut down and
    /// (for changed ones) recreated. The registry write lock makes the
    /// apply atomic: requests either see the old registry or the new one.
    pub async fn reload(&self, new_config: Config) {
        let mut registry = self.registry.write().await;
        let new_settings = RuntimeSettings::from_config(&new_config);
        let new_ports = port_assignments(&new_config);

        let mut reuse: BTreeMap<String, Process> = BTreeMap::new();
        let mut retire: Vec<Process> = Vec::new();
        for group in registry.groups.values() {
            for (id, process) in group.members() {
                let unchanged = registry.settings == new_settings
                    && new_config.models.get(id) == Some(process.config())
                    && new_ports.get(id) == Some(&process.assigned_port());
                if unchanged {
                    reuse.insert(id.clone(), process.clone());
                } else {
                    retire.push(process.clone());
                }
            }
        }

        info!(
            reused = reuse.len(),
            retired = retire.len(),
            "applying new configuration"
        );
        if !retire.is_empty() {
            join_all(retire.iter().map(|p| p.shutdown())).await;
        }

        *registry = build_registry(new_config, &self.logs, &self.lifecycle, &mut reuse);

        // Anything left in the reuse map vanished from the new document
        // between diff and rebuild; that would be a logic error.
        for (id, process) in reuse {
            warn!(model = %id, "process not placed during reload, shutting it down");
            process.shutdown().await;
        }
    }

    async fn enforce_exclusion(
        &self,
        group: &Arc<Group>,
        settings: RuntimeSettings,
    ) -> Result<(), ProxyError> {
        if group.config().exclusive {
            let _guard = self.exclusion.lock().await;
            let victims: Vec<Arc<Group>> = {
                let registry = self.registry.read().await;
                registry
                    .groups
                    .values()
                    .filter(|g| {
                        g.id() != group.id() && !g.config().persistent && g.has_active_member()
                    })
                    .cloned()
                    .collect()
            };
            if !victims.is_empty() {
                info!(group = %group.id(), victims = victims.len(), "exclusive group evicting peers");
                join_all(victims.iter().map(|g| g.stop_all(StopMode::Graceful))).await;
            }
            return Ok(());
        }

        // Persistent groups coexist with exclusive peers.
        if group.config().persistent {
            return Ok(());
        }

        // A non-exclusive target defers to any active exclusive group
        // until it drains or the exclusion timeout expires.
        let deadline = Instant::now() + settings.exclusion_timeout;
        loop {
            let notified = self.lifecycle.notified();
            let blocked_by = {
                let registry = self.registry.read().await;
                registry
                    .groups
                    .values()
                    .find(|g| {
                        g.id() != group.id() && g.config().exclusive && g.has_active_member()
                    })
                    .map(|g| g.id().to_string())
            };
            let Some(holder) = blocked_by else {
                return Ok(());
            };
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                warn!(group = %group.id(), %holder, "exclusion wait timed out");
                return Err(ProxyError::Conflict);
            }
            let _ = timeout(remaining, notified).await;
        }
    }
}

impl std::fmt::Debug for Manager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Manager").finish_non_exhaustive()
    }
}

fn build_registry(
    config: Config,
    logs: &Arc<LogMux>,
    lifecycle: &Arc<Notify>,
    reuse: &mut BTreeMap<String, Process>,
) -> Registry {
    let settings = RuntimeSettings::from_config(&config);
    let mut groups = BTreeMap::new();
    for resolved in config.resolved_groups() {
        let member_configs: Vec<_> = resolved
            .config
            .members
            .iter()
            .filter_map(|id| config.models.get(id).map(|m| (id.clone(), m.clone())))
            .collect();
        let group = Group::new(resolved, member_configs, settings, logs, lifecycle, reuse);
        groups.insert(group.id().to_string(), Arc::new(group));
    }
    Registry {
        model_index: config.model_index(),
        settings,
        config,
        groups,
    }
}

/// Stable model → port assignment implied by a document.
fn port_assignments(config: &Config) -> BTreeMap<String, u16> {
    let mut out = BTreeMap::new();
    for resolved in config.resolved_groups() {
        for (index, member) in resolved.config.members.iter().enumerate() {
            let port = resolved
                .base_port
                .saturating_add(u16::try_from(index).unwrap_or(u16::MAX));
            out.insert(member.clone(), port);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager_from(yaml: &str) -> Arc<Manager> {
        let config = Config::from_yaml(yaml).unwrap();
        Manager::new(config, Arc::new(LogMux::new()))
    }

    #[tokio::test]
    async fn unknown_model_is_not_found() {
        let manager = manager_from(
            r#"
models:
  a:
    cmdTemplate: "sleep 30"
    proxyURL: "http://127.0.0.1:${PORT}"
    checkEndpoint: none
"#,
        );
        let err = manager
            .acquire("ghost", AdmissionMode::Queue)
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::NotFound(_)));
    }

    #[tokio::test]
    async fn list_models_hides_unlisted() {
        let manager = manager_from(
            r#"
models:
  visible:
    cmdTemplate: "sleep 30"
    proxyURL: "http://127.0.0.1:${PORT}"
    checkEndpoint: none
  hidden:
    cmdTemplate: "sleep 30"
    proxyURL: "http://127.0.0.1:${PORT}"
    checkEndpoint: none
    unlisted: true
"#,
        );
        let listed = manager.list_models().await;
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, "visible");
        assert_eq!(listed[0].state, ProcessState::Stopped);
    }

    #[tokio::test]
    async fn reload_keeps_unchanged_models() {
        let yaml = r#"
startPort: 24300
models:
  keep:
    cmdTemplate: "sleep 30"
    proxyURL: "http://127.0.0.1:${PORT}"
    checkEndpoint: none
  change:
    cmdTemplate: "sleep 30"
    proxyURL: "http://127.0.0.1:${PORT}"
    checkEndpoint: none
"#;
        let manager = manager_from(yaml);
        let keep_before = manager.find_process("keep").await.unwrap();
        let change_before = manager.find_process("change").await.unwrap();

        let new_yaml = r#"
startPort: 24300
models:
  keep:
    cmdTemplate: "sleep 30"
    proxyURL: "http://127.0.0.1:${PORT}"
    checkEndpoint: none
  change:
    cmdTemplate: "sleep 60"
    proxyURL: "http://127.0.0.1:${PORT}"
    checkEndpoint: none
"#;
        manager.reload(Config::from_yaml(new_yaml).unwrap()).await;

        let keep_after = manager.find_process("keep").await.unwrap();
        let change_after = manager.find_process("change").await.unwrap();
        assert!(keep_before.ptr_eq(&keep_after));
        assert!(!change_before.ptr_eq(&change_after));
        assert_eq!(change_before.state(), ProcessState::Shutdown);
    }

    #[tokio::test]
    async fn reload_drops_removed_models() {
        let manager = manager_from(
            r#"
models:
  stays:
    cmdTemplate: "sleep 30"
    proxyURL: "http://127.0.0.1:${PORT}"
    checkEndpoint: none
  goes:
    cmdTemplate: "sleep 30"
    proxyURL: "http://127.0.0.1:${PORT}"
    checkEndpoint: none
"#,
        );
        let goes = manager.find_process("goes").await.unwrap();

        manager
            .reload(
                Config::from_yaml(
                    r#"
models:
  stays:
    cmdTemplate: "sleep 30"
    proxyURL: "http://127.0.0.1:${PORT}"
    checkEndpoint: none
"#,
                )
                .unwrap(),
            )
            .await;

        assert!(manager.find_process("goes").await.is_none());
        assert_eq!(goes.state(), ProcessState::Shutdown);
        let err = manager
            .acquire("goes", AdmissionMode::Queue)
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::NotFound(_)));
    }
}
