//! Configuration document for the model multiplexer.
//!
//! The on-disk format is YAML. Top-level keys: `healthCheckTimeout`,
//! `startPort`, `stopTimeout`, `exclusionTimeout`, `logLevel`, `macros`,
//! `models` and `groups`. `Config::load` parses, validates and expands
//! macros in one step so the rest of the system only ever sees a
//! well-formed document.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::macros::{expand_template, resolve_macros};

/// Default seconds to wait for a subprocess to pass its health check.
pub const DEFAULT_HEALTH_CHECK_TIMEOUT: u64 = 120;

/// Default first TCP port handed to model subprocesses.
pub const DEFAULT_START_PORT: u16 = 8100;

/// Default seconds allowed for a graceful stop before the hard kill.
pub const DEFAULT_STOP_TIMEOUT: u64 = 30;

/// Default seconds a request waits for an exclusive peer group to drain.
pub const DEFAULT_EXCLUSION_TIMEOUT: u64 = 120;

/// Sentinel `checkEndpoint` value that disables health probing.
pub const CHECK_ENDPOINT_NONE: &str = "none";

/// A single model entry. Immutable once loaded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ModelConfig {
    /// Command line used to spawn the subprocess. May reference macros and
    /// must reference `${PORT}` somewhere for the server to be reachable.
    pub cmd_template: String,

    /// Upstream base URL. Must contain `${PORT}`.
    #[serde(rename = "proxyURL")]
    pub proxy_url: String,

    /// Relative path probed for readiness. `none` disables probing.
    #[serde(default = "default_check_endpoint")]
    pub check_endpoint: String,

    /// Idle seconds before auto-stop. `0` disables eviction.
    #[serde(default)]
    pub ttl: u64,

    /// Hide from model listings.
    #[serde(default)]
    pub unlisted: bool,

    /// Maximum in-flight requests. `0` means unlimited.
    #[serde(default)]
    pub concurrency_limit: usize,

    /// Seconds to wait after spawn before declaring readiness when
    /// `checkEndpoint` is `none`.
    #[serde(default)]
    pub start_delay: u64,

    /// Extra environment variables for the subprocess.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

fn default_check_endpoint() -> String {
    "/health".to_string()
}

impl ModelConfig {
    /// True when readiness probing is disabled for this model.
    #[must_use]
    pub fn probe_disabled(&self) -> bool {
        self.check_endpoint == CHECK_ENDPOINT_NONE
    }
}

/// A set of models sharing a port range and a swap/exclusivity policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct GroupConfig {
    /// Ordered member model ids. Order fixes the port assignment.
    pub members: Vec<String>,

    /// Starting any member stops the previously active member.
    #[serde(default)]
    pub swap: bool,

    /// Activating this group stops all non-persistent peers globally.
    #[serde(default)]
    pub exclusive: bool,

    /// Never stopped by an exclusive sibling.
    #[serde(default)]
    pub persistent: bool,

    /// First TCP port for this group; members increment from it.
    /// Assigned from the global progression when absent.
    #[serde(default)]
    pub start_port: Option<u16>,
}

/// A group after validation, with its port base fixed.
///
/// Ungrouped models are wrapped in a synthesized singleton group whose id
/// equals the model id, so the runtime deals with groups uniformly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedGroup {
    pub id: String,
    pub config: GroupConfig,
    /// First port assigned to this group's members.
    pub base_port: u16,
}

/// The whole configuration document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Config {
    /// Seconds to wait for a started subprocess to become healthy.
    #[serde(default = "default_health_check_timeout")]
    pub health_check_timeout: u64,

    /// First TCP port assigned to groups without an explicit `startPort`.
    #[serde(default = "default_start_port")]
    pub start_port: u16,

    /// Seconds allowed for a graceful stop before the hard kill.
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout: u64,

    /// Seconds a request waits for an exclusive peer group to drain.
    #[serde(default = "default_exclusion_timeout")]
    pub exclusion_timeout: u64,

    /// Default tracing filter directive (e.g. `info`, `debug`).
    #[serde(default)]
    pub log_level: Option<String>,

    /// Named strings expanded in command templates.
    #[serde(default)]
    pub macros: BTreeMap<String, String>,

    /// Model id to model definition.
    #[serde(default)]
    pub models: BTreeMap<String, ModelConfig>,

    /// Group id to group definition.
    #[serde(default)]
    pub groups: BTreeMap<String, GroupConfig>,
}

fn default_health_check_timeout() -> u64 {
    DEFAULT_HEALTH_CHECK_TIMEOUT
}

fn default_start_port() -> u16 {
    DEFAULT_START_PORT
}

fn default_stop_timeout() -> u64 {
    DEFAULT_STOP_TIMEOUT
}

fn default_exclusion_timeout() -> u64 {
    DEFAULT_EXCLUSION_TIMEOUT
}

impl Config {
    /// Load and validate a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml(&text)
    }

    /// Parse and validate a YAML document.
    pub fn from_yaml(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(text)?;
        config.validate()
    }

    /// Validate the document and expand macros into templates.
    ///
    /// After validation every `cmdTemplate` and `proxyURL` contains only
    /// the `${PORT}` placeholder; all macro references are gone.
    ///
    /// # Errors
    ///
    /// Rejects macro cycles, unknown macros, empty command templates,
    /// `proxyURL` without `${PORT}`, group members without a model
    /// definition, and models claimed by more than one group.
    pub fn validate(mut self) -> Result<Self, ConfigError> {
        let resolved = resolve_macros(&self.macros)?;

        for (id, model) in &mut self.models {
            model.cmd_template = expand_template(
                &model.cmd_template,
                &resolved,
                &format!("model {id} cmdTemplate"),
            )?;
            model.proxy_url = expand_template(
                &model.proxy_url,
                &resolved,
                &format!("model {id} proxyURL"),
            )?;

            if model.cmd_template.trim().is_empty() {
                return Err(ConfigError::InvalidModel {
                    model: id.clone(),
                    reason: "cmdTemplate is empty".to_string(),
                });
            }
            if !model.proxy_url.contains("${PORT}") {
                return Err(ConfigError::InvalidModel {
                    model: id.clone(),
                    reason: "proxyURL does not contain ${PORT}".to_string(),
                });
            }
            if !model.check_endpoint.starts_with('/') && !model.probe_disabled() {
                return Err(ConfigError::InvalidModel {
                    model: id.clone(),
                    reason: format!(
                        "checkEndpoint must start with '/' or be '{CHECK_ENDPOINT_NONE}'"
                    ),
                });
            }
        }

        let mut membership: BTreeMap<&str, &str> = BTreeMap::new();
        for (gid, group) in &self.groups {
            if group.members.is_empty() {
                return Err(ConfigError::InvalidGroup {
                    group: gid.clone(),
                    reason: "members is empty".to_string(),
                });
            }
            for member in &group.members {
                if !self.models.contains_key(member) {
                    return Err(ConfigError::InvalidGroup {
                        group: gid.clone(),
                        reason: format!("member {member} has no model definition"),
                    });
                }
                if let Some(first) = membership.insert(member, gid) {
                    return Err(ConfigError::DuplicateMembership {
                        model: member.clone(),
                        first: first.to_string(),
                        second: gid.clone(),
                    });
                }
            }
        }

        Ok(self)
    }

    /// All groups with port bases fixed, synthesized singletons included.
    ///
    /// Declared groups come first in declaration (map) order, then one
    /// singleton group per ungrouped model. Groups without an explicit
    /// `startPort` draw consecutive ranges from the global `startPort`
    /// progression, so the assignment is stable for a given document.
    #[must_use]
    pub fn resolved_groups(&self) -> Vec<ResolvedGroup> {
        let mut next_port = self.start_port;
        let mut take_range = |len: usize| {
            let base = next_port;
            next_port = next_port.saturating_add(u16::try_from(len).unwrap_or(u16::MAX));
            base
        };

        let mut out = Vec::new();
        for (id, group) in &self.groups {
            let base_port = group
                .start_port
                .unwrap_or_else(|| take_range(group.members.len()));
            out.push(ResolvedGroup {
                id: id.clone(),
                config: group.clone(),
                base_port,
            });
        }

        let grouped: std::collections::BTreeSet<&String> =
            self.groups.values().flat_map(|g| &g.members).collect();
        for id in self.models.keys() {
            if grouped.contains(id) {
                continue;
            }
            out.push(ResolvedGroup {
                id: id.clone(),
                config: GroupConfig {
                    members: vec![id.clone()],
                    swap: false,
                    exclusive: false,
                    persistent: false,
                    start_port: None,
                },
                base_port: take_range(1),
            });
        }
        out
    }

    /// Map of model id to owning group id, singletons included.
    #[must_use]
    pub fn model_index(&self) -> BTreeMap<String, String> {
        let mut index = BTreeMap::new();
        for group in self.resolved_groups() {
            for member in &group.config.members {
                index.insert(member.clone(), group.id.clone());
            }
        }
        index
    }
}
