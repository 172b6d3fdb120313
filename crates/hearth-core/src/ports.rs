use std::collections::HashSet;
use std::fmt;
use std::net::TcpListener;
use std::ops::RangeInclusive;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::store::ConfigStore;

pub const UI_PORT_RANGE: RangeInclusive<u16> = 5200..=5299;
pub const SERVICE_PORT_RANGE: RangeInclusive<u16> = 5300..=5399;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortScope {
    ExtensionUi,
    ExtensionService,
}

impl PortScope {
    pub fn range(self) -> RangeInclusive<u16> {
        match self {
            PortScope::ExtensionUi => UI_PORT_RANGE,
            PortScope::ExtensionService => SERVICE_PORT_RANGE,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PortScope::ExtensionUi => "extension_ui",
            PortScope::ExtensionService => "extension_service",
        }
    }
}

impl fmt::Display for PortScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Owner key for an extension's UI port.
pub fn ui_owner(extension: &str) -> String {
    extension.to_string()
}

/// Owner key for one of an extension's backend services.
pub fn service_owner(extension: &str, service: &str) -> String {
    format!("{extension}.{service}")
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct PortAssignment {
    pub scope: PortScope,
    pub owner: String,
    pub port: u16,
}

/// Hands out stable ports from fixed ranges, persisting them in the master
/// config's `port_assignments` table.
pub struct PortAllocator {
    store: Arc<ConfigStore>,
    probe_os: bool,
}

impl PortAllocator {
    pub fn new(store: Arc<ConfigStore>) -> Self {
        Self {
            store,
            probe_os: true,
        }
    }

    /// Skip ports some other process already listens on. Disabled in tests so
    /// allocation stays deterministic.
    pub fn with_os_probe(mut self, enabled: bool) -> Self {
        self.probe_os = enabled;
        self
    }

    /// Existing owners always get their recorded port back; new owners get the
    /// lowest free port in the scope's range.
    pub fn allocate(&self, scope: PortScope, owner: &str) -> Result<u16> {
        if let Some(port) = self.lookup(scope, owner)? {
            return Ok(port);
        }
        let probe_os = self.probe_os;
        let port = self.store.update(|cfg| {
            let table = cfg.port_assignments.table_mut(scope);
            if let Some(port) = table.get(owner) {
                return Ok(*port);
            }
            let used: HashSet<u16> = table.values().copied().collect();
            let range = scope.range();
            for port in range.clone() {
                if used.contains(&port) {
                    continue;
                }
                if probe_os && !os_port_free(port) {
                    debug!(target: "hearth::ports", port, "skipping port in use by another process");
                    continue;
                }
                table.insert(owner.to_string(), port);
                return Ok(port);
            }
            Err(Error::PortsExhausted {
                scope,
                start: *range.start(),
                end: *range.end(),
            })
        })?;
        info!(target: "hearth::ports", %scope, owner, port, "port assigned");
        Ok(port)
    }

    pub fn lookup(&self, scope: PortScope, owner: &str) -> Result<Option<u16>> {
        let cfg = self.store.load()?;
        Ok(cfg.port_assignments.table(scope).get(owner).copied())
    }

    pub fn release(&self, scope: PortScope, owner: &str) -> Result<Option<u16>> {
        let released = self
            .store
            .update(|cfg| Ok(cfg.port_assignments.table_mut(scope).remove(owner)))?;
        if let Some(port) = released {
            info!(target: "hearth::ports", %scope, owner, port, "port released");
        }
        Ok(released)
    }

    /// Drop the UI port and every `extension.*` service port for one extension.
    pub fn release_extension(&self, extension: &str) -> Result<Vec<PortAssignment>> {
        let prefix = format!("{extension}.");
        let released = self.store.update(|cfg| {
            let mut released = Vec::new();
            if let Some(port) = cfg.port_assignments.extensions.remove(extension) {
                released.push(PortAssignment {
                    scope: PortScope::ExtensionUi,
                    owner: extension.to_string(),
                    port,
                });
            }
            let owners: Vec<String> = cfg
                .port_assignments
                .services
                .keys()
                .filter(|owner| owner.starts_with(&prefix))
                .cloned()
                .collect();
            for owner in owners {
                if let Some(port) = cfg.port_assignments.services.remove(&owner) {
                    released.push(PortAssignment {
                        scope: PortScope::ExtensionService,
                        owner,
                        port,
                    });
                }
            }
            Ok(released)
        })?;
        for entry in &released {
            info!(
                target: "hearth::ports",
                scope = %entry.scope,
                owner = %entry.owner,
                port = entry.port,
                "port released"
            );
        }
        Ok(released)
    }

    pub fn assignments(&self) -> Result<Vec<PortAssignment>> {
        let cfg = self.store.load()?;
        let mut out = Vec::new();
        for scope in [PortScope::ExtensionUi, PortScope::ExtensionService] {
            for (owner, port) in cfg.port_assignments.table(scope) {
                out.push(PortAssignment {
                    scope,
                    owner: owner.clone(),
                    port: *port,
                });
            }
        }
        Ok(out)
    }
}

fn os_port_free(port: u16) -> bool {
    TcpListener::bind(("127.0.0.1", port)).is_ok()
}
