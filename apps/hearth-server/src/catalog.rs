use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;

use hearth_core::{
    ConfigStore, CoreServiceConfig, ExtensionManifest, MasterConfig, PortAllocator, PortScope,
    ServiceTemplate,
};
use hearth_events::Bus;
use hearth_runtime::{ServiceId, ServiceKind, ServiceState};
use serde_json::json;
use tracing::{info, warn};

use crate::logs::LogHub;
use crate::supervisor::{Supervisor, SupervisorError};

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error(transparent)]
    Core(#[from] hearth_core::Error),
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),
}

/// Turns the applied config, installed manifests and core service settings
/// into registered supervisor services with assigned ports.
pub struct ServiceCatalog {
    extensions_dir: PathBuf,
    core_services: Vec<CoreServiceConfig>,
    store: Arc<ConfigStore>,
    ports: Arc<PortAllocator>,
    supervisor: Supervisor,
    logs: Arc<LogHub>,
    bus: Bus,
}

impl ServiceCatalog {
    pub fn new(
        extensions_dir: PathBuf,
        core_services: Vec<CoreServiceConfig>,
        store: Arc<ConfigStore>,
        ports: Arc<PortAllocator>,
        supervisor: Supervisor,
        logs: Arc<LogHub>,
        bus: Bus,
    ) -> Self {
        Self {
            extensions_dir,
            core_services,
            store,
            ports,
            supervisor,
            logs,
            bus,
        }
    }

    fn extension_templates(&self, name: &str) -> Result<Vec<ServiceTemplate>, CatalogError> {
        let dir = self.extensions_dir.join(name);
        if !dir.join(hearth_core::manifest::MANIFEST_FILE).is_file() {
            return Ok(Vec::new());
        }
        let manifest = ExtensionManifest::load(&dir)?;
        Ok(manifest.templates(&dir))
    }

    fn port_for(&self, template: &ServiceTemplate) -> Result<Option<u16>, CatalogError> {
        let Some(scope) = template.scope else {
            return Ok(template.fixed_port);
        };
        let known = self.ports.lookup(scope, &template.id)?;
        let port = self.ports.allocate(scope, &template.id)?;
        if known.is_none() {
            self.bus.publish(
                hearth_topics::TOPIC_PORT_ASSIGNED,
                &json!({"scope": scope, "owner": template.id, "port": port}),
            );
        }
        Ok(Some(port))
    }

    /// Register every process the installed extension declares, allocating
    /// ports for new ones and dropping services its manifest no longer lists.
    pub async fn sync_extension(
        &self,
        name: &str,
        enabled: bool,
    ) -> Result<Vec<ServiceId>, CatalogError> {
        let templates = self.extension_templates(name)?;
        let mut ids = Vec::with_capacity(templates.len());
        for template in &templates {
            let port = self.port_for(template)?;
            let spec = template.resolve(port);
            if self.supervisor.register(spec, enabled).await? {
                info!(target: "hearth::catalog", service = %template.id, ?port, "service description updated");
            }
            ids.push(template.id.clone());
        }
        for stale in self.supervisor.ids_for_owner(name).await? {
            if !ids.contains(&stale) {
                self.supervisor.remove(&stale).await?;
                self.logs.forget(&stale);
                if let Some(scope) = scope_for_id(name, &stale) {
                    self.ports.release(scope, &stale)?;
                }
            }
        }
        Ok(ids)
    }

    pub async fn sync_core(&self) -> Result<Vec<ServiceId>, CatalogError> {
        let mut ids = Vec::new();
        for svc in &self.core_services {
            let template = svc.template();
            let spec = template.resolve(template.fixed_port);
            self.supervisor.register(spec, svc.enabled).await?;
            ids.push(svc.id.clone());
        }
        Ok(ids)
    }

    /// Bring the supervisor's registry in line with the applied config.
    pub async fn sync_all(&self) -> Result<Vec<ServiceId>, CatalogError> {
        let cfg = self.store.load()?;
        let mut ids = self.sync_core().await?;
        for (name, entry) in &cfg.extensions {
            match self.sync_extension(name, entry.enabled).await {
                Ok(mut more) => ids.append(&mut more),
                Err(CatalogError::Core(err)) => {
                    warn!(target: "hearth::catalog", extension = %name, %err, "skipping extension with unreadable manifest");
                }
                Err(err) => return Err(err),
            }
        }
        self.drop_unconfigured(&cfg).await?;
        Ok(ids)
    }

    async fn drop_unconfigured(&self, cfg: &MasterConfig) -> Result<(), CatalogError> {
        let owners: BTreeSet<String> = self
            .supervisor
            .snapshot()
            .await?
            .services
            .into_iter()
            .filter(|record| record.kind != ServiceKind::Core)
            .map(|record| record.owner)
            .collect();
        for owner in owners {
            if !cfg.extensions.contains_key(&owner) {
                self.remove_extension(&owner).await?;
            }
        }
        Ok(())
    }

    /// Stop and forget every service of an extension.
    pub async fn remove_extension(&self, name: &str) -> Result<Vec<ServiceId>, CatalogError> {
        let removed = self.supervisor.remove_owner(name).await?;
        for id in &removed {
            self.logs.forget(id);
        }
        Ok(removed)
    }

    /// Start every enabled service that is not already up.
    pub async fn start_enabled(&self, adopt: bool) -> Result<Vec<ServiceId>, CatalogError> {
        let snapshot = self.supervisor.snapshot().await?;
        let mut started = Vec::new();
        for record in snapshot.services {
            if !record.enabled || record.state.is_active() {
                continue;
            }
            if record.state == ServiceState::Failed {
                continue;
            }
            let result = if adopt {
                self.supervisor.start_or_adopt(&record.id).await
            } else {
                self.supervisor.start(&record.id).await
            };
            result?;
            started.push(record.id);
        }
        Ok(started)
    }
}

fn scope_for_id(extension: &str, id: &str) -> Option<PortScope> {
    if id == extension {
        Some(PortScope::ExtensionUi)
    } else if id.starts_with(&format!("{extension}.")) {
        Some(PortScope::ExtensionService)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{write_extension, TestHub};
    use hearth_core::ExtensionEntry;

    #[tokio::test]
    async fn sync_assigns_ports_in_scope_order() {
        let hub = TestHub::new();
        write_extension(&hub.extensions_dir(), "chef", true, &["api", "worker"]);
        let mut cfg = MasterConfig::default();
        cfg.extensions.insert("chef".into(), ExtensionEntry::new("local"));
        hub.state.store().save(&cfg).unwrap();

        let ids = hub.state.catalog().sync_all().await.unwrap();
        assert_eq!(ids, vec!["chef", "chef.api", "chef.worker"]);

        let applied = hub.state.store().load().unwrap();
        assert_eq!(applied.port_assignments.extensions["chef"], 5200);
        assert_eq!(applied.port_assignments.services["chef.api"], 5300);
        assert_eq!(applied.port_assignments.services["chef.worker"], 5301);

        // Resync is stable.
        hub.state.catalog().sync_all().await.unwrap();
        let again = hub.state.store().load().unwrap();
        assert_eq!(again.port_assignments, applied.port_assignments);
    }

    #[tokio::test]
    async fn services_dropped_from_manifest_are_removed() {
        let hub = TestHub::new();
        write_extension(&hub.extensions_dir(), "chef", false, &["api", "worker"]);
        let catalog = hub.state.catalog();
        catalog.sync_extension("chef", true).await.unwrap();
        write_extension(&hub.extensions_dir(), "chef", false, &["api"]);
        let ids = catalog.sync_extension("chef", true).await.unwrap();
        assert_eq!(ids, vec!["chef.api"]);
        let snapshot = hub.state.supervisor().snapshot().await.unwrap();
        assert_eq!(snapshot.services.len(), 1);
        let applied = hub.state.store().load().unwrap();
        assert!(!applied.port_assignments.services.contains_key("chef.worker"));
    }

    #[test]
    fn scope_is_derived_from_id_shape() {
        assert_eq!(scope_for_id("chef", "chef"), Some(PortScope::ExtensionUi));
        assert_eq!(
            scope_for_id("chef", "chef.api"),
            Some(PortScope::ExtensionService)
        );
        assert_eq!(scope_for_id("chef", "pantry.api"), None);
    }
}
