use std::sync::Arc;
use std::time::Duration;

use hearth_core::{ConfigStore, PortAllocator, QueueManager, Settings};
use hearth_events::Bus;
use hearth_runtime::ServiceAdapter;

use crate::apply::ApplyEngine;
use crate::catalog::ServiceCatalog;
use crate::installer::Installer;
use crate::logs::LogHub;
use crate::process_adapter::ProcessAdapter;
use crate::restart::{RestartCoordinator, RestartOptions};
use crate::supervisor::{Supervisor, SupervisorOptions};
use crate::tasks::TaskHandle;

const BUS_CAPACITY: usize = 1024;

#[derive(Clone)]
pub(crate) struct AppState {
    settings: Arc<Settings>,
    bus: Bus,
    store: Arc<ConfigStore>,
    queue: Arc<QueueManager>,
    ports: Arc<PortAllocator>,
    installer: Arc<Installer>,
    logs: Arc<LogHub>,
    supervisor: Supervisor,
    catalog: Arc<ServiceCatalog>,
    apply: Arc<ApplyEngine>,
    restart: RestartCoordinator,
}

impl AppState {
    pub fn builder(settings: Settings) -> AppStateBuilder {
        AppStateBuilder::new(settings)
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn bus(&self) -> &Bus {
        &self.bus
    }

    pub fn store(&self) -> &Arc<ConfigStore> {
        &self.store
    }

    pub fn queue(&self) -> &Arc<QueueManager> {
        &self.queue
    }

    pub fn ports(&self) -> &Arc<PortAllocator> {
        &self.ports
    }

    pub fn installer(&self) -> &Arc<Installer> {
        &self.installer
    }

    pub fn logs(&self) -> &Arc<LogHub> {
        &self.logs
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    pub fn catalog(&self) -> &Arc<ServiceCatalog> {
        &self.catalog
    }

    pub fn apply(&self) -> &Arc<ApplyEngine> {
        &self.apply
    }

    pub fn restart(&self) -> &RestartCoordinator {
        &self.restart
    }
}

pub(crate) struct AppStateBuilder {
    settings: Settings,
    adapter: Option<Arc<dyn ServiceAdapter>>,
    supervisor_options: Option<SupervisorOptions>,
    restart_options: Option<RestartOptions>,
}

impl AppStateBuilder {
    fn new(settings: Settings) -> Self {
        Self {
            settings,
            adapter: None,
            supervisor_options: None,
            restart_options: None,
        }
    }

    #[cfg(test)]
    pub fn with_adapter(mut self, adapter: Arc<dyn ServiceAdapter>) -> Self {
        self.adapter = Some(adapter);
        self
    }

    #[cfg(test)]
    pub fn with_supervisor_options(mut self, options: SupervisorOptions) -> Self {
        self.supervisor_options = Some(options);
        self
    }

    #[cfg(test)]
    pub fn with_restart_options(mut self, options: RestartOptions) -> Self {
        self.restart_options = Some(options);
        self
    }

    /// Wire every component together and spawn the supervisor actor. The
    /// returned tasks belong to the caller's shutdown sequence.
    pub fn build(self) -> anyhow::Result<(AppState, Vec<TaskHandle>)> {
        let settings = Arc::new(self.settings);
        std::fs::create_dir_all(&settings.state_dir)?;
        std::fs::create_dir_all(&settings.extensions_dir)?;

        let bus = Bus::new(BUS_CAPACITY);
        let store = Arc::new(ConfigStore::in_dir(&settings.state_dir));
        let queue = Arc::new(QueueManager::in_dir(&settings.state_dir));
        let ports = Arc::new(PortAllocator::new(store.clone()).with_os_probe(settings.probe_os_ports));
        let installer = Arc::new(Installer::new(
            settings.extensions_dir.clone(),
            settings.sources_dir.clone(),
        ));
        let logs = Arc::new(LogHub::new(bus.clone()));

        let adapter: Arc<dyn ServiceAdapter> = match self.adapter {
            Some(adapter) => adapter,
            None => ProcessAdapter::new(logs.clone())?,
        };
        let supervisor_options = self
            .supervisor_options
            .unwrap_or_else(|| SupervisorOptions::from_settings(&settings));
        let (supervisor, supervisor_task) =
            Supervisor::spawn(adapter, bus.clone(), supervisor_options);

        let catalog = Arc::new(ServiceCatalog::new(
            settings.extensions_dir.clone(),
            settings.core_services.clone(),
            store.clone(),
            ports.clone(),
            supervisor.clone(),
            logs.clone(),
            bus.clone(),
        ));
        let apply = Arc::new(ApplyEngine::new(
            settings.state_dir.clone(),
            settings.core_update_command.clone(),
            store.clone(),
            queue.clone(),
            ports.clone(),
            installer.clone(),
            catalog.clone(),
            supervisor.clone(),
            bus.clone(),
        ));
        let restart_options = self
            .restart_options
            .unwrap_or_else(|| RestartOptions::with_timeout(settings.restart_timeout));
        let restart = RestartCoordinator::new(
            supervisor.clone(),
            catalog.clone(),
            apply.clone(),
            bus.clone(),
            restart_options,
        );

        let state = AppState {
            settings,
            bus,
            store,
            queue,
            ports,
            installer,
            logs,
            supervisor,
            catalog,
            apply,
            restart,
        };
        Ok((state, vec![supervisor_task]))
    }
}

/// Grace period granted to background tasks once the supervisor has stopped.
pub(crate) const TASK_SHUTDOWN_GRACE: Duration = Duration::from_secs(2);
