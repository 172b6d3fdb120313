use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use hearth_core::queue::revert_operation_fields;
use hearth_core::util::write_json_atomic;
use hearth_core::{
    execution_order, ConfigStore, MasterConfig, Operation, PortAllocator, QueueManager,
    QueuedChangeSet,
};
use hearth_events::Bus;
use serde::Serialize;
use serde_json::json;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{info, warn};
use utoipa::ToSchema;

use crate::catalog::{CatalogError, ServiceCatalog};
use crate::installer::{InstallError, Installer};
use crate::supervisor::{Supervisor, SupervisorError};

pub const MCP_TOOLS_FILE: &str = "mcp_tools.json";

#[derive(Debug, thiserror::Error)]
pub enum ApplyError {
    #[error("an apply is already running")]
    Busy,
    #[error("nothing queued to apply")]
    NothingQueued,
    #[error(transparent)]
    Core(#[from] hearth_core::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum OperationError {
    #[error(transparent)]
    Install(#[from] InstallError),
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error(transparent)]
    Core(#[from] hearth_core::Error),
    #[error("core update command failed: {0}")]
    CoreUpdate(String),
}

#[derive(Clone, Debug, Serialize, ToSchema)]
pub struct OperationOutcome {
    #[schema(value_type = Object)]
    pub operation: Operation,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
}

#[derive(Clone, Debug, Serialize, ToSchema)]
pub struct ApplyResult {
    pub ok: bool,
    /// Some operations failed; they were re-queued.
    pub partial: bool,
    pub outcomes: Vec<OperationOutcome>,
    pub restarted: Vec<String>,
    pub stopped: Vec<String>,
    pub requeued: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug)]
pub struct ApplyOptions {
    /// Restart or stop the services of touched extensions afterwards. The
    /// restart choreography turns this off and starts everything itself.
    pub manage_services: bool,
}

impl Default for ApplyOptions {
    fn default() -> Self {
        Self {
            manage_services: true,
        }
    }
}

#[derive(Serialize)]
struct McpToolEntry<'a> {
    name: &'a str,
    enabled_in_mcp: bool,
    passthrough: bool,
}

pub struct ApplyEngine {
    state_dir: PathBuf,
    core_update_command: Option<String>,
    store: Arc<ConfigStore>,
    queue: Arc<QueueManager>,
    ports: Arc<PortAllocator>,
    installer: Arc<Installer>,
    catalog: Arc<ServiceCatalog>,
    supervisor: Supervisor,
    bus: Bus,
    gate: Mutex<()>,
}

impl ApplyEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        state_dir: PathBuf,
        core_update_command: Option<String>,
        store: Arc<ConfigStore>,
        queue: Arc<QueueManager>,
        ports: Arc<PortAllocator>,
        installer: Arc<Installer>,
        catalog: Arc<ServiceCatalog>,
        supervisor: Supervisor,
        bus: Bus,
    ) -> Self {
        Self {
            state_dir,
            core_update_command,
            store,
            queue,
            ports,
            installer,
            catalog,
            supervisor,
            bus,
            gate: Mutex::new(()),
        }
    }

    /// Serializes queue edits with applies; edits wait, applies never do.
    pub async fn edit_guard(&self) -> MutexGuard<'_, ()> {
        self.gate.lock().await
    }

    pub fn is_busy(&self) -> bool {
        self.gate.try_lock().is_err()
    }

    /// Apply the persisted queue.
    pub async fn apply_queued(&self, options: ApplyOptions) -> Result<ApplyResult, ApplyError> {
        let _guard = self.gate.try_lock().map_err(|_| ApplyError::Busy)?;
        let change_set = self.queue.load()?.ok_or(ApplyError::NothingQueued)?;
        self.apply_locked(change_set, options).await
    }

    /// Like [`apply_queued`](Self::apply_queued) but an empty queue is not an error.
    pub async fn apply_if_queued(&self, options: ApplyOptions) -> Result<Option<ApplyResult>, ApplyError> {
        let _guard = self.gate.try_lock().map_err(|_| ApplyError::Busy)?;
        match self.queue.load()? {
            Some(change_set) => self.apply_locked(change_set, options).await.map(Some),
            None => Ok(None),
        }
    }

    async fn apply_locked(
        &self,
        change_set: QueuedChangeSet,
        options: ApplyOptions,
    ) -> Result<ApplyResult, ApplyError> {
        let started_at = Utc::now();
        let baseline = self.store.load()?;
        let target = change_set.target_config.clone();
        let ops = execution_order(&change_set.operations);
        info!(target: "hearth::apply", operations = ops.len(), "applying queued change set");

        let mut outcomes = Vec::with_capacity(ops.len());
        let mut failed: Vec<Operation> = Vec::new();
        let mut applied_core: Option<String> = None;
        for op in &ops {
            let began = Instant::now();
            let result = self.run_operation(op, &target).await;
            let duration_ms = began.elapsed().as_millis() as u64;
            let outcome = match result {
                Ok(()) => {
                    if let Operation::UpdateCore { target_version } = op {
                        applied_core = Some(target_version.clone());
                    }
                    info!(target: "hearth::apply", operation = %op, duration_ms, "operation completed");
                    OperationOutcome {
                        operation: op.clone(),
                        ok: true,
                        error: None,
                        duration_ms,
                    }
                }
                Err(err) => {
                    warn!(target: "hearth::apply", operation = %op, %err, "operation failed");
                    failed.push(op.clone());
                    OperationOutcome {
                        operation: op.clone(),
                        ok: false,
                        error: Some(err.to_string()),
                        duration_ms,
                    }
                }
            };
            let topic = if outcome.ok {
                hearth_topics::TOPIC_APPLY_OPERATION_COMPLETED
            } else {
                hearth_topics::TOPIC_APPLY_OPERATION_FAILED
            };
            self.bus.publish(topic, &outcome);
            outcomes.push(outcome);
        }

        let new_baseline = self.store.update(|current| {
            let mut next = target.clone().with_ports_from(current);
            for op in &failed {
                revert_operation_fields(&mut next, &baseline, op);
            }
            if let Some(version) = applied_core.as_ref() {
                next.core.version = version.clone();
                next.core.pending_update = None;
            }
            *current = next.clone();
            Ok(next)
        })?;
        self.bus.publish(
            hearth_topics::TOPIC_CONFIG_BASELINE_SAVED,
            &json!({"extensions": new_baseline.extensions.len()}),
        );

        self.queue.delete()?;
        let mut requeued = 0;
        if !failed.is_empty() {
            let mut retry_target = target.clone();
            retry_target.core = new_baseline.core.clone();
            if let Some(pending) = failed.iter().find_map(|op| match op {
                Operation::UpdateCore { target_version } => Some(target_version.clone()),
                _ => None,
            }) {
                retry_target.core.pending_update = Some(pending);
            }
            let retry = QueuedChangeSet {
                operations: failed.clone(),
                target_config: retry_target,
                created_at: Utc::now(),
            };
            if let Some(saved) = self.queue.persist(retry, &new_baseline)? {
                requeued = saved.operations.len();
                self.bus.publish(hearth_topics::TOPIC_QUEUE_UPDATED, &saved);
            }
        } else {
            self.bus
                .publish(hearth_topics::TOPIC_QUEUE_CLEARED, &json!({"reason": "applied"}));
        }

        let (restarted, stopped) = if options.manage_services {
            let touched = touched_extensions(&baseline, &target, &ops);
            self.refresh_services(&touched, &new_baseline, &failed).await
        } else {
            (Vec::new(), Vec::new())
        };

        let result = ApplyResult {
            ok: failed.is_empty(),
            partial: !failed.is_empty(),
            outcomes,
            restarted,
            stopped,
            requeued,
            started_at,
            finished_at: Utc::now(),
        };
        info!(
            target: "hearth::apply",
            ok = result.ok,
            failed = failed.len(),
            restarted = result.restarted.len(),
            stopped = result.stopped.len(),
            "apply finished"
        );
        self.bus.publish(hearth_topics::TOPIC_QUEUE_APPLIED, &result);
        Ok(result)
    }

    async fn run_operation(&self, op: &Operation, target: &MasterConfig) -> Result<(), OperationError> {
        match op {
            Operation::Delete { target: name } => {
                self.catalog.remove_extension(name).await?;
                self.installer.remove(name).await?;
                for released in self.ports.release_extension(name)? {
                    self.bus
                        .publish(hearth_topics::TOPIC_PORT_RELEASED, &released);
                }
                Ok(())
            }
            Operation::Install { target: name, source } | Operation::Update { target: name, source } => {
                self.supervisor.stop_owner(name).await?;
                self.installer.install(name, source).await?;
                Ok(())
            }
            Operation::ToolConfig { .. } => self.write_tool_configs(target),
            Operation::UpdateCore { target_version } => self.update_core(target_version).await,
        }
    }

    fn write_tool_configs(&self, target: &MasterConfig) -> Result<(), OperationError> {
        let tools: Vec<McpToolEntry<'_>> = target
            .tool_configs
            .iter()
            .map(|(name, cfg)| McpToolEntry {
                name,
                enabled_in_mcp: cfg.enabled_in_mcp,
                passthrough: cfg.passthrough,
            })
            .collect();
        let path = self.state_dir.join(MCP_TOOLS_FILE);
        write_json_atomic(&path, &json!({"tools": tools}))?;
        Ok(())
    }

    async fn update_core(&self, version: &str) -> Result<(), OperationError> {
        let Some(command) = self.core_update_command.as_deref() else {
            info!(target: "hearth::apply", version, "no core update command configured; recording version only");
            return Ok(());
        };
        let mut parts = command.split_whitespace();
        let program = parts
            .next()
            .ok_or_else(|| OperationError::CoreUpdate("empty command".into()))?;
        let output = tokio::process::Command::new(program)
            .args(parts)
            .arg(version)
            .output()
            .await
            .map_err(|e| OperationError::CoreUpdate(e.to_string()))?;
        if output.status.success() {
            Ok(())
        } else {
            Err(OperationError::CoreUpdate(format!(
                "{}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )))
        }
    }

    /// Re-register and restart (or stop) the services of every touched extension.
    async fn refresh_services(
        &self,
        touched: &BTreeSet<String>,
        baseline: &MasterConfig,
        failed: &[Operation],
    ) -> (Vec<String>, Vec<String>) {
        let mut restarted = Vec::new();
        let mut stopped = Vec::new();
        for name in touched {
            let Some(entry) = baseline.extensions.get(name) else {
                continue;
            };
            if failed.iter().any(|op| op.extension() == Some(name.as_str()))
                && !self.installer.extensions_dir().join(name).is_dir()
            {
                continue;
            }
            let ids = match self.catalog.sync_extension(name, entry.enabled).await {
                Ok(ids) => ids,
                Err(err) => {
                    warn!(target: "hearth::apply", extension = %name, %err, "could not register services");
                    continue;
                }
            };
            for id in ids {
                let result = if entry.enabled {
                    self.supervisor.restart(&id).await
                } else {
                    self.supervisor.stop(&id).await
                };
                match result {
                    Ok(_) if entry.enabled => restarted.push(id),
                    Ok(_) => stopped.push(id),
                    Err(err) => {
                        warn!(target: "hearth::apply", service = %id, %err, "service refresh failed");
                    }
                }
            }
        }
        (restarted, stopped)
    }
}

/// Extensions named by an operation or whose entry changed between baseline and target.
fn touched_extensions(baseline: &MasterConfig, target: &MasterConfig, ops: &[Operation]) -> BTreeSet<String> {
    let mut touched: BTreeSet<String> = ops
        .iter()
        .filter_map(|op| op.extension().map(str::to_string))
        .collect();
    for (name, entry) in &target.extensions {
        if baseline.extensions.get(name) != Some(entry) {
            touched.insert(name.clone());
        }
    }
    touched
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{wait_for, write_extension, TestHub};
    use hearth_core::{ExtensionPatch, OperationKind, ToolPatch};
    use hearth_runtime::ServiceState;
    use std::sync::atomic::Ordering;

    async fn state_of(hub: &TestHub, id: &str) -> Option<ServiceState> {
        hub.state.supervisor().get(id).await.ok().map(|r| r.state)
    }

    fn queue_install(hub: &TestHub, name: &str) -> QueuedChangeSet {
        hub.state
            .store()
            .patch_extension(
                hub.state.queue(),
                &hub.state.installer().installed().unwrap(),
                name,
                Some(ExtensionPatch {
                    source: Some("local".into()),
                    ..Default::default()
                }),
            )
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn fresh_install_assigns_first_port_and_runs() {
        let hub = TestHub::new();
        write_extension(&hub.sources_dir(), "chef", false, &["api"]);
        let queued = queue_install(&hub, "chef");
        assert_eq!(queued.operations.len(), 1);
        assert_eq!(queued.operations[0].kind(), OperationKind::Install);

        let result = hub
            .state
            .apply()
            .apply_queued(ApplyOptions::default())
            .await
            .unwrap();
        assert!(result.ok);
        assert_eq!(result.restarted, vec!["chef.api"]);
        assert!(hub.state.queue().load().unwrap().is_none());

        let applied = hub.state.store().load().unwrap();
        assert_eq!(applied.port_assignments.services["chef.api"], 5300);
        assert!(applied.extensions.contains_key("chef"));
        assert!(wait_for(|| async { state_of(&hub, "chef.api").await == Some(ServiceState::Running) }).await);
        let spec = hub.adapter.last_spec("chef.api").unwrap();
        assert_eq!(spec.port, Some(5300));
        assert_eq!(spec.env.get("PORT").map(String::as_str), Some("5300"));
    }

    #[tokio::test]
    async fn disabling_stops_service_without_update() {
        let hub = TestHub::new();
        write_extension(&hub.sources_dir(), "chef", false, &["api"]);
        queue_install(&hub, "chef");
        hub.state
            .apply()
            .apply_queued(ApplyOptions::default())
            .await
            .unwrap();
        assert!(wait_for(|| async { state_of(&hub, "chef.api").await == Some(ServiceState::Running) }).await);
        let launches = hub.adapter.launches.load(Ordering::SeqCst);

        let queued = hub
            .state
            .store()
            .patch_extension(
                hub.state.queue(),
                &hub.state.installer().installed().unwrap(),
                "chef",
                Some(ExtensionPatch {
                    enabled: Some(false),
                    ..Default::default()
                }),
            )
            .unwrap()
            .unwrap();
        assert!(queued.operations.is_empty());

        let result = hub
            .state
            .apply()
            .apply_queued(ApplyOptions::default())
            .await
            .unwrap();
        assert!(result.outcomes.is_empty());
        assert_eq!(result.stopped, vec!["chef.api"]);
        let record = hub.state.supervisor().get("chef.api").await.unwrap();
        assert_eq!(record.state, ServiceState::Stopped);
        assert!(!record.enabled);
        assert_eq!(hub.adapter.launches.load(Ordering::SeqCst), launches);
        assert!(!hub.state.store().load().unwrap().extensions["chef"].enabled);
    }

    #[tokio::test]
    async fn delete_then_reinstall_in_one_batch_ends_running() {
        let hub = TestHub::new();
        write_extension(&hub.sources_dir(), "chef", false, &["api"]);
        queue_install(&hub, "chef");
        hub.state
            .apply()
            .apply_queued(ApplyOptions::default())
            .await
            .unwrap();
        assert!(wait_for(|| async { state_of(&hub, "chef.api").await == Some(ServiceState::Running) }).await);

        let applied = hub.state.store().load().unwrap();
        hub.state
            .queue()
            .save_document(
                hub.state.store(),
                hearth_core::QueueDocument {
                    operations: vec![
                        Operation::Install {
                            target: "chef".into(),
                            source: "local".into(),
                        },
                        Operation::Delete {
                            target: "chef".into(),
                        },
                    ],
                    master_config: applied,
                },
            )
            .unwrap();

        let result = hub
            .state
            .apply()
            .apply_queued(ApplyOptions::default())
            .await
            .unwrap();
        assert!(result.ok, "{:?}", result.outcomes);
        let kinds: Vec<OperationKind> = result.outcomes.iter().map(|o| o.operation.kind()).collect();
        assert_eq!(kinds, vec![OperationKind::Delete, OperationKind::Install]);
        assert!(hub.extensions_dir().join("chef").join("extension.toml").is_file());
        assert!(wait_for(|| async { state_of(&hub, "chef.api").await == Some(ServiceState::Running) }).await);
        // Port released on delete, then the lowest free port is taken again.
        let applied = hub.state.store().load().unwrap();
        assert_eq!(applied.port_assignments.services["chef.api"], 5300);
    }

    #[tokio::test]
    async fn failed_operation_is_requeued_and_others_apply() {
        let hub = TestHub::new();
        write_extension(&hub.sources_dir(), "chef", false, &["api"]);
        queue_install(&hub, "chef");
        // pantry has no source directory, so its install fails.
        queue_install(&hub, "pantry");
        hub.state
            .store()
            .patch_tool(
                hub.state.queue(),
                &[],
                "recipes",
                Some(ToolPatch {
                    enabled_in_mcp: Some(true),
                    passthrough: None,
                }),
            )
            .unwrap();

        let result = hub
            .state
            .apply()
            .apply_queued(ApplyOptions::default())
            .await
            .unwrap();
        assert!(result.partial);
        assert_eq!(result.requeued, 1);
        let failed: Vec<_> = result.outcomes.iter().filter(|o| !o.ok).collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].operation.target(), "pantry");

        let applied = hub.state.store().load().unwrap();
        assert!(applied.extensions.contains_key("chef"));
        assert!(!applied.extensions.contains_key("pantry"));
        assert!(applied.tool_configs["recipes"].enabled_in_mcp);

        let retry = hub.state.queue().load().unwrap().unwrap();
        assert_eq!(retry.operations.len(), 1);
        assert_eq!(retry.operations[0].target(), "pantry");
        assert!(retry.target_config.extensions.contains_key("pantry"));

        let tools: serde_json::Value = serde_json::from_slice(
            &std::fs::read(hub.state.settings().state_dir.join(MCP_TOOLS_FILE)).unwrap(),
        )
        .unwrap();
        assert_eq!(tools["tools"][0]["name"], "recipes");
    }

    #[tokio::test]
    async fn core_update_records_new_version() {
        let hub = TestHub::new();
        let mut base = MasterConfig::default();
        base.core.version = "1.0.0".into();
        hub.state.store().save(&base).unwrap();
        hub.state
            .store()
            .patch_core_update(hub.state.queue(), &[], Some("1.2.0".into()))
            .unwrap();
        let result = hub
            .state
            .apply()
            .apply_queued(ApplyOptions::default())
            .await
            .unwrap();
        assert!(result.ok);
        let applied = hub.state.store().load().unwrap();
        assert_eq!(applied.core.version, "1.2.0");
        assert!(applied.core.pending_update.is_none());
        assert!(hub.state.queue().load().unwrap().is_none());
    }

    #[tokio::test]
    async fn concurrent_apply_is_rejected() {
        let hub = TestHub::new();
        let _held = hub.state.apply().edit_guard().await;
        assert!(hub.state.apply().is_busy());
        assert!(matches!(
            hub.state.apply().apply_queued(ApplyOptions::default()).await,
            Err(ApplyError::Busy)
        ));
    }

    #[tokio::test]
    async fn empty_queue_is_reported() {
        let hub = TestHub::new();
        assert!(matches!(
            hub.state.apply().apply_queued(ApplyOptions::default()).await,
            Err(ApplyError::NothingQueued)
        ));
        assert!(hub
            .state
            .apply()
            .apply_if_queued(ApplyOptions::default())
            .await
            .unwrap()
            .is_none());
    }
}
