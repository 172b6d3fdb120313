//! Service supervisor.
//!
//! A single actor task owns every [`ServiceRecord`]; callers talk to it through
//! [`Supervisor`]. Slow adapter calls (launch, shutdown, health probes) run in
//! spawned tasks that report back over the same channel, tagged with the
//! launch instance so results from a superseded instance are dropped.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use hearth_core::Settings;
use hearth_events::Bus;
use hearth_runtime::{
    AdapterError, HealthReport, RestartBudget, ServiceAdapter, ServiceHandle, ServiceId,
    ServiceRecord, ServiceSpec, ServiceState, SupervisorSnapshot,
};
use serde_json::json;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::tasks::TaskHandle;

#[derive(Clone, Debug)]
pub struct SupervisorOptions {
    /// Probe period once a service is running.
    pub health_interval: Duration,
    /// Probe period while a freshly launched service warms up.
    pub startup_probe_interval: Duration,
    /// Failed probes are tolerated this long after launch.
    pub startup_timeout: Duration,
    pub max_restarts: u32,
    pub restart_window: Duration,
    pub stop_grace: Duration,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self::from_settings(&Settings::default())
    }
}

impl SupervisorOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            health_interval: settings.health_interval,
            startup_probe_interval: Duration::from_millis(500).min(settings.health_interval),
            startup_timeout: Duration::from_secs(30),
            max_restarts: settings.max_restarts,
            restart_window: settings.restart_window,
            stop_grace: settings.stop_grace,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("service `{0}` not known to supervisor")]
    UnknownService(String),
    #[error(transparent)]
    Adapter(#[from] AdapterError),
    #[error("supervisor is not running")]
    Closed,
}

type Reply<T> = oneshot::Sender<Result<T, SupervisorError>>;

enum Command {
    Register {
        spec: ServiceSpec,
        enabled: bool,
        reply: oneshot::Sender<bool>,
    },
    Start {
        id: ServiceId,
        adopt: bool,
        reply: Reply<ServiceRecord>,
    },
    Stop {
        id: ServiceId,
        reply: Reply<ServiceRecord>,
    },
    Restart {
        id: ServiceId,
        reply: Reply<ServiceRecord>,
    },
    Reset {
        id: ServiceId,
        reply: Reply<ServiceRecord>,
    },
    Remove {
        id: ServiceId,
        reply: Reply<ServiceRecord>,
    },
    Snapshot {
        reply: oneshot::Sender<SupervisorSnapshot>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
    Launched {
        id: ServiceId,
        instance: u64,
        adopted: bool,
        result: Result<ServiceHandle, AdapterError>,
    },
    Health {
        id: ServiceId,
        instance: u64,
        result: Result<HealthReport, AdapterError>,
    },
}

struct Entry {
    spec: ServiceSpec,
    record: ServiceRecord,
    instance: u64,
    handle: Option<ServiceHandle>,
    cancel: Option<CancellationToken>,
    /// Set while the current instance has been healthy without interruption.
    healthy_since: Option<Instant>,
}

impl Entry {
    fn new(spec: ServiceSpec, enabled: bool) -> Self {
        Self {
            record: ServiceRecord::new(&spec, enabled),
            spec,
            instance: 0,
            handle: None,
            cancel: None,
            healthy_since: None,
        }
    }

    /// Invalidate the running instance and hand back its handle.
    fn detach(&mut self) -> Option<ServiceHandle> {
        self.instance += 1;
        if let Some(token) = self.cancel.take() {
            token.cancel();
        }
        self.record.pid = None;
        self.record.adopted = false;
        self.healthy_since = None;
        self.handle.take()
    }
}

/// Move to `state`, falling back through `stopped` when the direct edge is not legal.
fn move_to(record: &mut ServiceRecord, state: ServiceState, summary: impl Into<String>) {
    let summary = summary.into();
    if record.transition(state, summary.clone()) {
        return;
    }
    record.transition(ServiceState::Stopped, summary.clone());
    if !record.transition(state, summary.clone()) {
        record.summary = summary;
    }
}

struct Ctx {
    adapter: Arc<dyn ServiceAdapter>,
    bus: Bus,
    options: SupervisorOptions,
    tx: mpsc::WeakSender<Command>,
}

impl Ctx {
    fn publish(&self, record: &ServiceRecord) {
        self.bus
            .publish(hearth_topics::TOPIC_SERVICE_STATE_CHANGED, record);
    }

    /// Automatic restarts are counted for the life of the record. The count only
    /// drops back to zero through an operator reset/start, or once the service
    /// has stayed healthy for a full `restart_window`.
    fn refresh_budget(&self, entry: &mut Entry) {
        let window = self.options.restart_window;
        let used = entry.record.restart_count;
        let reset_at = entry
            .healthy_since
            .filter(|_| used > 0)
            .map(|since| {
                let left = window.saturating_sub(since.elapsed());
                Utc::now() + chrono::Duration::from_std(left).unwrap_or_else(|_| chrono::Duration::zero())
            });
        entry.record.restart_budget = Some(RestartBudget {
            window_seconds: window.as_secs(),
            max_restarts: self.options.max_restarts,
            used,
            remaining: self.options.max_restarts.saturating_sub(used),
            reset_at,
        });
    }

    fn clear_budget(&self, entry: &mut Entry) {
        entry.record.restart_count = 0;
        self.refresh_budget(entry);
    }

    fn spawn_shutdown(&self, handle: ServiceHandle, reply: Option<(Reply<ServiceRecord>, ServiceRecord)>) {
        let adapter = self.adapter.clone();
        let grace = self.options.stop_grace;
        tokio::spawn(async move {
            let result = adapter.shutdown(&handle, grace).await;
            if let Err(err) = result.as_ref() {
                warn!(target: "hearth::supervisor", service = %handle.id, %err, "shutdown failed");
            }
            if let Some((reply, record)) = reply {
                let _ = reply.send(result.map(|_| record).map_err(SupervisorError::from));
            }
        });
    }

    /// Launch a new instance, after shutting down `previous` if given.
    fn spawn_launch(&self, entry: &mut Entry, try_adopt: bool, previous: Option<ServiceHandle>) {
        if let Some(token) = entry.cancel.take() {
            token.cancel();
        }
        entry.instance += 1;
        let instance = entry.instance;
        let Some(tx) = self.tx.upgrade() else {
            return;
        };
        let spec = entry.spec.clone();
        let adapter = self.adapter.clone();
        let grace = self.options.stop_grace;
        tokio::spawn(async move {
            if let Some(old) = previous {
                if let Err(err) = adapter.shutdown(&old, grace).await {
                    warn!(target: "hearth::supervisor", service = %old.id, %err, "stopping previous instance failed");
                }
            }
            if try_adopt {
                match adapter.adopt(&spec, instance).await {
                    Ok(Some(handle)) => {
                        let _ = tx
                            .send(Command::Launched {
                                id: spec.id.clone(),
                                instance,
                                adopted: true,
                                result: Ok(handle),
                            })
                            .await;
                        return;
                    }
                    Ok(None) => {}
                    Err(err) => {
                        debug!(target: "hearth::supervisor", service = %spec.id, %err, "adopt probe failed");
                    }
                }
            }
            let result = adapter.launch(&spec, instance).await;
            let _ = tx
                .send(Command::Launched {
                    id: spec.id.clone(),
                    instance,
                    adopted: false,
                    result,
                })
                .await;
        });
    }

    fn spawn_health(&self, entry: &mut Entry, warming_up: bool) {
        let Some(handle) = entry.handle.clone() else {
            return;
        };
        let Some(tx) = self.tx.upgrade() else {
            return;
        };
        let token = CancellationToken::new();
        entry.cancel = Some(token.clone());
        let adapter = self.adapter.clone();
        let spec = entry.spec.clone();
        let options = self.options.clone();
        tokio::spawn(async move {
            let launched = Instant::now();
            let mut warming_up = warming_up;
            loop {
                let wait = if warming_up {
                    options.startup_probe_interval
                } else {
                    options.health_interval
                };
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(wait) => {}
                }
                let result = adapter.health(&handle, &spec).await;
                if token.is_cancelled() {
                    break;
                }
                if warming_up {
                    match &result {
                        Ok(_) => warming_up = false,
                        Err(_) if launched.elapsed() < options.startup_timeout => continue,
                        Err(_) => {}
                    }
                }
                let failed = result.is_err();
                let sent = tx
                    .send(Command::Health {
                        id: spec.id.clone(),
                        instance: handle.instance,
                        result,
                    })
                    .await;
                if sent.is_err() || failed {
                    break;
                }
            }
        });
    }

    /// Health or launch failure: restart within budget, otherwise mark failed.
    fn fail(&self, entry: &mut Entry, reason: String) {
        warn!(target: "hearth::supervisor", service = %entry.spec.id, %reason, "service failure");
        let previous = entry.handle.take();
        if let Some(token) = entry.cancel.take() {
            token.cancel();
        }
        entry.record.pid = None;
        entry.record.adopted = false;
        entry.healthy_since = None;
        if entry.record.state != ServiceState::Unhealthy {
            move_to(&mut entry.record, ServiceState::Unhealthy, reason.clone());
        }
        entry.record.detail = vec![reason.clone()];
        self.refresh_budget(entry);
        self.publish(&entry.record);

        let used = entry.record.restart_count;
        let max = self.options.max_restarts;
        if used < max {
            entry.record.restart_count += 1;
            self.refresh_budget(entry);
            move_to(
                &mut entry.record,
                ServiceState::Restarting,
                format!("Restarting after failure ({}/{max})", used + 1),
            );
            entry.record.detail.push(reason);
            self.publish(&entry.record);
            move_to(&mut entry.record, ServiceState::Starting, "Relaunching");
            self.publish(&entry.record);
            self.spawn_launch(entry, false, previous);
            return;
        }

        move_to(&mut entry.record, ServiceState::Failed, "Restart budget exhausted");
        entry.record.detail.push(reason.clone());
        self.publish(&entry.record);
        self.bus.publish(
            hearth_topics::TOPIC_SERVICE_RESTART_EXHAUSTED,
            &json!({
                "id": entry.spec.id,
                "owner": entry.spec.owner,
                "restart_count": entry.record.restart_count,
                "reason": reason,
            }),
        );
        warn!(
            target: "hearth::supervisor",
            service = %entry.spec.id,
            restarts = entry.record.restart_count,
            "restart budget exhausted; service failed"
        );
        if let Some(previous) = previous {
            self.spawn_shutdown(previous, None);
        }
    }
}

struct Actor {
    ctx: Ctx,
    entries: BTreeMap<ServiceId, Entry>,
}

impl Actor {
    async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        while let Some(cmd) = rx.recv().await {
            if !self.handle(cmd) {
                break;
            }
        }
        for entry in self.entries.values_mut() {
            if let Some(token) = entry.cancel.take() {
                token.cancel();
            }
        }
        debug!(target: "hearth::supervisor", "supervisor loop exited");
    }

    fn handle(&mut self, cmd: Command) -> bool {
        match cmd {
            Command::Register {
                spec,
                enabled,
                reply,
            } => {
                let _ = reply.send(self.register(spec, enabled));
            }
            Command::Start { id, adopt, reply } => {
                let _ = reply.send(self.start(&id, adopt));
            }
            Command::Stop { id, reply } => self.stop(&id, reply, false),
            Command::Remove { id, reply } => self.stop(&id, reply, true),
            Command::Restart { id, reply } => {
                let _ = reply.send(self.restart(&id));
            }
            Command::Reset { id, reply } => {
                let _ = reply.send(self.reset(&id));
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(SupervisorSnapshot {
                    updated_at: Utc::now(),
                    services: self.entries.values().map(|e| e.record.clone()).collect(),
                });
            }
            Command::Shutdown { reply } => {
                let _ = reply.send(());
                return false;
            }
            Command::Launched {
                id,
                instance,
                adopted,
                result,
            } => self.on_launched(&id, instance, adopted, result),
            Command::Health {
                id,
                instance,
                result,
            } => self.on_health(&id, instance, result),
        }
        true
    }

    fn entry(&mut self, id: &str) -> Result<&mut Entry, SupervisorError> {
        self.entries
            .get_mut(id)
            .ok_or_else(|| SupervisorError::UnknownService(id.to_string()))
    }

    /// Returns true when the service is new or its launch description changed.
    fn register(&mut self, spec: ServiceSpec, enabled: bool) -> bool {
        let ctx = &self.ctx;
        match self.entries.get_mut(&spec.id) {
            Some(entry) => {
                let changed = entry.spec != spec;
                entry.record.port = spec.port;
                entry.record.kind = spec.kind;
                entry.record.owner = spec.owner.clone();
                let toggled = entry.record.enabled != enabled;
                entry.record.enabled = enabled;
                entry.spec = spec;
                if changed || toggled {
                    ctx.publish(&entry.record);
                }
                changed
            }
            None => {
                info!(target: "hearth::supervisor", service = %spec.id, port = ?spec.port, "service registered");
                let mut entry = Entry::new(spec, enabled);
                ctx.refresh_budget(&mut entry);
                ctx.publish(&entry.record);
                self.entries.insert(entry.spec.id.clone(), entry);
                true
            }
        }
    }

    fn start(&mut self, id: &str, adopt: bool) -> Result<ServiceRecord, SupervisorError> {
        let ctx = &self.ctx;
        let entry = self
            .entries
            .get_mut(id)
            .ok_or_else(|| SupervisorError::UnknownService(id.to_string()))?;
        if entry.record.state.is_active() {
            return Ok(entry.record.clone());
        }
        if entry.record.state == ServiceState::Failed {
            ctx.clear_budget(entry);
        }
        let summary = if adopt {
            "Looking for a running instance"
        } else {
            "Launching"
        };
        move_to(&mut entry.record, ServiceState::Starting, summary);
        ctx.publish(&entry.record);
        ctx.spawn_launch(entry, adopt, None);
        Ok(entry.record.clone())
    }

    fn stop(&mut self, id: &str, reply: Reply<ServiceRecord>, remove: bool) {
        let entry = match self.entry(id) {
            Ok(entry) => entry,
            Err(err) => {
                let _ = reply.send(Err(err));
                return;
            }
        };
        let handle = entry.detach();
        move_to(
            &mut entry.record,
            ServiceState::Stopped,
            if remove { "Removed" } else { "Stopped" },
        );
        let record = entry.record.clone();
        self.ctx.publish(&record);
        if remove {
            self.entries.remove(id);
            info!(target: "hearth::supervisor", service = %id, "service removed");
        }
        match handle {
            Some(handle) => self.ctx.spawn_shutdown(handle, Some((reply, record))),
            None => {
                let _ = reply.send(Ok(record));
            }
        }
    }

    fn restart(&mut self, id: &str) -> Result<ServiceRecord, SupervisorError> {
        let ctx = &self.ctx;
        let entry = self
            .entries
            .get_mut(id)
            .ok_or_else(|| SupervisorError::UnknownService(id.to_string()))?;
        if entry.record.state == ServiceState::Failed {
            ctx.clear_budget(entry);
        }
        let previous = entry.detach();
        if entry.record.state.allows(ServiceState::Restarting) {
            move_to(&mut entry.record, ServiceState::Restarting, "Restart requested");
            ctx.publish(&entry.record);
        } else {
            move_to(&mut entry.record, ServiceState::Stopped, "Restart requested");
        }
        move_to(&mut entry.record, ServiceState::Starting, "Launching");
        ctx.publish(&entry.record);
        ctx.spawn_launch(entry, false, previous);
        Ok(entry.record.clone())
    }

    fn reset(&mut self, id: &str) -> Result<ServiceRecord, SupervisorError> {
        let ctx = &self.ctx;
        let entry = self
            .entries
            .get_mut(id)
            .ok_or_else(|| SupervisorError::UnknownService(id.to_string()))?;
        ctx.clear_budget(entry);
        if entry.record.state == ServiceState::Failed {
            move_to(&mut entry.record, ServiceState::Stopped, "Reset; ready to start");
        }
        ctx.publish(&entry.record);
        Ok(entry.record.clone())
    }

    fn on_launched(
        &mut self,
        id: &str,
        instance: u64,
        adopted: bool,
        result: Result<ServiceHandle, AdapterError>,
    ) {
        let ctx = &self.ctx;
        let current = self
            .entries
            .get_mut(id)
            .filter(|entry| entry.instance == instance);
        let Some(entry) = current else {
            if let Ok(handle) = result {
                debug!(target: "hearth::supervisor", service = %id, instance, "stale launch; stopping orphan");
                ctx.spawn_shutdown(handle, None);
            }
            return;
        };
        match result {
            Ok(handle) => {
                entry.record.pid = handle.pid;
                entry.record.adopted = adopted;
                entry.handle = Some(handle);
                if adopted {
                    entry.healthy_since = Some(Instant::now());
                    move_to(&mut entry.record, ServiceState::Running, "Adopted running instance");
                    info!(target: "hearth::supervisor", service = %id, "adopted running instance");
                } else {
                    entry.record.summary = "Launched; waiting for health".into();
                    entry.record.updated_at = Utc::now();
                }
                ctx.publish(&entry.record);
                ctx.spawn_health(entry, !adopted);
            }
            Err(err) => ctx.fail(entry, format!("launch failed: {err}")),
        }
    }

    fn on_health(&mut self, id: &str, instance: u64, result: Result<HealthReport, AdapterError>) {
        let ctx = &self.ctx;
        let current = self
            .entries
            .get_mut(id)
            .filter(|entry| entry.instance == instance);
        let Some(entry) = current else {
            return;
        };
        match result {
            Ok(report) => {
                entry.record.last_health_check = Some(report.checked_at);
                if entry.record.state == ServiceState::Starting {
                    entry.healthy_since = Some(Instant::now());
                    move_to(&mut entry.record, ServiceState::Running, "Healthy");
                    entry.record.detail = vec![report.detail];
                    ctx.refresh_budget(entry);
                    ctx.publish(&entry.record);
                    info!(target: "hearth::supervisor", service = %id, "service healthy");
                } else if entry.record.state == ServiceState::Running
                    && entry.record.restart_count > 0
                    && entry
                        .healthy_since
                        .is_some_and(|since| since.elapsed() >= ctx.options.restart_window)
                {
                    ctx.clear_budget(entry);
                    ctx.publish(&entry.record);
                    info!(target: "hearth::supervisor", service = %id, "stable again; restart budget restored");
                }
            }
            Err(err) => {
                entry.record.last_health_check = Some(Utc::now());
                if matches!(
                    entry.record.state,
                    ServiceState::Starting | ServiceState::Running
                ) {
                    ctx.fail(entry, err.to_string());
                }
            }
        }
    }
}

/// Cloneable handle to the supervisor actor.
#[derive(Clone)]
pub struct Supervisor {
    tx: mpsc::Sender<Command>,
}

impl Supervisor {
    pub fn spawn(
        adapter: Arc<dyn ServiceAdapter>,
        bus: Bus,
        options: SupervisorOptions,
    ) -> (Self, TaskHandle) {
        let (tx, rx) = mpsc::channel(256);
        let actor = Actor {
            ctx: Ctx {
                adapter,
                bus,
                options,
                tx: tx.downgrade(),
            },
            entries: BTreeMap::new(),
        };
        let handle = tokio::spawn(actor.run(rx));
        (Self { tx }, TaskHandle::new("supervisor", handle))
    }

    async fn call<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, SupervisorError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(build(reply))
            .await
            .map_err(|_| SupervisorError::Closed)?;
        rx.await.map_err(|_| SupervisorError::Closed)
    }

    /// Add or refresh a service description. Returns true when it is new or
    /// its launch description changed (a running instance keeps the old one
    /// until restarted).
    pub async fn register(&self, spec: ServiceSpec, enabled: bool) -> Result<bool, SupervisorError> {
        self.call(|reply| Command::Register {
            spec,
            enabled,
            reply,
        })
        .await
    }

    pub async fn start(&self, id: &str) -> Result<ServiceRecord, SupervisorError> {
        let id = id.to_string();
        self.call(|reply| Command::Start {
            id,
            adopt: false,
            reply,
        })
        .await?
    }

    /// Start, but first claim an instance already answering on the service's port.
    pub async fn start_or_adopt(&self, id: &str) -> Result<ServiceRecord, SupervisorError> {
        let id = id.to_string();
        self.call(|reply| Command::Start {
            id,
            adopt: true,
            reply,
        })
        .await?
    }

    /// Resolves once the instance has been shut down.
    pub async fn stop(&self, id: &str) -> Result<ServiceRecord, SupervisorError> {
        let id = id.to_string();
        self.call(|reply| Command::Stop { id, reply }).await?
    }

    pub async fn restart(&self, id: &str) -> Result<ServiceRecord, SupervisorError> {
        let id = id.to_string();
        self.call(|reply| Command::Restart { id, reply }).await?
    }

    /// Clear the restart budget; a failed service goes back to stopped.
    pub async fn reset(&self, id: &str) -> Result<ServiceRecord, SupervisorError> {
        let id = id.to_string();
        self.call(|reply| Command::Reset { id, reply }).await?
    }

    pub async fn remove(&self, id: &str) -> Result<ServiceRecord, SupervisorError> {
        let id = id.to_string();
        self.call(|reply| Command::Remove { id, reply }).await?
    }

    pub async fn snapshot(&self) -> Result<SupervisorSnapshot, SupervisorError> {
        self.call(|reply| Command::Snapshot { reply }).await
    }

    pub async fn get(&self, id: &str) -> Result<ServiceRecord, SupervisorError> {
        self.snapshot()
            .await?
            .services
            .into_iter()
            .find(|record| record.id == id)
            .ok_or_else(|| SupervisorError::UnknownService(id.to_string()))
    }

    pub async fn ids_for_owner(&self, owner: &str) -> Result<Vec<ServiceId>, SupervisorError> {
        Ok(self
            .snapshot()
            .await?
            .services
            .into_iter()
            .filter(|record| record.owner == owner)
            .map(|record| record.id)
            .collect())
    }

    /// Stop every active service of `owner`, in parallel.
    pub async fn stop_owner(&self, owner: &str) -> Result<Vec<ServiceId>, SupervisorError> {
        let snapshot = self.snapshot().await?;
        let ids: Vec<ServiceId> = snapshot
            .services
            .into_iter()
            .filter(|record| record.owner == owner && record.state.is_active())
            .map(|record| record.id)
            .collect();
        self.stop_many(&ids).await?;
        Ok(ids)
    }

    pub async fn remove_owner(&self, owner: &str) -> Result<Vec<ServiceId>, SupervisorError> {
        let ids = self.ids_for_owner(owner).await?;
        for id in &ids {
            self.remove(id).await?;
        }
        Ok(ids)
    }

    pub async fn stop_all(&self) -> Result<Vec<ServiceId>, SupervisorError> {
        let ids: Vec<ServiceId> = self
            .snapshot()
            .await?
            .services
            .into_iter()
            .filter(|record| record.state.is_active())
            .map(|record| record.id)
            .collect();
        self.stop_many(&ids).await?;
        Ok(ids)
    }

    async fn stop_many(&self, ids: &[ServiceId]) -> Result<(), SupervisorError> {
        let results =
            futures_util::future::join_all(ids.iter().map(|id| self.stop(id))).await;
        for result in results {
            match result {
                Ok(_) | Err(SupervisorError::UnknownService(_)) => {}
                Err(SupervisorError::Adapter(err)) => {
                    warn!(target: "hearth::supervisor", %err, "stop reported an adapter error");
                }
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    /// Stop the actor loop. Services are left as they are; call `stop_all` first.
    pub async fn shutdown(&self) {
        let _ = self.call(|reply| Command::Shutdown { reply }).await;
    }
}
