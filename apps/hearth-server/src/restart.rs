//! Full-system restart: stop everything, apply pending changes, reassign
//! ports, start everything, then wait for health. The job lives on the server;
//! clients poll or subscribe and only render it.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use hearth_events::Bus;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, warn};
use utoipa::ToSchema;

use crate::apply::{ApplyEngine, ApplyOptions, ApplyResult};
use crate::catalog::ServiceCatalog;
use crate::supervisor::Supervisor;

const WAIT_MESSAGES: &[&str] = &[
    "Waiting for services to report healthy",
    "Checking service health endpoints",
    "Large extensions can take a minute to warm up",
    "Still waiting on the last services",
];

/// Polls per message before cycling to the next one.
const POLLS_PER_MESSAGE: usize = 4;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum RestartPhase {
    StoppingServices,
    ApplyingChanges,
    AssigningPorts,
    StartingServices,
    WaitingForHealth,
    TimedOut,
    Completed,
    Forced,
    Failed,
}

impl RestartPhase {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RestartPhase::Completed | RestartPhase::Forced | RestartPhase::Failed
        )
    }

    fn message(self) -> &'static str {
        match self {
            RestartPhase::StoppingServices => "Stopping services",
            RestartPhase::ApplyingChanges => "Applying pending extension changes",
            RestartPhase::AssigningPorts => "Assigning ports",
            RestartPhase::StartingServices => "Starting services",
            RestartPhase::WaitingForHealth => WAIT_MESSAGES[0],
            RestartPhase::TimedOut => "Services did not become healthy in time",
            RestartPhase::Completed => "All services are running",
            RestartPhase::Forced => "Reload forced before every service was healthy",
            RestartPhase::Failed => "Restart failed",
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum RestartChoice {
    KeepWaiting,
    ForceReload,
}

#[derive(Clone, Debug, Serialize, ToSchema)]
pub struct RestartJob {
    pub id: String,
    pub phase: RestartPhase,
    pub message: String,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deadline: Option<DateTime<Utc>>,
    /// Offered once the health wait times out.
    pub choices: Vec<RestartChoice>,
    pub enabled_services: usize,
    pub running_services: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub apply: Option<ApplyResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum RestartError {
    #[error("a system restart is already in progress")]
    InProgress,
    #[error("no restart job is waiting for that decision")]
    NotWaiting,
}

#[derive(Clone, Debug)]
pub struct RestartOptions {
    pub timeout: Duration,
    pub poll_interval: Duration,
    pub probe_timeout: Duration,
}

impl RestartOptions {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout,
            poll_interval: Duration::from_millis(500),
            probe_timeout: Duration::from_secs(2),
        }
    }
}

struct Inner {
    job: Mutex<Option<RestartJob>>,
    control: Mutex<Option<mpsc::UnboundedSender<RestartChoice>>>,
    supervisor: Supervisor,
    catalog: Arc<ServiceCatalog>,
    apply: Arc<ApplyEngine>,
    bus: Bus,
    options: RestartOptions,
}

#[derive(Clone)]
pub struct RestartCoordinator {
    inner: Arc<Inner>,
}

impl RestartCoordinator {
    pub fn new(
        supervisor: Supervisor,
        catalog: Arc<ServiceCatalog>,
        apply: Arc<ApplyEngine>,
        bus: Bus,
        options: RestartOptions,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                job: Mutex::new(None),
                control: Mutex::new(None),
                supervisor,
                catalog,
                apply,
                bus,
                options,
            }),
        }
    }

    pub fn current(&self) -> Option<RestartJob> {
        self.inner.job.lock().clone()
    }

    pub fn begin(&self) -> Result<RestartJob, RestartError> {
        let job = {
            let mut guard = self.inner.job.lock();
            if guard.as_ref().is_some_and(|job| !job.phase.is_terminal()) {
                return Err(RestartError::InProgress);
            }
            let now = Utc::now();
            let job = RestartJob {
                id: uuid::Uuid::new_v4().to_string(),
                phase: RestartPhase::StoppingServices,
                message: RestartPhase::StoppingServices.message().into(),
                started_at: now,
                updated_at: now,
                deadline: None,
                choices: Vec::new(),
                enabled_services: 0,
                running_services: 0,
                apply: None,
                error: None,
            };
            *guard = Some(job.clone());
            job
        };
        let (tx, rx) = mpsc::unbounded_channel();
        *self.inner.control.lock() = Some(tx);
        info!(target: "hearth::restart", job = %job.id, "system restart started");
        self.inner
            .bus
            .publish(hearth_topics::TOPIC_SYSTEM_RESTART_PHASE, &job);
        tokio::spawn(run(self.inner.clone(), rx));
        Ok(job)
    }

    pub fn choose(&self, choice: RestartChoice) -> Result<RestartJob, RestartError> {
        let job = self.current().ok_or(RestartError::NotWaiting)?;
        let allowed = match choice {
            RestartChoice::KeepWaiting => job.phase == RestartPhase::TimedOut,
            RestartChoice::ForceReload => matches!(
                job.phase,
                RestartPhase::TimedOut | RestartPhase::WaitingForHealth
            ),
        };
        if !allowed {
            return Err(RestartError::NotWaiting);
        }
        let sent = self
            .inner
            .control
            .lock()
            .as_ref()
            .map(|tx| tx.send(choice).is_ok())
            .unwrap_or(false);
        if !sent {
            return Err(RestartError::NotWaiting);
        }
        Ok(job)
    }
}

impl Inner {
    fn update(&self, apply: impl FnOnce(&mut RestartJob)) -> Option<RestartJob> {
        let mut guard = self.job.lock();
        let job = guard.as_mut()?;
        let before = job.phase;
        apply(job);
        job.updated_at = Utc::now();
        let snapshot = job.clone();
        drop(guard);
        if snapshot.phase != before {
            info!(target: "hearth::restart", job = %snapshot.id, phase = ?snapshot.phase, "restart phase");
        }
        self.bus
            .publish(hearth_topics::TOPIC_SYSTEM_RESTART_PHASE, &snapshot);
        Some(snapshot)
    }

    fn enter(&self, phase: RestartPhase) {
        self.update(|job| {
            job.phase = phase;
            job.message = phase.message().into();
            job.choices.clear();
        });
    }

    fn finish(&self, phase: RestartPhase, error: Option<String>) {
        if let Some(error) = error.as_deref() {
            warn!(target: "hearth::restart", %error, "system restart failed");
        }
        let finished = self.update(|job| {
            job.phase = phase;
            job.message = phase.message().into();
            job.choices.clear();
            job.error = error;
        });
        self.control.lock().take();
        if let Some(job) = finished {
            self.bus
                .publish(hearth_topics::TOPIC_SYSTEM_RESTART_FINISHED, &job);
        }
    }
}

async fn run(inner: Arc<Inner>, mut control: mpsc::UnboundedReceiver<RestartChoice>) {
    if let Err(err) = inner.supervisor.stop_all().await {
        return inner.finish(RestartPhase::Failed, Some(err.to_string()));
    }

    inner.enter(RestartPhase::ApplyingChanges);
    match inner
        .apply
        .apply_if_queued(ApplyOptions {
            manage_services: false,
        })
        .await
    {
        Ok(result) => {
            inner.update(|job| job.apply = result);
        }
        Err(err) => return inner.finish(RestartPhase::Failed, Some(err.to_string())),
    }

    inner.enter(RestartPhase::AssigningPorts);
    if let Err(err) = inner.catalog.sync_all().await {
        return inner.finish(RestartPhase::Failed, Some(err.to_string()));
    }

    inner.enter(RestartPhase::StartingServices);
    if let Err(err) = inner.catalog.start_enabled(false).await {
        return inner.finish(RestartPhase::Failed, Some(err.to_string()));
    }

    let mut deadline = Instant::now() + inner.options.timeout;
    let deadline_at = |from: Duration| {
        Utc::now() + chrono::Duration::from_std(from).unwrap_or_else(|_| chrono::Duration::zero())
    };
    inner.update(|job| {
        job.phase = RestartPhase::WaitingForHealth;
        job.message = RestartPhase::WaitingForHealth.message().into();
        job.deadline = Some(deadline_at(inner.options.timeout));
    });

    let mut polls = 0usize;
    let mut timed_out = false;
    loop {
        tokio::select! {
            choice = control.recv() => match choice {
                Some(RestartChoice::KeepWaiting) => {
                    deadline = Instant::now() + inner.options.timeout;
                    timed_out = false;
                    info!(target: "hearth::restart", "operator chose to keep waiting");
                    inner.update(|job| {
                        job.phase = RestartPhase::WaitingForHealth;
                        job.message = RestartPhase::WaitingForHealth.message().into();
                        job.choices.clear();
                        job.deadline = Some(deadline_at(inner.options.timeout));
                    });
                }
                Some(RestartChoice::ForceReload) => {
                    info!(target: "hearth::restart", "operator forced reload");
                    return inner.finish(RestartPhase::Forced, None);
                }
                None => return,
            },
            _ = tokio::time::sleep(inner.options.poll_interval) => {}
        }

        let probe = tokio::time::timeout(inner.options.probe_timeout, inner.supervisor.snapshot()).await;
        let snapshot = match probe {
            Ok(Ok(snapshot)) => snapshot,
            Ok(Err(err)) => return inner.finish(RestartPhase::Failed, Some(err.to_string())),
            Err(_) => continue,
        };
        let enabled = snapshot.services.iter().filter(|s| s.enabled).count();
        let running = snapshot
            .services
            .iter()
            .filter(|s| s.enabled && s.state == hearth_runtime::ServiceState::Running)
            .count();
        if snapshot.all_enabled_running() {
            inner.update(|job| {
                job.enabled_services = enabled;
                job.running_services = running;
            });
            info!(target: "hearth::restart", services = enabled, "system restart completed");
            return inner.finish(RestartPhase::Completed, None);
        }

        polls += 1;
        if !timed_out && Instant::now() >= deadline {
            timed_out = true;
            warn!(target: "hearth::restart", running, enabled, "restart health wait timed out");
            inner.update(|job| {
                job.phase = RestartPhase::TimedOut;
                job.message = RestartPhase::TimedOut.message().into();
                job.choices = vec![RestartChoice::KeepWaiting, RestartChoice::ForceReload];
                job.enabled_services = enabled;
                job.running_services = running;
            });
            continue;
        }
        let message = if timed_out {
            RestartPhase::TimedOut.message()
        } else {
            WAIT_MESSAGES[(polls / POLLS_PER_MESSAGE) % WAIT_MESSAGES.len()]
        };
        let current = inner.job.lock().as_ref().map(|job| {
            (job.message.clone(), job.enabled_services, job.running_services)
        });
        if current != Some((message.to_string(), enabled, running)) {
            inner.update(|job| {
                job.message = message.into();
                job.enabled_services = enabled;
                job.running_services = running;
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{wait_for, write_extension, TestHub};
    use hearth_core::ExtensionPatch;

    async fn wait_phase(hub: &TestHub, phase: RestartPhase) -> bool {
        wait_for(|| async {
            hub.state
                .restart()
                .current()
                .is_some_and(|job| job.phase == phase)
        })
        .await
    }

    #[tokio::test]
    async fn restart_applies_queue_and_completes() {
        let hub = TestHub::new();
        write_extension(&hub.sources_dir(), "chef", true, &["api"]);
        hub.state
            .store()
            .patch_extension(
                hub.state.queue(),
                &[],
                "chef",
                Some(ExtensionPatch {
                    source: Some("local".into()),
                    ..Default::default()
                }),
            )
            .unwrap();

        let job = hub.state.restart().begin().unwrap();
        assert_eq!(job.phase, RestartPhase::StoppingServices);
        assert!(matches!(
            hub.state.restart().begin(),
            Err(RestartError::InProgress)
        ));

        assert!(wait_phase(&hub, RestartPhase::Completed).await);
        let job = hub.state.restart().current().unwrap();
        assert!(job.apply.as_ref().is_some_and(|r| r.ok));
        assert_eq!(job.enabled_services, 2);
        assert_eq!(job.running_services, 2);
        assert!(hub.state.queue().load().unwrap().is_none());
        let applied = hub.state.store().load().unwrap();
        assert_eq!(applied.port_assignments.extensions["chef"], 5200);
        assert_eq!(applied.port_assignments.services["chef.api"], 5300);

        // A finished job does not block the next one.
        assert!(hub.state.restart().begin().is_ok());
    }

    #[tokio::test]
    async fn timeout_offers_choices_and_keep_waiting_recovers() {
        let hub = TestHub::with_restart_timeout(Duration::from_millis(100));
        write_extension(&hub.extensions_dir(), "chef", false, &["api"]);
        let mut cfg = hearth_core::MasterConfig::default();
        cfg.extensions
            .insert("chef".into(), hearth_core::ExtensionEntry::new("local"));
        hub.state.store().save(&cfg).unwrap();
        hub.adapter.set_healthy(false);

        hub.state.restart().begin().unwrap();
        assert!(wait_phase(&hub, RestartPhase::TimedOut).await);
        let job = hub.state.restart().current().unwrap();
        assert_eq!(
            job.choices,
            vec![RestartChoice::KeepWaiting, RestartChoice::ForceReload]
        );

        hub.adapter.set_healthy(true);
        hub.state
            .restart()
            .choose(RestartChoice::KeepWaiting)
            .unwrap();
        assert!(wait_phase(&hub, RestartPhase::Completed).await);
    }

    #[tokio::test]
    async fn force_reload_ends_the_job() {
        let hub = TestHub::with_restart_timeout(Duration::from_millis(50));
        write_extension(&hub.extensions_dir(), "chef", false, &["api"]);
        let mut cfg = hearth_core::MasterConfig::default();
        cfg.extensions
            .insert("chef".into(), hearth_core::ExtensionEntry::new("local"));
        hub.state.store().save(&cfg).unwrap();
        hub.adapter.set_healthy(false);

        hub.state.restart().begin().unwrap();
        assert!(wait_phase(&hub, RestartPhase::TimedOut).await);
        hub.state
            .restart()
            .choose(RestartChoice::ForceReload)
            .unwrap();
        assert!(wait_phase(&hub, RestartPhase::Forced).await);
        assert!(matches!(
            hub.state.restart().choose(RestartChoice::ForceReload),
            Err(RestartError::NotWaiting)
        ));
    }
}
