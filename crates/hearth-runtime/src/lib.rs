use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type ServiceId = String;

/// Lifecycle state of a supervised service.
///
/// ```text
/// stopped -> starting -> running -> unhealthy -> restarting -> starting
///                                      \-> failed (restart budget exhausted)
/// ```
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum ServiceState {
    #[default]
    Stopped,
    Starting,
    Running,
    Unhealthy,
    Restarting,
    Failed,
}

impl ServiceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceState::Stopped => "stopped",
            ServiceState::Starting => "starting",
            ServiceState::Running => "running",
            ServiceState::Unhealthy => "unhealthy",
            ServiceState::Restarting => "restarting",
            ServiceState::Failed => "failed",
        }
    }

    pub fn display_label(&self) -> &'static str {
        match self {
            ServiceState::Stopped => "Stopped",
            ServiceState::Starting => "Starting",
            ServiceState::Running => "Running",
            ServiceState::Unhealthy => "Unhealthy",
            ServiceState::Restarting => "Restarting",
            ServiceState::Failed => "Failed",
        }
    }

    /// True while the supervisor owns a live (or launching) process for the service.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            ServiceState::Starting
                | ServiceState::Running
                | ServiceState::Unhealthy
                | ServiceState::Restarting
        )
    }

    /// Whether the state machine permits moving from `self` to `next`.
    ///
    /// Operator stops are allowed from every state; `failed` only leaves via
    /// an explicit stop/reset or start.
    pub fn allows(&self, next: ServiceState) -> bool {
        use ServiceState::*;
        if next == Stopped {
            return true;
        }
        matches!(
            (self, next),
            (Stopped, Starting)
                | (Failed, Starting)
                | (Starting, Running)
                | (Starting, Unhealthy)
                | (Running, Running)
                | (Running, Unhealthy)
                | (Running, Restarting)
                | (Unhealthy, Running)
                | (Unhealthy, Restarting)
                | (Unhealthy, Failed)
                | (Restarting, Starting)
                | (Restarting, Failed)
                | (Starting, Failed)
        )
    }
}

/// What kind of owner a service belongs to; decides which port scope it draws from.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ServiceKind {
    ExtensionUi,
    ExtensionService,
    Core,
}

/// HTTP health check declared by a service.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct HealthCheck {
    pub path: String,
    #[serde(default = "HealthCheck::default_status")]
    pub expect_status: u16,
    #[serde(default = "HealthCheck::default_timeout_ms")]
    pub timeout_ms: u64,
}

impl HealthCheck {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            expect_status: Self::default_status(),
            timeout_ms: Self::default_timeout_ms(),
        }
    }

    fn default_status() -> u16 {
        200
    }

    fn default_timeout_ms() -> u64 {
        5_000
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn url(&self, port: u16) -> String {
        if self.path.starts_with("http://") || self.path.starts_with("https://") {
            return self.path.clone();
        }
        let path = if self.path.starts_with('/') {
            self.path.clone()
        } else {
            format!("/{}", self.path)
        };
        format!("http://127.0.0.1:{port}{path}")
    }
}

/// Fully-resolved launch description for one supervised service.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ServiceSpec {
    pub id: ServiceId,
    pub kind: ServiceKind,
    /// Extension name, or `core` for hub-level services.
    pub owner: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub workdir: Option<PathBuf>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub health: Option<HealthCheck>,
}

impl ServiceSpec {
    pub fn health_url(&self) -> Option<String> {
        match (self.health.as_ref(), self.port) {
            (Some(check), Some(port)) => Some(check.url(port)),
            (Some(check), None) if check.path.starts_with("http") => Some(check.path.clone()),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct RestartBudget {
    pub window_seconds: u64,
    pub max_restarts: u32,
    pub used: u32,
    pub remaining: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reset_at: Option<DateTime<Utc>>,
}

/// Runtime-only record the supervisor keeps per service.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServiceRecord {
    pub id: ServiceId,
    pub kind: ServiceKind,
    pub owner: String,
    pub state: ServiceState,
    pub enabled: bool,
    #[serde(default)]
    pub pid: Option<u32>,
    #[serde(default)]
    pub port: Option<u16>,
    pub restart_count: u32,
    #[serde(default)]
    pub last_health_check: Option<DateTime<Utc>>,
    pub summary: String,
    #[serde(default)]
    pub detail: Vec<String>,
    #[serde(default)]
    pub restart_budget: Option<RestartBudget>,
    #[serde(default)]
    pub adopted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_label: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl ServiceRecord {
    pub fn new(spec: &ServiceSpec, enabled: bool) -> Self {
        let mut record = Self {
            id: spec.id.clone(),
            kind: spec.kind,
            owner: spec.owner.clone(),
            state: ServiceState::Stopped,
            enabled,
            pid: None,
            port: spec.port,
            restart_count: 0,
            last_health_check: None,
            summary: "Service registered".to_string(),
            detail: Vec::new(),
            restart_budget: None,
            adopted: false,
            state_label: None,
            updated_at: Utc::now(),
        };
        record.refresh_labels();
        record
    }

    pub fn refresh_labels(&mut self) {
        self.state_label = Some(self.state.display_label().to_string());
    }

    /// Move to `state`, replacing summary/detail. Returns false when the move is
    /// not a legal transition (the record is left untouched).
    pub fn transition(&mut self, state: ServiceState, summary: impl Into<String>) -> bool {
        if !self.state.allows(state) {
            return false;
        }
        self.state = state;
        self.summary = summary.into();
        self.detail.clear();
        self.updated_at = Utc::now();
        self.refresh_labels();
        true
    }
}

/// Point-in-time view of every supervised service.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SupervisorSnapshot {
    pub updated_at: DateTime<Utc>,
    pub services: Vec<ServiceRecord>,
}

impl SupervisorSnapshot {
    /// Every enabled service is running (adopted ones included).
    pub fn all_enabled_running(&self) -> bool {
        self.services
            .iter()
            .filter(|record| record.enabled)
            .all(|record| record.state == ServiceState::Running)
    }

    pub fn count(&self, state: ServiceState) -> usize {
        self.services
            .iter()
            .filter(|record| record.state == state)
            .count()
    }
}

#[derive(thiserror::Error, Debug)]
pub enum AdapterError {
    #[error("unavailable: {0}")]
    Unavailable(String),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("launch failure: {0}")]
    Launch(String),
    #[error("io error: {0}")]
    Io(String),
}

#[derive(Clone, Debug)]
pub struct ServiceHandle {
    pub id: ServiceId,
    pub pid: Option<u32>,
    /// Monotonic launch counter; stale health results from an older instance are ignored.
    pub instance: u64,
}

#[derive(Clone, Debug)]
pub struct HealthReport {
    pub checked_at: DateTime<Utc>,
    pub detail: String,
}

impl HealthReport {
    pub fn ok(detail: impl Into<String>) -> Self {
        Self {
            checked_at: Utc::now(),
            detail: detail.into(),
        }
    }
}

#[async_trait::async_trait]
pub trait ServiceAdapter: Send + Sync {
    fn id(&self) -> &'static str;

    async fn launch(&self, spec: &ServiceSpec, instance: u64)
        -> Result<ServiceHandle, AdapterError>;

    /// Stop the instance, waiting up to `grace` for a clean exit before forcing it.
    async fn shutdown(&self, handle: &ServiceHandle, grace: Duration) -> Result<(), AdapterError>;

    async fn health(
        &self,
        handle: &ServiceHandle,
        spec: &ServiceSpec,
    ) -> Result<HealthReport, AdapterError>;

    /// Claim an instance that is already serving on the spec's port (left over from
    /// a previous hub run). Adapters that cannot detect this return `None`.
    async fn adopt(
        &self,
        _spec: &ServiceSpec,
        _instance: u64,
    ) -> Result<Option<ServiceHandle>, AdapterError> {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> ServiceSpec {
        ServiceSpec {
            id: "chef.api".into(),
            kind: ServiceKind::ExtensionService,
            owner: "chef".into(),
            command: "python3".into(),
            args: vec!["server.py".into()],
            env: BTreeMap::new(),
            workdir: None,
            port: Some(5300),
            health: Some(HealthCheck::new("health")),
        }
    }

    #[test]
    fn service_state_labels_match_snake_case() {
        assert_eq!(ServiceState::Stopped.as_str(), "stopped");
        assert_eq!(ServiceState::Starting.as_str(), "starting");
        assert_eq!(ServiceState::Running.as_str(), "running");
        assert_eq!(ServiceState::Unhealthy.as_str(), "unhealthy");
        assert_eq!(ServiceState::Restarting.as_str(), "restarting");
        assert_eq!(ServiceState::Failed.as_str(), "failed");
        assert_eq!(
            serde_json::to_value(ServiceState::Restarting).unwrap(),
            serde_json::json!("restarting")
        );
    }

    #[test]
    fn failed_is_terminal_until_operator_acts() {
        assert!(!ServiceState::Failed.allows(ServiceState::Running));
        assert!(!ServiceState::Failed.allows(ServiceState::Restarting));
        assert!(ServiceState::Failed.allows(ServiceState::Stopped));
        assert!(ServiceState::Failed.allows(ServiceState::Starting));
        assert!(!ServiceState::Stopped.allows(ServiceState::Running));
        assert!(ServiceState::Unhealthy.allows(ServiceState::Restarting));
    }

    #[test]
    fn record_rejects_illegal_transition() {
        let mut record = ServiceRecord::new(&spec(), true);
        assert!(!record.transition(ServiceState::Running, "skip starting"));
        assert_eq!(record.state, ServiceState::Stopped);
        assert!(record.transition(ServiceState::Starting, "launching"));
        assert_eq!(record.state_label.as_deref(), Some("Starting"));
    }

    #[test]
    fn health_url_joins_port_and_path() {
        let spec = spec();
        assert_eq!(
            spec.health_url().as_deref(),
            Some("http://127.0.0.1:5300/health")
        );
        let mut absolute = spec.clone();
        absolute.port = None;
        absolute.health = Some(HealthCheck::new("http://10.0.0.2:9000/ping"));
        assert_eq!(
            absolute.health_url().as_deref(),
            Some("http://10.0.0.2:9000/ping")
        );
    }

    #[test]
    fn snapshot_health_ignores_disabled_services() {
        let mut running = ServiceRecord::new(&spec(), true);
        running.state = ServiceState::Running;
        let mut disabled = ServiceRecord::new(&spec(), false);
        disabled.id = "chef".into();
        let snapshot = SupervisorSnapshot {
            updated_at: Utc::now(),
            services: vec![running, disabled],
        };
        assert!(snapshot.all_enabled_running());
        assert_eq!(snapshot.count(ServiceState::Stopped), 1);
    }
}
