#![cfg(test)]

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hearth_core::Settings;
use hearth_runtime::{
    AdapterError, HealthCheck, HealthReport, ServiceAdapter, ServiceHandle, ServiceKind,
    ServiceSpec,
};
use parking_lot::Mutex;

use crate::app_state::AppState;
use crate::restart::RestartOptions;
use crate::supervisor::SupervisorOptions;
use crate::tasks::TaskHandle;

pub mod env {
    use once_cell::sync::Lazy;
    use std::sync::{Mutex, MutexGuard};

    static ENV_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

    pub struct EnvGuard {
        _lock: MutexGuard<'static, ()>,
        saved: Vec<(&'static str, Option<String>)>,
    }

    pub fn guard() -> EnvGuard {
        EnvGuard {
            _lock: ENV_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner()),
            saved: Vec::new(),
        }
    }

    impl EnvGuard {
        fn remember(&mut self, key: &'static str) {
            if self.saved.iter().any(|(k, _)| *k == key) {
                return;
            }
            self.saved.push((key, std::env::var(key).ok()));
        }

        pub fn set(&mut self, key: &'static str, value: &str) {
            self.remember(key);
            std::env::set_var(key, value);
        }

        pub fn remove(&mut self, key: &'static str) {
            self.remember(key);
            std::env::remove_var(key);
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (key, val) in self.saved.drain(..) {
                match val {
                    Some(v) => std::env::set_var(key, v),
                    None => std::env::remove_var(key),
                }
            }
        }
    }
}

/// In-memory adapter: launches always "succeed" unless told otherwise and
/// health follows a single switch.
pub struct FakeAdapter {
    pub launches: AtomicUsize,
    pub shutdowns: AtomicUsize,
    pub fail_launch: AtomicBool,
    pub adoptable: AtomicBool,
    healthy: AtomicBool,
    specs: Mutex<HashMap<String, ServiceSpec>>,
}

impl Default for FakeAdapter {
    fn default() -> Self {
        Self {
            launches: AtomicUsize::new(0),
            shutdowns: AtomicUsize::new(0),
            fail_launch: AtomicBool::new(false),
            adoptable: AtomicBool::new(false),
            healthy: AtomicBool::new(true),
            specs: Mutex::new(HashMap::new()),
        }
    }
}

impl FakeAdapter {
    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    pub fn last_spec(&self, id: &str) -> Option<ServiceSpec> {
        self.specs.lock().get(id).cloned()
    }
}

#[async_trait]
impl ServiceAdapter for FakeAdapter {
    fn id(&self) -> &'static str {
        "fake"
    }

    async fn launch(&self, spec: &ServiceSpec, instance: u64) -> Result<ServiceHandle, AdapterError> {
        let n = self.launches.fetch_add(1, Ordering::SeqCst) as u32;
        if self.fail_launch.load(Ordering::SeqCst) {
            return Err(AdapterError::Launch(format!("{}: refused", spec.id)));
        }
        self.specs.lock().insert(spec.id.clone(), spec.clone());
        Ok(ServiceHandle {
            id: spec.id.clone(),
            pid: Some(1000 + n),
            instance,
        })
    }

    async fn shutdown(&self, _handle: &ServiceHandle, _grace: Duration) -> Result<(), AdapterError> {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn health(
        &self,
        _handle: &ServiceHandle,
        spec: &ServiceSpec,
    ) -> Result<HealthReport, AdapterError> {
        if self.healthy.load(Ordering::SeqCst) {
            Ok(HealthReport::ok("ok"))
        } else {
            Err(AdapterError::Unavailable(format!("{} not answering", spec.id)))
        }
    }

    async fn adopt(
        &self,
        spec: &ServiceSpec,
        instance: u64,
    ) -> Result<Option<ServiceHandle>, AdapterError> {
        if !self.adoptable.load(Ordering::SeqCst) {
            return Ok(None);
        }
        Ok(Some(ServiceHandle {
            id: spec.id.clone(),
            pid: None,
            instance,
        }))
    }
}

pub fn fake_spec(id: &str, owner: &str, port: u16) -> ServiceSpec {
    let kind = if owner == "core" {
        ServiceKind::Core
    } else if id == owner {
        ServiceKind::ExtensionUi
    } else {
        ServiceKind::ExtensionService
    };
    ServiceSpec {
        id: id.into(),
        kind,
        owner: owner.into(),
        command: "serve".into(),
        args: Vec::new(),
        env: Default::default(),
        workdir: None,
        port: Some(port),
        health: Some(HealthCheck::new("health")),
    }
}

/// Poll `check` until it returns true or five seconds pass.
pub async fn wait_for<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Write `dir/<name>/extension.toml` declaring an optional UI and the given
/// backend services. Existing manifests are overwritten.
pub fn write_extension(dir: &Path, name: &str, has_ui: bool, services: &[&str]) {
    let root = dir.join(name);
    std::fs::create_dir_all(&root).unwrap();
    let mut manifest = format!("name = \"{name}\"\nversion = \"1.0.0\"\n");
    if has_ui {
        manifest.push_str("\n[ui]\ncommand = \"serve-ui\"\nargs = [\"--port\", \"{port}\"]\nhealth_path = \"/\"\n");
    }
    for service in services {
        manifest.push_str(&format!(
            "\n[[services]]\nname = \"{service}\"\ncommand = \"serve-{service}\"\nhealth_path = \"/health\"\n"
        ));
    }
    std::fs::write(root.join(hearth_core::manifest::MANIFEST_FILE), manifest).unwrap();
}

/// A fully wired hub rooted in a scratch directory, backed by [`FakeAdapter`].
pub struct TestHub {
    pub state: AppState,
    pub adapter: Arc<FakeAdapter>,
    _tasks: Vec<TaskHandle>,
    _tmp: tempfile::TempDir,
}

impl TestHub {
    pub fn new() -> Self {
        Self::with_restart_timeout(Duration::from_secs(5))
    }

    pub fn with_restart_timeout(timeout: Duration) -> Self {
        let tmp = tempfile::tempdir().unwrap();
        let settings = Settings::for_state_dir(tmp.path());
        let adapter = Arc::new(FakeAdapter::default());
        let (state, tasks) = AppState::builder(settings)
            .with_adapter(adapter.clone())
            .with_supervisor_options(SupervisorOptions {
                health_interval: Duration::from_millis(20),
                startup_probe_interval: Duration::from_millis(10),
                startup_timeout: Duration::from_secs(2),
                max_restarts: 2,
                restart_window: Duration::from_secs(60),
                stop_grace: Duration::from_millis(10),
            })
            .with_restart_options(RestartOptions {
                timeout,
                poll_interval: Duration::from_millis(10),
                probe_timeout: Duration::from_secs(1),
            })
            .build()
            .unwrap();
        Self {
            state,
            adapter,
            _tasks: tasks,
            _tmp: tmp,
        }
    }

    pub fn extensions_dir(&self) -> PathBuf {
        self.state.settings().extensions_dir.clone()
    }

    pub fn sources_dir(&self) -> PathBuf {
        self.state.settings().sources_dir.clone()
    }
}
