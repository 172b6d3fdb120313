use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use hearth_runtime::{AdapterError, HealthReport, ServiceAdapter, ServiceHandle, ServiceSpec};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::logs::{LogHub, LogStream};

struct ProcessInstance {
    instance: u64,
    child: Mutex<Child>,
    #[cfg_attr(not(unix), allow(dead_code))]
    pid: Option<u32>,
    started_at: Instant,
}

/// Runs services as local child processes.
pub struct ProcessAdapter {
    client: reqwest::Client,
    processes: RwLock<HashMap<String, Arc<ProcessInstance>>>,
    logs: Arc<LogHub>,
}

impl ProcessAdapter {
    pub fn new(logs: Arc<LogHub>) -> Result<Arc<Self>, AdapterError> {
        let client = reqwest::Client::builder()
            .no_proxy()
            .build()
            .map_err(|err| AdapterError::InvalidConfig(err.to_string()))?;
        Ok(Arc::new(Self {
            client,
            processes: RwLock::new(HashMap::new()),
            logs,
        }))
    }

    async fn probe_http(&self, url: &str, spec: &ServiceSpec) -> Result<HealthReport, AdapterError> {
        let Some(check) = spec.health.as_ref() else {
            return Err(AdapterError::InvalidConfig("no health check declared".into()));
        };
        let resp = self
            .client
            .get(url)
            .timeout(check.timeout())
            .send()
            .await
            .map_err(|err| AdapterError::Unavailable(format!("health request error: {err}")))?;
        let status = resp.status().as_u16();
        if status == check.expect_status {
            Ok(HealthReport::ok(format!("HTTP {status} {url}")))
        } else {
            Err(AdapterError::Unavailable(format!(
                "health check failed: HTTP {status} {url} (expected {})",
                check.expect_status
            )))
        }
    }

    fn pump<R>(&self, id: String, stream: LogStream, reader: R)
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let logs = self.logs.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(reader).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                logs.push(&id, stream, line);
            }
        });
    }
}

#[cfg(unix)]
fn signal_group(pid: Option<u32>, signal: i32) -> bool {
    let Some(pid) = pid else { return false };
    // Children run in their own session, so the pid is also the process group id.
    unsafe { libc::kill(-(pid as i32), signal) == 0 }
}

#[async_trait]
impl ServiceAdapter for ProcessAdapter {
    fn id(&self) -> &'static str {
        "process"
    }

    async fn launch(&self, spec: &ServiceSpec, instance: u64) -> Result<ServiceHandle, AdapterError> {
        if spec.command.trim().is_empty() {
            return Err(AdapterError::InvalidConfig(format!("{}: empty command", spec.id)));
        }
        let mut cmd = Command::new(&spec.command);
        cmd.args(&spec.args)
            .envs(&spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = spec.workdir.as_ref() {
            cmd.current_dir(dir);
        }
        #[cfg(unix)]
        unsafe {
            cmd.pre_exec(|| {
                if libc::setsid() == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let mut child = cmd
            .spawn()
            .map_err(|err| AdapterError::Launch(format!("{}: {err}", spec.command)))?;
        let pid = child.id();
        if let Some(out) = child.stdout.take() {
            self.pump(spec.id.clone(), LogStream::Stdout, out);
        }
        if let Some(err) = child.stderr.take() {
            self.pump(spec.id.clone(), LogStream::Stderr, err);
        }
        self.logs.push(
            &spec.id,
            LogStream::Hub,
            format!(
                "launched `{}` pid={} port={}",
                spec.command,
                pid.map(|p| p.to_string()).unwrap_or_else(|| "?".into()),
                spec.port.map(|p| p.to_string()).unwrap_or_else(|| "-".into())
            ),
        );
        info!(target: "hearth::supervisor", service = %spec.id, ?pid, instance, "process launched");

        let previous = self.processes.write().await.insert(
            spec.id.clone(),
            Arc::new(ProcessInstance {
                instance,
                child: Mutex::new(child),
                pid,
                started_at: Instant::now(),
            }),
        );
        if let Some(previous) = previous {
            warn!(
                target: "hearth::supervisor",
                service = %spec.id,
                instance = previous.instance,
                "replacing still-tracked process; killing it"
            );
            let _ = previous.child.lock().await.start_kill();
        }
        Ok(ServiceHandle {
            id: spec.id.clone(),
            pid,
            instance,
        })
    }

    async fn shutdown(&self, handle: &ServiceHandle, grace: Duration) -> Result<(), AdapterError> {
        let tracked = {
            let mut guard = self.processes.write().await;
            match guard.get(&handle.id) {
                Some(existing) if existing.instance == handle.instance => guard.remove(&handle.id),
                _ => None,
            }
        };
        let Some(process) = tracked else {
            debug!(
                target: "hearth::supervisor",
                service = %handle.id,
                instance = handle.instance,
                "no tracked process to stop (adopted or already gone)"
            );
            return Ok(());
        };
        let mut child = process.child.lock().await;
        if let Ok(Some(status)) = child.try_wait() {
            self.logs
                .push(&handle.id, LogStream::Hub, format!("process already exited: {status}"));
            return Ok(());
        }

        #[cfg(unix)]
        let graceful = signal_group(process.pid, libc::SIGTERM);
        #[cfg(not(unix))]
        let graceful = false;

        if graceful {
            if let Ok(Ok(status)) = tokio::time::timeout(grace, child.wait()).await {
                self.logs
                    .push(&handle.id, LogStream::Hub, format!("stopped: {status}"));
                return Ok(());
            }
            warn!(target: "hearth::supervisor", service = %handle.id, ?grace, "grace period elapsed; killing");
        }
        #[cfg(unix)]
        signal_group(process.pid, libc::SIGKILL);
        child
            .start_kill()
            .or_else(|err| {
                // Already reaped counts as stopped.
                if err.kind() == std::io::ErrorKind::InvalidInput {
                    Ok(())
                } else {
                    Err(err)
                }
            })
            .map_err(|err| AdapterError::Io(err.to_string()))?;
        let status = child
            .wait()
            .await
            .map_err(|err| AdapterError::Io(err.to_string()))?;
        self.logs
            .push(&handle.id, LogStream::Hub, format!("killed: {status}"));
        Ok(())
    }

    async fn health(&self, handle: &ServiceHandle, spec: &ServiceSpec) -> Result<HealthReport, AdapterError> {
        let tracked = self
            .processes
            .read()
            .await
            .get(&handle.id)
            .filter(|p| p.instance == handle.instance)
            .cloned();
        if let Some(process) = tracked.as_ref() {
            let mut child = process.child.lock().await;
            if let Some(status) = child
                .try_wait()
                .map_err(|err| AdapterError::Io(err.to_string()))?
            {
                return Err(AdapterError::Unavailable(format!(
                    "process exited with status {status}"
                )));
            }
        }
        if let Some(url) = spec.health_url() {
            return self.probe_http(&url, spec).await;
        }
        match tracked {
            Some(process) => Ok(HealthReport::ok(format!(
                "process alive, uptime {}s",
                process.started_at.elapsed().as_secs()
            ))),
            None => Err(AdapterError::Unavailable(format!(
                "no process tracked for {}",
                handle.id
            ))),
        }
    }

    async fn adopt(&self, spec: &ServiceSpec, instance: u64) -> Result<Option<ServiceHandle>, AdapterError> {
        let Some(url) = spec.health_url() else {
            return Ok(None);
        };
        match self.probe_http(&url, spec).await {
            Ok(_) => {
                self.logs.push(
                    &spec.id,
                    LogStream::Hub,
                    format!("adopted running instance answering on {url}"),
                );
                Ok(Some(ServiceHandle {
                    id: spec.id.clone(),
                    pid: None,
                    instance,
                }))
            }
            Err(_) => Ok(None),
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use hearth_events::Bus;
    use std::collections::BTreeMap;

    fn shell_spec(id: &str, script: &str) -> ServiceSpec {
        ServiceSpec {
            id: id.into(),
            kind: hearth_runtime::ServiceKind::Core,
            owner: "core".into(),
            command: "sh".into(),
            args: vec!["-c".into(), script.into()],
            env: BTreeMap::new(),
            workdir: None,
            port: None,
            health: None,
        }
    }

    #[tokio::test]
    async fn liveness_tracks_process_and_logs_are_captured() {
        let logs = Arc::new(LogHub::new(Bus::new(16)));
        let adapter = ProcessAdapter::new(logs.clone()).unwrap();
        let spec = shell_spec("echo", "echo hello; sleep 30");
        let handle = adapter.launch(&spec, 1).await.unwrap();
        assert!(handle.pid.is_some());
        assert!(adapter.health(&handle, &spec).await.is_ok());

        let mut seen = false;
        for _ in 0..50 {
            if logs.tail("echo", 0, 10).lines.iter().any(|l| l.line == "hello") {
                seen = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(seen, "stdout line captured");

        adapter
            .shutdown(&handle, Duration::from_secs(2))
            .await
            .unwrap();
        assert!(adapter.health(&handle, &spec).await.is_err());
    }

    #[tokio::test]
    async fn exited_process_is_unhealthy() {
        let logs = Arc::new(LogHub::new(Bus::new(16)));
        let adapter = ProcessAdapter::new(logs).unwrap();
        let spec = shell_spec("quick", "exit 3");
        let handle = adapter.launch(&spec, 1).await.unwrap();
        let mut unhealthy = false;
        for _ in 0..50 {
            if adapter.health(&handle, &spec).await.is_err() {
                unhealthy = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(unhealthy);
    }

    #[tokio::test]
    async fn missing_command_fails_to_launch() {
        let logs = Arc::new(LogHub::new(Bus::new(16)));
        let adapter = ProcessAdapter::new(logs).unwrap();
        let mut spec = shell_spec("ghost", "");
        spec.command = "/definitely/not/a/binary".into();
        assert!(matches!(
            adapter.launch(&spec, 1).await,
            Err(AdapterError::Launch(_))
        ));
    }
}
