use std::io::{self, BufRead, Write};
use std::thread;
use std::time::Duration;

use anyhow::{bail, Result};
use clap::{Args, ValueEnum};
use serde::Deserialize;

use super::client::{failure_status, HubClient};

const RESTART_PATH: &str = "/system/restart";
const KEEP_WAITING_PATH: &str = "/system/restart/keep-waiting";
const FORCE_RELOAD_PATH: &str = "/system/restart/force-reload";

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum OnTimeout {
    /// Extend the health wait
    Wait,
    /// Give up waiting and reload anyway
    Force,
    /// Prompt on stdin
    Ask,
}

#[derive(Args, Clone)]
pub struct RestartArgs {
    /// What to do when services do not become healthy in time
    #[arg(long, value_enum, default_value_t = OnTimeout::Ask)]
    pub on_timeout: OnTimeout,
    /// Poll interval in milliseconds
    #[arg(long, default_value_t = 500)]
    pub poll_ms: u64,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Decision {
    KeepWaiting,
    ForceReload,
}

#[derive(Debug, Deserialize)]
struct JobView {
    id: String,
    phase: String,
    message: String,
    enabled_services: usize,
    running_services: usize,
    #[serde(default)]
    error: Option<String>,
}

pub fn run(client: &HubClient, args: &RestartArgs) -> Result<()> {
    let mut job: JobView = match client.post(RESTART_PATH, None) {
        Ok(job) => job,
        Err(err) if failure_status(&err) == Some(409) => {
            eprintln!("a restart is already running; following it");
            client.get(RESTART_PATH)?
        }
        Err(err) => return Err(err),
    };
    println!("restart {} started", job.id);

    let poll = Duration::from_millis(args.poll_ms.max(50));
    let mut shown = String::new();
    loop {
        let line = render_progress(&job);
        if line != shown {
            println!("{line}");
            shown = line;
        }
        match job.phase.as_str() {
            "completed" => {
                println!("restart completed");
                return Ok(());
            }
            "forced" => {
                println!("reload forced; some services may still be starting");
                return Ok(());
            }
            "failed" => bail!(
                "restart failed: {}",
                job.error.as_deref().unwrap_or(&job.message)
            ),
            "timed_out" => {
                let decision = decide(args.on_timeout, prompt)?;
                let path = match decision {
                    Decision::KeepWaiting => KEEP_WAITING_PATH,
                    Decision::ForceReload => FORCE_RELOAD_PATH,
                };
                job = match client.post(path, None) {
                    Ok(job) => job,
                    // The job moved on before the decision landed.
                    Err(err) if failure_status(&err) == Some(409) => client.get(RESTART_PATH)?,
                    Err(err) => return Err(err),
                };
                continue;
            }
            _ => {}
        }
        thread::sleep(poll);
        job = client.get(RESTART_PATH)?;
    }
}

fn render_progress(job: &JobView) -> String {
    format!(
        "[{}] {} ({}/{} running)",
        job.phase, job.message, job.running_services, job.enabled_services
    )
}

/// Resolve the timeout policy; `ask` defers to `answer`.
pub fn decide(policy: OnTimeout, answer: impl FnOnce() -> Result<String>) -> Result<Decision> {
    match policy {
        OnTimeout::Wait => Ok(Decision::KeepWaiting),
        OnTimeout::Force => Ok(Decision::ForceReload),
        OnTimeout::Ask => parse_answer(&answer()?),
    }
}

fn parse_answer(raw: &str) -> Result<Decision> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "" | "w" | "wait" => Ok(Decision::KeepWaiting),
        "f" | "force" => Ok(Decision::ForceReload),
        other => bail!("expected 'wait' or 'force', got '{other}'"),
    }
}

fn prompt() -> Result<String> {
    print!("services are not healthy yet: keep [w]aiting or [f]orce reload? [w] ");
    io::stdout().flush()?;
    let mut line = String::new();
    if io::stdin().lock().read_line(&mut line)? == 0 {
        bail!("no answer on stdin; pass --on-timeout wait or --on-timeout force");
    }
    Ok(line)
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use serde_json::json;

    fn job(phase: &str) -> serde_json::Value {
        json!({
            "id": "r-1",
            "phase": phase,
            "message": "working",
            "started_at": "2026-03-01T10:00:00Z",
            "updated_at": "2026-03-01T10:00:00Z",
            "choices": [],
            "enabled_services": 2,
            "running_services": 1
        })
    }

    #[test]
    fn fixed_policies_ignore_the_prompt() {
        let never = || -> Result<String> { panic!("prompted") };
        assert_eq!(decide(OnTimeout::Wait, never).unwrap(), Decision::KeepWaiting);
        assert_eq!(decide(OnTimeout::Force, never).unwrap(), Decision::ForceReload);
    }

    #[test]
    fn ask_reads_the_answer() {
        assert_eq!(
            decide(OnTimeout::Ask, || Ok("F\n".into())).unwrap(),
            Decision::ForceReload
        );
        assert_eq!(
            decide(OnTimeout::Ask, || Ok("\n".into())).unwrap(),
            Decision::KeepWaiting
        );
        assert!(decide(OnTimeout::Ask, || Ok("maybe".into())).is_err());
    }

    #[test]
    fn timed_out_job_is_forced_when_asked_to() {
        let server = MockServer::start();
        let begin = server.mock(|when, then| {
            when.method(POST).path(RESTART_PATH);
            then.status(202).json_body(job("timed_out"));
        });
        let force = server.mock(|when, then| {
            when.method(POST).path(FORCE_RELOAD_PATH);
            then.status(200).json_body(job("forced"));
        });
        let client = HubClient::new(&server.base_url(), None, Duration::from_secs(5)).unwrap();
        let args = RestartArgs {
            on_timeout: OnTimeout::Force,
            poll_ms: 50,
        };
        run(&client, &args).unwrap();
        begin.assert();
        force.assert();
    }

    #[test]
    fn failed_job_is_an_error() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path(RESTART_PATH);
            then.status(202).json_body(json!({
                "id": "r-2",
                "phase": "failed",
                "message": "restart failed",
                "enabled_services": 0,
                "running_services": 0,
                "error": "apply failed: disk full"
            }));
        });
        let client = HubClient::new(&server.base_url(), None, Duration::from_secs(5)).unwrap();
        let args = RestartArgs {
            on_timeout: OnTimeout::Wait,
            poll_ms: 50,
        };
        let err = run(&client, &args).unwrap_err();
        assert!(err.to_string().contains("disk full"));
    }
}
