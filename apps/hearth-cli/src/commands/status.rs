use anyhow::Result;
use clap::Args;
use hearth_runtime::{ServiceRecord, SupervisorSnapshot};
use serde::{Deserialize, Serialize};

use super::client::HubClient;

#[derive(Args, Clone)]
pub struct StatusArgs {
    /// Print raw JSON instead of a table
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Healthz {
    pub ok: bool,
    pub all_running: bool,
    pub services: usize,
    pub running: usize,
    pub failed: usize,
}

pub fn run(client: &HubClient, args: &StatusArgs) -> Result<()> {
    let health: Healthz = client.get("/healthz")?;
    let snapshot: SupervisorSnapshot = client.get("/services")?;
    if args.json {
        let payload = serde_json::json!({
            "base": client.base(),
            "health": health,
            "services": snapshot.services,
        });
        println!("{}", serde_json::to_string_pretty(&payload)?);
        return Ok(());
    }
    print!("{}", render(&health, &snapshot.services));
    Ok(())
}

fn dash<T: ToString>(value: Option<T>) -> String {
    value.map(|v| v.to_string()).unwrap_or_else(|| "-".into())
}

pub fn render(health: &Healthz, services: &[ServiceRecord]) -> String {
    let mut out = format!(
        "{} running, {} failed, {} total{}\n",
        health.running,
        health.failed,
        health.services,
        if health.all_running {
            ""
        } else {
            " (not all enabled services are up)"
        }
    );
    if services.is_empty() {
        out.push_str("no services declared\n");
        return out;
    }
    let width = services
        .iter()
        .map(|s| s.id.len())
        .max()
        .unwrap_or(0)
        .max("SERVICE".len());
    out.push_str(&format!(
        "{:<width$}  {:<10}  {:>5}  {:>7}  {:>8}  SUMMARY\n",
        "SERVICE", "STATE", "PORT", "PID", "RESTARTS"
    ));
    for s in services {
        let state = if s.enabled {
            s.state.as_str().to_string()
        } else {
            format!("{}*", s.state.as_str())
        };
        out.push_str(&format!(
            "{:<width$}  {:<10}  {:>5}  {:>7}  {:>8}  {}\n",
            s.id,
            state,
            dash(s.port),
            dash(s.pid),
            s.restart_count,
            s.summary
        ));
    }
    if services.iter().any(|s| !s.enabled) {
        out.push_str("* disabled\n");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(id: &str, state: &str, port: Option<u16>, enabled: bool) -> ServiceRecord {
        serde_json::from_value(json!({
            "id": id,
            "kind": "extension_service",
            "owner": "chef",
            "state": state,
            "enabled": enabled,
            "pid": null,
            "port": port,
            "restart_count": 1,
            "summary": "ok",
            "updated_at": "2026-01-01T00:00:00Z"
        }))
        .unwrap()
    }

    #[test]
    fn table_lists_each_service_with_placeholders() {
        let health = Healthz {
            ok: true,
            all_running: false,
            services: 2,
            running: 1,
            failed: 0,
        };
        let services = vec![
            record("chef.api", "running", Some(5300), true),
            record("chef.worker", "stopped", None, false),
        ];
        let text = render(&health, &services);
        assert!(text.starts_with("1 running, 0 failed, 2 total (not all"));
        let api = text.lines().find(|l| l.starts_with("chef.api")).unwrap();
        assert!(api.contains("running"));
        assert!(api.contains("5300"));
        let worker = text.lines().find(|l| l.starts_with("chef.worker")).unwrap();
        assert!(worker.contains("stopped*"));
        assert!(worker.contains(" - "));
        assert!(text.ends_with("* disabled\n"));
    }
}
