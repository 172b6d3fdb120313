use anyhow::{anyhow, bail, Result};
use clap::Subcommand;
use hearth_core::{Operation, OperationKind, QueuedChangeSet};
use serde::Deserialize;
use serde_json::Value as JsonValue;

use super::client::HubClient;

#[derive(Subcommand, Clone)]
pub enum QueueCmd {
    /// Print the pending operations
    Show {
        /// Print raw JSON
        #[arg(long)]
        json: bool,
    },
    /// Run the pending operations now
    Apply,
    /// Drop the whole pending queue
    Discard,
    /// Drop one pending operation; the rest stay queued
    Remove {
        /// install, update, delete, tool_config or update_core
        kind: String,
        /// Extension or tool name; optional when only one operation of that kind is queued
        target: Option<String>,
    },
}

#[derive(Debug, Deserialize)]
struct QueueView {
    queue: Option<QueuedChangeSet>,
    apply_running: bool,
}

#[derive(Debug, Deserialize)]
struct Outcome {
    operation: Operation,
    ok: bool,
    #[serde(default)]
    error: Option<String>,
    duration_ms: u64,
}

#[derive(Debug, Deserialize)]
struct ApplySummary {
    ok: bool,
    partial: bool,
    outcomes: Vec<Outcome>,
    #[serde(default)]
    restarted: Vec<String>,
    #[serde(default)]
    stopped: Vec<String>,
    requeued: usize,
}

pub fn execute(client: &HubClient, cmd: QueueCmd) -> Result<()> {
    match cmd {
        QueueCmd::Show { json } => {
            if json {
                let raw: JsonValue = client.get("/queue")?;
                println!("{}", serde_json::to_string_pretty(&raw)?);
            } else {
                let view: QueueView = client.get("/queue")?;
                print!("{}", render_queue(&view));
            }
        }
        QueueCmd::Apply => {
            let summary: ApplySummary = client.post("/queue/apply", None)?;
            print!("{}", render_apply(&summary));
            if !summary.ok {
                bail!("{} operation(s) failed and were re-queued", summary.requeued);
            }
        }
        QueueCmd::Discard => {
            let body: JsonValue = client.delete("/queue")?;
            if body.get("deleted").and_then(JsonValue::as_bool).unwrap_or(false) {
                println!("queue discarded");
            } else {
                println!("nothing was queued");
            }
        }
        QueueCmd::Remove { kind, target } => {
            let kind = parse_kind(&kind)?;
            let view: QueueView = client.get("/queue")?;
            let queue = view.queue.ok_or_else(|| anyhow!("nothing is queued"))?;
            let op = find_operation(&queue.operations, kind, target.as_deref())?;
            let body = serde_json::to_value(op)?;
            let view: QueueView = client.post("/queue/remove", Some(&body))?;
            println!("removed {op}");
            print!("{}", render_queue(&view));
        }
    }
    Ok(())
}

/// Accepts `tool_config`, `tool-config` and any casing.
pub fn parse_kind(raw: &str) -> Result<OperationKind> {
    let normalized = raw.trim().to_ascii_lowercase().replace('-', "_");
    serde_json::from_value(JsonValue::String(normalized))
        .map_err(|_| anyhow!("unknown operation type '{raw}'"))
}

fn find_operation<'a>(
    ops: &'a [Operation],
    kind: OperationKind,
    target: Option<&str>,
) -> Result<&'a Operation> {
    let mut candidates = ops
        .iter()
        .filter(|op| op.kind() == kind)
        .filter(|op| target.is_none_or(|t| op.target() == t));
    match (candidates.next(), candidates.next()) {
        (Some(op), None) => Ok(op),
        (None, _) => bail!(
            "no queued {} operation{}",
            kind.as_str(),
            target.map(|t| format!(" for '{t}'")).unwrap_or_default()
        ),
        (Some(_), Some(_)) => bail!(
            "several {} operations are queued; name the target",
            kind.as_str()
        ),
    }
}

fn describe(op: &Operation) -> String {
    match op {
        Operation::Install { target, source } | Operation::Update { target, source } => {
            format!("{} {target} from {source}", op.kind().as_str())
        }
        Operation::ToolConfig { target, config: None } => format!("tool_config {target} (remove)"),
        Operation::UpdateCore { target_version } => format!("update_core to {target_version}"),
        other => other.to_string(),
    }
}

fn render_queue(view: &QueueView) -> String {
    let mut out = String::new();
    match &view.queue {
        None => out.push_str("no pending changes\n"),
        Some(queue) if queue.operations.is_empty() => out.push_str("no pending changes\n"),
        Some(queue) => {
            out.push_str(&format!(
                "{} pending operation(s), queued {}\n",
                queue.operations.len(),
                queue.created_at.format("%Y-%m-%d %H:%M:%S UTC")
            ));
            for (idx, op) in queue.operations.iter().enumerate() {
                out.push_str(&format!("  {}. {}\n", idx + 1, describe(op)));
            }
        }
    }
    if view.apply_running {
        out.push_str("an apply is running\n");
    }
    out
}

fn render_apply(summary: &ApplySummary) -> String {
    let mut out = String::new();
    for outcome in &summary.outcomes {
        let mark = if outcome.ok { "ok  " } else { "FAIL" };
        out.push_str(&format!(
            "{mark} {} ({} ms)",
            describe(&outcome.operation),
            outcome.duration_ms
        ));
        if let Some(err) = &outcome.error {
            out.push_str(&format!(": {err}"));
        }
        out.push('\n');
    }
    if !summary.restarted.is_empty() {
        out.push_str(&format!("restarted: {}\n", summary.restarted.join(", ")));
    }
    if !summary.stopped.is_empty() {
        out.push_str(&format!("stopped: {}\n", summary.stopped.join(", ")));
    }
    if summary.partial {
        out.push_str(&format!("{} operation(s) re-queued\n", summary.requeued));
    }
    out
}
