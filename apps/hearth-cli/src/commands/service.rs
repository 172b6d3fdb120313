use std::thread;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use clap::Subcommand;
use hearth_runtime::ServiceRecord;
use serde::Deserialize;

use super::client::HubClient;

#[derive(Subcommand, Clone)]
pub enum ServiceCmd {
    /// Start a stopped or failed service
    Start { id: String },
    /// Stop a service and keep it stopped
    Stop { id: String },
    /// Stop then start a service
    Restart { id: String },
    /// Clear a service's restart budget
    Reset { id: String },
    /// Print buffered output of a service
    Logs {
        id: String,
        /// Only lines after this sequence number
        #[arg(long)]
        after: Option<u64>,
        /// Maximum lines to print
        #[arg(long)]
        limit: Option<usize>,
        /// Keep polling for new lines
        #[arg(long, short)]
        follow: bool,
    },
}

#[derive(Debug, Deserialize)]
struct LogLine {
    seq: u64,
    time: DateTime<Utc>,
    stream: String,
    line: String,
}

#[derive(Debug, Deserialize)]
struct LogTail {
    lines: Vec<LogLine>,
    cursor: u64,
}

const FOLLOW_INTERVAL: Duration = Duration::from_secs(1);

pub fn execute(client: &HubClient, cmd: ServiceCmd) -> Result<()> {
    let (action, id) = match cmd {
        ServiceCmd::Start { id } => ("start", id),
        ServiceCmd::Stop { id } => ("stop", id),
        ServiceCmd::Restart { id } => ("restart", id),
        ServiceCmd::Reset { id } => ("reset", id),
        ServiceCmd::Logs {
            id,
            after,
            limit,
            follow,
        } => return logs(client, &id, after, limit, follow),
    };
    let record: ServiceRecord = client.post(&format!("/services/{id}/{action}"), None)?;
    println!("{}", render_record(&record));
    Ok(())
}

fn render_record(record: &ServiceRecord) -> String {
    let mut out = format!("{}: {}", record.id, record.state.as_str());
    if let Some(port) = record.port {
        out.push_str(&format!(" on port {port}"));
    }
    if let Some(budget) = &record.restart_budget {
        out.push_str(&format!(" ({} restart(s) left)", budget.remaining));
    }
    if !record.summary.is_empty() {
        out.push_str(&format!(" - {}", record.summary));
    }
    out
}

fn logs(
    client: &HubClient,
    id: &str,
    after: Option<u64>,
    limit: Option<usize>,
    follow: bool,
) -> Result<()> {
    let path = format!("/services/{id}/logs");
    let mut cursor = after;
    loop {
        let mut query = Vec::new();
        if let Some(after) = cursor {
            query.push(("after", after.to_string()));
        }
        if let Some(limit) = limit {
            query.push(("limit", limit.to_string()));
        }
        let tail: LogTail = client.get_query(&path, &query)?;
        for line in &tail.lines {
            println!("{}", render_line(line));
        }
        if !follow {
            return Ok(());
        }
        cursor = Some(tail.cursor);
        thread::sleep(FOLLOW_INTERVAL);
    }
}

fn render_line(line: &LogLine) -> String {
    format!(
        "{:>6} {} {:<6} {}",
        line.seq,
        line.time.format("%H:%M:%S%.3f"),
        line.stream,
        line.line
    )
}
