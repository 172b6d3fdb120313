use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use hearth_events::Bus;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::broadcast;
use utoipa::ToSchema;

/// Lines kept per service.
pub const LOG_MAX_LINES: usize = 1000;

#[derive(Clone, Copy, Debug, Serialize, ToSchema, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogStream {
    Stdout,
    Stderr,
    /// Lines the hub writes itself (launch, exit, kill).
    Hub,
}

#[derive(Clone, Debug, Serialize, ToSchema)]
pub struct LogLine {
    pub seq: u64,
    pub time: DateTime<Utc>,
    pub stream: LogStream,
    pub line: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct ServiceLogLine {
    pub service: String,
    #[serde(flatten)]
    pub line: LogLine,
}

#[derive(Clone, Debug, Serialize, ToSchema)]
pub struct LogTail {
    pub service: String,
    pub lines: Vec<LogLine>,
    /// Pass back as `after` to continue from here.
    pub cursor: u64,
}

#[derive(Debug)]
struct LogBuffer {
    next_seq: u64,
    lines: VecDeque<LogLine>,
}

impl Default for LogBuffer {
    fn default() -> Self {
        Self {
            next_seq: 1,
            lines: VecDeque::new(),
        }
    }
}

impl LogBuffer {
    fn push(&mut self, stream: LogStream, line: String) -> LogLine {
        let entry = LogLine {
            seq: self.next_seq,
            time: Utc::now(),
            stream,
            line,
        };
        self.next_seq = self.next_seq.saturating_add(1);
        self.lines.push_back(entry.clone());
        while self.lines.len() > LOG_MAX_LINES {
            self.lines.pop_front();
        }
        entry
    }

    /// `after == 0` returns the most recent `limit` lines.
    fn tail_after(&self, after: u64, limit: usize) -> (Vec<LogLine>, u64) {
        if after == 0 {
            let start = self.lines.len().saturating_sub(limit);
            let out: Vec<LogLine> = self.lines.iter().skip(start).cloned().collect();
            let cursor = out.last().map(|l| l.seq).unwrap_or(0);
            return (out, cursor);
        }
        let out: Vec<LogLine> = self
            .lines
            .iter()
            .filter(|l| l.seq > after)
            .take(limit)
            .cloned()
            .collect();
        let cursor = out.last().map(|l| l.seq).unwrap_or(after);
        (out, cursor)
    }
}

/// Bounded per-service stdout/stderr capture with a live feed.
pub struct LogHub {
    buffers: Mutex<HashMap<String, LogBuffer>>,
    tx: broadcast::Sender<ServiceLogLine>,
    bus: Bus,
}

impl LogHub {
    pub fn new(bus: Bus) -> Self {
        let (tx, _rx) = broadcast::channel(512);
        Self {
            buffers: Mutex::new(HashMap::new()),
            tx,
            bus,
        }
    }

    pub fn push(&self, service: &str, stream: LogStream, line: impl Into<String>) {
        let entry = self
            .buffers
            .lock()
            .entry(service.to_string())
            .or_default()
            .push(stream, line.into());
        let event = ServiceLogLine {
            service: service.to_string(),
            line: entry,
        };
        self.bus.publish(hearth_topics::TOPIC_SERVICE_LOG, &event);
        let _ = self.tx.send(event);
    }

    pub fn tail(&self, service: &str, after: u64, limit: usize) -> LogTail {
        let limit = limit.clamp(1, LOG_MAX_LINES);
        let (lines, cursor) = self
            .buffers
            .lock()
            .get(service)
            .map(|buf| buf.tail_after(after, limit))
            .unwrap_or((Vec::new(), after));
        LogTail {
            service: service.to_string(),
            lines,
            cursor,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServiceLogLine> {
        self.tx.subscribe()
    }

    pub fn forget(&self, service: &str) {
        self.buffers.lock().remove(service);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_keeps_latest_lines_and_cursor_resumes() {
        let hub = LogHub::new(Bus::new(4));
        for i in 0..(LOG_MAX_LINES + 5) {
            hub.push("chef.api", LogStream::Stdout, format!("line {i}"));
        }
        let tail = hub.tail("chef.api", 0, 3);
        assert_eq!(tail.lines.len(), 3);
        assert_eq!(tail.lines[2].line, format!("line {}", LOG_MAX_LINES + 4));
        let cursor = tail.cursor;

        hub.push("chef.api", LogStream::Stderr, "boom");
        let next = hub.tail("chef.api", cursor, 50);
        assert_eq!(next.lines.len(), 1);
        assert_eq!(next.lines[0].stream, LogStream::Stderr);
        assert_eq!(next.cursor, cursor + 1);

        // Oldest lines were evicted.
        let all = hub.tail("chef.api", 1, LOG_MAX_LINES);
        assert_eq!(all.lines.len(), LOG_MAX_LINES);
        assert_eq!(all.lines[0].seq, 7);
    }

    #[test]
    fn unknown_service_has_empty_tail() {
        let hub = LogHub::new(Bus::new(4));
        let tail = hub.tail("nope", 12, 10);
        assert!(tail.lines.is_empty());
        assert_eq!(tail.cursor, 12);
    }
}
