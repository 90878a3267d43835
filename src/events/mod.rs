//! Append-only per-task event log with live fan-out.
//!
//! Every event is durably appended to a newline-delimited JSON log before
//! `emit` returns; delivery to in-process subscribers is best-effort and
//! bounded by a deadline, so a stalled observer can never back-pressure the
//! orchestrator. `subscribe(from_seq)` replays the log from a sequence
//! number and then streams live events, which is how reconnecting observers
//! catch up. Log files are never rewritten; sequence numbers are monotone
//! per task starting at 0, and resumption continues the numbering.

use crate::phase::PhaseId;
use crate::task::TaskId;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, warn};

/// Default deadline for delivering an event to one subscriber.
pub const DEFAULT_SUBSCRIBER_DEADLINE: Duration = Duration::from_millis(100);

/// Closed event taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    PhaseChange,
    WorkerStarted,
    WorkerCompleted,
    WorkerFailed,
    Log,
    ContextUpdate,
    ValidationResult,
    HealAttempt,
    Completion,
}

/// One event on the per-task stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub seq: u64,
    pub task_id: TaskId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase_id: Option<PhaseId>,
    pub kind: EventKind,
    pub timestamp: DateTime<Utc>,
    pub payload: Value,
}

/// On-disk record; the task id is implied by the file.
#[derive(Debug, Serialize, Deserialize)]
struct LogRecord {
    seq: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    phase_id: Option<PhaseId>,
    kind: EventKind,
    ts: DateTime<Utc>,
    payload: Value,
}

struct Inner {
    next_seq: u64,
    file: File,
    subscribers: Vec<mpsc::Sender<Event>>,
}

/// Per-task append-only event bus.
pub struct EventBus {
    task_id: TaskId,
    path: PathBuf,
    subscriber_deadline: Duration,
    inner: Mutex<Inner>,
}

impl EventBus {
    /// Open (or reopen) the bus for a task. Sequence numbering continues
    /// from the existing log when one is present.
    pub fn open(events_dir: &Path, task_id: TaskId) -> Result<Self> {
        fs::create_dir_all(events_dir).with_context(|| {
            format!("Failed to create events directory {}", events_dir.display())
        })?;
        let path = events_dir.join(format!("{task_id}.log"));

        let next_seq = match read_records(&path) {
            Ok(records) => records.last().map(|r| r.seq + 1).unwrap_or(0),
            Err(_) => 0,
        };

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to open event log {}", path.display()))?;

        Ok(Self {
            task_id,
            path,
            subscriber_deadline: DEFAULT_SUBSCRIBER_DEADLINE,
            inner: Mutex::new(Inner {
                next_seq,
                file,
                subscribers: Vec::new(),
            }),
        })
    }

    /// Override the subscriber delivery deadline.
    pub fn with_subscriber_deadline(mut self, deadline: Duration) -> Self {
        self.subscriber_deadline = deadline;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append an event and fan it out. Returns after the durable append;
    /// subscribers that miss the delivery deadline are dropped, the append
    /// is preserved regardless.
    pub async fn emit(
        &self,
        kind: EventKind,
        phase_id: Option<PhaseId>,
        payload: Value,
    ) -> Result<Event> {
        let mut inner = self.inner.lock().await;

        let event = Event {
            seq: inner.next_seq,
            task_id: self.task_id.clone(),
            phase_id,
            kind,
            timestamp: Utc::now(),
            payload,
        };

        let record = LogRecord {
            seq: event.seq,
            phase_id: event.phase_id,
            kind: event.kind,
            ts: event.timestamp,
            payload: event.payload.clone(),
        };
        let mut line = serde_json::to_vec(&record).context("Failed to encode event")?;
        line.push(b'\n');
        inner
            .file
            .write_all(&line)
            .context("Failed to append event")?;
        inner.file.flush().context("Failed to flush event log")?;
        inner.next_seq += 1;

        // Fan out after the append is durable. Slow or closed subscribers
        // are removed; the log keeps the event for replay.
        let deadline = self.subscriber_deadline;
        let mut kept = Vec::with_capacity(inner.subscribers.len());
        for sender in inner.subscribers.drain(..) {
            let delivered = tokio::time::timeout(deadline, sender.send(event.clone())).await;
            match delivered {
                Ok(Ok(())) => kept.push(sender),
                Ok(Err(_)) => debug!("Dropping closed event subscriber"),
                Err(_) => warn!("Dropping event subscriber that missed the delivery deadline"),
            }
        }
        inner.subscribers = kept;

        Ok(event)
    }

    /// Read all events with `seq >= from_seq` from the log.
    pub fn replay(&self, from_seq: u64) -> Result<Vec<Event>> {
        let records = read_records(&self.path)?;
        Ok(records
            .into_iter()
            .filter(|r| r.seq >= from_seq)
            .map(|r| Event {
                seq: r.seq,
                task_id: self.task_id.clone(),
                phase_id: r.phase_id,
                kind: r.kind,
                timestamp: r.ts,
                payload: r.payload,
            })
            .collect())
    }

    /// Subscribe from a sequence number: replayed history first, then live
    /// events, with no gap between them.
    pub async fn subscribe(&self, from_seq: u64) -> Result<mpsc::Receiver<Event>> {
        // Holding the lock while replaying closes the window between the
        // log read and live registration.
        let mut inner = self.inner.lock().await;
        let history = self.replay(from_seq)?;

        let (tx, rx) = mpsc::channel(history.len() + 256);
        for event in history {
            // Capacity covers the full replay, so this cannot fail.
            let _ = tx.try_send(event);
        }
        inner.subscribers.push(tx);
        Ok(rx)
    }

    /// Number of live subscribers.
    pub async fn subscriber_count(&self) -> usize {
        self.inner.lock().await.subscribers.len()
    }
}

fn read_records(path: &Path) -> Result<Vec<LogRecord>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let mut records = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<LogRecord>(&line) {
            Ok(record) => records.push(record),
            // A torn final line from a crash mid-append is skipped.
            Err(err) => {
                warn!(error = %err, "Skipping unreadable event record");
            }
        }
    }
    Ok(records)
}
