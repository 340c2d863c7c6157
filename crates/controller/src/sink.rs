//! Metrics sink: a bounded queue with a single writer task that batches
//! signal and log rows into the database.
//!
//! Producers never wait: a full queue drops the row with a warning. A failed
//! flush keeps its rows for the next attempt, up to `max_pending`, after
//! which the oldest rows are dropped.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::SinkConfig;
use crate::db::{Db, LogRow, SignalRow};

#[derive(Debug, Clone)]
pub enum SinkRow {
    Signal(SignalRow),
    Log(LogRow),
}

#[derive(Clone)]
pub struct MetricsSink {
    tx: mpsc::Sender<SinkRow>,
}

impl MetricsSink {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<SinkRow>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    pub fn record(&self, row: SinkRow) {
        match self.tx.try_send(row) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(category = "TelemetrySinkFault", "sink queue full, row dropped");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("sink writer gone, row dropped");
            }
        }
    }

    pub fn signal(&self, row: SignalRow) {
        self.record(SinkRow::Signal(row));
    }

    pub fn log(&self, row: LogRow) {
        self.record(SinkRow::Log(row));
    }
}

// ---------------------------------------------------------------------------
// Pending buffer
// ---------------------------------------------------------------------------

/// Rows waiting for a successful flush. Signals are shed before log rows
/// when the buffer is over capacity.
#[derive(Debug, Default)]
struct Pending {
    signals: VecDeque<SignalRow>,
    logs: VecDeque<LogRow>,
    max: usize,
    dropped: u64,
}

impl Pending {
    fn new(max: usize) -> Self {
        Self {
            max: max.max(1),
            ..Default::default()
        }
    }

    fn len(&self) -> usize {
        self.signals.len() + self.logs.len()
    }

    fn push(&mut self, row: SinkRow) {
        match row {
            SinkRow::Signal(s) => self.signals.push_back(s),
            SinkRow::Log(l) => self.logs.push_back(l),
        }
        while self.len() > self.max {
            if self.signals.pop_front().is_none() {
                self.logs.pop_front();
            }
            self.dropped += 1;
        }
    }

    fn clear(&mut self) {
        self.signals.clear();
        self.logs.clear();
    }
}

// ---------------------------------------------------------------------------
// Writer task
// ---------------------------------------------------------------------------

pub struct SinkHandle {
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl SinkHandle {
    /// Drain the queue, make a last flush attempt, and wait for the writer.
    pub async fn shutdown(self) {
        let _ = self.stop.send(());
        if let Err(e) = self.task.await {
            warn!(error = %e, "sink writer task failed");
        }
    }
}

pub fn spawn_writer(db: Db, rx: mpsc::Receiver<SinkRow>, cfg: SinkConfig) -> SinkHandle {
    let (stop, stop_rx) = oneshot::channel();
    let task = tokio::spawn(run_writer(db, rx, cfg, stop_rx));
    SinkHandle { stop, task }
}

async fn run_writer(
    db: Db,
    mut rx: mpsc::Receiver<SinkRow>,
    cfg: SinkConfig,
    mut stop: oneshot::Receiver<()>,
) {
    let mut pending = Pending::new(cfg.max_pending);
    let mut ticker = tokio::time::interval(Duration::from_millis(cfg.flush_interval_ms));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // After a failed flush, wait for the next interval before retrying.
    let mut backing_off = false;

    info!(batch = cfg.batch_size, interval_ms = cfg.flush_interval_ms, "sink writer started");

    loop {
        tokio::select! {
            row = rx.recv() => match row {
                Some(row) => {
                    pending.push(row);
                    if !backing_off && pending.len() >= cfg.batch_size {
                        backing_off = !flush(&db, &mut pending).await;
                    }
                }
                None => break,
            },
            _ = ticker.tick() => {
                if pending.len() > 0 {
                    backing_off = !flush(&db, &mut pending).await;
                }
            }
            _ = &mut stop => {
                while let Ok(row) = rx.try_recv() {
                    pending.push(row);
                }
                break;
            }
        }
    }

    if pending.len() > 0 {
        flush(&db, &mut pending).await;
    }
    if pending.dropped > 0 {
        warn!(dropped = pending.dropped, "sink dropped rows while the store was unavailable");
    }
    info!("sink writer stopped");
}

/// Returns whether the batch was written.
async fn flush(db: &Db, pending: &mut Pending) -> bool {
    let signals: Vec<SignalRow> = pending.signals.iter().cloned().collect();
    let logs: Vec<LogRow> = pending.logs.iter().cloned().collect();
    match db.insert_rows(&signals, &logs).await {
        Ok(()) => {
            debug!(signals = signals.len(), logs = logs.len(), "sink flushed");
            pending.clear();
            true
        }
        Err(e) => {
            warn!(
                category = "TelemetrySinkFault",
                pending = pending.len(),
                error = %format!("{e:#}"),
                "sink flush failed, keeping rows for retry"
            );
            false
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
