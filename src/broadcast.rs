//! Event fan-out: error broadcasting, tick listeners, snapshot streams
//!
//! Tick-internal failures never propagate out of the tick; they are
//! published here for adapters to forward. Listener callbacks run on the
//! tick worker and must return quickly; the shipping persistence listener
//! hands records to a background writer thread over a channel.

use std::fs::OpenOptions;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam::channel::{unbounded, Receiver, Sender};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::Result;
use crate::snapshot::Snapshot;

/// Events published by the tick worker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EngineEvent {
    SystemFailure { container_id: u64, tick: u64, system: String, error: String },
    AiFailure { container_id: u64, tick: u64, ai: String, error: String },
    CommandFailed { container_id: u64, tick: u64, command: String, error: String },
    TickOverrun { container_id: u64, tick: u64, dropped: u64 },
    BudgetWarning { container_id: u64, tick: u64, elapsed_ms: u64, budget_ms: u64 },
    ContainerPaused { container_id: u64, reason: String },
}

/// In-memory pub-sub for engine events.
///
/// Receivers dropped by subscribers are pruned on the next publish.
#[derive(Default)]
pub struct ErrorBroadcaster {
    subscribers: Vec<Sender<EngineEvent>>,
}

impl ErrorBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self) -> Receiver<EngineEvent> {
        let (tx, rx) = unbounded();
        self.subscribers.push(tx);
        rx
    }

    pub fn publish(&mut self, event: EngineEvent) {
        self.subscribers
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}

/// Post-tick notification payload
pub struct TickCompleted<'a> {
    pub container_id: u64,
    pub tick: u64,
    /// Snapshots of every cached match at this tick
    pub snapshots: &'a [Snapshot],
}

/// Called after every completed tick. Must not block the tick worker.
pub trait TickListener: Send {
    fn on_tick_completed(&mut self, event: &TickCompleted<'_>);
}

#[derive(Serialize, Deserialize)]
struct PersistRecord {
    container_id: u64,
    tick: u64,
    snapshot: Snapshot,
}

/// Durable snapshot sink: JSON lines appended by a background thread.
pub struct JsonlPersistence {
    tx: Option<Sender<PersistRecord>>,
    handle: Option<JoinHandle<()>>,
}

impl JsonlPersistence {
    /// Read back every snapshot persisted to `path`, in append order.
    ///
    /// A missing file is an empty history; malformed lines are skipped.
    /// Paths are per-container by convention, so no record filtering is
    /// applied here.
    pub fn read_snapshots(path: impl AsRef<Path>) -> Result<Vec<Snapshot>> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Vec::new());
        }

        let contents = std::fs::read_to_string(path)?;
        let mut snapshots = Vec::new();
        for line in contents.lines() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<PersistRecord>(line) {
                Ok(record) => snapshots.push(record.snapshot),
                Err(err) => warn!(%err, "skipping malformed persistence record"),
            }
        }
        Ok(snapshots)
    }

    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path.as_ref())?;
        let mut writer = BufWriter::new(file);

        let (tx, rx) = unbounded::<PersistRecord>();
        let handle = std::thread::Builder::new()
            .name("snapshot-persistence".to_string())
            .spawn(move || {
                for record in rx {
                    match serde_json::to_string(&record) {
                        Ok(line) => {
                            if writeln!(writer, "{line}").is_err() {
                                warn!("persistence write failed; stopping writer");
                                return;
                            }
                        }
                        Err(err) => warn!(%err, "snapshot serialization failed"),
                    }
                }
                let _ = writer.flush();
            })?;

        Ok(Self { tx: Some(tx), handle: Some(handle) })
    }
}

impl TickListener for JsonlPersistence {
    fn on_tick_completed(&mut self, event: &TickCompleted<'_>) {
        let Some(tx) = &self.tx else { return };
        for snapshot in event.snapshots {
            // Unbounded send never blocks the tick worker
            let _ = tx.send(PersistRecord {
                container_id: event.container_id,
                tick: event.tick,
                snapshot: snapshot.clone(),
            });
        }
    }
}

impl Drop for JsonlPersistence {
    fn drop(&mut self) {
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

struct Subscription {
    match_id: u64,
    player_id: Option<u64>,
    tx: Sender<Snapshot>,
    last_push: Option<Instant>,
}

/// Per-container snapshot streams.
///
/// Pushes are sampled at the broadcast interval during tick finalize; a
/// `refresh` forces an immediate out-of-band push. Dropping the receiver
/// cancels the subscription.
pub struct SnapshotSubscriptions {
    subscriptions: Vec<Subscription>,
    interval: Duration,
}

impl SnapshotSubscriptions {
    pub fn new(interval: Duration) -> Self {
        Self { subscriptions: Vec::new(), interval }
    }

    pub fn subscribe(&mut self, match_id: u64, player_id: Option<u64>) -> Receiver<Snapshot> {
        let (tx, rx) = unbounded();
        debug!(match_id, ?player_id, "snapshot subscription opened");
        self.subscriptions.push(Subscription {
            match_id,
            player_id,
            tx,
            last_push: None,
        });
        rx
    }

    pub fn has_subscribers(&self, match_id: u64) -> bool {
        self.subscriptions.iter().any(|s| s.match_id == match_id)
    }

    pub fn subscribed_matches(&self) -> Vec<u64> {
        let mut out: Vec<u64> = self.subscriptions.iter().map(|s| s.match_id).collect();
        out.sort_unstable();
        out.dedup();
        out
    }

    /// Interval-gated push; `provide` builds the (possibly player-scoped)
    /// snapshot for one subscription. Disconnected receivers are pruned.
    pub fn broadcast<F>(&mut self, now: Instant, mut provide: F)
    where
        F: FnMut(u64, Option<u64>) -> Option<Snapshot>,
    {
        let interval = self.interval;
        self.subscriptions.retain_mut(|sub| {
            let due = sub
                .last_push
                .map(|at| now.duration_since(at) >= interval)
                .unwrap_or(true);
            if !due {
                return true;
            }
            let Some(snapshot) = provide(sub.match_id, sub.player_id) else {
                return true;
            };
            sub.last_push = Some(now);
            sub.tx.send(snapshot).is_ok()
        });
    }

    /// Immediate out-of-band push for one match.
    pub fn refresh<F>(&mut self, match_id: u64, mut provide: F)
    where
        F: FnMut(u64, Option<u64>) -> Option<Snapshot>,
    {
        let now = Instant::now();
        self.subscriptions.retain_mut(|sub| {
            if sub.match_id != match_id {
                return true;
            }
            let Some(snapshot) = provide(sub.match_id, sub.player_id) else {
                return true;
            };
            sub.last_push = Some(now);
            sub.tx.send(snapshot).is_ok()
        });
    }

    pub fn remove_match(&mut self, match_id: u64) {
        self.subscriptions.retain(|s| s.match_id != match_id);
    }

    pub fn clear(&mut self) {
        self.subscriptions.clear();
    }

    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }
}
