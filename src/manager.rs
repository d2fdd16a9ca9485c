//! Container manager: the node-wide `id -> container` map
//!
//! Containers do not share state; external I/O threads serialize into a
//! container through its coarse lock. Auto-advance runs on a per-container
//! timer thread against a monotonic deadline: a tick overrunning its
//! interval fires the next tick immediately (at most one tick owed), and
//! deeper overruns drop ticks and record an overrun metric.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use ahash::AHashMap;
use crossbeam::channel::{bounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::broadcast::EngineEvent;
use crate::config::{ContainerConfig, EngineConfig};
use crate::container::{ContainerState, ContainerStats, ExecutionContainer};
use crate::error::{EngineError, Result};
use crate::module::{AiFactory, ModuleFactory, PluginCatalog};
use crate::snapshot::Snapshot;

struct PlayTimer {
    stop_tx: Sender<()>,
    handle: JoinHandle<()>,
}

struct ContainerHandle {
    container: Arc<Mutex<ExecutionContainer>>,
    timer: Mutex<Option<PlayTimer>>,
}

/// Owns all containers on this node.
pub struct ContainerManager {
    containers: RwLock<AHashMap<u64, Arc<ContainerHandle>>>,
    catalog: RwLock<PluginCatalog>,
    next_id: AtomicU64,
    engine_config: EngineConfig,
}

impl ContainerManager {
    pub fn new(engine_config: EngineConfig) -> Self {
        Self {
            containers: RwLock::new(AHashMap::new()),
            catalog: RwLock::new(PluginCatalog::new()),
            next_id: AtomicU64::new(1),
            engine_config,
        }
    }

    pub fn engine_config(&self) -> &EngineConfig {
        &self.engine_config
    }

    // ========== Plugin catalog ==========

    pub fn register_module(&self, name: impl Into<String>, factory: ModuleFactory) {
        self.catalog.write().register_module(name, factory);
    }

    pub fn register_ai(&self, name: impl Into<String>, factory: AiFactory) {
        self.catalog.write().register_ai(name, factory);
    }

    pub fn available_modules(&self) -> Vec<String> {
        self.catalog.read().module_names()
    }

    pub fn available_ais(&self) -> Vec<String> {
        self.catalog.read().ai_names()
    }

    // ========== Container lifecycle ==========

    pub fn create_container(&self, config: ContainerConfig) -> Result<u64> {
        config.validate()?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let container = ExecutionContainer::new(id, config)?;
        let handle = Arc::new(ContainerHandle {
            container: Arc::new(Mutex::new(container)),
            timer: Mutex::new(None),
        });
        self.containers.write().insert(id, handle);
        info!(container_id = id, "container created");
        Ok(id)
    }

    fn handle(&self, id: u64) -> Result<Arc<ContainerHandle>> {
        self.containers
            .read()
            .get(&id)
            .cloned()
            .ok_or(EngineError::ContainerNotFound(id))
    }

    /// Serialize an operation into a container through its coarse lock.
    pub fn with_container<R>(
        &self,
        id: u64,
        f: impl FnOnce(&mut ExecutionContainer) -> R,
    ) -> Result<R> {
        let handle = self.handle(id)?;
        let mut container = handle.container.lock();
        Ok(f(&mut container))
    }

    pub fn start(&self, id: u64) -> Result<()> {
        let handle = self.handle(id)?;
        let catalog = self.catalog.read().clone();
        let result = handle.container.lock().start(&catalog);
        result
    }

    pub fn advance(&self, id: u64) -> Result<()> {
        self.with_container(id, ExecutionContainer::advance)?
    }

    pub fn pause(&self, id: u64) -> Result<()> {
        self.with_container(id, ExecutionContainer::pause)?
    }

    pub fn resume(&self, id: u64) -> Result<()> {
        self.with_container(id, ExecutionContainer::resume)?
    }

    /// Install the auto-advance timer and transition to Playing.
    pub fn play(&self, id: u64, interval_ms: u64) -> Result<()> {
        let handle = self.handle(id)?;
        handle.container.lock().set_playing()?;

        let mut timer = handle.timer.lock();
        // Re-playing with a new interval restarts the worker
        stop_timer(&mut timer);

        let interval = Duration::from_millis(interval_ms.max(1));
        let (stop_tx, stop_rx) = bounded(1);
        let container = Arc::clone(&handle.container);
        let thread = std::thread::Builder::new()
            .name(format!("container-{id}-play"))
            .spawn(move || play_loop(container, interval, stop_rx))?;

        *timer = Some(PlayTimer { stop_tx, handle: thread });
        debug!(container_id = id, interval_ms, "auto-advance installed");
        Ok(())
    }

    /// Cancel the timer and transition Playing -> Running.
    pub fn stop_auto(&self, id: u64) -> Result<()> {
        let handle = self.handle(id)?;
        stop_timer(&mut handle.timer.lock());
        let result = handle.container.lock().stop_auto();
        result
    }

    /// Orderly teardown; any in-flight tick finishes first (the lock
    /// serializes us behind it).
    pub fn stop(&self, id: u64) -> Result<()> {
        let handle = self.handle(id)?;
        stop_timer(&mut handle.timer.lock());
        let result = handle.container.lock().stop();
        result
    }

    /// Drop a stopped container entirely.
    pub fn delete(&self, id: u64) -> Result<()> {
        let handle = self.handle(id)?;
        {
            let container = handle.container.lock();
            if container.state() != ContainerState::Stopped {
                return Err(EngineError::InvalidLifecycleTransition {
                    from: container.state(),
                    to: ContainerState::Stopped,
                });
            }
        }
        stop_timer(&mut handle.timer.lock());
        self.containers.write().remove(&id);
        info!(container_id = id, "container deleted");
        Ok(())
    }

    /// Attach the JSONL persistence listener to a container.
    ///
    /// When the container's `auto_restore` flag is set, snapshots already
    /// persisted at `path` are loaded back into its history ring first
    /// (fast-forwarding the tick counter past them), so deltas can span a
    /// restart. Paths are per-container by convention.
    pub fn enable_persistence(&self, id: u64, path: impl AsRef<std::path::Path>) -> Result<()> {
        let path = path.as_ref();
        let handle = self.handle(id)?;

        {
            let mut container = handle.container.lock();
            if container.config().auto_restore {
                let snapshots = crate::broadcast::JsonlPersistence::read_snapshots(path)?;
                let restored = snapshots.len();
                for snapshot in snapshots {
                    container.restore_history(snapshot);
                }
                if restored > 0 {
                    info!(container_id = id, restored, "persisted history restored");
                }
            }
        }

        let listener = crate::broadcast::JsonlPersistence::create(path)?;
        handle.container.lock().add_tick_listener(Box::new(listener));
        Ok(())
    }

    /// Hot-reload plugins into a quiesced container.
    pub fn reload_plugins(&self, id: u64) -> Result<()> {
        let handle = self.handle(id)?;
        let catalog = self.catalog.read().clone();
        let result = handle.container.lock().reload_plugins(&catalog);
        result
    }

    // ========== Introspection ==========

    pub fn contains(&self, id: u64) -> bool {
        self.containers.read().contains_key(&id)
    }

    pub fn stats(&self, id: u64) -> Result<ContainerStats> {
        self.with_container(id, |c| c.stats())
    }

    pub fn list(&self) -> Vec<ContainerStats> {
        let handles: Vec<Arc<ContainerHandle>> =
            self.containers.read().values().cloned().collect();
        let mut out: Vec<ContainerStats> = handles
            .iter()
            .map(|handle| handle.container.lock().stats())
            .collect();
        out.sort_by_key(|stats| stats.id);
        out
    }

    pub fn len(&self) -> usize {
        self.containers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.containers.read().is_empty()
    }

    // ========== Streams ==========

    /// Snapshot stream for (container, match), optionally player-scoped.
    pub fn subscribe(
        &self,
        container_id: u64,
        match_id: u64,
        player_id: Option<u64>,
    ) -> Result<Receiver<Snapshot>> {
        self.with_container(container_id, |c| c.subscribe(match_id, player_id))?
    }

    /// Out-of-band push to every subscriber of a match.
    pub fn refresh(&self, container_id: u64, match_id: u64) -> Result<()> {
        self.with_container(container_id, |c| c.refresh_subscribers(match_id))?
    }

    pub fn subscribe_errors(&self, container_id: u64) -> Result<Receiver<EngineEvent>> {
        self.with_container(container_id, |c| c.subscribe_errors())
    }
}

impl Drop for ContainerManager {
    fn drop(&mut self) {
        let handles: Vec<Arc<ContainerHandle>> =
            self.containers.get_mut().values().cloned().collect();
        for handle in handles {
            stop_timer(&mut handle.timer.lock());
        }
    }
}

fn stop_timer(slot: &mut Option<PlayTimer>) {
    if let Some(timer) = slot.take() {
        let _ = timer.stop_tx.send(());
        let _ = timer.handle.join();
    }
}

/// Auto-advance worker: fixed-interval deadlines on a monotonic clock.
fn play_loop(
    container: Arc<Mutex<ExecutionContainer>>,
    interval: Duration,
    stop_rx: Receiver<()>,
) {
    let mut next_deadline = Instant::now() + interval;

    loop {
        let timeout = next_deadline.saturating_duration_since(Instant::now());
        match stop_rx.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
            Err(RecvTimeoutError::Timeout) => {}
        }

        let mut c = container.lock();
        match c.state() {
            ContainerState::Playing => {
                // A failing tick pauses the container itself
                let _ = c.advance();
            }
            ContainerState::Paused => {
                // Timer suspended; deadlines keep sliding so resume does
                // not replay a burst
            }
            _ => return,
        }

        next_deadline += interval;
        let now = Instant::now();
        if now > next_deadline {
            let behind = now.duration_since(next_deadline);
            if behind > interval {
                // More than one tick owed: drop the backlog
                let dropped = (behind.as_nanos() / interval.as_nanos().max(1)) as u64;
                warn!(
                    container_id = c.id(),
                    dropped, "auto-advance overrun; dropping ticks"
                );
                c.metrics.record_overrun();
                let tick = c.tick_counter();
                let id = c.id();
                c.broadcaster.publish(EngineEvent::TickOverrun {
                    container_id: id,
                    tick,
                    dropped,
                });
                while next_deadline + interval < now {
                    next_deadline += interval;
                }
            }
            // Otherwise: at most one tick owed, fire immediately
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::component::{ComponentSchema, FieldDef, FieldType};
    use crate::module::{Module, SystemDescriptor};

    struct TickerModule;

    impl Module for TickerModule {
        fn name(&self) -> &str {
            "ticker"
        }
        fn components(&self) -> Vec<ComponentSchema> {
            vec![ComponentSchema::new(
                "Count",
                vec![FieldDef::new("n", FieldType::I64)],
            )]
        }
        fn systems(&self) -> Vec<SystemDescriptor> {
            Vec::new()
        }
    }

    fn manager() -> ContainerManager {
        let manager = ContainerManager::new(EngineConfig::default());
        manager.register_module("ticker", Arc::new(|| Box::new(TickerModule)));
        manager
    }

    fn small_config(manager: &ContainerManager, name: &str) -> ContainerConfig {
        let mut config = ContainerConfig::from_engine(name, manager.engine_config());
        config.max_entities = 32;
        config.modules = vec!["ticker".to_string()];
        config
    }

    #[test]
    fn test_create_start_advance_stop_delete() -> Result<()> {
        let manager = manager();
        let id = manager.create_container(small_config(&manager, "a"))?;

        manager.start(id)?;
        manager.advance(id)?;
        assert_eq!(manager.stats(id)?.tick, 1);

        // Delete requires Stopped
        assert!(manager.delete(id).is_err());
        manager.stop(id)?;
        manager.delete(id)?;
        assert!(matches!(
            manager.stats(id),
            Err(EngineError::ContainerNotFound(_))
        ));
        Ok(())
    }

    #[test]
    fn test_container_isolation() -> Result<()> {
        let manager = manager();
        let x = manager.create_container(small_config(&manager, "x"))?;
        let y = manager.create_container(small_config(&manager, "y"))?;
        manager.start(x)?;
        manager.start(y)?;

        let match_x = manager.with_container(x, |c| {
            c.create_match(vec!["ticker".to_string()], Vec::new())
        })??;
        let match_y = manager.with_container(y, |c| {
            c.create_match(vec!["ticker".to_string()], Vec::new())
        })??;

        manager.with_container(x, |c| c.store_mut().create_entity(match_x, 0))??;

        assert_eq!(manager.stats(x)?.entity_count, 1);
        assert_eq!(manager.stats(y)?.entity_count, 0);

        // The same match id in Y projects empty
        let snapshot =
            manager.with_container(y, |c| c.snapshot_for_match(match_y))??;
        assert!(snapshot.entity_ids.is_empty());
        Ok(())
    }

    #[test]
    fn test_play_advances_and_stop_auto_halts() -> Result<()> {
        let manager = manager();
        let id = manager.create_container(small_config(&manager, "a"))?;
        manager.start(id)?;

        manager.play(id, 5)?;
        assert_eq!(manager.stats(id)?.state, ContainerState::Playing);
        std::thread::sleep(Duration::from_millis(60));

        manager.stop_auto(id)?;
        let ticked = manager.stats(id)?.tick;
        assert!(ticked > 0, "auto-advance should have ticked, got {ticked}");
        assert_eq!(manager.stats(id)?.state, ContainerState::Running);

        // No further ticks after stop_auto
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(manager.stats(id)?.tick, ticked);
        Ok(())
    }

    #[test]
    fn test_pause_suspends_timer() -> Result<()> {
        let manager = manager();
        let id = manager.create_container(small_config(&manager, "a"))?;
        manager.start(id)?;
        manager.play(id, 5)?;
        std::thread::sleep(Duration::from_millis(30));

        manager.pause(id)?;
        let at_pause = manager.stats(id)?.tick;
        std::thread::sleep(Duration::from_millis(40));
        // Manual single-step still allowed while paused
        manager.advance(id)?;
        assert_eq!(manager.stats(id)?.tick, at_pause + 1);

        manager.resume(id)?;
        assert_eq!(manager.stats(id)?.state, ContainerState::Playing);
        manager.stop(id)?;
        Ok(())
    }

    #[test]
    fn test_auto_restore_reloads_history() -> Result<()> {
        let dir = std::env::temp_dir().join("simcell-restore-test");
        std::fs::create_dir_all(&dir)?;
        let path = dir.join("container-a.jsonl");
        let _ = std::fs::remove_file(&path);

        let manager = manager();

        // First incarnation: persist a few ticks of history
        let first = manager.create_container(small_config(&manager, "a"))?;
        manager.start(first)?;
        let match_id = manager.with_container(first, |c| {
            c.create_match(vec!["ticker".to_string()], Vec::new())
        })??;
        manager.enable_persistence(first, &path)?;
        manager.with_container(first, |c| c.record_history(match_id))??;
        manager.advance(first)?;
        manager.advance(first)?;
        // Stop drops the listener, flushing the background writer
        manager.stop(first)?;

        // Second incarnation restores the persisted ring
        let mut config = small_config(&manager, "a2");
        config.auto_restore = true;
        let second = manager.create_container(config)?;
        manager.start(second)?;
        manager.enable_persistence(second, &path)?;

        let info = manager.with_container(second, |c| c.history_info(match_id))?;
        assert_eq!(info.retained, 2);
        assert_eq!(info.newest_tick, Some(2));

        // New ticks continue past the restored ones instead of colliding
        manager.with_container(second, |c| {
            c.create_match(vec!["ticker".to_string()], Vec::new())
        })??;
        manager.advance(second)?;
        assert_eq!(manager.stats(second)?.tick, 3);
        let info = manager.with_container(second, |c| c.history_info(match_id))?;
        assert_eq!(info.newest_tick, Some(3));

        // A container without the flag starts with an empty ring
        let third = manager.create_container(small_config(&manager, "a3"))?;
        manager.start(third)?;
        manager.enable_persistence(third, &path)?;
        assert_eq!(
            manager.with_container(third, |c| c.history_info(match_id))?.retained,
            0
        );

        std::fs::remove_file(&path)?;
        Ok(())
    }

    #[test]
    fn test_unknown_container() {
        let manager = manager();
        assert!(matches!(
            manager.start(99),
            Err(EngineError::ContainerNotFound(99))
        ));
    }

    #[test]
    fn test_list_sorted() -> Result<()> {
        let manager = manager();
        let a = manager.create_container(small_config(&manager, "a"))?;
        let b = manager.create_container(small_config(&manager, "b"))?;
        let listing = manager.list();
        assert_eq!(listing.len(), 2);
        assert_eq!(listing[0].id, a);
        assert_eq!(listing[1].id, b);
        Ok(())
    }
}
