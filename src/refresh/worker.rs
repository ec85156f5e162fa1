//! Background refresh worker
//!
//! Runs a thread that reloads each table when its period elapses, and on demand
//! through a command channel.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use tracing::debug;

use crate::refresh::coordinator::RefreshCoordinator;
use crate::source::DataSource;
use crate::table::TableId;

/// Configuration for the refresh worker
#[derive(Debug, Clone)]
pub struct RefreshWorkerConfig {
    /// Longest the worker sleeps between checks
    pub tick: Duration,
}

impl Default for RefreshWorkerConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(1),
        }
    }
}

impl RefreshWorkerConfig {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the tick interval
    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }
}

/// State of the refresh worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RefreshWorkerState {
    /// Worker is stopped
    Stopped = 0,
    /// Worker is running and idle
    Idle = 1,
    /// Worker is building a generation
    Refreshing = 2,
    /// Scheduled refreshes are suspended
    Paused = 3,
}

impl From<u8> for RefreshWorkerState {
    fn from(value: u8) -> Self {
        match value {
            1 => RefreshWorkerState::Idle,
            2 => RefreshWorkerState::Refreshing,
            3 => RefreshWorkerState::Paused,
            _ => RefreshWorkerState::Stopped,
        }
    }
}

enum Command {
    RefreshNow(TableId),
    Stop,
}

/// Background scheduler for a [`RefreshCoordinator`]
pub struct RefreshWorker<S: DataSource + 'static> {
    config: RefreshWorkerConfig,
    coordinator: Weak<RefreshCoordinator<S>>,
    running: Arc<AtomicBool>,
    paused: Arc<AtomicBool>,
    state: Arc<AtomicU8>,
    commands: Option<Sender<Command>>,
    handle: Option<JoinHandle<()>>,
}

impl<S: DataSource + 'static> RefreshWorker<S> {
    /// Create a stopped worker for `coordinator`.
    pub fn new(coordinator: &Arc<RefreshCoordinator<S>>, config: RefreshWorkerConfig) -> Self {
        Self {
            config,
            coordinator: Arc::downgrade(coordinator),
            running: Arc::new(AtomicBool::new(false)),
            paused: Arc::new(AtomicBool::new(false)),
            state: Arc::new(AtomicU8::new(RefreshWorkerState::Stopped as u8)),
            commands: None,
            handle: None,
        }
    }

    /// Get the current state
    pub fn state(&self) -> RefreshWorkerState {
        RefreshWorkerState::from(self.state.load(Ordering::Acquire))
    }

    /// Check if the worker is running
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Check if the worker is paused
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    /// Get the configuration
    pub fn config(&self) -> &RefreshWorkerConfig {
        &self.config
    }

    /// Start the worker thread.
    ///
    /// Returns true if the worker was started, false if already running.
    pub fn start(&mut self) -> bool {
        if self.running.swap(true, Ordering::AcqRel) {
            return false;
        }

        let (tx, rx) = channel::unbounded();
        let running = Arc::clone(&self.running);
        let paused = Arc::clone(&self.paused);
        let state = Arc::clone(&self.state);
        let coordinator = self.coordinator.clone();
        let tick = self.config.tick;

        let spawned = thread::Builder::new()
            .name("rowcache-refresh".to_string())
            .spawn(move || Self::worker_loop(running, paused, state, coordinator, rx, tick));
        match spawned {
            Ok(handle) => {
                self.commands = Some(tx);
                self.handle = Some(handle);
                true
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to spawn refresh worker");
                self.running.store(false, Ordering::Release);
                false
            }
        }
    }

    /// Stop the worker and wait for it to finish its current build.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(commands) = self.commands.take() {
            let _ = commands.send(Command::Stop);
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        self.state
            .store(RefreshWorkerState::Stopped as u8, Ordering::Release);
    }

    /// Suspend scheduled refreshes. Explicit requests still run.
    pub fn pause(&self) {
        self.paused.store(true, Ordering::Release);
        if self.is_running() {
            self.state
                .store(RefreshWorkerState::Paused as u8, Ordering::Release);
        }
    }

    /// Resume scheduled refreshes
    pub fn resume(&self) {
        self.paused.store(false, Ordering::Release);
        if self.is_running() {
            self.state
                .store(RefreshWorkerState::Idle as u8, Ordering::Release);
        }
    }

    /// Ask the worker to refresh `table` as soon as possible.
    ///
    /// Returns false if the worker is not running.
    pub fn refresh_now(&self, table: TableId) -> bool {
        self.commands
            .as_ref()
            .is_some_and(|commands| commands.send(Command::RefreshNow(table)).is_ok())
    }

    fn worker_loop(
        running: Arc<AtomicBool>,
        paused: Arc<AtomicBool>,
        state: Arc<AtomicU8>,
        coordinator: Weak<RefreshCoordinator<S>>,
        commands: Receiver<Command>,
        tick: Duration,
    ) {
        let idle_state = |state: &AtomicU8| {
            let value = if paused.load(Ordering::Acquire) {
                RefreshWorkerState::Paused
            } else {
                RefreshWorkerState::Idle
            };
            state.store(value as u8, Ordering::Release);
        };

        let periods: Vec<Duration> = match coordinator.upgrade() {
            Some(coordinator) => coordinator
                .registry()
                .iter()
                .map(|entry| entry.spec().period())
                .collect(),
            None => Vec::new(),
        };
        let started = Instant::now();
        let mut due: Vec<Instant> = periods.iter().map(|period| started + *period).collect();

        idle_state(&state);

        while running.load(Ordering::Acquire) {
            let now = Instant::now();
            let wait = due
                .iter()
                .map(|at| at.saturating_duration_since(now))
                .min()
                .map_or(tick, |wait| wait.min(tick));

            let requested = match commands.recv_timeout(wait) {
                Ok(Command::Stop) | Err(RecvTimeoutError::Disconnected) => break,
                Ok(Command::RefreshNow(table)) => Some(table),
                Err(RecvTimeoutError::Timeout) => None,
            };

            let Some(coordinator) = coordinator.upgrade() else {
                running.store(false, Ordering::Release);
                break;
            };

            let run = |table: TableId, due: &mut [Instant]| {
                state.store(RefreshWorkerState::Refreshing as u8, Ordering::Release);
                debug!(table, "refresh starting");
                // Failures are logged and counted by the coordinator.
                let _ = coordinator.refresh_table(table);
                if let (Some(slot), Some(period)) =
                    (due.get_mut(table as usize), periods.get(table as usize))
                {
                    *slot = Instant::now() + *period;
                }
                idle_state(&state);
            };

            if let Some(table) = requested {
                run(table, &mut due);
            }
            if paused.load(Ordering::Acquire) {
                continue;
            }

            let now = Instant::now();
            let ready: Vec<TableId> = due
                .iter()
                .enumerate()
                .filter(|(_, at)| **at <= now)
                .map(|(table, _)| table as TableId)
                .collect();
            for table in ready {
                if !running.load(Ordering::Acquire) {
                    break;
                }
                run(table, &mut due);
            }
        }

        state.store(RefreshWorkerState::Stopped as u8, Ordering::Release);
    }
}

impl<S: DataSource + 'static> Drop for RefreshWorker<S> {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::MemorySource;
    use crate::table::{KeyType, TableRegistry, TableSpec};
    use serde_json::json;

    fn coordinator(period: Duration) -> Arc<RefreshCoordinator<MemorySource>> {
        let registry = TableRegistry::new(vec![
            TableSpec::new("t", period).with_index("id", KeyType::Int)
        ])
        .unwrap();
        let source = MemorySource::new();
        source.set_rows("t", vec![json!({"id": 1})]);
        Arc::new(RefreshCoordinator::new(Arc::new(registry), source))
    }

    fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn test_start_stop() {
        let coordinator = coordinator(Duration::from_secs(3600));
        let mut worker =
            RefreshWorker::new(&coordinator, RefreshWorkerConfig::new().with_tick(Duration::from_millis(10)));
        assert_eq!(worker.state(), RefreshWorkerState::Stopped);

        assert!(worker.start());
        assert!(!worker.start());
        assert!(worker.is_running());

        worker.stop();
        assert!(!worker.is_running());
        assert_eq!(worker.state(), RefreshWorkerState::Stopped);
        assert!(!worker.refresh_now(0));
    }

    #[test]
    fn test_periodic_refresh() {
        let coordinator = coordinator(Duration::from_millis(20));
        coordinator.initial_load().unwrap();
        let mut worker =
            RefreshWorker::new(&coordinator, RefreshWorkerConfig::new().with_tick(Duration::from_millis(5)));
        worker.start();

        let entry = coordinator.registry().get(0).unwrap();
        assert!(wait_for(|| entry.pin().is_some_and(|g| g.sequence() >= 3)));
        worker.stop();
    }

    #[test]
    fn test_refresh_now() {
        let coordinator = coordinator(Duration::from_secs(3600));
        let mut worker =
            RefreshWorker::new(&coordinator, RefreshWorkerConfig::new().with_tick(Duration::from_millis(10)));
        worker.start();
        assert!(worker.refresh_now(0));

        let entry = coordinator.registry().get(0).unwrap();
        assert!(wait_for(|| entry.cell().is_published()));
        worker.stop();
    }

    #[test]
    fn test_pause_resume() {
        let coordinator = coordinator(Duration::from_millis(10));
        let mut worker =
            RefreshWorker::new(&coordinator, RefreshWorkerConfig::new().with_tick(Duration::from_millis(5)));
        worker.start();
        worker.pause();
        assert!(worker.is_paused());
        assert!(wait_for(|| worker.state() == RefreshWorkerState::Paused));

        worker.resume();
        assert!(!worker.is_paused());
        let entry = coordinator.registry().get(0).unwrap();
        assert!(wait_for(|| entry.cell().is_published()));
        worker.stop();
    }

    #[test]
    fn test_stops_when_coordinator_dropped() {
        let coordinator = coordinator(Duration::from_secs(3600));
        let mut worker =
            RefreshWorker::new(&coordinator, RefreshWorkerConfig::new().with_tick(Duration::from_millis(5)));
        worker.start();
        drop(coordinator);
        assert!(wait_for(|| !worker.is_running()));
        worker.stop();
    }
}
