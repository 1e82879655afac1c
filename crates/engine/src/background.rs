//! Background epoch and garbage-collection workers.
//!
//! Two threads drive an engine whose config sets an epoch length:
//! - `epochkv-epoch` advances the clock once per epoch and wakes the GC
//!   worker
//! - `epochkv-gc` recomputes the floors, sweeps and reclaims after every
//!   tick, and periodically logs per-storage statistics
//!
//! Both park on one condition variable so `stop` wakes them immediately.

use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use epochkv_core::{Error, Result};
use tracing::{debug, info};

use crate::coordinator::TransactionCoordinator;

#[derive(Debug, Default)]
struct WorkerState {
    ticks: u64,
    shutdown: bool,
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<WorkerState>,
    wake: Condvar,
}

/// Handles of the running background threads.
#[derive(Debug, Default)]
pub struct BackgroundWorkers {
    shared: Arc<Shared>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl BackgroundWorkers {
    /// Workers that never run; the epoch is advanced by hand.
    pub fn manual() -> Self {
        Self::default()
    }

    /// Spawn the epoch ticker and the GC worker.
    pub fn start(
        coordinator: Arc<TransactionCoordinator>,
        epoch: Duration,
        stats_log_interval_epochs: u64,
    ) -> Result<Self> {
        let workers = Self::default();

        let shared = Arc::clone(&workers.shared);
        let clock = coordinator.manager().env().clock_handle();
        let ticker = std::thread::Builder::new()
            .name("epochkv-epoch".to_string())
            .spawn(move || {
                loop {
                    let deadline = Instant::now() + epoch;
                    let mut state = shared.state.lock();
                    while !state.shutdown && Instant::now() < deadline {
                        shared.wake.wait_until(&mut state, deadline);
                    }
                    if state.shutdown {
                        break;
                    }
                    clock.advance();
                    state.ticks += 1;
                    shared.wake.notify_all();
                }
            })
            .map_err(|e| Error::Fatal(format!("failed to spawn epoch thread: {}", e)))?;
        workers.handles.lock().push(ticker);

        let shared = Arc::clone(&workers.shared);
        let gc = std::thread::Builder::new()
            .name("epochkv-gc".to_string())
            .spawn(move || {
                let mut seen = 0;
                loop {
                    {
                        let mut state = shared.state.lock();
                        while !state.shutdown && state.ticks == seen {
                            shared.wake.wait(&mut state);
                        }
                        if state.shutdown {
                            break;
                        }
                        seen = state.ticks;
                    }
                    coordinator.on_epoch();
                    if stats_log_interval_epochs > 0 && seen % stats_log_interval_epochs == 0 {
                        log_stats(&coordinator);
                    }
                }
            });
        match gc {
            Ok(handle) => workers.handles.lock().push(handle),
            Err(e) => {
                workers.stop();
                return Err(Error::Fatal(format!("failed to spawn gc thread: {}", e)));
            }
        }

        debug!(target: "epochkv::engine", epoch_ms = epoch.as_millis() as u64, "background workers started");
        Ok(workers)
    }

    /// Whether worker threads are running.
    pub fn is_running(&self) -> bool {
        !self.handles.lock().is_empty()
    }

    /// Signal the workers to exit and join them.
    pub fn stop(&self) {
        // notify under the lock: a worker between its shutdown check and its
        // wait holds the lock, so it either sees the flag or gets the wakeup
        {
            let mut state = self.shared.state.lock();
            state.shutdown = true;
            self.shared.wake.notify_all();
        }
        let mut handles = self.handles.lock();
        for handle in handles.drain(..) {
            let _ = handle.join();
        }
    }
}

fn log_stats(coordinator: &TransactionCoordinator) {
    for stats in coordinator.storage_stats() {
        info!(
            target: "epochkv::gc",
            storage = %stats.storage,
            entries = stats.entries,
            live_entries = stats.live_entries,
            avg_version_chain_len = stats.avg_version_chain_len,
            avg_key_size = stats.avg_key_size,
            avg_value_size = stats.avg_value_size,
            unhooked_total = stats.unhooked_total,
            pruned_versions_total = stats.pruned_versions_total,
            "storage stats"
        );
    }
}
