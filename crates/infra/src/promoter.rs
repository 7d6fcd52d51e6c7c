//! Background promoter: moves due jobs from the scheduling index into their
//! topics' ready queues.

use std::sync::{mpsc, Arc, Mutex, PoisonError};
use std::thread;
use std::time::Instant;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::{ConfigError, PromoterConfig};
use crate::store::{PromotionReport, Store, StoreResult};

#[derive(Debug, Error)]
pub enum SpawnError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to spawn promoter thread: {0}")]
    Thread(#[from] std::io::Error),
}

/// Handle to control a running promoter.
#[derive(Debug)]
pub struct PromoterHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
    stats: Arc<Mutex<PromoterStats>>,
}

impl PromoterHandle {
    /// Stop the loop and wait for the thread. A scan in progress finishes
    /// first.
    pub fn shutdown(mut self) {
        self.stop();
    }

    pub fn stats(&self) -> PromoterStats {
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Block until the promoter thread exits.
    ///
    /// The loop only stops through [`PromoterHandle::shutdown`] (or dropping
    /// the handle), both of which consume it, so this waits for the thread to
    /// panic or the process to end. Each scan is a set of atomic store calls,
    /// so killing the process mid-scan loses nothing.
    pub fn join(mut self) {
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }

    fn stop(&mut self) {
        let _ = self.shutdown.send(());
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

impl Drop for PromoterHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Promoter runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PromoterStats {
    pub scans: u64,
    pub promoted: u64,
    /// Due ids whose record had already expired.
    pub dropped: u64,
    pub errors: u64,
    pub uptime_secs: u64,
}

/// Moves due jobs into ready queues.
///
/// Every transition is a single atomic store call, so any number of
/// promoters may run against the same store; each due id is moved by exactly
/// one of them.
pub struct Promoter<S> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
}

impl<S> std::fmt::Debug for Promoter<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Promoter").finish_non_exhaustive()
    }
}

impl<S: Store + 'static> Promoter<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self::with_clock(store, SystemClock)
    }

    pub fn with_clock(store: Arc<S>, clock: impl Clock + 'static) -> Self {
        Self {
            store,
            clock: Arc::new(clock),
        }
    }

    /// Promote everything due now, `batch_size` entries per store call,
    /// until a call comes back short.
    pub fn run_once(&self, batch_size: usize) -> StoreResult<PromotionReport> {
        let batch_size = batch_size.max(1);
        let now = self.clock.now();
        let mut report = PromotionReport::default();

        loop {
            let batch = self.store.promote_due(now, batch_size)?;
            let handled = batch.handled();
            report.merge(batch);

            if handled < batch_size {
                return Ok(report);
            }
        }
    }

    /// Run the promotion loop on a named background thread.
    ///
    /// The configuration is validated first; a zero poll interval would spin.
    pub fn spawn(self, config: PromoterConfig) -> Result<PromoterHandle, SpawnError> {
        config.validate()?;

        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let stats = Arc::new(Mutex::new(PromoterStats::default()));
        let stats_clone = Arc::clone(&stats);

        let join = thread::Builder::new()
            .name(config.name.clone())
            .spawn(move || promoter_loop(self, config, shutdown_rx, stats_clone))?;

        Ok(PromoterHandle {
            shutdown: shutdown_tx,
            join: Some(join),
            stats,
        })
    }
}

fn promoter_loop<S: Store + 'static>(
    promoter: Promoter<S>,
    config: PromoterConfig,
    shutdown_rx: mpsc::Receiver<()>,
    stats: Arc<Mutex<PromoterStats>>,
) {
    info!(
        promoter = %config.name,
        interval_ms = config.poll_interval.as_millis() as u64,
        batch_size = config.batch_size,
        "promoter started"
    );
    let start_time = Instant::now();

    loop {
        let result = promoter.run_once(config.batch_size);

        {
            let mut s = stats.lock().unwrap_or_else(PoisonError::into_inner);
            s.scans += 1;
            s.uptime_secs = start_time.elapsed().as_secs();
            match &result {
                Ok(report) => {
                    s.promoted += report.promoted.len() as u64;
                    s.dropped += report.dropped.len() as u64;
                }
                Err(_) => s.errors += 1,
            }
        }

        match result {
            Ok(report) if report.is_empty() => {}
            Ok(report) => {
                debug!(
                    promoter = %config.name,
                    promoted = report.promoted.len(),
                    "promoted due jobs"
                );
                if !report.dropped.is_empty() {
                    warn!(
                        promoter = %config.name,
                        ids = ?report.dropped,
                        "dropped due jobs with expired records"
                    );
                }
            }
            Err(e) => error!(promoter = %config.name, error = %e, "promotion failed"),
        }

        match shutdown_rx.recv_timeout(config.poll_interval) {
            Err(mpsc::RecvTimeoutError::Timeout) => continue,
            Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }

    info!(promoter = %config.name, "promoter stopped");
}
