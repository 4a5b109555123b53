//! Background maintenance: TTL sweep, proposal expiry, checkpoints.
//!
//! The sweeper is a tokio task ticking at `StoreConfig::sweep_interval`.
//! A pass never fails as a whole: each step logs its own error and the loop
//! carries on. `stop()` is idempotent and safe when nothing is running.
use crate::config::StoreConfig;
use crate::consensus::ConsensusCoordinator;
use crate::persistence;
use crate::retry;
use crate::storage::MemoryStore;
use crate::types::OpContext;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};

/// What one sweep pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Expired entries removed
    pub expired_entries: usize,
    /// Proposals resolved to `Expired`
    pub expired_proposals: usize,
    /// Entries written to the checkpoint file, if one was written
    pub checkpointed: Option<usize>,
}

#[derive(Debug, Clone)]
struct SweepPass {
    store: Arc<MemoryStore>,
    consensus: Option<ConsensusCoordinator>,
    checkpoint_path: Option<PathBuf>,
    retry_attempts: u32,
    retry_backoff: Duration,
}

impl SweepPass {
    async fn run(&self) -> SweepReport {
        let mut report = SweepReport {
            expired_entries: self.store.sweep_expired(),
            ..SweepReport::default()
        };

        if let Some(consensus) = &self.consensus {
            match consensus.expire_overdue().await {
                Ok(n) => report.expired_proposals = n,
                Err(e) => tracing::warn!(error = %e, "Proposal expiry failed"),
            }
        }

        if let Some(path) = &self.checkpoint_path {
            let store = self.store.as_ref();
            let result = retry::with_backoff(
                &OpContext::system(),
                self.retry_attempts,
                self.retry_backoff,
                || persistence::save(store, path),
            )
            .await;
            match result {
                Ok(n) => report.checkpointed = Some(n),
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "Checkpoint failed"),
            }
        }

        if report.expired_entries > 0 || report.expired_proposals > 0 {
            tracing::debug!(
                expired_entries = report.expired_entries,
                expired_proposals = report.expired_proposals,
                "Sweep pass complete"
            );
        }
        report
    }
}

/// Handle to the background sweep task.
#[derive(Debug)]
pub struct Sweeper {
    pass: SweepPass,
    period: Duration,
    shutdown: Arc<AtomicBool>,
    wake: Arc<Notify>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Sweeper {
    /// Sweeper for `store` configured by `config`.
    pub fn new(store: Arc<MemoryStore>, config: &StoreConfig) -> Self {
        Self {
            pass: SweepPass {
                store,
                consensus: None,
                checkpoint_path: config.checkpoint_path.clone(),
                retry_attempts: config.storage_retry_attempts,
                retry_backoff: config.storage_retry_backoff,
            },
            period: config.sweep_interval,
            shutdown: Arc::new(AtomicBool::new(false)),
            wake: Arc::new(Notify::new()),
            handle: Mutex::new(None),
        }
    }

    /// Also expire overdue proposals of `consensus` on every pass.
    pub fn with_consensus(mut self, consensus: ConsensusCoordinator) -> Self {
        self.pass.consensus = Some(consensus);
        self
    }

    /// Run a single pass now, independent of the background task.
    pub async fn run_once(&self) -> SweepReport {
        self.pass.run().await
    }

    /// Spawn the background task on the current runtime.
    ///
    /// Returns `false` if a task is already running.
    pub fn start(&self) -> bool {
        let mut slot = match self.handle.lock() {
            Ok(slot) => slot,
            Err(poisoned) => poisoned.into_inner(),
        };
        if slot.as_ref().is_some_and(|h| !h.is_finished()) {
            return false;
        }

        self.shutdown.store(false, Ordering::Release);
        let pass = self.pass.clone();
        let shutdown = Arc::clone(&self.shutdown);
        let wake = Arc::clone(&self.wake);
        let period = self.period.max(Duration::from_millis(1));

        tracing::info!(period_ms = period.as_millis() as u64, "Starting sweeper");
        *slot = Some(tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = wake.notified() => {}
                }
                if shutdown.load(Ordering::Acquire) {
                    break;
                }
                pass.run().await;
            }
            tracing::info!("Sweeper stopped");
        }));
        true
    }

    /// Signal the background task to stop.
    pub fn stop(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        self.wake.notify_one();
    }

    /// Stop and wait for the background task to exit.
    pub async fn shutdown(&self) {
        self.stop();
        let handle = match self.handle.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(handle) = handle
            && let Err(e) = handle.await
        {
            tracing::warn!(error = %e, "Sweeper task failed");
        }
    }

    /// Whether the background task is alive.
    pub fn is_running(&self) -> bool {
        match self.handle.lock() {
            Ok(slot) => slot.as_ref().is_some_and(|h| !h.is_finished()),
            Err(_) => false,
        }
    }
}

impl Drop for Sweeper {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::ConsensusConfig;
    use crate::layout::KeyLayout;
    use crate::registry::InMemoryAgentRegistry;
    use crate::types::StoreOptions;
    use chrono::Duration as ChronoDuration;
    use tempfile::TempDir;

    fn store_with(clock: &ManualClock) -> Arc<MemoryStore> {
        Arc::new(MemoryStore::new(
            Arc::new(InMemoryAgentRegistry::new()),
            Arc::new(clock.clone()),
            &StoreConfig::default(),
        ))
    }

    #[tokio::test]
    async fn test_run_once_sweeps_and_expires() {
        let clock = ManualClock::default();
        let store = store_with(&clock);
        let ctx = OpContext::new("a");
        store
            .store(&ctx, "p", "k", b"v".to_vec(), StoreOptions::new().with_ttl(Duration::from_secs(1)))
            .unwrap();

        let consensus =
            ConsensusCoordinator::new(Arc::clone(&store), &KeyLayout::new("ns"), ConsensusConfig::default());
        consensus
            .propose(&ctx, serde_json::json!(1), 2, Some(Duration::from_secs(1)))
            .await
            .unwrap();

        let sweeper = Sweeper::new(Arc::clone(&store), &StoreConfig::default()).with_consensus(consensus);
        clock.advance(ChronoDuration::seconds(2));

        let report = sweeper.run_once().await;
        assert_eq!(report.expired_entries, 1);
        assert_eq!(report.expired_proposals, 1);
        assert_eq!(report.checkpointed, None);
    }

    #[tokio::test]
    async fn test_checkpoint_written() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("store.snap");
        let store = Arc::new(MemoryStore::standalone());
        store
            .store(&OpContext::new("a"), "p", "k", b"v".to_vec(), StoreOptions::new())
            .unwrap();

        let config = StoreConfig {
            checkpoint_path: Some(path.clone()),
            ..StoreConfig::default()
        };
        let sweeper = Sweeper::new(store, &config);
        let report = sweeper.run_once().await;
        assert_eq!(report.checkpointed, Some(1));
        assert!(persistence::exists(&path).await);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let sweeper = Sweeper::new(Arc::new(MemoryStore::standalone()), &StoreConfig::default());
        sweeper.stop();
        sweeper.stop();
        sweeper.shutdown().await;
        assert!(!sweeper.is_running());
    }

    #[tokio::test]
    async fn test_background_task_sweeps() {
        let clock = ManualClock::default();
        let store = store_with(&clock);
        store
            .store(
                &OpContext::new("a"),
                "p",
                "k",
                b"v".to_vec(),
                StoreOptions::new().with_ttl(Duration::from_millis(10)),
            )
            .unwrap();
        clock.advance(ChronoDuration::seconds(1));

        let config = StoreConfig {
            sweep_interval: Duration::from_millis(10),
            ..StoreConfig::default()
        };
        let sweeper = Sweeper::new(Arc::clone(&store), &config);
        assert!(sweeper.start());
        assert!(!sweeper.start());

        for _ in 0..100 {
            if !store.contains_key("p", "k") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!store.contains_key("p", "k"));

        sweeper.shutdown().await;
        assert!(!sweeper.is_running());
    }
}
