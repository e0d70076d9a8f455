use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::db::DbCore;
use crate::error::Result;
use crate::sync;

/// Background tickers for one open store: sync, key expiration, metrics.
///
/// Each ticker holds a shared reference to the core and reacts to a close
/// broadcast; `shutdown` waits for all of them so close never races a
/// half-finished pass.
pub(crate) struct Tickers {
    handles: Vec<JoinHandle<()>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Tickers {
    /// Starts the tickers for `core`. Returns `None` outside a tokio
    /// runtime; the store then syncs and expires only on demand.
    pub(crate) fn start(core: &Arc<DbCore>) -> Option<Self> {
        if tokio::runtime::Handle::try_current().is_err() {
            tracing::warn!("no async runtime, background sync and expiry disabled");
            return None;
        }
        let (shutdown_tx, _) = broadcast::channel(1);
        let mut handles = Vec::new();

        if !core.opts.background_sync_interval.is_zero() {
            handles.push(spawn_syncer(
                Arc::clone(core),
                core.opts.background_sync_interval,
                shutdown_tx.subscribe(),
            ));
        }
        if core.opts.background_key_expiry {
            let interval = Duration::from_secs(60) * core.opts.key_expiration_max_dur;
            handles.push(spawn_expirer(
                Arc::clone(core),
                interval,
                shutdown_tx.subscribe(),
            ));
        }
        handles.push(spawn_metrics(
            Arc::clone(core),
            Duration::from_secs(5),
            shutdown_tx.subscribe(),
        ));

        Some(Self {
            handles,
            shutdown_tx,
        })
    }

    /// Signals every ticker and waits for it to exit.
    pub(crate) async fn shutdown(self) -> Result<()> {
        self.shutdown_tx.send(()).ok();
        for handle in self.handles {
            handle.await?;
        }
        Ok(())
    }
}

fn ticker(interval: Duration) -> tokio::time::Interval {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker
}

/// Drains sealed buckets whenever writes happened since the last pass;
/// an idle store skips the file IO entirely.
fn spawn_syncer(
    core: Arc<DbCore>,
    interval: Duration,
    mut shutdown: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = ticker(interval);
        ticker.tick().await;
        let mut last_modifications = 0i64;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let modifications =
                        core.metrics.puts.value() + core.metrics.dels.value();
                    // Staged bytes may outlive the tick that first saw their
                    // modification, so an occupied memtable always syncs.
                    if modifications == last_modifications && core.mem.size() == 0 {
                        continue;
                    }
                    last_modifications = modifications;
                    let core = Arc::clone(&core);
                    // File IO happens off the runtime worker.
                    let result = tokio::task::spawn_blocking(move || {
                        sync::sync_with_recovery(&core)
                    })
                    .await;
                    match result {
                        Ok(Ok(())) => {}
                        Ok(Err(err)) => {
                            tracing::error!(error = %err, "background sync failed");
                        }
                        // A failed pass has already rolled back and retried;
                        // a panic is the cannot-continue-safely case.
                        Err(err) if err.is_panic() => {
                            std::panic::resume_unwind(err.into_panic());
                        }
                        Err(err) => {
                            tracing::error!(error = %err, "sync task join failed");
                        }
                    }
                }
                _ = shutdown.recv() => {
                    tracing::debug!("syncer shutting down");
                    break;
                }
            }
        }
    })
}

fn spawn_expirer(
    core: Arc<DbCore>,
    interval: Duration,
    mut shutdown: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = ticker(interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let core = Arc::clone(&core);
                    let result =
                        tokio::task::spawn_blocking(move || core.expire_entries()).await;
                    if let Ok(Err(err)) = result {
                        tracing::error!(error = %err, "key expiration failed");
                    }
                }
                _ = shutdown.recv() => {
                    tracing::debug!("expirer shutting down");
                    break;
                }
            }
        }
    })
}

fn spawn_metrics(
    core: Arc<DbCore>,
    interval: Duration,
    mut shutdown: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = ticker(interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let snap = core.metrics.snapshot();
                    tracing::info!(
                        puts = snap.puts,
                        dels = snap.dels,
                        gets = snap.gets,
                        syncs = snap.syncs,
                        aborts = snap.aborts,
                        in_msgs = snap.in_msgs,
                        in_bytes = snap.in_bytes,
                        block_probes = snap.block_probes,
                        memtable_bytes = core.mem.size(),
                        memtable_buckets = core.mem.bucket_count(),
                        trie_seqs = core.trie.count(),
                        "store metrics"
                    );
                }
                _ = shutdown.recv() => break,
            }
        }
    })
}
