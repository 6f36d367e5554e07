//! Source poller: reconciles the live connection set against the
//! registry.
//!
//! Every cycle the poller fetches the active sources and computes two
//! set differences. Sources that are live but no longer active are
//! signalled to the multiplexer for closure (teardown stays with the
//! socket's owner). Active sources without a live connection are dialed
//! through a bounded-concurrency pool so one unreachable caster cannot
//! stall discovery of the rest.
//!
//! Consecutive failed cycles are counted per source id; past the
//! configured threshold the source is durably disabled in the registry
//! so a dead caster stops consuming dial-pool capacity.

use super::connection::{ConnectionEntry, ConnectionTable};
use super::{dialer, HubCommand};
use crate::config::GatewayConfig;
use crate::registry::{SourceRecord, SourceStore};
use crate::source::SourceUrl;
use crate::{HubError, Result};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

pub struct Poller {
    store: SourceStore,
    table: Arc<ConnectionTable>,
    control_tx: mpsc::UnboundedSender<HubCommand>,
    config: GatewayConfig,
    /// Consecutive failed reconciliation cycles, keyed by source id.
    failures: HashMap<i64, u32>,
}

impl Poller {
    pub fn new(
        store: SourceStore,
        table: Arc<ConnectionTable>,
        control_tx: mpsc::UnboundedSender<HubCommand>,
        config: GatewayConfig,
    ) -> Self {
        Self {
            store,
            table,
            control_tx,
            config,
            failures: HashMap::new(),
        }
    }

    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            "poller started (interval {}s, dial fan-out {})",
            self.config.poll_interval_secs, self.config.dial_concurrency
        );

        loop {
            if let Err(e) = self.reconcile_once().await {
                error!("reconciliation cycle failed: {}", e);
            }

            tokio::select! {
                _ = shutdown.recv() => break,
                _ = tokio::time::sleep(Duration::from_secs(self.config.poll_interval_secs)) => {}
            }
        }

        info!("poller stopped");
    }

    /// One reconciliation pass: close stale connections, dial missing
    /// ones, account failures, trip the circuit breaker.
    pub async fn reconcile_once(&mut self) -> Result<()> {
        debug!("checking for active sources");
        let active = self.fetch_active().await?;
        let active_ids: HashSet<i64> = active.iter().map(|r| r.id).collect();

        // Stale: live but deactivated externally. Ask the multiplexer to
        // tear them down; it owns the sockets.
        for source_id in self.table.source_ids() {
            if !active_ids.contains(&source_id) {
                let _ = self.control_tx.send(HubCommand::Close { source_id });
            }
        }

        // A source deactivated or deleted externally takes its failure
        // count with it, so reactivation starts from zero.
        self.failures.retain(|id, _| active_ids.contains(id));

        // Missing: active but not live.
        let live: HashSet<i64> = self.table.source_ids().into_iter().collect();
        let missing: Vec<SourceRecord> = active
            .into_iter()
            .filter(|r| !live.contains(&r.id))
            .collect();
        if missing.is_empty() {
            return Ok(());
        }

        let semaphore = Arc::new(Semaphore::new(self.config.dial_concurrency));
        let mut dials: JoinSet<(SourceRecord, Result<(SourceUrl, TcpStream)>)> = JoinSet::new();

        for record in missing {
            let semaphore = semaphore.clone();
            let attempts = self.config.dial_attempts;
            let retry_delay = Duration::from_secs(self.config.dial_retry_delay_secs);
            dials.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                let url = match SourceUrl::parse(&record.connection_string) {
                    Ok(url) => url,
                    Err(e) => return (record, Err(e)),
                };
                info!("{}: opening connection", url.path());
                let connect_timeout = Duration::from_secs(record.timeout.max(1));
                let outcome = dialer::dial(&url, connect_timeout, attempts, retry_delay).await;
                (record, outcome.map(|stream| (url, stream)))
            });
        }

        while let Some(joined) = dials.join_next().await {
            let (record, outcome) = match joined {
                Ok(pair) => pair,
                Err(e) => {
                    error!("dial task panicked: {}", e);
                    continue;
                }
            };
            match outcome {
                Ok((url, stream)) => self.register(record, url, stream),
                Err(e) => {
                    warn!("source {}: dial failed this cycle: {}", record.id, e);
                    self.record_failure(record.id).await;
                }
            }
        }

        Ok(())
    }

    fn register(&mut self, record: SourceRecord, url: SourceUrl, stream: TcpStream) {
        let base_topic = url.topic(&self.config.topic_prefix);
        let entry = Arc::new(ConnectionEntry::new(record.id, url, base_topic));
        self.table.insert(entry);

        if self
            .control_tx
            .send(HubCommand::Register {
                source_id: record.id,
                stream,
            })
            .is_err()
        {
            // Multiplexer is gone; the hub is shutting down.
            self.table.remove(record.id);
            return;
        }

        self.failures.remove(&record.id);
    }

    async fn record_failure(&mut self, source_id: i64) {
        let count = self.failures.entry(source_id).or_insert(0);
        *count += 1;

        if *count > self.config.max_dial_failures {
            warn!(
                "source {}: {} consecutive failed cycles, disabling in registry",
                source_id, count
            );
            self.failures.remove(&source_id);

            let store = self.store.clone();
            match tokio::task::spawn_blocking(move || store.set_active(source_id, false)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("source {}: failed to disable: {}", source_id, e),
                Err(e) => error!("source {}: disable task failed: {}", source_id, e),
            }
        }
    }

    async fn fetch_active(&self) -> Result<Vec<SourceRecord>> {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || store.fetch_active())
            .await
            .map_err(|e| HubError::Internal(format!("registry task: {}", e)))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn refused_addr() -> String {
        // Bind and immediately drop to get a port nothing listens on.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        format!("tcp://127.0.0.1:{}/dead", port)
    }

    fn fast_config() -> GatewayConfig {
        GatewayConfig {
            workers: 1,
            dial_attempts: 1,
            dial_retry_delay_secs: 0,
            ..GatewayConfig::default()
        }
    }

    #[tokio::test]
    async fn test_failure_count_cleared_when_source_deactivated() {
        let dir = TempDir::new().unwrap();
        let store = SourceStore::open(dir.path().join("sources.db")).unwrap();
        let id = store.add_source("DEAD1", &refused_addr(), Some(1)).unwrap();

        let table = Arc::new(ConnectionTable::new());
        let (control_tx, _control_rx) = mpsc::unbounded_channel();
        let mut poller = Poller::new(store.clone(), table, control_tx, fast_config());

        poller.reconcile_once().await.unwrap();
        assert_eq!(poller.failures.get(&id), Some(&1));

        // Deactivated out of band: the counter must not linger, or a
        // later reactivation would inherit stale strikes.
        store.set_active(id, false).unwrap();
        poller.reconcile_once().await.unwrap();
        assert!(poller.failures.is_empty());

        store.set_active(id, true).unwrap();
        poller.reconcile_once().await.unwrap();
        assert_eq!(poller.failures.get(&id), Some(&1));
    }
}
