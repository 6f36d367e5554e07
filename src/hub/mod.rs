//! # Connection Hub
//!
//! The hub owns every moving part of the gateway and wires them
//! together:
//!
//! - [`Poller`] reconciles the registry against the live set and dials
//! - [`Multiplexer`] reads all open sockets in one select loop
//! - [`PublishWorker`]s drain the bus shards and publish to MQTT
//!
//! Control flow: the poller mutates the [`connection::ConnectionTable`]
//! and signals the multiplexer; the multiplexer reads sockets and pushes
//! onto the bus; workers drain the bus and publish. Data moves one way.

pub mod connection;
pub mod dialer;
pub mod multiplexer;
pub mod poller;
pub mod worker;

pub use connection::{ConnectionEntry, ConnectionTable};
pub use multiplexer::Multiplexer;
pub use poller::Poller;
pub use worker::PublishWorker;

use crate::config::GatewayConfig;
use crate::registry::SourceStore;
use crate::{HubError, Result};
use bytes::Bytes;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tracing::info;

/// Commands the poller sends to the multiplexer over the control
/// channel. Socket teardown and registration both go through here so the
/// multiplexer stays the single writer of the watch set.
#[derive(Debug)]
pub enum HubCommand {
    /// Watch a freshly dialed socket for readability.
    Register { source_id: i64, stream: TcpStream },
    /// Deregister, close, and remove one connection. Idempotent.
    Close { source_id: i64 },
}

/// One unit of work on the fan-out bus: bytes read from one source's
/// socket. Ownership transfers to whichever worker drains the shard.
#[derive(Debug, Clone)]
pub struct BusMessage {
    pub source_id: i64,
    pub payload: Bytes,
}

/// Owning struct for the whole gateway: registry handle, connection
/// table, shutdown signal, and the spawned component tasks.
pub struct Hub {
    config: GatewayConfig,
    store: SourceStore,
    table: Arc<ConnectionTable>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Hub {
    /// Validate the configuration and open the source registry. Both are
    /// startup-fatal on failure; nothing past this point is.
    pub fn new(config: GatewayConfig) -> Result<Self> {
        config.validate().map_err(HubError::Config)?;
        let store = SourceStore::open(&config.registry_path)?;
        let (shutdown_tx, _) = broadcast::channel(16);

        Ok(Self {
            config,
            store,
            table: Arc::new(ConnectionTable::new()),
            shutdown_tx,
        })
    }

    /// Initiate graceful shutdown: the multiplexer closes every socket,
    /// the poller stops reconciling, and workers drain their shards
    /// before disconnecting from the broker.
    pub fn shutdown(&self) {
        info!("initiating graceful shutdown...");
        let _ = self.shutdown_tx.send(());
    }

    /// Run the gateway until [`Hub::shutdown`] is called.
    pub async fn run(&self) -> Result<()> {
        let (control_tx, control_rx) = mpsc::unbounded_channel();

        // Bus: one bounded shard per worker, routed by source id.
        let mut shards = Vec::with_capacity(self.config.workers);
        let mut worker_handles = Vec::with_capacity(self.config.workers);
        for worker_id in 0..self.config.workers {
            let (tx, rx) = mpsc::channel(self.config.bus_capacity);
            shards.push(tx);
            let worker = PublishWorker::new(
                worker_id,
                rx,
                Arc::clone(&self.table),
                self.config.clone(),
            );
            worker_handles.push(tokio::spawn(worker.run()));
        }

        let multiplexer = Multiplexer::new(Arc::clone(&self.table), control_rx, shards);
        let multiplexer_handle = tokio::spawn(multiplexer.run(self.shutdown_tx.subscribe()));

        let poller = Poller::new(
            self.store.clone(),
            Arc::clone(&self.table),
            control_tx,
            self.config.clone(),
        );
        let poller_handle = tokio::spawn(poller.run(self.shutdown_tx.subscribe()));

        info!(
            "hub running: {} workers, demux {}, registry {}",
            self.config.workers, self.config.demux, self.config.registry_path
        );

        // The poller holds the control sender and the multiplexer the
        // shard senders, so joining in this order lets each downstream
        // stage drain what its upstream produced.
        poller_handle
            .await
            .map_err(|e| HubError::Internal(format!("poller task: {}", e)))?;
        multiplexer_handle
            .await
            .map_err(|e| HubError::Internal(format!("multiplexer task: {}", e)))?;
        for handle in worker_handles {
            handle
                .await
                .map_err(|e| HubError::Internal(format!("worker task: {}", e)))?;
        }

        info!("hub stopped");
        Ok(())
    }
}
