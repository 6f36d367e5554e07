//! Event multiplexer: one select loop over every open socket plus the
//! control channel.
//!
//! The multiplexer is the only component that registers, deregisters, or
//! closes sockets. The poller asks for teardown through [`HubCommand`]s
//! rather than touching the watch set itself, so registration in the
//! watch set, membership in the connection table, and the socket's
//! lifetime never drift apart.

use super::connection::ConnectionTable;
use super::dialer::RECV_BUFFER_SIZE;
use super::{BusMessage, HubCommand};
use bytes::Bytes;
use futures::{stream, StreamExt};
use std::pin::Pin;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio_stream::StreamMap;
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};

/// What one socket produced on a poll.
enum SocketEvent {
    Data(Bytes),
    Failed(std::io::Error),
    Eof,
}

type SourceStream = Pin<Box<dyn futures::Stream<Item = SocketEvent> + Send>>;

/// Wrap a connected socket so EOF surfaces as an explicit event instead
/// of the stream silently draining out of the map.
fn watch(sock: TcpStream) -> SourceStream {
    let reader = ReaderStream::with_capacity(sock, RECV_BUFFER_SIZE);
    Box::pin(
        reader
            .map(|read| match read {
                Ok(chunk) => SocketEvent::Data(chunk),
                Err(e) => SocketEvent::Failed(e),
            })
            .chain(stream::once(async { SocketEvent::Eof })),
    )
}

pub struct Multiplexer {
    table: Arc<ConnectionTable>,
    control_rx: mpsc::UnboundedReceiver<HubCommand>,
    /// One bounded sender per publish worker; a source is pinned to the
    /// shard `source_id % shards.len()` so its bytes are always drained
    /// by the same worker, in order.
    shards: Vec<mpsc::Sender<BusMessage>>,
}

impl Multiplexer {
    pub fn new(
        table: Arc<ConnectionTable>,
        control_rx: mpsc::UnboundedReceiver<HubCommand>,
        shards: Vec<mpsc::Sender<BusMessage>>,
    ) -> Self {
        Self {
            table,
            control_rx,
            shards,
        }
    }

    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        let mut streams: StreamMap<i64, SourceStream> = StreamMap::new();
        info!("multiplexer started");

        loop {
            tokio::select! {
                _ = shutdown.recv() => break,

                cmd = self.control_rx.recv() => {
                    let Some(cmd) = cmd else { break };
                    self.apply(&mut streams, cmd);
                    // Drain everything the poller queued in this cycle.
                    while let Ok(cmd) = self.control_rx.try_recv() {
                        self.apply(&mut streams, cmd);
                    }
                }

                Some((source_id, event)) = streams.next(), if !streams.is_empty() => {
                    match event {
                        SocketEvent::Data(chunk) => self.forward(source_id, chunk),
                        SocketEvent::Eof => {
                            info!("source {}: connection closed by peer", source_id);
                            self.teardown(&mut streams, source_id);
                        }
                        SocketEvent::Failed(e) => {
                            warn!("source {}: read error: {}", source_id, e);
                            self.teardown(&mut streams, source_id);
                        }
                    }
                }
            }
        }

        // Shutdown: dropping the watch set closes every socket; the table
        // is emptied in the same step.
        streams.clear();
        self.table.clear();
        info!("multiplexer stopped");
    }

    fn apply(&mut self, streams: &mut StreamMap<i64, SourceStream>, cmd: HubCommand) {
        match cmd {
            HubCommand::Register { source_id, stream } => {
                if streams.insert(source_id, watch(stream)).is_some() {
                    warn!("source {}: replaced an already-watched socket", source_id);
                }
            }
            HubCommand::Close { source_id } => {
                if streams.remove(&source_id).is_some() {
                    self.table.remove(source_id);
                    info!("source {}: closing connection", source_id);
                } else {
                    // Already torn down (EOF raced the signal); no-op.
                    debug!("source {}: close signal for unknown connection", source_id);
                }
            }
        }
    }

    /// Deregister, close, and forget a connection in one step.
    fn teardown(&self, streams: &mut StreamMap<i64, SourceStream>, source_id: i64) {
        streams.remove(&source_id);
        self.table.remove(source_id);
    }

    fn forward(&self, source_id: i64, chunk: Bytes) {
        let shard = &self.shards[(source_id as usize) % self.shards.len()];
        match shard.try_send(BusMessage {
            source_id,
            payload: chunk,
        }) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                // Never block socket reads on a slow publisher; shedding
                // here is what keeps upstream TCP windows open.
                warn!("source {}: bus shard full, dropping read", source_id);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("source {}: bus shard closed", source_id);
            }
        }
    }
}
