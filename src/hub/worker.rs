//! Publish workers: drain one bus shard each and publish to MQTT.
//!
//! Every worker owns its own broker client. The rumqttc event loop is
//! polled in a background task which doubles as the reconnect handler:
//! on connection errors it backs off and polls again without ever
//! blocking the dequeue loop. A failed publish is logged and the next
//! message is still processed.

use super::connection::ConnectionTable;
use super::BusMessage;
use crate::config::GatewayConfig;
use crate::rtcm;
use bytes::Bytes;
use rumqttc::{AsyncClient, Event, MqttOptions, Outgoing, Packet, QoS};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const MAX_BACKOFF_SECS: u64 = 30;

/// How long a worker waits for its event loop to flush the final
/// disconnect before abandoning it.
const DISCONNECT_FLUSH_WAIT: Duration = Duration::from_secs(1);

fn random_suffix(len: usize) -> String {
    use rand::{distributions::Alphanumeric, Rng};
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// Resolve one bus message into the publishes it produces, as
/// `(topic, payload)` pairs.
///
/// The connection may have been torn down while the message sat on the
/// bus; stale bytes are dropped, not buffered. In demux mode the bytes
/// first pass through the connection's accumulation buffer, so a frame
/// split across bus messages is emitted exactly once, when its tail
/// arrives.
fn publishes_for(table: &ConnectionTable, msg: &BusMessage, demux: bool) -> Vec<(String, Bytes)> {
    let Some(entry) = table.get(msg.source_id) else {
        debug!(
            "source {}: dropping bytes for closed connection",
            msg.source_id
        );
        return Vec::new();
    };

    if demux {
        let frames = {
            let mut buffer = entry.buffer.lock();
            buffer.extend_from_slice(&msg.payload);
            rtcm::extract_frames(&mut buffer)
        };
        frames
            .into_iter()
            .map(|frame| {
                (
                    format!("{}/{}", entry.base_topic, frame.message_type),
                    frame.bytes,
                )
            })
            .collect()
    } else if !msg.payload.is_empty() {
        vec![(entry.base_topic.clone(), msg.payload.clone())]
    } else {
        Vec::new()
    }
}

pub struct PublishWorker {
    id: usize,
    rx: mpsc::Receiver<BusMessage>,
    table: Arc<ConnectionTable>,
    config: GatewayConfig,
}

impl PublishWorker {
    pub fn new(
        id: usize,
        rx: mpsc::Receiver<BusMessage>,
        table: Arc<ConnectionTable>,
        config: GatewayConfig,
    ) -> Self {
        Self {
            id,
            rx,
            table,
            config,
        }
    }

    pub async fn run(mut self) {
        let client_id = format!("ntriphub-{:02}-{}", self.id, random_suffix(8));
        let mut options = MqttOptions::new(
            client_id.clone(),
            &self.config.mqtt_host,
            self.config.mqtt_port,
        );
        options.set_keep_alive(Duration::from_secs(60));
        if let (Some(user), Some(pass)) = (&self.config.mqtt_username, &self.config.mqtt_password)
        {
            options.set_credentials(user, pass);
        }

        let (client, mut eventloop) = AsyncClient::new(options, 100);
        let running = Arc::new(AtomicBool::new(true));

        // Event-loop task: delivers outgoing publishes and reconnects
        // with bounded backoff whenever the broker drops us. It exits on
        // its own once the orderly disconnect has been written out.
        let poll_flag = running.clone();
        let poll_id = client_id.clone();
        let mut poll_handle = tokio::spawn(async move {
            let mut consecutive_errors: u32 = 0;
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("mqtt client {} connected", poll_id);
                        consecutive_errors = 0;
                    }
                    // Requests are written in order, so by the time the
                    // disconnect goes out every queued publish has too.
                    Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                        debug!("mqtt client {} disconnected", poll_id);
                        break;
                    }
                    Ok(_) => consecutive_errors = 0,
                    Err(_) if !poll_flag.load(Ordering::SeqCst) => break,
                    Err(e) => {
                        consecutive_errors += 1;
                        let backoff =
                            (1u64 << (consecutive_errors - 1).min(5)).min(MAX_BACKOFF_SECS);
                        warn!(
                            "mqtt client {} connection error: {:?}, retrying in {}s",
                            poll_id, e, backoff
                        );
                        tokio::time::sleep(Duration::from_secs(backoff)).await;
                    }
                }
            }
        });

        info!("publish worker {} started as {}", self.id, client_id);

        // Exits when the multiplexer drops its shard sender, after any
        // queued messages have been drained - no publish is cut short.
        while let Some(msg) = self.rx.recv().await {
            self.handle(&client, msg).await;
        }

        // Request an orderly disconnect and give the event loop a
        // bounded window to flush it; a client stuck in reconnect
        // backoff has nothing to flush and is abandoned instead.
        let _ = client.disconnect().await;
        if tokio::time::timeout(DISCONNECT_FLUSH_WAIT, &mut poll_handle)
            .await
            .is_err()
        {
            running.store(false, Ordering::SeqCst);
            poll_handle.abort();
        }
        info!("publish worker {} stopped", self.id);
    }

    async fn handle(&self, client: &AsyncClient, msg: BusMessage) {
        for (topic, payload) in publishes_for(&self.table, &msg, self.config.demux) {
            if let Err(e) = client.publish(topic, QoS::AtMostOnce, false, payload).await {
                warn!("source {}: mqtt publish error: {}", msg.source_id, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::connection::ConnectionEntry;
    use crate::rtcm::PREAMBLE;
    use crate::source::SourceUrl;

    fn table_with_entry(source_id: i64) -> Arc<ConnectionTable> {
        let table = Arc::new(ConnectionTable::new());
        let url = SourceUrl::parse(&format!("ntrip://caster:2101/M{}", source_id)).unwrap();
        let topic = url.topic("s2d/osr");
        table.insert(Arc::new(ConnectionEntry::new(source_id, url, topic)));
        table
    }

    fn frame(message_type: u16, payload_len: usize) -> Vec<u8> {
        assert!(payload_len >= 2 && payload_len < 1024);
        let mut out = vec![
            PREAMBLE,
            (payload_len >> 8) as u8,
            (payload_len & 0xFF) as u8,
        ];
        let type_bits = message_type << 4;
        out.push((type_bits >> 8) as u8);
        out.push((type_bits & 0xFF) as u8);
        out.extend(std::iter::repeat(0xAB).take(payload_len - 2));
        out.extend_from_slice(&[0x01, 0x02, 0x03]);
        out
    }

    fn msg(source_id: i64, payload: &[u8]) -> BusMessage {
        BusMessage {
            source_id,
            payload: Bytes::copy_from_slice(payload),
        }
    }

    #[test]
    fn test_message_for_removed_connection_publishes_nothing() {
        let table = Arc::new(ConnectionTable::new());
        assert!(publishes_for(&table, &msg(5, b"late bytes"), false).is_empty());
        assert!(publishes_for(&table, &msg(5, &frame(1005, 19)), true).is_empty());
    }

    #[test]
    fn test_raw_mode_publishes_bytes_on_base_topic() {
        let table = table_with_entry(3);
        let publishes = publishes_for(&table, &msg(3, b"correction bytes"), false);
        assert_eq!(publishes.len(), 1);
        assert_eq!(publishes[0].0, "s2d/osr/M3/rtcm");
        assert_eq!(&publishes[0].1[..], b"correction bytes");

        assert!(publishes_for(&table, &msg(3, b""), false).is_empty());
    }

    #[test]
    fn test_demux_publishes_one_message_per_frame_subtopic() {
        let table = table_with_entry(4);
        let mut wire = frame(1005, 19);
        wire.extend(frame(1077, 40));

        let publishes = publishes_for(&table, &msg(4, &wire), true);
        assert_eq!(publishes.len(), 2);
        assert_eq!(publishes[0].0, "s2d/osr/M4/rtcm/1005");
        assert_eq!(publishes[1].0, "s2d/osr/M4/rtcm/1077");
        // Frames go out verbatim, preamble through CRC.
        assert_eq!(&publishes[0].1[..], &frame(1005, 19)[..]);
    }

    #[test]
    fn test_frame_split_across_bus_messages_publishes_once() {
        let table = table_with_entry(6);
        let wire = frame(1074, 24);

        // The head alone stays in the connection's accumulation buffer.
        let first = publishes_for(&table, &msg(6, &wire[..10]), true);
        assert!(first.is_empty());
        assert!(!table.get(6).unwrap().buffer.lock().is_empty());

        // The tail completes it: exactly one publish, buffer drained.
        let second = publishes_for(&table, &msg(6, &wire[10..]), true);
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].0, "s2d/osr/M6/rtcm/1074");
        assert_eq!(&second[0].1[..], &wire[..]);
        assert!(table.get(6).unwrap().buffer.lock().is_empty());
    }
}
