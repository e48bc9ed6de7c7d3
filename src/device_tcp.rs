//! Legacy device transport: line-delimited JSON over raw TCP, with
//! generation tokens to resolve reconnect races (spec §4.3).

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::codec::{self, Message};
use crate::router::UplinkSink;

const LISTEN_ADDR: &str = "0.0.0.0:8080";
const HANDSHAKE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);
const READ_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(90);
const WRITER_IDLE_DELAY: std::time::Duration = std::time::Duration::from_millis(100);
const MAX_FRAME: usize = 1024;

struct DeviceEntry {
    generation: u64,
    outbound: Mutex<VecDeque<Vec<u8>>>,
}

/// Single-writer table of live TCP devices, keyed by MAC. Read by the
/// router on every downlink envelope for a MAC not claimed by MQTT.
pub struct DeviceTcpServer {
    devices: Mutex<HashMap<String, Arc<DeviceEntry>>>,
    next_generation: AtomicU64,
    uplink: UplinkSink,
}

impl DeviceTcpServer {
    pub fn new(uplink: UplinkSink) -> Arc<Self> {
        Arc::new(Self {
            devices: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(1),
            uplink,
        })
    }

    /// Enqueues `message` for MAC `device_id` if it currently lives on TCP.
    /// Returns `false` (no-op) if the MAC isn't a live TCP device, letting
    /// the router fall back to the broker. Routing is by presence in this
    /// table alone (spec §4.7) — never skipped for lock contention.
    pub async fn send_to_device(&self, device_id: &str, message: &Message) -> bool {
        let Ok(bytes) = codec::encode(message) else {
            return false;
        };
        let devices = self.devices.lock().await;
        match devices.get(device_id) {
            Some(entry) => {
                let entry = entry.clone();
                drop(devices);
                entry.outbound.lock().await.push_back(bytes);
                true
            }
            None => false,
        }
    }

    /// Whether `mac`'s current table entry is still the one tagged
    /// `generation` — re-checked every loop iteration so a reconnect that
    /// replaces the table entry promptly retires the superseded socket's
    /// reader/writer loops (spec §4.3 scenario 2).
    async fn is_current(&self, mac: &str, generation: u64) -> bool {
        self.devices.lock().await.get(mac).is_some_and(|e| e.generation == generation)
    }

    pub async fn run(self: Arc<Self>) {
        let listener = match TcpListener::bind(LISTEN_ADDR).await {
            Ok(listener) => listener,
            Err(e) => {
                tracing::error!("failed to bind device TCP server on {LISTEN_ADDR}: {e}");
                return;
            }
        };
        info!("device TCP server listening on {LISTEN_ADDR}");

        loop {
            match listener.accept().await {
                Ok((stream, peer_addr)) => {
                    let this = self.clone();
                    tokio::spawn(async move {
                        this.handle_connection(stream, peer_addr).await;
                    });
                }
                Err(e) => warn!("failed to accept device TCP connection: {e}"),
            }
        }
    }

    async fn handle_connection(self: Arc<Self>, mut stream: TcpStream, peer_addr: std::net::SocketAddr) {
        let mut buf = vec![0u8; MAX_FRAME];
        let read_result =
            tokio::time::timeout(HANDSHAKE_TIMEOUT, stream.read(&mut buf)).await;
        let n = match read_result {
            Ok(Ok(n)) if n > 0 => n,
            _ => return,
        };

        let mut value: serde_json::Value = match serde_json::from_slice(&buf[..n]) {
            Ok(value) => value,
            Err(_) => return,
        };
        let Some(mac) = value.get("device_id").and_then(|v| v.as_str()).map(str::to_string) else {
            return;
        };

        if let Some(payload) = value.get_mut("payload") {
            if payload.is_null() {
                *payload = serde_json::json!({});
            }
        } else if let Some(obj) = value.as_object_mut() {
            obj.insert("payload".to_string(), serde_json::json!({}));
        }
        if let Some(payload) = value.get_mut("payload").and_then(|v| v.as_object_mut()) {
            payload.insert("ip".to_string(), serde_json::json!(peer_addr.ip().to_string()));
            payload.insert("port".to_string(), serde_json::json!(peer_addr.port()));
        }

        let handshake_bytes = match serde_json::to_vec(&value) {
            Ok(bytes) => bytes,
            Err(_) => return,
        };
        match codec::decode(&handshake_bytes) {
            Ok(_) => self.uplink.send_raw(handshake_bytes.clone()),
            Err(e) => {
                warn!("rejecting handshake from {mac}: {e}");
                return;
            }
        }

        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        let entry = Arc::new(DeviceEntry {
            generation,
            outbound: Mutex::new(VecDeque::new()),
        });
        {
            let mut devices = self.devices.lock().await;
            devices.insert(mac.clone(), entry.clone());
        }
        info!("device {mac} registered (generation {generation})");

        let (mut read_half, mut write_half) = stream.into_split();

        let writer_mac = mac.clone();
        let writer_entry = entry.clone();
        let writer_this = self.clone();
        let writer_task = tokio::spawn(async move {
            loop {
                if !writer_this.is_current(&writer_mac, generation).await {
                    break;
                }
                let popped = { writer_entry.outbound.lock().await.pop_front() };
                match popped {
                    Some(bytes) => {
                        if write_half.write_all(&bytes).await.is_err() {
                            break;
                        }
                    }
                    None => tokio::time::sleep(WRITER_IDLE_DELAY).await,
                }
            }
            debug!("writer loop for {writer_mac} exiting (generation {generation})");
        });

        let reader_mac = mac.clone();
        let reader_uplink = self.uplink.clone();
        let reader_this = self.clone();
        let reader_task = tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_FRAME];
            loop {
                if !reader_this.is_current(&reader_mac, generation).await {
                    break;
                }
                let read_result = tokio::time::timeout(READ_TIMEOUT, read_half.read(&mut buf)).await;
                match read_result {
                    Ok(Ok(0)) | Err(_) => break,
                    Ok(Err(_)) => break,
                    Ok(Ok(n)) => {
                        let frame = &buf[..n];
                        if frame == b"P" {
                            continue;
                        }
                        if frame.iter().all(u8::is_ascii_whitespace) {
                            continue;
                        }
                        reader_uplink.send_raw(frame.to_vec());
                    }
                }
            }
            debug!("reader loop for {reader_mac} exiting (generation {generation})");
        });

        let _ = tokio::join!(writer_task, reader_task);

        // Supersession: if a newer generation replaced us, skip the
        // synthesized disconnect (spec scenario 2) and leave the table
        // entry to the new generation's owner.
        let mut devices = self.devices.lock().await;
        if let Some(current) = devices.get(&mac) {
            if current.generation == generation {
                devices.remove(&mac);
                drop(devices);
                self.uplink.send(Message::device_disconnect(&mac));
                return;
            }
        }
    }
}

impl UplinkSink {
    fn send_raw(&self, bytes: Vec<u8>) {
        match codec::decode(&bytes) {
            Ok(message) => self.send(message),
            Err(e) => warn!("dropping malformed TCP frame: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt as _;
    use tokio::net::TcpStream;

    async fn spawn_server() -> (Arc<DeviceTcpServer>, tokio::sync::mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let uplink = UplinkSink { tx };
        let server = DeviceTcpServer::new(uplink);
        (server, rx)
    }

    #[tokio::test]
    async fn send_to_device_false_when_unknown_mac() {
        let (server, _rx) = spawn_server().await;
        let msg = Message::health_check("aa:bb:cc:dd:ee:ff");
        assert!(!server.send_to_device("aa:bb:cc:dd:ee:ff", &msg).await);
    }
}
