//! The uplink: a single persistent WebSocket to the cloud, with automatic
//! reconnection, and the routing table that fans decoded envelopes out to
//! the broker, the TCP device server, or the camera manager (spec §4.7).

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{error, info, warn};

use crate::camera::manager::CameraManager;
use crate::codec::{self, Message, MessageEvent};
use crate::config::RouterConfig;
use crate::device_tcp::DeviceTcpServer;
use crate::mqtt::DeviceBroker;
use crate::ota::OtaClient;

const RECONNECT_DELAY: std::time::Duration = std::time::Duration::from_secs(5);
const WRITER_IDLE_DELAY: std::time::Duration = std::time::Duration::from_millis(100);

/// Append-only handle onto the uplink's outbound queue. Clonable and handed
/// to every subsystem that needs to talk to the cloud (`send_to_server` in
/// the original design).
#[derive(Clone)]
pub struct UplinkSink {
    pub(crate) tx: mpsc::UnboundedSender<Message>,
}

impl UplinkSink {
    pub fn send(&self, message: Message) {
        // An unbounded channel only fails to send once the router itself
        // has shut down; there is nowhere useful to propagate that here.
        let _ = self.tx.send(message);
    }
}

pub struct Router {
    config: RouterConfig,
    outbound_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Message>>,
    uplink: UplinkSink,
    device_tcp: Arc<DeviceTcpServer>,
    camera_manager: Arc<CameraManager>,
    broker: DeviceBroker,
    ota: Arc<OtaClient>,
}

impl Router {
    /// Assembles a `Router` from collaborators already bound to a shared
    /// `UplinkSink`, avoiding the Router<->Broker construction cycle
    /// (spec §9): the broker only ever needed the sink, not a back-reference
    /// to the router itself.
    pub fn from_parts(
        config: RouterConfig,
        uplink: UplinkSink,
        outbound_rx: mpsc::UnboundedReceiver<Message>,
        device_tcp: Arc<DeviceTcpServer>,
        camera_manager: Arc<CameraManager>,
        broker: DeviceBroker,
        ota: Arc<OtaClient>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            outbound_rx: tokio::sync::Mutex::new(outbound_rx),
            uplink,
            device_tcp,
            camera_manager,
            broker,
            ota,
        })
    }

    pub fn uplink(&self) -> UplinkSink {
        self.uplink.clone()
    }

    /// Runs forever: connect, run reader/writer until the socket drops,
    /// sleep, reconnect. No bounded retry (spec §4.7, §7 `TransportDropped`).
    pub async fn run(self: Arc<Self>) {
        let uri = self.config.uplink_uri();
        loop {
            info!("connecting to uplink {uri}");
            match tokio_tungstenite::connect_async(&uri).await {
                Ok((stream, _response)) => {
                    info!("uplink connected");
                    let (mut write, mut read) = stream.split();

                    let reader = self.clone();
                    let read_task = tokio::spawn(async move {
                        while let Some(frame) = read.next().await {
                            match frame {
                                Ok(WsMessage::Text(text)) => reader.handle_downlink(text.as_bytes()).await,
                                Ok(WsMessage::Binary(bytes)) => reader.handle_downlink(&bytes).await,
                                Ok(WsMessage::Close(_)) => break,
                                Ok(_) => {}
                                Err(e) => {
                                    warn!("uplink read error: {e}");
                                    break;
                                }
                            }
                        }
                    });

                    let write_task = {
                        let this = self.clone();
                        tokio::spawn(async move {
                            let mut rx = this.outbound_rx.lock().await;
                            loop {
                                match rx.try_recv() {
                                    Ok(message) => match codec::encode(&message) {
                                        Ok(bytes) => {
                                            if write.send(WsMessage::Binary(bytes.into())).await.is_err() {
                                                break;
                                            }
                                        }
                                        Err(e) => error!("failed to encode outbound envelope: {e}"),
                                    },
                                    Err(mpsc::error::TryRecvError::Empty) => {
                                        tokio::time::sleep(WRITER_IDLE_DELAY).await;
                                    }
                                    Err(mpsc::error::TryRecvError::Disconnected) => break,
                                }
                            }
                        })
                    };

                    tokio::select! {
                        _ = read_task => {}
                        _ = write_task => {}
                    }
                    warn!("uplink connection ended, reconnecting in {RECONNECT_DELAY:?}");
                }
                Err(e) => {
                    error!("failed to connect to uplink: {e}");
                }
            }
            tokio::time::sleep(RECONNECT_DELAY).await;
        }
    }

    async fn handle_downlink(&self, bytes: &[u8]) {
        let message = match codec::decode(bytes) {
            Ok(message) => message,
            Err(e) => {
                warn!("dropping malformed downlink envelope: {e}");
                return;
            }
        };

        if message.message_event == MessageEvent::UpdateFirmware {
            let ota = self.ota.clone();
            tokio::spawn(async move {
                ota.handle_update_firmware(message).await;
            });
            return;
        }

        if message.device_id == "camera" {
            let camera_manager = self.camera_manager.clone();
            tokio::spawn(async move {
                camera_manager.dispatch(message).await;
            });
            return;
        }

        if self.device_tcp.send_to_device(&message.device_id, &message).await {
            return;
        }

        self.broker.publish(message).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn uplink_sink_is_fifo_per_producer() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = UplinkSink { tx };
        sink.send(Message::health_check("aa:bb:cc:dd:ee:ff"));
        sink.send(Message::device_disconnect("aa:bb:cc:dd:ee:ff"));

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.message_event, MessageEvent::HealthCheck);
        assert_eq!(second.message_event, MessageEvent::DeviceDisconnect);
    }
}
