//! Device broker: a persistent MQTTv5 session fanning envelopes between the
//! uplink and MQTT-attached devices (spec §4.2).

use std::collections::VecDeque;
use std::sync::Arc;

use rumqttc::v5::mqttbytes::v5::Packet;
use rumqttc::v5::mqttbytes::QoS;
use rumqttc::v5::{AsyncClient, Event, MqttOptions};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::codec::{self, Message};
use crate::config::RouterConfig;
use crate::router::UplinkSink;

const CLIENT_ID: &str = "Hub";
const SESSION_EXPIRY_SECS: u32 = 3600;
const SUBSCRIBE_TOPIC: &str = "hub";
const RECONNECT_DELAY: std::time::Duration = std::time::Duration::from_secs(5);

/// Handle to the running broker. Cheap to clone; shared by the router and
/// the OTA client as the single unicast/broadcast publish path to MQTT
/// devices.
#[derive(Clone)]
pub struct DeviceBroker {
    client: AsyncClient,
    connected: Arc<std::sync::atomic::AtomicBool>,
    offline_queue: Arc<Mutex<VecDeque<Message>>>,
}

impl DeviceBroker {
    /// Connects to the broker and spawns the background event loop that
    /// drives reconnection and incoming-message delivery. `uplink` is
    /// where decoded `hub`-topic messages are forwarded.
    pub fn start(config: &RouterConfig, uplink: UplinkSink) -> Self {
        let mut options = MqttOptions::new(CLIENT_ID, config.mqtt_url.clone(), config.mqtt_port);
        options.set_clean_start(false);
        options.set_session_expiry_interval(Some(SESSION_EXPIRY_SECS));
        options.set_keep_alive(std::time::Duration::from_secs(60));

        let (client, mut eventloop) = AsyncClient::new(options, 256);

        let broker = Self {
            client,
            connected: Arc::new(std::sync::atomic::AtomicBool::new(false)),
            offline_queue: Arc::new(Mutex::new(VecDeque::new())),
        };

        let loop_client = broker.client.clone();
        let loop_connected = broker.connected.clone();
        let loop_queue = broker.offline_queue.clone();
        let loop_uplink = uplink;

        tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("connected to MQTT broker");
                        loop_connected.store(true, std::sync::atomic::Ordering::SeqCst);
                        if let Err(e) = loop_client.subscribe(SUBSCRIBE_TOPIC, QoS::AtLeastOnce).await {
                            error!("failed to subscribe to {SUBSCRIBE_TOPIC}: {e}");
                        }
                        drain_offline_queue(&loop_client, &loop_queue).await;
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        if publish.payload.is_empty() {
                            continue;
                        }
                        match codec::decode(&publish.payload) {
                            Ok(message) => loop_uplink.send(message),
                            Err(e) => warn!("dropping malformed MQTT envelope: {e}"),
                        }
                    }
                    Ok(Event::Incoming(Packet::Disconnect(_))) => {
                        warn!("disconnected from MQTT broker");
                        loop_connected.store(false, std::sync::atomic::Ordering::SeqCst);
                    }
                    Ok(_) => {}
                    Err(e) => {
                        debug!("MQTT event loop error: {e}");
                        loop_connected.store(false, std::sync::atomic::Ordering::SeqCst);
                        tokio::time::sleep(RECONNECT_DELAY).await;
                    }
                }
            }
        });

        broker
    }

    /// Publish a downlink envelope. If currently disconnected, the message
    /// is queued and flushed FIFO on the next successful connect.
    pub async fn publish(&self, message: Message) {
        if !self.connected.load(std::sync::atomic::Ordering::SeqCst) {
            self.offline_queue.lock().await.push_back(message);
            return;
        }
        if let Err(e) = publish_one(&self.client, &message).await {
            error!("MQTT publish failed, queueing for retry: {e}");
            self.offline_queue.lock().await.push_back(message);
        }
    }

    fn topic_for(message: &Message) -> String {
        if message.message_event.is_broadcast() {
            "device/broadcast/".to_string()
        } else {
            format!("device/{}/", message.device_id)
        }
    }
}

async fn publish_one(client: &AsyncClient, message: &Message) -> Result<(), rumqttc::v5::ClientError> {
    let topic = DeviceBroker::topic_for(message);
    let payload = codec::encode(message).unwrap_or_default();
    client.publish(topic, QoS::AtLeastOnce, false, payload).await
}

async fn drain_offline_queue(client: &AsyncClient, queue: &Arc<Mutex<VecDeque<Message>>>) {
    let mut queue = queue.lock().await;
    while let Some(message) = queue.pop_front() {
        if let Err(e) = publish_one(client, &message).await {
            error!("failed to drain offline MQTT queue entry: {e}");
            queue.push_front(message);
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{MessageEvent, MessageType};

    #[test]
    fn broadcast_topic_only_for_get_connected_devices() {
        let broadcast = Message::new(
            MessageType::Request,
            MessageEvent::GetConnectedDevices,
            "camera",
            serde_json::json!({}),
        );
        assert_eq!(DeviceBroker::topic_for(&broadcast), "device/broadcast/");

        let unicast = Message::new(
            MessageType::Request,
            MessageEvent::SetSettings,
            "aa:bb:cc:dd:ee:ff",
            serde_json::json!({}),
        );
        assert_eq!(DeviceBroker::topic_for(&unicast), "device/aa:bb:cc:dd:ee:ff/");
    }
}
