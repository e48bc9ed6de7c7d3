//! Orchestrates camera connections and WebRTC viewing sessions: one
//! `CameraConnection` per RTSP URL shared across viewers, one
//! `CameraSession` per viewer token (spec §4.4-§4.6).

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{error, warn};

use crate::camera::connection::CameraConnection;
use crate::camera::session::{dial_error_message, CameraSession};
use crate::codec::{Message, MessageEvent};
use crate::router::UplinkSink;

pub struct CameraManager {
    connections: tokio::sync::Mutex<HashMap<String, Arc<CameraConnection>>>,
    sessions: tokio::sync::Mutex<HashMap<String, (Arc<CameraSession>, String)>>,
    uplink: UplinkSink,
}

impl CameraManager {
    pub fn new(uplink: UplinkSink) -> Arc<Self> {
        Arc::new(Self {
            connections: tokio::sync::Mutex::new(HashMap::new()),
            sessions: tokio::sync::Mutex::new(HashMap::new()),
            uplink,
        })
    }

    /// Handles one downlink envelope addressed to `device_id == "camera"`.
    pub async fn dispatch(self: Arc<Self>, message: Message) {
        match &message.message_event {
            MessageEvent::CameraOffer => self.handle_offer(message).await,
            MessageEvent::CameraDisconnect => self.handle_disconnect(message).await,
            other => warn!("camera manager ignoring unsupported event {other:?}"),
        }
    }

    async fn handle_offer(self: Arc<Self>, message: Message) {
        let Some(token) = message.payload.get("token").and_then(|v| v.as_str()).map(str::to_string) else {
            warn!("camera_offer missing token, dropping");
            return;
        };
        let Some(rtsp) = message.payload.get("rtsp").and_then(|v| v.as_str()).map(str::to_string) else {
            warn!("camera_offer missing rtsp url, dropping");
            return;
        };

        let connection = self.connection_for(&rtsp).await;
        connection.open().await;
        connection.add_session(&token).await;

        let tracks = match connection.get_tracks().await {
            Ok(tracks) => tracks,
            Err(e) => {
                error!("[{token}] failed to acquire camera tracks: {e}");
                let text = dial_error_message(&e.to_string());
                self.uplink.send(error_message(&token, &message.message_id, text));
                if !connection.remove_session(&token).await {
                    connection.stop().await;
                }
                return;
            }
        };

        let session = match CameraSession::new(token.clone(), tracks).await {
            Ok(session) => session,
            Err(e) => {
                error!("[{token}] failed to create camera session: {e}");
                self.uplink.send(error_message(&token, &message.message_id, &e.to_string()));
                if !connection.remove_session(&token).await {
                    connection.stop().await;
                }
                return;
            }
        };

        let answer = session.handle_offer(&message.payload, &message.message_id).await;

        let manager = self.clone();
        session.on_close(token.clone(), move |token| {
            let manager = manager.clone();
            tokio::spawn(async move {
                manager.delete_session(&token).await;
            });
        });

        self.sessions.lock().await.insert(token, (session, rtsp));
        self.uplink.send(answer);
    }

    async fn handle_disconnect(self: Arc<Self>, message: Message) {
        let Some(token) = message.payload.get("token").and_then(|v| v.as_str()) else {
            warn!("camera_disconnect missing token, dropping");
            return;
        };
        self.delete_session(token).await;
    }

    /// Idempotent cleanup: stops the session, removes it from the viewer
    /// set of its connection, and tears the connection down once no
    /// viewer remains. Safe to call more than once for the same token.
    pub async fn delete_session(&self, token: &str) {
        let entry = self.sessions.lock().await.remove(token);
        let Some((session, rtsp)) = entry else {
            return;
        };
        session.stop().await;

        let connection = self.connections.lock().await.get(&rtsp).cloned();
        if let Some(connection) = connection {
            let has_viewers = connection.remove_session(token).await;
            if !has_viewers {
                connection.stop().await;
            }
        }
    }

    async fn connection_for(&self, rtsp: &str) -> Arc<CameraConnection> {
        let mut connections = self.connections.lock().await;
        connections
            .entry(rtsp.to_string())
            .or_insert_with(|| Arc::new(CameraConnection::new(rtsp)))
            .clone()
    }
}

fn error_message(token: &str, message_id: &str, error: &str) -> Message {
    let mut message = Message::new(
        crate::codec::MessageType::Response,
        MessageEvent::CameraError,
        "camera",
        serde_json::json!({ "token": token, "error": error }),
    );
    message.message_id = message_id.to_string();
    message
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn delete_session_on_unknown_token_is_a_no_op() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let manager = CameraManager::new(UplinkSink { tx });
        manager.delete_session("no-such-token").await;
    }
}
