//! One WebRTC peer connection for one viewer of one camera (spec §4.5).

use std::sync::{Arc, OnceLock};

use regex::Regex;
use serde_json::Value;
use tracing::{info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use crate::camera::connection::Tracks;
use crate::codec::{Message, MessageEvent, MessageType};

const STUN_SERVER: &str = "stun:stun.l.google.com:19302";

/// Maps a camera errno (surfaced by RTSP/OS-level dial failures) into the
/// human text the cloud side displays.
fn errno_to_message(errno: i64) -> &'static str {
    match errno {
        1 => "Operation not permitted",
        2 => "No such file or directory",
        5 => "Input/output error",
        11 => "Resource temporarily unavailable",
        22 => "Invalid argument",
        110 => "Connection timed out",
        1414092869 => "Could not connect to camera",
        _ => "Unknown error",
    }
}

fn os_errno_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"os error (\d+)").expect("static os-errno regex"))
}

/// Maps a raw RTSP dial failure (`CameraConnection::open`'s stored error
/// text) into the human text the cloud side displays. If the underlying
/// error carries a recognizable OS errno (`... (os error N)`), that's
/// looked up in the same table `errno_to_message` uses; otherwise the
/// failure is reported as the generic "couldn't reach the camera" case,
/// since at the dial stage that's what any unrecognized failure means.
pub(crate) fn dial_error_message(raw: &str) -> &'static str {
    match os_errno_pattern().captures(raw).and_then(|c| c.get(1)).and_then(|m| m.as_str().parse().ok()) {
        Some(errno) => errno_to_message(errno),
        None => "Could not connect to camera",
    }
}

pub struct CameraSession {
    pub token: String,
    pc: Arc<RTCPeerConnection>,
}

impl CameraSession {
    pub async fn new(token: String, tracks: Tracks) -> crate::errors::Result<Arc<Self>> {
        let pc = Arc::new(create_peer_connection().await?);

        if let Some(mut rx) = tracks.video {
            let track = Arc::new(TrackLocalStaticSample::new(
                RTCRtpCodecCapability {
                    mime_type: webrtc::api::media_engine::MIME_TYPE_H264.to_string(),
                    ..Default::default()
                },
                "video".to_string(),
                token.clone(),
            ));
            pc.add_track(track.clone() as Arc<dyn TrackLocal + Send + Sync>)
                .await
                .map_err(|e| crate::errors::RouterError::webrtc(e.to_string()))?;
            tokio::spawn(async move {
                while let Ok(sample) = rx.recv().await {
                    let sample = Sample {
                        data: sample.data,
                        duration: sample.duration,
                        ..Default::default()
                    };
                    if track.write_sample(&sample).await.is_err() {
                        break;
                    }
                }
            });
        }

        if let Some(mut rx) = tracks.audio {
            let track = Arc::new(TrackLocalStaticSample::new(
                RTCRtpCodecCapability {
                    mime_type: webrtc::api::media_engine::MIME_TYPE_OPUS.to_string(),
                    ..Default::default()
                },
                "audio".to_string(),
                token.clone(),
            ));
            pc.add_track(track.clone() as Arc<dyn TrackLocal + Send + Sync>)
                .await
                .map_err(|e| crate::errors::RouterError::webrtc(e.to_string()))?;
            tokio::spawn(async move {
                while let Ok(sample) = rx.recv().await {
                    let sample = Sample {
                        data: sample.data,
                        duration: sample.duration,
                        ..Default::default()
                    };
                    if track.write_sample(&sample).await.is_err() {
                        break;
                    }
                }
            });
        }

        Ok(Arc::new(Self { token, pc }))
    }

    /// Registers the callback fired once the connection transitions to
    /// failed/disconnected/closed, mirroring the original session's
    /// `on("connectionstatechange")` cleanup hook.
    pub fn on_close<F>(&self, token: String, mut on_close: F)
    where
        F: FnMut(String) + Send + Sync + 'static,
    {
        self.pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            if matches!(
                state,
                RTCPeerConnectionState::Failed
                    | RTCPeerConnectionState::Disconnected
                    | RTCPeerConnectionState::Closed
            ) {
                on_close(token.clone());
            }
            Box::pin(async {})
        }));
    }

    /// Processes an offer and answers it, or returns a `CAMERA_ERROR`
    /// envelope if setup fails (spec §4.5's `errno`-mapped failure path).
    pub async fn handle_offer(&self, payload: &Value, message_id: &str) -> Message {
        match self.try_handle_offer(payload).await {
            Ok(answer) => Message::new(
                MessageType::Response,
                MessageEvent::CameraAnswer,
                "camera",
                serde_json::json!({ "token": self.token, "answer": answer }),
            ),
            Err(e) => {
                warn!("[{}] offer handling failed: {e}", self.token);
                self.error_message(message_id, &e.to_string())
            }
        }
    }

    async fn try_handle_offer(&self, payload: &Value) -> crate::errors::Result<Value> {
        let offer = payload
            .get("offer")
            .ok_or_else(|| crate::errors::RouterError::webrtc("offer missing from payload"))?;
        let sdp = offer
            .get("sdp")
            .and_then(|v| v.as_str())
            .ok_or_else(|| crate::errors::RouterError::webrtc("offer missing sdp"))?;
        let description = RTCSessionDescription::offer(sdp.to_string())
            .map_err(|e| crate::errors::RouterError::webrtc(e.to_string()))?;

        self.pc
            .set_remote_description(description)
            .await
            .map_err(|e| crate::errors::RouterError::webrtc(e.to_string()))?;

        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| crate::errors::RouterError::webrtc(e.to_string()))?;
        self.pc
            .set_local_description(answer)
            .await
            .map_err(|e| crate::errors::RouterError::webrtc(e.to_string()))?;

        let local = self
            .pc
            .local_description()
            .await
            .ok_or_else(|| crate::errors::RouterError::webrtc("no local description after answer"))?;

        Ok(serde_json::json!({ "sdp": local.sdp, "type": local.sdp_type.to_string() }))
    }

    pub async fn add_ice_candidate(&self, candidate: RTCIceCandidateInit) -> crate::errors::Result<()> {
        self.pc
            .add_ice_candidate(candidate)
            .await
            .map_err(|e| crate::errors::RouterError::webrtc(e.to_string()))
    }

    pub async fn stop(&self) {
        if let Err(e) = self.pc.close().await {
            warn!("[{}] error closing peer connection: {e}", self.token);
        } else {
            info!("[{}] camera session stopped", self.token);
        }
    }

    pub fn error_message(&self, message_id: &str, error: &str) -> Message {
        let mapped = parse_errno(error).map(errno_to_message).unwrap_or(error);
        let mut message = Message::new(
            MessageType::Response,
            MessageEvent::CameraError,
            "camera",
            serde_json::json!({ "token": self.token, "error": mapped }),
        );
        message.message_id = message_id.to_string();
        message
    }
}

fn parse_errno(message: &str) -> Option<i64> {
    message.trim().parse().ok()
}

async fn create_peer_connection() -> crate::errors::Result<RTCPeerConnection> {
    let mut media_engine = MediaEngine::default();
    media_engine
        .register_default_codecs()
        .map_err(|e| crate::errors::RouterError::webrtc(e.to_string()))?;

    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media_engine)
        .map_err(|e| crate::errors::RouterError::webrtc(e.to_string()))?;

    let api = APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build();

    let config = RTCConfiguration {
        ice_servers: vec![RTCIceServer {
            urls: vec![STUN_SERVER.to_string()],
            ..Default::default()
        }],
        ..Default::default()
    };

    api.new_peer_connection(config)
        .await
        .map_err(|e| crate::errors::RouterError::webrtc(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_table_matches_known_codes() {
        assert_eq!(errno_to_message(2), "No such file or directory");
        assert_eq!(errno_to_message(110), "Connection timed out");
        assert_eq!(errno_to_message(999999), "Unknown error");
    }

    #[test]
    fn parse_errno_accepts_plain_integer_messages() {
        assert_eq!(parse_errno("2"), Some(2));
        assert_eq!(parse_errno("camera offline"), None);
    }

    #[test]
    fn dial_error_message_extracts_known_os_errno() {
        assert_eq!(dial_error_message("Connection timed out (os error 110)"), "Connection timed out");
    }

    #[test]
    fn dial_error_message_falls_back_for_unreachable_host() {
        assert_eq!(dial_error_message("failed to lookup address information"), "Could not connect to camera");
    }
}
