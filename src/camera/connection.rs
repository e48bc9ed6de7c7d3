//! A single RTSP camera connection, opened lazily and shared by every
//! WebRTC session currently viewing it (spec §4.4).

use std::collections::HashSet;

use tokio::sync::{watch, Mutex};
use tracing::{error, info, warn};

use crate::errors::{Result, RouterError};
use crate::rtsp_client::{self, MediaSample, RtspSource};

enum State {
    Unopened,
    Open(RtspSource),
    Failed(String),
}

/// Fresh per-session subscriptions onto a connection's tracks. Each call to
/// [`CameraConnection::get_tracks`] hands out new broadcast receivers so one
/// slow viewer can't starve another (the `MediaRelay.subscribe` idiom).
pub struct Tracks {
    pub video: Option<tokio::sync::broadcast::Receiver<MediaSample>>,
    pub audio: Option<tokio::sync::broadcast::Receiver<MediaSample>>,
}

pub struct CameraConnection {
    rtsp_url: String,
    state: Mutex<State>,
    opened_tx: watch::Sender<bool>,
    opened_rx: watch::Receiver<bool>,
    sessions: Mutex<HashSet<String>>,
}

impl CameraConnection {
    pub fn new(rtsp_url: impl Into<String>) -> Self {
        let (opened_tx, opened_rx) = watch::channel(false);
        Self {
            rtsp_url: rtsp_url.into(),
            state: Mutex::new(State::Unopened),
            opened_tx,
            opened_rx,
            sessions: Mutex::new(HashSet::new()),
        }
    }

    /// Dials the camera if it isn't already open or already failed. Safe to
    /// call concurrently: only the first caller actually dials. The opened
    /// gate is signalled whether the dial succeeds or fails, so
    /// [`get_tracks`] never hangs waiting on a camera that isn't coming up.
    pub async fn open(&self) {
        let mut state = self.state.lock().await;
        if !matches!(*state, State::Unopened) {
            return;
        }
        match rtsp_client::dial(&self.rtsp_url).await {
            Ok(source) => {
                info!("[{}] camera connection opened", self.rtsp_url);
                *state = State::Open(source);
            }
            Err(e) => {
                error!("[{}] camera connection failed: {e}", self.rtsp_url);
                *state = State::Failed(e.to_string());
            }
        }
        let _ = self.opened_tx.send(true);
    }

    pub async fn get_tracks(&self) -> Result<Tracks> {
        let mut opened_rx = self.opened_rx.clone();
        if !*opened_rx.borrow() {
            opened_rx
                .changed()
                .await
                .map_err(|_| RouterError::camera_unavailable("camera connection closed while opening"))?;
        }

        let state = self.state.lock().await;
        match &*state {
            State::Open(source) => Ok(Tracks {
                video: source.video.as_ref().map(|tx| tx.subscribe()),
                audio: source.audio.as_ref().map(|tx| tx.subscribe()),
            }),
            State::Failed(reason) => Err(RouterError::camera_unavailable(reason.clone())),
            State::Unopened => Err(RouterError::camera_unavailable("camera not available")),
        }
    }

    pub async fn add_session(&self, token: &str) {
        self.sessions.lock().await.insert(token.to_string());
    }

    /// Removes `token` from the viewer set and reports whether any viewer
    /// remains, so the manager knows whether to tear the connection down.
    pub async fn remove_session(&self, token: &str) -> bool {
        let mut sessions = self.sessions.lock().await;
        sessions.remove(token);
        !sessions.is_empty()
    }

    /// Closes the RTSP session and resets the opened gate so a future
    /// `open()` dials again from scratch.
    pub async fn stop(&self) {
        let mut state = self.state.lock().await;
        *state = State::Unopened;
        self.sessions.lock().await.clear();
        let _ = self.opened_tx.send(false);
        warn!("[{}] camera connection stopped", self.rtsp_url);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn get_tracks_before_open_reports_unavailable_once_failed() {
        let connection = CameraConnection::new("rtsp://127.0.0.1:1/does-not-exist");
        connection.open().await;
        let result = connection.get_tracks().await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn session_bookkeeping_tracks_remaining_viewers() {
        let connection = CameraConnection::new("rtsp://example.invalid/stream");
        connection.add_session("a").await;
        connection.add_session("b").await;
        assert!(connection.remove_session("a").await);
        assert!(!connection.remove_session("b").await);
    }

    #[tokio::test]
    async fn stop_resets_opened_gate_for_a_future_open() {
        let connection = CameraConnection::new("rtsp://127.0.0.1:1/does-not-exist");
        connection.open().await;
        connection.stop().await;
        assert!(!*connection.opened_rx.borrow());
    }
}
