//! Firmware OTA glue: rewrites a cloud-issued firmware URL into a local
//! LAN download so the memory-constrained device doesn't have to trust or
//! reach the cloud's TLS endpoint directly (spec §4.8).

use std::net::UdpSocket;
use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use serde::Deserialize;
use tracing::{error, info, warn};

use crate::codec::Message;
use crate::device_tcp::DeviceTcpServer;
use crate::mqtt::DeviceBroker;

const FIRMWARE_DIR: &str = "firmware";
const LISTEN_PORT: u16 = 8452;

pub struct OtaClient {
    firmware_dir: PathBuf,
    address: String,
    http: reqwest::Client,
    device_tcp: Arc<DeviceTcpServer>,
    broker: DeviceBroker,
}

impl OtaClient {
    pub fn new(device_tcp: Arc<DeviceTcpServer>, broker: DeviceBroker) -> std::io::Result<Arc<Self>> {
        let firmware_dir = PathBuf::from(FIRMWARE_DIR);
        std::fs::create_dir_all(&firmware_dir)?;
        let local_ip = local_ip();
        Ok(Arc::new(Self {
            firmware_dir,
            address: format!("http://{local_ip}:{LISTEN_PORT}/ota"),
            http: reqwest::Client::new(),
            device_tcp,
            broker,
        }))
    }

    /// Downloads the firmware referenced by an `UPDATE_FIRMWARE` envelope
    /// (caching by `<device_fun>_<version>.bin`) and forwards the envelope
    /// on to the target device with `payload.url` rewritten to the local
    /// download address. Aborts and logs on any failure rather than
    /// propagating (spec §7, `FirmwareUnavailable`).
    pub async fn handle_update_firmware(self: Arc<Self>, mut message: Message) {
        let device_fun = message.payload.get("to_device").and_then(|v| v.as_str()).map(str::to_string);
        let version = message.payload.get("version").and_then(|v| v.as_str()).map(str::to_string);
        let url = message.payload.get("url").and_then(|v| v.as_str()).map(str::to_string);

        let (Some(device_fun), Some(version), Some(url)) = (device_fun, version, url) else {
            warn!("update_firmware envelope missing to_device/version/url, aborting OTA");
            return;
        };

        let filename = format!("{device_fun}_{version}.bin");
        let filepath = self.firmware_dir.join(&filename);

        if !filepath.exists() {
            if let Err(e) = self.download(&url, &filepath).await {
                error!("firmware download failed for {filename}: {e}");
                return;
            }
        }

        if let Some(payload) = message.payload.as_object_mut() {
            payload.insert("url".to_string(), serde_json::json!(format!("{}?name={filename}", self.address)));
        }

        if self.device_tcp.send_to_device(&message.device_id, &message).await {
            return;
        }
        self.broker.publish(message).await;
    }

    async fn download(&self, url: &str, filepath: &std::path::Path) -> crate::errors::Result<()> {
        let response = self.http.get(url).send().await.map_err(|e| {
            crate::errors::RouterError::firmware_unavailable(format!("request failed: {e}"))
        })?;
        if response.status() != reqwest::StatusCode::OK {
            return Err(crate::errors::RouterError::firmware_unavailable(format!(
                "firmware server returned {}",
                response.status()
            )));
        }
        let bytes = response.bytes().await.map_err(|e| {
            crate::errors::RouterError::firmware_unavailable(format!("failed reading body: {e}"))
        })?;
        tokio::fs::write(filepath, &bytes).await?;
        Ok(())
    }
}

#[derive(Deserialize)]
struct FirmwareQuery {
    name: Option<String>,
}

async fn serve_firmware(State(ota): State<Arc<OtaClient>>, Query(query): Query<FirmwareQuery>) -> Response {
    let Some(name) = query.name else {
        return StatusCode::BAD_REQUEST.into_response();
    };
    let path = ota.firmware_dir.join(&name);
    match tokio::fs::read(&path).await {
        Ok(bytes) => (
            StatusCode::OK,
            [
                (header::CONTENT_TYPE, "application/octet-stream".to_string()),
                (header::CONTENT_DISPOSITION, "attachment; filename=\"firmware.bin\"".to_string()),
            ],
            bytes,
        )
            .into_response(),
        Err(_) => StatusCode::NOT_FOUND.into_response(),
    }
}

/// Serves `GET /ota?name=<filename>` on the LAN so devices can pull
/// firmware without needing cloud credentials.
pub async fn run(ota: Arc<OtaClient>) {
    let app = Router::new().route("/ota", get(serve_firmware)).with_state(ota);
    let addr = format!("0.0.0.0:{LISTEN_PORT}");
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("failed to bind OTA server on {addr}: {e}");
            return;
        }
    };
    info!("OTA server listening on {addr}");
    if let Err(e) = axum::serve(listener, app).await {
        error!("OTA server exited: {e}");
    }
}

/// Discovers the LAN-facing IP by connecting a UDP socket to a public
/// address and reading back the chosen local endpoint; no packet is
/// actually sent. Falls back to loopback if the network is unreachable.
fn local_ip() -> std::net::IpAddr {
    UdpSocket::bind("0.0.0.0:0")
        .and_then(|socket| {
            socket.connect("8.8.8.8:80")?;
            socket.local_addr()
        })
        .map(|addr| addr.ip())
        .unwrap_or(std::net::IpAddr::V4(std::net::Ipv4Addr::LOCALHOST))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_ip_never_panics() {
        let _ = local_ip();
    }
}
