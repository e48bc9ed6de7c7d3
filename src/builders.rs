//! Composes the router's collaborators in dependency order, resolving the
//! mutual Router/Broker reference by handing the broker only the cheap
//! `UplinkSink` handle it actually needs (spec §9).

use std::sync::Arc;

use crate::camera::manager::CameraManager;
use crate::config::RouterConfig;
use crate::device_tcp::DeviceTcpServer;
use crate::errors::Result;
use crate::mqtt::DeviceBroker;
use crate::ota::OtaClient;
use crate::router::{Router, UplinkSink};

pub struct BuiltRouter {
    pub router: Arc<Router>,
    pub device_tcp: Arc<DeviceTcpServer>,
    pub ota: Arc<OtaClient>,
}

pub struct RouterBuilder {
    config: RouterConfig,
}

impl RouterBuilder {
    pub fn new(config: RouterConfig) -> Self {
        Self { config }
    }

    /// Builds every collaborator and wires them into a `Router`. The
    /// outbound channel is minted up front and cloned into every
    /// collaborator that needs to talk to the cloud; the `Router` itself
    /// is assembled last from the receiving end, avoiding a two-pass
    /// Router<->Broker construction cycle.
    pub fn build(self) -> Result<BuiltRouter> {
        let (uplink_tx, uplink_rx) = tokio::sync::mpsc::unbounded_channel();
        let uplink = UplinkSink { tx: uplink_tx };

        let device_tcp = DeviceTcpServer::new(uplink.clone());
        let camera_manager = CameraManager::new(uplink.clone());
        let broker = DeviceBroker::start(&self.config, uplink.clone());
        let ota = OtaClient::new(device_tcp.clone(), broker.clone())
            .map_err(|e| crate::errors::RouterError::config(format!("failed to prepare firmware dir: {e}")))?;

        let router = Router::from_parts(
            self.config,
            uplink,
            uplink_rx,
            device_tcp.clone(),
            camera_manager,
            broker,
            ota.clone(),
        );

        Ok(BuiltRouter { router, device_tcp, ota })
    }
}
