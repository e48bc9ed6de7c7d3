use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

mod builders;
mod camera;
mod codec;
mod config;
mod device_tcp;
mod errors;
mod mqtt;
mod ota;
mod router;
mod rtsp_client;

use builders::RouterBuilder;
use config::RouterConfig;
use errors::Result;

#[tokio::main]
async fn main() -> Result<()> {
    let config = RouterConfig::from_env()?;

    let fmt_layer = tracing_subscriber::fmt::layer();
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(config.logger_level.clone()))
        .with(fmt_layer)
        .init();

    info!("starting edge router, uplink={}", config.uplink_uri());

    let built = RouterBuilder::new(config).build()?;

    let device_tcp_task = tokio::spawn(built.device_tcp.clone().run());
    let ota_task = tokio::spawn(ota::run(built.ota.clone()));
    let router_task = tokio::spawn(built.router.clone().run());

    tokio::select! {
        result = device_tcp_task => {
            if let Err(e) = result {
                error!("device TCP server task panicked: {e}");
            }
        }
        result = ota_task => {
            if let Err(e) = result {
                error!("OTA server task panicked: {e}");
            }
        }
        result = router_task => {
            if let Err(e) = result {
                error!("router task panicked: {e}");
            }
        }
    }

    Ok(())
}
