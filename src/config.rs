use std::env;

use crate::errors::{Result, RouterError};

/// Startup configuration, read entirely from the environment per spec §6.
/// `MQTT_URL`, `MQTT_PORT`, `SERVER_URL`, and `ROUTER_MAC` are required;
/// `LOGGER_LEVEL` falls back to "info".
#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub mqtt_url: String,
    pub mqtt_port: u16,
    pub server_url: String,
    pub router_mac: String,
    pub logger_level: String,
}

impl RouterConfig {
    pub fn from_env() -> Result<Self> {
        let mqtt_url = require_env("MQTT_URL")?;
        let mqtt_port_raw = require_env("MQTT_PORT")?;
        let server_url = require_env("SERVER_URL")?;
        let router_mac = require_env("ROUTER_MAC")?;
        let logger_level = env::var("LOGGER_LEVEL").unwrap_or_else(|_| "info".to_string());

        let mqtt_port: u16 = mqtt_port_raw
            .parse()
            .map_err(|_| RouterError::config("MQTT_PORT must be an integer"))?;

        Ok(Self {
            mqtt_url,
            mqtt_port,
            server_url,
            router_mac,
            logger_level,
        })
    }

    /// The uplink URI, with the router's own MAC appended as spec §6
    /// requires (`wss://<server>/ws/router/<router_mac>/`).
    pub fn uplink_uri(&self) -> String {
        format!("{}{}/", self.server_url, self.router_mac)
    }
}

fn require_env(name: &str) -> Result<String> {
    env::var(name).map_err(|_| RouterError::config(format!("{name} is not set")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn clear() {
        for key in ["MQTT_URL", "MQTT_PORT", "SERVER_URL", "ROUTER_MAC", "LOGGER_LEVEL"] {
            env::remove_var(key);
        }
    }

    #[test]
    fn missing_required_var_fails_startup() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear();
        assert!(RouterConfig::from_env().is_err());
    }

    #[test]
    fn non_integer_port_fails_startup() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear();
        env::set_var("MQTT_URL", "mqtt.local");
        env::set_var("MQTT_PORT", "not-a-number");
        env::set_var("SERVER_URL", "wss://cloud.example/ws/router/");
        env::set_var("ROUTER_MAC", "aa:bb:cc:dd:ee:ff");
        assert!(RouterConfig::from_env().is_err());
        clear();
    }

    #[test]
    fn valid_env_builds_uplink_uri() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear();
        env::set_var("MQTT_URL", "mqtt.local");
        env::set_var("MQTT_PORT", "1883");
        env::set_var("SERVER_URL", "wss://cloud.example/ws/router/");
        env::set_var("ROUTER_MAC", "aa:bb:cc:dd:ee:ff");
        let config = RouterConfig::from_env().unwrap();
        assert_eq!(config.mqtt_port, 1883);
        assert_eq!(
            config.uplink_uri(),
            "wss://cloud.example/ws/router/aa:bb:cc:dd:ee:ff/"
        );
        clear();
    }
}
