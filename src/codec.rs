//! Wire envelope shared by the uplink WebSocket and MQTT. Pure, no I/O.

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::{Result, RouterError};

fn mac_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^([0-9a-fA-F]{2}[:-]){5}[0-9a-fA-F]{2}$").expect("static MAC regex")
    })
}

pub fn is_valid_device_id(device_id: &str) -> bool {
    device_id == "camera" || mac_pattern().is_match(device_id)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MessageType {
    Request,
    Response,
}

/// The enumerated event vocabulary from the original taxonomy, plus an
/// opaque fallback so unrecognized events still decode (spec §4.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageEvent {
    GetConnectedDevices,
    DeviceConnect,
    DeviceDisconnect,
    HealthCheck,
    SetSettings,
    GetSettings,
    StateChange,
    UpdateFirmware,
    UpdateFirmwareError,

    OnClick,
    OnHold,
    OnToggle,

    On,
    Off,
    Blink,
    Toggle,

    AddTag,
    OnRead,
    OnReadSuccess,
    OnReadFailure,
    AccessGranted,
    AccessDenied,

    CameraOffer,
    CameraAnswer,
    CameraDisconnect,
    CameraError,
    CameraIce,

    MeasureTemperature,
    MeasureHumidity,
    OnMeasurementTempHum,
    OnTemperatureAbove,
    OnTemperatureBelow,
    OnHumidityAbove,
    OnHumidityBelow,

    /// An event string outside the recognized vocabulary. Kept opaque so
    /// the router can still route on `device_id` without a hard decode
    /// failure (spec §4.1).
    Unknown(String),
}

impl MessageEvent {
    pub fn is_broadcast(&self) -> bool {
        matches!(self, MessageEvent::GetConnectedDevices)
    }

    fn as_wire_str(&self) -> &str {
        match self {
            MessageEvent::GetConnectedDevices => "get_connected_devices",
            MessageEvent::DeviceConnect => "device_connect",
            MessageEvent::DeviceDisconnect => "device_disconnect",
            MessageEvent::HealthCheck => "health_check",
            MessageEvent::SetSettings => "set_settings",
            MessageEvent::GetSettings => "get_settings",
            MessageEvent::StateChange => "state_change",
            MessageEvent::UpdateFirmware => "update_firmware",
            MessageEvent::UpdateFirmwareError => "update_firmware_error",
            MessageEvent::OnClick => "on_click",
            MessageEvent::OnHold => "on_hold",
            MessageEvent::OnToggle => "on_toggle",
            MessageEvent::On => "on",
            MessageEvent::Off => "off",
            MessageEvent::Blink => "blink",
            MessageEvent::Toggle => "toggle",
            MessageEvent::AddTag => "add_tag",
            MessageEvent::OnRead => "on_read",
            MessageEvent::OnReadSuccess => "on_read_success",
            MessageEvent::OnReadFailure => "on_read_failure",
            MessageEvent::AccessGranted => "access_granted",
            MessageEvent::AccessDenied => "access_denied",
            MessageEvent::CameraOffer => "camera_offer",
            MessageEvent::CameraAnswer => "camera_answer",
            MessageEvent::CameraDisconnect => "camera_disconnect",
            MessageEvent::CameraError => "camera_error",
            MessageEvent::CameraIce => "camera_ice",
            MessageEvent::MeasureTemperature => "measure_temperature",
            MessageEvent::MeasureHumidity => "measure_humidity",
            MessageEvent::OnMeasurementTempHum => "on_measurement_temp_hum",
            MessageEvent::OnTemperatureAbove => "on_temperature_above",
            MessageEvent::OnTemperatureBelow => "on_temperature_below",
            MessageEvent::OnHumidityAbove => "on_humidity_above",
            MessageEvent::OnHumidityBelow => "on_humidity_below",
            MessageEvent::Unknown(raw) => raw,
        }
    }

    fn from_wire_str(raw: &str) -> Self {
        match raw {
            "get_connected_devices" => MessageEvent::GetConnectedDevices,
            "device_connect" => MessageEvent::DeviceConnect,
            "device_disconnect" => MessageEvent::DeviceDisconnect,
            "health_check" => MessageEvent::HealthCheck,
            "set_settings" => MessageEvent::SetSettings,
            "get_settings" => MessageEvent::GetSettings,
            "state_change" => MessageEvent::StateChange,
            "update_firmware" => MessageEvent::UpdateFirmware,
            "update_firmware_error" => MessageEvent::UpdateFirmwareError,
            "on_click" => MessageEvent::OnClick,
            "on_hold" => MessageEvent::OnHold,
            "on_toggle" => MessageEvent::OnToggle,
            "on" => MessageEvent::On,
            "off" => MessageEvent::Off,
            "blink" => MessageEvent::Blink,
            "toggle" => MessageEvent::Toggle,
            "add_tag" => MessageEvent::AddTag,
            "on_read" => MessageEvent::OnRead,
            "on_read_success" => MessageEvent::OnReadSuccess,
            "on_read_failure" => MessageEvent::OnReadFailure,
            "access_granted" => MessageEvent::AccessGranted,
            "access_denied" => MessageEvent::AccessDenied,
            "camera_offer" => MessageEvent::CameraOffer,
            "camera_answer" => MessageEvent::CameraAnswer,
            "camera_disconnect" => MessageEvent::CameraDisconnect,
            "camera_error" => MessageEvent::CameraError,
            "camera_ice" => MessageEvent::CameraIce,
            "measure_temperature" => MessageEvent::MeasureTemperature,
            "measure_humidity" => MessageEvent::MeasureHumidity,
            "on_measurement_temp_hum" => MessageEvent::OnMeasurementTempHum,
            "on_temperature_above" => MessageEvent::OnTemperatureAbove,
            "on_temperature_below" => MessageEvent::OnTemperatureBelow,
            "on_humidity_above" => MessageEvent::OnHumidityAbove,
            "on_humidity_below" => MessageEvent::OnHumidityBelow,
            other => MessageEvent::Unknown(other.to_string()),
        }
    }
}

impl Serialize for MessageEvent {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.as_wire_str())
    }
}

impl<'de> Deserialize<'de> for MessageEvent {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Ok(MessageEvent::from_wire_str(&raw))
    }
}

fn default_payload() -> Value {
    Value::Object(Default::default())
}

fn deserialize_payload<'de, D>(deserializer: D) -> std::result::Result<Value, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value: Option<Value> = Option::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::Null) | None => default_payload(),
        Some(other) => other,
    })
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub message_id: String,
    pub message_type: MessageType,
    pub message_event: MessageEvent,
    pub device_id: String,
    #[serde(default = "default_payload", deserialize_with = "deserialize_payload")]
    pub payload: Value,
}

impl Message {
    pub fn new(
        message_type: MessageType,
        message_event: MessageEvent,
        device_id: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            message_id: uuid::Uuid::new_v4().simple().to_string(),
            message_type,
            message_event,
            device_id: device_id.into(),
            payload,
        }
    }

    pub fn device_disconnect(mac: &str) -> Self {
        Self::new(
            MessageType::Request,
            MessageEvent::DeviceDisconnect,
            mac,
            default_payload(),
        )
    }

    pub fn health_check(mac: &str) -> Self {
        Self::new(MessageType::Request, MessageEvent::HealthCheck, mac, default_payload())
    }
}

/// Encode a validated envelope to wire bytes.
pub fn encode(message: &Message) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(message)?)
}

/// Decode wire bytes into an envelope, validating `device_id` and
/// normalizing an absent/null `payload` to `{}`.
pub fn decode(bytes: &[u8]) -> Result<Message> {
    let message: Message = serde_json::from_slice(bytes)
        .map_err(|e| RouterError::malformed_envelope(e.to_string()))?;
    if !is_valid_device_id(&message.device_id) {
        return Err(RouterError::malformed_envelope(format!(
            "invalid device_id: {}",
            message.device_id
        )));
    }
    Ok(message)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(device_id: &str) -> Value {
        serde_json::json!({
            "message_id": "a",
            "message_type": "REQUEST",
            "message_event": "device_connect",
            "device_id": device_id,
            "payload": {}
        })
    }

    #[test]
    fn decodes_valid_mac() {
        let bytes = serde_json::to_vec(&sample("aa:bb:cc:dd:ee:ff")).unwrap();
        let msg = decode(&bytes).unwrap();
        assert_eq!(msg.device_id, "aa:bb:cc:dd:ee:ff");
        assert_eq!(msg.message_event, MessageEvent::DeviceConnect);
    }

    #[test]
    fn decodes_camera_device_id() {
        let bytes = serde_json::to_vec(&sample("camera")).unwrap();
        assert!(decode(&bytes).is_ok());
    }

    #[test]
    fn rejects_bad_mac() {
        let bytes = serde_json::to_vec(&sample("not-a-mac")).unwrap();
        assert!(decode(&bytes).is_err());
    }

    #[test]
    fn missing_payload_becomes_empty_object() {
        let mut value = sample("camera");
        value.as_object_mut().unwrap().remove("payload");
        let bytes = serde_json::to_vec(&value).unwrap();
        let msg = decode(&bytes).unwrap();
        assert_eq!(msg.payload, serde_json::json!({}));
        let round_tripped = encode(&msg).unwrap();
        let reparsed: Value = serde_json::from_slice(&round_tripped).unwrap();
        assert_eq!(reparsed["payload"], serde_json::json!({}));
    }

    #[test]
    fn null_payload_becomes_empty_object() {
        let mut value = sample("camera");
        value["payload"] = Value::Null;
        let bytes = serde_json::to_vec(&value).unwrap();
        let msg = decode(&bytes).unwrap();
        assert_eq!(msg.payload, serde_json::json!({}));
    }

    #[test]
    fn unknown_event_still_decodes() {
        let mut value = sample("camera");
        value["message_event"] = Value::String("some_future_event".into());
        let bytes = serde_json::to_vec(&value).unwrap();
        let msg = decode(&bytes).unwrap();
        assert_eq!(msg.message_event, MessageEvent::Unknown("some_future_event".into()));
    }

    #[test]
    fn encode_decode_round_trip_is_identity_on_fields() {
        let msg = Message::new(
            MessageType::Response,
            MessageEvent::CameraAnswer,
            "camera",
            serde_json::json!({"token": "T1"}),
        );
        let bytes = encode(&msg).unwrap();
        let decoded = decode(&bytes).unwrap();
        assert_eq!(decoded.message_id, msg.message_id);
        assert_eq!(decoded.device_id, msg.device_id);
        assert_eq!(decoded.message_event, msg.message_event);
        assert_eq!(decoded.payload, msg.payload);
    }
}
