use thiserror::Error;

#[derive(Error, Debug)]
pub enum RouterError {
    #[error("configuration error: {message}")]
    Config { message: String },

    #[error("malformed envelope: {message}")]
    MalformedEnvelope { message: String },

    #[error("RTSP connection failed: {message}")]
    RtspConnection { message: String },

    #[error("camera unavailable: {message}")]
    CameraUnavailable { message: String },

    #[error("firmware unavailable: {message}")]
    FirmwareUnavailable { message: String },

    #[error("MQTT error: {message}")]
    Mqtt { message: String },

    #[error("WebRTC error: {message}")]
    WebRtc { message: String },

    #[error("IO error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    #[error("URL parse error: {source}")]
    UrlParse {
        #[from]
        source: url::ParseError,
    },

    #[error("JSON error: {source}")]
    Json {
        #[from]
        source: serde_json::Error,
    },

    #[error("MQTT client error: {source}")]
    MqttClient {
        #[from]
        source: rumqttc::v5::ClientError,
    },
}

impl RouterError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config { message: message.into() }
    }

    pub fn malformed_envelope(message: impl Into<String>) -> Self {
        Self::MalformedEnvelope { message: message.into() }
    }

    pub fn rtsp_connection(message: impl Into<String>) -> Self {
        Self::RtspConnection { message: message.into() }
    }

    pub fn camera_unavailable(message: impl Into<String>) -> Self {
        Self::CameraUnavailable { message: message.into() }
    }

    pub fn firmware_unavailable(message: impl Into<String>) -> Self {
        Self::FirmwareUnavailable { message: message.into() }
    }

    pub fn mqtt(message: impl Into<String>) -> Self {
        Self::Mqtt { message: message.into() }
    }

    pub fn webrtc(message: impl Into<String>) -> Self {
        Self::WebRtc { message: message.into() }
    }
}

pub type Result<T> = std::result::Result<T, RouterError>;
