//! Configuration management for the relay server

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Complete relay configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub relay: RelayConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ServerConfig {
    #[serde(default = "default_bind_ip")]
    pub bind_ip: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_ip: default_bind_ip(),
            port: default_port(),
        }
    }
}

/// Frame store and streaming configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RelayConfig {
    /// Poll frequency (Hz) used when a viewer does not pass `freq`
    #[serde(default = "default_freq")]
    pub default_freq: f64,

    /// Width (pixels) every delivered frame is scaled to
    #[serde(default = "default_target_width")]
    pub target_width: u32,

    /// JPEG quality (1-100)
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,

    /// HTTP status used for MJPEG responses
    #[serde(default = "default_stream_status")]
    pub stream_status: u16,

    /// Maximum number of distinct stream ids kept in memory
    #[serde(default = "default_max_streams")]
    pub max_streams: usize,

    /// Maximum canonical payload size in bytes
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,

    /// Chunks buffered between a pump and its HTTP body
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            default_freq: default_freq(),
            target_width: default_target_width(),
            jpeg_quality: default_jpeg_quality(),
            stream_status: default_stream_status(),
            max_streams: default_max_streams(),
            max_frame_bytes: default_max_frame_bytes(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

// Default value functions
fn default_bind_ip() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    6064
}
fn default_freq() -> f64 {
    30.0
}
fn default_target_width() -> u32 {
    680
}
fn default_jpeg_quality() -> u8 {
    95
}
fn default_stream_status() -> u16 {
    206
}
fn default_max_streams() -> usize {
    1024
}
fn default_max_frame_bytes() -> usize {
    16 * 1024 * 1024
}
fn default_channel_capacity() -> usize {
    2
}

impl Config {
    /// Loads configuration from TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Loads configuration from TOML string
    pub fn from_str(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Socket address string the HTTP server binds to
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.server.bind_ip, self.server.port)
    }

    /// Validates configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.port == 0 {
            return Err(ConfigError::Invalid("port must be > 0".to_string()));
        }

        let relay = &self.relay;

        if !(relay.default_freq.is_finite() && relay.default_freq > 0.0) {
            return Err(ConfigError::Invalid(format!(
                "default-freq must be a positive number, got {}",
                relay.default_freq
            )));
        }

        if relay.target_width == 0 {
            return Err(ConfigError::Invalid(
                "target-width must be > 0".to_string(),
            ));
        }

        if relay.jpeg_quality == 0 || relay.jpeg_quality > 100 {
            return Err(ConfigError::Invalid(format!(
                "jpeg-quality must be between 1 and 100, got {}",
                relay.jpeg_quality
            )));
        }

        if !(100..=599).contains(&relay.stream_status) {
            return Err(ConfigError::Invalid(format!(
                "stream-status must be a valid HTTP status, got {}",
                relay.stream_status
            )));
        }

        if relay.max_streams == 0 {
            return Err(ConfigError::Invalid("max-streams must be > 0".to_string()));
        }

        if relay.max_frame_bytes == 0 {
            return Err(ConfigError::Invalid(
                "max-frame-bytes must be > 0".to_string(),
            ));
        }

        if relay.channel_capacity == 0 {
            return Err(ConfigError::Invalid(
                "channel-capacity must be > 0".to_string(),
            ));
        }

        Ok(())
    }
}
