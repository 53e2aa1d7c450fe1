pub mod client;
pub mod error;
pub mod frame;
pub mod session;
pub mod shm;
pub mod transport;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use client::{BindStateListener, VisionClient};
pub use error::{Result, VisionError};
pub use frame::{Frame, FrameEnvelope, FrameRef, PixelFormat};
pub use session::{DeliveryMode, FrameListener, SessionState};
pub use transport::{
    DistortionModel, Intrinsics, SlotNotification, StreamProfile, VisionTransport,
};

/// Logical camera stream. Unique key for all per-stream state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StreamId(pub u32);

impl StreamId {
    pub const FISHEYE: StreamId = StreamId(1);
    pub const COLOR: StreamId = StreamId(2);
    pub const DEPTH: StreamId = StreamId(3);
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Producer-owned shared-memory slot within a stream. Slots are recycled by
/// the producer, so a (stream, slot) pair only identifies one in-flight frame.
pub type SlotIndex = u32;

/// System configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub client: ClientConfig,
    pub producer: ProducerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Name registered with the vision service on connect.
    pub client_name: String,
    /// Consecutive mapping failures on one stream before the stream is
    /// reported as degraded.
    pub degraded_after_map_failures: u32,
}

/// Settings for the demo loopback producer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProducerConfig {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub format: PixelFormat,
    pub slot_count: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            client_name: "argus".into(),
            degraded_after_map_failures: 8,
        }
    }
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            fps: 30,
            format: PixelFormat::Gray8,
            slot_count: 4,
        }
    }
}

impl Config {
    /// Load configuration from an optional `argus.toml` plus `ARGUS_*`
    /// environment overrides, falling back to defaults.
    pub fn load() -> std::result::Result<Self, config::ConfigError> {
        config::Config::builder()
            .add_source(config::File::with_name("argus").required(false))
            .add_source(config::Environment::with_prefix("ARGUS").separator("__"))
            .build()?
            .try_deserialize()
    }
}
