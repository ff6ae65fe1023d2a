//! Layered configuration: defaults, then a TOML file, then `TAPEDECK_*`
//! environment overrides.

pub mod error;
pub mod loader;

pub use error::ConfigError;
pub use loader::{
    AppConfig, CaptureConfig, ConfigLoader, CoverConfig, DeviceConfig, EncoderOptions,
    EventsConfig, PathsConfig, QueueConfig, ServiceConfig, UpscaleBackend, UpscaleProfile,
    UpscalingConfig,
};
