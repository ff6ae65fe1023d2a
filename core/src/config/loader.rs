use crate::config::error::{ConfigError, Result};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Root application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub paths: PathsConfig,

    #[serde(default)]
    pub device: DeviceConfig,

    #[serde(default)]
    pub capture: CaptureConfig,

    #[serde(default)]
    pub upscaling: UpscalingConfig,

    #[serde(default)]
    pub cover: CoverConfig,

    #[serde(default)]
    pub queue: QueueConfig,

    #[serde(default)]
    pub events: EventsConfig,

    #[serde(default)]
    pub service: ServiceConfig,
}

/// Filesystem locations and external tool binaries
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Root holding one `Title (Year)` directory per project
    #[serde(default = "default_import_root")]
    pub import_root: PathBuf,

    /// Destination library for exported movies
    #[serde(default = "default_library_root")]
    pub library_root: PathBuf,

    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: PathBuf,

    /// Real-ESRGAN video inference script (or executable)
    #[serde(default = "default_realesrgan_path")]
    pub realesrgan_path: PathBuf,

    /// Interpreter used when `realesrgan_path` is a `.py` script
    #[serde(default = "default_python_path")]
    pub python_path: PathBuf,
}

/// Capture device selection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    #[serde(default)]
    pub video_device: String,

    /// ffmpeg input format (`dshow`, `iec61883`, `v4l2`, ...)
    #[serde(default = "default_input_format")]
    pub input_format: String,

    /// Transport control tool, invoked as `<command> rewind|play|pause`.
    /// It must exit once the deck has finished the action.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control_command: Option<PathBuf>,

    /// Longest a single transport action may take (a full rewind included)
    #[serde(default = "default_control_timeout_secs")]
    pub control_timeout_secs: u64,
}

/// Capture session behavior
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureConfig {
    /// Seconds to wait after the `q` request before sending SIGTERM
    #[serde(default = "default_stop_grace_secs")]
    pub stop_grace_secs: u64,

    /// Seconds to wait after SIGTERM before force-killing
    #[serde(default = "default_kill_grace_secs")]
    pub kill_grace_secs: u64,

    /// Escalate an unanswered stop request to SIGTERM and then SIGKILL
    #[serde(default = "default_true")]
    pub escalate_stop: bool,

    /// Export automatically after a postprocess job finishes upscaling
    #[serde(default)]
    pub auto_export: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpscaleBackend {
    #[default]
    Realesrgan,
    Ffmpeg,
}

/// Encoder settings passed through to ffmpeg
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncoderOptions {
    #[serde(default = "default_crf")]
    pub crf: u32,

    #[serde(default = "default_preset")]
    pub preset: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tune: Option<String>,
}

/// One named upscaling profile
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpscaleProfile {
    #[serde(default)]
    pub backend: UpscaleBackend,

    #[serde(default = "default_scale_factor")]
    pub scale_factor: u32,

    #[serde(default = "default_model")]
    pub model: String,

    #[serde(default = "default_tile_size")]
    pub tile_size: u32,

    #[serde(default = "default_tile_pad")]
    pub tile_pad: u32,

    #[serde(default = "default_encoder")]
    pub encoder: String,

    #[serde(default)]
    pub encoder_options: EncoderOptions,
}

/// Upscaling profiles
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpscalingConfig {
    #[serde(default = "default_profile_name")]
    pub default_profile: String,

    /// Frame count treated as 100% when the tool reports only `frame=N`
    #[serde(default = "default_progress_frame_estimate")]
    pub progress_frame_estimate: u64,

    /// Profile name -> settings. Names are matched case-insensitively.
    #[serde(default = "default_profiles")]
    pub profiles: HashMap<String, UpscaleProfile>,
}

/// Cover art generation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoverConfig {
    /// Position of the source frame in the upscaled video
    #[serde(default = "default_frame_at_secs")]
    pub frame_at_secs: f64,

    /// Artwork generator; the extracted frame is used as-is when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generator: Option<PathBuf>,

    /// Generator argv. `{frame}`, `{output}`, `{title}` and `{year}` are substituted.
    #[serde(default = "default_generator_args")]
    pub generator_args: Vec<String>,

    /// File name of the cover inside the library movie directory
    #[serde(default = "default_cover_file_name")]
    pub file_name: String,

    /// Replace an existing cover
    #[serde(default = "default_true")]
    pub overwrite: bool,
}

/// Pipeline job queue
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Finished jobs kept for snapshot queries
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
}

/// Event broadcaster
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventsConfig {
    /// Events buffered per subscriber before the oldest are dropped
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

/// Observer channel daemon
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub socket_path: Option<PathBuf>,

    /// Exit after this many idle seconds; never when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idle_timeout_secs: Option<u64>,
}

// Default value functions
fn tapedeck_home() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("Tapedeck")
}
fn default_import_root() -> PathBuf {
    tapedeck_home().join("Import")
}
fn default_library_root() -> PathBuf {
    tapedeck_home().join("Library")
}
fn default_ffmpeg_path() -> PathBuf {
    PathBuf::from("ffmpeg")
}
fn default_realesrgan_path() -> PathBuf {
    PathBuf::from("realesrgan/inference_realesrgan_video.py")
}
fn default_python_path() -> PathBuf {
    PathBuf::from("python3")
}
fn default_input_format() -> String {
    "dshow".to_string()
}
fn default_control_timeout_secs() -> u64 {
    180
}
fn default_stop_grace_secs() -> u64 {
    10
}
fn default_kill_grace_secs() -> u64 {
    3
}
fn default_true() -> bool {
    true
}
fn default_crf() -> u32 {
    18
}
fn default_preset() -> String {
    "veryfast".to_string()
}
fn default_scale_factor() -> u32 {
    4
}
fn default_model() -> String {
    "RealESRGAN_x4plus".to_string()
}
fn default_tile_size() -> u32 {
    400
}
fn default_tile_pad() -> u32 {
    10
}
fn default_encoder() -> String {
    "libx264".to_string()
}
fn default_profile_name() -> String {
    "realesrgan_2x".to_string()
}
fn default_progress_frame_estimate() -> u64 {
    3000
}
fn default_frame_at_secs() -> f64 {
    60.0
}
fn default_generator_args() -> Vec<String> {
    [
        "--input", "{frame}", "--output", "{output}", "--title", "{title}", "--year", "{year}",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}
fn default_cover_file_name() -> String {
    "poster.jpg".to_string()
}
fn default_history_limit() -> usize {
    50
}
fn default_channel_capacity() -> usize {
    256
}

fn realesrgan_profile(scale_factor: u32, crf: u32, preset: &str) -> UpscaleProfile {
    UpscaleProfile {
        backend: UpscaleBackend::Realesrgan,
        scale_factor,
        model: default_model(),
        tile_size: default_tile_size(),
        tile_pad: default_tile_pad(),
        encoder: default_encoder(),
        encoder_options: EncoderOptions {
            crf,
            preset: preset.to_string(),
            tune: Some("film".to_string()),
        },
    }
}

fn default_profiles() -> HashMap<String, UpscaleProfile> {
    let mut profiles = HashMap::new();
    profiles.insert(
        "realesrgan_4x_hq".to_string(),
        realesrgan_profile(4, 17, "veryfast"),
    );
    profiles.insert(
        "realesrgan_4x_balanced".to_string(),
        realesrgan_profile(4, 18, "veryfast"),
    );
    profiles.insert(
        "realesrgan_4x_fast".to_string(),
        realesrgan_profile(4, 20, "veryfast"),
    );
    profiles.insert("realesrgan_2x".to_string(), realesrgan_profile(2, 18, "slow"));
    profiles.insert(
        "ffmpeg_fast".to_string(),
        UpscaleProfile {
            backend: UpscaleBackend::Ffmpeg,
            ..realesrgan_profile(4, 20, "veryfast")
        },
    );
    profiles
}

// Default implementations
impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            import_root: default_import_root(),
            library_root: default_library_root(),
            ffmpeg_path: default_ffmpeg_path(),
            realesrgan_path: default_realesrgan_path(),
            python_path: default_python_path(),
        }
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            video_device: String::new(),
            input_format: default_input_format(),
            control_command: None,
            control_timeout_secs: default_control_timeout_secs(),
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            stop_grace_secs: default_stop_grace_secs(),
            kill_grace_secs: default_kill_grace_secs(),
            escalate_stop: default_true(),
            auto_export: false,
        }
    }
}

impl Default for EncoderOptions {
    fn default() -> Self {
        Self {
            crf: default_crf(),
            preset: default_preset(),
            tune: None,
        }
    }
}

impl Default for UpscalingConfig {
    fn default() -> Self {
        Self {
            default_profile: default_profile_name(),
            progress_frame_estimate: default_progress_frame_estimate(),
            profiles: default_profiles(),
        }
    }
}

impl Default for CoverConfig {
    fn default() -> Self {
        Self {
            frame_at_secs: default_frame_at_secs(),
            generator: None,
            generator_args: default_generator_args(),
            file_name: default_cover_file_name(),
            overwrite: default_true(),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            history_limit: default_history_limit(),
        }
    }
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            channel_capacity: default_channel_capacity(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            paths: PathsConfig::default(),
            device: DeviceConfig::default(),
            capture: CaptureConfig::default(),
            upscaling: UpscalingConfig::default(),
            cover: CoverConfig::default(),
            queue: QueueConfig::default(),
            events: EventsConfig::default(),
            service: ServiceConfig::default(),
        }
    }
}

impl AppConfig {
    /// Resolve a profile by name, falling back to the default profile.
    pub fn profile(&self, name: Option<&str>) -> Option<(String, &UpscaleProfile)> {
        let name = name
            .unwrap_or(&self.upscaling.default_profile)
            .to_lowercase();
        self.upscaling
            .profiles
            .get(&name)
            .map(|profile| (name, profile))
    }

    /// Check cross-field constraints that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.profile(None).is_none() {
            return Err(ConfigError::invalid(
                "upscaling.default_profile",
                format!("'{}' is not a defined profile", self.upscaling.default_profile),
            ));
        }
        if let Some((name, _)) = self
            .upscaling
            .profiles
            .iter()
            .find(|(_, profile)| profile.scale_factor == 0)
        {
            return Err(ConfigError::invalid(
                format!("upscaling.profiles.{name}.scale_factor"),
                "must be at least 1",
            ));
        }
        if self.queue.history_limit == 0 {
            return Err(ConfigError::invalid(
                "queue.history_limit",
                "must be greater than 0",
            ));
        }
        if self.events.channel_capacity == 0 {
            return Err(ConfigError::invalid(
                "events.channel_capacity",
                "must be greater than 0",
            ));
        }
        if self.device.control_timeout_secs == 0 {
            return Err(ConfigError::invalid(
                "device.control_timeout_secs",
                "must be greater than 0",
            ));
        }
        if !self.cover.frame_at_secs.is_finite() || self.cover.frame_at_secs < 0.0 {
            return Err(ConfigError::invalid(
                "cover.frame_at_secs",
                "must be a non-negative number of seconds",
            ));
        }
        let file_name = Path::new(&self.cover.file_name);
        if file_name.file_name() != Some(file_name.as_os_str()) {
            return Err(ConfigError::invalid(
                "cover.file_name",
                format!("'{}' must be a plain file name", self.cover.file_name),
            ));
        }
        Ok(())
    }
}

/// Configuration loader with layered merging support
pub struct ConfigLoader {
    config_path: Option<PathBuf>,
}

impl ConfigLoader {
    /// Create a new ConfigLoader
    pub fn new() -> Self {
        Self { config_path: None }
    }

    /// Set the configuration file path
    pub fn with_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config_path = Some(path.as_ref().to_path_buf());
        self
    }

    /// Load configuration with layered merging:
    /// 1. Start with defaults (from Default implementations)
    /// 2. Merge config file if provided
    /// 3. Override with environment variables (TAPEDECK_ prefix)
    pub fn load(&self) -> Result<AppConfig> {
        let mut builder = Config::builder();

        // Layer 1: Defaults (serialize defaults to JSON and load as base)
        let defaults = AppConfig::default();
        let defaults_json = serde_json::to_string(&defaults)?;
        builder = builder.add_source(File::from_str(&defaults_json, config::FileFormat::Json));

        // Layer 2: Config file (if provided)
        if let Some(ref path) = self.config_path {
            if path.exists() {
                builder = builder.add_source(File::from(path.as_path()));
            } else {
                return Err(ConfigError::FileNotFound(path.clone()));
            }
        }

        // Layer 3: Environment variables, double underscore for nesting.
        // Example: TAPEDECK_QUEUE__HISTORY_LIMIT=10
        builder = builder.add_source(
            Environment::with_prefix("TAPEDECK")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let load_error = |e: config::ConfigError| ConfigError::Load {
            origin: self.config_path.as_ref().map_or_else(
                || "defaults and environment".to_string(),
                |path| path.display().to_string(),
            ),
            message: e.to_string(),
        };
        let app_config: AppConfig = builder
            .build()
            .and_then(Config::try_deserialize)
            .map_err(load_error)?;
        app_config.validate()?;

        tracing::debug!(
            "Configuration loaded (file: {:?}, default profile: {})",
            self.config_path,
            app_config.upscaling.default_profile
        );
        Ok(app_config)
    }

    /// Locate the default config file in standard locations:
    /// 1. Current directory: ./tapedeck.toml
    /// 2. XDG config: ~/.config/tapedeck/config.toml
    /// 3. Home directory: ~/.tapedeck.toml
    pub fn find_config_file() -> Option<PathBuf> {
        let cwd_config = PathBuf::from("./tapedeck.toml");
        if cwd_config.exists() {
            return Some(cwd_config);
        }

        if let Some(config_dir) = dirs::config_dir() {
            let xdg_config = config_dir.join("tapedeck").join("config.toml");
            if xdg_config.exists() {
                return Some(xdg_config);
            }
        }

        if let Some(home_dir) = dirs::home_dir() {
            let home_config = home_dir.join(".tapedeck.toml");
            if home_config.exists() {
                return Some(home_config);
            }
        }

        None
    }

    /// Load configuration from default locations
    pub fn load_default() -> Result<AppConfig> {
        let loader = if let Some(config_path) = Self::find_config_file() {
            ConfigLoader::new().with_file(config_path)
        } else {
            ConfigLoader::new()
        };

        loader.load()
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serial_test::serial;
    use std::env;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.upscaling.default_profile, "realesrgan_2x");
        assert_eq!(config.upscaling.profiles.len(), 5);
        assert_eq!(config.capture.stop_grace_secs, 10);
        assert_eq!(config.capture.kill_grace_secs, 3);
        assert!(!config.capture.auto_export);
        assert_eq!(config.queue.history_limit, 50);
        assert_eq!(config.device.control_timeout_secs, 180);
        assert!(config.device.control_command.is_none());
        assert_eq!(config.cover.file_name, "poster.jpg");
        assert_eq!(config.cover.generator_args[1], "{frame}");
        assert!(config.validate().is_ok());

        let (name, profile) = config.profile(None).unwrap();
        assert_eq!(name, "realesrgan_2x");
        assert_eq!(profile.scale_factor, 2);
        assert_eq!(profile.encoder_options.preset, "slow");

        let (_, fast) = config.profile(Some("FFMPEG_FAST")).unwrap();
        assert_eq!(fast.backend, UpscaleBackend::Ffmpeg);
    }

    #[test]
    #[serial]
    fn test_load_with_defaults_only() {
        let config = ConfigLoader::new().load().unwrap();
        assert_eq!(config.upscaling.default_profile, "realesrgan_2x");
        assert_eq!(config.events.channel_capacity, 256);
    }

    #[test]
    #[serial]
    fn test_load_with_env_override() {
        unsafe {
            env::set_var("TAPEDECK_QUEUE__HISTORY_LIMIT", "7");
            env::set_var("TAPEDECK_CAPTURE__AUTO_EXPORT", "true");
        }

        let result = ConfigLoader::new().load();

        unsafe {
            env::remove_var("TAPEDECK_QUEUE__HISTORY_LIMIT");
            env::remove_var("TAPEDECK_CAPTURE__AUTO_EXPORT");
        }

        let config = result.unwrap();
        assert_eq!(config.queue.history_limit, 7);
        assert!(config.capture.auto_export);
    }

    #[test]
    #[serial]
    fn test_load_from_file_merges_profiles() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tapedeck.toml");
        std::fs::write(
            &path,
            r#"
[paths]
import_root = "/srv/tapes/import"

[upscaling]
default_profile = "custom"

[upscaling.profiles.custom]
backend = "ffmpeg"
scale_factor = 3
"#,
        )
        .unwrap();

        let config = ConfigLoader::new().with_file(&path).load().unwrap();
        assert_eq!(config.paths.import_root, PathBuf::from("/srv/tapes/import"));
        assert_eq!(config.upscaling.profiles.len(), 6);
        let (_, custom) = config.profile(None).unwrap();
        assert_eq!(custom.scale_factor, 3);
        assert_eq!(custom.encoder, "libx264");
    }

    #[test]
    #[serial]
    fn test_default_config_round_trips_through_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let mut defaults = AppConfig::default();
        defaults.queue.history_limit = 9;
        std::fs::write(&path, toml::to_string(&defaults).unwrap()).unwrap();

        let config = ConfigLoader::new().with_file(&path).load().unwrap();
        assert_eq!(config.queue.history_limit, 9);
        assert_eq!(config.upscaling.profiles, defaults.upscaling.profiles);
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let err = ConfigLoader::new()
            .with_file("/nonexistent/tapedeck.toml")
            .load()
            .unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound(_)));
    }

    #[test]
    fn test_validation_rejects_unknown_default_profile() {
        let mut config = AppConfig::default();
        config.upscaling.default_profile = "missing".to_string();
        let err = config.validate().unwrap_err();
        assert_eq!(err.key(), Some("upscaling.default_profile"));
        assert!(err.to_string().contains("'missing'"));

        let mut config = AppConfig::default();
        config.queue.history_limit = 0;
        let err = config.validate().unwrap_err();
        assert_eq!(err.key(), Some("queue.history_limit"));
        assert_eq!(
            err.to_string(),
            "invalid setting queue.history_limit: must be greater than 0"
        );
    }

    #[test]
    fn test_validation_checks_cover_and_device_settings() {
        let mut config = AppConfig::default();
        config.cover.file_name = "../poster.jpg".to_string();
        assert_eq!(config.validate().unwrap_err().key(), Some("cover.file_name"));

        let mut config = AppConfig::default();
        config.cover.frame_at_secs = -1.0;
        assert_eq!(config.validate().unwrap_err().key(), Some("cover.frame_at_secs"));

        let mut config = AppConfig::default();
        config.device.control_timeout_secs = 0;
        assert_eq!(
            config.validate().unwrap_err().key(),
            Some("device.control_timeout_secs")
        );
    }

    #[test]
    #[serial]
    fn test_malformed_file_names_its_origin() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.toml");
        std::fs::write(&path, "[queue]\nhistory_limit = \"many\"\n").unwrap();

        let err = ConfigLoader::new().with_file(&path).load().unwrap_err();
        match err {
            ConfigError::Load { origin, .. } => assert_eq!(origin, path.display().to_string()),
            other => panic!("unexpected {other:?}"),
        }
    }
}
