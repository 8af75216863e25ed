//! # Configuration Management
//!
//! Loads the intercom configuration once at startup. Nothing mutates it afterwards:
//! the loaded [`AppConfig`] is wrapped in an `Arc` and shared read-only.
//!
//! ## Sources (highest priority first):
//! 1. Flat deployment variables (`HOST`, `PORT`, `APP_NAME`, `DRY_RUN`, ...)
//! 2. Prefixed environment variables (`APP_INTERCOM__QUEUE_CAPACITY=5`)
//! 3. Configuration file (`config.toml`, optional)
//! 4. Built-in defaults (the `Default` impl below)

use crate::error::{AppError, AppResult};
use serde::{Deserialize, Serialize};
use std::env;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Deployment variables that map straight onto a config key.
const FLAT_OVERRIDES: &[(&str, &str)] = &[
    ("HOST", "server.host"),
    ("PORT", "server.port"),
    ("STATIC_DIR", "server.static_dir"),
    ("APP_NAME", "branding.app_name"),
    ("FAVICON_LETTER", "branding.favicon_letter"),
    ("FAVICON_BG_COLOR", "branding.favicon_bg_color"),
    ("FAVICON_TEXT_COLOR", "branding.favicon_text_color"),
    ("INTERCOM_MODE", "intercom.mode"),
    ("MAX_RECORDING_SECONDS", "intercom.max_recording_seconds"),
    ("BROADCAST_TIMEOUT_SECONDS", "intercom.broadcast_timeout_seconds"),
    ("AUDIO_DEVICE", "playback.audio_device"),
    ("VOLUME_BOOST", "playback.volume_boost"),
];

/// Deployment variables holding on/off flags.
const FLAG_OVERRIDES: &[(&str, &str)] = &[
    ("DRY_RUN", "playback.dry_run"),
    ("NORMALIZE_VOLUME", "playback.normalize_volume"),
];

/// Main application configuration.
///
/// ## Sections:
/// - `server`: HTTP binding and WebSocket limits
/// - `branding`: values handed to the web client through `GET /config`
/// - `intercom`: delivery mode plus the timing and capacity constants
/// - `playback`: how the external player and encoder are invoked
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub branding: BrandingConfig,
    pub intercom: IntercomConfig,
    pub playback: PlaybackConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Directory with the web client; mounted at `/` behind every other route.
    pub static_dir: PathBuf,
    /// Largest WebSocket message accepted from a client, in bytes. Applies to
    /// single frames and to fragmented messages once joined.
    pub max_frame_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrandingConfig {
    pub app_name: String,
    pub favicon_letter: String,
    pub favicon_bg_color: String,
    pub favicon_text_color: String,
}

/// How transmitted audio reaches the speaker.
///
/// Read from any source through [`FromStr`], so `relay` and
/// `store_and_forward` are accepted wherever the mode is set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", try_from = "String")]
pub enum IntercomMode {
    /// One client at a time streams straight into the player.
    Live,
    /// Complete recordings are queued and played one after another.
    Queue,
}

impl IntercomMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            IntercomMode::Live => "live",
            IntercomMode::Queue => "queue",
        }
    }
}

impl fmt::Display for IntercomMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IntercomMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "live" | "relay" => Ok(IntercomMode::Live),
            "queue" | "store_and_forward" => Ok(IntercomMode::Queue),
            _ => Err(format!("Unknown intercom mode: {}", s)),
        }
    }
}

impl TryFrom<String> for IntercomMode {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntercomConfig {
    pub mode: IntercomMode,
    /// Longest recording the web client lets a user capture (queue mode).
    pub max_recording_seconds: u64,
    /// How long a granted live broadcast may last before it is revoked.
    pub broadcast_timeout_seconds: u64,
    /// Messages waiting for playback; the one currently playing is not counted.
    pub queue_capacity: usize,
    /// Silence between two queued messages.
    pub queue_gap_seconds: u64,
}

impl IntercomConfig {
    pub fn broadcast_timeout(&self) -> Duration {
        Duration::from_secs(self.broadcast_timeout_seconds)
    }

    pub fn queue_gap(&self) -> Duration {
        Duration::from_secs(self.queue_gap_seconds)
    }
}

/// External player and encoder settings.
///
/// `dry_run` turns every playback operation into a logged no-op so the
/// rest of the server can run on machines without speakers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaybackConfig {
    /// Player executable (`ffplay` or anything with the same command line).
    pub player: String,
    /// Encoder used for loudness normalization.
    pub ffmpeg: String,
    /// Exported as `AUDIODEV` to the player when non-empty.
    pub audio_device: String,
    pub volume_boost: f64,
    pub dry_run: bool,
    pub normalize_volume: bool,
    /// Time a closed live stream gets to drain before the player is killed.
    pub stop_grace_ms: u64,
}

impl PlaybackConfig {
    pub fn device(&self) -> Option<&str> {
        let device = self.audio_device.trim();
        (!device.is_empty()).then_some(device)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 8000,
                static_dir: PathBuf::from("static"),
                max_frame_bytes: 16 * 1024 * 1024,
            },
            branding: BrandingConfig {
                app_name: "Área A".to_string(),
                favicon_letter: "S".to_string(),
                favicon_bg_color: "#2563EB".to_string(),
                favicon_text_color: "#FFFFFF".to_string(),
            },
            intercom: IntercomConfig {
                mode: IntercomMode::Queue,
                max_recording_seconds: 20,
                broadcast_timeout_seconds: 30,
                queue_capacity: 10,
                queue_gap_seconds: 2,
            },
            playback: PlaybackConfig {
                player: "ffplay".to_string(),
                ffmpeg: "ffmpeg".to_string(),
                audio_device: String::new(),
                volume_boost: 1.0,
                dry_run: false,
                normalize_volume: false,
                stop_grace_ms: 2000,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from defaults, `config.toml` and the environment.
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER__PORT=9000`: nested key, `__` separates path segments
    /// - `INTERCOM_MODE=live`: switch to live relay
    /// - `DRY_RUN=1`: disable the speaker (`1`, `true`, `True`, `yes`)
    pub fn load() -> AppResult<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__"),
            );

        for (var, key) in FLAT_OVERRIDES {
            if let Ok(value) = env::var(var) {
                settings = settings.set_override(*key, value)?;
            }
        }

        for (var, key) in FLAG_OVERRIDES {
            if let Ok(value) = env::var(var) {
                settings = settings.set_override(*key, parse_flag(&value))?;
            }
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Reject values the intercom cannot run with.
    pub fn validate(&self) -> AppResult<()> {
        if self.server.port == 0 {
            return Err(AppError::ValidationError("Server port cannot be 0".into()));
        }

        if self.server.max_frame_bytes == 0 {
            return Err(AppError::ValidationError(
                "WebSocket frame limit must be greater than 0".into(),
            ));
        }

        if self.intercom.queue_capacity == 0 {
            return Err(AppError::ValidationError(
                "Queue capacity must be greater than 0".into(),
            ));
        }

        if self.intercom.broadcast_timeout_seconds == 0 {
            return Err(AppError::ValidationError(
                "Broadcast timeout must be greater than 0".into(),
            ));
        }

        if self.intercom.max_recording_seconds == 0 {
            return Err(AppError::ValidationError(
                "Maximum recording length must be greater than 0".into(),
            ));
        }

        if self.branding.favicon_letter.trim().is_empty() {
            return Err(AppError::ValidationError(
                "Favicon letter cannot be empty".into(),
            ));
        }

        if !(self.playback.volume_boost.is_finite() && self.playback.volume_boost > 0.0) {
            return Err(AppError::ValidationError(format!(
                "Volume boost must be a positive number, got {}",
                self.playback.volume_boost
            )));
        }

        Ok(())
    }
}

/// Interpret a deployment flag; anything unrecognised counts as off.
pub fn parse_flag(value: &str) -> bool {
    matches!(value.trim(), "1" | "true" | "True" | "yes")
}
