use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use crate::media::{SourceDescriptor, SourceKind};
use crate::transition::EasingFunction;

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralSettings,

    #[serde(default)]
    pub pool: PoolSettings,

    #[serde(default)]
    pub capture: CaptureConfig,

    #[serde(default)]
    pub procedural: ProceduralConfig,

    #[serde(default)]
    pub advanced: AdvancedSettings,

    /// Media assigned to controller buttons
    #[serde(default)]
    pub slot: Vec<SlotConfig>,
}

/// General mixer settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GeneralSettings {
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Crossfade duration in milliseconds
    #[serde(default = "default_fade_time")]
    pub fade_time_ms: u64,

    #[serde(default = "default_fade_curve")]
    pub fade_curve: String,

    /// Number of output planes
    #[serde(default = "default_outputs")]
    pub outputs: usize,

    /// Buttons per controller row; a slot's row picks its output
    #[serde(default = "default_grid_columns")]
    pub grid_columns: u32,

    /// Base directory for relative media file names
    #[serde(default = "default_media_dir")]
    pub media_dir: String,

    #[serde(default)]
    pub fullscreen: bool,
}

impl Default for GeneralSettings {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            fade_time_ms: default_fade_time(),
            fade_curve: default_fade_curve(),
            outputs: default_outputs(),
            grid_columns: default_grid_columns(),
            media_dir: default_media_dir(),
            fullscreen: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}
fn default_fade_time() -> u64 {
    2000
}
fn default_fade_curve() -> String {
    "linear".to_string()
}
fn default_outputs() -> usize {
    2
}
fn default_grid_columns() -> u32 {
    8
}
fn default_media_dir() -> String {
    "~/Videos".to_string()
}

/// How many sources of each kind are kept in the pool
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PoolSettings {
    #[serde(default = "default_video_sources")]
    pub video: usize,

    #[serde(default = "default_capture_sources")]
    pub capture: usize,

    #[serde(default = "default_procedural_sources")]
    pub procedural: usize,

    /// Decoded frames buffered per source
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            video: default_video_sources(),
            capture: default_capture_sources(),
            procedural: default_procedural_sources(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

impl PoolSettings {
    pub fn count(&self, kind: SourceKind) -> usize {
        match kind {
            SourceKind::Video => self.video,
            SourceKind::Capture => self.capture,
            SourceKind::Procedural => self.procedural,
        }
    }
}

fn default_video_sources() -> usize {
    4
}
fn default_capture_sources() -> usize {
    1
}
fn default_procedural_sources() -> usize {
    2
}
fn default_queue_capacity() -> usize {
    crate::frame_queue::DEFAULT_CAPACITY
}

/// Mode required from capture hardware
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct CaptureConfig {
    #[serde(default = "default_capture_width")]
    pub width: u32,

    #[serde(default = "default_capture_height")]
    pub height: u32,

    /// GStreamer raw video format name
    #[serde(default = "default_capture_format")]
    pub format: String,

    #[serde(default = "default_capture_framerate")]
    pub framerate: u32,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            width: default_capture_width(),
            height: default_capture_height(),
            format: default_capture_format(),
            framerate: default_capture_framerate(),
        }
    }
}

fn default_capture_width() -> u32 {
    1920
}
fn default_capture_height() -> u32 {
    1080
}
fn default_capture_format() -> String {
    "UYVY".to_string()
}
fn default_capture_framerate() -> u32 {
    30
}

/// Size and rate of generated patterns
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ProceduralConfig {
    #[serde(default = "default_procedural_width")]
    pub width: u32,

    #[serde(default = "default_procedural_height")]
    pub height: u32,

    #[serde(default = "default_procedural_fps")]
    pub fps: u32,
}

impl Default for ProceduralConfig {
    fn default() -> Self {
        Self {
            width: default_procedural_width(),
            height: default_procedural_height(),
            fps: default_procedural_fps(),
        }
    }
}

fn default_procedural_width() -> u32 {
    1280
}
fn default_procedural_height() -> u32 {
    720
}
fn default_procedural_fps() -> u32 {
    30
}

/// Advanced settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AdvancedSettings {
    /// Longest a render cycle waits on a source's GPU fence
    #[serde(default = "default_fence_timeout")]
    pub fence_timeout_ms: u64,

    #[serde(default = "default_stats_interval")]
    pub stats_interval_secs: u64,

    /// Map DMA-BUF planes for upload instead of requiring system memory
    #[serde(default = "default_true")]
    pub allow_dmabuf: bool,

    /// Play audio tracks of media files
    #[serde(default)]
    pub audio: bool,
}

impl Default for AdvancedSettings {
    fn default() -> Self {
        Self {
            fence_timeout_ms: default_fence_timeout(),
            stats_interval_secs: default_stats_interval(),
            allow_dmabuf: true,
            audio: false,
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_fence_timeout() -> u64 {
    50
}
fn default_stats_interval() -> u64 {
    10
}

/// One controller button's media
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SlotConfig {
    pub id: u32,

    /// file, capture or procedural
    pub kind: String,

    /// File path, capture device, or pattern id
    #[serde(default)]
    pub source: String,

    #[serde(default = "default_true")]
    pub looping: bool,

    #[serde(default)]
    pub backwards: bool,
}

impl SlotConfig {
    pub fn source_kind(&self) -> Result<SourceKind> {
        match self.kind.as_str() {
            "file" => Ok(SourceKind::Video),
            "capture" => Ok(SourceKind::Capture),
            "procedural" => Ok(SourceKind::Procedural),
            other => anyhow::bail!("Invalid slot kind: {} (slot {})", other, self.id),
        }
    }
}

impl Config {
    /// Load configuration from the default location
    pub fn load() -> Result<Self> {
        let config_path = Self::default_config_path()?;
        Self::load_from_path(&config_path)
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            log::info!(
                "Config file not found at {}, using defaults",
                path.display()
            );
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        log::info!("Loaded configuration from {}", path.display());
        config.validate()?;

        Ok(config)
    }

    /// Get the default config file path
    pub fn default_config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to get config directory")?
            .join("vmix");

        Ok(config_dir.join("config.toml"))
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        validate_enum!(
            self.general.log_level.as_str(),
            "trace",
            "debug",
            "info",
            "warn",
            "error"
        )?;
        self.fade_curve()?;

        if self.general.outputs == 0 {
            anyhow::bail!("At least one output is required");
        }
        if self.general.grid_columns == 0 {
            anyhow::bail!("grid_columns must be at least 1");
        }
        if self.pool.queue_capacity == 0 {
            anyhow::bail!("queue_capacity must be at least 1");
        }
        if self.procedural.fps == 0 || self.capture.framerate == 0 {
            anyhow::bail!("Frame rates must be at least 1");
        }

        validate_enum!(self.capture.format.as_str(), "UYVY", "NV12", "BGRx")?;

        let mut seen = HashSet::new();
        for slot in &self.slot {
            if !seen.insert(slot.id) {
                anyhow::bail!("Duplicate slot id: {}", slot.id);
            }
            let kind = slot.source_kind()?;
            if kind != SourceKind::Capture && slot.source.is_empty() {
                anyhow::bail!("Slot {} has no source", slot.id);
            }
            if self.pool.count(kind) == 0 {
                log::warn!(
                    "Slot {} uses {} media but the pool has no {} sources",
                    slot.id,
                    kind,
                    kind
                );
            }
        }

        Ok(())
    }

    pub fn fade_curve(&self) -> Result<EasingFunction> {
        self.general.fade_curve.parse()
    }

    /// Base directory for media files, with `~` and variables expanded
    pub fn media_dir(&self) -> PathBuf {
        match shellexpand::full(&self.general.media_dir) {
            Ok(expanded) => PathBuf::from(expanded.as_ref()),
            Err(e) => {
                log::warn!("Failed to expand media_dir {}: {}", self.general.media_dir, e);
                PathBuf::from(&self.general.media_dir)
            }
        }
    }

    pub fn slot(&self, id: u32) -> Option<&SlotConfig> {
        self.slot.iter().find(|s| s.id == id)
    }

    /// Resolve a media slot into something a source can open
    pub fn descriptor(&self, id: u32) -> Option<SourceDescriptor> {
        let slot = self.slot(id)?;
        let kind = slot.source_kind().ok()?;

        let location = match kind {
            SourceKind::Video => {
                let expanded = shellexpand::tilde(&slot.source);
                let path = Path::new(expanded.as_ref());
                let resolved = if path.is_absolute() {
                    path.to_path_buf()
                } else {
                    self.media_dir().join(path)
                };
                resolved.to_string_lossy().into_owned()
            }
            SourceKind::Capture if slot.source.is_empty() => "/dev/video0".to_string(),
            SourceKind::Capture | SourceKind::Procedural => slot.source.clone(),
        };

        Some(SourceDescriptor {
            kind,
            location,
            looping: slot.looping,
            backwards: slot.backwards,
            audio: self.advanced.audio,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.general.log_level, "info");
        assert_eq!(config.general.fade_time_ms, 2000);
        assert_eq!(config.general.outputs, 2);
        assert_eq!(config.general.grid_columns, 8);
        assert_eq!(config.pool.video, 4);
        assert_eq!(config.pool.queue_capacity, 3);
        assert_eq!(config.capture.format, "UYVY");
        assert_eq!(config.advanced.fence_timeout_ms, 50);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_slots() {
        let toml = r#"
[general]
fade_time_ms = 1500
fade_curve = "ease-in-out"
media_dir = "/srv/media"

[pool]
video = 2

[[slot]]
id = 0
kind = "file"
source = "intro.mp4"

[[slot]]
id = 1
kind = "file"
source = "/abs/loop.mov"
looping = false
backwards = true

[[slot]]
id = 8
kind = "capture"

[[slot]]
id = 9
kind = "procedural"
source = "solid:#202040"
"#;

        let config: Config = toml::from_str(toml).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.pool.video, 2);
        assert_eq!(config.pool.capture, 1);
        assert_eq!(config.fade_curve().unwrap(), EasingFunction::EaseInOut);

        let intro = config.descriptor(0).unwrap();
        assert_eq!(intro.kind, SourceKind::Video);
        assert_eq!(intro.location, "/srv/media/intro.mp4");
        assert!(intro.looping);

        let reverse = config.descriptor(1).unwrap();
        assert_eq!(reverse.location, "/abs/loop.mov");
        assert!(!reverse.looping);
        assert!(reverse.backwards);

        let capture = config.descriptor(8).unwrap();
        assert_eq!(capture.kind, SourceKind::Capture);
        assert_eq!(capture.location, "/dev/video0");

        assert_eq!(config.descriptor(9).unwrap().kind, SourceKind::Procedural);
        assert!(config.descriptor(42).is_none());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::default();
        config.general.fade_curve = "bounce".to_string();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.general.outputs = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.general.log_level = "loud".to_string();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.capture.format = "MJPG".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_duplicate_and_unknown_slots() {
        let toml = r#"
[[slot]]
id = 3
kind = "file"
source = "a.mp4"

[[slot]]
id = 3
kind = "file"
source = "b.mp4"
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert!(config.validate().is_err());

        let toml = r#"
[[slot]]
id = 1
kind = "stream"
source = "rtsp://camera"
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[general]\noutputs = 3\n\n[advanced]\naudio = true").unwrap();

        let config = Config::load_from_path(file.path()).unwrap();
        assert_eq!(config.general.outputs, 3);
        assert!(config.advanced.audio);

        let missing = Config::load_from_path(Path::new("/nonexistent/vmix.toml")).unwrap();
        assert_eq!(missing.general.outputs, 2);
    }

    #[test]
    fn test_load_rejects_invalid_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[general]\ngrid_columns = 0").unwrap();
        assert!(Config::load_from_path(file.path()).is_err());
    }
}
