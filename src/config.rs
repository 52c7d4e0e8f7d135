// =============================================================================
// CONFIGURATION - Load settings from config.toml
// =============================================================================
//
// Every section is optional; missing keys take the defaults below. The
// texture table is the out-of-band agreement between producer and consumer.

use crate::frame::ChannelAnimation;
use crate::interop::{SyncMode, SyncProtocol};
use crate::texture::{TextureDesc, TextureFormat, MAX_TEXTURE_DIMENSION};
use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub window: WindowConfig,
    pub graphics: GraphicsConfig,
    pub texture: TextureConfig,
    pub sync: SyncConfig,
    pub animation: AnimationConfig,
    pub run: RunConfig,
    pub debug: DebugConfig,
}

/// Window settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    pub title: String,
    pub width: u32,
    pub height: u32,
    pub fullscreen: bool,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            title: "Shared Texture".to_string(),
            width: 1280,
            height: 720,
            fullscreen: false,
        }
    }
}

/// Graphics settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GraphicsConfig {
    pub present_mode: String,
    /// Shown on frames where the keyed mutex timed out
    pub clear_color: [f32; 4],
    pub max_frames_in_flight: usize,
}

impl Default for GraphicsConfig {
    fn default() -> Self {
        Self {
            present_mode: "fifo".to_string(),
            clear_color: [0.1, 0.1, 0.1, 1.0],
            max_frames_in_flight: 2,
        }
    }
}

/// Shared image descriptor
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TextureConfig {
    pub width: u32,
    pub height: u32,
    pub format: TextureFormat,
}

impl Default for TextureConfig {
    fn default() -> Self {
        let desc = TextureDesc::default();
        Self {
            width: desc.width,
            height: desc.height,
            format: desc.format,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolKind {
    SharedZero,
    Alternating,
}

/// Keyed-mutex settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub mode: SyncMode,
    pub protocol: ProtocolKind,
    pub timeout_ms: u64,
    pub release_on_timeout: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            mode: SyncMode::PerFrame,
            protocol: ProtocolKind::SharedZero,
            timeout_ms: SyncProtocol::DEFAULT_TIMEOUT.as_millis() as u64,
            release_on_timeout: true,
        }
    }
}

/// Producer's animated blue channel
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AnimationConfig {
    pub initial: f32,
    pub step: f32,
}

impl Default for AnimationConfig {
    fn default() -> Self {
        Self {
            initial: 1.0,
            step: ChannelAnimation::DEFAULT_STEP,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// D3D11 -> Vulkan on Windows, simulated everywhere else
    Auto,
    Simulated,
    D3d11Vulkan,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub backend: BackendKind,
    /// 0 runs until the window closes
    pub max_frames: u64,
    /// Frames between two stats log lines, 0 disables them
    pub stats_interval: u64,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Auto,
            max_frames: 0,
            stats_interval: 600,
        }
    }
}

/// Debug settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    pub validation_layers: bool,
    pub log_to_file: bool,
    pub log_file: String,
    pub show_fps: bool,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            validation_layers: true,
            log_to_file: false,
            log_file: "shared_texture.log".to_string(),
            show_fps: true,
        }
    }
}

impl Config {
    /// Load configuration from file, falling back to defaults if not found
    pub fn load() -> Self {
        Self::load_from_path("config.toml").unwrap_or_else(|e| {
            log::warn!("Failed to load config.toml: {:#}. Using defaults.", e);
            Config::default()
        })
    }

    /// Load configuration from a specific path
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            log::info!("Config file not found at {:?}, using defaults", path);
            return Ok(Config::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;
        config
            .validate()
            .with_context(|| format!("Invalid config file: {:?}", path))?;

        log::info!("Loaded configuration from {:?}", path);
        log::debug!("Config: {:?}", config);

        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.texture.width == 0 || self.texture.height == 0 {
            bail!(
                "texture extent must be non-zero, got {}x{}",
                self.texture.width,
                self.texture.height
            );
        }
        if self.texture_desc().exceeds_limit() {
            bail!(
                "texture extent {}x{} exceeds the {} texel limit",
                self.texture.width,
                self.texture.height,
                MAX_TEXTURE_DIMENSION
            );
        }
        if !(0.0..=1.0).contains(&self.animation.initial) {
            bail!(
                "animation initial value must lie in [0, 1], got {}",
                self.animation.initial
            );
        }
        if !(self.animation.step > 0.0 && self.animation.step < 1.0) {
            bail!(
                "animation step must lie in (0, 1), got {}",
                self.animation.step
            );
        }
        if self.graphics.max_frames_in_flight == 0 {
            bail!("max_frames_in_flight must be at least 1");
        }
        Ok(())
    }

    pub fn texture_desc(&self) -> TextureDesc {
        TextureDesc::new(self.texture.width, self.texture.height, self.texture.format)
    }

    pub fn protocol(&self) -> SyncProtocol {
        let base = match self.sync.protocol {
            ProtocolKind::SharedZero => SyncProtocol::shared_zero(),
            ProtocolKind::Alternating => SyncProtocol::alternating(),
        };
        base.with_mode(self.sync.mode)
            .with_timeout(Duration::from_millis(self.sync.timeout_ms))
            .with_release_on_timeout(self.sync.release_on_timeout)
    }

    pub fn animation(&self) -> ChannelAnimation {
        ChannelAnimation::new(self.animation.initial, self.animation.step)
    }

    /// Get present mode as Vulkan enum
    pub fn get_present_mode(&self) -> ash::vk::PresentModeKHR {
        match self.graphics.present_mode.to_lowercase().as_str() {
            "immediate" => ash::vk::PresentModeKHR::IMMEDIATE,
            "mailbox" => ash::vk::PresentModeKHR::MAILBOX,
            "fifo" => ash::vk::PresentModeKHR::FIFO,
            "fifo_relaxed" => ash::vk::PresentModeKHR::FIFO_RELAXED,
            _ => {
                log::warn!(
                    "Unknown present mode '{}', defaulting to FIFO",
                    self.graphics.present_mode
                );
                ash::vk::PresentModeKHR::FIFO
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(body: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(body.as_bytes()).unwrap();
        file
    }

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_from_path(dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.texture_desc(), TextureDesc::default());
        assert_eq!(config.protocol(), SyncProtocol::shared_zero());
        assert_eq!(config.run.backend, BackendKind::Auto);
    }

    #[test]
    fn sections_override_defaults() {
        let file = write_config(
            r#"
            [texture]
            width = 512
            format = "bgra8_unorm"

            [sync]
            protocol = "alternating"
            timeout_ms = 16
            release_on_timeout = false

            [animation]
            initial = 0.5

            [run]
            backend = "simulated"
            max_frames = 100
            "#,
        );
        let config = Config::load_from_path(file.path()).unwrap();

        assert_eq!(
            config.texture_desc(),
            TextureDesc::new(512, 256, TextureFormat::Bgra8Unorm)
        );
        let protocol = config.protocol();
        assert_eq!(protocol.producer.release, 1);
        assert_eq!(protocol.timeout_ms(), 16);
        assert!(!protocol.release_on_timeout);
        assert_eq!(config.animation().value(), 0.5);
        assert_eq!(config.run.backend, BackendKind::Simulated);
        assert_eq!(config.run.max_frames, 100);
        assert_eq!(config.window.title, "Shared Texture");
    }

    #[test]
    fn unsynchronized_mode_is_parsed() {
        let file = write_config("[sync]\nmode = \"unsynchronized\"\n");
        let config = Config::load_from_path(file.path()).unwrap();
        assert!(!config.protocol().is_synchronized());
    }

    #[test]
    fn invalid_values_are_rejected() {
        for body in [
            "[texture]\nwidth = 0\n",
            "[animation]\nstep = 1.5\n",
            "[animation]\nstep = 0.0\n",
            "[animation]\ninitial = nan\n",
            "[animation]\ninitial = 1.5\n",
            "[texture]\nwidth = 1073741824\n",
            "[graphics]\nmax_frames_in_flight = 0\n",
        ] {
            let file = write_config(body);
            assert!(Config::load_from_path(file.path()).is_err(), "{body}");
        }
    }

    #[test]
    fn shipped_config_matches_defaults() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("config.toml");
        let config = Config::load_from_path(path).unwrap();
        assert_eq!(config.texture_desc(), TextureDesc::default());
        assert_eq!(config.protocol(), SyncProtocol::shared_zero());
        assert_eq!(config.get_present_mode(), ash::vk::PresentModeKHR::FIFO);
        assert_eq!(config.run.stats_interval, 600);
    }

    #[test]
    fn unknown_format_is_a_parse_error() {
        let file = write_config("[texture]\nformat = \"r16g16_float\"\n");
        let err = Config::load_from_path(file.path()).unwrap_err();
        assert!(format!("{:#}", err).contains("Failed to parse config file"));
    }
}
