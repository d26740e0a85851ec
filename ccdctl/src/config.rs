/*!
Configuration management for the controller CLI.
*/

use anyhow::{Context, Result};
use sdsu::protocol::{
    DEFAULT_EXPOSURE_TICK_MS, DEFAULT_READOUT_REMAINING_TIME_MS, DEFAULT_REPLY_POLL_MS,
    DEFAULT_REPLY_TIMEOUT_MS,
};
use sdsu::{DeinterlaceType, EngineTiming, ExposureTiming, SetupConfig};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::warn;

/// Main application configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub controller: ControllerConfig,
    pub setup: SetupConfig,
    pub exposure: ExposureConfig,
}

impl AppConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

        let config: AppConfig = toml::from_str(&content)
            .with_context(|| "Failed to parse config file as TOML")?;

        Ok(config)
    }

    /// Load configuration, falling back to defaults if the file does not exist
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        if !path.as_ref().exists() {
            warn!("config file {} not found, using defaults", path.as_ref().display());
            return Ok(Self::default());
        }
        Self::load_from_file(path)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .with_context(|| "Failed to serialize config to TOML")?;

        std::fs::write(path.as_ref(), content)
            .with_context(|| format!("Failed to write config file: {}", path.as_ref().display()))?;

        Ok(())
    }
}

/// Command and exposure timing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Interval between reply register reads
    pub reply_poll_ms: u64,

    /// Give up on a reply after this long
    pub reply_timeout_ms: u64,

    /// Start readout when this much exposure time remains
    pub readout_lead_ms: u64,

    /// Interval between elapsed-time queries
    pub exposure_tick_ms: u64,

    /// Bytes per image transfer call
    pub transfer_chunk_bytes: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            reply_poll_ms: DEFAULT_REPLY_POLL_MS,
            reply_timeout_ms: DEFAULT_REPLY_TIMEOUT_MS,
            readout_lead_ms: DEFAULT_READOUT_REMAINING_TIME_MS,
            exposure_tick_ms: DEFAULT_EXPOSURE_TICK_MS,
            transfer_chunk_bytes: 64 * 1024,
        }
    }
}

impl ControllerConfig {
    pub fn engine_timing(&self) -> EngineTiming {
        EngineTiming {
            poll_interval: Duration::from_millis(self.reply_poll_ms),
            reply_timeout: Duration::from_millis(self.reply_timeout_ms),
        }
    }

    pub fn exposure_timing(&self) -> ExposureTiming {
        ExposureTiming {
            readout_lead: Duration::from_millis(self.readout_lead_ms),
            tick: Duration::from_millis(self.exposure_tick_ms.max(1)),
            transfer_chunk: self.transfer_chunk_bytes.max(1),
        }
    }
}

/// Image geometry and output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExposureConfig {
    pub ncols: usize,

    pub nrows: usize,

    pub deinterlace: DeinterlaceType,

    /// Open the shutter during exposures unless `--dark` is given
    pub open_shutter: bool,

    /// Directory for raw images and their metadata
    pub output_directory: String,
}

impl Default for ExposureConfig {
    fn default() -> Self {
        Self {
            ncols: 1024,
            nrows: 1024,
            deinterlace: DeinterlaceType::Single,
            open_shutter: true,
            output_directory: "./images".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sdsu::{Gain, ProgramSource};
    use tempfile::NamedTempFile;

    #[test]
    fn test_config_roundtrip() {
        let mut original_config = AppConfig::default();
        original_config.setup.gain = Gain::NinePointFive;
        original_config.setup.timing_program = ProgramSource::File("tim.lod".into());
        original_config.exposure.deinterlace = DeinterlaceType::SplitQuad;

        let temp_file = NamedTempFile::new().unwrap();
        let temp_path = temp_file.path();

        original_config.save_to_file(temp_path).unwrap();
        let loaded_config = AppConfig::load_from_file(temp_path).unwrap();

        assert_eq!(original_config, loaded_config);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: AppConfig = toml::from_str(
            "[exposure]\nncols = 2048\ndeinterlace = \"split_serial\"\n\n[setup]\nidle = false\n",
        )
        .unwrap();

        assert_eq!(config.exposure.ncols, 2048);
        assert_eq!(config.exposure.nrows, 1024);
        assert_eq!(config.exposure.deinterlace, DeinterlaceType::SplitSerial);
        assert!(!config.setup.idle);
        assert_eq!(config.setup.hardware_test_count, 10);
        assert_eq!(config.controller, ControllerConfig::default());
    }

    #[test]
    fn test_missing_file_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig::load_or_default(dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, AppConfig::default());
    }

    #[test]
    fn test_timing_conversion() {
        let controller = ControllerConfig {
            exposure_tick_ms: 0,
            ..ControllerConfig::default()
        };
        assert_eq!(controller.engine_timing().poll_interval, Duration::from_millis(10));
        assert_eq!(controller.exposure_timing().tick, Duration::from_millis(1));
        assert_eq!(controller.exposure_timing().readout_lead, Duration::from_millis(1000));
    }
}
