/*!
Controller session.

A [`Session`] wraps one [`Controller`] with the application configuration
and writes completed exposures to disk. Each exposure produces a raw image
file (`u16` little-endian, row-major unless the metadata says otherwise)
and a JSON sidecar with the same stem.
*/

use crate::config::AppConfig;
use anyhow::{Context, Result};
use chrono::Local;
use sdsu::{
    AbortHandle, BoardId, Controller, DeinterlaceType, ExposureRequest, ExposureResult,
    HardwareTestReport, RegisterBus,
};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

/// Metadata written next to every raw image
#[derive(Debug, Clone, Serialize)]
pub struct ExposureMetadata {
    pub timestamp: String,
    pub ncols: usize,
    pub nrows: usize,
    pub exposure_ms: u32,
    /// Elapsed time last reported by the controller before readout
    pub elapsed_ms: u64,
    pub open_shutter: bool,
    pub deinterlace: DeinterlaceType,
    /// False when the image could not be reordered and is stored as read
    pub deinterlaced: bool,
    pub library_version: String,
}

impl ExposureMetadata {
    fn from_result(result: &ExposureResult, timestamp: String) -> Self {
        Self {
            timestamp,
            ncols: result.request.ncols,
            nrows: result.request.nrows,
            exposure_ms: result.request.exposure_ms,
            elapsed_ms: result.elapsed_ms,
            open_shutter: result.request.open_shutter,
            deinterlace: result.request.deinterlace,
            deinterlaced: result.image.is_transformed(),
            library_version: sdsu::VERSION.to_string(),
        }
    }
}

/// Files written for one exposure
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedExposure {
    pub image_path: PathBuf,
    pub metadata_path: PathBuf,
}

/// Write `result` into `output_dir` as a timestamped raw file and JSON sidecar
pub fn save_exposure(output_dir: &Path, result: &ExposureResult) -> Result<SavedExposure> {
    fs::create_dir_all(output_dir)
        .with_context(|| format!("Failed to create output directory: {}", output_dir.display()))?;

    let now = Local::now();
    let stem = format!("exposure_{}", now.format("%Y%m%d_%H%M%S_%3f"));
    let image_path = output_dir.join(format!("{}.raw", stem));
    let metadata_path = output_dir.join(format!("{}.json", stem));

    fs::write(&image_path, result.image.image().to_le_bytes())
        .with_context(|| format!("Failed to write image: {}", image_path.display()))?;

    let metadata = ExposureMetadata::from_result(result, now.to_rfc3339());
    let json = serde_json::to_string_pretty(&metadata)
        .with_context(|| "Failed to serialize metadata")?;
    fs::write(&metadata_path, json)
        .with_context(|| format!("Failed to write metadata: {}", metadata_path.display()))?;

    info!("💾 Saved exposure to {}", image_path.display());
    Ok(SavedExposure {
        image_path,
        metadata_path,
    })
}

/// One controller driven by the application configuration
pub struct Session<B: RegisterBus> {
    controller: Controller<B>,
    config: AppConfig,
}

impl<B: RegisterBus> Session<B> {
    pub fn new(bus: B, config: AppConfig) -> Self {
        let controller = Controller::new(bus).with_timing(
            config.controller.engine_timing(),
            config.controller.exposure_timing(),
        );
        Self { controller, config }
    }

    /// Handle for aborting the running operation from another thread
    pub fn abort_handle(&self) -> AbortHandle {
        self.controller.abort_handle()
    }

    pub fn controller(&mut self) -> &mut Controller<B> {
        &mut self.controller
    }

    /// Start the controller and size the readout
    pub fn setup(&mut self) -> Result<HardwareTestReport> {
        let report = self.controller.startup(&self.config.setup)?;
        self.apply_dimensions()?;
        Ok(report)
    }

    pub fn clear(&mut self) -> Result<()> {
        self.controller.clear_array()?;
        Ok(())
    }

    /// Take an exposure with the configured geometry and save it
    pub fn expose(&mut self, exposure_ms: u32, dark: bool) -> Result<SavedExposure> {
        let exposure = &self.config.exposure;
        let request = ExposureRequest {
            ncols: exposure.ncols,
            nrows: exposure.nrows,
            exposure_ms,
            deinterlace: exposure.deinterlace,
            open_shutter: exposure.open_shutter && !dark,
        };
        request.validate()?;
        self.apply_dimensions()?;

        let result = self.controller.expose(&request)?;
        save_exposure(Path::new(&self.config.exposure.output_directory), &result)
    }

    pub fn download(&mut self, board: BoardId, file: &Path) -> Result<()> {
        let summary = self
            .controller
            .download(board, file)
            .with_context(|| format!("Failed to download {}", file.display()))?;
        info!(
            %board,
            blocks = summary.blocks,
            written = summary.words_written,
            skipped = summary.words_skipped,
            "download complete"
        );
        Ok(())
    }

    pub fn test_link(&mut self, board: BoardId, value: i32) -> Result<()> {
        self.controller.test_data_link(board, value)?;
        Ok(())
    }

    pub fn shutdown(&mut self) -> Result<()> {
        self.controller.shutdown()?;
        Ok(())
    }

    fn apply_dimensions(&mut self) -> Result<()> {
        let exposure = &self.config.exposure;
        self.controller
            .set_dimensions(exposure.ncols, exposure.nrows, exposure.deinterlace)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ControllerConfig, ExposureConfig};
    use sdsu::{CommandCode, TextBus};

    fn test_config(output_dir: &Path) -> AppConfig {
        AppConfig {
            controller: ControllerConfig {
                reply_poll_ms: 1,
                reply_timeout_ms: 200,
                readout_lead_ms: 5,
                exposure_tick_ms: 5,
                transfer_chunk_bytes: 64,
            },
            exposure: ExposureConfig {
                ncols: 16,
                nrows: 8,
                deinterlace: DeinterlaceType::SplitQuad,
                open_shutter: true,
                output_directory: output_dir.display().to_string(),
            },
            ..AppConfig::default()
        }
    }

    #[test]
    fn test_expose_writes_image_and_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = Session::new(TextBus::new(), test_config(dir.path()));

        let saved = session.expose(20, true).unwrap();

        let bytes = fs::read(&saved.image_path).unwrap();
        let expected = TextBus::synthetic_image(16, 8).unwrap();
        assert_eq!(bytes, expected.to_le_bytes());

        let metadata: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&saved.metadata_path).unwrap()).unwrap();
        assert_eq!(metadata["ncols"], 16);
        assert_eq!(metadata["nrows"], 8);
        assert_eq!(metadata["exposure_ms"], 20);
        assert_eq!(metadata["open_shutter"], false);
        assert_eq!(metadata["deinterlace"], "split_quad");
        assert_eq!(metadata["deinterlaced"], true);
    }

    #[test]
    fn test_setup_reports_and_sizes_readout() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.setup.hardware_test_count = 2;
        let mut session = Session::new(TextBus::new(), config);

        let report = session.setup().unwrap();
        assert!(report.all_passed());
        assert_eq!(
            session.controller().engine().bus().deinterlace(),
            DeinterlaceType::SplitQuad
        );
    }

    #[test]
    fn test_failing_command_surfaces_as_error() {
        let dir = tempfile::tempdir().unwrap();
        let bus = TextBus::new().with_failure(CommandCode::ClearArray);
        let mut session = Session::new(bus, test_config(dir.path()));
        assert!(session.clear().is_err());
        session.test_link(BoardId::Utility, 0x123).unwrap();
    }

    #[test]
    fn test_link_after_earlier_abort() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = Session::new(TextBus::new(), test_config(dir.path()));
        session.abort_handle().abort();
        session.test_link(BoardId::Timing, 0x5A5A5A).unwrap();
        assert!(!session.abort_handle().is_aborted());
    }

    #[test]
    fn test_invalid_geometry_rejected_before_exposure() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.exposure.ncols = 15;
        let mut session = Session::new(TextBus::new(), config);
        assert!(session.expose(20, false).is_err());
        assert!(fs::read_dir(dir.path()).unwrap().next().is_none());
    }
}
