/*!
Controller setup and shutdown.
*/

use crate::addressing::{BoardId, Gain, MemorySpace};
use crate::bus::RegisterBus;
use crate::deinterlace::DeinterlaceType;
use crate::download::{download_program, DownloadSummary};
use crate::error::{Result, SdsuError};
use crate::exposure::{Controller, ExposureState};
use crate::protocol::{TIMING_NPR_ADDRESS, TIMING_NSR_ADDRESS, WORD_MASK};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// How a DSP board gets its application code
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgramSource {
    /// Leave whatever the board booted with
    #[default]
    None,
    /// Load an application stored in the board's EEPROM
    Application(i32),
    /// Download a program file
    File(PathBuf),
}

/// Startup parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SetupConfig {
    /// Reset the controller before anything else
    pub reset_controller: bool,

    /// Number of data link tests per board
    pub hardware_test_count: u32,

    pub timing_program: ProgramSource,

    pub utility_program: ProgramSource,

    pub gain: Gain,

    /// Fast integrator speed
    pub gain_speed: bool,

    pub power_on: bool,

    /// Clock the array continuously between exposures
    pub idle: bool,
}

impl Default for SetupConfig {
    fn default() -> Self {
        Self {
            reset_controller: true,
            hardware_test_count: 10,
            timing_program: ProgramSource::Application(1),
            utility_program: ProgramSource::Application(1),
            gain: Gain::Two,
            gain_speed: true,
            power_on: true,
            idle: true,
        }
    }
}

/// Data link test outcome for one board
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BoardTestResult {
    pub passed: u32,
    pub failed: u32,
    pub last_error: Option<String>,
}

/// Data link test outcome for all boards
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HardwareTestReport {
    pub interface: BoardTestResult,
    pub timing: BoardTestResult,
    pub utility: BoardTestResult,
}

impl HardwareTestReport {
    pub fn all_passed(&self) -> bool {
        [&self.interface, &self.timing, &self.utility]
            .iter()
            .all(|r| r.failed == 0)
    }

    fn board_mut(&mut self, board: BoardId) -> &mut BoardTestResult {
        match board {
            BoardId::Interface | BoardId::Host => &mut self.interface,
            BoardId::Timing => &mut self.timing,
            BoardId::Utility => &mut self.utility,
        }
    }
}

/// Value sent on the `i`th data link test of `board`
fn test_value(board: BoardId, i: u32) -> i32 {
    ((board.code() << 20) | (i as i32).wrapping_mul(0x1111)) & WORD_MASK
}

impl<B: RegisterBus> Controller<B> {
    /// Bring the controller to a state ready for exposures
    pub fn startup(&mut self, config: &SetupConfig) -> Result<HardwareTestReport> {
        self.run_in_state(ExposureState::Idle, |c| {
            info!("controller startup");
            if config.reset_controller {
                c.engine().reset_controller()?;
            }

            let report = c.run_hardware_test(config.hardware_test_count)?;

            c.load_program(BoardId::Timing, &config.timing_program)?;
            c.load_program(BoardId::Utility, &config.utility_program)?;

            c.engine().set_gain(config.gain, config.gain_speed)?;
            if config.power_on {
                c.engine().power_on()?;
            }
            if config.idle {
                c.engine().idle()?;
            } else {
                c.engine().stop_idle()?;
            }
            info!("controller ready");
            Ok(report)
        })
    }

    /// Test the data link to each board `count` times.
    ///
    /// Interface and utility failures are logged and reported. A timing
    /// board failure is returned as an error because no exposure can run
    /// without it.
    pub fn hardware_test(&mut self, count: u32) -> Result<HardwareTestReport> {
        self.run_in_state(ExposureState::Idle, |c| c.run_hardware_test(count))
    }

    /// Send `value` to `board` once and check it is echoed
    pub fn test_data_link(&mut self, board: BoardId, value: i32) -> Result<()> {
        self.run_in_state(ExposureState::Idle, |c| c.engine().test_data_link(board, value))
    }

    fn run_hardware_test(&mut self, count: u32) -> Result<HardwareTestReport> {
        let mut report = HardwareTestReport::default();
        for board in [BoardId::Interface, BoardId::Timing, BoardId::Utility] {
            for i in 0..count {
                match self.engine().test_data_link(board, test_value(board, i)) {
                    Ok(()) => report.board_mut(board).passed += 1,
                    Err(e) if e.is_aborted() || board == BoardId::Timing => return Err(e),
                    Err(e) => {
                        warn!(%board, "data link test {} failed: {}", i, e);
                        let result = report.board_mut(board);
                        result.failed += 1;
                        result.last_error = Some(e.to_string());
                    }
                }
            }
        }
        if report.all_passed() {
            info!(count, "hardware test passed");
        }
        Ok(report)
    }

    fn load_program(&mut self, board: BoardId, source: &ProgramSource) -> Result<()> {
        match source {
            ProgramSource::None => Ok(()),
            ProgramSource::Application(number) => {
                info!(%board, number, "loading application");
                self.engine().load_application(board, *number)
            }
            ProgramSource::File(path) => {
                self.download_file(board, path)?;
                Ok(())
            }
        }
    }

    fn download_file(&mut self, board: BoardId, path: &Path) -> Result<DownloadSummary> {
        info!(%board, path = %path.display(), "downloading program");
        let reader = BufReader::new(File::open(path)?);
        download_program(self.engine(), board, reader)
    }

    /// Download a program file to a board
    pub fn download(&mut self, board: BoardId, path: &Path) -> Result<DownloadSummary> {
        self.run_in_state(ExposureState::Idle, |c| c.download_file(board, path))
    }

    /// Set the readout size and the amplifiers that produce `deinterlace`
    pub fn set_dimensions(
        &mut self,
        ncols: usize,
        nrows: usize,
        deinterlace: DeinterlaceType,
    ) -> Result<()> {
        let to_word = |n: usize, what: &str| {
            i32::try_from(n)
                .ok()
                .filter(|v| *v > 0 && *v <= WORD_MASK)
                .ok_or_else(|| {
                    SdsuError::invalid_argument(
                        "set_dimensions",
                        format!("{} {} out of range", what, n),
                    )
                })
        };
        let cols = to_word(ncols, "ncols")?;
        let rows = to_word(nrows, "nrows")?;
        deinterlace.validate_dimensions(ncols, nrows)?;

        self.run_in_state(ExposureState::Idle, |c| {
            c.engine()
                .write_memory(BoardId::Timing, MemorySpace::Y, TIMING_NSR_ADDRESS, cols)?;
            c.engine()
                .write_memory(BoardId::Timing, MemorySpace::Y, TIMING_NPR_ADDRESS, rows)?;
            c.engine().set_output_source(deinterlace.amplifier())?;
            info!(ncols, nrows, ?deinterlace, "dimensions set");
            Ok(())
        })
    }

    /// Power the CCD down
    pub fn shutdown(&mut self) -> Result<()> {
        self.run_in_state(ExposureState::Idle, |c| {
            c.engine().power_off()?;
            info!("controller powered off");
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::Register;
    use crate::command::CommandCode;
    use crate::protocol::ERR;
    use crate::testing::{default_reply, MockBus, MockReply};
    use crate::ErrorKind;
    use std::io::Write;

    fn config() -> SetupConfig {
        SetupConfig {
            hardware_test_count: 3,
            ..SetupConfig::default()
        }
    }

    #[test]
    fn test_startup_sequence() {
        let mut controller = Controller::new(MockBus::new());
        let report = controller.startup(&config()).unwrap();
        assert!(report.all_passed());
        assert_eq!(report.timing.passed, 3);

        let triggered = controller.engine().bus().triggered();
        assert_eq!(triggered[0], CommandCode::ResetController);
        assert_eq!(triggered.iter().filter(|c| **c == CommandCode::TestDataLink).count(), 9);
        assert_eq!(
            &triggered[10..],
            &[
                CommandCode::LoadApplication,
                CommandCode::LoadApplication,
                CommandCode::SetGain,
                CommandCode::PowerOn,
                CommandCode::Idle,
            ]
        );
    }

    #[test]
    fn test_utility_link_failure_is_reported() {
        let bus = MockBus::new().with_responder(|command, args| {
            if command == CommandCode::TestDataLink && (args[0] >> 20) == BoardId::Utility.code() {
                return MockReply::Value(ERR);
            }
            default_reply(command, args)
        });
        let mut controller = Controller::new(bus);
        let report = controller.startup(&config()).unwrap();
        assert!(!report.all_passed());
        assert_eq!(report.utility.failed, 3);
        assert!(report.utility.last_error.is_some());
        assert_eq!(report.timing.failed, 0);
    }

    #[test]
    fn test_timing_link_failure_stops_startup() {
        let bus = MockBus::new().with_responder(|command, args| {
            if command == CommandCode::TestDataLink && (args[0] >> 20) == BoardId::Timing.code() {
                return MockReply::Value(args[0] + 1);
            }
            default_reply(command, args)
        });
        let mut controller = Controller::new(bus);
        let err = controller.startup(&config()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Protocol);
        assert_eq!(controller.engine().bus().count(CommandCode::PowerOn), 0);
        assert_eq!(controller.state(), ExposureState::Idle);
    }

    #[test]
    fn test_stale_abort_is_cleared_before_link_tests() {
        let mut controller = Controller::new(MockBus::new());
        controller.abort_current().unwrap();
        assert!(controller.abort_handle().is_aborted());
        assert!(controller.engine().bus().triggered().is_empty());

        let report = controller.hardware_test(1).unwrap();
        assert!(report.all_passed());
        assert!(!controller.abort_handle().is_aborted());

        controller.abort_handle().abort();
        controller.test_data_link(BoardId::Timing, 0x5).unwrap();
        assert!(!controller.abort_handle().is_aborted());
        assert_eq!(controller.engine().bus().count(CommandCode::TestDataLink), 4);
    }

    #[test]
    fn test_startup_with_program_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "_START TIM\n_DATA P 0000\n000001 000002\n_END\n").unwrap();
        let config = SetupConfig {
            reset_controller: false,
            hardware_test_count: 0,
            timing_program: ProgramSource::File(file.path().to_path_buf()),
            utility_program: ProgramSource::None,
            idle: false,
            ..SetupConfig::default()
        };
        let mut controller = Controller::new(MockBus::new());
        controller.startup(&config).unwrap();
        assert_eq!(
            controller.engine().bus().triggered(),
            vec![
                CommandCode::WriteMemory,
                CommandCode::WriteMemory,
                CommandCode::SetGain,
                CommandCode::PowerOn,
                CommandCode::StopIdle,
            ]
        );
    }

    #[test]
    fn test_set_dimensions() {
        let mut controller = Controller::new(MockBus::new());
        controller.set_dimensions(2048, 1024, DeinterlaceType::SplitSerial).unwrap();
        let writes = controller.engine().bus().writes();
        assert!(writes.contains(&(Register::Argument(3), 2048)));
        assert!(writes.contains(&(Register::Argument(3), 1024)));
        let amplifier = DeinterlaceType::SplitSerial.amplifier().code();
        assert!(writes.contains(&(Register::Argument(1), amplifier)));

        assert!(controller.set_dimensions(0, 10, DeinterlaceType::Single).is_err());
        assert!(controller.set_dimensions(11, 10, DeinterlaceType::SplitQuad).is_err());
    }
}
