/*!
Validated controller commands.

Each command checks its own arguments before touching the bus, then is a
single send/wait round trip through the [`CommandEngine`]. None of them
clears the abort flag; that is done by the [`crate::Controller`] operations
that call them.
*/

use crate::addressing::{validate_address, Amplifier, BoardId, Gain, MemorySpace};
use crate::bus::RegisterBus;
use crate::command::CommandCode;
use crate::engine::CommandEngine;
use crate::error::{Result, SdsuError};
use crate::protocol::WORD_MASK;
use tracing::info;

fn validate_word(operation: &'static str, value: i32) -> Result<()> {
    if value < 0 || value > WORD_MASK {
        return Err(SdsuError::invalid_argument(
            operation,
            format!("value {:#X} does not fit in 24 bits", value),
        ));
    }
    Ok(())
}

fn validate_memory_board(operation: &'static str, board: BoardId) -> Result<()> {
    if board == BoardId::Host {
        return Err(SdsuError::invalid_argument(operation, "the host board has no DSP memory"));
    }
    Ok(())
}

impl<B: RegisterBus> CommandEngine<B> {
    /// Reset the controller. Answered with `SYR` rather than `DON`.
    pub fn reset_controller(&mut self) -> Result<()> {
        self.command(BoardId::Interface, CommandCode::ResetController, &[])?;
        info!("controller reset");
        Ok(())
    }

    /// Send `value` to `board` and check it comes back unchanged
    pub fn test_data_link(&mut self, board: BoardId, value: i32) -> Result<()> {
        validate_memory_board("test_data_link", board)?;
        validate_word("test_data_link", value)?;
        self.command(board, CommandCode::TestDataLink, &[value])?;
        Ok(())
    }

    pub fn read_memory(&mut self, board: BoardId, space: MemorySpace, address: i32) -> Result<i32> {
        validate_memory_board("read_memory", board)?;
        validate_address("read_memory", address)?;
        self.command(board, CommandCode::ReadMemory, &[space.code(), address])
    }

    pub fn write_memory(
        &mut self,
        board: BoardId,
        space: MemorySpace,
        address: i32,
        value: i32,
    ) -> Result<()> {
        validate_memory_board("write_memory", board)?;
        if space == MemorySpace::R {
            return Err(SdsuError::invalid_argument("write_memory", "R space is read-only"));
        }
        validate_address("write_memory", address)?;
        validate_word("write_memory", value)?;
        self.command(board, CommandCode::WriteMemory, &[space.code(), address, value])?;
        Ok(())
    }

    /// Load application `number` from the board's EEPROM
    pub fn load_application(&mut self, board: BoardId, number: i32) -> Result<()> {
        if !board.is_programmable() {
            return Err(SdsuError::invalid_argument(
                "load_application",
                format!("{} board has no applications", board),
            ));
        }
        if number < 0 {
            return Err(SdsuError::invalid_argument(
                "load_application",
                format!("application number {} is negative", number),
            ));
        }
        self.command(board, CommandCode::LoadApplication, &[number])?;
        Ok(())
    }

    pub fn power_on(&mut self) -> Result<()> {
        self.command(BoardId::Timing, CommandCode::PowerOn, &[])?;
        Ok(())
    }

    pub fn power_off(&mut self) -> Result<()> {
        self.command(BoardId::Timing, CommandCode::PowerOff, &[])?;
        Ok(())
    }

    /// Set video processor gain and integrator speed. There is no meta
    /// command for this, so it goes through the command register.
    pub fn set_gain(&mut self, gain: Gain, fast: bool) -> Result<()> {
        let args = [gain.code(), i32::from(fast)];
        self.send_manual_command(BoardId::Timing, CommandCode::SetGain, &args)?
            .wait_default()?;
        Ok(())
    }

    /// Start clocking the array continuously between exposures
    pub fn idle(&mut self) -> Result<()> {
        self.command(BoardId::Timing, CommandCode::Idle, &[])?;
        Ok(())
    }

    pub fn stop_idle(&mut self) -> Result<()> {
        self.command(BoardId::Timing, CommandCode::StopIdle, &[])?;
        Ok(())
    }

    pub fn clear_array(&mut self) -> Result<()> {
        self.command(BoardId::Timing, CommandCode::ClearArray, &[])?;
        Ok(())
    }

    pub fn open_shutter(&mut self) -> Result<()> {
        self.command(BoardId::Timing, CommandCode::OpenShutter, &[])?;
        Ok(())
    }

    pub fn close_shutter(&mut self) -> Result<()> {
        self.command(BoardId::Timing, CommandCode::CloseShutter, &[])?;
        Ok(())
    }

    pub fn set_exposure_time(&mut self, exposure_ms: i32) -> Result<()> {
        if exposure_ms <= 0 {
            return Err(SdsuError::invalid_argument(
                "set_exposure_time",
                format!("exposure time {} ms is not positive", exposure_ms),
            ));
        }
        validate_word("set_exposure_time", exposure_ms)?;
        self.command(BoardId::Timing, CommandCode::SetExposureTime, &[exposure_ms])?;
        Ok(())
    }

    /// Start the exposure timer. Only the acknowledgement is awaited, not
    /// the end of the exposure.
    pub fn start_exposure(&mut self, open_shutter: bool) -> Result<()> {
        self.command(BoardId::Timing, CommandCode::StartExposure, &[i32::from(open_shutter)])?;
        Ok(())
    }

    /// Milliseconds elapsed in the current exposure
    pub fn get_exposure_time(&mut self) -> Result<i32> {
        self.command(BoardId::Timing, CommandCode::GetExposureTime, &[])
    }

    /// Close the shutter and stop the exposure timer
    pub fn abort_exposure(&mut self) -> Result<()> {
        self.command(BoardId::Timing, CommandCode::AbortExposure, &[])?;
        Ok(())
    }

    /// Stop a readout in progress. The controller is streaming pixel data
    /// when this is sent, so no reply is cleared or awaited.
    pub fn abort_readout(&mut self) -> Result<()> {
        self.send_without_reply(BoardId::Interface, CommandCode::AbortReadout, &[])
    }

    /// Start reading the array out.
    ///
    /// The destination is set to the timing board with no arguments before
    /// the trigger. Whether the controller needs this for the readout
    /// vector is unconfirmed; it is kept because removing it has never been
    /// tested against hardware.
    pub fn start_readout(&mut self) -> Result<()> {
        self.command(BoardId::Timing, CommandCode::StartReadout, &[])?;
        Ok(())
    }

    pub fn set_output_source(&mut self, amplifier: Amplifier) -> Result<()> {
        let args = [amplifier.code()];
        self.send_manual_command(BoardId::Timing, CommandCode::SetOutputSource, &args)?
            .wait_default()?;
        Ok(())
    }

    /// Set the utility board temperature target as a raw ADU count
    pub fn set_temperature_adu(&mut self, adu: i32) -> Result<()> {
        validate_word("set_temperature", adu)?;
        self.command(BoardId::Utility, CommandCode::SetTemperature, &[adu])?;
        Ok(())
    }

    /// Read the utility board temperature sensor as a raw ADU count
    pub fn get_temperature_adu(&mut self) -> Result<i32> {
        self.command(BoardId::Utility, CommandCode::ReadTemperature, &[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::Register;
    use crate::testing::{MockBus, MockReply};
    use crate::ErrorKind;

    #[test]
    fn test_validation_happens_before_bus_io() {
        let mut engine = CommandEngine::new(MockBus::new());

        let cases: Vec<Result<()>> = vec![
            engine.read_memory(BoardId::Host, MemorySpace::X, 0).map(|_| ()),
            engine.read_memory(BoardId::Timing, MemorySpace::X, -4).map(|_| ()),
            engine.write_memory(BoardId::Timing, MemorySpace::R, 0, 1),
            engine.write_memory(BoardId::Timing, MemorySpace::Y, 0, 0x1000000),
            engine.write_memory(BoardId::Timing, MemorySpace::Y, 0, -1),
            engine.test_data_link(BoardId::Host, 1),
            engine.load_application(BoardId::Interface, 1),
            engine.load_application(BoardId::Timing, -1),
            engine.set_exposure_time(0),
            engine.set_exposure_time(-10),
            engine.set_temperature_adu(-1),
        ];
        for result in cases {
            assert_eq!(result.unwrap_err().kind(), ErrorKind::Validation);
        }
        assert!(engine.bus().accesses().is_empty());
    }

    #[test]
    fn test_read_memory_returns_data_word() {
        let bus = MockBus::new().with_responder(|command, args| match command {
            CommandCode::ReadMemory if args[0] == MemorySpace::Y.code() && args[1] == 2 => {
                MockReply::Value(0x200)
            }
            _ => MockReply::Value(crate::protocol::DON),
        });
        let mut engine = CommandEngine::new(bus);
        assert_eq!(engine.read_memory(BoardId::Timing, MemorySpace::Y, 2).unwrap(), 0x200);
    }

    #[test]
    fn test_data_link_mismatch() {
        let bus = MockBus::new().with_responder(|_, args| MockReply::Value(args[0] ^ 1));
        let mut engine = CommandEngine::new(bus);
        let err = engine.test_data_link(BoardId::Utility, 0x55).unwrap_err();
        assert!(matches!(
            err,
            SdsuError::UnexpectedReply { operation: "test_data_link", got: 0x54, expected: 0x55 }
        ));
    }

    #[test]
    fn test_set_gain_arguments() {
        let mut engine = CommandEngine::new(MockBus::new());
        engine.set_gain(Gain::NinePointFive, true).unwrap();
        let writes = engine.bus().writes();
        assert!(writes.contains(&(Register::Argument(1), 0xA)));
        assert!(writes.contains(&(Register::Argument(2), 1)));
        assert_eq!(engine.bus().triggered(), vec![CommandCode::SetGain]);
    }

    #[test]
    fn test_start_readout_targets_timing_board() {
        let mut engine = CommandEngine::new(MockBus::new());
        engine.start_readout().unwrap();
        assert_eq!(engine.bus().writes()[0], (Register::Destination, BoardId::Timing.code()));
    }

    #[test]
    fn test_abort_readout_is_fire_and_forget() {
        let bus = MockBus::new().with_responder(|_, _| MockReply::Silent);
        let mut engine = CommandEngine::new(bus);
        engine.abort_readout().unwrap();
        assert_eq!(engine.bus().triggered(), vec![CommandCode::AbortReadout]);
    }
}
