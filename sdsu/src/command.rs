/*!
Controller command table.

Meta commands are triggered through the Host Command Vector Register (HCVR)
and use vector codes in the `0x80xx` range. Manual commands are triggered
through the legacy Command Register (CMDR) and use ASCII-packed 24-bit
mnemonics. The two code spaces never overlap.
*/

use crate::engine::Expected;
use crate::protocol::{DON, SYR};

/// Register a command is triggered through
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandShape {
    /// Host Command Vector Register
    Meta,
    /// Legacy Command Register
    Manual,
}

/// What the controller sends back for a command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyPolicy {
    /// `DON`
    Done,
    /// A data word, returned verbatim
    Actual,
    /// The first argument, echoed back
    Echo,
    /// `SYR`
    Reset,
    /// Nothing; the reply register must not be polled
    NoReply,
}

/// Every command the host sends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandCode {
    ResetController,
    TestDataLink,
    ReadMemory,
    WriteMemory,
    LoadApplication,
    PowerOn,
    PowerOff,
    SetGain,
    Idle,
    StopIdle,
    ClearArray,
    OpenShutter,
    CloseShutter,
    SetExposureTime,
    StartExposure,
    GetExposureTime,
    AbortExposure,
    AbortReadout,
    StartReadout,
    SetOutputSource,
    SetTemperature,
    ReadTemperature,
}

/// Static description of a command
#[derive(Debug, Clone, Copy)]
pub struct CommandInfo {
    pub command: CommandCode,
    pub code: i32,
    pub name: &'static str,
    pub shape: CommandShape,
    pub reply: ReplyPolicy,
}

const fn meta(
    command: CommandCode,
    code: i32,
    name: &'static str,
    reply: ReplyPolicy,
) -> CommandInfo {
    CommandInfo { command, code, name, shape: CommandShape::Meta, reply }
}

const fn manual(
    command: CommandCode,
    code: i32,
    name: &'static str,
    reply: ReplyPolicy,
) -> CommandInfo {
    CommandInfo { command, code, name, shape: CommandShape::Manual, reply }
}

/// Command table, indexed by [`CommandCode`] discriminant
pub const COMMAND_TABLE: &[CommandInfo] = &[
    meta(CommandCode::ResetController, 0x807B, "reset_controller", ReplyPolicy::Reset),
    meta(CommandCode::TestDataLink, 0x8081, "test_data_link", ReplyPolicy::Echo),
    meta(CommandCode::ReadMemory, 0x8083, "read_memory", ReplyPolicy::Actual),
    meta(CommandCode::WriteMemory, 0x8085, "write_memory", ReplyPolicy::Done),
    meta(CommandCode::LoadApplication, 0x8087, "load_application", ReplyPolicy::Done),
    meta(CommandCode::PowerOn, 0x8089, "power_on", ReplyPolicy::Done),
    meta(CommandCode::PowerOff, 0x808B, "power_off", ReplyPolicy::Done),
    manual(CommandCode::SetGain, 0x53474E, "set_gain", ReplyPolicy::Done), // "SGN"
    meta(CommandCode::Idle, 0x808D, "idle", ReplyPolicy::Done),
    meta(CommandCode::StopIdle, 0x808F, "stop_idle", ReplyPolicy::Done),
    meta(CommandCode::ClearArray, 0x8091, "clear_array", ReplyPolicy::Done),
    meta(CommandCode::OpenShutter, 0x8093, "open_shutter", ReplyPolicy::Done),
    meta(CommandCode::CloseShutter, 0x8095, "close_shutter", ReplyPolicy::Done),
    meta(CommandCode::SetExposureTime, 0x8097, "set_exposure_time", ReplyPolicy::Done),
    meta(CommandCode::StartExposure, 0x8099, "start_exposure", ReplyPolicy::Done),
    meta(CommandCode::GetExposureTime, 0x809B, "get_exposure_time", ReplyPolicy::Actual),
    meta(CommandCode::AbortExposure, 0x809D, "abort_exposure", ReplyPolicy::Done),
    meta(CommandCode::AbortReadout, 0x8079, "abort_readout", ReplyPolicy::NoReply),
    meta(CommandCode::StartReadout, 0x807D, "start_readout", ReplyPolicy::Done),
    manual(CommandCode::SetOutputSource, 0x534F53, "set_output_source", ReplyPolicy::Done), // "SOS"
    meta(CommandCode::SetTemperature, 0x809F, "set_temperature", ReplyPolicy::Done),
    meta(CommandCode::ReadTemperature, 0x80A1, "read_temperature", ReplyPolicy::Actual),
];

impl CommandCode {
    /// Table entry for this command
    pub fn info(self) -> &'static CommandInfo {
        &COMMAND_TABLE[self as usize]
    }

    /// 24-bit trigger code
    pub fn code(self) -> i32 {
        self.info().code
    }

    /// Human readable name, also used as the operation name in errors
    pub fn name(self) -> &'static str {
        self.info().name
    }

    pub fn shape(self) -> CommandShape {
        self.info().shape
    }

    pub fn reply(self) -> ReplyPolicy {
        self.info().reply
    }

    /// Look up a command from the register it was triggered on and its code
    pub fn from_trigger(shape: CommandShape, code: i32) -> Option<Self> {
        COMMAND_TABLE
            .iter()
            .find(|info| info.shape == shape && info.code == code)
            .map(|info| info.command)
    }

    /// Expected reply for a call with the given arguments, `None` for commands
    /// that are never answered
    pub fn expected_reply(self, args: &[i32]) -> Option<Expected> {
        match self.reply() {
            ReplyPolicy::Done => Some(Expected::Value(DON)),
            ReplyPolicy::Reset => Some(Expected::Value(SYR)),
            ReplyPolicy::Actual => Some(Expected::ActualValue),
            ReplyPolicy::Echo => Some(Expected::Value(args.first().copied().unwrap_or(0))),
            ReplyPolicy::NoReply => None,
        }
    }
}
