/*!
# SDSU CCD Controller Library

This crate drives an SDSU CCD controller from the host: it encodes commands
onto the controller's register interface, waits for replies, sequences
exposures and reorders the raw pixel stream into row-major images.

## Core Types

- [`RegisterBus`] - register-level transport implemented by each backend
- [`CommandEngine`] - command staging and reply resolution
- [`Controller`] - exposure state machine on top of the engine
- [`ImageBuffer`] - 16-bit pixel data, raw or deinterlaced

## Modules

- [`addressing`] - board, memory space and gain validation and encoding
- [`bus`] - register bus trait and the offline text bus
- [`command`] - command code table
- [`engine`] - command/reply engine and the shared abort flag
- [`dsp`] - validated controller commands
- [`exposure`] - clear / expose / readout sequencing with abort
- [`deinterlace`] - multi-port readout reordering
- [`download`] - DSP program file parsing and download
- [`setup`] - controller startup, dimensions and shutdown
- [`error`] - error types
*/

pub mod addressing;
pub mod bus;
pub mod command;
pub mod deinterlace;
pub mod download;
pub mod dsp;
pub mod engine;
pub mod error;
pub mod exposure;
pub mod setup;

#[cfg(test)]
pub(crate) mod testing;

// Re-export commonly used types
pub use addressing::{BoardId, Gain, MemorySpace};
pub use bus::{Register, RegisterBus, TextBus};
pub use command::{CommandCode, CommandShape, ReplyPolicy};
pub use deinterlace::{DeinterlaceOutcome, DeinterlaceType, ImageBuffer};
pub use engine::{AbortHandle, CommandEngine, EngineTiming, Expected};
pub use error::{ErrorKind, Result, SdsuError};
pub use exposure::{Controller, ExposureRequest, ExposureResult, ExposureState, ExposureTiming};
pub use setup::{HardwareTestReport, ProgramSource, SetupConfig};

/// Version information for the library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Protocol constants
pub mod protocol {
    /// Reply register contents between a trigger and the controller's answer
    pub const REPLY_SENTINEL: i32 = -1;

    /// "DON" - command completed
    pub const DON: i32 = 0x444F4E;

    /// "ERR" - command failed on the controller
    pub const ERR: i32 = 0x455252;

    /// "SYR" - system reset acknowledged, only sent by the reset command
    pub const SYR: i32 = 0x535952;

    /// Maximum number of argument registers
    pub const MAX_ARGUMENTS: usize = 5;

    /// Commands and data words are 24 bits wide
    pub const WORD_MASK: i32 = 0x00FF_FFFF;

    /// Bytes per pixel in the readout stream
    pub const BYTES_PER_PIXEL: usize = 2;

    /// Program addresses at or above this hold boot code and are never downloaded
    pub const BOOT_CODE_BOUNDARY: i32 = 0x4000;

    /// Default reply poll interval in milliseconds
    pub const DEFAULT_REPLY_POLL_MS: u64 = 10;

    /// Default reply timeout in milliseconds
    pub const DEFAULT_REPLY_TIMEOUT_MS: u64 = 5000;

    /// Default remaining exposure time at which the host stops polling and starts readout
    pub const DEFAULT_READOUT_REMAINING_TIME_MS: u64 = 1000;

    /// Default elapsed-time polling tick in milliseconds
    pub const DEFAULT_EXPOSURE_TICK_MS: u64 = 1000;

    /// Timing board Y memory address holding the number of serial pixels (columns)
    pub const TIMING_NSR_ADDRESS: i32 = 0x1;

    /// Timing board Y memory address holding the number of parallel pixels (rows)
    pub const TIMING_NPR_ADDRESS: i32 = 0x2;
}
