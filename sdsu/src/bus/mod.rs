/*!
Register-level transport.

A backend implements three primitives: write a register, read a register and
pull image bytes. The five controller-facing operations (set argument, set
destination, trigger, get reply, clear reply) are provided on top of them so
that every backend encodes them identically.
*/

mod text;

pub use text::TextBus;

use crate::command::CommandShape;
use crate::error::{Result, SdsuError};
use crate::protocol::{MAX_ARGUMENTS, REPLY_SENTINEL};
use std::fmt;

/// Host interface register
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Register {
    /// Argument register, numbered 1 to 5
    Argument(u8),
    /// Board and argument count for the next trigger
    Destination,
    /// Host Command Vector Register
    Hcvr,
    /// Legacy Command Register
    Cmdr,
    /// Reply register
    Reply,
}

impl fmt::Display for Register {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Argument(i) => write!(f, "ARG{}", i),
            Self::Destination => f.write_str("DEST"),
            Self::Hcvr => f.write_str("HCVR"),
            Self::Cmdr => f.write_str("CMDR"),
            Self::Reply => f.write_str("REPLY"),
        }
    }
}

/// Register bus of one controller.
///
/// A bus has a single owner; it is not safe to interleave commands from two
/// threads on the same bus.
pub trait RegisterBus {
    /// Write a register
    fn write(&mut self, register: Register, value: i32) -> Result<()>;

    /// Read a register
    fn read(&mut self, register: Register) -> Result<i32>;

    /// Pull image bytes produced by a readout into `buf`, returning how many
    /// were written. Zero means no data is available yet.
    fn read_image(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Stage argument `index` (1-based) for the next trigger
    fn set_argument(&mut self, index: usize, value: i32) -> Result<()> {
        if index == 0 || index > MAX_ARGUMENTS {
            return Err(SdsuError::invalid_argument(
                "set_argument",
                format!("argument index {} outside 1..={}", index, MAX_ARGUMENTS),
            ));
        }
        self.write(Register::Argument(index as u8), value)
    }

    /// Set the destination word, see [`crate::addressing::encode_destination`]
    fn set_destination(&mut self, word: i32) -> Result<()> {
        self.write(Register::Destination, word)
    }

    /// Trigger a command on the register matching its shape
    fn trigger(&mut self, shape: CommandShape, code: i32) -> Result<()> {
        let register = match shape {
            CommandShape::Meta => Register::Hcvr,
            CommandShape::Manual => Register::Cmdr,
        };
        self.write(register, code)
    }

    /// Current reply register value, [`REPLY_SENTINEL`] if not yet answered
    fn get_reply(&mut self) -> Result<i32> {
        self.read(Register::Reply)
    }

    /// Reset the reply register to [`REPLY_SENTINEL`]
    fn clear_reply(&mut self) -> Result<()> {
        self.write(Register::Reply, REPLY_SENTINEL)
    }
}

impl<B: RegisterBus + ?Sized> RegisterBus for Box<B> {
    fn write(&mut self, register: Register, value: i32) -> Result<()> {
        (**self).write(register, value)
    }

    fn read(&mut self, register: Register) -> Result<i32> {
        (**self).read(register)
    }

    fn read_image(&mut self, buf: &mut [u8]) -> Result<usize> {
        (**self).read_image(buf)
    }
}
