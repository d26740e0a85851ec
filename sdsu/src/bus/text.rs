//! Offline register bus.
//!
//! [`TextBus`] stands in for the PCI interface when no hardware is attached.
//! Every register access is logged, and triggers are answered the way a
//! healthy controller answers them, so the full command and exposure paths
//! can run on a workstation.

use super::{Register, RegisterBus};
use crate::addressing::{BoardId, Gain, MemorySpace};
use crate::command::{CommandCode, CommandShape};
use crate::deinterlace::{interlace, DeinterlaceType, ImageBuffer};
use crate::error::{Result, SdsuError};
use crate::protocol::{
    DON, ERR, MAX_ARGUMENTS, REPLY_SENTINEL, SYR, TIMING_NPR_ADDRESS, TIMING_NSR_ADDRESS,
    WORD_MASK,
};
use std::collections::HashMap;
use std::time::Instant;
use tracing::{debug, info, trace, warn};

/// Emulated controller behind a logging register bus
#[derive(Debug)]
pub struct TextBus {
    args: [i32; MAX_ARGUMENTS],
    destination: i32,
    reply: i32,
    memory: HashMap<(BoardId, MemorySpace, i32), i32>,
    exposure_ms: i32,
    exposure_start: Option<Instant>,
    deinterlace: DeinterlaceType,
    temperature_adu: i32,
    image: Vec<u8>,
    image_pos: usize,
    failing: Option<CommandCode>,
}

impl Default for TextBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Pixel value of the synthetic test pattern
fn synthetic_pixel(row: usize, col: usize) -> u16 {
    ((row * 64 + col * 3) % 0x10000) as u16
}

impl TextBus {
    pub fn new() -> Self {
        Self {
            args: [0; MAX_ARGUMENTS],
            destination: 0,
            reply: REPLY_SENTINEL,
            memory: HashMap::new(),
            exposure_ms: 0,
            exposure_start: None,
            deinterlace: DeinterlaceType::Single,
            temperature_adu: 0,
            image: Vec::new(),
            image_pos: 0,
            failing: None,
        }
    }

    /// Answer `ERR` to every trigger of `command`
    pub fn with_failure(mut self, command: CommandCode) -> Self {
        self.failing = Some(command);
        self
    }

    /// Readout topology selected by the last set-output-source command
    pub fn deinterlace(&self) -> DeinterlaceType {
        self.deinterlace
    }

    /// Memory word as last written, zero if never written
    pub fn memory(&self, board: BoardId, space: MemorySpace, address: i32) -> i32 {
        self.memory.get(&(board, space, address)).copied().unwrap_or(0)
    }

    /// The image a readout of `ncols` x `nrows` produces, in row-major order
    pub fn synthetic_image(ncols: usize, nrows: usize) -> Result<ImageBuffer> {
        let pixels = (0..nrows)
            .flat_map(|row| (0..ncols).map(move |col| synthetic_pixel(row, col)))
            .collect();
        ImageBuffer::new(ncols, nrows, pixels)
    }

    fn board(&self) -> Option<BoardId> {
        BoardId::from_i32(self.destination & 0xFFFF)
    }

    fn elapsed_ms(&self) -> i32 {
        match self.exposure_start {
            Some(start) => {
                let ms = i32::try_from(start.elapsed().as_millis()).unwrap_or(i32::MAX);
                ms.min(self.exposure_ms)
            }
            None => 0,
        }
    }

    fn start_readout(&mut self) -> Option<i32> {
        let ncols = self.memory(BoardId::Timing, MemorySpace::Y, TIMING_NSR_ADDRESS);
        let nrows = self.memory(BoardId::Timing, MemorySpace::Y, TIMING_NPR_ADDRESS);
        if ncols <= 0 || nrows <= 0 {
            warn!("readout requested before image dimensions were set");
            return None;
        }
        let stream = Self::synthetic_image(ncols as usize, nrows as usize)
            .and_then(|image| interlace(self.deinterlace, &image));
        match stream {
            Ok(raw) => {
                self.image = raw.to_le_bytes();
                self.image_pos = 0;
                self.exposure_start = None;
                info!(
                    ncols,
                    nrows,
                    deinterlace = ?self.deinterlace,
                    bytes = self.image.len(),
                    "readout started"
                );
                Some(DON)
            }
            Err(e) => {
                warn!("cannot produce readout: {}", e);
                None
            }
        }
    }

    /// Reply to a trigger, `None` meaning `ERR`. Commands that are never
    /// answered return the current reply unchanged.
    fn respond(&mut self, command: CommandCode) -> Option<i32> {
        let [a1, a2, a3, ..] = self.args;
        match command {
            CommandCode::ResetController => {
                self.exposure_start = None;
                self.image.clear();
                self.image_pos = 0;
                Some(SYR)
            }
            CommandCode::TestDataLink => Some(a1),
            CommandCode::ReadMemory => {
                let board = self.board()?;
                let space = MemorySpace::from_code(a1)?;
                Some(self.memory(board, space, a2))
            }
            CommandCode::WriteMemory => {
                let board = self.board()?;
                let space = MemorySpace::from_code(a1)?;
                self.memory.insert((board, space, a2), a3 & WORD_MASK);
                Some(DON)
            }
            CommandCode::SetGain => Gain::from_code(a1).map(|_| DON),
            CommandCode::SetExposureTime => {
                self.exposure_ms = a1;
                Some(DON)
            }
            CommandCode::StartExposure => {
                self.exposure_start = Some(Instant::now());
                Some(DON)
            }
            CommandCode::GetExposureTime => Some(self.elapsed_ms()),
            CommandCode::AbortExposure => {
                self.exposure_start = None;
                Some(DON)
            }
            CommandCode::StartReadout => self.start_readout(),
            CommandCode::AbortReadout => {
                self.image.clear();
                self.image_pos = 0;
                Some(self.reply)
            }
            CommandCode::SetOutputSource => {
                self.deinterlace = DeinterlaceType::from_amplifier_code(a1)?;
                Some(DON)
            }
            CommandCode::SetTemperature => {
                self.temperature_adu = a1;
                Some(DON)
            }
            CommandCode::ReadTemperature => Some(self.temperature_adu),
            CommandCode::LoadApplication
            | CommandCode::PowerOn
            | CommandCode::PowerOff
            | CommandCode::Idle
            | CommandCode::StopIdle
            | CommandCode::ClearArray
            | CommandCode::OpenShutter
            | CommandCode::CloseShutter => Some(DON),
        }
    }

    fn trigger_command(&mut self, shape: CommandShape, code: i32) {
        let Some(command) = CommandCode::from_trigger(shape, code) else {
            warn!(code = format_args!("{:#08X}", code), "unknown command");
            self.reply = ERR;
            return;
        };
        let reply = if self.failing == Some(command) {
            None
        } else {
            self.respond(command)
        };
        self.reply = reply.unwrap_or(ERR);
        debug!(
            command = command.name(),
            board = ?self.board(),
            reply = format_args!("{:#08X}", self.reply),
            "command answered"
        );
    }
}

impl RegisterBus for TextBus {
    fn write(&mut self, register: Register, value: i32) -> Result<()> {
        trace!(%register, value = format_args!("{:#08X}", value), "write");
        match register {
            Register::Argument(i) => {
                let slot = usize::from(i)
                    .checked_sub(1)
                    .and_then(|idx| self.args.get_mut(idx))
                    .ok_or_else(|| SdsuError::transport(format!("no argument register {}", i)))?;
                *slot = value;
            }
            Register::Destination => self.destination = value,
            Register::Reply => self.reply = value,
            Register::Hcvr => self.trigger_command(CommandShape::Meta, value),
            Register::Cmdr => self.trigger_command(CommandShape::Manual, value),
        }
        Ok(())
    }

    fn read(&mut self, register: Register) -> Result<i32> {
        let value = match register {
            Register::Argument(i) => usize::from(i)
                .checked_sub(1)
                .and_then(|idx| self.args.get(idx))
                .copied()
                .ok_or_else(|| SdsuError::transport(format!("no argument register {}", i)))?,
            Register::Destination => self.destination,
            Register::Reply => self.reply,
            Register::Hcvr | Register::Cmdr => 0,
        };
        trace!(%register, value = format_args!("{:#08X}", value), "read");
        Ok(value)
    }

    fn read_image(&mut self, buf: &mut [u8]) -> Result<usize> {
        let remaining = &self.image[self.image_pos..];
        let n = buf.len().min(remaining.len());
        buf[..n].copy_from_slice(&remaining[..n]);
        self.image_pos += n;
        trace!(bytes = n, "image read");
        Ok(n)
    }
}
