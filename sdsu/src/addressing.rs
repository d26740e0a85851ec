/*!
Board, memory space, gain and amplifier addressing.

Every value in this module is a closed set. Decoding a wire value or a
user-supplied value that is not a member of the set fails with
[`SdsuError::InvalidArgument`]; nothing is coerced.
*/

use crate::error::{Result, SdsuError};
use crate::protocol::MAX_ARGUMENTS;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Physical board a command is addressed to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(i32)]
pub enum BoardId {
    Host = 0,
    Interface = 1,
    Timing = 2,
    Utility = 3,
}

impl BoardId {
    /// Parse a board id from its wire value
    pub fn from_i32(value: i32) -> Option<Self> {
        match value {
            0 => Some(Self::Host),
            1 => Some(Self::Interface),
            2 => Some(Self::Timing),
            3 => Some(Self::Utility),
            _ => None,
        }
    }

    /// Parse the board letter used in DSP program headers
    pub fn from_letter(letter: char) -> Option<Self> {
        match letter.to_ascii_uppercase() {
            'H' => Some(Self::Host),
            'I' | 'P' => Some(Self::Interface),
            'T' => Some(Self::Timing),
            'U' => Some(Self::Utility),
            _ => None,
        }
    }

    /// Wire value written into the low half of the destination register
    pub fn code(self) -> i32 {
        self as i32
    }

    /// Whether the board runs a DSP that can receive downloaded programs
    pub fn is_programmable(self) -> bool {
        matches!(self, Self::Timing | Self::Utility)
    }
}

impl fmt::Display for BoardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Host => "host",
            Self::Interface => "interface",
            Self::Timing => "timing",
            Self::Utility => "utility",
        };
        f.write_str(name)
    }
}

/// DSP memory space targeted by read/write memory commands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MemorySpace {
    D,
    R,
    P,
    X,
    Y,
}

impl MemorySpace {
    /// ASCII-packed wire code
    pub fn code(self) -> i32 {
        match self {
            Self::D => 0x5F5F44,
            Self::R => 0x5F5F52,
            Self::P => 0x5F5F50,
            Self::X => 0x5F5F58,
            Self::Y => 0x5F5F59,
        }
    }

    /// Parse a memory space from its wire code
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0x5F5F44 => Some(Self::D),
            0x5F5F52 => Some(Self::R),
            0x5F5F50 => Some(Self::P),
            0x5F5F58 => Some(Self::X),
            0x5F5F59 => Some(Self::Y),
            _ => None,
        }
    }

    /// Parse the space character used in `_DATA` program lines
    pub fn from_char(c: char) -> Option<Self> {
        match c {
            'D' => Some(Self::D),
            'R' => Some(Self::R),
            'P' => Some(Self::P),
            'X' => Some(Self::X),
            'Y' => Some(Self::Y),
            _ => None,
        }
    }
}

/// Video processor gain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Gain {
    One,
    Two,
    FourPointSevenFive,
    NinePointFive,
}

impl Gain {
    /// Wire code sent with the set-gain command
    pub fn code(self) -> i32 {
        match self {
            Self::One => 0x1,
            Self::Two => 0x2,
            Self::FourPointSevenFive => 0x5,
            Self::NinePointFive => 0xA,
        }
    }

    /// Parse a gain from its wire code
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0x1 => Some(Self::One),
            0x2 => Some(Self::Two),
            0x5 => Some(Self::FourPointSevenFive),
            0xA => Some(Self::NinePointFive),
            _ => None,
        }
    }

    /// Parse a gain from its multiplication factor
    pub fn from_factor(factor: f64) -> Option<Self> {
        [Self::One, Self::Two, Self::FourPointSevenFive, Self::NinePointFive]
            .into_iter()
            .find(|g| (g.factor() - factor).abs() < 1e-9)
    }

    /// Multiplication factor
    pub fn factor(self) -> f64 {
        match self {
            Self::One => 1.0,
            Self::Two => 2.0,
            Self::FourPointSevenFive => 4.75,
            Self::NinePointFive => 9.5,
        }
    }
}

/// Output amplifier selection for the set-output-source command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Amplifier {
    BottomLeft,
    BottomRight,
    TopLeft,
    TopRight,
    /// Top and bottom left amplifiers, split parallel readout
    BothLeft,
    /// Bottom left and right amplifiers, split serial readout
    BothBottom,
    /// All four amplifiers, quad readout
    All,
}

impl Amplifier {
    /// ASCII-packed wire code
    pub fn code(self) -> i32 {
        match self {
            Self::BottomLeft => 0x5F4C4C,  // "_LL"
            Self::BottomRight => 0x5F4C52, // "_LR"
            Self::TopLeft => 0x5F554C,     // "_UL"
            Self::TopRight => 0x5F5552,    // "_UR"
            Self::BothLeft => 0x5F5F4C,    // "__L"
            Self::BothBottom => 0x5F5F32,  // "__2"
            Self::All => 0x414C4C,         // "ALL"
        }
    }
}

/// Validate a board wire value
pub fn validate_board(value: i32) -> Result<BoardId> {
    BoardId::from_i32(value).ok_or_else(|| {
        SdsuError::invalid_argument("validate_board", format!("unknown board id {}", value))
    })
}

/// Validate a memory space wire code
pub fn validate_memory_space(code: i32) -> Result<MemorySpace> {
    MemorySpace::from_code(code).ok_or_else(|| {
        SdsuError::invalid_argument(
            "validate_memory_space",
            format!("unknown memory space {:#08X}", code),
        )
    })
}

/// Validate a gain wire code
pub fn validate_gain(code: i32) -> Result<Gain> {
    Gain::from_code(code).ok_or_else(|| {
        SdsuError::invalid_argument("validate_gain", format!("unknown gain code {:#X}", code))
    })
}

/// Validate a DSP memory address
pub fn validate_address(operation: &'static str, address: i32) -> Result<()> {
    if address < 0 {
        return Err(SdsuError::invalid_argument(
            operation,
            format!("address {} is negative", address),
        ));
    }
    Ok(())
}

/// Pack an argument count and board into the destination register word.
///
/// The destination is latched for the next trigger, so it must be written
/// before the argument registers of that command.
pub fn encode_destination(board: BoardId, arg_count: usize) -> Result<i32> {
    if arg_count > MAX_ARGUMENTS {
        return Err(SdsuError::invalid_argument(
            "encode_destination",
            format!("{} arguments, at most {} allowed", arg_count, MAX_ARGUMENTS),
        ));
    }
    Ok(((arg_count as i32) << 16) | board.code())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_board_parsing() {
        for board in [BoardId::Host, BoardId::Interface, BoardId::Timing, BoardId::Utility] {
            assert_eq!(validate_board(board.code()).unwrap(), board);
        }
        for bad in [-1, 4, 0x100, i32::MAX] {
            assert_eq!(validate_board(bad).unwrap_err().kind(), ErrorKind::Validation);
        }
        assert_eq!(BoardId::from_letter('t'), Some(BoardId::Timing));
        assert_eq!(BoardId::from_letter('Z'), None);
    }

    #[test]
    fn test_memory_space_codes() {
        assert_eq!(MemorySpace::D.code(), 0x5F5F44);
        assert_eq!(MemorySpace::R.code(), 0x5F5F52);
        assert_eq!(MemorySpace::P.code(), 0x5F5F50);
        assert_eq!(MemorySpace::X.code(), 0x5F5F58);
        assert_eq!(MemorySpace::Y.code(), 0x5F5F59);
        let spaces = [
            MemorySpace::D,
            MemorySpace::R,
            MemorySpace::P,
            MemorySpace::X,
            MemorySpace::Y,
        ];
        for space in spaces {
            assert_eq!(validate_memory_space(space.code()).unwrap(), space);
        }
        assert!(validate_memory_space(0x5F5F41).is_err());
        assert!(validate_memory_space(0).is_err());
        assert_eq!(MemorySpace::from_char('Y'), Some(MemorySpace::Y));
        assert_eq!(MemorySpace::from_char('y'), None);
    }

    #[test]
    fn test_gain_codes() {
        assert_eq!(validate_gain(0x5).unwrap(), Gain::FourPointSevenFive);
        assert_eq!(validate_gain(0xA).unwrap(), Gain::NinePointFive);
        assert!(validate_gain(0x3).is_err());
        assert_eq!(Gain::from_factor(4.75), Some(Gain::FourPointSevenFive));
        assert_eq!(Gain::from_factor(3.0), None);
    }

    #[test]
    fn test_address_validation() {
        assert!(validate_address("read_memory", 0).is_ok());
        assert!(validate_address("read_memory", 0x3FFF).is_ok());
        let err = validate_address("read_memory", -1).unwrap_err();
        assert!(matches!(err, SdsuError::InvalidArgument { operation: "read_memory", .. }));
    }

    #[test]
    fn test_destination_encoding() {
        assert_eq!(encode_destination(BoardId::Timing, 0).unwrap(), 0x0000_0002);
        assert_eq!(encode_destination(BoardId::Utility, 3).unwrap(), 0x0003_0003);
        assert_eq!(encode_destination(BoardId::Interface, 5).unwrap(), 0x0005_0001);
        assert!(encode_destination(BoardId::Timing, 6).is_err());
    }
}
