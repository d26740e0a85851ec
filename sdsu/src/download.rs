/*!
DSP program download.

Program files are the line-oriented text produced by the DSP assembler:

```text
_START TIM_M 1.0
_DATA P 0000
0C0190 000000 000000
_DATA Y 0001
000200
_END
```

The first line names the target board by its first letter. Each `_DATA`
line starts a block at a hex address in a memory space; the hex words that
follow are written to consecutive addresses. Addresses at or above
[`BOOT_CODE_BOUNDARY`] hold boot code and are skipped. Any other `_`
directive ends the current block and is otherwise ignored.
*/

use crate::addressing::{BoardId, MemorySpace};
use crate::bus::RegisterBus;
use crate::engine::CommandEngine;
use crate::error::{Result, SdsuError};
use crate::protocol::{BOOT_CODE_BOUNDARY, WORD_MASK};
use regex::Regex;
use std::io::BufRead;
use std::sync::OnceLock;
use tracing::{debug, info};

fn start_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^_START\s+(\S+)").expect("valid regex"))
}

fn data_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^_DATA\s+(\S+)\s+([0-9A-Fa-f]+)\s*$").expect("valid regex")
    })
}

/// What a download did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DownloadSummary {
    pub blocks: usize,
    pub words_written: usize,
    /// Boot code words that were not sent
    pub words_skipped: usize,
}

#[derive(Debug, Clone, Copy)]
struct Block {
    space: MemorySpace,
    address: i32,
}

fn parse_header(line_no: usize, line: &str) -> Result<BoardId> {
    let caps = start_pattern()
        .captures(line.trim())
        .ok_or_else(|| SdsuError::download(line_no, "expected _START header"))?;
    let name = &caps[1];
    name.chars()
        .next()
        .and_then(BoardId::from_letter)
        .ok_or_else(|| SdsuError::download(line_no, format!("unknown board '{}'", name)))
}

fn parse_block(line_no: usize, line: &str) -> Result<Block> {
    let Some(caps) = data_pattern().captures(line) else {
        return Err(SdsuError::download(line_no, format!("malformed _DATA line '{}'", line)));
    };
    let mut chars = caps[1].chars();
    let space = match (chars.next(), chars.next()) {
        (Some(c), None) => MemorySpace::from_char(c),
        _ => None,
    }
    .ok_or_else(|| SdsuError::download(line_no, format!("unknown memory space '{}'", &caps[1])))?;
    let address = i32::from_str_radix(&caps[2], 16)
        .map_err(|_| SdsuError::download(line_no, format!("bad address '{}'", &caps[2])))?;
    Ok(Block { space, address })
}

fn parse_word(line_no: usize, token: &str) -> Result<i32> {
    i32::from_str_radix(token, 16)
        .ok()
        .filter(|w| (0..=WORD_MASK).contains(w))
        .ok_or_else(|| SdsuError::download(line_no, format!("bad data word '{}'", token)))
}

/// Stream a program file into `board`'s memory.
///
/// The abort flag is checked before each line. The header must name
/// `board`.
pub fn download_program<B: RegisterBus, R: BufRead>(
    engine: &mut CommandEngine<B>,
    board: BoardId,
    reader: R,
) -> Result<DownloadSummary> {
    if !board.is_programmable() {
        return Err(SdsuError::invalid_argument(
            "download",
            format!("{} board cannot be programmed", board),
        ));
    }
    let abort = engine.abort_handle();
    let mut summary = DownloadSummary::default();
    let mut header_seen = false;
    let mut block: Option<Block> = None;
    let mut lines_read = 0;

    for (index, line) in reader.lines().enumerate() {
        if abort.is_aborted() {
            return Err(SdsuError::Aborted { operation: "download" });
        }
        let line_no = index + 1;
        lines_read = line_no;
        let line = line?;
        let trimmed = line.trim();

        if !header_seen {
            let target = parse_header(line_no, trimmed)?;
            if target != board {
                return Err(SdsuError::download(
                    line_no,
                    format!("program is for the {} board, not {}", target, board),
                ));
            }
            header_seen = true;
            continue;
        }

        if trimmed.starts_with("_END") {
            info!(
                %board,
                blocks = summary.blocks,
                written = summary.words_written,
                skipped = summary.words_skipped,
                "program downloaded"
            );
            return Ok(summary);
        }
        if trimmed.starts_with("_DATA") {
            let b = parse_block(line_no, trimmed)?;
            debug!(space = ?b.space, address = format_args!("{:#06X}", b.address), "data block");
            block = Some(b);
            summary.blocks += 1;
            continue;
        }
        if trimmed.starts_with('_') {
            block = None;
            continue;
        }

        let Some(current) = block.as_mut() else {
            continue;
        };
        for token in trimmed.split_whitespace() {
            let word = parse_word(line_no, token)?;
            if current.address < BOOT_CODE_BOUNDARY {
                engine.write_memory(board, current.space, current.address, word)?;
                summary.words_written += 1;
            } else {
                summary.words_skipped += 1;
            }
            current.address = current.address.checked_add(1).ok_or_else(|| {
                SdsuError::download(line_no, "block runs past the end of the address space")
            })?;
        }
    }

    if !header_seen {
        return Err(SdsuError::download(1, "empty program file"));
    }
    Err(SdsuError::download(lines_read, "missing _END"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::Register;
    use crate::command::CommandCode;
    use crate::testing::MockBus;
    use crate::ErrorKind;
    use std::io::{Cursor, Write};

    fn writes_of(engine: &CommandEngine<MockBus>) -> Vec<(i32, i32, i32)> {
        let writes = engine.bus().writes();
        let mut out = Vec::new();
        let mut args = [0; 3];
        for (register, value) in writes {
            match register {
                Register::Argument(i) if i <= 3 => args[usize::from(i) - 1] = value,
                Register::Hcvr if value == CommandCode::WriteMemory.code() => {
                    out.push((args[0], args[1], args[2]))
                }
                _ => {}
            }
        }
        out
    }

    #[test]
    fn test_download_blocks() {
        let program = "_START TIM_M 1.0\n\
                       _DATA P 0010\n\
                       0C0190 000001\n\
                       0A0B0C\n\
                       _SYMBOL P\n\
                       FFFFFF\n\
                       _DATA Y 0002\n\
                       000200\n\
                       _END\n";
        let mut engine = CommandEngine::new(MockBus::new());
        let summary = download_program(&mut engine, BoardId::Timing, Cursor::new(program)).unwrap();

        assert_eq!(
            summary,
            DownloadSummary { blocks: 2, words_written: 4, words_skipped: 0 }
        );
        let p = MemorySpace::P.code();
        assert_eq!(
            writes_of(&engine),
            vec![
                (p, 0x10, 0x0C0190),
                (p, 0x11, 0x000001),
                (p, 0x12, 0x0A0B0C),
                (MemorySpace::Y.code(), 0x2, 0x200),
            ]
        );
    }

    #[test]
    fn test_boot_code_is_skipped() {
        let program = "_START UTIL\n_DATA P 3FFF\n000001 000002 000003\n_END\n";
        let mut engine = CommandEngine::new(MockBus::new());
        let summary =
            download_program(&mut engine, BoardId::Utility, Cursor::new(program)).unwrap();
        assert_eq!(summary.words_written, 1);
        assert_eq!(summary.words_skipped, 2);
        assert_eq!(writes_of(&engine), vec![(MemorySpace::P.code(), 0x3FFF, 1)]);
    }

    #[test]
    fn test_format_errors() {
        let cases = [
            ("", BoardId::Timing),
            ("_START Q\n_END\n", BoardId::Timing),
            ("_START UTIL\n_END\n", BoardId::Timing),
            ("_START TIM\n_DATA Q 0000\n_END\n", BoardId::Timing),
            ("_START TIM\n_DATA P zz\n_END\n", BoardId::Timing),
            ("_START TIM\n_DATA P 0000\n12345G\n_END\n", BoardId::Timing),
            ("_START TIM\n_DATA P 0000\n1000000\n_END\n", BoardId::Timing),
            ("_START TIM\n_DATA P 0000\n000001\n", BoardId::Timing),
        ];
        for (program, board) in cases {
            let mut engine = CommandEngine::new(MockBus::new());
            let err = download_program(&mut engine, board, Cursor::new(program)).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Validation, "{:?}", program);
        }
    }

    #[test]
    fn test_block_past_address_space_is_rejected() {
        let program = "_START TIM\n_DATA P 7FFFFFFF\n000001 000002\n_END\n";
        let mut engine = CommandEngine::new(MockBus::new());
        let err = download_program(&mut engine, BoardId::Timing, Cursor::new(program)).unwrap_err();
        assert!(matches!(err, SdsuError::Download { line: 3, .. }));
        assert!(writes_of(&engine).is_empty());
    }

    #[test]
    fn test_interface_board_rejected() {
        let mut engine = CommandEngine::new(MockBus::new());
        let program = Cursor::new("_START I\n_END\n");
        assert!(download_program(&mut engine, BoardId::Interface, program).is_err());
    }

    #[test]
    fn test_abort_stops_download() {
        let mut engine = CommandEngine::new(MockBus::new());
        engine.abort_handle().abort();
        let program = Cursor::new("_START TIM\n_END\n");
        let err = download_program(&mut engine, BoardId::Timing, program).unwrap_err();
        assert!(err.is_aborted());
        assert!(engine.bus().accesses().is_empty());
    }

    #[test]
    fn test_download_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "_START TIM\n_DATA X 0000\n000005\n_END\n").unwrap();
        let reader = std::io::BufReader::new(std::fs::File::open(file.path()).unwrap());
        let mut engine = CommandEngine::new(MockBus::new());
        let summary = download_program(&mut engine, BoardId::Timing, reader).unwrap();
        assert_eq!(summary.words_written, 1);
    }
}
