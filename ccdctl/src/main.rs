/*!
# CCD Controller CLI

Command-line control of an SDSU CCD controller: startup, array clears,
exposures, program downloads and data link tests.

## Usage

```bash
ccdctl config --output ccdctl.toml
ccdctl --config ccdctl.toml setup
ccdctl expose --ms 5000
ccdctl expose --ms 5000 --dark
ccdctl download --board tim --file tim.lod
ccdctl test-link --board util --value 0x123456
```

Ctrl+C during a command aborts it; an exposure in progress is stopped on the
controller before the program exits.
*/

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sdsu::{BoardId, TextBus};
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod config;
mod session;

use config::AppConfig;
use session::Session;

#[derive(Parser)]
#[command(name = "ccdctl")]
#[command(about = "SDSU CCD controller command-line interface")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path
    #[arg(short, long, default_value = "ccdctl.toml")]
    config: PathBuf,

    /// Log every command and reply
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Reset, test and start the controller
    Setup,

    /// Clear charge from the array
    Clear,

    /// Take an exposure and save it
    Expose {
        /// Exposure time in milliseconds
        #[arg(long)]
        ms: u32,

        /// Keep the shutter closed
        #[arg(long)]
        dark: bool,
    },

    /// Download a DSP program file
    Download {
        /// Target board (tim or util)
        #[arg(short, long, value_parser = parse_board)]
        board: BoardId,

        /// Program file
        #[arg(short, long)]
        file: PathBuf,
    },

    /// Send a value to a board and check it is echoed
    TestLink {
        /// Target board (pci, tim or util)
        #[arg(short, long, value_parser = parse_board)]
        board: BoardId,

        /// 24-bit value, decimal or 0x-prefixed hex
        #[arg(long, value_parser = parse_word)]
        value: i32,
    },

    /// Power the CCD down
    Shutdown,

    /// Generate configuration file
    Config {
        /// Output path for configuration file
        #[arg(short, long, default_value = "ccdctl.toml")]
        output: PathBuf,
    },
}

fn parse_board(s: &str) -> Result<BoardId, String> {
    s.chars()
        .next()
        .and_then(BoardId::from_letter)
        .ok_or_else(|| format!("unknown board '{}'", s))
}

fn parse_word(s: &str) -> Result<i32, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => i32::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed
        .ok()
        .filter(|v| (0..=sdsu::protocol::WORD_MASK).contains(v))
        .ok_or_else(|| format!("'{}' is not a 24-bit value", s))
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .init();

    match cli.command {
        Commands::Setup => {
            let report = open_session(&cli.config)?.setup()?;
            if report.all_passed() {
                println!("✅ Controller ready");
            } else {
                println!("⚠️ Controller ready with data link failures: {:?}", report);
            }
        }
        Commands::Clear => {
            open_session(&cli.config)?.clear()?;
            println!("✅ Array cleared");
        }
        Commands::Expose { ms, dark } => {
            let saved = open_session(&cli.config)?.expose(ms, dark)?;
            println!("✅ Image: {}", saved.image_path.display());
            println!("📝 Metadata: {}", saved.metadata_path.display());
        }
        Commands::Download { board, file } => {
            open_session(&cli.config)?.download(board, &file)?;
            println!("✅ Downloaded {} to the {} board", file.display(), board);
        }
        Commands::TestLink { board, value } => {
            open_session(&cli.config)?
                .test_link(board, value)
                .with_context(|| format!("Data link test of the {} board failed", board))?;
            println!("✅ {} board echoed {:#08X}", board, value);
        }
        Commands::Shutdown => {
            open_session(&cli.config)?.shutdown()?;
            println!("✅ Controller powered off");
        }
        Commands::Config { output } => return generate_config_file(&output),
    }

    info!("done");
    Ok(())
}

/// Open the controller and route Ctrl+C to its abort flag
fn open_session(config_path: &Path) -> Result<Session<TextBus>> {
    let config = AppConfig::load_or_default(config_path)?;
    let session = Session::new(TextBus::new(), config);

    let abort = session.abort_handle();
    ctrlc::set_handler(move || {
        warn!("🛑 Received Ctrl+C, aborting");
        abort.abort();
    })?;

    Ok(session)
}

/// Generate a default configuration file
fn generate_config_file(output_path: &Path) -> Result<()> {
    let config = AppConfig::default();
    config.save_to_file(output_path)?;

    println!("✅ Generated configuration file: {}", output_path.display());
    println!("📝 Edit the file to customize settings, then run:");
    println!("   ccdctl --config {} setup", output_path.display());

    Ok(())
}
