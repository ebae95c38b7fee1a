//! sas - VAG decoder and SAS voice renderer
//!
//! # Commands
//!
//! - `sas decode` - Decode a VAG file to a mono WAV
//! - `sas render` - Play one voice through the SAS engine and record a stereo WAV
//!
//! # Usage
//!
//! ```bash
//! # Plain ADPCM decode, no envelope or resampling
//! sas decode jump.vag -o jump.wav
//!
//! # Half-speed loop, released after 100 grains, with reverb from a config file
//! sas render loop.vag --loop --pitch 0x800 --hold-grains 100 --config sas.toml
//!
//! # Raw 16-bit PCM source, keeping the final engine snapshot
//! sas render voice.raw --pcm -o voice.wav --snapshot voice.state
//! ```
//!
//! Logging follows `RUST_LOG` (default `info`).

mod decode;
mod render;
mod vag_file;
mod wav;

use anyhow::Result;
use clap::{Parser, Subcommand};

/// sas - VAG decoder and SAS voice renderer
#[derive(Parser)]
#[command(name = "sas")]
#[command(about = "VAG decoder and SAS voice renderer")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Decode a VAG file to a mono WAV
    Decode(decode::DecodeArgs),

    /// Render one voice through the SAS engine to a stereo WAV
    Render(render::RenderArgs),
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Decode(args) => decode::execute(args),
        Commands::Render(args) => render::execute(args),
    }
}
