//! Decode command - VAG to mono WAV
//!
//! Straight block decode with no envelope, pitch or looping. Useful for
//! checking a sample before wiring it into a voice.

use anyhow::{Context, Result};
use clap::Args;
use std::path::PathBuf;

use crate::{vag_file, wav};

/// Arguments for the decode command
#[derive(Args)]
pub struct DecodeArgs {
    /// Input .vag file (with or without header)
    pub input: PathBuf,

    /// Output WAV file (defaults to the input with a .wav extension)
    #[arg(short, long)]
    pub output: Option<PathBuf>,
}

/// Execute the decode command
pub fn execute(args: DecodeArgs) -> Result<()> {
    let data = std::fs::read(&args.input)
        .with_context(|| format!("Failed to read VAG file: {}", args.input.display()))?;
    let vag = vag_file::parse(&data)
        .with_context(|| format!("Invalid VAG file: {}", args.input.display()))?;

    let samples = sas_vag::decode_vag(vag.body)
        .with_context(|| format!("Failed to decode {}", args.input.display()))?;

    let output = args
        .output
        .unwrap_or_else(|| args.input.with_extension("wav"));
    wav::write_wav(&output, 1, vag.sample_rate, &samples)?;

    tracing::info!(
        "Decoded {} samples at {} Hz -> {}",
        samples.len(),
        vag.sample_rate,
        output.display()
    );
    Ok(())
}
