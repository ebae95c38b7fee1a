//! Render command - play one voice through the SAS engine
//!
//! Loads the source into flat guest memory, programs voice 0 through the
//! validated command surface, then mixes grains until the voice ends or the
//! time limit is hit. The result is written as a 44.1 kHz stereo WAV.

use anyhow::{Context, Result, bail};
use byteorder::{ByteOrder, LittleEndian};
use clap::Args;
use sas_core::{FlatMemory, GuestMemory, OutputMode, SAMPLE_RATE, SasConfig, SasCore};
use std::path::PathBuf;
use tracing::{debug, info, warn};

use crate::{vag_file, wav};

/// Guest address the source is loaded at
const SOURCE_ADDR: u32 = FlatMemory::DEFAULT_BASE;

/// Voice slot used for playback
const VOICE: i32 = 0;

/// Arguments for the render command
#[derive(Args)]
pub struct RenderArgs {
    /// Source file: VAG (with or without header), or raw s16le with --pcm
    pub input: PathBuf,

    /// Output WAV file (defaults to the input with a .wav extension)
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Treat the input as raw little-endian 16-bit PCM
    #[arg(long)]
    pub pcm: bool,

    /// Voice pitch, 0x1000 plays at the original rate
    #[arg(long, default_value = "0x1000", value_parser = parse_i32)]
    pub pitch: i32,

    /// First packed envelope word (attack, decay, sustain level)
    #[arg(long, default_value = "0x00FF", value_parser = parse_u32)]
    pub adsr1: u32,

    /// Second packed envelope word (sustain, release)
    #[arg(long, default_value = "0x1FCA", value_parser = parse_u32)]
    pub adsr2: u32,

    /// Dry and send volume for both channels, 0x1000 is unity
    #[arg(long, default_value = "0x1000", value_parser = parse_i32)]
    pub volume: i32,

    /// Loop the source (VAG loop markers, or the whole PCM buffer)
    #[arg(long = "loop")]
    pub looping: bool,

    /// Key off after this many grains (default: hold until the source ends)
    #[arg(long)]
    pub hold_grains: Option<u32>,

    /// Stop rendering after this many seconds
    #[arg(long, default_value_t = 10.0)]
    pub max_seconds: f32,

    /// Engine configuration TOML (grain, output mode, effect)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Write the final engine snapshot to this path
    #[arg(long)]
    pub snapshot: Option<PathBuf>,
}

/// Execute the render command
pub fn execute(args: RenderArgs) -> Result<()> {
    let config = match &args.config {
        Some(path) => SasConfig::load(path)?,
        None => SasConfig::default(),
    };
    let mut sas = SasCore::from_config(&config).context("Invalid engine configuration")?;

    let data = std::fs::read(&args.input)
        .with_context(|| format!("Failed to read source: {}", args.input.display()))?;
    let mem = load_voice(&mut sas, &data, &args)?;

    sas.set_pitch(VOICE, args.pitch)?;
    sas.set_volume(VOICE, args.volume, args.volume, args.volume, args.volume)?;
    sas.set_simple_adsr(VOICE, args.adsr1, args.adsr2)?;
    sas.set_key_on(&mem, VOICE)?;

    let grain = sas.get_grain() as usize;
    if grain == 0 {
        bail!("Grain size is zero, nothing to render");
    }
    let max_frames = (args.max_seconds.max(0.0) * SAMPLE_RATE as f32) as usize;

    let mut buffer = vec![0i16; sas.mixer().output_len()];
    let mut output = Vec::with_capacity(max_frames * 2);
    let mut grains = 0u32;

    while output.len() / 2 < max_frames {
        if args.hold_grains == Some(grains) {
            debug!("Key off after {} grains", grains);
            if let Err(e) = sas.set_key_off(VOICE) {
                warn!("Key off ignored: {}", e);
            }
        }

        sas.mix(&mem, &mut buffer);
        append_stereo(&mut output, &buffer, grain, sas.mixer().output_mode());
        grains += 1;

        if sas.get_end_flag() & (1 << VOICE) != 0 {
            debug!("Voice ended after {} grains", grains);
            break;
        }
    }

    let output_path = args
        .output
        .clone()
        .unwrap_or_else(|| args.input.with_extension("wav"));
    wav::write_wav(&output_path, 2, SAMPLE_RATE as u32, &output)?;
    info!(
        "Rendered {} grains ({} frames) -> {}",
        grains,
        output.len() / 2,
        output_path.display()
    );

    if let Some(path) = &args.snapshot {
        let state = sas.save_state().context("Failed to capture engine snapshot")?;
        std::fs::write(path, &state)
            .with_context(|| format!("Failed to write snapshot: {}", path.display()))?;
        info!("Snapshot ({} bytes) -> {}", state.len(), path.display());
    }

    Ok(())
}

/// Copy the source into guest memory and bind it to the playback voice
fn load_voice(sas: &mut SasCore, data: &[u8], args: &RenderArgs) -> Result<FlatMemory> {
    if args.pcm {
        let count = data.len() / 2;
        if count == 0 {
            bail!("PCM source is empty");
        }
        let mut samples = vec![0i16; count];
        LittleEndian::read_i16_into(&data[..count * 2], &mut samples);

        let mut mem = FlatMemory::new(SOURCE_ADDR, count * 2);
        mem.write_i16_slice(SOURCE_ADDR, &samples);
        let loop_pos = if args.looping { 0 } else { -1 };
        sas.set_voice_pcm(&mem, VOICE, SOURCE_ADDR, count as i32, loop_pos)
            .context("PCM source rejected")?;
        info!("PCM source: {} samples", count);
        return Ok(mem);
    }

    let vag = vag_file::parse(data)?;
    if vag.sample_rate != SAMPLE_RATE as u32 {
        warn!(
            "Source is {} Hz; adjust --pitch to play it at its original speed",
            vag.sample_rate
        );
    }

    let mut mem = FlatMemory::new(SOURCE_ADDR, vag.body.len());
    mem.load(SOURCE_ADDR, vag.body);
    sas.set_voice(&mem, VOICE, SOURCE_ADDR, vag.body.len() as i32, args.looping as i32)
        .context("VAG source rejected")?;
    info!(
        "VAG source{}: {} blocks",
        vag.name.map(|n| format!(" '{}'", n)).unwrap_or_default(),
        vag.body.len() / sas_vag::VAG_BLOCK_SIZE
    );
    Ok(mem)
}

/// Append one grain as interleaved stereo; raw output keeps only the dry buses
fn append_stereo(output: &mut Vec<i16>, buffer: &[i16], grain: usize, mode: OutputMode) {
    match mode {
        OutputMode::Mixed => output.extend_from_slice(&buffer[..grain * 2]),
        OutputMode::Raw => {
            let (left, right) = (&buffer[..grain], &buffer[grain..grain * 2]);
            for (&l, &r) in left.iter().zip(right) {
                output.push(l);
                output.push(r);
            }
        }
    }
}

fn parse_i32(s: &str) -> Result<i32, String> {
    let (negative, digits) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s),
    };
    let value = parse_u32(digits)? as i64;
    let value = if negative { -value } else { value };
    i32::try_from(value).map_err(|_| format!("{} is out of range", s))
}

/// Decimal or `0x`-prefixed hexadecimal
fn parse_u32(s: &str) -> Result<u32, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("invalid number '{}': {}", s, e))
}
