//! SAS voice engine
//!
//! Sample-accurate emulation of the SAS fixed-function audio mixer: 32 voices
//! of ADPCM, PCM or compressed-stream audio, each with an ADSR envelope and
//! pitch resampling, mixed one grain at a time into a stereo output with a
//! reverb send/return path.
//!
//! # Layers
//!
//! | Module | Role |
//! |--------|------|
//! | [`envelope`] | Per-sample ADSR state machine |
//! | [`vag`] | Streaming ADPCM decoder over guest memory (block codec in `sas-vag`) |
//! | [`atrac`] | Buffered adapter for an external compressed-audio decoder |
//! | [`voice`] | Source + envelope + pitch/volume for one slot |
//! | [`mixer`] | Grain mixing, reverb send, output formatting |
//! | [`api`] | Validated command surface with console status codes |
//! | [`state`] | Versioned snapshots |
//! | [`config`] | TOML configuration |
//!
//! The engine is single-threaded and synchronous: callers serialize access,
//! and external collaborators ([`GuestMemory`], [`ReverbProcessor`],
//! [`CompressedAudioSource`]) are invoked inline.
//!
//! # Usage
//!
//! ```
//! use sas_core::{FlatMemory, GuestMemory, SasCore};
//!
//! let mut mem = FlatMemory::new(0x0880_0000, 0x10000);
//! let mut sas = SasCore::new();
//! sas.init(&mem, 0x0880_0000, 256, 32, 0, 44100).unwrap();
//!
//! // One PCM voice at unity pitch
//! mem.write_i16_slice(0x0880_1000, &[1000; 512]);
//! sas.set_voice_pcm(&mem, 0, 0x0880_1000, 512, -1).unwrap();
//! sas.set_key_on(&mem, 0).unwrap();
//!
//! let mut grain = vec![0i16; 256 * 2];
//! sas.mix(&mem, &mut grain);
//! ```

pub mod api;
pub mod atrac;
pub mod config;
pub mod envelope;
pub mod error;
pub mod memory;
pub mod mixer;
pub mod reverb;
pub mod state;
pub mod vag;
pub mod voice;

pub use api::SasCore;
pub use atrac::{CompressedAudioSource, PullResult, SasAtrac3};
pub use config::{CompatConfig, ConfigError, EffectConfig, SasConfig};
pub use envelope::{AdsrEnvelope, AdsrFlags, AdsrPhase, CurveMode, EnvelopeState};
pub use error::SasError;
pub use memory::{FlatMemory, GuestMemory};
pub use mixer::{OutputMode, SasMixer};
pub use reverb::{EffectType, NullReverb, ReverbProcessor, WaveformEffect};
pub use state::{DoState, SnapshotError, StateVisitor};
pub use vag::VagDecoder;
pub use voice::{SasVoice, VoiceSource, VoiceType};

// =============================================================================
// Constants
// =============================================================================

/// Fixed number of voice slots
pub const MAX_VOICES: usize = 32;

/// Largest grain (frames per mix call)
pub const MAX_GRAIN: usize = 2048;

/// Only sample rate the hardware accepts at init
pub const SAMPLE_RATE: i32 = 44100;

/// Unity pitch
pub const PITCH_BASE: i32 = 0x1000;

/// Fractional bits of pitch and sample position
pub const PITCH_MASK: u32 = 0xFFF;

pub const PITCH_BASE_SHIFT: u32 = 12;

pub const PITCH_MIN: i32 = 0;

/// Four times unity
pub const PITCH_MAX: i32 = 0x4000;

/// Unity volume
pub const VOLUME_MAX: i32 = 0x1000;

/// Full-scale envelope height (2^30)
pub const ENVELOPE_HEIGHT_MAX: i64 = 0x4000_0000;
