//! SAS-VAG: ADPCM block codec for the SAS voice engine
//!
//! **This is a pure codec** - it turns 16-byte VAG blocks into 28 PCM samples
//! and nothing else. Streaming concerns (reading from guest memory, looping,
//! end-of-stream bookkeeping) live in `sas-core`'s `VagDecoder`, and file
//! headers (`VAGp`) are handled by the caller.
//!
//! # Block Format
//!
//! ```text
//! 0x00: shift factor (low nibble) | predictor index (high nibble)
//! 0x01: flag byte (compared as a whole value)
//!         7 = end of stream, the block carries no samples
//!         6 = loop start
//!         3 = loop end
//! 0x02..0x10: 28 signed 4-bit residuals, low nibble first
//! ```
//!
//! # Prediction
//!
//! Each residual is placed in the top nibble of an `i16`, arithmetically
//! shifted right by the shift factor, and added to a second-order IIR
//! prediction from the two previous output samples:
//!
//! ```text
//! out = clamp16(raw + ((hist1 * coef1 + hist2 * coef2) >> 6))
//! ```
//!
//! # Usage
//!
//! ```
//! use sas_vag::{decode_vag, VAG_BLOCK_SAMPLES};
//!
//! // One silent block followed by an end block
//! let mut data = vec![0u8; 32];
//! data[17] = 7;
//! let pcm = decode_vag(&data).unwrap();
//! assert_eq!(pcm.len(), VAG_BLOCK_SAMPLES);
//! ```

mod decode;

pub use decode::{decode_block, decode_vag};

// =============================================================================
// Constants
// =============================================================================

/// Encoded size of one ADPCM block in bytes
pub const VAG_BLOCK_SIZE: usize = 16;

/// Decoded samples per block (14 data bytes x 2 nibbles)
pub const VAG_BLOCK_SAMPLES: usize = 28;

/// Predictor coefficient pairs, indexed by the block's predictor nibble.
///
/// The second coefficient is applied negated. Only the first five entries are
/// produced by real encoders; the rest mirror the hardware's table.
pub const VAG_PREDICTOR_TABLE: [[u8; 2]; 16] = [
    [0, 0],
    [60, 0],
    [115, 52],
    [98, 55],
    [122, 60],
    [0, 0],
    [0, 0],
    [52, 0],
    [55, 2],
    [60, 125],
    [0, 0],
    [0, 91],
    [0, 0],
    [2, 216],
    [125, 6],
    [0, 151],
];

// =============================================================================
// Block Header
// =============================================================================

/// Flag byte of a block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockFlag {
    /// Plain data block (any value not listed below)
    None(u8),
    /// Loop end marker (3)
    LoopEnd,
    /// Loop start marker (6)
    LoopStart,
    /// End of stream (7), block carries no samples
    End,
}

impl BlockFlag {
    /// Interpret a raw flag byte
    pub fn from_byte(byte: u8) -> Self {
        match byte {
            3 => BlockFlag::LoopEnd,
            6 => BlockFlag::LoopStart,
            7 => BlockFlag::End,
            other => BlockFlag::None(other),
        }
    }
}

/// Parsed first two bytes of a block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    /// Right shift applied to each residual (0..15)
    pub shift: u8,
    /// Index into [`VAG_PREDICTOR_TABLE`] (0..15)
    pub predictor: u8,
    /// Loop/end marker
    pub flag: BlockFlag,
}

impl BlockHeader {
    /// Parse the header of a 16-byte block
    pub fn parse(block: &[u8; VAG_BLOCK_SIZE]) -> Self {
        Self {
            shift: block[0] & 0x0F,
            predictor: block[0] >> 4,
            flag: BlockFlag::from_byte(block[1]),
        }
    }

    /// Prediction coefficients `(coef1, coef2)` with `coef2` already negated
    #[inline]
    pub fn coefficients(&self) -> (i32, i32) {
        let pair = VAG_PREDICTOR_TABLE[self.predictor as usize];
        (pair[0] as i32, -(pair[1] as i32))
    }
}

// =============================================================================
// Decoder History
// =============================================================================

/// Two-sample IIR history carried from block to block
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VagHistory {
    /// Most recent output sample
    pub s1: i32,
    /// Output sample before `s1`
    pub s2: i32,
}

// =============================================================================
// Error Type
// =============================================================================

/// Errors from whole-stream decoding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VagError {
    /// Input holds no complete block
    Empty,
    /// Input length is not a multiple of the block size
    UnalignedLength(usize),
}

impl core::fmt::Display for VagError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            VagError::Empty => write!(f, "VAG data contains no blocks"),
            VagError::UnalignedLength(len) => write!(
                f,
                "VAG data length {} is not a multiple of {} bytes",
                len, VAG_BLOCK_SIZE
            ),
        }
    }
}

impl std::error::Error for VagError {}

// =============================================================================
// Helper Functions
// =============================================================================

/// Clamp value to 16-bit signed range
#[inline]
pub fn clamp_i16(v: i32) -> i32 {
    v.clamp(i16::MIN as i32, i16::MAX as i32)
}

// =============================================================================
// Tests
// =============================================================================
