//! VAG block decoder
//!
//! Decodes single 16-byte blocks. Loop handling is the streaming decoder's
//! job; [`decode_vag`] simply plays a stream once from start to end.

use crate::{
    BlockFlag, BlockHeader, VAG_BLOCK_SAMPLES, VAG_BLOCK_SIZE, VagError, VagHistory, clamp_i16,
};

/// Decode the 28 samples of one block
///
/// The header is parsed by the caller so it can act on the flag byte first;
/// an [`BlockFlag::End`] block must not be passed here.
///
/// # Arguments
/// * `block` - The 16-byte encoded block
/// * `header` - Parsed header of `block`
/// * `history` - IIR history (updated during decoding)
/// * `output` - Destination for the 28 decoded samples
pub fn decode_block(
    block: &[u8; VAG_BLOCK_SIZE],
    header: &BlockHeader,
    history: &mut VagHistory,
    output: &mut [i16; VAG_BLOCK_SAMPLES],
) {
    let (coef1, coef2) = header.coefficients();
    let shift = header.shift as u32;

    let mut s1 = history.s1;
    let mut s2 = history.s2;

    for (i, &d) in block[2..].iter().enumerate() {
        // Nibble into the top of an i16, then sign-preserving shift down
        let sample1 = (((d as u16 & 0x0F) << 12) as i16 as i32) >> shift;
        let sample2 = (((d as u16 & 0xF0) << 8) as i16 as i32) >> shift;

        s2 = clamp_i16(sample1 + ((s1 * coef1 + s2 * coef2) >> 6));
        s1 = clamp_i16(sample2 + ((s2 * coef1 + s1 * coef2) >> 6));

        output[i * 2] = s2 as i16;
        output[i * 2 + 1] = s1 as i16;
    }

    history.s1 = s1;
    history.s2 = s2;
}

/// Decode a whole VAG body (no file header) to PCM, ignoring loop markers
///
/// Decoding stops at an end block or after the last complete block.
///
/// # Errors
/// Returns `VagError` if the data is empty or not block aligned
pub fn decode_vag(data: &[u8]) -> Result<Vec<i16>, VagError> {
    if data.len() < VAG_BLOCK_SIZE {
        return Err(VagError::Empty);
    }
    if data.len() % VAG_BLOCK_SIZE != 0 {
        return Err(VagError::UnalignedLength(data.len()));
    }

    let num_blocks = data.len() / VAG_BLOCK_SIZE;
    let mut output = Vec::with_capacity(num_blocks * VAG_BLOCK_SAMPLES);
    let mut history = VagHistory::default();
    let mut samples = [0i16; VAG_BLOCK_SAMPLES];

    for chunk in data.chunks_exact(VAG_BLOCK_SIZE) {
        let mut block = [0u8; VAG_BLOCK_SIZE];
        block.copy_from_slice(chunk);

        let header = BlockHeader::parse(&block);
        if header.flag == BlockFlag::End {
            break;
        }

        decode_block(&block, &header, &mut history, &mut samples);
        output.extend_from_slice(&samples);
    }

    Ok(output)
}
