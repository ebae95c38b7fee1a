//! VAG container parsing
//!
//! A `.vag` file is either a bare ADPCM body or a 48-byte big-endian header
//! followed by the body:
//!
//! | Offset | Size | Field |
//! |--------|------|-------|
//! | 0x00 | 4 | magic `VAGp` |
//! | 0x04 | 4 | version |
//! | 0x0C | 4 | body size in bytes |
//! | 0x10 | 4 | sample rate |
//! | 0x20 | 16 | name, NUL padded |

use anyhow::{Result, bail};
use byteorder::{BigEndian, ByteOrder};
use sas_vag::VAG_BLOCK_SIZE;
use tracing::{debug, warn};

pub const VAG_MAGIC: &[u8; 4] = b"VAGp";
pub const VAG_HEADER_SIZE: usize = 48;

/// Rate assumed for headerless files and headers that store 0
pub const DEFAULT_SAMPLE_RATE: u32 = 44100;

/// Parsed view of a VAG file
#[derive(Debug)]
pub struct VagFile<'a> {
    pub sample_rate: u32,
    pub name: Option<String>,
    /// ADPCM blocks, trimmed to whole blocks
    pub body: &'a [u8],
}

/// Split a VAG file into header fields and block data
pub fn parse(data: &[u8]) -> Result<VagFile<'_>> {
    let (sample_rate, name, body) = if data.starts_with(VAG_MAGIC) {
        if data.len() < VAG_HEADER_SIZE {
            bail!(
                "VAG header truncated: {} bytes, expected at least {}",
                data.len(),
                VAG_HEADER_SIZE
            );
        }

        let size = BigEndian::read_u32(&data[0x0C..0x10]) as usize;
        let rate = BigEndian::read_u32(&data[0x10..0x14]);
        let name_bytes = &data[0x20..0x30];
        let name_len = name_bytes.iter().position(|&b| b == 0).unwrap_or(name_bytes.len());
        let name = String::from_utf8_lossy(&name_bytes[..name_len]).into_owned();

        let available = data.len() - VAG_HEADER_SIZE;
        let body_len = if size == 0 || size > available {
            if size > available {
                warn!("VAG header claims {} body bytes, file has {}", size, available);
            }
            available
        } else {
            size
        };

        let rate = if rate == 0 { DEFAULT_SAMPLE_RATE } else { rate };
        debug!("VAG header: '{}', {} Hz, {} body bytes", name, rate, body_len);
        (
            rate,
            (!name.is_empty()).then_some(name),
            &data[VAG_HEADER_SIZE..VAG_HEADER_SIZE + body_len],
        )
    } else {
        (DEFAULT_SAMPLE_RATE, None, data)
    };

    let whole = body.len() / VAG_BLOCK_SIZE * VAG_BLOCK_SIZE;
    if whole != body.len() {
        warn!("Ignoring {} trailing bytes after the last VAG block", body.len() - whole);
    }
    if whole == 0 {
        bail!("VAG file contains no ADPCM blocks");
    }

    Ok(VagFile {
        sample_rate,
        name,
        body: &body[..whole],
    })
}
