//! Streaming VAG decoder over guest memory
//!
//! Wraps the `sas-vag` block codec with the bookkeeping a voice needs: a
//! read pointer into guest memory, loop markers and end-of-stream detection.
//!
//! # Looping
//!
//! A block flagged 6 records the index of the block *before* it as the loop
//! start. A block flagged 3 (with looping enabled) arms a jump, taken right
//! before the next block fetch, back to the block after the recorded start.

use sas_vag::{BlockFlag, BlockHeader, VAG_BLOCK_SAMPLES, VAG_BLOCK_SIZE, VagHistory, decode_block};
use tracing::warn;

use crate::memory::GuestMemory;
use crate::state::{DoState, StateVisitor};

/// Block-by-block ADPCM decoder state for one voice
#[derive(Debug, Clone)]
pub struct VagDecoder {
    samples: [i16; VAG_BLOCK_SAMPLES],
    cur_sample: usize,

    data: u32,
    read: u32,
    cur_block: i32,
    loop_start_block: i32,
    num_blocks: i32,

    history: VagHistory,

    loop_enabled: bool,
    loop_at_next_block: bool,
    end: bool,
}

impl Default for VagDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl VagDecoder {
    /// Create a decoder with no source (reports end-of-data immediately)
    pub fn new() -> Self {
        Self {
            samples: [0; VAG_BLOCK_SAMPLES],
            cur_sample: VAG_BLOCK_SAMPLES,
            data: 0,
            read: 0,
            cur_block: -1,
            loop_start_block: -1,
            num_blocks: 0,
            history: VagHistory::default(),
            loop_enabled: false,
            loop_at_next_block: false,
            end: true,
        }
    }

    /// Restart decoding at `data` with `size` bytes of blocks
    pub fn start(&mut self, data: u32, size: u32, loop_enabled: bool) {
        self.loop_enabled = loop_enabled;
        self.loop_at_next_block = false;
        self.loop_start_block = -1;
        self.num_blocks = (size / VAG_BLOCK_SIZE as u32) as i32;
        self.end = false;
        self.data = data;
        self.read = data;
        self.cur_sample = VAG_BLOCK_SAMPLES;
        self.cur_block = -1;
        self.history = VagHistory::default();
    }

    /// Fill `out`, decoding blocks as needed; silence once the stream ends
    pub fn get_samples(&mut self, mem: &dyn GuestMemory, out: &mut [i16]) {
        if self.end {
            out.fill(0);
            return;
        }

        let source_len = (self.num_blocks as u32).wrapping_mul(VAG_BLOCK_SIZE as u32);
        if !mem.is_valid_range(self.data, source_len) {
            warn!(
                "VAG source {:08x}+{:x} is not valid memory, treating as ended",
                self.data, source_len
            );
            self.end = true;
            out.fill(0);
            return;
        }

        for i in 0..out.len() {
            if self.cur_sample == VAG_BLOCK_SAMPLES {
                if self.loop_at_next_block {
                    self.read = self
                        .data
                        .wrapping_add((VAG_BLOCK_SIZE as i32 * (self.loop_start_block + 1)) as u32);
                    self.cur_block = self.loop_start_block;
                    self.loop_at_next_block = false;
                }
                self.decode_next_block(mem);
                if self.end {
                    out[i..].fill(0);
                    return;
                }
            }
            out[i] = self.samples[self.cur_sample];
            self.cur_sample += 1;
        }
    }

    fn decode_next_block(&mut self, mem: &dyn GuestMemory) {
        if self.cur_block == self.num_blocks - 1 {
            self.end = true;
            return;
        }

        let mut block = [0u8; VAG_BLOCK_SIZE];
        if !mem.read_bytes(self.read, &mut block) {
            warn!("VAG block read at {:08x} failed", self.read);
            self.end = true;
            return;
        }

        let header = BlockHeader::parse(&block);
        match header.flag {
            BlockFlag::End => {
                self.end = true;
                return;
            }
            BlockFlag::LoopStart => self.loop_start_block = self.cur_block,
            BlockFlag::LoopEnd => {
                if self.loop_enabled {
                    self.loop_at_next_block = true;
                }
            }
            BlockFlag::None(_) => {}
        }

        decode_block(&block, &header, &mut self.history, &mut self.samples);
        self.cur_sample = 0;
        self.cur_block += 1;
        self.read = self.read.wrapping_add(VAG_BLOCK_SIZE as u32);
    }

    /// Address of the next block to fetch
    pub fn read_address(&self) -> u32 {
        self.read
    }

    /// Whether the stream has ended
    pub fn is_done(&self) -> bool {
        self.end
    }
}

impl DoState for VagDecoder {
    fn do_state(&mut self, p: &mut StateVisitor<'_>) {
        let Some(version) = p.section("VagDecoder", 1, 2) else {
            return;
        };

        if version >= 2 {
            p.visit_slice(&mut self.samples);
        } else {
            // Version 1 widened the block buffer to 32 bits
            let mut wide = self.samples.map(|s| s as i32);
            p.visit_slice(&mut wide);
            self.samples = wide.map(|s| s as i16);
        }

        let mut cur_sample = self.cur_sample as i32;
        p.visit(&mut cur_sample);
        self.cur_sample = cur_sample.clamp(0, VAG_BLOCK_SAMPLES as i32) as usize;

        p.visit(&mut self.data);
        p.visit(&mut self.read);
        p.visit(&mut self.cur_block);
        p.visit(&mut self.loop_start_block);
        p.visit(&mut self.num_blocks);
        p.visit(&mut self.history.s1);
        p.visit(&mut self.history.s2);
        p.visit(&mut self.loop_enabled);
        p.visit(&mut self.loop_at_next_block);
        p.visit(&mut self.end);
    }
}
