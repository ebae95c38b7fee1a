//! Compressed-stream voice source
//!
//! A voice can play a stream produced by an external compressed-audio
//! decoder. The decoder is reached through the narrow [`CompressedAudioSource`]
//! pull interface; [`SasAtrac3`] buffers its output so the mixer can ask for
//! exactly the number of samples a grain needs.

use std::collections::VecDeque;
use std::fmt;

use crate::state::{DoState, StateVisitor};

/// Largest chunk requested from a source in one pull
pub const PULL_CHUNK_SAMPLES: usize = 0x800;

/// Result of one [`CompressedAudioSource::pull`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PullResult {
    /// Samples written to the front of the output buffer
    pub samples: usize,
    /// The stream has no more data
    pub finished: bool,
}

/// External decoder feeding a voice
pub trait CompressedAudioSource {
    /// Decode up to `out.len()` mono samples into `out`
    fn pull(&mut self, out: &mut [i16]) -> PullResult;

    /// Append more encoded stream data
    fn add_stream_data(&mut self, data: &[u8]);
}

/// Buffered adapter between a voice and its compressed source
#[derive(Default)]
pub struct SasAtrac3 {
    context_addr: u32,
    source: Option<Box<dyn CompressedAudioSource>>,
    queue: VecDeque<i16>,
    end: bool,
    /// A source was bound when the snapshot this state came from was taken
    rebind_pending: bool,
}

impl fmt::Debug for SasAtrac3 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SasAtrac3")
            .field("context_addr", &format_args!("{:08x}", self.context_addr))
            .field("has_source", &self.source.is_some())
            .field("queued", &self.queue.len())
            .field("end", &self.end)
            .finish()
    }
}

impl SasAtrac3 {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a guest decoder context and the source that decodes it
    pub fn set_context(&mut self, context_addr: u32, source: Option<Box<dyn CompressedAudioSource>>) {
        self.context_addr = context_addr;
        self.source = source;
        self.queue.clear();
        self.end = false;
        self.rebind_pending = false;
    }

    /// Guest address of the bound decoder context
    pub fn context_addr(&self) -> u32 {
        self.context_addr
    }

    pub fn has_source(&self) -> bool {
        self.source.is_some()
    }

    /// Restored from a snapshot that had a source bound, none bound yet
    pub fn needs_rebind(&self) -> bool {
        self.rebind_pending && self.source.is_none()
    }

    /// Re-attach a source after loading, keeping the restored position flags
    pub fn rebind(&mut self, source: Box<dyn CompressedAudioSource>) {
        self.source = Some(source);
        self.rebind_pending = false;
    }

    /// Fill `out`, pulling from the source until enough samples are queued
    pub fn get_next_samples(&mut self, out: &mut [i16]) {
        let Some(source) = self.source.as_mut() else {
            self.end = true;
            out.fill(0);
            return;
        };

        let mut chunk = [0i16; PULL_CHUNK_SAMPLES];
        let mut finished = false;
        while !finished && self.queue.len() < out.len() {
            let result = source.pull(&mut chunk);
            let count = result.samples.min(PULL_CHUNK_SAMPLES);
            if count > 0 {
                self.queue.extend(&chunk[..count]);
            }
            finished = result.finished || count == 0;
        }

        let available = self.queue.len().min(out.len());
        for (slot, sample) in out.iter_mut().zip(self.queue.drain(..available)) {
            *slot = sample;
        }
        out[available..].fill(0);

        self.end = finished;
    }

    /// Forward encoded data to the source
    pub fn add_stream_data(&mut self, data: &[u8]) {
        if let Some(source) = self.source.as_mut() {
            source.add_stream_data(data);
        }
    }

    pub fn is_end(&self) -> bool {
        self.end
    }
}

impl DoState for SasAtrac3 {
    fn do_state(&mut self, p: &mut StateVisitor<'_>) {
        let Some(version) = p.section("SasAtrac3", 1, 2) else {
            return;
        };

        p.visit(&mut self.context_addr);
        let mut bound = self.source.is_some();
        p.visit(&mut bound);
        if version >= 2 {
            p.visit(&mut self.end);
        } else {
            self.end = false;
        }

        if p.is_reading() {
            // Sources are host objects; the engine re-binds them after loading
            self.source = None;
            self.queue.clear();
            self.rebind_pending = bound;
        }
    }
}
