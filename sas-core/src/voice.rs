//! SAS voice: one of the mixer's 32 fixed slots
//!
//! A voice couples a sample source with an ADSR envelope, pitch, and four
//! volume levels (dry left/right, effect-send left/right). The source is a
//! tagged enum that holds the active kind's state inline.
//!
//! # Lifecycle
//!
//! ```text
//! idle --key_on()--> playing --envelope reaches Off--> idle
//!                       |
//!                       +--source ends--> envelope.end() --> idle
//! ```
//!
//! `paused` is orthogonal: a paused voice is skipped by the mixer without
//! touching its envelope or source position.

use tracing::{error, warn};

use crate::atrac::{CompressedAudioSource, SasAtrac3};
use crate::envelope::AdsrEnvelope;
use crate::memory::GuestMemory;
use crate::state::{DoState, StateVisitor};
use crate::vag::VagDecoder;
use crate::{PITCH_BASE, PITCH_MAX, PITCH_MIN, VOLUME_MAX};

/// Kind of sample source, with the console's numbering
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoiceType {
    Off,
    Vag,
    Noise,
    TriangleWave,
    PulseWave,
    Pcm,
    Atrac3,
}

impl VoiceType {
    pub fn code(self) -> i32 {
        match self {
            VoiceType::Off => 0,
            VoiceType::Vag => 1,
            VoiceType::Noise => 2,
            VoiceType::TriangleWave => 3,
            VoiceType::PulseWave => 4,
            VoiceType::Pcm => 5,
            VoiceType::Atrac3 => 6,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        Some(match code {
            0 => VoiceType::Off,
            1 => VoiceType::Vag,
            2 => VoiceType::Noise,
            3 => VoiceType::TriangleWave,
            4 => VoiceType::PulseWave,
            5 => VoiceType::Pcm,
            6 => VoiceType::Atrac3,
            _ => return None,
        })
    }
}

/// ADPCM blocks in guest memory
#[derive(Debug, Clone)]
pub struct VagSource {
    pub addr: u32,
    pub size: u32,
    pub decoder: VagDecoder,
}

/// Raw 16-bit little-endian samples in guest memory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PcmSource {
    pub addr: u32,
    /// Length in samples
    pub size: i32,
    /// Next sample to read
    pub index: i32,
    /// Sample to restart from when looping
    pub loop_pos: i32,
}

impl PcmSource {
    fn read(&mut self, mem: &dyn GuestMemory, on: bool, looping: bool, out: &mut [i16]) {
        let mut pos = 0;
        while pos < out.len() && self.size > 0 {
            if !on {
                self.index = 0;
                break;
            }

            let remaining = (self.size - self.index).max(0) as usize;
            let count = remaining.min(out.len() - pos);
            let addr = self.addr.wrapping_add((self.index as u32).wrapping_mul(2));
            if !mem.read_i16_slice(addr, &mut out[pos..pos + count]) {
                warn!("PCM read of {} samples at {:08x} failed", count, addr);
                out[pos..pos + count].fill(0);
            }
            self.index += count as i32;
            pos += count;

            if self.index >= self.size {
                if !looping || self.loop_pos < 0 || self.loop_pos >= self.size {
                    break;
                }
                self.index = self.loop_pos;
            }
        }
        out[pos..].fill(0);
    }
}

/// Sample source of a voice
#[derive(Debug, Default)]
pub enum VoiceSource {
    #[default]
    Off,
    Vag(VagSource),
    Noise,
    TriangleWave,
    PulseWave,
    Pcm(PcmSource),
    Atrac3(SasAtrac3),
}

/// One mixer voice
#[derive(Debug)]
pub struct SasVoice {
    pub playing: bool,
    pub paused: bool,
    /// Key state: set by key-on, cleared by key-off
    pub on: bool,

    pub source: VoiceSource,

    /// Informational, set at init
    pub sample_rate: i32,
    /// Fractional read position (12-bit fraction), kept across grains
    pub sample_frac: u32,
    /// Playback rate, 0x1000 = unity
    pub pitch: i32,
    pub looping: bool,
    pub noise_freq: i32,

    pub volume_left: i32,
    pub volume_right: i32,
    pub effect_left: i32,
    pub effect_right: i32,

    /// Last two source samples of the previous grain
    pub resample_hist: [i16; 2],

    pub envelope: AdsrEnvelope,
}

impl Default for SasVoice {
    fn default() -> Self {
        Self::new()
    }
}

impl SasVoice {
    pub fn new() -> Self {
        Self {
            playing: false,
            paused: false,
            on: false,
            source: VoiceSource::Off,
            sample_rate: 44100,
            sample_frac: 0,
            pitch: PITCH_BASE,
            looping: false,
            noise_freq: 0,
            volume_left: VOLUME_MAX,
            volume_right: VOLUME_MAX,
            effect_left: VOLUME_MAX,
            effect_right: VOLUME_MAX,
            resample_hist: [0; 2],
            envelope: AdsrEnvelope::new(),
        }
    }

    pub fn voice_type(&self) -> VoiceType {
        match self.source {
            VoiceSource::Off => VoiceType::Off,
            VoiceSource::Vag(_) => VoiceType::Vag,
            VoiceSource::Noise => VoiceType::Noise,
            VoiceSource::TriangleWave => VoiceType::TriangleWave,
            VoiceSource::PulseWave => VoiceType::PulseWave,
            VoiceSource::Pcm(_) => VoiceType::Pcm,
            VoiceSource::Atrac3(_) => VoiceType::Atrac3,
        }
    }

    /// Point the voice at ADPCM data and restart its decoder
    pub fn set_vag(&mut self, addr: u32, size: u32, looping: bool) {
        self.looping = looping;
        let mut decoder = VagDecoder::new();
        decoder.start(addr, size, looping);
        self.source = VoiceSource::Vag(VagSource {
            addr,
            size,
            decoder,
        });
    }

    /// Point the voice at raw PCM; a negative `loop_pos` disables looping
    pub fn set_pcm(&mut self, addr: u32, size: i32, loop_pos: i32) {
        self.source = VoiceSource::Pcm(PcmSource {
            addr,
            size,
            index: 0,
            loop_pos: loop_pos.max(0),
        });
        self.looping = loop_pos >= 0;
    }

    pub fn set_noise(&mut self, freq: i32) {
        self.noise_freq = freq;
        self.source = VoiceSource::Noise;
    }

    /// Attach a compressed stream
    pub fn set_atrac3(&mut self, context_addr: u32, source: Option<Box<dyn CompressedAudioSource>>) {
        let mut atrac = SasAtrac3::new();
        atrac.set_context(context_addr, source);
        self.source = VoiceSource::Atrac3(atrac);
    }

    /// Detach the source entirely and stop the voice
    pub fn clear_source(&mut self) {
        self.source = VoiceSource::Off;
        self.playing = false;
        self.on = false;
        self.paused = false;
    }

    /// Produce the next `out.len()` source samples
    pub fn read_samples(&mut self, mem: &dyn GuestMemory, out: &mut [i16]) {
        match &mut self.source {
            VoiceSource::Vag(vag) => vag.decoder.get_samples(mem, out),
            VoiceSource::Pcm(pcm) => pcm.read(mem, self.on, self.looping, out),
            VoiceSource::Atrac3(atrac) => atrac.get_next_samples(out),
            VoiceSource::Off
            | VoiceSource::Noise
            | VoiceSource::TriangleWave
            | VoiceSource::PulseWave => out.fill(0),
        }
    }

    /// Whether the source has run out of data
    pub fn have_samples_ended(&self) -> bool {
        match &self.source {
            VoiceSource::Vag(vag) => vag.decoder.is_done(),
            VoiceSource::Pcm(pcm) => pcm.index >= pcm.size,
            VoiceSource::Atrac3(atrac) => atrac.is_end(),
            _ => false,
        }
    }

    /// Start the envelope and (re)start the source
    pub fn key_on(&mut self, mem: &dyn GuestMemory) {
        self.envelope.key_on();

        if let VoiceSource::Vag(vag) = &mut self.source {
            if !mem.is_valid_address(vag.addr) {
                error!("Key-on on VAG voice with invalid address {:08x}", vag.addr);
                return;
            }
            vag.decoder.start(vag.addr, vag.size, self.looping);
        }

        self.playing = true;
        self.on = true;
        self.paused = false;
        self.sample_frac = 0;
    }

    /// Release the key; the envelope moves to its release phase
    pub fn key_off(&mut self) {
        self.on = false;
        self.envelope.key_off();
    }

    /// Resume a keyed voice after its source parameters changed
    pub fn changed_params(&mut self, changed_source: bool) {
        if !self.playing && self.on {
            self.playing = true;
            if changed_source {
                if let VoiceSource::Vag(vag) = &mut self.source {
                    vag.decoder.start(vag.addr, vag.size, self.looping);
                }
            }
        }
    }

    /// Current read pointer into guest memory
    pub fn read_address(&self) -> u32 {
        match &self.source {
            VoiceSource::Vag(vag) => vag.decoder.read_address(),
            VoiceSource::Pcm(pcm) => pcm.addr.wrapping_add((pcm.index as u32).wrapping_mul(2)),
            VoiceSource::Atrac3(atrac) => atrac.context_addr(),
            _ => 0,
        }
    }

    /// Source start address and length in bytes, if the source lives in memory
    pub fn source_range(&self) -> Option<(u32, u32)> {
        match &self.source {
            VoiceSource::Vag(vag) => Some((vag.addr, vag.size)),
            VoiceSource::Pcm(pcm) => Some((pcm.addr, (pcm.size.max(0) as u32) * 2)),
            _ => None,
        }
    }
}

impl DoState for SasVoice {
    fn do_state(&mut self, p: &mut StateVisitor<'_>) {
        let Some(version) = p.section("SasVoice", 1, 3) else {
            return;
        };

        p.visit(&mut self.playing);
        p.visit(&mut self.paused);
        p.visit(&mut self.on);

        let mut type_code = self.voice_type().code();
        p.visit(&mut type_code);

        let (mut vag_addr, mut vag_size) = match &self.source {
            VoiceSource::Vag(vag) => (vag.addr, vag.size),
            _ => (0, 0),
        };
        let mut pcm = match &self.source {
            VoiceSource::Pcm(pcm) => *pcm,
            _ => PcmSource {
                addr: 0,
                size: 0,
                index: 0,
                loop_pos: 0,
            },
        };

        p.visit(&mut vag_addr);
        p.visit(&mut vag_size);
        p.visit(&mut pcm.addr);
        p.visit(&mut pcm.size);
        p.visit(&mut pcm.index);
        if version >= 2 {
            p.visit(&mut pcm.loop_pos);
        } else {
            pcm.loop_pos = 0;
        }

        p.visit(&mut self.sample_rate);
        p.visit(&mut self.sample_frac);
        p.visit(&mut self.pitch);
        p.visit(&mut self.looping);
        if version < 2 && type_code == VoiceType::Pcm.code() {
            // PCM voices always looped before the loop position existed
            self.looping = true;
        }
        p.visit(&mut self.noise_freq);

        p.visit(&mut self.volume_left);
        p.visit(&mut self.volume_right);
        if version < 3 {
            // Superseded duplicate of the effect levels
            let mut legacy = [self.effect_left, self.effect_right];
            p.visit_slice(&mut legacy);
        }
        p.visit(&mut self.effect_left);
        p.visit(&mut self.effect_right);
        p.visit_slice(&mut self.resample_hist);
        if p.is_reading() {
            // Restored levels bypass the command checks
            self.pitch = self.pitch.clamp(PITCH_MIN, PITCH_MAX);
            for level in [
                &mut self.volume_left,
                &mut self.volume_right,
                &mut self.effect_left,
                &mut self.effect_right,
            ] {
                *level = (*level).clamp(-VOLUME_MAX, VOLUME_MAX);
            }
        }

        self.envelope.do_state(p);

        if !p.is_reading() {
            match &mut self.source {
                VoiceSource::Vag(vag) => vag.decoder.do_state(p),
                _ => VagDecoder::new().do_state(p),
            }
            match &mut self.source {
                VoiceSource::Atrac3(atrac) => atrac.do_state(p),
                _ => SasAtrac3::new().do_state(p),
            }
            return;
        }

        let mut decoder = VagDecoder::new();
        decoder.do_state(p);
        let mut atrac = SasAtrac3::new();
        atrac.do_state(p);

        self.source = match VoiceType::from_code(type_code) {
            Some(VoiceType::Off) => VoiceSource::Off,
            Some(VoiceType::Vag) => VoiceSource::Vag(VagSource {
                addr: vag_addr,
                size: vag_size,
                decoder,
            }),
            Some(VoiceType::Noise) => VoiceSource::Noise,
            Some(VoiceType::TriangleWave) => VoiceSource::TriangleWave,
            Some(VoiceType::PulseWave) => VoiceSource::PulseWave,
            Some(VoiceType::Pcm) => VoiceSource::Pcm(pcm),
            Some(VoiceType::Atrac3) => VoiceSource::Atrac3(atrac),
            None => {
                warn!("Unknown voice type {} in snapshot, loading as off", type_code);
                VoiceSource::Off
            }
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::EnvelopeState;
    use crate::memory::FlatMemory;

    const BASE: u32 = 0x0880_0000;

    fn pcm_memory(samples: &[i16]) -> FlatMemory {
        let mut mem = FlatMemory::new(BASE, 0x1000);
        assert!(mem.write_i16_slice(BASE, samples));
        mem
    }

    #[test]
    fn test_pcm_loops_to_loop_position() {
        let mem = pcm_memory(&[1, 2, 3, 4, 5]);
        let mut voice = SasVoice::new();
        voice.set_pcm(BASE, 5, 2);
        voice.key_on(&mem);

        let mut out = [0i16; 12];
        voice.read_samples(&mem, &mut out);
        assert_eq!(out, [1, 2, 3, 4, 5, 3, 4, 5, 3, 4, 5, 3]);
        assert!(!voice.have_samples_ended());
    }

    #[test]
    fn test_pcm_without_loop_ends_with_silence() {
        let mem = pcm_memory(&[1, 2, 3]);
        let mut voice = SasVoice::new();
        voice.set_pcm(BASE, 3, -1);
        assert!(!voice.looping);
        voice.key_on(&mem);

        let mut out = [9i16; 6];
        voice.read_samples(&mem, &mut out);
        assert_eq!(out, [1, 2, 3, 0, 0, 0]);
        assert!(voice.have_samples_ended());
    }

    #[test]
    fn test_pcm_silent_when_key_released() {
        let mem = pcm_memory(&[1, 2, 3, 4]);
        let mut voice = SasVoice::new();
        voice.set_pcm(BASE, 4, 0);
        voice.key_on(&mem);

        let mut out = [0i16; 2];
        voice.read_samples(&mem, &mut out);
        voice.key_off();
        voice.read_samples(&mem, &mut out);
        assert_eq!(out, [0, 0]);
        assert_eq!(voice.read_address(), BASE);
    }

    #[test]
    fn test_key_on_with_invalid_vag_address_does_not_play() {
        let mem = FlatMemory::new(BASE, 0x100);
        let mut voice = SasVoice::new();
        voice.set_vag(0x1000, 0x40, false);
        voice.key_on(&mem);
        assert!(!voice.playing);
        assert!(!voice.on);
        assert_eq!(voice.envelope.state(), EnvelopeState::KeyOn);
    }

    #[test]
    fn test_key_on_resets_position_and_flags() {
        let mem = pcm_memory(&[0; 8]);
        let mut voice = SasVoice::new();
        voice.set_pcm(BASE, 8, 0);
        voice.paused = true;
        voice.sample_frac = 0x1234;
        voice.key_on(&mem);
        assert!(voice.playing && voice.on && !voice.paused);
        assert_eq!(voice.sample_frac, 0);
        assert!(voice.envelope.needs_key_on());

        voice.key_off();
        assert!(!voice.on);
        assert_eq!(voice.envelope.state(), EnvelopeState::Release);
    }

    #[test]
    fn test_changed_params_resumes_keyed_voice() {
        let mut voice = SasVoice::new();
        voice.on = true;
        voice.changed_params(false);
        assert!(voice.playing);

        let mut idle = SasVoice::new();
        idle.changed_params(true);
        assert!(!idle.playing);
    }

    #[test]
    fn test_synthetic_sources_are_silent() {
        let mem = FlatMemory::new(BASE, 0x10);
        let mut voice = SasVoice::new();
        voice.set_noise(12);
        assert_eq!(voice.voice_type(), VoiceType::Noise);
        let mut out = [5i16; 4];
        voice.read_samples(&mem, &mut out);
        assert_eq!(out, [0; 4]);
        assert!(!voice.have_samples_ended());
    }

    #[test]
    fn test_snapshot_roundtrip_pcm_voice() {
        let mem = pcm_memory(&[10, 20, 30, 40, 50, 60]);
        let mut voice = SasVoice::new();
        voice.set_pcm(BASE, 6, 1);
        voice.pitch = 0x0800;
        voice.volume_left = 0x0400;
        voice.resample_hist = [7, -7];
        voice.key_on(&mem);
        let mut out = [0i16; 4];
        voice.read_samples(&mem, &mut out);

        let mut p = StateVisitor::writer();
        voice.do_state(&mut p);
        let bytes = p.into_bytes().unwrap();

        let mut restored = SasVoice::new();
        let mut p = StateVisitor::reader(&bytes);
        restored.do_state(&mut p);
        p.finish().unwrap();

        assert_eq!(restored.voice_type(), VoiceType::Pcm);
        assert_eq!(restored.pitch, 0x0800);
        assert_eq!(restored.volume_left, 0x0400);
        assert_eq!(restored.resample_hist, [7, -7]);

        let mut a = [0i16; 8];
        let mut b = [0i16; 8];
        voice.read_samples(&mem, &mut a);
        restored.read_samples(&mem, &mut b);
        assert_eq!(a, b);
    }

    fn nested_default_sections() -> Vec<u8> {
        let mut p = StateVisitor::writer();
        AdsrEnvelope::new().do_state(&mut p);
        VagDecoder::new().do_state(&mut p);
        SasAtrac3::new().do_state(&mut p);
        p.into_bytes().unwrap()
    }

    #[test]
    fn test_version_one_pcm_voice_forces_loop() {
        let mut bytes = vec![8u8];
        bytes.extend_from_slice(b"SasVoice");
        bytes.extend_from_slice(&1u16.to_le_bytes());
        bytes.extend_from_slice(&[1, 0, 1]); // playing, paused, on
        bytes.extend_from_slice(&5i32.to_le_bytes()); // PCM
        bytes.extend_from_slice(&0u32.to_le_bytes()); // vag addr
        bytes.extend_from_slice(&0u32.to_le_bytes()); // vag size
        bytes.extend_from_slice(&BASE.to_le_bytes()); // pcm addr
        bytes.extend_from_slice(&100i32.to_le_bytes()); // pcm size
        bytes.extend_from_slice(&40i32.to_le_bytes()); // pcm index
        bytes.extend_from_slice(&44100i32.to_le_bytes());
        bytes.extend_from_slice(&0u32.to_le_bytes()); // frac
        bytes.extend_from_slice(&0x1000i32.to_le_bytes()); // pitch
        bytes.push(0); // loop flag, overridden for PCM
        bytes.extend_from_slice(&0i32.to_le_bytes()); // noise
        for v in [0x100i32, 0x200, 0x111, 0x222, 0x300, 0x400] {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        bytes.extend_from_slice(&3i16.to_le_bytes());
        bytes.extend_from_slice(&4i16.to_le_bytes());
        bytes.extend_from_slice(&nested_default_sections());

        let mut voice = SasVoice::new();
        let mut p = StateVisitor::reader(&bytes);
        voice.do_state(&mut p);
        p.finish().unwrap();

        assert!(voice.looping);
        match &voice.source {
            VoiceSource::Pcm(pcm) => {
                assert_eq!(pcm.loop_pos, 0);
                assert_eq!(pcm.index, 40);
                assert_eq!(pcm.size, 100);
            }
            other => panic!("expected PCM source, got {:?}", other),
        }
        assert_eq!((voice.volume_left, voice.volume_right), (0x100, 0x200));
        assert_eq!((voice.effect_left, voice.effect_right), (0x300, 0x400));
        assert_eq!(voice.resample_hist, [3, 4]);
    }

    #[test]
    fn test_restored_pitch_and_levels_are_clamped() {
        let mut voice = SasVoice::new();
        voice.pitch = 0x7FFF_0000;
        voice.volume_left = i32::MAX;
        voice.volume_right = -0x8000;
        voice.effect_left = 0x1001;
        voice.effect_right = -0x1000;
        let mut p = StateVisitor::writer();
        voice.do_state(&mut p);
        let bytes = p.into_bytes().unwrap();

        let mut restored = SasVoice::new();
        let mut p = StateVisitor::reader(&bytes);
        restored.do_state(&mut p);
        p.finish().unwrap();
        assert_eq!(restored.pitch, 0x4000);
        assert_eq!((restored.volume_left, restored.volume_right), (0x1000, -0x1000));
        assert_eq!((restored.effect_left, restored.effect_right), (0x1000, -0x1000));

        voice.pitch = -5;
        let mut p = StateVisitor::writer();
        voice.do_state(&mut p);
        let bytes = p.into_bytes().unwrap();
        let mut p = StateVisitor::reader(&bytes);
        restored.do_state(&mut p);
        p.finish().unwrap();
        assert_eq!(restored.pitch, 0);
    }

    #[test]
    fn test_unknown_voice_type_loads_as_off() {
        let mut voice = SasVoice::new();
        voice.set_noise(3);
        let mut p = StateVisitor::writer();
        voice.do_state(&mut p);
        let mut bytes = p.into_bytes().unwrap();

        // Type code follows the 8-byte name, version and three flags
        let type_offset = 1 + 8 + 2 + 3;
        bytes[type_offset..type_offset + 4].copy_from_slice(&42i32.to_le_bytes());

        let mut restored = SasVoice::new();
        let mut p = StateVisitor::reader(&bytes);
        restored.do_state(&mut p);
        p.finish().unwrap();
        assert_eq!(restored.voice_type(), VoiceType::Off);
    }
}
