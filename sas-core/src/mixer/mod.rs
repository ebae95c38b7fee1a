//! SAS mixer: 32 voices mixed one grain at a time
//!
//! # Architecture
//!
//! Each [`SasMixer::mix`] call renders exactly one grain (`grain_size` stereo
//! frames):
//!
//! 1. Every playing, unpaused voice pulls the source samples the grain needs
//!    (given its pitch and fractional position) into a scratch buffer,
//!    resamples them with linear interpolation, applies its envelope and
//!    accumulates into a 32-bit dry bus and a 32-bit effect-send bus.
//! 2. Mixed mode halves the send bus in rate, runs it through the reverb and
//!    combines dry, wet and optional external input into interleaved i16.
//!    Raw mode writes the four buses as planar i16 blocks instead.
//! 3. All per-grain buffers are zeroed for the next call.
//!
//! All arithmetic is fixed point and reproduces the hardware bit for bit:
//! pitch and position use a 12-bit fraction, envelope heights are reduced to
//! 15 bits with rounding, volumes use unit 0x1000.

use std::array;

use serde::{Deserialize, Serialize};
use tracing::{error, trace, warn};

use crate::memory::GuestMemory;
use crate::reverb::{EffectType, NullReverb, ReverbProcessor, WaveformEffect};
use crate::state::{DoState, SnapshotError, StateVisitor};
use crate::voice::{SasVoice, VoiceSource, VoiceType};
use crate::{ENVELOPE_HEIGHT_MAX, MAX_GRAIN, MAX_VOICES, PITCH_BASE, PITCH_BASE_SHIFT, PITCH_MASK};


/// Scratch capacity: four samples per frame at maximum pitch, plus history
/// and interpolation slack
pub const MIX_TEMP_LEN: usize = MAX_GRAIN * 4 + 2 + 8;

/// Upper bound reported by [`SasMixer::estimate_mix_us`]
const MAX_MIX_US: usize = 1200;

trait I32Ext {
    fn clamp_to_i16(self) -> i16;
}

impl I32Ext for i32 {
    #[inline]
    fn clamp_to_i16(self) -> i16 {
        self.clamp(i16::MIN.into(), i16::MAX.into()) as i16
    }
}

// ============================================================================
// Output Mode
// ============================================================================

/// Layout of the mixer's output buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputMode {
    /// Interleaved stereo with reverb and external input applied
    #[default]
    Mixed,
    /// Planar dry left, dry right, send left, send right; no effect applied
    Raw,
}

impl OutputMode {
    pub fn code(self) -> i32 {
        match self {
            OutputMode::Mixed => 0,
            OutputMode::Raw => 1,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(OutputMode::Mixed),
            1 => Some(OutputMode::Raw),
            _ => None,
        }
    }

    /// Output samples produced per grain frame
    pub fn samples_per_frame(self) -> usize {
        match self {
            OutputMode::Mixed => 2,
            OutputMode::Raw => 4,
        }
    }
}

// ============================================================================
// Mixer
// ============================================================================

/// 32-voice mixer instance
pub struct SasMixer {
    /// Informational; mixing always runs at the caller's rate
    pub sample_rate: i32,
    max_voices: usize,
    output_mode: OutputMode,
    grain_size: usize,

    voices: [SasVoice; MAX_VOICES],

    mix_buffer: Vec<i32>,
    send_buffer: Vec<i32>,
    send_buffer_downsampled: Vec<i16>,
    send_buffer_processed: Vec<i16>,
    mix_temp: Vec<i16>,

    waveform_effect: WaveformEffect,
    reverb: Box<dyn ReverbProcessor>,
}

impl Default for SasMixer {
    fn default() -> Self {
        Self::new()
    }
}

impl SasMixer {
    /// Create a mixer with a silent reverb and no grain allocated
    pub fn new() -> Self {
        Self::with_reverb(Box::new(NullReverb))
    }

    /// Create a mixer using `reverb` for the wet path
    pub fn with_reverb(reverb: Box<dyn ReverbProcessor>) -> Self {
        Self {
            sample_rate: 44100,
            max_voices: MAX_VOICES,
            output_mode: OutputMode::Mixed,
            grain_size: 0,
            voices: array::from_fn(|_| SasVoice::new()),
            mix_buffer: Vec::new(),
            send_buffer: Vec::new(),
            send_buffer_downsampled: Vec::new(),
            send_buffer_processed: Vec::new(),
            mix_temp: vec![0; MIX_TEMP_LEN],
            waveform_effect: WaveformEffect::default(),
            reverb,
        }
    }

    // ------------------------------------------------------------------------
    // Configuration
    // ------------------------------------------------------------------------

    pub fn grain_size(&self) -> usize {
        self.grain_size
    }

    /// Resize the per-grain buffers to `grain_size` frames, zeroed
    ///
    /// Zero clears the buffers; sizes above [`MAX_GRAIN`] are clamped.
    pub fn set_grain_size(&mut self, grain_size: usize) {
        if grain_size == 0 {
            self.clear_grain_size();
            return;
        }
        let grain_size = if grain_size > MAX_GRAIN {
            warn!("Grain size {} clamped to {}", grain_size, MAX_GRAIN);
            MAX_GRAIN
        } else {
            grain_size
        };

        self.grain_size = grain_size;
        self.mix_buffer = vec![0; grain_size * 2];
        self.send_buffer = vec![0; grain_size * 2];
        self.send_buffer_downsampled = vec![0; grain_size];
        self.send_buffer_processed = vec![0; grain_size * 2];
    }

    /// Drop the per-grain buffers
    pub fn clear_grain_size(&mut self) {
        self.grain_size = 0;
        self.mix_buffer = Vec::new();
        self.send_buffer = Vec::new();
        self.send_buffer_downsampled = Vec::new();
        self.send_buffer_processed = Vec::new();
    }

    pub fn max_voices(&self) -> usize {
        self.max_voices
    }

    pub fn set_max_voices(&mut self, max_voices: usize) {
        self.max_voices = max_voices.min(MAX_VOICES);
    }

    pub fn output_mode(&self) -> OutputMode {
        self.output_mode
    }

    pub fn set_output_mode(&mut self, mode: OutputMode) {
        self.output_mode = mode;
    }

    /// Output samples one [`SasMixer::mix`] call writes
    pub fn output_len(&self) -> usize {
        self.grain_size * self.output_mode.samples_per_frame()
    }

    /// Apply the linear-sustain compatibility rewrite to every voice
    pub fn set_linear_sustain_fix(&mut self, enabled: bool) {
        for voice in &mut self.voices {
            voice.envelope.set_linear_sustain_fix(enabled);
        }
    }

    pub fn voice(&self, index: usize) -> &SasVoice {
        &self.voices[index]
    }

    pub fn voice_mut(&mut self, index: usize) -> &mut SasVoice {
        &mut self.voices[index]
    }

    pub fn voices(&self) -> &[SasVoice] {
        &self.voices
    }

    pub fn voices_mut(&mut self) -> &mut [SasVoice] {
        &mut self.voices
    }

    // ------------------------------------------------------------------------
    // Effect
    // ------------------------------------------------------------------------

    pub fn waveform_effect(&self) -> &WaveformEffect {
        &self.waveform_effect
    }

    /// Select a reverb preset, forwarding it to the processor on change
    pub fn set_waveform_effect_type(&mut self, effect_type: i32) {
        if effect_type != self.waveform_effect.effect_type {
            self.waveform_effect.effect_type = effect_type;
            self.reverb.set_preset(effect_type);
        }
    }

    pub fn set_waveform_effect_volume(&mut self, left: i32, right: i32) {
        self.waveform_effect.left_vol = left;
        self.waveform_effect.right_vol = right;
    }

    pub fn set_waveform_effect_params(&mut self, delay: i32, feedback: i32) {
        self.waveform_effect.delay = delay;
        self.waveform_effect.feedback = feedback;
    }

    pub fn set_waveform_effect_dry_wet(&mut self, dry: bool, wet: bool) {
        self.waveform_effect.is_dry_on = dry;
        self.waveform_effect.is_wet_on = wet;
    }

    // ------------------------------------------------------------------------
    // Mixing
    // ------------------------------------------------------------------------

    /// Render one grain into `output`
    ///
    /// `input` (interleaved stereo, mixed mode only) is scaled by
    /// `left_vol`/`right_vol` (unit 0x1000) and added under the voices.
    pub fn mix(
        &mut self,
        mem: &dyn GuestMemory,
        output: &mut [i16],
        input: Option<&[i16]>,
        left_vol: i32,
        right_vol: i32,
    ) {
        // A zero grain still advances voices through key-on
        let grain_size = self.grain_size;
        for voice in self.voices.iter_mut() {
            if voice.playing && !voice.paused {
                Self::mix_voice(
                    voice,
                    mem,
                    grain_size,
                    &mut self.mix_temp,
                    &mut self.mix_buffer,
                    &mut self.send_buffer,
                );
            }
        }

        match self.output_mode {
            OutputMode::Mixed => self.write_mixed_output(output, input, left_vol, right_vol),
            OutputMode::Raw => self.write_raw_output(output),
        }

        self.mix_buffer.fill(0);
        self.send_buffer.fill(0);
        self.send_buffer_downsampled.fill(0);
        self.send_buffer_processed.fill(0);
    }

    fn mix_voice(
        voice: &mut SasVoice,
        mem: &dyn GuestMemory,
        grain_size: usize,
        mix_temp: &mut [i16],
        mix_buffer: &mut [i32],
        send_buffer: &mut [i32],
    ) {
        match &voice.source {
            VoiceSource::Vag(vag) if vag.addr == 0 => return,
            VoiceSource::Pcm(pcm) if pcm.addr == 0 => return,
            _ => {}
        }
        let voice_type = voice.voice_type();

        // Key-on latency: samples consumed by the envelope before output starts
        let mut delay = 0usize;
        if voice.envelope.needs_key_on() {
            let ignore_pitch = voice_type == VoiceType::Pcm && voice.pitch > PITCH_BASE;
            delay = if ignore_pitch {
                32
            } else {
                ((32 * voice.pitch.max(0)) >> PITCH_BASE_SHIFT) as usize
            };
            if voice_type == VoiceType::Vag {
                delay += 1;
            }
        }

        mix_temp[0] = voice.resample_hist[0];
        mix_temp[1] = voice.resample_hist[1];

        let pitch = voice.pitch.max(0) as u32;
        let frames = grain_size.saturating_sub(delay) as u32;
        let mut samples_to_read =
            (voice.sample_frac.wrapping_add(pitch.wrapping_mul(frames)) >> PITCH_BASE_SHIFT) as usize;
        if samples_to_read > MIX_TEMP_LEN - 2 {
            error!(
                "Too many samples to read ({}), pitch {:04x} out of range",
                samples_to_read, voice.pitch
            );
            samples_to_read = MIX_TEMP_LEN - 2;
        }

        // On key-on the history is stale, so the fresh read starts at slot 0
        let mut read_pos = 2;
        if voice.envelope.needs_key_on() {
            read_pos = 0;
            samples_to_read += 2;
        }
        voice.read_samples(mem, &mut mix_temp[read_pos..read_pos + samples_to_read]);
        let temp_pos = read_pos + samples_to_read;

        for _ in 0..delay {
            voice.envelope.step();
        }

        let needs_interp = voice.pitch != PITCH_BASE || (voice.sample_frac & PITCH_MASK) != 0;
        for i in delay..grain_size {
            let idx = ((voice.sample_frac >> PITCH_BASE_SHIFT) as usize).min(MIX_TEMP_LEN - 2);
            let mut sample = mix_temp[idx] as i32;
            if needs_interp {
                let frac = (voice.sample_frac & PITCH_MASK) as i32;
                sample = (sample * (PITCH_MASK as i32 - frac) + mix_temp[idx + 1] as i32 * frac)
                    >> PITCH_BASE_SHIFT;
            }
            voice.sample_frac = voice.sample_frac.wrapping_add(pitch);

            let height = voice.envelope.height();
            voice.envelope.step();
            let envelope = ((height + (1 << 14)) >> 15) as i32;
            let sample = (sample * envelope + (1 << 14)) >> 15;

            mix_buffer[i * 2] += (sample * voice.volume_left) >> 12;
            mix_buffer[i * 2 + 1] += (sample * voice.volume_right) >> 12;
            send_buffer[i * 2] += (sample * voice.effect_left) >> 12;
            send_buffer[i * 2 + 1] += (sample * voice.effect_right) >> 12;
        }

        voice.resample_hist = [mix_temp[temp_pos - 2], mix_temp[temp_pos - 1]];
        voice.sample_frac = voice
            .sample_frac
            .wrapping_sub(((temp_pos - 2) as u32).wrapping_mul(PITCH_BASE as u32));

        if voice.have_samples_ended() {
            voice.envelope.end();
        }
        if voice.envelope.has_ended() {
            trace!("Voice finished ({:?})", voice_type);
            voice.playing = false;
            voice.on = false;
        }
    }

    fn write_mixed_output(
        &mut self,
        output: &mut [i16],
        input: Option<&[i16]>,
        left_vol: i32,
        right_vol: i32,
    ) {
        let grain_size = self.grain_size;
        if output.len() < grain_size * 2 {
            warn!(
                "Mix output buffer too small: {} < {}",
                output.len(),
                grain_size * 2
            );
            return;
        }
        let input = match input {
            Some(samples) if samples.len() < grain_size * 2 => {
                warn!("Mix input buffer too small: {}, ignoring input", samples.len());
                None
            }
            other => other,
        };

        let effect = self.waveform_effect;
        if effect.is_wet_on {
            // Reverb runs at half rate on every other frame of the send bus
            for i in 0..grain_size / 2 {
                self.send_buffer_downsampled[i * 2] = self.send_buffer[i * 4].clamp_to_i16();
                self.send_buffer_downsampled[i * 2 + 1] =
                    self.send_buffer[i * 4 + 1].clamp_to_i16();
            }
            self.reverb.process(
                &mut self.send_buffer_processed,
                &self.send_buffer_downsampled,
                grain_size / 2,
                effect.left_vol << 3,
                effect.right_vol << 3,
            );
        }

        for i in 0..grain_size {
            let (mut left, mut right) = match input {
                // 32-bit wraparound, as on the hardware
                Some(samples) => (
                    (samples[i * 2] as i32).wrapping_mul(left_vol) >> 12,
                    (samples[i * 2 + 1] as i32).wrapping_mul(right_vol) >> 12,
                ),
                None => (0, 0),
            };
            if effect.is_dry_on {
                left += self.mix_buffer[i * 2];
                right += self.mix_buffer[i * 2 + 1];
            }
            if effect.is_wet_on {
                left += self.send_buffer_processed[i * 2] as i32;
                right += self.send_buffer_processed[i * 2 + 1] as i32;
            }
            output[i * 2] = left.clamp_to_i16();
            output[i * 2 + 1] = right.clamp_to_i16();
        }
    }

    fn write_raw_output(&mut self, output: &mut [i16]) {
        let grain_size = self.grain_size;
        if output.len() < grain_size * 4 {
            warn!(
                "Raw output buffer too small: {} < {}",
                output.len(),
                grain_size * 4
            );
            return;
        }

        let (dry_left, rest) = output.split_at_mut(grain_size);
        let (dry_right, rest) = rest.split_at_mut(grain_size);
        let (send_left, rest) = rest.split_at_mut(grain_size);
        let send_right = &mut rest[..grain_size];

        for i in 0..grain_size {
            dry_left[i] = self.mix_buffer[i * 2].clamp_to_i16();
            dry_right[i] = self.mix_buffer[i * 2 + 1].clamp_to_i16();
            send_left[i] = self.send_buffer[i * 2].clamp_to_i16();
            send_right[i] = self.send_buffer[i * 2 + 1].clamp_to_i16();
        }
    }

    // ------------------------------------------------------------------------
    // Diagnostics
    // ------------------------------------------------------------------------

    /// Voices that will be mixed by the next grain
    pub fn active_voice_count(&self) -> usize {
        self.voices
            .iter()
            .filter(|v| v.playing && !v.paused)
            .count()
    }

    /// Approximate hardware time for one mix call, in microseconds
    pub fn estimate_mix_us(&self) -> usize {
        let cost = 20 + self.active_voice_count() * 68 + self.grain_size * 60 / 100;
        cost.min(MAX_MIX_US)
    }

    /// Human-readable summary of the mixer and its playing voices
    pub fn debug_text(&self, mem: &dyn GuestMemory) -> String {
        let effect = &self.waveform_effect;
        let effect_name = EffectType::from_code(effect.effect_type)
            .map(EffectType::name)
            .unwrap_or("?");

        let mut text = format!(
            "SR: {} Mode: {:?} Grain: {}\nEffect: {} ({}) dry: {} wet: {} vol: {:x}/{:x} delay: {} feedback: {}\n",
            self.sample_rate,
            self.output_mode,
            self.grain_size,
            effect.effect_type,
            effect_name,
            effect.is_dry_on,
            effect.is_wet_on,
            effect.left_vol,
            effect.right_vol,
            effect.delay,
            effect.feedback,
        );

        for (i, voice) in self.voices.iter().enumerate() {
            if !voice.playing {
                continue;
            }
            text.push_str(&format!(
                "{}: {:?}{} pitch {:04x} vol {:x}/{:x} send {:x}/{:x}\n",
                i,
                voice.voice_type(),
                if voice.paused { " (paused)" } else { "" },
                voice.pitch,
                voice.volume_left,
                voice.volume_right,
                voice.effect_left,
                voice.effect_right,
            ));

            if let Some((addr, size)) = voice.source_range() {
                let read = voice.read_address();
                let in_source = read >= addr && read <= addr.wrapping_add(size);
                let bad = if !in_source || !mem.is_valid_range(addr, size) {
                    " (BAD!)"
                } else {
                    ""
                };
                text.push_str(&format!(
                    "   src {:08x}+{:x} read {:08x}{}\n",
                    addr, size, read, bad
                ));
            }

            let env = &voice.envelope;
            text.push_str(&format!(
                "   env {:?} {:.1}% {} {} {} {}\n",
                env.state(),
                env.height() as f64 * 100.0 / ENVELOPE_HEIGHT_MAX as f64,
                env.attack_type.label(),
                env.decay_type.label(),
                env.sustain_type.label(),
                env.release_type.label(),
            ));
        }

        text
    }
}

impl DoState for SasMixer {
    fn do_state(&mut self, p: &mut StateVisitor<'_>) {
        if p.section("SasInstance", 1, 1).is_none() {
            return;
        }

        let mut grain_size = self.grain_size as i32;
        p.visit(&mut grain_size);
        if p.is_reading() && !p.has_failed() {
            if !(0..=MAX_GRAIN as i32).contains(&grain_size) {
                p.fail(SnapshotError::InvalidValue {
                    field: "grain size",
                    value: grain_size as i64,
                });
                return;
            }
            self.set_grain_size(grain_size as usize);
        }

        let mut max_voices = self.max_voices as i32;
        p.visit(&mut max_voices);
        p.visit(&mut self.sample_rate);

        let mut output_mode = self.output_mode.code();
        p.visit(&mut output_mode);

        if p.is_reading() && !p.has_failed() {
            self.set_max_voices(max_voices.max(0) as usize);
            match OutputMode::from_code(output_mode) {
                Some(mode) => self.output_mode = mode,
                None => {
                    p.fail(SnapshotError::InvalidValue {
                        field: "output mode",
                        value: output_mode as i64,
                    });
                    return;
                }
            }
        }

        p.visit_slice(&mut self.mix_buffer);
        p.visit_slice(&mut self.send_buffer);

        let mut voice_count = MAX_VOICES as i32;
        p.visit(&mut voice_count);
        if voice_count != MAX_VOICES as i32 {
            p.fail(SnapshotError::InvalidValue {
                field: "voice count",
                value: voice_count as i64,
            });
            return;
        }
        for voice in self.voices.iter_mut() {
            voice.do_state(p);
        }

        let effect = &mut self.waveform_effect;
        p.visit(&mut effect.effect_type);
        p.visit(&mut effect.is_dry_on);
        p.visit(&mut effect.is_wet_on);
        p.visit(&mut effect.left_vol);
        p.visit(&mut effect.right_vol);
        p.visit(&mut effect.delay);
        p.visit(&mut effect.feedback);

        if p.is_reading() && !p.has_failed() {
            self.reverb.set_preset(self.waveform_effect.effect_type);
        }
    }
}
