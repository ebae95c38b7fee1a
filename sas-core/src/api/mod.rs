//! Validated SAS command surface
//!
//! [`SasCore`] mirrors the console library's entry points: every command
//! checks its arguments the way the hardware library does and reports
//! rejections as [`SasError`], whose [`SasError::code`] is the status word
//! guest code expects. Accepted commands are forwarded to the [`SasMixer`].
//!
//! # Guest memory
//!
//! Commands that touch guest memory take it explicitly. Reads use
//! `&dyn GuestMemory`; commands that write results back (mixed grains,
//! envelope heights, the per-voice stream context slot in the core block)
//! take `&mut dyn GuestMemory`.
//!
//! # Snapshots
//!
//! [`SasCore::save_state`] captures the whole engine. Compressed-stream
//! sources are host objects and are not serialized; after
//! [`SasCore::load_state_with`] they are re-bound by context address.

use tracing::{debug, error, info, warn};

use crate::atrac::CompressedAudioSource;
use crate::config::SasConfig;
use crate::envelope::{AdsrFlags, AdsrPhase, CurveMode};
use crate::error::SasError;
use crate::memory::GuestMemory;
use crate::mixer::{OutputMode, SasMixer};
use crate::reverb::{EffectType, ReverbProcessor};
use crate::state::{DoState, SnapshotError, StateVisitor};
use crate::voice::{SasVoice, VoiceSource, VoiceType};
use crate::{MAX_VOICES, PITCH_MAX, PITCH_MIN, SAMPLE_RATE, VOLUME_MAX};

#[cfg(test)]
mod tests;

/// Smallest grain accepted by [`SasCore::init`]
pub const MIN_INIT_GRAIN: i32 = 0x40;

/// Largest grain accepted by [`SasCore::init`]
pub const MAX_INIT_GRAIN: i32 = 0x800;

/// Bytes per voice in the guest core block
const CORE_VOICE_STRIDE: u32 = 56;

/// Offset of a voice's stream context pointer within its core block entry
const CORE_ATRAC3_CONTEXT_OFFSET: u32 = 20;

/// Longest PCM source in samples
const MAX_PCM_SIZE: i32 = 0x10000;

/// Noise frequencies are 0..NOISE_FREQ_LIMIT
const NOISE_FREQ_LIMIT: i32 = 64;

/// Reverb delay and feedback are 0..REV_PARAM_LIMIT
const REV_PARAM_LIMIT: i32 = 128;

fn check_voice(voice: i32) -> Result<usize, SasError> {
    if (0..MAX_VOICES as i32).contains(&voice) {
        Ok(voice as usize)
    } else {
        warn!("Invalid voice index {}", voice);
        Err(SasError::InvalidVoice(voice))
    }
}

/// Grain sizes the console accepts at init
pub(crate) fn check_init_grain(grain: i32) -> Result<(), SasError> {
    if !(MIN_INIT_GRAIN..=MAX_INIT_GRAIN).contains(&grain) || grain & 0x1F != 0 {
        return Err(SasError::InvalidGrain(grain));
    }
    Ok(())
}

pub(crate) fn check_effect_type(effect_type: i32) -> Result<(), SasError> {
    match EffectType::from_code(effect_type) {
        Some(_) => Ok(()),
        None => Err(SasError::RevInvalidType(effect_type)),
    }
}

pub(crate) fn check_effect_params(delay: i32, feedback: i32) -> Result<(), SasError> {
    if !(0..REV_PARAM_LIMIT).contains(&delay) {
        return Err(SasError::RevInvalidDelay(delay));
    }
    if !(0..REV_PARAM_LIMIT).contains(&feedback) {
        return Err(SasError::RevInvalidFeedback(feedback));
    }
    Ok(())
}

/// Return levels are unsigned; negative values read as huge
pub(crate) fn check_effect_volume(left: u32, right: u32) -> Result<(), SasError> {
    if left > VOLUME_MAX as u32 || right > VOLUME_MAX as u32 {
        return Err(SasError::RevInvalidVolume);
    }
    Ok(())
}

// ============================================================================
// SasCore
// ============================================================================

/// SAS engine driven through the console's command set
pub struct SasCore {
    mixer: SasMixer,
    /// Guest address of the core block passed to [`SasCore::init`]
    core_addr: u32,
    /// One grain of output, reused between mixes
    scratch: Vec<i16>,
}

impl Default for SasCore {
    fn default() -> Self {
        Self::new()
    }
}

impl SasCore {
    /// Create an uninitialized engine with a silent reverb
    pub fn new() -> Self {
        Self::from_mixer(SasMixer::new())
    }

    /// Create an uninitialized engine using `reverb` for the wet path
    pub fn with_reverb(reverb: Box<dyn ReverbProcessor>) -> Self {
        Self::from_mixer(SasMixer::with_reverb(reverb))
    }

    fn from_mixer(mixer: SasMixer) -> Self {
        Self {
            mixer,
            core_addr: 0,
            scratch: Vec::new(),
        }
    }

    /// Build an engine ready to mix from a validated configuration
    pub fn from_config(config: &SasConfig) -> Result<Self, SasError> {
        let mut sas = Self::new();
        sas.apply_config(config)?;
        Ok(sas)
    }

    /// Apply `config` to this engine, keeping voice state
    pub fn apply_config(&mut self, config: &SasConfig) -> Result<(), SasError> {
        config.validate()?;

        let mixer = &mut self.mixer;
        mixer.set_grain_size(config.grain_size as usize);
        mixer.set_max_voices(config.max_voices as usize);
        mixer.set_output_mode(config.output_mode);
        mixer.sample_rate = config.sample_rate;
        mixer.set_linear_sustain_fix(config.compat.linear_sustain_increase_as_decrease);
        for voice in mixer.voices_mut() {
            voice.sample_rate = config.sample_rate;
        }

        let effect = &config.effect;
        mixer.set_waveform_effect_type(effect.effect_type);
        mixer.set_waveform_effect_dry_wet(effect.dry, effect.wet);
        mixer.set_waveform_effect_volume(effect.left_volume as i32, effect.right_volume as i32);
        mixer.set_waveform_effect_params(effect.delay, effect.feedback);

        info!(
            "SAS configured: grain {}, {:?} output, effect {}",
            config.grain_size, config.output_mode, effect.effect_type
        );
        Ok(())
    }

    pub fn mixer(&self) -> &SasMixer {
        &self.mixer
    }

    pub fn mixer_mut(&mut self) -> &mut SasMixer {
        &mut self.mixer
    }

    pub fn voice(&self, voice: usize) -> &SasVoice {
        self.mixer.voice(voice)
    }

    /// Guest address of the core block, 0 before init
    pub fn core_addr(&self) -> u32 {
        self.core_addr
    }

    // ------------------------------------------------------------------------
    // Instance
    // ------------------------------------------------------------------------

    /// Initialize the engine against a guest core block
    pub fn init(
        &mut self,
        mem: &dyn GuestMemory,
        core_addr: u32,
        grain: i32,
        max_voices: i32,
        output_mode: i32,
        sample_rate: i32,
    ) -> Result<(), SasError> {
        if !mem.is_valid_address(core_addr) || core_addr & 0x3F != 0 {
            error!("SAS init: bad core address {:08x}", core_addr);
            return Err(SasError::BadAddress(core_addr));
        }
        if !(1..=MAX_VOICES as i32).contains(&max_voices) {
            error!("SAS init: bad max voices {}", max_voices);
            return Err(SasError::InvalidMaxVoices(max_voices));
        }
        if let Err(e) = check_init_grain(grain) {
            error!("SAS init: bad grain size {}", grain);
            return Err(e);
        }
        let Some(mode) = OutputMode::from_code(output_mode) else {
            error!("SAS init: bad output mode {}", output_mode);
            return Err(SasError::InvalidOutputMode(output_mode));
        };
        if sample_rate != SAMPLE_RATE {
            error!("SAS init: bad sample rate {}", sample_rate);
            return Err(SasError::InvalidSampleRate(sample_rate));
        }

        info!(
            "SAS init: core {:08x}, grain {}, {} voices, mode {}, {} Hz",
            core_addr, grain, max_voices, output_mode, sample_rate
        );

        self.core_addr = core_addr;
        self.mixer.set_grain_size(grain as usize);
        // The hardware ignores the requested count
        self.mixer.set_max_voices(MAX_VOICES);
        self.mixer.set_output_mode(mode);
        self.mixer.sample_rate = sample_rate;
        for voice in self.mixer.voices_mut() {
            voice.sample_rate = sample_rate;
            voice.playing = false;
            voice.looping = false;
        }
        Ok(())
    }

    /// Mix one grain and write it to `out_addr`
    ///
    /// Returns the estimated hardware mix time in microseconds.
    pub fn core(&mut self, mem: &mut dyn GuestMemory, out_addr: u32) -> Result<u32, SasError> {
        if !mem.is_valid_address(out_addr) {
            error!("SAS core: invalid output address {:08x}", out_addr);
            return Err(SasError::InvalidParameter);
        }

        self.render(&*mem, None, 0, 0);
        if !mem.write_i16_slice(out_addr, &self.scratch) {
            warn!(
                "SAS core: output {:08x}+{:x} not writable",
                out_addr,
                self.scratch.len() * 2
            );
        }
        Ok(self.mixer.estimate_mix_us() as u32)
    }

    /// Mix one grain over the samples already at `inout_addr`
    ///
    /// The buffer is read as input (scaled by `left_vol`/`right_vol`) and
    /// overwritten with the result.
    pub fn core_with_mix(
        &mut self,
        mem: &mut dyn GuestMemory,
        inout_addr: u32,
        left_vol: i32,
        right_vol: i32,
    ) -> Result<u32, SasError> {
        if !mem.is_valid_address(inout_addr) {
            error!("SAS core with mix: invalid address {:08x}", inout_addr);
            return Err(SasError::InvalidParameter);
        }
        if self.mixer.output_mode() == OutputMode::Raw {
            error!("SAS core with mix: unsupported in raw output mode");
            return Err(SasError::UnsupportedOutputMode);
        }

        let mut input = vec![0i16; self.mixer.grain_size() * 2];
        let input = if mem.read_i16_slice(inout_addr, &mut input) {
            Some(input)
        } else {
            warn!("SAS core with mix: input {:08x} not readable", inout_addr);
            None
        };

        self.render(&*mem, input.as_deref(), left_vol, right_vol);
        if !mem.write_i16_slice(inout_addr, &self.scratch) {
            warn!("SAS core with mix: output {:08x} not writable", inout_addr);
        }
        Ok(self.mixer.estimate_mix_us() as u32)
    }

    /// Mix one grain straight into a host buffer
    pub fn mix(&mut self, mem: &dyn GuestMemory, output: &mut [i16]) {
        self.mixer.mix(mem, output, None, 0, 0);
    }

    fn render(&mut self, mem: &dyn GuestMemory, input: Option<&[i16]>, left_vol: i32, right_vol: i32) {
        self.scratch.clear();
        self.scratch.resize(self.mixer.output_len(), 0);
        self.mixer.mix(mem, &mut self.scratch, input, left_vol, right_vol);
    }

    /// Bit `i` set when voice `i` is not playing
    pub fn get_end_flag(&self) -> u32 {
        self.mixer
            .voices()
            .iter()
            .take(self.mixer.max_voices())
            .enumerate()
            .filter(|(_, v)| !v.playing)
            .fold(0, |flags, (i, _)| flags | (1 << i))
    }

    pub fn get_grain(&self) -> i32 {
        self.mixer.grain_size() as i32
    }

    /// Resize the grain without the init-time checks
    pub fn set_grain(&mut self, grain: i32) {
        info!("SAS set grain {}", grain);
        if grain < 0 {
            warn!("Negative grain size {}, clearing", grain);
            self.mixer.clear_grain_size();
            return;
        }
        self.mixer.set_grain_size(grain as usize);
    }

    pub fn get_output_mode(&self) -> i32 {
        self.mixer.output_mode().code()
    }

    pub fn set_output_mode(&mut self, output_mode: i32) -> Result<(), SasError> {
        let Some(mode) = OutputMode::from_code(output_mode) else {
            error!("SAS set output mode: bad mode {}", output_mode);
            return Err(SasError::InvalidOutputMode(output_mode));
        };
        debug!("SAS set output mode {:?}", mode);
        self.mixer.set_output_mode(mode);
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Voice sources
    // ------------------------------------------------------------------------

    /// Point a voice at VAG data
    ///
    /// An invalid address is ignored (the voice is left unchanged) rather than
    /// rejected. A negative size passes the alignment check when it is a
    /// multiple of 16 and is then played as an empty source.
    pub fn set_voice(
        &mut self,
        mem: &dyn GuestMemory,
        voice: i32,
        vag_addr: u32,
        size: i32,
        looping: i32,
    ) -> Result<(), SasError> {
        let index = check_voice(voice)?;
        if size == 0 || (size as u32) & 0xF != 0 {
            if size == 0 {
                debug!("SAS set voice {}: zero size", voice);
            } else {
                warn!("SAS set voice {}: invalid size {}", voice, size);
            }
            return Err(SasError::InvalidParameter);
        }
        if looping != 0 && looping != 1 {
            warn!("SAS set voice {}: invalid loop mode {}", voice, looping);
            return Err(SasError::InvalidLoopPos(looping));
        }
        if !mem.is_valid_address(vag_addr) {
            error!("SAS set voice {}: ignoring invalid VAG address {:08x}", voice, vag_addr);
            return Ok(());
        }

        let v = self.mixer.voice_mut(index);
        if v.voice_type() == VoiceType::Atrac3 {
            error!("SAS set voice {}: voice already has a compressed stream", voice);
            return Err(SasError::Atrac3AlreadySet(voice));
        }

        let size = if size < 0 {
            debug!("SAS set voice {}: negative size {} played as empty", voice, size);
            0
        } else {
            size
        };
        debug!("SAS set voice {}: VAG {:08x}+{:x} loop {}", voice, vag_addr, size, looping);

        v.set_vag(vag_addr, size as u32, looping != 0);
        if v.on {
            v.playing = true;
        }
        Ok(())
    }

    /// Point a voice at 16-bit PCM; a negative `loop_pos` plays it once
    pub fn set_voice_pcm(
        &mut self,
        mem: &dyn GuestMemory,
        voice: i32,
        pcm_addr: u32,
        size: i32,
        loop_pos: i32,
    ) -> Result<(), SasError> {
        let index = check_voice(voice)?;
        if size <= 0 || size > MAX_PCM_SIZE {
            warn!("SAS set voice PCM {}: invalid size {}", voice, size);
            return Err(SasError::InvalidPcmSize(size));
        }
        if loop_pos >= size {
            error!(
                "SAS set voice PCM {}: loop position {} past size {}",
                voice, loop_pos, size
            );
            return Err(SasError::InvalidLoopPos(loop_pos));
        }
        if !mem.is_valid_address(pcm_addr) {
            error!("SAS set voice PCM {}: ignoring invalid address {:08x}", voice, pcm_addr);
            return Ok(());
        }

        let v = self.mixer.voice_mut(index);
        if v.voice_type() == VoiceType::Atrac3 {
            error!("SAS set voice PCM {}: voice already has a compressed stream", voice);
            return Err(SasError::Atrac3AlreadySet(voice));
        }

        debug!(
            "SAS set voice PCM {}: {:08x} {} samples, loop {}",
            voice, pcm_addr, size, loop_pos
        );
        v.set_pcm(pcm_addr, size, loop_pos);
        v.playing = true;
        Ok(())
    }

    pub fn set_noise(&mut self, voice: i32, freq: i32) -> Result<(), SasError> {
        let index = check_voice(voice)?;
        if !(0..NOISE_FREQ_LIMIT).contains(&freq) {
            debug!("SAS set noise {}: invalid frequency {}", voice, freq);
            return Err(SasError::InvalidNoiseFreq(freq));
        }
        debug!("SAS set noise {}: frequency {}", voice, freq);
        self.mixer.voice_mut(index).set_noise(freq);
        Ok(())
    }

    /// Accepted for compatibility; the waveform is not generated
    pub fn set_triangular_wave(&mut self, voice: i32, unknown: i32) -> Result<(), SasError> {
        error!("SAS set triangular wave ({}, {}) is not implemented", voice, unknown);
        Ok(())
    }

    /// Accepted for compatibility; the waveform is not generated
    pub fn set_steep_wave(&mut self, voice: i32, unknown: i32) -> Result<(), SasError> {
        error!("SAS set steep wave ({}, {}) is not implemented", voice, unknown);
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Voice parameters
    // ------------------------------------------------------------------------

    pub fn set_volume(
        &mut self,
        voice: i32,
        left: i32,
        right: i32,
        effect_left: i32,
        effect_right: i32,
    ) -> Result<(), SasError> {
        let index = check_voice(voice)?;
        debug!(
            "SAS set volume {}: {} {} {} {}",
            voice, left, right, effect_left, effect_right
        );
        if [left, right, effect_left, effect_right]
            .iter()
            .any(|v| v.unsigned_abs() > VOLUME_MAX as u32)
        {
            return Err(SasError::InvalidVolume);
        }

        let v = self.mixer.voice_mut(index);
        v.volume_left = left;
        v.volume_right = right;
        v.effect_left = effect_left;
        v.effect_right = effect_right;
        Ok(())
    }

    pub fn set_pitch(&mut self, voice: i32, pitch: i32) -> Result<(), SasError> {
        let index = check_voice(voice)?;
        if !(PITCH_MIN..=PITCH_MAX).contains(&pitch) {
            warn!("SAS set pitch {}: bad pitch {:#x}", voice, pitch);
            return Err(SasError::InvalidPitch(pitch));
        }
        debug!("SAS set pitch {}: {:#x}", voice, pitch);
        self.mixer.voice_mut(index).pitch = pitch;
        Ok(())
    }

    pub fn set_key_on(&mut self, mem: &dyn GuestMemory, voice: i32) -> Result<(), SasError> {
        let index = check_voice(voice)?;
        let v = self.mixer.voice_mut(index);
        if v.paused || v.on {
            return Err(SasError::VoicePaused(voice));
        }
        debug!("SAS key on {}", voice);
        v.key_on(mem);
        Ok(())
    }

    /// Release a voice; may also start one that only sounds in its release
    pub fn set_key_off(&mut self, voice: i32) -> Result<(), SasError> {
        let index = check_voice(voice)?;
        let v = self.mixer.voice_mut(index);
        if v.paused || !v.on {
            return Err(SasError::VoicePaused(voice));
        }
        debug!("SAS key off {}", voice);
        v.key_off();
        Ok(())
    }

    /// Pause or resume every voice whose bit is set in `voice_mask`
    pub fn set_pause(&mut self, voice_mask: u32, pause: bool) {
        debug!("SAS set pause {:08x} {}", voice_mask, pause);
        for (i, voice) in self.mixer.voices_mut().iter_mut().enumerate() {
            if voice_mask & (1 << i) != 0 {
                voice.paused = pause;
            }
        }
    }

    /// Bit `i` set when voice `i` is paused
    pub fn get_pause_flag(&self) -> u32 {
        self.mixer
            .voices()
            .iter()
            .take(self.mixer.max_voices())
            .enumerate()
            .filter(|(_, v)| v.paused)
            .fold(0, |flags, (i, _)| flags | (1 << i))
    }

    // ------------------------------------------------------------------------
    // Envelope
    // ------------------------------------------------------------------------

    /// Set rates for the phases selected in `flag`
    pub fn set_adsr(
        &mut self,
        voice: i32,
        flag: i32,
        attack: i32,
        decay: i32,
        sustain: i32,
        release: i32,
    ) -> Result<(), SasError> {
        let index = check_voice(voice)?;
        let flags = AdsrFlags::from_bits_truncate(flag as u32);

        let mut invalid = AdsrFlags::empty();
        invalid.set(AdsrFlags::ATTACK, attack < 0);
        invalid.set(AdsrFlags::DECAY, decay < 0);
        invalid.set(AdsrFlags::SUSTAIN, sustain < 0);
        invalid.set(AdsrFlags::RELEASE, release < 0);
        if invalid.intersects(flags) {
            warn!(
                "SAS set ADSR {}: negative rate ({:?}) {:08x} {:08x} {:08x} {:08x}",
                voice, flags, attack, decay, sustain, release
            );
            return Err(SasError::InvalidAdsrRate);
        }

        debug!(
            "SAS set ADSR {}: {:?} {:08x} {:08x} {:08x} {:08x}",
            voice, flags, attack, decay, sustain, release
        );
        self.mixer
            .voice_mut(index)
            .envelope
            .set_rate(flags, attack, decay, sustain, release);
        Ok(())
    }

    /// Set curve modes for the phases selected in `flag`
    ///
    /// The top bit of each mode is ignored. Modes for unselected phases are
    /// not checked.
    pub fn set_adsr_mode(
        &mut self,
        voice: i32,
        flag: i32,
        attack: i32,
        decay: i32,
        sustain: i32,
        release: i32,
    ) -> Result<(), SasError> {
        let index = check_voice(voice)?;
        let flags = AdsrFlags::from_bits_truncate(flag as u32);
        let codes = [attack, decay, sustain, release].map(|m| m & 0x7FFF_FFFF);

        let phases = [
            (AdsrFlags::ATTACK, AdsrPhase::Attack),
            (AdsrFlags::DECAY, AdsrPhase::Decay),
            (AdsrFlags::SUSTAIN, AdsrPhase::Sustain),
            (AdsrFlags::RELEASE, AdsrPhase::Release),
        ];
        let mut invalid = AdsrFlags::empty();
        for (&code, (bit, phase)) in codes.iter().zip(phases) {
            let valid = CurveMode::from_code(code).is_some_and(|mode| mode.is_valid_for(phase));
            invalid.set(bit, !valid);
        }

        if invalid.intersects(flags) {
            if codes == [5; 4] {
                // Issued by some titles during init; the hardware rejects it too
                debug!("SAS set ADSR mode {}: all direct, rejected", voice);
            } else {
                warn!(
                    "SAS set ADSR mode {}: invalid modes ({:?}) {} {} {} {}",
                    voice, flags, codes[0], codes[1], codes[2], codes[3]
                );
            }
            return Err(SasError::InvalidAdsrCurveMode);
        }

        debug!(
            "SAS set ADSR mode {}: {:?} {} {} {} {}",
            voice, flags, codes[0], codes[1], codes[2], codes[3]
        );
        let envelope = &mut self.mixer.voice_mut(index).envelope;
        let attack = CurveMode::from_code(codes[0]).unwrap_or(envelope.attack_type);
        let decay = CurveMode::from_code(codes[1]).unwrap_or(envelope.decay_type);
        let sustain = CurveMode::from_code(codes[2]).unwrap_or(envelope.sustain_type);
        let release = CurveMode::from_code(codes[3]).unwrap_or(envelope.release_type);
        envelope.set_envelope(flags, attack, decay, sustain, release);
        Ok(())
    }

    pub fn set_sustain_level(&mut self, voice: i32, level: i32) -> Result<(), SasError> {
        let index = check_voice(voice)?;
        debug!("SAS set sustain level {}: {:08x}", voice, level);
        self.mixer.voice_mut(index).envelope.set_sustain_level(level);
        Ok(())
    }

    /// Configure the whole envelope from the packed hardware words
    pub fn set_simple_adsr(&mut self, voice: i32, env1: u32, env2: u32) -> Result<(), SasError> {
        let index = check_voice(voice)?;
        if (env2 >> 13) & 1 != 0 {
            warn!("SAS set simple ADSR {}: invalid env2 {:04x}", voice, env2);
            return Err(SasError::InvalidAdsrCurveMode);
        }
        debug!("SAS set simple ADSR {}: {:04x} {:04x}", voice, env1, env2);
        self.mixer
            .voice_mut(index)
            .envelope
            .set_simple_envelope(env1 & 0xFFFF, env2 & 0xFFFF);
        Ok(())
    }

    pub fn get_envelope_height(&self, voice: i32) -> Result<u32, SasError> {
        let index = check_voice(voice)?;
        Ok(self.mixer.voice(index).envelope.height() as u32)
    }

    /// Write all 32 envelope heights to `heights_addr` as u32
    pub fn get_all_envelope_heights(
        &self,
        mem: &mut dyn GuestMemory,
        heights_addr: u32,
    ) -> Result<(), SasError> {
        if !mem.is_valid_address(heights_addr) {
            return Err(SasError::InvalidParameter);
        }
        for (i, voice) in self.mixer.voices().iter().enumerate() {
            let addr = heights_addr.wrapping_add(i as u32 * 4);
            if !mem.write_u32(addr, voice.envelope.height() as u32) {
                warn!("SAS envelope heights: {:08x} not writable", addr);
                break;
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Effect
    // ------------------------------------------------------------------------

    pub fn rev_type(&mut self, effect_type: i32) -> Result<(), SasError> {
        if let Err(e) = check_effect_type(effect_type) {
            error!("SAS reverb type: invalid type {}", effect_type);
            return Err(e);
        }
        debug!("SAS reverb type {}", effect_type);
        self.mixer.set_waveform_effect_type(effect_type);
        Ok(())
    }

    pub fn rev_param(&mut self, delay: i32, feedback: i32) -> Result<(), SasError> {
        if let Err(e) = check_effect_params(delay, feedback) {
            error!("SAS reverb params: {}", e);
            return Err(e);
        }
        debug!("SAS reverb params: delay {} feedback {}", delay, feedback);
        self.mixer.set_waveform_effect_params(delay, feedback);
        Ok(())
    }

    pub fn rev_evol(&mut self, left: u32, right: u32) -> Result<(), SasError> {
        if let Err(e) = check_effect_volume(left, right) {
            debug!("SAS reverb volume: invalid {:x}/{:x}", left, right);
            return Err(e);
        }
        debug!("SAS reverb volume {:x}/{:x}", left, right);
        self.mixer.set_waveform_effect_volume(left as i32, right as i32);
        Ok(())
    }

    /// Enable the dry and wet paths; any non-zero value turns a path on
    pub fn rev_von(&mut self, dry: i32, wet: i32) {
        debug!("SAS reverb on: dry {} wet {}", dry, wet);
        self.mixer.set_waveform_effect_dry_wet(dry != 0, wet != 0);
    }

    // ------------------------------------------------------------------------
    // Compressed streams
    // ------------------------------------------------------------------------

    /// Attach a compressed stream to a voice and start it
    ///
    /// The context address is also recorded in the guest core block.
    pub fn set_voice_atrac3(
        &mut self,
        mem: &mut dyn GuestMemory,
        voice: i32,
        context_addr: u32,
        source: Option<Box<dyn CompressedAudioSource>>,
    ) -> Result<(), SasError> {
        let index = check_voice(voice)?;
        let v = self.mixer.voice_mut(index);
        if v.voice_type() == VoiceType::Atrac3 {
            error!("SAS set voice ATRAC3 {}: already set", voice);
            return Err(SasError::Atrac3AlreadySet(voice));
        }
        if source.is_none() {
            warn!(
                "SAS set voice ATRAC3 {}: no decoder for context {:08x}, voice will be silent",
                voice, context_addr
            );
        }

        v.set_atrac3(context_addr, source);
        v.looping = false;
        v.playing = true;
        self.write_context_slot(mem, index, context_addr);
        debug!("SAS set voice ATRAC3 {}: context {:08x}", voice, context_addr);
        Ok(())
    }

    /// Feed more encoded stream data from guest memory to a voice's decoder
    pub fn concatenate_atrac3(
        &mut self,
        mem: &dyn GuestMemory,
        voice: i32,
        data_addr: u32,
        len: i32,
    ) -> Result<(), SasError> {
        let index = check_voice(voice)?;
        debug!("SAS concatenate ATRAC3 {}: {:08x}+{:x}", voice, data_addr, len);
        if !mem.is_valid_address(data_addr) {
            return Ok(());
        }

        let mut data = vec![0u8; len.max(0) as usize];
        if !mem.read_bytes(data_addr, &mut data) {
            warn!("SAS concatenate ATRAC3 {}: {:08x}+{:x} not readable", voice, data_addr, len);
            return Ok(());
        }
        if let VoiceSource::Atrac3(atrac) = &mut self.mixer.voice_mut(index).source {
            atrac.add_stream_data(&data);
        }
        Ok(())
    }

    /// Detach a voice's compressed stream; this also unpauses it
    pub fn unset_atrac3(&mut self, mem: &mut dyn GuestMemory, voice: i32) -> Result<(), SasError> {
        let index = check_voice(voice)?;
        let v = self.mixer.voice_mut(index);
        if v.voice_type() != VoiceType::Atrac3 {
            error!("SAS unset ATRAC3 {}: voice has no compressed stream", voice);
            return Err(SasError::Atrac3NotSet(voice));
        }
        v.clear_source();
        self.write_context_slot(mem, index, 0);
        debug!("SAS unset ATRAC3 {}", voice);
        Ok(())
    }

    fn write_context_slot(&self, mem: &mut dyn GuestMemory, voice: usize, value: u32) {
        let addr = self
            .core_addr
            .wrapping_add(CORE_VOICE_STRIDE * voice as u32 + CORE_ATRAC3_CONTEXT_OFFSET);
        if !mem.write_u32(addr, value) {
            warn!("SAS core block slot {:08x} not writable", addr);
        }
    }

    // ------------------------------------------------------------------------
    // Snapshots and diagnostics
    // ------------------------------------------------------------------------

    /// Serialize the whole engine
    pub fn save_state(&mut self) -> Result<Vec<u8>, SnapshotError> {
        let mut p = StateVisitor::writer();
        self.do_state(&mut p);
        p.into_bytes()
    }

    /// Restore the engine from `data`
    ///
    /// Compressed-stream voices come back without a decoder and play silence;
    /// use [`SasCore::load_state_with`] to re-bind them. On error the engine
    /// is partially loaded and should be discarded.
    pub fn load_state(&mut self, data: &[u8]) -> Result<(), SnapshotError> {
        self.load_state_with(data, |_| None)
    }

    /// Restore the engine, asking `resolver` for the decoder of every
    /// compressed-stream voice by its context address
    pub fn load_state_with<F>(&mut self, data: &[u8], mut resolver: F) -> Result<(), SnapshotError>
    where
        F: FnMut(u32) -> Option<Box<dyn CompressedAudioSource>>,
    {
        let mut p = StateVisitor::reader(data);
        self.do_state(&mut p);
        p.finish()?;

        for (i, voice) in self.mixer.voices_mut().iter_mut().enumerate() {
            let VoiceSource::Atrac3(atrac) = &mut voice.source else {
                continue;
            };
            if !atrac.needs_rebind() {
                continue;
            }
            match resolver(atrac.context_addr()) {
                Some(source) => atrac.rebind(source),
                None => warn!(
                    "No decoder for voice {} context {:08x} after load",
                    i,
                    atrac.context_addr()
                ),
            }
        }
        Ok(())
    }

    pub fn debug_text(&self, mem: &dyn GuestMemory) -> String {
        self.mixer.debug_text(mem)
    }
}

impl DoState for SasCore {
    fn do_state(&mut self, p: &mut StateVisitor<'_>) {
        if p.section("SasCore", 1, 1).is_none() {
            return;
        }
        p.visit(&mut self.core_addr);
        self.mixer.do_state(p);
    }
}
