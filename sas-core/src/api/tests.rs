use std::cell::RefCell;
use std::rc::Rc;

use super::*;
use crate::atrac::PullResult;
use crate::envelope::EnvelopeState;
use crate::memory::FlatMemory;

const BASE: u32 = 0x0880_0000;
const CORE: u32 = BASE;
const OUT: u32 = BASE + 0x1000;
const PCM: u32 = BASE + 0x4000;
const VAG: u32 = BASE + 0x8000;
const GRAIN: i32 = 64;

fn memory() -> FlatMemory {
    FlatMemory::new(BASE, 0x20000)
}

fn initialized(mem: &FlatMemory) -> SasCore {
    let mut sas = SasCore::new();
    sas.init(mem, CORE, GRAIN, 32, 0, 44100).unwrap();
    sas
}

/// Full-height envelope from the first attack sample on
fn hold_envelope(sas: &mut SasCore, voice: i32) {
    sas.set_adsr_mode(voice, 0xF, 0, 5, 0, 1).unwrap();
    sas.set_adsr(voice, 0xF, 0x7FFF_FFFF, 0x4000_0000, 0, 0x1000)
        .unwrap();
    sas.set_sustain_level(voice, 0x7FFF_FFFF).unwrap();
}

fn read_samples(mem: &FlatMemory, addr: u32, len: usize) -> Vec<i16> {
    let mut out = vec![0i16; len];
    assert!(mem.read_i16_slice(addr, &mut out));
    out
}

// ============================================================================
// Init
// ============================================================================

#[test]
fn test_init_validation_codes() {
    let mem = memory();
    let mut sas = SasCore::new();

    let err = sas.init(&mem, CORE + 0x20, 256, 32, 0, 44100).unwrap_err();
    assert_eq!(err.code(), 0x8042_0005);
    let err = sas.init(&mem, 0x100, 256, 32, 0, 44100).unwrap_err();
    assert_eq!(err, SasError::BadAddress(0x100));

    assert_eq!(
        sas.init(&mem, CORE, 256, 0, 0, 44100),
        Err(SasError::InvalidMaxVoices(0))
    );
    assert_eq!(
        sas.init(&mem, CORE, 256, 33, 0, 44100),
        Err(SasError::InvalidMaxVoices(33))
    );
    assert_eq!(
        sas.init(&mem, CORE, 0x20, 32, 0, 44100),
        Err(SasError::InvalidGrain(0x20))
    );
    assert_eq!(
        sas.init(&mem, CORE, 0x820, 32, 0, 44100),
        Err(SasError::InvalidGrain(0x820))
    );
    assert_eq!(
        sas.init(&mem, CORE, 0x50, 32, 0, 44100),
        Err(SasError::InvalidGrain(0x50))
    );
    assert_eq!(
        sas.init(&mem, CORE, 256, 32, 2, 44100),
        Err(SasError::InvalidOutputMode(2))
    );
    assert_eq!(
        sas.init(&mem, CORE, 256, 32, 0, 48000),
        Err(SasError::InvalidSampleRate(48000))
    );
    assert_eq!(sas.get_grain(), 0);
}

#[test]
fn test_init_forces_full_voice_count() {
    let mem = memory();
    let mut sas = SasCore::new();
    sas.init(&mem, CORE, 0x800, 4, 1, 44100).unwrap();
    assert_eq!(sas.get_grain(), 0x800);
    assert_eq!(sas.get_output_mode(), 1);
    assert_eq!(sas.mixer().max_voices(), 32);
    assert_eq!(sas.core_addr(), CORE);
    assert_eq!(sas.get_end_flag(), u32::MAX);
}

#[test]
fn test_invalid_voice_index() {
    let mut mem = memory();
    let mut sas = initialized(&mem);
    assert_eq!(sas.set_pitch(32, 0x1000), Err(SasError::InvalidVoice(32)));
    assert_eq!(sas.set_pitch(-1, 0x1000), Err(SasError::InvalidVoice(-1)));
    assert_eq!(sas.set_key_on(&mem, 40).unwrap_err().code(), 0x8042_0010);
    assert_eq!(sas.get_envelope_height(32), Err(SasError::InvalidVoice(32)));
    assert_eq!(
        sas.unset_atrac3(&mut mem, 99),
        Err(SasError::InvalidVoice(99))
    );
}

// ============================================================================
// Voice sources
// ============================================================================

#[test]
fn test_set_voice_validation() {
    let mem = memory();
    let mut sas = initialized(&mem);

    assert_eq!(sas.set_voice(&mem, 0, VAG, 0, 0), Err(SasError::InvalidParameter));
    assert_eq!(sas.set_voice(&mem, 0, VAG, 17, 0), Err(SasError::InvalidParameter));
    assert_eq!(sas.set_voice(&mem, 0, VAG, 32, 2), Err(SasError::InvalidLoopPos(2)));

    // Invalid addresses are accepted and ignored
    assert_eq!(sas.set_voice(&mem, 0, 0x10, 32, 0), Ok(()));
    assert_eq!(sas.voice(0).voice_type(), VoiceType::Off);

    sas.set_voice(&mem, 0, VAG, 32, 1).unwrap();
    assert_eq!(sas.voice(0).voice_type(), VoiceType::Vag);
    assert!(sas.voice(0).looping);
    // Not keyed, so not started
    assert!(!sas.voice(0).playing);
}

#[test]
fn test_set_voice_negative_size_plays_nothing() {
    let mem = memory();
    let mut sas = initialized(&mem);
    sas.set_voice(&mem, 1, VAG, -16, 0).unwrap();
    assert_eq!(sas.voice(1).source_range(), Some((VAG, 0)));
}

#[test]
fn test_set_voice_on_keyed_voice_resumes_playback() {
    let mem = memory();
    let mut sas = initialized(&mem);
    sas.set_voice(&mem, 0, VAG, 32, 0).unwrap();
    sas.set_key_on(&mem, 0).unwrap();
    sas.mixer_mut().voice_mut(0).playing = false;

    sas.set_voice(&mem, 0, VAG + 0x100, 32, 0).unwrap();
    assert!(sas.voice(0).playing);
    assert_eq!(sas.voice(0).read_address(), VAG + 0x100);
}

#[test]
fn test_set_voice_pcm_validation() {
    let mem = memory();
    let mut sas = initialized(&mem);

    assert_eq!(
        sas.set_voice_pcm(&mem, 0, PCM, 0, -1),
        Err(SasError::InvalidPcmSize(0))
    );
    assert_eq!(
        sas.set_voice_pcm(&mem, 0, PCM, 0x10001, -1).unwrap_err().code(),
        0x8042_001A
    );
    assert_eq!(
        sas.set_voice_pcm(&mem, 0, PCM, 100, 100),
        Err(SasError::InvalidLoopPos(100))
    );
    assert_eq!(sas.set_voice_pcm(&mem, 0, 0x10, 100, 0), Ok(()));
    assert!(!sas.voice(0).playing);

    sas.set_voice_pcm(&mem, 0, PCM, 100, -1).unwrap();
    let voice = sas.voice(0);
    assert_eq!(voice.voice_type(), VoiceType::Pcm);
    assert!(voice.playing);
    assert!(!voice.looping);

    sas.set_voice_pcm(&mem, 0, PCM, 100, 20).unwrap();
    assert!(sas.voice(0).looping);
    match &sas.voice(0).source {
        VoiceSource::Pcm(pcm) => assert_eq!(pcm.loop_pos, 20),
        other => panic!("expected PCM source, got {:?}", other),
    }
}

#[test]
fn test_set_noise_range() {
    let mem = memory();
    let mut sas = initialized(&mem);
    assert_eq!(sas.set_noise(0, 64), Err(SasError::InvalidNoiseFreq(64)));
    assert_eq!(sas.set_noise(0, -1), Err(SasError::InvalidNoiseFreq(-1)));
    sas.set_noise(0, 63).unwrap();
    assert_eq!(sas.voice(0).voice_type(), VoiceType::Noise);
    assert_eq!(sas.voice(0).noise_freq, 63);
}

#[test]
fn test_wave_commands_are_accepted() {
    let mut sas = SasCore::new();
    assert_eq!(sas.set_triangular_wave(0, 1), Ok(()));
    assert_eq!(sas.set_steep_wave(0, 1), Ok(()));
}

// ============================================================================
// Voice parameters
// ============================================================================

#[test]
fn test_set_volume_limits() {
    let mem = memory();
    let mut sas = initialized(&mem);
    assert_eq!(
        sas.set_volume(0, 0x1001, 0, 0, 0).unwrap_err().code(),
        0x8042_0018
    );
    assert_eq!(sas.set_volume(0, 0, 0, 0, -0x1001), Err(SasError::InvalidVolume));
    assert_eq!(sas.set_volume(0, 0, i32::MIN, 0, 0), Err(SasError::InvalidVolume));

    sas.set_volume(0, -0x1000, 0x800, 0x400, 0).unwrap();
    let voice = sas.voice(0);
    assert_eq!(
        (voice.volume_left, voice.volume_right, voice.effect_left, voice.effect_right),
        (-0x1000, 0x800, 0x400, 0)
    );
}

#[test]
fn test_set_pitch_range() {
    let mem = memory();
    let mut sas = initialized(&mem);
    assert_eq!(sas.set_pitch(0, 0x4001), Err(SasError::InvalidPitch(0x4001)));
    assert_eq!(sas.set_pitch(0, -1).unwrap_err().code(), 0x8042_0012);
    sas.set_pitch(0, 0x4000).unwrap();
    sas.set_pitch(1, 0).unwrap();
    assert_eq!(sas.voice(0).pitch, 0x4000);
    assert_eq!(sas.voice(1).pitch, 0);
}

#[test]
fn test_key_state_transitions() {
    let mem = memory();
    let mut sas = initialized(&mem);
    sas.set_voice_pcm(&mem, 0, PCM, 64, -1).unwrap();

    assert_eq!(sas.set_key_off(0), Err(SasError::VoicePaused(0)));
    sas.set_key_on(&mem, 0).unwrap();
    assert_eq!(sas.set_key_on(&mem, 0).unwrap_err().code(), 0x8042_0016);

    sas.set_pause(1, true);
    assert_eq!(sas.set_key_off(0), Err(SasError::VoicePaused(0)));
    sas.set_pause(1, false);

    sas.set_key_off(0).unwrap();
    assert!(!sas.voice(0).on);
    assert_eq!(sas.voice(0).envelope.state(), EnvelopeState::Release);
}

#[test]
fn test_pause_and_end_flags() {
    let mem = memory();
    let mut sas = initialized(&mem);
    sas.set_pause(0x8000_0005, true);
    assert_eq!(sas.get_pause_flag(), 0x8000_0005);
    sas.set_pause(0x1, false);
    assert_eq!(sas.get_pause_flag(), 0x8000_0004);

    sas.set_voice_pcm(&mem, 3, PCM, 64, -1).unwrap();
    assert_eq!(sas.get_end_flag(), !0x8);
}

// ============================================================================
// Envelope
// ============================================================================

#[test]
fn test_set_adsr_rejects_negative_flagged_rate() {
    let mem = memory();
    let mut sas = initialized(&mem);
    assert_eq!(
        sas.set_adsr(0, 0x2, 0, -1, 0, 0).unwrap_err().code(),
        0x8042_0019
    );

    // Negative rate outside the mask is fine and not applied
    sas.set_adsr(0, 0x1, 0x100, -1, 0, 0).unwrap();
    let envelope = &sas.voice(0).envelope;
    assert_eq!(envelope.attack_rate, 0x100);
    assert_eq!(envelope.decay_rate, 0);
}

#[test]
fn test_set_adsr_mode_validation() {
    let mem = memory();
    let mut sas = initialized(&mem);

    // Attack must rise
    assert_eq!(
        sas.set_adsr_mode(0, 0x1, 1, 1, 0, 1),
        Err(SasError::InvalidAdsrCurveMode)
    );
    // Release must fall
    assert_eq!(
        sas.set_adsr_mode(0, 0x8, 0, 1, 0, 4).unwrap_err().code(),
        0x8042_0013
    );
    assert_eq!(
        sas.set_adsr_mode(0, 0xF, 5, 5, 5, 5),
        Err(SasError::InvalidAdsrCurveMode)
    );
    assert_eq!(
        sas.set_adsr_mode(0, 0x4, 0, 1, -1, 1),
        Err(SasError::InvalidAdsrCurveMode)
    );

    // Unflagged phases are not checked; the top bit is ignored
    sas.set_adsr_mode(0, 0x2, 1, i32::MIN | 3, 9, 9).unwrap();
    let envelope = &sas.voice(0).envelope;
    assert_eq!(envelope.decay_type, CurveMode::ExponentialDecrease);
    assert_eq!(envelope.attack_type, CurveMode::LinearIncrease);

    sas.set_adsr_mode(0, 0xF, 4, 5, 2, 3).unwrap();
    let envelope = &sas.voice(0).envelope;
    assert_eq!(envelope.attack_type, CurveMode::ExponentialIncrease);
    assert_eq!(envelope.decay_type, CurveMode::Direct);
    assert_eq!(envelope.sustain_type, CurveMode::LinearBent);
    assert_eq!(envelope.release_type, CurveMode::ExponentialDecrease);
}

#[test]
fn test_set_simple_adsr() {
    let mem = memory();
    let mut sas = initialized(&mem);
    assert_eq!(
        sas.set_simple_adsr(0, 0, 1 << 13),
        Err(SasError::InvalidAdsrCurveMode)
    );

    sas.set_simple_adsr(0, 0xABCD_8003, 0x0001_0020).unwrap();
    let envelope = &sas.voice(0).envelope;
    assert_eq!(envelope.attack_type, CurveMode::LinearBent);
    assert_eq!(envelope.sustain_level, 4 << 26);
    assert_eq!(envelope.release_type, CurveMode::ExponentialDecrease);
}

#[test]
fn test_envelope_heights() {
    let mut mem = memory();
    let mut sas = initialized(&mem);
    let samples = vec![1000i16; 256];
    assert!(mem.write_i16_slice(PCM, &samples));
    sas.set_voice_pcm(&mem, 4, PCM, 256, -1).unwrap();
    hold_envelope(&mut sas, 4);
    sas.set_key_on(&mem, 4).unwrap();
    sas.core(&mut mem, OUT).unwrap();

    assert_eq!(sas.get_envelope_height(4), Ok(0x4000_0000));
    assert_eq!(sas.get_envelope_height(5), Ok(0));

    let heights = BASE + 0x3000;
    assert_eq!(
        sas.get_all_envelope_heights(&mut mem, 0x10),
        Err(SasError::InvalidParameter)
    );
    sas.get_all_envelope_heights(&mut mem, heights).unwrap();
    assert_eq!(mem.read_u32(heights + 4 * 4), Some(0x4000_0000));
    assert_eq!(mem.read_u32(heights + 5 * 4), Some(0));
}

// ============================================================================
// Effect
// ============================================================================

#[test]
fn test_reverb_commands() {
    let mut sas = SasCore::new();
    assert_eq!(sas.rev_type(9), Err(SasError::RevInvalidType(9)));
    assert_eq!(sas.rev_type(-2).unwrap_err().code(), 0x8042_0020);
    sas.rev_type(-1).unwrap();
    sas.rev_type(8).unwrap();

    assert_eq!(sas.rev_param(128, 0), Err(SasError::RevInvalidDelay(128)));
    assert_eq!(sas.rev_param(0, -1), Err(SasError::RevInvalidFeedback(-1)));
    sas.rev_param(127, 5).unwrap();

    assert_eq!(sas.rev_evol(0x1001, 0), Err(SasError::RevInvalidVolume));
    assert_eq!(sas.rev_evol(0, u32::MAX), Err(SasError::RevInvalidVolume));
    sas.rev_evol(0x1000, 0x800).unwrap();

    sas.rev_von(2, 0);
    let effect = sas.mixer().waveform_effect();
    assert_eq!(effect.effect_type, 8);
    assert_eq!((effect.delay, effect.feedback), (127, 5));
    assert_eq!((effect.left_vol, effect.right_vol), (0x1000, 0x800));
    assert!(effect.is_dry_on);
    assert!(!effect.is_wet_on);
}

#[test]
fn test_grain_and_output_mode_accessors() {
    let mut sas = SasCore::new();
    sas.set_grain(512);
    assert_eq!(sas.get_grain(), 512);
    sas.set_grain(-5);
    assert_eq!(sas.get_grain(), 0);

    assert_eq!(sas.set_output_mode(3), Err(SasError::InvalidOutputMode(3)));
    sas.set_output_mode(1).unwrap();
    assert_eq!(sas.get_output_mode(), 1);
}

// ============================================================================
// Mixing
// ============================================================================

#[test]
fn test_core_writes_grain_to_guest_memory() {
    let mut mem = memory();
    let samples: Vec<i16> = (0..256).map(|n| n * 3 - 200).collect();
    assert!(mem.write_i16_slice(PCM, &samples));
    assert!(mem.write_i16_slice(OUT, &[7; GRAIN as usize * 2]));

    let mut sas = initialized(&mem);
    sas.set_voice_pcm(&mem, 0, PCM, 256, -1).unwrap();
    hold_envelope(&mut sas, 0);
    sas.set_key_on(&mem, 0).unwrap();

    let cost = sas.core(&mut mem, OUT).unwrap();
    assert_eq!(cost, 20 + 68 + 38);

    let out = read_samples(&mem, OUT, GRAIN as usize * 2);
    assert_eq!(out[32 * 2], 0);
    for k in 33..GRAIN as usize {
        assert_eq!(out[k * 2], samples[k - 32]);
        assert_eq!(out[k * 2 + 1], samples[k - 32]);
    }

    assert_eq!(sas.core(&mut mem, 0x10), Err(SasError::InvalidParameter));
}

#[test]
fn test_core_with_mix_uses_buffer_as_input() {
    let mut mem = memory();
    assert!(mem.write_i16_slice(OUT, &[1000; GRAIN as usize * 2]));
    let mut sas = initialized(&mem);

    sas.core_with_mix(&mut mem, OUT, 0x800, 0x1000).unwrap();
    let out = read_samples(&mem, OUT, GRAIN as usize * 2);
    for frame in out.chunks(2) {
        assert_eq!(frame, [500, 1000]);
    }

    sas.set_output_mode(1).unwrap();
    let err = sas.core_with_mix(&mut mem, OUT, 0x1000, 0x1000).unwrap_err();
    assert_eq!(err, SasError::UnsupportedOutputMode);
    assert_eq!(err.code(), 0x8000_0004);
}

#[test]
fn test_core_with_mix_wraps_oversized_input_volume() {
    let mut mem = memory();
    assert!(mem.write_i16_slice(OUT, &[i16::MAX; GRAIN as usize * 2]));
    let mut sas = initialized(&mem);

    // 32767 * 0x20000 wraps to -0x20000 in 32 bits
    assert!(sas.core_with_mix(&mut mem, OUT, 0x20000, 0x20000).is_ok());
    let out = read_samples(&mem, OUT, GRAIN as usize * 2);
    assert!(out.iter().all(|&s| s == -32));
}

#[test]
fn test_core_before_init_writes_nothing() {
    let mut mem = memory();
    assert!(mem.write_i16_slice(OUT, &[9; 4]));
    let mut sas = SasCore::new();
    assert_eq!(sas.core(&mut mem, OUT), Ok(20));
    assert_eq!(read_samples(&mem, OUT, 4), vec![9; 4]);
}

#[test]
fn test_adpcm_voice_sets_end_flag() {
    let mut mem = memory();
    let mut blocks = [0u8; 32];
    blocks[16 + 1] = 7;
    assert!(mem.load(VAG, &blocks));

    let mut sas = initialized(&mem);
    sas.set_voice(&mem, 6, VAG, 32, 0).unwrap();
    sas.set_key_on(&mem, 6).unwrap();
    assert_eq!(sas.get_end_flag() & (1 << 6), 0);

    sas.core(&mut mem, OUT).unwrap();
    assert_ne!(sas.get_end_flag() & (1 << 6), 0);
    // The voice is free to be keyed again
    sas.set_key_on(&mem, 6).unwrap();
}

// ============================================================================
// Compressed streams
// ============================================================================

#[derive(Default)]
struct StreamLog {
    fed: Vec<u8>,
}

/// Stream that decodes every fed byte into one constant sample
struct ConstantStream {
    level: i16,
    available: usize,
    log: Rc<RefCell<StreamLog>>,
}

impl CompressedAudioSource for ConstantStream {
    fn pull(&mut self, out: &mut [i16]) -> PullResult {
        let count = self.available.min(out.len());
        out[..count].fill(self.level);
        self.available -= count;
        PullResult {
            samples: count,
            finished: false,
        }
    }

    fn add_stream_data(&mut self, data: &[u8]) {
        self.available += data.len();
        self.log.borrow_mut().fed.extend_from_slice(data);
    }
}

fn stream(level: i16, available: usize, log: &Rc<RefCell<StreamLog>>) -> Box<dyn CompressedAudioSource> {
    Box::new(ConstantStream {
        level,
        available,
        log: Rc::clone(log),
    })
}

#[test]
fn test_atrac3_lifecycle() {
    let mut mem = memory();
    let mut sas = initialized(&mem);
    let log = Rc::new(RefCell::new(StreamLog::default()));
    let ctx = BASE + 0x9000;
    let slot = CORE + 56 * 2 + 20;

    sas.set_voice_atrac3(&mut mem, 2, ctx, Some(stream(100, 0, &log)))
        .unwrap();
    assert_eq!(mem.read_u32(slot), Some(ctx));
    assert_eq!(sas.voice(2).voice_type(), VoiceType::Atrac3);
    assert!(sas.voice(2).playing);
    assert!(!sas.voice(2).looping);

    assert_eq!(
        sas.set_voice_atrac3(&mut mem, 2, ctx, None).unwrap_err().code(),
        0x8042_0040
    );
    assert_eq!(
        sas.set_voice(&mem, 2, VAG, 32, 0),
        Err(SasError::Atrac3AlreadySet(2))
    );
    assert_eq!(
        sas.set_voice_pcm(&mem, 2, PCM, 32, -1),
        Err(SasError::Atrac3AlreadySet(2))
    );

    let data = BASE + 0xA000;
    assert!(mem.load(data, &[1, 2, 3, 4]));
    sas.concatenate_atrac3(&mem, 2, data, 4).unwrap();
    sas.concatenate_atrac3(&mem, 2, 0x10, 4).unwrap();
    assert_eq!(log.borrow().fed, vec![1, 2, 3, 4]);

    sas.set_pause(1 << 2, true);
    sas.unset_atrac3(&mut mem, 2).unwrap();
    assert_eq!(mem.read_u32(slot), Some(0));
    let voice = sas.voice(2);
    assert_eq!(voice.voice_type(), VoiceType::Off);
    assert!(!voice.playing && !voice.on && !voice.paused);

    assert_eq!(sas.unset_atrac3(&mut mem, 2), Err(SasError::Atrac3NotSet(2)));
}

#[test]
fn test_atrac3_voice_is_mixed() {
    let mut mem = memory();
    let mut sas = initialized(&mem);
    let log = Rc::new(RefCell::new(StreamLog::default()));

    sas.set_voice_atrac3(&mut mem, 0, BASE + 0x9000, Some(stream(2000, 4096, &log)))
        .unwrap();
    hold_envelope(&mut sas, 0);
    sas.set_key_on(&mem, 0).unwrap();
    sas.core(&mut mem, OUT).unwrap();

    let out = read_samples(&mem, OUT, GRAIN as usize * 2);
    assert_eq!(out[40 * 2], 2000);
    assert!(sas.voice(0).playing);
}

// ============================================================================
// Snapshots
// ============================================================================

#[test]
fn test_state_roundtrip_continues_identically() {
    let mut mem = memory();
    let samples: Vec<i16> = (0..1024).map(|n| ((n * 37) % 2000 - 1000) as i16).collect();
    assert!(mem.write_i16_slice(PCM, &samples));

    let mut sas = initialized(&mem);
    sas.set_voice_pcm(&mem, 0, PCM, 1024, 100).unwrap();
    sas.set_pitch(0, 0x1555).unwrap();
    sas.set_simple_adsr(0, 0x000F, 0x1FC0).unwrap();
    sas.set_key_on(&mem, 0).unwrap();
    sas.rev_param(10, 20).unwrap();
    sas.core(&mut mem, OUT).unwrap();

    let bytes = sas.save_state().unwrap();
    let mut restored = SasCore::new();
    restored.load_state(&bytes).unwrap();
    assert_eq!(restored.core_addr(), CORE);
    assert_eq!(restored.get_grain(), GRAIN);

    for _ in 0..8 {
        sas.core(&mut mem, OUT).unwrap();
        let expected = read_samples(&mem, OUT, GRAIN as usize * 2);
        restored.core(&mut mem, OUT).unwrap();
        let actual = read_samples(&mem, OUT, GRAIN as usize * 2);
        assert_eq!(expected, actual);
    }
}

#[test]
fn test_load_state_rebinds_compressed_sources() {
    let mut mem = memory();
    let mut sas = initialized(&mem);
    let log = Rc::new(RefCell::new(StreamLog::default()));
    let ctx = BASE + 0x9000;
    sas.set_voice_atrac3(&mut mem, 9, ctx, Some(stream(1, 0, &log)))
        .unwrap();
    let bytes = sas.save_state().unwrap();

    let mut unbound = SasCore::new();
    unbound.load_state(&bytes).unwrap();
    match &unbound.voice(9).source {
        VoiceSource::Atrac3(atrac) => {
            assert!(!atrac.has_source());
            assert!(atrac.needs_rebind());
        }
        other => panic!("expected compressed source, got {:?}", other),
    }

    let mut requested = Vec::new();
    let mut rebound = SasCore::new();
    rebound
        .load_state_with(&bytes, |addr| {
            requested.push(addr);
            Some(stream(1, 0, &log))
        })
        .unwrap();
    assert_eq!(requested, vec![ctx]);
    match &rebound.voice(9).source {
        VoiceSource::Atrac3(atrac) => {
            assert!(atrac.has_source());
            assert_eq!(atrac.context_addr(), ctx);
        }
        other => panic!("expected compressed source, got {:?}", other),
    }
}

#[test]
fn test_load_state_rejects_bad_input() {
    let mut sas = SasCore::new();
    assert!(matches!(sas.load_state(&[]), Err(SnapshotError::Truncated(_))));

    let mut bytes = SasCore::new().save_state().unwrap();
    bytes.push(0);
    assert_eq!(
        SasCore::new().load_state(&bytes),
        Err(SnapshotError::TrailingData(1))
    );
}

// ============================================================================
// Configuration
// ============================================================================

#[test]
fn test_from_config() {
    let config = SasConfig::from_toml_str(
        r#"
        grain_size = 128
        output_mode = "raw"

        [effect]
        type = 2
        wet = true
        left_volume = 0x400
        right_volume = 0x200
        delay = 5
        feedback = 6
        "#,
    )
    .unwrap();

    let sas = SasCore::from_config(&config).unwrap();
    assert_eq!(sas.get_grain(), 128);
    assert_eq!(sas.get_output_mode(), 1);
    let effect = sas.mixer().waveform_effect();
    assert_eq!(effect.effect_type, 2);
    assert!(effect.is_dry_on && effect.is_wet_on);
    assert_eq!((effect.left_vol, effect.right_vol), (0x400, 0x200));
    assert_eq!((effect.delay, effect.feedback), (5, 6));

    let mut bad = SasConfig::default();
    bad.max_voices = 40;
    assert_eq!(
        SasCore::from_config(&bad).err(),
        Some(SasError::InvalidMaxVoices(40))
    );
}

#[test]
fn test_linear_sustain_compat_flag() {
    let mut config = SasConfig::default();
    config.compat.linear_sustain_increase_as_decrease = true;
    let mut sas = SasCore::from_config(&config).unwrap();

    sas.set_adsr_mode(0, 0x4, 0, 1, 0, 1).unwrap();
    assert_eq!(sas.voice(0).envelope.sustain_type, CurveMode::LinearDecrease);
}
