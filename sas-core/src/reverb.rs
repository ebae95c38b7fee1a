//! Effect send/return path
//!
//! The mixer accumulates a stereo "send" bus alongside the dry mix. When the
//! wet path is enabled the send bus is halved in rate and handed to a
//! [`ReverbProcessor`], whose double-rate output is added back to the mix.
//! The processor itself is an external capability; [`NullReverb`] stands in
//! when the host has none.

/// Reverb/delay preset selected with [`crate::SasMixer::set_waveform_effect_type`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EffectType {
    Off,
    Room,
    StudioSmall,
    StudioMedium,
    StudioLarge,
    Hall,
    Space,
    Echo,
    Delay,
    Pipe,
}

impl EffectType {
    /// Parse the console's preset code (-1..=8)
    pub fn from_code(code: i32) -> Option<Self> {
        Some(match code {
            -1 => EffectType::Off,
            0 => EffectType::Room,
            1 => EffectType::StudioSmall,
            2 => EffectType::StudioMedium,
            3 => EffectType::StudioLarge,
            4 => EffectType::Hall,
            5 => EffectType::Space,
            6 => EffectType::Echo,
            7 => EffectType::Delay,
            8 => EffectType::Pipe,
            _ => return None,
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            EffectType::Off => "off",
            EffectType::Room => "room",
            EffectType::StudioSmall => "studio small",
            EffectType::StudioMedium => "studio medium",
            EffectType::StudioLarge => "studio large",
            EffectType::Hall => "hall",
            EffectType::Space => "space",
            EffectType::Echo => "echo",
            EffectType::Delay => "delay",
            EffectType::Pipe => "pipe",
        }
    }
}

/// Effect bus configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaveformEffect {
    /// Preset code, -1 for off
    pub effect_type: i32,
    /// Dry mix reaches the output
    pub is_dry_on: bool,
    /// Processed send bus reaches the output
    pub is_wet_on: bool,
    /// Return level (unit 0x1000)
    pub left_vol: i32,
    pub right_vol: i32,
    /// Delay parameter (0..128)
    pub delay: i32,
    /// Feedback parameter (0..128)
    pub feedback: i32,
}

impl Default for WaveformEffect {
    fn default() -> Self {
        Self {
            effect_type: -1,
            is_dry_on: true,
            is_wet_on: false,
            left_vol: 0,
            right_vol: 0,
            delay: 0,
            feedback: 0,
        }
    }
}

/// External reverb/delay unit
pub trait ReverbProcessor {
    /// Select a preset (-1..=8); called only when the preset changes
    fn set_preset(&mut self, preset: i32);

    /// Process `frames` interleaved stereo frames from `input` into
    /// `frames * 2` interleaved stereo frames in `output` (double rate)
    ///
    /// `left_vol`/`right_vol` are return levels scaled so 0x8000 is unity.
    fn process(
        &mut self,
        output: &mut [i16],
        input: &[i16],
        frames: usize,
        left_vol: i32,
        right_vol: i32,
    );
}

/// Reverb that returns silence
#[derive(Debug, Clone, Copy, Default)]
pub struct NullReverb;

impl ReverbProcessor for NullReverb {
    fn set_preset(&mut self, _preset: i32) {}

    fn process(
        &mut self,
        output: &mut [i16],
        _input: &[i16],
        frames: usize,
        _left_vol: i32,
        _right_vol: i32,
    ) {
        let len = (frames * 4).min(output.len());
        output[..len].fill(0);
    }
}
