//! ADSR envelope generator
//!
//! Per-sample attack/decay/sustain/release state machine with the hardware's
//! six curve shapes. Heights are 64-bit fixed point with full scale at
//! [`ENVELOPE_HEIGHT_MAX`] (2^30); the mixer reduces them to 15 bits.
//!
//! # State Machine
//!
//! ```text
//! KeyOn -> KeyOnStep (31 samples) -> Attack -> Decay -> Sustain -> Release -> Off
//!                                            key_off() from any state -> Release
//!                                            end() from any state     -> Off
//! ```
//!
//! The 32-sample key-on window (one KeyOn step plus 31 KeyOnStep steps) models
//! the hardware's latency between a key-on command and audible output.

use bitflags::bitflags;
use tracing::error;

use crate::ENVELOPE_HEIGHT_MAX;
use crate::state::{DoState, SnapshotError, StateVisitor};

// ============================================================================
// Curve Modes
// ============================================================================

/// Shape of one envelope phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CurveMode {
    #[default]
    LinearIncrease,
    LinearDecrease,
    /// Linear rise that slows to a quarter rate above 3/4 height
    LinearBent,
    ExponentialDecrease,
    ExponentialIncrease,
    /// Height is set to the rate value directly
    Direct,
}

/// Envelope phase a curve mode or rate applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdsrPhase {
    Attack,
    Decay,
    Sustain,
    Release,
}

impl CurveMode {
    /// Parse the console's curve mode code (0..=5)
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(CurveMode::LinearIncrease),
            1 => Some(CurveMode::LinearDecrease),
            2 => Some(CurveMode::LinearBent),
            3 => Some(CurveMode::ExponentialDecrease),
            4 => Some(CurveMode::ExponentialIncrease),
            5 => Some(CurveMode::Direct),
            _ => None,
        }
    }

    /// Console curve mode code
    pub fn code(self) -> i32 {
        match self {
            CurveMode::LinearIncrease => 0,
            CurveMode::LinearDecrease => 1,
            CurveMode::LinearBent => 2,
            CurveMode::ExponentialDecrease => 3,
            CurveMode::ExponentialIncrease => 4,
            CurveMode::Direct => 5,
        }
    }

    /// Whether the hardware accepts this mode for `phase`
    ///
    /// Attack only rises, decay and release only fall (or jump); sustain takes
    /// any shape.
    pub fn is_valid_for(self, phase: AdsrPhase) -> bool {
        match phase {
            AdsrPhase::Attack => matches!(
                self,
                CurveMode::LinearIncrease | CurveMode::LinearBent | CurveMode::ExponentialIncrease
            ),
            AdsrPhase::Decay | AdsrPhase::Release => matches!(
                self,
                CurveMode::LinearDecrease | CurveMode::ExponentialDecrease | CurveMode::Direct
            ),
            AdsrPhase::Sustain => true,
        }
    }

    /// Short label for debug output
    pub fn label(self) -> &'static str {
        match self {
            CurveMode::LinearIncrease => "L+",
            CurveMode::LinearDecrease => "L-",
            CurveMode::LinearBent => "LB",
            CurveMode::ExponentialDecrease => "E-",
            CurveMode::ExponentialIncrease => "E+",
            CurveMode::Direct => "D",
        }
    }
}

bitflags! {
    /// Which phases an ADSR setter updates
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AdsrFlags: u32 {
        const ATTACK = 0b0001;
        const DECAY = 0b0010;
        const SUSTAIN = 0b0100;
        const RELEASE = 0b1000;
    }
}

// ============================================================================
// Envelope State
// ============================================================================

/// Current phase of the envelope state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EnvelopeState {
    /// Counting out the key-on latency window
    KeyOnStep,
    /// Key-on requested, not yet stepped
    KeyOn,
    #[default]
    Off,
    Attack,
    Decay,
    Sustain,
    Release,
}

impl EnvelopeState {
    /// Snapshot code
    pub fn code(self) -> i32 {
        match self {
            EnvelopeState::KeyOnStep => -42,
            EnvelopeState::KeyOn => -2,
            EnvelopeState::Off => -1,
            EnvelopeState::Attack => 0,
            EnvelopeState::Decay => 1,
            EnvelopeState::Sustain => 2,
            EnvelopeState::Release => 3,
        }
    }

    /// Parse a snapshot code
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            -42 => Some(EnvelopeState::KeyOnStep),
            -2 => Some(EnvelopeState::KeyOn),
            -1 => Some(EnvelopeState::Off),
            0 => Some(EnvelopeState::Attack),
            1 => Some(EnvelopeState::Decay),
            2 => Some(EnvelopeState::Sustain),
            3 => Some(EnvelopeState::Release),
            _ => None,
        }
    }
}

// ============================================================================
// Bitfield Rate Decoding
// ============================================================================

/// Rate from a 7-bit "shift + step" field (attack and linear sustain)
fn simple_rate(n: u32) -> i32 {
    let n = n & 0x7F;
    if n == 0x7F {
        return 0;
    }
    let rate = ((7 - (n & 3) as i32) << 26) >> (n >> 2);
    if rate == 0 { 1 } else { rate }
}

/// Rate from a 7-bit field for exponential sustain
fn exponent_rate(n: u32) -> i32 {
    let n = n & 0x7F;
    if n == 0x7F {
        return 0;
    }
    let rate = ((7 - (n & 3) as i32) << 24) >> (n >> 2);
    if rate == 0 { 1 } else { rate }
}

fn attack_mode(env1: u32) -> CurveMode {
    if env1 & 0x8000 != 0 {
        CurveMode::LinearBent
    } else {
        CurveMode::LinearIncrease
    }
}

fn decay_rate(env1: u32) -> i32 {
    let n = (env1 >> 4) & 0x0F;
    if n == 0 {
        0x7FFF_FFFF
    } else {
        (0x8000_0000u32 >> n) as i32
    }
}

fn sustain_mode(env2: u32) -> CurveMode {
    // Only the first four codes fit in two bits
    match (env2 >> 14) & 3 {
        0 => CurveMode::LinearIncrease,
        1 => CurveMode::LinearDecrease,
        2 => CurveMode::LinearBent,
        _ => CurveMode::ExponentialDecrease,
    }
}

fn sustain_rate(env2: u32) -> i32 {
    if sustain_mode(env2) == CurveMode::ExponentialDecrease {
        exponent_rate(env2 >> 6)
    } else {
        simple_rate(env2 >> 6)
    }
}

fn release_mode(env2: u32) -> CurveMode {
    if env2 & 0x20 != 0 {
        CurveMode::ExponentialDecrease
    } else {
        CurveMode::LinearDecrease
    }
}

fn release_rate(env2: u32) -> i32 {
    let n = env2 & 0x1F;
    if n == 31 {
        return 0;
    }
    if release_mode(env2) == CurveMode::LinearDecrease {
        match n {
            30 => 0x4000_0000,
            29 => 1,
            _ => (0x1000_0000u32 >> n) as i32,
        }
    } else if n == 0 {
        0x7FFF_FFFF
    } else {
        (0x8000_0000u32 >> n) as i32
    }
}

fn sustain_level(env1: u32) -> i32 {
    (((env1 & 0x0F) + 1) << 26) as i32
}

// ============================================================================
// Envelope
// ============================================================================

/// ADSR envelope of one voice
#[derive(Debug, Clone)]
pub struct AdsrEnvelope {
    pub attack_rate: i32,
    pub decay_rate: i32,
    pub sustain_rate: i32,
    pub release_rate: i32,
    pub attack_type: CurveMode,
    pub decay_type: CurveMode,
    pub sustain_type: CurveMode,
    pub release_type: CurveMode,
    /// Height below which decay hands over to sustain
    pub sustain_level: i32,

    state: EnvelopeState,
    height: i64,

    /// Rewrite a rising linear sustain into a falling one
    linear_sustain_fix: bool,
}

impl Default for AdsrEnvelope {
    fn default() -> Self {
        Self::new()
    }
}

impl AdsrEnvelope {
    /// Create an idle envelope with zero rates
    pub fn new() -> Self {
        Self {
            attack_rate: 0,
            decay_rate: 0,
            sustain_rate: 0,
            release_rate: 0,
            attack_type: CurveMode::LinearIncrease,
            decay_type: CurveMode::LinearDecrease,
            sustain_type: CurveMode::LinearDecrease,
            release_type: CurveMode::LinearDecrease,
            sustain_level: 0,
            state: EnvelopeState::Off,
            height: 0,
            linear_sustain_fix: false,
        }
    }

    /// Enable the compatibility rewrite of LinearIncrease sustain curves
    ///
    /// Some titles program a rising sustain that the real hardware evidently
    /// plays as a fall; with this set the rewrite is applied whenever curve
    /// modes are assigned.
    pub fn set_linear_sustain_fix(&mut self, enabled: bool) {
        self.linear_sustain_fix = enabled;
    }

    fn apply_sustain_fix(&mut self) {
        if self.linear_sustain_fix && self.sustain_type == CurveMode::LinearIncrease {
            self.sustain_type = CurveMode::LinearDecrease;
        }
    }

    /// Configure all four phases from the packed hardware bitfields
    pub fn set_simple_envelope(&mut self, env1: u32, env2: u32) {
        self.attack_rate = simple_rate(env1 >> 8);
        self.attack_type = attack_mode(env1);
        self.decay_rate = decay_rate(env1);
        self.decay_type = CurveMode::ExponentialDecrease;
        self.sustain_rate = sustain_rate(env2);
        self.sustain_type = sustain_mode(env2);
        self.release_rate = release_rate(env2);
        self.release_type = release_mode(env2);
        self.sustain_level = sustain_level(env1);

        self.apply_sustain_fix();

        if self.attack_rate < 0
            || self.decay_rate < 0
            || self.sustain_rate < 0
            || self.release_rate < 0
        {
            error!(
                "Simple envelope produced a negative rate: {:08x} {:08x} ({:08x}, {:08x})",
                self.attack_rate, self.decay_rate, env1, env2
            );
        }
    }

    /// Assign curve modes for the phases selected by `flags`
    pub fn set_envelope(
        &mut self,
        flags: AdsrFlags,
        attack: CurveMode,
        decay: CurveMode,
        sustain: CurveMode,
        release: CurveMode,
    ) {
        if flags.contains(AdsrFlags::ATTACK) {
            self.attack_type = attack;
        }
        if flags.contains(AdsrFlags::DECAY) {
            self.decay_type = decay;
        }
        if flags.contains(AdsrFlags::SUSTAIN) {
            self.sustain_type = sustain;
        }
        if flags.contains(AdsrFlags::RELEASE) {
            self.release_type = release;
        }
        self.apply_sustain_fix();
    }

    /// Assign rates for the phases selected by `flags`
    pub fn set_rate(&mut self, flags: AdsrFlags, attack: i32, decay: i32, sustain: i32, release: i32) {
        if flags.contains(AdsrFlags::ATTACK) {
            self.attack_rate = attack;
        }
        if flags.contains(AdsrFlags::DECAY) {
            self.decay_rate = decay;
        }
        if flags.contains(AdsrFlags::SUSTAIN) {
            self.sustain_rate = sustain;
        }
        if flags.contains(AdsrFlags::RELEASE) {
            self.release_rate = release;
        }
    }

    pub fn set_sustain_level(&mut self, level: i32) {
        self.sustain_level = level;
    }

    /// Begin the key-on sequence
    pub fn key_on(&mut self) {
        self.set_state(EnvelopeState::KeyOn);
    }

    /// Jump to release
    pub fn key_off(&mut self) {
        self.set_state(EnvelopeState::Release);
    }

    /// Silence immediately (source ran out of data)
    pub fn end(&mut self) {
        self.set_state(EnvelopeState::Off);
        self.height = 0;
    }

    /// Current height clamped to `[0, ENVELOPE_HEIGHT_MAX]`
    pub fn height(&self) -> i64 {
        self.height.clamp(0, ENVELOPE_HEIGHT_MAX)
    }

    pub fn state(&self) -> EnvelopeState {
        self.state
    }

    /// Key-on has been requested but no sample has been stepped yet
    pub fn needs_key_on(&self) -> bool {
        self.state == EnvelopeState::KeyOn
    }

    pub fn has_ended(&self) -> bool {
        self.state == EnvelopeState::Off
    }

    fn set_state(&mut self, state: EnvelopeState) {
        if self.height > ENVELOPE_HEIGHT_MAX {
            self.height = ENVELOPE_HEIGHT_MAX;
        }
        self.state = state;
    }

    fn walk_curve(&mut self, mode: CurveMode, rate: i32) {
        let rate = rate as i64;
        match mode {
            CurveMode::LinearIncrease => self.height += rate,
            CurveMode::LinearDecrease => self.height -= rate,
            CurveMode::LinearBent => {
                if self.height <= ENVELOPE_HEIGHT_MAX * 3 / 4 {
                    self.height += rate;
                } else {
                    self.height += rate / 4;
                }
            }
            CurveMode::ExponentialDecrease => {
                let mut delta = self.height - ENVELOPE_HEIGHT_MAX;
                delta += delta.wrapping_neg().wrapping_mul(rate) >> 32;
                // Unsigned rounding step, bit-identical to the hardware for any rate
                let step = (rate as u64).wrapping_add(3) / 4;
                self.height = delta
                    .wrapping_add(ENVELOPE_HEIGHT_MAX)
                    .wrapping_sub(step as i64);
            }
            CurveMode::ExponentialIncrease => {
                let mut delta = self.height - ENVELOPE_HEIGHT_MAX;
                delta += delta.wrapping_neg().wrapping_mul(rate) >> 32;
                self.height = delta + 0x4000 + ENVELOPE_HEIGHT_MAX;
            }
            CurveMode::Direct => self.height = rate,
        }
    }

    /// Advance one sample
    pub fn step(&mut self) {
        match self.state {
            EnvelopeState::Attack => {
                self.walk_curve(self.attack_type, self.attack_rate);
                if self.height >= ENVELOPE_HEIGHT_MAX || self.height < 0 {
                    self.set_state(EnvelopeState::Decay);
                }
            }
            EnvelopeState::Decay => {
                self.walk_curve(self.decay_type, self.decay_rate);
                if self.height < self.sustain_level as i64 {
                    self.set_state(EnvelopeState::Sustain);
                }
            }
            EnvelopeState::Sustain => {
                self.walk_curve(self.sustain_type, self.sustain_rate);
                if self.height <= 0 {
                    self.height = 0;
                    self.set_state(EnvelopeState::Release);
                }
            }
            EnvelopeState::Release => {
                self.walk_curve(self.release_type, self.release_rate);
                if self.height <= 0 {
                    self.height = 0;
                    self.set_state(EnvelopeState::Off);
                }
            }
            EnvelopeState::Off => {}
            EnvelopeState::KeyOn => {
                self.height = 0;
                self.set_state(EnvelopeState::KeyOnStep);
            }
            EnvelopeState::KeyOnStep => {
                self.height += 1;
                if self.height >= 31 {
                    self.height = 0;
                    self.set_state(EnvelopeState::Attack);
                }
            }
        }
    }
}

fn visit_curve(p: &mut StateVisitor<'_>, mode: &mut CurveMode, field: &'static str) {
    let mut code = mode.code();
    p.visit(&mut code);
    if p.is_reading() && !p.has_failed() {
        match CurveMode::from_code(code) {
            Some(m) => *mode = m,
            None => p.fail(SnapshotError::InvalidValue {
                field,
                value: code as i64,
            }),
        }
    }
}

impl DoState for AdsrEnvelope {
    fn do_state(&mut self, p: &mut StateVisitor<'_>) {
        let Some(version) = p.section("AdsrEnvelope", 1, 2) else {
            return;
        };

        p.visit(&mut self.attack_rate);
        p.visit(&mut self.decay_rate);
        p.visit(&mut self.sustain_rate);
        p.visit(&mut self.release_rate);
        visit_curve(p, &mut self.attack_type, "attack curve");
        visit_curve(p, &mut self.decay_type, "decay curve");
        visit_curve(p, &mut self.sustain_type, "sustain curve");
        p.visit(&mut self.sustain_level);
        visit_curve(p, &mut self.release_type, "release curve");

        let mut state = self.state.code();
        p.visit(&mut state);
        if version < 2 {
            // Version 1 had a separate "released" code (4) and a step counter
            if state == 4 {
                state = EnvelopeState::Off.code();
            }
            let mut legacy_steps = 0i32;
            p.visit(&mut legacy_steps);
        }
        if p.is_reading() {
            self.state = EnvelopeState::from_code(state).unwrap_or(EnvelopeState::Off);
        }

        p.visit(&mut self.height);
    }
}
