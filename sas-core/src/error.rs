//! Command validation errors
//!
//! Each variant maps to the status code the console's SAS library returns, so
//! a host can hand [`SasError::code`] straight back to guest code.

/// Error returned by a rejected [`crate::SasCore`] command
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SasError {
    #[error("invalid grain size {0}")]
    InvalidGrain(i32),

    #[error("invalid max voice count {0}")]
    InvalidMaxVoices(i32),

    #[error("invalid output mode {0}")]
    InvalidOutputMode(i32),

    #[error("invalid sample rate {0}")]
    InvalidSampleRate(i32),

    #[error("bad address {0:#010x}")]
    BadAddress(u32),

    #[error("invalid voice index {0}")]
    InvalidVoice(i32),

    #[error("invalid noise frequency {0}")]
    InvalidNoiseFreq(i32),

    #[error("invalid pitch {0:#x}")]
    InvalidPitch(i32),

    #[error("invalid ADSR curve mode")]
    InvalidAdsrCurveMode,

    #[error("invalid parameter")]
    InvalidParameter,

    #[error("invalid loop position {0}")]
    InvalidLoopPos(i32),

    /// Key-on/key-off issued to a paused voice, or to one already in that key state
    #[error("voice {0} is paused or already in the requested key state")]
    VoicePaused(i32),

    #[error("invalid volume")]
    InvalidVolume,

    #[error("invalid ADSR rate")]
    InvalidAdsrRate,

    #[error("invalid PCM size {0}")]
    InvalidPcmSize(i32),

    #[error("invalid reverb type {0}")]
    RevInvalidType(i32),

    #[error("invalid reverb feedback {0}")]
    RevInvalidFeedback(i32),

    #[error("invalid reverb delay {0}")]
    RevInvalidDelay(i32),

    #[error("invalid reverb volume")]
    RevInvalidVolume,

    #[error("voice {0} already has a compressed stream")]
    Atrac3AlreadySet(i32),

    #[error("voice {0} has no compressed stream")]
    Atrac3NotSet(i32),

    /// Mixing with an input buffer is not available in raw output mode
    #[error("operation unsupported in the current output mode")]
    UnsupportedOutputMode,
}

impl SasError {
    /// Console status code for this error
    pub fn code(&self) -> u32 {
        match self {
            SasError::InvalidGrain(_) => 0x8042_0001,
            SasError::InvalidMaxVoices(_) => 0x8042_0002,
            SasError::InvalidOutputMode(_) => 0x8042_0003,
            SasError::InvalidSampleRate(_) => 0x8042_0004,
            SasError::BadAddress(_) => 0x8042_0005,
            SasError::InvalidVoice(_) => 0x8042_0010,
            SasError::InvalidNoiseFreq(_) => 0x8042_0011,
            SasError::InvalidPitch(_) => 0x8042_0012,
            SasError::InvalidAdsrCurveMode => 0x8042_0013,
            SasError::InvalidParameter => 0x8042_0014,
            SasError::InvalidLoopPos(_) => 0x8042_0015,
            SasError::VoicePaused(_) => 0x8042_0016,
            SasError::InvalidVolume => 0x8042_0018,
            SasError::InvalidAdsrRate => 0x8042_0019,
            SasError::InvalidPcmSize(_) => 0x8042_001A,
            SasError::RevInvalidType(_) => 0x8042_0020,
            SasError::RevInvalidFeedback(_) => 0x8042_0021,
            SasError::RevInvalidDelay(_) => 0x8042_0022,
            SasError::RevInvalidVolume => 0x8042_0023,
            SasError::Atrac3AlreadySet(_) => 0x8042_0040,
            SasError::Atrac3NotSet(_) => 0x8042_0041,
            SasError::UnsupportedOutputMode => 0x8000_0004,
        }
    }
}
