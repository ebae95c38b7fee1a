//! Engine configuration (TOML)
//!
//! ```toml
//! grain_size = 256
//! max_voices = 32
//! output_mode = "mixed"
//! sample_rate = 44100
//!
//! [compat]
//! linear_sustain_increase_as_decrease = false
//!
//! [effect]
//! type = 4
//! dry = true
//! wet = true
//! left_volume = 4096
//! right_volume = 4096
//! delay = 0
//! feedback = 0
//! ```
//!
//! Every field is optional; missing fields take the defaults shown.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::api::{check_effect_params, check_effect_type, check_effect_volume, check_init_grain};
use crate::error::SasError;
use crate::mixer::OutputMode;
use crate::{MAX_VOICES, SAMPLE_RATE};

/// Failure to load or store a [`SasConfig`]
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("invalid config value: {0}")]
    Invalid(#[from] SasError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SasConfig {
    /// Frames per mix call
    #[serde(default = "default_grain_size")]
    pub grain_size: i32,
    #[serde(default = "default_max_voices")]
    pub max_voices: i32,
    #[serde(default)]
    pub output_mode: OutputMode,
    #[serde(default = "default_sample_rate")]
    pub sample_rate: i32,
    #[serde(default)]
    pub compat: CompatConfig,
    #[serde(default)]
    pub effect: EffectConfig,
}

/// Per-title behavior switches
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompatConfig {
    /// Play a LinearIncrease sustain as LinearDecrease
    #[serde(default)]
    pub linear_sustain_increase_as_decrease: bool,
}

/// Initial effect bus settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EffectConfig {
    /// Reverb preset, -1 for off
    #[serde(rename = "type", default = "default_effect_type")]
    pub effect_type: i32,
    #[serde(default = "default_true")]
    pub dry: bool,
    #[serde(default)]
    pub wet: bool,
    #[serde(default)]
    pub left_volume: u32,
    #[serde(default)]
    pub right_volume: u32,
    #[serde(default)]
    pub delay: i32,
    #[serde(default)]
    pub feedback: i32,
}

fn default_grain_size() -> i32 { 256 }
fn default_max_voices() -> i32 { MAX_VOICES as i32 }
fn default_sample_rate() -> i32 { SAMPLE_RATE }
fn default_effect_type() -> i32 { -1 }
fn default_true() -> bool { true }

impl Default for SasConfig {
    fn default() -> Self {
        Self {
            grain_size: default_grain_size(),
            max_voices: default_max_voices(),
            output_mode: OutputMode::Mixed,
            sample_rate: default_sample_rate(),
            compat: CompatConfig::default(),
            effect: EffectConfig::default(),
        }
    }
}

impl Default for EffectConfig {
    fn default() -> Self {
        Self {
            effect_type: default_effect_type(),
            dry: true,
            wet: false,
            left_volume: 0,
            right_volume: 0,
            delay: 0,
            feedback: 0,
        }
    }
}

impl SasConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: SasConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Read and validate a config file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Apply the same limits the console enforces at init and on the effect
    /// commands
    pub fn validate(&self) -> Result<(), SasError> {
        check_init_grain(self.grain_size)?;
        if !(1..=MAX_VOICES as i32).contains(&self.max_voices) {
            return Err(SasError::InvalidMaxVoices(self.max_voices));
        }
        if self.sample_rate != SAMPLE_RATE {
            return Err(SasError::InvalidSampleRate(self.sample_rate));
        }

        let effect = &self.effect;
        check_effect_type(effect.effect_type)?;
        check_effect_params(effect.delay, effect.feedback)?;
        check_effect_volume(effect.left_volume, effect.right_volume)?;
        Ok(())
    }
}
