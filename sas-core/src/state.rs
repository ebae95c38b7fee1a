//! Versioned engine snapshots
//!
//! Every stateful component implements [`DoState`] and walks its fields, in a
//! fixed order, through a [`StateVisitor`]. The same code path serves both
//! directions: in write mode each visited field is appended to the output, in
//! read mode it is overwritten from the input.
//!
//! # Format
//!
//! ```text
//! Section marker:
//!   name length (u8) + name bytes (ASCII) + version (u16 LE)
//!
//! Fields:
//!   fixed-width little-endian integers, bool as one byte
//! ```
//!
//! Each section declares a minimum and a current version. Readers accept any
//! version in that range and fill defaults for fields added after the stored
//! version, so old snapshots keep loading as components grow.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io;

/// Component that can save and restore itself through a [`StateVisitor`]
pub trait DoState {
    /// Visit every persisted field in order
    fn do_state(&mut self, p: &mut StateVisitor<'_>);
}

/// Fixed-width value that can appear in a snapshot
pub trait StateValue: Sized {
    /// Append the encoded value
    fn write_to(&self, out: &mut Vec<u8>) -> io::Result<()>;
    /// Decode a value, advancing `input`
    fn read_from(input: &mut &[u8]) -> io::Result<Self>;
}

macro_rules! impl_state_value {
    ($ty:ty, $read:ident, $write:ident) => {
        impl StateValue for $ty {
            fn write_to(&self, out: &mut Vec<u8>) -> io::Result<()> {
                out.$write::<LittleEndian>(*self)
            }
            fn read_from(input: &mut &[u8]) -> io::Result<Self> {
                input.$read::<LittleEndian>()
            }
        }
    };
}

impl_state_value!(u16, read_u16, write_u16);
impl_state_value!(i16, read_i16, write_i16);
impl_state_value!(u32, read_u32, write_u32);
impl_state_value!(i32, read_i32, write_i32);
impl_state_value!(u64, read_u64, write_u64);
impl_state_value!(i64, read_i64, write_i64);

impl StateValue for u8 {
    fn write_to(&self, out: &mut Vec<u8>) -> io::Result<()> {
        out.write_u8(*self)
    }
    fn read_from(input: &mut &[u8]) -> io::Result<Self> {
        input.read_u8()
    }
}

impl StateValue for bool {
    fn write_to(&self, out: &mut Vec<u8>) -> io::Result<()> {
        out.write_u8(*self as u8)
    }
    fn read_from(input: &mut &[u8]) -> io::Result<Self> {
        Ok(input.read_u8()? != 0)
    }
}

/// Errors raised while saving or loading a snapshot
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SnapshotError {
    /// Input ended in the middle of a section
    #[error("snapshot truncated in section {0}")]
    Truncated(&'static str),

    /// Section marker does not match the component being restored
    #[error("expected section {expected}, found {found:?}")]
    SectionMismatch {
        expected: &'static str,
        found: String,
    },

    /// Stored section version is outside the supported range
    #[error("section {section} version {version} unsupported (supported {min}-{max})")]
    UnsupportedVersion {
        section: &'static str,
        version: u16,
        min: u16,
        max: u16,
    },

    /// A field holds a value the engine cannot accept
    #[error("invalid {field} in snapshot: {value}")]
    InvalidValue { field: &'static str, value: i64 },

    /// Bytes left over after the last section
    #[error("{0} trailing bytes after snapshot")]
    TrailingData(usize),

    /// Encoding failed
    #[error("failed to encode snapshot: {0}")]
    Encode(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Read,
    Write,
}

/// Ordered field visitor over a snapshot byte stream
///
/// Errors are sticky: after the first failure every further visit is a no-op
/// and sections report `None`, so `do_state` bodies never need to branch on
/// I/O results. The error surfaces from [`StateVisitor::finish`] or
/// [`StateVisitor::into_bytes`].
pub struct StateVisitor<'a> {
    mode: Mode,
    output: Vec<u8>,
    input: &'a [u8],
    section: &'static str,
    error: Option<SnapshotError>,
}

impl StateVisitor<'static> {
    /// Create a visitor that records visited fields
    pub fn writer() -> Self {
        Self {
            mode: Mode::Write,
            output: Vec::new(),
            input: &[],
            section: "",
            error: None,
        }
    }
}

impl<'a> StateVisitor<'a> {
    /// Create a visitor that restores visited fields from `data`
    pub fn reader(data: &'a [u8]) -> Self {
        Self {
            mode: Mode::Read,
            output: Vec::new(),
            input: data,
            section: "",
            error: None,
        }
    }

    /// Whether fields are being restored rather than saved
    pub fn is_reading(&self) -> bool {
        self.mode == Mode::Read
    }

    /// Whether an error has been recorded
    pub fn has_failed(&self) -> bool {
        self.error.is_some()
    }

    /// Record an error; only the first one is kept
    pub fn fail(&mut self, error: SnapshotError) {
        if self.error.is_none() {
            self.error = Some(error);
        }
    }

    /// Open a section
    ///
    /// Returns the version to follow: `current` when writing, the stored
    /// version when reading. Returns `None` if the section cannot be visited,
    /// in which case the caller must skip its fields.
    pub fn section(&mut self, name: &'static str, min: u16, current: u16) -> Option<u16> {
        if self.has_failed() {
            return None;
        }
        self.section = name;

        match self.mode {
            Mode::Write => {
                let mut name_len = name.len() as u8;
                self.visit(&mut name_len);
                self.output.extend_from_slice(name.as_bytes());
                let mut version = current;
                self.visit(&mut version);
                (!self.has_failed()).then_some(current)
            }
            Mode::Read => {
                let mut name_len = 0u8;
                self.visit(&mut name_len);
                let len = name_len as usize;
                if self.has_failed() || self.input.len() < len {
                    self.fail(SnapshotError::Truncated(name));
                    return None;
                }
                let (found, rest) = self.input.split_at(len);
                self.input = rest;
                if found != name.as_bytes() {
                    self.fail(SnapshotError::SectionMismatch {
                        expected: name,
                        found: String::from_utf8_lossy(found).into_owned(),
                    });
                    return None;
                }

                let mut version = 0u16;
                self.visit(&mut version);
                if self.has_failed() {
                    return None;
                }
                if version < min || version > current {
                    self.fail(SnapshotError::UnsupportedVersion {
                        section: name,
                        version,
                        min,
                        max: current,
                    });
                    return None;
                }
                Some(version)
            }
        }
    }

    /// Save or restore a single value
    pub fn visit<T: StateValue>(&mut self, value: &mut T) {
        if self.has_failed() {
            return;
        }
        match self.mode {
            Mode::Write => {
                if let Err(e) = value.write_to(&mut self.output) {
                    self.fail(SnapshotError::Encode(e.to_string()));
                }
            }
            Mode::Read => match T::read_from(&mut self.input) {
                Ok(v) => *value = v,
                Err(_) => self.fail(SnapshotError::Truncated(self.section)),
            },
        }
    }

    /// Save or restore every element of a fixed-length slice
    pub fn visit_slice<T: StateValue>(&mut self, values: &mut [T]) {
        for value in values {
            self.visit(value);
        }
    }

    /// Finish a read, rejecting unread input
    pub fn finish(self) -> Result<(), SnapshotError> {
        if let Some(error) = self.error {
            return Err(error);
        }
        if self.mode == Mode::Read && !self.input.is_empty() {
            return Err(SnapshotError::TrailingData(self.input.len()));
        }
        Ok(())
    }

    /// Finish a write, returning the encoded snapshot
    pub fn into_bytes(self) -> Result<Vec<u8>, SnapshotError> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(self.output),
        }
    }
}
