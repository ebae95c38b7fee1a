//! Guest memory access
//!
//! The engine never owns sample data. Voices hold guest addresses and pull
//! bytes through [`GuestMemory`] at mix time, so a host can hand the mixer its
//! emulated RAM directly. [`FlatMemory`] is a simple contiguous implementation
//! for tools and tests.

use byteorder::{ByteOrder, LittleEndian};

/// Emulated address space the mixer reads sources from and writes output to
pub trait GuestMemory {
    /// Whether `[addr, addr + len)` is entirely backed by memory
    fn is_valid_range(&self, addr: u32, len: u32) -> bool;

    /// Copy bytes out of guest memory. Returns false (leaving `out` untouched)
    /// if the range is invalid.
    fn read_bytes(&self, addr: u32, out: &mut [u8]) -> bool;

    /// Copy bytes into guest memory. Returns false if the range is invalid.
    fn write_bytes(&mut self, addr: u32, data: &[u8]) -> bool;

    /// Whether a single byte at `addr` is backed by memory
    fn is_valid_address(&self, addr: u32) -> bool {
        self.is_valid_range(addr, 1)
    }

    /// Read little-endian 16-bit samples into `out`
    fn read_i16_slice(&self, addr: u32, out: &mut [i16]) -> bool {
        let mut bytes = vec![0u8; out.len() * 2];
        if !self.read_bytes(addr, &mut bytes) {
            return false;
        }
        LittleEndian::read_i16_into(&bytes, out);
        true
    }

    /// Write little-endian 16-bit samples
    fn write_i16_slice(&mut self, addr: u32, samples: &[i16]) -> bool {
        let mut bytes = vec![0u8; samples.len() * 2];
        LittleEndian::write_i16_into(samples, &mut bytes);
        self.write_bytes(addr, &bytes)
    }

    /// Write a little-endian 32-bit word
    fn write_u32(&mut self, addr: u32, value: u32) -> bool {
        let mut bytes = [0u8; 4];
        LittleEndian::write_u32(&mut bytes, value);
        self.write_bytes(addr, &bytes)
    }

    /// Read a little-endian 32-bit word
    fn read_u32(&self, addr: u32) -> Option<u32> {
        let mut bytes = [0u8; 4];
        self.read_bytes(addr, &mut bytes)
            .then(|| LittleEndian::read_u32(&bytes))
    }
}

/// Contiguous guest memory starting at a base address
///
/// Address 0 is never valid unless `base` is 0, matching consoles whose RAM
/// is mapped well above the null page.
#[derive(Debug, Clone)]
pub struct FlatMemory {
    base: u32,
    data: Vec<u8>,
}

impl FlatMemory {
    /// Conventional user RAM base on the target console
    pub const DEFAULT_BASE: u32 = 0x0880_0000;

    /// Create zero-filled memory of `size` bytes mapped at `base`
    pub fn new(base: u32, size: usize) -> Self {
        Self {
            base,
            data: vec![0; size],
        }
    }

    /// First mapped address
    pub fn base(&self) -> u32 {
        self.base
    }

    /// Mapped size in bytes
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether no bytes are mapped
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Copy `bytes` to `addr`, returning false if it does not fit
    pub fn load(&mut self, addr: u32, bytes: &[u8]) -> bool {
        self.write_bytes(addr, bytes)
    }

    fn offset(&self, addr: u32, len: usize) -> Option<usize> {
        let start = addr.checked_sub(self.base)? as usize;
        let end = start.checked_add(len)?;
        (end <= self.data.len()).then_some(start)
    }
}

impl GuestMemory for FlatMemory {
    fn is_valid_range(&self, addr: u32, len: u32) -> bool {
        self.offset(addr, len as usize).is_some()
    }

    fn read_bytes(&self, addr: u32, out: &mut [u8]) -> bool {
        match self.offset(addr, out.len()) {
            Some(start) => {
                out.copy_from_slice(&self.data[start..start + out.len()]);
                true
            }
            None => false,
        }
    }

    fn write_bytes(&mut self, addr: u32, data: &[u8]) -> bool {
        match self.offset(addr, data.len()) {
            Some(start) => {
                self.data[start..start + data.len()].copy_from_slice(data);
                true
            }
            None => false,
        }
    }
}
