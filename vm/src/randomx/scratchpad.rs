//! RandomX Scratchpad and Dataset
//!
//! The scratchpad is private to one hash instance and is reached through
//! three aliasing windows (L1, L2, L3) that all start at offset 0. The
//! dataset is one read-only table shared by every instance.

use std::sync::Arc;

use crate::randomx::blake2b::{fill_counter_mode, Blake2Generator};
use crate::randomx::config::*;
use crate::randomx::error::{Error, Result};

/// Scratchpad window selected by a memory instruction
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Window {
    L1 = 1,
    L2 = 2,
    L3 = 3,
}

impl Window {
    /// log2 of the window size
    pub fn bits(self) -> u32 {
        match self {
            Window::L1 => 14,
            Window::L2 => 18,
            Window::L3 => 21,
        }
    }

    pub fn size(self) -> usize {
        1 << self.bits()
    }

    /// Right shift turning `u32::MAX` into the window mask
    pub fn mask_shift(self) -> u32 {
        32 - self.bits()
    }

    pub fn from_mask_shift(shift: u32) -> Option<Self> {
        match shift {
            18 => Some(Window::L1),
            14 => Some(Window::L2),
            11 => Some(Window::L3),
            _ => None,
        }
    }

    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            1 => Some(Window::L1),
            2 => Some(Window::L2),
            3 => Some(Window::L3),
            _ => None,
        }
    }

    /// Byte address of an 8-byte operand: `base + imm`, wrapped to the
    /// window and aligned down to 8 bytes.
    pub fn address(self, base: u64, imm: u32) -> usize {
        let addr = (base as u32).wrapping_add(imm) & (u32::MAX >> self.mask_shift());
        (addr & !7) as usize
    }
}

/// Private read/write memory of one hash instance
#[derive(Clone, PartialEq, Eq)]
pub struct Scratchpad {
    memory: Vec<u8>,
}

impl Scratchpad {
    /// Zero-filled scratchpad
    pub fn new() -> Self {
        Self {
            memory: vec![0u8; RANDOMX_SCRATCHPAD_L3],
        }
    }

    pub fn from_bytes(memory: Vec<u8>) -> Result<Self> {
        if memory.len() != RANDOMX_SCRATCHPAD_L3 {
            return Err(Error::ScratchpadLength {
                expected: RANDOMX_SCRATCHPAD_L3,
                actual: memory.len(),
            });
        }
        Ok(Self { memory })
    }

    /// Deterministic contents for instance `nonce` of a seeded batch.
    /// Stands in for the AES fill that precedes the VM in real RandomX.
    pub fn from_seed(seed: &[u8], nonce: u64) -> Self {
        let mut memory = vec![0u8; RANDOMX_SCRATCHPAD_L3];
        Blake2Generator::new(seed, nonce ^ 0x5350_4144).fill_bytes(&mut memory);
        Self { memory }
    }

    /// Read 64-bit value; `addr` must be 8-byte aligned and inside L3
    pub fn read_u64(&self, addr: usize) -> u64 {
        debug_assert_eq!(addr & 7, 0);
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&self.memory[addr..addr + 8]);
        u64::from_le_bytes(bytes)
    }

    /// Write 64-bit value; `addr` must be 8-byte aligned and inside L3
    pub fn write_u64(&mut self, addr: usize, value: u64) {
        debug_assert_eq!(addr & 7, 0);
        self.memory[addr..addr + 8].copy_from_slice(&value.to_le_bytes());
    }

    /// Read an 8-byte word as two signed 32-bit halves (low half first)
    pub fn read_i32x2(&self, addr: usize) -> [i32; 2] {
        let word = self.read_u64(addr);
        [word as u32 as i32, (word >> 32) as u32 as i32]
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.memory
    }
}

impl Default for Scratchpad {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Scratchpad {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Scratchpad({} bytes)", self.memory.len())
    }
}

/// Shared read-only dataset
///
/// A full table is `RANDOMX_DATASET_BASE_SIZE + RANDOMX_DATASET_EXTRA_SIZE`
/// bytes. Smaller tables are accepted for testing; offsets then wrap modulo
/// the table length, which is a whole number of cache lines.
#[derive(Clone)]
pub struct Dataset {
    memory: Arc<Vec<u8>>,
}

impl Dataset {
    pub fn from_bytes(memory: Vec<u8>) -> Result<Self> {
        if memory.is_empty() || memory.len() % CACHE_LINE_SIZE != 0 {
            return Err(Error::DatasetLength(memory.len()));
        }
        Ok(Self {
            memory: Arc::new(memory),
        })
    }

    /// Synthetic table of `len` bytes filled from a seed
    pub fn from_seed(seed: &[u8], len: usize) -> Result<Self> {
        if len == 0 || len % CACHE_LINE_SIZE != 0 {
            return Err(Error::DatasetLength(len));
        }
        let mut memory = vec![0u8; len];
        fill_counter_mode(seed, &mut memory);
        Self::from_bytes(memory)
    }

    /// Full-size table length
    pub fn full_size() -> usize {
        RANDOMX_DATASET_BASE_SIZE + RANDOMX_DATASET_EXTRA_SIZE
    }

    pub fn len(&self) -> usize {
        self.memory.len()
    }

    pub fn is_empty(&self) -> bool {
        self.memory.is_empty()
    }

    /// Read one 64-byte cache line as eight words
    pub fn read_line(&self, offset: u64) -> [u64; 8] {
        let start = (offset % self.memory.len() as u64) as usize & !(CACHE_LINE_SIZE - 1);
        let line = &self.memory[start..start + CACHE_LINE_SIZE];
        core::array::from_fn(|i| {
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(&line[i * 8..i * 8 + 8]);
            u64::from_le_bytes(bytes)
        })
    }
}

impl std::fmt::Debug for Dataset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Dataset({} bytes)", self.memory.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_masks() {
        assert_eq!(Window::L1.address(0, 16383), 16376);
        assert_eq!(Window::L1.address(16384, 8), 8);
        assert_eq!(Window::L2.address(u64::MAX, 1), 0);
        assert_eq!(Window::L3.address(0x1234_5678_FFFF_FFFF, 0), RANDOMX_SCRATCHPAD_L3 - 8);
        // only the low 32 bits of the register take part
        assert_eq!(Window::L3.address(0xFFFF_0000_0000_0010, 0), 16);
    }

    #[test]
    fn mask_shift_round_trips() {
        for window in [Window::L1, Window::L2, Window::L3] {
            assert_eq!(Window::from_mask_shift(window.mask_shift()), Some(window));
            assert_eq!(Window::from_code(window as u32), Some(window));
            assert_eq!(u32::MAX >> window.mask_shift(), window.size() as u32 - 1);
        }
    }

    #[test]
    fn read_write_words() {
        let mut sp = Scratchpad::new();
        sp.write_u64(64, 0x8000_0001_FFFF_FFFE);
        assert_eq!(sp.read_u64(64), 0x8000_0001_FFFF_FFFE);
        assert_eq!(sp.read_i32x2(64), [-2, i32::MIN + 1]);
    }

    #[test]
    fn scratchpad_length_is_checked() {
        assert!(Scratchpad::from_bytes(vec![0; 1024]).is_err());
    }

    #[test]
    fn dataset_wraps_small_tables() {
        let dataset = Dataset::from_seed(b"dataset", 4 * 64).unwrap();
        assert_eq!(dataset.read_line(0), dataset.read_line(4 * 64));
        assert_eq!(dataset.read_line(64), dataset.read_line(5 * 64 + 3));
        assert_ne!(dataset.read_line(0), dataset.read_line(64));
        assert!(Dataset::from_bytes(vec![0; 100]).is_err());
    }
}
