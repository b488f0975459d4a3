//! VM state
//!
//! One `VmState` per hash instance. The scheduler fills it from a decoded
//! program; the interpreter mutates it in place across batches of rounds.
//!
//! The persisted form is a 2048-byte buffer:
//!
//! | bytes       | contents                                              |
//! |-------------|-------------------------------------------------------|
//! | 0..64       | integer registers r0-r7                               |
//! | 64..128     | group F                                               |
//! | 128..192    | program configuration (ma, mx, read registers, lanes) |
//! | 192..256    | group A                                               |
//! | 256..1024   | 192 immediates                                        |
//! | 1024..2048  | 256 compiled words                                    |
//!
//! Group E is rebuilt from the scratchpad every round, so its region carries
//! the configuration between batches instead.

use serde::{Deserialize, Serialize};
use serde_big_array::BigArray;

use crate::randomx::config::*;
use crate::randomx::encoding::CompiledInstruction;
use crate::randomx::error::{Error, Result};
use crate::randomx::program::Program;
use crate::randomx::softfloat::RoundingMode;

const F_OFFSET: usize = 64;
const CONFIG_OFFSET: usize = 128;
const A_OFFSET: usize = 192;

/// Memory address configuration
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Dataset read offset for the current round
    pub ma: u32,
    /// Dataset offset prepared for the next round
    pub mx: u32,
    /// Registers mixed into scratchpad (0, 1) and dataset (2, 3) addresses
    pub read_reg: [u8; 4],
    /// Cache-line offset of this program's dataset window
    pub dataset_offset: u32,
}

impl MemoryConfig {
    /// Read registers as byte offsets into the register file, one per byte
    pub fn read_reg_offsets(&self) -> u32 {
        self.read_reg
            .iter()
            .enumerate()
            .fold(0u32, |acc, (i, &reg)| acc | ((reg as u32 * 8) << (i * 8)))
    }

    fn from_read_reg_offsets(word: u32) -> [u8; 4] {
        core::array::from_fn(|i| (((word >> (i * 8)) & 0xFF) / 8) as u8 & 7)
    }
}

/// Configuration for E register exponents
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ERegisterConfig {
    /// OR-masks for the low and high lane of every E register
    pub mask: [u64; 2],
}

/// Compiled program: packed words plus the immediate side buffer
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompiledProgram {
    #[serde(with = "BigArray")]
    pub imm: [u32; IMM_BUF_CAPACITY],
    #[serde(with = "BigArray")]
    pub words: [u32; COMPILED_PROGRAM_CAPACITY],
    /// Number of valid words
    pub len: u32,
    /// Lane count the words were scheduled for
    pub workers: WorkersPerHash,
}

impl Default for CompiledProgram {
    fn default() -> Self {
        Self {
            imm: [0; IMM_BUF_CAPACITY],
            words: [0; COMPILED_PROGRAM_CAPACITY],
            len: 0,
            workers: WorkersPerHash::default(),
        }
    }
}

impl CompiledProgram {
    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Compiled word at `ip`
    pub fn word(&self, ip: usize) -> CompiledInstruction {
        assert!(ip < self.len(), "compiled word {ip} out of {}", self.len);
        CompiledInstruction::from_bits(self.words[ip])
    }

    pub fn imm32(&self, index: usize) -> u32 {
        self.imm[index]
    }

    /// Two consecutive immediates as one little-endian 64-bit value
    pub fn imm64(&self, index: usize) -> u64 {
        self.imm[index] as u64 | ((self.imm[index + 1] as u64) << 32)
    }
}

/// Full VM state
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmState {
    /// Integer registers
    pub r: [u64; RANDOMX_INT_REGISTER_COUNT],
    /// Group F as IEEE-754 bits, pair `i` in lanes `2i` and `2i + 1`
    pub f: [u64; 8],
    /// Group E as IEEE-754 bits
    pub e: [u64; 8],
    /// Group A as IEEE-754 bits (read-only)
    pub a: [u64; 8],
    pub mem: MemoryConfig,
    pub e_config: ERegisterConfig,
    pub program: CompiledProgram,
    /// Current rounding mode
    pub rounding_mode: RoundingMode,
}

impl VmState {
    /// Fresh state for a decoded program and its compiled form
    pub fn new(program: &Program, compiled: CompiledProgram) -> Self {
        Self {
            r: [0; RANDOMX_INT_REGISTER_COUNT],
            f: [0; 8],
            e: [0; 8],
            a: program.a_registers(),
            mem: program.memory_config(),
            e_config: program.e_config(),
            program: compiled,
            rounding_mode: RoundingMode::NearestEven,
        }
    }

    /// Serialize to the 2048-byte layout
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = vec![0u8; VM_STATE_SIZE];
        put_words(&mut out[..F_OFFSET], &self.r);
        put_words(&mut out[F_OFFSET..CONFIG_OFFSET], &self.f);
        put_words(&mut out[A_OFFSET..REGISTERS_SIZE], &self.a);

        let config = &mut out[CONFIG_OFFSET..A_OFFSET];
        config[0..4].copy_from_slice(&self.mem.ma.to_le_bytes());
        config[4..8].copy_from_slice(&self.mem.mx.to_le_bytes());
        config[8..12].copy_from_slice(&self.mem.read_reg_offsets().to_le_bytes());
        config[12..16].copy_from_slice(&self.mem.dataset_offset.to_le_bytes());
        config[16..24].copy_from_slice(&self.e_config.mask[0].to_le_bytes());
        config[24..32].copy_from_slice(&self.e_config.mask[1].to_le_bytes());
        config[32..36].copy_from_slice(&self.program.len.to_le_bytes());
        config[36..40].copy_from_slice(&u32::from(self.program.workers).to_le_bytes());

        let imm = &mut out[REGISTERS_SIZE..REGISTERS_SIZE + IMM_BUF_SIZE];
        for (chunk, value) in imm.chunks_exact_mut(4).zip(self.program.imm.iter()) {
            chunk.copy_from_slice(&value.to_le_bytes());
        }
        let words = &mut out[REGISTERS_SIZE + IMM_BUF_SIZE..];
        for (chunk, value) in words.chunks_exact_mut(4).zip(self.program.words.iter()) {
            chunk.copy_from_slice(&value.to_le_bytes());
        }
        out
    }

    /// Parse the 2048-byte layout. Group E is not persisted and comes back
    /// zeroed; the rounding mode is carried separately.
    pub fn from_bytes(bytes: &[u8], rounding_mode: RoundingMode) -> Result<Self> {
        if bytes.len() != VM_STATE_SIZE {
            return Err(Error::StateLength {
                expected: VM_STATE_SIZE,
                actual: bytes.len(),
            });
        }

        let config = &bytes[CONFIG_OFFSET..A_OFFSET];
        let len = read_u32(config, 32);
        if len as usize > COMPILED_PROGRAM_CAPACITY {
            return Err(Error::ProgramLength(len));
        }

        let workers = WorkersPerHash::try_from(read_u32(config, 36))?;

        let mut program = CompiledProgram {
            len,
            workers,
            ..CompiledProgram::default()
        };
        let imm = &bytes[REGISTERS_SIZE..REGISTERS_SIZE + IMM_BUF_SIZE];
        for (i, value) in program.imm.iter_mut().enumerate() {
            *value = read_u32(imm, i * 4);
        }
        let words = &bytes[REGISTERS_SIZE + IMM_BUF_SIZE..];
        for (i, value) in program.words.iter_mut().enumerate() {
            *value = read_u32(words, i * 4);
        }

        Ok(Self {
            r: get_words(&bytes[..F_OFFSET]),
            f: get_words(&bytes[F_OFFSET..CONFIG_OFFSET]),
            e: [0; 8],
            a: get_words(&bytes[A_OFFSET..REGISTERS_SIZE]),
            mem: MemoryConfig {
                ma: read_u32(config, 0),
                mx: read_u32(config, 4),
                read_reg: MemoryConfig::from_read_reg_offsets(read_u32(config, 8)),
                dataset_offset: read_u32(config, 12),
            },
            e_config: ERegisterConfig {
                mask: [read_u64(config, 16), read_u64(config, 24)],
            },
            program,
            rounding_mode,
        })
    }

    /// Final register values handed to the hash finisher
    pub fn output(&self) -> VmOutput {
        VmOutput {
            r: self.r,
            fe: core::array::from_fn(|i| self.f[i] ^ self.e[i]),
            e: self.e,
        }
    }
}

/// Registers emitted after the last round
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmOutput {
    pub r: [u64; 8],
    /// Group F xor group E
    pub fe: [u64; 8],
    pub e: [u64; 8],
}

impl VmOutput {
    pub const SIZE: usize = 192;

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        put_words(&mut out[..64], &self.r);
        put_words(&mut out[64..128], &self.fe);
        put_words(&mut out[128..], &self.e);
        out
    }
}

fn put_words(dst: &mut [u8], words: &[u64; 8]) {
    for (chunk, word) in dst.chunks_exact_mut(8).zip(words.iter()) {
        chunk.copy_from_slice(&word.to_le_bytes());
    }
}

fn get_words(src: &[u8]) -> [u64; 8] {
    core::array::from_fn(|i| read_u64(src, i * 8))
}

fn read_u32(src: &[u8], offset: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&src[offset..offset + 4]);
    u32::from_le_bytes(bytes)
}

fn read_u64(src: &[u8], offset: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&src[offset..offset + 8]);
    u64::from_le_bytes(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::randomx::program::EntropyBuffer;

    fn sample_state() -> VmState {
        let program = Program::decode(&EntropyBuffer::from_seed(b"state", 0));
        let mut compiled = CompiledProgram::default();
        compiled.imm[0] = 0x1111_2222;
        compiled.imm[191] = 0x3333_4444;
        compiled.words[0] = 0x0400_0001;
        compiled.words[255] = 0xFFFF_FFFF;
        compiled.len = 256;
        let mut state = VmState::new(&program, compiled);
        state.r = core::array::from_fn(|i| (i as u64) << 40 | 7);
        state.f = core::array::from_fn(|i| 1.5f64.powi(i as i32).to_bits());
        state
    }

    #[test]
    fn layout_offsets() {
        let state = sample_state();
        let bytes = state.to_bytes();
        assert_eq!(bytes.len(), VM_STATE_SIZE);
        assert_eq!(read_u64(&bytes, 8), state.r[1]);
        assert_eq!(read_u64(&bytes, 64), state.f[0]);
        assert_eq!(read_u32(&bytes, 128), state.mem.ma);
        assert_eq!(read_u32(&bytes, 132), state.mem.mx);
        assert_eq!(read_u64(&bytes, 144), state.e_config.mask[0]);
        assert_eq!(read_u32(&bytes, 160), 256);
        assert_eq!(read_u32(&bytes, 164), 8);
        assert_eq!(read_u64(&bytes, 192), state.a[0]);
        assert_eq!(read_u32(&bytes, 256), 0x1111_2222);
        assert_eq!(read_u32(&bytes, 1020), 0x3333_4444);
        assert_eq!(read_u32(&bytes, 1024), 0x0400_0001);
        assert_eq!(read_u32(&bytes, 2044), 0xFFFF_FFFF);
    }

    #[test]
    fn read_registers_are_byte_offsets() {
        let mem = MemoryConfig {
            read_reg: [1, 2, 5, 6],
            ..MemoryConfig::default()
        };
        assert_eq!(mem.read_reg_offsets(), 8 | (16 << 8) | (40 << 16) | (48 << 24));
        assert_eq!(MemoryConfig::from_read_reg_offsets(mem.read_reg_offsets()), [1, 2, 5, 6]);
    }

    #[test]
    fn bytes_round_trip() {
        let state = sample_state();
        let parsed = VmState::from_bytes(&state.to_bytes(), RoundingMode::TowardZero).unwrap();
        assert_eq!(parsed.r, state.r);
        assert_eq!(parsed.f, state.f);
        assert_eq!(parsed.a, state.a);
        assert_eq!(parsed.mem, state.mem);
        assert_eq!(parsed.e_config, state.e_config);
        assert_eq!(parsed.program, state.program);
        assert_eq!(parsed.rounding_mode, RoundingMode::TowardZero);
    }

    #[test]
    fn rejects_bad_lengths() {
        assert!(VmState::from_bytes(&[0u8; 100], RoundingMode::NearestEven).is_err());
        let mut bytes = sample_state().to_bytes();
        bytes[160..164].copy_from_slice(&300u32.to_le_bytes());
        assert!(matches!(
            VmState::from_bytes(&bytes, RoundingMode::NearestEven),
            Err(Error::ProgramLength(300))
        ));
    }

    #[test]
    fn lane_count_persists() {
        let mut state = sample_state();
        state.program.workers = WorkersPerHash::Two;
        let parsed = VmState::from_bytes(&state.to_bytes(), RoundingMode::NearestEven).unwrap();
        assert_eq!(parsed.program.workers, WorkersPerHash::Two);

        let mut bytes = state.to_bytes();
        bytes[164..168].copy_from_slice(&3u32.to_le_bytes());
        assert!(matches!(
            VmState::from_bytes(&bytes, RoundingMode::NearestEven),
            Err(Error::WorkersPerHash(3))
        ));
    }

    #[test]
    fn output_layout() {
        let mut state = sample_state();
        state.e = [0xFF; 8];
        let out = state.output();
        assert_eq!(out.fe[0], state.f[0] ^ 0xFF);
        let bytes = out.to_bytes();
        assert_eq!(read_u64(&bytes, 0), state.r[0]);
        assert_eq!(read_u64(&bytes, 64), out.fe[0]);
        assert_eq!(read_u64(&bytes, 128), 0xFF);
    }
}
