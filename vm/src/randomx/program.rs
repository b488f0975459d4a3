//! RandomX Program Decoding
//!
//! An entropy buffer holds 16 seed words followed by 256 raw instructions of
//! 8 bytes each. Decoding is a pure transform: the seed words become the
//! group A registers and the address configuration, the rest becomes the
//! instruction list.

use crate::randomx::blake2b::Blake2Generator;
use crate::randomx::config::*;
use crate::randomx::error::{Error, Result};
use crate::randomx::state::{ERegisterConfig, MemoryConfig};

/// A single raw instruction
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Instruction {
    /// Class selected through the frequency table
    pub opcode: Opcode,
    /// Destination register (0-7)
    pub dst: u8,
    /// Source register (0-7)
    pub src: u8,
    /// Modifier byte (shift, window and condition bits)
    pub mod_val: u8,
    /// 32-bit immediate value
    pub imm: u32,
}

impl Instruction {
    pub fn new(opcode: Opcode, dst: u8, src: u8, mod_val: u8, imm: u32) -> Self {
        Self {
            opcode,
            dst: dst & 7,
            src: src & 7,
            mod_val,
            imm,
        }
    }

    /// Create an instruction from its raw bytes
    pub fn from_bytes(bytes: &[u8; RAW_INSTRUCTION_SIZE]) -> Self {
        Self {
            opcode: opcode_from_byte(bytes[0]),
            dst: bytes[1] & 0x07,
            src: bytes[2] & 0x07,
            mod_val: bytes[3],
            imm: u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
        }
    }

    /// Raw bytes using the first opcode byte of the class
    pub fn to_bytes(&self) -> [u8; RAW_INSTRUCTION_SIZE] {
        let imm = self.imm.to_le_bytes();
        [
            self.opcode.first_byte(),
            self.dst,
            self.src,
            self.mod_val,
            imm[0],
            imm[1],
            imm[2],
            imm[3],
        ]
    }

    /// `ISWAP_R r0, r0`, which never reaches the compiled program
    pub fn nop() -> Self {
        Self::new(Opcode::ISWAP_R, 0, 0, 0, 0)
    }

    /// Shift amount for IADD_RS
    pub fn mod_shift(&self) -> u32 {
        ((self.mod_val >> 2) % 4) as u32
    }

    /// Non-zero selects L1, zero selects L2
    pub fn mod_mem(&self) -> u8 {
        self.mod_val % 4
    }

    /// Condition selector for CBRANCH and the L3 test for ISTORE
    pub fn mod_cond(&self) -> u8 {
        self.mod_val >> 4
    }

    /// Immediate sign-extended to 64 bits
    pub fn imm_i64(&self) -> u64 {
        self.imm as i32 as i64 as u64
    }
}

/// Host-provided entropy for one VM instance
#[derive(Clone, PartialEq, Eq)]
pub struct EntropyBuffer {
    bytes: Vec<u8>,
}

impl EntropyBuffer {
    /// Wrap raw bytes, checking the fixed layout size
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != ENTROPY_SIZE {
            return Err(Error::EntropyLength {
                expected: ENTROPY_SIZE,
                actual: bytes.len(),
            });
        }
        Ok(Self {
            bytes: bytes.to_vec(),
        })
    }

    /// Deterministic entropy for instance `nonce` of a seeded batch
    pub fn from_seed(seed: &[u8], nonce: u64) -> Self {
        let mut bytes = vec![0u8; ENTROPY_SIZE];
        Blake2Generator::new(seed, nonce).fill_bytes(&mut bytes);
        Self { bytes }
    }

    /// Assemble a buffer from seed words and a prefix of instructions.
    /// Missing instructions are filled with `ISWAP_R r0, r0`.
    pub fn from_parts(entropy: &[u64; ENTROPY_SEED_WORDS], instructions: &[Instruction]) -> Self {
        assert!(instructions.len() <= RANDOMX_PROGRAM_SIZE);
        let mut bytes = Vec::with_capacity(ENTROPY_SIZE);
        for word in entropy {
            bytes.extend_from_slice(&word.to_le_bytes());
        }
        let nop = Instruction::nop();
        for i in 0..RANDOMX_PROGRAM_SIZE {
            let instr = instructions.get(i).unwrap_or(&nop);
            bytes.extend_from_slice(&instr.to_bytes());
        }
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

impl std::fmt::Debug for EntropyBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "EntropyBuffer({}..)", hex::encode(&self.bytes[..16]))
    }
}

/// A complete decoded program
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Program {
    pub instructions: [Instruction; RANDOMX_PROGRAM_SIZE],
    /// Seed words (16 x 64-bit values)
    pub entropy: [u64; ENTROPY_SEED_WORDS],
}

impl Program {
    /// Decode an entropy buffer
    pub fn decode(buffer: &EntropyBuffer) -> Self {
        let bytes = buffer.as_bytes();

        let mut entropy = [0u64; ENTROPY_SEED_WORDS];
        for (i, word) in entropy.iter_mut().enumerate() {
            let mut chunk = [0u8; 8];
            chunk.copy_from_slice(&bytes[i * 8..i * 8 + 8]);
            *word = u64::from_le_bytes(chunk);
        }

        let instructions = core::array::from_fn(|i| {
            let offset = ENTROPY_SEED_SIZE + i * RAW_INSTRUCTION_SIZE;
            let mut raw = [0u8; RAW_INSTRUCTION_SIZE];
            raw.copy_from_slice(&bytes[offset..offset + RAW_INSTRUCTION_SIZE]);
            Instruction::from_bytes(&raw)
        });

        Self {
            instructions,
            entropy,
        }
    }

    /// Group A values (four pairs, low lane first) as IEEE-754 bits
    pub fn a_registers(&self) -> [u64; 8] {
        core::array::from_fn(|i| small_positive_float_bits(self.entropy[i]))
    }

    /// Dataset and scratchpad address configuration
    pub fn memory_config(&self) -> MemoryConfig {
        let selector = self.entropy[12];
        MemoryConfig {
            ma: (self.entropy[8] as u32) & CACHE_LINE_ALIGN_MASK,
            mx: (self.entropy[10] as u32) & CACHE_LINE_ALIGN_MASK,
            read_reg: [
                (selector & 1) as u8,
                2 + ((selector >> 1) & 1) as u8,
                4 + ((selector >> 2) & 1) as u8,
                6 + ((selector >> 3) & 1) as u8,
            ],
            dataset_offset: ((self.entropy[13] & DATASET_EXTRA_ITEMS) as u32)
                * CACHE_LINE_SIZE as u32,
        }
    }

    /// Exponent masks for the low and high lanes of group E
    pub fn e_config(&self) -> ERegisterConfig {
        ERegisterConfig {
            mask: [float_mask(self.entropy[14]), float_mask(self.entropy[15])],
        }
    }
}

/// A positive double in [1, 2^32) built from a seed word
pub fn small_positive_float_bits(entropy: u64) -> u64 {
    let exponent = ((entropy >> 59) + EXPONENT_BIAS) & EXPONENT_MASK;
    (exponent << MANTISSA_SIZE) | (entropy & MANTISSA_MASK)
}

/// Fixed exponent of group E values, taken from the top seed bits
pub fn static_exponent(entropy: u64) -> u64 {
    let exponent = CONST_EXPONENT_BITS
        | ((entropy >> (64 - STATIC_EXPONENT_BITS)) << DYNAMIC_EXPONENT_BITS);
    exponent << MANTISSA_SIZE
}

/// OR-mask applied to every value loaded into group E
pub fn float_mask(entropy: u64) -> u64 {
    const MASK22: u64 = (1 << 22) - 1;
    (entropy & MASK22) | static_exponent(entropy)
}
