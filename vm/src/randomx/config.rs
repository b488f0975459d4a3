//! RandomX Configuration Constants
//!
//! Structural sizes, masks and the opcode frequency table of the VM variant
//! executed by this crate. The frequency table is fixed: every raw opcode
//! byte selects a class by cumulative-sum lookup in declaration order.

use serde::{Deserialize, Serialize};

use crate::randomx::error::{Error, Result};

/// Scratchpad L3 size: 2 MiB (the whole scratchpad)
pub const RANDOMX_SCRATCHPAD_L3: usize = 2097152;
/// L2 window size: 256 KiB
pub const RANDOMX_SCRATCHPAD_L2: usize = 262144;
/// L1 window size: 16 KiB
pub const RANDOMX_SCRATCHPAD_L1: usize = 16384;

/// Dataset base size: 2 GiB
pub const RANDOMX_DATASET_BASE_SIZE: usize = 2147483648;
/// Dataset extra size appended after the base table
pub const RANDOMX_DATASET_EXTRA_SIZE: usize = 33554368;
/// Number of extra cache lines a program may start its dataset window at
pub const DATASET_EXTRA_ITEMS: u64 = (RANDOMX_DATASET_EXTRA_SIZE / CACHE_LINE_SIZE) as u64;

/// Program size in instructions
pub const RANDOMX_PROGRAM_SIZE: usize = 256;
/// Number of program iterations
pub const RANDOMX_PROGRAM_ITERATIONS: usize = 2048;

/// Number of integer registers
pub const RANDOMX_INT_REGISTER_COUNT: usize = 8;
/// Number of floating point register pairs per group
pub const RANDOMX_FLOAT_REGISTER_COUNT: usize = 4;

/// Condition mask width for CBRANCH
pub const RANDOMX_JUMP_BITS: u32 = 8;
/// Lowest condition bit tested by CBRANCH
pub const RANDOMX_JUMP_OFFSET: u32 = 8;
/// Mask applied (shifted) to the condition register
pub const CONDITION_MASK: u32 = (1 << RANDOMX_JUMP_BITS) - 1;
/// ISTORE goes to L3 when `mod >> 4` reaches this value
pub const STORE_L3_CONDITION: u8 = 14;
/// IADD_RS into this register also adds the immediate
pub const REGISTER_NEEDS_DISPLACEMENT: u8 = 5;

/// Cache line size
pub const CACHE_LINE_SIZE: usize = 64;
/// Dataset offsets are cache-line aligned and stay inside the base table
pub const CACHE_LINE_ALIGN_MASK: u32 =
    ((RANDOMX_DATASET_BASE_SIZE - 1) & !(CACHE_LINE_SIZE - 1)) as u32;
/// 64-byte aligned mask for the whole scratchpad
pub const SCRATCHPAD_L3_MASK64: u32 = (RANDOMX_SCRATCHPAD_L3 - CACHE_LINE_SIZE) as u32;

/// Entropy buffer: 128 bytes of seed words followed by 256 raw instructions
pub const ENTROPY_SIZE: usize = ENTROPY_SEED_SIZE + RANDOMX_PROGRAM_SIZE * RAW_INSTRUCTION_SIZE;
/// Seed material at the head of the entropy buffer
pub const ENTROPY_SEED_SIZE: usize = 128;
/// Seed material as 64-bit words
pub const ENTROPY_SEED_WORDS: usize = ENTROPY_SEED_SIZE / 8;
/// Raw instruction size in bytes
pub const RAW_INSTRUCTION_SIZE: usize = 8;

/// VM state buffer size
pub const VM_STATE_SIZE: usize = 2048;
/// Register file region at the start of the VM state
pub const REGISTERS_SIZE: usize = 256;
/// Immediate buffer region following the registers
pub const IMM_BUF_SIZE: usize = 768;
/// Immediate buffer capacity in 32-bit entries
pub const IMM_BUF_CAPACITY: usize = IMM_BUF_SIZE / 4;
/// Compiled program region following the immediates
pub const COMPILED_PROGRAM_SIZE: usize = VM_STATE_SIZE - REGISTERS_SIZE - IMM_BUF_SIZE;
/// Compiled program capacity in 32-bit words
pub const COMPILED_PROGRAM_CAPACITY: usize = COMPILED_PROGRAM_SIZE / 4;

/// Hardware lanes serving one hash instance. Seeding and mixing always use
/// all of them; only the first `WorkersPerHash` lanes dispatch instructions.
pub const LANES_PER_HASH: usize = 8;

/// Mantissa size for float operations
pub const MANTISSA_SIZE: u32 = 52;
/// Mantissa mask
pub const MANTISSA_MASK: u64 = (1u64 << MANTISSA_SIZE) - 1;
/// Exponent size
pub const EXPONENT_SIZE: u32 = 11;
/// Exponent mask (unshifted)
pub const EXPONENT_MASK: u64 = (1u64 << EXPONENT_SIZE) - 1;
/// Exponent bias
pub const EXPONENT_BIAS: u64 = 1023;
/// Dynamic exponent bits kept from scratchpad data for group E
pub const DYNAMIC_EXPONENT_BITS: u32 = 4;
/// Static exponent bits taken from entropy for group E
pub const STATIC_EXPONENT_BITS: u32 = 4;
/// Fixed high exponent bits of group E values
pub const CONST_EXPONENT_BITS: u64 = 0x300;
/// Dynamic mantissa mask
pub const DYNAMIC_MANTISSA_MASK: u64 = (1u64 << (MANTISSA_SIZE + DYNAMIC_EXPONENT_BITS)) - 1;

/// FSCAL_R mask: flips the sign and the low exponent bits
pub const SCALE_MASK: u64 = 0x81F0000000000000;

/// Instruction classes, in frequency-table declaration order
#[allow(non_camel_case_types)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    IADD_RS = 0,
    IADD_M = 1,
    ISUB_R = 2,
    ISUB_M = 3,
    IMUL_R = 4,
    IMUL_M = 5,
    IMULH_R = 6,
    IMULH_M = 7,
    ISMULH_R = 8,
    ISMULH_M = 9,
    IMUL_RCP = 10,
    INEG_R = 11,
    IXOR_R = 12,
    IXOR_M = 13,
    IROR_R = 14,
    ISWAP_R = 15,
    FSWAP_R = 16,
    FADD_R = 17,
    FADD_M = 18,
    FSUB_R = 19,
    FSUB_M = 20,
    FSCAL_R = 21,
    FMUL_R = 22,
    FDIV_M = 23,
    FSQRT_R = 24,
    CBRANCH = 25,
    CFROUND = 26,
    ISTORE = 27,
}

impl Opcode {
    /// Whether the class operates on the floating register file.
    /// CFROUND only reads an integer register, so it is not floating.
    pub fn is_float(self) -> bool {
        use Opcode::*;
        matches!(
            self,
            FSWAP_R | FADD_R | FADD_M | FSUB_R | FSUB_M | FSCAL_R | FMUL_R | FDIV_M | FSQRT_R
        )
    }

    /// Whether the class reads the scratchpad
    pub fn is_memory_read(self) -> bool {
        use Opcode::*;
        matches!(
            self,
            IADD_M | ISUB_M | IMUL_M | IMULH_M | ISMULH_M | IXOR_M | FADD_M | FSUB_M | FDIV_M
        )
    }

    /// First opcode byte that decodes to this class
    pub fn first_byte(self) -> u8 {
        let mut start = 0u32;
        for &(opcode, freq) in INSTRUCTION_FREQUENCIES.iter() {
            if opcode == self {
                break;
            }
            start += freq as u32;
        }
        start as u8
    }
}

/// Instruction frequency table (out of 256, declaration order)
pub const INSTRUCTION_FREQUENCIES: [(Opcode, u8); 28] = [
    (Opcode::IADD_RS, 16),
    (Opcode::IADD_M, 7),
    (Opcode::ISUB_R, 16),
    (Opcode::ISUB_M, 7),
    (Opcode::IMUL_R, 16),
    (Opcode::IMUL_M, 4),
    (Opcode::IMULH_R, 4),
    (Opcode::IMULH_M, 1),
    (Opcode::ISMULH_R, 4),
    (Opcode::ISMULH_M, 1),
    (Opcode::IMUL_RCP, 8),
    (Opcode::INEG_R, 2),
    (Opcode::IXOR_R, 15),
    (Opcode::IXOR_M, 5),
    (Opcode::IROR_R, 10),
    (Opcode::ISWAP_R, 4),
    (Opcode::FSWAP_R, 4),
    (Opcode::FADD_R, 16),
    (Opcode::FADD_M, 5),
    (Opcode::FSUB_R, 16),
    (Opcode::FSUB_M, 5),
    (Opcode::FSCAL_R, 6),
    (Opcode::FMUL_R, 32),
    (Opcode::FDIV_M, 4),
    (Opcode::FSQRT_R, 6),
    (Opcode::CBRANCH, 25),
    (Opcode::CFROUND, 1),
    (Opcode::ISTORE, 16),
];

/// Get opcode from frequency byte
pub fn opcode_from_byte(byte: u8) -> Opcode {
    let mut remaining = byte as u32;
    for &(opcode, freq) in INSTRUCTION_FREQUENCIES.iter() {
        if remaining < freq as u32 {
            return opcode;
        }
        remaining -= freq as u32;
    }
    // The table sums to 256, so every byte lands above.
    Opcode::ISTORE
}

/// Lanes cooperating on one hash instance
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub enum WorkersPerHash {
    One,
    Two,
    Four,
    #[default]
    Eight,
}

impl WorkersPerHash {
    pub const ALL: [WorkersPerHash; 4] = [
        WorkersPerHash::One,
        WorkersPerHash::Two,
        WorkersPerHash::Four,
        WorkersPerHash::Eight,
    ];

    pub fn lanes(self) -> usize {
        match self {
            WorkersPerHash::One => 1,
            WorkersPerHash::Two => 2,
            WorkersPerHash::Four => 4,
            WorkersPerHash::Eight => LANES_PER_HASH,
        }
    }
}

impl TryFrom<u32> for WorkersPerHash {
    type Error = Error;

    fn try_from(lanes: u32) -> Result<Self> {
        match lanes {
            1 => Ok(WorkersPerHash::One),
            2 => Ok(WorkersPerHash::Two),
            4 => Ok(WorkersPerHash::Four),
            8 => Ok(WorkersPerHash::Eight),
            other => Err(Error::WorkersPerHash(other)),
        }
    }
}

impl From<WorkersPerHash> for u32 {
    fn from(workers: WorkersPerHash) -> u32 {
        workers.lanes() as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frequencies_cover_every_byte() {
        let total: u32 = INSTRUCTION_FREQUENCIES.iter().map(|&(_, f)| f as u32).sum();
        assert_eq!(total, 256);
    }

    #[test]
    fn opcode_boundaries() {
        assert_eq!(opcode_from_byte(0), Opcode::IADD_RS);
        assert_eq!(opcode_from_byte(15), Opcode::IADD_RS);
        assert_eq!(opcode_from_byte(16), Opcode::IADD_M);
        assert_eq!(opcode_from_byte(23), Opcode::ISUB_R);
        assert_eq!(opcode_from_byte(214), Opcode::CBRANCH);
        assert_eq!(opcode_from_byte(238), Opcode::CBRANCH);
        assert_eq!(opcode_from_byte(239), Opcode::CFROUND);
        assert_eq!(opcode_from_byte(240), Opcode::ISTORE);
        assert_eq!(opcode_from_byte(255), Opcode::ISTORE);
    }

    #[test]
    fn first_byte_decodes_back() {
        for &(opcode, _) in INSTRUCTION_FREQUENCIES.iter() {
            assert_eq!(opcode_from_byte(opcode.first_byte()), opcode);
        }
    }

    #[test]
    fn masks() {
        assert_eq!(CACHE_LINE_ALIGN_MASK, 0x7FFF_FFC0);
        assert_eq!(SCRATCHPAD_L3_MASK64, 0x1F_FFC0);
        assert_eq!(DATASET_EXTRA_ITEMS, 524287);
        assert_eq!(ENTROPY_SIZE, 2176);
        assert_eq!(IMM_BUF_CAPACITY, 192);
        assert_eq!(COMPILED_PROGRAM_CAPACITY, 256);
    }

    #[test]
    fn workers_per_hash_values() {
        for workers in WorkersPerHash::ALL {
            assert_eq!(WorkersPerHash::try_from(u32::from(workers)).unwrap(), workers);
        }
        assert!(WorkersPerHash::try_from(3).is_err());
        assert!(WorkersPerHash::try_from(16).is_err());
        assert_eq!(WorkersPerHash::default().lanes(), 8);
    }
}
