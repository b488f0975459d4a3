//! Compiled instruction encoding
//!
//! Every scheduled instruction becomes one 32-bit word:
//!
//! | bits  | field                                                    |
//! |-------|----------------------------------------------------------|
//! | 0-2   | dst                                                      |
//! | 3-5   | src                                                      |
//! | 6-13  | immediate index (CFROUND: rotate amount)                 |
//! | 14-15 | source location: register, L1, L2, L3                    |
//! | 16-17 | shift                                                    |
//! | 18    | src is a sign-extended imm32                             |
//! | 19    | src is an imm64 (two immediate slots)                    |
//! | 20    | negate src                                               |
//! | 21-25 | opcode                                                   |
//! | 26-28 | lanes in the dispatch group starting here, minus one     |
//! | 29-31 | floating instructions among them                         |
//!
//! Floating words use register fields differently: `dst` indexes the
//! combined F/E file (0-3 F, 4-7 E) and for A-register sources `src` holds
//! twice the A index.

use crate::randomx::scratchpad::Window;

const DST_OFFSET: u32 = 0;
const SRC_OFFSET: u32 = 3;
const IMM_OFFSET: u32 = 6;
const LOC_OFFSET: u32 = 14;
const SHIFT_OFFSET: u32 = 16;
const SRC_IS_IMM32_OFFSET: u32 = 18;
const SRC_IS_IMM64_OFFSET: u32 = 19;
const NEGATIVE_SRC_OFFSET: u32 = 20;
const OPCODE_OFFSET: u32 = 21;
const NUM_INSTS_OFFSET: u32 = 26;
const NUM_FP_INSTS_OFFSET: u32 = 29;

/// Immediate bits 21-25 carry the window mask shift of memory instructions.
/// The address is masked to at most 21 bits, so they never reach it.
const IMM_WINDOW_OFFSET: u32 = 21;
const IMM_WINDOW_CLEAR: u32 = 0xFC1F_FFFF;

/// Operation performed by a compiled word
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ExecOp {
    /// `dst += imm32; dst += src << shift`
    AddDisplaced = 0,
    Add = 1,
    Mul = 2,
    MulHigh = 3,
    SignedMulHigh = 4,
    Neg = 5,
    /// Integer xor, or FSCAL on a floating lane
    Xor = 6,
    Ror = 7,
    Swap = 8,
    CondBranch = 9,
    Store = 10,
    FloatSwap = 11,
    FloatAdd = 12,
    FloatMul = 13,
    FloatSqrt = 14,
    FloatDiv = 15,
    SetRounding = 16,
}

impl ExecOp {
    pub fn from_bits(bits: u32) -> Option<Self> {
        use ExecOp::*;
        Some(match bits {
            0 => AddDisplaced,
            1 => Add,
            2 => Mul,
            3 => MulHigh,
            4 => SignedMulHigh,
            5 => Neg,
            6 => Xor,
            7 => Ror,
            8 => Swap,
            9 => CondBranch,
            10 => Store,
            11 => FloatSwap,
            12 => FloatAdd,
            13 => FloatMul,
            14 => FloatSqrt,
            15 => FloatDiv,
            16 => SetRounding,
            _ => return None,
        })
    }
}

/// Where the source operand comes from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Location {
    /// Register file (integer, or group A on a floating lane)
    Register,
    Memory(Window),
}

impl Location {
    fn code(self) -> u32 {
        match self {
            Location::Register => 0,
            Location::Memory(window) => window as u32,
        }
    }

    fn from_code(code: u32) -> Self {
        Window::from_code(code).map_or(Location::Register, Location::Memory)
    }
}

/// Unpacked compiled word
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CompiledInstruction {
    pub dst: u8,
    pub src: u8,
    /// Immediate buffer index, or the rotate amount for `SetRounding`
    pub imm_index: u8,
    pub location: Location,
    pub shift: u8,
    pub src_is_imm32: bool,
    pub src_is_imm64: bool,
    pub negative_src: bool,
    pub op: ExecOp,
    /// Lanes in the dispatch group that starts at this word
    pub group_lanes: u8,
    /// Floating instructions at the head of that group
    pub group_fp: u8,
}

impl CompiledInstruction {
    /// A word with only the operation and registers set
    pub fn new(op: ExecOp, dst: u8, src: u8) -> Self {
        Self {
            dst,
            src,
            imm_index: 0,
            location: Location::Register,
            shift: 0,
            src_is_imm32: false,
            src_is_imm64: false,
            negative_src: false,
            op,
            group_lanes: 1,
            group_fp: 0,
        }
    }

    /// `ISWAP r0, r0`
    pub fn nop() -> Self {
        Self::new(ExecOp::Swap, 0, 0)
    }

    pub fn to_bits(&self) -> u32 {
        debug_assert!((1..=8).contains(&self.group_lanes));
        debug_assert!(self.group_fp <= 4);
        ((self.dst as u32 & 7) << DST_OFFSET)
            | ((self.src as u32 & 7) << SRC_OFFSET)
            | ((self.imm_index as u32) << IMM_OFFSET)
            | (self.location.code() << LOC_OFFSET)
            | ((self.shift as u32 & 3) << SHIFT_OFFSET)
            | ((self.src_is_imm32 as u32) << SRC_IS_IMM32_OFFSET)
            | ((self.src_is_imm64 as u32) << SRC_IS_IMM64_OFFSET)
            | ((self.negative_src as u32) << NEGATIVE_SRC_OFFSET)
            | ((self.op as u32) << OPCODE_OFFSET)
            | (((self.group_lanes as u32 - 1) & 7) << NUM_INSTS_OFFSET)
            | ((self.group_fp as u32 & 7) << NUM_FP_INSTS_OFFSET)
    }

    pub fn from_bits(bits: u32) -> Self {
        let field = |offset: u32, width: u32| (bits >> offset) & ((1 << width) - 1);
        Self {
            dst: field(DST_OFFSET, 3) as u8,
            src: field(SRC_OFFSET, 3) as u8,
            imm_index: field(IMM_OFFSET, 8) as u8,
            location: Location::from_code(field(LOC_OFFSET, 2)),
            shift: field(SHIFT_OFFSET, 2) as u8,
            src_is_imm32: field(SRC_IS_IMM32_OFFSET, 1) != 0,
            src_is_imm64: field(SRC_IS_IMM64_OFFSET, 1) != 0,
            negative_src: field(NEGATIVE_SRC_OFFSET, 1) != 0,
            // opcodes 17-31 are never emitted; treat them as the nop swap
            op: ExecOp::from_bits(field(OPCODE_OFFSET, 5)).unwrap_or(ExecOp::Swap),
            group_lanes: field(NUM_INSTS_OFFSET, 3) as u8 + 1,
            group_fp: field(NUM_FP_INSTS_OFFSET, 3) as u8,
        }
    }
}

/// Store the window's mask shift in immediate bits 21-25
pub fn imm_with_window(imm: u32, window: Window) -> u32 {
    (imm & IMM_WINDOW_CLEAR) | (window.mask_shift() << IMM_WINDOW_OFFSET)
}

/// Window whose mask shift sits in immediate bits 21-25
pub fn window_of_imm(imm: u32) -> Option<Window> {
    Window::from_mask_shift((imm >> IMM_WINDOW_OFFSET) & 31)
}

/// Fixed-point reciprocal used by IMUL_RCP: `floor(2^(63 + bits(d)) / d)`,
/// computed with the bit-by-bit long division recurrence.
///
/// Only meaningful when `divisor` is neither zero nor a power of two; those
/// compile to a no-op and the function returns 1 for them.
pub fn reciprocal(divisor: u32) -> u64 {
    if divisor & divisor.wrapping_sub(1) == 0 {
        return 1;
    }
    let divisor = divisor as u64;
    const P2EXP63: u64 = 1 << 63;
    let mut quotient = P2EXP63 / divisor;
    let mut remainder = P2EXP63 % divisor;

    let bits = 64 - divisor.leading_zeros();
    for _ in 0..bits {
        if remainder >= divisor - remainder {
            quotient = quotient.wrapping_mul(2) | 1;
            remainder = remainder.wrapping_mul(2).wrapping_sub(divisor);
        } else {
            quotient = quotient.wrapping_mul(2);
            remainder *= 2;
        }
    }
    quotient
}
