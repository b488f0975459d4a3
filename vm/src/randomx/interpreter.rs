//! Lockstep Interpreter
//!
//! Runs a compiled program on `WORKERS_PER_HASH` simulated lanes. Each
//! dispatch group is executed in two phases: every active lane first
//! computes its result from the state as it was when the group started,
//! then the results are committed in lane order. That commit is the
//! barrier that separates one group from the next.

use tracing::trace;

use crate::randomx::config::*;
use crate::randomx::encoding::{window_of_imm, CompiledInstruction, ExecOp, Location};
use crate::randomx::error::{Error, Result};
use crate::randomx::lanes::LaneGroup;
use crate::randomx::scratchpad::{Dataset, Scratchpad, Window};
use crate::randomx::softfloat::{RoundingMode, SoftFloat};
use crate::randomx::state::{VmOutput, VmState};

/// Executes compiled programs against a shared dataset
#[derive(Clone, Debug)]
pub struct Interpreter {
    workers: WorkersPerHash,
    dataset: Dataset,
}

impl Interpreter {
    pub fn new(workers: WorkersPerHash, dataset: Dataset) -> Self {
        Self { workers, dataset }
    }

    pub fn workers(&self) -> WorkersPerHash {
        self.workers
    }

    pub fn dataset(&self) -> &Dataset {
        &self.dataset
    }

    /// Run `iterations` rounds. `first` seeds the scratchpad addresses from
    /// `ma`/`mx`; `last` returns the final registers.
    ///
    /// The state must have been compiled for this interpreter's lane count.
    pub fn execute(
        &self,
        state: &mut VmState,
        scratchpad: &mut Scratchpad,
        iterations: usize,
        first: bool,
        last: bool,
    ) -> Result<Option<VmOutput>> {
        if state.program.workers != self.workers {
            return Err(Error::LaneMismatch {
                compiled: state.program.workers.lanes(),
                interpreter: self.workers.lanes(),
            });
        }
        run_rounds(state, scratchpad, &self.dataset, iterations, first, |state, scratchpad| {
            self.run_program(state, scratchpad)
        });
        Ok(last.then(|| state.output()))
    }

    /// One pass over the compiled words
    fn run_program(&self, state: &mut VmState, scratchpad: &mut Scratchpad) {
        let width = self.workers.lanes();
        let fp_width = width.min(2);
        let mut group = LaneGroup::new(width, state.rounding_mode);
        let len = state.program.len();

        while group.ip() < len {
            let ip = group.ip();
            let head = state.program.word(ip);
            let lanes = head.group_lanes as usize;
            let fp = head.group_fp as usize;
            let fp_lanes = fp * fp_width;
            assert!(lanes <= width, "group of {lanes} lanes at word {ip}");
            assert!(fp_lanes <= lanes, "{fp} floating words in a group of {lanes}");

            let mut effects = [Effects::default(); LANES_PER_HASH];
            for (sub, fx) in effects.iter_mut().enumerate().take(lanes) {
                let lane = group.lane(sub);
                *fx = if sub < fp_lanes {
                    let word = state.program.word(ip + sub / fp_width);
                    let halves = if fp_width == 1 { 0..2 } else { (sub & 1)..(sub & 1) + 1 };
                    float_lane(&word, halves, state, scratchpad, lane.fprc)
                } else {
                    let word = state.program.word(ip + fp + sub - fp_lanes);
                    int_lane(&word, state, scratchpad)
                };
                let lane = group.lane_mut(sub);
                lane.jump = fx.jump;
                lane.rounding = fx.rounding;
            }

            for fx in &effects[..lanes] {
                fx.commit(state, scratchpad);
            }
            let words = fp + lanes - fp_lanes;
            group.resync(ip + words);
            trace!(ip, lanes, fp, next = group.ip(), "dispatch group");
        }

        state.rounding_mode = group.rounding_mode();
    }
}

/// The round loop shared by every way of running a program: seed the
/// registers from the scratchpad, run `program`, mix in the dataset and
/// write the registers back.
pub fn run_rounds<F>(
    state: &mut VmState,
    scratchpad: &mut Scratchpad,
    dataset: &Dataset,
    iterations: usize,
    first: bool,
    mut program: F,
) where
    F: FnMut(&mut VmState, &mut Scratchpad),
{
    let [read0, read1, read2, read3] = state.mem.read_reg.map(|r| r as usize);
    let (mut sp_addr0, mut sp_addr1) = if first {
        (state.mem.mx, state.mem.ma)
    } else {
        (0, 0)
    };

    for _ in 0..iterations {
        let mix = state.r[read0] ^ state.r[read1];
        sp_addr0 = (sp_addr0 ^ mix as u32) & SCRATCHPAD_L3_MASK64;
        sp_addr1 = (sp_addr1 ^ (mix >> 32) as u32) & SCRATCHPAD_L3_MASK64;
        let (addr0, addr1) = (sp_addr0 as usize, sp_addr1 as usize);

        for i in 0..RANDOMX_INT_REGISTER_COUNT {
            state.r[i] ^= scratchpad.read_u64(addr0 + 8 * i);
        }
        for i in 0..RANDOMX_FLOAT_REGISTER_COUNT {
            let [lo, hi] = scratchpad.read_i32x2(addr1 + 8 * i);
            state.f[2 * i] = SoftFloat::from_i32(lo).to_bits();
            state.f[2 * i + 1] = SoftFloat::from_i32(hi).to_bits();

            let [lo, hi] = scratchpad.read_i32x2(addr1 + 8 * (i + RANDOMX_FLOAT_REGISTER_COUNT));
            state.e[2 * i] = e_operand(lo, state.e_config.mask[0]);
            state.e[2 * i + 1] = e_operand(hi, state.e_config.mask[1]);
        }

        program(state, scratchpad);

        let mut mx = state.mem.mx ^ state.r[read2] as u32 ^ state.r[read3] as u32;
        mx &= CACHE_LINE_ALIGN_MASK;
        state.mem.mx = mx;
        let line = dataset.read_line(state.mem.dataset_offset as u64 + state.mem.ma as u64);
        for (r, word) in state.r.iter_mut().zip(line.iter()) {
            *r ^= word;
        }
        core::mem::swap(&mut state.mem.ma, &mut state.mem.mx);

        for i in 0..RANDOMX_INT_REGISTER_COUNT {
            scratchpad.write_u64(addr1 + 8 * i, state.r[i]);
            scratchpad.write_u64(addr0 + 8 * i, state.f[i] ^ state.e[i]);
        }
        sp_addr0 = 0;
        sp_addr1 = 0;
    }
}

/// Group E operand: converted integer, mantissa kept, exponent forced
pub fn e_operand(value: i32, mask: u64) -> u64 {
    (SoftFloat::from_i32(value).to_bits() & DYNAMIC_MANTISSA_MASK) | mask
}

/// A register or memory write produced by one lane
#[derive(Clone, Copy, Debug, Default)]
enum Write {
    #[default]
    None,
    Int(u8, u64),
    /// Combined F/E register, half, bits
    Float(u8, usize, u64),
    Store(usize, u64),
}

/// Everything one lane does in one group, applied at the barrier
#[derive(Clone, Copy, Debug, Default)]
struct Effects {
    writes: [Write; 2],
    jump: Option<usize>,
    rounding: Option<RoundingMode>,
}

impl Effects {
    fn write(write: Write) -> Self {
        Self {
            writes: [write, Write::None],
            ..Self::default()
        }
    }

    fn commit(&self, state: &mut VmState, scratchpad: &mut Scratchpad) {
        for write in self.writes {
            match write {
                Write::None => {}
                Write::Int(reg, value) => state.r[reg as usize] = value,
                Write::Float(reg, half, bits) => *float_reg(state, reg, half) = bits,
                Write::Store(addr, value) => scratchpad.write_u64(addr, value),
            }
        }
    }
}

/// F (0-3) or E (4-7) register half
fn float_reg(state: &mut VmState, reg: u8, half: usize) -> &mut u64 {
    let index = 2 * (reg as usize % RANDOMX_FLOAT_REGISTER_COUNT) + half;
    if (reg as usize) < RANDOMX_FLOAT_REGISTER_COUNT {
        &mut state.f[index]
    } else {
        &mut state.e[index]
    }
}

fn float_bits(state: &VmState, reg: u8, half: usize) -> u64 {
    let index = 2 * (reg as usize % RANDOMX_FLOAT_REGISTER_COUNT) + half;
    if (reg as usize) < RANDOMX_FLOAT_REGISTER_COUNT {
        state.f[index]
    } else {
        state.e[index]
    }
}

fn sign_extend(imm: u32) -> u64 {
    imm as i32 as i64 as u64
}

/// Scratchpad address of a memory word: window from the immediate, base
/// register unless the read targets the whole L3 at a fixed address
fn memory_address(word: &CompiledInstruction, window: Window, state: &VmState, base_reg: u8) -> usize {
    let imm = state.program.imm32(word.imm_index as usize);
    let window = window_of_imm(imm).unwrap_or(window);
    let base = if window == Window::L3 && word.op != ExecOp::Store {
        0
    } else {
        state.r[base_reg as usize]
    };
    window.address(base, imm)
}

fn int_operand(word: &CompiledInstruction, state: &VmState, scratchpad: &Scratchpad) -> u64 {
    let program = &state.program;
    let index = word.imm_index as usize;
    let value = if word.src_is_imm64 {
        program.imm64(index)
    } else if word.src_is_imm32 {
        sign_extend(program.imm32(index))
    } else {
        match word.location {
            Location::Register => state.r[word.src as usize],
            Location::Memory(window) => {
                scratchpad.read_u64(memory_address(word, window, state, word.src))
            }
        }
    };
    if word.negative_src {
        value.wrapping_neg()
    } else {
        value
    }
}

fn int_lane(word: &CompiledInstruction, state: &VmState, scratchpad: &Scratchpad) -> Effects {
    let dst = word.dst;
    let dst_val = state.r[dst as usize];
    let program = &state.program;

    let value = match word.op {
        ExecOp::AddDisplaced => dst_val
            .wrapping_add(sign_extend(program.imm32(word.imm_index as usize)))
            .wrapping_add(int_operand(word, state, scratchpad) << word.shift),
        ExecOp::Add => dst_val.wrapping_add(int_operand(word, state, scratchpad) << word.shift),
        ExecOp::Mul => dst_val.wrapping_mul(int_operand(word, state, scratchpad)),
        ExecOp::MulHigh => {
            let src = int_operand(word, state, scratchpad);
            ((dst_val as u128 * src as u128) >> 64) as u64
        }
        ExecOp::SignedMulHigh => {
            let src = int_operand(word, state, scratchpad);
            ((dst_val as i64 as i128 * src as i64 as i128) >> 64) as u64
        }
        ExecOp::Neg => dst_val.wrapping_neg(),
        ExecOp::Xor => dst_val ^ int_operand(word, state, scratchpad),
        ExecOp::Ror => dst_val.rotate_right((int_operand(word, state, scratchpad) & 63) as u32),
        ExecOp::Swap => {
            if word.src == dst {
                return Effects::default();
            }
            let src_val = state.r[word.src as usize];
            return Effects {
                writes: [Write::Int(dst, src_val), Write::Int(word.src, dst_val)],
                ..Effects::default()
            };
        }
        ExecOp::CondBranch => {
            let index = word.imm_index as usize;
            let value = dst_val.wrapping_add(sign_extend(program.imm32(index)));
            let packed = program.imm32(index + 1);
            let cshift = packed & 31;
            let taken = value & ((CONDITION_MASK as u64) << cshift) == 0;
            let target = ((packed as i32 >> 5) + 1) as usize;
            return Effects {
                jump: taken.then_some(target),
                ..Effects::write(Write::Int(dst, value))
            };
        }
        ExecOp::Store => {
            let window = match word.location {
                Location::Memory(window) => window,
                Location::Register => Window::L3,
            };
            let addr = memory_address(word, window, state, dst);
            return Effects::write(Write::Store(addr, state.r[word.src as usize]));
        }
        ExecOp::SetRounding => {
            let src_val = state.r[word.src as usize];
            let mode = RoundingMode::from((src_val.rotate_right(word.imm_index as u32 & 63) & 3) as u8);
            return Effects {
                rounding: Some(mode),
                ..Effects::default()
            };
        }
        ExecOp::FloatSwap
        | ExecOp::FloatAdd
        | ExecOp::FloatMul
        | ExecOp::FloatSqrt
        | ExecOp::FloatDiv => return Effects::default(),
    };
    Effects::write(Write::Int(dst, value))
}

/// Memory operand of a floating word for one half
fn float_memory(word: &CompiledInstruction, state: &VmState, scratchpad: &Scratchpad, half: usize) -> i32 {
    let window = match word.location {
        Location::Memory(window) => window,
        Location::Register => Window::L1,
    };
    scratchpad.read_i32x2(memory_address(word, window, state, word.src))[half]
}

fn float_lane(
    word: &CompiledInstruction,
    halves: core::ops::Range<usize>,
    state: &VmState,
    scratchpad: &Scratchpad,
    fprc: RoundingMode,
) -> Effects {
    let mut fx = Effects::default();
    for (slot, half) in halves.enumerate() {
        let reg = word.dst;
        let old = float_bits(state, reg, half);
        let a = SoftFloat::from_bits(old);
        let bits = match word.op {
            ExecOp::FloatSwap => float_bits(state, reg, half ^ 1),
            ExecOp::FloatAdd => {
                let b = match word.location {
                    Location::Register => SoftFloat::from_bits(state.a[word.src as usize + half]),
                    Location::Memory(_) => {
                        SoftFloat::from_i32(float_memory(word, state, scratchpad, half))
                    }
                };
                if word.negative_src {
                    a.sub(b, fprc).to_bits()
                } else {
                    a.add(b, fprc).to_bits()
                }
            }
            ExecOp::FloatMul => {
                let b = SoftFloat::from_bits(state.a[word.src as usize + half]);
                a.mul(b, fprc).to_bits()
            }
            ExecOp::FloatDiv => {
                let value = float_memory(word, state, scratchpad, half);
                let divisor = SoftFloat::from_bits(e_operand(value, state.e_config.mask[half]));
                a.div(divisor, fprc).to_bits()
            }
            ExecOp::FloatSqrt => a.sqrt(fprc).to_bits(),
            ExecOp::Xor => old ^ SCALE_MASK,
            _ => old,
        };
        fx.writes[slot] = Write::Float(reg, half, bits);
    }
    fx
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::randomx::encoding::imm_with_window;
    use crate::randomx::state::CompiledProgram;

    fn state_with(words: &[CompiledInstruction], imm: &[u32]) -> VmState {
        let mut program = CompiledProgram::default();
        for (i, word) in words.iter().enumerate() {
            program.words[i] = word.to_bits();
        }
        program.imm[..imm.len()].copy_from_slice(imm);
        program.len = words.len() as u32;
        VmState {
            r: [0; 8],
            f: [0; 8],
            e: [0; 8],
            a: [0; 8],
            mem: Default::default(),
            e_config: Default::default(),
            program,
            rounding_mode: RoundingMode::NearestEven,
        }
    }

    fn interpreter(workers: WorkersPerHash) -> Interpreter {
        Interpreter::new(workers, Dataset::from_bytes(vec![0; 64]).unwrap())
    }

    #[test]
    fn group_reads_before_writes() {
        // r0 <-> r1 and r2 = r0 + r1 in the same group see the old values
        let mut swap = CompiledInstruction::new(ExecOp::Swap, 0, 1);
        swap.group_lanes = 2;
        let add = CompiledInstruction::new(ExecOp::Add, 2, 0);
        let mut state = state_with(&[swap, add], &[]);
        state.r[0] = 5;
        state.r[1] = 9;
        state.r[2] = 1;
        let mut sp = Scratchpad::new();
        interpreter(WorkersPerHash::Two).run_program(&mut state, &mut sp);
        assert_eq!(&state.r[..3], &[9, 5, 6]);
    }

    #[test]
    fn taken_branch_jumps_back() {
        let count = CompiledInstruction::new(ExecOp::Add, 1, 4);
        let branch = CompiledInstruction::new(ExecOp::CondBranch, 0, 0);
        // addend 1 << 8, condition byte 8-15, target word 0 stored as -1
        let imm = [1 << 8, 8 | (-1i32 << 5) as u32];
        let mut state = state_with(&[count, branch], &imm);
        state.r[4] = 1;
        state.r[0] = 0xFF00;
        let mut sp = Scratchpad::new();
        interpreter(WorkersPerHash::One).run_program(&mut state, &mut sp);
        // first pass carries out of the byte and jumps, second falls through
        assert_eq!(state.r[1], 2);
        assert_eq!(state.r[0], 0x1_0100);
    }

    #[test]
    fn rounding_change_applies_to_next_group() {
        let mut round = CompiledInstruction::new(ExecOp::SetRounding, 0, 2);
        round.imm_index = 0;
        let mut fadd = CompiledInstruction::new(ExecOp::FloatAdd, 0, 0);
        fadd.group_fp = 1;
        fadd.group_lanes = 2;
        let mut state = state_with(&[round, fadd], &[]);
        state.r[2] = 2; // toward +inf
        state.f[0] = 1.0f64.to_bits();
        state.f[1] = 1.0f64.to_bits();
        state.a[0] = 2f64.powi(-60).to_bits();
        state.a[1] = (-(2f64.powi(-60))).to_bits();
        let mut sp = Scratchpad::new();
        interpreter(WorkersPerHash::Two).run_program(&mut state, &mut sp);
        assert_eq!(state.rounding_mode, RoundingMode::TowardPositive);
        assert!(f64::from_bits(state.f[0]) > 1.0);
        assert_eq!(f64::from_bits(state.f[1]), 1.0);
    }

    #[test]
    fn l3_reads_ignore_the_register() {
        let mut load = CompiledInstruction::new(ExecOp::Add, 1, 1);
        load.location = Location::Memory(Window::L3);
        let mut state = state_with(&[load], &[imm_with_window(0x100, Window::L3)]);
        state.r[1] = 0x10;
        let mut sp = Scratchpad::new();
        sp.write_u64(0x100, 7);
        sp.write_u64(0x110, 1000);
        interpreter(WorkersPerHash::Four).run_program(&mut state, &mut sp);
        assert_eq!(state.r[1], 0x17);
    }

    #[test]
    fn rejects_state_compiled_for_other_lanes() {
        let add = CompiledInstruction::new(ExecOp::Add, 0, 1);
        let mut state = state_with(&[add], &[]);
        state.program.workers = WorkersPerHash::Eight;
        let before = state.clone();
        let mut sp = Scratchpad::new();

        let err = interpreter(WorkersPerHash::One)
            .execute(&mut state, &mut sp, 1, true, true)
            .unwrap_err();
        assert!(matches!(err, Error::LaneMismatch { compiled: 8, interpreter: 1 }));
        assert_eq!(state, before);

        assert!(interpreter(WorkersPerHash::Eight)
            .execute(&mut state, &mut sp, 1, true, true)
            .unwrap()
            .is_some());
    }

    #[test]
    fn store_uses_destination_base() {
        let mut store = CompiledInstruction::new(ExecOp::Store, 2, 3);
        store.location = Location::Memory(Window::L1);
        let mut state = state_with(&[store], &[imm_with_window(8, Window::L1)]);
        state.r[2] = 0x4000 + 0x20; // wraps inside L1
        state.r[3] = 0xDEAD;
        let mut sp = Scratchpad::new();
        interpreter(WorkersPerHash::One).run_program(&mut state, &mut sp);
        assert_eq!(sp.read_u64(0x28), 0xDEAD);
    }
}
