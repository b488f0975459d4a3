//! Sequential reference interpreter
//!
//! Executes the raw program one instruction at a time, without any
//! scheduling, using the same round loop as the lockstep interpreter. The
//! compiled form is checked against it.

use crate::randomx::config::*;
use crate::randomx::encoding::reciprocal;
use crate::randomx::interpreter::{e_operand, run_rounds};
use crate::randomx::program::{Instruction, Program};
use crate::randomx::scheduler::branch_addend;
use crate::randomx::scratchpad::{Dataset, Scratchpad, Window};
use crate::randomx::softfloat::{RoundingMode, SoftFloat};
use crate::randomx::state::{CompiledProgram, VmOutput, VmState};
use crate::randomx::tracker::{is_zero_or_power_of_two, BranchAnalysis};

/// A decoded program with its branches resolved
#[derive(Clone, Debug)]
pub struct ReferenceVm {
    program: Program,
    branches: BranchAnalysis,
    dataset: Dataset,
}

impl ReferenceVm {
    pub fn new(program: Program, dataset: Dataset) -> Self {
        let branches = BranchAnalysis::analyze(&program);
        Self {
            program,
            branches,
            dataset,
        }
    }

    /// Initial state; the compiled program stays empty
    pub fn init_state(&self) -> VmState {
        VmState::new(&self.program, CompiledProgram::default())
    }

    pub fn execute(
        &self,
        state: &mut VmState,
        scratchpad: &mut Scratchpad,
        iterations: usize,
        first: bool,
        last: bool,
    ) -> Option<VmOutput> {
        run_rounds(state, scratchpad, &self.dataset, iterations, first, |state, scratchpad| {
            self.execute_program(state, scratchpad)
        });
        last.then(|| state.output())
    }

    /// Execute the program once, top to bottom, following taken branches
    fn execute_program(&self, state: &mut VmState, scratchpad: &mut Scratchpad) {
        let mut pc = 0;
        while pc < RANDOMX_PROGRAM_SIZE {
            pc = match self.execute_instruction(pc, state, scratchpad) {
                Some(target) => target,
                None => pc + 1,
            };
        }
    }

    /// Execute instruction `pc`; returns the jump target of a taken branch
    fn execute_instruction(
        &self,
        pc: usize,
        state: &mut VmState,
        scratchpad: &mut Scratchpad,
    ) -> Option<usize> {
        use Opcode::*;

        let instr = &self.program.instructions[pc];
        let dst = instr.dst as usize;
        let src = instr.src as usize;
        let rm = state.rounding_mode;
        let r = &mut state.r;

        // register source, or the immediate when both operands coincide
        let src_or_imm = |r: &[u64; 8]| if src == dst { instr.imm_i64() } else { r[src] };

        match instr.opcode {
            IADD_RS => {
                // dst = dst + (src << shift) (+ imm for r5)
                let mut value = r[dst].wrapping_add(r[src] << instr.mod_shift());
                if instr.dst == REGISTER_NEEDS_DISPLACEMENT {
                    value = value.wrapping_add(instr.imm_i64());
                }
                r[dst] = value;
            }

            IADD_M => {
                let mem = scratchpad.read_u64(int_read_address(instr, r));
                r[dst] = r[dst].wrapping_add(mem);
            }

            ISUB_R => {
                r[dst] = r[dst].wrapping_sub(src_or_imm(r));
            }

            ISUB_M => {
                let mem = scratchpad.read_u64(int_read_address(instr, r));
                r[dst] = r[dst].wrapping_sub(mem);
            }

            IMUL_R => {
                r[dst] = r[dst].wrapping_mul(src_or_imm(r));
            }

            IMUL_M => {
                let mem = scratchpad.read_u64(int_read_address(instr, r));
                r[dst] = r[dst].wrapping_mul(mem);
            }

            IMULH_R => {
                // dst = (dst * src) >> 64 (unsigned)
                r[dst] = ((r[dst] as u128 * r[src] as u128) >> 64) as u64;
            }

            IMULH_M => {
                let mem = scratchpad.read_u64(int_read_address(instr, r));
                r[dst] = ((r[dst] as u128 * mem as u128) >> 64) as u64;
            }

            ISMULH_R => {
                // dst = (dst * src) >> 64 (signed)
                r[dst] = ((r[dst] as i64 as i128 * r[src] as i64 as i128) >> 64) as u64;
            }

            ISMULH_M => {
                let mem = scratchpad.read_u64(int_read_address(instr, r)) as i64;
                r[dst] = ((r[dst] as i64 as i128 * mem as i128) >> 64) as u64;
            }

            IMUL_RCP => {
                if !is_zero_or_power_of_two(instr.imm) {
                    r[dst] = r[dst].wrapping_mul(reciprocal(instr.imm));
                }
            }

            INEG_R => {
                r[dst] = r[dst].wrapping_neg();
            }

            IXOR_R => {
                r[dst] ^= src_or_imm(r);
            }

            IXOR_M => {
                r[dst] ^= scratchpad.read_u64(int_read_address(instr, r));
            }

            IROR_R => {
                r[dst] = r[dst].rotate_right((src_or_imm(r) & 63) as u32);
            }

            ISWAP_R => {
                if src != dst {
                    r.swap(dst, src);
                }
            }

            FSWAP_R => {
                // dst 0-3 selects F, 4-7 selects E
                let regs = if dst < 4 { &mut state.f } else { &mut state.e };
                let i = 2 * (dst % 4);
                regs.swap(i, i + 1);
            }

            FADD_R | FSUB_R => {
                let i = 2 * (dst % 4);
                let a = 2 * (src % 4);
                for half in 0..2 {
                    let x = SoftFloat::from_bits(state.f[i + half]);
                    let y = SoftFloat::from_bits(state.a[a + half]);
                    let value = if instr.opcode == FADD_R { x.add(y, rm) } else { x.sub(y, rm) };
                    state.f[i + half] = value.to_bits();
                }
            }

            FADD_M | FSUB_M => {
                let i = 2 * (dst % 4);
                let mem = scratchpad.read_i32x2(float_read_address(instr, r));
                for half in 0..2 {
                    let x = SoftFloat::from_bits(state.f[i + half]);
                    let y = SoftFloat::from_i32(mem[half]);
                    let value = if instr.opcode == FADD_M { x.add(y, rm) } else { x.sub(y, rm) };
                    state.f[i + half] = value.to_bits();
                }
            }

            FSCAL_R => {
                let i = 2 * (dst % 4);
                state.f[i] ^= SCALE_MASK;
                state.f[i + 1] ^= SCALE_MASK;
            }

            FMUL_R => {
                let i = 2 * (dst % 4);
                let a = 2 * (src % 4);
                for half in 0..2 {
                    let x = SoftFloat::from_bits(state.e[i + half]);
                    let y = SoftFloat::from_bits(state.a[a + half]);
                    state.e[i + half] = x.mul(y, rm).to_bits();
                }
            }

            FDIV_M => {
                let i = 2 * (dst % 4);
                let mem = scratchpad.read_i32x2(float_read_address(instr, r));
                for half in 0..2 {
                    let x = SoftFloat::from_bits(state.e[i + half]);
                    let y = SoftFloat::from_bits(e_operand(mem[half], state.e_config.mask[half]));
                    state.e[i + half] = x.div(y, rm).to_bits();
                }
            }

            FSQRT_R => {
                let i = 2 * (dst % 4);
                for half in 0..2 {
                    state.e[i + half] = SoftFloat::from_bits(state.e[i + half]).sqrt(rm).to_bits();
                }
            }

            CBRANCH => {
                let branch = self.branches.branch(pc)?;
                let creg = branch.condition_register as usize;
                let (addend, cshift) = branch_addend(instr);
                r[creg] = r[creg].wrapping_add(addend as i32 as i64 as u64);
                if r[creg] & ((CONDITION_MASK as u64) << cshift) == 0 {
                    return Some(branch.target);
                }
            }

            CFROUND => {
                let mode = r[src].rotate_right(instr.imm & 63) & 3;
                state.rounding_mode = RoundingMode::from(mode as u8);
            }

            ISTORE => {
                let window = if instr.mod_cond() >= STORE_L3_CONDITION {
                    Window::L3
                } else {
                    mod_window(instr)
                };
                scratchpad.write_u64(window.address(r[dst], instr.imm), r[src]);
            }
        }
        None
    }
}

fn mod_window(instr: &Instruction) -> Window {
    if instr.mod_mem() != 0 {
        Window::L1
    } else {
        Window::L2
    }
}

/// Integer reads with `src == dst` take the bare immediate in L3
fn int_read_address(instr: &Instruction, r: &[u64; 8]) -> usize {
    if instr.src == instr.dst {
        Window::L3.address(0, instr.imm)
    } else {
        mod_window(instr).address(r[instr.src as usize], instr.imm)
    }
}

fn float_read_address(instr: &Instruction, r: &[u64; 8]) -> usize {
    mod_window(instr).address(r[instr.src as usize], instr.imm)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::randomx::program::EntropyBuffer;

    fn vm(instructions: &[Instruction]) -> ReferenceVm {
        let program = Program::decode(&EntropyBuffer::from_parts(&[0; 16], instructions));
        ReferenceVm::new(program, Dataset::from_bytes(vec![0; 64]).unwrap())
    }

    fn run(vm: &ReferenceVm, state: &mut VmState) -> Scratchpad {
        let mut sp = Scratchpad::new();
        vm.execute_program(state, &mut sp);
        sp
    }

    #[test]
    fn immediate_forms() {
        let vm = vm(&[
            Instruction::new(Opcode::ISUB_R, 1, 1, 0, 0xFFFF_FFFF),
            Instruction::new(Opcode::IADD_RS, 5, 2, 0b0100, 10),
            Instruction::new(Opcode::IMUL_RCP, 3, 0, 0, 3),
        ]);
        let mut state = vm.init_state();
        state.r[1] = 10;
        state.r[2] = 3;
        state.r[3] = 6;
        run(&vm, &mut state);
        assert_eq!(state.r[1], 11);
        assert_eq!(state.r[5], (3 << 1) + 10);
        assert_eq!(state.r[3], 6u64.wrapping_mul(0xAAAA_AAAA_AAAA_AAAA));
    }

    #[test]
    fn branch_repeats_loop_body() {
        let vm = vm(&[
            Instruction::new(Opcode::CBRANCH, 0, 0, 0, 0),
            Instruction::new(Opcode::IADD_RS, 7, 6, 0, 0),
            Instruction::new(Opcode::CBRANCH, 0, 0, 0, 0),
        ]);
        let mut state = vm.init_state();
        state.r[6] = 1;
        state.r[0] = 0xFF00;
        run(&vm, &mut state);
        // the first branch tests r0 and jumps back to itself once; the
        // second tests r1 and falls through
        assert_eq!(state.r[0], 0x1_0100);
        assert_eq!(state.r[1], 0x100);
        assert_eq!(state.r[7], 1);
    }

    #[test]
    fn store_then_load() {
        let vm = vm(&[
            Instruction::new(Opcode::ISTORE, 0, 1, 0x01, 0x18),
            Instruction::new(Opcode::IADD_M, 2, 0, 0x01, 0x18),
        ]);
        let mut state = vm.init_state();
        state.r[0] = 0x100;
        state.r[1] = 77;
        run(&vm, &mut state);
        assert_eq!(state.r[2], 77);
    }
}
