//! Dependency & latency tracking
//!
//! Two pieces of bookkeeping feed the scheduler:
//!
//! * [`BranchAnalysis`] scans the raw program once, tracking when each
//!   integer register was last written, and resolves every CBRANCH to a
//!   condition register and a jump target.
//! * [`LatencyTracker`] holds, while slots are being assigned, the first
//!   cycle at which each register (integer or floating) and each class of
//!   scratchpad data is available, plus the last cycle each register was
//!   read so later writers cannot overtake those readers.

use crate::randomx::config::*;
use crate::randomx::program::{Instruction, Program};

/// Registers written by one raw instruction, ignoring CBRANCH
pub fn written_registers(instr: &Instruction) -> [Option<u8>; 2] {
    use Opcode::*;
    match instr.opcode {
        IADD_RS | IADD_M | ISUB_R | ISUB_M | IMUL_R | IMUL_M | IMULH_R | IMULH_M | ISMULH_R
        | ISMULH_M | INEG_R | IXOR_R | IXOR_M | IROR_R => [Some(instr.dst), None],
        IMUL_RCP if !is_zero_or_power_of_two(instr.imm) => [Some(instr.dst), None],
        ISWAP_R if instr.src != instr.dst => [Some(instr.dst), Some(instr.src)],
        _ => [None, None],
    }
}

pub fn is_zero_or_power_of_two(value: u32) -> bool {
    value & value.wrapping_sub(1) == 0
}

/// Write history of the integer register file
#[derive(Clone, Debug, Default)]
pub struct RegisterHistory {
    /// Instruction index of the last write, `None` if never written
    last_write: [Option<usize>; RANDOMX_INT_REGISTER_COUNT],
    /// Times each register was picked as a condition register
    usage: [u32; RANDOMX_INT_REGISTER_COUNT],
}

impl RegisterHistory {
    pub fn record_write(&mut self, reg: u8, index: usize) {
        self.last_write[reg as usize] = Some(index);
    }

    /// A CBRANCH redefines every register at once
    pub fn record_branch(&mut self, index: usize) {
        self.last_write = [Some(index); RANDOMX_INT_REGISTER_COUNT];
    }

    /// Pick the condition register: oldest (or never) written first, then
    /// least used, then lowest index. Returns the register and its last
    /// write.
    pub fn select_condition_register(&mut self) -> (u8, Option<usize>) {
        let key = |reg: usize| {
            let written = self.last_write[reg].map_or(-1, |i| i as i64);
            (written, self.usage[reg], reg)
        };
        let best = (0..RANDOMX_INT_REGISTER_COUNT)
            .min_by_key(|&reg| key(reg))
            .unwrap_or(0);
        self.usage[best] += 1;
        (best as u8, self.last_write[best])
    }

    pub fn usage(&self, reg: u8) -> u32 {
        self.usage[reg as usize]
    }
}

/// A CBRANCH with its resolved operands
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResolvedBranch {
    pub condition_register: u8,
    /// First instruction of the loop body this branch jumps back to
    pub target: usize,
}

/// Condition registers and branch targets of one program
#[derive(Clone, Debug)]
pub struct BranchAnalysis {
    branches: Vec<Option<ResolvedBranch>>,
    targets: Vec<bool>,
}

impl BranchAnalysis {
    pub fn analyze(program: &Program) -> Self {
        let mut history = RegisterHistory::default();
        let mut branches = vec![None; RANDOMX_PROGRAM_SIZE];
        let mut targets = vec![false; RANDOMX_PROGRAM_SIZE];

        for (i, instr) in program.instructions.iter().enumerate() {
            if instr.opcode == Opcode::CBRANCH {
                let (condition_register, last_write) = history.select_condition_register();
                let target = last_write.map_or(0, |w| w + 1);
                targets[target] = true;
                branches[i] = Some(ResolvedBranch {
                    condition_register,
                    target,
                });
                history.record_branch(i);
                continue;
            }
            for reg in written_registers(instr).into_iter().flatten() {
                history.record_write(reg, i);
            }
        }

        Self { branches, targets }
    }

    pub fn branch(&self, index: usize) -> Option<ResolvedBranch> {
        self.branches[index]
    }

    /// Whether some CBRANCH jumps to instruction `index`
    pub fn is_target(&self, index: usize) -> bool {
        self.targets[index]
    }
}

/// Availability of registers and scratchpad data, in cycles
#[derive(Clone, Debug, Default)]
pub struct LatencyTracker {
    int_latency: [u32; 8],
    int_read_cycle: [u32; 8],
    /// Indexed by the combined F/E register (0-3 F, 4-7 E)
    fp_latency: [u32; 8],
    fp_read_cycle: [u32; 8],
    scratchpad_latency: u32,
    /// Data that only L3 stores can have written
    scratchpad_high_latency: u32,
}

impl LatencyTracker {
    /// First cycle integer register `reg` holds its latest value
    pub fn int_ready(&self, reg: u8) -> u32 {
        self.int_latency[reg as usize]
    }

    /// Last cycle integer register `reg` is read by a scheduled instruction
    pub fn int_read_cycle(&self, reg: u8) -> u32 {
        self.int_read_cycle[reg as usize]
    }

    pub fn fp_ready(&self, reg: u8) -> u32 {
        self.fp_latency[reg as usize]
    }

    pub fn fp_read_cycle(&self, reg: u8) -> u32 {
        self.fp_read_cycle[reg as usize]
    }

    /// First cycle a scratchpad read sees all earlier stores. `high` reads
    /// only alias L3 stores.
    pub fn memory_ready(&self, high: bool) -> u32 {
        if high {
            self.scratchpad_high_latency
        } else {
            self.scratchpad_latency
        }
    }

    pub fn record_int_read(&mut self, reg: u8, cycle: u32) {
        let slot = &mut self.int_read_cycle[reg as usize];
        *slot = (*slot).max(cycle);
    }

    pub fn record_int_write(&mut self, reg: u8, cycle: u32) {
        self.int_latency[reg as usize] = cycle + 1;
    }

    pub fn record_fp_read(&mut self, reg: u8, cycle: u32) {
        let slot = &mut self.fp_read_cycle[reg as usize];
        *slot = (*slot).max(cycle);
    }

    pub fn record_fp_write(&mut self, reg: u8, cycle: u32) {
        self.fp_latency[reg as usize] = cycle + 1;
    }

    /// A taken branch may rewrite any register from the next cycle on
    pub fn record_branch(&mut self, cycle: u32) {
        self.int_latency = [cycle + 1; 8];
    }

    /// Floating work after CFROUND must run in a later cycle
    pub fn record_rounding_change(&mut self, cycle: u32) {
        self.fp_latency = [cycle + 1; 8];
    }

    /// Reads wait for the cycle after a store; L3 stores also gate L3 reads
    pub fn record_store(&mut self, cycle: u32, to_l3: bool) {
        self.scratchpad_latency = cycle + 1;
        if to_l3 {
            self.scratchpad_high_latency = cycle + 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::randomx::program::EntropyBuffer;

    fn program(instructions: &[Instruction]) -> Program {
        Program::decode(&EntropyBuffer::from_parts(&[0; 16], instructions))
    }

    fn write(reg: u8) -> Instruction {
        Instruction::new(Opcode::IXOR_R, reg, (reg + 1) & 7, 0, 0)
    }

    fn branch() -> Instruction {
        Instruction::new(Opcode::CBRANCH, 0, 0, 0, 0)
    }

    #[test]
    fn never_written_register_wins() {
        // r0..r5 written; r6 never written, r7 never written
        let mut instrs: Vec<_> = (0..6).map(write).collect();
        instrs.push(branch());
        let analysis = BranchAnalysis::analyze(&program(&instrs));
        let b = analysis.branch(6).unwrap();
        assert_eq!(b.condition_register, 6);
        assert_eq!(b.target, 0);
        assert!(analysis.is_target(0));
    }

    #[test]
    fn oldest_write_then_usage_then_index() {
        let mut instrs = vec![branch()]; // 0: every register redefined at 0
        instrs.extend([write(3), write(1), write(5)]); // 1..=3
        instrs.push(branch()); // 4: r0, r2, r4, r6, r7 tie at 0; r0 already used once
        instrs.push(branch()); // 5: all at 4; r0 and r2 used once
        let analysis = BranchAnalysis::analyze(&program(&instrs));

        assert_eq!(analysis.branch(0).unwrap().condition_register, 0);
        let second = analysis.branch(4).unwrap();
        assert_eq!(second.condition_register, 2);
        assert_eq!(second.target, 1);

        let third = analysis.branch(5).unwrap();
        assert_eq!(third.condition_register, 1);
        assert_eq!(third.target, 5);
        assert!(analysis.is_target(5));
    }

    #[test]
    fn usage_count_breaks_ties() {
        let mut history = RegisterHistory::default();
        history.record_branch(0);
        let picks: Vec<u8> = (0..10).map(|_| history.select_condition_register().0).collect();
        assert_eq!(picks, vec![0, 1, 2, 3, 4, 5, 6, 7, 0, 1]);
        assert_eq!(history.usage(0), 2);
        assert_eq!(history.usage(7), 1);
    }

    #[test]
    fn degenerate_instructions_do_not_write() {
        let pow2 = Instruction::new(Opcode::IMUL_RCP, 2, 0, 0, 1 << 12);
        let zero = Instruction::new(Opcode::IMUL_RCP, 2, 0, 0, 0);
        let swap_self = Instruction::new(Opcode::ISWAP_R, 4, 4, 0, 0);
        let store = Instruction::new(Opcode::ISTORE, 1, 2, 0, 0);
        for instr in [pow2, zero, swap_self, store] {
            assert_eq!(written_registers(&instr), [None, None]);
        }
        let swap = Instruction::new(Opcode::ISWAP_R, 4, 6, 0, 0);
        assert_eq!(written_registers(&swap), [Some(4), Some(6)]);
        let rcp = Instruction::new(Opcode::IMUL_RCP, 2, 0, 0, 7);
        assert_eq!(written_registers(&rcp), [Some(2), None]);
    }

    #[test]
    fn latency_bookkeeping() {
        let mut t = LatencyTracker::default();
        t.record_int_write(3, 4);
        t.record_int_read(2, 7);
        t.record_int_read(2, 5);
        assert_eq!(t.int_ready(3), 5);
        assert_eq!(t.int_read_cycle(2), 7);

        t.record_store(9, false);
        assert_eq!(t.memory_ready(false), 10);
        assert_eq!(t.memory_ready(true), 0);
        t.record_store(11, true);
        assert_eq!(t.memory_ready(true), 12);

        t.record_branch(12);
        assert!((0..8).all(|r| t.int_ready(r) == 13));
        t.record_rounding_change(14);
        assert!((0..8).all(|r| t.fp_ready(r) == 15));
    }
}
