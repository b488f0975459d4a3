//! Instruction Scheduler/Compiler
//!
//! Maps the 256 raw instructions onto `(cycle, lane)` slots in one forward
//! pass, then serializes the plan into compiled words plus an immediate
//! buffer.
//!
//! Placement rules, per instruction:
//! - nothing is placed before its operands are ready (see [`LatencyTracker`])
//!   or before a register it overwrites was last read;
//! - branch targets and CBRANCH never move ahead of anything scheduled
//!   before them, and nothing scheduled after them moves ahead of them;
//! - floating work stays on the correct side of every CFROUND;
//! - a floating instruction takes two adjacent slots of one cycle and is
//!   kept ahead of the integer slots of that cycle, relocating one integer
//!   pair forward when needed.
//!
//! Each cycle's occupied slots therefore form a prefix of its lanes with
//! floating slots first, which is the dispatch group the interpreter runs.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::randomx::config::*;
use crate::randomx::encoding::{imm_with_window, reciprocal, CompiledInstruction, ExecOp, Location};
use crate::randomx::plan::{ExecutionPlan, Slot};
use crate::randomx::program::{Instruction, Program};
use crate::randomx::scratchpad::Window;
use crate::randomx::state::CompiledProgram;
use crate::randomx::tracker::{is_zero_or_power_of_two, BranchAnalysis, LatencyTracker};

/// Counters describing one schedule
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleStats {
    /// Raw instructions that received a slot (no-ops get none)
    pub instructions: u32,
    /// Occupied slots; floating instructions count twice
    pub slots: u32,
    pub cycles: u32,
    /// Compiled words emitted
    pub words: u32,
}

impl ScheduleStats {
    /// Raw instructions retired per cycle
    pub fn ipc(&self) -> f64 {
        if self.cycles == 0 {
            return 0.0;
        }
        self.instructions as f64 / self.cycles as f64
    }

    pub fn merge(&mut self, other: &ScheduleStats) {
        self.instructions += other.instructions;
        self.slots += other.slots;
        self.cycles += other.cycles;
        self.words += other.words;
    }
}

/// Hazard profile of one raw instruction
#[derive(Clone, Copy, Debug)]
struct Hazards {
    /// Register the instruction writes: integer, or combined F/E index
    dst: u8,
    /// First cycle all operands are available
    latency: u32,
    float: bool,
    reads_src: bool,
    memory: bool,
    store: bool,
    branch: bool,
    swap: bool,
    cfround: bool,
}

impl Hazards {
    fn int(dst: u8, latency: u32) -> Self {
        Self {
            dst,
            latency,
            float: false,
            reads_src: true,
            memory: false,
            store: false,
            branch: false,
            swap: false,
            cfround: false,
        }
    }

    fn float(dst: u8, latency: u32) -> Self {
        Self {
            float: true,
            reads_src: false,
            ..Self::int(dst, latency)
        }
    }
}

/// Schedules programs for a fixed number of lanes per hash
#[derive(Clone, Copy, Debug, Default)]
pub struct Scheduler {
    workers: WorkersPerHash,
}

impl Scheduler {
    pub fn new(workers: WorkersPerHash) -> Self {
        Self { workers }
    }

    pub fn workers(&self) -> WorkersPerHash {
        self.workers
    }

    /// Assign every raw instruction a slot
    pub fn schedule(&self, program: &Program) -> Schedule {
        let branches = BranchAnalysis::analyze(program);
        let mut plan = ExecutionPlan::new(self.workers.lanes());
        let w = plan.workers();

        let mut tracker = LatencyTracker::default();
        let mut targets = [false; RANDOMX_PROGRAM_SIZE];
        let mut is_branch = [false; RANDOMX_PROGRAM_SIZE];
        let mut stats = ScheduleStats::default();

        let mut first_available = 0usize;
        let mut last_used: Option<usize> = None;
        let mut last_memory_op_slot: Option<usize> = None;
        let mut first_allowed_cfround = 0usize;
        let mut pending_target = false;

        for (i, instr) in program.instructions.iter().enumerate() {
            let mut is_target = branches.is_target(i);
            if is_target {
                first_available = after(last_used);
            }

            let condition_register = branches.branch(i).map(|b| b.condition_register);
            let Some(hz) = hazards(instr, condition_register, &tracker, last_memory_op_slot, w)
            else {
                // ISWAP_R r, r and IMUL_RCP by zero or a power of two take no
                // slot and emit no word; the next placed instruction inherits
                // the jump target
                pending_target |= is_target;
                continue;
            };
            if pending_target {
                is_target = true;
                pending_target = false;
            }
            if hz.branch {
                first_available = first_available.max(after(last_used));
            }

            let mut first_allowed = first_available.max(hz.latency as usize * w);
            if hz.cfround {
                first_allowed = first_allowed.max(first_allowed_cfround);
            } else if hz.float {
                first_allowed = first_allowed.max(tracker.fp_read_cycle(hz.dst) as usize * w);
            } else {
                first_allowed = first_allowed.max(tracker.int_read_cycle(hz.dst) as usize * w);
            }
            if hz.swap {
                first_allowed = first_allowed.max(tracker.int_read_cycle(instr.src) as usize * w);
            }

            let span = if hz.float { plan.float_width() } else { 1 };
            let slot = if hz.float && span == 2 {
                place_float_pair(&mut plan, first_allowed, i, is_target, &targets, &is_branch)
            } else {
                let slot = first_free_slot(&plan, first_allowed, last_used);
                if hz.float {
                    plan.place_float(slot, i);
                } else {
                    plan.place_int(slot, i);
                }
                slot
            };
            targets[i] = is_target;
            is_branch[i] = hz.branch;

            if hz.cfround {
                first_allowed_cfround = (slot / w + 1) * w;
            }

            stats.instructions += 1;
            stats.slots += span as u32;
            let cycle = (slot / w) as u32;

            if hz.reads_src {
                tracker.record_int_read(instr.src, cycle);
            }
            if hz.memory {
                last_memory_op_slot = Some(last_memory_op_slot.map_or(slot, |s| s.max(slot)));
            }

            if hz.cfround {
                tracker.record_rounding_change(cycle);
            } else if hz.float {
                tracker.record_fp_write(hz.dst, cycle);
                tracker.record_fp_read(hz.dst, cycle);
            } else {
                if !hz.store {
                    tracker.record_int_write(hz.dst, cycle);
                    if hz.swap {
                        tracker.record_int_write(instr.src, cycle);
                    }
                    tracker.record_int_read(hz.dst, cycle);
                }
                if hz.branch {
                    tracker.record_branch(cycle);
                }
                if hz.store {
                    tracker.record_int_read(hz.dst, cycle);
                    tracker.record_store(cycle, instr.mod_cond() >= STORE_L3_CONDITION);
                }
            }

            while first_available < plan.len() && !plan.is_free(first_available) {
                first_available += 1;
            }
            if is_target {
                first_available = first_available.max(slot + span);
            }
            if hz.branch {
                first_available = first_available.max(slot + 1);
            }

            let mut last = last_used.map_or(slot + span - 1, |l| l.max(slot + span - 1));
            while last + 1 < plan.len() && !plan.is_free(last + 1) {
                last += 1;
            }
            last_used = Some(last);

            if hz.float && last >= first_allowed_cfround {
                first_allowed_cfround = last + 1;
            }
        }

        stats.cycles = last_used.map_or(0, |l| (l / w + 1) as u32);
        Schedule {
            workers: self.workers,
            plan,
            instructions: program.instructions,
            branches,
            targets,
            last_used,
            stats,
        }
    }

    /// Schedule and serialize in one step
    pub fn compile(&self, program: &Program) -> (CompiledProgram, ScheduleStats) {
        let schedule = self.schedule(program);
        let compiled = schedule.compile();
        let mut stats = schedule.stats();
        stats.words = compiled.len;
        debug!(
            workers = self.workers.lanes(),
            instructions = stats.instructions,
            slots = stats.slots,
            cycles = stats.cycles,
            words = stats.words,
            ipc = stats.ipc(),
            "program scheduled"
        );
        (compiled, stats)
    }
}

/// First slot after `last_used`
fn after(last_used: Option<usize>) -> usize {
    last_used.map_or(0, |l| l + 1)
}

fn first_free_slot(plan: &ExecutionPlan, first_allowed: usize, last_used: Option<usize>) -> usize {
    if let Some(last) = last_used {
        if let Some(slot) = (first_allowed..=last).find(|&s| plan.is_free(s)) {
            return slot;
        }
    }
    let slot = after(last_used).max(first_allowed);
    assert!(slot < plan.len(), "execution plan exhausted at slot {slot}");
    slot
}

/// Find two free slots in one cycle at or after `first_allowed`, moving the
/// first integer occupant of that cycle into them so the floating pair can
/// take its place. Cycles whose integer occupants include a branch or a
/// branch target are skipped, as are all cycles with integer occupants when
/// the floating instruction is itself a target.
fn place_float_pair(
    plan: &mut ExecutionPlan,
    first_allowed: usize,
    index: usize,
    is_target: bool,
    targets: &[bool; RANDOMX_PROGRAM_SIZE],
    is_branch: &[bool; RANDOMX_PROGRAM_SIZE],
) -> usize {
    let w = plan.workers();
    for j in first_allowed..plan.len() - 1 {
        if !plan.is_free(j) || !plan.is_free(j + 1) || (j + 1) % w == 0 {
            continue;
        }
        let start = plan.cycle_start(j);
        let mut ints = (start..j).filter_map(|s| match plan.get(s) {
            Slot::Int(k) => Some((s, k as usize)),
            _ => None,
        });
        let blocked = ints
            .clone()
            .any(|(_, k)| is_target || targets[k] || is_branch[k]);
        if blocked {
            continue;
        }
        let slot = match ints.next() {
            Some((k, _)) => {
                plan.relocate(k, j);
                k
            }
            None => j,
        };
        plan.place_float(slot, index);
        return slot;
    }
    panic!("no floating slot pair at or after slot {first_allowed}");
}

/// Latency and hazard flags for one instruction; `None` for no-ops
fn hazards(
    instr: &Instruction,
    condition_register: Option<u8>,
    tracker: &LatencyTracker,
    last_memory_op_slot: Option<usize>,
    workers: usize,
) -> Option<Hazards> {
    use Opcode::*;
    let (dst, src) = (instr.dst, instr.src);
    let reg = tracker.int_ready(dst).max(tracker.int_ready(src));
    let high = src == dst && (instr.imm & SCRATCHPAD_L3_MASK64) as usize >= RANDOMX_SCRATCHPAD_L2;

    let hz = match instr.opcode {
        IADD_RS | ISUB_R | IMUL_R | IMULH_R | ISMULH_R | IXOR_R | IROR_R => Hazards::int(dst, reg),
        IADD_M | ISUB_M | IMUL_M | IMULH_M | ISMULH_M | IXOR_M => Hazards {
            memory: true,
            ..Hazards::int(dst, reg.max(tracker.memory_ready(high)))
        },
        IMUL_RCP if is_zero_or_power_of_two(instr.imm) => return None,
        ISWAP_R if src == dst => return None,
        IMUL_RCP | INEG_R => Hazards {
            reads_src: false,
            ..Hazards::int(dst, tracker.int_ready(dst))
        },
        ISWAP_R => Hazards {
            swap: true,
            ..Hazards::int(dst, reg)
        },
        FSWAP_R => Hazards::float(dst, tracker.fp_ready(dst)),
        FADD_R | FSUB_R | FSCAL_R => {
            let reg = dst % RANDOMX_FLOAT_REGISTER_COUNT as u8;
            Hazards::float(reg, tracker.fp_ready(reg))
        }
        FMUL_R | FSQRT_R => {
            let reg = dst % RANDOMX_FLOAT_REGISTER_COUNT as u8 + RANDOMX_FLOAT_REGISTER_COUNT as u8;
            Hazards::float(reg, tracker.fp_ready(reg))
        }
        FADD_M | FSUB_M | FDIV_M => {
            let mut reg = dst % RANDOMX_FLOAT_REGISTER_COUNT as u8;
            if instr.opcode == FDIV_M {
                reg += RANDOMX_FLOAT_REGISTER_COUNT as u8;
            }
            let latency = tracker
                .fp_ready(reg)
                .max(tracker.int_ready(src))
                .max(tracker.memory_ready(false));
            Hazards {
                reads_src: true,
                memory: true,
                ..Hazards::float(reg, latency)
            }
        }
        CBRANCH => {
            let creg = condition_register.unwrap_or(dst);
            Hazards {
                reads_src: false,
                branch: true,
                ..Hazards::int(creg, tracker.int_ready(creg))
            }
        }
        CFROUND => Hazards {
            cfround: true,
            ..Hazards::int(dst, tracker.int_ready(src))
        },
        ISTORE => {
            let after_memory_ops = last_memory_op_slot.map_or(0, |s| (s / workers + 1) as u32);
            Hazards {
                memory: true,
                store: true,
                ..Hazards::int(dst, reg.max(after_memory_ops))
            }
        }
    };
    Some(hz)
}

/// A finished slot assignment
#[derive(Clone, Debug)]
pub struct Schedule {
    workers: WorkersPerHash,
    plan: ExecutionPlan,
    instructions: [Instruction; RANDOMX_PROGRAM_SIZE],
    branches: BranchAnalysis,
    /// Branch targets after no-op targets were handed to the next instruction
    targets: [bool; RANDOMX_PROGRAM_SIZE],
    last_used: Option<usize>,
    stats: ScheduleStats,
}

impl Schedule {
    pub fn plan(&self) -> &ExecutionPlan {
        &self.plan
    }

    /// Slot counters; `words` is filled in by [`Schedule::compile`] callers
    pub fn stats(&self) -> ScheduleStats {
        self.stats
    }

    pub fn last_used_slot(&self) -> Option<usize> {
        self.last_used
    }

    /// Whether raw instruction `index` starts a CBRANCH loop body
    pub fn is_branch_target(&self, index: usize) -> bool {
        self.targets[index]
    }

    /// First slot of raw instruction `index`, `None` for no-ops
    pub fn slot_of(&self, index: usize) -> Option<usize> {
        let end = self.last_used.map_or(0, |l| l + 1);
        (0..end).find(|&s| self.plan.get(s).instruction() == Some(index))
    }

    /// Scheduled raw instructions in slot order, with their slots
    fn scheduled(&self) -> Vec<(usize, usize)> {
        let end = self.last_used.map_or(0, |l| l + 1);
        (0..end)
            .filter_map(|s| self.plan.get(s).instruction().map(|i| (s, i)))
            .collect()
    }

    /// Serialize into compiled words and immediates
    pub fn compile(&self) -> CompiledProgram {
        let order = self.scheduled();
        assert!(
            order.len() <= COMPILED_PROGRAM_CAPACITY,
            "compiled program overflow: {} words",
            order.len()
        );
        debug_assert!(order.first().map_or(true, |&(s, _)| s == 0));

        let mut word_of = [None; RANDOMX_PROGRAM_SIZE];
        for (word, &(_, index)) in order.iter().enumerate() {
            word_of[index] = Some(word);
        }

        let mut compiled = CompiledProgram {
            workers: self.workers,
            ..CompiledProgram::default()
        };
        let mut imm = Immediates {
            buf: &mut compiled.imm,
            len: 0,
        };

        for (word, &(slot, index)) in order.iter().enumerate() {
            let instr = &self.instructions[index];
            let target_word = self.branches.branch(index).map(|b| {
                // a no-op target hands over to the next scheduled instruction
                (b.target..=index)
                    .find_map(|t| word_of[t])
                    .unwrap_or(word)
            });
            let condition_register = self.branches.branch(index).map(|b| b.condition_register);

            let mut ci = encode(instr, condition_register, target_word, &mut imm);
            let (lanes, fp) = self.group_at(slot);
            ci.group_lanes = lanes;
            ci.group_fp = fp;
            compiled.words[word] = ci.to_bits();
        }
        compiled.len = order.len() as u32;
        compiled
    }

    /// Lanes and floating instructions in the run of occupied slots from
    /// `slot` to the end of its cycle
    fn group_at(&self, slot: usize) -> (u8, u8) {
        let end = self.plan.cycle_start(slot) + self.plan.workers();
        let (mut lanes, mut fp) = (0u8, 0u8);
        let mut seen_int = false;
        for s in slot..end {
            match self.plan.get(s) {
                Slot::Free => break,
                Slot::FloatHead(_) => {
                    debug_assert!(!seen_int, "floating slot after integer slot in cycle");
                    fp += 1;
                }
                Slot::Int(_) => seen_int = true,
                Slot::FloatTail(_) => {}
            }
            lanes += 1;
        }
        (lanes, fp)
    }
}

/// Append-only view of the immediate buffer
struct Immediates<'a> {
    buf: &'a mut [u32; IMM_BUF_CAPACITY],
    len: usize,
}

impl Immediates<'_> {
    fn push(&mut self, value: u32) -> u8 {
        assert!(self.len < IMM_BUF_CAPACITY, "immediate buffer overflow");
        self.buf[self.len] = value;
        self.len += 1;
        (self.len - 1) as u8
    }

    fn push_pair(&mut self, lo: u32, hi: u32) -> u8 {
        let index = self.push(lo);
        self.push(hi);
        index
    }
}

fn memory_window(instr: &Instruction) -> Window {
    if instr.mod_mem() != 0 {
        Window::L1
    } else {
        Window::L2
    }
}

/// Integer scratchpad read: `src == dst` reads L3 at the bare immediate
fn int_memory(op: ExecOp, instr: &Instruction, imm: &mut Immediates) -> CompiledInstruction {
    let window = if instr.src == instr.dst {
        Window::L3
    } else {
        memory_window(instr)
    };
    let mut ci = CompiledInstruction::new(op, instr.dst, instr.src);
    ci.location = Location::Memory(window);
    ci.imm_index = imm.push(imm_with_window(instr.imm, window));
    ci
}

fn float_memory(op: ExecOp, dst: u8, instr: &Instruction, imm: &mut Immediates) -> CompiledInstruction {
    let window = memory_window(instr);
    let mut ci = CompiledInstruction::new(op, dst, instr.src);
    ci.location = Location::Memory(window);
    ci.imm_index = imm.push(imm_with_window(instr.imm, window));
    ci
}

/// `src == dst` forms take the sign-extended immediate instead
fn int_register(op: ExecOp, instr: &Instruction, imm: &mut Immediates) -> CompiledInstruction {
    let mut ci = CompiledInstruction::new(op, instr.dst, instr.src);
    if instr.src == instr.dst {
        ci.src_is_imm32 = true;
        ci.imm_index = imm.push(instr.imm);
    }
    ci
}

/// Condition-adjusted addend of a CBRANCH: the tested bit window must see
/// a carry, so its lowest bit is forced on and the bit below it off
pub fn branch_addend(instr: &Instruction) -> (u32, u32) {
    let cshift = instr.mod_cond() as u32 + RANDOMX_JUMP_OFFSET;
    let addend = (instr.imm | (1 << cshift)) & !(1 << (cshift - 1));
    (addend, cshift)
}

/// Compiled word for one raw instruction, pushing its immediates
fn encode(
    instr: &Instruction,
    condition_register: Option<u8>,
    target_word: Option<usize>,
    imm: &mut Immediates,
) -> CompiledInstruction {
    use Opcode::*;
    let (dst, src) = (instr.dst, instr.src);
    let f = |reg: u8| reg % RANDOMX_FLOAT_REGISTER_COUNT as u8;
    let e = |reg: u8| f(reg) + RANDOMX_FLOAT_REGISTER_COUNT as u8;

    match instr.opcode {
        IADD_RS => {
            let op = if dst == REGISTER_NEEDS_DISPLACEMENT {
                ExecOp::AddDisplaced
            } else {
                ExecOp::Add
            };
            let mut ci = CompiledInstruction::new(op, dst, src);
            ci.shift = instr.mod_shift() as u8;
            if op == ExecOp::AddDisplaced {
                ci.imm_index = imm.push(instr.imm);
            }
            ci
        }
        IADD_M => int_memory(ExecOp::Add, instr, imm),
        ISUB_R => CompiledInstruction {
            negative_src: true,
            ..int_register(ExecOp::Add, instr, imm)
        },
        ISUB_M => CompiledInstruction {
            negative_src: true,
            ..int_memory(ExecOp::Add, instr, imm)
        },
        IMUL_R => int_register(ExecOp::Mul, instr, imm),
        IMUL_M => int_memory(ExecOp::Mul, instr, imm),
        IMULH_R => CompiledInstruction::new(ExecOp::MulHigh, dst, src),
        IMULH_M => int_memory(ExecOp::MulHigh, instr, imm),
        ISMULH_R => CompiledInstruction::new(ExecOp::SignedMulHigh, dst, src),
        ISMULH_M => int_memory(ExecOp::SignedMulHigh, instr, imm),
        IMUL_RCP if is_zero_or_power_of_two(instr.imm) => CompiledInstruction::nop(),
        IMUL_RCP => {
            let r = reciprocal(instr.imm);
            let mut ci = CompiledInstruction::new(ExecOp::Mul, dst, src);
            ci.src_is_imm64 = true;
            ci.imm_index = imm.push_pair(r as u32, (r >> 32) as u32);
            ci
        }
        INEG_R => CompiledInstruction::new(ExecOp::Neg, dst, 0),
        IXOR_R => int_register(ExecOp::Xor, instr, imm),
        IXOR_M => int_memory(ExecOp::Xor, instr, imm),
        IROR_R => int_register(ExecOp::Ror, instr, imm),
        ISWAP_R if src == dst => CompiledInstruction::nop(),
        ISWAP_R => CompiledInstruction::new(ExecOp::Swap, dst, src),
        FSWAP_R => CompiledInstruction::new(ExecOp::FloatSwap, dst, 0),
        FADD_R => CompiledInstruction::new(ExecOp::FloatAdd, f(dst), 2 * f(src)),
        FADD_M => float_memory(ExecOp::FloatAdd, f(dst), instr, imm),
        FSUB_R => CompiledInstruction {
            negative_src: true,
            ..CompiledInstruction::new(ExecOp::FloatAdd, f(dst), 2 * f(src))
        },
        FSUB_M => CompiledInstruction {
            negative_src: true,
            ..float_memory(ExecOp::FloatAdd, f(dst), instr, imm)
        },
        FSCAL_R => CompiledInstruction::new(ExecOp::Xor, f(dst), 0),
        FMUL_R => CompiledInstruction::new(ExecOp::FloatMul, e(dst), 2 * f(src)),
        FDIV_M => float_memory(ExecOp::FloatDiv, e(dst), instr, imm),
        FSQRT_R => CompiledInstruction::new(ExecOp::FloatSqrt, e(dst), 0),
        CBRANCH => {
            let creg = condition_register.unwrap_or(dst);
            let (addend, cshift) = branch_addend(instr);
            // target is stored one word early; the interpreter adds it back
            let target = target_word.unwrap_or(0) as i32 - 1;
            let mut ci = CompiledInstruction::new(ExecOp::CondBranch, creg, 0);
            ci.imm_index = imm.push_pair(addend, cshift | ((target << 5) as u32));
            ci
        }
        CFROUND => {
            let mut ci = CompiledInstruction::new(ExecOp::SetRounding, 0, src);
            ci.imm_index = (instr.imm & 63) as u8;
            ci
        }
        ISTORE => {
            let window = if instr.mod_cond() >= STORE_L3_CONDITION {
                Window::L3
            } else {
                memory_window(instr)
            };
            let mut ci = CompiledInstruction::new(ExecOp::Store, dst, src);
            ci.location = Location::Memory(window);
            ci.imm_index = imm.push(imm_with_window(instr.imm, window));
            ci
        }
    }
}

/// Compiled word for a single instruction outside any schedule, with its
/// immediates collected into a fresh buffer. Branches target word 0.
pub fn encode_standalone(instr: &Instruction) -> (CompiledInstruction, Vec<u32>) {
    let mut buf = [0u32; IMM_BUF_CAPACITY];
    let mut imm = Immediates {
        buf: &mut buf,
        len: 0,
    };
    let ci = encode(instr, None, Some(0), &mut imm);
    let len = imm.len;
    (ci, buf[..len].to_vec())
}
