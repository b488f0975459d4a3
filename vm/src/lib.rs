//! RandomX VM for lockstep multi-lane execution
//!
//! Decodes raw RandomX programs, schedules them onto a fixed number of
//! cooperating lanes per hash, and interprets the compiled form. A
//! sequential reference interpreter runs the raw program for comparison.

pub mod randomx;

// Re-export commonly used items
pub use randomx::batch::{init_vm, ExecutionConfig, VmBatch};
pub use randomx::config::{Opcode, WorkersPerHash};
pub use randomx::error::{Error, Result};
pub use randomx::interpreter::Interpreter;
pub use randomx::program::{EntropyBuffer, Instruction, Program};
pub use randomx::reference::ReferenceVm;
pub use randomx::scheduler::{ScheduleStats, Scheduler};
pub use randomx::scratchpad::{Dataset, Scratchpad};
pub use randomx::softfloat::RoundingMode;
pub use randomx::state::{CompiledProgram, VmOutput, VmState};
