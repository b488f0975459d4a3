//! Errors raised when untrusted bytes enter the VM.
//!
//! Everything past these checks is a fixed-size contract; violations there
//! are assertions, not errors.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("entropy buffer must be {expected} bytes, got {actual}")]
    EntropyLength { expected: usize, actual: usize },

    #[error("VM state must be {expected} bytes, got {actual}")]
    StateLength { expected: usize, actual: usize },

    #[error("scratchpad must be {expected} bytes, got {actual}")]
    ScratchpadLength { expected: usize, actual: usize },

    #[error("dataset length {0} is not a non-zero multiple of 64 bytes")]
    DatasetLength(usize),

    #[error("unsupported workers per hash: {0} (expected 1, 2, 4 or 8)")]
    WorkersPerHash(u32),

    #[error("VM state holds a compiled length of {0} words")]
    ProgramLength(u32),

    #[error("program compiled for {compiled} lanes cannot run on {interpreter} lanes")]
    LaneMismatch { compiled: usize, interpreter: usize },

    #[error("instance count mismatch: {states} states, {scratchpads} scratchpads")]
    BatchShape { states: usize, scratchpads: usize },

    #[error("invalid hex seed: {0}")]
    Hex(#[from] hex::FromHexError),
}
