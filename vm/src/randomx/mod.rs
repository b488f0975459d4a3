//! RandomX VM on lockstep lanes
//!
//! Reference: https://github.com/tevador/RandomX/blob/master/doc/specs.md

pub mod config;
pub mod error;
pub mod blake2b;
pub mod program;
pub mod state;
pub mod softfloat;
pub mod scratchpad;
pub mod encoding;
pub mod tracker;
pub mod plan;
pub mod scheduler;
pub mod lanes;
pub mod interpreter;
pub mod reference;
pub mod batch;

pub use config::*;
