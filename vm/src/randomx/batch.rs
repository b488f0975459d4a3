//! Batch Driver
//!
//! Initializes many VM instances from their entropy buffers and runs them
//! side by side. Instances share nothing but the read-only dataset, so each
//! batch of rounds is spread over the rayon pool without synchronization.
//!
//! The flow for one batch of instances:
//! 1. Decode every entropy buffer and compile it for the configured lanes
//! 2. Run the rounds in slices of `batch_iterations`, the first slice
//!    seeding the scratchpad addresses and the last returning the output
//! 3. Optionally replay every instance on the reference interpreter

use std::time::Instant;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::randomx::config::*;
use crate::randomx::error::{Error, Result};
use crate::randomx::interpreter::Interpreter;
use crate::randomx::program::{EntropyBuffer, Program};
use crate::randomx::reference::ReferenceVm;
use crate::randomx::scheduler::{ScheduleStats, Scheduler};
use crate::randomx::scratchpad::{Dataset, Scratchpad};
use crate::randomx::state::{VmOutput, VmState};

/// How a batch is executed
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Lanes cooperating on each instance
    pub workers: WorkersPerHash,
    /// Rounds per instance
    pub iterations: usize,
    /// Rounds per launch; 0 runs everything in one launch
    pub batch_iterations: usize,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            workers: WorkersPerHash::default(),
            iterations: RANDOMX_PROGRAM_ITERATIONS,
            batch_iterations: RANDOMX_PROGRAM_ITERATIONS,
        }
    }
}

impl ExecutionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_workers(mut self, workers: WorkersPerHash) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_iterations(mut self, iterations: usize) -> Self {
        self.iterations = iterations;
        self
    }

    pub fn with_batch_iterations(mut self, batch_iterations: usize) -> Self {
        self.batch_iterations = batch_iterations;
        self
    }

    /// `(iterations, first, last)` for every launch, in order
    pub fn launches(&self) -> Vec<(usize, bool, bool)> {
        let step = match self.batch_iterations {
            0 => self.iterations,
            n => n.min(self.iterations),
        };
        if step == 0 {
            return vec![(0, true, true)];
        }

        let mut launches = Vec::with_capacity(self.iterations.div_ceil(step));
        let mut done = 0;
        while done < self.iterations {
            let n = step.min(self.iterations - done);
            launches.push((n, done == 0, done + n == self.iterations));
            done += n;
        }
        launches
    }
}

/// Compile a decoded program and build its initial state
pub fn init_vm(program: &Program, workers: WorkersPerHash) -> (VmState, ScheduleStats) {
    let (compiled, stats) = Scheduler::new(workers).compile(program);
    (VmState::new(program, compiled), stats)
}

/// A set of independent VM instances sharing one dataset
#[derive(Debug)]
pub struct VmBatch {
    config: ExecutionConfig,
    interpreter: Interpreter,
    programs: Vec<Program>,
    states: Vec<VmState>,
    scratchpads: Vec<Scratchpad>,
    stats: ScheduleStats,
}

impl VmBatch {
    /// One instance per entropy buffer, paired with its scratchpad
    pub fn new(
        config: ExecutionConfig,
        dataset: Dataset,
        buffers: &[EntropyBuffer],
        scratchpads: Vec<Scratchpad>,
    ) -> Result<Self> {
        if buffers.len() != scratchpads.len() {
            return Err(Error::BatchShape {
                states: buffers.len(),
                scratchpads: scratchpads.len(),
            });
        }

        let start = Instant::now();
        let programs: Vec<Program> = buffers.par_iter().map(Program::decode).collect();
        let (states, per_program): (Vec<VmState>, Vec<ScheduleStats>) = programs
            .par_iter()
            .map(|program| init_vm(program, config.workers))
            .unzip();

        let mut stats = ScheduleStats::default();
        for s in &per_program {
            stats.merge(s);
        }
        info!(
            instances = states.len(),
            workers = config.workers.lanes(),
            cycles = stats.cycles,
            ipc = stats.ipc(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "compiled batch"
        );

        Ok(Self {
            config,
            interpreter: Interpreter::new(config.workers, dataset),
            programs,
            states,
            scratchpads,
            stats,
        })
    }

    /// `count` instances with entropy and scratchpads derived from `seed`
    pub fn from_seed(
        config: ExecutionConfig,
        dataset: Dataset,
        seed: &[u8],
        count: usize,
    ) -> Result<Self> {
        let buffers: Vec<EntropyBuffer> = (0..count as u64)
            .into_par_iter()
            .map(|nonce| EntropyBuffer::from_seed(seed, nonce))
            .collect();
        let scratchpads: Vec<Scratchpad> = (0..count as u64)
            .into_par_iter()
            .map(|nonce| Scratchpad::from_seed(seed, nonce))
            .collect();
        Self::new(config, dataset, &buffers, scratchpads)
    }

    pub fn config(&self) -> &ExecutionConfig {
        &self.config
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// Scheduler counters summed over every instance
    pub fn stats(&self) -> ScheduleStats {
        self.stats
    }

    pub fn states(&self) -> &[VmState] {
        &self.states
    }

    pub fn scratchpads(&self) -> &[Scratchpad] {
        &self.scratchpads
    }

    /// Run every launch over all instances; returns one output per instance
    pub fn run(&mut self) -> Result<Vec<VmOutput>> {
        let start = Instant::now();
        let interpreter = &self.interpreter;
        let mut outputs = Vec::new();

        for (launch, (iterations, first, last)) in self.config.launches().into_iter().enumerate() {
            let results: Vec<Option<VmOutput>> = self
                .states
                .par_iter_mut()
                .zip(self.scratchpads.par_iter_mut())
                .map(|(state, scratchpad)| {
                    interpreter.execute(state, scratchpad, iterations, first, last)
                })
                .collect::<Result<_>>()?;
            debug!(launch, iterations, first, last, "launch finished");
            if last {
                outputs = results.into_iter().flatten().collect();
            }
        }

        let elapsed = start.elapsed();
        let hashes_per_sec = self.len() as f64 / elapsed.as_secs_f64().max(f64::EPSILON);
        info!(
            instances = self.len(),
            iterations = self.config.iterations,
            elapsed_ms = elapsed.as_millis() as u64,
            hashes_per_sec,
            "batch finished"
        );
        Ok(outputs)
    }

    /// Outputs the reference interpreter produces from the current states.
    /// Call before [`VmBatch::run`] to get the expected results.
    pub fn expected_outputs(&self) -> Vec<VmOutput> {
        let dataset = self.interpreter.dataset();
        let launches = self.config.launches();

        self.programs
            .par_iter()
            .zip(self.states.par_iter())
            .zip(self.scratchpads.par_iter())
            .map(|((program, state), scratchpad)| {
                let vm = ReferenceVm::new(program.clone(), dataset.clone());
                let mut state = state.clone();
                let mut scratchpad = scratchpad.clone();
                let mut output = None;
                for &(iterations, first, last) in &launches {
                    output = vm.execute(&mut state, &mut scratchpad, iterations, first, last);
                }
                output.unwrap_or_else(|| state.output())
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dataset() -> Dataset {
        Dataset::from_seed(b"batch dataset", 64 * 1024).unwrap()
    }

    #[test]
    fn launches_cover_all_iterations() {
        let config = ExecutionConfig::new().with_iterations(10).with_batch_iterations(4);
        assert_eq!(
            config.launches(),
            vec![(4, true, false), (4, false, false), (2, false, true)]
        );

        let whole = config.with_batch_iterations(0);
        assert_eq!(whole.launches(), vec![(10, true, true)]);

        let empty = config.with_iterations(0);
        assert_eq!(empty.launches(), vec![(0, true, true)]);
    }

    #[test]
    fn config_serializes_lane_count() {
        let config = ExecutionConfig::new().with_workers(WorkersPerHash::Four);
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"workers\":4"));
        let back: ExecutionConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
        assert!(serde_json::from_str::<ExecutionConfig>(
            r#"{"workers":3,"iterations":1,"batch_iterations":1}"#
        )
        .is_err());
    }

    #[test]
    fn mismatched_scratchpads_rejected() {
        let buffers = vec![EntropyBuffer::from_seed(b"x", 0)];
        let err = VmBatch::new(ExecutionConfig::new(), dataset(), &buffers, Vec::new()).unwrap_err();
        assert!(matches!(err, Error::BatchShape { states: 1, scratchpads: 0 }));
    }

    #[test]
    fn split_launches_match_single_launch() {
        let config = ExecutionConfig::new()
            .with_workers(WorkersPerHash::Two)
            .with_iterations(6);
        let mut whole = VmBatch::from_seed(config, dataset(), b"split", 2).unwrap();
        let mut split =
            VmBatch::from_seed(config.with_batch_iterations(4), dataset(), b"split", 2).unwrap();
        assert_eq!(whole.run().unwrap(), split.run().unwrap());
    }

    #[test]
    fn batch_matches_reference() {
        let config = ExecutionConfig::new().with_iterations(3).with_batch_iterations(2);
        let mut batch = VmBatch::from_seed(config, dataset(), b"reference", 3).unwrap();
        let expected = batch.expected_outputs();
        let outputs = batch.run().unwrap();
        assert_eq!(outputs.len(), 3);
        assert_eq!(outputs, expected);
        assert!(batch.stats().instructions > 0);
    }
}
