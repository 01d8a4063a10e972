//! Inference engine boundary.
//!
//! The scheduler talks to hardware through [`InferenceEngine`]: a
//! non-blocking `submit` that returns a request handle, a blocking `wait`
//! on one handle, and an output-size query used to size the output memory
//! pool. The engine writes its result into a caller-provided pool block so
//! output memory is recycled, never reallocated per frame.
//!
//! [`StubEngine`] is the in-tree implementation for demos and tests. It
//! completes requests after a configurable per-request latency, so requests
//! can finish out of submission order just like real hardware.

use anyhow::{anyhow, Result};
use rand::Rng;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::meta::{DataType, Tensor, TensorSet};
use crate::pool::PoolBlock;

/// Handle for one in-flight inference request.
pub type RequestId = u64;

/// Asynchronous hardware inference boundary.
pub trait InferenceEngine: Send + Sync {
    /// Hand one input tensor set to the engine. Never blocks; the result
    /// is written into `output` and retrieved via [`InferenceEngine::wait`].
    fn submit(&self, input: &TensorSet, output: PoolBlock) -> Result<RequestId>;

    /// Block until the given request completes and take its output tensors.
    fn wait(&self, request: RequestId) -> Result<TensorSet>;

    /// Size in bytes of one output buffer.
    fn output_size(&self) -> usize;
}

enum LatencyModel {
    /// Uniform random latency up to the given bound.
    Jitter(Duration),
    /// Fixed per-request schedule, indexed by submission order.
    Schedule(Vec<Duration>),
}

struct StubRequest {
    ready_at: Instant,
    output: PoolBlock,
}

struct StubState {
    next_id: RequestId,
    submitted: u64,
    pending: HashMap<RequestId, StubRequest>,
}

/// Software stand-in for an inference device.
///
/// "Inference" sums the input bytes into the head of the output block, which
/// is enough for tests to check that outputs line up with their inputs.
pub struct StubEngine {
    output_size: usize,
    latency: LatencyModel,
    state: Mutex<StubState>,
}

impl StubEngine {
    pub fn new(output_size: usize) -> Self {
        Self::with_latency(output_size, LatencyModel::Jitter(Duration::from_millis(5)))
    }

    /// Per-request completion latencies, assigned in submission order. A
    /// descending schedule makes later requests complete first.
    pub fn with_schedule(output_size: usize, schedule: Vec<Duration>) -> Self {
        Self::with_latency(output_size, LatencyModel::Schedule(schedule))
    }

    fn with_latency(output_size: usize, latency: LatencyModel) -> Self {
        Self {
            output_size,
            latency,
            state: Mutex::new(StubState {
                next_id: 0,
                submitted: 0,
                pending: HashMap::new(),
            }),
        }
    }

    fn latency_for(&self, submission_index: u64) -> Duration {
        match &self.latency {
            LatencyModel::Jitter(max) => {
                let max_us = max.as_micros().max(1) as u64;
                Duration::from_micros(rand::thread_rng().gen_range(0..max_us))
            }
            LatencyModel::Schedule(schedule) if schedule.is_empty() => Duration::ZERO,
            LatencyModel::Schedule(schedule) => {
                schedule[(submission_index as usize) % schedule.len()]
            }
        }
    }
}

impl InferenceEngine for StubEngine {
    fn submit(&self, input: &TensorSet, mut output: PoolBlock) -> Result<RequestId> {
        let sum: u64 = input
            .iter()
            .flat_map(|t| t.data().iter())
            .map(|b| *b as u64)
            .sum();
        let out = output.as_mut_slice();
        out.fill(0);
        if out.len() >= 8 {
            out[..8].copy_from_slice(&sum.to_le_bytes());
        }

        let mut state = self.state.lock().expect("stub engine mutex poisoned");
        let id = state.next_id;
        state.next_id += 1;
        let latency = self.latency_for(state.submitted);
        state.submitted += 1;
        state.pending.insert(
            id,
            StubRequest {
                ready_at: Instant::now() + latency,
                output,
            },
        );
        Ok(id)
    }

    fn wait(&self, request: RequestId) -> Result<TensorSet> {
        let entry = {
            let mut state = self.state.lock().expect("stub engine mutex poisoned");
            state
                .pending
                .remove(&request)
                .ok_or_else(|| anyhow!("unknown inference request {request}"))?
        };

        let now = Instant::now();
        if entry.ready_at > now {
            std::thread::sleep(entry.ready_at - now);
        }

        let shape = vec![entry.output.len() as i64];
        let mut set = TensorSet::new();
        set.push(Tensor::from_block("logits", shape, DataType::U8, entry.output));
        Ok(set)
    }

    fn output_size(&self) -> usize {
        self.output_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::MemoryPool;

    fn input(bytes: Vec<u8>) -> TensorSet {
        let mut set = TensorSet::new();
        let shape = vec![bytes.len() as i64];
        set.push(Tensor::from_vec("pixels", shape, DataType::U8, bytes));
        set
    }

    #[test]
    fn output_echoes_input_checksum() -> Result<()> {
        let engine = StubEngine::with_schedule(16, vec![Duration::ZERO]);
        let pool = MemoryPool::new(engine.output_size(), 1)?;

        let id = engine.submit(&input(vec![1, 2, 3]), pool.allocate())?;
        let output = engine.wait(id)?;

        let logits = output.get("logits").expect("logits tensor");
        assert_eq!(&logits.data()[..8], &6u64.to_le_bytes());
        Ok(())
    }

    #[test]
    fn waiting_twice_on_one_request_fails() -> Result<()> {
        let engine = StubEngine::with_schedule(8, vec![Duration::ZERO]);
        let pool = MemoryPool::new(engine.output_size(), 1)?;

        let id = engine.submit(&input(vec![9]), pool.allocate())?;
        engine.wait(id)?;
        assert!(engine.wait(id).is_err());
        Ok(())
    }

    #[test]
    fn output_blocks_recycle_through_the_pool() -> Result<()> {
        let engine = StubEngine::with_schedule(8, vec![Duration::ZERO]);
        let pool = MemoryPool::new(engine.output_size(), 1)?;

        let id = engine.submit(&input(vec![1]), pool.allocate())?;
        let output = engine.wait(id)?;
        assert_eq!(pool.free_blocks(), 0);
        drop(output);
        assert_eq!(pool.free_blocks(), 1);
        Ok(())
    }
}
