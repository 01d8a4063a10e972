//! framemux: multi-channel frame synchronization and inference scheduling.
//!
//! This crate is the concurrency core of a multi-source video analytics
//! pipeline: it admits frames from independently-clocked channels, merges
//! or barrier-synchronizes them for shared stages, schedules asynchronous
//! hardware inference without giving up per-source ordering, and routes
//! tagged results back out to per-source destinations.
//!
//! # Architecture
//!
//! Components, in data-flow order:
//!
//! 1. [`selector::InputSelector`]: N channels in, one timestamp-ascending
//!    channel out, with bounded per-channel queues (backpressure).
//! 2. [`infer::InferScheduler`]: submits tensors to an
//!    [`engine::InferenceEngine`] asynchronously, delivers strictly in
//!    submission order.
//! 3. [`muxer::Muxer`] / [`gather::Gather`]: tick-synchronized barrier
//!    and latest-wins metadata merge for multi-branch topologies.
//! 4. [`router::Router`]: one tagged channel back out to N destinations.
//!
//! All of them exchange [`StreamItem`]s over queues; none holds a lock
//! across a call into another component. Scheduling is plain OS threads
//! with mutex + condition-variable handoff, no async runtime.
//!
//! End-of-stream is two-tier: each channel drains to a channel-scoped
//! [`StreamItem::ChannelEos`], and only once every registered channel has
//! drained does the terminal [`StreamItem::GlobalEos`] fire.

pub mod config;
pub mod engine;
pub mod gather;
pub mod infer;
pub mod meta;
pub mod muxer;
pub mod pool;
pub mod router;
pub mod selector;
pub mod sink;

use anyhow::{anyhow, Result};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

pub use meta::{DetectionRecord, FrameId, FrameRecord, TensorSet, UserExtension};
pub use pool::{MemoryPool, PoolBlock};

/// Presentation timestamp in nanoseconds. Frames without a valid timestamp
/// carry `None` and are dropped at admission.
pub type ClockTime = u64;

/// Identifier of one independently-driven source channel.
pub type StreamId = u32;

/// Broadcast-style control announcements that travel with the data flow but
/// are not themselves frames.
#[derive(Clone, Debug, PartialEq)]
pub enum ControlEvent {
    /// Video format announcement for the channel that is currently active.
    Format {
        width: i32,
        height: i32,
        format: String,
        frame_rate: f32,
    },
    /// Free-form announcement.
    Custom {
        name: String,
        payload: serde_json::Value,
    },
}

/// Everything that flows between pipeline components.
#[derive(Debug)]
pub enum StreamItem {
    Frame(FrameRecord),
    /// Untargeted control announcement; see [`StreamItem::RouteMarker`].
    Control(ControlEvent),
    /// Sideband marker announcing which source the next control event
    /// belongs to. Emitted immediately before the event it targets.
    RouteMarker(StreamId),
    /// Channel-scoped end-of-stream. Carries its source id explicitly so it
    /// stays routable independent of data flow.
    ChannelEos(StreamId),
    /// Pipeline-terminal end-of-stream.
    GlobalEos,
}

/// Lifecycle state of a pipeline component.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ComponentState {
    Stopped,
    Prepared,
    Running,
    Draining,
}

/// Common lifecycle + ingestion surface of every component.
///
/// `process` accepts any [`StreamItem`]; frames are dispatched by the
/// stream id they carry. Components with richer typed entry points
/// (`admit`, `submit`, ...) implement `process` in terms of them.
pub trait Stage {
    fn start(&mut self) -> Result<()>;
    fn process(&mut self, item: StreamItem) -> Result<()>;
    fn stop(&mut self);
    fn state(&self) -> ComponentState;
}

// -------------------- Pipeline context --------------------

/// Allocator for process-unique detection `meta_id`s.
///
/// Cloning shares the underlying counter, so every allocator derived from
/// one [`PipelineContext`] draws from the same id space.
#[derive(Clone, Debug, Default)]
pub struct MetaIdAllocator {
    next: Arc<AtomicU64>,
}

impl MetaIdAllocator {
    pub fn next(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

/// Per-pipeline shared context: the meta-id space and the stage-id
/// registry. One instance per pipeline, passed to each component at
/// construction: there is no process-wide state.
#[derive(Clone, Default)]
pub struct PipelineContext {
    meta_ids: MetaIdAllocator,
    stages: Arc<Mutex<BTreeSet<u32>>>,
}

impl PipelineContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn meta_ids(&self) -> MetaIdAllocator {
        self.meta_ids.clone()
    }

    /// Claim a stage-id for one producing component. Claiming the same id
    /// twice is a configuration error and fails at construction time.
    pub fn register_stage(&self, stage_id: u32) -> Result<()> {
        let mut stages = self.stages.lock().expect("stage registry poisoned");
        if !stages.insert(stage_id) {
            return Err(anyhow!("stage-id {stage_id} is already registered"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_stage_registration_fails() {
        let ctx = PipelineContext::new();
        ctx.register_stage(4).unwrap();
        assert!(ctx.register_stage(4).is_err());
        ctx.register_stage(5).unwrap();
    }

    #[test]
    fn meta_id_allocators_share_one_id_space() {
        let ctx = PipelineContext::new();
        let a = ctx.meta_ids();
        let b = ctx.meta_ids();
        let first = a.next();
        let second = b.next();
        assert_ne!(first, second);
    }
}
