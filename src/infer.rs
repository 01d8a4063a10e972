//! Asynchronous inference scheduling with submission-order delivery.
//!
//! The scheduler decouples request submission from the producer thread
//! while keeping per-source output order across the asynchronous engine
//! boundary. A frame moves through four states:
//!
//! 1. SUBMITTED: its stage-in tensor is handed to the engine, which
//!    returns a non-blocking request handle.
//! 2. QUEUED: frame + handles go onto a bounded FIFO; the producer blocks
//!    here when the FIFO is full.
//! 3. COMPLETED: the delivery thread pops the FIFO strictly in submission
//!    order and blocks on that entry's own handles, so even an engine that
//!    completes requests out of order cannot reorder the output.
//! 4. DELIVERED: result tensors are attached under the stage-out id and
//!    the frame is forwarded.
//!
//! A frame without the stage-in tensor skips submission entirely and rides
//! through delivery undecorated. That is never fatal and never retried.
//!
//! Per-source EOS is withheld while the source still has frames in flight
//! (pending-count > 0) and forwarded exactly once the count reaches zero.

use anyhow::{anyhow, Result};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;

use crate::engine::{InferenceEngine, RequestId};
use crate::pool::MemoryPool;
use crate::{ComponentState, FrameRecord, PipelineContext, Stage, StreamId, StreamItem};

pub const DEFAULT_QUEUE_DEPTH: usize = 3;
pub const DEFAULT_POOL_SIZE: usize = 4;

/// Recognized options for the inference scheduler.
#[derive(Clone, Debug)]
pub struct InferConfig {
    /// Stage-id of the input tensor set consumed by the engine.
    pub stage_in_id: u32,
    /// Stage-id under which output tensors are attached.
    pub stage_out_id: u32,
    /// Per-detection submission instead of per-frame.
    pub secondary_mode: bool,
    /// Bounded FIFO depth between submission and delivery.
    pub queue_depth: usize,
    /// Preallocated output blocks.
    pub pool_size: usize,
}

impl Default for InferConfig {
    fn default() -> Self {
        Self {
            stage_in_id: 0,
            stage_out_id: 0,
            secondary_mode: false,
            queue_depth: DEFAULT_QUEUE_DEPTH,
            pool_size: DEFAULT_POOL_SIZE,
        }
    }
}

/// One queued frame plus the engine handles that must complete before it
/// may be delivered. `None` as the detection index means a frame-level
/// request.
struct Pending {
    frame: FrameRecord,
    requests: Vec<(Option<usize>, RequestId)>,
}

struct InferState {
    queue: VecDeque<Pending>,
    /// submitted(channel) - delivered(channel), at all times.
    pending_counts: BTreeMap<StreamId, u64>,
    /// Channels whose EOS arrived while frames were still in flight.
    withheld_eos: BTreeSet<StreamId>,
    global_eos: bool,
    /// A frame has been popped but not yet forwarded.
    delivering: bool,
    running: bool,
    component: ComponentState,
}

struct Shared {
    state: Mutex<InferState>,
    /// Producers blocked on a full FIFO.
    submit_cv: Condvar,
    /// Delivery thread waiting for work.
    deliver_cv: Condvar,
}

/// Order-preserving scheduler in front of an [`InferenceEngine`].
pub struct InferScheduler {
    shared: Arc<Shared>,
    engine: Arc<dyn InferenceEngine>,
    pool: MemoryPool,
    cfg: InferConfig,
    out: Sender<StreamItem>,
    thread: Option<JoinHandle<()>>,
}

impl InferScheduler {
    /// Fails at construction on configuration errors: a stage-out id that
    /// is already claimed, zero queue depth, or an engine that reports no
    /// output size.
    pub fn new(
        ctx: &PipelineContext,
        cfg: InferConfig,
        engine: Arc<dyn InferenceEngine>,
        out: Sender<StreamItem>,
    ) -> Result<Self> {
        if cfg.queue_depth == 0 {
            return Err(anyhow!("scheduler queue_depth must be at least 1"));
        }
        if cfg.pool_size == 0 {
            return Err(anyhow!("scheduler pool_size must be at least 1"));
        }
        ctx.register_stage(cfg.stage_out_id)?;
        let output_size = engine.output_size();
        if output_size == 0 {
            return Err(anyhow!("inference engine reports zero output size"));
        }
        let pool = MemoryPool::new(output_size, cfg.pool_size)?;
        Ok(Self {
            shared: Arc::new(Shared {
                state: Mutex::new(InferState {
                    queue: VecDeque::new(),
                    pending_counts: BTreeMap::new(),
                    withheld_eos: BTreeSet::new(),
                    global_eos: false,
                    delivering: false,
                    running: false,
                    component: ComponentState::Prepared,
                }),
                submit_cv: Condvar::new(),
                deliver_cv: Condvar::new(),
            }),
            engine,
            pool,
            cfg,
            out,
            thread: None,
        })
    }

    /// Submit one frame. The engine request (if any) is issued before the
    /// frame enters the FIFO; the call then blocks while the FIFO is full.
    pub fn submit(&self, frame: FrameRecord) -> Result<()> {
        let requests = self.issue_requests(&frame);
        let channel = frame.stream_id;

        let mut state = self.lock();
        loop {
            if !state.running {
                log::debug!("scheduler: dropping frame on channel {channel}, stopping");
                return Ok(());
            }
            if state.queue.len() < self.cfg.queue_depth {
                break;
            }
            state = self
                .shared
                .submit_cv
                .wait(state)
                .expect("scheduler mutex poisoned");
        }
        *state.pending_counts.entry(channel).or_insert(0) += 1;
        state.queue.push_back(Pending { frame, requests });
        self.shared.deliver_cv.notify_one();
        Ok(())
    }

    fn issue_requests(&self, frame: &FrameRecord) -> Vec<(Option<usize>, RequestId)> {
        let stage_in = self.cfg.stage_in_id;
        let mut requests = Vec::new();
        if self.cfg.secondary_mode {
            for (index, detection) in frame.detections.iter().enumerate() {
                let Some(input) = detection.input_tensors.get(&stage_in) else {
                    continue;
                };
                match self.engine.submit(input, self.pool.allocate()) {
                    Ok(id) => requests.push((Some(index), id)),
                    Err(err) => {
                        log::warn!("scheduler: engine refused detection request: {err:#}")
                    }
                }
            }
        } else {
            match frame.input_tensors.get(&stage_in) {
                Some(input) => match self.engine.submit(input, self.pool.allocate()) {
                    Ok(id) => requests.push((None, id)),
                    Err(err) => log::warn!("scheduler: engine refused frame request: {err:#}"),
                },
                None => {
                    // Best-effort skip: the frame passes through
                    // undecorated.
                    log::debug!(
                        "scheduler: frame {:?} has no stage-{stage_in} tensor, skipping",
                        frame.frame_id
                    );
                }
            }
        }
        requests
    }

    /// Record a channel-scoped EOS. Forwarded immediately when the channel
    /// has nothing in flight, otherwise withheld until it drains.
    pub fn channel_eos(&self, channel: StreamId) {
        let forward = {
            let mut state = self.lock();
            if state.pending_counts.get(&channel).copied().unwrap_or(0) == 0 {
                true
            } else {
                state.withheld_eos.insert(channel);
                false
            }
        };
        if forward {
            send_item(&self.out, StreamItem::ChannelEos(channel));
        }
    }

    /// Record the global EOS. Propagates immediately when the FIFO is
    /// already empty, otherwise after in-flight frames drain.
    pub fn global_eos(&self) {
        let forward = {
            let mut state = self.lock();
            state.global_eos = true;
            if state.component == ComponentState::Running {
                state.component = ComponentState::Draining;
            }
            let idle = state.queue.is_empty() && !state.delivering;
            if idle {
                state.component = ComponentState::Stopped;
                state.running = false;
            }
            self.shared.deliver_cv.notify_all();
            idle
        };
        if forward {
            send_item(&self.out, StreamItem::GlobalEos);
        }
    }

    fn lock(&self) -> MutexGuard<'_, InferState> {
        self.shared.state.lock().expect("scheduler mutex poisoned")
    }
}

fn send_item(out: &Sender<StreamItem>, item: StreamItem) {
    if out.send(item).is_err() {
        log::debug!("scheduler: downstream receiver is gone");
    }
}

struct DeliveryContext {
    shared: Arc<Shared>,
    engine: Arc<dyn InferenceEngine>,
    stage_out: u32,
    out: Sender<StreamItem>,
}

fn delivery_loop(ctx: DeliveryContext) {
    loop {
        let pending = {
            let mut state = ctx.shared.state.lock().expect("scheduler mutex poisoned");
            loop {
                if !state.running {
                    // Either stop() or an idle global EOS (which the caller
                    // already forwarded) ended the component.
                    return;
                }
                if let Some(pending) = state.queue.pop_front() {
                    state.delivering = true;
                    ctx.shared.submit_cv.notify_all();
                    break Some(pending);
                }
                if state.global_eos {
                    state.component = ComponentState::Stopped;
                    state.running = false;
                    break None;
                }
                state = ctx
                    .shared
                    .deliver_cv
                    .wait(state)
                    .expect("scheduler mutex poisoned");
            }
        };

        let Some(mut pending) = pending else {
            log::info!("scheduler: FIFO drained, forwarding global EOS");
            send_item(&ctx.out, StreamItem::GlobalEos);
            return;
        };

        // Block on this entry's own handles, in order. Completion order
        // inside the engine is irrelevant: delivery order is FIFO order.
        for (index, request) in pending.requests.drain(..) {
            let outputs = match ctx.engine.wait(request) {
                Ok(outputs) => outputs,
                Err(err) => {
                    log::warn!("scheduler: request {request} failed, delivering undecorated: {err:#}");
                    continue;
                }
            };
            match index {
                Some(i) => {
                    pending.frame.detections[i]
                        .output_tensors
                        .insert(ctx.stage_out, outputs);
                }
                None => {
                    pending.frame.output_tensors.insert(ctx.stage_out, outputs);
                }
            }
        }

        let channel = pending.frame.stream_id;
        send_item(&ctx.out, StreamItem::Frame(pending.frame));

        let scoped_eos = {
            let mut state = ctx.shared.state.lock().expect("scheduler mutex poisoned");
            state.delivering = false;
            let count = state
                .pending_counts
                .get_mut(&channel)
                .expect("delivered frame for unknown channel");
            *count -= 1;
            let drained = *count == 0 && state.withheld_eos.remove(&channel);
            ctx.shared.deliver_cv.notify_all();
            drained
        };
        if scoped_eos {
            log::info!("scheduler: channel {channel} drained, forwarding scoped EOS");
            send_item(&ctx.out, StreamItem::ChannelEos(channel));
        }
    }
}

impl Stage for InferScheduler {
    fn start(&mut self) -> Result<()> {
        {
            let mut state = self.lock();
            if state.running {
                return Ok(());
            }
            state.running = true;
            state.component = ComponentState::Running;
        }
        let ctx = DeliveryContext {
            shared: Arc::clone(&self.shared),
            engine: Arc::clone(&self.engine),
            stage_out: self.cfg.stage_out_id,
            out: self.out.clone(),
        };
        self.thread = Some(
            std::thread::Builder::new()
                .name("infer-delivery".into())
                .spawn(move || delivery_loop(ctx))?,
        );
        Ok(())
    }

    fn process(&mut self, item: StreamItem) -> Result<()> {
        match item {
            StreamItem::Frame(frame) => self.submit(frame),
            StreamItem::ChannelEos(id) => {
                self.channel_eos(id);
                Ok(())
            }
            StreamItem::GlobalEos => {
                self.global_eos();
                Ok(())
            }
            StreamItem::RouteMarker(id) => {
                send_item(&self.out, StreamItem::RouteMarker(id));
                Ok(())
            }
            StreamItem::Control(event) => {
                send_item(&self.out, StreamItem::Control(event));
                Ok(())
            }
        }
    }

    fn stop(&mut self) {
        {
            let mut state = self.lock();
            state.running = false;
            state.component = ComponentState::Stopped;
            // Lossy shutdown: queued frames (and their outstanding engine
            // requests) are abandoned.
            state.queue.clear();
            state.withheld_eos.clear();
        }
        self.shared.submit_cv.notify_all();
        self.shared.deliver_cv.notify_all();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }

    fn state(&self) -> ComponentState {
        self.lock().component
    }
}

impl Drop for InferScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}
