//! Input selector: N channels in, one timestamp-ordered channel out.
//!
//! Each registered channel gets a bounded FIFO. Producers block in
//! [`InputSelector::admit`] until their channel has room (backpressure);
//! a dedicated drain thread emits the globally-smallest head timestamp,
//! breaking ties by channel id.
//!
//! The drain thread never makes an ordering decision on partial
//! information: nothing is emitted until every live channel holds at least
//! one frame. That same rule provides the initial preroll.
//!
//! End-of-stream is recorded immediately but the channel-scoped EOS event
//! is only emitted once the channel's queue has drained. When the last
//! registered channel drains, one global EOS follows and the thread halts.

use anyhow::{anyhow, Result};
use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap, VecDeque};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;

use crate::{ClockTime, ComponentState, ControlEvent, FrameRecord, Stage, StreamId, StreamItem};

pub const DEFAULT_MAX_QUEUE_SIZE: usize = 2;

/// Recognized options for the input selector.
#[derive(Clone, Debug)]
pub struct SelectorConfig {
    /// Per-channel queue depth before `admit` blocks.
    pub max_queue_size: usize,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            max_queue_size: DEFAULT_MAX_QUEUE_SIZE,
        }
    }
}

struct ChannelQueue {
    frames: VecDeque<FrameRecord>,
    eos: bool,
}

struct SelectorState {
    channels: BTreeMap<StreamId, ChannelQueue>,
    /// Min-heap over (head timestamp, channel id); one entry per non-empty
    /// channel.
    heads: BinaryHeap<Reverse<(ClockTime, StreamId)>>,
    running: bool,
    component: ComponentState,
}

struct Shared {
    state: Mutex<SelectorState>,
    /// Producers blocked on a full channel queue.
    admit_cv: Condvar,
    /// Drain thread waiting for every live channel to fill.
    drain_cv: Condvar,
}

/// Merges N concurrently-fed channels into one timestamp-ascending stream.
pub struct InputSelector {
    shared: Arc<Shared>,
    out: Sender<StreamItem>,
    cfg: SelectorConfig,
    thread: Option<JoinHandle<()>>,
}

impl InputSelector {
    pub fn new(cfg: SelectorConfig, out: Sender<StreamItem>) -> Result<Self> {
        if cfg.max_queue_size == 0 {
            return Err(anyhow!("selector max_queue_size must be at least 1"));
        }
        Ok(Self {
            shared: Arc::new(Shared {
                state: Mutex::new(SelectorState {
                    channels: BTreeMap::new(),
                    heads: BinaryHeap::new(),
                    running: false,
                    component: ComponentState::Prepared,
                }),
                admit_cv: Condvar::new(),
                drain_cv: Condvar::new(),
            }),
            out,
            cfg,
            thread: None,
        })
    }

    /// Register a source channel. Registration is dynamic; a channel added
    /// while running participates in ordering as soon as it holds a frame.
    pub fn register_channel(&self, channel: StreamId) -> Result<()> {
        let mut state = self.lock();
        if state.channels.contains_key(&channel) {
            return Err(anyhow!("channel {channel} is already registered"));
        }
        state.channels.insert(
            channel,
            ChannelQueue {
                frames: VecDeque::new(),
                eos: false,
            },
        );
        Ok(())
    }

    /// Remove a channel, discarding anything still queued for it.
    pub fn deregister_channel(&self, channel: StreamId) {
        let mut state = self.lock();
        if state.channels.remove(&channel).is_some() {
            rebuild_heads(&mut state);
            self.shared.drain_cv.notify_all();
            self.shared.admit_cv.notify_all();
        }
    }

    /// Hand one frame to the selector. Blocks while the channel's queue is
    /// full; returns without queueing (frame dropped) when the frame has no
    /// timestamp, the channel already saw EOS, or the selector is stopping.
    pub fn admit(&self, channel: StreamId, mut frame: FrameRecord) -> Result<()> {
        let Some(pts) = frame.pts else {
            log::debug!("selector: dropping untimestamped frame on channel {channel}");
            return Ok(());
        };

        let mut state = self.lock();
        loop {
            if !state.running {
                log::debug!("selector: dropping frame on channel {channel}, stopping");
                return Ok(());
            }
            let queue = state
                .channels
                .get(&channel)
                .ok_or_else(|| anyhow!("channel {channel} is not registered"))?;
            if queue.eos {
                log::debug!("selector: dropping frame on channel {channel} after EOS");
                return Ok(());
            }
            if queue.frames.len() < self.cfg.max_queue_size {
                break;
            }
            state = self
                .shared
                .admit_cv
                .wait(state)
                .expect("selector mutex poisoned");
        }

        frame.stream_id = channel;
        let queue = state.channels.get_mut(&channel).expect("channel vanished");
        let was_empty = queue.frames.is_empty();
        queue.frames.push_back(frame);
        if was_empty {
            state.heads.push(Reverse((pts, channel)));
        }
        self.shared.drain_cv.notify_one();
        Ok(())
    }

    /// Record end-of-stream for one channel. The channel-scoped EOS event
    /// is emitted by the drain thread once the queue is empty.
    pub fn end_of_stream(&self, channel: StreamId) -> Result<()> {
        let mut state = self.lock();
        let queue = state
            .channels
            .get_mut(&channel)
            .ok_or_else(|| anyhow!("channel {channel} is not registered"))?;
        queue.eos = true;
        log::info!("selector: EOS recorded for channel {channel}");
        if state.channels.values().all(|q| q.eos) && state.component == ComponentState::Running {
            state.component = ComponentState::Draining;
        }
        self.shared.drain_cv.notify_all();
        self.shared.admit_cv.notify_all();
        Ok(())
    }

    /// Forward a broadcast control announcement, preceded by the sideband
    /// route marker that lets a downstream router re-target it.
    pub fn announce(&self, channel: StreamId, event: ControlEvent) {
        send_item(&self.out, StreamItem::RouteMarker(channel));
        send_item(&self.out, StreamItem::Control(event));
    }

    fn lock(&self) -> MutexGuard<'_, SelectorState> {
        self.shared.state.lock().expect("selector mutex poisoned")
    }
}

fn rebuild_heads(state: &mut SelectorState) {
    state.heads = state
        .channels
        .iter()
        .filter_map(|(id, q)| q.frames.front().map(|f| Reverse((f.pts.unwrap_or(0), *id))))
        .collect();
}

fn send_item(out: &Sender<StreamItem>, item: StreamItem) {
    if out.send(item).is_err() {
        log::debug!("selector: downstream receiver is gone");
    }
}

enum DrainAction {
    Emit(FrameRecord),
    ScopedEos(Vec<StreamId>),
    GlobalEos,
    Halt,
}

fn drain_loop(shared: Arc<Shared>, out: Sender<StreamItem>) {
    loop {
        let action = {
            let mut state = shared.state.lock().expect("selector mutex poisoned");
            loop {
                if !state.running {
                    break DrainAction::Halt;
                }

                // Channels that reached EOS and drained: emit their scoped
                // EOS and drop them from the ordering set.
                let drained: Vec<StreamId> = state
                    .channels
                    .iter()
                    .filter(|(_, q)| q.eos && q.frames.is_empty())
                    .map(|(id, _)| *id)
                    .collect();
                if !drained.is_empty() {
                    for id in &drained {
                        state.channels.remove(id);
                    }
                    shared.admit_cv.notify_all();
                    break DrainAction::ScopedEos(drained);
                }

                if state.channels.is_empty() {
                    state.component = ComponentState::Stopped;
                    state.running = false;
                    break DrainAction::GlobalEos;
                }

                // Ordering decisions need full information: one head per
                // live channel.
                if state.channels.values().all(|q| !q.frames.is_empty()) {
                    let Reverse((_, channel)) = state.heads.pop().expect("head heap empty");
                    let queue = state.channels.get_mut(&channel).expect("channel vanished");
                    let frame = queue.frames.pop_front().expect("queue empty");
                    let next_pts = queue.frames.front().and_then(|f| f.pts);
                    if let Some(pts) = next_pts {
                        state.heads.push(Reverse((pts, channel)));
                    }
                    shared.admit_cv.notify_all();
                    break DrainAction::Emit(frame);
                }

                state = shared
                    .drain_cv
                    .wait(state)
                    .expect("selector mutex poisoned");
            }
        };

        match action {
            DrainAction::Emit(frame) => send_item(&out, StreamItem::Frame(frame)),
            DrainAction::ScopedEos(ids) => {
                for id in ids {
                    log::info!("selector: channel {id} drained, forwarding scoped EOS");
                    send_item(&out, StreamItem::ChannelEos(id));
                }
            }
            DrainAction::GlobalEos => {
                log::info!("selector: all channels drained, forwarding global EOS");
                send_item(&out, StreamItem::GlobalEos);
                return;
            }
            DrainAction::Halt => return,
        }
    }
}

impl Stage for InputSelector {
    fn start(&mut self) -> Result<()> {
        let mut state = self.lock();
        if state.running {
            return Ok(());
        }
        state.running = true;
        state.component = ComponentState::Running;
        drop(state);

        let shared = Arc::clone(&self.shared);
        let out = self.out.clone();
        self.thread = Some(
            std::thread::Builder::new()
                .name("selector-drain".into())
                .spawn(move || drain_loop(shared, out))?,
        );
        Ok(())
    }

    fn process(&mut self, item: StreamItem) -> Result<()> {
        match item {
            StreamItem::Frame(frame) => self.admit(frame.stream_id, frame),
            StreamItem::ChannelEos(id) => self.end_of_stream(id),
            StreamItem::RouteMarker(id) => {
                send_item(&self.out, StreamItem::RouteMarker(id));
                Ok(())
            }
            StreamItem::Control(event) => {
                send_item(&self.out, StreamItem::Control(event));
                Ok(())
            }
            StreamItem::GlobalEos => Ok(()),
        }
    }

    fn stop(&mut self) {
        {
            let mut state = self.lock();
            state.running = false;
            state.component = ComponentState::Stopped;
            // Shutdown is lossy: buffered frames are discarded.
            state.channels.clear();
            state.heads.clear();
        }
        self.shared.drain_cv.notify_all();
        self.shared.admit_cv.notify_all();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }

    fn state(&self) -> ComponentState {
        self.lock().component
    }
}

impl Drop for InputSelector {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    fn frame(channel: StreamId, seq: u64, pts: ClockTime) -> FrameRecord {
        FrameRecord::new(channel, seq, Some(pts))
    }

    #[test]
    fn untimestamped_frames_are_dropped() -> Result<()> {
        let (tx, rx) = mpsc::channel();
        let mut sel = InputSelector::new(SelectorConfig::default(), tx)?;
        sel.register_channel(0)?;
        sel.start()?;

        sel.admit(0, FrameRecord::new(0, 0, None))?;
        sel.admit(0, frame(0, 1, 5))?;
        sel.end_of_stream(0)?;

        match rx.recv()? {
            StreamItem::Frame(f) => assert_eq!(f.pts, Some(5)),
            other => panic!("expected frame, got {other:?}"),
        }
        assert!(matches!(rx.recv()?, StreamItem::ChannelEos(0)));
        assert!(matches!(rx.recv()?, StreamItem::GlobalEos));
        Ok(())
    }

    #[test]
    fn admitting_on_unknown_channel_is_an_error() -> Result<()> {
        let (tx, _rx) = mpsc::channel();
        let mut sel = InputSelector::new(SelectorConfig::default(), tx)?;
        sel.register_channel(0)?;
        sel.start()?;
        assert!(sel.admit(3, frame(3, 0, 1)).is_err());
        Ok(())
    }

    #[test]
    fn frames_after_eos_are_dropped_silently() -> Result<()> {
        let (tx, rx) = mpsc::channel();
        let mut sel = InputSelector::new(SelectorConfig::default(), tx)?;
        sel.register_channel(0)?;
        sel.register_channel(1)?;
        sel.start()?;

        sel.admit(0, frame(0, 0, 1))?;
        sel.end_of_stream(0)?;
        // Channel 1 is still empty, so the drain barrier is closed and
        // channel 0 is guaranteed to still hold its EOS flag here.
        sel.admit(0, frame(0, 1, 2))?;
        sel.admit(1, frame(1, 0, 5))?;
        sel.end_of_stream(1)?;

        match rx.recv()? {
            StreamItem::Frame(f) => assert_eq!(f.pts, Some(1)),
            other => panic!("expected frame, got {other:?}"),
        }
        assert!(matches!(rx.recv()?, StreamItem::ChannelEos(0)));
        match rx.recv()? {
            StreamItem::Frame(f) => assert_eq!(f.pts, Some(5)),
            other => panic!("expected frame, got {other:?}"),
        }
        assert!(matches!(rx.recv()?, StreamItem::ChannelEos(1)));
        assert!(matches!(rx.recv()?, StreamItem::GlobalEos));
        Ok(())
    }

    #[test]
    fn announce_precedes_control_with_route_marker() -> Result<()> {
        let (tx, rx) = mpsc::channel();
        let sel = InputSelector::new(SelectorConfig::default(), tx)?;
        sel.announce(
            2,
            ControlEvent::Format {
                width: 640,
                height: 480,
                format: "NV12".into(),
                frame_rate: 30.0,
            },
        );
        assert!(matches!(rx.recv()?, StreamItem::RouteMarker(2)));
        assert!(matches!(rx.recv()?, StreamItem::Control(_)));
        Ok(())
    }
}
