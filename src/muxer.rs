//! Muxer: barrier-synchronizes N channels into one emission per tick.
//!
//! Each channel owns a single overwrite-semantics slot. A background thread
//! waits until every registered channel's slot is filled, latches the tick
//! target (the straggler's timestamp), clears any slot older than the
//! target (the tick is retried once those channels refill), and finally
//! emits one output per channel, all stamped with the unified tick
//! timestamp. A tick is all-or-nothing: no partial emission, ever.
//!
//! A pending QoS-deadline signal sheds the whole tick instead. In
//! `live_source` mode, frames falling more than [`LIVE_LATENESS_NS`] behind
//! pipeline running time are dropped at submission.

use anyhow::{anyhow, Result};
use std::collections::BTreeMap;
use std::sync::mpsc::Sender;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Instant;

use crate::{ClockTime, ComponentState, FrameRecord, Stage, StreamId, StreamItem};

/// Lateness threshold for `live_source` dropping: 1 second.
pub const LIVE_LATENESS_NS: ClockTime = 1_000_000_000;

/// Recognized options for the muxer.
#[derive(Clone, Debug, Default)]
pub struct MuxerConfig {
    /// Drop frames that fall behind wall-clock running time.
    pub live_source: bool,
}

/// QoS underflow report from downstream: nothing earlier than
/// `timestamp + diff` is worth processing.
#[derive(Clone, Copy, Debug)]
pub struct QosSignal {
    pub timestamp: ClockTime,
    pub diff: ClockTime,
}

impl QosSignal {
    fn earliest(&self) -> ClockTime {
        self.timestamp.saturating_add(self.diff)
    }
}

struct Slot {
    frame: Option<FrameRecord>,
    eos: bool,
}

struct MuxState {
    slots: BTreeMap<StreamId, Slot>,
    /// Tick target latched when all slots first fill; survives deferrals.
    target: Option<ClockTime>,
    qos: Option<QosSignal>,
    running: bool,
    component: ComponentState,
}

struct Shared {
    state: Mutex<MuxState>,
    tick_cv: Condvar,
}

/// Lockstep synchronizer for channels expected to advance together.
pub struct Muxer {
    shared: Arc<Shared>,
    out: Sender<StreamItem>,
    cfg: MuxerConfig,
    started_at: Option<Instant>,
    thread: Option<JoinHandle<()>>,
}

impl Muxer {
    pub fn new(cfg: MuxerConfig, out: Sender<StreamItem>) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(MuxState {
                    slots: BTreeMap::new(),
                    target: None,
                    qos: None,
                    running: false,
                    component: ComponentState::Prepared,
                }),
                tick_cv: Condvar::new(),
            }),
            out,
            cfg,
            started_at: None,
            thread: None,
        }
    }

    pub fn register_channel(&self, channel: StreamId) -> Result<()> {
        let mut state = self.lock();
        if state.slots.contains_key(&channel) {
            return Err(anyhow!("channel {channel} is already registered"));
        }
        state.slots.insert(
            channel,
            Slot {
                frame: None,
                eos: false,
            },
        );
        Ok(())
    }

    /// Remove a channel from the must-be-filled set, discarding its slot.
    /// When the last channel goes, the global EOS fires.
    pub fn deregister_channel(&self, channel: StreamId) {
        let mut state = self.lock();
        if state.slots.remove(&channel).is_some() {
            self.shared.tick_cv.notify_all();
        }
    }

    /// Place a frame in its channel's slot, overwriting whatever was there.
    /// Untimestamped frames, frames after EOS, and (in live mode) frames
    /// that have fallen behind running time are dropped.
    pub fn submit(&self, channel: StreamId, mut frame: FrameRecord) -> Result<()> {
        let Some(pts) = frame.pts else {
            log::debug!("muxer: dropping untimestamped frame on channel {channel}");
            return Ok(());
        };

        if self.cfg.live_source {
            if let Some(started_at) = self.started_at {
                let running_time = started_at.elapsed().as_nanos() as ClockTime;
                if pts.saturating_add(LIVE_LATENESS_NS) < running_time {
                    log::debug!(
                        "muxer: dropping late frame on channel {channel} (pts {pts}, running {running_time})"
                    );
                    return Ok(());
                }
            }
        }

        frame.stream_id = channel;
        let mut state = self.lock();
        let slot = state
            .slots
            .get_mut(&channel)
            .ok_or_else(|| anyhow!("channel {channel} is not registered"))?;
        if slot.eos {
            log::debug!("muxer: dropping frame on channel {channel} after EOS");
            return Ok(());
        }
        if slot.frame.replace(frame).is_some() {
            log::debug!("muxer: channel {channel} slot overwritten before tick");
        }
        self.shared.tick_cv.notify_all();
        Ok(())
    }

    /// Record end-of-stream for a channel. A filled slot still takes part
    /// in its final tick; once the slot is empty the channel is
    /// deregistered by the tick thread.
    pub fn end_of_stream(&self, channel: StreamId) -> Result<()> {
        let mut state = self.lock();
        let slot = state
            .slots
            .get_mut(&channel)
            .ok_or_else(|| anyhow!("channel {channel} is not registered"))?;
        slot.eos = true;
        log::info!("muxer: EOS recorded for channel {channel}");
        if state.slots.values().all(|s| s.eos) && state.component == ComponentState::Running {
            state.component = ComponentState::Draining;
        }
        self.shared.tick_cv.notify_all();
        Ok(())
    }

    /// Report a downstream QoS deadline; the next tick whose target is
    /// before the deadline is shed wholesale.
    pub fn report_qos(&self, signal: QosSignal) {
        let mut state = self.lock();
        state.qos = Some(signal);
        self.shared.tick_cv.notify_all();
    }

    fn lock(&self) -> MutexGuard<'_, MuxState> {
        self.shared.state.lock().expect("muxer mutex poisoned")
    }
}

fn send_item(out: &Sender<StreamItem>, item: StreamItem) {
    if out.send(item).is_err() {
        log::debug!("muxer: downstream receiver is gone");
    }
}

enum TickAction {
    Emit(Vec<FrameRecord>),
    GlobalEos,
    Halt,
}

fn tick_loop(shared: Arc<Shared>, out: Sender<StreamItem>) {
    loop {
        let action = {
            let mut state = shared.state.lock().expect("muxer mutex poisoned");
            loop {
                if !state.running {
                    break TickAction::Halt;
                }

                // EOS channels with empty slots can never fill again:
                // deregister them so the tick completes with the rest.
                let finished: Vec<StreamId> = state
                    .slots
                    .iter()
                    .filter(|(_, s)| s.eos && s.frame.is_none())
                    .map(|(id, _)| *id)
                    .collect();
                for id in finished {
                    log::info!("muxer: channel {id} finished, deregistering");
                    state.slots.remove(&id);
                }

                if state.slots.is_empty() {
                    state.component = ComponentState::Stopped;
                    state.running = false;
                    break TickAction::GlobalEos;
                }

                if state.slots.values().all(|s| s.frame.is_some()) {
                    if let Some(action) = run_tick(&mut state) {
                        break action;
                    }
                    // Tick deferred or shed. Re-run the deregistration
                    // pass first: a cleared slot may belong to a channel
                    // that already reached EOS.
                    continue;
                }

                state = shared
                    .tick_cv
                    .wait(state)
                    .expect("muxer mutex poisoned");
            }
        };

        match action {
            TickAction::Emit(frames) => {
                for frame in frames {
                    send_item(&out, StreamItem::Frame(frame));
                }
            }
            TickAction::GlobalEos => {
                log::info!("muxer: no channels registered, forwarding global EOS");
                send_item(&out, StreamItem::GlobalEos);
                return;
            }
            TickAction::Halt => return,
        }
    }
}

/// All slots are filled; attempt to complete the tick. Returns `None` when
/// the tick was deferred (stale slots cleared) or shed (QoS).
fn run_tick(state: &mut MuxState) -> Option<TickAction> {
    let max_pts = state
        .slots
        .values()
        .filter_map(|s| s.frame.as_ref().and_then(|f| f.pts))
        .max()
        .expect("tick with no filled slots");
    let target = *state.target.get_or_insert(max_pts);

    // Shed the whole tick when downstream told us this target is already
    // too late to matter.
    if let Some(qos) = state.qos {
        if qos.earliest() > target {
            log::debug!(
                "muxer: shedding tick at {target} for QoS deadline {}",
                qos.earliest()
            );
            for slot in state.slots.values_mut() {
                slot.frame = None;
            }
            state.qos = None;
            state.target = None;
            return None;
        }
    }

    // Clear stale slots and retry the tick once they refill.
    let mut deferred = false;
    for (id, slot) in state.slots.iter_mut() {
        let pts = slot.frame.as_ref().and_then(|f| f.pts).unwrap_or(0);
        if pts < target {
            log::debug!("muxer: channel {id} slot at {pts} is stale for target {target}");
            slot.frame = None;
            deferred = true;
        }
    }
    if deferred {
        return None;
    }

    // Unified tick timestamp: the newest slot at emission time.
    let mut frames = Vec::with_capacity(state.slots.len());
    for slot in state.slots.values_mut() {
        let mut frame = slot.frame.take().expect("tick slot emptied concurrently");
        frame.pts = Some(max_pts);
        frames.push(frame);
    }
    state.target = None;
    Some(TickAction::Emit(frames))
}

impl Stage for Muxer {
    fn start(&mut self) -> Result<()> {
        {
            let mut state = self.lock();
            if state.running {
                return Ok(());
            }
            state.running = true;
            state.component = ComponentState::Running;
        }
        self.started_at = Some(Instant::now());

        let shared = Arc::clone(&self.shared);
        let out = self.out.clone();
        self.thread = Some(
            std::thread::Builder::new()
                .name("muxer-tick".into())
                .spawn(move || tick_loop(shared, out))?,
        );
        Ok(())
    }

    fn process(&mut self, item: StreamItem) -> Result<()> {
        match item {
            StreamItem::Frame(frame) => self.submit(frame.stream_id, frame),
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
            // Lossy shutdown: pending slots are discarded.
            state.slots.clear();
            state.target = None;
        }
        self.shared.tick_cv.notify_all();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }

    fn state(&self) -> ComponentState {
        self.lock().component
    }
}

impl Drop for Muxer {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    fn frame(channel: StreamId, seq: u64, pts: ClockTime) -> FrameRecord {
        FrameRecord::new(channel, seq, Some(pts))
    }

    fn recv_frames(rx: &mpsc::Receiver<StreamItem>, n: usize) -> Vec<FrameRecord> {
        (0..n)
            .map(|_| match rx.recv_timeout(Duration::from_secs(5)).unwrap() {
                StreamItem::Frame(f) => f,
                other => panic!("expected frame, got {other:?}"),
            })
            .collect()
    }

    #[test]
    fn aligned_channels_emit_one_tick() -> Result<()> {
        let (tx, rx) = mpsc::channel();
        let mut mux = Muxer::new(MuxerConfig::default(), tx);
        mux.register_channel(0)?;
        mux.register_channel(1)?;
        mux.start()?;

        mux.submit(0, frame(0, 0, 100))?;
        mux.submit(1, frame(1, 0, 100))?;

        let frames = recv_frames(&rx, 2);
        assert_eq!(frames.len(), 2);
        assert!(frames.iter().all(|f| f.pts == Some(100)));
        Ok(())
    }

    #[test]
    fn slot_overwrite_keeps_latest_frame() -> Result<()> {
        let (tx, rx) = mpsc::channel();
        let mut mux = Muxer::new(MuxerConfig::default(), tx);
        mux.register_channel(0)?;
        mux.register_channel(1)?;
        mux.start()?;

        // Channel 1 is absent, so the tick cannot complete and channel 0's
        // second submission overwrites the first.
        mux.submit(0, frame(0, 0, 10))?;
        mux.submit(0, frame(0, 1, 20))?;
        mux.submit(1, frame(1, 0, 20))?;

        let frames = recv_frames(&rx, 2);
        assert!(frames.iter().all(|f| f.pts == Some(20)));
        let seqs: Vec<u64> = frames.iter().map(|f| f.frame_id.seq).collect();
        assert!(seqs.contains(&1), "overwritten frame must not surface");
        Ok(())
    }

    #[test]
    fn qos_signal_sheds_whole_tick() -> Result<()> {
        let (tx, rx) = mpsc::channel();
        let mut mux = Muxer::new(MuxerConfig::default(), tx);
        mux.register_channel(0)?;
        mux.register_channel(1)?;
        mux.start()?;

        mux.report_qos(QosSignal {
            timestamp: 100,
            diff: 50,
        });
        mux.submit(0, frame(0, 0, 100))?;
        mux.submit(1, frame(1, 0, 100))?;

        // Tick at 100 is behind the 150 deadline: shed. The next tick at
        // 200 goes through.
        mux.submit(0, frame(0, 1, 200))?;
        mux.submit(1, frame(1, 1, 200))?;

        let frames = recv_frames(&rx, 2);
        assert!(frames.iter().all(|f| f.pts == Some(200)));
        Ok(())
    }

    #[test]
    fn eos_channel_with_empty_slot_is_deregistered() -> Result<()> {
        let (tx, rx) = mpsc::channel();
        let mut mux = Muxer::new(MuxerConfig::default(), tx);
        mux.register_channel(0)?;
        mux.register_channel(1)?;
        mux.start()?;

        mux.submit(0, frame(0, 0, 10))?;
        mux.submit(1, frame(1, 0, 10))?;
        let _ = recv_frames(&rx, 2);

        // Channel 1 ends; the tick completes with channel 0 alone.
        mux.end_of_stream(1)?;
        mux.submit(0, frame(0, 1, 20))?;
        let frames = recv_frames(&rx, 1);
        assert_eq!(frames[0].stream_id, 0);
        assert_eq!(frames[0].pts, Some(20));

        // Last channel ends with nothing pending: global EOS.
        mux.end_of_stream(0)?;
        assert!(matches!(
            rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            StreamItem::GlobalEos
        ));
        Ok(())
    }
}
