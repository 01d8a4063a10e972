//! Gather: latest-wins merge of parallel branches of the same source.
//!
//! Where the muxer waits for every channel to reach a common tick, the
//! gather assumes its channels are parallel views of the *same* frames
//! (e.g. detection and pose branches fed from one source) and merges their
//! metadata opportunistically: once every slot is filled, the newest
//! timestamp wins, channels matching it are merged into one output, and
//! strictly older channels are discarded unmerged as stale.
//!
//! Merging pairs detections by `meta_id` and fills only the base's unset
//! fields; see [`crate::meta::DetectionRecord::merge_from`].

use anyhow::{anyhow, Result};
use std::collections::BTreeMap;
use std::sync::mpsc::Sender;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;

use crate::{ComponentState, FrameRecord, Stage, StreamId, StreamItem};

struct Slot {
    frame: Option<FrameRecord>,
    eos: bool,
}

struct GatherState {
    slots: BTreeMap<StreamId, Slot>,
    running: bool,
    component: ComponentState,
}

struct Shared {
    state: Mutex<GatherState>,
    merge_cv: Condvar,
}

/// Opportunistic merger for per-channel metadata describing the same
/// logical frame.
pub struct Gather {
    shared: Arc<Shared>,
    out: Sender<StreamItem>,
    thread: Option<JoinHandle<()>>,
}

impl Gather {
    pub fn new(out: Sender<StreamItem>) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(GatherState {
                    slots: BTreeMap::new(),
                    running: false,
                    component: ComponentState::Prepared,
                }),
                merge_cv: Condvar::new(),
            }),
            out,
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

    pub fn deregister_channel(&self, channel: StreamId) {
        let mut state = self.lock();
        if state.slots.remove(&channel).is_some() {
            self.shared.merge_cv.notify_all();
        }
    }

    /// Place a branch's view of a frame in its slot (overwrite semantics).
    pub fn submit(&self, channel: StreamId, frame: FrameRecord) -> Result<()> {
        if frame.pts.is_none() {
            log::debug!("gather: dropping untimestamped frame on channel {channel}");
            return Ok(());
        }
        let mut state = self.lock();
        let slot = state
            .slots
            .get_mut(&channel)
            .ok_or_else(|| anyhow!("channel {channel} is not registered"))?;
        if slot.eos {
            log::debug!("gather: dropping frame on channel {channel} after EOS");
            return Ok(());
        }
        if slot.frame.replace(frame).is_some() {
            log::debug!("gather: channel {channel} slot overwritten before merge");
        }
        self.shared.merge_cv.notify_all();
        Ok(())
    }

    pub fn end_of_stream(&self, channel: StreamId) -> Result<()> {
        let mut state = self.lock();
        let slot = state
            .slots
            .get_mut(&channel)
            .ok_or_else(|| anyhow!("channel {channel} is not registered"))?;
        slot.eos = true;
        if state.slots.values().all(|s| s.eos) && state.component == ComponentState::Running {
            state.component = ComponentState::Draining;
        }
        self.shared.merge_cv.notify_all();
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, GatherState> {
        self.shared.state.lock().expect("gather mutex poisoned")
    }
}

fn send_item(out: &Sender<StreamItem>, item: StreamItem) {
    if out.send(item).is_err() {
        log::debug!("gather: downstream receiver is gone");
    }
}

enum MergeAction {
    Emit(FrameRecord),
    GlobalEos,
    Halt,
}

/// All slots are filled: merge the channels carrying the newest timestamp
/// into one frame, discard the rest as stale.
fn run_merge(state: &mut GatherState) -> FrameRecord {
    let latest = state
        .slots
        .values()
        .filter_map(|s| s.frame.as_ref().and_then(|f| f.pts))
        .max()
        .expect("merge with no filled slots");

    let mut base: Option<FrameRecord> = None;
    for (id, slot) in state.slots.iter_mut() {
        let frame = slot.frame.take().expect("merge slot emptied concurrently");
        if frame.pts != Some(latest) {
            log::debug!(
                "gather: discarding stale frame on channel {id} (pts {:?} < {latest})",
                frame.pts
            );
            continue;
        }
        if let Some(base) = base.as_mut() {
            base.merge_from(&frame);
        } else {
            base = Some(frame);
        }
    }
    base.expect("merge produced no base frame")
}

fn merge_loop(shared: Arc<Shared>, out: Sender<StreamItem>) {
    loop {
        let action = {
            let mut state = shared.state.lock().expect("gather mutex poisoned");
            loop {
                if !state.running {
                    break MergeAction::Halt;
                }

                let finished: Vec<StreamId> = state
                    .slots
                    .iter()
                    .filter(|(_, s)| s.eos && s.frame.is_none())
                    .map(|(id, _)| *id)
                    .collect();
                for id in finished {
                    log::info!("gather: channel {id} finished, deregistering");
                    state.slots.remove(&id);
                }

                if state.slots.is_empty() {
                    state.component = ComponentState::Stopped;
                    state.running = false;
                    break MergeAction::GlobalEos;
                }

                if state.slots.values().all(|s| s.frame.is_some()) {
                    break MergeAction::Emit(run_merge(&mut state));
                }

                state = shared
                    .merge_cv
                    .wait(state)
                    .expect("gather mutex poisoned");
            }
        };

        match action {
            MergeAction::Emit(frame) => send_item(&out, StreamItem::Frame(frame)),
            MergeAction::GlobalEos => {
                log::info!("gather: no channels registered, forwarding global EOS");
                send_item(&out, StreamItem::GlobalEos);
                return;
            }
            MergeAction::Halt => return,
        }
    }
}

impl Stage for Gather {
    fn start(&mut self) -> Result<()> {
        {
            let mut state = self.lock();
            if state.running {
                return Ok(());
            }
            state.running = true;
            state.component = ComponentState::Running;
        }
        let shared = Arc::clone(&self.shared);
        let out = self.out.clone();
        self.thread = Some(
            std::thread::Builder::new()
                .name("gather-merge".into())
                .spawn(move || merge_loop(shared, out))?,
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
            state.slots.clear();
        }
        self.shared.merge_cv.notify_all();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }

    fn state(&self) -> ComponentState {
        self.lock().component
    }
}

impl Drop for Gather {
    fn drop(&mut self) {
        self.stop();
    }
}
