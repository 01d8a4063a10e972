//! Router: demultiplexes one tagged channel back to N destinations.
//!
//! The inverse of the input selector. Every frame carries the source tag it
//! was stamped with at ingestion; a frame whose tag has no destination is
//! an error, never a silent drop.
//!
//! Broadcast-style control events carry no tag of their own. The sideband
//! route marker emitted just before such an event names the last active
//! source, and the router re-targets the event to that destination.
//! Channel-scoped EOS messages carry their source id explicitly, so they
//! route correctly even when they arrive with no data flow around them.

use anyhow::{anyhow, Result};
use std::collections::BTreeMap;
use std::sync::mpsc::Sender;

use crate::{ComponentState, FrameRecord, Stage, StreamId, StreamItem};

/// Tag-directed demultiplexer. Purely reactive: routing happens on the
/// caller's thread, so the router owns no thread of its own.
pub struct Router {
    destinations: BTreeMap<StreamId, Sender<StreamItem>>,
    last_active: Option<StreamId>,
    component: ComponentState,
}

impl Router {
    pub fn new() -> Self {
        Self {
            destinations: BTreeMap::new(),
            last_active: None,
            component: ComponentState::Prepared,
        }
    }

    /// Attach a destination for one source tag.
    pub fn link(&mut self, channel: StreamId, dest: Sender<StreamItem>) -> Result<()> {
        if self.destinations.contains_key(&channel) {
            return Err(anyhow!("destination {channel} is already linked"));
        }
        self.destinations.insert(channel, dest);
        Ok(())
    }

    pub fn unlink(&mut self, channel: StreamId) {
        self.destinations.remove(&channel);
    }

    pub fn route_frame(&self, frame: FrameRecord) -> Result<()> {
        let dest = self
            .destinations
            .get(&frame.stream_id)
            .ok_or_else(|| anyhow!("no destination for stream {}", frame.stream_id))?;
        if dest.send(StreamItem::Frame(frame)).is_err() {
            log::debug!("router: destination receiver is gone");
        }
        Ok(())
    }

    fn route_to(&self, channel: StreamId, item: StreamItem) -> Result<()> {
        let dest = self
            .destinations
            .get(&channel)
            .ok_or_else(|| anyhow!("no destination for stream {channel}"))?;
        if dest.send(item).is_err() {
            log::debug!("router: destination receiver is gone");
        }
        Ok(())
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

impl Stage for Router {
    fn start(&mut self) -> Result<()> {
        self.component = ComponentState::Running;
        Ok(())
    }

    fn process(&mut self, item: StreamItem) -> Result<()> {
        match item {
            StreamItem::Frame(frame) => {
                self.last_active = Some(frame.stream_id);
                self.route_frame(frame)
            }
            StreamItem::RouteMarker(id) => {
                self.last_active = Some(id);
                Ok(())
            }
            StreamItem::Control(event) => {
                // Untargeted event: re-target it to the last active source.
                let channel = self
                    .last_active
                    .ok_or_else(|| anyhow!("control event with no active source to route to"))?;
                self.route_to(channel, StreamItem::Control(event))
            }
            StreamItem::ChannelEos(id) => self.route_to(id, StreamItem::ChannelEos(id)),
            StreamItem::GlobalEos => {
                self.component = ComponentState::Stopped;
                for dest in self.destinations.values() {
                    if dest.send(StreamItem::GlobalEos).is_err() {
                        log::debug!("router: destination receiver is gone");
                    }
                }
                Ok(())
            }
        }
    }

    fn stop(&mut self) {
        self.component = ComponentState::Stopped;
    }

    fn state(&self) -> ComponentState {
        self.component
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ControlEvent;
    use std::sync::mpsc;

    #[test]
    fn frames_follow_their_tag() -> Result<()> {
        let (tx0, rx0) = mpsc::channel();
        let (tx1, rx1) = mpsc::channel();
        let mut router = Router::new();
        router.link(0, tx0)?;
        router.link(1, tx1)?;
        router.start()?;

        router.process(StreamItem::Frame(FrameRecord::new(1, 0, Some(5))))?;
        assert!(matches!(rx1.try_recv(), Ok(StreamItem::Frame(_))));
        assert!(rx0.try_recv().is_err());
        Ok(())
    }

    #[test]
    fn unmatched_tag_is_an_error() -> Result<()> {
        let (tx0, _rx0) = mpsc::channel();
        let mut router = Router::new();
        router.link(0, tx0)?;
        router.start()?;

        let result = router.process(StreamItem::Frame(FrameRecord::new(7, 0, Some(5))));
        assert!(result.is_err());
        Ok(())
    }

    #[test]
    fn route_marker_retargets_broadcast_events() -> Result<()> {
        let (tx0, rx0) = mpsc::channel();
        let (tx1, rx1) = mpsc::channel();
        let mut router = Router::new();
        router.link(0, tx0)?;
        router.link(1, tx1)?;
        router.start()?;

        router.process(StreamItem::RouteMarker(1))?;
        router.process(StreamItem::Control(ControlEvent::Format {
            width: 1280,
            height: 720,
            format: "I420".into(),
            frame_rate: 25.0,
        }))?;

        assert!(matches!(rx1.try_recv(), Ok(StreamItem::Control(_))));
        assert!(rx0.try_recv().is_err());
        Ok(())
    }

    #[test]
    fn tagged_eos_routes_without_data_flow() -> Result<()> {
        let (tx0, rx0) = mpsc::channel();
        let mut router = Router::new();
        router.link(0, tx0)?;
        router.start()?;

        router.process(StreamItem::ChannelEos(0))?;
        assert!(matches!(rx0.try_recv(), Ok(StreamItem::ChannelEos(0))));
        Ok(())
    }

    #[test]
    fn global_eos_reaches_every_destination() -> Result<()> {
        let (tx0, rx0) = mpsc::channel();
        let (tx1, rx1) = mpsc::channel();
        let mut router = Router::new();
        router.link(0, tx0)?;
        router.link(1, tx1)?;
        router.start()?;

        router.process(StreamItem::GlobalEos)?;
        assert!(matches!(rx0.try_recv(), Ok(StreamItem::GlobalEos)));
        assert!(matches!(rx1.try_recv(), Ok(StreamItem::GlobalEos)));
        Ok(())
    }
}
