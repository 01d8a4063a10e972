//! Muxer tick semantics: all-or-nothing emission, straggler handling,
//! stale-slot deferral.

use std::collections::BTreeMap;
use std::sync::mpsc;
use std::time::Duration;

use framemux::muxer::{Muxer, MuxerConfig};
use framemux::{ClockTime, FrameRecord, Stage, StreamId, StreamItem};

fn frame(channel: StreamId, seq: u64, pts: ClockTime) -> FrameRecord {
    FrameRecord::new(channel, seq, Some(pts))
}

fn collect_until_global_eos(rx: &mpsc::Receiver<StreamItem>) -> Vec<FrameRecord> {
    let mut frames = Vec::new();
    loop {
        match rx.recv_timeout(Duration::from_secs(10)).expect("output") {
            StreamItem::Frame(f) => frames.push(f),
            StreamItem::GlobalEos => return frames,
            other => panic!("unexpected item {other:?}"),
        }
    }
}

#[test]
fn stale_slot_defers_tick_until_straggler_catches_up() {
    let (tx, rx) = mpsc::channel();
    let mut mux = Muxer::new(MuxerConfig::default(), tx);
    mux.register_channel(0).unwrap();
    mux.register_channel(1).unwrap();
    mux.start().unwrap();

    // Tick 1 latches target 12 and drops A's stale 10.
    mux.submit(0, frame(0, 0, 10)).unwrap();
    mux.submit(1, frame(1, 0, 12)).unwrap();
    std::thread::sleep(Duration::from_millis(200));

    // B advances to 22 (overwrite), A refills with 20; the deferred tick
    // completes and stamps both outputs with the newest slot.
    mux.submit(1, frame(1, 1, 22)).unwrap();
    mux.submit(0, frame(0, 1, 20)).unwrap();

    mux.end_of_stream(0).unwrap();
    mux.end_of_stream(1).unwrap();
    let frames = collect_until_global_eos(&rx);

    assert_eq!(frames.len(), 2);
    assert!(frames.iter().all(|f| f.pts == Some(22)));
    let seqs: BTreeMap<StreamId, u64> = frames.iter().map(|f| (f.stream_id, f.frame_id.seq)).collect();
    assert_eq!(seqs[&0], 1, "A's 10 must have been dropped");
    assert_eq!(seqs[&1], 1, "B's 12 must have been overwritten");
}

#[test]
fn every_tick_represents_every_channel_exactly_once() {
    let (tx, rx) = mpsc::channel();
    let mut mux = Muxer::new(MuxerConfig::default(), tx);
    for channel in 0..3 {
        mux.register_channel(channel).unwrap();
    }
    mux.start().unwrap();

    for tick in 0..20u64 {
        let pts = 1000 * (tick + 1);
        for channel in 0..3 {
            mux.submit(channel, frame(channel, tick, pts)).unwrap();
        }
        // Keep ticks distinct: wait for this tick's emissions before
        // submitting the next round.
        for _ in 0..3 {
            match rx.recv_timeout(Duration::from_secs(10)).expect("output") {
                StreamItem::Frame(f) => assert_eq!(f.pts, Some(pts)),
                other => panic!("unexpected item {other:?}"),
            }
        }
    }

    for channel in 0..3 {
        mux.end_of_stream(channel).unwrap();
    }
    assert!(matches!(
        rx.recv_timeout(Duration::from_secs(10)).unwrap(),
        StreamItem::GlobalEos
    ));
}

#[test]
fn eos_mid_tick_completes_with_remaining_channels() {
    let (tx, rx) = mpsc::channel();
    let mut mux = Muxer::new(MuxerConfig::default(), tx);
    mux.register_channel(0).unwrap();
    mux.register_channel(1).unwrap();
    mux.start().unwrap();

    // Channel 1 ends while channel 0's slot is filled: the tick must not
    // stay blocked on the finished channel.
    mux.submit(0, frame(0, 0, 10)).unwrap();
    mux.end_of_stream(1).unwrap();

    match rx.recv_timeout(Duration::from_secs(10)).expect("output") {
        StreamItem::Frame(f) => {
            assert_eq!(f.stream_id, 0);
            assert_eq!(f.pts, Some(10));
        }
        other => panic!("unexpected item {other:?}"),
    }

    mux.end_of_stream(0).unwrap();
    assert!(matches!(
        rx.recv_timeout(Duration::from_secs(10)).unwrap(),
        StreamItem::GlobalEos
    ));
}

#[test]
fn explicit_deregistration_drives_global_eos() {
    let (tx, rx) = mpsc::channel();
    let mut mux = Muxer::new(MuxerConfig::default(), tx);
    mux.register_channel(0).unwrap();
    mux.register_channel(1).unwrap();
    mux.start().unwrap();

    mux.deregister_channel(0);
    mux.deregister_channel(1);

    assert!(matches!(
        rx.recv_timeout(Duration::from_secs(10)).unwrap(),
        StreamItem::GlobalEos
    ));
}
