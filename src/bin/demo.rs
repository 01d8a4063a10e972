//! demo - synthetic multi-channel pipeline.
//!
//! Drives the full core path with generated frames:
//!
//! 1. N producer threads admit timestamped frames into the input selector
//!    (each with a synthetic stage-in tensor attached)
//! 2. the selector's merged stream feeds the inference scheduler (stub
//!    engine)
//! 3. a postprocess step decodes the stage-out tensor into a detection
//! 4. the router demultiplexes results back to per-channel sinks, which
//!    publish a JSON digest per frame
//!
//! Ctrl-C ends the streams early; the pipeline then drains and shuts down
//! through the normal two-tier EOS path.

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};

use framemux::engine::StubEngine;
use framemux::meta::{DataType, DetectionRecord, Tensor, TensorSet};
use framemux::selector::InputSelector;
use framemux::sink::{FrameDigest, LogSink, MetadataSink};
use framemux::{
    config::PipelineConfig, infer::InferScheduler, router::Router, ClockTime, FrameRecord,
    MetaIdAllocator, PipelineContext, Stage, StreamId, StreamItem,
};

const INPUT_TENSOR_BYTES: usize = 64;
const OUTPUT_TENSOR_BYTES: usize = 32;

#[derive(Parser, Debug)]
#[command(name = "demo", about = "framemux synthetic pipeline demo")]
struct Args {
    /// TOML pipeline configuration file.
    #[arg(long, env = "FRAMEMUX_CONFIG")]
    config: Option<PathBuf>,

    /// Frames produced per channel.
    #[arg(long, default_value_t = 100)]
    frames: u64,

    /// Synthetic source frame rate.
    #[arg(long, default_value_t = 30)]
    fps: u32,
}

fn synthetic_input(channel: StreamId, seq: u64) -> TensorSet {
    // Deterministic per-frame pattern, enough for the stub engine's
    // checksum to vary.
    let pixels: Vec<u8> = (0..INPUT_TENSOR_BYTES)
        .map(|i| (i as u64 + seq + channel as u64) as u8)
        .collect();
    let mut set = TensorSet::new();
    set.push(Tensor::from_vec(
        "pixels",
        vec![INPUT_TENSOR_BYTES as i64],
        DataType::U8,
        pixels,
    ));
    set
}

/// Decode the stage-out tensor into one detection. Stands in for the
/// out-of-scope postprocessing stage.
fn postprocess(frame: &mut FrameRecord, stage_out_id: u32, ids: &MetaIdAllocator) {
    let Some(outputs) = frame.output_tensors.get(&stage_out_id) else {
        return;
    };
    let Some(logits) = outputs.get("logits") else {
        return;
    };
    let mut checksum = [0u8; 8];
    checksum.copy_from_slice(&logits.data()[..8]);
    let score = u64::from_le_bytes(checksum);

    let mut detection = DetectionRecord::new(ids);
    detection.label = (score % 10) as i64;
    detection.confidence = 0.5 + (score % 50) as f32 / 100.0;
    detection.bbox = [8.0, 8.0, 56.0, 56.0];
    frame.add_detection(detection);
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let cfg = match &args.config {
        Some(path) => PipelineConfig::load_from(path)?,
        None => PipelineConfig::load()?,
    };
    log::info!(
        "demo: {} channels, {} frames/channel, selector depth {}",
        cfg.channels,
        args.frames,
        cfg.selector.max_queue_size
    );

    let ctx = PipelineContext::new();
    let interrupted = Arc::new(AtomicBool::new(false));
    {
        let interrupted = interrupted.clone();
        ctrlc::set_handler(move || {
            log::info!("demo: interrupt, draining");
            interrupted.store(true, Ordering::SeqCst);
        })?;
    }

    // selector -> scheduler -> router
    let (sel_tx, sel_rx) = mpsc::channel();
    let (infer_tx, infer_rx) = mpsc::channel();

    let mut selector = InputSelector::new(cfg.selector.clone(), sel_tx)?;
    for channel in 0..cfg.channels {
        selector.register_channel(channel)?;
    }
    selector.start()?;
    let selector = Arc::new(selector);

    let engine = Arc::new(StubEngine::new(OUTPUT_TENSOR_BYTES));
    let mut scheduler = InferScheduler::new(&ctx, cfg.infer.clone(), engine, infer_tx)?;
    scheduler.start()?;
    let scheduler = Arc::new(scheduler);

    let mut router = Router::new();
    let mut sink_rxs = Vec::new();
    for channel in 0..cfg.channels {
        let (tx, rx) = mpsc::channel();
        router.link(channel, tx)?;
        sink_rxs.push((channel, rx));
    }
    router.start()?;

    // Producers: one thread per channel.
    let frame_interval: ClockTime = 1_000_000_000 / args.fps.max(1) as ClockTime;
    let producers: Vec<_> = (0..cfg.channels)
        .map(|channel| {
            let selector = selector.clone();
            let interrupted = interrupted.clone();
            let frames = args.frames;
            std::thread::spawn(move || -> Result<()> {
                for seq in 0..frames {
                    if interrupted.load(Ordering::SeqCst) {
                        break;
                    }
                    // Per-channel phase offset keeps the merged timestamps
                    // interleaved rather than tied.
                    let pts = seq * frame_interval + channel as ClockTime * 1_000_000;
                    let mut frame = FrameRecord::new(channel, seq, Some(pts)).with_video(
                        64,
                        64,
                        "GRAY8",
                        30.0,
                    );
                    frame
                        .input_tensors
                        .insert(1, synthetic_input(channel, seq));
                    selector.admit(channel, frame)?;
                }
                selector.end_of_stream(channel)?;
                Ok(())
            })
        })
        .collect();

    // Selector output feeds the scheduler.
    let stage_pump = {
        let scheduler = scheduler.clone();
        std::thread::spawn(move || {
            for item in sel_rx {
                match item {
                    StreamItem::Frame(frame) => {
                        if let Err(err) = scheduler.submit(frame) {
                            log::warn!("demo: submit failed: {err:#}");
                        }
                    }
                    StreamItem::ChannelEos(id) => scheduler.channel_eos(id),
                    StreamItem::GlobalEos => {
                        scheduler.global_eos();
                        break;
                    }
                    // No broadcast events in the synthetic pipeline.
                    StreamItem::Control(_) | StreamItem::RouteMarker(_) => {}
                }
            }
        })
    };

    // Scheduler output is postprocessed, then routed.
    let route_pump = {
        let ids = ctx.meta_ids();
        let stage_out_id = cfg.infer.stage_out_id;
        std::thread::spawn(move || {
            for item in infer_rx {
                let item = match item {
                    StreamItem::Frame(mut frame) => {
                        postprocess(&mut frame, stage_out_id, &ids);
                        StreamItem::Frame(frame)
                    }
                    other => other,
                };
                let done = matches!(item, StreamItem::GlobalEos);
                if let Err(err) = router.process(item) {
                    log::warn!("demo: routing failed: {err:#}");
                }
                if done {
                    break;
                }
            }
        })
    };

    // Per-channel sinks.
    let sinks: Vec<_> = sink_rxs
        .into_iter()
        .map(|(channel, rx)| {
            std::thread::spawn(move || -> Result<u64> {
                let mut sink = LogSink::new();
                let mut frames = 0u64;
                for item in rx {
                    match item {
                        StreamItem::Frame(frame) => {
                            frames += 1;
                            let digest = FrameDigest::from_frame(&frame);
                            sink.publish(&format!("frames/{channel}"), &digest.to_json()?)?;
                        }
                        StreamItem::ChannelEos(_) | StreamItem::GlobalEos => break,
                        StreamItem::Control(_) | StreamItem::RouteMarker(_) => {}
                    }
                }
                Ok(frames)
            })
        })
        .collect();

    for producer in producers {
        if let Err(err) = producer.join().expect("producer panicked") {
            log::warn!("demo: producer failed: {err:#}");
        }
    }
    stage_pump.join().expect("stage pump panicked");
    route_pump.join().expect("route pump panicked");

    let mut total = 0u64;
    for sink in sinks {
        total += sink.join().expect("sink panicked")?;
    }
    log::info!("demo: delivered {total} frames");
    Ok(())
}
