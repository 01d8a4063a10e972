//! Outbound metadata boundary.
//!
//! Serialization formats and broker transports live outside this crate;
//! what remains here is the opaque `publish(topic, bytes)` seam they plug
//! into, plus a digest type that callers typically publish.

use anyhow::Result;
use serde::Serialize;

use crate::meta::FrameRecord;

/// Opaque outbound sink for per-frame metadata.
pub trait MetadataSink: Send {
    fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<()>;
}

/// Sink that logs instead of transporting; useful standalone and in tests.
#[derive(Default)]
pub struct LogSink {
    published: u64,
}

impl LogSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn published(&self) -> u64 {
        self.published
    }
}

impl MetadataSink for LogSink {
    fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<()> {
        self.published += 1;
        log::info!("publish {topic}: {} bytes", payload.len());
        Ok(())
    }
}

/// Compact per-frame summary for publication.
#[derive(Debug, Serialize)]
pub struct FrameDigest {
    pub stream_id: u32,
    pub seq: u64,
    pub pts: Option<u64>,
    pub detections: usize,
    pub labels: Vec<i64>,
    pub output_stages: Vec<u32>,
}

impl FrameDigest {
    pub fn from_frame(frame: &FrameRecord) -> Self {
        Self {
            stream_id: frame.stream_id,
            seq: frame.frame_id.seq,
            pts: frame.pts,
            detections: frame.detections.len(),
            labels: frame.detections.iter().map(|d| d.label).collect(),
            output_stages: frame.output_tensors.keys().copied().collect(),
        }
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_serializes_to_json() -> Result<()> {
        let frame = FrameRecord::new(3, 12, Some(90)).with_video(640, 480, "NV12", 30.0);
        let digest = FrameDigest::from_frame(&frame);
        let bytes = digest.to_json()?;
        let value: serde_json::Value = serde_json::from_slice(&bytes)?;
        assert_eq!(value["stream_id"], 3);
        assert_eq!(value["seq"], 12);
        Ok(())
    }

    #[test]
    fn log_sink_counts_publications() -> Result<()> {
        let mut sink = LogSink::new();
        sink.publish("frames", b"{}")?;
        sink.publish("frames", b"{}")?;
        assert_eq!(sink.published(), 2);
        Ok(())
    }
}
