//! Frame and detection metadata model.
//!
//! Ownership is strictly tree-shaped: a [`FrameRecord`] owns its detections,
//! extensions and tensor sets, a [`DetectionRecord`] owns its own, and
//! dropping the frame cascades through all of it. Components hand frames to
//! each other by value; nothing in the model is shared between threads.
//!
//! - `object`: per-detection metadata and the cross-branch merge rules
//! - `user`: opaque extension payloads with a typed clone/release contract
//! - `tensor`: per-stage tensor sets, optionally backed by pool memory

pub mod object;
pub mod tensor;
pub mod user;

use std::collections::BTreeMap;

pub use object::{
    box_is_empty, BoundingBox, ClassMap, DetectionRecord, Point, UNSET_CONFIDENCE, UNSET_ID,
};
pub use tensor::{DataType, Tensor, TensorSet};
pub use user::{ExtensionData, UserExtension, EXTENSION_KIND_FRAME, EXTENSION_KIND_OBJECT};

use crate::{ClockTime, StreamId};
use object::{deep_copy_tensor_map, union_tensor_map};

/// Logical frame identity: the ingesting channel plus a per-channel
/// sequence number. Assigned once at ingestion and preserved by copies, so
/// "same frame" checks never rely on storage identity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FrameId {
    pub stream_id: StreamId,
    pub seq: u64,
}

/// Region-of-interest `[x, y, width, height]`; `-1` means unset.
pub type Roi = [i32; 4];

const ROI_UNSET: Roi = [-1, -1, -1, -1];

/// Everything the pipeline knows about one frame.
#[derive(Debug)]
pub struct FrameRecord {
    pub stream_id: StreamId,
    pub frame_id: FrameId,
    pub pts: Option<ClockTime>,

    pub width: i32,
    pub height: i32,
    pub format: Option<String>,
    pub frame_rate: f32,
    pub roi: Roi,

    pub detections: Vec<DetectionRecord>,
    pub extensions: Vec<UserExtension>,
    pub input_tensors: BTreeMap<u32, TensorSet>,
    pub output_tensors: BTreeMap<u32, TensorSet>,
}

impl FrameRecord {
    /// A bare record carrying only identity and timing; the video
    /// descriptor is filled in when known.
    pub fn new(stream_id: StreamId, seq: u64, pts: Option<ClockTime>) -> Self {
        Self {
            stream_id,
            frame_id: FrameId { stream_id, seq },
            pts,
            width: -1,
            height: -1,
            format: None,
            frame_rate: 0.0,
            roi: ROI_UNSET,
            detections: Vec::new(),
            extensions: Vec::new(),
            input_tensors: BTreeMap::new(),
            output_tensors: BTreeMap::new(),
        }
    }

    pub fn with_video(mut self, width: i32, height: i32, format: &str, frame_rate: f32) -> Self {
        self.width = width;
        self.height = height;
        self.format = Some(format.to_string());
        self.frame_rate = frame_rate;
        self
    }

    pub fn roi(&self) -> Option<Roi> {
        if self.roi == ROI_UNSET {
            None
        } else {
            Some(self.roi)
        }
    }

    pub fn add_detection(&mut self, detection: DetectionRecord) {
        self.detections.push(detection);
    }

    pub fn attach_extension(&mut self, extension: UserExtension) {
        self.extensions.push(extension);
    }

    pub fn detection_by_meta_id(&mut self, meta_id: u64) -> Option<&mut DetectionRecord> {
        self.detections.iter_mut().find(|d| d.meta_id() == meta_id)
    }

    /// Full duplicate. Every detection keeps its `meta_id`, every owned
    /// collection is duplicated independently, and each extension's
    /// `clone_data` runs exactly once.
    pub fn deep_copy(&self) -> FrameRecord {
        FrameRecord {
            stream_id: self.stream_id,
            frame_id: self.frame_id,
            pts: self.pts,
            width: self.width,
            height: self.height,
            format: self.format.clone(),
            frame_rate: self.frame_rate,
            roi: self.roi,
            detections: self.detections.iter().map(DetectionRecord::deep_copy).collect(),
            extensions: self.extensions.iter().map(UserExtension::deep_copy).collect(),
            input_tensors: deep_copy_tensor_map(&self.input_tensors),
            output_tensors: deep_copy_tensor_map(&self.output_tensors),
        }
    }

    /// Merge a parallel branch's view of the same frame into this one.
    ///
    /// Detections are matched by `meta_id`: matches are merged field-wise
    /// (this frame wins set fields), unmatched ones are deep-copied in
    /// wholesale. Frame-level tensor registrations are unioned by stage-id
    /// with this frame winning conflicts.
    pub fn merge_from(&mut self, other: &FrameRecord) {
        for theirs in &other.detections {
            let matched = self
                .detections
                .iter()
                .position(|d| d.meta_id() == theirs.meta_id());
            match matched {
                Some(index) => self.detections[index].merge_from(theirs),
                None => self.detections.push(theirs.deep_copy()),
            }
        }
        union_tensor_map(&mut self.input_tensors, &other.input_tensors);
        union_tensor_map(&mut self.output_tensors, &other.output_tensors);
    }
}
