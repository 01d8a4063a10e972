//! Per-detection metadata.
//!
//! A [`DetectionRecord`] is owned by its frame and identified by a
//! process-unique `meta_id` assigned at creation and preserved by every
//! copy: it is the key branches use to recognize "the same detection"
//! when parallel analytics results are gathered back together.
//!
//! Scalar fields use `-1` as the unset sentinel and collections use
//! emptiness, which is what the cross-branch merge rules test against.

use std::collections::BTreeMap;

use crate::meta::tensor::TensorSet;
use crate::meta::user::UserExtension;
use crate::MetaIdAllocator;

/// Unset sentinel for integer-valued detection fields.
pub const UNSET_ID: i64 = -1;
/// Unset sentinel for confidence values.
pub const UNSET_CONFIDENCE: f32 = -1.0;

/// A box is `[left, top, right, bottom]`; all-zero means unset.
pub type BoundingBox = [f32; 4];

pub fn box_is_empty(b: &BoundingBox) -> bool {
    b.iter().all(|v| *v == 0.0)
}

/// A 2-D landmark point.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

/// Dense per-pixel class assignment (e.g. a segmentation output).
#[derive(Clone, Debug, PartialEq)]
pub struct ClassMap {
    pub width: u32,
    pub height: u32,
    pub data: Vec<i32>,
}

/// One detected object and everything downstream stages attached to it.
#[derive(Debug)]
pub struct DetectionRecord {
    meta_id: u64,

    // primary result
    pub track_id: i64,
    pub label: i64,
    pub label_name: Option<String>,
    pub confidence: f32,
    pub bbox: BoundingBox,
    pub keypoints: Vec<f32>,
    pub feature: Vec<f32>,

    // secondary result (e.g. a face found inside the primary box)
    pub secondary_bbox: BoundingBox,
    pub secondary_confidence: f32,
    pub landmarks: Vec<Point>,
    pub secondary_feature: Vec<f32>,

    pub class_map: Option<ClassMap>,

    pub extensions: Vec<UserExtension>,
    pub input_tensors: BTreeMap<u32, TensorSet>,
    pub output_tensors: BTreeMap<u32, TensorSet>,
}

impl DetectionRecord {
    /// Create an empty record with a fresh process-unique `meta_id`.
    pub fn new(ids: &MetaIdAllocator) -> Self {
        Self {
            meta_id: ids.next(),
            track_id: UNSET_ID,
            label: UNSET_ID,
            label_name: None,
            confidence: UNSET_CONFIDENCE,
            bbox: [0.0; 4],
            keypoints: Vec::new(),
            feature: Vec::new(),
            secondary_bbox: [0.0; 4],
            secondary_confidence: UNSET_CONFIDENCE,
            landmarks: Vec::new(),
            secondary_feature: Vec::new(),
            class_map: None,
            extensions: Vec::new(),
            input_tensors: BTreeMap::new(),
            output_tensors: BTreeMap::new(),
        }
    }

    pub fn meta_id(&self) -> u64 {
        self.meta_id
    }

    /// Full duplicate preserving `meta_id`. Owned collections are duplicated
    /// independently; each extension is cloned through its own `clone_data`.
    pub fn deep_copy(&self) -> DetectionRecord {
        DetectionRecord {
            meta_id: self.meta_id,
            track_id: self.track_id,
            label: self.label,
            label_name: self.label_name.clone(),
            confidence: self.confidence,
            bbox: self.bbox,
            keypoints: self.keypoints.clone(),
            feature: self.feature.clone(),
            secondary_bbox: self.secondary_bbox,
            secondary_confidence: self.secondary_confidence,
            landmarks: self.landmarks.clone(),
            secondary_feature: self.secondary_feature.clone(),
            class_map: self.class_map.clone(),
            extensions: self.extensions.iter().map(UserExtension::deep_copy).collect(),
            input_tensors: deep_copy_tensor_map(&self.input_tensors),
            output_tensors: deep_copy_tensor_map(&self.output_tensors),
        }
    }

    /// Fill unset fields from `other`, a record describing the same
    /// detection on a parallel branch. Set fields always win; sentinel or
    /// empty fields take the other side's value. Tensor registrations are
    /// unioned by stage-id with this record winning conflicts.
    pub fn merge_from(&mut self, other: &DetectionRecord) {
        merge_id(&mut self.track_id, other.track_id);
        merge_id(&mut self.label, other.label);
        if self.label_name.is_none() {
            self.label_name = other.label_name.clone();
        }
        merge_confidence(&mut self.confidence, other.confidence);
        merge_box(&mut self.bbox, &other.bbox);
        merge_vec(&mut self.keypoints, &other.keypoints);
        merge_vec(&mut self.feature, &other.feature);

        merge_box(&mut self.secondary_bbox, &other.secondary_bbox);
        merge_confidence(&mut self.secondary_confidence, other.secondary_confidence);
        merge_vec(&mut self.landmarks, &other.landmarks);
        merge_vec(&mut self.secondary_feature, &other.secondary_feature);

        if self.class_map.is_none() {
            self.class_map = other.class_map.clone();
        }

        union_tensor_map(&mut self.input_tensors, &other.input_tensors);
        union_tensor_map(&mut self.output_tensors, &other.output_tensors);
    }
}

fn merge_id(dst: &mut i64, src: i64) {
    if *dst == UNSET_ID && src != UNSET_ID {
        *dst = src;
    }
}

fn merge_confidence(dst: &mut f32, src: f32) {
    if *dst == UNSET_CONFIDENCE && src != UNSET_CONFIDENCE {
        *dst = src;
    }
}

fn merge_box(dst: &mut BoundingBox, src: &BoundingBox) {
    if box_is_empty(dst) && !box_is_empty(src) {
        *dst = *src;
    }
}

fn merge_vec<T: Clone>(dst: &mut Vec<T>, src: &[T]) {
    if dst.is_empty() && !src.is_empty() {
        *dst = src.to_vec();
    }
}

pub(crate) fn deep_copy_tensor_map(map: &BTreeMap<u32, TensorSet>) -> BTreeMap<u32, TensorSet> {
    map.iter().map(|(k, v)| (*k, v.deep_copy())).collect()
}

pub(crate) fn union_tensor_map(dst: &mut BTreeMap<u32, TensorSet>, src: &BTreeMap<u32, TensorSet>) {
    for (stage_id, set) in src {
        if dst.contains_key(stage_id) {
            continue;
        }
        dst.insert(*stage_id, set.deep_copy());
    }
}
