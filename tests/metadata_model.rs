//! Metadata ownership invariants exercised the way a two-branch pipeline
//! would: deep-copy a frame per branch, decorate each copy independently,
//! then gather the branches back together by meta_id.

use std::any::Any;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use framemux::gather::Gather;
use framemux::meta::{
    DataType, DetectionRecord, ExtensionData, Tensor, TensorSet, UserExtension,
    EXTENSION_KIND_FRAME, UNSET_CONFIDENCE, UNSET_ID,
};
use framemux::{FrameRecord, MetaIdAllocator, Stage, StreamItem};

struct CountedPayload {
    value: Vec<u8>,
    clones: Arc<AtomicUsize>,
}

impl ExtensionData for CountedPayload {
    fn clone_data(&self) -> Box<dyn ExtensionData> {
        self.clones.fetch_add(1, Ordering::SeqCst);
        Box::new(CountedPayload {
            value: self.value.clone(),
            clones: self.clones.clone(),
        })
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

fn tensor_set(tag: u8) -> TensorSet {
    let mut set = TensorSet::new();
    set.push(Tensor::from_vec("t", vec![2], DataType::U8, vec![tag; 2]));
    set
}

#[test]
fn frame_deep_copy_clones_extensions_exactly_once() {
    let ids = MetaIdAllocator::default();
    let clones = Arc::new(AtomicUsize::new(0));

    let mut frame = FrameRecord::new(0, 0, Some(10));
    frame.attach_extension(UserExtension::new(
        EXTENSION_KIND_FRAME,
        Box::new(CountedPayload {
            value: vec![1, 2, 3],
            clones: clones.clone(),
        }),
    ));
    let mut det = DetectionRecord::new(&ids);
    det.extensions.push(UserExtension::new(
        EXTENSION_KIND_FRAME,
        Box::new(CountedPayload {
            value: vec![4, 5],
            clones: clones.clone(),
        }),
    ));
    frame.add_detection(det);

    let copy = frame.deep_copy();
    assert_eq!(clones.load(Ordering::SeqCst), 2, "one clone per extension");

    // Equal content, distinct payload storage.
    let original = frame.extensions[0].payload::<CountedPayload>().unwrap();
    let cloned = copy.extensions[0].payload::<CountedPayload>().unwrap();
    assert_eq!(original.value, cloned.value);
    assert!(!std::ptr::eq(original, cloned));
}

#[test]
fn gather_correlates_branches_by_meta_id() {
    let ids = MetaIdAllocator::default();

    // One source frame with one detection, split into two branch copies.
    let mut source = FrameRecord::new(0, 3, Some(30));
    let mut det = DetectionRecord::new(&ids);
    det.bbox = [1.0, 1.0, 5.0, 5.0];
    let shared_id = det.meta_id();
    source.add_detection(det);

    let mut detect_branch = source.deep_copy();
    detect_branch.detections[0].label = 2;
    detect_branch.detections[0].confidence = 0.8;
    detect_branch.detections[0]
        .output_tensors
        .insert(1, tensor_set(0xD1));

    let mut pose_branch = source.deep_copy();
    pose_branch.detections[0].keypoints = vec![0.25; 34];
    pose_branch.detections[0]
        .output_tensors
        .insert(2, tensor_set(0xD2));

    let (tx, rx) = mpsc::channel();
    let mut gather = Gather::new(tx);
    gather.register_channel(0).unwrap();
    gather.register_channel(1).unwrap();
    gather.start().unwrap();

    gather.submit(0, detect_branch).unwrap();
    gather.submit(1, pose_branch).unwrap();

    let merged = match rx.recv_timeout(Duration::from_secs(10)).unwrap() {
        StreamItem::Frame(f) => f,
        other => panic!("unexpected item {other:?}"),
    };

    assert_eq!(merged.detections.len(), 1, "same meta_id merges, not duplicates");
    let det = &merged.detections[0];
    assert_eq!(det.meta_id(), shared_id);
    // Base branch fields kept, secondary branch fields filled in.
    assert_eq!(det.label, 2);
    assert_eq!(det.confidence, 0.8);
    assert_eq!(det.keypoints.len(), 34);
    // Tensor stages unioned.
    assert!(det.output_tensors.contains_key(&1));
    assert!(det.output_tensors.contains_key(&2));
}

#[test]
fn merge_leaves_set_fields_untouched_and_fills_sentinels() {
    let ids = MetaIdAllocator::default();
    let mut base = DetectionRecord::new(&ids);
    base.confidence = 0.4;
    assert_eq!(base.track_id, UNSET_ID);

    let mut secondary = base.deep_copy();
    secondary.confidence = 0.9;
    secondary.track_id = 17;
    secondary.secondary_confidence = 0.3;

    base.merge_from(&secondary);
    assert_eq!(base.confidence, 0.4, "set base field must not change");
    assert_eq!(base.track_id, 17, "sentinel base field takes secondary value");
    assert_eq!(base.secondary_confidence, 0.3);
    assert_ne!(base.secondary_confidence, UNSET_CONFIDENCE);
}
