//! Messages exchanged between the tracking front-end and the local mapper.

use crate::frame::Frame;
use crate::geometry::Pose;
use crate::map::{MapLineId, MapPointId};

/// A keyframe handed over by the tracker.
///
/// `tracked_points`/`tracked_lines` are positional over the frame's features
/// and carry the landmarks the tracker matched while following the local
/// map; the mapper turns them into observations during ingestion.
#[derive(Debug, Clone)]
pub struct NewKeyFrame {
    /// World-to-camera pose estimated by the tracker.
    pub pose: Pose,
    /// Extracted features, descriptors, intrinsics and pyramids.
    pub frame: Frame,
    /// Feature index → tracked map point.
    pub tracked_points: Vec<Option<MapPointId>>,
    /// Keyline index → tracked map line.
    pub tracked_lines: Vec<Option<MapLineId>>,
}

impl NewKeyFrame {
    /// A keyframe with no tracked landmarks (map bootstrap).
    pub fn untracked(pose: Pose, frame: Frame) -> Self {
        let n_points = frame.keypoints.len();
        let n_lines = frame.keylines.len();
        Self {
            pose,
            frame,
            tracked_points: vec![None; n_points],
            tracked_lines: vec![None; n_lines],
        }
    }
}
