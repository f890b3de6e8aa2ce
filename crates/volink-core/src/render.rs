//! Interface to the rendering collaborator.
//!
//! The renderer owns the scene: the rendered camera, the slice geometry,
//! and the meshes for annotation paths. Session code only tells it what to
//! show and asks it what lies under the pointer.

use kurbo::Point;

use crate::camera::CameraPose;
use crate::events::{SliceIndex, StrokeIndex};
use crate::geometry::Vec3;
use crate::strokes::StrokePath;

/// Surfaces a hit test can be restricted to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HitTarget {
    /// The cross-section currently shown.
    SliceSurface,
    /// Materialized annotation paths.
    AnnotationStroke,
}

/// Result of a hit test.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Hit {
    /// Intersection in volume space.
    pub point: Vec3,
    /// The stroke that was hit, for `HitTarget::AnnotationStroke`.
    pub stroke: Option<StrokeIndex>,
}

/// Rendering and picking operations the session drives.
pub trait SceneRenderer {
    /// Move the rendered camera. Implementations recompute anything derived
    /// from the pose, such as the clip sense.
    fn apply_camera_pose(&mut self, pose: &CameraPose);

    /// Show the given cross-section.
    fn apply_slice_selection(&mut self, slice: SliceIndex);

    /// Discard the part of the volume on the camera's side of the slice.
    /// `constant` is the signed plane offset from `ClipSense::clip_plane`.
    fn apply_clip_plane(&mut self, _constant: f64) {}

    /// Create the path for `index`, or extend it with the segments it has
    /// gained since the last call.
    fn build_or_extend_path(&mut self, index: StrokeIndex, path: &StrokePath);

    /// Tear down the path and release its resources.
    fn remove_path(&mut self, index: StrokeIndex);

    /// Toggle the highlight on a path.
    fn set_path_highlight(&mut self, _index: StrokeIndex, _highlighted: bool) {}

    /// Find what lies under a screen position, considering only `target`.
    fn hit_test(&self, screen: Point, target: HitTarget) -> Option<Hit>;
}
