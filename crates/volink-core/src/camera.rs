//! Camera pose and the view defaults derived from the volume.

use serde::{Deserialize, Serialize};

use crate::geometry::{Quat, Vec3};

/// Zoom level used before anyone has moved the camera.
pub const BASE_ZOOM: f64 = 1.0;

/// A replicated camera pose.
///
/// Orthographic views express magnification through `zoom` rather than
/// through the distance to the volume.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CameraPose {
    pub position: Vec3,
    pub orientation: Quat,
    pub zoom: f64,
}

impl Default for CameraPose {
    fn default() -> Self {
        Self {
            position: Vec3::ZERO,
            orientation: Quat::IDENTITY,
            zoom: BASE_ZOOM,
        }
    }
}

impl CameraPose {
    pub fn new(position: Vec3, orientation: Quat, zoom: f64) -> Self {
        Self { position, orientation, zoom }
    }

    /// A pose at `position` oriented towards `target`.
    ///
    /// Falls back to the identity orientation when the direction is
    /// degenerate.
    pub fn looking_at(position: Vec3, target: Vec3, up: Vec3) -> Self {
        let orientation = Quat::looking_at(position, target, up).unwrap_or(Quat::IDENTITY);
        Self { position, orientation, zoom: BASE_ZOOM }
    }

    /// Return a copy with zoom clamped to `[min_zoom, max_zoom]`.
    pub fn clamped(mut self, min_zoom: f64, max_zoom: f64) -> Self {
        self.zoom = self.zoom.clamp(min_zoom, max_zoom);
        self
    }
}

/// Voxel dimensions of the loaded dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeExtent {
    pub width: u32,
    pub height: u32,
    pub depth: u32,
}

impl VolumeExtent {
    pub fn new(width: u32, height: u32, depth: u32) -> Self {
        Self { width, height, depth }
    }

    /// Slice shown before anyone has selected one.
    pub fn initial_slice(&self) -> u32 {
        self.depth / 2
    }

    /// Highest selectable slice index (inclusive).
    pub fn max_slice(&self) -> u32 {
        self.depth
    }

    pub fn center(&self) -> Vec3 {
        Vec3::new(
            f64::from(self.width) / 2.0,
            f64::from(self.height) / 2.0,
            f64::from(self.depth) / 2.0,
        )
    }
}

/// Which side of the active slice the renderer discards.
///
/// The part of the volume between the camera and the slice is clipped away,
/// so the sense flips as the camera crosses the volume's mid-depth.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClipSense {
    Below,
    Above,
}

impl ClipSense {
    pub fn for_pose(pose: &CameraPose, extent: &VolumeExtent) -> Self {
        if pose.position.z < f64::from(extent.depth) / 2.0 {
            ClipSense::Below
        } else {
            ClipSense::Above
        }
    }

    pub fn sign(self) -> f64 {
        match self {
            ClipSense::Below => -1.0,
            ClipSense::Above => 1.0,
        }
    }

    /// Signed clip-plane value for a slice.
    pub fn clip_plane(self, slice: u32) -> f64 {
        f64::from(slice) * self.sign()
    }
}

/// What a participant renders while the replica fields are still unset.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ViewDefaults {
    pub camera: CameraPose,
    pub slice: u32,
}

impl ViewDefaults {
    /// Defaults for a dataset: the camera sits off one corner looking at the
    /// center, and the middle slice is selected.
    pub fn for_extent(extent: &VolumeExtent) -> Self {
        let w = f64::from(extent.width);
        let h = f64::from(extent.height);
        let d = f64::from(extent.depth);
        let position = Vec3::new(-w * 2.0, h / 2.0, d * 2.0);
        Self {
            camera: CameraPose::looking_at(position, extent.center(), Vec3::new(0.0, -1.0, 0.0)),
            slice: extent.initial_slice(),
        }
    }
}
