//! Commands published to the ordering channel and the notifications the
//! replica emits when applying them.
//!
//! Every command is validated before it touches session state. A command
//! that fails validation is dropped without side effects.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::camera::CameraPose;
use crate::geometry::{Quat, Vec3};

/// Stable index of a stroke. Allocated in increasing order, never reused.
pub type StrokeIndex = u64;

/// Index of a cross-section along the volume's depth axis.
pub type SliceIndex = u32;

/// Identifies a participant (one per connected view).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(String);

impl ParticipantId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// A fresh random id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ParticipantId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Command validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum CommandError {
    #[error("Malformed command: {0}")]
    Decode(String),
    #[error("Non-finite value in field `{0}`")]
    NonFinite(&'static str),
    #[error("Zoom must be positive, got {0}")]
    InvalidZoom(f64),
    #[error("Empty participant id in field `{0}`")]
    EmptyParticipant(&'static str),
}

/// Payload of `move_camera` and `camera_moved`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraMove {
    pub position: Vec3,
    pub orientation: Quat,
    pub zoom: f64,
    pub origin_id: ParticipantId,
}

impl CameraMove {
    pub fn new(pose: CameraPose, origin_id: ParticipantId) -> Self {
        Self {
            position: pose.position,
            orientation: pose.orientation,
            zoom: pose.zoom,
            origin_id,
        }
    }

    pub fn pose(&self) -> CameraPose {
        CameraPose::new(self.position, self.orientation, self.zoom)
    }

    fn validate(&self) -> Result<(), CommandError> {
        if !self.position.is_finite() {
            return Err(CommandError::NonFinite("position"));
        }
        if !self.orientation.is_finite() {
            return Err(CommandError::NonFinite("orientation"));
        }
        if !self.zoom.is_finite() {
            return Err(CommandError::NonFinite("zoom"));
        }
        if self.zoom <= 0.0 {
            return Err(CommandError::InvalidZoom(self.zoom));
        }
        if self.origin_id.is_empty() {
            return Err(CommandError::EmptyParticipant("origin_id"));
        }
        Ok(())
    }
}

/// Payload of `select_slice` and `slice_selected`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SliceSelection {
    pub slice_index: SliceIndex,
    pub origin_id: ParticipantId,
}

/// Payload of `extend_stroke`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrokeExtension {
    pub participant_id: ParticipantId,
    pub point: Vec3,
    pub slice_index: SliceIndex,
}

/// Commands accepted by the replicated state machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    MoveCamera(CameraMove),
    SelectSlice(SliceSelection),
    ExtendStroke(StrokeExtension),
    EndStroke { participant_id: ParticipantId },
    DeleteStroke { stroke_index: StrokeIndex },
}

impl Command {
    /// Decode and validate a JSON command.
    pub fn decode(json: &str) -> Result<Self, CommandError> {
        let command: Command =
            serde_json::from_str(json).map_err(|e| CommandError::Decode(e.to_string()))?;
        command.validate()?;
        Ok(command)
    }

    pub fn validate(&self) -> Result<(), CommandError> {
        match self {
            Command::MoveCamera(camera) => camera.validate(),
            Command::SelectSlice(selection) => {
                if selection.origin_id.is_empty() {
                    return Err(CommandError::EmptyParticipant("origin_id"));
                }
                Ok(())
            }
            Command::ExtendStroke(extension) => {
                if extension.participant_id.is_empty() {
                    return Err(CommandError::EmptyParticipant("participant_id"));
                }
                if !extension.point.is_finite() {
                    return Err(CommandError::NonFinite("point"));
                }
                Ok(())
            }
            Command::EndStroke { participant_id } => {
                if participant_id.is_empty() {
                    return Err(CommandError::EmptyParticipant("participant_id"));
                }
                Ok(())
            }
            Command::DeleteStroke { .. } => Ok(()),
        }
    }

    /// Short name used in log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            Command::MoveCamera(_) => "move_camera",
            Command::SelectSlice(_) => "select_slice",
            Command::ExtendStroke(_) => "extend_stroke",
            Command::EndStroke { .. } => "end_stroke",
            Command::DeleteStroke { .. } => "delete_stroke",
        }
    }
}

/// Notifications emitted by the replica after applying a command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notification {
    CameraMoved(CameraMove),
    SliceSelected(SliceSelection),
}

impl Notification {
    pub fn origin_id(&self) -> &ParticipantId {
        match self {
            Notification::CameraMoved(camera) => &camera.origin_id,
            Notification::SliceSelected(selection) => &selection.origin_id,
        }
    }
}
