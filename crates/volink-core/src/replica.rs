//! Replicated session state.
//!
//! Every participant holds one `SessionState` and feeds it the same ordered
//! sequence of commands. Each operation is a deterministic function of the
//! current state and the command payload, so replicas that have applied the
//! same sequence are identical. Maps are ordered so the serialized form is
//! identical too.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::camera::CameraPose;
use crate::events::{
    CameraMove, Command, CommandError, Notification, ParticipantId, SliceIndex, SliceSelection,
    StrokeExtension, StrokeIndex,
};
use crate::geometry::Vec3;

/// An annotation stroke: points on the slice where it was started.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stroke {
    pub slice_index: SliceIndex,
    pub points: Vec<Vec3>,
}

impl Stroke {
    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

/// The state shared by all participants of a session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    camera_pose: Option<CameraPose>,
    active_slice: Option<SliceIndex>,
    strokes_in_progress: BTreeMap<ParticipantId, StrokeIndex>,
    strokes: BTreeMap<StrokeIndex, Stroke>,
    next_stroke_index: StrokeIndex,
}

impl SessionState {
    /// Create an empty session.
    pub fn new() -> Self {
        Self::default()
    }

    // --- Read access ---

    /// Last replicated camera pose, `None` until someone moves the camera.
    pub fn camera_pose(&self) -> Option<&CameraPose> {
        self.camera_pose.as_ref()
    }

    /// Last replicated slice, `None` until someone selects one.
    pub fn active_slice(&self) -> Option<SliceIndex> {
        self.active_slice
    }

    pub fn strokes(&self) -> &BTreeMap<StrokeIndex, Stroke> {
        &self.strokes
    }

    pub fn stroke(&self, index: StrokeIndex) -> Option<&Stroke> {
        self.strokes.get(&index)
    }

    pub fn strokes_in_progress(&self) -> &BTreeMap<ParticipantId, StrokeIndex> {
        &self.strokes_in_progress
    }

    /// The stroke a participant is currently drawing, if any.
    pub fn open_stroke(&self, participant: &ParticipantId) -> Option<StrokeIndex> {
        self.strokes_in_progress.get(participant).copied()
    }

    /// Index the next new stroke will receive.
    pub fn next_stroke_index(&self) -> StrokeIndex {
        self.next_stroke_index
    }

    // --- Mutation ---

    /// Validate and apply one delivered command.
    ///
    /// Returns the notification observers should receive, if the command
    /// produces one. A command that fails validation leaves the state
    /// untouched.
    pub fn apply(&mut self, command: &Command) -> Result<Option<Notification>, CommandError> {
        if let Err(e) = command.validate() {
            log::warn!("Rejected {} command: {}", command.kind(), e);
            return Err(e);
        }
        log::debug!("Applying {} command", command.kind());

        let notification = match command {
            Command::MoveCamera(camera) => Some(self.move_camera(camera)),
            Command::SelectSlice(selection) => Some(self.select_slice(selection)),
            Command::ExtendStroke(extension) => {
                self.extend_stroke(extension);
                None
            }
            Command::EndStroke { participant_id } => {
                self.end_stroke(participant_id);
                None
            }
            Command::DeleteStroke { stroke_index } => {
                self.delete_stroke(*stroke_index);
                None
            }
        };
        Ok(notification)
    }

    fn move_camera(&mut self, camera: &CameraMove) -> Notification {
        self.camera_pose = Some(camera.pose());
        Notification::CameraMoved(camera.clone())
    }

    fn select_slice(&mut self, selection: &SliceSelection) -> Notification {
        self.active_slice = Some(selection.slice_index);
        Notification::SliceSelected(selection.clone())
    }

    /// Append to the participant's open stroke, or open a new one.
    ///
    /// A stroke stays bound to the slice it was started on; the slice of
    /// later points is ignored.
    fn extend_stroke(&mut self, extension: &StrokeExtension) {
        let open = self
            .strokes_in_progress
            .get(&extension.participant_id)
            .and_then(|index| self.strokes.get_mut(index));

        if let Some(stroke) = open {
            stroke.points.push(extension.point);
            return;
        }

        let index = self.next_stroke_index;
        self.next_stroke_index += 1;
        self.strokes.insert(
            index,
            Stroke {
                slice_index: extension.slice_index,
                points: vec![extension.point],
            },
        );
        self.strokes_in_progress
            .insert(extension.participant_id.clone(), index);
    }

    fn end_stroke(&mut self, participant: &ParticipantId) {
        self.strokes_in_progress.remove(participant);
    }

    fn delete_stroke(&mut self, index: StrokeIndex) {
        if self.strokes.remove(&index).is_none() {
            log::debug!("Stroke {} already deleted", index);
        }
        self.strokes_in_progress.retain(|_, open| *open != index);
    }

    // --- Snapshots ---

    /// Serialize the full state, used to bring late joiners up to date.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Quat;

    fn extend(participant: &str, point: (f64, f64, f64), slice: SliceIndex) -> Command {
        Command::ExtendStroke(StrokeExtension {
            participant_id: ParticipantId::from(participant),
            point: Vec3::new(point.0, point.1, point.2),
            slice_index: slice,
        })
    }

    fn end(participant: &str) -> Command {
        Command::EndStroke { participant_id: ParticipantId::from(participant) }
    }

    #[test]
    fn test_new_session_is_empty() {
        let state = SessionState::new();
        assert!(state.camera_pose().is_none());
        assert!(state.active_slice().is_none());
        assert!(state.strokes().is_empty());
        assert_eq!(state.next_stroke_index(), 0);
    }

    #[test]
    fn test_move_camera_notifies_with_payload() {
        let mut state = SessionState::new();
        let camera = CameraMove::new(
            CameraPose::new(Vec3::new(1.0, 2.0, 3.0), Quat::IDENTITY, 2.0),
            ParticipantId::from("a"),
        );
        let note = state.apply(&Command::MoveCamera(camera.clone())).unwrap();
        assert_eq!(note, Some(Notification::CameraMoved(camera.clone())));
        assert_eq!(state.camera_pose(), Some(&camera.pose()));
    }

    #[test]
    fn test_select_slice() {
        let mut state = SessionState::new();
        let selection = SliceSelection { slice_index: 12, origin_id: ParticipantId::from("b") };
        let note = state.apply(&Command::SelectSlice(selection.clone())).unwrap();
        assert_eq!(note, Some(Notification::SliceSelected(selection)));
        assert_eq!(state.active_slice(), Some(12));
    }

    #[test]
    fn test_extend_opens_then_appends() {
        let mut state = SessionState::new();
        assert_eq!(state.apply(&extend("a", (0.0, 0.0, 5.0), 5)).unwrap(), None);
        state.apply(&extend("a", (1.0, 0.0, 5.0), 7)).unwrap();

        let stroke = state.stroke(0).unwrap();
        assert_eq!(stroke.slice_index, 5);
        assert_eq!(stroke.len(), 2);
        assert_eq!(state.open_stroke(&ParticipantId::from("a")), Some(0));
    }

    #[test]
    fn test_participants_get_separate_strokes() {
        let mut state = SessionState::new();
        state.apply(&extend("a", (0.0, 0.0, 1.0), 1)).unwrap();
        state.apply(&extend("b", (0.0, 0.0, 2.0), 2)).unwrap();
        state.apply(&extend("a", (1.0, 0.0, 1.0), 1)).unwrap();

        assert_eq!(state.stroke(0).unwrap().len(), 2);
        assert_eq!(state.stroke(1).unwrap().len(), 1);
        assert_eq!(state.stroke(1).unwrap().slice_index, 2);
    }

    #[test]
    fn test_end_stroke_then_extend_starts_new_stroke() {
        let mut state = SessionState::new();
        state.apply(&extend("a", (0.0, 0.0, 1.0), 1)).unwrap();
        state.apply(&end("a")).unwrap();
        state.apply(&extend("a", (5.0, 0.0, 1.0), 1)).unwrap();

        assert_eq!(state.strokes().len(), 2);
        assert_eq!(state.stroke(0).unwrap().len(), 1);
        assert_eq!(state.open_stroke(&ParticipantId::from("a")), Some(1));
    }

    #[test]
    fn test_end_stroke_without_open_stroke_is_noop() {
        let mut state = SessionState::new();
        let before = state.clone();
        state.apply(&end("nobody")).unwrap();
        assert_eq!(state, before);
    }

    #[test]
    fn test_delete_open_stroke_clears_binding() {
        let mut state = SessionState::new();
        state.apply(&extend("a", (0.0, 0.0, 1.0), 1)).unwrap();
        state.apply(&Command::DeleteStroke { stroke_index: 0 }).unwrap();

        assert!(state.strokes().is_empty());
        assert!(state.strokes_in_progress().is_empty());

        // The index is not reused.
        state.apply(&extend("a", (0.0, 0.0, 1.0), 1)).unwrap();
        assert!(state.stroke(0).is_none());
        assert!(state.stroke(1).is_some());
    }

    #[test]
    fn test_delete_missing_stroke_is_noop() {
        let mut state = SessionState::new();
        state.apply(&extend("a", (0.0, 0.0, 1.0), 1)).unwrap();
        let before = state.clone();
        state.apply(&Command::DeleteStroke { stroke_index: 42 }).unwrap();
        assert_eq!(state, before);
    }

    #[test]
    fn test_rejected_command_leaves_state_untouched() {
        let mut state = SessionState::new();
        state.apply(&extend("a", (0.0, 0.0, 1.0), 1)).unwrap();
        let before = state.clone();

        let result = state.apply(&extend("a", (f64::NAN, 0.0, 1.0), 1));
        assert!(matches!(result, Err(CommandError::NonFinite("point"))));
        assert_eq!(state, before);
    }

    #[test]
    fn test_snapshot_roundtrip() {
        let mut state = SessionState::new();
        state.apply(&extend("a", (0.0, 0.0, 1.0), 1)).unwrap();
        state
            .apply(&Command::SelectSlice(SliceSelection {
                slice_index: 3,
                origin_id: ParticipantId::from("a"),
            }))
            .unwrap();

        let json = state.to_json().unwrap();
        let restored = SessionState::from_json(&json).unwrap();
        assert_eq!(restored, state);
        assert_eq!(restored.next_stroke_index(), 1);
    }
}
