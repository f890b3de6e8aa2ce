//! Property-based invariant tests for the replicated session state.
//!
//! 1. Replicas fed the same command sequence serialize identically
//! 2. A replica restored from a snapshot mid-sequence converges too
//! 3. Participants connected through the reflector converge
//! 4. Repeating `end_stroke` / `delete_stroke` changes nothing
//! 5. Stroke indices only grow and are never reused
//! 6. Rejected commands leave the state untouched

use std::collections::BTreeSet;
use std::time::Instant;

use kurbo::Point;
use proptest::prelude::*;
use volink_core::events::{CameraMove, SliceSelection, StrokeExtension};
use volink_core::{
    CameraPose, Command, CommandSink, Hit, HitTarget, LocalReflector, ParticipantId, Quat, SceneRenderer,
    Session, SessionState, SliceIndex, StrokeIndex, StrokePath, SyncConfig, Vec3, VolumeExtent,
};

// ── Strategies ──────────────────────────────────────────────────────────

const PARTICIPANTS: [&str; 3] = ["a", "b", "c"];

fn participant() -> impl Strategy<Value = ParticipantId> {
    prop::sample::select(PARTICIPANTS.to_vec()).prop_map(ParticipantId::from)
}

fn point() -> impl Strategy<Value = Vec3> {
    (-50i32..50, -50i32..50, 0i32..20)
        .prop_map(|(x, y, z)| Vec3::new(f64::from(x), f64::from(y), f64::from(z)))
}

fn command() -> impl Strategy<Value = Command> {
    prop_oneof![
        1 => (point(), 0.5f64..4.0, participant()).prop_map(|(position, zoom, origin)| {
            Command::MoveCamera(CameraMove::new(CameraPose::new(position, Quat::IDENTITY, zoom), origin))
        }),
        1 => (0u32..20, participant()).prop_map(|(slice_index, origin_id)| {
            Command::SelectSlice(SliceSelection { slice_index, origin_id })
        }),
        4 => (participant(), point(), 0u32..20).prop_map(|(participant_id, point, slice_index)| {
            Command::ExtendStroke(StrokeExtension { participant_id, point, slice_index })
        }),
        2 => participant().prop_map(|participant_id| Command::EndStroke { participant_id }),
        1 => (0u64..12).prop_map(|stroke_index| Command::DeleteStroke { stroke_index }),
    ]
}

/// Commands a replica must reject.
fn invalid_command() -> impl Strategy<Value = Command> {
    prop_oneof![
        point().prop_map(|point| Command::ExtendStroke(StrokeExtension {
            participant_id: ParticipantId::from(""),
            point,
            slice_index: 0,
        })),
        participant().prop_map(|origin| {
            Command::MoveCamera(CameraMove::new(
                CameraPose::new(Vec3::new(f64::NAN, 0.0, 0.0), Quat::IDENTITY, 1.0),
                origin,
            ))
        }),
        (-4.0f64..=0.0, participant()).prop_map(|(zoom, origin)| {
            Command::MoveCamera(CameraMove::new(CameraPose::new(Vec3::ZERO, Quat::IDENTITY, zoom), origin))
        }),
    ]
}

fn apply_all(state: &mut SessionState, commands: &[Command]) {
    for command in commands {
        let _ = state.apply(command);
    }
}

fn serialized(state: &SessionState) -> String {
    state.to_json().unwrap()
}

struct NullScene;

impl SceneRenderer for NullScene {
    fn apply_camera_pose(&mut self, _pose: &CameraPose) {}
    fn apply_slice_selection(&mut self, _slice: SliceIndex) {}
    fn build_or_extend_path(&mut self, _index: StrokeIndex, _path: &StrokePath) {}
    fn remove_path(&mut self, _index: StrokeIndex) {}
    fn hit_test(&self, _screen: Point, _target: HitTarget) -> Option<Hit> {
        None
    }
}

// ═══════════════════════════════════════════════════════════════════════
// 1-3. Convergence
// ═══════════════════════════════════════════════════════════════════════

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    #[test]
    fn same_sequence_same_state(commands in prop::collection::vec(command(), 0..80)) {
        let mut left = SessionState::new();
        let mut right = SessionState::new();
        apply_all(&mut left, &commands);
        apply_all(&mut right, &commands);
        prop_assert_eq!(serialized(&left), serialized(&right));
    }

    #[test]
    fn snapshot_restore_converges(
        commands in prop::collection::vec(command(), 0..80),
        split in 0usize..80,
    ) {
        let split = split.min(commands.len());
        let mut full = SessionState::new();
        apply_all(&mut full, &commands);

        let mut prefix = SessionState::new();
        apply_all(&mut prefix, &commands[..split]);
        let mut restored = SessionState::from_json(&serialized(&prefix)).unwrap();
        apply_all(&mut restored, &commands[split..]);

        prop_assert_eq!(serialized(&full), serialized(&restored));
    }

    #[test]
    fn reflector_participants_converge(
        rounds in prop::collection::vec(prop::collection::vec((0usize..3, command()), 0..6), 1..10),
    ) {
        let reflector = LocalReflector::new();
        let now = Instant::now();
        let mut sessions: Vec<_> = PARTICIPANTS
            .iter()
            .map(|id| {
                let id = ParticipantId::from(*id);
                Session::new(reflector.connect(id.clone()), id, SyncConfig::default(), VolumeExtent::new(32, 32, 20))
            })
            .collect();

        for round in rounds {
            for (publisher, command) in round {
                sessions[publisher].channel_mut().publish(command).unwrap();
            }
            reflector.tick();
            for session in sessions.iter_mut() {
                session.step(now, &mut NullScene);
            }
        }

        let reference = reflector.replica();
        for session in &sessions {
            prop_assert_eq!(serialized(session.state()), serialized(&reference));
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
// 4. Idempotent cleanup
// ═══════════════════════════════════════════════════════════════════════

proptest! {
    #[test]
    fn end_stroke_idempotent(
        commands in prop::collection::vec(command(), 0..60),
        who in participant(),
    ) {
        let mut state = SessionState::new();
        apply_all(&mut state, &commands);
        let end = Command::EndStroke { participant_id: who };

        state.apply(&end).unwrap();
        let once = serialized(&state);
        state.apply(&end).unwrap();
        prop_assert_eq!(once, serialized(&state));
        prop_assert!(state.strokes_in_progress().len() <= PARTICIPANTS.len() - 1);
    }

    #[test]
    fn delete_stroke_idempotent(
        commands in prop::collection::vec(command(), 0..60),
        index in 0u64..12,
    ) {
        let mut state = SessionState::new();
        apply_all(&mut state, &commands);
        let delete = Command::DeleteStroke { stroke_index: index };

        state.apply(&delete).unwrap();
        let once = serialized(&state);
        state.apply(&delete).unwrap();
        prop_assert_eq!(once, serialized(&state));
        prop_assert!(state.stroke(index).is_none());
        prop_assert!(state.strokes_in_progress().values().all(|open| *open != index));
    }
}

// ═══════════════════════════════════════════════════════════════════════
// 5. Index monotonicity
// ═══════════════════════════════════════════════════════════════════════

proptest! {
    #[test]
    fn stroke_indices_never_reused(commands in prop::collection::vec(command(), 0..120)) {
        let mut state = SessionState::new();
        let mut seen: BTreeSet<StrokeIndex> = BTreeSet::new();

        for command in &commands {
            let next_before = state.next_stroke_index();
            let before: BTreeSet<StrokeIndex> = state.strokes().keys().copied().collect();
            state.apply(command).unwrap();

            prop_assert!(state.next_stroke_index() >= next_before);
            for index in state.strokes().keys() {
                if !before.contains(index) {
                    prop_assert_eq!(*index, next_before);
                    prop_assert!(seen.insert(*index), "index {} reused", index);
                }
            }
            prop_assert!(state.strokes().keys().all(|i| *i < state.next_stroke_index()));
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
// 6. Rejection without side effects
// ═══════════════════════════════════════════════════════════════════════

proptest! {
    #[test]
    fn rejected_commands_leave_state_untouched(
        commands in prop::collection::vec(command(), 0..40),
        bad in invalid_command(),
    ) {
        let mut state = SessionState::new();
        apply_all(&mut state, &commands);
        let before = state.clone();

        prop_assert!(state.apply(&bad).is_err());
        prop_assert_eq!(before, state);
    }
}
