//! One participant's session: replica, stroke tracker, view, and channel.
//!
//! The host calls `step` once per frame. Delivered commands are applied to
//! the replica in channel order, notifications are handed to the view, and
//! finally the stroke tracker catches the renderer up with the strokes.

use std::time::Instant;

use kurbo::Point;

use crate::camera::{CameraPose, VolumeExtent};
use crate::channel::{ChannelEvent, OrderingChannel};
use crate::config::SyncConfig;
use crate::events::{ParticipantId, SliceIndex};
use crate::render::SceneRenderer;
use crate::replica::SessionState;
use crate::strokes::{SliceStep, StrokeTracker};
use crate::view::{SessionView, ViewContext};

/// What one `step` did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StepReport {
    /// Commands applied to the replica.
    pub applied: usize,
    /// Delivered commands the replica rejected or that were already seen.
    pub skipped: usize,
    /// Whether any stroke path changed.
    pub strokes_changed: bool,
}

pub struct Session<C: OrderingChannel> {
    state: SessionState,
    tracker: StrokeTracker,
    view: SessionView,
    channel: C,
    /// Sequence number of the last command applied.
    last_seq: u64,
}

impl<C: OrderingChannel> Session<C> {
    pub fn new(channel: C, local_id: ParticipantId, config: SyncConfig, extent: VolumeExtent) -> Self {
        Self {
            state: SessionState::new(),
            tracker: StrokeTracker::new(),
            view: SessionView::new(local_id, config, extent),
            channel,
            last_seq: 0,
        }
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn tracker(&self) -> &StrokeTracker {
        &self.tracker
    }

    pub fn view(&self) -> &SessionView {
        &self.view
    }

    pub fn channel(&self) -> &C {
        &self.channel
    }

    pub fn channel_mut(&mut self) -> &mut C {
        &mut self.channel
    }

    pub fn local_id(&self) -> &ParticipantId {
        self.view.local_id()
    }

    fn split<'a>(&'a mut self, renderer: &'a mut dyn SceneRenderer) -> (&'a mut SessionView, ViewContext<'a>) {
        let ctx = ViewContext {
            state: &self.state,
            tracker: &mut self.tracker,
            renderer,
            outbox: &mut self.channel,
        };
        (&mut self.view, ctx)
    }

    /// Show whatever the replica currently holds.
    pub fn attach(&mut self, renderer: &mut dyn SceneRenderer) {
        let (view, mut ctx) = self.split(renderer);
        view.attach(&mut ctx);
        self.tracker.refresh(self.state.strokes(), renderer);
    }

    /// Close the local stroke and tear down every path.
    pub fn detach(&mut self, now: Instant, renderer: &mut dyn SceneRenderer) {
        let (view, mut ctx) = self.split(renderer);
        view.detach(now, &mut ctx);
        self.tracker.clear(renderer);
        log::info!("Participant {} detached", self.view.local_id());
    }

    /// Process channel events, release throttled input, and refresh strokes.
    pub fn step(&mut self, now: Instant, renderer: &mut dyn SceneRenderer) -> StepReport {
        let mut report = StepReport::default();

        for event in self.channel.poll_events() {
            match event {
                ChannelEvent::Synced { seq, snapshot } => {
                    if let Some(snapshot) = snapshot {
                        log::info!("Replacing replica with snapshot at seq {}", seq);
                        self.state = snapshot;
                        self.tracker.clear(renderer);
                    }
                    self.last_seq = seq;
                    let (view, mut ctx) = self.split(renderer);
                    view.connection_changed(true, &mut ctx);
                }
                ChannelEvent::Delivered { seq, command } => {
                    if seq <= self.last_seq {
                        log::debug!("Skipping already applied seq {}", seq);
                        report.skipped += 1;
                        continue;
                    }
                    self.last_seq = seq;
                    match self.state.apply(&command) {
                        Ok(notification) => {
                            report.applied += 1;
                            if let Some(notification) = notification {
                                let (view, mut ctx) = self.split(renderer);
                                view.handle_notification(&notification, &mut ctx);
                            }
                        }
                        Err(_) => report.skipped += 1,
                    }
                }
                ChannelEvent::Unsynced => {
                    let (view, mut ctx) = self.split(renderer);
                    view.connection_changed(false, &mut ctx);
                }
            }
        }

        let (view, mut ctx) = self.split(renderer);
        view.tick(now, &mut ctx);

        report.strokes_changed = self.tracker.refresh(self.state.strokes(), renderer);
        report
    }

    // --- Input ---

    pub fn camera_avatar_moved(&mut self, pose: CameraPose, now: Instant, renderer: &mut dyn SceneRenderer) {
        let (view, mut ctx) = self.split(renderer);
        view.camera_avatar_moved(pose, now, &mut ctx);
    }

    pub fn slice_control_moved(&mut self, slice: SliceIndex, now: Instant, renderer: &mut dyn SceneRenderer) {
        let (view, mut ctx) = self.split(renderer);
        view.slice_control_moved(slice, now, &mut ctx);
    }

    pub fn step_slice(&mut self, step: SliceStep, now: Instant, renderer: &mut dyn SceneRenderer) {
        let (view, mut ctx) = self.split(renderer);
        view.step_slice(step, now, &mut ctx);
    }

    pub fn pointer_down(&mut self, screen: Point, now: Instant, renderer: &mut dyn SceneRenderer) {
        let (view, mut ctx) = self.split(renderer);
        view.pointer_down(screen, now, &mut ctx);
    }

    pub fn pointer_move(&mut self, screen: Point, now: Instant, renderer: &mut dyn SceneRenderer) {
        let (view, mut ctx) = self.split(renderer);
        view.pointer_move(screen, now, &mut ctx);
    }

    pub fn pointer_up(&mut self, now: Instant, renderer: &mut dyn SceneRenderer) {
        let (view, mut ctx) = self.split(renderer);
        view.pointer_up(now, &mut ctx);
    }

    pub fn toggle_drawing(&mut self, on: bool, now: Instant, renderer: &mut dyn SceneRenderer) {
        let (view, mut ctx) = self.split(renderer);
        view.toggle_drawing(on, now, &mut ctx);
    }

    pub fn set_drawing_mode(&mut self, active: bool, now: Instant, renderer: &mut dyn SceneRenderer) {
        let (view, mut ctx) = self.split(renderer);
        view.set_drawing_mode(active, now, &mut ctx);
    }

    pub fn set_override(&mut self, overridden: bool) {
        self.view.set_override(overridden);
    }

    pub fn delete_highlighted(&mut self, renderer: &mut dyn SceneRenderer) {
        let (view, mut ctx) = self.split(renderer);
        view.delete_highlighted(&mut ctx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{LocalChannel, LocalReflector};
    use crate::events::StrokeIndex;
    use crate::render::{Hit, HitTarget};
    use crate::strokes::StrokePath;

    #[derive(Default)]
    struct NullScene {
        slice: Option<SliceIndex>,
        paths: Vec<StrokeIndex>,
    }

    impl SceneRenderer for NullScene {
        fn apply_camera_pose(&mut self, _pose: &CameraPose) {}
        fn apply_slice_selection(&mut self, slice: SliceIndex) {
            self.slice = Some(slice);
        }
        fn build_or_extend_path(&mut self, index: StrokeIndex, _path: &StrokePath) {
            if !self.paths.contains(&index) {
                self.paths.push(index);
            }
        }
        fn remove_path(&mut self, index: StrokeIndex) {
            self.paths.retain(|&i| i != index);
        }
        fn hit_test(&self, _screen: Point, _target: HitTarget) -> Option<Hit> {
            None
        }
    }

    fn session(reflector: &LocalReflector, id: &str) -> Session<LocalChannel> {
        Session::new(
            reflector.connect(ParticipantId::from(id)),
            ParticipantId::from(id),
            SyncConfig::default(),
            VolumeExtent::new(64, 64, 30),
        )
    }

    #[test]
    fn test_slice_change_reaches_other_participant() {
        let reflector = LocalReflector::new();
        let mut a = session(&reflector, "a");
        let mut b = session(&reflector, "b");
        let (mut scene_a, mut scene_b) = (NullScene::default(), NullScene::default());
        let now = Instant::now();

        a.step(now, &mut scene_a);
        b.step(now, &mut scene_b);
        assert_eq!(scene_b.slice, Some(15));

        a.slice_control_moved(9, now, &mut scene_a);
        reflector.tick();
        let report = b.step(now, &mut scene_b);

        assert_eq!(report.applied, 1);
        assert_eq!(scene_b.slice, Some(9));
        assert_eq!(b.state().active_slice(), Some(9));
    }

    #[test]
    fn test_late_joiner_gets_snapshot() {
        let reflector = LocalReflector::new();
        let mut a = session(&reflector, "a");
        let mut scene_a = NullScene::default();
        let now = Instant::now();
        a.step(now, &mut scene_a);
        a.slice_control_moved(3, now, &mut scene_a);
        reflector.tick();
        a.step(now, &mut scene_a);

        let mut c = session(&reflector, "c");
        let mut scene_c = NullScene::default();
        c.step(now, &mut scene_c);
        assert_eq!(c.state(), a.state());
        assert_eq!(scene_c.slice, Some(3));
    }

    #[test]
    fn test_detach_clears_paths() {
        let reflector = LocalReflector::new();
        let mut a = session(&reflector, "a");
        let mut scene = NullScene::default();
        let now = Instant::now();
        a.step(now, &mut scene);
        a.detach(now, &mut scene);
        assert!(a.tracker().is_empty());
        assert!(scene.paths.is_empty());
    }
}
