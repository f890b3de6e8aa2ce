//! Local prediction and reconciliation for one participant.
//!
//! Input drives a local camera avatar, slice control, and pen. Changes are
//! throttled, applied to the rendered scene right away when instant local
//! update is on, and published as commands. When the replica later emits the
//! matching notification, it is dropped if it is our own echo and was
//! already applied; otherwise the rendered scene is forced to match it.
//!
//! ```text
//! input ──► avatar / slice control / pen
//!              │ (throttle)
//!              ├──► renderer            (speculative)
//!              └──► CommandSink::publish
//!                        │
//!            ordering channel, replica
//!                        │
//! handle_notification ◄──┘ ──► drop own echo, or force renderer
//! ```

use std::time::Instant;

use kurbo::Point;

use crate::camera::{CameraPose, ClipSense, ViewDefaults, VolumeExtent};
use crate::channel::CommandSink;
use crate::config::SyncConfig;
use crate::events::{
    CameraMove, Command, Notification, ParticipantId, SliceIndex, SliceSelection,
    StrokeExtension,
};
use crate::geometry::Vec3;
use crate::render::{HitTarget, SceneRenderer};
use crate::replica::SessionState;
use crate::strokes::{SliceStep, StrokeTracker};
use crate::throttle::Throttle;

/// What a view may touch while handling one input or event.
pub struct ViewContext<'a> {
    /// Replicated state, read-only.
    pub state: &'a SessionState,
    pub tracker: &'a mut StrokeTracker,
    pub renderer: &'a mut dyn SceneRenderer,
    pub outbox: &'a mut dyn CommandSink,
}

/// The participant's own camera and slice, ahead of (or behind) the replica.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LocalPrediction {
    /// Pose the orbit controls manipulate.
    pub avatar: CameraPose,
    /// Pose the renderer currently shows.
    pub camera: CameraPose,
    /// Value of the slice control.
    pub slice_control: SliceIndex,
    /// Slice the renderer currently shows.
    pub slice: SliceIndex,
    /// Clip side derived from the rendered camera.
    pub clip: ClipSense,
}

impl LocalPrediction {
    fn from_defaults(defaults: &ViewDefaults, extent: &VolumeExtent) -> Self {
        Self {
            avatar: defaults.camera,
            camera: defaults.camera,
            slice_control: defaults.slice,
            slice: defaults.slice,
            clip: ClipSense::for_pose(&defaults.camera, extent),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct DrawingMode {
    active: bool,
    /// Camera orbit temporarily restored while drawing.
    overridden: bool,
    /// Finishing a stroke does not leave drawing mode.
    locked: bool,
    last_toggle: Option<Instant>,
    /// A single "off" toggle waits here in case a second toggle follows.
    pending_exit: Option<Instant>,
}

#[derive(Debug, Clone, Copy, Default)]
struct Pen {
    down: bool,
    last_point: Option<Vec3>,
}

/// Prediction and reconciliation state for the local participant.
pub struct SessionView {
    local_id: ParticipantId,
    config: SyncConfig,
    extent: VolumeExtent,
    defaults: ViewDefaults,
    prediction: LocalPrediction,
    camera_throttle: Throttle<CameraPose>,
    slice_throttle: Throttle<SliceIndex>,
    point_throttle: Throttle<(Vec3, SliceIndex)>,
    drawing: DrawingMode,
    pen: Pen,
    pointer_down: bool,
}

impl SessionView {
    pub fn new(local_id: ParticipantId, config: SyncConfig, extent: VolumeExtent) -> Self {
        let defaults = ViewDefaults::for_extent(&extent);
        Self {
            local_id,
            camera_throttle: Throttle::new(config.camera_throttle()),
            slice_throttle: Throttle::new(config.slice_throttle()),
            point_throttle: Throttle::new(config.stroke_throttle()),
            config,
            extent,
            prediction: LocalPrediction::from_defaults(&defaults, &extent),
            defaults,
            drawing: DrawingMode::default(),
            pen: Pen::default(),
            pointer_down: false,
        }
    }

    // --- Accessors ---

    pub fn local_id(&self) -> &ParticipantId {
        &self.local_id
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn prediction(&self) -> &LocalPrediction {
        &self.prediction
    }

    pub fn is_drawing(&self) -> bool {
        self.drawing.active
    }

    /// Drawing mode is on and not overridden: pointer input draws.
    pub fn is_really_drawing(&self) -> bool {
        self.drawing.active && !self.drawing.overridden
    }

    pub fn is_draw_locked(&self) -> bool {
        self.drawing.locked
    }

    pub fn is_pen_down(&self) -> bool {
        self.pen.down
    }

    pub fn is_pointer_down(&self) -> bool {
        self.pointer_down
    }

    // --- Lifecycle ---

    /// Show the replicated camera and slice.
    pub fn attach(&mut self, ctx: &mut ViewContext<'_>) {
        self.resync(ctx);
    }

    /// Drop pending input and close our stroke, if any.
    pub fn detach(&mut self, now: Instant, ctx: &mut ViewContext<'_>) {
        self.camera_throttle.cancel();
        self.slice_throttle.cancel();
        if !self.finish_pen(now, ctx) {
            self.close_orphaned_stroke(ctx);
        }
        ctx.tracker.set_highlighted(None, ctx.renderer);
    }

    /// React to the channel gaining or losing sync.
    pub fn connection_changed(&mut self, synced: bool, ctx: &mut ViewContext<'_>) {
        if synced {
            log::info!("Channel synced, resynchronizing view");
            self.resync(ctx);
            if !self.pen.down {
                self.close_orphaned_stroke(ctx);
            }
        } else {
            log::info!("Channel unsynced, commands suppressed until reconnect");
        }
    }

    /// Release throttled values whose time has come and apply a deferred
    /// exit from drawing mode.
    pub fn tick(&mut self, now: Instant, ctx: &mut ViewContext<'_>) {
        if let Some(deadline) = self.drawing.pending_exit {
            if now >= deadline {
                self.drawing.pending_exit = None;
                self.drawing.last_toggle = None;
                self.set_drawing_mode(false, now, ctx);
            }
        }
        if let Some(pose) = self.camera_throttle.poll(now) {
            self.emit_camera(pose, ctx);
        }
        if let Some(slice) = self.slice_throttle.poll(now) {
            self.emit_slice(slice, ctx);
        }
        if self.pen.down {
            if let Some((point, slice)) = self.point_throttle.poll(now) {
                self.announce_point(point, slice, ctx);
            }
        }
    }

    // --- Camera protocol ---

    /// The orbit controls moved the avatar.
    pub fn camera_avatar_moved(&mut self, pose: CameraPose, now: Instant, ctx: &mut ViewContext<'_>) {
        let pose = pose.clamped(self.config.min_zoom, self.config.max_zoom);
        self.prediction.avatar = pose;
        if let Some(pose) = self.camera_throttle.schedule(pose, now) {
            self.emit_camera(pose, ctx);
        }
    }

    fn emit_camera(&mut self, pose: CameraPose, ctx: &mut ViewContext<'_>) {
        // While drawing, an orbit can only come from an override; it stays local.
        if self.applies_locally(ctx) {
            self.prediction.camera = pose;
            ctx.renderer.apply_camera_pose(&pose);
            self.update_clip(ctx);
        }
        if self.drawing.active {
            return;
        }
        self.publish(Command::MoveCamera(CameraMove::new(pose, self.local_id.clone())), ctx);
    }

    fn sync_camera(&mut self, source: Option<&ParticipantId>, ctx: &mut ViewContext<'_>) {
        let pose = ctx.state.camera_pose().copied().unwrap_or(self.defaults.camera);
        self.force_camera(pose, source, ctx);
    }

    fn force_camera(&mut self, pose: CameraPose, source: Option<&ParticipantId>, ctx: &mut ViewContext<'_>) {
        self.prediction.camera = pose;
        ctx.renderer.apply_camera_pose(&pose);
        self.update_clip(ctx);
        // Our own echo must not yank the avatar the user is still dragging.
        if source != Some(&self.local_id) {
            self.prediction.avatar = pose;
        }
    }

    // --- Slice protocol ---

    /// The slice control changed.
    pub fn slice_control_moved(&mut self, slice: SliceIndex, now: Instant, ctx: &mut ViewContext<'_>) {
        let slice = slice.min(self.extent.max_slice());
        self.prediction.slice_control = slice;
        if let Some(slice) = self.slice_throttle.schedule(slice, now) {
            self.emit_slice(slice, ctx);
        }
    }

    /// Step to the neighbouring slice. Outside drawing mode the step jumps
    /// to the nearest annotated slice in that direction.
    pub fn step_slice(&mut self, step: SliceStep, now: Instant, ctx: &mut ViewContext<'_>) {
        let prefer_annotated = !self.drawing.active;
        let target = ctx.tracker.step_slice(
            self.prediction.slice_control,
            step,
            self.extent.max_slice(),
            prefer_annotated,
        );
        if let Some(slice) = target {
            self.slice_control_moved(slice, now, ctx);
        }
    }

    fn emit_slice(&mut self, slice: SliceIndex, ctx: &mut ViewContext<'_>) {
        if self.applies_locally(ctx) {
            self.prediction.slice = slice;
            ctx.renderer.apply_slice_selection(slice);
            self.update_clip(ctx);
        }
        if self.drawing.active {
            return;
        }
        self.publish(
            Command::SelectSlice(SliceSelection {
                slice_index: slice,
                origin_id: self.local_id.clone(),
            }),
            ctx,
        );
    }

    fn sync_slice(&mut self, ctx: &mut ViewContext<'_>) {
        let slice = ctx.state.active_slice().unwrap_or(self.defaults.slice);
        self.force_slice(slice, ctx);
    }

    fn force_slice(&mut self, slice: SliceIndex, ctx: &mut ViewContext<'_>) {
        self.prediction.slice = slice;
        self.prediction.slice_control = slice;
        ctx.renderer.apply_slice_selection(slice);
        self.update_clip(ctx);
    }

    /// Recompute the clip side after the rendered camera or slice changed.
    fn update_clip(&mut self, ctx: &mut ViewContext<'_>) {
        self.prediction.clip = ClipSense::for_pose(&self.prediction.camera, &self.extent);
        ctx.renderer.apply_clip_plane(self.prediction.clip.clip_plane(self.prediction.slice));
    }

    // --- Reconciliation ---

    /// Handle a notification delivered by the replica.
    pub fn handle_notification(&mut self, notification: &Notification, ctx: &mut ViewContext<'_>) {
        let own = notification.origin_id() == &self.local_id;
        if self.drawing.active || (self.config.instant_local_update && own) {
            log::debug!("Suppressed {:?} echo (own: {})", notification, own);
            return;
        }
        match notification {
            Notification::CameraMoved(camera) => {
                self.force_camera(camera.pose(), Some(&camera.origin_id), ctx);
            }
            Notification::SliceSelected(selection) => {
                self.force_slice(selection.slice_index, ctx);
            }
        }
    }

    /// Discard local drift: reread camera and slice from the replica.
    pub fn resync(&mut self, ctx: &mut ViewContext<'_>) {
        self.sync_camera(None, ctx);
        self.sync_slice(ctx);
    }

    // --- Drawing mode ---

    /// Toggle drawing mode from the UI.
    ///
    /// Two toggles within the double-toggle window turn drawing on and lock
    /// it. A single "off" toggle takes effect only once the window has
    /// passed without a second toggle.
    pub fn toggle_drawing(&mut self, on: bool, now: Instant, ctx: &mut ViewContext<'_>) {
        let window = self.config.draw_toggle_window();
        let double = self
            .drawing
            .last_toggle
            .is_some_and(|last| now.saturating_duration_since(last) < window);

        if double {
            self.drawing.pending_exit = None;
            self.drawing.last_toggle = None;
            self.drawing.locked = true;
            if !self.drawing.active {
                self.set_drawing_mode(true, now, ctx);
            }
            return;
        }

        if on {
            self.drawing.pending_exit = None;
            self.set_drawing_mode(true, now, ctx);
        } else {
            self.drawing.locked = false;
            self.drawing.pending_exit = Some(now + window);
        }
        self.drawing.last_toggle = Some(now);
    }

    /// Enter or leave drawing mode immediately.
    ///
    /// Leaving closes any open stroke before resynchronizing camera and
    /// slice with the replica.
    pub fn set_drawing_mode(&mut self, active: bool, now: Instant, ctx: &mut ViewContext<'_>) {
        self.drawing.active = active;
        if active {
            return;
        }
        self.drawing.locked = false;
        self.finish_pen(now, ctx);
        ctx.tracker.set_highlighted(None, ctx.renderer);
        self.resync(ctx);
    }

    /// Temporarily restore camera orbit while in drawing mode. Refused
    /// while a stroke is being drawn.
    pub fn set_override(&mut self, overridden: bool) {
        if overridden && self.pen.down {
            return;
        }
        self.drawing.overridden = overridden;
    }

    // --- Stroke protocol ---

    pub fn pointer_down(&mut self, screen: Point, now: Instant, ctx: &mut ViewContext<'_>) {
        self.pointer_down = true;
        if !self.is_really_drawing() {
            return;
        }
        self.pen.down = true;
        self.point_throttle.reset();
        if let Some((point, slice)) = self.locate(screen, ctx) {
            if let Some((point, slice)) = self.point_throttle.schedule((point, slice), now) {
                self.announce_point(point, slice, ctx);
            }
        }
    }

    pub fn pointer_move(&mut self, screen: Point, now: Instant, ctx: &mut ViewContext<'_>) {
        if !self.is_really_drawing() {
            return;
        }
        if !self.pen.down {
            let hovered = ctx
                .renderer
                .hit_test(screen, HitTarget::AnnotationStroke)
                .and_then(|hit| hit.stroke);
            ctx.tracker.set_highlighted(hovered, ctx.renderer);
            return;
        }
        if let Some((point, slice)) = self.locate(screen, ctx) {
            if let Some((point, slice)) = self.point_throttle.schedule((point, slice), now) {
                self.announce_point(point, slice, ctx);
            }
        }
    }

    /// Pointer released. Always ends the local stroke: ending a stroke that
    /// is not open is a no-op on every replica.
    pub fn pointer_up(&mut self, now: Instant, ctx: &mut ViewContext<'_>) {
        self.pointer_down = false;
        let was_drawing = self.finish_pen(now, ctx);
        if !was_drawing {
            self.publish(self.end_stroke_command(), ctx);
        }
        if was_drawing && !self.drawing.locked {
            self.set_drawing_mode(false, now, ctx);
        }
    }

    /// Request deletion of the highlighted stroke.
    pub fn delete_highlighted(&mut self, ctx: &mut ViewContext<'_>) {
        if let Some(index) = ctx.tracker.highlighted() {
            self.publish(Command::DeleteStroke { stroke_index: index }, ctx);
        }
    }

    fn locate(&self, screen: Point, ctx: &ViewContext<'_>) -> Option<(Vec3, SliceIndex)> {
        let hit = ctx.renderer.hit_test(screen, HitTarget::SliceSurface)?;
        Some((hit.point, self.prediction.slice_control))
    }

    /// Publish a stroke point unless it repeats the previous one.
    fn announce_point(&mut self, point: Vec3, slice: SliceIndex, ctx: &mut ViewContext<'_>) {
        let moved = self.pen.last_point.is_none_or(|last| last.distance(&point) > 0.0);
        if !moved {
            return;
        }
        self.pen.last_point = Some(point);
        self.publish(
            Command::ExtendStroke(StrokeExtension {
                participant_id: self.local_id.clone(),
                point,
                slice_index: slice,
            }),
            ctx,
        );
    }

    /// Lift the pen: deliver the trailing point, then end the stroke.
    /// Returns false if the pen was not down.
    fn finish_pen(&mut self, now: Instant, ctx: &mut ViewContext<'_>) -> bool {
        if !self.pen.down {
            return false;
        }
        if let Some((point, slice)) = self.point_throttle.flush(now) {
            self.announce_point(point, slice, ctx);
        }
        self.pen = Pen::default();
        self.publish(self.end_stroke_command(), ctx);
        true
    }

    /// End a stroke the replica still holds open for us while our pen is
    /// up, e.g. one whose `end_stroke` was lost while unsynced.
    fn close_orphaned_stroke(&self, ctx: &mut ViewContext<'_>) {
        if let Some(index) = ctx.state.open_stroke(&self.local_id) {
            log::info!("Closing orphaned stroke {}", index);
            self.publish(self.end_stroke_command(), ctx);
        }
    }

    fn end_stroke_command(&self) -> Command {
        Command::EndStroke { participant_id: self.local_id.clone() }
    }

    // --- Publishing ---

    /// Local rendering follows input immediately when instant update is on,
    /// while drawing (override orbit), and while the channel is down.
    fn applies_locally(&self, ctx: &ViewContext<'_>) -> bool {
        self.config.instant_local_update || self.drawing.active || !ctx.outbox.is_synced()
    }

    fn publish(&self, command: Command, ctx: &mut ViewContext<'_>) {
        if !ctx.outbox.is_synced() {
            log::debug!("Unsynced, not publishing {}", command.kind());
            return;
        }
        if let Err(e) = command.validate() {
            log::warn!("Not publishing invalid {}: {}", command.kind(), e);
            return;
        }
        if let Err(e) = ctx.outbox.publish(command) {
            log::warn!("Publish failed: {}", e);
        }
    }
}
