//! Volink Core Library
//!
//! Replicated session state for shared annotation of a 3-D volume: the
//! deterministic state machine every participant runs, the observer that
//! keeps rendered stroke paths in step with it, and the local prediction
//! layer that hides round-trip latency.

pub mod camera;
pub mod channel;
pub mod config;
pub mod events;
pub mod geometry;
pub mod render;
pub mod replica;
pub mod session;
pub mod strokes;
pub mod sync;
pub mod throttle;
pub mod view;

pub use camera::{CameraPose, ClipSense, ViewDefaults, VolumeExtent};
pub use channel::{ChannelError, ChannelEvent, CommandSink, LocalChannel, LocalReflector, OrderingChannel};
pub use config::{ConfigError, SyncConfig};
pub use events::{Command, CommandError, Notification, ParticipantId, SliceIndex, StrokeIndex};
pub use geometry::{Quat, Vec3};
pub use render::{Hit, HitTarget, SceneRenderer};
pub use replica::{SessionState, Stroke};
pub use session::{Session, StepReport};
pub use strokes::{SliceNeighbours, SliceStep, StrokePath, StrokeTracker};
pub use sync::{ClientMessage, ConnectionState, OrderedCommand, ServerMessage};
#[cfg(not(target_arch = "wasm32"))]
pub use sync::NativeWebSocket;
pub use throttle::Throttle;
pub use view::{LocalPrediction, SessionView, ViewContext};
