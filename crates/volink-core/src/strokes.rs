//! Observer-side view of the replicated strokes.
//!
//! The tracker keeps one `StrokePath` per visible stroke and keeps it in step
//! with the replica: paths grow segment by segment as points arrive, and are
//! torn down when their stroke is deleted. A stroke is not materialized until
//! it has two points, so a single tap never flickers onto the screen.

use std::collections::{BTreeMap, BTreeSet};

use crate::events::{SliceIndex, StrokeIndex};
use crate::geometry::Vec3;
use crate::render::SceneRenderer;
use crate::replica::Stroke;

/// Points a stroke needs before it gets a path.
pub const MIN_VISIBLE_POINTS: usize = 2;

/// A straight piece of a stroke path.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Segment {
    pub start: Vec3,
    pub end: Vec3,
}

impl Segment {
    pub fn length(&self) -> f64 {
        self.start.distance(&self.end)
    }

    /// Distance from a point to the closest point on the segment.
    pub fn distance_to(&self, point: Vec3) -> f64 {
        let line = self.end - self.start;
        let len_sq = line.dot(&line);
        if len_sq < f64::EPSILON {
            return point.distance(&self.start);
        }
        let t = ((point - self.start).dot(&line) / len_sq).clamp(0.0, 1.0);
        point.distance(&(self.start + line * t))
    }
}

/// Geometry of one materialized stroke.
#[derive(Debug, Clone, PartialEq)]
pub struct StrokePath {
    slice_index: SliceIndex,
    points: Vec<Vec3>,
    segments: Vec<Segment>,
    /// Segments already handed to the renderer.
    rendered: usize,
}

impl StrokePath {
    fn new(slice_index: SliceIndex) -> Self {
        Self {
            slice_index,
            points: Vec::new(),
            segments: Vec::new(),
            rendered: 0,
        }
    }

    /// Pick up points the stroke gained since the last sync.
    ///
    /// Strokes are append-only, so only the tail past the known points is
    /// read. Returns true if the path grew.
    fn sync_points(&mut self, points: &[Vec3]) -> bool {
        if points.len() <= self.points.len() {
            return false;
        }
        for &point in &points[self.points.len()..] {
            if let Some(&last) = self.points.last() {
                self.segments.push(Segment { start: last, end: point });
            }
            self.points.push(point);
        }
        true
    }

    pub fn slice_index(&self) -> SliceIndex {
        self.slice_index
    }

    pub fn points(&self) -> &[Vec3] {
        &self.points
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Segments added since the renderer last saw this path.
    pub fn new_segments(&self) -> &[Segment] {
        &self.segments[self.rendered..]
    }

    /// True until the renderer has been given the first segments.
    pub fn is_new(&self) -> bool {
        self.rendered == 0
    }

    pub fn start(&self) -> Option<Vec3> {
        self.points.first().copied()
    }

    pub fn end(&self) -> Option<Vec3> {
        self.points.last().copied()
    }

    /// Total length along the path.
    pub fn length(&self) -> f64 {
        self.segments.iter().map(Segment::length).sum()
    }

    /// Distance from a point to the nearest segment.
    pub fn distance_to(&self, point: Vec3) -> f64 {
        self.segments
            .iter()
            .map(|s| s.distance_to(point))
            .fold(f64::INFINITY, f64::min)
    }
}

/// Direction for slice stepping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SliceStep {
    Previous,
    Next,
}

/// Whether annotations exist on either side of a slice.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SliceNeighbours {
    pub below: bool,
    pub above: bool,
}

/// Keeps renderer paths in step with the replicated strokes.
#[derive(Debug, Default)]
pub struct StrokeTracker {
    paths: BTreeMap<StrokeIndex, StrokePath>,
    highlighted: Option<StrokeIndex>,
}

impl StrokeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bring the paths in line with the replica's strokes.
    ///
    /// Returns true if any path was created, extended, or removed.
    pub fn refresh(
        &mut self,
        strokes: &BTreeMap<StrokeIndex, Stroke>,
        renderer: &mut dyn SceneRenderer,
    ) -> bool {
        let mut changed = false;

        let gone: Vec<StrokeIndex> = self
            .paths
            .keys()
            .filter(|index| !strokes.contains_key(index))
            .copied()
            .collect();
        for index in gone {
            self.paths.remove(&index);
            if self.highlighted == Some(index) {
                self.highlighted = None;
            }
            renderer.remove_path(index);
            log::debug!("Removed path for stroke {}", index);
            changed = true;
        }

        for (&index, stroke) in strokes {
            if stroke.len() < MIN_VISIBLE_POINTS {
                continue;
            }
            let path = self
                .paths
                .entry(index)
                .or_insert_with(|| StrokePath::new(stroke.slice_index));
            if path.sync_points(&stroke.points) {
                renderer.build_or_extend_path(index, path);
                path.rendered = path.segments.len();
                changed = true;
            }
        }

        changed
    }

    /// Tear down every path, e.g. before replacing the replica wholesale.
    pub fn clear(&mut self, renderer: &mut dyn SceneRenderer) {
        for index in std::mem::take(&mut self.paths).into_keys() {
            renderer.remove_path(index);
        }
        self.highlighted = None;
    }

    pub fn path(&self, index: StrokeIndex) -> Option<&StrokePath> {
        self.paths.get(&index)
    }

    pub fn paths(&self) -> impl Iterator<Item = (StrokeIndex, &StrokePath)> {
        self.paths.iter().map(|(&index, path)| (index, path))
    }

    /// Paths drawn on the given slice.
    pub fn visible_paths(&self, slice: SliceIndex) -> impl Iterator<Item = (StrokeIndex, &StrokePath)> {
        self.paths().filter(move |(_, path)| path.slice_index == slice)
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    // --- Highlight ---

    pub fn highlighted(&self) -> Option<StrokeIndex> {
        self.highlighted
    }

    /// Move the highlight. Indices without a path are treated as `None`.
    pub fn set_highlighted(&mut self, index: Option<StrokeIndex>, renderer: &mut dyn SceneRenderer) {
        let index = index.filter(|i| self.paths.contains_key(i));
        if self.highlighted == index {
            return;
        }
        if let Some(old) = self.highlighted {
            renderer.set_path_highlight(old, false);
        }
        if let Some(new) = index {
            renderer.set_path_highlight(new, true);
        }
        self.highlighted = index;
    }

    // --- Slice navigation ---

    /// Slices with at least one visible path.
    pub fn annotated_slices(&self) -> BTreeSet<SliceIndex> {
        self.paths.values().map(|p| p.slice_index).collect()
    }

    pub fn neighbours(&self, current: SliceIndex) -> SliceNeighbours {
        self.paths
            .values()
            .fold(SliceNeighbours::default(), |mut acc, path| {
                acc.below |= path.slice_index < current;
                acc.above |= path.slice_index > current;
                acc
            })
    }

    /// The slice one step from `current`, or with `prefer_annotated`, the
    /// nearest annotated slice in that direction (falling back to one step
    /// when there is none). `None` at either end of `[0, max_slice]`.
    pub fn step_slice(
        &self,
        current: SliceIndex,
        step: SliceStep,
        max_slice: SliceIndex,
        prefer_annotated: bool,
    ) -> Option<SliceIndex> {
        let next = match step {
            SliceStep::Previous => current.checked_sub(1)?,
            SliceStep::Next => current.checked_add(1).filter(|s| *s <= max_slice)?,
        };
        if !prefer_annotated {
            return Some(next);
        }

        let annotated = self.annotated_slices();
        let found = match step {
            SliceStep::Previous => annotated.range(..=next).next_back(),
            SliceStep::Next => annotated.range(next..=max_slice).next(),
        };
        Some(found.copied().unwrap_or(next))
    }
}
