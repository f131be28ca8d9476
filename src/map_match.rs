//! Optional map-matching collaborator (`spec.md` §6 "Vector map").
//!
//! Generalizes the teacher's `map_match::RoadTree`
//! (`nearest_segments(point, max_distance) -> Vec<&RoadSegment>`) from
//! outdoor roads to a narrower indoor-wall query: the EKF only ever
//! needs the single nearest projection and its distance, not a ranked
//! list, so the trait exposes exactly that.

/// A point projected onto the nearest wall/boundary segment of an
/// indoor vector map.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct WallProjection {
    pub x: f64,
    pub y: f64,
}

/// Read-only indoor map collaborator consulted by the EKF's optional
/// map-matching measurement update.
pub trait VectorMap: Send + Sync {
    fn nearest_wall(&self, position: (f64, f64), radius: f64) -> Option<(WallProjection, f64)>;
}
