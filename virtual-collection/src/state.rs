use crate::RenderedPoint;

/// A lightweight, serializable snapshot of a [`crate::ViewportTracker`].
///
/// With `feature = "serde"`, this type implements `Serialize`/`Deserialize`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TrackerSnapshot {
    pub current: RenderedPoint,
    pub rendered_points: Vec<RenderedPoint>,
    pub row_count: usize,
}
