use crate::Key;

/// Per-row metadata.
///
/// Flat collections only use `key`. Tree collections additionally carry the shape fields,
/// which the tree handler computes for every row it materializes.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ItemMetadata {
    pub key: Key,
    pub parent_key: Option<Key>,
    /// 0 for root rows.
    pub tree_depth: usize,
    pub is_leaf: bool,
    pub index_from_parent: usize,
    pub expanded: bool,
}

impl ItemMetadata {
    pub fn new(key: impl Into<Key>) -> Self {
        Self {
            key: key.into(),
            parent_key: None,
            tree_depth: 0,
            is_leaf: true,
            index_from_parent: 0,
            expanded: false,
        }
    }
}

/// One page returned by a fetch iterator.
#[derive(Clone, Debug)]
pub struct Page<D> {
    pub data: Vec<D>,
    pub metadata: Vec<ItemMetadata>,
    /// No more rows upstream.
    pub done: bool,
}

impl<D> Page<D> {
    pub fn new(data: Vec<D>, metadata: Vec<ItemMetadata>, done: bool) -> Self {
        Self {
            data,
            metadata,
            done,
        }
    }

    pub fn empty(done: bool) -> Self {
        Self::new(Vec::new(), Vec::new(), done)
    }

    pub fn len(&self) -> usize {
        self.data.len().min(self.metadata.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The ordered rows currently materialized for rendering.
///
/// Handlers never mutate a buffer the consumer holds: every change builds a new buffer and
/// hands it over through [`crate::RenderCallback::update_data`].
#[derive(Clone, Debug, PartialEq)]
pub struct RenderBuffer<D> {
    pub data: Vec<D>,
    pub metadata: Vec<ItemMetadata>,
    /// No more rows upstream.
    pub done: bool,
    /// The configured row cap was hit.
    pub max_count_limit: bool,
}

impl<D> Default for RenderBuffer<D> {
    fn default() -> Self {
        Self {
            data: Vec::new(),
            metadata: Vec::new(),
            done: false,
            max_count_limit: false,
        }
    }
}

impl<D> RenderBuffer<D> {
    pub fn len(&self) -> usize {
        self.metadata.len()
    }

    pub fn is_empty(&self) -> bool {
        self.metadata.is_empty()
    }

    /// `data` and `metadata` describe the same rows.
    pub fn is_consistent(&self) -> bool {
        self.data.len() == self.metadata.len()
    }

    pub fn index_of(&self, key: &Key) -> Option<usize> {
        self.metadata.iter().position(|m| &m.key == key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &Key> + '_ {
        self.metadata.iter().map(|m| &m.key)
    }

    pub fn rows(&self) -> impl Iterator<Item = (&D, &ItemMetadata)> + '_ {
        self.data.iter().zip(self.metadata.iter())
    }
}

/// A row that arrived through a mutation but falls outside the buffered window.
#[derive(Clone, Debug, PartialEq)]
pub struct OutOfRangeRow<D> {
    pub data: D,
    pub metadata: ItemMetadata,
}

/// Result of one incremental fetch, as seen by the [`crate::ViewportTracker`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FetchStatus {
    pub done: bool,
    pub max_count_limit: bool,
    /// Number of rows made available by this fetch.
    pub size: usize,
}

/// A measured mapping from a row-index range to the pixel range it occupied.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RenderedPoint {
    pub start_index: usize,
    pub end_index: usize, // exclusive
    /// Pixel bounds; `None` until the consumer reports a measurement.
    pub start: Option<u64>,
    pub end: Option<u64>,
    pub max_count_limit: bool,
    pub done: bool,
    /// `false` when content before or inside the range changed since it was measured.
    pub valid: bool,
}

impl RenderedPoint {
    pub(crate) fn unmeasured(start_index: usize, end_index: usize) -> Self {
        Self {
            start_index,
            end_index,
            start: None,
            end: None,
            max_count_limit: false,
            done: false,
            valid: true,
        }
    }

    pub fn is_measured(&self) -> bool {
        self.start.is_some() && self.end.is_some()
    }

    /// Returns `true` if the measured pixel bounds contain `[top, bottom]`.
    pub fn covers(&self, top: u64, bottom: u64) -> bool {
        match (self.start, self.end) {
            (Some(start), Some(end)) => self.valid && start <= top && bottom <= end,
            _ => false,
        }
    }

    pub(crate) fn same_rows(&self, other: &RenderedPoint) -> bool {
        self.start_index == other.start_index && self.end_index == other.end_index
    }
}

/// Geometry of the scroller, read by the adapter on every scroll event.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ScrollMetrics {
    pub scroll_top: u64,
    pub scroll_height: u64,
    pub client_height: u32,
}

impl ScrollMetrics {
    pub fn new(scroll_top: u64, scroll_height: u64, client_height: u32) -> Self {
        Self {
            scroll_top,
            scroll_height,
            client_height,
        }
    }

    pub fn viewport_bottom(&self) -> u64 {
        self.scroll_top.saturating_add(self.client_height as u64)
    }

    pub fn max_scroll_top(&self) -> u64 {
        self.scroll_height.saturating_sub(self.client_height as u64)
    }
}
