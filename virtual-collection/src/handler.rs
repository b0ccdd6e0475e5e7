use core::cell::Cell;
use core::marker::PhantomData;
use std::collections::HashSet;
use std::rc::Rc;
use std::sync::Arc;

use async_trait::async_trait;

use crate::key::KeySet;
use crate::{
    ContentError, ContentOptions, ExpandedKeys, ItemMetadata, Key, MutationDetail,
    OutOfRangeRow, RenderBuffer, ScrollMetrics, ViewportTracker,
};

/// Shared, copy-on-write handle to a render buffer.
pub type SharedBuffer<D> = Option<Arc<RenderBuffer<D>>>;

/// What a renderer gets to see for one row.
#[derive(Debug)]
pub struct ItemContext<'a, D> {
    pub index: usize,
    pub data: &'a D,
    pub metadata: &'a ItemMetadata,
}

/// The output of [`ContentHandler::render`].
#[derive(Debug)]
pub struct RenderOutput<N> {
    pub items: Vec<N>,
    /// No buffer exists yet: `items` holds skeletons and the consumer should call
    /// [`ContentHandler::fetch_rows`].
    pub needs_fetch: bool,
}

/// The owning UI component, as seen by a content handler.
///
/// It owns the render buffer and the UI-facing state; handlers read the latest values and
/// replace them wholesale. Tree-only methods have defaults so flat consumers can ignore them.
pub trait RenderCallback<D> {
    type Node;

    fn data(&self) -> SharedBuffer<D>;

    fn set_data(&self, data: SharedBuffer<D>);

    /// Replaces the buffer with `updater(latest)` in one step.
    fn update_data(&self, updater: &mut dyn FnMut(SharedBuffer<D>) -> SharedBuffer<D>) {
        let next = updater(self.data());
        self.set_data(next);
    }

    fn out_of_range_data(&self) -> Vec<OutOfRangeRow<D>>;

    fn set_out_of_range_data(&self, rows: Vec<OutOfRangeRow<D>>);

    fn expanded(&self) -> ExpandedKeys {
        ExpandedKeys::none()
    }

    fn set_expanded(&self, expanded: ExpandedKeys) {
        let _ = expanded;
    }

    fn expanding_keys(&self) -> HashSet<Key> {
        HashSet::new()
    }

    fn set_expanding_keys(&self, keys: HashSet<Key>) {
        let _ = keys;
    }

    fn skeleton_keys(&self) -> HashSet<Key> {
        HashSet::new()
    }

    fn set_skeleton_keys(&self, keys: HashSet<Key>) {
        let _ = keys;
    }

    fn current_item(&self) -> Option<Key>;

    fn set_current_item(&self, key: Key);

    fn render_item(&self, cx: ItemContext<'_, D>) -> Self::Node;

    /// Renders a tree row that has children.
    fn render_group(&self, cx: ItemContext<'_, D>) -> Self::Node {
        self.render_item(cx)
    }

    fn render_skeletons(&self, count: usize) -> Vec<Self::Node>;

    fn skeleton_height(&self) -> u32;

    fn on_error(&self, error: &ContentError) {
        let _ = error;
    }
}

/// The capability a virtualized collection needs from its content handler.
#[async_trait(?Send)]
pub trait ContentHandler<D: 'static> {
    type Node;

    /// Fetches the first rows and hands the new buffer to the callback.
    async fn fetch_rows(&self) -> crate::Result<()>;

    fn render(&self) -> RenderOutput<Self::Node>;

    /// Applies a provider `mutate` notification (remove, then add, then update).
    async fn handle_mutate(&self, detail: MutationDetail<D>);

    /// Discards everything after a provider `refresh` notification.
    fn handle_refresh(&self);

    async fn handle_scroll(&self, metrics: ScrollMetrics);

    /// Returns `true` if the viewport is satisfied; otherwise starts a fetch.
    async fn check_viewport(&self, metrics: ScrollMetrics) -> bool;

    /// Reports the pixel bounds achieved by the most recent render.
    fn set_viewport_range(&self, start: u64, end: u64);

    fn tracker(&self) -> &ViewportTracker;

    fn is_fetching(&self) -> bool;

    fn destroy(&self);
}

/// State and plumbing shared by the flat and tree handlers.
pub(crate) struct HandlerCore<D, C> {
    pub(crate) options: ContentOptions,
    pub(crate) callback: Rc<C>,
    pub(crate) tracker: ViewportTracker,
    generation: Cell<u64>,
    fetching: Cell<bool>,
    awaiting_first_fetch: Cell<bool>,
    destroyed: Cell<bool>,
    _marker: PhantomData<fn() -> D>,
}

impl<D: Clone + 'static, C: RenderCallback<D>> HandlerCore<D, C> {
    pub(crate) fn new(callback: Rc<C>, options: ContentOptions) -> Self {
        Self {
            tracker: ViewportTracker::new(options.clone()),
            options,
            callback,
            generation: Cell::new(0),
            fetching: Cell::new(false),
            awaiting_first_fetch: Cell::new(true),
            destroyed: Cell::new(false),
            _marker: PhantomData,
        }
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation.get()
    }

    pub(crate) fn is_current(&self, generation: u64) -> bool {
        !self.destroyed.get() && self.generation.get() == generation
    }

    pub(crate) fn is_fetching(&self) -> bool {
        self.fetching.get()
    }

    /// Marks a top-level fetch as started. Returns `None` if this or a scroll-driven fetch is
    /// already running.
    pub(crate) fn begin_fetch(&self) -> Option<u64> {
        if self.destroyed.get() || self.tracker.is_fetching() || self.fetching.replace(true) {
            return None;
        }
        Some(self.generation.get())
    }

    pub(crate) fn end_fetch(&self, generation: u64) {
        if self.generation.get() == generation {
            self.fetching.set(false);
        }
    }

    /// Full reset: buffer, rendered points and transient tree state are dropped, and fetches
    /// still in flight become stale.
    pub(crate) fn reset(&self) {
        self.generation.set(self.generation.get().wrapping_add(1));
        self.fetching.set(false);
        self.tracker.reset();
        self.callback.set_data(None);
        self.callback.set_out_of_range_data(Vec::new());
        self.callback.set_expanding_keys(HashSet::new());
        self.callback.set_skeleton_keys(HashSet::new());
        vdebug!(generation = self.generation.get(), "content handler reset");
    }

    pub(crate) fn destroy(&self) {
        self.destroyed.set(true);
        self.generation.set(self.generation.get().wrapping_add(1));
        self.fetching.set(false);
        self.tracker.reset();
    }

    pub(crate) fn report(&self, error: &ContentError) {
        vwarn!(error = %error, "content handler error");
        self.options.report(error);
        self.callback.on_error(error);
    }

    pub(crate) fn row_count(&self) -> usize {
        self.callback.data().map_or(0, |b| b.len())
    }

    pub(crate) fn push_out_of_range(&self, rows: Vec<OutOfRangeRow<D>>) {
        if rows.is_empty() {
            return;
        }
        vdebug!(count = rows.len(), "rows routed out of range");
        let mut current = self.callback.out_of_range_data();
        current.extend(rows);
        self.callback.set_out_of_range_data(current);
    }

    /// Drops out-of-range rows for `keys`, e.g. once they were fetched into the buffer.
    pub(crate) fn remove_out_of_range<'a>(&self, keys: impl IntoIterator<Item = &'a Key>) {
        let mut current = self.callback.out_of_range_data();
        if current.is_empty() {
            return;
        }
        let keys: KeySet = keys.into_iter().cloned().collect();
        let before = current.len();
        current.retain(|row| !keys.contains(&row.metadata.key));
        if current.len() != before {
            self.callback.set_out_of_range_data(current);
        }
    }

    /// Replaces out-of-range rows for updated keys. Returns `true` if any row matched.
    pub(crate) fn update_out_of_range(&self, key: &Key, data: &D, metadata: &ItemMetadata) -> bool {
        let mut current = self.callback.out_of_range_data();
        let Some(row) = current.iter_mut().find(|r| &r.metadata.key == key) else {
            return false;
        };
        row.data = data.clone();
        row.metadata = metadata.clone();
        self.callback.set_out_of_range_data(current);
        true
    }

    /// Renders the current buffer; `tree` enables group rows and skeleton rows after
    /// expanding nodes.
    pub(crate) fn render(&self, tree: bool) -> RenderOutput<C::Node> {
        let Some(buffer) = self.callback.data() else {
            let count = self.skeleton_count();
            return RenderOutput {
                items: self.callback.render_skeletons(count),
                needs_fetch: !self.fetching.get() && !self.destroyed.get(),
            };
        };

        if let Err(err) = validate_keys(&buffer.metadata) {
            self.report(&err);
            return RenderOutput {
                items: Vec::new(),
                needs_fetch: false,
            };
        }

        if self.awaiting_first_fetch.get() && !buffer.is_empty() {
            self.awaiting_first_fetch.set(false);
            if self.callback.current_item().is_none() {
                self.callback.set_current_item(buffer.metadata[0].key.clone());
            }
        }

        let skeleton_keys = if tree {
            self.callback.skeleton_keys()
        } else {
            HashSet::new()
        };
        let mut items = Vec::with_capacity(buffer.len());
        for (index, (data, metadata)) in buffer.rows().enumerate() {
            let cx = ItemContext {
                index,
                data,
                metadata,
            };
            if tree && !metadata.is_leaf {
                items.push(self.callback.render_group(cx));
            } else {
                items.push(self.callback.render_item(cx));
            }
            if skeleton_keys.contains(&metadata.key) {
                items.extend(self.callback.render_skeletons(1));
            }
        }
        RenderOutput {
            items,
            needs_fetch: false,
        }
    }

    fn skeleton_count(&self) -> usize {
        let height = self.callback.skeleton_height().max(1);
        match self.tracker.last_metrics() {
            Some(m) => (m.client_height.div_ceil(height) as usize).max(1),
            None => self.options.fetch_size.max(1),
        }
    }
}

/// Every key must be a string or a number; otherwise the whole batch is rejected.
pub(crate) fn validate_keys<'a>(
    metadata: impl IntoIterator<Item = &'a ItemMetadata>,
) -> crate::Result<()> {
    for (index, m) in metadata.into_iter().enumerate() {
        if !m.key.is_renderable() {
            return Err(ContentError::InvalidKey {
                index,
                key: m.key.clone(),
            });
        }
    }
    Ok(())
}

/// Resolves the buffer position for a mutated key, trusting the index hint only when it
/// still points at that key.
pub(crate) fn locate(metadata: &[ItemMetadata], key: &Key, hint: Option<usize>) -> Option<usize> {
    hint.filter(|&i| metadata.get(i).is_some_and(|m| &m.key == key))
        .or_else(|| metadata.iter().position(|m| &m.key == key))
}
