use core::cell::{Cell, RefCell};
use std::collections::HashSet;

use virtual_collection::{
    ContentError, ExpandedKeys, ItemContext, Key, OutOfRangeRow, RenderCallback, SharedBuffer,
};

/// Turns rows into UI nodes for a [`CollectionStore`].
pub trait RowRenderer<D> {
    type Node;

    fn item(&self, cx: ItemContext<'_, D>) -> Self::Node;

    /// Tree rows with children. Defaults to [`RowRenderer::item`].
    fn group(&self, cx: ItemContext<'_, D>) -> Self::Node {
        self.item(cx)
    }

    fn skeleton(&self) -> Self::Node;

    /// Height of one skeleton row, in the same unit as the scroll metrics.
    fn skeleton_height(&self) -> u32;
}

/// A ready-made [`RenderCallback`] that keeps everything a handler publishes in memory.
///
/// Every change bumps [`CollectionStore::revision`], which a UI can poll (or compare
/// against the last frame) to know when to re-render.
pub struct CollectionStore<D, R> {
    renderer: R,
    data: RefCell<SharedBuffer<D>>,
    out_of_range: RefCell<Vec<OutOfRangeRow<D>>>,
    expanded: RefCell<ExpandedKeys>,
    expanding: RefCell<HashSet<Key>>,
    skeletons: RefCell<HashSet<Key>>,
    current: RefCell<Option<Key>>,
    errors: RefCell<Vec<ContentError>>,
    revision: Cell<u64>,
}

impl<D: Clone, R: RowRenderer<D>> CollectionStore<D, R> {
    pub fn new(renderer: R) -> Self {
        Self {
            renderer,
            data: RefCell::new(None),
            out_of_range: RefCell::new(Vec::new()),
            expanded: RefCell::new(ExpandedKeys::none()),
            expanding: RefCell::new(HashSet::new()),
            skeletons: RefCell::new(HashSet::new()),
            current: RefCell::new(None),
            errors: RefCell::new(Vec::new()),
            revision: Cell::new(0),
        }
    }

    /// Starts with the given expansion state.
    pub fn with_expanded(self, expanded: ExpandedKeys) -> Self {
        *self.expanded.borrow_mut() = expanded;
        self
    }

    pub fn renderer(&self) -> &R {
        &self.renderer
    }

    pub fn revision(&self) -> u64 {
        self.revision.get()
    }

    pub fn row_count(&self) -> usize {
        self.data.borrow().as_ref().map_or(0, |b| b.len())
    }

    /// Errors reported since the last call.
    pub fn take_errors(&self) -> Vec<ContentError> {
        core::mem::take(&mut *self.errors.borrow_mut())
    }

    fn bump(&self) {
        self.revision.set(self.revision.get().wrapping_add(1));
    }
}

impl<D: Clone, R: RowRenderer<D>> RenderCallback<D> for CollectionStore<D, R> {
    type Node = R::Node;

    fn data(&self) -> SharedBuffer<D> {
        self.data.borrow().clone()
    }

    fn set_data(&self, data: SharedBuffer<D>) {
        *self.data.borrow_mut() = data;
        self.bump();
    }

    fn update_data(&self, updater: &mut dyn FnMut(SharedBuffer<D>) -> SharedBuffer<D>) {
        let latest = self.data.borrow().clone();
        let next = updater(latest);
        *self.data.borrow_mut() = next;
        self.bump();
    }

    fn out_of_range_data(&self) -> Vec<OutOfRangeRow<D>> {
        self.out_of_range.borrow().clone()
    }

    fn set_out_of_range_data(&self, rows: Vec<OutOfRangeRow<D>>) {
        *self.out_of_range.borrow_mut() = rows;
    }

    fn expanded(&self) -> ExpandedKeys {
        self.expanded.borrow().clone()
    }

    fn set_expanded(&self, expanded: ExpandedKeys) {
        *self.expanded.borrow_mut() = expanded;
    }

    fn expanding_keys(&self) -> HashSet<Key> {
        self.expanding.borrow().clone()
    }

    fn set_expanding_keys(&self, keys: HashSet<Key>) {
        *self.expanding.borrow_mut() = keys;
        self.bump();
    }

    fn skeleton_keys(&self) -> HashSet<Key> {
        self.skeletons.borrow().clone()
    }

    fn set_skeleton_keys(&self, keys: HashSet<Key>) {
        *self.skeletons.borrow_mut() = keys;
        self.bump();
    }

    fn current_item(&self) -> Option<Key> {
        self.current.borrow().clone()
    }

    fn set_current_item(&self, key: Key) {
        *self.current.borrow_mut() = Some(key);
    }

    fn render_item(&self, cx: ItemContext<'_, D>) -> Self::Node {
        self.renderer.item(cx)
    }

    fn render_group(&self, cx: ItemContext<'_, D>) -> Self::Node {
        self.renderer.group(cx)
    }

    fn render_skeletons(&self, count: usize) -> Vec<Self::Node> {
        (0..count).map(|_| self.renderer.skeleton()).collect()
    }

    fn skeleton_height(&self) -> u32 {
        self.renderer.skeleton_height()
    }

    fn on_error(&self, error: &ContentError) {
        self.errors.borrow_mut().push(error.clone());
    }
}
