use core::cell::Cell;
use core::marker::PhantomData;
use std::rc::Rc;

use virtual_collection::{
    ContentHandler, DataProviderEvent, ExpandedKeys, Key, RenderCallback, ScrollMetrics,
    TrackerSnapshot, TreeContentHandler,
};

/// A framework-neutral controller that wraps a content handler and provides the usual
/// adapter workflow.
///
/// This type does not hold any UI objects. Adapters drive it by calling:
/// - `render` whenever the component renders
/// - `pump` after rendering, to run the initial fetch a render asked for
/// - `on_rendered` once the rendered rows were measured
/// - `on_scroll` on scroll events, and `on_event` for data provider notifications
///
/// A failed initial fetch is not retried automatically; a `Refresh` event or
/// [`Controller::retry`] re-arms it.
pub struct Controller<D: 'static, H> {
    handler: Rc<H>,
    fetch_requested: Cell<bool>,
    failed: Cell<bool>,
    _marker: PhantomData<fn() -> D>,
}

impl<D: 'static, H: ContentHandler<D>> Controller<D, H> {
    pub fn new(handler: Rc<H>) -> Self {
        Self {
            handler,
            fetch_requested: Cell::new(false),
            failed: Cell::new(false),
            _marker: PhantomData,
        }
    }

    pub fn handler(&self) -> &Rc<H> {
        &self.handler
    }

    pub fn is_fetching(&self) -> bool {
        self.handler.is_fetching()
    }

    /// The last initial fetch failed and no retry was requested since.
    pub fn has_failed(&self) -> bool {
        self.failed.get()
    }

    /// Renders the current rows.
    ///
    /// Without a buffer this returns skeletons and queues the initial fetch for
    /// [`Controller::pump`].
    pub fn render(&self) -> Vec<H::Node> {
        let out = self.handler.render();
        if out.needs_fetch && !self.failed.get() {
            self.fetch_requested.set(true);
        }
        out.items
    }

    /// Runs the fetch queued by the last render.
    ///
    /// Returns `true` if a fetch ran, in which case the adapter should render again.
    pub async fn pump(&self) -> virtual_collection::Result<bool> {
        if !self.fetch_requested.replace(false) {
            return Ok(false);
        }
        match self.handler.fetch_rows().await {
            Ok(()) => Ok(true),
            Err(err) => {
                self.failed.set(true);
                Err(err)
            }
        }
    }

    /// Call this when the UI reports a scroll event.
    pub async fn on_scroll(&self, metrics: ScrollMetrics) {
        self.handler.handle_scroll(metrics).await;
    }

    /// Reports the pixel bounds of the rows just rendered, then checks the viewport.
    ///
    /// Returns `false` if the viewport was not filled and more rows were fetched; render and
    /// report again in that case.
    pub async fn on_rendered(&self, start: u64, end: u64, metrics: ScrollMetrics) -> bool {
        self.handler.set_viewport_range(start, end);
        if self.failed.get() {
            return true;
        }
        self.handler.check_viewport(metrics).await
    }

    pub async fn on_event(&self, event: DataProviderEvent<D>) {
        match event {
            DataProviderEvent::Mutate(detail) => self.handler.handle_mutate(detail).await,
            DataProviderEvent::Refresh => {
                self.failed.set(false);
                self.handler.handle_refresh();
            }
        }
    }

    /// Re-arms the initial fetch after a failure.
    pub fn retry(&self) {
        self.failed.set(false);
    }

    pub fn snapshot(&self) -> TrackerSnapshot {
        self.handler.tracker().snapshot()
    }

    pub fn destroy(&self) {
        self.fetch_requested.set(false);
        self.handler.destroy();
    }
}

impl<D: Clone + 'static, C: RenderCallback<D> + 'static> Controller<D, TreeContentHandler<D, C>> {
    /// Marks `key` expanded and splices its children in.
    pub async fn expand(&self, key: &Key) -> virtual_collection::Result<()> {
        let cb = self.handler.callback();
        cb.set_expanded(cb.expanded().with(key.clone()));
        self.handler.expand(key).await
    }

    /// Marks `key` collapsed and removes its descendants.
    pub fn collapse(&self, key: &Key) {
        let cb = self.handler.callback();
        cb.set_expanded(cb.expanded().without(key));
        self.handler.collapse(key);
    }

    pub async fn toggle(&self, key: &Key) -> virtual_collection::Result<()> {
        if self.handler.callback().expanded().has(key) {
            self.collapse(key);
            Ok(())
        } else {
            self.expand(key).await
        }
    }

    /// Replaces the whole expansion state, expanding and collapsing loaded rows to match.
    pub async fn set_expanded(&self, expanded: ExpandedKeys) -> virtual_collection::Result<()> {
        let cb = self.handler.callback();
        cb.set_expanded(expanded.clone());
        let Some(buffer) = cb.data() else {
            return Ok(());
        };

        let mut to_expand = Vec::new();
        for m in buffer.metadata.iter().filter(|m| !m.is_leaf) {
            match (m.expanded, expanded.has(&m.key)) {
                (true, false) => self.handler.collapse(&m.key),
                (false, true) => to_expand.push(m.key.clone()),
                _ => {}
            }
        }
        drop(buffer);

        // Rows under a parent collapsed above are gone by now; `expand` skips them.
        for key in &to_expand {
            self.handler.expand(key).await?;
        }
        Ok(())
    }
}
