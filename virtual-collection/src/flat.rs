use core::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

use async_trait::async_trait;

use crate::handler::{HandlerCore, SharedBuffer, locate, validate_keys};
use crate::key::KeySet;
use crate::{
    AddDetail, ContentError, ContentHandler, ContentOptions, DataProvider, FetchByOffsetParameters,
    FetchByOffsetResults, FetchError, FetchListIterator, FetchListParameters, FetchStatus,
    ItemMetadata, MutationDetail, OutOfRangeRow, Page, RemoveDetail, RenderBuffer, RenderCallback,
    RenderOutput, RowSource, ScrollMetrics, UpdateDetail, ViewportTracker,
};

/// Content handler for a flat, keyed list.
///
/// Owns the fetch iterator and applies mutations; the buffer itself lives in the
/// [`RenderCallback`], which receives a new copy on every change.
pub struct FlatContentHandler<D: 'static, C> {
    core: HandlerCore<D, C>,
    provider: RefCell<Rc<dyn DataProvider<D>>>,
    iterator: RefCell<Option<Box<dyn FetchListIterator<D>>>>,
}

impl<D: Clone + 'static, C: RenderCallback<D> + 'static> FlatContentHandler<D, C> {
    pub fn new(provider: Rc<dyn DataProvider<D>>, callback: Rc<C>, options: ContentOptions) -> Self {
        Self {
            core: HandlerCore::new(callback, options),
            provider: RefCell::new(provider),
            iterator: RefCell::new(None),
        }
    }

    pub fn callback(&self) -> &Rc<C> {
        &self.core.callback
    }

    pub fn options(&self) -> &ContentOptions {
        &self.core.options
    }

    /// Swaps the data source. Everything fetched from the old one is dropped.
    pub fn set_data_provider(&self, provider: Rc<dyn DataProvider<D>>) {
        *self.provider.borrow_mut() = provider;
        self.iterator.borrow_mut().take();
        self.core.reset();
    }

    /// Removes rows by key. Keys not in the buffer only leave the out-of-range list.
    pub fn handle_items_removed(&self, detail: &RemoveDetail) {
        self.core.remove_out_of_range(&detail.keys);

        let mut removed = Vec::new();
        self.core.callback.update_data(&mut |latest: SharedBuffer<D>| {
            removed.clear();
            let buffer = latest?;
            let mut indexes: Vec<usize> = detail
                .keys
                .iter()
                .enumerate()
                .filter_map(|(i, key)| locate(&buffer.metadata, key, hint(&detail.indexes, i)))
                .collect();
            if indexes.is_empty() {
                return Some(buffer);
            }
            indexes.sort_unstable();
            indexes.dedup();

            let mut next = (*buffer).clone();
            for &i in indexes.iter().rev() {
                next.data.remove(i);
                next.metadata.remove(i);
            }
            removed = indexes;
            Some(Arc::new(next))
        });

        if !removed.is_empty() {
            vdebug!(count = removed.len(), "rows removed");
            self.core.tracker.handle_items_removed(&removed);
        }
    }

    /// Inserts rows at explicit indexes, before anchor keys, or at the end.
    ///
    /// Rows whose position lies beyond the fetched window are kept in the out-of-range list.
    pub fn handle_items_added(&self, detail: AddDetail<D>) {
        let rows = keyed_rows(detail.keys, detail.data, detail.metadata);
        if let Err(err) = validate_keys(rows.iter().map(|r| &r.1)) {
            self.core.report(&err);
            return;
        }
        let indexes = detail.indexes;
        let add_before_keys = detail.add_before_keys;

        let mut order: Vec<usize> = (0..rows.len()).collect();
        if let Some(ix) = &indexes {
            order.sort_by_key(|&i| ix.get(i).copied().unwrap_or(usize::MAX));
        }

        let mut inserted = Vec::new();
        let mut out_of_range = Vec::new();
        self.core.callback.update_data(&mut |latest: SharedBuffer<D>| {
            inserted.clear();
            out_of_range.clear();
            let Some(buffer) = latest else {
                out_of_range.extend(order.iter().map(|&i| out_of_range_row(&rows[i])));
                return None;
            };

            let mut next = (*buffer).clone();
            let can_append = next.done && !next.max_count_limit;
            for &i in &order {
                let (data, metadata) = &rows[i];
                if next.index_of(&metadata.key).is_some() {
                    continue;
                }
                let position = if let Some(ix) = hint(&indexes, i) {
                    (ix < next.len() || (ix == next.len() && can_append)).then_some(ix)
                } else if let Some(before) = add_before_keys.as_ref().and_then(|b| b.get(i)) {
                    match before {
                        Some(anchor) => next.index_of(anchor),
                        None => can_append.then_some(next.len()),
                    }
                } else {
                    can_append.then_some(next.len())
                };
                match position {
                    Some(at) => {
                        next.data.insert(at, data.clone());
                        next.metadata.insert(at, metadata.clone());
                        inserted.push(at);
                    }
                    None => out_of_range.push(out_of_range_row(&rows[i])),
                }
            }
            if inserted.is_empty() {
                Some(buffer)
            } else {
                Some(Arc::new(next))
            }
        });

        // Each position is relative to the buffer after the previous insertion.
        for &at in &inserted {
            self.core.tracker.handle_items_added(&[at]);
        }
        self.core.push_out_of_range(out_of_range);
    }

    /// Replaces rows in place, or their out-of-range copies.
    pub fn handle_items_updated(&self, detail: UpdateDetail<D>) {
        let rows = keyed_rows(detail.keys, detail.data, detail.metadata);
        if let Err(err) = validate_keys(rows.iter().map(|r| &r.1)) {
            self.core.report(&err);
            return;
        }
        let indexes = detail.indexes;

        let mut updated = Vec::new();
        let mut missing = Vec::new();
        self.core.callback.update_data(&mut |latest: SharedBuffer<D>| {
            updated.clear();
            missing.clear();
            let Some(buffer) = latest else {
                missing.extend(0..rows.len());
                return None;
            };
            let mut next = (*buffer).clone();
            for (i, (data, metadata)) in rows.iter().enumerate() {
                match locate(&next.metadata, &metadata.key, hint(&indexes, i)) {
                    Some(at) => {
                        next.data[at] = data.clone();
                        next.metadata[at] = metadata.clone();
                        updated.push(at);
                    }
                    None => missing.push(i),
                }
            }
            if updated.is_empty() {
                Some(buffer)
            } else {
                Some(Arc::new(next))
            }
        });

        for &i in &missing {
            let (data, metadata) = &rows[i];
            self.core.update_out_of_range(&metadata.key, data, metadata);
        }
        if !updated.is_empty() {
            self.core.tracker.handle_items_updated(&updated);
        }
    }

    fn retain_iterator(&self, iterator: Box<dyn FetchListIterator<D>>) {
        *self.iterator.borrow_mut() = Some(iterator);
    }
}

#[async_trait(?Send)]
impl<D: Clone + 'static, C: RenderCallback<D> + 'static> ContentHandler<D>
    for FlatContentHandler<D, C>
{
    type Node = C::Node;

    async fn fetch_rows(&self) -> crate::Result<()> {
        let Some(generation) = self.core.begin_fetch() else {
            vtrace!("fetch_rows: fetch already in flight");
            return Ok(());
        };
        let provider = Rc::clone(&*self.provider.borrow());
        let requested = self.core.options.initial_request_size();
        // Providers with a page count paginate themselves.
        let coalesce = requested.is_some() && provider.page_count().is_none();
        vdebug!(?requested, coalesce, "fetch_rows: start");

        let mut iterator = provider.fetch_first(FetchListParameters { size: requested });
        let mut data = Vec::new();
        let mut metadata = Vec::new();
        let done = loop {
            let page = iterator.next().await;
            if !self.core.is_current(generation) {
                vdebug!("fetch_rows: handler reset while fetching, result ignored");
                return Ok(());
            }
            let page = match page {
                Ok(page) => page,
                Err(err) => {
                    self.core.end_fetch(generation);
                    let err = ContentError::from(err);
                    self.core.report(&err);
                    return Err(err);
                }
            };
            let (page_data, page_metadata, page_done) = split_page(page);
            data.extend(page_data);
            metadata.extend(page_metadata);
            if page_done || !coalesce || requested.is_some_and(|r| metadata.len() >= r) {
                break page_done;
            }
        };

        if let Err(err) = validate_keys(&metadata) {
            self.core.end_fetch(generation);
            self.core.report(&err);
            return Err(err);
        }

        let max = self.core.options.max_count;
        let mut buffer = RenderBuffer {
            data,
            metadata,
            done,
            max_count_limit: false,
        };
        if buffer.len() > max {
            buffer.data.truncate(max);
            buffer.metadata.truncate(max);
            buffer.done = false;
            buffer.max_count_limit = true;
        } else if !buffer.done && buffer.len() >= max {
            buffer.max_count_limit = true;
        }
        if !buffer.done && !buffer.max_count_limit {
            self.retain_iterator(iterator);
        }

        let (len, done, limited) = (buffer.len(), buffer.done, buffer.max_count_limit);
        let keys: Vec<_> = buffer.keys().cloned().collect();
        self.core.callback.set_data(Some(Arc::new(buffer)));
        self.core.tracker.reset_to(len, done, limited);
        self.core.remove_out_of_range(&keys);
        self.core.end_fetch(generation);
        vdebug!(len, done, max_count_limit = limited, "fetch_rows: done");
        Ok(())
    }

    fn render(&self) -> RenderOutput<Self::Node> {
        self.core.render(false)
    }

    async fn handle_mutate(&self, detail: MutationDetail<D>) {
        if let Some(remove) = &detail.remove {
            self.handle_items_removed(remove);
        }
        if let Some(add) = detail.add {
            self.handle_items_added(add);
        }
        if let Some(update) = detail.update {
            self.handle_items_updated(update);
        }
    }

    fn handle_refresh(&self) {
        self.iterator.borrow_mut().take();
        self.core.reset();
    }

    async fn handle_scroll(&self, metrics: ScrollMetrics) {
        if self.core.is_fetching() || self.core.callback.data().is_none() {
            self.core.tracker.note_metrics(metrics);
            return;
        }
        self.core.tracker.handle_scroll(metrics, self).await;
    }

    async fn check_viewport(&self, metrics: ScrollMetrics) -> bool {
        if self.core.callback.data().is_none() {
            self.core.tracker.note_metrics(metrics);
            // Errors were already reported.
            let _ = self.fetch_rows().await;
            return false;
        }
        self.core.tracker.ensure_viewport(metrics, self).await
    }

    fn set_viewport_range(&self, start: u64, end: u64) {
        self.core.tracker.set_viewport_range(start, end);
    }

    fn tracker(&self) -> &ViewportTracker {
        &self.core.tracker
    }

    fn is_fetching(&self) -> bool {
        self.core.is_fetching() || self.core.tracker.is_fetching()
    }

    fn destroy(&self) {
        self.iterator.borrow_mut().take();
        self.core.destroy();
    }
}

#[async_trait(?Send)]
impl<D: Clone + 'static, C: RenderCallback<D> + 'static> RowSource for FlatContentHandler<D, C> {
    type Window = Option<FetchByOffsetResults<D>>;

    async fn fetch_more_rows(&self) -> Result<FetchStatus, ContentError> {
        let generation = self.core.generation();
        let Some(buffer) = self.core.callback.data() else {
            return Ok(FetchStatus::default());
        };
        let max = self.core.options.max_count;
        let taken = if buffer.len() < max {
            self.iterator.borrow_mut().take()
        } else {
            None
        };
        let Some(mut iterator) = taken else {
            // The iterator is only dropped once done or capped.
            return Ok(FetchStatus {
                done: buffer.done,
                max_count_limit: !buffer.done,
                size: 0,
            });
        };
        drop(buffer);

        let page = iterator.next().await;
        if !self.core.is_current(generation) {
            return Ok(FetchStatus::default());
        }
        let (data, metadata, done) = match page {
            Ok(page) => split_page(page),
            Err(err) => {
                self.retain_iterator(iterator);
                let err = ContentError::from(err);
                self.core.callback.on_error(&err);
                return Err(err);
            }
        };
        if let Err(err) = validate_keys(&metadata) {
            self.retain_iterator(iterator);
            self.core.callback.on_error(&err);
            return Err(err);
        }

        let mut status = FetchStatus::default();
        self.core.callback.update_data(&mut |latest: SharedBuffer<D>| {
            let mut next = latest.as_deref().cloned().unwrap_or_default();
            let take = metadata.len().min(max.saturating_sub(next.len()));
            let mut seen: KeySet = next.keys().cloned().collect();
            let mut appended = 0;
            for (d, m) in data.iter().zip(&metadata).take(take) {
                if seen.insert(m.key.clone()) {
                    next.data.push(d.clone());
                    next.metadata.push(m.clone());
                    appended += 1;
                }
            }
            let capped = take < metadata.len() || (!done && next.len() >= max);
            next.done = done && !capped;
            next.max_count_limit = capped;
            status = FetchStatus {
                done: next.done,
                max_count_limit: capped,
                size: appended,
            };
            Some(Arc::new(next))
        });

        if !status.done && !status.max_count_limit {
            self.retain_iterator(iterator);
        }
        self.core.remove_out_of_range(metadata.iter().map(|m| &m.key));
        vtrace!(
            size = status.size,
            done = status.done,
            max_count_limit = status.max_count_limit,
            "fetch_more_rows"
        );
        Ok(status)
    }

    async fn fetch_window(
        &self,
        start_index: usize,
        end_index: usize,
    ) -> Result<Self::Window, ContentError> {
        let provider = Rc::clone(&*self.provider.borrow());
        let params = FetchByOffsetParameters {
            offset: start_index,
            size: end_index.saturating_sub(start_index),
        };
        match provider.fetch_by_offset(params).await {
            Ok(results) => Ok(Some(results)),
            // Without offset access the buffered rows are reused as they are.
            Err(FetchError::Unsupported(_)) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn apply_window(&self, window: Self::Window) {
        let Some(results) = window else {
            return;
        };
        if let Err(err) = validate_keys(&results.metadata) {
            self.core.report(&err);
            return;
        }
        let mut replaced = Vec::new();
        self.core.callback.update_data(&mut |latest: SharedBuffer<D>| {
            replaced.clear();
            let buffer = latest?;
            let mut next = (*buffer).clone();
            for (i, (data, metadata)) in results.data.iter().zip(&results.metadata).enumerate() {
                if let Some(at) = locate(&next.metadata, &metadata.key, Some(results.offset + i)) {
                    next.data[at] = data.clone();
                    next.metadata[at] = metadata.clone();
                    replaced.push(at);
                }
            }
            if replaced.is_empty() {
                Some(buffer)
            } else {
                Some(Arc::new(next))
            }
        });
        vtrace!(count = replaced.len(), "apply_window");
    }
}

fn hint(indexes: &Option<Vec<usize>>, i: usize) -> Option<usize> {
    indexes.as_ref().and_then(|ix| ix.get(i).copied())
}

/// Drops rows missing data or metadata.
pub(crate) fn split_page<D>(page: Page<D>) -> (Vec<D>, Vec<ItemMetadata>, bool) {
    let len = page.len();
    let Page {
        mut data,
        mut metadata,
        done,
    } = page;
    data.truncate(len);
    metadata.truncate(len);
    (data, metadata, done)
}

/// Pairs mutation rows with metadata, synthesizing metadata that is missing or whose key
/// disagrees with the row key.
pub(crate) fn keyed_rows<D>(
    keys: Vec<crate::Key>,
    data: Vec<D>,
    metadata: Vec<ItemMetadata>,
) -> Vec<(D, ItemMetadata)> {
    let mut metadata = metadata.into_iter();
    keys.into_iter()
        .zip(data)
        .map(|(key, data)| {
            let meta = match metadata.next() {
                Some(m) if m.key == key => m,
                _ => ItemMetadata::new(key),
            };
            (data, meta)
        })
        .collect()
}

pub(crate) fn out_of_range_row<D: Clone>(row: &(D, ItemMetadata)) -> OutOfRangeRow<D> {
    OutOfRangeRow {
        data: row.0.clone(),
        metadata: row.1.clone(),
    }
}
