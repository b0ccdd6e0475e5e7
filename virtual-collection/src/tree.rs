use core::cell::{Cell, RefCell};
use core::pin::pin;
use std::collections::{HashMap, HashSet, VecDeque};
use std::rc::Rc;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::{self, Either};

use crate::flat::{keyed_rows, out_of_range_row, split_page};
use crate::handler::{HandlerCore, SharedBuffer, locate, validate_keys};
use crate::key::KeySet;
use crate::{
    AddDetail, ContentError, ContentHandler, ContentOptions, ExpandedKeys, FetchListIterator,
    FetchListParameters, FetchStatus, ItemMetadata, Key, MutationDetail, RemoveDetail,
    RenderBuffer, RenderCallback, RenderOutput, RowSource, ScrollMetrics, TreeDataProvider,
    UpdateDetail, ViewportTracker,
};

/// The fetch state of one parent's children (`None` is the root level).
struct CachedIterator<D> {
    /// `None` while a page is in flight, or once drained.
    iterator: Option<Box<dyn FetchListIterator<D>>>,
    /// Rows fetched but not yet materialized.
    cache: VecDeque<(D, ItemMetadata)>,
    drained: bool,
    epoch: u64,
}

impl<D> CachedIterator<D> {
    fn is_exhausted(&self) -> bool {
        self.drained && self.cache.is_empty()
    }
}

enum Pull<D> {
    Row(D, ItemMetadata),
    Drained,
    /// Nothing available right now: a page is in flight elsewhere, the page budget is used
    /// up, or the source returned an empty page without finishing.
    Paused,
}

/// Limits how many pages each parent may contribute to one operation.
struct PageBudget {
    coalesce: bool,
    fetched: HashSet<Option<Key>>,
}

impl PageBudget {
    fn new(coalesce: bool) -> Self {
        Self {
            coalesce,
            fetched: HashSet::new(),
        }
    }

    fn allows(&self, parent: &Option<Key>) -> bool {
        self.coalesce || !self.fetched.contains(parent)
    }

    fn record(&mut self, parent: &Option<Key>) {
        if !self.coalesce {
            self.fetched.insert(parent.clone());
        }
    }
}

/// Content handler for hierarchical data with lazily fetched, expandable nodes.
///
/// The render buffer is the pre-order flattening of the visible tree: every expanded node
/// is followed by its descendants. Tree-shape metadata (`parent_key`, `tree_depth`,
/// `index_from_parent`, `is_leaf`, `expanded`) is computed here for every row, whatever the
/// provider reported.
pub struct TreeContentHandler<D: 'static, C> {
    core: HandlerCore<D, C>,
    provider: RefCell<Rc<dyn TreeDataProvider<D>>>,
    entries: RefCell<HashMap<Option<Key>, CachedIterator<D>>>,
    next_epoch: Cell<u64>,
}

impl<D: Clone + 'static, C: RenderCallback<D> + 'static> TreeContentHandler<D, C> {
    pub fn new(
        provider: Rc<dyn TreeDataProvider<D>>,
        callback: Rc<C>,
        options: ContentOptions,
    ) -> Self {
        Self {
            core: HandlerCore::new(callback, options),
            provider: RefCell::new(provider),
            entries: RefCell::new(HashMap::new()),
            next_epoch: Cell::new(0),
        }
    }

    pub fn callback(&self) -> &Rc<C> {
        &self.core.callback
    }

    pub fn options(&self) -> &ContentOptions {
        &self.core.options
    }

    /// Swaps the data source. Everything fetched from the old one is dropped.
    pub fn set_data_provider(&self, provider: Rc<dyn TreeDataProvider<D>>) {
        *self.provider.borrow_mut() = provider;
        self.entries.borrow_mut().clear();
        self.core.reset();
    }

    /// Returns `true` once every opened level has been fully materialized.
    pub fn is_exhausted(&self) -> bool {
        self.entries.borrow().values().all(CachedIterator::is_exhausted)
    }

    /// Fetches and splices the children of `key` right after it.
    ///
    /// The consumer adds `key` to the expansion state first. If it is removed again before
    /// the children arrive, they are discarded. A no-op for leaves.
    pub async fn expand(&self, key: &Key) -> crate::Result<()> {
        let has_children = self.provider.borrow().child_data_provider(key).is_some();
        if !has_children {
            return Ok(());
        }
        let Some(buffer) = self.core.callback.data() else {
            return Ok(());
        };
        if buffer.index_of(key).is_none() {
            return Ok(());
        }
        let cb = &self.core.callback;
        let mut expanding = cb.expanding_keys();
        if !expanding.insert(key.clone()) {
            vtrace!(%key, "expand: already expanding");
            return Ok(());
        }
        cb.set_expanding_keys(expanding);
        vdebug!(%key, "expand: start");

        let generation = self.core.generation();
        let parent = Some(key.clone());
        let epoch = {
            let entry = self.open_entry(&parent);
            let epoch = entry.epoch;
            self.entries.borrow_mut().insert(parent.clone(), entry);
            epoch
        };
        let expanded = cb.expanded().with(key.clone());
        let mut budget = PageBudget::new(true);
        let drain = pin!(self.pull_rows(
            vec![parent.clone()],
            usize::MAX,
            &buffer.metadata,
            &expanded,
            generation,
            &mut budget,
        ));

        let result = match self.core.options.delay.clone() {
            Some(delay) => {
                let timer = delay(self.core.options.skeleton_delay);
                match future::select(drain, timer).await {
                    Either::Left((rows, _)) => rows,
                    Either::Right(((), drain)) => {
                        if self.core.is_current(generation) && cb.expanding_keys().contains(key) {
                            vtrace!(%key, "expand: showing skeleton");
                            let mut skeletons = cb.skeleton_keys();
                            skeletons.insert(key.clone());
                            cb.set_skeleton_keys(skeletons);
                        }
                        drain.await
                    }
                }
            }
            None => drain.await,
        };

        if !self.core.is_current(generation) {
            return Ok(());
        }
        let live = self.entries.borrow().get(&parent).map(|e| e.epoch);
        if live != Some(epoch) {
            // With no live entry nothing else owns the pending markers of `key`. Otherwise a
            // restarted expansion owns them and the nested levels.
            if live.is_none() {
                self.clear_pending(key);
            }
            if let (Ok(rows), false) = (&result, cb.expanded().has(key)) {
                self.forget(rows.iter().map(|r| &r.1.key));
            }
            vdebug!(%key, "expand: collapsed or restarted while fetching, rows discarded");
            return Ok(());
        }
        self.clear_pending(key);
        let rows = match result {
            Ok(rows) => rows,
            Err(err) => {
                self.entries.borrow_mut().remove(&parent);
                self.core.report(&err);
                return Err(err);
            }
        };
        if !cb.expanded().has(key) {
            vdebug!(%key, "expand: collapsed while fetching, rows discarded");
            self.forget(rows.iter().map(|r| &r.1.key).chain([key]));
            return Ok(());
        }

        let mut inserted = Vec::new();
        cb.update_data(&mut |latest: SharedBuffer<D>| {
            inserted.clear();
            let buffer = latest?;
            let Some(at) = buffer.index_of(key) else {
                return Some(buffer);
            };
            let mut next = (*buffer).clone();
            next.metadata[at].is_leaf = false;
            next.metadata[at].expanded = true;
            if subtree_end(&next.metadata, at) == at + 1 {
                let existing: KeySet = next.keys().cloned().collect();
                let (data, metadata): (Vec<D>, Vec<ItemMetadata>) = rows
                    .iter()
                    .filter(|(_, m)| !existing.contains(&m.key))
                    .cloned()
                    .unzip();
                inserted.extend(at + 1..at + 1 + metadata.len());
                next.data.splice(at + 1..at + 1, data);
                next.metadata.splice(at + 1..at + 1, metadata);
            }
            renumber(&mut next.metadata);
            Some(Arc::new(next))
        });

        if !inserted.is_empty() {
            self.core.tracker.handle_items_added(&inserted);
        }
        self.core.remove_out_of_range(rows.iter().map(|r| &r.1.key));
        vdebug!(%key, count = inserted.len(), "expand: done");
        Ok(())
    }

    /// Removes the descendants of `key` from the buffer.
    ///
    /// The consumer removes `key` from the expansion state; this also cancels a pending
    /// expansion of it.
    pub fn collapse(&self, key: &Key) {
        self.clear_pending(key);

        let mut removed = Vec::new();
        let mut removed_keys = Vec::new();
        self.core.callback.update_data(&mut |latest: SharedBuffer<D>| {
            removed.clear();
            removed_keys.clear();
            let buffer = latest?;
            match collapse_rows(key, &*buffer) {
                Some((next, indexes)) => {
                    removed_keys.extend(indexes.iter().map(|&i| buffer.metadata[i].key.clone()));
                    removed = indexes;
                    Some(Arc::new(next))
                }
                None => Some(buffer),
            }
        });

        self.drop_levels(removed_keys.iter().chain([key]));
        if !removed.is_empty() {
            self.core.tracker.handle_items_removed(&removed);
        }
        vdebug!(%key, count = removed.len(), "collapse");
    }

    /// Removes rows and their descendants.
    pub fn handle_items_removed(&self, detail: &RemoveDetail) {
        self.core.remove_out_of_range(&detail.keys);
        let root = Rc::clone(&*self.provider.borrow());

        let mut removed = Vec::new();
        let mut removed_keys = Vec::new();
        self.core.callback.update_data(&mut |latest: SharedBuffer<D>| {
            removed.clear();
            removed_keys.clear();
            let buffer = latest?;
            let mut doomed = Vec::new();
            let mut parents = Vec::new();
            for (i, key) in detail.keys.iter().enumerate() {
                let hint = detail.indexes.as_ref().and_then(|ix| ix.get(i).copied());
                if let Some(at) = locate(&buffer.metadata, key, hint) {
                    doomed.extend(at..subtree_end(&buffer.metadata, at));
                    parents.extend(buffer.metadata[at].parent_key.clone());
                }
            }
            if doomed.is_empty() {
                return Some(buffer);
            }
            doomed.sort_unstable();
            doomed.dedup();

            let mut next = (*buffer).clone();
            for &i in doomed.iter().rev() {
                next.data.remove(i);
                removed_keys.push(next.metadata.remove(i).key);
            }
            for parent in &parents {
                if let Some(at) = next.index_of(parent) {
                    let leaf = root.child_data_provider(parent).is_none();
                    next.metadata[at].is_leaf = leaf;
                    next.metadata[at].expanded &= !leaf;
                }
            }
            renumber(&mut next.metadata);
            removed = doomed;
            Some(Arc::new(next))
        });

        self.drop_levels(removed_keys.iter().chain(&detail.keys));
        if !removed.is_empty() {
            vdebug!(count = removed.len(), "rows removed");
            self.core.tracker.handle_items_removed(&removed);
        }
    }

    /// Inserts rows under their parents.
    ///
    /// A leaf parent that gains a child becomes expandable and is added to the expansion
    /// state. Rows under collapsed or unloaded parents are skipped: they arrive with the
    /// parent's next expansion. Rows past the loaded part of a level go out of range.
    pub fn handle_items_added(&self, detail: AddDetail<D>) {
        let rows = keyed_rows(detail.keys, detail.data, detail.metadata);
        if let Err(err) = validate_keys(rows.iter().map(|r| &r.1)) {
            self.core.report(&err);
            return;
        }
        let indexes = detail.indexes;
        let add_before_keys = detail.add_before_keys;
        let parent_keys = detail.parent_keys;

        let root = Rc::clone(&*self.provider.borrow());
        let mut expanded = self.core.callback.expanded();
        let complete_levels: HashSet<Option<Key>> = {
            let entries = self.entries.borrow();
            rows.iter()
                .enumerate()
                .filter_map(|(i, _)| parent_keys.as_ref().and_then(|p| p.get(i).cloned().flatten()))
                .map(Some)
                .filter(|p| entries.get(p).is_none_or(CachedIterator::is_exhausted))
                .collect()
        };

        let mut order: Vec<usize> = (0..rows.len()).collect();
        if let Some(ix) = &indexes {
            order.sort_by_key(|&i| ix.get(i).copied().unwrap_or(usize::MAX));
        }

        let mut inserted = Vec::new();
        let mut promoted = Vec::new();
        let mut out_of_range = Vec::new();
        self.core.callback.update_data(&mut |latest: SharedBuffer<D>| {
            inserted.clear();
            promoted.clear();
            out_of_range.clear();
            let Some(buffer) = latest else {
                out_of_range.extend(order.iter().map(|&i| out_of_range_row(&rows[i])));
                return None;
            };

            let mut next = (*buffer).clone();
            let mut expanded = expanded.clone();
            for &i in &order {
                let (data, raw) = &rows[i];
                if next.index_of(&raw.key).is_some() {
                    continue;
                }
                let parent = parent_keys.as_ref().and_then(|p| p.get(i).cloned().flatten());

                // Where the parent's children live in the buffer, and whether they are
                // all there.
                let (siblings, level_end, complete) = match &parent {
                    None => (
                        child_positions(&next.metadata, None),
                        next.len(),
                        next.done && !next.max_count_limit,
                    ),
                    Some(p) => {
                        let Some(at) = next.index_of(p) else {
                            continue;
                        };
                        if next.metadata[at].is_leaf {
                            next.metadata[at].is_leaf = false;
                            next.metadata[at].expanded = true;
                            expanded.add(p.clone());
                            promoted.push(p.clone());
                        } else if !expanded.has(p) {
                            continue;
                        }
                        let complete = promoted.contains(p) || complete_levels.contains(&parent);
                        (
                            child_positions(&next.metadata, Some(p)),
                            subtree_end(&next.metadata, at),
                            complete,
                        )
                    }
                };

                let append = complete.then_some(level_end);
                let position = if let Some(ix) = indexes.as_ref().and_then(|v| v.get(i).copied()) {
                    match siblings.get(ix) {
                        Some(&at) => Some(at),
                        None if ix == siblings.len() => append,
                        None => None,
                    }
                } else if let Some(before) = add_before_keys.as_ref().and_then(|b| b.get(i)) {
                    match before {
                        Some(anchor) => next.index_of(anchor),
                        None => append,
                    }
                } else {
                    append
                };

                let Some(at) = position else {
                    out_of_range.push(out_of_range_row(&rows[i]));
                    continue;
                };
                let metadata = update_metadata(
                    raw.clone(),
                    parent.as_ref(),
                    &[],
                    &next.metadata[..at],
                    &expanded,
                    &*root,
                );
                next.data.insert(at, data.clone());
                next.metadata.insert(at, metadata);
                inserted.push(at);
            }
            if inserted.is_empty() && promoted.is_empty() {
                return Some(buffer);
            }
            renumber(&mut next.metadata);
            Some(Arc::new(next))
        });

        if !promoted.is_empty() {
            for key in &promoted {
                expanded.add(key.clone());
            }
            self.core.callback.set_expanded(expanded);
        }
        for &at in &inserted {
            self.core.tracker.handle_items_added(&[at]);
        }
        self.core.push_out_of_range(out_of_range);
    }

    /// Replaces rows in place, recomputing their tree shape.
    ///
    /// A leaf that became a parent is expanded if the expansion state asks for it; a parent
    /// that became a leaf loses its descendants.
    pub async fn handle_items_updated(&self, detail: UpdateDetail<D>) {
        let rows = keyed_rows(detail.keys, detail.data, detail.metadata);
        if let Err(err) = validate_keys(rows.iter().map(|r| &r.1)) {
            self.core.report(&err);
            return;
        }
        let indexes = detail.indexes;
        let root = Rc::clone(&*self.provider.borrow());
        let expanded = self.core.callback.expanded();

        let mut removals: Vec<Vec<usize>> = Vec::new();
        let mut removed_keys = Vec::new();
        let mut updated = Vec::new();
        let mut to_expand = Vec::new();
        let mut missing = Vec::new();
        self.core.callback.update_data(&mut |latest: SharedBuffer<D>| {
            removals.clear();
            removed_keys.clear();
            updated.clear();
            to_expand.clear();
            missing.clear();
            let Some(buffer) = latest else {
                missing.extend(0..rows.len());
                return None;
            };

            let mut next = (*buffer).clone();
            for (i, (data, raw)) in rows.iter().enumerate() {
                let hint = indexes.as_ref().and_then(|ix| ix.get(i).copied());
                let Some(at) = locate(&next.metadata, &raw.key, hint) else {
                    missing.push(i);
                    continue;
                };
                let before = next.metadata[at].clone();
                let mut metadata = update_metadata(
                    raw.clone(),
                    before.parent_key.as_ref(),
                    &[],
                    &next.metadata[..at],
                    &expanded,
                    &*root,
                );
                if before.is_leaf && !metadata.is_leaf {
                    // Expandable now; children arrive through `expand`.
                    metadata.expanded = false;
                    if expanded.has(&metadata.key) {
                        to_expand.push(metadata.key.clone());
                    }
                } else if !before.is_leaf && metadata.is_leaf {
                    let end = subtree_end(&next.metadata, at);
                    if end > at + 1 {
                        next.data.drain(at + 1..end);
                        removed_keys.extend(next.metadata.drain(at + 1..end).map(|m| m.key));
                        removals.push((at + 1..end).collect());
                    }
                } else {
                    metadata.expanded = before.expanded;
                }
                next.data[at] = data.clone();
                next.metadata[at] = metadata;
                updated.push(at);
            }
            if updated.is_empty() {
                return Some(buffer);
            }
            renumber(&mut next.metadata);
            Some(Arc::new(next))
        });

        self.forget(removed_keys.iter());
        for indexes in &removals {
            self.core.tracker.handle_items_removed(indexes);
        }
        if !updated.is_empty() {
            self.core.tracker.handle_items_updated(&updated);
        }
        for &i in &missing {
            let (data, metadata) = &rows[i];
            self.core.update_out_of_range(&metadata.key, data, metadata);
        }
        for key in &to_expand {
            // Errors were already reported.
            let _ = self.expand(key).await;
        }
    }

    fn clear_pending(&self, key: &Key) {
        let cb = &self.core.callback;
        let mut expanding = cb.expanding_keys();
        if expanding.remove(key) {
            cb.set_expanding_keys(expanding);
        }
        let mut skeletons = cb.skeleton_keys();
        if skeletons.remove(key) {
            cb.set_skeleton_keys(skeletons);
        }
    }

    /// Drops the cached iterators of parents whose children are no longer materialized.
    fn forget<'a>(&self, keys: impl IntoIterator<Item = &'a Key>) {
        let mut entries = self.entries.borrow_mut();
        for key in keys {
            entries.remove(&Some(key.clone()));
        }
    }

    /// Forgets the levels of rows that left the buffer and cancels their pending expansions.
    fn drop_levels<'a>(&self, keys: impl IntoIterator<Item = &'a Key>) {
        for key in keys {
            self.clear_pending(key);
            self.forget([key]);
        }
    }

    fn open_entry(&self, parent: &Option<Key>) -> CachedIterator<D> {
        let params = FetchListParameters {
            size: self.core.options.initial_request_size(),
        };
        let root = self.provider.borrow();
        let iterator = match parent {
            None => Some(root.fetch_first(params)),
            Some(key) => root.child_data_provider(key).map(|p| p.fetch_first(params)),
        };
        let epoch = self.next_epoch.get();
        self.next_epoch.set(epoch.wrapping_add(1));
        CachedIterator {
            drained: iterator.is_none(),
            iterator,
            cache: VecDeque::new(),
            epoch,
        }
    }

    /// Takes the next raw row of `parent`'s level, fetching a page when its cache is empty.
    async fn next_row(
        &self,
        parent: &Option<Key>,
        budget: &mut PageBudget,
        generation: u64,
    ) -> crate::Result<Pull<D>> {
        loop {
            let (mut iterator, epoch) = {
                let mut entries = self.entries.borrow_mut();
                let entry = entries
                    .entry(parent.clone())
                    .or_insert_with(|| self.open_entry(parent));
                if let Some((data, metadata)) = entry.cache.pop_front() {
                    return Ok(Pull::Row(data, metadata));
                }
                if entry.drained {
                    return Ok(Pull::Drained);
                }
                if !budget.allows(parent) {
                    return Ok(Pull::Paused);
                }
                let Some(iterator) = entry.iterator.take() else {
                    return Ok(Pull::Paused);
                };
                (iterator, entry.epoch)
            };
            budget.record(parent);

            let page = iterator.next().await;
            if !self.core.is_current(generation) {
                return Ok(Pull::Paused);
            }
            let mut entries = self.entries.borrow_mut();
            let Some(entry) = entries.get_mut(parent).filter(|e| e.epoch == epoch) else {
                // The level was collapsed or re-opened meanwhile.
                return Ok(Pull::Drained);
            };
            let (data, metadata, done) = match page {
                Ok(page) => split_page(page),
                Err(err) => {
                    entry.iterator = Some(iterator);
                    return Err(err.into());
                }
            };
            if let Err(err) = validate_keys(&metadata) {
                entry.iterator = Some(iterator);
                return Err(err);
            }
            let empty = metadata.is_empty();
            entry.cache.extend(data.into_iter().zip(metadata));
            if done {
                entry.drained = true;
            } else {
                entry.iterator = Some(iterator);
                if empty {
                    return Ok(Pull::Paused);
                }
            }
        }
    }

    /// Materializes up to `limit` rows in pre-order, starting at the innermost level of
    /// `chain` and walking up through its ancestors as levels drain.
    ///
    /// Expanded non-leaf rows are descended into immediately. Rows already in `base` are
    /// skipped together with their subtrees.
    ///
    /// `limit` counts nested rows too, so an expanded level may be left partially drained
    /// when the limit is hit. Its entry keeps the remaining rows, and the next
    /// [`RowSource::fetch_more_rows`] resumes it through [`Self::resume_chain`] before moving
    /// on to later siblings.
    async fn pull_rows(
        &self,
        mut chain: Vec<Option<Key>>,
        limit: usize,
        base: &[ItemMetadata],
        expanded: &ExpandedKeys,
        generation: u64,
        budget: &mut PageBudget,
    ) -> crate::Result<Vec<(D, ItemMetadata)>> {
        let root = Rc::clone(&*self.provider.borrow());
        let mut seen: KeySet = base.iter().map(|m| m.key.clone()).collect();
        let mut rows: Vec<(D, ItemMetadata)> = Vec::new();
        while rows.len() < limit {
            let Some(parent) = chain.last().cloned() else {
                break;
            };
            let pulled = match self.next_row(&parent, budget, generation).await {
                Ok(pulled) => pulled,
                Err(err) => {
                    self.restore(rows);
                    return Err(err);
                }
            };
            match pulled {
                Pull::Row(data, raw) => {
                    if !seen.insert(raw.key.clone()) {
                        continue;
                    }
                    let metadata = update_metadata(
                        raw,
                        parent.as_ref(),
                        &rows,
                        base,
                        expanded,
                        &*root,
                    );
                    let descend = metadata.expanded;
                    let key = metadata.key.clone();
                    rows.push((data, metadata));
                    if descend {
                        // Children of a freshly materialized row always start over.
                        let level = Some(key);
                        let entry = self.open_entry(&level);
                        self.entries.borrow_mut().insert(level.clone(), entry);
                        chain.push(level);
                    }
                }
                Pull::Drained => {
                    chain.pop();
                }
                Pull::Paused => break,
            }
        }
        vtrace!(count = rows.len(), "pull_rows");
        Ok(rows)
    }

    /// Puts rows taken by a failed operation back in front of their levels' caches.
    fn restore(&self, rows: Vec<(D, ItemMetadata)>) {
        let mut entries = self.entries.borrow_mut();
        for (data, metadata) in rows.into_iter().rev() {
            if let Some(entry) = entries.get_mut(&metadata.parent_key) {
                entry.cache.push_front((data, metadata));
            }
        }
    }

    /// The levels a "load more" resumes from, outermost first.
    fn resume_chain(metadata: &[ItemMetadata], expanded: &ExpandedKeys) -> Vec<Option<Key>> {
        let Some(last) = metadata.last() else {
            return vec![None];
        };
        let start = if !last.is_leaf && expanded.has(&last.key) {
            Some(last.key.clone())
        } else {
            last.parent_key.clone()
        };
        let mut chain = vec![start.clone()];
        let mut cursor = start;
        while let Some(key) = cursor {
            let parent = metadata
                .iter()
                .rfind(|m| m.key == key)
                .and_then(|m| m.parent_key.clone());
            chain.push(parent.clone());
            cursor = parent;
        }
        chain.reverse();
        chain
    }

    fn coalesce(&self) -> bool {
        self.core.options.initial_request_size().is_some()
            && self.provider.borrow().page_count().is_none()
    }
}

#[async_trait(?Send)]
impl<D: Clone + 'static, C: RenderCallback<D> + 'static> ContentHandler<D>
    for TreeContentHandler<D, C>
{
    type Node = C::Node;

    async fn fetch_rows(&self) -> crate::Result<()> {
        let Some(generation) = self.core.begin_fetch() else {
            vtrace!("fetch_rows: fetch already in flight");
            return Ok(());
        };
        self.entries.borrow_mut().clear();
        let expanded = self.core.callback.expanded();
        let max = self.core.options.max_count;
        let limit = self
            .core
            .options
            .initial_request_size()
            .map_or(max, |size| size.min(max));
        // The first page is bounded by total rows, nested ones included, rather than by
        // draining every expanded level; load-more picks up a level cut short here.
        let mut budget = PageBudget::new(self.coalesce());
        vdebug!(limit, "fetch_rows: start");

        let result = self
            .pull_rows(vec![None], limit, &[], &expanded, generation, &mut budget)
            .await;
        if !self.core.is_current(generation) {
            vdebug!("fetch_rows: handler reset while fetching, result ignored");
            return Ok(());
        }
        let rows = match result {
            Ok(rows) => rows,
            Err(err) => {
                self.core.end_fetch(generation);
                self.core.report(&err);
                return Err(err);
            }
        };

        let done = self.is_exhausted();
        let (data, mut metadata): (Vec<D>, Vec<ItemMetadata>) = rows.into_iter().unzip();
        renumber(&mut metadata);
        let buffer = RenderBuffer {
            max_count_limit: !done && metadata.len() >= max,
            data,
            metadata,
            done,
        };
        let (len, limited) = (buffer.len(), buffer.max_count_limit);
        let keys: Vec<_> = buffer.keys().cloned().collect();
        self.core.callback.set_data(Some(Arc::new(buffer)));
        self.core.tracker.reset_to(len, done, limited);
        self.core.remove_out_of_range(&keys);
        self.core.end_fetch(generation);
        vdebug!(len, done, max_count_limit = limited, "fetch_rows: done");
        Ok(())
    }

    fn render(&self) -> RenderOutput<Self::Node> {
        self.core.render(true)
    }

    async fn handle_mutate(&self, detail: MutationDetail<D>) {
        if let Some(remove) = &detail.remove {
            self.handle_items_removed(remove);
        }
        if let Some(add) = detail.add {
            self.handle_items_added(add);
        }
        if let Some(update) = detail.update {
            self.handle_items_updated(update).await;
        }
    }

    fn handle_refresh(&self) {
        self.entries.borrow_mut().clear();
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
        self.entries.borrow_mut().clear();
        self.core.destroy();
    }
}

#[async_trait(?Send)]
impl<D: Clone + 'static, C: RenderCallback<D> + 'static> RowSource for TreeContentHandler<D, C> {
    /// Tree rows are not addressable by flat offset; revisited windows reuse the buffer.
    type Window = ();

    async fn fetch_more_rows(&self) -> Result<FetchStatus, ContentError> {
        let generation = self.core.generation();
        let Some(buffer) = self.core.callback.data() else {
            return Ok(FetchStatus::default());
        };
        let max = self.core.options.max_count;
        let remaining = max.saturating_sub(buffer.len());
        if buffer.done || remaining == 0 {
            return Ok(FetchStatus {
                done: buffer.done,
                max_count_limit: !buffer.done,
                size: 0,
            });
        }

        let expanded = self.core.callback.expanded();
        let chain = Self::resume_chain(&buffer.metadata, &expanded);
        let limit = self.core.options.fetch_size.min(remaining);
        let mut budget = PageBudget::new(self.coalesce());
        let result = self
            .pull_rows(chain, limit, &buffer.metadata, &expanded, generation, &mut budget)
            .await;
        drop(buffer);
        if !self.core.is_current(generation) {
            return Ok(FetchStatus::default());
        }
        let rows = match result {
            Ok(rows) => rows,
            Err(err) => {
                self.core.callback.on_error(&err);
                return Err(err);
            }
        };

        let exhausted = self.is_exhausted();
        let mut status = FetchStatus::default();
        self.core.callback.update_data(&mut |latest: SharedBuffer<D>| {
            let mut next = latest.as_deref().cloned().unwrap_or_default();
            let mut seen: KeySet = next.keys().cloned().collect();
            let mut appended = 0;
            for (data, metadata) in &rows {
                if seen.insert(metadata.key.clone()) {
                    next.data.push(data.clone());
                    next.metadata.push(metadata.clone());
                    appended += 1;
                }
            }
            renumber(&mut next.metadata);
            next.done = exhausted;
            next.max_count_limit = !exhausted && next.len() >= max;
            status = FetchStatus {
                done: next.done,
                max_count_limit: next.max_count_limit,
                size: appended,
            };
            Some(Arc::new(next))
        });

        self.core.remove_out_of_range(rows.iter().map(|r| &r.1.key));
        vtrace!(
            size = status.size,
            done = status.done,
            max_count_limit = status.max_count_limit,
            "fetch_more_rows"
        );
        Ok(status)
    }

    async fn fetch_window(&self, _start_index: usize, _end_index: usize) -> Result<(), ContentError> {
        Ok(())
    }

    fn apply_window(&self, _window: ()) {}
}

/// Computes the tree-shape metadata of a row about to be materialized under `parent`.
///
/// The parent and the previous sibling are looked up in `partial` (rows materialized by
/// the running operation) first, then in `base`.
fn update_metadata<D: 'static>(
    raw: ItemMetadata,
    parent: Option<&Key>,
    partial: &[(D, ItemMetadata)],
    base: &[ItemMetadata],
    expanded: &ExpandedKeys,
    root: &dyn TreeDataProvider<D>,
) -> ItemMetadata {
    let mut earlier = partial.iter().rev().map(|r| &r.1).chain(base.iter().rev());
    let tree_depth = match parent {
        Some(p) => earlier
            .clone()
            .find(|m| &m.key == p)
            .map_or(0, |m| m.tree_depth + 1),
        None => 0,
    };
    let index_from_parent = earlier
        .find(|m| m.parent_key.as_ref() == parent)
        .map_or(0, |m| m.index_from_parent + 1);
    let is_leaf = root.child_data_provider(&raw.key).is_none();
    ItemMetadata {
        expanded: !is_leaf && expanded.has(&raw.key),
        parent_key: parent.cloned(),
        tree_depth,
        is_leaf,
        index_from_parent,
        key: raw.key,
    }
}

/// Returns the buffer without the descendants of `key`, and the removed positions.
///
/// Descendants are the contiguous rows after `key` that sit deeper than it.
pub fn collapse_rows<D: Clone>(
    key: &Key,
    buffer: &RenderBuffer<D>,
) -> Option<(RenderBuffer<D>, Vec<usize>)> {
    let at = buffer.index_of(key)?;
    let end = subtree_end(&buffer.metadata, at);
    let mut next = buffer.clone();
    next.metadata[at].expanded = false;
    next.data.drain(at + 1..end);
    next.metadata.drain(at + 1..end);
    Some((next, (at + 1..end).collect()))
}

/// One past the last descendant of the row at `at`.
fn subtree_end(metadata: &[ItemMetadata], at: usize) -> usize {
    let depth = metadata[at].tree_depth;
    metadata[at + 1..]
        .iter()
        .position(|m| m.tree_depth <= depth)
        .map_or(metadata.len(), |p| at + 1 + p)
}

/// Buffer positions of the direct children of `parent`.
fn child_positions(metadata: &[ItemMetadata], parent: Option<&Key>) -> Vec<usize> {
    metadata
        .iter()
        .enumerate()
        .filter(|(_, m)| m.parent_key.as_ref() == parent)
        .map(|(i, _)| i)
        .collect()
}

/// Renumbers `index_from_parent` by buffer order.
fn renumber(metadata: &mut [ItemMetadata]) {
    let mut counters: HashMap<Option<Key>, usize> = HashMap::new();
    for m in metadata.iter_mut() {
        let next = counters.entry(m.parent_key.clone()).or_insert(0);
        m.index_from_parent = *next;
        *next += 1;
    }
}
