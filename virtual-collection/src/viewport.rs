use core::cell::RefCell;

use async_trait::async_trait;

use crate::state::TrackerSnapshot;
use crate::{ContentError, ContentOptions, FetchStatus, FetchStrategy, RenderedPoint, ScrollMetrics};

/// The fetch side of a content handler, as driven by a [`ViewportTracker`].
#[async_trait(?Send)]
pub trait RowSource {
    /// Rows re-fetched for a previously rendered index window.
    type Window;

    /// Pulls exactly one more page into the render buffer.
    async fn fetch_more_rows(&self) -> Result<FetchStatus, ContentError>;

    /// Re-fetches rows `start_index..end_index` without touching the buffer.
    async fn fetch_window(
        &self,
        start_index: usize,
        end_index: usize,
    ) -> Result<Self::Window, ContentError>;

    /// Applies a window fetched by [`RowSource::fetch_window`].
    fn apply_window(&self, window: Self::Window);
}

#[derive(Clone, Debug, Default)]
struct TrackerState {
    current: RenderedPoint,
    points: Vec<RenderedPoint>,
    row_count: usize,
    fetch_trigger: Option<u64>,
    last_max_scroll_top: u64,
    fetching: bool,
    metrics: Option<ScrollMetrics>,
    generation: u64,
}

/// Scroll-position bookkeeping for a content handler.
///
/// The tracker decides when the next page must be fetched and remembers which pixel ranges
/// belong to which already-rendered row ranges. At most one fetch is in flight at a time:
/// scroll events that arrive meanwhile are ignored, and the fetch's completion reconciles
/// state.
///
/// Like the rest of this crate it holds no UI objects: the adapter reports scroll geometry
/// ([`ScrollMetrics`]) and measured pixel bounds ([`ViewportTracker::set_viewport_range`]).
#[derive(Debug)]
pub struct ViewportTracker {
    options: ContentOptions,
    state: RefCell<TrackerState>,
}

impl ViewportTracker {
    pub fn new(options: ContentOptions) -> Self {
        Self {
            options,
            state: RefCell::new(TrackerState::default()),
        }
    }

    pub fn options(&self) -> &ContentOptions {
        &self.options
    }

    /// Forgets everything. Fetches still in flight are ignored when they complete.
    pub fn reset(&self) {
        let mut st = self.state.borrow_mut();
        let generation = st.generation.wrapping_add(1);
        *st = TrackerState {
            generation,
            ..TrackerState::default()
        };
        vdebug!(generation, "ViewportTracker::reset");
    }

    /// Starts over from a freshly fetched buffer of `row_count` rows.
    pub fn reset_to(&self, row_count: usize, done: bool, max_count_limit: bool) {
        self.reset();
        let mut st = self.state.borrow_mut();
        st.row_count = row_count;
        st.current = RenderedPoint {
            done,
            max_count_limit,
            ..RenderedPoint::unmeasured(0, row_count)
        };
    }

    pub fn current_point(&self) -> RenderedPoint {
        self.state.borrow().current
    }

    pub fn rendered_points(&self) -> Vec<RenderedPoint> {
        self.state.borrow().points.clone()
    }

    pub fn row_count(&self) -> usize {
        self.state.borrow().row_count
    }

    pub fn is_fetching(&self) -> bool {
        self.state.borrow().fetching
    }

    /// The scroll geometry reported by the most recent event.
    pub fn last_metrics(&self) -> Option<ScrollMetrics> {
        self.state.borrow().metrics
    }

    /// Remembers the scroll geometry without acting on it.
    pub(crate) fn note_metrics(&self, metrics: ScrollMetrics) {
        self.state.borrow_mut().metrics = Some(metrics);
    }

    pub fn fetch_trigger(&self) -> Option<u64> {
        self.state.borrow().fetch_trigger
    }

    pub fn snapshot(&self) -> TrackerSnapshot {
        let st = self.state.borrow();
        TrackerSnapshot {
            current: st.current,
            rendered_points: st.points.clone(),
            row_count: st.row_count,
        }
    }

    pub fn restore_snapshot(&self, snapshot: TrackerSnapshot) {
        self.reset();
        let mut st = self.state.borrow_mut();
        st.current = snapshot.current;
        st.points = snapshot.rendered_points;
        st.row_count = snapshot.row_count;
    }

    /// Returns `true` when the viewport needs no more data.
    ///
    /// A point that is `done` or capped is always satisfied. An unmeasured (or invalidated)
    /// point is also treated as satisfied: the consumer re-measures after rendering.
    pub fn check_viewport(&self, metrics: ScrollMetrics) -> bool {
        let st = self.state.borrow();
        let cur = &st.current;
        if cur.done || cur.max_count_limit {
            return true;
        }
        if !cur.valid {
            return true;
        }
        match cur.end {
            Some(end) => metrics.viewport_bottom() <= end,
            None => true,
        }
    }

    /// [`Self::check_viewport`], fetching the next page when the viewport is not satisfied.
    pub async fn ensure_viewport<S: RowSource + ?Sized>(
        &self,
        metrics: ScrollMetrics,
        source: &S,
    ) -> bool {
        self.state.borrow_mut().metrics = Some(metrics);
        let satisfied = self.check_viewport(metrics);
        if !satisfied {
            self.fetch_next(metrics, source).await;
        }
        satisfied
    }

    /// Records the pixel bounds the consumer measured for the current row range.
    pub fn set_viewport_range(&self, start: u64, end: u64) {
        let mut st = self.state.borrow_mut();
        st.current.start = Some(start);
        st.current.end = Some(end);
        st.current.valid = true;

        let cur = st.current;
        let mut recorded = false;
        for p in st.points.iter_mut().filter(|p| p.same_rows(&cur)) {
            p.start = cur.start;
            p.end = cur.end;
            p.valid = true;
            p.done = cur.done;
            p.max_count_limit = cur.max_count_limit;
            recorded = true;
        }
        if !recorded {
            st.points.push(cur);
        }
        vtrace!(
            start,
            end,
            start_index = cur.start_index,
            end_index = cur.end_index,
            "set_viewport_range"
        );
    }

    /// Handles one scroll event.
    pub async fn handle_scroll<S: RowSource + ?Sized>(&self, metrics: ScrollMetrics, source: &S) {
        self.state.borrow_mut().metrics = Some(metrics);

        if !self.check_rendered_points(metrics, source).await {
            return;
        }

        let max = metrics.max_scroll_top();
        if max == 0 {
            return;
        }
        let top = metrics.scroll_top;

        let trigger = {
            let mut st = self.state.borrow_mut();
            if st.last_max_scroll_top != max {
                st.fetch_trigger = Some(top.saturating_add(max.saturating_sub(top) / 2));
                st.last_max_scroll_top = max;
            }
            if st.fetching {
                vtrace!(top, "handle_scroll: fetch in flight");
                return;
            }
            st.fetch_trigger
        };

        let at_bottom = max.saturating_sub(top) <= 1;
        let crossed = trigger.is_some_and(|t| top >= t);
        if at_bottom || crossed {
            vtrace!(top, max, at_bottom, "handle_scroll: fetch next");
            self.fetch_next(metrics, source).await;
        }
    }

    /// Fetches one more page unless a fetch is in flight or no more rows may be fetched.
    ///
    /// Returns `true` if a fetch was issued.
    pub async fn fetch_next<S: RowSource + ?Sized>(
        &self,
        metrics: ScrollMetrics,
        source: &S,
    ) -> bool {
        let generation = {
            let mut st = self.state.borrow_mut();
            if st.fetching || st.current.done || st.current.max_count_limit {
                return false;
            }
            if st.row_count >= self.options.max_count {
                st.current.max_count_limit = true;
                return false;
            }
            st.generation
        };

        if self.options.strategy == FetchStrategy::ViewportOnly {
            if let Some(gate) = &self.options.before_fetch_next {
                if !gate(metrics) {
                    vtrace!(scroll_top = metrics.scroll_top, "fetch_next: vetoed");
                    return false;
                }
            }
        }

        self.state.borrow_mut().fetching = true;
        let result = source.fetch_more_rows().await;

        let mut st = self.state.borrow_mut();
        if st.generation != generation {
            vdebug!("fetch_next: tracker reset while fetching, result ignored");
            return true;
        }
        st.fetching = false;
        match result {
            Ok(status) => {
                let budget = self.options.max_count.saturating_sub(st.row_count);
                let size = status.size.min(budget);
                st.row_count += size;
                st.current.end_index = st.row_count;
                st.current.done = status.done;
                st.current.max_count_limit = status.max_count_limit
                    || (!status.done && st.row_count >= self.options.max_count);
                st.fetch_trigger = None;
                vdebug!(
                    size,
                    row_count = st.row_count,
                    done = st.current.done,
                    max_count_limit = st.current.max_count_limit,
                    "fetch_next: done"
                );
            }
            Err(err) => {
                st.fetch_trigger = None;
                st.last_max_scroll_top = 0;
                drop(st);
                vwarn!(error = %err, "fetch_next: failed");
                self.options.report(&err);
            }
        }
        true
    }

    /// Returns `true` when the caller should continue with the normal fetch-trigger flow.
    ///
    /// If the viewport left the current point but lies inside a previously rendered range,
    /// that range is adopted instead and `false` is returned.
    async fn check_rendered_points<S: RowSource + ?Sized>(
        &self,
        metrics: ScrollMetrics,
        source: &S,
    ) -> bool {
        let top = metrics.scroll_top;
        let bottom = metrics.viewport_bottom();
        let candidate = {
            let st = self.state.borrow();
            if !st.current.valid || !st.current.is_measured() || st.current.covers(top, bottom)
            {
                return true;
            }
            find_covering_point(&st.points, &st.current, top, bottom)
        };
        match candidate {
            Some(point) => {
                self.set_range_local(point, source).await;
                false
            }
            None => true,
        }
    }

    async fn set_range_local<S: RowSource + ?Sized>(&self, point: RenderedPoint, source: &S) {
        let generation = {
            let mut st = self.state.borrow_mut();
            if st.fetching {
                return;
            }
            st.fetching = true;
            st.generation
        };
        vdebug!(
            start_index = point.start_index,
            end_index = point.end_index,
            "set_range_local"
        );

        let result = source
            .fetch_window(point.start_index, point.end_index)
            .await;

        let mut st = self.state.borrow_mut();
        if st.generation != generation {
            return;
        }
        st.fetching = false;
        match result {
            Ok(window) => {
                if !is_range_valid(st.metrics, &point) {
                    vtrace!("set_range_local: viewport moved, window discarded");
                    return;
                }
                drop(st);
                source.apply_window(window);
                let mut st = self.state.borrow_mut();
                st.current = RenderedPoint {
                    done: st.current.done,
                    max_count_limit: st.current.max_count_limit,
                    ..point
                };
            }
            Err(err) => {
                drop(st);
                vwarn!(error = %err, "set_range_local: failed");
                self.options.report(&err);
            }
        }
    }

    /// Shifts rendered points for rows inserted at `indexes` (post-insertion positions).
    pub fn handle_items_added(&self, indexes: &[usize]) {
        let mut sorted = indexes.to_vec();
        sorted.sort_unstable();
        sorted.dedup();
        let mut st = self.state.borrow_mut();
        for &i in &sorted {
            shift_for_added(&mut st.current, i, true);
            for p in st.points.iter_mut() {
                shift_for_added(p, i, false);
            }
        }
        st.row_count += sorted.len();
    }

    /// Shifts rendered points for rows removed from `indexes` (pre-removal positions).
    pub fn handle_items_removed(&self, indexes: &[usize]) {
        let mut sorted = indexes.to_vec();
        sorted.sort_unstable();
        sorted.dedup();
        let mut st = self.state.borrow_mut();
        for &i in sorted.iter().rev() {
            shift_for_removed(&mut st.current, i);
            for p in st.points.iter_mut() {
                shift_for_removed(p, i);
            }
        }
        st.row_count = st.row_count.saturating_sub(sorted.len());
    }

    /// Invalidates the current point's pixel bounds if an updated row lies inside it.
    pub fn handle_items_updated(&self, indexes: &[usize]) {
        let mut st = self.state.borrow_mut();
        let (start, end) = (st.current.start_index, st.current.end_index);
        if indexes.iter().any(|&i| start <= i && i < end) {
            st.current.valid = false;
        }
    }
}

fn shift_for_added(p: &mut RenderedPoint, index: usize, open_end: bool) {
    if p.start_index > index {
        p.start_index += 1;
        p.end_index += 1;
        p.valid = false;
    } else if index < p.end_index || (open_end && index == p.end_index) {
        p.end_index += 1;
        p.valid = false;
    }
}

fn shift_for_removed(p: &mut RenderedPoint, index: usize) {
    if p.start_index > index {
        p.start_index -= 1;
        p.end_index -= 1;
        p.valid = false;
    } else if index < p.end_index {
        p.end_index -= 1;
        p.valid = false;
    }
}

fn is_range_valid(metrics: Option<ScrollMetrics>, point: &RenderedPoint) -> bool {
    match metrics {
        Some(m) => point.covers(m.scroll_top, m.viewport_bottom()),
        None => false,
    }
}

fn find_covering_point(
    points: &[RenderedPoint],
    current: &RenderedPoint,
    top: u64,
    bottom: u64,
) -> Option<RenderedPoint> {
    if let Some(p) = points
        .iter()
        .find(|p| !p.same_rows(current) && p.covers(top, bottom))
    {
        return Some(*p);
    }

    // A viewport straddling two adjacent chunks.
    let mut sorted: Vec<RenderedPoint> = points.iter().copied().filter(|p| p.valid).collect();
    sorted.sort_by_key(|p| (p.start_index, p.end_index));
    sorted.windows(2).find_map(|pair| {
        let (a, b) = (pair[0], pair[1]);
        if a.end_index != b.start_index {
            return None;
        }
        let joined = RenderedPoint {
            start_index: a.start_index,
            end_index: b.end_index,
            start: a.start,
            end: b.end,
            max_count_limit: b.max_count_limit,
            done: b.done,
            valid: true,
        };
        (!joined.same_rows(current) && joined.covers(top, bottom)).then_some(joined)
    })
}
