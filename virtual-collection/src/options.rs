use std::sync::Arc;
use std::time::Duration;

use futures::future::LocalBoxFuture;

use crate::{ContentError, ScrollMetrics};

/// Called with every error a handler or its tracker reports.
pub type ErrorCallback = Arc<dyn Fn(&ContentError) + Send + Sync>;

/// Gate consulted before a scroll-driven fetch under [`FetchStrategy::ViewportOnly`].
///
/// Returning `false` aborts the fetch for this scroll event.
pub type BeforeFetchNext = Arc<dyn Fn(ScrollMetrics) -> bool + Send + Sync>;

/// Produces a future that resolves after the given duration.
///
/// The core has no timer of its own; adapters plug in whatever their event loop offers.
pub type DelayProvider = Arc<dyn Fn(Duration) -> LocalBoxFuture<'static, ()> + Send + Sync>;

/// How much data the initial fetch requests.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum FetchPolicy {
    /// Fetch `fetch_size` rows up front and more as the user scrolls.
    #[default]
    LoadMoreOnScroll,
    /// Request everything in a single unbounded page.
    LoadAll,
}

/// When scroll-driven fetches happen.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum FetchStrategy {
    /// Fetch ahead once the scroll position approaches the end of fetched content.
    #[default]
    HighWaterMark,
    /// Like `HighWaterMark`, but every fetch is first checked by `before_fetch_next`.
    ViewportOnly,
}

/// Configuration shared by [`crate::FlatContentHandler`] and [`crate::TreeContentHandler`].
///
/// Callbacks are stored in `Arc`s so cloning options is cheap.
#[derive(Clone)]
pub struct ContentOptions {
    /// Rows per incremental fetch.
    pub fetch_size: usize,
    /// Hard cap on the total number of materialized rows.
    pub max_count: usize,
    pub fetch_policy: FetchPolicy,
    pub strategy: FetchStrategy,
    pub before_fetch_next: Option<BeforeFetchNext>,
    /// How long an expansion may stay pending before skeleton rows are shown.
    pub skeleton_delay: Duration,
    /// Timer used for the skeleton delay. Without one, skeletons are never shown for
    /// expansions.
    pub delay: Option<DelayProvider>,
    pub on_error: Option<ErrorCallback>,
}

impl Default for ContentOptions {
    fn default() -> Self {
        Self::new()
    }
}

impl ContentOptions {
    pub const DEFAULT_FETCH_SIZE: usize = 25;
    pub const DEFAULT_MAX_COUNT: usize = 500;
    pub const DEFAULT_SKELETON_DELAY: Duration = Duration::from_millis(250);

    pub fn new() -> Self {
        Self {
            fetch_size: Self::DEFAULT_FETCH_SIZE,
            max_count: Self::DEFAULT_MAX_COUNT,
            fetch_policy: FetchPolicy::default(),
            strategy: FetchStrategy::default(),
            before_fetch_next: None,
            skeleton_delay: Self::DEFAULT_SKELETON_DELAY,
            delay: None,
            on_error: None,
        }
    }

    pub fn with_fetch_size(mut self, fetch_size: usize) -> Self {
        self.fetch_size = fetch_size.max(1);
        self
    }

    pub fn with_max_count(mut self, max_count: usize) -> Self {
        self.max_count = max_count;
        self
    }

    pub fn with_fetch_policy(mut self, fetch_policy: FetchPolicy) -> Self {
        self.fetch_policy = fetch_policy;
        self
    }

    pub fn with_strategy(mut self, strategy: FetchStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_before_fetch_next(
        mut self,
        gate: Option<impl Fn(ScrollMetrics) -> bool + Send + Sync + 'static>,
    ) -> Self {
        self.before_fetch_next = gate.map(|f| Arc::new(f) as _);
        self
    }

    pub fn with_skeleton_delay(mut self, skeleton_delay: Duration) -> Self {
        self.skeleton_delay = skeleton_delay;
        self
    }

    pub fn with_delay(
        mut self,
        delay: Option<impl Fn(Duration) -> LocalBoxFuture<'static, ()> + Send + Sync + 'static>,
    ) -> Self {
        self.delay = delay.map(|f| Arc::new(f) as _);
        self
    }

    pub fn with_on_error(
        mut self,
        on_error: Option<impl Fn(&ContentError) + Send + Sync + 'static>,
    ) -> Self {
        self.on_error = on_error.map(|f| Arc::new(f) as _);
        self
    }

    /// Size of the page requested by the initial fetch; `None` is unbounded.
    pub(crate) fn initial_request_size(&self) -> Option<usize> {
        match self.fetch_policy {
            FetchPolicy::LoadMoreOnScroll => Some(self.fetch_size.min(self.max_count.max(1))),
            FetchPolicy::LoadAll => None,
        }
    }

    pub(crate) fn report(&self, error: &ContentError) {
        if let Some(cb) = &self.on_error {
            cb(error);
        }
    }
}

impl core::fmt::Debug for ContentOptions {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ContentOptions")
            .field("fetch_size", &self.fetch_size)
            .field("max_count", &self.max_count)
            .field("fetch_policy", &self.fetch_policy)
            .field("strategy", &self.strategy)
            .field("skeleton_delay", &self.skeleton_delay)
            .field("has_delay", &self.delay.is_some())
            .finish_non_exhaustive()
    }
}
