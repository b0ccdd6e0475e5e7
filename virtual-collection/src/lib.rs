//! A headless data-fetch/render pipeline for virtualized collections.
//!
//! For a ready-made [`RenderCallback`] store and an event-driven controller, see the
//! `virtual-collection-adapter` crate.
//!
//! This crate coordinates incremental, asynchronous fetching from a paged data source with
//! a scroll-driven viewport: it decides when the next page is needed, keeps the materialized
//! rows (the render buffer) consistent under add/remove/update notifications, and flattens
//! lazily expanded trees in pre-order.
//!
//! It is UI-agnostic and single-threaded. A UI layer is expected to provide:
//! - a [`RenderCallback`] owning the render buffer and rendering rows
//! - scroll geometry ([`ScrollMetrics`]) on every scroll event
//! - the pixel bounds achieved after each render ([`ContentHandler::set_viewport_range`])
//! - an executor for the (`!Send`) futures returned by the handlers
#![forbid(unsafe_code)]

#[macro_use]
mod macros;

mod error;
mod flat;
mod handler;
mod key;
mod memory;
mod options;
mod provider;
mod state;
mod tree;
mod types;
mod viewport;


pub use error::{ContentError, FetchError, Result};
pub use flat::FlatContentHandler;
pub use handler::{ContentHandler, ItemContext, RenderCallback, RenderOutput, SharedBuffer};
pub use key::{ExpandedKeys, Key};
pub use memory::{ArrayDataProvider, ArrayTreeDataProvider, TreeNode};
pub use options::{
    BeforeFetchNext, ContentOptions, DelayProvider, ErrorCallback, FetchPolicy, FetchStrategy,
};
pub use provider::{
    AddDetail, DataProvider, DataProviderEvent, FetchByOffsetParameters, FetchByOffsetResults,
    FetchListIterator, FetchListParameters, MutationDetail, RemoveDetail, TreeDataProvider,
    UpdateDetail,
};
pub use state::TrackerSnapshot;
pub use tree::{TreeContentHandler, collapse_rows};
pub use types::{
    FetchStatus, ItemMetadata, OutOfRangeRow, Page, RenderBuffer, RenderedPoint, ScrollMetrics,
};
pub use viewport::{RowSource, ViewportTracker};
