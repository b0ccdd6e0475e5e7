//! Contracts for the data sources a content handler consumes.
//!
//! Providers are single-threaded and object-safe: handlers hold them as
//! `Rc<dyn DataProvider<D>>` / `Rc<dyn TreeDataProvider<D>>`.

use std::rc::Rc;

use async_trait::async_trait;

use crate::{FetchError, ItemMetadata, Key, Page};

/// Parameters for [`DataProvider::fetch_first`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FetchListParameters {
    /// Rows per page; `None` requests everything in one page.
    pub size: Option<usize>,
}

/// Parameters for [`DataProvider::fetch_by_offset`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FetchByOffsetParameters {
    pub offset: usize,
    pub size: usize,
}

/// Rows returned by [`DataProvider::fetch_by_offset`].
#[derive(Clone, Debug)]
pub struct FetchByOffsetResults<D> {
    pub offset: usize,
    pub data: Vec<D>,
    pub metadata: Vec<ItemMetadata>,
    pub done: bool,
}

/// An async iteration over the pages of one `fetch_first` call.
#[async_trait(?Send)]
pub trait FetchListIterator<D> {
    async fn next(&mut self) -> Result<Page<D>, FetchError>;
}

/// A paged, keyed data source.
#[async_trait(?Send)]
pub trait DataProvider<D: 'static> {
    /// Starts a fresh iteration from the first row.
    fn fetch_first(&self, params: FetchListParameters) -> Box<dyn FetchListIterator<D>>;

    /// The page-count capability.
    ///
    /// Providers that expose it control pagination themselves, so handlers never coalesce
    /// several of their pages into one fetch.
    fn page_count(&self) -> Option<usize> {
        None
    }

    /// Fetches a window of rows directly by position.
    async fn fetch_by_offset(
        &self,
        params: FetchByOffsetParameters,
    ) -> Result<FetchByOffsetResults<D>, FetchError> {
        let _ = params;
        Err(FetchError::Unsupported("fetch_by_offset"))
    }
}

/// A hierarchical data source.
pub trait TreeDataProvider<D: 'static>: DataProvider<D> {
    /// Returns the provider for the children of `key`, or `None` if the node is a leaf.
    ///
    /// Implementations must resolve any key in the tree, not just root rows.
    fn child_data_provider(&self, key: &Key) -> Option<Rc<dyn TreeDataProvider<D>>>;
}

/// Rows added by a mutation.
#[derive(Clone, Debug)]
pub struct AddDetail<D> {
    pub keys: Vec<Key>,
    pub data: Vec<D>,
    pub metadata: Vec<ItemMetadata>,
    /// Target positions. For trees these are relative to the parent's children.
    pub indexes: Option<Vec<usize>>,
    /// Insert before these keys; `None` entries mean "append".
    pub add_before_keys: Option<Vec<Option<Key>>>,
    /// Tree only: parents of the added rows (`None` is the root).
    pub parent_keys: Option<Vec<Option<Key>>>,
}

impl<D> AddDetail<D> {
    pub fn new(keys: Vec<Key>, data: Vec<D>) -> Self {
        let metadata = keys.iter().cloned().map(ItemMetadata::new).collect();
        Self {
            keys,
            data,
            metadata,
            indexes: None,
            add_before_keys: None,
            parent_keys: None,
        }
    }

    pub fn with_indexes(mut self, indexes: Vec<usize>) -> Self {
        self.indexes = Some(indexes);
        self
    }

    pub fn with_add_before_keys(mut self, add_before_keys: Vec<Option<Key>>) -> Self {
        self.add_before_keys = Some(add_before_keys);
        self
    }

    pub fn with_parent_keys(mut self, parent_keys: Vec<Option<Key>>) -> Self {
        self.parent_keys = Some(parent_keys);
        self
    }
}

/// Rows removed by a mutation.
#[derive(Clone, Debug, Default)]
pub struct RemoveDetail {
    pub keys: Vec<Key>,
    pub indexes: Option<Vec<usize>>,
}

impl RemoveDetail {
    pub fn new(keys: Vec<Key>) -> Self {
        Self {
            keys,
            indexes: None,
        }
    }

    pub fn with_indexes(mut self, indexes: Vec<usize>) -> Self {
        self.indexes = Some(indexes);
        self
    }
}

/// Rows replaced by a mutation.
#[derive(Clone, Debug)]
pub struct UpdateDetail<D> {
    pub keys: Vec<Key>,
    pub data: Vec<D>,
    pub metadata: Vec<ItemMetadata>,
    pub indexes: Option<Vec<usize>>,
}

impl<D> UpdateDetail<D> {
    pub fn new(keys: Vec<Key>, data: Vec<D>) -> Self {
        let metadata = keys.iter().cloned().map(ItemMetadata::new).collect();
        Self {
            keys,
            data,
            metadata,
            indexes: None,
        }
    }

    pub fn with_indexes(mut self, indexes: Vec<usize>) -> Self {
        self.indexes = Some(indexes);
        self
    }
}

/// Payload of a provider `mutate` notification. Parts are applied as remove, add, update.
#[derive(Clone, Debug)]
pub struct MutationDetail<D> {
    pub add: Option<AddDetail<D>>,
    pub remove: Option<RemoveDetail>,
    pub update: Option<UpdateDetail<D>>,
}

impl<D> Default for MutationDetail<D> {
    fn default() -> Self {
        Self {
            add: None,
            remove: None,
            update: None,
        }
    }
}

impl<D> MutationDetail<D> {
    pub fn add(add: AddDetail<D>) -> Self {
        Self {
            add: Some(add),
            ..Self::default()
        }
    }

    pub fn remove(remove: RemoveDetail) -> Self {
        Self {
            remove: Some(remove),
            ..Self::default()
        }
    }

    pub fn update(update: UpdateDetail<D>) -> Self {
        Self {
            update: Some(update),
            ..Self::default()
        }
    }
}

/// Notifications a provider emits to the owning component.
#[derive(Clone, Debug)]
pub enum DataProviderEvent<D> {
    Mutate(MutationDetail<D>),
    /// Everything is stale; the buffer must be discarded.
    Refresh,
}
