//! In-memory providers, handy for tests, demos and small static collections.

use std::rc::Rc;

use async_trait::async_trait;

use crate::{
    DataProvider, FetchByOffsetParameters, FetchByOffsetResults, FetchError, FetchListIterator,
    FetchListParameters, ItemMetadata, Key, Page, TreeDataProvider,
};

struct SliceIterator<D> {
    rows: Rc<Vec<(Key, D)>>,
    pos: usize,
    size: Option<usize>,
}

#[async_trait(?Send)]
impl<D: Clone> FetchListIterator<D> for SliceIterator<D> {
    async fn next(&mut self) -> Result<Page<D>, FetchError> {
        let len = self.rows.len();
        let end = match self.size {
            Some(size) => self.pos.saturating_add(size).min(len),
            None => len,
        };
        let (data, metadata) = split_rows(&self.rows[self.pos.min(len)..end]);
        self.pos = end;
        Ok(Page::new(data, metadata, end >= len))
    }
}

fn split_rows<D: Clone>(rows: &[(Key, D)]) -> (Vec<D>, Vec<ItemMetadata>) {
    rows.iter()
        .map(|(key, data)| (data.clone(), ItemMetadata::new(key.clone())))
        .unzip()
}

/// A flat provider over a fixed list of keyed rows.
#[derive(Clone, Debug)]
pub struct ArrayDataProvider<D> {
    rows: Rc<Vec<(Key, D)>>,
    page_count_capable: bool,
}

impl<D: Clone + 'static> ArrayDataProvider<D> {
    pub fn new(rows: impl IntoIterator<Item = (Key, D)>) -> Self {
        Self {
            rows: Rc::new(rows.into_iter().collect()),
            page_count_capable: false,
        }
    }

    /// Makes the provider report a page count, so handlers take its pages one at a time.
    pub fn with_page_count_capability(mut self, capable: bool) -> Self {
        self.page_count_capable = capable;
        self
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

#[async_trait(?Send)]
impl<D: Clone + 'static> DataProvider<D> for ArrayDataProvider<D> {
    fn fetch_first(&self, params: FetchListParameters) -> Box<dyn FetchListIterator<D>> {
        Box::new(SliceIterator {
            rows: Rc::clone(&self.rows),
            pos: 0,
            size: params.size,
        })
    }

    fn page_count(&self) -> Option<usize> {
        if !self.page_count_capable {
            return None;
        }
        Some(self.rows.len())
    }

    async fn fetch_by_offset(
        &self,
        params: FetchByOffsetParameters,
    ) -> Result<FetchByOffsetResults<D>, FetchError> {
        let len = self.rows.len();
        let start = params.offset.min(len);
        let end = params.offset.saturating_add(params.size).min(len);
        let (data, metadata) = split_rows(&self.rows[start..end]);
        Ok(FetchByOffsetResults {
            offset: start,
            data,
            metadata,
            done: end >= len,
        })
    }
}

/// A node of an [`ArrayTreeDataProvider`]. `children: Some(..)` marks a parent, even when
/// the list is empty.
#[derive(Clone, Debug)]
pub struct TreeNode<D> {
    pub key: Key,
    pub data: D,
    pub children: Option<Vec<TreeNode<D>>>,
}

impl<D> TreeNode<D> {
    pub fn leaf(key: impl Into<Key>, data: D) -> Self {
        Self {
            key: key.into(),
            data,
            children: None,
        }
    }

    pub fn parent(key: impl Into<Key>, data: D, children: Vec<TreeNode<D>>) -> Self {
        Self {
            key: key.into(),
            data,
            children: Some(children),
        }
    }
}

/// A tree provider over nested in-memory nodes.
#[derive(Clone, Debug)]
pub struct ArrayTreeDataProvider<D> {
    root: Rc<Vec<TreeNode<D>>>,
    level: Rc<Vec<(Key, D)>>,
    page_count_capable: bool,
}

impl<D: Clone + 'static> ArrayTreeDataProvider<D> {
    pub fn new(nodes: Vec<TreeNode<D>>) -> Self {
        let level = Rc::new(level_rows(&nodes));
        Self {
            root: Rc::new(nodes),
            level,
            page_count_capable: false,
        }
    }

    pub fn with_page_count_capability(mut self, capable: bool) -> Self {
        self.page_count_capable = capable;
        self
    }

    fn find(&self, key: &Key) -> Option<&TreeNode<D>> {
        let mut stack: Vec<&TreeNode<D>> = self.root.iter().collect();
        while let Some(node) = stack.pop() {
            if &node.key == key {
                return Some(node);
            }
            if let Some(children) = &node.children {
                stack.extend(children.iter());
            }
        }
        None
    }
}

fn level_rows<D: Clone>(nodes: &[TreeNode<D>]) -> Vec<(Key, D)> {
    nodes
        .iter()
        .map(|n| (n.key.clone(), n.data.clone()))
        .collect()
}

#[async_trait(?Send)]
impl<D: Clone + 'static> DataProvider<D> for ArrayTreeDataProvider<D> {
    fn fetch_first(&self, params: FetchListParameters) -> Box<dyn FetchListIterator<D>> {
        Box::new(SliceIterator {
            rows: Rc::clone(&self.level),
            pos: 0,
            size: params.size,
        })
    }

    fn page_count(&self) -> Option<usize> {
        if !self.page_count_capable {
            return None;
        }
        Some(self.level.len())
    }
}

impl<D: Clone + 'static> TreeDataProvider<D> for ArrayTreeDataProvider<D> {
    fn child_data_provider(&self, key: &Key) -> Option<Rc<dyn TreeDataProvider<D>>> {
        let children = self.find(key)?.children.as_ref()?;
        Some(Rc::new(ArrayTreeDataProvider {
            root: Rc::clone(&self.root),
            level: Rc::new(level_rows(children)),
            page_count_capable: self.page_count_capable,
        }))
    }
}
