use std::sync::Arc;

use crate::common::types::{PageId, Rid, INVALID_PAGE_ID};
use crate::index::btree::error::BTreeError;
use crate::index::btree::key::BTreeKey;
use crate::index::btree::node::{BTreeNode, LeafNode};
use crate::storage::buffer::BufferPoolManager;
use crate::storage::page::PageReadGuard;

struct LeafPosition<K> {
    page_id: PageId,
    guard: PageReadGuard,
    leaf: LeafNode<K>,
}

/// Range cursor over the leaf chain. Holds a read latch and a pin on the
/// current leaf only; hopping to the next leaf releases the current one
/// first, so the cursor never stacks latches against top-down writers.
pub struct TreeIterator<K: BTreeKey> {
    bpm: Arc<BufferPoolManager>,
    position: Option<LeafPosition<K>>,
    index: usize,
}

impl<K: BTreeKey> TreeIterator<K> {
    pub(crate) fn new(
        bpm: Arc<BufferPoolManager>,
        page_id: PageId,
        guard: PageReadGuard,
        leaf: LeafNode<K>,
        index: usize,
    ) -> Self {
        Self {
            bpm,
            position: Some(LeafPosition {
                page_id,
                guard,
                leaf,
            }),
            index,
        }
    }

    pub(crate) fn empty(bpm: Arc<BufferPoolManager>) -> Self {
        Self {
            bpm,
            position: None,
            index: 0,
        }
    }

    pub fn is_end(&self) -> bool {
        self.position.is_none()
    }

    /// Release the current leaf (latch first, then pin).
    fn release(&mut self) -> Result<(), BTreeError> {
        if let Some(position) = self.position.take() {
            let page_id = position.page_id;
            drop(position.guard);
            self.bpm.unpin_page(page_id, false)?;
        }
        Ok(())
    }

    fn try_next(&mut self) -> Result<Option<(K, Rid)>, BTreeError> {
        loop {
            let next_page_id = match &self.position {
                None => return Ok(None),
                Some(position) => {
                    if self.index < position.leaf.entries.len() {
                        let entry = position.leaf.entries[self.index];
                        self.index += 1;
                        return Ok(Some(entry));
                    }
                    position.leaf.next_page_id
                }
            };

            self.release()?;
            if next_page_id == INVALID_PAGE_ID {
                return Ok(None);
            }

            let ptr = self.bpm.fetch_page(next_page_id)?;
            let guard = ptr.read_arc();
            let leaf = match BTreeNode::<K>::decode(&guard.data) {
                Ok(BTreeNode::Leaf(leaf)) => leaf,
                Ok(BTreeNode::Internal(_)) => {
                    drop(guard);
                    let _ = self.bpm.unpin_page(next_page_id, false);
                    panic!("leaf chain reached a non-leaf page {}", next_page_id);
                }
                Err(e) => {
                    drop(guard);
                    let _ = self.bpm.unpin_page(next_page_id, false);
                    return Err(e);
                }
            };
            self.position = Some(LeafPosition {
                page_id: next_page_id,
                guard,
                leaf,
            });
            self.index = 0;
        }
    }
}

impl<K: BTreeKey> Iterator for TreeIterator<K> {
    type Item = Result<(K, Rid), BTreeError>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.try_next() {
            Ok(Some(entry)) => Some(Ok(entry)),
            Ok(None) => None,
            Err(e) => Some(Err(e)),
        }
    }
}

impl<K: BTreeKey> Drop for TreeIterator<K> {
    fn drop(&mut self) {
        if let Some(position) = self.position.take() {
            let page_id = position.page_id;
            drop(position.guard);
            let _ = self.bpm.unpin_page(page_id, false);
        }
    }
}
