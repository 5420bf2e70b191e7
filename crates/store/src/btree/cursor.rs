//! Ordered lazy iteration over a tree revision.
//!
//! The cursor keeps a stack of `(node, child index)` pairs from the
//! root down to the current leaf, resolving child references on
//! demand. Pages stay resolved for as long as the cursor holds them.
//! Duplicate holders are expanded in value order; spilled holders open
//! a nested cursor over their sub-tree.

use super::{
    io,
    node::{Leaf, Node, TreePage, ValueHolder},
    read_tree_header,
};
use crate::{
    backend::StorageBackend,
    error::{PageOffset, Result},
    page::Pager,
    types::KeyCmp,
};

/// Iteration state within the current leaf entry's values.
enum ValueState<'p, B: StorageBackend> {
    /// Inline values (single or array) left to yield.
    Inline(std::vec::IntoIter<Vec<u8>>),
    /// Values streamed out of a duplicate sub-tree.
    Sub(Box<RawCursor<'p, B>>),
}

/// Position within the current leaf.
struct LeafPos<'p, B: StorageBackend> {
    leaf: Leaf,
    entry: usize,
    values: Option<ValueState<'p, B>>,
}

/// Engine-level cursor yielding `(encoded key, encoded value)` pairs
/// in key order, duplicates expanded.
pub(crate) struct RawCursor<'p, B: StorageBackend> {
    pager: &'p Pager<B>,
    /// Path from the root: each node and the child index currently
    /// descended into.
    stack: Vec<(Node, usize)>,
    position: Option<LeafPos<'p, B>>,
}

impl<'p, B: StorageBackend> RawCursor<'p, B> {
    /// Cursor positioned before the smallest key of the tree rooted at
    /// `root_offset`.
    pub(crate) fn new(pager: &'p Pager<B>, root_offset: PageOffset) -> Result<Self> {
        let mut cursor = Self { pager, stack: Vec::new(), position: None };
        cursor.descend_leftmost(root_offset)?;
        Ok(cursor)
    }

    /// Cursor positioned before the first key `>= key`.
    pub(crate) fn seek(
        pager: &'p Pager<B>,
        root_offset: PageOffset,
        cmp: &KeyCmp,
        key: &[u8],
    ) -> Result<Self> {
        let mut cursor = Self { pager, stack: Vec::new(), position: None };
        let mut offset = root_offset;
        loop {
            match io::read_page(pager, offset)? {
                TreePage::Node(node) => {
                    let idx = node.child_index(cmp, key);
                    offset = node.children[idx].location().offset;
                    cursor.stack.push((node, idx));
                }
                TreePage::Leaf(leaf) => {
                    let entry = match leaf.search(cmp, key) {
                        Ok(idx) => idx,
                        Err(idx) => idx,
                    };
                    cursor.position = Some(LeafPos { leaf, entry, values: None });
                    break;
                }
            }
        }
        Ok(cursor)
    }

    fn descend_leftmost(&mut self, mut offset: PageOffset) -> Result<()> {
        loop {
            match io::read_page(self.pager, offset)? {
                TreePage::Node(node) => {
                    offset = node.children[0].location().offset;
                    self.stack.push((node, 0));
                }
                TreePage::Leaf(leaf) => {
                    self.position = Some(LeafPos { leaf, entry: 0, values: None });
                    return Ok(());
                }
            }
        }
    }

    /// Moves the deepest stack level that still has a sibling child to
    /// it and descends; clears the position when the tree is exhausted.
    fn advance_leaf(&mut self) -> Result<()> {
        self.position = None;
        loop {
            let next_offset = {
                let Some((node, idx)) = self.stack.last_mut() else {
                    return Ok(());
                };
                if *idx + 1 < node.children.len() {
                    *idx += 1;
                    Some(node.children[*idx].location().offset)
                } else {
                    None
                }
            };
            match next_offset {
                Some(offset) => return self.descend_leftmost(offset),
                None => {
                    self.stack.pop();
                }
            }
        }
    }

    /// Next `(key, value)` pair, or `None` when the revision is
    /// exhausted.
    pub(crate) fn next_pair(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        loop {
            let at_leaf_end = match &self.position {
                None => return Ok(None),
                Some(position) => position.entry >= position.leaf.keys.len(),
            };
            if at_leaf_end {
                self.advance_leaf()?;
                if self.position.is_none() {
                    return Ok(None);
                }
                continue;
            }

            let pager = self.pager;
            let position = self.position.as_mut().unwrap();
            if position.values.is_none() {
                position.values =
                    Some(open_values(pager, &position.leaf.values[position.entry])?);
            }

            let next_value = match position.values.as_mut().unwrap() {
                ValueState::Inline(iter) => iter.next(),
                ValueState::Sub(sub) => sub.next_pair()?.map(|(value, _)| value),
            };

            match next_value {
                Some(value) => {
                    let key = position.leaf.keys[position.entry].clone();
                    return Ok(Some((key, value)));
                }
                None => {
                    position.entry += 1;
                    position.values = None;
                }
            }
        }
    }
}

fn open_values<'p, B: StorageBackend>(
    pager: &'p Pager<B>,
    holder: &ValueHolder,
) -> Result<ValueState<'p, B>> {
    match holder {
        ValueHolder::Single(value) => Ok(ValueState::Inline(vec![value.clone()].into_iter())),
        ValueHolder::Array(values) => Ok(ValueState::Inline(values.clone().into_iter())),
        ValueHolder::SubTree { header_offset, .. } => {
            let header = read_tree_header(pager, *header_offset)?;
            Ok(ValueState::Sub(Box::new(RawCursor::new(pager, header.root_offset)?)))
        }
    }
}
