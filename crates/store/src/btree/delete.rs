//! Copy-on-write deletion with borrow and merge rebalancing.
//!
//! The recursion hands each level a view of its siblings (offsets and
//! the separator keys around it). After removing, a page below the
//! occupancy minimum rebalances itself: it prefers borrowing from its
//! right sibling when that sibling holds strictly more than the
//! minimum, then from the left under the same condition, and merges
//! with the right (or the left when there is no right) otherwise. The
//! outcome travels up as a [`DeleteResult`] the parent patches itself
//! with. The root is exempt from the minimum and shrinks one level
//! when it is a node left with a single child.
//!
//! Separator upkeep: a separator equals the smallest key of the
//! subtree to its right, so deleting that smallest key carries the
//! subtree's new minimum up (`new_leftmost`) until a level replaces
//! its stale separator with it.

use super::{
    node::{Leaf, Node, TreePage, ValueHolder},
    read_tree_header, OpCtx,
};
use crate::{
    backend::StorageBackend,
    error::{CorruptedSnafu, PageOffset, Result},
};

/// The entry a delete removed.
#[derive(Debug, Clone)]
pub(crate) struct RemovedEntry {
    /// The removed key.
    pub key: Vec<u8>,
    /// The first (smallest) of the removed values.
    pub value: Vec<u8>,
    /// How many values the key held.
    pub nb_values: u64,
}

/// Which sibling a page merged with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Side {
    Left,
    Right,
}

/// What the level around a deleted key can see of its siblings: the
/// chain offset of each existing sibling and the separator key
/// standing between.
pub(crate) struct SiblingCtx {
    pub left: Option<(PageOffset, Vec<u8>)>,
    pub right: Option<(PageOffset, Vec<u8>)>,
}

/// Outcome of deleting from one subtree.
pub(crate) enum DeleteResult {
    /// The key is not in the subtree; nothing was copied or written.
    NotPresent,
    /// The subtree root was replaced and still meets the occupancy
    /// minimum (or is the root). The page is unwritten; the caller
    /// flushes it.
    Removed {
        page: TreePage,
        removed: RemovedEntry,
        /// New smallest key of the subtree, when the delete removed
        /// the previous one.
        new_leftmost: Option<Vec<u8>>,
    },
    /// The page fell below the minimum and took one entry from its
    /// left sibling. Both pages are unwritten.
    BorrowedFromLeft {
        page: TreePage,
        sibling: TreePage,
        removed: RemovedEntry,
        /// Replacement for the separator between sibling and page.
        new_separator: Vec<u8>,
    },
    /// The page fell below the minimum and took one entry from its
    /// right sibling. Both pages are unwritten.
    BorrowedFromRight {
        page: TreePage,
        sibling: TreePage,
        removed: RemovedEntry,
        /// Replacement for the separator between page and sibling.
        new_separator: Vec<u8>,
        new_leftmost: Option<Vec<u8>>,
    },
    /// The page merged with a sibling; the parent loses that child
    /// and one separator key.
    Merged {
        page: TreePage,
        removed: RemovedEntry,
        side: Side,
        new_leftmost: Option<Vec<u8>>,
    },
}

/// Recursive copy-on-write delete from the subtree rooted at `offset`.
/// `siblings` is `None` only at the root.
pub(crate) fn delete_rec<B: StorageBackend>(
    ctx: &mut OpCtx<'_, B>,
    offset: PageOffset,
    key: &[u8],
    siblings: Option<SiblingCtx>,
) -> Result<DeleteResult> {
    match ctx.load(offset)? {
        TreePage::Leaf(leaf) => delete_from_leaf(ctx, leaf, key, siblings),
        TreePage::Node(node) => delete_from_node(ctx, node, key, siblings),
    }
}

fn delete_from_leaf<B: StorageBackend>(
    ctx: &mut OpCtx<'_, B>,
    leaf: Leaf,
    key: &[u8],
    siblings: Option<SiblingCtx>,
) -> Result<DeleteResult> {
    let idx = match leaf.search(&ctx.cmp, key) {
        Ok(idx) => idx,
        Err(_) => return Ok(DeleteResult::NotPresent),
    };

    let removed = RemovedEntry {
        key: leaf.keys[idx].clone(),
        value: super::first_value(ctx.pager, &leaf.values[idx])?,
        nb_values: leaf.values[idx].count(),
    };

    // Dropping a spilled key releases its whole sub-tree.
    if let ValueHolder::SubTree { header_offset, .. } = &leaf.values[idx] {
        free_sub_tree(ctx, *header_offset)?;
    }

    let mut copy = leaf.copy_for(ctx.revision);
    ctx.shadow(&TreePage::Leaf(leaf));
    copy.keys.remove(idx);
    copy.values.remove(idx);

    let new_leftmost = if idx == 0 { copy.keys.first().cloned() } else { None };
    finish_level(ctx, TreePage::Leaf(copy), removed, new_leftmost, siblings)
}

fn delete_from_node<B: StorageBackend>(
    ctx: &mut OpCtx<'_, B>,
    node: Node,
    key: &[u8],
    siblings: Option<SiblingCtx>,
) -> Result<DeleteResult> {
    let idx = node.child_index(&ctx.cmp, key);
    let child_offset = node.children[idx].location().offset;

    let child_siblings = SiblingCtx {
        left: (idx > 0)
            .then(|| (node.children[idx - 1].location().offset, node.keys[idx - 1].clone())),
        right: (idx + 1 < node.children.len())
            .then(|| (node.children[idx + 1].location().offset, node.keys[idx].clone())),
    };

    let child_result = delete_rec(ctx, child_offset, key, Some(child_siblings))?;
    if matches!(child_result, DeleteResult::NotPresent) {
        return Ok(DeleteResult::NotPresent);
    }

    let mut copy = node.copy_for(ctx.revision);
    ctx.shadow(&TreePage::Node(node));

    let (removed, bubbled) = match child_result {
        DeleteResult::NotPresent => unreachable!("handled above"),
        DeleteResult::Removed { mut page, removed, new_leftmost } => {
            let child_ref = ctx.write(&mut page)?;
            copy.children[idx] = child_ref.into();
            let bubbled = apply_leftmost(&mut copy, idx, new_leftmost);
            (removed, bubbled)
        }
        DeleteResult::BorrowedFromRight {
            mut page,
            mut sibling,
            removed,
            new_separator,
            new_leftmost,
        } => {
            let page_ref = ctx.write(&mut page)?;
            let sibling_ref = ctx.write(&mut sibling)?;
            copy.children[idx] = page_ref.into();
            copy.children[idx + 1] = sibling_ref.into();
            copy.keys[idx] = new_separator;
            let bubbled = apply_leftmost(&mut copy, idx, new_leftmost);
            (removed, bubbled)
        }
        DeleteResult::BorrowedFromLeft { mut page, mut sibling, removed, new_separator } => {
            let page_ref = ctx.write(&mut page)?;
            let sibling_ref = ctx.write(&mut sibling)?;
            copy.children[idx - 1] = sibling_ref.into();
            copy.children[idx] = page_ref.into();
            copy.keys[idx - 1] = new_separator;
            (removed, None)
        }
        DeleteResult::Merged { mut page, removed, side: Side::Right, new_leftmost } => {
            let merged_ref = ctx.write(&mut page)?;
            copy.keys.remove(idx);
            copy.children.remove(idx + 1);
            copy.children[idx] = merged_ref.into();
            let bubbled = apply_leftmost(&mut copy, idx, new_leftmost);
            (removed, bubbled)
        }
        DeleteResult::Merged { mut page, removed, side: Side::Left, .. } => {
            let merged_ref = ctx.write(&mut page)?;
            copy.keys.remove(idx - 1);
            copy.children.remove(idx);
            copy.children[idx - 1] = merged_ref.into();
            (removed, None)
        }
    };

    finish_level(ctx, TreePage::Node(copy), removed, bubbled, siblings)
}

/// Replaces the stale separator left of child `idx` with the child's
/// new minimum, or keeps bubbling when the child is the leftmost.
fn apply_leftmost(node: &mut Node, idx: usize, new_leftmost: Option<Vec<u8>>) -> Option<Vec<u8>> {
    match new_leftmost {
        Some(leftmost) if idx > 0 => {
            node.keys[idx - 1] = leftmost;
            None
        }
        other => other,
    }
}

/// Returns the level's result, rebalancing first when the page fell
/// below the occupancy minimum and has siblings to lean on.
fn finish_level<B: StorageBackend>(
    ctx: &mut OpCtx<'_, B>,
    page: TreePage,
    removed: RemovedEntry,
    new_leftmost: Option<Vec<u8>>,
    siblings: Option<SiblingCtx>,
) -> Result<DeleteResult> {
    let Some(siblings) = siblings else {
        // Root pages are exempt from the minimum.
        return Ok(DeleteResult::Removed { page, removed, new_leftmost });
    };
    if !page.is_underflow(ctx.fanout) {
        return Ok(DeleteResult::Removed { page, removed, new_leftmost });
    }
    rebalance(ctx, page, removed, new_leftmost, siblings)
}

fn rebalance<B: StorageBackend>(
    ctx: &mut OpCtx<'_, B>,
    page: TreePage,
    removed: RemovedEntry,
    new_leftmost: Option<Vec<u8>>,
    siblings: SiblingCtx,
) -> Result<DeleteResult> {
    let right = match &siblings.right {
        Some((offset, _)) => Some(ctx.load(*offset)?),
        None => None,
    };
    if let (Some(sibling), Some((_, separator))) = (&right, &siblings.right) {
        if sibling.can_lend(ctx.fanout) {
            ctx.shadow(sibling);
            return borrow_from_right(ctx, page, sibling, separator, removed, new_leftmost);
        }
    }

    let left = match &siblings.left {
        Some((offset, _)) => Some(ctx.load(*offset)?),
        None => None,
    };
    if let (Some(sibling), Some((_, separator))) = (&left, &siblings.left) {
        if sibling.can_lend(ctx.fanout) {
            ctx.shadow(sibling);
            return borrow_from_left(ctx, page, sibling, separator, removed, new_leftmost);
        }
    }

    if let (Some(sibling), Some((_, separator))) = (&right, &siblings.right) {
        ctx.shadow(sibling);
        return merge_with_right(ctx, page, sibling, separator, removed, new_leftmost);
    }
    if let (Some(sibling), Some((_, separator))) = (&left, &siblings.left) {
        ctx.shadow(sibling);
        return merge_with_left(ctx, page, sibling, separator, removed, new_leftmost);
    }
    CorruptedSnafu { reason: "underflowed page with no siblings".to_string() }.fail()
}

fn borrow_from_right<B: StorageBackend>(
    ctx: &mut OpCtx<'_, B>,
    page: TreePage,
    sibling: &TreePage,
    separator: &[u8],
    removed: RemovedEntry,
    new_leftmost: Option<Vec<u8>>,
) -> Result<DeleteResult> {
    match (page, sibling) {
        (TreePage::Leaf(mut page), TreePage::Leaf(sibling)) => {
            let mut sibling = sibling.copy_for(ctx.revision);
            page.keys.push(sibling.keys.remove(0));
            page.values.push(sibling.values.remove(0));
            let new_separator = sibling.keys[0].clone();
            Ok(DeleteResult::BorrowedFromRight {
                page: TreePage::Leaf(page),
                sibling: TreePage::Leaf(sibling),
                removed,
                new_separator,
                new_leftmost,
            })
        }
        (TreePage::Node(mut page), TreePage::Node(sibling)) => {
            let mut sibling = sibling.copy_for(ctx.revision);
            // The old separator is the smallest key under the
            // sibling's first child, which becomes this page's last
            // child.
            page.keys.push(separator.to_vec());
            page.children.push(sibling.children.remove(0));
            let new_separator = sibling.keys.remove(0);
            Ok(DeleteResult::BorrowedFromRight {
                page: TreePage::Node(page),
                sibling: TreePage::Node(sibling),
                removed,
                new_separator,
                new_leftmost,
            })
        }
        _ => CorruptedSnafu { reason: "sibling pages of different kinds".to_string() }.fail(),
    }
}

fn borrow_from_left<B: StorageBackend>(
    ctx: &mut OpCtx<'_, B>,
    page: TreePage,
    sibling: &TreePage,
    separator: &[u8],
    removed: RemovedEntry,
    new_leftmost: Option<Vec<u8>>,
) -> Result<DeleteResult> {
    match (page, sibling) {
        (TreePage::Leaf(mut page), TreePage::Leaf(sibling)) => {
            let mut sibling = sibling.copy_for(ctx.revision);
            let moved_key = sibling.keys.pop().ok_or_else(|| crate::Error::Corrupted {
                reason: "empty left sibling".into(),
            })?;
            let moved_value = sibling.values.pop().ok_or_else(|| crate::Error::Corrupted {
                reason: "left sibling key/value mismatch".into(),
            })?;
            page.keys.insert(0, moved_key);
            page.values.insert(0, moved_value);
            let new_separator = page.keys[0].clone();
            Ok(DeleteResult::BorrowedFromLeft {
                page: TreePage::Leaf(page),
                sibling: TreePage::Leaf(sibling),
                removed,
                new_separator,
            })
        }
        (TreePage::Node(mut page), TreePage::Node(sibling)) => {
            let mut sibling = sibling.copy_for(ctx.revision);
            // The separator between left sibling and this page is the
            // smallest key of this page's subtree; it moves down as
            // the first key, updated if the delete changed the minimum.
            let pushed_down = new_leftmost.unwrap_or_else(|| separator.to_vec());
            page.keys.insert(0, pushed_down);
            let moved_child = sibling.children.pop().ok_or_else(|| crate::Error::Corrupted {
                reason: "empty left sibling node".into(),
            })?;
            page.children.insert(0, moved_child);
            let new_separator = sibling.keys.pop().ok_or_else(|| crate::Error::Corrupted {
                reason: "left sibling without keys".into(),
            })?;
            Ok(DeleteResult::BorrowedFromLeft {
                page: TreePage::Node(page),
                sibling: TreePage::Node(sibling),
                removed,
                new_separator,
            })
        }
        _ => CorruptedSnafu { reason: "sibling pages of different kinds".to_string() }.fail(),
    }
}

fn merge_with_right<B: StorageBackend>(
    _ctx: &mut OpCtx<'_, B>,
    page: TreePage,
    sibling: &TreePage,
    separator: &[u8],
    removed: RemovedEntry,
    new_leftmost: Option<Vec<u8>>,
) -> Result<DeleteResult> {
    match (page, sibling) {
        (TreePage::Leaf(mut page), TreePage::Leaf(sibling)) => {
            page.keys.extend(sibling.keys.iter().cloned());
            page.values.extend(sibling.values.iter().cloned());
            Ok(DeleteResult::Merged {
                page: TreePage::Leaf(page),
                removed,
                side: Side::Right,
                new_leftmost,
            })
        }
        (TreePage::Node(mut page), TreePage::Node(sibling)) => {
            page.keys.push(separator.to_vec());
            page.keys.extend(sibling.keys.iter().cloned());
            page.children.extend(sibling.children.iter().cloned());
            Ok(DeleteResult::Merged {
                page: TreePage::Node(page),
                removed,
                side: Side::Right,
                new_leftmost,
            })
        }
        _ => CorruptedSnafu { reason: "sibling pages of different kinds".to_string() }.fail(),
    }
}

fn merge_with_left<B: StorageBackend>(
    ctx: &mut OpCtx<'_, B>,
    page: TreePage,
    sibling: &TreePage,
    separator: &[u8],
    removed: RemovedEntry,
    new_leftmost: Option<Vec<u8>>,
) -> Result<DeleteResult> {
    match (page, sibling) {
        (TreePage::Leaf(page), TreePage::Leaf(sibling)) => {
            let mut merged = sibling.copy_for(ctx.revision);
            merged.keys.extend(page.keys);
            merged.values.extend(page.values);
            Ok(DeleteResult::Merged {
                page: TreePage::Leaf(merged),
                removed,
                side: Side::Left,
                new_leftmost: None,
            })
        }
        (TreePage::Node(page), TreePage::Node(sibling)) => {
            let mut merged = sibling.copy_for(ctx.revision);
            let pushed_down = new_leftmost.unwrap_or_else(|| separator.to_vec());
            merged.keys.push(pushed_down);
            merged.keys.extend(page.keys);
            merged.children.extend(page.children);
            Ok(DeleteResult::Merged {
                page: TreePage::Node(merged),
                removed,
                side: Side::Left,
                new_leftmost: None,
            })
        }
        _ => CorruptedSnafu { reason: "sibling pages of different kinds".to_string() }.fail(),
    }
}

/// Releases every page of a duplicate-values sub-tree, header included.
fn free_sub_tree<B: StorageBackend>(
    ctx: &mut OpCtx<'_, B>,
    header_offset: PageOffset,
) -> Result<()> {
    ctx.shadowed.push(header_offset);
    let header = read_tree_header(ctx.pager, header_offset)?;
    super::collect_tree_pages(ctx.pager, header.root_offset, &mut ctx.shadowed)
}
