//! Copy-on-write insertion.
//!
//! The recursion descends to the target leaf, copies every touched
//! page under the transaction's revision, and propagates the result
//! back up: a parent either swaps the modified child reference in its
//! own copy, or absorbs a split by adopting the promoted key. Child
//! pages are flushed by the level above them; the tree driver writes
//! the final root, so every page is on disk before the new header
//! that references it.
//!
//! Leaf split policy: entries are divided evenly, the extra element
//! staying left when the count is odd; the first key of the right
//! leaf is promoted while also remaining in the right leaf. Node
//! split: the median key is promoted, not retained.

use super::{
    node::{Leaf, Node, TreePage, ValueHolder},
    read_tree_header, write_tree_header, OpCtx, DUP_INLINE_THRESHOLD,
};
use crate::{
    backend::StorageBackend,
    error::{CorruptedSnafu, PageOffset, Result, NO_PAGE},
};

/// Outcome of inserting into one subtree.
pub(crate) enum InsertResult {
    /// The key held this exact value already (or the tree forbids
    /// duplicates and the stored value equals the new one). Nothing
    /// was copied or written.
    ExistingValue {
        /// The value already stored.
        old: Vec<u8>,
    },
    /// The subtree root was replaced by a copy holding the new entry.
    /// The page is not yet written; the caller flushes it.
    Modified {
        /// The unwritten replacement page.
        page: TreePage,
        /// Previous value when the insert replaced one.
        old: Option<Vec<u8>>,
        /// True when the element count grew.
        added: bool,
    },
    /// The subtree root was full and split in two. Neither page is
    /// written yet; the promoted key goes into the parent.
    Split {
        /// Key to insert into the parent (smallest key of `right`).
        pivot: Vec<u8>,
        /// Left half.
        left: TreePage,
        /// Right half.
        right: TreePage,
    },
}

/// Recursive copy-on-write insert into the subtree rooted at `offset`.
pub(crate) fn insert_rec<B: StorageBackend>(
    ctx: &mut OpCtx<'_, B>,
    offset: PageOffset,
    key: &[u8],
    value: &[u8],
) -> Result<InsertResult> {
    match ctx.load(offset)? {
        TreePage::Leaf(leaf) => insert_into_leaf(ctx, leaf, key, value),
        TreePage::Node(node) => insert_into_node(ctx, node, key, value),
    }
}

fn insert_into_leaf<B: StorageBackend>(
    ctx: &mut OpCtx<'_, B>,
    leaf: Leaf,
    key: &[u8],
    value: &[u8],
) -> Result<InsertResult> {
    match leaf.search(&ctx.cmp, key) {
        Ok(idx) => {
            if !ctx.allow_dups {
                let old = match &leaf.values[idx] {
                    ValueHolder::Single(old) => old.clone(),
                    other => {
                        return CorruptedSnafu {
                            reason: format!("multi-value holder in a unique tree: {other:?}"),
                        }
                        .fail()
                    }
                };
                if ctx.vcmp.compare(&old, value) == std::cmp::Ordering::Equal {
                    return Ok(InsertResult::ExistingValue { old });
                }
                let mut copy = leaf.copy_for(ctx.revision);
                ctx.shadow(&TreePage::Leaf(leaf));
                copy.values[idx] = ValueHolder::Single(value.to_vec());
                return Ok(InsertResult::Modified {
                    page: TreePage::Leaf(copy),
                    old: Some(old),
                    added: false,
                });
            }

            match add_value(ctx, &leaf.values[idx], value)? {
                AddValue::Exists { old } => Ok(InsertResult::ExistingValue { old }),
                AddValue::Added { holder } => {
                    let mut copy = leaf.copy_for(ctx.revision);
                    ctx.shadow(&TreePage::Leaf(leaf));
                    copy.values[idx] = holder;
                    Ok(InsertResult::Modified { page: TreePage::Leaf(copy), old: None, added: true })
                }
            }
        }
        Err(idx) => {
            if leaf.keys.len() < ctx.fanout {
                let mut copy = leaf.copy_for(ctx.revision);
                ctx.shadow(&TreePage::Leaf(leaf));
                copy.keys.insert(idx, key.to_vec());
                copy.values.insert(idx, ValueHolder::Single(value.to_vec()));
                return Ok(InsertResult::Modified {
                    page: TreePage::Leaf(copy),
                    old: None,
                    added: true,
                });
            }
            Ok(split_leaf(ctx, leaf, idx, key, value))
        }
    }
}

/// Splits a full leaf while inserting `(key, value)` at `idx`.
fn split_leaf<B: StorageBackend>(
    ctx: &mut OpCtx<'_, B>,
    leaf: Leaf,
    idx: usize,
    key: &[u8],
    value: &[u8],
) -> InsertResult {
    let mut keys = leaf.keys.clone();
    let mut values = leaf.values.clone();
    ctx.shadow(&TreePage::Leaf(leaf));
    keys.insert(idx, key.to_vec());
    values.insert(idx, ValueHolder::Single(value.to_vec()));

    // The extra element stays left when the count is odd.
    let total = keys.len();
    let left_count = total - total / 2;

    let right_keys = keys.split_off(left_count);
    let right_values = values.split_off(left_count);
    let pivot = right_keys[0].clone();

    let left = Leaf {
        revision: ctx.revision,
        offset: NO_PAGE,
        last_offset: NO_PAGE,
        keys,
        values,
    };
    let right = Leaf {
        revision: ctx.revision,
        offset: NO_PAGE,
        last_offset: NO_PAGE,
        keys: right_keys,
        values: right_values,
    };
    InsertResult::Split { pivot, left: TreePage::Leaf(left), right: TreePage::Leaf(right) }
}

fn insert_into_node<B: StorageBackend>(
    ctx: &mut OpCtx<'_, B>,
    node: Node,
    key: &[u8],
    value: &[u8],
) -> Result<InsertResult> {
    let idx = node.child_index(&ctx.cmp, key);
    let child_offset = node.children[idx].location().offset;

    match insert_rec(ctx, child_offset, key, value)? {
        InsertResult::ExistingValue { old } => Ok(InsertResult::ExistingValue { old }),
        InsertResult::Modified { mut page, old, added } => {
            let child_ref = ctx.write(&mut page)?;
            let mut copy = node.copy_for(ctx.revision);
            ctx.shadow(&TreePage::Node(node));
            copy.children[idx] = child_ref.into();
            Ok(InsertResult::Modified { page: TreePage::Node(copy), old, added })
        }
        InsertResult::Split { pivot, mut left, mut right } => {
            let left_ref = ctx.write(&mut left)?;
            let right_ref = ctx.write(&mut right)?;

            let mut copy = node.copy_for(ctx.revision);
            ctx.shadow(&TreePage::Node(node));
            copy.keys.insert(idx, pivot);
            copy.children[idx] = left_ref.into();
            copy.children.insert(idx + 1, right_ref.into());

            if copy.children.len() <= ctx.fanout {
                return Ok(InsertResult::Modified { page: TreePage::Node(copy), old: None, added: true });
            }
            Ok(split_node(ctx, copy))
        }
    }
}

/// Splits an over-full node copy: the median key moves up and is not
/// retained in either half.
fn split_node<B: StorageBackend>(ctx: &OpCtx<'_, B>, mut node: Node) -> InsertResult {
    let median = node.keys.len() / 2;
    let right_keys = node.keys.split_off(median + 1);
    let pivot = node.keys.pop().unwrap();
    let right_children = node.children.split_off(median + 1);

    let right = Node {
        revision: ctx.revision,
        offset: NO_PAGE,
        last_offset: NO_PAGE,
        keys: right_keys,
        children: right_children,
    };
    node.revision = ctx.revision;
    InsertResult::Split { pivot, left: TreePage::Node(node), right: TreePage::Node(right) }
}

// ============================================================================
// Duplicate values
// ============================================================================

/// Outcome of adding a value to an existing key's holder.
enum AddValue {
    /// The value was already present.
    Exists { old: Vec<u8> },
    /// A replacement holder carrying the new value.
    Added { holder: ValueHolder },
}

/// Adds `value` to `holder`, keeping inline arrays sorted by the value
/// comparator and spilling into a sub-tree past the inline threshold.
fn add_value<B: StorageBackend>(
    ctx: &mut OpCtx<'_, B>,
    holder: &ValueHolder,
    value: &[u8],
) -> Result<AddValue> {
    match holder {
        ValueHolder::Single(existing) => match ctx.vcmp.compare(existing, value) {
            std::cmp::Ordering::Equal => Ok(AddValue::Exists { old: existing.clone() }),
            std::cmp::Ordering::Less => Ok(AddValue::Added {
                holder: ValueHolder::Array(vec![existing.clone(), value.to_vec()]),
            }),
            std::cmp::Ordering::Greater => Ok(AddValue::Added {
                holder: ValueHolder::Array(vec![value.to_vec(), existing.clone()]),
            }),
        },
        ValueHolder::Array(values) => {
            match values.binary_search_by(|probe| ctx.vcmp.compare(probe, value)) {
                Ok(i) => Ok(AddValue::Exists { old: values[i].clone() }),
                Err(i) => {
                    let mut values = values.clone();
                    values.insert(i, value.to_vec());
                    if values.len() <= DUP_INLINE_THRESHOLD {
                        return Ok(AddValue::Added { holder: ValueHolder::Array(values) });
                    }
                    let (header_offset, count) = build_sub_tree(ctx, &values)?;
                    Ok(AddValue::Added { holder: ValueHolder::SubTree { header_offset, count } })
                }
            }
        }
        ValueHolder::SubTree { header_offset, count } => {
            match sub_tree_insert(ctx, *header_offset, value)? {
                None => Ok(AddValue::Exists { old: value.to_vec() }),
                Some(new_header) => Ok(AddValue::Added {
                    holder: ValueHolder::SubTree { header_offset: new_header, count: count + 1 },
                }),
            }
        }
    }
}

/// Builds a fresh duplicate-values sub-tree holding `values` (already
/// sorted and distinct) and returns its header offset.
fn build_sub_tree<B: StorageBackend>(
    ctx: &mut OpCtx<'_, B>,
    values: &[Vec<u8>],
) -> Result<(PageOffset, u64)> {
    let mut sub = ctx.sub();

    let mut root = TreePage::Leaf(Leaf::empty(sub.revision));
    let mut root_ref = sub.write(&mut root)?;

    for value in values {
        match insert_rec(&mut sub, root_ref.offset, value, &[])? {
            InsertResult::ExistingValue { .. } => {}
            InsertResult::Modified { mut page, .. } => {
                root_ref = sub.write(&mut page)?;
            }
            InsertResult::Split { pivot, mut left, mut right } => {
                let left_ref = sub.write(&mut left)?;
                let right_ref = sub.write(&mut right)?;
                let mut new_root = TreePage::Node(Node {
                    revision: sub.revision,
                    offset: NO_PAGE,
                    last_offset: NO_PAGE,
                    keys: vec![pivot],
                    children: vec![left_ref.into(), right_ref.into()],
                });
                root_ref = sub.write(&mut new_root)?;
            }
        }
    }

    let count = values.len() as u64;
    let header_offset =
        write_tree_header(sub.pager, sub.revision, count, root_ref.offset, sub.info_offset)?;
    ctx.shadowed.append(&mut sub.shadowed);
    ctx.transient.append(&mut sub.transient);
    Ok((header_offset, count))
}

/// Inserts `value` into the sub-tree behind `header_offset`. Returns
/// the new header offset, or `None` when the value was already there.
fn sub_tree_insert<B: StorageBackend>(
    ctx: &mut OpCtx<'_, B>,
    header_offset: PageOffset,
    value: &[u8],
) -> Result<Option<PageOffset>> {
    let header = read_tree_header(ctx.pager, header_offset)?;
    let mut sub = ctx.sub();

    let root_ref = match insert_rec(&mut sub, header.root_offset, value, &[])? {
        InsertResult::ExistingValue { .. } => return Ok(None),
        InsertResult::Modified { mut page, .. } => sub.write(&mut page)?,
        InsertResult::Split { pivot, mut left, mut right } => {
            let left_ref = sub.write(&mut left)?;
            let right_ref = sub.write(&mut right)?;
            let mut new_root = TreePage::Node(Node {
                revision: sub.revision,
                offset: NO_PAGE,
                last_offset: NO_PAGE,
                keys: vec![pivot],
                children: vec![left_ref.into(), right_ref.into()],
            });
            sub.write(&mut new_root)?
        }
    };

    let new_header = write_tree_header(
        sub.pager,
        sub.revision,
        header.nb_elems + 1,
        root_ref.offset,
        header.info_offset,
    )?;
    ctx.shadowed.append(&mut sub.shadowed);
    ctx.transient.append(&mut sub.transient);
    ctx.shadowed.push(header_offset);
    Ok(Some(new_header))
}
