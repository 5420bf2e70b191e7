//! On-disk layout of B+tree pages.
//!
//! A serialized page spans one chain of `PageIo`s:
//!
//! ```text
//! Node payload: [revision:8][-nbChildren:4][dataSize:4][data]
//!   data = (childOffset:8, childLastOffset:8, keyLen:4, keyBytes)*
//!          followed by a trailing (childOffset:8, childLastOffset:8)
//! Leaf payload: [revision:8][+nbEntries:4][dataSize:4][data]
//!   data = (nbValues:4, values-block, keyLen:4, keyBytes)*
//! ```
//!
//! The children count is stored negated, which is how a reader
//! distinguishes a node from a leaf. A leaf `values-block` is either
//! an inline array `(arrayLen:4, (valueLen:4, valueBytes)*)` for a
//! positive `nbValues`, or the 8-byte header offset of a
//! duplicate-values sub-tree, with `nbValues` encoded as `-(count+1)`
//! to avoid the zero ambiguity.

use super::node::{ChildRef, Leaf, Node, PageRef, TreePage, ValueHolder};
use crate::{
    backend::StorageBackend,
    error::{CorruptedSnafu, PageOffset, Result, NO_PAGE},
    page::{ChainReader, ChainWriter, Pager},
};

/// Fixed prefix of every serialized page: revision + count + dataSize.
const PAGE_PREFIX: usize = 8 + 4 + 4;

/// Serializes `page` into freshly allocated chain pages, flushes them,
/// and stamps the chain location onto the page.
///
/// # Errors
///
/// Returns an error when allocation or the flush fails, or when the
/// page references an unwritten child.
pub(crate) fn write_page<B: StorageBackend>(
    pager: &Pager<B>,
    page: &mut TreePage,
) -> Result<PageRef> {
    let data = serialize_data(page)?;
    let count = match page {
        TreePage::Leaf(leaf) => leaf.keys.len() as i32,
        TreePage::Node(node) => -(node.children.len() as i32),
    };

    let total = PAGE_PREFIX + data.len();
    let mut pages = pager.reserve(total)?;
    {
        let mut writer = ChainWriter::new(&mut pages, pager.page_size());
        writer.write_u64(page_revision(page))?;
        writer.write_i32(count)?;
        writer.write_u32(data.len() as u32)?;
        writer.write_raw(&data)?;
    }
    pager.flush(&pages)?;

    let re = PageRef {
        offset: pages[0].offset(),
        last_offset: pages[pages.len() - 1].offset(),
    };
    page.set_location(re);
    Ok(re)
}

fn page_revision(page: &TreePage) -> u64 {
    match page {
        TreePage::Leaf(leaf) => leaf.revision,
        TreePage::Node(node) => node.revision,
    }
}

fn serialize_data(page: &TreePage) -> Result<Vec<u8>> {
    let mut data = Vec::new();
    match page {
        TreePage::Leaf(leaf) => {
            for (key, holder) in leaf.keys.iter().zip(&leaf.values) {
                serialize_values(holder, &mut data);
                data.extend_from_slice(&(key.len() as u32).to_be_bytes());
                data.extend_from_slice(key);
            }
        }
        TreePage::Node(node) => {
            for (i, key) in node.keys.iter().enumerate() {
                serialize_child(&node.children[i], &mut data)?;
                data.extend_from_slice(&(key.len() as u32).to_be_bytes());
                data.extend_from_slice(key);
            }
            serialize_child(&node.children[node.children.len() - 1], &mut data)?;
        }
    }
    Ok(data)
}

fn serialize_child(child: &ChildRef, data: &mut Vec<u8>) -> Result<()> {
    let re = child.location();
    snafu::ensure!(
        re.offset != NO_PAGE && re.last_offset != NO_PAGE,
        CorruptedSnafu { reason: "serializing a node with an unwritten child".to_string() }
    );
    data.extend_from_slice(&re.offset.to_be_bytes());
    data.extend_from_slice(&re.last_offset.to_be_bytes());
    Ok(())
}

fn serialize_values(holder: &ValueHolder, data: &mut Vec<u8>) {
    match holder {
        ValueHolder::Single(value) => {
            data.extend_from_slice(&1i32.to_be_bytes());
            data.extend_from_slice(&((4 + value.len()) as u32).to_be_bytes());
            data.extend_from_slice(&(value.len() as u32).to_be_bytes());
            data.extend_from_slice(value);
        }
        ValueHolder::Array(values) => {
            data.extend_from_slice(&(values.len() as i32).to_be_bytes());
            let array_len: usize = values.iter().map(|v| 4 + v.len()).sum();
            data.extend_from_slice(&(array_len as u32).to_be_bytes());
            for value in values {
                data.extend_from_slice(&(value.len() as u32).to_be_bytes());
                data.extend_from_slice(value);
            }
        }
        ValueHolder::SubTree { header_offset, count } => {
            // -(count + 1) keeps zero unambiguous.
            data.extend_from_slice(&(-((*count as i64) + 1) as i32).to_be_bytes());
            data.extend_from_slice(&header_offset.to_be_bytes());
        }
    }
}

/// Reads and deserializes the page chain starting at `offset`.
///
/// # Errors
///
/// Returns [`crate::Error::Corrupted`] when the payload does not parse
/// as a page, plus the usual offset errors.
pub(crate) fn read_page<B: StorageBackend>(
    pager: &Pager<B>,
    offset: PageOffset,
) -> Result<TreePage> {
    let pages = pager.read_chain(offset, u64::MAX)?;
    let last_offset = pages[pages.len() - 1].offset();
    let mut reader = ChainReader::new(&pages, pager.page_size());

    let revision = reader.read_u64()?;
    let count = reader.read_i32()?;
    let _data_size = reader.read_u32()?;

    if count >= 0 {
        let mut leaf = Leaf::empty(revision);
        leaf.offset = offset;
        leaf.last_offset = last_offset;
        for _ in 0..count {
            let (holder, key) = read_entry(&mut reader)?;
            leaf.keys.push(key);
            leaf.values.push(holder);
        }
        Ok(TreePage::Leaf(leaf))
    } else {
        let nb_children = (-count) as usize;
        snafu::ensure!(
            nb_children >= 2,
            CorruptedSnafu { reason: format!("node at {offset:#x} with {nb_children} children") }
        );
        let mut node = Node {
            revision,
            offset,
            last_offset,
            keys: Vec::with_capacity(nb_children - 1),
            children: Vec::with_capacity(nb_children),
        };
        for _ in 0..nb_children - 1 {
            node.children.push(read_child(&mut reader)?);
            node.keys.push(reader.read_bytes()?);
        }
        node.children.push(read_child(&mut reader)?);
        Ok(TreePage::Node(node))
    }
}

fn read_child(reader: &mut ChainReader<'_>) -> Result<ChildRef> {
    let offset = reader.read_u64()?;
    let last_offset = reader.read_u64()?;
    Ok(ChildRef::Unresolved { offset, last_offset })
}

fn read_entry(reader: &mut ChainReader<'_>) -> Result<(ValueHolder, Vec<u8>)> {
    let nb_values = reader.read_i32()?;
    let holder = if nb_values < 0 {
        let header_offset = reader.read_u64()?;
        ValueHolder::SubTree { header_offset, count: ((-(nb_values as i64)) - 1) as u64 }
    } else {
        let array_len = reader.read_u32()?;
        let mut values = Vec::with_capacity(nb_values as usize);
        let mut consumed = 0u32;
        for _ in 0..nb_values {
            let value = reader.read_bytes()?;
            consumed += 4 + value.len() as u32;
            values.push(value);
        }
        snafu::ensure!(
            consumed == array_len,
            CorruptedSnafu {
                reason: format!("value array length mismatch: {consumed} != {array_len}")
            }
        );
        match values.len() {
            1 => ValueHolder::Single(values.pop().unwrap()),
            _ => ValueHolder::Array(values),
        }
    };
    let key = reader.read_bytes()?;
    Ok((holder, key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InMemoryBackend;
    use crate::error::NO_PAGE;

    fn pager() -> Pager<InMemoryBackend> {
        let backend = InMemoryBackend::new();
        backend.write_all_at(&[0u8; 64], 0).unwrap();
        Pager::new(backend, 64, NO_PAGE, 64)
    }

    #[test]
    fn empty_leaf_round_trip() {
        let pager = pager();
        let mut page = TreePage::Leaf(Leaf::empty(3));
        let re = write_page(&pager, &mut page).unwrap();

        match read_page(&pager, re.offset).unwrap() {
            TreePage::Leaf(leaf) => {
                assert_eq!(leaf.revision, 3);
                assert!(leaf.keys.is_empty());
                assert_eq!(leaf.offset, re.offset);
            }
            TreePage::Node(_) => panic!("expected a leaf"),
        }
    }

    #[test]
    fn leaf_round_trip_spanning_pages() {
        let pager = pager();
        let mut leaf = Leaf::empty(9);
        for i in 0..6u8 {
            leaf.keys.push(vec![i; 10]);
            leaf.values.push(ValueHolder::Single(vec![i + 100; 7]));
        }
        let mut page = TreePage::Leaf(leaf);
        let re = write_page(&pager, &mut page).unwrap();
        // 6 entries at 29 bytes each do not fit one 64-byte page.
        assert_ne!(re.offset, re.last_offset);

        match read_page(&pager, re.offset).unwrap() {
            TreePage::Leaf(read) => {
                assert_eq!(read.revision, 9);
                assert_eq!(read.keys.len(), 6);
                assert_eq!(read.keys[4], vec![4; 10]);
                match &read.values[4] {
                    ValueHolder::Single(v) => assert_eq!(v, &vec![104; 7]),
                    other => panic!("expected single value, got {other:?}"),
                }
                assert_eq!(read.last_offset, re.last_offset);
            }
            TreePage::Node(_) => panic!("expected a leaf"),
        }
    }

    #[test]
    fn node_round_trip() {
        let pager = pager();
        let node = Node {
            revision: 5,
            offset: NO_PAGE,
            last_offset: NO_PAGE,
            keys: vec![b"m".to_vec()],
            children: vec![
                ChildRef::Unresolved { offset: 0x40, last_offset: 0x40 },
                ChildRef::Unresolved { offset: 0x80, last_offset: 0xC0 },
            ],
        };
        let mut page = TreePage::Node(node.clone());
        let re = write_page(&pager, &mut page).unwrap();

        match read_page(&pager, re.offset).unwrap() {
            TreePage::Node(read) => {
                assert_eq!(read.revision, 5);
                assert_eq!(read.keys, node.keys);
                assert_eq!(read.children[0].location().offset, 0x40);
                assert_eq!(read.children[1].location().offset, 0x80);
                assert_eq!(read.children[1].location().last_offset, 0xC0);
            }
            TreePage::Leaf(_) => panic!("expected a node"),
        }
    }

    #[test]
    fn duplicate_holders_round_trip() {
        let pager = pager();
        let mut leaf = Leaf::empty(2);
        leaf.keys.push(b"arr".to_vec());
        leaf.values.push(ValueHolder::Array(vec![vec![1], vec![2], vec![3]]));
        leaf.keys.push(b"sub".to_vec());
        leaf.values.push(ValueHolder::SubTree { header_offset: 0x1C0, count: 12 });

        let mut page = TreePage::Leaf(leaf);
        let re = write_page(&pager, &mut page).unwrap();

        match read_page(&pager, re.offset).unwrap() {
            TreePage::Leaf(read) => {
                match &read.values[0] {
                    ValueHolder::Array(vs) => assert_eq!(vs.len(), 3),
                    other => panic!("expected array, got {other:?}"),
                }
                match &read.values[1] {
                    ValueHolder::SubTree { header_offset, count } => {
                        assert_eq!(*header_offset, 0x1C0);
                        assert_eq!(*count, 12);
                    }
                    other => panic!("expected sub-tree, got {other:?}"),
                }
            }
            TreePage::Node(_) => panic!("expected a leaf"),
        }
    }

    #[test]
    fn unwritten_child_is_rejected() {
        let pager = pager();
        let mut page = TreePage::Node(Node {
            revision: 1,
            offset: NO_PAGE,
            last_offset: NO_PAGE,
            keys: vec![b"k".to_vec()],
            children: vec![
                ChildRef::Resolved(Box::new(TreePage::Leaf(Leaf::empty(1)))),
                ChildRef::Unresolved { offset: 0x40, last_offset: 0x40 },
            ],
        });
        assert!(write_page(&pager, &mut page).is_err());
    }
}
