//! Whole-file integrity checker.
//!
//! Walks the store from the on-disk header and verifies that every
//! page is accounted for exactly once: it marks the free list, then
//! every page reachable from a live BTreeHeader (pages shared between
//! retained revisions are visited once), and finally asserts that the
//! free and live sets are disjoint and together cover the file. Along
//! the way it re-parses each BTreeHeader and BTreeInfo, checks key
//! ordering and occupancy bounds inside every page, and validates the
//! separator invariant between nodes and their subtrees.
//!
//! The checker reads the committed state from disk; run it outside of
//! a write transaction.

use std::collections::HashMap;

use crate::{
    backend::StorageBackend,
    btree::{
        io,
        node::{TreePage, ValueHolder},
        read_tree_header, read_tree_info,
    },
    error::{FreePageSnafu, InvalidBTreeSnafu, PageOffset, Result, NO_PAGE},
    page::Pager,
    recman::{RawHeader, RecordManager},
    types::{comparator_for, KeyCmp, KeyCodec, NameRevisionCodec},
};

/// Outcome of a successful integrity check.
#[derive(Debug, Clone)]
pub struct CheckReport {
    /// Data pages in the file (header page excluded).
    pub total_pages: u64,
    /// Pages on the free list.
    pub free_pages: u64,
    /// Pages reachable from live headers.
    pub live_pages: u64,
    /// BTreeHeaders walked (every revision of every tree, internal
    /// trees included).
    pub headers_checked: u64,
}

/// One bit per data page.
struct Bitmap {
    words: Vec<u64>,
    page_size: u64,
    total_pages: u64,
}

impl Bitmap {
    fn new(page_size: u64, total_pages: u64) -> Self {
        Self { words: vec![0; total_pages.div_ceil(64) as usize], page_size, total_pages }
    }

    fn slot(&self, offset: PageOffset) -> Result<(usize, u64)> {
        let index = offset / self.page_size;
        snafu::ensure!(
            index >= 1 && index <= self.total_pages && offset % self.page_size == 0,
            InvalidBTreeSnafu { reason: format!("offset {offset:#x} outside the data area") }
        );
        let page = index - 1;
        Ok(((page / 64) as usize, 1u64 << (page % 64)))
    }

    /// Sets the bit; returns true when it was already set.
    fn mark(&mut self, offset: PageOffset) -> Result<bool> {
        let (word, bit) = self.slot(offset)?;
        let seen = self.words[word] & bit != 0;
        self.words[word] |= bit;
        Ok(seen)
    }

    fn is_marked(&self, offset: PageOffset) -> Result<bool> {
        let (word, bit) = self.slot(offset)?;
        Ok(self.words[word] & bit != 0)
    }

    fn count(&self) -> u64 {
        self.words.iter().map(|w| w.count_ones() as u64).sum()
    }
}

struct Checker<'a, B: StorageBackend> {
    pager: &'a Pager<B>,
    free: Bitmap,
    live: Bitmap,
    headers_checked: u64,
}

/// Checks the whole store file.
pub(crate) fn check<B: StorageBackend>(rm: &RecordManager<B>) -> Result<CheckReport> {
    let pager = &rm.pager;
    let page_size = pager.page_size() as u64;

    // Re-read the header from disk; the check covers the committed state.
    let mut header_buf = vec![0u8; page_size as usize];
    pager.backend().read_exact_at(&mut header_buf, 0)?;
    let header = RawHeader::parse(&header_buf)?;

    snafu::ensure!(
        (header.page_size as u64).is_power_of_two() && header.page_size as u64 == page_size,
        InvalidBTreeSnafu { reason: format!("header page size {}", header.page_size) }
    );

    let total_pages = pager.total_pages();
    let mut checker = Checker {
        pager,
        free: Bitmap::new(page_size, total_pages),
        live: Bitmap::new(page_size, total_pages),
        headers_checked: 0,
    };

    // Free list first: acyclic, in bounds, no double entries.
    for offset in pager.walk_free_list()? {
        if checker.free.mark(offset)? {
            return FreePageSnafu { reason: format!("page {offset:#x} listed twice") }.fail();
        }
    }

    // The internal trees themselves.
    checker.walk_header(header.current_bob, None)?;
    checker.walk_header(header.current_cpb, None)?;
    if header.previous_bob != NO_PAGE {
        checker.walk_header(header.previous_bob, None)?;
    }
    if header.previous_cpb != NO_PAGE {
        checker.walk_header(header.previous_cpb, None)?;
    }

    // Every revision registered in the B-tree of B-trees, keeping
    // track of the newest one per name for the element-count check.
    let bob_header = read_tree_header(pager, header.current_bob)?;
    let mut newest: HashMap<String, (u64, PageOffset)> = HashMap::new();
    let mut names = 0u32;
    {
        let mut cursor = crate::btree::cursor::RawCursor::new(pager, bob_header.root_offset)?;
        while let Some((raw_key, raw_value)) = cursor.next_pair()? {
            let key = NameRevisionCodec.decode(&raw_key).ok_or_else(|| {
                crate::Error::InvalidBTree {
                    reason: "unreadable key in the B-tree of B-trees".into(),
                }
            })?;
            snafu::ensure!(
                raw_value.len() == 8,
                InvalidBTreeSnafu { reason: "B-tree of B-trees value is not an offset".to_string() }
            );
            let offset = u64::from_be_bytes(raw_value.try_into().unwrap());
            checker.walk_header(offset, None)?;

            match newest.entry(key.name) {
                std::collections::hash_map::Entry::Vacant(slot) => {
                    names += 1;
                    slot.insert((key.revision, offset));
                }
                std::collections::hash_map::Entry::Occupied(mut slot) => {
                    if key.revision >= slot.get().0 {
                        *slot.get_mut() = (key.revision, offset);
                    }
                }
            }
        }
    }
    snafu::ensure!(
        names == header.nb_trees,
        InvalidBTreeSnafu {
            reason: format!("{} trees registered, header says {}", names, header.nb_trees),
        }
    );

    // The newest revision of each tree must agree with its element count.
    for (name, (_, header_offset)) in &newest {
        let tree_header = read_tree_header(pager, *header_offset)?;
        let counted = count_values(pager, tree_header.root_offset)?;
        snafu::ensure!(
            counted == tree_header.nb_elems,
            InvalidBTreeSnafu {
                reason: format!(
                    "tree '{name}' holds {counted} values, header says {}",
                    tree_header.nb_elems
                ),
            }
        );
    }

    // Accounting: free and live are disjoint by construction (the live
    // walk refuses free pages); together they must cover the file.
    let free_pages = checker.free.count();
    let live_pages = checker.live.count();
    snafu::ensure!(
        free_pages + live_pages == total_pages,
        InvalidBTreeSnafu {
            reason: format!(
                "{} pages leaked ({} total, {} free, {} live)",
                total_pages - free_pages - live_pages,
                total_pages,
                free_pages,
                live_pages
            ),
        }
    );

    Ok(CheckReport {
        total_pages,
        free_pages,
        live_pages,
        headers_checked: checker.headers_checked,
    })
}

impl<'a, B: StorageBackend> Checker<'a, B> {
    /// Marks a page chain as live. Returns false when the chain was
    /// already visited (pages shared between retained revisions).
    fn mark_chain(&mut self, first: PageOffset) -> Result<bool> {
        if self.live.is_marked(first)? {
            return Ok(false);
        }
        for offset in self.pager.chain_offsets(first)? {
            snafu::ensure!(
                !self.free.is_marked(offset)?,
                InvalidBTreeSnafu { reason: format!("free page {offset:#x} is reachable") }
            );
            snafu::ensure!(
                !self.live.mark(offset)?,
                InvalidBTreeSnafu { reason: format!("page {offset:#x} belongs to two chains") }
            );
        }
        Ok(true)
    }

    /// Walks one BTreeHeader: the header chain, the BTreeInfo and the
    /// whole page tree under the root. For a duplicate-values sub-tree
    /// (whose header shares the owning tree's info record) the caller
    /// passes the fan-out and the value comparator its keys are
    /// ordered by.
    fn walk_header(
        &mut self,
        header_offset: PageOffset,
        sub_tree: Option<(usize, KeyCmp)>,
    ) -> Result<()> {
        if !self.mark_chain(header_offset)? {
            return Ok(());
        }
        self.headers_checked += 1;

        let header = read_tree_header(self.pager, header_offset)?;
        self.mark_chain(header.info_offset)?;
        let info = read_tree_info(self.pager, header.info_offset)?;
        let (fanout, cmp, vcmp) = match sub_tree {
            Some((fanout, vcmp)) => (fanout, vcmp.clone(), vcmp),
            None => (
                info.fanout,
                comparator_for(&info.key_codec),
                comparator_for(&info.value_codec),
            ),
        };

        self.walk_page(header.root_offset, fanout, &cmp, &vcmp, true)?;
        Ok(())
    }

    /// Walks one page and its subtree, verifying ordering, occupancy
    /// and the separator invariant. Returns the subtree's smallest
    /// key, or `None` for a subtree already visited or empty.
    fn walk_page(
        &mut self,
        offset: PageOffset,
        fanout: usize,
        cmp: &KeyCmp,
        vcmp: &KeyCmp,
        is_root: bool,
    ) -> Result<Option<Vec<u8>>> {
        if !self.mark_chain(offset)? {
            return Ok(None);
        }

        match io::read_page(self.pager, offset)? {
            TreePage::Leaf(leaf) => {
                self.check_ordering(&leaf.keys, cmp, offset)?;
                snafu::ensure!(
                    leaf.keys.len() <= fanout && (is_root || leaf.keys.len() >= fanout / 2),
                    InvalidBTreeSnafu {
                        reason: format!("leaf {offset:#x} holds {} entries", leaf.keys.len()),
                    }
                );
                for holder in &leaf.values {
                    if let ValueHolder::SubTree { header_offset, count } = holder {
                        let sub_header = read_tree_header(self.pager, *header_offset)?;
                        snafu::ensure!(
                            sub_header.nb_elems == *count,
                            InvalidBTreeSnafu {
                                reason: format!(
                                    "sub-tree at {header_offset:#x} holds {} values, slot says {count}",
                                    sub_header.nb_elems
                                ),
                            }
                        );
                        self.walk_header(*header_offset, Some((fanout, vcmp.clone())))?;
                    }
                }
                Ok(leaf.keys.first().cloned())
            }
            TreePage::Node(node) => {
                self.check_ordering(&node.keys, cmp, offset)?;
                snafu::ensure!(
                    node.children.len() <= fanout
                        && node.children.len() >= if is_root { 2 } else { fanout / 2 },
                    InvalidBTreeSnafu {
                        reason: format!("node {offset:#x} holds {} children", node.children.len()),
                    }
                );

                let mut subtree_min = None;
                for (i, child) in node.children.iter().enumerate() {
                    let child_min =
                        self.walk_page(child.location().offset, fanout, cmp, vcmp, false)?;
                    if i == 0 {
                        subtree_min = child_min;
                    } else if let Some(min) = child_min {
                        // A separator equals the smallest key of the
                        // subtree to its right.
                        snafu::ensure!(
                            cmp.compare(&node.keys[i - 1], &min) == std::cmp::Ordering::Equal,
                            InvalidBTreeSnafu {
                                reason: format!(
                                    "separator {i} of node {offset:#x} does not match its subtree"
                                ),
                            }
                        );
                    }
                }
                Ok(subtree_min)
            }
        }
    }

    fn check_ordering(&self, keys: &[Vec<u8>], cmp: &KeyCmp, offset: PageOffset) -> Result<()> {
        for pair in keys.windows(2) {
            snafu::ensure!(
                cmp.compare(&pair[0], &pair[1]) == std::cmp::Ordering::Less,
                InvalidBTreeSnafu { reason: format!("keys out of order in page {offset:#x}") }
            );
        }
        Ok(())
    }
}

/// Counts the values stored in the tree under `root_offset`,
/// regardless of what other revisions share its pages.
fn count_values<B: StorageBackend>(pager: &Pager<B>, root_offset: PageOffset) -> Result<u64> {
    match io::read_page(pager, root_offset)? {
        TreePage::Leaf(leaf) => Ok(leaf.values.iter().map(ValueHolder::count).sum()),
        TreePage::Node(node) => {
            let mut total = 0;
            for child in &node.children {
                total += count_values(pager, child.location().offset)?;
            }
            Ok(total)
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::backend::{InMemoryBackend, StorageBackend};
    use crate::recman::{RecordManager, StoreConfig};
    use crate::types::{BytesCodec, U64Codec};

    fn small_store() -> RecordManager<InMemoryBackend> {
        RecordManager::in_memory_with_config(StoreConfig { page_size: 64, sync_on_commit: false })
            .unwrap()
    }

    #[test]
    fn fresh_store_checks_clean() {
        let rm = small_store();
        let report = rm.check().unwrap();
        assert_eq!(report.free_pages + report.live_pages, report.total_pages);
        // BoB and CPB headers at least.
        assert!(report.headers_checked >= 2);
    }

    #[test]
    fn populated_store_accounts_for_every_page() {
        let rm = small_store();
        let tree = rm.add_tree("t", U64Codec, BytesCodec, false).unwrap();
        for i in 0..32u64 {
            tree.insert(&i, &format!("value-{i}").into_bytes()).unwrap();
        }
        for i in (0..32u64).step_by(3) {
            tree.delete(&i).unwrap();
        }

        let report = rm.check().unwrap();
        assert_eq!(report.free_pages + report.live_pages, report.total_pages);
        assert!(report.live_pages > 0);
    }

    #[test]
    fn leaked_page_is_detected() {
        let rm = small_store();
        let tree = rm.add_tree("t", U64Codec, BytesCodec, false).unwrap();
        tree.insert(&1, &b"a".to_vec()).unwrap();

        // Append a page that nothing references.
        let end = rm.pager.end_of_file();
        let mut orphan = vec![0u8; 64];
        orphan[0..8].copy_from_slice(&u64::MAX.to_be_bytes());
        rm.pager.backend().write_all_at(&orphan, end).unwrap();
        // Force the pager to acknowledge the larger file.
        let _ = rm.pager.allocate().unwrap();

        assert!(matches!(rm.check(), Err(crate::Error::InvalidBTree { .. })));
    }

    #[test]
    fn element_count_mismatch_is_detected() {
        let rm = small_store();
        let tree = rm.add_tree("t", U64Codec, BytesCodec, false).unwrap();
        for i in 0..3u64 {
            tree.insert(&i, &b"v".to_vec()).unwrap();
        }
        rm.check().unwrap();

        // Resolve the tree's newest header through the B-tree of
        // B-trees, then corrupt its element count in place. The count
        // is the second u64 of the header payload, which starts 12
        // bytes into the chain's first page.
        let mut buf = vec![0u8; 64];
        rm.pager.backend().read_exact_at(&mut buf, 0).unwrap();
        let raw = crate::recman::RawHeader::parse(&buf).unwrap();
        let bob_header = crate::btree::read_tree_header(&rm.pager, raw.current_bob).unwrap();
        let mut cursor =
            crate::btree::cursor::RawCursor::new(&rm.pager, bob_header.root_offset).unwrap();
        let (_, value) = cursor.next_pair().unwrap().unwrap();
        let header_offset = u64::from_be_bytes(value.try_into().unwrap());

        let mut field = [0u8; 8];
        rm.pager.backend().read_exact_at(&mut field, header_offset + 20).unwrap();
        let bogus = (u64::from_be_bytes(field) + 7).to_be_bytes();
        rm.pager.backend().write_all_at(&bogus, header_offset + 20).unwrap();

        assert!(matches!(rm.check(), Err(crate::Error::InvalidBTree { .. })));
    }
}
