//! Copy-on-write B+tree.
//!
//! The tree never mutates a written page: every insert or delete
//! copies the touched pages under a fresh revision, writes the copies
//! into newly allocated page chains, and finishes by writing a new
//! BTreeHeader record pointing at the new root. Old pages stay
//! readable until their revision is retired, which is what gives
//! readers stable snapshots at any retained revision.
//!
//! ## Structure
//!
//! - `node.rs`: in-memory leaf and node model, holders, search
//! - `io.rs`: page (de)serialization over `PageIo` chains
//! - `insert.rs`: copy-on-write insertion and page splits
//! - `delete.rs`: copy-on-write deletion, borrow and merge rebalancing
//! - `cursor.rs`: ordered lazy iteration

pub(crate) mod cursor;
pub(crate) mod delete;
pub(crate) mod insert;
pub(crate) mod io;
pub(crate) mod node;

use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::{Mutex, RwLock};

use self::node::{PageRef, TreePage, ValueHolder};
use crate::{
    backend::StorageBackend,
    error::{CorruptedSnafu, PageOffset, Result, NO_PAGE},
    page::{ChainReader, ChainWriter, Pager},
    types::{comparator_for, KeyCmp},
};

/// Default maximum number of entries per page.
pub const DEFAULT_FANOUT: usize = 16;

/// Smallest accepted fan-out.
pub const MIN_FANOUT: usize = 4;

/// Duplicate values per key kept inline before spilling to a sub-tree.
pub(crate) const DUP_INLINE_THRESHOLD: usize = 8;

/// One revision of a tree: the on-disk BTreeHeader record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct BTreeHeader {
    /// Revision this header describes.
    pub revision: u64,
    /// Number of stored values at this revision.
    pub nb_elems: u64,
    /// Chain offset of the root page.
    pub root_offset: PageOffset,
    /// Chain offset of the immutable BTreeInfo record.
    pub info_offset: PageOffset,
    /// Chain offset of this header record itself.
    pub header_offset: PageOffset,
}

/// Immutable per-tree descriptor, written once when the tree is managed.
#[derive(Debug, Clone)]
pub(crate) struct BTreeInfo {
    /// Maximum entries per page (power of two).
    pub fanout: usize,
    /// Tree name.
    pub name: String,
    /// Identifier of the key codec.
    pub key_codec: String,
    /// Identifier of the value codec.
    pub value_codec: String,
    /// Whether one key may hold several values.
    pub allow_duplicates: bool,
}

/// Writes a BTreeHeader record and returns its chain offset.
pub(crate) fn write_tree_header<B: StorageBackend>(
    pager: &Pager<B>,
    revision: u64,
    nb_elems: u64,
    root_offset: PageOffset,
    info_offset: PageOffset,
) -> Result<PageOffset> {
    let mut pages = pager.reserve(8 * 4)?;
    {
        let mut writer = ChainWriter::new(&mut pages, pager.page_size());
        writer.write_u64(revision)?;
        writer.write_u64(nb_elems)?;
        writer.write_u64(root_offset)?;
        writer.write_u64(info_offset)?;
    }
    pager.flush(&pages)?;
    Ok(pages[0].offset())
}

/// Reads a BTreeHeader record.
pub(crate) fn read_tree_header<B: StorageBackend>(
    pager: &Pager<B>,
    offset: PageOffset,
) -> Result<BTreeHeader> {
    let pages = pager.read_chain(offset, 8 * 4)?;
    let mut reader = ChainReader::new(&pages, pager.page_size());
    let header = BTreeHeader {
        revision: reader.read_u64()?,
        nb_elems: reader.read_u64()?,
        root_offset: reader.read_u64()?,
        info_offset: reader.read_u64()?,
        header_offset: offset,
    };
    pager.check_offset(header.root_offset)?;
    pager.check_offset(header.info_offset)?;
    Ok(header)
}

/// Writes a BTreeInfo record and returns its chain offset.
pub(crate) fn write_tree_info<B: StorageBackend>(
    pager: &Pager<B>,
    info: &BTreeInfo,
) -> Result<PageOffset> {
    let total = 4
        + (4 + info.name.len())
        + (4 + info.key_codec.len())
        + (4 + info.value_codec.len())
        + 4;
    let mut pages = pager.reserve(total)?;
    {
        let mut writer = ChainWriter::new(&mut pages, pager.page_size());
        writer.write_u32(info.fanout as u32)?;
        writer.write_bytes(info.name.as_bytes())?;
        writer.write_bytes(info.key_codec.as_bytes())?;
        writer.write_bytes(info.value_codec.as_bytes())?;
        writer.write_u32(info.allow_duplicates as u32)?;
    }
    pager.flush(&pages)?;
    Ok(pages[0].offset())
}

/// Reads a BTreeInfo record.
pub(crate) fn read_tree_info<B: StorageBackend>(
    pager: &Pager<B>,
    offset: PageOffset,
) -> Result<BTreeInfo> {
    let pages = pager.read_chain(offset, u64::MAX)?;
    let mut reader = ChainReader::new(&pages, pager.page_size());

    let fanout = reader.read_u32()? as usize;
    snafu::ensure!(
        fanout.is_power_of_two() && fanout >= MIN_FANOUT,
        CorruptedSnafu { reason: format!("tree fan-out {fanout} is not a power of two >= 4") }
    );
    let name = String::from_utf8(reader.read_bytes()?)
        .map_err(|_| crate::Error::Corrupted { reason: "tree name is not UTF-8".into() })?;
    let key_codec = String::from_utf8(reader.read_bytes()?)
        .map_err(|_| crate::Error::Corrupted { reason: "key codec id is not UTF-8".into() })?;
    let value_codec = String::from_utf8(reader.read_bytes()?)
        .map_err(|_| crate::Error::Corrupted { reason: "value codec id is not UTF-8".into() })?;
    let allow_duplicates = reader.read_u32()? != 0;

    Ok(BTreeInfo { fanout, name, key_codec, value_codec, allow_duplicates })
}

/// Shared context for one copy-on-write mutation.
pub(crate) struct OpCtx<'a, B: StorageBackend> {
    pub pager: &'a Pager<B>,
    /// Orders the tree's encoded keys.
    pub cmp: KeyCmp,
    /// Orders encoded values in duplicate holders and sub-trees.
    pub vcmp: KeyCmp,
    pub allow_dups: bool,
    pub fanout: usize,
    /// Revision stamped on every page this mutation creates.
    pub revision: u64,
    /// BTreeInfo offset, shared with duplicate sub-tree headers.
    pub info_offset: PageOffset,
    /// First offsets of prior-revision chains this mutation shadowed.
    pub shadowed: Vec<PageOffset>,
    /// Chains this mutation wrote and then replaced within the same
    /// revision (duplicate sub-tree construction). They belong to no
    /// revision and are always freed at commit.
    pub transient: Vec<PageOffset>,
}

impl<'a, B: StorageBackend> OpCtx<'a, B> {
    /// Fetches and deserializes the page chain at `offset`.
    pub(crate) fn load(&self, offset: PageOffset) -> Result<TreePage> {
        io::read_page(self.pager, offset)
    }

    /// Serializes `page` into fresh chain pages and flushes them.
    pub(crate) fn write(&self, page: &mut TreePage) -> Result<PageRef> {
        io::write_page(self.pager, page)
    }

    /// Records a page as shadowed if it lives on disk. A page the
    /// running mutation itself wrote (same revision stamp) never
    /// belonged to a committed revision and goes to the transient
    /// list instead.
    pub(crate) fn shadow(&mut self, page: &TreePage) {
        if page.offset() == NO_PAGE {
            return;
        }
        if page.revision() == self.revision {
            self.transient.push(page.offset());
        } else {
            self.shadowed.push(page.offset());
        }
    }

    /// Context for operations inside a duplicate-values sub-tree: the
    /// value comparator becomes the key comparator and duplicates are
    /// off (the sub-tree's keys are the values themselves).
    pub(crate) fn sub(&self) -> OpCtx<'a, B> {
        OpCtx {
            pager: self.pager,
            cmp: self.vcmp.clone(),
            vcmp: self.vcmp.clone(),
            allow_dups: false,
            fanout: self.fanout,
            revision: self.revision,
            info_offset: self.info_offset,
            shadowed: Vec::new(),
            transient: Vec::new(),
        }
    }
}

/// Outcome of an engine-level mutation.
pub(crate) enum TreeWrite {
    /// Nothing changed on disk: the key was absent (delete) or the
    /// value already present (insert). `old` carries the existing
    /// value for the insert case.
    Unchanged { old: Option<Vec<u8>> },
    /// A new revision was written.
    Applied(AppliedWrite),
}

/// Details of a written revision, consumed by the record manager to
/// register the revision and dispose of the shadowed pages.
pub(crate) struct AppliedWrite {
    /// Value replaced by an insert, if any.
    pub old: Option<Vec<u8>>,
    /// Entry removed by a delete, if any: `(key, first value)`.
    pub removed: Option<(Vec<u8>, Vec<u8>)>,
    /// The freshly created revision.
    pub revision: u64,
    /// The revision this write superseded.
    pub old_revision: u64,
    /// Header chain of the superseded revision.
    pub old_header_offset: PageOffset,
    /// Header chain of the new revision.
    pub new_header_offset: PageOffset,
    /// First offsets of the prior-revision chains this write shadowed.
    pub shadowed: Vec<PageOffset>,
    /// Same-revision churn chains; always freed at commit, never
    /// registered for a retained revision.
    pub transient: Vec<PageOffset>,
}

/// One managed B+tree: its descriptor plus the committed and
/// in-transaction header state. Pages borrow the tree read-only
/// through the comparators; the tree owns nothing but metadata.
pub(crate) struct TreeCore {
    /// Tree name (also in `info`, duplicated for cheap access).
    pub name: String,
    /// Immutable descriptor.
    pub info: BTreeInfo,
    /// Chain offset of the descriptor record.
    pub info_offset: PageOffset,
    /// Header visible to readers, swapped at commit.
    committed: ArcSwap<BTreeHeader>,
    /// Header produced by the running transaction, if any.
    working: Mutex<Option<Arc<BTreeHeader>>>,
    /// Key comparator. Trees loaded from disk start with the
    /// registry comparator for their codec id; attaching a typed
    /// handle swaps in the codec's own comparator.
    cmp: RwLock<KeyCmp>,
    /// Value comparator (orders duplicate values).
    vcmp: RwLock<KeyCmp>,
}

impl TreeCore {
    /// Creates a brand-new tree: writes its BTreeInfo, an empty root
    /// leaf and a revision-0 BTreeHeader.
    pub(crate) fn create<B: StorageBackend>(
        pager: &Pager<B>,
        info: BTreeInfo,
        cmp: KeyCmp,
        vcmp: KeyCmp,
    ) -> Result<Self> {
        let info_offset = write_tree_info(pager, &info)?;

        let mut root = TreePage::Leaf(node::Leaf::empty(0));
        let root_ref = io::write_page(pager, &mut root)?;
        let header_offset = write_tree_header(pager, 0, 0, root_ref.offset, info_offset)?;

        let header = BTreeHeader {
            revision: 0,
            nb_elems: 0,
            root_offset: root_ref.offset,
            info_offset,
            header_offset,
        };
        Ok(Self {
            name: info.name.clone(),
            info,
            info_offset,
            committed: ArcSwap::from_pointee(header),
            working: Mutex::new(None),
            cmp: RwLock::new(cmp),
            vcmp: RwLock::new(vcmp),
        })
    }

    /// Reconstructs a tree from its on-disk header chain, resolving
    /// comparators from the codec ids recorded in the BTreeInfo.
    pub(crate) fn load<B: StorageBackend>(
        pager: &Pager<B>,
        header_offset: PageOffset,
    ) -> Result<Self> {
        let header = read_tree_header(pager, header_offset)?;
        let info = read_tree_info(pager, header.info_offset)?;
        let cmp = comparator_for(&info.key_codec);
        let vcmp = comparator_for(&info.value_codec);
        Ok(Self {
            name: info.name.clone(),
            info_offset: header.info_offset,
            info,
            committed: ArcSwap::from_pointee(header),
            working: Mutex::new(None),
            cmp: RwLock::new(cmp),
            vcmp: RwLock::new(vcmp),
        })
    }

    /// Current key comparator.
    pub(crate) fn cmp(&self) -> KeyCmp {
        self.cmp.read().clone()
    }

    /// Current value comparator.
    pub(crate) fn vcmp(&self) -> KeyCmp {
        self.vcmp.read().clone()
    }

    /// Swaps in the comparators of an attaching typed handle.
    pub(crate) fn set_comparators(&self, cmp: KeyCmp, vcmp: KeyCmp) {
        *self.cmp.write() = cmp;
        *self.vcmp.write() = vcmp;
    }

    /// The committed header, as readers see it.
    pub(crate) fn current(&self) -> Arc<BTreeHeader> {
        self.committed.load_full()
    }

    /// The most recent header: the running transaction's working
    /// header when there is one, else the committed one.
    pub(crate) fn latest(&self) -> Arc<BTreeHeader> {
        self.working.lock().clone().unwrap_or_else(|| self.committed.load_full())
    }

    /// Replaces the working header.
    fn store_working(&self, header: BTreeHeader) {
        *self.working.lock() = Some(Arc::new(header));
    }

    /// Makes the working header the committed one. No-op without a
    /// working header.
    pub(crate) fn promote(&self) {
        if let Some(header) = self.working.lock().take() {
            self.committed.store(header);
        }
    }

    /// Drops the working header (rollback).
    pub(crate) fn discard(&self) {
        self.working.lock().take();
    }

    /// Point lookup against the given header snapshot.
    pub(crate) fn get<B: StorageBackend>(
        &self,
        pager: &Pager<B>,
        header: &BTreeHeader,
        key: &[u8],
    ) -> Result<Option<Vec<u8>>> {
        let cmp = self.cmp();
        let mut offset = header.root_offset;
        loop {
            match io::read_page(pager, offset)? {
                TreePage::Node(node) => {
                    let idx = node.child_index(&cmp, key);
                    offset = node.children[idx].location().offset;
                }
                TreePage::Leaf(leaf) => {
                    return match leaf.search(&cmp, key) {
                        Ok(idx) => Ok(Some(first_value(pager, &leaf.values[idx])?)),
                        Err(_) => Ok(None),
                    };
                }
            }
        }
    }

    /// Copy-on-write insert of `(key, value)` under a new revision.
    pub(crate) fn insert<B: StorageBackend>(
        &self,
        pager: &Pager<B>,
        key: &[u8],
        value: &[u8],
    ) -> Result<TreeWrite> {
        let header = self.latest();
        let mut ctx = self.op_ctx(pager, header.revision + 1);

        match insert::insert_rec(&mut ctx, header.root_offset, key, value)? {
            insert::InsertResult::ExistingValue { old } => {
                Ok(TreeWrite::Unchanged { old: Some(old) })
            }
            insert::InsertResult::Modified { mut page, old, added } => {
                let root = ctx.write(&mut page)?;
                let delta = i64::from(added);
                self.finish(pager, ctx, root, &header, delta, old, None)
            }
            insert::InsertResult::Split { pivot, mut left, mut right } => {
                let left_ref = ctx.write(&mut left)?;
                let right_ref = ctx.write(&mut right)?;
                let mut root = TreePage::Node(node::Node {
                    revision: ctx.revision,
                    offset: NO_PAGE,
                    last_offset: NO_PAGE,
                    keys: vec![pivot],
                    children: vec![left_ref.into(), right_ref.into()],
                });
                let root = ctx.write(&mut root)?;
                self.finish(pager, ctx, root, &header, 1, None, None)
            }
        }
    }

    /// Copy-on-write delete of `key` under a new revision. Removing a
    /// duplicate-bearing key drops all of its values.
    pub(crate) fn delete<B: StorageBackend>(
        &self,
        pager: &Pager<B>,
        key: &[u8],
    ) -> Result<TreeWrite> {
        let header = self.latest();
        let mut ctx = self.op_ctx(pager, header.revision + 1);

        match delete::delete_rec(&mut ctx, header.root_offset, key, None)? {
            delete::DeleteResult::NotPresent => Ok(TreeWrite::Unchanged { old: None }),
            delete::DeleteResult::Removed { mut page, removed, .. } => {
                let root = match page {
                    // A root node left with a single child shrinks the
                    // tree by one level: the surviving child is the new
                    // root and the emptied node is never written.
                    TreePage::Node(ref n) if n.keys.is_empty() => n.children[0].location(),
                    ref mut other => ctx.write(other)?,
                };
                let delta = -(removed.nb_values as i64);
                let tuple = Some((removed.key, removed.value));
                self.finish(pager, ctx, root, &header, delta, None, tuple)
            }
            // The root has no siblings, so borrow and merge outcomes
            // cannot surface here.
            _ => CorruptedSnafu { reason: "rebalancing outcome at the root".to_string() }.fail(),
        }
    }

    fn op_ctx<'a, B: StorageBackend>(&self, pager: &'a Pager<B>, revision: u64) -> OpCtx<'a, B> {
        OpCtx {
            pager,
            cmp: self.cmp(),
            vcmp: self.vcmp(),
            allow_dups: self.info.allow_duplicates,
            fanout: self.info.fanout,
            revision,
            info_offset: self.info_offset,
            shadowed: Vec::new(),
            transient: Vec::new(),
        }
    }

    /// Writes the new BTreeHeader, installs it as the working header
    /// and packages everything the record manager needs.
    fn finish<B: StorageBackend>(
        &self,
        pager: &Pager<B>,
        ctx: OpCtx<'_, B>,
        root: PageRef,
        old_header: &BTreeHeader,
        delta: i64,
        old: Option<Vec<u8>>,
        removed: Option<(Vec<u8>, Vec<u8>)>,
    ) -> Result<TreeWrite> {
        let nb_elems = old_header.nb_elems.checked_add_signed(delta).unwrap_or(0);
        let new_header_offset =
            write_tree_header(pager, ctx.revision, nb_elems, root.offset, self.info_offset)?;

        self.store_working(BTreeHeader {
            revision: ctx.revision,
            nb_elems,
            root_offset: root.offset,
            info_offset: self.info_offset,
            header_offset: new_header_offset,
        });

        Ok(TreeWrite::Applied(AppliedWrite {
            old,
            removed,
            revision: ctx.revision,
            old_revision: old_header.revision,
            old_header_offset: old_header.header_offset,
            new_header_offset,
            shadowed: ctx.shadowed,
            transient: ctx.transient,
        }))
    }
}

/// Materializes the first (smallest) value of a holder. For sub-tree
/// holders this descends the sub-tree's leftmost path.
pub(crate) fn first_value<B: StorageBackend>(
    pager: &Pager<B>,
    holder: &ValueHolder,
) -> Result<Vec<u8>> {
    match holder {
        ValueHolder::Single(value) => Ok(value.clone()),
        ValueHolder::Array(values) => values.first().cloned().ok_or_else(|| {
            crate::Error::Corrupted { reason: "empty duplicate value array".into() }
        }),
        ValueHolder::SubTree { header_offset, .. } => {
            let header = read_tree_header(pager, *header_offset)?;
            leftmost_key(pager, header.root_offset)?.ok_or_else(|| crate::Error::BTreeCreation {
                reason: format!("empty duplicate sub-tree at {header_offset:#x}"),
            })
        }
    }
}

/// Smallest key of the subtree rooted at `root_offset`, or `None` for
/// an empty root leaf.
pub(crate) fn leftmost_key<B: StorageBackend>(
    pager: &Pager<B>,
    root_offset: PageOffset,
) -> Result<Option<Vec<u8>>> {
    let mut offset = root_offset;
    loop {
        match io::read_page(pager, offset)? {
            TreePage::Node(node) => offset = node.children[0].location().offset,
            TreePage::Leaf(leaf) => return Ok(leaf.keys.first().cloned()),
        }
    }
}

/// Collects the chain-first offsets of every page reachable from
/// `root_offset`, including duplicate sub-tree headers and pages.
/// Used when a whole subtree is released at once.
pub(crate) fn collect_tree_pages<B: StorageBackend>(
    pager: &Pager<B>,
    root_offset: PageOffset,
    out: &mut Vec<PageOffset>,
) -> Result<()> {
    out.push(root_offset);
    match io::read_page(pager, root_offset)? {
        TreePage::Node(node) => {
            for child in &node.children {
                collect_tree_pages(pager, child.location().offset, out)?;
            }
        }
        TreePage::Leaf(leaf) => {
            for holder in &leaf.values {
                if let ValueHolder::SubTree { header_offset, .. } = holder {
                    out.push(*header_offset);
                    let header = read_tree_header(pager, *header_offset)?;
                    collect_tree_pages(pager, header.root_offset, out)?;
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InMemoryBackend;
    use crate::error::NO_PAGE;

    fn test_pager() -> Pager<InMemoryBackend> {
        let backend = InMemoryBackend::new();
        backend.write_all_at(&[0u8; 64], 0).unwrap();
        Pager::new(backend, 64, NO_PAGE, 64)
    }

    fn bytes_info(fanout: usize) -> BTreeInfo {
        BTreeInfo {
            fanout,
            name: "t".to_string(),
            key_codec: "bytes".to_string(),
            value_codec: "bytes".to_string(),
            allow_duplicates: false,
        }
    }

    fn bytes_core(pager: &Pager<InMemoryBackend>, fanout: usize) -> TreeCore {
        TreeCore::create(pager, bytes_info(fanout), comparator_for("bytes"), comparator_for("bytes"))
            .unwrap()
    }

    fn applied(write: TreeWrite) -> AppliedWrite {
        match write {
            TreeWrite::Applied(applied) => applied,
            TreeWrite::Unchanged { .. } => panic!("expected an applied write"),
        }
    }

    #[test]
    fn tree_header_record_round_trip() {
        let pager = test_pager();
        let mut root = TreePage::Leaf(node::Leaf::empty(0));
        let root_ref = io::write_page(&pager, &mut root).unwrap();
        let info_offset = write_tree_info(&pager, &bytes_info(8)).unwrap();

        let offset = write_tree_header(&pager, 7, 42, root_ref.offset, info_offset).unwrap();
        let header = read_tree_header(&pager, offset).unwrap();

        assert_eq!(header.revision, 7);
        assert_eq!(header.nb_elems, 42);
        assert_eq!(header.root_offset, root_ref.offset);
        assert_eq!(header.info_offset, info_offset);
        assert_eq!(header.header_offset, offset);
    }

    #[test]
    fn tree_header_rejects_a_misaligned_root() {
        let pager = test_pager();
        // 0x33 is neither aligned nor the sentinel.
        let offset = write_tree_header(&pager, 1, 0, 0x33, 64).unwrap();
        assert!(matches!(
            read_tree_header(&pager, offset),
            Err(crate::Error::InvalidOffset { .. })
        ));
    }

    #[test]
    fn tree_info_record_round_trip() {
        let pager = test_pager();
        let info = BTreeInfo {
            fanout: 16,
            name: "people".to_string(),
            key_codec: "u64".to_string(),
            value_codec: "bytes".to_string(),
            allow_duplicates: true,
        };

        let offset = write_tree_info(&pager, &info).unwrap();
        let read = read_tree_info(&pager, offset).unwrap();

        assert_eq!(read.fanout, 16);
        assert_eq!(read.name, "people");
        assert_eq!(read.key_codec, "u64");
        assert_eq!(read.value_codec, "bytes");
        assert!(read.allow_duplicates);
    }

    #[test]
    fn tree_info_rejects_a_broken_fanout() {
        let pager = test_pager();
        // Six is not a power of two; the writer does not police it
        // (creation does), the reader must.
        let offset = write_tree_info(&pager, &bytes_info(6)).unwrap();
        assert!(matches!(read_tree_info(&pager, offset), Err(crate::Error::Corrupted { .. })));
    }

    #[test]
    fn created_tree_loads_back_from_its_header() {
        let pager = test_pager();
        let core = bytes_core(&pager, 4);

        let loaded = TreeCore::load(&pager, core.current().header_offset).unwrap();
        assert_eq!(loaded.name, "t");
        assert_eq!(loaded.info.fanout, 4);
        assert_eq!(loaded.info_offset, core.info_offset);
        assert_eq!(*loaded.current(), *core.current());
        assert_eq!(loaded.current().revision, 0);
    }

    #[test]
    fn working_header_stays_invisible_until_promoted() {
        let pager = test_pager();
        let core = bytes_core(&pager, 4);

        applied(core.insert(&pager, b"k", b"v").unwrap());
        assert_eq!(core.current().revision, 0, "readers still see the committed state");
        assert_eq!(core.latest().revision, 1, "the writer sees its own revision");

        core.promote();
        assert_eq!(core.current().revision, 1);

        applied(core.insert(&pager, b"l", b"w").unwrap());
        core.discard();
        assert_eq!(core.latest().revision, 1, "a discarded revision leaves no trace");
    }

    #[test]
    fn insert_get_delete_drive_the_whole_stack() {
        let pager = test_pager();
        let core = bytes_core(&pager, 4);

        let first = applied(core.insert(&pager, b"k", b"v").unwrap());
        assert_eq!(first.revision, 1);
        assert_eq!(first.old_revision, 0);
        assert!(first.old.is_none());
        // The empty root leaf was copied away.
        assert!(!first.shadowed.is_empty());

        assert_eq!(core.get(&pager, &core.latest(), b"k").unwrap(), Some(b"v".to_vec()));
        assert_eq!(core.get(&pager, &core.latest(), b"z").unwrap(), None);

        // Same value again: no new revision.
        match core.insert(&pager, b"k", b"v").unwrap() {
            TreeWrite::Unchanged { old } => assert_eq!(old, Some(b"v".to_vec())),
            TreeWrite::Applied(_) => panic!("identical insert must not write"),
        }

        let removed = applied(core.delete(&pager, b"k").unwrap());
        assert_eq!(removed.removed, Some((b"k".to_vec(), b"v".to_vec())));
        assert_eq!(core.latest().nb_elems, 0);

        match core.delete(&pager, b"k").unwrap() {
            TreeWrite::Unchanged { old } => assert!(old.is_none()),
            TreeWrite::Applied(_) => panic!("deleting an absent key must not write"),
        }
    }

    #[test]
    fn fifth_insert_grows_a_root_node() {
        let pager = test_pager();
        let core = bytes_core(&pager, 4);

        for key in [b"a", b"b", b"c", b"d", b"e"] {
            applied(core.insert(&pager, key, b"v").unwrap());
        }
        assert_eq!(core.latest().nb_elems, 5);

        match io::read_page(&pager, core.latest().root_offset).unwrap() {
            TreePage::Node(root) => {
                assert_eq!(root.keys, vec![b"d".to_vec()]);
                assert_eq!(root.children.len(), 2);
            }
            TreePage::Leaf(_) => panic!("five keys at fan-out four need a root node"),
        }

        // Root and both leaves: three reachable chains.
        let mut pages = Vec::new();
        collect_tree_pages(&pager, core.latest().root_offset, &mut pages).unwrap();
        assert_eq!(pages.len(), 3);
    }

    #[test]
    fn root_merge_shrinks_the_tree_back_to_a_leaf() {
        let pager = test_pager();
        let core = bytes_core(&pager, 4);

        for key in [b"a", b"b", b"c", b"d", b"e"] {
            applied(core.insert(&pager, key, b"v").unwrap());
        }
        applied(core.delete(&pager, b"a").unwrap());
        applied(core.delete(&pager, b"b").unwrap());

        match io::read_page(&pager, core.latest().root_offset).unwrap() {
            TreePage::Leaf(root) => {
                assert_eq!(root.keys, vec![b"c".to_vec(), b"d".to_vec(), b"e".to_vec()]);
            }
            TreePage::Node(_) => panic!("the surviving child must become the root"),
        }
        assert_eq!(core.latest().nb_elems, 3);
    }

    #[test]
    fn leftmost_key_and_first_value_helpers() {
        let pager = test_pager();
        let core = bytes_core(&pager, 4);

        assert_eq!(leftmost_key(&pager, core.latest().root_offset).unwrap(), None);

        applied(core.insert(&pager, b"m", b"mv").unwrap());
        applied(core.insert(&pager, b"a", b"av").unwrap());
        assert_eq!(
            leftmost_key(&pager, core.latest().root_offset).unwrap(),
            Some(b"a".to_vec())
        );

        let single = ValueHolder::Single(b"only".to_vec());
        assert_eq!(first_value(&pager, &single).unwrap(), b"only".to_vec());
        let array = ValueHolder::Array(vec![b"first".to_vec(), b"second".to_vec()]);
        assert_eq!(first_value(&pager, &array).unwrap(), b"first".to_vec());
    }
}
