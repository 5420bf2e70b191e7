//! The record manager: the engine's front door.
//!
//! One record manager owns one store file and every B+tree persisted
//! in it. Besides the user trees it maintains two internal trees with
//! the same lifecycle as the file: the *B-tree of B-trees* maps
//! `(name, revision)` to the matching BTreeHeader offset, and the
//! *CopiedPages B-tree* maps `(revision, name)` to the page chains
//! that revision shadowed, so retained revisions can be reclaimed
//! later.
//!
//! # Global header
//!
//! The first page of the file holds the record-manager header,
//! rewritten in place on commit:
//!
//! ```text
//! +--------------------------+
//! | pageSize                 | 4 bytes
//! +--------------------------+
//! | managedTreeCount         | 4 bytes (internal trees excluded)
//! +--------------------------+
//! | firstFreePage            | 8 bytes (-1 = empty free list)
//! +--------------------------+
//! | current BoB offset       | 8 bytes
//! +--------------------------+
//! | previous BoB offset      | 8 bytes (-1 once reclaimed)
//! +--------------------------+
//! | current CPB offset       | 8 bytes
//! +--------------------------+
//! | previous CPB offset      | 8 bytes (-1 once reclaimed)
//! +--------------------------+
//! ```
//!
//! # Commit protocol
//!
//! A transaction ends with a two-phase header rewrite: first the
//! header is written with the new roots while the `previous*` fields
//! still point at the pre-transaction internal trees, then the
//! shadowed pages join the free list, and finally the header is
//! rewritten with the `previous*` fields cleared. At any crash point
//! the file therefore shows either the pre-transaction state
//! (recoverable through the previous offsets) or the post-transaction
//! state; reordering these steps breaks that guarantee.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};

use parking_lot::{Condvar, Mutex, RwLock};

use crate::backend::{
    FileBackend, InMemoryBackend, StorageBackend, DEFAULT_PAGE_SIZE, MIN_PAGE_SIZE,
};
use crate::btree::{
    cursor::RawCursor, read_tree_header, AppliedWrite, BTreeHeader, BTreeInfo, TreeCore, TreeWrite,
    DEFAULT_FANOUT, MIN_FANOUT,
};
use crate::error::{
    AlreadyManagedSnafu, BTreeCreationSnafu, CorruptedSnafu, InvalidPageSizeSnafu, PageOffset,
    Result, NO_PAGE,
};
use crate::page::Pager;
use crate::types::{
    key_cmp_of, value_cmp_of, BytesCodec, KeyCodec, NameRevision, NameRevisionCodec,
    OffsetListCodec, RevisionName, RevisionNameCodec, U64Codec, ValueCodec,
};

/// File created when `open` is handed a directory.
const DEFAULT_FILE_NAME: &str = "vellum.db";

/// Name of the internal B-tree of B-trees.
const BOB_NAME: &str = "_btree_of_btrees_";

/// Name of the internal CopiedPages B-tree.
const CPB_NAME: &str = "_copied_pages_btree_";

/// Serialized size of the record-manager header fields.
const HEADER_FIELDS: usize = 4 + 4 + 8 + 8 + 8 + 8 + 8;

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Physical page size; fixed at file creation, power of two, at
    /// least 64 bytes.
    pub page_size: usize,
    /// Whether commits fsync around the header rewrites. Turning this
    /// off keeps the write *ordering* but leaves flushing to the OS.
    pub sync_on_commit: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self { page_size: DEFAULT_PAGE_SIZE, sync_on_commit: true }
    }
}

/// Per-tree options for [`RecordManager::add_tree_with`].
#[derive(Debug, Clone)]
pub struct TreeOptions {
    /// Maximum entries per page (power of two, at least 4).
    pub fanout: usize,
    /// Whether one key may carry several values.
    pub allow_duplicates: bool,
}

impl Default for TreeOptions {
    fn default() -> Self {
        Self { fanout: DEFAULT_FANOUT, allow_duplicates: false }
    }
}

/// Counters and size figures for one store.
#[derive(Debug, Clone)]
pub struct StoreStats {
    /// Physical page size.
    pub page_size: usize,
    /// Data pages in the file (header page excluded).
    pub total_pages: u64,
    /// Pages currently on the free list.
    pub free_pages: u64,
    /// User trees managed by this store.
    pub managed_trees: u32,
    /// Pages created by extending the file.
    pub nb_created_pages: u64,
    /// Pages recycled from the free list.
    pub nb_reused_pages: u64,
    /// Pages returned to the free list.
    pub nb_freed_pages: u64,
    /// Record-manager header rewrites.
    pub nb_header_updates: u64,
}

/// The parsed record-manager header.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RawHeader {
    pub page_size: u32,
    pub nb_trees: u32,
    pub first_free_page: PageOffset,
    pub current_bob: PageOffset,
    pub previous_bob: PageOffset,
    pub current_cpb: PageOffset,
    pub previous_cpb: PageOffset,
}

impl RawHeader {
    pub(crate) fn parse(buf: &[u8]) -> Result<Self> {
        snafu::ensure!(
            buf.len() >= HEADER_FIELDS,
            CorruptedSnafu { reason: "record-manager header too short".to_string() }
        );
        Ok(Self {
            page_size: u32::from_be_bytes(buf[0..4].try_into().unwrap()),
            nb_trees: u32::from_be_bytes(buf[4..8].try_into().unwrap()),
            first_free_page: u64::from_be_bytes(buf[8..16].try_into().unwrap()),
            current_bob: u64::from_be_bytes(buf[16..24].try_into().unwrap()),
            previous_bob: u64::from_be_bytes(buf[24..32].try_into().unwrap()),
            current_cpb: u64::from_be_bytes(buf[32..40].try_into().unwrap()),
            previous_cpb: u64::from_be_bytes(buf[40..48].try_into().unwrap()),
        })
    }
}

/// Trees and internal-tree roots, guarded by one `RwLock`. Readers
/// only take it to look a tree up; headers themselves live in the
/// `TreeCore`s and are read lock-free.
struct Directory {
    nb_trees: u32,
    current_bob: PageOffset,
    current_cpb: PageOffset,
    bob: Arc<TreeCore>,
    cpb: Arc<TreeCore>,
    trees: HashMap<String, Arc<TreeCore>>,
}

/// State of the reentrant writer lock.
#[derive(Default)]
struct TxnState {
    owner: Option<ThreadId>,
    depth: usize,
    snapshot: Option<TxnSnapshot>,
}

/// What the outermost `begin` captured, for the commit's previous
/// offsets and for rollback.
struct TxnSnapshot {
    bob_offset: PageOffset,
    cpb_offset: PageOffset,
    nb_trees: u32,
    created: Vec<String>,
}

/// Manages one store file and the B+trees inside it.
///
/// Writes are serialized by a reentrant transaction lock: nested
/// `begin`/`commit` pairs on the writer thread collapse into the
/// outermost commit. Readers never take that lock and run in parallel
/// with the writer against committed header snapshots.
pub struct RecordManager<B: StorageBackend = FileBackend> {
    pub(crate) pager: Pager<B>,
    config: StoreConfig,
    directory: RwLock<Directory>,
    txn: Mutex<TxnState>,
    txn_cv: Condvar,
    keep_revisions: AtomicBool,
    nb_header_updates: AtomicU64,
}

impl RecordManager<FileBackend> {
    /// Opens the store at `path`, creating the file on first open. A
    /// directory path gets the default file name appended.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Io`] on file errors and
    /// [`crate::Error::Corrupted`] when an existing file does not
    /// parse.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_config(path, StoreConfig::default())
    }

    /// Opens the store with an explicit configuration. The page size
    /// only applies to newly created files; an existing file keeps
    /// the page size it was created with.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::InvalidPageSize`] for a rejected page
    /// size, plus the errors of [`open`](Self::open).
    pub fn open_with_config(path: impl AsRef<Path>, config: StoreConfig) -> Result<Self> {
        let mut path = path.as_ref().to_path_buf();
        if path.is_dir() {
            path.push(DEFAULT_FILE_NAME);
        }
        let backend = FileBackend::open(&path)?;
        Self::from_backend(backend, config)
    }
}

impl RecordManager<InMemoryBackend> {
    /// Creates a store over an in-memory backend (mainly for tests).
    pub fn in_memory() -> Result<Self> {
        Self::in_memory_with_config(StoreConfig::default())
    }

    /// In-memory store with an explicit configuration.
    pub fn in_memory_with_config(config: StoreConfig) -> Result<Self> {
        Self::from_backend(InMemoryBackend::new(), config)
    }
}

impl<B: StorageBackend> RecordManager<B> {
    /// Builds a record manager over any backend, initializing a fresh
    /// store or loading an existing one.
    pub fn from_backend(backend: B, config: StoreConfig) -> Result<Self> {
        snafu::ensure!(
            config.page_size.is_power_of_two() && config.page_size >= MIN_PAGE_SIZE,
            InvalidPageSizeSnafu { page_size: config.page_size }
        );
        if backend.is_empty()? {
            Self::init(backend, config)
        } else {
            Self::load(backend, config)
        }
    }

    /// Creates a brand-new store: a zeroed header page, then the two
    /// internal trees, then the real header.
    fn init(backend: B, config: StoreConfig) -> Result<Self> {
        let page_size = config.page_size;
        backend.write_all_at(&vec![0u8; page_size], 0)?;
        let pager = Pager::new(backend, page_size, NO_PAGE, page_size as u64);

        let bob = Arc::new(TreeCore::create(
            &pager,
            BTreeInfo {
                fanout: DEFAULT_FANOUT,
                name: BOB_NAME.to_string(),
                key_codec: "name-revision".to_string(),
                value_codec: "u64".to_string(),
                allow_duplicates: false,
            },
            crate::types::comparator_for("name-revision"),
            crate::types::comparator_for("u64"),
        )?);
        let cpb = Arc::new(TreeCore::create(
            &pager,
            BTreeInfo {
                fanout: DEFAULT_FANOUT,
                name: CPB_NAME.to_string(),
                key_codec: "revision-name".to_string(),
                value_codec: "offset-list".to_string(),
                allow_duplicates: false,
            },
            crate::types::comparator_for("revision-name"),
            crate::types::comparator_for("offset-list"),
        )?);

        let directory = Directory {
            nb_trees: 0,
            current_bob: bob.current().header_offset,
            current_cpb: cpb.current().header_offset,
            bob,
            cpb,
            trees: HashMap::new(),
        };

        let rm = Self {
            pager,
            config,
            directory: RwLock::new(directory),
            txn: Mutex::new(TxnState::default()),
            txn_cv: Condvar::new(),
            keep_revisions: AtomicBool::new(false),
            nb_header_updates: AtomicU64::new(0),
        };
        {
            let dir = rm.directory.read();
            rm.write_header_locked(&dir, NO_PAGE, NO_PAGE)?;
        }
        rm.pager.clear_transaction_lists();
        rm.pager.backend().sync()?;
        Ok(rm)
    }

    /// Loads an existing store: header, internal trees (falling back
    /// to the previous offsets when the current ones are broken), then
    /// one tree per name keeping the highest revision seen in the
    /// B-tree of B-trees.
    fn load(backend: B, config: StoreConfig) -> Result<Self> {
        let mut prefix = [0u8; HEADER_FIELDS];
        backend.read_exact_at(&mut prefix, 0)?;
        let raw = RawHeader::parse(&prefix)?;

        let page_size = raw.page_size as usize;
        snafu::ensure!(
            page_size.is_power_of_two() && page_size >= MIN_PAGE_SIZE,
            CorruptedSnafu { reason: format!("header page size {page_size}") }
        );

        // A crash may leave a torn page at the tail; everything behind
        // the last full page boundary is dead weight and gets reused.
        let end_of_file = backend.len()? / page_size as u64 * page_size as u64;
        let pager = Pager::new(backend, page_size, raw.first_free_page, end_of_file);

        let (bob, current_bob) =
            Self::load_internal_tree(&pager, BOB_NAME, raw.current_bob, raw.previous_bob)?;
        let (cpb, current_cpb) =
            Self::load_internal_tree(&pager, CPB_NAME, raw.current_cpb, raw.previous_cpb)?;
        let recovered = current_bob != raw.current_bob || current_cpb != raw.current_cpb;

        // One pass over the B-tree of B-trees, keeping the newest
        // revision per name.
        let mut newest: HashMap<String, (u64, PageOffset)> = HashMap::new();
        {
            let mut cursor = RawCursor::new(&pager, bob.current().root_offset)?;
            let codec = NameRevisionCodec;
            while let Some((raw_key, raw_value)) = cursor.next_pair()? {
                let key = codec.decode(&raw_key).ok_or_else(|| crate::Error::Corrupted {
                    reason: "unreadable key in the B-tree of B-trees".into(),
                })?;
                let offset = <U64Codec as ValueCodec<u64>>::decode(&U64Codec, &raw_value)
                    .ok_or_else(|| crate::Error::Corrupted {
                        reason: "unreadable offset in the B-tree of B-trees".into(),
                    })?;
                let entry = newest.entry(key.name).or_insert((key.revision, offset));
                if key.revision >= entry.0 {
                    *entry = (key.revision, offset);
                }
            }
        }

        let mut trees = HashMap::new();
        for (name, (_, header_offset)) in newest {
            let core = TreeCore::load(&pager, header_offset)?;
            trees.insert(name, Arc::new(core));
        }

        let directory =
            Directory { nb_trees: raw.nb_trees, current_bob, current_cpb, bob, cpb, trees };

        let rm = Self {
            pager,
            config: StoreConfig { page_size, ..config },
            directory: RwLock::new(directory),
            txn: Mutex::new(TxnState::default()),
            txn_cv: Condvar::new(),
            keep_revisions: AtomicBool::new(false),
            nb_header_updates: AtomicU64::new(0),
        };
        if recovered {
            // Normalize the header so the adopted offsets are current.
            let dir = rm.directory.read();
            rm.write_header_locked(&dir, NO_PAGE, NO_PAGE)?;
            rm.pager.backend().sync()?;
        }
        Ok(rm)
    }

    /// Loads one internal tree, trying the current header offset and
    /// falling back to the previous one after a crash during commit.
    fn load_internal_tree(
        pager: &Pager<B>,
        name: &str,
        current: PageOffset,
        previous: PageOffset,
    ) -> Result<(Arc<TreeCore>, PageOffset)> {
        match TreeCore::load(pager, current) {
            Ok(core) => Ok((Arc::new(core), current)),
            Err(err) if previous != NO_PAGE => {
                tracing::warn!(tree = name, %err, "current header unreadable, using previous");
                let core = TreeCore::load(pager, previous)?;
                Ok((Arc::new(core), previous))
            }
            Err(err) => Err(err),
        }
    }

    /// Serializes the record-manager header into its page.
    fn write_header_locked(
        &self,
        dir: &Directory,
        previous_bob: PageOffset,
        previous_cpb: PageOffset,
    ) -> Result<()> {
        let mut buf = vec![0u8; self.config.page_size];
        buf[0..4].copy_from_slice(&(self.config.page_size as u32).to_be_bytes());
        buf[4..8].copy_from_slice(&dir.nb_trees.to_be_bytes());
        buf[8..16].copy_from_slice(&self.pager.first_free_page().to_be_bytes());
        buf[16..24].copy_from_slice(&dir.current_bob.to_be_bytes());
        buf[24..32].copy_from_slice(&previous_bob.to_be_bytes());
        buf[32..40].copy_from_slice(&dir.current_cpb.to_be_bytes());
        buf[40..48].copy_from_slice(&previous_cpb.to_be_bytes());

        tracing::debug!(
            first_free = self.pager.first_free_page(),
            bob = dir.current_bob,
            cpb = dir.current_cpb,
            "rewriting record-manager header"
        );
        self.pager.backend().write_all_at(&buf, 0)?;
        self.nb_header_updates.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Transactions
    // ------------------------------------------------------------------

    /// Takes the writer lock (blocking while another thread writes)
    /// and opens a transaction; nested calls from the same thread
    /// stack onto the outermost one.
    pub fn begin_transaction(&self) {
        let me = thread::current().id();
        let mut txn = self.txn.lock();
        loop {
            match txn.owner {
                None => {
                    txn.owner = Some(me);
                    txn.depth = 1;
                    let dir = self.directory.read();
                    txn.snapshot = Some(TxnSnapshot {
                        bob_offset: dir.current_bob,
                        cpb_offset: dir.current_cpb,
                        nb_trees: dir.nb_trees,
                        created: Vec::new(),
                    });
                    return;
                }
                Some(owner) if owner == me => {
                    txn.depth += 1;
                    return;
                }
                Some(_) => self.txn_cv.wait(&mut txn),
            }
        }
    }

    /// Commits the innermost transaction level; the outermost level
    /// performs the two-phase header swap. Calling without an open
    /// transaction is a no-op.
    ///
    /// # Errors
    ///
    /// An error during the outermost commit is fatal for this handle:
    /// the caller should reopen the store, which recovers through the
    /// header previous-offsets.
    pub fn commit(&self) -> Result<()> {
        let me = thread::current().id();
        let mut txn = self.txn.lock();
        if txn.owner != Some(me) || txn.depth == 0 {
            return Ok(());
        }
        txn.depth -= 1;
        if txn.depth > 0 {
            return Ok(());
        }

        let snapshot = txn.snapshot.take();
        let result = self.commit_inner(snapshot);
        txn.owner = None;
        self.txn_cv.notify_one();
        result
    }

    fn commit_inner(&self, snapshot: Option<TxnSnapshot>) -> Result<()> {
        if self.config.sync_on_commit {
            self.pager.backend().sync()?;
        }

        // Phase 1: new roots, previous offsets still recoverable.
        {
            let dir = self.directory.read();
            let (previous_bob, previous_cpb) = match &snapshot {
                Some(snap) => (
                    if dir.current_bob != snap.bob_offset { snap.bob_offset } else { NO_PAGE },
                    if dir.current_cpb != snap.cpb_offset { snap.cpb_offset } else { NO_PAGE },
                ),
                None => (NO_PAGE, NO_PAGE),
            };
            self.write_header_locked(&dir, previous_bob, previous_cpb)?;
        }

        // Phase 2: shadowed pages join the free list.
        self.pager.release_freed()?;

        // Phase 3: the transaction bookkeeping is done.
        self.pager.clear_transaction_lists();

        // Phase 4: final header, previous offsets erased.
        {
            let dir = self.directory.read();
            self.write_header_locked(&dir, NO_PAGE, NO_PAGE)?;
            dir.bob.promote();
            dir.cpb.promote();
            for core in dir.trees.values() {
                core.promote();
            }
        }

        if self.config.sync_on_commit {
            self.pager.backend().sync()?;
        }
        Ok(())
    }

    /// Abandons the innermost transaction level; the outermost level
    /// returns this transaction's page allocations to the free list
    /// and discards the new roots. Calling without an open transaction
    /// is a no-op.
    pub fn rollback(&self) -> Result<()> {
        let me = thread::current().id();
        let mut txn = self.txn.lock();
        if txn.owner != Some(me) || txn.depth == 0 {
            return Ok(());
        }
        txn.depth -= 1;
        if txn.depth > 0 {
            return Ok(());
        }

        let snapshot = txn.snapshot.take();
        let result = self.rollback_inner(snapshot);
        txn.owner = None;
        self.txn_cv.notify_one();
        result
    }

    fn rollback_inner(&self, snapshot: Option<TxnSnapshot>) -> Result<()> {
        if let Some(snap) = snapshot {
            let mut dir = self.directory.write();
            for name in &snap.created {
                dir.trees.remove(name);
            }
            dir.nb_trees = snap.nb_trees;
            dir.current_bob = snap.bob_offset;
            dir.current_cpb = snap.cpb_offset;
            dir.bob.discard();
            dir.cpb.discard();
            for core in dir.trees.values() {
                core.discard();
            }
        }

        self.pager.release_allocated()?;

        let dir = self.directory.read();
        self.write_header_locked(&dir, NO_PAGE, NO_PAGE)?;
        Ok(())
    }

    /// Runs `op` inside a transaction, committing on success and
    /// rolling back before surfacing the error otherwise.
    pub(crate) fn run_in_txn<T>(&self, op: impl FnOnce(&Self) -> Result<T>) -> Result<T> {
        self.begin_transaction();
        match op(self) {
            Ok(value) => {
                self.commit()?;
                Ok(value)
            }
            Err(err) => {
                let _ = self.rollback();
                Err(err)
            }
        }
    }

    /// True when the calling thread holds the writer lock.
    fn is_txn_owner(&self) -> bool {
        self.txn.lock().owner == Some(thread::current().id())
    }

    // ------------------------------------------------------------------
    // Tree management
    // ------------------------------------------------------------------

    /// Creates and starts managing a new tree.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::AlreadyManaged`] when the name is taken.
    pub fn add_tree<K: 'static, V: 'static>(
        &self,
        name: &str,
        key_codec: impl KeyCodec<K>,
        value_codec: impl ValueCodec<V>,
        allow_duplicates: bool,
    ) -> Result<Tree<'_, K, V, B>> {
        self.add_tree_with(
            name,
            key_codec,
            value_codec,
            TreeOptions { allow_duplicates, ..TreeOptions::default() },
        )
    }

    /// Creates a new tree with explicit options.
    pub fn add_tree_with<K: 'static, V: 'static>(
        &self,
        name: &str,
        key_codec: impl KeyCodec<K>,
        value_codec: impl ValueCodec<V>,
        options: TreeOptions,
    ) -> Result<Tree<'_, K, V, B>> {
        snafu::ensure!(
            options.fanout.is_power_of_two() && options.fanout >= MIN_FANOUT,
            BTreeCreationSnafu {
                reason: format!("fan-out {} is not a power of two >= {MIN_FANOUT}", options.fanout),
            }
        );
        let key_codec: Arc<dyn KeyCodec<K>> = Arc::new(key_codec);
        let value_codec: Arc<dyn ValueCodec<V>> = Arc::new(value_codec);

        let info = BTreeInfo {
            fanout: options.fanout,
            name: name.to_string(),
            key_codec: key_codec.id().to_string(),
            value_codec: value_codec.id().to_string(),
            allow_duplicates: options.allow_duplicates,
        };
        let cmp = key_cmp_of(&key_codec);
        let vcmp = value_cmp_of(&value_codec);
        let core = self.run_in_txn(|rm| rm.manage(name, info.clone(), cmp.clone(), vcmp.clone()))?;

        Ok(Tree { rm: self, core, key_codec, value_codec })
    }

    fn manage(
        &self,
        name: &str,
        info: BTreeInfo,
        cmp: crate::types::KeyCmp,
        vcmp: crate::types::KeyCmp,
    ) -> Result<Arc<TreeCore>> {
        {
            let dir = self.directory.read();
            snafu::ensure!(
                !dir.trees.contains_key(name) && name != BOB_NAME && name != CPB_NAME,
                AlreadyManagedSnafu { name: name.to_string() }
            );
        }

        let core = Arc::new(TreeCore::create(&self.pager, info, cmp, vcmp)?);
        self.bob_insert(&NameRevision::new(name, 0), core.current().header_offset)?;

        {
            let mut dir = self.directory.write();
            dir.trees.insert(name.to_string(), Arc::clone(&core));
            dir.nb_trees += 1;
        }
        if let Some(snap) = self.txn.lock().snapshot.as_mut() {
            snap.created.push(name.to_string());
        }
        tracing::debug!(tree = name, "managing new tree");
        Ok(core)
    }

    /// Attaches a typed handle to a tree loaded from disk, verifying
    /// that the supplied codecs match the persisted descriptor.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::TreeNotFound`] for an unknown name and
    /// [`crate::Error::CodecMismatch`] when the codec ids differ.
    pub fn tree<K: 'static, V: 'static>(
        &self,
        name: &str,
        key_codec: impl KeyCodec<K>,
        value_codec: impl ValueCodec<V>,
    ) -> Result<Tree<'_, K, V, B>> {
        let core = {
            let dir = self.directory.read();
            dir.trees.get(name).cloned()
        }
        .ok_or_else(|| crate::Error::TreeNotFound { name: name.to_string() })?;

        let key_codec: Arc<dyn KeyCodec<K>> = Arc::new(key_codec);
        let value_codec: Arc<dyn ValueCodec<V>> = Arc::new(value_codec);

        snafu::ensure!(
            core.info.key_codec == key_codec.id() && core.info.value_codec == value_codec.id(),
            crate::error::CodecMismatchSnafu {
                name: name.to_string(),
                stored_key: core.info.key_codec.clone(),
                stored_value: core.info.value_codec.clone(),
                supplied_key: key_codec.id().to_string(),
                supplied_value: value_codec.id().to_string(),
            }
        );
        core.set_comparators(key_cmp_of(&key_codec), value_cmp_of(&value_codec));

        Ok(Tree { rm: self, core, key_codec, value_codec })
    }

    /// Names of the managed trees, the internal ones excluded.
    pub fn managed_trees(&self) -> Vec<String> {
        let mut names: Vec<String> = self.directory.read().trees.keys().cloned().collect();
        names.sort();
        names
    }

    /// When set, shadowed pages are registered in the CopiedPages
    /// B-tree instead of being freed, keeping every revision readable
    /// until explicitly reclaimed.
    pub fn set_keep_revisions(&self, keep: bool) {
        self.keep_revisions.store(keep, Ordering::Release);
    }

    /// Current keep-revisions flag.
    pub fn keep_revisions(&self) -> bool {
        self.keep_revisions.load(Ordering::Acquire)
    }

    /// Counters and size figures.
    pub fn stats(&self) -> Result<StoreStats> {
        let stats = self.pager.stats();
        Ok(StoreStats {
            page_size: self.config.page_size,
            total_pages: self.pager.total_pages(),
            free_pages: self.pager.walk_free_list()?.len() as u64,
            managed_trees: self.directory.read().nb_trees,
            nb_created_pages: stats.nb_created_pages.load(Ordering::Relaxed),
            nb_reused_pages: stats.nb_reused_pages.load(Ordering::Relaxed),
            nb_freed_pages: stats.nb_freed_pages.load(Ordering::Relaxed),
            nb_header_updates: self.nb_header_updates.load(Ordering::Relaxed),
        })
    }

    /// Flushes everything and closes the store. The file is left in
    /// its committed state.
    pub fn close(self) -> Result<()> {
        self.run_in_txn(|_| Ok(()))?;
        self.pager.backend().sync()?;
        Ok(())
    }

    /// Runs the integrity checker over the whole file.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::InvalidBTree`] or
    /// [`crate::Error::FreePage`] describing the first violated
    /// invariant.
    pub fn check(&self) -> Result<crate::integrity::CheckReport> {
        crate::integrity::check(self)
    }

    /// Drops the retained revisions of `name` up to and including
    /// `up_to`: pages recorded for them in the CopiedPages B-tree are
    /// freed and their B-tree-of-B-trees entries removed. The current
    /// revision always survives. Returns the number of revisions
    /// reclaimed.
    pub fn reclaim_revisions(&self, name: &str, up_to: u64) -> Result<u64> {
        self.run_in_txn(|rm| rm.reclaim_inner(name, up_to))
    }

    fn reclaim_inner(&self, name: &str, up_to: u64) -> Result<u64> {
        let (bob, cpb, core) = {
            let dir = self.directory.read();
            let core = dir.trees.get(name).cloned();
            (Arc::clone(&dir.bob), Arc::clone(&dir.cpb), core)
        };
        let core = core.ok_or_else(|| crate::Error::TreeNotFound { name: name.to_string() })?;
        // Never drop the entry backing the live revision.
        let bound = up_to.min(core.latest().revision.saturating_sub(1));

        // Shadowed-page lists whose users are all reclaimed. The list
        // recorded by revision `r` holds pages last used by `r - 1`,
        // so entries up to `bound + 1` are free to go.
        let mut copied: Vec<(RevisionName, Vec<PageOffset>)> = Vec::new();
        {
            let mut cursor = RawCursor::new(&self.pager, cpb.latest().root_offset)?;
            while let Some((raw_key, raw_value)) = cursor.next_pair()? {
                let key = match RevisionNameCodec.decode(&raw_key) {
                    Some(key) => key,
                    None => continue,
                };
                if key.revision > bound + 1 {
                    break;
                }
                if key.name == name {
                    let offsets =
                        <OffsetListCodec as ValueCodec<Vec<u64>>>::decode(&OffsetListCodec, &raw_value)
                            .unwrap_or_default();
                    copied.push((key, offsets));
                }
            }
        }

        for (key, offsets) in &copied {
            for offset in offsets {
                self.pager.shadow(*offset);
            }
            self.cpb_delete(key)?;
        }

        // Headers of the reclaimed revisions.
        let mut dropped: Vec<(u64, PageOffset)> = Vec::new();
        {
            let cmp = bob.cmp();
            let mut seek_key = Vec::new();
            NameRevisionCodec.encode(&NameRevision::new(name, 0), &mut seek_key);
            let mut cursor =
                RawCursor::seek(&self.pager, bob.latest().root_offset, &cmp, &seek_key)?;
            while let Some((raw_key, raw_value)) = cursor.next_pair()? {
                let key = match NameRevisionCodec.decode(&raw_key) {
                    Some(key) => key,
                    None => continue,
                };
                if key.name != name || key.revision > bound {
                    break;
                }
                let offset = <U64Codec as ValueCodec<u64>>::decode(&U64Codec, &raw_value)
                    .unwrap_or(NO_PAGE);
                if offset != NO_PAGE {
                    dropped.push((key.revision, offset));
                }
            }
        }

        for (revision, header_offset) in &dropped {
            self.pager.shadow(*header_offset);
            self.bob_delete(&NameRevision::new(name, *revision))?;
        }

        tracing::debug!(tree = name, revisions = dropped.len(), "reclaimed retained revisions");
        Ok(dropped.len() as u64)
    }

    // ------------------------------------------------------------------
    // Internal-tree plumbing
    // ------------------------------------------------------------------

    /// Registers a freshly written user-tree revision: the header goes
    /// into the B-tree of B-trees, and the shadowed pages either into
    /// the CopiedPages B-tree (`keep_revisions`) or straight to the
    /// transaction's free list together with the superseded header and
    /// its B-tree-of-B-trees entry.
    fn register_revision(&self, core: &TreeCore, applied: AppliedWrite) -> Result<()> {
        self.bob_insert(
            &NameRevision::new(&core.name, applied.revision),
            applied.new_header_offset,
        )?;

        // Same-revision churn belongs to no revision: free it whatever
        // the keep-revisions flag says.
        for offset in &applied.transient {
            self.pager.shadow(*offset);
        }

        if self.keep_revisions() {
            if !applied.shadowed.is_empty() {
                self.cpb_insert(
                    &RevisionName::new(applied.revision, &core.name),
                    &applied.shadowed,
                )?;
            }
        } else {
            for offset in &applied.shadowed {
                self.pager.shadow(*offset);
            }
            self.pager.shadow(applied.old_header_offset);
            self.bob_delete(&NameRevision::new(&core.name, applied.old_revision))?;
        }
        Ok(())
    }

    fn bob_insert(&self, key: &NameRevision, header_offset: PageOffset) -> Result<()> {
        self.pager.check_offset(header_offset)?;
        let mut raw_key = Vec::new();
        NameRevisionCodec.encode(key, &mut raw_key);
        let raw_value = header_offset.to_be_bytes().to_vec();

        let bob = Arc::clone(&self.directory.read().bob);
        match bob.insert(&self.pager, &raw_key, &raw_value)? {
            TreeWrite::Unchanged { .. } => Ok(()),
            TreeWrite::Applied(applied) => self.absorb_internal_write(applied, true),
        }
    }

    fn bob_delete(&self, key: &NameRevision) -> Result<()> {
        let mut raw_key = Vec::new();
        NameRevisionCodec.encode(key, &mut raw_key);

        let bob = Arc::clone(&self.directory.read().bob);
        match bob.delete(&self.pager, &raw_key)? {
            TreeWrite::Unchanged { .. } => Ok(()),
            TreeWrite::Applied(applied) => self.absorb_internal_write(applied, true),
        }
    }

    fn cpb_insert(&self, key: &RevisionName, offsets: &[PageOffset]) -> Result<()> {
        let mut raw_key = Vec::new();
        RevisionNameCodec.encode(key, &mut raw_key);
        let mut raw_value = Vec::new();
        OffsetListCodec.encode(&offsets.to_vec(), &mut raw_value);

        let cpb = Arc::clone(&self.directory.read().cpb);
        match cpb.insert(&self.pager, &raw_key, &raw_value)? {
            TreeWrite::Unchanged { .. } => Ok(()),
            TreeWrite::Applied(applied) => self.absorb_internal_write(applied, false),
        }
    }

    fn cpb_delete(&self, key: &RevisionName) -> Result<()> {
        let mut raw_key = Vec::new();
        RevisionNameCodec.encode(key, &mut raw_key);

        let cpb = Arc::clone(&self.directory.read().cpb);
        match cpb.delete(&self.pager, &raw_key)? {
            TreeWrite::Unchanged { .. } => Ok(()),
            TreeWrite::Applied(applied) => self.absorb_internal_write(applied, false),
        }
    }

    /// Internal trees never retain revisions: whatever they shadow is
    /// freed at commit, and the root offset advances in place.
    fn absorb_internal_write(&self, applied: AppliedWrite, is_bob: bool) -> Result<()> {
        for offset in applied.shadowed.into_iter().chain(applied.transient) {
            self.pager.shadow(offset);
        }
        self.pager.shadow(applied.old_header_offset);

        let mut dir = self.directory.write();
        if is_bob {
            dir.current_bob = applied.new_header_offset;
        } else {
            dir.current_cpb = applied.new_header_offset;
        }
        Ok(())
    }

    /// Resolves the BTreeHeader of `(name, revision)` through the
    /// B-tree of B-trees.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::KeyNotFound`] when that revision was
    /// never committed or has been reclaimed.
    fn header_for(&self, name: &str, revision: u64) -> Result<BTreeHeader> {
        let bob = Arc::clone(&self.directory.read().bob);
        let bob_header = if self.is_txn_owner() { bob.latest() } else { bob.current() };

        let mut raw_key = Vec::new();
        NameRevisionCodec.encode(&NameRevision::new(name, revision), &mut raw_key);
        let raw_value = bob
            .get(&self.pager, &bob_header, &raw_key)?
            .ok_or(crate::Error::KeyNotFound)?;
        let offset = <U64Codec as ValueCodec<u64>>::decode(&U64Codec, &raw_value)
            .ok_or_else(|| crate::Error::Corrupted {
                reason: "unreadable offset in the B-tree of B-trees".into(),
            })?;
        read_tree_header(&self.pager, offset)
    }
}

// ============================================================================
// Typed tree handle
// ============================================================================

/// A typed handle onto one managed B+tree.
///
/// The handle borrows the record manager; all mutations run inside
/// its transaction machinery (each call opens its own transaction
/// unless the caller already holds one via
/// [`RecordManager::begin_transaction`]).
pub struct Tree<'rm, K: 'static, V: 'static, B: StorageBackend = FileBackend> {
    rm: &'rm RecordManager<B>,
    core: Arc<TreeCore>,
    key_codec: Arc<dyn KeyCodec<K>>,
    value_codec: Arc<dyn ValueCodec<V>>,
}

impl<'rm, K: 'static, V: 'static, B: StorageBackend> Tree<'rm, K, V, B> {
    /// Tree name.
    pub fn name(&self) -> &str {
        &self.core.name
    }

    /// Revision visible to this caller (the working revision inside a
    /// transaction, the committed one otherwise).
    pub fn revision(&self) -> u64 {
        self.visible_header().revision
    }

    /// Number of stored values at the visible revision.
    pub fn count(&self) -> u64 {
        self.visible_header().nb_elems
    }

    fn visible_header(&self) -> Arc<BTreeHeader> {
        if self.rm.is_txn_owner() { self.core.latest() } else { self.core.current() }
    }

    fn encode_key(&self, key: &K) -> Vec<u8> {
        let mut buf = Vec::new();
        self.key_codec.encode(key, &mut buf);
        buf
    }

    fn decode_key(&self, raw: &[u8]) -> Result<K> {
        self.key_codec.decode(raw).ok_or_else(|| crate::Error::Corrupted {
            reason: format!("key does not decode as '{}'", self.key_codec.id()),
        })
    }

    fn decode_value(&self, raw: &[u8]) -> Result<V> {
        self.value_codec.decode(raw).ok_or_else(|| crate::Error::Corrupted {
            reason: format!("value does not decode as '{}'", self.value_codec.id()),
        })
    }

    /// Inserts `(key, value)`. For a tree without duplicates the
    /// replaced value is returned; for a duplicate tree the value is
    /// added to the key's values and `None` comes back (or the value
    /// itself when it was already present).
    pub fn insert(&self, key: &K, value: &V) -> Result<Option<V>> {
        let raw_key = self.encode_key(key);
        let mut raw_value = Vec::new();
        self.value_codec.encode(value, &mut raw_value);

        let old = self.rm.run_in_txn(|rm| {
            match self.core.insert(&rm.pager, &raw_key, &raw_value)? {
                TreeWrite::Unchanged { old } => Ok(old),
                TreeWrite::Applied(applied) => {
                    let old = applied.old.clone();
                    rm.register_revision(&self.core, applied)?;
                    Ok(old)
                }
            }
        })?;
        old.map(|raw| self.decode_value(&raw)).transpose()
    }

    /// Removes `key` (and all of its values, for a duplicate tree).
    /// Returns the removed `(key, value)` pair, the smallest value
    /// standing in when the key carried several. Deleting an absent
    /// key writes nothing.
    pub fn delete(&self, key: &K) -> Result<Option<(K, V)>> {
        let raw_key = self.encode_key(key);

        let removed = self.rm.run_in_txn(|rm| {
            match self.core.delete(&rm.pager, &raw_key)? {
                TreeWrite::Unchanged { .. } => Ok(None),
                TreeWrite::Applied(applied) => {
                    let removed = applied.removed.clone();
                    rm.register_revision(&self.core, applied)?;
                    Ok(removed)
                }
            }
        })?;

        removed
            .map(|(k, v)| Ok((self.decode_key(&k)?, self.decode_value(&v)?)))
            .transpose()
    }

    /// Point lookup at the visible revision.
    pub fn get(&self, key: &K) -> Result<Option<V>> {
        let header = self.visible_header();
        let raw_key = self.encode_key(key);
        self.core
            .get(&self.rm.pager, &header, &raw_key)?
            .map(|raw| self.decode_value(&raw))
            .transpose()
    }

    /// Point lookup at an explicit retained revision.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::KeyNotFound`] when the revision is not
    /// retained (a missing key is `Ok(None)`, not an error).
    pub fn get_at(&self, key: &K, revision: u64) -> Result<Option<V>> {
        let header = self.header_at(revision)?;
        let raw_key = self.encode_key(key);
        self.core
            .get(&self.rm.pager, &header, &raw_key)?
            .map(|raw| self.decode_value(&raw))
            .transpose()
    }

    /// True when `key` is present at the visible revision.
    pub fn contains(&self, key: &K) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }

    /// Number of page levels at the visible revision (1 = the root is
    /// a leaf). Walks the leftmost path.
    pub fn depth(&self) -> Result<u32> {
        let header = self.visible_header();
        let mut depth = 1;
        let mut offset = header.root_offset;
        loop {
            match crate::btree::io::read_page(&self.rm.pager, offset)? {
                crate::btree::node::TreePage::Leaf(_) => return Ok(depth),
                crate::btree::node::TreePage::Node(node) => {
                    offset = node.children[0].location().offset;
                    depth += 1;
                }
            }
        }
    }

    /// Ordered iteration over the visible revision. Re-calling
    /// restarts from the smallest key.
    pub fn browse(&self) -> Result<Cursor<'rm, K, V, B>> {
        let header = self.visible_header();
        self.cursor_at(header.root_offset)
    }

    /// Ordered iteration over an explicit retained revision.
    pub fn browse_at(&self, revision: u64) -> Result<Cursor<'rm, K, V, B>> {
        let header = self.header_at(revision)?;
        self.cursor_at(header.root_offset)
    }

    /// Ordered iteration starting at the first key `>= key`.
    pub fn browse_from(&self, key: &K) -> Result<Cursor<'rm, K, V, B>> {
        let header = self.visible_header();
        let raw_key = self.encode_key(key);
        let cmp = self.core.cmp();
        let raw = RawCursor::seek(&self.rm.pager, header.root_offset, &cmp, &raw_key)?;
        Ok(Cursor {
            raw,
            key_codec: Arc::clone(&self.key_codec),
            value_codec: Arc::clone(&self.value_codec),
        })
    }

    fn header_at(&self, revision: u64) -> Result<Arc<BTreeHeader>> {
        let visible = self.visible_header();
        if revision == visible.revision {
            return Ok(visible);
        }
        Ok(Arc::new(self.rm.header_for(&self.core.name, revision)?))
    }

    fn cursor_at(&self, root_offset: PageOffset) -> Result<Cursor<'rm, K, V, B>> {
        Ok(Cursor {
            raw: RawCursor::new(&self.rm.pager, root_offset)?,
            key_codec: Arc::clone(&self.key_codec),
            value_codec: Arc::clone(&self.value_codec),
        })
    }
}

/// Lazy ordered sequence of `(key, value)` pairs over one revision.
pub struct Cursor<'rm, K: 'static, V: 'static, B: StorageBackend = FileBackend> {
    raw: RawCursor<'rm, B>,
    key_codec: Arc<dyn KeyCodec<K>>,
    value_codec: Arc<dyn ValueCodec<V>>,
}

impl<'rm, K: 'static, V: 'static, B: StorageBackend> Cursor<'rm, K, V, B> {
    /// Next pair, or `None` once the revision is exhausted.
    pub fn next_entry(&mut self) -> Result<Option<(K, V)>> {
        match self.raw.next_pair()? {
            None => Ok(None),
            Some((raw_key, raw_value)) => {
                let key = self.key_codec.decode(&raw_key).ok_or_else(|| {
                    crate::Error::Corrupted {
                        reason: format!("key does not decode as '{}'", self.key_codec.id()),
                    }
                })?;
                let value = self.value_codec.decode(&raw_value).ok_or_else(|| {
                    crate::Error::Corrupted {
                        reason: format!("value does not decode as '{}'", self.value_codec.id()),
                    }
                })?;
                Ok(Some((key, value)))
            }
        }
    }
}

impl<'rm, K: 'static, V: 'static, B: StorageBackend> Iterator for Cursor<'rm, K, V, B> {
    type Item = Result<(K, V)>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_entry().transpose()
    }
}

/// Shorthand for byte-keyed, byte-valued trees.
pub type BytesTree<'rm, B> = Tree<'rm, Vec<u8>, Vec<u8>, B>;

/// Convenience constructor pairing [`BytesCodec`] with itself.
impl<B: StorageBackend> RecordManager<B> {
    /// Creates a byte-keyed, byte-valued tree.
    pub fn add_bytes_tree(&self, name: &str, allow_duplicates: bool) -> Result<BytesTree<'_, B>> {
        self.add_tree(name, BytesCodec, BytesCodec, allow_duplicates)
    }
}
