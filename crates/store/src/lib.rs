//! vellum-store: an embeddable, single-file, copy-on-write,
//! multi-version B+tree storage engine.
//!
//! A [`RecordManager`] persists an arbitrary collection of named
//! B+trees in one random-access file, serves point and range reads at
//! any retained revision, and applies insertions and deletions as new
//! immutable versions:
//!
//! - **Single file**: fixed-size pages chained into logical records;
//!   no journal, no sidecar files
//! - **Copy-on-write**: mutations allocate new pages, never overwrite
//!   committed ones
//! - **Multi-version**: every commit is a revision; with
//!   `keep_revisions` old revisions stay readable until reclaimed
//! - **Single writer, parallel readers**: a reentrant transaction
//!   lock serializes writes; readers work from committed header
//!   snapshots and never block
//! - **Crash consistency**: a two-phase header rewrite keeps either
//!   the pre- or the post-transaction state recoverable
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │               RecordManager                 │
//! │ (open, add_tree, transactions, reclaim)     │
//! └────────────────┬────────────────────────────┘
//!                  │
//! ┌────────────────▼────────────────────────────┐
//! │              B+Tree Layer                   │
//! │ (CoW insert/delete, splits, borrows, merge, │
//! │  cursors, duplicate-value sub-trees)        │
//! └────────────────┬────────────────────────────┘
//! ┌────────────────▼────────────────────────────┐
//! │               Page Layer                    │
//! │ (PageIo chains, records, free-page list)    │
//! └────────────────┬────────────────────────────┘
//! ┌────────────────▼────────────────────────────┐
//! │            Storage Backend                  │
//! │     (FileBackend / InMemoryBackend)         │
//! └─────────────────────────────────────────────┘
//! ```
//!
//! ## Quick start
//!
//! ```no_run
//! use vellum_store::{RecordManager, U64Codec, BytesCodec};
//!
//! let rm = RecordManager::open("data.vlm")?;
//! let tree = rm.add_tree("people", U64Codec, BytesCodec, false)?;
//!
//! tree.insert(&1, &b"alice".to_vec())?;
//! rm.commit()?;
//!
//! assert_eq!(tree.get(&1)?, Some(b"alice".to_vec()));
//! for entry in tree.browse()? {
//!     let (key, value) = entry?;
//!     println!("{key} -> {value:?}");
//! }
//! # Ok::<(), vellum_store::Error>(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
// Unwraps in non-test code are infallible:
// - try_into().unwrap() on slices with pre-validated sizes
// - write integers into growable Vec<u8> buffers
// - pop()/as_mut().unwrap() directly after a length or is_none check
// B+ tree operations use wide return types for split/merge propagation.
#![allow(clippy::type_complexity)]

pub mod backend;
pub(crate) mod btree;
pub mod error;
pub mod integrity;
pub mod page;
pub mod recman;
pub mod types;

pub use backend::{FileBackend, InMemoryBackend, StorageBackend, DEFAULT_PAGE_SIZE, MIN_PAGE_SIZE};
pub use btree::{DEFAULT_FANOUT, MIN_FANOUT};
pub use error::{Error, PageOffset, Result, NO_PAGE};
pub use integrity::CheckReport;
pub use page::{PageIo, Pager, PagerStats};
pub use recman::{BytesTree, Cursor, RecordManager, StoreConfig, StoreStats, Tree, TreeOptions};
pub use types::{
    BytesCodec, I64Codec, KeyCodec, NameRevision, OffsetListCodec, RevisionName, StrCodec,
    U64Codec, ValueCodec,
};

/// Store format version.
pub const VERSION: u16 = 1;
