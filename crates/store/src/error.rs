//! Error types for the vellum storage engine.

use std::io;

use snafu::Snafu;

/// A byte offset of a physical page inside the store file.
pub type PageOffset = u64;

/// Sentinel offset meaning "no page". Serialized on disk as `-1`
/// (all bits set), which is how free-list ends and absent header
/// references are encoded.
pub const NO_PAGE: PageOffset = u64::MAX;

/// Result type alias for vellum operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during store operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    /// I/O error from the underlying storage backend. Unrecoverable
    /// within the current transaction; fatal during commit (the caller
    /// must reopen and rely on the header previous-offsets).
    #[snafu(display("I/O error: {source}"))]
    Io {
        /// The underlying I/O error.
        source: io::Error,
    },

    /// A caller- or disk-supplied offset violates the offset
    /// invariants (sentinel misuse, unaligned, or past the end of the
    /// file). Indicates corruption.
    #[snafu(display("Invalid page offset: {offset:#x}"))]
    InvalidOffset {
        /// The offending offset.
        offset: PageOffset,
    },

    /// A read went past the end of the file.
    #[snafu(display("Read past end of file: offset {offset:#x}, file size {file_size}"))]
    EndOfFile {
        /// The offset of the attempted read.
        offset: PageOffset,
        /// The current file size.
        file_size: u64,
    },

    /// A tree with this name is already managed by the record manager.
    #[snafu(display("B-tree '{name}' is already managed"))]
    AlreadyManaged {
        /// The duplicated tree name.
        name: String,
    },

    /// No tree with this name is managed by the record manager.
    #[snafu(display("B-tree '{name}' is not managed"))]
    TreeNotFound {
        /// The requested tree name.
        name: String,
    },

    /// Lookup of a non-existent revision. A plain key miss is `Ok(None)`,
    /// not an error; this fires when the revision itself is unknown.
    #[snafu(display("Revision not found"))]
    KeyNotFound,

    /// Failure to materialize a duplicate-values sub-tree.
    #[snafu(display("Cannot create sub-tree: {reason}"))]
    BTreeCreation {
        /// What went wrong.
        reason: String,
    },

    /// Corruption in the free-page list (cycle, or offset beyond EOF).
    #[snafu(display("Free page list corrupted: {reason}"))]
    FreePage {
        /// What the walk detected.
        reason: String,
    },

    /// The integrity checker found a broken invariant.
    #[snafu(display("Invalid B-tree: {reason}"))]
    InvalidBTree {
        /// The violated invariant.
        reason: String,
    },

    /// The file content does not parse as a vellum store.
    #[snafu(display("Corrupted store: {reason}"))]
    Corrupted {
        /// Description of what was corrupted.
        reason: String,
    },

    /// The caller attached codecs that do not match the ones the tree
    /// was created with.
    #[snafu(display(
        "Codec mismatch for tree '{name}': stored ({stored_key}, {stored_value}), \
         supplied ({supplied_key}, {supplied_value})"
    ))]
    CodecMismatch {
        /// The tree name.
        name: String,
        /// Key codec id recorded in the BTreeInfo.
        stored_key: String,
        /// Value codec id recorded in the BTreeInfo.
        stored_value: String,
        /// Key codec id supplied by the caller.
        supplied_key: String,
        /// Value codec id supplied by the caller.
        supplied_value: String,
    },

    /// The requested page size is rejected at file creation.
    #[snafu(display("Invalid page size: {page_size} (must be a power of two >= 64)"))]
    InvalidPageSize {
        /// The rejected page size.
        page_size: usize,
    },
}

// Ergonomic `?` on raw io calls.
impl From<io::Error> for Error {
    fn from(source: io::Error) -> Self {
        Error::Io { source }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_io() {
        let err = Error::from(io::Error::new(io::ErrorKind::NotFound, "gone"));
        assert!(format!("{err}").starts_with("I/O error:"));
    }

    #[test]
    fn display_invalid_offset() {
        let err = Error::InvalidOffset { offset: 0x123 };
        assert_eq!(format!("{err}"), "Invalid page offset: 0x123");
    }

    #[test]
    fn display_already_managed() {
        let err = Error::AlreadyManaged { name: "people".into() };
        assert_eq!(format!("{err}"), "B-tree 'people' is already managed");
    }

    #[test]
    fn display_free_page() {
        let err = Error::FreePage { reason: "cycle at 0x200".into() };
        assert_eq!(format!("{err}"), "Free page list corrupted: cycle at 0x200");
    }

    #[test]
    fn source_chain_preserved() {
        use std::error::Error as StdError;
        let err = Error::from(io::Error::other("disk on fire"));
        assert!(err.source().is_some());
    }

    #[test]
    fn no_page_is_all_ones() {
        assert_eq!(NO_PAGE.to_be_bytes(), [0xFF; 8]);
        assert_eq!(NO_PAGE as i64, -1);
    }
}
