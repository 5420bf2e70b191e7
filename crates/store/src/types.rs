//! Key and value codecs.
//!
//! Keys and values travel through the engine as raw byte arrays; the
//! codecs sit at the handle layer and translate between typed values
//! and their on-disk encoding. Each codec carries a stable `id` that
//! is persisted in the tree's BTreeInfo so that a reopened store can
//! resolve the right comparator before a typed handle re-attaches.
//!
//! Built-in key encodings preserve ordering under a plain byte
//! comparison (`u64` big-endian, `i64` with the sign bit flipped,
//! UTF-8 strings, raw bytes). Codecs whose encoding is not
//! order-preserving override [`KeyCodec::compare`].

use std::cmp::Ordering;
use std::sync::Arc;

use byteorder::{BigEndian, ByteOrder, WriteBytesExt};

/// Comparator over encoded keys, shared by the engine-level trees.
#[derive(Clone)]
pub(crate) struct KeyCmp(Arc<dyn Fn(&[u8], &[u8]) -> Ordering + Send + Sync>);

impl KeyCmp {
    /// Wraps a comparison function.
    pub(crate) fn new(f: impl Fn(&[u8], &[u8]) -> Ordering + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    /// Compares two encoded keys.
    pub(crate) fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        let f: &(dyn Fn(&[u8], &[u8]) -> Ordering + Send + Sync) = &*self.0;
        f(a, b)
    }
}

/// Encodes and decodes tree keys.
pub trait KeyCodec<K>: Send + Sync + 'static {
    /// Stable identifier persisted in the tree descriptor.
    fn id(&self) -> &'static str;

    /// Appends the encoded key to `buf`.
    fn encode(&self, key: &K, buf: &mut Vec<u8>);

    /// Decodes a key from its encoded form.
    fn decode(&self, raw: &[u8]) -> Option<K>;

    /// Compares two encoded keys. The default byte comparison is only
    /// correct for order-preserving encodings.
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        a.cmp(b)
    }
}

/// Encodes and decodes tree values.
pub trait ValueCodec<V>: Send + Sync + 'static {
    /// Stable identifier persisted in the tree descriptor.
    fn id(&self) -> &'static str;

    /// Appends the encoded value to `buf`.
    fn encode(&self, value: &V, buf: &mut Vec<u8>);

    /// Decodes a value from its encoded form.
    fn decode(&self, raw: &[u8]) -> Option<V>;

    /// Compares two encoded values; orders the duplicate-values
    /// sub-trees.
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        a.cmp(b)
    }
}

// ============================================================================
// Built-in codecs
// ============================================================================

/// Big-endian `u64` codec.
#[derive(Debug, Clone, Copy, Default)]
pub struct U64Codec;

impl KeyCodec<u64> for U64Codec {
    fn id(&self) -> &'static str {
        "u64"
    }

    fn encode(&self, key: &u64, buf: &mut Vec<u8>) {
        buf.write_u64::<BigEndian>(*key).unwrap();
    }

    fn decode(&self, raw: &[u8]) -> Option<u64> {
        (raw.len() == 8).then(|| BigEndian::read_u64(raw))
    }
}

impl ValueCodec<u64> for U64Codec {
    fn id(&self) -> &'static str {
        "u64"
    }

    fn encode(&self, value: &u64, buf: &mut Vec<u8>) {
        buf.write_u64::<BigEndian>(*value).unwrap();
    }

    fn decode(&self, raw: &[u8]) -> Option<u64> {
        (raw.len() == 8).then(|| BigEndian::read_u64(raw))
    }
}

/// `i64` codec; flips the sign bit so the encoded form sorts in
/// numeric order:
///
/// ```text
/// i64::MIN -> 0x0000000000000000
/// -1       -> 0x7FFFFFFFFFFFFFFF
/// 0        -> 0x8000000000000000
/// i64::MAX -> 0xFFFFFFFFFFFFFFFF
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct I64Codec;

impl KeyCodec<i64> for I64Codec {
    fn id(&self) -> &'static str {
        "i64"
    }

    fn encode(&self, key: &i64, buf: &mut Vec<u8>) {
        buf.write_u64::<BigEndian>((*key as u64) ^ (1u64 << 63)).unwrap();
    }

    fn decode(&self, raw: &[u8]) -> Option<i64> {
        (raw.len() == 8).then(|| (BigEndian::read_u64(raw) ^ (1u64 << 63)) as i64)
    }
}

impl ValueCodec<i64> for I64Codec {
    fn id(&self) -> &'static str {
        "i64"
    }

    fn encode(&self, value: &i64, buf: &mut Vec<u8>) {
        KeyCodec::encode(self, value, buf);
    }

    fn decode(&self, raw: &[u8]) -> Option<i64> {
        KeyCodec::decode(self, raw)
    }
}

/// UTF-8 string codec.
#[derive(Debug, Clone, Copy, Default)]
pub struct StrCodec;

impl KeyCodec<String> for StrCodec {
    fn id(&self) -> &'static str {
        "str"
    }

    fn encode(&self, key: &String, buf: &mut Vec<u8>) {
        buf.extend_from_slice(key.as_bytes());
    }

    fn decode(&self, raw: &[u8]) -> Option<String> {
        std::str::from_utf8(raw).ok().map(str::to_string)
    }
}

impl ValueCodec<String> for StrCodec {
    fn id(&self) -> &'static str {
        "str"
    }

    fn encode(&self, value: &String, buf: &mut Vec<u8>) {
        buf.extend_from_slice(value.as_bytes());
    }

    fn decode(&self, raw: &[u8]) -> Option<String> {
        std::str::from_utf8(raw).ok().map(str::to_string)
    }
}

/// Raw byte-slice codec.
#[derive(Debug, Clone, Copy, Default)]
pub struct BytesCodec;

impl KeyCodec<Vec<u8>> for BytesCodec {
    fn id(&self) -> &'static str {
        "bytes"
    }

    fn encode(&self, key: &Vec<u8>, buf: &mut Vec<u8>) {
        buf.extend_from_slice(key);
    }

    fn decode(&self, raw: &[u8]) -> Option<Vec<u8>> {
        Some(raw.to_vec())
    }
}

impl ValueCodec<Vec<u8>> for BytesCodec {
    fn id(&self) -> &'static str {
        "bytes"
    }

    fn encode(&self, value: &Vec<u8>, buf: &mut Vec<u8>) {
        buf.extend_from_slice(value);
    }

    fn decode(&self, raw: &[u8]) -> Option<Vec<u8>> {
        Some(raw.to_vec())
    }
}

// ============================================================================
// Internal key types (B-tree of B-trees, CopiedPages B-tree)
// ============================================================================

/// Key of the B-tree of B-trees: a managed tree name and one of its
/// revisions. Ordered by name, then revision, so all revisions of a
/// tree are adjacent.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NameRevision {
    /// The managed tree name.
    pub name: String,
    /// The revision of that tree.
    pub revision: u64,
}

impl NameRevision {
    /// Builds a key for `name` at `revision`.
    pub fn new(name: impl Into<String>, revision: u64) -> Self {
        Self { name: name.into(), revision }
    }
}

/// Codec for [`NameRevision`]: `[nameLen:4][name][revision:8]`. The
/// length prefix breaks plain byte ordering, so `compare` decodes.
#[derive(Debug, Clone, Copy, Default)]
pub struct NameRevisionCodec;

impl KeyCodec<NameRevision> for NameRevisionCodec {
    fn id(&self) -> &'static str {
        "name-revision"
    }

    fn encode(&self, key: &NameRevision, buf: &mut Vec<u8>) {
        buf.write_u32::<BigEndian>(key.name.len() as u32).unwrap();
        buf.extend_from_slice(key.name.as_bytes());
        buf.write_u64::<BigEndian>(key.revision).unwrap();
    }

    fn decode(&self, raw: &[u8]) -> Option<NameRevision> {
        if raw.len() < 12 {
            return None;
        }
        let name_len = BigEndian::read_u32(raw) as usize;
        if raw.len() != 4 + name_len + 8 {
            return None;
        }
        let name = std::str::from_utf8(&raw[4..4 + name_len]).ok()?.to_string();
        let revision = BigEndian::read_u64(&raw[4 + name_len..]);
        Some(NameRevision { name, revision })
    }

    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        compare_name_revision(a, b)
    }
}

fn compare_name_revision(a: &[u8], b: &[u8]) -> Ordering {
    let split = |raw: &[u8]| -> (Vec<u8>, u64) {
        let name_len = (BigEndian::read_u32(raw) as usize).min(raw.len().saturating_sub(12));
        let name = raw[4..4 + name_len].to_vec();
        let revision = BigEndian::read_u64(&raw[4 + name_len..]);
        (name, revision)
    };
    let (name_a, rev_a) = split(a);
    let (name_b, rev_b) = split(b);
    name_a.cmp(&name_b).then(rev_a.cmp(&rev_b))
}

/// Key of the CopiedPages B-tree: a revision and the tree it belongs
/// to. Ordered by revision first so reclamation scans retire the
/// oldest revisions in one pass.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RevisionName {
    /// The revision that shadowed the pages.
    pub revision: u64,
    /// The managed tree name.
    pub name: String,
}

impl RevisionName {
    /// Builds a key for `revision` of `name`.
    pub fn new(revision: u64, name: impl Into<String>) -> Self {
        Self { revision, name: name.into() }
    }
}

/// Codec for [`RevisionName`]: `[revision:8][nameLen:4][name]`.
#[derive(Debug, Clone, Copy, Default)]
pub struct RevisionNameCodec;

impl KeyCodec<RevisionName> for RevisionNameCodec {
    fn id(&self) -> &'static str {
        "revision-name"
    }

    fn encode(&self, key: &RevisionName, buf: &mut Vec<u8>) {
        buf.write_u64::<BigEndian>(key.revision).unwrap();
        buf.write_u32::<BigEndian>(key.name.len() as u32).unwrap();
        buf.extend_from_slice(key.name.as_bytes());
    }

    fn decode(&self, raw: &[u8]) -> Option<RevisionName> {
        if raw.len() < 12 {
            return None;
        }
        let revision = BigEndian::read_u64(raw);
        let name_len = BigEndian::read_u32(&raw[8..]) as usize;
        if raw.len() != 12 + name_len {
            return None;
        }
        let name = std::str::from_utf8(&raw[12..]).ok()?.to_string();
        Some(RevisionName { revision, name })
    }

    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        let rev_a = BigEndian::read_u64(a);
        let rev_b = BigEndian::read_u64(b);
        rev_a.cmp(&rev_b).then_with(|| a[12..].cmp(&b[12..]))
    }
}

/// Codec for a list of page offsets (the CopiedPages B-tree values):
/// `[count:4][offset:8]*`.
#[derive(Debug, Clone, Copy, Default)]
pub struct OffsetListCodec;

impl ValueCodec<Vec<u64>> for OffsetListCodec {
    fn id(&self) -> &'static str {
        "offset-list"
    }

    fn encode(&self, value: &Vec<u64>, buf: &mut Vec<u8>) {
        buf.write_u32::<BigEndian>(value.len() as u32).unwrap();
        for offset in value {
            buf.write_u64::<BigEndian>(*offset).unwrap();
        }
    }

    fn decode(&self, raw: &[u8]) -> Option<Vec<u64>> {
        if raw.len() < 4 {
            return None;
        }
        let count = BigEndian::read_u32(raw) as usize;
        if raw.len() != 4 + count * 8 {
            return None;
        }
        Some((0..count).map(|i| BigEndian::read_u64(&raw[4 + i * 8..])).collect())
    }
}

// ============================================================================
// Comparator registry
// ============================================================================

/// Resolves the comparator for a codec id recorded on disk. Unknown
/// ids fall back to plain byte comparison, which matches every codec
/// with an order-preserving encoding.
pub(crate) fn comparator_for(id: &str) -> KeyCmp {
    match id {
        "name-revision" => KeyCmp::new(compare_name_revision),
        "revision-name" => KeyCmp::new(|a, b| KeyCodec::compare(&RevisionNameCodec, a, b)),
        "u64" | "i64" | "str" | "bytes" | "offset-list" => KeyCmp::new(|a, b| a.cmp(b)),
        other => {
            tracing::debug!(codec = other, "unknown codec id, using byte comparison");
            KeyCmp::new(|a, b| a.cmp(b))
        }
    }
}

/// Wraps a typed key codec into an engine-level comparator.
pub(crate) fn key_cmp_of<K: 'static>(codec: &Arc<dyn KeyCodec<K>>) -> KeyCmp {
    let codec = Arc::clone(codec);
    KeyCmp::new(move |a, b| codec.compare(a, b))
}

/// Wraps a typed value codec into an engine-level comparator for the
/// duplicate-values sub-trees.
pub(crate) fn value_cmp_of<V: 'static>(codec: &Arc<dyn ValueCodec<V>>) -> KeyCmp {
    let codec = Arc::clone(codec);
    KeyCmp::new(move |a, b| codec.compare(a, b))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_key<K, C: KeyCodec<K>>(codec: &C, key: &K) -> Vec<u8> {
        let mut buf = Vec::new();
        codec.encode(key, &mut buf);
        buf
    }

    #[test]
    fn u64_round_trip_and_ordering() {
        let codec = U64Codec;
        for value in [0u64, 1, 255, 1 << 40, u64::MAX] {
            let raw = encode_key(&codec, &value);
            assert_eq!(KeyCodec::decode(&codec, &raw), Some(value));
        }
        let lo = encode_key(&codec, &10u64);
        let hi = encode_key(&codec, &300u64);
        assert_eq!(KeyCodec::compare(&codec, &lo, &hi), Ordering::Less);
    }

    #[test]
    fn i64_sign_flip_preserves_order() {
        let codec = I64Codec;
        let values = [i64::MIN, -1000, -1, 0, 1, 1000, i64::MAX];
        let encoded: Vec<Vec<u8>> = values.iter().map(|v| encode_key(&codec, v)).collect();
        let mut sorted = encoded.clone();
        sorted.sort();
        assert_eq!(encoded, sorted);
        for v in values {
            assert_eq!(KeyCodec::decode(&codec, &encode_key(&codec, &v)), Some(v));
        }
    }

    #[test]
    fn name_revision_orders_by_name_then_revision() {
        let codec = NameRevisionCodec;
        // Lexicographically "b" < "ab" would hold under a naive byte
        // comparison of the length-prefixed form; the codec must not
        // fall into that trap.
        let ab0 = encode_key(&codec, &NameRevision::new("ab", 0));
        let b9 = encode_key(&codec, &NameRevision::new("b", 9));
        assert_eq!(codec.compare(&ab0, &b9), Ordering::Less);

        let t1 = encode_key(&codec, &NameRevision::new("t", 1));
        let t2 = encode_key(&codec, &NameRevision::new("t", 2));
        assert_eq!(codec.compare(&t1, &t2), Ordering::Less);

        let decoded = codec.decode(&ab0).unwrap();
        assert_eq!(decoded, NameRevision::new("ab", 0));
    }

    #[test]
    fn revision_name_orders_by_revision_first() {
        let codec = RevisionNameCodec;
        let r1z = encode_key(&codec, &RevisionName::new(1, "zzz"));
        let r2a = encode_key(&codec, &RevisionName::new(2, "aaa"));
        assert_eq!(codec.compare(&r1z, &r2a), Ordering::Less);
        assert_eq!(codec.decode(&r2a).unwrap(), RevisionName::new(2, "aaa"));
    }

    #[test]
    fn offset_list_round_trip() {
        let codec = OffsetListCodec;
        let offsets = vec![0x200u64, 0x400, 0x1000];
        let mut buf = Vec::new();
        codec.encode(&offsets, &mut buf);
        assert_eq!(buf.len(), 4 + 24);
        assert_eq!(codec.decode(&buf), Some(offsets));
        assert_eq!(codec.decode(&buf[..20]), None);
    }

    #[test]
    fn registry_resolves_internal_comparators() {
        let cmp = comparator_for("name-revision");
        let codec = NameRevisionCodec;
        let a = encode_key(&codec, &NameRevision::new("ab", 0));
        let b = encode_key(&codec, &NameRevision::new("b", 0));
        assert_eq!(cmp.compare(&a, &b), Ordering::Less);
    }
}
