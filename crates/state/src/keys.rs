//! Key encoding for the storage layer.
//!
//! Composite keys lay a big-endian partition component ahead of a big-endian
//! clustering component, so lexicographic byte order matches numeric order
//! and a single-partition scan is a plain prefix scan:
//!
//! ```text
//! {partition:8BE}{clustering:8BE}
//! ```
//!
//! Edge forward tables partition by the `from` side, inverse tables by the
//! `to` side — that placement is what keeps "who does X follow" and "who
//! follows X" both single-partition reads.

/// Encodes a single-id key (entity tables, counter rows).
pub fn encode_id(id: i64) -> Vec<u8> {
    id.to_be_bytes().to_vec()
}

/// Encodes a composite `{partition:8BE}{clustering:8BE}` key.
pub fn encode_pair(partition: i64, clustering: i64) -> Vec<u8> {
    let mut key = Vec::with_capacity(16);
    key.extend_from_slice(&partition.to_be_bytes());
    key.extend_from_slice(&clustering.to_be_bytes());
    key
}

/// Creates the prefix for scanning an entire partition.
pub fn partition_prefix(partition: i64) -> [u8; 8] {
    partition.to_be_bytes()
}

/// Decodes a composite key back into `(partition, clustering)`.
///
/// Returns None if the key is not exactly 16 bytes.
pub fn decode_pair(key: &[u8]) -> Option<(i64, i64)> {
    if key.len() != 16 {
        return None;
    }
    let partition = i64::from_be_bytes(key[..8].try_into().ok()?);
    let clustering = i64::from_be_bytes(key[8..].try_into().ok()?);
    Some((partition, clustering))
}

/// Extracts the clustering component of a composite key.
pub fn clustering_of(key: &[u8]) -> Option<i64> {
    decode_pair(key).map(|(_, clustering)| clustering)
}

/// Encodes a slug or nick lookup key.
///
/// Unique text indexes are keyed by the raw UTF-8 bytes; values carry the
/// owning entity id.
pub fn encode_text_key(text: &str) -> Vec<u8> {
    text.as_bytes().to_vec()
}
