pub mod export;
pub mod query;
pub mod relations;
pub mod search;
pub mod stats;
pub mod store;
pub mod types;

/// Prefix shared by every memory id.
pub const ID_PREFIX: &str = "mem-";

/// Ids with more than this many digits are timestamp fallbacks, not sequence numbers.
pub const MAX_SEQUENTIAL_DIGITS: usize = 9;

/// Format a sequence number as `mem-NNN` (zero-padded to three digits).
pub fn format_id(n: u64) -> String {
    format!("{ID_PREFIX}{n:03}")
}

/// Sequence number of a `mem-NNN` id. Timestamp-based and malformed ids yield `None`.
pub fn parse_id_number(id: &str) -> Option<u64> {
    let digits = id.strip_prefix(ID_PREFIX)?;
    if digits.is_empty()
        || digits.len() > MAX_SEQUENTIAL_DIGITS
        || !digits.bytes().all(|b| b.is_ascii_digit())
    {
        return None;
    }
    digits.parse().ok()
}

/// True for anything shaped like a memory id (`mem-` followed by digits).
pub fn is_memory_id(token: &str) -> bool {
    token
        .strip_prefix(ID_PREFIX)
        .is_some_and(|d| !d.is_empty() && d.bytes().all(|b| b.is_ascii_digit()))
}

/// Encode an embedding as little-endian f32 bytes.
pub fn embedding_to_bytes(embedding: &[f32]) -> Vec<u8> {
    embedding.iter().flat_map(|f| f.to_le_bytes()).collect()
}

/// Decode little-endian f32 bytes. Trailing bytes that do not fill a float are ignored.
pub fn bytes_to_embedding(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}
