//! Splitting of long payloads.

/// Default maximum payload size accepted by the remote service per value.
pub const DEFAULT_CHUNK_SIZE: usize = 1023;

/// Smallest chunk size that can always hold one UTF-8 character.
pub const MIN_CHUNK_SIZE: usize = 4;

/// Splits `payload` into ordered chunks of at most `chunk_size` bytes.
///
/// Chunks end on UTF-8 character boundaries, so a chunk may be slightly
/// shorter than `chunk_size` when a multi-byte character straddles the limit.
/// An empty payload yields a single empty chunk. `chunk_size` values below
/// [`MIN_CHUNK_SIZE`] are raised to it.
pub fn split_chunks(payload: &str, chunk_size: usize) -> Vec<&str> {
    let limit = chunk_size.max(MIN_CHUNK_SIZE);
    if payload.len() <= limit {
        return vec![payload];
    }

    let mut chunks = Vec::with_capacity(payload.len() / limit + 1);
    let mut rest = payload;
    while rest.len() > limit {
        let mut cut = limit;
        while !rest.is_char_boundary(cut) {
            cut -= 1;
        }
        let (head, tail) = rest.split_at(cut);
        chunks.push(head);
        rest = tail;
    }
    chunks.push(rest);
    chunks
}
