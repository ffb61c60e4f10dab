//! Chunk range arithmetic and naming
//!
//! Writes are cut into pieces of at most one I/O unit, measured from the
//! start of the write. Each piece's payload is stored under a chunk key
//! made of the logical filename and a dataspace id from the store counter.

use crate::VIRTUAL_PREFIX;

/// Split `[offset, offset + size)` into `(offset, len)` pieces of at most `unit` bytes
pub fn split_range(offset: u64, size: u64, unit: u64) -> Vec<(u64, u64)> {
    let unit = unit.max(1);
    let mut pieces = Vec::with_capacity(size.div_ceil(unit) as usize);
    let mut done = 0;
    while done < size {
        let len = unit.min(size - done);
        pieces.push((offset + done, len));
        done += len;
    }
    pieces
}

/// Payload key for one chunk of a logical file
pub fn chunk_key(filename: &str, dataspace_id: u64) -> String {
    format!("{}#{}", filename, dataspace_id)
}

/// Whether a path is handled by burstio rather than passed through
pub fn is_virtual(path: &str) -> bool {
    path.starts_with(VIRTUAL_PREFIX)
}

/// Logical filename of a virtualized path. Non-virtual paths are returned unchanged.
pub fn strip_virtual_prefix(path: &str) -> &str {
    path.strip_prefix(VIRTUAL_PREFIX).unwrap_or(path)
}
