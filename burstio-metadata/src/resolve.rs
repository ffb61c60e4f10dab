//! Chunk resolution
//!
//! Maps a logical byte range onto the chunk ring. The ring is walked newest
//! first; each byte is claimed by the first chunk covering it, so a later
//! write always shadows an earlier overlapping one. Bytes no chunk covers
//! fall back to the parallel file system, one descriptor per contiguous gap.

use burstio_core::{ChunkMeta, File, FileMeta, Location};

/// Resolve `[offset, offset + size)` of `filename` against its chunk ring.
///
/// The returned descriptors are sorted by logical offset and their
/// `actual_user_chunk` ranges exactly tile the requested range.
pub fn resolve_range(
    meta: Option<&FileMeta>,
    filename: &str,
    offset: u64,
    size: u64,
) -> Vec<ChunkMeta> {
    let mut resolved = Vec::new();
    if size == 0 {
        return resolved;
    }

    let mut unresolved = vec![(offset, offset + size)];

    for chunk in meta.into_iter().flat_map(|m| m.newest_first()) {
        if unresolved.is_empty() {
            break;
        }

        let user = &chunk.actual_user_chunk;
        let mut remaining = Vec::with_capacity(unresolved.len() + 1);
        for (start, end) in unresolved {
            let Some((lo, hi)) = user.intersect(start, end) else {
                remaining.push((start, end));
                continue;
            };

            resolved.push(slice_of(chunk, filename, lo, hi));
            if start < lo {
                remaining.push((start, lo));
            }
            if hi < end {
                remaining.push((hi, end));
            }
        }
        unresolved = remaining;
    }

    for (start, end) in unresolved {
        resolved.push(ChunkMeta::new(
            File::new(Location::Pfs, filename, start, end - start),
            File::new(Location::Pfs, filename, start, end - start),
        ));
    }

    resolved.sort_by_key(|c| c.actual_user_chunk.offset);
    resolved
}

/// Descriptor for the `[lo, hi)` part of a chunk
fn slice_of(chunk: &ChunkMeta, filename: &str, lo: u64, hi: u64) -> ChunkMeta {
    let src = &chunk.destination;
    let skip = lo - chunk.actual_user_chunk.offset;

    let mut destination = File::new(src.location, src.filename.clone(), src.offset + skip, hi - lo);
    destination.worker = src.worker;
    destination.server = src.server;

    ChunkMeta::new(
        File::new(src.location, filename, lo, hi - lo),
        destination,
    )
}
