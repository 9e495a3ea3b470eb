//! Frame-info registry (spec.md 4.D).
//!
//! A hash map from return-address to frame-info record, populated at
//! JIT-time by [`FrameRegistry::register_frames`] from a packed descriptor
//! blob the code generator emits (spec.md "Data formats": one
//! `(return_address, frame_size_u16, num_live_offsets_u16,
//! live_offsets_i16[])` record per safepoint, 32-bit aligned).

use rustc_hash::FxHashMap;
use parking_lot::RwLock;
use std::sync::Arc;

/// Per-return-address description of a JIT-compiled frame's live GC roots.
#[derive(Debug, Clone)]
pub struct FrameInfo {
    /// Size in bytes of the frame this return address belongs to.
    pub frame_size: usize,
    /// Byte offsets, relative to the frame's base, of live GC reference
    /// slots. The low bit of an offset is a tag: when set, the slot holds a
    /// non-object intermediate value the scanner must skip rather than
    /// treat as a reference (spec.md 3, "Frame info").
    pub live_offsets: Arc<[i16]>,
    /// Opaque language-level metadata (method identity, line table, ...),
    /// used for backtrace printing and the "metadata-only" stack-walk
    /// filter. `None` marks a frame with no managed metadata (a native
    /// frame bridged only by a known-frame marker).
    pub metadata: Option<Arc<str>>,
}

impl FrameInfo {
    /// The sentinel record returned for a registry miss: zero live
    /// offsets, no metadata, so callers never need to null-check a lookup
    /// (spec.md 4.D).
    pub fn empty() -> Self {
        FrameInfo {
            frame_size: 0,
            live_offsets: Arc::from([]),
            metadata: None,
        }
    }

    /// True if `offset`'s low bit is set, marking it a non-reference
    /// intermediate value the scanner must skip.
    #[inline]
    pub fn is_tagged_skip(offset: i16) -> bool {
        offset & 1 != 0
    }

    /// True if this record carries language metadata, i.e. belongs to a
    /// JIT-compiled managed frame rather than a bridged native one.
    #[inline]
    pub fn is_managed(&self) -> bool {
        self.metadata.is_some()
    }
}

/// A single parsed entry from a frame-info descriptor blob, prior to
/// insertion.
struct BlobEntry {
    return_address: usize,
    info: FrameInfo,
}

/// Errors from parsing a malformed frame-info descriptor blob.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameBlobError {
    /// The blob ended in the middle of a record header.
    #[error("frame-info blob truncated at offset {offset}")]
    Truncated {
        /// Byte offset the parser was at when it ran out of input.
        offset: usize,
    },
}

/// The process-wide return-address → frame-info map.
///
/// Insertion is serialized behind a lock (spec.md 4.D); lookups are
/// lock-free-correct because entries are append-only and never mutated
/// after `register_frames` inserts them — readers take a brief read lock
/// only to clone the `Arc`-backed fields out, never blocking on a writer
/// for longer than a single hash-map insert.
pub struct FrameRegistry {
    table: RwLock<FxHashMap<usize, FrameInfo>>,
}

impl FrameRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        FrameRegistry {
            table: RwLock::new(FxHashMap::default()),
        }
    }

    /// Looks up the frame-info record for `return_address`. Returns
    /// [`FrameInfo::empty`] on a miss.
    pub fn lookup(&self, return_address: usize) -> FrameInfo {
        self.table
            .read()
            .get(&return_address)
            .cloned()
            .unwrap_or_else(FrameInfo::empty)
    }

    /// True if `return_address` has a registered record.
    pub fn contains(&self, return_address: usize) -> bool {
        self.table
            .read()
            .contains_key(&return_address)
    }

    /// Registers one frame directly (used by tests and by embedders that
    /// build `FrameInfo` without going through a packed blob).
    pub fn register_one(&self, return_address: usize, info: FrameInfo) {
        self.table
            .write()
            .insert(return_address, info);
    }

    /// Parses a packed descriptor blob emitted by the code generator and
    /// registers every entry it contains. Layout per spec.md "Data
    /// formats": `(return_address: usize, frame_size: u16,
    /// num_live_offsets: u16, live_offsets: [i16; num_live_offsets])`,
    /// 32-bit aligned, with one padding halfword if the record's tail isn't
    /// already word-aligned.
    pub fn register_frames(&self, blob: &[u8], metadata: impl Fn(usize) -> Option<Arc<str>>) -> Result<usize, FrameBlobError> {
        let entries = parse_blob(blob, &metadata)?;
        let count = entries.len();
        let mut table = self.table.write();
        for entry in entries {
            table.insert(entry.return_address, entry.info);
        }
        Ok(count)
    }
}

impl Default for FrameRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_blob(blob: &[u8], metadata: &impl Fn(usize) -> Option<Arc<str>>) -> Result<Vec<BlobEntry>, FrameBlobError> {
    let word = std::mem::size_of::<usize>();
    let mut pos = 0usize;
    let mut out = Vec::new();

    while pos < blob.len() {
        let header_len = word + 2 + 2;
        if pos + header_len > blob.len() {
            return Err(FrameBlobError::Truncated { offset: pos });
        }
        let return_address = read_usize(blob, pos);
        pos += word;
        let frame_size = u16::from_ne_bytes([blob[pos], blob[pos + 1]]) as usize;
        pos += 2;
        let num_live_offsets = u16::from_ne_bytes([blob[pos], blob[pos + 1]]) as usize;
        pos += 2;

        let offsets_len = num_live_offsets * 2;
        if pos + offsets_len > blob.len() {
            return Err(FrameBlobError::Truncated { offset: pos });
        }
        let mut live_offsets = Vec::with_capacity(num_live_offsets);
        for i in 0..num_live_offsets {
            let off = pos + i * 2;
            live_offsets.push(i16::from_ne_bytes([blob[off], blob[off + 1]]));
        }
        pos += offsets_len;

        // Pad to a 32-bit boundary if the record's tail isn't aligned.
        if pos % 4 != 0 {
            pos += 2;
        }

        out.push(BlobEntry {
            return_address,
            info: FrameInfo {
                frame_size,
                live_offsets: Arc::from(live_offsets),
                metadata: metadata(return_address),
            },
        });
    }

    Ok(out)
}

fn read_usize(blob: &[u8], pos: usize) -> usize {
    let word = std::mem::size_of::<usize>();
    let mut buf = [0u8; std::mem::size_of::<usize>()];
    buf.copy_from_slice(&blob[pos..pos + word]);
    usize::from_ne_bytes(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_entry(return_address: usize, frame_size: u16, live_offsets: &[i16]) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&return_address.to_ne_bytes());
        buf.extend_from_slice(&frame_size.to_ne_bytes());
        buf.extend_from_slice(&(live_offsets.len() as u16).to_ne_bytes());
        for off in live_offsets {
            buf.extend_from_slice(&off.to_ne_bytes());
        }
        if buf.len() % 4 != 0 {
            buf.extend_from_slice(&0u16.to_ne_bytes());
        }
        buf
    }

    #[test]
    fn lookup_miss_returns_empty_sentinel() {
        let registry = FrameRegistry::new();
        let info = registry.lookup(0xdead_beef);
        assert_eq!(info.frame_size, 0);
        assert!(info.live_offsets.is_empty());
        assert!(!info.is_managed());
    }

    #[test]
    fn register_frames_parses_multiple_entries() {
        let registry = FrameRegistry::new();
        let mut blob = Vec::new();
        blob.extend(encode_entry(0x1000, 64, &[8, 16, 25]));
        blob.extend(encode_entry(0x2000, 32, &[]));

        let n = registry.register_frames(&blob, |_| Some(Arc::from("m"))).unwrap();
        assert_eq!(n, 2);

        let info = registry.lookup(0x1000);
        assert_eq!(info.frame_size, 64);
        assert_eq!(&*info.live_offsets, &[8, 16, 25]);
        assert!(FrameInfo::is_tagged_skip(25));
        assert!(!FrameInfo::is_tagged_skip(8));
        assert!(info.is_managed());

        assert_eq!(registry.lookup(0x2000).frame_size, 32);
        assert!(!registry.contains(0x3000));
    }

    #[test]
    fn truncated_blob_is_rejected() {
        let registry = FrameRegistry::new();
        let blob = vec![0u8; 3];
        assert_eq!(
            registry.register_frames(&blob, |_| None),
            Err(FrameBlobError::Truncated { offset: 0 })
        );
    }

    #[test]
    fn every_registered_address_round_trips() {
        let registry = FrameRegistry::new();
        let mut blob = Vec::new();
        let addresses = [0x10usize, 0x20, 0x30, 0x40];
        for a in addresses {
            blob.extend(encode_entry(a, 16, &[0]));
        }
        registry.register_frames(&blob, |_| None).unwrap();
        for a in addresses {
            assert_eq!(registry.lookup(a).frame_size, 16);
        }
    }
}
