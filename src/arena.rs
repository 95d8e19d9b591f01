//! Bounds-checked views over the caller-supplied byte arena.
//!
//! The broker never allocates or frees its buffers: the host process hands
//! it a region of registered memory and the broker only computes offsets
//! into it. [`Arena`] wraps the raw region and keeps every access bounds
//! checked; [`SlotRegion`] describes one peer's fixed-size slot window
//! within it.

use std::ptr::NonNull;

use crate::error::{Error, Result};

/// A caller-owned byte region the broker carves its windows out of.
///
/// The arena does not own the memory; the creator guarantees the region
/// outlives the arena and is not accessed concurrently from elsewhere.
pub struct Arena {
    base: NonNull<u8>,
    len: usize,
}

// One broker instance is driven by one thread, but that thread need not be
// the one that allocated the backing memory.
unsafe impl Send for Arena {}

impl Arena {
    /// Wrap a raw memory region.
    ///
    /// # Safety
    ///
    /// `base` must be valid for reads and writes of `len` bytes for the
    /// lifetime of the arena, and no other code may access the region
    /// while the arena (and the broker holding it) is alive.
    pub unsafe fn from_raw_parts(base: *mut u8, len: usize) -> Self {
        Self {
            base: NonNull::new(base).expect("arena base must not be null"),
            len,
        }
    }

    /// Base address of the region.
    #[inline]
    pub fn base_addr(&self) -> u64 {
        self.base.as_ptr() as u64
    }

    /// Length of the region in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the region is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    fn check(&self, offset: usize, len: usize) {
        assert!(
            offset.checked_add(len).is_some_and(|end| end <= self.len),
            "arena access out of bounds: offset {} len {} region {}",
            offset,
            len,
            self.len
        );
    }

    /// Borrow `len` bytes at `offset`.
    #[inline]
    pub fn slice(&self, offset: usize, len: usize) -> &[u8] {
        self.check(offset, len);
        unsafe { std::slice::from_raw_parts(self.base.as_ptr().add(offset), len) }
    }

    /// Mutably borrow `len` bytes at `offset`.
    #[inline]
    pub fn slice_mut(&mut self, offset: usize, len: usize) -> &mut [u8] {
        self.check(offset, len);
        unsafe { std::slice::from_raw_parts_mut(self.base.as_ptr().add(offset), len) }
    }

    /// Fill `len` bytes at `offset` with `byte`.
    pub fn fill(&mut self, offset: usize, len: usize, byte: u8) {
        self.slice_mut(offset, len).fill(byte);
    }
}

/// The registered memory region the arena lives inside.
///
/// Registration may cover more than the broker's arena: the payload
/// allocator shares the same backing pool through a disjoint offset range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackingRegion {
    /// Base address of the registered region.
    pub base: u64,
    /// Length of the registered region in bytes.
    pub len: u64,
}

impl BackingRegion {
    /// A backing region that covers exactly the arena.
    pub fn of_arena(arena: &Arena) -> Self {
        Self {
            base: arena.base_addr(),
            len: arena.len() as u64,
        }
    }
}

/// One peer's window of fixed-size slots within the arena.
#[derive(Debug, Clone, Copy)]
pub struct SlotRegion {
    base_offset: usize,
    slot_size: usize,
    slot_count: usize,
}

impl SlotRegion {
    /// Describe a window of `slot_count` slots of `slot_size` bytes
    /// starting at `base_offset`.
    pub fn new(base_offset: usize, slot_size: usize, slot_count: usize) -> Self {
        Self {
            base_offset,
            slot_size,
            slot_count,
        }
    }

    /// Arena offset of the given slot.
    #[inline]
    pub fn offset_of(&self, slot: usize) -> usize {
        assert!(
            slot < self.slot_count,
            "slot {} out of range (window holds {})",
            slot,
            self.slot_count
        );
        self.base_offset + slot * self.slot_size
    }

    /// Arena offset of the window start.
    #[inline]
    pub fn base_offset(&self) -> usize {
        self.base_offset
    }

    /// Size of one slot in bytes.
    #[inline]
    pub fn slot_size(&self) -> usize {
        self.slot_size
    }

    /// Number of slots in the window.
    #[inline]
    pub fn slot_count(&self) -> usize {
        self.slot_count
    }

    /// Total window size in bytes.
    #[inline]
    pub fn size(&self) -> usize {
        self.slot_size * self.slot_count
    }
}

/// Compute each peer's (receive, send) window pair.
///
/// Per peer: a receive window of `max_in_flight` slots immediately
/// followed by an equally sized send window, consecutive peers packed
/// back to back from arena offset 0. Fails if the arena cannot hold all
/// regions.
pub fn layout_peer_regions(
    num_peers: usize,
    max_in_flight: u32,
    max_msg_size: u32,
    arena_len: usize,
) -> Result<Vec<(SlotRegion, SlotRegion)>> {
    let window = max_in_flight as usize * max_msg_size as usize;
    let per_peer = 2 * window;
    let required = per_peer * num_peers;
    if required > arena_len {
        return Err(Error::ArenaTooSmall {
            required,
            available: arena_len,
        });
    }

    let regions = (0..num_peers)
        .map(|i| {
            let recv_base = per_peer * i;
            let recv = SlotRegion::new(recv_base, max_msg_size as usize, max_in_flight as usize);
            let send = SlotRegion::new(
                recv_base + window,
                max_msg_size as usize,
                max_in_flight as usize,
            );
            (recv, send)
        })
        .collect();
    Ok(regions)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arena_of(buf: &mut Vec<u8>) -> Arena {
        unsafe { Arena::from_raw_parts(buf.as_mut_ptr(), buf.len()) }
    }

    #[test]
    fn test_slice_roundtrip() {
        let mut buf = vec![0u8; 64];
        let mut arena = arena_of(&mut buf);

        arena.slice_mut(8, 4).copy_from_slice(&[1, 2, 3, 4]);
        assert_eq!(arena.slice(8, 4), &[1, 2, 3, 4]);
        assert_eq!(arena.slice(0, 1), &[0]);
    }

    #[test]
    #[should_panic(expected = "out of bounds")]
    fn test_slice_rejects_overflow() {
        let mut buf = vec![0u8; 16];
        let arena = arena_of(&mut buf);
        arena.slice(8, 16);
    }

    #[test]
    fn test_layout_is_disjoint_and_ordered() {
        // 3 peers, 4 slots of 32 bytes each way.
        let regions = layout_peer_regions(3, 4, 32, 3 * 2 * 4 * 32).unwrap();
        assert_eq!(regions.len(), 3);

        let mut expected = 0usize;
        for (recv, send) in &regions {
            assert_eq!(recv.base_offset(), expected);
            assert_eq!(send.base_offset(), expected + 4 * 32);
            assert_eq!(recv.size(), 4 * 32);
            assert_eq!(send.size(), 4 * 32);
            expected += 2 * 4 * 32;
        }
    }

    #[test]
    fn test_layout_rejects_small_arena() {
        match layout_peer_regions(2, 4, 32, 100) {
            Err(Error::ArenaTooSmall {
                required,
                available,
            }) => {
                assert_eq!(required, 2 * 2 * 4 * 32);
                assert_eq!(available, 100);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_slot_offsets() {
        let region = SlotRegion::new(256, 64, 8);
        assert_eq!(region.offset_of(0), 256);
        assert_eq!(region.offset_of(7), 256 + 7 * 64);
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn test_slot_out_of_range() {
        let region = SlotRegion::new(0, 64, 8);
        region.offset_of(8);
    }
}
