//! Bump arena for aggregate-function states.
//!
//! Per-group state regions are allocated here and addressed by
//! [`StatePtr`] handles (chunk index + byte offset) instead of raw
//! pointers, so shared ownership of a result's states is an `Arc` around
//! the arena rather than back-pointers into it.

use crate::error::Result;

const INITIAL_CHUNK_SIZE: usize = 4096;
const MAX_CHUNK_SIZE: usize = 1024 * 1024;

/// Handle to a state region inside an [`Arena`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StatePtr {
    chunk: u32,
    offset: u32,
}

impl StatePtr {
    /// Sentinel for "allocation started but states were never constructed".
    /// The destructor walk skips it.
    pub const NULL: StatePtr = StatePtr { chunk: u32::MAX, offset: u32::MAX };

    pub fn is_null(&self) -> bool {
        self.chunk == u32::MAX
    }

    /// Shifts the chunk index after this pointer's arena was absorbed into
    /// another one at `base`.
    pub fn rebase(&self, base: u32) -> StatePtr {
        if self.is_null() {
            *self
        } else {
            StatePtr { chunk: self.chunk + base, offset: self.offset }
        }
    }
}

pub struct Arena {
    chunks: Vec<Vec<u8>>,
    next_chunk_size: usize,
}

impl Arena {
    pub fn new() -> Self {
        Self { chunks: Vec::new(), next_chunk_size: INITIAL_CHUNK_SIZE }
    }

    /// Allocates a zeroed region of `size` bytes.
    pub fn alloc(&mut self, size: usize) -> StatePtr {
        let needs_chunk = match self.chunks.last() {
            Some(chunk) => chunk.capacity() - chunk.len() < size,
            None => true,
        };
        if needs_chunk {
            let capacity = self.next_chunk_size.max(size);
            self.chunks.push(Vec::with_capacity(capacity));
            self.next_chunk_size = (self.next_chunk_size * 2).min(MAX_CHUNK_SIZE);
        }
        let chunk_index = self.chunks.len() - 1;
        let chunk = &mut self.chunks[chunk_index];
        let offset = chunk.len();
        chunk.resize(offset + size, 0);
        StatePtr { chunk: chunk_index as u32, offset: offset as u32 }
    }

    pub fn slice(&self, ptr: StatePtr, len: usize) -> &[u8] {
        let offset = ptr.offset as usize;
        &self.chunks[ptr.chunk as usize][offset..offset + len]
    }

    pub fn slice_mut(&mut self, ptr: StatePtr, len: usize) -> &mut [u8] {
        let offset = ptr.offset as usize;
        &mut self.chunks[ptr.chunk as usize][offset..offset + len]
    }

    /// Takes over another arena's chunks, keeping its allocations alive.
    /// Returns the base to [`StatePtr::rebase`] the absorbed pointers with.
    pub fn absorb(&mut self, other: Arena) -> Result<u32> {
        let base = self.chunks.len() as u32;
        self.chunks.extend(other.chunks);
        Ok(base)
    }

    /// Total bytes currently allocated.
    pub fn allocated_bytes(&self) -> usize {
        self.chunks.iter().map(|c| c.len()).sum()
    }
}

impl Default for Arena {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_and_write() {
        let mut arena = Arena::new();
        let a = arena.alloc(16);
        let b = arena.alloc(16);
        arena.slice_mut(a, 16).copy_from_slice(&[1u8; 16]);
        arena.slice_mut(b, 16).copy_from_slice(&[2u8; 16]);
        assert_eq!(arena.slice(a, 16), &[1u8; 16]);
        assert_eq!(arena.slice(b, 16), &[2u8; 16]);
    }

    #[test]
    fn test_alloc_spills_to_new_chunks() {
        let mut arena = Arena::new();
        let ptrs: Vec<_> = (0..100).map(|_| arena.alloc(INITIAL_CHUNK_SIZE / 2)).collect();
        assert!(arena.allocated_bytes() >= 100 * INITIAL_CHUNK_SIZE / 2);
        // Earlier allocations stay addressable after growth.
        assert_eq!(arena.slice(ptrs[0], 8), &[0u8; 8]);
    }

    #[test]
    fn test_absorb_rebases_pointers() {
        let mut dst = Arena::new();
        dst.alloc(8);

        let mut src = Arena::new();
        let p = src.alloc(8);
        src.slice_mut(p, 8).copy_from_slice(&[7u8; 8]);

        let base = dst.absorb(src).unwrap();
        let rebased = p.rebase(base);
        assert_eq!(dst.slice(rebased, 8), &[7u8; 8]);
    }

    #[test]
    fn test_null_pointer() {
        assert!(StatePtr::NULL.is_null());
        assert!(StatePtr::NULL.rebase(3).is_null());
    }
}
