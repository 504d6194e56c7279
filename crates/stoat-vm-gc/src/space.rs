//! Budgeted bump allocation over fixed-capacity chunks.
//!
//! A [`Space`] is a single-owner allocator: it is either the private
//! allocation area inside an outstanding part or the accumulated heap owned
//! by the manager. Chunk storage is `Vec<u64>` for 8-byte alignment and is
//! never grown in place, so object addresses stay stable across merges.

use std::ptr::NonNull;

use thiserror::Error;

use crate::object::{self, Address, ObjectHeader, align_up, object_footprint};

/// Chunk granularity for spaces without a budget (the accumulated heap).
const CHUNK_SIZE: usize = 16 * 1024;

/// Allocation failures surfaced to worker threads.
///
/// Running out of budget is the expected, recoverable signal that the owning
/// thread should release its part and re-acquire after a collection.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AllocError {
    /// The space's byte budget would be exceeded by this allocation.
    #[error("allocation budget exhausted")]
    BudgetExhausted,
    /// The object footprint does not fit an object header.
    #[error("object too large for an immutable space")]
    TooLarge,
}

/// A fixed-capacity memory region bump-allocated from the front.
struct Chunk {
    /// `Vec<u64>` guarantees 8-byte alignment; the vec is sized once at
    /// construction and never pushed to, so the buffer never relocates.
    storage: Vec<u64>,
    /// Bump offset in bytes.
    top: usize,
}

impl Chunk {
    fn new(capacity: usize) -> Self {
        Self {
            storage: vec![0u64; capacity.div_ceil(8)],
            top: 0,
        }
    }

    fn capacity(&self) -> usize {
        self.storage.len() * 8
    }

    fn allocate(&mut self, size: usize) -> Option<NonNull<u8>> {
        if self.top + size > self.capacity() {
            return None;
        }
        // SAFETY: top + size is within the storage buffer.
        let ptr = unsafe { self.storage.as_mut_ptr().cast::<u8>().add(self.top) };
        self.top += size;
        NonNull::new(ptr)
    }
}

/// A single-owner bump allocator with a byte budget.
pub struct Space {
    chunks: Vec<Chunk>,
    budget: Option<usize>,
    used: usize,
}

impl Space {
    /// Fresh empty space that may allocate at most `budget` bytes.
    pub fn with_budget(budget: usize) -> Self {
        Self {
            chunks: Vec::new(),
            budget: Some(align_up(budget)),
            used: 0,
        }
    }

    /// Fresh empty space with no budget (the accumulated-heap variant).
    pub fn unlimited() -> Self {
        Self {
            chunks: Vec::new(),
            budget: None,
            used: 0,
        }
    }

    /// Byte budget, or `None` for an unlimited space.
    pub fn budget(&self) -> Option<usize> {
        self.budget
    }

    /// Bytes consumed by allocated objects.
    pub fn used(&self) -> usize {
        self.used
    }

    /// Total chunk capacity, including bump slack.
    pub fn size(&self) -> usize {
        self.chunks.iter().map(Chunk::capacity).sum()
    }

    /// Allocate an object with `pointer_slots` slots and `payload_bytes` of
    /// raw payload. Slots start zeroed; the payload is uninitialized from the
    /// caller's point of view (the backing store is fresh zeroed memory).
    pub fn allocate_object(
        &mut self,
        pointer_slots: usize,
        payload_bytes: usize,
    ) -> Result<NonNull<ObjectHeader>, AllocError> {
        let footprint = object_footprint(pointer_slots, payload_bytes);
        if footprint > u32::MAX as usize {
            return Err(AllocError::TooLarge);
        }
        if let Some(budget) = self.budget
            && self.used + footprint > budget
        {
            return Err(AllocError::BudgetExhausted);
        }

        let raw = self.bump(footprint);
        let header = raw.cast::<ObjectHeader>();
        // SAFETY: raw points to `footprint` fresh bytes inside a chunk.
        unsafe {
            header
                .as_ptr()
                .write(ObjectHeader::new(footprint, pointer_slots));
            if pointer_slots > 0 {
                object::pointer_slot(header, 0).write_bytes(0, pointer_slots);
            }
        }
        self.used += footprint;
        Ok(header)
    }

    fn bump(&mut self, size: usize) -> NonNull<u8> {
        if let Some(chunk) = self.chunks.last_mut()
            && let Some(ptr) = chunk.allocate(size)
        {
            return ptr;
        }
        // Budgeted spaces size their chunk to the whole budget so a part is
        // one contiguous region in the common case.
        let capacity = match self.budget {
            Some(budget) => budget.max(size),
            None => CHUNK_SIZE.max(align_up(size)),
        };
        let mut chunk = Chunk::new(capacity);
        let ptr = chunk
            .allocate(size)
            .expect("fresh chunk sized to fit the request");
        self.chunks.push(chunk);
        ptr
    }

    /// Move another space's chunks and usage into this one. Objects keep
    /// their addresses; partially filled chunks keep their bump slack.
    pub fn adopt(&mut self, mut other: Space) {
        self.used += other.used;
        self.chunks.append(&mut other.chunks);
    }

    /// Walk every object header in allocation order.
    pub fn iterate_objects(&mut self, f: &mut dyn FnMut(NonNull<ObjectHeader>)) {
        for chunk in &mut self.chunks {
            let base = chunk.storage.as_mut_ptr().cast::<u8>();
            let mut offset = 0;
            while offset < chunk.top {
                // SAFETY: offset is an object start below the bump top.
                let header =
                    unsafe { NonNull::new_unchecked(base.add(offset)).cast::<ObjectHeader>() };
                let size = unsafe { header.as_ref() }.size();
                f(header);
                offset += size;
            }
        }
    }

    /// Invoke `visitor` on every pointer slot of every object.
    pub fn iterate_pointers(&mut self, visitor: &mut dyn FnMut(*mut Address)) {
        self.iterate_objects(&mut |header| {
            let slots = unsafe { header.as_ref() }.pointer_slots();
            for index in 0..slots {
                // SAFETY: index is within the object's slot count.
                visitor(unsafe { object::pointer_slot(header, index) });
            }
        });
    }

    /// Number of objects allocated in this space.
    pub fn object_count(&self) -> usize {
        let mut count = 0;
        for chunk in &self.chunks {
            let base = chunk.storage.as_ptr().cast::<u8>();
            let mut offset = 0;
            while offset < chunk.top {
                // SAFETY: offset is an object start below the bump top.
                let header = unsafe { &*base.add(offset).cast::<ObjectHeader>() };
                count += 1;
                offset += header.size();
            }
        }
        count
    }
}
