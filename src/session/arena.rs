use crate::util::round_up;

/// Allocation granularity the regions are rounded up to.
pub const ALLOC_GRANULARITY: usize = 4096;

/// Identifies one registered buffer region within a session.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct RegionId(pub u32);

/// One fixed-size slot inside a registered region: {region, offset, length}.
/// Descriptors are built once and recycled for the lifetime of the session;
/// they are never reallocated.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct BufDescriptor {
    pub region: RegionId,
    pub offset: u32,
    pub len: u32,
}

/// A contiguous pre-allocated memory region sliced into `slot_count` slots of
/// `slot_size` bytes. This is the zero-copy discipline of the benchmark: slots
/// are handed to the I/O layer by descriptor and reused for every operation,
/// never copied or reallocated.
pub struct BufferArena {
    id: RegionId,
    region: Vec<u8>,
    slot_size: usize,
    slot_count: usize,
}

impl BufferArena {
    /// Reserve a region for `slot_count` messages of `slot_size` bytes,
    /// rounded up to the allocation granularity. The region is eagerly
    /// zero-initialized - slots are reused aggressively, so lazy
    /// initialization would buy nothing.
    pub fn allocate(id: RegionId, slot_size: usize, slot_count: usize) -> BufferArena {
        let desired = slot_size * slot_count;
        let actual = round_up(desired, ALLOC_GRANULARITY);

        BufferArena {
            id,
            region: vec![0; actual],
            slot_size,
            slot_count,
        }
    }

    pub fn id(&self) -> RegionId {
        self.id
    }

    pub fn slot_count(&self) -> usize {
        self.slot_count
    }

    pub fn slot_size(&self) -> usize {
        self.slot_size
    }

    pub fn region_len(&self) -> usize {
        self.region.len()
    }

    /// The descriptor for slot `index`.
    pub fn descriptor(&self, index: usize) -> BufDescriptor {
        assert!(index < self.slot_count);
        BufDescriptor {
            region: self.id,
            offset: (index * self.slot_size) as u32,
            len: self.slot_size as u32,
        }
    }

    pub fn slot(&self, desc: BufDescriptor) -> &[u8] {
        debug_assert_eq!(desc.region, self.id);
        let offset = desc.offset as usize;
        &self.region[offset..offset + desc.len as usize]
    }

    pub fn slot_mut(&mut self, desc: BufDescriptor) -> &mut [u8] {
        debug_assert_eq!(desc.region, self.id);
        let offset = desc.offset as usize;
        &mut self.region[offset..offset + desc.len as usize]
    }
}
