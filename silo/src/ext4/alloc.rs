//! Block and inode allocation for the EXT4 formatter.

use silo_shared::{SiloError, SiloResult};

use super::layout::{BLOCKS_PER_GROUP, BLOCK_SIZE};

/// Best-fit allocator over the filesystem-wide block bitmap.
///
/// One bit per block across all groups; at close time the bitmap is
/// sliced into per-group bitmap blocks. Best-fit keeps big runs intact
/// for large files, which keeps extent counts low.
#[derive(Debug)]
pub struct BlockAllocator {
    bits: Vec<u8>,
    block_count: u32,
    free: u32,
}

impl BlockAllocator {
    pub fn new(block_count: u32) -> Self {
        let bytes = (block_count as usize).div_ceil(8);
        Self {
            bits: vec![0u8; bytes],
            block_count,
            free: block_count,
        }
    }

    pub fn free_count(&self) -> u32 {
        self.free
    }

    fn is_set(&self, block: u32) -> bool {
        self.bits[block as usize / 8] & (1 << (block % 8)) != 0
    }

    fn set(&mut self, block: u32) {
        self.bits[block as usize / 8] |= 1 << (block % 8);
    }

    fn clear(&mut self, block: u32) {
        self.bits[block as usize / 8] &= !(1 << (block % 8));
    }

    /// Reserve a specific range (metadata regions at open time).
    pub fn reserve(&mut self, start: u32, len: u32) -> SiloResult<()> {
        for block in start..start + len {
            if block >= self.block_count {
                return Err(SiloError::Internal(format!(
                    "metadata reservation {} beyond end of image",
                    block
                )));
            }
            if self.is_set(block) {
                return Err(SiloError::Internal(format!(
                    "double reservation of block {}",
                    block
                )));
            }
            self.set(block);
            self.free -= 1;
        }
        Ok(())
    }

    /// Allocate up to `want` contiguous blocks, best-fit: the smallest
    /// free run that holds the request, or the largest run available when
    /// none does. Returns `(start, len)` with `len <= want`.
    pub fn allocate(&mut self, want: u32) -> SiloResult<(u32, u32)> {
        if want == 0 {
            return Err(SiloError::Internal("zero-length allocation".into()));
        }
        if self.free == 0 {
            return Err(SiloError::Io("no space left on image".into()));
        }

        let mut best_fit: Option<(u32, u32)> = None;
        let mut largest: (u32, u32) = (0, 0);

        let mut run_start = 0u32;
        let mut run_len = 0u32;
        for block in 0..=self.block_count {
            let free = block < self.block_count && !self.is_set(block);
            if free {
                if run_len == 0 {
                    run_start = block;
                }
                run_len += 1;
                continue;
            }
            if run_len > 0 {
                if run_len >= want {
                    let better = match best_fit {
                        Some((_, len)) => run_len < len,
                        None => true,
                    };
                    if better {
                        best_fit = Some((run_start, run_len));
                        if run_len == want {
                            break;
                        }
                    }
                } else if run_len > largest.1 {
                    largest = (run_start, run_len);
                }
                run_len = 0;
            }
        }

        let (start, available) = match best_fit {
            Some((start, _)) => (start, want),
            None => (largest.0, largest.1),
        };
        for block in start..start + available {
            self.set(block);
        }
        self.free -= available;
        Ok((start, available))
    }

    /// Allocate exactly one block.
    pub fn allocate_one(&mut self) -> SiloResult<u32> {
        let (start, len) = self.allocate(1)?;
        debug_assert_eq!(len, 1);
        Ok(start)
    }

    /// Return a run to the free pool.
    pub fn release(&mut self, start: u32, len: u32) {
        for block in start..start + len {
            if self.is_set(block) {
                self.clear(block);
                self.free += 1;
            }
        }
    }

    /// One group's bitmap block. Bits past the end of the image (short
    /// last group) read as allocated, matching what mke2fs writes.
    pub fn group_bitmap_block(&self, group: u32) -> [u8; BLOCK_SIZE as usize] {
        let mut out = [0xFFu8; BLOCK_SIZE as usize];
        let start = group * BLOCKS_PER_GROUP;
        let in_group = (self.block_count.saturating_sub(start)).min(BLOCKS_PER_GROUP);
        for i in 0..in_group {
            let block = start + i;
            let byte = (i / 8) as usize;
            let bit = 1u8 << (i % 8);
            if self.is_set(block) {
                out[byte] |= bit;
            } else {
                out[byte] &= !bit;
            }
        }
        out
    }

    /// Free blocks within one group, counted from the bitmap itself.
    pub fn group_free_blocks(&self, group: u32) -> u32 {
        let start = group * BLOCKS_PER_GROUP;
        let in_group = (self.block_count.saturating_sub(start)).min(BLOCKS_PER_GROUP);
        (0..in_group)
            .filter(|i| !self.is_set(start + i))
            .count() as u32
    }
}

/// Inode number allocator: bump plus a free list from unlinks.
#[derive(Debug)]
pub struct InodeAllocator {
    next: u32,
    limit: u32,
    recycled: Vec<u32>,
}

impl InodeAllocator {
    /// `first` is the first allocatable inode number, `count` the table
    /// capacity in inodes.
    pub fn new(first: u32, count: u32) -> Self {
        Self {
            next: first,
            limit: count,
            recycled: Vec::new(),
        }
    }

    pub fn allocate(&mut self) -> SiloResult<u32> {
        if let Some(ino) = self.recycled.pop() {
            return Ok(ino);
        }
        if self.next > self.limit {
            return Err(SiloError::Io("no free inodes left on image".into()));
        }
        let ino = self.next;
        self.next += 1;
        Ok(ino)
    }

    pub fn release(&mut self, ino: u32) {
        self.recycled.push(ino);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserve_then_allocate_skips_reserved() {
        let mut alloc = BlockAllocator::new(64);
        alloc.reserve(0, 10).unwrap();
        let (start, len) = alloc.allocate(4).unwrap();
        assert_eq!(start, 10);
        assert_eq!(len, 4);
    }

    #[test]
    fn test_best_fit_prefers_smallest_sufficient_run() {
        let mut alloc = BlockAllocator::new(100);
        // Carve free runs of 20 (0..20), 5 (30..35), 50 (50..100).
        alloc.reserve(20, 10).unwrap();
        alloc.reserve(35, 15).unwrap();
        let (start, len) = alloc.allocate(5).unwrap();
        assert_eq!((start, len), (30, 5));
        // Next request for 5 takes the head of the 20-run.
        let (start, len) = alloc.allocate(5).unwrap();
        assert_eq!((start, len), (0, 5));
    }

    #[test]
    fn test_allocate_falls_back_to_largest_run() {
        let mut alloc = BlockAllocator::new(32);
        alloc.reserve(10, 2).unwrap();
        alloc.reserve(20, 2).unwrap();
        // Free runs: 10, 8, 10. Request 100: get the first largest (10).
        let (start, len) = alloc.allocate(100).unwrap();
        assert_eq!(len, 10);
        assert_eq!(start, 0);
    }

    #[test]
    fn test_release_makes_space_reusable() {
        let mut alloc = BlockAllocator::new(16);
        let (start, len) = alloc.allocate(16).unwrap();
        assert_eq!(len, 16);
        assert!(alloc.allocate(1).is_err());
        alloc.release(start, 4);
        assert_eq!(alloc.free_count(), 4);
        let (start2, len2) = alloc.allocate(4).unwrap();
        assert_eq!((start2, len2), (start, 4));
    }

    #[test]
    fn test_group_bitmap_marks_padding_used() {
        // 40-block "image": bits 40.. of the single group read allocated.
        let alloc = BlockAllocator::new(40);
        let bitmap = alloc.group_bitmap_block(0);
        assert_eq!(bitmap[0], 0x00);
        assert_eq!(bitmap[5], 0xFF); // blocks 40..47
        assert_eq!(alloc.group_free_blocks(0), 40);
    }

    #[test]
    fn test_inode_allocator_recycles() {
        let mut inodes = InodeAllocator::new(11, 32);
        assert_eq!(inodes.allocate().unwrap(), 11);
        assert_eq!(inodes.allocate().unwrap(), 12);
        inodes.release(11);
        assert_eq!(inodes.allocate().unwrap(), 11);
    }
}
