use crate::Error;

/// A free range of parity positions: `[start, start + count)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
    pub start: u32,
    pub count: u32,
}

/// Per-drive parity-position allocator.
///
/// Position K means block K of that drive's files; the same index across all
/// drives forms the encoder's input vector. Free positions are a sorted list
/// of disjoint, non-adjacent extents below the bump high-water mark
/// `next_free`. Allocation is first-fit; freed ranges merge with neighbors,
/// and a merged extent that reaches `next_free` is absorbed back into it.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PosAllocator {
    next_free: u32,
    extents: Vec<Extent>,
}

impl PosAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restore allocator state from a content-file snapshot.
    pub fn restore(next_free: u32, extents: Vec<Extent>) -> Self {
        Self { next_free, extents }
    }

    pub fn next_free(&self) -> u32 {
        self.next_free
    }

    /// Raise the high-water mark to cover `[0, end)` (used when loading file
    /// records whose ranges must be owned by this allocator).
    pub fn cover(&mut self, end: u32) {
        if end > self.next_free {
            self.next_free = end;
        }
    }

    pub fn extents(&self) -> &[Extent] {
        &self.extents
    }

    /// Allocate `count` contiguous positions, first-fit.
    ///
    /// `count == 0` probes the current high-water mark without side effects.
    pub fn alloc(&mut self, count: u32) -> Result<u32, Error> {
        if count == 0 {
            return Ok(self.next_free);
        }

        for i in 0..self.extents.len() {
            let ext = self.extents[i];
            if ext.count < count {
                continue;
            }
            if ext.count == count {
                self.extents.remove(i);
            } else {
                self.extents[i].start += count;
                self.extents[i].count -= count;
            }
            return Ok(ext.start);
        }

        self.bump(count)
    }

    /// Claim `count` positions at the high-water mark, bypassing the free
    /// extents. Used to extend a range that already ends at `next_free`.
    pub fn bump(&mut self, count: u32) -> Result<u32, Error> {
        if count > u32::MAX - self.next_free {
            return Err(Error::NamespaceExhausted);
        }
        let start = self.next_free;
        self.next_free += count;
        Ok(start)
    }

    /// Return `[start, start + count)` to the free pool.
    ///
    /// The range must have been previously allocated and not freed since.
    pub fn free(&mut self, start: u32, count: u32) {
        if count == 0 {
            return;
        }

        let idx = self.extents.partition_point(|e| e.start < start);

        let merge_prev = idx > 0 && {
            let prev = self.extents[idx - 1];
            prev.start + prev.count == start
        };
        let merge_next = idx < self.extents.len() && start + count == self.extents[idx].start;

        match (merge_prev, merge_next) {
            (true, true) => {
                // Bridges two extents: fold the successor into the predecessor.
                let next = self.extents.remove(idx);
                let prev = &mut self.extents[idx - 1];
                prev.count += count + next.count;
            }
            (true, false) => self.extents[idx - 1].count += count,
            (false, true) => {
                let next = &mut self.extents[idx];
                next.start = start;
                next.count += count;
            }
            (false, false) => self.extents.insert(idx, Extent { start, count }),
        }

        // The rightmost extent must never touch next_free; absorb it.
        if let Some(last) = self.extents.last() {
            if last.start + last.count == self.next_free {
                self.next_free = last.start;
                self.extents.pop();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Extent, PosAllocator};
    use crate::Error;

    #[test]
    fn alloc_zero_probes_high_water() {
        let mut a = PosAllocator::new();
        assert_eq!(a.alloc(0).unwrap(), 0);
        assert_eq!(a.next_free(), 0);
        a.alloc(5).unwrap();
        assert_eq!(a.alloc(0).unwrap(), 5);
        assert_eq!(a.next_free(), 5);
    }

    #[test]
    fn sequential_allocations_bump() {
        let mut a = PosAllocator::new();
        assert_eq!(a.alloc(3).unwrap(), 0);
        assert_eq!(a.alloc(2).unwrap(), 3);
        assert_eq!(a.alloc(5).unwrap(), 5);
        assert_eq!(a.next_free(), 10);
        assert!(a.extents().is_empty());
    }

    #[test]
    fn free_reclaims_high_water() {
        let mut a = PosAllocator::new();
        a.alloc(8).unwrap();
        a.free(5, 3);
        assert_eq!(a.next_free(), 5);
        assert!(a.extents().is_empty());
    }

    #[test]
    fn free_creates_extent() {
        let mut a = PosAllocator::new();
        a.alloc(8).unwrap();
        a.free(2, 3);
        assert_eq!(a.extents(), &[Extent { start: 2, count: 3 }]);
        assert_eq!(a.next_free(), 8);
    }

    #[test]
    fn free_merges_left_neighbor() {
        let mut a = PosAllocator::new();
        a.alloc(10).unwrap();
        a.free(4, 4);
        a.free(2, 2);
        assert_eq!(a.extents(), &[Extent { start: 2, count: 6 }]);
    }

    #[test]
    fn free_merges_right_neighbor() {
        let mut a = PosAllocator::new();
        a.alloc(10).unwrap();
        a.free(2, 2);
        a.free(4, 2);
        assert_eq!(a.extents(), &[Extent { start: 2, count: 4 }]);
    }

    #[test]
    fn free_bridges_and_reclaims() {
        let mut a = PosAllocator::new();
        a.alloc(9).unwrap();
        a.free(0, 3);
        a.free(6, 3); // touches next_free=9, reclaimed immediately
        assert_eq!(a.extents().len(), 1);
        assert_eq!(a.next_free(), 6);
        a.free(3, 3); // bridges [0,3) and next_free=6, collapses to empty
        assert!(a.extents().is_empty());
        assert_eq!(a.next_free(), 0);
    }

    #[test]
    fn alloc_reuses_free_extent() {
        let mut a = PosAllocator::new();
        a.alloc(8).unwrap();
        a.free(2, 4);
        assert_eq!(a.alloc(2).unwrap(), 2);
        assert_eq!(a.extents(), &[Extent { start: 4, count: 2 }]);
        assert_eq!(a.next_free(), 8);
    }

    #[test]
    fn alloc_exact_fit_removes_extent() {
        let mut a = PosAllocator::new();
        a.alloc(8).unwrap();
        a.free(2, 3);
        assert_eq!(a.alloc(3).unwrap(), 2);
        assert!(a.extents().is_empty());
    }

    #[test]
    fn first_fit_skips_small_extents() {
        let mut a = PosAllocator::new();
        a.alloc(10).unwrap();
        a.free(1, 1);
        a.free(5, 3);
        assert_eq!(a.alloc(2).unwrap(), 5);
        assert_eq!(
            a.extents(),
            &[Extent { start: 1, count: 1 }, Extent { start: 7, count: 1 }]
        );
    }

    #[test]
    fn alloc_falls_back_to_bump() {
        let mut a = PosAllocator::new();
        a.alloc(5).unwrap();
        a.free(1, 1);
        assert_eq!(a.alloc(3).unwrap(), 5);
        assert_eq!(a.next_free(), 8);
        assert_eq!(a.extents().len(), 1);
    }

    #[test]
    fn frees_stay_sorted() {
        let mut a = PosAllocator::new();
        a.alloc(10).unwrap();
        a.free(7, 1);
        a.free(3, 1);
        a.free(1, 1);
        let starts: Vec<u32> = a.extents().iter().map(|e| e.start).collect();
        assert_eq!(starts, [1, 3, 7]);
    }

    #[test]
    fn bump_ignores_free_extents() {
        let mut a = PosAllocator::new();
        a.alloc(8).unwrap();
        a.free(0, 5); // a big extent first-fit would pick
        assert_eq!(a.bump(2).unwrap(), 8);
        assert_eq!(a.next_free(), 10);
        assert_eq!(a.extents(), &[Extent { start: 0, count: 5 }]);
    }

    #[test]
    fn alloc_then_free_is_identity() {
        let mut a = PosAllocator::new();
        a.alloc(10).unwrap();
        a.free(2, 3);
        a.free(7, 1);
        let before = a.clone();
        let start = a.alloc(2).unwrap();
        a.free(start, 2);
        assert_eq!(a, before);
    }

    #[test]
    fn namespace_exhaustion() {
        let mut a = PosAllocator::restore(u32::MAX - 2, Vec::new());
        assert_eq!(a.alloc(2).unwrap(), u32::MAX - 2);
        assert!(matches!(a.alloc(1), Err(Error::NamespaceExhausted)));
        // An extent that fits still satisfies the request.
        a.free(u32::MAX - 2, 1);
        assert_eq!(a.next_free(), u32::MAX);
        assert_eq!(a.alloc(1).unwrap(), u32::MAX - 2);
        assert!(a.extents().is_empty());
    }
}
