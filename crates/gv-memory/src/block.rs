//! Sorted block list underlying every address space map
//!
//! A [`Block`] marks the start of a run in which VA maps linearly onto its
//! backing value. The run extends until the next block's start, the last block
//! extends without bound. The list always begins with a block at VA zero so
//! every address has exactly one covering block.

use crate::address::{Backing, VirtualAddress};

/// A single entry in the block list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Block<Va, Pa, X> {
    /// Start of the run
    pub virt: Va,
    /// Backing value at `virt`, advances 1:1 with VA until the next block
    pub phys: Pa,
    /// Caller-defined flag carried with the run
    pub extra: X,
}

impl<Va: VirtualAddress, Pa: Backing, X: Copy + Default> Block<Va, Pa, X> {
    pub fn new(virt: Va, phys: Pa, extra: X) -> Self {
        Self { virt, phys, extra }
    }

    /// An unbacked block starting at `virt`
    pub fn unmapped(virt: Va) -> Self {
        Self::new(virt, Pa::UNMAPPED, X::default())
    }

    #[inline]
    pub fn is_mapped(&self) -> bool {
        self.phys.is_mapped()
    }
}

/// A contiguous piece of a walked range that lies within one block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Run<Va, Pa, X> {
    /// First VA of the piece
    pub virt: Va,
    /// Length of the piece
    pub size: Va,
    /// Backing value at `virt`, already advanced into the block
    pub phys: Pa,
    pub extra: X,
}

impl<Va, Pa: Backing, X> Run<Va, Pa, X> {
    #[inline]
    pub fn is_mapped(&self) -> bool {
        self.phys.is_mapped()
    }
}

/// Ordered list of blocks, strictly increasing by `virt`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockList<Va, Pa, X> {
    blocks: Vec<Block<Va, Pa, X>>,
}

impl<Va, Pa, X> BlockList<Va, Pa, X>
where
    Va: VirtualAddress,
    Pa: Backing,
    X: Copy + Default,
{
    /// A list with everything from VA zero unmapped
    pub fn new() -> Self {
        Self {
            blocks: vec![Block::unmapped(Va::ZERO)],
        }
    }

    pub fn blocks(&self) -> &[Block<Va, Pa, X>] {
        &self.blocks
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Index of the block covering `virt`
    #[inline]
    pub fn index_of(&self, virt: Va) -> usize {
        // blocks[0] starts at zero, so at least one block satisfies the predicate
        self.blocks.partition_point(|block| block.virt <= virt) - 1
    }

    /// The block covering `virt` and the start of the following block, if any
    pub fn lookup(&self, virt: Va) -> (&Block<Va, Pa, X>, Option<Va>) {
        let index = self.index_of(virt);
        (&self.blocks[index], self.blocks.get(index + 1).map(|next| next.virt))
    }

    /// Backing value and flag in effect at exactly `virt`
    pub fn state_at(&self, virt: Va) -> (Pa, X) {
        let block = &self.blocks[self.index_of(virt)];
        let phys = if block.is_mapped() {
            block.phys.advance((virt - block.virt).to_u64())
        } else {
            block.phys
        };
        (phys, block.extra)
    }

    /// Walk `[virt, virt + size)` one block-bounded piece at a time
    ///
    /// The caller must have checked that `virt + size` does not overflow.
    pub fn runs(&self, virt: Va, size: Va) -> Runs<'_, Va, Pa, X> {
        Runs {
            blocks: &self.blocks,
            index: self.index_of(virt),
            cursor: virt,
            remaining: size,
        }
    }

    /// Whether no part of `[virt, virt + size)` is backed
    pub fn is_free(&self, virt: Va, size: Va) -> bool {
        self.runs(virt, size).all(|run| !run.is_mapped())
    }

    /// Replace `[virt, end)` with a single block, keeping the state at `end`
    ///
    /// Blocks starting inside the range are dropped, a block straddling `virt`
    /// keeps its head, and unless a block already starts at `end` a tail block
    /// is inserted there that reproduces the state previously in effect at
    /// `end`. Returns the index of the new block. Requires `virt < end`.
    pub fn splice(&mut self, virt: Va, end: Va, phys: Pa, extra: X) -> usize {
        let (tail_phys, tail_extra) = self.state_at(end);

        let start_index = self.blocks.partition_point(|block| block.virt < virt);
        let end_index = self.blocks.partition_point(|block| block.virt < end);

        let has_tail = self
            .blocks
            .get(end_index)
            .is_some_and(|block| block.virt == end);

        let tail = (!has_tail).then(|| Block::new(end, tail_phys, tail_extra));

        self.blocks.splice(
            start_index..end_index,
            std::iter::once(Block::new(virt, phys, extra)).chain(tail),
        );

        start_index
    }

    /// Mark `[virt, end)` unbacked and merge it with unbacked neighbours
    pub fn splice_unmapped(&mut self, virt: Va, end: Va) {
        let index = self.splice(virt, end, Pa::UNMAPPED, X::default());

        if self.blocks.get(index + 1).is_some_and(|next| !next.is_mapped()) {
            self.blocks.remove(index + 1);
        }

        if index > 0 && !self.blocks[index - 1].is_mapped() {
            self.blocks.remove(index);
        }
    }
}

impl<Va, Pa, X> Default for BlockList<Va, Pa, X>
where
    Va: VirtualAddress,
    Pa: Backing,
    X: Copy + Default,
{
    fn default() -> Self {
        Self::new()
    }
}

/// Iterator returned by [`BlockList::runs`]
pub struct Runs<'a, Va, Pa, X> {
    blocks: &'a [Block<Va, Pa, X>],
    index: usize,
    cursor: Va,
    remaining: Va,
}

impl<Va, Pa, X> Iterator for Runs<'_, Va, Pa, X>
where
    Va: VirtualAddress,
    Pa: Backing,
    X: Copy,
{
    type Item = Run<Va, Pa, X>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == Va::ZERO {
            return None;
        }

        let block = &self.blocks[self.index];
        let size = match self.blocks.get(self.index + 1) {
            Some(next) => std::cmp::min(next.virt - self.cursor, self.remaining),
            None => self.remaining,
        };

        let phys = if block.phys.is_mapped() {
            block.phys.advance((self.cursor - block.virt).to_u64())
        } else {
            block.phys
        };

        let run = Run {
            virt: self.cursor,
            size,
            phys,
            extra: block.extra,
        };

        self.cursor = self.cursor + size;
        self.remaining = self.remaining - size;
        self.index += 1;

        Some(run)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Address-like backing, zero means unmapped
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct Phys(u64);

    impl Backing for Phys {
        const UNMAPPED: Self = Phys(0);

        fn advance(self, offset: u64) -> Self {
            Phys(self.0 + offset)
        }
    }

    type List = BlockList<u32, Phys, u8>;

    fn starts(list: &List) -> Vec<(u32, u64)> {
        list.blocks().iter().map(|b| (b.virt, b.phys.0)).collect()
    }

    fn base() -> List {
        // [0x1000, 0x2000) -> 0x10000
        let mut list = List::new();
        list.splice(0x1000, 0x2000, Phys(0x10000), 1);
        list
    }

    #[test]
    fn test_new_list() {
        let list = List::new();
        assert_eq!(starts(&list), vec![(0, 0)]);
        assert_eq!(list.index_of(0xFFFF_FFFF), 0);
    }

    #[test]
    fn test_splice_into_empty() {
        let list = base();
        assert_eq!(starts(&list), vec![(0, 0), (0x1000, 0x10000), (0x2000, 0)]);
        assert_eq!(list.blocks()[1].extra, 1);
        assert_eq!(list.blocks()[2].extra, 0);
    }

    #[test]
    fn test_splice_exact_match() {
        let mut list = base();
        list.splice(0x1000, 0x2000, Phys(0x50000), 2);
        assert_eq!(starts(&list), vec![(0, 0), (0x1000, 0x50000), (0x2000, 0)]);
        assert_eq!(list.blocks()[1].extra, 2);
    }

    #[test]
    fn test_splice_fully_contained() {
        let mut list = base();
        list.splice(0x1400, 0x1800, Phys(0x50000), 2);
        assert_eq!(
            starts(&list),
            vec![(0, 0), (0x1000, 0x10000), (0x1400, 0x50000), (0x1800, 0x10800), (0x2000, 0)]
        );
        // Tail inherits the flag of the split block
        assert_eq!(list.blocks()[3].extra, 1);
    }

    #[test]
    fn test_splice_fully_containing() {
        let mut list = base();
        list.splice(0x800, 0x2800, Phys(0x50000), 2);
        assert_eq!(starts(&list), vec![(0, 0), (0x800, 0x50000), (0x2800, 0)]);
    }

    #[test]
    fn test_splice_partial_left_overlap() {
        let mut list = base();
        list.splice(0x800, 0x1400, Phys(0x50000), 2);
        assert_eq!(
            starts(&list),
            vec![(0, 0), (0x800, 0x50000), (0x1400, 0x10400), (0x2000, 0)]
        );
    }

    #[test]
    fn test_splice_partial_right_overlap() {
        let mut list = base();
        list.splice(0x1800, 0x2800, Phys(0x50000), 2);
        assert_eq!(
            starts(&list),
            vec![(0, 0), (0x1000, 0x10000), (0x1800, 0x50000), (0x2800, 0)]
        );
    }

    #[test]
    fn test_splice_adjacent_before_and_after() {
        let mut list = base();
        list.splice(0x2000, 0x3000, Phys(0x20000), 2);
        list.splice(0x800, 0x1000, Phys(0x30000), 3);
        assert_eq!(
            starts(&list),
            vec![(0, 0), (0x800, 0x30000), (0x1000, 0x10000), (0x2000, 0x20000), (0x3000, 0)]
        );
    }

    #[test]
    fn test_splice_at_zero() {
        let mut list = List::new();
        list.splice(0, 0x100, Phys(0x9000), 0);
        assert_eq!(starts(&list), vec![(0, 0x9000), (0x100, 0)]);
    }

    #[test]
    fn test_unmap_merges_neighbours() {
        let mut list = base();
        list.splice_unmapped(0x1000, 0x2000);
        assert_eq!(starts(&list), vec![(0, 0)]);
    }

    #[test]
    fn test_unmap_middle_keeps_mapped_edges() {
        let mut list = base();
        list.splice_unmapped(0x1400, 0x1800);
        assert_eq!(
            starts(&list),
            vec![(0, 0), (0x1000, 0x10000), (0x1400, 0), (0x1800, 0x10800), (0x2000, 0)]
        );
    }

    #[test]
    fn test_unmap_left_edge_merges_with_predecessor() {
        let mut list = base();
        list.splice_unmapped(0x800, 0x1400);
        assert_eq!(starts(&list), vec![(0, 0), (0x1400, 0x10400), (0x2000, 0)]);
    }

    #[test]
    fn test_unmap_right_edge_merges_with_successor() {
        let mut list = base();
        list.splice_unmapped(0x1800, 0x2800);
        assert_eq!(starts(&list), vec![(0, 0), (0x1000, 0x10000), (0x1800, 0)]);
    }

    #[test]
    fn test_runs_split_at_block_boundaries() {
        let list = base();
        let runs: Vec<_> = list.runs(0xF00, 0x1200).map(|r| (r.virt, r.size, r.phys.0)).collect();
        assert_eq!(
            runs,
            vec![(0xF00, 0x100, 0), (0x1000, 0x1000, 0x10000), (0x2000, 0x100, 0)]
        );
    }

    #[test]
    fn test_runs_offset_into_block() {
        let list = base();
        let runs: Vec<_> = list.runs(0x1800, 0x10).map(|r| (r.virt, r.size, r.phys.0)).collect();
        assert_eq!(runs, vec![(0x1800, 0x10, 0x10800)]);
    }

    #[test]
    fn test_state_at_and_is_free() {
        let list = base();
        assert_eq!(list.state_at(0x1234), (Phys(0x10234), 1));
        assert_eq!(list.state_at(0x2000), (Phys(0), 0));
        assert!(list.is_free(0x2000, 0x1000));
        assert!(!list.is_free(0xFFF, 0x2));
        assert!(list.is_free(0, 0x1000));
    }

    #[test]
    fn test_lookup() {
        let list = base();
        let (block, next) = list.lookup(0x1FFF);
        assert_eq!(block.virt, 0x1000);
        assert_eq!(next, Some(0x2000));

        let (block, next) = list.lookup(0x5000);
        assert_eq!(block.virt, 0x2000);
        assert_eq!(next, None);
    }
}
