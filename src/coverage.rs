//! Coverage index: the coarse-resolution indirection table.
//!
//! One signed offset per coarse cell, encoded so that the storage slot of a
//! fine cell `f` is simply `f + raw[f >> bit_shift]`. Uncovered coarse cells
//! carry the offset that lands every contained fine cell inside block 0, the
//! always-sentinel default block. Covered cells map bijectively onto block
//! indices `1..=num_covered`.
//!
//! Growth never moves existing blocks: new blocks are appended at the end of
//! storage and only the newly covered entries of the index are rewritten.

use std::collections::BTreeSet;

use ndarray::Array1;

use crate::error::{Error, Result};
use crate::healpix;

/// Validate a coverage/sparse nside pair and return the bit shift between
/// them (`2k` where `nside_sparse = nside_coverage * 2^k`).
pub fn bit_shift_between(nside_coverage: u32, nside_sparse: u32) -> Result<u32> {
    if !nside_coverage.is_power_of_two() || !nside_sparse.is_power_of_two() {
        return Err(Error::Resolution(format!(
            "nside values must be powers of two, got coverage {nside_coverage}, \
             sparse {nside_sparse}"
        )));
    }
    if nside_sparse < nside_coverage {
        return Err(Error::Resolution(format!(
            "sparse nside {nside_sparse} is coarser than coverage nside {nside_coverage}"
        )));
    }
    Ok(2 * (nside_sparse.trailing_zeros() - nside_coverage.trailing_zeros()))
}

#[derive(Clone, Debug, PartialEq)]
pub struct CoverageIndex {
    /// Raw offsets, one per coarse cell.
    raw: Array1<i64>,
    nside: u32,
    bit_shift: u32,
}

impl CoverageIndex {
    /// An index with no covered cells: every coarse cell resolves to block 0.
    pub fn new_empty(nside: u32, bit_shift: u32) -> CoverageIndex {
        let cpb = 1i64 << bit_shift;
        let raw = Array1::from_iter((0..healpix::npix(nside) as i64).map(|c| -c * cpb));
        CoverageIndex {
            raw,
            nside,
            bit_shift,
        }
    }

    /// Rebuild an index from a raw offset array, e.g. one read from disk.
    pub fn from_raw(raw: Array1<i64>, nside: u32, bit_shift: u32) -> Result<CoverageIndex> {
        if raw.len() as u64 != healpix::npix(nside) {
            return Err(Error::Dimension(format!(
                "coverage array has {} entries, expected {} for nside {nside}",
                raw.len(),
                healpix::npix(nside)
            )));
        }
        Ok(CoverageIndex {
            raw,
            nside,
            bit_shift,
        })
    }

    /// An index covering exactly `covered` (ascending, deduplicated), with
    /// block `i + 1` assigned to the i-th covered cell.
    pub fn from_covered(nside: u32, bit_shift: u32, covered: &[u64]) -> CoverageIndex {
        let mut index = CoverageIndex::new_empty(nside, bit_shift);
        let cpb = index.cells_per_block() as i64;
        for (i, &c) in covered.iter().enumerate() {
            index.raw[c as usize] = (i as i64 + 1) * cpb - c as i64 * cpb;
        }
        index
    }

    pub fn nside(&self) -> u32 {
        self.nside
    }

    pub fn bit_shift(&self) -> u32 {
        self.bit_shift
    }

    /// Fine cells per storage block.
    pub fn cells_per_block(&self) -> u64 {
        1 << self.bit_shift
    }

    /// Number of coarse cells (covered or not).
    pub fn n_cells(&self) -> usize {
        self.raw.len()
    }

    pub fn raw(&self) -> &Array1<i64> {
        &self.raw
    }

    /// Coarse cell owning a fine cell.
    pub fn cov_cell(&self, fine: u64) -> u64 {
        fine >> self.bit_shift
    }

    /// Storage slot of a fine cell. Uncovered parents land in block 0.
    pub fn storage_index(&self, fine: u64) -> usize {
        (fine as i64 + self.raw[(fine >> self.bit_shift) as usize]) as usize
    }

    pub fn is_covered(&self, cov_cell: u64) -> bool {
        let cpb = self.cells_per_block() as i64;
        self.raw[cov_cell as usize] + cov_cell as i64 * cpb >= cpb
    }

    /// Boolean coverage mask over all coarse cells.
    pub fn coverage_mask(&self) -> Array1<bool> {
        let cpb = self.cells_per_block() as i64;
        Array1::from_iter(
            self.raw
                .iter()
                .enumerate()
                .map(|(c, &off)| off + c as i64 * cpb >= cpb),
        )
    }

    /// Covered coarse cells in ascending order.
    pub fn covered_cells(&self) -> Vec<u64> {
        let cpb = self.cells_per_block() as i64;
        self.raw
            .iter()
            .enumerate()
            .filter(|(c, &off)| off + *c as i64 * cpb >= cpb)
            .map(|(c, _)| c as u64)
            .collect()
    }

    /// Storage block index of a coarse cell (0 for uncovered cells).
    pub fn block_of(&self, cov_cell: u64) -> usize {
        let cpb = self.cells_per_block() as i64;
        ((self.raw[cov_cell as usize] + cov_cell as i64 * cpb) / cpb) as usize
    }

    /// Sorted, deduplicated coarse cells among `cov_cells` that are not yet
    /// covered. Sorting makes block assignment deterministic regardless of
    /// the order targets arrive in.
    pub fn plan_growth(&self, cov_cells: impl IntoIterator<Item = u64>) -> Vec<u64> {
        let new: BTreeSet<u64> = cov_cells
            .into_iter()
            .filter(|&c| !self.is_covered(c))
            .collect();
        new.into_iter().collect()
    }

    /// Point each cell of `new_cells` at one of the blocks appended at
    /// `storage_len` (the storage length before the append), in order.
    /// Entries for already-covered cells are untouched.
    pub fn commit_growth(&mut self, new_cells: &[u64], storage_len: usize) {
        let cpb = self.cells_per_block() as i64;
        for (i, &c) in new_cells.iter().enumerate() {
            self.raw[c as usize] = storage_len as i64 + i as i64 * cpb - c as i64 * cpb;
        }
    }

    /// The same coverage and block assignment expressed for a different
    /// block size. Used by degrade, where the covered set and block order
    /// survive but every block shrinks.
    pub fn remap(&self, new_bit_shift: u32) -> CoverageIndex {
        let new_cpb = 1i64 << new_bit_shift;
        let mut out = CoverageIndex::new_empty(self.nside, new_bit_shift);
        for c in self.covered_cells() {
            let block = self.block_of(c) as i64;
            out.raw[c as usize] = block * new_cpb - c as i64 * new_cpb;
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bit_shift_validation() {
        assert_eq!(bit_shift_between(1, 1).unwrap(), 0);
        assert_eq!(bit_shift_between(1, 4).unwrap(), 4);
        assert_eq!(bit_shift_between(32, 4096).unwrap(), 14);

        assert!(matches!(
            bit_shift_between(4, 2),
            Err(Error::Resolution(_))
        ));
        assert!(matches!(
            bit_shift_between(3, 12),
            Err(Error::Resolution(_))
        ));
    }

    #[test]
    fn empty_index_is_uncovered() {
        let index = CoverageIndex::new_empty(1, 4);
        assert_eq!(index.n_cells(), 12);
        assert!(index.covered_cells().is_empty());
        for c in 0..12 {
            assert!(!index.is_covered(c));
            assert_eq!(index.block_of(c), 0);
        }
        // Every fine cell of every coarse cell resolves into block 0
        for fine in 0..192 {
            let slot = index.storage_index(fine);
            assert!(slot < 16, "fine {fine} -> slot {slot}");
            assert_eq!(slot as u64, fine & 15);
        }
    }

    #[test]
    fn growth_is_sorted_and_deduplicated() {
        let index = CoverageIndex::new_empty(1, 4);
        let plan = index.plan_growth([7, 2, 7, 11, 2]);
        assert_eq!(plan, vec![2, 7, 11]);
    }

    #[test]
    fn growth_preserves_existing_blocks() {
        let mut index = CoverageIndex::new_empty(1, 4);

        // First growth: cover cell 5 as block 1 (storage was one block long)
        index.commit_growth(&[5], 16);
        assert!(index.is_covered(5));
        assert_eq!(index.block_of(5), 1);

        // Second growth: cover cells 2 and 9; cell 5 must not move
        let plan = index.plan_growth([9, 2, 5]);
        assert_eq!(plan, vec![2, 9]);
        index.commit_growth(&plan, 32);
        assert_eq!(index.block_of(5), 1);
        assert_eq!(index.block_of(2), 2);
        assert_eq!(index.block_of(9), 3);

        // Addressing: fine cell 5*16+3 lands in block 1 at local offset 3
        assert_eq!(index.storage_index(5 * 16 + 3), 16 + 3);
        assert_eq!(index.storage_index(2 * 16 + 15), 32 + 15);
        assert_eq!(index.storage_index(9 * 16), 48);
    }

    #[test]
    fn from_covered_matches_incremental_growth() {
        let direct = CoverageIndex::from_covered(1, 4, &[2, 5, 9]);

        let mut grown = CoverageIndex::new_empty(1, 4);
        grown.commit_growth(&[2, 5, 9], 16);

        assert_eq!(direct.raw(), grown.raw());
        assert_eq!(direct.covered_cells(), vec![2, 5, 9]);
    }

    #[test]
    fn coverage_mask_matches_covered_cells() {
        let index = CoverageIndex::from_covered(2, 2, &[0, 17, 40]);
        let mask = index.coverage_mask();
        assert_eq!(mask.len(), 48);
        for c in 0..48u64 {
            assert_eq!(mask[c as usize], [0, 17, 40].contains(&c));
        }
    }

    #[test]
    fn remap_keeps_block_assignment() {
        // Out-of-order block assignment, as produced by two growth steps
        let mut index = CoverageIndex::new_empty(1, 4);
        index.commit_growth(&[9], 16);
        index.commit_growth(&[2], 32);
        assert_eq!(index.block_of(9), 1);
        assert_eq!(index.block_of(2), 2);

        let remapped = index.remap(2);
        assert_eq!(remapped.cells_per_block(), 4);
        assert_eq!(remapped.covered_cells(), vec![2, 9]);
        assert_eq!(remapped.block_of(9), 1);
        assert_eq!(remapped.block_of(2), 2);
        assert_eq!(remapped.storage_index(9 * 4 + 1), 4 + 1);
    }

    #[test]
    fn from_raw_rejects_wrong_length() {
        let raw = Array1::from_vec(vec![0i64; 10]);
        assert!(matches!(
            CoverageIndex::from_raw(raw, 1, 4),
            Err(Error::Dimension(_))
        ));
    }
}
