//! Sparse sky map: a coverage index plus a growable dense value array.
//!
//! Fine cells are addressed in the nested scheme at `nside_sparse`; storage
//! is allocated in blocks of one coarse cell at `nside_coverage`. Looking up
//! a fine cell whose coarse parent was never written lands in block 0 and
//! yields the sentinel, so reads never fail on sparse regions.
//!
//! Bulk update grows coverage on demand: new blocks are appended (existing
//! offsets never move) and only the index entries of newly covered coarse
//! cells are rewritten.

use std::f64::consts::FRAC_PI_2;

use log::debug;
use ndarray::Array1;

use crate::coverage::{bit_shift_between, CoverageIndex};
use crate::error::{Error, Result};
use crate::healpix;
use crate::value::MapValue;

#[derive(Clone, Debug, PartialEq)]
pub struct SparseMap<T: MapValue> {
    cov: CoverageIndex,
    values: Array1<T>,
    sentinel: T,
    nside_sparse: u32,
}

impl<T: MapValue> SparseMap<T> {
    /// An empty map: a single default block, nothing covered.
    ///
    /// Fails with [`Error::Configuration`] for element types without a
    /// built-in sentinel (integers); use
    /// [`make_empty_with_sentinel`](Self::make_empty_with_sentinel) there.
    pub fn make_empty(nside_coverage: u32, nside_sparse: u32) -> Result<SparseMap<T>> {
        let sentinel = T::default_sentinel().ok_or_else(|| {
            Error::Configuration(format!(
                "element type {:?} has no default sentinel, supply one explicitly",
                T::DTYPE
            ))
        })?;
        Self::make_empty_with_sentinel(nside_coverage, nside_sparse, sentinel)
    }

    /// An empty map with an explicit sentinel.
    pub fn make_empty_with_sentinel(
        nside_coverage: u32,
        nside_sparse: u32,
        sentinel: T,
    ) -> Result<SparseMap<T>> {
        let bit_shift = bit_shift_between(nside_coverage, nside_sparse)?;
        let cpb = 1usize << bit_shift;
        Ok(SparseMap {
            cov: CoverageIndex::new_empty(nside_coverage, bit_shift),
            values: Array1::from_elem(cpb, sentinel),
            sentinel,
            nside_sparse,
        })
    }

    /// Assemble a map from a raw coverage array and a value array, e.g. as
    /// read from persisted storage. Validates the storage invariants.
    pub fn from_parts(
        cov_raw: Array1<i64>,
        values: Array1<T>,
        nside_coverage: u32,
        nside_sparse: u32,
        sentinel: T,
    ) -> Result<SparseMap<T>> {
        let bit_shift = bit_shift_between(nside_coverage, nside_sparse)?;
        let cov = CoverageIndex::from_raw(cov_raw, nside_coverage, bit_shift)?;
        let cpb = cov.cells_per_block() as usize;
        if values.is_empty() || values.len() % cpb != 0 {
            return Err(Error::Dimension(format!(
                "value array length {} is not a positive multiple of the block size {cpb}",
                values.len()
            )));
        }
        if !values.iter().take(cpb).all(|&v| v == sentinel) {
            return Err(Error::Configuration(
                "block 0 must hold only the sentinel".into(),
            ));
        }
        Ok(SparseMap {
            cov,
            values,
            sentinel,
            nside_sparse,
        })
    }

    /// Ingest a dense all-sky map, computing coverage from valid cells.
    ///
    /// `dense` must hold one value per fine cell. With `ring` set, the input
    /// is taken to be ring-ordered and is reordered to nested first.
    pub fn from_dense(dense: &Array1<T>, nside_coverage: u32, ring: bool) -> Result<SparseMap<T>> {
        let sentinel = T::default_sentinel().ok_or_else(|| {
            Error::Configuration(format!(
                "element type {:?} has no default sentinel, supply one explicitly",
                T::DTYPE
            ))
        })?;
        Self::from_dense_with_sentinel(dense, nside_coverage, ring, sentinel)
    }

    /// [`from_dense`](Self::from_dense) with an explicit sentinel.
    pub fn from_dense_with_sentinel(
        dense: &Array1<T>,
        nside_coverage: u32,
        ring: bool,
        sentinel: T,
    ) -> Result<SparseMap<T>> {
        let nside_sparse = healpix::nside_from_npix(dense.len() as u64).ok_or_else(|| {
            Error::Dimension(format!(
                "dense array length {} is not a valid pixel count",
                dense.len()
            ))
        })?;
        let bit_shift = bit_shift_between(nside_coverage, nside_sparse)?;
        let cpb = 1u64 << bit_shift;

        let nested;
        let dense = if ring {
            nested = Array1::from_iter(
                (0..dense.len() as u64)
                    .map(|p| dense[healpix::nest_to_ring(nside_sparse, p) as usize]),
            );
            &nested
        } else {
            dense
        };

        let valid: Vec<u64> = (0..dense.len() as u64)
            .filter(|&p| dense[p as usize] > sentinel)
            .collect();

        let mut covered: Vec<u64> = valid.iter().map(|&p| p >> bit_shift).collect();
        covered.dedup();

        let cov = CoverageIndex::from_covered(nside_coverage, bit_shift, &covered);
        let mut values =
            Array1::from_elem((covered.len() + 1) * cpb as usize, sentinel);
        for &p in &valid {
            values[cov.storage_index(p)] = dense[p as usize];
        }

        Ok(SparseMap {
            cov,
            values,
            sentinel,
            nside_sparse,
        })
    }

    pub fn nside_coverage(&self) -> u32 {
        self.cov.nside()
    }

    pub fn nside_sparse(&self) -> u32 {
        self.nside_sparse
    }

    pub fn sentinel(&self) -> T {
        self.sentinel
    }

    pub fn cov_index(&self) -> &CoverageIndex {
        &self.cov
    }

    pub(crate) fn values(&self) -> &Array1<T> {
        &self.values
    }

    pub(crate) fn values_mut(&mut self) -> &mut Array1<T> {
        &mut self.values
    }

    /// Number of valid fine cells.
    pub fn n_valid(&self) -> usize {
        // Block 0 never holds anything above the sentinel
        let s = self.sentinel;
        self.values.iter().filter(|&&v| v > s).count()
    }

    fn check_pixels(&self, pixels: &Array1<u64>) -> Result<()> {
        let np = healpix::npix(self.nside_sparse);
        match pixels.iter().find(|&&p| p >= np) {
            Some(&p) => Err(Error::Dimension(format!(
                "pixel {p} out of range for nside {} ({np} cells)",
                self.nside_sparse
            ))),
            None => Ok(()),
        }
    }

    /// Values at nested fine cells. Cells outside coverage yield the
    /// sentinel.
    pub fn get_values_pix(&self, pixels: &Array1<u64>) -> Result<Array1<T>> {
        self.check_pixels(pixels)?;
        Ok(pixels.mapv(|p| self.values[self.cov.storage_index(p)]))
    }

    /// Validity mask at nested fine cells.
    pub fn valid_mask_pix(&self, pixels: &Array1<u64>) -> Result<Array1<bool>> {
        self.check_pixels(pixels)?;
        let s = self.sentinel;
        Ok(pixels.mapv(|p| self.values[self.cov.storage_index(p)] > s))
    }

    /// Values at (ra, dec) positions in degrees.
    pub fn get_values_radec(
        &self,
        ra: &Array1<f64>,
        dec: &Array1<f64>,
    ) -> Result<Array1<T>> {
        if ra.len() != dec.len() {
            return Err(Error::Dimension(format!(
                "ra has {} entries, dec has {}",
                ra.len(),
                dec.len()
            )));
        }
        let lon = ra.mapv(f64::to_radians);
        let lat = dec.mapv(f64::to_radians);
        let pixels = healpix::ang_to_pix_nest_arr(self.nside_sparse, &lon, &lat);
        self.get_values_pix(&pixels)
    }

    /// Values at (theta, phi) positions in radians, theta the colatitude.
    pub fn get_values_thetaphi(
        &self,
        theta: &Array1<f64>,
        phi: &Array1<f64>,
    ) -> Result<Array1<T>> {
        if theta.len() != phi.len() {
            return Err(Error::Dimension(format!(
                "theta has {} entries, phi has {}",
                theta.len(),
                phi.len()
            )));
        }
        let lat = theta.mapv(|t| FRAC_PI_2 - t);
        let pixels = healpix::ang_to_pix_nest_arr(self.nside_sparse, phi, &lat);
        self.get_values_pix(&pixels)
    }

    /// Overwrite values at nested fine cells, growing coverage as needed.
    ///
    /// Duplicate pixels within one call are last-write-wins in input order.
    /// Validation happens before any mutation: on error the map is
    /// untouched.
    pub fn update_values(&mut self, pixels: &Array1<u64>, values: &Array1<T>) -> Result<()> {
        if pixels.len() != values.len() {
            return Err(Error::Dimension(format!(
                "{} pixels but {} values",
                pixels.len(),
                values.len()
            )));
        }
        self.update_impl(pixels, |i| values[i])
    }

    /// Overwrite every listed fine cell with one value.
    pub fn update_values_const(&mut self, pixels: &Array1<u64>, value: T) -> Result<()> {
        self.update_impl(pixels, |_| value)
    }

    fn update_impl(&mut self, pixels: &Array1<u64>, value_at: impl Fn(usize) -> T) -> Result<()> {
        self.check_pixels(pixels)?;
        let shift = self.cov.bit_shift();

        let plan = self.cov.plan_growth(pixels.iter().map(|&p| p >> shift));
        if !plan.is_empty() {
            let cpb = self.cov.cells_per_block() as usize;
            debug!(
                "growing coverage by {} blocks ({} -> {} covered cells)",
                plan.len(),
                self.cov.covered_cells().len(),
                self.cov.covered_cells().len() + plan.len()
            );
            let mut vals =
                std::mem::replace(&mut self.values, Array1::from_vec(Vec::new())).into_raw_vec();
            let old_len = vals.len();
            vals.reserve(plan.len() * cpb);
            for _ in 0..plan.len() {
                // New blocks start as copies of the default block
                vals.extend_from_within(0..cpb);
            }
            self.cov.commit_growth(&plan, old_len);
            self.values = Array1::from_vec(vals);
        }

        // After growth every target is covered; one ordered scatter pass
        for (i, &p) in pixels.iter().enumerate() {
            let slot = self.cov.storage_index(p);
            self.values[slot] = value_at(i);
        }
        Ok(())
    }

    /// All valid fine cells, ascending. The canonical enumeration every
    /// higher-level operation iterates.
    pub fn valid_pixels(&self) -> Array1<u64> {
        let cpb = self.cov.cells_per_block();
        let s = self.sentinel;
        let mut out = Vec::new();
        for c in self.cov.covered_cells() {
            let base = c * cpb;
            let start = self.cov.storage_index(base);
            for j in 0..cpb as usize {
                if self.values[start + j] > s {
                    out.push(base + j as u64);
                }
            }
        }
        Array1::from_vec(out)
    }

    /// Boolean coverage mask over coarse cells.
    pub fn coverage_mask(&self) -> Array1<bool> {
        self.cov.coverage_mask()
    }

    /// Fraction of valid fine cells per coarse cell (0 outside coverage).
    pub fn coverage_map(&self) -> Array1<f64> {
        let cpb = self.cov.cells_per_block();
        let s = self.sentinel;
        let mut out = Array1::from_elem(self.cov.n_cells(), 0.0);
        for c in self.cov.covered_cells() {
            let start = self.cov.storage_index(c * cpb);
            let n_valid = (0..cpb as usize)
                .filter(|&j| self.values[start + j] > s)
                .count();
            out[c as usize] = n_valid as f64 / cpb as f64;
        }
        out
    }

    /// Materialize the full nested all-sky array, sentinel-filled outside
    /// coverage.
    pub fn to_dense(&self) -> Array1<T> {
        let cpb = self.cov.cells_per_block();
        let mut dense = Array1::from_elem(healpix::npix(self.nside_sparse) as usize, self.sentinel);
        for c in self.cov.covered_cells() {
            let base = (c * cpb) as usize;
            let start = self.cov.storage_index(c * cpb);
            for j in 0..cpb as usize {
                dense[base + j] = self.values[start + j];
            }
        }
        dense
    }

    /// Apply `f` to every valid cell in one bulk pass, leaving invalid
    /// cells untouched.
    pub(crate) fn apply_valid(&mut self, f: impl Fn(T) -> T) {
        let s = self.sentinel;
        self.values.mapv_inplace(|v| if v > s { f(v) } else { v });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::UNSEEN;
    use ndarray::arr1;

    #[test]
    fn empty_map_reads_sentinel_everywhere() {
        let map = SparseMap::<f64>::make_empty(1, 4).unwrap();
        assert_eq!(map.n_valid(), 0);
        assert!(map.coverage_mask().iter().all(|&c| !c));

        let vals = map
            .get_values_pix(&arr1(&[0u64, 5, 100, 191]))
            .unwrap();
        assert!(vals.iter().all(|&v| v == UNSEEN));
    }

    #[test]
    fn update_and_lookup_concrete_scenario() {
        // nside 1 coverage, nside 4 sparse: 16 fine cells per coarse cell.
        // Pixel 5 lives in coarse cell 0, pixel 40 in coarse cell 2.
        let mut map = SparseMap::<f64>::make_empty(1, 4).unwrap();
        map.update_values(&arr1(&[5u64, 40]), &arr1(&[1.0, 2.0])).unwrap();

        let mask = map.coverage_mask();
        for c in 0..12 {
            assert_eq!(mask[c], c == 0 || c == 2, "coarse cell {c}");
        }

        assert_eq!(map.valid_pixels(), arr1(&[5u64, 40]));

        let vals = map.get_values_pix(&arr1(&[5u64, 40, 7])).unwrap();
        assert_eq!(vals, arr1(&[1.0, 2.0, UNSEEN]));
    }

    #[test]
    fn update_is_idempotent() {
        let pixels = arr1(&[5u64, 40, 100]);
        let values = arr1(&[1.0, 2.0, 3.0]);

        let mut once = SparseMap::<f64>::make_empty(1, 4).unwrap();
        once.update_values(&pixels, &values).unwrap();

        let mut twice = SparseMap::<f64>::make_empty(1, 4).unwrap();
        twice.update_values(&pixels, &values).unwrap();
        twice.update_values(&pixels, &values).unwrap();

        assert_eq!(once, twice);
    }

    #[test]
    fn duplicate_pixels_last_write_wins() {
        let mut map = SparseMap::<f64>::make_empty(1, 4).unwrap();
        map.update_values(&arr1(&[9u64, 9]), &arr1(&[1.0, 7.0])).unwrap();
        let vals = map.get_values_pix(&arr1(&[9u64])).unwrap();
        assert_eq!(vals[0], 7.0);
    }

    #[test]
    fn coverage_grows_monotonically_and_blocks_stay_put() {
        let mut map = SparseMap::<f64>::make_empty(1, 4).unwrap();
        map.update_values(&arr1(&[40u64]), &arr1(&[2.0])).unwrap();
        let block_before = map.cov_index().block_of(2);

        map.update_values(&arr1(&[5u64, 180]), &arr1(&[1.0, 3.0])).unwrap();

        // Old coverage still present, old block untouched
        assert!(map.coverage_mask()[2]);
        assert_eq!(map.cov_index().block_of(2), block_before);
        assert_eq!(
            map.get_values_pix(&arr1(&[40u64])).unwrap()[0],
            2.0
        );
        assert_eq!(map.valid_pixels(), arr1(&[5u64, 40, 180]));
    }

    #[test]
    fn update_validates_before_mutating() {
        let mut map = SparseMap::<f64>::make_empty(1, 4).unwrap();
        map.update_values(&arr1(&[5u64]), &arr1(&[1.0])).unwrap();
        let before = map.clone();

        // Out-of-range pixel (npix = 192 at nside 4)
        let err = map.update_values(&arr1(&[6u64, 192]), &arr1(&[9.0, 9.0]));
        assert!(matches!(err, Err(Error::Dimension(_))));
        assert_eq!(map, before);

        // Length mismatch
        let err = map.update_values(&arr1(&[6u64, 7]), &arr1(&[9.0]));
        assert!(matches!(err, Err(Error::Dimension(_))));
        assert_eq!(map, before);
    }

    #[test]
    fn update_const_fills_all_targets() {
        let mut map = SparseMap::<i64>::make_empty_with_sentinel(1, 4, -1).unwrap();
        map.update_values_const(&arr1(&[3u64, 50, 70]), 8).unwrap();
        assert_eq!(map.valid_pixels(), arr1(&[3u64, 50, 70]));
        let vals = map.get_values_pix(&arr1(&[3u64, 50, 70])).unwrap();
        assert!(vals.iter().all(|&v| v == 8));
    }

    #[test]
    fn integer_map_needs_explicit_sentinel() {
        assert!(matches!(
            SparseMap::<i64>::make_empty(1, 4),
            Err(Error::Configuration(_))
        ));
        assert!(SparseMap::<i64>::make_empty_with_sentinel(1, 4, -1).is_ok());
    }

    #[test]
    fn validity_is_sentinel_comparison() {
        let mut map = SparseMap::<f64>::make_empty(1, 4).unwrap();
        map.update_values(&arr1(&[5u64, 6]), &arr1(&[0.5, UNSEEN])).unwrap();

        // Writing the sentinel itself does not make a cell valid
        let mask = map.valid_mask_pix(&arr1(&[5u64, 6, 7])).unwrap();
        assert_eq!(mask, arr1(&[true, false, false]));

        let pix = arr1(&[5u64, 6, 7]);
        let vals = map.get_values_pix(&pix).unwrap();
        let mask2 = map.valid_mask_pix(&pix).unwrap();
        for i in 0..pix.len() {
            assert_eq!(mask2[i], vals[i] > map.sentinel());
        }
    }

    #[test]
    fn from_dense_round_trips_through_to_dense() {
        let mut dense = Array1::from_elem(192, UNSEEN);
        dense[5] = 1.5;
        dense[40] = 2.5;
        dense[191] = 3.5;

        let map = SparseMap::from_dense(&dense, 1, false).unwrap();
        assert_eq!(map.nside_sparse(), 4);
        assert_eq!(map.valid_pixels(), arr1(&[5u64, 40, 191]));
        assert_eq!(map.to_dense(), dense);
    }

    #[test]
    fn from_dense_ring_matches_nested() {
        let nside = 4u32;
        let mut dense_nest = Array1::from_elem(192, UNSEEN);
        dense_nest[5] = 1.5;
        dense_nest[40] = 2.5;

        // Build the same sky in ring ordering
        let mut dense_ring = Array1::from_elem(192, UNSEEN);
        for p in 0..192u64 {
            dense_ring[crate::healpix::nest_to_ring(nside, p) as usize] =
                dense_nest[p as usize];
        }

        let from_nest = SparseMap::from_dense(&dense_nest, 1, false).unwrap();
        let from_ring = SparseMap::from_dense(&dense_ring, 1, true).unwrap();
        assert_eq!(from_nest, from_ring);
    }

    #[test]
    fn coverage_map_counts_valid_fraction() {
        let mut map = SparseMap::<f64>::make_empty(1, 4).unwrap();
        // 4 of the 16 cells of coarse cell 0
        map.update_values(&arr1(&[0u64, 1, 2, 3]), &arr1(&[1.0, 1.0, 1.0, 1.0]))
            .unwrap();
        let cov_map = map.coverage_map();
        assert_eq!(cov_map[0], 0.25);
        assert_eq!(cov_map[1], 0.0);
    }

    #[test]
    fn angular_lookup_round_trips() {
        let nside = 64u32;
        let lon = 1.1f64;
        let lat = -0.4f64;
        let pix = crate::healpix::ang_to_pix_nest(nside, lon, lat);

        let mut map = SparseMap::<f64>::make_empty(8, nside).unwrap();
        map.update_values(&arr1(&[pix]), &arr1(&[5.0])).unwrap();

        let ra = arr1(&[lon.to_degrees()]);
        let dec = arr1(&[lat.to_degrees()]);
        assert_eq!(map.get_values_radec(&ra, &dec).unwrap()[0], 5.0);

        let theta = arr1(&[FRAC_PI_2 - lat]);
        let phi = arr1(&[lon]);
        assert_eq!(map.get_values_thetaphi(&theta, &phi).unwrap()[0], 5.0);
    }

    #[test]
    fn from_parts_rejects_bad_block_zero() {
        let cov_raw = CoverageIndex::new_empty(1, 4).raw().clone();
        let mut values = Array1::from_elem(16, UNSEEN);
        values[3] = 1.0;
        assert!(matches!(
            SparseMap::from_parts(cov_raw, values, 1, 4, UNSEEN),
            Err(Error::Configuration(_))
        ));
    }
}
