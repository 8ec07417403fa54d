//! Resolution reduction.
//!
//! Groups of consecutive fine cells (children of one coarser cell in the
//! nested scheme) are reduced to a single value. Invalid cells are excluded
//! from the reduction, not treated as zero; a group with no valid cell
//! degrades to the sentinel. Integer storage is promoted to floating point,
//! since reductions like mean and standard deviation are not integer-exact.

use std::str::FromStr;

use log::debug;
use ndarray::Array1;

use crate::coverage::bit_shift_between;
use crate::error::{Error, Result};
use crate::map::SparseMap;
use crate::value::{FloatValue, MapValue};

/// Reduction applied to each group of fine cells.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Reduction {
    Mean,
    Median,
    /// Population standard deviation.
    Std,
    Max,
    Min,
}

impl FromStr for Reduction {
    type Err = Error;

    fn from_str(s: &str) -> Result<Reduction> {
        match s {
            "mean" => Ok(Reduction::Mean),
            "median" => Ok(Reduction::Median),
            "std" => Ok(Reduction::Std),
            "max" => Ok(Reduction::Max),
            "min" => Ok(Reduction::Min),
            other => Err(Error::Configuration(format!(
                "unknown reduction {other:?}, expected mean/median/std/max/min"
            ))),
        }
    }
}

impl Reduction {
    /// Reduce a non-empty set of valid values. May reorder `vals`.
    fn reduce(self, vals: &mut [f64]) -> f64 {
        let n = vals.len() as f64;
        match self {
            Reduction::Mean => vals.iter().sum::<f64>() / n,
            Reduction::Median => {
                vals.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
                let m = vals.len();
                if m % 2 == 0 {
                    (vals[m / 2 - 1] + vals[m / 2]) / 2.0
                } else {
                    vals[m / 2]
                }
            }
            Reduction::Std => {
                let mean = vals.iter().sum::<f64>() / n;
                let var = vals.iter().map(|&v| (v - mean) * (v - mean)).sum::<f64>() / n;
                var.sqrt()
            }
            Reduction::Max => vals.iter().cloned().fold(f64::NEG_INFINITY, f64::max),
            Reduction::Min => vals.iter().cloned().fold(f64::INFINITY, f64::min),
        }
    }
}

impl<T: MapValue> SparseMap<T> {
    /// Produce a new map at a coarser `nside_out`, reducing each group of
    /// fine cells over its valid members.
    ///
    /// `nside_out` must lie between the coverage and sparse resolutions with
    /// power-of-two ratios; anything else fails with [`Error::Resolution`].
    /// The output element type follows the promotion rule of the source type
    /// and its sentinel is the reserved float sentinel.
    pub fn degrade(&self, nside_out: u32, reduction: Reduction) -> Result<SparseMap<T::Degraded>> {
        if nside_out > self.nside_sparse() {
            return Err(Error::Resolution(format!(
                "cannot degrade nside {} to finer nside {nside_out}",
                self.nside_sparse()
            )));
        }
        if nside_out < self.nside_coverage() {
            return Err(Error::Resolution(format!(
                "degrade target nside {nside_out} is coarser than the coverage nside {}",
                self.nside_coverage()
            )));
        }
        let group_shift = bit_shift_between(nside_out, self.nside_sparse())?;
        let r = 1usize << group_shift;

        let s = self.sentinel();
        let out_sentinel = <T::Degraded as FloatValue>::SENTINEL;
        let values = self.values();
        let n_groups = values.len() / r;

        let mut out_values = Vec::with_capacity(n_groups);
        let mut buf: Vec<f64> = Vec::with_capacity(r);
        for g in 0..n_groups {
            buf.clear();
            for j in 0..r {
                let v = values[g * r + j];
                if v > s {
                    buf.push(v.to_degraded().to_f64());
                }
            }
            out_values.push(if buf.is_empty() {
                out_sentinel
            } else {
                <T::Degraded as FloatValue>::from_f64(reduction.reduce(&mut buf))
            });
        }

        debug!(
            "degraded nside {} -> {nside_out} ({} -> {} storage cells)",
            self.nside_sparse(),
            values.len(),
            out_values.len()
        );

        let cov = self.cov_index().remap(self.cov_index().bit_shift() - group_shift);
        SparseMap::from_parts(
            cov.raw().clone(),
            Array1::from_vec(out_values),
            self.nside_coverage(),
            nside_out,
            out_sentinel,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::UNSEEN;
    use ndarray::arr1;

    fn filled_map() -> SparseMap<f64> {
        // nside 1 coverage, nside 8 sparse: 64 fine cells per coarse cell
        let mut map = SparseMap::<f64>::make_empty(1, 8).unwrap();
        // Group of 4 children of the nside-4 cell 0: pixels 0..4
        map.update_values(&arr1(&[0u64, 1, 2, 3]), &arr1(&[1.0, 4.0, 2.0, 3.0]))
            .unwrap();
        // Partially valid group: children of nside-4 cell 2
        map.update_values(&arr1(&[8u64, 9]), &arr1(&[10.0, 20.0])).unwrap();
        // Lone value in another coarse cell: child of nside-4 cell 50
        map.update_values(&arr1(&[200u64]), &arr1(&[7.0])).unwrap();
        map
    }

    #[test]
    fn degrade_max_matches_external_group_max() {
        let map = filled_map();
        let deg = map.degrade(4, Reduction::Max).unwrap();
        assert_eq!(deg.nside_sparse(), 4);

        let dense = map.to_dense();
        for out_pix in 0..192u64 {
            let group: Vec<f64> = (4 * out_pix..4 * out_pix + 4)
                .map(|p| dense[p as usize])
                .filter(|&v| v > UNSEEN)
                .collect();
            let got = deg.get_values_pix(&arr1(&[out_pix])).unwrap()[0];
            match group.iter().cloned().fold(None::<f64>, |m, v| {
                Some(m.map_or(v, |m| m.max(v)))
            }) {
                Some(expected) => assert_eq!(got, expected, "out pixel {out_pix}"),
                None => assert_eq!(got, UNSEEN, "out pixel {out_pix}"),
            }
        }
    }

    #[test]
    fn all_invalid_group_degrades_to_sentinel() {
        let map = filled_map();
        let deg = map.degrade(4, Reduction::Mean).unwrap();
        // nside-4 cell 1 (children 4..8) was never written but its coarse
        // cell is covered
        assert_eq!(deg.get_values_pix(&arr1(&[1u64])).unwrap()[0], UNSEEN);
    }

    #[test]
    fn mean_excludes_invalid_cells() {
        let map = filled_map();
        let deg = map.degrade(4, Reduction::Mean).unwrap();
        // Only 2 of the 4 children of cell 2 are valid
        assert_eq!(deg.get_values_pix(&arr1(&[2u64])).unwrap()[0], 15.0);
    }

    #[test]
    fn median_and_std() {
        let map = filled_map();

        let med = map.degrade(4, Reduction::Median).unwrap();
        // Children of cell 0 hold {1, 4, 2, 3}: even count, median 2.5
        assert_eq!(med.get_values_pix(&arr1(&[0u64])).unwrap()[0], 2.5);

        let mut odd = SparseMap::<f64>::make_empty(1, 8).unwrap();
        odd.update_values(&arr1(&[0u64, 1, 2]), &arr1(&[5.0, 1.0, 3.0])).unwrap();
        let med = odd.degrade(4, Reduction::Median).unwrap();
        assert_eq!(med.get_values_pix(&arr1(&[0u64])).unwrap()[0], 3.0);

        let mut pair = SparseMap::<f64>::make_empty(1, 8).unwrap();
        pair.update_values(&arr1(&[0u64, 1]), &arr1(&[1.0, 3.0])).unwrap();
        let std = pair.degrade(4, Reduction::Std).unwrap();
        assert!((std.get_values_pix(&arr1(&[0u64])).unwrap()[0] - 1.0).abs() < 1e-12);
    }

    #[test]
    fn integer_maps_promote_to_float() {
        let mut map = SparseMap::<i64>::make_empty_with_sentinel(1, 8, -1).unwrap();
        map.update_values(&arr1(&[0u64, 1]), &arr1(&[1i64, 2])).unwrap();

        let deg = map.degrade(4, Reduction::Mean).unwrap();
        assert_eq!(deg.sentinel(), UNSEEN);
        assert_eq!(deg.get_values_pix(&arr1(&[0u64])).unwrap()[0], 1.5);
    }

    #[test]
    fn identity_degrade_keeps_values() {
        let map = filled_map();
        let same = map.degrade(8, Reduction::Mean).unwrap();
        assert_eq!(same.valid_pixels(), map.valid_pixels());
        assert_eq!(
            same.get_values_pix(&arr1(&[0u64, 8, 200])).unwrap(),
            arr1(&[1.0, 10.0, 7.0])
        );
    }

    #[test]
    fn degrade_bounds_are_enforced() {
        let map = SparseMap::<f64>::make_empty(2, 8).unwrap();
        assert!(matches!(
            map.degrade(16, Reduction::Mean),
            Err(Error::Resolution(_))
        ));
        assert!(matches!(
            map.degrade(1, Reduction::Mean),
            Err(Error::Resolution(_))
        ));
        assert!(matches!(
            map.degrade(3, Reduction::Mean),
            Err(Error::Resolution(_))
        ));
    }

    #[test]
    fn degrade_preserves_out_of_order_coverage() {
        let mut map = SparseMap::<f64>::make_empty(1, 8).unwrap();
        // Cover coarse cell 9 first, then coarse cell 2
        map.update_values(&arr1(&[9 * 64u64]), &arr1(&[9.0])).unwrap();
        map.update_values(&arr1(&[2 * 64u64]), &arr1(&[2.0])).unwrap();

        let deg = map.degrade(2, Reduction::Mean).unwrap();
        assert_eq!(deg.valid_pixels(), arr1(&[2 * 4u64, 9 * 4]));
        assert_eq!(
            deg.get_values_pix(&arr1(&[2 * 4u64, 9 * 4])).unwrap(),
            arr1(&[2.0, 9.0])
        );
    }

    #[test]
    fn reduction_parses_from_str() {
        assert_eq!("mean".parse::<Reduction>().unwrap(), Reduction::Mean);
        assert_eq!("std".parse::<Reduction>().unwrap(), Reduction::Std);
        assert!(matches!(
            "mode".parse::<Reduction>(),
            Err(Error::Configuration(_))
        ));
    }
}
