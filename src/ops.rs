//! Masked elementwise operations on scalar maps.
//!
//! Operators apply only where a cell is currently valid; invalid cells stay
//! exactly at the sentinel, so the default block and uncovered regions are
//! never disturbed. The assign forms mutate storage directly; the binary
//! forms on `&SparseMap` return a new map. The bitwise family is available
//! for integer-valued maps only, enforced by the `IntValue` bound. None of
//! this is implemented for multi-field maps; project a field first.

use std::ops::{
    Add, AddAssign, BitAnd, BitAndAssign, BitOr, BitOrAssign, BitXor, BitXorAssign, Div,
    DivAssign, Mul, MulAssign, Sub, SubAssign,
};

use crate::error::{Error, Result};
use crate::map::SparseMap;
use crate::value::{FloatValue, IntValue, MapValue};

impl<T: MapValue> AddAssign<T> for SparseMap<T> {
    fn add_assign(&mut self, rhs: T) {
        self.apply_valid(|v| v + rhs);
    }
}

impl<T: MapValue> SubAssign<T> for SparseMap<T> {
    fn sub_assign(&mut self, rhs: T) {
        self.apply_valid(|v| v - rhs);
    }
}

impl<T: MapValue> MulAssign<T> for SparseMap<T> {
    fn mul_assign(&mut self, rhs: T) {
        self.apply_valid(|v| v * rhs);
    }
}

impl<T: MapValue> DivAssign<T> for SparseMap<T> {
    fn div_assign(&mut self, rhs: T) {
        self.apply_valid(|v| v / rhs);
    }
}

impl<T: MapValue> Add<T> for &SparseMap<T> {
    type Output = SparseMap<T>;

    fn add(self, rhs: T) -> SparseMap<T> {
        let mut out = self.clone();
        out += rhs;
        out
    }
}

impl<T: MapValue> Sub<T> for &SparseMap<T> {
    type Output = SparseMap<T>;

    fn sub(self, rhs: T) -> SparseMap<T> {
        let mut out = self.clone();
        out -= rhs;
        out
    }
}

impl<T: MapValue> Mul<T> for &SparseMap<T> {
    type Output = SparseMap<T>;

    fn mul(self, rhs: T) -> SparseMap<T> {
        let mut out = self.clone();
        out *= rhs;
        out
    }
}

impl<T: MapValue> Div<T> for &SparseMap<T> {
    type Output = SparseMap<T>;

    fn div(self, rhs: T) -> SparseMap<T> {
        let mut out = self.clone();
        out /= rhs;
        out
    }
}

impl<T: IntValue> BitAndAssign<T> for SparseMap<T> {
    fn bitand_assign(&mut self, rhs: T) {
        self.apply_valid(|v| v & rhs);
    }
}

impl<T: IntValue> BitOrAssign<T> for SparseMap<T> {
    fn bitor_assign(&mut self, rhs: T) {
        self.apply_valid(|v| v | rhs);
    }
}

impl<T: IntValue> BitXorAssign<T> for SparseMap<T> {
    fn bitxor_assign(&mut self, rhs: T) {
        self.apply_valid(|v| v ^ rhs);
    }
}

impl<T: IntValue> BitAnd<T> for &SparseMap<T> {
    type Output = SparseMap<T>;

    fn bitand(self, rhs: T) -> SparseMap<T> {
        let mut out = self.clone();
        out &= rhs;
        out
    }
}

impl<T: IntValue> BitOr<T> for &SparseMap<T> {
    type Output = SparseMap<T>;

    fn bitor(self, rhs: T) -> SparseMap<T> {
        let mut out = self.clone();
        out |= rhs;
        out
    }
}

impl<T: IntValue> BitXor<T> for &SparseMap<T> {
    type Output = SparseMap<T>;

    fn bitxor(self, rhs: T) -> SparseMap<T> {
        let mut out = self.clone();
        out ^= rhs;
        out
    }
}

impl<T: FloatValue> SparseMap<T> {
    /// Raise every valid cell to the power `exp` in place.
    pub fn powf_inplace(&mut self, exp: T) {
        self.apply_valid(|v| v.powf(exp));
    }

    /// Copy-returning form of [`powf_inplace`](Self::powf_inplace).
    pub fn powf(&self, exp: T) -> SparseMap<T> {
        let mut out = self.clone();
        out.powf_inplace(exp);
        out
    }
}

impl<T: MapValue> SparseMap<T> {
    /// Invalidate valid cells flagged by an integer mask map.
    ///
    /// The mask is looked up at every currently-valid cell of `self`. With
    /// `mask_bits` unset, any nonzero mask value invalidates the cell;
    /// otherwise only cells where `value & mask_bits != 0` are hit.
    /// Invalidated cells are reset to the sentinel. The mask must share
    /// `nside_sparse` with `self`.
    pub fn apply_mask<M: IntValue>(
        &mut self,
        mask: &SparseMap<M>,
        mask_bits: Option<M>,
    ) -> Result<()> {
        if mask.nside_sparse() != self.nside_sparse() {
            return Err(Error::Resolution(format!(
                "mask nside {} does not match map nside {}",
                mask.nside_sparse(),
                self.nside_sparse()
            )));
        }

        let valid = self.valid_pixels();
        let mask_values = mask.get_values_pix(&valid)?;
        let s = self.sentinel();
        for (i, &p) in valid.iter().enumerate() {
            let hit = match mask_bits {
                Some(bits) => mask_values[i] & bits != M::ZERO,
                None => mask_values[i] != M::ZERO,
            };
            if hit {
                let slot = self.cov_index().storage_index(p);
                self.values_mut()[slot] = s;
            }
        }
        Ok(())
    }

    /// Copy-returning form of [`apply_mask`](Self::apply_mask).
    pub fn masked<M: IntValue>(
        &self,
        mask: &SparseMap<M>,
        mask_bits: Option<M>,
    ) -> Result<SparseMap<T>> {
        let mut out = self.clone();
        out.apply_mask(mask, mask_bits)?;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::UNSEEN;
    use ndarray::arr1;

    fn small_map() -> SparseMap<f64> {
        let mut map = SparseMap::<f64>::make_empty(1, 4).unwrap();
        map.update_values(&arr1(&[5u64, 40, 100]), &arr1(&[1.0, 2.0, 4.0]))
            .unwrap();
        map
    }

    #[test]
    fn add_then_subtract_recovers_valid_cells() {
        let mut map = small_map();
        let original = map.clone();

        map += 10.0;
        assert_eq!(
            map.get_values_pix(&arr1(&[5u64, 40, 100])).unwrap(),
            arr1(&[11.0, 12.0, 14.0])
        );
        // Invalid cells stay exactly at the sentinel
        assert_eq!(map.get_values_pix(&arr1(&[6u64])).unwrap()[0], UNSEEN);
        assert_eq!(map.valid_pixels(), original.valid_pixels());

        map -= 10.0;
        assert_eq!(map, original);
    }

    #[test]
    fn multiply_divide_and_pow() {
        let mut map = small_map();
        map *= 3.0;
        assert_eq!(map.get_values_pix(&arr1(&[40u64])).unwrap()[0], 6.0);
        map /= 3.0;
        assert_eq!(map.get_values_pix(&arr1(&[40u64])).unwrap()[0], 2.0);

        let squared = map.powf(2.0);
        assert_eq!(
            squared.get_values_pix(&arr1(&[5u64, 40, 100])).unwrap(),
            arr1(&[1.0, 4.0, 16.0])
        );
        assert_eq!(squared.get_values_pix(&arr1(&[6u64])).unwrap()[0], UNSEEN);
    }

    #[test]
    fn binary_forms_leave_original_untouched() {
        let map = small_map();
        let shifted = &map + 1.0;
        assert_eq!(map.get_values_pix(&arr1(&[5u64])).unwrap()[0], 1.0);
        assert_eq!(shifted.get_values_pix(&arr1(&[5u64])).unwrap()[0], 2.0);
    }

    #[test]
    fn bitwise_family_on_integer_maps() {
        let mut map = SparseMap::<i64>::make_empty_with_sentinel(1, 4, -1).unwrap();
        map.update_values(&arr1(&[5u64, 40]), &arr1(&[0b0110i64, 0b1010]))
            .unwrap();

        map &= 0b0011;
        assert_eq!(
            map.get_values_pix(&arr1(&[5u64, 40])).unwrap(),
            arr1(&[0b0010i64, 0b0010])
        );

        let ored = &map | 0b0100;
        assert_eq!(ored.get_values_pix(&arr1(&[5u64])).unwrap()[0], 0b0110);

        let xored = &map ^ 0b0010;
        assert_eq!(xored.get_values_pix(&arr1(&[5u64])).unwrap()[0], 0);
        // Zero is still above the -1 sentinel, so the cell stays valid
        assert!(xored.valid_mask_pix(&arr1(&[5u64])).unwrap()[0]);
    }

    #[test]
    fn mask_without_bits_hits_any_nonzero() {
        let mut map = small_map();
        let mut mask = SparseMap::<i32>::make_empty_with_sentinel(1, 4, 0).unwrap();
        mask.update_values(&arr1(&[40u64, 100]), &arr1(&[1i32, 0])).unwrap();

        map.apply_mask(&mask, None).unwrap();
        // 40 flagged; 100 has an explicit zero flag; 5 has no mask coverage
        assert_eq!(map.valid_pixels(), arr1(&[5u64, 100]));
        assert_eq!(map.get_values_pix(&arr1(&[40u64])).unwrap()[0], UNSEEN);
    }

    #[test]
    fn mask_with_bits_is_selective() {
        let map = small_map();
        let mut mask = SparseMap::<i32>::make_empty_with_sentinel(1, 4, 0).unwrap();
        mask.update_values(&arr1(&[5u64, 40, 100]), &arr1(&[0b001i32, 0b010, 0b100]))
            .unwrap();

        let out = map.masked(&mask, Some(0b011)).unwrap();
        // 0b100 does not intersect 0b011, so 100 survives
        assert_eq!(out.valid_pixels(), arr1(&[100u64]));
        // The copy-returning form left the original alone
        assert_eq!(map.valid_pixels(), arr1(&[5u64, 40, 100]));
    }

    #[test]
    fn mask_resolution_must_match() {
        let mut map = small_map();
        let mask = SparseMap::<i32>::make_empty_with_sentinel(1, 8, 0).unwrap();
        assert!(matches!(
            map.apply_mask(&mask, None),
            Err(Error::Resolution(_))
        ));
    }
}
