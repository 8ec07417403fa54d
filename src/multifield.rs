//! Multi-field sparse maps.
//!
//! A fixed set of named typed columns shares one coverage index and one
//! row-validity rule: the designated *primary* field's fill value is its
//! sentinel, and a row is valid iff the primary value compares above it.
//! Companion fields carry arbitrary per-row data with their own fill
//! values. The field set is declared once at construction and never changes,
//! so scalar/multi-field is a construction-time variant, not a runtime
//! guess.

use log::debug;

use ndarray::Array1;

use crate::coverage::{bit_shift_between, CoverageIndex};
use crate::degrade::Reduction;
use crate::error::{Error, Result};
use crate::healpix;
use crate::map::SparseMap;
use crate::value::{Dtype, IntValue, MapValue, ScalarValue};

/// Declaration of one field: a name plus its fill value. The fill doubles
/// as the sentinel when the field is primary.
#[derive(Clone, Debug, PartialEq)]
pub struct FieldSpec {
    pub name: String,
    pub fill: ScalarValue,
}

impl FieldSpec {
    pub fn new(name: &str, fill: ScalarValue) -> FieldSpec {
        FieldSpec {
            name: name.to_string(),
            fill,
        }
    }
}

/// A typed column of per-row values, one slot per storage cell.
#[derive(Clone, Debug, PartialEq)]
pub enum FieldArray {
    F64(Array1<f64>),
    F32(Array1<f32>),
    I64(Array1<i64>),
    I32(Array1<i32>),
}

/// Typed access into a [`FieldArray`].
pub trait FieldElement: MapValue {
    fn from_field(field: &FieldArray) -> Option<&Array1<Self>>;
}

macro_rules! impl_field_element {
    ($t:ty, $variant:ident) => {
        impl FieldElement for $t {
            fn from_field(field: &FieldArray) -> Option<&Array1<$t>> {
                match field {
                    FieldArray::$variant(a) => Some(a),
                    _ => None,
                }
            }
        }
    };
}

impl_field_element!(f64, F64);
impl_field_element!(f32, F32);
impl_field_element!(i64, I64);
impl_field_element!(i32, I32);

impl FieldArray {
    pub fn dtype(&self) -> Dtype {
        match self {
            FieldArray::F64(_) => Dtype::F64,
            FieldArray::F32(_) => Dtype::F32,
            FieldArray::I64(_) => Dtype::I64,
            FieldArray::I32(_) => Dtype::I32,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            FieldArray::F64(a) => a.len(),
            FieldArray::F32(a) => a.len(),
            FieldArray::I64(a) => a.len(),
            FieldArray::I32(a) => a.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// A column of `len` copies of `fill`.
    fn full(fill: ScalarValue, len: usize) -> FieldArray {
        match fill {
            ScalarValue::F64(v) => FieldArray::F64(Array1::from_elem(len, v)),
            ScalarValue::F32(v) => FieldArray::F32(Array1::from_elem(len, v)),
            ScalarValue::I64(v) => FieldArray::I64(Array1::from_elem(len, v)),
            ScalarValue::I32(v) => FieldArray::I32(Array1::from_elem(len, v)),
        }
    }

    /// Append `n_blocks` copies of the leading default block.
    fn grow(&mut self, n_blocks: usize, cells_per_block: usize) {
        fn grow_vec<T: MapValue>(arr: &mut Array1<T>, n_blocks: usize, cpb: usize) {
            let mut vals =
                std::mem::replace(arr, Array1::from_vec(Vec::new())).into_raw_vec();
            vals.reserve(n_blocks * cpb);
            for _ in 0..n_blocks {
                vals.extend_from_within(0..cpb);
            }
            *arr = Array1::from_vec(vals);
        }
        match self {
            FieldArray::F64(a) => grow_vec(a, n_blocks, cells_per_block),
            FieldArray::F32(a) => grow_vec(a, n_blocks, cells_per_block),
            FieldArray::I64(a) => grow_vec(a, n_blocks, cells_per_block),
            FieldArray::I32(a) => grow_vec(a, n_blocks, cells_per_block),
        }
    }

    /// Write `src[i]` into `self[slots[i]]`. Columns must share a dtype.
    fn scatter_from(&mut self, slots: &[usize], src: &FieldArray) -> Result<()> {
        fn scatter<T: MapValue>(dst: &mut Array1<T>, slots: &[usize], src: &Array1<T>) {
            for (i, &slot) in slots.iter().enumerate() {
                dst[slot] = src[i];
            }
        }
        match (self, src) {
            (FieldArray::F64(d), FieldArray::F64(s)) => scatter(d, slots, s),
            (FieldArray::F32(d), FieldArray::F32(s)) => scatter(d, slots, s),
            (FieldArray::I64(d), FieldArray::I64(s)) => scatter(d, slots, s),
            (FieldArray::I32(d), FieldArray::I32(s)) => scatter(d, slots, s),
            (d, s) => {
                return Err(Error::TypeMismatch {
                    expected: d.dtype(),
                    actual: s.dtype(),
                })
            }
        }
        Ok(())
    }

    /// Reset the listed slots to `fill`. The fill must share the dtype.
    fn reset_to(&mut self, slots: &[usize], fill: ScalarValue) -> Result<()> {
        fn reset<T: MapValue>(dst: &mut Array1<T>, slots: &[usize], fill: T) {
            for &slot in slots {
                dst[slot] = fill;
            }
        }
        match (self, fill) {
            (FieldArray::F64(d), ScalarValue::F64(v)) => reset(d, slots, v),
            (FieldArray::F32(d), ScalarValue::F32(v)) => reset(d, slots, v),
            (FieldArray::I64(d), ScalarValue::I64(v)) => reset(d, slots, v),
            (FieldArray::I32(d), ScalarValue::I32(v)) => reset(d, slots, v),
            (d, f) => {
                return Err(Error::TypeMismatch {
                    expected: d.dtype(),
                    actual: f.dtype(),
                })
            }
        }
        Ok(())
    }

    /// Per-slot validity against a sentinel of the same dtype.
    fn valid_mask(&self, sentinel: ScalarValue) -> Result<Array1<bool>> {
        Ok(match (self, sentinel) {
            (FieldArray::F64(a), ScalarValue::F64(s)) => a.mapv(|v| v > s),
            (FieldArray::F32(a), ScalarValue::F32(s)) => a.mapv(|v| v > s),
            (FieldArray::I64(a), ScalarValue::I64(s)) => a.mapv(|v| v > s),
            (FieldArray::I32(a), ScalarValue::I32(s)) => a.mapv(|v| v > s),
            (a, s) => {
                return Err(Error::TypeMismatch {
                    expected: a.dtype(),
                    actual: s.dtype(),
                })
            }
        })
    }
}

/// One named column plus its fill value.
#[derive(Clone, Debug, PartialEq)]
pub struct Field {
    name: String,
    fill: ScalarValue,
    data: FieldArray,
}

impl Field {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fill(&self) -> ScalarValue {
        self.fill
    }

    pub fn dtype(&self) -> Dtype {
        self.data.dtype()
    }

    pub(crate) fn data(&self) -> &FieldArray {
        &self.data
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct MultiFieldMap {
    cov: CoverageIndex,
    fields: Vec<Field>,
    primary: usize,
    nside_sparse: u32,
}

impl MultiFieldMap {
    /// An empty multi-field map. `primary` must name one of `specs`; its
    /// fill is the sentinel defining row validity.
    pub fn make_empty(
        nside_coverage: u32,
        nside_sparse: u32,
        specs: &[FieldSpec],
        primary: &str,
    ) -> Result<MultiFieldMap> {
        let bit_shift = bit_shift_between(nside_coverage, nside_sparse)?;
        let cpb = 1usize << bit_shift;

        if specs.is_empty() {
            return Err(Error::Configuration(
                "a multi-field map needs at least one field".into(),
            ));
        }
        for (i, spec) in specs.iter().enumerate() {
            if specs[..i].iter().any(|s| s.name == spec.name) {
                return Err(Error::Configuration(format!(
                    "duplicate field name {:?}",
                    spec.name
                )));
            }
        }
        let primary_idx = specs
            .iter()
            .position(|s| s.name == primary)
            .ok_or_else(|| {
                Error::Configuration(format!(
                    "primary field {primary:?} is not among the declared fields"
                ))
            })?;

        let fields = specs
            .iter()
            .map(|s| Field {
                name: s.name.clone(),
                fill: s.fill,
                data: FieldArray::full(s.fill, cpb),
            })
            .collect();

        Ok(MultiFieldMap {
            cov: CoverageIndex::new_empty(nside_coverage, bit_shift),
            fields,
            primary: primary_idx,
            nside_sparse,
        })
    }

    /// Assemble a map from a raw coverage array and one column per field,
    /// e.g. as read from persisted storage. Validates the storage
    /// invariants, including that every field's block 0 holds only its
    /// fill value.
    pub fn from_parts(
        cov_raw: Array1<i64>,
        columns: Vec<(FieldSpec, FieldArray)>,
        nside_coverage: u32,
        nside_sparse: u32,
        primary: &str,
    ) -> Result<MultiFieldMap> {
        let bit_shift = bit_shift_between(nside_coverage, nside_sparse)?;
        let cov = CoverageIndex::from_raw(cov_raw, nside_coverage, bit_shift)?;
        let cpb = cov.cells_per_block() as usize;

        if columns.is_empty() {
            return Err(Error::Configuration(
                "a multi-field map needs at least one field".into(),
            ));
        }
        let n_rows = columns[0].1.len();
        if n_rows == 0 || n_rows % cpb != 0 {
            return Err(Error::Dimension(format!(
                "column length {n_rows} is not a positive multiple of the block size {cpb}"
            )));
        }

        let mut fields = Vec::with_capacity(columns.len());
        for (spec, data) in columns {
            if data.dtype() != spec.fill.dtype() {
                return Err(Error::TypeMismatch {
                    expected: spec.fill.dtype(),
                    actual: data.dtype(),
                });
            }
            if data.len() != n_rows {
                return Err(Error::Dimension(format!(
                    "field {:?} has {} rows, expected {n_rows}",
                    spec.name,
                    data.len()
                )));
            }
            if fields.iter().any(|f: &Field| f.name == spec.name) {
                return Err(Error::Configuration(format!(
                    "duplicate field name {:?}",
                    spec.name
                )));
            }
            let clean = match (&data, spec.fill) {
                (FieldArray::F64(a), ScalarValue::F64(v)) => {
                    a.iter().take(cpb).all(|&x| x == v)
                }
                (FieldArray::F32(a), ScalarValue::F32(v)) => {
                    a.iter().take(cpb).all(|&x| x == v)
                }
                (FieldArray::I64(a), ScalarValue::I64(v)) => {
                    a.iter().take(cpb).all(|&x| x == v)
                }
                (FieldArray::I32(a), ScalarValue::I32(v)) => {
                    a.iter().take(cpb).all(|&x| x == v)
                }
                _ => false,
            };
            if !clean {
                return Err(Error::Configuration(format!(
                    "block 0 of field {:?} must hold only its fill value",
                    spec.name
                )));
            }
            fields.push(Field {
                name: spec.name,
                fill: spec.fill,
                data,
            });
        }

        let primary_idx = fields
            .iter()
            .position(|f| f.name == primary)
            .ok_or_else(|| {
                Error::Configuration(format!(
                    "primary field {primary:?} is not among the declared fields"
                ))
            })?;

        Ok(MultiFieldMap {
            cov,
            fields,
            primary: primary_idx,
            nside_sparse,
        })
    }

    pub fn nside_coverage(&self) -> u32 {
        self.cov.nside()
    }

    pub fn nside_sparse(&self) -> u32 {
        self.nside_sparse
    }

    pub fn cov_index(&self) -> &CoverageIndex {
        &self.cov
    }

    pub fn n_fields(&self) -> usize {
        self.fields.len()
    }

    pub fn field_names(&self) -> Vec<&str> {
        self.fields.iter().map(|f| f.name.as_str()).collect()
    }

    pub fn primary_name(&self) -> &str {
        &self.fields[self.primary].name
    }

    pub fn field_dtype(&self, name: &str) -> Option<Dtype> {
        self.field(name).map(|f| f.data.dtype())
    }

    pub(crate) fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub(crate) fn primary_index(&self) -> usize {
        self.primary
    }

    fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
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

    /// Row validity over the whole storage, defined by the primary field.
    fn storage_valid_mask(&self) -> Array1<bool> {
        let primary = &self.fields[self.primary];
        match primary.data.valid_mask(primary.fill) {
            Ok(mask) => mask,
            // Fill dtype always matches the column dtype by construction
            Err(_) => unreachable!("primary fill dtype diverged from its column"),
        }
    }

    /// Values of one field at nested fine cells.
    pub fn get_values_pix<T: FieldElement>(
        &self,
        name: &str,
        pixels: &Array1<u64>,
    ) -> Result<Array1<T>> {
        self.check_pixels(pixels)?;
        let field = self.field(name).ok_or_else(|| {
            Error::Configuration(format!("unknown field {name:?}"))
        })?;
        let column = T::from_field(&field.data).ok_or(Error::TypeMismatch {
            expected: field.data.dtype(),
            actual: T::DTYPE,
        })?;
        Ok(pixels.mapv(|p| column[self.cov.storage_index(p)]))
    }

    /// Row-validity mask at nested fine cells.
    pub fn valid_mask_pix(&self, pixels: &Array1<u64>) -> Result<Array1<bool>> {
        self.check_pixels(pixels)?;
        let mask = self.storage_valid_mask();
        Ok(pixels.mapv(|p| mask[self.cov.storage_index(p)]))
    }

    /// All valid rows as fine cell ids, ascending.
    pub fn valid_pixels(&self) -> Array1<u64> {
        let cpb = self.cov.cells_per_block();
        let mask = self.storage_valid_mask();
        let mut out = Vec::new();
        for c in self.cov.covered_cells() {
            let base = c * cpb;
            let start = self.cov.storage_index(base);
            for j in 0..cpb as usize {
                if mask[start + j] {
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

    /// Fraction of valid rows per coarse cell (0 outside coverage).
    pub fn coverage_map(&self) -> Array1<f64> {
        let cpb = self.cov.cells_per_block();
        let mask = self.storage_valid_mask();
        let mut out = Array1::from_elem(self.cov.n_cells(), 0.0);
        for c in self.cov.covered_cells() {
            let start = self.cov.storage_index(c * cpb);
            let n_valid = (0..cpb as usize).filter(|&j| mask[start + j]).count();
            out[c as usize] = n_valid as f64 / cpb as f64;
        }
        out
    }

    /// Overwrite whole rows at nested fine cells, growing coverage as
    /// needed. `columns` must carry exactly one column per declared field.
    ///
    /// Duplicate pixels within one call are last-write-wins in input order.
    /// Validation happens before any mutation.
    pub fn update_values(
        &mut self,
        pixels: &Array1<u64>,
        columns: &[(&str, FieldArray)],
    ) -> Result<()> {
        self.check_pixels(pixels)?;

        // Pair every declared field with its incoming column before
        // touching storage
        let mut per_field: Vec<Option<&FieldArray>> = vec![None; self.fields.len()];
        for (name, column) in columns {
            let idx = self
                .fields
                .iter()
                .position(|f| f.name == *name)
                .ok_or_else(|| Error::Configuration(format!("unknown field {name:?}")))?;
            if per_field[idx].is_some() {
                return Err(Error::Configuration(format!(
                    "field {name:?} appears twice in the update"
                )));
            }
            if column.dtype() != self.fields[idx].data.dtype() {
                return Err(Error::TypeMismatch {
                    expected: self.fields[idx].data.dtype(),
                    actual: column.dtype(),
                });
            }
            if column.len() != pixels.len() {
                return Err(Error::Dimension(format!(
                    "field {name:?} has {} rows but {} pixels were given",
                    column.len(),
                    pixels.len()
                )));
            }
            per_field[idx] = Some(column);
        }
        if let Some(idx) = per_field.iter().position(|c| c.is_none()) {
            return Err(Error::Configuration(format!(
                "update is missing field {:?}",
                self.fields[idx].name
            )));
        }

        let shift = self.cov.bit_shift();
        let plan = self.cov.plan_growth(pixels.iter().map(|&p| p >> shift));
        if !plan.is_empty() {
            let cpb = self.cov.cells_per_block() as usize;
            debug!(
                "growing multi-field coverage by {} blocks across {} fields",
                plan.len(),
                self.fields.len()
            );
            let old_len = self.fields[0].data.len();
            for field in &mut self.fields {
                field.data.grow(plan.len(), cpb);
            }
            self.cov.commit_growth(&plan, old_len);
        }

        let slots: Vec<usize> = pixels.iter().map(|&p| self.cov.storage_index(p)).collect();
        for (idx, column) in per_field.iter().enumerate() {
            if let Some(column) = column {
                self.fields[idx].data.scatter_from(&slots, column)?;
            }
        }
        Ok(())
    }

    /// Invalidate valid rows flagged by an integer mask map: the primary
    /// field drops to its sentinel, companions to their own fill.
    pub fn apply_mask<M: IntValue>(
        &mut self,
        mask: &SparseMap<M>,
        mask_bits: Option<M>,
    ) -> Result<()> {
        if mask.nside_sparse() != self.nside_sparse {
            return Err(Error::Resolution(format!(
                "mask nside {} does not match map nside {}",
                mask.nside_sparse(),
                self.nside_sparse
            )));
        }

        let valid = self.valid_pixels();
        let mask_values = mask.get_values_pix(&valid)?;
        let mut hit_slots = Vec::new();
        for (i, &p) in valid.iter().enumerate() {
            let hit = match mask_bits {
                Some(bits) => mask_values[i] & bits != M::ZERO,
                None => mask_values[i] != M::ZERO,
            };
            if hit {
                hit_slots.push(self.cov.storage_index(p));
            }
        }
        for field in &mut self.fields {
            let fill = field.fill;
            field.data.reset_to(&hit_slots, fill)?;
        }
        Ok(())
    }

    /// Copy-returning form of [`apply_mask`](Self::apply_mask).
    pub fn masked<M: IntValue>(
        &self,
        mask: &SparseMap<M>,
        mask_bits: Option<M>,
    ) -> Result<MultiFieldMap> {
        let mut out = self.clone();
        out.apply_mask(mask, mask_bits)?;
        Ok(out)
    }

    /// Degrade is not defined for multi-field maps; project a field first.
    pub fn degrade(&self, _nside_out: u32, _reduction: Reduction) -> Result<MultiFieldMap> {
        Err(Error::Unsupported(
            "degrade of a multi-field map; project a field with select_field first".into(),
        ))
    }

    /// Project one field into a scalar map sharing this coverage.
    ///
    /// The projection is re-sentineled by *row* validity: a row invalid in
    /// the primary field yields the projection's sentinel no matter what
    /// raw value the companion holds. Integer fields need
    /// `override_sentinel`.
    pub fn select_field<T: FieldElement>(
        &self,
        name: &str,
        override_sentinel: Option<T>,
    ) -> Result<SparseMap<T>> {
        let field = self.field(name).ok_or_else(|| {
            Error::Configuration(format!("unknown field {name:?}"))
        })?;
        let column = T::from_field(&field.data).ok_or(Error::TypeMismatch {
            expected: field.data.dtype(),
            actual: T::DTYPE,
        })?;
        let sentinel = match override_sentinel.or_else(T::default_sentinel) {
            Some(s) => s,
            None => {
                return Err(Error::Configuration(format!(
                    "field {name:?} has an integer type, supply an explicit sentinel"
                )))
            }
        };

        let row_valid = self.storage_valid_mask();
        let values = Array1::from_iter(
            column
                .iter()
                .zip(row_valid.iter())
                .map(|(&v, &ok)| if ok { v } else { sentinel }),
        );

        SparseMap::from_parts(
            self.cov.raw().clone(),
            values,
            self.cov.nside(),
            self.nside_sparse,
            sentinel,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::UNSEEN;
    use ndarray::arr1;

    fn two_field_map() -> MultiFieldMap {
        let specs = [
            FieldSpec::new("a", ScalarValue::F64(UNSEEN)),
            FieldSpec::new("b", ScalarValue::I64(0)),
        ];
        MultiFieldMap::make_empty(1, 4, &specs, "a").unwrap()
    }

    #[test]
    fn construction_requires_a_known_primary() {
        let specs = [FieldSpec::new("a", ScalarValue::F64(UNSEEN))];
        assert!(matches!(
            MultiFieldMap::make_empty(1, 4, &specs, "missing"),
            Err(Error::Configuration(_))
        ));
        assert!(matches!(
            MultiFieldMap::make_empty(1, 4, &[], "a"),
            Err(Error::Configuration(_))
        ));

        let dup = [
            FieldSpec::new("a", ScalarValue::F64(UNSEEN)),
            FieldSpec::new("a", ScalarValue::F64(UNSEEN)),
        ];
        assert!(matches!(
            MultiFieldMap::make_empty(1, 4, &dup, "a"),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn update_and_lookup_rows() {
        let mut map = two_field_map();
        map.update_values(
            &arr1(&[5u64, 40]),
            &[
                ("a", FieldArray::F64(arr1(&[1.0, 2.0]))),
                ("b", FieldArray::I64(arr1(&[10, 20]))),
            ],
        )
        .unwrap();

        assert_eq!(map.valid_pixels(), arr1(&[5u64, 40]));
        assert_eq!(
            map.get_values_pix::<f64>("a", &arr1(&[5u64, 40, 7])).unwrap(),
            arr1(&[1.0, 2.0, UNSEEN])
        );
        assert_eq!(
            map.get_values_pix::<i64>("b", &arr1(&[5u64, 40, 7])).unwrap(),
            arr1(&[10i64, 20, 0])
        );
        assert_eq!(
            map.valid_mask_pix(&arr1(&[5u64, 40, 7])).unwrap(),
            arr1(&[true, true, false])
        );
    }

    #[test]
    fn update_validates_the_whole_batch_first() {
        let mut map = two_field_map();
        let before = map.clone();

        // Missing field
        let err = map.update_values(
            &arr1(&[5u64]),
            &[("a", FieldArray::F64(arr1(&[1.0])))],
        );
        assert!(matches!(err, Err(Error::Configuration(_))));
        assert_eq!(map, before);

        // Wrong dtype for "b"
        let err = map.update_values(
            &arr1(&[5u64]),
            &[
                ("a", FieldArray::F64(arr1(&[1.0]))),
                ("b", FieldArray::F64(arr1(&[1.0]))),
            ],
        );
        assert!(matches!(err, Err(Error::TypeMismatch { .. })));
        assert_eq!(map, before);

        // Wrong column length
        let err = map.update_values(
            &arr1(&[5u64]),
            &[
                ("a", FieldArray::F64(arr1(&[1.0, 2.0]))),
                ("b", FieldArray::I64(arr1(&[1, 2]))),
            ],
        );
        assert!(matches!(err, Err(Error::Dimension(_))));
        assert_eq!(map, before);

        // Unknown field
        let err = map.update_values(
            &arr1(&[5u64]),
            &[
                ("a", FieldArray::F64(arr1(&[1.0]))),
                ("c", FieldArray::I64(arr1(&[1]))),
            ],
        );
        assert!(matches!(err, Err(Error::Configuration(_))));
        assert_eq!(map, before);
    }

    #[test]
    fn growth_copies_every_fill_value() {
        let mut map = two_field_map();
        map.update_values(
            &arr1(&[40u64]),
            &[
                ("a", FieldArray::F64(arr1(&[2.0]))),
                ("b", FieldArray::I64(arr1(&[20]))),
            ],
        )
        .unwrap();

        // Neighbouring cell in the newly covered block carries the fills
        assert_eq!(
            map.get_values_pix::<f64>("a", &arr1(&[41u64])).unwrap()[0],
            UNSEEN
        );
        assert_eq!(
            map.get_values_pix::<i64>("b", &arr1(&[41u64])).unwrap()[0],
            0
        );
    }

    #[test]
    fn select_field_follows_primary_validity() {
        // Row 3 of the covered block holds a non-fill companion value but an
        // invalid primary
        let mut map = two_field_map();
        map.update_values(
            &arr1(&[0u64, 1, 2, 3]),
            &[
                ("a", FieldArray::F64(arr1(&[1.0, 1.0, 1.0, UNSEEN]))),
                ("b", FieldArray::I64(arr1(&[7, 8, 9, 99]))),
            ],
        )
        .unwrap();

        let b = map.select_field::<i64>("b", Some(-1)).unwrap();
        assert_eq!(b.sentinel(), -1);
        assert_eq!(
            b.get_values_pix(&arr1(&[0u64, 1, 2, 3])).unwrap(),
            arr1(&[7i64, 8, 9, -1])
        );
        // Same coverage layout, no regrowth
        assert_eq!(b.cov_index().raw(), map.cov_index().raw());

        let a = map.select_field::<f64>("a", None).unwrap();
        assert_eq!(a.valid_pixels(), arr1(&[0u64, 1, 2]));
    }

    #[test]
    fn select_field_checks_name_dtype_and_sentinel() {
        let map = two_field_map();
        assert!(matches!(
            map.select_field::<f64>("missing", None),
            Err(Error::Configuration(_))
        ));
        assert!(matches!(
            map.select_field::<f64>("b", None),
            Err(Error::TypeMismatch { .. })
        ));
        // Integer field without an explicit sentinel
        assert!(matches!(
            map.select_field::<i64>("b", None),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn mask_resets_companions_to_their_own_fill() {
        let mut map = two_field_map();
        map.update_values(
            &arr1(&[5u64, 6]),
            &[
                ("a", FieldArray::F64(arr1(&[1.0, 2.0]))),
                ("b", FieldArray::I64(arr1(&[10, 20]))),
            ],
        )
        .unwrap();

        let mut mask = SparseMap::<i32>::make_empty_with_sentinel(1, 4, 0).unwrap();
        mask.update_values(&arr1(&[6u64]), &arr1(&[1i32])).unwrap();

        map.apply_mask(&mask, None).unwrap();
        assert_eq!(map.valid_pixels(), arr1(&[5u64]));
        assert_eq!(
            map.get_values_pix::<f64>("a", &arr1(&[6u64])).unwrap()[0],
            UNSEEN
        );
        assert_eq!(map.get_values_pix::<i64>("b", &arr1(&[6u64])).unwrap()[0], 0);
    }

    #[test]
    fn degrade_is_unsupported() {
        let map = two_field_map();
        assert!(matches!(
            map.degrade(2, Reduction::Mean),
            Err(Error::Unsupported(_))
        ));
    }
}
