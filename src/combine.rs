//! Set combination of scalar maps.
//!
//! All combiners are built strictly on the public map contract: enumerate
//! valid cells, look values up, update a fresh map. Union keeps every cell
//! valid in at least one input (missing operands are skipped); intersection
//! keeps only cells valid in every input. Inputs must agree on both
//! resolutions and on the sentinel.

use std::collections::BTreeMap;

use ndarray::Array1;

use crate::error::{Error, Result};
use crate::map::SparseMap;
use crate::value::{IntValue, MapValue};

fn check_inputs<T: MapValue>(maps: &[&SparseMap<T>]) -> Result<()> {
    let first = match maps.first() {
        Some(m) => m,
        None => return Err(Error::Configuration("no input maps to combine".into())),
    };
    for m in &maps[1..] {
        if m.nside_coverage() != first.nside_coverage()
            || m.nside_sparse() != first.nside_sparse()
        {
            return Err(Error::Resolution(format!(
                "cannot combine maps at nside {}/{} and {}/{}",
                first.nside_coverage(),
                first.nside_sparse(),
                m.nside_coverage(),
                m.nside_sparse()
            )));
        }
        if m.sentinel() != first.sentinel() {
            return Err(Error::Configuration(
                "cannot combine maps with different sentinels".into(),
            ));
        }
    }
    Ok(())
}

fn combine<T: MapValue>(
    maps: &[&SparseMap<T>],
    op: impl Fn(T, T) -> T,
    intersection: bool,
) -> Result<SparseMap<T>> {
    check_inputs(maps)?;
    let first = maps[0];

    // Accumulate per-cell, counting contributing maps for intersection
    let mut acc: BTreeMap<u64, (T, usize)> = BTreeMap::new();
    for m in maps {
        let valid = m.valid_pixels();
        let values = m.get_values_pix(&valid)?;
        for (i, &p) in valid.iter().enumerate() {
            acc.entry(p)
                .and_modify(|(v, n)| {
                    *v = op(*v, values[i]);
                    *n += 1;
                })
                .or_insert((values[i], 1));
        }
    }

    let kept: Vec<(u64, T)> = acc
        .into_iter()
        .filter(|&(_, (_, n))| !intersection || n == maps.len())
        .map(|(p, (v, _))| (p, v))
        .collect();

    let mut out = SparseMap::make_empty_with_sentinel(
        first.nside_coverage(),
        first.nside_sparse(),
        first.sentinel(),
    )?;
    let pixels = Array1::from_iter(kept.iter().map(|&(p, _)| p));
    let values = Array1::from_iter(kept.iter().map(|&(_, v)| v));
    out.update_values(&pixels, &values)?;
    Ok(out)
}

/// Sum over the union of valid cells.
pub fn sum_union<T: MapValue>(maps: &[&SparseMap<T>]) -> Result<SparseMap<T>> {
    combine(maps, |a, b| a + b, false)
}

/// Sum over the intersection of valid cells.
pub fn sum_intersection<T: MapValue>(maps: &[&SparseMap<T>]) -> Result<SparseMap<T>> {
    combine(maps, |a, b| a + b, true)
}

/// Product over the union of valid cells.
pub fn product_union<T: MapValue>(maps: &[&SparseMap<T>]) -> Result<SparseMap<T>> {
    combine(maps, |a, b| a * b, false)
}

/// Product over the intersection of valid cells.
pub fn product_intersection<T: MapValue>(maps: &[&SparseMap<T>]) -> Result<SparseMap<T>> {
    combine(maps, |a, b| a * b, true)
}

/// Maximum over the union of valid cells.
pub fn max_union<T: MapValue>(maps: &[&SparseMap<T>]) -> Result<SparseMap<T>> {
    combine(maps, |a, b| if b > a { b } else { a }, false)
}

/// Minimum over the intersection of valid cells.
pub fn min_intersection<T: MapValue>(maps: &[&SparseMap<T>]) -> Result<SparseMap<T>> {
    combine(maps, |a, b| if b < a { b } else { a }, true)
}

/// Bitwise or over the union of valid cells (integer maps only).
pub fn or_union<T: IntValue>(maps: &[&SparseMap<T>]) -> Result<SparseMap<T>> {
    combine(maps, |a, b| a | b, false)
}

/// Bitwise and over the intersection of valid cells (integer maps only).
pub fn and_intersection<T: IntValue>(maps: &[&SparseMap<T>]) -> Result<SparseMap<T>> {
    combine(maps, |a, b| a & b, true)
}
