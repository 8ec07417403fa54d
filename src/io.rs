//! Persisted map container.
//!
//! A versioned little-endian binary layout: magic, version, header records
//! (map kind, resolutions, per-field name/dtype/fill), the raw coverage
//! array, then the value columns. Every column is laid out in blocks of
//! `cells_per_block` with block 0 (the default block) first, one field after
//! another, byte-identical in structure to the in-memory arrays. That
//! equivalence is what lets a partial read seek straight to the requested
//! blocks without decoding the rest of the file.
//!
//! Writes are canonical: blocks are emitted in ascending coarse-cell order
//! and the coverage array is rewritten to match, so two maps with the same
//! contents produce the same bytes regardless of their growth history.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;

use log::info;
use ndarray::Array1;

use crate::coverage::{bit_shift_between, CoverageIndex};
use crate::error::{Error, Result};
use crate::healpix;
use crate::map::SparseMap;
use crate::multifield::{FieldArray, FieldSpec, MultiFieldMap};
use crate::value::{Dtype, MapValue, ScalarValue};

const MAGIC: &[u8; 4] = b"SPXM";
const VERSION: u32 = 1;

const KIND_SCALAR: u8 = 0;
const KIND_MULTI_FIELD: u8 = 1;

fn write_u8(w: &mut impl Write, v: u8) -> io::Result<()> {
    w.write_all(&[v])
}

fn write_u16(w: &mut impl Write, v: u16) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

fn write_u32(w: &mut impl Write, v: u32) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

fn write_u64(w: &mut impl Write, v: u64) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

fn write_i64(w: &mut impl Write, v: i64) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

fn read_u8(r: &mut impl Read) -> io::Result<u8> {
    let mut buf = [0u8; 1];
    r.read_exact(&mut buf)?;
    Ok(buf[0])
}

fn read_u16(r: &mut impl Read) -> io::Result<u16> {
    let mut buf = [0u8; 2];
    r.read_exact(&mut buf)?;
    Ok(u16::from_le_bytes(buf))
}

fn read_u32(r: &mut impl Read) -> io::Result<u32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u64(r: &mut impl Read) -> io::Result<u64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

fn read_i64(r: &mut impl Read) -> io::Result<i64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(i64::from_le_bytes(buf))
}

/// Map kind recorded in the header.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MapKind {
    Scalar,
    MultiField,
}

/// Per-field header record.
#[derive(Clone, Debug, PartialEq)]
pub struct FieldInfo {
    pub name: String,
    pub dtype: Dtype,
    pub fill: ScalarValue,
}

/// Everything the header says about a persisted map, plus the coverage
/// summary, without touching the value columns.
#[derive(Clone, Debug, PartialEq)]
pub struct MapInfo {
    pub kind: MapKind,
    pub nside_coverage: u32,
    pub nside_sparse: u32,
    /// Primary field name (the only field, for scalar maps).
    pub primary: String,
    pub fields: Vec<FieldInfo>,
    pub n_covered: usize,
    pub n_rows: usize,
}

struct Header {
    kind: u8,
    nside_coverage: u32,
    nside_sparse: u32,
    primary: u16,
    fields: Vec<FieldInfo>,
}

fn write_header(w: &mut impl Write, header: &Header) -> io::Result<()> {
    w.write_all(MAGIC)?;
    write_u32(w, VERSION)?;
    write_u8(w, header.kind)?;
    write_u32(w, header.nside_coverage)?;
    write_u32(w, header.nside_sparse)?;
    write_u16(w, header.fields.len() as u16)?;
    write_u16(w, header.primary)?;
    for field in &header.fields {
        write_u16(w, field.name.len() as u16)?;
        w.write_all(field.name.as_bytes())?;
        write_u8(w, field.dtype.tag())?;
        field.fill.write_le(w)?;
    }
    Ok(())
}

fn read_header(r: &mut impl Read) -> Result<Header> {
    let mut magic = [0u8; 4];
    r.read_exact(&mut magic)?;
    if &magic != MAGIC {
        return Err(Error::Format("invalid magic bytes".into()));
    }

    let version = read_u32(r)?;
    if version != VERSION {
        return Err(Error::Format(format!("unsupported version: {version}")));
    }

    let kind = read_u8(r)?;
    if kind != KIND_SCALAR && kind != KIND_MULTI_FIELD {
        return Err(Error::Format(format!("unknown map kind: {kind}")));
    }

    let nside_coverage = read_u32(r)?;
    let nside_sparse = read_u32(r)?;
    let n_fields = read_u16(r)?;
    let primary = read_u16(r)?;
    if n_fields == 0 || primary >= n_fields {
        return Err(Error::Format(format!(
            "header declares {n_fields} fields with primary index {primary}"
        )));
    }

    let mut fields = Vec::with_capacity(n_fields as usize);
    for _ in 0..n_fields {
        let name_len = read_u16(r)? as usize;
        let mut name_bytes = vec![0u8; name_len];
        r.read_exact(&mut name_bytes)?;
        let name = String::from_utf8(name_bytes)
            .map_err(|_| Error::Format("field name is not valid utf-8".into()))?;
        let dtype = Dtype::from_tag(read_u8(r)?)
            .ok_or_else(|| Error::Format("unknown element type tag".into()))?;
        let fill = ScalarValue::read_le(dtype, r)?;
        fields.push(FieldInfo { name, dtype, fill });
    }

    Ok(Header {
        kind,
        nside_coverage,
        nside_sparse,
        primary,
        fields,
    })
}

fn write_cov(w: &mut impl Write, cov: &CoverageIndex) -> io::Result<()> {
    write_u64(w, cov.raw().len() as u64)?;
    for &off in cov.raw() {
        write_i64(w, off)?;
    }
    Ok(())
}

fn read_cov(r: &mut impl Read, nside_coverage: u32, bit_shift: u32) -> Result<CoverageIndex> {
    let n_cov = read_u64(r)? as usize;
    if n_cov as u64 != healpix::npix(nside_coverage) {
        return Err(Error::Format(format!(
            "coverage array has {n_cov} entries, expected {} for nside {nside_coverage}",
            healpix::npix(nside_coverage)
        )));
    }
    let mut raw = Vec::with_capacity(n_cov);
    for _ in 0..n_cov {
        raw.push(read_i64(r)?);
    }
    CoverageIndex::from_raw(Array1::from_vec(raw), nside_coverage, bit_shift)
}

fn create_target(path: &Path, clobber: bool) -> Result<BufWriter<File>> {
    if path.exists() && !clobber {
        return Err(Error::Io(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("{} exists and clobber is false", path.display()),
        )));
    }
    Ok(BufWriter::new(File::create(path)?))
}

/// Sort and uniqueness-check the coarse cells requested by a partial read.
fn checked_request(cov_cells: &[u64]) -> Result<Vec<u64>> {
    let mut sorted = cov_cells.to_vec();
    sorted.sort_unstable();
    if sorted.windows(2).any(|w| w[0] == w[1]) {
        return Err(Error::Dimension(
            "requested coverage cells must be unique".into(),
        ));
    }
    Ok(sorted)
}

/// Read the header and coverage summary of a persisted map.
pub fn read_info(path: &Path) -> Result<MapInfo> {
    let mut r = BufReader::new(File::open(path)?);
    let header = read_header(&mut r)?;
    let bit_shift = bit_shift_between(header.nside_coverage, header.nside_sparse)?;
    let cov = read_cov(&mut r, header.nside_coverage, bit_shift)?;
    let n_rows = read_u64(&mut r)? as usize;

    let primary = header.fields[header.primary as usize].name.clone();
    Ok(MapInfo {
        kind: if header.kind == KIND_SCALAR {
            MapKind::Scalar
        } else {
            MapKind::MultiField
        },
        nside_coverage: header.nside_coverage,
        nside_sparse: header.nside_sparse,
        primary,
        fields: header.fields,
        n_covered: cov.covered_cells().len(),
        n_rows,
    })
}

impl<T: MapValue> SparseMap<T> {
    /// Write the map, refusing to overwrite an existing file unless
    /// `clobber` is set.
    pub fn write(&self, path: &Path, clobber: bool) -> Result<()> {
        let mut w = create_target(path, clobber)?;

        let covered = self.cov_index().covered_cells();
        let cpb = self.cov_index().cells_per_block() as usize;
        let canonical =
            CoverageIndex::from_covered(self.nside_coverage(), self.cov_index().bit_shift(), &covered);

        write_header(
            &mut w,
            &Header {
                kind: KIND_SCALAR,
                nside_coverage: self.nside_coverage(),
                nside_sparse: self.nside_sparse(),
                primary: 0,
                fields: vec![FieldInfo {
                    name: String::new(),
                    dtype: T::DTYPE,
                    fill: self.sentinel().to_scalar(),
                }],
            },
        )?;
        write_cov(&mut w, &canonical)?;

        write_u64(&mut w, ((covered.len() + 1) * cpb) as u64)?;
        // Block 0, then data blocks in ascending coarse-cell order
        for j in 0..cpb {
            self.values()[j].write_le(&mut w)?;
        }
        for &c in &covered {
            let start = self
                .cov_index()
                .storage_index(c * self.cov_index().cells_per_block());
            for j in 0..cpb {
                self.values()[start + j].write_le(&mut w)?;
            }
        }
        w.flush()?;

        info!(
            "wrote {} ({} covered cells, {} rows)",
            path.display(),
            covered.len(),
            (covered.len() + 1) * cpb
        );
        Ok(())
    }

    /// Read a full map.
    pub fn read(path: &Path) -> Result<SparseMap<T>> {
        let mut r = BufReader::new(File::open(path)?);
        let header = read_header(&mut r)?;
        let (sentinel, bit_shift) = check_scalar_header::<T>(&header)?;
        let cov = read_cov(&mut r, header.nside_coverage, bit_shift)?;

        let n_rows = read_u64(&mut r)? as usize;
        let mut values = Vec::with_capacity(n_rows);
        for _ in 0..n_rows {
            values.push(T::read_le(&mut r)?);
        }

        info!("read {} ({n_rows} rows)", path.display());
        SparseMap::from_parts(
            cov.raw().clone(),
            Array1::from_vec(values),
            header.nside_coverage,
            header.nside_sparse,
            sentinel,
        )
    }

    /// Read only the blocks of the requested coverage cells (plus the
    /// default block). Requested cells outside the persisted coverage are
    /// dropped; if none remain the read fails with [`Error::NotFound`].
    pub fn read_partial(path: &Path, cov_cells: &[u64]) -> Result<SparseMap<T>> {
        let requested = checked_request(cov_cells)?;

        let mut r = BufReader::new(File::open(path)?);
        let header = read_header(&mut r)?;
        let (sentinel, bit_shift) = check_scalar_header::<T>(&header)?;
        let full_cov = read_cov(&mut r, header.nside_coverage, bit_shift)?;

        let n_rows = read_u64(&mut r)? as usize;
        let data_start = r.stream_position()?;
        let cpb = full_cov.cells_per_block() as usize;
        let elem = T::DTYPE.size() as u64;
        if n_rows % cpb != 0 {
            return Err(Error::Format(format!(
                "row count {n_rows} is not a multiple of the block size {cpb}"
            )));
        }

        let kept: Vec<u64> = requested
            .iter()
            .copied()
            .filter(|&c| (c as usize) < full_cov.n_cells() && full_cov.is_covered(c))
            .collect();
        if kept.is_empty() {
            return Err(Error::NotFound(
                "none of the requested coverage cells are in the persisted coverage".into(),
            ));
        }

        let mut values = Vec::with_capacity((kept.len() + 1) * cpb);
        let read_block = |r: &mut BufReader<File>, block: usize, out: &mut Vec<T>| -> Result<()> {
            r.seek(SeekFrom::Start(data_start + block as u64 * cpb as u64 * elem))?;
            for _ in 0..cpb {
                out.push(T::read_le(r)?);
            }
            Ok(())
        };
        read_block(&mut r, 0, &mut values)?;
        for &c in &kept {
            read_block(&mut r, full_cov.block_of(c), &mut values)?;
        }

        info!(
            "partially read {} ({} of {} covered cells)",
            path.display(),
            kept.len(),
            full_cov.covered_cells().len()
        );
        let scoped = CoverageIndex::from_covered(header.nside_coverage, bit_shift, &kept);
        SparseMap::from_parts(
            scoped.raw().clone(),
            Array1::from_vec(values),
            header.nside_coverage,
            header.nside_sparse,
            sentinel,
        )
    }
}

fn check_scalar_header<T: MapValue>(header: &Header) -> Result<(T, u32)> {
    if header.kind != KIND_SCALAR {
        return Err(Error::Configuration(
            "file holds a multi-field map, read it with MultiFieldMap".into(),
        ));
    }
    let field = &header.fields[0];
    if field.dtype != T::DTYPE {
        return Err(Error::TypeMismatch {
            expected: field.dtype,
            actual: T::DTYPE,
        });
    }
    let sentinel = T::from_scalar(field.fill).ok_or_else(|| {
        Error::Format("sentinel does not match the declared element type".into())
    })?;
    let bit_shift = bit_shift_between(header.nside_coverage, header.nside_sparse)?;
    Ok((sentinel, bit_shift))
}

impl MultiFieldMap {
    /// Write the map, refusing to overwrite an existing file unless
    /// `clobber` is set.
    pub fn write(&self, path: &Path, clobber: bool) -> Result<()> {
        let mut w = create_target(path, clobber)?;

        let covered = self.cov_index().covered_cells();
        let cpb = self.cov_index().cells_per_block() as usize;
        let canonical =
            CoverageIndex::from_covered(self.nside_coverage(), self.cov_index().bit_shift(), &covered);

        write_header(
            &mut w,
            &Header {
                kind: KIND_MULTI_FIELD,
                nside_coverage: self.nside_coverage(),
                nside_sparse: self.nside_sparse(),
                primary: self.primary_index() as u16,
                fields: self
                    .fields()
                    .iter()
                    .map(|f| FieldInfo {
                        name: f.name().to_string(),
                        dtype: f.dtype(),
                        fill: f.fill(),
                    })
                    .collect(),
            },
        )?;
        write_cov(&mut w, &canonical)?;
        write_u64(&mut w, ((covered.len() + 1) * cpb) as u64)?;

        for field in self.fields() {
            let block_starts = std::iter::once(0).chain(
                covered
                    .iter()
                    .map(|&c| self.cov_index().storage_index(c * cpb as u64)),
            );
            for start in block_starts {
                match field.data() {
                    FieldArray::F64(a) => {
                        for j in 0..cpb {
                            a[start + j].write_le(&mut w)?;
                        }
                    }
                    FieldArray::F32(a) => {
                        for j in 0..cpb {
                            a[start + j].write_le(&mut w)?;
                        }
                    }
                    FieldArray::I64(a) => {
                        for j in 0..cpb {
                            a[start + j].write_le(&mut w)?;
                        }
                    }
                    FieldArray::I32(a) => {
                        for j in 0..cpb {
                            a[start + j].write_le(&mut w)?;
                        }
                    }
                }
            }
        }
        w.flush()?;

        info!(
            "wrote {} ({} fields, {} covered cells)",
            path.display(),
            self.n_fields(),
            covered.len()
        );
        Ok(())
    }

    /// Read a full multi-field map.
    pub fn read(path: &Path) -> Result<MultiFieldMap> {
        let mut r = BufReader::new(File::open(path)?);
        let header = read_header(&mut r)?;
        if header.kind != KIND_MULTI_FIELD {
            return Err(Error::Configuration(
                "file holds a scalar map, read it with SparseMap".into(),
            ));
        }
        let bit_shift = bit_shift_between(header.nside_coverage, header.nside_sparse)?;
        let cov = read_cov(&mut r, header.nside_coverage, bit_shift)?;
        let n_rows = read_u64(&mut r)? as usize;

        let mut columns = Vec::with_capacity(header.fields.len());
        for field in &header.fields {
            let data = read_column(&mut r, field.dtype, n_rows)?;
            columns.push((FieldSpec::new(&field.name, field.fill), data));
        }

        let primary = header.fields[header.primary as usize].name.clone();
        info!("read {} ({} fields, {n_rows} rows)", path.display(), columns.len());
        MultiFieldMap::from_parts(
            cov.raw().clone(),
            columns,
            header.nside_coverage,
            header.nside_sparse,
            &primary,
        )
    }

    /// Read only the blocks of the requested coverage cells (plus the
    /// default block) of every field.
    pub fn read_partial(path: &Path, cov_cells: &[u64]) -> Result<MultiFieldMap> {
        let requested = checked_request(cov_cells)?;

        let mut r = BufReader::new(File::open(path)?);
        let header = read_header(&mut r)?;
        if header.kind != KIND_MULTI_FIELD {
            return Err(Error::Configuration(
                "file holds a scalar map, read it with SparseMap".into(),
            ));
        }
        let bit_shift = bit_shift_between(header.nside_coverage, header.nside_sparse)?;
        let full_cov = read_cov(&mut r, header.nside_coverage, bit_shift)?;
        let n_rows = read_u64(&mut r)? as usize;
        let data_start = r.stream_position()?;
        let cpb = full_cov.cells_per_block() as usize;

        let kept: Vec<u64> = requested
            .iter()
            .copied()
            .filter(|&c| (c as usize) < full_cov.n_cells() && full_cov.is_covered(c))
            .collect();
        if kept.is_empty() {
            return Err(Error::NotFound(
                "none of the requested coverage cells are in the persisted coverage".into(),
            ));
        }

        let mut columns = Vec::with_capacity(header.fields.len());
        let mut field_start = data_start;
        for field in &header.fields {
            let elem = field.dtype.size() as u64;
            let mut parts: Vec<FieldArray> = Vec::with_capacity(kept.len() + 1);
            for block in std::iter::once(0).chain(kept.iter().map(|&c| full_cov.block_of(c))) {
                r.seek(SeekFrom::Start(field_start + block as u64 * cpb as u64 * elem))?;
                parts.push(read_column(&mut r, field.dtype, cpb)?);
            }
            columns.push((
                FieldSpec::new(&field.name, field.fill),
                concat_columns(field.dtype, parts),
            ));
            field_start += n_rows as u64 * elem;
        }

        let primary = header.fields[header.primary as usize].name.clone();
        info!(
            "partially read {} ({} of {} covered cells)",
            path.display(),
            kept.len(),
            full_cov.covered_cells().len()
        );
        let scoped = CoverageIndex::from_covered(header.nside_coverage, bit_shift, &kept);
        MultiFieldMap::from_parts(
            scoped.raw().clone(),
            columns,
            header.nside_coverage,
            header.nside_sparse,
            &primary,
        )
    }
}

fn read_column(r: &mut impl Read, dtype: Dtype, n: usize) -> Result<FieldArray> {
    Ok(match dtype {
        Dtype::F64 => {
            let mut v = Vec::with_capacity(n);
            for _ in 0..n {
                v.push(f64::read_le(r)?);
            }
            FieldArray::F64(Array1::from_vec(v))
        }
        Dtype::F32 => {
            let mut v = Vec::with_capacity(n);
            for _ in 0..n {
                v.push(f32::read_le(r)?);
            }
            FieldArray::F32(Array1::from_vec(v))
        }
        Dtype::I64 => {
            let mut v = Vec::with_capacity(n);
            for _ in 0..n {
                v.push(i64::read_le(r)?);
            }
            FieldArray::I64(Array1::from_vec(v))
        }
        Dtype::I32 => {
            let mut v = Vec::with_capacity(n);
            for _ in 0..n {
                v.push(i32::read_le(r)?);
            }
            FieldArray::I32(Array1::from_vec(v))
        }
    })
}

fn concat_columns(dtype: Dtype, parts: Vec<FieldArray>) -> FieldArray {
    match dtype {
        Dtype::F64 => {
            let mut v = Vec::new();
            for p in parts {
                if let FieldArray::F64(a) = p {
                    v.extend(a);
                }
            }
            FieldArray::F64(Array1::from_vec(v))
        }
        Dtype::F32 => {
            let mut v = Vec::new();
            for p in parts {
                if let FieldArray::F32(a) = p {
                    v.extend(a);
                }
            }
            FieldArray::F32(Array1::from_vec(v))
        }
        Dtype::I64 => {
            let mut v = Vec::new();
            for p in parts {
                if let FieldArray::I64(a) = p {
                    v.extend(a);
                }
            }
            FieldArray::I64(Array1::from_vec(v))
        }
        Dtype::I32 => {
            let mut v = Vec::new();
            for p in parts {
                if let FieldArray::I32(a) = p {
                    v.extend(a);
                }
            }
            FieldArray::I32(Array1::from_vec(v))
        }
    }
}
