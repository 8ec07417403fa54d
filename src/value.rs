//! Element types storable in a sparse map.
//!
//! Scalar maps pick one of these types statically (`SparseMap<T>`); a
//! multi-field map carries one tagged array per field. The traits here decide
//! three things per type: the sentinel convention, the type a degrade
//! promotes to, and how a single element is written to or read from a
//! little-endian record stream.

use std::io::{self, Read, Write};
use std::ops::{Add, BitAnd, BitOr, BitXor, Div, Mul, Sub};

/// Reserved "no data" value for floating-point maps, matching the HEALPix
/// convention for unseen pixels.
pub const UNSEEN: f64 = -1.6375e30;

/// Element type tag, also the on-disk encoding.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Dtype {
    F64,
    F32,
    I64,
    I32,
}

impl Dtype {
    /// Size of one element in bytes.
    pub fn size(self) -> usize {
        match self {
            Dtype::F64 | Dtype::I64 => 8,
            Dtype::F32 | Dtype::I32 => 4,
        }
    }

    pub(crate) fn tag(self) -> u8 {
        match self {
            Dtype::F64 => 0,
            Dtype::F32 => 1,
            Dtype::I64 => 2,
            Dtype::I32 => 3,
        }
    }

    pub(crate) fn from_tag(tag: u8) -> Option<Dtype> {
        match tag {
            0 => Some(Dtype::F64),
            1 => Some(Dtype::F32),
            2 => Some(Dtype::I64),
            3 => Some(Dtype::I32),
            _ => None,
        }
    }
}

/// A dynamically typed element, used for per-field fill values in
/// multi-field maps and in file headers.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ScalarValue {
    F64(f64),
    F32(f32),
    I64(i64),
    I32(i32),
}

impl ScalarValue {
    pub fn dtype(self) -> Dtype {
        match self {
            ScalarValue::F64(_) => Dtype::F64,
            ScalarValue::F32(_) => Dtype::F32,
            ScalarValue::I64(_) => Dtype::I64,
            ScalarValue::I32(_) => Dtype::I32,
        }
    }

    pub(crate) fn write_le(self, w: &mut impl Write) -> io::Result<()> {
        match self {
            ScalarValue::F64(v) => v.write_le(w),
            ScalarValue::F32(v) => v.write_le(w),
            ScalarValue::I64(v) => v.write_le(w),
            ScalarValue::I32(v) => v.write_le(w),
        }
    }

    pub(crate) fn read_le(dtype: Dtype, r: &mut impl Read) -> io::Result<ScalarValue> {
        Ok(match dtype {
            Dtype::F64 => ScalarValue::F64(f64::read_le(r)?),
            Dtype::F32 => ScalarValue::F32(f32::read_le(r)?),
            Dtype::I64 => ScalarValue::I64(i64::read_le(r)?),
            Dtype::I32 => ScalarValue::I32(i32::read_le(r)?),
        })
    }
}

impl std::fmt::Display for ScalarValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScalarValue::F64(v) => write!(f, "{v}"),
            ScalarValue::F32(v) => write!(f, "{v}"),
            ScalarValue::I64(v) => write!(f, "{v}"),
            ScalarValue::I32(v) => write!(f, "{v}"),
        }
    }
}

/// An element type storable in a sparse map.
pub trait MapValue:
    Copy
    + PartialEq
    + PartialOrd
    + std::fmt::Debug
    + Add<Output = Self>
    + Sub<Output = Self>
    + Mul<Output = Self>
    + Div<Output = Self>
    + 'static
{
    const DTYPE: Dtype;

    /// Element type a degrade promotes to.
    type Degraded: FloatValue;

    /// Built-in sentinel. Floating types reserve [`UNSEEN`]; integer types
    /// have none and require an explicit sentinel at construction.
    fn default_sentinel() -> Option<Self>;

    fn to_degraded(self) -> Self::Degraded;

    fn to_scalar(self) -> ScalarValue;

    /// Extract a value of this type from a dynamic scalar, or None on a
    /// type mismatch.
    fn from_scalar(v: ScalarValue) -> Option<Self>;

    fn write_le(self, w: &mut impl Write) -> io::Result<()>;

    fn read_le(r: &mut impl Read) -> io::Result<Self>;
}

/// Floating-point element types.
pub trait FloatValue: MapValue {
    /// The reserved sentinel, [`UNSEEN`] narrowed to this type.
    const SENTINEL: Self;

    fn from_f64(v: f64) -> Self;

    fn to_f64(self) -> f64;

    fn powf(self, exp: Self) -> Self;
}

/// Integer element types; unlock the bitwise operator family and masking.
pub trait IntValue:
    MapValue + BitAnd<Output = Self> + BitOr<Output = Self> + BitXor<Output = Self>
{
    const ZERO: Self;
}

impl MapValue for f64 {
    const DTYPE: Dtype = Dtype::F64;
    type Degraded = f64;

    fn default_sentinel() -> Option<Self> {
        Some(UNSEEN)
    }

    fn to_degraded(self) -> f64 {
        self
    }

    fn to_scalar(self) -> ScalarValue {
        ScalarValue::F64(self)
    }

    fn from_scalar(v: ScalarValue) -> Option<Self> {
        match v {
            ScalarValue::F64(x) => Some(x),
            _ => None,
        }
    }

    fn write_le(self, w: &mut impl Write) -> io::Result<()> {
        w.write_all(&self.to_le_bytes())
    }

    fn read_le(r: &mut impl Read) -> io::Result<Self> {
        let mut buf = [0u8; 8];
        r.read_exact(&mut buf)?;
        Ok(f64::from_le_bytes(buf))
    }
}

impl FloatValue for f64 {
    const SENTINEL: Self = UNSEEN;

    fn from_f64(v: f64) -> Self {
        v
    }

    fn to_f64(self) -> f64 {
        self
    }

    fn powf(self, exp: Self) -> Self {
        f64::powf(self, exp)
    }
}

impl MapValue for f32 {
    const DTYPE: Dtype = Dtype::F32;
    type Degraded = f32;

    fn default_sentinel() -> Option<Self> {
        Some(UNSEEN as f32)
    }

    fn to_degraded(self) -> f32 {
        self
    }

    fn to_scalar(self) -> ScalarValue {
        ScalarValue::F32(self)
    }

    fn from_scalar(v: ScalarValue) -> Option<Self> {
        match v {
            ScalarValue::F32(x) => Some(x),
            _ => None,
        }
    }

    fn write_le(self, w: &mut impl Write) -> io::Result<()> {
        w.write_all(&self.to_le_bytes())
    }

    fn read_le(r: &mut impl Read) -> io::Result<Self> {
        let mut buf = [0u8; 4];
        r.read_exact(&mut buf)?;
        Ok(f32::from_le_bytes(buf))
    }
}

impl FloatValue for f32 {
    const SENTINEL: Self = UNSEEN as f32;

    fn from_f64(v: f64) -> Self {
        v as f32
    }

    fn to_f64(self) -> f64 {
        self as f64
    }

    fn powf(self, exp: Self) -> Self {
        f32::powf(self, exp)
    }
}

impl MapValue for i64 {
    const DTYPE: Dtype = Dtype::I64;
    type Degraded = f64;

    fn default_sentinel() -> Option<Self> {
        None
    }

    fn to_degraded(self) -> f64 {
        self as f64
    }

    fn to_scalar(self) -> ScalarValue {
        ScalarValue::I64(self)
    }

    fn from_scalar(v: ScalarValue) -> Option<Self> {
        match v {
            ScalarValue::I64(x) => Some(x),
            _ => None,
        }
    }

    fn write_le(self, w: &mut impl Write) -> io::Result<()> {
        w.write_all(&self.to_le_bytes())
    }

    fn read_le(r: &mut impl Read) -> io::Result<Self> {
        let mut buf = [0u8; 8];
        r.read_exact(&mut buf)?;
        Ok(i64::from_le_bytes(buf))
    }
}

impl IntValue for i64 {
    const ZERO: Self = 0;
}

impl MapValue for i32 {
    const DTYPE: Dtype = Dtype::I32;
    type Degraded = f64;

    fn default_sentinel() -> Option<Self> {
        None
    }

    fn to_degraded(self) -> f64 {
        self as f64
    }

    fn to_scalar(self) -> ScalarValue {
        ScalarValue::I32(self)
    }

    fn from_scalar(v: ScalarValue) -> Option<Self> {
        match v {
            ScalarValue::I32(x) => Some(x),
            _ => None,
        }
    }

    fn write_le(self, w: &mut impl Write) -> io::Result<()> {
        w.write_all(&self.to_le_bytes())
    }

    fn read_le(r: &mut impl Read) -> io::Result<Self> {
        let mut buf = [0u8; 4];
        r.read_exact(&mut buf)?;
        Ok(i32::from_le_bytes(buf))
    }
}

impl IntValue for i32 {
    const ZERO: Self = 0;
}
