//! HEALPix (Hierarchical Equal Area isoLatitude Pixelisation) arithmetic.
//!
//! Provides the nested indexing scheme plus ring/nested reordering for a
//! given `nside` (number of pixels per base-pixel side, a power of two).
//! The angular projection follows the HEALPix paper; the ring/nested
//! conversions follow the standard xyf (face + in-face coordinates)
//! formulation used by the reference C++ implementation.
//!
//! The 12 base pixels are laid out as:
//! - 0–3: north polar cap
//! - 4–7: equatorial belt
//! - 8–11: south polar cap
//!
//! Within each base pixel, `x` increases northeast and `y` increases
//! northwest. Everything else in this crate addresses the sky exclusively
//! through this module.

use std::f64::consts::{FRAC_PI_2, FRAC_PI_4, PI, TAU};

use ndarray::{Array1, Zip};

/// Total number of pixels for a given nside: 12 * nside^2.
pub fn npix(nside: u32) -> u64 {
    12 * nside as u64 * nside as u64
}

/// Recover nside from a total pixel count, if the count is valid.
pub fn nside_from_npix(npix_total: u64) -> Option<u32> {
    if npix_total % 12 != 0 {
        return None;
    }
    let ns2 = npix_total / 12;
    let ns = ns2.isqrt();
    if ns * ns != ns2 || !ns.is_power_of_two() || ns > u32::MAX as u64 {
        return None;
    }
    Some(ns as u32)
}

/// Solid angle (steradians) of a single pixel.
pub fn pixel_area(nside: u32) -> f64 {
    4.0 * PI / npix(nside) as f64
}

/// Convert (lon, lat) in radians to a nested pixel index.
///
/// `lon` is right ascension (or longitude) in [0, 2π).
/// `lat` is declination (or latitude) in [-π/2, π/2].
pub fn ang_to_pix_nest(nside: u32, lon: f64, lat: f64) -> u64 {
    let (base, x, y) = lon_lat_to_base_xy(lon, lat, nside as f64);
    compose_nest(nside, base, x, y)
}

/// Convert a nested pixel index to the (lon, lat) of its center, in radians.
pub fn pix_to_ang_nest(nside: u32, pix: u64) -> (f64, f64) {
    let (base, x, y) = decompose_nest(nside, pix);
    base_xy_to_lon_lat(base, x as f64 + 0.5, y as f64 + 0.5, nside as f64)
}

/// Vectorized [`ang_to_pix_nest`].
pub fn ang_to_pix_nest_arr(nside: u32, lon: &Array1<f64>, lat: &Array1<f64>) -> Array1<u64> {
    Zip::from(lon)
        .and(lat)
        .map_collect(|&l, &b| ang_to_pix_nest(nside, l, b))
}

/// Convert a ring-ordered pixel index to nested ordering.
pub fn ring_to_nest(nside: u32, pix: u64) -> u64 {
    let (face, x, y) = ring_to_xyf(nside, pix);
    compose_nest(nside, face, x, y)
}

/// Convert a nested pixel index to ring ordering.
pub fn nest_to_ring(nside: u32, pix: u64) -> u64 {
    let (face, x, y) = decompose_nest(nside, pix);
    xyf_to_ring(nside, face, x, y)
}

/// Vectorized [`ring_to_nest`].
pub fn ring_to_nest_arr(nside: u32, pix: &Array1<u64>) -> Array1<u64> {
    pix.mapv(|p| ring_to_nest(nside, p))
}

// ---------------------------------------------------------------------------
// Internal: coordinate ↔ (base, x, y)
// ---------------------------------------------------------------------------

fn is_north(base: u64) -> bool {
    base <= 3
}

fn is_south(base: u64) -> bool {
    base >= 8
}

/// Convert (lon, lat) to (base, x, y) in the XY scheme with continuous coords.
fn lon_lat_to_base_xy(lon: f64, lat: f64, ns: f64) -> (u64, u64, u64) {
    let z = lat.sin();
    let mut phi = lon;
    if phi < 0.0 {
        phi += TAU;
    }
    if phi >= TAU {
        phi -= TAU;
    }

    let phi_t = phi % FRAC_PI_2;

    // Determine quadrant column
    let column = ((phi / FRAC_PI_2).floor() as i64).rem_euclid(4) as u64;

    if z.abs() >= 2.0 / 3.0 {
        // Polar cap
        let north = z >= 0.0;
        let zfactor = if north { 1.0 } else { -1.0 };

        // Solve eqns 19/20 from the HEALPix paper for kx = Ns - xx, ky = Ns - yy
        let root_x = (1.0 - z * zfactor) * 3.0 * (ns * (2.0 * phi_t - PI) / PI).powi(2);
        let kx = if root_x <= 0.0 { 0.0 } else { root_x.sqrt() };

        let root_y = (1.0 - z * zfactor) * 3.0 * (ns * 2.0 * phi_t / PI).powi(2);
        let ky = if root_y <= 0.0 { 0.0 } else { root_y.sqrt() };

        let (xx, yy) = if north { (ns - kx, ns - ky) } else { (ky, kx) };

        let x = (xx.floor() as u64).min(ns as u64 - 1);
        let y = (yy.floor() as u64).min(ns as u64 - 1);

        let base = if north { column } else { 8 + column };
        (base, x, y)
    } else {
        // Equatorial region
        let zunits = (z + 2.0 / 3.0) / (4.0 / 3.0);
        let phiunits = phi_t / FRAC_PI_2;

        let u1 = zunits + phiunits;
        let u2 = zunits - phiunits + 1.0;

        let mut xx = u1 * ns;
        let mut yy = u2 * ns;

        let base = if xx >= ns {
            xx -= ns;
            if yy >= ns {
                yy -= ns;
                column // north polar
            } else {
                ((column + 1) % 4) + 4 // right equatorial
            }
        } else if yy >= ns {
            yy -= ns;
            column + 4 // left equatorial
        } else {
            8 + column // south polar
        };

        let x = (xx.floor() as u64).min(ns as u64 - 1);
        let y = (yy.floor() as u64).min(ns as u64 - 1);

        (base, x, y)
    }
}

/// Convert (base, x, y) continuous coords back to (lon, lat).
fn base_xy_to_lon_lat(base: u64, x: f64, y: f64, ns: f64) -> (f64, f64) {
    let x_norm = x / ns;
    let y_norm = y / ns;

    // Check if this pixel is in the polar or equatorial regime
    let is_polar_region = if is_north(base) {
        (x_norm + y_norm) > 1.0
    } else if is_south(base) {
        (x_norm + y_norm) < 1.0
    } else {
        false
    };

    if !is_polar_region {
        // Equatorial computation
        let (phi_off, z_off, chp) = if base <= 3 {
            (1.0, 0.0, base)
        } else if base <= 7 {
            (0.0, -1.0, base - 4)
        } else {
            (1.0, -2.0, base - 8)
        };

        let z = (2.0 / 3.0) * (x_norm + y_norm + z_off);
        let phi = FRAC_PI_4 * (x_norm - y_norm + phi_off + 2.0 * chp as f64);

        let lat = z.clamp(-1.0, 1.0).asin();
        let mut lon = phi;
        if lon < 0.0 {
            lon += TAU;
        }
        if lon >= TAU {
            lon -= TAU;
        }
        (lon, lat)
    } else {
        // Polar computation, inverse of eqns 19/20 from the HEALPix paper
        let north = is_north(base);
        let zfactor = if north { 1.0 } else { -1.0 };

        // For south polar, swap and flip to work in north-polar convention
        let (px, py) = if north { (x, y) } else { (ns - y, ns - x) };

        let kx = ns - px;
        let ky = ns - py;

        // phi_t = pi * (Ns - y) / (2 * ((Ns - x) + (Ns - y)))
        let phi_t = if kx + ky == 0.0 {
            0.0
        } else {
            PI * ky / (2.0 * (kx + ky))
        };

        // Recover z, using two branches to avoid division-by-zero
        let z = if phi_t < FRAC_PI_4 {
            let denom = (2.0 * phi_t - PI) * ns;
            if denom.abs() < 1e-15 {
                zfactor
            } else {
                let val = PI * kx / denom;
                (1.0 - val * val / 3.0) * zfactor
            }
        } else {
            let denom = 2.0 * phi_t * ns;
            if denom.abs() < 1e-15 {
                zfactor
            } else {
                let val = PI * ky / denom;
                (1.0 - val * val / 3.0) * zfactor
            }
        };

        let base_col = if is_south(base) { base - 8 } else { base };
        let phi = FRAC_PI_2 * base_col as f64 + phi_t;

        let lat = z.clamp(-1.0, 1.0).asin();
        let mut lon = phi;
        if lon < 0.0 {
            lon += TAU;
        }
        if lon >= TAU {
            lon -= TAU;
        }
        (lon, lat)
    }
}

// ---------------------------------------------------------------------------
// Internal: XY ↔ nested bit-interleaving
// ---------------------------------------------------------------------------

/// Compose a nested index from (base, x, y).
fn compose_nest(nside: u32, base: u64, x: u64, y: u64) -> u64 {
    let ns2 = nside as u64 * nside as u64;
    base * ns2 + xy_to_nest_sub(x, y)
}

/// Decompose a nested index into (base, x, y).
fn decompose_nest(nside: u32, pix: u64) -> (u64, u64, u64) {
    let ns2 = nside as u64 * nside as u64;
    let base = pix / ns2;
    let (x, y) = nest_sub_to_xy(pix % ns2);
    (base, x, y)
}

/// Bit-interleave (x, y) → sub-index. x provides even bits, y provides odd bits.
fn xy_to_nest_sub(x: u64, y: u64) -> u64 {
    let mut result = 0u64;
    let mut xx = x;
    let mut yy = y;
    let mut bit = 0;
    while xx > 0 || yy > 0 {
        result |= (xx & 1) << bit;
        bit += 1;
        result |= (yy & 1) << bit;
        bit += 1;
        xx >>= 1;
        yy >>= 1;
    }
    result
}

/// De-interleave sub-index → (x, y).
fn nest_sub_to_xy(sub: u64) -> (u64, u64) {
    let mut x = 0u64;
    let mut y = 0u64;
    let mut s = sub;
    let mut bit = 0;
    while s > 0 {
        x |= (s & 1) << bit;
        s >>= 1;
        y |= (s & 1) << bit;
        s >>= 1;
        bit += 1;
    }
    (x, y)
}

// ---------------------------------------------------------------------------
// Internal: ring ↔ (face, x, y)
// ---------------------------------------------------------------------------

/// Ring number (from the north pole, 1-based) of the southernmost corner of
/// each base pixel, in units of nside.
const JRLL: [i64; 12] = [2, 2, 2, 2, 3, 3, 3, 3, 4, 4, 4, 4];
/// Longitude offset of each base pixel, in units of π/4.
const JPLL: [i64; 12] = [1, 3, 5, 7, 0, 2, 4, 6, 1, 3, 5, 7];

/// Decompose a ring-ordered index into (face, x, y).
fn ring_to_xyf(nside: u32, pix: u64) -> (u64, u64, u64) {
    let ns = nside as i64;
    let pix = pix as i64;
    let npix_total = npix(nside) as i64;
    let ncap = 2 * ns * (ns - 1);

    let (mut iring, iphi, kshift, nr, face);
    if pix < ncap {
        // North polar cap
        iring = (1 + ((1 + 2 * pix) as u64).isqrt() as i64) >> 1;
        iphi = pix + 1 - 2 * iring * (iring - 1);
        kshift = 0;
        nr = iring;
        face = (iphi - 1) / nr;
    } else if pix < npix_total - ncap {
        // Equatorial belt
        let ip = pix - ncap;
        iring = ip / (4 * ns) + ns;
        iphi = ip % (4 * ns) + 1;
        kshift = (iring + ns) & 1;
        nr = ns;
        let ire = iring - ns + 1;
        let irm = 2 * ns + 2 - ire;
        let ifm = (iphi - ire / 2 + ns - 1) / ns;
        let ifp = (iphi - irm / 2 + ns - 1) / ns;
        face = if ifp == ifm {
            ifp | 4
        } else if ifp < ifm {
            ifp
        } else {
            ifm + 8
        };
    } else {
        // South polar cap
        let ip = npix_total - pix;
        iring = (1 + ((2 * ip - 1) as u64).isqrt() as i64) >> 1;
        iphi = 4 * iring + 1 - (ip - 2 * iring * (iring - 1));
        kshift = 0;
        nr = iring;
        iring = 4 * ns - iring;
        face = 8 + (iphi - 1) / nr;
    }

    let irt = iring - JRLL[face as usize] * ns + 1;
    let mut ipt = 2 * iphi - JPLL[face as usize] * nr - kshift - 1;
    if ipt >= 2 * ns {
        ipt -= 8 * ns;
    }

    let x = (ipt - irt) >> 1;
    let y = (-ipt - irt) >> 1;
    (face as u64, x as u64, y as u64)
}

/// Compose a ring-ordered index from (face, x, y).
fn xyf_to_ring(nside: u32, face: u64, x: u64, y: u64) -> u64 {
    let ns = nside as i64;
    let npix_total = npix(nside) as i64;
    let ncap = 2 * ns * (ns - 1);
    let (x, y) = (x as i64, y as i64);

    // Ring number counted from the north pole, 1-based.
    let jr = JRLL[face as usize] * ns - x - y - 1;

    let (nr, n_before, kshift);
    if jr < ns {
        // North polar cap
        nr = jr;
        n_before = 2 * nr * (nr - 1);
        kshift = 0;
    } else if jr > 3 * ns {
        // South polar cap
        nr = 4 * ns - jr;
        n_before = npix_total - 2 * nr * (nr + 1);
        kshift = 0;
    } else {
        // Equatorial belt
        nr = ns;
        n_before = ncap + (jr - ns) * 4 * ns;
        kshift = (jr - ns) & 1;
    }

    let mut jp = (JPLL[face as usize] * nr + x - y + 1 + kshift) / 2;
    if jp > 4 * nr {
        jp -= 4 * nr;
    }
    if jp < 1 {
        jp += 4 * nr;
    }

    (n_before + jp - 1) as u64
}
