//! Distance, azimuth and ellipsoid math for hypocenter geometry.
//!
//! Horizontal distances follow a great circle on the WGS84 ellipsoid
//! (geocentric latitude correction), vertical distances are plain depth
//! differences, and the two are combined Pythagorean-style. This flat-Earth
//! combination is only valid over short ranges; all callers in this crate
//! stay well below a few hundred kilometers.

use crate::constants::{deg2km, Degree, Kilometer, WGS84_FLATTENING};

/// Result of the inverse geodesic: angular distance plus both azimuths,
/// all in degrees.
#[derive(Debug, Clone, Copy)]
pub struct DistAzi {
    /// Great-circle distance in degrees.
    pub dist: Degree,
    /// Azimuth from the first point towards the second.
    pub azimuth: Degree,
    /// Azimuth from the second point back towards the first.
    pub back_azimuth: Degree,
}

fn geocentric(lon: Degree, lat: Degree) -> (f64, f64, f64) {
    let blbda = lon.to_radians();
    let bphi = lat.to_radians();
    let ep = 1.0 - WGS84_FLATTENING;
    let ug = ep * ep * bphi.tan();
    let vg = 1.0 / (1.0 + ug * ug).sqrt();
    (vg * blbda.cos(), vg * blbda.sin(), ug * vg)
}

fn azm(x: f64, y: f64) -> Degree {
    if x == 0.0 {
        if y > 0.0 {
            return 90.0;
        }
        if y < 0.0 {
            return 270.0;
        }
        return 0.0;
    }

    let th = (y / x).abs().atan().to_degrees();
    if x > 0.0 {
        if y < 0.0 {
            360.0 - th
        } else {
            th
        }
    } else if y >= 0.0 {
        180.0 - th
    } else {
        180.0 + th
    }
}

/// Inverse geodesic between an epicentre and a second point, both given as
/// (lat, lon) in degrees.
pub fn delazi(elat: Degree, elon: Degree, slat: Degree, slon: Degree) -> DistAzi {
    // coincident points
    if (slat - elat).abs() + (slon - elon).abs() < 1.0e-5 {
        return DistAzi {
            dist: 0.0,
            azimuth: 0.0,
            back_azimuth: 0.0,
        };
    }

    let (a_s, b_s, c_s) = geocentric(slon, slat);
    let d_s = (1.0 - c_s * c_s).sqrt();
    let (a_e, b_e, c_e) = geocentric(elon, elat);
    let d_e = (1.0 - c_e * c_e).sqrt();

    let bls = slon.to_radians();
    let codel = a_e * a_s + b_e * b_s + c_e * c_s;
    let sindt = (1.0 - codel * codel).sqrt();

    let bgdel = if codel == 0.0 {
        std::f64::consts::FRAC_PI_2
    } else {
        let mut bgdel = (sindt / codel).abs().atan();
        if codel <= 0.0 {
            bgdel = std::f64::consts::PI - bgdel;
        }
        bgdel
    };

    let xi = b_s * c_e - b_e * c_s;
    let xj = a_s * c_e - a_e * c_s;
    let xk = a_s * b_e - a_e * b_s;
    let cosz = (xi * bls.sin() + xj * bls.cos()) / sindt;
    let sinz = xk / (d_s * sindt);
    let back_azimuth = azm(cosz, sinz);

    let ble = elon.to_radians();
    let cosz = -(xi * ble.sin() + xj * ble.cos()) / sindt;
    let sinz = -xk / (d_e * sindt);
    let azimuth = azm(cosz, sinz);

    DistAzi {
        dist: bgdel.to_degrees(),
        azimuth,
        back_azimuth,
    }
}

/// Forward geodesic on a sphere: the point reached from (lat0, lon0) after
/// travelling `dist` degrees along `azi` degrees. Returns (lat, lon).
pub fn coordinates_at(dist: Degree, azi: Degree, lat0: Degree, lon0: Degree) -> (Degree, Degree) {
    let mut d = dist.to_radians();
    let mut az = azi.to_radians();
    let lat0 = lat0.to_radians();
    let lon0 = lon0.to_radians();

    if d > std::f64::consts::PI {
        d = std::f64::consts::TAU - d;
        az += std::f64::consts::PI;
    }

    let b = std::f64::consts::FRAC_PI_2 - lat0;
    let (cosb, sinb) = (b.cos(), b.sin());
    let (cosd, sind) = (d.cos(), d.sin());
    let cosa = cosb * cosd + sinb * sind * az.cos();
    let a = cosa.acos();
    let sina = a.sin();
    let mut gam = ((cosd - cosa * cosb) / (sina * sinb)).clamp(-1.0, 1.0).acos();
    if az.sin() < 0.0 {
        gam = -gam;
    }

    let lat = std::f64::consts::FRAC_PI_2 - a;
    let lon = (lon0 + gam + std::f64::consts::PI).rem_euclid(std::f64::consts::TAU)
        - std::f64::consts::PI;
    (lat.to_degrees(), lon.to_degrees())
}

/// 3-D distance in km between two hypocenters, with optional azimuths.
///
/// Horizontal part from the great circle, vertical part |Δdepth|; valid for
/// short distances where the Earth curvature can be taken flat.
pub fn compute_distance_azi(
    lat1: Degree,
    lon1: Degree,
    depth1: Kilometer,
    lat2: Degree,
    lon2: Degree,
    depth2: Kilometer,
) -> (Kilometer, DistAzi) {
    let da = delazi(lat1, lon1, lat2, lon2);
    let hdist = deg2km(da.dist);
    let vdist = (depth1 - depth2).abs();
    ((hdist * hdist + vdist * vdist).sqrt(), da)
}

/// 3-D distance in km between two hypocenters.
pub fn compute_distance(
    lat1: Degree,
    lon1: Degree,
    depth1: Kilometer,
    lat2: Degree,
    lon2: Degree,
    depth2: Kilometer,
) -> Kilometer {
    compute_distance_azi(lat1, lon1, depth1, lat2, lon2, depth2).0
}

/// Axis-aligned prolate ellipsoid used to carve space around a reference
/// hypocenter:
///
/// ```text
///      (x-xo)^2/axis_a + (y-yo)^2/axis_b + (z-zo)^2/axis_c <= 1
/// ```
#[derive(Debug, Clone, Copy)]
pub struct Ellipsoid {
    pub axis_a: Kilometer,
    pub axis_b: Kilometer,
    pub axis_c: Kilometer,
    pub lat: Degree,
    pub lon: Degree,
    pub depth: Kilometer,
    /// Degrees; when 0, axis_a runs East-West and axis_b North-South.
    pub orientation: Degree,
}

impl Ellipsoid {
    pub fn is_inside(&self, lat: Degree, lon: Degree, depth: Kilometer) -> bool {
        let da = delazi(lat, lon, self.lat, self.lon);
        let distance = deg2km(da.dist);
        let az = (da.azimuth + self.orientation).to_radians();

        let dist_x = distance * az.cos();
        let dist_y = distance * az.sin();
        let dist_z = (depth - self.depth).abs();

        let one = dist_x * dist_x / self.axis_a
            + dist_y * dist_y / self.axis_b
            + dist_z * dist_z / self.axis_c;
        one <= 1.0
    }
}

/// Waldhauser-style selection ellipsoid: vertically elongated (c = 2a) and
/// partitioned into 8 octants around its origin.
///
/// Octants 1-4 lie above the origin depth, 5-8 below; within each stratum
/// they run clockwise from the NE corner:
///
/// ```text
///        lat
///         ^
///    2/6  |  1/5
/// --------+--------> lon
///    3/7  |  4/8
/// ```
#[derive(Debug, Clone, Copy)]
pub struct ShellEllipsoid {
    ellipsoid: Ellipsoid,
}

impl ShellEllipsoid {
    /// `axis_len` is the vertical axis length; the horizontal semi axes are
    /// half of it. A zero length yields the degenerate innermost ellipsoid.
    pub fn new(axis_len: Kilometer, lat: Degree, lon: Degree, depth: Kilometer) -> Self {
        let axis_a = axis_len / 2.0;
        ShellEllipsoid {
            ellipsoid: Ellipsoid {
                axis_a,
                axis_b: axis_a,
                axis_c: axis_len,
                lat,
                lon,
                depth,
                orientation: 0.0,
            },
        }
    }

    /// Pure coordinate-sign test around the origin; `octant` is 1-8.
    pub fn is_in_octant(&self, lat: Degree, lon: Degree, depth: Kilometer, octant: u8) -> bool {
        debug_assert!((1..=8).contains(&octant));

        let e = &self.ellipsoid;
        if depth < e.depth && octant <= 4 {
            return false;
        }
        if depth > e.depth && octant >= 5 {
            return false;
        }
        if lon < e.lon && matches!(octant, 1 | 4 | 5 | 8) {
            return false;
        }
        if lon > e.lon && matches!(octant, 2 | 3 | 6 | 7) {
            return false;
        }
        if lat < e.lat && matches!(octant, 1 | 2 | 5 | 6) {
            return false;
        }
        if lat > e.lat && matches!(octant, 3 | 4 | 7 | 8) {
            return false;
        }
        true
    }

    pub fn is_inside(&self, lat: Degree, lon: Degree, depth: Kilometer, octant: u8) -> bool {
        self.is_in_octant(lat, lon, depth, octant) && self.ellipsoid.is_inside(lat, lon, depth)
    }

    pub fn is_outside(&self, lat: Degree, lon: Degree, depth: Kilometer, octant: u8) -> bool {
        self.is_in_octant(lat, lon, depth, octant) && !self.ellipsoid.is_inside(lat, lon, depth)
    }
}
