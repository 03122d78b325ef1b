//! Great-circle helpers shared by the feed decoders.
//!
//! Positions are plain decimal degrees (WGS84 latitude/longitude). The
//! reference point is always the badge's own position and the target is the
//! tracked object, so a bearing of 90° means "the aircraft is due east of us".

use std::f64::consts::{FRAC_PI_4, PI};

/// Mean earth radius used by the haversine formula
pub const EARTH_RADIUS_KM: f64 = 6371.0;

/// Conversion from kilometres to nautical miles
pub const KM_TO_NM: f64 = 0.539957;

// Mercator latitude is unbounded at the poles
const MAX_MERCATOR_LAT_DEG: f64 = 89.999_999;

/// A latitude/longitude pair in decimal degrees
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct GeoPoint {
    pub latitude: f32,
    pub longitude: f32,
}

impl GeoPoint {
    pub fn new(latitude: f32, longitude: f32) -> Self {
        Self {
            latitude,
            longitude,
        }
    }
}

/// Haversine distance between the reference point and a target, in nautical miles
pub fn haversine_distance_nm(ref_lat: f64, ref_lon: f64, lat: f64, lon: f64) -> f64 {
    let lat1_rad = ref_lat.to_radians();
    let lat2_rad = lat.to_radians();
    let u = ((lat2_rad - lat1_rad) / 2.0).sin();
    let v = ((lon - ref_lon).to_radians() / 2.0).sin();

    let a = u * u + lat1_rad.cos() * lat2_rad.cos() * v * v;

    // Rounding can push `a` a hair above 1 for antipodal points; NaN passes through
    2.0 * EARTH_RADIUS_KM * a.sqrt().clamp(0.0, 1.0).asin() * KM_TO_NM
}

/// Rhumb-line (Mercator) bearing from the reference point to a target
///
/// Returns degrees clockwise from true north in `[0, 360)`. The longitude
/// difference is folded into `(-π, π]` first so that targets across the
/// antimeridian get the short-way bearing.
pub fn great_circle_bearing_deg(ref_lat: f64, ref_lon: f64, lat: f64, lon: f64) -> f32 {
    let start_lat = ref_lat
        .clamp(-MAX_MERCATOR_LAT_DEG, MAX_MERCATOR_LAT_DEG)
        .to_radians();
    let end_lat = lat
        .clamp(-MAX_MERCATOR_LAT_DEG, MAX_MERCATOR_LAT_DEG)
        .to_radians();

    let d_lon = normalize_delta_lon((lon - ref_lon).to_radians());
    let d_phi = ((end_lat / 2.0 + FRAC_PI_4).tan() / (start_lat / 2.0 + FRAC_PI_4).tan()).ln();

    let bearing = (d_lon.atan2(d_phi).to_degrees() + 360.0) % 360.0;

    // f32 rounding of values just below 360 lands exactly on 360
    let bearing = bearing as f32;
    if bearing >= 360.0 { 0.0 } else { bearing }
}

/// Fold a longitude difference in radians into `(-π, π]`
fn normalize_delta_lon(d_lon: f64) -> f64 {
    let mut d = d_lon % (2.0 * PI);
    if d > PI {
        d -= 2.0 * PI;
    } else if d <= -PI {
        d += 2.0 * PI;
    }
    d
}
