//! Small geographic helpers shared by the pipeline and the query surface.

use crate::config::Config;

const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Great-circle distance in meters.
pub fn haversine_m(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let phi1 = lat1.to_radians();
    let phi2 = lat2.to_radians();
    let dphi = (lat2 - lat1).to_radians();
    let dlambda = (lon2 - lon1).to_radians();
    let a = (dphi / 2.0).sin().powi(2) + phi1.cos() * phi2.cos() * (dlambda / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * a.sqrt().atan2((1.0 - a).sqrt())
}

/// The (0, 0) sentinel check used everywhere a position is accepted.
pub fn coords_are_zero(lat: f64, lon: f64) -> bool {
    lat.abs() < 1e-6 && lon.abs() < 1e-6
}

/// True when the point lies inside the configured map radius. A radius of
/// 0 disables filtering.
pub fn within_map_radius(cfg: &Config, lat: f64, lon: f64) -> bool {
    if cfg.map_radius_km <= 0.0 {
        return true;
    }
    if !lat.is_finite() || !lon.is_finite() {
        return false;
    }
    haversine_m(cfg.map_start_lat, cfg.map_start_lon, lat, lon) <= cfg.map_radius_km * 1000.0
}

/// Round to six decimals, half away from zero. This is the history-edge
/// key contract; the journal files encode it.
pub fn round6(v: f64) -> f64 {
    (v * 1e6).round() / 1e6
}

/// Current Unix time in seconds.
pub fn now() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}
