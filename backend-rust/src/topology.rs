//! Topology resolution: maps the two-hex node hashes carried by the wire
//! format onto known devices and turns path-hash sequences plus
//! origin/receiver hints into concrete polylines.

use serde_json::Value;

use mesh_types::{node_hash_from_device_id, normalize_node_hash};

use crate::config::Config;
use crate::geo::coords_are_zero;
use crate::state::AppState;

/// A resolved polyline with the hashes that produced it and the device id
/// aligned to each point (interior hops may stay unresolved).
#[derive(Debug, Clone, Default)]
pub struct ResolvedPath {
    pub points: Vec<[f64; 2]>,
    pub hashes: Vec<String>,
    pub point_ids: Vec<Option<String>>,
}

/// Rebuild the node-hash prefix maps from the current device set. A prefix
/// maps to a device only while exactly one candidate carries it; otherwise
/// it is marked collided and resolution falls back to last-seen proximity.
///
/// Candidate lists are sorted by device id so collision tie-breaking is
/// deterministic.
pub fn rebuild_node_hash_map(st: &mut AppState) {
    st.hash_candidates.clear();
    st.hash_collisions.clear();
    st.hash_to_device.clear();

    for device_id in st.devices.keys() {
        let Some(hash) = node_hash_from_device_id(device_id) else {
            continue;
        };
        st.hash_candidates.entry(hash).or_default().push(device_id.clone());
    }
    for (hash, ids) in st.hash_candidates.iter_mut() {
        ids.sort();
        if ids.len() == 1 {
            st.hash_to_device.insert(hash.clone(), ids[0].clone());
        } else {
            st.hash_collisions.insert(hash.clone());
        }
    }
}

/// Pick the candidate for a collided hash whose last-seen timestamp is
/// closest to the packet timestamp, among candidates with usable
/// coordinates. Ties keep the earlier (lexicographically smaller) id.
pub fn choose_device_for_hash(st: &AppState, node_hash: &str, ts: f64) -> Option<String> {
    let candidates = st.hash_candidates.get(node_hash)?;
    let mut best: Option<(f64, &String)> = None;
    for device_id in candidates {
        let Some(device) = st.devices.get(device_id) else {
            continue;
        };
        if coords_are_zero(device.lat, device.lon) {
            continue;
        }
        let last_seen = st.seen_devices.get(device_id).copied().unwrap_or(device.ts);
        let delta = (last_seen - ts).abs();
        if best.map_or(true, |(d, _)| delta < d) {
            best = Some((delta, device_id));
        }
    }
    best.map(|(_, id)| id.clone())
}

fn resolve_hash(st: &AppState, node_hash: &str, ts: f64) -> Option<String> {
    if let Some(id) = st.hash_to_device.get(node_hash) {
        return Some(id.clone());
    }
    if st.hash_collisions.contains(node_hash) {
        return choose_device_for_hash(st, node_hash, ts);
    }
    None
}

/// Resolve a path-hash list into a polyline. The list is oriented so the
/// origin comes first (the wire format is ambiguous about direction); the
/// origin and receiver devices are clamped to the ends when known.
pub fn route_points_from_hashes(
    st: &AppState,
    cfg: &Config,
    path_hashes: &[Value],
    origin_id: Option<&str>,
    receiver_id: Option<&str>,
    ts: f64,
) -> Option<ResolvedPath> {
    let mut normalized: Vec<String> = path_hashes.iter().filter_map(normalize_node_hash).collect();
    if cfg.route_path_max_len > 0 && normalized.len() > cfg.route_path_max_len {
        return None;
    }

    let receiver_hash = receiver_id.and_then(node_hash_from_device_id);
    let origin_hash = origin_id.and_then(node_hash_from_device_id);

    if let Some(rh) = receiver_hash.as_deref().filter(|h| normalized.iter().any(|n| n == h)) {
        if normalized.first().map(String::as_str) == Some(rh)
            && normalized.last().map(String::as_str) != Some(rh)
        {
            normalized.reverse();
        }
    } else if let Some(oh) = origin_hash.as_deref().filter(|h| normalized.iter().any(|n| n == h)) {
        if normalized.last().map(String::as_str) == Some(oh)
            && normalized.first().map(String::as_str) != Some(oh)
        {
            normalized.reverse();
        }
    }

    let mut resolved = ResolvedPath::default();
    for key in &normalized {
        let Some(device_id) = resolve_hash(st, key, ts) else {
            continue;
        };
        let Some(device) = st.devices.get(&device_id) else {
            continue;
        };
        if coords_are_zero(device.lat, device.lon) {
            continue;
        }
        let point = [device.lat, device.lon];
        if resolved.points.last() == Some(&point) {
            continue;
        }
        resolved.points.push(point);
        resolved.hashes.push(key.clone());
        resolved.point_ids.push(Some(device_id));
    }

    if let Some(origin_id) = origin_id {
        if let Some(origin) = st.devices.get(origin_id) {
            if !coords_are_zero(origin.lat, origin.lon) {
                let point = [origin.lat, origin.lon];
                if resolved.points.first() != Some(&point) {
                    resolved.points.insert(0, point);
                    resolved.point_ids.insert(0, Some(origin_id.to_string()));
                } else if let Some(first) = resolved.point_ids.first_mut() {
                    *first = Some(origin_id.to_string());
                }
            }
        }
    }

    if let Some(receiver_id) = receiver_id {
        if let Some(receiver) = st.devices.get(receiver_id) {
            if !coords_are_zero(receiver.lat, receiver.lon) {
                let point = [receiver.lat, receiver.lon];
                if !resolved.points.is_empty() && resolved.points.last() != Some(&point) {
                    resolved.points.push(point);
                    resolved.point_ids.push(Some(receiver_id.to_string()));
                } else if let Some(last) = resolved.point_ids.last_mut() {
                    *last = Some(receiver_id.to_string());
                }
            }
        }
    }

    if resolved.points.len() < 2 {
        return None;
    }
    Some(resolved)
}

/// Two-point fallback when no path evidence exists: origin and receiver must
/// both resolve to distinct devices with usable, distinct coordinates.
pub fn route_points_from_device_ids(
    st: &AppState,
    origin_id: Option<&str>,
    receiver_id: Option<&str>,
) -> Option<Vec<[f64; 2]>> {
    let origin_id = origin_id?;
    let receiver_id = receiver_id?;
    if origin_id == receiver_id {
        return None;
    }
    let origin = st.devices.get(origin_id)?;
    let receiver = st.devices.get(receiver_id)?;
    if coords_are_zero(origin.lat, origin.lon) || coords_are_zero(receiver.lat, receiver.lon) {
        return None;
    }
    let points = vec![[origin.lat, origin.lon], [receiver.lat, receiver.lon]];
    if points[0] == points[1] {
        return None;
    }
    Some(points)
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesh_types::DeviceState;
    use serde_json::json;

    fn add_device(st: &mut AppState, id: &str, lat: f64, lon: f64, ts: f64) {
        st.devices.insert(
            id.to_string(),
            DeviceState {
                device_id: id.to_string(),
                lat,
                lon,
                ts,
                heading: None,
                speed: None,
                rssi: None,
                snr: None,
                name: None,
                role: None,
                raw_topic: None,
            },
        );
    }

    fn base_state() -> (AppState, Config) {
        let mut st = AppState::new();
        add_device(&mut st, "AB100", 10.0, 10.0, 100.0);
        add_device(&mut st, "CD200", 11.0, 11.0, 100.0);
        add_device(&mut st, "EF300", 12.0, 12.0, 100.0);
        add_device(&mut st, "GH400", 13.0, 13.0, 100.0);
        rebuild_node_hash_map(&mut st);
        (st, Config::from_env())
    }

    #[test]
    fn rebuild_marks_collisions() {
        let (mut st, _) = base_state();
        add_device(&mut st, "AB999", 14.0, 14.0, 100.0);
        rebuild_node_hash_map(&mut st);
        assert!(st.hash_collisions.contains("AB"));
        assert!(!st.hash_to_device.contains_key("AB"));
        assert_eq!(st.hash_to_device["CD"], "CD200");
        assert_eq!(st.hash_candidates["AB"], vec!["AB100", "AB999"]);
    }

    #[test]
    fn full_path_resolution() {
        let (st, cfg) = base_state();
        let hashes = vec![json!("CD"), json!("EF")];
        let resolved =
            route_points_from_hashes(&st, &cfg, &hashes, Some("AB100"), Some("GH400"), 100.0)
                .unwrap();
        assert_eq!(
            resolved.points,
            vec![[10.0, 10.0], [11.0, 11.0], [12.0, 12.0], [13.0, 13.0]]
        );
        assert_eq!(resolved.hashes, vec!["CD", "EF"]);
        assert_eq!(
            resolved.point_ids,
            vec![
                Some("AB100".to_string()),
                Some("CD200".to_string()),
                Some("EF300".to_string()),
                Some("GH400".to_string())
            ]
        );
    }

    #[test]
    fn reversed_path_is_reoriented() {
        let (st, cfg) = base_state();
        // Receiver hash leads the list: wire order is receiver-first.
        let hashes = vec![json!("GH"), json!("EF"), json!("CD")];
        let resolved =
            route_points_from_hashes(&st, &cfg, &hashes, Some("AB100"), Some("GH400"), 100.0)
                .unwrap();
        assert_eq!(resolved.hashes, vec!["CD", "EF", "GH"]);
        assert_eq!(resolved.points.first(), Some(&[10.0, 10.0]));
        assert_eq!(resolved.points.last(), Some(&[13.0, 13.0]));
    }

    #[test]
    fn over_long_path_rejected() {
        let (st, mut cfg) = base_state();
        cfg.route_path_max_len = 1;
        let hashes = vec![json!("CD"), json!("EF")];
        assert!(
            route_points_from_hashes(&st, &cfg, &hashes, Some("AB100"), Some("GH400"), 100.0)
                .is_none()
        );
    }

    #[test]
    fn single_resolvable_hash_gives_three_points() {
        let (st, cfg) = base_state();
        let hashes = vec![json!("CD"), json!("ZZ")];
        let resolved =
            route_points_from_hashes(&st, &cfg, &hashes, Some("AB100"), Some("GH400"), 100.0)
                .unwrap();
        assert_eq!(resolved.points.len(), 3);
        assert_eq!(resolved.hashes, vec!["CD"]);
    }

    #[test]
    fn unresolvable_everything_is_none() {
        let (st, cfg) = base_state();
        let hashes = vec![json!("ZZ")];
        assert!(route_points_from_hashes(&st, &cfg, &hashes, None, None, 100.0).is_none());
    }

    #[test]
    fn collision_picks_closest_last_seen() {
        let (mut st, cfg) = base_state();
        add_device(&mut st, "AB999", 14.0, 14.0, 100.0);
        rebuild_node_hash_map(&mut st);
        st.seen_devices.insert("AB100".into(), 100.0);
        st.seen_devices.insert("AB999".into(), 500.0);

        assert_eq!(choose_device_for_hash(&st, "AB", 490.0), Some("AB999".into()));
        assert_eq!(choose_device_for_hash(&st, "AB", 110.0), Some("AB100".into()));

        // Equal deltas: the lexicographically smaller id wins.
        assert_eq!(choose_device_for_hash(&st, "AB", 300.0), Some("AB100".into()));

        let hashes = vec![json!("AB")];
        let resolved =
            route_points_from_hashes(&st, &cfg, &hashes, None, Some("GH400"), 490.0).unwrap();
        assert_eq!(resolved.point_ids[0], Some("AB999".to_string()));
    }

    #[test]
    fn zero_coord_candidates_skipped() {
        let (mut st, _) = base_state();
        add_device(&mut st, "AB999", 0.0, 0.0, 100.0);
        rebuild_node_hash_map(&mut st);
        assert_eq!(choose_device_for_hash(&st, "AB", 100.0), Some("AB100".into()));
    }

    #[test]
    fn direct_fallback_pair() {
        let (st, _) = base_state();
        let points = route_points_from_device_ids(&st, Some("AB100"), Some("GH400")).unwrap();
        assert_eq!(points, vec![[10.0, 10.0], [13.0, 13.0]]);
        assert!(route_points_from_device_ids(&st, Some("AB100"), Some("AB100")).is_none());
        assert!(route_points_from_device_ids(&st, Some("AB100"), None).is_none());
    }

    #[test]
    fn consecutive_duplicate_points_collapse() {
        let (mut st, cfg) = base_state();
        // Two different prefixes at the same coordinates.
        add_device(&mut st, "XY500", 11.0, 11.0, 100.0);
        rebuild_node_hash_map(&mut st);
        let hashes = vec![json!("CD"), json!("XY")];
        let resolved =
            route_points_from_hashes(&st, &cfg, &hashes, Some("AB100"), Some("GH400"), 100.0)
                .unwrap();
        assert_eq!(resolved.points.len(), 3);
    }
}
