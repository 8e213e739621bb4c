//! Durable state: the atomic snapshot file, the role-overrides file and the
//! neighbor-overrides file. The history journal lives in `history`.

use std::collections::HashMap;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::fs;
use tracing::{info, warn};

use mesh_types::{DeviceRole, DeviceState, TrailPoint};

use crate::config::Config;
use crate::geo::{self, coords_are_zero, within_map_radius};
use crate::state::{AppState, NeighborEdge, SharedState};
use crate::topology;

/// On-disk snapshot document. Written via tmp + rename whenever the state
/// is dirty, at most once per save interval.
#[derive(Debug, Serialize, Deserialize)]
struct StateSnapshot {
    version: u32,
    saved_at: f64,
    #[serde(default)]
    devices: HashMap<String, Value>,
    #[serde(default)]
    trails: HashMap<String, Value>,
    #[serde(default)]
    seen_devices: HashMap<String, f64>,
    #[serde(default)]
    device_names: HashMap<String, String>,
    /// Role tags as free strings; normalized on load so stale files with
    /// unknown tags cannot poison the parse.
    #[serde(default)]
    device_roles: HashMap<String, String>,
    #[serde(default)]
    device_role_sources: HashMap<String, String>,
}

/// Serialize the persistent slice of the state. Trails are written only for
/// devices that still exist; names, roles and the seen map may legitimately
/// cover devices that have no mapped position yet.
fn serialize_state(st: &AppState) -> StateSnapshot {
    let devices: HashMap<String, Value> = st
        .devices
        .iter()
        .filter_map(|(k, v)| serde_json::to_value(v).ok().map(|v| (k.clone(), v)))
        .collect();
    let trails: HashMap<String, Value> = st
        .trails
        .iter()
        .filter(|(k, _)| st.devices.contains_key(*k))
        .filter_map(|(k, v)| serde_json::to_value(v).ok().map(|v| (k.clone(), v)))
        .collect();
    StateSnapshot {
        version: 1,
        saved_at: geo::now(),
        devices,
        trails,
        seen_devices: st.seen_devices.clone(),
        device_names: st.device_names.clone(),
        device_roles: st
            .device_roles
            .iter()
            .map(|(k, v)| (k.clone(), v.as_str().to_string()))
            .collect(),
        device_role_sources: st.device_role_sources.clone(),
    }
}

pub async fn save_state(st: &AppState, cfg: &Config) -> Result<()> {
    let snapshot = serialize_state(st);
    let json = serde_json::to_string(&snapshot)?;
    fs::create_dir_all(&cfg.state_dir).await.ok();
    let tmp = cfg.state_file.with_extension("json.tmp");
    fs::write(&tmp, json).await.context("write state tmp")?;
    fs::rename(&tmp, &cfg.state_file).await.context("rename state file")?;
    Ok(())
}

/// Periodic snapshot writer: saves when dirty, at most once per interval.
pub async fn state_saver(state: SharedState, cfg: std::sync::Arc<Config>) {
    let interval = cfg.state_save_interval.max(1.0);
    loop {
        let dirty = { state.read().await.dirty };
        if dirty {
            let result = {
                let st = state.read().await;
                save_state(&st, &cfg).await
            };
            match result {
                Ok(()) => state.write().await.dirty = false,
                Err(e) => {
                    // Stays dirty; the next tick retries.
                    eprintln!("[state] failed to save {}: {e}", cfg.state_file.display());
                }
            }
        }
        tokio::time::sleep(std::time::Duration::from_secs_f64(interval)).await;
    }
}

/// Load the role-overrides file: device-id → role tag.
pub async fn load_role_overrides(cfg: &Config) -> HashMap<String, DeviceRole> {
    let mut roles = HashMap::new();
    if !cfg.device_roles_file.exists() {
        return roles;
    }
    let data = match fs::read_to_string(&cfg.device_roles_file).await {
        Ok(data) => data,
        Err(_) => return roles,
    };
    let Ok(Value::Object(map)) = serde_json::from_str::<Value>(&data) else {
        return roles;
    };
    for (key, value) in map {
        let Some(raw) = value.as_str() else { continue };
        let Some(role) = DeviceRole::normalize(raw) else { continue };
        roles.insert(key.trim().to_string(), role);
    }
    roles
}

/// Load the state snapshot, dropping entries the filters no longer admit.
pub async fn load_state(st: &mut AppState, cfg: &Config) {
    if !cfg.state_file.exists() {
        return;
    }
    let data = match fs::read_to_string(&cfg.state_file).await {
        Ok(data) => data,
        Err(e) => {
            warn!(file = %cfg.state_file.display(), error = %e, "failed to read state file");
            return;
        }
    };
    let snapshot: StateSnapshot = match serde_json::from_str(&data) {
        Ok(snapshot) => snapshot,
        Err(e) => {
            warn!(file = %cfg.state_file.display(), error = %e, "failed to parse state file");
            return;
        }
    };

    let mut dropped: Vec<String> = Vec::new();
    let mut dirty = false;

    st.devices.clear();
    for (key, value) in snapshot.devices {
        let Ok(device) = serde_json::from_value::<DeviceState>(value) else {
            dirty = true;
            continue;
        };
        if coords_are_zero(device.lat, device.lon) || !within_map_radius(cfg, device.lat, device.lon) {
            dropped.push(key);
            dirty = true;
            continue;
        }
        st.devices.insert(key, device);
    }

    st.seen_devices = snapshot.seen_devices;

    // Trails: keep only well-formed in-bounds points for live devices.
    st.trails.clear();
    if cfg.trail_len > 0 {
        for (device_id, value) in snapshot.trails {
            if dropped.contains(&device_id) {
                dirty = true;
                continue;
            }
            let Ok(points) = serde_json::from_value::<Vec<Value>>(value) else {
                dirty = true;
                continue;
            };
            let mut filtered: Vec<TrailPoint> = Vec::new();
            for point in points {
                let Ok(point) = serde_json::from_value::<TrailPoint>(point) else {
                    dirty = true;
                    continue;
                };
                if coords_are_zero(point.lat(), point.lon())
                    || !within_map_radius(cfg, point.lat(), point.lon())
                {
                    dirty = true;
                    continue;
                }
                filtered.push(point);
            }
            if filtered.is_empty() {
                dirty = true;
            } else {
                st.trails.insert(device_id, filtered);
            }
        }
    } else if !snapshot.trails.is_empty() {
        dirty = true;
    }

    st.device_names = snapshot
        .device_names
        .into_iter()
        .filter(|(_, v)| !v.trim().is_empty())
        .collect();
    st.device_role_sources = snapshot
        .device_role_sources
        .into_iter()
        .filter(|(_, v)| !v.trim().is_empty())
        .collect();

    // Roles survive a restart only when explicitly learned or overridden.
    st.device_roles.clear();
    for (key, raw) in snapshot.device_roles {
        let Some(role) = DeviceRole::normalize(&raw) else {
            continue;
        };
        match st.device_role_sources.get(&key).map(String::as_str) {
            Some("explicit") | Some("override") => {
                st.device_roles.insert(key, role);
            }
            _ => {}
        }
    }

    // Role overrides win over everything and are marked as such.
    let overrides = load_role_overrides(cfg).await;
    for (device_id, role) in overrides {
        st.device_role_sources.insert(device_id.clone(), "override".to_string());
        st.device_roles.insert(device_id, role);
    }

    for device_id in &dropped {
        st.seen_devices.remove(device_id);
        st.device_names.remove(device_id);
        st.device_roles.remove(device_id);
        st.device_role_sources.remove(device_id);
    }

    topology::rebuild_node_hash_map(st);

    // Reflect learned names/roles back onto the device records.
    for (device_id, device) in st.devices.iter_mut() {
        if device.name.is_none() {
            device.name = st.device_names.get(device_id).cloned();
        }
        device.role = st.device_roles.get(device_id).copied();
    }

    if dirty || !dropped.is_empty() {
        st.dirty = true;
    }
    info!(
        devices = st.devices.len(),
        trails = st.trails.len(),
        "state loaded from disk"
    );
}

/// Load the neighbor-overrides file. Accepted shapes: a map
/// `src → [dst, ...]`, a list of `[src, dst]` pairs, or a list of objects
/// with `src`/`dst` (or `from`/`to`) keys. Both directions are applied with
/// `manual = true`, which exempts them from reaping.
pub async fn load_neighbor_overrides(st: &mut AppState, cfg: &Config) {
    if !cfg.neighbor_overrides_file.exists() {
        return;
    }
    let data = match fs::read_to_string(&cfg.neighbor_overrides_file).await {
        Ok(data) => data,
        Err(_) => return,
    };
    let Ok(value) = serde_json::from_str::<Value>(&data) else {
        warn!(file = %cfg.neighbor_overrides_file.display(), "neighbor overrides file is not valid JSON");
        return;
    };

    let mut pairs: Vec<(String, String)> = Vec::new();
    match value {
        Value::Object(map) => {
            for (src, dsts) in map {
                let Value::Array(dsts) = dsts else { continue };
                for dst in dsts {
                    if let Some(dst) = dst.as_str() {
                        pairs.push((src.clone(), dst.to_string()));
                    }
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                match item {
                    Value::Array(pair) if pair.len() >= 2 => {
                        if let (Some(a), Some(b)) = (pair[0].as_str(), pair[1].as_str()) {
                            pairs.push((a.to_string(), b.to_string()));
                        }
                    }
                    Value::Object(map) => {
                        let src = map.get("src").or_else(|| map.get("from")).and_then(Value::as_str);
                        let dst = map.get("dst").or_else(|| map.get("to")).and_then(Value::as_str);
                        if let (Some(a), Some(b)) = (src, dst) {
                            pairs.push((a.to_string(), b.to_string()));
                        }
                    }
                    _ => {}
                }
            }
        }
        _ => {}
    }

    let now = geo::now();
    let mut applied = 0usize;
    for (a, b) in pairs {
        if a.is_empty() || b.is_empty() || a == b {
            continue;
        }
        for (src, dst) in [(a.clone(), b.clone()), (b, a)] {
            let entry = st
                .neighbor_edges
                .entry(src)
                .or_default()
                .entry(dst)
                .or_insert_with(|| NeighborEdge { count: 0, last_seen: now, manual: true });
            entry.manual = true;
        }
        applied += 1;
    }
    if applied > 0 {
        info!(pairs = applied, "neighbor overrides applied");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(id: &str, lat: f64, lon: f64) -> DeviceState {
        DeviceState {
            device_id: id.to_string(),
            lat,
            lon,
            ts: 100.0,
            heading: None,
            speed: None,
            rssi: None,
            snr: None,
            name: None,
            role: None,
            raw_topic: None,
        }
    }

    fn cfg_in(dir: &std::path::Path) -> Config {
        let mut cfg = Config::from_env();
        cfg.state_dir = dir.to_path_buf();
        cfg.state_file = dir.join("state.json");
        cfg.device_roles_file = dir.join("device_roles.json");
        cfg.neighbor_overrides_file = dir.join("neighbor_overrides.json");
        cfg.map_radius_km = 0.0;
        cfg.trail_len = 10;
        cfg
    }

    #[tokio::test]
    async fn save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = cfg_in(dir.path());

        let mut st = AppState::new();
        st.devices.insert("AB1".into(), device("AB1", 10.0, 20.0));
        st.trails.insert("AB1".into(), vec![TrailPoint(10.0, 20.0, 100.0)]);
        st.seen_devices.insert("AB1".into(), 120.0);
        st.device_names.insert("AB1".into(), "Alpha".into());
        st.device_roles.insert("AB1".into(), DeviceRole::Repeater);
        st.device_role_sources.insert("AB1".into(), "explicit".into());
        save_state(&st, &cfg).await.unwrap();

        let mut reloaded = AppState::new();
        load_state(&mut reloaded, &cfg).await;
        assert_eq!(reloaded.devices.len(), 1);
        assert_eq!(reloaded.trails["AB1"].len(), 1);
        assert_eq!(reloaded.seen_devices["AB1"], 120.0);
        assert_eq!(reloaded.device_roles["AB1"], DeviceRole::Repeater);
        let dev = &reloaded.devices["AB1"];
        assert_eq!(dev.name.as_deref(), Some("Alpha"));
        assert_eq!(dev.role, Some(DeviceRole::Repeater));
        assert_eq!(reloaded.hash_to_device["AB"], "AB1");
    }

    #[tokio::test]
    async fn load_drops_zero_and_out_of_radius_devices() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = cfg_in(dir.path());

        let mut st = AppState::new();
        st.devices.insert("AB1".into(), device("AB1", 0.0, 0.0));
        st.devices.insert("CD2".into(), device("CD2", 5.0, 5.0));
        st.devices.insert("EF3".into(), device("EF3", 0.05, 0.05));
        st.trails.insert("CD2".into(), vec![TrailPoint(5.0, 5.0, 100.0)]);
        st.device_names.insert("CD2".into(), "Far".into());
        save_state(&st, &cfg).await.unwrap();

        cfg.map_radius_km = 10.0;
        let mut reloaded = AppState::new();
        load_state(&mut reloaded, &cfg).await;
        // Zero sentinel and out-of-radius are both dropped, with their maps.
        assert_eq!(reloaded.devices.len(), 1);
        assert!(reloaded.devices.contains_key("EF3"));
        assert!(reloaded.trails.is_empty());
        assert!(reloaded.device_names.is_empty());
        assert!(reloaded.dirty);
    }

    #[tokio::test]
    async fn trail_len_zero_clears_trails() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = cfg_in(dir.path());

        let mut st = AppState::new();
        st.devices.insert("AB1".into(), device("AB1", 10.0, 20.0));
        st.trails.insert("AB1".into(), vec![TrailPoint(10.0, 20.0, 100.0)]);
        save_state(&st, &cfg).await.unwrap();

        cfg.trail_len = 0;
        let mut reloaded = AppState::new();
        load_state(&mut reloaded, &cfg).await;
        assert!(reloaded.trails.is_empty());
        assert!(reloaded.dirty);
    }

    #[tokio::test]
    async fn learned_role_without_source_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = cfg_in(dir.path());

        let mut st = AppState::new();
        st.devices.insert("AB1".into(), device("AB1", 10.0, 20.0));
        st.device_roles.insert("AB1".into(), DeviceRole::Room);
        // No role source recorded.
        save_state(&st, &cfg).await.unwrap();

        let mut reloaded = AppState::new();
        load_state(&mut reloaded, &cfg).await;
        assert!(reloaded.device_roles.is_empty());
    }

    #[tokio::test]
    async fn role_overrides_win() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = cfg_in(dir.path());

        let mut st = AppState::new();
        st.devices.insert("AB1".into(), device("AB1", 10.0, 20.0));
        st.device_roles.insert("AB1".into(), DeviceRole::Companion);
        st.device_role_sources.insert("AB1".into(), "explicit".into());
        save_state(&st, &cfg).await.unwrap();

        std::fs::write(
            &cfg.device_roles_file,
            serde_json::json!({"AB1": "room server", "ZZ9": "bogus"}).to_string(),
        )
        .unwrap();

        let mut reloaded = AppState::new();
        load_state(&mut reloaded, &cfg).await;
        assert_eq!(reloaded.device_roles["AB1"], DeviceRole::Room);
        assert_eq!(reloaded.device_role_sources["AB1"], "override");
        assert!(!reloaded.device_roles.contains_key("ZZ9"));
    }

    #[tokio::test]
    async fn neighbor_override_shapes() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = cfg_in(dir.path());

        std::fs::write(
            &cfg.neighbor_overrides_file,
            serde_json::json!({"A": ["B", "C"]}).to_string(),
        )
        .unwrap();
        let mut st = AppState::new();
        load_neighbor_overrides(&mut st, &cfg).await;
        assert!(st.neighbor_edges["A"]["B"].manual);
        assert!(st.neighbor_edges["B"]["A"].manual);
        assert!(st.neighbor_edges["C"]["A"].manual);

        std::fs::write(
            &cfg.neighbor_overrides_file,
            serde_json::json!([["D", "E"], {"src": "F", "dst": "G"}]).to_string(),
        )
        .unwrap();
        let mut st = AppState::new();
        load_neighbor_overrides(&mut st, &cfg).await;
        assert!(st.neighbor_edges["D"]["E"].manual);
        assert!(st.neighbor_edges["G"]["F"].manual);
    }

    #[tokio::test]
    async fn missing_file_is_fine() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = cfg_in(dir.path());
        let mut st = AppState::new();
        load_state(&mut st, &cfg).await;
        assert!(st.devices.is_empty());
        assert!(!st.dirty);
    }
}
