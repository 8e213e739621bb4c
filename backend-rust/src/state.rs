//! In-memory live state: devices, trails, routes, heat, history, caches and
//! counters. No I/O here; persistence and the journal live in their own
//! modules.
//!
//! Writer discipline: the broadcaster and reaper own every map entity
//! (devices, trails, routes, heat, history). The MQTT ingest task only
//! touches counters, debug rings, seen maps, the message-origin cache and
//! the name/role maps, and posts everything else through the event queue.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use mesh_types::{
    DevicePayload, DeviceRole, DeviceState, HistoryEdge, HistorySegment, Route, RouteMode,
    TrailPoint, UpdateInfo,
};

use crate::config::Config;
use crate::decoder::ParsedPosition;
use crate::geo;

pub type SharedState = Arc<RwLock<AppState>>;

/// Registered map clients: serialized frames are pushed into each sender;
/// the connection task forwards them to the socket. A send error drops the
/// client.
pub type Clients = Arc<RwLock<HashMap<Uuid, mpsc::UnboundedSender<String>>>>;

pub type EventTx = mpsc::UnboundedSender<Event>;
pub type EventRx = mpsc::UnboundedReceiver<Event>;

// ── Events ────────────────────────────────────────────────────────────────────

/// Work posted from the ingest task to the broadcaster.
#[derive(Debug)]
pub enum Event {
    DeviceName { device_id: String },
    DeviceRole { device_id: String },
    DeviceSeen { device_id: String, last_seen_ts: f64, mqtt_seen_ts: Option<f64> },
    DeviceRemove { device_id: String },
    Route(RouteEvent),
    Position(ParsedPosition),
}

/// Everything the ingest side knows about one potential route.
#[derive(Debug, Default)]
pub struct RouteEvent {
    pub route_mode: Option<RouteMode>,
    pub route_id: Option<String>,
    pub path_hashes: Vec<Value>,
    pub payload_type: Option<i64>,
    pub route_type: Option<i64>,
    pub message_hash: Option<String>,
    pub origin_id: Option<String>,
    pub receiver_id: Option<String>,
    pub snr_values: Option<Value>,
    pub ts: f64,
    pub topic: String,
}

// ── Auxiliary records ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize)]
pub struct Stats {
    pub received_total: u64,
    pub parsed_total: u64,
    pub unparsed_total: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_rx_ts: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_rx_topic: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_parsed_ts: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_parsed_topic: Option<String>,
}

/// One entry in the rolling ingest-debug ring.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DebugEntry {
    pub ts: f64,
    pub topic: String,
    pub result: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub found_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decoder_meta: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role_target_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub packet_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub direction: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub json_keys: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parse_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub origin_id: Option<String>,
    pub payload_preview: String,
}

/// One entry in the `/status` ring.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StatusEntry {
    pub ts: f64,
    pub topic: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_role: Option<DeviceRole>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub origin_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub json_keys: Option<Vec<String>>,
    pub payload_preview: String,
}

/// First-transmitter evidence for one message hash, used to infer route
/// origins from rx-only traffic.
#[derive(Debug, Clone, Default)]
pub struct MessageOrigin {
    pub origin_id: Option<String>,
    pub first_rx: Option<String>,
    pub receivers: HashSet<String>,
    pub ts: f64,
}

/// Directed neighbor-graph entry for peer stats. Manual edges come from the
/// overrides file and never expire.
#[derive(Debug, Clone, Default, Serialize)]
pub struct NeighborEdge {
    pub count: u64,
    pub last_seen: f64,
    pub manual: bool,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct HeatEvent {
    pub lat: f64,
    pub lon: f64,
    pub ts: f64,
    pub weight: f64,
}

/// Rolling history store: the segment deque mirrors the journal file; edge
/// counts always equal the number of live segments sharing the canonical key.
#[derive(Debug, Default)]
pub struct HistoryStore {
    pub segments: VecDeque<HistorySegment>,
    pub edges: HashMap<String, HistoryEdge>,
    pub compact_dirty: bool,
    pub last_compact: f64,
}

// ── App state ─────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct AppState {
    pub devices: HashMap<String, DeviceState>,
    pub trails: HashMap<String, Vec<TrailPoint>>,
    pub routes: HashMap<String, Route>,
    pub heat_events: Vec<HeatEvent>,
    pub history: HistoryStore,

    // Node-hash prefix maps, rebuilt on every device-set change.
    pub hash_to_device: HashMap<String, String>,
    pub hash_candidates: HashMap<String, Vec<String>>,
    pub hash_collisions: HashSet<String>,

    pub device_names: HashMap<String, String>,
    pub device_roles: HashMap<String, DeviceRole>,
    pub device_role_sources: HashMap<String, String>,

    pub message_origins: HashMap<String, MessageOrigin>,
    pub neighbor_edges: HashMap<String, HashMap<String, NeighborEdge>>,

    pub seen_devices: HashMap<String, f64>,
    pub mqtt_seen: HashMap<String, f64>,
    pub last_seen_broadcast: HashMap<String, f64>,

    pub stats: Stats,
    pub result_counts: HashMap<String, u64>,
    pub topic_counts: HashMap<String, u64>,
    pub debug_last: VecDeque<DebugEntry>,
    pub status_last: VecDeque<StatusEntry>,

    pub update_info: UpdateInfo,
    pub dirty: bool,
}

impl AppState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count_result(&mut self, result: &str) {
        *self.result_counts.entry(result.to_string()).or_insert(0) += 1;
    }

    pub fn push_debug(&mut self, cfg: &Config, entry: DebugEntry) {
        if self.debug_last.len() >= cfg.debug_last_max.max(1) {
            self.debug_last.pop_front();
        }
        self.debug_last.push_back(entry);
    }

    pub fn push_status(&mut self, cfg: &Config, entry: StatusEntry) {
        if self.status_last.len() >= cfg.debug_status_max.max(1) {
            self.status_last.pop_front();
        }
        self.status_last.push_back(entry);
    }

    /// Remove a device from every runtime structure. Returns whether it was
    /// actually mapped; the caller builds frames from that.
    pub fn evict_device(&mut self, device_id: &str) -> bool {
        let removed = self.devices.remove(device_id).is_some();
        self.trails.remove(device_id);
        self.seen_devices.remove(device_id);
        self.mqtt_seen.remove(device_id);
        self.last_seen_broadcast.remove(device_id);
        if removed {
            self.dirty = true;
            crate::topology::rebuild_node_hash_map(self);
        }
        removed
    }

    /// Device decorated for the wire: liveness timestamps, forced-online
    /// marker, raw topic hidden in production.
    pub fn device_payload(&self, cfg: &Config, device_id: &str) -> Option<DevicePayload> {
        let mut state = self.devices.get(device_id)?.clone();
        if cfg.prod_mode {
            state.raw_topic = None;
        }
        let last_seen = self.seen_devices.get(device_id).copied().unwrap_or(state.ts);
        let mqtt_seen_ts = self.mqtt_seen.get(device_id).copied();
        let mqtt_forced = if cfg.online_force_names.is_empty() {
            None
        } else {
            let name = state
                .name
                .clone()
                .or_else(|| self.device_names.get(device_id).cloned())
                .unwrap_or_default()
                .trim()
                .to_ascii_lowercase();
            (!name.is_empty() && cfg.online_force_names.contains(&name)).then_some(true)
        };
        Some(DevicePayload {
            state,
            last_seen_ts: last_seen,
            mqtt_seen_ts,
            mqtt_forced,
        })
    }

    pub fn trail_for(&self, device_id: &str) -> Vec<TrailPoint> {
        self.trails.get(device_id).cloned().unwrap_or_default()
    }

    /// Heat events still inside the TTL window, as wire quads.
    pub fn serialize_heat(&self, cfg: &Config) -> Vec<[f64; 4]> {
        if cfg.heat_ttl_seconds <= 0.0 {
            return Vec::new();
        }
        let cutoff = geo::now() - cfg.heat_ttl_seconds;
        self.heat_events
            .iter()
            .filter(|e| e.ts >= cutoff)
            .map(|e| [e.lat, e.lon, e.ts, e.weight])
            .collect()
    }

    /// Record one resolved path in the directed neighbor graph: every
    /// consecutive pair, both directions, non-manual.
    pub fn record_neighbors(&mut self, point_ids: &[Option<String>], ts: f64) {
        for pair in point_ids.windows(2) {
            let (Some(a), Some(b)) = (&pair[0], &pair[1]) else {
                continue;
            };
            if a == b {
                continue;
            }
            for (src, dst) in [(a, b), (b, a)] {
                let entry = self
                    .neighbor_edges
                    .entry(src.clone())
                    .or_default()
                    .entry(dst.clone())
                    .or_default();
                entry.count += 1;
                entry.last_seen = entry.last_seen.max(ts);
            }
        }
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
            raw_topic: Some("mesh/v1/X/packets".into()),
        }
    }

    #[test]
    fn evict_clears_all_maps() {
        let mut st = AppState::new();
        st.devices.insert("AB1".into(), device("AB1", 1.0, 2.0));
        st.trails.insert("AB1".into(), vec![TrailPoint(1.0, 2.0, 100.0)]);
        st.seen_devices.insert("AB1".into(), 100.0);
        st.mqtt_seen.insert("AB1".into(), 100.0);
        st.last_seen_broadcast.insert("AB1".into(), 100.0);
        crate::topology::rebuild_node_hash_map(&mut st);
        assert!(st.hash_to_device.contains_key("AB"));

        assert!(st.evict_device("AB1"));
        assert!(st.devices.is_empty());
        assert!(st.trails.is_empty());
        assert!(st.seen_devices.is_empty());
        assert!(st.hash_to_device.is_empty());
        assert!(st.dirty);
        assert!(!st.evict_device("AB1"));
    }

    #[test]
    fn device_payload_hides_topic_in_prod() {
        let mut st = AppState::new();
        st.devices.insert("AB1".into(), device("AB1", 1.0, 2.0));
        st.seen_devices.insert("AB1".into(), 170.0);

        let mut cfg = Config::from_env();
        cfg.prod_mode = false;
        let payload = st.device_payload(&cfg, "AB1").unwrap();
        assert_eq!(payload.last_seen_ts, 170.0);
        assert!(payload.state.raw_topic.is_some());

        cfg.prod_mode = true;
        let payload = st.device_payload(&cfg, "AB1").unwrap();
        assert!(payload.state.raw_topic.is_none());
    }

    #[test]
    fn neighbor_recording_is_bidirectional() {
        let mut st = AppState::new();
        let ids = vec![Some("A".to_string()), None, Some("B".to_string()), Some("C".to_string())];
        st.record_neighbors(&ids, 50.0);
        // The None interior hop breaks the A pair; only B<->C is recorded.
        assert!(st.neighbor_edges.get("A").is_none());
        assert_eq!(st.neighbor_edges["B"]["C"].count, 1);
        assert_eq!(st.neighbor_edges["C"]["B"].count, 1);
        assert!(!st.neighbor_edges["B"]["C"].manual);
    }
}
