//! # mesh-types
//!
//! Shared wire contracts for the Meshmap live-map service.
//!
//! These types are used by:
//! - `backend-rust`: decoding broker packets and pushing frames to map clients
//! - `mesh-simulator`: publishing synthetic mesh traffic for development
//!
//! ## Conventions
//!
//! - Timestamps are Unix seconds as `f64` (the wire contract of the map
//!   clients and the on-disk snapshot/journal files).
//! - Map points are `[lat, lon]` pairs; trail points are `[lat, lon, ts]`
//!   triples; heat samples are `[lat, lon, ts, weight]`.
//! - A *node hash* is the two-hex-digit shorthand of a device id: the first
//!   two characters of the id, uppercased.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ── Device role ───────────────────────────────────────────────────────────────

/// Role a mesh node advertises. Serialized as the lowercase tag the map
/// clients and the snapshot file expect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceRole {
    Companion,
    Repeater,
    Room,
}

impl DeviceRole {
    /// Normalize a free-form role string by substring match.
    /// "repeater"/"relay" → Repeater, "companion"/"chat node"/"chat" →
    /// Companion, "room server"/"room" → Room.
    pub fn normalize(value: &str) -> Option<Self> {
        let s = value.trim().to_ascii_lowercase();
        if s.is_empty() {
            return None;
        }
        if s.contains("repeater") || s == "repeat" || s == "relay" {
            return Some(Self::Repeater);
        }
        if s.contains("companion") || s.contains("chat node") || s.contains("chatnode") || s == "chat" {
            return Some(Self::Companion);
        }
        if s.contains("room server") || s.contains("roomserver") || s.contains("room") {
            return Some(Self::Room);
        }
        None
    }

    /// Map the firmware's numeric deviceRole (1/2/3) to a role.
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            1 => Some(Self::Companion),
            2 => Some(Self::Repeater),
            3 => Some(Self::Room),
            _ => None,
        }
    }

    /// Numeric role code used by the nodes API (1=companion, 2=repeater, 3=room).
    pub fn code(self) -> u8 {
        match self {
            Self::Companion => 1,
            Self::Repeater => 2,
            Self::Room => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Companion => "companion",
            Self::Repeater => "repeater",
            Self::Room => "room",
        }
    }
}

// ── Node hashes ───────────────────────────────────────────────────────────────

/// Normalize a wire node-hash value (string, `0x`-prefixed string, single hex
/// digit, or small integer) to uppercase two-hex form.
pub fn normalize_node_hash(value: &Value) -> Option<String> {
    match value {
        Value::Number(n) => {
            let v = n.as_i64()?;
            if !(0..=255).contains(&v) {
                return None;
            }
            Some(format!("{v:02X}"))
        }
        Value::String(s) => normalize_node_hash_str(s),
        _ => None,
    }
}

/// String-only variant of [`normalize_node_hash`].
pub fn normalize_node_hash_str(value: &str) -> Option<String> {
    let mut s = value.trim();
    if let Some(rest) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        s = rest;
    }
    let padded;
    if s.len() == 1 {
        padded = format!("0{s}");
        s = &padded;
    }
    if s.len() != 2 || !s.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    Some(s.to_ascii_uppercase())
}

/// Node hash implied by a device id (its first two characters), if valid hex.
pub fn node_hash_from_device_id(device_id: &str) -> Option<String> {
    if device_id.len() < 2 {
        return None;
    }
    normalize_node_hash_str(&device_id[..2])
}

// ── External decoder contract ─────────────────────────────────────────────────

/// Location block inside a decoded packet.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DecodedLocation {
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pubkey: Option<String>,
}

/// JSON document the external decoder writes to stdout, one per packet.
///
/// Numeric fields arrive as ints or strings depending on the decoder build,
/// so the flexible ones stay as raw [`Value`]s and are coerced at use sites.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DecoderResult {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<DecodedLocation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload_type: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub route_type: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path_hashes: Option<Vec<Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snr_values: Option<Value>,
    /// Raw path header bytes; used for routing only for selected
    /// payload/route types.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<Vec<Value>>,
    /// Numeric role advertised by the node (1/2/3).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_role: Option<Value>,
    /// Free-form role string, when the packet carries one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_role_name: Option<String>,
}

// ── Map entities ──────────────────────────────────────────────────────────────

/// Latest known state of one mesh device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceState {
    pub device_id: String,
    pub lat: f64,
    pub lon: f64,
    /// Timestamp of the last parsed position.
    pub ts: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub heading: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speed: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rssi: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snr: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<DeviceRole>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_topic: Option<String>,
}

/// Device as pushed to map clients: the state plus liveness decoration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DevicePayload {
    #[serde(flatten)]
    pub state: DeviceState,
    pub last_seen_ts: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mqtt_seen_ts: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mqtt_forced: Option<bool>,
}

/// One trail sample: `[lat, lon, ts]` on the wire and on disk.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrailPoint(pub f64, pub f64, pub f64);

impl TrailPoint {
    pub fn lat(&self) -> f64 {
        self.0
    }
    pub fn lon(&self) -> f64 {
        self.1
    }
    pub fn ts(&self) -> f64 {
        self.2
    }
}

/// How a route polyline was derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Hash)]
#[serde(rename_all = "lowercase")]
pub enum RouteMode {
    /// Resolved from the packet's path-hash list.
    Path,
    /// Inferred origin → independent receiver of the same message.
    Fanout,
    /// Origin → receiver with no path evidence at all.
    Direct,
}

impl RouteMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Path => "path",
            Self::Fanout => "fanout",
            Self::Direct => "direct",
        }
    }
}

/// Ephemeral polyline drawn for one packet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Route {
    pub id: String,
    pub points: Vec<[f64; 2]>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hashes: Vec<String>,
    /// One entry per point; interior hops may be unresolved.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub point_ids: Vec<Option<String>>,
    pub route_mode: RouteMode,
    pub ts: f64,
    pub expires_at: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub origin_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub receiver_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload_type: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snr_values: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
}

impl Route {
    /// Copy with the fields hidden from production clients cleared.
    pub fn sanitized(&self) -> Route {
        Route {
            id: self.id.clone(),
            points: self.points.clone(),
            hashes: Vec::new(),
            point_ids: Vec::new(),
            route_mode: self.route_mode,
            ts: self.ts,
            expires_at: self.expires_at,
            origin_id: None,
            receiver_id: None,
            payload_type: self.payload_type,
            message_hash: None,
            snr_values: None,
            topic: None,
        }
    }
}

/// Envelope metadata attached to a recorded history segment.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HistorySample {
    pub ts: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload_type: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub origin_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub receiver_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub route_mode: Option<RouteMode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
}

/// One journal line: a single observed route segment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistorySegment {
    pub ts: f64,
    pub a: [f64; 2],
    pub b: [f64; 2],
    #[serde(skip_serializing_if = "Option::is_none")]
    pub a_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub b_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload_type: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub origin_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub receiver_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub route_mode: Option<RouteMode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
}

/// Undirected, coordinate-keyed edge with a rolling count of segments in
/// the retention window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEdge {
    pub id: String,
    pub a: [f64; 2],
    pub b: [f64; 2],
    pub count: i64,
    pub last_ts: f64,
    /// Newest-first, capped at the configured sample limit.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub recent: Vec<HistorySample>,
}

/// Update-check record carried in snapshots. The check itself is an
/// external collaborator; an idle record is served when it is absent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateInfo {
    pub available: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_short: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_short: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// ── Client frames ─────────────────────────────────────────────────────────────

/// One JSON frame pushed over the live socket. The `type` field is the
/// discriminator the map clients switch on.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Snapshot {
        devices: HashMap<String, DevicePayload>,
        trails: HashMap<String, Vec<TrailPoint>>,
        routes: Vec<Route>,
        history_edges: Vec<HistoryEdge>,
        history_window_seconds: u64,
        heat: Vec<[f64; 4]>,
        update: UpdateInfo,
        #[serde(skip_serializing_if = "Option::is_none")]
        server_time: Option<f64>,
    },
    Update {
        device: DevicePayload,
        trail: Vec<TrailPoint>,
    },
    DeviceSeen {
        device_id: String,
        last_seen_ts: f64,
        #[serde(skip_serializing_if = "Option::is_none")]
        mqtt_seen_ts: Option<f64>,
    },
    Stale {
        device_ids: Vec<String>,
    },
    Route {
        route: Route,
    },
    RouteRemove {
        route_ids: Vec<String>,
    },
    HistoryEdges {
        edges: Vec<HistoryEdge>,
    },
    HistoryEdgesRemove {
        edge_ids: Vec<String>,
    },
}
