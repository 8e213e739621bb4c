//! Payload probing and packet decoding.
//!
//! Broker payloads arrive in many shapes: JSON with inline coordinates, JSON
//! wrapping a binary packet as hex/base64/byte-list, bare hex, bare base64,
//! or raw binary. Probing walks a fixed search order; the first match wins
//! and stamps the result code. Binary packets are handed to the external
//! decoder script, one subprocess per packet.

use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use base64::Engine as _;
use regex::Regex;
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::{debug, info, warn};

use mesh_types::{DecoderResult, DeviceRole};

use crate::config::{Config, DirectCoordsMode};
use crate::geo::{coords_are_zero, now};

const LATLON_KEYS_LAT: [&str; 2] = ["lat", "latitude"];
const LATLON_KEYS_LON: [&str; 3] = ["lon", "lng", "longitude"];

/// Candidate JSON keys for an embedded packet blob, in priority order.
const LIKELY_PACKET_KEYS: [&str; 12] = [
    "hex", "raw", "packet", "packet_hex", "frame", "data", "payload", "mesh_packet",
    "meshcore_packet", "rx_packet", "bytes", "packet_bytes",
];

const LOCATION_HINT_KEYS: [&str; 8] = [
    "location", "gps", "position", "coords", "coordinate", "geo", "geolocation", "latlon",
];

fn re_lat_lon() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)\blat(?:itude)?\b\s*[:=]?\s*(-?\d+(?:\.\d+)?)\s*[, ]+\s*\b(?:lon|lng|longitude)\b\s*[:=]?\s*(-?\d+(?:\.\d+)?)",
        )
        .unwrap()
    })
}

fn re_two_floats() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(-?\d{1,2}\.\d+)\s*[,\s]\s*(-?\d{1,3}\.\d+)").unwrap())
}

fn re_base64_like() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9+/]+={0,2}$").unwrap())
}

// ── Decode errors ─────────────────────────────────────────────────────────────

/// Failure kinds of the external decoder. These surface only in the debug
/// ring and the result counters; the pipeline never stops for them.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("decoder disabled or unavailable")]
    Unavailable,
    #[error("decoder io: {0}")]
    Io(#[from] std::io::Error),
    #[error("decoder timed out")]
    Timeout,
    #[error("decoder exited with status {0}")]
    Status(i32),
    #[error("decoder produced no output")]
    EmptyOutput,
    #[error("decoder output was not JSON: {0}")]
    BadJson(serde_json::Error),
    #[error("decoder reported not-ok")]
    NotOk,
}

impl DecodeError {
    /// Result-code string recorded in the counters.
    pub fn result_code(&self) -> &'static str {
        match self {
            Self::Unavailable => "decoder_unavailable",
            Self::Io(_) => "decode_spawn_error",
            Self::Timeout => "decode_timeout",
            Self::Status(_) | Self::EmptyOutput | Self::BadJson(_) => "decode_error",
            Self::NotOk => "decode_not_ok",
        }
    }
}

// ── Outputs ───────────────────────────────────────────────────────────────────

/// A normalized position extracted from one broker message.
#[derive(Debug, Clone, Default)]
pub struct ParsedPosition {
    pub device_id: String,
    pub lat: f64,
    pub lon: f64,
    pub ts: f64,
    pub heading: Option<f64>,
    pub speed: Option<f64>,
    pub rssi: Option<f64>,
    pub snr: Option<f64>,
    pub name: Option<String>,
    pub role: Option<DeviceRole>,
    pub raw_topic: Option<String>,
}

/// Everything probing learned about one message, parsed or not.
#[derive(Debug, Clone, Default)]
pub struct DecodeDebug {
    pub result: String,
    /// JSON path where a packet blob was located, e.g. `payload.packet`.
    pub found_path: Option<String>,
    pub decoder_meta: Option<DecoderResult>,
    pub parse_error: Option<String>,
    pub direction: Option<String>,
    pub packet_hash: Option<String>,
    /// Origin declared inside the payload (not topic-derived).
    pub origin_id: Option<String>,
    pub decoded_pubkey: Option<String>,
    pub device_name: Option<String>,
    pub device_role: Option<DeviceRole>,
    pub json_keys: Option<Vec<String>>,
    pub payload_preview: String,
}

// ── Topic helpers ─────────────────────────────────────────────────────────────

/// Device id implied by a `mesh-root/<x>/<device-id>/...` topic.
pub fn device_id_from_topic(topic: &str) -> Option<String> {
    let mut parts = topic.split('/');
    let _root = parts.next()?;
    let _ver = parts.next()?;
    let id = parts.next()?;
    (!id.is_empty()).then(|| id.to_string())
}

// ── Probing primitives ────────────────────────────────────────────────────────

fn valid_lat_lon(lat: f64, lon: f64) -> bool {
    (-90.0..=90.0).contains(&lat) && (-180.0..=180.0).contains(&lon)
}

/// Accept raw or scaled-integer coordinates: values outside the valid range
/// are retried divided by 1e7, 1e6, 1e5 and 1e4.
pub fn normalize_lat_lon(lat: &Value, lon: &Value) -> Option<(f64, f64)> {
    let latf = value_as_f64(lat)?;
    let lonf = value_as_f64(lon)?;
    if valid_lat_lon(latf, lonf) {
        return Some((latf, lonf));
    }
    for scale in [1e7, 1e6, 1e5, 1e4] {
        let (la, lo) = (latf / scale, lonf / scale);
        if valid_lat_lon(la, lo) {
            return Some((la, lo));
        }
    }
    None
}

fn value_as_f64(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Recursive lat/lon key search, objects before nested values.
fn find_lat_lon_in_json(obj: &Value) -> Option<(f64, f64)> {
    match obj {
        Value::Object(map) => {
            let lat = LATLON_KEYS_LAT.iter().find_map(|k| map.get(*k));
            let lon = LATLON_KEYS_LON.iter().find_map(|k| map.get(*k));
            if let (Some(lat), Some(lon)) = (lat, lon) {
                if let Some(found) = normalize_lat_lon(lat, lon) {
                    return Some(found);
                }
            }
            map.values().find_map(find_lat_lon_in_json)
        }
        Value::Array(items) => items.iter().find_map(find_lat_lon_in_json),
        _ => None,
    }
}

fn strings_from_json<'a>(obj: &'a Value, out: &mut Vec<&'a str>) {
    match obj {
        Value::String(s) => out.push(s),
        Value::Object(map) => map.values().for_each(|v| strings_from_json(v, out)),
        Value::Array(items) => items.iter().for_each(|v| strings_from_json(v, out)),
        _ => {}
    }
}

/// Extract coordinates from free text: `lat <f> lon <f>` first, then any
/// two free-standing floats.
fn find_lat_lon_in_text(text: &str) -> Option<(f64, f64)> {
    if let Some(caps) = re_lat_lon().captures(text) {
        let lat = Value::String(caps[1].to_string());
        let lon = Value::String(caps[2].to_string());
        if let Some(found) = normalize_lat_lon(&lat, &lon) {
            return Some(found);
        }
    }
    for caps in re_two_floats().captures_iter(text) {
        let lat = Value::String(caps[1].to_string());
        let lon = Value::String(caps[2].to_string());
        if let Some(found) = normalize_lat_lon(&lat, &lon) {
            return Some(found);
        }
    }
    None
}

/// Best-effort: decode a base64-looking string to UTF-8-ish text.
fn maybe_base64_decode_to_text(s: &str) -> Option<String> {
    let s = s.trim();
    if s.len() < 24 || !re_base64_like().is_match(s) {
        return None;
    }
    let raw = base64_forgiving(s)?;
    Some(String::from_utf8_lossy(&raw).into_owned())
}

fn looks_like_hex(s: &str) -> bool {
    let s = s.trim();
    s.len() >= 20 && s.len() % 2 == 0 && s.chars().all(|c| c.is_ascii_hexdigit())
}

/// Base64-decode with trailing-garbage tolerance (standard, then padded).
fn base64_forgiving(s: &str) -> Option<Vec<u8>> {
    let engine = base64::engine::general_purpose::STANDARD;
    if let Ok(raw) = engine.decode(s) {
        return Some(raw);
    }
    let trimmed = s.trim_end_matches('=');
    let mut padded = trimmed.to_string();
    while padded.len() % 4 != 0 {
        padded.push('=');
    }
    engine.decode(&padded).ok()
}

/// Base64 string → packet hex, when it plausibly carries binary (has +/= and
/// decodes to at least 10 bytes).
fn try_base64_to_hex(s: &str) -> Option<String> {
    let s = s.trim();
    if s.len() < 24 || !s.contains(['+', '/', '=']) {
        return None;
    }
    let raw = base64_forgiving(s)?;
    (raw.len() >= 10).then(|| hex::encode(raw))
}

/// Under 60% printable in the first 200 bytes means raw binary.
fn is_probably_binary(data: &[u8]) -> bool {
    if data.is_empty() {
        return false;
    }
    let window = &data[..data.len().min(200)];
    let printable = window
        .iter()
        .filter(|&&b| (32..=126).contains(&b) || matches!(b, 9 | 10 | 13))
        .count();
    (printable as f64 / window.len() as f64) < 0.6
}

/// Lossy, truncated payload preview for the debug rings.
pub fn safe_preview(data: &[u8], max: usize) -> String {
    let text = String::from_utf8_lossy(data);
    if text.len() > max {
        let mut cut = max;
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        format!("{}...", &text[..cut])
    } else {
        text.into_owned()
    }
}

fn has_location_hints(obj: &Value) -> bool {
    match obj {
        Value::Object(map) => map.iter().any(|(k, v)| {
            LOCATION_HINT_KEYS.contains(&k.to_ascii_lowercase().as_str())
                || (matches!(v, Value::Object(_) | Value::Array(_)) && has_location_hints(v))
        }),
        Value::Array(items) => items.iter().any(has_location_hints),
        _ => false,
    }
}

fn direct_coords_allowed(cfg: &Config, topic: &str, obj: &Value) -> bool {
    match cfg.direct_coords_mode {
        DirectCoordsMode::Off => false,
        DirectCoordsMode::Any => true,
        DirectCoordsMode::Topic => cfg
            .direct_coords_topic_re
            .as_ref()
            .is_some_and(|re| re.is_match(topic)),
        DirectCoordsMode::Strict => {
            let topic_ok = cfg
                .direct_coords_topic_re
                .as_ref()
                .is_some_and(|re| re.is_match(topic));
            topic_ok && has_location_hints(obj)
        }
    }
}

// ── Name / role extraction ────────────────────────────────────────────────────

const NAME_KEYS: [&str; 9] = [
    "name", "device_name", "deviceName", "node_name", "nodeName", "display_name", "displayName",
    "callsign", "label",
];

pub fn extract_device_name(obj: &Value, topic: &str) -> Option<String> {
    let map = obj.as_object()?;
    for key in NAME_KEYS {
        if let Some(Value::String(s)) = map.get(key) {
            let s = s.trim();
            if !s.is_empty() {
                return Some(s.to_string());
            }
        }
    }
    if topic.ends_with("/status") {
        if let Some(Value::String(s)) = map.get("origin") {
            let s = s.trim();
            if !s.is_empty() {
                return Some(s.to_string());
            }
        }
    }
    None
}

const ROLE_KEYS: [&str; 11] = [
    "role", "device_role", "deviceRole", "node_role", "nodeRole", "node_type", "nodeType",
    "device_type", "deviceType", "class", "profile",
];

pub fn extract_device_role(obj: &Value) -> Option<DeviceRole> {
    let map = obj.as_object()?;
    for key in ROLE_KEYS {
        if let Some(Value::String(s)) = map.get(key) {
            if let Some(role) = DeviceRole::normalize(s) {
                return Some(role);
            }
        }
    }
    None
}

/// Fill the role hint from decoder metadata when the payload had none.
fn apply_meta_role(debug: &mut DecodeDebug, meta: &DecoderResult) {
    if debug.device_role.is_some() {
        return;
    }
    if let Some(role) = meta.role.as_deref().and_then(DeviceRole::normalize) {
        debug.device_role = Some(role);
        return;
    }
    if let Some(role) = meta.device_role_name.as_deref().and_then(DeviceRole::normalize) {
        debug.device_role = Some(role);
        return;
    }
    if let Some(code) = meta.device_role.as_ref().and_then(Value::as_i64) {
        debug.device_role = DeviceRole::from_code(code);
    }
}

// ── Packet blob search ────────────────────────────────────────────────────────

/// Walk the JSON for a packet blob under one of the prioritized keys.
/// Returns (hex, json path).
fn find_packet_blob(obj: &Value) -> Option<(String, String)> {
    for key in LIKELY_PACKET_KEYS {
        if let Some(found) = find_key_blob(obj, key, String::new()) {
            return Some(found);
        }
    }
    None
}

fn find_key_blob(obj: &Value, key: &str, path: String) -> Option<(String, String)> {
    match obj {
        Value::Object(map) => {
            if let Some(v) = map.get(key) {
                let here = if path.is_empty() { key.to_string() } else { format!("{path}.{key}") };
                if let Some(hex_str) = blob_to_hex(v) {
                    return Some((hex_str, here));
                }
            }
            map.iter().find_map(|(k, v)| {
                let child = if path.is_empty() { k.clone() } else { format!("{path}.{k}") };
                find_key_blob(v, key, child)
            })
        }
        Value::Array(items) => items.iter().enumerate().find_map(|(i, v)| {
            let child = if path.is_empty() { format!("[{i}]") } else { format!("{path}[{i}]") };
            find_key_blob(v, key, child)
        }),
        _ => None,
    }
}

/// Accept even-length hex, base64 decoding to ≥ 10 bytes, or a list of
/// small integers convertible to ≥ 10 bytes.
fn blob_to_hex(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => {
            if looks_like_hex(s) {
                return Some(s.trim().to_ascii_lowercase());
            }
            try_base64_to_hex(s)
        }
        Value::Array(items) => {
            if items.len() < 10 {
                return None;
            }
            let bytes: Option<Vec<u8>> = items
                .iter()
                .map(|i| i.as_i64().and_then(|n| u8::try_from(n).ok()))
                .collect();
            bytes.map(hex::encode)
        }
        _ => None,
    }
}

// ── External decoder ──────────────────────────────────────────────────────────

const NODE_UNKNOWN: u8 = 0;
const NODE_READY: u8 = 1;
const NODE_UNAVAILABLE: u8 = 2;

/// One-shot-per-packet wrapper around the external decode script. The
/// startup probe latches ready/unavailable for the process lifetime.
pub struct NodeDecoder {
    enabled: bool,
    runtime: String,
    script: std::path::PathBuf,
    timeout: Duration,
    status: AtomicU8,
}

impl NodeDecoder {
    pub fn new(cfg: &Config) -> Arc<Self> {
        Arc::new(Self {
            enabled: cfg.decode_with_node,
            runtime: cfg.node_runtime.clone(),
            script: cfg.node_script_path.clone(),
            timeout: Duration::from_secs_f64(cfg.node_decode_timeout_seconds.max(0.5)),
            status: AtomicU8::new(NODE_UNKNOWN),
        })
    }

    pub fn is_ready(&self) -> bool {
        self.status.load(Ordering::Relaxed) == NODE_READY
    }

    pub fn is_unavailable(&self) -> bool {
        self.status.load(Ordering::Relaxed) == NODE_UNAVAILABLE
    }

    /// Verify the runtime and the script once; the outcome is latched.
    pub async fn probe(&self) {
        if !self.enabled {
            self.status.store(NODE_UNAVAILABLE, Ordering::Relaxed);
            return;
        }
        if !Path::new(&self.script).exists() {
            warn!(script = %self.script.display(), "decode script missing, packet decoding disabled");
            self.status.store(NODE_UNAVAILABLE, Ordering::Relaxed);
            return;
        }
        let check = Command::new(&self.runtime)
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
        match check {
            Ok(status) if status.success() => {
                info!(runtime = %self.runtime, script = %self.script.display(), "packet decoder ready");
                self.status.store(NODE_READY, Ordering::Relaxed);
            }
            Ok(status) => {
                warn!(runtime = %self.runtime, ?status, "decoder runtime check failed");
                self.status.store(NODE_UNAVAILABLE, Ordering::Relaxed);
            }
            Err(e) => {
                warn!(runtime = %self.runtime, error = %e, "decoder runtime missing");
                self.status.store(NODE_UNAVAILABLE, Ordering::Relaxed);
            }
        }
    }

    /// Decode one packet hex blob. Failures are debug-only; the caller
    /// records the error code and moves on.
    pub async fn decode(&self, packet_hex: &str) -> Result<DecoderResult, DecodeError> {
        if !self.enabled || self.is_unavailable() {
            return Err(DecodeError::Unavailable);
        }
        let mut child = Command::new(&self.runtime)
            .arg(&self.script)
            .arg(packet_hex)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;

        let mut stdout = child.stdout.take().ok_or(DecodeError::EmptyOutput)?;
        let run = async {
            let mut buf = Vec::new();
            stdout.read_to_end(&mut buf).await?;
            let status = child.wait().await?;
            Ok::<_, DecodeError>((status, buf))
        };
        let (status, output) = tokio::time::timeout(self.timeout, run)
            .await
            .map_err(|_| DecodeError::Timeout)??;

        if !status.success() {
            return Err(DecodeError::Status(status.code().unwrap_or(-1)));
        }
        if output.iter().all(|b| b.is_ascii_whitespace()) {
            return Err(DecodeError::EmptyOutput);
        }
        let result: DecoderResult = serde_json::from_slice(&output).map_err(DecodeError::BadJson)?;
        if !result.ok {
            return Err(DecodeError::NotOk);
        }
        Ok(result)
    }
}

// ── Payload decoding front end ────────────────────────────────────────────────

pub struct PayloadDecoder {
    cfg: Arc<Config>,
    node: Arc<NodeDecoder>,
}

impl PayloadDecoder {
    pub fn new(cfg: Arc<Config>, node: Arc<NodeDecoder>) -> Self {
        Self { cfg, node }
    }

    /// Probe one broker message. Returns the parsed position (if any) plus
    /// the debug record; the caller applies the zero/radius filters.
    pub async fn parse(&self, topic: &str, payload: &[u8]) -> (Option<ParsedPosition>, DecodeDebug) {
        let cfg = &self.cfg;
        let mut dbg = DecodeDebug {
            payload_preview: safe_preview(payload, cfg.payload_preview_max),
            ..DecodeDebug::default()
        };

        // 1-3: JSON payloads.
        if let Ok(text) = std::str::from_utf8(payload) {
            match serde_json::from_str::<Value>(text) {
                Ok(json) => return self.parse_json(topic, &json, dbg).await,
                Err(e) => {
                    if text.trim_start().starts_with(['{', '[']) {
                        dbg.parse_error = Some(e.to_string());
                    }
                }
            }

            // 4: bare hex payload.
            if looks_like_hex(text) {
                dbg.packet_hash = Some(packet_hash_hex(text));
                return self.decode_packet(topic, text.trim(), "payload", dbg).await;
            }

            // 5: bare base64 payload.
            if let Some(hex_blob) = try_base64_to_hex(text) {
                dbg.packet_hash = Some(packet_hash_hex(&hex_blob));
                return self.decode_packet(topic, &hex_blob, "payload_b64", dbg).await;
            }
        }

        // 6: raw binary payload.
        if is_probably_binary(payload) && payload.len() >= 10 {
            let hex_blob = hex::encode(payload);
            dbg.packet_hash = Some(packet_hash_hex(&hex_blob));
            return self.decode_packet(topic, &hex_blob, "payload_bin", dbg).await;
        }

        dbg.result = if dbg.parse_error.is_some() { "bad_json" } else { "not_json" }.to_string();
        (None, dbg)
    }

    async fn parse_json(
        &self,
        topic: &str,
        json: &Value,
        mut dbg: DecodeDebug,
    ) -> (Option<ParsedPosition>, DecodeDebug) {
        let cfg = &self.cfg;
        if let Some(map) = json.as_object() {
            dbg.json_keys = Some(map.keys().cloned().collect());
            dbg.direction = map
                .get("direction")
                .or_else(|| map.get("dir"))
                .and_then(Value::as_str)
                .map(|s| s.trim().to_ascii_lowercase());
            dbg.origin_id = ["origin_id", "origin_pubkey", "pubkey", "origin"]
                .iter()
                .find_map(|k| map.get(*k))
                .and_then(Value::as_str)
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty());
        }
        dbg.device_name = extract_device_name(json, topic);
        dbg.device_role = extract_device_role(json);

        let direct_allowed = direct_coords_allowed(cfg, topic, json);
        let mut blocked = false;

        // 1: lat/lon keys anywhere in the document.
        if let Some((lat, lon)) = find_lat_lon_in_json(json) {
            if !direct_allowed {
                blocked = true;
            } else if coords_are_zero(lat, lon) && !cfg.direct_coords_allow_zero {
                dbg.result = "direct_zero_coords".to_string();
                return (None, dbg);
            } else {
                dbg.result = "direct_coords".to_string();
                let parsed = self.position_from_json(topic, json, lat, lon, &dbg);
                return (parsed, dbg);
            }
        }

        // 2: inline coordinates in string leaves (base64 leaves retried).
        let mut leaves = Vec::new();
        strings_from_json(json, &mut leaves);
        for leaf in &leaves {
            let found = find_lat_lon_in_text(leaf).or_else(|| {
                maybe_base64_decode_to_text(leaf).as_deref().and_then(find_lat_lon_in_text)
            });
            if let Some((lat, lon)) = found {
                if !direct_allowed {
                    blocked = true;
                    break;
                }
                if coords_are_zero(lat, lon) && !cfg.direct_coords_allow_zero {
                    dbg.result = "direct_zero_coords".to_string();
                    return (None, dbg);
                }
                dbg.result = "text_coords".to_string();
                let parsed = self.position_from_json(topic, json, lat, lon, &dbg);
                return (parsed, dbg);
            }
        }

        // 3: embedded packet blob.
        if let Some((packet_hex, path)) = find_packet_blob(json) {
            dbg.packet_hash = Some(packet_hash_hex(&packet_hex));
            return self.decode_packet(topic, &packet_hex, &path, dbg).await;
        }

        dbg.result = if blocked { "direct_blocked" } else { "json_no_location" }.to_string();
        (None, dbg)
    }

    /// Hand a packet blob to the external decoder and normalize the result.
    async fn decode_packet(
        &self,
        topic: &str,
        packet_hex: &str,
        found_path: &str,
        mut dbg: DecodeDebug,
    ) -> (Option<ParsedPosition>, DecodeDebug) {
        dbg.found_path = Some(found_path.to_string());
        let meta = match self.node.decode(packet_hex).await {
            Ok(meta) => meta,
            Err(e) => {
                debug!(topic, error = %e, "packet decode failed");
                dbg.result = e.result_code().to_string();
                dbg.parse_error = Some(e.to_string());
                return (None, dbg);
            }
        };

        apply_meta_role(&mut dbg, &meta);
        let location = meta.location.clone();
        if let Some(loc) = &location {
            if dbg.device_name.is_none() {
                dbg.device_name = loc.name.clone().filter(|s| !s.trim().is_empty());
            }
            dbg.decoded_pubkey = loc.pubkey.clone().filter(|s| !s.trim().is_empty());
        }
        dbg.decoder_meta = Some(meta);

        let coords = location
            .as_ref()
            .and_then(|loc| Some((loc.lat?, loc.lon?)))
            .filter(|(lat, lon)| valid_lat_lon(*lat, *lon));

        let Some((lat, lon)) = coords else {
            dbg.result = "decoded_no_location".to_string();
            return (None, dbg);
        };

        let device_id = dbg
            .decoded_pubkey
            .clone()
            .or_else(|| dbg.origin_id.clone())
            .or_else(|| device_id_from_topic(topic));
        let Some(device_id) = device_id else {
            dbg.result = "decoded_no_device".to_string();
            return (None, dbg);
        };

        dbg.result = "decoded_packet".to_string();
        let parsed = ParsedPosition {
            device_id,
            lat,
            lon,
            ts: now(),
            name: dbg.device_name.clone(),
            role: dbg.device_role,
            ..ParsedPosition::default()
        };
        (Some(parsed), dbg)
    }

    /// Build a position from coordinates found directly in a JSON payload.
    fn position_from_json(
        &self,
        topic: &str,
        json: &Value,
        lat: f64,
        lon: f64,
        dbg: &DecodeDebug,
    ) -> Option<ParsedPosition> {
        let device_id = dbg
            .origin_id
            .clone()
            .or_else(|| device_id_from_topic(topic))?;
        let map = json.as_object();
        let num = |key: &str| map.and_then(|m| m.get(key)).and_then(value_as_f64);
        Some(ParsedPosition {
            device_id,
            lat,
            lon,
            ts: payload_ts(json).unwrap_or_else(now),
            heading: num("heading"),
            speed: num("speed"),
            rssi: num("rssi"),
            snr: num("snr"),
            name: dbg.device_name.clone(),
            role: dbg.device_role,
            raw_topic: None,
        })
    }
}

/// Plausible payload timestamp under `ts`/`timestamp`/`time`, with
/// millisecond values scaled down.
fn payload_ts(json: &Value) -> Option<f64> {
    let map = json.as_object()?;
    let raw = ["ts", "timestamp", "time"].iter().find_map(|k| map.get(*k)).and_then(value_as_f64)?;
    let secs = if raw > 1e12 { raw / 1000.0 } else { raw };
    let current = now();
    (secs > 1e9 && secs < current + 86_400.0).then_some(secs)
}

/// Stable short hash of a packet's bytes, used when the decoder reports no
/// message hash. Identical packet bytes hash identically no matter which
/// gateway relayed them, which is what fan-out detection needs.
pub fn packet_hash_hex(packet_hex: &str) -> String {
    let bytes = hex::decode(packet_hex.trim()).unwrap_or_else(|_| packet_hex.as_bytes().to_vec());
    let digest = Sha256::digest(&bytes);
    hex::encode(&digest[..8])
}
