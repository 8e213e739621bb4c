//! HTTP and WebSocket surface: the live socket, the pull snapshot, the
//! nodes API, per-device peer stats, and the stats/debug diagnostics.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::info;
use uuid::Uuid;

use mesh_types::{ClientFrame, DeviceRole};

use crate::auth::{require_prod_token, ws_authorized};
use crate::config::Config;
use crate::decoder::NodeDecoder;
use crate::geo::{self, coords_are_zero};
use crate::state::{AppState, Clients, SharedState};

#[derive(Clone)]
pub struct ApiCtx {
    pub state: SharedState,
    pub clients: Clients,
    pub cfg: Arc<Config>,
    pub node: Arc<NodeDecoder>,
    pub started_at: f64,
}

pub fn router(ctx: ApiCtx) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ws", get(ws_upgrade))
        .route("/snapshot", get(snapshot))
        .route("/api/nodes", get(api_nodes))
        .route("/peers/:device_id", get(peers))
        .route("/stats", get(stats))
        .route("/debug/last", get(debug_last))
        .route("/debug/status", get(debug_status))
        .with_state(ctx)
}

// ── Helpers ───────────────────────────────────────────────────────────────────

fn iso_from_ts(ts: f64) -> Option<String> {
    let secs = ts as i64;
    match Utc.timestamp_opt(secs, 0) {
        chrono::LocalResult::Single(dt) => {
            Some(dt.to_rfc3339_opts(SecondsFormat::Secs, true))
        }
        _ => None,
    }
}

fn parse_updated_since(value: &str) -> Option<f64> {
    let text = value.trim();
    if text.is_empty() {
        return None;
    }
    DateTime::parse_from_rfc3339(text)
        .ok()
        .map(|dt| dt.timestamp_millis() as f64 / 1000.0)
}

/// Snapshot frame shared by the socket greeting and the pull endpoint.
pub fn snapshot_frame(st: &AppState, cfg: &Config, server_time: Option<f64>) -> ClientFrame {
    let now = geo::now();
    let devices = st
        .devices
        .keys()
        .filter_map(|id| st.device_payload(cfg, id).map(|p| (id.clone(), p)))
        .collect();
    let routes = st
        .routes
        .values()
        .filter(|r| r.expires_at > now)
        .map(|r| if cfg.prod_mode { r.sanitized() } else { r.clone() })
        .collect();
    ClientFrame::Snapshot {
        devices,
        trails: st.trails.clone(),
        routes,
        history_edges: st.history.edges.values().cloned().collect(),
        history_window_seconds: cfg.history_window_seconds() as u64,
        heat: st.serialize_heat(cfg),
        update: st.update_info.clone(),
        server_time,
    }
}

fn node_api_payload(st: &AppState, device_id: &str) -> Option<Value> {
    let device = st.devices.get(device_id)?;
    let last_seen = st.seen_devices.get(device_id).copied().unwrap_or(device.ts);
    let last_seen_iso = iso_from_ts(last_seen);
    let role = device.role.or_else(|| st.device_roles.get(device_id).copied());
    let role_code = role.map_or(1, DeviceRole::code);
    let name = device
        .name
        .clone()
        .or_else(|| st.device_names.get(device_id).cloned())
        .unwrap_or_default();
    Some(json!({
        "public_key": device_id,
        "name": name,
        "device_role": role_code,
        "role": role,
        "location": {
            "latitude": device.lat,
            "longitude": device.lon,
        },
        "lat": device.lat,
        "lon": device.lon,
        "last_seen_ts": last_seen,
        "last_seen": last_seen_iso,
        "timestamp": last_seen as i64,
        "first_seen": last_seen_iso,
        "battery_voltage": 0,
    }))
}

/// Peers whose display name sits in the forced-online set are hidden from
/// the stats (they are broker artifacts, not radio neighbors).
fn peer_is_excluded(st: &AppState, cfg: &Config, peer_id: &str) -> bool {
    if cfg.online_force_names.is_empty() {
        return false;
    }
    let name = st
        .devices
        .get(peer_id)
        .and_then(|d| d.name.clone())
        .or_else(|| st.device_names.get(peer_id).cloned())
        .unwrap_or_default();
    let name = name.trim().to_ascii_lowercase();
    !name.is_empty() && cfg.online_force_names.contains(&name)
}

fn peer_device_payload(
    st: &AppState,
    peer_id: &str,
    count: u64,
    total: u64,
    last_ts: Option<f64>,
) -> Value {
    let device = st.devices.get(peer_id);
    let name = device
        .and_then(|d| d.name.clone())
        .or_else(|| st.device_names.get(peer_id).cloned())
        .unwrap_or_default();
    let role = device
        .and_then(|d| d.role)
        .or_else(|| st.device_roles.get(peer_id).copied());
    let (lat, lon) = device
        .filter(|d| !coords_are_zero(d.lat, d.lon))
        .map_or((None, None), |d| (Some(d.lat), Some(d.lon)));
    let percent = if total > 0 {
        (count as f64 / total as f64 * 1000.0).round() / 10.0
    } else {
        0.0
    };
    json!({
        "peer_id": peer_id,
        "name": name,
        "role": role,
        "lat": lat,
        "lon": lon,
        "count": count,
        "percent": percent,
        "last_seen_ts": last_ts,
    })
}

/// Directed peer totals for one device, from the history segment deque.
fn peer_stats_for_device(st: &AppState, cfg: &Config, device_id: &str, limit: usize) -> Value {
    let mut inbound: HashMap<String, u64> = HashMap::new();
    let mut outbound: HashMap<String, u64> = HashMap::new();
    let mut inbound_last: HashMap<String, f64> = HashMap::new();
    let mut outbound_last: HashMap<String, f64> = HashMap::new();

    for segment in &st.history.segments {
        let (Some(a_id), Some(b_id)) = (&segment.a_id, &segment.b_id) else {
            continue;
        };
        if a_id == device_id && b_id != device_id {
            if peer_is_excluded(st, cfg, b_id) {
                continue;
            }
            *outbound.entry(b_id.clone()).or_insert(0) += 1;
            let last = outbound_last.entry(b_id.clone()).or_insert(0.0);
            *last = last.max(segment.ts);
        }
        if b_id == device_id && a_id != device_id {
            if peer_is_excluded(st, cfg, a_id) {
                continue;
            }
            *inbound.entry(a_id.clone()).or_insert(0) += 1;
            let last = inbound_last.entry(a_id.clone()).or_insert(0.0);
            *last = last.max(segment.ts);
        }
    }

    let inbound_total: u64 = inbound.values().sum();
    let outbound_total: u64 = outbound.values().sum();

    let build = |counts: HashMap<String, u64>, lasts: &HashMap<String, f64>, total: u64| {
        let mut items: Vec<Value> = counts
            .iter()
            .map(|(peer, count)| {
                peer_device_payload(st, peer, *count, total, lasts.get(peer).copied())
            })
            .collect();
        items.sort_by(|x, y| {
            y["count"].as_u64().unwrap_or(0).cmp(&x["count"].as_u64().unwrap_or(0))
        });
        if limit > 0 {
            items.truncate(limit);
        }
        items
    };

    let incoming = build(inbound, &inbound_last, inbound_total);
    let outgoing = build(outbound, &outbound_last, outbound_total);

    json!({
        "device_id": device_id,
        "incoming_total": inbound_total,
        "outgoing_total": outbound_total,
        "incoming": incoming,
        "outgoing": outgoing,
        "window_hours": cfg.history_hours,
    })
}

// ── Endpoints ─────────────────────────────────────────────────────────────────

async fn health(State(ctx): State<ApiCtx>) -> Json<Value> {
    let uptime = (geo::now() - ctx.started_at).max(0.0) as u64;
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": uptime,
    }))
}

async fn snapshot(
    State(ctx): State<ApiCtx>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    if let Err(code) = require_prod_token(&ctx.cfg, &headers, &query) {
        return code.into_response();
    }
    let st = ctx.state.read().await;
    let frame = snapshot_frame(&st, &ctx.cfg, Some(geo::now()));
    Json(frame).into_response()
}

async fn api_nodes(
    State(ctx): State<ApiCtx>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    if let Err(code) = require_prod_token(&ctx.cfg, &headers, &query) {
        return code.into_response();
    }
    let updated_since = query.get("updated_since").map(String::as_str);
    let cutoff = updated_since.and_then(parse_updated_since);
    let mode = query.get("mode").map(|m| m.trim().to_ascii_lowercase()).unwrap_or_default();
    let apply_delta = matches!(mode.as_str(), "delta" | "updates" | "since");
    let format = query.get("format").map(|f| f.trim().to_ascii_lowercase()).unwrap_or_default();
    let format_flat = matches!(format.as_str(), "flat" | "list" | "legacy" | "v1");

    let st = ctx.state.read().await;
    let mut nodes: Vec<Value> = Vec::new();
    let mut max_last_seen = 0.0f64;
    for device_id in st.devices.keys() {
        let Some(payload) = node_api_payload(&st, device_id) else {
            continue;
        };
        let last_seen = payload["last_seen_ts"].as_f64().unwrap_or(0.0);
        max_last_seen = max_last_seen.max(last_seen);
        if apply_delta {
            if let Some(cutoff) = cutoff {
                if last_seen < cutoff {
                    continue;
                }
            }
        }
        nodes.push(payload);
    }
    nodes.sort_by(|x, y| {
        x["public_key"].as_str().unwrap_or("").cmp(y["public_key"].as_str().unwrap_or(""))
    });

    let data = if format_flat { json!(nodes) } else { json!({ "nodes": nodes }) };
    Json(json!({
        "server_time": geo::now(),
        "max_last_seen_ts": (max_last_seen > 0.0).then_some(max_last_seen),
        "updated_since_applied": apply_delta && cutoff.is_some(),
        "updated_since_ignored": updated_since.is_some() && !apply_delta,
        "data": data,
    }))
    .into_response()
}

async fn peers(
    State(ctx): State<ApiCtx>,
    Path(device_id): Path<String>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    if let Err(code) = require_prod_token(&ctx.cfg, &headers, &query) {
        return code.into_response();
    }
    if device_id.is_empty() {
        return StatusCode::BAD_REQUEST.into_response();
    }
    let limit = query
        .get("limit")
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(8)
        .clamp(1, 50);

    let st = ctx.state.read().await;
    let mut payload = peer_stats_for_device(&st, &ctx.cfg, &device_id, limit);
    let device = st.devices.get(&device_id);
    if let Some(device) = device.filter(|d| !coords_are_zero(d.lat, d.lon)) {
        payload["lat"] = json!(device.lat);
        payload["lon"] = json!(device.lon);
    }
    payload["name"] = json!(device
        .and_then(|d| d.name.clone())
        .or_else(|| st.device_names.get(&device_id).cloned())
        .unwrap_or_default());
    payload["role"] = json!(device
        .and_then(|d| d.role)
        .or_else(|| st.device_roles.get(&device_id).copied()));
    payload["last_seen_ts"] = json!(st
        .seen_devices
        .get(&device_id)
        .copied()
        .or_else(|| device.map(|d| d.ts)));
    payload["server_time"] = json!(geo::now());
    Json(payload).into_response()
}

async fn stats(State(ctx): State<ApiCtx>) -> Json<Value> {
    let cfg = &ctx.cfg;
    let st = ctx.state.read().await;
    if cfg.prod_mode {
        return Json(json!({
            "stats": {
                "received_total": st.stats.received_total,
                "parsed_total": st.stats.parsed_total,
                "unparsed_total": st.stats.unparsed_total,
                "last_rx_ts": st.stats.last_rx_ts,
                "last_parsed_ts": st.stats.last_parsed_ts,
            },
            "result_counts": st.result_counts,
            "mapped_devices": st.devices.len(),
            "route_count": st.routes.len(),
            "history_edge_count": st.history.edges.len(),
            "seen_devices": st.seen_devices.len(),
            "server_time": geo::now(),
        }));
    }

    let mut top_topics: Vec<(&String, &u64)> = st.topic_counts.iter().collect();
    top_topics.sort_by(|x, y| y.1.cmp(x.1));
    top_topics.truncate(20);
    let mut seen_recent: Vec<(&String, &f64)> = st.seen_devices.iter().collect();
    seen_recent.sort_by(|x, y| y.1.total_cmp(x.1));
    seen_recent.truncate(20);
    let mut route_types: Vec<i64> = cfg.route_payload_types.iter().copied().collect();
    route_types.sort_unstable();

    Json(json!({
        "stats": st.stats,
        "result_counts": st.result_counts,
        "mapped_devices": st.devices.len(),
        "route_count": st.routes.len(),
        "history_edge_count": st.history.edges.len(),
        "history_segments": st.history.segments.len(),
        "seen_devices": st.seen_devices.len(),
        "seen_recent": seen_recent,
        "top_topics": top_topics,
        "decoder": {
            "decode_with_node": cfg.decode_with_node,
            "node_ready": ctx.node.is_ready(),
            "node_unavailable": ctx.node.is_unavailable(),
        },
        "route_payload_types": route_types,
        "direct_coords": {
            "mode": format!("{:?}", cfg.direct_coords_mode).to_lowercase(),
            "topic_regex": cfg.direct_coords_topic_regex,
            "regex_valid": cfg.direct_coords_topic_re.is_some(),
            "allow_zero": cfg.direct_coords_allow_zero,
        },
        "server_time": geo::now(),
    }))
}

async fn debug_last(State(ctx): State<ApiCtx>) -> Response {
    if ctx.cfg.prod_mode {
        return StatusCode::NOT_FOUND.into_response();
    }
    let st = ctx.state.read().await;
    let items: Vec<_> = st.debug_last.iter().rev().collect();
    Json(json!({
        "count": items.len(),
        "items": items,
        "server_time": geo::now(),
    }))
    .into_response()
}

async fn debug_status(State(ctx): State<ApiCtx>) -> Response {
    if ctx.cfg.prod_mode {
        return StatusCode::NOT_FOUND.into_response();
    }
    let st = ctx.state.read().await;
    let items: Vec<_> = st.status_last.iter().rev().collect();
    Json(json!({
        "count": items.len(),
        "items": items,
        "server_time": geo::now(),
    }))
    .into_response()
}

// ── Live socket ───────────────────────────────────────────────────────────────

async fn ws_upgrade(
    State(ctx): State<ApiCtx>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
    upgrade: WebSocketUpgrade,
) -> Response {
    let authorized = ws_authorized(&ctx.cfg, &headers, &query);
    upgrade.on_upgrade(move |socket| client_session(ctx, socket, authorized))
}

/// One connected map client. The broadcaster pushes serialized frames into
/// this client's channel; we forward them and discard anything inbound.
async fn client_session(ctx: ApiCtx, socket: WebSocket, authorized: bool) {
    let (mut sink, mut stream) = socket.split();
    if !authorized {
        let _ = sink
            .send(Message::Close(Some(axum::extract::ws::CloseFrame {
                code: 1008,
                reason: "unauthorized".into(),
            })))
            .await;
        return;
    }

    let client_id = Uuid::new_v4();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    // Initial snapshot goes through the same channel as live frames so the
    // client never sees a frame older than its snapshot.
    {
        let st = ctx.state.read().await;
        let frame = snapshot_frame(&st, &ctx.cfg, None);
        if let Ok(text) = serde_json::to_string(&frame) {
            let _ = tx.send(text);
        }
    }
    ctx.clients.write().await.insert(client_id, tx);
    info!(client = %client_id, "map client connected");

    loop {
        tokio::select! {
            frame = rx.recv() => {
                match frame {
                    Some(text) => {
                        if sink.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            inbound = stream.next() => {
                match inbound {
                    // Inbound frames are discarded; only disconnects matter.
                    Some(Ok(_)) => {}
                    Some(Err(_)) | None => break,
                }
            }
        }
    }

    ctx.clients.write().await.remove(&client_id);
    info!(client = %client_id, "map client disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesh_types::{DeviceState, HistorySegment};

    fn device(id: &str, lat: f64, lon: f64, ts: f64) -> DeviceState {
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
        }
    }

    fn segment(a_id: &str, b_id: &str, ts: f64) -> HistorySegment {
        HistorySegment {
            ts,
            a: [1.0, 1.0],
            b: [2.0, 2.0],
            a_id: Some(a_id.to_string()),
            b_id: Some(b_id.to_string()),
            message_hash: None,
            payload_type: Some(3),
            origin_id: None,
            receiver_id: None,
            route_mode: None,
            topic: None,
        }
    }

    #[test]
    fn iso_rendering_and_parsing() {
        let iso = iso_from_ts(1_700_000_000.0).unwrap();
        assert!(iso.ends_with('Z'));
        let back = parse_updated_since(&iso).unwrap();
        assert_eq!(back, 1_700_000_000.0);
        assert!(parse_updated_since("not a date").is_none());
    }

    #[test]
    fn peer_stats_directionality_and_exclusion() {
        let mut cfg = Config::from_env();
        cfg.online_force_names = ["gateway".to_string()].into_iter().collect();
        cfg.history_hours = 48.0;

        let mut st = AppState::new();
        st.devices.insert("ME1".into(), device("ME1", 1.0, 1.0, 100.0));
        st.devices.insert("PEER2".into(), device("PEER2", 2.0, 2.0, 100.0));
        let mut gw = device("GW3", 3.0, 3.0, 100.0);
        gw.name = Some("Gateway".into());
        st.devices.insert("GW3".into(), gw);

        st.history.segments.push_back(segment("ME1", "PEER2", 10.0));
        st.history.segments.push_back(segment("ME1", "PEER2", 20.0));
        st.history.segments.push_back(segment("PEER2", "ME1", 30.0));
        st.history.segments.push_back(segment("ME1", "GW3", 40.0));

        let payload = peer_stats_for_device(&st, &cfg, "ME1", 8);
        assert_eq!(payload["outgoing_total"], 2);
        assert_eq!(payload["incoming_total"], 1);
        let outgoing = payload["outgoing"].as_array().unwrap();
        assert_eq!(outgoing.len(), 1);
        assert_eq!(outgoing[0]["peer_id"], "PEER2");
        assert_eq!(outgoing[0]["count"], 2);
        assert_eq!(outgoing[0]["percent"], 100.0);
        assert_eq!(outgoing[0]["last_seen_ts"], 20.0);
    }

    #[test]
    fn peer_stats_limit_applied() {
        let cfg = Config::from_env();
        let mut st = AppState::new();
        for i in 0..5 {
            let peer = format!("P{i}00");
            st.history.segments.push_back(segment("ME1", &peer, i as f64));
        }
        let payload = peer_stats_for_device(&st, &cfg, "ME1", 2);
        assert_eq!(payload["outgoing"].as_array().unwrap().len(), 2);
        assert_eq!(payload["outgoing_total"], 5);
    }

    #[test]
    fn node_payload_role_codes() {
        let mut st = AppState::new();
        let mut dev = device("AB1", 1.0, 2.0, 100.0);
        dev.role = Some(DeviceRole::Repeater);
        st.devices.insert("AB1".into(), dev);
        st.devices.insert("CD2".into(), device("CD2", 3.0, 4.0, 100.0));
        st.seen_devices.insert("AB1".into(), 160.0);

        let payload = node_api_payload(&st, "AB1").unwrap();
        assert_eq!(payload["device_role"], 2);
        assert_eq!(payload["role"], "repeater");
        assert_eq!(payload["last_seen_ts"], 160.0);
        assert_eq!(payload["location"]["latitude"], 1.0);

        // Unset role defaults to companion code 1.
        let payload = node_api_payload(&st, "CD2").unwrap();
        assert_eq!(payload["device_role"], 1);
        assert_eq!(payload["role"], Value::Null);
    }

    #[test]
    fn snapshot_excludes_expired_routes() {
        let cfg = Config::from_env();
        let mut st = AppState::new();
        let now = geo::now();
        st.routes.insert(
            "live".into(),
            mesh_types::Route {
                id: "live".into(),
                points: vec![[1.0, 1.0], [2.0, 2.0]],
                hashes: Vec::new(),
                point_ids: Vec::new(),
                route_mode: mesh_types::RouteMode::Direct,
                ts: now,
                expires_at: now + 60.0,
                origin_id: None,
                receiver_id: None,
                payload_type: None,
                message_hash: None,
                snr_values: None,
                topic: None,
            },
        );
        let mut dead = st.routes["live"].clone();
        dead.id = "dead".into();
        dead.expires_at = now - 1.0;
        st.routes.insert("dead".into(), dead);

        let frame = snapshot_frame(&st, &cfg, Some(now));
        match frame {
            ClientFrame::Snapshot { routes, server_time, .. } => {
                assert_eq!(routes.len(), 1);
                assert_eq!(routes[0].id, "live");
                assert!(server_time.is_some());
            }
            other => panic!("expected snapshot, got {other:?}"),
        }
    }
}
