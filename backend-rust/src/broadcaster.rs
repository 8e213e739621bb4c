//! Single-writer event loop: drains the ingest queue, mutates the live
//! state, and pushes JSON frames to every connected map client.
//!
//! Fan-out is best-effort: each frame is serialized once; a client whose
//! channel rejects the send is dropped from the registry. Slow consumers
//! are disconnected, never buffered.

use std::sync::Arc;

use tracing::debug;

use mesh_types::{ClientFrame, DeviceState, HistorySegment, Route, RouteMode, TrailPoint};

use crate::config::Config;
use crate::geo::{self, coords_are_zero, within_map_radius};
use crate::history;
use crate::state::{AppState, Clients, Event, EventRx, HeatEvent, RouteEvent, SharedState};
use crate::topology;

/// Serialize a frame once and push it to every client; drop clients whose
/// channel is gone.
pub async fn broadcast_frame(clients: &Clients, frame: &ClientFrame) {
    let text = match serde_json::to_string(frame) {
        Ok(text) => text,
        Err(_) => return,
    };
    let mut dead = Vec::new();
    {
        let map = clients.read().await;
        for (id, tx) in map.iter() {
            if tx.send(text.clone()).is_err() {
                dead.push(*id);
            }
        }
    }
    if !dead.is_empty() {
        let mut map = clients.write().await;
        for id in dead {
            map.remove(&id);
        }
    }
}

/// The broadcaster task: the only long-lived writer of map entities.
pub async fn broadcaster(state: SharedState, clients: Clients, cfg: Arc<Config>, mut rx: EventRx) {
    while let Some(event) = rx.recv().await {
        let (frames, journal) = {
            let mut st = state.write().await;
            apply_event(&mut st, &cfg, event)
        };
        history::append_journal(&cfg, &journal).await;
        for frame in &frames {
            broadcast_frame(&clients, frame).await;
        }
    }
}

/// Apply one queued event to the state. Returns the frames to broadcast and
/// any history segments to append to the journal.
pub(crate) fn apply_event(
    st: &mut AppState,
    cfg: &Config,
    event: Event,
) -> (Vec<ClientFrame>, Vec<HistorySegment>) {
    match event {
        Event::DeviceName { device_id } | Event::DeviceRole { device_id } => {
            let name = st.device_names.get(&device_id).cloned();
            let role = st.device_roles.get(&device_id).copied();
            let Some(device) = st.devices.get_mut(&device_id) else {
                return (Vec::new(), Vec::new());
            };
            if let Some(name) = name {
                device.name = Some(name);
            }
            if let Some(role) = role {
                device.role = Some(role);
            }
            let Some(payload) = st.device_payload(cfg, &device_id) else {
                return (Vec::new(), Vec::new());
            };
            let frame = ClientFrame::Update { device: payload, trail: st.trail_for(&device_id) };
            (vec![frame], Vec::new())
        }

        Event::DeviceSeen { device_id, last_seen_ts, mqtt_seen_ts } => {
            if !st.devices.contains_key(&device_id) {
                return (Vec::new(), Vec::new());
            }
            st.seen_devices.insert(device_id.clone(), last_seen_ts);
            if let Some(ts) = mqtt_seen_ts {
                st.mqtt_seen.insert(device_id.clone(), ts);
            }
            let frame = ClientFrame::DeviceSeen { device_id, last_seen_ts, mqtt_seen_ts };
            (vec![frame], Vec::new())
        }

        Event::DeviceRemove { device_id } => {
            if st.evict_device(&device_id) {
                (vec![ClientFrame::Stale { device_ids: vec![device_id] }], Vec::new())
            } else {
                (Vec::new(), Vec::new())
            }
        }

        Event::Route(ev) => apply_route(st, cfg, ev),
        Event::Position(parsed) => apply_position(st, cfg, parsed),
    }
}

fn apply_route(
    st: &mut AppState,
    cfg: &Config,
    ev: RouteEvent,
) -> (Vec<ClientFrame>, Vec<HistorySegment>) {
    let ts = if ev.ts > 0.0 { ev.ts } else { geo::now() };
    let mut route_mode = ev.route_mode;

    let mut resolved = topology::route_points_from_hashes(
        st,
        cfg,
        &ev.path_hashes,
        ev.origin_id.as_deref(),
        ev.receiver_id.as_deref(),
        ts,
    )
    .unwrap_or_default();

    if resolved.points.is_empty() {
        if let Some(points) =
            topology::route_points_from_device_ids(st, ev.origin_id.as_deref(), ev.receiver_id.as_deref())
        {
            if route_mode != Some(RouteMode::Fanout) {
                route_mode = Some(RouteMode::Direct);
            }
            resolved.points = points;
            resolved.point_ids = vec![ev.origin_id.clone(), ev.receiver_id.clone()];
        }
    }

    if resolved.points.is_empty() {
        return (Vec::new(), Vec::new());
    }
    if resolved
        .points
        .iter()
        .any(|p| !within_map_radius(cfg, p[0], p[1]))
    {
        debug!(topic = %ev.topic, "route dropped, point outside map radius");
        return (Vec::new(), Vec::new());
    }

    let route_id = ev
        .route_id
        .or_else(|| ev.message_hash.clone())
        .unwrap_or_else(|| {
            format!(
                "{}-{}",
                ev.origin_id.as_deref().unwrap_or("route"),
                (ts * 1000.0) as i64
            )
        });
    let route_mode = route_mode.unwrap_or(if resolved.hashes.is_empty() {
        RouteMode::Direct
    } else {
        RouteMode::Path
    });

    let route = Route {
        id: route_id.clone(),
        points: resolved.points.clone(),
        hashes: resolved.hashes,
        point_ids: resolved.point_ids.clone(),
        route_mode,
        ts,
        expires_at: ts + cfg.route_ttl_seconds,
        origin_id: ev.origin_id,
        receiver_id: ev.receiver_id,
        payload_type: ev.payload_type,
        message_hash: ev.message_hash,
        snr_values: ev.snr_values,
        topic: Some(ev.topic),
    };

    if cfg.heat_ttl_seconds > 0.0 {
        for point in &route.points {
            st.heat_events.push(HeatEvent { lat: point[0], lon: point[1], ts, weight: 0.7 });
        }
    }
    st.record_neighbors(&resolved.point_ids, ts);
    st.routes.insert(route_id, route.clone());

    let outcome = history::record(&mut st.history, cfg, &route);

    let wire_route = if cfg.prod_mode { route.sanitized() } else { route };
    let mut frames = vec![ClientFrame::Route { route: wire_route }];
    if !outcome.updates.is_empty() {
        frames.push(ClientFrame::HistoryEdges { edges: outcome.updates });
    }
    if !outcome.removed.is_empty() {
        frames.push(ClientFrame::HistoryEdgesRemove { edge_ids: outcome.removed });
    }
    (frames, outcome.appended)
}

fn apply_position(
    st: &mut AppState,
    cfg: &Config,
    parsed: crate::decoder::ParsedPosition,
) -> (Vec<ClientFrame>, Vec<HistorySegment>) {
    let device_id = parsed.device_id.clone();
    if !within_map_radius(cfg, parsed.lat, parsed.lon) {
        if st.evict_device(&device_id) {
            return (vec![ClientFrame::Stale { device_ids: vec![device_id] }], Vec::new());
        }
        return (Vec::new(), Vec::new());
    }

    let is_new = !st.devices.contains_key(&device_id);
    let name = parsed.name.clone().or_else(|| st.device_names.get(&device_id).cloned());
    let role = parsed.role.or_else(|| st.device_roles.get(&device_id).copied());
    let device = DeviceState {
        device_id: device_id.clone(),
        lat: parsed.lat,
        lon: parsed.lon,
        ts: parsed.ts,
        heading: parsed.heading,
        speed: parsed.speed,
        rssi: parsed.rssi,
        snr: parsed.snr,
        name: name.clone(),
        role,
        raw_topic: parsed.raw_topic,
    };
    st.devices.insert(device_id.clone(), device);
    st.seen_devices.insert(device_id.clone(), geo::now());
    st.dirty = true;

    if is_new {
        topology::rebuild_node_hash_map(st);
    }
    if let Some(name) = name {
        st.device_names.insert(device_id.clone(), name);
    }
    if let Some(role) = role {
        st.device_roles.insert(device_id.clone(), role);
    }

    // Trail refresh: capped, in-bounds, with non-decreasing timestamps.
    if cfg.trail_len > 0 && !coords_are_zero(parsed.lat, parsed.lon) {
        let trail = st.trails.entry(device_id.clone()).or_default();
        let point_ts = trail.last().map_or(parsed.ts, |last| parsed.ts.max(last.ts()));
        trail.push(TrailPoint(parsed.lat, parsed.lon, point_ts));
        let len = trail.len();
        if len > cfg.trail_len {
            trail.drain(..len - cfg.trail_len);
        }
    } else {
        st.trails.remove(&device_id);
    }

    let Some(payload) = st.device_payload(cfg, &device_id) else {
        return (Vec::new(), Vec::new());
    };
    let frame = ClientFrame::Update { device: payload, trail: st.trail_for(&device_id) };
    (vec![frame], Vec::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::ParsedPosition;
    use serde_json::json;

    fn test_cfg() -> Config {
        let mut cfg = Config::from_env();
        cfg.map_radius_km = 0.0;
        cfg.trail_len = 3;
        cfg.route_ttl_seconds = 90.0;
        cfg.heat_ttl_seconds = 1800.0;
        cfg.history_enabled = true;
        cfg.history_hours = 48.0;
        cfg.history_payload_types = [3].into_iter().collect();
        cfg.history_allowed_modes = ["path", "direct"].iter().map(|s| s.to_string()).collect();
        cfg.route_payload_types = [3].into_iter().collect();
        cfg
    }

    fn position(id: &str, lat: f64, lon: f64, ts: f64) -> ParsedPosition {
        ParsedPosition {
            device_id: id.to_string(),
            lat,
            lon,
            ts,
            raw_topic: Some(format!("mesh/v1/{id}/packets")),
            ..ParsedPosition::default()
        }
    }

    fn seed_device(st: &mut AppState, cfg: &Config, id: &str, lat: f64, lon: f64) {
        apply_event(st, cfg, Event::Position(position(id, lat, lon, geo::now())));
    }

    #[test]
    fn new_position_creates_device_and_update_frame() {
        let cfg = test_cfg();
        let mut st = AppState::new();
        let (frames, journal) =
            apply_event(&mut st, &cfg, Event::Position(position("AB123", 37.5, -122.3, 100.0)));
        assert!(journal.is_empty());
        assert_eq!(frames.len(), 1);
        match &frames[0] {
            ClientFrame::Update { device, trail } => {
                assert_eq!(device.state.device_id, "AB123");
                assert!(device.state.role.is_none());
                assert_eq!(trail.len(), 1);
            }
            other => panic!("expected update frame, got {other:?}"),
        }
        assert!(st.hash_to_device.contains_key("AB"));
        assert!(st.dirty);
    }

    #[test]
    fn trail_capped_and_monotonic() {
        let cfg = test_cfg();
        let mut st = AppState::new();
        for i in 0..5 {
            let ts = 100.0 + i as f64;
            apply_event(&mut st, &cfg, Event::Position(position("AB123", 37.5, -122.3, ts)));
        }
        // Out-of-order timestamp gets clamped.
        apply_event(&mut st, &cfg, Event::Position(position("AB123", 37.6, -122.3, 50.0)));
        let trail = &st.trails["AB123"];
        assert_eq!(trail.len(), cfg.trail_len);
        for pair in trail.windows(2) {
            assert!(pair[1].ts() >= pair[0].ts());
        }
    }

    #[test]
    fn out_of_radius_position_evicts() {
        let mut cfg = test_cfg();
        cfg.map_radius_km = 10.0;
        cfg.map_start_lat = 0.0;
        cfg.map_start_lon = 0.0;
        let mut st = AppState::new();
        seed_device(&mut st, &cfg, "DD001", 0.01, 0.01);
        assert!(st.devices.contains_key("DD001"));

        let (frames, _) =
            apply_event(&mut st, &cfg, Event::Position(position("DD001", 5.0, 5.0, 100.0)));
        match &frames[0] {
            ClientFrame::Stale { device_ids } => assert_eq!(device_ids, &vec!["DD001".to_string()]),
            other => panic!("expected stale frame, got {other:?}"),
        }
        assert!(!st.devices.contains_key("DD001"));

        // Unknown device out of radius: no frame at all.
        let (frames, _) =
            apply_event(&mut st, &cfg, Event::Position(position("EE002", 5.0, 5.0, 100.0)));
        assert!(frames.is_empty());
    }

    #[test]
    fn path_route_emits_route_history_and_heat() {
        let cfg = test_cfg();
        let mut st = AppState::new();
        seed_device(&mut st, &cfg, "AB100", 10.0, 10.0);
        seed_device(&mut st, &cfg, "CD200", 11.0, 11.0);
        seed_device(&mut st, &cfg, "EF300", 12.0, 12.0);
        seed_device(&mut st, &cfg, "GH400", 13.0, 13.0);
        let heat_before = st.heat_events.len();

        let ev = RouteEvent {
            path_hashes: vec![json!("CD"), json!("EF")],
            payload_type: Some(3),
            message_hash: Some("H9".into()),
            origin_id: Some("AB100".into()),
            receiver_id: Some("GH400".into()),
            ts: geo::now(),
            topic: "mesh/v1/GH400/packets".into(),
            ..RouteEvent::default()
        };
        let (frames, journal) = apply_event(&mut st, &cfg, Event::Route(ev));

        let route = match &frames[0] {
            ClientFrame::Route { route } => route,
            other => panic!("expected route frame, got {other:?}"),
        };
        assert_eq!(route.route_mode, RouteMode::Path);
        assert_eq!(route.points.len(), 4);
        assert_eq!(route.id, "H9");

        match &frames[1] {
            ClientFrame::HistoryEdges { edges } => assert_eq!(edges.len(), 3),
            other => panic!("expected history_edges frame, got {other:?}"),
        }
        assert_eq!(journal.len(), 3);
        assert_eq!(st.heat_events.len() - heat_before, 4);
        assert!(st.routes.contains_key("H9"));
        // Neighbor graph got every consecutive pair, both directions.
        assert_eq!(st.neighbor_edges["AB100"]["CD200"].count, 1);
        assert_eq!(st.neighbor_edges["GH400"]["EF300"].count, 1);
    }

    #[test]
    fn fanout_route_uses_cached_origin_pair() {
        let cfg = test_cfg();
        let mut st = AppState::new();
        seed_device(&mut st, &cfg, "TX100", 10.0, 10.0);
        seed_device(&mut st, &cfg, "RX200", 11.0, 11.0);

        let ev = RouteEvent {
            route_mode: Some(RouteMode::Fanout),
            route_id: Some("H1-RX200".into()),
            message_hash: Some("H1".into()),
            origin_id: Some("TX100".into()),
            receiver_id: Some("RX200".into()),
            payload_type: Some(3),
            ts: geo::now(),
            topic: "mesh/v1/RX200/packets".into(),
            ..RouteEvent::default()
        };
        let (frames, _) = apply_event(&mut st, &cfg, Event::Route(ev));
        let route = match &frames[0] {
            ClientFrame::Route { route } => route,
            other => panic!("expected route frame, got {other:?}"),
        };
        assert_eq!(route.id, "H1-RX200");
        assert_eq!(route.route_mode, RouteMode::Fanout);
        assert_eq!(route.points, vec![[10.0, 10.0], [11.0, 11.0]]);
    }

    #[test]
    fn direct_route_fallback() {
        let cfg = test_cfg();
        let mut st = AppState::new();
        seed_device(&mut st, &cfg, "OR100", 10.0, 10.0);
        seed_device(&mut st, &cfg, "RC200", 11.0, 11.0);

        let ev = RouteEvent {
            route_mode: Some(RouteMode::Direct),
            route_id: Some("direct-H7".into()),
            message_hash: Some("H7".into()),
            origin_id: Some("OR100".into()),
            receiver_id: Some("RC200".into()),
            payload_type: Some(3),
            ts: geo::now(),
            topic: "mesh/v1/RC200/packets".into(),
            ..RouteEvent::default()
        };
        let (frames, _) = apply_event(&mut st, &cfg, Event::Route(ev));
        let route = match &frames[0] {
            ClientFrame::Route { route } => route,
            other => panic!("expected route frame, got {other:?}"),
        };
        assert!(route.id.starts_with("direct-"));
        assert_eq!(route.route_mode, RouteMode::Direct);
        assert_eq!(route.points.len(), 2);
    }

    #[test]
    fn route_with_out_of_radius_point_dropped() {
        let mut cfg = test_cfg();
        // Wide enough to hold the devices first.
        let mut st = AppState::new();
        seed_device(&mut st, &cfg, "AB100", 0.01, 0.01);
        seed_device(&mut st, &cfg, "CD200", 5.0, 5.0);
        cfg.map_radius_km = 10.0;

        let ev = RouteEvent {
            origin_id: Some("AB100".into()),
            receiver_id: Some("CD200".into()),
            payload_type: Some(3),
            message_hash: Some("H2".into()),
            ts: geo::now(),
            topic: "mesh/v1/CD200/packets".into(),
            ..RouteEvent::default()
        };
        let (frames, _) = apply_event(&mut st, &cfg, Event::Route(ev));
        assert!(frames.is_empty());
        assert!(st.routes.is_empty());
    }

    #[test]
    fn unresolvable_route_is_silently_skipped() {
        let cfg = test_cfg();
        let mut st = AppState::new();
        let ev = RouteEvent {
            origin_id: Some("NO100".into()),
            receiver_id: Some("NO200".into()),
            payload_type: Some(3),
            ts: geo::now(),
            topic: "mesh/v1/NO200/packets".into(),
            ..RouteEvent::default()
        };
        let (frames, journal) = apply_event(&mut st, &cfg, Event::Route(ev));
        assert!(frames.is_empty());
        assert!(journal.is_empty());
    }

    #[test]
    fn name_event_updates_device_and_broadcasts() {
        let cfg = test_cfg();
        let mut st = AppState::new();
        seed_device(&mut st, &cfg, "AB100", 10.0, 10.0);
        st.device_names.insert("AB100".into(), "Summit".into());

        let (frames, _) =
            apply_event(&mut st, &cfg, Event::DeviceName { device_id: "AB100".into() });
        match &frames[0] {
            ClientFrame::Update { device, .. } => {
                assert_eq!(device.state.name.as_deref(), Some("Summit"));
            }
            other => panic!("expected update frame, got {other:?}"),
        }

        // Unknown device: nothing to broadcast.
        let (frames, _) =
            apply_event(&mut st, &cfg, Event::DeviceName { device_id: "ZZ999".into() });
        assert!(frames.is_empty());
    }

    #[test]
    fn seen_event_refreshes_liveness() {
        let cfg = test_cfg();
        let mut st = AppState::new();
        seed_device(&mut st, &cfg, "AB100", 10.0, 10.0);

        let (frames, _) = apply_event(
            &mut st,
            &cfg,
            Event::DeviceSeen { device_id: "AB100".into(), last_seen_ts: 999.0, mqtt_seen_ts: Some(998.0) },
        );
        assert_eq!(st.seen_devices["AB100"], 999.0);
        assert_eq!(st.mqtt_seen["AB100"], 998.0);
        assert!(matches!(frames[0], ClientFrame::DeviceSeen { .. }));
    }

    #[test]
    fn prod_mode_routes_are_sanitized() {
        let mut cfg = test_cfg();
        cfg.prod_mode = true;
        let mut st = AppState::new();
        seed_device(&mut st, &cfg, "OR100", 10.0, 10.0);
        seed_device(&mut st, &cfg, "RC200", 11.0, 11.0);

        let ev = RouteEvent {
            origin_id: Some("OR100".into()),
            receiver_id: Some("RC200".into()),
            payload_type: Some(3),
            message_hash: Some("H3".into()),
            ts: geo::now(),
            topic: "mesh/v1/RC200/packets".into(),
            ..RouteEvent::default()
        };
        let (frames, _) = apply_event(&mut st, &cfg, Event::Route(ev));
        match &frames[0] {
            ClientFrame::Route { route } => {
                assert!(route.origin_id.is_none());
                assert!(route.topic.is_none());
            }
            other => panic!("expected route frame, got {other:?}"),
        }
        // The stored route keeps its metadata.
        assert!(st.routes["H3"].origin_id.is_some());
    }
}
