//! Periodic TTL sweeps: stale devices, dead routes, aged history, heat,
//! the message-origin cache, the neighbor graph and the seen map.

use std::sync::Arc;
use std::time::Duration;

use mesh_types::ClientFrame;

use crate::broadcaster::broadcast_frame;
use crate::config::Config;
use crate::geo::{self, coords_are_zero};
use crate::history;
use crate::state::{AppState, Clients, SharedState};
use crate::topology;

const SWEEP_INTERVAL: Duration = Duration::from_secs(5);

pub async fn reaper(state: SharedState, clients: Clients, cfg: Arc<Config>) {
    loop {
        tokio::time::sleep(SWEEP_INTERVAL).await;
        let frames = {
            let mut st = state.write().await;
            sweep(&mut st, &cfg)
        };
        for frame in &frames {
            broadcast_frame(&clients, frame).await;
        }
    }
}

/// One reaper pass. Returns the housekeeping frames to broadcast.
pub(crate) fn sweep(st: &mut AppState, cfg: &Config) -> Vec<ClientFrame> {
    let now = geo::now();
    let mut frames = Vec::new();

    // 1: devices with no position inside the TTL.
    if cfg.device_ttl_seconds > 0.0 {
        let stale: Vec<String> = st
            .devices
            .iter()
            .filter(|(_, device)| now - device.ts > cfg.device_ttl_seconds)
            .map(|(id, _)| id.clone())
            .collect();
        if !stale.is_empty() {
            for device_id in &stale {
                st.devices.remove(device_id);
                st.trails.remove(device_id);
            }
            st.dirty = true;
            topology::rebuild_node_hash_map(st);
            frames.push(ClientFrame::Stale { device_ids: stale });
        }
    }

    // 2: routes that contain the zero sentinel.
    let bad_routes: Vec<String> = st
        .routes
        .iter()
        .filter(|(_, route)| route.points.iter().any(|p| coords_are_zero(p[0], p[1])))
        .map(|(id, _)| id.clone())
        .collect();
    if !bad_routes.is_empty() {
        for route_id in &bad_routes {
            st.routes.remove(route_id);
        }
        frames.push(ClientFrame::RouteRemove { route_ids: bad_routes });
    }

    // 3: routes past their expiry.
    let expired: Vec<String> = st
        .routes
        .iter()
        .filter(|(_, route)| now > route.expires_at)
        .map(|(id, _)| id.clone())
        .collect();
    if !expired.is_empty() {
        for route_id in &expired {
            st.routes.remove(route_id);
        }
        frames.push(ClientFrame::RouteRemove { route_ids: expired });
    }

    // 4: age history segments out of the window.
    let (updates, removed) = history::prune(&mut st.history, cfg, false);
    if !updates.is_empty() {
        frames.push(ClientFrame::HistoryEdges { edges: updates });
    }
    if !removed.is_empty() {
        frames.push(ClientFrame::HistoryEdgesRemove { edge_ids: removed });
    }

    // 5: heat events past their TTL.
    if cfg.heat_ttl_seconds > 0.0 && !st.heat_events.is_empty() {
        let cutoff = now - cfg.heat_ttl_seconds;
        st.heat_events.retain(|event| event.ts >= cutoff);
    }

    // 6: untouched message-origin entries.
    if cfg.message_origin_ttl_seconds > 0.0 {
        let ttl = cfg.message_origin_ttl_seconds;
        st.message_origins.retain(|_, origin| now - origin.ts <= ttl);
    }

    // 7: non-manual neighbor edges older than the device TTL.
    if cfg.device_ttl_seconds > 0.0 {
        let ttl = cfg.device_ttl_seconds;
        for targets in st.neighbor_edges.values_mut() {
            targets.retain(|_, edge| edge.manual || now - edge.last_seen <= ttl);
        }
        st.neighbor_edges.retain(|_, targets| !targets.is_empty());
    }

    // 8: the seen map, on a generous multiple of the device TTL.
    let prune_after = if cfg.device_ttl_seconds > 0.0 {
        (cfg.device_ttl_seconds * 3.0).max(900.0)
    } else {
        86_400.0
    };
    st.seen_devices.retain(|_, last| now - *last <= prune_after);

    frames
}
