//! Rolling edge-frequency history.
//!
//! Every recorded route contributes one segment per consecutive point pair.
//! Segments live in a time-ordered deque and as lines of an append-only
//! journal; undirected edges keyed by canonical coordinates carry a count
//! that always equals the number of live segments sharing the key.
//!
//! Key contract: endpoints are rounded half-away-from-zero to six decimals,
//! the pair sorted lexicographically, and rendered as
//! `"{lat},{lon}|{lat},{lon}"` with six fixed decimals. The journal files
//! encode this format; keep it bit-exact.

use std::path::Path;

use anyhow::{Context, Result};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

use mesh_types::{HistoryEdge, HistorySample, HistorySegment, Route};

use crate::config::Config;
use crate::geo::{self, coords_are_zero, round6, within_map_radius};
use crate::state::{HistoryStore, SharedState};

/// Result of recording one route into the history store.
#[derive(Debug, Default)]
pub struct RecordOutcome {
    pub updates: Vec<HistoryEdge>,
    pub removed: Vec<String>,
    /// Segments to append to the journal.
    pub appended: Vec<HistorySegment>,
}

/// Round, validate and bound one polyline endpoint.
fn normalize_point(cfg: &Config, point: [f64; 2]) -> Option<(f64, f64)> {
    let (lat, lon) = (point[0], point[1]);
    if !lat.is_finite() || !lon.is_finite() {
        return None;
    }
    if coords_are_zero(lat, lon) {
        return None;
    }
    if !within_map_radius(cfg, lat, lon) {
        return None;
    }
    Some((round6(lat), round6(lon)))
}

/// Canonical key for an undirected pair, plus the endpoints in key order.
pub fn edge_key(a: (f64, f64), b: (f64, f64)) -> (String, (f64, f64), (f64, f64)) {
    let (first, second) = if a <= b { (a, b) } else { (b, a) };
    let key = format!(
        "{:.6},{:.6}|{:.6},{:.6}",
        first.0, first.1, second.0, second.1
    );
    (key, first, second)
}

fn sample_from_route(route: &Route, ts: f64) -> HistorySample {
    HistorySample {
        ts,
        message_hash: route.message_hash.clone(),
        payload_type: route.payload_type,
        origin_id: route.origin_id.clone(),
        receiver_id: route.receiver_id.clone(),
        route_mode: Some(route.route_mode),
        topic: route.topic.clone(),
    }
}

/// Push a sample onto an edge's recent ring, newest first, capped.
fn push_recent(edge: &mut HistoryEdge, sample: HistorySample, limit: usize) {
    edge.recent.push(sample);
    edge.recent.sort_by(|x, y| y.ts.total_cmp(&x.ts));
    edge.recent.truncate(limit.max(1));
}

fn payload_allowed(cfg: &Config, payload_type: Option<i64>) -> bool {
    if !cfg.history_enabled || cfg.history_hours <= 0.0 {
        return false;
    }
    if cfg.history_payload_types.is_empty() {
        return true;
    }
    match payload_type {
        Some(pt) => cfg.history_payload_types.contains(&pt),
        None => false,
    }
}

/// Record every segment of a route. Pure in-memory; the caller appends
/// `appended` to the journal afterwards.
pub fn record(history: &mut HistoryStore, cfg: &Config, route: &Route) -> RecordOutcome {
    let mut out = RecordOutcome::default();
    if !cfg.history_enabled {
        return out;
    }
    if !cfg.history_allowed_modes.is_empty()
        && !cfg.history_allowed_modes.contains(route.route_mode.as_str())
    {
        return out;
    }
    if !payload_allowed(cfg, route.payload_type) {
        return out;
    }
    if route.points.len() < 2 {
        return out;
    }

    let ts = if route.ts > 0.0 { route.ts } else { geo::now() };
    let sample = sample_from_route(route, ts);
    let mut updated_keys: Vec<String> = Vec::new();

    for idx in 0..route.points.len() - 1 {
        let Some(a) = normalize_point(cfg, route.points[idx]) else {
            continue;
        };
        let Some(b) = normalize_point(cfg, route.points[idx + 1]) else {
            continue;
        };
        // Ids stay in travel order even though the endpoints sort.
        let a_id = route.point_ids.get(idx).cloned().flatten();
        let b_id = route.point_ids.get(idx + 1).cloned().flatten();
        let (key, first, second) = edge_key(a, b);

        out.appended.push(HistorySegment {
            ts,
            a: [first.0, first.1],
            b: [second.0, second.1],
            a_id,
            b_id,
            message_hash: sample.message_hash.clone(),
            payload_type: sample.payload_type,
            origin_id: sample.origin_id.clone(),
            receiver_id: sample.receiver_id.clone(),
            route_mode: sample.route_mode,
            topic: sample.topic.clone(),
        });

        let edge = history.edges.entry(key.clone()).or_insert_with(|| HistoryEdge {
            id: key.clone(),
            a: [first.0, first.1],
            b: [second.0, second.1],
            count: 0,
            last_ts: ts,
            recent: Vec::new(),
        });
        edge.count += 1;
        edge.last_ts = edge.last_ts.max(ts);
        push_recent(edge, sample.clone(), cfg.history_sample_limit);
        if !updated_keys.contains(&key) {
            updated_keys.push(key);
        }
    }

    if out.appended.is_empty() {
        return out;
    }
    history.segments.extend(out.appended.iter().cloned());

    out.updates = updated_keys
        .iter()
        .filter_map(|k| history.edges.get(k).cloned())
        .collect();

    if cfg.history_max_segments > 0 && history.segments.len() > cfg.history_max_segments {
        let (extra_updates, extra_removed) = prune(history, cfg, true);
        // A forced prune may have touched edges we just reported; keep the
        // freshest copy of each.
        for upd in extra_updates {
            if let Some(slot) = out.updates.iter_mut().find(|e| e.id == upd.id) {
                *slot = upd;
            } else {
                out.updates.push(upd);
            }
        }
        out.updates.retain(|e| !extra_removed.contains(&e.id));
        out.removed.extend(extra_removed);
    }

    out
}

/// Age segments out of the window (or down to the size cap when forced),
/// decrementing edge counts and dropping zero-count edges.
pub fn prune(history: &mut HistoryStore, cfg: &Config, force_limit: bool) -> (Vec<HistoryEdge>, Vec<String>) {
    if !cfg.history_enabled || history.segments.is_empty() {
        return (Vec::new(), Vec::new());
    }

    let now = geo::now();
    let cutoff = now - cfg.history_window_seconds();
    let mut updated: Vec<String> = Vec::new();
    let mut removed: Vec<String> = Vec::new();

    loop {
        let pop = match history.segments.front() {
            None => false,
            Some(_) if force_limit => {
                cfg.history_max_segments > 0 && history.segments.len() > cfg.history_max_segments
            }
            Some(entry) => entry.ts < cutoff,
        };
        if !pop {
            break;
        }
        let Some(entry) = history.segments.pop_front() else {
            break;
        };
        history.compact_dirty = true;

        let a = normalize_point(cfg, entry.a);
        let b = normalize_point(cfg, entry.b);
        let (Some(a), Some(b)) = (a, b) else {
            continue;
        };
        let (key, _, _) = edge_key(a, b);
        let Some(edge) = history.edges.get_mut(&key) else {
            continue;
        };
        edge.count -= 1;
        edge.recent.retain(|s| s.ts >= cutoff);
        if edge.count <= 0 {
            history.edges.remove(&key);
            updated.retain(|k| k != &key);
            removed.push(key);
        } else if !updated.contains(&key) {
            updated.push(key);
        }
    }

    let updates = updated
        .iter()
        .filter_map(|k| history.edges.get(k).cloned())
        .collect();
    (updates, removed)
}

/// Append freshly recorded segments to the journal, one JSON line each.
pub async fn append_journal(cfg: &Config, segments: &[HistorySegment]) {
    if !cfg.history_enabled || segments.is_empty() {
        return;
    }
    if let Err(e) = append_journal_inner(&cfg.history_file, segments).await {
        warn!(file = %cfg.history_file.display(), error = %e, "failed to append history journal");
    }
}

async fn append_journal_inner(path: &Path, segments: &[HistorySegment]) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.ok();
    }
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .context("open journal")?;
    let mut buf = String::new();
    for segment in segments {
        buf.push_str(&serde_json::to_string(segment)?);
        buf.push('\n');
    }
    file.write_all(buf.as_bytes()).await.context("write journal")?;
    Ok(())
}

/// Rebuild the in-memory history from the journal at startup. Malformed or
/// expired lines are skipped and schedule a compaction.
pub async fn load_journal(history: &mut HistoryStore, cfg: &Config) {
    if !cfg.history_enabled || !cfg.history_file.exists() {
        return;
    }
    let data = match tokio::fs::read_to_string(&cfg.history_file).await {
        Ok(data) => data,
        Err(e) => {
            warn!(file = %cfg.history_file.display(), error = %e, "failed to read history journal");
            return;
        }
    };

    let cutoff = geo::now() - cfg.history_window_seconds();
    let mut loaded = 0usize;

    for line in data.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Ok(entry) = serde_json::from_str::<HistorySegment>(line) else {
            history.compact_dirty = true;
            continue;
        };
        if entry.ts < cutoff {
            history.compact_dirty = true;
            continue;
        }
        let a = normalize_point(cfg, entry.a);
        let b = normalize_point(cfg, entry.b);
        let (Some(a), Some(b)) = (a, b) else {
            history.compact_dirty = true;
            continue;
        };
        let (key, first, second) = edge_key(a, b);
        let sample = HistorySample {
            ts: entry.ts,
            message_hash: entry.message_hash.clone(),
            payload_type: entry.payload_type,
            origin_id: entry.origin_id.clone(),
            receiver_id: entry.receiver_id.clone(),
            route_mode: entry.route_mode,
            topic: entry.topic.clone(),
        };
        history.segments.push_back(HistorySegment {
            a: [first.0, first.1],
            b: [second.0, second.1],
            ..entry
        });
        let edge = history.edges.entry(key.clone()).or_insert_with(|| HistoryEdge {
            id: key,
            a: [first.0, first.1],
            b: [second.0, second.1],
            count: 0,
            last_ts: sample.ts,
            recent: Vec::new(),
        });
        edge.count += 1;
        edge.last_ts = edge.last_ts.max(sample.ts);
        push_recent(edge, sample, cfg.history_sample_limit);
        loaded += 1;
    }

    if loaded == 0 {
        return;
    }
    if cfg.history_max_segments > 0 && history.segments.len() > cfg.history_max_segments {
        prune(history, cfg, true);
        history.compact_dirty = true;
    }
    info!(
        segments = history.segments.len(),
        edges = history.edges.len(),
        "history journal loaded"
    );
}

/// Background journal compaction: rewrite the file atomically when pruning
/// has dropped lines, rate-limited to the configured interval.
pub async fn compactor_task(state: SharedState, cfg: std::sync::Arc<Config>) {
    if !cfg.history_enabled {
        return;
    }
    let sleep = cfg.history_compact_interval.max(5.0);
    loop {
        tokio::time::sleep(std::time::Duration::from_secs_f64(sleep)).await;
        let now = geo::now();
        {
            let st = state.read().await;
            if !st.history.compact_dirty
                || now - st.history.last_compact < cfg.history_compact_interval
            {
                continue;
            }
        }

        let lines = {
            let st = state.read().await;
            let mut buf = String::new();
            for segment in &st.history.segments {
                match serde_json::to_string(segment) {
                    Ok(line) => {
                        buf.push_str(&line);
                        buf.push('\n');
                    }
                    Err(e) => warn!(error = %e, "unserializable history segment skipped"),
                }
            }
            buf
        };

        match rewrite_journal(&cfg.history_file, &lines).await {
            Ok(()) => {
                let mut st = state.write().await;
                st.history.last_compact = now;
                st.history.compact_dirty = false;
            }
            Err(e) => {
                warn!(file = %cfg.history_file.display(), error = %e, "history compaction failed");
            }
        }
    }
}

async fn rewrite_journal(path: &Path, lines: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.ok();
    }
    let tmp = path.with_extension("jsonl.tmp");
    tokio::fs::write(&tmp, lines).await.context("write tmp journal")?;
    tokio::fs::rename(&tmp, path).await.context("rename journal")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesh_types::RouteMode;

    fn history_cfg() -> Config {
        let mut cfg = Config::from_env();
        cfg.history_enabled = true;
        cfg.history_hours = 24.0;
        cfg.history_max_segments = 0;
        cfg.history_sample_limit = 5;
        cfg.history_payload_types = [3, 4].into_iter().collect();
        cfg.history_allowed_modes = ["path", "direct"].iter().map(|s| s.to_string()).collect();
        cfg.map_radius_km = 0.0;
        cfg
    }

    fn route(points: Vec<[f64; 2]>, mode: RouteMode, payload_type: Option<i64>) -> Route {
        let ts = geo::now();
        Route {
            id: "r1".into(),
            points,
            hashes: Vec::new(),
            point_ids: vec![Some("A1".into()), Some("B2".into())],
            route_mode: mode,
            ts,
            expires_at: ts + 90.0,
            origin_id: Some("A1".into()),
            receiver_id: Some("B2".into()),
            payload_type,
            message_hash: Some("H1".into()),
            snr_values: None,
            topic: Some("mesh/v1/B2/packets".into()),
        }
    }

    #[test]
    fn key_is_symmetric() {
        let (k1, _, _) = edge_key((1.5, 2.5), (0.5, 9.5));
        let (k2, _, _) = edge_key((0.5, 9.5), (1.5, 2.5));
        assert_eq!(k1, k2);
        assert_eq!(k1, "0.500000,9.500000|1.500000,2.500000");
    }

    #[test]
    fn record_increments_and_samples() {
        let cfg = history_cfg();
        let mut hist = HistoryStore::default();
        let r = route(vec![[1.0, 1.0], [2.0, 2.0]], RouteMode::Path, Some(3));

        let out = record(&mut hist, &cfg, &r);
        assert_eq!(out.updates.len(), 1);
        assert_eq!(out.updates[0].count, 1);
        assert_eq!(out.appended.len(), 1);
        assert_eq!(out.appended[0].a_id.as_deref(), Some("A1"));

        let out = record(&mut hist, &cfg, &r);
        assert_eq!(out.updates[0].count, 2);
        assert_eq!(out.updates[0].recent.len(), 2);
        assert_eq!(hist.segments.len(), 2);
    }

    #[test]
    fn recent_ring_is_capped_newest_first() {
        let mut cfg = history_cfg();
        cfg.history_sample_limit = 2;
        let mut hist = HistoryStore::default();
        let mut r = route(vec![[1.0, 1.0], [2.0, 2.0]], RouteMode::Path, Some(3));
        for i in 0..4 {
            r.ts = geo::now() + i as f64;
            record(&mut hist, &cfg, &r);
        }
        let edge = hist.edges.values().next().unwrap();
        assert_eq!(edge.count, 4);
        assert_eq!(edge.recent.len(), 2);
        assert!(edge.recent[0].ts >= edge.recent[1].ts);
    }

    #[test]
    fn mode_and_payload_gates() {
        let cfg = history_cfg();
        let mut hist = HistoryStore::default();

        let fanout = route(vec![[1.0, 1.0], [2.0, 2.0]], RouteMode::Fanout, Some(3));
        assert!(record(&mut hist, &cfg, &fanout).appended.is_empty());

        let wrong_type = route(vec![[1.0, 1.0], [2.0, 2.0]], RouteMode::Path, Some(9));
        assert!(record(&mut hist, &cfg, &wrong_type).appended.is_empty());

        let untyped = route(vec![[1.0, 1.0], [2.0, 2.0]], RouteMode::Path, None);
        assert!(record(&mut hist, &cfg, &untyped).appended.is_empty());
    }

    #[test]
    fn zero_coord_segments_skipped() {
        let cfg = history_cfg();
        let mut hist = HistoryStore::default();
        let r = route(vec![[0.0, 0.0], [2.0, 2.0]], RouteMode::Path, Some(3));
        assert!(record(&mut hist, &cfg, &r).appended.is_empty());
    }

    #[test]
    fn time_prune_drops_zero_count_edges() {
        let cfg = history_cfg();
        let mut hist = HistoryStore::default();
        let mut r = route(vec![[1.0, 1.0], [2.0, 2.0]], RouteMode::Path, Some(3));
        r.ts = geo::now() - cfg.history_window_seconds() - 10.0;
        record(&mut hist, &cfg, &r);
        assert_eq!(hist.edges.len(), 1);

        let (updates, removed) = prune(&mut hist, &cfg, false);
        assert!(updates.is_empty());
        assert_eq!(removed.len(), 1);
        assert!(hist.edges.is_empty());
        assert!(hist.segments.is_empty());
        assert!(hist.compact_dirty);
    }

    #[test]
    fn forced_prune_respects_cap() {
        let mut cfg = history_cfg();
        cfg.history_max_segments = 3;
        let mut hist = HistoryStore::default();
        let r = route(vec![[1.0, 1.0], [2.0, 2.0]], RouteMode::Path, Some(3));
        for _ in 0..5 {
            record(&mut hist, &cfg, &r);
        }
        assert_eq!(hist.segments.len(), 3);
        let edge = hist.edges.values().next().unwrap();
        assert_eq!(edge.count, 3);
    }

    #[test]
    fn edge_count_matches_live_segments() {
        let cfg = history_cfg();
        let mut hist = HistoryStore::default();
        let r1 = route(vec![[1.0, 1.0], [2.0, 2.0]], RouteMode::Path, Some(3));
        let r2 = route(vec![[2.0, 2.0], [1.0, 1.0]], RouteMode::Path, Some(3));
        record(&mut hist, &cfg, &r1);
        record(&mut hist, &cfg, &r2);
        // Same undirected edge from both directions.
        assert_eq!(hist.edges.len(), 1);
        let edge = hist.edges.values().next().unwrap();
        assert_eq!(edge.count as usize, hist.segments.len());
    }

    #[tokio::test]
    async fn journal_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = history_cfg();
        cfg.history_file = dir.path().join("hist.jsonl");

        let mut hist = HistoryStore::default();
        let r = route(vec![[1.0, 1.0], [2.0, 2.0], [3.0, 3.0]], RouteMode::Path, Some(3));
        let out = record(&mut hist, &cfg, &r);
        append_journal(&cfg, &out.appended).await;

        let mut reloaded = HistoryStore::default();
        load_journal(&mut reloaded, &cfg).await;
        assert_eq!(reloaded.segments.len(), 2);
        assert_eq!(reloaded.edges.len(), 2);
        for edge in reloaded.edges.values() {
            assert_eq!(edge.count, 1);
        }
    }

    #[tokio::test]
    async fn journal_skips_garbage_lines() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = history_cfg();
        cfg.history_file = dir.path().join("hist.jsonl");

        let good = HistorySegment {
            ts: geo::now(),
            a: [1.0, 1.0],
            b: [2.0, 2.0],
            a_id: None,
            b_id: None,
            message_hash: None,
            payload_type: Some(3),
            origin_id: None,
            receiver_id: None,
            route_mode: Some(RouteMode::Path),
            topic: None,
        };
        let mut contents = String::from("not json at all\n");
        contents.push_str(&serde_json::to_string(&good).unwrap());
        contents.push('\n');
        std::fs::write(&cfg.history_file, contents).unwrap();

        let mut hist = HistoryStore::default();
        load_journal(&mut hist, &cfg).await;
        assert_eq!(hist.segments.len(), 1);
        assert!(hist.compact_dirty);
    }
}
