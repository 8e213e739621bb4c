//! MQTT ingest hub.
//!
//! Runs as its own task beside the broadcaster: subscribes to the configured
//! topics, probes every payload, and posts events onto the shared queue.
//! It never mutates map entities directly, only counters, rings, seen maps,
//! the message-origin cache and the name/role maps. Broker errors never
//! crash the server; the loop backs off and reconnects.

use std::sync::Arc;
use std::time::Duration;

use rumqttc::{AsyncClient, Event as MqttEvent, MqttOptions, Packet, QoS, Transport};
use serde_json::Value;
use tracing::{debug, info, warn};

use mesh_types::RouteMode;

use crate::config::{Config, MqttTransport};
use crate::decoder::{device_id_from_topic, safe_preview, PayloadDecoder};
use crate::geo::{self, within_map_radius};
use crate::state::{DebugEntry, Event, EventTx, MessageOrigin, RouteEvent, SharedState, StatusEntry};

pub struct IngestCtx {
    pub state: SharedState,
    pub cfg: Arc<Config>,
    pub decoder: PayloadDecoder,
    pub tx: EventTx,
}

/// Connect, subscribe and pump the broker event loop forever. Poll errors
/// back off with a bounded delay; subscriptions are re-issued on every
/// ConnAck so reconnects resume cleanly.
pub async fn run(ctx: Arc<IngestCtx>) {
    let cfg = &ctx.cfg;
    // For websocket transport rumqttc takes the full URL as the broker
    // address.
    let broker_addr = match cfg.mqtt_transport {
        MqttTransport::Tcp => cfg.mqtt_host.clone(),
        MqttTransport::Websockets => {
            let scheme = if cfg.mqtt_tls { "wss" } else { "ws" };
            format!("{scheme}://{}:{}{}", cfg.mqtt_host, cfg.mqtt_port, cfg.mqtt_ws_path)
        }
    };
    let mut options = MqttOptions::new(cfg.mqtt_client_id.clone(), broker_addr, cfg.mqtt_port);
    options.set_keep_alive(Duration::from_secs(30));
    if let (Some(user), Some(pass)) = (&cfg.mqtt_username, &cfg.mqtt_password) {
        options.set_credentials(user.clone(), pass.clone());
    }
    match cfg.mqtt_transport {
        MqttTransport::Websockets => {
            options.set_transport(if cfg.mqtt_tls {
                Transport::wss_with_default_config()
            } else {
                Transport::Ws
            });
        }
        MqttTransport::Tcp if cfg.mqtt_tls => {
            options.set_transport(tls_transport(cfg));
        }
        MqttTransport::Tcp => {}
    }

    info!(
        host = %cfg.mqtt_host,
        port = cfg.mqtt_port,
        tls = cfg.mqtt_tls,
        topics = ?cfg.mqtt_topics,
        "connecting to broker"
    );

    let (client, mut eventloop) = AsyncClient::new(options, 64);
    loop {
        match eventloop.poll().await {
            Ok(MqttEvent::Incoming(Packet::ConnAck(ack))) => {
                info!(code = ?ack.code, "broker connected, subscribing");
                for topic in &cfg.mqtt_topics {
                    if let Err(e) = client.subscribe(topic.clone(), QoS::AtMostOnce).await {
                        warn!(topic = %topic, error = %e, "subscribe failed");
                    }
                }
            }
            Ok(MqttEvent::Incoming(Packet::Publish(publish))) => {
                handle_message(&ctx, &publish.topic, &publish.payload).await;
            }
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "broker connection error, retrying");
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
        }
    }
}

fn tls_transport(cfg: &Config) -> Transport {
    use rumqttc::TlsConfiguration;
    if let Some(ca_path) = &cfg.mqtt_ca_cert {
        match std::fs::read(ca_path) {
            Ok(ca) => {
                return Transport::Tls(TlsConfiguration::Simple { ca, alpn: None, client_auth: None })
            }
            Err(e) => {
                warn!(file = %ca_path.display(), error = %e, "failed to read MQTT CA certificate, using default roots");
            }
        }
    }
    if cfg.mqtt_tls_insecure {
        // The rustls backend offers no verification bypass; the flag only
        // widens trust to the default root store.
        warn!("MQTT_TLS_INSECURE requested; certificate verification stays on with default roots");
    }
    Transport::tls_with_default_config()
}

/// Ingest one broker message: counters, online marking, probing, debug
/// records, name/role diffs, message-origin cache, route construction and
/// finally the position event.
pub async fn handle_message(ctx: &IngestCtx, topic: &str, payload: &[u8]) {
    let cfg = &ctx.cfg;
    let now = geo::now();

    // Counters and online marking happen whether or not the payload parses.
    {
        let mut st = ctx.state.write().await;
        st.stats.received_total += 1;
        st.stats.last_rx_ts = Some(now);
        st.stats.last_rx_topic = Some(topic.to_string());
        *st.topic_counts.entry(topic.to_string()).or_insert(0) += 1;

        if let Some(dev_guess) = device_id_from_topic(topic) {
            if cfg.topic_marks_online(topic) {
                st.seen_devices.insert(dev_guess.clone(), now);
                st.mqtt_seen.insert(dev_guess.clone(), now);
                if st.devices.contains_key(&dev_guess) {
                    let last_sent = st.last_seen_broadcast.get(&dev_guess).copied().unwrap_or(0.0);
                    if now - last_sent >= cfg.seen_broadcast_min_seconds {
                        st.last_seen_broadcast.insert(dev_guess.clone(), now);
                        let _ = ctx.tx.send(Event::DeviceSeen {
                            device_id: dev_guess,
                            last_seen_ts: now,
                            mqtt_seen_ts: Some(now),
                        });
                    }
                }
            }
        }
    }

    let (mut parsed, mut dbg) = ctx.decoder.parse(topic, payload).await;
    let device_id_hint = parsed.as_ref().map(|p| p.device_id.clone());

    // Policy filters: the zero sentinel and the map radius.
    if let Some(p) = &parsed {
        if crate::geo::coords_are_zero(p.lat, p.lon) {
            dbg.result = "filtered_zero_coords".to_string();
            parsed = None;
        }
    }
    if let Some(p) = &parsed {
        if !within_map_radius(cfg, p.lat, p.lon) {
            dbg.result = "filtered_radius".to_string();
            parsed = None;
            if let Some(device_id) = device_id_hint.clone() {
                let _ = ctx.tx.send(Event::DeviceRemove { device_id });
            }
        }
    }

    let origin_id = dbg.origin_id.clone().or_else(|| device_id_from_topic(topic));
    let receiver_id = device_id_from_topic(topic);
    let result = dbg.result.clone();

    // Role updates land on the decoded key when the packet was decoded, not
    // on the gateway that relayed it.
    let role_target_id = if dbg.device_role.is_some() && result.starts_with("decoded") {
        dbg.decoded_pubkey.clone()
    } else {
        origin_id.clone()
    };

    let decoder_meta = dbg.decoder_meta.clone();
    let debug_entry = DebugEntry {
        ts: now,
        topic: topic.to_string(),
        result: result.clone(),
        found_path: dbg.found_path.clone(),
        decoder_meta: decoder_meta.as_ref().and_then(|m| serde_json::to_value(m).ok()),
        role_target_id: role_target_id.clone(),
        packet_hash: dbg.packet_hash.clone(),
        direction: dbg.direction.clone(),
        json_keys: dbg.json_keys.clone(),
        parse_error: dbg.parse_error.clone(),
        origin_id: origin_id.clone(),
        payload_preview: safe_preview(&payload[..payload.len().min(cfg.debug_payload_max)], cfg.payload_preview_max),
    };

    {
        let mut st = ctx.state.write().await;
        st.push_debug(cfg, debug_entry);
        if topic.ends_with("/status") {
            let entry = StatusEntry {
                ts: now,
                topic: topic.to_string(),
                device_name: dbg.device_name.clone(),
                device_role: dbg.device_role,
                origin_id: origin_id.clone(),
                json_keys: dbg.json_keys.clone(),
                payload_preview: safe_preview(payload, cfg.payload_preview_max),
            };
            st.push_status(cfg, entry);
        }
        st.count_result(&result);

        // Learned names and roles are persisted even for devices that have
        // no mapped position yet; known devices also get a live frame.
        if let (Some(name), Some(target)) = (&dbg.device_name, &origin_id) {
            if st.device_names.get(target) != Some(name) {
                st.device_names.insert(target.clone(), name.clone());
                st.dirty = true;
                if st.devices.contains_key(target) {
                    let _ = ctx.tx.send(Event::DeviceName { device_id: target.clone() });
                }
            }
        }
        if let (Some(role), Some(target)) = (dbg.device_role, &role_target_id) {
            if st.device_roles.get(target) != Some(&role) {
                st.device_roles.insert(target.clone(), role);
                st.device_role_sources.insert(target.clone(), "explicit".to_string());
                st.dirty = true;
                if st.devices.contains_key(target) {
                    let _ = ctx.tx.send(Event::DeviceRole { device_id: target.clone() });
                }
            }
        }
    }

    // Routing evidence.
    let meta = decoder_meta.unwrap_or_default();
    let payload_type = meta.payload_type.as_ref().and_then(coerce_int);
    let route_type = meta.route_type.as_ref().and_then(coerce_int);
    let message_hash = meta.message_hash.clone().or_else(|| dbg.packet_hash.clone());
    let direction = dbg.direction.clone().unwrap_or_default();

    let mut route_origin_id = meta
        .location
        .as_ref()
        .and_then(|loc| loc.pubkey.clone())
        .filter(|s| !s.trim().is_empty());

    if let Some(hash) = &message_hash {
        let mut st = ctx.state.write().await;
        let cache = st
            .message_origins
            .entry(hash.clone())
            .or_insert_with(|| MessageOrigin { ts: now, ..MessageOrigin::default() });
        cache.ts = now;
        if direction == "tx" {
            if let Some(origin) = origin_id.clone().or_else(|| receiver_id.clone()) {
                cache.origin_id = Some(origin);
            }
        }
        if direction == "rx" {
            if let Some(receiver) = &receiver_id {
                cache.receivers.insert(receiver.clone());
                if cache.first_rx.is_none() {
                    cache.first_rx = Some(receiver.clone());
                }
            }
        }
        if route_origin_id.is_none() {
            route_origin_id = cache.origin_id.clone();
        }
        if route_origin_id.is_none() && direction == "rx" {
            // Rx-only fan-out: treat the first receiver as the hub.
            if let (Some(first_rx), Some(receiver)) = (&cache.first_rx, &receiver_id) {
                if receiver != first_rx {
                    route_origin_id = Some(first_rx.clone());
                }
            }
        }
    }
    let route_origin_id = route_origin_id.or_else(|| origin_id.clone());

    let route_hashes = select_route_hashes(&meta, payload_type, route_type);

    // At most one route event per message.
    let mut route_emitted = false;
    if let Some(hashes) = route_hashes.filter(|h| !h.is_empty()) {
        if payload_type.is_some_and(|pt| cfg.route_payload_types.contains(&pt)) {
            let _ = ctx.tx.send(Event::Route(RouteEvent {
                route_mode: None,
                route_id: None,
                path_hashes: hashes,
                payload_type,
                route_type,
                message_hash: message_hash.clone(),
                origin_id: route_origin_id.clone(),
                receiver_id: receiver_id.clone(),
                snr_values: meta.snr_values.clone(),
                ts: now,
                topic: topic.to_string(),
            }));
            route_emitted = true;
        }
    } else if let (Some(hash), Some(origin), Some(receiver)) =
        (&message_hash, &route_origin_id, &receiver_id)
    {
        if direction == "rx" && topic.ends_with("/packets") {
            let _ = ctx.tx.send(Event::Route(RouteEvent {
                route_mode: Some(RouteMode::Fanout),
                route_id: Some(format!("{hash}-{receiver}")),
                path_hashes: Vec::new(),
                payload_type,
                route_type,
                message_hash: message_hash.clone(),
                origin_id: Some(origin.clone()),
                receiver_id: Some(receiver.clone()),
                snr_values: None,
                ts: now,
                topic: topic.to_string(),
            }));
            route_emitted = true;
        }
    }

    if !route_emitted
        && direction == "rx"
        && topic.ends_with("/packets")
        && receiver_id.is_some()
        && route_origin_id.is_some()
        && receiver_id != route_origin_id
        && payload_type.is_some_and(|pt| cfg.route_payload_types.contains(&pt))
    {
        let fallback_id = message_hash.clone().unwrap_or_else(|| {
            format!(
                "{}-{}-{}",
                route_origin_id.as_deref().unwrap_or_default(),
                receiver_id.as_deref().unwrap_or_default(),
                (now * 1000.0) as i64
            )
        });
        let _ = ctx.tx.send(Event::Route(RouteEvent {
            route_mode: Some(RouteMode::Direct),
            route_id: Some(format!("direct-{fallback_id}")),
            path_hashes: Vec::new(),
            payload_type,
            route_type,
            message_hash,
            origin_id: route_origin_id,
            receiver_id,
            snr_values: None,
            ts: now,
            topic: topic.to_string(),
        }));
    }

    // Finally the position itself.
    let Some(mut parsed) = parsed else {
        let mut st = ctx.state.write().await;
        st.stats.unparsed_total += 1;
        if cfg.debug_payload {
            debug!(topic, result = %result, "unparsed payload");
        }
        return;
    };
    parsed.raw_topic = Some(topic.to_string());
    {
        let mut st = ctx.state.write().await;
        st.stats.parsed_total += 1;
        st.stats.last_parsed_ts = Some(now);
        st.stats.last_parsed_topic = Some(topic.to_string());
    }
    if cfg.debug_payload {
        debug!(topic, device = %parsed.device_id, lat = parsed.lat, lon = parsed.lon, "parsed position");
    }
    let _ = ctx.tx.send(Event::Position(parsed));
}

fn coerce_int(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Path-hash source for route construction: the decoded list when it is
/// actually populated, otherwise the raw path header for selected
/// payload/route types. Decoders emit `"pathHashes": []` for hop-less
/// packets; an empty list must fall through, not suppress the header.
fn select_route_hashes(
    meta: &mesh_types::DecoderResult,
    payload_type: Option<i64>,
    route_type: Option<i64>,
) -> Option<Vec<Value>> {
    if let Some(hashes) = meta.path_hashes.as_ref().filter(|v| !v.is_empty()) {
        return Some(hashes.clone());
    }
    if !matches!(payload_type, Some(8) | Some(9)) && matches!(route_type, Some(0) | Some(1)) {
        return meta.path.clone();
    }
    None
}
