//! Immutable service configuration, built once at startup from environment
//! variables. Every tunable has a default so a bare `meshmap-backend` run
//! against a local broker works out of the box.

use std::collections::HashSet;
use std::path::PathBuf;

use regex::RegexBuilder;
use tracing::warn;

/// Broker transport selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MqttTransport {
    Tcp,
    Websockets,
}

/// Policy for accepting lat/lon found directly in JSON payloads without
/// wire-format decoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectCoordsMode {
    Off,
    Any,
    Topic,
    Strict,
}

#[derive(Debug, Clone)]
pub struct Config {
    // Broker
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_username: Option<String>,
    pub mqtt_password: Option<String>,
    pub mqtt_tls: bool,
    pub mqtt_tls_insecure: bool,
    pub mqtt_ca_cert: Option<PathBuf>,
    pub mqtt_transport: MqttTransport,
    pub mqtt_ws_path: String,
    pub mqtt_client_id: String,
    pub mqtt_topics: Vec<String>,
    pub online_topic_suffixes: Vec<String>,
    /// Lowercased names whose peers are excluded from peer stats.
    pub online_force_names: HashSet<String>,
    pub seen_broadcast_min_seconds: f64,

    // Storage
    pub state_dir: PathBuf,
    pub state_file: PathBuf,
    pub device_roles_file: PathBuf,
    pub neighbor_overrides_file: PathBuf,
    pub history_file: PathBuf,
    pub state_save_interval: f64,

    // Retention
    pub device_ttl_seconds: f64,
    pub route_ttl_seconds: f64,
    pub heat_ttl_seconds: f64,
    pub message_origin_ttl_seconds: f64,
    pub history_enabled: bool,
    pub history_hours: f64,
    pub history_max_segments: usize,
    pub history_compact_interval: f64,
    pub history_sample_limit: usize,

    // Filter
    pub map_start_lat: f64,
    pub map_start_lon: f64,
    pub map_start_zoom: f64,
    /// 0 disables radius filtering.
    pub map_radius_km: f64,
    pub trail_len: usize,
    pub route_path_max_len: usize,

    // Route classification
    pub route_payload_types: HashSet<i64>,
    pub history_payload_types: HashSet<i64>,
    pub history_allowed_modes: HashSet<String>,

    // Direct coordinates
    pub direct_coords_mode: DirectCoordsMode,
    pub direct_coords_topic_regex: String,
    pub direct_coords_topic_re: Option<regex::Regex>,
    pub direct_coords_allow_zero: bool,

    // External decoder
    pub decode_with_node: bool,
    pub node_runtime: String,
    pub node_script_path: PathBuf,
    pub node_decode_timeout_seconds: f64,
    pub payload_preview_max: usize,
    pub debug_payload: bool,
    pub debug_payload_max: usize,
    pub debug_last_max: usize,
    pub debug_status_max: usize,

    // Production
    pub prod_mode: bool,
    pub prod_token: String,

    // HTTP surface
    pub port: u16,
    pub cors_origins: String,
}

fn env_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_f64(key: &str, default: f64) -> f64 {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok()).unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok()).unwrap_or(default)
}

fn env_u16(key: &str, default: u16) -> u16 {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok()).unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(v) => matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

fn csv_list(raw: &str) -> Vec<String> {
    raw.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect()
}

fn csv_int_set(raw: &str) -> HashSet<i64> {
    raw.split(',').filter_map(|s| s.trim().parse().ok()).collect()
}

fn csv_lower_set(raw: &str) -> HashSet<String> {
    raw.split(',')
        .map(|s| s.trim().to_ascii_lowercase())
        .filter(|s| !s.is_empty())
        .collect()
}

impl Config {
    pub fn from_env() -> Self {
        let state_dir = PathBuf::from(env_str("STATE_DIR", "./data"));
        let state_file = env_opt("STATE_FILE")
            .map(PathBuf::from)
            .unwrap_or_else(|| state_dir.join("state.json"));
        let device_roles_file = env_opt("DEVICE_ROLES_FILE")
            .map(PathBuf::from)
            .unwrap_or_else(|| state_dir.join("device_roles.json"));
        let neighbor_overrides_file = env_opt("NEIGHBOR_OVERRIDES_FILE")
            .map(PathBuf::from)
            .unwrap_or_else(|| state_dir.join("neighbor_overrides.json"));
        let history_file = env_opt("ROUTE_HISTORY_FILE")
            .map(PathBuf::from)
            .unwrap_or_else(|| state_dir.join("route_history.jsonl"));

        let transport = match env_str("MQTT_TRANSPORT", "tcp").to_ascii_lowercase().as_str() {
            "websockets" | "ws" => MqttTransport::Websockets,
            _ => MqttTransport::Tcp,
        };

        let direct_mode = match env_str("DIRECT_COORDS_MODE", "topic").to_ascii_lowercase().as_str() {
            "off" => DirectCoordsMode::Off,
            "any" => DirectCoordsMode::Any,
            "strict" => DirectCoordsMode::Strict,
            _ => DirectCoordsMode::Topic,
        };

        let topic_regex = env_str("DIRECT_COORDS_TOPIC_REGEX", "(position|location|gps|track)");
        let topic_re = match RegexBuilder::new(&topic_regex).case_insensitive(true).build() {
            Ok(re) => Some(re),
            Err(e) => {
                warn!("DIRECT_COORDS_TOPIC_REGEX invalid, direct-coords topic gate disabled: {e}");
                None
            }
        };

        let route_types = csv_int_set(&env_str("ROUTE_PAYLOAD_TYPES", "3,4,5,7"));
        let history_types = csv_int_set(&env_str("ROUTE_HISTORY_PAYLOAD_TYPES", "3,4,5,7"));

        Self {
            mqtt_host: env_str("MQTT_HOST", "127.0.0.1"),
            mqtt_port: env_u16("MQTT_PORT", 1883),
            mqtt_username: env_opt("MQTT_USERNAME"),
            mqtt_password: env_opt("MQTT_PASSWORD"),
            mqtt_tls: env_bool("MQTT_TLS", false),
            mqtt_tls_insecure: env_bool("MQTT_TLS_INSECURE", false),
            mqtt_ca_cert: env_opt("MQTT_CA_CERT").map(PathBuf::from),
            mqtt_transport: transport,
            mqtt_ws_path: env_str("MQTT_WS_PATH", "/mqtt"),
            mqtt_client_id: env_str("MQTT_CLIENT_ID", "meshmap-backend"),
            mqtt_topics: csv_list(&env_str("MQTT_TOPICS", "#")),
            online_topic_suffixes: csv_list(&env_str("MQTT_ONLINE_TOPIC_SUFFIXES", "/status")),
            online_force_names: csv_lower_set(&env_str("MQTT_ONLINE_FORCE_NAMES", "")),
            seen_broadcast_min_seconds: env_f64("MQTT_SEEN_BROADCAST_MIN_SECONDS", 30.0),

            state_dir,
            state_file,
            device_roles_file,
            neighbor_overrides_file,
            history_file,
            state_save_interval: env_f64("STATE_SAVE_INTERVAL", 10.0).max(1.0),

            device_ttl_seconds: env_f64("DEVICE_TTL_SECONDS", 21600.0),
            route_ttl_seconds: env_f64("ROUTE_TTL_SECONDS", 90.0),
            heat_ttl_seconds: env_f64("HEAT_TTL_SECONDS", 1800.0),
            message_origin_ttl_seconds: env_f64("MESSAGE_ORIGIN_TTL_SECONDS", 900.0),
            history_enabled: env_bool("ROUTE_HISTORY_ENABLED", true),
            history_hours: env_f64("ROUTE_HISTORY_HOURS", 48.0),
            history_max_segments: env_usize("ROUTE_HISTORY_MAX_SEGMENTS", 20000),
            history_compact_interval: env_f64("ROUTE_HISTORY_COMPACT_INTERVAL", 300.0),
            history_sample_limit: env_usize("HISTORY_EDGE_SAMPLE_LIMIT", 5),

            map_start_lat: env_f64("MAP_START_LAT", 0.0),
            map_start_lon: env_f64("MAP_START_LON", 0.0),
            map_start_zoom: env_f64("MAP_START_ZOOM", 8.0),
            map_radius_km: env_f64("MAP_RADIUS_KM", 0.0),
            trail_len: env_usize("TRAIL_LEN", 40),
            route_path_max_len: env_usize("ROUTE_PATH_MAX_LEN", 8),

            route_payload_types: route_types,
            history_payload_types: history_types,
            history_allowed_modes: csv_lower_set(&env_str("ROUTE_HISTORY_ALLOWED_MODES", "path,direct")),

            direct_coords_mode: direct_mode,
            direct_coords_topic_regex: topic_regex,
            direct_coords_topic_re: topic_re,
            direct_coords_allow_zero: env_bool("DIRECT_COORDS_ALLOW_ZERO", false),

            decode_with_node: env_bool("DECODE_WITH_NODE", true),
            node_runtime: env_str("NODE_RUNTIME", "node"),
            node_script_path: PathBuf::from(env_str("NODE_SCRIPT_PATH", "./decoder/decode.js")),
            node_decode_timeout_seconds: env_f64("NODE_DECODE_TIMEOUT_SECONDS", 5.0),
            payload_preview_max: env_usize("PAYLOAD_PREVIEW_MAX", 160),
            debug_payload: env_bool("DEBUG_PAYLOAD", false),
            debug_payload_max: env_usize("DEBUG_PAYLOAD_MAX", 512),
            debug_last_max: env_usize("DEBUG_LAST_MAX", 50),
            debug_status_max: env_usize("DEBUG_STATUS_MAX", 50),

            prod_mode: env_bool("PROD_MODE", false),
            prod_token: env_str("PROD_TOKEN", ""),

            port: env_u16("PORT", 8080),
            cors_origins: env_str(
                "CORS_ORIGINS",
                "http://localhost:3000,http://localhost:5173",
            ),
        }
    }

    /// Seconds of history retained by the rolling edge window.
    pub fn history_window_seconds(&self) -> f64 {
        (self.history_hours * 3600.0).max(0.0)
    }

    /// True when the topic marks its implied device online regardless of
    /// whether the payload parses.
    pub fn topic_marks_online(&self, topic: &str) -> bool {
        self.online_topic_suffixes.iter().any(|s| topic.ends_with(s.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn csv_parsers() {
        assert_eq!(csv_list("a, b ,,c"), vec!["a", "b", "c"]);
        let ints = csv_int_set("3, 4,x, 7");
        assert!(ints.contains(&3) && ints.contains(&7) && !ints.contains(&5));
        let names = csv_lower_set("Gateway One, relay");
        assert!(names.contains("gateway one"));
    }

    #[test]
    fn online_suffix_match() {
        let mut cfg = Config::from_env();
        cfg.online_topic_suffixes = vec!["/status".into(), "/lwt".into()];
        assert!(cfg.topic_marks_online("mesh/v1/AB12/status"));
        assert!(cfg.topic_marks_online("x/lwt"));
        assert!(!cfg.topic_marks_online("mesh/v1/AB12/packets"));
    }
}
