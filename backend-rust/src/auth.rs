//! Production-mode bearer-token gate for the query surface and the live
//! socket. Outside production mode everything is open.

use axum::http::HeaderMap;
use std::collections::HashMap;

use crate::config::Config;

/// Pull a token out of request headers: `Authorization: Bearer <t>` (or a
/// bare Authorization value), then the legacy `x-access-token` / `x-token`
/// headers.
pub fn extract_token(headers: &HeaderMap) -> Option<String> {
    if let Some(auth) = headers.get("authorization").and_then(|v| v.to_str().ok()) {
        let mut parts = auth.split_whitespace();
        match (parts.next(), parts.next(), parts.next()) {
            (Some(scheme), Some(token), None) if scheme.eq_ignore_ascii_case("bearer") => {
                return Some(token.to_string());
            }
            _ => return Some(auth.trim().to_string()),
        }
    }
    for header in ["x-access-token", "x-token"] {
        if let Some(token) = headers.get(header).and_then(|v| v.to_str().ok()) {
            return Some(token.to_string());
        }
    }
    None
}

fn query_token(query: &HashMap<String, String>) -> Option<String> {
    query
        .get("token")
        .or_else(|| query.get("access_token"))
        .cloned()
}

/// Check a request against the production token. `Ok(())` outside prod
/// mode; 503 when prod mode is on without a token configured; 401 on
/// mismatch.
pub fn require_prod_token(
    cfg: &Config,
    headers: &HeaderMap,
    query: &HashMap<String, String>,
) -> Result<(), axum::http::StatusCode> {
    if !cfg.prod_mode {
        return Ok(());
    }
    if cfg.prod_token.is_empty() {
        return Err(axum::http::StatusCode::SERVICE_UNAVAILABLE);
    }
    let token = query_token(query).or_else(|| extract_token(headers));
    if token.as_deref() == Some(cfg.prod_token.as_str()) {
        Ok(())
    } else {
        Err(axum::http::StatusCode::UNAUTHORIZED)
    }
}

/// Socket clients present the token via query or header before upgrade.
pub fn ws_authorized(cfg: &Config, headers: &HeaderMap, query: &HashMap<String, String>) -> bool {
    require_prod_token(cfg, headers, query).is_ok()
}
