//! Settings loading with deep merge and environment overrides.
//!
//! Loading flow:
//! 1. Start with [`NodelinkSettings::default()`]
//! 2. If `~/.nodelink/settings.json` (or an explicit path) exists, deep-merge it over the defaults
//! 3. Apply `NODELINK_*` environment overrides
//! 4. Validate
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::Result;
use crate::types::{LogFormat, NodelinkSettings};

/// `~/.nodelink/settings.json`.
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".nodelink").join("settings.json")
}

/// Load from the default path.
pub fn load_settings() -> Result<NodelinkSettings> {
    load_settings_from_path(&settings_path())
}

/// Load from `path`, falling back to defaults when the file is missing.
///
/// Invalid JSON or out-of-range values are errors.
pub fn load_settings_from_path(path: &Path) -> Result<NodelinkSettings> {
    let defaults = serde_json::to_value(NodelinkSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: NodelinkSettings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings);
    settings.validate()?;
    Ok(settings)
}

/// Recursive deep merge of two JSON values.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = match target_map.remove(&key) {
                    Some(target_val) => deep_merge(target_val, source_val),
                    None => source_val,
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply `NODELINK_*` overrides from the process environment.
pub fn apply_env_overrides(settings: &mut NodelinkSettings) {
    apply_overrides(settings, |name| std::env::var(name).ok());
}

/// Apply overrides read through `lookup`.
///
/// Unparsable or out-of-range values are logged and ignored.
pub fn apply_overrides<F>(settings: &mut NodelinkSettings, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let string = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
    let millis = |name: &str| {
        let raw = string(name)?;
        let parsed = parse_u64_range(&raw, 1, 86_400_000);
        if parsed.is_none() {
            warn!(key = name, value = %raw, "invalid duration env var, ignoring");
        }
        parsed
    };

    // ── Liveness ────────────────────────────────────────────────────
    if let Some(v) = millis("NODELINK_HEARTBEAT_INTERVAL_MS") {
        settings.liveness.heartbeat_interval_ms = v;
    }
    if let Some(v) = millis("NODELINK_RECONNECT_BACKOFF_MS") {
        settings.liveness.reconnect_backoff_ms = v;
    }
    if let Some(v) = millis("NODELINK_REQUEST_TIMEOUT_MS") {
        settings.liveness.request_timeout_ms = v;
    }

    // ── Broker ──────────────────────────────────────────────────────
    if let Some(v) = string("NODELINK_BROKER_HOST") {
        settings.broker.host = v;
    }
    if let Some(raw) = string("NODELINK_BROKER_PORT") {
        match parse_u16_range(&raw, 1, u16::MAX) {
            Some(port) => settings.broker.port = port,
            None => warn!(key = "NODELINK_BROKER_PORT", value = %raw, "invalid port env var, ignoring"),
        }
    }

    // ── Node ────────────────────────────────────────────────────────
    if let Some(v) = string("NODELINK_BROKER_URL") {
        settings.node.broker_url = Some(v);
    }
    if let Some(v) = string("NODELINK_NODE_ID") {
        settings.node.consistent_id = v;
    }
    if let Some(v) = string("NODELINK_USER") {
        settings.node.user = Some(v);
    }
    if let Some(v) = string("NODELINK_CREDENTIAL") {
        settings.node.credential = Some(v);
    }

    // ── Logging ─────────────────────────────────────────────────────
    if let Some(v) = string("NODELINK_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(raw) = string("NODELINK_LOG_JSON") {
        match parse_bool(&raw) {
            Some(true) => settings.logging.format = LogFormat::Json,
            Some(false) => settings.logging.format = LogFormat::Compact,
            None => warn!(key = "NODELINK_LOG_JSON", value = %raw, "invalid boolean env var, ignoring"),
        }
    }
}

// ── Pure parsing functions ──────────────────────────────────────────

/// Parse a boolean: `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a `u16` within `[min, max]`.
pub fn parse_u16_range(val: &str, min: u16, max: u16) -> Option<u16> {
    let n: u16 = val.trim().parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a `u64` within `[min, max]`.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.trim().parse().ok()?;
    (n >= min && n <= max).then_some(n)
}
