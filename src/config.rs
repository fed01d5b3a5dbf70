//! Typed views over the persisted `config` document.
//!
//! The document itself is stored as loose JSON (see `store`), so that settings
//! written by older or newer builds survive a round trip. This module defines
//! the `server` and `general` sections as typed structures, their defaults, and
//! the validation rules that must hold before a service is started.

use std::collections::BTreeMap;
use std::fmt;

use serde::de::{self, Deserializer};
use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

/// Port the bundled web server listens on when nothing else is configured.
pub const DEFAULT_PORT: u16 = 3002;
/// Upstream API used by a fresh install.
pub const DEFAULT_API_URL: &str = "https://api.ever.team";
/// Interface the bundled web server binds to by default.
pub const DEFAULT_HOSTNAME: &str = "0.0.0.0";
/// Minutes between background update checks.
pub const DEFAULT_UPDATE_CHECK_PERIOD: u64 = 60;

const PID_SUFFIX: &str = "Pid";

/// Fields of the `server` section that must be present before any start.
pub const REQUIRED_SERVER_FIELDS: [&str; 2] = ["PORT", "GAUZY_API_SERVER_URL"];

/// Settings for the locally hosted web server (`config.server`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Port the web server listens on.
    #[serde(rename = "PORT", deserialize_with = "port_from_value")]
    pub port: u16,
    /// API the web server proxies to.
    #[serde(rename = "GAUZY_API_SERVER_URL")]
    pub upstream_api_url: String,
    /// API URL exposed to the browser side of the web app.
    #[serde(rename = "NEXT_PUBLIC_GAUZY_API_SERVER_URL")]
    pub public_upstream_api_url: String,
    /// Hostname the web server binds to.
    #[serde(rename = "DESKTOP_WEB_SERVER_HOSTNAME")]
    pub bind_hostname: String,
    /// Pids of running services, persisted as `<service>Pid` keys.
    #[serde(flatten)]
    pub process_handles: ProcessHandles,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            upstream_api_url: DEFAULT_API_URL.to_string(),
            public_upstream_api_url: DEFAULT_API_URL.to_string(),
            bind_hostname: DEFAULT_HOSTNAME.to_string(),
            process_handles: ProcessHandles::default(),
        }
    }
}

/// Application-wide preferences (`config.general`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// UI language as an ISO code.
    #[serde(rename = "lang")]
    pub language: String,
    /// Whether updates are checked for in the background.
    #[serde(rename = "autoUpdate")]
    pub auto_update: bool,
    /// Minutes between background update checks.
    #[serde(rename = "updateCheckPeriod")]
    pub update_check_period: u64,
    /// Window theme.
    pub theme: Theme,
    /// Set once the server settings have been saved for the first time.
    #[serde(rename = "setup")]
    pub setup_completed: bool,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            language: "en".to_string(),
            auto_update: true,
            update_check_period: DEFAULT_UPDATE_CHECK_PERIOD,
            theme: Theme::Light,
            setup_completed: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Theme {
    #[default]
    Light,
    Dark,
}

/// The whole `config` document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistedConfig {
    pub server: ServerConfig,
    pub general: GeneralConfig,
}

/// Logical service name to OS pid.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessHandles(BTreeMap<String, u32>);

impl ProcessHandles {
    pub fn get(&self, service: &str) -> Option<u32> {
        self.0.get(service).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, u32)> {
        self.0.iter().map(|(name, pid)| (name.as_str(), *pid))
    }
}

impl Serialize for ProcessHandles {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (service, pid) in &self.0 {
            map.serialize_entry(&pid_key(service), pid)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for ProcessHandles {
    // Receives every key of `server` not claimed by a named field, so anything
    // that is not a `<service>Pid` holding a usable pid is ignored.
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = BTreeMap::<String, Value>::deserialize(deserializer)?;
        let handles = raw
            .into_iter()
            .filter_map(|(key, value)| {
                let service = key.strip_suffix(PID_SUFFIX).filter(|s| !s.is_empty())?;
                let pid = value.as_u64().and_then(|pid| u32::try_from(pid).ok())?;
                Some((service.to_string(), pid))
            })
            .collect();
        Ok(Self(handles))
    }
}

/// Key under `config.server` that holds the pid of `service`.
pub fn pid_key(service: &str) -> String {
    format!("{}{}", service, PID_SUFFIX)
}

// Older builds stored the port as a string.
fn port_from_value<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u16, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Port {
        Number(u16),
        Text(String),
    }
    match Port::deserialize(deserializer)? {
        Port::Number(port) => Ok(port),
        Port::Text(text) => text
            .trim()
            .parse()
            .map_err(|_| de::Error::custom(format!("invalid port {:?}", text))),
    }
}

/// The document written on first launch.
pub fn default_document() -> Value {
    json!({
        "server": {
            "PORT": DEFAULT_PORT,
            "GAUZY_API_SERVER_URL": DEFAULT_API_URL,
            "NEXT_PUBLIC_GAUZY_API_SERVER_URL": DEFAULT_API_URL,
            "DESKTOP_WEB_SERVER_HOSTNAME": DEFAULT_HOSTNAME,
        },
        "general": {
            "lang": "en",
            "autoUpdate": true,
            "updateCheckPeriod": DEFAULT_UPDATE_CHECK_PERIOD,
            "theme": "light",
            "setup": false,
        }
    })
}

/// Required settings that were absent, empty or unusable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Error)]
pub struct MissingFields {
    /// Absent or blank.
    pub fields: Vec<String>,
    /// Present but not usable, such as a port outside 1..=65535.
    pub invalid: Vec<String>,
}

impl MissingFields {
    fn is_empty(&self) -> bool {
        self.fields.is_empty() && self.invalid.is_empty()
    }
}

impl fmt::Display for MissingFields {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if !self.fields.is_empty() {
            parts.push(format!("missing required settings: {}", self.fields.join(", ")));
        }
        if !self.invalid.is_empty() {
            parts.push(format!("invalid settings: {}", self.invalid.join(", ")));
        }
        f.write_str(&parts.join("; "))
    }
}

/// Checks that the document carries everything needed to start the web server.
///
/// Every missing or invalid field is reported, not just the first one.
pub fn validate(config: &Value) -> Result<(), MissingFields> {
    let server = config.get("server");
    let mut problems = MissingFields::default();
    for field in REQUIRED_SERVER_FIELDS {
        let name = format!("server.{}", field);
        match server
            .and_then(|section| section.get(field))
            .filter(|value| is_present(value))
        {
            None => problems.fields.push(name),
            Some(value) if field == "PORT" && !is_valid_port(value) => problems.invalid.push(name),
            Some(_) => {}
        }
    }
    if problems.is_empty() {
        Ok(())
    } else {
        Err(problems)
    }
}

fn is_present(value: &Value) -> bool {
    match value {
        Value::Number(_) => true,
        Value::String(text) => !text.trim().is_empty(),
        _ => false,
    }
}

fn is_valid_port(value: &Value) -> bool {
    let port = match value {
        Value::Number(number) => number.as_u64(),
        Value::String(text) => text.trim().parse::<u64>().ok(),
        _ => None,
    };
    matches!(port, Some(1..=65535))
}
