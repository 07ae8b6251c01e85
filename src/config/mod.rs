//! Typed configuration from environment variables.
//!
//! Loads once at startup, fails fast if required vars are missing or
//! malformed. Connection URLs are wrapped in `secrecy::SecretString` so they
//! never end up in logs.

use crate::error::{Error, Result};
use crate::model::Lane;
use crate::routing::{KindOverride, RoutingTable};
use secrecy::SecretString;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug)]
pub struct Config {
    /// Broker endpoint (Postgres with pgmq).
    pub database_url: SecretString,
    /// Result store + broadcast endpoint. Defaults to the broker's.
    pub result_store_url: SecretString,
    pub result_ttl: Duration,
    /// Execution slots per lane. Lanes not listed are not served.
    pub lane_concurrency: Vec<(Lane, usize)>,
    pub kind_overrides: Vec<KindOverride>,
    pub routes_file: Option<PathBuf>,
    /// Items a worker executes before recycling itself.
    pub worker_max_items: u64,
    pub visibility_timeout: Duration,
    pub poll_interval: Duration,
    pub gateway_addr: String,
    pub gateway_idle_timeout: Duration,
    /// Base URL the HTTP callback handler posts work to.
    pub callback_url: Option<String>,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        let database_url = required_var("DATABASE_URL")?;
        let result_store_url =
            std::env::var("RESULT_STORE_URL").unwrap_or_else(|_| database_url.clone());

        let lane_concurrency = match std::env::var("LANE_CONCURRENCY") {
            Ok(raw) => parse_lane_concurrency(&raw)?,
            Err(_) => Lane::ALL.iter().map(|&lane| (lane, 1)).collect(),
        };
        let kind_overrides = match std::env::var("KIND_OVERRIDES") {
            Ok(raw) => parse_kind_overrides(&raw)?,
            Err(_) => Vec::new(),
        };

        Ok(Self {
            database_url: SecretString::from(database_url),
            result_store_url: SecretString::from(result_store_url),
            result_ttl: Duration::from_secs(parsed_var("RESULT_TTL_SECS", 3600)?),
            lane_concurrency,
            kind_overrides,
            routes_file: std::env::var("ROUTES_FILE").ok().map(PathBuf::from),
            worker_max_items: parsed_var("WORKER_MAX_ITEMS", 100)?,
            visibility_timeout: Duration::from_secs(parsed_var("VISIBILITY_TIMEOUT_SECS", 360)?),
            poll_interval: Duration::from_millis(parsed_var("POLL_INTERVAL_MS", 1000)?),
            gateway_addr: std::env::var("GATEWAY_ADDR")
                .unwrap_or_else(|_| "0.0.0.0:8080".to_string()),
            gateway_idle_timeout: Duration::from_secs(parsed_var(
                "GATEWAY_IDLE_TIMEOUT_SECS",
                300,
            )?),
            callback_url: std::env::var("CALLBACK_URL").ok(),
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        })
    }

    /// Build the routing table: the TOML file if configured, otherwise the
    /// built-in table, with per-kind overrides applied on top.
    pub fn routing_table(&self) -> Result<RoutingTable> {
        let mut table = match &self.routes_file {
            Some(path) => RoutingTable::load_from_file(path)?,
            None => RoutingTable::builtin(),
        };
        for ov in &self.kind_overrides {
            table.apply_override(ov)?;
        }
        Ok(table)
    }
}

fn required_var(name: &str) -> Result<String> {
    std::env::var(name)
        .map_err(|_| Error::Config(format!("required environment variable {name} is not set")))
}

fn parsed_var<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e| Error::Config(format!("{name}={raw:?}: {e}"))),
        Err(_) => Ok(default),
    }
}

/// Parse `urgent=2,fast-compute=1` into per-lane slot counts, highest
/// priority first.
pub fn parse_lane_concurrency(raw: &str) -> Result<Vec<(Lane, usize)>> {
    let mut lanes = Vec::new();
    for part in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (name, slots) = part
            .split_once('=')
            .ok_or_else(|| Error::Config(format!("LANE_CONCURRENCY entry {part:?} needs lane=N")))?;
        let lane: Lane = name.trim().parse()?;
        let slots: usize = slots
            .trim()
            .parse()
            .map_err(|e| Error::Config(format!("LANE_CONCURRENCY {name}: {e}")))?;
        if slots == 0 {
            return Err(Error::Config(format!("LANE_CONCURRENCY {name}: need at least one slot")));
        }
        if lanes.iter().any(|(l, _)| *l == lane) {
            return Err(Error::Config(format!("LANE_CONCURRENCY lists {lane} twice")));
        }
        lanes.push((lane, slots));
    }
    lanes.sort_by_key(|(lane, _)| *lane);
    Ok(lanes)
}

/// Parse `run-analysis:max_attempts=5,base_delay=30;notify-status:max_attempts=2`.
/// `base_delay` is in seconds.
pub fn parse_kind_overrides(raw: &str) -> Result<Vec<KindOverride>> {
    let mut overrides = Vec::new();
    for entry in raw.split(';').map(str::trim).filter(|e| !e.is_empty()) {
        let (kind, fields) = entry
            .split_once(':')
            .ok_or_else(|| Error::Config(format!("KIND_OVERRIDES entry {entry:?} needs kind:field=value")))?;
        let mut ov = KindOverride {
            kind: kind.trim().to_string(),
            ..Default::default()
        };
        for field in fields.split(',').map(str::trim).filter(|f| !f.is_empty()) {
            let (key, value) = field
                .split_once('=')
                .ok_or_else(|| Error::Config(format!("KIND_OVERRIDES field {field:?} needs key=value")))?;
            let value: u64 = value
                .trim()
                .parse()
                .map_err(|e| Error::Config(format!("KIND_OVERRIDES {kind}.{key}: {e}")))?;
            match key.trim() {
                "max_attempts" => {
                    let attempts = u32::try_from(value).map_err(|_| {
                        Error::Config(format!("KIND_OVERRIDES {kind}.max_attempts: {value} is too large"))
                    })?;
                    ov.max_attempts = Some(attempts);
                }
                "base_delay" => ov.base_delay = Some(Duration::from_secs(value)),
                other => {
                    return Err(Error::Config(format!("KIND_OVERRIDES: unknown field {other}")));
                }
            }
        }
        overrides.push(ov);
    }
    Ok(overrides)
}
