//! Lane routing table.
//!
//! Every task kind maps to exactly one lane plus its retry and timeout
//! policy. The table is static for the life of a process: it is built at
//! startup (built-in defaults, an optional TOML file, then env overrides)
//! and lookups never mutate it. An unknown kind is a configuration error.

use crate::error::{Error, Result};
use crate::model::Lane;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Hard wall-clock limit when a route does not set one.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

/// Top-level TOML wrapper.
#[derive(Debug, Deserialize)]
struct RoutesFile {
    #[serde(default)]
    route: Vec<RouteEntry>,
}

#[derive(Debug, Deserialize)]
struct RouteEntry {
    kind: String,
    lane: Lane,
    max_attempts: u32,
    #[serde(default)]
    base_delay_secs: u64,
    timeout_secs: Option<u64>,
    soft_timeout_secs: Option<u64>,
}

/// How one kind of task is scheduled and retried.
#[derive(Debug, Clone, PartialEq)]
pub struct KindPolicy {
    pub kind: String,
    pub lane: Lane,
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub base_delay: Duration,
    /// Hard limit; the execution is abandoned when it elapses.
    pub timeout: Duration,
    /// Checkpoint limit; callbacks that check in after this stop early.
    pub soft_timeout: Duration,
}

impl KindPolicy {
    pub fn new(kind: impl Into<String>, lane: Lane, max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            kind: kind.into(),
            lane,
            max_attempts,
            base_delay,
            timeout: DEFAULT_TIMEOUT,
            soft_timeout: soft_default(DEFAULT_TIMEOUT),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self.soft_timeout = soft_default(timeout);
        self
    }

    pub fn with_soft_timeout(mut self, soft_timeout: Duration) -> Self {
        self.soft_timeout = soft_timeout;
        self
    }

    /// Delay before retrying after `failed_attempt` (0-based) failed:
    /// `base_delay * 2^failed_attempt`, so the first retry waits `base_delay`.
    pub fn retry_delay(&self, failed_attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(failed_attempt).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor)
    }

    fn validate(&self) -> Result<()> {
        if self.kind.is_empty() {
            return Err(Error::Config("route with empty kind".to_string()));
        }
        if self.max_attempts == 0 {
            return Err(Error::Config(format!(
                "route {}: max_attempts must be at least 1",
                self.kind
            )));
        }
        if self.timeout.is_zero() || self.soft_timeout > self.timeout {
            return Err(Error::Config(format!(
                "route {}: soft timeout must not exceed a non-zero hard timeout",
                self.kind
            )));
        }
        Ok(())
    }
}

/// Soft limit defaults to 90% of the hard one.
fn soft_default(timeout: Duration) -> Duration {
    timeout.mul_f64(0.9)
}

/// Per-kind adjustment applied on top of the table (from the environment).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct KindOverride {
    pub kind: String,
    pub max_attempts: Option<u32>,
    pub base_delay: Option<Duration>,
}

/// The routing table, indexed by kind.
#[derive(Debug, Clone)]
pub struct RoutingTable {
    routes: HashMap<String, KindPolicy>,
}

impl RoutingTable {
    pub fn empty() -> Self {
        Self {
            routes: HashMap::new(),
        }
    }

    /// The platform's standard table.
    pub fn builtin() -> Self {
        let mut table = Self::empty();
        for policy in [
            KindPolicy::new("notify-status", Lane::Urgent, 5, Duration::from_secs(30)),
            KindPolicy::new("generate-embedding", Lane::FastCompute, 3, Duration::from_secs(60)),
            KindPolicy::new("run-analysis", Lane::HeavyCompute, 3, Duration::from_secs(120)),
            KindPolicy::new("purge-old-records", Lane::Background, 1, Duration::ZERO),
        ] {
            table.routes.insert(policy.kind.clone(), policy);
        }
        table
    }

    /// Load a table from a TOML file of `[[route]]` entries.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read routes file {}: {e}", path.display()))
        })?;
        Self::from_toml(&content)
            .map_err(|e| Error::Config(format!("bad routes file {}: {e}", path.display())))
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let file: RoutesFile =
            toml::from_str(content).map_err(|e| Error::Config(e.to_string()))?;

        let mut table = Self::empty();
        for entry in file.route {
            let timeout = entry
                .timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_TIMEOUT);
            let mut policy = KindPolicy::new(
                entry.kind,
                entry.lane,
                entry.max_attempts,
                Duration::from_secs(entry.base_delay_secs),
            )
            .with_timeout(timeout);
            if let Some(soft) = entry.soft_timeout_secs {
                policy = policy.with_soft_timeout(Duration::from_secs(soft));
            }
            table.insert(policy)?;
        }
        Ok(table)
    }

    /// Add a route. Duplicate kinds are rejected.
    pub fn insert(&mut self, policy: KindPolicy) -> Result<()> {
        policy.validate()?;
        if self.routes.contains_key(&policy.kind) {
            return Err(Error::Config(format!("duplicate route for {}", policy.kind)));
        }
        self.routes.insert(policy.kind.clone(), policy);
        Ok(())
    }

    pub fn apply_override(&mut self, ov: &KindOverride) -> Result<()> {
        let policy = self
            .routes
            .get_mut(&ov.kind)
            .ok_or_else(|| Error::Config(format!("override for unrouted kind {}", ov.kind)))?;
        if let Some(n) = ov.max_attempts {
            policy.max_attempts = n;
        }
        if let Some(delay) = ov.base_delay {
            policy.base_delay = delay;
        }
        policy.validate()
    }

    /// The lane a kind runs in.
    pub fn route(&self, kind: &str) -> Result<Lane> {
        self.policy(kind).map(|p| p.lane)
    }

    pub fn policy(&self, kind: &str) -> Result<&KindPolicy> {
        self.routes
            .get(kind)
            .ok_or_else(|| Error::UnknownKind(kind.to_string()))
    }

    /// Routes ordered by lane priority, then kind.
    pub fn policies(&self) -> Vec<&KindPolicy> {
        let mut all: Vec<_> = self.routes.values().collect();
        all.sort_by(|a, b| (a.lane, &a.kind).cmp(&(b.lane, &b.kind)));
        all
    }

    /// Longest hard timeout among kinds routed to any of `lanes`.
    pub fn max_timeout(&self, lanes: &[Lane]) -> Duration {
        self.routes
            .values()
            .filter(|p| lanes.contains(&p.lane))
            .map(|p| p.timeout)
            .max()
            .unwrap_or(Duration::ZERO)
    }
}
