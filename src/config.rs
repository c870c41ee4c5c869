use anyhow::{Context, Result, anyhow, bail};
use std::collections::HashMap;
use std::env;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_LEASE_TIMEOUT: Duration = Duration::from_secs(120);
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_RESULT_TTL: Duration = Duration::from_secs(600);
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

/// Missed heartbeats after which a worker is reported stale.
pub const STALE_AFTER_MISSED_HEARTBEATS: u32 = 3;

fn parse_or<T, F>(lookup: &F, key: &str, default: T) -> Result<T>
where
  T: FromStr,
  T::Err: std::fmt::Display,
  F: Fn(&str) -> Option<String>,
{
  match lookup(key) {
    Some(raw) if !raw.trim().is_empty() => raw
      .trim()
      .parse()
      .map_err(|e| anyhow!("invalid value {:?} for {}: {}", raw, key, e)),
    _ => Ok(default),
  }
}

fn required<F: Fn(&str) -> Option<String>>(lookup: &F, key: &str) -> Result<String> {
  lookup(key)
    .filter(|v| !v.trim().is_empty())
    .with_context(|| format!("{} must be set", key))
}

/// Parses `type=secs,type=secs`.
pub fn parse_lease_timeouts(raw: &str) -> Result<HashMap<String, Duration>> {
  let mut out = HashMap::new();
  for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
    let (kind, secs) = entry
      .split_once('=')
      .with_context(|| format!("lease timeout entry {:?} is not type=secs", entry))?;
    let secs: u64 = secs
      .trim()
      .parse()
      .with_context(|| format!("lease timeout for {:?} is not a number", kind))?;
    if secs == 0 {
      bail!("lease timeout for {:?} must be positive", kind);
    }
    out.insert(kind.trim().to_string(), Duration::from_secs(secs));
  }
  Ok(out)
}

#[derive(Debug, Clone)]
pub struct BrokerConfig {
  pub secret: String,
  pub server_port: u16,
  pub lease_timeout: Duration,
  pub lease_timeouts: HashMap<String, Duration>,
  pub sweep_interval: Duration,
  pub result_ttl: Duration,
  pub heartbeat_interval: Duration,
  pub worker_prune_after: Option<Duration>,
}

impl BrokerConfig {
  pub fn new(secret: impl Into<String>) -> Self {
    Self {
      secret: secret.into(),
      server_port: 8080,
      lease_timeout: DEFAULT_LEASE_TIMEOUT,
      lease_timeouts: HashMap::new(),
      sweep_interval: DEFAULT_SWEEP_INTERVAL,
      result_ttl: DEFAULT_RESULT_TTL,
      heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
      worker_prune_after: None,
    }
  }

  pub fn from_env() -> Result<Self> {
    Self::from_lookup(|key| env::var(key).ok())
  }

  pub fn from_lookup<F: Fn(&str) -> Option<String>>(lookup: F) -> Result<Self> {
    let mut config = Self::new(required(&lookup, "SWARM_SECRET")?);
    config.server_port = parse_or(&lookup, "SERVER_PORT", 8080)?;
    config.lease_timeout = Duration::from_secs(parse_or(&lookup, "LEASE_TIMEOUT_SECS", 120)?);
    config.sweep_interval = Duration::from_secs(parse_or(&lookup, "SWEEP_INTERVAL_SECS", 30)?);
    config.result_ttl = Duration::from_secs(parse_or(&lookup, "RESULT_TTL_SECS", 600)?);
    config.heartbeat_interval = Duration::from_secs(parse_or(&lookup, "HEARTBEAT_INTERVAL_SECS", 10)?);
    if let Some(raw) = lookup("LEASE_TIMEOUTS") {
      config.lease_timeouts = parse_lease_timeouts(&raw)?;
    }
    let prune: u64 = parse_or(&lookup, "WORKER_PRUNE_AFTER_SECS", 0)?;
    config.worker_prune_after = (prune > 0).then(|| Duration::from_secs(prune));

    if config.sweep_interval.is_zero() || config.lease_timeout.is_zero() {
      bail!("SWEEP_INTERVAL_SECS and LEASE_TIMEOUT_SECS must be positive");
    }
    Ok(config)
  }

  pub fn with_lease_timeout(mut self, kind: impl Into<String>, timeout: Duration) -> Self {
    self.lease_timeouts.insert(kind.into(), timeout);
    self
  }

  pub fn lease_timeout_for(&self, kind: &str) -> Duration {
    self.lease_timeouts.get(kind).copied().unwrap_or(self.lease_timeout)
  }

  pub fn stale_after(&self) -> Duration {
    self.heartbeat_interval * STALE_AFTER_MISSED_HEARTBEATS
  }
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
  pub broker_urls: Vec<String>,
  pub secret: String,
  pub worker_id: Option<String>,
  pub hostname: Option<String>,
  pub poll_interval: Duration,
  pub heartbeat_interval: Duration,
  pub request_timeout: Duration,
  pub result_retries: usize,
  pub max_concurrent: usize,
  pub failure_threshold: u32,
  pub reconnect_base: Duration,
  pub reconnect_max: Duration,
}

impl AgentConfig {
  pub fn new(broker_urls: Vec<String>, secret: impl Into<String>) -> Self {
    Self {
      broker_urls,
      secret: secret.into(),
      worker_id: None,
      hostname: None,
      poll_interval: Duration::from_millis(3000),
      heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
      request_timeout: Duration::from_secs(15),
      result_retries: 5,
      max_concurrent: 1,
      failure_threshold: 3,
      reconnect_base: Duration::from_millis(2000),
      reconnect_max: Duration::from_millis(5000),
    }
  }

  pub fn from_env() -> Result<Self> {
    Self::from_lookup(|key| env::var(key).ok())
  }

  pub fn from_lookup<F: Fn(&str) -> Option<String>>(lookup: F) -> Result<Self> {
    let urls: Vec<String> = required(&lookup, "BROKER_URLS")?
      .split(',')
      .map(|u| u.trim().trim_end_matches('/').to_string())
      .filter(|u| !u.is_empty())
      .collect();
    if urls.is_empty() {
      bail!("BROKER_URLS must list at least one endpoint");
    }

    let mut config = Self::new(urls, required(&lookup, "SWARM_SECRET")?);
    config.worker_id = lookup("WORKER_ID").filter(|v| !v.trim().is_empty());
    config.hostname = lookup("WORKER_HOSTNAME")
      .or_else(|| lookup("HOSTNAME"))
      .filter(|v| !v.trim().is_empty());
    config.poll_interval = Duration::from_millis(parse_or(&lookup, "POLL_INTERVAL_MS", 3000)?);
    config.heartbeat_interval = Duration::from_secs(parse_or(&lookup, "HEARTBEAT_INTERVAL_SECS", 10)?);
    config.request_timeout = Duration::from_secs(parse_or(&lookup, "REQUEST_TIMEOUT_SECS", 15)?);
    config.result_retries = parse_or(&lookup, "RESULT_RETRIES", 5)?;
    config.max_concurrent = parse_or::<usize, _>(&lookup, "MAX_CONCURRENT", 1)?.max(1);
    config.failure_threshold = parse_or::<u32, _>(&lookup, "FAILURE_THRESHOLD", 3)?.max(1);
    config.reconnect_base = Duration::from_millis(parse_or(&lookup, "RECONNECT_BASE_MS", 2000)?);
    config.reconnect_max = Duration::from_millis(parse_or(&lookup, "RECONNECT_MAX_MS", 5000)?);
    if config.poll_interval.is_zero() {
      bail!("POLL_INTERVAL_MS must be positive");
    }
    if config.heartbeat_interval.is_zero() {
      bail!("HEARTBEAT_INTERVAL_SECS must be positive");
    }
    if config.reconnect_base.is_zero() {
      bail!("RECONNECT_BASE_MS must be positive");
    }
    if config.reconnect_max < config.reconnect_base {
      bail!("RECONNECT_MAX_MS must not be below RECONNECT_BASE_MS");
    }
    Ok(config)
  }
}
