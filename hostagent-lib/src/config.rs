use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("{key} has invalid value {value:?}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Agent configuration
#[derive(Clone, Debug)]
pub struct AgentConfig {
    pub api_host: String,
    pub api_port: u16,
    pub port_range_start: u16,
    pub port_range_end: u16,
    /// Skip auto candidates that cannot actually be bound on the host.
    pub probe_host_ports: bool,
    pub reconcile_interval: Duration,
    pub telemetry_interval: Duration,
    pub runtime_timeout: Duration,
    pub create_timeout: Duration,
    pub provision_timeout: Duration,
    pub runtime_retries: u32,
    pub startup_check: Duration,
    /// `None` disables registry persistence.
    pub state_file: Option<PathBuf>,
    pub telemetry_url: Option<String>,
    pub telemetry_secret: Option<String>,
    pub enforce_storage_quota: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            api_host: "0.0.0.0".to_string(),
            api_port: 8765,
            port_range_start: 10000,
            port_range_end: 65535,
            probe_host_ports: true,
            reconcile_interval: Duration::from_secs(30),
            telemetry_interval: Duration::from_secs(3),
            runtime_timeout: Duration::from_secs(30),
            create_timeout: Duration::from_secs(600),
            provision_timeout: Duration::from_secs(600),
            runtime_retries: 3,
            startup_check: Duration::from_millis(2000),
            state_file: Some(PathBuf::from("state.json")),
            telemetry_url: None,
            telemetry_secret: None,
            enforce_storage_quota: false,
        }
    }
}

impl AgentConfig {
    /// Read `AGENT_*` variables from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string());

        let config = Self {
            api_host: get("AGENT_API_HOST")
                .filter(|v| !v.is_empty())
                .unwrap_or(defaults.api_host),
            api_port: parse_or(&get, "AGENT_API_PORT", defaults.api_port)?,
            port_range_start: parse_or(&get, "AGENT_PORT_RANGE_START", defaults.port_range_start)?,
            port_range_end: parse_or(&get, "AGENT_PORT_RANGE_END", defaults.port_range_end)?,
            probe_host_ports: parse_bool_or(
                &get,
                "AGENT_PROBE_HOST_PORTS",
                defaults.probe_host_ports,
            )?,
            reconcile_interval: secs_or(
                &get,
                "AGENT_RECONCILE_INTERVAL_SECS",
                defaults.reconcile_interval,
            )?,
            telemetry_interval: secs_or(
                &get,
                "AGENT_TELEMETRY_INTERVAL_SECS",
                defaults.telemetry_interval,
            )?,
            runtime_timeout: secs_or(&get, "AGENT_RUNTIME_TIMEOUT_SECS", defaults.runtime_timeout)?,
            create_timeout: secs_or(&get, "AGENT_CREATE_TIMEOUT_SECS", defaults.create_timeout)?,
            provision_timeout: secs_or(
                &get,
                "AGENT_PROVISION_TIMEOUT_SECS",
                defaults.provision_timeout,
            )?,
            runtime_retries: parse_or(&get, "AGENT_RUNTIME_RETRIES", defaults.runtime_retries)?,
            startup_check: Duration::from_millis(parse_or(
                &get,
                "AGENT_STARTUP_CHECK_MS",
                defaults.startup_check.as_millis() as u64,
            )?),
            state_file: match get("AGENT_STATE_FILE") {
                Some(path) if path.is_empty() => None,
                Some(path) => Some(PathBuf::from(path)),
                None => defaults.state_file,
            },
            telemetry_url: get("AGENT_TELEMETRY_URL").filter(|v| !v.is_empty()),
            telemetry_secret: get("AGENT_TELEMETRY_SECRET").filter(|v| !v.is_empty()),
            enforce_storage_quota: parse_bool_or(
                &get,
                "AGENT_ENFORCE_STORAGE_QUOTA",
                defaults.enforce_storage_quota,
            )?,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.port_range_start == 0 || self.port_range_start > self.port_range_end {
            return Err(ConfigError::Invalid {
                key: "AGENT_PORT_RANGE_START",
                value: self.port_range_start.to_string(),
                reason: format!("must be in 1..={}", self.port_range_end),
            });
        }
        for (key, value) in [
            ("AGENT_RECONCILE_INTERVAL_SECS", self.reconcile_interval),
            ("AGENT_TELEMETRY_INTERVAL_SECS", self.telemetry_interval),
            ("AGENT_RUNTIME_TIMEOUT_SECS", self.runtime_timeout),
            ("AGENT_CREATE_TIMEOUT_SECS", self.create_timeout),
            ("AGENT_PROVISION_TIMEOUT_SECS", self.provision_timeout),
        ] {
            if value.is_zero() {
                return Err(ConfigError::Invalid {
                    key,
                    value: "0".to_string(),
                    reason: "must be positive".to_string(),
                });
            }
        }
        if self.runtime_retries == 0 {
            return Err(ConfigError::Invalid {
                key: "AGENT_RUNTIME_RETRIES",
                value: "0".to_string(),
                reason: "at least one attempt is required".to_string(),
            });
        }
        Ok(())
    }

    pub fn api_addr(&self) -> String {
        format!("{}:{}", self.api_host, self.api_port)
    }
}

fn parse_or<T, G>(get: &G, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        None => Ok(default),
        Some(v) if v.is_empty() => Ok(default),
        Some(v) => v.parse().map_err(|e: T::Err| ConfigError::Invalid {
            key,
            value: v.clone(),
            reason: e.to_string(),
        }),
    }
}

fn secs_or<G>(get: &G, key: &'static str, default: Duration) -> Result<Duration, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    parse_or(get, key, default.as_secs()).map(Duration::from_secs)
}

fn parse_bool_or<G>(get: &G, key: &'static str, default: bool) -> Result<bool, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    match get(key).map(|v| v.to_ascii_lowercase()) {
        None => Ok(default),
        Some(v) => match v.as_str() {
            "" => Ok(default),
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::Invalid {
                key,
                value: v.clone(),
                reason: "expected true or false".to_string(),
            }),
        },
    }
}
