use std::env;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, VigilError};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    pub state_dir: PathBuf,
    pub query_tcp_addr: String,
    pub uds_path: PathBuf,
    pub trace_retention: Duration,
    pub max_traces: usize,
    pub max_spans_per_trace: usize,
    pub slow_trace_threshold: Duration,
    pub maintenance_interval: Duration,
    pub sampling_rate: f64,
    pub adaptive_sampling: bool,
    pub sampling_high_water: f64,
    pub sampling_low_water: f64,
    pub alert_evaluation_interval: Duration,
    pub alert_timer_interval: Duration,
    pub alert_maintenance_interval: Duration,
    pub max_alert_history: usize,
    pub webhook_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        let home = env::var("HOME").unwrap_or_else(|_| ".".to_string());
        let xdg_runtime = env::var("XDG_RUNTIME_DIR").ok();
        let data_home = env::var("XDG_DATA_HOME").ok();

        let data_root = data_home
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(home).join(".local/share"));

        let uds_path = xdg_runtime
            .map(PathBuf::from)
            .unwrap_or_else(|| data_root.join("vigil"))
            .join("vigil.sock");

        Self {
            state_dir: data_root.join("vigil/alerts"),
            query_tcp_addr: "127.0.0.1:1787".to_string(),
            uds_path,
            trace_retention: Duration::from_secs(60 * 60 * 24),
            max_traces: 50_000,
            max_spans_per_trace: 1_000,
            slow_trace_threshold: Duration::from_secs(5),
            maintenance_interval: Duration::from_secs(5 * 60),
            sampling_rate: 1.0,
            adaptive_sampling: true,
            sampling_high_water: 1_000.0,
            sampling_low_water: 100.0,
            alert_evaluation_interval: Duration::from_secs(30),
            alert_timer_interval: Duration::from_secs(1),
            alert_maintenance_interval: Duration::from_secs(60),
            max_alert_history: 10_000,
            webhook_timeout: Duration::from_secs(10),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let mut cfg = Self::default();
        let config_path = config_file_path();
        if let Some(file_overrides) = load_file_overrides(&config_path)? {
            apply_overrides(&mut cfg, file_overrides, "config file")?;
        }
        let env_overrides = load_env_overrides()?;
        apply_overrides(&mut cfg, env_overrides, "environment")?;
        Ok(cfg)
    }

    pub fn from_env() -> Result<Self> {
        let mut cfg = Self::default();
        let env_overrides = load_env_overrides()?;
        apply_overrides(&mut cfg, env_overrides, "environment")?;
        Ok(cfg)
    }
}

#[derive(Debug, Default, Deserialize)]
struct ConfigOverrides {
    state_dir: Option<PathBuf>,
    query_tcp_addr: Option<String>,
    uds_path: Option<PathBuf>,
    trace_retention: Option<String>,
    max_traces: Option<usize>,
    max_spans_per_trace: Option<usize>,
    slow_trace_threshold: Option<String>,
    maintenance_interval: Option<String>,
    sampling_rate: Option<f64>,
    adaptive_sampling: Option<bool>,
    sampling_high_water: Option<f64>,
    sampling_low_water: Option<f64>,
    alert_evaluation_interval: Option<String>,
    alert_timer_interval: Option<String>,
    alert_maintenance_interval: Option<String>,
    max_alert_history: Option<usize>,
    webhook_timeout: Option<String>,
}

fn config_file_path() -> PathBuf {
    if let Ok(path) = env::var("VIGIL_CONFIG") {
        return PathBuf::from(path);
    }

    let home = env::var("HOME").unwrap_or_else(|_| ".".to_string());
    let config_home = env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(home).join(".config"));
    config_home.join("vigil/config.toml")
}

fn load_file_overrides(path: &PathBuf) -> Result<Option<ConfigOverrides>> {
    if !path.exists() {
        return Ok(None);
    }

    let raw = fs::read_to_string(path)
        .map_err(|e| VigilError::Config(format!("failed reading {}: {e}", path.display())))?;
    let parsed: ConfigOverrides = toml::from_str(&raw)
        .map_err(|e| VigilError::Config(format!("failed parsing {}: {e}", path.display())))?;
    Ok(Some(parsed))
}

fn env_parsed<T>(key: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(v) => v
            .parse::<T>()
            .map(Some)
            .map_err(|e| VigilError::Config(format!("bad {key} in environment: {e}"))),
        Err(_) => Ok(None),
    }
}

fn load_env_overrides() -> Result<ConfigOverrides> {
    Ok(ConfigOverrides {
        state_dir: env::var("VIGIL_STATE_DIR").ok().map(PathBuf::from),
        query_tcp_addr: env::var("VIGIL_QUERY_TCP_ADDR").ok(),
        uds_path: env::var("VIGIL_QUERY_UDS_PATH").ok().map(PathBuf::from),
        trace_retention: env::var("VIGIL_TRACE_RETENTION").ok(),
        max_traces: env_parsed("VIGIL_MAX_TRACES")?,
        max_spans_per_trace: env_parsed("VIGIL_MAX_SPANS_PER_TRACE")?,
        slow_trace_threshold: env::var("VIGIL_SLOW_TRACE_THRESHOLD").ok(),
        maintenance_interval: env::var("VIGIL_MAINTENANCE_INTERVAL").ok(),
        sampling_rate: env_parsed("VIGIL_SAMPLING_RATE")?,
        adaptive_sampling: env_parsed("VIGIL_ADAPTIVE_SAMPLING")?,
        sampling_high_water: None,
        sampling_low_water: None,
        alert_evaluation_interval: env::var("VIGIL_ALERT_EVALUATION_INTERVAL").ok(),
        alert_timer_interval: None,
        alert_maintenance_interval: env::var("VIGIL_ALERT_MAINTENANCE_INTERVAL").ok(),
        max_alert_history: env_parsed("VIGIL_MAX_ALERT_HISTORY")?,
        webhook_timeout: env::var("VIGIL_WEBHOOK_TIMEOUT").ok(),
    })
}

fn parse_duration_field(field: &str, value: &str, source: &str) -> Result<Duration> {
    humantime::parse_duration(value).map_err(|e| {
        VigilError::Config(format!("bad {field} in {source}: {e} (value={value})"))
    })
}

fn apply_overrides(cfg: &mut Config, overrides: ConfigOverrides, source: &str) -> Result<()> {
    if let Some(v) = overrides.state_dir {
        cfg.state_dir = v;
    }
    if let Some(v) = overrides.query_tcp_addr {
        cfg.query_tcp_addr = v;
    }
    if let Some(v) = overrides.uds_path {
        cfg.uds_path = v;
    }
    if let Some(v) = overrides.trace_retention {
        cfg.trace_retention = parse_duration_field("trace_retention", &v, source)?;
    }
    if let Some(v) = overrides.max_traces {
        cfg.max_traces = v;
    }
    if let Some(v) = overrides.max_spans_per_trace {
        if v == 0 {
            return Err(VigilError::Config(format!(
                "max_spans_per_trace in {source} must be positive"
            )));
        }
        cfg.max_spans_per_trace = v;
    }
    if let Some(v) = overrides.slow_trace_threshold {
        cfg.slow_trace_threshold = parse_duration_field("slow_trace_threshold", &v, source)?;
    }
    if let Some(v) = overrides.maintenance_interval {
        cfg.maintenance_interval = parse_duration_field("maintenance_interval", &v, source)?;
    }
    if let Some(v) = overrides.sampling_rate {
        if !(0.0..=1.0).contains(&v) {
            return Err(VigilError::Config(format!(
                "sampling_rate in {source} must be within 0..=1 (value={v})"
            )));
        }
        cfg.sampling_rate = v;
    }
    if let Some(v) = overrides.adaptive_sampling {
        cfg.adaptive_sampling = v;
    }
    if let Some(v) = overrides.sampling_high_water {
        cfg.sampling_high_water = v;
    }
    if let Some(v) = overrides.sampling_low_water {
        cfg.sampling_low_water = v;
    }
    if let Some(v) = overrides.alert_evaluation_interval {
        cfg.alert_evaluation_interval =
            parse_duration_field("alert_evaluation_interval", &v, source)?;
    }
    if let Some(v) = overrides.alert_timer_interval {
        cfg.alert_timer_interval = parse_duration_field("alert_timer_interval", &v, source)?;
    }
    if let Some(v) = overrides.alert_maintenance_interval {
        cfg.alert_maintenance_interval =
            parse_duration_field("alert_maintenance_interval", &v, source)?;
    }
    if let Some(v) = overrides.max_alert_history {
        cfg.max_alert_history = v;
    }
    if let Some(v) = overrides.webhook_timeout {
        cfg.webhook_timeout = parse_duration_field("webhook_timeout", &v, source)?;
    }
    Ok(())
}
