use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;

/// Orchestrator settings, sourced from `ORCH_*` environment variables.
///
/// Every field has a default so a bare `loft serve` works against a local
/// engine; production deployments override through the environment.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Inclusive host-port range handed out by the allocator.
    pub port_range: (u16, u16),
    pub max_environments_per_owner: u32,
    pub cpu_cap_pct: f64,
    pub mem_cap_pct: f64,
    pub disk_cap_pct: f64,
    /// Path to the IaaS tool binary.
    pub iaas_bin: String,
    /// Scratch directory for IaaS workspaces while rendering and restoring.
    pub archive_dir: PathBuf,
    pub metrics_interval: Duration,
    /// Default auto-stop threshold stamped on new environments.
    pub reap_idle_hours: u32,
    pub archive_retention_days: u32,
    /// PostgreSQL connection string; absent means the in-memory store.
    pub database_url: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            port_range: (8000, 9000),
            max_environments_per_owner: 5,
            cpu_cap_pct: 80.0,
            mem_cap_pct: 80.0,
            disk_cap_pct: 85.0,
            iaas_bin: "terraform".into(),
            archive_dir: default_archive_dir(),
            metrics_interval: Duration::from_secs(30),
            reap_idle_hours: 8,
            archive_retention_days: 30,
            database_url: None,
        }
    }
}

fn default_archive_dir() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".into());
    PathBuf::from(home).join(".loft").join("workspaces")
}

impl Settings {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build settings from an arbitrary lookup function. Lets tests inject
    /// variables without touching process state.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut s = Settings::default();

        if let Some(v) = lookup("ORCH_PORT_RANGE") {
            s.port_range = parse_port_range(&v)?;
        }
        if let Some(v) = lookup("ORCH_MAX_ENV_PER_USER") {
            s.max_environments_per_owner = parse_var("ORCH_MAX_ENV_PER_USER", &v)?;
        }
        if let Some(v) = lookup("ORCH_CPU_CAP_PCT") {
            s.cpu_cap_pct = parse_pct("ORCH_CPU_CAP_PCT", &v)?;
        }
        if let Some(v) = lookup("ORCH_MEM_CAP_PCT") {
            s.mem_cap_pct = parse_pct("ORCH_MEM_CAP_PCT", &v)?;
        }
        if let Some(v) = lookup("ORCH_DISK_CAP_PCT") {
            s.disk_cap_pct = parse_pct("ORCH_DISK_CAP_PCT", &v)?;
        }
        if let Some(v) = lookup("ORCH_IAAS_BIN") {
            s.iaas_bin = v;
        }
        if let Some(v) = lookup("ORCH_ARCHIVE_DIR") {
            s.archive_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("ORCH_METRICS_INTERVAL_SEC") {
            s.metrics_interval = Duration::from_secs(parse_var("ORCH_METRICS_INTERVAL_SEC", &v)?);
        }
        if let Some(v) = lookup("ORCH_REAP_IDLE_HOURS") {
            s.reap_idle_hours = parse_var("ORCH_REAP_IDLE_HOURS", &v)?;
        }
        if let Some(v) = lookup("ORCH_ARCHIVE_RETENTION_DAYS") {
            s.archive_retention_days = parse_var("ORCH_ARCHIVE_RETENTION_DAYS", &v)?;
        }
        s.database_url = lookup("ORCH_DATABASE_URL").filter(|v| !v.is_empty());

        Ok(s)
    }
}

fn parse_var<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidSetting {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_pct(key: &str, value: &str) -> Result<f64, ConfigError> {
    let pct: f64 = parse_var(key, value)?;
    if !(0.0..=100.0).contains(&pct) {
        return Err(ConfigError::InvalidSetting {
            key: key.to_string(),
            value: value.to_string(),
        });
    }
    Ok(pct)
}

fn parse_port_range(value: &str) -> Result<(u16, u16), ConfigError> {
    let invalid = || ConfigError::InvalidSetting {
        key: "ORCH_PORT_RANGE".to_string(),
        value: value.to_string(),
    };
    let (lo, hi) = value.split_once('-').ok_or_else(invalid)?;
    let lo: u16 = lo.trim().parse().map_err(|_| invalid())?;
    let hi: u16 = hi.trim().parse().map_err(|_| invalid())?;
    if lo == 0 || lo > hi {
        return Err(invalid());
    }
    Ok((lo, hi))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let s = Settings::from_lookup(|_| None).unwrap();
        assert_eq!(s.port_range, (8000, 9000));
        assert_eq!(s.max_environments_per_owner, 5);
        assert_eq!(s.cpu_cap_pct, 80.0);
        assert_eq!(s.disk_cap_pct, 85.0);
        assert_eq!(s.metrics_interval, Duration::from_secs(30));
        assert_eq!(s.reap_idle_hours, 8);
        assert_eq!(s.archive_retention_days, 30);
        assert!(s.database_url.is_none());
    }

    #[test]
    fn overrides_apply() {
        let s = Settings::from_lookup(|key| match key {
            "ORCH_PORT_RANGE" => Some("9100-9200".into()),
            "ORCH_MAX_ENV_PER_USER" => Some("2".into()),
            "ORCH_IAAS_BIN" => Some("/usr/local/bin/tofu".into()),
            "ORCH_METRICS_INTERVAL_SEC" => Some("5".into()),
            _ => None,
        })
        .unwrap();
        assert_eq!(s.port_range, (9100, 9200));
        assert_eq!(s.max_environments_per_owner, 2);
        assert_eq!(s.iaas_bin, "/usr/local/bin/tofu");
        assert_eq!(s.metrics_interval, Duration::from_secs(5));
    }

    #[test]
    fn bad_port_range_is_rejected() {
        for bad in ["9000-8000", "0-100", "8000", "a-b"] {
            let r = Settings::from_lookup(|key| {
                (key == "ORCH_PORT_RANGE").then(|| bad.to_string())
            });
            assert!(r.is_err(), "expected {bad:?} to be rejected");
        }
    }

    #[test]
    fn pct_out_of_range_is_rejected() {
        let r = Settings::from_lookup(|key| {
            (key == "ORCH_CPU_CAP_PCT").then(|| "140".to_string())
        });
        assert!(r.is_err());
    }
}
