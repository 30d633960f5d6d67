use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Deserializer};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// How the master orders queued queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SchedulingAlgorithm {
    /// Arrival order. No preemption, no aging.
    #[default]
    Fifo,
    /// Lowest priority number first, with preemption and optional aging.
    Priority,
}

impl SchedulingAlgorithm {
    /// Parse a configured value, falling back to FIFO for anything unknown.
    pub fn parse_lenient(raw: &str) -> Self {
        raw.parse().unwrap_or_else(|_| {
            tracing::warn!(
                value = raw,
                "Unknown scheduling algorithm, falling back to FIFO"
            );
            SchedulingAlgorithm::Fifo
        })
    }

    pub fn is_priority(self) -> bool {
        self == SchedulingAlgorithm::Priority
    }
}

impl FromStr for SchedulingAlgorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "FIFO" => Ok(SchedulingAlgorithm::Fifo),
            "PRIORITY" | "PRIORITIES" | "PRIORIDADES" => Ok(SchedulingAlgorithm::Priority),
            other => Err(format!("unknown scheduling algorithm '{other}'")),
        }
    }
}

impl fmt::Display for SchedulingAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchedulingAlgorithm::Fifo => f.write_str("FIFO"),
            SchedulingAlgorithm::Priority => f.write_str("PRIORITY"),
        }
    }
}

impl<'de> Deserialize<'de> for SchedulingAlgorithm {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(SchedulingAlgorithm::parse_lenient(&raw))
    }
}

/// Map a configured verbosity (TRACE, DEBUG, INFO, WARNING, ERROR) to an
/// `EnvFilter` directive. Unknown values map to `info`.
pub fn filter_directive(level: &str) -> &'static str {
    match level.trim().to_ascii_uppercase().as_str() {
        "TRACE" => "trace",
        "DEBUG" => "debug",
        "WARN" | "WARNING" => "warn",
        "ERROR" => "error",
        _ => "info",
    }
}

fn read_toml<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, ConfigError> {
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(toml::from_str(&contents)?)
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MasterConfig {
    pub listen_port: u16,
    pub scheduling_algorithm: SchedulingAlgorithm,
    /// Aging period in milliseconds. 0 disables aging.
    pub aging_interval_ms: u64,
    pub log_level: String,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            listen_port: 9001,
            scheduling_algorithm: SchedulingAlgorithm::Fifo,
            aging_interval_ms: 0,
            log_level: "INFO".to_string(),
        }
    }
}

impl MasterConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        read_toml(path.as_ref())
    }

    /// The aging period, if aging applies under this configuration.
    pub fn aging_interval(&self) -> Option<Duration> {
        if self.scheduling_algorithm.is_priority() && self.aging_interval_ms > 0 {
            Some(Duration::from_millis(self.aging_interval_ms))
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub master_host: String,
    pub master_port: u16,
    pub log_level: String,
    /// Searched for relative query paths that do not exist as given.
    pub queries_dir: PathBuf,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            master_host: "127.0.0.1".to_string(),
            master_port: 9001,
            log_level: "INFO".to_string(),
            queries_dir: PathBuf::from("."),
        }
    }
}

impl ClientConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        read_toml(path.as_ref())
    }

    pub fn master_addr(&self) -> String {
        format!("{}:{}", self.master_host, self.master_port)
    }

    /// Locate a query file, trying `queries_dir` for relative paths that do
    /// not exist relative to the working directory.
    pub fn resolve_query_path(&self, query: &Path) -> Option<PathBuf> {
        if query.exists() {
            return Some(query.to_path_buf());
        }
        if query.is_relative() {
            let candidate = self.queries_dir.join(query);
            if candidate.exists() {
                return Some(candidate);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn master_config_default() {
        let cfg = MasterConfig::default();
        assert_eq!(cfg.listen_port, 9001);
        assert_eq!(cfg.scheduling_algorithm, SchedulingAlgorithm::Fifo);
        assert_eq!(cfg.aging_interval_ms, 0);
        assert_eq!(cfg.log_level, "INFO");
        assert!(cfg.aging_interval().is_none());
    }

    #[test]
    fn master_config_from_file() {
        let file = write_config(
            r#"
            listen_port = 9100
            scheduling_algorithm = "PRIORITY"
            aging_interval_ms = 250
            log_level = "debug"
            "#,
        );
        let cfg = MasterConfig::from_file(file.path()).unwrap();
        assert_eq!(cfg.listen_port, 9100);
        assert_eq!(cfg.scheduling_algorithm, SchedulingAlgorithm::Priority);
        assert_eq!(cfg.aging_interval(), Some(Duration::from_millis(250)));
        assert_eq!(filter_directive(&cfg.log_level), "debug");
    }

    #[test]
    fn missing_keys_use_defaults() {
        let file = write_config("scheduling_algorithm = \"PRIORIDADES\"\n");
        let cfg = MasterConfig::from_file(file.path()).unwrap();
        assert_eq!(cfg.listen_port, 9001);
        assert_eq!(cfg.scheduling_algorithm, SchedulingAlgorithm::Priority);
    }

    #[test]
    fn unknown_algorithm_falls_back_to_fifo() {
        let file = write_config("scheduling_algorithm = \"ROUND_ROBIN\"\n");
        let cfg = MasterConfig::from_file(file.path()).unwrap();
        assert_eq!(cfg.scheduling_algorithm, SchedulingAlgorithm::Fifo);
    }

    #[test]
    fn aging_is_disabled_under_fifo() {
        let cfg = MasterConfig {
            aging_interval_ms: 100,
            ..Default::default()
        };
        assert!(cfg.aging_interval().is_none());
    }

    #[test]
    fn missing_file_is_a_read_error() {
        let err = MasterConfig::from_file("/definitely/not/here.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn malformed_file_is_a_parse_error() {
        let file = write_config("listen_port = \"not a number\"\n");
        let err = MasterConfig::from_file(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn filter_directive_mapping() {
        assert_eq!(filter_directive("TRACE"), "trace");
        assert_eq!(filter_directive("WARNING"), "warn");
        assert_eq!(filter_directive("error"), "error");
        assert_eq!(filter_directive("chatty"), "info");
    }

    #[test]
    fn client_config_from_file() {
        let file = write_config(
            r#"
            master_host = "10.0.0.5"
            master_port = 9200
            queries_dir = "/srv/queries"
            "#,
        );
        let cfg = ClientConfig::from_file(file.path()).unwrap();
        assert_eq!(cfg.master_addr(), "10.0.0.5:9200");
        assert_eq!(cfg.queries_dir, PathBuf::from("/srv/queries"));
        assert_eq!(cfg.log_level, "INFO");
    }

    #[test]
    fn resolve_query_path_falls_back_to_queries_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("q_sum"), "READ a 0\n").unwrap();
        let cfg = ClientConfig {
            queries_dir: dir.path().to_path_buf(),
            ..Default::default()
        };

        let resolved = cfg.resolve_query_path(Path::new("q_sum")).unwrap();
        assert_eq!(resolved, dir.path().join("q_sum"));
        assert!(cfg.resolve_query_path(Path::new("missing_query")).is_none());
    }
}
