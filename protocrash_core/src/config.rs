use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Campaign configuration recognized by the core.
///
/// Every field has a serde default so a config file only needs to name the
/// target; anything beyond these options belongs to the front-end.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct FuzzConfig {
    /// Target command line. The literal `@@` placeholder, if present, is
    /// replaced per-execution with a temp file path; otherwise the mutant
    /// is delivered on stdin.
    pub argv: Vec<String>,

    /// Directory of initial seed inputs.
    pub seeds_dir: Option<PathBuf>,

    /// Directory where crash artifacts are persisted.
    #[serde(default = "default_crash_dir")]
    pub crash_dir: PathBuf,

    /// Directory where promoted corpus entries are persisted.
    #[serde(default = "default_corpus_dir")]
    pub corpus_dir: PathBuf,

    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    #[serde(default = "default_memory_limit_bytes")]
    pub memory_limit_bytes: u64,

    /// Stop after this many executions (per worker). `None` means unbounded.
    pub max_executions: Option<u64>,

    /// Stop the campaign after this many seconds.
    pub max_duration_s: Option<u64>,

    #[serde(default = "default_workers")]
    pub workers: usize,

    #[serde(default = "default_sync_interval_s")]
    pub sync_interval_s: u64,

    #[serde(default = "default_true")]
    pub minimize_crashes: bool,

    #[serde(default = "default_true")]
    pub sanitizers: bool,

    /// Shared directory for cross-worker exchange. Defaults to a fresh
    /// temporary directory owned by the supervisor.
    pub sync_root: Option<PathBuf>,

    /// Protocol the target speaks, enabling field-aware mutations.
    /// One of "http", "dns", "smtp"; anything else disables the stage.
    pub protocol: Option<String>,
}

fn default_crash_dir() -> PathBuf {
    PathBuf::from("crashes")
}

fn default_corpus_dir() -> PathBuf {
    PathBuf::from("corpus")
}

fn default_timeout_ms() -> u64 {
    5000
}

fn default_memory_limit_bytes() -> u64 {
    1 << 30
}

fn default_workers() -> usize {
    1
}

fn default_sync_interval_s() -> u64 {
    5
}

fn default_true() -> bool {
    true
}

impl FuzzConfig {
    /// Minimal configuration for a given target command.
    pub fn for_target(argv: Vec<String>) -> Self {
        Self {
            argv,
            seeds_dir: None,
            crash_dir: default_crash_dir(),
            corpus_dir: default_corpus_dir(),
            timeout_ms: default_timeout_ms(),
            memory_limit_bytes: default_memory_limit_bytes(),
            max_executions: None,
            max_duration_s: None,
            workers: default_workers(),
            sync_interval_s: default_sync_interval_s(),
            minimize_crashes: true,
            sanitizers: true,
            sync_root: None,
            protocol: None,
        }
    }

    pub fn load_from_file(path: &PathBuf) -> Result<Self, anyhow::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file at {:?}: {}", path, e))?;

        let config: FuzzConfig = toml::from_str(&content).map_err(|e| {
            anyhow::anyhow!("Failed to parse TOML from config file {:?}: {}", path, e)
        })?;

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_match_documented_values() {
        let config = FuzzConfig::for_target(vec!["./target".to_string()]);
        assert_eq!(config.timeout_ms, 5000);
        assert_eq!(config.memory_limit_bytes, 1 << 30);
        assert_eq!(config.workers, 1);
        assert_eq!(config.sync_interval_s, 5);
        assert!(config.minimize_crashes);
        assert!(config.sanitizers);
        assert!(config.sync_root.is_none());
    }

    #[test]
    fn loads_partial_toml_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fuzz.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "argv = [\"./server\", \"@@\"]").unwrap();
        writeln!(file, "workers = 4").unwrap();
        writeln!(file, "protocol = \"http\"").unwrap();

        let config = FuzzConfig::load_from_file(&path).unwrap();
        assert_eq!(config.argv, vec!["./server", "@@"]);
        assert_eq!(config.workers, 4);
        assert_eq!(config.timeout_ms, 5000);
        assert_eq!(config.protocol.as_deref(), Some("http"));
    }

    #[test]
    fn rejects_unknown_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "argv = [\"x\"]\nno_such_option = 1\n").unwrap();

        assert!(FuzzConfig::load_from_file(&path).is_err());
    }
}
