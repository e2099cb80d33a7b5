use serde::Deserialize;
use std::{env, fs, path::PathBuf, time::Duration};

use crate::types::ConfigReference;

/// Orchestrator settings, loaded from a JSON file with every field defaulted.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// How often the delayed-run poller wakes up.
    pub delayed_poll_interval_ms: u64,
    /// Execute runs through a worker process instead of in-process.
    pub run_in_separate_process: bool,
    /// When false the host binds the channel and waits for an externally
    /// started client (useful when debugging the client).
    pub launch_client: bool,
    /// Worker executable; defaults to the current executable.
    pub client_executable: Option<PathBuf>,
    pub connect_timeout_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub liveness_timeout_ms: u64,
    pub termination_grace_period_ms: u64,
    pub projects_directory: PathBuf,

    /// Where this config was loaded from; forwarded to remote workers.
    #[serde(skip)]
    pub source: Option<PathBuf>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            delayed_poll_interval_ms: 2_000,
            run_in_separate_process: false,
            launch_client: true,
            client_executable: None,
            connect_timeout_ms: 30_000,
            heartbeat_interval_ms: 1_000,
            liveness_timeout_ms: 30_000,
            termination_grace_period_ms: 5_000,
            projects_directory: PathBuf::from("Projects"),
            source: None,
        }
    }
}

impl OrchestratorConfig {
    pub fn delayed_poll_interval(&self) -> Duration {
        Duration::from_millis(self.delayed_poll_interval_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_millis(self.liveness_timeout_ms)
    }

    pub fn termination_grace_period(&self) -> Duration {
        Duration::from_millis(self.termination_grace_period_ms)
    }

    /// Reference sent to remote workers so they load the same settings.
    pub fn reference(&self) -> ConfigReference {
        self.source
            .as_ref()
            .map(|p| ConfigReference::new(p.display().to_string()))
            .unwrap_or_else(|| ConfigReference::new(""))
    }

    pub fn client_executable(&self) -> anyhow::Result<PathBuf> {
        match &self.client_executable {
            Some(path) => Ok(path.clone()),
            None => Ok(env::current_exe()?),
        }
    }

    /// Default run directory for a run of the given project.
    pub fn run_directory(&self, project: &str, run_name: &str) -> PathBuf {
        self.projects_directory.join(project).join(run_name)
    }

    /// Parse a config from JSON text, expanding `${VAR}` in path fields.
    pub fn from_json(raw: &str) -> anyhow::Result<Self> {
        let cfg: OrchestratorConfig = serde_json::from_str(raw)?;
        Ok(expand_config(cfg))
    }

    /// Load a config from an explicit path.
    pub fn load_from(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        let raw = fs::read_to_string(&path)?;
        let mut cfg = Self::from_json(&raw)?;
        cfg.source = Some(path);
        Ok(cfg)
    }

    /// Load the config from the usual locations, or defaults when none exists.
    pub fn load() -> anyhow::Result<Self> {
        match resolve_config_path() {
            Some(path) => Self::load_from(path),
            None => Ok(Self::default()),
        }
    }

    /// Load from a reference received over the wire; empty means defaults.
    pub fn from_reference(reference: &ConfigReference) -> anyhow::Result<Self> {
        if reference.as_str().is_empty() {
            return Ok(Self::default());
        }
        Self::load_from(reference.as_str())
    }
}

pub fn resolve_config_path() -> Option<PathBuf> {
    if let Ok(p) = env::var("RUN_ORCHESTRATOR_CONFIG") {
        return Some(PathBuf::from(p));
    }

    if let Ok(xdg) = env::var("XDG_CONFIG_HOME") {
        let candidate = PathBuf::from(xdg)
            .join("run-orchestrator")
            .join("config.json");
        if candidate.exists() {
            return Some(candidate);
        }
    }

    let candidate = PathBuf::from("run-orchestrator.json");
    if candidate.exists() {
        return Some(candidate);
    }

    None
}

fn expand_env_vars(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next(); // consume '{'
            let mut name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                name.push(c);
            }
            if let Ok(val) = env::var(&name) {
                out.push_str(&val);
            } else {
                out.push_str("${");
                out.push_str(&name);
                out.push('}');
            }
        } else {
            out.push(ch);
        }
    }

    out
}

fn expand_path(path: &PathBuf) -> PathBuf {
    PathBuf::from(expand_env_vars(&path.to_string_lossy()))
}

fn expand_config(cfg: OrchestratorConfig) -> OrchestratorConfig {
    let mut cfg = cfg;

    cfg.projects_directory = expand_path(&cfg.projects_directory);
    if let Some(exe) = cfg.client_executable.as_mut() {
        *exe = expand_path(exe);
    }

    cfg
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_when_fields_missing() {
        let cfg = OrchestratorConfig::from_json("{}").unwrap();
        assert_eq!(cfg.delayed_poll_interval(), Duration::from_secs(2));
        assert!(!cfg.run_in_separate_process);
        assert!(cfg.launch_client);
        assert_eq!(cfg.reference().as_str(), "");
    }

    #[test]
    fn test_partial_override() {
        let cfg = OrchestratorConfig::from_json(
            r#"{ "run_in_separate_process": true, "liveness_timeout_ms": 500 }"#,
        )
        .unwrap();
        assert!(cfg.run_in_separate_process);
        assert_eq!(cfg.liveness_timeout(), Duration::from_millis(500));
        assert_eq!(cfg.heartbeat_interval(), Duration::from_secs(1));
    }

    #[test]
    fn test_unknown_variable_is_left_verbatim() {
        let expanded = expand_env_vars("${RUN_ORCHESTRATOR_SURELY_UNSET_VAR}/runs");
        assert_eq!(expanded, "${RUN_ORCHESTRATOR_SURELY_UNSET_VAR}/runs");
    }

    #[test]
    fn test_known_variable_is_expanded() {
        // PATH is set in every test environment we run in.
        let path = env::var("PATH").unwrap();
        assert_eq!(expand_env_vars("${PATH}"), path);
    }

    #[test]
    fn test_load_from_records_source() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("config.json");
        fs::write(&file, r#"{ "termination_grace_period_ms": 10 }"#).unwrap();

        let cfg = OrchestratorConfig::load_from(&file).unwrap();
        assert_eq!(cfg.termination_grace_period(), Duration::from_millis(10));
        assert_eq!(cfg.reference().as_str(), file.display().to_string());

        let again = OrchestratorConfig::from_reference(&cfg.reference()).unwrap();
        assert_eq!(again.termination_grace_period_ms, 10);
    }

    #[test]
    fn test_run_directory_layout() {
        let cfg = OrchestratorConfig::default();
        assert_eq!(
            cfg.run_directory("Toronto", "base"),
            PathBuf::from("Projects").join("Toronto").join("base")
        );
    }
}
