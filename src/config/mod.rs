//! Layered configuration: file defaults overridden by `NTM_*` environment
//! variables, following the teacher's `CcswarmConfig` shape but loaded
//! through the `config` crate's layering instead of a bare
//! `serde_json::from_str`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Coordination-service connection settings (§6.2).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinationConfig {
    pub url: Option<String>,
    pub token: Option<String>,
    pub enabled: bool,
    pub timeout_secs: u64,
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            url: None,
            token: None,
            enabled: true,
            timeout_secs: 10,
        }
    }
}

/// Multiplexer Driver defaults (§4.A, §5).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MultiplexerConfig {
    pub command_timeout_secs: u64,
    pub max_retries: u32,
    pub auto_start_server: bool,
    pub remote_host: Option<String>,
    pub max_agents: usize,
    pub stagger_enabled: bool,
    pub stagger_interval_ms: u64,
    /// Launch command per agent type (`"claude"`, `"codex"`, `"gemini"`).
    pub agent_commands: HashMap<String, String>,
}

impl Default for MultiplexerConfig {
    fn default() -> Self {
        let mut agent_commands = HashMap::new();
        agent_commands.insert("claude".to_string(), "claude".to_string());
        agent_commands.insert("codex".to_string(), "codex".to_string());
        agent_commands.insert("gemini".to_string(), "gemini".to_string());
        Self {
            command_timeout_secs: 30,
            max_retries: 2,
            auto_start_server: true,
            remote_host: None,
            max_agents: 16,
            stagger_enabled: false,
            stagger_interval_ms: 500,
            agent_commands,
        }
    }
}

/// Work-Assignment Engine defaults (§4.E).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AssignmentConfig {
    pub strategy: String,
    pub limit: usize,
    pub reserve_files: bool,
    pub prompt_template: String,
}

impl Default for AssignmentConfig {
    fn default() -> Self {
        Self {
            strategy: "balanced".to_string(),
            limit: 0,
            reserve_files: true,
            prompt_template: "impl".to_string(),
        }
    }
}

/// Coordinator Loop defaults (§4.G).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    pub poll_interval_secs: u64,
    pub idle_threshold_secs: u64,
    pub digest_interval_secs: u64,
    pub send_digests: bool,
    pub conflict_notify: bool,
    pub conflict_negotiate: bool,
    pub auto_assign: bool,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 30,
            idle_threshold_secs: 60,
            digest_interval_secs: 300,
            send_digests: false,
            conflict_notify: true,
            conflict_negotiate: false,
            auto_assign: false,
        }
    }
}

/// Ensemble Controller defaults (§4.F, §5).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EnsembleConfig {
    pub timeout_per_mode_secs: u64,
    pub total_timeout_secs: u64,
    pub skip_inject: bool,
}

impl Default for EnsembleConfig {
    fn default() -> Self {
        Self {
            timeout_per_mode_secs: 300,
            total_timeout_secs: 1800,
            skip_inject: false,
        }
    }
}

/// Top-level process configuration, read once and threaded explicitly
/// into every component (spec.md §9: treat the singleton as a migration
/// shim only).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct NtmConfig {
    pub user: Option<String>,
    pub coordination: CoordinationConfig,
    pub multiplexer: MultiplexerConfig,
    pub assignment: AssignmentConfig,
    pub coordinator: CoordinatorConfig,
    pub ensemble: EnsembleConfig,
}

impl NtmConfig {
    /// Load from `$XDG_CONFIG_HOME/ntm/config.toml` (fallback
    /// `~/.config/ntm/config.toml`), overridden by `NTM_*` environment
    /// variables. Missing files are not an error; defaults apply.
    pub fn load() -> anyhow::Result<Self> {
        let path = config_file_path();
        Self::load_from(&path)
    }

    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        let mut builder = config::Config::builder();
        if path.exists() {
            builder = builder.add_source(config::File::from(path));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("NTM")
                .separator("__")
                .try_parsing(true),
        );
        let built = builder.build()?;
        let cfg: NtmConfig = built.try_deserialize()?;
        Ok(cfg)
    }

    pub fn effective_user(&self) -> String {
        self.user
            .clone()
            .or_else(|| std::env::var("NTM_USER").ok())
            .unwrap_or_else(|| "unknown".to_string())
    }
}

/// `$XDG_CONFIG_HOME/ntm` (fallback `~/.config/ntm`).
pub fn config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("ntm")
}

/// `$XDG_DATA_HOME/ntm` (fallback platform data dir).
pub fn data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("ntm")
}

pub fn config_file_path() -> PathBuf {
    config_dir().join("config.toml")
}

/// State database path per §6.3: always under `~/.config/ntm`, distinct
/// from the XDG-resolved `config_dir` used for the config file itself.
pub fn state_db_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("ntm")
        .join("state.db")
}

pub fn assignments_dir() -> PathBuf {
    data_dir().join("assignments")
}

pub fn assignment_snapshot_path(session: &str) -> PathBuf {
    assignments_dir().join(format!("{session}.json"))
}

pub fn ensembles_dir(project_dir: &Path) -> PathBuf {
    project_dir.join(".ntm").join("ensembles")
}

pub fn ensemble_session_dir(project_dir: &Path, session: &str) -> PathBuf {
    ensembles_dir(project_dir).join(session)
}
