//! Multiplexer Driver (spec.md §4.A): a stateless façade over tmux-style
//! session/pane operations. Grounded on the teacher's `TmuxClient` in
//! `src/tmux/mod.rs` — `Command::new("tmux")` shelling, typed errors via
//! `thiserror`, a config struct for timeouts/retries — generalized to the
//! pane-oriented contract this spec needs and lifted onto
//! `tokio::process::Command` so every call is a cooperative suspension
//! point (spec.md §5).

pub mod naming;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

pub use naming::{format_pane_name, parse_pane_title, AgentType, ParsedPaneName};

use crate::config::MultiplexerConfig;

#[derive(Debug, thiserror::Error)]
pub enum TmuxError {
    #[error("tmux binary not found on PATH")]
    TmuxNotFound,
    #[error("session '{0}' not found")]
    SessionNotFound(String),
    #[error("session '{0}' already exists")]
    SessionAlreadyExists(String),
    #[error("pane '{0}' not found")]
    PaneNotFound(String),
    #[error("tmux command failed: {0}")]
    CommandFailed(String),
    #[error("failed to execute tmux: {0}")]
    ExecutionFailed(String),
    #[error("invalid session name: {0}")]
    InvalidSessionName(String),
    #[error("tmux server is not running")]
    ServerNotRunning,
    #[error("operation cancelled")]
    Cancelled,
    #[error("tmux command timed out")]
    Timeout,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A single cell within a session, as reported by `GetPanes`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pane {
    pub id: String,
    pub session: String,
    pub index: u32,
    pub title: String,
    pub agent_type: Option<AgentType>,
    pub variant: Option<String>,
    pub width: u32,
    pub height: u32,
    pub active: bool,
    pub command: String,
}

impl Pane {
    /// Derives `agent_type`/`variant` from `title` via [`parse_pane_title`],
    /// the only source of truth for re-discovering agent identity.
    fn with_parsed_title(mut self) -> Self {
        if let Some(parsed) = parse_pane_title(&self.title) {
            self.agent_type = Some(parsed.agent_type);
            self.variant = parsed.variant;
        }
        self
    }
}

#[derive(Debug, Clone)]
pub struct TmuxClientConfig {
    pub command_timeout: Duration,
    pub check_server: bool,
    pub auto_start_server: bool,
    pub max_retries: u32,
    pub global_env: HashMap<String, String>,
}

impl Default for TmuxClientConfig {
    fn default() -> Self {
        Self {
            command_timeout: Duration::from_secs(30),
            check_server: true,
            auto_start_server: true,
            max_retries: 2,
            global_env: HashMap::new(),
        }
    }
}

impl From<&MultiplexerConfig> for TmuxClientConfig {
    fn from(cfg: &MultiplexerConfig) -> Self {
        Self {
            command_timeout: Duration::from_secs(cfg.command_timeout_secs),
            check_server: true,
            auto_start_server: cfg.auto_start_server,
            max_retries: cfg.max_retries,
            global_env: HashMap::new(),
        }
    }
}

/// Rejects any name outside `[A-Za-z0-9_-]` or containing `:`, tmux's
/// session/window delimiter.
pub fn validate_session_name(name: &str) -> Result<(), TmuxError> {
    if name.is_empty() {
        return Err(TmuxError::InvalidSessionName(name.to_string()));
    }
    let valid = name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if !valid || name.contains(':') {
        return Err(TmuxError::InvalidSessionName(name.to_string()));
    }
    Ok(())
}

/// Pane-oriented contract consumed by the Session & Pane Orchestrator
/// (spec.md §4.A, §9: interface abstraction with local/remote
/// implementations and an in-memory test fake).
#[async_trait]
pub trait Multiplexer: Send + Sync {
    async fn ensure_installed(&self) -> Result<(), TmuxError>;
    fn validate_session_name(&self, name: &str) -> Result<(), TmuxError> {
        validate_session_name(name)
    }
    async fn session_exists(&self, name: &str) -> bool;
    async fn create_session(&self, name: &str, dir: &str) -> Result<(), TmuxError>;
    async fn split_window(&self, session: &str, dir: &str) -> Result<String, TmuxError>;
    async fn set_pane_title(&self, pane_id: &str, title: &str) -> Result<(), TmuxError>;
    async fn send_keys(
        &self,
        pane_id: &str,
        text: &str,
        append_return: bool,
    ) -> Result<(), TmuxError>;
    async fn send_interrupt(&self, pane_id: &str) -> Result<(), TmuxError>;
    async fn get_panes(&self, session: &str) -> Result<Vec<Pane>, TmuxError>;
    async fn capture_pane_output(&self, pane_id: &str, lines: u32) -> Result<String, TmuxError>;
    async fn apply_tiled_layout(&self, session: &str) -> Result<(), TmuxError>;
    async fn zoom_pane(&self, session: &str, index: u32) -> Result<(), TmuxError>;
    async fn kill_session(&self, name: &str) -> Result<(), TmuxError>;
    async fn attach_or_switch(&self, name: &str) -> Result<(), TmuxError>;
}

/// Local implementation: direct descendant of the teacher's `TmuxClient`,
/// shelling out to `tmux` on `PATH`.
pub struct TmuxMultiplexer {
    config: TmuxClientConfig,
}

impl TmuxMultiplexer {
    pub fn new() -> Self {
        Self {
            config: TmuxClientConfig::default(),
        }
    }

    pub fn with_config(config: TmuxClientConfig) -> Self {
        Self { config }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new("tmux");
        for (k, v) in &self.config.global_env {
            cmd.env(k, v);
        }
        cmd
    }

    async fn run(&self, args: &[&str]) -> Result<String, TmuxError> {
        let mut cmd = self.command();
        cmd.args(args);
        let fut = cmd.output();
        let output = tokio::time::timeout(self.config.command_timeout, fut)
            .await
            .map_err(|_| TmuxError::Timeout)?
            .map_err(|e| TmuxError::ExecutionFailed(e.to_string()))?;
        if !output.status.success() {
            return Err(TmuxError::CommandFailed(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

impl Default for TmuxMultiplexer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Multiplexer for TmuxMultiplexer {
    async fn ensure_installed(&self) -> Result<(), TmuxError> {
        self.run(&["-V"]).await.map(|_| ())
    }

    async fn session_exists(&self, name: &str) -> bool {
        self.run(&["has-session", "-t", name]).await.is_ok()
    }

    async fn create_session(&self, name: &str, dir: &str) -> Result<(), TmuxError> {
        validate_session_name(name)?;
        if self.session_exists(name).await {
            return Err(TmuxError::SessionAlreadyExists(name.to_string()));
        }
        self.run(&["new-session", "-d", "-s", name, "-c", dir])
            .await
            .map(|_| ())
    }

    async fn split_window(&self, session: &str, dir: &str) -> Result<String, TmuxError> {
        self.run(&[
            "split-window",
            "-t",
            session,
            "-c",
            dir,
            "-P",
            "-F",
            "#{pane_id}",
        ])
        .await
        .map(|out| out.trim().to_string())
    }

    async fn set_pane_title(&self, pane_id: &str, title: &str) -> Result<(), TmuxError> {
        self.run(&["select-pane", "-t", pane_id, "-T", title])
            .await
            .map(|_| ())
    }

    async fn send_keys(
        &self,
        pane_id: &str,
        text: &str,
        append_return: bool,
    ) -> Result<(), TmuxError> {
        if append_return {
            self.run(&["send-keys", "-t", pane_id, text, "Enter"])
                .await
                .map(|_| ())
        } else {
            self.run(&["send-keys", "-t", pane_id, text]).await.map(|_| ())
        }
    }

    async fn send_interrupt(&self, pane_id: &str) -> Result<(), TmuxError> {
        self.run(&["send-keys", "-t", pane_id, "C-c"]).await.map(|_| ())
    }

    async fn get_panes(&self, session: &str) -> Result<Vec<Pane>, TmuxError> {
        if !self.session_exists(session).await {
            return Err(TmuxError::SessionNotFound(session.to_string()));
        }
        let format =
            "#{pane_id}\t#{pane_index}\t#{pane_title}\t#{pane_width}\t#{pane_height}\t#{pane_active}\t#{pane_current_command}";
        let out = self
            .run(&["list-panes", "-t", session, "-F", format])
            .await?;
        let mut panes = Vec::new();
        for line in out.lines().filter(|l| !l.is_empty()) {
            let fields: Vec<&str> = line.split('\t').collect();
            if fields.len() != 7 {
                continue;
            }
            let pane = Pane {
                id: fields[0].to_string(),
                session: session.to_string(),
                index: fields[1].parse().unwrap_or(0),
                title: fields[2].to_string(),
                agent_type: None,
                variant: None,
                width: fields[3].parse().unwrap_or(0),
                height: fields[4].parse().unwrap_or(0),
                active: fields[5] == "1",
                command: fields[6].to_string(),
            }
            .with_parsed_title();
            panes.push(pane);
        }
        Ok(panes)
    }

    async fn capture_pane_output(&self, pane_id: &str, lines: u32) -> Result<String, TmuxError> {
        let start = format!("-{lines}");
        self.run(&["capture-pane", "-p", "-t", pane_id, "-S", &start])
            .await
    }

    async fn apply_tiled_layout(&self, session: &str) -> Result<(), TmuxError> {
        self.run(&["select-layout", "-t", session, "tiled"])
            .await
            .map(|_| ())
    }

    async fn zoom_pane(&self, session: &str, index: u32) -> Result<(), TmuxError> {
        let target = format!("{session}.{index}");
        self.run(&["resize-pane", "-t", &target, "-Z"])
            .await
            .map(|_| ())
    }

    async fn kill_session(&self, name: &str) -> Result<(), TmuxError> {
        if !self.session_exists(name).await {
            return Err(TmuxError::SessionNotFound(name.to_string()));
        }
        self.run(&["kill-session", "-t", name]).await.map(|_| ())
    }

    async fn attach_or_switch(&self, name: &str) -> Result<(), TmuxError> {
        if !self.session_exists(name).await {
            return Err(TmuxError::SessionNotFound(name.to_string()));
        }
        let inside_tmux = std::env::var("TMUX").is_ok();
        let verb = if inside_tmux {
            "switch-client"
        } else {
            "attach-session"
        };
        self.run(&[verb, "-t", name]).await.map(|_| ())
    }
}

/// Remote variant: prefixes every call with an SSH transport. Interface-
/// compatible with [`TmuxMultiplexer`], composed rather than duplicated.
pub struct RemoteTmuxMultiplexer {
    inner: TmuxMultiplexer,
    remote_host: String,
}

impl RemoteTmuxMultiplexer {
    pub fn new(remote_host: impl Into<String>, config: TmuxClientConfig) -> Self {
        Self {
            inner: TmuxMultiplexer::with_config(config),
            remote_host: remote_host.into(),
        }
    }

    async fn run_remote(&self, args: &[&str]) -> Result<String, TmuxError> {
        let mut cmd = Command::new("ssh");
        cmd.arg(&self.remote_host).arg("tmux").args(args);
        let fut = cmd.output();
        let output = tokio::time::timeout(self.inner.config.command_timeout, fut)
            .await
            .map_err(|_| TmuxError::Timeout)?
            .map_err(|e| TmuxError::ExecutionFailed(e.to_string()))?;
        if !output.status.success() {
            return Err(TmuxError::CommandFailed(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

#[async_trait]
impl Multiplexer for RemoteTmuxMultiplexer {
    async fn ensure_installed(&self) -> Result<(), TmuxError> {
        self.run_remote(&["-V"]).await.map(|_| ())
    }

    async fn session_exists(&self, name: &str) -> bool {
        self.run_remote(&["has-session", "-t", name]).await.is_ok()
    }

    async fn create_session(&self, name: &str, dir: &str) -> Result<(), TmuxError> {
        validate_session_name(name)?;
        if self.session_exists(name).await {
            return Err(TmuxError::SessionAlreadyExists(name.to_string()));
        }
        self.run_remote(&["new-session", "-d", "-s", name, "-c", dir])
            .await
            .map(|_| ())
    }

    async fn split_window(&self, session: &str, dir: &str) -> Result<String, TmuxError> {
        self.run_remote(&[
            "split-window",
            "-t",
            session,
            "-c",
            dir,
            "-P",
            "-F",
            "#{pane_id}",
        ])
        .await
        .map(|out| out.trim().to_string())
    }

    async fn set_pane_title(&self, pane_id: &str, title: &str) -> Result<(), TmuxError> {
        self.run_remote(&["select-pane", "-t", pane_id, "-T", title])
            .await
            .map(|_| ())
    }

    async fn send_keys(
        &self,
        pane_id: &str,
        text: &str,
        append_return: bool,
    ) -> Result<(), TmuxError> {
        if append_return {
            self.run_remote(&["send-keys", "-t", pane_id, text, "Enter"])
                .await
                .map(|_| ())
        } else {
            self.run_remote(&["send-keys", "-t", pane_id, text])
                .await
                .map(|_| ())
        }
    }

    async fn send_interrupt(&self, pane_id: &str) -> Result<(), TmuxError> {
        self.run_remote(&["send-keys", "-t", pane_id, "C-c"])
            .await
            .map(|_| ())
    }

    async fn get_panes(&self, session: &str) -> Result<Vec<Pane>, TmuxError> {
        if !self.session_exists(session).await {
            return Err(TmuxError::SessionNotFound(session.to_string()));
        }
        let format =
            "#{pane_id}\t#{pane_index}\t#{pane_title}\t#{pane_width}\t#{pane_height}\t#{pane_active}\t#{pane_current_command}";
        let out = self
            .run_remote(&["list-panes", "-t", session, "-F", format])
            .await?;
        let mut panes = Vec::new();
        for line in out.lines().filter(|l| !l.is_empty()) {
            let fields: Vec<&str> = line.split('\t').collect();
            if fields.len() != 7 {
                continue;
            }
            let pane = Pane {
                id: fields[0].to_string(),
                session: session.to_string(),
                index: fields[1].parse().unwrap_or(0),
                title: fields[2].to_string(),
                agent_type: None,
                variant: None,
                width: fields[3].parse().unwrap_or(0),
                height: fields[4].parse().unwrap_or(0),
                active: fields[5] == "1",
                command: fields[6].to_string(),
            }
            .with_parsed_title();
            panes.push(pane);
        }
        Ok(panes)
    }

    async fn capture_pane_output(&self, pane_id: &str, lines: u32) -> Result<String, TmuxError> {
        let start = format!("-{lines}");
        self.run_remote(&["capture-pane", "-p", "-t", pane_id, "-S", &start])
            .await
    }

    async fn apply_tiled_layout(&self, session: &str) -> Result<(), TmuxError> {
        self.run_remote(&["select-layout", "-t", session, "tiled"])
            .await
            .map(|_| ())
    }

    async fn zoom_pane(&self, session: &str, index: u32) -> Result<(), TmuxError> {
        let target = format!("{session}.{index}");
        self.run_remote(&["resize-pane", "-t", &target, "-Z"])
            .await
            .map(|_| ())
    }

    async fn kill_session(&self, name: &str) -> Result<(), TmuxError> {
        if !self.session_exists(name).await {
            return Err(TmuxError::SessionNotFound(name.to_string()));
        }
        self.run_remote(&["kill-session", "-t", name]).await.map(|_| ())
    }

    async fn attach_or_switch(&self, name: &str) -> Result<(), TmuxError> {
        if !self.session_exists(name).await {
            return Err(TmuxError::SessionNotFound(name.to_string()));
        }
        self.run_remote(&["attach-session", "-t", name]).await.map(|_| ())
    }
}

/// Watches a cancellation token alongside a `Multiplexer` call, returning
/// `TmuxError::Cancelled` promptly (spec.md §5: cancellation at any
/// suspension point is observable).
pub async fn with_cancellation<T>(
    token: &CancellationToken,
    fut: impl std::future::Future<Output = Result<T, TmuxError>>,
) -> Result<T, TmuxError> {
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(TmuxError::Cancelled),
        result = fut => result,
    }
}

/// Compiled for unit tests and for integration tests under `tests/` (which
/// link this crate as an external dependency, so `#[cfg(test)]` alone would
/// hide it — see the `test-util` feature in `Cargo.toml`).
#[cfg(any(test, feature = "test-util"))]
pub mod fakes {
    use super::*;
    use std::sync::Mutex;

    /// Hand-rolled in-memory fake: records calls and simulates pane
    /// output, per spec.md §9's call for "an in-memory fake that records
    /// calls and simulates pane output."
    pub struct RecordingMultiplexer {
        pub calls: Mutex<Vec<String>>,
        sessions: Mutex<HashMap<String, Vec<Pane>>>,
        sent: Mutex<HashMap<String, Vec<String>>>,
        next_pane_id: Mutex<u32>,
    }

    impl Default for RecordingMultiplexer {
        fn default() -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                sessions: Mutex::new(HashMap::new()),
                sent: Mutex::new(HashMap::new()),
                next_pane_id: Mutex::new(0),
            }
        }
    }

    impl RecordingMultiplexer {
        pub fn new() -> Self {
            Self::default()
        }

        fn log(&self, call: impl Into<String>) {
            self.calls.lock().unwrap().push(call.into());
        }

        fn alloc_pane_id(&self) -> String {
            let mut next = self.next_pane_id.lock().unwrap();
            let id = format!("%{}", *next);
            *next += 1;
            id
        }

        pub fn sent_to(&self, pane_id: &str) -> Vec<String> {
            self.sent
                .lock()
                .unwrap()
                .get(pane_id)
                .cloned()
                .unwrap_or_default()
        }
    }

    #[async_trait]
    impl Multiplexer for RecordingMultiplexer {
        async fn ensure_installed(&self) -> Result<(), TmuxError> {
            self.log("ensure_installed");
            Ok(())
        }

        async fn session_exists(&self, name: &str) -> bool {
            self.log(format!("session_exists({name})"));
            self.sessions.lock().unwrap().contains_key(name)
        }

        async fn create_session(&self, name: &str, _dir: &str) -> Result<(), TmuxError> {
            validate_session_name(name)?;
            self.log(format!("create_session({name})"));
            let mut sessions = self.sessions.lock().unwrap();
            if sessions.contains_key(name) {
                return Err(TmuxError::SessionAlreadyExists(name.to_string()));
            }
            let pane_id = self.alloc_pane_id();
            sessions.insert(
                name.to_string(),
                vec![Pane {
                    id: pane_id,
                    session: name.to_string(),
                    index: 0,
                    title: String::new(),
                    agent_type: None,
                    variant: None,
                    width: 80,
                    height: 24,
                    active: true,
                    command: "bash".to_string(),
                }],
            );
            Ok(())
        }

        async fn split_window(&self, session: &str, _dir: &str) -> Result<String, TmuxError> {
            self.log(format!("split_window({session})"));
            let pane_id = self.alloc_pane_id();
            let mut sessions = self.sessions.lock().unwrap();
            let panes = sessions
                .get_mut(session)
                .ok_or_else(|| TmuxError::SessionNotFound(session.to_string()))?;
            let index = panes.len() as u32;
            panes.push(Pane {
                id: pane_id.clone(),
                session: session.to_string(),
                index,
                title: String::new(),
                agent_type: None,
                variant: None,
                width: 80,
                height: 24,
                active: false,
                command: "bash".to_string(),
            });
            Ok(pane_id)
        }

        async fn set_pane_title(&self, pane_id: &str, title: &str) -> Result<(), TmuxError> {
            self.log(format!("set_pane_title({pane_id}, {title})"));
            let mut sessions = self.sessions.lock().unwrap();
            for panes in sessions.values_mut() {
                if let Some(pane) = panes.iter_mut().find(|p| p.id == pane_id) {
                    pane.title = title.to_string();
                    *pane = pane.clone().with_parsed_title();
                    return Ok(());
                }
            }
            Err(TmuxError::PaneNotFound(pane_id.to_string()))
        }

        async fn send_keys(
            &self,
            pane_id: &str,
            text: &str,
            _append_return: bool,
        ) -> Result<(), TmuxError> {
            self.log(format!("send_keys({pane_id}, {text})"));
            self.sent
                .lock()
                .unwrap()
                .entry(pane_id.to_string())
                .or_default()
                .push(text.to_string());
            Ok(())
        }

        async fn send_interrupt(&self, pane_id: &str) -> Result<(), TmuxError> {
            self.log(format!("send_interrupt({pane_id})"));
            Ok(())
        }

        async fn get_panes(&self, session: &str) -> Result<Vec<Pane>, TmuxError> {
            self.log(format!("get_panes({session})"));
            self.sessions
                .lock()
                .unwrap()
                .get(session)
                .cloned()
                .ok_or_else(|| TmuxError::SessionNotFound(session.to_string()))
        }

        async fn capture_pane_output(&self, pane_id: &str, _lines: u32) -> Result<String, TmuxError> {
            self.log(format!("capture_pane_output({pane_id})"));
            Ok(self.sent_to(pane_id).join("\n"))
        }

        async fn apply_tiled_layout(&self, session: &str) -> Result<(), TmuxError> {
            self.log(format!("apply_tiled_layout({session})"));
            Ok(())
        }

        async fn zoom_pane(&self, session: &str, index: u32) -> Result<(), TmuxError> {
            self.log(format!("zoom_pane({session}, {index})"));
            Ok(())
        }

        async fn kill_session(&self, name: &str) -> Result<(), TmuxError> {
            self.log(format!("kill_session({name})"));
            self.sessions
                .lock()
                .unwrap()
                .remove(name)
                .map(|_| ())
                .ok_or_else(|| TmuxError::SessionNotFound(name.to_string()))
        }

        async fn attach_or_switch(&self, name: &str) -> Result<(), TmuxError> {
            self.log(format!("attach_or_switch({name})"));
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_rejects_colon_and_symbols() {
        assert!(validate_session_name("alpha").is_ok());
        assert!(validate_session_name("alpha_1-2").is_ok());
        assert!(validate_session_name("alpha:beta").is_err());
        assert!(validate_session_name("alpha.beta").is_err());
        assert!(validate_session_name("").is_err());
    }

    #[tokio::test]
    async fn recording_fake_tracks_create_and_split() {
        let mux = fakes::RecordingMultiplexer::new();
        mux.create_session("alpha", "/tmp").await.unwrap();
        let pane_id = mux.split_window("alpha", "/tmp").await.unwrap();
        mux.set_pane_title(&pane_id, "alpha__claude_1").await.unwrap();
        let panes = mux.get_panes("alpha").await.unwrap();
        assert_eq!(panes.len(), 2);
        assert_eq!(panes[1].agent_type, Some(AgentType::Claude));
    }

    #[tokio::test]
    async fn recording_fake_rejects_duplicate_session() {
        let mux = fakes::RecordingMultiplexer::new();
        mux.create_session("alpha", "/tmp").await.unwrap();
        let err = mux.create_session("alpha", "/tmp").await.unwrap_err();
        assert!(matches!(err, TmuxError::SessionAlreadyExists(_)));
    }
}
