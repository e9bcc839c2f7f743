//! Session & Pane Orchestrator (spec.md §4.D): creates multi-pane
//! sessions, launches agent processes, routes prompts/interrupts, and
//! zooms panes. Grounded on the teacher's `SessionManager` in
//! `src/session/mod.rs` for the lifecycle shape, generalized from
//! "one tmux session per agent" to "one tmux session with many agent
//! panes."

pub mod spec;

use std::collections::HashMap;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub use spec::{
    expand_agent_specs, format_agent_spec, parse_agent_spec, AgentSpec, FlatAgent, SpecError,
    Variant,
};

use crate::config::MultiplexerConfig;
use crate::tmux::{format_pane_name, with_cancellation, AgentType, Multiplexer, Pane, TmuxError};

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session '{0}' already exists")]
    SessionAlreadyExists(String),
    #[error("session '{0}' not found")]
    SessionNotFound(String),
    #[error("pane '{0}' not found")]
    PaneNotFound(String),
    #[error("{0}")]
    Validation(String),
    #[error("requested agent count exceeds configured maximum of {0}")]
    MaxAgentsExceeded(usize),
    #[error("kill requires confirmation; pass force=true")]
    ConfirmationRequired,
    #[error("operation cancelled")]
    Cancelled,
    #[error(transparent)]
    Mux(#[from] TmuxError),
    #[error(transparent)]
    Spec(#[from] SpecError),
}

/// Target selection for [`Orchestrator::send`] (spec.md §4.D).
#[derive(Debug, Clone, Default)]
pub struct SendTargets {
    pub cc: bool,
    pub cod: bool,
    pub gmi: bool,
    pub all: bool,
    pub skip_first: bool,
    pub pane_index: Option<u32>,
}

impl SendTargets {
    /// Matches the default precedence: restrict to agent panes, skipping
    /// the leading user pane.
    pub fn default_skip_first() -> Self {
        Self {
            skip_first: true,
            ..Default::default()
        }
    }

    fn any_type_set(&self) -> bool {
        self.cc || self.cod || self.gmi
    }

    fn matches(&self, pane: &Pane) -> bool {
        if let Some(idx) = self.pane_index {
            return pane.index == idx;
        }
        if self.all {
            return true;
        }
        if self.any_type_set() {
            return matches!(
                (pane.agent_type, self.cc, self.cod, self.gmi),
                (Some(AgentType::Claude), true, _, _)
                    | (Some(AgentType::Codex), _, true, _)
                    | (Some(AgentType::Gemini), _, _, true)
            );
        }
        if self.skip_first {
            return pane.agent_type != Some(AgentType::User);
        }
        true
    }
}

/// Resolves a [`Orchestrator::zoom`] target: either an explicit pane
/// index or the first pane of a given agent type by ascending index.
#[derive(Debug, Clone, Copy)]
pub enum ZoomSelector {
    Index(u32),
    AgentType(AgentType),
}

/// Metadata returned per flat agent after `Spawn` (spec.md §4.D).
#[derive(Debug, Clone)]
pub struct SpawnedPane {
    pub agent_type: AgentType,
    pub model: Option<String>,
    pub pane_id: String,
}

pub struct Orchestrator<M: Multiplexer> {
    mux: M,
    config: MultiplexerConfig,
}

impl<M: Multiplexer> Orchestrator<M> {
    pub fn new(mux: M, config: MultiplexerConfig) -> Self {
        Self { mux, config }
    }

    /// **Create(session, panes, dir)** — fails with `SessionAlreadyExists`
    /// when a session of that name is live; otherwise creates it, opens
    /// `panes - 1` additional panes, applies tiled layout.
    pub async fn create(
        &self,
        session: &str,
        panes: u32,
        dir: &str,
        token: &CancellationToken,
    ) -> Result<Vec<Pane>, SessionError> {
        self.mux.validate_session_name(session)?;
        if with_cancellation(token, async { Ok(self.mux.session_exists(session).await) }).await? {
            return Err(SessionError::SessionAlreadyExists(session.to_string()));
        }
        with_cancellation(token, self.mux.create_session(session, dir)).await?;
        for _ in 1..panes {
            with_cancellation(token, self.mux.split_window(session, dir)).await?;
        }
        with_cancellation(token, self.mux.apply_tiled_layout(session)).await?;
        let result = with_cancellation(token, self.mux.get_panes(session)).await?;
        Ok(result)
    }

    /// **Spawn(session, specs, userPane)** — expands `specs` into a flat
    /// plan, enforces `max_agents`, creates the session if absent, opens
    /// one pane per flat agent (+1 leading user pane if requested), names
    /// and launches each pane, returns the per-index mapping.
    pub async fn spawn(
        &self,
        session: &str,
        specs: &[AgentSpec],
        user_pane: bool,
        dir: &str,
        token: &CancellationToken,
    ) -> Result<HashMap<u32, SpawnedPane>, SessionError> {
        let flat = expand_agent_specs(specs)?;
        if flat.len() > self.config.max_agents {
            return Err(SessionError::MaxAgentsExceeded(self.config.max_agents));
        }

        if !self.mux.session_exists(session).await {
            with_cancellation(token, self.mux.create_session(session, dir)).await?;
        }

        let mut mapping = HashMap::new();
        let mut pane_index: u32 = 0;

        if user_pane {
            let pane_id = self.first_or_split(session, dir, pane_index, token).await?;
            let title = format_pane_name(session, AgentType::User, 1, None);
            with_cancellation(token, self.mux.set_pane_title(&pane_id, &title)).await?;
            mapping.insert(
                pane_index,
                SpawnedPane {
                    agent_type: AgentType::User,
                    model: None,
                    pane_id,
                },
            );
            pane_index += 1;
        }

        for (i, agent) in flat.iter().enumerate() {
            if token.is_cancelled() {
                return Err(SessionError::Cancelled);
            }
            let pane_id = self.first_or_split(session, dir, pane_index, token).await?;
            let title = format_pane_name(
                session,
                agent.agent_type,
                agent.index,
                agent.model.as_deref(),
            );
            with_cancellation(token, self.mux.set_pane_title(&pane_id, &title)).await?;
            let command = self.launch_command(agent.agent_type);
            with_cancellation(token, self.mux.send_keys(&pane_id, &command, true)).await?;
            mapping.insert(
                pane_index,
                SpawnedPane {
                    agent_type: agent.agent_type,
                    model: agent.model.clone(),
                    pane_id,
                },
            );
            pane_index += 1;

            if self.config.stagger_enabled && i + 1 < flat.len() {
                tokio::select! {
                    _ = token.cancelled() => return Err(SessionError::Cancelled),
                    _ = tokio::time::sleep(std::time::Duration::from_millis(self.config.stagger_interval_ms)) => {}
                }
            }
        }

        with_cancellation(token, self.mux.apply_tiled_layout(session)).await?;
        Ok(mapping)
    }

    /// The first pane (index 0, created implicitly by `create_session`)
    /// is reused rather than split again.
    async fn first_or_split(
        &self,
        session: &str,
        dir: &str,
        pane_index: u32,
        token: &CancellationToken,
    ) -> Result<String, SessionError> {
        if pane_index == 0 {
            let panes = with_cancellation(token, self.mux.get_panes(session)).await?;
            if let Some(pane) = panes.into_iter().find(|p| p.index == 0) {
                return Ok(pane.id);
            }
        }
        let pane_id = with_cancellation(token, self.mux.split_window(session, dir)).await?;
        Ok(pane_id)
    }

    fn launch_command(&self, agent_type: AgentType) -> String {
        self.config
            .agent_commands
            .get(agent_type.as_str())
            .cloned()
            .unwrap_or_else(|| agent_type.as_str().to_string())
    }

    /// **Send(session, prompt, targets)** — precedence: explicit
    /// `pane_index` overrides types; `all=true` targets every pane; any of
    /// `cc/cod/gmi` restricts to those types; otherwise `skip_first`
    /// (default true) targets agent panes only. `smart_route` reroutes a
    /// detected shell command to the user pane unless panes were
    /// explicitly specified.
    pub async fn send(
        &self,
        session: &str,
        prompt: &str,
        mut targets: SendTargets,
        smart_route: bool,
        panes_explicit: bool,
        token: &CancellationToken,
    ) -> Result<usize, SessionError> {
        if smart_route && !panes_explicit && looks_like_shell_command(prompt) {
            targets = SendTargets {
                pane_index: None,
                all: false,
                cc: false,
                cod: false,
                gmi: false,
                skip_first: false,
            };
            let panes = with_cancellation(token, self.mux.get_panes(session)).await?;
            let user_pane = panes
                .iter()
                .find(|p| p.agent_type == Some(AgentType::User))
                .ok_or_else(|| SessionError::PaneNotFound("user".to_string()))?;
            with_cancellation(token, self.mux.send_keys(&user_pane.id, prompt, true)).await?;
            return Ok(1);
        }

        let panes = with_cancellation(token, self.mux.get_panes(session)).await?;
        let mut delivered = 0;
        for pane in panes.iter().filter(|p| targets.matches(p)) {
            with_cancellation(token, self.mux.send_keys(&pane.id, prompt, true)).await?;
            delivered += 1;
        }
        debug!(session, delivered, "prompt delivered");
        Ok(delivered)
    }

    /// **Interrupt(session)** — delivers the interrupt sequence to every
    /// agent pane, never user panes.
    pub async fn interrupt(
        &self,
        session: &str,
        token: &CancellationToken,
    ) -> Result<usize, SessionError> {
        let panes = with_cancellation(token, self.mux.get_panes(session)).await?;
        let mut count = 0;
        for pane in panes.iter().filter(|p| p.agent_type != Some(AgentType::User)) {
            with_cancellation(token, self.mux.send_interrupt(&pane.id)).await?;
            count += 1;
        }
        Ok(count)
    }

    /// **Kill(session, force)** — destroys the session; when not forced,
    /// returns [`SessionError::ConfirmationRequired`] so the CLI layer can
    /// prompt interactively before retrying with `force=true`.
    pub async fn kill(
        &self,
        session: &str,
        force: bool,
        token: &CancellationToken,
    ) -> Result<(), SessionError> {
        if !force {
            return Err(SessionError::ConfirmationRequired);
        }
        with_cancellation(token, self.mux.kill_session(session)).await?;
        Ok(())
    }

    /// **Zoom(session, selector)** — resolves a numeric index or an
    /// agent-type selector (first pane of that type by ascending index),
    /// then zooms that pane.
    pub async fn zoom(
        &self,
        session: &str,
        selector: ZoomSelector,
        token: &CancellationToken,
    ) -> Result<u32, SessionError> {
        let index = match selector {
            ZoomSelector::Index(i) => i,
            ZoomSelector::AgentType(agent_type) => {
                let panes = with_cancellation(token, self.mux.get_panes(session)).await?;
                let mut matching: Vec<&Pane> = panes
                    .iter()
                    .filter(|p| p.agent_type == Some(agent_type))
                    .collect();
                matching.sort_by_key(|p| p.index);
                matching
                    .first()
                    .map(|p| p.index)
                    .ok_or_else(|| SessionError::PaneNotFound(agent_type.to_string()))?
            }
        };
        with_cancellation(token, self.mux.zoom_pane(session, index)).await?;
        Ok(index)
    }

    pub async fn attach_or_switch(
        &self,
        session: &str,
        token: &CancellationToken,
    ) -> Result<(), SessionError> {
        with_cancellation(token, self.mux.attach_or_switch(session)).await?;
        Ok(())
    }

    pub async fn get_panes(
        &self,
        session: &str,
        token: &CancellationToken,
    ) -> Result<Vec<Pane>, SessionError> {
        Ok(with_cancellation(token, self.mux.get_panes(session)).await?)
    }

    /// Captures recent scrollback for a single pane, resolving its id from
    /// the current pane list first. Used by the Coordinator Loop to
    /// classify pane activity without holding a `Multiplexer` of its own.
    pub async fn capture_pane_output(
        &self,
        session: &str,
        pane_index: u32,
        lines: u32,
        token: &CancellationToken,
    ) -> Result<String, SessionError> {
        let panes = self.get_panes(session, token).await?;
        let pane = panes
            .iter()
            .find(|p| p.index == pane_index)
            .ok_or_else(|| SessionError::PaneNotFound(pane_index.to_string()))?;
        Ok(with_cancellation(token, self.mux.capture_pane_output(&pane.id, lines)).await?)
    }
}

/// Heuristic used by `--smart-route`: a prompt that looks like a shell
/// invocation rather than natural-language agent instructions.
fn looks_like_shell_command(prompt: &str) -> bool {
    let trimmed = prompt.trim();
    if trimmed.is_empty() {
        return false;
    }
    let first_token = trimmed.split_whitespace().next().unwrap_or("");
    const SHELL_VERBS: &[&str] = &[
        "ls", "cd", "git", "cat", "grep", "rg", "find", "npm", "cargo", "make", "docker",
    ];
    SHELL_VERBS.contains(&first_token) || trimmed.starts_with('!')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tmux::fakes::RecordingMultiplexer;

    fn orchestrator() -> Orchestrator<RecordingMultiplexer> {
        Orchestrator::new(RecordingMultiplexer::new(), MultiplexerConfig::default())
    }

    #[tokio::test]
    async fn create_opens_requested_pane_count() {
        let orch = orchestrator();
        let token = CancellationToken::new();
        let panes = orch.create("alpha", 4, "/tmp", &token).await.unwrap();
        assert_eq!(panes.len(), 4);
    }

    #[tokio::test]
    async fn create_rejects_duplicate_session() {
        let orch = orchestrator();
        let token = CancellationToken::new();
        orch.create("alpha", 1, "/tmp", &token).await.unwrap();
        let err = orch.create("alpha", 1, "/tmp", &token).await.unwrap_err();
        assert!(matches!(err, SessionError::SessionAlreadyExists(_)));
    }

    #[tokio::test]
    async fn spawn_names_panes_bijectively() {
        let orch = orchestrator();
        let token = CancellationToken::new();
        let specs = vec![AgentSpec {
            agent_type: AgentType::Claude,
            count: Some(2),
            model: None,
            variants: None,
        }];
        let mapping = orch
            .spawn("alpha", &specs, true, "/tmp", &token)
            .await
            .unwrap();
        assert_eq!(mapping.len(), 3);
        assert_eq!(mapping[&0].agent_type, AgentType::User);
        assert_eq!(mapping[&1].agent_type, AgentType::Claude);
        assert_eq!(mapping[&2].agent_type, AgentType::Claude);
    }

    #[tokio::test]
    async fn send_skips_user_pane_by_default() {
        let orch = orchestrator();
        let token = CancellationToken::new();
        let specs = vec![AgentSpec {
            agent_type: AgentType::Claude,
            count: Some(1),
            model: None,
            variants: None,
        }];
        orch.spawn("alpha", &specs, true, "/tmp", &token).await.unwrap();
        let delivered = orch
            .send(
                "alpha",
                "hello",
                SendTargets::default_skip_first(),
                false,
                false,
                &token,
            )
            .await
            .unwrap();
        assert_eq!(delivered, 1);
    }

    #[tokio::test]
    async fn kill_without_force_requires_confirmation() {
        let orch = orchestrator();
        let token = CancellationToken::new();
        orch.create("alpha", 1, "/tmp", &token).await.unwrap();
        let err = orch.kill("alpha", false, &token).await.unwrap_err();
        assert!(matches!(err, SessionError::ConfirmationRequired));
    }
}
