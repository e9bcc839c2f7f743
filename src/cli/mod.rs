//! Command-line surface (spec.md §6.1): `clap` `Parser`/`Subcommand` derive,
//! exactly as the teacher's `src/cli/mod.rs`, with one `CliRunner` built
//! once per invocation and a `run` method matching every [`Commands`]
//! variant to a handler. Unlike the teacher, which keeps a long-lived
//! `MasterClaude` across a `Start`/`Stop`/daemon lifecycle, every `ntm`
//! invocation is one-shot: build the collaborators from [`NtmConfig`],
//! run one operation, print one envelope, exit.

pub mod output;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use output::{create_formatter, OutputFormatter};

use crate::assignment::{
    AssignmentFilters, Candidate, Engine as AssignmentEngine, FixtureTriageSource,
    PromptTemplate, ReassignTarget, Strategy, TriageSource,
};
use crate::config::NtmConfig;
use crate::coordination::{Coordination, HttpCoordinationClient};
use crate::coordinator::Coordinator;
use crate::ensemble::{self, AssignmentStrategy, Budget, Controller as EnsembleController, EnsembleConfigInput};
use crate::error::{ErrorCode, NtmError};
use crate::guards;
use crate::session::{AgentSpec, Orchestrator, SendTargets, Variant, ZoomSelector};
use crate::store::{Assignment, JsonFileStore, Store};
use crate::tmux::{
    AgentType, Multiplexer, Pane, RemoteTmuxMultiplexer, TmuxClientConfig, TmuxError,
    TmuxMultiplexer,
};

#[derive(Parser)]
#[command(name = "ntm")]
#[command(about = "Multi-agent terminal orchestrator for Claude, Codex, and Gemini coding agents")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    /// Working directory panes are opened in and ensemble data is rooted
    /// under (`<dir>/.ntm/ensembles`).
    #[arg(short, long, default_value = ".")]
    pub dir: PathBuf,

    /// Project key used for file-reservation conflict scoping.
    #[arg(long, default_value = "default")]
    pub project: String,

    /// Emit the `{success, data?, error?}` JSON envelope instead of
    /// human-readable text.
    #[arg(long)]
    pub json: bool,

    #[arg(short, long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create a bare multi-pane session (no agents launched).
    Create {
        session: String,
        #[arg(long, default_value_t = 1)]
        panes: u32,
    },

    /// Spawn agent panes into a session, creating it if absent.
    Spawn {
        session: String,
        #[arg(long)]
        claude: Option<u32>,
        #[arg(long)]
        codex: Option<u32>,
        #[arg(long)]
        gemini: Option<u32>,
        /// Model tag applied to every spawned pane in this call.
        #[arg(long)]
        model: Option<String>,
        #[arg(long)]
        no_user_pane: bool,
    },

    /// Deliver a prompt to one, several, or all agent panes.
    Send {
        session: String,
        prompt: String,
        #[arg(long)]
        pane: Option<u32>,
        #[arg(long)]
        claude: bool,
        #[arg(long)]
        codex: bool,
        #[arg(long)]
        gemini: bool,
        #[arg(long)]
        all: bool,
        /// Reroute a detected shell command to the user pane.
        #[arg(long)]
        smart_route: bool,
    },

    /// Send the interrupt sequence to every agent pane.
    Interrupt { session: String },

    /// Destroy a session.
    Kill {
        session: String,
        #[arg(long)]
        force: bool,
    },

    /// Attach (or switch, from inside tmux) to a session.
    View { session: String },

    /// Zoom a pane, by index or by agent type (first pane of that type).
    Zoom {
        session: String,
        #[arg(long)]
        pane: Option<u32>,
        #[arg(long = "type")]
        agent_type: Option<String>,
    },

    /// Run one Work-Assignment Engine planning pass against a JSON triage
    /// fixture.
    Assign {
        session: String,
        #[arg(long)]
        triage_fixture: PathBuf,
        #[arg(long)]
        strategy: Option<String>,
        #[arg(long, default_value_t = 0)]
        limit: usize,
        #[arg(long = "type")]
        agent_type: Option<String>,
        #[arg(long)]
        ignore_deps: bool,
        #[arg(long)]
        review: bool,
        #[arg(long)]
        no_reserve: bool,
    },

    /// Move an in-flight work item to a different pane or agent type.
    Reassign {
        session: String,
        work_id: String,
        #[arg(long)]
        pane: Option<u32>,
        #[arg(long = "type")]
        agent_type: Option<String>,
        #[arg(long)]
        force: bool,
        #[arg(long, default_value = "")]
        prompt: String,
    },

    /// Coordinator Loop operations (spec.md §4.G).
    Coordinator {
        #[command(subcommand)]
        action: CoordinatorAction,
    },

    /// Ensemble Controller operations (spec.md §4.F).
    Ensemble {
        #[command(subcommand)]
        action: EnsembleAction,
    },

    /// Approval lifecycle (spec.md §3).
    Approve {
        #[command(subcommand)]
        action: ApproveAction,
    },

    /// Pre-commit guard (spec.md §6.4).
    Guards {
        #[command(subcommand)]
        action: GuardsAction,
    },

    /// Out-of-scope surface kept discoverable per spec.md §1's explicit
    /// scoping; none of these are wired to real logic.
    Logs,
    Metrics,
    Message,
    Controller,
    Rotate,
    Deps,
    Repo,
    Upgrade,
    Kernel,
}

#[derive(Subcommand)]
pub enum CoordinatorAction {
    /// One tick's pane-activity classification.
    Status { session: String },
    /// One tick's digest, regardless of `send_digests`/interval config.
    Digest { session: String },
    /// One tick's file-reservation conflict report.
    Conflicts { session: String },
    /// One tick's auto-assign pass against a triage fixture.
    Assign {
        session: String,
        #[arg(long)]
        triage_fixture: PathBuf,
    },
    /// Persist `auto_assign = true` to the config file.
    Enable,
    /// Persist `auto_assign = false` to the config file.
    Disable,
}

#[derive(Subcommand)]
pub enum EnsembleAction {
    /// Plan and spawn a multi-mode ensemble.
    Spawn {
        question: String,
        #[arg(long)]
        preset: Option<String>,
        #[arg(long, value_delimiter = ',')]
        modes: Option<Vec<String>>,
        #[arg(long, default_value = "ens")]
        session: String,
        #[arg(long)]
        skip_inject: bool,
    },
    /// Reload a persisted ensemble session and poll mode completion.
    Status { session: String },
    /// Token/budget estimate without spawning (spec.md §4.F `Estimate`).
    Estimate {
        #[arg(long)]
        preset: Option<String>,
        #[arg(long, value_delimiter = ',')]
        modes: Option<Vec<String>>,
    },
    /// Rank presets by keyword overlap with `question`.
    Suggest { question: String },
    /// Estimate two or more presets side by side.
    Compare {
        #[arg(long, value_delimiter = ',', required = true)]
        presets: Vec<String>,
    },
    /// List the fixed preset catalog.
    Presets,
}

#[derive(Subcommand)]
pub enum ApproveAction {
    /// Approve a pending token.
    Grant {
        token: String,
        #[arg(long)]
        by: String,
    },
    /// List pending approvals.
    List,
    /// Deny a pending token.
    Deny {
        token: String,
        #[arg(long)]
        reason: String,
    },
    /// Show a single approval's current state.
    Show { token: String },
    /// Approval history; this store backend retains terminal records
    /// alongside pending ones but exposes no dedicated history query.
    History,
}

#[derive(Subcommand)]
pub enum GuardsAction {
    Install {
        #[arg(long)]
        project_key: String,
    },
    Uninstall,
    Status,
}

fn agent_type_flag(raw: &str) -> Result<AgentType, NtmError> {
    raw.parse::<AgentType>()
        .map_err(|e| NtmError::new(ErrorCode::Validation, e))
}

fn not_implemented(verb: &str) -> NtmError {
    NtmError::new(
        ErrorCode::Validation,
        format!("'{verb}' is not implemented in this build"),
    )
}

/// One-shot local multiplexer, local or remote over SSH depending on
/// configuration — composed so the rest of the CLI can stay generic over
/// a single concrete `Multiplexer` type rather than boxing every call.
pub enum AnyMultiplexer {
    Local(TmuxMultiplexer),
    Remote(RemoteTmuxMultiplexer),
}

#[async_trait::async_trait]
impl Multiplexer for AnyMultiplexer {
    async fn ensure_installed(&self) -> Result<(), TmuxError> {
        match self {
            AnyMultiplexer::Local(m) => m.ensure_installed().await,
            AnyMultiplexer::Remote(m) => m.ensure_installed().await,
        }
    }

    async fn session_exists(&self, name: &str) -> bool {
        match self {
            AnyMultiplexer::Local(m) => m.session_exists(name).await,
            AnyMultiplexer::Remote(m) => m.session_exists(name).await,
        }
    }

    async fn create_session(&self, name: &str, dir: &str) -> Result<(), TmuxError> {
        match self {
            AnyMultiplexer::Local(m) => m.create_session(name, dir).await,
            AnyMultiplexer::Remote(m) => m.create_session(name, dir).await,
        }
    }

    async fn split_window(&self, session: &str, dir: &str) -> Result<String, TmuxError> {
        match self {
            AnyMultiplexer::Local(m) => m.split_window(session, dir).await,
            AnyMultiplexer::Remote(m) => m.split_window(session, dir).await,
        }
    }

    async fn set_pane_title(&self, pane_id: &str, title: &str) -> Result<(), TmuxError> {
        match self {
            AnyMultiplexer::Local(m) => m.set_pane_title(pane_id, title).await,
            AnyMultiplexer::Remote(m) => m.set_pane_title(pane_id, title).await,
        }
    }

    async fn send_keys(&self, pane_id: &str, text: &str, append_return: bool) -> Result<(), TmuxError> {
        match self {
            AnyMultiplexer::Local(m) => m.send_keys(pane_id, text, append_return).await,
            AnyMultiplexer::Remote(m) => m.send_keys(pane_id, text, append_return).await,
        }
    }

    async fn send_interrupt(&self, pane_id: &str) -> Result<(), TmuxError> {
        match self {
            AnyMultiplexer::Local(m) => m.send_interrupt(pane_id).await,
            AnyMultiplexer::Remote(m) => m.send_interrupt(pane_id).await,
        }
    }

    async fn get_panes(&self, session: &str) -> Result<Vec<Pane>, TmuxError> {
        match self {
            AnyMultiplexer::Local(m) => m.get_panes(session).await,
            AnyMultiplexer::Remote(m) => m.get_panes(session).await,
        }
    }

    async fn capture_pane_output(&self, pane_id: &str, lines: u32) -> Result<String, TmuxError> {
        match self {
            AnyMultiplexer::Local(m) => m.capture_pane_output(pane_id, lines).await,
            AnyMultiplexer::Remote(m) => m.capture_pane_output(pane_id, lines).await,
        }
    }

    async fn apply_tiled_layout(&self, session: &str) -> Result<(), TmuxError> {
        match self {
            AnyMultiplexer::Local(m) => m.apply_tiled_layout(session).await,
            AnyMultiplexer::Remote(m) => m.apply_tiled_layout(session).await,
        }
    }

    async fn zoom_pane(&self, session: &str, index: u32) -> Result<(), TmuxError> {
        match self {
            AnyMultiplexer::Local(m) => m.zoom_pane(session, index).await,
            AnyMultiplexer::Remote(m) => m.zoom_pane(session, index).await,
        }
    }

    async fn kill_session(&self, name: &str) -> Result<(), TmuxError> {
        match self {
            AnyMultiplexer::Local(m) => m.kill_session(name).await,
            AnyMultiplexer::Remote(m) => m.kill_session(name).await,
        }
    }

    async fn attach_or_switch(&self, name: &str) -> Result<(), TmuxError> {
        match self {
            AnyMultiplexer::Local(m) => m.attach_or_switch(name).await,
            AnyMultiplexer::Remote(m) => m.attach_or_switch(name).await,
        }
    }
}

fn build_multiplexer(config: &NtmConfig) -> AnyMultiplexer {
    let tmux_config = TmuxClientConfig::from(&config.multiplexer);
    match &config.multiplexer.remote_host {
        Some(host) => AnyMultiplexer::Remote(RemoteTmuxMultiplexer::new(host.clone(), tmux_config)),
        None => AnyMultiplexer::Local(TmuxMultiplexer::with_config(tmux_config)),
    }
}

/// Everything a command handler needs: the concrete collaborators and the
/// formatter, built once from [`NtmConfig`] and the global CLI flags.
struct Ctx {
    orchestrator: Arc<Orchestrator<AnyMultiplexer>>,
    store: Arc<dyn Store>,
    coordination: Arc<dyn Coordination>,
    assignment_engine: Arc<AssignmentEngine<AnyMultiplexer>>,
    ensemble_controller: EnsembleController<AnyMultiplexer>,
    config: NtmConfig,
    dir: PathBuf,
    project: String,
    formatter: OutputFormatter,
}

impl Ctx {
    fn new(cli: &Cli, config: NtmConfig) -> Self {
        let mux = build_multiplexer(&config);
        let orchestrator = Arc::new(Orchestrator::new(mux, config.multiplexer.clone()));

        let assignments_dir = crate::config::assignments_dir();
        let approvals_path = crate::config::data_dir().join("approvals.json");
        let store: Arc<dyn Store> = Arc::new(JsonFileStore::new(assignments_dir, approvals_path));

        let coordination: Arc<dyn Coordination> = match HttpCoordinationClient::new(&config.coordination) {
            Ok(client) if config.coordination.enabled => Arc::new(client),
            _ => Arc::new(UnavailableCoordination),
        };

        let assignment_engine = Arc::new(AssignmentEngine::new(
            orchestrator.clone(),
            store.clone(),
            coordination.clone(),
            cli.project.clone(),
        ));

        let ensemble_mux = build_multiplexer(&config);
        let ensemble_controller =
            EnsembleController::new(ensemble_mux, config.multiplexer.clone(), config.ensemble.clone());

        let formatter = create_formatter(cli.json);

        Self {
            orchestrator,
            store,
            coordination,
            assignment_engine,
            ensemble_controller,
            config,
            dir: cli.dir.clone(),
            project: cli.project.clone(),
            formatter,
        }
    }

    fn dir_str(&self) -> String {
        self.dir.to_string_lossy().to_string()
    }
}

/// Stand-in `Coordination` used when no `AGENT_MAIL_URL` is configured;
/// every call degrades rather than panics, per spec.md §7's
/// `COORD_UNAVAILABLE` being non-fatal.
struct UnavailableCoordination;

#[async_trait::async_trait]
impl Coordination for UnavailableCoordination {
    async fn read_resource(&self, _uri: &str) -> Result<serde_json::Value, crate::coordination::CoordinationError> {
        Err(crate::coordination::CoordinationError::Unavailable(
            "coordination service not configured".to_string(),
        ))
    }
    async fn call_tool(&self, _name: &str, _params: serde_json::Value) -> Result<serde_json::Value, crate::coordination::CoordinationError> {
        Err(crate::coordination::CoordinationError::Unavailable(
            "coordination service not configured".to_string(),
        ))
    }
    async fn list_reservations(
        &self,
        _project: &str,
        _filter_agent: Option<&str>,
        _include_inactive: bool,
    ) -> Result<Vec<crate::coordination::FileReservation>, crate::coordination::CoordinationError> {
        Ok(vec![])
    }
    async fn reserve_files(
        &self,
        _agent: &str,
        _patterns: &[String],
        _reason: &str,
        _ttl: Duration,
    ) -> Result<Vec<crate::coordination::FileReservation>, crate::coordination::CoordinationError> {
        Err(crate::coordination::CoordinationError::Unavailable(
            "coordination service not configured".to_string(),
        ))
    }
    async fn transfer_reservations(&self, _from: &str, _to: &str, _work_id: &str) -> bool {
        false
    }
    async fn is_available(&self) -> bool {
        false
    }
}

fn build_agent_specs(
    claude: Option<u32>,
    codex: Option<u32>,
    gemini: Option<u32>,
    model: Option<&str>,
) -> Vec<AgentSpec> {
    let mut specs = Vec::new();
    for (agent_type, count) in [
        (AgentType::Claude, claude),
        (AgentType::Codex, codex),
        (AgentType::Gemini, gemini),
    ] {
        if let Some(count) = count {
            specs.push(AgentSpec {
                agent_type,
                count: Some(count),
                model: model.map(str::to_string),
                variants: None,
            });
        }
    }
    specs
}

/// Runs one parsed command to completion, returning the process exit code
/// (spec.md §6: 0 success, 1 generic failure, 2 validation error).
pub async fn run(cli: Cli) -> i32 {
    let config = match NtmConfig::load() {
        Ok(cfg) => cfg,
        Err(e) => {
            let formatter = create_formatter(cli.json);
            let err = NtmError::new(ErrorCode::Validation, format!("failed to load config: {e}"));
            println!("{}", formatter.error(&err));
            return err.exit_code();
        }
    };

    let ctx = Ctx::new(&cli, config);
    let token = CancellationToken::new();
    let watch_token = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            watch_token.cancel();
        }
    });

    match dispatch(&ctx, cli.command, &token).await {
        Ok(rendered) => {
            println!("{rendered}");
            0
        }
        Err(err) => {
            println!("{}", ctx.formatter.error(&err));
            err.exit_code()
        }
    }
}

async fn dispatch(ctx: &Ctx, command: Commands, token: &CancellationToken) -> Result<String, NtmError> {
    match command {
        Commands::Create { session, panes } => {
            let panes = ctx
                .orchestrator
                .create(&session, panes, &ctx.dir_str(), token)
                .await?;
            Ok(ctx.formatter.success(
                &format!("created session '{session}' with {} pane(s)", panes.len()),
                &panes_summary(&panes),
            ))
        }

        Commands::Spawn {
            session,
            claude,
            codex,
            gemini,
            model,
            no_user_pane,
        } => {
            let specs = build_agent_specs(claude, codex, gemini, model.as_deref());
            if specs.is_empty() {
                return Err(NtmError::new(
                    ErrorCode::Validation,
                    "at least one of --claude/--codex/--gemini must be given",
                ));
            }
            let mapping = ctx
                .orchestrator
                .spawn(&session, &specs, !no_user_pane, &ctx.dir_str(), token)
                .await?;
            let mut entries: Vec<_> = mapping.into_iter().collect();
            entries.sort_by_key(|(index, _)| *index);
            let data: Vec<_> = entries
                .iter()
                .map(|(index, pane)| {
                    serde_json::json!({
                        "pane_index": index,
                        "agent_type": pane.agent_type.as_str(),
                        "model": pane.model,
                        "pane_id": pane.pane_id,
                    })
                })
                .collect();
            Ok(ctx
                .formatter
                .success(&format!("spawned {} pane(s)", data.len()), &data))
        }

        Commands::Send {
            session,
            prompt,
            pane,
            claude,
            codex,
            gemini,
            all,
            smart_route,
        } => {
            let panes_explicit = pane.is_some() || claude || codex || gemini || all;
            let targets = SendTargets {
                cc: claude,
                cod: codex,
                gmi: gemini,
                all,
                skip_first: !panes_explicit,
                pane_index: pane,
            };
            let delivered = ctx
                .orchestrator
                .send(&session, &prompt, targets, smart_route, panes_explicit, token)
                .await?;
            Ok(ctx
                .formatter
                .success(&format!("delivered to {delivered} pane(s)"), &delivered))
        }

        Commands::Interrupt { session } => {
            let count = ctx.orchestrator.interrupt(&session, token).await?;
            Ok(ctx
                .formatter
                .success(&format!("interrupted {count} pane(s)"), &count))
        }

        Commands::Kill { session, force } => {
            ctx.orchestrator.kill(&session, force, token).await?;
            Ok(ctx.formatter.success_message(&format!("killed session '{session}'")))
        }

        Commands::View { session } => {
            ctx.orchestrator.attach_or_switch(&session, token).await?;
            Ok(ctx.formatter.success_message(&format!("attached to '{session}'")))
        }

        Commands::Zoom { session, pane, agent_type } => {
            let selector = match (pane, agent_type) {
                (Some(index), _) => ZoomSelector::Index(index),
                (None, Some(t)) => ZoomSelector::AgentType(agent_type_flag(&t)?),
                (None, None) => {
                    return Err(NtmError::new(
                        ErrorCode::Validation,
                        "one of --pane or --type is required",
                    ))
                }
            };
            let index = ctx.orchestrator.zoom(&session, selector, token).await?;
            Ok(ctx.formatter.success(&format!("zoomed pane {index}"), &index))
        }

        Commands::Assign {
            session,
            triage_fixture,
            strategy,
            limit,
            agent_type,
            ignore_deps,
            review,
            no_reserve,
        } => {
            let text = tokio::fs::read_to_string(&triage_fixture)
                .await
                .map_err(|e| NtmError::new(ErrorCode::Validation, format!("failed to read triage fixture: {e}")))?;
            let triage = FixtureTriageSource::from_json(&text)
                .map_err(|e| NtmError::new(ErrorCode::Validation, e.to_string()))?;
            let strategy = strategy
                .map(|s| s.parse::<Strategy>())
                .transpose()
                .map_err(|e| NtmError::new(ErrorCode::Validation, e))?
                .unwrap_or(Strategy::Balanced);
            let filters = AssignmentFilters {
                agent_type: agent_type.map(|t| agent_type_flag(&t)).transpose()?,
                work_ids: None,
                ignore_deps,
            };
            let prompt_template = if review { PromptTemplate::Review } else { PromptTemplate::Impl };
            let committed = ctx
                .assignment_engine
                .plan_and_commit(&session, &triage, strategy, limit, filters, prompt_template, !no_reserve, token)
                .await
                .map_err(|e| NtmError::new(ErrorCode::ExternalFail, e.to_string()))?;
            Ok(ctx
                .formatter
                .success(&format!("committed {} assignment(s)", committed.len()), &assignments_summary(&committed)))
        }

        Commands::Reassign { session, work_id, pane, agent_type, force, prompt } => {
            let target = match (pane, agent_type) {
                (Some(index), _) => ReassignTarget::Pane(index),
                (None, Some(t)) => ReassignTarget::AgentType(agent_type_flag(&t)?),
                (None, None) => {
                    return Err(NtmError::new(
                        ErrorCode::Validation,
                        "one of --pane or --type is required",
                    ))
                }
            };
            let assignment = ctx
                .assignment_engine
                .reassign(&session, &work_id, target, force, &prompt, token)
                .await?;
            Ok(ctx.formatter.success(
                &format!("reassigned '{work_id}' to pane {}", assignment.pane),
                &assignment_summary(&assignment),
            ))
        }

        Commands::Coordinator { action } => coordinator_command(ctx, action, token).await,
        Commands::Ensemble { action } => ensemble_command(ctx, action, token).await,
        Commands::Approve { action } => approve_command(ctx, action).await,
        Commands::Guards { action } => guards_command(ctx, action).await,

        Commands::Logs => Err(not_implemented("logs")),
        Commands::Metrics => Err(not_implemented("metrics")),
        Commands::Message => Err(not_implemented("message")),
        Commands::Controller => Err(not_implemented("controller")),
        Commands::Rotate => Err(not_implemented("rotate")),
        Commands::Deps => Err(not_implemented("deps")),
        Commands::Repo => Err(not_implemented("repo sync")),
        Commands::Upgrade => Err(not_implemented("upgrade")),
        Commands::Kernel => Err(not_implemented("kernel list")),
    }
}

fn build_coordinator(ctx: &Ctx) -> Coordinator<AnyMultiplexer> {
    build_coordinator_with(ctx, ctx.config.coordinator.clone())
}

fn build_coordinator_with(
    ctx: &Ctx,
    coordinator_config: crate::config::CoordinatorConfig,
) -> Coordinator<AnyMultiplexer> {
    Coordinator::new(
        ctx.orchestrator.clone(),
        ctx.store.clone(),
        ctx.coordination.clone(),
        ctx.assignment_engine.clone(),
        coordinator_config,
        ctx.config.assignment.clone(),
        ctx.project.clone(),
    )
}

async fn coordinator_command(
    ctx: &Ctx,
    action: CoordinatorAction,
    token: &CancellationToken,
) -> Result<String, NtmError> {
    match action {
        CoordinatorAction::Status { session } => {
            let coordinator = build_coordinator(ctx);
            let report = coordinator.tick(&session, None, token).await?;
            let data: Vec<_> = report
                .pane_states
                .iter()
                .map(|(index, state)| serde_json::json!({ "pane_index": index, "state": state }))
                .collect();
            Ok(ctx.formatter.success("coordinator status", &data))
        }
        CoordinatorAction::Digest { session } => {
            let mut coordinator_config = ctx.config.coordinator.clone();
            coordinator_config.send_digests = true;
            let coordinator = build_coordinator_with(ctx, coordinator_config);
            let report = coordinator.tick(&session, None, token).await?;
            Ok(ctx.formatter.success(
                "coordinator digest",
                &report.digest.map(digest_summary).unwrap_or(serde_json::Value::Null),
            ))
        }
        CoordinatorAction::Conflicts { session } => {
            let coordinator = build_coordinator(ctx);
            let report = coordinator.tick(&session, None, token).await?;
            let data: Vec<_> = report
                .conflicts
                .iter()
                .map(|c| {
                    serde_json::json!({
                        "agent_a": c.agent_a, "agent_b": c.agent_b,
                        "pattern_a": c.pattern_a, "pattern_b": c.pattern_b,
                    })
                })
                .collect();
            Ok(ctx
                .formatter
                .success(&format!("{} conflict(s)", data.len()), &data))
        }
        CoordinatorAction::Assign { session, triage_fixture } => {
            let text = tokio::fs::read_to_string(&triage_fixture)
                .await
                .map_err(|e| NtmError::new(ErrorCode::Validation, format!("failed to read triage fixture: {e}")))?;
            let triage = FixtureTriageSource::from_json(&text)
                .map_err(|e| NtmError::new(ErrorCode::Validation, e.to_string()))?;
            let mut coordinator_config = ctx.config.coordinator.clone();
            coordinator_config.auto_assign = true;
            let coordinator = build_coordinator_with(ctx, coordinator_config);
            let report = coordinator.tick(&session, Some(&triage), token).await?;
            Ok(ctx.formatter.success(
                &format!("auto-assigned {} item(s)", report.auto_assigned.len()),
                &assignments_summary(&report.auto_assigned),
            ))
        }
        CoordinatorAction::Enable => persist_coordinator_flag(ctx, true).await,
        CoordinatorAction::Disable => persist_coordinator_flag(ctx, false).await,
    }
}

async fn persist_coordinator_flag(ctx: &Ctx, enabled: bool) -> Result<String, NtmError> {
    let mut config = ctx.config.clone();
    config.coordinator.auto_assign = enabled;
    let path = crate::config::config_file_path();
    let rendered = toml::to_string_pretty(&config)
        .map_err(|e| NtmError::new(ErrorCode::ExternalFail, format!("failed to render config: {e}")))?;
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| NtmError::new(ErrorCode::ExternalFail, e.to_string()))?;
    }
    tokio::fs::write(&path, rendered)
        .await
        .map_err(|e| NtmError::new(ErrorCode::ExternalFail, e.to_string()))?;
    let verb = if enabled { "enabled" } else { "disabled" };
    Ok(ctx
        .formatter
        .success_message(&format!("auto-assign {verb} ({})", path.display())))
}

async fn ensemble_command(ctx: &Ctx, action: EnsembleAction, token: &CancellationToken) -> Result<String, NtmError> {
    match action {
        EnsembleAction::Spawn { question, preset, modes, session, skip_inject } => {
            let cfg = EnsembleConfigInput {
                question,
                preset,
                explicit_modes: modes,
                strategy: AssignmentStrategy::Affinity,
                synthesis_strategy: None,
                budget_override: Budget::default(),
                skip_inject,
                context_pack: None,
            };
            let result = ctx
                .ensemble_controller
                .spawn(&cfg, &session, &ctx.dir_str(), &ctx.dir, token)
                .await?;
            Ok(ctx
                .formatter
                .success(&format!("spawned ensemble '{}'", result.session_name), &result))
        }
        EnsembleAction::Status { session } => {
            let loaded = ctx.ensemble_controller.load(&ctx.dir, &session).await?;
            let polled = ctx.ensemble_controller.poll(loaded, token).await?;
            Ok(ctx.formatter.success(&format!("ensemble '{session}' status"), &polled))
        }
        EnsembleAction::Estimate { preset, modes } => {
            let cfg = EnsembleConfigInput {
                question: String::new(),
                preset,
                explicit_modes: modes,
                strategy: AssignmentStrategy::Affinity,
                synthesis_strategy: None,
                budget_override: Budget::default(),
                skip_inject: true,
                context_pack: None,
            };
            let result = ensemble::estimate(&cfg, &ctx.config.ensemble)?;
            Ok(ctx
                .formatter
                .success(&format!("estimated {} token(s)", result.total_estimate), &estimate_summary(&result)))
        }
        EnsembleAction::Suggest { question } => {
            let suggestions = ensemble::suggest(&question);
            Ok(ctx.formatter.success("preset suggestions", &suggestions_summary(&suggestions)))
        }
        EnsembleAction::Compare { presets } => {
            let mut rows = Vec::new();
            for name in presets {
                let cfg = EnsembleConfigInput {
                    question: String::new(),
                    preset: Some(name.clone()),
                    explicit_modes: None,
                    strategy: AssignmentStrategy::Affinity,
                    synthesis_strategy: None,
                    budget_override: Budget::default(),
                    skip_inject: true,
                    context_pack: None,
                };
                let result = ensemble::estimate(&cfg, &ctx.config.ensemble)?;
                rows.push(serde_json::json!({
                    "preset": name,
                    "total_estimate": result.total_estimate,
                    "warnings": result.warnings,
                }));
            }
            Ok(ctx.formatter.success("preset comparison", &rows))
        }
        EnsembleAction::Presets => {
            let presets = crate::ensemble::catalog::presets();
            let data: Vec<_> = presets
                .into_iter()
                .map(|p| serde_json::json!({ "name": p.name, "mode_codes": p.mode_codes, "keywords": p.keywords }))
                .collect();
            Ok(ctx.formatter.success(&format!("{} preset(s)", data.len()), &data))
        }
    }
}

async fn approve_command(ctx: &Ctx, action: ApproveAction) -> Result<String, NtmError> {
    match action {
        ApproveAction::Grant { token, by } => {
            let approval = ctx.store.approve(&token, &by).await?;
            Ok(ctx.formatter.success(&format!("approved '{token}'"), &approval))
        }
        ApproveAction::List => {
            let pending = ctx.store.list_pending().await?;
            Ok(ctx
                .formatter
                .success(&format!("{} pending approval(s)", pending.len()), &pending))
        }
        ApproveAction::Deny { token, reason } => {
            let approval = ctx.store.deny(&token, &reason).await?;
            Ok(ctx.formatter.success(&format!("denied '{token}'"), &approval))
        }
        ApproveAction::Show { token } => {
            let approval = ctx.store.check(&token).await?;
            Ok(ctx.formatter.success(&format!("approval '{token}'"), &approval))
        }
        ApproveAction::History => Err(NtmError::new(
            ErrorCode::Validation,
            "approval history is not retained by this store backend; use 'approve list' for pending items",
        )),
    }
}

async fn guards_command(ctx: &Ctx, action: GuardsAction) -> Result<String, NtmError> {
    match action {
        GuardsAction::Install { project_key } => {
            let status = guards::install(&ctx.dir, &project_key).await?;
            Ok(ctx
                .formatter
                .success("guard installed", &guard_status_summary(&status)))
        }
        GuardsAction::Uninstall => {
            guards::uninstall(&ctx.dir).await?;
            Ok(ctx.formatter.success_message("guard removed"))
        }
        GuardsAction::Status => {
            let status = guards::status(&ctx.dir).await?;
            Ok(ctx.formatter.success("guard status", &guard_status_summary(&status)))
        }
    }
}

fn guard_status_summary(status: &guards::GuardStatus) -> serde_json::Value {
    match status {
        guards::GuardStatus::NotInstalled => serde_json::json!({ "status": "not_installed" }),
        guards::GuardStatus::Installed { project_key } => {
            serde_json::json!({ "status": "installed", "project_key": project_key })
        }
        guards::GuardStatus::Foreign => serde_json::json!({ "status": "foreign" }),
    }
}

fn panes_summary(panes: &[Pane]) -> Vec<serde_json::Value> {
    panes
        .iter()
        .map(|p| {
            serde_json::json!({
                "index": p.index,
                "title": p.title,
                "agent_type": p.agent_type.map(|t| t.as_str()),
            })
        })
        .collect()
}

fn assignment_summary(assignment: &Assignment) -> serde_json::Value {
    serde_json::json!({
        "work_id": assignment.work_id,
        "pane": assignment.pane,
        "agent_type": assignment.agent_type.as_str(),
        "status": assignment.status.to_string(),
    })
}

fn assignments_summary(assignments: &[Assignment]) -> Vec<serde_json::Value> {
    assignments.iter().map(assignment_summary).collect()
}

fn digest_summary(digest: crate::coordinator::Digest) -> serde_json::Value {
    serde_json::json!({
        "generated_at": digest.generated_at,
        "pane_state_counts": digest.pane_state_counts,
        "assignment_status_counts": digest.assignment_status_counts,
        "alerts": digest.alerts,
    })
}

fn estimate_summary(result: &crate::ensemble::AnalysisResult) -> serde_json::Value {
    serde_json::json!({
        "total_estimate": result.total_estimate,
        "warnings": result.warnings,
        "suggested_replacements": result.suggested_replacements,
        "plan_len": result.plan.len(),
    })
}

fn suggestions_summary(suggestions: &[crate::ensemble::PresetSuggestion]) -> Vec<serde_json::Value> {
    suggestions
        .iter()
        .map(|s| serde_json::json!({ "name": s.name, "score": s.score, "matched_keywords": s.matched_keywords }))
        .collect()
}
