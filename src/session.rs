//! Interactive research session: command parsing, per-turn orchestration and
//! the read/plan/dispatch loop.
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde_json::json;

use crate::agents::analyze::AnalyzeAgent;
use crate::agents::planning::PlanningAgent;
use crate::agents::render::RenderAgent;
use crate::agents::report::ReportAgent;
use crate::agents::search::SearchAgent;
use crate::agents::skill::SkillRuntime;
use crate::config::RuntimeConfig;
use crate::dispatcher::{DispatchObserver, DispatchReport, Dispatcher};
use crate::error::{ResearchError, format_turn_error};
use crate::input::HumanInput;
use crate::llm::{Completion, OpenAiCompletion};
use crate::mcp::build_tool_transport;
use crate::plan::{Context, Task};
use crate::registry::CapabilityRegistry;
use crate::search::{Search, build_search_service};
use crate::skills::{SkillDefinition, load_skills};
use crate::telemetry::TelemetrySink;
use crate::theme::{
    DIM, RED, RESET, YELLOW, build_prompt, format_command_palette, print_startup_banner,
    suggest_command,
};

// ---------------------------------------------------------------------------
// Session commands
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionCommand {
    Help,
    Clear,
    Exit,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedInput {
    Empty,
    Request(String),
    Command(SessionCommand),
    UnknownCommand(String),
}

/// Commands take a `/` or `\` prefix; anything else is a research request.
pub fn parse_session_input(input: &str) -> ParsedInput {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return ParsedInput::Empty;
    }

    let Some(command) = trimmed
        .strip_prefix('/')
        .or_else(|| trimmed.strip_prefix('\\'))
    else {
        return ParsedInput::Request(trimmed.to_string());
    };

    match command.trim().to_ascii_lowercase().as_str() {
        "help" => ParsedInput::Command(SessionCommand::Help),
        "clear" => ParsedInput::Command(SessionCommand::Clear),
        "exit" | "quit" => ParsedInput::Command(SessionCommand::Exit),
        other => ParsedInput::UnknownCommand(other.to_string()),
    }
}

// ---------------------------------------------------------------------------
// Dispatch observers
// ---------------------------------------------------------------------------

/// Prints step progress and follow-up insertions.
pub struct ConsoleObserver;

impl DispatchObserver for ConsoleObserver {
    fn step_started(&self, index: usize, total: usize, task: &Task) {
        println!(
            "{DIM}Step {}/{}:{RESET} [{}] {}",
            index + 1,
            total,
            task.name,
            task.description
        );
    }

    fn step_failed(&self, index: usize, _task: &Task, error: &ResearchError) {
        eprintln!("{RED}Step {} failed:{RESET} {}", index + 1, format_turn_error(error));
    }

    fn plan_extended(&self, index: usize, added: usize) {
        println!(
            "{YELLOW}+ {added} follow-up task(s) inserted after step {}{RESET}",
            index + 1
        );
    }
}

/// Mirrors dispatch progress into the telemetry sink, then forwards.
struct TelemetryObserver<'a> {
    telemetry: &'a TelemetrySink,
    inner: &'a dyn DispatchObserver,
}

impl DispatchObserver for TelemetryObserver<'_> {
    fn step_started(&self, index: usize, total: usize, task: &Task) {
        self.telemetry.emit(
            "step.started",
            json!({"index": index, "total": total, "task": task.name, "attempt": task.attempt}),
        );
        self.inner.step_started(index, total, task);
    }

    fn step_completed(&self, index: usize, task: &Task) {
        self.telemetry.emit(
            "step.completed",
            json!({"index": index, "task": task.name, "output_chars": task.output.chars().count()}),
        );
        self.inner.step_completed(index, task);
    }

    fn step_failed(&self, index: usize, task: &Task, error: &ResearchError) {
        self.telemetry.emit(
            "step.failed",
            json!({
                "index": index,
                "task": task.name,
                "category": error.category().code(),
                "error": error.to_string(),
            }),
        );
        self.inner.step_failed(index, task, error);
    }

    fn plan_extended(&self, index: usize, added: usize) {
        self.telemetry
            .emit("plan.extended", json!({"index": index, "added": added}));
        self.inner.plan_extended(index, added);
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum TurnOutcome {
    /// The planner answered without a plan.
    DirectReply(String),
    /// A confirmed plan ran to the end of its task list.
    Dispatched {
        deliverable: String,
        report: DispatchReport,
    },
}

impl TurnOutcome {
    pub fn text(&self) -> &str {
        match self {
            TurnOutcome::DirectReply(text) => text,
            TurnOutcome::Dispatched { deliverable, .. } => deliverable,
        }
    }
}

pub struct ResearchSession {
    completion: Arc<dyn Completion>,
    input: Arc<dyn HumanInput>,
    registry: CapabilityRegistry,
    skills: SkillRuntime,
    telemetry: TelemetrySink,
    auto_approve: bool,
    max_requeues: u32,
    ctx: Context,
}

impl ResearchSession {
    pub fn new(
        completion: Arc<dyn Completion>,
        input: Arc<dyn HumanInput>,
        registry: CapabilityRegistry,
        skills: SkillRuntime,
    ) -> Self {
        Self {
            completion,
            input,
            registry,
            skills,
            telemetry: TelemetrySink::disabled(),
            auto_approve: false,
            max_requeues: crate::config::DEFAULT_MAX_REQUEUES,
            ctx: Context::default(),
        }
    }

    pub fn with_telemetry(mut self, telemetry: TelemetrySink) -> Self {
        self.telemetry = telemetry;
        self
    }

    pub fn auto_approve(mut self, enabled: bool) -> Self {
        self.auto_approve = enabled;
        self
    }

    pub fn with_max_requeues(mut self, max_requeues: u32) -> Self {
        self.max_requeues = max_requeues;
        self
    }

    pub fn context(&self) -> &Context {
        &self.ctx
    }

    pub fn registry(&self) -> &CapabilityRegistry {
        &self.registry
    }

    pub fn input(&self) -> Arc<dyn HumanInput> {
        self.input.clone()
    }

    /// Forgets the request, plan and cursor.
    pub fn clear(&mut self) {
        self.ctx.clear();
    }

    /// Plans `request` with the human, then dispatches the accepted plan.
    pub async fn run_turn(
        &mut self,
        request: &str,
        observer: &dyn DispatchObserver,
    ) -> crate::error::Result<TurnOutcome> {
        self.ctx.begin_turn(request);
        self.telemetry.emit(
            "turn.started",
            json!({"request_chars": request.chars().count()}),
        );

        let mut planner =
            PlanningAgent::new(self.completion.clone(), self.input.clone(), &self.registry)
                .auto_approve(self.auto_approve);
        let plan = match planner.run(request).await {
            Ok(plan) => plan,
            Err(err) => {
                self.telemetry.emit(
                    "turn.failed",
                    json!({"category": err.category().code(), "error": err.to_string()}),
                );
                return Err(err);
            }
        };

        if plan.is_direct_reply() {
            self.telemetry
                .emit("turn.completed", json!({"direct": true, "steps": 0}));
            return Ok(TurnOutcome::DirectReply(plan.output));
        }

        self.telemetry.emit(
            "plan.proposed",
            json!({
                "tasks": plan.tasks.len(),
                "names": plan.tasks.iter().map(|task| task.name.as_str()).collect::<Vec<_>>(),
            }),
        );
        self.ctx.load_plan(plan);

        let dispatcher = Dispatcher::new(&self.registry, self.skills.clone())
            .with_max_requeues(self.max_requeues);
        let observer = TelemetryObserver {
            telemetry: &self.telemetry,
            inner: observer,
        };
        let report = dispatcher.run(&mut self.ctx, &observer).await;

        self.telemetry.emit(
            "turn.completed",
            json!({
                "direct": false,
                "steps": report.steps.len(),
                "failed_steps": report.failure_count(),
                "inserted": report.extended(),
            }),
        );

        Ok(TurnOutcome::Dispatched {
            deliverable: self.ctx.deliverable().unwrap_or_default().to_string(),
            report,
        })
    }
}

// ---------------------------------------------------------------------------
// Wiring
// ---------------------------------------------------------------------------

/// Registers the built-in sub-agents and every loaded skill.
pub fn build_registry(
    cfg: &RuntimeConfig,
    completion: Arc<dyn Completion>,
    search: Arc<dyn Search>,
    skills: Vec<SkillDefinition>,
) -> CapabilityRegistry {
    let mut registry = CapabilityRegistry::new();
    registry.register_agent(Box::new(
        SearchAgent::new(completion.clone(), search).with_max_rounds(cfg.max_search_rounds),
    ));
    registry.register_agent(Box::new(
        AnalyzeAgent::new(completion.clone()).with_max_requeues(cfg.max_requeues),
    ));
    registry.register_agent(Box::new(ReportAgent::new(completion)));
    registry.register_agent(Box::new(RenderAgent::new(
        cfg.render_width,
        cfg.render_padding,
    )));
    for skill in skills {
        registry.register_skill(skill);
    }
    registry
}

/// Assembles a session from runtime configuration.
pub async fn build_session(
    cfg: &RuntimeConfig,
    input: Arc<dyn HumanInput>,
    telemetry: TelemetrySink,
) -> Result<ResearchSession> {
    let completion: Arc<dyn Completion> = Arc::new(OpenAiCompletion::new(
        cfg.api_base.clone(),
        cfg.model.clone(),
        cfg.api_key.clone(),
    ));
    let search = build_search_service(cfg)?;
    let skills = load_skills(std::path::Path::new(&cfg.skills_dir));
    let tools =
        build_tool_transport(&cfg.mcp_config_path, Duration::from_secs(cfg.tool_timeout_secs))
            .await?;

    let registry = build_registry(cfg, completion.clone(), search, skills);
    tracing::info!(
        skills = registry.skill_count(),
        agents = registry.agent_count(),
        "capability registry ready"
    );

    let runtime = SkillRuntime::new(completion.clone(), tools).with_max_rounds(cfg.max_tool_rounds);
    Ok(ResearchSession::new(completion, input, registry, runtime)
        .with_telemetry(telemetry)
        .auto_approve(cfg.auto_approve)
        .with_max_requeues(cfg.max_requeues))
}

// ---------------------------------------------------------------------------
// Entry points
// ---------------------------------------------------------------------------

fn print_outcome(outcome: &TurnOutcome) {
    if let TurnOutcome::Dispatched { report, .. } = outcome
        && report.failure_count() > 0
    {
        eprintln!(
            "{YELLOW}{} of {} step(s) failed; the result may be incomplete.{RESET}",
            report.failure_count(),
            report.steps.len()
        );
    }

    let text = outcome.text();
    if text.trim().is_empty() {
        println!("{DIM}(no output produced){RESET}");
    } else {
        println!("{text}");
    }
}

/// Runs a single turn and prints its result.
pub async fn run_ask(session: &mut ResearchSession, prompt: &str) -> Result<()> {
    let outcome = session.run_turn(prompt, &ConsoleObserver).await?;
    print_outcome(&outcome);
    Ok(())
}

/// Reads requests until exit or end of input. Turn failures are reported and
/// the loop continues.
pub async fn run_chat(session: &mut ResearchSession, model: &str, search: &str) -> Result<()> {
    print_startup_banner(
        model,
        search,
        session.registry().skill_count(),
        session.registry().agent_count(),
    );
    let input = session.input();

    loop {
        let line = match input.read_line(&build_prompt()) {
            Ok(line) => line,
            Err(ResearchError::Input(reason)) => {
                tracing::debug!(%reason, "input closed; leaving session");
                println!();
                break;
            }
            Err(err) => return Err(err.into()),
        };

        match parse_session_input(&line) {
            ParsedInput::Empty => continue,
            ParsedInput::Command(SessionCommand::Help) => print!("{}", format_command_palette()),
            ParsedInput::Command(SessionCommand::Clear) => {
                session.clear();
                println!("{DIM}Context cleared.{RESET}");
            }
            ParsedInput::Command(SessionCommand::Exit) => break,
            ParsedInput::UnknownCommand(command) => {
                println!("Unknown command '/{command}'. Use /help.");
                if let Some(hint) = suggest_command(&command) {
                    println!("{hint}");
                }
            }
            ParsedInput::Request(request) => {
                match session.run_turn(&request, &ConsoleObserver).await {
                    Ok(outcome) => print_outcome(&outcome),
                    Err(err) => {
                        tracing::error!(error = %err, "turn failed");
                        eprintln!("{}", format_turn_error(&err));
                    }
                }
            }
        }
    }

    Ok(())
}
