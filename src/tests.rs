use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{Map, Value, json};
use tempfile::tempdir;

use crate::agents::analyze::AnalyzeAgent;
use crate::agents::planning::PlanningAgent;
use crate::agents::search::{RESULTS_SEPARATOR, SearchAgent};
use crate::agents::skill::{SkillRuntime, ToolCallingAgent};
use crate::agents::{ANALYZE_AGENT, Agent, REPORT_AGENT, RENDER_AGENT, SEARCH_AGENT};
use crate::cli::*;
use crate::config::*;
use crate::conversation::{Message, Role, ToolCallRequest};
use crate::dispatcher::{Dispatcher, SilentObserver};
use crate::error::*;
use crate::input::HumanInput;
use crate::llm::{Completion, CompletionResponse, ToolSpec};
use crate::mcp::{DisabledToolTransport, ToolTransport};
use crate::plan::{AgentResult, Context, Task};
use crate::registry::{Capability, CapabilityRegistry};
use crate::search::Search;
use crate::session::{ResearchSession, TurnOutcome, build_registry};
use crate::skills::{SkillDefinition, SkillMeta};
use crate::telemetry::{TelemetrySink, summarize_telemetry_lines};

// ---------------------------------------------------------------------------
// Scripted collaborators
// ---------------------------------------------------------------------------

/// Replays canned replies in order and records every request.
pub(crate) struct ScriptedCompletion {
    replies: Mutex<VecDeque<Result<CompletionResponse>>>,
    calls: Mutex<Vec<Vec<Message>>>,
    offered_tools: Mutex<Vec<Vec<ToolSpec>>>,
}

impl ScriptedCompletion {
    pub(crate) fn new(replies: Vec<CompletionResponse>) -> Self {
        Self::from_results(replies.into_iter().map(Ok).collect())
    }

    pub(crate) fn texts(replies: &[&str]) -> Self {
        Self::new(replies.iter().map(|text| CompletionResponse::text(*text)).collect())
    }

    pub(crate) fn from_results(replies: Vec<Result<CompletionResponse>>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            calls: Mutex::new(Vec::new()),
            offered_tools: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn calls(&self) -> Vec<Vec<Message>> {
        self.calls.lock().expect("calls lock should not be poisoned").clone()
    }

    pub(crate) fn call_count(&self) -> usize {
        self.calls.lock().expect("calls lock should not be poisoned").len()
    }

    pub(crate) fn offered_tools(&self) -> Vec<Vec<ToolSpec>> {
        self.offered_tools
            .lock()
            .expect("tools lock should not be poisoned")
            .clone()
    }
}

#[async_trait]
impl Completion for ScriptedCompletion {
    async fn complete(
        &self,
        messages: &[Message],
        tools: &[ToolSpec],
    ) -> Result<CompletionResponse> {
        self.calls
            .lock()
            .expect("calls lock should not be poisoned")
            .push(messages.to_vec());
        self.offered_tools
            .lock()
            .expect("tools lock should not be poisoned")
            .push(tools.to_vec());
        self.replies
            .lock()
            .expect("replies lock should not be poisoned")
            .pop_front()
            .unwrap_or_else(|| Err(ResearchError::Upstream("script exhausted".to_string())))
    }

    fn model_name(&self) -> &str {
        "scripted"
    }
}

pub(crate) struct ScriptedSearch {
    results: Mutex<VecDeque<Result<String>>>,
    queries: Mutex<Vec<String>>,
}

impl ScriptedSearch {
    pub(crate) fn new(results: Vec<Result<String>>) -> Self {
        Self {
            results: Mutex::new(results.into()),
            queries: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn ok(results: &[&str]) -> Self {
        Self::new(results.iter().map(|r| Ok(r.to_string())).collect())
    }

    pub(crate) fn failing() -> Self {
        Self::new(vec![Err(ResearchError::Search(
            "provider returned 503".to_string(),
        ))])
    }

    pub(crate) fn queries(&self) -> Vec<String> {
        self.queries.lock().expect("queries lock should not be poisoned").clone()
    }
}

#[async_trait]
impl Search for ScriptedSearch {
    fn provider_name(&self) -> &'static str {
        "scripted"
    }

    async fn query(&self, text: &str) -> Result<String> {
        self.queries
            .lock()
            .expect("queries lock should not be poisoned")
            .push(text.to_string());
        self.results
            .lock()
            .expect("results lock should not be poisoned")
            .pop_front()
            .unwrap_or_else(|| Err(ResearchError::Search("no more results".to_string())))
    }
}

pub(crate) struct ScriptedInput {
    lines: Mutex<VecDeque<String>>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedInput {
    pub(crate) fn new(lines: &[&str]) -> Self {
        Self {
            lines: Mutex::new(lines.iter().map(|line| line.to_string()).collect()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn prompts(&self) -> Vec<String> {
        self.prompts.lock().expect("prompts lock should not be poisoned").clone()
    }
}

impl HumanInput for ScriptedInput {
    fn read_line(&self, prompt: &str) -> Result<String> {
        self.prompts
            .lock()
            .expect("prompts lock should not be poisoned")
            .push(prompt.to_string());
        self.lines
            .lock()
            .expect("lines lock should not be poisoned")
            .pop_front()
            .ok_or_else(|| ResearchError::Input("end of input".to_string()))
    }
}

pub(crate) struct ScriptedTransport {
    tools: Vec<ToolSpec>,
    calls: Mutex<Vec<(String, Map<String, Value>)>>,
}

impl ScriptedTransport {
    pub(crate) fn with_tool(name: &str) -> Self {
        Self {
            tools: vec![ToolSpec {
                name: name.to_string(),
                description: "scripted tool".to_string(),
                parameters: json!({"type": "object"}),
            }],
            calls: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn calls(&self) -> Vec<(String, Map<String, Value>)> {
        self.calls.lock().expect("calls lock should not be poisoned").clone()
    }
}

#[async_trait]
impl ToolTransport for ScriptedTransport {
    async fn list_tools(&self) -> Result<Vec<ToolSpec>> {
        Ok(self.tools.clone())
    }

    async fn call_tool(&self, qualified_name: &str, args: Map<String, Value>) -> Result<Value> {
        self.calls
            .lock()
            .expect("calls lock should not be poisoned")
            .push((qualified_name.to_string(), args));
        Ok(json!({"content": [{"type": "text", "text": format!("ran {qualified_name}")}]}))
    }
}

/// Records the references it was shown; output counts runs per instance.
struct RecordingAgent {
    name: String,
    seen: Arc<Mutex<Vec<String>>>,
    fresh_instances: Arc<AtomicUsize>,
    runs: usize,
}

impl RecordingAgent {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            seen: Arc::new(Mutex::new(Vec::new())),
            fresh_instances: Arc::new(AtomicUsize::new(0)),
            runs: 0,
        }
    }
}

#[async_trait]
impl Agent for RecordingAgent {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "records what it sees"
    }

    fn fresh(&self) -> Box<dyn Agent> {
        self.fresh_instances.fetch_add(1, Ordering::SeqCst);
        Box::new(RecordingAgent {
            name: self.name.clone(),
            seen: self.seen.clone(),
            fresh_instances: self.fresh_instances.clone(),
            runs: 0,
        })
    }

    async fn execute(&mut self, ctx: &Context, task: &Task) -> Result<AgentResult> {
        self.runs += 1;
        self.seen
            .lock()
            .expect("seen lock should not be poisoned")
            .push(ctx.references());
        Ok(AgentResult::output(format!("{}#{}", task.description, self.runs)))
    }
}

/// Always asks to be run again.
struct LoopingAgent;

#[async_trait]
impl Agent for LoopingAgent {
    fn name(&self) -> &str {
        "Looper"
    }

    fn description(&self) -> &str {
        "re-queues itself forever"
    }

    fn fresh(&self) -> Box<dyn Agent> {
        Box::new(LoopingAgent)
    }

    async fn execute(&mut self, _ctx: &Context, task: &Task) -> Result<AgentResult> {
        Ok(AgentResult {
            output: format!("pass {}", task.attempt),
            tasks: vec![task.requeued()],
        })
    }
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

fn test_cli(config_path: &str, profile: &str) -> Cli {
    Cli {
        model: None,
        api_base: None,
        api_key: None,
        tavily_api_key: None,
        search_provider: None,
        skills_dir: None,
        mcp_config: None,
        profile: profile.to_string(),
        config_path: config_path.to_string(),
        tool_timeout_secs: None,
        max_tool_rounds: None,
        max_search_rounds: None,
        max_requeues: None,
        render_width: None,
        render_padding: None,
        auto_approve: false,
        verbose: false,
        show_sensitive_config: false,
        telemetry_enabled: None,
        telemetry_path: None,
        log_filter: None,
        command: None,
    }
}

fn base_cfg() -> RuntimeConfig {
    resolve_runtime_config(
        &test_cli(".deepresearch/missing.toml", "default"),
        &ProfilesFile::default(),
    )
    .expect("default config should resolve")
}

fn test_skill(name: &str) -> SkillDefinition {
    SkillDefinition {
        meta: SkillMeta {
            name: name.to_string(),
            description: format!("{name} skill"),
            ..SkillMeta::default()
        },
        instructions: format!("You are the {name} skill."),
        root: std::path::PathBuf::from(format!("/skills/{name}")),
        resources: Default::default(),
    }
}

fn plan_json(tasks: &[(&str, &str)]) -> String {
    let tasks = tasks
        .iter()
        .map(|(name, description)| json!({"name": name, "description": description}))
        .collect::<Vec<_>>();
    json!({"output": "plan summary", "tasks": tasks}).to_string()
}

fn context_with(tasks: Vec<Task>) -> Context {
    let mut ctx = Context::new("research request");
    ctx.load_plan(AgentResult::follow_up(tasks));
    ctx
}

fn tool_call(id: &str, name: &str, arguments: &str) -> CompletionResponse {
    CompletionResponse {
        content: String::new(),
        tool_calls: vec![ToolCallRequest {
            id: id.to_string(),
            name: name.to_string(),
            arguments: arguments.to_string(),
        }],
    }
}

fn disabled_runtime(completion: Arc<dyn Completion>) -> SkillRuntime {
    SkillRuntime::new(completion, Arc::new(DisabledToolTransport))
}

// ---------------------------------------------------------------------------
// Planner
// ---------------------------------------------------------------------------

#[tokio::test]
async fn direct_reply_returns_without_dispatch() {
    let completion = Arc::new(ScriptedCompletion::texts(&[r#"{"output":"hi","tasks":[]}"#]));
    let input = Arc::new(ScriptedInput::new(&[]));
    let mut session = ResearchSession::new(
        completion.clone(),
        input.clone(),
        CapabilityRegistry::new(),
        disabled_runtime(completion.clone()),
    );

    let outcome = session
        .run_turn("hello", &SilentObserver)
        .await
        .expect("direct reply should succeed");

    assert!(matches!(outcome, TurnOutcome::DirectReply(ref text) if text == "hi"));
    assert!(input.prompts().is_empty());
    assert_eq!(completion.call_count(), 1);
    assert!(session.context().is_empty());
}

#[tokio::test]
async fn feedback_triggers_exactly_one_replan_with_that_message() {
    let completion = Arc::new(ScriptedCompletion::texts(&[
        &plan_json(&[("Echo", "first draft")]),
        &plan_json(&[("Echo", "more detail"), ("Echo", "summary")]),
    ]));
    let input = Arc::new(ScriptedInput::new(&["add more detail", "y"]));
    let mut registry = CapabilityRegistry::new();
    registry.register_agent(Box::new(RecordingAgent::new("Echo")));

    let mut planner = PlanningAgent::new(completion.clone(), input.clone(), &registry);
    let plan = planner
        .run("research solid-state batteries")
        .await
        .expect("plan should be accepted");

    assert_eq!(plan.tasks.len(), 2);
    assert_eq!(input.prompts().len(), 2);
    let calls = completion.calls();
    assert_eq!(calls.len(), 2);
    let feedback = calls[1].last().expect("second call should have messages");
    assert_eq!(feedback.role, Role::User);
    assert_eq!(feedback.content, "add more detail");
    assert_eq!(calls[1][calls[1].len() - 2].role, Role::Assistant);
}

#[tokio::test]
async fn empty_confirmation_replans_every_time() {
    let completion = Arc::new(ScriptedCompletion::texts(&[
        &plan_json(&[("Echo", "draft one")]),
        &plan_json(&[("Echo", "draft two")]),
        &plan_json(&[("Echo", "draft three")]),
    ]));
    let input = Arc::new(ScriptedInput::new(&["", "", "y"]));
    let mut registry = CapabilityRegistry::new();
    registry.register_agent(Box::new(RecordingAgent::new("Echo")));

    let mut planner = PlanningAgent::new(completion.clone(), input.clone(), &registry);
    let plan = planner
        .run("compare heat pumps")
        .await
        .expect("third plan should be accepted");

    assert_eq!(plan.tasks[0].description, "draft three");
    assert_eq!(input.prompts().len(), 3);
    let calls = completion.calls();
    assert_eq!(calls.len(), 3);
    for call in &calls[1..] {
        let last = call.last().expect("replan call should have messages");
        assert_eq!(last.role, Role::User);
        assert_eq!(last.content, "");
    }
}

#[tokio::test]
async fn unparsable_plan_fails_the_turn() {
    let completion = Arc::new(ScriptedCompletion::texts(&["Sure! Here is my plan: search."]));
    let mut session = ResearchSession::new(
        completion.clone(),
        Arc::new(ScriptedInput::new(&[])),
        CapabilityRegistry::new(),
        disabled_runtime(completion),
    );

    let err = session
        .run_turn("plan this", &SilentObserver)
        .await
        .expect_err("non-json plan should fail");
    assert!(matches!(err, ResearchError::PlanParse { .. }));
    assert_eq!(err.category(), ErrorCategory::Planning);
    assert!(session.context().is_empty());
}

#[tokio::test]
async fn auto_approve_skips_the_prompt() {
    let completion = Arc::new(ScriptedCompletion::texts(&[&plan_json(&[("Echo", "only")])]));
    let input = Arc::new(ScriptedInput::new(&[]));
    let mut registry = CapabilityRegistry::new();
    registry.register_agent(Box::new(RecordingAgent::new("Echo")));

    let mut session = ResearchSession::new(
        completion.clone(),
        input.clone(),
        registry,
        disabled_runtime(completion),
    )
    .auto_approve(true);
    let outcome = session
        .run_turn("anything", &SilentObserver)
        .await
        .expect("auto-approved turn should run");

    assert_eq!(outcome.text(), "only#1");
    assert!(input.prompts().is_empty());
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

#[tokio::test]
async fn dispatch_runs_every_task_and_leaves_cursor_at_end() {
    let mut registry = CapabilityRegistry::new();
    registry.register_agent(Box::new(RecordingAgent::new("Echo")));
    let completion = Arc::new(ScriptedCompletion::new(Vec::new()));
    let dispatcher = Dispatcher::new(&registry, disabled_runtime(completion));

    let mut ctx = context_with(vec![
        Task::new("Echo", "a"),
        Task::new("Echo", "b"),
        Task::new("Echo", "c"),
    ]);
    let report = dispatcher.run(&mut ctx, &SilentObserver).await;

    assert_eq!(report.steps.len(), 3);
    assert_eq!(report.failure_count(), 0);
    assert_eq!(ctx.offset(), ctx.len());
    assert_eq!(ctx.deliverable(), Some("c#1"));
}

#[tokio::test]
async fn later_tasks_never_leak_into_references() {
    let recorder = RecordingAgent::new("Echo");
    let seen = recorder.seen.clone();
    let mut registry = CapabilityRegistry::new();
    registry.register_agent(Box::new(recorder));
    let dispatcher = Dispatcher::new(
        &registry,
        disabled_runtime(Arc::new(ScriptedCompletion::new(Vec::new()))),
    );

    let mut ctx = context_with(vec![
        Task::new("Echo", "a"),
        Task::new("Echo", "b"),
        Task::new("Echo", "c"),
    ]);
    ctx.tasks[2].output = "stale".to_string();
    dispatcher.run(&mut ctx, &SilentObserver).await;

    let seen = seen.lock().expect("seen lock should not be poisoned").clone();
    assert_eq!(seen[0], "");
    assert_eq!(seen[1], "Output from Echo task:\na#1");
    assert!(!seen[1].contains("stale"));
    assert_eq!(seen[2], "Output from Echo task:\na#1\n\nOutput from Echo task:\nb#1");
}

#[tokio::test]
async fn unknown_task_name_is_recorded_and_skipped() {
    let mut registry = CapabilityRegistry::new();
    registry.register_agent(Box::new(RecordingAgent::new("Echo")));
    let dispatcher = Dispatcher::new(
        &registry,
        disabled_runtime(Arc::new(ScriptedCompletion::new(Vec::new()))),
    );

    let mut ctx = context_with(vec![Task::new("Ghost", "?"), Task::new("Echo", "after")]);
    let report = dispatcher.run(&mut ctx, &SilentObserver).await;

    assert!(matches!(
        report.steps[0].error,
        Some(ResearchError::StepResolution(ref name)) if name == "Ghost"
    ));
    assert_eq!(ctx.tasks[0].output, "");
    assert_eq!(ctx.tasks[1].output, "after#1");
    assert_eq!(ctx.offset(), 2);
}

#[tokio::test]
async fn failing_search_step_keeps_empty_output_and_moves_on() {
    let completion = Arc::new(ScriptedCompletion::new(Vec::new()));
    let mut registry = CapabilityRegistry::new();
    registry.register_agent(Box::new(SearchAgent::new(
        completion.clone(),
        Arc::new(ScriptedSearch::failing()),
    )));
    registry.register_agent(Box::new(RecordingAgent::new("Echo")));
    let dispatcher = Dispatcher::new(&registry, disabled_runtime(completion.clone()));

    let mut ctx = context_with(vec![
        Task::new(SEARCH_AGENT, "find prices"),
        Task::new("Echo", "next"),
    ]);
    let report = dispatcher.run(&mut ctx, &SilentObserver).await;

    let Some(ResearchError::StepExecution { task, source }) = &report.steps[0].error else {
        panic!("search step should fail with a step execution error");
    };
    assert_eq!(task, SEARCH_AGENT);
    assert!(matches!(**source, ResearchError::Search(_)));
    assert_eq!(ctx.tasks[0].output, "");
    assert_eq!(ctx.tasks[1].output, "next#1");
    assert_eq!(ctx.offset(), 2);
    assert_eq!(completion.call_count(), 0);
}

#[tokio::test]
async fn missing_info_splices_search_and_requeued_analysis() {
    let completion = Arc::new(ScriptedCompletion::texts(&[
        "MISSING_INFO: battery cell prices 2025",
        "SUFFICIENT",
        "final analysis",
    ]));
    let search = Arc::new(ScriptedSearch::ok(&["cell prices fell 20%"]));
    let mut registry = CapabilityRegistry::new();
    registry.register_agent(Box::new(SearchAgent::new(completion.clone(), search.clone())));
    registry.register_agent(Box::new(AnalyzeAgent::new(completion.clone())));
    registry.register_agent(Box::new(RecordingAgent::new("Echo")));
    let dispatcher = Dispatcher::new(&registry, disabled_runtime(completion.clone()));

    let mut ctx = context_with(vec![
        Task::new(ANALYZE_AGENT, "compare costs"),
        Task::new("Echo", "wrap up"),
    ]);
    let report = dispatcher.run(&mut ctx, &SilentObserver).await;

    let names = ctx.tasks.iter().map(|t| t.name.as_str()).collect::<Vec<_>>();
    assert_eq!(names, vec![ANALYZE_AGENT, SEARCH_AGENT, ANALYZE_AGENT, "Echo"]);
    assert_eq!(search.queries(), vec!["battery cell prices 2025".to_string()]);
    assert_eq!(ctx.tasks[0].output, "");
    assert_eq!(ctx.tasks[1].output, "cell prices fell 20%");
    assert_eq!(ctx.tasks[2].attempt, 1);
    assert_eq!(ctx.tasks[2].output, "final analysis");
    assert_eq!(report.extended(), 2);
    assert_eq!(ctx.offset(), ctx.len());

    let second_analysis = completion.calls()[2].clone();
    let prompt = &second_analysis.last().expect("analysis prompt should exist").content;
    assert!(prompt.contains("Output from SearchSubAgent task:\ncell prices fell 20%"));
}

#[tokio::test]
async fn requeue_limit_drops_the_follow_up_batch() {
    let mut registry = CapabilityRegistry::new();
    registry.register_agent(Box::new(LoopingAgent));
    let dispatcher = Dispatcher::new(
        &registry,
        disabled_runtime(Arc::new(ScriptedCompletion::new(Vec::new()))),
    )
    .with_max_requeues(2);

    let mut ctx = context_with(vec![Task::new("Looper", "spin")]);
    let report = dispatcher.run(&mut ctx, &SilentObserver).await;

    assert_eq!(ctx.len(), 3);
    assert_eq!(report.steps.len(), 3);
    assert!(matches!(
        report.steps[2].error,
        Some(ResearchError::RequeueLimit { limit: 2, .. })
    ));
    assert_eq!(ctx.tasks[2].output, "pass 2");
    assert_eq!(ctx.offset(), 3);
}

#[tokio::test]
async fn analysis_at_limit_does_not_ask_for_more() {
    let completion = Arc::new(ScriptedCompletion::texts(&["MISSING_INFO: anything"]));
    let mut agent = AnalyzeAgent::new(completion.clone()).with_max_requeues(0);
    let ctx = context_with(vec![Task::new(ANALYZE_AGENT, "analyze")]);

    let result = agent
        .execute(&ctx, &ctx.tasks[0])
        .await
        .expect("analysis should succeed");

    assert!(result.tasks.is_empty());
    assert_eq!(result.output, "MISSING_INFO: anything");
    let prompt = &completion.calls()[0][1].content;
    assert!(!prompt.contains("MISSING_INFO"));
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

#[test]
fn skills_shadow_sub_agents_with_the_same_name() {
    let mut registry = CapabilityRegistry::new();
    registry.register_agent(Box::new(RecordingAgent::new("pdf")));
    registry.register_skill(test_skill("pdf"));

    assert!(matches!(registry.resolve("pdf"), Some(Capability::Skill(_))));
    assert!(registry.resolve("nothing").is_none());
}

#[test]
fn duplicate_skill_names_keep_the_first_registration() {
    let mut registry = CapabilityRegistry::new();
    let first = test_skill("pdf");
    let mut second = test_skill("pdf");
    second.root = std::path::PathBuf::from("/other/pdf");
    registry.register_skill(first);
    registry.register_skill(second);

    assert_eq!(registry.skill_count(), 1);
    let Some(Capability::Skill(kept)) = registry.resolve("pdf") else {
        panic!("pdf should resolve to a skill");
    };
    assert_eq!(kept.root, std::path::PathBuf::from("/skills/pdf"));
}

#[tokio::test]
async fn every_resolution_gets_a_fresh_instance() {
    let recorder = RecordingAgent::new("Echo");
    let fresh = recorder.fresh_instances.clone();
    let mut registry = CapabilityRegistry::new();
    registry.register_agent(Box::new(recorder));
    let dispatcher = Dispatcher::new(
        &registry,
        disabled_runtime(Arc::new(ScriptedCompletion::new(Vec::new()))),
    );

    let mut ctx = context_with(vec![Task::new("Echo", "x"), Task::new("Echo", "y")]);
    dispatcher.run(&mut ctx, &SilentObserver).await;

    assert_eq!(fresh.load(Ordering::SeqCst), 2);
    assert_eq!(ctx.tasks[0].output, "x#1");
    assert_eq!(ctx.tasks[1].output, "y#1");
}

// ---------------------------------------------------------------------------
// Search loop
// ---------------------------------------------------------------------------

#[tokio::test]
async fn search_stops_after_round_bound_and_concatenates() {
    let completion = Arc::new(ScriptedCompletion::texts(&["query two", "query three", "query four"]));
    let search = Arc::new(ScriptedSearch::ok(&["r1", "r2", "r3", "r4"]));
    let mut agent = SearchAgent::new(completion.clone(), search.clone()).with_max_rounds(3);
    let ctx = context_with(vec![
        Task::new(SEARCH_AGENT, "find sources").with_parameter("query", "query one"),
    ]);

    let result = agent
        .execute(&ctx, &ctx.tasks[0])
        .await
        .expect("search should succeed");

    assert_eq!(
        result.output,
        format!("r1{RESULTS_SEPARATOR}r2{RESULTS_SEPARATOR}r3")
    );
    assert_eq!(search.queries(), vec!["query one", "query two", "query three"]);
    assert_eq!(completion.call_count(), 3);
}

#[tokio::test]
async fn sufficient_verdict_ends_search_early() {
    let completion = Arc::new(ScriptedCompletion::texts(&["SUFFICIENT"]));
    let search = Arc::new(ScriptedSearch::ok(&["only round"]));
    let mut agent = SearchAgent::new(completion.clone(), search.clone());
    let ctx = context_with(vec![Task::new(SEARCH_AGENT, "description is the query")]);

    let result = agent
        .execute(&ctx, &ctx.tasks[0])
        .await
        .expect("search should succeed");

    assert_eq!(result.output, "only round");
    assert_eq!(search.queries(), vec!["description is the query"]);
}

#[tokio::test]
async fn later_search_failure_keeps_earlier_results() {
    let completion = Arc::new(ScriptedCompletion::texts(&["narrower query"]));
    let search = Arc::new(ScriptedSearch::new(vec![
        Ok("first batch".to_string()),
        Err(ResearchError::Search("rate limited".to_string())),
    ]));
    let mut registry = CapabilityRegistry::new();
    registry.register_agent(Box::new(SearchAgent::new(completion.clone(), search.clone())));
    let dispatcher = Dispatcher::new(&registry, disabled_runtime(completion));

    let mut ctx = context_with(vec![Task::new(SEARCH_AGENT, "q")]);
    let report = dispatcher.run(&mut ctx, &SilentObserver).await;

    assert!(report.steps[0].error.is_none());
    assert_eq!(ctx.tasks[0].output, "first batch");
    assert_eq!(search.queries(), vec!["q", "narrower query"]);
    assert_eq!(ctx.offset(), 1);
}

#[tokio::test]
async fn failed_sufficiency_check_keeps_gathered_results() {
    let completion = Arc::new(ScriptedCompletion::from_results(vec![Err(
        ResearchError::Upstream("model unavailable".to_string()),
    )]));
    let search = Arc::new(ScriptedSearch::ok(&["only batch"]));
    let mut agent = SearchAgent::new(completion, search.clone());
    let ctx = context_with(vec![Task::new(SEARCH_AGENT, "q")]);

    let result = agent
        .execute(&ctx, &ctx.tasks[0])
        .await
        .expect("gathered results should survive a failed check");
    assert_eq!(result.output, "only batch");
    assert_eq!(search.queries(), vec!["q"]);
}

#[tokio::test]
async fn single_failing_search_plan_ends_with_cursor_at_one() {
    let completion = Arc::new(ScriptedCompletion::new(Vec::new()));
    let mut registry = CapabilityRegistry::new();
    registry.register_agent(Box::new(SearchAgent::new(
        completion.clone(),
        Arc::new(ScriptedSearch::failing()),
    )));
    let dispatcher = Dispatcher::new(&registry, disabled_runtime(completion));

    let mut ctx = context_with(vec![Task::new(SEARCH_AGENT, "find X")]);
    let report = dispatcher.run(&mut ctx, &SilentObserver).await;

    assert!(matches!(
        report.steps[0].error,
        Some(ResearchError::StepExecution { .. })
    ));
    assert_eq!(ctx.tasks[0].output, "");
    assert_eq!(ctx.offset(), 1);
}

// ---------------------------------------------------------------------------
// Tool-calling loop
// ---------------------------------------------------------------------------

#[tokio::test]
async fn tool_loop_fails_after_round_budget() {
    let completion = Arc::new(ScriptedCompletion::new(
        (0..10)
            .map(|i| tool_call(&format!("call-{i}"), "fs__read", r#"{"path":"a.txt"}"#))
            .collect(),
    ));
    let transport = Arc::new(ScriptedTransport::with_tool("fs__read"));
    let runtime = SkillRuntime::new(completion.clone(), transport.clone()).with_max_rounds(10);
    let mut agent = ToolCallingAgent::new(test_skill("reader"), runtime);
    let ctx = context_with(vec![Task::new("reader", "read the file")]);

    let err = agent
        .execute(&ctx, &ctx.tasks[0])
        .await
        .expect_err("endless tool calls should exhaust the budget");

    assert!(matches!(err, ResearchError::ToolBudgetExceeded { rounds: 10 }));
    assert_eq!(completion.call_count(), 10);
    assert_eq!(transport.calls().len(), 10);
}

#[tokio::test]
async fn tool_results_are_fed_back_until_a_text_reply() {
    let completion = Arc::new(ScriptedCompletion::new(vec![
        tool_call("c1", "fs__read", r#"{"path":"notes.md"}"#),
        CompletionResponse::text("```markdown\nsummary of notes\n```"),
    ]));
    let transport = Arc::new(ScriptedTransport::with_tool("fs__read"));
    let runtime = SkillRuntime::new(completion.clone(), transport.clone());
    let mut agent = ToolCallingAgent::new(test_skill("reader"), runtime);
    let ctx = context_with(vec![Task::new("reader", "summarize notes")]);

    let result = agent
        .execute(&ctx, &ctx.tasks[0])
        .await
        .expect("skill should finish");

    assert_eq!(result.output, "summary of notes");
    let calls = transport.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].0, "fs__read");
    assert_eq!(calls[0].1.get("path"), Some(&json!("notes.md")));

    let second = &completion.calls()[1];
    assert!(second[0].content.starts_with("You are the reader skill."));
    let tool_message = second.last().expect("tool result should be appended");
    assert_eq!(tool_message.role, Role::Tool);
    assert_eq!(tool_message.tool_call_id.as_deref(), Some("c1"));
    assert!(tool_message.content.contains("ran fs__read"));
    assert_eq!(completion.offered_tools()[0][0].name, "fs__read");
}

#[tokio::test]
async fn malformed_tool_arguments_are_reported_not_executed() {
    let completion = Arc::new(ScriptedCompletion::new(vec![
        tool_call("c1", "fs__read", "{oops"),
        CompletionResponse::text("gave up"),
    ]));
    let transport = Arc::new(ScriptedTransport::with_tool("fs__read"));
    let mut agent = ToolCallingAgent::new(
        test_skill("reader"),
        SkillRuntime::new(completion.clone(), transport.clone()),
    );
    let ctx = context_with(vec![Task::new("reader", "read")]);

    let result = agent
        .execute(&ctx, &ctx.tasks[0])
        .await
        .expect("skill should finish");

    assert_eq!(result.output, "gave up");
    assert!(transport.calls().is_empty());
    let tool_message = completion.calls()[1]
        .last()
        .cloned()
        .expect("tool message should exist");
    assert!(tool_message.content.starts_with("invalid tool arguments"));
}

#[tokio::test]
async fn dispatcher_runs_skills_through_the_tool_loop() {
    let completion = Arc::new(ScriptedCompletion::texts(&["skill answer"]));
    let mut registry = CapabilityRegistry::new();
    registry.register_skill(test_skill("pdf-reader"));
    let dispatcher = Dispatcher::new(
        &registry,
        SkillRuntime::new(completion.clone(), Arc::new(ScriptedTransport::with_tool("pdf__open"))),
    );

    let mut ctx = context_with(vec![Task::new("pdf-reader", "extract tables")]);
    let report = dispatcher.run(&mut ctx, &SilentObserver).await;

    assert_eq!(report.failure_count(), 0);
    assert_eq!(ctx.tasks[0].output, "skill answer");
    let user_prompt = &completion.calls()[0][1].content;
    assert!(user_prompt.contains("Key user instruction/request: research request"));
    assert!(user_prompt.contains("Current task goal: extract tables"));
}

// ---------------------------------------------------------------------------
// Session end to end
// ---------------------------------------------------------------------------

fn full_plan() -> String {
    format!(
        "```json\n{}\n```",
        json!({
            "output": "research, analyze, report",
            "tasks": [
                {"name": SEARCH_AGENT, "description": "find sources", "parameters": {"query": "solid-state batteries"}},
                {"name": ANALYZE_AGENT, "description": "compare makers"},
                {"name": REPORT_AGENT, "description": "write report"},
                {"name": RENDER_AGENT, "description": "render report"}
            ]
        })
    )
}

#[tokio::test]
async fn confirmed_plan_runs_to_a_rendered_report() {
    let completion = Arc::new(ScriptedCompletion::new(vec![
        CompletionResponse::text(full_plan()),
        CompletionResponse::text("SUFFICIENT"),
        CompletionResponse::text("analysis text"),
        CompletionResponse::text("# Battery Report\n\nSolid-state cells lead."),
    ]));
    let input = Arc::new(ScriptedInput::new(&["yes"]));
    let search = Arc::new(ScriptedSearch::ok(&["Title: A\nURL: https://a.example\nContent: c"]));
    let cfg = base_cfg();
    let registry = build_registry(&cfg, completion.clone(), search.clone(), Vec::new());
    let mut session = ResearchSession::new(
        completion.clone(),
        input.clone(),
        registry,
        disabled_runtime(completion.clone()),
    );

    let outcome = session
        .run_turn("Compare solid-state battery makers", &SilentObserver)
        .await
        .expect("turn should succeed");

    let TurnOutcome::Dispatched { deliverable, report } = outcome else {
        panic!("a plan should have been dispatched");
    };
    assert_eq!(report.failure_count(), 0);
    assert!(deliverable.contains("Battery Report"));
    assert!(deliverable.contains("Solid-state cells lead."));
    assert_eq!(session.context().offset(), 4);
    assert_eq!(session.context().len(), 4);
    assert_eq!(search.queries(), vec!["solid-state batteries"]);
    assert!(input.prompts()[0].contains("[SearchSubAgent] find sources"));

    let analyze_prompt = completion.calls()[2]
        .last()
        .cloned()
        .expect("analysis prompt should exist");
    assert!(analyze_prompt.content.contains("Output from SearchSubAgent task:\nTitle: A"));

    session.clear();
    assert!(session.context().is_empty());
    assert_eq!(session.context().offset(), 0);
    assert_eq!(session.context().input, "");
}

#[tokio::test]
async fn turn_events_are_written_to_telemetry() {
    let dir = tempdir().expect("temp directory should create");
    let path = dir.path().join("telemetry.jsonl");
    let mut cfg = base_cfg();
    cfg.telemetry_enabled = true;
    cfg.telemetry_path = path.to_string_lossy().to_string();

    let completion = Arc::new(ScriptedCompletion::texts(&[&plan_json(&[
        ("Echo", "one"),
        ("Ghost", "missing"),
    ])]));
    let mut registry = CapabilityRegistry::new();
    registry.register_agent(Box::new(RecordingAgent::new("Echo")));
    let mut session = ResearchSession::new(
        completion.clone(),
        Arc::new(ScriptedInput::new(&["继续"])),
        registry,
        disabled_runtime(completion),
    )
    .with_telemetry(TelemetrySink::new(&cfg, "chat".to_string()));

    session
        .run_turn("request", &SilentObserver)
        .await
        .expect("turn should succeed");

    let lines = std::fs::read_to_string(&path)
        .expect("telemetry file should exist")
        .lines()
        .map(str::to_string)
        .collect::<Vec<_>>();
    let summary = summarize_telemetry_lines(lines, 100);
    assert_eq!(summary.turn_completed, 1);
    assert_eq!(summary.step_started, 2);
    assert_eq!(summary.step_completed, 1);
    assert_eq!(summary.step_failed, 1);
    assert_eq!(summary.task_counts.get("Ghost"), Some(&1));
    assert!((summary.step_failure_rate() - 0.5).abs() < f64::EPSILON);
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[test]
fn runtime_config_uses_built_in_defaults() {
    let cfg = base_cfg();
    assert_eq!(cfg.model, DEFAULT_MODEL);
    assert_eq!(cfg.api_base, DEFAULT_API_BASE);
    assert_eq!(cfg.search_provider, SearchProvider::Tavily);
    assert_eq!(cfg.max_tool_rounds, 10);
    assert_eq!(cfg.max_search_rounds, 3);
    assert_eq!(cfg.max_requeues, 2);
    assert_eq!(cfg.render_width, 80);
    assert_eq!(cfg.render_padding, 6);
    assert!(!cfg.auto_approve);
    assert!(!cfg.telemetry_enabled);
}

#[test]
fn runtime_config_uses_selected_profile_values() {
    let dir = tempdir().expect("temp directory should create");
    let path = dir.path().join("config.toml");
    std::fs::write(
        &path,
        r#"
[profiles.dev]
model = "gpt-4o"
api_base = "http://localhost:8080/v1/"
search_provider = "wikipedia"
max_search_rounds = 5
max_requeues = 0
render_width = 100
auto_approve = true
"#,
    )
    .expect("config should write");

    let cli = test_cli(path.to_string_lossy().as_ref(), "dev");
    let profiles = load_profiles(&cli.config_path).expect("profiles should load");
    let cfg = resolve_runtime_config(&cli, &profiles).expect("runtime config should resolve");

    assert_eq!(cfg.profile, "dev");
    assert_eq!(cfg.model, "gpt-4o");
    assert_eq!(cfg.api_base, "http://localhost:8080/v1");
    assert_eq!(cfg.search_provider, SearchProvider::Wikipedia);
    assert_eq!(cfg.max_search_rounds, 5);
    assert_eq!(cfg.max_requeues, 0);
    assert_eq!(cfg.render_width, 100);
    assert!(cfg.auto_approve);
}

#[test]
fn runtime_config_cli_overrides_profile_values() {
    let dir = tempdir().expect("temp directory should create");
    let path = dir.path().join("config.toml");
    std::fs::write(
        &path,
        r#"
[profiles.dev]
model = "gpt-4o"
telemetry_enabled = true
telemetry_path = ".deepresearch/dev.jsonl"
"#,
    )
    .expect("config should write");

    let mut cli = test_cli(path.to_string_lossy().as_ref(), "dev");
    cli.model = Some("gpt-4.1-mini".to_string());
    cli.telemetry_enabled = Some(false);
    cli.telemetry_path = Some(".deepresearch/override.jsonl".to_string());

    let profiles = load_profiles(&cli.config_path).expect("profiles should load");
    let cfg = resolve_runtime_config(&cli, &profiles).expect("runtime config should resolve");

    assert_eq!(cfg.model, "gpt-4.1-mini");
    assert!(!cfg.telemetry_enabled);
    assert_eq!(cfg.telemetry_path, ".deepresearch/override.jsonl");
}

#[test]
fn runtime_config_reports_missing_profile() {
    let cli = test_cli("/definitely/missing/config.toml", "ops");
    let profiles = load_profiles(&cli.config_path).expect("missing config should default");
    let err = resolve_runtime_config(&cli, &profiles).expect_err("missing profile should fail");
    assert!(err.to_string().contains("profile 'ops' not found"));
}

#[test]
fn unknown_profile_fields_are_rejected() {
    let dir = tempdir().expect("temp directory should create");
    let path = dir.path().join("config.toml");
    std::fs::write(&path, "[profiles.dev]\nprovider = \"openai\"\n").expect("config should write");

    let err = load_profiles(path.to_string_lossy().as_ref())
        .expect_err("unknown field should fail");
    assert!(err.to_string().contains("invalid profile configuration"));
}
