//! Plan, confirm, replan.
//!
//! The planner asks the model for a `{output, tasks}` plan, shows it to the
//! human and either accepts it or feeds the human's reply back as a new user
//! turn. The loop has no round bound: only the human ends it.
use std::sync::Arc;

use async_trait::async_trait;

use super::{Agent, PLANNING_AGENT, strip_code_fence};
use crate::conversation::ConversationBuffer;
use crate::error::{ResearchError, Result};
use crate::input::HumanInput;
use crate::llm::Completion;
use crate::plan::{AgentResult, Context, Task};
use crate::registry::CapabilityRegistry;

/// Replies that accept a proposed plan. Matched exactly.
pub const CONFIRM_TOKENS: [&str; 3] = ["继续", "y", "yes"];

const PLANNING_SYSTEM_PROMPT: &str = r#"You are the main orchestrator agent. Your job: parse the user request, plan the work as a sequence of tasks, choose an execution unit for every task, and return a structured plan.

You can delegate to two kinds of execution units:
1. **Skill**: an internal capability for lightweight, self-contained work.
2. **SubAgent**: an independent specialist for complex or domain-specific work.

## Available skills:
{skills}
## Available sub-agents:
{agents}
## For a request that needs planning, create a plan whose tasks each contain:
- name: the name of exactly one skill or sub-agent listed above
- description: what that skill or sub-agent should do
- parameters: optional task parameters (for example {"query": "search terms"})

## Reply with a single valid JSON object of this shape and nothing else:
{
  "output": "overall plan summary",
  "tasks": [
    {"name": "SearchSubAgent", "description": "...", "parameters": {"query": "..."}},
    {"name": "AnalyzeSubAgent", "description": "..."},
    {"name": "ReportSubAgent", "description": "..."},
    {"name": "RenderSubAgent", "description": "render the report"}
  ]
}

## Rules:
- Always follow a ReportSubAgent task with a RenderSubAgent task so the final answer is rendered text.
- If the request needs no planning (greetings, small talk, a direct factual reply), put the reply in "output" and return an empty "tasks" list.
- Keep plans short and focused; 3 to 8 tasks is usually enough."#;

pub fn planning_system_prompt(registry: &CapabilityRegistry) -> String {
    let skills = registry.skills_catalogue();
    let agents = registry.agents_catalogue();
    PLANNING_SYSTEM_PROMPT
        .replace("{skills}", if skills.is_empty() { "(none)\n" } else { &skills })
        .replace("{agents}", if agents.is_empty() { "(none)\n" } else { &agents })
}

pub fn is_confirmation(reply: &str) -> bool {
    CONFIRM_TOKENS.contains(&reply)
}

/// Numbered plan listing followed by the confirmation question.
pub fn format_plan_proposal(plan: &AgentResult) -> String {
    let mut out = String::from("Proposed plan:\n");
    if !plan.output.trim().is_empty() {
        out.push_str(&format!("{}\n", plan.output.trim()));
    }
    for (index, task) in plan.tasks.iter().enumerate() {
        out.push_str(&format!(" {}. [{}] {}\n", index + 1, task.name, task.description));
    }
    out.push_str(&format!(
        "\nAccept this plan? Reply {} to run it, or describe what to change.\n> ",
        CONFIRM_TOKENS.join("/")
    ));
    out
}

pub struct PlanningAgent {
    completion: Arc<dyn Completion>,
    input: Arc<dyn HumanInput>,
    system_prompt: String,
    buffer: ConversationBuffer,
    auto_approve: bool,
}

impl PlanningAgent {
    pub fn new(
        completion: Arc<dyn Completion>,
        input: Arc<dyn HumanInput>,
        registry: &CapabilityRegistry,
    ) -> Self {
        Self::with_system_prompt(completion, input, planning_system_prompt(registry))
    }

    fn with_system_prompt(
        completion: Arc<dyn Completion>,
        input: Arc<dyn HumanInput>,
        system_prompt: String,
    ) -> Self {
        Self {
            completion,
            input,
            buffer: ConversationBuffer::with_system(system_prompt.clone()),
            system_prompt,
            auto_approve: false,
        }
    }

    /// Accept the first non-empty plan without asking.
    pub fn auto_approve(mut self, enabled: bool) -> Self {
        self.auto_approve = enabled;
        self
    }

    pub fn buffer(&self) -> &ConversationBuffer {
        &self.buffer
    }

    /// One model call over the current buffer, parsed as a plan.
    pub async fn plan(&mut self) -> Result<AgentResult> {
        let reply = self
            .completion
            .complete(&self.buffer.messages(), &[])
            .await?;
        self.buffer.push_assistant(reply.content.clone());

        let content = strip_code_fence(&reply.content);
        serde_json::from_str::<AgentResult>(&content).map_err(|e| ResearchError::PlanParse {
            message: e.to_string(),
            content,
        })
    }

    /// Runs the confirm/replan loop for `request` until the human accepts a
    /// plan or the model answers directly.
    pub async fn run(&mut self, request: &str) -> Result<AgentResult> {
        self.buffer.push_user(request);

        let mut round = 0usize;
        loop {
            round += 1;
            let proposal = self.plan().await?;
            if proposal.is_direct_reply() {
                tracing::info!(round, "planner answered directly");
                return Ok(proposal);
            }

            tracing::info!(round, tasks = proposal.tasks.len(), "plan proposed");
            if self.auto_approve {
                return Ok(proposal);
            }

            let reply = self.input.read_line(&format_plan_proposal(&proposal))?;
            if is_confirmation(&reply) {
                tracing::info!(round, "plan accepted");
                return Ok(proposal);
            }

            tracing::debug!(round, feedback = %reply, "replanning with feedback");
            self.buffer.push_user(reply);
        }
    }
}

#[async_trait]
impl Agent for PlanningAgent {
    fn name(&self) -> &str {
        PLANNING_AGENT
    }

    fn description(&self) -> &str {
        "Plans a request as a sequence of sub-tasks"
    }

    fn fresh(&self) -> Box<dyn Agent> {
        Box::new(
            Self::with_system_prompt(
                self.completion.clone(),
                self.input.clone(),
                self.system_prompt.clone(),
            )
            .auto_approve(self.auto_approve),
        )
    }

    async fn execute(&mut self, ctx: &Context, _task: &Task) -> Result<AgentResult> {
        self.run(&ctx.input).await
    }
}
