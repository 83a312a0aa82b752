//! Skill execution: a bounded tool-calling loop.
//!
//! The skill's instructions become the system message. Each round offers the
//! transport's tools to the model; tool calls are executed in order and their
//! results appended, and a reply without tool calls ends the loop.
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};

use super::{Agent, strip_code_fence, task_prompt};
use crate::config::DEFAULT_MAX_TOOL_ROUNDS;
use crate::conversation::{ConversationBuffer, ToolCallRequest};
use crate::error::{ResearchError, Result};
use crate::llm::Completion;
use crate::mcp::ToolTransport;
use crate::plan::{AgentResult, Context, Task};
use crate::skills::SkillDefinition;

/// Shared collaborators for every skill invocation in a session.
#[derive(Clone)]
pub struct SkillRuntime {
    pub completion: Arc<dyn Completion>,
    pub tools: Arc<dyn ToolTransport>,
    pub max_rounds: usize,
}

impl SkillRuntime {
    pub fn new(completion: Arc<dyn Completion>, tools: Arc<dyn ToolTransport>) -> Self {
        Self {
            completion,
            tools,
            max_rounds: DEFAULT_MAX_TOOL_ROUNDS,
        }
    }

    pub fn with_max_rounds(mut self, max_rounds: usize) -> Self {
        self.max_rounds = max_rounds.max(1);
        self
    }

    /// A tool-calling agent with an empty conversation for `skill`.
    pub fn agent_for(&self, skill: &SkillDefinition) -> ToolCallingAgent {
        ToolCallingAgent::new(skill.clone(), self.clone())
    }
}

pub fn skill_system_prompt(skill: &SkillDefinition) -> String {
    format!(
        "{}\n\n## Skill context:\nSkill root directory: {}",
        skill.instructions,
        skill.root.display()
    )
}

/// Empty or blank arguments mean "no arguments".
pub fn parse_tool_arguments(raw: &str) -> std::result::Result<Map<String, Value>, String> {
    if raw.trim().is_empty() {
        return Ok(Map::new());
    }
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(format!(
            "tool arguments must be a JSON object, got: {other}"
        )),
        Err(e) => Err(format!("invalid tool arguments: {e}")),
    }
}

pub struct ToolCallingAgent {
    skill: SkillDefinition,
    runtime: SkillRuntime,
    buffer: ConversationBuffer,
}

impl ToolCallingAgent {
    pub fn new(skill: SkillDefinition, runtime: SkillRuntime) -> Self {
        let buffer = ConversationBuffer::with_system(skill_system_prompt(&skill));
        Self {
            skill,
            runtime,
            buffer,
        }
    }

    pub fn buffer(&self) -> &ConversationBuffer {
        &self.buffer
    }

    async fn run_tool_call(&self, call: &ToolCallRequest) -> String {
        let args = match parse_tool_arguments(&call.arguments) {
            Ok(args) => args,
            Err(message) => {
                tracing::warn!(tool = %call.name, error = %message, "tool call skipped");
                return message;
            }
        };

        tracing::debug!(tool = %call.name, "calling tool");
        match self.runtime.tools.call_tool(&call.name, args).await {
            Ok(value) => value.to_string(),
            Err(err) => {
                tracing::warn!(tool = %call.name, error = %err, "tool call failed");
                format!("tool error: {err}")
            }
        }
    }
}

#[async_trait]
impl Agent for ToolCallingAgent {
    fn name(&self) -> &str {
        self.skill.name()
    }

    fn description(&self) -> &str {
        self.skill.description()
    }

    fn fresh(&self) -> Box<dyn Agent> {
        Box::new(ToolCallingAgent::new(self.skill.clone(), self.runtime.clone()))
    }

    async fn execute(&mut self, ctx: &Context, task: &Task) -> Result<AgentResult> {
        self.buffer
            .push_user(task_prompt(&ctx.input, &task.description, &ctx.references()));

        for round in 1..=self.runtime.max_rounds {
            let tools = self.runtime.tools.list_tools().await?;
            let reply = self
                .runtime
                .completion
                .complete(&self.buffer.messages(), &tools)
                .await?;
            self.buffer.push(reply.to_message());

            if reply.tool_calls.is_empty() {
                tracing::info!(skill = %self.skill.name(), round, "skill finished");
                return Ok(AgentResult::output(strip_code_fence(&reply.content)));
            }

            for call in &reply.tool_calls {
                let content = self.run_tool_call(call).await;
                self.buffer.push_tool_result(call.id.clone(), content);
            }
        }

        Err(ResearchError::ToolBudgetExceeded {
            rounds: self.runtime.max_rounds,
        })
    }
}
