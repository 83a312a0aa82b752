use std::sync::Arc;

use async_trait::async_trait;

use super::{ANALYZE_AGENT, Agent, SEARCH_AGENT, strip_code_fence, task_prompt};
use crate::config::DEFAULT_MAX_REQUEUES;
use crate::conversation::ConversationBuffer;
use crate::error::Result;
use crate::llm::Completion;
use crate::plan::{AgentResult, Context, Task};

pub const MISSING_INFO_PREFIX: &str = "MISSING_INFO:";
pub const SUPPLEMENTARY_SEARCH: &str = "supplementary search";

const ANALYZE_SYSTEM_PROMPT: &str =
    "You are an analysis assistant who synthesizes and analyzes information. Provide a clear, structured analysis.";

const MISSING_INFO_INSTRUCTION: &str = "\n\nIf the material above is not enough to complete the analysis, you may ask for more information. \
     To do so, reply only with 'MISSING_INFO: <specific search query>'. For example: 'MISSING_INFO: Tesla Q3 2024 earnings figures'";

/// Follow-up for a `MISSING_INFO:` reply: search first, then analyze again.
pub fn missing_info_follow_up(reply: &str, task: &Task) -> Option<Vec<Task>> {
    let query = reply.strip_prefix(MISSING_INFO_PREFIX)?.trim();
    Some(vec![
        Task::new(SEARCH_AGENT, SUPPLEMENTARY_SEARCH).with_parameter("query", query),
        task.requeued(),
    ])
}

pub struct AnalyzeAgent {
    completion: Arc<dyn Completion>,
    max_requeues: u32,
    buffer: ConversationBuffer,
}

impl AnalyzeAgent {
    pub fn new(completion: Arc<dyn Completion>) -> Self {
        Self {
            completion,
            max_requeues: DEFAULT_MAX_REQUEUES,
            buffer: ConversationBuffer::with_system(ANALYZE_SYSTEM_PROMPT),
        }
    }

    /// Caps how often one analysis may send itself back for more information.
    pub fn with_max_requeues(mut self, max_requeues: u32) -> Self {
        self.max_requeues = max_requeues;
        self
    }
}

#[async_trait]
impl Agent for AnalyzeAgent {
    fn name(&self) -> &str {
        ANALYZE_AGENT
    }

    fn description(&self) -> &str {
        "Analyzes and synthesizes the information gathered so far"
    }

    fn fresh(&self) -> Box<dyn Agent> {
        Box::new(AnalyzeAgent::new(self.completion.clone()).with_max_requeues(self.max_requeues))
    }

    async fn execute(&mut self, ctx: &Context, task: &Task) -> Result<AgentResult> {
        let may_request_more = task.attempt < self.max_requeues;
        let mut prompt = task_prompt(&ctx.input, &task.description, &ctx.references());
        if may_request_more {
            prompt.push_str(MISSING_INFO_INSTRUCTION);
        }
        self.buffer.push_user(prompt);

        let reply = self.completion.complete(&self.buffer.messages(), &[]).await?;
        self.buffer.push_assistant(reply.content.clone());

        let analysis = strip_code_fence(&reply.content);
        if may_request_more && let Some(follow_ups) = missing_info_follow_up(&analysis, task) {
            tracing::info!(
                attempt = task.attempt,
                query = ?follow_ups[0].query_parameter(),
                "analysis needs more information"
            );
            return Ok(AgentResult::follow_up(follow_ups));
        }

        Ok(AgentResult::output(analysis))
    }
}
