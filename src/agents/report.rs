use std::sync::Arc;

use async_trait::async_trait;

use super::{Agent, REPORT_AGENT, strip_code_fence, task_prompt};
use crate::conversation::ConversationBuffer;
use crate::error::Result;
use crate::llm::Completion;
use crate::plan::{AgentResult, Context, Task};

const REPORT_SYSTEM_PROMPT: &str = "You are a report writing assistant. You produce well formatted, clear and comprehensive reports in Markdown.\n\
Use headings, lists and emphasis so the report is easy to read.\n\
If the material includes images with URLs and descriptions, pick the most relevant ones and embed them with standard Markdown image syntax \"![description](URL)\" next to the related text.";

pub struct ReportAgent {
    completion: Arc<dyn Completion>,
    buffer: ConversationBuffer,
}

impl ReportAgent {
    pub fn new(completion: Arc<dyn Completion>) -> Self {
        Self {
            completion,
            buffer: ConversationBuffer::with_system(REPORT_SYSTEM_PROMPT),
        }
    }
}

#[async_trait]
impl Agent for ReportAgent {
    fn name(&self) -> &str {
        REPORT_AGENT
    }

    fn description(&self) -> &str {
        "Writes a Markdown report from the gathered and analyzed information"
    }

    fn fresh(&self) -> Box<dyn Agent> {
        Box::new(ReportAgent::new(self.completion.clone()))
    }

    async fn execute(&mut self, ctx: &Context, task: &Task) -> Result<AgentResult> {
        self.buffer
            .push_user(task_prompt(&ctx.input, &task.description, &ctx.references()));

        let reply = self.completion.complete(&self.buffer.messages(), &[]).await?;
        self.buffer.push_assistant(reply.content.clone());

        let report = strip_code_fence(&reply.content);
        tracing::info!(chars = report.len(), "report written");
        Ok(AgentResult::output(report))
    }
}
