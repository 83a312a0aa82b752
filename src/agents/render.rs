use async_trait::async_trait;

use super::{Agent, RENDER_AGENT, REPORT_AGENT};
use crate::error::Result;
use crate::markdown::{DEFAULT_PADDING, DEFAULT_WIDTH, render_markdown};
use crate::plan::{AgentResult, Context, Task};

/// Renders the most recent report for the terminal. Makes no model call.
pub struct RenderAgent {
    width: usize,
    padding: usize,
}

impl Default for RenderAgent {
    fn default() -> Self {
        Self::new(DEFAULT_WIDTH, DEFAULT_PADDING)
    }
}

impl RenderAgent {
    pub fn new(width: usize, padding: usize) -> Self {
        Self { width, padding }
    }
}

#[async_trait]
impl Agent for RenderAgent {
    fn name(&self) -> &str {
        RENDER_AGENT
    }

    fn description(&self) -> &str {
        "Renders the latest Markdown report as formatted terminal text"
    }

    fn fresh(&self) -> Box<dyn Agent> {
        Box::new(RenderAgent::new(self.width, self.padding))
    }

    async fn execute(&mut self, ctx: &Context, _task: &Task) -> Result<AgentResult> {
        let Some(report) = ctx.latest_output_of(REPORT_AGENT) else {
            tracing::warn!("no completed report to render");
            return Ok(AgentResult::output(String::new()));
        };
        Ok(AgentResult::output(render_markdown(
            &report.output,
            self.width,
            self.padding,
        )))
    }
}
