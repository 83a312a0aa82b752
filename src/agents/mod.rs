//! Research agents.
//!
//! Every agent exposes the same `execute(context, task)` entry point:
//!
//! - `planning`: turns a request into a confirmed plan (human in the loop)
//! - `search`: reflective web search, bounded refine rounds
//! - `analyze`: synthesis; may ask for more information via follow-up tasks
//! - `report`: Markdown report from completed task outputs
//! - `render`: terminal rendering of the latest report, no model call
//! - `skill`: tool-calling loop that executes a loaded skill

pub mod analyze;
pub mod planning;
pub mod render;
pub mod report;
pub mod search;
pub mod skill;

use async_trait::async_trait;

use crate::error::Result;
use crate::plan::{AgentResult, Context, Task};

pub const SEARCH_AGENT: &str = "SearchSubAgent";
pub const ANALYZE_AGENT: &str = "AnalyzeSubAgent";
pub const REPORT_AGENT: &str = "ReportSubAgent";
pub const RENDER_AGENT: &str = "RenderSubAgent";
pub const PLANNING_AGENT: &str = "PlanningAgent";

#[async_trait]
pub trait Agent: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// A new instance sharing configuration but with an empty conversation.
    fn fresh(&self) -> Box<dyn Agent>;

    async fn execute(&mut self, ctx: &Context, task: &Task) -> Result<AgentResult>;
}

/// Removes a leading code fence (optionally tagged) and a trailing fence,
/// then trims. Text without fences is only trimmed.
///
/// A trailing fence is only removed when it closes the leading one or has no
/// opening partner, so a reply ending in its own code block stays intact.
pub fn strip_code_fence(text: &str) -> String {
    let mut body = text.trim();
    let mut opened = false;

    if let Some(rest) = body.strip_prefix("```") {
        opened = true;
        body = match rest.split_once('\n') {
            Some((tag, tail)) if is_fence_tag(tag) => tail,
            None if is_fence_tag(rest) => "",
            _ => rest,
        };
    }

    if let Some(head) = body.trim_end().strip_suffix("```") {
        let unmatched = body.matches("```").count() % 2 == 1;
        if opened || unmatched {
            body = head;
        }
    }

    body.trim().to_string()
}

fn is_fence_tag(tag: &str) -> bool {
    tag.trim()
        .chars()
        .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '+'))
}

/// User turn shared by the specialist agents: request, goal, prior outputs.
pub fn task_prompt(request: &str, goal: &str, references: &str) -> String {
    format!(
        "Key user instruction/request: {request}\nCurrent task goal: {goal}\n\nReference material from completed tasks:\n{references}"
    )
}
