//! Search agent - reflective web search.
//!
//! Each round searches, appends the results to the accumulated output and
//! asks the model whether the material is sufficient. Anything other than the
//! sufficiency token is taken as the next, refined query. Output is only ever
//! appended to: once a round has produced results, a later failure ends the
//! loop with what was gathered instead of failing the step.
use std::sync::Arc;

use async_trait::async_trait;

use super::{Agent, SEARCH_AGENT, strip_code_fence};
use crate::config::DEFAULT_MAX_SEARCH_ROUNDS;
use crate::conversation::ConversationBuffer;
use crate::error::Result;
use crate::llm::Completion;
use crate::plan::{AgentResult, Context, Task};
use crate::search::Search;

pub const SUFFICIENT_TOKEN: &str = "SUFFICIENT";
pub const RESULTS_SEPARATOR: &str = "\n\n--- Additional Search Results ---\n";

const SEARCH_SYSTEM_PROMPT: &str =
    "You are a search refinement assistant. You judge search results and decide whether more information is needed.";

fn reflection_prompt(query: &str, results: &str) -> String {
    format!(
        "User query: {query}\nCurrent search results:\n{results}\n\n\
         Is this information enough to answer the user's query?\n\
         If yes, reply with exactly \"{SUFFICIENT_TOKEN}\".\n\
         If not, reply with one new, more specific search query that targets the missing information. Add no other text.\n"
    )
}

pub fn is_sufficient(verdict: &str) -> bool {
    verdict.to_uppercase().contains(SUFFICIENT_TOKEN)
}

pub struct SearchAgent {
    completion: Arc<dyn Completion>,
    search: Arc<dyn Search>,
    max_rounds: usize,
    buffer: ConversationBuffer,
}

impl SearchAgent {
    pub fn new(completion: Arc<dyn Completion>, search: Arc<dyn Search>) -> Self {
        Self {
            completion,
            search,
            max_rounds: DEFAULT_MAX_SEARCH_ROUNDS,
            buffer: ConversationBuffer::with_system(SEARCH_SYSTEM_PROMPT),
        }
    }

    pub fn with_max_rounds(mut self, max_rounds: usize) -> Self {
        self.max_rounds = max_rounds.max(1);
        self
    }
}

#[async_trait]
impl Agent for SearchAgent {
    fn name(&self) -> &str {
        SEARCH_AGENT
    }

    fn description(&self) -> &str {
        "Runs web searches to gather information"
    }

    fn fresh(&self) -> Box<dyn Agent> {
        Box::new(
            SearchAgent::new(self.completion.clone(), self.search.clone())
                .with_max_rounds(self.max_rounds),
        )
    }

    async fn execute(&mut self, _ctx: &Context, task: &Task) -> Result<AgentResult> {
        let mut query = task
            .query_parameter()
            .unwrap_or(&task.description)
            .to_string();
        let mut output = String::new();

        for round in 1..=self.max_rounds {
            tracing::info!(round, query = %query, provider = self.search.provider_name(), "searching");
            let results = match self.search.query(&query).await {
                Ok(results) => results,
                Err(err) if output.is_empty() => return Err(err),
                Err(err) => {
                    tracing::warn!(round, error = %err, "search failed; keeping earlier results");
                    break;
                }
            };

            if !output.is_empty() {
                output.push_str(RESULTS_SEPARATOR);
            }
            output.push_str(&results);

            self.buffer.push_user(reflection_prompt(&query, &results));
            let reply = match self.completion.complete(&self.buffer.messages(), &[]).await {
                Ok(reply) => reply,
                Err(err) => {
                    tracing::warn!(round, error = %err, "sufficiency check failed; keeping results");
                    break;
                }
            };
            self.buffer.push_assistant(reply.content.clone());

            let verdict = strip_code_fence(&reply.content);
            if is_sufficient(&verdict) {
                tracing::info!(round, "search judged sufficient");
                break;
            }
            if !verdict.is_empty() {
                query = verdict;
            }
        }

        Ok(AgentResult::output(output))
    }
}
