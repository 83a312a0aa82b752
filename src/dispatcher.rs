//! Cursor-driven plan execution.
//!
//! Runs the task at the cursor, records its output in place, splices any
//! follow-up tasks directly after it and advances. Failures are recorded per
//! step and never stop the run: a failed step keeps an empty output and the
//! cursor moves on.
use crate::agents::Agent;
use crate::agents::skill::SkillRuntime;
use crate::config::DEFAULT_MAX_REQUEUES;
use crate::error::{ResearchError, Result};
use crate::plan::{AgentResult, Context, Task};
use crate::registry::{Capability, CapabilityRegistry};

/// Progress callbacks. Every method defaults to a no-op.
pub trait DispatchObserver: Send + Sync {
    fn step_started(&self, _index: usize, _total: usize, _task: &Task) {}

    fn step_completed(&self, _index: usize, _task: &Task) {}

    fn step_failed(&self, _index: usize, _task: &Task, _error: &ResearchError) {}

    fn plan_extended(&self, _index: usize, _added: usize) {}
}

pub struct SilentObserver;

impl DispatchObserver for SilentObserver {}

#[derive(Debug)]
pub struct StepOutcome {
    pub index: usize,
    pub task: String,
    pub follow_ups: usize,
    pub error: Option<ResearchError>,
}

impl StepOutcome {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug, Default)]
pub struct DispatchReport {
    pub steps: Vec<StepOutcome>,
}

impl DispatchReport {
    pub fn failures(&self) -> impl Iterator<Item = &StepOutcome> {
        self.steps.iter().filter(|step| !step.succeeded())
    }

    pub fn failure_count(&self) -> usize {
        self.failures().count()
    }

    pub fn extended(&self) -> usize {
        self.steps.iter().map(|step| step.follow_ups).sum()
    }
}

pub struct Dispatcher<'a> {
    registry: &'a CapabilityRegistry,
    skills: SkillRuntime,
    max_requeues: u32,
}

impl<'a> Dispatcher<'a> {
    pub fn new(registry: &'a CapabilityRegistry, skills: SkillRuntime) -> Self {
        Self {
            registry,
            skills,
            max_requeues: DEFAULT_MAX_REQUEUES,
        }
    }

    pub fn with_max_requeues(mut self, max_requeues: u32) -> Self {
        self.max_requeues = max_requeues;
        self
    }

    /// Executes every pending task until the cursor reaches the end of the
    /// (possibly growing) task list.
    pub async fn run(&self, ctx: &mut Context, observer: &dyn DispatchObserver) -> DispatchReport {
        let mut report = DispatchReport::default();

        while let Some(task) = ctx.current().cloned() {
            let index = ctx.offset();
            observer.step_started(index, ctx.len(), &task);
            tracing::info!(step = index + 1, total = ctx.len(), task = %task.name, "step started");

            let mut outcome = StepOutcome {
                index,
                task: task.name.clone(),
                follow_ups: 0,
                error: None,
            };

            match self.execute_step(ctx, &task).await {
                Ok(result) => {
                    let AgentResult { output, tasks } = result;
                    if !tasks.is_empty() {
                        match self.check_requeue_limit(&task, &tasks) {
                            Ok(()) => {
                                outcome.follow_ups = ctx.splice_after_cursor(tasks);
                                observer.plan_extended(index, outcome.follow_ups);
                                tracing::info!(
                                    step = index + 1,
                                    added = outcome.follow_ups,
                                    "plan extended"
                                );
                            }
                            Err(err) => {
                                tracing::warn!(step = index + 1, error = %err, "follow-up tasks dropped");
                                observer.step_failed(index, &task, &err);
                                outcome.error = Some(err);
                            }
                        }
                    }
                    ctx.set_current_output(output);
                    if outcome.error.is_none()
                        && let Some(done) = ctx.current()
                    {
                        observer.step_completed(index, done);
                    }
                }
                Err(err) => {
                    tracing::warn!(step = index + 1, task = %task.name, error = %err, "step failed");
                    ctx.set_current_output(String::new());
                    observer.step_failed(index, &task, &err);
                    outcome.error = Some(err);
                }
            }

            report.steps.push(outcome);
            ctx.advance();
        }

        report
    }

    async fn execute_step(&self, ctx: &Context, task: &Task) -> Result<AgentResult> {
        let result = match self.registry.resolve(&task.name) {
            None => return Err(ResearchError::StepResolution(task.name.clone())),
            Some(Capability::Skill(skill)) => {
                let mut agent = self.skills.agent_for(skill);
                agent.execute(ctx, task).await
            }
            Some(Capability::SubAgent(mut agent)) => agent.execute(ctx, task).await,
        };

        result.map_err(|source| ResearchError::StepExecution {
            task: task.name.clone(),
            source: Box::new(source),
        })
    }

    /// A follow-up batch that would re-run `task` beyond the limit is refused.
    fn check_requeue_limit(&self, task: &Task, follow_ups: &[Task]) -> Result<()> {
        let over_limit = follow_ups
            .iter()
            .any(|next| next.name == task.name && next.attempt > self.max_requeues);
        if over_limit {
            return Err(ResearchError::RequeueLimit {
                task: task.name.clone(),
                limit: self.max_requeues,
            });
        }
        Ok(())
    }
}
