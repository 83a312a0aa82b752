//! Task, plan and result model shared by the planner, the dispatcher and
//! every agent.
//!
//! The plan doubles as the execution log: completed tasks keep their output in
//! place and the cursor (`offset`) separates what has run from what is pending.
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

/// A named unit of work resolved against the capability registry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub name: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub description: String,
    #[serde(
        default,
        deserialize_with = "null_as_default",
        skip_serializing_if = "Map::is_empty"
    )]
    pub parameters: Map<String, Value>,
    #[serde(
        default,
        deserialize_with = "null_as_default",
        skip_serializing_if = "String::is_empty"
    )]
    pub output: String,
    /// How many times this task has been re-queued by a follow-up.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub attempt: u32,
}

impl Task {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            ..Self::default()
        }
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    /// The `query` parameter when it is a string.
    pub fn query_parameter(&self) -> Option<&str> {
        self.parameters.get("query").and_then(Value::as_str)
    }

    /// A pending copy of this task for re-execution after a follow-up.
    pub fn requeued(&self) -> Self {
        Self {
            name: self.name.clone(),
            description: self.description.clone(),
            parameters: self.parameters.clone(),
            output: String::new(),
            attempt: self.attempt + 1,
        }
    }
}

fn is_zero(value: &u32) -> bool {
    *value == 0
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

// ---------------------------------------------------------------------------
// Result
// ---------------------------------------------------------------------------

/// What an agent hands back to its caller: follow-up tasks, output, or both.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentResult {
    #[serde(default, deserialize_with = "null_as_default")]
    pub output: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub tasks: Vec<Task>,
}

impl AgentResult {
    pub fn output(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            tasks: Vec::new(),
        }
    }

    pub fn follow_up(tasks: Vec<Task>) -> Self {
        Self {
            output: String::new(),
            tasks,
        }
    }

    /// A planner reply with no tasks is a direct answer.
    pub fn is_direct_reply(&self) -> bool {
        self.tasks.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Context (plan + cursor)
// ---------------------------------------------------------------------------

pub const REFERENCE_SEPARATOR: &str = "\n\n";

/// The session's working state for one turn.
///
/// `offset` is only moved through [`Context::advance`] and the loaders, which
/// keeps `0 <= offset <= tasks.len()`.
#[derive(Debug, Clone, Default)]
pub struct Context {
    pub input: String,
    pub tasks: Vec<Task>,
    pub plans: String,
    offset: usize,
}

impl Context {
    pub fn new(input: impl Into<String>) -> Self {
        Self {
            input: input.into(),
            ..Self::default()
        }
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn is_finished(&self) -> bool {
        self.offset >= self.tasks.len()
    }

    pub fn current(&self) -> Option<&Task> {
        self.tasks.get(self.offset)
    }

    /// Replaces the task list with an accepted plan and rewinds the cursor.
    pub fn load_plan(&mut self, plan: AgentResult) {
        self.tasks = plan.tasks;
        self.plans = plan.output;
        self.offset = 0;
    }

    /// Starts a new turn: keeps nothing from the previous plan.
    pub fn begin_turn(&mut self, input: impl Into<String>) {
        self.input = input.into();
        self.tasks.clear();
        self.plans.clear();
        self.offset = 0;
    }

    pub fn clear(&mut self) {
        self.begin_turn(String::new());
    }

    pub fn advance(&mut self) {
        self.offset = (self.offset + 1).min(self.tasks.len());
    }

    /// Inserts `follow_ups` right after the cursor, ahead of anything already
    /// queued. Returns the number of inserted tasks.
    pub fn splice_after_cursor(&mut self, follow_ups: Vec<Task>) -> usize {
        let inserted = follow_ups.len();
        let at = (self.offset + 1).min(self.tasks.len());
        self.tasks.splice(at..at, follow_ups);
        inserted
    }

    pub fn set_current_output(&mut self, output: String) {
        if let Some(task) = self.tasks.get_mut(self.offset) {
            task.output = output;
        }
    }

    /// Completed tasks (index below the cursor) that produced output.
    pub fn completed_with_output(&self) -> impl Iterator<Item = &Task> {
        self.tasks[..self.offset.min(self.tasks.len())]
            .iter()
            .filter(|task| !task.output.is_empty())
    }

    /// Labelled outputs of every completed task, oldest first.
    pub fn references(&self) -> String {
        self.completed_with_output()
            .map(|task| format!("Output from {} task:\n{}", task.name, task.output))
            .collect::<Vec<_>>()
            .join(REFERENCE_SEPARATOR)
    }

    /// Most recent completed task named `name` with non-empty output.
    pub fn latest_output_of(&self, name: &str) -> Option<&Task> {
        self.completed_with_output()
            .filter(|task| task.name == name)
            .last()
    }

    /// Output of the last task in the plan.
    pub fn deliverable(&self) -> Option<&str> {
        self.tasks.last().map(|task| task.output.as_str())
    }
}
