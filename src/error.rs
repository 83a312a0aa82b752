use thiserror::Error;

/// Failures raised by the orchestration core and its collaborators.
#[derive(Debug, Error)]
pub enum ResearchError {
    #[error("completion request failed: {0}")]
    Upstream(String),

    #[error("search failed: {0}")]
    Search(String),

    #[error("unknown tool server '{0}'")]
    UnknownServer(String),

    #[error("invalid tool name '{0}': expected server__tool")]
    InvalidToolName(String),

    #[error("tool '{tool}' failed: {message}")]
    ToolCall { tool: String, message: String },

    #[error("tool '{tool}' timed out after {secs}s")]
    ToolTimeout { tool: String, secs: u64 },

    #[error("plan unparsable: {message}; model replied: {content}")]
    PlanParse { message: String, content: String },

    #[error("no skill or sub-agent named '{0}' is registered")]
    StepResolution(String),

    #[error("step '{task}' failed: {source}")]
    StepExecution {
        task: String,
        #[source]
        source: Box<ResearchError>,
    },

    #[error("tool-call budget exhausted after {rounds} rounds")]
    ToolBudgetExceeded { rounds: usize },

    #[error("task '{task}' was re-queued more than {limit} times")]
    RequeueLimit { task: String, limit: u32 },

    #[error("failed to read input: {0}")]
    Input(String),

    #[error("skill error: {0}")]
    Skill(String),

    #[error("configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, ResearchError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Provider,
    Search,
    Tooling,
    Planning,
    Input,
    Internal,
}

impl ErrorCategory {
    pub fn code(self) -> &'static str {
        match self {
            ErrorCategory::Provider => "PROVIDER",
            ErrorCategory::Search => "SEARCH",
            ErrorCategory::Tooling => "TOOLING",
            ErrorCategory::Planning => "PLANNING",
            ErrorCategory::Input => "INPUT",
            ErrorCategory::Internal => "INTERNAL",
        }
    }

    pub fn hint(self) -> &'static str {
        match self {
            ErrorCategory::Provider => {
                "Check --api-base/--model and set OPENAI_API_KEY (or --api-key)."
            }
            ErrorCategory::Search => {
                "Set TAVILY_API_KEY or pick another --search-provider, then refine the request."
            }
            ErrorCategory::Tooling => {
                "Review mcp.json and retry with RUST_LOG=debug for detailed tool logs."
            }
            ErrorCategory::Planning => {
                "The model reply was not a valid plan. Rephrase the request and try again."
            }
            ErrorCategory::Input => "Run deepresearch --help and correct command arguments.",
            ErrorCategory::Internal => {
                "Retry with RUST_LOG=debug. If it persists, capture logs and open an issue."
            }
        }
    }
}

impl ResearchError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            ResearchError::Upstream(_) => ErrorCategory::Provider,
            ResearchError::Search(_) => ErrorCategory::Search,
            ResearchError::UnknownServer(_)
            | ResearchError::InvalidToolName(_)
            | ResearchError::ToolCall { .. }
            | ResearchError::ToolTimeout { .. }
            | ResearchError::ToolBudgetExceeded { .. }
            | ResearchError::Skill(_) => ErrorCategory::Tooling,
            ResearchError::PlanParse { .. }
            | ResearchError::StepResolution(_)
            | ResearchError::RequeueLimit { .. } => ErrorCategory::Planning,
            ResearchError::StepExecution { source, .. } => source.category(),
            ResearchError::Input(_) | ResearchError::Config(_) => ErrorCategory::Input,
        }
    }
}

pub fn categorize_error(err: &anyhow::Error) -> ErrorCategory {
    if let Some(research) = err.chain().find_map(|e| e.downcast_ref::<ResearchError>()) {
        return research.category();
    }

    let msg = format!("{err:#}").to_ascii_lowercase();

    if msg.contains("api_key") || msg.contains("api key") || msg.contains("completion") {
        return ErrorCategory::Provider;
    }

    if msg.contains("invalid value")
        || msg.contains("unknown argument")
        || msg.contains("failed to read input")
        || msg.contains("profile")
    {
        return ErrorCategory::Input;
    }

    if msg.contains("search") || msg.contains("tavily") {
        return ErrorCategory::Search;
    }

    if msg.contains("tool") || msg.contains("mcp") || msg.contains("skill") {
        return ErrorCategory::Tooling;
    }

    ErrorCategory::Internal
}

pub fn format_cli_error(err: &anyhow::Error, show_sensitive_config: bool) -> String {
    let category = categorize_error(err);
    let rendered_error = render_error_message(err, show_sensitive_config);
    format!(
        "[{}] {}\nHint: {}",
        category.code(),
        rendered_error,
        category.hint()
    )
}

/// One-line diagnostic for errors surfaced inside a session turn.
pub fn format_turn_error(err: &ResearchError) -> String {
    let rendered = redact_sensitive_text(&err.to_string());
    let single_line = rendered.lines().collect::<Vec<_>>().join(" ");
    format!("[{}] {}", err.category().code(), single_line)
}

pub fn render_error_message(err: &anyhow::Error, show_sensitive_config: bool) -> String {
    if show_sensitive_config {
        format!("{err:#}")
    } else {
        redact_sensitive_text(&format!("{err:#}"))
    }
}

const SECRET_PREFIXES: &[&str] = &["sk-", "tvly-", "Bearer "];

pub fn redact_sensitive_text(text: &str) -> String {
    let mut redacted = text.to_string();
    for prefix in SECRET_PREFIXES {
        redacted = redact_prefixed_tokens(&redacted, prefix);
    }
    redacted
}

/// Replaces every token that starts with `prefix` up to the next delimiter.
pub fn redact_prefixed_tokens(text: &str, prefix: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut cursor = 0usize;

    while let Some(offset) = text[cursor..].find(prefix) {
        let start = cursor + offset;
        out.push_str(&text[cursor..start]);

        let value_start = start + prefix.len();
        let mid_word = text[..start]
            .chars()
            .next_back()
            .is_some_and(|ch| ch.is_alphanumeric());
        if mid_word {
            out.push_str(prefix);
            cursor = value_start;
            continue;
        }

        let remainder = &text[value_start..];
        let end = remainder
            .find(|ch: char| {
                ch.is_whitespace()
                    || matches!(
                        ch,
                        '"' | '\'' | '(' | ')' | '[' | ']' | '{' | '}' | ',' | ';'
                    )
            })
            .unwrap_or(remainder.len());
        out.push_str(prefix);
        out.push_str("[REDACTED]");
        cursor = value_start + end;
    }

    out.push_str(&text[cursor..]);
    out
}
