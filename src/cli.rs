use clap::{Parser, Subcommand, ValueEnum};
use serde::Deserialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchProvider {
    Tavily,
    Duckduckgo,
    Wikipedia,
}

impl SearchProvider {
    pub fn label(self) -> &'static str {
        match self {
            SearchProvider::Tavily => "tavily",
            SearchProvider::Duckduckgo => "duckduckgo",
            SearchProvider::Wikipedia => "wikipedia",
        }
    }
}

#[derive(Debug, Subcommand)]
pub enum SkillCommands {
    #[command(about = "List skills loaded from the skills directory")]
    List,
}

#[derive(Debug, Subcommand)]
pub enum McpCommands {
    #[command(about = "List MCP servers declared in the MCP config file")]
    List,
    #[command(about = "Connect to configured servers and list their qualified tool names")]
    Tools,
}

#[derive(Debug, Subcommand)]
pub enum TelemetryCommands {
    #[command(about = "Summarize telemetry events from a JSONL stream")]
    Report {
        #[arg(long)]
        path: Option<String>,
        #[arg(long, default_value_t = 5000)]
        limit: usize,
    },
}

const CLI_EXAMPLES: &str = "Examples:\n\
  deepresearch\n\
  deepresearch ask \"Compare solid-state battery roadmaps of the top three EV makers\"\n\
  deepresearch --model gpt-4o --api-base https://api.openai.com/v1 chat\n\
  deepresearch --search-provider wikipedia ask \"History of the Rust borrow checker\"\n\
  deepresearch --skills-dir ./skills skills list\n\
  deepresearch --mcp-config ./mcp.json mcp tools\n\
  deepresearch --auto-approve --telemetry-enabled true ask \"Summarize RISC-V adoption in 2025\"\n\
  deepresearch telemetry report --limit 2000\n\
\n\
Session behavior:\n\
  - Each request is planned first; reply 继续, y or yes to run the plan, anything else to refine it.\n\
  - In chat, use /help, /clear, /exit or /quit.";

#[derive(Debug, Parser)]
#[command(name = "deepresearch")]
#[command(about = "Conversational deep-research assistant with plan, confirm and dispatch loop")]
#[command(after_long_help = CLI_EXAMPLES)]
pub struct Cli {
    #[arg(long, env = "DEEPRESEARCH_MODEL")]
    pub model: Option<String>,

    #[arg(long, env = "DEEPRESEARCH_API_BASE")]
    pub api_base: Option<String>,

    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    #[arg(long, env = "TAVILY_API_KEY", hide_env_values = true)]
    pub tavily_api_key: Option<String>,

    #[arg(long, env = "DEEPRESEARCH_SEARCH_PROVIDER", value_enum)]
    pub search_provider: Option<SearchProvider>,

    #[arg(long, env = "DEEPRESEARCH_SKILLS_DIR")]
    pub skills_dir: Option<String>,

    #[arg(long, env = "DEEPRESEARCH_MCP_CONFIG")]
    pub mcp_config: Option<String>,

    #[arg(long, env = "DEEPRESEARCH_PROFILE", default_value = "default")]
    pub profile: String,

    #[arg(long, env = "DEEPRESEARCH_CONFIG", default_value = ".deepresearch/config.toml")]
    pub config_path: String,

    #[arg(long, env = "DEEPRESEARCH_TOOL_TIMEOUT_SECS")]
    pub tool_timeout_secs: Option<u64>,

    #[arg(long, env = "DEEPRESEARCH_MAX_TOOL_ROUNDS")]
    pub max_tool_rounds: Option<usize>,

    #[arg(long, env = "DEEPRESEARCH_MAX_SEARCH_ROUNDS")]
    pub max_search_rounds: Option<usize>,

    #[arg(long, env = "DEEPRESEARCH_MAX_REQUEUES")]
    pub max_requeues: Option<u32>,

    #[arg(long, env = "DEEPRESEARCH_RENDER_WIDTH")]
    pub render_width: Option<usize>,

    #[arg(long, env = "DEEPRESEARCH_RENDER_PADDING")]
    pub render_padding: Option<usize>,

    #[arg(long, env = "DEEPRESEARCH_AUTO_APPROVE", default_value_t = false)]
    pub auto_approve: bool,

    #[arg(long, short = 'v', env = "DEEPRESEARCH_VERBOSE", default_value_t = false)]
    pub verbose: bool,

    #[arg(long, env = "DEEPRESEARCH_SHOW_SENSITIVE_CONFIG", default_value_t = false)]
    pub show_sensitive_config: bool,

    #[arg(long, env = "DEEPRESEARCH_TELEMETRY_ENABLED", action = clap::ArgAction::Set)]
    pub telemetry_enabled: Option<bool>,

    #[arg(long, env = "DEEPRESEARCH_TELEMETRY_PATH")]
    pub telemetry_path: Option<String>,

    #[arg(long, env = "RUST_LOG")]
    pub log_filter: Option<String>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    #[command(about = "Run a single research turn and print the deliverable")]
    Ask {
        #[arg(required = true)]
        prompt: Vec<String>,
    },
    #[command(about = "Run the interactive research session (default)")]
    Chat,
    #[command(about = "Inspect the skill catalogue")]
    Skills {
        #[command(subcommand)]
        command: SkillCommands,
    },
    #[command(about = "Inspect MCP tool servers")]
    Mcp {
        #[command(subcommand)]
        command: McpCommands,
    },
    #[command(about = "Telemetry utilities and reporting")]
    Telemetry {
        #[command(subcommand)]
        command: TelemetryCommands,
    },
}

pub fn command_label(command: &Commands) -> String {
    match command {
        Commands::Ask { .. } => "ask".to_string(),
        Commands::Chat => "chat".to_string(),
        Commands::Skills { command } => match command {
            SkillCommands::List => "skills.list".to_string(),
        },
        Commands::Mcp { command } => match command {
            McpCommands::List => "mcp.list".to_string(),
            McpCommands::Tools => "mcp.tools".to_string(),
        },
        Commands::Telemetry { command } => match command {
            TelemetryCommands::Report { .. } => "telemetry.report".to_string(),
        },
    }
}
