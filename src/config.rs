use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::cli::*;

pub const DEFAULT_MODEL: &str = "gpt-4o-mini";
pub const DEFAULT_API_BASE: &str = "https://api.openai.com/v1";
pub const DEFAULT_MAX_TOOL_ROUNDS: usize = 10;
pub const DEFAULT_MAX_SEARCH_ROUNDS: usize = 3;
pub const DEFAULT_MAX_REQUEUES: u32 = 2;

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub profile: String,
    pub config_path: String,
    pub model: String,
    pub api_base: String,
    pub api_key: Option<String>,
    pub tavily_api_key: Option<String>,
    pub search_provider: SearchProvider,
    pub skills_dir: String,
    pub mcp_config_path: String,
    pub tool_timeout_secs: u64,
    pub max_tool_rounds: usize,
    pub max_search_rounds: usize,
    pub max_requeues: u32,
    pub render_width: usize,
    pub render_padding: usize,
    pub auto_approve: bool,
    pub verbose: bool,
    pub show_sensitive_config: bool,
    pub telemetry_enabled: bool,
    pub telemetry_path: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProfilesFile {
    #[serde(default)]
    pub profiles: HashMap<String, ProfileConfig>,
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProfileConfig {
    pub model: Option<String>,
    pub api_base: Option<String>,
    pub search_provider: Option<SearchProvider>,
    pub skills_dir: Option<String>,
    pub mcp_config: Option<String>,
    pub tool_timeout_secs: Option<u64>,
    pub max_tool_rounds: Option<usize>,
    pub max_search_rounds: Option<usize>,
    pub max_requeues: Option<u32>,
    pub render_width: Option<usize>,
    pub render_padding: Option<usize>,
    pub auto_approve: Option<bool>,
    pub telemetry_enabled: Option<bool>,
    pub telemetry_path: Option<String>,
}

pub fn load_profiles(config_path: &str) -> Result<ProfilesFile> {
    let path = Path::new(config_path);
    if !path.exists() {
        return Ok(ProfilesFile::default());
    }

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read profile config file at '{}'", path.display()))?;
    toml::from_str::<ProfilesFile>(&content).with_context(|| {
        format!(
            "invalid profile configuration in '{}'. Check search provider values and field names.",
            path.display()
        )
    })
}

pub fn resolve_runtime_config(cli: &Cli, profiles: &ProfilesFile) -> Result<RuntimeConfig> {
    let selected = cli.profile.trim();
    if selected.is_empty() {
        return Err(anyhow::anyhow!(
            "profile name cannot be empty. Set --profile <name>."
        ));
    }

    let profile = if selected == "default" && !profiles.profiles.contains_key("default") {
        ProfileConfig::default()
    } else {
        profiles.profiles.get(selected).cloned().ok_or_else(|| {
            let mut names = profiles.profiles.keys().cloned().collect::<Vec<String>>();
            names.sort();
            if names.is_empty() {
                anyhow::anyhow!(
                    "profile '{}' not found in '{}'. No profiles are defined yet.",
                    selected,
                    cli.config_path
                )
            } else {
                anyhow::anyhow!(
                    "profile '{}' not found in '{}'. Available profiles: {}",
                    selected,
                    cli.config_path,
                    names.join(", ")
                )
            }
        })?
    };

    Ok(RuntimeConfig {
        profile: selected.to_string(),
        config_path: cli.config_path.clone(),
        model: cli
            .model
            .clone()
            .or(profile.model)
            .unwrap_or_else(|| DEFAULT_MODEL.to_string()),
        api_base: cli
            .api_base
            .clone()
            .or(profile.api_base)
            .unwrap_or_else(|| DEFAULT_API_BASE.to_string())
            .trim_end_matches('/')
            .to_string(),
        api_key: non_empty(cli.api_key.clone()),
        tavily_api_key: non_empty(cli.tavily_api_key.clone()),
        search_provider: cli
            .search_provider
            .or(profile.search_provider)
            .unwrap_or(SearchProvider::Tavily),
        skills_dir: cli
            .skills_dir
            .clone()
            .or(profile.skills_dir)
            .unwrap_or_else(|| "./skills".to_string()),
        mcp_config_path: cli
            .mcp_config
            .clone()
            .or(profile.mcp_config)
            .unwrap_or_else(|| "./mcp.json".to_string()),
        tool_timeout_secs: cli
            .tool_timeout_secs
            .or(profile.tool_timeout_secs)
            .unwrap_or(30)
            .max(1),
        max_tool_rounds: cli
            .max_tool_rounds
            .or(profile.max_tool_rounds)
            .unwrap_or(DEFAULT_MAX_TOOL_ROUNDS)
            .max(1),
        max_search_rounds: cli
            .max_search_rounds
            .or(profile.max_search_rounds)
            .unwrap_or(DEFAULT_MAX_SEARCH_ROUNDS)
            .max(1),
        max_requeues: cli
            .max_requeues
            .or(profile.max_requeues)
            .unwrap_or(DEFAULT_MAX_REQUEUES),
        render_width: cli
            .render_width
            .or(profile.render_width)
            .unwrap_or(80)
            .max(20),
        render_padding: cli
            .render_padding
            .or(profile.render_padding)
            .unwrap_or(6),
        auto_approve: cli.auto_approve || profile.auto_approve.unwrap_or(false),
        verbose: cli.verbose,
        show_sensitive_config: cli.show_sensitive_config,
        telemetry_enabled: cli
            .telemetry_enabled
            .or(profile.telemetry_enabled)
            .unwrap_or(false),
        telemetry_path: cli
            .telemetry_path
            .clone()
            .or(profile.telemetry_path)
            .unwrap_or_else(|| ".deepresearch/telemetry.jsonl".to_string()),
    })
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

pub fn display_secret(cfg: &RuntimeConfig, secret: Option<&str>) -> String {
    match secret {
        None => "<unset>".to_string(),
        Some(value) if cfg.show_sensitive_config => value.to_string(),
        Some(_) => "[REDACTED] (set --show-sensitive-config to reveal)".to_string(),
    }
}

pub fn print_runtime_summary(cfg: &RuntimeConfig) {
    println!("Profile: {} ({})", cfg.profile, cfg.config_path);
    println!("Model: {} @ {}", cfg.model, cfg.api_base);
    println!("API key: {}", display_secret(cfg, cfg.api_key.as_deref()));
    println!(
        "Search: {} (key: {})",
        cfg.search_provider.label(),
        display_secret(cfg, cfg.tavily_api_key.as_deref())
    );
    println!("Skills dir: {}", cfg.skills_dir);
    println!(
        "MCP config: {} (timeout={}s)",
        cfg.mcp_config_path, cfg.tool_timeout_secs
    );
    println!(
        "Bounds: tool_rounds={} search_rounds={} requeues={}",
        cfg.max_tool_rounds, cfg.max_search_rounds, cfg.max_requeues
    );
}
