//! Terminal theme, command palette and startup banner.
//!
//! ANSI color helpers, prefix matching for session commands and the chat
//! banner shown when an interactive session starts.

// ---------------------------------------------------------------------------
// ANSI color helpers
// ---------------------------------------------------------------------------

pub const RESET: &str = "\x1b[0m";
pub const BOLD: &str = "\x1b[1m";
pub const DIM: &str = "\x1b[2m";
pub const CYAN: &str = "\x1b[36m";
pub const GREEN: &str = "\x1b[32m";
pub const YELLOW: &str = "\x1b[33m";
pub const RED: &str = "\x1b[31m";
pub const BOLD_CYAN: &str = "\x1b[1;36m";
pub const BOLD_RED: &str = "\x1b[1;31m";

// ---------------------------------------------------------------------------
// Known commands for prefix matching
// ---------------------------------------------------------------------------

/// Session commands with descriptions. Usable with a `/` or `\` prefix.
pub const COMMAND_PALETTE: &[(&str, &str)] = &[
    ("help", "show command quick reference"),
    ("clear", "forget the current plan and start fresh"),
    ("exit", "end the research session"),
    ("quit", "end the research session"),
];

pub fn build_prompt() -> String {
    format!("{BOLD_CYAN}research>{RESET} ")
}

/// Print the session startup banner.
pub fn print_startup_banner(model: &str, search_provider: &str, skills: usize, agents: usize) {
    let version = env!("CARGO_PKG_VERSION");
    println!();
    println!(
        "  {BOLD_CYAN}deepresearch{RESET} {DIM}v{version}{RESET}  {DIM}·{RESET}  {GREEN}{model}{RESET} {DIM}/{RESET} {GREEN}{search_provider}{RESET}"
    );
    println!("  {DIM}{agents} sub-agent(s), {skills} skill(s) available{RESET}");
    println!();
    println!(
        "  {CYAN}/help{RESET} {DIM}commands{RESET}  {DIM}·{RESET}  {CYAN}/clear{RESET} {DIM}reset{RESET}  {DIM}·{RESET}  {CYAN}/exit{RESET} {DIM}quit{RESET}"
    );
    println!("  {DIM}{}{RESET}", "━".repeat(60));
    println!();
}

/// Result of prefix matching against the command palette.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FuzzyResult {
    NoMatch,
    Exact(String),
    Ambiguous(Vec<String>),
}

pub fn fuzzy_match_command(input: &str) -> FuzzyResult {
    let lower = input.to_ascii_lowercase();
    let matches: Vec<&str> = COMMAND_PALETTE
        .iter()
        .filter(|(name, _)| name.starts_with(&lower))
        .map(|(name, _)| *name)
        .collect();

    match matches.len() {
        0 => FuzzyResult::NoMatch,
        1 => FuzzyResult::Exact(matches[0].to_string()),
        _ => FuzzyResult::Ambiguous(matches.iter().map(|s| s.to_string()).collect()),
    }
}

/// "Did you mean" hint for an unknown command.
pub fn suggest_command(input: &str) -> Option<String> {
    if input.is_empty() {
        return None;
    }
    match fuzzy_match_command(input) {
        FuzzyResult::Exact(cmd) => Some(format!("Did you mean {CYAN}/{cmd}{RESET}?")),
        FuzzyResult::Ambiguous(cmds) => {
            let list = cmds
                .iter()
                .map(|c| format!("{CYAN}/{c}{RESET}"))
                .collect::<Vec<_>>()
                .join(", ");
            Some(format!("Did you mean one of: {list}?"))
        }
        FuzzyResult::NoMatch => None,
    }
}

pub fn format_command_palette() -> String {
    let mut out = String::from("Session commands:\n");
    for (name, desc) in COMMAND_PALETTE {
        out.push_str(&format!("  {CYAN}/{name:<8}{RESET} {DIM}{desc}{RESET}\n"));
    }
    out.push_str(&format!(
        "  {DIM}Anything else is a research request. Commands also accept a \\ prefix.{RESET}\n"
    ));
    out
}
