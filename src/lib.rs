pub mod agents;
pub mod cli;
pub mod config;
pub mod conversation;
pub mod dispatcher;
pub mod error;
pub mod input;
pub mod llm;
pub mod markdown;
pub mod mcp;
pub mod plan;
pub mod registry;
pub mod search;
pub mod session;
pub mod skills;
pub mod telemetry;
pub mod theme;

#[cfg(test)]
mod tests;
