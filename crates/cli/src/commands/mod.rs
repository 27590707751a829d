pub mod chat;
pub mod init;
pub mod inspect;
pub mod replay;
pub mod validate;

use parley_config::AppConfig;
use parley_core::{Event, names};
use parley_flow::FlowLibrary;
use parley_runtime::Turn;
use std::path::{Path, PathBuf};

pub type CommandResult<T = ()> = Result<T, Box<dyn std::error::Error>>;

pub fn load_config(path: Option<&Path>) -> CommandResult<AppConfig> {
    let config = match path {
        Some(path) => AppConfig::load_with_env(path),
        None => AppConfig::load(),
    };
    config.map_err(|e| format!("Failed to load config: {e}").into())
}

/// Load `flows`, or the configured paths when none are given.
pub fn load_library(config: &AppConfig, flows: &[PathBuf]) -> CommandResult<FlowLibrary> {
    let paths = if flows.is_empty() {
        config.flows.paths.clone()
    } else {
        flows.to_vec()
    };
    if paths.is_empty() {
        return Err("No flow files given. Pass --flows FILE or set [flows].paths in config.toml".into());
    }
    Ok(FlowLibrary::load_files(config.vocabulary()?, &paths)?)
}

pub fn main_flows(config: &AppConfig, requested: Vec<String>) -> Vec<String> {
    if requested.is_empty() {
        config.flows.main.clone()
    } else {
        requested
    }
}

/// One transcript line per emitted event and failure.
pub fn turn_lines(turn: &Turn) -> Vec<String> {
    let mut lines: Vec<String> = turn.emitted.iter().map(describe_output).collect();
    for failure in &turn.failures {
        lines.push(format!(
            "! {} ({}) failed: {}",
            failure.flow, failure.instance, failure.error
        ));
    }
    if let Some(fault) = &turn.fault {
        lines.push(format!("!! session discarded: {fault}"));
    }
    lines
}

fn describe_output(event: &Event) -> String {
    match (event.name(), event.text()) {
        (names::BOT_SAY, Some(text)) => format!("bot > {text}"),
        _ => format!("bot > [{event}]"),
    }
}
