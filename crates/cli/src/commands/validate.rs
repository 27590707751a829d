//! `parley validate`: load flow files and check them.

use super::CommandResult;
use parley_config::AppConfig;
use std::path::PathBuf;

pub fn run(config: &AppConfig, flows: &[PathBuf]) -> CommandResult {
    let library = super::load_library(config, flows)?;
    let actions = parley_runtime::builtin_actions();
    library.validate_actions(&actions.names())?;

    let main = super::main_flows(config, vec![]);
    let missing: Vec<&str> = main
        .iter()
        .map(String::as_str)
        .filter(|name| !library.contains(name))
        .collect();

    println!("✅ {} flows valid", library.len());
    println!("   {} event tags in vocabulary", library.vocabulary().len());
    if missing.is_empty() {
        println!("   root flows: {}", main.join(", "));
        Ok(())
    } else {
        Err(format!("Root flows not defined: {}", missing.join(", ")).into())
    }
}
