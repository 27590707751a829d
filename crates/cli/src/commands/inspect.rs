//! `parley inspect`: describe the loaded flows.

use super::CommandResult;
use parley_config::AppConfig;
use std::path::PathBuf;

pub fn run(config: &AppConfig, flows: &[PathBuf], program: bool) -> CommandResult {
    let library = super::load_library(config, flows)?;

    println!("Flows ({}):\n", library.len());
    for flow in library.iter() {
        let definition = flow.definition();
        let params = if definition.parameters.is_empty() {
            String::new()
        } else {
            format!("({})", definition.parameters.join(", "))
        };
        println!(
            "  {}{} ({} instructions)",
            flow.name(),
            params,
            flow.program().len()
        );
        if !definition.description.is_empty() {
            println!("      {}", definition.description);
        }
        if program {
            for line in flow.program().to_string().lines() {
                println!("      {line}");
            }
        }
    }

    println!("\nEvents ({}):\n", library.vocabulary().len());
    for (name, kind) in library.vocabulary().iter() {
        println!("  {name:<16} {kind:?}");
    }

    let used = library.actions_used();
    if !used.is_empty() {
        let registry = parley_runtime::builtin_actions();
        println!("\nActions:\n");
        for action in used {
            let description = registry
                .get(action)
                .map(|a| a.description())
                .unwrap_or("(not built in; must be registered by the host)");
            println!("  {action:<16} {description}");
        }
    }
    Ok(())
}
