//! `parley init`: write a default config and sample flows.

use super::CommandResult;
use parley_config::AppConfig;
use std::path::PathBuf;

/// Greets, answers small talk, nudges after 30 seconds of silence, and
/// echoes anything else through the `render_utterance` action.
pub const SAMPLE_FLOWS: &str = r#"# Sample parley flows. Try: parley chat

[[flows]]
name = "main"
description = "Greet the user, then handle small talk"
body = [
  { type = "alternative", branches = [
      [{ type = "match", event = "UserSaid", params = { text = "hi" } }],
      [{ type = "match", event = "UserSaid", params = { text = "hello" } }],
  ] },
  { type = "send", event = "BotSay", params = { text = "Hello World!" } },
  { type = "start", flow = "echo" },
  { type = "repeat", body = [
      { type = "wait_any", timeout = 30.0, branches = [
          [
            { type = "match", event = "UserSaid", params = { text = "how are you?" } },
            { type = "send", event = "BotSay", params = { text = "Great, thanks for asking!" } },
          ],
      ], on_timeout = [
          { type = "send", event = "BotSay", params = { text = "Are you still there?" } },
      ] },
  ] },
]

[[flows]]
name = "echo"
description = "Repeat back whatever no other flow understood"
body = [
  { type = "repeat", body = [
      { type = "match", event = "UserSaid", capture = { text = "utterance" } },
      { type = "execute", action = "render_utterance", params = { template = "You said: {text}", text = "$utterance" }, result = "reply" },
      { type = "send", event = "BotSay", params = { text = "$reply" } },
  ] },
]
"#;

pub fn run(dir: Option<PathBuf>, force: bool) -> CommandResult {
    let dir = dir.unwrap_or_else(AppConfig::config_dir);
    let config_path = dir.join("config.toml");
    let flows_path = dir.join("flows.toml");

    println!("parley: first-time setup");
    println!("========================\n");

    if !dir.exists() {
        std::fs::create_dir_all(&dir)?;
        println!("✅ Created directory: {}", dir.display());
    } else {
        println!("  Directory exists: {}", dir.display());
    }

    if flows_path.exists() && !force {
        println!("⚠️  Flows already exist at: {}", flows_path.display());
    } else {
        std::fs::write(&flows_path, SAMPLE_FLOWS)?;
        println!("✅ Created flows.toml at: {}", flows_path.display());
    }

    if config_path.exists() && !force {
        println!("⚠️  Config already exists at: {}", config_path.display());
        println!("   Edit it manually or re-run with --force.\n");
    } else {
        let mut config = AppConfig::default();
        config.flows.paths = vec![flows_path.clone()];
        std::fs::write(&config_path, toml::to_string_pretty(&config)?)?;
        println!("✅ Created config.toml at: {}", config_path.display());
    }

    println!("\n📝 Next steps:");
    println!("   1. Edit {} to shape the conversation", flows_path.display());
    println!("   2. Run: parley validate");
    println!("   3. Run: parley chat\n");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_flow::{FlowLibrary, Vocabulary};

    #[test]
    fn sample_flows_are_valid() {
        let library = FlowLibrary::from_toml_str(Vocabulary::standard(), SAMPLE_FLOWS).unwrap();
        assert_eq!(library.names().collect::<Vec<_>>(), vec!["echo", "main"]);
        let builtins = parley_runtime::builtin_actions();
        assert!(library.validate_actions(&builtins.names()).is_ok());
    }

    #[test]
    fn init_writes_loadable_config() {
        let dir = tempfile::tempdir().unwrap();
        run(Some(dir.path().to_path_buf()), false).unwrap();

        let config = AppConfig::load_from(&dir.path().join("config.toml")).unwrap();
        assert_eq!(config.flows.paths, vec![dir.path().join("flows.toml")]);
        assert!(dir.path().join("flows.toml").exists());

        // A second run leaves edited files alone.
        std::fs::write(dir.path().join("flows.toml"), "# mine").unwrap();
        run(Some(dir.path().to_path_buf()), false).unwrap();
        let content = std::fs::read_to_string(dir.path().join("flows.toml")).unwrap();
        assert_eq!(content, "# mine");
    }
}
