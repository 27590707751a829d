//! `parley chat`: an interactive session on stdin/stdout.

use super::{CommandResult, turn_lines};
use parley_config::AppConfig;
use parley_core::{Event, Params};
use parley_runtime::{Runtime, RuntimeOptions, Turn, builtin_actions};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;

pub async fn run(config: &AppConfig, flows: &[PathBuf], main: Vec<String>) -> CommandResult {
    let library = super::load_library(config, flows)?;
    let actions = builtin_actions();
    library.validate_actions(&actions.names())?;

    let runtime = Runtime::new(Arc::new(library), actions)
        .with_options(RuntimeOptions::from(&config.runtime));
    let main = super::main_flows(config, main);

    println!("parley chat (type /quit to exit)\n");

    let start = runtime.create_session(&main, Params::new()).await?;
    print_turn(&start.turn);
    if start.turn.is_fatal() {
        return Err("Session failed during activation".into());
    }
    let session = start.id;
    let mut turns = start.turns;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                if line == "/quit" || line == "/exit" {
                    break;
                }
                let turn = runtime.submit_event(&session, Event::user_said(line)).await?;
                print_turn(&turn);
                if turn.is_fatal() {
                    return Ok(());
                }
            }
            turn = turns.recv() => match turn {
                Ok(turn) => {
                    print_turn(&turn);
                    if turn.is_fatal() {
                        return Ok(());
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Dropped bot output");
                }
                Err(RecvError::Closed) => break,
            }
        }
    }

    // The session may already be gone after a fatal turn.
    let _ = runtime.destroy_session(&session).await;
    println!("Goodbye!");
    Ok(())
}

fn print_turn(turn: &Turn) {
    for line in turn_lines(turn) {
        println!("{line}");
    }
}
