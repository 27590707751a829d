//! `parley replay`: run a scripted conversation against a session.
//!
//! Each script line is one of:
//! - plain text: a `UserSaid` event
//! - `{"wait": 30}`: advance the clock by that many seconds
//! - `{"name": "UserSilent", "parameters": {...}}`: any event, as JSON
//!
//! Blank lines and `#` comments are skipped. Time is virtual, so a script
//! with long waits replays instantly and gives the same transcript every run.

use super::{CommandResult, turn_lines};
use parley_config::AppConfig;
use parley_core::{ActionError, ActionRegistry, Event};
use parley_flow::MAX_TIMEOUT_SECS;
use parley_runtime::{Session, SessionLimits, Turn, builtin_actions};
use serde::Deserialize;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// One parsed script line.
#[derive(Debug, Clone)]
pub enum Step {
    Say(String),
    Wait(Duration),
    Raise(Event),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Entry {
    Wait { wait: f64 },
    Event(Event),
}

pub fn parse_step(line: &str) -> Result<Option<Step>, String> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }
    if !line.starts_with('{') {
        return Ok(Some(Step::Say(line.to_string())));
    }
    match serde_json::from_str::<Entry>(line) {
        Ok(Entry::Wait { wait }) if wait <= MAX_TIMEOUT_SECS => Duration::try_from_secs_f64(wait)
            .map(|duration| Some(Step::Wait(duration)))
            .map_err(|_| format!("invalid wait: {wait}")),
        Ok(Entry::Wait { wait }) => Err(format!("invalid wait: {wait}")),
        Ok(Entry::Event(event)) => Ok(Some(Step::Raise(event))),
        Err(_) => Err(format!("expected {{\"wait\": secs}} or an event object: {line}")),
    }
}

pub fn parse_script(content: &str) -> Result<Vec<Step>, String> {
    let mut steps = Vec::new();
    for (number, line) in content.lines().enumerate() {
        match parse_step(line) {
            Ok(Some(step)) => steps.push(step),
            Ok(None) => {}
            Err(e) => return Err(format!("line {}: {e}", number + 1)),
        }
    }
    Ok(steps)
}

/// A session driven step by step on a virtual clock.
pub struct Replay {
    session: Session,
    actions: Arc<ActionRegistry>,
    action_timeout: Duration,
    json: bool,
    transcript: Vec<String>,
    finished: bool,
}

impl Replay {
    pub fn new(
        session: Session,
        actions: Arc<ActionRegistry>,
        action_timeout: Duration,
        json: bool,
    ) -> Self {
        Self {
            session,
            actions,
            action_timeout,
            json,
            transcript: Vec::new(),
            finished: false,
        }
    }

    pub async fn start(&mut self, main: &[String]) -> CommandResult {
        let turn = self.session.start(main)?;
        self.record(turn).await
    }

    pub async fn step(&mut self, step: Step) -> CommandResult {
        if self.finished {
            return Ok(());
        }
        match step {
            Step::Say(text) => {
                self.note(format!("> {text}"));
                let turn = self.session.submit(Event::user_said(text))?;
                self.record(turn).await
            }
            Step::Raise(event) => {
                self.note(format!("> [{event}]"));
                let turn = self.session.submit(event)?;
                self.record(turn).await
            }
            Step::Wait(duration) => {
                self.note(format!("> (wait {}s)", duration.as_secs_f64()));
                let target = self
                    .session
                    .clock()
                    .checked_add(duration)
                    .ok_or_else(|| format!("wait of {}s is out of range", duration.as_secs_f64()))?;
                while let Some(deadline) = self.session.next_deadline() {
                    if deadline > target || self.finished {
                        break;
                    }
                    let turn = self.session.fire_due_timers(deadline)?;
                    self.record(turn).await?;
                }
                if !self.finished {
                    let turn = self.session.fire_due_timers(target)?;
                    self.record(turn).await?;
                }
                Ok(())
            }
        }
    }

    pub fn transcript(&self) -> &[String] {
        &self.transcript
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Record `turn`, then run any actions it requested until the session
    /// has no calls left in flight.
    async fn record(&mut self, turn: Turn) -> CommandResult {
        let mut pending = VecDeque::from([turn]);
        while let Some(turn) = pending.pop_front() {
            self.print(&turn);
            if turn.is_fatal() {
                self.finished = true;
                return Ok(());
            }
            for request in self.session.take_action_requests() {
                let result =
                    match tokio::time::timeout(self.action_timeout, self.actions.execute(&request))
                        .await
                    {
                        Ok(result) => result,
                        Err(_) => Err(ActionError::Timeout {
                            action: request.action.clone(),
                            timeout_secs: self.action_timeout.as_secs(),
                        }),
                    };
                pending.push_back(self.session.complete_action(request.call_id, result)?);
            }
        }
        Ok(())
    }

    fn print(&mut self, turn: &Turn) {
        if self.json {
            for event in &turn.emitted {
                let line = serde_json::to_string(event).unwrap_or_else(|_| event.to_string());
                self.note(line);
            }
            let rest = Turn {
                emitted: Vec::new(),
                ..turn.clone()
            };
            for line in turn_lines(&rest) {
                self.note(line);
            }
        } else {
            for line in turn_lines(turn) {
                self.note(line);
            }
        }
    }

    fn note(&mut self, line: String) {
        self.transcript.push(line);
    }
}

pub async fn run(
    config: &AppConfig,
    flows: &[PathBuf],
    main: Vec<String>,
    script: &Path,
    json: bool,
) -> CommandResult {
    let content = std::fs::read_to_string(script)
        .map_err(|e| format!("Failed to read {}: {e}", script.display()))?;
    let steps = parse_script(&content)?;

    let library = super::load_library(config, flows)?;
    let actions = builtin_actions();
    library.validate_actions(&actions.names())?;

    let session = Session::new(Arc::new(library)).with_limits(SessionLimits::from(&config.runtime));
    let mut replay = Replay::new(
        session,
        Arc::new(actions),
        Duration::from_secs(config.runtime.action_timeout_secs),
        json,
    );

    replay.start(&super::main_flows(config, main)).await?;
    for step in steps {
        replay.step(step).await?;
    }

    for line in replay.transcript() {
        if !json || !line.starts_with('>') {
            println!("{line}");
        }
    }
    if replay.is_finished() {
        return Err("Session discarded before the script ended".into());
    }
    Ok(())
}
