//! Async runtime hosting many sessions.
//!
//! Every session lives on its own tokio task. The task owns the
//! [`Session`] outright and serializes everything that touches it:
//! commands from callers, action completions, and timer deadlines. Action
//! requests are run on spawned tasks under a timeout and their results fed
//! back in as completions.

use crate::session::{Session, SessionLimits, Turn};
use parley_core::{
    ActionError, ActionRegistry, CallId, Event, NoticeBus, Params, RuntimeError, SessionId, Value,
};
use parley_flow::FlowLibrary;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{RwLock, broadcast, mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Runtime-wide settings.
#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    pub limits: SessionLimits,
    /// How long an action may run before it fails with a timeout.
    pub action_timeout: Duration,
    /// Buffer of each session's turn broadcast.
    pub output_capacity: usize,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            limits: SessionLimits::default(),
            action_timeout: Duration::from_secs(30),
            output_capacity: 128,
        }
    }
}

impl From<&parley_config::RuntimeConfig> for RuntimeOptions {
    fn from(config: &parley_config::RuntimeConfig) -> Self {
        Self {
            limits: SessionLimits::from(config),
            action_timeout: Duration::from_secs(config.action_timeout_secs),
            output_capacity: config.output_capacity,
        }
    }
}

/// Result of [`Runtime::create_session`].
#[derive(Debug)]
pub struct SessionStart {
    pub id: SessionId,
    /// The turn run by activating the root flows.
    pub turn: Turn,
    /// Asynchronous turns of this session, subscribed before its task
    /// starts so nothing the activation set off can be missed.
    pub turns: broadcast::Receiver<Turn>,
}

enum Command {
    Submit {
        event: Event,
        reply: oneshot::Sender<Result<Turn, RuntimeError>>,
    },
    Close {
        reply: oneshot::Sender<()>,
    },
}

/// Handle to a running session task.
struct SessionHandle {
    commands: mpsc::Sender<Command>,
    turns: broadcast::Sender<Turn>,
}

/// Manager for all live sessions.
pub struct Runtime {
    library: Arc<FlowLibrary>,
    actions: Arc<ActionRegistry>,
    options: RuntimeOptions,
    notices: NoticeBus,
    sessions: RwLock<HashMap<SessionId, SessionHandle>>,
}

impl Runtime {
    pub fn new(library: Arc<FlowLibrary>, actions: ActionRegistry) -> Self {
        Self {
            library,
            actions: Arc::new(actions),
            options: RuntimeOptions::default(),
            notices: NoticeBus::default(),
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_options(mut self, options: RuntimeOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_notices(mut self, notices: NoticeBus) -> Self {
        self.notices = notices;
        self
    }

    pub fn notices(&self) -> &NoticeBus {
        &self.notices
    }

    pub fn library(&self) -> &Arc<FlowLibrary> {
        &self.library
    }

    /// Open a session and activate `main_flows` in order.
    ///
    /// A session whose first turn is fatal is never registered; its id is
    /// returned with the failed turn.
    pub async fn create_session<S: AsRef<str>>(
        &self,
        main_flows: &[S],
        context: Params,
    ) -> Result<SessionStart, RuntimeError> {
        let mut session = Session::new(Arc::clone(&self.library))
            .with_limits(self.options.limits)
            .with_notices(self.notices.clone())
            .with_context(context);
        let turn = session.start(main_flows)?;
        let id = session.id().clone();
        let (turn_tx, turns) = broadcast::channel(self.options.output_capacity.max(1));
        if turn.is_fatal() {
            warn!(session = %id, "Session failed during activation; discarded");
            return Ok(SessionStart { id, turn, turns });
        }

        let (command_tx, command_rx) = mpsc::channel(32);
        let task = SessionTask {
            session,
            commands: command_rx,
            turns: turn_tx.clone(),
            actions: Arc::clone(&self.actions),
            action_timeout: self.options.action_timeout,
        };
        let task_id = id.clone();
        tokio::spawn(async move {
            task.run().await;
            debug!(session = %task_id, "Session task finished");
        });

        self.sessions.write().await.insert(
            id.clone(),
            SessionHandle {
                commands: command_tx,
                turns: turn_tx,
            },
        );
        info!(session = %id, "Session created");
        Ok(SessionStart { id, turn, turns })
    }

    /// Submit an event and wait for the turn it produced.
    ///
    /// A fatal turn is returned once; the session is gone afterwards.
    pub async fn submit_event(&self, id: &SessionId, event: Event) -> Result<Turn, RuntimeError> {
        let commands = self.commands(id).await?;
        let (reply, response) = oneshot::channel();
        commands
            .send(Command::Submit { event, reply })
            .await
            .map_err(|_| RuntimeError::SessionClosed(id.to_string()))?;
        let turn = response
            .await
            .map_err(|_| RuntimeError::SessionClosed(id.to_string()))??;
        if turn.is_fatal() {
            self.sessions.write().await.remove(id);
            warn!(session = %id, "Session poisoned; removed");
        }
        Ok(turn)
    }

    /// Destroy a session, cancelling its timers and in-flight actions.
    pub async fn destroy_session(&self, id: &SessionId) -> Result<(), RuntimeError> {
        let handle = self
            .sessions
            .write()
            .await
            .remove(id)
            .ok_or_else(|| RuntimeError::SessionNotFound(id.to_string()))?;
        let (reply, done) = oneshot::channel();
        if handle.commands.send(Command::Close { reply }).await.is_ok() {
            let _ = done.await;
        }
        info!(session = %id, "Session destroyed");
        Ok(())
    }

    /// Turns produced outside [`Runtime::submit_event`]: action completions
    /// and timeouts. Only turns published after this call are received; use
    /// [`SessionStart::turns`] to see everything from activation on.
    pub async fn subscribe(&self, id: &SessionId) -> Result<broadcast::Receiver<Turn>, RuntimeError> {
        let sessions = self.sessions.read().await;
        sessions
            .get(id)
            .map(|handle| handle.turns.subscribe())
            .ok_or_else(|| RuntimeError::SessionNotFound(id.to_string()))
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    async fn commands(&self, id: &SessionId) -> Result<mpsc::Sender<Command>, RuntimeError> {
        let sessions = self.sessions.read().await;
        sessions
            .get(id)
            .map(|handle| handle.commands.clone())
            .ok_or_else(|| RuntimeError::SessionNotFound(id.to_string()))
    }
}

type Completed = (CallId, Result<Value, ActionError>);

struct SessionTask {
    session: Session,
    commands: mpsc::Receiver<Command>,
    turns: broadcast::Sender<Turn>,
    actions: Arc<ActionRegistry>,
    action_timeout: Duration,
}

impl SessionTask {
    async fn run(mut self) {
        let (done_tx, mut done_rx) = mpsc::unbounded_channel::<Completed>();
        self.dispatch(&done_tx);

        loop {
            let deadline = self.session.next_deadline();
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Submit { event, reply }) => {
                        let result = self.session.submit(event);
                        self.dispatch(&done_tx);
                        let fatal = matches!(&result, Ok(turn) if turn.is_fatal());
                        let _ = reply.send(result);
                        if fatal {
                            break;
                        }
                    }
                    Some(Command::Close { reply }) => {
                        self.session.close("destroyed");
                        let _ = reply.send(());
                        break;
                    }
                    None => {
                        self.session.close("runtime dropped");
                        break;
                    }
                },
                Some((call_id, result)) = done_rx.recv() => {
                    let outcome = self.session.complete_action(call_id, result);
                    if !self.publish(outcome, &done_tx) {
                        break;
                    }
                }
                _ = sleep_until(deadline) => {
                    let outcome = self.session.fire_due_timers(Instant::now());
                    if !self.publish(outcome, &done_tx) {
                        break;
                    }
                }
            }
        }
    }

    /// Forward an asynchronous turn to subscribers. Returns `false` once the
    /// session can no longer run.
    fn publish(
        &mut self,
        outcome: Result<Turn, RuntimeError>,
        done: &mpsc::UnboundedSender<Completed>,
    ) -> bool {
        match outcome {
            Ok(turn) => {
                self.dispatch(done);
                let fatal = turn.is_fatal();
                if !turn.is_quiet() {
                    let _ = self.turns.send(turn);
                }
                !fatal
            }
            Err(e) => {
                warn!(session = %self.session.id(), error = %e, "Session stopped");
                false
            }
        }
    }

    fn dispatch(&mut self, done: &mpsc::UnboundedSender<Completed>) {
        for request in self.session.take_action_requests() {
            let actions = Arc::clone(&self.actions);
            let done = done.clone();
            let limit = self.action_timeout;
            tokio::spawn(async move {
                let result = match tokio::time::timeout(limit, actions.execute(&request)).await {
                    Ok(result) => result,
                    Err(_) => Err(ActionError::Timeout {
                        action: request.action.clone(),
                        timeout_secs: limit.as_secs(),
                    }),
                };
                let _ = done.send((request.call_id, result));
            });
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::{FnAction, builtin_actions};
    use parley_core::names;
    use parley_flow::{EventPattern, FlowDefinition, Statement, Vocabulary};

    fn library(flows: Vec<FlowDefinition>) -> Arc<FlowLibrary> {
        Arc::new(FlowLibrary::new(Vocabulary::standard(), flows).unwrap())
    }

    fn greeter() -> Arc<FlowLibrary> {
        library(vec![FlowDefinition::new(
            "main",
            vec![
                Statement::expect(EventPattern::new(names::USER_SAID).with("text", "hi")),
                Statement::say("Hello World!"),
            ],
        )])
    }

    #[tokio::test]
    async fn create_submit_destroy() {
        let runtime = Runtime::new(greeter(), builtin_actions());
        let start = runtime.create_session(&["main"], Params::new()).await.unwrap();
        assert!(start.turn.emitted.is_empty());
        assert_eq!(runtime.session_count().await, 1);

        let turn = runtime
            .submit_event(&start.id, Event::user_said("hi"))
            .await
            .unwrap();
        assert_eq!(turn.texts(), vec!["Hello World!"]);

        runtime.destroy_session(&start.id).await.unwrap();
        assert_eq!(runtime.session_count().await, 0);
        assert!(matches!(
            runtime.submit_event(&start.id, Event::user_said("hi")).await,
            Err(RuntimeError::SessionNotFound(_))
        ));
        assert!(runtime.destroy_session(&start.id).await.is_err());
    }

    #[tokio::test]
    async fn unknown_main_flow_is_rejected() {
        let runtime = Runtime::new(greeter(), builtin_actions());
        let err = runtime
            .create_session(&["nope"], Params::new())
            .await
            .unwrap_err();
        assert_eq!(err, RuntimeError::UnknownFlow("nope".into()));
        assert_eq!(runtime.session_count().await, 0);
    }

    #[tokio::test]
    async fn action_results_arrive_on_subscription() {
        let flows = library(vec![FlowDefinition::new(
            "main",
            vec![
                Statement::expect(EventPattern::new(names::USER_SAID).capture("text", "who")),
                Statement::execute(
                    "render_utterance",
                    [
                        ("template", Value::from("Nice to meet you, {who}.")),
                        ("who", Value::from("$who")),
                    ],
                    Some("line"),
                ),
                Statement::say("$line"),
            ],
        )]);
        let runtime = Runtime::new(flows, builtin_actions());
        let start = runtime.create_session(&["main"], Params::new()).await.unwrap();
        let mut turns = runtime.subscribe(&start.id).await.unwrap();

        let turn = runtime
            .submit_event(&start.id, Event::user_said("Ada"))
            .await
            .unwrap();
        assert!(turn.emitted.is_empty());

        let turn = turns.recv().await.unwrap();
        assert_eq!(turn.texts(), vec!["Nice to meet you, Ada."]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn activation_action_result_is_not_lost() {
        let flows = library(vec![FlowDefinition::new(
            "main",
            vec![
                Statement::execute(
                    "render_utterance",
                    [("template", Value::from("Welcome!"))],
                    Some("line"),
                ),
                Statement::say("$line"),
                Statement::expect(EventPattern::new(names::USER_SAID)),
            ],
        )]);
        let runtime = Runtime::new(flows, builtin_actions());
        let mut start = runtime.create_session(&["main"], Params::new()).await.unwrap();
        assert!(start.turn.emitted.is_empty());

        // Give the session task time to finish the action before reading.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let turn = tokio::time::timeout(Duration::from_secs(5), start.turns.recv())
            .await
            .expect("greeting was published")
            .unwrap();
        assert_eq!(turn.texts(), vec!["Welcome!"]);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_action_times_out() {
        let mut actions = ActionRegistry::new();
        actions.register(Box::new(SlowAction));
        let flows = library(vec![FlowDefinition::new(
            "main",
            vec![Statement::Execute {
                action: "slow".into(),
                params: Default::default(),
                result: None,
                on_failure: Some(vec![Statement::say("took too long")]),
            }],
        )]);
        let runtime = Runtime::new(flows, actions).with_options(RuntimeOptions {
            action_timeout: Duration::from_secs(5),
            ..RuntimeOptions::default()
        });
        let start = runtime.create_session(&["main"], Params::new()).await.unwrap();
        let mut turns = start.turns;

        let turn = turns.recv().await.unwrap();
        assert_eq!(turn.texts(), vec!["took too long"]);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_branch_is_published() {
        let flows = library(vec![FlowDefinition::new(
            "main",
            vec![Statement::wait_any(
                vec![vec![Statement::expect(
                    EventPattern::new(names::USER_SAID).with("text", "yes"),
                )]],
                Some(12.0),
                vec![Statement::say("Are you still there?")],
            )],
        )]);
        let runtime = Runtime::new(flows, builtin_actions());
        let start = runtime.create_session(&["main"], Params::new()).await.unwrap();
        let mut turns = start.turns;

        let turn = turns.recv().await.unwrap();
        assert_eq!(turn.texts(), vec!["Are you still there?"]);
    }

    #[tokio::test]
    async fn closure_actions_run_through_registry() {
        let mut actions = builtin_actions();
        actions.register(Box::new(FnAction::new("fail", "Always fails", |_| {
            Err(ActionError::ExecutionFailed {
                action: "fail".into(),
                reason: "nope".into(),
            })
        })));
        let flows = library(vec![FlowDefinition::new(
            "main",
            vec![Statement::execute("fail", [("x", Value::from(1))], None)],
        )]);
        let runtime = Runtime::new(flows, actions);
        let start = runtime.create_session(&["main"], Params::new()).await.unwrap();
        let mut turns = start.turns;

        let turn = turns.recv().await.unwrap();
        assert_eq!(turn.failures.len(), 1);
        assert_eq!(turn.failures[0].flow, "main");
    }

    struct SlowAction;

    #[async_trait::async_trait]
    impl parley_core::Action for SlowAction {
        fn name(&self) -> &str {
            "slow"
        }
        fn description(&self) -> &str {
            "Sleeps for a minute"
        }
        async fn execute(&self, _params: Params) -> Result<Value, ActionError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(Value::Null)
        }
    }
}
