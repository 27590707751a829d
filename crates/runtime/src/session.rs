//! The scheduler: one conversation's flow instances and the cascade that
//! drives them.
//!
//! A [`Session`] owns every live [`FlowInstance`], the action bridge, and
//! the timer set. Each external input (a user event, an action completion,
//! a fired timer) runs one *turn*: the input is queued and delivered, every
//! consuming instance advances until it blocks again, and the events those
//! instances produce are queued behind it. The turn ends when the queue
//! drains.
//!
//! Delivery is deterministic. Candidates are the instances waiting when the
//! event is delivered. Among pattern matches only the most specific consume;
//! an exclusive arm hands the event to the earliest-started claimant alone.
//! Consumers advance in start order. When several instances emit bot-facing
//! events in the same step, only the deepest one (earliest started on ties)
//! is heard.

use crate::bridge::{ActionBridge, Completion};
use crate::instance::{Armed, FlowInstance, InstanceStatus, Wait};
use crate::matcher::{carries_id, check_bindings, match_event};
use crate::scope::Scope;
use crate::timer::TimerSet;
use chrono::Utc;
use parley_core::{
    ActionError, ActionRequest, CallId, Event, FlowError, InstanceId, Notice, NoticeBus, Params,
    RuntimeError, SessionId, Value, names,
};
use parley_flow::{FlowLibrary, Instr, Lead, Lookup, Pc, Select, eval_params};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Bounds that keep a misbehaving flow set from running forever.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionLimits {
    /// Event deliveries per turn before the session is poisoned.
    pub max_cascade_steps: usize,
    /// Instructions one activation may run without blocking.
    pub max_steps_per_activation: usize,
    /// Finished instances kept for status queries.
    pub archive_limit: usize,
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self {
            max_cascade_steps: 256,
            max_steps_per_activation: 10_000,
            archive_limit: 1_000,
        }
    }
}

impl From<&parley_config::RuntimeConfig> for SessionLimits {
    fn from(config: &parley_config::RuntimeConfig) -> Self {
        Self {
            max_cascade_steps: config.max_cascade_steps,
            max_steps_per_activation: config.max_steps_per_activation,
            archive_limit: config.archive_limit,
        }
    }
}

/// Whether anything is left to wait for after a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TurnState {
    /// At least one instance is still live.
    #[default]
    Listening,
    /// Every instance has finished.
    Finished,
}

/// A flow instance that failed during a turn.
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceFailure {
    pub instance: InstanceId,
    pub flow: String,
    pub error: FlowError,
}

/// What one turn produced.
#[derive(Debug, Clone, Default)]
pub struct Turn {
    /// Bot-facing events that won arbitration, in emission order.
    pub emitted: Vec<Event>,
    /// Instances aborted by their own errors. Cascaded aborts of their
    /// descendants are not listed.
    pub failures: Vec<InstanceFailure>,
    pub state: TurnState,
    /// Set when the turn poisoned the session.
    pub fault: Option<RuntimeError>,
}

impl Turn {
    /// Texts of emitted `BotSay` events.
    pub fn texts(&self) -> Vec<&str> {
        self.emitted
            .iter()
            .filter(|e| e.name() == names::BOT_SAY)
            .filter_map(Event::text)
            .collect()
    }

    pub fn is_fatal(&self) -> bool {
        self.fault.is_some()
    }

    /// Nothing emitted, nothing failed.
    pub fn is_quiet(&self) -> bool {
        self.emitted.is_empty() && self.failures.is_empty() && self.fault.is_none()
    }
}

/// An event produced inside the session, before arbitration.
struct Produced {
    /// Emitting instance and its depth; `None` for lifecycle events.
    producer: Option<(InstanceId, usize)>,
    event: Event,
}

#[derive(Default)]
struct Cascade {
    queue: VecDeque<Event>,
    step: Vec<Produced>,
    turn: Turn,
}

/// How a waiting instance resolves.
enum Resolution {
    Arm { index: usize, bindings: Params },
    Failed { index: usize, reason: String },
    Timeout,
}

/// A pattern arm that matched the event under delivery.
struct Claim {
    instance: InstanceId,
    index: usize,
    specificity: usize,
    exclusive: bool,
    bindings: Params,
}

enum Candidate {
    /// Addressed to this instance by id; always consumes.
    Keyed(Resolution),
    Pattern(Claim),
}

/// Outcome of one instruction.
enum Next {
    Goto(Pc),
    Spawned(InstanceId),
    Blocked(Vec<InstanceId>),
    Finished,
}

/// Outcome of running one instance within an activation.
enum Run {
    Spawned(InstanceId),
    Blocked(Vec<InstanceId>),
    Done,
    /// The activation's shared step budget ran out.
    Exhausted,
}

/// One conversation: the flow instances, their pending calls and timers.
pub struct Session {
    id: SessionId,
    library: Arc<FlowLibrary>,
    limits: SessionLimits,
    context: Params,
    instances: BTreeMap<InstanceId, FlowInstance>,
    archive: BTreeMap<InstanceId, FlowInstance>,
    next_instance: u64,
    next_sequence: u64,
    timers: TimerSet,
    bridge: ActionBridge,
    notices: NoticeBus,
    fault: Option<RuntimeError>,
    closed: bool,
    /// Latest instant the session has observed; never behind the wall clock.
    clock: Instant,
}

impl Session {
    pub fn new(library: Arc<FlowLibrary>) -> Self {
        Self {
            id: SessionId::new(),
            library,
            limits: SessionLimits::default(),
            context: Params::new(),
            instances: BTreeMap::new(),
            archive: BTreeMap::new(),
            next_instance: 0,
            next_sequence: 0,
            timers: TimerSet::new(),
            bridge: ActionBridge::new(),
            notices: NoticeBus::default(),
            fault: None,
            closed: false,
            clock: Instant::now(),
        }
    }

    pub fn with_id(mut self, id: SessionId) -> Self {
        self.id = id;
        self
    }

    pub fn with_limits(mut self, limits: SessionLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_notices(mut self, notices: NoticeBus) -> Self {
        self.notices = notices;
        self
    }

    /// Seed the session-global variables.
    pub fn with_context(mut self, context: Params) -> Self {
        self.context = context;
        self
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn library(&self) -> &Arc<FlowLibrary> {
        &self.library
    }

    pub fn context(&self) -> &Params {
        &self.context
    }

    pub fn is_poisoned(&self) -> bool {
        self.fault.is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// A live or archived instance.
    pub fn instance(&self, id: InstanceId) -> Option<&FlowInstance> {
        self.instances.get(&id).or_else(|| self.archive.get(&id))
    }

    pub fn status(&self, id: InstanceId) -> Option<InstanceStatus> {
        self.instance(id).map(FlowInstance::status)
    }

    /// Live instances in start order.
    pub fn live_instances(&self) -> impl Iterator<Item = &FlowInstance> {
        self.instances.values()
    }

    pub fn pending_calls(&self) -> usize {
        self.bridge.in_flight()
    }

    pub fn armed_timers(&self) -> usize {
        self.timers.len()
    }

    /// Earliest armed timeout, if any.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.next_deadline()
    }

    /// Action requests queued since the last call. The caller runs them and
    /// reports back through [`Session::complete_action`].
    pub fn take_action_requests(&mut self) -> Vec<ActionRequest> {
        self.bridge.take_requests()
    }

    /// Activate the given root flows, in order, and run the first turn.
    pub fn start<S: AsRef<str>>(&mut self, main_flows: &[S]) -> Result<Turn, RuntimeError> {
        self.ensure_open()?;
        if let Some(missing) = main_flows
            .iter()
            .map(AsRef::as_ref)
            .find(|name| !self.library.contains(name))
        {
            return Err(RuntimeError::UnknownFlow(missing.to_string()));
        }

        let mut cascade = Cascade::default();
        for name in main_flows {
            self.launch(name.as_ref(), Params::new(), &mut cascade)?;
        }
        let flows: Vec<String> = main_flows.iter().map(|n| n.as_ref().to_string()).collect();
        info!(session = %self.id, flows = ?flows, "Session opened");
        self.notices.publish(Notice::SessionOpened {
            session: self.id.to_string(),
            main_flows: flows,
            timestamp: Utc::now(),
        });
        Ok(self.run_turn(cascade))
    }

    /// Start one more root flow with arguments.
    pub fn start_flow(
        &mut self,
        name: &str,
        args: Params,
    ) -> Result<(InstanceId, Turn), RuntimeError> {
        self.ensure_open()?;
        let mut cascade = Cascade::default();
        let id = self.launch(name, args, &mut cascade)?;
        Ok((id, self.run_turn(cascade)))
    }

    /// Deliver an external event and run the cascade it triggers.
    pub fn submit(&mut self, event: Event) -> Result<Turn, RuntimeError> {
        self.ensure_open()?;
        let event = self.sequence(event);
        debug!(session = %self.id, event = %event, "Event submitted");
        let mut cascade = Cascade::default();
        cascade.queue.push_back(event);
        Ok(self.run_turn(cascade))
    }

    /// Report the result of an action call.
    ///
    /// Completions for calls whose instance has gone away are discarded.
    /// Each call id is honored at most once.
    pub fn complete_action(
        &mut self,
        call_id: CallId,
        result: Result<Value, ActionError>,
    ) -> Result<Turn, RuntimeError> {
        self.ensure_open()?;
        let mut cascade = Cascade::default();
        match self.bridge.complete(call_id) {
            Completion::Unknown => {
                debug!(session = %self.id, call = %call_id, "Ignoring completion for unknown call");
            }
            Completion::Discard { action } => {
                warn!(
                    session = %self.id,
                    call = %call_id,
                    action = %action,
                    "Discarding completion for aborted flow"
                );
                self.notices.publish(Notice::CompletionDiscarded {
                    session: self.id.to_string(),
                    call_id: call_id.get(),
                    timestamp: Utc::now(),
                });
            }
            Completion::Deliver { instance, action } => {
                debug!(session = %self.id, call = %call_id, instance = %instance, ok = result.is_ok(), "Action completed");
                let event = match result {
                    Ok(value) => Event::new(names::ACTION_FINISHED)
                        .with("call_id", call_id.get())
                        .with("action", action)
                        .with("result", value),
                    Err(e) => Event::new(names::ACTION_FAILED)
                        .with("call_id", call_id.get())
                        .with("action", action)
                        .with("error", e.to_string()),
                };
                let event = self.sequence(event);
                cascade.queue.push_back(event);
            }
        }
        Ok(self.run_turn(cascade))
    }

    /// The session's notion of now: the wall clock, or the last instant
    /// passed to [`Session::fire_due_timers`] if that is later.
    pub fn clock(&self) -> Instant {
        self.clock.max(Instant::now())
    }

    /// Fire every timer due at `now`, earliest first.
    ///
    /// Timeouts armed by the resulting turn count from `now` even when it is
    /// ahead of the wall clock, so a scripted clock stays consistent.
    pub fn fire_due_timers(&mut self, now: Instant) -> Result<Turn, RuntimeError> {
        self.ensure_open()?;
        self.clock = self.clock.max(now);
        let mut cascade = Cascade::default();
        for (timer, instance) in self.timers.take_due(now) {
            debug!(session = %self.id, timer = %timer, instance = %instance, "Timer fired");
            let event = Event::new(names::TIMEOUT)
                .with("timer_id", timer.get())
                .with("instance_id", instance.get());
            let event = self.sequence(event);
            cascade.queue.push_back(event);
        }
        Ok(self.run_turn(cascade))
    }

    /// Abort an instance and its non-detached descendants.
    pub fn abort_instance(&mut self, id: InstanceId, reason: &str) -> Result<Turn, RuntimeError> {
        self.ensure_open()?;
        let mut cascade = Cascade::default();
        self.terminate(id, FlowError::Stopped(reason.to_string()), true, &mut cascade);
        Ok(self.run_turn(cascade))
    }

    /// Tear the session down: every instance, timer, and pending call is
    /// dropped. Later calls fail with [`RuntimeError::SessionClosed`].
    pub fn close(&mut self, reason: &str) {
        if self.closed {
            return;
        }
        self.closed = true;
        let live = self.instances.len();
        self.instances.clear();
        self.archive.clear();
        self.timers.clear();
        self.bridge.clear();
        info!(session = %self.id, live, reason, "Session closed");
        self.notices.publish(Notice::SessionClosed {
            session: self.id.to_string(),
            reason: reason.to_string(),
            timestamp: Utc::now(),
        });
    }

    fn now(&mut self) -> Instant {
        self.clock = self.clock.max(Instant::now());
        self.clock
    }

    fn ensure_open(&self) -> Result<(), RuntimeError> {
        if let Some(fault) = &self.fault {
            return Err(fault.clone());
        }
        if self.closed {
            return Err(RuntimeError::SessionClosed(self.id.to_string()));
        }
        Ok(())
    }

    fn sequence(&mut self, event: Event) -> Event {
        self.next_sequence += 1;
        event.sequenced(self.next_sequence)
    }

    fn launch(
        &mut self,
        name: &str,
        args: Params,
        cascade: &mut Cascade,
    ) -> Result<InstanceId, RuntimeError> {
        let id = self
            .spawn(name, args, None, false, cascade)
            .map_err(|_| RuntimeError::UnknownFlow(name.to_string()))?;
        self.activate(id, cascade);
        Ok(id)
    }

    // --- Cascade ---

    fn run_turn(&mut self, mut cascade: Cascade) -> Turn {
        self.settle(&mut cascade);
        let mut steps = 0usize;
        while let Some(event) = cascade.queue.pop_front() {
            if steps == self.limits.max_cascade_steps {
                let fault = RuntimeError::UnreachableState(format!(
                    "cascade did not settle within {steps} steps"
                ));
                error!(
                    session = %self.id,
                    steps,
                    pending = cascade.queue.len() + 1,
                    "Cascade did not reach a fixed point; session poisoned"
                );
                self.fault = Some(fault.clone());
                cascade.turn.fault = Some(fault);
                cascade.queue.clear();
                break;
            }
            steps += 1;
            self.deliver(&event, &mut cascade);
            self.settle(&mut cascade);
        }

        cascade.turn.state = if self.instances.is_empty() {
            TurnState::Finished
        } else {
            TurnState::Listening
        };
        cascade.turn
    }

    /// Arbitrate the events produced in one step and queue the survivors.
    fn settle(&mut self, cascade: &mut Cascade) {
        if cascade.step.is_empty() {
            return;
        }
        let library = Arc::clone(&self.library);
        let vocabulary = library.vocabulary();
        let produced = std::mem::take(&mut cascade.step);

        let speakers: BTreeMap<InstanceId, usize> = produced
            .iter()
            .filter(|p| vocabulary.is_output(p.event.name()))
            .filter_map(|p| p.producer)
            .collect();
        let winner = if speakers.len() > 1 {
            speakers
                .iter()
                .max_by(|a, b| a.1.cmp(b.1).then(b.0.cmp(a.0)))
                .map(|(id, _)| *id)
        } else {
            None
        };

        for Produced { producer, event } in produced {
            let output = vocabulary.is_output(event.name());
            if let (true, Some(winner), Some((instance, _))) = (output, winner, producer) {
                if instance != winner {
                    warn!(
                        session = %self.id,
                        instance = %instance,
                        winner = %winner,
                        event = %event,
                        "Bot action lost arbitration"
                    );
                    self.notices.publish(Notice::BotActionDeferred {
                        session: self.id.to_string(),
                        instance: instance.get(),
                        event: event.name().to_string(),
                        winner: winner.get(),
                        timestamp: Utc::now(),
                    });
                    continue;
                }
            }
            let event = self.sequence(event);
            if output {
                cascade.turn.emitted.push(event.clone());
            }
            cascade.queue.push_back(event);
        }
    }

    fn deliver(&mut self, event: &Event, cascade: &mut Cascade) {
        let waiting: Vec<InstanceId> = self
            .instances
            .values()
            .filter(|i| i.status == InstanceStatus::Waiting)
            .map(|i| i.id)
            .collect();

        let mut consumers = Vec::new();
        let mut claims = Vec::new();
        let mut broken = Vec::new();
        for id in waiting {
            match self.candidate(id, event) {
                Ok(Some(Candidate::Keyed(resolution))) => consumers.push((id, resolution)),
                Ok(Some(Candidate::Pattern(claim))) => claims.push(claim),
                Ok(None) => {}
                Err(error) => broken.push((id, error)),
            }
        }
        consumers.extend(arbitrate(claims).into_iter().map(|claim| {
            (
                claim.instance,
                Resolution::Arm {
                    index: claim.index,
                    bindings: claim.bindings,
                },
            )
        }));
        consumers.sort_by_key(|(id, _)| *id);

        debug!(
            session = %self.id,
            event = %event,
            consumers = consumers.len(),
            "Event delivered"
        );

        for (id, error) in broken {
            self.terminate(id, error, true, cascade);
        }
        for (id, resolution) in consumers {
            self.resume(id, resolution, cascade);
        }
    }

    /// Whether and how a waiting instance takes `event`.
    fn candidate(&self, id: InstanceId, event: &Event) -> Result<Option<Candidate>, FlowError> {
        let Some(instance) = self.instances.get(&id) else {
            return Ok(None);
        };
        let (Some(wait), Some(select)) = (instance.wait(), instance.select()) else {
            return Ok(None);
        };
        let name = event.name();

        if let Some(timer) = wait.timer {
            if name == names::TIMEOUT && carries_id(event, "timer_id", timer.get()) {
                return Ok(Some(Candidate::Keyed(Resolution::Timeout)));
            }
        }

        let scope = Scope::new(&instance.locals, &self.context);
        for (index, (arm, armed)) in select.arms.iter().zip(&wait.arms).enumerate() {
            match (armed, &arm.lead) {
                (Armed::Event, Lead::Event(pattern)) => {
                    let outcome = match_event(pattern, event, &scope)?;
                    if outcome.is_match() {
                        return Ok(Some(Candidate::Pattern(Claim {
                            instance: id,
                            index,
                            specificity: outcome.specificity(),
                            exclusive: pattern.exclusive,
                            bindings: outcome.into_bindings().unwrap_or_default(),
                        })));
                    }
                }
                (Armed::Child(child), _) if carries_id(event, "instance_id", child.get()) => {
                    match name {
                        names::FLOW_FINISHED => {
                            return Ok(Some(Candidate::Keyed(Resolution::Arm {
                                index,
                                bindings: Params::new(),
                            })));
                        }
                        names::FLOW_FAILED => {
                            return Ok(Some(Candidate::Keyed(Resolution::Failed {
                                index,
                                reason: param_text(event, "reason"),
                            })));
                        }
                        _ => {}
                    }
                }
                (Armed::Call(call), Lead::Action { result, .. })
                    if carries_id(event, "call_id", call.get()) =>
                {
                    match name {
                        names::ACTION_FINISHED => {
                            let mut bindings = Params::new();
                            if let Some(var) = result {
                                bindings.insert(
                                    var.clone(),
                                    event.param("result").cloned().unwrap_or_default(),
                                );
                            }
                            return Ok(Some(Candidate::Keyed(Resolution::Arm { index, bindings })));
                        }
                        names::ACTION_FAILED => {
                            return Ok(Some(Candidate::Keyed(Resolution::Failed {
                                index,
                                reason: param_text(event, "error"),
                            })));
                        }
                        _ => {}
                    }
                }
                _ => {}
            }
        }
        Ok(None)
    }

    fn resume(&mut self, id: InstanceId, resolution: Resolution, cascade: &mut Cascade) {
        let Some(instance) = self.instances.get(&id) else {
            return;
        };
        if instance.status != InstanceStatus::Waiting {
            return;
        }
        let flow = Arc::clone(&instance.flow);
        let Some(Instr::Select(select)) = instance.wait().and_then(|w| flow.program().get(w.select))
        else {
            return;
        };

        match resolution {
            Resolution::Arm { index, bindings } => {
                let checked = check_bindings(&instance.locals, &bindings, |name| {
                    instance.is_parameter(name)
                });
                if let Err(error) = checked {
                    self.terminate(id, error, true, cascade);
                    return;
                }
                self.disarm(id, Some(index), cascade);
                self.advance(id, select.arms[index].resume, bindings, cascade);
            }
            Resolution::Failed { index, reason } => {
                let arm = &select.arms[index];
                match arm.on_failure {
                    Some(handler) => {
                        debug!(session = %self.id, instance = %id, reason = %reason, "Running failure handler");
                        self.disarm(id, Some(index), cascade);
                        self.advance(id, handler, Params::new(), cascade);
                    }
                    None => {
                        let action = match &arm.lead {
                            Lead::Flow { flow, .. } => format!("flow {flow}"),
                            Lead::Action { action, .. } => action.clone(),
                            Lead::Event(pattern) => pattern.event.clone(),
                        };
                        self.terminate(id, FlowError::ActionFailed { action, reason }, true, cascade);
                    }
                }
            }
            Resolution::Timeout => {
                self.disarm(id, None, cascade);
                match select.on_timeout {
                    Some(handler) => self.advance(id, handler, Params::new(), cascade),
                    None => self.terminate(
                        id,
                        FlowError::Pattern("timeout fired without a handler".into()),
                        true,
                        cascade,
                    ),
                }
            }
        }
    }

    /// Drop a resolved wait: cancel its timer and the arms that lost.
    fn disarm(&mut self, id: InstanceId, keep: Option<usize>, cascade: &mut Cascade) {
        let Some(wait) = self.instances.get_mut(&id).and_then(|i| i.wait.take()) else {
            return;
        };
        if let Some(timer) = wait.timer {
            self.timers.cancel(timer);
        }
        for (index, armed) in wait.arms.into_iter().enumerate() {
            if Some(index) == keep {
                continue;
            }
            match armed {
                Armed::Event => {}
                Armed::Child(child) => self.terminate(
                    child,
                    FlowError::Stopped("another alternative resolved".into()),
                    false,
                    cascade,
                ),
                Armed::Call(call) => self.bridge.cancel(call),
            }
        }
    }

    fn advance(&mut self, id: InstanceId, pc: Pc, bindings: Params, cascade: &mut Cascade) {
        let Some(instance) = self.instances.get_mut(&id) else {
            return;
        };
        instance.locals.extend(bindings);
        instance.pc = pc;
        instance.status = InstanceStatus::Active;
        self.activate(id, cascade);
    }

    // --- Interpreter ---

    /// Run `id` and any flows it starts until all of them block or finish.
    ///
    /// Started children run before their parent continues. The step budget
    /// is shared by everything one activation runs.
    fn activate(&mut self, id: InstanceId, cascade: &mut Cascade) {
        let mut budget = self.limits.max_steps_per_activation;
        let mut stack = vec![id];
        while let Some(&current) = stack.last() {
            match self.run(current, &mut budget, cascade) {
                Run::Spawned(child) => stack.push(child),
                Run::Blocked(children) => {
                    stack.pop();
                    stack.extend(children.into_iter().rev());
                }
                Run::Done => {
                    stack.pop();
                }
                Run::Exhausted => {
                    // The activating instance owns the budget and takes the
                    // failure; anything still mid-run goes down with it.
                    let limit = self.limits.max_steps_per_activation;
                    warn!(session = %self.id, instance = %id, limit, "Activation step budget exhausted");
                    self.terminate(id, FlowError::StepLimit { limit }, true, cascade);
                    for other in stack.drain(..).rev() {
                        let running = self
                            .instances
                            .get(&other)
                            .is_some_and(|i| i.status != InstanceStatus::Waiting);
                        if running {
                            self.terminate(other, FlowError::StepLimit { limit }, false, cascade);
                        }
                    }
                    return;
                }
            }
        }
    }

    fn run(&mut self, id: InstanceId, budget: &mut usize, cascade: &mut Cascade) -> Run {
        let Some(instance) = self.instances.get_mut(&id) else {
            return Run::Done;
        };
        if instance.status == InstanceStatus::Waiting {
            return Run::Done;
        }
        instance.status = InstanceStatus::Active;
        let flow = Arc::clone(&instance.flow);

        loop {
            if *budget == 0 {
                return Run::Exhausted;
            }
            *budget -= 1;

            let Some(pc) = self.instances.get(&id).map(|i| i.pc) else {
                return Run::Done;
            };
            let next = match flow.program().get(pc) {
                Some(instr) => self.execute(id, pc, instr, cascade),
                None => Ok(Next::Finished),
            };
            match next {
                Ok(Next::Goto(target)) => {
                    if let Some(instance) = self.instances.get_mut(&id) {
                        instance.pc = target;
                    }
                }
                Ok(Next::Spawned(child)) => return Run::Spawned(child),
                Ok(Next::Blocked(children)) => return Run::Blocked(children),
                Ok(Next::Finished) => {
                    self.complete(id, cascade);
                    return Run::Done;
                }
                Err(error) => {
                    self.terminate(id, error, true, cascade);
                    return Run::Done;
                }
            }
        }
    }

    fn execute(
        &mut self,
        id: InstanceId,
        pc: Pc,
        instr: &Instr,
        cascade: &mut Cascade,
    ) -> Result<Next, FlowError> {
        match instr {
            Instr::Send { event, params } => {
                let params = self.evaluate(id, |scope| eval_params(params, scope))?;
                let depth = self.instances.get(&id).map_or(0, |i| i.depth);
                cascade.step.push(Produced {
                    producer: Some((id, depth)),
                    event: Event::with_params(event.as_str(), params),
                });
                Ok(Next::Goto(pc + 1))
            }
            Instr::Start {
                flow,
                args,
                detached,
            } => {
                let args = self.evaluate(id, |scope| eval_params(args, scope))?;
                if let Some(instance) = self.instances.get_mut(&id) {
                    instance.pc = pc + 1;
                }
                let child = self.spawn(flow, args, Some(id), *detached, cascade)?;
                Ok(Next::Spawned(child))
            }
            Instr::Assign { var, value, global } => {
                let value = self.evaluate(id, |scope| value.eval(scope))?;
                if *global {
                    self.context.insert(var.clone(), value);
                } else if let Some(instance) = self.instances.get_mut(&id) {
                    instance.locals.insert(var.clone(), value);
                }
                Ok(Next::Goto(pc + 1))
            }
            Instr::Branch {
                condition,
                otherwise,
            } => {
                let holds = self.evaluate(id, |scope| condition.evaluate(scope))?;
                Ok(Next::Goto(if holds { pc + 1 } else { *otherwise }))
            }
            Instr::Jump(target) => Ok(Next::Goto(*target)),
            Instr::Abort { reason } => Err(FlowError::Stopped(reason.clone())),
            Instr::End => Ok(Next::Finished),
            Instr::Select(select) => self.arm(id, pc, select, cascade).map(Next::Blocked),
        }
    }

    fn evaluate<T>(
        &self,
        id: InstanceId,
        f: impl FnOnce(&dyn Lookup) -> Result<T, FlowError>,
    ) -> Result<T, FlowError> {
        let empty = Params::new();
        let locals = self.instances.get(&id).map_or(&empty, |i| &i.locals);
        f(&Scope::new(locals, &self.context))
    }

    /// Suspend `id` on `select`: start child flows and action calls, arm the
    /// timeout. Returns the children to run next.
    fn arm(
        &mut self,
        id: InstanceId,
        pc: Pc,
        select: &Select,
        cascade: &mut Cascade,
    ) -> Result<Vec<InstanceId>, FlowError> {
        let deadline = match select.timeout {
            Some(after) => Some(self.now().checked_add(after).ok_or_else(|| {
                FlowError::Pattern(format!("timeout of {after:?} is out of range"))
            })?),
            None => None,
        };
        let mut armed = Vec::with_capacity(select.arms.len());
        let mut children = Vec::new();
        for arm in &select.arms {
            match &arm.lead {
                Lead::Event(_) => armed.push(Armed::Event),
                Lead::Flow { flow, args } => {
                    let args = self.evaluate(id, |scope| eval_params(args, scope))?;
                    let child = self.spawn(flow, args, Some(id), false, cascade)?;
                    armed.push(Armed::Child(child));
                    children.push(child);
                }
                Lead::Action { action, params, .. } => {
                    let params = self.evaluate(id, |scope| eval_params(params, scope))?;
                    let call = self.bridge.start(id, action, params);
                    debug!(session = %self.id, instance = %id, call = %call, action = %action, "Action dispatched");
                    self.notices.publish(Notice::ActionDispatched {
                        session: self.id.to_string(),
                        call_id: call.get(),
                        action: action.clone(),
                        instance: id.get(),
                        timestamp: Utc::now(),
                    });
                    armed.push(Armed::Call(call));
                }
            }
        }

        let timer = deadline.map(|deadline| self.timers.arm(deadline, id));
        if let Some(instance) = self.instances.get_mut(&id) {
            instance.wait = Some(Wait {
                select: pc,
                arms: armed,
                timer,
            });
            instance.status = InstanceStatus::Waiting;
        }
        Ok(children)
    }

    // --- Lifecycle ---

    fn spawn(
        &mut self,
        name: &str,
        args: Params,
        parent: Option<InstanceId>,
        detached: bool,
        cascade: &mut Cascade,
    ) -> Result<InstanceId, FlowError> {
        let flow = self
            .library
            .get(name)
            .cloned()
            .ok_or_else(|| FlowError::UnknownFlow(name.to_string()))?;
        self.next_instance += 1;
        let id = InstanceId(self.next_instance);

        let depth = match parent.and_then(|p| self.instances.get_mut(&p)) {
            Some(parent) => {
                if !detached {
                    parent.children.insert(id);
                }
                parent.depth + 1
            }
            None => 0,
        };

        debug!(session = %self.id, instance = %id, flow = %name, depth, detached, "Flow started");
        self.notices.publish(Notice::FlowStarted {
            session: self.id.to_string(),
            instance: id.get(),
            flow: name.to_string(),
            depth,
            timestamp: Utc::now(),
        });
        self.instances.insert(
            id,
            FlowInstance::new(id, flow, args, parent, depth, detached),
        );
        cascade.step.push(Produced {
            producer: None,
            event: Event::new(names::FLOW_STARTED)
                .with("flow", name)
                .with("instance_id", id.get()),
        });
        Ok(id)
    }

    fn complete(&mut self, id: InstanceId, cascade: &mut Cascade) {
        let Some(mut instance) = self.instances.remove(&id) else {
            return;
        };
        instance.status = InstanceStatus::Completed;
        instance.wait = None;
        self.unlink(&instance);

        info!(session = %self.id, instance = %id, flow = %instance.flow_name(), "Flow completed");
        self.notices.publish(Notice::FlowCompleted {
            session: self.id.to_string(),
            instance: id.get(),
            flow: instance.flow_name().to_string(),
            timestamp: Utc::now(),
        });
        cascade.step.push(Produced {
            producer: None,
            event: Event::new(names::FLOW_FINISHED)
                .with("flow", instance.flow_name())
                .with("instance_id", id.get()),
        });

        let cause = format!("{} ({id})", instance.flow_name());
        let children: Vec<InstanceId> = instance.children().collect();
        self.retire(instance);
        for child in children {
            self.terminate(child, FlowError::ParentTerminated(cause.clone()), false, cascade);
        }
    }

    /// Abort `root` and every non-detached descendant. Only `root` is
    /// reported in the turn, and only when `report` is set.
    fn terminate(&mut self, root: InstanceId, error: FlowError, report: bool, cascade: &mut Cascade) {
        let Some(instance) = self.instances.get(&root) else {
            return;
        };
        if report {
            cascade.turn.failures.push(InstanceFailure {
                instance: root,
                flow: instance.flow_name().to_string(),
                error: error.clone(),
            });
        }
        let cause = format!("{} ({root})", instance.flow_name());

        let mut doomed = Vec::new();
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            if let Some(instance) = self.instances.get(&id) {
                doomed.push(id);
                stack.extend(instance.children().collect::<Vec<_>>().into_iter().rev());
            }
        }
        for id in doomed {
            let reason = if id == root {
                error.clone()
            } else {
                FlowError::ParentTerminated(cause.clone())
            };
            self.abort(id, reason, cascade);
        }
    }

    fn abort(&mut self, id: InstanceId, reason: FlowError, cascade: &mut Cascade) {
        let Some(mut instance) = self.instances.remove(&id) else {
            return;
        };
        if let Some(timer) = instance.wait.take().and_then(|w| w.timer) {
            self.timers.cancel(timer);
        }
        self.bridge.cancel_instance(id);
        instance.status = InstanceStatus::Aborted;
        instance.outcome = Some(reason.to_string());
        self.unlink(&instance);

        warn!(
            session = %self.id,
            instance = %id,
            flow = %instance.flow_name(),
            reason = %reason,
            "Flow aborted"
        );
        self.notices.publish(Notice::FlowAborted {
            session: self.id.to_string(),
            instance: id.get(),
            flow: instance.flow_name().to_string(),
            reason: reason.to_string(),
            timestamp: Utc::now(),
        });
        cascade.step.push(Produced {
            producer: None,
            event: Event::new(names::FLOW_FAILED)
                .with("flow", instance.flow_name())
                .with("instance_id", id.get())
                .with("reason", reason.to_string()),
        });
        self.retire(instance);
    }

    /// Detach a terminated instance from its parent; its detached children
    /// become roots.
    fn unlink(&mut self, instance: &FlowInstance) {
        if let Some(parent) = instance.parent.and_then(|p| self.instances.get_mut(&p)) {
            parent.children.remove(&instance.id);
        }
        for other in self.instances.values_mut() {
            if other.detached && other.parent == Some(instance.id) {
                other.parent = None;
            }
        }
    }

    fn retire(&mut self, instance: FlowInstance) {
        self.archive.insert(instance.id, instance);
        while self.archive.len() > self.limits.archive_limit {
            self.archive.pop_first();
        }
    }
}

/// Pick the consumers among pattern claims: the most specific ones, or the
/// earliest exclusive claimant among them.
fn arbitrate(claims: Vec<Claim>) -> Vec<Claim> {
    let Some(best) = claims.iter().map(|c| c.specificity).max() else {
        return Vec::new();
    };
    let mut top: Vec<Claim> = claims
        .into_iter()
        .filter(|c| c.specificity == best)
        .collect();
    let exclusive = top
        .iter()
        .enumerate()
        .filter(|(_, c)| c.exclusive)
        .min_by_key(|(_, c)| c.instance)
        .map(|(pos, _)| pos);
    match exclusive {
        Some(pos) => vec![top.swap_remove(pos)],
        None => top,
    }
}

fn param_text(event: &Event, key: &str) -> String {
    event.param(key).map(Value::render).unwrap_or_default()
}
