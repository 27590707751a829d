//! Compilation of statement trees into flat instruction lists.
//!
//! A flow instance's cursor is a plain program counter into its
//! [`Program`]. Every construct that can suspend a flow compiles to a
//! single [`Instr::Select`], so a waiting instance is fully described by
//! `(pc, locals)` and can be resumed from plain data.

use crate::DefinitionError;
use crate::expr::Expr;
use crate::pattern::EventPattern;
use crate::predicate::Predicate;
use crate::statement::{FlowDefinition, Statement};
use std::collections::BTreeMap;
use std::time::Duration;

/// Index of an instruction in a [`Program`].
pub type Pc = usize;

/// What an arm of a select waits for.
#[derive(Debug, Clone, PartialEq)]
pub enum Lead {
    /// An event matching the pattern.
    Event(EventPattern),
    /// A child flow, started when the select is armed, to finish.
    Flow {
        flow: String,
        args: BTreeMap<String, Expr>,
    },
    /// An action call, dispatched when the select is armed, to complete.
    Action {
        action: String,
        params: BTreeMap<String, Expr>,
        result: Option<String>,
    },
}

/// One alternative of a select.
#[derive(Debug, Clone, PartialEq)]
pub struct Arm {
    pub lead: Lead,
    /// Where execution continues when this arm wins.
    pub resume: Pc,
    /// Where execution continues when the awaited flow or action fails.
    pub on_failure: Option<Pc>,
}

/// A suspension point: wait until one arm resolves or the timeout fires.
#[derive(Debug, Clone, PartialEq)]
pub struct Select {
    pub arms: Vec<Arm>,
    pub timeout: Option<Duration>,
    pub on_timeout: Option<Pc>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Instr {
    Select(Select),
    Send {
        event: String,
        params: BTreeMap<String, Expr>,
    },
    Start {
        flow: String,
        args: BTreeMap<String, Expr>,
        detached: bool,
    },
    Assign {
        var: String,
        value: Expr,
        global: bool,
    },
    /// Fall through when the condition holds, otherwise jump.
    Branch {
        condition: Predicate,
        otherwise: Pc,
    },
    Jump(Pc),
    Abort {
        reason: String,
    },
    /// Body exhausted.
    End,
}

/// The compiled body of one flow definition.
#[derive(Debug, Clone, PartialEq)]
pub struct Program {
    instrs: Vec<Instr>,
}

impl Program {
    /// Compile a definition's body.
    pub fn compile(definition: &FlowDefinition) -> Result<Self, DefinitionError> {
        let mut compiler = Compiler {
            flow: &definition.name,
            instrs: Vec::new(),
        };
        compiler.block(&definition.body)?;
        compiler.instrs.push(Instr::End);
        Ok(Self {
            instrs: compiler.instrs,
        })
    }

    pub fn get(&self, pc: Pc) -> Option<&Instr> {
        self.instrs.get(pc)
    }

    pub fn len(&self) -> usize {
        self.instrs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instrs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Pc, &Instr)> {
        self.instrs.iter().enumerate()
    }
}

/// Longest `wait_any` timeout accepted: one year.
pub const MAX_TIMEOUT_SECS: f64 = 365.0 * 24.0 * 3600.0;

fn flatten_branches(branches: &[Vec<Statement>]) -> Vec<Vec<Statement>> {
    let mut flat = Vec::with_capacity(branches.len());
    for branch in branches {
        match branch.split_first() {
            Some((Statement::Alternative { branches: inner }, rest)) => {
                for inner in flatten_branches(inner) {
                    flat.push(inner.into_iter().chain(rest.iter().cloned()).collect());
                }
            }
            Some((Statement::Sequence { body }, rest)) if !body.is_empty() => {
                let spliced: Vec<Statement> = body.iter().chain(rest).cloned().collect();
                flat.extend(flatten_branches(std::slice::from_ref(&spliced)));
            }
            _ => flat.push(branch.clone()),
        }
    }
    flat
}

impl std::fmt::Display for Program {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (pc, instr) in self.iter() {
            write!(f, "{pc:>4}  ")?;
            match instr {
                Instr::Select(select) => {
                    write!(f, "select")?;
                    for arm in &select.arms {
                        match &arm.lead {
                            Lead::Event(pattern) => write!(f, " [{pattern} -> {}", arm.resume)?,
                            Lead::Flow { flow, .. } => write!(f, " [await {flow} -> {}", arm.resume)?,
                            Lead::Action { action, .. } => {
                                write!(f, " [execute {action} -> {}", arm.resume)?
                            }
                        }
                        if let Some(pc) = arm.on_failure {
                            write!(f, " !{pc}")?;
                        }
                        write!(f, "]")?;
                    }
                    if let (Some(timeout), Some(pc)) = (select.timeout, select.on_timeout) {
                        write!(f, " [timeout {}s -> {pc}]", timeout.as_secs_f64())?;
                    }
                }
                Instr::Send { event, .. } => write!(f, "send {event}")?,
                Instr::Start { flow, detached, .. } => {
                    write!(f, "start {flow}{}", if *detached { " (detached)" } else { "" })?
                }
                Instr::Assign { var, global, .. } => {
                    write!(f, "assign {}{var}", if *global { "global " } else { "" })?
                }
                Instr::Branch {
                    condition,
                    otherwise,
                } => write!(f, "unless {} -> {otherwise}", condition.source())?,
                Instr::Jump(pc) => write!(f, "jump {pc}")?,
                Instr::Abort { reason } => write!(f, "abort {reason:?}")?,
                Instr::End => write!(f, "end")?,
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

struct Compiler<'a> {
    flow: &'a str,
    instrs: Vec<Instr>,
}

impl Compiler<'_> {
    fn pc(&self) -> Pc {
        self.instrs.len()
    }

    fn block(&mut self, statements: &[Statement]) -> Result<(), DefinitionError> {
        for statement in statements {
            self.statement(statement)?;
        }
        Ok(())
    }

    fn statement(&mut self, statement: &Statement) -> Result<(), DefinitionError> {
        match statement {
            Statement::Match(_) | Statement::Await { .. } | Statement::Execute { .. } => {
                self.select(std::slice::from_ref(&vec![statement.clone()]), None, &[])
            }
            Statement::Alternative { branches } => self.select(branches, None, &[]),
            Statement::WaitAny {
                branches,
                timeout,
                on_timeout,
            } => {
                let timeout = match timeout {
                    Some(secs) => Some(self.timeout(*secs)?),
                    None => None,
                };
                if timeout.is_none() && !on_timeout.is_empty() {
                    return Err(DefinitionError::Invalid {
                        flow: self.flow.to_string(),
                        reason: "on_timeout given without a timeout".into(),
                    });
                }
                self.select(branches, timeout, on_timeout)
            }
            Statement::Send { event, params } => {
                self.instrs.push(Instr::Send {
                    event: event.clone(),
                    params: params.clone(),
                });
                Ok(())
            }
            Statement::Start {
                flow,
                args,
                detached,
            } => {
                self.instrs.push(Instr::Start {
                    flow: flow.clone(),
                    args: args.clone(),
                    detached: *detached,
                });
                Ok(())
            }
            Statement::Assign { var, value, global } => {
                self.instrs.push(Instr::Assign {
                    var: var.clone(),
                    value: value.clone(),
                    global: *global,
                });
                Ok(())
            }
            Statement::Abort { reason } => {
                self.instrs.push(Instr::Abort {
                    reason: reason.clone(),
                });
                Ok(())
            }
            Statement::Sequence { body } => self.block(body),
            Statement::Repeat { body } => {
                if !always_suspends(body) {
                    return Err(DefinitionError::NonBlockingLoop {
                        flow: self.flow.to_string(),
                    });
                }
                let top = self.pc();
                self.block(body)?;
                self.instrs.push(Instr::Jump(top));
                Ok(())
            }
            Statement::If {
                condition,
                then,
                otherwise,
            } => {
                let branch = self.pc();
                self.instrs.push(Instr::Branch {
                    condition: condition.clone(),
                    otherwise: 0,
                });
                self.block(then)?;
                if otherwise.is_empty() {
                    let end = self.pc();
                    self.patch_branch(branch, end);
                } else {
                    let skip = self.pc();
                    self.instrs.push(Instr::Jump(0));
                    let else_pc = self.pc();
                    self.patch_branch(branch, else_pc);
                    self.block(otherwise)?;
                    let end = self.pc();
                    self.instrs[skip] = Instr::Jump(end);
                }
                Ok(())
            }
        }
    }

    /// Emit one select whose arms are the lead statements of `branches`.
    ///
    fn timeout(&self, secs: f64) -> Result<Duration, DefinitionError> {
        let invalid = |reason: String| DefinitionError::Invalid {
            flow: self.flow.to_string(),
            reason,
        };
        if secs.is_nan() || secs <= 0.0 {
            return Err(invalid(format!("wait_any timeout must be positive, got {secs}")));
        }
        if secs > MAX_TIMEOUT_SECS {
            return Err(invalid(format!(
                "wait_any timeout must be at most {MAX_TIMEOUT_SECS} seconds, got {secs}"
            )));
        }
        Duration::try_from_secs_f64(secs)
            .map_err(|e| invalid(format!("wait_any timeout {secs}: {e}")))
    }

    /// Layout: the select, the timeout body, then each branch tail (and
    /// failure handler) followed by a jump to the end.
    ///
    /// A branch led by a nested `alternative` contributes one arm per inner
    /// branch, each followed by the rest of the outer branch; a branch led
    /// by a `sequence` is spliced in place.
    fn select(
        &mut self,
        branches: &[Vec<Statement>],
        timeout: Option<Duration>,
        on_timeout: &[Statement],
    ) -> Result<(), DefinitionError> {
        let branches = flatten_branches(branches);
        let branches = branches.as_slice();
        if branches.is_empty() {
            return Err(DefinitionError::Invalid {
                flow: self.flow.to_string(),
                reason: "a choice needs at least one branch".into(),
            });
        }

        let select_pc = self.pc();
        self.instrs.push(Instr::End);

        let mut exits = Vec::new();
        let on_timeout_pc = match timeout {
            Some(_) => {
                let pc = self.pc();
                self.block(on_timeout)?;
                exits.push(self.pc());
                self.instrs.push(Instr::Jump(0));
                Some(pc)
            }
            None => None,
        };

        let mut arms = Vec::with_capacity(branches.len());
        for branch in branches {
            let (lead, failure_body) = match branch.first() {
                Some(Statement::Match(pattern)) => (Lead::Event(pattern.clone()), None),
                Some(Statement::Await {
                    flow,
                    args,
                    on_failure,
                }) => (
                    Lead::Flow {
                        flow: flow.clone(),
                        args: args.clone(),
                    },
                    on_failure.as_deref(),
                ),
                Some(Statement::Execute {
                    action,
                    params,
                    result,
                    on_failure,
                }) => (
                    Lead::Action {
                        action: action.clone(),
                        params: params.clone(),
                        result: result.clone(),
                    },
                    on_failure.as_deref(),
                ),
                _ => {
                    return Err(DefinitionError::NonBlockingLead {
                        flow: self.flow.to_string(),
                    });
                }
            };

            let resume = self.pc();
            self.block(&branch[1..])?;
            exits.push(self.pc());
            self.instrs.push(Instr::Jump(0));

            let on_failure = match failure_body {
                Some(body) => {
                    let pc = self.pc();
                    self.block(body)?;
                    exits.push(self.pc());
                    self.instrs.push(Instr::Jump(0));
                    Some(pc)
                }
                None => None,
            };

            arms.push(Arm {
                lead,
                resume,
                on_failure,
            });
        }

        // The last exit jumps to the very next instruction
        let mut end = self.pc();
        if exits.last() == Some(&(end - 1)) {
            self.instrs.pop();
            exits.pop();
            end -= 1;
        }
        for exit in exits {
            self.instrs[exit] = Instr::Jump(end);
        }
        self.instrs[select_pc] = Instr::Select(Select {
            arms,
            timeout,
            on_timeout: on_timeout_pc,
        });
        Ok(())
    }

    fn patch_branch(&mut self, at: Pc, target: Pc) {
        if let Instr::Branch { otherwise, .. } = &mut self.instrs[at] {
            *otherwise = target;
        }
    }
}

/// Whether running `body` always reaches a suspension point (or stops).
fn always_suspends(body: &[Statement]) -> bool {
    body.iter().any(|statement| match statement {
        Statement::Abort { .. } => true,
        Statement::Sequence { body } | Statement::Repeat { body } => always_suspends(body),
        Statement::If {
            then, otherwise, ..
        } => always_suspends(then) && always_suspends(otherwise),
        other => other.is_blocking(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn said(text: &str) -> Statement {
        Statement::expect(EventPattern::new("UserSaid").with("text", text))
    }

    #[test]
    fn straight_line_body() {
        let def = FlowDefinition::new("main", vec![said("hi"), Statement::say("Hello")]);
        let program = Program::compile(&def).unwrap();
        assert_eq!(program.len(), 3);
        match program.get(0) {
            Some(Instr::Select(select)) => {
                assert_eq!(select.arms.len(), 1);
                assert_eq!(select.arms[0].resume, 1);
            }
            other => panic!("expected select, got {other:?}"),
        }
        assert_eq!(
            program.get(1),
            Some(&Instr::Send {
                event: "BotSay".into(),
                params: [("text".to_string(), Expr::from("Hello"))].into(),
            })
        );
        assert_eq!(program.get(2), Some(&Instr::End));
    }

    #[test]
    fn alternative_compiles_to_one_select() {
        let def = FlowDefinition::new(
            "main",
            vec![
                Statement::alternative(vec![
                    vec![said("hi"), Statement::say("one")],
                    vec![said("hello")],
                ]),
                Statement::say("after"),
            ],
        );
        let program = Program::compile(&def).unwrap();
        let Some(Instr::Select(select)) = program.get(0) else {
            panic!("expected select at 0");
        };
        assert_eq!(select.arms.len(), 2);
        assert_eq!(select.arms[0].resume, 1);
        assert_eq!(select.arms[1].resume, 3);
        assert_eq!(program.get(2), Some(&Instr::Jump(3)));
        assert!(matches!(program.get(3), Some(Instr::Send { event, .. }) if event == "BotSay"));
        assert_eq!(program.get(4), Some(&Instr::End));
    }

    #[test]
    fn wait_any_timeout_branch() {
        let def = FlowDefinition::new(
            "main",
            vec![Statement::wait_any(
                vec![vec![said("yes")]],
                Some(12.0),
                vec![Statement::say("Are you there?")],
            )],
        );
        let program = Program::compile(&def).unwrap();
        let Some(Instr::Select(select)) = program.get(0) else {
            panic!("expected select at 0");
        };
        assert_eq!(select.timeout, Some(Duration::from_secs(12)));
        assert_eq!(select.on_timeout, Some(1));
        assert_eq!(select.arms[0].resume, 3);
        assert_eq!(program.get(2), Some(&Instr::Jump(3)));
        assert_eq!(program.get(3), Some(&Instr::End));
    }

    #[test]
    fn await_with_failure_handler() {
        let def = FlowDefinition::new(
            "main",
            vec![Statement::Await {
                flow: "child".into(),
                args: BTreeMap::new(),
                on_failure: Some(vec![Statement::say("child failed")]),
            }],
        );
        let program = Program::compile(&def).unwrap();
        let Some(Instr::Select(select)) = program.get(0) else {
            panic!("expected select at 0");
        };
        assert!(matches!(&select.arms[0].lead, Lead::Flow { flow, .. } if flow == "child"));
        assert_eq!(select.arms[0].resume, 1);
        assert_eq!(select.arms[0].on_failure, Some(2));
        assert_eq!(program.get(1), Some(&Instr::Jump(3)));
        assert_eq!(program.get(3), Some(&Instr::End));
    }

    #[test]
    fn repeat_jumps_back() {
        let def = FlowDefinition::new(
            "loop",
            vec![Statement::repeat(vec![said("ping"), Statement::say("pong")])],
        );
        let program = Program::compile(&def).unwrap();
        assert_eq!(program.get(2), Some(&Instr::Jump(0)));
        assert_eq!(program.get(3), Some(&Instr::End));
    }

    #[test]
    fn if_else_layout() {
        let def = FlowDefinition::new(
            "branchy",
            vec![Statement::If {
                condition: "$x".parse().unwrap(),
                then: vec![Statement::say("yes")],
                otherwise: vec![Statement::say("no")],
            }],
        );
        let program = Program::compile(&def).unwrap();
        assert!(matches!(program.get(0), Some(Instr::Branch { otherwise: 3, .. })));
        assert_eq!(program.get(2), Some(&Instr::Jump(4)));
        assert_eq!(program.get(4), Some(&Instr::End));
    }

    #[test]
    fn rejects_non_blocking_lead() {
        let def = FlowDefinition::new(
            "bad",
            vec![Statement::alternative(vec![vec![Statement::say("oops")]])],
        );
        assert!(matches!(
            Program::compile(&def),
            Err(DefinitionError::NonBlockingLead { .. })
        ));
    }

    #[test]
    fn rejects_busy_loop() {
        let def = FlowDefinition::new("spin", vec![Statement::repeat(vec![Statement::say("x")])]);
        assert!(matches!(
            Program::compile(&def),
            Err(DefinitionError::NonBlockingLoop { .. })
        ));
    }

    #[test]
    fn rejects_bad_timeout() {
        let def = FlowDefinition::new(
            "bad",
            vec![Statement::wait_any(vec![vec![said("x")]], Some(0.0), vec![])],
        );
        assert!(matches!(
            Program::compile(&def),
            Err(DefinitionError::Invalid { .. })
        ));
    }

    #[test]
    fn rejects_huge_timeout() {
        for secs in [1e20, 1e19, MAX_TIMEOUT_SECS * 2.0, f64::NAN, f64::INFINITY] {
            let def = FlowDefinition::new(
                "slow",
                vec![Statement::wait_any(vec![vec![said("x")]], Some(secs), vec![])],
            );
            assert!(
                matches!(Program::compile(&def), Err(DefinitionError::Invalid { .. })),
                "timeout {secs} accepted"
            );
        }
        let def = FlowDefinition::new(
            "patient",
            vec![Statement::wait_any(
                vec![vec![said("x")]],
                Some(MAX_TIMEOUT_SECS),
                vec![],
            )],
        );
        assert!(Program::compile(&def).is_ok());
    }

    #[test]
    fn nested_alternative_lead_is_flattened() {
        let def = FlowDefinition::new(
            "main",
            vec![Statement::alternative(vec![
                vec![
                    Statement::alternative(vec![vec![said("a")], vec![said("b")]]),
                    Statement::say("a or b"),
                ],
                vec![
                    Statement::Sequence {
                        body: vec![said("c")],
                    },
                    Statement::say("c"),
                ],
            ])],
        );
        let program = Program::compile(&def).unwrap();
        let Some(Instr::Select(select)) = program.get(0) else {
            panic!("expected select at 0");
        };
        let leads: Vec<String> = select
            .arms
            .iter()
            .map(|arm| match &arm.lead {
                Lead::Event(pattern) => pattern.to_string(),
                other => panic!("unexpected lead {other:?}"),
            })
            .collect();
        assert_eq!(
            leads,
            vec![
                r#"UserSaid(text="a")"#,
                r#"UserSaid(text="b")"#,
                r#"UserSaid(text="c")"#
            ]
        );
        // Each arm runs its own copy of the outer tail.
        for arm in &select.arms {
            assert!(matches!(program.get(arm.resume), Some(Instr::Send { .. })));
        }
    }

    #[test]
    fn listing_mentions_each_instruction() {
        let def = FlowDefinition::new("main", vec![said("hi"), Statement::say("Hello")]);
        let listing = Program::compile(&def).unwrap().to_string();
        assert!(listing.contains(r#"select [UserSaid(text="hi") -> 1]"#));
        assert!(listing.contains("send BotSay"));
        assert!(listing.contains("end"));
    }
}
