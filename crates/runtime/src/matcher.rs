//! Matching incoming events against expected patterns.
//!
//! A pattern names an event tag and optionally constrains parameters to
//! literals or bound variables; unconstrained parameters are wildcards.
//! The number of constrained parameters is the match's specificity.

use parley_core::{Event, FlowError, Params, Value};
use parley_flow::{Constraint, EventPattern, Lookup};

/// Result of testing one pattern against one event.
#[derive(Debug, Clone, PartialEq)]
pub enum MatchOutcome {
    NoMatch,
    /// Matched a pattern with no constrained parameters.
    Match(Params),
    /// Matched with the given specificity (> 0).
    MatchWithScore(Params, usize),
}

impl MatchOutcome {
    pub fn is_match(&self) -> bool {
        !matches!(self, MatchOutcome::NoMatch)
    }

    pub fn specificity(&self) -> usize {
        match self {
            MatchOutcome::MatchWithScore(_, score) => *score,
            _ => 0,
        }
    }

    /// Variable bindings produced by the match.
    pub fn into_bindings(self) -> Option<Params> {
        match self {
            MatchOutcome::NoMatch => None,
            MatchOutcome::Match(bindings) | MatchOutcome::MatchWithScore(bindings, _) => {
                Some(bindings)
            }
        }
    }
}

/// Test `event` against `pattern`, resolving `$var` constraints in `scope`.
///
/// Referencing an unbound variable is a [`FlowError::Pattern`]; it is only
/// reported when the event tag matches.
pub fn match_event(
    pattern: &EventPattern,
    event: &Event,
    scope: &dyn Lookup,
) -> Result<MatchOutcome, FlowError> {
    if pattern.event != event.name() {
        return Ok(MatchOutcome::NoMatch);
    }

    for (param, constraint) in &pattern.params {
        let expected = match constraint {
            Constraint::Literal(value) => value,
            Constraint::Var(name) => scope.lookup(name).ok_or_else(|| {
                FlowError::Pattern(format!(
                    "pattern {pattern} references unbound variable ${name}"
                ))
            })?,
        };
        match event.param(param) {
            Some(actual) if actual == expected => {}
            _ => return Ok(MatchOutcome::NoMatch),
        }
    }

    let bindings: Params = pattern
        .capture
        .iter()
        .map(|(param, var)| (var.clone(), event.param(param).cloned().unwrap_or_default()))
        .collect();

    Ok(match pattern.specificity() {
        0 => MatchOutcome::Match(bindings),
        score => MatchOutcome::MatchWithScore(bindings, score),
    })
}

/// Check that `bindings` do not rebind a flow parameter to a different
/// value. `is_parameter` tells which names are parameters.
pub fn check_bindings(
    locals: &Params,
    bindings: &Params,
    is_parameter: impl Fn(&str) -> bool,
) -> Result<(), FlowError> {
    for (name, incoming) in bindings {
        if !is_parameter(name) {
            continue;
        }
        match locals.get(name) {
            Some(existing) if !existing.is_null() && existing != incoming => {
                return Err(FlowError::BindingConflict {
                    name: name.clone(),
                    existing: existing.clone(),
                    incoming: incoming.clone(),
                });
            }
            _ => {}
        }
    }
    Ok(())
}

/// Whether `event` carries `key` equal to the id `raw`.
pub(crate) fn carries_id(event: &Event, key: &str, raw: u64) -> bool {
    event.param(key) == Some(&Value::from(raw))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scope(pairs: &[(&str, &str)]) -> Params {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), Value::from(*v)))
            .collect()
    }

    #[test]
    fn different_tag_never_matches() {
        let pattern = EventPattern::new("UserSaid").with("text", "$unbound");
        let outcome = match_event(&pattern, &Event::new("BotSay"), &Params::new()).unwrap();
        assert_eq!(outcome, MatchOutcome::NoMatch);
    }

    #[test]
    fn wildcard_match_has_zero_specificity() {
        let pattern = EventPattern::new("UserSaid").capture("text", "utterance");
        let outcome = match_event(&pattern, &Event::user_said("hi"), &Params::new()).unwrap();
        assert_eq!(outcome.specificity(), 0);
        let bindings = outcome.into_bindings().unwrap();
        assert_eq!(bindings["utterance"], Value::from("hi"));
    }

    #[test]
    fn literal_constraint_scores() {
        let pattern = EventPattern::new("UserSaid").with("text", "hi");
        let hit = match_event(&pattern, &Event::user_said("hi"), &Params::new()).unwrap();
        assert_eq!(hit, MatchOutcome::MatchWithScore(Params::new(), 1));
        let miss = match_event(&pattern, &Event::user_said("hello"), &Params::new()).unwrap();
        assert!(!miss.is_match());
    }

    #[test]
    fn missing_parameter_does_not_match() {
        let pattern = EventPattern::new("UserSaid").with("speaker", "ada");
        let outcome = match_event(&pattern, &Event::user_said("hi"), &Params::new()).unwrap();
        assert!(!outcome.is_match());
    }

    #[test]
    fn variable_constraint_resolves_in_scope() {
        let pattern = EventPattern::new("UserSaid").with("text", "$expected");
        let vars = scope(&[("expected", "yes")]);
        assert!(
            match_event(&pattern, &Event::user_said("yes"), &vars)
                .unwrap()
                .is_match()
        );
        assert!(
            !match_event(&pattern, &Event::user_said("no"), &vars)
                .unwrap()
                .is_match()
        );
    }

    #[test]
    fn unbound_variable_is_pattern_error() {
        let pattern = EventPattern::new("UserSaid").with("text", "$expected");
        let err = match_event(&pattern, &Event::user_said("yes"), &Params::new()).unwrap_err();
        assert!(matches!(err, FlowError::Pattern(_)));
    }

    #[test]
    fn missing_capture_binds_null() {
        let pattern = EventPattern::new("UserSaid").capture("confidence", "score");
        let bindings = match_event(&pattern, &Event::user_said("hi"), &Params::new())
            .unwrap()
            .into_bindings()
            .unwrap();
        assert_eq!(bindings["score"], Value::Null);
    }

    #[test]
    fn rebinding_parameter_conflicts() {
        let locals = scope(&[("name", "ada"), ("scratch", "x")]);
        let is_param = |n: &str| n == "name";

        let same = scope(&[("name", "ada")]);
        assert!(check_bindings(&locals, &same, is_param).is_ok());

        let other_local = scope(&[("scratch", "y")]);
        assert!(check_bindings(&locals, &other_local, is_param).is_ok());

        let conflict = scope(&[("name", "bob")]);
        let err = check_bindings(&locals, &conflict, is_param).unwrap_err();
        assert!(matches!(err, FlowError::BindingConflict { name, .. } if name == "name"));
    }

    #[test]
    fn null_parameter_can_be_bound() {
        let mut locals = Params::new();
        locals.insert("name".into(), Value::Null);
        let incoming = scope(&[("name", "bob")]);
        assert!(check_bindings(&locals, &incoming, |n| n == "name").is_ok());
    }
}
