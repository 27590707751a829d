//! Variable resolution for a running instance.

use parley_core::{Params, Value};
use parley_flow::Lookup;

/// Flow locals layered over the session context.
pub struct Scope<'a> {
    pub locals: &'a Params,
    pub context: &'a Params,
}

impl<'a> Scope<'a> {
    pub fn new(locals: &'a Params, context: &'a Params) -> Self {
        Self { locals, context }
    }
}

impl Lookup for Scope<'_> {
    fn lookup(&self, name: &str) -> Option<&Value> {
        self.locals.get(name).or_else(|| self.context.get(name))
    }
}
