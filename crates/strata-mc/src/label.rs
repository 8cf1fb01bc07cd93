//! Edge labels.

use std::cmp::Ordering;
use std::fmt;

use strata_vm::{Choice, Context, Interrupt};

/// What happened along one transition.
///
/// Labels are ordered and compared by everything except the trace text.
#[derive(Debug, Clone, Default)]
pub struct Label {
    /// Trace lines emitted by the run, faults included.
    pub trace: Vec<String>,
    /// Choices the run took.
    pub stack: Vec<Choice>,
    pub interrupts: Vec<Interrupt>,
    pub accepting: bool,
    /// The run faulted.
    pub error: bool,
}

impl Label {
    /// The label of the run that just finished in `ctx`.
    pub fn from_context(ctx: &Context) -> Self {
        Self {
            trace: ctx.trace_lines().to_vec(),
            stack: ctx.consumed().to_vec(),
            interrupts: ctx.interrupts().to_vec(),
            accepting: ctx.is_accepting(),
            error: ctx.is_error(),
        }
    }

    fn key(&self) -> (&[Choice], &[Interrupt], bool, bool) {
        (&self.stack, &self.interrupts, self.accepting, self.error)
    }
}

impl PartialEq for Label {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for Label {}

impl PartialOrd for Label {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Label {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, c) in self.stack.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{}/{}", c.taken, c.total)?;
        }
        write!(f, "]")?;
        if self.error {
            write!(f, " error")?;
        }
        if self.accepting {
            write!(f, " accepting")?;
        }
        for line in &self.trace {
            write!(f, "\n  {line}")?;
        }
        Ok(())
    }
}
