// THEORY:
// Navigation is an external collaborator. Missions describe motion as
// `NavCommand`s, wrap them in a `NavRoutine` (optionally with an on-done
// callback) and hand them to whatever `Navigator` the vehicle provides. The
// mission loop imposes nothing beyond "issued routines are attempted in issue
// order"; it never waits on the actuator.
//
// `CommandLog` is the in-process navigator used for dry runs and tests. It
// records everything it was asked to do and reports routines done either on
// demand or immediately.

use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;
use tracing::debug;

/// A composable motion command.
#[derive(Debug, Clone, PartialEq)]
pub enum NavCommand {
    /// Surge at `speed` in [-1, 1], optionally for a fixed time.
    Forward { speed: f64, duration: Option<Duration> },
    /// Sway at `speed` in [-1, 1], positive to starboard.
    Strafe { speed: f64 },
    /// Turn by `degrees` relative to the current heading.
    RelativeYaw { degrees: f64 },
    /// Keep the current heading.
    HoldYaw,
    SetDepth { depth: f64 },
    Stop,
    /// Run all parts together as one routine.
    Compound(Vec<NavCommand>),
}

impl NavCommand {
    pub fn forward(speed: f64) -> Self {
        Self::Forward { speed, duration: None }
    }

    pub fn forward_for(speed: f64, duration: Duration) -> Self {
        Self::Forward {
            speed,
            duration: Some(duration),
        }
    }

    pub fn compound(parts: impl IntoIterator<Item = NavCommand>) -> Self {
        Self::Compound(parts.into_iter().collect())
    }

    /// True if this command or any compound part satisfies `predicate`.
    pub fn contains(&self, predicate: &impl Fn(&NavCommand) -> bool) -> bool {
        match self {
            Self::Compound(parts) => predicate(self) || parts.iter().any(|p| p.contains(predicate)),
            other => predicate(other),
        }
    }
}

/// Invoked once the actuator reports a routine finished.
pub type DoneCallback = Box<dyn FnOnce()>;

/// A command plus what to do when it is done.
pub struct NavRoutine {
    pub command: NavCommand,
    on_done: Option<DoneCallback>,
}

impl NavRoutine {
    pub fn new(command: NavCommand) -> Self {
        Self {
            command,
            on_done: None,
        }
    }

    pub fn on_done(mut self, callback: impl FnOnce() + 'static) -> Self {
        self.on_done = Some(Box::new(callback));
        self
    }

    /// Consumes the routine, running its on-done callback.
    pub fn complete(self) -> NavCommand {
        if let Some(callback) = self.on_done {
            callback();
        }
        self.command
    }
}

impl From<NavCommand> for NavRoutine {
    fn from(command: NavCommand) -> Self {
        Self::new(command)
    }
}

impl fmt::Debug for NavRoutine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NavRoutine")
            .field("command", &self.command)
            .field("on_done", &self.on_done.is_some())
            .finish()
    }
}

/// The motion actuator boundary. Fire and forget.
pub trait Navigator {
    fn issue(&mut self, routine: NavRoutine);
}

/// Records issued commands in order.
#[derive(Debug, Default)]
pub struct CommandLog {
    issued: Vec<NavCommand>,
    pending: VecDeque<NavRoutine>,
    auto_complete: bool,
}

impl CommandLog {
    /// Routines stay pending until `complete_next` / `complete_all`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Every routine is reported done as soon as it is issued.
    pub fn auto_completing() -> Self {
        Self {
            auto_complete: true,
            ..Self::default()
        }
    }

    pub fn issued(&self) -> &[NavCommand] {
        &self.issued
    }

    pub fn last(&self) -> Option<&NavCommand> {
        self.issued.last()
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Reports the oldest pending routine done.
    pub fn complete_next(&mut self) -> Option<NavCommand> {
        self.pending.pop_front().map(NavRoutine::complete)
    }

    pub fn complete_all(&mut self) -> usize {
        let mut completed = 0;
        while self.complete_next().is_some() {
            completed += 1;
        }
        completed
    }
}

impl Navigator for CommandLog {
    fn issue(&mut self, routine: NavRoutine) {
        debug!(command = ?routine.command, "nav routine issued");
        self.issued.push(routine.command.clone());
        if self.auto_complete {
            routine.complete();
        } else {
            self.pending.push_back(routine);
        }
    }
}
