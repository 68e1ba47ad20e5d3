// THEORY:
// `MissionControl` is everything a mission is allowed to touch besides its own
// state and the outside actuators: the timer registry, the completion flag and
// the entity-timeout declaration. The scheduler owns one per run and lends it
// to `init`, to every `step`, and to every timer callback.
//
// Completion is a shared flag rather than a return value. `finish_mission` and
// `fail_mission` only record the decision; the scheduler reads it at the end of
// the cycle. That way "decided to stop" can happen inside `step`, inside a timer
// callback, or inside a navigation on-done callback holding a cloned
// `CompletionHandle`, and all three look the same to the loop.

use crate::core_modules::timer::{self, TimerRegistry};
use std::any::Any;
use std::cell::Cell;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{trace, warn};

/// Cloneable handle to a run's completion flag. The first signal wins; later
/// calls are ignored.
#[derive(Debug, Clone, Default)]
pub struct CompletionHandle {
    outcome: Rc<Cell<Option<bool>>>,
}

impl CompletionHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn finish(&self) {
        self.settle(true);
    }

    pub fn fail(&self) {
        self.settle(false);
    }

    fn settle(&self, success: bool) {
        if self.outcome.get().is_none() {
            self.outcome.set(Some(success));
        }
    }

    /// `Some(success)` once either `finish` or `fail` was called.
    pub fn outcome(&self) -> Option<bool> {
        self.outcome.get()
    }

    pub fn is_settled(&self) -> bool {
        self.outcome.get().is_some()
    }
}

/// Externally owned abort flag, read once per cycle. Safe to trigger from any
/// thread (an operator console, a signal handler).
#[derive(Debug, Clone, Default)]
pub struct ResetSignal {
    flag: Arc<AtomicBool>,
}

impl ResetSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn clear(&self) {
        self.flag.store(false, Ordering::Release);
    }

    pub fn is_set(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

/// A timer callback that returned an error or panicked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerFailure {
    pub name: String,
    pub reason: String,
}

/// Result of one `tick`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub fired: usize,
    pub failures: Vec<TimerFailure>,
}

/// The control surface handed to a mission of type `M`.
pub struct MissionControl<M> {
    timers: TimerRegistry<M>,
    completion: CompletionHandle,
    entity_timeout: Option<Duration>,
}

impl<M> MissionControl<M> {
    pub fn new() -> Self {
        Self {
            timers: TimerRegistry::new(),
            completion: CompletionHandle::new(),
            entity_timeout: None,
        }
    }

    /// Registers `callback` to run `delay` from now, replacing any timer with
    /// the same name. Arguments travel in the closure's captures. A delay too
    /// large to represent leaves the timer pending for the life of the run.
    pub fn set_timer<F>(&mut self, name: impl Into<String>, delay: Duration, callback: F)
    where
        F: FnOnce(&mut M, &mut MissionControl<M>) -> anyhow::Result<()> + 'static,
    {
        self.timers.set(name, timer::deadline_after(Instant::now(), delay), Box::new(callback));
    }

    /// Removes the named timer. Missing names are fine.
    pub fn delete_timer(&mut self, name: &str) {
        self.timers.cancel(name);
    }

    pub fn has_timer(&self, name: &str) -> bool {
        self.timers.contains(name)
    }

    pub fn timers(&self) -> &TimerRegistry<M> {
        &self.timers
    }

    pub fn finish_mission(&self) {
        self.completion.finish();
    }

    pub fn fail_mission(&self) {
        self.completion.fail();
    }

    /// A handle that can be moved into callbacks outliving this borrow.
    pub fn completion(&self) -> CompletionHandle {
        self.completion.clone()
    }

    pub fn outcome(&self) -> Option<bool> {
        self.completion.outcome()
    }

    /// While set, cycles without a sample only reach `step(None)` once per
    /// elapsed `timeout`.
    pub fn set_entity_timeout(&mut self, timeout: Option<Duration>) {
        self.entity_timeout = timeout;
    }

    pub fn entity_timeout(&self) -> Option<Duration> {
        self.entity_timeout
    }

    /// Fires every timer due at `now`. Each entry is removed before its
    /// callback runs. A callback that errors or panics is logged and reported;
    /// the remaining timers still fire.
    pub fn tick(&mut self, mission: &mut M, now: Instant) -> TickReport {
        let watermark = self.timers.watermark();
        let mut report = TickReport::default();

        while let Some((name, callback)) = self.timers.take_due(now, watermark) {
            trace!(timer = %name, "timer fired");
            report.fired += 1;

            let reason = match panic::catch_unwind(AssertUnwindSafe(|| callback(&mut *mission, &mut *self))) {
                Ok(Ok(())) => continue,
                Ok(Err(err)) => format!("{err:#}"),
                Err(payload) => format!("panicked: {}", panic_message(payload.as_ref())),
            };
            warn!(timer = %name, %reason, "timer callback failed");
            report.failures.push(TimerFailure { name, reason });
        }

        report
    }
}

impl<M> Default for MissionControl<M> {
    fn default() -> Self {
        Self::new()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        calls: Vec<String>,
    }

    fn record(arg: &'static str) -> impl FnOnce(&mut Recorder, &mut MissionControl<Recorder>) -> anyhow::Result<()> {
        move |recorder: &mut Recorder, _: &mut MissionControl<Recorder>| {
            recorder.calls.push(arg.to_owned());
            Ok(())
        }
    }

    fn heartbeat(recorder: &mut Recorder, control: &mut MissionControl<Recorder>) -> anyhow::Result<()> {
        recorder.calls.push("beat".to_owned());
        control.set_timer("beat", Duration::ZERO, heartbeat);
        Ok(())
    }

    #[test]
    fn timer_fires_once_then_is_gone() {
        let mut control: MissionControl<Recorder> = MissionControl::new();
        let mut recorder = Recorder::default();
        control.set_timer("x", Duration::from_secs(1), record("a"));

        let later = Instant::now() + Duration::from_millis(1500);
        let report = control.tick(&mut recorder, later);
        assert_eq!(report.fired, 1);
        assert_eq!(recorder.calls, ["a"]);
        assert!(!control.has_timer("x"));

        let report = control.tick(&mut recorder, later + Duration::from_secs(10));
        assert_eq!(report.fired, 0);
        assert_eq!(recorder.calls, ["a"]);
    }

    #[test]
    fn timer_not_due_does_not_fire() {
        let mut control: MissionControl<Recorder> = MissionControl::new();
        let mut recorder = Recorder::default();
        control.set_timer("x", Duration::from_secs(60), record("a"));
        assert_eq!(control.tick(&mut recorder, Instant::now()).fired, 0);
        assert!(control.has_timer("x"));
    }

    #[test]
    fn unrepresentable_delay_never_fires() {
        let mut control: MissionControl<Recorder> = MissionControl::new();
        let mut recorder = Recorder::default();
        control.set_timer("x", Duration::MAX, record("a"));

        let next_year = Instant::now() + Duration::from_secs(86_400 * 365);
        assert_eq!(control.tick(&mut recorder, next_year).fired, 0);
        assert!(control.has_timer("x"));
        assert!(recorder.calls.is_empty());
    }

    #[test]
    fn delete_missing_timer_is_a_noop() {
        let mut control: MissionControl<Recorder> = MissionControl::new();
        control.delete_timer("ghost");
        control.delete_timer("ghost");
        assert!(control.timers().is_empty());
    }

    #[test]
    fn failing_callbacks_do_not_stop_the_tick() {
        let mut control: MissionControl<Recorder> = MissionControl::new();
        let mut recorder = Recorder::default();
        control.set_timer("err", Duration::ZERO, |_, _| anyhow::bail!("sonar offline"));
        control.set_timer("panic", Duration::ZERO, |_, _| panic!("bad math"));
        control.set_timer("ok", Duration::ZERO, record("ok"));

        let report = control.tick(&mut recorder, Instant::now() + Duration::from_millis(1));
        assert_eq!(report.fired, 3);
        assert_eq!(recorder.calls, ["ok"]);
        let failed: Vec<&str> = report.failures.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(failed, ["err", "panic"]);
        assert!(report.failures[0].reason.contains("sonar offline"));
        assert!(report.failures[1].reason.contains("bad math"));
    }

    #[test]
    fn periodic_timer_fires_once_per_tick() {
        let mut control: MissionControl<Recorder> = MissionControl::new();
        let mut recorder = Recorder::default();
        control.set_timer("beat", Duration::ZERO, heartbeat);

        let now = Instant::now() + Duration::from_millis(1);
        control.tick(&mut recorder, now);
        assert_eq!(recorder.calls.len(), 1);
        assert!(control.has_timer("beat"));

        control.tick(&mut recorder, now + Duration::from_millis(1));
        assert_eq!(recorder.calls.len(), 2);
    }

    #[test]
    fn callback_can_cancel_a_timer_due_in_the_same_tick() {
        let mut control: MissionControl<Recorder> = MissionControl::new();
        let mut recorder = Recorder::default();
        control.set_timer("first", Duration::ZERO, |recorder: &mut Recorder, control: &mut MissionControl<Recorder>| {
            recorder.calls.push("first".to_owned());
            control.delete_timer("second");
            Ok(())
        });
        control.set_timer("second", Duration::from_millis(1), record("second"));

        control.tick(&mut recorder, Instant::now() + Duration::from_millis(5));
        assert_eq!(recorder.calls, ["first"]);
        assert!(control.timers().is_empty());
    }

    #[test]
    fn callbacks_can_complete_the_mission() {
        let mut control: MissionControl<Recorder> = MissionControl::new();
        let mut recorder = Recorder::default();
        control.set_timer("done", Duration::ZERO, |_, control| {
            control.finish_mission();
            Ok(())
        });
        assert_eq!(control.outcome(), None);
        control.tick(&mut recorder, Instant::now() + Duration::from_millis(1));
        assert_eq!(control.outcome(), Some(true));
    }

    #[test]
    fn first_completion_signal_wins() {
        let handle = CompletionHandle::new();
        let clone = handle.clone();
        clone.fail();
        handle.finish();
        assert_eq!(handle.outcome(), Some(false));
        assert!(clone.is_settled());
    }

    #[test]
    fn reset_signal_is_shared_between_clones() {
        let reset = ResetSignal::new();
        let operator = reset.clone();
        assert!(!reset.is_set());
        std::thread::spawn(move || operator.trigger())
            .join()
            .expect("operator thread");
        assert!(reset.is_set());
        reset.clear();
        assert!(!reset.is_set());
    }
}
