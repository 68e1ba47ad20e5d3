// THEORY:
// The `timer` module is the mission loop's notion of "later". A mission names a
// timer, gives it a delay and a callback, and the registry fires it on the
// first tick at or after its deadline.
//
// Key architectural principles:
// 1.  **Named, One-Shot Entries**: Names are unique keys. Setting a name that
//     already exists replaces the old entry. An entry is destroyed the moment it
//     fires; periodic behavior is built by a callback re-registering itself.
// 2.  **Remove, Then Invoke**: The registry only hands out entries it has already
//     removed, so a callback is always free to set a timer under its own name.
// 3.  **Bounded Ticks**: Entries registered while a tick is in progress carry a
//     sequence number past the tick's watermark and wait for the next tick, so
//     a zero-delay periodic timer cannot spin a single tick forever.
//
// The firing loop itself lives on `MissionControl::tick`, which owns the
// registry and is what callbacks receive.

use crate::core_modules::control::MissionControl;
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

/// About thirty years. A deadline this far out never comes due.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// `now + delay`, or a deadline that never comes due if that overflows.
pub(crate) fn deadline_after(now: Instant, delay: Duration) -> Instant {
    now.checked_add(delay).unwrap_or_else(|| now + FAR_FUTURE)
}

/// A timer callback. It receives the mission and its control surface, so it can
/// finish or fail the mission and register further timers.
pub type TimerCallback<M> = Box<dyn FnOnce(&mut M, &mut MissionControl<M>) -> anyhow::Result<()>>;

struct Timer<M> {
    deadline: Instant,
    seq: u64,
    callback: TimerCallback<M>,
}

/// Mapping from name to (deadline, callback).
pub struct TimerRegistry<M> {
    timers: HashMap<String, Timer<M>>,
    next_seq: u64,
}

impl<M> TimerRegistry<M> {
    pub fn new() -> Self {
        Self {
            timers: HashMap::new(),
            next_seq: 0,
        }
    }

    /// Creates or replaces the entry called `name`.
    pub fn set(&mut self, name: impl Into<String>, deadline: Instant, callback: TimerCallback<M>) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.timers.insert(
            name.into(),
            Timer {
                deadline,
                seq,
                callback,
            },
        );
    }

    /// Removes the entry called `name`. Returns whether one existed.
    pub fn cancel(&mut self, name: &str) -> bool {
        self.timers.remove(name).is_some()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.timers.contains_key(name)
    }

    pub fn deadline(&self, name: &str) -> Option<Instant> {
        self.timers.get(name).map(|t| t.deadline)
    }

    pub fn len(&self) -> usize {
        self.timers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }

    /// Sequence number the next registration will get. Entries at or past the
    /// watermark taken at the start of a tick are not eligible in that tick.
    pub(crate) fn watermark(&self) -> u64 {
        self.next_seq
    }

    /// Removes and returns the earliest entry that is due at `now` and was
    /// registered before `watermark`. Ties on deadline go to the older entry.
    pub(crate) fn take_due(&mut self, now: Instant, watermark: u64) -> Option<(String, TimerCallback<M>)> {
        let name = self
            .timers
            .iter()
            .filter(|(_, t)| t.deadline <= now && t.seq < watermark)
            .min_by_key(|(_, t)| (t.deadline, t.seq))
            .map(|(name, _)| name.clone())?;
        self.timers
            .remove(&name)
            .map(|timer| (name, timer.callback))
    }
}

impl<M> Default for TimerRegistry<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M> fmt::Debug for TimerRegistry<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.timers.iter().map(|(name, t)| (name, t.deadline)))
            .finish()
    }
}
