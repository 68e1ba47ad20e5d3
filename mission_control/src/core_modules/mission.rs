use crate::core_modules::control::MissionControl;
use crate::core_modules::tracker::TrackedObject;
use std::collections::BTreeMap;
use tokio::time::Instant;

/// The confirmed objects of one cycle, per channel. Only channels that
/// reported in this cycle's batch are present.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub captured_at: Instant,
    channels: BTreeMap<String, Vec<TrackedObject>>,
}

impl Observation {
    pub fn new(captured_at: Instant) -> Self {
        Self {
            captured_at,
            channels: BTreeMap::new(),
        }
    }

    pub fn with_channel(mut self, channel: impl Into<String>, objects: Vec<TrackedObject>) -> Self {
        self.insert(channel, objects);
        self
    }

    pub fn insert(&mut self, channel: impl Into<String>, objects: Vec<TrackedObject>) {
        self.channels.insert(channel.into(), objects);
    }

    pub fn channel(&self, channel: &str) -> Option<&[TrackedObject]> {
        self.channels.get(channel).map(Vec::as_slice)
    }

    pub fn channels(&self) -> impl Iterator<Item = (&str, &[TrackedObject])> {
        self.channels.iter().map(|(name, objects)| (name.as_str(), objects.as_slice()))
    }

    /// Number of confirmed objects across every channel.
    pub fn confirmed_count(&self) -> usize {
        self.channels.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}

/// A behavior driven once per cycle by the scheduler.
///
/// `step` receives `Some` when a batch arrived this cycle and `None` otherwise.
/// A mission must not assume `step` runs at a fixed rate, or that a `None` means
/// the target is gone; it only means no sample arrived in time. Completion is
/// signalled through the control surface (`finish_mission` / `fail_mission`),
/// either directly or from a timer or navigation callback.
pub trait Mission: Sized {
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    /// Called once before the first cycle. An error ends the run as a failure.
    fn init(&mut self, _control: &mut MissionControl<Self>) -> anyhow::Result<()> {
        Ok(())
    }

    fn step(&mut self, control: &mut MissionControl<Self>, observation: Option<&Observation>);
}
