use crate::core_modules::control::MissionControl;
use crate::core_modules::mission::{Mission, Observation};
use std::collections::BTreeSet;
use tracing::info;

/// Logs every confirmed object on one channel. Never ends on its own; stop it
/// with a reset.
#[derive(Debug)]
pub struct SearchMission {
    channel: String,
    reported: BTreeSet<u64>,
    sightings: u64,
}

impl SearchMission {
    pub fn new(channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            reported: BTreeSet::new(),
            sightings: 0,
        }
    }

    /// Ids of every object confirmed so far.
    pub fn reported(&self) -> &BTreeSet<u64> {
        &self.reported
    }

    pub fn sightings(&self) -> u64 {
        self.sightings
    }
}

impl Mission for SearchMission {
    fn name(&self) -> &str {
        "search"
    }

    fn step(&mut self, _control: &mut MissionControl<Self>, observation: Option<&Observation>) {
        let Some(objects) = observation.and_then(|o| o.channel(&self.channel)) else {
            return;
        };
        for object in objects {
            self.sightings += 1;
            let first = self.reported.insert(object.id);
            info!(
                channel = %self.channel,
                track_id = object.id,
                x = object.center().x,
                y = object.center().y,
                seen_count = object.seen_count,
                first,
                "object in view"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::control::ResetSignal;
    use crate::core_modules::detection::{Detection, DetectionBatch};
    use crate::core_modules::perception::ChannelPerception;
    use crate::core_modules::tracker::TrackerConfig;
    use crate::scheduler::{MissionOutcome, MissionScheduler, SchedulerConfig};
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn reports_confirmed_objects_until_reset() {
        let (feed, perception) = ChannelPerception::new(8);
        let reset = ResetSignal::new();
        let config = SchedulerConfig::default().with_channel("buoy", TrackerConfig::default());
        let mut scheduler =
            MissionScheduler::new(SearchMission::new("buoy"), perception, reset.clone(), config).expect("valid config");

        for _ in 0..4 {
            feed.try_send(DetectionBatch::new().with_channel("buoy", vec![Detection::at(40.0, 12.0)]))
                .expect("buffer has room");
        }
        let operator = reset.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            operator.trigger();
        });

        assert_eq!(scheduler.run().await, MissionOutcome::Reset);
        let mission = scheduler.mission();
        assert_eq!(mission.reported().len(), 1);
        assert_eq!(mission.sightings(), 3);
    }
}
