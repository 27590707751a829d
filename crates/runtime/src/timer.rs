//! Deadlines for `wait_any` timeouts.

use parley_core::{InstanceId, TimerId};
use std::collections::BTreeMap;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy)]
struct Timer {
    deadline: Instant,
    instance: InstanceId,
}

/// Armed timers of one session.
#[derive(Debug, Default)]
pub struct TimerSet {
    timers: BTreeMap<TimerId, Timer>,
    next_id: u64,
}

impl TimerSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arm(&mut self, deadline: Instant, instance: InstanceId) -> TimerId {
        self.next_id += 1;
        let id = TimerId(self.next_id);
        self.timers.insert(id, Timer { deadline, instance });
        id
    }

    pub fn cancel(&mut self, id: TimerId) -> bool {
        self.timers.remove(&id).is_some()
    }

    /// Remove and return timers due at `now`, earliest deadline first.
    pub fn take_due(&mut self, now: Instant) -> Vec<(TimerId, InstanceId)> {
        let mut due: Vec<(Instant, TimerId, InstanceId)> = self
            .timers
            .iter()
            .filter(|(_, t)| t.deadline <= now)
            .map(|(id, t)| (t.deadline, *id, t.instance))
            .collect();
        due.sort();
        for (_, id, _) in &due {
            self.timers.remove(id);
        }
        due.into_iter().map(|(_, id, instance)| (id, instance)).collect()
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.values().map(|t| t.deadline).min()
    }

    pub fn len(&self) -> usize {
        self.timers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }

    pub fn clear(&mut self) {
        self.timers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn due_timers_come_out_in_deadline_order() {
        let now = Instant::now();
        let mut timers = TimerSet::new();
        let late = timers.arm(now + Duration::from_secs(12), InstanceId(1));
        let early = timers.arm(now + Duration::from_secs(5), InstanceId(2));
        let future = timers.arm(now + Duration::from_secs(60), InstanceId(3));

        assert_eq!(timers.next_deadline(), Some(now + Duration::from_secs(5)));
        assert!(timers.take_due(now).is_empty());

        let due = timers.take_due(now + Duration::from_secs(12));
        assert_eq!(due, vec![(early, InstanceId(2)), (late, InstanceId(1))]);
        assert_eq!(timers.len(), 1);
        assert!(timers.cancel(future));
        assert!(!timers.cancel(future));
        assert!(timers.is_empty());
        assert_eq!(timers.next_deadline(), None);
    }
}
