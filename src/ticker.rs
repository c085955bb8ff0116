use chrono::{DateTime, NaiveTime, TimeDelta, Timelike, Utc};
use std::time::Duration;
use tokio::time::{Instant, Interval, MissedTickBehavior, interval_at, sleep};
use tracing::info;

/// Next occurrence of `at` (UTC time of day) strictly after `now`.
pub fn next_daily_fire(at: NaiveTime, now: DateTime<Utc>) -> DateTime<Utc> {
    let today = now.date_naive().and_time(at).and_utc();
    if today > now {
        today
    } else {
        today + TimeDelta::days(1)
    }
}

/// Fires once a day at a fixed UTC wall-clock time. The next fire time is
/// recomputed after every fire, so drift never accumulates.
#[derive(Debug, Clone, Copy)]
pub struct RefundTicker {
    at: NaiveTime,
    last_fire: Option<DateTime<Utc>>,
}

impl RefundTicker {
    /// Keeps only the hour, minute and second of `at`.
    pub fn new(at: DateTime<Utc>) -> Self {
        let time = at.time();
        RefundTicker {
            at: time.with_nanosecond(0).unwrap_or(time),
            last_fire: None,
        }
    }

    /// Strictly after both `now` and the previous fire, so a sleep that
    /// wakes early never fires the same slot twice.
    pub fn next_fire(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let from = match self.last_fire {
            Some(fired) if fired > now => fired,
            _ => now,
        };
        next_daily_fire(self.at, from)
    }

    pub async fn tick(&mut self) {
        let now = Utc::now();
        let next = self.next_fire(now);
        info!("Next refund cycle at {}", next);
        sleep((next - now).to_std().unwrap_or_default()).await;
        self.last_fire = Some(next);
    }
}

/// Fixed-period trigger whose first tick is one period after start.
pub fn crawler_interval(period: Duration) -> Interval {
    let mut interval = interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}
