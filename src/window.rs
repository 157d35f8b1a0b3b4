use std::time::{Duration, SystemTime};

/// Seconds since the epoch. All window math happens on wall-clock seconds so
/// that every controller instance derives the same window boundaries.
pub fn epoch_now() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

pub fn window_index(now: u64, window_length: Duration) -> u64 {
    now / window_length.as_secs().max(1)
}

pub fn window_start(index: u64, window_length: Duration) -> u64 {
    index * window_length.as_secs().max(1)
}

#[derive(Debug, PartialEq, Eq)]
pub enum Tick {
    Time { now: u64, window_index: u64 },
    Cancelled,
}

/// The inner driver of the worker loop: reports wall-clock time and the
/// current window index once per tick period, or `Cancelled` once the cancel
/// signal has been raised. Each tick recomputes from the wall clock, so a
/// busy cycle delays ticks without ever skewing window alignment.
pub struct Ticker {
    interval: tokio::time::Interval,
    cancel: tokio::sync::watch::Receiver<bool>,
    window_length: Duration,
}

impl Ticker {
    pub fn new(
        tick_period: Duration,
        window_length: Duration,
        cancel: tokio::sync::watch::Receiver<bool>,
    ) -> Ticker {
        let mut interval = tokio::time::interval(tick_period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        Ticker {
            interval,
            cancel,
            window_length,
        }
    }

    pub async fn tick(&mut self) -> Tick {
        if *self.cancel.borrow() {
            return Tick::Cancelled;
        }
        tokio::select! {
            _ = self.interval.tick() => {
                let now = epoch_now();
                Tick::Time {
                    now,
                    window_index: window_index(now, self.window_length),
                }
            }
            _ = self.cancel.changed() => Tick::Cancelled,
        }
    }
}
