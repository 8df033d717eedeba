//! Timer calling a callback a fixed number of times.
//!
//! The timer does not run on its own. Its owner awaits
//! [`MultiShotTimer::next_deadline`] and then calls [`MultiShotTimer::poll`]
//! which fires the due callback. The first call is due immediately when the
//! timer is started, every further call one interval after the previous one.

use embassy_time::{Duration, Instant};

/// Called with the timer, the owner supplied argument and the number of
/// the current call, starting at 1.
pub type TimerCallback<A> = fn(&mut MultiShotTimer<A>, &mut A, u32);

pub struct MultiShotTimer<A> {
    callback: Option<TimerCallback<A>>,
    interval: Duration,
    repeats: u32,
    count: u32,
    deadline: Option<Instant>,
}

impl<A> MultiShotTimer<A> {
    pub const fn new() -> Self {
        Self {
            callback: None,
            interval: Duration::from_ticks(0),
            repeats: 0,
            count: 0,
            deadline: None,
        }
    }

    /// Attaches `callback` to be fired `repeats` times, `interval` apart,
    /// and starts the timer. Replaces any running schedule.
    pub fn schedule(
        &mut self,
        now: Instant,
        interval: Duration,
        repeats: u32,
        callback: TimerCallback<A>,
    ) {
        self.callback = Some(callback);
        self.interval = interval;
        self.repeats = repeats;
        self.reset();
        self.start(now);
    }

    /// Restarts the attached schedule from its current count.
    pub fn start(&mut self, now: Instant) {
        if self.callback.is_some() && self.count < self.repeats {
            self.deadline = Some(now);
        }
    }

    /// Stops without resetting the call count.
    pub fn stop(&mut self) {
        self.deadline = None;
    }

    pub fn reset(&mut self) {
        self.deadline = None;
        self.count = 0;
    }

    pub fn is_active(&self) -> bool {
        self.deadline.is_some()
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Fires the callback if a call is due. Returns whether it fired; at
    /// most one call is made per poll.
    pub fn poll(&mut self, now: Instant, arg: &mut A) -> bool {
        let (Some(deadline), Some(callback)) = (self.deadline, self.callback) else {
            return false;
        };
        if now < deadline {
            return false;
        }
        self.count = self.count.wrapping_add(1);
        self.deadline = if self.count >= self.repeats {
            None
        } else {
            Some(deadline + self.interval)
        };
        let count = self.count;
        callback(self, arg, count);
        true
    }
}

impl<A> Default for MultiShotTimer<A> {
    fn default() -> Self {
        Self::new()
    }
}
