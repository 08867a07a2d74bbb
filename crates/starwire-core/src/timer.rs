/*!
 * Cooperative timer scheduling.
 *
 * A [`Scheduler`] holds one-shot timers for a single device. It never runs
 * anything by itself: the reactor asks for the next deadline, sleeps until
 * then while still servicing messages, and takes the due entries back to
 * dispatch them on the device thread. Recurring work re-arms from its own
 * hit handler.
 */
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::time::Duration;

use tokio::time::Instant;
use tracing::trace;

/// Residuals shorter than this are busy-waited instead of scheduled
pub const SPIN_THRESHOLD: Duration = Duration::from_millis(50);

/// Remaining time at or below which a deadline counts as reached
pub const DEADLINE_EPSILON: Duration = Duration::from_millis(1);

/// Opaque handle to a pending timer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

impl fmt::Display for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "timer#{}", self.0)
    }
}

/// One-shot timer queue
///
/// `T` is the tag handed back when the timer fires; devices use it to tell
/// their timers apart.
#[derive(Debug)]
pub struct Scheduler<T> {
    next_id: u64,
    queue: BTreeMap<(Instant, TimerId), T>,
    deadlines: HashMap<TimerId, Instant>,
}

impl<T> Scheduler<T> {
    /// Create an empty scheduler
    pub fn new() -> Self {
        Self {
            next_id: 1,
            queue: BTreeMap::new(),
            deadlines: HashMap::new(),
        }
    }

    /// Schedule `tag` to fire once after `delay`
    pub fn set_timer(&mut self, delay: Duration, tag: T) -> TimerId {
        self.set_timer_at(Instant::now() + delay, tag)
    }

    /// Schedule `tag` to fire once at `deadline`
    pub fn set_timer_at(&mut self, deadline: Instant, tag: T) -> TimerId {
        let id = TimerId(self.next_id);
        self.next_id += 1;
        self.queue.insert((deadline, id), tag);
        self.deadlines.insert(id, deadline);
        trace!("Armed {}", id);
        id
    }

    /// Cancel a pending timer
    ///
    /// Returns `false` when the timer already fired or was already removed.
    pub fn remove_timer(&mut self, id: TimerId) -> bool {
        match self.deadlines.remove(&id) {
            Some(deadline) => {
                self.queue.remove(&(deadline, id));
                trace!("Removed {}", id);
                true
            }
            None => false,
        }
    }

    /// Whether `id` is still pending
    pub fn is_pending(&self, id: TimerId) -> bool {
        self.deadlines.contains_key(&id)
    }

    /// Earliest pending deadline
    pub fn next_deadline(&self) -> Option<Instant> {
        self.queue.keys().next().map(|(deadline, _)| *deadline)
    }

    /// Remove and return every timer due at `now`, earliest first
    ///
    /// Timers armed while the returned tags are being handled are not part
    /// of this batch, even with a zero delay.
    pub fn take_due(&mut self, now: Instant) -> Vec<(TimerId, T)> {
        let mut due = Vec::new();
        while let Some(entry) = self.queue.first_entry() {
            if entry.key().0 > now {
                break;
            }
            let ((_, id), tag) = entry.remove_entry();
            self.deadlines.remove(&id);
            due.push((id, tag));
        }
        due
    }

    /// Cancel everything
    pub fn clear(&mut self) {
        self.queue.clear();
        self.deadlines.clear();
    }

    /// Number of pending timers
    pub fn len(&self) -> usize {
        self.deadlines.len()
    }

    /// Whether no timer is pending
    pub fn is_empty(&self) -> bool {
        self.deadlines.is_empty()
    }
}

impl<T> Default for Scheduler<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// What a poller should do next while waiting for a deadline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeadlineStep {
    /// The deadline has been reached
    Done,
    /// Re-arm a timer for this long
    WaitFor(Duration),
    /// The residual is too short to schedule; busy-wait it
    Spin(Duration),
}

/// Completion tracking for short timed operations such as guide pulses
///
/// The wait requested from the scheduler shrinks as the deadline nears so
/// that timer jitter cannot overshoot it, and only a residual under
/// [`SPIN_THRESHOLD`] is spun away.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    end: Instant,
}

impl Deadline {
    /// A deadline `duration` from now
    pub fn after(duration: Duration) -> Self {
        Self {
            end: Instant::now() + duration,
        }
    }

    /// A deadline at a fixed instant
    pub fn at(end: Instant) -> Self {
        Self { end }
    }

    /// The instant the operation completes
    pub fn end(&self) -> Instant {
        self.end
    }

    /// Time left at `now`
    pub fn remaining(&self, now: Instant) -> Duration {
        self.end.saturating_duration_since(now)
    }

    /// Decide the next step given the regular polling period
    pub fn next_step(&self, now: Instant, poll: Duration) -> DeadlineStep {
        let remaining = self.remaining(now);
        if remaining <= DEADLINE_EPSILON {
            DeadlineStep::Done
        } else if remaining < SPIN_THRESHOLD {
            DeadlineStep::Spin(remaining)
        } else if remaining > poll {
            DeadlineStep::WaitFor(poll)
        } else {
            DeadlineStep::WaitFor(remaining.mul_f64(0.9))
        }
    }
}

/// Busy-wait a residual shorter than [`SPIN_THRESHOLD`]
///
/// Longer requests are clamped to the threshold. Uses the wall clock so it
/// terminates even when the async clock is paused.
pub fn spin_for(residual: Duration) {
    let residual = residual.min(SPIN_THRESHOLD);
    let end = std::time::Instant::now() + residual;
    while std::time::Instant::now() < end {
        std::hint::spin_loop();
    }
}
