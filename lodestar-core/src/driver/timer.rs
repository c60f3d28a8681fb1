//! Timer queue advanced once per tick.
//!
//! Callbacks run on the driver thread and decide their own fate by returning
//! a [`TimerAction`]. [`TimerHandle::sleep`] wraps a one-shot timer in a
//! future so cooperative tasks can wait on it.
use std::{
    cell::RefCell,
    cmp::Reverse,
    collections::{BinaryHeap, HashMap},
    fmt,
    future::Future,
    pin::Pin,
    rc::Rc,
    task::{Context, Poll, Waker},
    time::{Duration, Instant},
};

use tracing::trace;

use crate::metrics;

/// Key of a started timer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

/// What to do with a timer after its callback ran
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerAction {
    /// fire again after the given delay
    Rearm(Duration),
    /// done
    Cancel,
}

type Callback = Box<dyn FnMut() -> TimerAction>;

struct TimerEntry {
    deadline: Instant,
    callback: Option<Callback>,
}

#[derive(Default)]
struct TimerQueue {
    next_id: u64,
    /// may hold stale entries for stopped or re-armed timers
    heap: BinaryHeap<Reverse<(Instant, TimerId)>>,
    timers: HashMap<TimerId, TimerEntry>,
}

impl TimerQueue {
    fn schedule(&mut self, id: TimerId, deadline: Instant, callback: Callback) {
        self.heap.push(Reverse((deadline, id)));
        self.timers.insert(
            id,
            TimerEntry {
                deadline,
                callback: Some(callback),
            },
        );
    }

    /// ids of live timers due at `now`, in deadline order
    fn due(&mut self, now: Instant) -> Vec<(TimerId, Instant)> {
        let mut due = Vec::new();
        while let Some(Reverse((deadline, id))) = self.heap.peek().copied() {
            if deadline > now {
                break;
            }
            self.heap.pop();
            if self
                .timers
                .get(&id)
                .is_some_and(|entry| entry.deadline == deadline)
            {
                due.push((id, deadline));
            }
        }
        due
    }
}

/// Shared handle to the driver's timer queue. Cheap to clone; not `Send`.
#[derive(Clone, Default)]
pub struct TimerHandle {
    queue: Rc<RefCell<TimerQueue>>,
}

impl fmt::Debug for TimerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerHandle")
            .field("pending", &self.pending())
            .finish()
    }
}

impl TimerHandle {
    /// Make an empty queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `callback` once `delay` has passed, and again for as long as it
    /// returns [`TimerAction::Rearm`].
    pub fn start_timer(
        &self,
        delay: Duration,
        callback: impl FnMut() -> TimerAction + 'static,
    ) -> TimerId {
        let mut queue = self.queue.borrow_mut();
        queue.next_id += 1;
        let id = TimerId(queue.next_id);
        queue.schedule(id, Instant::now() + delay, Box::new(callback));
        id
    }

    /// Stop a timer. Returns false if it already finished.
    pub fn stop_timer(&self, id: TimerId) -> bool {
        self.queue.borrow_mut().timers.remove(&id).is_some()
    }

    /// count of live timers
    pub fn pending(&self) -> usize {
        self.queue.borrow().timers.len()
    }

    /// Deadline of the next live timer.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.queue
            .borrow()
            .timers
            .values()
            .map(|entry| entry.deadline)
            .min()
    }

    /// A future that completes on the first [`advance`](TimerHandle::advance)
    /// at or after `delay` from now. Dropping it stops the timer.
    pub fn sleep(&self, delay: Duration) -> Sleep {
        let state = Rc::new(RefCell::new(SleepState::default()));
        let fired = state.clone();
        let id = self.start_timer(delay, move || {
            let mut state = fired.borrow_mut();
            state.fired = true;
            if let Some(waker) = state.waker.take() {
                waker.wake();
            }
            TimerAction::Cancel
        });
        Sleep {
            timer: self.clone(),
            id,
            state,
        }
    }

    /// Fire every timer due at `now`. Timers re-armed here are not fired
    /// again in the same pass. Returns how many callbacks ran.
    pub fn advance(&self, now: Instant) -> usize {
        let due = self.queue.borrow_mut().due(now);
        let mut fired = 0;
        for (id, deadline) in due {
            // taken out so the callback can use this handle
            let callback = self
                .queue
                .borrow_mut()
                .timers
                .get_mut(&id)
                .and_then(|entry| entry.callback.take());
            let Some(mut callback) = callback else {
                // stopped by an earlier callback in this pass
                continue;
            };
            fired += 1;
            metrics::TIMERS_FIRED.inc();
            let action = callback();
            let mut queue = self.queue.borrow_mut();
            // stopped from inside its own callback
            if !queue
                .timers
                .get(&id)
                .is_some_and(|entry| entry.deadline == deadline)
            {
                continue;
            }
            match action {
                TimerAction::Rearm(delay) => {
                    trace!(?id, ?delay, "timer re-armed");
                    queue.schedule(id, now + delay, callback);
                }
                TimerAction::Cancel => {
                    queue.timers.remove(&id);
                }
            }
        }
        fired
    }
}

#[derive(Debug, Default)]
struct SleepState {
    fired: bool,
    waker: Option<Waker>,
}

/// Future returned by [`TimerHandle::sleep`]
#[derive(Debug)]
pub struct Sleep {
    timer: TimerHandle,
    id: TimerId,
    state: Rc<RefCell<SleepState>>,
}

impl Future for Sleep {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let mut state = self.state.borrow_mut();
        if state.fired {
            Poll::Ready(())
        } else {
            state.waker = Some(cx.waker().clone());
            Poll::Pending
        }
    }
}

impl Drop for Sleep {
    fn drop(&mut self) {
        if !self.state.borrow().fired {
            self.timer.stop_timer(self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;

    #[test]
    fn test_rearm_until_cancel() {
        let timer = TimerHandle::new();
        let runs = Rc::new(Cell::new(0));
        let counter = runs.clone();
        timer.start_timer(Duration::ZERO, move || {
            counter.set(counter.get() + 1);
            if counter.get() < 3 {
                TimerAction::Rearm(Duration::ZERO)
            } else {
                TimerAction::Cancel
            }
        });

        let now = Instant::now();
        // one firing per pass, even with a zero re-arm delay
        assert_eq!(timer.advance(now), 1);
        assert_eq!(timer.advance(now), 1);
        assert_eq!(timer.advance(now), 1);
        assert_eq!(timer.advance(now), 0);
        assert_eq!(runs.get(), 3);
        assert_eq!(timer.pending(), 0);
    }

    #[test]
    fn test_not_due_and_stop() {
        let timer = TimerHandle::new();
        let id = timer.start_timer(Duration::from_secs(60), || TimerAction::Cancel);
        assert_eq!(timer.advance(Instant::now()), 0);
        assert!(timer.next_deadline().is_some());
        assert!(timer.stop_timer(id));
        assert!(!timer.stop_timer(id));
        assert_eq!(timer.advance(Instant::now() + Duration::from_secs(120)), 0);
    }

    #[test]
    fn test_callback_stops_other_timer() {
        let timer = TimerHandle::new();
        let victim = Rc::new(Cell::new(None));
        let slot = victim.clone();
        let handle = timer.clone();
        timer.start_timer(Duration::ZERO, move || {
            if let Some(id) = slot.get() {
                handle.stop_timer(id);
            }
            TimerAction::Cancel
        });
        let ran = Rc::new(Cell::new(false));
        let flag = ran.clone();
        let id = timer.start_timer(Duration::ZERO, move || {
            flag.set(true);
            TimerAction::Cancel
        });
        victim.set(Some(id));

        assert_eq!(timer.advance(Instant::now()), 1);
        assert!(!ran.get());
    }

    #[test]
    fn test_dropped_sleep_stops_timer() {
        let timer = TimerHandle::new();
        let sleep = timer.sleep(Duration::from_secs(5));
        assert_eq!(timer.pending(), 1);
        drop(sleep);
        assert_eq!(timer.pending(), 0);
    }
}
