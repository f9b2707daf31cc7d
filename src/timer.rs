//! Restartable periodic trigger driving fetch session ticks.
//!
//! A [`Timer`] is a cheap, clonable handle. One task awaits [`Timer::tick`]
//! in a loop while any other handle may reset, pause, resume or destroy the
//! timer. Because the ticking task only asks for the next tick after it has
//! finished handling the previous one, ticks never overlap, no matter how
//! long handling takes compared to the interval.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use rangeplay::timer::Timer;
//!
//! let timer = Timer::new(Duration::from_secs(2));
//! timer.start();
//!
//! let handle = timer.clone();
//! tokio::spawn(async move {
//!     while handle.tick().await {
//!         // poll for work
//!     }
//! });
//!
//! timer.pause();
//! timer.resume();
//! timer.destroy();
//! ```

use std::{
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use tokio::{sync::Notify, time::Instant};

#[derive(Clone)]
pub struct Timer {
    shared: Arc<Shared>,
}

struct Shared {
    interval: Duration,
    state: Mutex<State>,
    notify: Notify,
}

#[derive(Debug, Default)]
struct State {
    /// When the next tick is due, while running and not paused.
    deadline: Option<Instant>,

    /// Countdown left when the timer was paused.
    remaining: Option<Duration>,

    started: bool,
    paused: bool,
    destroyed: bool,
}

impl Timer {
    #[must_use]
    pub fn new(interval: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                interval,
                state: Mutex::new(State::default()),
                notify: Notify::new(),
            }),
        }
    }

    #[must_use]
    pub fn interval(&self) -> Duration {
        self.shared.interval
    }

    fn state(&self) -> MutexGuard<'_, State> {
        // The state is plain data that is never left half-updated.
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Starts the countdown to the first tick. Does nothing when already
    /// started or destroyed.
    pub fn start(&self) {
        let mut state = self.state();
        if state.started || state.destroyed {
            return;
        }

        state.started = true;
        state.deadline = Some(Instant::now() + self.shared.interval);
        drop(state);

        self.shared.notify.notify_waiters();
    }

    /// Restarts the countdown without ticking.
    ///
    /// A paused timer keeps being paused, but resumes with a full interval.
    pub fn reset(&self) {
        let mut state = self.state();
        if !state.started || state.destroyed {
            return;
        }

        if state.paused {
            state.remaining = Some(self.shared.interval);
        } else {
            state.deadline = Some(Instant::now() + self.shared.interval);
        }
        drop(state);

        self.shared.notify.notify_waiters();
    }

    /// Suspends ticking, remembering how much of the countdown was left.
    pub fn pause(&self) {
        let mut state = self.state();
        if state.paused || state.destroyed {
            return;
        }

        state.paused = true;
        state.remaining = state
            .deadline
            .take()
            .map(|deadline| deadline.saturating_duration_since(Instant::now()));
        drop(state);

        self.shared.notify.notify_waiters();
    }

    /// Continues ticking where [`pause`](Self::pause) left off.
    pub fn resume(&self) {
        let mut state = self.state();
        if !state.paused || state.destroyed {
            return;
        }

        state.paused = false;
        if state.started {
            let remaining = state.remaining.take().unwrap_or(self.shared.interval);
            state.deadline = Some(Instant::now() + remaining);
        }
        drop(state);

        self.shared.notify.notify_waiters();
    }

    /// Permanently stops ticking. Idempotent.
    pub fn destroy(&self) {
        let mut state = self.state();
        if state.destroyed {
            return;
        }

        state.destroyed = true;
        state.deadline = None;
        state.remaining = None;
        drop(state);

        self.shared.notify.notify_waiters();
    }

    #[must_use]
    pub fn is_destroyed(&self) -> bool {
        self.state().destroyed
    }

    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.state().paused
    }

    /// Waits for the next tick.
    ///
    /// Returns `true` when the interval elapsed and `false` once the timer is
    /// destroyed. While the timer is paused or not yet started, this waits
    /// without ticking.
    pub async fn tick(&self) -> bool {
        loop {
            // Register interest before inspecting the state, so that changes
            // made in between are not missed.
            let notified = self.shared.notify.notified();

            let deadline = {
                let state = self.state();
                if state.destroyed {
                    return false;
                }

                state.deadline.filter(|_| !state.paused)
            };

            let Some(deadline) = deadline else {
                notified.await;
                continue;
            };

            tokio::select! {
                () = tokio::time::sleep_until(deadline) => {
                    let mut state = self.state();
                    // The deadline may have moved while sleeping.
                    if state.destroyed {
                        return false;
                    }
                    if !state.paused && state.deadline == Some(deadline) {
                        state.deadline = Some(Instant::now() + self.shared.interval);
                        return true;
                    }
                }
                () = notified => {}
            }
        }
    }
}

impl fmt::Debug for Timer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state();
        f.debug_struct("Timer")
            .field("interval", &self.shared.interval)
            .field("started", &state.started)
            .field("paused", &state.paused)
            .field("destroyed", &state.destroyed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INTERVAL: Duration = Duration::from_secs(2);

    #[tokio::test(start_paused = true)]
    async fn ticks_at_interval() {
        let timer = Timer::new(INTERVAL);
        let started = Instant::now();
        timer.start();

        assert!(timer.tick().await);
        assert_eq!(started.elapsed().as_millis(), 2000);

        assert!(timer.tick().await);
        assert_eq!(started.elapsed().as_millis(), 4000);
    }

    #[tokio::test(start_paused = true)]
    async fn reset_restarts_countdown() {
        let timer = Timer::new(INTERVAL);
        let started = Instant::now();
        timer.start();

        tokio::time::sleep(Duration::from_millis(1500)).await;
        timer.reset();

        assert!(timer.tick().await);
        assert_eq!(started.elapsed().as_millis(), 3500);
    }

    #[tokio::test(start_paused = true)]
    async fn pause_keeps_remaining_countdown() {
        let timer = Timer::new(INTERVAL);
        let started = Instant::now();
        timer.start();

        tokio::time::sleep(Duration::from_millis(500)).await;
        timer.pause();
        assert!(timer.is_paused());

        let ticker = timer.clone();
        let tick = tokio::spawn(async move { ticker.tick().await });

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(!tick.is_finished());

        timer.resume();
        assert!(tick.await.unwrap());
        assert_eq!(started.elapsed().as_millis(), 12_000);
    }

    #[tokio::test(start_paused = true)]
    async fn destroy_is_idempotent_and_stops_ticking() {
        let timer = Timer::new(INTERVAL);
        timer.start();

        let ticker = timer.clone();
        let tick = tokio::spawn(async move { ticker.tick().await });
        tokio::task::yield_now().await;

        timer.destroy();
        timer.destroy();

        assert!(timer.is_destroyed());
        assert!(!tick.await.unwrap());
        assert!(!timer.tick().await);

        // Starting a destroyed timer has no effect.
        timer.start();
        assert!(!timer.tick().await);
    }
}
