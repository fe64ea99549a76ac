/// Background timer driving the passive token refresh
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Shortest delay between arming and firing
pub const MIN_REFRESH_DELAY: Duration = Duration::from_secs(1);

/// Delay until the refresh for a token expiring at `expiry_millis` is due
///
/// Fires `lead` before expiry, but never sooner than [`MIN_REFRESH_DELAY`].
pub fn refresh_delay(expiry_millis: u64, now_millis: u64, lead: Duration) -> Duration {
    let lead_millis = u64::try_from(lead.as_millis()).unwrap_or(u64::MAX);
    let fire_at = expiry_millis.saturating_sub(lead_millis);
    Duration::from_millis(fire_at.saturating_sub(now_millis)).max(MIN_REFRESH_DELAY)
}

#[derive(Debug, Default)]
struct TimerState {
    generation: u64,
    deadline: Option<Instant>,
}

#[derive(Debug, Default)]
struct TimerShared {
    state: Mutex<TimerState>,
    wake: Condvar,
}

/// Single-shot timer that can be re-armed or cancelled from any thread
///
/// Each arm bumps a generation counter; a sleeping timer thread whose
/// generation is no longer current exits without firing. Arming from inside
/// the fired callback is allowed.
#[derive(Debug, Default)]
pub struct RefreshTimer {
    shared: Arc<TimerShared>,
}

impl RefreshTimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `on_fire` after `delay`, replacing any armed timer
    pub fn arm<F>(&self, delay: Duration, on_fire: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let deadline = Instant::now() + delay;
        let generation = {
            let mut state = self.shared.state.lock();
            state.generation += 1;
            state.deadline = Some(deadline);
            state.generation
        };
        self.shared.wake.notify_all();

        let shared = self.shared.clone();
        let spawned = thread::Builder::new()
            .name("kick-session-refresh".to_string())
            .spawn(move || {
                let mut state = shared.state.lock();
                while state.generation == generation {
                    if shared.wake.wait_until(&mut state, deadline).timed_out() {
                        break;
                    }
                }
                if state.generation != generation {
                    return;
                }
                state.deadline = None;
                drop(state);
                on_fire();
            });

        if let Err(e) = spawned {
            tracing::error!(error = %e, "Failed to start refresh timer thread");
            self.cancel();
        }
    }

    /// Disarm the timer; a no-op when nothing is armed
    pub fn cancel(&self) {
        {
            let mut state = self.shared.state.lock();
            state.generation += 1;
            state.deadline = None;
        }
        self.shared.wake.notify_all();
    }

    /// When the armed timer is due, if any
    pub fn deadline(&self) -> Option<Instant> {
        self.shared.state.lock().deadline
    }

    pub fn is_armed(&self) -> bool {
        self.deadline().is_some()
    }
}

impl Drop for RefreshTimer {
    fn drop(&mut self) {
        self.cancel();
    }
}
