use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use tokio::time::{sleep, Instant};
use tracing::debug;

use crate::{
    config::{RateLimitConfig, RateLimitStrategy},
    domain::SessionId,
};

const MIN_SWEEP_AT: usize = 64;

/// Slack added to a stall so the oldest admission has definitely aged out.
pub const STALL_EPSILON: Duration = Duration::from_millis(300);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Admission {
    Admitted { waited: Duration },
    Denied { retry_after: Duration },
}

impl Admission {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Admission::Admitted { .. })
    }
}

/// Admission instants inside the current window, oldest first.
#[derive(Debug, Default)]
struct Window {
    timestamps: VecDeque<Instant>,
}

impl Window {
    fn purge(&mut self, now: Instant, window: Duration) {
        while let Some(&oldest) = self.timestamps.front() {
            if oldest + window <= now {
                self.timestamps.pop_front();
            } else {
                break;
            }
        }
    }

    fn try_admit(&mut self, now: Instant, count: usize, window: Duration) -> Result<(), Duration> {
        self.purge(now, window);
        if self.timestamps.len() < count {
            self.timestamps.push_back(now);
            return Ok(());
        }
        let oldest = self.timestamps.front().copied().unwrap_or(now);
        Err((oldest + window).saturating_duration_since(now))
    }
}

/// Per-session fixed-window limiter.
///
/// Every session has its own lock; the map lock only guards lookup/insert.
/// No lock is ever held across a sleep.
#[derive(Debug)]
pub struct RateLimiter {
    count: usize,
    window: Duration,
    strategy: RateLimitStrategy,
    windows: Mutex<HashMap<SessionId, Arc<Mutex<Window>>>>,
    /// Map size that triggers the next sweep of expired windows.
    sweep_at: AtomicUsize,
}

impl RateLimiter {
    pub fn new(cfg: &RateLimitConfig) -> Self {
        Self {
            count: cfg.count.max(1) as usize,
            window: cfg.window(),
            strategy: cfg.strategy,
            windows: Mutex::new(HashMap::new()),
            sweep_at: AtomicUsize::new(MIN_SWEEP_AT),
        }
    }

    pub fn strategy(&self) -> RateLimitStrategy {
        self.strategy
    }

    fn window_for(&self, session: &SessionId) -> Arc<Mutex<Window>> {
        let mut map = self.windows.lock().unwrap_or_else(|e| e.into_inner());
        if !map.contains_key(session) && map.len() >= self.sweep_at.load(Ordering::Relaxed) {
            self.sweep(&mut map, Instant::now());
        }
        map.entry(session.clone()).or_default().clone()
    }

    /// Drop windows nobody is using whose admissions have all aged out.
    fn sweep(&self, map: &mut HashMap<SessionId, Arc<Mutex<Window>>>, now: Instant) {
        let before = map.len();
        map.retain(|_, w| {
            if Arc::strong_count(w) > 1 {
                return true;
            }
            let Ok(mut w) = w.try_lock() else {
                return true;
            };
            w.purge(now, self.window);
            !w.timestamps.is_empty()
        });
        self.sweep_at
            .store((map.len() * 2).max(MIN_SWEEP_AT), Ordering::Relaxed);
        debug!(before, after = map.len(), "rate limit windows swept");
    }

    /// Single admission check at `now`: `Err(wait)` if the window is full.
    pub fn check_at(&self, session: &SessionId, now: Instant) -> Result<(), Duration> {
        let window = self.window_for(session);
        let mut guard = window.lock().unwrap_or_else(|e| e.into_inner());
        guard.try_admit(now, self.count, self.window)
    }

    /// Admit according to the configured strategy.
    ///
    /// `Stall` waits until the oldest admission ages out and retries, so it
    /// always admits eventually. `Discard` denies immediately.
    pub async fn admit(&self, session: &SessionId) -> Admission {
        let started = Instant::now();
        loop {
            let wait = match self.check_at(session, Instant::now()) {
                Ok(()) => {
                    return Admission::Admitted {
                        waited: started.elapsed(),
                    }
                }
                Err(wait) => wait,
            };

            match self.strategy {
                RateLimitStrategy::Discard => {
                    return Admission::Denied { retry_after: wait };
                }
                RateLimitStrategy::Stall => {
                    debug!(session = %session, wait_ms = wait.as_millis() as u64, "rate limit stall");
                    sleep(wait + STALL_EPSILON).await;
                }
            }
        }
    }

    /// Admissions currently counted for the session.
    pub fn window_len(&self, session: &SessionId) -> usize {
        let map = self.windows.lock().unwrap_or_else(|e| e.into_inner());
        map.get(session)
            .map(|w| w.lock().unwrap_or_else(|e| e.into_inner()).timestamps.len())
            .unwrap_or(0)
    }

    /// Sessions with a window in memory.
    pub fn tracked(&self) -> usize {
        self.windows.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Drop the session's window once every admission in it has aged out.
    /// Returns whether it was dropped.
    pub fn forget(&self, session: &SessionId) -> bool {
        let mut map = self.windows.lock().unwrap_or_else(|e| e.into_inner());
        let expired = map.get(session).is_some_and(|w| {
            if Arc::strong_count(w) > 1 {
                return false;
            }
            let mut w = w.lock().unwrap_or_else(|e| e.into_inner());
            w.purge(Instant::now(), self.window);
            w.timestamps.is_empty()
        });
        if expired {
            map.remove(session);
        }
        expired
    }
}
