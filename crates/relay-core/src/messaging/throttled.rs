use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};
use tracing::debug;

use crate::{
    domain::Origin,
    event::MessageResult,
    messaging::{port::PlatformPort, types::PlatformCapabilities},
    Result,
};

const MIN_SWEEP_AT: usize = 64;

#[derive(Clone, Copy, Debug)]
pub struct ThrottleConfig {
    /// Minimum spacing between *any* two sends (platform-wide flood control).
    pub global_min_interval: Duration,
    /// Minimum spacing between sends to the same conversation.
    pub per_origin_min_interval: Duration,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            global_min_interval: Duration::from_millis(40),      // ~25/sec
            per_origin_min_interval: Duration::from_millis(1050), // ~0.95/sec
        }
    }
}

#[derive(Debug)]
struct IntervalLimiter {
    interval: Duration,
    next: Instant,
}

impl IntervalLimiter {
    fn new(interval: Duration) -> Self {
        Self {
            interval,
            next: Instant::now(),
        }
    }

    /// Reserve the next slot and return how long to wait before using it.
    fn reserve(&mut self) -> Duration {
        let now = Instant::now();
        let start = if now >= self.next { now } else { self.next };
        self.next = start + self.interval;
        start.saturating_duration_since(now)
    }
}

/// `PlatformPort` decorator that spaces outbound sends.
///
/// Best-effort defense against platform flood limits (Telegram 429s and
/// friends). It is not the pipeline's rate limiter: that one admits inbound
/// events, this one paces outbound calls.
pub struct ThrottledPlatform {
    inner: Arc<dyn PlatformPort>,
    cfg: ThrottleConfig,
    global: Mutex<IntervalLimiter>,
    per_origin: Mutex<OriginLimiters>,
}

struct OriginLimiters {
    map: HashMap<String, Arc<Mutex<IntervalLimiter>>>,
    /// Map size that triggers the next sweep of settled limiters.
    sweep_at: usize,
}

impl OriginLimiters {
    /// Keep limiters that are in use or still have a reserved slot ahead.
    fn sweep(&mut self, now: Instant) {
        let before = self.map.len();
        self.map.retain(|_, lim| {
            Arc::strong_count(lim) > 1 || lim.try_lock().map_or(true, |l| l.next > now)
        });
        self.sweep_at = (self.map.len() * 2).max(MIN_SWEEP_AT);
        debug!(before, after = self.map.len(), "origin throttles swept");
    }
}

impl ThrottledPlatform {
    pub fn new(inner: Arc<dyn PlatformPort>, cfg: ThrottleConfig) -> Self {
        Self {
            inner,
            cfg,
            global: Mutex::new(IntervalLimiter::new(cfg.global_min_interval)),
            per_origin: Mutex::new(OriginLimiters {
                map: HashMap::new(),
                sweep_at: MIN_SWEEP_AT,
            }),
        }
    }

    async fn limiter_for(&self, origin: &Origin) -> Arc<Mutex<IntervalLimiter>> {
        let mut limiters = self.per_origin.lock().await;
        let key = origin.to_string();
        if !limiters.map.contains_key(&key) && limiters.map.len() >= limiters.sweep_at {
            limiters.sweep(Instant::now());
        }
        limiters
            .map
            .entry(key)
            .or_insert_with(|| {
                Arc::new(Mutex::new(IntervalLimiter::new(
                    self.cfg.per_origin_min_interval,
                )))
            })
            .clone()
    }

    /// Origins with a limiter in memory.
    pub async fn tracked_origins(&self) -> usize {
        self.per_origin.lock().await.map.len()
    }

    async fn throttle(&self, origin: &Origin) {
        let global_wait = { self.global.lock().await.reserve() };
        let origin_wait = {
            let lim = self.limiter_for(origin).await;
            let mut guard = lim.lock().await;
            guard.reserve()
        };

        let wait = global_wait.max(origin_wait);
        if wait > Duration::ZERO {
            sleep(wait).await;
        }
    }
}

#[async_trait]
impl PlatformPort for ThrottledPlatform {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn capabilities(&self) -> PlatformCapabilities {
        self.inner.capabilities()
    }

    async fn send(&self, origin: &Origin, result: &MessageResult) -> Result<()> {
        self.throttle(origin).await;
        self.inner.send(origin, result).await
    }
}
