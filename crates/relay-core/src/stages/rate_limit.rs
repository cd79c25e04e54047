use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::{
    config::RateLimitConfig,
    domain::SessionId,
    event::{Denial, MessageEvent, StopReason},
    pipeline::{context::PipelineContext, Stage, StageFlow},
    ratelimit::{Admission, RateLimiter},
    Result,
};

pub struct RateLimitStage {
    limiter: RateLimiter,
}

impl RateLimitStage {
    pub fn new(cfg: &RateLimitConfig) -> Self {
        Self {
            limiter: RateLimiter::new(cfg),
        }
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }
}

#[async_trait]
impl Stage for RateLimitStage {
    fn name(&self) -> &'static str {
        "rate_limit_check"
    }

    async fn process(&self, event: &mut MessageEvent, _ctx: &PipelineContext) -> Result<StageFlow> {
        match self.limiter.admit(&event.session_id).await {
            Admission::Admitted { waited } if waited > Duration::ZERO => {
                debug!(
                    session = %event.session_id,
                    waited_ms = waited.as_millis() as u64,
                    "admitted after stall"
                );
            }
            Admission::Admitted { .. } => {}
            Admission::Denied { retry_after } => {
                info!(
                    session = %event.session_id,
                    retry_after_ms = retry_after.as_millis() as u64,
                    "rate limited; message discarded"
                );
                event.stop(StopReason::Denied(Denial::RateLimited));
            }
        }
        Ok(StageFlow::Next)
    }

    fn release(&self, session: &SessionId) {
        self.limiter.forget(session);
    }
}
