use async_trait::async_trait;
use chrono::Utc;
use tracing::debug;

use crate::{
    event::{Denial, MessageEvent, StopReason},
    pipeline::{context::PipelineContext, Stage, StageFlow},
    Result,
};

pub struct SessionStatusStage;

#[async_trait]
impl Stage for SessionStatusStage {
    fn name(&self) -> &'static str {
        "session_status_check"
    }

    async fn process(&self, event: &mut MessageEvent, ctx: &PipelineContext) -> Result<StageFlow> {
        ctx.sessions.touch(&event.session_id, Utc::now());
        if ctx.sessions.is_enabled(&event.session_id) {
            return Ok(StageFlow::Next);
        }
        if ctx.profile.session.ignore_admin && event.is_admin() {
            debug!(session = %event.session_id, "session disabled; admin passes");
        } else {
            debug!(session = %event.session_id, "session disabled");
            event.stop(StopReason::Denied(Denial::SessionDisabled));
        }
        Ok(StageFlow::Next)
    }
}
