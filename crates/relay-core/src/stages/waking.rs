use async_trait::async_trait;

use crate::{
    config::WakingConfig,
    event::{Denial, MessageEvent, StopReason},
    pipeline::{context::PipelineContext, Stage, StageFlow},
    Result,
};

/// Decides whether a message is addressed to the bot.
pub struct WakingStage {
    cfg: WakingConfig,
}

impl WakingStage {
    pub fn new(cfg: WakingConfig) -> Self {
        Self { cfg }
    }

    fn strip_prefix<'s, 't>(&'s self, text: &'t str) -> Option<(&'s str, &'t str)> {
        self.cfg
            .prefixes
            .iter()
            .filter(|p| !p.is_empty())
            .find_map(|p| text.strip_prefix(p.as_str()).map(|rest| (p.as_str(), rest)))
    }
}

#[async_trait]
impl Stage for WakingStage {
    fn name(&self) -> &'static str {
        "waking_check"
    }

    async fn process(&self, event: &mut MessageEvent, _ctx: &PipelineContext) -> Result<StageFlow> {
        if let Some((prefix, rest)) = self.strip_prefix(event.text.trim_start()) {
            event.text = rest.trim_start().to_string();
            event.wake_prefix = Some(prefix.to_string());
            event.is_at_or_wake = true;
            return Ok(StageFlow::Next);
        }
        if event.is_at_or_wake {
            return Ok(StageFlow::Next);
        }
        if !event.is_group() && !self.cfg.direct_needs_prefix {
            event.is_at_or_wake = true;
            return Ok(StageFlow::Next);
        }

        event.stop(StopReason::Denied(Denial::NotAddressed));
        Ok(StageFlow::Next)
    }
}
