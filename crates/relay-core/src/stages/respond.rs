use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::{
    event::MessageEvent,
    logging::preview,
    pipeline::{context::PipelineContext, Stage, StageFlow},
    registry::{dispatch, EventType, HandlerCtx, PluginFilter},
    Error, Result,
};

/// Delivers the result through the originating platform.
///
/// The send happens in `finish`, after every post-phase has run, so that
/// decoration is applied and forced results on stopped events still go out.
pub struct RespondStage;

#[async_trait]
impl Stage for RespondStage {
    fn name(&self) -> &'static str {
        "respond"
    }

    async fn process(&self, event: &mut MessageEvent, ctx: &PipelineContext) -> Result<StageFlow> {
        if ctx.platforms.get(&event.platform_name).is_none() {
            return Err(Error::UnknownPlatform(event.platform_name.clone()));
        }
        Ok(StageFlow::Next)
    }

    async fn finish(&self, event: &mut MessageEvent, ctx: &PipelineContext) -> Result<()> {
        if !event.should_deliver() {
            return Ok(());
        }
        let Some(result) = event.result.clone() else {
            return Ok(());
        };
        let Some(platform) = ctx.platforms.get(&event.platform_name) else {
            return Err(Error::UnknownPlatform(event.platform_name.clone()));
        };

        if let Err(e) = platform.send(&event.origin, &result).await {
            warn!(origin = %event.origin, error = %e, "send failed");
            return Ok(());
        }
        info!(
            origin = %event.origin,
            chars = result.text.chars().count(),
            text = %preview(&result.text, 60),
            "reply sent"
        );

        let hooks = ctx
            .registry
            .snapshot()
            .lookup(EventType::PostSend, &PluginFilter::All);
        if !hooks.is_empty() {
            let mut hctx = HandlerCtx::for_event(EventType::PostSend, event, ctx);
            if let Err(e) = dispatch(&hooks, &mut hctx).await {
                debug!(origin = %event.origin, error = %e, "post-send hook failed");
            }
        }
        Ok(())
    }
}
