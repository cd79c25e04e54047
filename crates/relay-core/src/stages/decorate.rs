use async_trait::async_trait;

use crate::{
    config::DecorateConfig,
    event::MessageEvent,
    pipeline::{context::PipelineContext, Continuation, Stage, StageFlow},
    registry::{dispatch, EventType, HandlerCtx, PluginFilter},
    Result,
};

/// Two-phase: wraps everything downstream and edits the result on the way
/// out.
pub struct ResultDecorateStage {
    cfg: DecorateConfig,
}

impl ResultDecorateStage {
    pub fn new(cfg: DecorateConfig) -> Self {
        Self { cfg }
    }

    fn max_chars(&self, event: &MessageEvent, ctx: &PipelineContext) -> Option<usize> {
        self.cfg.max_chars.or_else(|| {
            ctx.platforms
                .get(&event.platform_name)
                .map(|p| p.capabilities().max_message_len)
        })
    }

    fn decorate(&self, body: &str, mention: Option<&str>, max_chars: Option<usize>) -> String {
        let mention = mention.map(|m| format!("@{m} ")).unwrap_or_default();
        let frame = self.cfg.prefix.chars().count()
            + mention.chars().count()
            + self.cfg.suffix.chars().count();

        match max_chars {
            // No room for the frame: send the bare body.
            Some(max) if frame >= max => truncate(body, max),
            Some(max) => format!(
                "{}{}{}{}",
                self.cfg.prefix,
                mention,
                truncate(body, max - frame),
                self.cfg.suffix
            ),
            None => format!("{}{}{}{}", self.cfg.prefix, mention, body, self.cfg.suffix),
        }
    }
}

/// Cut `s` to at most `max` chars, marking the cut with "...".
fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let keep = max.saturating_sub(3);
    let mut out: String = s.chars().take(keep).collect();
    out.push_str(&"..."[..max.min(3)]);
    out
}

#[async_trait]
impl Stage for ResultDecorateStage {
    fn name(&self) -> &'static str {
        "result_decorate"
    }

    async fn process(&self, _event: &mut MessageEvent, _ctx: &PipelineContext) -> Result<StageFlow> {
        Ok(StageFlow::Wrap(Continuation::empty()))
    }

    async fn resume(
        &self,
        event: &mut MessageEvent,
        ctx: &PipelineContext,
        _cont: Continuation,
    ) -> Result<StageFlow> {
        if event.result.is_none() {
            return Ok(StageFlow::Next);
        }

        let hooks = ctx
            .registry
            .snapshot()
            .lookup(EventType::PreDecorate, &PluginFilter::All);
        if !hooks.is_empty() {
            let mut hctx = HandlerCtx::for_event(EventType::PreDecorate, event, ctx);
            dispatch(&hooks, &mut hctx).await?;
        }

        let mention = (self.cfg.mention_sender && event.is_group())
            .then(|| event.sender_name.clone().unwrap_or_else(|| event.sender_id.clone()));
        let max_chars = self.max_chars(event, ctx);

        if let Some(result) = event.result.as_mut() {
            if !result.text.is_empty() {
                result.text = self.decorate(&result.text, mention.as_deref(), max_chars);
            }
        }
        Ok(StageFlow::Next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::ProfileConfig,
        event::MessageResult,
        registry::{handler_fn, HandlerMetadata, HandlerOutcome},
        stages::testing,
    };

    fn stage(cfg: DecorateConfig) -> ResultDecorateStage {
        ResultDecorateStage::new(cfg)
    }

    async fn run(s: &ResultDecorateStage, ev: &mut MessageEvent, ctx: &PipelineContext) {
        let StageFlow::Wrap(cont) = s.process(ev, ctx).await.unwrap() else {
            panic!("decorate must wrap");
        };
        assert!(matches!(
            s.resume(ev, ctx, cont).await.unwrap(),
            StageFlow::Next
        ));
    }

    #[tokio::test]
    async fn applies_prefix_mention_and_suffix() {
        let (ctx, _) = testing::ctx_with(ProfileConfig::default());
        let s = stage(DecorateConfig {
            prefix: "[bot] ".to_string(),
            suffix: " --relay".to_string(),
            mention_sender: true,
            ..DecorateConfig::default()
        });

        let mut ev = testing::group("q");
        ev.sender_name = Some("ana".to_string());
        ev.set_result(MessageResult::text("answer"));
        run(&s, &mut ev, &ctx).await;
        assert_eq!(ev.result.unwrap().text, "[bot] @ana answer --relay");

        // No mention in direct chats.
        let mut ev = testing::direct("q");
        ev.set_result(MessageResult::text("answer"));
        run(&s, &mut ev, &ctx).await;
        assert_eq!(ev.result.unwrap().text, "[bot] answer --relay");
    }

    #[tokio::test]
    async fn truncates_to_platform_limit_and_keeps_suffix() {
        let (shared, _) = testing::shared();
        let small = std::sync::Arc::new(testing::RecordingPlatform {
            max_len: Some(10),
            ..Default::default()
        });
        shared.platforms.insert(small);
        let ctx = PipelineContext::for_profile("p", ProfileConfig::default(), &shared);
        let s = stage(DecorateConfig {
            suffix: "!".to_string(),
            ..DecorateConfig::default()
        });

        let mut ev = testing::direct("q");
        ev.set_result(MessageResult::text("abcdefghijklmnop"));
        run(&s, &mut ev, &ctx).await;
        let text = ev.result.unwrap().text;
        assert_eq!(text, "abcdef...!");
        assert_eq!(text.chars().count(), 10);
    }

    #[tokio::test]
    async fn frame_wider_than_the_limit_is_dropped() {
        let (ctx, _) = testing::ctx_with(ProfileConfig::default());
        let s = stage(DecorateConfig {
            prefix: "[a very long prefix] ".to_string(),
            max_chars: Some(8),
            ..DecorateConfig::default()
        });

        let mut ev = testing::direct("q");
        ev.set_result(MessageResult::text("abcdefghijkl"));
        run(&s, &mut ev, &ctx).await;
        let text = ev.result.unwrap().text;
        assert_eq!(text, "abcde...");
        assert!(text.chars().count() <= 8);
    }

    #[tokio::test]
    async fn no_result_means_no_hooks() {
        let (ctx, _) = testing::ctx_with(ProfileConfig::default());
        ctx.registry
            .register(HandlerMetadata::new(
                "p",
                "upper",
                EventType::PreDecorate,
                handler_fn(|c| {
                    if let Some(ev) = c.event_mut() {
                        if let Some(r) = ev.result.as_mut() {
                            r.text = r.text.to_uppercase();
                        } else {
                            ev.set_result(MessageResult::text("unexpected"));
                        }
                    }
                    Ok(HandlerOutcome::Continue)
                }),
            ))
            .unwrap();
        let s = stage(DecorateConfig::default());

        let mut ev = testing::direct("q");
        run(&s, &mut ev, &ctx).await;
        assert!(ev.result.is_none());

        let mut ev = testing::direct("q");
        ev.set_result(MessageResult::text("loud"));
        run(&s, &mut ev, &ctx).await;
        assert_eq!(ev.result.unwrap().text, "LOUD");
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("héllo wörld", 8), "héllo...");
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("abcdef", 2), "..");
    }
}
