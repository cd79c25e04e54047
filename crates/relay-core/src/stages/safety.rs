use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use crate::{
    config::SafetyConfig,
    event::{MessageEvent, MessageResult, StopReason},
    pipeline::{context::PipelineContext, Stage, StageFlow},
    safety::{ClassifierStrategy, ContentClassifier, KeywordStrategy, SafetyStrategy},
    Result,
};

/// Checks the raw text against every configured strategy, in order.
pub struct ContentSafetyStage {
    strategies: Vec<Box<dyn SafetyStrategy>>,
    blocked_reply: String,
}

impl ContentSafetyStage {
    pub fn new(cfg: &SafetyConfig, classifier: Option<Arc<dyn ContentClassifier>>) -> Result<Self> {
        let mut strategies: Vec<Box<dyn SafetyStrategy>> = Vec::new();

        let keywords = KeywordStrategy::new(&cfg.keywords)?;
        if !keywords.is_empty() {
            strategies.push(Box::new(keywords));
        }
        if cfg.use_classifier {
            match classifier {
                Some(c) => strategies.push(Box::new(ClassifierStrategy::new(c))),
                None => warn!("use_classifier is set but no content classifier is configured"),
            }
        }

        Ok(Self {
            strategies,
            blocked_reply: cfg.blocked_reply.clone(),
        })
    }
}

#[async_trait]
impl Stage for ContentSafetyStage {
    fn name(&self) -> &'static str {
        "content_safety_check"
    }

    async fn process(&self, event: &mut MessageEvent, _ctx: &PipelineContext) -> Result<StageFlow> {
        for strategy in &self.strategies {
            if strategy.check(&event.raw_text).await? {
                continue;
            }

            warn!(
                origin = %event.origin,
                strategy = strategy.name(),
                "message blocked by content safety"
            );
            if event.is_at_or_wake {
                event.set_result(MessageResult::forced(self.blocked_reply.clone()));
            }
            event.stop(StopReason::SafetyViolation);
            break;
        }
        Ok(StageFlow::Next)
    }
}
