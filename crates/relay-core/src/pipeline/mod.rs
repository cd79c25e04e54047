//! Onion-model stage scheduler.
//!
//! Stages run in order. A two-phase stage returns [`StageFlow::Wrap`] from its
//! pre-phase; the scheduler then runs every later stage and hands the
//! continuation back through [`Stage::resume`]. Nesting is tracked on an
//! explicit stack instead of recursion.

pub mod context;

use std::{any::Any, sync::Arc};

use async_trait::async_trait;
use tracing::{debug, error};

use crate::{
    domain::SessionId,
    event::{MessageEvent, StopReason},
    stages, Error, Result,
};

pub use context::{Collaborators, PipelineContext};

/// State a two-phase stage carries from its pre-phase to its post-phase.
#[derive(Debug)]
pub struct Continuation(Box<dyn Any + Send>);

impl Continuation {
    pub fn new<T: Any + Send>(state: T) -> Self {
        Self(Box::new(state))
    }

    pub fn empty() -> Self {
        Self::new(())
    }

    pub fn into_inner<T: Any>(self) -> Option<T> {
        self.0.downcast::<T>().ok().map(|b| *b)
    }
}

#[derive(Debug)]
pub enum StageFlow {
    /// Done with this event (plain stage, or post-phase finished).
    Next,
    /// Run the rest of the pipeline, then call `resume` with this state.
    Wrap(Continuation),
}

#[async_trait]
pub trait Stage: Send + Sync {
    fn name(&self) -> &'static str;

    /// Pre-phase.
    async fn process(&self, event: &mut MessageEvent, ctx: &PipelineContext) -> Result<StageFlow>;

    /// Post-phase of a two-phase stage. Returning `Wrap` again re-runs the
    /// downstream stages once more (unless the event has been stopped).
    async fn resume(
        &self,
        _event: &mut MessageEvent,
        _ctx: &PipelineContext,
        _cont: Continuation,
    ) -> Result<StageFlow> {
        Ok(StageFlow::Next)
    }

    /// Runs once after the whole onion has unwound, stopped or not.
    async fn finish(&self, _event: &mut MessageEvent, _ctx: &PipelineContext) -> Result<()> {
        Ok(())
    }

    /// The session went idle; drop anything kept for it.
    fn release(&self, _session: &SessionId) {}
}

/// The active stages of one profile.
pub struct PipelineScheduler {
    stages: Vec<Arc<dyn Stage>>,
    ctx: Arc<PipelineContext>,
}

impl PipelineScheduler {
    pub fn new(stages: Vec<Arc<dyn Stage>>, ctx: Arc<PipelineContext>) -> Self {
        Self { stages, ctx }
    }

    /// Build the enabled built-in stages from the context's profile.
    pub fn build(ctx: Arc<PipelineContext>) -> Result<Self> {
        let stages = stages::build(&ctx)?;
        debug!(
            profile = %ctx.profile_name,
            stages = ?stages.iter().map(|s| s.name()).collect::<Vec<_>>(),
            "pipeline built"
        );
        Ok(Self::new(stages, ctx))
    }

    pub fn context(&self) -> &Arc<PipelineContext> {
        &self.ctx
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    pub fn release_session(&self, session: &SessionId) {
        for stage in &self.stages {
            stage.release(session);
        }
    }

    /// Drive `event` through the pipeline. Never fails: stage errors stop the
    /// event and are logged.
    pub async fn run(&self, event: &mut MessageEvent) {
        let n = self.stages.len();
        let ctx = self.ctx.as_ref();
        let mut entered: Vec<(usize, Continuation)> = Vec::new();
        let mut next = 0;

        loop {
            while next < n && !event.is_stopped() {
                let stage = &self.stages[next];
                match stage.process(event, ctx).await {
                    Ok(StageFlow::Next) => {}
                    Ok(StageFlow::Wrap(cont)) => entered.push((next, cont)),
                    Err(e) => fail(stage.as_ref(), event, e),
                }
                next += 1;
            }

            let Some((idx, cont)) = entered.pop() else {
                break;
            };
            let stage = &self.stages[idx];
            next = n;
            match stage.resume(event, ctx, cont).await {
                Ok(StageFlow::Wrap(cont)) if !event.is_stopped() => {
                    entered.push((idx, cont));
                    next = idx + 1;
                }
                Ok(StageFlow::Wrap(_)) => {
                    debug!(stage = stage.name(), origin = %event.origin, "yield after stop ignored");
                }
                Ok(StageFlow::Next) => {}
                Err(e) => fail(stage.as_ref(), event, e),
            }
        }

        for stage in &self.stages {
            if let Err(e) = stage.finish(event, ctx).await {
                fail(stage.as_ref(), event, e);
            }
        }

        if let Some(reason) = event.stop_reason() {
            debug!(origin = %event.origin, reason = %reason, "event stopped");
        }
    }
}

fn fail(stage: &dyn Stage, event: &mut MessageEvent, e: Error) {
    error!(stage = stage.name(), origin = %event.origin, error = %e, "stage failed");
    event.stop(StopReason::StageFailed { stage: stage.name() });
}
