//! Built-in pipeline stages, in their default order.

pub mod decorate;
pub mod process;
pub mod rate_limit;
pub mod respond;
pub mod safety;
pub mod session_status;
pub mod waking;
pub mod whitelist;

use std::sync::Arc;

use crate::{pipeline::context::PipelineContext, pipeline::Stage, Result};

pub use decorate::ResultDecorateStage;
pub use process::ProcessStage;
pub use rate_limit::RateLimitStage;
pub use respond::RespondStage;
pub use safety::ContentSafetyStage;
pub use session_status::SessionStatusStage;
pub use waking::WakingStage;
pub use whitelist::WhitelistStage;

/// Instantiate the stages enabled in `ctx.profile`. Disabled stages are left
/// out entirely, so indices only ever cover active stages.
pub fn build(ctx: &PipelineContext) -> Result<Vec<Arc<dyn Stage>>> {
    let p = &ctx.profile;
    let mut stages: Vec<Arc<dyn Stage>> = Vec::new();

    if p.whitelist.enabled {
        stages.push(Arc::new(WhitelistStage::new(p.whitelist.clone())));
    }
    if p.safety.enabled {
        stages.push(Arc::new(ContentSafetyStage::new(
            &p.safety,
            ctx.classifier.clone(),
        )?));
    }
    if p.rate_limit.enabled {
        stages.push(Arc::new(RateLimitStage::new(&p.rate_limit)));
    }
    if p.session.enabled {
        stages.push(Arc::new(SessionStatusStage));
    }
    if p.waking.enabled {
        stages.push(Arc::new(WakingStage::new(p.waking.clone())));
    }
    if p.process.enabled {
        stages.push(Arc::new(ProcessStage::new(p.process.clone())));
    }
    if p.decorate.enabled {
        stages.push(Arc::new(ResultDecorateStage::new(p.decorate.clone())));
    }
    if p.respond.enabled {
        stages.push(Arc::new(RespondStage));
    }

    Ok(stages)
}
