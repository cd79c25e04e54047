use async_trait::async_trait;

use crate::Result;

use super::types::{LlmRequest, LlmResponse};

/// Port for an LLM provider (OpenAI, Claude, local models, ...).
///
/// The pipeline treats every call as an opaque suspend point.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    fn id(&self) -> &str;

    async fn text_chat(&self, req: LlmRequest) -> Result<LlmResponse>;

    /// Streaming variant. `on_chunk` sees incremental text; the returned
    /// response carries the full text.
    ///
    /// Providers without streaming support deliver one chunk.
    async fn text_chat_stream(
        &self,
        req: LlmRequest,
        on_chunk: &mut (dyn for<'c> FnMut(&'c str) -> Result<()> + Send),
    ) -> Result<LlmResponse> {
        let resp = self.text_chat(req).await?;
        on_chunk(&resp.text)?;
        Ok(resp)
    }
}
