//! OpenAI-compatible chat completions provider.
//!
//! Works against any server speaking the `/chat/completions` dialect (OpenAI,
//! vLLM, Ollama's compatibility layer, ...).

use std::time::Duration;

use async_trait::async_trait;
use relay_core::{
    errors::Error,
    model::{
        client::LlmProvider,
        types::{ChatTurn, LlmRequest, LlmResponse, Role, TokenUsage, ToolCall},
    },
    Result,
};
use serde_json::{json, Value};
use tracing::debug;

#[derive(Clone, Debug)]
pub struct OpenAiProvider {
    api_key: String,
    base_url: String,
    model: String,
    http: reqwest::Client,
}

impl OpenAiProvider {
    pub fn new(
        api_key: impl Into<String>,
        base_url: impl Into<String>,
        model: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Collaborator(format!("openai client build error: {e}")))?;
        Ok(Self {
            api_key: api_key.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            http,
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    async fn post(&self, body: &Value) -> Result<reqwest::Response> {
        let resp = self
            .http
            .post(self.endpoint())
            .bearer_auth(&self.api_key)
            .json(body)
            .send()
            .await
            .map_err(|e| Error::Collaborator(format!("openai request error: {e}")))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::Collaborator(format!(
                "openai chat failed: {status} {}",
                body.chars().take(200).collect::<String>()
            )));
        }
        Ok(resp)
    }
}

fn role_name(role: Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        // Tool output is replayed as plain user-visible context.
        Role::Tool => "user",
    }
}

fn turn_message(turn: &ChatTurn) -> Value {
    let content = match turn.role {
        Role::Tool => format!("[tool result] {}", turn.content),
        _ => turn.content.clone(),
    };
    json!({ "role": role_name(turn.role), "content": content })
}

/// Build the request body for `req`.
pub fn build_body(model: &str, req: &LlmRequest, stream: bool) -> Value {
    let mut messages = Vec::new();
    if let Some(system) = req.system_prompt.as_deref().filter(|s| !s.trim().is_empty()) {
        messages.push(json!({ "role": "system", "content": system }));
    }
    messages.extend(req.contexts.iter().map(turn_message));

    if !req.prompt.is_empty() || !req.image_refs.is_empty() {
        if req.image_refs.is_empty() {
            messages.push(json!({ "role": "user", "content": req.prompt }));
        } else {
            let mut parts = vec![json!({ "type": "text", "text": req.prompt })];
            parts.extend(
                req.image_refs
                    .iter()
                    .map(|url| json!({ "type": "image_url", "image_url": { "url": url } })),
            );
            messages.push(json!({ "role": "user", "content": parts }));
        }
    }

    let mut body = json!({
        "model": model,
        "messages": messages,
        "user": req.session_id.as_str(),
    });
    if stream {
        body["stream"] = json!(true);
        body["stream_options"] = json!({ "include_usage": true });
    }
    body
}

fn parse_usage(v: &Value) -> TokenUsage {
    TokenUsage {
        input_tokens: v.get("prompt_tokens").and_then(Value::as_u64).unwrap_or(0),
        output_tokens: v.get("completion_tokens").and_then(Value::as_u64).unwrap_or(0),
    }
}

fn parse_tool_calls(v: Option<&Value>) -> Vec<ToolCall> {
    let Some(calls) = v.and_then(Value::as_array) else {
        return Vec::new();
    };
    calls
        .iter()
        .filter_map(|c| {
            let f = c.get("function")?;
            let name = f.get("name")?.as_str()?.to_string();
            let raw = f.get("arguments").and_then(Value::as_str).unwrap_or("{}");
            let arguments = serde_json::from_str(raw).unwrap_or_else(|_| json!({ "raw": raw }));
            Some(ToolCall {
                id: c.get("id").and_then(Value::as_str).unwrap_or_default().to_string(),
                name,
                arguments,
            })
        })
        .collect()
}

/// Parse a non-streaming chat completion.
pub fn parse_response(v: &Value) -> Result<LlmResponse> {
    let message = v
        .pointer("/choices/0/message")
        .ok_or_else(|| Error::Collaborator("openai response has no choices".to_string()))?;
    Ok(LlmResponse {
        text: message
            .get("content")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        usage: v.get("usage").map(parse_usage).unwrap_or_default(),
        tool_calls: parse_tool_calls(message.get("tool_calls")),
    })
}

/// Accumulates server-sent events from a streaming completion.
#[derive(Default)]
struct StreamState {
    buf: String,
    text: String,
    usage: TokenUsage,
    done: bool,
}

impl StreamState {
    /// Feed raw bytes; returns the text deltas completed by them.
    fn feed(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buf.push_str(&String::from_utf8_lossy(bytes));
        let mut deltas = Vec::new();
        while let Some(nl) = self.buf.find('\n') {
            let line: String = self.buf.drain(..=nl).collect();
            let Some(data) = line.trim().strip_prefix("data:") else {
                continue;
            };
            let data = data.trim();
            if data == "[DONE]" {
                self.done = true;
                continue;
            }
            let Ok(v) = serde_json::from_str::<Value>(data) else {
                continue;
            };
            if let Some(u) = v.get("usage").filter(|u| !u.is_null()) {
                self.usage = parse_usage(u);
            }
            if let Some(delta) = v
                .pointer("/choices/0/delta/content")
                .and_then(Value::as_str)
                .filter(|d| !d.is_empty())
            {
                self.text.push_str(delta);
                deltas.push(delta.to_string());
            }
        }
        deltas
    }
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    fn id(&self) -> &str {
        "openai"
    }

    async fn text_chat(&self, req: LlmRequest) -> Result<LlmResponse> {
        let body = build_body(&self.model, &req, false);
        let resp = self.post(&body).await?;
        let v: Value = resp
            .json()
            .await
            .map_err(|e| Error::Collaborator(format!("openai json error: {e}")))?;
        let out = parse_response(&v)?;
        debug!(
            model = %self.model,
            input_tokens = out.usage.input_tokens,
            output_tokens = out.usage.output_tokens,
            tool_calls = out.tool_calls.len(),
            "chat completion"
        );
        Ok(out)
    }

    async fn text_chat_stream(
        &self,
        req: LlmRequest,
        on_chunk: &mut (dyn for<'c> FnMut(&'c str) -> Result<()> + Send),
    ) -> Result<LlmResponse> {
        let body = build_body(&self.model, &req, true);
        let mut resp = self.post(&body).await?;
        let mut state = StreamState::default();

        while let Some(bytes) = resp
            .chunk()
            .await
            .map_err(|e| Error::Collaborator(format!("openai stream error: {e}")))?
        {
            for delta in state.feed(&bytes) {
                on_chunk(&delta)?;
            }
            if state.done {
                break;
            }
        }

        Ok(LlmResponse {
            text: state.text,
            usage: state.usage,
            tool_calls: Vec::new(),
        })
    }
}
