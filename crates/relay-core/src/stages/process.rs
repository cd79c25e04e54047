use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::{
    config::{ProcessConfig, ReplyMode},
    errors::Error,
    event::{MessageEvent, MessageResult, StopReason},
    logging::preview,
    model::{
        client::LlmProvider,
        types::{ChatTurn, LlmRequest, LlmResponse, ToolCall},
    },
    pipeline::{context::PipelineContext, Stage, StageFlow},
    registry::{
        dispatch, EventType, HandlerCtx, HandlerOutcome, HandlerPayload, HandlerSet, PluginFilter,
        Trigger,
    },
    Result,
};

/// Failure inside the LLM round trip. Hook errors fail the stage; provider
/// errors get the failure reply.
enum LlmError {
    Hook(Error),
    Provider(Error),
}

impl From<Error> for LlmError {
    fn from(e: Error) -> Self {
        LlmError::Hook(e)
    }
}

/// Routes the event to plugin handlers and, failing that, to the LLM.
pub struct ProcessStage {
    cfg: ProcessConfig,
    tool_filter: PluginFilter,
}

impl ProcessStage {
    pub fn new(cfg: ProcessConfig) -> Self {
        let tool_filter = PluginFilter::from_names(&cfg.tool_plugins);
        Self { cfg, tool_filter }
    }

    /// Fire matching `MessageReceived` handlers. Returns whether a command or
    /// regex handler matched.
    async fn dispatch_message(
        &self,
        handlers: &HandlerSet,
        event: &mut MessageEvent,
        ctx: &PipelineContext,
    ) -> Result<bool> {
        let command = event
            .command_body(&self.cfg.command_prefix)
            .map(str::to_string);
        let mut matched = false;
        for h in handlers.lookup(EventType::MessageReceived, &PluginFilter::All) {
            let Some(args) = h.trigger.matches(&event.text, command.as_deref()) else {
                continue;
            };
            if !matches!(h.trigger, Trigger::Any) {
                matched = true;
            }
            debug!(handler = %h.name, plugin = %h.owner_plugin, origin = %event.origin, "handler matched");

            let outcome = {
                let mut hctx = HandlerCtx::for_event(EventType::MessageReceived, event, ctx);
                hctx.args = args;
                h.callback.handle(&mut hctx).await?
            };
            if outcome == HandlerOutcome::Stop || event.is_stopped() {
                break;
            }
        }
        Ok(matched)
    }

    fn wants_llm(&self, event: &MessageEvent) -> bool {
        if !self.cfg.llm_enabled {
            return false;
        }
        if event.text.trim().is_empty() && event.image_refs.is_empty() {
            return false;
        }
        match self.cfg.reply_mode {
            ReplyMode::Active => true,
            ReplyMode::Addressed => event.is_at_or_wake,
            ReplyMode::Passive => false,
        }
    }

    /// One provider call. With streaming on, every chunk is handed to the
    /// `LlmChunk` hooks while the call is still running.
    async fn call(
        &self,
        handlers: &HandlerSet,
        llm: &dyn LlmProvider,
        req: LlmRequest,
        event: &mut MessageEvent,
        ctx: &PipelineContext,
    ) -> std::result::Result<LlmResponse, LlmError> {
        if !self.cfg.streaming {
            return llm.text_chat(req).await.map_err(LlmError::Provider);
        }

        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let produce = async move {
            let mut on_chunk = |chunk: &str| -> Result<()> {
                // The receiver only goes away after a hook failed.
                let _ = tx.send(chunk.to_string());
                Ok(())
            };
            llm.text_chat_stream(req, &mut on_chunk).await
        };
        let forward = async {
            let hooks = handlers.lookup(EventType::LlmChunk, &PluginFilter::All);
            let mut chunks = 0usize;
            while let Some(chunk) = rx.recv().await {
                chunks += 1;
                if hooks.is_empty() {
                    continue;
                }
                let mut hctx = HandlerCtx::for_event(EventType::LlmChunk, &mut *event, ctx)
                    .with_payload(HandlerPayload::LlmChunk(&chunk));
                dispatch(&hooks, &mut hctx).await?;
            }
            Ok::<usize, Error>(chunks)
        };

        let (resp, chunks) = tokio::join!(produce, forward);
        let chunks = chunks?;
        let resp = resp.map_err(LlmError::Provider)?;
        debug!(provider = llm.id(), chunks, "stream finished");
        Ok(resp)
    }

    /// Run the tool handlers for one round of calls; each output becomes a
    /// tool turn.
    async fn run_tools(
        &self,
        handlers: &HandlerSet,
        calls: &[ToolCall],
        event: &mut MessageEvent,
        ctx: &PipelineContext,
    ) -> Result<Vec<ChatTurn>> {
        let tools = handlers.lookup(EventType::ToolCall, &self.tool_filter);
        let mut turns = Vec::with_capacity(calls.len());

        for call in calls {
            let candidates: Vec<_> = tools
                .iter()
                .filter(|h| h.trigger.command_name() == Some(call.name.as_str()))
                .cloned()
                .collect();

            let mut output = None;
            if candidates.is_empty() {
                warn!(tool = %call.name, profile = %ctx.profile_name, "tool not available");
            } else {
                let mut hctx = HandlerCtx::for_event(EventType::ToolCall, event, ctx)
                    .with_payload(HandlerPayload::ToolCall {
                        call,
                        output: &mut output,
                    });
                dispatch(&candidates, &mut hctx).await?;
            }

            let output = output.unwrap_or_else(|| format!("tool {} is not available", call.name));
            turns.push(ChatTurn::tool(format!("{}: {}", call.name, output)));
        }
        Ok(turns)
    }

    async fn ask_llm(
        &self,
        handlers: &HandlerSet,
        llm: &Arc<dyn LlmProvider>,
        event: &mut MessageEvent,
        ctx: &PipelineContext,
    ) -> std::result::Result<(), LlmError> {
        let mut req = LlmRequest {
            prompt: event.text.clone(),
            session_id: event.session_id.clone(),
            image_refs: event.image_refs.clone(),
            contexts: ctx.conversations.contexts(&event.session_id),
            system_prompt: self.cfg.system_prompt.clone(),
        };
        {
            let hs = handlers.lookup(EventType::LlmRequest, &PluginFilter::All);
            let mut hctx = HandlerCtx::for_event(EventType::LlmRequest, event, ctx)
                .with_payload(HandlerPayload::LlmRequest(&mut req));
            dispatch(&hs, &mut hctx).await?;
        }
        if event.is_stopped() {
            return Ok(());
        }

        info!(
            provider = llm.id(),
            session = %event.session_id,
            prompt = %preview(&req.prompt, 80),
            "llm request"
        );
        let mut resp = self
            .call(handlers, llm.as_ref(), req.clone(), event, ctx)
            .await?;

        let mut history = req.contexts.clone();
        history.push(ChatTurn::user(req.prompt.clone()));
        let mut rounds = 0;
        while !resp.tool_calls.is_empty() && rounds < self.cfg.max_tool_rounds {
            rounds += 1;
            if !resp.text.trim().is_empty() {
                history.push(ChatTurn::assistant(resp.text.clone()));
            }
            let calls = std::mem::take(&mut resp.tool_calls);
            history.extend(self.run_tools(handlers, &calls, event, ctx).await?);

            let follow_up = LlmRequest {
                prompt: String::new(),
                contexts: history.clone(),
                image_refs: Vec::new(),
                ..req.clone()
            };
            resp = self
                .call(handlers, llm.as_ref(), follow_up, event, ctx)
                .await?;
        }
        if !resp.tool_calls.is_empty() {
            warn!(session = %event.session_id, rounds, "tool round limit reached");
        }

        {
            let hs = handlers.lookup(EventType::LlmResponse, &PluginFilter::All);
            let mut hctx = HandlerCtx::for_event(EventType::LlmResponse, event, ctx)
                .with_payload(HandlerPayload::LlmResponse(&mut resp));
            dispatch(&hs, &mut hctx).await?;
        }

        debug!(
            session = %event.session_id,
            input_tokens = resp.usage.input_tokens,
            output_tokens = resp.usage.output_tokens,
            "llm response"
        );
        ctx.conversations.record(
            &event.session_id,
            [
                ChatTurn::user(req.prompt),
                ChatTurn::assistant(resp.text.clone()),
            ],
        );
        if !resp.text.trim().is_empty() {
            event.set_result(MessageResult::text(resp.text));
        }
        Ok(())
    }
}

#[async_trait]
impl Stage for ProcessStage {
    fn name(&self) -> &'static str {
        "process"
    }

    async fn process(&self, event: &mut MessageEvent, ctx: &PipelineContext) -> Result<StageFlow> {
        // One snapshot for the whole event, even across a hot reload.
        let handlers = ctx.registry.snapshot();

        let matched = self.dispatch_message(&handlers, event, ctx).await?;
        if matched || event.is_stopped() || event.result.is_some() || !self.wants_llm(event) {
            return Ok(StageFlow::Next);
        }
        let Some(llm) = ctx.llm.as_ref() else {
            return Ok(StageFlow::Next);
        };

        match self.ask_llm(&handlers, llm, event, ctx).await {
            Ok(()) => {}
            Err(LlmError::Hook(e)) => return Err(e),
            Err(LlmError::Provider(e)) => {
                warn!(origin = %event.origin, provider = llm.id(), error = %e, "llm call failed");
                if event.is_at_or_wake {
                    event.set_result(MessageResult::text(self.cfg.failure_reply.clone()));
                } else {
                    event.stop(StopReason::Collaborator);
                }
            }
        }
        Ok(StageFlow::Next)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::{
        config::ProfileConfig,
        pipeline::context::{Collaborators, PipelineContext},
        registry::{handler_fn, HandlerMetadata},
        stages::testing,
        Error,
    };

    /// Scripted provider: pops one response per call, records requests.
    #[derive(Default)]
    struct ScriptedLlm {
        responses: Mutex<Vec<Result<LlmResponse>>>,
        requests: Mutex<Vec<LlmRequest>>,
    }

    impl ScriptedLlm {
        fn new(mut responses: Vec<Result<LlmResponse>>) -> Arc<Self> {
            responses.reverse();
            Arc::new(Self {
                responses: Mutex::new(responses),
                requests: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl LlmProvider for ScriptedLlm {
        fn id(&self) -> &str {
            "scripted"
        }

        async fn text_chat(&self, req: LlmRequest) -> Result<LlmResponse> {
            self.requests.lock().unwrap().push(req);
            self.responses
                .lock()
                .unwrap()
                .pop()
                .unwrap_or_else(|| Ok(LlmResponse::default()))
        }
    }

    fn text(s: &str) -> Result<LlmResponse> {
        Ok(LlmResponse {
            text: s.to_string(),
            ..LlmResponse::default()
        })
    }

    fn ctx_with_llm(profile: ProfileConfig, llm: Arc<ScriptedLlm>) -> PipelineContext {
        let (shared, _) = testing::shared();
        let shared: Collaborators = shared.with_llm(llm);
        PipelineContext::for_profile("test", profile, &shared)
    }

    fn stage(ctx: &PipelineContext) -> ProcessStage {
        ProcessStage::new(ctx.profile.process.clone())
    }

    #[tokio::test]
    async fn command_handler_replies_and_skips_llm() {
        let llm = ScriptedLlm::new(vec![text("from llm")]);
        let ctx = ctx_with_llm(ProfileConfig::default(), llm.clone());
        ctx.registry
            .register(
                HandlerMetadata::command(
                    "demo",
                    "ping",
                    handler_fn(|c| {
                        let args = c.args.join(",");
                        c.reply(format!("pong{args}"));
                        Ok(HandlerOutcome::Continue)
                    }),
                )
                .with_priority(10),
            )
            .unwrap();

        let mut ev = testing::direct("/ping a b");
        stage(&ctx).process(&mut ev, &ctx).await.unwrap();
        assert_eq!(ev.result, Some(MessageResult::text("ponga,b")));
        assert!(llm.requests.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn stop_outcome_halts_lower_priority_handlers() {
        let ctx = ctx_with_llm(ProfileConfig::default(), ScriptedLlm::new(vec![]));
        ctx.registry
            .register(
                HandlerMetadata::new(
                    "a",
                    "first",
                    EventType::MessageReceived,
                    handler_fn(|c| {
                        c.reply("first");
                        Ok(HandlerOutcome::Stop)
                    }),
                )
                .with_priority(5),
            )
            .unwrap();
        ctx.registry
            .register(HandlerMetadata::new(
                "b",
                "second",
                EventType::MessageReceived,
                handler_fn(|c| {
                    c.reply("second");
                    Ok(HandlerOutcome::Continue)
                }),
            ))
            .unwrap();

        let mut ev = testing::direct("anything");
        stage(&ctx).process(&mut ev, &ctx).await.unwrap();
        assert_eq!(ev.result.as_ref().unwrap().text, "first");
        assert!(!ev.is_stopped());
    }

    #[tokio::test]
    async fn llm_gets_history_and_request_hooks_apply() {
        let llm = ScriptedLlm::new(vec![text("one"), text("two")]);
        let mut profile = ProfileConfig::default();
        profile.process.system_prompt = Some("be brief".to_string());
        let ctx = ctx_with_llm(profile, llm.clone());
        ctx.registry
            .register(HandlerMetadata::new(
                "hook",
                "shout",
                EventType::LlmRequest,
                handler_fn(|c| {
                    if let HandlerPayload::LlmRequest(req) = &mut c.payload {
                        req.prompt = req.prompt.to_uppercase();
                    }
                    Ok(HandlerOutcome::Continue)
                }),
            ))
            .unwrap();

        let s = stage(&ctx);
        let mut ev = testing::direct("hi");
        s.process(&mut ev, &ctx).await.unwrap();
        assert_eq!(ev.result.as_ref().unwrap().text, "one");

        let mut ev = testing::direct("again");
        s.process(&mut ev, &ctx).await.unwrap();
        assert_eq!(ev.result.as_ref().unwrap().text, "two");

        let reqs = llm.requests.lock().unwrap();
        assert_eq!(reqs[0].prompt, "HI");
        assert_eq!(reqs[0].system_prompt.as_deref(), Some("be brief"));
        assert!(reqs[0].contexts.is_empty());
        assert_eq!(
            reqs[1].contexts.iter().map(|t| t.content.as_str()).collect::<Vec<_>>(),
            vec!["HI", "one"]
        );
    }

    #[tokio::test]
    async fn tool_calls_are_scoped_to_allowed_plugins() {
        let call = |name: &str| ToolCall {
            id: "1".to_string(),
            name: name.to_string(),
            arguments: serde_json::json!({ "q": "x" }),
        };
        let llm = ScriptedLlm::new(vec![
            Ok(LlmResponse {
                tool_calls: vec![call("calc"), call("web")],
                ..LlmResponse::default()
            }),
            text("done"),
        ]);
        let mut profile = ProfileConfig::default();
        profile.process.tool_plugins = vec!["math".to_string()];
        let ctx = ctx_with_llm(profile, llm.clone());

        let tool = |answer: &'static str| {
            handler_fn(move |c| {
                if let HandlerPayload::ToolCall { output, .. } = &mut c.payload {
                    **output = Some(answer.to_string());
                }
                Ok(HandlerOutcome::Continue)
            })
        };
        ctx.registry.register(HandlerMetadata::tool("math", "calc", tool("42"))).unwrap();
        ctx.registry.register(HandlerMetadata::tool("search", "web", tool("secret"))).unwrap();

        let mut ev = testing::direct("compute");
        stage(&ctx).process(&mut ev, &ctx).await.unwrap();
        assert_eq!(ev.result.unwrap().text, "done");

        let reqs = llm.requests.lock().unwrap();
        assert_eq!(reqs.len(), 2);
        let tool_turns: Vec<_> = reqs[1]
            .contexts
            .iter()
            .filter(|t| t.role == crate::model::types::Role::Tool)
            .map(|t| t.content.clone())
            .collect();
        assert_eq!(
            tool_turns,
            vec!["calc: 42".to_string(), "web: tool web is not available".to_string()]
        );
    }

    #[tokio::test]
    async fn llm_failure_depends_on_addressing() {
        let failing = || ScriptedLlm::new(vec![Err(Error::Collaborator("down".into()))]);
        let mut profile = ProfileConfig::default();
        profile.process.failure_reply = "oops".to_string();

        let ctx = ctx_with_llm(profile.clone(), failing());
        let mut ev = testing::group("hello");
        ev.is_at_or_wake = true;
        stage(&ctx).process(&mut ev, &ctx).await.unwrap();
        assert_eq!(ev.result.as_ref().unwrap().text, "oops");
        assert!(!ev.is_stopped());

        let ctx = ctx_with_llm(profile, failing());
        let mut ev = testing::group("hello");
        stage(&ctx).process(&mut ev, &ctx).await.unwrap();
        assert_eq!(ev.stop_reason(), Some(&StopReason::Collaborator));
        assert!(ev.result.is_none());
    }

    #[tokio::test]
    async fn reply_modes_gate_the_llm() {
        let llm = ScriptedLlm::new(vec![text("x"), text("y")]);
        let mut profile = ProfileConfig::default();
        profile.process.reply_mode = ReplyMode::Addressed;
        let ctx = ctx_with_llm(profile, llm.clone());

        let mut ev = testing::group("not for you");
        stage(&ctx).process(&mut ev, &ctx).await.unwrap();
        assert!(ev.result.is_none());

        let mut ev = testing::group("for you");
        ev.is_at_or_wake = true;
        stage(&ctx).process(&mut ev, &ctx).await.unwrap();
        assert_eq!(ev.result.unwrap().text, "x");

        let mut profile = ProfileConfig::default();
        profile.process.reply_mode = ReplyMode::Passive;
        let ctx = ctx_with_llm(profile, llm.clone());
        let mut ev = testing::direct("hi");
        ev.is_at_or_wake = true;
        stage(&ctx).process(&mut ev, &ctx).await.unwrap();
        assert!(ev.result.is_none());
        assert_eq!(llm.requests.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn handler_error_fails_the_stage() {
        let ctx = ctx_with_llm(ProfileConfig::default(), ScriptedLlm::new(vec![]));
        ctx.registry
            .register(HandlerMetadata::command(
                "p",
                "bad",
                handler_fn(|_| Err(Error::Collaborator("nope".into()))),
            ))
            .unwrap();
        let mut ev = testing::direct("/bad");
        assert!(stage(&ctx).process(&mut ev, &ctx).await.is_err());
    }

    #[tokio::test]
    async fn plain_word_matching_a_command_name_reaches_the_llm() {
        let llm = ScriptedLlm::new(vec![text("a poem")]);
        let ctx = ctx_with_llm(ProfileConfig::default(), llm.clone());
        ctx.registry
            .register(HandlerMetadata::command(
                "p",
                "help",
                handler_fn(|c| {
                    c.reply("usage");
                    Ok(HandlerOutcome::Continue)
                }),
            ))
            .unwrap();

        let mut ev = testing::direct("help me write a poem");
        stage(&ctx).process(&mut ev, &ctx).await.unwrap();
        assert_eq!(ev.result.unwrap().text, "a poem");
        assert_eq!(llm.requests.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn failing_request_hook_fails_the_stage() {
        let llm = ScriptedLlm::new(vec![text("never")]);
        let mut profile = ProfileConfig::default();
        profile.process.failure_reply = "oops".to_string();
        let ctx = ctx_with_llm(profile, llm.clone());
        ctx.registry
            .register(HandlerMetadata::new(
                "hook",
                "broken",
                EventType::LlmRequest,
                handler_fn(|_| Err(Error::Collaborator("hook broke".into()))),
            ))
            .unwrap();

        let mut ev = testing::direct("hi");
        ev.is_at_or_wake = true;
        let Err(err) = stage(&ctx).process(&mut ev, &ctx).await else {
            panic!("request hook error was swallowed");
        };
        assert!(err.to_string().contains("hook broke"));
        assert!(ev.result.is_none());
        assert!(llm.requests.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn streamed_chunks_reach_chunk_hooks() {
        let llm = ScriptedLlm::new(vec![text("streamed answer")]);
        let mut profile = ProfileConfig::default();
        profile.process.streaming = true;
        let ctx = ctx_with_llm(profile, llm);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        ctx.registry
            .register(HandlerMetadata::new(
                "hook",
                "typing",
                EventType::LlmChunk,
                handler_fn(move |c| {
                    if let HandlerPayload::LlmChunk(chunk) = &c.payload {
                        sink.lock().unwrap().push(chunk.to_string());
                    }
                    Ok(HandlerOutcome::Continue)
                }),
            ))
            .unwrap();

        let mut ev = testing::direct("hi");
        stage(&ctx).process(&mut ev, &ctx).await.unwrap();
        assert_eq!(ev.result.unwrap().text, "streamed answer");
        assert_eq!(*seen.lock().unwrap(), vec!["streamed answer".to_string()]);
    }
}
