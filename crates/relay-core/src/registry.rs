//! Priority-ordered handler registry with snapshot-swap hot reload.
//!
//! Readers take an `Arc<HandlerSet>` snapshot and keep it for as long as they
//! need a consistent view; writers build a new set and swap the pointer. A
//! reader therefore sees either the old or the new set, never a mix.

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, RwLock},
};

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{
    event::{MessageEvent, MessageResult},
    model::types::{LlmRequest, LlmResponse, ToolCall},
    pipeline::context::PipelineContext,
    Error, Result,
};

/// What a handler subscribes to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    Loaded,
    PlatformLoaded,
    MessageReceived,
    LlmRequest,
    LlmResponse,
    /// Partial LLM output while a streaming call is in flight.
    LlmChunk,
    PreDecorate,
    ToolCall,
    PostSend,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Which messages a handler reacts to.
#[derive(Clone, Debug)]
pub enum Trigger {
    Any,
    /// First token after the command prefix. For `ToolCall`
    /// handlers this is the tool name.
    Command(String),
    Regex(Regex),
}

impl Trigger {
    pub fn regex(pattern: &str) -> Result<Self> {
        Ok(Self::Regex(Regex::new(pattern)?))
    }

    pub fn command_name(&self) -> Option<&str> {
        match self {
            Trigger::Command(name) => Some(name),
            _ => None,
        }
    }

    /// Match a message. `command` is the text after the command prefix, or
    /// `None` if the message is not a command; command triggers only ever
    /// look at it. On success returns the command arguments (empty for
    /// non-command triggers).
    pub fn matches(&self, text: &str, command: Option<&str>) -> Option<Vec<String>> {
        match self {
            Trigger::Any => Some(Vec::new()),
            Trigger::Regex(re) => re.is_match(text).then(Vec::new),
            Trigger::Command(name) => {
                let mut words = command?.split_whitespace();
                (words.next()? == name).then(|| words.map(str::to_string).collect())
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HandlerOutcome {
    #[default]
    Continue,
    /// Do not run lower-priority handlers for this event.
    Stop,
}

/// Event-specific data a handler may inspect or edit.
pub enum HandlerPayload<'a> {
    None,
    Plugin(&'a str),
    Platform(&'a str),
    LlmRequest(&'a mut LlmRequest),
    LlmResponse(&'a mut LlmResponse),
    LlmChunk(&'a str),
    ToolCall {
        call: &'a ToolCall,
        output: &'a mut Option<String>,
    },
}

/// Everything a handler invocation can see.
pub struct HandlerCtx<'a> {
    pub event_type: EventType,
    pub event: Option<&'a mut MessageEvent>,
    pub payload: HandlerPayload<'a>,
    pub args: Vec<String>,
    pub pipeline: Option<&'a PipelineContext>,
}

impl<'a> HandlerCtx<'a> {
    pub fn new(event_type: EventType) -> Self {
        Self {
            event_type,
            event: None,
            payload: HandlerPayload::None,
            args: Vec::new(),
            pipeline: None,
        }
    }

    pub fn for_event(
        event_type: EventType,
        event: &'a mut MessageEvent,
        pipeline: &'a PipelineContext,
    ) -> Self {
        Self {
            event_type,
            event: Some(event),
            payload: HandlerPayload::None,
            args: Vec::new(),
            pipeline: Some(pipeline),
        }
    }

    pub fn with_payload(mut self, payload: HandlerPayload<'a>) -> Self {
        self.payload = payload;
        self
    }

    pub fn event_mut(&mut self) -> Option<&mut MessageEvent> {
        self.event.as_deref_mut()
    }

    /// Set a plain text reply on the current event, if any.
    pub fn reply(&mut self, text: impl Into<String>) {
        if let Some(event) = self.event_mut() {
            event.set_result(MessageResult::text(text));
        }
    }
}

#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, ctx: &mut HandlerCtx<'_>) -> Result<HandlerOutcome>;
}

/// Adapter for synchronous closures.
pub struct FnHandler<F>(F);

pub fn handler_fn<F>(f: F) -> Arc<dyn Handler>
where
    F: Fn(&mut HandlerCtx<'_>) -> Result<HandlerOutcome> + Send + Sync + 'static,
{
    Arc::new(FnHandler(f))
}

#[async_trait]
impl<F> Handler for FnHandler<F>
where
    F: Fn(&mut HandlerCtx<'_>) -> Result<HandlerOutcome> + Send + Sync + 'static,
{
    async fn handle(&self, ctx: &mut HandlerCtx<'_>) -> Result<HandlerOutcome> {
        (self.0)(ctx)
    }
}

#[derive(Clone)]
pub struct HandlerMetadata {
    pub event_type: EventType,
    /// Higher runs first. Ties keep registration order.
    pub priority: i32,
    pub enabled: bool,
    pub owner_plugin: String,
    pub name: String,
    pub trigger: Trigger,
    pub description: String,
    pub callback: Arc<dyn Handler>,
}

impl fmt::Debug for HandlerMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerMetadata")
            .field("event_type", &self.event_type)
            .field("priority", &self.priority)
            .field("enabled", &self.enabled)
            .field("owner_plugin", &self.owner_plugin)
            .field("name", &self.name)
            .field("trigger", &self.trigger)
            .finish()
    }
}

impl HandlerMetadata {
    pub fn new(
        owner_plugin: impl Into<String>,
        name: impl Into<String>,
        event_type: EventType,
        callback: Arc<dyn Handler>,
    ) -> Self {
        Self {
            event_type,
            priority: 0,
            enabled: true,
            owner_plugin: owner_plugin.into(),
            name: name.into(),
            trigger: Trigger::Any,
            description: String::new(),
            callback,
        }
    }

    /// `MessageReceived` handler triggered by `command`.
    pub fn command(
        owner_plugin: impl Into<String>,
        command: impl Into<String>,
        callback: Arc<dyn Handler>,
    ) -> Self {
        let command = command.into();
        Self::new(owner_plugin, command.clone(), EventType::MessageReceived, callback)
            .with_trigger(Trigger::Command(command))
    }

    /// `ToolCall` handler for the tool called `tool`.
    pub fn tool(
        owner_plugin: impl Into<String>,
        tool: impl Into<String>,
        callback: Arc<dyn Handler>,
    ) -> Self {
        let tool = tool.into();
        Self::new(owner_plugin, tool.clone(), EventType::ToolCall, callback)
            .with_trigger(Trigger::Command(tool))
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_trigger(mut self, trigger: Trigger) -> Self {
        self.trigger = trigger;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    fn same_command(&self, other: &HandlerMetadata) -> bool {
        match (self.trigger.command_name(), other.trigger.command_name()) {
            (Some(a), Some(b)) => {
                a == b && self.owner_plugin == other.owner_plugin && self.event_type == other.event_type
            }
            _ => false,
        }
    }
}

/// Run `handlers` in order until one asks to stop. The first error aborts
/// the chain.
pub async fn dispatch(
    handlers: &[Arc<HandlerMetadata>],
    ctx: &mut HandlerCtx<'_>,
) -> Result<HandlerOutcome> {
    for h in handlers {
        debug!(handler = %h.name, plugin = %h.owner_plugin, event = %ctx.event_type, "dispatch");
        if h.callback.handle(ctx).await? == HandlerOutcome::Stop {
            return Ok(HandlerOutcome::Stop);
        }
    }
    Ok(HandlerOutcome::Continue)
}

/// Plugin scope for a lookup (`*` means every plugin).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PluginFilter {
    All,
    Only(Vec<String>),
}

impl PluginFilter {
    pub fn from_names(names: &[String]) -> Self {
        if names.iter().any(|n| n == "*") {
            PluginFilter::All
        } else {
            PluginFilter::Only(names.to_vec())
        }
    }

    pub fn allows(&self, plugin: &str) -> bool {
        match self {
            PluginFilter::All => true,
            PluginFilter::Only(names) => names.iter().any(|n| n == plugin),
        }
    }
}

/// Immutable view of every registered handler, grouped by event type.
#[derive(Clone, Default, Debug)]
pub struct HandlerSet {
    by_type: HashMap<EventType, Vec<Arc<HandlerMetadata>>>,
}

impl HandlerSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a set, rejecting duplicate (plugin, command) pairs.
    pub fn from_handlers(handlers: impl IntoIterator<Item = HandlerMetadata>) -> Result<Self> {
        let mut set = Self::new();
        for h in handlers {
            set.insert(h, false)?;
        }
        Ok(set)
    }

    fn insert(&mut self, meta: HandlerMetadata, replace: bool) -> Result<()> {
        let list = self.by_type.entry(meta.event_type).or_default();

        if let Some(pos) = list.iter().position(|h| h.same_command(&meta)) {
            if !replace {
                return Err(Error::DuplicateHandler {
                    plugin: meta.owner_plugin,
                    command: meta.trigger.command_name().unwrap_or_default().to_string(),
                });
            }
            list.remove(pos);
        }

        // After every handler with priority >= ours: descending and stable.
        let at = list
            .iter()
            .position(|h| h.priority < meta.priority)
            .unwrap_or(list.len());
        list.insert(at, Arc::new(meta));
        Ok(())
    }

    /// Enabled handlers for `event_type` within `filter`, in dispatch order.
    pub fn lookup(&self, event_type: EventType, filter: &PluginFilter) -> Vec<Arc<HandlerMetadata>> {
        self.by_type
            .get(&event_type)
            .map(|list| {
                list.iter()
                    .filter(|h| h.enabled && filter.allows(&h.owner_plugin))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.by_type.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn remove_plugin(&mut self, plugin: &str) -> usize {
        let before = self.len();
        for list in self.by_type.values_mut() {
            list.retain(|h| h.owner_plugin != plugin);
        }
        before - self.len()
    }

    fn set_plugin_enabled(&mut self, plugin: &str, enabled: bool) -> usize {
        let mut touched = 0;
        for list in self.by_type.values_mut() {
            for h in list.iter_mut().filter(|h| h.owner_plugin == plugin) {
                Arc::make_mut(h).enabled = enabled;
                touched += 1;
            }
        }
        touched
    }

    /// `(plugin, command, description)` for enabled message commands.
    pub fn commands(&self) -> Vec<(String, String, String)> {
        self.lookup(EventType::MessageReceived, &PluginFilter::All)
            .iter()
            .filter_map(|h| {
                h.trigger.command_name().map(|c| {
                    (h.owner_plugin.clone(), c.to_string(), h.description.clone())
                })
            })
            .collect()
    }
}

/// Shared registry. Cheap to read; writes copy-and-swap.
#[derive(Default)]
pub struct HandlerRegistry {
    current: RwLock<Arc<HandlerSet>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The current handler set. Hold on to it for a consistent view.
    pub fn snapshot(&self) -> Arc<HandlerSet> {
        self.current
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn update<T>(&self, f: impl FnOnce(&mut HandlerSet) -> Result<T>) -> Result<T> {
        let mut current = self.current.write().unwrap_or_else(|e| e.into_inner());
        let mut next = HandlerSet::clone(&current);
        let out = f(&mut next)?;
        *current = Arc::new(next);
        Ok(out)
    }

    pub fn register(&self, meta: HandlerMetadata) -> Result<()> {
        let label = format!("{}/{}", meta.owner_plugin, meta.name);
        let event_type = meta.event_type;
        self.update(|set| set.insert(meta, false))?;
        info!(handler = %label, event = %event_type, "handler registered");
        Ok(())
    }

    /// Register, replacing an existing handler for the same (plugin, command).
    pub fn register_or_replace(&self, meta: HandlerMetadata) -> Result<()> {
        self.update(|set| set.insert(meta, true))
    }

    /// Atomically replace the whole set. Returns the previous one.
    pub fn swap(&self, set: HandlerSet) -> Arc<HandlerSet> {
        let mut current = self.current.write().unwrap_or_else(|e| e.into_inner());
        std::mem::replace(&mut *current, Arc::new(set))
    }

    pub fn replace_all(&self, handlers: impl IntoIterator<Item = HandlerMetadata>) -> Result<()> {
        let set = HandlerSet::from_handlers(handlers)?;
        let count = set.len();
        self.swap(set);
        info!(handlers = count, "handler set swapped");
        Ok(())
    }

    pub fn unregister_plugin(&self, plugin: &str) -> usize {
        self.update(|set| Ok(set.remove_plugin(plugin))).unwrap_or(0)
    }

    pub fn set_plugin_enabled(&self, plugin: &str, enabled: bool) -> usize {
        self.update(|set| Ok(set.set_plugin_enabled(plugin, enabled)))
            .unwrap_or(0)
    }

    pub fn lookup(&self, event_type: EventType, filter: &PluginFilter) -> Vec<Arc<HandlerMetadata>> {
        self.snapshot().lookup(event_type, filter)
    }
}
