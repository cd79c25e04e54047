//! Commands every bot ships with.

use std::sync::{Arc, Weak};

use async_trait::async_trait;

use crate::{
    domain::SessionId,
    plugin::{Plugin, PluginHost},
    registry::{handler_fn, Handler, HandlerCtx, HandlerMetadata, HandlerOutcome},
    Result,
};

pub const BUILTIN_PLUGIN: &str = "builtin";

const ADMIN_ONLY: &str = "This command is for admins only.";

/// Built-in commands. `with_host` adds plugin management on top.
#[derive(Default)]
pub struct BuiltinPlugin {
    host: Weak<PluginHost>,
}

impl BuiltinPlugin {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_host(host: Weak<PluginHost>) -> Self {
        Self { host }
    }
}

#[async_trait]
impl Plugin for BuiltinPlugin {
    fn name(&self) -> &str {
        BUILTIN_PLUGIN
    }

    fn handlers(&self) -> Vec<HandlerMetadata> {
        vec![
            HandlerMetadata::command(BUILTIN_PLUGIN, "help", handler_fn(help))
                .with_description("list available commands"),
            HandlerMetadata::command(BUILTIN_PLUGIN, "sid", handler_fn(sid))
                .with_description("show this chat's origin and session id"),
            HandlerMetadata::command(BUILTIN_PLUGIN, "reset", handler_fn(reset))
                .with_description("forget the conversation history"),
            HandlerMetadata::command(BUILTIN_PLUGIN, "wl", handler_fn(|c| whitelist(c, true)))
                .with_description("(admin) whitelist this or the given session"),
            HandlerMetadata::command(BUILTIN_PLUGIN, "dwl", handler_fn(|c| whitelist(c, false)))
                .with_description("(admin) remove this or the given session from the whitelist"),
            HandlerMetadata::command(BUILTIN_PLUGIN, "on", handler_fn(|c| toggle(c, true)))
                .with_description("(admin) enable the bot in this or the given session"),
            HandlerMetadata::command(BUILTIN_PLUGIN, "off", handler_fn(|c| toggle(c, false)))
                .with_description("(admin) disable the bot in this or the given session"),
            HandlerMetadata::command(
                BUILTIN_PLUGIN,
                "plugins",
                Arc::new(PluginsCommand {
                    host: self.host.clone(),
                }),
            )
            .with_description("list plugins; (admin) enable, disable or reload them"),
        ]
    }
}

fn help(c: &mut HandlerCtx<'_>) -> Result<HandlerOutcome> {
    let Some(pipeline) = c.pipeline else {
        return Ok(HandlerOutcome::Continue);
    };
    let prefix = pipeline.profile.process.command_prefix.clone();
    let mut lines = vec!["Commands:".to_string()];
    for (_, command, description) in pipeline.registry.snapshot().commands() {
        if description.is_empty() {
            lines.push(format!("{prefix}{command}"));
        } else {
            lines.push(format!("{prefix}{command} - {description}"));
        }
    }
    c.reply(lines.join("\n"));
    Ok(HandlerOutcome::Stop)
}

fn sid(c: &mut HandlerCtx<'_>) -> Result<HandlerOutcome> {
    let Some(event) = c.event_mut() else {
        return Ok(HandlerOutcome::Continue);
    };
    let text = format!("origin: {}\nsession: {}", event.origin, event.session_id);
    c.reply(text);
    Ok(HandlerOutcome::Stop)
}

fn reset(c: &mut HandlerCtx<'_>) -> Result<HandlerOutcome> {
    let (Some(pipeline), Some(event)) = (c.pipeline, c.event.as_deref()) else {
        return Ok(HandlerOutcome::Continue);
    };
    pipeline.conversations.clear(&event.session_id);
    c.reply("Conversation history cleared.");
    Ok(HandlerOutcome::Stop)
}

fn whitelist(c: &mut HandlerCtx<'_>, allow: bool) -> Result<HandlerOutcome> {
    let (Some(pipeline), Some(event)) = (c.pipeline, c.event.as_deref()) else {
        return Ok(HandlerOutcome::Continue);
    };
    if !event.is_admin() {
        c.reply(ADMIN_ONLY);
        return Ok(HandlerOutcome::Stop);
    }

    let Some(target) = target_session(c) else {
        return Ok(HandlerOutcome::Continue);
    };
    pipeline.sessions.set_whitelisted(&target, allow);

    let reply = if allow {
        format!("{target} whitelisted.")
    } else {
        format!("{target} removed from the whitelist.")
    };
    c.reply(reply);
    Ok(HandlerOutcome::Stop)
}

/// Session from the first argument, or the event's own.
fn target_session(c: &HandlerCtx<'_>) -> Option<SessionId> {
    let event = c.event.as_deref()?;
    Some(
        c.args
            .first()
            .map(|s| SessionId(s.clone()))
            .unwrap_or_else(|| event.session_id.clone()),
    )
}

fn toggle(c: &mut HandlerCtx<'_>, enabled: bool) -> Result<HandlerOutcome> {
    let (Some(pipeline), Some(event)) = (c.pipeline, c.event.as_deref()) else {
        return Ok(HandlerOutcome::Continue);
    };
    if !event.is_admin() {
        c.reply(ADMIN_ONLY);
        return Ok(HandlerOutcome::Stop);
    }
    let Some(target) = target_session(c) else {
        return Ok(HandlerOutcome::Continue);
    };
    pipeline.sessions.set_enabled(&target, enabled);

    let state = if enabled { "enabled" } else { "disabled" };
    c.reply(format!("{target} {state}."));
    Ok(HandlerOutcome::Stop)
}

/// `/plugins [list|enable <name>|disable <name>|reload]`
struct PluginsCommand {
    host: Weak<PluginHost>,
}

impl PluginsCommand {
    async fn run(&self, host: &PluginHost, args: &[String], admin: bool) -> Result<String> {
        let action = args.first().map(String::as_str).unwrap_or("list");
        if action == "list" {
            let lines: Vec<String> = host
                .list()
                .await
                .into_iter()
                .map(|(name, enabled)| {
                    format!("{name} ({})", if enabled { "enabled" } else { "disabled" })
                })
                .collect();
            return Ok(format!("Plugins:\n{}", lines.join("\n")));
        }
        if !admin {
            return Ok(ADMIN_ONLY.to_string());
        }

        let name = args.get(1).map(String::as_str);
        let reply = match (action, name) {
            ("reload", _) => {
                host.reload_current().await?;
                "Plugins reloaded.".to_string()
            }
            ("enable", Some(name)) => {
                if host.enable(name).await? {
                    format!("{name} enabled.")
                } else {
                    format!("No plugin named {name}.")
                }
            }
            ("disable", Some(BUILTIN_PLUGIN)) => "The builtin plugin cannot be disabled.".to_string(),
            ("disable", Some(name)) => {
                if host.disable(name).await? {
                    format!("{name} disabled.")
                } else {
                    format!("No plugin named {name}.")
                }
            }
            _ => "Usage: plugins [list|enable <name>|disable <name>|reload]".to_string(),
        };
        Ok(reply)
    }
}

#[async_trait]
impl Handler for PluginsCommand {
    async fn handle(&self, c: &mut HandlerCtx<'_>) -> Result<HandlerOutcome> {
        let Some(admin) = c.event.as_deref().map(|e| e.is_admin()) else {
            return Ok(HandlerOutcome::Continue);
        };
        let reply = match self.host.upgrade() {
            Some(host) => self.run(&host, &c.args, admin).await?,
            None => "Plugin management is not available.".to_string(),
        };
        c.reply(reply);
        Ok(HandlerOutcome::Stop)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::ProfileConfig,
        event::MessageEvent,
        model::types::ChatTurn,
        pipeline::{PipelineContext, Stage},
        stages::{testing, ProcessStage},
    };

    async fn run(ctx: &PipelineContext, mut ev: MessageEvent) -> String {
        ProcessStage::new(ctx.profile.process.clone())
            .process(&mut ev, ctx)
            .await
            .unwrap();
        ev.result.map(|r| r.text).unwrap_or_default()
    }

    async fn ctx_and_host() -> (PipelineContext, Arc<PluginHost>) {
        let mut profile = ProfileConfig::default();
        profile.process.llm_enabled = false;
        let (ctx, _) = testing::ctx_with(profile);
        let host = Arc::new(PluginHost::new(ctx.registry.clone()));
        let builtin = BuiltinPlugin::with_host(Arc::downgrade(&host));
        host.load_all(vec![Arc::new(builtin) as Arc<dyn Plugin>])
            .await
            .unwrap();
        (ctx, host)
    }

    async fn ctx() -> PipelineContext {
        let mut profile = ProfileConfig::default();
        profile.process.llm_enabled = false;
        let (ctx, _) = testing::ctx_with(profile);
        PluginHost::new(ctx.registry.clone())
            .load_all(vec![Arc::new(BuiltinPlugin::new()) as Arc<dyn Plugin>])
            .await
            .unwrap();
        ctx
    }

    #[tokio::test]
    async fn help_lists_commands_with_prefix() {
        let ctx = ctx().await;
        let text = run(&ctx, testing::direct("/help")).await;
        assert!(text.starts_with("Commands:"));
        assert!(text.contains("/sid - show this chat's origin and session id"));
        assert!(text.contains("/wl"));
        assert!(text.contains("/plugins"));
    }

    #[tokio::test]
    async fn command_names_without_prefix_are_ignored() {
        let ctx = ctx().await;
        assert_eq!(run(&ctx, testing::direct("help me write a poem")).await, "");
        assert_eq!(run(&ctx, testing::direct("reset everything")).await, "");
    }

    #[tokio::test]
    async fn sid_reports_origin_and_session() {
        let ctx = ctx().await;
        let text = run(&ctx, testing::group("/sid")).await;
        assert_eq!(text, "origin: test:group:g1\nsession: test:group:g1");
    }

    #[tokio::test]
    async fn wl_requires_admin_and_targets_session() {
        let ctx = ctx().await;

        let text = run(&ctx, testing::group("/wl")).await;
        assert_eq!(text, ADMIN_ONLY);
        assert!(!ctx.sessions.is_whitelisted(&SessionId("test:group:g1".into())));

        run(&ctx, testing::admin(testing::group("/wl"))).await;
        assert!(ctx.sessions.is_whitelisted(&SessionId("test:group:g1".into())));

        run(&ctx, testing::admin(testing::direct("/wl test:group:other"))).await;
        assert!(ctx.sessions.is_whitelisted(&SessionId("test:group:other".into())));

        let text = run(&ctx, testing::admin(testing::direct("/dwl test:group:other"))).await;
        assert_eq!(text, "test:group:other removed from the whitelist.");
        assert!(!ctx.sessions.is_whitelisted(&SessionId("test:group:other".into())));
    }

    #[tokio::test]
    async fn on_and_off_toggle_sessions_for_admins() {
        let ctx = ctx().await;
        let here = SessionId("test:group:g1".into());

        assert_eq!(run(&ctx, testing::group("/off")).await, ADMIN_ONLY);
        assert!(ctx.sessions.is_enabled(&here));

        let text = run(&ctx, testing::admin(testing::group("/off"))).await;
        assert_eq!(text, "test:group:g1 disabled.");
        assert!(!ctx.sessions.is_enabled(&here));

        let text = run(&ctx, testing::admin(testing::direct("/on test:group:g1"))).await;
        assert_eq!(text, "test:group:g1 enabled.");
        assert!(ctx.sessions.is_enabled(&here));
    }

    #[tokio::test]
    async fn reset_clears_history() {
        let ctx = ctx().await;
        let ev = testing::direct("/reset");
        ctx.conversations.record(&ev.session_id, [ChatTurn::user("hi")]);
        run(&ctx, ev).await;
        assert!(ctx
            .conversations
            .contexts(&SessionId("test:direct:u1".into()))
            .is_empty());
    }

    #[tokio::test]
    async fn plugins_lists_for_everyone_and_manages_for_admins() {
        let (ctx, host) = ctx_and_host().await;

        let text = run(&ctx, testing::direct("/plugins")).await;
        assert_eq!(text, "Plugins:\nbuiltin (enabled)");
        assert_eq!(
            run(&ctx, testing::direct("/plugins reload")).await,
            ADMIN_ONLY
        );

        let text = run(&ctx, testing::admin(testing::direct("/plugins disable builtin"))).await;
        assert_eq!(text, "The builtin plugin cannot be disabled.");
        let text = run(&ctx, testing::admin(testing::direct("/plugins enable nope"))).await;
        assert_eq!(text, "No plugin named nope.");

        let text = run(&ctx, testing::admin(testing::direct("/plugins reload"))).await;
        assert_eq!(text, "Plugins reloaded.");
        assert_eq!(host.list().await, vec![("builtin".to_string(), true)]);
        assert!(run(&ctx, testing::direct("/help")).await.contains("/plugins"));
    }

    #[tokio::test]
    async fn plugins_without_a_host_says_so() {
        let ctx = ctx().await;
        let text = run(&ctx, testing::admin(testing::direct("/plugins list"))).await;
        assert_eq!(text, "Plugin management is not available.");
    }
}
